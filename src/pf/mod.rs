pub mod aggregate;
pub mod parse;

use std::collections::BTreeMap;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, warn};

pub use self::aggregate::{aggregate, apply_parents, summarize_children};
pub use self::parse::{parse_metric, parse_queue, parse_queue_detailed, ParseError};

/// Metric name of the queue occupancy ratio.
pub const LOAD_FACTOR: &str = "queue_load_factor";

/// Renames applied to raw pfctl metric keys.
pub static METRIC_ALIASES: &[(&str, &str)] = &[("qlength", LOAD_FACTOR)];

/// Look up the alias for a raw metric key, if any.
pub fn alias(key: &str) -> Option<&'static str> {
    METRIC_ALIASES
        .iter()
        .find(|(raw, _)| *raw == key)
        .map(|(_, alias)| *alias)
}

/// One pf queue and its counters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueMetrics {
    pub name: String,
    /// Child queue names in declaration order.
    pub children: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    /// Owning queue, filled in by [`apply_parents`].
    pub parent: Option<String>,
}

impl QueueMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// All queues of one poll, keyed by name.
pub type QueueForest = BTreeMap<String, QueueMetrics>;

/// Failures of the pf source.
#[derive(Error, Debug)]
pub enum PfError {
    #[error("queue status command is empty")]
    EmptyCommand,

    #[error("spawning {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command:?} exited abnormally ({code:?}): {stderr}")]
    AbnormalExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("queue {child:?} is claimed by both {first:?} and {second:?}")]
    DuplicateParent {
        child: String,
        first: String,
        second: String,
    },

    #[error("queue hierarchy contains a cycle through {queue:?}")]
    Cycle { queue: String },
}

/// Result of one queue-status poll.
#[derive(Debug, Clone, Default)]
pub struct PfReading {
    pub queues: QueueForest,
    /// Lines skipped because they could not be parsed.
    pub parse_errors: usize,
}

/// Runs the queue-status command and turns its output into an aggregated forest.
#[derive(Debug, Clone)]
pub struct PfctlSource {
    command: String,
}

impl PfctlSource {
    pub const DEFAULT_COMMAND: &'static str = "pfctl -s queue -v";

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn read(&self) -> Result<PfReading, PfError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(PfError::EmptyCommand)?;

        let output = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| PfError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        debug!(
            command = %self.command,
            bytes = output.stdout.len(),
            "read queue status",
        );

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            error!(command = %self.command, stderr = %stderr, "queue status command wrote to stderr");
        }

        if !output.status.success() {
            return Err(PfError::AbnormalExit {
                command: self.command.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let (mut queues, errors) = parse_queue_detailed(&text);
        for e in &errors {
            warn!(error = %e, "skipping queue status line");
        }

        aggregate(&mut queues)?;

        Ok(PfReading {
            queues,
            parse_errors: errors.len(),
        })
    }
}

impl Default for PfctlSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COMMAND)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const TWO_LEAVES: &str = "\
queue root on ext0 bandwidth 1Mb {a, b}
  [ pkts:          0  bytes:          0  dropped pkts:      0 bytes:      0 ]
  [ qlength:   0/ 50 ]
queue  a on ext0 bandwidth 500Kb
  [ pkts:          5  bytes:        100  dropped pkts:      1 bytes:     10 ]
  [ qlength:  25/ 50 ]
queue  b on ext0 bandwidth 500Kb
  [ pkts:          5  bytes:        300  dropped pkts:      0 bytes:      0 ]
  [ qlength:   0/ 50 ]
";

    #[test]
    fn test_alias_table() {
        assert_eq!(alias("qlength"), Some(LOAD_FACTOR));
        assert_eq!(alias("pkts"), None);
    }

    #[tokio::test]
    async fn test_read_parses_and_aggregates_command_output() {
        let mut fixture = tempfile::NamedTempFile::new().expect("tempfile");
        fixture
            .write_all(TWO_LEAVES.as_bytes())
            .expect("write fixture");

        let source = PfctlSource::new(format!("cat {}", fixture.path().display()));
        let reading = source.read().await.expect("read");

        assert_eq!(reading.parse_errors, 0);
        let root = &reading.queues["root"];
        assert_eq!(root.metrics["pkts"], 10.0);
        assert_eq!(root.metrics["pkts_bytes"], 400.0);
        assert_eq!(root.metrics["dropped_pkts"], 1.0);
        assert_eq!(root.metrics[LOAD_FACTOR], 0.25);
        assert_eq!(reading.queues["a"].parent.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn test_read_reports_abnormal_exit() {
        let err = PfctlSource::new("false").read().await.expect_err("non-zero exit");
        assert!(matches!(err, PfError::AbnormalExit { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_read_reports_spawn_failure() {
        let err = PfctlSource::new("/nonexistent/pfctl -s queue")
            .read()
            .await
            .expect_err("missing binary");
        assert!(matches!(err, PfError::Spawn { .. }));

        let err = PfctlSource::new("   ").read().await.expect_err("empty");
        assert!(matches!(err, PfError::EmptyCommand));
    }
}
