#[cfg(target_os = "linux")]
use anyhow::Context;
use anyhow::Result;
#[cfg(target_os = "linux")]
use tracing::debug;

#[cfg(target_os = "linux")]
use crate::graphite::now_seconds;

/// One interface's counters at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// 1-based position of the interface in the OS listing.
    pub ordinal: u32,
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Source of interface samples.
pub trait InterfaceSampler: Send + Sync {
    /// Sample the named interfaces, or every interface when `interfaces` is empty.
    fn sample(&self, interfaces: &[String]) -> Result<Vec<Sample>>;
}

/// Reads `/proc/net/dev`.
#[derive(Debug, Clone)]
pub struct ProcNetDevSampler {
    path: String,
}

impl ProcNetDevSampler {
    pub const DEFAULT_PATH: &'static str = "/proc/net/dev";

    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcNetDevSampler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl InterfaceSampler for ProcNetDevSampler {
    #[cfg(target_os = "linux")]
    fn sample(&self, interfaces: &[String]) -> Result<Vec<Sample>> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path))?;
        let samples = parse_proc_net_dev(&text, now_seconds(), interfaces);
        debug!(count = samples.len(), "sampled interfaces");
        Ok(samples)
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self, _interfaces: &[String]) -> Result<Vec<Sample>> {
        anyhow::bail!("cannot read {}: interface sampling is only supported on Linux", self.path)
    }
}

/// Parse `/proc/net/dev` content. The two header lines are skipped; malformed
/// rows are ignored.
pub fn parse_proc_net_dev(text: &str, timestamp: f64, interfaces: &[String]) -> Vec<Sample> {
    text.lines()
        .skip(2)
        .enumerate()
        .filter_map(|(index, line)| {
            let (name, counters) = line.split_once(':')?;
            let name = name.trim();
            if !interfaces.is_empty() && !interfaces.iter().any(|i| i == name) {
                return None;
            }

            // Receive has 8 columns, transmit starts at the 9th.
            let fields: Vec<u64> = counters
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .ok()?;

            Some(Sample {
                ordinal: u32::try_from(index + 1).ok()?,
                name: name.to_string(),
                rx_bytes: *fields.first()?,
                tx_bytes: *fields.get(8)?,
                timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543    5000    0    3    0     0          0        12  1234567    4000    0    0    0     0       0          0
  bad0: garbage
";

    #[test]
    fn test_parse_all_interfaces() {
        let samples = parse_proc_net_dev(PROC_NET_DEV, 42.0, &[]);
        assert_eq!(
            samples,
            vec![
                Sample {
                    ordinal: 1,
                    name: "lo".to_string(),
                    rx_bytes: 123456,
                    tx_bytes: 123456,
                    timestamp: 42.0,
                },
                Sample {
                    ordinal: 2,
                    name: "eth0".to_string(),
                    rx_bytes: 9876543,
                    tx_bytes: 1234567,
                    timestamp: 42.0,
                },
            ]
        );
    }

    #[test]
    fn test_parse_filters_interfaces() {
        let samples = parse_proc_net_dev(PROC_NET_DEV, 1.0, &["eth0".to_string()]);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "eth0");
        assert_eq!(samples[0].ordinal, 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sampler_reads_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(PROC_NET_DEV.as_bytes()).expect("write");

        let sampler = ProcNetDevSampler::new(file.path().display().to_string());
        let samples = sampler.sample(&[]).expect("sample");
        assert_eq!(samples.len(), 2);
        assert!(samples[0].timestamp > 0.0);

        let missing = ProcNetDevSampler::new("/nonexistent/net/dev");
        assert!(missing.sample(&[]).is_err());
    }
}
