//! Line parser for `pfctl -s queue -v` output.
//!
//! Two line shapes matter: queue headers (`queue <name> ... {c1, c2}`) and
//! bracketed counter lines (`[ pkts: 10  bytes: 200 ]`) that belong to the
//! most recent header. Everything else is reported and skipped.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{alias, QueueForest, QueueMetrics};

/// A queue-status line that could not be used.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unrecognized line: {line:?}")]
    UnrecognizedLine { line: String },

    #[error("metric line before any queue header: {line:?}")]
    OrphanMetrics { line: String },

    #[error("queue header without a name: {line:?}")]
    MissingQueueName { line: String },

    #[error("metric {key:?} has no value")]
    MissingValue { key: String },

    #[error("metric {key:?} has unparseable value {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Parse one bracketed counter line into `(metric, value)` pairs.
///
/// Words before a `key:` token form the key, joined with `_`. A `bytes` key
/// directly after a `*pkts` key becomes `<pkts key>_bytes`. Ratios `a/b`
/// (with or without a space after the slash) become `a / b`.
pub fn parse_metric(line: &str) -> Result<BTreeMap<String, f64>, ParseError> {
    let inner = line.trim();
    let inner = inner.strip_prefix('[').unwrap_or(inner);
    let inner = inner.strip_suffix(']').unwrap_or(inner);

    let mut values = BTreeMap::new();
    let mut words: Vec<&str> = Vec::new();
    let mut previous_key: Option<String> = None;
    let mut tokens = inner.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        let Some(word) = token.strip_suffix(':') else {
            words.push(token);
            continue;
        };
        if !word.is_empty() {
            words.push(word);
        }

        let mut key = words.join("_");
        words.clear();

        if key == "bytes" {
            if let Some(prev) = previous_key.as_deref().filter(|k| k.ends_with("pkts")) {
                key = format!("{prev}_bytes");
            }
        }
        if let Some(aliased) = alias(&key) {
            key = aliased.to_string();
        }

        let mut raw = match tokens.next() {
            Some(value) => value.to_string(),
            None => return Err(ParseError::MissingValue { key }),
        };
        if raw.ends_with('/') {
            if let Some(denominator) = tokens.next() {
                raw.push_str(denominator);
            }
        }

        let value = parse_value(&raw).ok_or_else(|| ParseError::InvalidValue {
            key: key.clone(),
            value: raw.clone(),
        })?;

        values.insert(key.clone(), value);
        previous_key = Some(key);
    }

    Ok(values)
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((numerator, denominator)) => {
            let numerator: f64 = numerator.trim().parse().ok()?;
            let denominator: f64 = denominator.trim().parse().ok()?;
            (denominator != 0.0).then(|| numerator / denominator)
        }
        None => raw.parse().ok().filter(|v: &f64| v.is_finite()),
    }
}

/// Header fields of a `queue ...` line.
struct Header {
    name: String,
    children: Vec<String>,
    parent: Option<String>,
}

fn parse_header(rest: &str) -> Option<Header> {
    let (body, children) = match (rest.rfind('{'), rest.trim_end().strip_suffix('}')) {
        (Some(open), Some(_)) => {
            let close = rest.rfind('}').unwrap_or(rest.len());
            let children = rest[open + 1..close]
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            (&rest[..open], children)
        }
        _ => (rest, Vec::new()),
    };

    let mut words = body.split_whitespace();
    let name = words.next()?.to_string();

    // Newer pfctl declares the hierarchy as `queue child parent root ...`.
    let mut parent = None;
    while let Some(word) = words.next() {
        if word == "parent" {
            parent = words.next().map(str::to_string);
        }
    }

    Some(Header {
        name,
        children,
        parent,
    })
}

/// Parse queue-status text, logging and skipping lines that fail.
pub fn parse_queue(text: &str) -> QueueForest {
    let (queues, errors) = parse_queue_detailed(text);
    for e in &errors {
        tracing::warn!(error = %e, "skipping queue status line");
    }
    queues
}

/// Parse queue-status text, returning every skipped line's error alongside.
pub fn parse_queue_detailed(text: &str) -> (QueueForest, Vec<ParseError>) {
    let mut queues = QueueForest::new();
    let mut declared_parents: Vec<(String, String)> = Vec::new();
    let mut errors = Vec::new();
    let mut current: Option<String> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("queue ") {
            let Some(header) = parse_header(rest) else {
                errors.push(ParseError::MissingQueueName {
                    line: line.to_string(),
                });
                current = None;
                continue;
            };

            if let Some(parent) = header.parent {
                declared_parents.push((parent, header.name.clone()));
            }

            let mut queue = QueueMetrics::new(header.name.clone());
            queue.children = header.children;
            queues.insert(header.name.clone(), queue);
            current = Some(header.name);
            continue;
        }

        if line.starts_with('[') {
            let Some(queue) = current.as_ref().and_then(|name| queues.get_mut(name)) else {
                errors.push(ParseError::OrphanMetrics {
                    line: line.to_string(),
                });
                continue;
            };

            match parse_metric(line) {
                Ok(values) => queue.metrics.extend(values),
                Err(e) => errors.push(e),
            }
            continue;
        }

        errors.push(ParseError::UnrecognizedLine {
            line: line.to_string(),
        });
    }

    for (parent, child) in declared_parents {
        if let Some(queue) = queues.get_mut(&parent) {
            if !queue.children.contains(&child) {
                queue.children.push(child);
            }
        }
    }

    (queues, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pf::LOAD_FACTOR;

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_parse_metric_counters() {
        let values = parse_metric(
            "[ pkts:        822  bytes:     115520  dropped pkts:      0 bytes:      0 ]",
        )
        .expect("valid line");

        assert_eq!(
            values,
            metrics(&[
                ("pkts", 822.0),
                ("pkts_bytes", 115520.0),
                ("dropped_pkts", 0.0),
                ("dropped_pkts_bytes", 0.0),
            ])
        );
    }

    #[test]
    fn test_parse_metric_ratio() {
        assert_eq!(
            parse_metric("[ qlength:   1/500 ]").expect("valid"),
            metrics(&[(LOAD_FACTOR, 0.002)])
        );
        assert_eq!(
            parse_metric("[ qlength:   1/ 50 ]").expect("valid"),
            metrics(&[(LOAD_FACTOR, 0.02)])
        );
    }

    #[test]
    fn test_parse_metric_other_keys() {
        assert_eq!(
            parse_metric("[ borrows: 3  suspends: 4 ]").expect("valid"),
            metrics(&[("borrows", 3.0), ("suspends", 4.0)])
        );
    }

    #[test]
    fn test_parse_metric_errors() {
        assert_eq!(
            parse_metric("[ pkts: lots ]"),
            Err(ParseError::InvalidValue {
                key: "pkts".to_string(),
                value: "lots".to_string(),
            })
        );
        assert_eq!(
            parse_metric("[ pkts: ]"),
            Err(ParseError::MissingValue {
                key: "pkts".to_string(),
            })
        );
        assert!(parse_metric("[ qlength: 1/0 ]").is_err());
    }

    #[test]
    fn test_parse_queue_root_header() {
        let text = "\
queue root on ext0 bandwidth 600Kb priority 0 {a, b}
  [ pkts: 10  bytes: 200  dropped pkts: 0 bytes: 0 ]
  [ qlength: 1/50 ]
";
        let (queues, errors) = parse_queue_detailed(text);
        assert!(errors.is_empty());
        assert_eq!(queues.len(), 1);

        let root = &queues["root"];
        assert_eq!(root.name, "root");
        assert_eq!(root.children, vec!["a", "b"]);
        assert_eq!(root.parent, None);
        assert_eq!(
            root.metrics,
            metrics(&[
                ("pkts", 10.0),
                ("pkts_bytes", 200.0),
                ("dropped_pkts", 0.0),
                ("dropped_pkts_bytes", 0.0),
                (LOAD_FACTOR, 0.02),
            ])
        );
    }

    #[test]
    fn test_parse_queue_many_children() {
        let text = "queue root_ext0 on ext0 bandwidth 600Kb priority 0 {services, game_upload, web_upload, ssh_upload, bulk_upload, ack, domain_upload, torrent}\n  [ qlength:   0/ 50 ]\n";
        let queues = parse_queue(text);
        let root = &queues["root_ext0"];
        assert_eq!(root.children.len(), 8);
        assert_eq!(root.children[0], "services");
        assert_eq!(root.children[7], "torrent");
        assert_eq!(root.metrics[LOAD_FACTOR], 0.0);
    }

    #[test]
    fn test_parse_queue_leaf_without_braces() {
        let queues = parse_queue("queue  ssh on ext0 bandwidth 10Kb priority 7\n[ pkts: 1 ]\n");
        assert!(queues["ssh"].is_leaf());
        assert_eq!(queues["ssh"].metrics["pkts"], 1.0);
    }

    #[test]
    fn test_parse_queue_parent_keyword() {
        let text = "\
queue std on em0 bandwidth 100M qlimit 50
queue ssh parent std bandwidth 10M
queue web parent std bandwidth 50M default
";
        let queues = parse_queue(text);
        assert_eq!(queues["std"].children, vec!["ssh", "web"]);
        assert!(queues["ssh"].is_leaf());
    }

    #[test]
    fn test_parse_queue_skips_bad_lines() {
        let text = "\
[ pkts: 1 ]
No ALTQ support in kernel
queue q on em0
[ pkts: many ]
[ pkts: 3 ]
";
        let (queues, errors) = parse_queue_detailed(text);
        assert_eq!(queues["q"].metrics["pkts"], 3.0);
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], ParseError::OrphanMetrics { .. }));
        assert!(matches!(errors[1], ParseError::UnrecognizedLine { .. }));
        assert!(matches!(errors[2], ParseError::InvalidValue { .. }));
    }
}
