pub mod codec;
pub mod error;
pub mod session;
pub mod state;
pub mod transport;

use std::time::{SystemTime, UNIX_EPOCH};

pub use self::codec::{MetricCodec, PickleCodec};
pub use self::error::{CodecError, ProtocolViolation, TransportError, ValidationError};
pub use self::session::{FlushPolicy, FrameSink, MetricSession};
pub use self::state::{ConnectionState, ConnectionStateMachine};
pub use self::transport::{ReliableTransport, TransportConfig};

/// Default port of carbon's pickle receiver.
pub const DEFAULT_PICKLE_PORT: u16 = 2004;

/// A single timestamped data point, with its namespace already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

/// Current wall-clock time in float seconds.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Check a namespace against `[A-Za-z0-9._-]*`.
pub fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    let valid = namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidNamespace {
            namespace: namespace.to_string(),
        })
    }
}

/// Check a metric name and value before buffering.
pub fn validate_metric(name: &str, value: f64) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ValidationError::WhitespaceInName {
            name: name.to_string(),
        });
    }
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue {
            name: name.to_string(),
            value,
        });
    }
    Ok(())
}

/// Replace characters that cannot appear in a namespace segment.
///
/// Dots are replaced too, so a hostname like `8.8.8.8` stays one segment.
pub fn sanitize_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Split `host[:port]` into its parts. IPv6 addresses must be bracketed.
pub fn parse_host(raw: &str, default_port: u16) -> Result<(String, u16), ValidationError> {
    let invalid = |reason| ValidationError::InvalidHost {
        host: raw.to_string(),
        reason,
    };

    if raw.is_empty() {
        return Err(invalid("empty host"));
    }

    let parse_port = |port: &str| -> Result<u16, ValidationError> {
        if port.is_empty() {
            return Ok(default_port);
        }
        port.parse::<u16>().map_err(|_| invalid("invalid port"))
    };

    if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 bracket"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = match tail {
            "" => default_port,
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| invalid("unexpected text after IPv6 address"))?;
                parse_port(port)?
            }
        };
        return Ok((host.to_string(), port));
    }

    match raw.matches(':').count() {
        0 => Ok((raw.to_string(), default_port)),
        1 => {
            let (host, port) = raw.split_once(':').ok_or_else(|| invalid("invalid host"))?;
            if host.is_empty() {
                return Err(invalid("empty host"));
            }
            Ok((host.to_string(), parse_port(port)?))
        }
        _ => Err(invalid("an IPv6 address must be enclosed in square brackets")),
    }
}
