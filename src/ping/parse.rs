use thiserror::Error;

use super::{IcmpResponse, PingEvent, PingPreamble};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unrecognized line: {line:?}")]
    Unrecognized { line: String },

    #[error("missing {field} in {line:?}")]
    MissingField { field: &'static str, line: String },

    #[error("invalid {field} value {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("unsupported time unit {unit:?}")]
    UnsupportedUnit { unit: String },
}

/// Classify one output line.
///
/// Returns `Ok(None)` for blank and summary lines.
pub fn parse_line(line: &str) -> Result<Option<PingEvent>, ParseError> {
    let line = line.trim();

    if line.is_empty() || is_summary(line) {
        return Ok(None);
    }

    if let Some(rest) = line.strip_prefix("PING ") {
        return parse_preamble(rest, line).map(|p| Some(PingEvent::Preamble(p)));
    }

    if let Some(seq) = line
        .strip_prefix("Request timeout for icmp_seq ")
        .or_else(|| line.strip_prefix("no answer yet for icmp_seq="))
    {
        let icmp_seq = parse_field("icmp_seq", seq.trim())?;
        return Ok(Some(PingEvent::Response(IcmpResponse::lost(icmp_seq))));
    }

    // iputils reports unreachable destinations as `From <gw> icmp_seq=N ...`.
    if line.starts_with("From ") {
        let icmp_seq = line
            .split_whitespace()
            .find_map(|token| token.strip_prefix("icmp_seq="))
            .ok_or_else(|| missing("icmp_seq", line))?;
        let icmp_seq = parse_field("icmp_seq", icmp_seq)?;
        return Ok(Some(PingEvent::Response(IcmpResponse::lost(icmp_seq))));
    }

    if line.contains(" bytes from ") {
        return parse_reply(line).map(|r| Some(PingEvent::Response(r)));
    }

    Err(ParseError::Unrecognized {
        line: line.to_string(),
    })
}

fn is_summary(line: &str) -> bool {
    line.starts_with("---")
        || line.starts_with("round-trip")
        || line.starts_with("rtt ")
        || line.contains("packets transmitted")
}

fn missing(field: &'static str, line: &str) -> ParseError {
    ParseError::MissingField {
        field,
        line: line.to_string(),
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// `PING host (ip): 56 data bytes` or `PING host (ip) 56(84) bytes of data.`
fn parse_preamble(rest: &str, line: &str) -> Result<PingPreamble, ParseError> {
    let host = rest
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| missing("host", line))?;

    let head = rest.split(')').next().unwrap_or(rest);
    let ip = head
        .rfind('(')
        .map(|open| &head[open + 1..])
        .filter(|ip| !ip.is_empty())
        .unwrap_or(host);

    Ok(PingPreamble {
        host: host.to_string(),
        ip: ip.to_string(),
    })
}

/// `<size> bytes from <host>: icmp_seq=<n> ttl=<t> time=<v> <unit>`
///
/// The `key=value` fields are read from the end of the line, the
/// `<size> bytes from <host>` prefix from the start.
fn parse_reply(line: &str) -> Result<IcmpResponse, ParseError> {
    let split = line
        .find(" icmp_seq=")
        .or_else(|| line.find(" icmp_req="))
        .ok_or_else(|| missing("icmp_seq", line))?;
    let (prefix, fields) = line.split_at(split);

    let mut icmp_seq: Option<u64> = None;
    let mut ttl: Option<u32> = None;
    let mut time_ms: Option<f64> = None;
    let mut unit: Option<&str> = None;

    for token in fields.split_whitespace().rev() {
        let Some((key, value)) = token.split_once('=') else {
            unit = Some(token);
            continue;
        };

        match key {
            "icmp_seq" | "icmp_req" => icmp_seq = Some(parse_field("icmp_seq", value)?),
            "ttl" | "hlim" => ttl = Some(parse_field("ttl", value)?),
            "time" => {
                let raw: f64 = parse_field("time", value)?;
                time_ms = Some(to_ms(raw, unit.unwrap_or("ms"))?);
            }
            _ => {}
        }
        unit = None;
    }

    let prefix = prefix.trim_end_matches(|c: char| c == ':' || c == ',');
    let (size, host) = prefix
        .split_once(" bytes from ")
        .ok_or_else(|| missing("host", line))?;

    // `localhost (127.0.0.1)` reports the address in parentheses.
    let host = match host.split_once(" (") {
        Some((_, ip)) => ip.trim_end_matches(')'),
        None => host,
    };

    Ok(IcmpResponse {
        host: Some(host.trim().to_string()),
        time_ms: time_ms.ok_or_else(|| missing("time", line))?,
        icmp_seq: icmp_seq.ok_or_else(|| missing("icmp_seq", line))?,
        ttl: ttl.ok_or_else(|| missing("ttl", line))?,
        packet_size_bytes: Some(parse_field("packet size", size.trim())?),
    })
}

fn to_ms(value: f64, unit: &str) -> Result<f64, ParseError> {
    match unit {
        "ms" => Ok(value),
        "s" => Ok(value * 1000.0),
        "us" | "usec" => Ok(value / 1000.0),
        other => Err(ParseError::UnsupportedUnit {
            unit: other.to_string(),
        }),
    }
}
