pub mod parse;
pub mod policy;
pub mod probe;

use std::fmt;

use thiserror::Error;

pub use self::parse::{parse_line, ParseError};
pub use self::policy::{ExitAfterPolicy, Unit};
pub use self::probe::{PingProbe, Pinger};

/// Target resolution announced at the start of a ping run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingPreamble {
    /// The host as requested by the caller.
    pub host: String,
    /// The address ping resolved it to.
    pub ip: String,
}

/// One echo reply, or a lost one.
#[derive(Debug, Clone, PartialEq)]
pub struct IcmpResponse {
    /// Replying address. `None` for a lost packet.
    pub host: Option<String>,
    /// Round-trip time, `f64::INFINITY` for a lost packet.
    pub time_ms: f64,
    pub icmp_seq: u64,
    pub ttl: u32,
    pub packet_size_bytes: Option<u32>,
}

impl IcmpResponse {
    pub fn lost(icmp_seq: u64) -> Self {
        Self {
            host: None,
            time_ms: f64::INFINITY,
            icmp_seq,
            ttl: 0,
            packet_size_bytes: None,
        }
    }

    pub fn is_lost(&self) -> bool {
        self.host.is_none() || self.time_ms.is_infinite()
    }
}

impl fmt::Display for IcmpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) if !self.is_lost() => write!(
                f,
                "{} bytes from {host}: icmp_seq={} ttl={} time={:.3} ms",
                self.packet_size_bytes.unwrap_or(0),
                self.icmp_seq,
                self.ttl,
                self.time_ms,
            ),
            _ => write!(f, "lost icmp_seq={}", self.icmp_seq),
        }
    }
}

/// Items produced by a [`PingProbe`].
#[derive(Debug, Clone, PartialEq)]
pub enum PingEvent {
    Preamble(PingPreamble),
    Response(IcmpResponse),
}

#[derive(Error, Debug)]
pub enum PingError {
    #[error("spawning {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ping for {target} exited abnormally ({code:?})")]
    AbnormalExit { target: String, code: Option<i32> },

    #[error("reading ping output for {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Running loss statistics for one target.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossSummary {
    pub responses: u64,
    pub lost: u64,
}

impl LossSummary {
    pub fn record(&mut self, response: &IcmpResponse) {
        self.responses += 1;
        if response.is_lost() {
            self.lost += 1;
        }
    }

    /// Lost share of all responses in percent, 0 when nothing was seen.
    pub fn loss_percent(&self) -> f64 {
        if self.responses == 0 {
            return 0.0;
        }
        self.lost as f64 * 100.0 / self.responses as f64
    }
}
