use std::ops::BitAnd;
use std::time::Duration;

/// What an [`ExitAfterPolicy`] threshold counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Seconds,
    Packets,
}

/// When a probe should stop. Combined policies must all be satisfied.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitAfterPolicy {
    value: f64,
    unit: Unit,
    others: Vec<ExitAfterPolicy>,
}

impl ExitAfterPolicy {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self {
            value,
            unit,
            others: Vec::new(),
        }
    }

    pub fn seconds(limit: Duration) -> Self {
        Self::new(limit.as_secs_f64(), Unit::Seconds)
    }

    pub fn packets(count: u64) -> Self {
        Self::new(count as f64, Unit::Packets)
    }

    /// Combine optional packet and time limits; `None` when neither is set.
    pub fn from_limits(packets: Option<u64>, time: Option<Duration>) -> Option<Self> {
        match (packets.map(Self::packets), time.map(Self::seconds)) {
            (Some(packets), Some(seconds)) => Some(packets & seconds),
            (packets, seconds) => packets.or(seconds),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Require `other` as well.
    pub fn and(mut self, other: ExitAfterPolicy) -> Self {
        self.others.push(other);
        self
    }

    fn poll_own(&self, elapsed: Duration, packets: u64) -> bool {
        match self.unit {
            Unit::Seconds => elapsed.as_secs_f64() >= self.value,
            Unit::Packets => packets as f64 >= self.value,
        }
    }

    /// True once every policy in the chain is satisfied.
    pub fn poll(&self, elapsed: Duration, packets: u64) -> bool {
        self.poll_own(elapsed, packets) && self.others.iter().all(|p| p.poll(elapsed, packets))
    }

    /// Whether any policy in the chain depends on elapsed time.
    pub fn has_time_limit(&self) -> bool {
        self.unit == Unit::Seconds || self.others.iter().any(ExitAfterPolicy::has_time_limit)
    }
}

impl BitAnd for ExitAfterPolicy {
    type Output = ExitAfterPolicy;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(rhs)
    }
}
