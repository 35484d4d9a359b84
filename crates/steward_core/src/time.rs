//! Time types for Steward.
//!
//! Ordering decisions use logical time only. Wall clock time seeds member
//! incarnations and nothing else.

use crate::id::MemberId;
use serde::{Deserialize, Serialize};

/// Logical time - monotonically increasing counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// Create a new logical time at zero
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create incremented time
    #[must_use]
    pub fn incremented(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for LogicalTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A write stamp: logical time paired with the writer.
///
/// Stamps are totally ordered. Two members never produce equal stamps because the
/// member id is part of the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    /// Lamport time of the write
    pub time: LogicalTime,
    /// Member that performed the write
    pub member: MemberId,
}

impl Stamp {
    /// Create a new stamp
    #[must_use]
    pub const fn new(time: LogicalTime, member: MemberId) -> Self {
        Self { time, member }
    }
}

impl std::fmt::Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.time, self.member.short())
    }
}

/// Lamport clock owned by one member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LamportClock {
    now: LogicalTime,
}

impl LamportClock {
    /// Create a clock at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock that starts at `floor`. A restarted member seeds it from
    /// its incarnation so its stamps outrank those of its previous life.
    #[must_use]
    pub fn starting_at(floor: LogicalTime) -> Self {
        Self { now: floor }
    }

    /// Current value without advancing
    #[must_use]
    pub fn now(&self) -> LogicalTime {
        self.now
    }

    /// Advance for a local write and return the new time
    pub fn tick(&mut self) -> LogicalTime {
        self.now = self.now.incremented();
        self.now
    }

    /// Fold in a time observed from a peer
    pub fn observe(&mut self, seen: LogicalTime) {
        if seen > self.now {
            self.now = seen;
        }
    }
}

/// Wall clock timestamp - for metadata only, not for ordering logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanos: u32,
}

impl Timestamp {
    /// Current wall clock time
    #[must_use]
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs(),
            nanos: elapsed.subsec_nanos(),
        }
    }

    /// Milliseconds since the Unix epoch
    #[must_use]
    pub fn as_millis(&self) -> u64 {
        self.seconds * 1000 + u64::from(self.nanos / 1_000_000)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_time_order() {
        let t = LogicalTime::zero();
        assert!(t.incremented() > t);
        assert_eq!(LogicalTime::from(5).as_u64(), 5);
        assert_eq!(format!("{}", LogicalTime::from_raw(3)), "T3");
    }

    #[test]
    fn test_stamp_order_breaks_ties_by_member() {
        let a = MemberId::from_bytes([1; 16]);
        let b = MemberId::from_bytes([2; 16]);
        let t = LogicalTime::from_raw(7);
        assert!(Stamp::new(t, a) < Stamp::new(t, b));
        assert!(Stamp::new(t.incremented(), a) > Stamp::new(t, b));
    }

    #[test]
    fn test_lamport_clock() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), LogicalTime::from_raw(1));
        clock.observe(LogicalTime::from_raw(10));
        assert_eq!(clock.tick(), LogicalTime::from_raw(11));
        clock.observe(LogicalTime::from_raw(3));
        assert_eq!(clock.now(), LogicalTime::from_raw(11));
    }

    #[test]
    fn test_clock_starting_at_floor() {
        let mut clock = LamportClock::starting_at(LogicalTime::from_raw(500));
        assert_eq!(clock.tick(), LogicalTime::from_raw(501));
        clock.observe(LogicalTime::from_raw(200));
        assert_eq!(clock.now(), LogicalTime::from_raw(501));
    }

    #[test]
    fn test_timestamp_now_is_after_epoch() {
        let ts = Timestamp::now();
        assert!(ts.as_millis() > 0);
    }
}
