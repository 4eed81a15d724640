//! Validated domain types shared across the crate
//!
//! Bounded values are modelled as validated newtypes to prevent primitive
//! obsession: a `ChannelCapacity` of zero or a priority of 200 is
//! unrepresentable instead of being a runtime surprise.

use nutype::nutype;

/// Capacity of a bounded subscription or pipe queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum restart attempts for a failed agent
#[nutype(
    validate(less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Delay between agent restart attempts, in seconds
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 3600.0),
    derive(
        Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Display, Default,
        TryFrom, Into
    ),
    default = 1.0
)]
pub struct RetryDelaySecs(f64);

impl RetryDelaySecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.into_inner())
    }
}

/// Time allowed for an agent to reach `Ready` during cell startup, in seconds
#[nutype(
    validate(finite, greater = 0.0, less_or_equal = 3600.0),
    derive(
        Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Display, Default,
        TryFrom, Into
    ),
    default = 30.0
)]
pub struct StartupTimeoutSecs(f64);

impl StartupTimeoutSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.into_inner())
    }
}

/// Time allowed for an agent to drain and clean up during shutdown, in seconds
#[nutype(
    validate(finite, greater = 0.0, less_or_equal = 3600.0),
    derive(
        Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Display, Default,
        TryFrom, Into
    ),
    default = 10.0
)]
pub struct ShutdownTimeoutSecs(f64);

impl ShutdownTimeoutSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.into_inner())
    }
}

/// Interval between heartbeat liveness checks, in seconds
#[nutype(
    validate(finite, greater = 0.0, less_or_equal = 3600.0),
    derive(
        Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Display, Default,
        TryFrom, Into
    ),
    default = 10.0
)]
pub struct HealthCheckIntervalSecs(f64);

impl HealthCheckIntervalSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.into_inner())
    }
}

/// Envelope priority, 0 lowest through 9 highest
///
/// Advisory metadata only: the broker delivers in publish order regardless
/// of priority.
#[nutype(
    validate(less_or_equal = 9),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct MessagePriority(u8);

impl MessagePriority {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Bound on a file watcher's seen-digest set before LRU eviction kicks in
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 10_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct DigestSetCapacity(usize);

impl DigestSetCapacity {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_capacity_rejects_zero() {
        assert!(ChannelCapacity::try_new(0).is_err());
        assert!(ChannelCapacity::try_new(1).is_ok());
        assert_eq!(ChannelCapacity::default().as_usize(), 1024);
    }

    #[test]
    fn priority_is_bounded() {
        assert!(MessagePriority::try_new(9).is_ok());
        assert!(MessagePriority::try_new(10).is_err());
        assert_eq!(MessagePriority::default().as_u8(), 5);
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let t = StartupTimeoutSecs::try_new(0.5).unwrap();
        assert_eq!(t.as_duration(), std::time::Duration::from_millis(500));
        assert!(StartupTimeoutSecs::try_new(0.0).is_err());
        assert!(RetryDelaySecs::try_new(0.0).is_ok());
    }
}
