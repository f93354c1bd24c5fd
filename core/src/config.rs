//! Validated runtime knobs shared by devices and discovery.

use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ALLOWED_FAILURES: u32 = 20;
pub const MAX_DISCOVERY_TIMEOUT_SECS: u64 = 255;

const RECOMMENDED_IO_TIMEOUT: std::ops::RangeInclusive<Duration> =
    Duration::from_secs(3)..=Duration::from_secs(10);

/// Every setter rejects out-of-range values, so a `Settings` value is always valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    read_timeout: Duration,
    write_timeout: Duration,
    discovery_timeout: Duration,
    max_allowed_failures: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            max_allowed_failures: DEFAULT_MAX_ALLOWED_FAILURES,
        }
    }
}

impl Settings {
    pub fn read_timeout(&self) -> Duration { self.read_timeout }
    pub fn write_timeout(&self) -> Duration { self.write_timeout }
    pub fn discovery_timeout(&self) -> Duration { self.discovery_timeout }
    pub fn max_allowed_failures(&self) -> u32 { self.max_allowed_failures }

    pub fn set_read_timeout(&mut self, value: Duration) -> Result<(), ConfigError> {
        self.read_timeout = io_timeout("read_timeout", value)?;
        Ok(())
    }

    pub fn set_write_timeout(&mut self, value: Duration) -> Result<(), ConfigError> {
        self.write_timeout = io_timeout("write_timeout", value)?;
        Ok(())
    }

    /// Whole seconds between 0 and 255; sub-second remainders are rejected.
    pub fn set_discovery_timeout(&mut self, value: Duration) -> Result<(), ConfigError> {
        if value.subsec_nanos() != 0 || value.as_secs() > MAX_DISCOVERY_TIMEOUT_SECS {
            return Err(ConfigError::OutOfRange {
                name: "discovery_timeout",
                expected: "a whole number of seconds between 0 and 255",
                value: format!("{value:?}"),
            });
        }
        self.discovery_timeout = value;
        Ok(())
    }

    pub fn set_max_allowed_failures(&mut self, value: u32) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfRange {
                name: "max_allowed_failures",
                expected: "at least 1",
                value: value.to_string(),
            });
        }
        self.max_allowed_failures = value;
        Ok(())
    }
}

fn io_timeout(name: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::OutOfRange { name, expected: "greater than zero", value: format!("{value:?}") });
    }
    if !RECOMMENDED_IO_TIMEOUT.contains(&value) {
        warn!(setting = name, ?value, "timeout outside the recommended 3-10s range");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        assert_eq!(s.max_allowed_failures(), 20);
        assert!(s.read_timeout() > Duration::ZERO);
        assert!(s.discovery_timeout().as_secs() <= MAX_DISCOVERY_TIMEOUT_SECS);
    }

    #[test]
    fn rejects_zero_io_timeouts() {
        let mut s = Settings::default();
        assert!(s.set_read_timeout(Duration::ZERO).is_err());
        assert!(s.set_write_timeout(Duration::ZERO).is_err());
        assert_eq!(s.read_timeout(), DEFAULT_READ_TIMEOUT);
    }

    #[test]
    fn accepts_unusual_but_positive_timeouts() {
        let mut s = Settings::default();
        s.set_read_timeout(Duration::from_millis(250)).unwrap();
        assert_eq!(s.read_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn discovery_timeout_is_bounded() {
        let mut s = Settings::default();
        s.set_discovery_timeout(Duration::ZERO).unwrap();
        s.set_discovery_timeout(Duration::from_secs(255)).unwrap();
        assert!(s.set_discovery_timeout(Duration::from_secs(256)).is_err());
        assert!(s.set_discovery_timeout(Duration::from_millis(1500)).is_err());
        assert_eq!(s.discovery_timeout(), Duration::from_secs(255));
    }

    #[test]
    fn max_failures_must_be_positive() {
        let mut s = Settings::default();
        assert!(s.set_max_allowed_failures(0).is_err());
        s.set_max_allowed_failures(3).unwrap();
        assert_eq!(s.max_allowed_failures(), 3);
    }
}
