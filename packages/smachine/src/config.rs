//! Slot machine configuration.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for a [`SlotMachine`](crate::SlotMachine).
///
/// Every field is required. There is deliberately no `Default`: the
/// trade-off between scan throughput and wake-up latency belongs to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMachineConfig {
    /// Number of slots per arena page.
    pub slot_page_size: usize,

    /// Delay before a polling slot is re-checked.
    pub polling_period: Duration,

    /// Granularity that wake-up deadlines are rounded up to.
    pub polling_truncate: Duration,

    /// Maximum number of slots advanced by one scan pass.
    pub scan_count_limit: usize,
}

impl SlotMachineConfig {
    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_page_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "slot_page_size",
            });
        }
        if self.scan_count_limit == 0 {
            return Err(ConfigError::NonPositive {
                field: "scan_count_limit",
            });
        }
        if self.polling_period.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "polling_period",
            });
        }
        if self.polling_truncate > self.polling_period {
            return Err(ConfigError::TruncateExceedsPeriod {
                truncate: self.polling_truncate,
                period: self.polling_period,
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Deadline for a slot that starts polling at `now`.
    pub(crate) fn poll_deadline(&self, epoch: Instant, now: Instant) -> Instant {
        self.truncate(epoch, now + self.polling_period)
    }

    /// Round `at` up to the next multiple of `polling_truncate` since `epoch`.
    pub(crate) fn truncate(&self, epoch: Instant, at: Instant) -> Instant {
        let granularity = self.polling_truncate.as_nanos();
        if granularity <= 1 {
            return at;
        }
        let offset = at.saturating_duration_since(epoch).as_nanos();
        let rounded = offset.div_ceil(granularity) * granularity;
        let rounded = u64::try_from(rounded).unwrap_or(u64::MAX);
        epoch + Duration::from_nanos(rounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SlotMachineConfig {
        SlotMachineConfig {
            slot_page_size: 16,
            polling_period: Duration::from_millis(100),
            polling_truncate: Duration::from_millis(10),
            scan_count_limit: 1000,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn zero_fields_are_rejected() {
        let mut c = config();
        c.slot_page_size = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NonPositive {
                field: "slot_page_size"
            })
        ));

        let mut c = config();
        c.scan_count_limit = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.polling_period = Duration::ZERO;
        assert!(c.validate().is_err());
    }

    #[test]
    fn truncate_coarser_than_period_is_rejected() {
        let mut c = config();
        c.polling_truncate = Duration::from_secs(1);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::TruncateExceedsPeriod { .. })
        ));
    }

    #[test]
    fn json_round_trip() {
        let text = serde_json::to_string(&config()).unwrap();
        let parsed = SlotMachineConfig::from_json(&text).unwrap();
        assert_eq!(parsed, config());
    }

    #[test]
    fn json_missing_field_fails() {
        let err = SlotMachineConfig::from_json(r#"{"slot_page_size": 4}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn deadlines_round_up_to_granularity() {
        let c = config();
        let epoch = Instant::now();
        let at = epoch + Duration::from_millis(13);
        assert_eq!(c.truncate(epoch, at), epoch + Duration::from_millis(20));

        let exact = epoch + Duration::from_millis(30);
        assert_eq!(c.truncate(epoch, exact), exact);

        let deadline = c.poll_deadline(epoch, epoch + Duration::from_millis(5));
        assert_eq!(deadline, epoch + Duration::from_millis(110));
    }

    #[test]
    fn zero_truncate_keeps_deadline() {
        let mut c = config();
        c.polling_truncate = Duration::ZERO;
        let epoch = Instant::now();
        let at = epoch + Duration::from_nanos(12_345);
        assert_eq!(c.truncate(epoch, at), at);
    }
}
