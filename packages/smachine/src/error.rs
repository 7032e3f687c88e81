//! Error types for the slot machine.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::update::Phase;

/// Boxed error returned by user step functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that terminate or interrupt a slot.
#[derive(Debug, Error)]
pub enum SlotError {
    /// A step returned `ctx.error(..)`.
    #[error("step failed: {0}")]
    Step(#[source] BoxError),

    /// A step, handler or construction function panicked.
    #[error("step panicked: {message}")]
    Panic { message: String },

    /// `Repeat(limit)` was requested more often than allowed.
    #[error("repeat limit of {limit} exhausted")]
    RepeatLimit { limit: u32 },

    /// A step function was bound to a different state machine type.
    #[error("step expects state machine {expected}")]
    TypeMismatch { expected: &'static str },

    /// An update was produced in a phase that does not allow it.
    #[error("{update} is not permitted during {phase:?}")]
    InvalidUpdate { update: &'static str, phase: Phase },

    /// The slot machine no longer accepts commands.
    #[error("slot machine is stopped")]
    MachineStopped,
}

impl SlotError {
    /// Build a failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        SlotError::Panic { message }
    }

    /// True when the failure was captured from a panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, SlotError::Panic { .. })
    }
}

/// Errors in slot machine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is zero.
    #[error("{field} must be positive")]
    NonPositive { field: &'static str },

    /// Wake-up truncation is coarser than the polling period.
    #[error("polling truncate {truncate:?} exceeds polling period {period:?}")]
    TruncateExceedsPeriod { truncate: Duration, period: Duration },

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type alias for slot machine operations.
pub type Result<T> = std::result::Result<T, SlotError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn panic_payloads_become_messages() {
        let e = SlotError::from_panic(Box::new("boom"));
        assert!(e.is_panic());
        assert_eq!(e.to_string(), "step panicked: boom");

        let e = SlotError::from_panic(Box::new(String::from("owned")));
        assert!(e.to_string().contains("owned"));

        let e = SlotError::from_panic(Box::new(42_u32));
        assert!(e.to_string().contains("non-string"));
    }

    #[test]
    fn step_error_keeps_source() {
        let inner: BoxError = "bad input".into();
        let e = SlotError::Step(inner);
        assert!(!e.is_panic());
        assert!(StdError::source(&e).is_some());
        assert!(e.to_string().contains("bad input"));
    }

    #[test]
    fn invalid_update_display() {
        let e = SlotError::InvalidUpdate {
            update: "Replace",
            phase: Phase::BargeIn,
        };
        let display = e.to_string();
        assert!(display.contains("Replace"));
        assert!(display.contains("BargeIn"));
    }

    #[test]
    fn config_error_display() {
        let e = ConfigError::NonPositive {
            field: "slot_page_size",
        };
        assert_eq!(e.to_string(), "slot_page_size must be positive");
    }
}
