//! Error types for the pulse conveyor.

use slotflow_smachine::{ConfigError, SlotError};
use thiserror::Error;

use crate::pulse::PulseNumber;

/// An input event refused by the input factory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("input rejected: {reason}")]
pub struct InputRejected {
    pub reason: String,
}

impl InputRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors reported by the conveyor entry points.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// No pulse has been committed yet.
    #[error("conveyor has no present pulse")]
    NotStarted,

    /// The target pulse is older than every retained past pulse.
    #[error("pulse {pulse} is too old")]
    PulseTooOld { pulse: PulseNumber },

    /// Only the pulse right after the present one accepts early input.
    #[error("pulse {pulse} is too far in the future, present is {present}")]
    FutureTooFar {
        pulse: PulseNumber,
        present: PulseNumber,
    },

    /// A commit did not move the present pulse forward.
    #[error("pulse {pulse} does not follow present pulse {present}")]
    NonMonotonic {
        pulse: PulseNumber,
        present: PulseNumber,
    },

    /// The value is outside the time pulse range.
    #[error("invalid pulse number {value}")]
    InvalidPulse { value: u32 },

    /// Pulse data with a zero delta to the next pulse.
    #[error("pulse {pulse} has no next pulse")]
    NoNextPulse { pulse: PulseNumber },

    #[error(transparent)]
    InputRejected(#[from] InputRejected),

    #[error(transparent)]
    Machine(#[from] SlotError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;
