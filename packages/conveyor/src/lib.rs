//! Pulse conveyor.
//!
//! Binds slot machines to pulses, the discrete steps of logical time. See
//! [`PulseConveyor`] for routing and commit rules.

mod conveyor;
mod error;
mod pulse;

pub use conveyor::{ConveyorConfig, ConveyorDriver, InputFactory, PulseConveyor, PulseSlotState};
pub use error::{ConveyorError, InputRejected, Result};
pub use pulse::{Entropy, PulseData, PulseGenerator, PulseNumber};
