//! The result of one step.
//!
//! A [`StateUpdate`] can only be built through the context of the phase that
//! runs the step, so every update carries the phase it was produced in and
//! the machine rejects updates that the phase does not permit.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::SlotError;
use crate::link::{SlotLink, StepLink};
use crate::step::{CreateFn, SlotStep, StateFn, StateMachine};

/// Phase of a slot's life in which an update was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Construction,
    Execution,
    Migration,
    BargeIn,
    Failure,
}

/// What a slot waits for before its next step.
#[derive(Debug, Clone)]
pub(crate) enum Wait {
    /// The condition already holds.
    Ready,
    /// Let other slots run first.
    Yield,
    /// Re-check after the polling period.
    Poll,
    /// Until woken by someone.
    Sleep,
    /// Until any activation.
    Any,
    /// Until any activation or the deadline.
    AnyUntil(Instant),
    /// Until the target slot advances or terminates.
    Activation(SlotLink),
    /// Until the owner of a shared cell lets go of it.
    Shared(SharedCheck),
}

/// Availability check of a shared cell, evaluated on every poll.
#[derive(Clone)]
pub(crate) struct SharedCheck(Arc<dyn Fn() -> bool + Send + Sync>);

impl SharedCheck {
    pub(crate) fn new(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn is_ready(&self) -> bool {
        (self.0)()
    }
}

impl fmt::Debug for SharedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedCheck")
    }
}

/// The condition a waiting slot is parked on.
///
/// Checked again before the slot runs, so a poll or a stray wake-up never
/// lets a waiter continue early.
#[derive(Debug, Clone)]
pub(crate) enum WaitCondition {
    /// Holds once the target left the captured step or stopped.
    Advanced(StepLink),
    Shared(SharedCheck),
}

impl WaitCondition {
    pub(crate) fn holds(&self) -> bool {
        match self {
            WaitCondition::Advanced(target) => !target.is_at_step(),
            WaitCondition::Shared(check) => check.is_ready(),
        }
    }
}

/// Continuation after a wait.
#[derive(Debug)]
pub(crate) enum Then {
    Jump(SlotStep),
    Repeat,
}

pub(crate) enum UpdateKind {
    Jump(SlotStep),
    Replace(CreateFn),
    ReplaceWith(Box<dyn StateMachine>),
    Repeat(u32),
    Stay,
    WakeUp,
    Stop,
    Error(SlotError),
    Wait { wait: Wait, then: Then },
}

impl UpdateKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            UpdateKind::Jump(_) => "Jump",
            UpdateKind::Replace(_) => "Replace",
            UpdateKind::ReplaceWith(_) => "ReplaceWith",
            UpdateKind::Repeat(_) => "Repeat",
            UpdateKind::Stay => "Stay",
            UpdateKind::WakeUp => "WakeUp",
            UpdateKind::Stop => "Stop",
            UpdateKind::Error(_) => "Error",
            UpdateKind::Wait { .. } => "Wait",
        }
    }

    fn permitted_in(&self, phase: Phase) -> bool {
        use UpdateKind::*;
        match phase {
            Phase::Construction => false,
            Phase::Execution => matches!(
                self,
                Jump(_) | Replace(_) | ReplaceWith(_) | Repeat(_) | Stop | Error(_) | Wait { .. }
            ),
            Phase::Migration => matches!(
                self,
                Jump(_) | Replace(_) | ReplaceWith(_) | Stay | WakeUp | Stop | Error(_)
            ),
            Phase::BargeIn => matches!(self, Jump(_) | Stay | WakeUp | Stop | Error(_)),
            Phase::Failure => matches!(
                self,
                Replace(_) | ReplaceWith(_) | WakeUp | Stop | Error(_)
            ),
        }
    }
}

/// The outcome of a step.
#[must_use]
pub struct StateUpdate {
    pub(crate) phase: Phase,
    pub(crate) kind: UpdateKind,
}

impl StateUpdate {
    pub(crate) fn new(phase: Phase, kind: UpdateKind) -> Self {
        Self { phase, kind }
    }

    /// The phase this update was built in.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Check the update against the phase that is applying it.
    ///
    /// A foreign or non-permitted update is turned into an error update.
    pub(crate) fn checked(self, phase: Phase) -> UpdateKind {
        if self.phase == phase && self.kind.permitted_in(phase) {
            return self.kind;
        }
        UpdateKind::Error(SlotError::InvalidUpdate {
            update: self.kind.name(),
            phase,
        })
    }
}

impl fmt::Debug for StateUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateUpdate")
            .field("phase", &self.phase)
            .field("kind", &self.kind.name())
            .finish()
    }
}

/// A wait that must be resolved into a [`StateUpdate`] with one of the
/// `then_*` methods.
#[must_use]
#[derive(Debug)]
pub struct ConditionalUpdate {
    phase: Phase,
    wait: Wait,
    available: bool,
}

impl ConditionalUpdate {
    pub(crate) fn new(phase: Phase, wait: Wait, available: bool) -> Self {
        Self {
            phase,
            wait,
            available,
        }
    }

    /// True when the condition already holds at the time of the call.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Wait, then continue with `step`.
    pub fn then_jump<M: StateMachine>(self, step: StateFn<M>) -> StateUpdate {
        self.then_jump_ext(SlotStep::new(step))
    }

    pub fn then_jump_ext(self, step: SlotStep) -> StateUpdate {
        self.resolve(Then::Jump(step))
    }

    /// Wait, then run the current step again.
    pub fn then_repeat(self) -> StateUpdate {
        self.resolve(Then::Repeat)
    }

    fn resolve(self, then: Then) -> StateUpdate {
        let wait = if self.available { Wait::Ready } else { self.wait };
        StateUpdate::new(self.phase, UpdateKind::Wait { wait, then })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_follow_phase() {
        assert!(UpdateKind::Stay.permitted_in(Phase::Migration));
        assert!(UpdateKind::Stay.permitted_in(Phase::BargeIn));
        assert!(!UpdateKind::Stay.permitted_in(Phase::Execution));
        assert!(!UpdateKind::Repeat(1).permitted_in(Phase::Migration));
        assert!(UpdateKind::WakeUp.permitted_in(Phase::Failure));
        assert!(!UpdateKind::Stop.permitted_in(Phase::Construction));
    }

    #[test]
    fn foreign_phase_is_rejected() {
        let update = StateUpdate::new(Phase::Migration, UpdateKind::Stay);
        match update.checked(Phase::BargeIn) {
            UpdateKind::Error(SlotError::InvalidUpdate { update, phase }) => {
                assert_eq!(update, "Stay");
                assert_eq!(phase, Phase::BargeIn);
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn permitted_update_passes() {
        let update = StateUpdate::new(Phase::Execution, UpdateKind::Stop);
        assert!(matches!(update.checked(Phase::Execution), UpdateKind::Stop));
    }

    #[test]
    fn available_condition_skips_wait() {
        let ready = ConditionalUpdate::new(Phase::Execution, Wait::Sleep, true);
        assert!(ready.is_available());
        match ready.then_repeat().kind {
            UpdateKind::Wait { wait, then } => {
                assert!(matches!(wait, Wait::Ready));
                assert!(matches!(then, Then::Repeat));
            }
            other => panic!("unexpected {}", other.name()),
        }

        let pending = ConditionalUpdate::new(Phase::Execution, Wait::Poll, false);
        match pending.then_repeat().kind {
            UpdateKind::Wait { wait, .. } => assert!(matches!(wait, Wait::Poll)),
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn conditions_follow_their_source() {
        assert!(WaitCondition::Advanced(StepLink::none()).holds());

        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ready.clone();
        let shared = WaitCondition::Shared(SharedCheck::new(move || {
            flag.load(std::sync::atomic::Ordering::Relaxed)
        }));
        assert!(!shared.holds());
        ready.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(shared.holds());
    }
}
