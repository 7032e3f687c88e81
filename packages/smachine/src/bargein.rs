//! One-shot continuations injected into a slot from outside its scan loop.
//!
//! A barge-in is created by a running step, handed to foreign code (an async
//! completion, another thread) and later invoked. Invocation queues the
//! continuation on the target machine; it is validated against the target
//! step link both when called and when applied.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::handle::Command;
use crate::link::StepLink;
use crate::step::{BargeInCall, SlotStep, StateFn, StateMachine};

pub(crate) enum BargeInAction {
    Jump(SlotStep),
    WakeUp,
    Stop,
    Apply {
        call: Arc<dyn BargeInCall>,
        param: Option<Box<dyn Any + Send>>,
    },
}

pub(crate) struct BargeInCommand {
    /// Step 0 accepts any step of the slot.
    pub(crate) target: StepLink,
    /// The step at which the barge-in was created.
    pub(crate) origin: u32,
    pub(crate) action: BargeInAction,
}

impl BargeInCommand {
    /// Queue the command on the target's machine.
    fn send(self) -> bool {
        if !self.target.is_at_step() {
            return false;
        }
        let machine = match self.target.header() {
            Some(header) => header.machine().clone(),
            None => return false,
        };
        machine.push(Command::BargeIn(self))
    }
}

/// Selects the outcome of a barge-in.
#[must_use]
pub struct BargeInBuilder {
    target: StepLink,
    origin: u32,
}

impl BargeInBuilder {
    pub(crate) fn new(target: StepLink, origin: u32) -> Self {
        Self { target, origin }
    }

    pub fn with_jump<M: StateMachine>(self, step: StateFn<M>) -> BargeInFn {
        self.with_jump_ext(SlotStep::new(step))
    }

    pub fn with_jump_ext(self, step: SlotStep) -> BargeInFn {
        self.build(BargeInAction::Jump(step))
    }

    pub fn with_wake_up(self) -> BargeInFn {
        self.build(BargeInAction::WakeUp)
    }

    pub fn with_stop(self) -> BargeInFn {
        self.build(BargeInAction::Stop)
    }

    fn build(self, action: BargeInAction) -> BargeInFn {
        BargeInFn {
            command: Arc::new(Mutex::new(Some(BargeInCommand {
                target: self.target,
                origin: self.origin,
                action,
            }))),
        }
    }
}

/// A one-shot barge-in. Clones share the shot.
#[derive(Clone)]
pub struct BargeInFn {
    command: Arc<Mutex<Option<BargeInCommand>>>,
}

impl BargeInFn {
    /// Queue the barge-in. False when already used or the target is gone.
    pub fn call(&self) -> bool {
        let command = self
            .command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        command.is_some_and(BargeInCommand::send)
    }

    /// True while the barge-in is unused and its target still matches.
    pub fn is_valid(&self) -> bool {
        self.command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|c| c.target.is_at_step())
    }
}

impl fmt::Debug for BargeInFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BargeInFn")
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// A one-shot barge-in that carries a parameter to its continuation.
#[derive(Clone)]
pub struct BargeInParamFn {
    state: Arc<Mutex<Option<(StepLink, u32, Arc<dyn BargeInCall>)>>>,
}

impl BargeInParamFn {
    pub(crate) fn new(target: StepLink, origin: u32, call: Arc<dyn BargeInCall>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some((target, origin, call)))),
        }
    }

    /// Queue the continuation with `param`.
    pub fn call<P: Any + Send>(&self, param: P) -> bool {
        let state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((target, origin, call)) = state else {
            return false;
        };
        BargeInCommand {
            target,
            origin,
            action: BargeInAction::Apply {
                call,
                param: Some(Box::new(param)),
            },
        }
        .send()
    }

    pub fn is_valid(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(target, _, _)| target.is_at_step())
    }
}

impl fmt::Debug for BargeInParamFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BargeInParamFn")
            .field("valid", &self.is_valid())
            .finish()
    }
}
