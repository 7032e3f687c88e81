//! Async calls started by a slot and completed from elsewhere.
//!
//! A step registers a call with [`ExecutionContext::async_call`] and hands
//! the returned [`AsyncCall`] to whatever performs the work. Completing the
//! call queues a result function on the slot's machine; it runs at the start
//! of the next scan pass with an [`AsyncResultContext`] and may wake the
//! slot. Dropping an uncompleted call only releases the slot's counter.
//!
//! [`ExecutionContext::async_call`]: crate::ExecutionContext::async_call

use std::any::{type_name, Any};
use std::fmt;

use crate::error::SlotError;
use crate::handle::Command;
use crate::link::{SlotLink, StepLink};
use crate::slot::SlotBody;
use crate::step::{downcast_machine, StateMachine};

pub(crate) type AsyncResultFn = Box<
    dyn FnOnce(&mut dyn StateMachine, &mut AsyncResultContext<'_>) -> Result<(), SlotError> + Send,
>;

/// Context of an async result function.
pub struct AsyncResultContext<'a> {
    slot: &'a mut SlotBody,
    link: SlotLink,
    wake: bool,
}

impl<'a> AsyncResultContext<'a> {
    pub(crate) fn new(slot: &'a mut SlotBody, link: SlotLink) -> Self {
        Self {
            slot,
            link,
            wake: false,
        }
    }

    pub fn slot_link(&self) -> SlotLink {
        self.link.clone()
    }

    pub fn local<T: Any + Send>(&self) -> Option<&T> {
        self.slot.injects.get::<T>()
    }

    /// Async calls of the slot still outstanding, this one excluded.
    pub fn pending_call_count(&self) -> usize {
        self.slot.pending_calls
    }

    /// Activate the slot once the result is applied.
    pub fn wake_up(&mut self) {
        self.wake = true;
    }

    pub(crate) fn wakes(&self) -> bool {
        self.wake
    }
}

/// An outstanding async call of a slot.
///
/// Counted by [`pending_call_count`](crate::ExecutionContext::pending_call_count)
/// until it is completed or dropped.
pub struct AsyncCall {
    target: StepLink,
    done: bool,
}

impl AsyncCall {
    pub(crate) fn new(target: StepLink) -> Self {
        Self {
            target,
            done: false,
        }
    }

    /// The slot that started the call.
    pub fn slot_link(&self) -> &SlotLink {
        self.target.slot_link()
    }

    /// Deliver the result. `f` runs on the slot's machine before its next
    /// scan pass; a slot of another machine type fails with a type mismatch.
    ///
    /// Returns false when the slot is gone or its machine stopped.
    pub fn complete<M, F>(mut self, f: F) -> bool
    where
        M: StateMachine,
        F: FnOnce(&mut M, &mut AsyncResultContext<'_>) + Send + 'static,
    {
        self.done = true;
        let result: AsyncResultFn = Box::new(move |sm, ctx| match downcast_machine::<M>(sm) {
            Some(m) => {
                f(m, ctx);
                Ok(())
            }
            None => Err(SlotError::TypeMismatch {
                expected: type_name::<M>(),
            }),
        });
        self.send(Some(result))
    }

    fn send(&self, result: Option<AsyncResultFn>) -> bool {
        if !self.target.is_at_step() {
            return false;
        }
        match self.target.header() {
            Some(header) => header.machine().push(Command::AsyncResult {
                target: self.target.clone(),
                result,
            }),
            None => false,
        }
    }
}

impl Drop for AsyncCall {
    fn drop(&mut self) {
        if !self.done {
            self.send(None);
        }
    }
}

impl fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCall")
            .field("target", &self.target)
            .field("done", &self.done)
            .finish()
    }
}
