//! Thread-safe command intake of a slot machine.
//!
//! A slot machine itself is owned by one worker. Everything other threads
//! may do to it is queued here and applied at the start of the next scan
//! pass: new inputs, wake-ups, barge-ins, async results and child failures.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::bargein::BargeInCommand;
use crate::call::AsyncResultFn;
use crate::error::{Result, SlotError};
use crate::link::{SlotLink, StepLink};
use crate::slot::SlotFailure;
use crate::step::CreateFn;
use crate::worker::WorkerSignal;

/// Unique identifier of a slot machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId(Uuid);

impl MachineId {
    /// Create a new random MachineId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work queued for the owning scan thread.
pub(crate) enum Command {
    /// Construct a new root slot.
    AddInput { create: CreateFn },
    /// Activate a slot if it is still at the given step.
    WakeUp(StepLink),
    /// Apply an out-of-band continuation.
    BargeIn(BargeInCommand),
    /// A child slot failed; notify its parent.
    ChildFailed { parent: SlotLink, failure: SlotFailure },
    /// An async call of the slot finished; `None` when it was abandoned.
    AsyncResult {
        target: StepLink,
        result: Option<AsyncResultFn>,
    },
}

pub(crate) struct MachineSync {
    id: MachineId,
    commands: Mutex<Vec<Command>>,
    stopped: AtomicBool,
    signal: WorkerSignal,
}

impl MachineSync {
    pub(crate) fn new(signal: WorkerSignal) -> Arc<Self> {
        Arc::new(Self {
            id: MachineId::new(),
            commands: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            signal,
        })
    }

    pub(crate) fn id(&self) -> MachineId {
        self.id
    }

    /// Queue a command; false once the machine is stopped.
    pub(crate) fn push(&self, command: Command) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
        self.signal.signal();
        true
    }

    pub(crate) fn drain(&self) -> Vec<Command> {
        std::mem::take(&mut *self.commands.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn has_commands(&self) -> bool {
        !self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.drain();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MachineSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineSync")
            .field("id", &self.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Cloneable, thread-safe handle to a slot machine.
#[derive(Clone, Debug)]
pub struct MachineHandle {
    sync: Arc<MachineSync>,
}

impl MachineHandle {
    pub(crate) fn new(sync: Arc<MachineSync>) -> Self {
        Self { sync }
    }

    /// The machine this handle feeds.
    pub fn machine_id(&self) -> MachineId {
        self.sync.id()
    }

    /// Queue construction of a new slot.
    ///
    /// The slot is allocated on the next scan pass (or migration) of the
    /// machine; the construction function must not have side effects.
    pub fn add_input(&self, create: CreateFn) -> Result<()> {
        if self.sync.push(Command::AddInput { create }) {
            Ok(())
        } else {
            Err(SlotError::MachineStopped)
        }
    }

    /// Ask the machine to activate a slot if it is still at `link`'s step.
    ///
    /// Returns false for stale links and stopped machines.
    pub fn wake_up(&self, link: &StepLink) -> bool {
        if link.machine_id() != Some(self.sync.id()) || !link.is_at_step() {
            return false;
        }
        self.sync.push(Command::WakeUp(link.clone()))
    }

    /// True once the machine has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.sync.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_unique() {
        assert_ne!(MachineId::new(), MachineId::new());
        let id = MachineId::default();
        assert_eq!(id.to_string().len(), 36);
    }

    #[test]
    fn stopped_sync_rejects_commands() {
        let sync = MachineSync::new(WorkerSignal::new());
        let handle = MachineHandle::new(sync.clone());
        assert!(sync.push(Command::WakeUp(StepLink::none())));
        assert!(sync.has_commands());

        sync.stop();
        assert!(!sync.has_commands());
        assert!(handle.is_stopped());
        assert!(!sync.push(Command::WakeUp(StepLink::none())));
    }

    #[test]
    fn push_bumps_signal() {
        let signal = WorkerSignal::new();
        let sync = MachineSync::new(signal.clone());
        let mark = signal.mark();
        sync.push(Command::WakeUp(StepLink::none()));
        assert!(signal.has_changed(mark));
        assert_eq!(sync.drain().len(), 1);
    }

    #[test]
    fn wake_up_rejects_stale_links() {
        let handle = MachineHandle::new(MachineSync::new(WorkerSignal::new()));
        assert!(!handle.wake_up(&StepLink::none()));
    }
}
