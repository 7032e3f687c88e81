//! Shared data cells with non-blocking access arbitration.
//!
//! A cell is owned by the slot that shared it. The owner is never refused
//! because of its own state; other slots get access only while the owner is
//! not running a step. Slots of the same machine see `Local*` reports,
//! everyone else `Remote*`.
//!
//! [`SharedDataLink::try_use_detached`] runs outside any scan pass and holds
//! the cell while its function runs. An access that finds the cell held that
//! way reports busy, the owner's included: the owner then sees `LocalBusy`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::context::ExecutionContext;
use crate::handle::Command;
use crate::link::{SlotLink, StepLink};
use crate::step::StateFn;
use crate::step::StateMachine;
use crate::update::StateUpdate;

/// Outcome of an access attempt. Ordered: everything from
/// [`AvailableAlways`](SharedAccessReport::AvailableAlways) up is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SharedAccessReport {
    /// The owner is gone.
    Absent,
    LocalBusy,
    RemoteBusy,
    /// The caller owns the cell and the cell was free.
    AvailableAlways,
    LocalAvailable,
    RemoteAvailable,
}

impl SharedAccessReport {
    pub fn is_available(self) -> bool {
        self >= SharedAccessReport::AvailableAlways
    }

    pub fn is_remote(self) -> bool {
        matches!(
            self,
            SharedAccessReport::RemoteBusy | SharedAccessReport::RemoteAvailable
        )
    }

    pub fn is_absent(self) -> bool {
        self == SharedAccessReport::Absent
    }

    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SharedAccessReport::LocalBusy | SharedAccessReport::RemoteBusy
        )
    }
}

fn try_lock<T>(data: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match data.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// A link to data shared by a slot.
pub struct SharedDataLink<T> {
    owner: StepLink,
    wakeup: bool,
    data: Arc<Mutex<T>>,
}

impl<T> Clone for SharedDataLink<T> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            wakeup: self.wakeup,
            data: self.data.clone(),
        }
    }
}

impl<T: Send + 'static> SharedDataLink<T> {
    pub(crate) fn new(owner: StepLink, wakeup: bool, data: T) -> Self {
        Self {
            owner,
            wakeup,
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// The owning slot.
    pub fn owner(&self) -> &StepLink {
        &self.owner
    }

    /// True while the owner is alive.
    pub fn is_valid(&self) -> bool {
        self.owner.is_valid()
    }

    /// True when a non-owner use wakes the owner.
    pub fn wakes_owner(&self) -> bool {
        self.wakeup
    }

    /// Bind an access function to the cell.
    pub fn prepare_access<F>(&self, f: F) -> SharedDataAccessor<'_, T, F>
    where
        F: FnMut(&mut T),
    {
        SharedDataAccessor { link: self, f }
    }

    /// Report what an access by `caller` would get, without running anything.
    pub fn availability(&self, caller: Option<&SlotLink>) -> SharedAccessReport {
        let (report, _) = self.arbitrate(caller);
        match report {
            Some(r) if r != SharedAccessReport::AvailableAlways => r,
            _ if try_lock(&self.data).is_none() => self.busy(caller),
            Some(r) => r,
            None => self.available(caller),
        }
    }

    /// Access the cell from outside any scan pass, from any thread.
    pub fn try_use_detached<F>(&self, f: F) -> SharedAccessReport
    where
        F: FnOnce(&mut T),
    {
        let mut f = Some(f);
        let (report, wake) = self.access(None, &mut |data: &mut T| {
            if let Some(f) = f.take() {
                f(data)
            }
        });
        if wake {
            if let Some(header) = self.owner.header() {
                header
                    .machine()
                    .push(Command::WakeUp(self.owner.any_step()));
            }
        }
        report
    }

    /// Run `f` if the cell is available to `caller`.
    ///
    /// Returns the report and whether the owner must be woken.
    pub(crate) fn access<F>(&self, caller: Option<&SlotLink>, f: &mut F) -> (SharedAccessReport, bool)
    where
        F: FnMut(&mut T),
    {
        let (report, is_owner) = self.arbitrate(caller);
        if let Some(report) = report {
            if report != SharedAccessReport::AvailableAlways {
                return (report, false);
            }
        }
        let Some(mut guard) = try_lock(&self.data) else {
            return (self.busy(caller), false);
        };
        f(&mut guard);
        drop(guard);

        if is_owner {
            (SharedAccessReport::AvailableAlways, false)
        } else {
            (self.available(caller), self.wakeup)
        }
    }

    /// Liveness and ownership checks that need no lock.
    ///
    /// Returns a final report when one is already known, plus whether the
    /// caller is the owner.
    fn arbitrate(&self, caller: Option<&SlotLink>) -> (Option<SharedAccessReport>, bool) {
        let (valid, busy) = self.owner.valid_and_busy();
        if !valid {
            return (Some(SharedAccessReport::Absent), false);
        }
        if caller.is_some_and(|c| c == self.owner.slot_link()) {
            return (Some(SharedAccessReport::AvailableAlways), true);
        }
        if busy {
            return (Some(self.busy(caller)), false);
        }
        (None, false)
    }

    fn is_local(&self, caller: Option<&SlotLink>) -> bool {
        match caller {
            Some(c) => c.machine_id().is_some() && c.machine_id() == self.owner.machine_id(),
            None => false,
        }
    }

    fn busy(&self, caller: Option<&SlotLink>) -> SharedAccessReport {
        if self.is_local(caller) {
            SharedAccessReport::LocalBusy
        } else {
            SharedAccessReport::RemoteBusy
        }
    }

    fn available(&self, caller: Option<&SlotLink>) -> SharedAccessReport {
        if self.is_local(caller) {
            SharedAccessReport::LocalAvailable
        } else {
            SharedAccessReport::RemoteAvailable
        }
    }
}

impl<T> fmt::Debug for SharedDataLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDataLink")
            .field("owner", &self.owner)
            .field("wakeup", &self.wakeup)
            .finish()
    }
}

/// A shared data link paired with the function to run on it.
pub struct SharedDataAccessor<'a, T, F> {
    pub(crate) link: &'a SharedDataLink<T>,
    pub(crate) f: F,
}

impl<T, F> SharedDataAccessor<'_, T, F>
where
    T: Send + 'static,
    F: FnMut(&mut T),
{
    /// Run the access function if the cell is available.
    ///
    /// When the report is not available the function is not called and the
    /// step should retry with `ctx.wait_shared(..).then_repeat()`.
    pub fn try_use(&mut self, ctx: &mut ExecutionContext<'_>) -> SharedAccessReport {
        ctx.use_shared(self)
    }

    /// Jump to `next` once the access ran or the owner is gone.
    pub fn try_use_then_jump<M: StateMachine>(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        next: StateFn<M>,
    ) -> StateUpdate {
        self.try_use_then_else_jump(ctx, next, next)
    }

    /// Jump to `then_next` after a successful access, to `else_next` when
    /// the owner is gone, otherwise wait and repeat.
    pub fn try_use_then_else_jump<M: StateMachine>(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        then_next: StateFn<M>,
        else_next: StateFn<M>,
    ) -> StateUpdate {
        let report = self.try_use(ctx);
        if report.is_available() {
            ctx.jump(then_next)
        } else if report.is_absent() {
            ctx.jump(else_next)
        } else {
            ctx.wait_shared(self.link).then_repeat()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MachineSync;
    use crate::link::{SlotHeader, SlotId};
    use crate::worker::WorkerSignal;

    fn live_link(sync: &Arc<MachineSync>, index: u32, id: u32) -> (Arc<SlotHeader>, SlotLink) {
        let header = Arc::new(SlotHeader::new(index, sync.clone()));
        header.activate(SlotId::new(id));
        let link = SlotLink::new(SlotId::new(id), header.clone());
        (header, link)
    }

    #[test]
    fn report_ordering() {
        assert!(!SharedAccessReport::RemoteBusy.is_available());
        assert!(SharedAccessReport::AvailableAlways.is_available());
        assert!(SharedAccessReport::RemoteAvailable.is_remote());
        assert!(SharedAccessReport::LocalBusy.is_busy());
        assert!(SharedAccessReport::Absent.is_absent());
    }

    #[test]
    fn owner_always_has_access() {
        let sync = MachineSync::new(WorkerSignal::new());
        let (header, owner) = live_link(&sync, 0, 1);
        header.set_busy(true);
        let cell = SharedDataLink::new(owner.current_step(), false, 1_u32);

        let (report, wake) = cell.access(Some(&owner), &mut |v: &mut u32| *v += 1);
        assert_eq!(report, SharedAccessReport::AvailableAlways);
        assert!(!wake);
        assert_eq!(*cell.data.lock().unwrap(), 2);
    }

    #[test]
    fn owner_waits_for_detached_user() {
        let sync = MachineSync::new(WorkerSignal::new());
        let (_header, owner) = live_link(&sync, 0, 1);
        let cell = SharedDataLink::new(owner.current_step(), false, 1_u32);

        let guard = cell.data.lock().unwrap();
        let (report, wake) = cell.access(Some(&owner), &mut |v: &mut u32| *v = 0);
        assert_eq!(report, SharedAccessReport::LocalBusy);
        assert!(!wake);
        assert_eq!(cell.availability(Some(&owner)), SharedAccessReport::LocalBusy);
        drop(guard);
        assert_eq!(cell.availability(Some(&owner)), SharedAccessReport::AvailableAlways);

        assert_eq!(*cell.data.lock().unwrap(), 1);
    }

    #[test]
    fn busy_owner_blocks_without_side_effects() {
        let sync = MachineSync::new(WorkerSignal::new());
        let (header, owner) = live_link(&sync, 0, 1);
        let (_h2, caller) = live_link(&sync, 1, 2);
        let cell = SharedDataLink::new(owner.current_step(), true, 10_u32);

        header.set_busy(true);
        for _ in 0..3 {
            let (report, wake) = cell.access(Some(&caller), &mut |v: &mut u32| *v = 0);
            assert_eq!(report, SharedAccessReport::LocalBusy);
            assert!(!wake);
        }
        assert_eq!(*cell.data.lock().unwrap(), 10);

        header.set_busy(false);
        let (report, wake) = cell.access(Some(&caller), &mut |v: &mut u32| *v = 0);
        assert_eq!(report, SharedAccessReport::LocalAvailable);
        assert!(wake);
        assert_eq!(*cell.data.lock().unwrap(), 0);
    }

    #[test]
    fn locked_cell_reports_busy() {
        let sync = MachineSync::new(WorkerSignal::new());
        let (_header, owner) = live_link(&sync, 0, 1);
        let cell = SharedDataLink::new(owner.current_step(), false, 0_u32);

        let guard = cell.data.lock().unwrap();
        assert_eq!(
            cell.try_use_detached(|v| *v = 5),
            SharedAccessReport::RemoteBusy
        );
        assert_eq!(cell.availability(None), SharedAccessReport::RemoteBusy);
        drop(guard);
        assert_eq!(cell.availability(None), SharedAccessReport::RemoteAvailable);
    }

    #[test]
    fn other_machine_is_remote() {
        let owner_sync = MachineSync::new(WorkerSignal::new());
        let caller_sync = MachineSync::new(WorkerSignal::new());
        let (_h1, owner) = live_link(&owner_sync, 0, 1);
        let (_h2, caller) = live_link(&caller_sync, 0, 1);
        let cell = SharedDataLink::new(owner.current_step(), false, 0_u32);

        let (report, _) = cell.access(Some(&caller), &mut |v: &mut u32| *v = 3);
        assert_eq!(report, SharedAccessReport::RemoteAvailable);
    }

    #[test]
    fn dead_owner_is_absent() {
        let sync = MachineSync::new(WorkerSignal::new());
        let (header, owner) = live_link(&sync, 0, 1);
        let cell = SharedDataLink::new(owner.current_step(), false, 7_u32);
        header.retire();

        assert!(!cell.is_valid());
        let mut called = false;
        let report = cell.try_use_detached(|_| called = true);
        assert_eq!(report, SharedAccessReport::Absent);
        assert!(!called);
    }

    #[test]
    fn detached_use_wakes_owner() {
        let sync = MachineSync::new(WorkerSignal::new());
        let (_header, owner) = live_link(&sync, 0, 1);
        let cell = SharedDataLink::new(owner.current_step(), true, 0_u32);

        assert_eq!(
            cell.try_use_detached(|v| *v = 9),
            SharedAccessReport::RemoteAvailable
        );
        assert!(sync.has_commands());
    }
}
