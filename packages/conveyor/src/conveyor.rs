//! The pulse conveyor.
//!
//! The conveyor owns one [`SlotMachine`] per live pulse: the present pulse,
//! a lazily opened arena for the next pulse, and a bounded number of past
//! pulses. Input events are routed by pulse number and turned into slots by
//! an [`InputFactory`]. Committing a pulse runs migration over the present
//! and past arenas, promotes the future arena to present and ages out past
//! arenas beyond the retention window.
//!
//! Three locks guard the conveyor. `machines` holds the arenas and is held for
//! a whole scan pass; `index` maps pulses to arenas and is only held briefly,
//! so input routing does not wait for a scan. Lock order is `machines`,
//! `index`, then `opened`.
//!
//! Steps may call [`PulseConveyor::add_input`]. It never takes `machines`:
//! a future arena it opens is parked in `opened` and moved into `machines`
//! the next time that lock is taken. Every other operation takes `machines`
//! and must not be called from a step.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use slotflow_smachine::{
    ConfigError, CreateFn, MachineHandle, MachineId, ScanReport, Scannable, SlotMachine,
    SlotMachineConfig, SlotWorker, WorkerSignal,
};
use tracing::{debug, trace};

use crate::error::{ConveyorError, InputRejected, Result};
use crate::pulse::{PulseData, PulseNumber};

/// Where a pulse stands relative to the present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PulseSlotState {
    /// Accepts input, not scanned until committed.
    Future,
    Present,
    /// Aging; scanned until it leaves the retention window.
    Past,
}

/// Conveyor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConveyorConfig {
    /// Configuration of every pulse arena.
    pub machine: SlotMachineConfig,

    /// Number of past pulse arenas kept alive.
    pub past_pulse_retention: usize,
}

impl ConveyorConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.machine.validate()?;
        if self.past_pulse_retention == 0 {
            return Err(ConfigError::NonPositive {
                field: "past_pulse_retention",
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

/// Builds the construction function for an input event.
///
/// Must be pure: the returned function is run later, on the worker.
pub trait InputFactory<E>: Send + Sync {
    fn create(&self, pulse: PulseNumber, event: E) -> std::result::Result<CreateFn, InputRejected>;
}

impl<E, F> InputFactory<E> for F
where
    F: Fn(PulseNumber, E) -> std::result::Result<CreateFn, InputRejected> + Send + Sync,
{
    fn create(&self, pulse: PulseNumber, event: E) -> std::result::Result<CreateFn, InputRejected> {
        self(pulse, event)
    }
}

/// Index entry of one pulse arena.
struct PulseArena {
    id: MachineId,
    state: PulseSlotState,
    start: PulseNumber,
    /// `None` until the pulse is committed.
    pulse: Option<PulseData>,
    handle: MachineHandle,
}

impl PulseArena {
    fn contains(&self, pn: PulseNumber) -> bool {
        match &self.pulse {
            Some(pd) => pd.contains(pn),
            None => pn == self.start,
        }
    }
}

#[derive(Default)]
struct PulseIndex {
    present: Option<PulseArena>,
    future: Option<PulseArena>,
    /// Newest first.
    past: VecDeque<PulseArena>,
}

impl PulseIndex {
    fn arenas(&self) -> impl Iterator<Item = &PulseArena> {
        self.present
            .iter()
            .chain(self.future.iter())
            .chain(self.past.iter())
    }

    /// Arenas the worker scans.
    fn scanned(&self) -> Vec<MachineId> {
        self.present
            .iter()
            .chain(self.past.iter())
            .map(|a| a.id)
            .collect()
    }
}

enum Route {
    Arena(MachineHandle),
    OpenFuture,
}

fn route(index: &PulseIndex, pn: PulseNumber) -> Result<Route> {
    let present = index.present.as_ref().ok_or(ConveyorError::NotStarted)?;
    if present.contains(pn) {
        return Ok(Route::Arena(present.handle.clone()));
    }
    if pn > present.start {
        let next = present.pulse.as_ref().and_then(PulseData::next_pulse_number);
        if next != Some(pn) {
            return Err(ConveyorError::FutureTooFar {
                pulse: pn,
                present: present.start,
            });
        }
        return Ok(match &index.future {
            Some(future) => Route::Arena(future.handle.clone()),
            None => Route::OpenFuture,
        });
    }
    index
        .past
        .iter()
        .find(|a| a.contains(pn))
        .map(|a| Route::Arena(a.handle.clone()))
        .ok_or(ConveyorError::PulseTooOld { pulse: pn })
}

/// Routes input events to per-pulse slot machines.
pub struct PulseConveyor<E> {
    config: ConveyorConfig,
    factory: Box<dyn InputFactory<E>>,
    signal: WorkerSignal,
    machines: Mutex<HashMap<MachineId, SlotMachine>>,
    index: Mutex<PulseIndex>,
    /// Arenas opened by `add_input`, not yet in `machines`.
    opened: Mutex<Vec<SlotMachine>>,
}

impl<E> PulseConveyor<E> {
    pub fn new(config: ConveyorConfig, factory: impl InputFactory<E> + 'static) -> Result<Self> {
        Self::with_signal(config, factory, WorkerSignal::new())
    }

    /// Create a conveyor whose arenas wake `signal` on new commands.
    pub fn with_signal(
        config: ConveyorConfig,
        factory: impl InputFactory<E> + 'static,
        signal: WorkerSignal,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory: Box::new(factory),
            signal,
            machines: Mutex::new(HashMap::new()),
            index: Mutex::new(PulseIndex::default()),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ConveyorConfig {
        &self.config
    }

    pub fn signal(&self) -> &WorkerSignal {
        &self.signal
    }

    /// Lock the arenas, adopting any opened since the last lock.
    fn machines(&self) -> MutexGuard<'_, HashMap<MachineId, SlotMachine>> {
        let mut machines = self.machines.lock().unwrap_or_else(PoisonError::into_inner);
        let opened = std::mem::take(&mut *self.opened());
        for machine in opened {
            machines.insert(machine.id(), machine);
        }
        machines
    }

    fn opened(&self) -> MutexGuard<'_, Vec<SlotMachine>> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(&self) -> MutexGuard<'_, PulseIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_arena(
        &self,
        state: PulseSlotState,
        start: PulseNumber,
    ) -> Result<(PulseArena, SlotMachine)> {
        let machine = SlotMachine::with_signal(self.config.machine.clone(), self.signal.clone())?;
        let arena = PulseArena {
            id: machine.id(),
            state,
            start,
            pulse: None,
            handle: machine.handle(),
        };
        Ok((arena, machine))
    }

    fn open_arena(
        &self,
        machines: &mut HashMap<MachineId, SlotMachine>,
        state: PulseSlotState,
        start: PulseNumber,
    ) -> Result<PulseArena> {
        let (arena, machine) = self.new_arena(state, start)?;
        machines.insert(arena.id, machine);
        debug!(pulse = %start, machine = %arena.id, ?state, "pulse arena opened");
        Ok(arena)
    }

    fn evict(&self, machines: &mut HashMap<MachineId, SlotMachine>, arena: PulseArena) {
        let stopped = machines
            .remove(&arena.id)
            .map_or(0, |mut machine| machine.stop_all());
        debug!(pulse = %arena.start, machine = %arena.id, stopped, "pulse arena evicted");
    }

    /// Route `event` to the arena of pulse `pn`.
    ///
    /// Input for the pulse right after the present one opens the future
    /// arena. Its slots are constructed once that pulse is committed.
    pub fn add_input(&self, pn: PulseNumber, event: E) -> Result<()> {
        let target = route(&self.index(), pn)?;
        let create = self.factory.create(pn, event)?;
        let handle = match target {
            Route::Arena(handle) => handle,
            Route::OpenFuture => self.open_future(pn)?,
        };
        handle.add_input(create)?;
        trace!(pulse = %pn, machine = %handle.machine_id(), "input added");
        Ok(())
    }

    fn open_future(&self, pn: PulseNumber) -> Result<MachineHandle> {
        let (arena, machine) = self.new_arena(PulseSlotState::Future, pn)?;
        let mut index = self.index();
        match route(&index, pn)? {
            Route::Arena(handle) => Ok(handle),
            Route::OpenFuture => {
                debug!(pulse = %pn, machine = %arena.id, "future pulse arena opened");
                let handle = arena.handle.clone();
                index.future = Some(arena);
                self.opened().push(machine);
                Ok(handle)
            }
        }
    }

    /// Make `pd` the present pulse.
    ///
    /// Every live slot of the present and past arenas gets its migration
    /// before the worker can run any further step.
    pub fn commit_pulse_change(&self, pd: PulseData) -> Result<()> {
        pd.validate()?;
        let mut machines = self.machines();
        let mut index = self.index();

        if let Some(present) = &index.present {
            if pd.pulse_number < present.start || present.contains(pd.pulse_number) {
                return Err(ConveyorError::NonMonotonic {
                    pulse: pd.pulse_number,
                    present: present.start,
                });
            }
        }

        for arena in index.present.iter().chain(index.past.iter()) {
            if let Some(machine) = machines.get_mut(&arena.id) {
                let inits = machine.run_pending_inits();
                let migrated = machine.migrate();
                debug!(pulse = %arena.start, inits, migrated, "pulse arena migrated");
            }
        }

        if let Some(mut old) = index.present.take() {
            old.state = PulseSlotState::Past;
            index.past.push_front(old);
        }

        let promoted = match index.future.take() {
            Some(future) if future.start == pd.pulse_number => Some(future),
            Some(stale) => {
                self.evict(&mut machines, stale);
                None
            }
            None => None,
        };
        let mut present = match promoted {
            Some(arena) => arena,
            None => self.open_arena(&mut machines, PulseSlotState::Present, pd.pulse_number)?,
        };
        present.state = PulseSlotState::Present;
        present.pulse = Some(pd.clone());
        if let Some(machine) = machines.get_mut(&present.id) {
            let inits = machine.run_pending_inits();
            if inits > 0 {
                debug!(pulse = %pd.pulse_number, inits, "future inputs started");
            }
        }
        index.present = Some(present);

        while index.past.len() > self.config.past_pulse_retention {
            if let Some(old) = index.past.pop_back() {
                self.evict(&mut machines, old);
            }
        }

        debug!(
            pulse = %pd.pulse_number,
            entropy = %pd.entropy,
            past = index.past.len(),
            "pulse committed"
        );
        drop(index);
        drop(machines);
        self.signal.signal();
        Ok(())
    }

    /// Run one scan pass over the present and past arenas.
    pub fn scan_once(&self, worker: &SlotWorker) -> ScanReport {
        let mut machines = self.machines();
        let scanned = self.index().scanned();
        let mut report = ScanReport::idle();
        for id in &scanned {
            if let Some(machine) = machines.get_mut(id) {
                report = report.merge(machine.scan_once(worker));
            }
        }
        report
    }

    pub fn present_pulse(&self) -> Option<PulseData> {
        self.index().present.as_ref().and_then(|a| a.pulse.clone())
    }

    /// State of the arena that `pn` belongs to.
    pub fn pulse_state(&self, pn: PulseNumber) -> Option<PulseSlotState> {
        self.index()
            .arenas()
            .find(|a| a.contains(pn))
            .map(|a| a.state)
    }

    /// Number of live slots in the arena of `pn`.
    pub fn slot_count(&self, pn: PulseNumber) -> Option<usize> {
        let machines = self.machines();
        let id = self.index().arenas().find(|a| a.contains(pn))?.id;
        machines.get(&id).map(SlotMachine::occupied_slots)
    }

    /// Number of arenas alive, future included.
    pub fn arena_count(&self) -> usize {
        self.machines().len()
    }

    /// Stop every arena. Further input fails with `NotStarted`.
    pub fn stop(&self) -> usize {
        let mut machines = self.machines();
        let mut index = self.index();
        *index = PulseIndex::default();
        let stopped: usize = machines.values_mut().map(SlotMachine::stop_all).sum();
        machines.clear();
        debug!(stopped, "conveyor stopped");
        stopped
    }

    /// A worker target for this conveyor.
    pub fn driver(self: &Arc<Self>) -> ConveyorDriver<E> {
        ConveyorDriver {
            conveyor: Arc::clone(self),
        }
    }
}

/// Drives a shared conveyor from [`run_worker`](slotflow_smachine::run_worker).
pub struct ConveyorDriver<E> {
    conveyor: Arc<PulseConveyor<E>>,
}

impl<E> ConveyorDriver<E> {
    pub fn conveyor(&self) -> &Arc<PulseConveyor<E>> {
        &self.conveyor
    }
}

impl<E> Scannable for ConveyorDriver<E> {
    fn scan_once(&mut self, worker: &SlotWorker) -> ScanReport {
        self.conveyor.scan_once(worker)
    }
}
