//! Slotflow: a pulse-driven cooperative scheduler for very many small state machines.
//!
//! Logic runs as state machines in the slots of a [`SlotMachine`], advanced one
//! step at a time by a worker. A [`PulseConveyor`] owns one slot machine per
//! live pulse and migrates every slot when a new pulse is committed.

pub use slotflow_conveyor as conveyor;
pub use slotflow_smachine as smachine;

pub use slotflow_conveyor::{
    ConveyorConfig, ConveyorDriver, ConveyorError, InputFactory, InputRejected, PulseConveyor,
    PulseData, PulseGenerator, PulseNumber, PulseSlotState,
};
pub use slotflow_smachine::{
    constructor, run_worker, CreateFn, ExecutionContext, MigrationContext, SlotError, SlotLink,
    SlotMachine, SlotMachineConfig, SlotWorker, StateMachine, StateUpdate, StepLink, WorkerId,
    WorkerSignal,
};
