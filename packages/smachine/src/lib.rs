//! Cooperative slot machine scheduler.
//!
//! A [`SlotMachine`] owns an arena of slots. Each slot holds one
//! [`StateMachine`] and its current step function. A worker calls
//! [`SlotMachine::scan_once`] in a loop; every pass runs one step of each ready
//! slot, and the [`StateUpdate`] a step returns decides whether the slot runs
//! again, waits, sleeps or stops.
//!
//! ## Example
//!
//! ```rust,ignore
//! use slotflow_smachine::{
//!     constructor, ExecutionContext, SlotMachine, SlotWorker, StateMachine, StateUpdate,
//!     WorkerId, WorkerSignal,
//! };
//!
//! struct Hello;
//!
//! impl StateMachine for Hello {
//!     fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
//!         ctx.jump(Hello::greet)
//!     }
//! }
//!
//! impl Hello {
//!     fn greet(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
//!         println!("hello from {}", ctx.slot_link().slot_id());
//!         ctx.stop()
//!     }
//! }
//!
//! let mut machine = SlotMachine::new(config)?;
//! let worker = SlotWorker::new(WorkerId(0), WorkerSignal::new());
//! machine.add_new(constructor(Hello));
//! while machine.scan_once(&worker).repeat_now {}
//! ```

mod bargein;
mod call;
mod config;
mod context;
mod dependency;
mod error;
mod handle;
mod link;
mod machine;
mod shared;
mod slot;
mod step;
mod sync;
mod update;
mod worker;

pub use bargein::{BargeInBuilder, BargeInFn, BargeInParamFn};
pub use call::{AsyncCall, AsyncResultContext};
pub use config::SlotMachineConfig;
pub use context::{
    BargeInContext, ConstructionContext, ExecutionContext, FailureContext, MigrationContext,
};
pub use dependency::{
    release_dependency, DependencyRelease, PostponedDependency, PostponedList, SlotDependency,
};
pub use error::{BoxError, ConfigError, Result, SlotError};
pub use handle::{MachineHandle, MachineId};
pub use link::{SlotId, SlotLink, StepLink, UNKNOWN_SLOT_ID};
pub use machine::SlotMachine;
pub use shared::{SharedAccessReport, SharedDataAccessor, SharedDataLink};
pub use slot::{SlotFailure, SlotStatus};
pub use step::{
    constructor, downcast_machine, AsAny, BargeInApplyFn, CreateFn, ErrorHandlerFn, LocalInjects,
    MigrateFn, ShadowMigrate, SlotStep, StateFn, StateMachine, StepFlags,
};
pub use sync::Semaphore;
pub use update::{ConditionalUpdate, Phase, StateUpdate};
pub use worker::{run_worker, ScanReport, Scannable, SlotWorker, WorkerId, WorkerSignal};
