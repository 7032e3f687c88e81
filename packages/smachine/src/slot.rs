//! Per-slot state owned by the arena.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::Span;

use crate::dependency::SlotDependency;
use crate::error::SlotError;
use crate::link::{SlotLink, StepLink};
use crate::step::{FailureCall, LocalInjects, MigrateCall, SlotStep, StateMachine, StepFlags};
use crate::update::WaitCondition;

/// Where a live slot currently sits in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    /// Queued to run on the next scan pass.
    Active,
    /// Waiting for a poll deadline.
    Polling,
    /// Waiting for another slot to advance.
    Waiting,
    /// Waiting for an explicit wake-up or a deadline.
    Sleeping,
}

/// A failed child slot, reported to its parent.
#[derive(Clone, Debug)]
pub struct SlotFailure {
    /// The child that failed. It is no longer valid.
    pub child: SlotLink,
    /// Why it failed.
    pub error: Arc<SlotError>,
}

impl SlotFailure {
    pub fn is_panic(&self) -> bool {
        self.error.is_panic()
    }
}

pub(crate) struct SlotBody {
    pub(crate) sm: Option<Box<dyn StateMachine>>,
    /// `None` while the slot is at its init step.
    pub(crate) step: Option<SlotStep>,
    /// Set once the init step of the current machine has run.
    pub(crate) initialized: bool,
    pub(crate) parent: SlotLink,
    pub(crate) span: Span,
    pub(crate) default_migration: Option<Arc<dyn MigrateCall>>,
    pub(crate) default_handler: Option<Arc<dyn FailureCall>>,
    pub(crate) default_flags: StepFlags,
    pub(crate) dependency: Option<Box<dyn SlotDependency>>,
    pub(crate) dependency_key: Option<usize>,
    /// Slots waiting for this one to advance.
    pub(crate) dependents: Vec<StepLink>,
    pub(crate) injects: LocalInjects,
    pub(crate) status: SlotStatus,
    /// Schedule generation; queue entries with an older token are stale.
    pub(crate) token: u64,
    pub(crate) repeat_budget: Option<u32>,
    pub(crate) failures: Vec<SlotFailure>,
    /// What the slot waits for while parked or polling.
    pub(crate) condition: Option<WaitCondition>,
    /// Async calls started by the slot and not yet completed.
    pub(crate) pending_calls: usize,
}

impl SlotBody {
    pub(crate) fn new(parent: SlotLink, span: Span, injects: LocalInjects) -> Self {
        Self {
            sm: None,
            step: None,
            initialized: false,
            parent,
            span,
            default_migration: None,
            default_handler: None,
            default_flags: StepFlags::NONE,
            dependency: None,
            dependency_key: None,
            dependents: Vec::new(),
            injects,
            status: SlotStatus::Active,
            token: 0,
            repeat_budget: None,
            failures: Vec::new(),
            condition: None,
            pending_calls: 0,
        }
    }

    pub(crate) fn migration(&self) -> Option<Arc<dyn MigrateCall>> {
        self.step
            .as_ref()
            .and_then(|s| s.migration.clone())
            .or_else(|| self.default_migration.clone())
    }

    pub(crate) fn error_handler(&self) -> Option<Arc<dyn FailureCall>> {
        self.step
            .as_ref()
            .and_then(|s| s.handler.clone())
            .or_else(|| self.default_handler.clone())
    }

    pub(crate) fn flags(&self) -> StepFlags {
        match &self.step {
            Some(s) => s.flags | self.default_flags,
            None => self.default_flags,
        }
    }

    /// Drop everything the previous machine configured.
    pub(crate) fn reset_for_replace(&mut self) {
        self.step = None;
        self.initialized = false;
        self.condition = None;
        self.default_migration = None;
        self.default_handler = None;
        self.default_flags = StepFlags::NONE;
        self.repeat_budget = None;
    }
}

impl fmt::Debug for SlotBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotBody")
            .field("machine", &self.sm.as_ref().map(|sm| sm.name()))
            .field("status", &self.status)
            .field("init_pending", &!self.initialized)
            .field("dependents", &self.dependents.len())
            .field("pending_calls", &self.pending_calls)
            .finish()
    }
}
