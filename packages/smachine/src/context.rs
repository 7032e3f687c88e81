//! Phase contexts handed to step functions.
//!
//! Each phase of a slot's life gets its own context type, and a context can
//! only build the updates its phase permits: construction sets up the slot,
//! execution may do almost anything, migration may only re-route the
//! affected step, barge-ins may jump, wake or stop, and error handlers decide
//! between stopping, resuming and replacing.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use tracing::Span;

use crate::bargein::{BargeInBuilder, BargeInParamFn};
use crate::call::AsyncCall;
use crate::dependency::release_dependency;
use crate::error::{BoxError, SlotError};
use crate::handle::{MachineId, MachineSync};
use crate::link::{SlotLink, StepLink};
use crate::machine::MachineCore;
use crate::shared::{SharedAccessReport, SharedDataAccessor, SharedDataLink};
use crate::slot::{SlotBody, SlotFailure};
use crate::step::{
    failure_call, migrate_call, BargeInApplyFn, CreateFn, ErrorHandlerFn, LocalInjects, MigrateFn,
    ShadowMigrate, SlotStep, StateFn, StateMachine, StepFlags, TypedBargeIn,
};
use crate::sync::Semaphore;
use crate::update::{ConditionalUpdate, Phase, SharedCheck, StateUpdate, UpdateKind, Wait};

/// Context of a construction function.
///
/// Construction may only set up the slot: its parent, its tracing span and
/// injected local values.
pub struct ConstructionContext<'a> {
    link: SlotLink,
    parent: SlotLink,
    span: Option<Span>,
    injects: LocalInjects,
    machine: &'a Arc<MachineSync>,
}

impl<'a> ConstructionContext<'a> {
    pub(crate) fn new(link: SlotLink, parent: SlotLink, machine: &'a Arc<MachineSync>) -> Self {
        Self {
            link,
            parent,
            span: None,
            injects: LocalInjects::default(),
            machine,
        }
    }

    /// The slot being constructed.
    pub fn slot_link(&self) -> SlotLink {
        self.link.clone()
    }

    pub fn parent_link(&self) -> SlotLink {
        self.parent.clone()
    }

    pub fn set_parent(&mut self, parent: SlotLink) {
        self.parent = parent;
    }

    /// Replace the slot's tracing span.
    pub fn set_span(&mut self, span: Span) {
        self.span = Some(span);
    }

    /// Inject a value visible only to the slot's own steps.
    pub fn inject<T: Any + Send>(&mut self, value: T) {
        self.injects.insert(value);
    }

    /// Inject a value that is told about every migration of the slot.
    pub fn inject_shadow<T: ShadowMigrate>(&mut self, value: T) {
        self.injects.insert_shadow(value);
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine.id()
    }

    pub(crate) fn into_parts(self) -> (SlotLink, Option<Span>, LocalInjects) {
        (self.parent, self.span, self.injects)
    }
}

/// Context of a regular step.
pub struct ExecutionContext<'a> {
    core: &'a mut MachineCore,
    slot: &'a mut SlotBody,
    link: StepLink,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(core: &'a mut MachineCore, slot: &'a mut SlotBody, link: StepLink) -> Self {
        Self { core, slot, link }
    }

    fn update(&self, kind: UpdateKind) -> StateUpdate {
        StateUpdate::new(Phase::Execution, kind)
    }

    fn conditional(&self, wait: Wait, available: bool) -> ConditionalUpdate {
        ConditionalUpdate::new(Phase::Execution, wait, available)
    }

    pub fn slot_link(&self) -> SlotLink {
        self.link.slot_link().clone()
    }

    /// Link to the step being executed.
    pub fn step_link(&self) -> StepLink {
        self.link.clone()
    }

    pub fn parent_link(&self) -> SlotLink {
        self.slot.parent.clone()
    }

    pub fn span(&self) -> &Span {
        &self.slot.span
    }

    pub fn machine_id(&self) -> MachineId {
        self.core.sync().id()
    }

    /// Number of migrations the machine has run.
    pub fn migration_count(&self) -> u32 {
        self.core.migration_count()
    }

    pub fn set_default_migration<M: StateMachine>(&mut self, migration: MigrateFn<M>) {
        self.slot.default_migration = Some(migrate_call(migration));
    }

    pub fn set_default_error_handler<M: StateMachine>(&mut self, handler: ErrorHandlerFn<M>) {
        self.slot.default_handler = Some(failure_call(handler));
    }

    pub fn set_default_flags(&mut self, flags: StepFlags) {
        self.slot.default_flags = flags;
    }

    /// Injected local value of type `T`.
    pub fn local<T: Any + Send>(&self) -> Option<&T> {
        self.slot.injects.get::<T>()
    }

    pub fn local_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.slot.injects.get_mut::<T>()
    }

    pub fn jump<M: StateMachine>(&mut self, step: StateFn<M>) -> StateUpdate {
        self.jump_ext(SlotStep::new(step))
    }

    pub fn jump_ext(&mut self, step: SlotStep) -> StateUpdate {
        self.update(UpdateKind::Jump(step))
    }

    /// Run the current step again, at most `limit` times in a row.
    pub fn repeat(&mut self, limit: u32) -> StateUpdate {
        self.update(UpdateKind::Repeat(limit))
    }

    /// Replace the machine in this slot; the new machine starts at `init`.
    pub fn replace(&mut self, create: CreateFn) -> StateUpdate {
        self.update(UpdateKind::Replace(create))
    }

    pub fn replace_with<M: StateMachine>(&mut self, sm: M) -> StateUpdate {
        self.update(UpdateKind::ReplaceWith(Box::new(sm)))
    }

    pub fn stop(&mut self) -> StateUpdate {
        self.update(UpdateKind::Stop)
    }

    /// Fail the slot with a user error.
    pub fn error<E: Into<BoxError>>(&mut self, err: E) -> StateUpdate {
        self.fail(SlotError::Step(err.into()))
    }

    pub(crate) fn fail(&mut self, err: SlotError) -> StateUpdate {
        self.update(UpdateKind::Error(err))
    }

    /// Let other ready slots run first.
    pub fn yield_now(&mut self) -> ConditionalUpdate {
        self.conditional(Wait::Yield, false)
    }

    /// Re-check after the polling period.
    pub fn poll(&mut self) -> ConditionalUpdate {
        self.conditional(Wait::Poll, false)
    }

    /// Sleep until woken by a barge-in, a wake-up or a released dependency.
    pub fn sleep(&mut self) -> ConditionalUpdate {
        self.conditional(Wait::Sleep, false)
    }

    /// Wait for any activation.
    pub fn wait_any(&mut self) -> ConditionalUpdate {
        self.conditional(Wait::Any, false)
    }

    /// Wait for any activation, at the latest until `deadline`.
    pub fn wait_any_until(&mut self, deadline: Instant) -> ConditionalUpdate {
        let available = deadline <= Instant::now();
        self.conditional(Wait::AnyUntil(deadline), available)
    }

    /// Wait until `target` advances to another step or stops.
    pub fn wait_activation(&mut self, target: &SlotLink) -> ConditionalUpdate {
        let available = !target.is_valid() || target == self.link.slot_link();
        self.conditional(Wait::Activation(target.clone()), available)
    }

    /// Wait until the shared cell can be used or its owner is gone.
    pub fn wait_shared<T: Send + 'static>(&mut self, link: &SharedDataLink<T>) -> ConditionalUpdate {
        let caller = self.link.slot_link().clone();
        let ready = |link: &SharedDataLink<T>, caller: &SlotLink| {
            let report = link.availability(Some(caller));
            report.is_available() || report.is_absent()
        };
        let available = ready(link, &caller);
        let cell = link.clone();
        let check = SharedCheck::new(move || ready(&cell, &caller));
        self.conditional(Wait::Shared(check), available)
    }

    /// Share `data` with other slots. The cell lives as long as this slot.
    pub fn share<T: Send + 'static>(&mut self, data: T, wakeup: bool) -> SharedDataLink<T> {
        SharedDataLink::new(self.link.any_step(), wakeup, data)
    }

    /// Run an accessor against its cell.
    pub fn use_shared<T, F>(&mut self, accessor: &mut SharedDataAccessor<'_, T, F>) -> SharedAccessReport
    where
        T: Send + 'static,
        F: FnMut(&mut T),
    {
        let (report, wake_owner) = accessor
            .link
            .access(Some(self.link.slot_link()), &mut accessor.f);
        if wake_owner {
            self.core.activate_link(&accessor.link.owner().any_step());
        }
        report
    }

    /// Construct a child slot; its init step runs on a later scan pass.
    ///
    /// Returns an empty link when the construction function panics.
    pub fn new_child(&mut self, create: CreateFn) -> SlotLink {
        match self.core.create_slot(create, self.link.slot_link().clone()) {
            Some((_, link)) => link,
            None => SlotLink::none(),
        }
    }

    /// Construct a child slot and run its init step before returning.
    pub fn init_child(&mut self, create: CreateFn) -> SlotLink {
        match self.core.create_slot(create, self.link.slot_link().clone()) {
            Some((index, link)) => {
                self.core.run_slot(index, link.slot_id());
                link
            }
            None => SlotLink::none(),
        }
    }

    /// Barge-in valid for any step of this slot.
    pub fn barge_in(&mut self) -> BargeInBuilder {
        BargeInBuilder::new(self.link.any_step(), self.link.step())
    }

    /// Barge-in rejected once this slot leaves the current step.
    pub fn barge_in_this_step_only(&mut self) -> BargeInBuilder {
        BargeInBuilder::new(self.link.clone(), self.link.step())
    }

    /// Barge-in that hands a parameter to `apply`.
    pub fn barge_in_with_param<M: StateMachine>(&mut self, apply: BargeInApplyFn<M>) -> BargeInParamFn {
        BargeInParamFn::new(
            self.link.any_step(),
            self.link.step(),
            Arc::new(TypedBargeIn(apply)),
        )
    }

    /// Acquire a permit of `semaphore`.
    ///
    /// Returns false when the slot was queued; it is woken once granted.
    /// A slot holds at most one semaphore: acquiring another releases the
    /// previous one.
    pub fn acquire(&mut self, semaphore: &Semaphore) -> bool {
        let key = semaphore.key();
        if self.slot.dependency_key != Some(key) {
            self.release_all();
            self.slot.dependency = Some(semaphore.dependency(self.link.slot_link().clone()));
            self.slot.dependency_key = Some(key);
        }
        semaphore.acquire(self.link.any_step())
    }

    /// Release whatever this slot holds. Returns false when it held nothing.
    pub fn release_all(&mut self) -> bool {
        if self.slot.dependency.is_none() {
            return false;
        }
        let woken = release_dependency(&mut self.slot.dependency);
        if self.slot.dependency.is_none() {
            self.slot.dependency_key = None;
        }
        for link in &woken {
            self.core.activate_link(link);
        }
        true
    }

    /// Change the limit of `semaphore`, waking any waiters it grants.
    pub fn adjust_semaphore(&mut self, semaphore: &Semaphore, limit: usize) {
        for link in semaphore.set_limit(limit) {
            self.core.activate_link(&link);
        }
    }

    /// Failures reported by children since the last call.
    pub fn take_child_failures(&mut self) -> Vec<SlotFailure> {
        std::mem::take(&mut self.slot.failures)
    }

    /// Start an async call. The slot counts it as pending until the call
    /// is completed or dropped.
    pub fn async_call(&mut self) -> AsyncCall {
        self.slot.pending_calls += 1;
        AsyncCall::new(self.link.any_step())
    }

    /// Async calls started by this slot that have not delivered a result.
    pub fn pending_call_count(&self) -> usize {
        self.slot.pending_calls
    }
}

/// Context of a migration handler.
pub struct MigrationContext<'a> {
    core: &'a mut MachineCore,
    slot: &'a mut SlotBody,
    link: StepLink,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(core: &'a mut MachineCore, slot: &'a mut SlotBody, link: StepLink) -> Self {
        Self { core, slot, link }
    }

    fn update(&self, kind: UpdateKind) -> StateUpdate {
        StateUpdate::new(Phase::Migration, kind)
    }

    /// The step that was current when the migration started.
    pub fn affected_step(&self) -> StepLink {
        self.link.clone()
    }

    pub fn slot_link(&self) -> SlotLink {
        self.link.slot_link().clone()
    }

    pub fn parent_link(&self) -> SlotLink {
        self.slot.parent.clone()
    }

    pub fn migration_count(&self) -> u32 {
        self.core.migration_count()
    }

    pub fn set_default_migration<M: StateMachine>(&mut self, migration: MigrateFn<M>) {
        self.slot.default_migration = Some(migrate_call(migration));
    }

    pub fn set_default_error_handler<M: StateMachine>(&mut self, handler: ErrorHandlerFn<M>) {
        self.slot.default_handler = Some(failure_call(handler));
    }

    pub fn set_default_flags(&mut self, flags: StepFlags) {
        self.slot.default_flags = flags;
    }

    pub fn local<T: Any + Send>(&self) -> Option<&T> {
        self.slot.injects.get::<T>()
    }

    pub fn local_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.slot.injects.get_mut::<T>()
    }

    pub fn share<T: Send + 'static>(&mut self, data: T, wakeup: bool) -> SharedDataLink<T> {
        SharedDataLink::new(self.link.any_step(), wakeup, data)
    }

    /// Leave the slot where it is.
    pub fn stay(&mut self) -> StateUpdate {
        self.update(UpdateKind::Stay)
    }

    /// Keep the step, but run it on the next scan pass.
    pub fn wake_up(&mut self) -> StateUpdate {
        self.update(UpdateKind::WakeUp)
    }

    pub fn jump<M: StateMachine>(&mut self, step: StateFn<M>) -> StateUpdate {
        self.jump_ext(SlotStep::new(step))
    }

    pub fn jump_ext(&mut self, step: SlotStep) -> StateUpdate {
        self.update(UpdateKind::Jump(step))
    }

    pub fn replace(&mut self, create: CreateFn) -> StateUpdate {
        self.update(UpdateKind::Replace(create))
    }

    pub fn replace_with<M: StateMachine>(&mut self, sm: M) -> StateUpdate {
        self.update(UpdateKind::ReplaceWith(Box::new(sm)))
    }

    pub fn stop(&mut self) -> StateUpdate {
        self.update(UpdateKind::Stop)
    }

    pub fn error<E: Into<BoxError>>(&mut self, err: E) -> StateUpdate {
        self.fail(SlotError::Step(err.into()))
    }

    pub(crate) fn fail(&mut self, err: SlotError) -> StateUpdate {
        self.update(UpdateKind::Error(err))
    }
}

/// Context of a barge-in continuation.
pub struct BargeInContext<'a> {
    slot: &'a mut SlotBody,
    link: StepLink,
    origin: u32,
    param: Option<Box<dyn Any + Send>>,
}

impl<'a> BargeInContext<'a> {
    pub(crate) fn new(
        slot: &'a mut SlotBody,
        link: StepLink,
        origin: u32,
        param: Option<Box<dyn Any + Send>>,
    ) -> Self {
        Self {
            slot,
            link,
            origin,
            param,
        }
    }

    fn update(&self, kind: UpdateKind) -> StateUpdate {
        StateUpdate::new(Phase::BargeIn, kind)
    }

    /// The parameter passed to the barge-in, if it has type `P`.
    pub fn param<P: Any>(&self) -> Option<&P> {
        self.param.as_ref().and_then(|p| p.downcast_ref::<P>())
    }

    /// Take the parameter out, if it has type `P`.
    pub fn take_param<P: Any>(&mut self) -> Option<P> {
        match self.param.take()?.downcast::<P>() {
            Ok(p) => Some(*p),
            Err(other) => {
                self.param = Some(other);
                None
            }
        }
    }

    /// True when the slot is still at the step that created the barge-in.
    pub fn is_at_original_step(&self) -> bool {
        self.link.step() == self.origin
    }

    pub fn affected_step(&self) -> StepLink {
        self.link.clone()
    }

    pub fn local<T: Any + Send>(&self) -> Option<&T> {
        self.slot.injects.get::<T>()
    }

    pub fn local_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.slot.injects.get_mut::<T>()
    }

    pub fn jump<M: StateMachine>(&mut self, step: StateFn<M>) -> StateUpdate {
        self.jump_ext(SlotStep::new(step))
    }

    pub fn jump_ext(&mut self, step: SlotStep) -> StateUpdate {
        self.update(UpdateKind::Jump(step))
    }

    pub fn stay(&mut self) -> StateUpdate {
        self.update(UpdateKind::Stay)
    }

    pub fn wake_up(&mut self) -> StateUpdate {
        self.update(UpdateKind::WakeUp)
    }

    pub fn stop(&mut self) -> StateUpdate {
        self.update(UpdateKind::Stop)
    }

    pub fn error<E: Into<BoxError>>(&mut self, err: E) -> StateUpdate {
        self.fail(SlotError::Step(err.into()))
    }

    pub(crate) fn fail(&mut self, err: SlotError) -> StateUpdate {
        self.update(UpdateKind::Error(err))
    }
}

/// Context of an error handler.
pub struct FailureContext<'a> {
    core: &'a mut MachineCore,
    slot: &'a mut SlotBody,
    link: StepLink,
    error: &'a SlotError,
}

impl<'a> FailureContext<'a> {
    pub(crate) fn new(
        core: &'a mut MachineCore,
        slot: &'a mut SlotBody,
        link: StepLink,
        error: &'a SlotError,
    ) -> Self {
        Self {
            core,
            slot,
            link,
            error,
        }
    }

    fn update(&self, kind: UpdateKind) -> StateUpdate {
        StateUpdate::new(Phase::Failure, kind)
    }

    /// The step that failed.
    pub fn affected_step(&self) -> StepLink {
        self.link.clone()
    }

    pub fn parent_link(&self) -> SlotLink {
        self.slot.parent.clone()
    }

    pub fn error(&self) -> &SlotError {
        self.error
    }

    pub fn is_panic(&self) -> bool {
        self.error.is_panic()
    }

    pub fn local<T: Any + Send>(&self) -> Option<&T> {
        self.slot.injects.get::<T>()
    }

    /// Construct a child slot, e.g. to report or compensate the failure.
    pub fn new_child(&mut self, create: CreateFn) -> SlotLink {
        match self.core.create_slot(create, self.link.slot_link().clone()) {
            Some((_, link)) => link,
            None => SlotLink::none(),
        }
    }

    /// Construct a child slot and run its init step before returning.
    pub fn init_child(&mut self, create: CreateFn) -> SlotLink {
        match self.core.create_slot(create, self.link.slot_link().clone()) {
            Some((index, link)) => {
                self.core.run_slot(index, link.slot_id());
                link
            }
            None => SlotLink::none(),
        }
    }

    /// Stop the slot; the failure is reported to the parent.
    pub fn stop(&mut self) -> StateUpdate {
        self.update(UpdateKind::Stop)
    }

    /// Suppress the failure and run the failed step again.
    pub fn resume(&mut self) -> StateUpdate {
        self.update(UpdateKind::WakeUp)
    }

    pub fn replace(&mut self, create: CreateFn) -> StateUpdate {
        self.update(UpdateKind::Replace(create))
    }

    pub fn replace_with<M: StateMachine>(&mut self, sm: M) -> StateUpdate {
        self.update(UpdateKind::ReplaceWith(Box::new(sm)))
    }
}
