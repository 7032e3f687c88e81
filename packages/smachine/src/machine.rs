//! The slot arena and its scan algorithm.
//!
//! Slots live in fixed-size pages and are addressed by index. Each index has
//! a long-lived [`SlotHeader`] whose generation changes whenever the slot is
//! recycled, so links into the arena never need a lock to validate.
//!
//! A scan pass drains the command queue, moves due pollers into the active
//! queue and then runs one step for each active slot, up to the configured
//! budget. The outcome of a step decides where the slot goes next.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, debug_span, trace, warn, Span};

use crate::bargein::{BargeInAction, BargeInCommand};
use crate::call::{AsyncResultContext, AsyncResultFn};
use crate::config::SlotMachineConfig;
use crate::context::{
    BargeInContext, ConstructionContext, ExecutionContext, FailureContext, MigrationContext,
};
use crate::dependency::release_dependency;
use crate::error::{ConfigError, Result, SlotError};
use crate::handle::{Command, MachineHandle, MachineId, MachineSync};
use crate::link::{next_step_no, SlotHeader, SlotId, SlotLink, StepLink};
use crate::slot::{SlotBody, SlotFailure, SlotStatus};
use crate::step::{CreateFn, SlotStep, StateMachine, StepFlags};
use crate::update::{Phase, StateUpdate, Then, UpdateKind, Wait, WaitCondition};
use crate::worker::{ScanReport, Scannable, SlotWorker, WorkerSignal};

/// Upper bound on chained dependency replacements released at stop.
const MAX_RELEASE_ROUNDS: usize = 16;

struct SlotEntry {
    header: Arc<SlotHeader>,
    /// `None` while the slot runs or when the index is free.
    body: Option<SlotBody>,
}

struct SlotTable {
    page_size: usize,
    pages: Vec<Vec<SlotEntry>>,
    free: Vec<u32>,
    occupied: usize,
}

impl SlotTable {
    fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Vec::new(),
            free: Vec::new(),
            occupied: 0,
        }
    }

    fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / self.page_size, index % self.page_size)
    }

    fn get(&self, index: u32) -> Option<&SlotEntry> {
        let (page, offset) = self.locate(index);
        self.pages.get(page)?.get(offset)
    }

    fn get_mut(&mut self, index: u32) -> Option<&mut SlotEntry> {
        let (page, offset) = self.locate(index);
        self.pages.get_mut(page)?.get_mut(offset)
    }

    fn allocate(&mut self, sync: &Arc<MachineSync>) -> Arc<SlotHeader> {
        self.occupied += 1;
        if let Some(index) = self.free.pop() {
            if let Some(entry) = self.get(index) {
                return entry.header.clone();
            }
        }
        let needs_page = self
            .pages
            .last()
            .map_or(true, |page| page.len() >= self.page_size);
        if needs_page {
            self.pages.push(Vec::with_capacity(self.page_size));
        }
        let index = ((self.pages.len() - 1) * self.page_size) as u32
            + self.pages.last().map_or(0, Vec::len) as u32;
        let header = Arc::new(SlotHeader::new(index, sync.clone()));
        if let Some(page) = self.pages.last_mut() {
            page.push(SlotEntry {
                header: header.clone(),
                body: None,
            });
        }
        header
    }

    fn release(&mut self, index: u32) {
        self.occupied = self.occupied.saturating_sub(1);
        self.free.push(index);
    }

    /// `(index, id)` of every live slot.
    fn live(&self) -> Vec<(u32, SlotId)> {
        self.pages
            .iter()
            .flatten()
            .filter_map(|entry| {
                let (id, _, _) = entry.header.state();
                (!id.is_unknown()).then(|| (entry.header.index(), id))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    index: u32,
    id: SlotId,
    token: u64,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PollEntry {
    at: Instant,
    seq: u64,
    slot: Scheduled,
}

/// Run a user function for a slot: busy flag set, span entered, panics caught.
fn guarded<F>(header: &SlotHeader, span: &Span, phase: Phase, f: F) -> UpdateKind
where
    F: FnOnce() -> StateUpdate,
{
    header.set_busy(true);
    let result = {
        let _entered = span.enter();
        catch_unwind(AssertUnwindSafe(f))
    };
    header.set_busy(false);
    match result {
        Ok(update) => update.checked(phase),
        Err(payload) => UpdateKind::Error(SlotError::from_panic(payload)),
    }
}

pub(crate) struct MachineCore {
    config: SlotMachineConfig,
    sync: Arc<MachineSync>,
    slots: SlotTable,
    active: VecDeque<Scheduled>,
    polls: BinaryHeap<Reverse<PollEntry>>,
    poll_seq: u64,
    last_id: u32,
    migration_count: u32,
    epoch: Instant,
}

impl MachineCore {
    pub(crate) fn sync(&self) -> &Arc<MachineSync> {
        &self.sync
    }

    pub(crate) fn migration_count(&self) -> u32 {
        self.migration_count
    }

    fn next_slot_id(&mut self) -> SlotId {
        self.last_id = self.last_id.wrapping_add(1);
        if self.last_id == 0 {
            self.last_id = 1;
        }
        SlotId::new(self.last_id)
    }

    fn is_local(&self, header: &SlotHeader) -> bool {
        Arc::ptr_eq(header.machine(), &self.sync)
    }

    fn is_current(&self, slot: &Scheduled) -> bool {
        match self.slots.get(slot.index) {
            Some(entry) => {
                entry.header.state().0 == slot.id
                    && entry.body.as_ref().is_some_and(|b| b.token == slot.token)
            }
            None => false,
        }
    }

    fn take_body(&mut self, index: u32, id: SlotId) -> Option<(Arc<SlotHeader>, SlotBody)> {
        let entry = self.slots.get_mut(index)?;
        if entry.header.state().0 != id {
            return None;
        }
        let body = entry.body.take()?;
        Some((entry.header.clone(), body))
    }

    fn put_back(&mut self, index: u32, body: SlotBody) {
        if let Some(entry) = self.slots.get_mut(index) {
            entry.body = Some(body);
        }
    }

    fn current_link(header: &Arc<SlotHeader>, id: SlotId) -> StepLink {
        let (_, step, _) = header.state();
        StepLink::new(SlotLink::new(id, header.clone()), step)
    }

    fn enqueue(&mut self, index: u32, id: SlotId, body: &mut SlotBody, priority: bool) {
        body.token += 1;
        body.condition = None;
        body.status = SlotStatus::Active;
        let entry = Scheduled {
            index,
            id,
            token: body.token,
        };
        if priority {
            self.active.push_front(entry);
        } else {
            self.active.push_back(entry);
        }
    }

    fn schedule_at(
        &mut self,
        index: u32,
        id: SlotId,
        body: &mut SlotBody,
        at: Instant,
        status: SlotStatus,
    ) {
        body.token += 1;
        body.status = status;
        self.poll_seq += 1;
        self.polls.push(Reverse(PollEntry {
            at,
            seq: self.poll_seq,
            slot: Scheduled {
                index,
                id,
                token: body.token,
            },
        }));
    }

    /// Drop the slot from every schedule until something wakes it.
    fn park(body: &mut SlotBody, status: SlotStatus) {
        body.token += 1;
        body.status = status;
    }

    /// Allocate a slot and run its construction function.
    pub(crate) fn create_slot(
        &mut self,
        create: CreateFn,
        parent: SlotLink,
    ) -> Option<(u32, SlotLink)> {
        let header = self.slots.allocate(&self.sync);
        let index = header.index();
        let id = self.next_slot_id();
        header.activate(id);
        let link = SlotLink::new(id, header.clone());

        let mut cctx = ConstructionContext::new(link.clone(), parent, &self.sync);
        let sm = match catch_unwind(AssertUnwindSafe(|| create(&mut cctx))) {
            Ok(sm) => sm,
            Err(payload) => {
                let error = SlotError::from_panic(payload);
                warn!(machine = %self.sync.id(), slot = %id, %error, "slot construction failed");
                header.retire();
                self.slots.release(index);
                return None;
            }
        };
        let (parent, span, injects) = cctx.into_parts();
        let span = span.unwrap_or_else(
            || debug_span!("slot", machine = %self.sync.id(), slot = %id, sm = sm.name()),
        );
        debug!(parent: &span, parent_slot = %parent.slot_id(), "slot created");

        let mut body = SlotBody::new(parent, span, injects);
        body.sm = Some(sm);
        self.enqueue(index, id, &mut body, false);
        self.put_back(index, body);
        Some((index, link))
    }

    /// Run the current step of a slot and apply its outcome.
    pub(crate) fn run_slot(&mut self, index: u32, id: SlotId) -> bool {
        let Some((header, mut body)) = self.take_body(index, id) else {
            return false;
        };
        let Some(mut sm) = body.sm.take() else {
            self.put_back(index, body);
            return false;
        };
        let link = Self::current_link(&header, id);
        let span = body.span.clone();
        let step = body.step.clone();
        if step.is_none() {
            body.initialized = true;
        }

        let kind = guarded(&header, &span, Phase::Execution, || {
            let mut ctx = ExecutionContext::new(self, &mut body, link.clone());
            match &step {
                Some(step) => step.transition.call(&mut *sm, &mut ctx),
                None => sm.init(&mut ctx),
            }
        });
        body.sm = Some(sm);
        self.apply(index, body, link, kind, Phase::Execution);
        true
    }

    /// Move a slot according to an update. Takes ownership of the body and
    /// either returns it to the table or retires the slot.
    fn apply(&mut self, index: u32, mut body: SlotBody, link: StepLink, kind: UpdateKind, phase: Phase) {
        let id = link.slot_id();
        let Some(header) = link.header().cloned() else {
            return;
        };
        match kind {
            UpdateKind::Jump(step) => {
                self.jump_to(&header, &mut body, step);
                let priority = body.flags().contains(StepFlags::PRIORITY);
                self.enqueue(index, id, &mut body, priority);
            }
            UpdateKind::Replace(create) => {
                let mut cctx =
                    ConstructionContext::new(link.slot_link().clone(), body.parent.clone(), &self.sync);
                match catch_unwind(AssertUnwindSafe(|| create(&mut cctx))) {
                    Ok(sm) => {
                        let (parent, span, injects) = cctx.into_parts();
                        body.parent = parent;
                        if let Some(span) = span {
                            body.span = span;
                        }
                        body.injects.extend(injects);
                        self.install(&header, index, id, &mut body, sm);
                    }
                    Err(payload) => {
                        drop(cctx);
                        return self.fail(index, body, link, SlotError::from_panic(payload), phase);
                    }
                }
            }
            UpdateKind::ReplaceWith(sm) => self.install(&header, index, id, &mut body, sm),
            UpdateKind::Repeat(limit) => {
                let remaining = body.repeat_budget.unwrap_or(limit);
                if remaining == 0 {
                    return self.fail(index, body, link, SlotError::RepeatLimit { limit }, phase);
                }
                body.repeat_budget = Some(remaining - 1);
                let priority = body.flags().contains(StepFlags::PRIORITY);
                self.enqueue(index, id, &mut body, priority);
            }
            UpdateKind::Stay => {}
            UpdateKind::WakeUp => {
                let priority = body.flags().contains(StepFlags::PRIORITY);
                self.enqueue(index, id, &mut body, priority);
            }
            UpdateKind::Stop => return self.retire(index, body, None),
            UpdateKind::Error(error) => return self.fail(index, body, link, error, phase),
            UpdateKind::Wait { wait, then } => {
                if let Then::Jump(step) = then {
                    self.jump_to(&header, &mut body, step);
                }
                self.place(index, id, &header, &mut body, wait);
            }
        }
        self.put_back(index, body);
    }

    fn install(
        &mut self,
        header: &Arc<SlotHeader>,
        index: u32,
        id: SlotId,
        body: &mut SlotBody,
        sm: Box<dyn StateMachine>,
    ) {
        debug!(parent: &body.span, sm = sm.name(), "slot replaced");
        body.sm = Some(sm);
        body.reset_for_replace();
        self.advance_step(header, body);
        self.enqueue(index, id, body, false);
    }

    fn jump_to(&mut self, header: &SlotHeader, body: &mut SlotBody, step: SlotStep) {
        body.step = Some(step);
        body.repeat_budget = None;
        self.advance_step(header, body);
    }

    /// Bump the step counter and wake everyone waiting for this slot.
    fn advance_step(&mut self, header: &SlotHeader, body: &mut SlotBody) {
        let (_, step, _) = header.state();
        header.set_step(next_step_no(step));
        for link in std::mem::take(&mut body.dependents) {
            self.activate_link(&link);
        }
    }

    fn place(&mut self, index: u32, id: SlotId, header: &Arc<SlotHeader>, body: &mut SlotBody, wait: Wait) {
        let priority = body.flags().contains(StepFlags::PRIORITY);
        body.condition = None;
        match wait {
            Wait::Ready => self.enqueue(index, id, body, priority),
            Wait::Yield => self.enqueue(index, id, body, false),
            Wait::Poll => {
                let at = self.config.poll_deadline(self.epoch, Instant::now());
                self.schedule_at(index, id, body, at, SlotStatus::Polling);
            }
            Wait::Shared(check) => {
                let at = self.config.poll_deadline(self.epoch, Instant::now());
                self.schedule_at(index, id, body, at, SlotStatus::Polling);
                body.condition = Some(WaitCondition::Shared(check));
            }
            Wait::Sleep | Wait::Any => Self::park(body, SlotStatus::Sleeping),
            Wait::AnyUntil(deadline) => {
                if deadline <= Instant::now() {
                    self.enqueue(index, id, body, priority);
                } else {
                    let at = self.config.truncate(self.epoch, deadline);
                    self.schedule_at(index, id, body, at, SlotStatus::Sleeping);
                }
            }
            Wait::Activation(target) => {
                let waiter = Self::current_link(header, id);
                if !target.is_valid() || &target == waiter.slot_link() {
                    return self.enqueue(index, id, body, priority);
                }
                let local = target
                    .header()
                    .filter(|h| Arc::ptr_eq(h.machine(), &self.sync))
                    .map(|h| h.index());
                let target_body = local
                    .and_then(|i| self.slots.get_mut(i))
                    .and_then(|e| e.body.as_mut());
                match target_body {
                    Some(target_body) => {
                        if !target_body.dependents.contains(&waiter) {
                            target_body.dependents.push(waiter);
                        }
                        Self::park(body, SlotStatus::Waiting);
                    }
                    None => {
                        let at = self.config.poll_deadline(self.epoch, Instant::now());
                        self.schedule_at(index, id, body, at, SlotStatus::Polling);
                    }
                }
                body.condition = Some(WaitCondition::Advanced(target.current_step()));
            }
        }
    }

    /// True when the slot is not parked on a condition or the condition holds.
    fn is_ready(body: &SlotBody) -> bool {
        body.condition.as_ref().map_or(true, WaitCondition::holds)
    }

    /// Wake a slot if it is still at the linked step and its wait condition,
    /// if any, holds.
    pub(crate) fn activate_link(&mut self, link: &StepLink) {
        let Some(header) = link.header() else {
            return;
        };
        if !self.is_local(header) {
            header.machine().push(Command::WakeUp(link.clone()));
            return;
        }
        if !link.is_at_step() {
            return;
        }
        let index = header.index();
        let id = link.slot_id();
        match self.take_body(index, id) {
            Some((_, mut body)) => {
                if body.status != SlotStatus::Active && Self::is_ready(&body) {
                    let priority = body.flags().contains(StepFlags::PRIORITY);
                    self.enqueue(index, id, &mut body, priority);
                }
                self.put_back(index, body);
            }
            // The slot is running; retry once it is back in the table.
            None => {
                self.sync.push(Command::WakeUp(link.clone()));
            }
        }
    }

    fn fail(&mut self, index: u32, body: SlotBody, link: StepLink, error: SlotError, phase: Phase) {
        if phase == Phase::Failure {
            self.retire(index, body, Some(error));
        } else {
            self.handle_failure(index, body, link, error);
        }
    }

    fn handle_failure(&mut self, index: u32, mut body: SlotBody, link: StepLink, error: SlotError) {
        let Some(handler) = body.error_handler() else {
            return self.retire(index, body, Some(error));
        };
        let Some(mut sm) = body.sm.take() else {
            return self.retire(index, body, Some(error));
        };
        let Some(header) = link.header().cloned() else {
            return;
        };
        let span = body.span.clone();
        debug!(parent: &span, %error, "running error handler");

        let kind = guarded(&header, &span, Phase::Failure, || {
            let mut ctx = FailureContext::new(self, &mut body, link.clone(), &error);
            handler.call(&mut *sm, &mut ctx)
        });
        body.sm = Some(sm);
        match kind {
            UpdateKind::Stop => self.retire(index, body, Some(error)),
            kind => self.apply(index, body, link, kind, Phase::Failure),
        }
    }

    /// Release everything the slot holds, report a failure and recycle the
    /// index. Outstanding links become invalid.
    fn retire(&mut self, index: u32, mut body: SlotBody, failure: Option<SlotError>) {
        let Some(header) = self.slots.get(index).map(|e| e.header.clone()) else {
            return;
        };
        let (id, _, _) = header.state();
        let mut woken = Vec::new();
        for _ in 0..MAX_RELEASE_ROUNDS {
            if body.dependency.is_none() {
                break;
            }
            woken.extend(release_dependency(&mut body.dependency));
        }
        body.dependency_key = None;
        woken.append(&mut body.dependents);

        let span = body.span.clone();
        let parent = body.parent.clone();
        header.retire();
        drop(body);
        self.slots.release(index);

        match failure {
            Some(error) => {
                warn!(parent: &span, %error, "slot failed");
                let failure = SlotFailure {
                    child: SlotLink::new(id, header),
                    error: Arc::new(error),
                };
                self.notify_parent(&parent, failure);
            }
            None => debug!(parent: &span, "slot stopped"),
        }
        for link in woken {
            self.activate_link(&link);
        }
    }

    fn notify_parent(&mut self, parent: &SlotLink, failure: SlotFailure) {
        if !parent.is_valid() {
            return;
        }
        let Some(header) = parent.header() else {
            return;
        };
        if !self.is_local(header) {
            header.machine().push(Command::ChildFailed {
                parent: parent.clone(),
                failure,
            });
            return;
        }
        match self
            .slots
            .get_mut(header.index())
            .and_then(|e| e.body.as_mut())
        {
            Some(body) => {
                body.failures.push(failure);
                self.activate_link(&StepLink::new(parent.clone(), 0));
            }
            None => {
                self.sync.push(Command::ChildFailed {
                    parent: parent.clone(),
                    failure,
                });
            }
        }
    }

    fn apply_barge_in(&mut self, command: BargeInCommand) {
        let BargeInCommand {
            target,
            origin,
            action,
        } = command;
        if !target.is_at_step() {
            trace!(link = ?target, "stale barge-in dropped");
            return;
        }
        let Some(header) = target.header().cloned() else {
            return;
        };
        if !self.is_local(&header) {
            return;
        }
        let index = header.index();
        let id = target.slot_id();
        let Some((_, mut body)) = self.take_body(index, id) else {
            return;
        };
        let link = Self::current_link(&header, id);

        let kind = match action {
            BargeInAction::Jump(step) => UpdateKind::Jump(step),
            BargeInAction::WakeUp => UpdateKind::WakeUp,
            BargeInAction::Stop => UpdateKind::Stop,
            BargeInAction::Apply { call, param } => {
                let Some(mut sm) = body.sm.take() else {
                    return self.put_back(index, body);
                };
                let span = body.span.clone();
                let kind = guarded(&header, &span, Phase::BargeIn, || {
                    let mut ctx = BargeInContext::new(&mut body, link.clone(), origin, param);
                    call.call(&mut *sm, &mut ctx)
                });
                body.sm = Some(sm);
                kind
            }
        };
        self.apply(index, body, link, kind, Phase::BargeIn);
    }

    fn apply_async_result(&mut self, target: &StepLink, result: Option<AsyncResultFn>) {
        let Some(header) = target.header().cloned() else {
            return;
        };
        if !target.is_at_step() || !self.is_local(&header) {
            return;
        }
        let index = header.index();
        let id = target.slot_id();
        let Some((_, mut body)) = self.take_body(index, id) else {
            return;
        };
        body.pending_calls = body.pending_calls.saturating_sub(1);
        let Some(result) = result else {
            return self.put_back(index, body);
        };
        let Some(mut sm) = body.sm.take() else {
            return self.put_back(index, body);
        };
        let link = Self::current_link(&header, id);
        let span = body.span.clone();
        header.set_busy(true);
        let outcome = {
            let _entered = span.enter();
            catch_unwind(AssertUnwindSafe(|| {
                let mut ctx = AsyncResultContext::new(&mut body, link.slot_link().clone());
                let applied = result(&mut *sm, &mut ctx);
                applied.map(|()| ctx.wakes())
            }))
        };
        header.set_busy(false);
        body.sm = Some(sm);
        match outcome {
            Ok(Ok(true)) => {
                if body.status != SlotStatus::Active {
                    let priority = body.flags().contains(StepFlags::PRIORITY);
                    self.enqueue(index, id, &mut body, priority);
                }
                self.put_back(index, body);
            }
            Ok(Ok(false)) => self.put_back(index, body),
            Ok(Err(error)) => self.handle_failure(index, body, link, error),
            Err(payload) => self.handle_failure(index, body, link, SlotError::from_panic(payload)),
        }
    }

    fn process_commands(&mut self) -> usize {
        let commands = self.sync.drain();
        let count = commands.len();
        for command in commands {
            match command {
                Command::AddInput { create } => {
                    self.create_slot(create, SlotLink::none());
                }
                Command::WakeUp(link) => self.activate_link(&link),
                Command::BargeIn(command) => self.apply_barge_in(command),
                Command::ChildFailed { parent, failure } => self.notify_parent(&parent, failure),
                Command::AsyncResult { target, result } => self.apply_async_result(&target, result),
            }
        }
        count
    }

    fn release_due_polls(&mut self, now: Instant) {
        while let Some(Reverse(top)) = self.polls.peek() {
            if top.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.polls.pop() else {
                break;
            };
            if !self.is_current(&entry.slot) {
                continue;
            }
            let Scheduled { index, id, .. } = entry.slot;
            if let Some((_, mut body)) = self.take_body(index, id) {
                if Self::is_ready(&body) {
                    let priority = body.flags().contains(StepFlags::PRIORITY);
                    self.enqueue(index, id, &mut body, priority);
                } else {
                    let at = self.config.poll_deadline(self.epoch, now);
                    let status = body.status;
                    self.schedule_at(index, id, &mut body, at, status);
                }
                self.put_back(index, body);
            }
        }
    }

    fn next_poll_time(&mut self) -> Option<Instant> {
        while let Some(Reverse(top)) = self.polls.peek() {
            let (at, slot) = (top.at, top.slot);
            if self.is_current(&slot) {
                return Some(at);
            }
            self.polls.pop();
        }
        None
    }

    fn prune_active(&mut self) {
        while let Some(front) = self.active.front().copied() {
            if self.is_current(&front) {
                break;
            }
            self.active.pop_front();
        }
    }

    fn scan_once(&mut self, worker: &SlotWorker) -> ScanReport {
        if self.sync.is_stopped() {
            return ScanReport::idle();
        }
        self.process_commands();
        self.release_due_polls(Instant::now());

        let pass_len = self.active.len();
        let mut visited = 0;
        let mut advanced = 0;
        while advanced < self.config.scan_count_limit && visited < pass_len {
            let Some(next) = self.active.pop_front() else {
                break;
            };
            visited += 1;
            if self.is_current(&next) && self.run_slot(next.index, next.id) {
                advanced += 1;
            }
        }

        self.prune_active();
        let report = ScanReport {
            repeat_now: !self.active.is_empty() || self.sync.has_commands(),
            next_poll_time: self.next_poll_time(),
            advanced,
        };
        trace!(
            worker = worker.id().0,
            machine = %self.sync.id(),
            advanced,
            ready = self.active.len(),
            "scan pass"
        );
        report
    }

    fn run_pending_inits(&mut self) -> usize {
        self.process_commands();
        let mut ran = 0;
        for (index, id) in self.slots.live() {
            let pending = self
                .slots
                .get(index)
                .and_then(|e| e.body.as_ref())
                .is_some_and(|b| !b.initialized);
            if pending && self.run_slot(index, id) {
                ran += 1;
            }
        }
        ran
    }

    fn migrate(&mut self) -> usize {
        self.migration_count = self.migration_count.wrapping_add(1);
        let mut migrated = 0;
        let count = self.migration_count;
        for (index, id) in self.slots.live() {
            let Some((header, mut body)) = self.take_body(index, id) else {
                continue;
            };
            let Some(mut sm) = body.sm.take() else {
                self.put_back(index, body);
                continue;
            };
            let link = Self::current_link(&header, id);
            let span = body.span.clone();
            let shadow = {
                let _entered = span.enter();
                catch_unwind(AssertUnwindSafe(|| {
                    body.injects.shadow_migrate(count);
                    sm.shadow_migrate(count);
                }))
            };
            if let Err(payload) = shadow {
                body.sm = Some(sm);
                self.fail(index, body, link, SlotError::from_panic(payload), Phase::Migration);
                continue;
            }
            let Some(migration) = body.migration() else {
                body.sm = Some(sm);
                self.put_back(index, body);
                continue;
            };
            let kind = guarded(&header, &span, Phase::Migration, || {
                let mut ctx = MigrationContext::new(self, &mut body, link.clone());
                migration.call(&mut *sm, &mut ctx)
            });
            body.sm = Some(sm);
            self.apply(index, body, link, kind, Phase::Migration);
            migrated += 1;
        }
        debug!(
            machine = %self.sync.id(),
            migration = self.migration_count,
            migrated,
            "migration"
        );
        migrated
    }

    fn stop_all(&mut self) -> usize {
        let live = self.slots.live();
        for &(index, id) in &live {
            if let Some((_, body)) = self.take_body(index, id) {
                self.retire(index, body, None);
            }
        }
        self.active.clear();
        self.polls.clear();
        live.len()
    }
}

/// An arena of slots driven by one worker at a time.
pub struct SlotMachine {
    core: MachineCore,
}

impl SlotMachine {
    /// Create a machine with its own worker signal.
    pub fn new(config: SlotMachineConfig) -> std::result::Result<Self, ConfigError> {
        Self::with_signal(config, WorkerSignal::new())
    }

    /// Create a machine that raises `signal` when commands arrive.
    pub fn with_signal(
        config: SlotMachineConfig,
        signal: WorkerSignal,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let slots = SlotTable::new(config.slot_page_size);
        Ok(Self {
            core: MachineCore {
                config,
                sync: MachineSync::new(signal),
                slots,
                active: VecDeque::new(),
                polls: BinaryHeap::new(),
                poll_seq: 0,
                last_id: 0,
                migration_count: 0,
                epoch: Instant::now(),
            },
        })
    }

    pub fn id(&self) -> MachineId {
        self.core.sync.id()
    }

    pub fn config(&self) -> &SlotMachineConfig {
        &self.core.config
    }

    /// Thread-safe handle for queuing inputs and wake-ups.
    pub fn handle(&self) -> MachineHandle {
        MachineHandle::new(self.core.sync.clone())
    }

    /// Construct a root slot now. Its init step runs on the next scan pass.
    ///
    /// Returns an empty link when the construction function panics.
    pub fn add_new(&mut self, create: CreateFn) -> SlotLink {
        match self.core.create_slot(create, SlotLink::none()) {
            Some((_, link)) => link,
            None => SlotLink::none(),
        }
    }

    /// Queue construction of a root slot for the next scan pass.
    pub fn add_input(&self, create: CreateFn) -> Result<()> {
        self.handle().add_input(create)
    }

    /// Run one scan pass.
    pub fn scan_once(&mut self, worker: &SlotWorker) -> ScanReport {
        self.core.scan_once(worker)
    }

    /// Construct queued inputs and run the init step of every slot that has
    /// not run yet. Returns the number of init steps run.
    pub fn run_pending_inits(&mut self) -> usize {
        self.core.run_pending_inits()
    }

    /// Run the migration handler of every live slot that has one.
    /// Returns the number of handlers run.
    pub fn migrate(&mut self) -> usize {
        self.core.migrate()
    }

    pub fn migration_count(&self) -> u32 {
        self.core.migration_count
    }

    pub fn occupied_slots(&self) -> usize {
        self.core.slots.occupied
    }

    /// Scheduler status of a live slot of this machine.
    pub fn slot_status(&self, link: &SlotLink) -> Option<SlotStatus> {
        let header = link.header()?;
        if !link.is_valid() || !self.core.is_local(header) {
            return None;
        }
        let entry = self.core.slots.get(header.index())?;
        Some(entry.body.as_ref().map_or(SlotStatus::Active, |b| b.status))
    }

    /// Stop every slot and refuse further commands.
    /// Returns the number of slots stopped.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.core.stop_all();
        self.core.sync.stop();
        debug!(machine = %self.core.sync.id(), stopped, "slot machine stopped");
        stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.core.sync.is_stopped()
    }
}

impl Scannable for SlotMachine {
    fn scan_once(&mut self, worker: &SlotWorker) -> ScanReport {
        SlotMachine::scan_once(self, worker)
    }
}

impl Drop for SlotMachine {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop_all();
        }
    }
}

impl fmt::Debug for SlotMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotMachine")
            .field("id", &self.core.sync.id())
            .field("occupied", &self.core.slots.occupied)
            .field("active", &self.core.active.len())
            .field("polls", &self.core.polls.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::step::constructor;
    use crate::worker::WorkerId;

    fn machine() -> SlotMachine {
        SlotMachine::new(SlotMachineConfig {
            slot_page_size: 4,
            polling_period: Duration::from_millis(20),
            polling_truncate: Duration::from_millis(1),
            scan_count_limit: 10,
        })
        .unwrap()
    }

    fn drain(machine: &mut SlotMachine, worker: &SlotWorker) {
        for _ in 0..100 {
            if !machine.scan_once(worker).repeat_now {
                return;
            }
        }
        panic!("machine did not become idle");
    }

    struct Idle;

    impl StateMachine for Idle {
        fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
            ctx.sleep().then_repeat()
        }
    }

    /// Waits on `target` and is woken again by every migration.
    struct Rewaiter {
        target: SlotLink,
    }

    impl StateMachine for Rewaiter {
        fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
            ctx.set_default_migration(Rewaiter::on_migrate);
            let target = self.target.clone();
            ctx.wait_activation(&target).then_repeat()
        }
    }

    impl Rewaiter {
        fn on_migrate(&mut self, ctx: &mut MigrationContext<'_>) -> StateUpdate {
            ctx.wake_up()
        }
    }

    fn dependents(machine: &SlotMachine, link: &SlotLink) -> usize {
        link.header()
            .and_then(|h| machine.core.slots.get(h.index()))
            .and_then(|e| e.body.as_ref())
            .map_or(0, |b| b.dependents.len())
    }

    #[test]
    fn repeated_activation_wait_registers_once() {
        let mut machine = machine();
        let worker = SlotWorker::new(WorkerId(0), WorkerSignal::new());
        let target = machine.add_new(constructor(Idle));
        let waiter = machine.add_new(constructor(Rewaiter {
            target: target.clone(),
        }));
        drain(&mut machine, &worker);
        assert_eq!(dependents(&machine, &target), 1);

        for _ in 0..3 {
            assert_eq!(machine.migrate(), 1);
            drain(&mut machine, &worker);
        }
        assert_eq!(dependents(&machine, &target), 1);
        assert_eq!(machine.slot_status(&waiter), Some(SlotStatus::Waiting));
    }

    #[test]
    fn init_flag_survives_repeat_and_resets_on_replace() {
        let mut machine = machine();
        let worker = SlotWorker::new(WorkerId(0), WorkerSignal::new());
        let link = machine.add_new(constructor(Idle));
        let index = link.header().map(|h| h.index()).unwrap();
        let initialized = |machine: &SlotMachine| {
            machine
                .core
                .slots
                .get(index)
                .and_then(|e| e.body.as_ref())
                .is_some_and(|b| b.initialized)
        };
        assert!(!initialized(&machine));

        drain(&mut machine, &worker);
        assert!(initialized(&machine));
        assert_eq!(machine.run_pending_inits(), 0);

        let mut body = machine.core.slots.get_mut(index).and_then(|e| e.body.take()).unwrap();
        body.reset_for_replace();
        assert!(!body.initialized);
        machine.core.put_back(index, body);
        assert_eq!(machine.run_pending_inits(), 1);
    }
}
