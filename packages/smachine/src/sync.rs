//! Semaphore shared between slots, possibly of different machines.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::dependency::{DependencyRelease, SlotDependency};
use crate::link::{SlotLink, StepLink};

struct SemaphoreState {
    limit: usize,
    holders: Vec<SlotLink>,
    queue: VecDeque<StepLink>,
}

impl SemaphoreState {
    fn purge(&mut self) {
        self.holders.retain(SlotLink::is_valid);
        self.queue.retain(|w| w.is_valid());
    }

    /// Grant free permits to waiters in FIFO order.
    fn grant(&mut self) -> Vec<StepLink> {
        let mut granted = Vec::new();
        while self.holders.len() < self.limit {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if !waiter.is_valid() {
                continue;
            }
            self.holders.push(waiter.slot_link().clone());
            granted.push(waiter);
        }
        granted
    }
}

/// A counting semaphore. Slots acquire it through
/// `ExecutionContext::acquire` and wait for a grant with `sleep()`.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<Mutex<SemaphoreState>>,
}

impl Semaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SemaphoreState {
                limit,
                holders: Vec::new(),
                queue: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.state) as usize
    }

    /// Number of live holders.
    pub fn holders(&self) -> usize {
        let mut state = self.lock();
        state.purge();
        state.holders.len()
    }

    /// Number of live waiters.
    pub fn waiters(&self) -> usize {
        let mut state = self.lock();
        state.purge();
        state.queue.len()
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Change the limit. Returns the waiters granted by a raise.
    pub(crate) fn set_limit(&self, limit: usize) -> Vec<StepLink> {
        let mut state = self.lock();
        state.limit = limit;
        state.purge();
        state.grant()
    }

    pub(crate) fn is_holder(&self, link: &SlotLink) -> bool {
        self.lock().holders.iter().any(|h| h == link)
    }

    /// Take a permit for `waiter`, or queue it. Returns true when granted.
    pub(crate) fn acquire(&self, waiter: StepLink) -> bool {
        let mut state = self.lock();
        state.purge();
        if state.holders.iter().any(|h| h == waiter.slot_link()) {
            return true;
        }
        if state.holders.len() < state.limit && state.queue.is_empty() {
            state.holders.push(waiter.slot_link().clone());
            return true;
        }
        if !state.queue.iter().any(|w| w.slot_link() == waiter.slot_link()) {
            state.queue.push_back(waiter);
        }
        false
    }

    pub(crate) fn dependency(&self, link: SlotLink) -> Box<dyn SlotDependency> {
        Box::new(SemaphoreDependency {
            semaphore: self.clone(),
            link,
        })
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Semaphore")
            .field("limit", &state.limit)
            .field("holders", &state.holders.len())
            .field("waiters", &state.queue.len())
            .finish()
    }
}

/// A slot's hold on (or place in the queue of) a semaphore.
struct SemaphoreDependency {
    semaphore: Semaphore,
    link: SlotLink,
}

impl SlotDependency for SemaphoreDependency {
    fn release(self: Box<Self>) -> DependencyRelease {
        let mut state = self.semaphore.lock();
        state.holders.retain(|h| h != &self.link);
        state.queue.retain(|w| w.slot_link() != &self.link);
        state.purge();
        let activate = state.grant();
        DependencyRelease {
            activate,
            ..DependencyRelease::default()
        }
    }
}
