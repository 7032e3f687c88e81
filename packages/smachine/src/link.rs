//! Weak handles to slots and to specific steps of a slot.
//!
//! A slot's header outlives the machine that is currently stored in it: when
//! a slot stops, its header is recycled for the next allocation under a new
//! [`SlotId`]. Handles capture the id they were created with, so a handle to
//! a dead slot fails validation instead of reaching the new occupant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::handle::{MachineId, MachineSync};

/// Identifier of one slot allocation. Zero means "no slot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotId(u32);

/// The id carried by empty links.
pub const UNKNOWN_SLOT_ID: SlotId = SlotId(0);

impl SlotId {
    /// Create a slot id from its raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// True for the "no slot" id.
    pub fn is_unknown(&self) -> bool {
        self.0 == 0
    }

    /// Raw value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const BUSY_BIT: u64 = 1;
pub(crate) const STEP_MASK: u32 = 0x7FFF_FFFF;

/// Next step counter, skipping the wildcard 0.
pub(crate) fn next_step_no(step: u32) -> u32 {
    if step >= STEP_MASK {
        1
    } else {
        step + 1
    }
}

/// Liveness word of one arena slot.
///
/// Packs `(slot id, step counter, busy)` into one atomic so that any thread
/// can validate a handle without touching the arena. Only the owning
/// machine's scan thread writes it.
pub(crate) struct SlotHeader {
    state: AtomicU64,
    index: u32,
    machine: Arc<MachineSync>,
}

impl SlotHeader {
    pub(crate) fn new(index: u32, machine: Arc<MachineSync>) -> Self {
        Self {
            state: AtomicU64::new(0),
            index,
            machine,
        }
    }

    /// Current `(id, step, busy)`.
    pub(crate) fn state(&self) -> (SlotId, u32, bool) {
        let v = self.state.load(Ordering::Acquire);
        let id = SlotId((v >> 32) as u32);
        let low = v as u32;
        (id, low >> 1, u64::from(low) & BUSY_BIT != 0)
    }

    fn store(&self, id: SlotId, step: u32, busy: bool) {
        let low = ((step & STEP_MASK) << 1) as u64 | if busy { BUSY_BIT } else { 0 };
        self.state
            .store((u64::from(id.0) << 32) | low, Ordering::Release);
    }

    /// Make the header live under `id` at step 1.
    pub(crate) fn activate(&self, id: SlotId) {
        self.store(id, 1, false);
    }

    pub(crate) fn set_step(&self, step: u32) {
        let (id, _, busy) = self.state();
        self.store(id, step, busy);
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        let (id, step, _) = self.state();
        self.store(id, step, busy);
    }

    /// Invalidate every outstanding handle.
    pub(crate) fn retire(&self) {
        self.store(UNKNOWN_SLOT_ID, 0, false);
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn machine(&self) -> &Arc<MachineSync> {
        &self.machine
    }
}

impl fmt::Debug for SlotHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (id, step, busy) = self.state();
        f.debug_struct("SlotHeader")
            .field("index", &self.index)
            .field("id", &id)
            .field("step", &step)
            .field("busy", &busy)
            .finish()
    }
}

/// A lazy link to a slot that can detect when the slot is dead.
#[derive(Clone, Default)]
pub struct SlotLink {
    id: SlotId,
    header: Option<Arc<SlotHeader>>,
}

impl SlotLink {
    /// A link to nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn new(id: SlotId, header: Arc<SlotHeader>) -> Self {
        Self {
            id,
            header: Some(header),
        }
    }

    /// The slot id captured by this link.
    pub fn slot_id(&self) -> SlotId {
        self.id
    }

    /// True when the link was never bound to a slot.
    pub fn is_empty(&self) -> bool {
        self.header.is_none()
    }

    /// True while the linked slot is alive.
    pub fn is_valid(&self) -> bool {
        match &self.header {
            Some(h) => h.state().0 == self.id,
            None => false,
        }
    }

    /// `(valid, busy)` read from a single snapshot.
    pub(crate) fn valid_and_busy(&self) -> (bool, bool) {
        match &self.header {
            Some(h) => {
                let (id, _, busy) = h.state();
                (id == self.id, id == self.id && busy)
            }
            None => (false, false),
        }
    }

    /// The machine owning the slot, if the link was ever bound.
    pub fn machine_id(&self) -> Option<MachineId> {
        self.header.as_ref().map(|h| h.machine().id())
    }

    pub(crate) fn header(&self) -> Option<&Arc<SlotHeader>> {
        self.header.as_ref()
    }

    /// Link to the slot's current step.
    pub fn current_step(&self) -> StepLink {
        let step = match &self.header {
            Some(h) => {
                let (id, step, _) = h.state();
                if id == self.id {
                    step
                } else {
                    0
                }
            }
            None => 0,
        };
        StepLink {
            link: self.clone(),
            step,
        }
    }
}

impl PartialEq for SlotLink {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && match (&self.header, &other.header) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl Eq for SlotLink {}

impl fmt::Debug for SlotLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.header {
            Some(h) => write!(f, "SlotLink({}@{})", self.id, h.index()),
            None => write!(f, "SlotLink(none)"),
        }
    }
}

/// A link to a slot at a specific step. Step 0 matches any step.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StepLink {
    link: SlotLink,
    step: u32,
}

impl StepLink {
    pub(crate) fn new(link: SlotLink, step: u32) -> Self {
        Self { link, step }
    }

    /// A step link to nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// The slot part of the link.
    pub fn slot_link(&self) -> &SlotLink {
        &self.link
    }

    /// The captured step counter; 0 means any step.
    pub fn step(&self) -> u32 {
        self.step
    }

    /// The same slot, any step.
    pub fn any_step(&self) -> StepLink {
        StepLink {
            link: self.link.clone(),
            step: 0,
        }
    }

    /// True while the slot is alive and at the captured step.
    pub fn is_at_step(&self) -> bool {
        match self.link.header() {
            Some(h) => {
                let (id, step, _) = h.state();
                id == self.link.id && (self.step == 0 || self.step == step)
            }
            None => false,
        }
    }

    /// `(valid, at exact step)`; the wildcard step only matches itself here.
    pub(crate) fn valid_and_at_exact_step(&self) -> (bool, bool) {
        match self.link.header() {
            Some(h) => {
                let (id, step, _) = h.state();
                (id == self.link.id, self.step == step)
            }
            None => (false, false),
        }
    }
}

impl std::ops::Deref for StepLink {
    type Target = SlotLink;

    fn deref(&self) -> &SlotLink {
        &self.link
    }
}

impl fmt::Debug for StepLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepLink({:?}, step {})", self.link, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerSignal;

    fn header() -> Arc<SlotHeader> {
        Arc::new(SlotHeader::new(3, MachineSync::new(WorkerSignal::new())))
    }

    #[test]
    fn header_packs_state() {
        let h = header();
        assert_eq!(h.state(), (UNKNOWN_SLOT_ID, 0, false));

        h.activate(SlotId::new(77));
        assert_eq!(h.state(), (SlotId::new(77), 1, false));

        h.set_busy(true);
        h.set_step(STEP_MASK);
        assert_eq!(h.state(), (SlotId::new(77), STEP_MASK, true));

        h.set_busy(false);
        assert_eq!(h.state(), (SlotId::new(77), STEP_MASK, false));
    }

    #[test]
    fn step_counter_skips_wildcard() {
        assert_eq!(next_step_no(1), 2);
        assert_eq!(next_step_no(STEP_MASK), 1);
    }

    #[test]
    fn empty_links_are_invalid() {
        let link = SlotLink::none();
        assert!(link.is_empty());
        assert!(!link.is_valid());
        assert!(link.slot_id().is_unknown());
        assert!(!StepLink::none().is_at_step());
    }

    #[test]
    fn link_dies_with_generation() {
        let h = header();
        h.activate(SlotId::new(5));
        let link = SlotLink::new(SlotId::new(5), h.clone());
        let step = link.current_step();
        assert!(link.is_valid());
        assert!(step.is_at_step());

        h.retire();
        h.activate(SlotId::new(6));
        assert!(!link.is_valid());
        assert!(!step.is_at_step());
        assert!(!step.any_step().is_at_step());
    }

    #[test]
    fn step_link_tracks_exact_step() {
        let h = header();
        h.activate(SlotId::new(9));
        let link = SlotLink::new(SlotId::new(9), h.clone());
        let at_one = link.current_step();
        assert_eq!(at_one.step(), 1);

        h.set_step(2);
        assert!(!at_one.is_at_step());
        assert!(at_one.any_step().is_at_step());
        assert_eq!(at_one.valid_and_at_exact_step(), (true, false));
    }

    #[test]
    fn busy_is_reported_only_for_live_slot() {
        let h = header();
        h.activate(SlotId::new(1));
        h.set_busy(true);
        let link = SlotLink::new(SlotId::new(1), h.clone());
        assert_eq!(link.valid_and_busy(), (true, true));

        let stale = SlotLink::new(SlotId::new(2), h);
        assert_eq!(stale.valid_and_busy(), (false, false));
    }
}
