//! Dependency release with postponed reactivation.
//!
//! Releasing a dependency yields slots to wake now and postponed obligations
//! that may themselves yield more. The whole chain is flattened with an
//! explicit worklist before anything is activated.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::link::StepLink;

/// Something a slot holds that other slots may be waiting on.
pub trait SlotDependency: Send {
    /// Release the dependency.
    fn release(self: Box<Self>) -> DependencyRelease;
}

/// Result of [`SlotDependency::release`].
#[derive(Default)]
pub struct DependencyRelease {
    /// A dependency the slot keeps holding instead of the released one.
    pub replacement: Option<Box<dyn SlotDependency>>,
    /// Obligations to resolve after the release.
    pub postponed: Vec<Box<dyn PostponedDependency>>,
    /// Slots to wake immediately.
    pub activate: Vec<StepLink>,
}

/// A release obligation deferred to a later point in the release chain.
pub trait PostponedDependency: Send {
    /// Push the slots to wake into `activate` and return any further
    /// obligations.
    fn postponed_activate(
        self: Box<Self>,
        activate: &mut Vec<StepLink>,
    ) -> Vec<Box<dyn PostponedDependency>>;
}

/// An ordered list of postponed dependencies.
#[derive(Default)]
pub struct PostponedList(Vec<Box<dyn PostponedDependency>>);

impl PostponedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dep: Box<dyn PostponedDependency>) {
        self.0.push(dep);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PostponedDependency for PostponedList {
    fn postponed_activate(
        self: Box<Self>,
        activate: &mut Vec<StepLink>,
    ) -> Vec<Box<dyn PostponedDependency>> {
        flatten(self.0, activate);
        Vec::new()
    }
}

/// Resolve postponed obligations breadth-first, in order.
fn flatten(postponed: Vec<Box<dyn PostponedDependency>>, activate: &mut Vec<StepLink>) {
    let mut queue: VecDeque<_> = postponed.into();
    while let Some(dep) = queue.pop_front() {
        queue.extend(dep.postponed_activate(activate));
    }
}

/// Release the dependency held in `slot`, leaving its replacement in place.
///
/// Returns every slot to wake, without duplicates, in release order.
pub fn release_dependency(slot: &mut Option<Box<dyn SlotDependency>>) -> Vec<StepLink> {
    let Some(dep) = slot.take() else {
        return Vec::new();
    };
    let release = dep.release();
    *slot = release.replacement;

    let mut activate = release.activate;
    flatten(release.postponed, &mut activate);
    dedup_links(activate)
}

fn dedup_links(links: Vec<StepLink>) -> Vec<StepLink> {
    let mut seen = HashSet::new();
    links
        .into_iter()
        .filter(|link| {
            let key = link
                .header()
                .map(|h| Arc::as_ptr(h) as usize)
                .unwrap_or_default();
            seen.insert((key, link.slot_id(), link.step()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MachineSync;
    use crate::link::{SlotHeader, SlotId, SlotLink};
    use crate::worker::WorkerSignal;

    fn links(n: u32) -> Vec<StepLink> {
        let sync = MachineSync::new(WorkerSignal::new());
        (0..n)
            .map(|i| {
                let header = Arc::new(SlotHeader::new(i, sync.clone()));
                header.activate(SlotId::new(i + 1));
                SlotLink::new(SlotId::new(i + 1), header).current_step()
            })
            .collect()
    }

    /// Each link in the chain is woken by the previous one's release.
    struct Chain(VecDeque<StepLink>);

    impl PostponedDependency for Chain {
        fn postponed_activate(
            mut self: Box<Self>,
            activate: &mut Vec<StepLink>,
        ) -> Vec<Box<dyn PostponedDependency>> {
            match self.0.pop_front() {
                Some(link) => {
                    activate.push(link);
                    vec![self as Box<dyn PostponedDependency>]
                }
                None => Vec::new(),
            }
        }
    }

    struct Held {
        now: Vec<StepLink>,
        later: Vec<Box<dyn PostponedDependency>>,
        keep: bool,
    }

    impl SlotDependency for Held {
        fn release(self: Box<Self>) -> DependencyRelease {
            DependencyRelease {
                replacement: if self.keep {
                    Some(Box::new(Held {
                        now: Vec::new(),
                        later: Vec::new(),
                        keep: false,
                    }))
                } else {
                    None
                },
                postponed: self.later,
                activate: self.now,
            }
        }
    }

    #[test]
    fn empty_slot_releases_nothing() {
        let mut slot: Option<Box<dyn SlotDependency>> = None;
        assert!(release_dependency(&mut slot).is_empty());
    }

    #[test]
    fn chain_activates_each_slot_once() {
        let all = links(64);
        let (first, rest) = all.split_at(1);

        let mut nested = PostponedList::new();
        nested.push(Box::new(Chain(rest[..32].iter().cloned().collect())));
        let mut outer = PostponedList::new();
        outer.push(Box::new(nested));
        outer.push(Box::new(Chain(rest[32..].iter().cloned().collect())));
        // Duplicates in the chain must not wake a slot twice.
        outer.push(Box::new(Chain(rest[..4].iter().cloned().collect())));
        assert_eq!(outer.len(), 3);

        let mut slot: Option<Box<dyn SlotDependency>> = Some(Box::new(Held {
            now: first.to_vec(),
            later: vec![Box::new(outer) as Box<dyn PostponedDependency>],
            keep: false,
        }));
        let woken = release_dependency(&mut slot);

        assert!(slot.is_none());
        assert_eq!(woken.len(), all.len());
        assert_eq!(woken[0], all[0]);
        for link in &all {
            assert_eq!(woken.iter().filter(|w| *w == link).count(), 1);
        }
    }

    #[test]
    fn replacement_stays_held() {
        let mut slot: Option<Box<dyn SlotDependency>> = Some(Box::new(Held {
            now: links(2),
            later: Vec::new(),
            keep: true,
        }));
        assert_eq!(release_dependency(&mut slot).len(), 2);
        assert!(slot.is_some());
        assert!(release_dependency(&mut slot).is_empty());
        assert!(slot.is_none());
    }
}
