//! Keyed child diffing.
//!
//! Children are matched by key when they have one and by position otherwise.
//! The diff is a single pass plus a keyed lookup for the tail: a reused child
//! whose previous index is lower than the highest index already placed moved
//! forward and gets a placement; everything else stays where it is. This is
//! linear and stable for appends, removals and most reorders without
//! computing an optimal move set.

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use crate::{
    element::{Element, Key},
    fiber::{FiberId, Flags},
    host::{HostConfig, HostScheduler},
    lane::Lanes,
    work_loop::Reconciler,
};

/// Identity of a child slot: explicit key, or position when unkeyed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SlotKey {
    Key(Key),
    Index(usize),
}

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Reconciles `children` against the committed children of `current` and
    /// installs the result as the child list of `wip`.
    pub(crate) fn reconcile_children(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        children: &[Element],
        render_lanes: Lanes,
    ) {
        let current_first = current.and_then(|current| self.fibers[current].child);
        // A lone unkeyed fragment is transparent.
        let children = match children {
            [only] => only.as_unkeyed_fragment().unwrap_or(children),
            _ => children,
        };
        let first =
            self.reconcile_child_list(wip, current_first, children, render_lanes, current.is_some());
        self.fibers[wip].child = first;
    }

    /// Diffs `children` against the sibling list starting at `current_first`.
    /// With `track` unset nothing is flagged: the parent itself is new and
    /// gets inserted as a whole.
    pub(crate) fn reconcile_child_list(
        &mut self,
        parent: FiberId,
        current_first: Option<FiberId>,
        children: &[Element],
        render_lanes: Lanes,
        track: bool,
    ) -> Option<FiberId> {
        let mut first: Option<FiberId> = None;
        let mut previous: Option<FiberId> = None;
        let mut old = current_first;
        let mut last_placed = 0usize;
        let mut new_index = 0usize;

        while old.is_some() && new_index < children.len() {
            let mut slot = old;
            let next_old = match slot {
                Some(id) if self.fibers[id].index > new_index => {
                    slot = None;
                    old
                }
                Some(id) => self.fibers[id].sibling,
                None => None,
            };
            let Some(fiber) = self.update_slot(parent, slot, &children[new_index], render_lanes) else {
                if slot.is_none() {
                    old = next_old;
                }
                break;
            };
            if track
                && let Some(slot) = slot
                && self.fibers[fiber].alternate.is_none()
            {
                // Matched the slot but could not reuse the record.
                self.delete_child(parent, slot, track);
            }
            last_placed = self.place_child(fiber, last_placed, new_index, track);
            link(&mut self.fibers, &mut first, &mut previous, fiber);
            old = next_old;
            new_index += 1;
        }

        if new_index == children.len() {
            self.delete_remaining_children(parent, old, track);
            return first;
        }

        if old.is_none() {
            for (index, element) in children.iter().enumerate().skip(new_index) {
                let fiber = self.create_child(parent, element, render_lanes);
                last_placed = self.place_child(fiber, last_placed, index, track);
                link(&mut self.fibers, &mut first, &mut previous, fiber);
            }
            return first;
        }

        let mut remaining = Vec::new();
        let mut existing: HashMap<SlotKey, FiberId> = HashMap::default();
        let mut next = old;
        while let Some(id) = next {
            let fiber = &self.fibers[id];
            let slot = match &fiber.key {
                Some(key) => SlotKey::Key(key.clone()),
                None => SlotKey::Index(fiber.index),
            };
            existing.insert(slot, id);
            remaining.push(id);
            next = fiber.sibling;
        }

        for (index, element) in children.iter().enumerate().skip(new_index) {
            let slot = match element.key() {
                Some(key) => SlotKey::Key(key.clone()),
                None => SlotKey::Index(index),
            };
            let matched = existing.get(&slot).copied();
            let fiber = self.update_element(parent, matched, element, render_lanes);
            if track && matched.is_some() && self.fibers[fiber].alternate.is_some() {
                existing.remove(&slot);
            }
            last_placed = self.place_child(fiber, last_placed, index, track);
            link(&mut self.fibers, &mut first, &mut previous, fiber);
        }

        if track {
            let leftover: HashSet<FiberId> = existing.into_values().collect();
            for id in remaining {
                if leftover.contains(&id) {
                    self.delete_child(parent, id, track);
                }
            }
        }
        first
    }

    /// Reuses `slot` for `element` when their keys agree. Returns `None` on a
    /// key mismatch.
    fn update_slot(
        &mut self,
        parent: FiberId,
        slot: Option<FiberId>,
        element: &Element,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let slot_key = slot.and_then(|id| self.fibers[id].key.clone());
        if element.key() != slot_key.as_ref() {
            return None;
        }
        Some(self.update_element(parent, slot, element, render_lanes))
    }

    /// Work-in-progress copy of `current` when it can host `element`, a new
    /// record otherwise.
    fn update_element(
        &mut self,
        parent: FiberId,
        current: Option<FiberId>,
        element: &Element,
        render_lanes: Lanes,
    ) -> FiberId {
        match current {
            Some(current) if self.fibers[current].kind.matches(element) => {
                let fiber = self.work_in_progress(current, Some(element.clone()));
                let record = &mut self.fibers[fiber];
                record.parent = Some(parent);
                record.sibling = None;
                fiber
            }
            _ => self.create_child(parent, element, render_lanes),
        }
    }

    fn create_child(&mut self, parent: FiberId, element: &Element, render_lanes: Lanes) -> FiberId {
        let fiber = self.create_fiber(element, render_lanes);
        self.fibers[fiber].parent = Some(parent);
        fiber
    }

    fn place_child(&mut self, fiber: FiberId, last_placed: usize, new_index: usize, track: bool) -> usize {
        self.fibers[fiber].index = new_index;
        if !track {
            return last_placed;
        }
        match self.fibers[fiber].alternate {
            Some(current) => {
                let old_index = self.fibers[current].index;
                if old_index < last_placed {
                    // Moved forward.
                    self.fibers[fiber].flags |= Flags::PLACEMENT;
                    last_placed
                } else {
                    old_index
                }
            }
            None => {
                self.fibers[fiber].flags |= Flags::PLACEMENT;
                last_placed
            }
        }
    }

    fn delete_child(&mut self, parent: FiberId, child: FiberId, track: bool) {
        if !track {
            return;
        }
        let fiber = &mut self.fibers[parent];
        fiber.deletions.push(child);
        fiber.flags |= Flags::CHILD_DELETION;
    }

    pub(crate) fn delete_remaining_children(
        &mut self,
        parent: FiberId,
        first: Option<FiberId>,
        track: bool,
    ) {
        if !track {
            return;
        }
        let mut next = first;
        while let Some(child) = next {
            next = self.fibers[child].sibling;
            self.delete_child(parent, child, track);
        }
    }
}

fn link<I: Clone>(
    fibers: &mut crate::fiber::FiberArena<I>,
    first: &mut Option<FiberId>,
    previous: &mut Option<FiberId>,
    fiber: FiberId,
) {
    match *previous {
        Some(previous) => fibers[previous].sibling = Some(fiber),
        None => *first = Some(fiber),
    }
    *previous = Some(fiber);
}
