//! Per-node pending mutation queues.
//!
//! Every queue has a pending list shared by the committed record and the
//! work-in-progress record of the same node, and a base list owned by each
//! record. Enqueueing appends to the pending list. Processing moves the
//! pending list onto the base list of both records, then replays the base list
//! once for the lanes being rendered. Updates outside those lanes are kept so
//! they can be replayed for their own lane later; once one update is skipped,
//! every later update is kept too so that ordering is preserved on replay.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::lane::Lanes;

/// Callback fired in the layout pass once the update that carries it commits.
pub(crate) type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// One pending mutation.
#[derive(Clone)]
pub(crate) struct Update<A> {
    pub(crate) lane: Lanes,
    pub(crate) action: A,
    pub(crate) callback: Option<UpdateCallback>,
}

impl<A> Update<A> {
    pub(crate) fn new(lane: Lanes, action: A) -> Self {
        Self {
            lane,
            action,
            callback: None,
        }
    }

    pub(crate) fn with_callback(mut self, callback: UpdateCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Append-only list shared between a node and its alternate.
pub(crate) struct SharedQueue<A> {
    pending: Vec<Update<A>>,
    /// Transition lanes that have touched this queue and are not finished.
    pub(crate) lanes: Lanes,
}

impl<A> Default for SharedQueue<A> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            lanes: Lanes::NONE,
        }
    }
}

impl<A> SharedQueue<A> {
    pub(crate) fn push(&mut self, update: Update<A>) {
        self.pending.push(update);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outcome of replaying a queue.
pub(crate) struct Processed<S> {
    pub(crate) state: S,
    /// Lanes of the updates that were kept for a later render.
    pub(crate) skipped_lanes: Lanes,
    pub(crate) callbacks: Vec<UpdateCallback>,
}

/// Update queue of one node record.
#[derive(Clone)]
pub(crate) struct UpdateQueue<A, S> {
    pub(crate) base_state: S,
    pub(crate) base_updates: Vec<Update<A>>,
    pub(crate) shared: Arc<Mutex<SharedQueue<A>>>,
    /// Callbacks collected by the last render, run in the layout pass.
    pub(crate) callbacks: Vec<UpdateCallback>,
}

impl<A: Clone, S: Clone> UpdateQueue<A, S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            base_state: state,
            base_updates: Vec::new(),
            shared: Arc::new(Mutex::new(SharedQueue::default())),
            callbacks: Vec::new(),
        }
    }

    /// Appends to the shared pending list.
    pub(crate) fn enqueue(&self, update: Update<A>) {
        self.shared.lock().push(update);
    }

    /// Drains the shared pending list. The caller appends the result to the
    /// base list of both records so an abandoned render loses nothing.
    pub(crate) fn take_pending(&self) -> Vec<Update<A>> {
        std::mem::take(&mut self.shared.lock().pending)
    }

    pub(crate) fn append_base(&mut self, updates: &[Update<A>]) {
        self.base_updates.extend_from_slice(updates);
    }

    /// Replays the base list for `render_lanes`.
    pub(crate) fn process(
        &mut self,
        render_lanes: Lanes,
        mut reduce: impl FnMut(&S, &A) -> S,
    ) -> Processed<S> {
        let updates = std::mem::take(&mut self.base_updates);
        let mut new_state = self.base_state.clone();
        let mut new_base_state: Option<S> = None;
        let mut new_base: Vec<Update<A>> = Vec::new();
        let mut skipped_lanes = Lanes::NONE;
        let mut callbacks = Vec::new();

        for update in updates {
            if !render_lanes.contains(update.lane) {
                if new_base.is_empty() {
                    new_base_state = Some(new_state.clone());
                }
                skipped_lanes |= update.lane;
                new_base.push(update);
                continue;
            }

            if !new_base.is_empty() {
                // Rebased copies always apply and never fire their callback twice.
                new_base.push(Update {
                    lane: Lanes::NONE,
                    action: update.action.clone(),
                    callback: None,
                });
            }
            new_state = reduce(&new_state, &update.action);
            if let Some(callback) = update.callback {
                callbacks.push(callback);
            }
        }

        self.base_state = match new_base_state {
            Some(state) => state,
            None => new_state.clone(),
        };
        self.base_updates = new_base;
        self.callbacks = callbacks.clone();

        Processed {
            state: new_state,
            skipped_lanes,
            callbacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(state: &String, action: &char) -> String {
        let mut next = state.clone();
        next.push(*action);
        next
    }

    fn flush_pending<A: Clone, S: Clone>(current: &mut UpdateQueue<A, S>, wip: &mut UpdateQueue<A, S>) {
        let pending = wip.take_pending();
        current.append_base(&pending);
        wip.append_base(&pending);
    }

    #[test]
    fn skipped_updates_are_rebased_in_order() {
        let mut current = UpdateQueue::new(String::new());
        current.enqueue(Update::new(Lanes::SYNC, 'A'));
        current.enqueue(Update::new(Lanes::TRANSITION_1, 'B'));
        current.enqueue(Update::new(Lanes::SYNC, 'C'));

        let mut wip = current.clone();
        flush_pending(&mut current, &mut wip);
        let first = wip.process(Lanes::SYNC, append);
        assert_eq!(first.state, "AC");
        assert_eq!(first.skipped_lanes, Lanes::TRANSITION_1);
        assert_eq!(wip.base_state, "A");
        assert_eq!(wip.base_updates.len(), 2);

        let mut next = wip.clone();
        let second = next.process(Lanes::SYNC | Lanes::TRANSITION_1, append);
        assert_eq!(second.state, "ABC");
        assert_eq!(second.skipped_lanes, Lanes::NONE);
        assert!(next.base_updates.is_empty());
        assert_eq!(next.base_state, "ABC");
    }

    #[test]
    fn abandoned_render_keeps_updates_on_current() {
        let mut current = UpdateQueue::new(0u32);
        current.enqueue(Update::new(Lanes::DEFAULT, 5u32));
        let mut wip = current.clone();
        let pending = wip.take_pending();
        current.append_base(&pending);
        wip.append_base(&pending);
        let _ = wip.process(Lanes::DEFAULT, |s, a| s + a);

        // The render is thrown away; a restart clones the committed queue again.
        let mut restarted = current.clone();
        assert!(restarted.take_pending().is_empty());
        let processed = restarted.process(Lanes::DEFAULT, |s, a| s + a);
        assert_eq!(processed.state, 5);
    }

    #[test]
    fn idempotent_reducer_applies_once() {
        let mut current = UpdateQueue::new(false);
        current.enqueue(Update::new(Lanes::DEFAULT, true));
        let mut wip = current.clone();
        flush_pending(&mut current, &mut wip);
        let processed = wip.process(Lanes::DEFAULT, |_, a| *a);
        assert!(processed.state);
        let again = wip.clone().process(Lanes::DEFAULT, |_, a| *a);
        assert_eq!(again.state, processed.state);
    }

    #[test]
    fn callbacks_fire_for_applied_updates_only() {
        let mut queue = UpdateQueue::new(0u32);
        queue.enqueue(Update::new(Lanes::SYNC, 1).with_callback(Arc::new(|| {})));
        queue.enqueue(Update::new(Lanes::IDLE, 1).with_callback(Arc::new(|| {})));
        let pending = queue.take_pending();
        queue.append_base(&pending);
        let processed = queue.process(Lanes::SYNC, |s, a| s + a);
        assert_eq!(processed.callbacks.len(), 1);
        assert!(queue.shared.lock().is_empty());
        assert_eq!(queue.base_updates.len(), 1);
    }
}
