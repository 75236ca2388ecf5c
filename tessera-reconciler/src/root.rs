//! Mounted roots and their lane bookkeeping.
//!
//! A [`FiberRoot`] tracks which lanes have pending work, which of those are
//! suspended waiting on data, which were pinged back to life, and which have
//! waited so long that they must render synchronously.

use rustc_hash::FxHashMap as HashMap;
use slotmap::new_key_type;

use crate::{
    config::{ReconcilerConfig, RootOptions},
    fiber::FiberId,
    host::CallbackHandle,
    lane::{Lane, LaneMap, Lanes, Timestamp, compute_expiration_time},
};

new_key_type! {
    /// Handle of a mounted root.
    pub struct RootId;
}

/// A mounted tree and its scheduling state.
pub(crate) struct FiberRoot<C> {
    pub(crate) container: C,
    pub(crate) current: FiberId,
    pub(crate) options: RootOptions,

    pub(crate) pending_lanes: Lanes,
    pub(crate) suspended_lanes: Lanes,
    pub(crate) pinged_lanes: Lanes,
    pub(crate) expired_lanes: Lanes,
    pub(crate) entangled_lanes: Lanes,
    pub(crate) error_recovery_disabled_lanes: Lanes,
    pub(crate) expiration_times: LaneMap<Option<Timestamp>>,
    pub(crate) entanglements: LaneMap<Lanes>,

    pub(crate) callback_node: Option<CallbackHandle>,
    pub(crate) callback_priority: Lane,
    /// Delayed commit of a suspended render.
    pub(crate) timeout_handle: Option<CallbackHandle>,
    /// Finished tree waiting for its delayed commit.
    pub(crate) pending_commit: Option<PendingCommit>,

    /// Wakeable id to the lanes that already listen on it.
    pub(crate) ping_cache: HashMap<u64, Lanes>,

    /// Records created by renders of this root that no commit has adopted yet.
    pub(crate) allocated: Vec<FiberId>,
    pub(crate) unmounted: bool,
}

/// A finished tree whose commit was delayed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCommit {
    pub(crate) finished_work: FiberId,
    pub(crate) lanes: Lanes,
}

impl<C> FiberRoot<C> {
    pub(crate) fn new(container: C, current: FiberId, options: RootOptions) -> Self {
        Self {
            container,
            current,
            options,
            pending_lanes: Lanes::NONE,
            suspended_lanes: Lanes::NONE,
            pinged_lanes: Lanes::NONE,
            expired_lanes: Lanes::NONE,
            entangled_lanes: Lanes::NONE,
            error_recovery_disabled_lanes: Lanes::NONE,
            expiration_times: LaneMap::filled(None),
            entanglements: LaneMap::filled(Lanes::NONE),
            callback_node: None,
            callback_priority: Lanes::NONE,
            timeout_handle: None,
            pending_commit: None,
            ping_cache: HashMap::default(),
            allocated: Vec::new(),
            unmounted: false,
        }
    }

    /// Records a new update. Any update except an idle one unsuspends the
    /// root so the next pass retries everything it touches.
    pub(crate) fn mark_updated(&mut self, lane: Lane) {
        self.pending_lanes |= lane;
        if lane != Lanes::IDLE {
            self.suspended_lanes = Lanes::NONE;
            self.pinged_lanes = Lanes::NONE;
        }
    }

    /// Lanes to render next, given the lanes of the render in progress.
    pub(crate) fn get_next_lanes(&self, wip_lanes: Lanes) -> Lanes {
        let pending = self.pending_lanes;
        if pending.is_empty() {
            return Lanes::NONE;
        }
        let suspended = self.suspended_lanes;
        let pinged = self.pinged_lanes;

        let non_idle = pending & Lanes::NON_IDLE;
        let next = if !non_idle.is_empty() {
            let unblocked = non_idle.remove(suspended);
            if !unblocked.is_empty() {
                unblocked.highest_priority_band()
            } else {
                (non_idle & pinged).highest_priority_band()
            }
        } else {
            let unblocked = pending.remove(suspended);
            if !unblocked.is_empty() {
                unblocked.highest_priority_band()
            } else {
                (pending & pinged).highest_priority_band()
            }
        };
        if next.is_empty() {
            return Lanes::NONE;
        }

        // Keep rendering the current attempt when the new work is not more urgent.
        if !wip_lanes.is_empty() && wip_lanes != next && !wip_lanes.intersects(suspended) {
            let next_lane = next.highest_priority_lane();
            let wip_lane = wip_lanes.highest_priority_lane();
            if next_lane.bits() >= wip_lane.bits()
                || (next_lane == Lanes::DEFAULT && wip_lane.intersects(Lanes::TRANSITIONS))
            {
                return wip_lanes;
            }
        }
        next
    }

    /// Expands `render_lanes` with every lane entangled with one of them.
    pub(crate) fn get_entangled_lanes(&self, render_lanes: Lanes) -> Lanes {
        let mut entangled = render_lanes;
        let candidates = render_lanes & self.entangled_lanes;
        for (index, _) in candidates.iter() {
            entangled |= self.entanglements[index];
        }
        entangled
    }

    /// Forces `lanes` to always render together.
    pub(crate) fn mark_entangled(&mut self, lanes: Lanes) {
        self.entangled_lanes |= lanes;
        let all = self.entangled_lanes;
        for (index, lane) in all.iter() {
            if lane.intersects(lanes) || self.entanglements[index].intersects(lanes) {
                self.entanglements[index] |= lanes;
            }
        }
    }

    pub(crate) fn mark_suspended(&mut self, lanes: Lanes) {
        self.suspended_lanes |= lanes;
        self.pinged_lanes = self.pinged_lanes.remove(lanes);
        self.expiration_times.fill_lanes(lanes, None);
    }

    pub(crate) fn mark_pinged(&mut self, lanes: Lanes) {
        self.pinged_lanes |= self.suspended_lanes & lanes;
    }

    /// Clears bookkeeping for every lane not in `remaining` after a commit.
    pub(crate) fn mark_finished(&mut self, remaining: Lanes) {
        let no_longer_pending = self.pending_lanes.remove(remaining);
        self.pending_lanes = remaining;
        self.suspended_lanes = Lanes::NONE;
        self.pinged_lanes = Lanes::NONE;
        self.expired_lanes &= remaining;
        self.entangled_lanes &= remaining;
        self.error_recovery_disabled_lanes &= remaining;
        for (index, _) in no_longer_pending.iter() {
            self.entanglements[index] = Lanes::NONE;
            self.expiration_times[index] = None;
        }
    }

    /// Assigns deadlines to newly seen lanes and moves overdue lanes into the
    /// expired set.
    pub(crate) fn mark_starved_lanes_as_expired(&mut self, now: Timestamp, config: &ReconcilerConfig) {
        let lanes = self.pending_lanes.remove(Lanes::RETRIES);
        for (index, lane) in lanes.iter() {
            if lane.intersects(self.suspended_lanes) && !lane.intersects(self.pinged_lanes) {
                continue;
            }
            match self.expiration_times[index] {
                None => self.expiration_times[index] = compute_expiration_time(lane, now, config),
                Some(deadline) if deadline <= now => self.expired_lanes |= lane,
                Some(_) => {}
            }
        }
    }

    pub(crate) fn includes_expired_lane(&self, lanes: Lanes) -> bool {
        lanes.intersects(self.expired_lanes)
    }

    /// Whether a render of `lanes` may yield to the host between units of work.
    pub(crate) fn should_time_slice(&self, lanes: Lanes) -> bool {
        !lanes.includes_blocking_lane() && !self.includes_expired_lane(lanes)
    }

    /// Lanes to retry synchronously after a render of `original` errored.
    pub(crate) fn lanes_to_retry_on_error(&self, original: Lanes) -> Lanes {
        if self.error_recovery_disabled_lanes.intersects(original) {
            return Lanes::NONE;
        }
        let everything_but_offscreen = self.pending_lanes.remove(Lanes::OFFSCREEN);
        if !everything_but_offscreen.is_empty() {
            everything_but_offscreen
        } else if self.pending_lanes.intersects(Lanes::OFFSCREEN) {
            Lanes::OFFSCREEN
        } else {
            Lanes::NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> FiberRoot<()> {
        FiberRoot::new((), FiberId::default(), RootOptions::default())
    }

    #[test]
    fn sync_wins_over_everything() {
        let mut root = root();
        root.mark_updated(Lanes::TRANSITION_1);
        root.mark_updated(Lanes::SYNC);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::SYNC);
        root.mark_finished(Lanes::TRANSITION_1);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::TRANSITION_1);
    }

    #[test]
    fn suspended_lanes_wait_for_ping() {
        let mut root = root();
        root.mark_updated(Lanes::RETRY_1);
        root.mark_suspended(Lanes::RETRY_1);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::NONE);
        root.mark_pinged(Lanes::RETRY_1);
        assert_eq!(root.get_next_lanes(Lanes::NONE), Lanes::RETRY_1);
    }

    #[test]
    fn fresh_update_unsuspends_except_idle() {
        let mut root = root();
        root.mark_updated(Lanes::TRANSITION_1);
        root.mark_suspended(Lanes::TRANSITION_1);
        root.mark_updated(Lanes::IDLE);
        assert_eq!(root.suspended_lanes, Lanes::TRANSITION_1);
        root.mark_updated(Lanes::DEFAULT);
        assert_eq!(root.suspended_lanes, Lanes::NONE);
    }

    #[test]
    fn in_progress_render_is_not_interrupted_by_lower_priority() {
        let mut root = root();
        root.mark_updated(Lanes::DEFAULT);
        root.mark_updated(Lanes::TRANSITION_1);
        assert_eq!(root.get_next_lanes(Lanes::DEFAULT), Lanes::DEFAULT);
        let mut root = self::root();
        root.mark_updated(Lanes::TRANSITION_1);
        root.mark_updated(Lanes::DEFAULT);
        // A default update does not interrupt a transition render either.
        assert_eq!(
            root.get_next_lanes(Lanes::TRANSITION_1),
            Lanes::TRANSITION_1
        );
        root.mark_updated(Lanes::SYNC);
        assert_eq!(root.get_next_lanes(Lanes::TRANSITION_1), Lanes::SYNC);
    }

    #[test]
    fn starved_lanes_expire() {
        let config = ReconcilerConfig::default();
        let mut root = root();
        root.mark_updated(Lanes::TRANSITION_1);
        root.mark_starved_lanes_as_expired(0, &config);
        assert!(!root.includes_expired_lane(Lanes::TRANSITION_1));
        root.mark_starved_lanes_as_expired(config.transition_lane_expiration_ms, &config);
        assert!(root.includes_expired_lane(Lanes::TRANSITION_1));
        assert!(!root.should_time_slice(Lanes::TRANSITION_1));
        root.mark_finished(Lanes::NONE);
        assert!(!root.includes_expired_lane(Lanes::TRANSITION_1));
    }

    #[test]
    fn entangled_lanes_render_together() {
        let mut root = root();
        let second = Lanes::from_index(4);
        root.mark_updated(Lanes::TRANSITION_1 | second);
        root.mark_entangled(Lanes::TRANSITION_1 | second);
        assert_eq!(
            root.get_entangled_lanes(Lanes::TRANSITION_1),
            Lanes::TRANSITION_1 | second
        );
    }

    #[test]
    fn retry_on_error_excludes_offscreen() {
        let mut root = root();
        root.mark_updated(Lanes::DEFAULT);
        root.mark_updated(Lanes::OFFSCREEN);
        assert_eq!(root.lanes_to_retry_on_error(Lanes::DEFAULT), Lanes::DEFAULT);
        root.error_recovery_disabled_lanes = Lanes::DEFAULT;
        assert_eq!(root.lanes_to_retry_on_error(Lanes::DEFAULT), Lanes::NONE);
    }
}
