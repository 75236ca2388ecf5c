//! Root scheduling.
//!
//! Roots with pending work are kept in a list. Any change to a root's lanes
//! schedules one microtask that walks the list, flushes synchronous work and
//! gives every other root a host callback at the priority of its most urgent
//! lane. Callbacks are reused while that priority stays the same.

use bitflags::bitflags;

use crate::{
    context::ContextStack,
    error::{ErrorInfo, ReconcilerError, RenderSignal},
    fiber::{FiberId, FiberKind, StateNode},
    host::{HostConfig, HostScheduler, SchedulerPriority, Task},
    inbox::Signal,
    lane::{EventPriority, Lane, Lanes, Timestamp},
    root::RootId,
    work_loop::Reconciler,
};

bitflags! {
    /// What the engine is doing right now.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct ExecutionContext: u8 {
        const RENDER = 1 << 1;
        const COMMIT = 1 << 2;
    }
}

/// Why the work loop stopped on the current unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SuspendedReason {
    #[default]
    NotSuspended,
    OnError,
    /// Waiting in place for data; the render keeps its stack.
    OnData,
    /// Suspended, but a fallback may be shown right away after one yield.
    OnImmediate,
    /// The awaited value may have settled; try the unit again.
    AndReadyToContinue,
}

/// Outcome of a render attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RootExitStatus {
    #[default]
    InProgress,
    FatalErrored,
    Errored,
    Suspended,
    SuspendedWithDelay,
    Completed,
    SuspendedAtShell,
}

/// Passive effects waiting for their flush.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingPassive {
    pub(crate) root: RootId,
    pub(crate) finished: FiberId,
    pub(crate) lanes: Lanes,
}

/// Mutable state of the work loop shared by all roots.
#[derive(Default)]
pub(crate) struct SchedulerContext {
    pub(crate) execution: ExecutionContext,

    pub(crate) wip_root: Option<RootId>,
    pub(crate) wip: Option<FiberId>,
    pub(crate) wip_render_lanes: Lanes,
    /// Render lanes plus everything entangled with them, widened inside
    /// subtrees that are being revealed.
    pub(crate) entangled_render_lanes: Lanes,
    pub(crate) suspended_reason: SuspendedReason,
    pub(crate) thrown_value: Option<RenderSignal>,
    /// Wakeable that already has a resume listener for the suspended render.
    pub(crate) resume_listener: Option<u64>,
    pub(crate) exit_status: RootExitStatus,

    pub(crate) skipped_lanes: Lanes,
    pub(crate) interleaved_updated_lanes: Lanes,
    pub(crate) render_phase_updated_lanes: Lanes,
    pub(crate) pinged_lanes: Lanes,
    pub(crate) concurrent_errors: Vec<ErrorInfo>,
    pub(crate) recoverable_errors: Vec<ErrorInfo>,

    pub(crate) suspense_handler_stack: Vec<Option<FiberId>>,
    pub(crate) shell_boundary: Option<FiberId>,
    pub(crate) context_stack: ContextStack,
    pub(crate) hidden_stack: Vec<Lanes>,
    pub(crate) most_recent_fallback_time: Timestamp,

    pub(crate) nested_update_count: usize,
    pub(crate) nested_update_root: Option<RootId>,
    pub(crate) nested_passive_update_count: usize,
    pub(crate) root_with_nested_passive_updates: Option<RootId>,
    pub(crate) pending_passive: Option<PendingPassive>,

    pub(crate) scheduled_roots: Vec<RootId>,
    pub(crate) did_schedule_microtask: bool,
    pub(crate) might_have_pending_sync_work: bool,
    pub(crate) is_flushing_work: bool,
}

impl SchedulerContext {
    /// Lanes of the in-progress render if it belongs to `root`.
    pub(crate) fn wip_lanes_for(&self, root: RootId) -> Lanes {
        if self.wip_root == Some(root) {
            self.wip_render_lanes
        } else {
            Lanes::NONE
        }
    }

    pub(crate) fn suspense_handler(&self) -> Option<FiberId> {
        self.suspense_handler_stack.last().copied().flatten()
    }
}

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Adds `root` to the schedule and makes sure a microtask will process it.
    pub(crate) fn ensure_root_is_scheduled(&mut self, root: RootId) {
        if !self.ctx.scheduled_roots.contains(&root) {
            self.ctx.scheduled_roots.push(root);
        }
        self.ctx.might_have_pending_sync_work = true;
        if !self.ctx.did_schedule_microtask {
            self.ctx.did_schedule_microtask = true;
            self.scheduler.schedule_microtask(Task::ProcessRootSchedule);
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub(crate) fn process_root_schedule_in_microtask(&mut self) -> Result<(), ReconcilerError> {
        self.ctx.did_schedule_microtask = false;
        self.ctx.might_have_pending_sync_work = false;
        let now = self.scheduler.now();

        let roots = self.ctx.scheduled_roots.clone();
        let mut keep = Vec::with_capacity(roots.len());
        for root in roots {
            let next = self.schedule_task_for_root_during_microtask(root, now);
            if next.is_empty() {
                continue;
            }
            if next.includes_sync_lane() {
                self.ctx.might_have_pending_sync_work = true;
            }
            keep.push(root);
        }
        self.ctx.scheduled_roots = keep;
        self.flush_sync_work_on_all_roots()
    }

    /// Gives `root` a host callback for its next lanes. Returns the priority
    /// lane that was scheduled, or no lanes when the root is idle.
    pub(crate) fn schedule_task_for_root_during_microtask(
        &mut self,
        root: RootId,
        now: Timestamp,
    ) -> Lane {
        let wip_lanes = self.ctx.wip_lanes_for(root);
        let waiting_in_place = self.ctx.wip_root == Some(root)
            && self.ctx.suspended_reason == SuspendedReason::OnData;
        let config = self.config.clone();
        let Some(fiber_root) = self.roots.get_mut(root) else {
            return Lanes::NONE;
        };
        fiber_root.mark_starved_lanes_as_expired(now, &config);
        let next = fiber_root.get_next_lanes(wip_lanes);
        let existing = fiber_root.callback_node;

        if next.is_empty() || waiting_in_place || fiber_root.pending_commit.is_some() {
            fiber_root.callback_node = None;
            fiber_root.callback_priority = Lanes::NONE;
            if let Some(handle) = existing {
                self.scheduler.cancel_callback(handle);
            }
            return Lanes::NONE;
        }

        if next.includes_sync_lane() {
            fiber_root.callback_node = None;
            fiber_root.callback_priority = Lanes::SYNC;
            if let Some(handle) = existing {
                self.scheduler.cancel_callback(handle);
            }
            return Lanes::SYNC;
        }

        let priority_lane = next.highest_priority_lane();
        if existing.is_some() && fiber_root.callback_priority == priority_lane {
            return priority_lane;
        }
        if let Some(handle) = existing {
            self.scheduler.cancel_callback(handle);
        }
        let priority: SchedulerPriority = EventPriority::from_lanes(next).scheduler_priority();
        let handle = self.scheduler.schedule_callback(priority, Task::PerformWork(root));
        tracing::trace!(?root, ?next, ?priority, "Scheduled root callback");
        if let Some(fiber_root) = self.roots.get_mut(root) {
            fiber_root.callback_node = Some(handle);
            fiber_root.callback_priority = priority_lane;
        }
        priority_lane
    }

    /// Renders and commits every root whose next lanes include the sync lane,
    /// until none is left.
    pub(crate) fn flush_sync_work_on_all_roots(&mut self) -> Result<(), ReconcilerError> {
        if self.ctx.is_flushing_work || !self.ctx.might_have_pending_sync_work {
            return Ok(());
        }
        self.ctx.is_flushing_work = true;
        let result = self.flush_sync_work_loop();
        self.ctx.is_flushing_work = false;
        result
    }

    fn flush_sync_work_loop(&mut self) -> Result<(), ReconcilerError> {
        loop {
            let mut did_perform_work = false;
            for root in self.ctx.scheduled_roots.clone() {
                let wip_lanes = self.ctx.wip_lanes_for(root);
                let Some(fiber_root) = self.roots.get(root) else {
                    continue;
                };
                let next = fiber_root.get_next_lanes(wip_lanes);
                if next.includes_sync_lane() {
                    did_perform_work = true;
                    self.perform_sync_work_on_root(root, next)?;
                }
            }
            if !did_perform_work {
                self.ctx.might_have_pending_sync_work = false;
                return Ok(());
            }
        }
    }

    /// Marks `lane` on `fiber` and on the child lanes of every ancestor, on
    /// both records of each position. Returns the root the fiber belongs to.
    pub(crate) fn mark_update_lane_from_fiber_to_root(
        &mut self,
        fiber: FiberId,
        lane: Lane,
    ) -> Option<RootId> {
        let source = self.fibers.get_mut(fiber)?;
        source.lanes |= lane;
        let alternate = source.alternate;
        let mut parent = source.parent;
        if let Some(alternate) = alternate
            && let Some(other) = self.fibers.get_mut(alternate)
        {
            other.lanes |= lane;
        }

        let mut node = fiber;
        while let Some(id) = parent {
            let Some(ancestor) = self.fibers.get_mut(id) else {
                break;
            };
            ancestor.child_lanes |= lane;
            let alternate = ancestor.alternate;
            parent = ancestor.parent;
            if let Some(alternate) = alternate
                && let Some(other) = self.fibers.get_mut(alternate)
            {
                other.child_lanes |= lane;
            }
            node = id;
        }

        let top = self.fibers.get(node)?;
        match (&top.kind, &top.state_node) {
            (FiberKind::HostRoot, StateNode::Root(root)) => Some(*root),
            _ => None,
        }
    }

    /// Records a new update on `root` and schedules it.
    pub(crate) fn schedule_update_on_root(
        &mut self,
        root: RootId,
        lane: Lane,
    ) -> Result<(), ReconcilerError> {
        self.throw_if_infinite_update_loop_detected()?;

        let is_wip_root = self.ctx.wip_root == Some(root);
        let has_pending_commit = self
            .roots
            .get(root)
            .is_some_and(|fiber_root| fiber_root.pending_commit.is_some());
        if (is_wip_root && self.ctx.suspended_reason == SuspendedReason::OnData)
            || has_pending_commit
        {
            // The suspended attempt can't finish with this update in it.
            let lanes = self.ctx.wip_render_lanes;
            self.prepare_fresh_stack(root, Lanes::NONE);
            self.mark_root_suspended(root, lanes);
        }

        let Some(fiber_root) = self.roots.get_mut(root) else {
            return Err(ReconcilerError::UnknownRoot);
        };
        fiber_root.mark_updated(lane);

        if self.ctx.execution.contains(ExecutionContext::RENDER) && is_wip_root {
            self.ctx.render_phase_updated_lanes |= lane;
            return Ok(());
        }
        if self.ctx.wip_root == Some(root) {
            if !self.ctx.execution.contains(ExecutionContext::RENDER) {
                self.ctx.interleaved_updated_lanes |= lane;
            }
            if self.ctx.exit_status == RootExitStatus::SuspendedWithDelay {
                let lanes = self.ctx.wip_render_lanes;
                self.mark_root_suspended(root, lanes);
            }
        }
        self.ensure_root_is_scheduled(root);
        Ok(())
    }

    fn throw_if_infinite_update_loop_detected(&mut self) -> Result<(), ReconcilerError> {
        if self.ctx.nested_update_count > self.config.nested_update_limit {
            let count = self.ctx.nested_update_count;
            self.ctx.nested_update_count = 0;
            self.ctx.nested_update_root = None;
            tracing::error!(count, "Maximum update depth exceeded");
            return Err(ReconcilerError::MaximumUpdateDepth { count });
        }
        if self.ctx.nested_passive_update_count > self.config.passive_nested_update_limit {
            self.ctx.nested_passive_update_count = 0;
            self.ctx.root_with_nested_passive_updates = None;
            tracing::warn!(
                "Maximum update depth exceeded by passive effects. An effect probably sets state \
                 on every render."
            );
        }
        Ok(())
    }

    /// Marks lanes as suspended, excluding lanes that were pinged or updated
    /// while the render ran.
    pub(crate) fn mark_root_suspended(&mut self, root: RootId, lanes: Lanes) {
        let lanes = lanes
            .remove(self.ctx.pinged_lanes)
            .remove(self.ctx.interleaved_updated_lanes);
        if let Some(fiber_root) = self.roots.get_mut(root) {
            fiber_root.mark_suspended(lanes);
        }
    }

    /// Drains the inbox and applies every signal.
    pub(crate) fn process_pending_signals(&mut self) -> Result<(), ReconcilerError> {
        loop {
            let signals = self.inbox.drain();
            if signals.is_empty() {
                return Ok(());
            }
            for signal in signals {
                self.apply_signal(signal)?;
            }
        }
    }

    fn apply_signal(&mut self, signal: Signal) -> Result<(), ReconcilerError> {
        match signal {
            Signal::Update { fiber, lane } => {
                let Some(root) = self.mark_update_lane_from_fiber_to_root(fiber, lane) else {
                    tracing::trace!(?fiber, "Dropped an update for an unmounted node");
                    return Ok(());
                };
                self.schedule_update_on_root(root, lane)
            }
            Signal::Ping {
                root,
                wakeable,
                lanes,
            } => {
                self.ping_suspended_root(root, wakeable, lanes);
                Ok(())
            }
            Signal::Resume { root, wakeable } => {
                if self.ctx.wip_root == Some(root)
                    && self.ctx.suspended_reason == SuspendedReason::OnData
                    && self.ctx.resume_listener == Some(wakeable)
                {
                    self.ctx.suspended_reason = SuspendedReason::AndReadyToContinue;
                }
                if self.roots.contains_key(root) {
                    self.ensure_root_is_scheduled(root);
                }
                Ok(())
            }
            Signal::Retry { boundary, lane } => self.retry_timed_out_boundary(boundary, lane),
            Signal::Detach { boundary } => {
                self.detach_boundary(boundary);
                Ok(())
            }
            Signal::Attach { boundary } => {
                self.attach_boundary(boundary);
                Ok(())
            }
        }
    }
}
