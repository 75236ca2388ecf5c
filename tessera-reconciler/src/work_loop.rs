//! The engine and its render loop.
//!
//! ## Usage
//!
//! ```
//! use tessera_reconciler::{
//!     Element, HostProps, Reconciler, ReconcilerConfig, RootOptions,
//!     test_renderer::TestRenderer, test_scheduler::TestScheduler,
//! };
//!
//! let mut reconciler = Reconciler::new(
//!     TestRenderer::default(),
//!     TestScheduler::default(),
//!     ReconcilerConfig::default(),
//! );
//! let root = reconciler.create_root((), RootOptions::default());
//! reconciler
//!     .render(root, Element::host("div", HostProps::new(), vec![Element::text("hi")]))
//!     .unwrap();
//! reconciler.flush_all().unwrap();
//! assert_eq!(reconciler.host().markup(), "<div>hi</div>");
//! ```
//!
//! A render walks the work-in-progress tree depth first. `begin_work` renders
//! a node and returns its first child; once a node has no more children to
//! visit, `complete_work` finishes it and the walk moves to its sibling or
//! back up to its parent. Concurrent renders check
//! [`HostScheduler::should_yield`] between nodes and resume from the same
//! cursor on the next callback.

use std::sync::Arc;

use rustc_hash::FxHashSet as HashSet;
use slotmap::SlotMap;

use crate::{
    cache::Cache,
    config::{ReconcilerConfig, RootOptions},
    element::Element,
    error::{ReconcilerError, RenderSignal},
    fiber::{Fiber, FiberArena, FiberId, FiberKind, FiberQueue, FiberState, Flags, RootAction, RootState, StateNode},
    host::{CallbackHandle, HostConfig, HostScheduler, Task, TaskStatus},
    inbox::Inbox,
    lane::{EventPriority, Lane, Lanes},
    root::{FiberRoot, PendingCommit, RootId},
    scheduler::{ExecutionContext, RootExitStatus, SchedulerContext, SuspendedReason},
    update_queue::{Update, UpdateQueue},
};

/// A reconciler instance owning every mounted root.
///
/// All methods must be called from one thread. Hook setters, wakeables and
/// suspense handles may be used from any thread; their effects reach the
/// engine through [`Reconciler::process_signals`], which every task entry
/// point calls first.
pub struct Reconciler<H: HostConfig, S: HostScheduler> {
    pub(crate) host: H,
    pub(crate) scheduler: S,
    pub(crate) config: ReconcilerConfig,
    pub(crate) fibers: FiberArena<H::Instance>,
    pub(crate) roots: SlotMap<RootId, FiberRoot<H::Container>>,
    pub(crate) ctx: SchedulerContext,
    pub(crate) inbox: Arc<Inbox>,
}

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Creates an engine rendering into `host` and scheduling on `scheduler`.
    pub fn new(host: H, scheduler: S, config: ReconcilerConfig) -> Self {
        Self {
            host,
            scheduler,
            config,
            fibers: FiberArena::default(),
            roots: SlotMap::with_key(),
            ctx: SchedulerContext::default(),
            inbox: Arc::new(Inbox::default()),
        }
    }

    /// The rendering backend.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The rendering backend, mutably.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// The host scheduler.
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// The host scheduler, mutably.
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// The engine configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Mounts an empty root rendering into `container`.
    #[tracing::instrument(level = "debug", skip(self, container, options))]
    pub fn create_root(&mut self, container: H::Container, options: RootOptions) -> RootId {
        let cache = Cache::new();
        cache.retain();
        let state = RootState {
            element: None,
            cache,
        };
        let mut fiber = Fiber::new(FiberKind::HostRoot, None, None);
        fiber.memoized_state = FiberState::Root(state.clone());
        fiber.update_queue = FiberQueue::Root(UpdateQueue::new(state));
        let current = self.fibers.insert(fiber);
        let prefix = options.identifier_prefix.clone();
        let root = self
            .roots
            .insert(FiberRoot::new(container, current, options));
        self.fibers[current].state_node = StateNode::Root(root);
        tracing::debug!(?root, prefix = %prefix, "Created root");
        root
    }

    /// Schedules `element` as the new content of `root` at the lane of the
    /// current execution context. Returns that lane.
    pub fn render(&mut self, root: RootId, element: Element) -> Result<Lane, ReconcilerError> {
        let lane = self.inbox.request_update_lane();
        self.schedule_update(root, Some(element), lane)?;
        Ok(lane)
    }

    /// Schedules new content for `root` at an explicit lane. `None` renders
    /// nothing.
    pub fn schedule_update(
        &mut self,
        root: RootId,
        element: Option<Element>,
        lane: Lane,
    ) -> Result<(), ReconcilerError> {
        self.enqueue_root_action(root, RootAction::Render(element), lane)
    }

    /// Replaces the cache of `root` with a fresh one in a transition. The
    /// old cache is released once the new one commits.
    pub fn refresh_cache(&mut self, root: RootId) -> Result<Lane, ReconcilerError> {
        let lane = self.inbox.claim_transition_lane();
        self.enqueue_root_action(root, RootAction::RefreshCache(Cache::new()), lane)?;
        Ok(lane)
    }

    fn enqueue_root_action(
        &mut self,
        root: RootId,
        action: RootAction,
        lane: Lane,
    ) -> Result<(), ReconcilerError> {
        let current = match self.roots.get(root) {
            Some(fiber_root) if !fiber_root.unmounted => fiber_root.current,
            _ => return Err(ReconcilerError::UnknownRoot),
        };
        let FiberQueue::Root(queue) = &self.fibers[current].update_queue else {
            return Err(ReconcilerError::UnknownRoot);
        };
        queue.enqueue(Update::new(lane, action));
        let shared = queue.shared.clone();

        let root = self
            .mark_update_lane_from_fiber_to_root(current, lane)
            .ok_or(ReconcilerError::UnknownRoot)?;
        self.schedule_update_on_root(root, lane)?;

        if lane.is_transition()
            && let Some(fiber_root) = self.roots.get_mut(root)
        {
            // Transitions that touch the root queue must finish together.
            let mut shared = shared.lock();
            let lanes = (shared.lanes & fiber_root.pending_lanes) | lane;
            shared.lanes = lanes;
            fiber_root.mark_entangled(lanes);
        }
        Ok(())
    }

    /// Unmounts everything rendered into `root` synchronously, runs every
    /// cleanup and forgets the root.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unmount(&mut self, root: RootId) -> Result<(), ReconcilerError> {
        self.flush_sync(|reconciler| reconciler.schedule_update(root, None, Lanes::SYNC))??;
        self.flush_passive_effects()?;

        let Some(mut fiber_root) = self.roots.remove(root) else {
            return Ok(());
        };
        fiber_root.unmounted = true;
        if let Some(handle) = fiber_root.callback_node.take() {
            self.scheduler.cancel_callback(handle);
        }
        if let Some(handle) = fiber_root.timeout_handle.take() {
            self.scheduler.cancel_callback(handle);
        }
        self.ctx.scheduled_roots.retain(|id| *id != root);
        if self.ctx.wip_root == Some(root) {
            self.reset_work_in_progress_stack();
        }

        let current = fiber_root.current;
        if let Some(FiberState::Root(state)) = self.fibers.get(current).map(|f| &f.memoized_state)
            && state.cache.release()
        {
            let cache = state.cache.clone();
            self.schedule_cache_disposal(cache);
        }
        for id in fiber_root.allocated.drain(..) {
            self.fibers.remove(id);
        }
        let alternate = self.fibers.get(current).and_then(|fiber| fiber.alternate);
        self.fibers.remove(current);
        if let Some(alternate) = alternate {
            self.fibers.remove(alternate);
        }
        Ok(())
    }

    /// Runs `f` at discrete priority, then renders and commits all resulting
    /// synchronous work before returning.
    pub fn flush_sync<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R, ReconcilerError> {
        let idle = !self
            .ctx
            .execution
            .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT);
        if idle {
            self.flush_passive_effects()?;
        }
        let previous = self.inbox.set_update_priority(Some(EventPriority::Discrete));
        let result = f(self);
        self.inbox.set_update_priority(previous);
        self.process_pending_signals()?;
        if idle {
            self.flush_sync_work_on_all_roots()?;
        }
        Ok(result)
    }

    /// Runs `f` inside a transition: updates it schedules use a transition lane.
    pub fn start_transition<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.inbox.enter_transition();
        let result = f(self);
        self.inbox.exit_transition();
        result
    }

    /// Runs `f` with `priority` as the ambient update priority.
    pub fn with_priority<R>(&mut self, priority: EventPriority, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.inbox.set_update_priority(Some(priority));
        let result = f(self);
        self.inbox.set_update_priority(previous);
        result
    }

    /// Priority updates scheduled right now would get.
    pub fn current_update_priority(&self) -> Option<EventPriority> {
        self.inbox.update_priority()
    }

    /// Runs a task the engine scheduled through
    /// [`HostScheduler::schedule_callback`] or
    /// [`HostScheduler::schedule_timeout`].
    pub fn run_task(
        &mut self,
        handle: CallbackHandle,
        task: Task,
        did_timeout: bool,
    ) -> Result<TaskStatus, ReconcilerError> {
        self.run(Some(handle), task, did_timeout)
    }

    /// Runs a task the engine scheduled through
    /// [`HostScheduler::schedule_microtask`].
    pub fn run_microtask(&mut self, task: Task) -> Result<(), ReconcilerError> {
        self.run(None, task, false).map(|_| ())
    }

    fn run(
        &mut self,
        handle: Option<CallbackHandle>,
        task: Task,
        did_timeout: bool,
    ) -> Result<TaskStatus, ReconcilerError> {
        self.process_pending_signals()?;
        match task {
            Task::PerformWork(root) => match handle {
                Some(handle) => self.perform_work_on_root_via_scheduler_task(root, handle, did_timeout),
                None => Ok(TaskStatus::Done),
            },
            Task::ProcessRootSchedule => {
                self.process_root_schedule_in_microtask()?;
                Ok(TaskStatus::Done)
            }
            Task::FlushPassiveEffects => {
                self.flush_passive_effects()?;
                Ok(TaskStatus::Done)
            }
            Task::CommitSuspended(root) => {
                self.commit_suspended(root)?;
                Ok(TaskStatus::Done)
            }
            Task::DisposeCache(cache) => {
                cache.dispose();
                Ok(TaskStatus::Done)
            }
        }
    }

    /// Applies every update, ping and retry received from other threads
    /// since the last call.
    pub fn process_signals(&mut self) -> Result<(), ReconcilerError> {
        self.process_pending_signals()
    }

    /// Whether signals are waiting for [`Reconciler::process_signals`].
    pub fn has_pending_signals(&self) -> bool {
        self.inbox.has_signals()
    }

    /// Installs a callback run whenever another thread sends the engine a
    /// signal, so the embedder can wake its event loop.
    pub fn set_signal_notifier(&self, notify: Option<Arc<dyn Fn() + Send + Sync>>) {
        self.inbox.set_notify(notify);
    }

    /// Lanes with pending work on `root`.
    pub fn pending_lanes(&self, root: RootId) -> Option<Lanes> {
        self.roots.get(root).map(|fiber_root| fiber_root.pending_lanes)
    }

    /// The container `root` renders into.
    pub fn container(&self, root: RootId) -> Option<&H::Container> {
        self.roots.get(root).map(|fiber_root| &fiber_root.container)
    }

    /// Number of live node records, both committed and work in progress.
    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    fn perform_work_on_root_via_scheduler_task(
        &mut self,
        root: RootId,
        handle: CallbackHandle,
        did_timeout: bool,
    ) -> Result<TaskStatus, ReconcilerError> {
        if self.ctx.pending_passive.is_some() {
            self.flush_passive_effects()?;
            let still_scheduled = self
                .roots
                .get(root)
                .is_some_and(|fiber_root| fiber_root.callback_node == Some(handle));
            if !still_scheduled {
                return Ok(TaskStatus::Done);
            }
        }

        let wip_lanes = self.ctx.wip_lanes_for(root);
        let Some(fiber_root) = self.roots.get(root) else {
            return Ok(TaskStatus::Done);
        };
        let original = fiber_root.callback_node;
        let lanes = fiber_root.get_next_lanes(wip_lanes);
        if lanes.is_empty() {
            return Ok(TaskStatus::Done);
        }

        self.perform_work_on_root(root, lanes, did_timeout)?;

        let now = self.scheduler.now();
        self.schedule_task_for_root_during_microtask(root, now);
        let next = self.roots.get(root).and_then(|fiber_root| fiber_root.callback_node);
        if next.is_some() && next == original {
            return Ok(TaskStatus::Continue);
        }
        Ok(TaskStatus::Done)
    }

    pub(crate) fn perform_sync_work_on_root(
        &mut self,
        root: RootId,
        lanes: Lanes,
    ) -> Result<(), ReconcilerError> {
        if self.flush_passive_effects()? {
            // Passive effects may have scheduled more urgent work.
            self.ensure_root_is_scheduled(root);
            return Ok(());
        }
        self.perform_work_on_root(root, lanes, true)
    }

    /// Renders `lanes` of `root` and commits the result when it is ready.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn perform_work_on_root(
        &mut self,
        root: RootId,
        lanes: Lanes,
        force_sync: bool,
    ) -> Result<(), ReconcilerError> {
        if self
            .ctx
            .execution
            .intersects(ExecutionContext::RENDER | ExecutionContext::COMMIT)
        {
            tracing::error!(?root, "Render requested while already working");
            return Ok(());
        }
        let Some(fiber_root) = self.roots.get(root) else {
            return Err(ReconcilerError::UnknownRoot);
        };

        let mut lanes = lanes;
        let mut render_was_concurrent = !force_sync && fiber_root.should_time_slice(lanes);
        let mut exit = if render_was_concurrent {
            self.render_root_concurrent(root, lanes)
        } else {
            self.render_root_sync(root, lanes)
        };

        loop {
            if exit == RootExitStatus::InProgress {
                break;
            }
            let Some(finished) = self
                .roots
                .get(root)
                .and_then(|fiber_root| self.fibers.get(fiber_root.current))
                .and_then(|current| current.alternate)
            else {
                break;
            };

            if render_was_concurrent && !self.is_render_consistent_with_external_stores(finished) {
                tracing::debug!(?root, "Store changed during a concurrent render; rendering again");
                exit = self.render_root_sync(root, lanes);
                render_was_concurrent = false;
                continue;
            }

            if exit == RootExitStatus::Errored {
                let original = lanes;
                let retry = self
                    .roots
                    .get(root)
                    .map_or(Lanes::NONE, |fiber_root| fiber_root.lanes_to_retry_on_error(original));
                if !retry.is_empty() && self.config.max_error_retries > 0 {
                    lanes = retry;
                    exit = self.recover_from_concurrent_error(root, original, retry);
                    render_was_concurrent = false;
                    if exit != RootExitStatus::Errored {
                        continue;
                    }
                }
            }

            if exit == RootExitStatus::FatalErrored {
                tracing::error!(?root, "Render failed outside of any boundary");
                self.prepare_fresh_stack(root, Lanes::NONE);
                self.mark_root_suspended(root, lanes);
                break;
            }

            self.finish_concurrent_render(root, finished, exit, lanes)?;
            break;
        }

        self.ensure_root_is_scheduled(root);
        Ok(())
    }

    fn recover_from_concurrent_error(
        &mut self,
        root: RootId,
        original: Lanes,
        retry: Lanes,
    ) -> RootExitStatus {
        let errors_from_first_attempt = std::mem::take(&mut self.ctx.concurrent_errors);
        let mut exit = RootExitStatus::Errored;
        for attempt in 0..self.config.max_error_retries {
            tracing::debug!(?root, attempt, "Retrying render after an error");
            exit = self.render_root_sync(root, retry);
            if exit != RootExitStatus::Errored {
                break;
            }
        }
        if exit == RootExitStatus::Errored {
            if let Some(fiber_root) = self.roots.get_mut(root) {
                fiber_root.error_recovery_disabled_lanes |= original;
            }
        } else {
            let from_retry = std::mem::take(&mut self.ctx.recoverable_errors);
            self.ctx.recoverable_errors = errors_from_first_attempt;
            self.ctx.recoverable_errors.extend(from_retry);
        }
        exit
    }

    fn finish_concurrent_render(
        &mut self,
        root: RootId,
        finished: FiberId,
        exit: RootExitStatus,
        lanes: Lanes,
    ) -> Result<(), ReconcilerError> {
        match exit {
            RootExitStatus::InProgress | RootExitStatus::FatalErrored => return Ok(()),
            RootExitStatus::SuspendedAtShell => {
                tracing::debug!(?root, ?lanes, "Suspended outside of any boundary");
                self.mark_root_suspended(root, lanes);
                return Ok(());
            }
            RootExitStatus::SuspendedWithDelay if lanes.includes_only_transitions() => {
                tracing::debug!(?root, ?lanes, "Keeping the previous screen while suspended");
                self.mark_root_suspended(root, lanes);
                return Ok(());
            }
            _ => {}
        }

        if exit == RootExitStatus::Suspended && lanes.includes_only_retries() {
            let now = self.scheduler.now();
            let due = self.ctx.most_recent_fallback_time + self.config.retry_throttle_ms;
            let wait = due.saturating_sub(now);
            if wait > 10 {
                self.mark_root_suspended(root, lanes);
                let other_work = self
                    .roots
                    .get(root)
                    .is_some_and(|fiber_root| !fiber_root.get_next_lanes(Lanes::NONE).is_empty());
                if other_work {
                    return Ok(());
                }
                let handle = self
                    .scheduler
                    .schedule_timeout(wait, Task::CommitSuspended(root));
                if let Some(fiber_root) = self.roots.get_mut(root) {
                    fiber_root.timeout_handle = Some(handle);
                    fiber_root.pending_commit = Some(PendingCommit {
                        finished_work: finished,
                        lanes,
                    });
                }
                tracing::debug!(?root, wait, "Throttled a retry commit");
                return Ok(());
            }
        }

        self.commit_root(root, finished, lanes)
    }

    fn commit_suspended(&mut self, root: RootId) -> Result<(), ReconcilerError> {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            return Ok(());
        };
        fiber_root.timeout_handle = None;
        let Some(pending) = fiber_root.pending_commit.take() else {
            return Ok(());
        };
        if !self.fibers.contains(pending.finished_work) {
            return Ok(());
        }
        self.commit_root(root, pending.finished_work, pending.lanes)?;
        self.ensure_root_is_scheduled(root);
        Ok(())
    }

    fn is_render_consistent_with_external_stores(&self, finished: FiberId) -> bool {
        let mut stack = vec![finished];
        while let Some(id) = stack.pop() {
            let Some(fiber) = self.fibers.get(id) else {
                continue;
            };
            if fiber.flags.contains(Flags::STORE_CONSISTENCY)
                && let FiberQueue::Function(queue) = &fiber.update_queue
                && queue.stores.iter().any(|check| !check.is_consistent())
            {
                return false;
            }
            if fiber.subtree_flags.contains(Flags::STORE_CONSISTENCY) {
                stack.extend(self.fibers.children(id));
            }
        }
        true
    }

    /// Throws away any render in progress and starts a new one for `lanes`.
    /// With no lanes, only the old render is discarded.
    pub(crate) fn prepare_fresh_stack(&mut self, root: RootId, lanes: Lanes) {
        if let Some(fiber_root) = self.roots.get_mut(root) {
            if let Some(handle) = fiber_root.timeout_handle.take() {
                self.scheduler.cancel_callback(handle);
            }
            fiber_root.pending_commit = None;
        }
        if let Some(previous) = self.ctx.wip_root
            && previous != root
        {
            self.discard_allocated(previous);
        }
        self.discard_allocated(root);
        self.reset_work_in_progress_stack();

        if lanes.is_empty() {
            return;
        }
        let Some(fiber_root) = self.roots.get(root) else {
            return;
        };
        let current = fiber_root.current;
        let entangled = fiber_root.get_entangled_lanes(lanes);
        let wip = self.work_in_progress(current, None);

        self.ctx.wip_root = Some(root);
        self.ctx.wip = Some(wip);
        self.ctx.wip_render_lanes = lanes;
        self.ctx.entangled_render_lanes = entangled;
        tracing::trace!(?root, ?lanes, "Prepared a fresh stack");
    }

    fn reset_work_in_progress_stack(&mut self) {
        let ctx = &mut self.ctx;
        ctx.wip_root = None;
        ctx.wip = None;
        ctx.wip_render_lanes = Lanes::NONE;
        ctx.entangled_render_lanes = Lanes::NONE;
        ctx.suspended_reason = SuspendedReason::NotSuspended;
        ctx.thrown_value = None;
        ctx.resume_listener = None;
        ctx.exit_status = RootExitStatus::InProgress;
        ctx.skipped_lanes = Lanes::NONE;
        ctx.interleaved_updated_lanes = Lanes::NONE;
        ctx.render_phase_updated_lanes = Lanes::NONE;
        ctx.pinged_lanes = Lanes::NONE;
        ctx.concurrent_errors.clear();
        ctx.recoverable_errors.clear();
        ctx.suspense_handler_stack.clear();
        ctx.shell_boundary = None;
        ctx.context_stack.reset();
        ctx.hidden_stack.clear();
    }

    /// Frees records that only an uncommitted render of `root` refers to.
    /// Alternates of committed records stay; the next render reuses them.
    fn discard_allocated(&mut self, root: RootId) {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            return;
        };
        let allocated = std::mem::take(&mut fiber_root.allocated);
        for id in allocated {
            self.fibers.remove(id);
        }
    }

    /// Frees records created by the last render that the committed tree
    /// does not reach.
    pub(crate) fn collect_unreachable(&mut self, root: RootId, finished: FiberId) {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            return;
        };
        let allocated = std::mem::take(&mut fiber_root.allocated);
        if allocated.is_empty() {
            return;
        }
        let reachable: HashSet<FiberId> = self.fibers.subtree(finished).into_iter().collect();
        let mut freed = 0usize;
        for id in allocated {
            if !reachable.contains(&id) {
                self.fibers.remove(id);
                freed += 1;
            }
        }
        if freed > 0 {
            tracing::trace!(?root, freed, "Collected abandoned records");
        }
    }

    /// Work-in-progress record for `current`.
    pub(crate) fn work_in_progress(&mut self, current: FiberId, props: Option<Element>) -> FiberId {
        self.fibers.create_work_in_progress(current, props)
    }

    /// Fresh record for `element`, owned by the render in progress until a
    /// commit adopts it.
    pub(crate) fn create_fiber(&mut self, element: &Element, lanes: Lanes) -> FiberId {
        let id = self.fibers.create_from_element(element, lanes);
        if let Some(root) = self.ctx.wip_root
            && let Some(fiber_root) = self.roots.get_mut(root)
        {
            fiber_root.allocated.push(id);
        }
        id
    }

    fn render_root_sync(&mut self, root: RootId, lanes: Lanes) -> RootExitStatus {
        let previous = self.ctx.execution;
        self.ctx.execution |= ExecutionContext::RENDER;
        self.inbox.set_render_lanes(Some(lanes));
        if self.ctx.wip_root != Some(root) || self.ctx.wip_render_lanes != lanes {
            self.prepare_fresh_stack(root, lanes);
        }

        loop {
            if self.ctx.suspended_reason != SuspendedReason::NotSuspended
                && let Some(unit) = self.ctx.wip
            {
                self.ctx.suspended_reason = SuspendedReason::NotSuspended;
                self.ctx.resume_listener = None;
                if let Some(thrown) = self.ctx.thrown_value.take() {
                    self.throw_and_unwind_work_loop(root, unit, thrown);
                }
            }
            self.work_loop_sync();
            if self.ctx.suspended_reason == SuspendedReason::NotSuspended || self.ctx.wip.is_none() {
                break;
            }
        }

        self.ctx.execution = previous;
        self.inbox.set_render_lanes(None);
        self.finish_render_pass()
    }

    fn render_root_concurrent(&mut self, root: RootId, lanes: Lanes) -> RootExitStatus {
        let previous = self.ctx.execution;
        self.ctx.execution |= ExecutionContext::RENDER;
        self.inbox.set_render_lanes(Some(lanes));
        if self.ctx.wip_root != Some(root) || self.ctx.wip_render_lanes != lanes {
            self.prepare_fresh_stack(root, lanes);
        }

        'outer: loop {
            if self.ctx.suspended_reason != SuspendedReason::NotSuspended
                && let Some(unit) = self.ctx.wip
            {
                let settled = match &self.ctx.thrown_value {
                    Some(RenderSignal::Suspend(wakeable)) => wakeable.is_settled(),
                    _ => false,
                };
                match self.ctx.suspended_reason {
                    SuspendedReason::OnData if settled => {
                        self.ctx.suspended_reason = SuspendedReason::NotSuspended;
                        self.ctx.thrown_value = None;
                        self.replay_suspended_unit_of_work(unit);
                    }
                    SuspendedReason::OnData => {
                        self.listen_for_resume(root);
                        break 'outer;
                    }
                    SuspendedReason::OnImmediate => {
                        // Yield once so the awaited value gets a chance to settle.
                        self.ctx.suspended_reason = SuspendedReason::AndReadyToContinue;
                        break 'outer;
                    }
                    SuspendedReason::AndReadyToContinue if settled => {
                        self.ctx.suspended_reason = SuspendedReason::NotSuspended;
                        self.ctx.thrown_value = None;
                        self.replay_suspended_unit_of_work(unit);
                    }
                    _ => {
                        self.ctx.suspended_reason = SuspendedReason::NotSuspended;
                        self.ctx.resume_listener = None;
                        if let Some(thrown) = self.ctx.thrown_value.take() {
                            self.throw_and_unwind_work_loop(root, unit, thrown);
                        }
                    }
                }
            }
            self.work_loop_concurrent();
            if self.ctx.suspended_reason == SuspendedReason::NotSuspended || self.ctx.wip.is_none() {
                break;
            }
            if self.scheduler.should_yield() {
                break;
            }
        }

        self.ctx.execution = previous;
        self.inbox.set_render_lanes(None);
        if self.ctx.wip.is_some() {
            return RootExitStatus::InProgress;
        }
        self.finish_render_pass()
    }

    /// Ends a render whose cursor ran off the tree.
    fn finish_render_pass(&mut self) -> RootExitStatus {
        if self.ctx.wip.is_some() {
            return RootExitStatus::InProgress;
        }
        self.ctx.wip_root = None;
        self.ctx.wip_render_lanes = Lanes::NONE;
        self.ctx.exit_status
    }

    fn listen_for_resume(&mut self, root: RootId) {
        let Some(RenderSignal::Suspend(wakeable)) = &self.ctx.thrown_value else {
            return;
        };
        if self.ctx.resume_listener == Some(wakeable.id()) {
            return;
        }
        let id = wakeable.id();
        self.ctx.resume_listener = Some(id);
        let inbox = Arc::downgrade(&self.inbox);
        wakeable.subscribe(move || {
            if let Some(inbox) = inbox.upgrade() {
                inbox.push(crate::inbox::Signal::Resume { root, wakeable: id });
            }
        });
    }

    fn work_loop_sync(&mut self) {
        while let Some(unit) = self.ctx.wip {
            if self.ctx.suspended_reason != SuspendedReason::NotSuspended {
                return;
            }
            self.perform_unit_of_work(unit);
        }
    }

    fn work_loop_concurrent(&mut self) {
        while let Some(unit) = self.ctx.wip {
            if self.ctx.suspended_reason != SuspendedReason::NotSuspended
                || self.scheduler.should_yield()
            {
                return;
            }
            self.perform_unit_of_work(unit);
        }
    }

    fn perform_unit_of_work(&mut self, unit: FiberId) {
        let current = self.fibers[unit].alternate;
        let render_lanes = self.ctx.entangled_render_lanes;
        match self.begin_work(current, unit, render_lanes) {
            Ok(next) => {
                let fiber = &mut self.fibers[unit];
                fiber.memoized_props = fiber.pending_props.clone();
                match next {
                    Some(child) => self.ctx.wip = Some(child),
                    None => self.complete_unit_of_work(unit),
                }
            }
            Err(thrown) => self.handle_throw(thrown),
        }
    }

    fn replay_suspended_unit_of_work(&mut self, unit: FiberId) {
        let render_lanes = self.ctx.entangled_render_lanes;
        self.fibers.reset_work_in_progress(unit, render_lanes);
        self.perform_unit_of_work(unit);
    }

    fn handle_throw(&mut self, thrown: RenderSignal) {
        self.ctx.suspended_reason = match &thrown {
            RenderSignal::Suspend(_) => {
                if self.should_remain_on_previous_screen()
                    && !self.ctx.skipped_lanes.includes_non_idle_work()
                    && !self.ctx.interleaved_updated_lanes.includes_non_idle_work()
                {
                    SuspendedReason::OnData
                } else {
                    SuspendedReason::OnImmediate
                }
            }
            RenderSignal::Error(_) => SuspendedReason::OnError,
        };
        tracing::trace!(reason = ?self.ctx.suspended_reason, "Unit of work threw");
        self.ctx.thrown_value = Some(thrown);
    }

    fn throw_and_unwind_work_loop(&mut self, root: RootId, unit: FiberId, thrown: RenderSignal) {
        if self.fibers[unit].parent.is_none() {
            self.ctx.exit_status = RootExitStatus::FatalErrored;
            self.ctx.wip = None;
            return;
        }
        if let Err(error) = self.throw_exception(root, unit, thrown) {
            tracing::error!(?root, %error, "Render threw outside of the tree");
            self.ctx.exit_status = RootExitStatus::FatalErrored;
            self.ctx.wip = None;
            return;
        }
        if self.fibers[unit].flags.contains(Flags::INCOMPLETE) {
            self.unwind_unit_of_work(unit);
        } else {
            self.complete_unit_of_work(unit);
        }
    }

    fn complete_unit_of_work(&mut self, unit: FiberId) {
        let mut completed = unit;
        loop {
            if self.fibers[completed].flags.contains(Flags::INCOMPLETE) {
                self.unwind_unit_of_work(completed);
                return;
            }
            let current = self.fibers[completed].alternate;
            let render_lanes = self.ctx.entangled_render_lanes;
            self.complete_work(current, completed, render_lanes);

            let fiber = &self.fibers[completed];
            if let Some(sibling) = fiber.sibling {
                self.ctx.wip = Some(sibling);
                return;
            }
            match fiber.parent {
                Some(parent) => {
                    completed = parent;
                    self.ctx.wip = Some(parent);
                }
                None => break,
            }
        }
        if self.ctx.exit_status == RootExitStatus::InProgress {
            self.ctx.exit_status = RootExitStatus::Completed;
        }
        self.ctx.wip = None;
    }

    fn unwind_unit_of_work(&mut self, unit: FiberId) {
        let mut incomplete = unit;
        loop {
            if let Some(next) = self.unwind_work(incomplete) {
                // A boundary captured; render it again with the capture flag.
                self.fibers[next].flags &= Flags::HOST_EFFECT_MASK;
                self.ctx.wip = Some(next);
                return;
            }
            let Some(parent) = self.fibers[incomplete].parent else {
                break;
            };
            let fiber = &mut self.fibers[parent];
            fiber.flags |= Flags::INCOMPLETE;
            fiber.subtree_flags = Flags::empty();
            fiber.deletions.clear();
            incomplete = parent;
        }
        self.ctx.exit_status = RootExitStatus::SuspendedAtShell;
        self.ctx.wip = None;
    }
}
