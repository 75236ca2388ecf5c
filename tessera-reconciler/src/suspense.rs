//! Suspense and error capture.
//!
//! ## Usage
//!
//! A component suspends by returning [`RenderSignal::Suspend`] with a
//! [`crate::Wakeable`], usually through [`crate::RenderContext::use_awaitable`].
//! The nearest suspense boundary shows its fallback until the wakeable
//! settles; a [`SuspenseHandle`] lets embedders retry or park a boundary by
//! hand.
//!
//! ```
//! use tessera_reconciler::{Element, SuspenseHandle};
//!
//! let handle = SuspenseHandle::new();
//! let boundary = Element::suspense(vec![Element::text("loading")], vec![])
//!     .with_suspense_handle(handle.clone());
//! assert!(!handle.is_bound());
//! # let _ = boundary;
//! ```

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{
    element::ElementKind,
    error::{ErrorInfo, ReconcilerError, RenderSignal},
    fiber::{BoundaryAction, FiberId, FiberKind, FiberQueue, Flags, RootAction},
    host::{HostConfig, HostScheduler},
    inbox::{Inbox, Signal},
    lane::{Lane, Lanes},
    root::RootId,
    scheduler::{ExecutionContext, RootExitStatus},
    update_queue::{Update, UpdateCallback},
    wakeable::Wakeable,
    work_loop::Reconciler,
};

#[derive(Default)]
struct HandleTarget {
    inbox: Weak<Inbox>,
    boundary: Option<FiberId>,
}

/// Imperative control over one suspense boundary.
///
/// The handle is bound when the boundary first commits and unbound when it
/// unmounts. Calls on an unbound handle do nothing.
#[derive(Clone, Default)]
pub struct SuspenseHandle(Arc<Mutex<HandleTarget>>);

impl SuspenseHandle {
    /// An unbound handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the handle refers to a mounted boundary.
    pub fn is_bound(&self) -> bool {
        let target = self.0.lock();
        target.boundary.is_some() && target.inbox.strong_count() > 0
    }

    /// Schedules the boundary to render its primary content again.
    pub fn retry(&self) {
        self.send(|boundary| Signal::Retry {
            boundary,
            lane: Lanes::NONE,
        });
    }

    /// Disconnects the effects of the primary content without unmounting it.
    pub fn detach(&self) {
        self.send(|boundary| Signal::Detach { boundary });
    }

    /// Reconnects effects disconnected by [`SuspenseHandle::detach`].
    pub fn attach(&self) {
        self.send(|boundary| Signal::Attach { boundary });
    }

    fn send(&self, signal: impl FnOnce(FiberId) -> Signal) {
        let (inbox, boundary) = {
            let target = self.0.lock();
            (target.inbox.upgrade(), target.boundary)
        };
        if let (Some(inbox), Some(boundary)) = (inbox, boundary) {
            inbox.push(signal(boundary));
        }
    }

    pub(crate) fn bind(&self, inbox: Weak<Inbox>, boundary: FiberId) {
        let mut target = self.0.lock();
        target.inbox = inbox;
        target.boundary = Some(boundary);
    }

    pub(crate) fn unbind(&self) {
        let mut target = self.0.lock();
        target.inbox = Weak::new();
        target.boundary = None;
    }

    pub(crate) fn ptr_eq(&self, other: &SuspenseHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for SuspenseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspenseHandle")
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Routes a throw from `source` to the boundary that will handle it.
    /// Fails with [`ReconcilerError::Uncaught`] when nothing can: an error
    /// with no root above it.
    pub(crate) fn throw_exception(
        &mut self,
        root: RootId,
        source: FiberId,
        thrown: RenderSignal,
    ) -> Result<(), ReconcilerError> {
        self.fibers[source].flags |= Flags::INCOMPLETE;
        let render_lanes = self.ctx.wip_render_lanes;

        match thrown {
            RenderSignal::Suspend(wakeable) => {
                let Some(boundary) = self.ctx.suspense_handler() else {
                    // Nothing can show a fallback; the whole render waits.
                    self.attach_ping_listener(root, &wakeable, render_lanes);
                    self.render_did_suspend_delay_if_possible();
                    return Ok(());
                };
                if self.ctx.shell_boundary.is_none() {
                    self.render_did_suspend_delay_if_possible();
                } else if self.fibers[boundary].alternate.is_none() {
                    self.render_did_suspend();
                }
                let fiber = &mut self.fibers[boundary];
                fiber.flags |= Flags::SHOULD_CAPTURE;
                fiber.lanes |= render_lanes;
                match &mut fiber.update_queue {
                    FiberQueue::Retry(wakeables) => {
                        if !wakeables.contains(&wakeable) {
                            wakeables.push(wakeable.clone());
                        }
                    }
                    queue => *queue = FiberQueue::Retry(vec![wakeable.clone()]),
                }
                tracing::debug!(?boundary, wakeable = wakeable.id(), "Suspended into boundary");
                self.attach_ping_listener(root, &wakeable, render_lanes);
                Ok(())
            }
            RenderSignal::Error(value) => {
                let info = ErrorInfo {
                    value,
                    component_stack: self.fibers.component_stack(source),
                };
                self.render_did_error();
                self.ctx.concurrent_errors.push(info.clone());
                let lane = render_lanes.pick_arbitrary_lane();

                let mut node = self.fibers[source].parent;
                while let Some(id) = node {
                    let fiber = &self.fibers[id];
                    match fiber.kind {
                        FiberKind::HostRoot => {
                            self.capture_on_root(root, id, info, lane);
                            return Ok(());
                        }
                        FiberKind::ErrorBoundary if !fiber.flags.contains(Flags::DID_CAPTURE) => {
                            self.capture_on_boundary(root, id, info, lane);
                            return Ok(());
                        }
                        _ => node = fiber.parent,
                    }
                }
                Err(ReconcilerError::Uncaught(info))
            }
        }
    }

    fn capture_on_root(&mut self, root: RootId, fiber: FiberId, info: ErrorInfo, lane: Lane) {
        let callback = self.uncaught_error_callback(root, info);
        let record = &mut self.fibers[fiber];
        record.flags |= Flags::SHOULD_CAPTURE;
        record.lanes |= lane;
        if let FiberQueue::Root(queue) = &mut record.update_queue {
            queue
                .base_updates
                .push(Update::new(lane, RootAction::Uncaught).with_callback(callback));
        }
    }

    fn capture_on_boundary(&mut self, root: RootId, fiber: FiberId, info: ErrorInfo, lane: Lane) {
        let callback = self.caught_error_callback(root, fiber, info.clone());
        let record = &mut self.fibers[fiber];
        record.flags |= Flags::SHOULD_CAPTURE;
        record.lanes |= lane;
        if let FiberQueue::Boundary(queue) = &mut record.update_queue {
            queue
                .base_updates
                .push(Update::new(lane, BoundaryAction::Capture(info)).with_callback(callback));
        }
    }

    /// Reports an error captured by the boundary at `fiber` to its own
    /// callback and to the root.
    pub(crate) fn caught_error_callback(
        &self,
        root: RootId,
        fiber: FiberId,
        info: ErrorInfo,
    ) -> UpdateCallback {
        let props = self
            .fibers
            .get(fiber)
            .and_then(|record| record.pending_props.as_ref().or(record.memoized_props.as_ref()));
        let on_error = match props.map(|element| element.kind()) {
            Some(ElementKind::ErrorBoundary { on_error, .. }) => on_error.clone(),
            _ => None,
        };
        let on_caught = self
            .roots
            .get(root)
            .and_then(|fiber_root| fiber_root.options.on_caught_error.clone());
        Arc::new(move || {
            if let Some(on_error) = &on_error {
                on_error(&info);
            }
            match &on_caught {
                Some(on_caught) => on_caught(&info),
                None => tracing::warn!(error = %info.value, "Error caught by a boundary{}", info.component_stack),
            }
        })
    }

    pub(crate) fn uncaught_error_callback(&self, root: RootId, info: ErrorInfo) -> UpdateCallback {
        let on_uncaught = self
            .roots
            .get(root)
            .and_then(|fiber_root| fiber_root.options.on_uncaught_error.clone());
        Arc::new(move || match &on_uncaught {
            Some(on_uncaught) => on_uncaught(&info),
            None => tracing::error!(error = %info.value, "Uncaught error{}", info.component_stack),
        })
    }

    fn render_did_suspend(&mut self) {
        if self.ctx.exit_status == RootExitStatus::InProgress {
            self.ctx.exit_status = RootExitStatus::Suspended;
        }
    }

    fn render_did_suspend_delay_if_possible(&mut self) {
        self.ctx.exit_status = RootExitStatus::SuspendedWithDelay;
        let blocked = self.ctx.skipped_lanes.includes_non_idle_work()
            || self.ctx.interleaved_updated_lanes.includes_non_idle_work();
        if blocked && let Some(root) = self.ctx.wip_root {
            // Updates are waiting behind this render; let them go first.
            let lanes = self.ctx.wip_render_lanes;
            self.mark_root_suspended(root, lanes);
        }
    }

    fn render_did_error(&mut self) {
        if self.ctx.exit_status != RootExitStatus::SuspendedWithDelay {
            self.ctx.exit_status = RootExitStatus::Errored;
        }
    }

    /// Whether a render that suspended now should wait in place rather than
    /// commit a fallback.
    pub(crate) fn should_remain_on_previous_screen(&self) -> bool {
        let Some(handler) = self.ctx.suspense_handler() else {
            return true;
        };
        let lanes = self.ctx.wip_render_lanes;
        if lanes.includes_only_transitions() {
            return self.ctx.shell_boundary.is_none();
        }
        if lanes.includes_only_retries() || lanes == Lanes::OFFSCREEN {
            return Some(handler) == self.ctx.shell_boundary;
        }
        false
    }

    /// Subscribes to `wakeable` so its settlement pings `root` on `lanes`.
    /// Listens at most once per wakeable and lane set.
    pub(crate) fn attach_ping_listener(&mut self, root: RootId, wakeable: &Wakeable, lanes: Lanes) {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            return;
        };
        let id = wakeable.id();
        let seen = fiber_root.ping_cache.entry(id).or_insert(Lanes::NONE);
        if seen.contains(lanes) {
            return;
        }
        *seen |= lanes;
        let inbox = Arc::downgrade(&self.inbox);
        wakeable.subscribe(move || {
            if let Some(inbox) = inbox.upgrade() {
                inbox.push(Signal::Ping {
                    root,
                    wakeable: id,
                    lanes,
                });
            }
        });
    }

    /// Marks `lanes` pinged after a wakeable settled, restarting the render in
    /// progress when it can no longer finish usefully.
    pub(crate) fn ping_suspended_root(&mut self, root: RootId, wakeable: u64, lanes: Lanes) {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            return;
        };
        fiber_root.ping_cache.remove(&wakeable);
        fiber_root.mark_pinged(lanes);
        tracing::debug!(?root, ?lanes, "Pinged");

        if self.ctx.wip_root == Some(root) && self.ctx.wip_render_lanes.contains(lanes) {
            let now = self.scheduler.now();
            let within_throttle = now.saturating_sub(self.ctx.most_recent_fallback_time)
                < self.config.retry_throttle_ms;
            let restart = self.ctx.exit_status == RootExitStatus::SuspendedWithDelay
                || (self.ctx.exit_status == RootExitStatus::Suspended
                    && self.ctx.wip_render_lanes.includes_only_retries()
                    && within_throttle);
            if restart && !self.ctx.execution.contains(ExecutionContext::RENDER) {
                self.prepare_fresh_stack(root, Lanes::NONE);
            } else {
                self.ctx.pinged_lanes |= lanes;
            }
        }
        self.ensure_root_is_scheduled(root);
    }

    /// Schedules a boundary showing its fallback to try its primary content
    /// again. A missing lane uses the lane the boundary is owed, or claims
    /// the next retry lane.
    pub(crate) fn retry_timed_out_boundary(
        &mut self,
        boundary: FiberId,
        lane: Lane,
    ) -> Result<(), ReconcilerError> {
        if !self.fibers.contains(boundary) {
            return Ok(());
        }
        let lane = if lane.is_empty() {
            self.owed_retry_lane(boundary)
                .unwrap_or_else(|| self.inbox.claim_retry_lane())
        } else {
            lane
        };
        let Some(root) = self.mark_update_lane_from_fiber_to_root(boundary, lane) else {
            return Ok(());
        };
        if let Some(fiber_root) = self.roots.get_mut(root) {
            fiber_root.mark_updated(lane);
        }
        tracing::debug!(?boundary, ?lane, "Retrying boundary");
        self.ensure_root_is_scheduled(root);
        Ok(())
    }

    /// Retry lane recorded on either record of `boundary`.
    pub(crate) fn owed_retry_lane(&self, boundary: FiberId) -> Option<Lane> {
        let fiber = self.fibers.get(boundary)?;
        fiber.retry_lane().or_else(|| {
            fiber
                .alternate
                .and_then(|alternate| self.fibers.get(alternate))
                .and_then(|alternate| alternate.retry_lane())
        })
    }

    /// Committed record of the boundary behind a handle.
    fn committed_boundary(&self, boundary: FiberId) -> Option<FiberId> {
        let fiber = self.fibers.get(boundary)?;
        let root = self.fibers.host_root_of(boundary)?;
        let root_id = match self.fibers[root].state_node {
            crate::fiber::StateNode::Root(id) => id,
            _ => return None,
        };
        let current_root = self.roots.get(root_id)?.current;
        if root == current_root {
            Some(boundary)
        } else {
            fiber.alternate
        }
    }

    pub(crate) fn detach_boundary(&mut self, boundary: FiberId) {
        let Some(boundary) = self.committed_boundary(boundary) else {
            return;
        };
        let Some(instance) = self.fibers[boundary].suspense_instance().cloned() else {
            return;
        };
        {
            let mut instance = instance.lock();
            if instance.detached {
                return;
            }
            instance.detached = true;
        }
        if let Some(primary) = self.fibers[boundary].child {
            tracing::debug!(?boundary, "Detaching boundary effects");
            self.disappear_layout_effects(primary);
            self.disconnect_passive_effects(primary);
        }
    }

    pub(crate) fn attach_boundary(&mut self, boundary: FiberId) {
        let Some(boundary) = self.committed_boundary(boundary) else {
            return;
        };
        let Some(instance) = self.fibers[boundary].suspense_instance().cloned() else {
            return;
        };
        {
            let mut instance = instance.lock();
            if !instance.detached {
                return;
            }
            instance.detached = false;
        }
        if let Some(primary) = self.fibers[boundary].child
            && !self.fibers[boundary].is_showing_fallback()
        {
            tracing::debug!(?boundary, "Attaching boundary effects");
            self.reappear_layout_effects(primary);
            self.reconnect_passive_effects(primary);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Reconciler, ReconcilerConfig, ReconcilerError, RenderSignal, RootOptions, ThrownValue,
        fiber::{Fiber, FiberKind, Flags},
        test_renderer::TestRenderer,
        test_scheduler::TestScheduler,
    };

    #[test]
    fn error_without_a_root_above_is_uncaught() {
        let mut engine = Reconciler::new(
            TestRenderer::default(),
            TestScheduler::default(),
            ReconcilerConfig::default(),
        );
        let root = engine.create_root((), RootOptions::default());
        let detached = engine.fibers.insert(Fiber::new(FiberKind::Fragment, None, None));
        let source = engine.fibers.insert(Fiber::new(FiberKind::Fragment, None, None));
        engine.fibers[source].parent = Some(detached);

        let info = match engine.throw_exception(root, source, RenderSignal::Error(ThrownValue::msg("lost"))) {
            Err(ReconcilerError::Uncaught(info)) => info,
            other => panic!("expected an uncaught error, got {other:?}"),
        };
        assert_eq!(info.value.to_string(), "lost");
        assert!(engine.fibers[source].flags.contains(Flags::INCOMPLETE));
    }
}
