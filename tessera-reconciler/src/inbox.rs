//! Thread-safe entry point for work that originates outside the render loop.
//!
//! State setters, wakeable listeners and suspense handles can run on any
//! thread and at any time. They never touch the fiber arena directly; they
//! push a [`Signal`] here and the engine drains the inbox on its own thread
//! before it picks the next lanes. The inbox also carries the ambient update
//! priority and the transition scope used to choose a lane for new updates.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{
    fiber::FiberId,
    lane::{EventPriority, Lane, LaneCursor, Lanes},
    root::RootId,
};

/// Work handed to the engine from outside the render loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Signal {
    /// A hook queue of `fiber` received an update on `lane`.
    Update { fiber: FiberId, lane: Lane },
    /// A wakeable a render suspended on has settled.
    Ping {
        root: RootId,
        wakeable: u64,
        lanes: Lanes,
    },
    /// A render suspended in place may continue from where it stopped.
    Resume { root: RootId, wakeable: u64 },
    /// A suspense boundary should render its primary content again.
    Retry { boundary: FiberId, lane: Lane },
    /// Disconnect effects of a boundary's primary subtree.
    Detach { boundary: FiberId },
    /// Reconnect effects of a boundary's primary subtree.
    Attach { boundary: FiberId },
}

struct InboxState {
    signals: VecDeque<Signal>,
    update_priority: Option<EventPriority>,
    transition_depth: usize,
    transition_lane: Option<Lane>,
    transition_cursor: LaneCursor,
    retry_cursor: LaneCursor,
    /// Lanes of the render in progress, if any.
    render_lanes: Option<Lanes>,
    /// The fiber whose render is running, with its alternate.
    rendering: Option<(FiberId, Option<FiberId>)>,
    render_phase_update: bool,
}

type Notify = Arc<dyn Fn() + Send + Sync>;

/// Shared mailbox between the engine and the outside world.
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    notify: Mutex<Option<Notify>>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self {
            state: Mutex::new(InboxState {
                signals: VecDeque::new(),
                update_priority: None,
                transition_depth: 0,
                transition_lane: None,
                transition_cursor: LaneCursor::transitions(),
                retry_cursor: LaneCursor::retries(),
                render_lanes: None,
                rendering: None,
                render_phase_update: false,
            }),
            notify: Mutex::new(None),
        }
    }
}

impl Inbox {
    pub(crate) fn push(&self, signal: Signal) {
        tracing::trace!(?signal, "Inbox signal");
        self.state.lock().signals.push_back(signal);
        let notify = self.notify.lock().clone();
        if let Some(notify) = notify {
            notify();
        }
    }

    pub(crate) fn drain(&self) -> Vec<Signal> {
        self.state.lock().signals.drain(..).collect()
    }

    pub(crate) fn has_signals(&self) -> bool {
        !self.state.lock().signals.is_empty()
    }

    /// Installs a callback invoked after every push, for embedders that need
    /// to wake their event loop.
    pub(crate) fn set_notify(&self, notify: Option<Notify>) {
        *self.notify.lock() = notify;
    }

    /// Chooses the lane for a new update from the current execution context.
    pub(crate) fn request_update_lane(&self) -> Lane {
        let mut state = self.state.lock();
        if let Some(lanes) = state.render_lanes
            && !lanes.is_empty()
        {
            return lanes.pick_arbitrary_lane();
        }
        if state.transition_depth > 0 {
            if let Some(lane) = state.transition_lane {
                return lane;
            }
            let lane = state.transition_cursor.claim();
            state.transition_lane = Some(lane);
            return lane;
        }
        match state.update_priority {
            Some(priority) => priority.lane(),
            None => Lanes::DEFAULT,
        }
    }

    pub(crate) fn claim_retry_lane(&self) -> Lane {
        self.state.lock().retry_cursor.claim()
    }

    pub(crate) fn claim_transition_lane(&self) -> Lane {
        self.state.lock().transition_cursor.claim()
    }

    pub(crate) fn update_priority(&self) -> Option<EventPriority> {
        self.state.lock().update_priority
    }

    /// Sets the ambient priority and returns the previous one.
    pub(crate) fn set_update_priority(&self, priority: Option<EventPriority>) -> Option<EventPriority> {
        std::mem::replace(&mut self.state.lock().update_priority, priority)
    }

    pub(crate) fn enter_transition(&self) {
        self.state.lock().transition_depth += 1;
    }

    pub(crate) fn exit_transition(&self) {
        let mut state = self.state.lock();
        state.transition_depth = state.transition_depth.saturating_sub(1);
        if state.transition_depth == 0 {
            state.transition_lane = None;
        }
    }

    pub(crate) fn set_render_lanes(&self, lanes: Option<Lanes>) {
        self.state.lock().render_lanes = lanes;
    }

    pub(crate) fn begin_component(&self, fiber: FiberId, alternate: Option<FiberId>) {
        let mut state = self.state.lock();
        state.rendering = Some((fiber, alternate));
        state.render_phase_update = false;
    }

    pub(crate) fn end_component(&self) -> bool {
        let mut state = self.state.lock();
        state.rendering = None;
        std::mem::take(&mut state.render_phase_update)
    }

    /// Records an update made by the component that is rendering right now.
    /// Returns `false` when `fiber` is not that component.
    pub(crate) fn try_render_phase_update(&self, fiber: FiberId) -> bool {
        let mut state = self.state.lock();
        match state.rendering {
            Some((rendering, alternate))
                if rendering == fiber || alternate == Some(fiber) =>
            {
                state.render_phase_update = true;
                true
            }
            _ => false,
        }
    }

    /// Clears a pending re-render request, used before running a component
    /// again.
    pub(crate) fn take_render_phase_update(&self) -> bool {
        std::mem::take(&mut self.state.lock().render_phase_update)
    }
}

/// Runs `f` inside a transition scope.
pub(crate) fn in_transition<R>(inbox: &Inbox, f: impl FnOnce() -> R) -> R {
    inbox.enter_transition();
    let result = f();
    inbox.exit_transition();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_follows_context() {
        let inbox = Inbox::default();
        assert_eq!(inbox.request_update_lane(), Lanes::DEFAULT);

        inbox.set_update_priority(Some(EventPriority::Discrete));
        assert_eq!(inbox.request_update_lane(), Lanes::SYNC);

        let (first, second) = in_transition(&inbox, || {
            (inbox.request_update_lane(), inbox.request_update_lane())
        });
        assert_eq!(first, Lanes::TRANSITION_1);
        assert_eq!(first, second);
        let next = in_transition(&inbox, || inbox.request_update_lane());
        assert!(next.is_transition());
        assert_ne!(next, first);

        inbox.set_render_lanes(Some(Lanes::RETRY_1 | Lanes::DEFAULT));
        assert_eq!(inbox.request_update_lane(), Lanes::DEFAULT);
    }

    #[test]
    fn notify_runs_on_push() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let inbox = Inbox::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        inbox.set_notify(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        inbox.push(Signal::Detach {
            boundary: FiberId::default(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(inbox.drain().len(), 1);
        assert!(!inbox.has_signals());
    }

    #[test]
    fn render_phase_updates_only_match_rendering_fiber() {
        let inbox = Inbox::default();
        let fiber = FiberId::default();
        assert!(!inbox.try_render_phase_update(fiber));
        inbox.begin_component(fiber, None);
        assert!(inbox.try_render_phase_update(fiber));
        assert!(inbox.end_component());
        assert!(!inbox.try_render_phase_update(fiber));
    }
}
