//! Finishing nodes on the way back up, and unwinding after a throw.

use crate::{
    element::ElementKind,
    fiber::{FiberId, FiberKind, FiberQueue, FiberState, Flags},
    host::{HostConfig, HostScheduler},
    lane::Lanes,
    work_loop::Reconciler,
};

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Finishes `wip` after all of its children completed: builds host
    /// instances for new nodes, flags changed ones and bubbles lanes and
    /// flags into the parent-facing summary.
    pub(crate) fn complete_work(&mut self, current: Option<FiberId>, wip: FiberId, _render_lanes: Lanes) {
        let kind = self.fibers[wip].kind.clone();
        match kind {
            FiberKind::HostComponent { tag } => {
                let Some(ElementKind::Host { props, .. }) =
                    self.fibers[wip].pending_props.as_ref().map(|element| element.kind().clone())
                else {
                    self.bubble_properties(wip);
                    return;
                };
                match current {
                    Some(current) if self.fibers[wip].state_node.host().is_some() => {
                        let changed = match self.fibers[current].memoized_props.as_ref().map(|e| e.kind()) {
                            Some(ElementKind::Host { props: old, .. }) => !old.diff(&props).is_empty(),
                            _ => true,
                        };
                        if changed {
                            self.fibers[wip].flags |= Flags::UPDATE;
                        }
                    }
                    _ => {
                        let instance = self.host.create_instance(&tag, &props);
                        self.append_all_children(&instance, wip);
                        self.fibers[wip].state_node = crate::fiber::StateNode::Host(instance);
                    }
                }
                self.bubble_properties(wip);
            }
            FiberKind::HostText => {
                let text = match self.fibers[wip].pending_props.as_ref().map(|element| element.kind()) {
                    Some(ElementKind::Text(text)) => text.clone(),
                    _ => Default::default(),
                };
                match current {
                    Some(current) if self.fibers[wip].state_node.host().is_some() => {
                        let old = match self.fibers[current].memoized_props.as_ref().map(|e| e.kind()) {
                            Some(ElementKind::Text(old)) => Some(old.clone()),
                            _ => None,
                        };
                        if old.as_deref() != Some(&*text) {
                            self.fibers[wip].flags |= Flags::UPDATE;
                        }
                    }
                    _ => {
                        let instance = self.host.create_text_instance(&text);
                        self.fibers[wip].state_node = crate::fiber::StateNode::Host(instance);
                    }
                }
                self.bubble_properties(wip);
            }
            FiberKind::HostRoot => {
                if let Some(current) = current {
                    let current_fiber = &self.fibers[current];
                    if current_fiber.child.is_none() {
                        // First commit: take over whatever the container holds.
                        self.fibers[wip].flags |= Flags::SNAPSHOT;
                    }
                    let cache_changed = match (&self.fibers[current].memoized_state, &self.fibers[wip].memoized_state) {
                        (FiberState::Root(previous), FiberState::Root(next)) => !previous.cache.ptr_eq(&next.cache),
                        _ => false,
                    };
                    if cache_changed {
                        self.fibers[wip].flags |= Flags::PASSIVE;
                    }
                }
                self.bubble_properties(wip);
            }
            FiberKind::Suspense => {
                self.pop_suspense_handler(wip);
                let next_did_timeout = self.fibers[wip].is_showing_fallback();
                let prev_did_timeout = current.is_some_and(|current| self.fibers[current].is_showing_fallback());
                if next_did_timeout
                    && !prev_did_timeout
                    && let Some(primary) = self.fibers[wip].child
                {
                    self.fibers[primary].flags |= Flags::VISIBILITY;
                }
                if let FiberQueue::Retry(wakeables) = &self.fibers[wip].update_queue
                    && !wakeables.is_empty()
                {
                    self.fibers[wip].flags |= Flags::UPDATE;
                }
                self.bubble_properties(wip);
            }
            FiberKind::Offscreen => {
                self.pop_hidden_context();
                let next_hidden = self.fibers[wip].is_hidden_offscreen();
                let prev_hidden = current.is_some_and(|current| self.fibers[current].is_hidden_offscreen());
                if current.is_some() && next_hidden != prev_hidden {
                    self.fibers[wip].flags |= Flags::VISIBILITY;
                }
                self.bubble_properties(wip);
                if next_hidden {
                    let fiber = &mut self.fibers[wip];
                    let deferred = std::mem::replace(&mut fiber.child_lanes, Lanes::NONE);
                    if let FiberState::Offscreen(state) = &mut fiber.memoized_state {
                        state.base_lanes |= deferred;
                    }
                }
            }
            FiberKind::ContextProvider { .. } => {
                self.ctx.context_stack.pop();
                self.bubble_properties(wip);
            }
            FiberKind::FunctionComponent { .. } | FiberKind::Fragment | FiberKind::ErrorBoundary => {
                self.bubble_properties(wip);
            }
        }
    }

    /// Appends the top-level host instances below `wip` to `parent`.
    fn append_all_children(&mut self, parent: &H::Instance, wip: FiberId) {
        let mut stack = self.fibers.children(wip);
        stack.reverse();
        while let Some(node) = stack.pop() {
            let fiber = &self.fibers[node];
            if let Some(instance) = fiber.state_node.host() {
                let instance = instance.clone();
                self.host.append_initial_child(parent, &instance);
                continue;
            }
            let mut children = self.fibers.children(node);
            children.reverse();
            stack.extend(children);
        }
    }

    /// Merges lanes and flags of the children of `wip` into its child lanes
    /// and subtree flags, and points the children back at `wip`.
    ///
    /// Child lanes cover every lane pending below a node, with one exception:
    /// a hidden offscreen node moves the lanes of its subtree out of its
    /// child lanes into `OffscreenState::base_lanes` after bubbling. Those
    /// lanes are not rendered while the subtree stays hidden and are
    /// entangled back into the render that reveals it.
    pub(crate) fn bubble_properties(&mut self, wip: FiberId) {
        let did_bailout = self.fibers[wip]
            .alternate
            .is_some_and(|current| self.fibers.get(current).is_some_and(|c| c.child == self.fibers[wip].child));

        let mut child_lanes = Lanes::NONE;
        let mut subtree_flags = Flags::empty();
        for child in self.fibers.children(wip) {
            let fiber = &mut self.fibers[child];
            child_lanes |= fiber.lanes | fiber.child_lanes;
            if did_bailout {
                // Committed children carry stale effect flags.
                subtree_flags |= (fiber.subtree_flags | fiber.flags) & Flags::STATIC_MASK;
            } else {
                subtree_flags |= fiber.subtree_flags | fiber.flags;
            }
            fiber.parent = Some(wip);
        }
        let fiber = &mut self.fibers[wip];
        fiber.child_lanes = child_lanes;
        fiber.subtree_flags |= subtree_flags;
    }

    /// Pops whatever `wip` pushed and reports whether it captured the throw.
    /// A capturing node is returned so it can be rendered again.
    pub(crate) fn unwind_work(&mut self, wip: FiberId) -> Option<FiberId> {
        let kind = self.fibers[wip].kind.clone();
        match kind {
            FiberKind::HostRoot | FiberKind::ErrorBoundary => self.take_capture(wip),
            FiberKind::Suspense => {
                self.pop_suspense_handler(wip);
                self.take_capture(wip)
            }
            FiberKind::Offscreen => {
                self.pop_hidden_context();
                None
            }
            FiberKind::ContextProvider { .. } => {
                self.ctx.context_stack.pop();
                None
            }
            _ => None,
        }
    }

    fn take_capture(&mut self, wip: FiberId) -> Option<FiberId> {
        let fiber = &mut self.fibers[wip];
        if fiber.flags.contains(Flags::SHOULD_CAPTURE) && !fiber.flags.contains(Flags::DID_CAPTURE) {
            fiber.flags.remove(Flags::SHOULD_CAPTURE);
            fiber.flags |= Flags::DID_CAPTURE;
            tracing::trace!(fiber = ?wip, kind = fiber.kind.name(), "Captured");
            return Some(wip);
        }
        None
    }

    fn pop_suspense_handler(&mut self, wip: FiberId) {
        self.ctx.suspense_handler_stack.pop();
        if self.ctx.shell_boundary == Some(wip) {
            self.ctx.shell_boundary = None;
        }
    }

    fn pop_hidden_context(&mut self) {
        if let Some(lanes) = self.ctx.hidden_stack.pop() {
            self.ctx.entangled_render_lanes = lanes;
        }
    }
}
