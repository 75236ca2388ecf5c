//! Rendering one node: bailouts, per-kind updates and context pushes.

use std::sync::Arc;

use crate::{
    cache::Cache,
    context::ContextId,
    dyn_traits::PropsValue,
    element::{ComponentType, Element, ElementKind},
    error::{ReconcilerError, RenderSignal},
    fiber::{
        BoundaryAction, BoundaryState, FiberId, FiberKind, FiberQueue, FiberState, Flags,
        FunctionQueue, OffscreenState, RootAction, SuspenseState,
    },
    hooks::{RenderContext, RenderInput},
    host::{HostConfig, HostScheduler},
    lane::Lanes,
    work_loop::Reconciler,
};

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Renders `wip` and returns the next unit of work below it.
    pub(crate) fn begin_work(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Result<Option<FiberId>, RenderSignal> {
        self.push_fiber_context(current, wip);

        if let Some(current) = current {
            let fiber = &self.fibers[wip];
            let has_scheduled_update = self.fibers[current].lanes.intersects(render_lanes);
            if !self.props_changed(current, wip)
                && !has_scheduled_update
                && !fiber.flags.contains(Flags::DID_CAPTURE)
            {
                tracing::trace!(fiber = ?wip, kind = fiber.kind.name(), "Bailout");
                return Ok(self.attempt_early_bailout(current, wip, render_lanes));
            }
        }

        self.fibers[wip].lanes = Lanes::NONE;
        let kind = self.fibers[wip].kind.clone();
        tracing::trace!(fiber = ?wip, kind = kind.name(), "Begin");
        match kind {
            FiberKind::HostRoot => Ok(self.update_host_root(current, wip, render_lanes)),
            FiberKind::FunctionComponent { ty } => {
                let props = match self.pending_kind(wip) {
                    Some(ElementKind::Component { props, .. }) => props.clone(),
                    _ => return Ok(None),
                };
                self.update_function_component(current, wip, &ty, props, render_lanes)
            }
            FiberKind::HostComponent { .. } => Ok(self.update_host_component(current, wip, render_lanes)),
            FiberKind::HostText => Ok(None),
            FiberKind::Fragment => {
                let children = match self.pending_kind(wip) {
                    Some(ElementKind::Fragment(children)) => children.clone(),
                    _ => Vec::new(),
                };
                self.reconcile_children(current, wip, &children, render_lanes);
                Ok(self.fibers[wip].child)
            }
            FiberKind::ContextProvider { context } => {
                Ok(self.update_context_provider(current, wip, context, render_lanes))
            }
            FiberKind::ErrorBoundary => Ok(self.update_error_boundary(current, wip, render_lanes)),
            FiberKind::Suspense => Ok(self.update_suspense_component(current, wip, render_lanes)),
            FiberKind::Offscreen => Ok(self.update_offscreen_component(current, wip, render_lanes)),
        }
    }

    fn pending_kind(&self, wip: FiberId) -> Option<&ElementKind> {
        self.fibers[wip].pending_props.as_ref().map(Element::kind)
    }

    fn props_changed(&self, current: FiberId, wip: FiberId) -> bool {
        match (&self.fibers[current].memoized_props, &self.fibers[wip].pending_props) {
            (Some(previous), Some(next)) => !previous.ptr_eq(next),
            (None, None) => false,
            _ => true,
        }
    }

    /// Pushes the stack entries a node contributes to its subtree. Popped in
    /// `complete_work` or `unwind_work`.
    fn push_fiber_context(&mut self, current: Option<FiberId>, wip: FiberId) {
        let fiber = &self.fibers[wip];
        match &fiber.kind {
            FiberKind::ContextProvider { context } => {
                if let Some(ElementKind::Provider { value, .. }) = self.pending_kind(wip) {
                    let value = value.clone();
                    self.ctx.context_stack.push(*context, value);
                }
            }
            FiberKind::Suspense => {
                if fiber.flags.contains(Flags::DID_CAPTURE) {
                    // The fallback suspends to whoever handles the boundary itself.
                    let parent = self.ctx.suspense_handler();
                    self.ctx.suspense_handler_stack.push(parent);
                } else {
                    self.ctx.suspense_handler_stack.push(Some(wip));
                    let newly_shown = current
                        .is_none_or(|current| self.fibers[current].is_showing_fallback());
                    if self.ctx.shell_boundary.is_none() && newly_shown {
                        self.ctx.shell_boundary = Some(wip);
                    }
                }
            }
            FiberKind::Offscreen => {
                let lanes = self.ctx.entangled_render_lanes;
                self.ctx.hidden_stack.push(lanes);
            }
            _ => {}
        }
    }

    fn attempt_early_bailout(
        &mut self,
        current: FiberId,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        match self.fibers[wip].kind {
            FiberKind::Suspense if self.fibers[current].is_showing_fallback() => {
                let primary_lanes = self.fibers[current]
                    .child
                    .and_then(|primary| self.fibers.get(primary))
                    .map_or(Lanes::NONE, |primary| primary.child_lanes);
                if primary_lanes.intersects(render_lanes) {
                    // The hidden content has work; try showing it again.
                    return self.update_suspense_component(Some(current), wip, render_lanes);
                }
                // Skip the hidden primary and continue with the fallback.
                let primary = self.bailout_on_already_finished_work(current, wip, render_lanes)?;
                self.fibers[primary].sibling
            }
            FiberKind::Offscreen => {
                self.fibers[wip].lanes = Lanes::NONE;
                self.update_offscreen_component(Some(current), wip, render_lanes)
            }
            _ => self.bailout_on_already_finished_work(current, wip, render_lanes),
        }
    }

    pub(crate) fn bailout_on_already_finished_work(
        &mut self,
        _current: FiberId,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        self.ctx.skipped_lanes |= self.fibers[wip].lanes;
        if !self.fibers[wip].child_lanes.intersects(render_lanes) {
            // Nothing below needs work; keep the committed children as they are.
            return None;
        }
        self.clone_child_fibers(wip);
        self.fibers[wip].child
    }

    /// Replaces the committed child list of `wip` with work-in-progress
    /// copies that keep their props.
    fn clone_child_fibers(&mut self, wip: FiberId) {
        let mut current_child = self.fibers[wip].child;
        let mut previous: Option<FiberId> = None;
        while let Some(child) = current_child {
            let props = self.fibers[child].pending_props.clone();
            let next = self.fibers[child].sibling;
            let clone = self.work_in_progress(child, props);
            self.fibers[clone].parent = Some(wip);
            self.fibers[clone].sibling = None;
            match previous {
                Some(previous) => self.fibers[previous].sibling = Some(clone),
                None => self.fibers[wip].child = Some(clone),
            }
            previous = Some(clone);
            current_child = next;
        }
    }

    fn update_host_root(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let previous_element = match &self.fibers[wip].memoized_state {
            FiberState::Root(state) => state.element.clone(),
            _ => None,
        };

        let pending = match &self.fibers[wip].update_queue {
            FiberQueue::Root(queue) => queue.take_pending(),
            _ => return None,
        };
        if let Some(current) = current
            && let FiberQueue::Root(queue) = &mut self.fibers[current].update_queue
        {
            queue.append_base(&pending);
        }
        let FiberQueue::Root(queue) = &mut self.fibers[wip].update_queue else {
            return None;
        };
        queue.append_base(&pending);
        let processed = queue.process(render_lanes, RootAction::reduce);

        let fiber = &mut self.fibers[wip];
        if !processed.callbacks.is_empty() {
            fiber.flags |= Flags::CALLBACK;
        }
        fiber.lanes = processed.skipped_lanes;
        self.ctx.skipped_lanes |= processed.skipped_lanes;
        let next_element = processed.state.element.clone();
        let next_cache = processed.state.cache.clone();
        fiber.memoized_state = FiberState::Root(processed.state);

        let cache_changed = current.is_some_and(|current| match &self.fibers[current].memoized_state {
            FiberState::Root(previous) => !previous.cache.ptr_eq(&next_cache),
            _ => false,
        });
        if cache_changed {
            self.propagate_context_change(wip, ContextId::ROOT_CACHE, render_lanes);
        }
        let fiber = &self.fibers[wip];

        let unchanged = match (&previous_element, &next_element) {
            (Some(previous), Some(next)) => previous.ptr_eq(next),
            (None, None) => true,
            _ => false,
        };
        if let Some(current) = current
            && unchanged
            && !fiber.flags.contains(Flags::DID_CAPTURE)
        {
            return self.bailout_on_already_finished_work(current, wip, render_lanes);
        }

        let children: Vec<Element> = next_element.into_iter().collect();
        self.reconcile_children(current, wip, &children, render_lanes);
        self.fibers[wip].child
    }

    /// Whether the render replaces the committed root cache.
    fn root_cache_refreshed(&self) -> bool {
        let committed = self
            .ctx
            .wip_root
            .and_then(|root| self.roots.get(root))
            .and_then(|fiber_root| match &self.fibers.get(fiber_root.current)?.memoized_state {
                FiberState::Root(state) => Some(state.cache.clone()),
                _ => None,
            });
        committed.is_some_and(|committed| !committed.ptr_eq(&self.render_root_cache()))
    }

    /// The cache of the root being rendered.
    fn render_root_cache(&self) -> Cache {
        self.ctx
            .wip_root
            .and_then(|root| self.roots.get(root))
            .and_then(|fiber_root| self.fibers.get(fiber_root.current))
            .and_then(|current| current.alternate)
            .and_then(|wip| match &self.fibers.get(wip)?.memoized_state {
                FiberState::Root(state) => Some(state.cache.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn update_function_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        ty: &ComponentType,
        props: Arc<dyn PropsValue>,
        render_lanes: Lanes,
    ) -> Result<Option<FiberId>, RenderSignal> {
        let current_hooks = current.and_then(|current| match &self.fibers[current].memoized_state {
            FiberState::Hooks(hooks) => Some(hooks.clone()),
            _ => None,
        });
        let mut cx = RenderContext::new(RenderInput {
            fiber: wip,
            component: ty.name(),
            render_lanes,
            inbox: self.inbox.clone(),
            contexts: self.ctx.context_stack.current(),
            root_cache: self.render_root_cache(),
            current_hooks,
        });

        self.inbox.begin_component(wip, current);
        let mut result = ty.call(&mut cx, props.as_ref());
        let mut passes = 0;
        while result.is_ok() && self.inbox.take_render_phase_update() {
            passes += 1;
            if passes > self.config.render_phase_update_limit {
                self.inbox.end_component();
                return Err(RenderSignal::Error(
                    ReconcilerError::TooManyRerenders {
                        component: ty.name(),
                    }
                    .into(),
                ));
            }
            cx.prepare_rerender();
            result = ty.call(&mut cx, props.as_ref());
        }
        self.inbox.end_component();

        let output = cx.finish();
        if let Some(error) = output.error {
            return Err(RenderSignal::Error(error));
        }
        let element = result?;

        self.ctx.skipped_lanes |= output.remaining_lanes;
        if let Some(current) = current
            && !self.props_changed(current, wip)
            && !output.did_receive_update
            && !(output.dependencies.contains(&ContextId::ROOT_CACHE) && self.root_cache_refreshed())
        {
            // Same props and no state change: keep the committed effects.
            let queue = self.fibers[current].update_queue.clone();
            let fiber = &mut self.fibers[wip];
            fiber.memoized_state = FiberState::Hooks(output.hooks);
            fiber.update_queue = queue;
            fiber.flags |= output.flags & Flags::STATIC_MASK;
            fiber.flags.remove(Flags::PASSIVE | Flags::UPDATE);
            fiber.lanes |= output.remaining_lanes;
            let record = &mut self.fibers[current];
            record.lanes = record.lanes.remove(render_lanes);
            return Ok(self.bailout_on_already_finished_work(current, wip, render_lanes));
        }

        let fiber = &mut self.fibers[wip];
        fiber.memoized_state = FiberState::Hooks(output.hooks);
        fiber.update_queue = FiberQueue::Function(FunctionQueue {
            effects: output.effects,
            stores: output.stores,
        });
        fiber.flags |= Flags::PERFORMED_WORK | output.flags;
        fiber.lanes |= output.remaining_lanes;
        fiber.dependencies = output.dependencies;

        self.reconcile_children(current, wip, std::slice::from_ref(&element), render_lanes);
        Ok(self.fibers[wip].child)
    }

    fn update_host_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let Some(ElementKind::Host {
            children, node_ref, ..
        }) = self.pending_kind(wip).cloned()
        else {
            return None;
        };
        let previous_ref = current
            .and_then(|current| self.fibers[current].memoized_props.as_ref())
            .and_then(|props| match props.kind() {
                ElementKind::Host { node_ref, .. } => node_ref.clone(),
                _ => None,
            });
        let ref_changed = match (&previous_ref, &node_ref) {
            (None, None) => false,
            (Some(previous), Some(next)) => !previous.ptr_eq(next),
            _ => true,
        };
        if ref_changed {
            self.fibers[wip].flags |= Flags::REF | Flags::REF_STATIC;
        }
        self.reconcile_children(current, wip, &children, render_lanes);
        self.fibers[wip].child
    }

    fn update_context_provider(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        context: ContextId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let Some(ElementKind::Provider {
            value, children, ..
        }) = self.pending_kind(wip).cloned()
        else {
            return None;
        };
        if let Some(current) = current {
            let previous = self.fibers[current]
                .memoized_props
                .as_ref()
                .and_then(|props| match props.kind() {
                    ElementKind::Provider { value, .. } => Some(value.clone()),
                    _ => None,
                });
            let changed = previous
                .is_none_or(|previous| !Arc::ptr_eq(&previous, &value) && !previous.dyn_eq(value.as_ref()));
            if changed {
                self.propagate_context_change(wip, context, render_lanes);
            }
        }
        self.reconcile_children(current, wip, &children, render_lanes);
        self.fibers[wip].child
    }

    /// Schedules `render_lanes` on every consumer of `context` below
    /// `provider`, stopping at nested providers of the same context.
    fn propagate_context_change(&mut self, provider: FiberId, context: ContextId, render_lanes: Lanes) {
        let mut path = vec![provider];
        for child in self.fibers.children(provider) {
            self.propagate_context_into(child, context, render_lanes, &mut path);
        }
    }

    fn propagate_context_into(
        &mut self,
        node: FiberId,
        context: ContextId,
        render_lanes: Lanes,
        path: &mut Vec<FiberId>,
    ) {
        let fiber = &self.fibers[node];
        if matches!(fiber.kind, FiberKind::ContextProvider { context: nested } if nested == context) {
            return;
        }
        if fiber.dependencies.contains(&context) {
            let alternate = fiber.alternate;
            self.fibers[node].lanes |= render_lanes;
            if let Some(alternate) = alternate
                && let Some(other) = self.fibers.get_mut(alternate)
            {
                other.lanes |= render_lanes;
            }
            for ancestor in path.iter().copied() {
                self.fibers[ancestor].child_lanes |= render_lanes;
                if let Some(alternate) = self.fibers[ancestor].alternate
                    && let Some(other) = self.fibers.get_mut(alternate)
                {
                    other.child_lanes |= render_lanes;
                }
            }
            tracing::trace!(fiber = ?node, "Context consumer scheduled");
        }
        path.push(node);
        for child in self.fibers.children(node) {
            self.propagate_context_into(child, context, render_lanes, path);
        }
        path.pop();
    }

    fn update_error_boundary(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let Some(ElementKind::ErrorBoundary {
            children, fallback, ..
        }) = self.pending_kind(wip).cloned()
        else {
            return None;
        };

        if matches!(self.fibers[wip].update_queue, FiberQueue::None) {
            self.fibers[wip].update_queue =
                FiberQueue::Boundary(crate::update_queue::UpdateQueue::new(BoundaryState::default()));
        }
        let pending = match &self.fibers[wip].update_queue {
            FiberQueue::Boundary(queue) => queue.take_pending(),
            _ => Vec::new(),
        };
        if let Some(current) = current
            && let FiberQueue::Boundary(queue) = &mut self.fibers[current].update_queue
        {
            queue.append_base(&pending);
        }
        let FiberQueue::Boundary(queue) = &mut self.fibers[wip].update_queue else {
            return None;
        };
        queue.append_base(&pending);
        let processed = queue.process(render_lanes, BoundaryAction::reduce);

        let fiber = &mut self.fibers[wip];
        if !processed.callbacks.is_empty() {
            fiber.flags |= Flags::CALLBACK;
        }
        fiber.lanes = processed.skipped_lanes;
        self.ctx.skipped_lanes |= processed.skipped_lanes;
        let error = processed.state.error.clone();
        fiber.memoized_state = FiberState::ErrorBoundary(processed.state);
        let did_capture = fiber.flags.contains(Flags::DID_CAPTURE);

        let next_children = match &error {
            Some(info) => vec![fallback(info)],
            None => children,
        };
        if let Some(current) = current
            && did_capture
        {
            // Nothing of the failed tree may survive; unmount it before
            // mounting the fallback.
            let first = self.fibers[current].child;
            self.delete_remaining_children(wip, first, true);
            let child = self.reconcile_child_list(wip, None, &next_children, render_lanes, true);
            self.fibers[wip].child = child;
            return child;
        }
        self.reconcile_children(current, wip, &next_children, render_lanes);
        self.fibers[wip].child
    }

    pub(crate) fn update_suspense_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let Some(ElementKind::Suspense {
            children,
            fallback,
            handle,
        }) = self.pending_kind(wip).cloned()
        else {
            return None;
        };
        let previous_handle = current
            .and_then(|current| self.fibers[current].memoized_props.as_ref())
            .and_then(|props| match props.kind() {
                ElementKind::Suspense { handle, .. } => handle.clone(),
                _ => None,
            });
        let handle_changed = match (&previous_handle, &handle) {
            (None, None) => false,
            (Some(previous), Some(next)) => !previous.ptr_eq(next),
            _ => true,
        };
        if handle_changed {
            self.fibers[wip].flags |= Flags::REF | Flags::REF_STATIC;
        }
        let show_fallback = self.fibers[wip].flags.contains(Flags::DID_CAPTURE);
        self.fibers[wip].flags.remove(Flags::DID_CAPTURE);

        let Some(current) = current else {
            if show_fallback {
                let primary = self.create_fiber(&Element::offscreen(true, children), Lanes::NONE);
                self.fibers[primary].memoized_state = FiberState::Offscreen(OffscreenState {
                    base_lanes: render_lanes,
                    cache: None,
                });
                let fallback = self.create_fiber(&Element::fragment(fallback), render_lanes);
                self.link_suspense_children(wip, primary, Some(fallback));
                self.fibers[wip].memoized_state = FiberState::Suspense(SuspenseState {
                    retry_lane: self.inbox.claim_retry_lane(),
                });
                return Some(fallback);
            }
            let primary = self.create_fiber(&Element::offscreen(false, children), render_lanes);
            self.link_suspense_children(wip, primary, None);
            self.fibers[wip].memoized_state = FiberState::None;
            return Some(primary);
        };

        let Some(current_primary) = self.fibers[current].child else {
            return None;
        };
        let current_fallback = self.fibers[current_primary].sibling;

        if show_fallback {
            let (previous_base, previous_cache) = match &self.fibers[current_primary].memoized_state {
                FiberState::Offscreen(state) => (state.base_lanes, state.cache.clone()),
                _ => (Lanes::NONE, None),
            };
            let remaining = self.fibers[current_primary].child_lanes.remove(render_lanes);
            let static_subtree = self.fibers[current_primary].subtree_flags & Flags::STATIC_MASK;
            let primary =
                self.work_in_progress(current_primary, Some(Element::offscreen(true, children)));
            let fiber = &mut self.fibers[primary];
            fiber.child_lanes = remaining;
            fiber.lanes = fiber.lanes.remove(render_lanes);
            fiber.subtree_flags = static_subtree;
            fiber.memoized_state = FiberState::Offscreen(OffscreenState {
                base_lanes: previous_base | render_lanes,
                cache: previous_cache,
            });

            let fallback_element = Element::fragment(fallback);
            let fallback = match current_fallback {
                Some(existing) => self.work_in_progress(existing, Some(fallback_element)),
                None => {
                    let created = self.create_fiber(&fallback_element, render_lanes);
                    self.fibers[created].flags |= Flags::PLACEMENT;
                    created
                }
            };
            self.link_suspense_children(wip, primary, Some(fallback));
            // A boundary that keeps showing its fallback keeps the lane it is owed.
            let retry_lane = match self.fibers[current].retry_lane() {
                Some(lane) => lane,
                None => self.inbox.claim_retry_lane(),
            };
            self.fibers[wip].memoized_state = FiberState::Suspense(SuspenseState { retry_lane });
            return Some(fallback);
        }

        let primary =
            self.work_in_progress(current_primary, Some(Element::offscreen(false, children)));
        self.link_suspense_children(wip, primary, None);
        if let Some(fallback) = current_fallback {
            let fiber = &mut self.fibers[wip];
            fiber.deletions.push(fallback);
            fiber.flags |= Flags::CHILD_DELETION;
        }
        self.fibers[wip].memoized_state = FiberState::None;
        Some(primary)
    }

    fn link_suspense_children(&mut self, wip: FiberId, primary: FiberId, fallback: Option<FiberId>) {
        let fiber = &mut self.fibers[primary];
        fiber.parent = Some(wip);
        fiber.sibling = fallback;
        fiber.index = 0;
        if let Some(fallback) = fallback {
            let fiber = &mut self.fibers[fallback];
            fiber.parent = Some(wip);
            fiber.sibling = None;
            fiber.index = 1;
        }
        self.fibers[wip].child = Some(primary);
    }

    fn update_offscreen_component(
        &mut self,
        current: Option<FiberId>,
        wip: FiberId,
        render_lanes: Lanes,
    ) -> Option<FiberId> {
        let Some(ElementKind::Offscreen { hidden, children }) = self.pending_kind(wip).cloned()
        else {
            return None;
        };
        let previous = current.and_then(|current| match &self.fibers[current].memoized_state {
            FiberState::Offscreen(state) => Some(state.clone()),
            _ => None,
        });

        if hidden {
            // Work inside a hidden tree waits until it is revealed.
            let fiber = &mut self.fibers[wip];
            let deferred = fiber.child_lanes;
            let (base, cache) = previous.map_or((Lanes::NONE, None), |state| (state.base_lanes, state.cache));
            fiber.memoized_state = FiberState::Offscreen(OffscreenState {
                base_lanes: base | render_lanes | deferred,
                cache,
            });
            fiber.child_lanes = Lanes::NONE;
            return None;
        }

        if let Some(previous) = previous {
            // Lanes deferred while hidden render together with the reveal.
            self.ctx.entangled_render_lanes |= previous.base_lanes;
        }
        self.fibers[wip].memoized_state = FiberState::None;
        self.reconcile_children(current, wip, &children, render_lanes);
        self.fibers[wip].child
    }
}
