//! The synchronous commit: before-mutation, mutation and layout passes.
//!
//! Every pass walks the finished tree depth first and only descends into
//! subtrees whose `subtree_flags` intersect the mask of that pass. Children
//! are handled before their parent, so a parent's layout effects observe the
//! mounted state of its whole subtree.

use std::sync::Arc;

use crate::{
    element::ElementKind,
    error::{ErrorInfo, ReconcilerError, ThrownValue},
    fiber::{BoundaryAction, FiberId, FiberKind, FiberQueue, FiberState, Flags, HookFlags, RootAction},
    host::{HostConfig, HostScheduler, SchedulerPriority, Task},
    inbox::Signal,
    lane::{EventPriority, Lanes},
    root::RootId,
    scheduler::{ExecutionContext, PendingPassive},
    update_queue::Update,
    work_loop::Reconciler,
};

/// Where a host node gets inserted or removed.
enum HostParent<I, C> {
    Instance(I),
    Container(C),
}

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Applies `finished` to the host and makes it the current tree of
    /// `root`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn commit_root(
        &mut self,
        root: RootId,
        finished: FiberId,
        lanes: Lanes,
    ) -> Result<(), ReconcilerError> {
        while self.ctx.pending_passive.is_some() {
            self.flush_passive_effects()?;
        }
        if !self.fibers.contains(finished) {
            return Ok(());
        }

        let remaining = {
            let fiber = &self.fibers[finished];
            fiber.lanes | fiber.child_lanes
        };
        let Some(fiber_root) = self.roots.get_mut(root) else {
            return Err(ReconcilerError::UnknownRoot);
        };
        fiber_root.callback_node = None;
        fiber_root.callback_priority = Lanes::NONE;
        fiber_root.pending_commit = None;
        fiber_root.mark_finished(remaining);
        let container = fiber_root.container.clone();
        if let Some(handle) = fiber_root.timeout_handle.take() {
            self.scheduler.cancel_callback(handle);
        }

        let previous_execution = self.ctx.execution;
        let previous_priority = self.inbox.set_update_priority(Some(EventPriority::Discrete));
        self.ctx.execution |= ExecutionContext::COMMIT;

        let record = &self.fibers[finished];
        let effects = record.flags | record.subtree_flags;
        tracing::debug!(
            ?root,
            prefix = %self.roots[root].options.identifier_prefix,
            ?lanes,
            ?remaining,
            "Committing"
        );

        let focused = self.host.prepare_for_commit(&container);
        let mut blurred = false;
        if effects.intersects(Flags::BEFORE_MUTATION_MASK) {
            self.commit_before_mutation_effects(finished, &container, focused.as_ref(), &mut blurred);
        }
        if effects.intersects(Flags::MUTATION_MASK) {
            self.commit_mutation_effects(root, finished);
        }
        self.host.reset_after_commit(&container);
        if blurred {
            self.host.after_active_instance_blur();
        }

        if let Some(fiber_root) = self.roots.get_mut(root) {
            fiber_root.current = finished;
        }

        if effects.intersects(Flags::LAYOUT_MASK) {
            self.commit_layout_effects(root, finished);
        }
        self.scheduler.request_paint();
        self.collect_unreachable(root, finished);

        self.ctx.execution = previous_execution;
        self.inbox.set_update_priority(previous_priority);

        if effects.intersects(Flags::PASSIVE_MASK) {
            self.ctx.pending_passive = Some(PendingPassive {
                root,
                finished,
                lanes,
            });
            self.scheduler
                .schedule_callback(SchedulerPriority::Normal, Task::FlushPassiveEffects);
        }

        self.report_recoverable_errors(root);

        // Updates scheduled by layout effects and callbacks.
        self.process_pending_signals()?;
        let remaining = self.roots.get(root).map_or(Lanes::NONE, |r| r.pending_lanes);
        if remaining.includes_sync_lane() {
            if self.ctx.nested_update_root == Some(root) {
                self.ctx.nested_update_count += 1;
            } else {
                self.ctx.nested_update_count = 0;
                self.ctx.nested_update_root = Some(root);
            }
        } else {
            self.ctx.nested_update_count = 0;
        }

        if lanes.includes_sync_lane() && self.ctx.pending_passive.is_some() {
            self.flush_passive_effects()?;
        }
        if self.roots.contains_key(root) {
            self.ensure_root_is_scheduled(root);
        }
        self.flush_sync_work_on_all_roots()
    }

    fn report_recoverable_errors(&mut self, root: RootId) {
        let errors = std::mem::take(&mut self.ctx.recoverable_errors);
        if errors.is_empty() {
            return;
        }
        let callback = self
            .roots
            .get(root)
            .and_then(|fiber_root| fiber_root.options.on_recoverable_error.clone());
        for info in errors {
            match &callback {
                Some(callback) => callback(&info),
                None => tracing::warn!(error = %info.value, "Recovered from an error{}", info.component_stack),
            }
        }
    }

    fn commit_before_mutation_effects(
        &mut self,
        fiber: FiberId,
        container: &H::Container,
        focused: Option<&H::Instance>,
        blurred: &mut bool,
    ) {
        if self.fibers[fiber].subtree_flags.intersects(Flags::BEFORE_MUTATION_MASK) {
            for child in self.fibers.children(fiber) {
                self.commit_before_mutation_effects(child, container, focused, blurred);
            }
        }

        let record = &self.fibers[fiber];
        let flags = record.flags;
        if let Some(focused) = focused
            && !*blurred
        {
            let mut detached = Vec::new();
            if flags.contains(Flags::CHILD_DELETION) {
                detached.extend(record.deletions.iter().copied());
            }
            let hiding = flags.contains(Flags::VISIBILITY)
                && record.is_hidden_offscreen()
                && !record
                    .alternate
                    .is_some_and(|current| self.fibers[current].is_hidden_offscreen());
            if hiding {
                detached.push(fiber);
            }
            if detached.iter().any(|root| self.subtree_contains_instance(*root, focused)) {
                self.host.before_active_instance_blur();
                *blurred = true;
            }
        }

        if flags.contains(Flags::SNAPSHOT) && matches!(self.fibers[fiber].kind, FiberKind::HostRoot) {
            self.host.clear_container(container);
        }
    }

    fn subtree_contains_instance(&self, fiber: FiberId, instance: &H::Instance) -> bool {
        self.fibers
            .subtree(fiber)
            .into_iter()
            .any(|id| self.fibers[id].state_node.host() == Some(instance))
    }

    fn commit_mutation_effects(&mut self, root: RootId, fiber: FiberId) {
        let deletions: Vec<FiberId> = self.fibers[fiber].deletions.iter().copied().collect();
        for deleted in deletions {
            self.commit_deletion_effects(root, fiber, deleted);
        }
        if self.fibers[fiber].subtree_flags.intersects(Flags::MUTATION_MASK) {
            for child in self.fibers.children(fiber) {
                self.commit_mutation_effects(root, child);
            }
        }

        if self.fibers[fiber].flags.contains(Flags::PLACEMENT) {
            self.commit_placement(root, fiber);
            self.fibers[fiber].flags.remove(Flags::PLACEMENT);
        }

        let record = &self.fibers[fiber];
        let flags = record.flags;
        let current = record.alternate;
        match record.kind.clone() {
            FiberKind::FunctionComponent { .. } => {
                if flags.contains(Flags::UPDATE) {
                    self.commit_hook_effect_list_unmount(root, fiber, HookFlags::LAYOUT, true);
                }
            }
            FiberKind::HostComponent { tag } => {
                if flags.contains(Flags::REF)
                    && let Some(current) = current
                {
                    self.safely_detach_ref(current);
                }
                if flags.contains(Flags::UPDATE)
                    && let Some(current) = current
                {
                    self.commit_host_update(current, fiber, &tag);
                }
            }
            FiberKind::HostText => {
                if flags.contains(Flags::UPDATE)
                    && let Some(current) = current
                {
                    self.commit_text_update(current, fiber);
                }
            }
            FiberKind::Suspense => self.commit_suspense_mutation(fiber, current, flags),
            FiberKind::Offscreen => {
                if flags.contains(Flags::VISIBILITY) {
                    let is_hidden = self.fibers[fiber].is_hidden_offscreen();
                    let was_hidden = current.is_some_and(|current| self.fibers[current].is_hidden_offscreen());
                    if is_hidden && !was_hidden && current.is_some() {
                        for child in self.fibers.children(fiber) {
                            self.disappear_layout_effects(child);
                        }
                    }
                    self.hide_or_unhide_all_children(fiber, is_hidden);
                }
            }
            FiberKind::HostRoot
            | FiberKind::Fragment
            | FiberKind::ErrorBoundary
            | FiberKind::ContextProvider { .. } => {}
        }
    }

    fn commit_host_update(&mut self, current: FiberId, fiber: FiberId, tag: &str) {
        let old = match self.fibers[current].memoized_props.as_ref().map(|e| e.kind()) {
            Some(ElementKind::Host { props, .. }) => props.clone(),
            _ => return,
        };
        let new = match self.fibers[fiber].memoized_props.as_ref().map(|e| e.kind()) {
            Some(ElementKind::Host { props, .. }) => props.clone(),
            _ => return,
        };
        let Some(instance) = self.fibers[fiber].state_node.host().cloned() else {
            return;
        };
        tracing::trace!(?fiber, tag, "Updating host instance");
        self.host.commit_update(&instance, tag, &old, &new);
    }

    fn commit_text_update(&mut self, current: FiberId, fiber: FiberId) {
        let old = match self.fibers[current].memoized_props.as_ref().map(|e| e.kind()) {
            Some(ElementKind::Text(text)) => text.clone(),
            _ => return,
        };
        let new = match self.fibers[fiber].memoized_props.as_ref().map(|e| e.kind()) {
            Some(ElementKind::Text(text)) => text.clone(),
            _ => return,
        };
        if let Some(instance) = self.fibers[fiber].state_node.host().cloned() {
            self.host.commit_text_update(&instance, &old, &new);
        }
    }

    fn commit_suspense_mutation(&mut self, fiber: FiberId, current: Option<FiberId>, flags: Flags) {
        let showing_fallback = self.fibers[fiber].is_showing_fallback();
        let was_showing = current.is_some_and(|current| self.fibers[current].is_showing_fallback());
        if showing_fallback && !was_showing {
            self.ctx.most_recent_fallback_time = self.scheduler.now();
        }

        if flags.contains(Flags::REF)
            && let Some(instance) = self.fibers[fiber].suspense_instance()
            && let Some(handle) = instance.lock().handle.take()
        {
            handle.unbind();
        }

        if flags.contains(Flags::UPDATE) {
            let wakeables = match std::mem::take(&mut self.fibers[fiber].update_queue) {
                FiberQueue::Retry(wakeables) => wakeables,
                other => {
                    self.fibers[fiber].update_queue = other;
                    Vec::new()
                }
            };
            let Some(instance) = self.fibers[fiber].suspense_instance().cloned() else {
                return;
            };
            let lane = self.fibers[fiber].retry_lane().unwrap_or(Lanes::NONE);
            for wakeable in wakeables {
                let id = wakeable.id();
                if !instance.lock().retry_cache.insert(id) {
                    continue;
                }
                let inbox = Arc::downgrade(&self.inbox);
                let retry_cache = Arc::downgrade(&instance);
                wakeable.subscribe(move || {
                    if let Some(instance) = retry_cache.upgrade() {
                        instance.lock().retry_cache.remove(&id);
                    }
                    if let Some(inbox) = inbox.upgrade() {
                        inbox.push(Signal::Retry { boundary: fiber, lane });
                    }
                });
            }
        }
    }

    /// Hides or reveals the top-level host nodes below an offscreen fiber.
    /// Nested hidden subtrees keep their own visibility.
    fn hide_or_unhide_all_children(&mut self, offscreen: FiberId, hide: bool) {
        let mut stack = self.fibers.children(offscreen);
        stack.reverse();
        while let Some(node) = stack.pop() {
            let record = &self.fibers[node];
            if let Some(instance) = record.state_node.host() {
                let instance = instance.clone();
                if hide {
                    self.host.hide_instance(&instance);
                } else {
                    self.host.unhide_instance(&instance);
                }
                continue;
            }
            if record.is_hidden_offscreen() {
                continue;
            }
            let mut children = self.fibers.children(node);
            children.reverse();
            stack.extend(children);
        }
    }

    /// The nearest host node or container at or above `start`.
    fn find_host_parent(
        &self,
        root: RootId,
        start: Option<FiberId>,
    ) -> Option<HostParent<H::Instance, H::Container>> {
        let mut node = start;
        while let Some(id) = node {
            let record = &self.fibers[id];
            match record.kind {
                FiberKind::HostComponent { .. } => {
                    return record.state_node.host().cloned().map(HostParent::Instance);
                }
                FiberKind::HostRoot => {
                    return self
                        .roots
                        .get(root)
                        .map(|fiber_root| HostParent::Container(fiber_root.container.clone()));
                }
                _ => node = record.parent,
            }
        }
        None
    }

    fn commit_placement(&mut self, root: RootId, fiber: FiberId) {
        let Some(parent) = self.find_host_parent(root, self.fibers[fiber].parent) else {
            tracing::warn!(?fiber, "Placed node has no host parent");
            return;
        };
        let before = self.get_host_sibling(fiber);
        self.insert_or_append_placement_node(fiber, before.as_ref(), &parent);
    }

    /// The first committed host node after `fiber` in host order, which new
    /// nodes are inserted before.
    fn get_host_sibling(&self, fiber: FiberId) -> Option<H::Instance> {
        let mut node = fiber;
        'siblings: loop {
            while self.fibers[node].sibling.is_none() {
                let parent = self.fibers[node].parent?;
                if matches!(
                    self.fibers[parent].kind,
                    FiberKind::HostComponent { .. } | FiberKind::HostRoot
                ) {
                    return None;
                }
                node = parent;
            }
            node = self.fibers[node].sibling?;
            while !self.fibers[node].kind.is_host() {
                let record = &self.fibers[node];
                if record.flags.contains(Flags::PLACEMENT) {
                    continue 'siblings;
                }
                match record.child {
                    Some(child) => node = child,
                    None => continue 'siblings,
                }
            }
            let record = &self.fibers[node];
            if !record.flags.contains(Flags::PLACEMENT) {
                return record.state_node.host().cloned();
            }
        }
    }

    fn insert_or_append_placement_node(
        &mut self,
        fiber: FiberId,
        before: Option<&H::Instance>,
        parent: &HostParent<H::Instance, H::Container>,
    ) {
        if let Some(instance) = self.fibers[fiber].state_node.host().cloned() {
            match (parent, before) {
                (HostParent::Instance(parent), Some(before)) => {
                    self.host.insert_before(parent, &instance, before);
                }
                (HostParent::Instance(parent), None) => self.host.append_child(parent, &instance),
                (HostParent::Container(container), Some(before)) => {
                    self.host.insert_in_container_before(container, &instance, before);
                }
                (HostParent::Container(container), None) => {
                    self.host.append_child_to_container(container, &instance);
                }
            }
            return;
        }
        for child in self.fibers.children(fiber) {
            self.insert_or_append_placement_node(child, before, parent);
        }
    }

    fn commit_deletion_effects(&mut self, root: RootId, parent: FiberId, deleted: FiberId) {
        if !self.fibers.contains(deleted) {
            return;
        }
        let host_parent = self.find_host_parent(root, Some(parent));
        tracing::trace!(?deleted, kind = self.fibers[deleted].kind.name(), "Deleting subtree");
        self.commit_deletion_effects_on_fiber(root, deleted, host_parent.as_ref(), false);
    }

    /// Removes the top-level host nodes of a deleted subtree and runs its
    /// layout cleanups. Nested host nodes go away with their host ancestor.
    fn commit_deletion_effects_on_fiber(
        &mut self,
        root: RootId,
        fiber: FiberId,
        host_parent: Option<&HostParent<H::Instance, H::Container>>,
        was_hidden: bool,
    ) {
        let kind = self.fibers[fiber].kind.clone();
        match kind {
            FiberKind::HostComponent { .. } | FiberKind::HostText => {
                if !was_hidden {
                    self.safely_detach_ref(fiber);
                }
                for child in self.fibers.children(fiber) {
                    self.commit_deletion_effects_on_fiber(root, child, None, was_hidden);
                }
                if let Some(parent) = host_parent
                    && let Some(instance) = self.fibers[fiber].state_node.host().cloned()
                {
                    match parent {
                        HostParent::Instance(parent) => self.host.remove_child(parent, &instance),
                        HostParent::Container(container) => {
                            self.host.remove_child_from_container(container, &instance);
                        }
                    }
                }
                return;
            }
            FiberKind::FunctionComponent { .. } => {
                if !was_hidden {
                    self.commit_hook_effect_list_unmount(root, fiber, HookFlags::LAYOUT, false);
                }
            }
            FiberKind::Suspense => {
                if let Some(instance) = self.fibers[fiber].suspense_instance()
                    && let Some(handle) = instance.lock().handle.take()
                {
                    handle.unbind();
                }
            }
            _ => {}
        }
        let hidden = was_hidden || self.fibers[fiber].is_hidden_offscreen();
        for child in self.fibers.children(fiber) {
            self.commit_deletion_effects_on_fiber(root, child, host_parent, hidden);
        }
    }

    fn commit_layout_effects(&mut self, root: RootId, fiber: FiberId) {
        let record = &self.fibers[fiber];
        if matches!(record.kind, FiberKind::Offscreen) {
            if record.is_hidden_offscreen() || self.is_detached_primary(fiber) {
                return;
            }
            let was_hidden = record
                .alternate
                .is_some_and(|current| self.fibers[current].is_hidden_offscreen());
            if was_hidden {
                for child in self.fibers.children(fiber) {
                    self.reappear_layout_effects(child);
                }
                return;
            }
        }

        if self.fibers[fiber].subtree_flags.intersects(Flags::LAYOUT_MASK) {
            for child in self.fibers.children(fiber) {
                self.commit_layout_effects(root, child);
            }
        }

        let record = &self.fibers[fiber];
        let flags = record.flags;
        if !flags.intersects(Flags::LAYOUT_MASK) {
            return;
        }
        match record.kind.clone() {
            FiberKind::FunctionComponent { .. } => {
                if flags.contains(Flags::UPDATE) {
                    self.commit_hook_effect_list_mount(root, fiber, HookFlags::LAYOUT, true);
                }
            }
            FiberKind::HostRoot | FiberKind::ErrorBoundary => {
                if flags.contains(Flags::CALLBACK) {
                    self.commit_callbacks(fiber);
                }
            }
            FiberKind::HostComponent { .. } => {
                if flags.contains(Flags::REF) {
                    self.safely_attach_ref(fiber);
                }
            }
            FiberKind::Suspense => {
                if flags.contains(Flags::REF) {
                    self.bind_suspense_handle(fiber);
                }
            }
            _ => {}
        }
    }

    fn commit_callbacks(&mut self, fiber: FiberId) {
        let callbacks = match &mut self.fibers[fiber].update_queue {
            FiberQueue::Root(queue) => std::mem::take(&mut queue.callbacks),
            FiberQueue::Boundary(queue) => std::mem::take(&mut queue.callbacks),
            _ => return,
        };
        for callback in callbacks {
            callback();
        }
    }

    fn bind_suspense_handle(&mut self, fiber: FiberId) {
        let handle = match self.fibers[fiber].memoized_props.as_ref().map(|e| e.kind()) {
            Some(ElementKind::Suspense { handle, .. }) => handle.clone(),
            _ => None,
        };
        let Some(instance) = self.fibers[fiber].suspense_instance().cloned() else {
            return;
        };
        let mut instance = instance.lock();
        if let Some(previous) = instance.handle.take() {
            previous.unbind();
        }
        if let Some(handle) = handle {
            handle.bind(Arc::downgrade(&self.inbox), fiber);
            instance.handle = Some(handle);
        }
    }

    /// Whether `fiber` is the primary child of a detached boundary.
    fn is_detached_primary(&self, fiber: FiberId) -> bool {
        self.fibers[fiber]
            .parent
            .and_then(|parent| self.fibers.get(parent))
            .and_then(|parent| parent.suspense_instance())
            .is_some_and(|instance| instance.lock().detached)
    }

    fn safely_attach_ref(&mut self, fiber: FiberId) {
        let record = &self.fibers[fiber];
        let node_ref = match record.memoized_props.as_ref().map(|e| e.kind()) {
            Some(ElementKind::Host { node_ref, .. }) => node_ref.clone(),
            _ => None,
        };
        if let (Some(node_ref), Some(instance)) = (node_ref, record.state_node.host()) {
            node_ref.attach(Arc::new(instance.clone()));
        }
    }

    fn safely_detach_ref(&mut self, fiber: FiberId) {
        if let Some(ElementKind::Host {
            node_ref: Some(node_ref),
            ..
        }) = self.fibers[fiber].memoized_props.as_ref().map(|e| e.kind())
        {
            node_ref.detach();
        }
    }

    /// Runs the layout cleanups and detaches the refs of a subtree that is
    /// being hidden or detached.
    pub(crate) fn disappear_layout_effects(&mut self, fiber: FiberId) {
        let Some(root) = self.root_id_of(fiber) else {
            return;
        };
        let mut stack = vec![fiber];
        while let Some(node) = stack.pop() {
            let record = &self.fibers[node];
            if record.is_hidden_offscreen() {
                // Already disappeared when it was hidden.
                continue;
            }
            match record.kind.clone() {
                FiberKind::FunctionComponent { .. } => {
                    self.commit_hook_effect_list_unmount(root, node, HookFlags::LAYOUT, false);
                }
                FiberKind::HostComponent { .. } => self.safely_detach_ref(node),
                _ => {}
            }
            let mut children = self.fibers.children(node);
            children.reverse();
            stack.extend(children);
        }
    }

    /// Mounts every layout effect and attaches every ref of a subtree that
    /// becomes visible again. Children come before parents.
    pub(crate) fn reappear_layout_effects(&mut self, fiber: FiberId) {
        let Some(root) = self.root_id_of(fiber) else {
            return;
        };
        self.reappear_layout_effects_in(root, fiber);
    }

    fn reappear_layout_effects_in(&mut self, root: RootId, fiber: FiberId) {
        if self.fibers[fiber].is_hidden_offscreen() {
            return;
        }
        for child in self.fibers.children(fiber) {
            self.reappear_layout_effects_in(root, child);
        }
        match self.fibers[fiber].kind.clone() {
            FiberKind::FunctionComponent { .. } => {
                self.commit_hook_effect_list_mount(root, fiber, HookFlags::LAYOUT, false);
            }
            FiberKind::HostComponent { .. } => self.safely_attach_ref(fiber),
            _ => {}
        }
    }

    pub(crate) fn root_id_of(&self, fiber: FiberId) -> Option<RootId> {
        let top = self.fibers.host_root_of(fiber)?;
        match self.fibers[top].state_node {
            crate::fiber::StateNode::Root(root) => Some(root),
            _ => None,
        }
    }

    /// Runs the cleanups of the `phase` effects of `fiber`. With
    /// `only_changed` set, effects whose deps did not change are skipped.
    pub(crate) fn commit_hook_effect_list_unmount(
        &mut self,
        root: RootId,
        fiber: FiberId,
        phase: HookFlags,
        only_changed: bool,
    ) {
        let effects = match &self.fibers[fiber].update_queue {
            FiberQueue::Function(queue) => queue.effects.clone(),
            _ => return,
        };
        for effect in effects {
            let matches = if only_changed {
                effect.has_effect(phase)
            } else {
                effect.tags.contains(phase)
            };
            if !matches {
                continue;
            }
            let destroy = effect.inst.lock().destroy.take();
            if let Some(destroy) = destroy
                && let Err(error) = destroy()
            {
                self.capture_commit_phase_error(root, fiber, error);
            }
        }
    }

    /// Runs the `phase` effects of `fiber` and stores their cleanups.
    pub(crate) fn commit_hook_effect_list_mount(
        &mut self,
        root: RootId,
        fiber: FiberId,
        phase: HookFlags,
        only_changed: bool,
    ) {
        let effects = match &self.fibers[fiber].update_queue {
            FiberQueue::Function(queue) => queue.effects.clone(),
            _ => return,
        };
        for effect in effects {
            let matches = if only_changed {
                effect.has_effect(phase)
            } else {
                effect.tags.contains(phase)
            };
            if !matches {
                continue;
            }
            match (effect.create)() {
                Ok(destroy) => effect.inst.lock().destroy = destroy,
                Err(error) => self.capture_commit_phase_error(root, fiber, error),
            }
        }
    }

    /// Routes an error thrown by an effect or cleanup of `source` to the
    /// nearest boundary that is not already showing an error, or to the root.
    pub(crate) fn capture_commit_phase_error(&mut self, root: RootId, source: FiberId, value: ThrownValue) {
        let info = ErrorInfo {
            value,
            component_stack: self.fibers.component_stack(source),
        };
        tracing::debug!(?source, error = %info.value, "Effect failed");

        let mut node = self.fibers.get(source).and_then(|fiber| fiber.parent);
        while let Some(id) = node {
            let Some(fiber) = self.fibers.get(id) else {
                break;
            };
            match (&fiber.kind, &fiber.update_queue) {
                (FiberKind::ErrorBoundary, FiberQueue::Boundary(queue)) => {
                    let failed = matches!(
                        &fiber.memoized_state,
                        FiberState::ErrorBoundary(state) if state.error.is_some()
                    );
                    if !failed {
                        let callback = self.caught_error_callback(root, id, info.clone());
                        queue.enqueue(
                            Update::new(Lanes::SYNC, BoundaryAction::Capture(info)).with_callback(callback),
                        );
                        self.schedule_commit_phase_capture(id);
                        return;
                    }
                }
                (FiberKind::HostRoot, FiberQueue::Root(queue)) => {
                    let callback = self.uncaught_error_callback(root, info.clone());
                    queue.enqueue(Update::new(Lanes::SYNC, RootAction::Uncaught).with_callback(callback));
                    self.schedule_commit_phase_capture(id);
                    return;
                }
                _ => {}
            }
            node = fiber.parent;
        }
        tracing::error!(error = %info.value, "Effect failed outside of any root{}", info.component_stack);
    }

    fn schedule_commit_phase_capture(&mut self, fiber: FiberId) {
        let Some(root) = self.mark_update_lane_from_fiber_to_root(fiber, Lanes::SYNC) else {
            return;
        };
        if let Some(fiber_root) = self.roots.get_mut(root) {
            fiber_root.mark_updated(Lanes::SYNC);
        }
        self.ensure_root_is_scheduled(root);
    }
}
