//! Passive effects, flushed after the commit has been painted.
//!
//! A flush runs every passive cleanup first (deleted subtrees, then changed
//! effects of the remaining tree) and only then every passive effect, so an
//! effect never observes a sibling's stale subscription. Deleted records are
//! freed here, after their cleanups ran. Cache references taken by roots
//! and hidden subtrees are retained and released in the same passes.

use crate::{
    cache::Cache,
    error::ReconcilerError,
    fiber::{FiberId, FiberKind, FiberState, Flags, HookFlags, OffscreenState},
    host::{HostConfig, HostScheduler, SchedulerPriority, Task},
    lane::EventPriority,
    root::RootId,
    scheduler::ExecutionContext,
    work_loop::Reconciler,
};

impl<H, S> Reconciler<H, S>
where
    H: HostConfig,
    S: HostScheduler,
{
    /// Flushes pending passive effects. Returns whether there were any.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn flush_passive_effects(&mut self) -> Result<bool, ReconcilerError> {
        let Some(pending) = self.ctx.pending_passive.take() else {
            return Ok(false);
        };
        if !self.fibers.contains(pending.finished) {
            return Ok(false);
        }
        let root = pending.root;

        let priority = match EventPriority::from_lanes(pending.lanes) {
            EventPriority::Idle => EventPriority::Idle,
            _ => EventPriority::Default,
        };
        let previous_priority = self.inbox.set_update_priority(Some(priority));
        let previous_execution = self.ctx.execution;
        self.ctx.execution |= ExecutionContext::COMMIT;

        self.commit_passive_unmount_effects(root, pending.finished);
        self.commit_passive_mount_effects(root, pending.finished);

        self.ctx.execution = previous_execution;
        self.inbox.set_update_priority(previous_priority);
        tracing::trace!(?root, lanes = ?pending.lanes, "Flushed passive effects");

        if self.inbox.has_signals() {
            if self.ctx.root_with_nested_passive_updates == Some(root) {
                self.ctx.nested_passive_update_count += 1;
            } else {
                self.ctx.nested_passive_update_count = 0;
                self.ctx.root_with_nested_passive_updates = Some(root);
            }
        } else {
            self.ctx.nested_passive_update_count = 0;
        }

        self.process_pending_signals()?;
        self.flush_sync_work_on_all_roots()?;
        Ok(true)
    }

    /// Disposes `cache` from a host callback once nothing retains it.
    pub(crate) fn schedule_cache_disposal(&mut self, cache: Cache) {
        tracing::trace!(cache = cache.id(), "Scheduling cache disposal");
        self.scheduler
            .schedule_callback(SchedulerPriority::Normal, Task::DisposeCache(cache));
    }

    fn release_cache(&mut self, cache: &Cache) {
        if cache.release() {
            self.schedule_cache_disposal(cache.clone());
        }
    }

    fn commit_passive_unmount_effects(&mut self, root: RootId, fiber: FiberId) {
        let record = &mut self.fibers[fiber];
        if record.flags.contains(Flags::CHILD_DELETION) {
            let deletions = std::mem::take(&mut record.deletions);
            for deleted in deletions {
                self.commit_passive_unmount_effects_inside_deleted_tree(root, deleted);
                self.free_deleted_subtree(deleted);
            }
        }
        if self.fibers[fiber].subtree_flags.intersects(Flags::PASSIVE_MASK) {
            for child in self.fibers.children(fiber) {
                self.commit_passive_unmount_effects(root, child);
            }
        }
        let record = &self.fibers[fiber];
        if matches!(record.kind, FiberKind::FunctionComponent { .. })
            && record.flags.contains(Flags::PASSIVE)
        {
            self.commit_hook_effect_list_unmount(root, fiber, HookFlags::PASSIVE, true);
        }
    }

    fn commit_passive_unmount_effects_inside_deleted_tree(&mut self, root: RootId, deleted: FiberId) {
        if !self.fibers.contains(deleted) {
            return;
        }
        let mut stack = vec![deleted];
        while let Some(node) = stack.pop() {
            let record = &self.fibers[node];
            let kind = record.kind.clone();
            let hidden_cache = match &record.memoized_state {
                FiberState::Offscreen(OffscreenState { cache, .. }) => cache.clone(),
                _ => None,
            };
            let detached = record
                .suspense_instance()
                .is_some_and(|instance| instance.lock().detached);
            match kind {
                FiberKind::FunctionComponent { .. } => {
                    self.commit_hook_effect_list_unmount(root, node, HookFlags::PASSIVE, false);
                }
                FiberKind::Offscreen => {
                    if let Some(cache) = hidden_cache {
                        self.release_cache(&cache);
                    }
                }
                // Effects of the primary tree are already disconnected.
                FiberKind::Suspense if detached => continue,
                _ => {}
            }
            let mut children = self.fibers.children(node);
            children.reverse();
            stack.extend(children);
        }
    }

    /// Frees every record of a deleted subtree together with its alternate.
    fn free_deleted_subtree(&mut self, deleted: FiberId) {
        if !self.fibers.contains(deleted) {
            return;
        }
        let records = self.fibers.subtree(deleted);
        let count = records.len();
        for id in records {
            if let Some(fiber) = self.fibers.remove(id)
                && let Some(alternate) = fiber.alternate
            {
                self.fibers.remove(alternate);
            }
        }
        tracing::trace!(?deleted, count, "Freed deleted subtree");
    }

    fn commit_passive_mount_effects(&mut self, root: RootId, fiber: FiberId) {
        let descend = self.fibers[fiber].subtree_flags.intersects(Flags::PASSIVE_MASK)
            && !(matches!(self.fibers[fiber].kind, FiberKind::Offscreen) && self.is_detached_offscreen(fiber));
        if descend {
            for child in self.fibers.children(fiber) {
                self.commit_passive_mount_effects(root, child);
            }
        }

        let record = &self.fibers[fiber];
        let flags = record.flags;
        match record.kind.clone() {
            FiberKind::FunctionComponent { .. } if flags.contains(Flags::PASSIVE) => {
                self.commit_hook_effect_list_mount(root, fiber, HookFlags::PASSIVE, true);
            }
            FiberKind::HostRoot if flags.contains(Flags::PASSIVE) => {
                let next = match &record.memoized_state {
                    FiberState::Root(state) => Some(state.cache.clone()),
                    _ => None,
                };
                let previous = record
                    .alternate
                    .and_then(|current| match &self.fibers.get(current)?.memoized_state {
                        FiberState::Root(state) => Some(state.cache.clone()),
                        _ => None,
                    });
                if let Some(next) = next
                    && !previous.as_ref().is_some_and(|previous| previous.ptr_eq(&next))
                {
                    next.retain();
                    if let Some(previous) = previous {
                        tracing::debug!(?root, old = previous.id(), new = next.id(), "Root cache replaced");
                        self.release_cache(&previous);
                    }
                }
            }
            FiberKind::Offscreen if flags.contains(Flags::VISIBILITY) => {
                self.commit_offscreen_cache(root, fiber);
            }
            _ => {}
        }
    }

    /// A subtree that gets hidden keeps the root cache alive until it is
    /// revealed or deleted.
    fn commit_offscreen_cache(&mut self, root: RootId, fiber: FiberId) {
        let is_hidden = self.fibers[fiber].is_hidden_offscreen();
        let previous = self.fibers[fiber]
            .alternate
            .and_then(|current| match &self.fibers.get(current)?.memoized_state {
                FiberState::Offscreen(state) => Some(state.cache.clone()),
                _ => None,
            });
        match (is_hidden, previous) {
            (true, None) => {
                let Some(cache) = self.current_root_cache(root) else {
                    return;
                };
                cache.retain();
                if let FiberState::Offscreen(state) = &mut self.fibers[fiber].memoized_state {
                    state.cache = Some(cache);
                }
            }
            (false, Some(Some(cache))) => self.release_cache(&cache),
            _ => {}
        }
    }

    fn current_root_cache(&self, root: RootId) -> Option<Cache> {
        let current = self.roots.get(root)?.current;
        match &self.fibers.get(current)?.memoized_state {
            FiberState::Root(state) => Some(state.cache.clone()),
            _ => None,
        }
    }

    fn is_detached_offscreen(&self, fiber: FiberId) -> bool {
        self.fibers[fiber]
            .parent
            .and_then(|parent| self.fibers.get(parent))
            .and_then(|parent| parent.suspense_instance())
            .is_some_and(|instance| instance.lock().detached)
    }

    /// Runs every passive cleanup in a subtree without unmounting it.
    pub(crate) fn disconnect_passive_effects(&mut self, fiber: FiberId) {
        let Some(root) = self.root_id_of(fiber) else {
            return;
        };
        let mut stack = vec![fiber];
        while let Some(node) = stack.pop() {
            if matches!(self.fibers[node].kind, FiberKind::FunctionComponent { .. }) {
                self.commit_hook_effect_list_unmount(root, node, HookFlags::PASSIVE, false);
            }
            let mut children = self.fibers.children(node);
            children.reverse();
            stack.extend(children);
        }
    }

    /// Runs every passive effect in a subtree again, children first.
    pub(crate) fn reconnect_passive_effects(&mut self, fiber: FiberId) {
        let Some(root) = self.root_id_of(fiber) else {
            return;
        };
        self.reconnect_passive_effects_in(root, fiber);
    }

    fn reconnect_passive_effects_in(&mut self, root: RootId, fiber: FiberId) {
        for child in self.fibers.children(fiber) {
            self.reconnect_passive_effects_in(root, child);
        }
        if matches!(self.fibers[fiber].kind, FiberKind::FunctionComponent { .. }) {
            self.commit_hook_effect_list_mount(root, fiber, HookFlags::PASSIVE, false);
        }
    }
}
