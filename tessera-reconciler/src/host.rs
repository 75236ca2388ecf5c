//! Interfaces the engine consumes from its embedder.
//!
//! ## Usage
//!
//! Implement [`HostConfig`] to turn committed nodes into real instances and
//! [`HostScheduler`] to drive cooperative time slicing. The crate ships
//! in-memory versions of both in [`crate::test_renderer`] and
//! [`crate::test_scheduler`].

use std::fmt;

use crate::{cache::Cache, element::HostProps, lane::Timestamp, root::RootId};

/// Host scheduler priority levels, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulerPriority {
    /// Run before anything else.
    Immediate,
    /// Run soon; blocks user interaction otherwise.
    UserBlocking,
    /// Regular work.
    Normal,
    /// Work that can wait.
    Low,
    /// Work that only runs when nothing else is pending.
    Idle,
}

impl SchedulerPriority {
    /// Time after which a callback at this priority counts as timed out.
    pub const fn timeout(self) -> Option<Timestamp> {
        match self {
            SchedulerPriority::Immediate => Some(0),
            SchedulerPriority::UserBlocking => Some(250),
            SchedulerPriority::Normal => Some(5000),
            SchedulerPriority::Low => Some(10000),
            SchedulerPriority::Idle => None,
        }
    }
}

/// Opaque handle to a scheduled host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(pub u64);

/// Work the engine asks the host to run later.
///
/// The host hands the task back through [`crate::Reconciler::run_task`] or
/// [`crate::Reconciler::run_microtask`].
#[derive(Debug, Clone)]
pub enum Task {
    /// Render (and possibly commit) the root's next lanes.
    PerformWork(RootId),
    /// Re-evaluate which roots need callbacks. Scheduled as a microtask.
    ProcessRootSchedule,
    /// Run pending passive effects.
    FlushPassiveEffects,
    /// Commit a finished tree whose commit was throttled.
    CommitSuspended(RootId),
    /// Dispose a cache whose last reference was released.
    DisposeCache(Cache),
}

/// Result of running a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is finished.
    Done,
    /// The task yielded; run it again under the same handle.
    Continue,
}

/// Cooperative time-slicing primitives.
pub trait HostScheduler {
    /// Schedules `task` at `priority`.
    fn schedule_callback(&mut self, priority: SchedulerPriority, task: Task) -> CallbackHandle;

    /// Schedules `task` to run after `delay` milliseconds.
    fn schedule_timeout(&mut self, delay: Timestamp, task: Task) -> CallbackHandle;

    /// Cancels a callback or timeout. Unknown handles are ignored.
    fn cancel_callback(&mut self, handle: CallbackHandle);

    /// Queues `task` to run before the next callback.
    fn schedule_microtask(&mut self, task: Task);

    /// Current host time.
    fn now(&self) -> Timestamp;

    /// Whether the render loop should hand control back to the host.
    fn should_yield(&mut self) -> bool;

    /// Tells the host a commit produced visible changes.
    fn request_paint(&mut self);
}

/// Rendering backend.
///
/// Instances are created during the render phase but only attached to the
/// container during the mutation pass of a commit.
pub trait HostConfig {
    /// Handle to an element or text instance.
    type Instance: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;
    /// Handle to the top-level container a root renders into.
    type Container: Clone + fmt::Debug;

    /// Creates an element instance.
    fn create_instance(&mut self, tag: &str, props: &HostProps) -> Self::Instance;

    /// Creates a text instance.
    fn create_text_instance(&mut self, text: &str) -> Self::Instance;

    /// Appends a child to an instance that is not attached yet.
    fn append_initial_child(&mut self, parent: &Self::Instance, child: &Self::Instance);

    /// Appends a child to an attached instance.
    fn append_child(&mut self, parent: &Self::Instance, child: &Self::Instance);

    /// Inserts `child` before `before` inside `parent`.
    fn insert_before(
        &mut self,
        parent: &Self::Instance,
        child: &Self::Instance,
        before: &Self::Instance,
    );

    /// Removes `child` from `parent`.
    fn remove_child(&mut self, parent: &Self::Instance, child: &Self::Instance);

    /// Appends a child to the container.
    fn append_child_to_container(&mut self, container: &Self::Container, child: &Self::Instance);

    /// Inserts a child into the container before `before`.
    fn insert_in_container_before(
        &mut self,
        container: &Self::Container,
        child: &Self::Instance,
        before: &Self::Instance,
    );

    /// Removes a child from the container.
    fn remove_child_from_container(&mut self, container: &Self::Container, child: &Self::Instance);

    /// Applies new props to an instance.
    fn commit_update(
        &mut self,
        instance: &Self::Instance,
        tag: &str,
        old_props: &HostProps,
        new_props: &HostProps,
    );

    /// Replaces the content of a text instance.
    fn commit_text_update(&mut self, instance: &Self::Instance, old_text: &str, new_text: &str);

    /// Called before the mutation pass. Returns the focused instance, if any.
    fn prepare_for_commit(&mut self, container: &Self::Container) -> Option<Self::Instance>;

    /// Called after the mutation pass.
    fn reset_after_commit(&mut self, container: &Self::Container);

    /// Removes every child from the container before the first commit.
    fn clear_container(&mut self, container: &Self::Container);

    /// Hides an element or text instance.
    fn hide_instance(&mut self, instance: &Self::Instance);

    /// Shows a previously hidden instance.
    fn unhide_instance(&mut self, instance: &Self::Instance);

    /// Called when the focused instance is about to be detached.
    fn before_active_instance_blur(&mut self) {}

    /// Called after the focused instance was detached.
    fn after_active_instance_blur(&mut self) {}
}
