//! Deterministic host scheduler with virtual time.
//!
//! ## Usage
//!
//! Callbacks run in expiration order (start time plus the priority timeout,
//! ties broken by scheduling order). Time only moves through
//! [`TestScheduler::advance_time`], and [`TestScheduler::set_yield_after`]
//! makes the render loop yield after a fixed number of units of work, which
//! makes interruption reproducible.
//!
//! ```
//! use tessera_reconciler::{
//!     Element, Reconciler, ReconcilerConfig, RootOptions,
//!     test_renderer::TestRenderer, test_scheduler::TestScheduler,
//! };
//!
//! let mut reconciler = Reconciler::new(
//!     TestRenderer::default(),
//!     TestScheduler::default(),
//!     ReconcilerConfig::default(),
//! );
//! let root = reconciler.create_root((), RootOptions::default());
//! reconciler.render(root, Element::text("ready")).unwrap();
//! assert_eq!(reconciler.host().markup(), "");
//! reconciler.flush_all().unwrap();
//! assert_eq!(reconciler.host().markup(), "ready");
//! ```

use std::collections::{BTreeMap, VecDeque};

use crate::{
    error::ReconcilerError,
    host::{CallbackHandle, HostConfig, HostScheduler, SchedulerPriority, Task, TaskStatus},
    lane::Timestamp,
    work_loop::Reconciler,
};

/// Expiration used for priorities that never time out.
const NEVER: Timestamp = Timestamp::MAX / 2;

/// Upper bound on tasks run by one [`Reconciler::flush_all`] call.
const MAX_FLUSH_STEPS: usize = 100_000;

#[derive(Debug, Clone)]
struct ScheduledTask {
    priority: SchedulerPriority,
    task: Task,
}

/// A host scheduler driven explicitly by tests and tools.
#[derive(Debug, Default)]
pub struct TestScheduler {
    now: Timestamp,
    next_id: u64,
    /// Ready callbacks keyed by `(expiration, id)`.
    tasks: BTreeMap<(Timestamp, u64), ScheduledTask>,
    /// Delayed callbacks keyed by `(start, id)`.
    timers: BTreeMap<(Timestamp, u64), ScheduledTask>,
    microtasks: VecDeque<Task>,
    yield_after: Option<usize>,
    units_since_yield: usize,
    force_yield: bool,
    paint_requested: bool,
    log: Vec<String>,
}

impl TestScheduler {
    /// Makes `should_yield` return true after every `units` units of work.
    /// `None` never yields.
    pub fn set_yield_after(&mut self, units: Option<usize>) {
        self.yield_after = units;
        self.units_since_yield = 0;
    }

    /// Makes the next `should_yield` call return true.
    pub fn request_yield(&mut self) {
        self.force_yield = true;
    }

    /// Moves virtual time forward and releases timers that became due.
    pub fn advance_time(&mut self, ms: Timestamp) {
        self.now = self.now.saturating_add(ms);
        let due: Vec<_> = self
            .timers
            .range(..=(self.now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            if let Some(timer) = self.timers.remove(&key) {
                let expiration = expiration_for(key.0, timer.priority);
                self.tasks.insert((expiration, key.1), timer);
            }
        }
    }

    /// Whether a paint was requested since the last call.
    pub fn take_paint_request(&mut self) -> bool {
        std::mem::take(&mut self.paint_requested)
    }

    /// Whether any callback, timer or microtask is waiting.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.timers.is_empty() && self.microtasks.is_empty()
    }

    fn pop_microtask(&mut self) -> Option<Task> {
        self.microtasks.pop_front()
    }

    fn pop_task(&mut self) -> Option<(CallbackHandle, ScheduledTask, bool)> {
        let (&(expiration, id), _) = self.tasks.iter().next()?;
        let scheduled = self.tasks.remove(&(expiration, id))?;
        self.units_since_yield = 0;
        self.force_yield = false;
        Some((CallbackHandle(id), scheduled, expiration <= self.now))
    }

    fn requeue(&mut self, handle: CallbackHandle, scheduled: ScheduledTask) {
        let expiration = expiration_for(self.now, scheduled.priority);
        self.tasks.insert((expiration, handle.0), scheduled);
    }

    fn record(&mut self, entry: String) {
        self.log.push(entry);
    }
}

#[cfg(any(test, feature = "testing"))]
impl TestScheduler {
    /// Number of ready callbacks.
    pub fn pending_task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of delayed callbacks not yet due.
    pub fn pending_timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Names of the tasks run so far, in order.
    pub fn task_log(&self) -> &[String] {
        &self.log
    }

    /// Drains the task log.
    pub fn take_task_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }
}

fn expiration_for(start: Timestamp, priority: SchedulerPriority) -> Timestamp {
    match priority.timeout() {
        Some(timeout) => start.saturating_add(timeout),
        None => NEVER,
    }
}

fn task_name(task: &Task) -> String {
    match task {
        Task::PerformWork(root) => format!("PerformWork({root:?})"),
        Task::ProcessRootSchedule => "ProcessRootSchedule".to_string(),
        Task::FlushPassiveEffects => "FlushPassiveEffects".to_string(),
        Task::CommitSuspended(root) => format!("CommitSuspended({root:?})"),
        Task::DisposeCache(cache) => format!("DisposeCache({})", cache.id()),
    }
}

impl HostScheduler for TestScheduler {
    fn schedule_callback(&mut self, priority: SchedulerPriority, task: Task) -> CallbackHandle {
        self.next_id += 1;
        let id = self.next_id;
        let expiration = expiration_for(self.now, priority);
        self.tasks.insert((expiration, id), ScheduledTask { priority, task });
        CallbackHandle(id)
    }

    fn schedule_timeout(&mut self, delay: Timestamp, task: Task) -> CallbackHandle {
        self.next_id += 1;
        let id = self.next_id;
        let start = self.now.saturating_add(delay);
        self.timers.insert(
            (start, id),
            ScheduledTask {
                priority: SchedulerPriority::Normal,
                task,
            },
        );
        CallbackHandle(id)
    }

    fn cancel_callback(&mut self, handle: CallbackHandle) {
        self.tasks.retain(|(_, id), _| *id != handle.0);
        self.timers.retain(|(_, id), _| *id != handle.0);
    }

    fn schedule_microtask(&mut self, task: Task) {
        self.microtasks.push_back(task);
    }

    fn now(&self) -> Timestamp {
        self.now
    }

    fn should_yield(&mut self) -> bool {
        if std::mem::take(&mut self.force_yield) {
            return true;
        }
        let Some(limit) = self.yield_after else {
            return false;
        };
        self.units_since_yield += 1;
        if self.units_since_yield > limit {
            self.units_since_yield = 0;
            return true;
        }
        false
    }

    fn request_paint(&mut self) {
        self.paint_requested = true;
    }
}

impl<H: HostConfig> Reconciler<H, TestScheduler> {
    /// Applies pending signals and runs every queued microtask.
    pub fn flush_microtasks(&mut self) -> Result<(), ReconcilerError> {
        loop {
            self.process_signals()?;
            let Some(task) = self.scheduler.pop_microtask() else {
                return Ok(());
            };
            let name = task_name(&task);
            self.scheduler.record(format!("microtask {name}"));
            self.run_microtask(task)?;
        }
    }

    /// Runs the most urgent ready callback. Returns false when none is ready.
    pub fn flush_next_task(&mut self) -> Result<bool, ReconcilerError> {
        self.flush_microtasks()?;
        let Some((handle, scheduled, did_timeout)) = self.scheduler.pop_task() else {
            return Ok(false);
        };
        let name = task_name(&scheduled.task);
        self.scheduler.record(name);
        let status = self.run_task(handle, scheduled.task.clone(), did_timeout)?;
        if status == TaskStatus::Continue {
            self.scheduler.requeue(handle, scheduled);
        }
        self.flush_microtasks()?;
        Ok(true)
    }

    /// Runs callbacks until none is ready. Timers wait for
    /// [`TestScheduler::advance_time`].
    pub fn flush_all(&mut self) -> Result<(), ReconcilerError> {
        for _ in 0..MAX_FLUSH_STEPS {
            if !self.flush_next_task()? {
                return Ok(());
            }
        }
        tracing::warn!("flush_all stopped after {MAX_FLUSH_STEPS} tasks");
        Ok(())
    }

    /// Advances virtual time, then runs everything that became ready.
    pub fn advance_time_and_flush(&mut self, ms: Timestamp) -> Result<(), ReconcilerError> {
        self.scheduler.advance_time(ms);
        self.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pop(scheduler: &mut TestScheduler) -> (CallbackHandle, bool) {
        let Some((handle, _, did_timeout)) = scheduler.pop_task() else {
            panic!("expected a ready task");
        };
        (handle, did_timeout)
    }

    #[test]
    fn callbacks_run_in_expiration_order() {
        let mut scheduler = TestScheduler::default();
        let normal = scheduler.schedule_callback(SchedulerPriority::Normal, Task::FlushPassiveEffects);
        let urgent = scheduler.schedule_callback(SchedulerPriority::Immediate, Task::ProcessRootSchedule);
        let (first, _) = pop(&mut scheduler);
        let (second, _) = pop(&mut scheduler);
        assert_eq!(first, urgent);
        assert_eq!(second, normal);
        assert!(scheduler.pop_task().is_none());
    }

    #[test]
    fn timers_wait_for_virtual_time() {
        let mut scheduler = TestScheduler::default();
        scheduler.schedule_timeout(100, Task::FlushPassiveEffects);
        assert!(scheduler.pop_task().is_none());
        scheduler.advance_time(99);
        assert!(scheduler.pop_task().is_none());
        scheduler.advance_time(1);
        assert!(scheduler.pop_task().is_some());
    }

    #[test]
    fn cancelled_callbacks_never_run() {
        let mut scheduler = TestScheduler::default();
        let handle = scheduler.schedule_callback(SchedulerPriority::Normal, Task::FlushPassiveEffects);
        scheduler.cancel_callback(handle);
        assert!(scheduler.pop_task().is_none());
        assert!(scheduler.is_idle());
    }

    #[test]
    fn yields_after_the_configured_units() {
        let mut scheduler = TestScheduler::default();
        scheduler.set_yield_after(Some(2));
        assert!(!scheduler.should_yield());
        assert!(!scheduler.should_yield());
        assert!(scheduler.should_yield());
        assert!(!scheduler.should_yield());
    }

    #[test]
    fn expired_tasks_report_timeout() {
        let mut scheduler = TestScheduler::default();
        scheduler.schedule_callback(SchedulerPriority::UserBlocking, Task::FlushPassiveEffects);
        scheduler.advance_time(300);
        let (_, did_timeout) = pop(&mut scheduler);
        assert!(did_timeout);
    }
}
