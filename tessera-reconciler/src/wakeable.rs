//! Awaitable values.
//!
//! A [`Wakeable`] is a one-shot signal that can be settled from any thread.
//! Components suspend on pending wakeables; the engine subscribes listeners
//! that ping the root or retry the boundary once it settles.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::error::ThrownValue;

static NEXT_WAKEABLE_ID: AtomicU64 = AtomicU64::new(1);

type Listener = Box<dyn FnOnce() + Send>;

/// Settlement state of a [`Wakeable`].
#[derive(Debug, Clone)]
pub enum WakeableStatus {
    /// Not settled yet.
    Pending,
    /// Settled successfully.
    Resolved,
    /// Settled with an error.
    Rejected(ThrownValue),
}

struct WakeableState {
    status: WakeableStatus,
    listeners: Vec<Listener>,
}

struct WakeableInner {
    id: u64,
    state: Mutex<WakeableState>,
}

/// A one-shot, thread-safe awaitable.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
/// use tessera_reconciler::Wakeable;
///
/// let wakeable = Wakeable::new();
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = fired.clone();
/// wakeable.subscribe(move || flag.store(true, Ordering::SeqCst));
/// wakeable.resolve();
/// assert!(fired.load(Ordering::SeqCst));
/// ```
#[derive(Clone)]
pub struct Wakeable {
    inner: Arc<WakeableInner>,
}

impl Wakeable {
    /// A pending wakeable.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WakeableInner {
                id: NEXT_WAKEABLE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(WakeableState {
                    status: WakeableStatus::Pending,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// An already resolved wakeable.
    pub fn resolved() -> Self {
        let wakeable = Self::new();
        wakeable.resolve();
        wakeable
    }

    /// Stable identity.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current status.
    pub fn status(&self) -> WakeableStatus {
        self.inner.state.lock().status.clone()
    }

    /// Whether the wakeable has settled.
    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.state.lock().status, WakeableStatus::Pending)
    }

    /// Resolves and runs listeners. Settling twice is a no-op.
    pub fn resolve(&self) {
        self.settle(WakeableStatus::Resolved);
    }

    /// Rejects and runs listeners. Settling twice is a no-op.
    pub fn reject(&self, error: ThrownValue) {
        self.settle(WakeableStatus::Rejected(error));
    }

    /// Runs `listener` once the wakeable settles, or right away if it already
    /// has.
    pub fn subscribe(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if matches!(state.status, WakeableStatus::Pending) {
            state.listeners.push(Box::new(listener));
            return;
        }
        drop(state);
        listener();
    }

    fn settle(&self, status: WakeableStatus) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if !matches!(state.status, WakeableStatus::Pending) {
                return;
            }
            state.status = status;
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener();
        }
    }
}

impl Default for Wakeable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Wakeable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Wakeable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wakeable")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// A value that becomes available later, paired with the wakeable that
/// announces it.
///
/// # Examples
///
/// ```
/// use tessera_reconciler::Resource;
///
/// let resource = Resource::<String>::pending();
/// assert!(resource.value().is_none());
/// resource.complete("ready".to_string());
/// assert_eq!(resource.value().as_deref(), Some("ready"));
/// ```
pub struct Resource<T> {
    wakeable: Wakeable,
    value: Arc<Mutex<Option<T>>>,
}

impl<T: Clone> Resource<T> {
    /// A resource without a value.
    pub fn pending() -> Self {
        Self {
            wakeable: Wakeable::new(),
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// A resource that already holds `value`.
    pub fn ready(value: T) -> Self {
        let resource = Self::pending();
        resource.complete(value);
        resource
    }

    /// Stores the value and resolves the wakeable.
    pub fn complete(&self, value: T) {
        *self.value.lock() = Some(value);
        self.wakeable.resolve();
    }

    /// Rejects the wakeable.
    pub fn fail(&self, error: ThrownValue) {
        self.wakeable.reject(error);
    }

    /// The value, if available.
    pub fn value(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// The announcing wakeable.
    pub fn wakeable(&self) -> &Wakeable {
        &self.wakeable
    }
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            wakeable: self.wakeable.clone(),
            value: self.value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn listeners_run_once() {
        let wakeable = Wakeable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        wakeable.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        wakeable.resolve();
        wakeable.resolve();
        wakeable.reject(ThrownValue::msg("late"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(wakeable.status(), WakeableStatus::Resolved));
    }

    #[test]
    fn subscribe_after_settle_runs_immediately() {
        let wakeable = Wakeable::resolved();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        wakeable.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settles_from_another_thread() {
        let resource = Resource::<u32>::pending();
        let remote = resource.clone();
        let handle = std::thread::spawn(move || remote.complete(9));
        match handle.join() {
            Ok(()) => {}
            Err(_) => panic!("resolver thread panicked"),
        }
        assert!(resource.wakeable().is_settled());
        assert_eq!(resource.value(), Some(9));
    }
}
