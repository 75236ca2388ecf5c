//! tessera-reconciler is a concurrent, priority-aware tree reconciliation engine.
//!
//! It keeps a committed tree in sync with a host (a widget toolkit, a DOM, a
//! terminal buffer, anything implementing [`HostConfig`]) while updates of
//! different urgency arrive. Urgent work preempts background work, rendering
//! can pause between nodes and resume later, and parts of the tree can wait
//! on asynchronous values behind suspense boundaries.
//!
//! # Components
//!
//! A component is a function from props to an [`Element`] tree. Hooks on the
//! [`RenderContext`] give it state and effects.
//!
//! ```
//! use tessera_reconciler::{
//!     Element, HostProps, Reconciler, ReconcilerConfig, RenderContext, RenderResult,
//!     RootOptions, test_renderer::TestRenderer, test_scheduler::TestScheduler,
//! };
//!
//! fn counter(cx: &mut RenderContext, start: &i32) -> RenderResult {
//!     let (count, _set_count) = cx.use_state(|| *start);
//!     Ok(Element::host(
//!         "span",
//!         HostProps::new(),
//!         vec![Element::text(count.to_string())],
//!     ))
//! }
//!
//! let mut reconciler = Reconciler::new(
//!     TestRenderer::default(),
//!     TestScheduler::default(),
//!     ReconcilerConfig::default(),
//! );
//! let root = reconciler.create_root((), RootOptions::default());
//! reconciler.render(root, Element::component(counter, 3)).unwrap();
//! reconciler.flush_all().unwrap();
//! assert_eq!(reconciler.host().markup(), "<span>3</span>");
//! ```
//!
//! # Priorities
//!
//! Every update is assigned a lane. Updates made inside
//! [`Reconciler::flush_sync`] or a discrete event use the sync lane and are
//! committed before the current task returns. Updates inside
//! [`Reconciler::start_transition`] use transition lanes and render
//! concurrently, yielding to the host between units of work.
//!
//! # Suspense
//!
//! A component that reads a pending [`Wakeable`] suspends. The nearest
//! [`Element::suspense`] boundary shows its fallback, and rendering retries
//! once the wakeable settles. Boundaries that already show content keep it
//! hidden instead of unmounting it.
//!
//! # Hosts
//!
//! The engine talks to the outside world through two traits:
//! [`HostConfig`] applies mutations during commit and [`HostScheduler`]
//! runs the callbacks the engine schedules. [`test_renderer`] and
//! [`test_scheduler`] provide in-memory implementations.
#![deny(missing_docs, clippy::unwrap_used)]

pub mod cache;
mod begin_work;
mod child_reconciler;
mod commit;
mod complete_work;
pub mod config;
pub mod context;
pub mod dyn_traits;
pub mod element;
pub mod error;
mod fiber;
pub mod hooks;
pub mod host;
mod inbox;
pub mod lane;
pub mod logging;
mod passive;
mod root;
mod scheduler;
pub mod suspense;
pub mod test_renderer;
pub mod test_scheduler;
mod update_queue;
pub mod wakeable;
mod work_loop;

#[cfg(test)]
mod test;

pub use crate::{
    cache::Cache,
    config::{ErrorCallback, ReconcilerConfig, RootOptions},
    context::Context,
    dyn_traits::{Dep, Deps, PropsValue, StateValue, deps_equal},
    element::{ComponentType, Element, ElementKind, ErrorFallback, HostProps, Key, NodeRef, RenderResult},
    error::{ErrorInfo, ReconcilerError, RenderSignal, ThrownValue},
    hooks::{Cleanup, Dispatch, EffectResult, Ref, RenderContext, SetState, StartTransition, StateAction, Store},
    host::{CallbackHandle, HostConfig, HostScheduler, SchedulerPriority, Task, TaskStatus},
    lane::{EventPriority, Lane, Lanes, Timestamp},
    logging::{init_deadlock_detection, init_tracing},
    root::RootId,
    suspense::SuspenseHandle,
    wakeable::{Resource, Wakeable, WakeableStatus},
    work_loop::Reconciler,
};
