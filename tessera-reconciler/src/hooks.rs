//! Per-render component context and the hooks surface.
//!
//! ## Usage
//!
//! Every function component receives a [`RenderContext`]. Hooks must be
//! called in the same order on every render; the engine reports a
//! [`crate::ReconcilerError::HookOrder`] render error otherwise.
//!
//! ```
//! use tessera_reconciler::{Element, RenderContext, RenderResult, deps};
//!
//! fn counter(cx: &mut RenderContext, label: &String) -> RenderResult {
//!     let (count, set_count) = cx.use_state(|| 0u32);
//!     cx.use_effect(Some(deps![count]), move || {
//!         let _ = &set_count;
//!         Ok(None)
//!     });
//!     Ok(Element::text(format!("{label}: {count}")))
//! }
//! # let _ = Element::component(counter, "clicks".to_string());
//! ```

use std::{
    any::Any,
    fmt,
    hash::Hash,
    marker::PhantomData,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    cache::Cache,
    context::{Context, ContextId, ContextMap},
    dyn_traits::{Deps, StateValue, deps_equal},
    error::{ReconcilerError, RenderSignal, ThrownValue},
    fiber::{FiberId, Flags, HookFlags},
    inbox::{Inbox, Signal, in_transition},
    lane::Lanes,
    update_queue::{SharedQueue, Update, UpdateQueue},
    wakeable::{Resource, Wakeable, WakeableStatus},
};

/// Cleanup returned by an effect, run before the effect fires again and on
/// unmount.
pub type Cleanup = Box<dyn FnOnce() -> Result<(), ThrownValue> + Send>;

/// Outcome of running an effect body.
pub type EffectResult = Result<Option<Cleanup>, ThrownValue>;

type EffectFn = Arc<dyn Fn() -> EffectResult + Send + Sync>;

type ErasedReducer =
    Arc<dyn Fn(&Arc<dyn StateValue>, &(dyn Any + Send + Sync)) -> Arc<dyn StateValue> + Send + Sync>;

/// Cleanup slot shared by every render of one effect hook.
#[derive(Default)]
pub(crate) struct EffectInstance {
    pub(crate) destroy: Option<Cleanup>,
}

/// One effect collected by a render.
#[derive(Clone)]
pub(crate) struct Effect {
    pub(crate) tags: HookFlags,
    pub(crate) create: EffectFn,
    pub(crate) inst: Arc<Mutex<EffectInstance>>,
    pub(crate) deps: Option<Deps>,
}

impl Effect {
    pub(crate) fn has_effect(&self, phase: HookFlags) -> bool {
        self.tags.contains(phase | HookFlags::HAS_EFFECT)
    }
}

/// Snapshot read by a render, verified again before commit.
#[derive(Clone)]
pub(crate) struct StoreCheck {
    read: Arc<dyn Fn() -> Arc<dyn StateValue> + Send + Sync>,
    rendered: Arc<dyn StateValue>,
}

impl StoreCheck {
    pub(crate) fn is_consistent(&self) -> bool {
        let latest = (self.read)();
        Arc::ptr_eq(&latest, &self.rendered) || latest.dyn_eq(self.rendered.as_ref())
    }
}

#[derive(Clone)]
pub(crate) struct HookAction {
    payload: Arc<dyn Any + Send + Sync>,
    eager: Option<Arc<dyn StateValue>>,
}

/// What a dispatcher needs to compute the next state without rendering.
struct EagerState {
    last_rendered: Arc<dyn StateValue>,
    reducer: ErasedReducer,
    idle: bool,
}

#[derive(Clone)]
pub(crate) struct StateHook {
    queue: UpdateQueue<HookAction, Arc<dyn StateValue>>,
    memoized: Arc<dyn StateValue>,
    eager: Arc<Mutex<EagerState>>,
}

#[derive(Clone)]
pub(crate) struct MemoHook {
    value: Arc<dyn Any + Send + Sync>,
    deps: Option<Deps>,
}

/// Memoized state of one hook slot.
#[derive(Clone)]
pub(crate) enum Hook {
    State(StateHook),
    Effect(Effect),
    Memo(MemoHook),
    Ref(Arc<dyn Any + Send + Sync>),
    Context(ContextId, Arc<dyn StateValue>),
    Store(Arc<dyn StateValue>),
    Deferred(Arc<dyn StateValue>),
}

impl Hook {
    fn name(&self) -> &'static str {
        match self {
            Hook::State(_) => "state",
            Hook::Effect(_) => "effect",
            Hook::Memo(_) => "memo",
            Hook::Ref(_) => "ref",
            Hook::Context(..) => "context",
            Hook::Store(_) => "external store",
            Hook::Deferred(_) => "deferred value",
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook({})", self.name())
    }
}

/// Dispatches actions to a reducer hook. Cheap to clone and callable from
/// any thread.
pub struct Dispatch<A> {
    fiber: FiberId,
    shared: Arc<Mutex<SharedQueue<HookAction>>>,
    eager: Arc<Mutex<EagerState>>,
    inbox: Weak<Inbox>,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for Dispatch<A> {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber,
            shared: self.shared.clone(),
            eager: self.eager.clone(),
            inbox: self.inbox.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for Dispatch<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch").field("fiber", &self.fiber).finish()
    }
}

impl<A> PartialEq for Dispatch<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<A: Send + Sync + 'static> Dispatch<A> {
    /// Enqueues `action` at the lane of the current execution context.
    pub fn dispatch(&self, action: A) {
        let Some(inbox) = self.inbox.upgrade() else {
            tracing::debug!("Dropped an update dispatched after the engine shut down");
            return;
        };
        let lane = inbox.request_update_lane();
        let payload: Arc<dyn Any + Send + Sync> = Arc::new(action);

        if inbox.try_render_phase_update(self.fiber) {
            self.shared
                .lock()
                .push(Update::new(lane, HookAction { payload, eager: None }));
            return;
        }

        let mut eager_state = None;
        {
            let eager = self.eager.lock();
            if eager.idle && self.shared.lock().is_empty() {
                let next = (eager.reducer)(&eager.last_rendered, &*payload);
                if next.dyn_eq(eager.last_rendered.as_ref()) {
                    // Equal state: queue it for the next render but schedule nothing.
                    self.shared.lock().push(Update::new(
                        lane,
                        HookAction {
                            payload,
                            eager: Some(next),
                        },
                    ));
                    tracing::trace!(fiber = ?self.fiber, "Eager bailout");
                    return;
                }
                eager_state = Some(next);
            }
        }

        self.shared.lock().push(Update::new(
            lane,
            HookAction {
                payload,
                eager: eager_state,
            },
        ));
        inbox.push(Signal::Update {
            fiber: self.fiber,
            lane,
        });
    }
}

/// Action of a [`RenderContext::use_state`] hook.
pub enum StateAction<T> {
    /// Replace the state.
    Set(T),
    /// Derive the next state from the previous one. May run more than once.
    Update(Box<dyn Fn(&T) -> T + Send + Sync>),
}

/// Setter returned by [`RenderContext::use_state`].
pub type SetState<T> = Dispatch<StateAction<T>>;

impl<T: Send + Sync + 'static> Dispatch<StateAction<T>> {
    /// Replaces the state.
    pub fn set(&self, value: T) {
        self.dispatch(StateAction::Set(value));
    }

    /// Derives the next state from the previous one.
    pub fn update(&self, f: impl Fn(&T) -> T + Send + Sync + 'static) {
        self.dispatch(StateAction::Update(Box::new(f)));
    }
}

fn basic_state_reducer<T: Clone>(state: &T, action: &StateAction<T>) -> T {
    match action {
        StateAction::Set(value) => value.clone(),
        StateAction::Update(f) => f(state),
    }
}

fn erase_reducer<S, A, R>(reducer: R) -> ErasedReducer
where
    S: PartialEq + Send + Sync + 'static,
    A: Send + Sync + 'static,
    R: Fn(&S, &A) -> S + Send + Sync + 'static,
{
    Arc::new(
        move |state: &Arc<dyn StateValue>, action: &(dyn Any + Send + Sync)| match (
            state.downcast_ref::<S>(),
            action.downcast_ref::<A>(),
        ) {
            (Some(state), Some(action)) => Arc::new(reducer(state, action)) as Arc<dyn StateValue>,
            _ => state.clone(),
        },
    )
}

/// A mutable cell that survives re-renders without triggering them.
pub struct Ref<T>(Arc<Mutex<T>>);

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone> Ref<T> {
    /// Reads the current value.
    pub fn get(&self) -> T {
        self.0.lock().clone()
    }
}

impl<T> Ref<T> {
    /// Replaces the value.
    pub fn set(&self, value: T) {
        *self.0.lock() = value;
    }

    /// Runs `f` with mutable access to the value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.0.lock())
    }
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

type StoreListener = Arc<dyn Fn() + Send + Sync>;

struct StoreInner<T> {
    id: u64,
    value: Mutex<Arc<T>>,
    listeners: Mutex<Vec<(u64, StoreListener)>>,
    next_listener: AtomicU64,
}

/// An external mutable source read with
/// [`RenderContext::use_sync_external_store`].
///
/// # Examples
///
/// ```
/// use tessera_reconciler::Store;
///
/// let store = Store::new(1u32);
/// store.set(2);
/// assert_eq!(*store.get(), 2);
/// ```
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: PartialEq + Send + Sync + 'static> Store<T> {
    /// A store holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
                value: Mutex::new(Arc::new(value)),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<T> {
        self.inner.value.lock().clone()
    }

    /// Replaces the value and notifies subscribers when it changed.
    pub fn set(&self, value: T) {
        {
            let mut current = self.inner.value.lock();
            if **current == value {
                return;
            }
            *current = Arc::new(value);
        }
        let listeners: Vec<StoreListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }

    /// Registers `listener`; returns a token for [`Store::unsubscribe`].
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> u64 {
        let token = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((token, Arc::new(listener)));
        token
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, token: u64) {
        self.inner.listeners.lock().retain(|(id, _)| *id != token);
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// Starts transitions for a [`RenderContext::use_transition`] hook.
#[derive(Clone)]
pub struct StartTransition {
    set_pending: SetState<bool>,
    inbox: Weak<Inbox>,
}

impl StartTransition {
    /// Marks the hook pending at the current priority, then runs `f` inside a
    /// transition so updates made by `f` render at a transition lane.
    pub fn start(&self, f: impl FnOnce()) {
        let Some(inbox) = self.inbox.upgrade() else {
            f();
            return;
        };
        self.set_pending.set(true);
        in_transition(&inbox, || {
            self.set_pending.set(false);
            f();
        });
    }
}

/// Everything a render produced besides its children.
pub(crate) struct HookOutput {
    pub(crate) hooks: Vec<Hook>,
    pub(crate) effects: Vec<Effect>,
    pub(crate) stores: Vec<StoreCheck>,
    pub(crate) flags: Flags,
    pub(crate) remaining_lanes: Lanes,
    pub(crate) dependencies: SmallVec<[ContextId; 2]>,
    pub(crate) did_receive_update: bool,
    pub(crate) error: Option<ThrownValue>,
}

/// Inputs for one component render.
pub(crate) struct RenderInput {
    pub(crate) fiber: FiberId,
    pub(crate) component: &'static str,
    pub(crate) render_lanes: Lanes,
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) contexts: ContextMap,
    pub(crate) root_cache: Cache,
    pub(crate) current_hooks: Option<Vec<Hook>>,
}

/// Per-render state handed to function components.
pub struct RenderContext {
    fiber: FiberId,
    component: &'static str,
    render_lanes: Lanes,
    inbox: Arc<Inbox>,
    contexts: ContextMap,
    root_cache: Cache,
    current_hooks: Option<Vec<Hook>>,
    previous_pass: Option<Vec<Hook>>,
    hooks: Vec<Hook>,
    index: usize,
    effects: Vec<Effect>,
    stores: Vec<StoreCheck>,
    flags: Flags,
    remaining_lanes: Lanes,
    dependencies: SmallVec<[ContextId; 2]>,
    did_receive_update: bool,
    error: Option<ThrownValue>,
}

impl RenderContext {
    pub(crate) fn new(input: RenderInput) -> Self {
        Self {
            fiber: input.fiber,
            component: input.component,
            render_lanes: input.render_lanes,
            inbox: input.inbox,
            contexts: input.contexts,
            root_cache: input.root_cache,
            current_hooks: input.current_hooks,
            previous_pass: None,
            hooks: Vec::new(),
            index: 0,
            effects: Vec::new(),
            stores: Vec::new(),
            flags: Flags::empty(),
            remaining_lanes: Lanes::NONE,
            dependencies: SmallVec::new(),
            did_receive_update: false,
            error: None,
        }
    }

    /// Resets per-pass state before the component runs again because it
    /// updated itself while rendering.
    pub(crate) fn prepare_rerender(&mut self) {
        self.previous_pass = Some(std::mem::take(&mut self.hooks));
        self.index = 0;
        self.effects.clear();
        self.stores.clear();
        self.flags = Flags::empty();
        self.dependencies.clear();
        self.error = None;
    }

    pub(crate) fn finish(mut self) -> HookOutput {
        let expected = self.current_hooks.as_ref().map_or(0, Vec::len);
        if self.error.is_none() && self.current_hooks.is_some() && self.hooks.len() < expected {
            self.error = Some(
                ReconcilerError::HookOrder {
                    component: self.component,
                    index: self.hooks.len(),
                }
                .into(),
            );
        }
        HookOutput {
            hooks: self.hooks,
            effects: self.effects,
            stores: self.stores,
            flags: self.flags,
            remaining_lanes: self.remaining_lanes,
            dependencies: self.dependencies,
            did_receive_update: self.did_receive_update,
            error: self.error,
        }
    }

    /// Lanes of the render in progress.
    pub fn render_lanes(&self) -> Lanes {
        self.render_lanes
    }

    fn prior(&self) -> Option<&Hook> {
        match &self.previous_pass {
            Some(hooks) => hooks.get(self.index),
            None => self.current_hooks.as_ref().and_then(|hooks| hooks.get(self.index)),
        }
    }

    fn committed(&self) -> Option<&Hook> {
        self.current_hooks
            .as_ref()
            .and_then(|hooks| hooks.get(self.index))
    }

    fn order_error(&mut self) {
        if self.error.is_none() {
            self.error = Some(
                ReconcilerError::HookOrder {
                    component: self.component,
                    index: self.index,
                }
                .into(),
            );
        }
    }

    fn push(&mut self, hook: Hook) {
        self.hooks.push(hook);
        self.index += 1;
    }

    /// Local state. Returns the current value and a setter.
    pub fn use_state<T>(&mut self, init: impl FnOnce() -> T) -> (T, SetState<T>)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.use_reducer(basic_state_reducer::<T>, init)
    }

    /// State driven by a reducer. The latest `reducer` is used for every
    /// update processed by this render.
    pub fn use_reducer<S, A, R>(&mut self, reducer: R, init: impl FnOnce() -> S) -> (S, Dispatch<A>)
    where
        S: Clone + PartialEq + Send + Sync + 'static,
        A: Send + Sync + 'static,
        R: Fn(&S, &A) -> S + Send + Sync + 'static,
    {
        let reducer = erase_reducer(reducer);
        let prior = match self.prior() {
            Some(Hook::State(hook)) if hook.memoized.downcast_ref::<S>().is_some() => {
                Some(hook.clone())
            }
            Some(_) => {
                self.order_error();
                None
            }
            None => None,
        };

        let (hook, value) = match prior {
            Some(mut hook) => {
                self.update_state_hook(&mut hook, &reducer);
                match hook.memoized.downcast_ref::<S>().cloned() {
                    Some(value) => (hook, value),
                    None => {
                        self.order_error();
                        let value = init();
                        (self.mount_state_hook(Arc::new(value.clone()), reducer), value)
                    }
                }
            }
            None => {
                let value = init();
                (self.mount_state_hook(Arc::new(value.clone()), reducer), value)
            }
        };

        let dispatch = Dispatch {
            fiber: self.fiber,
            shared: hook.queue.shared.clone(),
            eager: hook.eager.clone(),
            inbox: Arc::downgrade(&self.inbox),
            _marker: PhantomData,
        };
        self.push(Hook::State(hook));
        (value, dispatch)
    }

    fn mount_state_hook(&self, state: Arc<dyn StateValue>, reducer: ErasedReducer) -> StateHook {
        StateHook {
            queue: UpdateQueue::new(state.clone()),
            memoized: state.clone(),
            eager: Arc::new(Mutex::new(EagerState {
                last_rendered: state,
                reducer,
                idle: true,
            })),
        }
    }

    fn update_state_hook(&mut self, hook: &mut StateHook, reducer: &ErasedReducer) {
        let pending = hook.queue.take_pending();
        if !pending.is_empty() {
            if let Some(Hook::State(current)) = self
                .current_hooks
                .as_mut()
                .and_then(|hooks| hooks.get_mut(self.index))
            {
                current.queue.append_base(&pending);
            }
            hook.queue.append_base(&pending);
        }

        let processed = hook.queue.process(self.render_lanes, |state, action| {
            match &action.eager {
                Some(eager) => eager.clone(),
                None => reducer(state, &*action.payload),
            }
        });
        self.remaining_lanes |= processed.skipped_lanes;
        if !processed.state.dyn_eq(hook.memoized.as_ref()) {
            self.did_receive_update = true;
        }
        hook.memoized = processed.state;

        let mut eager = hook.eager.lock();
        eager.last_rendered = hook.memoized.clone();
        eager.reducer = reducer.clone();
        eager.idle = hook.queue.base_updates.is_empty();
    }

    fn push_effect(&mut self, phase: HookFlags, deps: Option<Deps>, create: EffectFn) {
        let inst = match self.prior() {
            Some(Hook::Effect(effect)) => Some(effect.inst.clone()),
            Some(_) => {
                self.order_error();
                None
            }
            None => None,
        };
        let changed = match (self.committed(), &deps) {
            (Some(Hook::Effect(previous)), Some(next)) => !previous
                .deps
                .as_ref()
                .is_some_and(|previous| deps_equal(previous, next)),
            _ => true,
        };

        let mut tags = phase;
        if changed {
            tags |= HookFlags::HAS_EFFECT;
        }
        if phase.contains(HookFlags::PASSIVE) {
            self.flags |= Flags::PASSIVE_STATIC;
            if changed {
                self.flags |= Flags::PASSIVE;
            }
        } else {
            self.flags |= Flags::LAYOUT_STATIC;
            if changed {
                self.flags |= Flags::UPDATE;
            }
        }

        let effect = Effect {
            tags,
            create,
            inst: inst.unwrap_or_default(),
            deps,
        };
        self.effects.push(effect.clone());
        self.push(Hook::Effect(effect));
    }

    /// Passive effect, run after the commit is painted. `None` deps run the
    /// effect after every commit.
    pub fn use_effect<F>(&mut self, deps: Option<Deps>, create: F)
    where
        F: Fn() -> EffectResult + Send + Sync + 'static,
    {
        self.push_effect(HookFlags::PASSIVE, deps, Arc::new(create));
    }

    /// Layout effect, run synchronously during commit after host mutations.
    pub fn use_layout_effect<F>(&mut self, deps: Option<Deps>, create: F)
    where
        F: Fn() -> EffectResult + Send + Sync + 'static,
    {
        self.push_effect(HookFlags::LAYOUT, deps, Arc::new(create));
    }

    /// Recomputes `compute` only when `deps` change.
    pub fn use_memo<T>(&mut self, deps: Deps, compute: impl FnOnce() -> T) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        let reused = match self.prior() {
            Some(Hook::Memo(memo)) => memo
                .deps
                .as_ref()
                .filter(|previous| deps_equal(previous, &deps))
                .and_then(|_| memo.value.downcast_ref::<T>().cloned()),
            Some(_) => {
                self.order_error();
                None
            }
            None => None,
        };
        let value = match reused {
            Some(value) => value,
            None => compute(),
        };
        self.push(Hook::Memo(MemoHook {
            value: Arc::new(value.clone()),
            deps: Some(deps),
        }));
        value
    }

    /// Keeps the same callback instance while `deps` are unchanged.
    pub fn use_callback<F>(&mut self, deps: Deps, callback: F) -> Arc<F>
    where
        F: Send + Sync + 'static,
    {
        self.use_memo(deps, || Arc::new(callback))
    }

    /// A mutable cell that keeps its identity across renders.
    pub fn use_ref<T>(&mut self, init: impl FnOnce() -> T) -> Ref<T>
    where
        T: Send + 'static,
    {
        let existing = match self.prior() {
            Some(Hook::Ref(cell)) => cell.clone().downcast::<Mutex<T>>().ok(),
            Some(_) => {
                self.order_error();
                None
            }
            None => None,
        };
        let cell = match existing {
            Some(cell) => cell,
            None => Arc::new(Mutex::new(init())),
        };
        self.push(Hook::Ref(cell.clone()));
        Ref(cell)
    }

    /// Reads the nearest provided value of `context`.
    pub fn use_context<T>(&mut self, context: &Context<T>) -> T
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let value = self
            .contexts
            .get(&context.id())
            .cloned()
            .unwrap_or_else(|| context.default_erased());
        match self.prior() {
            Some(Hook::Context(id, previous)) if *id == context.id() => {
                if !previous.dyn_eq(value.as_ref()) {
                    self.did_receive_update = true;
                }
            }
            Some(_) => self.order_error(),
            None => {}
        }
        if !self.dependencies.contains(&context.id()) {
            self.dependencies.push(context.id());
        }
        self.push(Hook::Context(context.id(), value.clone()));
        match value.downcast_ref::<T>() {
            Some(value) => value.clone(),
            None => context.default_value().clone(),
        }
    }

    /// Subscribes to an external store and reads a consistent snapshot.
    /// Changes re-render the component synchronously.
    pub fn use_sync_external_store<T>(&mut self, store: &Store<T>) -> Arc<T>
    where
        T: PartialEq + Send + Sync + 'static,
    {
        let snapshot = store.get();
        let erased: Arc<dyn StateValue> = Arc::new(snapshot.clone());
        match self.prior() {
            Some(Hook::Store(previous)) => {
                if !previous.dyn_eq(erased.as_ref()) {
                    self.did_receive_update = true;
                }
            }
            Some(_) => self.order_error(),
            None => {}
        }
        self.push(Hook::Store(erased.clone()));

        if !self.render_lanes.includes_blocking_lane() {
            let reader = store.clone();
            self.flags |= Flags::STORE_CONSISTENCY;
            self.stores.push(StoreCheck {
                read: Arc::new(move || Arc::new(reader.get()) as Arc<dyn StateValue>),
                rendered: erased,
            });
        }

        let subscribed = store.clone();
        let inbox = Arc::downgrade(&self.inbox);
        let fiber = self.fiber;
        let rendered = snapshot.clone();
        self.use_effect(Some(crate::deps![store.inner.id]), move || {
            let inbox = inbox.clone();
            let notify = move || {
                if let Some(inbox) = inbox.upgrade() {
                    inbox.push(Signal::Update {
                        fiber,
                        lane: Lanes::SYNC,
                    });
                }
            };
            // The store may have changed between render and subscription.
            if *subscribed.get() != *rendered {
                notify();
            }
            let token = subscribed.subscribe(notify);
            let store = subscribed.clone();
            Ok(Some(Box::new(move || {
                store.unsubscribe(token);
                Ok(())
            }) as Cleanup))
        });
        snapshot
    }

    /// Returns whether a transition started by this hook is still pending and
    /// a handle to start one.
    pub fn use_transition(&mut self) -> (bool, StartTransition) {
        let (pending, set_pending) = self.use_state(|| false);
        (
            pending,
            StartTransition {
                set_pending,
                inbox: Arc::downgrade(&self.inbox),
            },
        )
    }

    /// Runs `f` inside a transition.
    pub fn start_transition<R>(&self, f: impl FnOnce() -> R) -> R {
        in_transition(&self.inbox, f)
    }

    /// Returns the previous value during urgent renders and schedules a
    /// transition render that switches to `value`.
    pub fn use_deferred_value<T>(&mut self, value: T) -> T
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let previous = match self.prior() {
            Some(Hook::Deferred(previous)) => previous.downcast_ref::<T>().cloned(),
            Some(_) => {
                self.order_error();
                None
            }
            None => None,
        };
        let shown = match previous {
            None => value,
            Some(previous) if previous == value => value,
            Some(_) if self.render_lanes.includes_only_non_urgent() => {
                self.did_receive_update = true;
                value
            }
            Some(previous) => {
                let lane = self.inbox.claim_transition_lane();
                self.inbox.push(Signal::Update {
                    fiber: self.fiber,
                    lane,
                });
                previous
            }
        };
        self.push(Hook::Deferred(Arc::new(shown.clone())));
        shown
    }

    /// Suspends until `wakeable` settles.
    pub fn use_awaitable(&mut self, wakeable: &Wakeable) -> Result<(), RenderSignal> {
        match wakeable.status() {
            WakeableStatus::Resolved => Ok(()),
            WakeableStatus::Pending => Err(RenderSignal::Suspend(wakeable.clone())),
            WakeableStatus::Rejected(error) => Err(RenderSignal::Error(error)),
        }
    }

    /// Reads a resource, suspending while it has no value.
    pub fn use_resource<T: Clone>(&mut self, resource: &Resource<T>) -> Result<T, RenderSignal> {
        self.use_awaitable(resource.wakeable())?;
        resource
            .value()
            .ok_or_else(|| RenderSignal::Suspend(resource.wakeable().clone()))
    }

    /// Reads or fills an entry of the root cache.
    pub fn use_cache<K, T>(&mut self, key: &K, init: impl FnOnce() -> T) -> Arc<T>
    where
        K: Hash + 'static,
        T: Send + Sync + 'static,
    {
        if !self.dependencies.contains(&ContextId::ROOT_CACHE) {
            self.dependencies.push(ContextId::ROOT_CACHE);
        }
        self.root_cache.get_or_insert_with(key, init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_for(inbox: &Arc<Inbox>, current: Option<Vec<Hook>>, lanes: Lanes) -> RenderContext {
        RenderContext::new(RenderInput {
            fiber: FiberId::default(),
            component: "test",
            render_lanes: lanes,
            inbox: inbox.clone(),
            contexts: ContextMap::default(),
            root_cache: Cache::new(),
            current_hooks: current,
        })
    }

    #[test]
    fn state_updates_apply_on_next_render() {
        let inbox = Arc::new(Inbox::default());
        let mut cx = context_for(&inbox, None, Lanes::DEFAULT);
        let (value, set) = cx.use_state(|| 1u32);
        assert_eq!(value, 1);
        let first = cx.finish();

        set.set(5);
        assert_eq!(
            inbox.drain(),
            vec![Signal::Update {
                fiber: FiberId::default(),
                lane: Lanes::DEFAULT
            }]
        );

        let mut cx = context_for(&inbox, Some(first.hooks), Lanes::DEFAULT);
        let (value, _) = cx.use_state(|| 1u32);
        assert_eq!(value, 5);
        let output = cx.finish();
        assert!(output.did_receive_update);
        assert!(output.error.is_none());
    }

    #[test]
    fn equal_state_bails_out_eagerly() {
        let inbox = Arc::new(Inbox::default());
        let mut cx = context_for(&inbox, None, Lanes::DEFAULT);
        let (_, set) = cx.use_state(|| 3u32);
        let _ = cx.finish();
        set.set(3);
        assert!(!inbox.has_signals());
        set.set(4);
        assert!(inbox.has_signals());
    }

    #[test]
    fn effect_fires_only_when_deps_change() {
        let inbox = Arc::new(Inbox::default());
        let mut cx = context_for(&inbox, None, Lanes::DEFAULT);
        cx.use_effect(Some(crate::deps![1u32]), || Ok(None));
        let mount = cx.finish();
        assert!(mount.effects[0].has_effect(HookFlags::PASSIVE));
        assert!(mount.flags.contains(Flags::PASSIVE | Flags::PASSIVE_STATIC));

        let mut cx = context_for(&inbox, Some(mount.hooks), Lanes::DEFAULT);
        cx.use_effect(Some(crate::deps![1u32]), || Ok(None));
        let same = cx.finish();
        assert!(!same.effects[0].has_effect(HookFlags::PASSIVE));
        assert!(!same.flags.contains(Flags::PASSIVE));

        let mut cx = context_for(&inbox, Some(same.hooks), Lanes::DEFAULT);
        cx.use_effect(Some(crate::deps![2u32]), || Ok(None));
        assert!(cx.finish().effects[0].has_effect(HookFlags::PASSIVE));
    }

    #[test]
    fn changing_hook_order_is_an_error() {
        let inbox = Arc::new(Inbox::default());
        let mut cx = context_for(&inbox, None, Lanes::DEFAULT);
        let _ = cx.use_state(|| 0u8);
        let mount = cx.finish();

        let mut cx = context_for(&inbox, Some(mount.hooks), Lanes::DEFAULT);
        let _ = cx.use_ref(|| 0u8);
        assert!(cx.finish().error.is_some());
    }

    #[test]
    fn memo_and_ref_persist() {
        let inbox = Arc::new(Inbox::default());
        let mut cx = context_for(&inbox, None, Lanes::DEFAULT);
        let memo = cx.use_memo(crate::deps![1u8], || String::from("a"));
        let cell = cx.use_ref(|| 10u32);
        cell.set(11);
        let mount = cx.finish();
        assert_eq!(memo, "a");

        let mut cx = context_for(&inbox, Some(mount.hooks), Lanes::DEFAULT);
        let memo = cx.use_memo(crate::deps![1u8], || String::from("b"));
        let cell = cx.use_ref(|| 0u32);
        assert_eq!(memo, "a");
        assert_eq!(cell.get(), 11);
    }

    #[test]
    fn skipped_lanes_are_reported() {
        let inbox = Arc::new(Inbox::default());
        let mut cx = context_for(&inbox, None, Lanes::DEFAULT);
        let (_, set) = cx.use_state(|| 0u32);
        let mount = cx.finish();

        in_transition(&inbox, || set.set(7));
        let mut cx = context_for(&inbox, Some(mount.hooks), Lanes::SYNC);
        let (value, _) = cx.use_state(|| 0u32);
        assert_eq!(value, 0);
        assert_eq!(cx.finish().remaining_lanes, Lanes::TRANSITION_1);
    }

    #[test]
    fn store_notifies_subscribers_on_change() {
        use std::sync::atomic::AtomicUsize;

        let store = Store::new(1u32);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = store.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.set(1);
        store.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        store.unsubscribe(token);
        assert_eq!(store.subscriber_count(), 0);
    }
}
