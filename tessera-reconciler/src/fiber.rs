//! The double-buffered node graph.
//!
//! Every tree position is represented by up to two [`Fiber`] records, the
//! committed one and the work-in-progress one, linked through `alternate`.
//! Records live in a slotmap arena and refer to each other by [`FiberId`], so
//! the graph has no owning cycles. A record's alternate is created once and
//! then reused on every later render until the position is deleted.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use rustc_hash::FxHashSet as HashSet;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use crate::{
    cache::Cache,
    context::ContextId,
    element::{ComponentType, Element, ElementKind, Key},
    error::ErrorInfo,
    hooks::{Effect, Hook, StoreCheck},
    lane::{Lane, Lanes},
    root::RootId,
    suspense::SuspenseHandle,
    update_queue::UpdateQueue,
    wakeable::Wakeable,
};

new_key_type! {
    /// Stable index of a fiber record in the arena.
    pub struct FiberId;
}

bitflags! {
    /// Effect flags of a fiber.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub(crate) struct Flags: u32 {
        const PERFORMED_WORK = 1 << 0;
        const PLACEMENT = 1 << 1;
        const UPDATE = 1 << 2;
        const CHILD_DELETION = 1 << 4;
        const CALLBACK = 1 << 6;
        const DID_CAPTURE = 1 << 7;
        const REF = 1 << 9;
        const SNAPSHOT = 1 << 10;
        const PASSIVE = 1 << 11;
        const VISIBILITY = 1 << 13;
        const STORE_CONSISTENCY = 1 << 14;
        const INCOMPLETE = 1 << 15;
        const SHOULD_CAPTURE = 1 << 16;
        const FORCE_CLIENT_RENDER = 1 << 17;

        // Static flags survive every clone of the record.
        const LAYOUT_STATIC = 1 << 21;
        const PASSIVE_STATIC = 1 << 22;
        const REF_STATIC = 1 << 23;
    }
}

impl Flags {
    pub(crate) const BEFORE_MUTATION_MASK: Flags =
        Flags::SNAPSHOT.union(Flags::CHILD_DELETION).union(Flags::VISIBILITY);
    pub(crate) const MUTATION_MASK: Flags = Flags::PLACEMENT
        .union(Flags::UPDATE)
        .union(Flags::CHILD_DELETION)
        .union(Flags::REF)
        .union(Flags::VISIBILITY);
    pub(crate) const LAYOUT_MASK: Flags = Flags::UPDATE
        .union(Flags::CALLBACK)
        .union(Flags::REF)
        .union(Flags::VISIBILITY);
    pub(crate) const PASSIVE_MASK: Flags = Flags::PASSIVE
        .union(Flags::VISIBILITY)
        .union(Flags::CHILD_DELETION);
    pub(crate) const STATIC_MASK: Flags = Flags::LAYOUT_STATIC
        .union(Flags::PASSIVE_STATIC)
        .union(Flags::REF_STATIC);
    /// Everything except the unwinding markers.
    pub(crate) const HOST_EFFECT_MASK: Flags = Flags::all()
        .difference(Flags::INCOMPLETE)
        .difference(Flags::SHOULD_CAPTURE);
}

bitflags! {
    /// Tags of a hook effect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub(crate) struct HookFlags: u8 {
        /// The effect must fire in this commit.
        const HAS_EFFECT = 1 << 0;
        const LAYOUT = 1 << 2;
        const PASSIVE = 1 << 3;
    }
}

/// Node kind plus the payload that identifies reusable records.
#[derive(Debug, Clone)]
pub(crate) enum FiberKind {
    HostRoot,
    HostComponent { tag: Arc<str> },
    HostText,
    FunctionComponent { ty: ComponentType },
    Fragment,
    Suspense,
    Offscreen,
    ErrorBoundary,
    ContextProvider { context: ContextId },
}

impl FiberKind {
    pub(crate) fn from_element(element: &Element) -> Self {
        match element.kind() {
            ElementKind::Host { tag, .. } => FiberKind::HostComponent { tag: tag.clone() },
            ElementKind::Text(_) => FiberKind::HostText,
            ElementKind::Component { ty, .. } => FiberKind::FunctionComponent { ty: ty.clone() },
            ElementKind::Fragment(_) => FiberKind::Fragment,
            ElementKind::Suspense { .. } => FiberKind::Suspense,
            ElementKind::ErrorBoundary { .. } => FiberKind::ErrorBoundary,
            ElementKind::Provider { context, .. } => FiberKind::ContextProvider { context: *context },
            ElementKind::Offscreen { .. } => FiberKind::Offscreen,
        }
    }

    /// Whether a record of this kind can be reused for `element`.
    pub(crate) fn matches(&self, element: &Element) -> bool {
        match (self, element.kind()) {
            (FiberKind::HostComponent { tag }, ElementKind::Host { tag: next, .. }) => tag == next,
            (FiberKind::HostText, ElementKind::Text(_)) => true,
            (FiberKind::FunctionComponent { ty }, ElementKind::Component { ty: next, .. }) => {
                ty == next
            }
            (FiberKind::Fragment, ElementKind::Fragment(_)) => true,
            (FiberKind::Suspense, ElementKind::Suspense { .. }) => true,
            (FiberKind::ErrorBoundary, ElementKind::ErrorBoundary { .. }) => true,
            (
                FiberKind::ContextProvider { context },
                ElementKind::Provider { context: next, .. },
            ) => context == next,
            (FiberKind::Offscreen, ElementKind::Offscreen { .. }) => true,
            _ => false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            FiberKind::HostRoot => "Root",
            FiberKind::HostComponent { tag } => tag,
            FiberKind::HostText => "#text",
            FiberKind::FunctionComponent { ty } => ty.name(),
            FiberKind::Fragment => "Fragment",
            FiberKind::Suspense => "Suspense",
            FiberKind::Offscreen => "Offscreen",
            FiberKind::ErrorBoundary => "ErrorBoundary",
            FiberKind::ContextProvider { .. } => "Provider",
        }
    }

    /// Whether the kind owns a host instance.
    pub(crate) fn is_host(&self) -> bool {
        matches!(self, FiberKind::HostComponent { .. } | FiberKind::HostText)
    }
}

/// Memoized state of the host root.
#[derive(Clone)]
pub(crate) struct RootState {
    pub(crate) element: Option<Element>,
    pub(crate) cache: Cache,
}

/// Actions accepted by the root update queue.
#[derive(Clone)]
pub(crate) enum RootAction {
    Render(Option<Element>),
    /// An error reached the root; the tree is torn down.
    Uncaught,
    RefreshCache(Cache),
}

impl RootAction {
    pub(crate) fn reduce(state: &RootState, action: &RootAction) -> RootState {
        match action {
            RootAction::Render(element) => RootState {
                element: element.clone(),
                cache: state.cache.clone(),
            },
            RootAction::Uncaught => RootState {
                element: None,
                cache: state.cache.clone(),
            },
            RootAction::RefreshCache(cache) => RootState {
                element: state.element.clone(),
                cache: cache.clone(),
            },
        }
    }
}

/// Memoized state of an error boundary.
#[derive(Clone, Default)]
pub(crate) struct BoundaryState {
    pub(crate) error: Option<ErrorInfo>,
}

/// Actions accepted by an error boundary queue.
#[derive(Clone)]
pub(crate) enum BoundaryAction {
    Capture(ErrorInfo),
}

impl BoundaryAction {
    pub(crate) fn reduce(_state: &BoundaryState, action: &BoundaryAction) -> BoundaryState {
        match action {
            BoundaryAction::Capture(info) => BoundaryState {
                error: Some(info.clone()),
            },
        }
    }
}

/// Present on a suspense boundary while it shows its fallback.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuspenseState {
    /// Lane the boundary's primary content is retried on once a wakeable
    /// it waits for settles.
    pub(crate) retry_lane: Lane,
}

/// Present on an offscreen fiber while it is hidden.
#[derive(Debug, Clone)]
pub(crate) struct OffscreenState {
    /// Lanes that were deferred while hidden and are merged back in on reveal.
    pub(crate) base_lanes: Lanes,
    pub(crate) cache: Option<Cache>,
}

#[derive(Clone, Default)]
pub(crate) enum FiberState {
    #[default]
    None,
    Root(RootState),
    Hooks(Vec<Hook>),
    Suspense(SuspenseState),
    Offscreen(OffscreenState),
    ErrorBoundary(BoundaryState),
}

/// Effects and consistency checks collected by the last render of a
/// function component.
#[derive(Clone, Default)]
pub(crate) struct FunctionQueue {
    pub(crate) effects: Vec<Effect>,
    pub(crate) stores: Vec<StoreCheck>,
}

#[derive(Clone, Default)]
pub(crate) enum FiberQueue {
    #[default]
    None,
    Root(UpdateQueue<RootAction, RootState>),
    Boundary(UpdateQueue<BoundaryAction, BoundaryState>),
    Function(FunctionQueue),
    /// Wakeables a suspense boundary retries on.
    Retry(Vec<Wakeable>),
}

/// Shared instance of a suspense boundary, identical for both records.
#[derive(Default)]
pub(crate) struct SuspenseInstance {
    /// Wakeables that already have a retry listener.
    pub(crate) retry_cache: HashSet<u64>,
    /// Effects of the primary subtree are disconnected.
    pub(crate) detached: bool,
    pub(crate) handle: Option<SuspenseHandle>,
}

pub(crate) enum StateNode<I> {
    None,
    Host(I),
    Root(RootId),
    Suspense(Arc<Mutex<SuspenseInstance>>),
}

impl<I: Clone> Clone for StateNode<I> {
    fn clone(&self) -> Self {
        match self {
            StateNode::None => StateNode::None,
            StateNode::Host(instance) => StateNode::Host(instance.clone()),
            StateNode::Root(root) => StateNode::Root(*root),
            StateNode::Suspense(instance) => StateNode::Suspense(instance.clone()),
        }
    }
}

impl<I> StateNode<I> {
    pub(crate) fn host(&self) -> Option<&I> {
        match self {
            StateNode::Host(instance) => Some(instance),
            _ => None,
        }
    }
}

/// One node record.
pub(crate) struct Fiber<I> {
    pub(crate) kind: FiberKind,
    pub(crate) key: Option<Key>,
    pub(crate) state_node: StateNode<I>,

    pub(crate) parent: Option<FiberId>,
    pub(crate) child: Option<FiberId>,
    pub(crate) sibling: Option<FiberId>,
    pub(crate) index: usize,

    pub(crate) pending_props: Option<Element>,
    pub(crate) memoized_props: Option<Element>,
    pub(crate) memoized_state: FiberState,
    pub(crate) update_queue: FiberQueue,
    /// Contexts read by the last render.
    pub(crate) dependencies: SmallVec<[ContextId; 2]>,

    pub(crate) flags: Flags,
    pub(crate) subtree_flags: Flags,
    pub(crate) deletions: SmallVec<[FiberId; 2]>,

    pub(crate) lanes: Lanes,
    pub(crate) child_lanes: Lanes,

    pub(crate) alternate: Option<FiberId>,
}

impl<I> Fiber<I> {
    pub(crate) fn new(kind: FiberKind, key: Option<Key>, pending_props: Option<Element>) -> Self {
        Self {
            kind,
            key,
            state_node: StateNode::None,
            parent: None,
            child: None,
            sibling: None,
            index: 0,
            pending_props,
            memoized_props: None,
            memoized_state: FiberState::None,
            update_queue: FiberQueue::None,
            dependencies: SmallVec::new(),
            flags: Flags::empty(),
            subtree_flags: Flags::empty(),
            deletions: SmallVec::new(),
            lanes: Lanes::NONE,
            child_lanes: Lanes::NONE,
            alternate: None,
        }
    }

    pub(crate) fn is_hidden_offscreen(&self) -> bool {
        matches!(self.kind, FiberKind::Offscreen)
            && matches!(self.memoized_state, FiberState::Offscreen(_))
    }

    pub(crate) fn is_showing_fallback(&self) -> bool {
        matches!(self.memoized_state, FiberState::Suspense(_))
    }

    /// Retry lane owed to a boundary showing its fallback.
    pub(crate) fn retry_lane(&self) -> Option<Lane> {
        match self.memoized_state {
            FiberState::Suspense(state) if !state.retry_lane.is_empty() => Some(state.retry_lane),
            _ => None,
        }
    }

    pub(crate) fn suspense_instance(&self) -> Option<&Arc<Mutex<SuspenseInstance>>> {
        match &self.state_node {
            StateNode::Suspense(instance) => Some(instance),
            _ => None,
        }
    }
}

/// Arena owning every fiber record.
pub(crate) struct FiberArena<I> {
    fibers: SlotMap<FiberId, Fiber<I>>,
}

impl<I> Default for FiberArena<I> {
    fn default() -> Self {
        Self {
            fibers: SlotMap::with_key(),
        }
    }
}

impl<I> std::ops::Index<FiberId> for FiberArena<I> {
    type Output = Fiber<I>;

    fn index(&self, id: FiberId) -> &Fiber<I> {
        &self.fibers[id]
    }
}

impl<I> std::ops::IndexMut<FiberId> for FiberArena<I> {
    fn index_mut(&mut self, id: FiberId) -> &mut Fiber<I> {
        &mut self.fibers[id]
    }
}

impl<I: Clone> FiberArena<I> {
    pub(crate) fn insert(&mut self, fiber: Fiber<I>) -> FiberId {
        self.fibers.insert(fiber)
    }

    pub(crate) fn get(&self, id: FiberId) -> Option<&Fiber<I>> {
        self.fibers.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: FiberId) -> Option<&mut Fiber<I>> {
        self.fibers.get_mut(id)
    }

    pub(crate) fn contains(&self, id: FiberId) -> bool {
        self.fibers.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.fibers.len()
    }

    /// Frees a record and unlinks its alternate.
    pub(crate) fn remove(&mut self, id: FiberId) -> Option<Fiber<I>> {
        let fiber = self.fibers.remove(id)?;
        if let Some(alternate) = fiber.alternate
            && let Some(other) = self.fibers.get_mut(alternate)
            && other.alternate == Some(id)
        {
            other.alternate = None;
        }
        Some(fiber)
    }

    /// Creates a fresh record for `element`.
    pub(crate) fn create_from_element(&mut self, element: &Element, lanes: Lanes) -> FiberId {
        let mut fiber = Fiber::new(
            FiberKind::from_element(element),
            element.key().cloned(),
            Some(element.clone()),
        );
        fiber.lanes = lanes;
        if matches!(fiber.kind, FiberKind::Suspense) {
            fiber.state_node = StateNode::Suspense(Arc::new(Mutex::new(SuspenseInstance::default())));
        }
        self.fibers.insert(fiber)
    }

    /// Returns the work-in-progress record for `current`, reusing its
    /// alternate when one exists.
    pub(crate) fn create_work_in_progress(
        &mut self,
        current: FiberId,
        pending_props: Option<Element>,
    ) -> FiberId {
        let source = &self.fibers[current];
        let existing = source.alternate.filter(|id| self.fibers.contains_key(*id));

        let kind = source.kind.clone();
        let key = source.key.clone();
        let state_node = source.state_node.clone();
        let static_flags = source.flags & Flags::STATIC_MASK;
        let child_lanes = source.child_lanes;
        let lanes = source.lanes;
        let child = source.child;
        let memoized_props = source.memoized_props.clone();
        let memoized_state = source.memoized_state.clone();
        let update_queue = source.update_queue.clone();
        let dependencies = source.dependencies.clone();
        let sibling = source.sibling;
        let index = source.index;
        let parent = source.parent;

        let wip = match existing {
            Some(id) => {
                let fiber = &mut self.fibers[id];
                fiber.pending_props = pending_props;
                fiber.kind = kind;
                fiber.flags = Flags::empty();
                fiber.subtree_flags = Flags::empty();
                fiber.deletions.clear();
                id
            }
            None => {
                let mut fiber = Fiber::new(kind, key.clone(), pending_props);
                fiber.state_node = state_node.clone();
                fiber.alternate = Some(current);
                let id = self.fibers.insert(fiber);
                self.fibers[current].alternate = Some(id);
                id
            }
        };

        let fiber = &mut self.fibers[wip];
        fiber.key = key;
        fiber.state_node = state_node;
        fiber.flags |= static_flags;
        fiber.child_lanes = child_lanes;
        fiber.lanes = lanes;
        fiber.child = child;
        fiber.memoized_props = memoized_props;
        fiber.memoized_state = memoized_state;
        fiber.update_queue = update_queue;
        fiber.dependencies = dependencies;
        fiber.sibling = sibling;
        fiber.index = index;
        fiber.parent = parent;
        wip
    }

    /// Resets a work-in-progress record to the committed values of its
    /// alternate so it can be rendered again from scratch.
    pub(crate) fn reset_work_in_progress(&mut self, wip: FiberId, render_lanes: Lanes) {
        let static_flags = self.fibers[wip].flags & (Flags::STATIC_MASK | Flags::PLACEMENT);
        let current = self.fibers[wip].alternate.filter(|id| self.fibers.contains_key(*id));
        let Some(current) = current else {
            let fiber = &mut self.fibers[wip];
            fiber.flags = static_flags;
            fiber.child_lanes = Lanes::NONE;
            fiber.lanes = render_lanes;
            fiber.child = None;
            fiber.subtree_flags = Flags::empty();
            fiber.memoized_props = None;
            fiber.memoized_state = FiberState::None;
            fiber.update_queue = FiberQueue::None;
            fiber.dependencies.clear();
            return;
        };
        let source = &self.fibers[current];
        let child_lanes = source.child_lanes;
        let lanes = source.lanes;
        let child = source.child;
        let memoized_props = source.memoized_props.clone();
        let memoized_state = source.memoized_state.clone();
        let update_queue = source.update_queue.clone();
        let dependencies = source.dependencies.clone();

        let fiber = &mut self.fibers[wip];
        fiber.flags = static_flags;
        fiber.subtree_flags = Flags::empty();
        fiber.deletions.clear();
        fiber.child_lanes = child_lanes;
        fiber.lanes = lanes;
        fiber.child = child;
        fiber.memoized_props = memoized_props;
        fiber.memoized_state = memoized_state;
        fiber.update_queue = update_queue;
        fiber.dependencies = dependencies;
    }

    /// Child records of `id` in sibling order.
    pub(crate) fn children(&self, id: FiberId) -> Vec<FiberId> {
        let mut children = Vec::new();
        let mut next = self.fibers.get(id).and_then(|fiber| fiber.child);
        while let Some(child) = next {
            children.push(child);
            next = self.fibers.get(child).and_then(|fiber| fiber.sibling);
        }
        children
    }

    /// Every record of the subtree rooted at `id`, parents before children.
    pub(crate) fn subtree(&self, id: FiberId) -> Vec<FiberId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            let mut children = self.children(next);
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Walks up from `id` to its host root record.
    pub(crate) fn host_root_of(&self, id: FiberId) -> Option<FiberId> {
        let mut node = id;
        loop {
            let fiber = self.fibers.get(node)?;
            match fiber.parent {
                Some(parent) => node = parent,
                None => return matches!(fiber.kind, FiberKind::HostRoot).then_some(node),
            }
        }
    }

    /// Component stack rendered the way error reports print it.
    pub(crate) fn component_stack(&self, id: FiberId) -> String {
        let mut stack = String::new();
        let mut next = Some(id);
        while let Some(node) = next {
            let Some(fiber) = self.fibers.get(node) else {
                break;
            };
            if !matches!(
                fiber.kind,
                FiberKind::HostRoot | FiberKind::Offscreen | FiberKind::HostText
            ) {
                stack.push_str("\n    in ");
                stack.push_str(fiber.kind.name());
            }
            next = fiber.parent;
        }
        stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::HostProps;

    #[test]
    fn alternates_are_symmetric_and_reused() {
        let mut arena: FiberArena<u32> = FiberArena::default();
        let element = Element::host("div", HostProps::new(), Vec::new());
        let current = arena.create_from_element(&element, Lanes::NONE);
        let wip = arena.create_work_in_progress(current, Some(element.clone()));
        assert_eq!(arena[current].alternate, Some(wip));
        assert_eq!(arena[wip].alternate, Some(current));

        arena[wip].flags |= Flags::UPDATE | Flags::PASSIVE_STATIC;
        let again = arena.create_work_in_progress(current, Some(element));
        assert_eq!(again, wip);
        assert_eq!(arena.len(), 2);

        // The reused record drops effect flags but keeps static ones of its source.
        arena[current].flags = Flags::REF_STATIC;
        let third = arena.create_work_in_progress(current, None);
        assert_eq!(arena[third].flags, Flags::REF_STATIC);
    }

    #[test]
    fn remove_unlinks_alternate() {
        let mut arena: FiberArena<u32> = FiberArena::default();
        let element = Element::text("a");
        let current = arena.create_from_element(&element, Lanes::NONE);
        let wip = arena.create_work_in_progress(current, Some(element));
        assert!(arena.remove(wip).is_some());
        assert_eq!(arena[current].alternate, None);
    }

    #[test]
    fn kind_matching() {
        let div = Element::host("div", HostProps::new(), Vec::new());
        let span = Element::host("span", HostProps::new(), Vec::new());
        let kind = FiberKind::from_element(&div);
        assert!(kind.matches(&div));
        assert!(!kind.matches(&span));
        assert!(!kind.matches(&Element::text("div")));
        assert!(FiberKind::HostText.is_host());
    }

    #[test]
    fn subtree_is_preorder() {
        let mut arena: FiberArena<u32> = FiberArena::default();
        let parent = arena.create_from_element(&Element::fragment(Vec::new()), Lanes::NONE);
        let a = arena.create_from_element(&Element::text("a"), Lanes::NONE);
        let b = arena.create_from_element(&Element::text("b"), Lanes::NONE);
        arena[parent].child = Some(a);
        arena[a].sibling = Some(b);
        arena[a].parent = Some(parent);
        arena[b].parent = Some(parent);
        assert_eq!(arena.subtree(parent), vec![parent, a, b]);
        assert_eq!(arena.children(parent), vec![a, b]);
    }

    #[test]
    fn masks_cover_expected_flags() {
        assert!(Flags::MUTATION_MASK.contains(Flags::PLACEMENT));
        assert!(!Flags::HOST_EFFECT_MASK.contains(Flags::INCOMPLETE));
        assert!(Flags::HOST_EFFECT_MASK.contains(Flags::DID_CAPTURE));
        assert!(Flags::PASSIVE_MASK.contains(Flags::CHILD_DELETION));
    }
}
