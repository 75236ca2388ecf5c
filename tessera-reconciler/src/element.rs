//! Element descriptions of the desired tree.
//!
//! ## Usage
//!
//! Build an [`Element`] tree and hand it to
//! [`crate::Reconciler::render`]. Elements are immutable and cheap to clone;
//! the engine compares them by identity first and by value where it needs to.
//!
//! ```
//! use tessera_reconciler::{Element, HostProps, RenderContext, RenderResult};
//!
//! fn greeting(_cx: &mut RenderContext, name: &String) -> RenderResult {
//!     Ok(Element::host(
//!         "p",
//!         HostProps::new().with("class", "greeting"),
//!         vec![Element::text(format!("hello {name}"))],
//!     ))
//! }
//!
//! let tree = Element::host(
//!     "div",
//!     HostProps::new(),
//!     vec![Element::component(greeting, "world".to_string()).with_key("g")],
//! );
//! assert_eq!(tree.kind().name(), "div");
//! ```

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    config::ErrorCallback,
    context::{Context, ContextId},
    dyn_traits::{PropsValue, StateValue},
    error::{ErrorInfo, ReconcilerError, RenderSignal, ThrownValue},
    hooks::RenderContext,
    suspense::SuspenseHandle,
};

/// Explicit reconciliation key.
pub type Key = Arc<str>;

/// Result of a component render.
pub type RenderResult = Result<Element, RenderSignal>;

type RenderFn = dyn Fn(&mut RenderContext, &dyn PropsValue) -> RenderResult + Send + Sync;

/// Attribute map of a host element.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HostProps {
    attributes: im::OrdMap<String, String>,
}

impl HostProps {
    /// An empty attribute map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Reads an attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Iterates attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.attributes.iter()
    }

    /// Attributes that differ between `self` and `next`. Removed attributes map
    /// to `None`.
    pub fn diff(&self, next: &HostProps) -> Vec<(String, Option<String>)> {
        let mut changes = Vec::new();
        for (key, value) in self.attributes.iter() {
            match next.attributes.get(key) {
                Some(next_value) if next_value == value => {}
                Some(next_value) => changes.push((key.clone(), Some(next_value.clone()))),
                None => changes.push((key.clone(), None)),
            }
        }
        for (key, value) in next.attributes.iter() {
            if !self.attributes.contains_key(key) {
                changes.push((key.clone(), Some(value.clone())));
            }
        }
        changes
    }
}

impl fmt::Debug for HostProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.attributes.iter()).finish()
    }
}

/// Identity of a component function plus its type-erased entry point.
#[derive(Clone)]
pub struct ComponentType {
    id: TypeId,
    name: &'static str,
    render: Arc<RenderFn>,
}

impl ComponentType {
    fn new<F, P>(render: F) -> Self
    where
        F: Fn(&mut RenderContext, &P) -> RenderResult + Send + Sync + 'static,
        P: PropsValue,
    {
        let full = std::any::type_name::<F>();
        let name = short_type_name(full);
        let render: Arc<RenderFn> = Arc::new(
            move |cx: &mut RenderContext, props: &dyn PropsValue| match props.downcast_ref::<P>() {
                Some(props) => render(cx, props),
                None => Err(RenderSignal::Error(ThrownValue::from(
                    ReconcilerError::PropsMismatch { component: name },
                ))),
            },
        );
        Self {
            id: TypeId::of::<F>(),
            name,
            render,
        }
    }

    /// Display name used in component stacks.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn call(&self, cx: &mut RenderContext, props: &dyn PropsValue) -> RenderResult {
        (self.render)(cx, props)
    }
}

impl PartialEq for ComponentType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentType({})", self.name)
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let trimmed = full.trim_end_matches("::{{closure}}");
    match trimmed.rfind("::") {
        Some(index) => &trimmed[index + 2..],
        None => trimmed,
    }
}

/// Handle that receives the host instance of an element after commit.
#[derive(Clone, Default)]
pub struct NodeRef(Arc<Mutex<Option<Arc<dyn Any + Send + Sync>>>>);

impl NodeRef {
    /// An unattached ref.
    pub fn new() -> Self {
        Self::default()
    }

    /// The attached instance, if it has type `I`.
    pub fn get<I: Clone + 'static>(&self) -> Option<I> {
        self.0
            .lock()
            .as_ref()
            .and_then(|value| value.downcast_ref::<I>().cloned())
    }

    /// Whether an instance is attached.
    pub fn is_attached(&self) -> bool {
        self.0.lock().is_some()
    }

    pub(crate) fn attach(&self, instance: Arc<dyn Any + Send + Sync>) {
        *self.0.lock() = Some(instance);
    }

    pub(crate) fn detach(&self) {
        *self.0.lock() = None;
    }

    pub(crate) fn ptr_eq(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef(attached: {})", self.is_attached())
    }
}

/// Fallback renderer of an error boundary.
pub type ErrorFallback = Arc<dyn Fn(&ErrorInfo) -> Element + Send + Sync>;

/// The payload of an element, one variant per node kind.
#[derive(Clone)]
pub enum ElementKind {
    /// A host element with attributes and children.
    Host {
        /// Element tag.
        tag: Arc<str>,
        /// Attributes.
        props: HostProps,
        /// Children.
        children: Vec<Element>,
        /// Ref attached after commit.
        node_ref: Option<NodeRef>,
    },
    /// A text node.
    Text(Arc<str>),
    /// A function component.
    Component {
        /// Component identity.
        ty: ComponentType,
        /// Type-erased props.
        props: Arc<dyn PropsValue>,
    },
    /// A list of children without a host node of its own.
    Fragment(Vec<Element>),
    /// A suspense boundary.
    Suspense {
        /// Primary content.
        children: Vec<Element>,
        /// Shown while the primary content is suspended.
        fallback: Vec<Element>,
        /// Optional imperative handle.
        handle: Option<SuspenseHandle>,
    },
    /// An error boundary.
    ErrorBoundary {
        /// Primary content.
        children: Vec<Element>,
        /// Renders the fallback for a captured error.
        fallback: ErrorFallback,
        /// Called in the layout pass after an error was captured.
        on_error: Option<ErrorCallback>,
    },
    /// A context provider.
    Provider {
        /// Context being provided.
        context: ContextId,
        /// Provided value.
        value: Arc<dyn StateValue>,
        /// Children that can read the value.
        children: Vec<Element>,
    },
    /// Internal wrapper around the primary content of a suspense boundary.
    #[doc(hidden)]
    Offscreen {
        /// Visibility.
        #[doc(hidden)]
        hidden: bool,
        /// Children.
        children: Vec<Element>,
    },
}

impl ElementKind {
    /// Short name of the element kind, used in logs and component stacks.
    pub fn name(&self) -> &str {
        match self {
            ElementKind::Host { tag, .. } => tag,
            ElementKind::Text(_) => "#text",
            ElementKind::Component { ty, .. } => ty.name(),
            ElementKind::Fragment(_) => "Fragment",
            ElementKind::Suspense { .. } => "Suspense",
            ElementKind::ErrorBoundary { .. } => "ErrorBoundary",
            ElementKind::Provider { .. } => "Provider",
            ElementKind::Offscreen { .. } => "Offscreen",
        }
    }
}

#[derive(Clone)]
struct ElementData {
    key: Option<Key>,
    kind: ElementKind,
}

/// An immutable node description.
#[derive(Clone)]
pub struct Element(Arc<ElementData>);

impl Element {
    fn from_kind(kind: ElementKind) -> Self {
        Element(Arc::new(ElementData { key: None, kind }))
    }

    /// A host element.
    pub fn host(tag: impl Into<Arc<str>>, props: HostProps, children: Vec<Element>) -> Self {
        Self::from_kind(ElementKind::Host {
            tag: tag.into(),
            props,
            children,
            node_ref: None,
        })
    }

    /// A text node.
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Self::from_kind(ElementKind::Text(text.into()))
    }

    /// A function component. Each distinct function or closure is a distinct
    /// component type.
    pub fn component<F, P>(render: F, props: P) -> Self
    where
        F: Fn(&mut RenderContext, &P) -> RenderResult + Send + Sync + 'static,
        P: PropsValue,
    {
        Self::from_kind(ElementKind::Component {
            ty: ComponentType::new(render),
            props: Arc::new(props),
        })
    }

    /// A list of children.
    pub fn fragment(children: Vec<Element>) -> Self {
        Self::from_kind(ElementKind::Fragment(children))
    }

    /// Renders nothing.
    pub fn empty() -> Self {
        Self::fragment(Vec::new())
    }

    /// A suspense boundary.
    pub fn suspense(fallback: Vec<Element>, children: Vec<Element>) -> Self {
        Self::from_kind(ElementKind::Suspense {
            children,
            fallback,
            handle: None,
        })
    }

    /// An error boundary.
    pub fn error_boundary<F>(fallback: F, children: Vec<Element>) -> Self
    where
        F: Fn(&ErrorInfo) -> Element + Send + Sync + 'static,
    {
        Self::from_kind(ElementKind::ErrorBoundary {
            children,
            fallback: Arc::new(fallback),
            on_error: None,
        })
    }

    /// A context provider.
    pub fn provider<T>(context: &Context<T>, value: T, children: Vec<Element>) -> Self
    where
        T: PartialEq + Send + Sync + 'static,
    {
        Self::from_kind(ElementKind::Provider {
            context: context.id(),
            value: Arc::new(value),
            children,
        })
    }

    pub(crate) fn offscreen(hidden: bool, children: Vec<Element>) -> Self {
        Self::from_kind(ElementKind::Offscreen { hidden, children })
    }

    /// Sets the reconciliation key.
    pub fn with_key(self, key: impl Into<Key>) -> Self {
        let mut data = Arc::unwrap_or_clone(self.0);
        data.key = Some(key.into());
        Element(Arc::new(data))
    }

    /// Attaches a ref to a host element. Ignored for other kinds.
    pub fn with_ref(self, node_ref: NodeRef) -> Self {
        let mut data = Arc::unwrap_or_clone(self.0);
        if let ElementKind::Host { node_ref: slot, .. } = &mut data.kind {
            *slot = Some(node_ref);
        }
        Element(Arc::new(data))
    }

    /// Attaches an imperative handle to a suspense boundary. Ignored for other
    /// kinds.
    pub fn with_suspense_handle(self, handle: SuspenseHandle) -> Self {
        let mut data = Arc::unwrap_or_clone(self.0);
        if let ElementKind::Suspense { handle: slot, .. } = &mut data.kind {
            *slot = Some(handle);
        }
        Element(Arc::new(data))
    }

    /// Sets the callback an error boundary invokes after capturing an error.
    /// Ignored for other kinds.
    pub fn with_error_callback(self, callback: ErrorCallback) -> Self {
        let mut data = Arc::unwrap_or_clone(self.0);
        if let ElementKind::ErrorBoundary { on_error, .. } = &mut data.kind {
            *on_error = Some(callback);
        }
        Element(Arc::new(data))
    }

    /// The reconciliation key.
    pub fn key(&self) -> Option<&Key> {
        self.0.key.as_ref()
    }

    /// The payload.
    pub fn kind(&self) -> &ElementKind {
        &self.0.kind
    }

    /// Whether both handles point at the same element.
    pub fn ptr_eq(&self, other: &Element) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this is an unkeyed fragment whose children should be reconciled
    /// in place of the fragment.
    pub(crate) fn as_unkeyed_fragment(&self) -> Option<&[Element]> {
        match (&self.0.key, &self.0.kind) {
            (None, ElementKind::Fragment(children)) => Some(children),
            _ => None,
        }
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Element");
        debug.field("kind", &self.kind().name());
        if let Some(key) = self.key() {
            debug.field("key", key);
        }
        debug.finish()
    }
}

impl From<&str> for Element {
    fn from(text: &str) -> Self {
        Element::text(text)
    }
}

impl From<String> for Element {
    fn from(text: String) -> Self {
        Element::text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(_cx: &mut RenderContext, _props: &u32) -> RenderResult {
        Ok(Element::empty())
    }

    fn other(_cx: &mut RenderContext, _props: &u32) -> RenderResult {
        Ok(Element::empty())
    }

    #[test]
    fn component_identity_follows_function() {
        let a = Element::component(leaf, 1);
        let b = Element::component(leaf, 2);
        let c = Element::component(other, 1);
        let (ElementKind::Component { ty: ta, .. }, ElementKind::Component { ty: tb, .. }) =
            (a.kind(), b.kind())
        else {
            panic!("expected components");
        };
        assert_eq!(ta, tb);
        let ElementKind::Component { ty: tc, .. } = c.kind() else {
            panic!("expected component");
        };
        assert_ne!(ta, tc);
        assert_eq!(ta.name(), "leaf");
    }

    #[test]
    fn with_key_keeps_payload() {
        let element = Element::text("a").with_key("k");
        assert_eq!(element.key().map(|k| &**k), Some("k"));
        assert!(matches!(element.kind(), ElementKind::Text(t) if &**t == "a"));
    }

    #[test]
    fn host_props_diff() {
        let old = HostProps::new().with("a", "1").with("b", "2");
        let new = HostProps::new().with("a", "1").with("b", "3").with("c", "4");
        let mut diff = old.diff(&new);
        diff.sort();
        assert_eq!(
            diff,
            vec![
                ("b".to_string(), Some("3".to_string())),
                ("c".to_string(), Some("4".to_string())),
            ]
        );
        assert_eq!(
            new.diff(&HostProps::new().with("a", "1")),
            vec![("b".to_string(), None), ("c".to_string(), None)]
        );
    }

    #[test]
    fn node_ref_downcasts() {
        let node_ref = NodeRef::new();
        assert!(!node_ref.is_attached());
        node_ref.attach(Arc::new(7u32));
        assert_eq!(node_ref.get::<u32>(), Some(7));
        assert_eq!(node_ref.get::<u64>(), None);
        node_ref.detach();
        assert!(!node_ref.is_attached());
    }
}
