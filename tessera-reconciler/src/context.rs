//! Context values shared with descendants.
//!
//! A provider element pushes a value for a [`Context`]; any component below it
//! reads the nearest value with [`crate::RenderContext::use_context`].
//! Providers form a stack of persistent maps, so pushing a layer is a cheap
//! structural update of the parent layer.

use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use im::HashMap;

use crate::dyn_traits::StateValue;

/// Identity of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Dependency recorded by components that read the root cache.
    pub(crate) const ROOT_CACHE: ContextId = ContextId(0);
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A typed context with a default value.
///
/// # Examples
///
/// ```
/// use tessera_reconciler::Context;
///
/// #[derive(Clone, PartialEq)]
/// struct Theme(&'static str);
///
/// let theme = Context::new(Theme("light"));
/// assert_eq!(theme.default_value().0, "light");
/// ```
pub struct Context<T> {
    id: ContextId,
    default: Arc<dyn StateValue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Context<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    /// Creates a context. Every call yields a distinct context.
    pub fn new(default: T) -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            default: Arc::new(default),
            _marker: PhantomData,
        }
    }

    /// The value read when no provider is above the consumer.
    pub fn default_value(&self) -> &T {
        match self.default.downcast_ref::<T>() {
            Some(value) => value,
            None => unreachable!("context default always holds T"),
        }
    }

    pub(crate) fn default_erased(&self) -> Arc<dyn StateValue> {
        self.default.clone()
    }
}

impl<T> Context<T> {
    /// The context identity.
    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            default: self.default.clone(),
            _marker: PhantomData,
        }
    }
}

/// One layer of provided values.
pub(crate) type ContextMap = HashMap<ContextId, Arc<dyn StateValue>>;

/// Provider stack maintained by the work loop.
#[derive(Default)]
pub(crate) struct ContextStack {
    layers: Vec<ContextMap>,
}

impl ContextStack {
    pub(crate) fn reset(&mut self) {
        self.layers.clear();
    }

    /// The values visible at the current depth.
    pub(crate) fn current(&self) -> ContextMap {
        self.layers.last().cloned().unwrap_or_default()
    }

    pub(crate) fn push(&mut self, context: ContextId, value: Arc<dyn StateValue>) {
        let next = self.current().update(context, value);
        self.layers.push(next);
    }

    pub(crate) fn pop(&mut self) {
        let popped = self.layers.pop();
        debug_assert!(popped.is_some(), "Context stack underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provided(stack: &ContextStack, context: ContextId) -> Option<u32> {
        stack
            .current()
            .get(&context)
            .and_then(|value| value.downcast_ref::<u32>())
            .copied()
    }

    #[test]
    fn nested_providers_shadow_and_restore() {
        let theme = Context::new(0u32);
        let mut stack = ContextStack::default();
        assert_eq!(provided(&stack, theme.id()), None);

        stack.push(theme.id(), Arc::new(1u32));
        stack.push(theme.id(), Arc::new(2u32));
        assert_eq!(provided(&stack, theme.id()), Some(2));

        stack.pop();
        assert_eq!(provided(&stack, theme.id()), Some(1));
        stack.pop();
        assert_eq!(provided(&stack, theme.id()), None);
    }

    #[test]
    fn contexts_are_distinct() {
        let a = Context::new(());
        let b = Context::new(());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
