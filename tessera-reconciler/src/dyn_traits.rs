//! Type-erased values with dynamic equality.
//!
//! ## Usage
//!
//! Component props, hook state, context values and effect dependencies are
//! stored as trait objects and compared with `dyn_eq` to decide whether work
//! can be skipped.

use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};
use smallvec::SmallVec;

macro_rules! define_dyn_partial_eq {
    ($(#[$meta:meta])* $trait_name:ident) => {
        $(#[$meta])*
        pub trait $trait_name: DowncastSync {
            /// Performs a dynamic equality check against another trait object.
            fn dyn_eq(&self, other: &dyn $trait_name) -> bool;
        }

        impl<T> $trait_name for T
        where
            T: PartialEq + Send + Sync + 'static,
        {
            fn dyn_eq(&self, other: &dyn $trait_name) -> bool {
                other
                    .downcast_ref::<T>()
                    .is_some_and(|other_concrete| self == other_concrete)
            }
        }

        impl_downcast!(sync $trait_name);
    };
}

define_dyn_partial_eq!(
    /// Props of a component element.
    PropsValue
);
define_dyn_partial_eq!(
    /// Hook state, context values and dependency entries.
    StateValue
);

/// A single effect or memo dependency.
pub type Dep = Arc<dyn StateValue>;

/// A dependency array. Compared element-wise with `dyn_eq`.
pub type Deps = SmallVec<[Dep; 4]>;

/// Shallow, element-wise comparison of two dependency arrays.
///
/// Arrays of different length never match.
pub fn deps_equal(prev: &[Dep], next: &[Dep]) -> bool {
    prev.len() == next.len()
        && prev
            .iter()
            .zip(next.iter())
            .all(|(a, b)| Arc::ptr_eq(a, b) || a.dyn_eq(b.as_ref()))
}

/// Builds a [`Deps`] array from a list of values.
///
/// # Examples
///
/// ```
/// use tessera_reconciler::{deps, deps_equal};
///
/// let a = deps![1u32, "name".to_string()];
/// let b = deps![1u32, "name".to_string()];
/// assert!(deps_equal(&a, &b));
/// ```
#[macro_export]
macro_rules! deps {
    () => {
        $crate::Deps::new()
    };
    ($($dep:expr),+ $(,)?) => {{
        let mut deps = $crate::Deps::new();
        $(
            deps.push(::std::sync::Arc::new($dep) as ::std::sync::Arc<dyn $crate::StateValue>);
        )+
        deps
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dyn_eq_requires_same_type() {
        let a: Arc<dyn StateValue> = Arc::new(1u32);
        let b: Arc<dyn StateValue> = Arc::new(1u32);
        let c: Arc<dyn StateValue> = Arc::new(1u64);
        assert!(a.dyn_eq(b.as_ref()));
        assert!(!a.dyn_eq(c.as_ref()));
    }

    #[test]
    fn deps_compare_shallowly() {
        assert!(deps_equal(&crate::deps![1, 2], &crate::deps![1, 2]));
        assert!(!deps_equal(&crate::deps![1, 2], &crate::deps![1, 3]));
        assert!(!deps_equal(&crate::deps![1], &crate::deps![1, 2]));
        assert!(deps_equal(&crate::deps![], &crate::deps![]));
    }

    #[test]
    fn props_downcast() {
        let props: Arc<dyn PropsValue> = Arc::new(String::from("x"));
        assert_eq!(props.downcast_ref::<String>().map(String::as_str), Some("x"));
    }
}
