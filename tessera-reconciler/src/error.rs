//! Error types for render, commit and scheduling failures.
//!
//! ## Usage
//!
//! Components fail a render by returning [`RenderSignal::Error`]; the engine
//! reports engine-level failures through [`ReconcilerError`].

use std::{fmt, sync::Arc};

use crate::wakeable::Wakeable;

/// An error value produced by user code during render or commit.
///
/// Cheap to clone; the same value can be reported to several callbacks.
#[derive(Clone)]
pub struct ThrownValue(Arc<dyn std::error::Error + Send + Sync>);

impl ThrownValue {
    /// Wraps any error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Builds an error value from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(MessageError(message.into())))
    }

    /// The wrapped error.
    pub fn error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }

    /// Whether both values wrap the same error allocation.
    pub fn ptr_eq(&self, other: &ThrownValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ThrownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThrownValue({})", self.0)
    }
}

impl fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<ReconcilerError> for ThrownValue {
    fn from(error: ReconcilerError) -> Self {
        ThrownValue::new(error)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}

/// Non-local exit from a component render.
#[derive(Clone, Debug)]
pub enum RenderSignal {
    /// The subtree is not ready; render again once the awaitable settles.
    Suspend(Wakeable),
    /// The render failed.
    Error(ThrownValue),
}

impl From<ThrownValue> for RenderSignal {
    fn from(value: ThrownValue) -> Self {
        RenderSignal::Error(value)
    }
}

/// An error together with the component stack it was raised in.
#[derive(Clone, Debug)]
pub struct ErrorInfo {
    /// The error value.
    pub value: ThrownValue,
    /// One `in Name` line per ancestor, innermost first.
    pub component_stack: String,
}

/// Failures raised by the engine itself.
#[derive(Debug, Clone)]
pub enum ReconcilerError {
    /// The root id does not refer to a live root.
    UnknownRoot,
    /// Too many synchronous updates were scheduled from commit-phase effects.
    MaximumUpdateDepth {
        /// Number of nested commits observed.
        count: usize,
    },
    /// A component scheduled updates during its own render too many times.
    TooManyRerenders {
        /// Name of the component.
        component: &'static str,
    },
    /// Hooks were called in a different order than on the previous render.
    HookOrder {
        /// Name of the component.
        component: &'static str,
        /// Slot at which the mismatch happened.
        index: usize,
    },
    /// A component received props of an unexpected type.
    PropsMismatch {
        /// Name of the component.
        component: &'static str,
    },
    /// A render error with no boundary to recover into.
    Uncaught(ErrorInfo),
}

impl fmt::Display for ReconcilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilerError::UnknownRoot => write!(f, "root is not mounted"),
            ReconcilerError::MaximumUpdateDepth { count } => write!(
                f,
                "maximum update depth exceeded after {count} nested updates; an effect keeps scheduling synchronous work"
            ),
            ReconcilerError::TooManyRerenders { component } => write!(
                f,
                "too many re-renders in `{component}`; render-phase updates must converge"
            ),
            ReconcilerError::HookOrder { component, index } => write!(
                f,
                "hook {index} in `{component}` changed kind between renders"
            ),
            ReconcilerError::PropsMismatch { component } => {
                write!(f, "`{component}` received props of an unexpected type")
            }
            ReconcilerError::Uncaught(info) => {
                write!(f, "uncaught error: {}{}", info.value, info.component_stack)
            }
        }
    }
}

impl std::error::Error for ReconcilerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thrown_value_identity() {
        let a = ThrownValue::msg("boom");
        let b = a.clone();
        let c = ThrownValue::msg("boom");
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.to_string(), "boom");
    }

    #[test]
    fn uncaught_display_includes_stack() {
        let error = ReconcilerError::Uncaught(ErrorInfo {
            value: ThrownValue::msg("bad"),
            component_stack: "\n    in Child".to_string(),
        });
        assert!(error.to_string().contains("in Child"));
    }
}
