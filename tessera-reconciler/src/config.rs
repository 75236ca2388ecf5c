//! Engine configuration.

use std::{fmt, sync::Arc};

use crate::{error::ErrorInfo, lane::Timestamp};

/// Tunables shared by every root of a [`crate::Reconciler`].
///
/// # Examples
///
/// ```
/// use tessera_reconciler::ReconcilerConfig;
///
/// let config = ReconcilerConfig {
///     nested_update_limit: 20,
///     ..Default::default()
/// };
/// assert_eq!(config.transition_lane_expiration_ms, 5000);
/// ```
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Number of back-to-back synchronous commits of the same root caused by
    /// layout effects before the engine fails with
    /// [`crate::ReconcilerError::MaximumUpdateDepth`].
    pub nested_update_limit: usize,
    /// Number of back-to-back commits caused by passive effects before a
    /// warning is logged.
    pub passive_nested_update_limit: usize,
    /// Time a synchronous, input or default lane may stay pending before it is
    /// forced to render without yielding.
    pub sync_lane_expiration_ms: Timestamp,
    /// Time a transition lane may stay pending before it expires.
    pub transition_lane_expiration_ms: Timestamp,
    /// Minimum time between two fallback commits driven only by retries.
    pub retry_throttle_ms: Timestamp,
    /// Synchronous re-render attempts after a render error before the error is
    /// captured by a boundary.
    pub max_error_retries: usize,
    /// Render-phase update loops allowed per component render.
    pub render_phase_update_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            nested_update_limit: 50,
            passive_nested_update_limit: 50,
            sync_lane_expiration_ms: 250,
            transition_lane_expiration_ms: 5000,
            retry_throttle_ms: 300,
            max_error_retries: 1,
            render_phase_update_limit: 25,
        }
    }
}

/// Callback invoked with an error and its component stack.
pub type ErrorCallback = Arc<dyn Fn(&ErrorInfo) + Send + Sync>;

/// Per-root options.
#[derive(Clone, Default)]
pub struct RootOptions {
    /// Prefix for identifiers generated under this root, used in logs.
    pub identifier_prefix: String,
    /// Called once per commit for every error that was recovered from.
    pub on_recoverable_error: Option<ErrorCallback>,
    /// Called when an error boundary captures an error.
    pub on_caught_error: Option<ErrorCallback>,
    /// Called when an error reaches the root; the tree is unmounted.
    pub on_uncaught_error: Option<ErrorCallback>,
}

impl fmt::Debug for RootOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootOptions")
            .field("identifier_prefix", &self.identifier_prefix)
            .field("on_recoverable_error", &self.on_recoverable_error.is_some())
            .field("on_caught_error", &self.on_caught_error.is_some())
            .field("on_uncaught_error", &self.on_uncaught_error.is_some())
            .finish()
    }
}
