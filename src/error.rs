//! Error types used by loaders and the orchestration runtime.
//!
//! - [`LoaderError`] failures folded into a loader's state history.
//!
//! Admission failures and cancellations are *outcomes*, not errors: they show
//! up in [`Admission`](crate::Admission) and the state history instead.
//! The type provides `as_label`/`as_message` helpers for logging and events.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// # Errors produced while a loader runs.
///
/// None of these ever escapes a loader's public entry points. They are handed
/// to the loader's error hook, logged, published as events and recorded in the
/// state history.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// Dependencies or readiness conditions were still pending when the
    /// effective timeout expired.
    #[error("dependencies not ready after {timeout:?}; pending: {pending:?}")]
    DependencyTimeout {
        /// Effective (cascaded) timeout that was exceeded.
        timeout: Duration,
        /// Human-readable names of the conditions still pending.
        pending: Vec<String>,
    },

    /// A declared URL reported a failed load.
    #[error("failed to load url {url}")]
    UrlFailed {
        /// The URL that failed.
        url: String,
    },

    /// URL loading did not complete within the remaining timeout.
    #[error("url {url} did not load within {timeout:?}")]
    UrlTimeout {
        /// The URL still loading.
        url: String,
        /// Remaining budget that was exceeded.
        timeout: Duration,
    },

    /// The payload returned an error or panicked.
    #[error("payload failed: {error}")]
    Execution {
        /// The underlying error message.
        error: String,
    },

    /// Engine bookkeeping or a collaborator failed unexpectedly.
    #[error("unexpected failure: {error}")]
    Unexpected {
        /// The underlying error message.
        error: String,
    },

    /// Dependencies cannot change once a run has begun.
    #[error("dependencies of {loader} are frozen while it runs")]
    DependenciesLocked {
        /// Name of the running loader.
        loader: String,
    },
}

impl LoaderError {
    /// Returns a short stable label (snake_case) for use in logs/events.
    ///
    /// # Example
    /// ```
    /// use tagvisor::LoaderError;
    ///
    /// let err = LoaderError::UrlFailed { url: "https://cdn.test/a.js".into() };
    /// assert_eq!(err.as_label(), "url_failed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            LoaderError::DependencyTimeout { .. } => "dependency_timeout",
            LoaderError::UrlFailed { .. } => "url_failed",
            LoaderError::UrlTimeout { .. } => "url_timeout",
            LoaderError::Execution { .. } => "execution_failed",
            LoaderError::Unexpected { .. } => "unexpected_fail",
            LoaderError::DependenciesLocked { .. } => "dependencies_locked",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            LoaderError::DependencyTimeout { timeout, pending } => {
                format!("timeout {timeout:?}; pending={pending:?}")
            }
            LoaderError::UrlFailed { url } => format!("url: {url}"),
            LoaderError::UrlTimeout { url, timeout } => format!("url: {url} timeout: {timeout:?}"),
            LoaderError::Execution { error } => format!("payload: {error}"),
            LoaderError::Unexpected { error } => format!("unexpected: {error}"),
            LoaderError::DependenciesLocked { loader } => format!("locked: {loader}"),
        }
    }

    /// Indicates whether the failure came from a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LoaderError::DependencyTimeout { .. } | LoaderError::UrlTimeout { .. }
        )
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
