//! LIFO stack of compensating actions for transient resources.
//!
//! Each acquired resource registers an action that releases it. When the
//! owning scope ends, [`CleanupStack::unwind`] runs every registered action
//! exactly once, newest first, whether the scope succeeded or failed. A
//! failing action never stops the unwind; every failure (and the failure
//! that ended the scope, if any) is handed to an [`ErrorObserver`] as it
//! happens, and the last cleanup failure becomes the surfaced error.

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::{error, info};

/// Future returned by a cleanup action.
pub type CleanupFuture<'a, E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'a>>;

/// Future returned by [`ErrorObserver::observe`].
pub type ObserveFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

type CleanupAction<'a, E> = Box<dyn FnOnce() -> CleanupFuture<'a, E> + Send + 'a>;

/// Receives failures that must not go unnoticed, even when they are not
/// the error ultimately returned to the caller.
pub trait ErrorObserver: Send + Sync {
    /// Records `error`, raised while `context`.
    fn observe<'a>(
        &'a self,
        context: &'a str,
        error: &'a (dyn StdError + Send + Sync),
    ) -> ObserveFuture<'a>;
}

/// Observer that only writes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl ErrorObserver for LogObserver {
    fn observe<'a>(
        &'a self,
        context: &'a str,
        error: &'a (dyn StdError + Send + Sync),
    ) -> ObserveFuture<'a> {
        Box::pin(async move {
            error!(context, %error, "error observed");
        })
    }
}

/// Failure returned by [`CleanupStack::unwind`].
#[derive(Debug, Error)]
pub enum UnwindError<E>
where
    E: StdError + 'static,
{
    /// The scope failed and every cleanup action succeeded.
    #[error(transparent)]
    Body(E),
    /// At least one cleanup action failed. `failure` is the last one to
    /// fail; `trigger` is the scope failure that started the unwind, if any.
    #[error("cleanup action '{label}' failed: {failure}")]
    Cleanup {
        /// Label of the last failing action.
        label: String,
        /// Error raised by that action.
        #[source]
        failure: E,
        /// Failure of the protected scope, when it failed.
        trigger: Option<E>,
    },
}

/// Ordered compensating actions owned by one scope.
pub struct CleanupStack<'a, E> {
    actions: Vec<(String, CleanupAction<'a, E>)>,
}

impl<E> Default for CleanupStack<'_, E> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
        }
    }
}

impl<E> std::fmt::Debug for CleanupStack<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("labels", &self.labels())
            .finish()
    }
}

impl<E> CleanupStack<'_, E> {
    /// Number of registered actions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` when nothing has been registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Labels in registration order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.actions.iter().map(|(label, _)| label.as_str()).collect()
    }
}

impl<'a, E> CleanupStack<'a, E>
where
    E: StdError + Send + Sync + 'static,
{
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` to run when the stack unwinds.
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), E>> + Send + 'a,
    {
        let name: String = label.into();
        info!(label = %name, "registered cleanup action");
        self.actions
            .push((name, Box::new(move || Box::pin(action()) as CleanupFuture<'a, E>)));
    }

    /// Runs every action in reverse registration order and combines the
    /// outcome of the scope with the outcome of the unwind.
    ///
    /// A scope failure is reported to `observer` before any action runs.
    /// Each failing action is reported as it fails and the unwind carries
    /// on with the remaining actions.
    ///
    /// # Errors
    ///
    /// Returns [`UnwindError::Cleanup`] for the last failing action (with
    /// the scope failure attached as its trigger), or [`UnwindError::Body`]
    /// when only the scope failed.
    pub async fn unwind<T>(
        self,
        outcome: Result<T, E>,
        observer: &dyn ErrorObserver,
    ) -> Result<T, UnwindError<E>> {
        if let Err(err) = &outcome {
            observer.observe("in protected scope", err).await;
        }

        let mut last_failure: Option<(String, E)> = None;
        for (index, (label, action)) in self.actions.into_iter().enumerate().rev() {
            info!(label = %label, index, "running cleanup action");
            if let Err(err) = action().await {
                let context = format!("while in cleanup action {index} ({label})");
                observer.observe(&context, &err).await;
                last_failure = Some((label, err));
            }
        }

        match (outcome, last_failure) {
            (Ok(value), None) => Ok(value),
            (Err(err), None) => Err(UnwindError::Body(err)),
            (scope, Some((label, failure))) => Err(UnwindError::Cleanup {
                label,
                failure,
                trigger: scope.err(),
            }),
        }
    }
}

#[cfg(test)]
mod tests;
