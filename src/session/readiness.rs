//! Background wait for the single-fire readiness signal.

use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info};

use super::error::{BuildError, WaitPoint};
use crate::pubsub::Subscription;

/// How long each receive waits before checking again.
const RECEIVE_SLICE: Duration = Duration::from_secs(1);

/// Handle to a readiness wait running on the runtime.
#[derive(Debug)]
pub struct ReadinessWait {
    task: JoinHandle<Result<String, BuildError>>,
}

/// Cancels a [`ReadinessWait`]. Safe to call any number of times, before or
/// after the signal fires.
#[derive(Clone, Debug)]
pub struct ReadinessCanceller {
    abort: AbortHandle,
}

impl ReadinessCanceller {
    /// Stops the background wait if it is still running.
    pub fn cancel(&self) {
        if !self.abort.is_finished() {
            debug!("cancelling readiness wait");
        }
        self.abort.abort();
    }
}

impl ReadinessWait {
    /// Starts waiting on `subscription` in the background.
    pub fn spawn<S: Subscription>(mut subscription: S, topic: String) -> Self {
        let task = tokio::spawn(async move {
            loop {
                if let Some(payload) = subscription.next_message(RECEIVE_SLICE).await? {
                    info!(topic = %topic, "readiness signal received");
                    return Ok(payload);
                }
            }
        });
        Self { task }
    }

    /// Handle used to cancel the wait during unwind.
    #[must_use]
    pub fn canceller(&self) -> ReadinessCanceller {
        ReadinessCanceller {
            abort: self.task.abort_handle(),
        }
    }

    /// Waits up to `limit` for the signal to have fired.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Timeout`] when the signal does not fire in time,
    /// the receive error when the subscription fails, or
    /// [`BuildError::Worker`] when the wait was cancelled.
    pub async fn wait(self, limit: Duration) -> Result<String, BuildError> {
        match timeout(limit, self.task).await {
            Err(_) => Err(BuildError::Timeout {
                point: WaitPoint::Readiness,
                timeout: limit,
            }),
            Ok(Err(join)) => Err(BuildError::Worker(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}
