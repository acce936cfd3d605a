//! Best-effort operator notifications.
//!
//! Notification failures are logged and swallowed by callers; they never
//! change the outcome of a build.

use std::error::Error as StdError;
use std::sync::LazyLock;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::BackendFuture;
use crate::cleanup::{ErrorObserver, ObserveFuture};
use crate::config::NotifyConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Errors raised while delivering a notification.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NotifyError {
    /// Raised when the request cannot be sent.
    #[error("failed to deliver notification: {0}")]
    Transport(String),
    /// Raised when the receiver rejects the message.
    #[error("notification rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Sends short operator-facing messages.
pub trait Notifier: Send + Sync {
    /// Delivers `text`.
    fn send<'a>(&'a self, text: &'a str) -> BackendFuture<'a, (), NotifyError>;
}

/// Notifier posting to a Slack incoming webhook.
#[derive(Clone, Debug)]
pub struct SlackNotifier {
    webhook_url: String,
    channel: Option<String>,
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
}

impl SlackNotifier {
    /// Creates a notifier for `webhook_url`, optionally overriding the
    /// webhook's default channel.
    #[must_use]
    pub fn new(webhook_url: impl Into<String>, channel: Option<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            channel,
        }
    }
}

impl Notifier for SlackNotifier {
    fn send<'a>(&'a self, text: &'a str) -> BackendFuture<'a, (), NotifyError> {
        Box::pin(async move {
            let payload = SlackMessage {
                text,
                channel: self.channel.as_deref(),
            };
            let response = HTTP_CLIENT
                .post(&self.webhook_url)
                .json(&payload)
                .send()
                .await
                .map_err(|err| NotifyError::Transport(err.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            })
        })
    }
}

/// Notifier that only writes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send<'a>(&'a self, text: &'a str) -> BackendFuture<'a, (), NotifyError> {
        Box::pin(async move {
            info!(target: "kiln::ops", "{text}");
            Ok(())
        })
    }
}

/// Notifier selected from configuration.
#[derive(Clone, Debug)]
pub enum OpsNotifier {
    /// Slack webhook delivery.
    Slack(SlackNotifier),
    /// Log-only delivery.
    Log(LogNotifier),
}

impl OpsNotifier {
    /// Picks Slack when a webhook is configured, otherwise the log.
    #[must_use]
    pub fn from_config(config: &NotifyConfig) -> Self {
        match config
            .slack_webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            Some(url) => Self::Slack(SlackNotifier::new(url, config.slack_channel.clone())),
            None => Self::Log(LogNotifier),
        }
    }
}

impl Notifier for OpsNotifier {
    fn send<'a>(&'a self, text: &'a str) -> BackendFuture<'a, (), NotifyError> {
        match self {
            Self::Slack(slack) => slack.send(text),
            Self::Log(log) => log.send(text),
        }
    }
}

/// Delivers `text`, logging instead of failing when delivery fails.
pub async fn notify_best_effort<N: Notifier + ?Sized>(notifier: &N, text: &str) {
    if let Err(err) = notifier.send(text).await {
        warn!(error = %err, message = text, "notification not delivered");
    }
}

/// Error observer that logs each failure and forwards it to operators.
#[derive(Debug)]
pub struct OpsReporter<'a, N: ?Sized> {
    notifier: &'a N,
}

impl<'a, N: Notifier + ?Sized> OpsReporter<'a, N> {
    /// Creates a reporter forwarding to `notifier`.
    #[must_use]
    pub const fn new(notifier: &'a N) -> Self {
        Self { notifier }
    }
}

impl<N: Notifier + ?Sized> ErrorObserver for OpsReporter<'_, N> {
    fn observe<'b>(
        &'b self,
        context: &'b str,
        error: &'b (dyn StdError + Send + Sync),
    ) -> ObserveFuture<'b> {
        Box::pin(async move {
            error!(context, %error, "build error");
            let text = format!("build error {context}: {error}");
            notify_best_effort(self.notifier, &text).await;
        })
    }
}
