//! Lifecycle helpers for the Scaleway backend.
//!
//! Calls the SDK does not cover go straight to the HTTP API through a shared
//! client.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::StatusCode;

use super::ScalewayBackendError;

mod create;
mod credential;
mod describe;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Response body of a finished call, or `None` for a 404.
pub(crate) enum Answer {
    Found(Vec<u8>),
    Missing,
}

/// Sends `request` and classifies the answer.
///
/// # Errors
///
/// Returns [`ScalewayBackendError::Provider`] for transport failures and
/// [`ScalewayBackendError::Api`] for any status other than success or 404.
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
    operation: &'static str,
) -> Result<Answer, ScalewayBackendError> {
    let response = request
        .send()
        .await
        .map_err(|err| ScalewayBackendError::provider(&err))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| ScalewayBackendError::provider(&err))?;

    if status.is_success() {
        return Ok(Answer::Found(body.to_vec()));
    }
    if status == StatusCode::NOT_FOUND {
        return Ok(Answer::Missing);
    }
    Err(ScalewayBackendError::Api {
        operation,
        status: status.as_u16(),
        message: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Parses a JSON body.
pub(crate) fn parse<T: serde::de::DeserializeOwned>(
    body: &[u8],
) -> Result<T, ScalewayBackendError> {
    serde_json::from_slice(body).map_err(|err| ScalewayBackendError::provider(&err))
}
