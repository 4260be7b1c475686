//! Shared HTTP plumbing for backend clients.

use std::time::Duration;

use metrics::counter;
use reqwest::{Client, RequestBuilder, Response};
use tracing::warn;

use crate::error::{GenaiError, GenaiResult};

/// Build the shared client.
pub fn build_client(timeout: Duration) -> GenaiResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(GenaiError::from)
}

/// Send a request, retrying 429/5xx responses and transport errors with
/// `2^attempt` second backoff.
///
/// `make_request` is called once per attempt since a sent builder is consumed.
pub async fn send_with_retry<F>(backend: &'static str, max_retries: u32, make_request: F) -> GenaiResult<Response>
where
    F: Fn() -> RequestBuilder,
{
    send_with_backoff(backend, max_retries, Duration::from_secs(1), make_request).await
}

pub(crate) async fn send_with_backoff<F>(
    backend: &'static str,
    max_retries: u32,
    base_delay: Duration,
    make_request: F,
) -> GenaiResult<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let result = match make_request().send().await {
            Ok(response) => check_status(response).await,
            Err(e) => Err(GenaiError::from(e)),
        };

        match result {
            Ok(response) => return Ok(response),
            Err(e) if attempt < max_retries && is_transient(&e) => {
                let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt));
                warn!(
                    backend = backend,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Backend request failed, retrying: {}",
                    e
                );
                counter!("genai_http_retries_total", "backend" => backend).increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                counter!("genai_http_failures_total", "backend" => backend).increment(1);
                return Err(e);
            }
        }
    }
}

/// Only transport and status failures are retried here; body parsing
/// problems surface to the stage retry policy.
fn is_transient(error: &GenaiError) -> bool {
    matches!(error, GenaiError::Status { .. } | GenaiError::Http(_)) && error.is_retryable()
}

/// Turn a non-2xx response into [`GenaiError::Status`].
pub async fn check_status(response: Response) -> GenaiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GenaiError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Fetch a URL returned by a backend.
pub async fn download(client: &Client, backend: &'static str, max_retries: u32, url: &str) -> GenaiResult<Vec<u8>> {
    let response = send_with_retry(backend, max_retries, || client.get(url)).await?;
    Ok(response.bytes().await?.to_vec())
}
