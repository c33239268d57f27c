//! Content sources: where candidate entities come from and how their
//! content is sampled.
//!
//! Both providers expose the same narrow capability set so the evaluation
//! pipeline never needs to know which one it is talking to.

pub mod messaging;
pub mod web;

use crate::entity::{Entity, SourceKind};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use std::time::Duration;

pub use messaging::MessagingSource;
pub use web::WebSource;

/// Wait applied when a provider throttles us without saying for how long.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// Provider-wide throttling; every caller must back off for `wait`.
    #[error("provider rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },
    /// The entity could not be resolved or fetched; skip it.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Query the provider for candidates. Every call hits the provider again.
    async fn discover(&self, query: &str) -> Result<Vec<Entity>, SourceError>;

    /// One-time provider action needed before content can be read, such as
    /// joining a channel. Failure is not fatal to the caller.
    async fn prepare(&self, _entity: &Entity) -> Result<(), SourceError> {
        Ok(())
    }

    /// Fetch up to `max_items` text items, newest first where the provider
    /// has an ordering. Fewer items are returned when content runs out.
    async fn sample(&self, entity: &Entity, max_items: usize) -> Result<Vec<String>, SourceError>;
}

/// Read the wait a provider asked for from a `Retry-After` header holding a
/// number of seconds. HTTP-date forms are not supported.
pub fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    seconds_to_wait(value.parse().ok()?)
}

/// Read a flood-wait style `{"retry_after": seconds}` body.
pub fn retry_after_body(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    seconds_to_wait(value.get("retry_after")?.as_f64()?)
}

/// Values too large for a `Duration` saturate; the rate gate caps the
/// pause it actually applies.
fn seconds_to_wait(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

/// Map provider statuses onto the source error taxonomy, passing successful
/// responses through. `what` names the resource for log and error text.
pub(crate) async fn check_status(response: Response, what: &str) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let header_wait = retry_after_header(response.headers());
        let wait = match header_wait {
            Some(wait) => wait,
            None => {
                let body = response.text().await.unwrap_or_default();
                retry_after_body(&body).unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
            }
        };
        return Err(SourceError::RateLimited { wait });
    }

    if status == StatusCode::NOT_FOUND {
        return Err(SourceError::Unavailable(format!("{what} not found")));
    }

    Err(SourceError::Unavailable(format!(
        "{what} returned status {}",
        status.as_u16()
    )))
}
