//! Per-user API rate limiting.
//!
//! Sliding minute and hour windows live in the ephemeral store under
//! `api:ratelimit:{scope}:{user}` keys; the trim-count-insert is atomic
//! per key, so concurrent requests cannot both slip under the limit.
//! Every authenticated response carries `X-RateLimit-Limit`, `-Remaining`
//! and `-Reset`; a 429 additionally carries `Retry-After` until the
//! oldest windowed entry expires.

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use uuid::Uuid;

use tmhub_core::error::{Error, QuotaError};
use tmhub_core::principal::Principal;
use tmhub_core::store::{EphemeralStore as _, Store as _, WindowDecision};

use crate::error::ApiError;
use crate::SharedState;

const MINUTE_WINDOW_SECS: u64 = 60;
const HOUR_WINDOW_SECS: u64 = 3600;
/// Window keys outlive their window by a minute.
const TTL_SLACK_SECS: u64 = 60;

pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

fn window_key(scope: &str, user: Uuid) -> String {
    format!("api:ratelimit:{scope}:{user}")
}

/// Seconds until the oldest entry leaves the window.
fn retry_after(decision: &WindowDecision, window_secs: u64) -> u64 {
    decision
        .oldest_epoch
        .map(|oldest| (oldest + window_secs as i64 - Utc::now().timestamp()).max(1) as u64)
        .unwrap_or(window_secs)
}

struct Headers {
    limit: u32,
    remaining: u32,
    reset_epoch: i64,
}

impl Headers {
    fn apply(&self, response: &mut Response) {
        let headers = response.headers_mut();
        headers.insert(HEADER_LIMIT, int_header(self.limit as i64));
        headers.insert(HEADER_REMAINING, int_header(self.remaining as i64));
        headers.insert(HEADER_RESET, int_header(self.reset_epoch));
    }
}

fn int_header(value: i64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("integers are valid header values")
}

/// Middleware enforcing the minute and hour windows. Runs after
/// authentication; the principal extension must be present.
pub async fn middleware(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = req
        .extensions()
        .get::<Principal>()
        .cloned()
        .ok_or_else(|| Error::Internal("rate limiter ran without a principal".into()))?;
    let user = principal.internal_uuid;

    let quota = state
        .store
        .quota_for(user)
        .await?
        .unwrap_or_else(|| state.default_quota.clone());

    let minute = state
        .ephemeral
        .window_add(
            &window_key("minute", user),
            quota.max_api_requests_per_minute,
            MINUTE_WINDOW_SECS,
            MINUTE_WINDOW_SECS + TTL_SLACK_SECS,
        )
        .await?;

    let headers = Headers {
        limit: quota.max_api_requests_per_minute,
        remaining: (quota.max_api_requests_per_minute as u64).saturating_sub(minute.count) as u32,
        reset_epoch: minute
            .oldest_epoch
            .map(|o| o + MINUTE_WINDOW_SECS as i64)
            .unwrap_or_else(|| Utc::now().timestamp() + MINUTE_WINDOW_SECS as i64),
    };

    if !minute.allowed {
        let mut response = ApiError(Error::Quota(QuotaError::ApiLimit {
            retry_after_secs: retry_after(&minute, MINUTE_WINDOW_SECS),
        }))
        .into_response();
        headers.apply(&mut response);
        return Ok(response);
    }

    let hour = state
        .ephemeral
        .window_add(
            &window_key("hour", user),
            quota.max_api_requests_per_hour,
            HOUR_WINDOW_SECS,
            HOUR_WINDOW_SECS + TTL_SLACK_SECS,
        )
        .await?;
    if !hour.allowed {
        let mut response = ApiError(Error::Quota(QuotaError::ApiLimit {
            retry_after_secs: retry_after(&hour, HOUR_WINDOW_SECS),
        }))
        .into_response();
        headers.apply(&mut response);
        return Ok(response);
    }

    let mut response = next.run(req).await;
    headers.apply(&mut response);
    Ok(response)
}
