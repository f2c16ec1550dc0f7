//! The delivery worker pool.
//!
//! Workers consume jobs from a shared bounded queue. Every attempt
//! resolves the target, checks the deny list, and only then performs the
//! signed POST. Five attempts are made on a fixed backoff schedule with
//! jitter; a 2xx ends the job as delivered, a 410 is fatal, everything
//! else is retried until the schedule is exhausted.

use rand::Rng;
use reqwest::StatusCode;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tmhub_core::delivery::{DeliveryDisposition, DeliveryKind, DeliveryOutcome, DeliveryRequest};
use tmhub_core::error::DeliveryError;

use crate::denylist::DenyList;
use crate::sign;

/// Signature over the request body.
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
/// Event name, e.g. `addon.invoked`.
pub const HEADER_EVENT: &str = "X-Webhook-Event";
/// Invocation id, add-on deliveries only.
pub const HEADER_INVOCATION_ID: &str = "X-Invocation-Id";
/// Add-on id, add-on deliveries only.
pub const HEADER_ADDON_ID: &str = "X-Addon-Id";
/// Response header a target sets to `async` to defer completion to a
/// signed callback.
pub const HEADER_CALLBACK_MODE: &str = "X-TMI-Callback";

/// Attempt offsets in seconds: immediate, 30s, 1m, 5m, 15m.
pub const RETRY_OFFSETS: [u64; 5] = [0, 30, 60, 300, 900];

/// Tuning for the pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub timeout: Duration,
    pub queue_depth: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { workers: 4, timeout: Duration::from_secs(30), queue_depth: 1024 }
    }
}

/// Producer handle for the shared delivery queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<DeliveryRequest>,
}

impl DeliveryQueue {
    /// A queue with no workers behind it; the caller owns the receiving
    /// end. Used by tests and by custom wiring.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<DeliveryRequest>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    pub async fn enqueue(&self, request: DeliveryRequest) -> Result<(), DeliveryError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| DeliveryError::Network("delivery queue closed".into()))
    }
}

/// The bounded pool of delivery workers.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn the workers and return the queue handle. Terminal outcomes
    /// are reported on `outcomes`.
    pub fn spawn(
        settings: WorkerSettings,
        deny: Arc<DenyList>,
        outcomes: mpsc::Sender<DeliveryOutcome>,
    ) -> DeliveryQueue {
        let (tx, rx) = mpsc::channel::<DeliveryRequest>(settings.queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let client = reqwest::Client::new();

        for worker in 0..settings.workers {
            let rx = rx.clone();
            let client = client.clone();
            let deny = deny.clone();
            let outcomes = outcomes.clone();
            let timeout = settings.timeout;
            tokio::spawn(async move {
                debug!(worker, "Delivery worker started");
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let outcome = DeliveryOutcome {
                        request_id: job.id,
                        webhook_id: job.webhook_id,
                        target_url: job.target_url.clone(),
                        kind: job.kind.clone(),
                        disposition: deliver(&client, &deny, timeout, &job).await,
                    };
                    if outcomes.send(outcome).await.is_err() {
                        break;
                    }
                }
                debug!(worker, "Delivery worker stopped");
            });
        }

        DeliveryQueue { tx }
    }
}

/// Run one job to a terminal disposition.
pub async fn deliver(
    client: &reqwest::Client,
    deny: &DenyList,
    timeout: Duration,
    job: &DeliveryRequest,
) -> DeliveryDisposition {
    let url = match reqwest::Url::parse(&job.target_url) {
        Ok(url) => url,
        Err(e) => {
            return DeliveryDisposition::Failed {
                attempts: 0,
                last_error: DeliveryError::InvalidUrl(e.to_string()).to_string(),
            };
        }
    };
    if url.scheme() != "https" {
        return DeliveryDisposition::Failed {
            attempts: 0,
            last_error: "scheme must be https".into(),
        };
    }
    let Some(host) = url.host_str().map(str::to_owned) else {
        return DeliveryDisposition::Failed { attempts: 0, last_error: "URL has no host".into() };
    };
    let port = url.port_or_known_default().unwrap_or(443);

    let signature = sign::sign(&job.secret, job.body.as_bytes());
    let mut last_error = String::new();

    for (attempt, offset) in RETRY_OFFSETS.iter().enumerate() {
        if *offset > 0 {
            tokio::time::sleep(jittered(*offset)).await;
        }

        // Deny-list enforcement precedes any socket to the target; it is
        // repeated per attempt so DNS changes between retries are caught.
        match resolve_and_check(deny, &host, port).await {
            Ok(()) => {}
            Err(DeliveryError::SsrfBlocked { pattern }) => {
                info!(url = %job.target_url, pattern = %pattern, "Delivery blocked by deny list");
                return DeliveryDisposition::SsrfBlocked { pattern };
            }
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        }

        let mut request = client
            .post(url.clone())
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header(HEADER_SIGNATURE, &signature)
            .header(HEADER_EVENT, &job.event);
        if let DeliveryKind::AddonInvocation { invocation_id, addon_id } = &job.kind {
            request = request
                .header(HEADER_INVOCATION_ID, invocation_id.to_string())
                .header(HEADER_ADDON_ID, addon_id.to_string());
        }

        match request.body(job.body.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let callback_async = response
                        .headers()
                        .get(HEADER_CALLBACK_MODE)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.eq_ignore_ascii_case("async"));
                    return DeliveryDisposition::Delivered {
                        status: status.as_u16(),
                        callback_async,
                        attempts: attempt as u32 + 1,
                    };
                }
                if status == StatusCode::GONE {
                    return DeliveryDisposition::Failed {
                        attempts: attempt as u32 + 1,
                        last_error: "target returned 410 Gone".into(),
                    };
                }
                last_error = format!("target responded {}", status.as_u16());
            }
            Err(e) if e.is_timeout() => {
                last_error = DeliveryError::Timeout { timeout_secs: timeout.as_secs() }.to_string();
            }
            Err(e) => {
                last_error = format!("network error: {e}");
            }
        }
        debug!(url = %job.target_url, attempt = attempt + 1, error = %last_error, "Delivery attempt failed");
    }

    warn!(url = %job.target_url, error = %last_error, "Delivery exhausted all attempts");
    DeliveryDisposition::Failed { attempts: RETRY_OFFSETS.len() as u32, last_error }
}

/// Resolve the host (unless it is an address literal) and apply the deny
/// list to the literal and every resolved address.
async fn resolve_and_check(deny: &DenyList, host: &str, port: u16) -> Result<(), DeliveryError> {
    let bare = host.trim_matches(['[', ']']);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return deny.check(host, &[ip]);
    }

    // Literal host first, so glob entries apply without DNS.
    deny.check(host, &[])?;

    let resolved: Vec<IpAddr> = tokio::net::lookup_host((bare, port))
        .await
        .map_err(|e| DeliveryError::Network(format!("resolution failed: {e}")))?
        .map(|addr| addr.ip())
        .collect();
    deny.check(host, &resolved)
}

/// Backoff offset with ±20% jitter, so retries against a failed target do
/// not synchronize across deliveries.
fn jittered(offset_secs: u64) -> Duration {
    let factor = rand::rng().random_range(0.8..1.2);
    Duration::from_secs_f64(offset_secs as f64 * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job(url: &str) -> DeliveryRequest {
        DeliveryRequest::new(
            Uuid::new_v4(),
            url,
            "addon.invoked",
            r#"{"event_type":"addon.invoked"}"#,
            "secret",
            DeliveryKind::AddonInvocation { invocation_id: Uuid::new_v4(), addon_id: Uuid::new_v4() },
        )
    }

    #[tokio::test]
    async fn http_scheme_fails_without_io() {
        let client = reqwest::Client::new();
        let deny = DenyList::builtin();
        let outcome = deliver(&client, &deny, Duration::from_secs(1), &job("http://example.com/hook")).await;
        match outcome {
            DeliveryDisposition::Failed { attempts, last_error } => {
                assert_eq!(attempts, 0);
                assert!(last_error.contains("https"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn metadata_address_is_ssrf_blocked() {
        let client = reqwest::Client::new();
        let deny = DenyList::builtin();
        let outcome =
            deliver(&client, &deny, Duration::from_secs(1), &job("https://169.254.169.254/latest")).await;
        assert!(matches!(outcome, DeliveryDisposition::SsrfBlocked { .. }));
    }

    #[tokio::test]
    async fn localhost_glob_blocks_before_resolution() {
        let client = reqwest::Client::new();
        let deny = DenyList::builtin();
        let outcome = deliver(&client, &deny, Duration::from_secs(1), &job("https://localhost/hook")).await;
        assert!(matches!(outcome, DeliveryDisposition::SsrfBlocked { .. }));
    }

    #[tokio::test]
    async fn invalid_url_fails_immediately() {
        let client = reqwest::Client::new();
        let deny = DenyList::builtin();
        let outcome = deliver(&client, &deny, Duration::from_secs(1), &job("not a url")).await;
        assert!(matches!(outcome, DeliveryDisposition::Failed { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn pool_reports_blocked_outcome() {
        let (outcome_tx, mut outcome_rx) = mpsc::channel(8);
        let queue = WorkerPool::spawn(
            WorkerSettings { workers: 2, timeout: Duration::from_secs(1), queue_depth: 8 },
            Arc::new(DenyList::builtin()),
            outcome_tx,
        );

        let request = job("https://192.168.0.10/hook");
        let id = request.id;
        queue.enqueue(request).await.unwrap();

        let outcome = outcome_rx.recv().await.unwrap();
        assert_eq!(outcome.request_id, id);
        assert!(matches!(outcome.disposition, DeliveryDisposition::SsrfBlocked { .. }));
    }

    #[test]
    fn retry_schedule_matches_policy() {
        assert_eq!(RETRY_OFFSETS, [0, 30, 60, 300, 900]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = jittered(30);
            assert!(d >= Duration::from_secs_f64(24.0) && d <= Duration::from_secs_f64(36.0));
        }
    }
}
