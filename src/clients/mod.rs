pub mod ipfs;
pub mod planet;
pub mod weatherxm;

use crate::error::PipelineError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shared contract for every upstream call: a per-call deadline, bounded
/// retries on transient failures only, and exponential backoff between
/// attempts.
#[derive(Debug, Clone, Copy)]
pub struct RequestPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub deadline: Duration,
}

impl RequestPolicy {
    pub fn new(attempts: u32, deadline: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(10),
            deadline,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.backoff_cap);
        // Jitter keeps synchronized workers from hammering a recovering upstream.
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        capped + Duration::from_millis(jitter_ms)
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Executes `operation` under the policy, classifying outcomes into the
/// pipeline taxonomy. Retries happen only for transient conditions (network
/// errors, 5xx, 429 with its Retry-After honoured); 4xx and decode failures
/// are permanent. The deadline bounds the whole call including backoff.
pub(crate) async fn send_with_policy<F, Fut>(
    policy: &RequestPolicy,
    operation_name: &str,
    operation: F,
) -> Result<reqwest::Response, PipelineError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let run = async {
        let mut last_error = PipelineError::Transient(format!("{operation_name}: no attempts ran"));
        for attempt in 0..policy.attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.backoff_for(attempt - 1)).await;
            }

            match operation().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = parse_retry_after(&response);
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            retry_after_seconds = retry_after.map(|d| d.as_secs()),
                            "upstream rate limited"
                        );
                        if let Some(wait) = retry_after {
                            tokio::time::sleep(wait).await;
                        }
                        last_error = PipelineError::RateLimited { retry_after };
                        continue;
                    }
                    if status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            status = %status,
                            "upstream server error"
                        );
                        last_error =
                            PipelineError::Transient(format!("{operation_name} HTTP {status}: {body}"));
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(PipelineError::Permanent(format!(
                        "{operation_name} HTTP {status}: {body}"
                    )));
                }
                Err(err) if err.is_timeout() => {
                    tracing::warn!(operation = operation_name, attempt, "request timed out");
                    last_error = PipelineError::Timeout;
                }
                Err(err) => {
                    tracing::warn!(operation = operation_name, attempt, error = %err, "request failed");
                    last_error = PipelineError::Transient(format!("{operation_name}: {err}"));
                }
            }
        }
        Err(last_error)
    };

    match tokio::time::timeout(policy.deadline, run).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout),
    }
}

pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    operation_name: &str,
    response: reqwest::Response,
) -> Result<T, PipelineError> {
    response
        .json::<T>()
        .await
        .map_err(|err| PipelineError::Permanent(format!("{operation_name} decode failed: {err}")))
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket gating outbound calls to one upstream: burst capacity `B`,
/// refill `R` per minute. An empty bucket blocks the caller up to the
/// supplied deadline, then fails with `RateLimited`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(burst: u32, refill_per_minute: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_per_second: f64::from(refill_per_minute.max(1)) / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.refilled_at = now;
    }

    pub async fn acquire(&self, deadline: Duration) -> Result<(), PipelineError> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_second)
            };

            if started.elapsed() + wait > deadline {
                return Err(PipelineError::RateLimited {
                    retry_after: Some(wait),
                });
            }
            tokio::time::sleep(wait).await;
        }
    }

    #[cfg(test)]
    async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.refill(&mut state, now);
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_enforces_per_minute_ceiling() {
        // 60/min refill, burst of 5: at most 5 immediate acquisitions.
        let bucket = TokenBucket::new(5, 60);
        for _ in 0..5 {
            bucket
                .acquire(Duration::from_millis(1))
                .await
                .expect("burst tokens available");
        }
        let err = bucket.acquire(Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::RateLimited { .. }));

        // One second of refill restores exactly one token.
        tokio::time::advance(Duration::from_secs(1)).await;
        bucket
            .acquire(Duration::from_millis(1))
            .await
            .expect("token refilled");
        assert!(bucket.available().await < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_blocks_until_refill() {
        let bucket = TokenBucket::new(1, 60);
        bucket.acquire(Duration::from_secs(5)).await.unwrap();

        let acquire = tokio::spawn(async move {
            bucket.acquire(Duration::from_secs(5)).await.map(|_| ())
        });
        tokio::time::advance(Duration::from_secs(2)).await;
        acquire
            .await
            .expect("join")
            .expect("acquire succeeds after refill");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RequestPolicy::new(3, Duration::from_secs(60));
        assert!(policy.backoff_for(0) >= Duration::from_secs(2));
        assert!(policy.backoff_for(1) >= Duration::from_secs(4));
        // Cap at 10s (plus jitter under 250ms).
        assert!(policy.backoff_for(5) < Duration::from_secs(11));
    }
}
