//! Delivery gate: the single externally visible side effect per request.
//!
//! Each correlation id owns a slot. Concurrent deliveries for the same id
//! serialize on the slot's async mutex; whoever finds a stored [`Ack`] returns
//! it without posting again. Slots expire after the retention window and are
//! purged lazily on access.
//!
//! Every wait inside [`DeliveryGate::deliver`] is bounded by the request
//! deadline and the request's cancellation token. That covers the slot lock,
//! each post attempt and the backoff between attempts. Each attempt is further
//! capped by `timeout_ms`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agents::adapters::RepositoryIntegration;
use crate::agents::client::InvocationContext;
use crate::agents::error::AgentError;
use crate::domain::error::{OrchestratorError, Result};
use crate::domain::request::CorrelationId;
use crate::domain::review::{Ack, ConsolidatedReview};
use crate::graph::stage::RetryPolicy;
use crate::metrics::METRICS;
use crate::obs;

/// Posting retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub max_attempts: u32,
    /// Upper bound on a single post attempt.
    pub timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_ceiling_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 30_000,
            backoff_base_ms: 200,
            backoff_ceiling_ms: 5_000,
        }
    }
}

impl DeliverySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            multiplier: 2,
            backoff_ceiling: Duration::from_millis(self.backoff_ceiling_ms),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Token sent with every post for `id`; stable across retries and restarts.
pub fn idempotency_token(id: &CorrelationId) -> String {
    let digest = Sha256::digest(format!("revo:{}", id.as_str()).as_bytes());
    hex::encode(&digest[..16])
}

fn failure(correlation_id: &CorrelationId, attempts: u32, reason: &str) -> OrchestratorError {
    OrchestratorError::DeliveryFailure {
        correlation_id: correlation_id.to_string(),
        attempts,
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Delivered {
    ack: Ack,
    at: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<Delivered>>>;

pub struct DeliveryGate {
    repository: Arc<dyn RepositoryIntegration>,
    settings: DeliverySettings,
    retention: Duration,
    slots: Mutex<HashMap<CorrelationId, Slot>>,
}

impl DeliveryGate {
    pub fn new(
        repository: Arc<dyn RepositoryIntegration>,
        settings: DeliverySettings,
        retention: Duration,
    ) -> Self {
        Self {
            repository,
            settings,
            retention,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Post `review` once for `correlation_id` and return its acknowledgment.
    ///
    /// A repeat call inside the retention window returns the stored Ack and
    /// does not touch the repository, whatever review it carries. Transient
    /// failures, including an attempt running past its timeout, are retried
    /// with the same idempotency token. A rejection, an exhausted budget,
    /// reaching `deadline` or `cancel` firing yields `DeliveryFailure`.
    pub async fn deliver(
        &self,
        correlation_id: &CorrelationId,
        review: &ConsolidatedReview,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Ack> {
        let slot = self.slot(correlation_id);
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(failure(correlation_id, 0, "delivery cancelled"));
            }
            _ = sleep_until(deadline) => {
                return Err(failure(
                    correlation_id,
                    0,
                    "request deadline exceeded waiting for a concurrent delivery",
                ));
            }
            guard = slot.lock() => guard,
        };

        if let Some(done) = guard.as_ref() {
            METRICS.inc_deliveries_deduplicated();
            obs::emit_delivery_deduplicated(correlation_id.as_str(), &done.ack.receipt_id);
            return Ok(done.ack.clone());
        }

        let token = idempotency_token(correlation_id);
        let policy = self.settings.retry_policy();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let ctx = InvocationContext::new(
                (started + self.settings.attempt_timeout()).min(deadline),
                cancel.clone(),
            )
            .with_attempt(attempt);
            let post = self.repository.post_comments(
                &review.repository,
                &review.change_id,
                review,
                &token,
                &ctx,
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(failure(correlation_id, attempt, "delivery cancelled"));
                }
                r = timeout_at(ctx.deadline, post) => r.unwrap_or_else(|_| {
                    Err(AgentError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }),
            };

            let e = match result {
                Ok(receipt_id) => {
                    let ack = Ack {
                        correlation_id: correlation_id.clone(),
                        receipt_id,
                        idempotency_token: token,
                        review_digest: review.digest(),
                        posted_at: Utc::now(),
                        attempts: attempt,
                    };
                    *guard = Some(Delivered {
                        ack: ack.clone(),
                        at: Instant::now(),
                    });
                    METRICS.inc_deliveries_posted();
                    obs::emit_delivery_posted(correlation_id.as_str(), &ack.receipt_id, attempt);
                    return Ok(ack);
                }
                Err(e) => e,
            };

            if !e.is_retryable() || attempt >= policy.max_attempts {
                return Err(failure(correlation_id, attempt, &e.to_string()));
            }
            let delay = policy.delay_after(attempt);
            if Instant::now() + delay >= deadline {
                return Err(failure(
                    correlation_id,
                    attempt,
                    &format!("request deadline exceeded: {e}"),
                ));
            }
            warn!(
                correlation_id = %correlation_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "post failed, retrying with same idempotency token"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(failure(correlation_id, attempt, "delivery cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// The stored Ack for `correlation_id`, if it was delivered and has not
    /// expired.
    pub fn delivered(&self, correlation_id: &CorrelationId) -> Option<Ack> {
        let mut slots = self.lock_slots();
        self.purge(&mut slots);
        let slot = slots.get(correlation_id)?;
        let guard = slot.try_lock().ok()?;
        guard.as_ref().map(|d| d.ack.clone())
    }

    /// Number of slots currently held.
    pub fn len(&self) -> usize {
        let mut slots = self.lock_slots();
        self.purge(&mut slots);
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &CorrelationId) -> Slot {
        let mut slots = self.lock_slots();
        self.purge(&mut slots);
        Arc::clone(slots.entry(id.clone()).or_default())
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<CorrelationId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop expired deliveries and idle slots that never delivered.
    /// Slots with a delivery in progress are locked and therefore kept.
    fn purge(&self, slots: &mut HashMap<CorrelationId, Slot>) {
        let now = Instant::now();
        let retention = self.retention;
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(done) => now.duration_since(done.at) < retention,
                None => Arc::strong_count(slot) > 1,
            },
            Err(_) => true,
        });
    }
}
