// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed outbound webhooks with retry and a dead-letter ring.

use crate::queue::{HookQueue, HookReceiver};
use crate::topic::TopicFilter;
use chrono::{DateTime, Utc};
use cvn_core::HookEnvelope;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery attempts before an envelope is dead-lettered.
pub const WEBHOOK_MAX_ATTEMPTS: u32 = 5;
/// Dead-letter ring capacity.
pub const DEAD_LETTER_CAPACITY: usize = 1000;
/// Per-delivery HTTP timeout.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);
/// Backoff after the first failed attempt; doubles per retry.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Queue depth per webhook before oldest deliveries are shed.
const WEBHOOK_QUEUE_CAPACITY: usize = 512;

/// Registration payload for an outbound webhook.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Destination URL.
    pub url: String,
    /// HMAC-SHA256 signing secret.
    pub secret: String,
    /// Topics this webhook wants; empty means all.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Maximum delivery attempts (defaults to [`WEBHOOK_MAX_ATTEMPTS`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// A registered webhook as reported by the API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookInfo {
    /// Assigned id.
    pub id: Uuid,
    /// Destination URL.
    pub url: String,
    /// Topic patterns.
    pub topics: Vec<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// An envelope that exhausted its delivery attempts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Webhook that failed.
    pub webhook_id: Uuid,
    /// Destination URL at the time of failure.
    pub url: String,
    /// The undelivered envelope.
    pub envelope: HookEnvelope,
    /// Attempts made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: String,
    /// When the envelope was dead-lettered.
    pub at: DateTime<Utc>,
}

/// Bounded ring of dead letters, shared bus-wide.
#[derive(Clone, Default)]
pub(crate) struct DeadLetterRing {
    inner: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl DeadLetterRing {
    pub(crate) fn push(&self, letter: DeadLetter) {
        let mut ring = self.inner.lock().expect("dead letter lock");
        if ring.len() >= DEAD_LETTER_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(letter);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("dead letter lock").len()
    }

    pub(crate) fn snapshot(&self) -> Vec<DeadLetter> {
        self.inner.lock().expect("dead letter lock").iter().cloned().collect()
    }
}

/// Compute the signature header value for `body` at `timestamp`.
///
/// The signed message is `"{timestamp}.{body}"`, hex-encoded HMAC-SHA256.
pub fn sign(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    let out = mac.finalize().into_bytes();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) struct WebhookWorker {
    pub(crate) id: Uuid,
    pub(crate) config: WebhookConfig,
    pub(crate) queue: Arc<HookQueue>,
}

impl WebhookWorker {
    pub(crate) fn spawn(
        id: Uuid,
        config: WebhookConfig,
        dead_letters: DeadLetterRing,
    ) -> (Arc<HookQueue>, TopicFilter) {
        let filter = TopicFilter::new(config.topics.iter().cloned());
        let queue = HookQueue::new(WEBHOOK_QUEUE_CAPACITY);
        let worker = WebhookWorker {
            id,
            config,
            queue: Arc::clone(&queue),
        };
        tokio::spawn(worker.run(dead_letters));
        (queue, filter)
    }

    async fn run(self, dead_letters: DeadLetterRing) {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("reqwest client");
        let rx = HookReceiver { queue: Arc::clone(&self.queue) };

        while let Some(env) = rx.recv().await {
            // Synthetic envelopes are delivery artifacts, not hooks.
            if env.event.starts_with("__") {
                continue;
            }
            self.deliver(&client, &env, &dead_letters).await;
        }
    }

    async fn deliver(
        &self,
        client: &reqwest::Client,
        env: &HookEnvelope,
        dead_letters: &DeadLetterRing,
    ) {
        let body = match serde_json::to_string(env) {
            Ok(b) => b,
            Err(e) => {
                warn!(webhook = %self.id, error = %e, "webhook envelope serialize failed");
                return;
            }
        };
        let max_attempts = self.config.max_attempts.unwrap_or(WEBHOOK_MAX_ATTEMPTS).max(1);

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let timestamp = Utc::now().timestamp().to_string();
            let signature = sign(&self.config.secret, &timestamp, &body);

            let result = client
                .post(&self.config.url)
                .header("content-type", "application/json")
                .header("x-studio-timestamp", &timestamp)
                .header("x-studio-signature", &signature)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(webhook = %self.id, seq = env.seq, attempt, "webhook delivered");
                    return;
                }
                Ok(resp) => {
                    last_error = format!("status {}", resp.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }

        warn!(
            webhook = %self.id,
            seq = env.seq,
            attempts = max_attempts,
            error = %last_error,
            "webhook delivery dead-lettered"
        );
        dead_letters.push(DeadLetter {
            webhook_id: self.id,
            url: self.config.url.clone(),
            envelope: env.clone(),
            attempts: max_attempts,
            last_error,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let a = sign("secret", "1700000000", r#"{"event":"x"}"#);
        let b = sign("secret", "1700000000", r#"{"event":"x"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_varies_with_inputs() {
        let base = sign("secret", "1700000000", "body");
        assert_ne!(base, sign("other", "1700000000", "body"));
        assert_ne!(base, sign("secret", "1700000001", "body"));
        assert_ne!(base, sign("secret", "1700000000", "body2"));
    }

    #[test]
    fn dead_letter_ring_is_bounded() {
        let ring = DeadLetterRing::default();
        for i in 0..(DEAD_LETTER_CAPACITY + 10) {
            ring.push(DeadLetter {
                webhook_id: Uuid::nil(),
                url: "http://localhost".into(),
                envelope: HookEnvelope::new("e", "test", Default::default()),
                attempts: i as u32,
                last_error: "x".into(),
                at: Utc::now(),
            });
        }
        assert_eq!(ring.len(), DEAD_LETTER_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(ring.snapshot()[0].attempts, 10);
    }
}
