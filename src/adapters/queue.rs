//! Job queue adapter (C1 / §6 "Job queue (inbound)"): a durable FIFO
//! queue with at-least-once delivery, renewable per-job leases, and
//! queue-owned retry with exponential backoff. Per §4.11 "the worker
//! does not implement retry logic itself" — this adapter owns retry
//! counting and backoff scheduling so `dispatcher.rs` never has to.
//!
//! Grounded secondarily on `poddle-axum`'s AMQP consumer
//! (`compute-provisioner/src/services/consumer.rs`): per-message
//! ack/nack/reject, and a retry count read off a broker-maintained
//! header (`x-death` there) with a max-retry short circuit. There is no
//! AMQP broker in our stack (§6 names Redis, not RabbitMQ), so the same
//! shape is rebuilt directly on `redis`: a reliable-queue pattern
//! (`BRPOPLPUSH` main list -> per-worker processing list) for delivery,
//! a lease key with a TTL for renewal/redelivery-on-expiry, and a Redis
//! hash for the retry counter the AMQP header would otherwise carry.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::AdapterError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: String,
    pub job_name: String,
    pub payload: serde_json::Value,
}

/// A message handed back from `reserve`, carrying enough identity to
/// ack/fail/renew it later without re-parsing the payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub attempt: u32,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn push(&self, queue_name: &str, message: &QueueMessage) -> Result<(), AdapterError>;

    /// Blocks (up to `timeout`) for the next message on `queue_name`,
    /// moving it into a per-worker processing list and setting its
    /// lease. Returns `None` on timeout with nothing available.
    async fn reserve(
        &self,
        queue_name: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, AdapterError>;

    async fn renew_lease(&self, job_id: &str) -> Result<(), AdapterError>;

    async fn ack(&self, queue_name: &str, worker_id: &str, job_id: &str) -> Result<(), AdapterError>;

    /// Marks a delivery as failed. If `attempt` has not yet reached
    /// `max_attempts`, requeues with exponential backoff; otherwise
    /// moves the message to `{queue_name}:dead`.
    async fn fail(
        &self,
        queue_name: &str,
        worker_id: &str,
        delivery: &Delivery,
        max_attempts: u32,
    ) -> Result<(), AdapterError>;

    /// Removes every pending and processing message for `queue_name`.
    /// Used only in non-production shutdown per §4's "non-production
    /// mode additionally clears pending jobs on shutdown".
    async fn clear(&self, queue_name: &str) -> Result<(), AdapterError>;
}

pub struct RedisQueue {
    client: redis::Client,
    lease_duration: Duration,
}

fn processing_key(queue_name: &str, worker_id: &str) -> String {
    format!("{queue_name}:processing:{worker_id}")
}

fn lease_key(job_id: &str) -> String {
    format!("lease:{job_id}")
}

fn attempts_key(job_id: &str) -> String {
    format!("attempts:{job_id}")
}

fn dead_key(queue_name: &str) -> String {
    format!("{queue_name}:dead")
}

impl RedisQueue {
    pub fn new(redis_url: &str, lease_duration: Duration) -> Result<Self, AdapterError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AdapterError::Queue(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            lease_duration,
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, AdapterError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AdapterError::Queue(format!("connection failed: {e}")))
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn push(&self, queue_name: &str, message: &QueueMessage) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(message)
            .map_err(|e| AdapterError::Queue(format!("encode failed: {e}")))?;
        conn.lpush::<_, _, ()>(queue_name, encoded)
            .await
            .map_err(|e| AdapterError::Queue(format!("push failed: {e}")))
    }

    async fn reserve(
        &self,
        queue_name: &str,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, AdapterError> {
        let mut conn = self.conn().await?;
        let dest = processing_key(queue_name, worker_id);
        let timeout_secs = timeout.as_secs_f64().max(0.01);

        let raw: Option<String> = conn
            .brpoplpush(queue_name, &dest, timeout_secs)
            .await
            .map_err(|e| AdapterError::Queue(format!("reserve failed: {e}")))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let message: QueueMessage = serde_json::from_str(&raw)
            .map_err(|e| AdapterError::Queue(format!("malformed queued message: {e}")))?;

        let attempts: u32 = conn
            .incr(attempts_key(&message.job_id), 1)
            .await
            .map_err(|e| AdapterError::Queue(format!("attempt counter failed: {e}")))?;

        conn.set_ex::<_, _, ()>(
            lease_key(&message.job_id),
            worker_id,
            self.lease_duration.as_secs(),
        )
        .await
        .map_err(|e| AdapterError::Queue(format!("set lease failed: {e}")))?;

        Ok(Some(Delivery {
            message,
            attempt: attempts,
        }))
    }

    async fn renew_lease(&self, job_id: &str) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        conn.expire::<_, ()>(lease_key(job_id), self.lease_duration.as_secs() as i64)
            .await
            .map_err(|e| AdapterError::Queue(format!("renew lease failed: {e}")))
    }

    async fn ack(&self, queue_name: &str, worker_id: &str, job_id: &str) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        let dest = processing_key(queue_name, worker_id);
        let members: Vec<String> = conn
            .lrange(&dest, 0, -1)
            .await
            .map_err(|e| AdapterError::Queue(format!("ack lookup failed: {e}")))?;
        for raw in members {
            if let Ok(message) = serde_json::from_str::<QueueMessage>(&raw) {
                if message.job_id == job_id {
                    conn.lrem::<_, _, ()>(&dest, 1, raw)
                        .await
                        .map_err(|e| AdapterError::Queue(format!("ack remove failed: {e}")))?;
                }
            }
        }
        conn.del::<_, ()>((lease_key(job_id), attempts_key(job_id)))
            .await
            .map_err(|e| AdapterError::Queue(format!("ack cleanup failed: {e}")))
    }

    async fn fail(
        &self,
        queue_name: &str,
        worker_id: &str,
        delivery: &Delivery,
        max_attempts: u32,
    ) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        let dest = processing_key(queue_name, worker_id);
        let encoded = serde_json::to_string(&delivery.message)
            .map_err(|e| AdapterError::Queue(format!("encode failed: {e}")))?;
        conn.lrem::<_, _, ()>(&dest, 1, &encoded)
            .await
            .map_err(|e| AdapterError::Queue(format!("fail remove failed: {e}")))?;
        conn.del::<_, ()>(lease_key(&delivery.message.job_id))
            .await
            .map_err(|e| AdapterError::Queue(format!("fail lease cleanup failed: {e}")))?;

        if delivery.attempt >= max_attempts {
            conn.del::<_, ()>(attempts_key(&delivery.message.job_id))
                .await
                .ok();
            conn.lpush::<_, _, ()>(dead_key(queue_name), &encoded)
                .await
                .map_err(|e| AdapterError::Queue(format!("dead-letter push failed: {e}")))?;
            return Ok(());
        }

        let backoff = backoff_for_attempt(delivery.attempt);
        tokio::time::sleep(backoff).await;
        conn.lpush::<_, _, ()>(queue_name, &encoded)
            .await
            .map_err(|e| AdapterError::Queue(format!("requeue failed: {e}")))
    }

    async fn clear(&self, queue_name: &str) -> Result<(), AdapterError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn
            .keys(format!("{queue_name}:processing:*"))
            .await
            .map_err(|e| AdapterError::Queue(format!("clear scan failed: {e}")))?;
        let mut del_keys: Vec<String> = vec![queue_name.to_string(), dead_key(queue_name)];
        del_keys.extend(keys);
        conn.del::<_, ()>(del_keys)
            .await
            .map_err(|e| AdapterError::Queue(format!("clear failed: {e}")))
    }
}

/// Exponential backoff: 1s * 2^(attempt-1), capped at 60s.
fn backoff_for_attempt(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.saturating_sub(1)).min(60);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn queue_message_round_trips_json() {
        let message = QueueMessage {
            job_id: "j1".into(),
            job_name: "initialProjectCreationJob".into(),
            payload: serde_json::json!({"projectId": "p1"}),
        };
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: QueueMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job_id, "j1");
        assert_eq!(decoded.payload["projectId"], "p1");
    }

    #[test]
    fn key_helpers_are_namespaced_per_worker() {
        assert_eq!(processing_key("q", "w1"), "q:processing:w1");
        assert_eq!(lease_key("j1"), "lease:j1");
        assert_eq!(dead_key("q"), "q:dead");
    }
}
