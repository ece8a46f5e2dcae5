//! Pub/Sub adapter (C1): the low-level transport C2's publisher sits on
//! top of. Per §5 "the pub/sub publisher connection is process-wide,
//! owned exclusively by the publisher subsystem" and §9's "duplicated
//! connections" ordering note, this is a single dedicated `redis::Client`
//! distinct from the one the queue adapter uses, even though both speak
//! to the same Redis deployment.
//!
//! Publish is fire-and-forget per §5 "callers must not await subscriber
//! acknowledgment" — `publish` here returns once Redis has accepted the
//! `PUBLISH` command, not once any subscriber has received it.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::errors::AdapterError;

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), AdapterError>;

    /// Resolves once the underlying connection has been established.
    /// Backs the publisher's "ready" barrier (§4 C2): the first
    /// successful connection event.
    async fn ready(&self) -> Result<(), AdapterError>;
}

pub struct RedisPubSub {
    client: redis::Client,
}

impl RedisPubSub {
    pub fn new(redis_url: &str) -> Result<Self, AdapterError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AdapterError::PubSub(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), AdapterError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AdapterError::PubSub(format!("connection failed: {e}")))?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| AdapterError::PubSub(format!("publish failed: {e}")))
    }

    async fn ready(&self) -> Result<(), AdapterError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::PubSub(format!("connection failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_redis_url() {
        let result = RedisPubSub::new("not-a-url");
        assert!(result.is_err());
    }
}
