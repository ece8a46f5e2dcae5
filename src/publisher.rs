//! Progress/Artifact Publisher (C2): typed messages to a channel keyed
//! by `streamId`, with a guaranteed terminal message per job (I1).
//!
//! Built on the `adapters::pubsub::PubSub` trait this crate defines,
//! in the same "thin wrapper struct holding one shared client" idiom
//! `adapters::queue::RedisQueue` uses. The message shapes below
//! transcribe §6's "Pub/Sub (outbound)" table directly into
//! `serde`-tagged enums.

use std::sync::Arc;

use crate::adapters::PubSub;
use crate::errors::AdapterError;

/// §6 message taxonomy, outbound on a job's `streamId` channel.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Progress {
        message: String,
        progress: u8,
    },
    Typed(TypedMessage),
    Terminal {
        complete: bool,
        content: String,
        #[serde(rename = "isError")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum TypedMessage {
    #[serde(rename = "apiBlueprint")]
    ApiBlueprint { content: serde_json::Value },
    #[serde(rename = "deployment_triggered")]
    DeploymentTriggered {
        url: String,
        status: String,
        message: String,
    },
    #[serde(rename = "deployment_complete")]
    DeploymentComplete {
        url: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// LLM streaming messages live on a separate channel per job
/// (`llm-stream-<jobId>`), not on the job's `streamId` (§6).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum LlmStreamMessage {
    Chunk {
        #[serde(rename = "jobId")]
        job_id: String,
        chunk: String,
        done: bool,
        timestamp: i64,
    },
    Done {
        #[serde(rename = "jobId")]
        job_id: String,
        done: bool,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// The shared publisher (§5 "process-wide... owned exclusively by the
/// publisher subsystem"). Fire-and-forget: callers never await
/// subscriber acknowledgment (§4.2), they only await Redis accepting
/// the `PUBLISH` command.
pub struct Publisher {
    bus: Arc<dyn PubSub>,
}

impl Publisher {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self { bus }
    }

    /// Blocks until the publisher's underlying connection is
    /// established (§4.2 "ready barrier... resolved by the first
    /// successful connection event"). Call once at worker startup
    /// before any job is dispatched.
    pub async fn wait_ready(&self) -> Result<(), AdapterError> {
        self.bus.ready().await
    }

    pub async fn publish_progress(&self, stream_id: &str, message: &str, progress: u8) {
        let progress = progress.min(100);
        self.send(
            stream_id,
            StreamMessage::Progress {
                message: message.to_string(),
                progress,
            },
        )
        .await;
    }

    pub async fn publish_success(&self, stream_id: &str, content: &str) {
        self.send(
            stream_id,
            StreamMessage::Terminal {
                complete: true,
                content: content.to_string(),
                is_error: false,
            },
        )
        .await;
    }

    pub async fn publish_error(&self, stream_id: &str, content: &str) {
        self.send(
            stream_id,
            StreamMessage::Terminal {
                complete: true,
                content: content.to_string(),
                is_error: true,
            },
        )
        .await;
    }

    pub async fn publish_typed(&self, stream_id: &str, typed: TypedMessage) {
        self.send(stream_id, StreamMessage::Typed(typed)).await;
    }

    pub async fn publish_llm_chunk(&self, job_id: &str, chunk: &str, timestamp: i64) {
        let payload = LlmStreamMessage::Chunk {
            job_id: job_id.to_string(),
            chunk: chunk.to_string(),
            done: false,
            timestamp,
        };
        self.publish_raw(&format!("llm-stream-{job_id}"), &payload).await;
    }

    pub async fn publish_llm_done(&self, job_id: &str, timestamp: i64, error: Option<String>) {
        let payload = LlmStreamMessage::Done {
            job_id: job_id.to_string(),
            done: true,
            timestamp,
            error,
        };
        self.publish_raw(&format!("llm-stream-{job_id}"), &payload).await;
    }

    async fn send(&self, stream_id: &str, message: StreamMessage) {
        self.publish_raw(stream_id, &message).await;
    }

    async fn publish_raw(&self, channel: &str, payload: &impl serde::Serialize) {
        let encoded = match serde_json::to_string(payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode pub/sub message, dropping");
                return;
            }
        };
        if let Err(e) = self.bus.publish(channel, &encoded).await {
            // §4.2: publish failures are logged, never propagated —
            // the pipeline's own success/failure is decided by its own
            // control flow, not by whether the frontend heard about it.
            tracing::warn!(%channel, error = %e, "pub/sub publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct RecordingPubSub {
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PubSub for RecordingPubSub {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), AdapterError> {
            self.published
                .lock()
                .await
                .push((channel.to_string(), payload.to_string()));
            Ok(())
        }
        async fn ready(&self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    fn publisher() -> (Publisher, Arc<RecordingPubSub>) {
        let bus = Arc::new(RecordingPubSub {
            published: Mutex::new(Vec::new()),
        });
        (Publisher::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn progress_message_clamps_to_100() {
        let (publisher, bus) = publisher();
        publisher.publish_progress("s1", "working", 150).await;
        let published = bus.published.lock().await;
        assert!(published[0].1.contains("\"progress\":100"));
    }

    #[tokio::test]
    async fn terminal_success_sets_complete_and_not_error() {
        let (publisher, bus) = publisher();
        publisher.publish_success("s1", "Project created successfully").await;
        let published = bus.published.lock().await;
        assert!(published[0].1.contains("\"complete\":true"));
        assert!(published[0].1.contains("\"isError\":false"));
    }

    #[tokio::test]
    async fn terminal_error_sets_complete_and_is_error() {
        let (publisher, bus) = publisher();
        publisher.publish_error("s1", "No GitHub repository found").await;
        let published = bus.published.lock().await;
        assert!(published[0].1.contains("\"isError\":true"));
    }

    #[tokio::test]
    async fn typed_blueprint_message_tags_type() {
        let (publisher, bus) = publisher();
        publisher
            .publish_typed(
                "s1",
                TypedMessage::ApiBlueprint {
                    content: serde_json::json!({"endpoints": []}),
                },
            )
            .await;
        let published = bus.published.lock().await;
        assert!(published[0].1.contains("\"type\":\"apiBlueprint\""));
    }

    #[tokio::test]
    async fn publish_ordering_preserved_per_stream() {
        let (publisher, bus) = publisher();
        publisher.publish_progress("s1", "a", 10).await;
        publisher.publish_progress("s1", "b", 50).await;
        publisher.publish_success("s1", "done").await;
        let published = bus.published.lock().await;
        assert_eq!(published.len(), 3);
        assert!(published[0].1.contains("\"progress\":10"));
        assert!(published[1].1.contains("\"progress\":50"));
        assert!(published[2].1.contains("\"complete\":true"));
    }
}
