//! Object store adapter (C1 / §6 "a flat blob namespace"): mirrors
//! sandbox files under `{bucket}/{projectId}/` with an optional sibling
//! `…metadata.json` object per file (§6's "for later knowledge-base
//! ingestion").
//!
//! `aws-sdk-s3` is pinned to the same `=1.65.0` the pack's
//! `golemcloud-golem/Cargo.toml` pins, for the same reason noted there:
//! newer releases were observed failing against S3-compatible test
//! doubles (e.g. localstack/minio), which this worker's own adapter
//! tests would otherwise hit.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::errors::AdapterError;

#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub project_id: String,
    pub user_id: String,
    pub language: Option<String>,
    pub filepath: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: Vec<u8>,
        metadata: Option<ObjectMetadata>,
    ) -> Result<(), AdapterError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, AdapterError>;

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, AdapterError>;
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub async fn new(region: String) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .load()
            .await;
        Self {
            client: Client::new(&config),
        }
    }
}

/// Project-scoped prefix per §6: `{projectId}/...`. The bucket itself
/// is the configured `OBJECT_STORE_BUCKET`; this prefix is joined under it.
pub fn project_prefix(project_id: &str) -> String {
    format!("{project_id}/")
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: Vec<u8>,
        metadata: Option<ObjectMetadata>,
    ) -> Result<(), AdapterError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|e| AdapterError::ObjectStore(format!("put_object {key} failed: {e}")))?;

        if let Some(metadata) = metadata {
            let sidecar_key = format!("{key}.metadata.json");
            let body = serde_json::json!({
                "projectid": metadata.project_id,
                "userid": metadata.user_id,
                "language": metadata.language,
                "filepath": metadata.filepath,
            });
            let bytes = serde_json::to_vec(&body)
                .map_err(|e| AdapterError::ObjectStore(format!("metadata encode failed: {e}")))?;
            self.client
                .put_object()
                .bucket(bucket)
                .key(&sidecar_key)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map_err(|e| {
                    AdapterError::ObjectStore(format!("put_object {sidecar_key} failed: {e}"))
                })?;
        }

        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, AdapterError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AdapterError::ObjectStore(format!("get_object {key} failed: {e}")))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| AdapterError::ObjectStore(format!("read body {key} failed: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, AdapterError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| AdapterError::ObjectStore(format!("list_objects failed: {e}")))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_prefix_is_trailing_slash_scoped() {
        assert_eq!(project_prefix("p1"), "p1/");
    }
}
