//! # Map Task Executor
//!
//! Summarizes one source chunk: fetch the input blob, run a single
//! rate-limited generation call with the chunk text as the only user turn,
//! and write the raw generated text to the result locator. The result key
//! is deterministic, so a retried map task overwrites its own output.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::generation::{GenerationRequest, Generator, ProtectedGenerator};
use crate::messaging::message::MapTask;
use crate::storage::blob::{BlobStore, Locator};

pub struct MapExecutor {
    blobs: Arc<dyn BlobStore>,
    generator: Arc<ProtectedGenerator>,
}

impl MapExecutor {
    pub fn new(blobs: Arc<dyn BlobStore>, generator: Arc<ProtectedGenerator>) -> Self {
        Self { blobs, generator }
    }

    pub async fn execute(&self, task: &MapTask) -> Result<()> {
        let source = Locator::parse(&task.source_uri)?;
        let result = Locator::parse(&task.result_uri)?;

        let bytes = self.blobs.get(&source).await?;
        let text = String::from_utf8(bytes).map_err(|e| {
            PipelineError::blob("get", &task.source_uri, format!("not valid utf-8: {e}"))
        })?;
        debug!(
            source_uri = %task.source_uri,
            chars = text.chars().count(),
            "fetched map input"
        );

        let response = self
            .generator
            .generate(
                GenerationRequest::single_user_turn(text).with_model(&task.generator_model),
            )
            .await?;

        self.blobs
            .put(&result, response.text.into_bytes(), "application/json")
            .await?;
        info!(
            result_uri = %task.result_uri,
            attempt = task.attempt,
            "map result written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerSettings;
    use crate::generation::{ChatMessage, GenerationResponse, Role};
    use crate::resilience::{CircuitBreaker, TokenBucket};
    use crate::storage::blob::MemoryBlobStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::Duration;

    struct EchoGenerator {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
            assert_eq!(request.messages.len(), 1);
            assert!(matches!(request.messages[0], ChatMessage { role: Role::User, .. }));
            let text = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .expect("unexpected generate call");
            Ok(GenerationResponse {
                text,
                raw: serde_json::Value::Null,
            })
        }
    }

    fn protected(inner: Arc<dyn Generator>) -> Arc<ProtectedGenerator> {
        Arc::new(ProtectedGenerator::new(
            inner,
            Arc::new(TokenBucket::new(100.0, 100.0)),
            CircuitBreaker::new("generation", CircuitBreakerSettings::default()),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_map_writes_generated_text_to_result_uri() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let source = Locator::parse("blob://minutes/chunks/c1.txt").unwrap();
        blobs
            .put(&source, b"speaker remarks".to_vec(), "text/plain")
            .await
            .unwrap();

        let generator = Arc::new(EchoGenerator {
            responses: Mutex::new(vec![r#"{"summaryPoints":["p1"]}"#.to_string()]),
        });
        let executor = MapExecutor::new(blobs.clone(), protected(generator));

        let task = MapTask {
            source_uri: "blob://minutes/chunks/c1.txt".to_string(),
            result_uri: "blob://minutes/results/c1.json".to_string(),
            generator: "gen".to_string(),
            generator_model: "gen-1".to_string(),
            attempt: 0,
            metadata: None,
        };
        executor.execute(&task).await.unwrap();

        let result = Locator::parse("blob://minutes/results/c1.json").unwrap();
        let written = blobs.get(&result).await.unwrap();
        assert_eq!(written, br#"{"summaryPoints":["p1"]}"#);
    }

    #[tokio::test]
    async fn test_missing_source_blob_is_an_error() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let generator = Arc::new(EchoGenerator {
            responses: Mutex::new(vec![]),
        });
        let executor = MapExecutor::new(blobs, protected(generator));

        let task = MapTask {
            source_uri: "blob://minutes/chunks/missing.txt".to_string(),
            result_uri: "blob://minutes/results/missing.json".to_string(),
            generator: "gen".to_string(),
            generator_model: "gen-1".to_string(),
            attempt: 2,
            metadata: None,
        };
        let err = executor.execute(&task).await.unwrap_err();
        assert!(matches!(err, PipelineError::Blob { .. }));
    }
}
