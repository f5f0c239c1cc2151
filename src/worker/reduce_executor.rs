//! # Reduce Task Executor
//!
//! Fan-in stage: waits for every dependency result blob to exist, combines
//! the chunk results into one composite prompt, runs a single generation
//! call, merges the generated partial record with the chunk arrays, and
//! persists the final record through the storage writer.
//!
//! A missing dependency is not a failure. Reduce messages are routinely
//! enqueued ahead of the slowest map task, so the executor reports
//! `MissingDependency` and lets the requeue protocol defer the whole
//! message without spending a generation call.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::generation::{GenerationRequest, Generator, ProtectedGenerator};
use crate::messaging::message::ReduceTask;
use crate::records::{dedup_by_key, ChunkResult, PartialRecord};
use crate::storage::blob::{BlobStore, Locator};
use crate::storage::writer::RecordWriter;

pub struct ReduceExecutor {
    blobs: Arc<dyn BlobStore>,
    generator: Arc<ProtectedGenerator>,
    writer: Arc<RecordWriter>,
}

impl ReduceExecutor {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        generator: Arc<ProtectedGenerator>,
        writer: Arc<RecordWriter>,
    ) -> Self {
        Self {
            blobs,
            generator,
            writer,
        }
    }

    pub async fn execute(&self, task: &ReduceTask) -> Result<()> {
        let dependencies = dedupe_uris(&task.dependency_result_uris);
        let expected = dependencies.len();

        // Existence checks only; a fetch here would waste I/O on the
        // common early-arrival race. Checks are independent reads, so they
        // run concurrently.
        let checks = futures::future::try_join_all(dependencies.iter().map(|uri| async move {
            let locator = Locator::parse(uri)?;
            Ok::<_, PipelineError>((uri, self.blobs.exists(&locator).await?))
        }))
        .await?;
        for (uri, present) in checks {
            if !present {
                debug!(issue_id = %task.issue_id, missing = %uri, "dependency not ready");
                return Err(PipelineError::missing_dependency(uri));
            }
        }

        let mut chunks = Vec::with_capacity(expected);
        for uri in &dependencies {
            let locator = Locator::parse(uri)?;
            let bytes = self.blobs.get(&locator).await?;
            chunks.push(ChunkResult::from_bytes(&bytes));
        }

        let prompt = compose_prompt(task, &chunks, expected);
        let response = self
            .generator
            .generate(
                GenerationRequest::single_user_turn(prompt).with_model(&task.generator_model),
            )
            .await?;

        let record = PartialRecord::from_generated(&response.text)
            .merge_chunks(&chunks)
            .into_record(&task.issue_id, &task.meeting)?;

        self.writer.write(&record).await?;
        info!(
            issue_id = %task.issue_id,
            record_id = %record.id,
            chunks = expected,
            attempt = task.attempt,
            "reduce record persisted"
        );
        Ok(())
    }
}

/// Order-preserving dedup of dependency locators.
fn dedupe_uris(uris: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    uris.iter()
        .filter(|uri| seen.insert(uri.as_str()))
        .cloned()
        .collect()
}

/// Composite prompt: caller instructions, meeting metadata, a
/// chunk-count/expected line, then the accumulated summary points and
/// participant names from every chunk.
fn compose_prompt(task: &ReduceTask, chunks: &[ChunkResult], expected: usize) -> String {
    let meeting = &task.meeting;
    let mut out = String::with_capacity(1024);
    out.push_str(&task.prompt);
    out.push_str("\n\n");
    out.push_str(&format!(
        "Meeting: {} ({}), date {}, {} speeches.\n",
        meeting.meeting_name, meeting.house, meeting.date, meeting.speech_count
    ));
    out.push_str(&format!(
        "Combining {} of {} chunk summaries.\n\n",
        chunks.len(),
        expected
    ));

    out.push_str("Summary points:\n");
    for chunk in chunks {
        if let Some(points) = &chunk.summary_points {
            for point in points {
                out.push_str("- ");
                out.push_str(point);
                out.push('\n');
            }
        }
    }

    let mut participants: Vec<String> = Vec::new();
    for chunk in chunks {
        participants.extend(chunk.participant_names());
    }
    let participants = dedup_by_key(participants, |p| p.clone());
    if !participants.is_empty() {
        out.push_str("\nParticipants: ");
        out.push_str(&participants.join(", "));
        out.push('\n');
    }
    out
}
