use std::sync::Arc;
use std::time::Duration;

use tokio::sync;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use inference_common::document::Document;
use inference_common::health::HealthHandle;
use inference_common::inference::{
    FailureKind, InferenceOutcome, InferenceRequest, ModelParameters,
};
use inference_common::kafka_messages::results::ResultRecord;
use inference_common::retry::{RetryDecision, RetryPolicy, RetryState};

use crate::error::WorkerError;
use crate::inference::InferenceProvider;
use crate::sink::{ResultSink, SinkError};
use crate::source::{DocumentSource, Sourced};

/// How long to pause the loop after a failed pull before trying again.
const PULL_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// A worker to poll the documents topic and fan each batch out to a bounded
/// pool of inference tasks. One cycle pulls a batch, dispatches it, waits
/// for every document to reach a terminal outcome, publishes the results
/// and finally commits; offsets are only committed once every record of the
/// batch has been acknowledged by the output topic.
pub struct InferenceWorker<S, P, K>
where
    S: DocumentSource,
    P: InferenceProvider + 'static,
    K: ResultSink,
{
    /// Where documents come from.
    source: S,
    /// What runs the actual inference calls.
    provider: Arc<P>,
    /// Where result records go.
    sink: K,
    /// The retry policy consulted on every failed inference attempt.
    retry_policy: RetryPolicy,
    /// Model identifier and sampling settings for derived requests.
    parameters: ModelParameters,
    /// Upper bound on documents pulled per cycle.
    max_batch_size: usize,
    /// Upper bound on the time spent waiting for a batch to fill.
    batch_wait: Duration,
    /// Size of the inference task pool. This is the only admission control
    /// in front of the endpoint.
    max_concurrent_requests: usize,
    /// How often to re-send a batch the output topic would not take.
    publish_max_retries: u32,
    /// Permits for the inference task pool.
    semaphore: Arc<sync::Semaphore>,
    /// Checked at every cycle boundary; a cancelled token drains the worker.
    shutdown: CancellationToken,
    /// The liveness check handle, reported once per cycle.
    liveness: HealthHandle,
}

impl<S, P, K> InferenceWorker<S, P, K>
where
    S: DocumentSource,
    P: InferenceProvider + 'static,
    K: ResultSink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        provider: Arc<P>,
        sink: K,
        retry_policy: RetryPolicy,
        parameters: ModelParameters,
        max_batch_size: usize,
        batch_wait: Duration,
        max_concurrent_requests: usize,
        publish_max_retries: u32,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            provider,
            sink,
            retry_policy,
            parameters,
            max_batch_size,
            batch_wait,
            max_concurrent_requests,
            publish_max_retries,
            semaphore: Arc::new(sync::Semaphore::new(max_concurrent_requests)),
            shutdown,
            liveness,
        }
    }

    /// Run this worker to continuously process documents as they arrive.
    /// Returns `Ok(())` once shutdown is signalled and the in-flight batch
    /// has been committed; only publish/commit failures past their retry
    /// budget make it return an error.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let report_semaphore_utilization = || {
            metrics::gauge!("inference_worker_saturation_percent").set(
                1f64 - self.semaphore.available_permits() as f64
                    / self.max_concurrent_requests as f64,
            );
        };

        loop {
            if self.shutdown.is_cancelled() {
                info!("shutdown signalled, no further batches will be pulled");
                return Ok(());
            }

            self.liveness.report_healthy().await;
            report_semaphore_utilization();

            let batch = match self.source.pull(self.max_batch_size, self.batch_wait).await {
                Ok(batch) => batch,
                Err(err) => {
                    // Broker trouble pauses throughput; it must not lose
                    // documents or kill the loop.
                    metrics::counter!("inference_pull_errors_total").increment(1);
                    error!("failed to pull documents: {}", err);
                    tokio::time::sleep(PULL_ERROR_PAUSE).await;
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            self.process_batch(batch).await?;
        }
    }

    /// Take one batch from pulled to committed. Every document reaches a
    /// terminal outcome before anything is published, and nothing is
    /// committed before every publish was acknowledged.
    async fn process_batch(&self, batch: Vec<Sourced<S::Cursor>>) -> Result<(), WorkerError> {
        metrics::gauge!("inference_batch_size").set(batch.len() as f64);

        let mut cursors = Vec::with_capacity(batch.len());
        let mut records = Vec::with_capacity(batch.len());
        let mut handles = Vec::new();

        for sourced in batch {
            cursors.push(sourced.cursor);

            match sourced.payload {
                Ok(document) => {
                    let permit = self
                        .semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore has been closed");
                    let provider = self.provider.clone();
                    let retry_policy = self.retry_policy.clone();
                    let parameters = self.parameters.clone();

                    handles.push(tokio::spawn(async move {
                        let record =
                            process_document(provider, retry_policy, parameters, document).await;
                        drop(permit);
                        record
                    }));
                }
                Err(malformed) => {
                    metrics::counter!("inference_documents_malformed_total").increment(1);
                    match malformed.document_id {
                        Some(document_id) => {
                            warn!("malformed document {}: {}", document_id, malformed.detail);
                            records.push(ResultRecord::malformed(document_id, &malformed.detail));
                        }
                        // Without an id there is nothing to key a terminal
                        // record by; the offset still commits with the batch.
                        None => warn!(
                            "skipping malformed message with no document id: {}",
                            malformed.detail
                        ),
                    }
                }
            }
        }

        for handle in handles {
            records.push(handle.await.expect("inference task panicked"));
        }

        self.publish_batch(&records).await?;

        self.source.commit(cursors)?;
        metrics::counter!("inference_batches_committed_total").increment(1);

        Ok(())
    }

    /// Publish the batch's records, re-sending the whole batch while the
    /// output topic is unavailable. Running out of publish retries
    /// escalates: committing offsets for unpublished results would lose
    /// them, so the worker stops and the batch replays after restart.
    async fn publish_batch(&self, records: &[ResultRecord]) -> Result<(), WorkerError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            let results = self.sink.send_batch(records).await;

            let mut unavailable: Option<String> = None;
            for (record, result) in records.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(SinkError::Rejected(reason)) => {
                        // The topic will never take this record; a retry
                        // cannot fix it.
                        metrics::counter!("inference_results_rejected_total").increment(1);
                        error!(
                            "dropping rejected result for document {}: {}",
                            record.document_id, reason
                        );
                    }
                    Err(SinkError::Unavailable(reason)) => {
                        unavailable = Some(reason);
                    }
                }
            }

            let Some(reason) = unavailable else {
                metrics::counter!("inference_results_published_total")
                    .increment(records.len() as u64);
                return Ok(());
            };

            attempt += 1;
            if attempt > self.publish_max_retries {
                return Err(WorkerError::PublishFailed {
                    attempts: attempt,
                    reason,
                });
            }

            metrics::counter!("inference_publish_retries_total").increment(1);
            let delay = self.retry_policy.retry_interval(attempt, None);
            warn!(
                "output topic unavailable ({}), retrying publish of {} records in {:?}",
                reason,
                records.len(),
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Drive one document to a terminal outcome: run inference attempts under
/// the retry policy until one succeeds or the policy gives up, then encode
/// the result. Failures never escape as errors; a document that cannot be
/// processed becomes a `failed` record.
async fn process_document<P: InferenceProvider>(
    provider: Arc<P>,
    retry_policy: RetryPolicy,
    parameters: ModelParameters,
    document: Document,
) -> ResultRecord {
    let labels = [("content_type", document.content_type.to_string())];
    metrics::counter!("inference_documents_received_total", &labels).increment(1);

    let request = InferenceRequest::for_document(&document, &parameters);
    let started = tokio::time::Instant::now();
    let mut state = RetryState::new();

    loop {
        let outcome = provider.infer(&request).await;
        state.record_attempt();

        match outcome {
            InferenceOutcome::Success { .. } => {
                metrics::counter!("inference_documents_completed_total", &labels).increment(1);
                metrics::histogram!("inference_processing_duration_seconds", &labels)
                    .record(started.elapsed().as_secs_f64());

                return ResultRecord::from_outcome(
                    &document,
                    &outcome,
                    state.attempts(),
                    started.elapsed(),
                );
            }
            InferenceOutcome::Failure {
                ref kind,
                ref message,
            } => {
                metrics::counter!("inference_attempt_failures_total", "kind" => kind.to_string())
                    .increment(1);

                match retry_policy.decide(&state, kind) {
                    RetryDecision::Retry { delay } => {
                        metrics::counter!("inference_retries_total", &labels).increment(1);
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        metrics::counter!("inference_documents_failed_total", &labels).increment(1);
                        let folded = InferenceOutcome::Failure {
                            kind: FailureKind::ExhaustedRetries,
                            message: format!(
                                "gave up after {} attempts: {}",
                                state.attempts(),
                                message
                            ),
                        };

                        return ResultRecord::from_outcome(
                            &document,
                            &folded,
                            state.attempts(),
                            started.elapsed(),
                        );
                    }
                }
            }
        }
    }
}
