use async_trait::async_trait;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::FutureProducer;
use thiserror::Error;
use tracing::info;

use inference_common::kafka::producer::{publish_results, KafkaContext, KafkaProduceError};
use inference_common::kafka_messages::results::ResultRecord;

#[derive(Error, Debug)]
pub enum SinkError {
    /// The output topic could not take the record right now; retrying the
    /// batch may succeed.
    #[error("output topic unavailable: {0}")]
    Unavailable(String),
    /// The output topic will never take this record (e.g. over the broker's
    /// message size limit).
    #[error("record rejected by output topic: {0}")]
    Rejected(String),
}

/// The produce side of the stream. At-least-once: callers must treat an
/// `Unavailable` as unknown outcome and retry, relying on `document_id`
/// keying for downstream dedup.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Publish a batch, returning per-record results lined up with the
    /// input slice.
    async fn send_batch(&self, records: &[ResultRecord]) -> Vec<Result<(), SinkError>>;
}

pub struct KafkaResultSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaResultSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl ResultSink for KafkaResultSink {
    async fn send_batch(&self, records: &[ResultRecord]) -> Vec<Result<(), SinkError>> {
        publish_results(&self.producer, &self.topic, records)
            .await
            .into_iter()
            .map(|result| result.map_err(SinkError::from))
            .collect()
    }
}

impl From<KafkaProduceError> for SinkError {
    fn from(error: KafkaProduceError) -> Self {
        match &error {
            KafkaProduceError::SerializationError { .. } => SinkError::Rejected(error.to_string()),
            KafkaProduceError::KafkaProduceError { error: kafka_error }
                if matches!(
                    kafka_error.rdkafka_error_code(),
                    Some(RDKafkaErrorCode::MessageSizeTooLarge)
                        | Some(RDKafkaErrorCode::InvalidMessageSize)
                ) =>
            {
                SinkError::Rejected(error.to_string())
            }
            _ => SinkError::Unavailable(error.to_string()),
        }
    }
}

/// Sink that logs records instead of producing them, for local development.
pub struct PrintSink;

#[async_trait]
impl ResultSink for PrintSink {
    async fn send_batch(&self, records: &[ResultRecord]) -> Vec<Result<(), SinkError>> {
        for record in records {
            info!("result: {:?}", record);
        }

        records.iter().map(|_| Ok(())).collect()
    }
}
