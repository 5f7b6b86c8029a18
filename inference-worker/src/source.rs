use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use inference_common::document::Document;
use inference_common::kafka::consumer::{DocumentConsumer, MalformedDocument, Offset, OffsetErr};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("offset store failed: {0}")]
    OffsetStore(#[from] OffsetErr),
}

/// One unit pulled from the input stream: the decoded document (or what is
/// known about why it did not decode) plus the cursor to commit once its
/// outcome has been published.
pub struct Sourced<C> {
    pub payload: Result<Document, MalformedDocument>,
    pub cursor: C,
}

/// The consume side of the stream, behind a trait so the worker loop can be
/// exercised against an in-memory source in tests.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    type Cursor: Send + 'static;

    /// Pull up to `max_items` messages, waiting at most `max_wait`. An empty
    /// stream yields an empty batch, never an error.
    async fn pull(
        &self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<Sourced<Self::Cursor>>, SourceError>;

    /// Advance the durable read position past the given cursors. Must only
    /// be called once every record of the batch has been published.
    fn commit(&self, cursors: Vec<Self::Cursor>) -> Result<(), SourceError>;
}

#[async_trait]
impl DocumentSource for DocumentConsumer {
    type Cursor = Offset;

    async fn pull(
        &self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<Sourced<Offset>>, SourceError> {
        let batch = self.recv_batch(max_items, max_wait).await?;

        Ok(batch
            .into_iter()
            .map(|received| Sourced {
                payload: received.payload,
                cursor: received.offset,
            })
            .collect())
    }

    fn commit(&self, cursors: Vec<Offset>) -> Result<(), SourceError> {
        self.store_offsets(cursors)?;
        Ok(())
    }
}
