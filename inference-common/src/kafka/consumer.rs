use std::sync::{Arc, Weak};
use std::time::Duration;

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};
use thiserror::Error;
use tracing::warn;

use crate::document::Document;
use crate::kafka::config::{ConsumerConfig, KafkaConfig};

/// Consumer-group subscriber for the input documents topic.
///
/// Auto offset storing is disabled: the worker stores offsets explicitly
/// once the corresponding results were published, and librdkafka's
/// auto-commit then persists whatever was stored. That keeps redelivery
/// after a crash bounded to the in-flight batch.
#[derive(Clone)]
pub struct DocumentConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// An input message that did not decode into a `Document`. The `id` field is
/// salvaged from the raw JSON when present, so the worker can still publish
/// a keyed terminal failure for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedDocument {
    pub document_id: Option<String>,
    pub detail: String,
}

/// One message pulled from the input topic, malformed or not, along with the
/// offset to store once its outcome has been published.
pub struct ReceivedDocument {
    pub payload: Result<Document, MalformedDocument>,
    pub offset: Offset,
}

impl DocumentConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            )
            .set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Receive up to `max_items` messages, waiting at most `max_wait`. An
    /// empty topic yields an empty batch, never an error; a broker error is
    /// only surfaced when nothing was received at all.
    pub async fn recv_batch(
        &self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedDocument>, KafkaError> {
        let mut batch = Vec::with_capacity(max_items);
        let deadline = tokio::time::Instant::now() + max_wait;

        while batch.len() < max_items {
            match tokio::time::timeout_at(deadline, self.inner.consumer.recv()).await {
                Ok(Ok(message)) => {
                    let offset = Offset {
                        handle: Arc::downgrade(&self.inner),
                        partition: message.partition(),
                        offset: message.offset(),
                    };
                    batch.push(ReceivedDocument {
                        payload: decode_payload(message.payload()),
                        offset,
                    });
                }
                Ok(Err(err)) => {
                    if batch.is_empty() {
                        return Err(err);
                    }
                    warn!("kafka receive error mid-batch, returning partial batch: {}", err);
                    break;
                }
                // max_wait elapsed, return whatever we have
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    /// Store the offsets of a fully-published batch. Call order does not
    /// matter within the batch; librdkafka commits the highest stored offset
    /// per partition on its next auto-commit tick.
    pub fn store_offsets(&self, offsets: Vec<Offset>) -> Result<(), OffsetErr> {
        for offset in offsets {
            offset.store()?;
        }
        Ok(())
    }
}

fn decode_payload(payload: Option<&[u8]>) -> Result<Document, MalformedDocument> {
    let Some(payload) = payload else {
        return Err(MalformedDocument {
            document_id: None,
            detail: "empty payload".to_owned(),
        });
    };

    match serde_json::from_slice::<Document>(payload) {
        Ok(document) => Ok(document),
        Err(err) => Err(MalformedDocument {
            document_id: salvage_document_id(payload),
            detail: err.to_string(),
        }),
    }
}

/// Best-effort extraction of the `id` field from a payload that failed to
/// decode as a `Document`.
fn salvage_document_id(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("id")?
        .as_str()
        .map(str::to_owned)
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}
