use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::health::HealthHandle;
use crate::kafka::config::KafkaConfig;
use crate::kafka_messages::results::ResultRecord;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata; an unreachable
    // cluster must fail startup, not the first batch.
    match producer
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(err) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", err);
            return Err(err);
        }
    }

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Publish a batch of result records, keyed by document id so downstream
/// consumers can deduplicate at-least-once replays. All sends are enqueued
/// before any acknowledgement is awaited; the returned vector lines up with
/// the input slice.
pub async fn publish_results<C: ClientContext + 'static>(
    producer: &FutureProducer<C>,
    topic: &str,
    records: &[ResultRecord],
) -> Vec<Result<(), KafkaProduceError>> {
    let mut sends = Vec::with_capacity(records.len());

    for record in records {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(error) => {
                sends.push(Err(KafkaProduceError::SerializationError { error }));
                continue;
            }
        };

        let future_record = FutureRecord {
            topic,
            key: Some(&record.document_id),
            payload: Some(&payload),
            timestamp: None,
            partition: None,
            headers: None,
        };

        match producer.send_result(future_record) {
            Ok(handle) => sends.push(Ok(handle)),
            Err((error, _)) => sends.push(Err(KafkaProduceError::KafkaProduceError { error })),
        }
    }

    let mut results = Vec::with_capacity(sends.len());
    for send in sends {
        match send {
            Ok(handle) => match handle.await {
                Ok(Ok(_)) => results.push(Ok(())),
                Ok(Err((error, _))) => {
                    results.push(Err(KafkaProduceError::KafkaProduceError { error }))
                }
                Err(_) => results.push(Err(KafkaProduceError::KafkaProduceCanceled)),
            },
            Err(error) => results.push(Err(error)),
        }
    }

    results
}
