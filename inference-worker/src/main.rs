//! Consume documents from Kafka, run them through an inference endpoint and
//! publish the results.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use inference_common::health::{HealthHandle, HealthRegistry};
use inference_common::inference::ModelParameters;
use inference_common::kafka::config::ConsumerConfig;
use inference_common::kafka::consumer::DocumentConsumer;
use inference_common::kafka::producer::create_kafka_producer;
use inference_common::kafka::DOCUMENTS_TOPIC;
use inference_common::metrics::{serve, setup_metrics_router};
use inference_common::retry::RetryPolicy;
use inference_worker::config::Config;
use inference_worker::inference::InferenceClient;
use inference_worker::sink::{KafkaResultSink, PrintSink, ResultSink};
use inference_worker::worker::InferenceWorker;

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "document inference worker"
}

/// Resolves when SIGTERM or SIGINT is received.
async fn graceful_shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    }
}

/// Run the worker until it fails or a shutdown signal arrives, then drain:
/// stop pulling, let the in-flight batch reach its commit, give up after the
/// drain timeout. An abandoned batch is uncommitted and will replay on the
/// next startup.
async fn run_worker<K: ResultSink + 'static>(
    config: &Config,
    consumer: DocumentConsumer,
    client: InferenceClient,
    sink: K,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    let parameters = ModelParameters {
        model: config.model_id.0.clone(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    };

    let worker = InferenceWorker::new(
        consumer,
        Arc::new(client),
        sink,
        retry_policy,
        parameters,
        config.max_batch_size,
        config.batch_wait.0,
        config.max_concurrent_requests,
        config.publish_max_retries,
        shutdown.clone(),
        liveness,
    );

    let mut worker_handle = tokio::spawn(async move { worker.run().await });

    tokio::select! {
        result = &mut worker_handle => {
            if let Err(err) = result.expect("worker task panicked") {
                error!("worker exited with error: {}", err);
                std::process::exit(1);
            }
        }
        _ = graceful_shutdown() => {
            info!("shutdown signal received, draining in-flight batch");
            shutdown.cancel();

            match tokio::time::timeout(config.drain_timeout.0, &mut worker_handle).await {
                Ok(result) => match result.expect("worker task panicked") {
                    Ok(()) => info!("worker drained cleanly"),
                    Err(err) => {
                        error!("worker failed while draining: {}", err);
                        std::process::exit(1);
                    }
                },
                Err(_) => warn!(
                    "drain timeout elapsed, abandoning in-flight batch (offsets not committed)"
                ),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("starting document inference worker");

    ConsumerConfig::set_defaults("inference-worker", DOCUMENTS_TOPIC);
    let config = Config::init_from_env().expect("invalid configuration:");

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .maximum_jitter(config.retry_policy.maximum_jitter.0)
    .max_attempts(config.retry_policy.max_attempts)
    .provide();

    let liveness = HealthRegistry::new("liveness");

    let consumer = DocumentConsumer::new(&config.kafka, config.consumer.clone())
        .expect("failed to create kafka consumer");

    let client = InferenceClient::new(&config.inference_endpoint, config.request_timeout.0)
        .expect("invalid inference endpoint");
    client
        .healthcheck()
        .await
        .expect("inference endpoint is not reachable");

    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let shutdown = CancellationToken::new();

    let bind = config.bind();
    let status_registry = liveness.clone();
    let router = setup_metrics_router()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(status_registry.get_status())));
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    if config.print_sink {
        run_worker(
            &config,
            consumer,
            client,
            PrintSink,
            retry_policy,
            worker_liveness,
            shutdown,
        )
        .await;
    } else {
        let producer_liveness = liveness
            .register("rdkafka".to_string(), time::Duration::seconds(30))
            .await;
        let producer = create_kafka_producer(&config.kafka, producer_liveness)
            .await
            .expect("failed to connect to kafka brokers");
        let sink = KafkaResultSink::new(producer, config.output_topic.0.clone());

        run_worker(
            &config,
            consumer,
            client,
            sink,
            retry_policy,
            worker_liveness,
            shutdown,
        )
        .await;
    }
}
