use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use inference_common::kafka::config::{ConsumerConfig, KafkaConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(from = "OUTPUT_TOPIC", default = "document_results")]
    pub output_topic: NonEmptyString,

    #[envconfig(from = "INFERENCE_ENDPOINT", default = "http://localhost:8000")]
    pub inference_endpoint: String,

    #[envconfig(from = "MODEL_ID", default = "mistralai/Mistral-7B-Instruct-v0.2")]
    pub model_id: NonEmptyString,

    #[envconfig(from = "MAX_TOKENS", default = "100")]
    pub max_tokens: u32,

    #[envconfig(from = "TEMPERATURE", default = "0.7")]
    pub temperature: f32,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "MAX_BATCH_SIZE", default = "32")]
    pub max_batch_size: usize,

    #[envconfig(from = "BATCH_WAIT", default = "1000")]
    pub batch_wait: EnvMsDuration,

    #[envconfig(from = "MAX_CONCURRENT_REQUESTS", default = "8")]
    pub max_concurrent_requests: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(from = "PUBLISH_MAX_RETRIES", default = "3")]
    pub publish_max_retries: u32,

    #[envconfig(from = "DRAIN_TIMEOUT", default = "30000")]
    pub drain_timeout: EnvMsDuration,

    // Log results instead of producing them; for local development without
    // a full output topic set up.
    #[envconfig(from = "PRINT_SINK", default = "false")]
    pub print_sink: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "250")]
    pub maximum_jitter: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
