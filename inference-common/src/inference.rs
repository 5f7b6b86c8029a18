use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::document::Document;

/// Model identifier and sampling settings applied to every request this
/// worker instance sends to its inference endpoint.
#[derive(Debug, Clone)]
pub struct ModelParameters {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Body of an OpenAI-compatible completions request. Derived from a
/// `Document` once and reused verbatim for every attempt.
#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl InferenceRequest {
    pub fn for_document(document: &Document, parameters: &ModelParameters) -> Self {
        let prompt = format!(
            "Extract the key financial information from the following {} document:\n\n{}",
            document.content_type, document.content
        );

        Self {
            model: parameters.model.clone(),
            prompt,
            max_tokens: parameters.max_tokens,
            temperature: parameters.temperature,
        }
    }
}

/// Classification of a failed inference attempt. The retry policy keys its
/// decisions off this, so the HTTP layer must fold every error it can
/// encounter into one of these.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum FailureKind {
    /// The request did not complete within the configured timeout.
    Timeout,
    /// The endpoint could not be reached, or answered with a server error.
    Unavailable,
    /// The endpoint answered, but not with a usable completion.
    InvalidResponse,
    /// The endpoint asked us to back off, possibly telling us for how long.
    RateLimited { retry_after: Option<Duration> },
    /// The retry budget ran out; terminal.
    ExhaustedRetries,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Unavailable => write!(f, "unavailable"),
            FailureKind::InvalidResponse => write!(f, "invalid response"),
            FailureKind::RateLimited { .. } => write!(f, "rate limited"),
            FailureKind::ExhaustedRetries => write!(f, "exhausted retries"),
        }
    }
}

/// What a single delivery attempt produced for a document. Never an error:
/// callers get a uniform value to encode, whatever happened on the wire.
#[derive(Debug, PartialEq, Clone)]
pub enum InferenceOutcome {
    Success {
        text: String,
        token_count: u64,
        latency: Duration,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}
