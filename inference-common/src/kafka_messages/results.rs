use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::serialize_datetime;
use crate::document::Document;
use crate::inference::InferenceOutcome;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ResultStatus {
    Ok,
    Failed,
}

/// The record published to the output topic, exactly once per document per
/// committed batch. `output` and `token_count` are present iff the document
/// was processed successfully, `error` iff it was not. Keyed on the topic by
/// `document_id`, which doubles as the dedup key for downstream consumers
/// seeing at-least-once replays.
#[derive(Serialize, Debug, Clone)]
pub struct ResultRecord {
    pub document_id: String,
    #[serde(serialize_with = "serialize_status")]
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    pub processing_time_ms: u64,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    /// Encode a terminal outcome for a document. Total over both outcome
    /// variants and free of I/O, so it can be tested without any of the
    /// network layers.
    pub fn from_outcome(
        document: &Document,
        outcome: &InferenceOutcome,
        attempt_count: u32,
        elapsed: Duration,
    ) -> Self {
        match outcome {
            InferenceOutcome::Success {
                text, token_count, ..
            } => Self {
                document_id: document.id.clone(),
                status: ResultStatus::Ok,
                output: Some(text.clone()),
                token_count: Some(*token_count),
                processing_time_ms: elapsed.as_millis() as u64,
                attempt_count,
                error: None,
                timestamp: Utc::now(),
            },
            InferenceOutcome::Failure { kind, message } => Self {
                document_id: document.id.clone(),
                status: ResultStatus::Failed,
                output: None,
                token_count: None,
                processing_time_ms: elapsed.as_millis() as u64,
                attempt_count,
                error: Some(format!("{}: {}", kind, message)),
                timestamp: Utc::now(),
            },
        }
    }

    /// Terminal record for an input message that never decoded into a
    /// `Document`. No inference was attempted.
    pub fn malformed(document_id: String, detail: &str) -> Self {
        Self {
            document_id,
            status: ResultStatus::Failed,
            output: None,
            token_count: None,
            processing_time_ms: 0,
            attempt_count: 0,
            error: Some(format!("malformed document: {}", detail)),
            timestamp: Utc::now(),
        }
    }
}

fn serialize_status<S>(status: &ResultStatus, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let status_str = match status {
        ResultStatus::Ok => "ok",
        ResultStatus::Failed => "failed",
    };
    serializer.serialize_str(status_str)
}
