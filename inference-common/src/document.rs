use std::collections;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::Visitor, Deserialize, Serialize};
use thiserror::Error;

use crate::kafka_messages::{deserialize_datetime, serialize_datetime};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ContentType")]
pub struct ParseContentTypeError(pub String);

/// The kind of document a producer put on the input topic.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ContentType {
    EarningsReport,
    Filing,
    News,
    Other,
}

/// Allow casting `ContentType` from the wire representation.
impl FromStr for ContentType {
    type Err = ParseContentTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "earnings-report" => Ok(ContentType::EarningsReport),
            "filing" => Ok(ContentType::Filing),
            "news" => Ok(ContentType::News),
            "other" => Ok(ContentType::Other),
            invalid => Err(ParseContentTypeError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ContentType::EarningsReport => write!(f, "earnings-report"),
            ContentType::Filing => write!(f, "filing"),
            ContentType::News => write!(f, "news"),
            ContentType::Other => write!(f, "other"),
        }
    }
}

struct ContentTypeVisitor;

impl<'de> Visitor<'de> for ContentTypeVisitor {
    type Value = ContentType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the string representation of ContentType")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match ContentType::from_str(s) {
            Ok(content_type) => Ok(content_type),
            Err(_) => Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(s),
                &self,
            )),
        }
    }
}

/// Deserialize required to read `ContentType` from input messages.
impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(ContentTypeVisitor)
    }
}

impl Serialize for ContentType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A document as read from the input topic. Immutable once consumed; the
/// worker only ever derives inference requests and result records from it.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub metadata: collections::HashMap<String, String>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime"
    )]
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::prelude::*;

    #[test]
    fn test_content_type_from_str() {
        assert_eq!(
            ContentType::from_str("earnings-report").unwrap(),
            ContentType::EarningsReport
        );
        assert_eq!(ContentType::from_str("FILING").unwrap(), ContentType::Filing);
        assert_eq!(ContentType::from_str("news").unwrap(), ContentType::News);
        assert_eq!(ContentType::from_str("other").unwrap(), ContentType::Other);
        assert_eq!(
            ContentType::from_str("spreadsheet"),
            Err(ParseContentTypeError("spreadsheet".to_owned()))
        );
    }

    #[test]
    fn test_document_deserialization() {
        let raw = r#"{
            "id": "doc-123",
            "content": "Apple reported Q4 revenue of $89.5B, up 1% YoY",
            "content_type": "earnings-report",
            "metadata": {"tenant_id": "financial-firm-123"},
            "timestamp": "2025-01-15T09:30:00Z"
        }"#;

        let document: Document = serde_json::from_str(raw).unwrap();

        assert_eq!(document.id, "doc-123");
        assert_eq!(document.content_type, ContentType::EarningsReport);
        assert_eq!(
            document.metadata.get("tenant_id"),
            Some(&"financial-firm-123".to_owned())
        );
        assert_eq!(
            document.timestamp,
            Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_document_deserialization_defaults_metadata() {
        let raw = r#"{
            "id": "doc-123",
            "content": "some filing text",
            "content_type": "filing",
            "timestamp": "2025-01-15T09:30:00Z"
        }"#;

        let document: Document = serde_json::from_str(raw).unwrap();
        assert!(document.metadata.is_empty());
    }

    #[test]
    fn test_document_rejects_unknown_content_type() {
        let raw = r#"{
            "id": "doc-123",
            "content": "text",
            "content_type": "spreadsheet",
            "timestamp": "2025-01-15T09:30:00Z"
        }"#;

        assert!(serde_json::from_str::<Document>(raw).is_err());
    }
}
