//! Queue message decoding.
//!
//! Payloads arrive in several shapes depending on the publisher: an
//! already-parsed mapping, raw bytes, text, or a chunked body that must be
//! reassembled in order. Publishers have also been observed to double-encode
//! (a JSON string containing JSON) and to serialize with single quotes, so
//! decoding peels one string layer and falls back to a permissive JSON5
//! parse before giving up.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerError;
use crate::status::JobKey;

/// A job notification as published by the upload side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub blob: BlobRef,
}

/// Source object reference inside a job request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl JobRequest {
    /// Identity under which the job's status record is looked up.
    /// An explicit id wins over the source url.
    pub fn key(&self) -> Option<JobKey> {
        if let Some(id) = self.id.as_deref().filter(|s| !s.is_empty()) {
            return Some(JobKey::Id(id.to_string()));
        }
        self.url
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|url| JobKey::Url(url.to_string()))
    }
}

/// The shapes a queue body can arrive in.
#[derive(Clone, Debug)]
pub enum MessageBody {
    /// Already-parsed JSON mapping
    Mapping(serde_json::Map<String, Value>),
    /// Raw byte payload
    Bytes(Bytes),
    /// Text payload
    Text(String),
    /// Chunked payload, reassembled in delivery order
    Chunks(Vec<Chunk>),
}

/// One fragment of a chunked body.
#[derive(Clone, Debug)]
pub enum Chunk {
    Bytes(Bytes),
    Text(String),
}

/// Decode a queue body into a job request.
///
/// Bytes are decoded as UTF-8 with replacement, never rejected. A parsed
/// value that is itself a string is parsed one more level to unwrap
/// double-encoded payloads.
pub fn decode(body: MessageBody) -> Result<JobRequest, WorkerError> {
    let text = match body {
        MessageBody::Mapping(map) => return from_mapping(Value::Object(map)),
        MessageBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        MessageBody::Text(text) => text,
        MessageBody::Chunks(chunks) => {
            let mut buf = Vec::new();
            for chunk in chunks {
                match chunk {
                    Chunk::Bytes(bytes) => buf.extend_from_slice(&bytes),
                    Chunk::Text(text) => buf.extend_from_slice(text.as_bytes()),
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => from_mapping(Value::Object(map)),
        // Double-encoded payload: a JSON string containing JSON.
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(Value::Object(map)) => from_mapping(Value::Object(map)),
            _ => literal_fallback(&text),
        },
        _ => literal_fallback(&text),
    }
}

fn from_mapping(value: Value) -> Result<JobRequest, WorkerError> {
    serde_json::from_value(value)
        .map_err(|e| WorkerError::Format(format!("Invalid job request shape: {e}")))
}

/// Last resort for payloads serialized with single quotes or trailing
/// commas. Parses the original text, not the unwrapped layer.
fn literal_fallback(text: &str) -> Result<JobRequest, WorkerError> {
    match json5::from_str::<Value>(text) {
        Ok(Value::Object(map)) => from_mapping(Value::Object(map)),
        _ => Err(WorkerError::Format(format!(
            "Message body is not a mapping: {}",
            text.chars().take(120).collect::<String>()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_JSON: &str = r#"{"id":"job1","blob":{"container":"uploads","name":"cat.png"}}"#;

    fn sample() -> JobRequest {
        JobRequest {
            id: Some("job1".to_string()),
            url: None,
            blob: BlobRef {
                container: Some("uploads".to_string()),
                name: Some("cat.png".to_string()),
            },
        }
    }

    fn sample_mapping() -> serde_json::Map<String, Value> {
        match serde_json::from_str::<Value>(SAMPLE_JSON).unwrap() {
            Value::Object(map) => map,
            other => panic!("sample is not a mapping: {other:?}"),
        }
    }

    #[test]
    fn test_decode_structured_mapping() {
        let decoded = decode(MessageBody::Mapping(sample_mapping())).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_text_body() {
        let decoded = decode(MessageBody::Text(SAMPLE_JSON.to_string())).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_byte_body() {
        let decoded = decode(MessageBody::Bytes(Bytes::from_static(SAMPLE_JSON.as_bytes()))).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_chunked_body_in_delivery_order() {
        let bytes = SAMPLE_JSON.as_bytes();
        let chunks = vec![
            Chunk::Bytes(Bytes::copy_from_slice(&bytes[..10])),
            Chunk::Text(String::from_utf8(bytes[10..25].to_vec()).unwrap()),
            Chunk::Bytes(Bytes::copy_from_slice(&bytes[25..])),
        ];
        let decoded = decode(MessageBody::Chunks(chunks)).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_all_representations_decode_equally() {
        let bodies = vec![
            MessageBody::Mapping(sample_mapping()),
            MessageBody::Text(SAMPLE_JSON.to_string()),
            MessageBody::Bytes(Bytes::from_static(SAMPLE_JSON.as_bytes())),
            MessageBody::Chunks(vec![Chunk::Text(SAMPLE_JSON.to_string())]),
        ];
        for body in bodies {
            assert_eq!(decode(body).unwrap(), sample());
        }
    }

    #[test]
    fn test_double_encoded_payload_unwrapped() {
        let outer = serde_json::to_string(SAMPLE_JSON).unwrap();
        let decoded = decode(MessageBody::Text(outer)).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_single_quoted_literal_payload() {
        let literal = "{'id': 'job1', 'blob': {'container': 'uploads', 'name': 'cat.png'}}";
        let decoded = decode(MessageBody::Text(literal.to_string())).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_invalid_utf8_replaced_not_rejected() {
        let mut raw = br#"{"id":"job"#.to_vec();
        raw.push(0xFF);
        raw.extend_from_slice(br#"1","blob":{"container":"uploads","name":"cat.png"}}"#);
        let decoded = decode(MessageBody::Bytes(Bytes::from(raw))).unwrap();
        assert_eq!(decoded.id.as_deref(), Some("job\u{FFFD}1"));
    }

    #[test]
    fn test_non_mapping_bodies_rejected() {
        for body in ["[1,2,3]", "\"just a string\"", "plain text", ""] {
            let err = decode(MessageBody::Text(body.to_string())).unwrap_err();
            assert!(matches!(err, WorkerError::Format(_)), "body {body:?}");
        }
    }

    #[test]
    fn test_missing_fields_decode_to_defaults() {
        let decoded = decode(MessageBody::Text("{}".to_string())).unwrap();
        assert_eq!(decoded, JobRequest::default());
    }

    #[test]
    fn test_key_prefers_id_over_url() {
        let request = JobRequest {
            id: Some("job1".to_string()),
            url: Some("https://example.test/cat.png".to_string()),
            ..JobRequest::default()
        };
        assert_eq!(request.key(), Some(JobKey::Id("job1".to_string())));
    }

    #[test]
    fn test_key_falls_back_to_url() {
        let request = JobRequest {
            id: None,
            url: Some("https://example.test/cat.png".to_string()),
            ..JobRequest::default()
        };
        assert_eq!(
            request.key(),
            Some(JobKey::Url("https://example.test/cat.png".to_string()))
        );
    }

    #[test]
    fn test_key_ignores_empty_strings() {
        let request = JobRequest {
            id: Some(String::new()),
            url: None,
            ..JobRequest::default()
        };
        assert_eq!(request.key(), None);
        assert_eq!(JobRequest::default().key(), None);
    }
}
