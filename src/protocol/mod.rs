//! JSON envelopes exchanged with clients and workers

use crate::cache::RequestRecord;
use crate::error::{GatewayError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Decode one JSON frame; malformed input is a protocol error
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| GatewayError::Protocol(e.to_string()))
}

/// Inbound client frame, also published verbatim to the request subject
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateRequest {
    pub request_id: String,
    pub client_id: String,
    pub source_text: String,
    pub lang_from: String,
    pub lang_to: String,
}

/// Result envelope from the result subject, forwarded to the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateResponse {
    pub client_id: String,
    pub request_id: String,
    pub lang_from: String,
    pub lang_to: String,
    pub result: String,
}

impl TranslateResponse {
    /// Replay a finished record
    pub fn from_record(record: &RequestRecord) -> Self {
        Self {
            client_id: record.client_id.clone(),
            request_id: record.request_id.clone(),
            lang_from: record.lang_from.clone(),
            lang_to: record.lang_to.clone(),
            result: record.result_text.clone(),
        }
    }

    /// Answer `request` with an already known translation
    pub fn for_request(request: &TranslateRequest, result: impl Into<String>) -> Self {
        Self {
            client_id: request.client_id.clone(),
            request_id: request.request_id.clone(),
            lang_from: request.lang_from.clone(),
            lang_to: request.lang_to.clone(),
            result: result.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_malformed_frame() {
        let err = decode::<TranslateRequest>(b"this is not json").unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn test_request_missing_fields_default_to_empty() {
        let request: TranslateRequest =
            serde_json::from_str(r#"{"source_text":"hello","lang_to":"zh"}"#).unwrap();
        assert_eq!(request.source_text, "hello");
        assert!(request.request_id.is_empty());
        assert!(request.client_id.is_empty());
    }

    #[test]
    fn test_response_field_names() {
        let response = TranslateResponse {
            client_id: "c1".to_string(),
            request_id: "r1".to_string(),
            lang_from: "en".to_string(),
            lang_to: "zh".to_string(),
            result: "你好".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["client_id"], "c1");
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["result"], "你好");
    }

    #[test]
    fn test_replay_from_record() {
        let record = RequestRecord::pending("r1", "c1", "hello", "en", "zh").complete("你好");
        let response = TranslateResponse::from_record(&record);
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.client_id, "c1");
        assert_eq!(response.result, "你好");
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(serde_json::from_str::<TranslateRequest>("\"hello\"").is_err());
        assert!(serde_json::from_str::<TranslateRequest>("not json").is_err());
    }
}
