//! JSON wire types for the worker HTTP contract.
//!
//! Workers expose `POST /prefill`, `POST /decode`, `GET /health`,
//! `POST /kv_cache/export`, and `POST /kv_cache/import`. Legacy workers that
//! predate the disaggregated endpoints answer 404 there and are driven
//! through `POST /completions` instead.

use serde::{Deserialize, Serialize};

use crate::request::Prompt;

/// Body of `POST /prefill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefillRequest {
    pub model: String,
    pub prompt: Prompt,
    pub request_id: String,
}

/// Success response from `POST /prefill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefillResponse {
    pub kv_cache_handle: String,
    #[serde(default)]
    pub prompt_tokens: u32,
}

/// Body of `POST /decode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeRequest {
    pub model: String,
    pub kv_cache_handle: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Success response from `POST /decode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeResponse {
    pub text: String,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Body of `POST /kv_cache/export`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvExportRequest {
    pub cache_handle: String,
}

/// Success response from `POST /kv_cache/export`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvExportResponse {
    pub transfer_token: String,
}

/// Body of `POST /kv_cache/import`.
///
/// `source_worker` carries the source worker's endpoint, matching existing
/// worker behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvImportRequest {
    pub transfer_token: String,
    pub source_worker: String,
}

/// Success response from `POST /kv_cache/import`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvImportResponse {
    pub cache_handle: String,
}

/// Response from `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthResponse {
    pub status: String,
    #[serde(default)]
    pub gpu_utilization: f64,
    #[serde(default)]
    pub active_requests: u32,
}

impl WorkerHealthResponse {
    /// Returns true if the worker reports itself healthy.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Body of the legacy `POST /completions` fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: Prompt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Response from the legacy `POST /completions` fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: CompletionUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_request_skips_unset_sampling_fields() {
        let request = DecodeRequest {
            model: "m".to_owned(),
            kv_cache_handle: "h1".to_owned(),
            request_id: "req-0".to_owned(),
            max_tokens: Some(16),
            temperature: None,
            top_p: None,
            top_k: None,
            repetition_penalty: None,
            stop: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["max_tokens"], 16);
        assert!(json.get("temperature").is_none());
        assert!(json.get("stop").is_none());
    }

    #[test]
    fn health_response_status_check() {
        let ok: WorkerHealthResponse =
            serde_json::from_str(r#"{"status": "ok", "gpu_utilization": 0.4}"#).unwrap();
        assert!(ok.is_ok());
        assert!((ok.gpu_utilization - 0.4).abs() < f64::EPSILON);
        assert_eq!(ok.active_requests, 0);

        let bad: WorkerHealthResponse = serde_json::from_str(r#"{"status": "draining"}"#).unwrap();
        assert!(!bad.is_ok());
    }

    #[test]
    fn completion_response_tolerates_missing_usage() {
        let response: CompletionResponse =
            serde_json::from_str(r#"{"id": "cmpl-1", "choices": [{"text": "hi"}]}"#).unwrap();
        assert_eq!(response.id, "cmpl-1");
        assert_eq!(response.choices[0].text, "hi");
        assert_eq!(response.usage.prompt_tokens, 0);
    }
}
