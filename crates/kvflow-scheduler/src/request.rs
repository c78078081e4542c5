//! Request and response model for the scheduling pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{Result, SchedulerError};
use crate::pool::WorkerId;

/// An inference request as submitted to the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    /// Model the request targets.
    pub model_id: String,
    /// Prompt text or pre-tokenised ids.
    pub prompt: Prompt,
    /// Sampling parameters forwarded to the decode worker.
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Queue priority.
    #[serde(default)]
    pub priority: Priority,
    /// Maximum time the request may wait in the queue; the scheduler's
    /// default applies when unset.
    #[serde(default, with = "serde_opt_duration_ms")]
    pub timeout: Option<Duration>,
}

impl InferenceRequest {
    /// Creates a request with default sampling, normal priority, and the
    /// scheduler's default timeout.
    pub fn new(model_id: impl Into<String>, prompt: impl Into<Prompt>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            sampling: SamplingParams::default(),
            priority: Priority::default(),
            timeout: None,
        }
    }
}

/// Prompt payload: raw text or token ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    TokenIds(Vec<u32>),
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(ids: Vec<u32>) -> Self {
        Self::TokenIds(ids)
    }
}

/// Sampling parameters. All fields are optional; workers apply their own
/// defaults for unset fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub repetition_penalty: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub stream: Option<bool>,
}

/// Queue priority. Lower rank dispatches first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank: high before normal before low.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Phase of a request in the pipeline.
///
/// Transitions are monotonic along
/// queued → prefilling → transferring → decoding → completed, with any
/// non-terminal phase able to move directly to failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPhase {
    Queued,
    Prefilling,
    Transferring,
    Decoding,
    Completed,
    Failed,
}

/// Final result of a completed request.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResponse {
    pub request_id: String,
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub prefill_worker: WorkerId,
    pub decode_worker: WorkerId,
    pub prefill_latency_ms: u64,
    pub decode_latency_ms: u64,
    pub total_latency_ms: u64,
}

/// Handle returned by `submit`, settled exactly once by the pipeline.
#[derive(Debug)]
pub struct ResponseHandle {
    pub(crate) request_id: String,
    pub(crate) rx: oneshot::Receiver<Result<InferenceResponse>>,
}

impl ResponseHandle {
    /// The id assigned to the submitted request.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the request to settle.
    pub async fn recv(self) -> Result<InferenceResponse> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Internal(
                "response channel closed before settlement".to_owned(),
            )),
        }
    }
}

/// Serde helper for `Option<Duration>` as milliseconds.
mod serde_opt_duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranks_order() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn prompt_deserialises_untagged() {
        let text: Prompt = serde_json::from_str(r#""hello""#).unwrap();
        assert!(matches!(text, Prompt::Text(t) if t == "hello"));

        let ids: Prompt = serde_json::from_str("[1, 2, 3]").unwrap();
        assert!(matches!(ids, Prompt::TokenIds(v) if v == vec![1, 2, 3]));
    }

    #[test]
    fn request_defaults() {
        let request: InferenceRequest =
            serde_json::from_str(r#"{"model_id": "m", "prompt": "hi"}"#).unwrap();
        assert_eq!(request.priority, Priority::Normal);
        assert!(request.timeout.is_none());
        assert!(request.sampling.max_tokens.is_none());
    }
}
