//! Client contract for talking to remote workers.
//!
//! The scheduler core only ever sees [`WorkerClient`]; production wires in
//! [`HttpWorkerClient`], tests inject stubs.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use crate::config::ClientConfig;
use crate::pool::Worker;
use crate::protocol::{
    CompletionRequest, CompletionResponse, DecodeRequest, DecodeResponse, PrefillRequest,
    PrefillResponse, WorkerHealthResponse,
};
use crate::request::{Prompt, SamplingParams};

/// Worker client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport-level failure (connect, deadline, body decode).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Worker answered with a non-success status.
    #[error("worker returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// Response parsed but did not carry the expected fields.
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/// Result of a prefill call.
#[derive(Debug, Clone)]
pub struct PrefillOutcome {
    pub kv_cache_handle: String,
    pub prompt_tokens: u32,
    pub latency_ms: u64,
}

/// Result of a decode call.
#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    pub text: String,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

/// Result of a health probe. Probes never fail; transport faults are folded
/// into `healthy: false`.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    pub healthy: bool,
    pub gpu_utilization: f64,
    pub active_requests: u32,
    pub error: Option<String>,
}

impl HealthProbe {
    /// Probe describing an unreachable or unhealthy worker.
    #[must_use]
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            gpu_utilization: 0.0,
            active_requests: 0,
            error: Some(error.into()),
        }
    }
}

/// The narrow contract the scheduling core consumes.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Runs the prefill phase on a worker, producing a KV-cache handle.
    async fn prefill(
        &self,
        worker: &Worker,
        request_id: &str,
        prompt: &Prompt,
        model_id: &str,
    ) -> Result<PrefillOutcome, ClientError>;

    /// Runs the decode phase on a worker against a KV-cache handle.
    async fn decode(
        &self,
        worker: &Worker,
        request_id: &str,
        kv_cache_handle: &str,
        model_id: &str,
        sampling: &SamplingParams,
    ) -> Result<DecodeOutcome, ClientError>;

    /// Probes a worker's health endpoint.
    async fn health(&self, worker: &Worker) -> HealthProbe;
}

/// HTTP client for remote vLLM-style workers.
///
/// Primary wire calls are `POST /prefill` and `POST /decode`; workers that
/// answer 404 there are driven through the legacy `POST /completions`
/// endpoint when the fallback is enabled.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
    legacy_fallback: bool,
}

impl HttpWorkerClient {
    /// Creates a client from configuration.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            legacy_fallback: config.legacy_fallback,
        })
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, ClientError>
    where
        B: serde::Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    async fn legacy_prefill(
        &self,
        worker: &Worker,
        prompt: &Prompt,
        model_id: &str,
    ) -> Result<CompletionResponse, ClientError> {
        // One generated token is enough to materialise the cache; the
        // completion id then names it.
        let body = CompletionRequest {
            model: model_id.to_owned(),
            prompt: prompt.clone(),
            max_tokens: Some(1),
            temperature: None,
            top_p: None,
            top_k: None,
            repetition_penalty: None,
            stop: None,
        };
        self.post_json(&format!("{}/completions", worker.endpoint), &body)
            .await
    }

    async fn legacy_decode(
        &self,
        worker: &Worker,
        kv_cache_handle: &str,
        model_id: &str,
        sampling: &SamplingParams,
    ) -> Result<CompletionResponse, ClientError> {
        let body = CompletionRequest {
            model: model_id.to_owned(),
            prompt: Prompt::Text(format!("<kv_cache:{kv_cache_handle}>")),
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            repetition_penalty: sampling.repetition_penalty,
            stop: sampling.stop.clone(),
        };
        self.post_json(&format!("{}/completions", worker.endpoint), &body)
            .await
    }
}

fn is_not_found(error: &ClientError) -> bool {
    matches!(error, ClientError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn prefill(
        &self,
        worker: &Worker,
        request_id: &str,
        prompt: &Prompt,
        model_id: &str,
    ) -> Result<PrefillOutcome, ClientError> {
        let started = Instant::now();
        let body = PrefillRequest {
            model: model_id.to_owned(),
            prompt: prompt.clone(),
            request_id: request_id.to_owned(),
        };

        let primary: Result<PrefillResponse, ClientError> = self
            .post_json(&format!("{}/prefill", worker.endpoint), &body)
            .await;

        match primary {
            Ok(response) => Ok(PrefillOutcome {
                kv_cache_handle: response.kv_cache_handle,
                prompt_tokens: response.prompt_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
            }),
            Err(error) if self.legacy_fallback && is_not_found(&error) => {
                debug!(worker_id = %worker.id, %request_id, "prefill endpoint missing, using completions fallback");
                let completion = self.legacy_prefill(worker, prompt, model_id).await?;
                Ok(PrefillOutcome {
                    kv_cache_handle: completion.id,
                    prompt_tokens: completion.usage.prompt_tokens,
                    latency_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn decode(
        &self,
        worker: &Worker,
        request_id: &str,
        kv_cache_handle: &str,
        model_id: &str,
        sampling: &SamplingParams,
    ) -> Result<DecodeOutcome, ClientError> {
        let started = Instant::now();
        let body = DecodeRequest {
            model: model_id.to_owned(),
            kv_cache_handle: kv_cache_handle.to_owned(),
            request_id: request_id.to_owned(),
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            repetition_penalty: sampling.repetition_penalty,
            stop: sampling.stop.clone(),
        };

        let primary: Result<DecodeResponse, ClientError> = self
            .post_json(&format!("{}/decode", worker.endpoint), &body)
            .await;

        match primary {
            Ok(response) => Ok(DecodeOutcome {
                text: response.text,
                completion_tokens: response.completion_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
            }),
            Err(error) if self.legacy_fallback && is_not_found(&error) => {
                debug!(worker_id = %worker.id, %request_id, "decode endpoint missing, using completions fallback");
                let completion = self
                    .legacy_decode(worker, kv_cache_handle, model_id, sampling)
                    .await?;
                let choice = completion
                    .choices
                    .into_iter()
                    .next()
                    .ok_or_else(|| ClientError::Shape("completions response had no choices".to_owned()))?;
                Ok(DecodeOutcome {
                    text: choice.text,
                    completion_tokens: completion.usage.completion_tokens,
                    latency_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn health(&self, worker: &Worker) -> HealthProbe {
        let url = format!("{}/health", worker.endpoint);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(error) => return HealthProbe::unhealthy(error.to_string()),
        };

        if !response.status().is_success() {
            return HealthProbe::unhealthy(format!("health returned {}", response.status()));
        }

        match response.json::<WorkerHealthResponse>().await {
            Ok(body) if body.is_ok() => HealthProbe {
                healthy: true,
                gpu_utilization: body.gpu_utilization,
                active_requests: body.active_requests,
                error: None,
            },
            Ok(body) => HealthProbe::unhealthy(format!("worker status {:?}", body.status)),
            Err(error) => HealthProbe::unhealthy(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_creation() {
        let client = HttpWorkerClient::new(&ClientConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn not_found_detection() {
        let not_found = ClientError::Status {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(is_not_found(&not_found));

        let server_error = ClientError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: String::new(),
        };
        assert!(!is_not_found(&server_error));
    }

    #[test]
    fn unhealthy_probe_carries_error() {
        let probe = HealthProbe::unhealthy("connection refused");
        assert!(!probe.healthy);
        assert_eq!(probe.error.as_deref(), Some("connection refused"));
    }
}
