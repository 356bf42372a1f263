//! Ollama HTTP backend with circuit breaker and NDJSON streaming

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::models::{BackendRequest, BackendResponse};
use super::{BackendError, BackendStream, InferenceBackend};
use crate::config::BackendConfig;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const WARM_PROMPT: &str = "Hello";

/// Client for an Ollama-compatible engine
pub struct OllamaBackend {
    http: Client,
    config: BackendConfig,
    breaker: CircuitBreaker,
}

impl OllamaBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::RequestFailed(e.to_string()))?;

        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failures,
            reset_timeout: config.breaker_reset_timeout(),
        });

        Ok(Self {
            http,
            config,
            breaker,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn endpoint(request: &BackendRequest) -> &'static str {
        if request.is_prompt() {
            "/api/generate"
        } else {
            "/api/chat"
        }
    }

    async fn post(
        &self,
        path: &str,
        body: &impl serde::Serialize,
        timeout: Option<Duration>,
    ) -> Result<Response, BackendError> {
        let mut req = self.http.post(self.url(path)).json(body);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let response = req.send().await.map_err(BackendError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Upstream(format!("HTTP {}: {}", status, body)));
        }

        Ok(response)
    }

    async fn get(&self, path: &str, timeout: Duration) -> Result<Response, BackendError> {
        let response = self
            .http
            .get(self.url(path))
            .timeout(timeout)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Upstream(format!("HTTP {}: {}", status, body)));
        }

        Ok(response)
    }

    /// Run a call guarded by the model's breaker
    async fn guarded<T, F>(&self, model: &str, call: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        self.breaker.check(model)?;
        match call.await {
            Ok(value) => {
                self.breaker.mark_success(model);
                Ok(value)
            }
            Err(e) => {
                self.breaker.mark_failure(model);
                Err(e)
            }
        }
    }

    /// Compute an embedding vector through `/api/embeddings`
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, BackendError> {
        #[derive(Deserialize)]
        struct EmbeddingResponse {
            embedding: Vec<f32>,
        }

        let body = json!({ "model": model, "prompt": text });
        let response = self
            .post("/api/embeddings", &body, Some(self.config.request_timeout()))
            .await?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        if parsed.embedding.is_empty() {
            return Err(BackendError::InvalidResponse("empty embedding".to_string()));
        }

        Ok(parsed.embedding)
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        #[derive(Deserialize)]
        struct TagsResponse {
            #[serde(default)]
            models: Vec<TagEntry>,
        }

        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
        }

        let response = self.get("/api/tags", self.config.request_timeout()).await?;
        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    async fn warm(&self, model: &str) -> Result<(), BackendError> {
        info!("Warming model {}", model);
        let body = json!({
            "model": model,
            "prompt": WARM_PROMPT,
            "stream": false,
            "keep_alive": self.config.keep_alive,
        });

        self.guarded(model, async {
            self.post("/api/generate", &body, Some(self.config.load_timeout()))
                .await
                .map(|_| ())
        })
        .await
    }

    async fn unload(&self, model: &str) -> Result<(), BackendError> {
        debug!("Sending unload signal for model {}", model);
        let body = json!({ "model": model, "keep_alive": 0 });
        self.post("/api/generate", &body, Some(self.config.unload_timeout()))
            .await
            .map(|_| ())
    }

    async fn generate(&self, mut request: BackendRequest) -> Result<BackendResponse, BackendError> {
        request.stream = false;
        let model = request.model.clone();
        let path = Self::endpoint(&request);

        self.guarded(&model, async {
            let response = self
                .post(path, &request, Some(self.config.request_timeout()))
                .await?;

            let parsed: BackendResponse = response
                .json()
                .await
                .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

            match parsed.error {
                Some(error) => Err(BackendError::Upstream(error)),
                None => Ok(parsed),
            }
        })
        .await
    }

    async fn generate_stream(&self, mut request: BackendRequest) -> Result<BackendStream, BackendError> {
        request.stream = true;
        let model = request.model.clone();
        let path = Self::endpoint(&request);

        // The overall deadline is enforced by the caller; only the connection
        // and response headers are covered by the breaker here.
        let response = self
            .guarded(&model, self.post(path, &request, None))
            .await?;

        Ok(ndjson_stream(response.bytes_stream().boxed()))
    }
}

struct NdjsonState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: BytesMut,
    finished: bool,
}

fn parse_line(line: &[u8]) -> Result<BackendResponse, BackendError> {
    let parsed: BackendResponse =
        serde_json::from_slice(line).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    match parsed.error {
        Some(error) => Err(BackendError::Upstream(error)),
        None => Ok(parsed),
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

/// Split a byte stream into newline-delimited JSON responses.
///
/// The stream ends after the first `done` item or the first error.
pub(crate) fn ndjson_stream(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> BackendStream {
    let state = NdjsonState {
        bytes,
        buffer: BytesMut::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line = state.buffer.split_to(pos + 1);
                let line = &line[..pos];
                if is_blank(line) {
                    continue;
                }

                let item = parse_line(line);
                if item.as_ref().map(|r| r.done).unwrap_or(true) {
                    state.finished = true;
                }
                return Some((item, state));
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(BackendError::Stream(e.to_string())), state));
                }
                None => {
                    state.finished = true;
                    let rest = state.buffer.split();
                    if is_blank(&rest) {
                        warn!("Backend stream ended without a done marker");
                        return None;
                    }
                    return Some((parse_line(&rest), state));
                }
            }
        }
    })
    .boxed()
}
