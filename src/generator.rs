//! Ollama HTTP client used for summaries and model discovery.
//!
//! Wraps three calls against the Ollama API:
//! - `GET /api/tags` for liveness and the installed model catalog
//! - `POST /api/generate` for a non-streaming completion
//!
//! One `reqwest::Client` is shared across calls for connection reuse.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GeneratorError;

const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// One entry of the server's model catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorModel {
    pub name: String,
    pub modified_at: String,
    #[serde(rename = "size")]
    pub size_bytes: i64,
}

#[derive(Deserialize)]
struct ModelsResponse {
    models: Vec<GeneratorModel>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[allow(dead_code)]
    model: String,
    response: String,
    #[allow(dead_code)]
    done: bool,
}

#[derive(Clone)]
pub struct GeneratorClient {
    client: Client,
    timeout: Duration,
}

impl GeneratorClient {
    pub fn new() -> Self {
        Self::with_timeout(GENERATE_TIMEOUT)
    }

    /// Client whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout: {e}");
                Client::new()
            });
        Self { client, timeout }
    }

    /// True iff `GET /api/tags` answers with exactly 200. Never fails.
    pub async fn probe_availability(&self, base_url: &str) -> bool {
        match self.client.get(tags_url(base_url)).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!("Ollama probe at {base_url} failed: {e}");
                false
            }
        }
    }

    pub async fn list_models(&self, base_url: &str) -> Result<Vec<GeneratorModel>, GeneratorError> {
        let resp = self
            .client
            .get(tags_url(base_url))
            .send()
            .await
            .map_err(|e| classify_transport(&e, base_url))?;

        if resp.status() != StatusCode::OK {
            debug!("Ollama /api/tags returned status {}", resp.status());
            return Err(GeneratorError::ServiceUnavailable);
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, base_url))?;
        let parsed: ModelsResponse =
            serde_json::from_slice(&body).map_err(|e| GeneratorError::Decode(e.to_string()))?;
        Ok(parsed.models)
    }

    /// Run a non-streaming completion and return the generated text.
    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        base_url: &str,
    ) -> Result<String, GeneratorError> {
        let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
        };
        debug!("Sending {} prompt chars to Ollama model '{model}'", prompt.len());

        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, base_url))?;

        let status = resp.status();
        if status != StatusCode::OK {
            warn!("Ollama returned status {status}");
            return Err(match status.as_u16() {
                404 => GeneratorError::ModelNotFound(model.to_string()),
                500 => GeneratorError::ServerError,
                503 => GeneratorError::ServiceUnavailable,
                code => GeneratorError::Http(code),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, base_url))?;
        let parsed: GenerateResponse =
            serde_json::from_slice(&body).map_err(|e| GeneratorError::Decode(e.to_string()))?;
        Ok(parsed.response)
    }
}

impl Default for GeneratorClient {
    fn default() -> Self {
        Self::new()
    }
}

fn tags_url(base_url: &str) -> String {
    format!("{}/api/tags", base_url.trim_end_matches('/'))
}

/// Map a transport failure onto the user-facing categories.
fn classify_transport(err: &reqwest::Error, base_url: &str) -> GeneratorError {
    if err.is_timeout() {
        return GeneratorError::Timeout;
    }
    if err.is_connect() {
        return GeneratorError::ConnectionRefused(base_url.to_string());
    }
    classify_message(&error_chain_text(err), base_url)
}

/// Fallback classification on the error text.
fn classify_message(message: &str, base_url: &str) -> GeneratorError {
    let lower = message.to_lowercase();
    if lower.contains("timed out") {
        GeneratorError::Timeout
    } else if lower.contains("connection") {
        GeneratorError::ConnectionRefused(base_url.to_string())
    } else {
        GeneratorError::Network(message.to_string())
    }
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    /// Serve `router` on an ephemeral local port and return its base URL.
    pub(crate) async fn spawn_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// A base URL nothing is listening on.
    pub(crate) async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn status_router(status: u16) -> Router {
        Router::new().route(
            "/api/generate",
            post(move || async move { AxumStatus::from_u16(status).unwrap() }),
        )
    }

    #[tokio::test]
    async fn complete_returns_response_field_and_sends_request_body() {
        let router = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "llama3");
                assert_eq!(body["stream"], false);
                let echoed = format!("summary of {}", body["prompt"].as_str().unwrap());
                Json(json!({ "model": "llama3", "response": echoed, "done": true }))
            }),
        );
        let base = spawn_mock(router).await;

        let text = GeneratorClient::new()
            .complete("hello", "llama3", &base)
            .await
            .unwrap();
        assert_eq!(text, "summary of hello");
    }

    #[tokio::test]
    async fn complete_maps_404_to_model_not_found() {
        let base = spawn_mock(status_router(404)).await;
        let err = GeneratorClient::new()
            .complete("p", "mistral", &base)
            .await
            .unwrap_err();
        assert_eq!(err, GeneratorError::ModelNotFound("mistral".into()));
        let message = err.to_string();
        assert!(message.contains("mistral"));
        assert!(message.contains("not found"));
        assert!(message.contains("installed"));
    }

    #[tokio::test]
    async fn complete_maps_500_and_503() {
        let base = spawn_mock(status_router(500)).await;
        let err = GeneratorClient::new().complete("p", "m", &base).await.unwrap_err();
        assert_eq!(err, GeneratorError::ServerError);
        assert!(err.to_string().contains("model is loaded"));

        let base = spawn_mock(status_router(503)).await;
        let err = GeneratorClient::new().complete("p", "m", &base).await.unwrap_err();
        assert_eq!(err, GeneratorError::ServiceUnavailable);
        assert!(err.to_string().contains("Make sure Ollama is running"));
    }

    #[tokio::test]
    async fn complete_maps_other_status_to_http_error() {
        let base = spawn_mock(status_router(418)).await;
        let err = GeneratorClient::new().complete("p", "m", &base).await.unwrap_err();
        assert_eq!(err, GeneratorError::Http(418));
        assert_eq!(err.to_string(), "Ollama server error (HTTP 418)");
    }

    #[tokio::test]
    async fn complete_rejects_malformed_body() {
        let router = Router::new().route("/api/generate", post(|| async { "not json" }));
        let base = spawn_mock(router).await;
        let err = GeneratorClient::new().complete("p", "m", &base).await.unwrap_err();
        assert!(matches!(err, GeneratorError::Decode(_)));
    }

    #[tokio::test]
    async fn complete_reports_connection_refused_with_base_url() {
        let base = closed_port_url().await;
        let err = GeneratorClient::new().complete("p", "m", &base).await.unwrap_err();
        assert_eq!(err, GeneratorError::ConnectionRefused(base.clone()));
        assert!(err.to_string().contains(&base));
    }

    #[tokio::test]
    async fn complete_times_out() {
        let router = Router::new().route(
            "/api/generate",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "model": "m", "response": "late", "done": true }))
            }),
        );
        let base = spawn_mock(router).await;
        let err = GeneratorClient::with_timeout(Duration::from_millis(200))
            .complete("p", "m", &base)
            .await
            .unwrap_err();
        assert_eq!(err, GeneratorError::Timeout);
    }

    #[tokio::test]
    async fn catalog_calls_give_up_on_a_silent_server() {
        let router = Router::new().route(
            "/api/tags",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "models": [] }))
            }),
        );
        let base = spawn_mock(router).await;
        let client = GeneratorClient::with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        assert!(!client.probe_availability(&base).await);
        assert_eq!(client.list_models(&base).await.unwrap_err(), GeneratorError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn list_models_parses_catalog() {
        let router = Router::new().route(
            "/api/tags",
            get(|| async {
                Json(json!({
                    "models": [
                        { "name": "llama3", "modified_at": "2024-01-01T00:00:00Z", "size": 123 }
                    ]
                }))
            }),
        );
        let base = spawn_mock(router).await;
        let models = GeneratorClient::new().list_models(&base).await.unwrap();
        assert_eq!(
            models,
            vec![GeneratorModel {
                name: "llama3".into(),
                modified_at: "2024-01-01T00:00:00Z".into(),
                size_bytes: 123,
            }]
        );
    }

    #[tokio::test]
    async fn list_models_non_200_is_service_unavailable() {
        let router = Router::new().route("/api/tags", get(|| async { AxumStatus::BAD_GATEWAY }));
        let base = spawn_mock(router).await;
        let err = GeneratorClient::new().list_models(&base).await.unwrap_err();
        assert_eq!(err, GeneratorError::ServiceUnavailable);
    }

    #[tokio::test]
    async fn list_models_malformed_is_decode_error() {
        let router = Router::new().route("/api/tags", get(|| async { Json(json!({ "tags": [] })) }));
        let base = spawn_mock(router).await;
        let err = GeneratorClient::new().list_models(&base).await.unwrap_err();
        assert!(matches!(err, GeneratorError::Decode(_)));
    }

    #[tokio::test]
    async fn probe_is_true_only_for_200() {
        let ok = spawn_mock(Router::new().route("/api/tags", get(|| async { "{}" }))).await;
        let missing = spawn_mock(Router::new()).await;
        let closed = closed_port_url().await;

        let client = GeneratorClient::new();
        assert!(client.probe_availability(&ok).await);
        assert!(!client.probe_availability(&missing).await);
        assert!(!client.probe_availability(&closed).await);
    }

    #[test]
    fn message_fallback_classification() {
        let base = "http://localhost:11434";
        assert_eq!(classify_message("operation timed out", base), GeneratorError::Timeout);
        assert_eq!(
            classify_message("Connection reset by peer", base),
            GeneratorError::ConnectionRefused(base.into())
        );
        assert_eq!(
            classify_message("invalid certificate", base),
            GeneratorError::Network("invalid certificate".into())
        );
    }
}
