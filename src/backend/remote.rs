use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ModelRequest, TextGenerator, non_empty};
use crate::config::{RemoteConfig, parse_duration};
use crate::error::GenerationError;
use crate::models::Backend;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    presence_penalty: f64,
    frequency_penalty: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Client for a hosted chat-completion API (OpenAI-compatible).
pub struct RemoteClient {
    client: Client,
    api_url: String,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building remote model HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            timeout: parse_duration(&config.timeout)?,
        })
    }
}

impl TextGenerator for RemoteClient {
    async fn generate_text(&self, request: ModelRequest<'_>) -> Result<String, GenerationError> {
        let api_key = request
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GenerationError::Auth {
                backend: Backend::Remote,
                message: "no API key configured".to_string(),
            })?;

        let body = ChatRequest {
            model: request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt.user,
                },
            ],
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
            top_p: request.params.top_p,
            presence_penalty: request.params.presence_penalty,
            frequency_penalty: request.params.frequency_penalty,
        };

        let url = format!("{}/chat/completions", self.api_url);
        debug!(url = %url, model = %request.model, "requesting remote completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::from_transport(Backend::Remote, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::from_transport(Backend::Remote, e))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GenerationError::Auth {
                backend: Backend::Remote,
                message: truncate(&text),
            });
        }
        if !status.is_success() {
            warn!(status = %status, "remote model API returned an error");
            return Err(GenerationError::Upstream {
                backend: Backend::Remote,
                status: Some(status.as_u16()),
                message: truncate(&text),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| GenerationError::Upstream {
            backend: Backend::Remote,
            status: Some(status.as_u16()),
            message: format!("malformed completion payload: {e}"),
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::Upstream {
                backend: Backend::Remote,
                status: Some(status.as_u16()),
                message: "completion payload has no message content".to_string(),
            })?;

        non_empty(Backend::Remote, &content)
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::{Value, json};

    use super::*;
    use crate::article::Prompt;
    use crate::backend::test_server;
    use crate::models::SamplingParams;

    fn client(base: &str) -> RemoteClient {
        RemoteClient::new(&RemoteConfig {
            api_url: base.to_string(),
            timeout: "5s".to_string(),
        })
        .unwrap()
    }

    fn prompt() -> Prompt {
        Prompt {
            system: "sys".to_string(),
            user: "Topic: Coffee".to_string(),
        }
    }

    async fn serve(status: StatusCode, body: Value) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/chat/completions",
            post(move |headers: HeaderMap, Json(request): Json<Value>| {
                let counter = counter.clone();
                let body = body.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(headers["authorization"], "Bearer sk-test");
                    assert_eq!(request["model"], "gpt-4");
                    assert_eq!(request["messages"][0]["role"], "system");
                    assert_eq!(request["messages"][1]["content"], "Topic: Coffee");
                    assert_eq!(request["max_tokens"], 2000);
                    (status, Json(body))
                }
            }),
        );
        (test_server::spawn(router).await, hits)
    }

    async fn generate(base: &str, api_key: Option<&str>) -> Result<String, GenerationError> {
        let prompt = prompt();
        let params = SamplingParams::default();
        client(base)
            .generate_text(ModelRequest {
                prompt: &prompt,
                model: "gpt-4",
                params: &params,
                api_key,
            })
            .await
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "  <h1>Coffee</h1>  "}}]});
        let (base, hits) = serve(StatusCode::OK, body).await;

        let text = generate(&base, Some("sk-test")).await.unwrap();
        assert_eq!(text, "<h1>Coffee</h1>");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_fails_without_a_request() {
        let (base, hits) = serve(StatusCode::OK, json!({})).await;

        let err = generate(&base, None).await.unwrap_err();
        assert!(matches!(err, GenerationError::Auth { .. }));
        let err = generate(&base, Some("  ")).await.unwrap_err();
        assert!(matches!(err, GenerationError::Auth { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn classifies_error_responses() {
        let (base, _) = serve(StatusCode::UNAUTHORIZED, json!({"error": "bad key"})).await;
        assert!(matches!(
            generate(&base, Some("sk-test")).await.unwrap_err(),
            GenerationError::Auth { .. }
        ));

        let (base, _) = serve(StatusCode::TOO_MANY_REQUESTS, json!({"error": "quota"})).await;
        match generate(&base, Some("sk-test")).await.unwrap_err() {
            GenerationError::Upstream { status, message, .. } => {
                assert_eq!(status, Some(429));
                assert!(message.contains("quota"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let (base, _) = serve(StatusCode::OK, json!({"choices": []})).await;
        assert!(matches!(
            generate(&base, Some("sk-test")).await.unwrap_err(),
            GenerationError::Upstream { .. }
        ));

        let (base, _) = serve(StatusCode::OK, json!({"choices": [{"message": {"content": "   "}}]})).await;
        assert!(matches!(
            generate(&base, Some("sk-test")).await.unwrap_err(),
            GenerationError::EmptyResult {
                backend: Backend::Remote
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        assert!(matches!(
            generate(&base, Some("sk-test")).await.unwrap_err(),
            GenerationError::Connection { .. }
        ));
    }
}
