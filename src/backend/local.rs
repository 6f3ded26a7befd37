use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::{ModelDescriptor, ModelManager, ModelRequest, TextGenerator, non_empty};
use crate::config::{LocalConfig, parse_duration};
use crate::error::GenerationError;
use crate::models::Backend;
use crate::store;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
    num_predict: u32,
    presence_penalty: f64,
    frequency_penalty: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    size: Option<u64>,
    digest: Option<String>,
    modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    status: Option<String>,
    error: Option<String>,
}

/// Client for a self-hosted Ollama server.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    health_timeout: Duration,
    pull_timeout: Duration,
}

impl OllamaClient {
    pub fn new(config: &LocalConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("building local model HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: parse_duration(&config.timeout)?,
            health_timeout: parse_duration(&config.health_timeout)?,
            pull_timeout: parse_duration(&config.pull_timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport(err: reqwest::Error) -> GenerationError {
    GenerationError::from_transport(Backend::Local, err)
}

fn upstream(status: StatusCode, message: impl Into<String>) -> GenerationError {
    GenerationError::Upstream {
        backend: Backend::Local,
        status: Some(status.as_u16()),
        message: message.into(),
    }
}

/// Ollama lists models with an explicit tag; a bare name means `:latest`.
fn same_model(installed: &str, wanted: &str) -> bool {
    fn canonical(name: &str) -> String {
        if name.contains(':') {
            name.to_string()
        } else {
            format!("{name}:latest")
        }
    }
    canonical(installed) == canonical(wanted)
}

impl TextGenerator for OllamaClient {
    async fn generate_text(&self, request: ModelRequest<'_>) -> Result<String, GenerationError> {
        let body = GenerateRequest {
            model: request.model,
            prompt: &request.prompt.user,
            system: &request.prompt.system,
            stream: false,
            options: GenerateOptions {
                temperature: request.params.temperature,
                top_p: request.params.top_p,
                num_predict: request.params.max_tokens,
                presence_penalty: request.params.presence_penalty,
                frequency_penalty: request.params.frequency_penalty,
            },
        };

        debug!(model = %request.model, "requesting local completion");
        let response = self
            .client
            .post(self.url("/api/generate"))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let text = response.text().await.map_err(transport)?;

        if status == StatusCode::NOT_FOUND {
            return Err(GenerationError::ModelNotFound {
                model: request.model.to_string(),
            });
        }
        if !status.is_success() {
            return Err(upstream(status, text.chars().take(500).collect::<String>()));
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| upstream(status, format!("malformed generate payload: {e}")))?;
        let content = parsed
            .response
            .ok_or_else(|| upstream(status, "generate payload has no response field"))?;

        non_empty(Backend::Local, &content)
    }
}

impl ModelManager for OllamaClient {
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, GenerationError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream(status, "listing models failed"));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| upstream(status, format!("malformed tags payload: {e}")))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelDescriptor {
                name: m.name,
                size: m.size,
                digest: m.digest,
                modified_at: m.modified_at,
            })
            .collect())
    }

    async fn is_model_available(&self, name: &str) -> Result<bool, GenerationError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| same_model(&m.name, name)))
    }

    async fn pull_model(&self, name: &str) -> Result<(), GenerationError> {
        info!(model = %name, "pulling local model");
        let response = self
            .client
            .post(self.url("/api/pull"))
            .timeout(self.pull_timeout)
            .json(&json!({ "name": name, "stream": false }))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let text = response.text().await.map_err(transport)?;
        let parsed: Option<PullResponse> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let message = parsed
                .and_then(|p| p.error)
                .unwrap_or_else(|| text.chars().take(500).collect());
            warn!(model = %name, status = %status, error = %message, "model pull failed");
            return Err(upstream(status, message));
        }

        match parsed {
            Some(PullResponse {
                status: Some(s), ..
            }) if s == "success" => Ok(()),
            Some(PullResponse { error: Some(e), .. }) => Err(upstream(status, e)),
            _ => Err(upstream(status, "pull did not report success")),
        }
    }

    async fn is_server_healthy(&self) -> bool {
        match self
            .client
            .get(self.url("/api/version"))
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "local model server health check failed");
                false
            }
        }
    }
}

/// Refresh the `local_models` table from the server's model list.
/// Returns the number of installed models seen.
pub async fn sync_local_models(pool: &SqlitePool, manager: &impl ModelManager) -> Result<usize> {
    let models = manager
        .list_models()
        .await
        .context("listing models on the local server")?;
    let now = Utc::now();

    for model in &models {
        store::upsert_local_model(pool, &model.name, &model.details(), now).await?;
    }
    let names: Vec<String> = models.iter().map(|m| m.name.clone()).collect();
    let missing = store::mark_missing_local_models(pool, &names, now).await?;

    info!(installed = models.len(), missing, "local models synced");
    Ok(models.len())
}
