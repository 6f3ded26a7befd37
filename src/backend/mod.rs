//! Model backend clients.
//!
//! Both backends implement [`TextGenerator`]; the local one additionally
//! implements [`ModelManager`] so the orchestrator can make sure a model is
//! installed before generating with it.

use std::future::Future;

use serde::Serialize;

use crate::article::Prompt;
use crate::error::GenerationError;
use crate::models::{Backend, SamplingParams};

pub mod local;
pub mod remote;

pub use local::OllamaClient;
pub use remote::RemoteClient;

/// Everything a backend needs for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub prompt: &'a Prompt,
    pub model: &'a str,
    pub params: &'a SamplingParams,
    /// Only used by the remote backend.
    pub api_key: Option<&'a str>,
}

pub trait TextGenerator: Send + Sync {
    fn generate_text(&self, request: ModelRequest<'_>) -> impl Future<Output = Result<String, GenerationError>> + Send;
}

/// A model installed on the local server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub modified_at: Option<String>,
}

impl ModelDescriptor {
    pub fn details(&self) -> serde_json::Value {
        serde_json::json!({
            "digest": self.digest,
            "size": self.size,
            "modified_at": self.modified_at,
        })
    }
}

pub trait ModelManager: Send + Sync {
    fn list_models(&self) -> impl Future<Output = Result<Vec<ModelDescriptor>, GenerationError>> + Send;

    fn is_model_available(&self, name: &str) -> impl Future<Output = Result<bool, GenerationError>> + Send;

    /// Download a model. Blocks until the server reports completion.
    fn pull_model(&self, name: &str) -> impl Future<Output = Result<(), GenerationError>> + Send;

    fn is_server_healthy(&self) -> impl Future<Output = bool> + Send;
}

/// Fail on blank output, otherwise return it trimmed.
fn non_empty(backend: Backend, text: &str) -> Result<String, GenerationError> {
    let text = text.trim();
    if text.is_empty() {
        Err(GenerationError::EmptyResult { backend })
    } else {
        Ok(text.to_string())
    }
}

/// Local HTTP servers standing in for the model APIs in tests.
#[cfg(test)]
pub(crate) mod test_server {
    use axum::Router;
    use tokio::net::TcpListener;

    /// Serve `router` on an ephemeral port and return its base URL.
    pub async fn spawn(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}
