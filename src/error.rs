use thiserror::Error;

use crate::models::Backend;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Failure of one generation call, classified so the orchestrator can decide
/// whether to fall back, pull a model, or give up.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{backend} backend rejected credentials: {message}")]
    Auth { backend: Backend, message: String },
    #[error("{backend} backend returned an error (status {status:?}): {message}")]
    Upstream {
        backend: Backend,
        status: Option<u16>,
        message: String,
    },
    #[error("local model '{model}' not found")]
    ModelNotFound { model: String },
    #[error("{backend} backend returned empty text")]
    EmptyResult { backend: Backend },
    #[error("{backend} backend unreachable: {message}")]
    Connection { backend: Backend, message: String },
    #[error("primary attempt failed: {primary}; fallback attempt failed: {fallback}")]
    AllBackendsFailed {
        primary: Box<GenerationError>,
        fallback: Box<GenerationError>,
    },
}

impl GenerationError {
    /// The error of the last attempt made. For a double failure this is the
    /// fallback's error; otherwise the error itself.
    pub fn final_cause(&self) -> &GenerationError {
        match self {
            GenerationError::AllBackendsFailed { fallback, .. } => fallback.final_cause(),
            other => other,
        }
    }

    /// Map a transport-level reqwest failure onto the taxonomy.
    pub fn from_transport(backend: Backend, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            GenerationError::Connection {
                backend,
                message: err.to_string(),
            }
        } else {
            GenerationError::Upstream {
                backend,
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publishing is not configured: {0}")]
    NotConfigured(String),
    #[error("HTTP request to Telegram failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error: {0}")]
    Api(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_cause_unwraps_nested_failures() {
        let err = GenerationError::AllBackendsFailed {
            primary: Box::new(GenerationError::ModelNotFound {
                model: "llama3".to_string(),
            }),
            fallback: Box::new(GenerationError::Auth {
                backend: Backend::Remote,
                message: "no API key configured".to_string(),
            }),
        };

        assert!(matches!(
            err.final_cause(),
            GenerationError::Auth {
                backend: Backend::Remote,
                ..
            }
        ));
        let text = err.to_string();
        assert!(text.contains("llama3"));
        assert!(text.contains("remote backend rejected credentials"));
    }
}
