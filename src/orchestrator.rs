//! Backend selection, caching and fallback for a single generation call.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::article::{Prompt, build_prompt};
use crate::backend::{ModelManager, ModelRequest, OllamaClient, RemoteClient, TextGenerator};
use crate::cache::{CachedResponse, ResponseCache, cache_key};
use crate::config::{Config, parse_duration};
use crate::error::GenerationError;
use crate::models::{Backend, GenerationSettings, Style};
use crate::store;

pub const PROGRESS_SETTINGS_RESOLVED: u8 = 10;
pub const PROGRESS_BACKEND_SELECTED: u8 = 25;
pub const PROGRESS_MODEL_READY: u8 = 30;

/// What to generate. `backend_override` pins the backend and disables fallback.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub topic: &'a str,
    pub description: &'a str,
    pub language: &'a str,
    pub style: Style,
    pub backend_override: Option<Backend>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub text: String,
    pub backend: Backend,
    pub model: String,
    pub cached: bool,
}

/// Receives progress checkpoints while a generation is running.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: u8) -> impl Future<Output = ()> + Send;
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    async fn report(&self, _progress: u8) {}
}

pub struct Orchestrator<R, L> {
    pool: SqlitePool,
    remote: R,
    local: L,
    cache: Option<Arc<ResponseCache>>,
}

/// The orchestrator wired to the real HTTP backends.
pub type Engine = Orchestrator<RemoteClient, OllamaClient>;

impl Engine {
    pub fn from_config(pool: SqlitePool, config: &Config) -> Result<Self> {
        let cache = if config.cache.enabled {
            Some(Arc::new(ResponseCache::new(parse_duration(&config.cache.ttl)?)))
        } else {
            None
        };
        Ok(Self::new(
            pool,
            RemoteClient::new(&config.remote)?,
            OllamaClient::new(&config.local)?,
            cache,
        ))
    }
}

/// Backends to try, in order. A pinned backend is never swapped out.
fn attempt_plan(primary: Backend, pinned: bool) -> Vec<Backend> {
    if pinned {
        vec![primary]
    } else {
        vec![primary, primary.other()]
    }
}

impl<R, L> Orchestrator<R, L>
where
    R: TextGenerator,
    L: TextGenerator + ModelManager,
{
    pub fn new(pool: SqlitePool, remote: R, local: L, cache: Option<Arc<ResponseCache>>) -> Self {
        Self {
            pool,
            remote,
            local,
            cache,
        }
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest<'_>,
        progress: &impl ProgressSink,
    ) -> Result<Generated, GenerationError> {
        let settings = store::get_active_generation_settings(&self.pool)
            .await
            .map_err(|e| GenerationError::Configuration(format!("loading generation settings: {e:#}")))?
            .ok_or_else(|| GenerationError::Configuration("no active generation settings".to_string()))?;
        progress.report(PROGRESS_SETTINGS_RESOLVED).await;

        let primary = request.backend_override.unwrap_or(if settings.use_local_model {
            Backend::Local
        } else {
            Backend::Remote
        });
        let plan = attempt_plan(primary, request.backend_override.is_some());
        progress.report(PROGRESS_BACKEND_SELECTED).await;

        let prompt = build_prompt(request.topic, request.description, request.language, request.style);
        let key = cache_key(&prompt);

        // A pinned request only accepts text its own backend produced.
        let hit = self
            .cache
            .as_ref()
            .and_then(|c| c.get(&key))
            .filter(|hit| request.backend_override.is_none_or(|pinned| pinned == hit.backend));
        if let Some(hit) = hit {
            debug!(topic = %request.topic, key = %key, backend = %hit.backend, "cache hit");
            return Ok(Generated {
                text: hit.text,
                backend: hit.backend,
                model: hit.model,
                cached: true,
            });
        }

        let mut failure: Option<GenerationError> = None;
        for backend in plan {
            match self.attempt(backend, &settings, &prompt, progress).await {
                Ok((text, model)) => {
                    if let Some(cache) = &self.cache {
                        cache.insert(
                            &key,
                            CachedResponse {
                                text: text.clone(),
                                backend,
                                model: model.clone(),
                            },
                        );
                    }
                    info!(topic = %request.topic, backend = %backend, model = %model, "generation succeeded");
                    return Ok(Generated {
                        text,
                        backend,
                        model,
                        cached: false,
                    });
                }
                Err(e) => {
                    warn!(topic = %request.topic, backend = %backend, error = %e, "generation attempt failed");
                    failure = Some(match failure.take() {
                        Some(primary) => GenerationError::AllBackendsFailed {
                            primary: Box::new(primary),
                            fallback: Box::new(e),
                        },
                        None => e,
                    });
                }
            }
        }

        Err(failure.unwrap_or_else(|| GenerationError::Configuration("no backend to attempt".to_string())))
    }

    async fn attempt(
        &self,
        backend: Backend,
        settings: &GenerationSettings,
        prompt: &Prompt,
        progress: &impl ProgressSink,
    ) -> Result<(String, String), GenerationError> {
        let params = settings.sampling();
        let model = self.model_for(settings, backend).await?;

        let text = match backend {
            Backend::Remote => {
                progress.report(PROGRESS_MODEL_READY).await;
                self.remote
                    .generate_text(ModelRequest {
                        prompt,
                        model: &model,
                        params: &params,
                        api_key: settings.api_key.as_deref(),
                    })
                    .await?
            }
            Backend::Local => {
                self.ensure_model_available(&model).await?;
                progress.report(PROGRESS_MODEL_READY).await;
                self.local
                    .generate_text(ModelRequest {
                        prompt,
                        model: &model,
                        params: &params,
                        api_key: None,
                    })
                    .await?
            }
        };
        Ok((text, model))
    }

    async fn model_for(&self, settings: &GenerationSettings, backend: Backend) -> Result<String, GenerationError> {
        match backend {
            Backend::Remote => Ok(settings.remote_model.clone()),
            Backend::Local => {
                if let Some(name) = settings.local_model.as_deref().filter(|n| !n.trim().is_empty()) {
                    return Ok(name.to_string());
                }
                let active = store::get_active_local_model(&self.pool)
                    .await
                    .map_err(|e| GenerationError::Configuration(format!("loading active local model: {e:#}")))?;
                active
                    .map(|m| m.name)
                    .ok_or_else(|| GenerationError::Configuration("no local model configured".to_string()))
            }
        }
    }

    /// One availability check, at most one pull, one re-check.
    pub async fn ensure_model_available(&self, model: &str) -> Result<(), GenerationError> {
        if self.local.is_model_available(model).await? {
            return Ok(());
        }

        info!(model = %model, "local model missing, pulling");
        if let Err(e) = self.local.pull_model(model).await {
            warn!(model = %model, error = %e, "model pull failed");
            return Err(GenerationError::ModelNotFound {
                model: model.to_string(),
            });
        }

        if self.local.is_model_available(model).await? {
            Ok(())
        } else {
            Err(GenerationError::ModelNotFound {
                model: model.to_string(),
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::fakes::*;
    use super::*;
    use crate::db::memory_pool;
    use crate::store::test_support::insert_active_generation;

    struct RecordingSink(Mutex<Vec<u8>>);

    impl ProgressSink for RecordingSink {
        async fn report(&self, progress: u8) {
            self.0.lock().unwrap().push(progress);
        }
    }

    fn request(backend_override: Option<Backend>) -> GenerationRequest<'static> {
        GenerationRequest {
            topic: "Coffee brewing",
            description: "Pour-over techniques",
            language: "en",
            style: Style::Expert,
            backend_override,
        }
    }

    async fn orchestrator(
        api_key: Option<&str>,
        use_local_model: bool,
        remote: FakeRemote,
        local: FakeLocal,
    ) -> Orchestrator<FakeRemote, FakeLocal> {
        let pool = memory_pool().await;
        insert_active_generation(&pool, api_key, use_local_model).await;
        Orchestrator::new(pool, remote, local, Some(Arc::new(ResponseCache::default())))
    }

    #[tokio::test]
    async fn identical_requests_hit_the_backend_once() {
        let orch = orchestrator(
            Some("sk-test"),
            false,
            FakeRemote::replying(Some("<h1>Coffee</h1>")),
            FakeLocal::replying(None, &[]),
        )
        .await;

        let first = orch.generate(&request(None), &NoProgress).await.unwrap();
        let second = orch.generate(&request(None), &NoProgress).await.unwrap();

        assert_eq!(first.text, second.text);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.backend, Backend::Remote);
        assert_eq!(second.model, "gpt-4");
        assert_eq!(orch.remote.calls(), 1);
    }

    #[tokio::test]
    async fn without_a_cache_every_request_hits_the_backend() {
        let pool = memory_pool().await;
        insert_active_generation(&pool, Some("sk-test"), false).await;
        let orch = Orchestrator::new(pool, FakeRemote::replying(Some("text")), FakeLocal::replying(None, &[]), None);

        orch.generate(&request(None), &NoProgress).await.unwrap();
        orch.generate(&request(None), &NoProgress).await.unwrap();
        assert_eq!(orch.remote.calls(), 2);
    }

    #[tokio::test]
    async fn upstream_failure_falls_back_to_local() {
        let orch = orchestrator(
            Some("sk-test"),
            false,
            FakeRemote::replying(None),
            FakeLocal::replying(Some("# Local article"), &["llama3"]),
        )
        .await;
        let sink = RecordingSink(Mutex::new(Vec::new()));

        let generated = orch.generate(&request(None), &sink).await.unwrap();
        assert_eq!(generated.text, "# Local article");
        assert_eq!(generated.backend, Backend::Local);
        assert_eq!(generated.model, "llama3");
        assert_eq!(orch.remote.calls(), 1);
        assert_eq!(orch.local.calls(), 1);

        let reported = sink.0.lock().unwrap().clone();
        assert_eq!(reported, vec![10, 25, 30, 30]);
    }

    #[tokio::test]
    async fn cache_hit_reports_the_backend_that_produced_the_text() {
        let orch = orchestrator(
            Some("sk-test"),
            false,
            FakeRemote::replying(None),
            FakeLocal::replying(Some("# Local article"), &["llama3"]),
        )
        .await;

        orch.generate(&request(None), &NoProgress).await.unwrap();
        let hit = orch.generate(&request(None), &NoProgress).await.unwrap();
        assert!(hit.cached);
        assert_eq!(hit.backend, Backend::Local);
        assert_eq!(hit.model, "llama3");
        assert_eq!(orch.remote.calls(), 1);

        // Pinned to remote, the locally produced entry does not count.
        let pinned = orch.generate(&request(Some(Backend::Remote)), &NoProgress).await;
        assert!(pinned.is_err());
        assert_eq!(orch.remote.calls(), 2);

        let pinned_local = orch.generate(&request(Some(Backend::Local)), &NoProgress).await.unwrap();
        assert!(pinned_local.cached);
        assert_eq!(orch.local.calls(), 1);
    }

    #[tokio::test]
    async fn double_failure_reports_both_causes() {
        let orch = orchestrator(
            Some("sk-test"),
            false,
            FakeRemote::replying(None),
            FakeLocal::replying(None, &["llama3"]),
        )
        .await;

        let err = orch.generate(&request(None), &NoProgress).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("remote exploded"), "{message}");
        assert!(message.contains("connection refused"), "{message}");
        assert_eq!(orch.remote.calls(), 1);
        assert_eq!(orch.local.calls(), 1);
    }

    #[tokio::test]
    async fn failed_pull_falls_back_to_remote_without_key() {
        let mut local = FakeLocal::replying(Some("never"), &[]);
        local.pull_succeeds = false;
        let orch = orchestrator(None, true, FakeRemote::replying(Some("never")), local).await;

        let err = orch.generate(&request(None), &NoProgress).await.unwrap_err();
        match &err {
            GenerationError::AllBackendsFailed { primary, .. } => {
                assert!(matches!(**primary, GenerationError::ModelNotFound { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            err.final_cause(),
            GenerationError::Auth {
                backend: Backend::Remote,
                ..
            }
        ));
        assert_eq!(orch.local.pulls(), 1);
        assert_eq!(orch.local.calls(), 0);
    }

    #[tokio::test]
    async fn missing_model_is_pulled_once_then_used() {
        let orch = orchestrator(
            None,
            true,
            FakeRemote::replying(None),
            FakeLocal::replying(Some("pulled text"), &[]),
        )
        .await;

        let generated = orch.generate(&request(None), &NoProgress).await.unwrap();
        assert_eq!(generated.text, "pulled text");
        assert_eq!(orch.local.pulls(), 1);
        assert_eq!(orch.remote.calls(), 0);
    }

    #[tokio::test]
    async fn override_pins_the_backend() {
        let orch = orchestrator(
            Some("sk-test"),
            false,
            FakeRemote::replying(Some("remote text")),
            FakeLocal::replying(None, &["llama3"]),
        )
        .await;

        let err = orch
            .generate(&request(Some(Backend::Local)), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Connection { .. }));
        assert_eq!(orch.remote.calls(), 0);
    }

    #[tokio::test]
    async fn missing_settings_is_a_configuration_error() {
        let pool = memory_pool().await;
        let orch = Orchestrator::new(pool, FakeRemote::replying(Some("x")), FakeLocal::replying(None, &[]), None);
        let sink = RecordingSink(Mutex::new(Vec::new()));

        let err = orch.generate(&request(None), &sink).await.unwrap_err();
        assert!(matches!(err, GenerationError::Configuration(_)));
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(orch.remote.calls(), 0);
    }

    #[test]
    fn plan_has_at_most_two_distinct_backends() {
        assert_eq!(attempt_plan(Backend::Remote, false), vec![Backend::Remote, Backend::Local]);
        assert_eq!(attempt_plan(Backend::Local, false), vec![Backend::Local, Backend::Remote]);
        assert_eq!(attempt_plan(Backend::Local, true), vec![Backend::Local]);
    }
}
