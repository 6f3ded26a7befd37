use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::ModelManager;
use crate::backend::local::sync_local_models;
use crate::config::{Config, parse_duration};
use crate::jobs::Dispatcher;
use crate::orchestrator::Engine;
use crate::publish::TelegramBot;
use crate::{cleanup, db, scheduler, server, store};

const CACHE_PURGE_PERIOD: Duration = Duration::from_secs(3600);

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    store::sync_config_to_db(&pool, &config)
        .await
        .context("syncing config to database")?;
    info!("config synced to database");

    let interrupted = store::fail_stale_generating_jobs(&pool, "interrupted")
        .await
        .context("recovering interrupted jobs")?;
    if interrupted > 0 {
        warn!(count = interrupted, "jobs left generating by a previous run marked failed");
    }

    let api_token = bootstrap_api_token(&pool, &config).await?;

    let tz = config.tz()?;
    let schedule_period = parse_duration(&config.autoscribe.schedule_check_interval)?;
    let generation_period = parse_duration(&config.autoscribe.generation_check_interval)?;

    let engine = Arc::new(Engine::from_config(pool.clone(), &config)?);

    if engine.local().is_server_healthy().await {
        if let Err(e) = sync_local_models(&pool, engine.local()).await {
            warn!(error = %e, "local model sync failed");
        }
    } else {
        warn!(base_url = %config.local.base_url, "local model server unreachable, skipping model sync");
    }

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        pool.clone(),
        engine.clone(),
        config.autoscribe.max_concurrent_generations as usize,
        cancel.clone(),
    );

    let mut handles = Vec::new();

    match TelegramBot::from_config(&config.telegram)? {
        Some(bot) => {
            handles.push(tokio::spawn(scheduler::publish_loop(
                pool.clone(),
                Arc::new(bot),
                tz,
                schedule_period,
                cancel.clone(),
            )));
        }
        None => warn!("[telegram] bot_token/channel_id not set, publishing disabled"),
    }

    if config.autoscribe.auto_generate {
        handles.push(tokio::spawn(scheduler::generation_loop(
            dispatcher.clone(),
            tz,
            generation_period,
            cancel.clone(),
        )));
    }

    if let Some(cache) = engine.cache() {
        handles.push(tokio::spawn(cleanup::cache_purge_loop(
            cache.clone(),
            CACHE_PURGE_PERIOD,
            cancel.clone(),
        )));
    }

    let app_state = server::AppState {
        pool: pool.clone(),
        api_token,
        dispatcher,
    };

    let router = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.autoscribe.listen)
        .await
        .with_context(|| format!("binding to {}", config.autoscribe.listen))?;

    info!(listen = %config.autoscribe.listen, "HTTP server listening");

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await?;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        for handle in handles {
            let _ = handle.await;
        }
        let _ = server_handle.await;
    })
    .await;

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn bootstrap_api_token(pool: &SqlitePool, config: &Config) -> Result<String> {
    // Priority: config value, then stored value, then a fresh one.
    if let Some(ref token) = config.autoscribe.api_token {
        store::set_setting(pool, "api_token", token).await?;
        info!("using API token from config");
        return Ok(token.clone());
    }

    if let Some(token) = store::get_setting(pool, "api_token").await? {
        info!("using stored API token");
        return Ok(token);
    }

    let token = generate_token();
    store::set_setting(pool, "api_token", &token).await?;
    warn!(
        token = %token,
        "API token generated, save it: it won't be shown again"
    );
    Ok(token)
}

fn generate_token() -> String {
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SAMPLE_CONFIG, parse_config};
    use crate::db::memory_pool;

    #[tokio::test]
    async fn api_token_is_generated_once_and_reused() {
        let pool = memory_pool().await;
        let mut config = parse_config(SAMPLE_CONFIG).unwrap();
        config.autoscribe.api_token = None;

        let first = bootstrap_api_token(&pool, &config).await.unwrap();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(bootstrap_api_token(&pool, &config).await.unwrap(), first);

        config.autoscribe.api_token = Some("from-config".to_string());
        assert_eq!(bootstrap_api_token(&pool, &config).await.unwrap(), "from-config");
        assert_eq!(
            store::get_setting(&pool, "api_token").await.unwrap().as_deref(),
            Some("from-config")
        );
    }
}
