mod article;
mod backend;
mod cache;
mod cleanup;
mod cli;
mod config;
mod daemon;
mod db;
mod error;
mod jobs;
mod models;
mod orchestrator;
mod publish;
mod scheduler;
mod server;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{ModelManager, OllamaClient};
use crate::backend::local::sync_local_models;
use crate::cli::{ActivateCommands, Cli, Commands, ModelCommands};
use crate::config::{Config, load_config, validate_config};
use crate::error::PublishError;
use crate::jobs::{Dispatcher, JobOptions};
use crate::models::JobStatus;
use crate::orchestrator::Engine;
use crate::publish::{PublishOutcome, TelegramBot, Trigger};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.autoscribe.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Generate {
            topic,
            style,
            backend,
            priority,
            output,
        }) => {
            let pool = open_store(&config).await?;
            let topic = store::get_topic_by_name(&pool, &topic)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no topic named '{topic}'"))?;

            let engine = Arc::new(Engine::from_config(pool.clone(), &config)?);
            let dispatcher = Dispatcher::new(pool.clone(), engine, 1, CancellationToken::new());
            let options = JobOptions {
                style,
                backend,
                priority,
            };
            let dispatched = dispatcher
                .dispatch(&topic, options)
                .await?
                .ok_or_else(|| anyhow::anyhow!("topic '{}' already has a generation in progress", topic.name))?;
            println!("Job {} started for '{}'", dispatched.job.id, topic.name);

            dispatched.handle.await.context("waiting for generation job")?;
            let job = store::get_job(&pool, &dispatched.job.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {} vanished", dispatched.job.id))?;

            if job.status != JobStatus::Ready {
                anyhow::bail!(
                    "generation failed: {}",
                    job.error.as_deref().unwrap_or("unknown error")
                );
            }
            let title = job.title.as_deref().unwrap_or(&topic.name);
            if let Some(output_path) = output {
                std::fs::write(&output_path, &job.content)
                    .with_context(|| format!("writing output to {}", output_path.display()))?;
                info!(path = %output_path.display(), "wrote article");
                println!("Article written to: {}", output_path.display());
            } else {
                println!("Article generated: {title}");
            }
            println!(
                "Backend: {} ({})",
                job.backend.map(|b| b.to_string()).unwrap_or_default(),
                job.model_used.as_deref().unwrap_or("unknown")
            );
        }
        Some(Commands::Publish { post }) => {
            let pool = open_store(&config).await?;
            let bot = TelegramBot::from_config(&config.telegram)?
                .ok_or_else(|| PublishError::NotConfigured("[telegram] bot_token and channel_id".to_string()))?;

            match post {
                Some(id) => match publish::publish_by_id(&pool, &bot, &id).await? {
                    PublishOutcome::Published { message_id } => println!("Published {id} as message {message_id}"),
                    PublishOutcome::Failed { error } => anyhow::bail!("{error}"),
                },
                None => {
                    let tz = config.tz()?;
                    match publish::publish_due_posts(&pool, &bot, tz, Utc::now(), Trigger::Manual).await? {
                        Some(report) => println!(
                            "Published {} post(s), {} failed",
                            report.published, report.failed
                        ),
                        None => println!("No active scheduler settings; nothing published."),
                    }
                }
            }
        }
        Some(Commands::Edit { post, file }) => {
            let content =
                std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let pool = open_store(&config).await?;
            let bot = TelegramBot::from_config(&config.telegram)?;
            let job = publish::edit_post(&pool, bot.as_ref(), &post, &content).await?;
            println!(
                "Post {} updated: {}{}",
                job.id,
                job.title.as_deref().unwrap_or(""),
                if job.status == JobStatus::Published {
                    " (channel message edited)"
                } else {
                    ""
                }
            );
        }
        Some(Commands::Jobs { status, limit }) => {
            let pool = open_store(&config).await?;
            let jobs = store::list_jobs(&pool, status, limit).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<10} {:>3}%  p{:<3} {}  {}",
                    job.id,
                    job.status,
                    job.progress,
                    job.priority,
                    job.created_at.format("%Y-%m-%d %H:%M"),
                    job.title.as_deref().or(job.error.as_deref()).unwrap_or("")
                );
            }
        }
        Some(Commands::Models { command }) => {
            let pool = open_store(&config).await?;
            match command {
                ModelCommands::List => {
                    for model in store::list_local_models(&pool).await? {
                        println!(
                            "{:<30} {:<14} refreshed {}",
                            model.name,
                            model.status_label(),
                            model.last_refreshed.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
                ModelCommands::Sync => {
                    let client = OllamaClient::new(&config.local)?;
                    let count = sync_local_models(&pool, &client).await?;
                    println!("{count} model(s) installed on {}", config.local.base_url);
                }
                ModelCommands::Pull { name } => {
                    let client = OllamaClient::new(&config.local)?;
                    client
                        .pull_model(&name)
                        .await
                        .with_context(|| format!("pulling model '{name}'"))?;
                    sync_local_models(&pool, &client).await?;
                    println!("Model '{name}' pulled.");
                }
                ModelCommands::Activate { name } => {
                    store::activate_local_model(&pool, &name).await?;
                    println!("Local model '{name}' is now active.");
                }
            }
        }
        Some(Commands::Activate { target }) => {
            let pool = open_store(&config).await?;
            match target {
                ActivateCommands::Generation { name } => {
                    store::activate_generation_settings(&pool, &name).await?;
                    println!("Generation settings '{name}' are now active.");
                }
                ActivateCommands::Scheduler { name } => {
                    store::activate_scheduler_settings(&pool, &name).await?;
                    println!("Scheduler settings '{name}' are now active.");
                }
            }
        }
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}

/// Open the database and bring it in line with the config file.
async fn open_store(config: &Config) -> Result<SqlitePool> {
    let pool = db::create_pool(config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    store::sync_config_to_db(&pool, config)
        .await
        .context("syncing config to database")?;
    Ok(pool)
}
