use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Config, GenerationConfig, SchedulerConfig, TopicConfig};
use crate::models::{
    Backend, GenerationSettings, Job, JobStatus, LocalModelRecord, SchedulerSettingsRow, Style, Topic,
};

/// All post columns in SELECT order (must match Job struct field order).
const JOB_COLUMNS: &str = "id, topic_id, status, progress, title, content, language, style, priority,
    backend, model_used, error, created_at, published_at, message_id, edited";

const TOPIC_COLUMNS: &str = "id, name, description, language, style, priority, is_active";

const GENERATION_COLUMNS: &str = "id, name, api_key, remote_model, local_model, use_local_model,
    temperature, max_tokens, top_p, frequency_penalty, presence_penalty, is_active";

const SCHEDULER_COLUMNS: &str =
    "id, name, publish_interval, custom_interval, publish_time, publish_day, max_posts_per_day, is_active";

/// Tables that hold at most one active record.
#[derive(Debug, Clone, Copy)]
enum ExclusiveTable {
    Generation,
    Scheduler,
    LocalModels,
}

impl ExclusiveTable {
    fn table(self) -> &'static str {
        match self {
            ExclusiveTable::Generation => "generation_settings",
            ExclusiveTable::Scheduler => "scheduler_settings",
            ExclusiveTable::LocalModels => "local_models",
        }
    }
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Config sync ────────────────────────────────────────────────────────

/// Upsert a topic by name.
pub async fn upsert_topic(pool: &SqlitePool, topic: &TopicConfig, language: &str) -> Result<String> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM topics WHERE name = ?")
        .bind(&topic.name)
        .fetch_optional(pool)
        .await
        .context("checking for existing topic")?;

    let id = if let Some((existing_id,)) = existing {
        sqlx::query(
            "UPDATE topics SET description = ?, language = ?, style = ?, priority = ?, is_active = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?",
        )
        .bind(&topic.description)
        .bind(language)
        .bind(topic.style)
        .bind(topic.priority)
        .bind(topic.active)
        .bind(&existing_id)
        .execute(pool)
        .await
        .context("updating topic")?;

        debug!(name = %topic.name, id = %existing_id, "updated topic");
        existing_id
    } else {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO topics (id, name, description, language, style, priority, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&topic.name)
        .bind(&topic.description)
        .bind(language)
        .bind(topic.style)
        .bind(topic.priority)
        .bind(topic.active)
        .execute(pool)
        .await
        .context("inserting topic")?;

        debug!(name = %topic.name, id = %id, "created topic");
        id
    };

    Ok(id)
}

/// Upsert generation settings by name. New records start inactive.
pub async fn upsert_generation_settings(pool: &SqlitePool, entry: &GenerationConfig) -> Result<()> {
    sqlx::query(
        "INSERT INTO generation_settings (id, name, api_key, remote_model, local_model, use_local_model,
         temperature, max_tokens, top_p, frequency_penalty, presence_penalty, is_active)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
         ON CONFLICT(name) DO UPDATE SET
           api_key = excluded.api_key,
           remote_model = excluded.remote_model,
           local_model = excluded.local_model,
           use_local_model = excluded.use_local_model,
           temperature = excluded.temperature,
           max_tokens = excluded.max_tokens,
           top_p = excluded.top_p,
           frequency_penalty = excluded.frequency_penalty,
           presence_penalty = excluded.presence_penalty,
           updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&entry.name)
    .bind(&entry.api_key)
    .bind(&entry.remote_model)
    .bind(&entry.local_model)
    .bind(entry.use_local_model)
    .bind(entry.temperature)
    .bind(i64::from(entry.max_tokens))
    .bind(entry.top_p)
    .bind(entry.frequency_penalty)
    .bind(entry.presence_penalty)
    .execute(pool)
    .await
    .context("upserting generation settings")?;
    Ok(())
}

/// Upsert scheduler settings by name. New records start inactive.
pub async fn upsert_scheduler_settings(pool: &SqlitePool, entry: &SchedulerConfig) -> Result<()> {
    sqlx::query(
        "INSERT INTO scheduler_settings (id, name, publish_interval, custom_interval, publish_time, publish_day,
         max_posts_per_day, is_active)
         VALUES (?, ?, ?, ?, ?, ?, ?, 0)
         ON CONFLICT(name) DO UPDATE SET
           publish_interval = excluded.publish_interval,
           custom_interval = excluded.custom_interval,
           publish_time = excluded.publish_time,
           publish_day = excluded.publish_day,
           max_posts_per_day = excluded.max_posts_per_day,
           updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&entry.name)
    .bind(entry.publish_interval.to_lowercase())
    .bind(entry.custom_interval.map(i64::from))
    .bind(&entry.publish_time)
    .bind(entry.publish_day.to_lowercase())
    .bind(i64::from(entry.max_posts_per_day))
    .execute(pool)
    .await
    .context("upserting scheduler settings")?;
    Ok(())
}

/// Sync topics and settings from config to DB.
///
/// Topics missing from the config are deactivated (their posts keep referencing
/// them). Settings missing from the config are deleted. Activation: an entry
/// marked `active = true` wins, otherwise the currently active record is kept
/// if it is still configured, otherwise the first entry is activated.
pub async fn sync_config_to_db(pool: &SqlitePool, config: &Config) -> Result<()> {
    let mut topic_names = HashSet::new();
    for topic in &config.topic {
        upsert_topic(pool, topic, &config.topic_language(topic)).await?;
        topic_names.insert(topic.name.as_str());
    }

    let db_topics: Vec<(String, String)> = sqlx::query_as("SELECT id, name FROM topics WHERE is_active = 1")
        .fetch_all(pool)
        .await
        .context("listing topics for cleanup")?;
    for (id, name) in &db_topics {
        if !topic_names.contains(name.as_str()) {
            sqlx::query("UPDATE topics SET is_active = 0 WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await
                .context("deactivating orphaned topic")?;
            debug!(name = %name, "deactivated topic no longer in config");
        }
    }

    for entry in &config.generation {
        upsert_generation_settings(pool, entry).await?;
    }
    let names: Vec<&str> = config.generation.iter().map(|g| g.name.as_str()).collect();
    let pinned = config.generation.iter().find(|g| g.active).map(|g| g.name.as_str());
    delete_unlisted(pool, ExclusiveTable::Generation, &names).await?;
    resolve_activation(pool, ExclusiveTable::Generation, &names, pinned).await?;

    for entry in &config.scheduler {
        upsert_scheduler_settings(pool, entry).await?;
    }
    let names: Vec<&str> = config.scheduler.iter().map(|s| s.name.as_str()).collect();
    let pinned = config.scheduler.iter().find(|s| s.active).map(|s| s.name.as_str());
    delete_unlisted(pool, ExclusiveTable::Scheduler, &names).await?;
    resolve_activation(pool, ExclusiveTable::Scheduler, &names, pinned).await?;

    Ok(())
}

async fn delete_unlisted(pool: &SqlitePool, table: ExclusiveTable, names: &[&str]) -> Result<()> {
    let query = format!("SELECT name FROM {}", table.table());
    let existing: Vec<(String,)> = sqlx::query_as(&query)
        .fetch_all(pool)
        .await
        .with_context(|| format!("listing {} for cleanup", table.table()))?;

    for (name,) in existing {
        if !names.contains(&name.as_str()) {
            let query = format!("DELETE FROM {} WHERE name = ?", table.table());
            sqlx::query(&query)
                .bind(&name)
                .execute(pool)
                .await
                .with_context(|| format!("deleting orphaned row from {}", table.table()))?;
            debug!(table = table.table(), name = %name, "deleted settings no longer in config");
        }
    }
    Ok(())
}

async fn resolve_activation(
    pool: &SqlitePool,
    table: ExclusiveTable,
    names: &[&str],
    pinned: Option<&str>,
) -> Result<()> {
    let target = match pinned {
        Some(name) => Some(name.to_string()),
        None => {
            let query = format!("SELECT name FROM {} WHERE is_active = 1", table.table());
            let current: Option<(String,)> = sqlx::query_as(&query)
                .fetch_optional(pool)
                .await
                .with_context(|| format!("reading active row of {}", table.table()))?;
            match current {
                Some((name,)) if names.contains(&name.as_str()) => None,
                _ => names.first().map(|n| n.to_string()),
            }
        }
    };

    if let Some(name) = target {
        activate_exclusive(pool, table, &name).await?;
    }
    Ok(())
}

/// Deactivate every row of `table`, then activate the one named `name`, in one
/// transaction. Fails (and rolls back) if no such row exists.
async fn activate_exclusive(pool: &SqlitePool, table: ExclusiveTable, name: &str) -> Result<()> {
    let mut tx = pool.begin().await.context("starting activation transaction")?;

    let query = format!("UPDATE {} SET is_active = 0 WHERE is_active = 1", table.table());
    sqlx::query(&query)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("deactivating {}", table.table()))?;

    let query = format!("UPDATE {} SET is_active = 1 WHERE name = ?", table.table());
    let result = sqlx::query(&query)
        .bind(name)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("activating '{name}' in {}", table.table()))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("no record named '{name}' in {}", table.table());
    }

    tx.commit().await.context("committing activation")?;
    info!(table = table.table(), name = %name, "activated record");
    Ok(())
}

pub async fn activate_generation_settings(pool: &SqlitePool, name: &str) -> Result<()> {
    activate_exclusive(pool, ExclusiveTable::Generation, name).await
}

pub async fn activate_scheduler_settings(pool: &SqlitePool, name: &str) -> Result<()> {
    activate_exclusive(pool, ExclusiveTable::Scheduler, name).await
}

pub async fn activate_local_model(pool: &SqlitePool, name: &str) -> Result<()> {
    activate_exclusive(pool, ExclusiveTable::LocalModels, name).await
}

pub async fn get_active_generation_settings(pool: &SqlitePool) -> Result<Option<GenerationSettings>> {
    let query = format!("SELECT {GENERATION_COLUMNS} FROM generation_settings WHERE is_active = 1");
    let settings = sqlx::query_as::<_, GenerationSettings>(&query)
        .fetch_optional(pool)
        .await
        .context("querying active generation settings")?;
    Ok(settings)
}

pub async fn get_active_scheduler_settings(pool: &SqlitePool) -> Result<Option<SchedulerSettingsRow>> {
    let query = format!("SELECT {SCHEDULER_COLUMNS} FROM scheduler_settings WHERE is_active = 1");
    let settings = sqlx::query_as::<_, SchedulerSettingsRow>(&query)
        .fetch_optional(pool)
        .await
        .context("querying active scheduler settings")?;
    Ok(settings)
}

// ── Topics ─────────────────────────────────────────────────────────────

pub async fn get_topic(pool: &SqlitePool, id: &str) -> Result<Option<Topic>> {
    let query = format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE id = ?");
    let topic = sqlx::query_as::<_, Topic>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("querying topic by id")?;
    Ok(topic)
}

pub async fn get_topic_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Topic>> {
    let query = format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE name = ?");
    let topic = sqlx::query_as::<_, Topic>(&query)
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("querying topic by name")?;
    Ok(topic)
}

pub async fn get_active_topics(pool: &SqlitePool) -> Result<Vec<Topic>> {
    let query = format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE is_active = 1 ORDER BY priority DESC, name ASC");
    let topics = sqlx::query_as::<_, Topic>(&query)
        .fetch_all(pool)
        .await
        .context("querying active topics")?;
    Ok(topics)
}

// ── Jobs (posts) ───────────────────────────────────────────────────────

/// Create a job in `draft` state for a topic.
pub async fn create_job(pool: &SqlitePool, topic: &Topic, style: Style, priority: i64) -> Result<Job> {
    let id = Uuid::new_v4().to_string();
    let created_at = Utc::now();

    sqlx::query(
        "INSERT INTO posts (id, topic_id, status, progress, content, language, style, priority, created_at)
         VALUES (?, ?, 'draft', 0, '', ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&topic.id)
    .bind(&topic.language)
    .bind(style)
    .bind(priority)
    .bind(format_ts(created_at))
    .execute(pool)
    .await
    .context("inserting job")?;

    get_job(pool, &id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {id} vanished after insert"))
}

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<Job>> {
    let query = format!("SELECT {JOB_COLUMNS} FROM posts WHERE id = ?");
    let job = sqlx::query_as::<_, Job>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("querying job")?;
    Ok(job)
}

pub async fn list_jobs(pool: &SqlitePool, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
    let jobs = match status {
        Some(status) => {
            let query = format!(
                "SELECT {JOB_COLUMNS} FROM posts WHERE status = ? ORDER BY priority DESC, created_at DESC LIMIT ?"
            );
            sqlx::query_as::<_, Job>(&query)
                .bind(status)
                .bind(limit)
                .fetch_all(pool)
                .await
        }
        None => {
            let query = format!("SELECT {JOB_COLUMNS} FROM posts ORDER BY created_at DESC LIMIT ?");
            sqlx::query_as::<_, Job>(&query).bind(limit).fetch_all(pool).await
        }
    }
    .context("listing jobs")?;
    Ok(jobs)
}

/// All jobs in `ready` state (the publish scheduler filters and orders them).
pub async fn get_ready_jobs(pool: &SqlitePool) -> Result<Vec<Job>> {
    list_jobs(pool, Some(JobStatus::Ready), i64::MAX).await
}

/// Number of jobs of a topic currently in `status`.
pub async fn count_topic_jobs(pool: &SqlitePool, topic_id: &str, status: JobStatus) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE topic_id = ? AND status = ?")
        .bind(topic_id)
        .bind(status)
        .fetch_one(pool)
        .await
        .context("counting topic jobs")?;
    Ok(count)
}

/// Number of jobs of a topic in `status` that were created in `[from, to)`.
pub async fn count_topic_jobs_created_between(
    pool: &SqlitePool,
    topic_id: &str,
    status: JobStatus,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM posts
         WHERE topic_id = ? AND status = ? AND created_at >= ? AND created_at < ?",
    )
    .bind(topic_id)
    .bind(status)
    .bind(format_ts(from))
    .bind(format_ts(to))
    .fetch_one(pool)
    .await
    .context("counting topic jobs created in range")?;
    Ok(count)
}

/// Status of the most recently created job of a topic.
pub async fn latest_topic_job_status(pool: &SqlitePool, topic_id: &str) -> Result<Option<JobStatus>> {
    let row: Option<(JobStatus,)> =
        sqlx::query_as("SELECT status FROM posts WHERE topic_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1")
            .bind(topic_id)
            .fetch_optional(pool)
            .await
            .context("fetching latest topic job")?;
    Ok(row.map(|(status,)| status))
}

/// Number of posts published in `[from, to)`.
pub async fn count_published_between(pool: &SqlitePool, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM posts WHERE status = 'published' AND published_at >= ? AND published_at < ?",
    )
    .bind(format_ts(from))
    .bind(format_ts(to))
    .fetch_one(pool)
    .await
    .context("counting published posts")?;
    Ok(count)
}

/// `draft -> generating`.
pub async fn start_job(pool: &SqlitePool, id: &str) -> Result<()> {
    let query = format!(
        "UPDATE posts SET status = 'generating', progress = 0, error = NULL
         WHERE id = ? AND status IN ({})",
        status_list(JobStatus::Generating.predecessors())
    );
    let result = sqlx::query(&query)
        .bind(id)
        .execute(pool)
        .await
        .context("starting job")?;
    if result.rows_affected() == 0 {
        anyhow::bail!("job {id} cannot start: not found or not in draft");
    }
    Ok(())
}

/// Raise the progress of a generating job. Never lowers it and never reaches
/// 100 (reserved for `complete_job`). Returns false if the job is no longer
/// generating.
pub async fn record_progress(pool: &SqlitePool, id: &str, progress: u8) -> Result<bool> {
    let progress = i64::from(progress.min(99));
    let result = sqlx::query(
        "UPDATE posts SET progress = MAX(progress, ?) WHERE id = ? AND status = 'generating'",
    )
    .bind(progress)
    .bind(id)
    .execute(pool)
    .await
    .context("recording job progress")?;
    Ok(result.rows_affected() > 0)
}

/// `generating -> ready`, storing the article.
pub async fn complete_job(
    pool: &SqlitePool,
    id: &str,
    title: &str,
    content: &str,
    backend: Backend,
    model: &str,
) -> Result<()> {
    let query = format!(
        "UPDATE posts SET status = 'ready', progress = 100, title = ?, content = ?, backend = ?, model_used = ?,
         error = NULL
         WHERE id = ? AND status IN ({})",
        status_list(JobStatus::Ready.predecessors())
    );
    let result = sqlx::query(&query)
        .bind(title)
        .bind(content)
        .bind(backend)
        .bind(model)
        .bind(id)
        .execute(pool)
        .await
        .context("completing job")?;
    if result.rows_affected() == 0 {
        anyhow::bail!("job {id} cannot become ready: not found or not generating");
    }
    Ok(())
}

/// Move a job to `failed` with progress 0. Returns false if the job was
/// already terminal (or missing).
pub async fn fail_job(pool: &SqlitePool, id: &str, error: &str) -> Result<bool> {
    let query = format!(
        "UPDATE posts SET status = 'failed', progress = 0, error = ?
         WHERE id = ? AND status IN ({})",
        status_list(JobStatus::Failed.predecessors())
    );
    let result = sqlx::query(&query)
        .bind(error)
        .bind(id)
        .execute(pool)
        .await
        .context("failing job")?;
    Ok(result.rows_affected() > 0)
}

/// `ready -> published`.
pub async fn mark_published(pool: &SqlitePool, id: &str, message_id: i64, at: DateTime<Utc>) -> Result<()> {
    let query = format!(
        "UPDATE posts SET status = 'published', published_at = ?, message_id = ?
         WHERE id = ? AND status IN ({})",
        status_list(JobStatus::Published.predecessors())
    );
    let result = sqlx::query(&query)
        .bind(format_ts(at))
        .bind(message_id)
        .bind(id)
        .execute(pool)
        .await
        .context("marking job published")?;
    if result.rows_affected() == 0 {
        anyhow::bail!("job {id} cannot be published: not found or not ready");
    }
    Ok(())
}

/// Replace the article of a ready or published post.
pub async fn update_content(pool: &SqlitePool, id: &str, title: &str, content: &str, edited: bool) -> Result<()> {
    let result = sqlx::query(
        "UPDATE posts SET title = ?, content = ?, edited = (edited OR ?)
         WHERE id = ? AND status IN ('ready', 'published')",
    )
    .bind(title)
    .bind(content)
    .bind(edited)
    .bind(id)
    .execute(pool)
    .await
    .context("updating post content")?;
    if result.rows_affected() == 0 {
        anyhow::bail!("post {id} cannot be edited: not found or not ready/published");
    }
    Ok(())
}

/// Fail every job still marked `generating` (left over from a previous process).
pub async fn fail_stale_generating_jobs(pool: &SqlitePool, reason: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE posts SET status = 'failed', progress = 0, error = ? WHERE status = 'generating'")
        .bind(reason)
        .execute(pool)
        .await
        .context("failing stale generating jobs")?;
    Ok(result.rows_affected())
}

// ── Local models ───────────────────────────────────────────────────────

/// Record a model as installed on the local server.
pub async fn upsert_local_model(pool: &SqlitePool, name: &str, details: &serde_json::Value, at: DateTime<Utc>) -> Result<()> {
    let details = serde_json::to_string(details).context("serializing model details")?;
    sqlx::query(
        "INSERT INTO local_models (name, is_installed, is_active, last_refreshed, details)
         VALUES (?, 1, 0, ?, ?)
         ON CONFLICT(name) DO UPDATE SET
           is_installed = 1,
           last_refreshed = excluded.last_refreshed,
           details = excluded.details",
    )
    .bind(name)
    .bind(format_ts(at))
    .bind(details)
    .execute(pool)
    .await
    .context("upserting local model")?;
    Ok(())
}

/// Mark models absent from `installed` as not installed. Returns the number changed.
pub async fn mark_missing_local_models(pool: &SqlitePool, installed: &[String], at: DateTime<Utc>) -> Result<u64> {
    let records = list_local_models(pool).await?;
    let mut changed = 0;
    for record in records {
        if record.is_installed && !installed.contains(&record.name) {
            sqlx::query("UPDATE local_models SET is_installed = 0, details = '{}', last_refreshed = ? WHERE name = ?")
                .bind(format_ts(at))
                .bind(&record.name)
                .execute(pool)
                .await
                .context("marking local model uninstalled")?;
            changed += 1;
        }
    }
    Ok(changed)
}

pub async fn list_local_models(pool: &SqlitePool) -> Result<Vec<LocalModelRecord>> {
    let models = sqlx::query_as::<_, LocalModelRecord>(
        "SELECT name, is_installed, is_active, last_refreshed, details FROM local_models ORDER BY name ASC",
    )
    .fetch_all(pool)
    .await
    .context("listing local models")?;
    Ok(models)
}

pub async fn get_active_local_model(pool: &SqlitePool) -> Result<Option<LocalModelRecord>> {
    let model = sqlx::query_as::<_, LocalModelRecord>(
        "SELECT name, is_installed, is_active, last_refreshed, details FROM local_models WHERE is_active = 1",
    )
    .fetch_optional(pool)
    .await
    .context("querying active local model")?;
    Ok(model)
}

// ── Key/value settings ─────────────────────────────────────────────────

/// Read a setting from the settings table.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("reading setting")?;
    Ok(row.map(|(v,)| v))
}

/// Upsert a setting in the settings table.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("upserting setting")?;
    Ok(())
}
