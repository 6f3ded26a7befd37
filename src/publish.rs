//! Publishing ready posts to a Telegram channel through the Bot API.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::article::assemble;
use crate::config::{TelegramConfig, parse_duration};
use crate::error::PublishError;
use crate::models::{Job, JobStatus};
use crate::scheduler::{SchedulerSettings, local_day_bounds, pick_ready_posts, select_posts_to_publish};
use crate::store;

/// Telegram rejects longer message texts.
pub const MESSAGE_LIMIT: usize = 4096;

pub trait Publisher: Send + Sync {
    /// Post `text` to the channel and return the new message id.
    fn send_message(&self, text: &str) -> impl Future<Output = Result<i64, PublishError>> + Send;

    fn edit_message(&self, message_id: i64, text: &str) -> impl Future<Output = Result<(), PublishError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramBot {
    client: Client,
    api_url: String,
    token: String,
    channel_id: String,
    timeout: Duration,
}

impl TelegramBot {
    /// `None` when no bot token or channel is configured.
    pub fn from_config(config: &TelegramConfig) -> Result<Option<Self>> {
        let (Some(token), Some(channel_id)) = (
            config.bot_token.as_deref().filter(|t| !t.is_empty()),
            config.channel_id.as_deref().filter(|c| !c.is_empty()),
        ) else {
            return Ok(None);
        };
        let client = Client::builder().build().context("building Telegram HTTP client")?;
        Ok(Some(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            channel_id: channel_id.to_string(),
            timeout: parse_duration(&config.timeout)?,
        }))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T, PublishError> {
        let url = format!("{}/bot{}/{}", self.api_url, self.token, method);
        let response = self.client.post(&url).timeout(self.timeout).json(&body).send().await?;
        let status = response.status();
        let parsed: ApiResponse<T> = response.json().await?;

        match parsed {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(PublishError::Api(format!(
                "{method} failed ({status}): {}",
                description.unwrap_or_else(|| "no description".to_string())
            ))),
        }
    }
}

impl Publisher for TelegramBot {
    async fn send_message(&self, text: &str) -> Result<i64, PublishError> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                json!({ "chat_id": self.channel_id, "text": message_text(text) }),
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn edit_message(&self, message_id: i64, text: &str) -> Result<(), PublishError> {
        // editMessageText answers with the edited message, or `true` for inline messages.
        let _: serde_json::Value = self
            .call(
                "editMessageText",
                json!({ "chat_id": self.channel_id, "message_id": message_id, "text": message_text(text) }),
            )
            .await?;
        Ok(())
    }
}

/// Post content as sent to the channel, cut to the message size limit.
pub fn message_text(content: &str) -> String {
    let length = content.chars().count();
    if length <= MESSAGE_LIMIT {
        return content.to_string();
    }
    warn!(length, limit = MESSAGE_LIMIT, "post exceeds message limit, truncating");
    content.chars().take(MESSAGE_LIMIT).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { message_id: i64 },
    Failed { error: String },
}

/// Send one ready post. Success marks it `published`; failure marks it
/// `failed` (there is no automatic retry). A store error after the send is
/// logged and does not change the outcome: the message is already out.
pub async fn publish_post(pool: &SqlitePool, publisher: &impl Publisher, job: &Job) -> PublishOutcome {
    match publisher.send_message(&job.content).await {
        Ok(message_id) => {
            info!(job = %job.id, message_id, title = job.title.as_deref().unwrap_or(""), "post published");
            if let Err(e) = store::mark_published(pool, &job.id, message_id, Utc::now()).await {
                error!(job = %job.id, message_id, error = %e, "post sent but not marked published");
            }
            PublishOutcome::Published { message_id }
        }
        Err(e) => {
            let error = format!("publish failed: {e}");
            error!(job = %job.id, error = %e, "publish failed");
            if let Err(store_err) = store::fail_job(pool, &job.id, &error).await {
                error!(job = %job.id, error = %store_err, "could not mark post failed");
            }
            PublishOutcome::Failed { error }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub attempted: usize,
    pub published: usize,
    pub failed: usize,
}

impl PublishReport {
    fn record(&mut self, outcome: &PublishOutcome) {
        self.attempted += 1;
        match outcome {
            PublishOutcome::Published { .. } => self.published += 1,
            PublishOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// How posts are chosen by [`publish_due_posts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Only inside a publish slot.
    Slot,
    /// Right now, still honoring the daily quota.
    Manual,
}

/// One scheduler pass. Returns `None` when no active scheduler settings exist
/// or (for [`Trigger::Slot`]) `now` is not a publish slot.
pub async fn publish_due_posts(
    pool: &SqlitePool,
    publisher: &impl Publisher,
    tz: Tz,
    now: DateTime<Utc>,
    trigger: Trigger,
) -> Result<Option<PublishReport>> {
    let Some(row) = store::get_active_scheduler_settings(pool).await? else {
        debug!("no active scheduler settings");
        return Ok(None);
    };
    let settings = SchedulerSettings::try_from(row)?;
    if !settings.is_active || (trigger == Trigger::Slot && !settings.is_publish_slot(now, tz)) {
        return Ok(None);
    }

    let (day_start, day_end) = local_day_bounds(now, tz);
    let published_today = store::count_published_between(pool, day_start, day_end).await?;
    let ready = store::get_ready_jobs(pool).await?;
    let selected = match trigger {
        Trigger::Slot => select_posts_to_publish(&settings, &ready, published_today, now, tz),
        Trigger::Manual => pick_ready_posts(&settings, &ready, published_today, now, tz),
    };
    debug!(
        scheduler = %settings.name,
        ready = ready.len(),
        published_today,
        selected = selected.len(),
        "publish selection"
    );

    let mut report = PublishReport::default();
    for job in &selected {
        let outcome = publish_post(pool, publisher, job).await;
        report.record(&outcome);
    }
    Ok(Some(report))
}

/// Publish a specific post, regardless of schedule and quota.
pub async fn publish_by_id(pool: &SqlitePool, publisher: &impl Publisher, id: &str) -> Result<PublishOutcome> {
    let job = store::get_job(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no post with id '{id}'"))?;
    if job.status != JobStatus::Ready {
        anyhow::bail!("post {id} is {}, only ready posts can be published", job.status);
    }
    Ok(publish_post(pool, publisher, &job).await)
}

/// Replace a post's content. Published posts are edited in the channel too.
pub async fn edit_post<P: Publisher>(
    pool: &SqlitePool,
    publisher: Option<&P>,
    id: &str,
    content: &str,
) -> Result<Job> {
    let job = store::get_job(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no post with id '{id}'"))?;
    let topic = store::get_topic(pool, &job.topic_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("topic of post {id} no longer exists"))?;
    let article = assemble(&topic.name, content);

    match job.status {
        JobStatus::Ready => {
            store::update_content(pool, id, &article.title, &article.content, false).await?;
        }
        JobStatus::Published => {
            let publisher =
                publisher.ok_or_else(|| PublishError::NotConfigured("Telegram bot token and channel".to_string()))?;
            let message_id = job
                .message_id
                .ok_or_else(|| anyhow::anyhow!("published post {id} has no message id"))?;
            publisher
                .edit_message(message_id, &article.content)
                .await
                .with_context(|| format!("editing message {message_id}"))?;
            store::update_content(pool, id, &article.title, &article.content, true).await?;
            info!(job = %id, message_id, "published post edited");
        }
        other => anyhow::bail!("post {id} is {other}, only ready or published posts can be edited"),
    }

    store::get_job(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("post {id} vanished after edit"))
}


#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use chrono::{NaiveTime, TimeZone};
    use serde_json::Value;

    use super::fakes::FakePublisher;
    use super::*;
    use crate::backend::test_server;
    use crate::config::SchedulerConfig;
    use crate::db::memory_pool;
    use crate::models::{Backend, Style, Topic};
    use crate::store::test_support::insert_topic;

    async fn ready_job(pool: &SqlitePool, topic: &Topic, priority: i64, title: &str) -> Job {
        let job = store::create_job(pool, topic, Style::Expert, priority).await.unwrap();
        store::start_job(pool, &job.id).await.unwrap();
        store::complete_job(pool, &job.id, title, &format!("<h1>{title}</h1>"), Backend::Remote, "gpt-4")
            .await
            .unwrap();
        store::get_job(pool, &job.id).await.unwrap().unwrap()
    }

    async fn activate_schedule(pool: &SqlitePool, max_posts_per_day: u32) {
        let entry = SchedulerConfig {
            name: "mornings".to_string(),
            publish_interval: "daily".to_string(),
            custom_interval: None,
            publish_time: "09:00".to_string(),
            publish_day: "monday".to_string(),
            max_posts_per_day,
            active: true,
        };
        store::upsert_scheduler_settings(pool, &entry).await.unwrap();
        store::activate_scheduler_settings(pool, "mornings").await.unwrap();
    }

    fn nine_today() -> DateTime<Utc> {
        let today = Utc::now().date_naive();
        Utc.from_utc_datetime(&today.and_time(NaiveTime::from_hms_opt(9, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn slot_publishes_top_priorities_once() {
        let pool = memory_pool().await;
        activate_schedule(&pool, 2).await;
        let topic = insert_topic(&pool, "Coffee brewing", "en").await;
        let low = ready_job(&pool, &topic, 1, "Low").await;
        let high = ready_job(&pool, &topic, 5, "High").await;
        let mid = ready_job(&pool, &topic, 3, "Mid").await;
        let publisher = FakePublisher::default();

        let report = publish_due_posts(&pool, &publisher, Tz::UTC, nine_today(), Trigger::Slot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(
            *publisher.sent.lock().unwrap(),
            vec!["<h1>High</h1>".to_string(), "<h1>Mid</h1>".to_string()]
        );

        let high = store::get_job(&pool, &high.id).await.unwrap().unwrap();
        assert_eq!(high.status, JobStatus::Published);
        assert_eq!(high.message_id, Some(101));
        assert!(high.published_at.is_some());
        assert_eq!(
            store::get_job(&pool, &mid.id).await.unwrap().unwrap().status,
            JobStatus::Published
        );
        assert_eq!(
            store::get_job(&pool, &low.id).await.unwrap().unwrap().status,
            JobStatus::Ready
        );

        // Quota is spent for today.
        let again = publish_due_posts(&pool, &publisher, Tz::UTC, nine_today(), Trigger::Slot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempted, 0);
    }

    /// Sends fine, but the post's record changes under it on the first send.
    struct RecordChangingPublisher {
        pool: SqlitePool,
        inner: FakePublisher,
    }

    impl Publisher for RecordChangingPublisher {
        async fn send_message(&self, text: &str) -> Result<i64, PublishError> {
            if self.inner.sent.lock().unwrap().is_empty() {
                let ready = store::get_ready_jobs(&self.pool).await.unwrap();
                let sending = ready.iter().find(|j| j.content == text).unwrap();
                store::fail_job(&self.pool, &sending.id, "withdrawn").await.unwrap();
            }
            self.inner.send_message(text).await
        }

        async fn edit_message(&self, message_id: i64, text: &str) -> Result<(), PublishError> {
            self.inner.edit_message(message_id, text).await
        }
    }

    #[tokio::test]
    async fn store_error_after_send_does_not_stop_the_pass() {
        let pool = memory_pool().await;
        activate_schedule(&pool, 2).await;
        let topic = insert_topic(&pool, "Coffee brewing", "en").await;
        let high = ready_job(&pool, &topic, 5, "High").await;
        let mid = ready_job(&pool, &topic, 3, "Mid").await;
        let publisher = RecordChangingPublisher {
            pool: pool.clone(),
            inner: FakePublisher::default(),
        };

        let report = publish_due_posts(&pool, &publisher, Tz::UTC, nine_today(), Trigger::Slot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.published, 2);
        assert_eq!(publisher.inner.sent.lock().unwrap().len(), 2);

        let high = store::get_job(&pool, &high.id).await.unwrap().unwrap();
        assert_eq!(high.status, JobStatus::Failed);
        let mid = store::get_job(&pool, &mid.id).await.unwrap().unwrap();
        assert_eq!(mid.status, JobStatus::Published);
        assert_eq!(mid.message_id, Some(102));
    }

    #[tokio::test]
    async fn outside_a_slot_only_manual_trigger_publishes() {
        let pool = memory_pool().await;
        activate_schedule(&pool, 1).await;
        let topic = insert_topic(&pool, "Coffee brewing", "en").await;
        ready_job(&pool, &topic, 1, "Only").await;
        let publisher = FakePublisher::default();
        let off_slot = nine_today() + chrono::Duration::minutes(7);

        assert!(
            publish_due_posts(&pool, &publisher, Tz::UTC, off_slot, Trigger::Slot)
                .await
                .unwrap()
                .is_none()
        );
        let report = publish_due_posts(&pool, &publisher, Tz::UTC, off_slot, Trigger::Manual)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.published, 1);
    }

    #[tokio::test]
    async fn no_active_settings_means_nothing_to_do() {
        let pool = memory_pool().await;
        let publisher = FakePublisher::default();
        assert!(
            publish_due_posts(&pool, &publisher, Tz::UTC, nine_today(), Trigger::Slot)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn send_failure_fails_the_post_without_retry() {
        let pool = memory_pool().await;
        let topic = insert_topic(&pool, "Coffee brewing", "en").await;
        let job = ready_job(&pool, &topic, 1, "Doomed").await;
        let publisher = FakePublisher {
            fail: true,
            ..Default::default()
        };

        let outcome = publish_by_id(&pool, &publisher, &job.id).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Failed { .. }));

        let job = store::get_job(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 0);
        assert!(job.error.unwrap().contains("chat not found"));

        assert!(publish_by_id(&pool, &publisher, &job.id).await.is_err());
    }

    #[tokio::test]
    async fn editing_a_published_post_updates_the_channel() {
        let pool = memory_pool().await;
        let topic = insert_topic(&pool, "Coffee brewing", "en").await;
        let job = ready_job(&pool, &topic, 1, "Draft title").await;
        let publisher = FakePublisher::default();
        publish_by_id(&pool, &publisher, &job.id).await.unwrap();

        let updated = edit_post(&pool, Some(&publisher), &job.id, "<h1>Final title</h1><p>Fixed.</p>")
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Published);
        assert_eq!(updated.title.as_deref(), Some("Final title"));
        assert!(updated.edited);
        assert_eq!(
            *publisher.edited.lock().unwrap(),
            vec![(101, "<h1>Final title</h1><p>Fixed.</p>".to_string())]
        );

        // Without a publisher the channel copy cannot be updated.
        assert!(edit_post::<FakePublisher>(&pool, None, &job.id, "# x").await.is_err());
    }

    #[tokio::test]
    async fn editing_a_ready_post_stays_local() {
        let pool = memory_pool().await;
        let topic = insert_topic(&pool, "Coffee brewing", "en").await;
        let job = ready_job(&pool, &topic, 1, "Old").await;

        let updated = edit_post::<FakePublisher>(&pool, None, &job.id, "# New title\n\nBody").await.unwrap();
        assert_eq!(updated.title.as_deref(), Some("New title"));
        assert_eq!(updated.status, JobStatus::Ready);
        assert!(!updated.edited);
    }

    #[test]
    fn long_posts_are_truncated_to_the_limit() {
        let long = "é".repeat(MESSAGE_LIMIT + 10);
        assert_eq!(message_text(&long).chars().count(), MESSAGE_LIMIT);
        assert_eq!(message_text("short"), "short");
    }

    fn bot(base: &str) -> TelegramBot {
        TelegramBot::from_config(&TelegramConfig {
            bot_token: Some("test-token".to_string()),
            channel_id: Some("@autoscribe_test".to_string()),
            api_url: base.to_string(),
            timeout: "5s".to_string(),
        })
        .unwrap()
        .unwrap()
    }

    #[tokio::test]
    async fn bot_api_send_and_edit() {
        let router = Router::new()
            .route(
                "/bottest-token/sendMessage",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["chat_id"], "@autoscribe_test");
                    assert_eq!(body["text"], "hello");
                    Json(json!({"ok": true, "result": {"message_id": 42, "text": "hello"}}))
                }),
            )
            .route(
                "/bottest-token/editMessageText",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["message_id"], 42);
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"ok": false, "error_code": 400, "description": "Bad Request: message is not modified"})),
                    )
                }),
            );
        let base = test_server::spawn(router).await;
        let bot = bot(&base);

        assert_eq!(bot.send_message("hello").await.unwrap(), 42);
        match bot.edit_message(42, "hello").await.unwrap_err() {
            PublishError::Api(message) => assert!(message.contains("message is not modified")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bot_requires_token_and_channel() {
        let config = TelegramConfig {
            bot_token: None,
            channel_id: Some("@c".to_string()),
            api_url: "https://api.telegram.org".to_string(),
            timeout: "30s".to_string(),
        };
        assert!(TelegramBot::from_config(&config).unwrap().is_none());
    }
}
