use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{ModelManager, TextGenerator};
use crate::jobs::Dispatcher;
use crate::models::{Job, JobStatus, SchedulerSettingsRow};
use crate::publish::{self, Publisher, Trigger};

/// Which minutes of the day are publish slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishInterval {
    /// Every hour at the minute of `publish_time`.
    Hourly,
    /// Once a day at `publish_time`.
    Daily,
    /// At `publish_time` on `publish_day`.
    Weekly,
    /// At `publish_time` and every N hours after it, within the same day.
    Custom(u32),
}

impl PublishInterval {
    /// Build from the stored `(publish_interval, custom_interval)` pair.
    /// A custom interval is required for `custom` and rejected otherwise.
    pub fn from_parts(kind: &str, custom: Option<i64>) -> Result<Self> {
        match (kind, custom) {
            ("hourly", None) => Ok(PublishInterval::Hourly),
            ("daily", None) => Ok(PublishInterval::Daily),
            ("weekly", None) => Ok(PublishInterval::Weekly),
            ("custom", Some(hours)) if (1..=24).contains(&hours) => Ok(PublishInterval::Custom(hours as u32)),
            ("custom", Some(hours)) => anyhow::bail!("custom_interval must be between 1 and 24 hours, got {hours}"),
            ("custom", None) => anyhow::bail!("publish_interval 'custom' requires custom_interval"),
            ("hourly" | "daily" | "weekly", Some(_)) => {
                anyhow::bail!("custom_interval is only allowed with publish_interval 'custom'")
            }
            (other, _) => anyhow::bail!("unknown publish_interval '{other}' (expected hourly, daily, weekly or custom)"),
        }
    }
}

pub fn parse_weekday(s: &str) -> Result<Weekday> {
    match s.to_lowercase().as_str() {
        "monday" | "mon" => Ok(Weekday::Mon),
        "tuesday" | "tue" => Ok(Weekday::Tue),
        "wednesday" | "wed" => Ok(Weekday::Wed),
        "thursday" | "thu" => Ok(Weekday::Thu),
        "friday" | "fri" => Ok(Weekday::Fri),
        "saturday" | "sat" => Ok(Weekday::Sat),
        "sunday" | "sun" => Ok(Weekday::Sun),
        _ => anyhow::bail!("unknown weekday '{s}'"),
    }
}

/// Parsed, validated scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub name: String,
    pub interval: PublishInterval,
    pub publish_time: NaiveTime,
    pub publish_day: Weekday,
    pub max_posts_per_day: u32,
    pub is_active: bool,
}

impl TryFrom<SchedulerSettingsRow> for SchedulerSettings {
    type Error = anyhow::Error;

    fn try_from(row: SchedulerSettingsRow) -> Result<Self> {
        let interval = PublishInterval::from_parts(&row.publish_interval, row.custom_interval)
            .with_context(|| format!("scheduler settings '{}'", row.name))?;
        let publish_time = NaiveTime::parse_from_str(&row.publish_time, "%H:%M")
            .with_context(|| format!("scheduler settings '{}': invalid publish_time", row.name))?;
        let publish_day =
            parse_weekday(&row.publish_day).with_context(|| format!("scheduler settings '{}'", row.name))?;
        Ok(Self {
            name: row.name,
            interval,
            publish_time,
            publish_day,
            max_posts_per_day: u32::try_from(row.max_posts_per_day).unwrap_or(0),
            is_active: row.is_active,
        })
    }
}

impl SchedulerSettings {
    /// Whether the minute containing `now` (in `tz`) is a publish slot.
    pub fn is_publish_slot(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        let local = now.with_timezone(&tz);
        let (hour, minute) = (local.hour(), local.minute());
        let (at_hour, at_minute) = (self.publish_time.hour(), self.publish_time.minute());

        match self.interval {
            PublishInterval::Hourly => minute == at_minute,
            PublishInterval::Daily => (hour, minute) == (at_hour, at_minute),
            PublishInterval::Weekly => local.weekday() == self.publish_day && (hour, minute) == (at_hour, at_minute),
            PublishInterval::Custom(every) => {
                minute == at_minute && hour >= at_hour && (hour - at_hour) % every == 0
            }
        }
    }
}

/// Identifies the minute a slot fired in, so a loop ticking more than once a
/// minute still publishes once per slot.
pub fn slot_key(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%Y-%m-%dT%H:%M").to_string()
}

/// UTC bounds of the local day containing `now`.
pub fn local_day_bounds(now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = now.with_timezone(&tz).date_naive();
    let start_of = |d: chrono::NaiveDate| {
        tz.from_local_datetime(&d.and_time(NaiveTime::MIN))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    };
    let start = start_of(date).unwrap_or(now - chrono::Duration::hours(24));
    let end = date
        .succ_opt()
        .and_then(start_of)
        .unwrap_or(start + chrono::Duration::hours(24));
    (start, end)
}

/// Pick the ready jobs to publish at `now`.
///
/// Nothing is selected when the settings are inactive or `now` is not a
/// publish slot. Otherwise up to `max_posts_per_day - published_today` ready
/// jobs created on the current local date are returned, highest priority
/// first, newest first within a priority.
pub fn select_posts_to_publish(
    settings: &SchedulerSettings,
    jobs: &[Job],
    published_today: i64,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<Job> {
    if !settings.is_active || !settings.is_publish_slot(now, tz) {
        return Vec::new();
    }
    pick_ready_posts(settings, jobs, published_today, now, tz)
}

/// The quota, date and ordering rules of [`select_posts_to_publish`] without
/// the slot check. Used for manual publishing.
pub fn pick_ready_posts(
    settings: &SchedulerSettings,
    jobs: &[Job],
    published_today: i64,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<Job> {
    let remaining = i64::from(settings.max_posts_per_day) - published_today;
    if remaining <= 0 {
        return Vec::new();
    }

    let today = now.with_timezone(&tz).date_naive();
    let mut candidates: Vec<Job> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Ready && j.created_at.with_timezone(&tz).date_naive() == today)
        .cloned()
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.created_at.cmp(&a.created_at)));
    candidates.truncate(remaining as usize);
    candidates
}

/// Publish loop. Checks every `period` whether the current minute is a
/// publish slot and publishes due posts once per slot.
pub async fn publish_loop<P: Publisher + 'static>(
    pool: SqlitePool,
    publisher: Arc<P>,
    tz: Tz,
    period: Duration,
    cancel: CancellationToken,
) {
    info!(period = ?period, "publish scheduler started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_slot: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("publish scheduler shutting down");
                return;
            }
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        let slot = slot_key(now, tz);
        if last_slot.as_deref() == Some(slot.as_str()) {
            continue;
        }

        match publish::publish_due_posts(&pool, publisher.as_ref(), tz, now, Trigger::Slot).await {
            Ok(Some(report)) => {
                last_slot = Some(slot);
                if report.attempted > 0 {
                    info!(published = report.published, failed = report.failed, "publish slot processed");
                } else {
                    debug!("publish slot reached, nothing to publish");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "publish check failed"),
        }
    }
}

/// Content-generation loop: keeps one job underway or ready per active topic and day.
pub async fn generation_loop<R, L>(dispatcher: Dispatcher<R, L>, tz: Tz, period: Duration, cancel: CancellationToken)
where
    R: TextGenerator + 'static,
    L: TextGenerator + ModelManager + 'static,
{
    info!(period = ?period, "generation check started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("generation check shutting down");
                return;
            }
            _ = ticker.tick() => {}
        }

        match dispatcher.dispatch_idle_topics(Utc::now(), tz).await {
            Ok(0) => debug!("no idle topics"),
            Ok(started) => info!(started, "generation jobs dispatched"),
            Err(e) => error!(error = %e, "generation check failed"),
        }
    }
}
