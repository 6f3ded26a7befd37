use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which model backend produced (or should produce) a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Backend {
    Remote,
    Local,
}

impl Backend {
    /// The backend used as fallback when this one fails.
    pub fn other(self) -> Backend {
        match self {
            Backend::Remote => Backend::Local,
            Backend::Local => Backend::Remote,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Remote => f.write_str("remote"),
            Backend::Local => f.write_str("local"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "remote" => Ok(Backend::Remote),
            "local" => Ok(Backend::Local),
            other => Err(format!("unknown backend '{other}' (expected 'remote' or 'local')")),
        }
    }
}

/// Writing tone requested from the model.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Expert,
    Casual,
    Humorous,
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Style::Expert => f.write_str("expert"),
            Style::Casual => f.write_str("casual"),
            Style::Humorous => f.write_str("humorous"),
        }
    }
}

impl FromStr for Style {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "expert" => Ok(Style::Expert),
            "casual" => Ok(Style::Casual),
            "humorous" => Ok(Style::Humorous),
            other => Err(format!("unknown style '{other}' (expected expert, casual or humorous)")),
        }
    }
}

/// Lifecycle of a generation job.
///
/// `draft -> generating -> ready | failed`, `ready -> published | failed`.
/// `published` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Draft,
    Generating,
    Ready,
    Published,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Draft => "draft",
            JobStatus::Generating => "generating",
            JobStatus::Ready => "ready",
            JobStatus::Published => "published",
            JobStatus::Failed => "failed",
        }
    }

    /// States from which a transition into `self` is legal.
    pub fn predecessors(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Draft => &[],
            JobStatus::Generating => &[JobStatus::Draft],
            JobStatus::Ready => &[JobStatus::Generating],
            JobStatus::Published => &[JobStatus::Ready],
            JobStatus::Failed => &[JobStatus::Draft, JobStatus::Generating, JobStatus::Ready],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Published | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(JobStatus::Draft),
            "generating" => Ok(JobStatus::Generating),
            "ready" => Ok(JobStatus::Ready),
            "published" => Ok(JobStatus::Published),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    pub description: String,
    pub language: String,
    pub style: Style,
    pub priority: i64,
    pub is_active: bool,
}

/// One attempt to produce an article for a topic (a "post" once published).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: String,
    pub topic_id: String,
    pub status: JobStatus,
    pub progress: i64,
    pub title: Option<String>,
    pub content: String,
    pub language: String,
    pub style: Style,
    pub priority: i64,
    pub backend: Option<Backend>,
    pub model_used: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub message_id: Option<i64>,
    pub edited: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct GenerationSettings {
    pub id: String,
    pub name: String,
    pub api_key: Option<String>,
    pub remote_model: String,
    pub local_model: Option<String>,
    pub use_local_model: bool,
    pub temperature: f64,
    pub max_tokens: i64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub is_active: bool,
}

impl GenerationSettings {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_tokens: u32::try_from(self.max_tokens).unwrap_or(u32::MAX),
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
        }
    }
}

/// Sampling parameters shared by both backends.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

/// Raw scheduler settings row. Converted into `scheduler::SchedulerSettings`
/// before use.
#[derive(Debug, Clone, FromRow)]
pub struct SchedulerSettingsRow {
    pub id: String,
    pub name: String,
    pub publish_interval: String,
    pub custom_interval: Option<i64>,
    pub publish_time: String,
    pub publish_day: String,
    pub max_posts_per_day: i64,
    pub is_active: bool,
}

/// A model known to the local backend.
#[derive(Debug, Clone, FromRow)]
pub struct LocalModelRecord {
    pub name: String,
    pub is_installed: bool,
    pub is_active: bool,
    pub last_refreshed: DateTime<Utc>,
    pub details: String,
}

impl LocalModelRecord {
    pub fn details_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.details).unwrap_or_default()
    }

    pub fn status_label(&self) -> &'static str {
        if !self.is_installed {
            "not installed"
        } else if !self.is_active {
            "inactive"
        } else {
            "active"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_jobs_can_be_published() {
        assert_eq!(JobStatus::Published.predecessors(), &[JobStatus::Ready]);
        assert!(!JobStatus::Generating.predecessors().contains(&JobStatus::Published));
        assert!(!JobStatus::Failed.predecessors().contains(&JobStatus::Published));
        assert!(JobStatus::Published.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
    }

    #[test]
    fn backend_fallback_is_the_other_backend() {
        assert_eq!(Backend::Remote.other(), Backend::Local);
        assert_eq!(Backend::Local.other(), Backend::Remote);
        assert_eq!("LOCAL".parse::<Backend>().unwrap(), Backend::Local);
        assert!("ollama".parse::<Backend>().is_err());
    }

    #[test]
    fn style_parses_case_insensitively() {
        assert_eq!("Casual".parse::<Style>().unwrap(), Style::Casual);
        assert_eq!(Style::default(), Style::Expert);
        assert!("poetic".parse::<Style>().is_err());
    }
}
