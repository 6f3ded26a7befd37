use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::Style;

/// Language codes the prompt builder knows how to name.
pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "ru", "de", "fr", "es", "it", "uk", "pt"];

#[derive(Debug, Deserialize)]
pub struct Config {
    pub autoscribe: AutoscribeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub generation: Vec<GenerationConfig>,
    #[serde(default)]
    pub scheduler: Vec<SchedulerConfig>,
    #[serde(default)]
    pub topic: Vec<TopicConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AutoscribeConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_generations: u32,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_schedule_check_interval")]
    pub schedule_check_interval: String,
    #[serde(default = "default_generation_check_interval")]
    pub generation_check_interval: String,
    #[serde(default = "default_true")]
    pub auto_generate: bool,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_max_concurrent() -> u32 {
    2
}
fn default_language() -> String {
    "en".to_string()
}
fn default_schedule_check_interval() -> String {
    "1m".to_string()
}
fn default_generation_check_interval() -> String {
    "5m".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "autoscribe.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_api_url")]
    pub api_url: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: default_remote_api_url(),
            timeout: default_generation_timeout(),
        }
    }
}

fn default_remote_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_generation_timeout() -> String {
    "60s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout: String,
    #[serde(default = "default_health_timeout")]
    pub health_timeout: String,
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: default_local_base_url(),
            timeout: default_generation_timeout(),
            health_timeout: default_health_timeout(),
            pull_timeout: default_pull_timeout(),
        }
    }
}

fn default_local_base_url() -> String {
    "http://ollama:11434".to_string()
}
fn default_health_timeout() -> String {
    "5s".to_string()
}
fn default_pull_timeout() -> String {
    "10m".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> String {
    "24h".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,
    #[serde(default = "default_telegram_timeout")]
    pub timeout: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            channel_id: None,
            api_url: default_telegram_api_url(),
            timeout: default_telegram_timeout(),
        }
    }
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_telegram_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    pub name: String,
    pub api_key: Option<String>,
    #[serde(default = "default_remote_model")]
    pub remote_model: String,
    pub local_model: Option<String>,
    #[serde(default)]
    pub use_local_model: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default)]
    pub active: bool,
}

fn default_remote_model() -> String {
    "gpt-4".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_top_p() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,
    #[serde(default = "default_publish_interval")]
    pub publish_interval: String,
    pub custom_interval: Option<u32>,
    #[serde(default = "default_publish_time")]
    pub publish_time: String,
    #[serde(default = "default_publish_day")]
    pub publish_day: String,
    #[serde(default = "default_max_posts_per_day")]
    pub max_posts_per_day: u32,
    #[serde(default)]
    pub active: bool,
}

fn default_publish_interval() -> String {
    "daily".to_string()
}
fn default_publish_time() -> String {
    "09:00".to_string()
}
fn default_publish_day() -> String {
    "monday".to_string()
}
fn default_max_posts_per_day() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub language: Option<String>,
    #[serde(default)]
    pub style: Style,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.autoscribe.data_dir.join(db_path)
        }
    }

    /// Language used for a topic that does not set one.
    pub fn topic_language(&self, topic: &TopicConfig) -> String {
        topic
            .language
            .clone()
            .unwrap_or_else(|| self.autoscribe.default_language.clone())
    }

    /// Timezone used for publish slots and "today".
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.autoscribe
            .timezone
            .parse()
            .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", self.autoscribe.timezone)).into())
    }
}

/// Parse a humantime duration string that `validate_config` has already checked.
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration '{value}'"))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.autoscribe.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.autoscribe.version
        ))
        .into());
    }

    config
        .autoscribe
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", config.autoscribe.timezone)))?;

    if config.autoscribe.max_concurrent_generations == 0 {
        return Err(ConfigError::Validation("max_concurrent_generations must be at least 1".to_string()).into());
    }

    validate_language(&config.autoscribe.default_language)
        .map_err(|e| ConfigError::Validation(format!("default_language: {e}")))?;

    let durations = [
        ("schedule_check_interval", &config.autoscribe.schedule_check_interval),
        ("generation_check_interval", &config.autoscribe.generation_check_interval),
        ("remote.timeout", &config.remote.timeout),
        ("local.timeout", &config.local.timeout),
        ("local.health_timeout", &config.local.health_timeout),
        ("local.pull_timeout", &config.local.pull_timeout),
        ("cache.ttl", &config.cache.ttl),
        ("telegram.timeout", &config.telegram.timeout),
    ];
    for (name, value) in durations {
        humantime::parse_duration(value)
            .map_err(|e| ConfigError::Validation(format!("{name} '{value}': {e}")))?;
    }

    if config.telegram.bot_token.is_some() != config.telegram.channel_id.is_some() {
        return Err(ConfigError::Validation(
            "[telegram] requires both 'bot_token' and 'channel_id' (or neither)".to_string(),
        )
        .into());
    }

    validate_generation(&config.generation)?;
    validate_scheduler(&config.scheduler)?;

    let mut topic_names = HashSet::new();
    for topic in &config.topic {
        if topic.name.trim().is_empty() {
            return Err(ConfigError::Validation("topic name must not be empty".to_string()).into());
        }
        if !topic_names.insert(&topic.name) {
            return Err(ConfigError::Validation(format!("duplicate topic name: '{}'", topic.name)).into());
        }
        if let Some(ref language) = topic.language {
            validate_language(language)
                .map_err(|e| ConfigError::Validation(format!("topic '{}': {e}", topic.name)))?;
        }
    }

    Ok(())
}

fn validate_generation(entries: &[GenerationConfig]) -> Result<()> {
    let mut names = HashSet::new();
    let mut active = 0;
    for entry in entries {
        if !names.insert(&entry.name) {
            return Err(ConfigError::Validation(format!("duplicate generation settings name: '{}'", entry.name)).into());
        }
        if entry.active {
            active += 1;
        }
        if !(0.0..=2.0).contains(&entry.temperature) {
            return Err(ConfigError::Validation(format!(
                "generation '{}': temperature {} out of range 0.0..=2.0",
                entry.name, entry.temperature
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&entry.top_p) {
            return Err(ConfigError::Validation(format!(
                "generation '{}': top_p {} out of range 0.0..=1.0",
                entry.name, entry.top_p
            ))
            .into());
        }
        for (label, value) in [
            ("frequency_penalty", entry.frequency_penalty),
            ("presence_penalty", entry.presence_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                return Err(ConfigError::Validation(format!(
                    "generation '{}': {label} {value} out of range -2.0..=2.0",
                    entry.name
                ))
                .into());
            }
        }
        if entry.max_tokens == 0 {
            return Err(
                ConfigError::Validation(format!("generation '{}': max_tokens must be at least 1", entry.name)).into(),
            );
        }
        if entry.remote_model.trim().is_empty() {
            return Err(
                ConfigError::Validation(format!("generation '{}': remote_model must not be empty", entry.name)).into(),
            );
        }
    }
    if active > 1 {
        return Err(ConfigError::Validation("at most one [[generation]] entry may be active".to_string()).into());
    }
    Ok(())
}

fn validate_scheduler(entries: &[SchedulerConfig]) -> Result<()> {
    let mut names = HashSet::new();
    let mut active = 0;
    for entry in entries {
        if !names.insert(&entry.name) {
            return Err(ConfigError::Validation(format!("duplicate scheduler settings name: '{}'", entry.name)).into());
        }
        if entry.active {
            active += 1;
        }
        crate::scheduler::PublishInterval::from_parts(&entry.publish_interval, entry.custom_interval.map(i64::from))
            .map_err(|e| ConfigError::Validation(format!("scheduler '{}': {e}", entry.name)))?;
        validate_time(&entry.publish_time)
            .map_err(|e| ConfigError::Validation(format!("scheduler '{}': {e}", entry.name)))?;
        crate::scheduler::parse_weekday(&entry.publish_day)
            .map_err(|e| ConfigError::Validation(format!("scheduler '{}': {e}", entry.name)))?;
        if entry.max_posts_per_day == 0 {
            return Err(ConfigError::Validation(format!(
                "scheduler '{}': max_posts_per_day must be at least 1",
                entry.name
            ))
            .into());
        }
    }
    if active > 1 {
        return Err(ConfigError::Validation("at most one [[scheduler]] entry may be active".to_string()).into());
    }
    Ok(())
}

fn validate_language(code: &str) -> Result<(), String> {
    if SUPPORTED_LANGUAGES.contains(&code) {
        Ok(())
    } else {
        Err(format!(
            "unsupported language '{code}' (supported: {})",
            SUPPORTED_LANGUAGES.join(", ")
        ))
    }
}

fn validate_time(time_str: &str) -> Result<(), String> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 2 {
        return Err(format!("invalid time '{time_str}': expected HH:MM"));
    }
    let hour: u32 = parts[0].parse().map_err(|_| format!("invalid hour in '{time_str}'"))?;
    let minute: u32 = parts[1]
        .parse()
        .map_err(|_| format!("invalid minute in '{time_str}'"))?;
    if hour > 23 {
        return Err(format!("hour {hour} out of range in '{time_str}'"));
    }
    if minute > 59 {
        return Err(format!("minute {minute} out of range in '{time_str}'"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[autoscribe]
timezone = "UTC"

[local]
base_url = "http://127.0.0.1:11434"

[telegram]
bot_token = "123:abc"
channel_id = "@autoscribe_test"

[[generation]]
name = "openai"
api_key = "sk-test"
remote_model = "gpt-4"
local_model = "llama3"
active = true

[[generation]]
name = "offline"
use_local_model = true
local_model = "mistral"

[[scheduler]]
name = "mornings"
publish_time = "09:00"
max_posts_per_day = 2
active = true

[[scheduler]]
name = "every-six-hours"
publish_interval = "custom"
custom_interval = 6

[[topic]]
name = "Coffee brewing"
description = "Pour-over, espresso and cold brew techniques"
language = "en"

[[topic]]
name = "Home networking"
style = "casual"
priority = 3
"#;

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn sample_config_is_valid() {
        let config = parse_config(SAMPLE_CONFIG).unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.generation.len(), 2);
        assert_eq!(config.generation[0].temperature, 0.7);
        assert_eq!(config.generation[0].max_tokens, 2000);
        assert_eq!(config.local.pull_timeout, "10m");
        assert_eq!(config.cache.ttl, "24h");
        assert_eq!(config.topic[1].style, Style::Casual);
        assert_eq!(config.topic_language(&config.topic[1]), "en");
    }

    #[test]
    fn loads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_CONFIG.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.topic[0].name, "Coffee brewing");
        assert_eq!(config.db_path(), PathBuf::from("./data").join("autoscribe.db"));
    }

    #[test]
    fn rejects_two_active_generation_entries() {
        let content = SAMPLE_CONFIG.replace("use_local_model = true", "use_local_model = true\nactive = true");
        let config = parse_config(&content).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("at most one [[generation]]"));
    }

    #[test]
    fn custom_interval_is_required_for_custom_schedules() {
        let content = SAMPLE_CONFIG.replace("custom_interval = 6\n", "");
        let config = parse_config(&content).unwrap();
        assert!(validate_config(&config).is_err());

        let content = SAMPLE_CONFIG.replace("custom_interval = 6", "custom_interval = 0");
        let config = parse_config(&content).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_out_of_range_sampling_parameters() {
        let content = SAMPLE_CONFIG.replace("remote_model = \"gpt-4\"", "remote_model = \"gpt-4\"\ntop_p = 1.5");
        let config = parse_config(&content).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("top_p"));
    }

    #[test]
    fn rejects_unknown_language_and_half_configured_telegram() {
        let content = SAMPLE_CONFIG.replace("language = \"en\"", "language = \"xx\"");
        let config = parse_config(&content).unwrap();
        assert!(validate_config(&config).is_err());

        let content = SAMPLE_CONFIG.replace("channel_id = \"@autoscribe_test\"\n", "");
        let config = parse_config(&content).unwrap();
        assert!(validate_config(&config).is_err());
    }
}
