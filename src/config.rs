//! Environment-sourced configuration.
//!
//! One immutable [`Config`] is constructed at startup. Feature gates are
//! derived from "all required keys present": in production a missing
//! required key aborts startup, in development the affected feature
//! degrades to a no-op.

use std::env;
use std::time::Duration;

use anyhow::{bail, Result};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnv {
    Development,
    Production,
}

impl RunEnv {
    fn from_env() -> Self {
        match env::var("RAILGUARD_ENV").as_deref() {
            Ok("production") | Ok("prod") => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Railway platform settings.
#[derive(Clone)]
pub struct PlatformConfig {
    pub api_token: Option<String>,
    pub projects: Vec<String>,
    pub environments: Vec<String>,
    /// Empty means "all services in each environment".
    pub services: Vec<String>,
}

/// Slack settings.
#[derive(Clone)]
pub struct SlackConfig {
    pub bot_token: Option<String>,
    pub signing_secret: Option<String>,
    pub channel_id: Option<String>,
}

/// LLM settings.
#[derive(Clone)]
pub struct LlmConfig {
    pub default_provider: String,
    pub openai_key_present: bool,
    pub anthropic_key_present: bool,
}

/// Performance and tuning knobs.
#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_retry_attempts: u32,
    pub max_backoff: Duration,
    pub rate_limit_hr: u32,
    pub rate_limit_sec: u32,
    pub batch_window: Duration,
    pub buffer_capacity: usize,
    pub retention_days: i64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(env_u64("CONNECTION_TIMEOUT_S", 30)),
            heartbeat_interval: Duration::from_secs(env_u64("HEARTBEAT_INTERVAL_S", 30)),
            heartbeat_timeout: Duration::from_secs(env_u64("HEARTBEAT_TIMEOUT_S", 45)),
            max_retry_attempts: env_u64("MAX_RETRY_ATTEMPTS", 10) as u32,
            max_backoff: Duration::from_secs(env_u64("MAX_BACKOFF_S", 60)),
            rate_limit_hr: env_u64("RATE_LIMIT_HR", 10_000) as u32,
            rate_limit_sec: env_u64("RATE_LIMIT_SEC", 50) as u32,
            batch_window: Duration::from_secs(env_u64("BATCH_WINDOW_MIN_S", 5)),
            buffer_capacity: env_u64("LOG_BUFFER_CAPACITY", 1_000) as usize,
            retention_days: env_u64("RETENTION_DAYS", 90) as i64,
        }
    }
}

/// Which features are enabled, derived from key presence.
#[derive(Debug, Clone, Copy)]
pub struct FeatureGates {
    pub platform: bool,
    pub slack: bool,
    pub llm: bool,
}

/// Top-level immutable configuration.
#[derive(Clone)]
pub struct Config {
    pub run_env: RunEnv,
    pub port: u16,
    pub database_path: String,
    pub platform: PlatformConfig,
    pub slack: SlackConfig,
    pub llm: LlmConfig,
    pub performance: PerformanceConfig,
}

impl Config {
    /// Load from the process environment and validate for the deployment
    /// environment.
    pub fn load() -> Result<Self> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Read without validation (tests, `check-config`).
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            run_env: RunEnv::from_env(),
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "sqlite://railguard.db?mode=rwc".to_string()),
            platform: PlatformConfig {
                api_token: non_empty(env::var("RAILWAY_API_TOKEN").ok()),
                projects: csv(env::var("MONITORED_PROJECTS").ok()),
                environments: {
                    let environments = csv(env::var("MONITORED_ENVIRONMENTS").ok());
                    if environments.is_empty() {
                        vec!["production".to_string()]
                    } else {
                        environments
                    }
                },
                services: csv(env::var("MONITORED_SERVICES").ok()),
            },
            slack: SlackConfig {
                bot_token: non_empty(env::var("SLACK_BOT_TOKEN").ok()),
                signing_secret: non_empty(env::var("SLACK_SIGNING_SECRET").ok()),
                channel_id: non_empty(env::var("SLACK_CHANNEL_ID").ok()),
            },
            llm: LlmConfig {
                default_provider: env::var("LLM_DEFAULT_PROVIDER")
                    .unwrap_or_else(|_| "auto".to_string()),
                openai_key_present: non_empty(env::var("OPENAI_API_KEY").ok()).is_some(),
                anthropic_key_present: non_empty(env::var("ANTHROPIC_API_KEY").ok()).is_some(),
            },
            performance: PerformanceConfig::default(),
        }
    }

    /// Feature gates: a feature is on iff all of its required keys are
    /// present.
    #[must_use]
    pub fn gates(&self) -> FeatureGates {
        FeatureGates {
            platform: self.platform.api_token.is_some() && !self.platform.projects.is_empty(),
            slack: self.slack.bot_token.is_some()
                && self.slack.signing_secret.is_some()
                && self.slack.channel_id.is_some(),
            llm: self.llm.openai_key_present || self.llm.anthropic_key_present,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.run_env != RunEnv::Production {
            return Ok(());
        }

        let gates = self.gates();
        if self.platform.api_token.is_none() {
            bail!("RAILWAY_API_TOKEN is required in production");
        }
        if self.platform.projects.is_empty() {
            bail!("MONITORED_PROJECTS is required in production");
        }
        if !gates.slack {
            bail!(
                "SLACK_BOT_TOKEN, SLACK_SIGNING_SECRET and SLACK_CHANNEL_ID \
                 are required in production"
            );
        }
        if !gates.llm {
            bail!("at least one of OPENAI_API_KEY / ANTHROPIC_API_KEY is required in production");
        }
        match self.llm.default_provider.as_str() {
            "openai" | "anthropic" | "auto" => {}
            other => bail!("invalid LLM_DEFAULT_PROVIDER '{other}' (openai|anthropic|auto)"),
        }
        Ok(())
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn csv(value: Option<String>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
