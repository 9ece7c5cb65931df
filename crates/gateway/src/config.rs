//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `LLM_GATEWAY_CONFIG` > `llm-gateway.toml`.
//! API keys never appear in the TOML: each provider lists the names of the
//! environment variables holding its keys, resolved at load time.
//!
//! ```toml
//! [gateway]
//! provider = "google"
//! model = "gemini-2.5-flash"
//!
//! [fallback]
//! provider = "openrouter"
//! model = "deepseek/deepseek-chat-v3-0324:free"
//!
//! [[providers]]
//! id = "google"
//! key = "GOOGLE_API_KEY"
//! backup_keys = ["GOOGLE_API_KEY_2"]
//!
//! [[providers]]
//! id = "openrouter"
//! key = "OPENROUTER_API_KEY"
//!
//! [tasks.summarize]
//! provider = "openrouter"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use common::Secret;
use provider::{PatternTable, ProviderDescriptor, ResetRule, WireFormat};
use serde::Deserialize;
use tracing::warn;

use crate::machine::Target;

pub const CONFIG_ENV: &str = "LLM_GATEWAY_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "llm-gateway.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewaySection,
    #[serde(default)]
    pub fallback: Option<FallbackSection>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Named call profiles selected with `SendRequest::task`
    #[serde(default)]
    pub tasks: HashMap<String, TaskConfig>,
}

/// Call defaults
#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
    /// Whether calls may fall back when `[fallback]` is configured
    #[serde(default = "default_fallback")]
    pub fallback: bool,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Quota state file; defaults to the per-user cache directory
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackSection {
    pub provider: String,
    pub model: String,
}

/// Per-task target. Unset fields fall through to the gateway defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// One provider and its credential references.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    /// Environment variable holding the primary key
    pub key: String,
    /// Environment variables holding backup keys, in priority order
    #[serde(default)]
    pub backup_keys: Vec<String>,
    /// Model used when a call selects this provider without naming one
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub reset: Option<ResetConfig>,
    #[serde(default)]
    pub rpm: Option<u32>,
    #[serde(default)]
    pub rpd: Option<u32>,
    #[serde(default)]
    pub max_rate_limit_wait_secs: Option<u64>,
    /// Extra classification patterns, appended to the provider's row
    #[serde(default)]
    pub patterns: Option<PatternConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResetConfig {
    Daily {
        #[serde(default = "default_zone")]
        zone: String,
        #[serde(default = "default_reset_time")]
        at: String,
    },
    Monthly,
    Rolling,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatternConfig {
    /// Phrases that force rate-limited, checked before quota phrases
    #[serde(default)]
    pub rate_overrides: Vec<String>,
    #[serde(default)]
    pub quota_phrases: Vec<String>,
    #[serde(default)]
    pub rate_phrases: Vec<String>,
    #[serde(default)]
    pub quota_headers: Vec<String>,
    #[serde(default)]
    pub rate_headers: Vec<String>,
    #[serde(default)]
    pub quota_statuses: Vec<u16>,
    /// Headers carrying an explicit reset time (epoch seconds or millis)
    #[serde(default)]
    pub reset_headers: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_fallback() -> bool {
    true
}

fn default_attempt_timeout() -> u64 {
    60
}

fn default_zone() -> String {
    "UTC".to_string()
}

fn default_reset_time() -> String {
    "00:00".to_string()
}

fn config_error(message: impl Into<String>) -> common::Error {
    common::Error::Config(message.into())
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let gateway = &self.gateway;
        if Duration::try_from_secs_f64(gateway.retry_delay_secs).is_err() {
            return Err(config_error(format!(
                "retry_delay_secs must be a non-negative number within range, got {}",
                gateway.retry_delay_secs
            )));
        }
        if gateway.attempt_timeout_secs == 0 {
            return Err(config_error("attempt_timeout_secs must be greater than 0"));
        }
        if self.providers.is_empty() {
            return Err(config_error("at least one [[providers]] entry is required"));
        }

        let mut ids = HashSet::new();
        for provider in &self.providers {
            if !ids.insert(provider.id.as_str()) {
                return Err(config_error(format!(
                    "provider {} is declared more than once",
                    provider.id
                )));
            }
            provider.descriptor()?;
        }

        if !ids.contains(gateway.provider.as_str()) {
            return Err(common::Error::UnknownProvider(gateway.provider.clone()));
        }
        if let Some(fallback) = &self.fallback
            && !ids.contains(fallback.provider.as_str())
        {
            return Err(common::Error::UnknownProvider(fallback.provider.clone()));
        }
        for (name, task) in &self.tasks {
            if let Some(provider) = &task.provider
                && !ids.contains(provider.as_str())
            {
                return Err(config_error(format!(
                    "task {name} names undeclared provider {provider}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or `LLM_GATEWAY_CONFIG`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Base retry delay. Out-of-range values are rejected by `validate`, so
    /// the fallback only covers hand-built configs.
    pub fn retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.gateway.retry_delay_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_retry_delay()))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.attempt_timeout_secs)
    }

    pub fn fallback_target(&self) -> Option<Target> {
        self.fallback
            .as_ref()
            .map(|f| Target::new(&f.provider, &f.model))
    }
}

impl ProviderConfig {
    /// Built-in descriptor for this id with config overrides applied, or a
    /// fully custom descriptor when the id is not built in.
    pub fn descriptor(&self) -> common::Result<ProviderDescriptor> {
        let mut descriptor = match ProviderDescriptor::builtin(&self.id) {
            Some(builtin) => builtin,
            None => {
                let (Some(format), Some(base_url), Some(reset)) =
                    (&self.format, &self.base_url, &self.reset)
                else {
                    return Err(config_error(format!(
                        "provider {} is not built in; format, base_url and reset are required",
                        self.id
                    )));
                };
                ProviderDescriptor::custom(
                    &self.id,
                    reset.to_rule()?,
                    parse_format(format)?,
                    base_url,
                )
            }
        };

        if let Some(format) = &self.format {
            descriptor.wire = parse_format(format)?;
        }
        if let Some(base_url) = &self.base_url {
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err(config_error(format!(
                    "base_url for {} must start with http:// or https://, got: {base_url}",
                    self.id
                )));
            }
            descriptor.base_url = base_url.clone();
        }
        if let Some(reset) = &self.reset {
            descriptor.reset = reset.to_rule()?;
        }
        if self.rpm.is_some() {
            descriptor.rpm = self.rpm;
        }
        if self.rpd.is_some() {
            descriptor.rpd = self.rpd;
        }
        if let Some(secs) = self.max_rate_limit_wait_secs {
            descriptor.max_rate_limit_wait = Duration::from_secs(secs);
        }
        if let Some(patterns) = &self.patterns {
            descriptor.patterns.extend(patterns.clone().into());
        }
        Ok(descriptor)
    }

    /// Credential reference names in priority order.
    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.key.as_str()).chain(self.backup_keys.iter().map(String::as_str))
    }

    /// Resolve key references from the process environment.
    pub fn resolve_keys(&self) -> Vec<(String, Secret<String>)> {
        self.resolve_keys_with(|name| std::env::var(name).ok())
    }

    /// Resolve key references through `lookup`, skipping unset or blank ones.
    pub fn resolve_keys_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<(String, Secret<String>)> {
        self.key_names()
            .filter_map(|name| match lookup(name) {
                Some(value) if !value.trim().is_empty() => {
                    Some((name.to_string(), Secret::new(value.trim().to_string())))
                }
                _ => {
                    warn!(provider = %self.id, reference = name, "credential reference not set, skipping");
                    None
                }
            })
            .collect()
    }
}

impl ResetConfig {
    fn to_rule(&self) -> common::Result<ResetRule> {
        match self {
            ResetConfig::Daily { zone, at } => {
                let zone: Tz = zone
                    .parse()
                    .map_err(|_| config_error(format!("unknown time zone: {zone}")))?;
                let at = NaiveTime::parse_from_str(at, "%H:%M")
                    .map_err(|e| config_error(format!("invalid reset time {at}: {e}")))?;
                Ok(ResetRule::Daily { zone, at })
            }
            ResetConfig::Monthly => Ok(ResetRule::MonthlyUtc),
            ResetConfig::Rolling => Ok(ResetRule::Rolling),
        }
    }
}

impl From<PatternConfig> for PatternTable {
    fn from(config: PatternConfig) -> Self {
        PatternTable {
            rate_overrides: config.rate_overrides,
            quota_phrases: config.quota_phrases,
            rate_phrases: config.rate_phrases,
            quota_headers: config.quota_headers,
            rate_headers: config.rate_headers,
            quota_statuses: config.quota_statuses,
            reset_headers: config.reset_headers,
        }
    }
}

fn parse_format(value: &str) -> common::Result<WireFormat> {
    WireFormat::parse(value).ok_or_else(|| config_error(format!("unknown provider format: {value}")))
}
