//! Static provider descriptors
//!
//! A descriptor is immutable configuration data shared by every credential of
//! a provider: when its period quota resets, its published limits, how long a
//! rate-limit backoff may wait, which wire format it speaks and the pattern
//! row used to classify its failures.

use std::fmt;
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::classify::PatternTable;

/// Upper bound on a single rate-limit backoff unless a provider declares its own.
pub const DEFAULT_MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Provider identifiers with a built-in descriptor.
pub const BUILTIN_PROVIDERS: &[&str] = &["google", "openrouter", "anthropic", "openai"];

/// When a provider's period quota resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRule {
    /// Every day at a fixed civil time in a named zone (DST-aware).
    Daily { zone: Tz, at: NaiveTime },
    /// 00:00 UTC on the first day of each month.
    MonthlyUtc,
    /// Sliding-window limits with no fixed boundary. Exhaustion is never
    /// persisted for these providers.
    Rolling,
}

impl ResetRule {
    /// Daily reset at local midnight in `zone`.
    pub fn daily_midnight(zone: Tz) -> Self {
        ResetRule::Daily {
            zone,
            at: NaiveTime::MIN,
        }
    }

    pub fn is_rolling(&self) -> bool {
        matches!(self, ResetRule::Rolling)
    }
}

impl fmt::Display for ResetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetRule::Daily { zone, at } => write!(f, "daily {} {}", at.format("%H:%M"), zone),
            ResetRule::MonthlyUtc => f.write_str("monthly UTC"),
            ResetRule::Rolling => f.write_str("rolling"),
        }
    }
}

/// Request/response shape spoken by a provider's HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `POST {base}/chat/completions` (OpenAI, OpenRouter, compatible servers)
    OpenAiChat,
    /// `POST {base}/v1/messages`
    AnthropicMessages,
    /// `POST {base}/v1beta/models/{model}:generateContent`
    GeminiGenerate,
}

impl WireFormat {
    /// Parse the config spelling (`openai`, `anthropic`, `gemini`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "openai" | "openai_chat" => Some(WireFormat::OpenAiChat),
            "anthropic" | "anthropic_messages" => Some(WireFormat::AnthropicMessages),
            "gemini" | "google" => Some(WireFormat::GeminiGenerate),
            _ => None,
        }
    }
}

/// Immutable description of one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub id: String,
    pub reset: ResetRule,
    /// Requests per minute, informational
    pub rpm: Option<u32>,
    /// Requests per day, informational
    pub rpd: Option<u32>,
    /// Cap on any single backoff wait for this provider
    pub max_rate_limit_wait: Duration,
    pub wire: WireFormat,
    pub base_url: String,
    pub patterns: PatternTable,
}

impl ProviderDescriptor {
    /// Built-in descriptor for a known provider id.
    pub fn builtin(id: &str) -> Option<Self> {
        let descriptor = match id {
            "google" => Self {
                id: id.to_string(),
                reset: ResetRule::daily_midnight(chrono_tz::America::Los_Angeles),
                rpm: Some(15),
                rpd: Some(1500),
                max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
                wire: WireFormat::GeminiGenerate,
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                patterns: PatternTable::for_provider(id),
            },
            "openrouter" => Self {
                id: id.to_string(),
                reset: ResetRule::daily_midnight(chrono_tz::UTC),
                rpm: Some(20),
                rpd: Some(50),
                max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
                wire: WireFormat::OpenAiChat,
                base_url: "https://openrouter.ai/api/v1".to_string(),
                patterns: PatternTable::for_provider(id),
            },
            "anthropic" => Self {
                id: id.to_string(),
                reset: ResetRule::MonthlyUtc,
                rpm: Some(50),
                rpd: None,
                max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
                wire: WireFormat::AnthropicMessages,
                base_url: "https://api.anthropic.com".to_string(),
                patterns: PatternTable::for_provider(id),
            },
            "openai" => Self {
                id: id.to_string(),
                reset: ResetRule::Rolling,
                rpm: None,
                rpd: None,
                max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
                wire: WireFormat::OpenAiChat,
                base_url: "https://api.openai.com/v1".to_string(),
                patterns: PatternTable::for_provider(id),
            },
            _ => return None,
        };
        Some(descriptor)
    }

    /// Descriptor for a provider declared entirely in configuration. Starts
    /// from the generic pattern row.
    pub fn custom(id: &str, reset: ResetRule, wire: WireFormat, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            reset,
            rpm: None,
            rpd: None,
            max_rate_limit_wait: DEFAULT_MAX_RATE_LIMIT_WAIT,
            wire,
            base_url: base_url.to_string(),
            patterns: PatternTable::generic(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_resolves() {
        for id in BUILTIN_PROVIDERS {
            let d = ProviderDescriptor::builtin(id).unwrap();
            assert_eq!(d.id, *id);
            assert!(d.base_url.starts_with("https://"));
            assert!(!d.patterns.quota_phrases.is_empty(), "{id} has no quota row");
        }
        assert!(ProviderDescriptor::builtin("mistral").is_none());
    }

    #[test]
    fn google_resets_at_pacific_midnight() {
        let google = ProviderDescriptor::builtin("google").unwrap();
        assert_eq!(
            google.reset,
            ResetRule::Daily {
                zone: chrono_tz::America::Los_Angeles,
                at: NaiveTime::MIN
            }
        );
        assert_eq!(google.reset.to_string(), "daily 00:00 America/Los_Angeles");
    }

    #[test]
    fn only_openai_is_rolling() {
        let rolling: Vec<&str> = BUILTIN_PROVIDERS
            .iter()
            .copied()
            .filter(|id| ProviderDescriptor::builtin(id).unwrap().reset.is_rolling())
            .collect();
        assert_eq!(rolling, vec!["openai"]);
    }

    #[test]
    fn wire_format_parses_config_spellings() {
        assert_eq!(WireFormat::parse("OpenAI"), Some(WireFormat::OpenAiChat));
        assert_eq!(
            WireFormat::parse("anthropic"),
            Some(WireFormat::AnthropicMessages)
        );
        assert_eq!(WireFormat::parse("gemini"), Some(WireFormat::GeminiGenerate));
        assert_eq!(WireFormat::parse("grpc"), None);
    }

    #[test]
    fn custom_descriptor_uses_generic_patterns() {
        let d = ProviderDescriptor::custom(
            "local",
            ResetRule::Rolling,
            WireFormat::OpenAiChat,
            "http://127.0.0.1:11434/v1",
        );
        assert_eq!(d.patterns, PatternTable::generic());
        assert_eq!(d.max_rate_limit_wait, DEFAULT_MAX_RATE_LIMIT_WAIT);
    }
}
