//! Failure classification for upstream responses
//!
//! Each provider owns one row of a pattern table. Classification checks the
//! row's rate overrides first, then its quota patterns (most severe), then its
//! rate-limit patterns, and only then falls back to the HTTP status. Patterns are matched as
//! case-insensitive substrings of the message plus a `name: value` dump of the
//! response headers. Adding a provider means adding a row, not a branch.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::descriptor::ProviderDescriptor;
use crate::{ErrorClassification, UpstreamFailure};

/// Bumped whenever a built-in row changes meaning.
pub const PATTERN_TABLE_VERSION: u32 = 2;

/// Reset values at or above this are epoch milliseconds, below it seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// One provider's classification patterns. Phrases are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternTable {
    /// Phrases that mark short-term throttling even when a quota phrase also
    /// matches (Gemini reports per-minute limits as "quota exceeded")
    pub rate_overrides: Vec<String>,
    /// Phrases indicating a period-based ceiling (RPD, monthly spend)
    pub quota_phrases: Vec<String>,
    /// Phrases indicating short-term throttling (RPM, TPM)
    pub rate_phrases: Vec<String>,
    /// Headers whose value `0` means the period allowance is gone
    pub quota_headers: Vec<String>,
    /// Headers whose value `0` means the per-minute allowance is gone
    pub rate_headers: Vec<String>,
    /// Status codes that always mean quota exhaustion for this provider
    pub quota_statuses: Vec<u16>,
    /// Headers carrying the provider's own reset time (epoch seconds or
    /// milliseconds). Also looked up in an error body's `metadata.headers`.
    pub reset_headers: Vec<String>,
}

struct StaticRow {
    rate_overrides: &'static [&'static str],
    quota_phrases: &'static [&'static str],
    rate_phrases: &'static [&'static str],
    quota_headers: &'static [&'static str],
    rate_headers: &'static [&'static str],
    quota_statuses: &'static [u16],
    reset_headers: &'static [&'static str],
}

const GENERIC: StaticRow = StaticRow {
    rate_overrides: &[],
    quota_phrases: &[
        "quota exceeded",
        "exceeded your current quota",
        "insufficient_quota",
        "spend limit",
        "credit limit",
        "daily limit",
        "daily quota",
        "requests per day",
    ],
    rate_phrases: &[
        "rate limit",
        "rate_limit",
        "too many requests",
        "requests per minute",
        "tokens per minute",
    ],
    quota_headers: &[],
    rate_headers: &[],
    quota_statuses: &[],
    reset_headers: &[],
};

// Gemini reports both per-minute and per-day ceilings as RESOURCE_EXHAUSTED
// with "quota exceeded"; only the metric name tells them apart.
const GOOGLE: StaticRow = StaticRow {
    rate_overrides: &["perminute", "per minute", "per_minute"],
    quota_phrases: &[
        "quota exceeded",
        "exceeded your current quota",
        "perday",
        "per day",
        "per_day",
        "daily limit",
        "daily quota",
        "generaterequestsperdayperprojectpermodel",
    ],
    rate_phrases: &[
        "resource_exhausted",
        "resourceexhausted",
        "rate limit",
        "too many requests",
    ],
    quota_headers: &[],
    rate_headers: &[],
    quota_statuses: &[],
    reset_headers: &[],
};

const OPENROUTER: StaticRow = StaticRow {
    rate_overrides: &[],
    quota_phrases: &[
        "free-models-per-day",
        "requests-per-day",
        "daily limit",
        "credit limit",
        "negative credit balance",
        "insufficient credits",
    ],
    rate_phrases: &[
        "free-models-per-min",
        "requests-per-minute",
        "rate limit",
        "too many requests",
    ],
    quota_headers: &[],
    rate_headers: &["x-ratelimit-remaining"],
    quota_statuses: &[402],
    reset_headers: &["x-ratelimit-reset"],
};

const OPENAI: StaticRow = StaticRow {
    rate_overrides: &[],
    quota_phrases: &[
        "insufficient_quota",
        "exceeded your current quota",
        "check your plan and billing details",
        "billing_hard_limit_reached",
    ],
    rate_phrases: &[
        "rate limit reached",
        "rate_limit_exceeded",
        "requests per minute",
        "tokens per minute",
        "too many requests",
    ],
    quota_headers: &[],
    rate_headers: &[
        "x-ratelimit-remaining-requests",
        "x-ratelimit-remaining-tokens",
    ],
    quota_statuses: &[],
    reset_headers: &[],
};

const ANTHROPIC: StaticRow = StaticRow {
    rate_overrides: &[],
    quota_phrases: &[
        "monthly spend limit",
        "spend limit",
        "monthly usage limit",
        "credit balance is too low",
        "credit limit exceeded",
        "organization limit exceeded",
    ],
    rate_phrases: &[
        "rate_limit_error",
        "rate limit",
        "requests per minute",
        "input tokens per minute",
        "output tokens per minute",
    ],
    quota_headers: &[],
    rate_headers: &[
        "anthropic-ratelimit-requests-remaining",
        "anthropic-ratelimit-tokens-remaining",
        "anthropic-ratelimit-input-tokens-remaining",
        "anthropic-ratelimit-output-tokens-remaining",
    ],
    quota_statuses: &[],
    reset_headers: &[],
};

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

impl From<&StaticRow> for PatternTable {
    fn from(row: &StaticRow) -> Self {
        Self {
            rate_overrides: owned(row.rate_overrides),
            quota_phrases: owned(row.quota_phrases),
            rate_phrases: owned(row.rate_phrases),
            quota_headers: owned(row.quota_headers),
            rate_headers: owned(row.rate_headers),
            quota_statuses: row.quota_statuses.to_vec(),
            reset_headers: owned(row.reset_headers),
        }
    }
}

impl PatternTable {
    /// Row used for providers without a dedicated one.
    pub fn generic() -> Self {
        Self::from(&GENERIC)
    }

    /// Built-in row for `provider_id`, or the generic row.
    pub fn for_provider(provider_id: &str) -> Self {
        let row = match provider_id {
            "google" => &GOOGLE,
            "openrouter" => &OPENROUTER,
            "openai" => &OPENAI,
            "anthropic" => &ANTHROPIC,
            _ => &GENERIC,
        };
        Self::from(row)
    }

    /// Append extra patterns (from configuration), lowercasing and skipping
    /// duplicates.
    pub fn extend(&mut self, other: PatternTable) {
        fn merge<T: PartialEq>(into: &mut Vec<T>, from: Vec<T>) {
            for item in from {
                if !into.contains(&item) {
                    into.push(item);
                }
            }
        }
        let lower = |v: Vec<String>| v.into_iter().map(|s| s.to_lowercase()).collect();
        merge(&mut self.rate_overrides, lower(other.rate_overrides));
        merge(&mut self.quota_phrases, lower(other.quota_phrases));
        merge(&mut self.rate_phrases, lower(other.rate_phrases));
        merge(&mut self.quota_headers, lower(other.quota_headers));
        merge(&mut self.rate_headers, lower(other.rate_headers));
        merge(&mut self.quota_statuses, other.quota_statuses);
        merge(&mut self.reset_headers, lower(other.reset_headers));
    }

    /// Reset time the provider reported with `failure`, if this row names a
    /// reset header and the failure carries a parseable value for it.
    pub fn reset_hint(&self, failure: &UpstreamFailure) -> Option<DateTime<Utc>> {
        if self.reset_headers.is_empty() {
            return None;
        }
        failure
            .headers
            .iter()
            .cloned()
            .chain(body_headers(&failure.message))
            .find(|(name, _)| self.reset_headers.contains(&name.to_lowercase()))
            .and_then(|(_, value)| parse_epoch(&value))
    }

    fn is_rate_override(&self, haystack: &str) -> bool {
        self.rate_overrides.iter().any(|p| haystack.contains(p.as_str()))
    }

    fn is_quota(&self, haystack: &str, failure: &UpstreamFailure) -> bool {
        failure
            .status
            .is_some_and(|s| self.quota_statuses.contains(&s))
            || self.quota_phrases.iter().any(|p| haystack.contains(p.as_str()))
            || zero_remaining(&self.quota_headers, failure)
    }

    fn is_rate_limited(&self, haystack: &str, failure: &UpstreamFailure) -> bool {
        self.rate_phrases.iter().any(|p| haystack.contains(p.as_str()))
            || zero_remaining(&self.rate_headers, failure)
    }
}

/// Headers a provider echoed inside a JSON error body
/// (`{"error": {"metadata": {"headers": {...}}}}`).
fn body_headers(message: &str) -> Vec<(String, String)> {
    let Ok(body) = serde_json::from_str::<Value>(message) else {
        return Vec::new();
    };
    let Some(headers) = body
        .pointer("/error/metadata/headers")
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    headers
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((name.clone(), value))
        })
        .collect()
}

fn parse_epoch(value: &str) -> Option<DateTime<Utc>> {
    let raw: i64 = value.trim().parse().ok()?;
    if raw >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(raw)
    } else {
        DateTime::from_timestamp(raw, 0)
    }
}

/// True when any of `names` is present with a value of `0`.
fn zero_remaining(names: &[String], failure: &UpstreamFailure) -> bool {
    if names.is_empty() {
        return false;
    }
    failure
        .headers
        .iter()
        .any(|(name, value)| value.trim() == "0" && names.contains(&name.to_lowercase()))
}

/// Classify a failed attempt against one pattern row.
///
/// Unmatched failures fall back on the status: no response, 408 and 5xx are
/// Transient, 429 is RateLimited, any other 4xx is Fatal.
pub fn classify(table: &PatternTable, failure: &UpstreamFailure) -> ErrorClassification {
    let haystack = failure.haystack();
    if table.is_rate_override(&haystack) {
        return ErrorClassification::RateLimited;
    }
    if table.is_quota(&haystack, failure) {
        return ErrorClassification::QuotaExhausted;
    }
    if table.is_rate_limited(&haystack, failure) {
        return ErrorClassification::RateLimited;
    }
    match failure.status {
        None => ErrorClassification::Transient,
        Some(429) => ErrorClassification::RateLimited,
        Some(408) => ErrorClassification::Transient,
        Some(s) if (400..500).contains(&s) => ErrorClassification::Fatal,
        Some(_) => ErrorClassification::Transient,
    }
}

impl ProviderDescriptor {
    /// Classify with this provider's row. Rolling providers have no boundary
    /// to wait for, so their quota signals degrade to Transient.
    pub fn classify(&self, failure: &UpstreamFailure) -> ErrorClassification {
        match classify(&self.patterns, failure) {
            ErrorClassification::QuotaExhausted if self.reset.is_rolling() => {
                ErrorClassification::Transient
            }
            other => other,
        }
    }

    /// Provider-reported reset time carried by `failure`, per this
    /// provider's row.
    pub fn reset_hint(&self, failure: &UpstreamFailure) -> Option<DateTime<Utc>> {
        self.patterns.reset_hint(failure)
    }
}
