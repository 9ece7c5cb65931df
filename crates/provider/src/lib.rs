//! Provider abstraction for upstream language-model APIs
//!
//! Holds everything that is specific to one vendor and nothing that is
//! specific to one call:
//! - `ProviderDescriptor`: reset rule, published limits, backoff cap, wire
//!   format and the pattern table row used for classification
//! - `classify`: maps an `UpstreamFailure` to an `ErrorClassification`
//! - `Credential`: one API key bound to its provider
//! - `ProviderClient`: the trait the gateway calls to perform one attempt,
//!   with `HttpClient` as the reqwest-backed implementation

pub mod classify;
pub mod credential;
pub mod descriptor;
pub mod http;

pub use classify::{PATTERN_TABLE_VERSION, PatternTable, classify};
pub use credential::{Credential, CredentialRole};
pub use descriptor::{
    BUILTIN_PROVIDERS, DEFAULT_MAX_RATE_LIMIT_WAIT, ProviderDescriptor, ResetRule, WireFormat,
};
pub use http::HttpClient;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Classification of upstream errors to determine retry/rotation strategy.
///
/// - Transient: retry the same credential with backoff
/// - RateLimited: retry the same credential with capped backoff
/// - QuotaExhausted: persist exhaustion, rotate to the next credential
/// - Fatal: give up immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Network errors, timeouts, 5xx
    Transient,
    /// Short-term throttling (RPM/TPM)
    RateLimited,
    /// Period-based ceiling (RPD, monthly spend)
    QuotaExhausted,
    /// Malformed request or rejected credential
    Fatal,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::QuotaExhausted => "quota_exhausted",
            ErrorClassification::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A failed attempt as reported by a `ProviderClient`.
///
/// `status` is `None` when no HTTP response arrived (connection error,
/// timeout, unreadable body). `headers` holds every response header so the
/// classifier can look for zero-remaining allowance fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub status: Option<u16>,
    pub message: String,
    pub headers: Vec<(String, String)>,
    pub timed_out: bool,
}

impl UpstreamFailure {
    /// Non-2xx HTTP response.
    pub fn http(status: u16, message: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            headers,
            timed_out: false,
        }
    }

    /// No usable response (connection refused, reset, malformed body).
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// The attempt exceeded its deadline or was cancelled.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
            ..Self::default()
        }
    }

    /// 401/403: the key itself was refused.
    pub fn is_credential_rejected(&self) -> bool {
        matches!(self.status, Some(401 | 403))
    }

    /// Lowercased message followed by a `name: value` dump of the headers.
    pub fn haystack(&self) -> String {
        let mut out = self.message.to_lowercase();
        for (name, value) in &self.headers {
            out.push('\n');
            out.push_str(&name.to_lowercase());
            out.push_str(": ");
            out.push_str(&value.to_lowercase());
        }
        out
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.timed_out) {
            (_, true) => write!(f, "timed out: {}", self.message),
            (Some(status), _) => write!(f, "HTTP {status}: {}", self.message),
            (None, false) => write!(f, "network error: {}", self.message),
        }
    }
}

/// One completion attempt against one credential.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub credential: &'a Credential,
}

/// Performs a single upstream attempt. Retries, rotation and fallback are
/// the caller's concern.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ProviderClient>`).
pub trait ProviderClient: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String, UpstreamFailure>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haystack_lowercases_message_and_headers() {
        let failure = UpstreamFailure::http(
            429,
            "Rate Limit Exceeded",
            vec![("X-RateLimit-Remaining".into(), "0".into())],
        );
        let hay = failure.haystack();
        assert!(hay.contains("rate limit exceeded"));
        assert!(hay.contains("x-ratelimit-remaining: 0"));
    }

    #[test]
    fn credential_rejection_is_401_or_403() {
        assert!(UpstreamFailure::http(401, "", vec![]).is_credential_rejected());
        assert!(UpstreamFailure::http(403, "", vec![]).is_credential_rejected());
        assert!(!UpstreamFailure::http(400, "", vec![]).is_credential_rejected());
        assert!(!UpstreamFailure::network("refused").is_credential_rejected());
    }

    #[test]
    fn display_distinguishes_failure_kinds() {
        assert_eq!(
            UpstreamFailure::http(503, "overloaded", vec![]).to_string(),
            "HTTP 503: overloaded"
        );
        assert!(UpstreamFailure::timeout("60s").to_string().starts_with("timed out"));
        assert!(
            UpstreamFailure::network("refused")
                .to_string()
                .starts_with("network error")
        );
    }

    #[test]
    fn classification_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorClassification::QuotaExhausted).unwrap();
        assert_eq!(json, "\"quota_exhausted\"");
        assert_eq!(ErrorClassification::RateLimited.to_string(), "rate_limited");
    }
}
