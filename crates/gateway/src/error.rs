//! Gateway error types

use provider::ErrorClassification;
use serde::Serialize;

/// One failed upstream attempt, kept for the terminal error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    pub credential: String,
    /// Retry index on this credential (0 = first try)
    pub attempt: u32,
    pub classification: ErrorClassification,
    pub detail: String,
}

/// Errors surfaced to gateway callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Every recovery path (retry, rotation, fallback) was used up.
    #[error(
        "request failed ({classification}) after {} attempt(s){}",
        .attempts.len(),
        summarize(.attempts)
    )]
    Exhausted {
        classification: ErrorClassification,
        attempts: Vec<AttemptRecord>,
    },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("quota state error: {0}")]
    Quota(#[from] quota_tracker::Error),

    #[error("credential pool error: {0}")]
    Pool(#[from] key_pool::Error),

    #[error("configuration error: {0}")]
    Config(#[from] common::Error),
}

impl GatewayError {
    /// Final classification for exhausted calls.
    pub fn classification(&self) -> Option<ErrorClassification> {
        match self {
            GatewayError::Exhausted { classification, .. } => Some(*classification),
            _ => None,
        }
    }

    /// Every attempt made before giving up (empty for non-call errors).
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            GatewayError::Exhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

fn summarize(attempts: &[AttemptRecord]) -> String {
    attempts
        .iter()
        .map(|a| {
            format!(
                "; {}/{} via {} #{}: {}",
                a.provider, a.model, a.credential, a.attempt, a.classification
            )
        })
        .collect()
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, credential: &str, classification: ErrorClassification) -> AttemptRecord {
        AttemptRecord {
            provider: provider.into(),
            model: "m".into(),
            credential: credential.into(),
            attempt: 0,
            classification,
            detail: "HTTP 429: slow down".into(),
        }
    }

    #[test]
    fn exhausted_message_lists_every_attempt() {
        let err = GatewayError::Exhausted {
            classification: ErrorClassification::QuotaExhausted,
            attempts: vec![
                record("google", "GOOGLE_API_KEY", ErrorClassification::QuotaExhausted),
                record("openrouter", "OPENROUTER_API_KEY", ErrorClassification::QuotaExhausted),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("request failed (quota_exhausted) after 2 attempt(s)"));
        assert!(msg.contains("google/m via GOOGLE_API_KEY #0: quota_exhausted"));
        assert!(msg.contains("openrouter/m via OPENROUTER_API_KEY"));
        assert_eq!(err.attempts().len(), 2);
        assert_eq!(err.classification(), Some(ErrorClassification::QuotaExhausted));
    }

    #[test]
    fn non_call_errors_have_no_attempts() {
        let err = GatewayError::UnknownProvider("mistral".into());
        assert_eq!(err.to_string(), "unknown provider: mistral");
        assert!(err.attempts().is_empty());
        assert_eq!(err.classification(), None);
    }

    #[test]
    fn attempt_record_serializes_classification_label() {
        let json = serde_json::to_value(record("google", "K", ErrorClassification::RateLimited))
            .unwrap();
        assert_eq!(json["classification"], "rate_limited");
    }
}
