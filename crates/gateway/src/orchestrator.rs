//! Imperative shell around the call state machine
//!
//! Drives `machine::handle_event` to a terminal state, performing each action
//! it asks for: provider attempts under a per-attempt timeout, jittered
//! backoff sleeps, quota marking and pool selection. Every piece of retry
//! state lives on this call's stack; nothing survives the call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use key_pool::CredentialPool;
use provider::{CompletionRequest, Credential, ErrorClassification, ProviderClient, UpstreamFailure};
use quota_tracker::QuotaTracker;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::error::{AttemptRecord, GatewayError};
use crate::machine::{self, CallAction, CallEvent, CallPolicy, CallState, Target};
use crate::metrics;

/// A successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Provider that produced `text` (the fallback's, if one was used)
    pub provider: String,
    pub model: String,
    /// Name of the credential that succeeded
    pub credential: String,
    pub used_fallback: bool,
    /// Failed attempts made before the successful one
    pub failed_attempts: Vec<AttemptRecord>,
}

pub(crate) struct Orchestrator<'a> {
    pub tracker: &'a QuotaTracker,
    pub pools: &'a HashMap<String, Arc<CredentialPool>>,
    pub client: &'a dyn ProviderClient,
    pub attempt_timeout: Duration,
}

impl Orchestrator<'_> {
    pub async fn run(
        &self,
        prompt: &str,
        target: Target,
        policy: &CallPolicy,
    ) -> Result<Completion, GatewayError> {
        let first = self.select(&target.provider).await?;
        let mut attempts = Vec::new();
        // Reset time reported with the most recent failure
        let mut reset_hint = None;
        let (mut state, mut action) = machine::start(policy, target, first);

        loop {
            let event = match action {
                CallAction::Finish => break,
                CallAction::Backoff(delay) => {
                    let cap = match &state {
                        CallState::Attempting { credential, .. } => {
                            credential.provider().max_rate_limit_wait
                        }
                        _ => delay,
                    };
                    let delay = backoff::with_jitter(delay, cap);
                    debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                    self.attempt(prompt, &state, &mut attempts, &mut reset_hint)
                        .await
                }
                CallAction::Attempt => {
                    self.attempt(prompt, &state, &mut attempts, &mut reset_hint)
                        .await
                }
                CallAction::MarkAndRotate { credential } => {
                    self.mark_exhausted(&credential, reset_hint.take()).await;
                    metrics::record_rotation(credential.provider_id());
                    let next = self.select(credential.provider_id()).await?;
                    if let Some(next) = &next {
                        info!(
                            provider = %credential.provider_id(),
                            from = %credential.name(),
                            to = %next.name(),
                            "rotating credential"
                        );
                    }
                    CallEvent::CredentialSelected(next)
                }
                CallAction::SelectFallback(fallback) => {
                    info!(fallback = %fallback, "provider exhausted, switching to fallback");
                    metrics::record_fallback(&fallback.provider);
                    let next = match self.pools.get(&fallback.provider) {
                        Some(pool) => pool.select(self.tracker).await,
                        None => {
                            warn!(provider = %fallback.provider, "fallback provider has no credential pool");
                            None
                        }
                    };
                    CallEvent::CredentialSelected(next)
                }
            };
            (state, action) = machine::handle_event(policy, state, event);
        }

        match state {
            CallState::Done {
                target,
                credential,
                text,
                on_fallback,
            } => Ok(Completion {
                text,
                provider: target.provider,
                model: target.model,
                credential: credential.name().to_string(),
                used_fallback: on_fallback,
                failed_attempts: attempts,
            }),
            other => Err(GatewayError::Exhausted {
                classification: other
                    .last_classification()
                    .unwrap_or(ErrorClassification::Fatal),
                attempts,
            }),
        }
    }

    async fn select(&self, provider: &str) -> Result<Option<Credential>, GatewayError> {
        let pool = self
            .pools
            .get(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        Ok(pool.select(self.tracker).await)
    }

    /// Perform the attempt the current `Attempting` state calls for.
    async fn attempt(
        &self,
        prompt: &str,
        state: &CallState,
        attempts: &mut Vec<AttemptRecord>,
        reset_hint: &mut Option<DateTime<Utc>>,
    ) -> CallEvent {
        let CallState::Attempting {
            target,
            credential,
            attempt,
            ..
        } = state
        else {
            // The machine only asks for attempts while Attempting.
            return CallEvent::AttemptFailed(ErrorClassification::Fatal);
        };

        let request = CompletionRequest {
            model: &target.model,
            prompt,
            credential,
        };
        let outcome = match tokio::time::timeout(self.attempt_timeout, self.client.complete(request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(UpstreamFailure::timeout(format!(
                "no response within {}s",
                self.attempt_timeout.as_secs_f64()
            ))),
        };

        match outcome {
            Ok(text) => {
                *reset_hint = None;
                metrics::record_attempt(&target.provider, "success");
                debug!(
                    provider = %target.provider,
                    model = %target.model,
                    credential = %credential.name(),
                    attempt,
                    "attempt succeeded"
                );
                CallEvent::Succeeded(text)
            }
            Err(failure) => {
                let classification = credential.provider().classify(&failure);
                *reset_hint = credential.provider().reset_hint(&failure);
                metrics::record_attempt(&target.provider, classification.label());
                warn!(
                    provider = %target.provider,
                    model = %target.model,
                    credential = %credential.name(),
                    attempt,
                    classification = %classification,
                    status = ?failure.status,
                    timed_out = failure.timed_out,
                    reset_hint = ?reset_hint,
                    "attempt failed"
                );
                if failure.is_credential_rejected()
                    && let Some(pool) = self.pools.get(credential.provider_id())
                {
                    pool.disable(credential.name()).await;
                }
                attempts.push(AttemptRecord {
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    credential: credential.name().to_string(),
                    attempt: *attempt,
                    classification,
                    detail: truncate(&failure.to_string(), 300),
                });
                CallEvent::AttemptFailed(classification)
            }
        }
    }

    /// Write failures are logged, not propagated.
    async fn mark_exhausted(&self, credential: &Credential, reset_hint: Option<DateTime<Utc>>) {
        if let Err(e) = self
            .tracker
            .mark_exhausted_until(credential, ErrorClassification::QuotaExhausted, reset_hint)
            .await
        {
            warn!(
                provider = %credential.provider_id(),
                credential = %credential.name(),
                error = %e,
                "failed to persist quota exhaustion"
            );
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }
}
