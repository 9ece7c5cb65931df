//! Per-call retry state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The orchestrator executes the I/O implied by each action (sleeping,
//! calling the provider, marking quota, selecting credentials) and feeds the
//! outcome back as the next event. Nothing here touches a clock, a file or the
//! network.
//!
//! ```text
//! Attempting --Succeeded--> Done
//! Attempting --Transient/RateLimited (retries left)--> Attempting (Backoff)
//! Attempting --QuotaExhausted--> Rotating (MarkAndRotate)
//! Rotating --Some(credential)--> Attempting, attempt 0
//! Rotating --None--> ProviderExhausted (SelectFallback) | Failed
//! ProviderExhausted --Some(credential)--> Attempting on the fallback
//! ProviderExhausted --None--> Failed
//! Attempting --Fatal / retries spent--> Failed
//! ```

use std::fmt;
use std::time::Duration;

use provider::{Credential, ErrorClassification};

use crate::backoff;

/// A provider/model pair a call is directed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub provider: String,
    pub model: String,
}

impl Target {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Retry options for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Where to go once the requested provider has no credentials left.
    /// `None` when fallback is disabled or not configured.
    pub fallback: Option<Target>,
}

#[derive(Debug)]
pub enum CallState {
    /// An attempt with `credential` is due; `attempt` counts retries on it.
    Attempting {
        target: Target,
        credential: Credential,
        attempt: u32,
        on_fallback: bool,
    },
    /// Waiting for the next credential of `target`'s provider.
    Rotating {
        target: Target,
        on_fallback: bool,
        last: ErrorClassification,
    },
    /// `exhausted` has no usable credentials; waiting for one from `fallback`.
    ProviderExhausted {
        exhausted: Target,
        fallback: Target,
        last: ErrorClassification,
    },
    Done {
        target: Target,
        credential: Credential,
        text: String,
        on_fallback: bool,
    },
    Failed {
        last: ErrorClassification,
    },
}

impl CallState {
    /// Classification that best describes why the call is not `Done`.
    pub fn last_classification(&self) -> Option<ErrorClassification> {
        match self {
            CallState::Rotating { last, .. }
            | CallState::ProviderExhausted { last, .. }
            | CallState::Failed { last } => Some(*last),
            CallState::Attempting { .. } | CallState::Done { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Done { .. } | CallState::Failed { .. })
    }
}

#[derive(Debug)]
pub enum CallEvent {
    Succeeded(String),
    AttemptFailed(ErrorClassification),
    /// Result of a pool selection requested by `MarkAndRotate` or
    /// `SelectFallback`.
    CredentialSelected(Option<Credential>),
}

/// Side effects the orchestrator should perform next.
#[derive(Debug, PartialEq)]
pub enum CallAction {
    /// Call the provider with the current credential.
    Attempt,
    /// Sleep for the given delay (before jitter), then attempt.
    Backoff(Duration),
    /// Record `credential` as quota exhausted, then select the next credential
    /// from the same provider.
    MarkAndRotate { credential: Credential },
    /// Select the first available credential of the fallback provider.
    SelectFallback(Target),
    Finish,
}

/// Initial transition for a call whose pool yielded `first`.
pub fn start(
    policy: &CallPolicy,
    target: Target,
    first: Option<Credential>,
) -> (CallState, CallAction) {
    handle_event(
        policy,
        CallState::Rotating {
            target,
            on_fallback: false,
            last: ErrorClassification::QuotaExhausted,
        },
        CallEvent::CredentialSelected(first),
    )
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    policy: &CallPolicy,
    state: CallState,
    event: CallEvent,
) -> (CallState, CallAction) {
    match (state, event) {
        // --- Attempting ---
        (
            CallState::Attempting {
                target,
                credential,
                on_fallback,
                ..
            },
            CallEvent::Succeeded(text),
        ) => (
            CallState::Done {
                target,
                credential,
                text,
                on_fallback,
            },
            CallAction::Finish,
        ),

        (
            CallState::Attempting {
                target,
                credential,
                attempt,
                on_fallback,
            },
            CallEvent::AttemptFailed(classification),
        ) => on_failure(policy, target, credential, attempt, on_fallback, classification),

        // --- Rotating ---
        (
            CallState::Rotating {
                target,
                on_fallback,
                ..
            },
            CallEvent::CredentialSelected(Some(credential)),
        ) => (
            CallState::Attempting {
                target,
                credential,
                attempt: 0,
                on_fallback,
            },
            CallAction::Attempt,
        ),

        (
            CallState::Rotating {
                target,
                on_fallback,
                last,
            },
            CallEvent::CredentialSelected(None),
        ) => match &policy.fallback {
            Some(fallback) if !on_fallback && *fallback != target => (
                CallState::ProviderExhausted {
                    exhausted: target,
                    fallback: fallback.clone(),
                    last,
                },
                CallAction::SelectFallback(fallback.clone()),
            ),
            _ => (CallState::Failed { last }, CallAction::Finish),
        },

        // --- ProviderExhausted ---
        (
            CallState::ProviderExhausted { fallback, .. },
            CallEvent::CredentialSelected(Some(credential)),
        ) => (
            CallState::Attempting {
                target: fallback,
                credential,
                attempt: 0,
                on_fallback: true,
            },
            CallAction::Attempt,
        ),

        (CallState::ProviderExhausted { last, .. }, CallEvent::CredentialSelected(None)) => {
            (CallState::Failed { last }, CallAction::Finish)
        }

        // --- Terminal or mismatched: stay put ---
        (state, _) => (state, CallAction::Finish),
    }
}

fn on_failure(
    policy: &CallPolicy,
    target: Target,
    credential: Credential,
    attempt: u32,
    on_fallback: bool,
    classification: ErrorClassification,
) -> (CallState, CallAction) {
    let cap = credential.provider().max_rate_limit_wait;
    let rolling = credential.provider().reset.is_rolling();
    let wanted = backoff::exponential(policy.retry_delay, attempt);

    let rotate = |credential: Credential| {
        (
            CallState::Rotating {
                target: target.clone(),
                on_fallback,
                last: ErrorClassification::QuotaExhausted,
            },
            CallAction::MarkAndRotate { credential },
        )
    };

    match classification {
        ErrorClassification::Fatal => (CallState::Failed { last: classification }, CallAction::Finish),

        ErrorClassification::QuotaExhausted => rotate(credential),

        // A throttle that would need a longer wait than the provider allows
        // is treated as a period quota. Rolling providers have no period to
        // wait out, so they keep backing off at the cap instead.
        ErrorClassification::RateLimited if wanted > cap && !rolling => rotate(credential),

        ErrorClassification::Transient | ErrorClassification::RateLimited
            if attempt < policy.max_retries =>
        {
            (
                CallState::Attempting {
                    target: target.clone(),
                    credential,
                    attempt: attempt + 1,
                    on_fallback,
                },
                CallAction::Backoff(wanted.min(cap)),
            )
        }

        ErrorClassification::Transient | ErrorClassification::RateLimited => {
            (CallState::Failed { last: classification }, CallAction::Finish)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;
    use provider::{CredentialRole, ProviderDescriptor, ResetRule, WireFormat};
    use std::sync::Arc;

    fn cred(provider: &str, name: &str) -> Credential {
        Credential::new(
            Arc::new(ProviderDescriptor::builtin(provider).unwrap()),
            name,
            CredentialRole::Primary,
            Secret::new("k".to_string()),
        )
    }

    fn capped_cred(cap: Duration, reset: ResetRule) -> Credential {
        let mut descriptor =
            ProviderDescriptor::custom("capped", reset, WireFormat::OpenAiChat, "http://x");
        descriptor.max_rate_limit_wait = cap;
        Credential::new(
            Arc::new(descriptor),
            "CAPPED",
            CredentialRole::Primary,
            Secret::new("k".to_string()),
        )
    }

    fn google() -> Target {
        Target::new("google", "gemini-2.5-flash")
    }

    fn openrouter() -> Target {
        Target::new("openrouter", "deepseek/deepseek-chat-v3-0324:free")
    }

    fn policy(max_retries: u32, fallback: Option<Target>) -> CallPolicy {
        CallPolicy {
            max_retries,
            retry_delay: Duration::from_secs(1),
            fallback,
        }
    }

    fn attempting(target: Target, credential: Credential, attempt: u32) -> CallState {
        CallState::Attempting {
            target,
            credential,
            attempt,
            on_fallback: false,
        }
    }

    #[test]
    fn start_with_credential_attempts_immediately() {
        let (state, action) = start(&policy(3, None), google(), Some(cred("google", "P")));
        assert_eq!(action, CallAction::Attempt);
        assert!(matches!(state, CallState::Attempting { attempt: 0, .. }));
    }

    #[test]
    fn start_without_credential_goes_to_fallback() {
        let (state, action) = start(&policy(3, Some(openrouter())), google(), None);
        assert_eq!(action, CallAction::SelectFallback(openrouter()));
        assert!(matches!(state, CallState::ProviderExhausted { .. }));
    }

    #[test]
    fn start_without_credential_or_fallback_fails() {
        let (state, action) = start(&policy(3, None), google(), None);
        assert_eq!(action, CallAction::Finish);
        assert_eq!(
            state.last_classification(),
            Some(ErrorClassification::QuotaExhausted)
        );
        assert!(state.is_terminal());
    }

    #[test]
    fn success_finishes_with_text() {
        let p = policy(3, None);
        let (state, action) = handle_event(
            &p,
            attempting(google(), cred("google", "P"), 2),
            CallEvent::Succeeded("hi".into()),
        );
        assert_eq!(action, CallAction::Finish);
        match state {
            CallState::Done { text, credential, .. } => {
                assert_eq!(text, "hi");
                assert_eq!(credential.name(), "P");
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn transient_backoff_doubles_until_retries_run_out() {
        let p = policy(3, None);
        let mut state = attempting(google(), cred("google", "P"), 0);
        let mut delays = Vec::new();
        loop {
            let (next, action) = handle_event(
                &p,
                state,
                CallEvent::AttemptFailed(ErrorClassification::Transient),
            );
            state = next;
            match action {
                CallAction::Backoff(d) => delays.push(d),
                CallAction::Finish => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delays, [1, 2, 4].map(Duration::from_secs).to_vec());
        assert!(matches!(
            state,
            CallState::Failed {
                last: ErrorClassification::Transient
            }
        ));
    }

    #[test]
    fn zero_retries_fails_on_first_transient() {
        let (state, action) = handle_event(
            &policy(0, Some(openrouter())),
            attempting(google(), cred("google", "P"), 0),
            CallEvent::AttemptFailed(ErrorClassification::Transient),
        );
        assert_eq!(action, CallAction::Finish);
        assert!(matches!(state, CallState::Failed { .. }));
    }

    #[test]
    fn fatal_never_retries() {
        let (state, action) = handle_event(
            &policy(10, Some(openrouter())),
            attempting(google(), cred("google", "P"), 0),
            CallEvent::AttemptFailed(ErrorClassification::Fatal),
        );
        assert_eq!(action, CallAction::Finish);
        assert!(matches!(
            state,
            CallState::Failed {
                last: ErrorClassification::Fatal
            }
        ));
    }

    #[test]
    fn backoff_is_capped_by_provider() {
        let credential = capped_cred(Duration::from_secs(3), ResetRule::Rolling);
        let (_, action) = handle_event(
            &policy(5, None),
            attempting(google(), credential, 2),
            CallEvent::AttemptFailed(ErrorClassification::Transient),
        );
        assert_eq!(action, CallAction::Backoff(Duration::from_secs(3)));
    }

    #[test]
    fn rate_limit_beyond_cap_rotates_on_fixed_boundary_provider() {
        let credential = capped_cred(
            Duration::from_secs(3),
            ResetRule::daily_midnight(chrono_tz::UTC),
        );
        let (state, action) = handle_event(
            &policy(5, None),
            attempting(google(), credential, 2),
            CallEvent::AttemptFailed(ErrorClassification::RateLimited),
        );
        assert!(matches!(action, CallAction::MarkAndRotate { .. }));
        assert!(matches!(state, CallState::Rotating { .. }));
    }

    #[test]
    fn rate_limit_beyond_cap_keeps_retrying_on_rolling_provider() {
        let credential = capped_cred(Duration::from_secs(3), ResetRule::Rolling);
        let (state, action) = handle_event(
            &policy(5, None),
            attempting(google(), credential, 2),
            CallEvent::AttemptFailed(ErrorClassification::RateLimited),
        );
        assert_eq!(action, CallAction::Backoff(Duration::from_secs(3)));
        assert!(matches!(state, CallState::Attempting { attempt: 3, .. }));
    }

    #[test]
    fn rate_limit_within_cap_backs_off_like_transient() {
        let (state, action) = handle_event(
            &policy(3, None),
            attempting(google(), cred("google", "P"), 1),
            CallEvent::AttemptFailed(ErrorClassification::RateLimited),
        );
        assert_eq!(action, CallAction::Backoff(Duration::from_secs(2)));
        assert!(matches!(state, CallState::Attempting { attempt: 2, .. }));
    }

    #[test]
    fn quota_rotates_and_resets_attempt_count() {
        let p = policy(3, None);
        let (state, action) = handle_event(
            &p,
            attempting(google(), cred("google", "P"), 2),
            CallEvent::AttemptFailed(ErrorClassification::QuotaExhausted),
        );
        match &action {
            CallAction::MarkAndRotate { credential } => assert_eq!(credential.name(), "P"),
            other => panic!("expected MarkAndRotate, got {other:?}"),
        }

        let (state, action) = handle_event(
            &p,
            state,
            CallEvent::CredentialSelected(Some(cred("google", "B1"))),
        );
        assert_eq!(action, CallAction::Attempt);
        match state {
            CallState::Attempting {
                credential,
                attempt,
                ..
            } => {
                assert_eq!(credential.name(), "B1");
                assert_eq!(attempt, 0);
            }
            other => panic!("expected Attempting, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_pool_falls_back_once() {
        let p = policy(3, Some(openrouter()));
        let rotating = CallState::Rotating {
            target: google(),
            on_fallback: false,
            last: ErrorClassification::QuotaExhausted,
        };
        let (state, action) = handle_event(&p, rotating, CallEvent::CredentialSelected(None));
        assert_eq!(action, CallAction::SelectFallback(openrouter()));

        let (state, action) = handle_event(
            &p,
            state,
            CallEvent::CredentialSelected(Some(cred("openrouter", "OR"))),
        );
        assert_eq!(action, CallAction::Attempt);
        let CallState::Attempting {
            target,
            on_fallback,
            ..
        } = &state
        else {
            panic!("expected Attempting, got {state:?}");
        };
        assert_eq!(*target, openrouter());
        assert!(*on_fallback);

        // The fallback's own pool running dry does not chain further.
        let (state, _) = handle_event(
            &p,
            state,
            CallEvent::AttemptFailed(ErrorClassification::QuotaExhausted),
        );
        let (state, action) = handle_event(&p, state, CallEvent::CredentialSelected(None));
        assert_eq!(action, CallAction::Finish);
        assert!(matches!(
            state,
            CallState::Failed {
                last: ErrorClassification::QuotaExhausted
            }
        ));
    }

    #[test]
    fn fallback_identical_to_target_is_ignored() {
        let p = policy(3, Some(google()));
        let (state, action) = start(&p, google(), None);
        assert_eq!(action, CallAction::Finish);
        assert!(matches!(state, CallState::Failed { .. }));
    }

    #[test]
    fn fallback_with_no_credentials_fails() {
        let p = policy(3, Some(openrouter()));
        let (state, _) = start(&p, google(), None);
        let (state, action) = handle_event(&p, state, CallEvent::CredentialSelected(None));
        assert_eq!(action, CallAction::Finish);
        assert_eq!(
            state.last_classification(),
            Some(ErrorClassification::QuotaExhausted)
        );
    }

    #[test]
    fn transient_exhaustion_does_not_fall_back() {
        let p = policy(0, Some(openrouter()));
        let (_, action) = handle_event(
            &p,
            attempting(google(), cred("google", "P"), 0),
            CallEvent::AttemptFailed(ErrorClassification::Transient),
        );
        assert_eq!(action, CallAction::Finish);
    }

    #[test]
    fn terminal_states_ignore_events() {
        let p = policy(3, None);
        let (state, action) = handle_event(
            &p,
            CallState::Failed {
                last: ErrorClassification::Fatal,
            },
            CallEvent::Succeeded("late".into()),
        );
        assert_eq!(action, CallAction::Finish);
        assert!(matches!(state, CallState::Failed { .. }));
    }
}
