//! Priority-ordered credential selection
//!
//! Credential states as seen by a caller:
//! - Available: no pending exhaustion, not disabled
//! - Exhausted: the quota tracker holds a reset boundary still in the future
//! - Disabled: rejected by the provider this session, skipped until restart

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::Secret;
use provider::{Credential, CredentialRole, ProviderDescriptor};
use quota_tracker::QuotaTracker;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Runtime status of one pooled credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStatus {
    Available,
    Exhausted { until: DateTime<Utc> },
    Disabled,
}

impl CredentialStatus {
    /// Status label for status output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Available => "available",
            CredentialStatus::Exhausted { .. } => "exhausted",
            CredentialStatus::Disabled => "disabled",
        }
    }
}

pub struct CredentialPool {
    descriptor: Arc<ProviderDescriptor>,
    credentials: Vec<Credential>,
    disabled: RwLock<HashSet<String>>,
}

impl CredentialPool {
    /// Build a pool from credentials in priority order.
    ///
    /// The first credential must be the primary and the rest backups; all must
    /// belong to `descriptor` and carry distinct names.
    pub fn new(descriptor: Arc<ProviderDescriptor>, credentials: Vec<Credential>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::Empty(descriptor.id.clone()));
        }

        let mut seen = HashSet::new();
        for (position, credential) in credentials.iter().enumerate() {
            if credential.provider_id() != descriptor.id {
                return Err(Error::ProviderMismatch {
                    credential: credential.name().to_string(),
                    expected: descriptor.id.clone(),
                    actual: credential.provider_id().to_string(),
                });
            }
            if !seen.insert(credential.name()) {
                return Err(Error::Duplicate(credential.name().to_string()));
            }
            let is_primary = credential.role() == CredentialRole::Primary;
            if (position == 0) != is_primary {
                return Err(Error::Ordering(format!(
                    "{} is {} at position {position}",
                    credential.name(),
                    credential.role()
                )));
            }
        }

        info!(
            provider = %descriptor.id,
            credentials = credentials.len(),
            "credential pool initialized"
        );
        Ok(Self {
            descriptor,
            credentials,
            disabled: RwLock::new(HashSet::new()),
        })
    }

    /// Build a pool from `(reference name, key)` pairs; the first pair becomes
    /// the primary and the rest `backup-1..N`. Blank keys are skipped.
    pub fn from_keys(
        descriptor: Arc<ProviderDescriptor>,
        keys: Vec<(String, Secret<String>)>,
    ) -> Result<Self> {
        let credentials = keys
            .into_iter()
            .filter(|(name, secret)| {
                if secret.is_empty() {
                    warn!(provider = %descriptor.id, credential = %name, "skipping blank key");
                }
                !secret.is_empty()
            })
            .enumerate()
            .map(|(position, (name, secret))| {
                let role = match position {
                    0 => CredentialRole::Primary,
                    n => CredentialRole::Backup(n),
                };
                Credential::new(descriptor.clone(), name, role, secret)
            })
            .collect();
        Self::new(descriptor, credentials)
    }

    pub fn descriptor(&self) -> &Arc<ProviderDescriptor> {
        &self.descriptor
    }

    pub fn provider_id(&self) -> &str {
        &self.descriptor.id
    }

    /// Credentials in priority order.
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// First available credential in priority order, or `None` when every
    /// credential is exhausted or disabled.
    pub async fn select(&self, tracker: &QuotaTracker) -> Option<Credential> {
        // Snapshot so the lock is not held across tracker calls.
        let disabled = self.disabled.read().await.clone();

        for credential in &self.credentials {
            if disabled.contains(credential.name()) {
                debug!(credential = %credential.name(), "skipping disabled credential");
                continue;
            }
            if !tracker.is_available(credential).await {
                debug!(credential = %credential.name(), "skipping exhausted credential");
                continue;
            }
            debug!(
                provider = %self.descriptor.id,
                credential = %credential.name(),
                role = %credential.role(),
                "selected credential"
            );
            return Some(credential.clone());
        }

        debug!(provider = %self.descriptor.id, "no available credentials");
        None
    }

    /// Skip `name` for the rest of this process. Returns false if the name is
    /// unknown or already disabled.
    pub async fn disable(&self, name: &str) -> bool {
        if !self.credentials.iter().any(|c| c.name() == name) {
            return false;
        }
        let inserted = self.disabled.write().await.insert(name.to_string());
        if inserted {
            warn!(
                provider = %self.descriptor.id,
                credential = name,
                "credential disabled for this session (rejected by provider)"
            );
        }
        inserted
    }

    pub async fn is_disabled(&self, name: &str) -> bool {
        self.disabled.read().await.contains(name)
    }

    /// Status of one credential; disabled takes precedence over exhausted.
    pub async fn credential_status(
        &self,
        credential: &Credential,
        tracker: &QuotaTracker,
    ) -> CredentialStatus {
        if self.is_disabled(credential.name()).await {
            return CredentialStatus::Disabled;
        }
        match tracker.exhausted_until(credential).await {
            Some(until) => CredentialStatus::Exhausted { until },
            None => CredentialStatus::Available,
        }
    }

    /// Pool status summary.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy.
    pub async fn status(&self, tracker: &QuotaTracker) -> serde_json::Value {
        let mut credentials = Vec::new();
        let mut available_count = 0usize;
        let mut exhausted_count = 0usize;
        let mut disabled_count = 0usize;

        for credential in &self.credentials {
            let status = self.credential_status(credential, tracker).await;
            let mut entry = serde_json::json!({
                "name": credential.name(),
                "role": credential.role().to_string(),
                "status": status.label(),
            });
            match status {
                CredentialStatus::Available => available_count += 1,
                CredentialStatus::Exhausted { until } => {
                    exhausted_count += 1;
                    entry["exhausted_until"] = serde_json::json!(until.to_rfc3339());
                    let remaining = (until - tracker.now()).num_seconds().max(0);
                    entry["reset_in_secs"] = serde_json::json!(remaining);
                }
                CredentialStatus::Disabled => disabled_count += 1,
            }
            credentials.push(entry);
        }

        let total = self.credentials.len();
        let pool_status = if available_count == total {
            "healthy"
        } else if available_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "provider": self.descriptor.id,
            "status": pool_status,
            "reset": self.descriptor.reset.to_string(),
            "rpm": self.descriptor.rpm,
            "rpd": self.descriptor.rpd,
            "credentials_total": total,
            "credentials_available": available_count,
            "credentials_exhausted": exhausted_count,
            "credentials_disabled": disabled_count,
            "credentials": credentials
        })
    }
}
