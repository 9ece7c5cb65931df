//! Quota tracker
//!
//! Owns the in-memory copy of the quota state file, the per-provider session
//! cache and the persistence loop. The state lock is only ever held for
//! in-memory work; every disk write operates on a cloned snapshot.
//!
//! Persistence is single-flight: whoever wins the `writing` flag writes
//! snapshots until the generation it wrote is still current, so concurrent
//! changes coalesce into at most one extra write and the file always converges
//! to the latest in-memory state.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use provider::{Credential, ErrorClassification, ProviderDescriptor};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::boundary::next_reset;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::{self, CredentialRecord, StateFile};

struct Tracked {
    file: StateFile,
    generation: u64,
}

/// A provider already verified this session, and until when that holds.
#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    checked_at: DateTime<Utc>,
    /// `None` for rolling providers: one check per process is enough
    valid_until: Option<DateTime<Utc>>,
}

impl SessionEntry {
    fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_none_or(|boundary| now < boundary)
    }
}

pub struct QuotaTracker {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<Tracked>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    persisted: AtomicU64,
    writing: AtomicBool,
}

/// Clears the single-flight flag even if the write future is dropped.
struct WritingGuard<'a>(&'a AtomicBool);

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl QuotaTracker {
    /// Load state from `path`, pruning anything whose boundary has passed.
    pub async fn load(path: PathBuf, clock: Arc<dyn Clock>) -> Self {
        let mut file = store::load(&path).await;
        let pruned = file.prune(None, clock.now());
        if pruned > 0 {
            debug!(pruned, "dropped expired exhaustion records on load");
        }
        Self {
            path,
            clock,
            // Generation 1 marks the pruned state as not yet on disk.
            state: Mutex::new(Tracked {
                file,
                generation: u64::from(pruned > 0),
            }),
            sessions: RwLock::new(HashMap::new()),
            persisted: AtomicU64::new(0),
            writing: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True unless the credential has a recorded exhaustion that has not yet
    /// been reached.
    pub async fn is_available(&self, credential: &Credential) -> bool {
        self.exhausted_until(credential).await.is_none()
    }

    /// The pending reset boundary for an exhausted credential.
    pub async fn exhausted_until(&self, credential: &Credential) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.ensure_session(credential.provider(), now).await;
        let state = self.state.lock().await;
        state
            .file
            .record(credential.provider_id(), credential.name())
            .and_then(|r| r.exhausted_until)
            .filter(|until| *until > now)
    }

    /// Record a failure against a credential.
    ///
    /// Only `QuotaExhausted` on a provider with a fixed boundary writes
    /// anything; the recorded value is that provider's next reset. Returns the
    /// boundary now in effect, or `None` when nothing was recorded.
    pub async fn mark_exhausted(
        &self,
        credential: &Credential,
        reason: ErrorClassification,
    ) -> Result<Option<DateTime<Utc>>> {
        self.mark_exhausted_until(credential, reason, None).await
    }

    /// Like [`QuotaTracker::mark_exhausted`], but a reset time reported by the
    /// provider replaces the computed boundary when it is still in the future.
    pub async fn mark_exhausted_until(
        &self,
        credential: &Credential,
        reason: ErrorClassification,
        hint: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        if reason != ErrorClassification::QuotaExhausted {
            return Ok(None);
        }
        let now = self.clock.now();
        let Some(computed) = next_reset(&credential.provider().reset, now) else {
            debug!(
                provider = %credential.provider_id(),
                credential = %credential.name(),
                "rolling provider, exhaustion not persisted"
            );
            return Ok(None);
        };
        let boundary = match hint {
            Some(reported) if reported > now => {
                debug!(
                    provider = %credential.provider_id(),
                    credential = %credential.name(),
                    reported = %reported,
                    computed = %computed,
                    "using provider-reported reset time"
                );
                reported
            }
            _ => computed,
        };

        let (until, changed) = {
            let mut state = self.state.lock().await;
            let record = state
                .file
                .record_mut(credential.provider_id(), credential.name());
            match record.exhausted_until {
                Some(existing) if existing >= boundary => (existing, false),
                _ => {
                    record.exhausted_until = Some(boundary);
                    state.file.last_updated = Some(now);
                    state.generation += 1;
                    (boundary, true)
                }
            }
        };

        if changed {
            info!(
                provider = %credential.provider_id(),
                credential = %credential.name(),
                exhausted_until = %until,
                "credential quota exhausted"
            );
            self.persist().await?;
        }
        Ok(Some(until))
    }

    /// Clear exhaustion for one provider, or for every provider.
    /// Returns how many credentials were cleared.
    pub async fn reset(&self, provider: Option<&str>) -> Result<usize> {
        let now = self.clock.now();
        let cleared = {
            let mut state = self.state.lock().await;
            let count = |records: &BTreeMap<String, CredentialRecord>| {
                records
                    .values()
                    .filter(|r| r.exhausted_until.is_some_and(|u| u > now))
                    .count()
            };
            let cleared = match provider {
                Some(id) => state.file.providers.remove(id).map_or(0, |r| count(&r)),
                None => {
                    let total: usize = state.file.providers.values().map(count).sum();
                    state.file.providers.clear();
                    total
                }
            };
            state.file.last_updated = Some(now);
            state.generation += 1;
            cleared
        };

        {
            let mut sessions = self.sessions.write().await;
            match provider {
                Some(id) => {
                    sessions.remove(id);
                }
                None => sessions.clear(),
            }
        }

        info!(provider = provider.unwrap_or("all"), cleared, "quota state reset");
        self.persist().await?;
        Ok(cleared)
    }

    /// Copy of the current in-memory state.
    pub async fn snapshot(&self) -> StateFile {
        self.state.lock().await.file.clone()
    }

    /// Wait until every change made before this call is on disk.
    pub async fn flush(&self) -> Result<()> {
        let target = self.state.lock().await.generation;
        while self.persisted.load(Ordering::SeqCst) < target {
            self.persist().await?;
            if self.persisted.load(Ordering::SeqCst) < target {
                // Another task holds the write flag and will catch up.
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// First check for a provider this session, or the first after its cached
    /// boundary passed: prune its expired records and stamp the check time.
    async fn ensure_session(&self, descriptor: &ProviderDescriptor, now: DateTime<Utc>) {
        if let Some(entry) = self.sessions.read().await.get(&descriptor.id)
            && entry.is_current(now)
        {
            return;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(&descriptor.id)
            && entry.is_current(now)
        {
            return;
        }

        let changed = {
            let mut state = self.state.lock().await;
            let pruned = state.file.prune(Some(&descriptor.id), now);
            let mut stamped = false;
            if let Some(records) = state.file.providers.get_mut(&descriptor.id) {
                for record in records.values_mut() {
                    record.last_session_check = Some(now);
                    stamped = true;
                }
            }
            if stamped {
                state.file.last_updated = Some(now);
                state.generation += 1;
            }
            if pruned > 0 {
                info!(provider = %descriptor.id, pruned, "quota reset boundary passed");
            }
            stamped
        };

        let previous = sessions.insert(
            descriptor.id.clone(),
            SessionEntry {
                checked_at: now,
                valid_until: next_reset(&descriptor.reset, now),
            },
        );
        drop(sessions);
        debug!(
            provider = %descriptor.id,
            previous_check = ?previous.map(|p| p.checked_at),
            "session quota check"
        );

        if changed && let Err(e) = self.persist().await {
            warn!(provider = %descriptor.id, error = %e, "failed to persist session check");
        }
    }

    async fn persist(&self) -> Result<()> {
        loop {
            if self
                .writing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Ok(());
            }
            let guard = WritingGuard(&self.writing);
            loop {
                let (generation, snapshot) = {
                    let state = self.state.lock().await;
                    (state.generation, state.file.clone())
                };
                store::write_atomic(&self.path, &snapshot).await?;
                self.persisted.store(generation, Ordering::SeqCst);
                if self.state.lock().await.generation == generation {
                    break;
                }
            }
            drop(guard);

            // A change that landed between the last check and releasing the
            // flag saw the flag held and left the write to us.
            let current = self.state.lock().await.generation;
            if self.persisted.load(Ordering::SeqCst) >= current {
                return Ok(());
            }
        }
    }
}
