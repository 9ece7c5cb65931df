//! On-disk quota state
//!
//! One JSON document per user:
//!
//! ```json
//! {
//!   "version": 1,
//!   "last_updated": "2025-03-01T17:04:11Z",
//!   "providers": {
//!     "google": {
//!       "GOOGLE_API_KEY": {
//!         "exhausted_until": "2025-03-02T08:00:00Z",
//!         "last_session_check": "2025-03-01T17:04:11Z"
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Loading never fails: a missing, unreadable or corrupt file is treated as
//! empty state. Writes go to a uniquely named temp file in the same directory
//! and are renamed over the target, so a reader sees either the old document
//! or the new one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const STATE_VERSION: u32 = 1;
pub const STATE_FILE_NAME: &str = "quota_state.json";
pub const CACHE_DIR_ENV: &str = "LLM_GATEWAY_CACHE_DIR";
const APP_DIR: &str = "llm-gateway";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhausted_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_check: Option<DateTime<Utc>>,
}

/// provider id -> credential name -> record
pub type ProviderRecords = BTreeMap<String, BTreeMap<String, CredentialRecord>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub providers: ProviderRecords,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_updated: None,
            providers: BTreeMap::new(),
        }
    }
}

impl StateFile {
    /// Drop `exhausted_until` values at or before `now`, optionally for one
    /// provider only. Returns how many were dropped.
    pub fn prune(&mut self, provider: Option<&str>, now: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        for (id, records) in self.providers.iter_mut() {
            if provider.is_some_and(|p| p != id) {
                continue;
            }
            for record in records.values_mut() {
                if record.exhausted_until.is_some_and(|until| until <= now) {
                    record.exhausted_until = None;
                    pruned += 1;
                }
            }
        }
        pruned
    }

    pub fn record(&self, provider: &str, credential: &str) -> Option<&CredentialRecord> {
        self.providers.get(provider)?.get(credential)
    }

    pub fn record_mut(&mut self, provider: &str, credential: &str) -> &mut CredentialRecord {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .entry(credential.to_string())
            .or_default()
    }
}

/// Resolve the state file location.
///
/// Precedence: an explicitly configured path, then `LLM_GATEWAY_CACHE_DIR`,
/// then the platform cache directory, then `./.cache`.
pub fn resolve_state_path(configured: Option<&Path>) -> PathBuf {
    resolve_state_path_from(
        configured,
        std::env::var(CACHE_DIR_ENV).ok(),
        dirs::cache_dir(),
    )
}

fn resolve_state_path_from(
    configured: Option<&Path>,
    env_dir: Option<String>,
    platform_cache: Option<PathBuf>,
) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    if let Some(dir) = env_dir.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir).join(STATE_FILE_NAME);
    }
    platform_cache
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".cache").join(APP_DIR))
        .join(STATE_FILE_NAME)
}

/// Read the state file. Never fails; problems are logged and yield empty state.
pub async fn load(path: &Path) -> StateFile {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "quota state file not found, starting empty");
            return StateFile::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable quota state file, starting empty");
            return StateFile::default();
        }
    };

    match serde_json::from_str::<StateFile>(&contents) {
        Ok(state) if state.version == STATE_VERSION => {
            debug!(path = %path.display(), providers = state.providers.len(), "loaded quota state");
            state
        }
        Ok(state) => {
            warn!(
                path = %path.display(),
                version = state.version,
                expected = STATE_VERSION,
                "unsupported quota state version, starting empty"
            );
            StateFile::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt quota state file, starting empty");
            StateFile::default()
        }
    }
}

/// Write the state file atomically with 0600 permissions.
pub async fn write_atomic(path: &Path, state: &StateFile) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Serialize(format!("serializing quota state: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating state directory {}: {e}", dir.display())))?;

    let tmp_path = dir.join(format!(".{STATE_FILE_NAME}.{}.tmp", uuid::Uuid::new_v4()));

    if let Err(e) = write_and_rename(&tmp_path, path, json.as_bytes()).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    debug!(path = %path.display(), "persisted quota state");
    Ok(())
}

async fn write_and_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(tmp_path, bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp state file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join("nope.json")).await;
        assert_eq!(state, StateFile::default());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(load(&path).await, StateFile::default());
    }

    #[tokio::test]
    async fn unknown_version_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        tokio::fs::write(&path, r#"{"version": 99, "providers": {"google": {}}}"#)
            .await
            .unwrap();
        assert_eq!(load(&path).await, StateFile::default());
    }

    #[tokio::test]
    async fn write_then_load_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(STATE_FILE_NAME);

        let mut state = StateFile::default();
        state.last_updated = Some(ts(1));
        state.record_mut("google", "GOOGLE_API_KEY").exhausted_until = Some(ts(8));
        write_atomic(&path, &state).await.unwrap();

        assert_eq!(load(&path).await, state);

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1, "temp files left behind: {entries:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        write_atomic(&path, &StateFile::default()).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn prune_drops_reached_values_only() {
        let mut state = StateFile::default();
        state.record_mut("google", "A").exhausted_until = Some(ts(5));
        state.record_mut("google", "B").exhausted_until = Some(ts(9));
        state.record_mut("openrouter", "C").exhausted_until = Some(ts(5));

        assert_eq!(state.prune(Some("google"), ts(5)), 1);
        assert_eq!(state.record("google", "A").unwrap().exhausted_until, None);
        assert_eq!(state.record("google", "B").unwrap().exhausted_until, Some(ts(9)));
        assert_eq!(
            state.record("openrouter", "C").unwrap().exhausted_until,
            Some(ts(5))
        );

        assert_eq!(state.prune(None, ts(10)), 2);
    }

    #[test]
    fn serialized_shape_matches_documented_layout() {
        let mut state = StateFile::default();
        state.record_mut("google", "GOOGLE_API_KEY").exhausted_until = Some(ts(8));
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(
            value["providers"]["google"]["GOOGLE_API_KEY"]["exhausted_until"],
            "2025-03-01T08:00:00Z"
        );
    }

    #[test]
    fn path_precedence() {
        let configured = PathBuf::from("/etc/gw/state.json");
        assert_eq!(
            resolve_state_path_from(
                Some(&configured),
                Some("/tmp/env".into()),
                Some("/home/u/.cache".into())
            ),
            configured
        );
        assert_eq!(
            resolve_state_path_from(None, Some("/tmp/env".into()), Some("/home/u/.cache".into())),
            PathBuf::from("/tmp/env/quota_state.json")
        );
        assert_eq!(
            resolve_state_path_from(None, Some("  ".into()), Some("/home/u/.cache".into())),
            PathBuf::from("/home/u/.cache/llm-gateway/quota_state.json")
        );
        assert_eq!(
            resolve_state_path_from(None, None, None),
            PathBuf::from(".cache/llm-gateway/quota_state.json")
        );
    }
}
