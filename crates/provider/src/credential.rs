//! A single API key bound to its provider

use std::fmt;
use std::sync::Arc;

use common::Secret;

use crate::descriptor::ProviderDescriptor;

/// Position of a credential inside its provider's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CredentialRole {
    Primary,
    /// 1-based position among the backups
    Backup(usize),
}

impl fmt::Display for CredentialRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialRole::Primary => f.write_str("primary"),
            CredentialRole::Backup(n) => write!(f, "backup-{n}"),
        }
    }
}

/// API key with enough context to be tracked and logged.
///
/// `name` is the stable, non-secret identifier (the environment variable the
/// key was read from) and is what exhaustion state is keyed on. The key
/// material itself never appears in `Debug` output.
#[derive(Clone)]
pub struct Credential {
    provider: Arc<ProviderDescriptor>,
    name: String,
    role: CredentialRole,
    secret: Secret<String>,
}

impl Credential {
    pub fn new(
        provider: Arc<ProviderDescriptor>,
        name: impl Into<String>,
        role: CredentialRole,
        secret: Secret<String>,
    ) -> Self {
        Self {
            provider,
            name: name.into(),
            role,
            secret,
        }
    }

    pub fn provider(&self) -> &ProviderDescriptor {
        &self.provider
    }

    pub fn provider_id(&self) -> &str {
        &self.provider.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> CredentialRole {
        self.role
    }

    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .finish()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.provider.id == other.provider.id && self.name == other.name
    }
}

impl Eq for Credential {}

#[cfg(test)]
mod tests {
    use super::*;

    fn google() -> Arc<ProviderDescriptor> {
        Arc::new(ProviderDescriptor::builtin("google").unwrap())
    }

    #[test]
    fn debug_never_shows_key_material() {
        let cred = Credential::new(
            google(),
            "GOOGLE_API_KEY",
            CredentialRole::Primary,
            Secret::new("AIzaSy-super-secret".to_string()),
        );
        let debug = format!("{cred:?}");
        assert!(debug.contains("GOOGLE_API_KEY"));
        assert!(debug.contains("google"));
        assert!(!debug.contains("AIzaSy"));
    }

    #[test]
    fn identity_is_provider_and_name() {
        let a = Credential::new(
            google(),
            "GOOGLE_API_KEY",
            CredentialRole::Primary,
            Secret::new("one".to_string()),
        );
        let b = Credential::new(
            google(),
            "GOOGLE_API_KEY",
            CredentialRole::Primary,
            Secret::new("two".to_string()),
        );
        let c = Credential::new(
            google(),
            "GOOGLE_API_KEY_2",
            CredentialRole::Backup(1),
            Secret::new("one".to_string()),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn role_display() {
        assert_eq!(CredentialRole::Primary.to_string(), "primary");
        assert_eq!(CredentialRole::Backup(2).to_string(), "backup-2");
        assert!(CredentialRole::Primary < CredentialRole::Backup(1));
    }
}
