//! Secret-backed certificate cache
//!
//! The host keeps one secret per issued certificate and fires an expiry
//! callback when the secret's expiry instant passes. The requirer uses the
//! expiry instant as its renewal alarm.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::utils::error::{TlsError, TlsResult};

/// Secret content key holding the certificate PEM
pub const SECRET_CERTIFICATE_KEY: &str = "certificate";

/// Label of the secret caching the certificate issued for `csr`
pub fn secret_label(prefix: &str, csr: &str) -> String {
    format!("{}-{}", prefix, csr)
}

/// CSR encoded in a secret label, if the label carries our prefix
pub fn csr_from_label<'l>(prefix: &str, label: &'l str) -> Option<&'l str> {
    label.strip_prefix(prefix)?.strip_prefix('-')
}

/// Host secret storage with expiry callbacks
pub trait SecretStore: Send + Sync {
    /// Content of the secret with this label
    fn get(&self, label: &str) -> Option<BTreeMap<String, String>>;

    /// Create a secret; fails if the label is taken
    fn add(
        &self,
        label: &str,
        content: BTreeMap<String, String>,
        expire_at: Option<DateTime<Utc>>,
    ) -> TlsResult<()>;

    /// Replace the content of an existing secret
    fn update(&self, label: &str, content: BTreeMap<String, String>) -> TlsResult<()>;

    /// Move the expiry callback of an existing secret
    fn set_expiry(&self, label: &str, expire_at: Option<DateTime<Utc>>) -> TlsResult<()>;

    /// Remove every revision of a secret; removing a missing secret is fine
    fn purge(&self, label: &str) -> TlsResult<()>;
}

/// Stored secret with its expiry instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEntry {
    pub content: BTreeMap<String, String>,
    pub expire_at: Option<DateTime<Utc>>,
}

impl SecretEntry {
    pub fn new(content: BTreeMap<String, String>, expire_at: Option<DateTime<Utc>>) -> Self {
        Self { content, expire_at }
    }

    /// Whether the expiry callback is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

/// In-process secret store; clones share the same secrets
#[derive(Debug, Clone, Default)]
pub struct InMemorySecretStore {
    entries: Arc<RwLock<BTreeMap<String, SecretEntry>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored entry with its expiry, for inspection
    pub fn entry(&self, label: &str) -> Option<SecretEntry> {
        self.read().get(label).cloned()
    }

    /// Labels whose expiry callback should fire at `now`
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, entry)| entry.is_due(now))
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, SecretEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, SecretEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, label: &str) -> Option<BTreeMap<String, String>> {
        self.read().get(label).map(|entry| entry.content.clone())
    }

    fn add(
        &self,
        label: &str,
        content: BTreeMap<String, String>,
        expire_at: Option<DateTime<Utc>>,
    ) -> TlsResult<()> {
        let mut entries = self.write();
        if entries.contains_key(label) {
            return Err(TlsError::Store(format!("Secret already exists: {}", label)));
        }
        entries.insert(label.to_string(), SecretEntry::new(content, expire_at));
        debug!(label, ?expire_at, "Secret added");
        Ok(())
    }

    fn update(&self, label: &str, content: BTreeMap<String, String>) -> TlsResult<()> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(label)
            .ok_or_else(|| TlsError::Store(format!("Secret not found: {}", label)))?;
        entry.content = content;
        Ok(())
    }

    fn set_expiry(&self, label: &str, expire_at: Option<DateTime<Utc>>) -> TlsResult<()> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(label)
            .ok_or_else(|| TlsError::Store(format!("Secret not found: {}", label)))?;
        entry.expire_at = expire_at;
        debug!(label, ?expire_at, "Secret expiry updated");
        Ok(())
    }

    fn purge(&self, label: &str) -> TlsResult<()> {
        if self.write().remove(label).is_some() {
            debug!(label, "Secret removed");
        }
        Ok(())
    }
}
