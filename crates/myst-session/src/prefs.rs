//! Persisted preference flags
//!
//! A boolean key-value store with no ordering or transactional guarantee
//! across keys, plus the balance notice flags and favourite providers
//! built on top of it.

use crate::node::ConnectTarget;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Boolean flag store
pub trait PreferenceStore: Send + Sync {
    fn contains(&self, key: &str) -> bool;

    fn set(&self, key: &str, value: bool) -> Result<(), PrefsError>;

    fn remove(&self, key: &str) -> Result<(), PrefsError>;
}

/// Preference errors
#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// In-memory store (lost on exit)
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, bool>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn contains(&self, key: &str) -> bool {
        lock(&self.values).contains_key(key)
    }

    fn set(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// JSON file store, rewritten on every change
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, bool>>,
}

impl FilePreferences {
    /// Open the store, starting empty if the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PrefsError> {
        let path = path.as_ref().to_path_buf();
        let values: BTreeMap<String, bool> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        info!("Loaded {} preference flags from {}", values.len(), path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, bool>) -> Result<(), PrefsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(values)?)?;
        debug!("Persisted preference flags to {}", self.path.display());
        Ok(())
    }
}

impl PreferenceStore for FilePreferences {
    fn contains(&self, key: &str) -> bool {
        lock(&self.values).contains_key(key)
    }

    fn set(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        let mut values = lock(&self.values);
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        let mut values = lock(&self.values);
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

fn lock(values: &Mutex<BTreeMap<String, bool>>) -> MutexGuard<'_, BTreeMap<String, bool>> {
    values.lock().unwrap_or_else(|e| e.into_inner())
}

/// Balance notice flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKey {
    /// "Top up your balance" popup
    BalancePopUp,
    /// "Balance is running low" popup
    MinBalancePopUp,
    /// Push notification for empty balance
    BalancePush,
    /// Push notification for low balance
    MinBalancePush,
}

impl NoticeKey {
    pub fn all() -> &'static [NoticeKey] {
        &[
            NoticeKey::BalancePopUp,
            NoticeKey::MinBalancePopUp,
            NoticeKey::BalancePush,
            NoticeKey::MinBalancePush,
        ]
    }

    /// Storage key
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKey::BalancePopUp => "BALANCE",
            NoticeKey::MinBalancePopUp => "MIN_BALANCE",
            NoticeKey::BalancePush => "BALANCE_PUSH",
            NoticeKey::MinBalancePush => "MIN_BALANCE_PUSH",
        }
    }
}

/// Tracks which balance notices the user has already seen
#[derive(Clone)]
pub struct BalanceNotices {
    store: Arc<dyn PreferenceStore>,
}

impl BalanceNotices {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    pub fn is_shown(&self, key: NoticeKey) -> bool {
        self.store.contains(key.as_str())
    }

    pub fn mark_shown(&self, key: NoticeKey) -> Result<(), PrefsError> {
        self.store.set(key.as_str(), true)
    }

    pub fn clear(&self, key: NoticeKey) -> Result<(), PrefsError> {
        self.store.remove(key.as_str())
    }

    /// Forget every notice, e.g. after a top-up
    pub fn clear_all(&self) -> Result<(), PrefsError> {
        for key in NoticeKey::all() {
            self.clear(*key)?;
        }
        Ok(())
    }
}

impl Default for BalanceNotices {
    fn default() -> Self {
        Self::new(Arc::new(MemoryPreferences::new()))
    }
}

const FAVOURITE_PREFIX: &str = "FAVOURITE:";

/// Favourite provider offers, keyed by [`ConnectTarget::key`]
#[derive(Clone)]
pub struct Favourites {
    store: Arc<dyn PreferenceStore>,
}

impl Favourites {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    fn storage_key(target: &ConnectTarget) -> String {
        format!("{}{}", FAVOURITE_PREFIX, target.key())
    }

    pub fn is_favourite(&self, target: &ConnectTarget) -> bool {
        self.store.contains(&Self::storage_key(target))
    }

    pub fn add(&self, target: &ConnectTarget) -> Result<(), PrefsError> {
        debug!("Adding {} to favourites", target);
        self.store.set(&Self::storage_key(target), true)
    }

    pub fn remove(&self, target: &ConnectTarget) -> Result<(), PrefsError> {
        debug!("Removing {} from favourites", target);
        self.store.remove(&Self::storage_key(target))
    }

    /// Flip the favourite mark. Returns whether `target` is now a favourite.
    pub fn toggle(&self, target: &ConnectTarget) -> Result<bool, PrefsError> {
        if self.is_favourite(target) {
            self.remove(target)?;
            Ok(false)
        } else {
            self.add(target)?;
            Ok(true)
        }
    }
}

impl Default for Favourites {
    fn default() -> Self {
        Self::new(Arc::new(MemoryPreferences::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "myst-session-{}-{}.json",
            name,
            std::process::id()
        ))
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryPreferences::new();

        assert!(!store.contains("BALANCE"));
        store.set("BALANCE", true).unwrap();
        assert!(store.contains("BALANCE"));
        store.remove("BALANCE").unwrap();
        assert!(!store.contains("BALANCE"));
    }

    #[test]
    fn test_file_store_persists() {
        let path = temp_path("persist");
        let _ = std::fs::remove_file(&path);

        {
            let store = FilePreferences::open(&path).unwrap();
            store.set("BALANCE_PUSH", true).unwrap();
            store.set("MIN_BALANCE", true).unwrap();
            store.remove("MIN_BALANCE").unwrap();
        }

        let reopened = FilePreferences::open(&path).unwrap();
        assert!(reopened.contains("BALANCE_PUSH"));
        assert!(!reopened.contains("MIN_BALANCE"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let path = temp_path("garbage");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FilePreferences::open(&path),
            Err(PrefsError::Parse(_))
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_notice_flags_are_independent() {
        let notices = BalanceNotices::default();

        notices.mark_shown(NoticeKey::BalancePopUp).unwrap();
        notices.mark_shown(NoticeKey::MinBalancePush).unwrap();

        assert!(notices.is_shown(NoticeKey::BalancePopUp));
        assert!(!notices.is_shown(NoticeKey::MinBalancePopUp));
        assert!(notices.is_shown(NoticeKey::MinBalancePush));

        notices.clear(NoticeKey::BalancePopUp).unwrap();
        assert!(!notices.is_shown(NoticeKey::BalancePopUp));
        assert!(notices.is_shown(NoticeKey::MinBalancePush));
    }

    #[test]
    fn test_favourites_keyed_by_target() {
        let favourites = Favourites::default();
        let wireguard = ConnectTarget::new("0xprovider", "wireguard");
        let openvpn = ConnectTarget::new("0xprovider", "openvpn");

        favourites.add(&wireguard).unwrap();

        assert!(favourites.is_favourite(&wireguard));
        assert!(!favourites.is_favourite(&openvpn));

        assert!(!favourites.toggle(&wireguard).unwrap());
        assert!(!favourites.is_favourite(&wireguard));
        assert!(favourites.toggle(&openvpn).unwrap());
    }

    #[test]
    fn test_favourites_share_store_with_notices() {
        let store: Arc<dyn PreferenceStore> = Arc::new(MemoryPreferences::new());
        let favourites = Favourites::new(store.clone());
        let notices = BalanceNotices::new(store.clone());
        let target = ConnectTarget::new("0xprovider", "wireguard");

        favourites.add(&target).unwrap();
        notices.clear_all().unwrap();

        assert!(favourites.is_favourite(&target));
        assert!(store.contains("FAVOURITE:0xproviderwireguard"));
    }

    #[test]
    fn test_favourites_persist() {
        let path = temp_path("favourites");
        let _ = std::fs::remove_file(&path);
        let target = ConnectTarget::new("0xprovider", "wireguard");

        {
            let store = Arc::new(FilePreferences::open(&path).unwrap());
            Favourites::new(store).add(&target).unwrap();
        }

        let reopened = Favourites::new(Arc::new(FilePreferences::open(&path).unwrap()));
        assert!(reopened.is_favourite(&target));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_clear_all() {
        let notices = BalanceNotices::default();
        for key in NoticeKey::all() {
            notices.mark_shown(*key).unwrap();
        }

        notices.clear_all().unwrap();

        assert!(NoticeKey::all().iter().all(|k| !notices.is_shown(*k)));
    }
}
