// Tracked Address Store - addresses already enriched with market data
//
// Loaded once at startup from a single bincode blob and rewritten in full after
// every new address. The in-memory set is authoritative; a failed write only loses
// durability.

use dashmap::{DashMap, DashSet};
use log::{debug, error, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::address::TokenAddress;
use crate::metrics;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read tracked addresses from {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write tracked addresses to {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("tracked address blob is corrupt: {0}")]
    Decode(#[from] bincode::Error),
}

/// Process-wide set of enriched addresses, shared by handle.
///
/// `is_new` followed by `mark_tracked` is not atomic; callers that fan out across
/// tasks must serialize that sequence themselves.
pub struct TrackedAddressStore {
    path: Option<PathBuf>,
    tracked: DashSet<TokenAddress>,
    /// Addresses whose last lookup matched no pair -> when that was observed.
    not_found: DashMap<TokenAddress, Instant>,
    not_found_ttl: Option<Duration>,
    persist_lock: Mutex<()>,
}

impl TrackedAddressStore {
    /// Store with no durable backing (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tracked: DashSet::new(),
            not_found: DashMap::new(),
            not_found_ttl: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Loads the set persisted at `path`.
    ///
    /// A missing or unreadable file is logged and treated as an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = Self {
            path: Some(path.clone()),
            ..Self::in_memory()
        };

        match read_blob(&path) {
            Ok(Some(addresses)) => {
                for raw in addresses {
                    match TokenAddress::try_from(raw) {
                        Ok(address) => {
                            store.tracked.insert(address);
                        }
                        Err(e) => warn!("[TrackedAddresses] Skipping persisted entry: {}", e),
                    }
                }
                info!(
                    "✅ [TrackedAddresses] Loaded {} tracked addresses from {}",
                    store.tracked.len(),
                    path.display()
                );
            }
            Ok(None) => {
                info!(
                    "[TrackedAddresses] No tracked address file at {}, starting empty",
                    path.display()
                );
            }
            Err(e) => {
                error!("❌ [TrackedAddresses] Error loading tracked addresses: {}", e);
            }
        }

        metrics::set_tracked_addresses(store.tracked.len() as f64);
        store
    }

    /// Enables the negative cache: addresses reported via [`mark_not_found`] are not
    /// new for `ttl`.
    ///
    /// [`mark_not_found`]: TrackedAddressStore::mark_not_found
    pub fn with_not_found_ttl(mut self, ttl: Duration) -> Self {
        self.not_found_ttl = Some(ttl);
        self
    }

    pub fn is_new(&self, address: &TokenAddress) -> bool {
        if self.tracked.contains(address) {
            return false;
        }
        !self.is_negative_cached(address)
    }

    /// Adds `address` and persists the whole set. Persistence failures are logged;
    /// the in-memory add stands.
    pub fn mark_tracked(&self, address: &TokenAddress) {
        if let Err(e) = self.try_mark_tracked(address) {
            error!("❌ [TrackedAddresses] Error saving tracked addresses: {}", e);
        }
    }

    /// Like [`mark_tracked`](Self::mark_tracked) but reports persistence failures.
    ///
    /// Returns `Ok(false)` if the address was already tracked (nothing written).
    pub fn try_mark_tracked(&self, address: &TokenAddress) -> Result<bool, StoreError> {
        self.not_found.remove(address);
        if !self.tracked.insert(address.clone()) {
            return Ok(false);
        }
        metrics::set_tracked_addresses(self.tracked.len() as f64);
        debug!("[TrackedAddresses] Now tracking {}", address);
        self.persist()?;
        Ok(true)
    }

    /// Records that a lookup for `address` returned nothing. No-op unless the
    /// negative cache is enabled. Never persisted.
    pub fn mark_not_found(&self, address: &TokenAddress) {
        if self.not_found_ttl.is_some() && !self.tracked.contains(address) {
            self.not_found.insert(address.clone(), Instant::now());
        }
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    fn is_negative_cached(&self, address: &TokenAddress) -> bool {
        let Some(ttl) = self.not_found_ttl else {
            return false;
        };
        let seen_at = self.not_found.get(address).map(|entry| *entry);
        match seen_at {
            Some(at) if at.elapsed() < ttl => true,
            Some(_) => {
                self.not_found.remove(address);
                false
            }
            None => false,
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut snapshot: Vec<String> = self
            .tracked
            .iter()
            .map(|a| a.as_str().to_string())
            .collect();
        snapshot.sort_unstable();

        let bytes = bincode::serialize(&snapshot)?;
        write_blob(path, &bytes).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })
    }
}

fn read_blob(path: &Path) -> Result<Option<Vec<String>>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(Some(bincode::deserialize(&bytes)?))
}

/// Writes to a sibling temp file then renames, so a crash mid-write leaves the
/// previous blob intact.
fn write_blob(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
