//! Publish-then-read configuration store.
//!
//! Readers clone the published `Arc` under a short mutex hold and then
//! work lock-free on an immutable snapshot. Writers serialize through a
//! separate I/O mutex: validate, persist encrypted, rotate backups, then
//! take the publish lock only for the swap — a reader never waits on
//! validation or disk. A failed update leaves the prior snapshot
//! authoritative and the file untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{crypto, ConfigError, ConfigSnapshot};

const BACKUP_DIR: &str = "config_backups";
const BACKUP_KEEP: usize = 10;

/// Shared configuration store.
pub struct ConfigStore {
    path: PathBuf,
    backup_dir: PathBuf,
    key: [u8; 32],
    // Guards only the published Arc; held for clone and swap, never
    // across I/O.
    current: Mutex<Arc<ConfigSnapshot>>,
    // Serializes writers through backup/persist.
    io: Mutex<()>,
    changed: AtomicBool,
}

impl ConfigStore {
    /// Open the store at `path`, decrypting the existing file if present.
    ///
    /// A missing file is created from compiled-in defaults. A corrupt file
    /// (bad MAC, bad JSON, failed validation) falls back to defaults with
    /// a warning; the daemon never refuses to start over a bad config.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self::open_with_key(path, crypto::machine_key())
    }

    /// Same as [`ConfigStore::open`] with an explicit key, for tests.
    pub fn open_with_key<P: AsRef<Path>>(path: P, key: [u8; 32]) -> Self {
        let path = path.as_ref().to_path_buf();
        let backup_dir = path
            .parent()
            .map_or_else(|| PathBuf::from(BACKUP_DIR), |p| p.join(BACKUP_DIR));

        let snapshot = match Self::load_file(&path, &key) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let defaults = ConfigSnapshot::default();
                if path.exists() {
                    tracing::warn!("config: unreadable file ({}), using defaults", e);
                } else {
                    tracing::info!("config: no file at {}, writing defaults", path.display());
                    if let Err(e) = Self::write_file(&path, &key, &defaults) {
                        tracing::warn!("config: failed to write defaults: {}", e);
                    }
                }
                defaults
            }
        };

        Self {
            path,
            backup_dir,
            key,
            current: Mutex::new(Arc::new(snapshot)),
            io: Mutex::new(()),
            changed: AtomicBool::new(false),
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.lock().expect("config lock poisoned").clone()
    }

    /// Replace the whole document. All-or-nothing: validation failure
    /// returns the reason and changes nothing, on disk or in memory.
    pub fn update(&self, doc: ConfigSnapshot) -> Result<(), ConfigError> {
        doc.validate()?;

        let _io = self.io.lock().expect("config io lock poisoned");
        self.backup_current();
        Self::write_file(&self.path, &self.key, &doc)?;

        *self.current.lock().expect("config lock poisoned") = Arc::new(doc);
        self.changed.store(true, Ordering::SeqCst);
        tracing::info!("config: update accepted");
        Ok(())
    }

    /// Replace the whole document from a JSON string (the surface an
    /// external settings UI or API would call).
    pub fn update_from_json(&self, json: &str) -> Result<(), ConfigError> {
        let doc: ConfigSnapshot = serde_json::from_str(json)?;
        self.update(doc)
    }

    /// Consume the change flag. Polled once per monitor cycle; returns
    /// true at most once per accepted update batch.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    fn load_file(path: &Path, key: &[u8; 32]) -> Result<ConfigSnapshot, ConfigError> {
        let blob = fs::read(path)?;
        let plain = crypto::open_sealed(key, &blob)?;
        let snapshot: ConfigSnapshot = serde_json::from_slice(&plain)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn write_file(path: &Path, key: &[u8; 32], doc: &ConfigSnapshot) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(doc)?;

        // Write-then-rename so a crash mid-write can never truncate the
        // live file; the previous config survives intact.
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, crypto::seal(key, &json))?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Copy the current encrypted file into the backup directory and evict
    /// beyond the newest ten. Backup failure is logged, never fatal: the
    /// update itself matters more than its paper trail.
    fn backup_current(&self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&self.backup_dir) {
            tracing::warn!("config: cannot create backup dir: {}", e);
            return;
        }

        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let backup = self.backup_dir.join(format!("config_backup_{}.bin", stamp));
        if let Err(e) = fs::copy(&self.path, &backup) {
            tracing::warn!("config: backup failed: {}", e);
            return;
        }

        if let Err(e) = Self::evict_old_backups(&self.backup_dir) {
            tracing::warn!("config: backup eviction failed: {}", e);
        }
    }

    fn evict_old_backups(dir: &Path) -> std::io::Result<()> {
        let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("config_backup_"))
            })
            .collect();

        // Timestamped names sort oldest-first lexically.
        backups.sort();
        while backups.len() > BACKUP_KEEP {
            fs::remove_file(backups.remove(0))?;
        }
        Ok(())
    }
}
