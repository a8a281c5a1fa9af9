//! Optional per-memory disk cache.
//!
//! The store is advisory. Disk state must never affect the semantic result
//! of an evaluation: any I/O error, corruption, or codec mismatch is treated
//! as a cache miss, and writes are best-effort. Losing a backup only forces
//! recomputation.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{trace, warn};

use crate::hash::Fingerprint;
use crate::{Content, Key};

/// On-disk key -> (content, fingerprint) store scoped to one memory.
///
/// Layout under the backup root:
///
/// ```text
/// <backup_root>/memories/<key>/<key>_content.bin    primary codec (bincode)
/// <backup_root>/memories/<key>/<key>_content.json   fallback codec (serde_json)
/// <backup_root>/memories/<key>/<key>_hash.bin       fingerprint
/// ```
///
/// The fallback codec exists because bincode cannot round-trip every serde
/// type (self-describing contents like `serde_json::Value` fail to decode).
#[derive(Debug, Clone)]
pub struct BackupStore {
    directory: PathBuf,
    key: Key,
}

impl BackupStore {
    pub(crate) fn new(root: &Path, key: &Key) -> BackupStore {
        BackupStore {
            directory: root.join("memories").join(key.as_str()),
            key: key.clone(),
        }
    }

    fn content_path(&self) -> PathBuf {
        self.directory.join(format!("{}_content.bin", self.key))
    }

    fn fallback_path(&self) -> PathBuf {
        self.directory.join(format!("{}_content.json", self.key))
    }

    fn hash_path(&self) -> PathBuf {
        self.directory.join(format!("{}_hash.bin", self.key))
    }

    /// Whether a usable backup (fingerprint plus some content file) exists.
    pub fn exists(&self) -> bool {
        self.hash_path().is_file()
            && (self.content_path().is_file() || self.fallback_path().is_file())
    }

    pub fn load_hash(&self) -> Option<Fingerprint> {
        let bytes = fs::read(self.hash_path()).ok()?;
        match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((print, _)) => Some(print),
            Err(error) => {
                warn!(key = %self.key, %error, "discarding unreadable backup fingerprint");
                None
            }
        }
    }

    pub fn store_hash(&self, print: Fingerprint) -> bool {
        if fs::create_dir_all(&self.directory).is_err() {
            return false;
        }
        let bytes = match bincode::serde::encode_to_vec(print, bincode::config::standard()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        match fs::write(self.hash_path(), bytes) {
            Ok(()) => true,
            Err(error) => {
                warn!(key = %self.key, %error, "could not write backup fingerprint");
                let _ = fs::remove_file(self.hash_path());
                false
            }
        }
    }

    /// Loads the backed-up content, trying the primary codec first.
    pub fn load_content<T: Content>(&self) -> Option<T> {
        if let Ok(bytes) = fs::read(self.content_path()) {
            match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
                Ok((content, _)) => return Some(content),
                Err(error) => {
                    warn!(key = %self.key, %error, "backup content failed primary decode");
                }
            }
        }
        if let Ok(bytes) = fs::read(self.fallback_path()) {
            match serde_json::from_slice(&bytes) {
                Ok(content) => return Some(content),
                Err(error) => {
                    warn!(key = %self.key, %error, "backup content failed fallback decode");
                }
            }
        }
        None
    }

    /// Writes the content with the primary codec, falling back to the
    /// secondary codec. On double failure any partial file is deleted and
    /// the memory simply has no backup.
    pub fn store_content<T: Content>(&self, content: &T) -> bool {
        if fs::create_dir_all(&self.directory).is_err() {
            return false;
        }
        match bincode::serde::encode_to_vec(content, bincode::config::standard()) {
            // bincode encodes more types than it can decode (anything that
            // deserializes with `deserialize_any`), so a backup is only
            // committed to the primary codec if the bytes decode back.
            Ok(bytes)
                if bincode::serde::decode_from_slice::<T, _>(
                    &bytes,
                    bincode::config::standard(),
                )
                .is_ok() =>
            {
                if fs::write(self.content_path(), bytes).is_ok() {
                    // A stale fallback file must not shadow the fresh primary.
                    let _ = fs::remove_file(self.fallback_path());
                    trace!(key = %self.key, "backed up content (primary codec)");
                    return true;
                }
                let _ = fs::remove_file(self.content_path());
            }
            Ok(_) => {
                trace!(key = %self.key, "content does not round-trip the primary codec");
            }
            Err(error) => {
                trace!(key = %self.key, %error, "primary backup codec refused content");
            }
        }
        match serde_json::to_vec(content) {
            Ok(bytes) => {
                if fs::write(self.fallback_path(), bytes).is_ok() {
                    let _ = fs::remove_file(self.content_path());
                    trace!(key = %self.key, "backed up content (fallback codec)");
                    return true;
                }
                let _ = fs::remove_file(self.fallback_path());
            }
            Err(error) => {
                warn!(key = %self.key, %error, "content not serializable by either backup codec");
            }
        }
        let _ = fs::remove_file(self.content_path());
        let _ = fs::remove_file(self.fallback_path());
        false
    }
}
