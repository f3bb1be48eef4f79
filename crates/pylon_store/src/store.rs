//! Flat-file script store with per-name locking.

use chrono::{DateTime, Utc};
use pylon_protocol::naming::{validate_folder_path, validate_script_name, NamingError};
use pylon_protocol::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use pylon_security::{sign_script, verify_script, SignatureError, SigningKey};

/// Script metadata, stored alongside the code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScriptMetadata {
    pub author: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A loaded script. `legacy` marks records that predate signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedScript {
    pub name: String,
    pub folder: String,
    pub code: String,
    pub metadata: ScriptMetadata,
    pub legacy: bool,
}

/// On-disk record shape. `signature` is absent on legacy records.
#[derive(Debug, Serialize, Deserialize)]
struct ScriptRecord {
    name: String,
    #[serde(default)]
    folder: String,
    code: String,
    metadata: ScriptMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("script '{0}' not found")]
    NotFound(String),
    #[error("script '{0}' already exists")]
    AlreadyExists(String),
    #[error("signature verification failed for script '{0}'")]
    SignatureInvalid(String),
    #[error("invalid name: {0}")]
    InvalidName(#[from] NamingError),
    #[error("stored record for '{name}' is unreadable")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Map to the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::AlreadyExists(_) => ErrorKind::InvalidInput,
            StoreError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            StoreError::InvalidName(_) => ErrorKind::InvalidInput,
            StoreError::Corrupt { .. } | StoreError::Io(_) => ErrorKind::InternalError,
        }
    }
}

/// Signed flat-file script store. Single writer per name, shared readers.
pub struct ScriptStore {
    root: PathBuf,
    key: SigningKey,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl ScriptStore {
    /// Open (and create if needed) the store at `root`.
    pub fn open(root: impl Into<PathBuf>, key: SigningKey) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            key,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Save (create or overwrite) a script. The stored record is signed;
    /// `created_at` survives overwrites, `modified_at` is refreshed.
    pub fn save(
        &self,
        name: &str,
        folder: &str,
        code: &str,
        author: Option<String>,
        description: Option<String>,
        version: Option<String>,
    ) -> Result<SavedScript, StoreError> {
        validate_script_name(name)?;
        validate_folder_path(folder)?;

        let lock = self.name_lock(name);
        let _guard = write_guard(&lock);

        let now = Utc::now();
        let created_at = match self.read_record(name) {
            Ok(Some(existing)) => existing.metadata.created_at,
            _ => now,
        };

        let metadata = ScriptMetadata {
            author,
            description,
            version,
            created_at,
            modified_at: now,
        };
        let record = ScriptRecord {
            name: name.to_string(),
            folder: folder.to_string(),
            code: code.to_string(),
            metadata: metadata.clone(),
            signature: Some(sign_script(&self.key, name, code)),
        };
        self.write_record(&record)?;
        debug!("Saved script '{}' ({} bytes)", name, code.len());

        Ok(SavedScript {
            name: name.to_string(),
            folder: folder.to_string(),
            code: code.to_string(),
            metadata,
            legacy: false,
        })
    }

    /// Load a script, verifying its signature. A tampered record returns
    /// `SignatureInvalid` and never yields code; an unsigned record loads
    /// flagged `legacy` with a warning.
    pub fn load(&self, name: &str) -> Result<SavedScript, StoreError> {
        validate_script_name(name)?;
        let lock = self.name_lock(name);
        let _guard = read_guard(&lock);

        let record = self
            .read_record(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let legacy = match &record.signature {
            Some(signature) => {
                match verify_script(&self.key, &record.name, &record.code, signature) {
                    Ok(()) => false,
                    Err(SignatureError::Mismatch | SignatureError::MalformedHex) => {
                        return Err(StoreError::SignatureInvalid(name.to_string()));
                    }
                }
            }
            None => {
                warn!("Script '{}' has no signature (legacy record)", name);
                true
            }
        };

        Ok(SavedScript {
            name: record.name,
            folder: record.folder,
            code: record.code,
            metadata: record.metadata,
            legacy,
        })
    }

    /// Delete a script. Deleting a missing script is `NotFound`.
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        validate_script_name(name)?;
        let lock = self.name_lock(name);
        let _guard = write_guard(&lock);

        let path = self.record_path(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// List every stored script. Unreadable records are skipped with a
    /// warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<SavedScript>, StoreError> {
        let mut scripts = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match self.read_record_at(&path) {
                Ok(record) => scripts.push(SavedScript {
                    legacy: record.signature.is_none(),
                    name: record.name,
                    folder: record.folder,
                    code: record.code,
                    metadata: record.metadata,
                }),
                Err(e) => {
                    warn!("Skipping unreadable record {}: {}", path.display(), e);
                }
            }
        }
        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scripts)
    }

    /// Folder paths derived from the stored scripts, deduplicated and
    /// including every ancestor.
    pub fn folders(&self) -> Result<Vec<String>, StoreError> {
        let mut folders = std::collections::BTreeSet::new();
        for script in self.list()? {
            if script.folder.is_empty() {
                continue;
            }
            let mut prefix = String::new();
            for segment in script.folder.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(segment);
                folders.insert(prefix.clone());
            }
        }
        Ok(folders.into_iter().collect())
    }

    /// Rename a script. The signature covers the name, so the record is
    /// re-signed under the new name before the old one is removed.
    pub fn rename(&self, old: &str, new: &str) -> Result<SavedScript, StoreError> {
        validate_script_name(old)?;
        validate_script_name(new)?;
        if old == new {
            return self.load(old);
        }

        // Lock both names in sorted order so two concurrent renames
        // cannot deadlock.
        let (first, second) = if old < new { (old, new) } else { (new, old) };
        let first_lock = self.name_lock(first);
        let second_lock = self.name_lock(second);
        let _first = write_guard(&first_lock);
        let _second = write_guard(&second_lock);

        if self.record_path(new).exists() {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }
        let record = self
            .read_record(old)?
            .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
        self.verify_loaded(&record)?;

        let renamed = ScriptRecord {
            name: new.to_string(),
            folder: record.folder,
            signature: Some(sign_script(&self.key, new, &record.code)),
            code: record.code,
            metadata: ScriptMetadata {
                modified_at: Utc::now(),
                ..record.metadata
            },
        };
        self.write_record(&renamed)?;
        std::fs::remove_file(self.record_path(old))?;

        Ok(SavedScript {
            name: renamed.name,
            folder: renamed.folder,
            code: renamed.code,
            metadata: renamed.metadata,
            legacy: false,
        })
    }

    /// Move a script to a different folder. Name and code are unchanged,
    /// so the signature carries over.
    pub fn move_to_folder(&self, name: &str, folder: &str) -> Result<SavedScript, StoreError> {
        validate_script_name(name)?;
        validate_folder_path(folder)?;
        let lock = self.name_lock(name);
        let _guard = write_guard(&lock);

        let mut record = self
            .read_record(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.verify_loaded(&record)?;

        record.folder = folder.to_string();
        record.metadata.modified_at = Utc::now();
        // Re-sign unconditionally: this also upgrades legacy records the
        // first time they are touched.
        record.signature = Some(sign_script(&self.key, &record.name, &record.code));
        self.write_record(&record)?;

        Ok(SavedScript {
            name: record.name,
            folder: record.folder,
            code: record.code,
            metadata: record.metadata,
            legacy: false,
        })
    }

    fn verify_loaded(&self, record: &ScriptRecord) -> Result<(), StoreError> {
        if let Some(signature) = &record.signature {
            verify_script(&self.key, &record.name, &record.code, signature)
                .map_err(|_| StoreError::SignatureInvalid(record.name.clone()))?;
        } else {
            warn!("Script '{}' has no signature (legacy record)", record.name);
        }
        Ok(())
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    fn read_record(&self, name: &str) -> Result<Option<ScriptRecord>, StoreError> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        self.read_record_at(&path).map(Some)
    }

    fn read_record_at(&self, path: &Path) -> Result<ScriptRecord, StoreError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source,
        })
    }

    /// Atomic write: temp file in the store root, fsync, rename.
    fn write_record(&self, record: &ScriptRecord) -> Result<(), StoreError> {
        let target = self.record_path(&record.name);
        let temp = self
            .root
            .join(format!(".{}.{}.tmp", record.name, std::process::id()));

        let json = serde_json::to_string_pretty(record).map_err(|source| StoreError::Corrupt {
            name: record.name.clone(),
            source,
        })?;
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = std::fs::rename(&temp, &target) {
            let _ = std::fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    fn name_lock(&self, name: &str) -> Arc<RwLock<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

fn write_guard(lock: &Arc<RwLock<()>>) -> std::sync::RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_guard(lock: &Arc<RwLock<()>>) -> std::sync::RwLockReadGuard<'_, ()> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ScriptStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ScriptStore::open(
            dir.path().join("scripts"),
            SigningKey::new(b"test-key".to_vec()),
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = test_store();
        let saved = store
            .save(
                "hello",
                "demos",
                "print('hi')",
                Some("alice".to_string()),
                Some("greeting".to_string()),
                None,
            )
            .unwrap();

        let loaded = store.load("hello").unwrap();
        assert_eq!(loaded.code, "print('hi')");
        assert_eq!(loaded.folder, "demos");
        assert_eq!(loaded.metadata.author.as_deref(), Some("alice"));
        assert!(!loaded.legacy);
        assert_eq!(loaded.metadata.created_at, saved.metadata.created_at);
    }

    #[test]
    fn test_overwrite_preserves_created_at() {
        let (_dir, store) = test_store();
        let first = store
            .save("s", "", "result = 1", None, None, None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let second = store
            .save("s", "", "result = 2", None, None, None)
            .unwrap();
        assert_eq!(first.metadata.created_at, second.metadata.created_at);
        assert!(second.metadata.modified_at > first.metadata.modified_at);
        assert_eq!(store.load("s").unwrap().code, "result = 2");
    }

    #[test]
    fn test_tamper_detection() {
        let (_dir, store) = test_store();
        store
            .save("hello", "", "print('hi')", None, None, None)
            .unwrap();

        // Corrupt one byte of the stored code out-of-band.
        let path = store.record_path("hello");
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("print('hi')", "print('ho')");
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap();

        match store.load("hello") {
            Err(StoreError::SignatureInvalid(name)) => assert_eq!(name, "hello"),
            other => panic!("expected SignatureInvalid, got {:?}", other.map(|s| s.name)),
        }
    }

    #[test]
    fn test_legacy_record_loads_with_flag() {
        let (_dir, store) = test_store();
        // Hand-write a record without a signature field.
        let record = serde_json::json!({
            "name": "old",
            "folder": "",
            "code": "result = 'vintage'",
            "metadata": {
                "author": null,
                "description": null,
                "version": null,
                "created_at": "2020-01-01T00:00:00Z",
                "modified_at": "2020-01-01T00:00:00Z"
            }
        });
        std::fs::write(
            store.record_path("old"),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        let loaded = store.load("old").unwrap();
        assert!(loaded.legacy);
        assert_eq!(loaded.code, "result = 'vintage'");
    }

    #[test]
    fn test_delete_idempotence_modulo_not_found() {
        let (_dir, store) = test_store();
        store.save("gone", "", "x = 1", None, None, None).unwrap();
        assert!(store.delete("gone").is_ok());
        assert!(matches!(store.delete("gone"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_rename_resigns_and_removes_old() {
        let (_dir, store) = test_store();
        store.save("before", "f", "x = 1", None, None, None).unwrap();
        let renamed = store.rename("before", "after").unwrap();
        assert_eq!(renamed.name, "after");
        assert_eq!(renamed.folder, "f");
        assert!(matches!(store.load("before"), Err(StoreError::NotFound(_))));
        // The new record verifies, so the signature was recomputed.
        assert!(!store.load("after").unwrap().legacy);
    }

    #[test]
    fn test_rename_refuses_collision() {
        let (_dir, store) = test_store();
        store.save("a", "", "1", None, None, None).unwrap();
        store.save("b", "", "2", None, None, None).unwrap();
        assert!(matches!(
            store.rename("a", "b"),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_move_to_folder() {
        let (_dir, store) = test_store();
        store.save("s", "old/path", "x = 1", None, None, None).unwrap();
        let moved = store.move_to_folder("s", "new/path").unwrap();
        assert_eq!(moved.folder, "new/path");
        assert_eq!(store.load("s").unwrap().folder, "new/path");
    }

    #[test]
    fn test_folders_include_ancestors() {
        let (_dir, store) = test_store();
        store
            .save("deep", "reports/2024/q1", "x = 1", None, None, None)
            .unwrap();
        store.save("top", "", "x = 2", None, None, None).unwrap();
        let folders = store.folders().unwrap();
        assert_eq!(
            folders,
            vec![
                "reports".to_string(),
                "reports/2024".to_string(),
                "reports/2024/q1".to_string()
            ]
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.save("bad name", "", "x", None, None, None),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.load("../escape"),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.save("ok", "bad folder", "x", None, None, None),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_list_sorted_and_skips_corrupt() {
        let (_dir, store) = test_store();
        store.save("zeta", "", "1", None, None, None).unwrap();
        store.save("alpha", "", "2", None, None, None).unwrap();
        std::fs::write(store.root.join("broken.json"), "{ not json").unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
