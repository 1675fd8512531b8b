//! Encrypted storage for files produced by successful attempts.
//!
//! Layout: `<root>/<task_id>/<artifact_id>.bin` holds `nonce || ciphertext ||
//! tag`, with `<artifact_id>.meta.json` beside it. Keys are re-derived from
//! the task id and environment name on every read.

use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{self, CryptoError};
use crate::types::{Artifact, ArtifactMeta, StagedFile};

const BLOB_EXT: &str = "bin";
const META_SUFFIX: &str = ".meta.json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(Uuid),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("could not decrypt artifact {id}: {source}")]
    Decryption {
        id: Uuid,
        #[source]
        source: CryptoError,
    },
    #[error("could not encrypt {path}: {source}")]
    Encryption {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// File-system-backed encrypted artifact store.
///
/// Cheap to clone. Stores for different tasks never contend; stores for the
/// same task are serialised by a per-task lock.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    task_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            task_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn task_lock(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        self.task_locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Encrypt and persist staged files, deleting each plaintext once its
    /// ciphertext and metadata are on disk.
    ///
    /// Each file stands alone: one that cannot be read or encrypted is logged,
    /// left where it is, and omitted from the result.
    pub fn store(&self, task_id: Uuid, environment_name: &str, files: &[StagedFile]) -> Vec<Artifact> {
        let lock = self.task_lock(task_id);
        let stored = {
            let _guard = lock.lock().unwrap_or_else(|e| {
                warn!("artifact lock was poisoned, recovering");
                e.into_inner()
            });
            self.store_all(task_id, environment_name, files)
        };
        // Held only by the map and `lock`: no other store for this task.
        self.task_locks.remove_if(&task_id, |_, l| Arc::strong_count(l) == 2);
        stored
    }

    /// Number of tasks with a live lock entry.
    pub fn locked_tasks(&self) -> usize {
        self.task_locks.len()
    }

    fn store_all(&self, task_id: Uuid, environment_name: &str, files: &[StagedFile]) -> Vec<Artifact> {
        let key = crypto::derive_task_key(task_id, environment_name);
        let mut stored = Vec::with_capacity(files.len());

        for file in files {
            match self.store_one(task_id, environment_name, &key, file) {
                Ok(artifact) => {
                    debug!(task_id = %task_id, artifact_id = %artifact.id, name = %artifact.meta.original_name, "artifact stored");
                    stored.push(artifact);
                }
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        path = %file.path.display(),
                        error = %e,
                        "skipping artifact, plaintext left in staging"
                    );
                }
            }
        }

        info!(task_id = %task_id, stored = stored.len(), staged = files.len(), "artifacts persisted");
        stored
    }

    fn store_one(
        &self,
        task_id: Uuid,
        environment_name: &str,
        key: &crypto::EncryptionKey,
        file: &StagedFile,
    ) -> Result<Artifact, ArtifactError> {
        let plaintext = std::fs::read(&file.path)?;
        let ciphertext = crypto::encrypt(key, &plaintext).map_err(|source| ArtifactError::Encryption {
            path: file.path.clone(),
            source,
        })?;

        let id = Uuid::new_v4();
        let dir = self.task_dir(task_id);
        std::fs::create_dir_all(&dir)?;
        let blob_path = dir.join(format!("{id}.{BLOB_EXT}"));
        let meta_path = dir.join(format!("{id}{META_SUFFIX}"));

        let original_name = if file.relative_path.as_os_str().is_empty() {
            file.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.to_string())
        } else {
            file.relative_path.to_string_lossy().into_owned()
        };

        let meta = ArtifactMeta {
            id,
            task_id,
            environment_name: environment_name.to_string(),
            original_name,
            size_bytes: plaintext.len() as u64,
            sha256: crypto::sha256_hex(&plaintext),
            created_at: Utc::now(),
        };

        write_atomic(&blob_path, &ciphertext)?;
        let written = serde_json::to_vec_pretty(&meta)
            .map_err(ArtifactError::from)
            .and_then(|json| write_atomic(&meta_path, &json).map_err(ArtifactError::from));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&blob_path);
            return Err(e);
        }

        if let Err(e) = std::fs::remove_file(&file.path) {
            warn!(path = %file.path.display(), error = %e, "failed to remove staged plaintext");
        }

        Ok(Artifact {
            id,
            task_id,
            blob_path,
            meta,
        })
    }

    /// Metadata for every artifact of a task, oldest first. Never decrypts.
    pub fn list(&self, task_id: Uuid) -> Result<Vec<ArtifactMeta>, ArtifactError> {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut metas = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !is_meta_file(&path) {
                continue;
            }
            match read_meta(&path) {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable artifact metadata"),
            }
        }
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(metas)
    }

    /// Ids of every task that has a directory in the store.
    pub fn list_tasks(&self) -> Result<Vec<Uuid>, ArtifactError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                tasks.push(id);
            }
        }
        tasks.sort();
        Ok(tasks)
    }

    /// Metadata for a single artifact.
    pub fn meta(&self, artifact_id: Uuid) -> Result<ArtifactMeta, ArtifactError> {
        let (_, meta_path) = self.locate(artifact_id)?;
        read_meta(&meta_path)
    }

    /// Decrypt an artifact. Wrong keys and corrupted blobs are reported as
    /// [`ArtifactError::Decryption`]; no partial plaintext is ever returned.
    pub fn load(&self, artifact_id: Uuid) -> Result<Vec<u8>, ArtifactError> {
        let (blob_path, meta_path) = self.locate(artifact_id)?;
        let meta = read_meta(&meta_path)?;
        let ciphertext = std::fs::read(&blob_path)?;
        let key = crypto::derive_task_key(meta.task_id, &meta.environment_name);
        crypto::decrypt(&key, &ciphertext).map_err(|source| {
            warn!(artifact_id = %artifact_id, error = %source, "artifact failed to decrypt");
            ArtifactError::Decryption {
                id: artifact_id,
                source,
            }
        })
    }

    /// Remove an artifact's blob and metadata.
    pub fn delete(&self, artifact_id: Uuid) -> Result<(), ArtifactError> {
        let (blob_path, meta_path) = self.locate(artifact_id)?;
        std::fs::remove_file(&blob_path)?;
        std::fs::remove_file(&meta_path)?;
        if let Some(dir) = meta_path.parent() {
            // Only succeeds once the task directory is empty.
            let _ = std::fs::remove_dir(dir);
        }
        info!(artifact_id = %artifact_id, "artifact deleted");
        Ok(())
    }

    fn locate(&self, artifact_id: Uuid) -> Result<(PathBuf, PathBuf), ArtifactError> {
        for task_id in self.list_tasks()? {
            let dir = self.task_dir(task_id);
            let meta_path = dir.join(format!("{artifact_id}{META_SUFFIX}"));
            if meta_path.exists() {
                return Ok((dir.join(format!("{artifact_id}.{BLOB_EXT}")), meta_path));
            }
        }
        Err(ArtifactError::NotFound(artifact_id))
    }
}

fn is_meta_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(META_SUFFIX))
}

fn read_meta(path: &Path) -> Result<ArtifactMeta, ArtifactError> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
