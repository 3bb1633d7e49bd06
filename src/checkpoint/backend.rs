//! Storage backends for checkpoint artifacts.
//!
//! Epistemic foundation:
//! - K_i: Each operation owns two artifacts: the state document and the
//!   partial-results document
//! - K_i: Writes replace an artifact atomically (temp → sync → rename)
//! - I^B: Crash during write → the previous state document survives as backup

use dashmap::DashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::{HarvestError, Result};

const STATE_SUFFIX: &str = "_progress.json";
const BACKUP_SUFFIX: &str = "_progress.backup.json";
const PARTIAL_SUFFIX: &str = "_partial.json";

/// Artifact of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    State,
    /// Previous state document, kept on every state write
    StateBackup,
    Partial,
}

/// Durable storage used by the checkpoint store.
///
/// Names passed in are storage keys produced by [`storage_name`](super::storage_name).
pub trait CheckpointBackend: Send + Sync {
    /// Read an artifact, `None` if it does not exist.
    fn read(&self, name: &str, artifact: Artifact) -> Result<Option<Vec<u8>>>;

    /// Atomically replace an artifact. Writing [`Artifact::State`] keeps the
    /// previous state document as [`Artifact::StateBackup`].
    fn write(&self, name: &str, artifact: Artifact, bytes: &[u8]) -> Result<()>;

    /// Remove every artifact of an operation.
    fn remove(&self, name: &str) -> Result<()>;

    /// Names of operations that have a state document.
    fn operations(&self) -> Result<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Directory backend
// ═══════════════════════════════════════════════════════════════════════════

/// Files `<name>_progress.json`, `<name>_progress.backup.json` and
/// `<name>_partial.json` in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    dir: PathBuf,
}

impl DirectoryBackend {
    /// Create a backend, creating the directory if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| HarvestError::io("creating checkpoint dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of one artifact.
    pub fn path(&self, name: &str, artifact: Artifact) -> PathBuf {
        let suffix = match artifact {
            Artifact::State => STATE_SUFFIX,
            Artifact::StateBackup => BACKUP_SUFFIX,
            Artifact::Partial => PARTIAL_SUFFIX,
        };
        self.dir.join(format!("{name}{suffix}"))
    }
}

impl CheckpointBackend for DirectoryBackend {
    fn read(&self, name: &str, artifact: Artifact) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(name, artifact)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HarvestError::io("reading checkpoint artifact", e)),
        }
    }

    fn write(&self, name: &str, artifact: Artifact, bytes: &[u8]) -> Result<()> {
        let target = self.path(name, artifact);

        // Backup existing state document
        if artifact == Artifact::State && target.exists() {
            fs::copy(&target, self.path(name, Artifact::StateBackup))
                .map_err(|e| HarvestError::io("backing up checkpoint", e))?;
        }

        // Write to temp file
        let temp_path = target.with_extension("json.tmp");
        let mut file =
            File::create(&temp_path).map_err(|e| HarvestError::io("creating temp checkpoint", e))?;
        file.write_all(bytes)
            .map_err(|e| HarvestError::io("writing temp checkpoint", e))?;
        file.sync_all()
            .map_err(|e| HarvestError::io("syncing temp checkpoint", e))?;

        // Atomic rename
        fs::rename(&temp_path, &target).map_err(|e| HarvestError::io("renaming checkpoint", e))?;

        debug!(path = %target.display(), bytes = bytes.len(), "Checkpoint artifact written");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        for artifact in [Artifact::State, Artifact::StateBackup, Artifact::Partial] {
            match fs::remove_file(self.path(name, artifact)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(HarvestError::io("removing checkpoint artifact", e)),
            }
        }
        Ok(())
    }

    fn operations(&self) -> Result<Vec<String>> {
        let pattern = self.dir.join(format!("*{STATE_SUFFIX}"));
        let mut names: Vec<String> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| HarvestError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .filter_map(|path| {
                path.file_name()
                    .and_then(|f| f.to_str())
                    .and_then(|f| f.strip_suffix(STATE_SUFFIX))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Memory backend
// ═══════════════════════════════════════════════════════════════════════════

/// In-process backend for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    artifacts: DashMap<(String, Artifact), Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointBackend for MemoryBackend {
    fn read(&self, name: &str, artifact: Artifact) -> Result<Option<Vec<u8>>> {
        Ok(self
            .artifacts
            .get(&(name.to_string(), artifact))
            .map(|bytes| bytes.value().clone()))
    }

    fn write(&self, name: &str, artifact: Artifact, bytes: &[u8]) -> Result<()> {
        if artifact == Artifact::State {
            if let Some(previous) = self.read(name, Artifact::State)? {
                self.artifacts
                    .insert((name.to_string(), Artifact::StateBackup), previous);
            }
        }
        self.artifacts
            .insert((name.to_string(), artifact), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.artifacts.retain(|(n, _), _| n != name);
        Ok(())
    }

    fn operations(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .artifacts
            .iter()
            .filter(|entry| entry.key().1 == Artifact::State)
            .map(|entry| entry.key().0.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_layout_and_backup() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path()).unwrap();

        backend.write("demo", Artifact::State, b"first").unwrap();
        backend.write("demo", Artifact::State, b"second").unwrap();
        backend.write("demo", Artifact::Partial, b"[]").unwrap();

        assert!(dir.path().join("demo_progress.json").exists());
        assert!(dir.path().join("demo_partial.json").exists());
        assert_eq!(
            backend.read("demo", Artifact::StateBackup).unwrap().as_deref(),
            Some(&b"first"[..])
        );
        assert_eq!(
            backend.read("demo", Artifact::State).unwrap().as_deref(),
            Some(&b"second"[..])
        );
        assert!(!dir.path().join("demo_progress.json.tmp").exists());
    }

    #[test]
    fn test_directory_operations_and_remove() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path()).unwrap();
        backend.write("beta", Artifact::State, b"{}").unwrap();
        backend.write("alpha", Artifact::State, b"{}").unwrap();
        backend.write("alpha", Artifact::State, b"{}").unwrap();

        assert_eq!(backend.operations().unwrap(), vec!["alpha", "beta"]);

        backend.remove("alpha").unwrap();
        backend.remove("never-existed").unwrap();
        assert_eq!(backend.operations().unwrap(), vec!["beta"]);
        assert!(backend.read("alpha", Artifact::StateBackup).unwrap().is_none());
    }

    #[test]
    fn test_memory_backend_isolates_names() {
        let backend = MemoryBackend::new();
        backend.write("a", Artifact::State, b"1").unwrap();
        backend.write("a", Artifact::State, b"2").unwrap();
        backend.write("b", Artifact::Partial, b"[]").unwrap();

        assert_eq!(backend.operations().unwrap(), vec!["a"]);
        assert_eq!(backend.read("a", Artifact::StateBackup).unwrap(), Some(b"1".to_vec()));
        assert!(backend.read("b", Artifact::State).unwrap().is_none());

        backend.remove("a").unwrap();
        assert!(backend.read("a", Artifact::State).unwrap().is_none());
        assert!(backend.read("b", Artifact::Partial).unwrap().is_some());
    }
}
