//! Checkpoint persistence for in-progress sessions.
//!
//! One checkpoint per session, keyed by its history id. File checkpoints are
//! written atomically (temp file, fsync, rename) under an exclusive lock, so
//! a crash mid-write leaves the previous checkpoint intact.

use crate::recovery::RecoveryCheckpoint;
use crate::{Error, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Storage for session checkpoints
pub trait CheckpointStore {
    /// Persist a checkpoint, replacing any older one for the same session
    fn save(&mut self, checkpoint: &RecoveryCheckpoint) -> Result<()>;

    /// `Ok(None)` when absent, `Err` when present but unreadable
    fn load(&self, workout_history_id: Uuid) -> Result<Option<RecoveryCheckpoint>>;

    /// Ids of all stored checkpoints
    fn list(&self) -> Result<Vec<Uuid>>;

    fn delete(&mut self, workout_history_id: Uuid) -> Result<()>;
}

/// Checkpoints as `<dir>/<uuid>.json`
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read_locked(path: &Path) -> Result<String> {
        let file = File::open(path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        let _ = file.unlock();
        read?;
        Ok(contents)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, checkpoint: &RecoveryCheckpoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(checkpoint.workout_history_id);

        // Never let a late write overwrite a newer checkpoint
        if let Ok(Some(existing)) = self.load(checkpoint.workout_history_id) {
            if existing.sequence > checkpoint.sequence {
                tracing::debug!(
                    "Skipping stale checkpoint {} (stored sequence {})",
                    checkpoint.sequence,
                    existing.sequence
                );
                return Ok(());
            }
        }

        let temp = NamedTempFile::new_in(&self.dir)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(checkpoint)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!(
            "Saved checkpoint {} for session {}",
            checkpoint.sequence,
            checkpoint.workout_history_id
        );
        Ok(())
    }

    fn load(&self, workout_history_id: Uuid) -> Result<Option<RecoveryCheckpoint>> {
        let path = self.path_for(workout_history_id);
        if !path.exists() {
            return Ok(None);
        }

        let contents = Self::read_locked(&path)?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::Checkpoint(format!("{:?}: {}", path, e)))
    }

    fn list(&self) -> Result<Vec<Uuid>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                match path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                {
                    Some(id) => ids.push(id),
                    None => tracing::warn!("Ignoring unexpected file in checkpoint dir: {:?}", path),
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&mut self, workout_history_id: Uuid) -> Result<()> {
        let path = self.path_for(workout_history_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Deleted checkpoint {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store holding serialized checkpoints; clones share contents
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Arc<Mutex<HashMap<Uuid, String>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the raw stored text, e.g. to simulate a torn write
    pub fn put_raw(&self, workout_history_id: Uuid, contents: impl Into<String>) {
        self.entries().insert(workout_history_id, contents.into());
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, String>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, checkpoint: &RecoveryCheckpoint) -> Result<()> {
        let contents = serde_json::to_string(checkpoint)?;
        let mut entries = self.entries();
        if let Some(existing) = entries
            .get(&checkpoint.workout_history_id)
            .and_then(|raw| serde_json::from_str::<RecoveryCheckpoint>(raw).ok())
        {
            if existing.sequence > checkpoint.sequence {
                return Ok(());
            }
        }
        entries.insert(checkpoint.workout_history_id, contents);
        Ok(())
    }

    fn load(&self, workout_history_id: Uuid) -> Result<Option<RecoveryCheckpoint>> {
        match self.entries().get(&workout_history_id) {
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| Error::Checkpoint(format!("{}: {}", workout_history_id, e))),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.entries().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&mut self, workout_history_id: Uuid) -> Result<()> {
        self.entries().remove(&workout_history_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MachineSnapshot, WorkoutState};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn checkpoint(id: Uuid, sequence: u64) -> RecoveryCheckpoint {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        RecoveryCheckpoint {
            workout_history_id: id,
            workout_id: "press_quick".into(),
            sequence,
            snapshot: MachineSnapshot {
                current: WorkoutState::Preparing,
                back_stack: vec![],
                working: BTreeMap::new(),
            },
            loaded_plates: BTreeMap::new(),
            start_time: at,
            last_persisted_at: at,
        }
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(temp_dir.path().join("checkpoints"));
        let id = Uuid::new_v4();

        assert!(store.load(id).unwrap().is_none());
        store.save(&checkpoint(id, 1)).unwrap();
        assert_eq!(store.load(id).unwrap(), Some(checkpoint(id, 1)));
        assert_eq!(store.list().unwrap(), vec![id]);

        store.delete(id).unwrap();
        assert!(store.load(id).unwrap().is_none());
        // Deleting twice is fine
        store.delete(id).unwrap();
    }

    #[test]
    fn test_file_store_ignores_stale_sequence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(temp_dir.path());
        let id = Uuid::new_v4();

        store.save(&checkpoint(id, 5)).unwrap();
        store.save(&checkpoint(id, 3)).unwrap();
        assert_eq!(store.load(id).unwrap().unwrap().sequence, 5);
        store.save(&checkpoint(id, 6)).unwrap();
        assert_eq!(store.load(id).unwrap().unwrap().sequence, 6);
    }

    #[test]
    fn test_file_store_corrupt_checkpoint_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path());
        let id = Uuid::new_v4();
        std::fs::write(temp_dir.path().join(format!("{}.json", id)), "{ half a checkpoint").unwrap();

        assert!(matches!(store.load(id), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn test_file_store_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(temp_dir.path());
        let id = Uuid::new_v4();
        store.save(&checkpoint(id, 1)).unwrap();
        store.save(&checkpoint(id, 2)).unwrap();

        let files: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_memory_store_shares_state_and_detects_corruption() {
        let store = MemoryCheckpointStore::new();
        let mut writer = store.clone();
        let id = Uuid::new_v4();

        writer.save(&checkpoint(id, 2)).unwrap();
        assert_eq!(store.load(id).unwrap().unwrap().sequence, 2);

        store.put_raw(id, "{");
        assert!(matches!(store.load(id), Err(Error::Checkpoint(_))));
    }
}
