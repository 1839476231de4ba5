//! Committed-set history.
//!
//! Every set that leaves the state machine is appended to a JSONL write-ahead
//! log under an exclusive file lock. Rollup later moves it into the CSV
//! archive (see [`crate::archive`]); reads merge both.

use crate::archive::load_records_from_csv;
use crate::{Result, SetData, SetRecord};
use fs2::FileExt;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Destination for committed sets
pub trait SetHistorySink {
    fn append(&mut self, record: &SetRecord) -> Result<()>;
}

/// JSONL-based history sink with file locking
pub struct JsonlHistory {
    path: PathBuf,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl SetHistorySink for JsonlHistory {
    fn append(&mut self, record: &SetRecord) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        file.unlock()?;

        tracing::debug!(
            "Appended set {} of workout {} to history",
            record.set_id,
            record.workout_history_id
        );
        Ok(())
    }
}

/// In-memory sink; clones share the same record list
#[derive(Clone, Debug, Default)]
pub struct MemoryHistory {
    records: Arc<Mutex<Vec<SetRecord>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SetRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SetHistorySink for MemoryHistory {
    fn append(&mut self, record: &SetRecord) -> Result<()> {
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.push(record.clone());
        Ok(())
    }
}

/// Read all records from a history WAL, skipping lines that fail to parse
pub fn read_records(path: &Path) -> Result<Vec<SetRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut records = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<SetRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("Failed to parse set record at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} set records from WAL", records.len());
    Ok(records)
}

/// Load records from both the WAL and the CSV archive.
///
/// Sorted oldest first. A set that appears in both (same session, same set,
/// same commit time) is kept once.
pub fn load_all_records(wal_path: &Path, csv_path: &Path) -> Result<Vec<SetRecord>> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();

    if wal_path.exists() {
        for record in read_records(wal_path)? {
            seen.insert(record_key(&record));
            records.push(record);
        }
    }

    if csv_path.exists() {
        let mut csv_count = 0;
        for record in load_records_from_csv(csv_path)? {
            if seen.insert(record_key(&record)) {
                records.push(record);
                csv_count += 1;
            }
        }
        tracing::debug!("Loaded {} set records from CSV", csv_count);
    }

    records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
    Ok(records)
}

fn record_key(record: &SetRecord) -> (Uuid, String, i64) {
    (
        record.workout_history_id,
        record.set_id.clone(),
        record.recorded_at.timestamp_millis(),
    )
}

/// Per-set data from the most recent earlier session of a workout.
///
/// Within that session the last commit of each set wins (a set redone
/// after undo is committed again). `exclude` skips the session in progress.
pub fn previous_session_data(
    records: &[SetRecord],
    workout_id: &str,
    exclude: Option<Uuid>,
) -> HashMap<String, SetData> {
    let latest_session = records
        .iter()
        .filter(|r| r.workout_id == workout_id && Some(r.workout_history_id) != exclude)
        .max_by_key(|r| r.recorded_at)
        .map(|r| r.workout_history_id);

    let Some(session_id) = latest_session else {
        return HashMap::new();
    };

    let mut session_records: Vec<&SetRecord> = records
        .iter()
        .filter(|r| r.workout_history_id == session_id)
        .collect();
    session_records.sort_by_key(|r| r.recorded_at);

    session_records
        .into_iter()
        .map(|r| (r.set_id.clone(), r.data.clone()))
        .collect()
}
