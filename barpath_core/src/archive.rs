//! CSV archive of committed sets.
//!
//! Rollup moves the history WAL into a flat CSV file: the CSV is fsynced
//! before the WAL is renamed to `.processed`, so a crash in between at
//! worst duplicates rows (readers dedupe them) and never loses any.

use crate::{
    BodyWeightSetData, CalibrationRating, Error, Result, SetData, SetRecord, TimerSetData,
    WeightSetData,
};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use uuid::Uuid;

/// One set per row; columns that do not apply to the set type are empty
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CsvRow {
    workout_history_id: String,
    workout_id: String,
    exercise_id: String,
    set_id: String,
    set_index: usize,
    set_type: String,
    reps: Option<u32>,
    weight: Option<f64>,
    additional_weight: Option<f64>,
    relative_body_weight: Option<f64>,
    volume: Option<f64>,
    rir: Option<u8>,
    form_breakdown: Option<bool>,
    start_timer: Option<i64>,
    end_timer: Option<i64>,
    recorded_at: String,
}

impl From<&SetRecord> for CsvRow {
    fn from(record: &SetRecord) -> Self {
        let mut row = CsvRow {
            workout_history_id: record.workout_history_id.to_string(),
            workout_id: record.workout_id.clone(),
            exercise_id: record.exercise_id.clone(),
            set_id: record.set_id.clone(),
            set_index: record.set_index,
            set_type: String::new(),
            reps: None,
            weight: None,
            additional_weight: None,
            relative_body_weight: None,
            volume: None,
            rir: None,
            form_breakdown: None,
            start_timer: None,
            end_timer: None,
            recorded_at: record.recorded_at.to_rfc3339(),
        };

        match &record.data {
            SetData::Weight(d) => {
                row.set_type = "weight".into();
                row.reps = Some(d.actual_reps);
                row.weight = Some(d.actual_weight);
                row.volume = Some(d.volume);
                row.rir = d.calibration.map(|c| c.rir);
                row.form_breakdown = d.calibration.map(|c| c.form_breakdown);
            }
            SetData::BodyWeight(d) => {
                row.set_type = "body_weight".into();
                row.reps = Some(d.actual_reps);
                row.additional_weight = Some(d.additional_weight);
                row.relative_body_weight = Some(d.relative_body_weight);
                row.volume = Some(d.volume);
            }
            SetData::Endurance(t) | SetData::TimedDuration(t) | SetData::Rest(t) => {
                row.set_type = match &record.data {
                    SetData::Endurance(_) => "endurance",
                    SetData::TimedDuration(_) => "timed_duration",
                    _ => "rest",
                }
                .into();
                row.start_timer = Some(t.start_timer);
                row.end_timer = Some(t.end_timer);
            }
        }
        row
    }
}

fn required<T>(value: Option<T>, column: &str, set_id: &str) -> Result<T> {
    value.ok_or_else(|| Error::Other(format!("Set '{}': missing {} column", set_id, column)))
}

impl TryFrom<CsvRow> for SetRecord {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let workout_history_id = Uuid::parse_str(&row.workout_history_id)
            .map_err(|e| Error::Other(format!("Invalid UUID: {}", e)))?;

        let recorded_at = DateTime::parse_from_rfc3339(&row.recorded_at)
            .map_err(|e| Error::Other(format!("Invalid date: {}", e)))?
            .with_timezone(&Utc);

        let id = row.set_id.as_str();
        let timer = || -> Result<TimerSetData> {
            Ok(TimerSetData {
                start_timer: required(row.start_timer, "start_timer", id)?,
                end_timer: required(row.end_timer, "end_timer", id)?,
            })
        };

        let data = match row.set_type.as_str() {
            "weight" => SetData::Weight(WeightSetData {
                actual_reps: required(row.reps, "reps", id)?,
                actual_weight: required(row.weight, "weight", id)?,
                volume: row.volume.unwrap_or_default(),
                calibration: row.rir.map(|rir| CalibrationRating {
                    rir,
                    form_breakdown: row.form_breakdown.unwrap_or(false),
                }),
            }),
            "body_weight" => SetData::BodyWeight(BodyWeightSetData {
                actual_reps: required(row.reps, "reps", id)?,
                additional_weight: row.additional_weight.unwrap_or_default(),
                relative_body_weight: row.relative_body_weight.unwrap_or_default(),
                volume: row.volume.unwrap_or_default(),
            }),
            "endurance" => SetData::Endurance(timer()?),
            "timed_duration" => SetData::TimedDuration(timer()?),
            "rest" => SetData::Rest(timer()?),
            other => {
                return Err(Error::Other(format!(
                    "Set '{}': unknown set type '{}'",
                    id, other
                )))
            }
        };

        Ok(SetRecord {
            workout_history_id,
            workout_id: row.workout_id,
            exercise_id: row.exercise_id,
            set_id: row.set_id,
            set_index: row.set_index,
            data,
            recorded_at,
        })
    }
}

/// Load all records from a CSV archive, skipping rows that fail to parse
pub(crate) fn load_records_from_csv(path: &Path) -> Result<Vec<SetRecord>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;

    let mut records = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        match result {
            Ok(row) => match SetRecord::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Failed to parse CSV row: {}", e),
            },
            Err(e) => tracing::warn!("Failed to deserialize CSV row: {}", e),
        }
    }

    Ok(records)
}

/// Roll up the history WAL into the CSV archive and retire the WAL.
///
/// Returns the number of records moved. The CSV is created with headers
/// when new and appended to otherwise.
pub fn wal_to_csv_and_archive(wal_path: &Path, csv_path: &Path) -> Result<usize> {
    let records = crate::history::read_records(wal_path)?;

    if records.is_empty() {
        tracing::info!("No set records in WAL to roll up");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    for record in &records {
        writer.serialize(CsvRow::from(record))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Wrote {} set records to CSV", records.len());

    let processed_path = wal_path.with_extension("wal.processed");
    std::fs::rename(wal_path, &processed_path)?;

    tracing::info!("Archived WAL to {:?}", processed_path);

    Ok(records.len())
}

/// Remove all `.processed` WAL files in a directory
pub fn cleanup_processed_wals(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().map(|ext| ext == "processed").unwrap_or(false) {
            std::fs::remove_file(&path)?;
            tracing::debug!("Removed processed WAL: {:?}", path);
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Cleaned up {} processed WAL files", count);
    }

    Ok(count)
}
