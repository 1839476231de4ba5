//! Core domain types for the Barpath session core.
//!
//! This module defines the fundamental types used throughout the system:
//! - Workout plan templates (components, exercises, sets)
//! - Per-session set data
//! - Equipment definitions and plate changes
//! - Committed set records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Set Templates
// ============================================================================

/// Role of a set within its exercise
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SetSubCategory {
    #[default]
    WorkSet,
    WarmupSet,
    /// Load is chosen in-session through the calibration protocol
    CalibrationSet,
}

/// Loaded set with target reps and weight
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WeightSet {
    pub id: String,
    pub reps: u32,
    pub weight: f64,
    #[serde(default)]
    pub sub_category: SetSubCategory,
}

/// Bodyweight set, optionally with added load
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BodyWeightSet {
    pub id: String,
    pub reps: u32,
    #[serde(default)]
    pub additional_weight: f64,
    #[serde(default)]
    pub sub_category: SetSubCategory,
}

/// Count-up set (e.g. a hold for as long as possible, capped at the target)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnduranceSet {
    pub id: String,
    pub time_in_millis: i64,
    #[serde(default)]
    pub auto_stop: bool,
    #[serde(default)]
    pub sub_category: SetSubCategory,
}

/// Count-down set of a fixed duration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimedDurationSet {
    pub id: String,
    pub time_in_millis: i64,
    #[serde(default)]
    pub auto_stop: bool,
    #[serde(default)]
    pub sub_category: SetSubCategory,
}

/// Rest period embedded in an exercise
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RestSet {
    pub id: String,
    pub time_in_seconds: u32,
    #[serde(default)]
    pub sub_category: SetSubCategory,
}

/// One performable unit inside an exercise
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Set {
    Weight(WeightSet),
    BodyWeight(BodyWeightSet),
    Endurance(EnduranceSet),
    TimedDuration(TimedDurationSet),
    Rest(RestSet),
}

impl Set {
    pub fn id(&self) -> &str {
        match self {
            Set::Weight(s) => &s.id,
            Set::BodyWeight(s) => &s.id,
            Set::Endurance(s) => &s.id,
            Set::TimedDuration(s) => &s.id,
            Set::Rest(s) => &s.id,
        }
    }

    pub fn sub_category(&self) -> SetSubCategory {
        match self {
            Set::Weight(s) => s.sub_category,
            Set::BodyWeight(s) => s.sub_category,
            Set::Endurance(s) => s.sub_category,
            Set::TimedDuration(s) => s.sub_category,
            Set::Rest(s) => s.sub_category,
        }
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, Set::Rest(_))
    }

    pub fn is_calibration(&self) -> bool {
        self.sub_category() == SetSubCategory::CalibrationSet
    }

    /// Timer bound in milliseconds for timer-bearing sets
    pub fn timer_bound_millis(&self) -> Option<i64> {
        match self {
            Set::Endurance(s) => Some(s.time_in_millis),
            Set::TimedDuration(s) => Some(s.time_in_millis),
            Set::Rest(s) => Some(i64::from(s.time_in_seconds) * 1000),
            Set::Weight(_) | Set::BodyWeight(_) => None,
        }
    }

    /// Whether the set ends on its own once its timer reaches the bound
    pub fn auto_stops(&self) -> bool {
        match self {
            Set::Endurance(s) => s.auto_stop,
            Set::TimedDuration(s) => s.auto_stop,
            Set::Rest(_) => true,
            Set::Weight(_) | Set::BodyWeight(_) => false,
        }
    }
}

// ============================================================================
// Set Data (per session)
// ============================================================================

/// Operator feedback captured after a calibration set
///
/// The numeric RIR and the form-breakdown flag are kept separately; a zero
/// RIR may or may not imply breakdown depending on the configured policy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalibrationRating {
    pub rir: u8,
    pub form_breakdown: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WeightSetData {
    pub actual_reps: u32,
    pub actual_weight: f64,
    pub volume: f64,
    #[serde(default)]
    pub calibration: Option<CalibrationRating>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BodyWeightSetData {
    pub actual_reps: u32,
    pub additional_weight: f64,
    pub relative_body_weight: f64,
    pub volume: f64,
}

/// Timer data: `start_timer` is the bound, `end_timer` the frozen progress
/// (elapsed for count-up sets, remaining for count-down ones).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerSetData {
    pub start_timer: i64,
    pub end_timer: i64,
}

/// Mutable per-execution record of a set
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetData {
    Weight(WeightSetData),
    BodyWeight(BodyWeightSetData),
    Endurance(TimerSetData),
    TimedDuration(TimerSetData),
    Rest(TimerSetData),
}

impl SetData {
    /// Fresh data for a set template, before the operator touches it
    pub fn initial_for(set: &Set, relative_body_weight: f64) -> Self {
        let mut data = match set {
            Set::Weight(s) => SetData::Weight(WeightSetData {
                actual_reps: s.reps,
                actual_weight: s.weight,
                volume: 0.0,
                calibration: None,
            }),
            Set::BodyWeight(s) => SetData::BodyWeight(BodyWeightSetData {
                actual_reps: s.reps,
                additional_weight: s.additional_weight,
                relative_body_weight,
                volume: 0.0,
            }),
            Set::Endurance(s) => SetData::Endurance(TimerSetData {
                start_timer: s.time_in_millis,
                end_timer: 0,
            }),
            Set::TimedDuration(s) => SetData::TimedDuration(TimerSetData {
                start_timer: s.time_in_millis,
                end_timer: s.time_in_millis,
            }),
            Set::Rest(s) => {
                let bound = i64::from(s.time_in_seconds) * 1000;
                SetData::Rest(TimerSetData {
                    start_timer: bound,
                    end_timer: bound,
                })
            }
        };
        data.recompute_volume();
        data
    }

    /// Whether this data can belong to the given set template
    pub fn matches(&self, set: &Set) -> bool {
        matches!(
            (self, set),
            (SetData::Weight(_), Set::Weight(_))
                | (SetData::BodyWeight(_), Set::BodyWeight(_))
                | (SetData::Endurance(_), Set::Endurance(_))
                | (SetData::TimedDuration(_), Set::TimedDuration(_))
                | (SetData::Rest(_), Set::Rest(_))
        )
    }

    pub fn recompute_volume(&mut self) {
        match self {
            SetData::Weight(d) => d.volume = d.actual_weight * f64::from(d.actual_reps),
            SetData::BodyWeight(d) => {
                d.volume = (d.relative_body_weight + d.additional_weight) * f64::from(d.actual_reps)
            }
            SetData::Endurance(_) | SetData::TimedDuration(_) | SetData::Rest(_) => {}
        }
    }

    pub fn timer(&self) -> Option<&TimerSetData> {
        match self {
            SetData::Endurance(t) | SetData::TimedDuration(t) | SetData::Rest(t) => Some(t),
            SetData::Weight(_) | SetData::BodyWeight(_) => None,
        }
    }

    pub fn timer_mut(&mut self) -> Option<&mut TimerSetData> {
        match self {
            SetData::Endurance(t) | SetData::TimedDuration(t) | SetData::Rest(t) => Some(t),
            SetData::Weight(_) | SetData::BodyWeight(_) => None,
        }
    }

    pub fn calibration(&self) -> Option<CalibrationRating> {
        match self {
            SetData::Weight(d) => d.calibration,
            _ => None,
        }
    }
}

// ============================================================================
// Equipment
// ============================================================================

/// A plate weight and how many pieces of it are owned (both sides together)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlateStock {
    pub weight: f64,
    pub quantity: u32,
}

/// How load is added on top of the base weight
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Loading {
    /// Plates loaded identically on both sides
    Plates { plates: Vec<PlateStock> },
    /// Pin-stack style increments
    FixedIncrement { increment: f64, max_additional: f64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WeightLoadedEquipment {
    pub id: String,
    pub name: String,
    pub base_weight: f64,
    pub loading: Loading,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccessoryEquipment {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Equipment {
    WeightLoaded(WeightLoadedEquipment),
    Accessory(AccessoryEquipment),
}

impl Equipment {
    pub fn id(&self) -> &str {
        match self {
            Equipment::WeightLoaded(e) => &e.id,
            Equipment::Accessory(e) => &e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Equipment::WeightLoaded(e) => &e.name,
            Equipment::Accessory(e) => &e.name,
        }
    }
}

// ============================================================================
// Plate Changes
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlateAction {
    Add,
    Remove,
}

/// One physical handling step, performed on each side of the bar
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlateStep {
    pub action: PlateAction,
    pub weight: f64,
}

/// Outcome of a plate-change computation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlateChangeResult {
    /// Plates on one side before the change, heaviest first
    pub current_configuration: Vec<f64>,
    /// Plates on one side after the change, heaviest first
    pub target_configuration: Vec<f64>,
    /// Total the caller asked for
    pub target_weight: f64,
    /// Total actually reached by `target_configuration`
    pub achieved_weight: f64,
    pub steps: Vec<PlateStep>,
}

impl PlateChangeResult {
    pub fn is_no_change(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when the requested total was reached within a gram
    pub fn is_exact(&self) -> bool {
        (self.achieved_weight - self.target_weight).abs() < 0.001
    }
}

// ============================================================================
// Workout Plan
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Exercise {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub equipment_id: Option<String>,
    pub sets: Vec<Set>,
}

/// Exercises performed round by round, resting only between rounds
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Superset {
    pub id: String,
    pub exercises: Vec<Exercise>,
    #[serde(default)]
    pub rest_seconds: u32,
}

/// Standalone rest between components
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rest {
    pub id: String,
    pub time_in_seconds: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkoutComponent {
    Exercise(Exercise),
    Superset(Superset),
    Rest(Rest),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Workout {
    pub id: String,
    pub name: String,
    pub components: Vec<WorkoutComponent>,
}

// ============================================================================
// History Records
// ============================================================================

/// A committed set, as handed to the history store
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SetRecord {
    pub workout_history_id: Uuid,
    pub workout_id: String,
    /// Empty for standalone rests between components
    pub exercise_id: String,
    pub set_id: String,
    pub set_index: usize,
    pub data: SetData,
    pub recorded_at: DateTime<Utc>,
}
