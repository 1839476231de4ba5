//! Workout plan library.
//!
//! Holds the immutable workout templates and equipment definitions, either
//! the built-in defaults or a JSON plan file, and flattens a workout into the
//! ordered list of steps a session walks through.

use crate::types::*;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Cached default library - built once and reused across all operations
static DEFAULT_LIBRARY: Lazy<PlanLibrary> = Lazy::new(build_default_library);

/// Get a reference to the cached default library
pub fn get_default_library() -> &'static PlanLibrary {
    &DEFAULT_LIBRARY
}

/// All workouts and equipment available to sessions
#[derive(Clone, Debug, Default)]
pub struct PlanLibrary {
    pub workouts: HashMap<String, Workout>,
    pub equipment: HashMap<String, Equipment>,
}

/// On-disk plan file layout
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlanFile {
    #[serde(default)]
    pub equipment: Vec<Equipment>,
    #[serde(default)]
    pub workouts: Vec<Workout>,
}

/// One entry of a flattened workout
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedStep {
    Set {
        exercise_id: String,
        set: Set,
        set_index: usize,
        equipment_id: Option<String>,
    },
    Rest {
        /// Exercise the rest belongs to, if any
        exercise_id: Option<String>,
        set: Set,
        set_index: usize,
    },
}

impl PlannedStep {
    pub fn set(&self) -> &Set {
        match self {
            PlannedStep::Set { set, .. } | PlannedStep::Rest { set, .. } => set,
        }
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, PlannedStep::Rest { .. })
    }

    pub fn exercise_id(&self) -> Option<&str> {
        match self {
            PlannedStep::Set { exercise_id, .. } => Some(exercise_id),
            PlannedStep::Rest { exercise_id, .. } => exercise_id.as_deref(),
        }
    }
}

impl PlanLibrary {
    /// Load a library from a JSON plan file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let file: PlanFile = serde_json::from_str(&contents)?;
        let library = Self::from_file(file);

        let errors = library.validate();
        if !errors.is_empty() {
            return Err(Error::PlanValidation(errors.join("; ")));
        }
        tracing::info!(
            "Loaded {} workouts and {} equipment definitions from {:?}",
            library.workouts.len(),
            library.equipment.len(),
            path
        );
        Ok(library)
    }

    pub fn from_file(file: PlanFile) -> Self {
        Self {
            workouts: file
                .workouts
                .into_iter()
                .map(|w| (w.id.clone(), w))
                .collect(),
            equipment: file
                .equipment
                .into_iter()
                .map(|e| (e.id().to_string(), e))
                .collect(),
        }
    }

    pub fn workout(&self, id: &str) -> Result<&Workout> {
        self.workouts
            .get(id)
            .ok_or_else(|| Error::UnknownWorkout(id.to_string()))
    }

    pub fn equipment(&self, id: &str) -> Result<&Equipment> {
        self.equipment
            .get(id)
            .ok_or_else(|| Error::UnknownEquipment(id.to_string()))
    }

    /// Workout ids in stable order
    pub fn workout_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.workouts.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Validate references and set definitions, returning every problem found
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for equipment in self.equipment.values() {
            if let Equipment::WeightLoaded(eq) = equipment {
                if eq.base_weight < 0.0 {
                    errors.push(format!("Equipment '{}': negative base weight", eq.id));
                }
                match &eq.loading {
                    Loading::Plates { plates } => {
                        for plate in plates {
                            if plate.weight <= 0.0 {
                                errors.push(format!(
                                    "Equipment '{}': plate weight {} must be positive",
                                    eq.id, plate.weight
                                ));
                            }
                        }
                    }
                    Loading::FixedIncrement {
                        increment,
                        max_additional,
                    } => {
                        if *increment <= 0.0 || *max_additional < 0.0 {
                            errors.push(format!(
                                "Equipment '{}': invalid increment {} / max {}",
                                eq.id, increment, max_additional
                            ));
                        }
                    }
                }
            }
        }

        for (id, workout) in &self.workouts {
            if workout.components.is_empty() {
                errors.push(format!("Workout '{}': has no components", id));
            }

            let mut seen_sets = HashSet::new();
            for exercise in workout_exercises(workout) {
                if let Some(eq_id) = &exercise.equipment_id {
                    if !self.equipment.contains_key(eq_id) {
                        errors.push(format!(
                            "Exercise '{}': equipment '{}' not found",
                            exercise.id, eq_id
                        ));
                    }
                }

                for set in &exercise.sets {
                    if !seen_sets.insert(set.id().to_string()) {
                        errors.push(format!(
                            "Workout '{}': duplicate set id '{}'",
                            id,
                            set.id()
                        ));
                    }
                    if set.is_calibration() && !matches!(set, Set::Weight(_)) {
                        errors.push(format!(
                            "Exercise '{}': calibration set '{}' must be a weight set",
                            exercise.id,
                            set.id()
                        ));
                    }
                    if let Some(bound) = set.timer_bound_millis() {
                        if bound <= 0 {
                            errors.push(format!(
                                "Exercise '{}': set '{}' has no duration",
                                exercise.id,
                                set.id()
                            ));
                        }
                    }
                }
            }
        }

        errors
    }
}

fn workout_exercises(workout: &Workout) -> impl Iterator<Item = &Exercise> {
    workout.components.iter().flat_map(|c| match c {
        WorkoutComponent::Exercise(e) => std::slice::from_ref(e).iter(),
        WorkoutComponent::Superset(s) => s.exercises.iter(),
        WorkoutComponent::Rest(_) => (&[] as &[Exercise]).iter(),
    })
}

/// Flatten a workout into the ordered steps of a session.
///
/// Supersets run round by round with their own rest between rounds (rest sets
/// inside superset exercises are ignored). Rests with nothing after them are
/// dropped.
pub fn flatten(workout: &Workout) -> Vec<PlannedStep> {
    let mut steps = Vec::new();

    for component in &workout.components {
        match component {
            WorkoutComponent::Exercise(exercise) => {
                for (set_index, set) in exercise.sets.iter().enumerate() {
                    if set.is_rest() {
                        steps.push(PlannedStep::Rest {
                            exercise_id: Some(exercise.id.clone()),
                            set: set.clone(),
                            set_index,
                        });
                    } else {
                        steps.push(PlannedStep::Set {
                            exercise_id: exercise.id.clone(),
                            set: set.clone(),
                            set_index,
                            equipment_id: exercise.equipment_id.clone(),
                        });
                    }
                }
            }
            WorkoutComponent::Superset(superset) => {
                let work_sets: Vec<Vec<(usize, &Set)>> = superset
                    .exercises
                    .iter()
                    .map(|e| e.sets.iter().enumerate().filter(|(_, s)| !s.is_rest()).collect())
                    .collect();
                let rounds = work_sets.iter().map(Vec::len).max().unwrap_or(0);

                for round in 0..rounds {
                    for (exercise, sets) in superset.exercises.iter().zip(&work_sets) {
                        if let Some((set_index, set)) = sets.get(round) {
                            steps.push(PlannedStep::Set {
                                exercise_id: exercise.id.clone(),
                                set: (*set).clone(),
                                set_index: *set_index,
                                equipment_id: exercise.equipment_id.clone(),
                            });
                        }
                    }
                    if round + 1 < rounds && superset.rest_seconds > 0 {
                        steps.push(PlannedStep::Rest {
                            exercise_id: None,
                            set: Set::Rest(RestSet {
                                id: format!("{}-rest-{}", superset.id, round + 1),
                                time_in_seconds: superset.rest_seconds,
                                sub_category: SetSubCategory::WorkSet,
                            }),
                            set_index: round,
                        });
                    }
                }
            }
            WorkoutComponent::Rest(rest) => steps.push(PlannedStep::Rest {
                exercise_id: None,
                set: Set::Rest(RestSet {
                    id: rest.id.clone(),
                    time_in_seconds: rest.time_in_seconds,
                    sub_category: SetSubCategory::WorkSet,
                }),
                set_index: 0,
            }),
        }
    }

    while steps.last().map(PlannedStep::is_rest).unwrap_or(false) {
        steps.pop();
    }
    steps
}

fn weight_set(id: &str, reps: u32, weight: f64, sub_category: SetSubCategory) -> Set {
    Set::Weight(WeightSet {
        id: id.into(),
        reps,
        weight,
        sub_category,
    })
}

fn rest_set(id: &str, seconds: u32) -> Set {
    Set::Rest(RestSet {
        id: id.into(),
        time_in_seconds: seconds,
        sub_category: SetSubCategory::WorkSet,
    })
}

/// Builds the default library with built-in equipment and workouts
pub fn build_default_library() -> PlanLibrary {
    let mut equipment = HashMap::new();
    let mut workouts = HashMap::new();

    // ========================================================================
    // Equipment
    // ========================================================================

    equipment.insert(
        "olympic_barbell".into(),
        Equipment::WeightLoaded(WeightLoadedEquipment {
            id: "olympic_barbell".into(),
            name: "Olympic barbell".into(),
            base_weight: 20.0,
            loading: Loading::Plates {
                plates: vec![
                    PlateStock { weight: 20.0, quantity: 6 },
                    PlateStock { weight: 15.0, quantity: 2 },
                    PlateStock { weight: 10.0, quantity: 4 },
                    PlateStock { weight: 5.0, quantity: 4 },
                    PlateStock { weight: 2.5, quantity: 4 },
                    PlateStock { weight: 1.25, quantity: 4 },
                ],
            },
        }),
    );

    equipment.insert(
        "cable_stack".into(),
        Equipment::WeightLoaded(WeightLoadedEquipment {
            id: "cable_stack".into(),
            name: "Cable stack".into(),
            base_weight: 5.0,
            loading: Loading::FixedIncrement {
                increment: 5.0,
                max_additional: 90.0,
            },
        }),
    );

    equipment.insert(
        "pullup_bar".into(),
        Equipment::Accessory(AccessoryEquipment {
            id: "pullup_bar".into(),
            name: "Pull-up bar".into(),
        }),
    );

    // ========================================================================
    // Workouts
    // ========================================================================

    // Full body: calibrated squat, pull superset, timed plank finisher
    workouts.insert(
        "full_body_a".into(),
        Workout {
            id: "full_body_a".into(),
            name: "Full Body A".into(),
            components: vec![
                WorkoutComponent::Exercise(Exercise {
                    id: "back_squat".into(),
                    name: "Back Squat".into(),
                    equipment_id: Some("olympic_barbell".into()),
                    sets: vec![
                        weight_set("squat_warmup", 8, 40.0, SetSubCategory::WarmupSet),
                        rest_set("squat_rest_1", 60),
                        weight_set("squat_calibration", 5, 80.0, SetSubCategory::CalibrationSet),
                        rest_set("squat_rest_2", 120),
                        weight_set("squat_work_1", 5, 80.0, SetSubCategory::WorkSet),
                        rest_set("squat_rest_3", 120),
                        weight_set("squat_work_2", 5, 80.0, SetSubCategory::WorkSet),
                    ],
                }),
                WorkoutComponent::Rest(Rest {
                    id: "transition_rest".into(),
                    time_in_seconds: 120,
                }),
                WorkoutComponent::Superset(Superset {
                    id: "pull_superset".into(),
                    rest_seconds: 90,
                    exercises: vec![
                        Exercise {
                            id: "pullup".into(),
                            name: "Pull-up".into(),
                            equipment_id: Some("pullup_bar".into()),
                            sets: (1..=3)
                                .map(|i| {
                                    Set::BodyWeight(BodyWeightSet {
                                        id: format!("pullup_{}", i),
                                        reps: 6,
                                        additional_weight: 0.0,
                                        sub_category: SetSubCategory::WorkSet,
                                    })
                                })
                                .collect(),
                        },
                        Exercise {
                            id: "cable_row".into(),
                            name: "Seated Cable Row".into(),
                            equipment_id: Some("cable_stack".into()),
                            sets: (1..=3)
                                .map(|i| {
                                    weight_set(&format!("row_{}", i), 10, 45.0, SetSubCategory::WorkSet)
                                })
                                .collect(),
                        },
                    ],
                }),
                WorkoutComponent::Exercise(Exercise {
                    id: "plank".into(),
                    name: "Plank".into(),
                    equipment_id: None,
                    sets: vec![
                        Set::TimedDuration(TimedDurationSet {
                            id: "plank_1".into(),
                            time_in_millis: 45_000,
                            auto_stop: true,
                            sub_category: SetSubCategory::WorkSet,
                        }),
                        rest_set("plank_rest", 60),
                        Set::Endurance(EnduranceSet {
                            id: "plank_max".into(),
                            time_in_millis: 120_000,
                            auto_stop: false,
                            sub_category: SetSubCategory::WorkSet,
                        }),
                    ],
                }),
            ],
        },
    );

    // Short press session without calibration
    workouts.insert(
        "press_quick".into(),
        Workout {
            id: "press_quick".into(),
            name: "Quick Press".into(),
            components: vec![WorkoutComponent::Exercise(Exercise {
                id: "bench_press".into(),
                name: "Bench Press".into(),
                equipment_id: Some("olympic_barbell".into()),
                sets: vec![
                    weight_set("bench_1", 5, 60.0, SetSubCategory::WorkSet),
                    rest_set("bench_rest_1", 90),
                    weight_set("bench_2", 5, 62.5, SetSubCategory::WorkSet),
                    rest_set("bench_rest_2", 90),
                    weight_set("bench_3", 5, 65.0, SetSubCategory::WorkSet),
                ],
            })],
        },
    );

    PlanLibrary {
        workouts,
        equipment,
    }
}
