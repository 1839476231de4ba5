//! Session state machine.
//!
//! Pure transitions over immutable state values: no I/O, no clocks of its
//! own (callers pass `now`). Every forward transition pushes the outgoing
//! state and the working data onto a back-stack by value, so undo restores
//! exactly what was there before.
//!
//! ```text
//! Preparing -> Set -> (Rest) -> Set -> ... -> Completed
//!                 \-> CalibrationLoadSelection -> Set(calibration)
//!                        -> CalibrationRirSelection -> next
//! ```

use crate::calibration::adjusted_working_load;
use crate::config::CalibrationConfig;
use crate::equipment::{calibration_candidates, nearest_achievable};
use crate::plan::{flatten, PlanLibrary, PlannedStep};
use crate::timer::ActivityTimer;
use crate::{
    CalibrationRating, Equipment, Error, Result, Set, SetData, SetSubCategory,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// States
// ============================================================================

/// Performing a work set
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SetState {
    /// Position in the flattened plan
    pub step: usize,
    pub exercise_id: String,
    pub set: Set,
    pub set_index: usize,
    pub current_set_data: SetData,
    /// Same set from the previous session, for comparison
    pub previous_set_data: Option<SetData>,
    pub start_time: Option<DateTime<Utc>>,
    pub is_calibration_set: bool,
    pub equipment: Option<Equipment>,
    pub timer: Option<ActivityTimer>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RestState {
    pub step: usize,
    pub exercise_id: Option<String>,
    pub set: Set,
    pub current_set_data: SetData,
    /// Exercise of the next work step, if any
    pub next_exercise_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub timer: ActivityTimer,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CalibrationLoadState {
    pub step: usize,
    pub exercise_id: String,
    pub calibration_set: Set,
    pub current_set_data: SetData,
    pub equipment: Option<Equipment>,
    pub candidate_loads: Vec<f64>,
    pub load_confirmed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CalibrationRirState {
    pub step: usize,
    pub exercise_id: String,
    pub calibration_set: Set,
    pub current_set_data: SetData,
    pub rating: Option<CalibrationRating>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkoutState {
    Preparing,
    Set(SetState),
    Rest(RestState),
    CalibrationLoadSelection(CalibrationLoadState),
    CalibrationRirSelection(CalibrationRirState),
    Completed,
}

impl WorkoutState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkoutState::Preparing => "preparing",
            WorkoutState::Set(_) => "set",
            WorkoutState::Rest(_) => "rest",
            WorkoutState::CalibrationLoadSelection(_) => "calibration_load_selection",
            WorkoutState::CalibrationRirSelection(_) => "calibration_rir_selection",
            WorkoutState::Completed => "completed",
        }
    }

    /// Plan position, for states tied to a step
    pub fn step(&self) -> Option<usize> {
        match self {
            WorkoutState::Set(s) => Some(s.step),
            WorkoutState::Rest(r) => Some(r.step),
            WorkoutState::CalibrationLoadSelection(c) => Some(c.step),
            WorkoutState::CalibrationRirSelection(c) => Some(c.step),
            WorkoutState::Preparing | WorkoutState::Completed => None,
        }
    }

    /// The set template this state is about
    pub fn set(&self) -> Option<&Set> {
        match self {
            WorkoutState::Set(s) => Some(&s.set),
            WorkoutState::Rest(r) => Some(&r.set),
            WorkoutState::CalibrationLoadSelection(c) => Some(&c.calibration_set),
            WorkoutState::CalibrationRirSelection(c) => Some(&c.calibration_set),
            WorkoutState::Preparing | WorkoutState::Completed => None,
        }
    }

    pub fn current_set_data(&self) -> Option<&SetData> {
        match self {
            WorkoutState::Set(s) => Some(&s.current_set_data),
            WorkoutState::Rest(r) => Some(&r.current_set_data),
            WorkoutState::CalibrationLoadSelection(c) => Some(&c.current_set_data),
            WorkoutState::CalibrationRirSelection(c) => Some(&c.current_set_data),
            WorkoutState::Preparing | WorkoutState::Completed => None,
        }
    }

    pub fn timer(&self) -> Option<&ActivityTimer> {
        match self {
            WorkoutState::Set(s) => s.timer.as_ref(),
            WorkoutState::Rest(r) => Some(&r.timer),
            _ => None,
        }
    }

    pub fn timer_mut(&mut self) -> Option<&mut ActivityTimer> {
        match self {
            WorkoutState::Set(s) => s.timer.as_mut(),
            WorkoutState::Rest(r) => Some(&mut r.timer),
            _ => None,
        }
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, WorkoutState::Rest(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, WorkoutState::Completed)
    }

    /// Part of the load-calibration sub-flow
    pub fn is_calibration_flow(&self) -> bool {
        match self {
            WorkoutState::CalibrationLoadSelection(_) | WorkoutState::CalibrationRirSelection(_) => {
                true
            }
            WorkoutState::Set(s) => s.is_calibration_set,
            _ => false,
        }
    }
}

impl SetState {
    /// A rest set must never reach the work path
    pub fn ensure_work_set(&self) -> Result<()> {
        match self.set {
            Set::Rest(_) => Err(Error::consistency(format!(
                "rest set '{}' reached a work state",
                self.set.id()
            ))),
            Set::Weight(_) | Set::BodyWeight(_) | Set::Endurance(_) | Set::TimedDuration(_) => {
                Ok(())
            }
        }
    }
}

// ============================================================================
// Plan and snapshot
// ============================================================================

/// Resolved, immutable input to a session
#[derive(Clone, Debug)]
pub struct SessionPlan {
    pub workout_id: String,
    pub steps: Vec<PlannedStep>,
    pub equipment: HashMap<String, Equipment>,
}

impl SessionPlan {
    pub fn resolve(library: &PlanLibrary, workout_id: &str) -> Result<Self> {
        let workout = library.workout(workout_id)?;
        let steps = flatten(workout);

        let mut equipment = HashMap::new();
        for step in &steps {
            if let PlannedStep::Set {
                equipment_id: Some(id),
                ..
            } = step
            {
                equipment.insert(id.clone(), library.equipment(id)?.clone());
            }
        }

        Ok(Self {
            workout_id: workout_id.to_string(),
            steps,
            equipment,
        })
    }
}

/// Everything the machine needs to be rebuilt after a restart
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MachineSnapshot {
    pub current: WorkoutState,
    pub back_stack: Vec<Frame>,
    /// Latest data per set id: commits, edits and calibration results
    pub working: BTreeMap<String, SetData>,
}

/// A back-stack entry: the state left behind and the working data as it
/// was when that state was current
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub state: WorkoutState,
    pub working: BTreeMap<String, SetData>,
}

/// A set handed to history by a forward transition
#[derive(Clone, Debug, PartialEq)]
pub struct CommittedSet {
    pub exercise_id: Option<String>,
    pub set_id: String,
    pub set_index: usize,
    pub data: SetData,
}

#[derive(Clone, Debug)]
pub struct MachineSettings {
    pub calibration: CalibrationConfig,
    pub body_weight: f64,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            calibration: CalibrationConfig::default(),
            body_weight: 75.0,
        }
    }
}

// ============================================================================
// Machine
// ============================================================================

#[derive(Clone, Debug)]
pub struct StateMachine {
    plan: SessionPlan,
    settings: MachineSettings,
    previous: HashMap<String, SetData>,
    current: WorkoutState,
    back_stack: Vec<Frame>,
    working: BTreeMap<String, SetData>,
}

impl StateMachine {
    pub fn new(
        plan: SessionPlan,
        settings: MachineSettings,
        previous: HashMap<String, SetData>,
    ) -> Self {
        Self {
            plan,
            settings,
            previous,
            current: WorkoutState::Preparing,
            back_stack: Vec::new(),
            working: BTreeMap::new(),
        }
    }

    /// Rebuild from a snapshot, rejecting one that does not fit the plan
    pub fn restore(
        plan: SessionPlan,
        settings: MachineSettings,
        previous: HashMap<String, SetData>,
        snapshot: MachineSnapshot,
    ) -> Result<Self> {
        let frames = snapshot.back_stack.iter().map(|f| &f.state);
        for state in frames.chain(std::iter::once(&snapshot.current)) {
            if let (Some(step), Some(set)) = (state.step(), state.set()) {
                let planned = plan.steps.get(step).ok_or_else(|| {
                    Error::consistency(format!("snapshot step {} is outside the plan", step))
                })?;
                if planned.set().id() != set.id() {
                    return Err(Error::consistency(format!(
                        "snapshot step {} holds set '{}' but the plan has '{}'",
                        step,
                        set.id(),
                        planned.set().id()
                    )));
                }
            }
            if let WorkoutState::Set(s) = state {
                s.ensure_work_set()?;
            }
        }

        Ok(Self {
            plan,
            settings,
            previous,
            current: snapshot.current,
            back_stack: snapshot.back_stack,
            working: snapshot.working,
        })
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            current: self.current.clone(),
            back_stack: self.back_stack.clone(),
            working: self.working.clone(),
        }
    }

    pub fn current(&self) -> &WorkoutState {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut WorkoutState {
        &mut self.current
    }

    pub fn back_stack(&self) -> &[Frame] {
        &self.back_stack
    }

    pub fn plan(&self) -> &SessionPlan {
        &self.plan
    }

    pub fn working_data(&self, set_id: &str) -> Option<&SetData> {
        self.working.get(set_id)
    }

    /// Move forward one state, returning the set committed on the way out.
    ///
    /// `Completed` is terminal: advancing from it changes nothing.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<Option<CommittedSet>> {
        let working_before = self.working.clone();
        let (next, committed) = match self.step_forward(now) {
            Ok(Some(step)) => step,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.working = working_before;
                return Err(e);
            }
        };

        if let Some(c) = &committed {
            self.working.insert(c.set_id.clone(), c.data.clone());
        }

        tracing::debug!("Transition {} -> {}", self.current.name(), next.name());
        let previous = std::mem::replace(&mut self.current, next);
        self.back_stack.push(Frame {
            state: previous,
            working: working_before,
        });
        Ok(committed)
    }

    /// Next state and the set it commits; `None` once completed
    fn step_forward(&mut self, now: DateTime<Utc>) -> Result<Option<(WorkoutState, Option<CommittedSet>)>> {
        let step = match &self.current {
            WorkoutState::Completed => return Ok(None),
            WorkoutState::Preparing => (self.enter_step(0, now)?, None),
            WorkoutState::Set(state) => {
                state.ensure_work_set()?;
                let data = finalize(&state.current_set_data, state.timer.as_ref(), now);
                let committed = CommittedSet {
                    exercise_id: Some(state.exercise_id.clone()),
                    set_id: state.set.id().to_string(),
                    set_index: state.set_index,
                    data: data.clone(),
                };
                let next = if state.is_calibration_set {
                    WorkoutState::CalibrationRirSelection(CalibrationRirState {
                        step: state.step,
                        exercise_id: state.exercise_id.clone(),
                        calibration_set: state.set.clone(),
                        current_set_data: data,
                        rating: None,
                    })
                } else {
                    self.enter_step(state.step + 1, now)?
                };
                (next, Some(committed))
            }
            WorkoutState::Rest(state) => {
                let data = finalize(&state.current_set_data, Some(&state.timer), now);
                let committed = CommittedSet {
                    exercise_id: state.exercise_id.clone(),
                    set_id: state.set.id().to_string(),
                    set_index: self.set_index_of(state.step),
                    data,
                };
                (self.enter_step(state.step + 1, now)?, Some(committed))
            }
            WorkoutState::CalibrationLoadSelection(state) => {
                if !state.load_confirmed {
                    return Err(Error::consistency("calibration load has not been confirmed"));
                }
                let mut data = state.current_set_data.clone();
                data.recompute_volume();
                self.working
                    .insert(state.calibration_set.id().to_string(), data);
                (self.build_set_state(state.step, true, now)?, None)
            }
            WorkoutState::CalibrationRirSelection(state) => {
                let state = state.clone();
                let rating = state.rating.ok_or_else(|| {
                    Error::consistency("calibration RIR has not been confirmed")
                })?;
                let data = state.current_set_data.clone();
                let committed = CommittedSet {
                    exercise_id: Some(state.exercise_id.clone()),
                    set_id: state.calibration_set.id().to_string(),
                    set_index: self.set_index_of(state.step),
                    data: data.clone(),
                };
                if let SetData::Weight(weight_data) = &data {
                    self.apply_calibration(
                        state.step,
                        &state.exercise_id,
                        weight_data.actual_weight,
                        rating,
                    );
                }
                (self.enter_step(state.step + 1, now)?, Some(committed))
            }
        };

        Ok(Some(step))
    }

    /// Step back one state.
    ///
    /// From load selection the pop continues past rests to the previous
    /// non-rest state. Returns false (and changes nothing) when there is
    /// nowhere to go.
    pub fn undo(&mut self) -> bool {
        match self.current {
            WorkoutState::CalibrationLoadSelection(_) => self.pop_to(|s| !s.is_rest()),
            _ => match self.back_stack.pop() {
                Some(frame) => {
                    tracing::debug!("Undo {} -> {}", self.current.name(), frame.state.name());
                    self.current = frame.state;
                    self.working = frame.working;
                    true
                }
                None => false,
            },
        }
    }

    pub fn go_to_previous_set(&mut self) -> bool {
        self.pop_to(|s| matches!(s, WorkoutState::Set(_)))
    }

    pub fn go_to_previous_non_rest_state(&mut self) -> bool {
        self.pop_to(|s| !s.is_rest())
    }

    fn pop_to(&mut self, accept: impl Fn(&WorkoutState) -> bool) -> bool {
        let Some(idx) = self.back_stack.iter().rposition(|f| accept(&f.state)) else {
            return false;
        };
        self.back_stack.truncate(idx + 1);
        match self.back_stack.pop() {
            Some(frame) => {
                tracing::debug!("Back {} -> {}", self.current.name(), frame.state.name());
                self.current = frame.state;
                self.working = frame.working;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Operator input on the current state
    // ------------------------------------------------------------------------

    /// Replace the data of the current set (explicit operator edit)
    pub fn update_set_data(&mut self, mut data: SetData) -> Result<()> {
        match &mut self.current {
            WorkoutState::Set(state) => {
                state.ensure_work_set()?;
                if !data.matches(&state.set) {
                    return Err(Error::consistency(format!(
                        "data does not fit set '{}'",
                        state.set.id()
                    )));
                }
                data.recompute_volume();
                state.current_set_data = data;
                Ok(())
            }
            other => Err(Error::consistency(format!(
                "set data cannot be edited during {}",
                other.name()
            ))),
        }
    }

    /// Pick the calibration load; snapped to what the equipment can make
    pub fn select_calibration_load(&mut self, weight: f64) -> Result<f64> {
        match &mut self.current {
            WorkoutState::CalibrationLoadSelection(state) => {
                let load = state
                    .equipment
                    .as_ref()
                    .and_then(|eq| nearest_achievable(eq, weight))
                    .unwrap_or(weight);
                match &mut state.current_set_data {
                    SetData::Weight(d) => d.actual_weight = load,
                    _ => {
                        return Err(Error::consistency(format!(
                            "calibration set '{}' is not a weight set",
                            state.calibration_set.id()
                        )))
                    }
                }
                state.current_set_data.recompute_volume();
                state.load_confirmed = true;
                Ok(load)
            }
            other => Err(Error::consistency(format!(
                "no calibration load to select during {}",
                other.name()
            ))),
        }
    }

    /// Record effort for the calibration set
    pub fn confirm_rir(&mut self, rir: u8, explicit_breakdown: Option<bool>) -> Result<CalibrationRating> {
        let max_rir = self.settings.calibration.max_rir;
        let policy = self.settings.calibration.form_breakdown_policy;
        match &mut self.current {
            WorkoutState::CalibrationRirSelection(state) => {
                if rir > max_rir {
                    return Err(Error::consistency(format!(
                        "RIR {} exceeds the maximum of {}",
                        rir, max_rir
                    )));
                }
                let rating = CalibrationRating::from_rir(rir, explicit_breakdown, policy);
                if let SetData::Weight(d) = &mut state.current_set_data {
                    d.calibration = Some(rating);
                }
                state.rating = Some(rating);
                Ok(rating)
            }
            other => Err(Error::consistency(format!(
                "no RIR to confirm during {}",
                other.name()
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn enter_step(&self, step: usize, now: DateTime<Utc>) -> Result<WorkoutState> {
        let Some(planned) = self.plan.steps.get(step) else {
            return Ok(WorkoutState::Completed);
        };

        match planned {
            PlannedStep::Rest {
                exercise_id, set, ..
            } => {
                let data = SetData::initial_for(set, self.settings.body_weight);
                let timer = ActivityTimer::for_set(set, None, now).ok_or_else(|| {
                    Error::consistency(format!("rest step '{}' has no timer", set.id()))
                })?;
                let next_exercise_id = self.plan.steps[step + 1..]
                    .iter()
                    .find(|s| !s.is_rest())
                    .and_then(|s| s.exercise_id())
                    .map(str::to_string);
                Ok(WorkoutState::Rest(RestState {
                    step,
                    exercise_id: exercise_id.clone(),
                    set: set.clone(),
                    current_set_data: data,
                    next_exercise_id,
                    start_time: now,
                    timer,
                }))
            }
            PlannedStep::Set {
                exercise_id,
                set,
                equipment_id,
                ..
            } if set.is_calibration() => {
                let equipment = equipment_id
                    .as_ref()
                    .and_then(|id| self.plan.equipment.get(id))
                    .cloned();
                let data = self.data_for(set);
                let planned_weight = match (&data, set) {
                    (SetData::Weight(d), _) => d.actual_weight,
                    (_, Set::Weight(s)) => s.weight,
                    _ => 0.0,
                };
                let candidate_loads = calibration_candidates(
                    equipment.as_ref(),
                    planned_weight,
                    self.settings.calibration.candidate_count,
                );
                Ok(WorkoutState::CalibrationLoadSelection(CalibrationLoadState {
                    step,
                    exercise_id: exercise_id.clone(),
                    calibration_set: set.clone(),
                    current_set_data: data,
                    equipment,
                    candidate_loads,
                    load_confirmed: false,
                }))
            }
            PlannedStep::Set { .. } => self.build_set_state(step, false, now),
        }
    }

    fn build_set_state(&self, step: usize, is_calibration_set: bool, now: DateTime<Utc>) -> Result<WorkoutState> {
        let Some(PlannedStep::Set {
            exercise_id,
            set,
            set_index,
            equipment_id,
        }) = self.plan.steps.get(step)
        else {
            return Err(Error::consistency(format!("step {} is not a work set", step)));
        };

        let current_set_data = self.data_for(set);
        let timer = ActivityTimer::for_set(set, current_set_data.timer(), now);
        let state = SetState {
            step,
            exercise_id: exercise_id.clone(),
            set: set.clone(),
            set_index: *set_index,
            current_set_data,
            previous_set_data: self.previous.get(set.id()).cloned(),
            start_time: Some(now),
            is_calibration_set,
            equipment: equipment_id
                .as_ref()
                .and_then(|id| self.plan.equipment.get(id))
                .cloned(),
            timer,
        };
        state.ensure_work_set()?;
        Ok(WorkoutState::Set(state))
    }

    /// Data a freshly entered set starts from. Timed sets always start
    /// from zero; other sets keep edits and calibration results.
    fn data_for(&self, set: &Set) -> SetData {
        self.working
            .get(set.id())
            .filter(|d| d.matches(set) && d.timer().is_none())
            .cloned()
            .unwrap_or_else(|| SetData::initial_for(set, self.settings.body_weight))
    }

    fn set_index_of(&self, step: usize) -> usize {
        match self.plan.steps.get(step) {
            Some(PlannedStep::Set { set_index, .. }) | Some(PlannedStep::Rest { set_index, .. }) => {
                *set_index
            }
            None => step,
        }
    }

    /// Re-load the remaining work sets of the exercise from the calibration
    fn apply_calibration(&mut self, step: usize, exercise_id: &str, load: f64, rating: CalibrationRating) {
        let equipment = self.plan.steps.get(step).and_then(|s| match s {
            PlannedStep::Set {
                equipment_id: Some(id),
                ..
            } => self.plan.equipment.get(id),
            _ => None,
        });
        let working_load =
            adjusted_working_load(load, rating, &self.settings.calibration, equipment);

        let mut updated = 0;
        for planned in &self.plan.steps[step + 1..] {
            if let PlannedStep::Set {
                exercise_id: ex,
                set: set @ Set::Weight(template),
                ..
            } = planned
            {
                if ex != exercise_id || template.sub_category != SetSubCategory::WorkSet {
                    continue;
                }
                let mut data = self
                    .working
                    .get(set.id())
                    .filter(|d| d.matches(set))
                    .cloned()
                    .unwrap_or_else(|| SetData::initial_for(set, self.settings.body_weight));
                if let SetData::Weight(d) = &mut data {
                    d.actual_weight = working_load;
                }
                data.recompute_volume();
                self.working.insert(set.id().to_string(), data);
                updated += 1;
            }
        }
        tracing::info!(
            "Applied calibrated load {} kg to {} remaining sets of '{}'",
            working_load,
            updated,
            exercise_id
        );
    }
}

/// Copy the live timer into the data and refresh volume before a commit
fn finalize(data: &SetData, timer: Option<&ActivityTimer>, now: DateTime<Utc>) -> SetData {
    let mut data = data.clone();
    if let (Some(timer), Some(timer_data)) = (timer, data.timer_mut()) {
        timer.write_into(timer_data, now);
    }
    data.recompute_volume();
    data
}
