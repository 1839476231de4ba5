//! Live workout session.
//!
//! `WorkoutSession` is the single owner of a running workout. It wraps the
//! pure [`StateMachine`] with the side effects every transition needs:
//! history commits, checkpoints, edit-mode bookkeeping, the timer task and
//! the observable state channel.

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, MAX_EDIT_IDLE_TIMEOUT_SECONDS};
use crate::history::SetHistorySink;
use crate::machine::{
    CommittedSet, MachineSettings, SessionPlan, StateMachine, WorkoutState,
};
use crate::plan::PlanLibrary;
use crate::plates::{apply_steps, compute_plate_change};
use crate::recovery::{reconcile, InterruptedWorkout, RecoveryCheckpoint, RecoveryManager, ResumeChoice};
use crate::timer::{Clock, TimerEvent, TimerTask};
use crate::{
    CalibrationRating, Equipment, Error, Loading, PlateChangeResult, Result, SetData, SetRecord,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Collaborators a session talks to
pub struct SessionServices {
    pub clock: Arc<dyn Clock>,
    pub history: Box<dyn SetHistorySink + Send>,
    pub recovery: RecoveryManager,
}

impl SessionServices {
    pub fn new(
        clock: Arc<dyn Clock>,
        history: Box<dyn SetHistorySink + Send>,
        checkpoints: Box<dyn CheckpointStore + Send>,
        config: &Config,
    ) -> Self {
        Self {
            clock,
            history,
            recovery: RecoveryManager::new(checkpoints, &config.recovery),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditKind {
    SetData,
    Timer,
}

#[derive(Clone, Copy, Debug)]
struct EditMode {
    kind: EditKind,
    last_interaction: DateTime<Utc>,
    /// Timer was running when timer edit began
    resume_after: bool,
}

pub struct WorkoutSession {
    workout_history_id: Uuid,
    workout_id: String,
    started_at: DateTime<Utc>,
    machine: StateMachine,
    clock: Arc<dyn Clock>,
    history: Box<dyn SetHistorySink + Send>,
    recovery: RecoveryManager,
    tick_interval: std::time::Duration,
    edit_idle_timeout: Duration,
    edit: Option<EditMode>,
    timer_task: Option<TimerTask>,
    state_tx: watch::Sender<WorkoutState>,
    loaded_plates: BTreeMap<String, Vec<f64>>,
}

fn settings_from(config: &Config) -> MachineSettings {
    MachineSettings {
        calibration: config.calibration.clone(),
        body_weight: config.session.body_weight,
    }
}

impl WorkoutSession {
    /// New session in `Preparing`; nothing is persisted until the first
    /// transition.
    pub fn start(
        library: &PlanLibrary,
        workout_id: &str,
        config: &Config,
        previous: HashMap<String, SetData>,
        services: SessionServices,
    ) -> Result<Self> {
        let plan = SessionPlan::resolve(library, workout_id)?;
        let machine = StateMachine::new(plan, settings_from(config), previous);
        let started_at = services.clock.now();
        let session = Self::assemble(Uuid::new_v4(), started_at, machine, config, services, BTreeMap::new());

        tracing::info!(
            "Started session {} of '{}'",
            session.workout_history_id,
            workout_id
        );
        Ok(session)
    }

    /// Rebuild an interrupted session according to the operator's choice
    pub fn resume_from(
        library: &PlanLibrary,
        interrupted: InterruptedWorkout,
        choice: ResumeChoice,
        config: &Config,
        previous: HashMap<String, SetData>,
        mut services: SessionServices,
    ) -> Result<Self> {
        let now = services.clock.now();
        let reconciled = reconcile(&interrupted, choice, now);

        let plan = SessionPlan::resolve(library, &interrupted.workout_id)?;
        let machine = StateMachine::restore(plan, settings_from(config), previous, reconciled.snapshot)?;
        services.recovery.resume_sequence(interrupted.sequence);

        let mut session = Self::assemble(
            interrupted.workout_history_id,
            interrupted.start_time,
            machine,
            config,
            services,
            interrupted.loaded_plates,
        );

        if reconciled.natural_completion {
            session.complete_timer(now)?;
        } else {
            session.after_mutation(now);
        }

        tracing::info!(
            "Resumed session {} at {}",
            session.workout_history_id,
            session.current().name()
        );
        Ok(session)
    }

    fn assemble(
        workout_history_id: Uuid,
        started_at: DateTime<Utc>,
        machine: StateMachine,
        config: &Config,
        services: SessionServices,
        loaded_plates: BTreeMap<String, Vec<f64>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(machine.current().clone());
        Self {
            workout_history_id,
            workout_id: machine.plan().workout_id.clone(),
            started_at,
            machine,
            clock: services.clock,
            history: services.history,
            recovery: services.recovery,
            tick_interval: config.tick_interval(),
            edit_idle_timeout: Duration::seconds(
                config.session.edit_idle_timeout_seconds.min(MAX_EDIT_IDLE_TIMEOUT_SECONDS) as i64,
            ),
            edit: None,
            timer_task: None,
            state_tx,
            loaded_plates,
        }
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn workout_history_id(&self) -> Uuid {
        self.workout_history_id
    }

    pub fn workout_id(&self) -> &str {
        &self.workout_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn current(&self) -> &WorkoutState {
        self.machine.current()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn is_completed(&self) -> bool {
        self.machine.current().is_completed()
    }

    pub fn edit_mode(&self) -> Option<EditKind> {
        self.edit.map(|e| e.kind)
    }

    pub fn loaded_plates(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.loaded_plates
    }

    /// Receiver that sees every published state
    pub fn subscribe(&self) -> watch::Receiver<WorkoutState> {
        self.state_tx.subscribe()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------------

    pub fn advance(&mut self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }
        let now = self.clock.now();
        let committed = self.machine.advance(now)?;

        self.stop_timer_task();
        self.edit = None;
        if let Some(committed) = committed {
            self.commit(committed, now);
        }
        self.after_mutation(now);
        Ok(())
    }

    /// End the current rest early
    pub fn skip_rest(&mut self) -> Result<()> {
        if !self.current().is_rest() {
            return Err(Error::consistency(format!(
                "no rest to skip during {}",
                self.current().name()
            )));
        }
        tracing::debug!("Rest skipped");
        self.advance()
    }

    pub fn undo(&mut self) -> bool {
        self.navigate(StateMachine::undo)
    }

    pub fn go_to_previous_set(&mut self) -> bool {
        self.navigate(StateMachine::go_to_previous_set)
    }

    pub fn go_to_previous_non_rest_state(&mut self) -> bool {
        self.navigate(StateMachine::go_to_previous_non_rest_state)
    }

    /// Returning to a timed state starts its timer over
    fn navigate(&mut self, step: fn(&mut StateMachine) -> bool) -> bool {
        if !step(&mut self.machine) {
            return false;
        }
        let now = self.clock.now();
        self.stop_timer_task();
        self.edit = None;
        if let Some(timer) = self.machine.current_mut().timer_mut() {
            timer.restart(now);
        }
        self.after_mutation(now);
        true
    }

    // ------------------------------------------------------------------------
    // Operator input
    // ------------------------------------------------------------------------

    pub fn update_set_data(&mut self, data: SetData) -> Result<()> {
        self.machine.update_set_data(data)?;
        let now = self.clock.now();
        self.touch_edit(EditKind::SetData, now);
        self.after_mutation(now);
        Ok(())
    }

    pub fn select_calibration_load(&mut self, weight: f64) -> Result<f64> {
        let load = self.machine.select_calibration_load(weight)?;
        self.after_mutation(self.clock.now());
        Ok(load)
    }

    pub fn confirm_rir(&mut self, rir: u8, explicit_breakdown: Option<bool>) -> Result<CalibrationRating> {
        let rating = self.machine.confirm_rir(rir, explicit_breakdown)?;
        self.after_mutation(self.clock.now());
        Ok(rating)
    }

    pub fn enter_set_edit(&mut self) -> Result<()> {
        if !matches!(self.current(), WorkoutState::Set(_)) {
            return Err(Error::consistency(format!(
                "nothing to edit during {}",
                self.current().name()
            )));
        }
        self.edit = Some(EditMode {
            kind: EditKind::SetData,
            last_interaction: self.clock.now(),
            resume_after: false,
        });
        Ok(())
    }

    pub fn exit_set_edit(&mut self) {
        if matches!(self.edit, Some(EditMode { kind: EditKind::SetData, .. })) {
            self.edit = None;
        }
    }

    // ------------------------------------------------------------------------
    // Timer control
    // ------------------------------------------------------------------------

    pub fn pause_timer(&mut self) -> Result<()> {
        let now = self.clock.now();
        self.require_timer()?.freeze(now);
        self.stop_timer_task();
        self.after_mutation(now);
        Ok(())
    }

    /// Unpause; the caller restarts the tick task
    pub fn resume_timer(&mut self) -> Result<()> {
        if self.edit_mode() == Some(EditKind::Timer) {
            return Err(Error::consistency("timer is being edited"));
        }
        let now = self.clock.now();
        self.require_timer()?.resume(now);
        self.after_mutation(now);
        Ok(())
    }

    pub fn enter_timer_edit(&mut self) -> Result<()> {
        let now = self.clock.now();
        let timer = self.require_timer()?;
        let resume_after = !timer.is_frozen();
        timer.freeze(now);
        self.stop_timer_task();
        self.edit = Some(EditMode {
            kind: EditKind::Timer,
            last_interaction: now,
            resume_after,
        });
        self.after_mutation(now);
        Ok(())
    }

    /// Set progress while in timer edit (elapsed for count-up, remaining
    /// for count-down timers)
    pub fn edit_timer(&mut self, progress_millis: i64) -> Result<()> {
        if self.edit_mode() != Some(EditKind::Timer) {
            return Err(Error::consistency("timer edit mode is not active"));
        }
        let now = self.clock.now();
        self.require_timer()?.set_progress(progress_millis);
        self.touch_edit(EditKind::Timer, now);
        self.after_mutation(now);
        Ok(())
    }

    pub fn exit_timer_edit(&mut self) -> Result<()> {
        let Some(edit) = self.edit.filter(|e| e.kind == EditKind::Timer) else {
            return Ok(());
        };
        self.edit = None;
        let now = self.clock.now();
        if edit.resume_after {
            self.require_timer()?.resume(now);
        }
        self.after_mutation(now);
        Ok(())
    }

    fn require_timer(&mut self) -> Result<&mut crate::timer::ActivityTimer> {
        let name = self.machine.current().name();
        self.machine
            .current_mut()
            .timer_mut()
            .ok_or_else(|| Error::consistency(format!("no timer during {}", name)))
    }

    fn touch_edit(&mut self, kind: EditKind, now: DateTime<Utc>) {
        if let Some(edit) = self.edit.as_mut().filter(|e| e.kind == kind) {
            edit.last_interaction = now;
        }
    }

    /// Periodic housekeeping: closes idle edit modes and runs the timer's
    /// completion path. Returns true when the state changed.
    pub fn tick(&mut self) -> Result<bool> {
        let now = self.clock.now();
        let mut changed = false;

        if let Some(edit) = self.edit {
            if now - edit.last_interaction >= self.edit_idle_timeout {
                tracing::debug!("Closing idle {:?} edit", edit.kind);
                match edit.kind {
                    EditKind::Timer => self.exit_timer_edit()?,
                    EditKind::SetData => self.exit_set_edit(),
                }
                changed = true;
            }
        }

        let reached_bound = self
            .current()
            .timer()
            .map(|t| !t.is_frozen() && t.is_complete(now))
            .unwrap_or(false);
        if reached_bound {
            self.complete_timer(now)?;
            changed = true;
        }
        Ok(changed)
    }

    /// Natural end of the running timer: rests and auto-stop sets move on,
    /// anything else parks at its bound for the operator to confirm.
    fn complete_timer(&mut self, now: DateTime<Utc>) -> Result<()> {
        let auto_advance = match self.current() {
            WorkoutState::Rest(_) => true,
            WorkoutState::Set(s) => s.set.auto_stops(),
            _ => false,
        };
        if auto_advance {
            tracing::debug!("Timer complete, advancing");
            return self.advance();
        }

        if let Some(timer) = self.machine.current_mut().timer_mut() {
            timer.complete();
        }
        self.stop_timer_task();
        self.after_mutation(now);
        Ok(())
    }

    /// Spawn the tick task for the current timer, replacing any previous one.
    ///
    /// Returns false when there is no running timer to drive.
    pub fn start_timer_task(&mut self, events: mpsc::UnboundedSender<TimerEvent>) -> bool {
        self.stop_timer_task();
        let now = self.clock.now();
        let Some(timer) = self
            .current()
            .timer()
            .filter(|t| !t.is_frozen() && !t.is_complete(now))
            .copied()
        else {
            return false;
        };
        self.timer_task = Some(TimerTask::spawn(
            timer,
            Arc::clone(&self.clock),
            self.tick_interval,
            events,
        ));
        true
    }

    pub fn has_timer_task(&self) -> bool {
        self.timer_task
            .as_ref()
            .map(|t| !t.is_cancelled() && !t.is_finished())
            .unwrap_or(false)
    }

    fn stop_timer_task(&mut self) {
        if let Some(task) = self.timer_task.take() {
            task.cancel();
        }
    }

    // ------------------------------------------------------------------------
    // Plates
    // ------------------------------------------------------------------------

    /// Plate change needed for the current weight set, if it uses plates
    pub fn plate_change(&self) -> Option<PlateChangeResult> {
        let (equipment, target) = self.plate_target()?;
        let current = self
            .loaded_plates
            .get(equipment.id())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Some(compute_plate_change(equipment, current, target))
    }

    /// Record that the operator performed the steps of `change`
    pub fn confirm_plates_loaded(&mut self, change: &PlateChangeResult) -> Result<()> {
        let Some((equipment, _)) = self.plate_target() else {
            return Err(Error::consistency("current state has no plate-loaded equipment"));
        };
        let equipment_id = equipment.id().to_string();
        let current = self.loaded_plates.get(&equipment_id).cloned().unwrap_or_default();
        let loaded = apply_steps(&current, &change.steps)?;

        tracing::info!(
            "Loaded {:?} per side on '{}' ({} kg)",
            loaded,
            equipment_id,
            change.achieved_weight
        );
        self.loaded_plates.insert(equipment_id, loaded);
        self.after_mutation(self.clock.now());
        Ok(())
    }

    fn plate_target(&self) -> Option<(&Equipment, f64)> {
        let (equipment, data) = match self.current() {
            WorkoutState::Set(s) => (s.equipment.as_ref()?, &s.current_set_data),
            WorkoutState::CalibrationLoadSelection(c) => (c.equipment.as_ref()?, &c.current_set_data),
            _ => return None,
        };
        let plate_loaded = matches!(
            equipment,
            Equipment::WeightLoaded(eq) if matches!(eq.loading, Loading::Plates { .. })
        );
        match data {
            SetData::Weight(d) if plate_loaded => Some((equipment, d.actual_weight)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Throw the session away, checkpoint included
    pub fn discard(mut self) -> Result<()> {
        self.stop_timer_task();
        self.recovery.discard(self.workout_history_id)
    }

    fn commit(&mut self, committed: CommittedSet, now: DateTime<Utc>) {
        let record = SetRecord {
            workout_history_id: self.workout_history_id,
            workout_id: self.workout_id.clone(),
            exercise_id: committed.exercise_id.unwrap_or_default(),
            set_id: committed.set_id,
            set_index: committed.set_index,
            data: committed.data,
            recorded_at: now,
        };
        if let Err(e) = self.history.append(&record) {
            tracing::warn!("Failed to record set {}: {}", record.set_id, e);
        }
    }

    /// Persist and publish after any change to the machine
    fn after_mutation(&mut self, now: DateTime<Utc>) {
        if self.is_completed() {
            if let Err(e) = self.recovery.complete(self.workout_history_id) {
                tracing::warn!("Failed to clear checkpoint: {}", e);
            }
            tracing::info!("Session {} completed", self.workout_history_id);
        } else {
            self.recovery.checkpoint(
                RecoveryCheckpoint {
                    workout_history_id: self.workout_history_id,
                    workout_id: self.workout_id.clone(),
                    sequence: 0,
                    snapshot: self.machine.snapshot(),
                    loaded_plates: self.loaded_plates.clone(),
                    start_time: self.started_at,
                    last_persisted_at: now,
                },
                now,
            );
        }
        self.state_tx.send_replace(self.machine.current().clone());
    }
}

impl Drop for WorkoutSession {
    fn drop(&mut self) {
        self.stop_timer_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::history::MemoryHistory;
    use crate::plan::{build_default_library, PlanFile};
    use crate::recovery::ChoiceMode;
    use crate::timer::ManualClock;
    use crate::{
        EnduranceSet, Exercise, PlateAction, PlateStep, Set, SetSubCategory, Workout,
        WorkoutComponent,
    };
    use chrono::TimeZone;

    struct Harness {
        clock: ManualClock,
        history: MemoryHistory,
        checkpoints: MemoryCheckpointStore,
        config: Config,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                clock: ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 3, 17, 0, 0).unwrap()),
                history: MemoryHistory::new(),
                checkpoints: MemoryCheckpointStore::new(),
                config: Config::default(),
            }
        }

        fn services(&self) -> SessionServices {
            SessionServices::new(
                Arc::new(self.clock.clone()),
                Box::new(self.history.clone()),
                Box::new(self.checkpoints.clone()),
                &self.config,
            )
        }

        fn start(&self, library: &PlanLibrary, workout_id: &str) -> WorkoutSession {
            WorkoutSession::start(library, workout_id, &self.config, HashMap::new(), self.services())
                .unwrap()
        }

        fn secs(&self, s: i64) {
            self.clock.advance(Duration::seconds(s));
        }
    }

    fn current_set_id(session: &WorkoutSession) -> Option<String> {
        session.current().set().map(|s| s.id().to_string())
    }

    fn endurance_library(auto_stop: bool) -> PlanLibrary {
        PlanLibrary::from_file(PlanFile {
            equipment: vec![],
            workouts: vec![Workout {
                id: "hold".into(),
                name: "Hold".into(),
                components: vec![WorkoutComponent::Exercise(Exercise {
                    id: "dead_hang".into(),
                    name: "Dead Hang".into(),
                    equipment_id: None,
                    sets: vec![Set::Endurance(EnduranceSet {
                        id: "hang_1".into(),
                        time_in_millis: 30_000,
                        auto_stop,
                        sub_category: SetSubCategory::WorkSet,
                    })],
                })],
            }],
        })
    }

    #[test]
    fn test_full_session_commits_and_clears_checkpoint() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");

        // Nothing persisted before the first transition
        assert!(h.checkpoints.list().unwrap().is_empty());

        session.advance().unwrap();
        assert_eq!(h.checkpoints.list().unwrap(), vec![session.workout_history_id()]);

        while !session.is_completed() {
            h.secs(30);
            session.advance().unwrap();
        }

        let records = h.history.records();
        let ids: Vec<&str> = records.iter().map(|r| r.set_id.as_str()).collect();
        assert_eq!(ids, vec!["bench_1", "bench_rest_1", "bench_2", "bench_rest_2", "bench_3"]);
        assert!(records.iter().all(|r| r.workout_history_id == session.workout_history_id()));
        assert!(h.checkpoints.list().unwrap().is_empty());

        // Terminal
        session.advance().unwrap();
        assert_eq!(h.history.records().len(), 5);
    }

    #[test]
    fn test_rir_zero_records_form_breakdown() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "full_body_a");

        session.advance().unwrap(); // warmup
        session.advance().unwrap(); // rest
        session.advance().unwrap(); // load selection
        assert_eq!(session.select_calibration_load(90.0).unwrap(), 90.0);
        session.advance().unwrap(); // calibration set
        session.advance().unwrap(); // rir selection

        let rating = session.confirm_rir(0, None).unwrap();
        assert!(rating.form_breakdown);
        session.advance().unwrap();

        let record = h
            .history
            .records()
            .into_iter()
            .rev()
            .find(|r| r.set_id == "squat_calibration")
            .unwrap();
        assert_eq!(
            record.data.calibration(),
            Some(CalibrationRating {
                rir: 0,
                form_breakdown: true,
            })
        );
        assert_eq!(record.exercise_id, "back_squat");
    }

    #[test]
    fn test_rest_completes_on_tick() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();
        assert!(session.current().is_rest());

        h.secs(60);
        assert!(!session.tick().unwrap());
        assert!(session.current().is_rest());

        h.secs(31);
        assert!(session.tick().unwrap());
        assert_eq!(current_set_id(&session).as_deref(), Some("bench_2"));
    }

    #[test]
    fn test_skip_rest_only_in_rest() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();

        assert!(session.skip_rest().unwrap_err().is_consistency());
        session.advance().unwrap();
        session.skip_rest().unwrap();
        assert_eq!(current_set_id(&session).as_deref(), Some("bench_2"));
    }

    #[test]
    fn test_endurance_without_auto_stop_parks_at_bound() {
        let h = Harness::new();
        let library = endurance_library(false);
        let mut session = h.start(&library, "hold");
        session.advance().unwrap();

        h.secs(45);
        assert!(session.tick().unwrap());
        let timer = session.current().timer().unwrap();
        assert!(timer.is_frozen());
        assert_eq!(timer.progress(session.now()), 30_000);
        assert!(!session.is_completed());

        session.advance().unwrap();
        match &h.history.records()[0].data {
            SetData::Endurance(t) => assert_eq!(t.end_timer, 30_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_auto_stop_set_advances() {
        let h = Harness::new();
        let library = endurance_library(true);
        let mut session = h.start(&library, "hold");
        session.advance().unwrap();

        h.secs(31);
        session.tick().unwrap();
        assert!(session.is_completed());
    }

    #[test]
    fn test_undone_auto_stop_set_runs_again() {
        let h = Harness::new();
        let library = endurance_library(true);
        let mut session = h.start(&library, "hold");
        session.advance().unwrap();
        h.secs(31);
        session.tick().unwrap();
        assert!(session.is_completed());

        assert!(session.undo());
        assert!(session.undo());
        assert_eq!(session.current(), &WorkoutState::Preparing);
        session.advance().unwrap();

        h.secs(1);
        session.tick().unwrap();
        assert!(!session.is_completed());
        let timer = session.current().timer().unwrap();
        assert_eq!(timer.elapsed(session.now()), 1_000);
    }

    #[test]
    fn test_unvalidated_idle_timeout_is_clamped() {
        let mut h = Harness::new();
        h.config.session.edit_idle_timeout_seconds = u64::MAX;
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();

        session.enter_timer_edit().unwrap();
        h.secs(3600);
        session.tick().unwrap();
        assert_eq!(session.edit_mode(), Some(EditKind::Timer));

        h.secs(86_400);
        session.tick().unwrap();
        assert_eq!(session.edit_mode(), None);
    }

    #[test]
    fn test_pause_and_resume_timer() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();

        h.secs(10);
        session.pause_timer().unwrap();
        h.secs(300);
        assert!(!session.tick().unwrap());
        session.resume_timer().unwrap();

        let timer = session.current().timer().unwrap();
        assert_eq!(timer.elapsed(session.now()), 10_000);
    }

    #[test]
    fn test_timer_controls_need_a_timer() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();

        assert!(session.pause_timer().unwrap_err().is_consistency());
        assert!(session.enter_timer_edit().unwrap_err().is_consistency());
        assert!(session.edit_timer(5).unwrap_err().is_consistency());
    }

    #[test]
    fn test_timer_edit_round_trip() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();

        h.secs(5);
        session.enter_timer_edit().unwrap();
        assert_eq!(session.edit_mode(), Some(EditKind::Timer));
        session.edit_timer(30_000).unwrap();
        h.secs(2);
        session.exit_timer_edit().unwrap();
        assert_eq!(session.edit_mode(), None);

        // 30s remaining of 90s, running again
        h.secs(3);
        let timer = session.current().timer().unwrap();
        assert!(!timer.is_frozen());
        assert_eq!(timer.progress(session.now()), 27_000);
    }

    #[test]
    fn test_idle_edit_closes_on_tick() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();

        session.enter_timer_edit().unwrap();
        h.secs(5);
        session.tick().unwrap();
        assert_eq!(session.edit_mode(), Some(EditKind::Timer));

        h.secs(5);
        assert!(session.tick().unwrap());
        assert_eq!(session.edit_mode(), None);
        assert!(!session.current().timer().unwrap().is_frozen());
    }

    #[test]
    fn test_set_edit_closes_on_advance() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();

        session.enter_set_edit().unwrap();
        let mut data = session.current().current_set_data().unwrap().clone();
        if let SetData::Weight(d) = &mut data {
            d.actual_reps = 4;
        }
        session.update_set_data(data).unwrap();
        session.advance().unwrap();

        assert_eq!(session.edit_mode(), None);
        match &h.history.records()[0].data {
            SetData::Weight(d) => assert_eq!(d.actual_reps, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_undo_restarts_timer_and_checkpoints() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();
        h.secs(100);
        session.advance().unwrap(); // bench_2

        assert!(session.undo());
        let timer = session.current().timer().unwrap();
        assert_eq!(timer.elapsed(session.now()), 0);

        let stored = h
            .checkpoints
            .load(session.workout_history_id())
            .unwrap()
            .unwrap();
        assert!(stored.snapshot.current.is_rest());

        assert!(session.go_to_previous_set());
        assert_eq!(current_set_id(&session).as_deref(), Some("bench_1"));
        assert!(session.go_to_previous_non_rest_state());
        assert!(!session.go_to_previous_non_rest_state());
    }

    #[test]
    fn test_state_is_observable() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        let mut rx = session.subscribe();
        assert_eq!(*rx.borrow_and_update(), WorkoutState::Preparing);

        session.advance().unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(matches!(*rx.borrow_and_update(), WorkoutState::Set(_)));
    }

    #[test]
    fn test_plate_change_follows_loaded_plates() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();

        let change = session.plate_change().unwrap();
        assert_eq!(change.steps, vec![PlateStep { action: PlateAction::Add, weight: 20.0 }]);
        session.confirm_plates_loaded(&change).unwrap();
        assert_eq!(session.loaded_plates().get("olympic_barbell"), Some(&vec![20.0]));

        session.advance().unwrap();
        assert!(session.plate_change().is_none());
        session.advance().unwrap();

        let change = session.plate_change().unwrap();
        assert_eq!(change.steps, vec![PlateStep { action: PlateAction::Add, weight: 1.25 }]);
        assert_eq!(change.achieved_weight, 62.5);
    }

    #[test]
    fn test_resume_after_crash_completes_elapsed_rest() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        let id = session.workout_history_id();
        session.advance().unwrap();
        session.advance().unwrap();
        drop(session);

        h.secs(600);
        let mut services = h.services();
        let interrupted = services
            .recovery
            .load_pending(&library, h.clock.now())
            .unwrap();
        assert_eq!(interrupted.workout_history_id, id);

        let session = WorkoutSession::resume_from(
            &library,
            interrupted,
            ResumeChoice::default(),
            &h.config,
            HashMap::new(),
            services,
        )
        .unwrap();

        assert_eq!(session.workout_history_id(), id);
        assert_eq!(current_set_id(&session).as_deref(), Some("bench_2"));
        let last = h.history.records().pop().unwrap();
        assert_eq!(last.set_id, "bench_rest_1");
        match last.data {
            SetData::Rest(t) => assert_eq!(t.end_timer, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resume_with_restart_keeps_rest() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();
        drop(session);

        h.secs(600);
        let mut services = h.services();
        let interrupted = services.recovery.load_pending(&library, h.clock.now()).unwrap();
        let sequence = interrupted.sequence;
        let session = WorkoutSession::resume_from(
            &library,
            interrupted,
            ResumeChoice {
                timer: ChoiceMode::Restart,
                calibration: ChoiceMode::Continue,
            },
            &h.config,
            HashMap::new(),
            services,
        )
        .unwrap();

        assert!(session.current().is_rest());
        assert_eq!(session.current().timer().unwrap().elapsed(session.now()), 0);
        let stored = h
            .checkpoints
            .load(session.workout_history_id())
            .unwrap()
            .unwrap();
        assert!(stored.sequence > sequence);
    }

    #[test]
    fn test_discard_removes_checkpoint() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        assert_eq!(h.checkpoints.list().unwrap().len(), 1);

        session.discard().unwrap();
        assert!(h.checkpoints.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timer_task_drives_rest_to_completion() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(session.start_timer_task(tx));
        assert!(session.has_timer_task());

        h.secs(120);
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(TimerEvent::Completed) => return Some(TimerEvent::Completed),
                    Some(TimerEvent::Tick { .. }) => continue,
                    None => return None,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, Some(TimerEvent::Completed));

        session.tick().unwrap();
        assert_eq!(current_set_id(&session).as_deref(), Some("bench_2"));
        assert!(!session.has_timer_task());
    }

    #[tokio::test]
    async fn test_pause_cancels_timer_task() {
        let h = Harness::new();
        let library = build_default_library();
        let mut session = h.start(&library, "press_quick");
        session.advance().unwrap();
        session.advance().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(session.start_timer_task(tx));
        session.pause_timer().unwrap();
        assert!(!session.has_timer_task());

        // A frozen timer has nothing to drive
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!session.start_timer_task(tx));
    }
}
