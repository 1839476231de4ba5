//! Process-death recovery.
//!
//! Every mutating transition persists a checkpoint: the machine snapshot plus
//! the wall-clock instant it was written. On cold start the newest usable
//! checkpoint is offered back; the operator then chooses, independently for
//! the active timer and for an in-progress calibration, whether to continue
//! where it left off or restart that part.

use crate::checkpoint::CheckpointStore;
use crate::config::{RecoveryConfig, MAX_CHECKPOINT_AGE_HOURS};
use crate::machine::{
    MachineSettings, MachineSnapshot, SessionPlan, StateMachine, WorkoutState,
};
use crate::plan::PlanLibrary;
use crate::{Result, SetData};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Persisted state of a session in progress
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecoveryCheckpoint {
    pub workout_history_id: Uuid,
    pub workout_id: String,
    /// Monotonic per session; a lower number never replaces a higher one
    pub sequence: u64,
    pub snapshot: MachineSnapshot,
    /// Plates on each side, per equipment id, as last confirmed
    #[serde(default)]
    pub loaded_plates: BTreeMap<String, Vec<f64>>,
    pub start_time: DateTime<Utc>,
    pub last_persisted_at: DateTime<Utc>,
}

/// A checkpoint found on startup
pub type InterruptedWorkout = RecoveryCheckpoint;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceMode {
    #[default]
    Continue,
    Restart,
}

/// Operator decision when resuming an interrupted session
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResumeChoice {
    pub timer: ChoiceMode,
    pub calibration: ChoiceMode,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReconciledSession {
    pub snapshot: MachineSnapshot,
    /// The running timer hit its bound while the process was gone
    pub natural_completion: bool,
}

/// Apply a resume choice to an interrupted session as seen from `now`.
///
/// Continue keeps the wall-clock start of a running timer, so elapsed time
/// is `E0 + (now - T0)` clamped to the bound; a timer that reached its bound
/// is parked there and reported as naturally completed. Paused timers stay
/// where they were. Restart re-zeroes the timer from `now`. Restarting
/// calibration rewinds to its load selection with the planned load.
pub fn reconcile(
    interrupted: &InterruptedWorkout,
    choice: ResumeChoice,
    now: DateTime<Utc>,
) -> ReconciledSession {
    let mut snapshot = interrupted.snapshot.clone();

    if choice.calibration == ChoiceMode::Restart {
        rewind_calibration(&mut snapshot);
    }

    let mut natural_completion = false;
    if let Some(timer) = snapshot.current.timer_mut() {
        match choice.timer {
            ChoiceMode::Continue => {
                if !timer.is_frozen() && timer.is_complete(now) {
                    timer.complete();
                    natural_completion = true;
                }
            }
            ChoiceMode::Restart => timer.restart(now),
        }
    }

    let gap = now - interrupted.last_persisted_at;
    tracing::info!(
        "Reconciled session {} after {}s away (timer: {:?}, calibration: {:?}, completed: {})",
        interrupted.workout_history_id,
        gap.num_seconds(),
        choice.timer,
        choice.calibration,
        natural_completion
    );

    ReconciledSession {
        snapshot,
        natural_completion,
    }
}

fn rewind_calibration(snapshot: &mut MachineSnapshot) {
    if !snapshot.current.is_calibration_flow() {
        return;
    }
    let Some(set_id) = snapshot.current.set().map(|s| s.id().to_string()) else {
        return;
    };

    let is_selection_for = |state: &WorkoutState| {
        matches!(state, WorkoutState::CalibrationLoadSelection(c) if c.calibration_set.id() == set_id)
    };

    if !is_selection_for(&snapshot.current) {
        let Some(idx) = snapshot.back_stack.iter().rposition(|f| is_selection_for(&f.state)) else {
            tracing::warn!("No load selection found for calibration set '{}'", set_id);
            return;
        };
        snapshot.back_stack.truncate(idx + 1);
        if let Some(frame) = snapshot.back_stack.pop() {
            snapshot.current = frame.state;
            snapshot.working = frame.working;
        }
    }

    if let WorkoutState::CalibrationLoadSelection(state) = &mut snapshot.current {
        state.current_set_data = SetData::initial_for(&state.calibration_set, 0.0);
        state.load_confirmed = false;
    }
    snapshot.working.remove(&set_id);
    tracing::info!("Calibration for '{}' restarted", set_id);
}

/// Owns the checkpoint store for the running process
pub struct RecoveryManager {
    store: Box<dyn CheckpointStore + Send>,
    next_sequence: u64,
    max_age: Duration,
}

impl RecoveryManager {
    pub fn new(store: Box<dyn CheckpointStore + Send>, config: &RecoveryConfig) -> Self {
        Self {
            store,
            next_sequence: 1,
            max_age: Duration::hours(config.max_checkpoint_age_hours.clamp(1, MAX_CHECKPOINT_AGE_HOURS)),
        }
    }

    /// Continue numbering after a resumed checkpoint
    pub fn resume_sequence(&mut self, after: u64) {
        self.next_sequence = self.next_sequence.max(after + 1);
    }

    /// Persist a checkpoint, stamping sequence and time.
    ///
    /// Failures are logged and swallowed; returns the sequence written.
    pub fn checkpoint(&mut self, mut checkpoint: RecoveryCheckpoint, now: DateTime<Utc>) -> Option<u64> {
        checkpoint.sequence = self.next_sequence;
        checkpoint.last_persisted_at = now;
        self.next_sequence += 1;

        match self.store.save(&checkpoint) {
            Ok(()) => Some(checkpoint.sequence),
            Err(e) => {
                tracing::warn!(
                    "Failed to write checkpoint {} for session {}: {}",
                    checkpoint.sequence,
                    checkpoint.workout_history_id,
                    e
                );
                None
            }
        }
    }

    /// Newest checkpoint that still fits the plan library.
    ///
    /// Unreadable, unknown-workout, expired, finished and plan-mismatched
    /// checkpoints are deleted and never block startup.
    pub fn load_pending(&mut self, library: &PlanLibrary, now: DateTime<Utc>) -> Option<InterruptedWorkout> {
        let ids = match self.store.list() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("Unable to list checkpoints: {}. Starting fresh.", e);
                return None;
            }
        };

        let mut pending: Option<InterruptedWorkout> = None;
        for id in ids {
            let checkpoint = match self.store.load(id) {
                Ok(Some(checkpoint)) => checkpoint,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Discarding unreadable checkpoint {}: {}", id, e);
                    self.delete_quietly(id);
                    continue;
                }
            };

            if let Err(reason) = self.check_usable(&checkpoint, library, now) {
                tracing::warn!("Discarding checkpoint {}: {}", id, reason);
                self.delete_quietly(id);
                continue;
            }

            match &pending {
                Some(best) if best.last_persisted_at >= checkpoint.last_persisted_at => {}
                _ => pending = Some(checkpoint),
            }
        }

        if let Some(found) = &pending {
            tracing::info!(
                "Found interrupted session {} of '{}' from {}",
                found.workout_history_id,
                found.workout_id,
                found.last_persisted_at
            );
        }
        pending
    }

    fn check_usable(
        &self,
        checkpoint: &RecoveryCheckpoint,
        library: &PlanLibrary,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        if now - checkpoint.last_persisted_at > self.max_age {
            return Err(format!(
                "older than {} hours",
                self.max_age.num_hours()
            ));
        }
        if checkpoint.snapshot.current.is_completed() {
            return Err("session already completed".into());
        }
        let plan = SessionPlan::resolve(library, &checkpoint.workout_id).map_err(|e| e.to_string())?;
        StateMachine::restore(
            plan,
            MachineSettings::default(),
            HashMap::new(),
            checkpoint.snapshot.clone(),
        )
        .map(|_| ())
        .map_err(|e| e.to_string())
    }

    fn delete_quietly(&mut self, id: Uuid) {
        if let Err(e) = self.store.delete(id) {
            tracing::warn!("Failed to delete checkpoint {}: {}", id, e);
        }
    }

    /// Operator threw the session away
    pub fn discard(&mut self, workout_history_id: Uuid) -> Result<()> {
        self.store.delete(workout_history_id)?;
        tracing::info!("Discarded session {}", workout_history_id);
        Ok(())
    }

    /// Session reached its terminal state
    pub fn complete(&mut self, workout_history_id: Uuid) -> Result<()> {
        self.store.delete(workout_history_id)?;
        tracing::debug!("Cleared checkpoint for completed session {}", workout_history_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::plan::build_default_library;
    use crate::{Error, TimerSetData};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap()
    }

    fn machine(workout_id: &str) -> StateMachine {
        let library = build_default_library();
        let plan = SessionPlan::resolve(&library, workout_id).unwrap();
        StateMachine::new(plan, MachineSettings::default(), HashMap::new())
    }

    fn checkpoint_of(m: &StateMachine, workout_id: &str, at: DateTime<Utc>) -> RecoveryCheckpoint {
        RecoveryCheckpoint {
            workout_history_id: Uuid::new_v4(),
            workout_id: workout_id.into(),
            sequence: 1,
            snapshot: m.snapshot(),
            loaded_plates: BTreeMap::new(),
            start_time: at,
            last_persisted_at: at,
        }
    }

    /// press_quick in its first rest, entered at `rest_start`
    fn in_rest(rest_start: DateTime<Utc>) -> StateMachine {
        let mut m = machine("press_quick");
        m.advance(rest_start).unwrap();
        m.advance(rest_start).unwrap();
        assert!(m.current().is_rest());
        m
    }

    fn elapsed(snapshot: &MachineSnapshot, now: DateTime<Utc>) -> i64 {
        snapshot.current.timer().unwrap().elapsed(now)
    }

    #[test]
    fn test_continue_adds_wall_clock_gap() {
        // E0 = 20s at T0
        let m = in_rest(t0() - Duration::seconds(20));
        let interrupted = checkpoint_of(&m, "press_quick", t0());

        let t1 = t0() + Duration::seconds(30);
        let reconciled = reconcile(&interrupted, ResumeChoice::default(), t1);
        assert_eq!(elapsed(&reconciled.snapshot, t1), 50_000);
        assert!(!reconciled.natural_completion);
    }

    #[test]
    fn test_continue_clamps_and_completes() {
        let m = in_rest(t0() - Duration::seconds(20));
        let interrupted = checkpoint_of(&m, "press_quick", t0());

        let t1 = t0() + Duration::minutes(10);
        let reconciled = reconcile(&interrupted, ResumeChoice::default(), t1);
        let timer = reconciled.snapshot.current.timer().unwrap();
        assert!(reconciled.natural_completion);
        assert!(timer.is_frozen());
        assert_eq!(timer.elapsed(t1), 90_000);
        assert_eq!(timer.progress(t1), 0);
    }

    #[test]
    fn test_paused_timer_ignores_gap() {
        let mut m = in_rest(t0() - Duration::seconds(20));
        m.current_mut().timer_mut().unwrap().freeze(t0());
        let interrupted = checkpoint_of(&m, "press_quick", t0());

        let t1 = t0() + Duration::hours(1);
        let reconciled = reconcile(&interrupted, ResumeChoice::default(), t1);
        assert_eq!(elapsed(&reconciled.snapshot, t1), 20_000);
        assert!(!reconciled.natural_completion);
    }

    #[test]
    fn test_restart_rezeroes_timer() {
        let m = in_rest(t0() - Duration::seconds(20));
        let interrupted = checkpoint_of(&m, "press_quick", t0());

        let t1 = t0() + Duration::seconds(45);
        let choice = ResumeChoice {
            timer: ChoiceMode::Restart,
            calibration: ChoiceMode::Continue,
        };
        let reconciled = reconcile(&interrupted, choice, t1);
        assert_eq!(elapsed(&reconciled.snapshot, t1), 0);
        assert_eq!(elapsed(&reconciled.snapshot, t1 + Duration::seconds(5)), 5_000);
    }

    #[test]
    fn test_restart_calibration_rewinds_to_load_selection() {
        let mut m = machine("full_body_a");
        let now = t0();
        m.advance(now).unwrap(); // warmup
        m.advance(now).unwrap(); // rest
        m.advance(now).unwrap(); // load selection
        m.select_calibration_load(100.0).unwrap();
        m.advance(now).unwrap(); // calibration set
        m.advance(now).unwrap(); // rir selection
        m.confirm_rir(4, None).unwrap();

        let interrupted = checkpoint_of(&m, "full_body_a", now);
        let choice = ResumeChoice {
            timer: ChoiceMode::Continue,
            calibration: ChoiceMode::Restart,
        };
        let reconciled = reconcile(&interrupted, choice, now + Duration::minutes(3));

        match &reconciled.snapshot.current {
            WorkoutState::CalibrationLoadSelection(state) => {
                assert!(!state.load_confirmed);
                match &state.current_set_data {
                    SetData::Weight(d) => {
                        assert_eq!(d.actual_weight, 80.0);
                        assert_eq!(d.calibration, None);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("expected load selection, got {:?}", other),
        }
        assert!(reconciled.snapshot.working.get("squat_calibration").is_none());
        assert_eq!(
            reconciled.snapshot.back_stack.last().and_then(|f| f.state.set()).map(|s| s.id()),
            Some("squat_rest_1")
        );
    }

    #[test]
    fn test_restart_calibration_outside_calibration_is_noop() {
        let m = in_rest(t0());
        let interrupted = checkpoint_of(&m, "press_quick", t0());
        let choice = ResumeChoice {
            timer: ChoiceMode::Continue,
            calibration: ChoiceMode::Restart,
        };
        let reconciled = reconcile(&interrupted, choice, t0());
        assert_eq!(reconciled.snapshot, interrupted.snapshot);
    }

    #[test]
    fn test_load_pending_discards_unusable_checkpoints() {
        let library = build_default_library();
        let store = MemoryCheckpointStore::new();
        let mut manager = RecoveryManager::new(Box::new(store.clone()), &RecoveryConfig::default());
        let mut writer = store.clone();

        let m = in_rest(t0());
        let valid = checkpoint_of(&m, "press_quick", t0());
        writer.save(&valid).unwrap();

        let unknown = RecoveryCheckpoint {
            workout_history_id: Uuid::new_v4(),
            workout_id: "retired_plan".into(),
            ..valid.clone()
        };
        writer.save(&unknown).unwrap();

        let expired = RecoveryCheckpoint {
            workout_history_id: Uuid::new_v4(),
            last_persisted_at: t0() - Duration::days(3),
            ..valid.clone()
        };
        writer.save(&expired).unwrap();

        let mismatched = RecoveryCheckpoint {
            workout_history_id: Uuid::new_v4(),
            workout_id: "full_body_a".into(),
            ..valid.clone()
        };
        writer.save(&mismatched).unwrap();

        let corrupt = Uuid::new_v4();
        store.put_raw(corrupt, "{\"workout_history_id\":");

        let found = manager
            .load_pending(&library, t0() + Duration::minutes(5))
            .unwrap();
        assert_eq!(found.workout_history_id, valid.workout_history_id);
        assert_eq!(store.list().unwrap(), vec![valid.workout_history_id]);
    }

    #[test]
    fn test_unvalidated_max_age_is_clamped() {
        let library = build_default_library();
        let store = MemoryCheckpointStore::new();
        let config = RecoveryConfig {
            max_checkpoint_age_hours: i64::MAX,
        };
        let mut manager = RecoveryManager::new(Box::new(store.clone()), &config);
        let mut writer = store.clone();

        let m = in_rest(t0());
        let week_old = RecoveryCheckpoint {
            last_persisted_at: t0() - Duration::days(7),
            ..checkpoint_of(&m, "press_quick", t0())
        };
        writer.save(&week_old).unwrap();

        let found = manager.load_pending(&library, t0()).unwrap();
        assert_eq!(found.workout_history_id, week_old.workout_history_id);
    }

    #[test]
    fn test_completed_checkpoint_is_not_offered() {
        let library = build_default_library();
        let store = MemoryCheckpointStore::new();
        let mut manager = RecoveryManager::new(Box::new(store.clone()), &RecoveryConfig::default());

        let mut m = machine("press_quick");
        while !m.current().is_completed() {
            m.advance(t0()).unwrap();
        }
        manager.checkpoint(checkpoint_of(&m, "press_quick", t0()), t0());

        assert!(manager.load_pending(&library, t0()).is_none());
        assert!(store.list().unwrap().is_empty());
    }

    struct BrokenStore;

    impl CheckpointStore for BrokenStore {
        fn save(&mut self, _: &RecoveryCheckpoint) -> Result<()> {
            Err(Error::Checkpoint("disk full".into()))
        }
        fn load(&self, _: Uuid) -> Result<Option<RecoveryCheckpoint>> {
            Err(Error::Checkpoint("disk gone".into()))
        }
        fn list(&self) -> Result<Vec<Uuid>> {
            Err(Error::Checkpoint("disk gone".into()))
        }
        fn delete(&mut self, _: Uuid) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_checkpoint_failures_are_swallowed() {
        let mut manager = RecoveryManager::new(Box::new(BrokenStore), &RecoveryConfig::default());
        let m = machine("press_quick");
        assert_eq!(manager.checkpoint(checkpoint_of(&m, "press_quick", t0()), t0()), None);
        assert!(manager
            .load_pending(&build_default_library(), t0())
            .is_none());
    }

    #[test]
    fn test_sequence_is_monotonic_across_resume() {
        let store = MemoryCheckpointStore::new();
        let mut manager = RecoveryManager::new(Box::new(store.clone()), &RecoveryConfig::default());
        let m = machine("press_quick");
        let cp = checkpoint_of(&m, "press_quick", t0());

        manager.resume_sequence(41);
        assert_eq!(manager.checkpoint(cp.clone(), t0()), Some(42));
        assert_eq!(manager.checkpoint(cp.clone(), t0()), Some(43));
        assert_eq!(store.load(cp.workout_history_id).unwrap().unwrap().sequence, 43);
    }

    #[test]
    fn test_checkpoint_payload_survives_json() {
        let m = in_rest(t0());
        let mut cp = checkpoint_of(&m, "press_quick", t0());
        cp.loaded_plates.insert("olympic_barbell".into(), vec![20.0]);
        cp.snapshot.working.insert(
            "bench_rest_1".into(),
            SetData::Rest(TimerSetData {
                start_timer: 90_000,
                end_timer: 1,
            }),
        );
        let json = serde_json::to_string(&cp).unwrap();
        let back: RecoveryCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
    }

    proptest! {
        #[test]
        fn prop_continue_elapsed_is_clamped_sum(
            e0_secs in 0i64..90,
            gap_secs in 0i64..400,
        ) {
            let m = in_rest(t0() - Duration::seconds(e0_secs));
            let interrupted = checkpoint_of(&m, "press_quick", t0());
            let t1 = t0() + Duration::seconds(gap_secs);

            let reconciled = reconcile(&interrupted, ResumeChoice::default(), t1);
            let expected = ((e0_secs + gap_secs) * 1000).min(90_000);
            prop_assert_eq!(elapsed(&reconciled.snapshot, t1), expected);
            prop_assert_eq!(reconciled.natural_completion, expected == 90_000);
        }
    }
}
