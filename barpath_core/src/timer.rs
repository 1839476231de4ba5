//! Timer reconciliation for rests and timed sets.
//!
//! A running timer is stored as a wall-clock start instant; a paused or
//! edited one as frozen progress. `freeze` and `resume` convert between the
//! two without drift. Progress is direction-aware: count-up timers report
//! elapsed time, count-down timers report time remaining.
//!
//! [`TimerTask`] drives the periodic tick on a tokio task and is cancelled
//! through a token only the owning handle can reach.

use crate::{Set, TimerSetData};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Clock
// ============================================================================

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and replays
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = instant;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimerDirection {
    CountUp,
    CountDown,
}

impl TimerDirection {
    pub fn for_set(set: &Set) -> Option<Self> {
        match set {
            Set::Endurance(_) => Some(TimerDirection::CountUp),
            Set::TimedDuration(_) | Set::Rest(_) => Some(TimerDirection::CountDown),
            Set::Weight(_) | Set::BodyWeight(_) => None,
        }
    }

    pub fn elapsed_from_progress(self, progress_millis: i64, max_millis: i64) -> i64 {
        let progress = progress_millis.clamp(0, max_millis.max(0));
        match self {
            TimerDirection::CountUp => progress,
            TimerDirection::CountDown => max_millis.max(0) - progress,
        }
    }

    pub fn progress_from_elapsed(self, elapsed_millis: i64, max_millis: i64) -> i64 {
        let elapsed = elapsed_millis.clamp(0, max_millis.max(0));
        match self {
            TimerDirection::CountUp => elapsed,
            TimerDirection::CountDown => max_millis.max(0) - elapsed,
        }
    }
}

/// Freeze a running timer into progress at `now`
pub fn freeze(
    start_time: DateTime<Utc>,
    max_millis: i64,
    direction: TimerDirection,
    now: DateTime<Utc>,
) -> i64 {
    let elapsed = (now - start_time).num_milliseconds();
    direction.progress_from_elapsed(elapsed, max_millis)
}

/// Turn frozen progress back into a start instant as seen from `now`
pub fn resume(
    progress_millis: i64,
    max_millis: i64,
    direction: TimerDirection,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    now - Duration::milliseconds(direction.elapsed_from_progress(progress_millis, max_millis))
}

/// Whether progress has not yet reached its bound and the timer is not paused
pub fn is_running(
    progress_millis: i64,
    max_millis: i64,
    direction: TimerDirection,
    paused: bool,
) -> bool {
    if paused {
        return false;
    }
    match direction {
        TimerDirection::CountUp => progress_millis < max_millis,
        TimerDirection::CountDown => progress_millis > 0,
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimerMode {
    Running { start_time: DateTime<Utc> },
    Frozen { progress_millis: i64 },
}

/// Timer attached to a timed state
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityTimer {
    pub direction: TimerDirection,
    pub max_millis: i64,
    pub mode: TimerMode,
}

impl ActivityTimer {
    /// A timer that starts running at `now` from zero elapsed
    pub fn start(direction: TimerDirection, max_millis: i64, now: DateTime<Utc>) -> Self {
        Self {
            direction,
            max_millis,
            mode: TimerMode::Running { start_time: now },
        }
    }

    /// A timer parked at the given progress, not running
    pub fn frozen(direction: TimerDirection, max_millis: i64, progress_millis: i64) -> Self {
        let progress = progress_millis.clamp(0, max_millis.max(0));
        Self {
            direction,
            max_millis,
            mode: TimerMode::Frozen {
                progress_millis: progress,
            },
        }
    }

    /// Timer for a set template, running from its stored progress
    pub fn for_set(set: &Set, data: Option<&TimerSetData>, now: DateTime<Utc>) -> Option<Self> {
        let direction = TimerDirection::for_set(set)?;
        let max = set.timer_bound_millis()?;
        let mut timer = match data {
            Some(d) => Self::frozen(direction, max, d.end_timer),
            None => Self::start(direction, max, now),
        };
        timer.resume(now);
        Some(timer)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> i64 {
        match self.mode {
            TimerMode::Running { start_time } => {
                (now - start_time).num_milliseconds().clamp(0, self.max_millis.max(0))
            }
            TimerMode::Frozen { progress_millis } => self
                .direction
                .elapsed_from_progress(progress_millis, self.max_millis),
        }
    }

    pub fn progress(&self, now: DateTime<Utc>) -> i64 {
        match self.mode {
            TimerMode::Running { start_time } => {
                freeze(start_time, self.max_millis, self.direction, now)
            }
            TimerMode::Frozen { progress_millis } => progress_millis,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.mode, TimerMode::Frozen { .. })
    }

    pub fn is_complete(&self, now: DateTime<Utc>) -> bool {
        self.elapsed(now) >= self.max_millis
    }

    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        is_running(
            self.progress(now),
            self.max_millis,
            self.direction,
            self.is_frozen(),
        )
    }

    /// Stop the clock, keeping progress. No-op if already frozen.
    pub fn freeze(&mut self, now: DateTime<Utc>) {
        if let TimerMode::Running { start_time } = self.mode {
            self.mode = TimerMode::Frozen {
                progress_millis: freeze(start_time, self.max_millis, self.direction, now),
            };
        }
    }

    /// Restart the clock from frozen progress. No-op if already running.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        if let TimerMode::Frozen { progress_millis } = self.mode {
            self.mode = TimerMode::Running {
                start_time: resume(progress_millis, self.max_millis, self.direction, now),
            };
        }
    }

    /// Overwrite progress; only meaningful while frozen (timer edit mode)
    pub fn set_progress(&mut self, progress_millis: i64) -> bool {
        match &mut self.mode {
            TimerMode::Frozen { progress_millis: p } => {
                *p = progress_millis.clamp(0, self.max_millis.max(0));
                true
            }
            TimerMode::Running { .. } => false,
        }
    }

    /// Add wall-clock time that passed while nobody was watching, clamped
    pub fn add_elapsed(&mut self, gap_millis: i64) {
        let gap = gap_millis.max(0);
        match &mut self.mode {
            TimerMode::Running { start_time } => {
                *start_time -= Duration::milliseconds(gap);
            }
            TimerMode::Frozen { progress_millis } => {
                let elapsed = self.direction.elapsed_from_progress(*progress_millis, self.max_millis);
                *progress_millis = self
                    .direction
                    .progress_from_elapsed(elapsed.saturating_add(gap), self.max_millis);
            }
        }
    }

    /// Re-zero: nothing elapsed, running from `now`
    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.mode = TimerMode::Running { start_time: now };
    }

    /// Force the timer to its bound and park it there
    pub fn complete(&mut self) {
        self.mode = TimerMode::Frozen {
            progress_millis: self.direction.progress_from_elapsed(self.max_millis, self.max_millis),
        };
    }

    /// Copy progress into the persisted set data representation
    pub fn write_into(&self, data: &mut TimerSetData, now: DateTime<Utc>) {
        data.start_timer = self.max_millis;
        data.end_timer = self.progress(now);
    }
}

// ============================================================================
// Tick task
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    Tick { progress_millis: i64 },
    Completed,
}

/// Periodic tick for the active timer.
///
/// The cancellation token never leaves this handle, so only the owner can
/// stop the task. Dropping the handle cancels it as well.
#[derive(Debug)]
pub struct TimerTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TimerTask {
    /// Spawn onto the current tokio runtime.
    ///
    /// Sends `Tick` every `period` until the bound is reached, then a single
    /// `Completed`. The task ends on its own once the receiver is gone.
    pub fn spawn(
        timer: ActivityTimer,
        clock: Arc<dyn Clock>,
        period: std::time::Duration,
        events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => {
                        tracing::debug!("Timer task cancelled");
                        break;
                    }
                    _ = tick.tick() => {
                        let now = clock.now();
                        if timer.is_complete(now) {
                            let _ = events.send(TimerEvent::Completed);
                            tracing::debug!("Timer reached its bound");
                            break;
                        }
                        let progress_millis = timer.progress(now);
                        if events.send(TimerEvent::Tick { progress_millis }).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { token, handle }
    }

    /// Stop ticking. Safe to call any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
