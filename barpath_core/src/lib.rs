#![forbid(unsafe_code)]

//! Core domain model and session engine for Barpath.
//!
//! This crate provides:
//! - Domain types (sets, set data, equipment, workout plans)
//! - Plan library and flattening
//! - Equipment resolver and plate optimizer
//! - Timer reconciliation and the tick task
//! - The session state machine with undo and load calibration
//! - Persistence (history WAL, CSV archive, recovery checkpoints)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod plan;
pub mod equipment;
pub mod plates;
pub mod timer;
pub mod calibration;
pub mod machine;
pub mod history;
pub mod archive;
pub mod checkpoint;
pub mod recovery;
pub mod session;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use plan::{get_default_library, PlanLibrary};
pub use plates::{compute_change, compute_plate_change};
pub use timer::{Clock, ManualClock, SystemClock};
pub use machine::{StateMachine, WorkoutState};
pub use history::{JsonlHistory, SetHistorySink};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use recovery::{ChoiceMode, InterruptedWorkout, RecoveryManager, ResumeChoice};
pub use session::{SessionServices, WorkoutSession};
