//! Load calibration from reps-in-reserve feedback.
//!
//! After a calibration set the operator reports RIR. The rating keeps the
//! raw RIR and a separate form-breakdown flag; the working load for the rest
//! of the exercise is then nudged up or down and snapped to something the
//! equipment can actually produce.

use crate::config::CalibrationConfig;
use crate::equipment::{from_grams, nearest_achievable, to_grams};
use crate::{CalibrationRating, Equipment};
use serde::{Deserialize, Serialize};

/// How the form-breakdown flag is derived when the operator does not set it
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FormBreakdownPolicy {
    /// RIR 0 is read as "stopped because form broke down"
    #[default]
    ZeroRirMeansBreakdown,
    /// Only an explicit operator flag marks breakdown
    ExplicitOnly,
}

impl CalibrationRating {
    /// Build a rating; an explicit flag always wins over the policy
    pub fn from_rir(rir: u8, explicit_breakdown: Option<bool>, policy: FormBreakdownPolicy) -> Self {
        let form_breakdown = explicit_breakdown.unwrap_or(match policy {
            FormBreakdownPolicy::ZeroRirMeansBreakdown => rir == 0,
            FormBreakdownPolicy::ExplicitOnly => false,
        });
        Self {
            rir,
            form_breakdown,
        }
    }
}

/// Working load implied by a calibration result
pub fn adjusted_working_load(
    calibration_load: f64,
    rating: CalibrationRating,
    config: &CalibrationConfig,
    equipment: Option<&Equipment>,
) -> f64 {
    let factor = if rating.form_breakdown {
        1.0 - config.form_breakdown_reduction_percent / 100.0
    } else {
        let delta = i32::from(rating.rir) - i32::from(config.target_rir);
        1.0 + f64::from(delta) * config.adjustment_per_rir_percent / 100.0
    };
    let raw = from_grams(to_grams((calibration_load * factor).max(0.0)));

    let snapped = equipment
        .and_then(|eq| nearest_achievable(eq, raw))
        .unwrap_or(raw);

    tracing::info!(
        "Calibration at {} kg with RIR {} (breakdown: {}) -> working load {} kg",
        calibration_load,
        rating.rir,
        rating.form_breakdown,
        snapped
    );
    snapped
}
