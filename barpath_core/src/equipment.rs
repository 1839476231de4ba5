//! Equipment resolver: which total loads a piece of equipment can produce.
//!
//! Weights are handled as integer grams internally so that sums of plates
//! like 1.25 kg never drift.

use crate::{Equipment, Loading, PlateStock, WeightLoadedEquipment};
use std::collections::{BTreeMap, BTreeSet};

pub(crate) fn to_grams(kg: f64) -> i64 {
    (kg * 1000.0).round() as i64
}

pub(crate) fn from_grams(grams: i64) -> f64 {
    grams as f64 / 1000.0
}

/// Merge duplicate plate entries and drop non-positive weights.
///
/// Returns `(weight_grams, quantity)` pairs, heaviest first.
pub(crate) fn merged_inventory(plates: &[PlateStock]) -> Vec<(i64, u32)> {
    let mut merged: BTreeMap<i64, u32> = BTreeMap::new();
    for stock in plates {
        let grams = to_grams(stock.weight);
        if grams <= 0 {
            tracing::warn!("Ignoring non-positive plate weight {}", stock.weight);
            continue;
        }
        *merged.entry(grams).or_insert(0) += stock.quantity;
    }
    merged.into_iter().rev().collect()
}

/// Enumerate every total load the equipment can produce, ascending
pub fn achievable_loads(equipment: &Equipment) -> Vec<f64> {
    match equipment {
        Equipment::WeightLoaded(e) => achievable_grams(e).into_iter().map(from_grams).collect(),
        Equipment::Accessory(_) => Vec::new(),
    }
}

fn achievable_grams(equipment: &WeightLoadedEquipment) -> BTreeSet<i64> {
    let base = to_grams(equipment.base_weight);
    let mut totals = BTreeSet::new();

    match &equipment.loading {
        Loading::Plates { plates } => {
            let mut side_sums: BTreeSet<i64> = BTreeSet::from([0]);
            for (weight, quantity) in merged_inventory(plates) {
                let per_side = i64::from(quantity / 2);
                let mut next = BTreeSet::new();
                for sum in &side_sums {
                    for count in 0..=per_side {
                        next.insert(sum + count * weight);
                    }
                }
                side_sums = next;
            }
            totals.extend(side_sums.into_iter().map(|side| base + 2 * side));
        }
        Loading::FixedIncrement {
            increment,
            max_additional,
        } => {
            let step = to_grams(*increment);
            let max = to_grams(*max_additional).max(0);
            totals.insert(base);
            if step > 0 {
                let mut added = step;
                while added <= max {
                    totals.insert(base + added);
                    added += step;
                }
            }
        }
    }

    totals
}

/// The achievable load closest to `target`; ties go to the lighter load
pub fn nearest_achievable(equipment: &Equipment, target: f64) -> Option<f64> {
    let target = to_grams(target);
    let loads = match equipment {
        Equipment::WeightLoaded(e) => achievable_grams(e),
        Equipment::Accessory(_) => return None,
    };
    loads
        .into_iter()
        .min_by_key(|load| ((load - target).abs(), *load))
        .map(from_grams)
}

/// Loads to offer during calibration load selection.
///
/// Returns up to `count` achievable loads centred on the one nearest to
/// `planned`. Equipment without a load model simply offers the planned value.
pub fn calibration_candidates(equipment: Option<&Equipment>, planned: f64, count: usize) -> Vec<f64> {
    let loads = match equipment {
        Some(eq) => achievable_loads(eq),
        None => Vec::new(),
    };
    if loads.is_empty() || count == 0 {
        return vec![planned];
    }

    let planned_g = to_grams(planned);
    let centre = loads
        .iter()
        .enumerate()
        .min_by_key(|(_, load)| ((to_grams(**load) - planned_g).abs(), to_grams(**load)))
        .map(|(idx, _)| idx)
        .unwrap_or(0);

    let half = count / 2;
    let start = centre.saturating_sub(half).min(loads.len().saturating_sub(count));
    let end = (start + count).min(loads.len());
    loads[start..end].to_vec()
}

/// Render a weight without trailing zeros (e.g. `82.5`, `1.25`, `20`)
pub fn format_weight(weight: f64) -> String {
    let formatted = format!("{:.3}", weight);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".into()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccessoryEquipment;

    fn barbell(plates: &[(f64, u32)]) -> Equipment {
        Equipment::WeightLoaded(WeightLoadedEquipment {
            id: "barbell".into(),
            name: "Barbell".into(),
            base_weight: 20.0,
            loading: Loading::Plates {
                plates: plates
                    .iter()
                    .map(|(weight, quantity)| PlateStock {
                        weight: *weight,
                        quantity: *quantity,
                    })
                    .collect(),
            },
        })
    }

    #[test]
    fn test_plate_loads_are_symmetric() {
        let eq = barbell(&[(10.0, 2), (5.0, 2)]);
        assert_eq!(achievable_loads(&eq), vec![20.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn test_odd_quantity_leaves_one_plate_unused() {
        let eq = barbell(&[(10.0, 3)]);
        assert_eq!(achievable_loads(&eq), vec![20.0, 40.0]);
    }

    #[test]
    fn test_duplicate_inventory_entries_are_merged() {
        let eq = barbell(&[(2.5, 2), (2.5, 2)]);
        assert_eq!(achievable_loads(&eq), vec![20.0, 25.0, 30.0]);
    }

    #[test]
    fn test_fixed_increment_loads() {
        let eq = Equipment::WeightLoaded(WeightLoadedEquipment {
            id: "stack".into(),
            name: "Cable stack".into(),
            base_weight: 5.0,
            loading: Loading::FixedIncrement {
                increment: 2.5,
                max_additional: 10.0,
            },
        });
        assert_eq!(achievable_loads(&eq), vec![5.0, 7.5, 10.0, 12.5, 15.0]);
    }

    #[test]
    fn test_accessory_has_no_loads() {
        let eq = Equipment::Accessory(AccessoryEquipment {
            id: "band".into(),
            name: "Band".into(),
        });
        assert!(achievable_loads(&eq).is_empty());
        assert_eq!(nearest_achievable(&eq, 10.0), None);
    }

    #[test]
    fn test_nearest_prefers_lighter_on_tie() {
        let eq = barbell(&[(5.0, 4)]);
        // 20, 30, 40 reachable; 25 is equidistant from 20 and 30
        assert_eq!(nearest_achievable(&eq, 25.0), Some(20.0));
        assert_eq!(nearest_achievable(&eq, 27.0), Some(30.0));
        assert_eq!(nearest_achievable(&eq, 100.0), Some(40.0));
    }

    #[test]
    fn test_calibration_candidates_window() {
        let eq = barbell(&[(2.5, 20)]);
        let candidates = calibration_candidates(Some(&eq), 40.0, 5);
        assert_eq!(candidates, vec![30.0, 35.0, 40.0, 45.0, 50.0]);

        // Window is clamped at the light end
        let low = calibration_candidates(Some(&eq), 20.0, 3);
        assert_eq!(low, vec![20.0, 25.0, 30.0]);
    }

    #[test]
    fn test_calibration_candidates_without_equipment() {
        assert_eq!(calibration_candidates(None, 42.0, 5), vec![42.0]);
    }

    #[test]
    fn test_format_weight() {
        assert_eq!(format_weight(82.5), "82.5");
        assert_eq!(format_weight(1.25), "1.25");
        assert_eq!(format_weight(20.0), "20");
        assert_eq!(format_weight(0.0), "0");
    }
}
