//! Plate optimizer for symmetric weight-loaded equipment.
//!
//! Works on one side of the bar: every step is performed on both sleeves.
//! The search is a small dynamic program over distinct plate weights, keyed by
//! the per-side sum in grams, keeping for each sum the cheapest way to get
//! there from the plates already loaded.

use crate::equipment::{from_grams, merged_inventory, nearest_achievable, to_grams};
use crate::{
    Equipment, Error, Loading, PlateAction, PlateChangeResult, PlateStep, PlateStock, Result,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Cheapest known configuration reaching a given per-side sum
#[derive(Clone, Debug)]
struct Candidate {
    /// Plates removed plus plates added
    cost: u32,
    /// Plates on the sleeve afterwards
    plates: u32,
    /// Count per weight, in heaviest-first order
    counts: Vec<u32>,
}

impl Candidate {
    /// Lower cost, then fewer plates, then heavier plates
    fn preference(&self, other: &Candidate) -> Ordering {
        self.cost
            .cmp(&other.cost)
            .then(self.plates.cmp(&other.plates))
            .then_with(|| other.counts.cmp(&self.counts))
    }
}

/// Compute the steps that take `current` (plates on one side) to the
/// achievable total closest to `target_weight`.
///
/// `inventory` lists every plate owned, both sides together; a side may hold
/// at most half of each quantity, or whatever is already loaded if that is
/// more. With no inventory the result never contains steps.
pub fn compute_change(
    current: &[f64],
    inventory: &[PlateStock],
    target_weight: f64,
    bar_weight: f64,
) -> PlateChangeResult {
    let bar = to_grams(bar_weight);
    let current_grams: Vec<i64> = current.iter().map(|w| to_grams(*w)).collect();
    let current_side: i64 = current_grams.iter().sum();
    let current_configuration = sorted_heaviest_first(current);

    let stock = merged_inventory(inventory);
    if stock.is_empty() {
        tracing::debug!("No plate inventory configured, nothing to compute");
        return PlateChangeResult {
            target_configuration: current_configuration.clone(),
            current_configuration,
            target_weight,
            achieved_weight: from_grams(bar + 2 * current_side),
            steps: Vec::new(),
        };
    }

    // Distinct weights (inventory plus anything already loaded), heaviest first
    let mut loaded: BTreeMap<i64, u32> = BTreeMap::new();
    for grams in &current_grams {
        *loaded.entry(*grams).or_insert(0) += 1;
    }
    let mut caps: BTreeMap<i64, u32> = stock.iter().map(|(w, q)| (*w, q / 2)).collect();
    for (weight, count) in &loaded {
        let cap = caps.entry(*weight).or_insert(0);
        *cap = (*cap).max(*count);
    }
    let weights: Vec<(i64, u32, u32)> = caps
        .iter()
        .rev()
        .map(|(w, cap)| (*w, *cap, loaded.get(w).copied().unwrap_or(0)))
        .collect();

    // Both-sides goal; a per-side sum S lands at distance |2S - goal|
    let goal = (to_grams(target_weight) - bar).max(0);

    let mut states: BTreeMap<i64, Candidate> = BTreeMap::new();
    states.insert(
        0,
        Candidate {
            cost: 0,
            plates: 0,
            counts: Vec::with_capacity(weights.len()),
        },
    );

    for (weight, cap, already) in &weights {
        let mut next: BTreeMap<i64, Candidate> = BTreeMap::new();
        for (sum, candidate) in &states {
            for count in 0..=*cap {
                let side = sum + i64::from(count) * weight;
                // Past the goal, an empty sleeve is always at least as close
                if side > goal {
                    break;
                }
                let mut counts = candidate.counts.clone();
                counts.push(count);
                let extended = Candidate {
                    cost: candidate.cost + count.abs_diff(*already),
                    plates: candidate.plates + count,
                    counts,
                };
                match next.get(&side) {
                    Some(existing) if existing.preference(&extended) != Ordering::Greater => {}
                    _ => {
                        next.insert(side, extended);
                    }
                }
            }
        }
        states = next;
    }

    let (side, best) = states
        .into_iter()
        .min_by_key(|(side, _)| ((2 * side - goal).abs(), *side))
        .unwrap_or((
            0,
            Candidate {
                cost: 0,
                plates: 0,
                counts: vec![0; weights.len()],
            },
        ));

    let mut removals = Vec::new();
    let mut additions = Vec::new();
    let mut target_configuration = Vec::new();
    for ((weight, _, already), count) in weights.iter().zip(best.counts.iter()) {
        let kg = from_grams(*weight);
        for _ in 0..*count {
            target_configuration.push(kg);
        }
        match count.cmp(already) {
            Ordering::Less => {
                for _ in 0..(already - count) {
                    removals.push(PlateStep {
                        action: PlateAction::Remove,
                        weight: kg,
                    });
                }
            }
            Ordering::Greater => {
                for _ in 0..(count - already) {
                    additions.push(PlateStep {
                        action: PlateAction::Add,
                        weight: kg,
                    });
                }
            }
            Ordering::Equal => {}
        }
    }

    let mut steps = removals;
    steps.extend(additions);

    let achieved_weight = from_grams(bar + 2 * side);
    if to_grams(achieved_weight) != to_grams(target_weight) {
        tracing::info!(
            "Target {} kg not reachable exactly, nearest is {} kg",
            target_weight,
            achieved_weight
        );
    }
    tracing::debug!(
        "Plate change from {:?} to {:?}: {} steps",
        current_configuration,
        target_configuration,
        steps.len()
    );

    PlateChangeResult {
        current_configuration,
        target_configuration,
        target_weight,
        achieved_weight,
        steps,
    }
}

/// Plate change for any equipment kind.
///
/// Only plate-loaded equipment produces steps; pin stacks report the nearest
/// achievable load and accessories echo the target back.
pub fn compute_plate_change(
    equipment: &Equipment,
    current: &[f64],
    target_weight: f64,
) -> PlateChangeResult {
    match equipment {
        Equipment::WeightLoaded(eq) => match &eq.loading {
            Loading::Plates { plates } => {
                compute_change(current, plates, target_weight, eq.base_weight)
            }
            Loading::FixedIncrement { .. } => PlateChangeResult {
                current_configuration: Vec::new(),
                target_configuration: Vec::new(),
                target_weight,
                achieved_weight: nearest_achievable(equipment, target_weight)
                    .unwrap_or(eq.base_weight),
                steps: Vec::new(),
            },
        },
        Equipment::Accessory(_) => PlateChangeResult {
            current_configuration: Vec::new(),
            target_configuration: Vec::new(),
            target_weight,
            achieved_weight: target_weight,
            steps: Vec::new(),
        },
    }
}

/// Replay steps on a per-side configuration.
///
/// Removing a plate that is not on the sleeve is a consistency error.
pub fn apply_steps(current: &[f64], steps: &[PlateStep]) -> Result<Vec<f64>> {
    let mut side: Vec<i64> = current.iter().map(|w| to_grams(*w)).collect();
    for step in steps {
        let grams = to_grams(step.weight);
        match step.action {
            PlateAction::Add => side.push(grams),
            PlateAction::Remove => {
                let idx = side.iter().position(|w| *w == grams).ok_or_else(|| {
                    Error::consistency(format!(
                        "cannot remove {} kg plate: not loaded",
                        step.weight
                    ))
                })?;
                side.swap_remove(idx);
            }
        }
    }
    side.sort_unstable_by(|a, b| b.cmp(a));
    Ok(side.into_iter().map(from_grams).collect())
}

/// Total load for a bar carrying `side` on each sleeve
pub fn total_weight(bar_weight: f64, side: &[f64]) -> f64 {
    let side: i64 = side.iter().map(|w| to_grams(*w)).sum();
    from_grams(to_grams(bar_weight) + 2 * side)
}

fn sorted_heaviest_first(plates: &[f64]) -> Vec<f64> {
    let mut grams: Vec<i64> = plates.iter().map(|w| to_grams(*w)).collect();
    grams.sort_unstable_by(|a, b| b.cmp(a));
    grams.into_iter().map(from_grams).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equipment::achievable_loads;
    use crate::WeightLoadedEquipment;
    use proptest::prelude::*;

    fn stock(plates: &[(f64, u32)]) -> Vec<PlateStock> {
        plates
            .iter()
            .map(|(weight, quantity)| PlateStock {
                weight: *weight,
                quantity: *quantity,
            })
            .collect()
    }

    fn standard_inventory() -> Vec<PlateStock> {
        stock(&[
            (20.0, 6),
            (15.0, 2),
            (10.0, 4),
            (5.0, 4),
            (2.5, 4),
            (1.25, 4),
        ])
    }

    fn add(weight: f64) -> PlateStep {
        PlateStep {
            action: PlateAction::Add,
            weight,
        }
    }

    fn remove(weight: f64) -> PlateStep {
        PlateStep {
            action: PlateAction::Remove,
            weight,
        }
    }

    #[test]
    fn test_sixty_to_eighty_two_and_a_half() {
        // 60 kg = 20 kg bar + 20 kg per side
        let result = compute_change(&[20.0], &standard_inventory(), 82.5, 20.0);

        assert_eq!(result.steps, vec![add(10.0), add(1.25)]);
        assert_eq!(result.achieved_weight, 82.5);
        assert!(result.is_exact());

        let replayed = apply_steps(&result.current_configuration, &result.steps).unwrap();
        assert_eq!(replayed, result.target_configuration);
        assert_eq!(total_weight(20.0, &replayed), 82.5);
    }

    #[test]
    fn test_same_total_needs_no_change() {
        let result = compute_change(&[20.0, 5.0], &standard_inventory(), 70.0, 20.0);
        assert!(result.is_no_change());
        assert_eq!(result.achieved_weight, 70.0);
    }

    #[test]
    fn test_deterministic() {
        let a = compute_change(&[15.0, 2.5], &standard_inventory(), 101.25, 20.0);
        let b = compute_change(&[15.0, 2.5], &standard_inventory(), 101.25, 20.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_target_below_bar_strips_everything() {
        let result = compute_change(&[20.0, 10.0], &standard_inventory(), 15.0, 20.0);
        assert_eq!(result.steps, vec![remove(20.0), remove(10.0)]);
        assert!(result.target_configuration.is_empty());
        assert_eq!(result.achieved_weight, 20.0);
    }

    #[test]
    fn test_empty_inventory_returns_no_steps() {
        let result = compute_change(&[10.0], &[], 100.0, 20.0);
        assert!(result.steps.is_empty());
        assert_eq!(result.achieved_weight, 40.0);
    }

    #[test]
    fn test_infeasible_target_reports_nearest() {
        let inventory = stock(&[(5.0, 20)]);
        let result = compute_change(&[], &inventory, 87.5, 20.0);
        // Per side 33.75 wanted; 35 is closer than 30
        assert_eq!(result.achieved_weight, 90.0);
        assert!(!result.is_exact());
        assert_eq!(result.steps.len(), 7);
    }

    #[test]
    fn test_keeps_seated_plates() {
        let result = compute_change(&[20.0, 10.0], &standard_inventory(), 100.0, 20.0);
        // 30 -> 40 per side: one 10 added beats swapping to 20 + 20
        assert_eq!(result.steps, vec![add(10.0)]);
    }

    #[test]
    fn test_equal_cost_prefers_heavier_plates() {
        let inventory = stock(&[(10.0, 2), (7.5, 4), (5.0, 2)]);
        let result = compute_change(&[], &inventory, 50.0, 20.0);
        // 10 + 5 and 7.5 + 7.5 both take two plates
        assert_eq!(result.steps, vec![add(10.0), add(5.0)]);
    }

    #[test]
    fn test_removals_come_before_additions_heaviest_first() {
        let inventory = stock(&[(20.0, 2), (10.0, 2), (5.0, 4), (2.5, 4)]);
        // 15 per side to 20: both fives are already out of the box
        let result = compute_change(&[5.0, 5.0, 2.5, 2.5], &inventory, 60.0, 20.0);
        assert_eq!(result.achieved_weight, 60.0);
        assert_eq!(result.steps, vec![remove(5.0), add(10.0)]);
    }

    #[test]
    fn test_apply_steps_rejects_missing_plate() {
        let err = apply_steps(&[10.0], &[remove(20.0)]).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn test_fixed_increment_equipment_has_no_steps() {
        let eq = Equipment::WeightLoaded(WeightLoadedEquipment {
            id: "stack".into(),
            name: "Stack".into(),
            base_weight: 0.0,
            loading: Loading::FixedIncrement {
                increment: 5.0,
                max_additional: 100.0,
            },
        });
        let result = compute_plate_change(&eq, &[], 42.0);
        assert!(result.steps.is_empty());
        assert_eq!(result.achieved_weight, 40.0);
    }

    proptest! {
        #[test]
        fn prop_replayed_total_equals_achieved(
            quantities in proptest::collection::vec(0u32..6, 5),
            loaded in proptest::collection::vec(0u32..3, 5),
            target in 0u32..400,
        ) {
            let weights = [20.0, 10.0, 5.0, 2.5, 1.25];
            let inventory: Vec<PlateStock> = weights
                .iter()
                .zip(&quantities)
                .map(|(w, q)| PlateStock { weight: *w, quantity: *q })
                .collect();
            let current: Vec<f64> = weights
                .iter()
                .zip(loaded.iter().zip(&quantities))
                .flat_map(|(w, (l, q))| std::iter::repeat(*w).take((*l).min(q / 2) as usize))
                .collect();
            let target = f64::from(target) / 2.0;

            let result = compute_change(&current, &inventory, target, 20.0);
            let replayed = apply_steps(&current, &result.steps).unwrap();
            prop_assert_eq!(total_weight(20.0, &replayed), result.achieved_weight);

            if !inventory.iter().all(|p| p.quantity == 0) {
                // Nearest achievable total, agreeing with the resolver
                let eq = Equipment::WeightLoaded(WeightLoadedEquipment {
                    id: "bar".into(),
                    name: "Bar".into(),
                    base_weight: 20.0,
                    loading: Loading::Plates { plates: inventory.clone() },
                });
                let loads = achievable_loads(&eq);
                let best = loads
                    .iter()
                    .map(|l| (l - target.max(20.0)).abs())
                    .fold(f64::INFINITY, f64::min);
                prop_assert!(((result.achieved_weight - target.max(20.0)).abs() - best).abs() < 1e-9);
            }
        }

        #[test]
        fn prop_current_total_is_a_fixed_point(
            loaded in proptest::collection::vec(0u32..3, 4),
        ) {
            let weights = [20.0, 10.0, 5.0, 2.5];
            let current: Vec<f64> = weights
                .iter()
                .zip(&loaded)
                .flat_map(|(w, l)| std::iter::repeat(*w).take(*l as usize))
                .collect();
            let total = total_weight(20.0, &current);
            let result = compute_change(&current, &standard_inventory(), total, 20.0);
            prop_assert!(result.steps.is_empty());
        }
    }
}
