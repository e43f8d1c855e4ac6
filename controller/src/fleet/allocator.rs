//! Bandwidth allocator: split an aggregate throughput target across selected workers.

use super::random::{clamp, signed_unit};
use rand::Rng;

/// Per-worker bounds applied to every allocation, in Mbps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn clamp(&self, value: f64) -> f64 {
        clamp(value, self.min, self.max)
    }
}

/// Relative tolerance under which the running sum counts as on target
const SUM_EPSILON: f64 = 1e-9;
/// Upper bound on redistribution passes; each pass pins at least one worker to a bound
const MAX_REDISTRIBUTE_PASSES: usize = 64;

/// Allocate `target` Mbps across `count` workers.
///
/// Each worker draws a weight in `[0.5, 1.5]` and receives its proportional share, which is
/// clamped, perturbed by `± randomness`, clamped again and rescaled toward the target. A final
/// redistribution moves any remaining gap onto workers that still have headroom. Every value ends
/// inside `bounds`. The sum equals `target` whenever `count × min ≤ target ≤ count × max`,
/// otherwise every worker saturates at the nearer bound.
///
/// Zero workers or a non-positive target yield an empty allocation.
pub fn allocate<R: Rng + ?Sized>(
    target: f64,
    count: usize,
    bounds: Bounds,
    randomness: f64,
    rng: &mut R,
) -> Vec<f64> {
    if count == 0 || !(target > 0.0) {
        return Vec::new();
    }

    let weights: Vec<f64> = (0..count).map(|_| 0.5 + rng.random::<f64>()).collect();
    let weight_sum: f64 = weights.iter().sum();

    let mut allocations: Vec<f64> = weights
        .iter()
        .map(|w| {
            let share = bounds.clamp(target * w / weight_sum);
            let perturbed = share + share * randomness * signed_unit(rng);
            bounds.clamp(perturbed)
        })
        .collect();

    let sum: f64 = allocations.iter().sum();
    if sum > 0.0 && (sum - target).abs() > SUM_EPSILON * target {
        let scale = target / sum;
        for value in allocations.iter_mut() {
            *value = bounds.clamp(*value * scale);
        }
    }

    redistribute(&mut allocations, target, bounds);
    allocations
}

/// Spread the gap between `target` and the current sum over workers that are not pinned at
/// the bound in the direction of the gap, proportionally to their current values.
fn redistribute(allocations: &mut [f64], target: f64, bounds: Bounds) {
    for _ in 0..MAX_REDISTRIBUTE_PASSES {
        let sum: f64 = allocations.iter().sum();
        let gap = target - sum;
        if gap.abs() <= SUM_EPSILON * target {
            return;
        }

        let movable: Vec<usize> = (0..allocations.len())
            .filter(|&i| {
                if gap > 0.0 {
                    allocations[i] < bounds.max
                } else {
                    allocations[i] > bounds.min
                }
            })
            .collect();
        if movable.is_empty() {
            return;
        }

        let movable_sum: f64 = movable.iter().map(|&i| allocations[i]).sum();
        for &i in &movable {
            let share = if movable_sum > 0.0 {
                allocations[i] / movable_sum
            } else {
                1.0 / movable.len() as f64
            };
            allocations[i] = bounds.clamp(allocations[i] + gap * share);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const BOUNDS: Bounds = Bounds {
        min: 400.0,
        max: 1200.0,
    };

    fn assert_within(values: &[f64], bounds: Bounds) {
        for v in values {
            assert!(
                *v >= bounds.min - 1e-9 && *v <= bounds.max + 1e-9,
                "allocation {} outside [{}, {}]",
                v,
                bounds.min,
                bounds.max
            );
        }
    }

    #[test]
    fn test_empty_inputs_give_empty_allocation() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(allocate(10_000.0, 0, BOUNDS, 0.25, &mut rng).is_empty());
        assert!(allocate(0.0, 5, BOUNDS, 0.25, &mut rng).is_empty());
        assert!(allocate(-5.0, 5, BOUNDS, 0.25, &mut rng).is_empty());
    }

    #[test]
    fn test_feasible_target_is_met_exactly() {
        // 8 workers can carry anything in [3200, 9600]
        for seed in 0..300 {
            let mut rng = StdRng::seed_from_u64(seed);
            let values = allocate(7_000.0, 8, BOUNDS, 0.25, &mut rng);
            assert_eq!(values.len(), 8);
            assert_within(&values, BOUNDS);
            let sum: f64 = values.iter().sum();
            assert!(
                (sum - 7_000.0).abs() < 1e-3,
                "seed {}: sum {} misses target",
                seed,
                sum
            );
        }
    }

    #[test]
    fn test_ten_gbps_over_five_workers_saturates_at_upper_bound() {
        // 5 × 1200 = 6000 cannot reach 10000, so every worker pins to the cap
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let values = allocate(10_000.0, 5, BOUNDS, 0.25, &mut rng);
            assert_eq!(values.len(), 5);
            assert_within(&values, BOUNDS);
            let sum: f64 = values.iter().sum();
            assert!((sum - 6_000.0).abs() < 1e-6, "seed {}: sum {}", seed, sum);
        }
    }

    #[test]
    fn test_ten_gbps_over_ten_workers_is_exact() {
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let values = allocate(10_000.0, 10, BOUNDS, 0.25, &mut rng);
            assert_within(&values, BOUNDS);
            let sum: f64 = values.iter().sum();
            assert!((sum - 10_000.0).abs() < 1e-3, "seed {}: sum {}", seed, sum);
        }
    }

    #[test]
    fn test_small_target_floors_at_lower_bound() {
        let mut rng = StdRng::seed_from_u64(3);
        let values = allocate(500.0, 4, BOUNDS, 0.25, &mut rng);
        assert!(values.iter().all(|v| (*v - 400.0).abs() < 1e-9));
    }

    #[test]
    fn test_allocations_vary_between_workers() {
        let mut rng = StdRng::seed_from_u64(8);
        let values = allocate(4_000.0, 5, BOUNDS, 0.25, &mut rng);
        let spread = values.iter().cloned().fold(f64::MIN, f64::max)
            - values.iter().cloned().fold(f64::MAX, f64::min);
        assert!(spread > 1.0, "expected uneven split, got {:?}", values);
    }

    #[test]
    fn test_zero_randomness_still_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(21);
        let values = allocate(3_000.0, 3, BOUNDS, 0.0, &mut rng);
        assert_within(&values, BOUNDS);
        let sum: f64 = values.iter().sum();
        assert!((sum - 3_000.0).abs() < 1e-3);
    }
}
