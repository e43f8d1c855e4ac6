//! Concurrency wave: how many workers should be active at a given point of the run.
//!
//! Three slow sinusoids are summed so the active-worker count drifts without an obvious
//! period, then a ±1 step of noise is added on top.

use super::random::clamp;
use rand::Rng;
use std::f64::consts::TAU;
use std::time::Duration;

/// (period in seconds, weight) of each component
const COMPONENTS: [(f64, f64); 3] = [(300.0, 1.0), (180.0, 0.5), (420.0, 0.3)];
const WEIGHT_SUM: f64 = 1.8;

/// Combined periodic signal in `[-1, 1]`
pub fn wave_signal(elapsed: Duration) -> f64 {
    let t = elapsed.as_secs_f64();
    COMPONENTS
        .iter()
        .map(|(period, weight)| weight * (TAU * t / period).sin())
        .sum::<f64>()
        / WEIGHT_SUM
}

/// Desired number of concurrent workers, always within `[min, max]`.
///
/// With `randomness == 0.0` the result is the bare wave, otherwise a step drawn uniformly from
/// `{-1, 0, 1}` is added before the final clamp.
pub fn concurrency_at<R: Rng + ?Sized>(
    elapsed: Duration,
    min: usize,
    max: usize,
    randomness: f64,
    rng: &mut R,
) -> usize {
    if max <= min {
        return min;
    }

    let normalized = clamp((wave_signal(elapsed) + 1.0) / 2.0, 0.0, 1.0);
    let base = min as i64 + ((max - min) as f64 * normalized).floor() as i64;

    let step = if randomness > 0.0 {
        rng.random_range(-1..=1)
    } else {
        0
    };

    clamp(base + step, min as i64, max as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_signal_is_bounded() {
        for secs in (0..3600).step_by(7) {
            let s = wave_signal(Duration::from_secs(secs));
            assert!((-1.0..=1.0).contains(&s), "signal {} at {}s", s, secs);
        }
    }

    #[test]
    fn test_output_always_within_bounds() {
        let mut rng = StdRng::seed_from_u64(99);
        for (min, max) in [(0, 1), (2, 8), (5, 5), (1, 50)] {
            for secs in (0..7200).step_by(13) {
                let n = concurrency_at(Duration::from_secs(secs), min, max, 0.3, &mut rng);
                assert!(
                    n >= min && n <= max,
                    "{} outside [{}, {}] at {}s",
                    n,
                    min,
                    max,
                    secs
                );
            }
        }
    }

    #[test]
    fn test_start_of_run_sits_mid_range() {
        // every sinusoid is zero at t=0, so the wave maps to the midpoint
        let mut rng = StdRng::seed_from_u64(1);
        let n = concurrency_at(Duration::ZERO, 2, 8, 0.0, &mut rng);
        assert_eq!(n, 5);
    }

    #[test]
    fn test_deterministic_for_same_seed() {
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..50)
                .map(|i| concurrency_at(Duration::from_secs(i * 37), 2, 10, 0.5, &mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(17), run(17));
    }

    #[test]
    fn test_wave_actually_varies() {
        let mut rng = StdRng::seed_from_u64(5);
        let values: std::collections::HashSet<_> = (0..120)
            .map(|i| concurrency_at(Duration::from_secs(i * 10), 2, 12, 0.0, &mut rng))
            .collect();
        assert!(values.len() > 3, "wave produced only {:?}", values);
    }

    #[test]
    fn test_noise_moves_at_most_one_step() {
        let mut bare = StdRng::seed_from_u64(0);
        let mut noisy = StdRng::seed_from_u64(31);
        let mut moved = 0;
        for secs in (0..3000).step_by(15) {
            let t = Duration::from_secs(secs);
            let base = concurrency_at(t, 2, 12, 0.0, &mut bare) as i64;
            let n = concurrency_at(t, 2, 12, 0.3, &mut noisy) as i64;
            assert!((n - base).abs() <= 1, "{} vs {} at {}s", n, base, secs);
            if n != base {
                moved += 1;
            }
        }
        assert!(moved > 0, "noise never applied");
    }

    #[test]
    fn test_inverted_bounds_collapse_to_min() {
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(concurrency_at(Duration::from_secs(10), 4, 2, 0.3, &mut rng), 4);
    }
}
