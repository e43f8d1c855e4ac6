//! Randomized helpers shared by the scheduler, wave function and allocator.
//!
//! Every function takes the random source explicitly so callers can seed it.

use rand::Rng;
use std::time::Duration;

/// Stagger jitter as a fraction of the base spacing between two actions
const STAGGER_JITTER: f64 = 0.25;

/// Restrict `value` to `[min, max]`
pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

/// Uniform draw in `[-1, 1)`
pub fn signed_unit<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.random::<f64>() * 2.0 - 1.0
}

/// Pick `count` distinct indices into `weights`, each draw proportional to the remaining weights.
///
/// Returns every index when `count >= weights.len()`. When the remaining weights sum to zero
/// the next index is drawn uniformly. O(count × len).
pub fn weighted_selection<R: Rng + ?Sized>(
    count: usize,
    weights: &[f64],
    rng: &mut R,
) -> Vec<usize> {
    if count >= weights.len() {
        return (0..weights.len()).collect();
    }

    let mut available: Vec<(usize, f64)> = weights
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 0.0 })
        .enumerate()
        .collect();
    let mut selected = Vec::with_capacity(count);

    while selected.len() < count && !available.is_empty() {
        let total: f64 = available.iter().map(|(_, w)| w).sum();

        let pos = if total <= 0.0 {
            rng.random_range(0..available.len())
        } else {
            let draw = rng.random::<f64>() * total;
            let mut cumulative = 0.0;
            available
                .iter()
                .position(|(_, w)| {
                    cumulative += w;
                    cumulative > draw
                })
                // float rounding can leave the draw just past the last bucket
                .unwrap_or(available.len() - 1)
        };

        selected.push(available.remove(pos).0);
    }

    selected
}

/// Delays that spread `count` actions across `total`: action `i` fires near `i × total / count`,
/// moved by up to ±25% of that spacing and never before zero.
pub fn stagger_delays<R: Rng + ?Sized>(count: usize, total: Duration, rng: &mut R) -> Vec<Duration> {
    if count == 0 {
        return Vec::new();
    }

    let base = total.as_secs_f64() / count as f64;
    (0..count)
        .map(|i| {
            let jitter = base * STAGGER_JITTER * signed_unit(rng);
            let delay = (i as f64 * base + jitter).max(0.0);
            Duration::from_secs_f64(delay)
        })
        .collect()
}

/// Uniform draw in `[min, max]`, moved by `± jitter × value`, clamped back into the bounds
pub fn random_interval<R: Rng + ?Sized>(
    min: Duration,
    max: Duration,
    jitter: f64,
    rng: &mut R,
) -> Duration {
    let (min, max) = (min.as_secs_f64(), max.as_secs_f64().max(min.as_secs_f64()));
    let base = min + rng.random::<f64>() * (max - min);
    let jittered = base + base * jitter * signed_unit(rng);
    Duration::from_secs_f64(clamp(jittered, min, max))
}
