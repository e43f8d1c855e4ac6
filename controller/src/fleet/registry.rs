//! Worker registry: the configured fleet plus per-worker usage, and weighted selection over it.

use super::random::{clamp, weighted_selection};
use super::state::{WorkerDescriptor, WorkerId, WorkerStatus};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Minutes of idleness that earn a recency factor of 1.0
const RECENCY_MINUTES: f64 = 10.0;
const RECENCY_MIN: f64 = 0.5;
const RECENCY_MAX: f64 = 2.0;
/// Multiplier for workers whose region does not dominate the active set
const REGION_DIVERSITY_BONUS: f64 = 1.5;

/// One entry per configured worker, created at startup and never purged
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    descriptors: Vec<WorkerDescriptor>,
    statuses: HashMap<WorkerId, WorkerStatus>,
}

impl WorkerRegistry {
    pub fn new(descriptors: Vec<WorkerDescriptor>) -> Self {
        let statuses = descriptors
            .iter()
            .map(|d| (d.id.clone(), WorkerStatus::new(d)))
            .collect();
        Self {
            descriptors,
            statuses,
        }
    }

    pub fn descriptors(&self) -> &[WorkerDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: &str) -> Option<&WorkerDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    pub fn status(&self, id: &str) -> Option<&WorkerStatus> {
        self.statuses.get(id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Declared capacity, or `None` for ids outside the configuration
    pub fn capacity(&self, id: &str) -> Option<f64> {
        self.descriptor(id).map(|d| d.max_throughput)
    }

    /// Mark a worker as just started. Unknown ids are ignored.
    pub fn record_start(&mut self, id: &str, now: Instant) {
        if let Some(status) = self.statuses.get_mut(id) {
            status.last_used = Some(now);
            status.use_count += 1;
        }
    }

    /// Regions held by more than half of the active workers
    pub fn overused_regions<'a>(&self, active: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        let mut total = 0usize;
        let mut per_region: HashMap<&str, usize> = HashMap::new();
        for id in active {
            total += 1;
            if let Some(region) = self.statuses.get(id).and_then(|s| s.region.as_deref()) {
                *per_region.entry(region).or_default() += 1;
            }
        }

        per_region
            .into_iter()
            .filter(|(_, n)| n * 2 > total)
            .map(|(region, _)| region.to_string())
            .collect()
    }

    /// Selection weight: capacity in Gbps × recency factor × region bonus
    pub fn weight(
        &self,
        descriptor: &WorkerDescriptor,
        overused: &HashSet<String>,
        now: Instant,
    ) -> f64 {
        let recency = match self.statuses.get(&descriptor.id).and_then(|s| s.last_used) {
            Some(at) => {
                let idle = now.saturating_duration_since(at);
                clamp(minutes(idle) / RECENCY_MINUTES, RECENCY_MIN, RECENCY_MAX)
            }
            None => RECENCY_MAX,
        };

        let region_factor = match &descriptor.region {
            Some(region) if overused.contains(region) => 1.0,
            _ => REGION_DIVERSITY_BONUS,
        };

        descriptor.max_throughput / 1000.0 * recency * region_factor
    }

    /// Choose `count` distinct connected workers, weighted by [`Self::weight`].
    ///
    /// Only configured ids in `connected` are candidates. `active` lists the ids currently
    /// holding an allocation and drives the region balance. Returns every candidate when
    /// `count` covers them all and nothing when none are connected.
    pub fn select<'a, R: Rng + ?Sized>(
        &self,
        count: usize,
        connected: &HashSet<String>,
        active: impl IntoIterator<Item = &'a str>,
        now: Instant,
        rng: &mut R,
    ) -> Vec<WorkerId> {
        let candidates: Vec<&WorkerDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| connected.contains(&d.id))
            .collect();
        if candidates.is_empty() || count == 0 {
            return Vec::new();
        }

        let overused = self.overused_regions(active);
        let weights: Vec<f64> = candidates
            .iter()
            .map(|d| self.weight(d, &overused, now))
            .collect();

        weighted_selection(count, &weights, rng)
            .into_iter()
            .map(|i| candidates[i].id.clone())
            .collect()
    }
}

fn minutes(d: Duration) -> f64 {
    d.as_secs_f64() / 60.0
}
