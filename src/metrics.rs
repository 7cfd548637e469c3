/// Read-only aggregation over a registry snapshot for the "active jobs" panel.
use crate::registry::{ActiveJob, JobTallies, RegistrySnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub active: usize,
    pub by_category: BTreeMap<String, usize>,
    /// Active jobs per challenge tag; untagged jobs are not counted.
    pub by_challenge: BTreeMap<String, usize>,
    pub long_running: Vec<ActiveJob>,
    pub totals: JobTallies,
}

impl MetricsReport {
    /// Pure function of the snapshot: jobs whose elapsed time exceeds
    /// `long_running_after` are listed separately.
    pub fn from_snapshot(snapshot: &RegistrySnapshot, long_running_after: Duration) -> Self {
        let mut by_category = BTreeMap::new();
        let mut by_challenge = BTreeMap::new();
        for job in &snapshot.active {
            *by_category.entry(job.category.to_string()).or_insert(0) += 1;
            if let Some(challenge) = &job.challenge {
                *by_challenge.entry(challenge.clone()).or_insert(0) += 1;
            }
        }

        let long_running = snapshot
            .active
            .iter()
            .filter(|job| job.elapsed > long_running_after)
            .cloned()
            .collect();

        Self {
            active: snapshot.active.len(),
            by_category,
            by_challenge,
            long_running,
            totals: snapshot.tallies,
        }
    }
}
