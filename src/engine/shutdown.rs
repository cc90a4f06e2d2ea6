//! Detection of instances left dangling by a system shutdown.
//!
//! The first pass collects branches flagged with the shutdown engine status
//! and keeps the earliest flagged step of each. The second pass re-reads each
//! branch's current step; only branches that have not moved since are
//! reported, so an instance that progressed between the two reads is not
//! reclaimed.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use super::WorkflowMonitor;
use super::error::MonitorError;
use super::types::WorkflowId;
use crate::storage::ShutdownCandidate;

/// Keep the smallest flagged step per branch, in first-seen branch order.
pub fn most_regressed(candidates: Vec<ShutdownCandidate>) -> Vec<ShutdownCandidate> {
    let mut order: Vec<(WorkflowId, String)> = Vec::new();
    let mut lowest: HashMap<(WorkflowId, String), i64> = HashMap::new();

    for candidate in candidates {
        let key = (candidate.workflow_id, candidate.branch_id);
        match lowest.get_mut(&key) {
            Some(step) => *step = (*step).min(candidate.step),
            None => {
                order.push(key.clone());
                lowest.insert(key, candidate.step);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            let step = lowest.get(&key).copied()?;
            Some(ShutdownCandidate {
                workflow_id: key.0,
                branch_id: key.1,
                step,
            })
        })
        .collect()
}

impl WorkflowMonitor {
    /// Instances with at least one branch still parked at a shutdown marker.
    pub async fn system_shutdown_list(&self) -> Result<Vec<WorkflowId>, MonitorError> {
        let candidates = most_regressed(self.store.shutdown_candidates().await?);
        debug!(candidates = candidates.len(), "Shutdown candidates collected");

        let mut seen = HashSet::new();
        let mut dangling = Vec::new();
        for candidate in candidates {
            let current = self
                .store
                .current_step(candidate.workflow_id, &candidate.branch_id)
                .await?;
            if current != Some(candidate.step) {
                debug!(
                    workflow_id = %candidate.workflow_id,
                    branch_id = %candidate.branch_id,
                    flagged = candidate.step,
                    current = ?current,
                    "Branch progressed after shutdown"
                );
                continue;
            }
            if seen.insert(candidate.workflow_id) {
                dangling.push(candidate.workflow_id);
            }
        }

        info!(count = dangling.len(), "Dangling instances after shutdown");
        Ok(dangling)
    }
}
