//! Selection rules for `ptq clean`.

use chrono::{DateTime, Utc};

use crate::core::job_id::compare_ids;

/// A job considered for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanCandidate {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub running: bool,
}

/// Pick the jobs to remove, newest-first order preserved.
///
/// Running jobs are never eligible unless `include_running` is set. Of the
/// eligible jobs, the `keep` most recently created survive.
pub fn select_for_removal(
    candidates: &[CleanCandidate],
    keep: usize,
    include_running: bool,
) -> Vec<String> {
    let mut eligible: Vec<&CleanCandidate> = candidates
        .iter()
        .filter(|c| include_running || !c.running)
        .collect();
    eligible.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| compare_ids(&b.job_id, &a.job_id))
    });
    eligible
        .into_iter()
        .skip(keep)
        .map(|c| c.job_id.clone())
        .collect()
}
