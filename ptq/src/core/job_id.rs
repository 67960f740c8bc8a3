//! Job id derivation.
//!
//! Ids are `<YYYYMMDD-HHMMSS>-<identity key>` so they sort by creation time.
//! Uniqueness under concurrent creation comes from the store, which claims
//! candidates from [`candidate_ids`] with an exclusive create.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::core::types::Task;

/// Upper bound on same-second collisions before giving up.
pub const MAX_COLLISION_SUFFIX: u32 = 999;

/// The un-suffixed id for a task created at `created_at`.
pub fn base_job_id(created_at: DateTime<Utc>, task: &Task) -> String {
    format!(
        "{}-{}",
        created_at.format("%Y%m%d-%H%M%S"),
        task.identity_key()
    )
}

/// Candidate ids in claim order: `base`, `base-2`, `base-3`, ...
pub fn candidate_ids(base: &str) -> impl Iterator<Item = String> + '_ {
    (1..=MAX_COLLISION_SUFFIX).map(move |n| {
        if n == 1 {
            base.to_string()
        } else {
            format!("{base}-{n}")
        }
    })
}

/// Order ids with digit runs compared by value, so `base-2` sorts before
/// `base-10` and `base` before both.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        if a.is_empty() || b.is_empty() {
            return a.len().cmp(&b.len());
        }
        let (run_a, rest_a) = split_run(a);
        let (run_b, rest_b) = split_run(b);
        let ord = if is_digits(run_a) && is_digits(run_b) {
            let (ta, tb) = (run_a.trim_start_matches('0'), run_b.trim_start_matches('0'));
            ta.len()
                .cmp(&tb.len())
                .then_with(|| ta.cmp(tb))
                .then_with(|| run_a.len().cmp(&run_b.len()))
        } else {
            run_a.cmp(run_b)
        };
        if ord != Ordering::Equal {
            return ord;
        }
        a = rest_a;
        b = rest_b;
    }
}

fn split_run(s: &str) -> (&str, &str) {
    let digit = s.starts_with(|c: char| c.is_ascii_digit());
    let end = s
        .find(|c: char| c.is_ascii_digit() != digit)
        .unwrap_or(s.len());
    s.split_at(end)
}

fn is_digits(run: &str) -> bool {
    run.starts_with(|c: char| c.is_ascii_digit())
}
