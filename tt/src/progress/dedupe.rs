//! Stop code deduplication against already-tracked stops

use std::collections::HashSet;
use tracing::debug;

/// Codes in `completed` that are not yet in `already_tracked`
///
/// Keeps the order of `completed` and drops repeats.
pub fn new_stop_codes(completed: &[String], already_tracked: &[String]) -> Vec<String> {
    debug!(
        completed = completed.len(),
        already_tracked = already_tracked.len(),
        "new_stop_codes: called"
    );
    let mut seen: HashSet<&str> = already_tracked.iter().map(String::as_str).collect();
    completed
        .iter()
        .filter(|code| seen.insert(code.as_str()))
        .cloned()
        .collect()
}

/// The tracked list after a poll: previous codes followed by the new ones
pub fn extend_tracked(already_tracked: &[String], new_codes: &[String]) -> Vec<String> {
    let mut tracked = already_tracked.to_vec();
    tracked.extend(new_stop_codes(new_codes, already_tracked));
    tracked
}
