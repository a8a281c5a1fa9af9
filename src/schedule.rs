//! Wave-front scheduling of stale memories.
//!
//! A schedule is an ordered list of rounds. Every memory in a round has all
//! of its stale precursors in strictly earlier rounds, so the members of one
//! round can be evaluated concurrently while rounds themselves run in
//! sequence.

use std::collections::HashSet;

use crate::error::{PensieveError, StoringError};
use crate::{Content, Key, Pensieve};

/// Builds the update schedule for a set of target keys.
///
/// Jobs are the targets' transitive stale ancestors plus the stale targets
/// themselves, deduplicated in first-seen order. An empty round with jobs
/// remaining means the adjacency tables contain a cycle, which `store`
/// forbids; it is reported as a recursion error rather than looping forever.
pub(crate) fn update_schedule<T: Content>(
    pensieve: &Pensieve<T>,
    targets: &[Key],
) -> Result<Vec<Vec<Key>>, PensieveError> {
    let mut jobs: Vec<Key> = Vec::new();
    let mut seen: HashSet<Key> = HashSet::new();
    for target in targets {
        for ancestor in pensieve.ancestor_keys(target) {
            if pensieve.memory_ref(&ancestor).is_stale() && seen.insert(ancestor.clone()) {
                jobs.push(ancestor);
            }
        }
    }
    for target in targets {
        if pensieve.memory_ref(target).is_stale() && seen.insert(target.clone()) {
            jobs.push(target.clone());
        }
    }

    let mut schedule: Vec<Vec<Key>> = Vec::new();
    let mut completed: HashSet<Key> = HashSet::new();
    while !jobs.is_empty() {
        let (round, blocked): (Vec<Key>, Vec<Key>) = jobs
            .into_iter()
            .partition(|job| ready(pensieve, job, &completed));

        if round.is_empty() {
            // Defensive: unreachable unless the adjacency invariants were
            // violated behind the engine's back.
            let job = blocked[0].clone();
            let precursor = blocking_precursor(pensieve, &job, &completed);
            return Err(StoringError::Recursion {
                key: job.to_string(),
                precursor,
            }
            .into());
        }

        completed.extend(round.iter().cloned());
        schedule.push(round);
        jobs = blocked;
    }
    Ok(schedule)
}

/// A job is ready once every stale precursor sits in a completed round.
fn ready<T: Content>(pensieve: &Pensieve<T>, job: &Key, completed: &HashSet<Key>) -> bool {
    pensieve
        .precursor_keys_of(job)
        .iter()
        .all(|p| !pensieve.memory_ref(p).is_stale() || completed.contains(p))
}

fn blocking_precursor<T: Content>(
    pensieve: &Pensieve<T>,
    job: &Key,
    completed: &HashSet<Key>,
) -> String {
    pensieve
        .precursor_keys_of(job)
        .iter()
        .find(|&p| pensieve.memory_ref(p).is_stale() && !completed.contains(p))
        .map(|p| p.to_string())
        .unwrap_or_default()
}
