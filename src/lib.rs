//! # Pensieve
//!
//! An in-process incremental computation engine. You declare named
//! *memories*, each produced by a pure function of zero or more *precursor*
//! memories; the engine forms a directed acyclic graph, evaluates memories
//! on demand, caches their contents, invalidates dependents when inputs
//! change, and schedules independent evaluations in parallel. It is the
//! computational skeleton that otherwise gets hand-wired out of ad-hoc
//! memoized functions.
//!
//! ## Concepts
//!
//! ### Memories & precursors
//!
//! A [`Memory`] is one node of the graph: a key, a producer function, and a
//! cached content. Producers come in three arities, declared with the
//! [`producer!`] macro or the [`Producer`] constructors: no precursors
//! (a root), one precursor (the function receives that content), or many
//! (the function receives an [`EvaluationInput`] view, or named locals when
//! declared through the macro). The [`Pensieve`] owns all memories, arena
//! style; adjacency lives in the pensieve's own tables, not in the nodes.
//!
//! ### Staleness & fingerprints
//!
//! Storing over a memory marks it and every transitive successor stale.
//! A read of a stale memory first resolves its precursors, then computes a
//! candidate [`Fingerprint`] over the producer's source text and the
//! precursors' fingerprints. If the candidate matches the fingerprint the
//! content was last produced under, the cache is revalidated without running
//! anything; fingerprinting the *source text* rather than the closure means
//! a textually identical re-declaration costs nothing, and fingerprinting
//! the precursors' *fingerprints* rather than their contents means the check
//! never re-serializes large payloads. Only a genuine miss runs the
//! producer.
//!
//! ### Freezing
//!
//! A frozen memory refuses mutation and serves its last content even while
//! stale. Deep-freezing is permanent and discards the producer. Freezing is
//! orthogonal to staleness: stale propagation keeps flowing through frozen
//! memories to their descendants.
//!
//! ### Materialization
//!
//! A memory stored with `materialize = false` never retains content; every
//! read re-invokes the producer. Useful for cheap derivations of large
//! intermediates.
//!
//! ### Backup
//!
//! With a backup root configured, each materialized memory mirrors its
//! content and fingerprint to disk and can revalidate from there after a
//! process restart. The backup is advisory: any I/O or codec failure is
//! just a cache miss.
//!
//! ### Parallel evaluation
//!
//! [`Pensieve::evaluate`] groups the stale ancestry of its targets into
//! wave-front rounds. Memories within a round share no edges and run
//! concurrently on a worker pool; rounds run in sequence.
//!
//! ## Quick start
//!
//! ```
//! use pensieve::{producer, Pensieve};
//!
//! let mut pensieve = Pensieve::<i64>::new();
//! pensieve.store("a", producer!(() => 1))?;
//! pensieve.store("b", producer!((a) => a + 2))?;
//! pensieve.store("c", producer!((b) => b + 4))?;
//! pensieve.store("d", producer!((c) => c + 8))?;
//! assert_eq!(pensieve.recall("d")?, 15);
//!
//! // Re-pointing `a` at a new value invalidates the whole chain.
//! pensieve.store("a", producer!(() => 100))?;
//! assert!(pensieve.memory("d")?.is_stale());
//! assert_eq!(pensieve.recall("d")?, 114);
//! # Ok::<(), pensieve::PensieveError>(())
//! ```
//!
//! ## Content types
//!
//! A pensieve is generic over one content type `T`, bounded by the
//! [`Content`] blanket trait (cloneable, serializable, thread-safe).
//! Heterogeneous graphs use an enum or `serde_json::Value` as `T`. Reads
//! return owned clones, so user code can never mutate the cached copy.

pub mod backup;
pub mod durations;
pub mod error;
pub mod hash;
pub mod memory;
pub mod producer;

mod pensieve;
mod persist;
mod schedule;

use std::borrow::Borrow;
use std::fmt::Debug;

use derive_more::{Deref, Display};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::backup::BackupStore;
pub use crate::durations::{DurationLedger, DurationSink, KeyDurations};
pub use crate::error::{PensieveError, StoringError};
pub use crate::hash::{Fingerprint, HashProbe, PensieveDefaultHashBuilder};
pub use crate::memory::{Memory, MemorySummary};
pub use crate::pensieve::{GraphDirection, Pensieve, PensieveBuilder, StoreOptions};
pub use crate::producer::{EvaluationInput, Producer};

/// What a pensieve can remember: any cloneable, serializable, thread-safe
/// value. Implemented automatically.
pub trait Content:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Content for T where
    T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Operation names that can never be memory keys, so that key-addressed
/// surfaces (display collaborators, saved layouts) stay unambiguous.
pub const RESERVED_KEYS: &[&str] = &[
    "store",
    "store_with",
    "store_content",
    "recall",
    "erase",
    "evaluate",
    "evaluate_all",
    "update_schedule",
    "freeze",
    "unfreeze",
    "deep_freeze",
    "merge",
    "save",
    "load",
    "keys",
    "memory",
    "memories",
    "ancestors",
    "descendants",
    "summary",
    "summaries",
    "contains",
    "name",
];

/// A validated memory key.
///
/// Keys are non-empty identifiers matching `[A-Za-z][A-Za-z0-9_]*` and are
/// not allowed to collide with [`RESERVED_KEYS`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, Display)]
#[display("{_0}")]
pub struct Key(String);

impl Key {
    pub fn new(raw: &str) -> Result<Key, StoringError> {
        let mut chars = raw.chars();
        let legal = match chars.next() {
            Some(first) => {
                first.is_ascii_alphabetic()
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if !legal || RESERVED_KEYS.contains(&raw) {
            return Err(StoringError::IllegalKey {
                key: raw.to_owned(),
            });
        }
        Ok(Key(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Key {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Key {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
