//! The pensieve error taxonomy.
//!
//! Precondition failures are raised from [`Pensieve::store`][crate::Pensieve::store]
//! before any state is touched; state violations are raised at the mutation
//! call; user producer failures are wrapped once in [`PensieveError::Evaluation`]
//! with the original error chain intact.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The root error type for all pensieve operations.
#[derive(Debug, Error)]
pub enum PensieveError {
    /// A read referenced a key with no memory behind it.
    #[error("the \"{0}\" memory does not exist")]
    MissingMemory(String),

    /// A `store` precondition failed. No state was mutated.
    #[error(transparent)]
    Storing(#[from] StoringError),

    /// An attempt to mutate a frozen memory.
    #[error("the \"{0}\" memory is frozen and cannot be changed")]
    FrozenMemory(String),

    /// A user producer function returned an error. The memory is left stale.
    #[error("evaluating the \"{key}\" memory failed")]
    Evaluation {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// A stale memory was read but has no producer to recompute with.
    ///
    /// This happens for deep-frozen memories that never produced content,
    /// and for loaded memories whose producer has not been re-stored.
    #[error("the \"{0}\" memory has no content and no function to produce it")]
    MissingContent(String),

    /// Two pensieves being merged both define precursors for the same key.
    #[error("the \"{0}\" memory has precursors in both pensieves")]
    MergeConflict(String),

    /// Filesystem failure during save or load.
    #[error("pensieve I/O failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A saved pensieve file exists but could not be decoded.
    #[error("could not decode {}: {reason}", path.display())]
    Codec { path: PathBuf, reason: String },

    /// The evaluation worker pool could not be started.
    #[error("could not start the evaluation worker pool")]
    WorkerPool(#[source] rayon::ThreadPoolBuildError),
}

/// Precondition failures raised by `store` (and, defensively, by `merge`).
#[derive(Debug, Error)]
pub enum StoringError {
    /// The key is empty, malformed, or collides with a pensieve operation.
    #[error("\"{key}\" cannot be used as a memory key")]
    IllegalKey { key: String },

    /// One or more declared precursors do not exist yet.
    #[error("error storing \"{key}\": unknown precursor memories: {precursors}")]
    UnknownPrecursor { key: String, precursors: String },

    /// Adding the declared edges would make the graph cyclic.
    #[error("\"{key}\" is an ancestor of its precursor \"{precursor}\"")]
    Recursion { key: String, precursor: String },
}
