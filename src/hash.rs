//! Structural fingerprinting of producer sources and precursor chains.

use std::fmt::{self, Display, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::Key;

/// The stable hasher used for fingerprints and the internal key maps.
///
/// `FixedState` is deterministic within a build, so fingerprints survive
/// serializing and deserializing a memory. They are not guaranteed stable
/// across architectures or compiler versions.
pub type PensieveDefaultHashBuilder = foldhash::fast::FixedState;

/// A short structural hash identifying one produced content.
///
/// A memory's fingerprint covers its producer's normalized source text and
/// the fingerprints of its precursors, in declared order. Fingerprinting the
/// precursors' fingerprints rather than their contents lets the cache chain
/// without re-serializing large payloads at every level of the graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// A fingerprint guaranteed to match nothing produced before it.
    ///
    /// Used when hashing is disabled, so that every evaluation is treated
    /// as novel.
    pub(crate) fn nonce() -> Fingerprint {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Fingerprint(foldhash::fast::RandomState::default().hash_one(n))
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Digest of raw bytes, used as a source surrogate for content stores.
pub(crate) fn content_digest(bytes: &[u8]) -> u64 {
    PensieveDefaultHashBuilder::default().hash_one(bytes)
}

/// Computes fingerprints for the evaluation protocol.
///
/// A disabled probe returns a fresh nonce for every request, which defeats
/// all cache reuse. Useful for debugging suspected stale-cache problems.
#[derive(Debug, Clone, Copy)]
pub struct HashProbe {
    enabled: bool,
}

impl HashProbe {
    pub fn new(enabled: bool) -> HashProbe {
        HashProbe { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Folds a producer's source text and its ordered precursor fingerprints
    /// into one candidate fingerprint.
    pub fn fingerprint(&self, source: &str, parents: &[(Key, Fingerprint)]) -> Fingerprint {
        if !self.enabled {
            return Fingerprint::nonce();
        }
        let mut hasher = PensieveDefaultHashBuilder::default().build_hasher();
        source.hash(&mut hasher);
        for (key, print) in parents {
            key.as_str().hash(&mut hasher);
            print.0.hash(&mut hasher);
        }
        Fingerprint(hasher.finish())
    }

    /// Fallback fingerprint for content that was produced without one, taken
    /// over the content's serialized bytes.
    pub(crate) fn of_bytes(&self, bytes: &[u8]) -> Fingerprint {
        if !self.enabled {
            return Fingerprint::nonce();
        }
        Fingerprint(content_digest(bytes))
    }
}

impl Default for HashProbe {
    fn default() -> Self {
        HashProbe::new(true)
    }
}
