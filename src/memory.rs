//! One node of the memory graph.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::backup::BackupStore;
use crate::error::PensieveError;
use crate::hash::Fingerprint;
use crate::producer::{EvaluationInput, Producer};
use crate::{Content, Key, Pensieve};

/// A named, cached, recomputable node of a [`Pensieve`].
///
/// A memory holds only its own key; parent and child relationships live in
/// the pensieve's adjacency tables. Structural state (the producer, freeze
/// flags, materialization) is mutated through `&mut Pensieve` operations,
/// while the evaluation slot sits behind a lock so reads can run through
/// `&self`, including concurrently from schedule rounds.
pub struct Memory<T> {
    key: Key,
    producer: Option<Producer<T>>,
    /// Source text retained when the producer itself is gone (deep-frozen or
    /// loaded from disk), so saves and fingerprints stay stable.
    dormant_source: Option<String>,
    materialize: bool,
    frozen: bool,
    deep_frozen: bool,
    label: Option<String>,
    metadata: BTreeMap<String, String>,
    backup: Option<BackupStore>,
    access_count: AtomicU64,
    slot: RwLock<Slot<T>>,
}

/// The mutable evaluation state of one memory.
struct Slot<T> {
    content: Option<T>,
    fingerprint: Option<Fingerprint>,
    stale: bool,
    content_type: Option<&'static str>,
    last_evaluation: Option<Duration>,
    total_time: Duration,
    size: Option<u64>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot {
            content: None,
            fingerprint: None,
            stale: true,
            content_type: None,
            last_evaluation: None,
            total_time: Duration::ZERO,
            size: None,
        }
    }
}

struct Produced<T> {
    content: T,
    fingerprint: Fingerprint,
}

/// A point-in-time report of one memory's state.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub key: String,
    pub content_type: Option<String>,
    pub materialized: bool,
    pub frozen: bool,
    pub deep_frozen: bool,
    pub stale: bool,
    pub access_count: u64,
    pub evaluation_time: Option<Duration>,
    pub total_time: Duration,
    pub size: Option<u64>,
    pub fingerprint: Option<String>,
    pub label: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub precursors: Vec<String>,
}

impl<T: Content> Memory<T> {
    pub(crate) fn new(
        key: Key,
        producer: Producer<T>,
        materialize: bool,
        label: Option<String>,
        metadata: BTreeMap<String, String>,
        backup: Option<BackupStore>,
    ) -> Memory<T> {
        Memory {
            key,
            producer: Some(producer),
            dormant_source: None,
            materialize,
            frozen: false,
            deep_frozen: false,
            label,
            metadata,
            backup,
            access_count: AtomicU64::new(0),
            slot: RwLock::new(Slot::default()),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Whether the next read would recompute. Non-materialized memories
    /// recompute on every read, so they are trivially always stale.
    pub fn is_stale(&self) -> bool {
        if !self.materialize {
            return true;
        }
        self.slot.read().stale
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn is_deep_frozen(&self) -> bool {
        self.deep_frozen
    }

    pub fn is_materialized(&self) -> bool {
        self.materialize
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// The fingerprint recorded the last time content was produced.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.slot.read().fingerprint
    }

    /// Display name of the cached content's type, if any was ever produced.
    pub fn content_type(&self) -> Option<&'static str> {
        self.slot.read().content_type
    }

    /// The producer's normalized source text, if known.
    pub fn source(&self) -> Option<&str> {
        self.producer
            .as_ref()
            .map(Producer::source)
            .or(self.dormant_source.as_deref())
    }

    pub(crate) fn summary(&self, precursors: Vec<String>) -> MemorySummary {
        let mut slot = self.slot.write();
        if slot.size.is_none() {
            slot.size = slot.content.as_ref().and_then(|content| {
                bincode::serde::encode_to_vec(content, bincode::config::standard())
                    .ok()
                    .map(|bytes| bytes.len() as u64)
            });
        }
        MemorySummary {
            key: self.key.to_string(),
            content_type: slot.content_type.map(str::to_owned),
            materialized: self.materialize,
            frozen: self.frozen,
            deep_frozen: self.deep_frozen,
            stale: if self.materialize { slot.stale } else { true },
            access_count: self.access_count(),
            evaluation_time: slot.last_evaluation,
            total_time: slot.total_time,
            size: slot.size,
            fingerprint: slot.fingerprint.map(|fp| fp.to_string()),
            label: self.label.clone(),
            metadata: self.metadata.clone(),
            precursors,
        }
    }

    // ---------------------------------------------------------------------
    // Structural mutation, reached through `&mut Pensieve` only.
    // ---------------------------------------------------------------------

    pub(crate) fn apply_update(
        &mut self,
        producer: Producer<T>,
        materialize: bool,
        label: Option<String>,
        metadata: Option<BTreeMap<String, String>>,
    ) {
        self.producer = Some(producer);
        self.dormant_source = None;
        self.materialize = materialize;
        if let Some(label) = label {
            self.label = Some(label);
        }
        if let Some(metadata) = metadata {
            self.metadata = metadata;
        }
        // The previous fingerprint is kept on purpose: if the new producer's
        // source and inputs hash to the same value, the next read revalidates
        // the cached content instead of recomputing.
    }

    pub(crate) fn freeze(&mut self, forever: bool) {
        self.frozen = true;
        if forever {
            self.deep_frozen = true;
            if let Some(producer) = self.producer.take() {
                let (source, _precursors) = producer.into_parts();
                self.dormant_source = Some(source);
            }
        }
    }

    /// Returns false when the memory is deep-frozen and stays frozen.
    pub(crate) fn unfreeze(&mut self) -> bool {
        if self.deep_frozen {
            return false;
        }
        self.frozen = false;
        true
    }

    pub(crate) fn mark_stale(&self) {
        let mut slot = self.slot.write();
        slot.stale = true;
        slot.size = None;
    }

    // ---------------------------------------------------------------------
    // Evaluation.
    // ---------------------------------------------------------------------

    /// Resolves this memory's content, recomputing if it is stale.
    pub(crate) fn read(&self, pensieve: &Pensieve<T>) -> Result<T, PensieveError> {
        self.read_with_fingerprint(pensieve)
            .map(|(content, _)| content)
    }

    /// Like [`read`][Memory::read], but also reports the fingerprint the
    /// content was produced under, for use in a successor's candidate hash.
    pub(crate) fn read_with_fingerprint(
        &self,
        pensieve: &Pensieve<T>,
    ) -> Result<(T, Fingerprint), PensieveError> {
        self.access_count.fetch_add(1, Ordering::Relaxed);

        // Frozen memories serve their last content regardless of staleness
        // and never run their producer again, except to pin an initial
        // snapshot if they were frozen before ever producing one.
        if self.frozen {
            {
                let slot = self.slot.read();
                if let Some(content) = &slot.content {
                    let print = slot
                        .fingerprint
                        .unwrap_or_else(|| self.content_fingerprint(pensieve, content));
                    return Ok((content.clone(), print));
                }
            }
            let produced = self.produce(pensieve)?;
            let mut slot = self.slot.write();
            slot.content = Some(produced.content.clone());
            slot.fingerprint = Some(produced.fingerprint);
            slot.content_type = Some(short_type_name::<T>());
            slot.size = None;
            return Ok((produced.content, produced.fingerprint));
        }

        if self.materialize {
            let slot = self.slot.read();
            if !slot.stale {
                if let Some(content) = &slot.content {
                    let print = slot
                        .fingerprint
                        .unwrap_or_else(|| self.content_fingerprint(pensieve, content));
                    return Ok((content.clone(), print));
                }
            }
        }

        let produced = self.produce(pensieve)?;
        if self.materialize {
            let mut slot = self.slot.write();
            slot.content = Some(produced.content.clone());
            slot.fingerprint = Some(produced.fingerprint);
            slot.stale = false;
            slot.content_type = Some(short_type_name::<T>());
            slot.size = None;
        }
        Ok((produced.content, produced.fingerprint))
    }

    /// The computation protocol: gather precursors, compute the candidate
    /// fingerprint, then reuse the cache, reuse the backup, or invoke the
    /// producer, in that order.
    fn produce(&self, pensieve: &Pensieve<T>) -> Result<Produced<T>, PensieveError> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| PensieveError::MissingContent(self.key.to_string()))?;

        // Precursor contents are gathered sequentially in declared order;
        // parallel wave-fronts have already run by the time this is reached
        // from a multi-threaded evaluate call.
        let precursors = pensieve.precursor_keys_of(&self.key).to_vec();
        let mut parent_prints = Vec::with_capacity(precursors.len());
        let mut gathered = Vec::with_capacity(precursors.len());
        for precursor in precursors {
            let parent = pensieve.memory_ref(&precursor);
            let (content, print) = parent.read_with_fingerprint(pensieve)?;
            parent_prints.push((precursor.clone(), print));
            gathered.push((precursor, content));
        }

        let candidate = pensieve
            .probe()
            .fingerprint(producer.source(), &parent_prints);

        if self.materialize {
            let slot = self.slot.read();
            if slot.fingerprint == Some(candidate) {
                if let Some(content) = &slot.content {
                    trace!(key = %self.key, fingerprint = %candidate, "fingerprint match, reusing cache");
                    return Ok(Produced {
                        content: content.clone(),
                        fingerprint: candidate,
                    });
                }
            }
        }

        if self.materialize {
            if let Some(backup) = &self.backup {
                if backup.load_hash() == Some(candidate) {
                    if let Some(content) = backup.load_content::<T>() {
                        debug!(key = %self.key, fingerprint = %candidate, "restored content from backup");
                        return Ok(Produced {
                            content,
                            fingerprint: candidate,
                        });
                    }
                }
            }
        }

        let inputs = EvaluationInput::new(gathered);
        let start = Instant::now();
        let content = producer
            .invoke(inputs)
            .map_err(|source| PensieveError::Evaluation {
                key: self.key.to_string(),
                source,
            })?;
        let elapsed = start.elapsed();
        pensieve.durations().record(self.key.as_str(), elapsed);
        {
            let mut slot = self.slot.write();
            slot.last_evaluation = Some(elapsed);
            slot.total_time += elapsed;
        }
        debug!(key = %self.key, ?elapsed, "evaluated memory");

        if self.materialize {
            if let Some(backup) = &self.backup {
                if self.slot.read().fingerprint != Some(candidate) {
                    backup.store_content(&content);
                    backup.store_hash(candidate);
                }
            }
        }

        Ok(Produced {
            content,
            fingerprint: candidate,
        })
    }

    /// Fingerprint for content that carries none, taken over its serialized
    /// bytes. Only reachable for hand-assembled states such as loads from
    /// partially written saves.
    fn content_fingerprint(&self, pensieve: &Pensieve<T>, content: &T) -> Fingerprint {
        match bincode::serde::encode_to_vec(content, bincode::config::standard()) {
            Ok(bytes) => pensieve.probe().of_bytes(&bytes),
            Err(_) => Fingerprint::nonce(),
        }
    }

    // ---------------------------------------------------------------------
    // Persistence plumbing.
    // ---------------------------------------------------------------------

    pub(crate) fn snapshot_state(&self) -> (Option<T>, Option<Fingerprint>, bool) {
        let slot = self.slot.read();
        (slot.content.clone(), slot.fingerprint, slot.stale)
    }

    pub(crate) fn timing_state(&self) -> (Option<Duration>, Duration) {
        let slot = self.slot.read();
        (slot.last_evaluation, slot.total_time)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_loaded_parts(
        key: Key,
        source: Option<String>,
        materialize: bool,
        frozen: bool,
        deep_frozen: bool,
        label: Option<String>,
        metadata: BTreeMap<String, String>,
        backup: Option<BackupStore>,
        content: Option<T>,
        fingerprint: Option<Fingerprint>,
        stale: bool,
        content_type_known: bool,
        access_count: u64,
        last_evaluation: Option<Duration>,
        total_time: Duration,
    ) -> Memory<T> {
        Memory {
            key,
            producer: None,
            dormant_source: source,
            materialize,
            frozen,
            deep_frozen,
            label,
            metadata,
            backup,
            access_count: AtomicU64::new(access_count),
            slot: RwLock::new(Slot {
                stale: stale || (materialize && content.is_none()),
                content_type: content_type_known.then(short_type_name::<T>),
                content,
                fingerprint,
                last_evaluation,
                total_time,
                size: None,
            }),
        }
    }
}

/// The unqualified name of a content type, for display.
pub(crate) fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
