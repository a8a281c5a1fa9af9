//! The memory graph container.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::durations::{DurationLedger, DurationSink};
use crate::error::{PensieveError, StoringError};
use crate::hash::{Fingerprint, HashProbe, PensieveDefaultHashBuilder};
use crate::memory::{Memory, MemorySummary};
use crate::producer::Producer;
use crate::schedule;
use crate::{Content, Key};

pub(crate) type KeyMap<V> = HashMap<Key, V, PensieveDefaultHashBuilder>;
pub(crate) type MemoryMap<T> = IndexMap<Key, Memory<T>, PensieveDefaultHashBuilder>;

/// Orientation hint consumed by display collaborators. The engine only
/// stores it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GraphDirection {
    #[default]
    LeftRight,
    RightLeft,
    TopBottom,
    BottomTop,
}

impl Display for GraphDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GraphDirection::LeftRight => "LR",
            GraphDirection::RightLeft => "RL",
            GraphDirection::TopBottom => "TB",
            GraphDirection::BottomTop => "BT",
        })
    }
}

/// Per-store overrides of the pensieve-level defaults.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub(crate) evaluate: Option<bool>,
    pub(crate) materialize: Option<bool>,
    pub(crate) label: Option<String>,
    pub(crate) metadata: Option<BTreeMap<String, String>>,
}

impl StoreOptions {
    pub fn new() -> StoreOptions {
        StoreOptions::default()
    }

    /// Evaluate the memory immediately after storing. Defaults to the
    /// inverse of the pensieve's `lazy` flag.
    pub fn evaluate(mut self, evaluate: bool) -> StoreOptions {
        self.evaluate = Some(evaluate);
        self
    }

    /// Retain computed content. `false` means the memory recomputes on
    /// every read. Defaults to the pensieve's `materialize` flag for new
    /// memories, and to the memory's current flag on re-store.
    pub fn materialize(mut self, materialize: bool) -> StoreOptions {
        self.materialize = Some(materialize);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> StoreOptions {
        self.label = Some(label.into());
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> StoreOptions {
        self.metadata = Some(metadata);
        self
    }
}

/// Construction options for a [`Pensieve`]. See the crate docs for the
/// meaning of each flag.
pub struct PensieveBuilder {
    name: String,
    durations: Option<Arc<dyn DurationSink>>,
    hide_ignored: bool,
    graph_direction: GraphDirection,
    num_threads: i32,
    lazy: bool,
    materialize: bool,
    backup: Option<PathBuf>,
    echo: u8,
    do_hash: bool,
    show_types: bool,
}

impl Default for PensieveBuilder {
    fn default() -> Self {
        PensieveBuilder {
            name: "Pensieve".to_owned(),
            durations: None,
            hide_ignored: false,
            graph_direction: GraphDirection::default(),
            num_threads: 1,
            lazy: false,
            materialize: true,
            backup: None,
            echo: 0,
            do_hash: true,
            show_types: true,
        }
    }
}

impl PensieveBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The sink that receives one measurement per producer invocation.
    /// Defaults to a fresh [`DurationLedger`].
    pub fn function_durations(mut self, sink: Arc<dyn DurationSink>) -> Self {
        self.durations = Some(sink);
        self
    }

    /// Hide never-read memories from display collaborators.
    pub fn hide_ignored(mut self, hide: bool) -> Self {
        self.hide_ignored = hide;
        self
    }

    pub fn graph_direction(mut self, direction: GraphDirection) -> Self {
        self.graph_direction = direction;
        self
    }

    /// Worker count for `evaluate`. 1 is purely sequential, -1 picks the
    /// host's available parallelism.
    pub fn num_threads(mut self, num_threads: i32) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Default the `evaluate` flag of `store` to false.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Default `materialize` flag for new memories.
    pub fn materialize(mut self, materialize: bool) -> Self {
        self.materialize = materialize;
        self
    }

    /// Enable the per-memory disk backup under the given root.
    pub fn backup(mut self, root: impl Into<PathBuf>) -> Self {
        self.backup = Some(root.into());
        self
    }

    /// Progress verbosity. Levels above zero promote round progress from
    /// debug to info events.
    pub fn echo(mut self, echo: u8) -> Self {
        self.echo = echo;
        self
    }

    /// When false, fingerprints are random nonces and every evaluation is
    /// treated as novel. For debugging suspected stale caches.
    pub fn do_hash(mut self, do_hash: bool) -> Self {
        self.do_hash = do_hash;
        self
    }

    /// Show content types in display collaborators.
    pub fn show_types(mut self, show: bool) -> Self {
        self.show_types = show;
        self
    }

    pub fn build<T: Content>(self) -> Pensieve<T> {
        let num_threads = match self.num_threads {
            -1 => std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            n if n >= 1 => n as usize,
            other => {
                warn!(num_threads = other, "invalid worker count, running sequentially");
                1
            }
        };
        Pensieve {
            name: self.name,
            memories: MemoryMap::with_hasher(PensieveDefaultHashBuilder::default()),
            precursors: KeyMap::with_hasher(PensieveDefaultHashBuilder::default()),
            successors: KeyMap::with_hasher(PensieveDefaultHashBuilder::default()),
            probe: HashProbe::new(self.do_hash),
            durations: self
                .durations
                .unwrap_or_else(|| Arc::new(DurationLedger::new())),
            num_threads,
            lazy: self.lazy,
            materialize: self.materialize,
            backup_root: self.backup,
            echo: self.echo,
            hide_ignored: self.hide_ignored,
            show_types: self.show_types,
            graph_direction: self.graph_direction,
        }
    }
}

/// A DAG of named memories with demand-driven, cached, parallelizable
/// evaluation.
///
/// The pensieve is the sole owner of its memories, arena style. Memories
/// carry only their own key; all parent and child lookups go through the
/// adjacency tables kept here, which are the single source of truth for the
/// graph's shape.
///
/// Structural mutation (`store`, `erase`, freeze toggles) requires
/// `&mut self`, so the borrow checker serializes it against evaluation.
/// Reads (`recall`, `evaluate`) take `&self` and may run concurrently.
pub struct Pensieve<T: Content> {
    pub(crate) name: String,
    pub(crate) memories: MemoryMap<T>,
    pub(crate) precursors: KeyMap<Vec<Key>>,
    pub(crate) successors: KeyMap<Vec<Key>>,
    pub(crate) probe: HashProbe,
    pub(crate) durations: Arc<dyn DurationSink>,
    pub(crate) num_threads: usize,
    pub(crate) lazy: bool,
    pub(crate) materialize: bool,
    pub(crate) backup_root: Option<PathBuf>,
    pub(crate) echo: u8,
    pub(crate) hide_ignored: bool,
    pub(crate) show_types: bool,
    pub(crate) graph_direction: GraphDirection,
}

impl<T: Content> Default for Pensieve<T> {
    fn default() -> Self {
        Pensieve::new()
    }
}

impl<T: Content> Pensieve<T> {
    /// A sequential, eager, materializing pensieve with default options.
    pub fn new() -> Pensieve<T> {
        PensieveBuilder::default().build()
    }

    pub fn builder() -> PensieveBuilder {
        PensieveBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.memories.contains_key(key)
    }

    /// Keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.memories.keys().map(Key::as_str)
    }

    /// Shared introspection handle on one memory.
    pub fn memory(&self, key: &str) -> Result<&Memory<T>, PensieveError> {
        self.memories
            .get(key)
            .ok_or_else(|| PensieveError::MissingMemory(key.to_owned()))
    }

    pub fn function_durations(&self) -> &Arc<dyn DurationSink> {
        &self.durations
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn graph_direction(&self) -> GraphDirection {
        self.graph_direction
    }

    pub fn hides_ignored(&self) -> bool {
        self.hide_ignored
    }

    pub fn shows_types(&self) -> bool {
        self.show_types
    }

    // ---------------------------------------------------------------------
    // Storing.
    // ---------------------------------------------------------------------

    /// Stores a memory under `key`, creating it or updating it in place.
    ///
    /// The producer's declared precursor keys become the memory's precursor
    /// list. Every precursor must already exist, the key must be legal, and
    /// the new edges must not close a cycle; any precondition failure leaves
    /// the pensieve exactly as it was. On success the memory and all of its
    /// descendants are marked stale, and the memory is evaluated immediately
    /// unless the pensieve is lazy.
    pub fn store(&mut self, key: &str, producer: Producer<T>) -> Result<(), PensieveError> {
        self.store_with(key, producer, StoreOptions::default())
    }

    /// [`store`][Pensieve::store] with explicit overrides of the
    /// pensieve-level defaults.
    pub fn store_with(
        &mut self,
        key: &str,
        producer: Producer<T>,
        options: StoreOptions,
    ) -> Result<(), PensieveError> {
        let key = Key::new(key)?;

        // Resolve and deduplicate the declared precursors.
        let mut precursors: Vec<Key> = Vec::with_capacity(producer.precursor_names().len());
        let mut unknown: Vec<String> = Vec::new();
        for raw in producer.precursor_names() {
            match self.memories.get_key_value(raw.as_str()) {
                Some((existing, _)) => {
                    if precursors.contains(existing) {
                        warn!(key = %key, precursor = %existing, "removed duplicate precursor");
                    } else {
                        precursors.push(existing.clone());
                    }
                }
                None => unknown.push(format!("\"{raw}\"")),
            }
        }
        if !unknown.is_empty() {
            return Err(StoringError::UnknownPrecursor {
                key: key.to_string(),
                precursors: unknown.join(", "),
            }
            .into());
        }

        // Reject edges that would close a cycle, walking each precursor's
        // ancestry through the current adjacency.
        for precursor in &precursors {
            if *precursor == key || self.ancestor_keys(precursor).contains(&key) {
                return Err(StoringError::Recursion {
                    key: key.to_string(),
                    precursor: precursor.to_string(),
                }
                .into());
            }
        }

        if let Some(existing) = self.memories.get(key.as_str()) {
            if existing.is_frozen() {
                return Err(PensieveError::FrozenMemory(key.to_string()));
            }
        }

        // All preconditions hold; mutation starts here.
        let materialize = match self.memories.get(key.as_str()) {
            Some(memory) => options.materialize.unwrap_or(memory.is_materialized()),
            None => options.materialize.unwrap_or(self.materialize),
        };
        let evaluate = options.evaluate.unwrap_or(!self.lazy);

        if self.memories.contains_key(key.as_str()) {
            let old = self.precursors.get(&key).cloned().unwrap_or_default();
            for removed in old.iter().filter(|&p| !precursors.contains(p)) {
                if let Some(children) = self.successors.get_mut(removed) {
                    children.retain(|child| child != &key);
                }
            }
            for added in precursors.iter().filter(|&p| !old.contains(p)) {
                self.successors
                    .get_mut(added)
                    .expect("precursor existence checked above")
                    .push(key.clone());
            }
            self.precursors.insert(key.clone(), precursors);
            let memory = self
                .memories
                .get_mut(key.as_str())
                .expect("existence checked above");
            memory.apply_update(producer, materialize, options.label, options.metadata);
        } else {
            let backup = self
                .backup_root
                .as_ref()
                .map(|root| BackupStore::new(root, &key));
            let memory = Memory::new(
                key.clone(),
                producer,
                materialize,
                options.label,
                options.metadata.unwrap_or_default(),
                backup,
            );
            for precursor in &precursors {
                self.successors
                    .get_mut(precursor)
                    .expect("precursor existence checked above")
                    .push(key.clone());
            }
            self.precursors.insert(key.clone(), precursors);
            self.successors.insert(key.clone(), Vec::new());
            self.memories.insert(key.clone(), memory);
        }

        self.mark_stale_cascade(&key);
        debug!(key = %key, "stored memory");

        if evaluate && materialize {
            self.memory_ref(&key).read(self)?;
        }
        Ok(())
    }

    /// Shorthand for storing a plain value: a nullary producer returning a
    /// clone of `content`, with materialization forced on. The fingerprint
    /// surrogate is derived from the serialized content, so re-storing an
    /// equal value does not invalidate descendants' caches.
    pub fn store_content(&mut self, key: &str, content: T) -> Result<(), PensieveError> {
        let surrogate = match bincode::serde::encode_to_vec(&content, bincode::config::standard())
        {
            Ok(bytes) => format!("content:{:016x}", crate::hash::content_digest(&bytes)),
            Err(_) => format!("content:{}", Fingerprint::nonce()),
        };
        let producer = Producer::nullary(surrogate, move || Ok(content.clone()));
        self.store_with(key, producer, StoreOptions::new().materialize(true))
    }

    // ---------------------------------------------------------------------
    // Reading and evaluating.
    // ---------------------------------------------------------------------

    /// Returns the content of a memory, recomputing whatever part of its
    /// ancestry is stale.
    ///
    /// With more than one worker configured, the stale ancestry is first
    /// driven through schedule rounds on a worker pool; the final gather
    /// then runs against warm caches.
    pub fn recall(&self, key: &str) -> Result<T, PensieveError> {
        let memory = self
            .memories
            .get(key)
            .ok_or_else(|| PensieveError::MissingMemory(key.to_owned()))?;
        if self.num_threads != 1 && memory.is_stale() {
            self.evaluate_keys(std::slice::from_ref(memory.key()))?;
        }
        memory.read(self)
    }

    /// Forces evaluation of the listed memories.
    pub fn evaluate(&self, keys: &[&str]) -> Result<(), PensieveError> {
        let keys = self.resolve_keys(keys)?;
        self.evaluate_keys(&keys)
    }

    /// Forces evaluation of every memory.
    pub fn evaluate_all(&self) -> Result<(), PensieveError> {
        let keys: Vec<Key> = self.memories.keys().cloned().collect();
        self.evaluate_keys(&keys)
    }

    /// The wave-front schedule that an `evaluate` of `keys` would execute,
    /// as rounds of mutually independent stale memories.
    pub fn update_schedule(&self, keys: &[&str]) -> Result<Vec<Vec<String>>, PensieveError> {
        let keys = self.resolve_keys(keys)?;
        Ok(schedule::update_schedule(self, &keys)?
            .into_iter()
            .map(|round| round.into_iter().map(|key| key.to_string()).collect())
            .collect())
    }

    fn evaluate_keys(&self, keys: &[Key]) -> Result<(), PensieveError> {
        if self.num_threads == 1 {
            for key in keys {
                self.memory_ref(key).read(self)?;
            }
            return Ok(());
        }

        let rounds = schedule::update_schedule(self, keys)?;
        if rounds.is_empty() {
            return Ok(());
        }
        // A fresh pool per evaluate call; workers only ever write to the
        // memory they were handed, so shared state stays read-only.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .map_err(PensieveError::WorkerPool)?;
        for (index, round) in rounds.iter().enumerate() {
            if self.echo > 0 {
                info!(round = index, memories = round.len(), "updating memories");
            } else {
                debug!(round = index, memories = round.len(), "updating memories");
            }
            let failure: Mutex<Option<PensieveError>> = Mutex::new(None);
            pool.scope(|scope| {
                for key in round {
                    let failure = &failure;
                    scope.spawn(move |_| {
                        if let Err(error) = self.memory_ref(key).read(self) {
                            failure.lock().get_or_insert(error);
                        }
                    });
                }
            });
            // The scope waited for every worker in the round; on failure the
            // remaining rounds are simply never launched.
            if let Some(error) = failure.into_inner() {
                return Err(error);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Erasing and freezing.
    // ---------------------------------------------------------------------

    /// Removes a memory and purges its key from the adjacency lists of every
    /// peer. Former descendants are marked stale, since their input set
    /// changed.
    pub fn erase(&mut self, key: &str) -> Result<(), PensieveError> {
        let key = self.lookup(key)?.clone();
        let descendants = self.descendant_keys(&key);

        self.memories.shift_remove(key.as_str());
        if let Some(children) = self.successors.remove(&key) {
            for child in children {
                if let Some(parents) = self.precursors.get_mut(&child) {
                    parents.retain(|parent| parent != &key);
                }
            }
        }
        if let Some(parents) = self.precursors.remove(&key) {
            for parent in parents {
                if let Some(children) = self.successors.get_mut(&parent) {
                    children.retain(|child| child != &key);
                }
            }
        }

        for descendant in &descendants {
            self.memory_ref(descendant).mark_stale();
        }
        debug!(key = %key, "erased memory");
        Ok(())
    }

    /// Forbids mutation of a memory. Reads serve the last content even while
    /// the memory is stale.
    pub fn freeze(&mut self, key: &str) -> Result<(), PensieveError> {
        self.freeze_inner(key, false)
    }

    /// Freezes permanently and discards the producer.
    pub fn deep_freeze(&mut self, key: &str) -> Result<(), PensieveError> {
        self.freeze_inner(key, true)
    }

    fn freeze_inner(&mut self, key: &str, forever: bool) -> Result<(), PensieveError> {
        let memory = self
            .memories
            .get_mut(key)
            .ok_or_else(|| PensieveError::MissingMemory(key.to_owned()))?;
        memory.freeze(forever);
        Ok(())
    }

    /// Unfreezes a memory. If it is stale, staleness is re-propagated to its
    /// descendants. Deep-frozen memories stay frozen, with a warning.
    pub fn unfreeze(&mut self, key: &str) -> Result<(), PensieveError> {
        let memory = self
            .memories
            .get_mut(key)
            .ok_or_else(|| PensieveError::MissingMemory(key.to_owned()))?;
        if !memory.unfreeze() {
            warn!(key, "ignoring unfreeze of a deep-frozen memory");
            return Ok(());
        }
        let key = memory.key().clone();
        if self.memory_ref(&key).is_stale() {
            self.mark_stale_cascade(&key);
        }
        Ok(())
    }

    pub fn freeze_all(&mut self) {
        for memory in self.memories.values_mut() {
            memory.freeze(false);
        }
    }

    pub fn deep_freeze_all(&mut self) {
        for memory in self.memories.values_mut() {
            memory.freeze(true);
        }
    }

    pub fn unfreeze_all(&mut self) {
        let keys: Vec<Key> = self.memories.keys().cloned().collect();
        for key in keys {
            // Key presence was just read off the map.
            let _ = self.unfreeze(key.as_str());
        }
    }

    // ---------------------------------------------------------------------
    // Topology.
    // ---------------------------------------------------------------------

    /// Declared precursor keys of one memory, in order.
    pub fn precursor_keys(&self, key: &str) -> Result<Vec<String>, PensieveError> {
        let key = self.lookup(key)?;
        Ok(self.precursor_keys_of(key).iter().map(|k| k.to_string()).collect())
    }

    /// Successor keys of one memory, in edge insertion order.
    pub fn successor_keys(&self, key: &str) -> Result<Vec<String>, PensieveError> {
        let key = self.lookup(key)?;
        Ok(self
            .successors
            .get(key)
            .map(|children| children.iter().map(|k| k.to_string()).collect())
            .unwrap_or_default())
    }

    /// Transitive precursors, deduplicated, in first-seen depth-first order.
    pub fn ancestors(&self, key: &str) -> Result<Vec<String>, PensieveError> {
        let key = self.lookup(key)?.clone();
        Ok(self
            .ancestor_keys(&key)
            .iter()
            .map(|k| k.to_string())
            .collect())
    }

    /// Transitive successors, deduplicated, in first-seen depth-first order.
    pub fn descendants(&self, key: &str) -> Result<Vec<String>, PensieveError> {
        let key = self.lookup(key)?.clone();
        Ok(self
            .descendant_keys(&key)
            .iter()
            .map(|k| k.to_string())
            .collect())
    }

    /// A point-in-time report of one memory, including its precursor list.
    pub fn summary(&self, key: &str) -> Result<MemorySummary, PensieveError> {
        let key = self.lookup(key)?.clone();
        let precursors = self
            .precursor_keys_of(&key)
            .iter()
            .map(|k| k.to_string())
            .collect();
        Ok(self.memory_ref(&key).summary(precursors))
    }

    /// Summaries of every memory, in declaration order.
    pub fn summaries(&self) -> Vec<MemorySummary> {
        self.memories
            .keys()
            .map(|key| {
                let precursors = self
                    .precursor_keys_of(key)
                    .iter()
                    .map(|k| k.to_string())
                    .collect();
                self.memory_ref(key).summary(precursors)
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Merging.
    // ---------------------------------------------------------------------

    /// Combines two pensieves into a new one carrying this side's options.
    ///
    /// Keys unique to either side are moved over with their edges. For a
    /// shared key, the side that declares precursors wins; if both sides do,
    /// the merge fails with [`PensieveError::MergeConflict`]. Every shared
    /// or overwritten memory comes out stale, as do its descendants. The
    /// combined graph is re-checked for cycles before it is returned.
    pub fn merge(mut self, mut other: Pensieve<T>) -> Result<Pensieve<T>, PensieveError> {
        let mut memories = MemoryMap::with_hasher(PensieveDefaultHashBuilder::default());
        let mut precursors = KeyMap::with_hasher(PensieveDefaultHashBuilder::default());
        let mut stale: Vec<Key> = Vec::new();

        let left_keys: Vec<Key> = self.memories.keys().cloned().collect();
        for key in left_keys {
            let left_memory = self
                .memories
                .shift_remove(key.as_str())
                .expect("key was just listed");
            let left_precursors = self.precursors.remove(&key).unwrap_or_default();

            if let Some(right_memory) = other.memories.shift_remove(key.as_str()) {
                let right_precursors = other.precursors.remove(&key).unwrap_or_default();
                let (winner, winner_precursors) = if right_precursors.is_empty() {
                    (left_memory, left_precursors)
                } else if left_precursors.is_empty() {
                    (right_memory, right_precursors)
                } else {
                    return Err(PensieveError::MergeConflict(key.to_string()));
                };
                stale.push(key.clone());
                precursors.insert(key.clone(), winner_precursors);
                memories.insert(key, winner);
            } else {
                if left_memory.is_stale() {
                    stale.push(key.clone());
                }
                precursors.insert(key.clone(), left_precursors);
                memories.insert(key, left_memory);
            }
        }

        let right_keys: Vec<Key> = other.memories.keys().cloned().collect();
        for key in right_keys {
            let memory = other
                .memories
                .shift_remove(key.as_str())
                .expect("key was just listed");
            let right_precursors = other.precursors.remove(&key).unwrap_or_default();
            if memory.is_stale() {
                stale.push(key.clone());
            }
            precursors.insert(key.clone(), right_precursors);
            memories.insert(key, memory);
        }

        // Successors are rebuilt wholesale from the precursor lists, which
        // restores the symmetry invariant no matter how the sides overlapped.
        let mut successors = KeyMap::with_hasher(PensieveDefaultHashBuilder::default());
        for key in memories.keys() {
            successors.insert(key.clone(), Vec::new());
        }
        for child in memories.keys() {
            for parent in precursors.get(child).map(Vec::as_slice).unwrap_or(&[]) {
                successors
                    .get_mut(parent)
                    .expect("precursor keys come from a merged side")
                    .push(child.clone());
            }
        }

        let merged = Pensieve {
            name: self.name,
            memories,
            precursors,
            successors,
            probe: self.probe,
            durations: self.durations,
            num_threads: self.num_threads,
            lazy: self.lazy,
            materialize: self.materialize,
            backup_root: self.backup_root,
            echo: self.echo,
            hide_ignored: self.hide_ignored,
            show_types: self.show_types,
            graph_direction: self.graph_direction,
        };

        // Two individually acyclic pensieves can still merge into a cycle.
        if let Some((key, precursor)) = merged.find_cycle() {
            return Err(StoringError::Recursion {
                key: key.to_string(),
                precursor: precursor.to_string(),
            }
            .into());
        }

        for key in stale {
            merged.mark_stale_cascade(&key);
        }
        Ok(merged)
    }

    // ---------------------------------------------------------------------
    // Internal plumbing.
    // ---------------------------------------------------------------------

    fn lookup(&self, raw: &str) -> Result<&Key, PensieveError> {
        self.memories
            .get_key_value(raw)
            .map(|(key, _)| key)
            .ok_or_else(|| PensieveError::MissingMemory(raw.to_owned()))
    }

    fn resolve_keys(&self, raw: &[&str]) -> Result<Vec<Key>, PensieveError> {
        raw.iter()
            .copied()
            .map(|raw| self.lookup(raw).cloned())
            .collect()
    }

    pub(crate) fn memory_ref(&self, key: &Key) -> &Memory<T> {
        self.memories
            .get(key.as_str())
            .expect("adjacency tables refer to a missing memory")
    }

    pub(crate) fn precursor_keys_of(&self, key: &Key) -> &[Key] {
        self.precursors.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn probe(&self) -> &HashProbe {
        &self.probe
    }

    pub(crate) fn durations(&self) -> &dyn DurationSink {
        self.durations.as_ref()
    }

    pub(crate) fn ancestor_keys(&self, key: &Key) -> Vec<Key> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        collect_relatives(&self.precursors, key, &mut seen, &mut out);
        out
    }

    pub(crate) fn descendant_keys(&self, key: &Key) -> Vec<Key> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        collect_relatives(&self.successors, key, &mut seen, &mut out);
        out
    }

    /// Marks a memory and all of its descendants stale.
    pub(crate) fn mark_stale_cascade(&self, key: &Key) {
        self.memory_ref(key).mark_stale();
        for descendant in self.descendant_keys(key) {
            self.memory_ref(&descendant).mark_stale();
        }
    }

    /// Kahn's algorithm over the precursor lists; returns an offending
    /// (key, precursor) edge if the graph is cyclic.
    fn find_cycle(&self) -> Option<(Key, Key)> {
        let mut remaining: KeyMap<usize> =
            KeyMap::with_hasher(PensieveDefaultHashBuilder::default());
        for key in self.memories.keys() {
            remaining.insert(key.clone(), self.precursor_keys_of(key).len());
        }
        let mut ready: Vec<Key> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| key.clone())
            .collect();
        let mut processed = 0;
        while let Some(key) = ready.pop() {
            processed += 1;
            for child in self.successors.get(&key).map(Vec::as_slice).unwrap_or(&[]) {
                let count = remaining.get_mut(child).expect("key sets are identical");
                *count -= 1;
                if *count == 0 {
                    ready.push(child.clone());
                }
            }
        }
        if processed == self.memories.len() {
            return None;
        }
        let stuck = self
            .memories
            .keys()
            .find(|key| remaining.get(*key).copied().unwrap_or(0) > 0)
            .expect("a cycle leaves at least one unprocessed key");
        let precursor = self
            .precursor_keys_of(stuck)
            .iter()
            .find(|p| remaining.get(*p).copied().unwrap_or(0) > 0)
            .unwrap_or(stuck);
        Some((stuck.clone(), precursor.clone()))
    }
}

fn collect_relatives(
    adjacency: &KeyMap<Vec<Key>>,
    key: &Key,
    seen: &mut HashSet<Key>,
    out: &mut Vec<Key>,
) {
    let Some(neighbors) = adjacency.get(key) else {
        return;
    };
    for neighbor in neighbors {
        if seen.insert(neighbor.clone()) {
            out.push(neighbor.clone());
            collect_relatives(adjacency, neighbor, seen, out);
        }
    }
}

/// Topologically sorted text listing in the form
/// `[precursors] --> key (stale)`.
impl<T: Content> Display for Pensieve<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.memories.is_empty() {
            return f.write_str("<empty graph>");
        }

        // Kahn's algorithm, visiting keys in declaration order for a stable
        // listing.
        let mut remaining: KeyMap<usize> =
            KeyMap::with_hasher(PensieveDefaultHashBuilder::default());
        for key in self.memories.keys() {
            remaining.insert(key.clone(), self.precursor_keys_of(key).len());
        }
        let mut sorted: Vec<&Key> = Vec::with_capacity(self.memories.len());
        let mut frontier: Vec<&Key> = self
            .memories
            .keys()
            .filter(|key| remaining[*key] == 0)
            .collect();
        while !frontier.is_empty() {
            frontier.sort_by_key(|key| self.memories.get_index_of(key.as_str()));
            let mut next: Vec<&Key> = Vec::new();
            for key in frontier {
                sorted.push(key);
                for child in self.successors.get(key).map(Vec::as_slice).unwrap_or(&[]) {
                    let count = remaining.get_mut(child).expect("key sets are identical");
                    *count -= 1;
                    if *count == 0 {
                        next.push(self.lookup(child.as_str()).expect("key sets are identical"));
                    }
                }
            }
            frontier = next;
        }

        let lines: Vec<(String, &Key, bool)> = sorted
            .iter()
            .map(|key| {
                let parents = self
                    .precursor_keys_of(key)
                    .iter()
                    .map(Key::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                (parents, *key, self.memory_ref(key).is_stale())
            })
            .collect();
        let left_width = lines.iter().map(|(p, _, _)| p.len()).max().unwrap_or(0);
        let right_width = lines.iter().map(|(_, k, _)| k.len()).max().unwrap_or(0);

        for (index, (parents, key, stale)) in lines.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{:>left_width$} --> {:<right_width$}{}",
                parents,
                key.as_str(),
                if *stale { " (stale)" } else { "" }
            )?;
        }
        Ok(())
    }
}

impl<T: Content> fmt::Debug for Pensieve<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pensieve")
            .field("name", &self.name)
            .field("memories", &self.memories.len())
            .finish_non_exhaustive()
    }
}
