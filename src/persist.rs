//! Whole-pensieve save and load.
//!
//! Layout of a saved pensieve:
//!
//! ```text
//! <dir>/parameters.pensieve        global options and adjacency
//! <dir>/memory_keys.pensieve       ordered key list
//! <dir>/<key>/parameters.pensieve  per-memory flags and fingerprint
//! <dir>/<key>/function.pensieve    normalized producer source text
//! <dir>/<key>/content.pensieve     serialized content, absent if stale
//! ```
//!
//! Content that cannot be serialized never fails a save; the memory is
//! saved stale and recomputes on its next read after a load. Producers are
//! not reconstructible from source text, so loaded memories carry none until
//! re-stored; re-storing the same source revalidates the cached content
//! through its fingerprint without running anything.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backup::BackupStore;
use crate::durations::DurationLedger;
use crate::error::PensieveError;
use crate::hash::{Fingerprint, HashProbe, PensieveDefaultHashBuilder};
use crate::memory::Memory;
use crate::pensieve::{GraphDirection, KeyMap, MemoryMap};
use crate::{Content, Key, Pensieve};

const PARAMETERS_FILE: &str = "parameters.pensieve";
const MEMORY_KEYS_FILE: &str = "memory_keys.pensieve";
const FUNCTION_FILE: &str = "function.pensieve";
const CONTENT_FILE: &str = "content.pensieve";

#[derive(Serialize, Deserialize)]
struct PensieveParameters {
    name: String,
    graph_direction: GraphDirection,
    num_threads: usize,
    lazy: bool,
    materialize: bool,
    echo: u8,
    do_hash: bool,
    hide_ignored: bool,
    show_types: bool,
    backup_root: Option<PathBuf>,
    /// Precursor lists per key, in declaration order. Successors are
    /// derived on load, which keeps the symmetry invariant by construction.
    precursors: Vec<(String, Vec<String>)>,
}

/// Content wrapper written to `content.pensieve`.
///
/// The primary codec cannot decode everything it can encode (types that
/// deserialize with `deserialize_any`), so content is round-trip verified
/// at save time and demoted to the self-describing fallback codec when
/// needed. One file either way.
#[derive(Serialize, Deserialize)]
enum StoredContent {
    Primary(Vec<u8>),
    Fallback(String),
}

impl StoredContent {
    fn encode<T: Content>(content: &T) -> Option<StoredContent> {
        if let Ok(bytes) = bincode::serde::encode_to_vec(content, bincode::config::standard()) {
            if bincode::serde::decode_from_slice::<T, _>(&bytes, bincode::config::standard())
                .is_ok()
            {
                return Some(StoredContent::Primary(bytes));
            }
        }
        serde_json::to_string(content).ok().map(StoredContent::Fallback)
    }

    fn decode<T: Content>(self) -> Option<T> {
        match self {
            StoredContent::Primary(bytes) => {
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .ok()
                    .map(|(content, _)| content)
            }
            StoredContent::Fallback(text) => serde_json::from_str(&text).ok(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MemoryParameters {
    stale: bool,
    frozen: bool,
    deep_frozen: bool,
    materialize: bool,
    label: Option<String>,
    metadata: BTreeMap<String, String>,
    fingerprint: Option<Fingerprint>,
    access_count: u64,
    content_type_known: bool,
    last_evaluation: Option<Duration>,
    total_time: Duration,
}

impl<T: Content> Pensieve<T> {
    /// Saves the whole pensieve under a directory.
    ///
    /// Topology, flags, fingerprints, producer sources and serializable
    /// contents all round-trip. Unserializable content demotes its memory
    /// to stale instead of failing the save.
    pub fn save(&self, directory: impl AsRef<Path>) -> Result<(), PensieveError> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory).map_err(|source| PensieveError::Io {
            path: directory.to_owned(),
            source,
        })?;

        let parameters = PensieveParameters {
            name: self.name.clone(),
            graph_direction: self.graph_direction,
            num_threads: self.num_threads,
            lazy: self.lazy,
            materialize: self.materialize,
            echo: self.echo,
            do_hash: self.probe.is_enabled(),
            hide_ignored: self.hide_ignored,
            show_types: self.show_types,
            backup_root: self.backup_root.clone(),
            precursors: self
                .memories
                .keys()
                .map(|key| {
                    (
                        key.to_string(),
                        self.precursor_keys_of(key)
                            .iter()
                            .map(|p| p.to_string())
                            .collect(),
                    )
                })
                .collect(),
        };
        write_bincode(directory.join(PARAMETERS_FILE), &parameters)?;

        let mut memory_keys: Vec<String> = Vec::with_capacity(self.memories.len());
        for (key, memory) in &self.memories {
            let memory_dir = directory.join(key.as_str());
            fs::create_dir_all(&memory_dir).map_err(|source| PensieveError::Io {
                path: memory_dir.clone(),
                source,
            })?;

            let (content, fingerprint, mut stale) = memory.snapshot_state();
            let content_path = memory_dir.join(CONTENT_FILE);
            let mut wrote_content = false;
            if let Some(content) = &content {
                match StoredContent::encode(content) {
                    Some(stored) => {
                        write_bincode(content_path.clone(), &stored)?;
                        wrote_content = true;
                    }
                    None => {
                        warn!(key = %key, "could not serialize content, saving memory as stale");
                    }
                }
            }
            if !wrote_content {
                let _ = fs::remove_file(&content_path);
                stale = true;
            }

            let (last_evaluation, total_time) = memory.timing_state();
            let memory_parameters = MemoryParameters {
                stale,
                frozen: memory.is_frozen(),
                deep_frozen: memory.is_deep_frozen(),
                materialize: memory.is_materialized(),
                label: memory.label().map(str::to_owned),
                metadata: memory.metadata().clone(),
                fingerprint,
                access_count: memory.access_count(),
                content_type_known: memory.content_type().is_some(),
                last_evaluation,
                total_time,
            };
            write_bincode(memory_dir.join(PARAMETERS_FILE), &memory_parameters)?;

            let function_path = memory_dir.join(FUNCTION_FILE);
            match memory.source() {
                Some(source) => {
                    fs::write(&function_path, source).map_err(|source| PensieveError::Io {
                        path: function_path.clone(),
                        source,
                    })?;
                }
                None => {
                    let _ = fs::remove_file(&function_path);
                }
            }
            memory_keys.push(key.to_string());
        }
        write_bincode(directory.join(MEMORY_KEYS_FILE), &memory_keys)?;

        debug!(path = %directory.display(), memories = memory_keys.len(), "saved pensieve");
        Ok(())
    }

    /// Loads a pensieve saved with [`save`][Pensieve::save].
    ///
    /// The graph comes back with every memory reachable; missing or
    /// undecodable content files load the affected memory stale.
    pub fn load(directory: impl AsRef<Path>) -> Result<Pensieve<T>, PensieveError> {
        let directory = directory.as_ref();
        let parameters: PensieveParameters = read_bincode(directory.join(PARAMETERS_FILE))?;
        let memory_keys: Vec<String> = read_bincode(directory.join(MEMORY_KEYS_FILE))?;

        let mut memories = MemoryMap::with_hasher(PensieveDefaultHashBuilder::default());
        for raw in &memory_keys {
            let key = Key::new(raw)?;
            let memory_dir = directory.join(raw);
            let memory_parameters: MemoryParameters =
                read_bincode(memory_dir.join(PARAMETERS_FILE))?;
            let source = fs::read_to_string(memory_dir.join(FUNCTION_FILE)).ok();

            let mut stale = memory_parameters.stale;
            let content: Option<T> = match fs::read(memory_dir.join(CONTENT_FILE)) {
                Ok(bytes) => {
                    let decoded =
                        bincode::serde::decode_from_slice::<StoredContent, _>(
                            &bytes,
                            bincode::config::standard(),
                        )
                        .ok()
                        .and_then(|(stored, _)| stored.decode::<T>());
                    if decoded.is_none() {
                        warn!(key = %raw, "could not decode saved content, loading memory stale");
                        stale = true;
                    }
                    decoded
                }
                Err(_) => {
                    if memory_parameters.materialize {
                        stale = true;
                    }
                    None
                }
            };

            let backup = parameters
                .backup_root
                .as_ref()
                .map(|root| BackupStore::new(root, &key));
            let memory = Memory::from_loaded_parts(
                key.clone(),
                source,
                memory_parameters.materialize,
                memory_parameters.frozen,
                memory_parameters.deep_frozen,
                memory_parameters.label,
                memory_parameters.metadata,
                backup,
                content,
                memory_parameters.fingerprint,
                stale,
                memory_parameters.content_type_known,
                memory_parameters.access_count,
                memory_parameters.last_evaluation,
                memory_parameters.total_time,
            );
            memories.insert(key, memory);
        }

        let mut precursors: KeyMap<Vec<Key>> = KeyMap::default();
        let mut successors: KeyMap<Vec<Key>> = KeyMap::default();
        for key in memories.keys() {
            precursors.insert(key.clone(), Vec::new());
            successors.insert(key.clone(), Vec::new());
        }
        for (child_raw, parent_raws) in &parameters.precursors {
            let Some((child, _)) = memories.get_key_value(child_raw.as_str()) else {
                warn!(key = %child_raw, "saved adjacency refers to an unknown memory");
                continue;
            };
            let child = child.clone();
            let mut parents: Vec<Key> = Vec::with_capacity(parent_raws.len());
            for parent_raw in parent_raws {
                let Some((parent, _)) = memories.get_key_value(parent_raw.as_str()) else {
                    warn!(key = %parent_raw, "saved adjacency refers to an unknown precursor");
                    continue;
                };
                parents.push(parent.clone());
                successors
                    .get_mut(parent_raw.as_str())
                    .expect("successor entries were seeded for every key")
                    .push(child.clone());
            }
            precursors.insert(child, parents);
        }

        let pensieve = Pensieve {
            name: parameters.name,
            memories,
            precursors,
            successors,
            probe: HashProbe::new(parameters.do_hash),
            durations: Arc::new(DurationLedger::new()),
            num_threads: parameters.num_threads,
            lazy: parameters.lazy,
            materialize: parameters.materialize,
            backup_root: parameters.backup_root,
            echo: parameters.echo,
            hide_ignored: parameters.hide_ignored,
            show_types: parameters.show_types,
            graph_direction: parameters.graph_direction,
        };
        debug!(
            path = %directory.display(),
            memories = pensieve.memories.len(),
            "loaded pensieve"
        );
        Ok(pensieve)
    }
}

fn write_bincode<V: Serialize>(path: PathBuf, value: &V) -> Result<(), PensieveError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(
        |error| PensieveError::Codec {
            path: path.clone(),
            reason: error.to_string(),
        },
    )?;
    fs::write(&path, bytes).map_err(|source| PensieveError::Io { path, source })
}

fn read_bincode<V: DeserializeOwned>(path: PathBuf) -> Result<V, PensieveError> {
    let bytes = fs::read(&path).map_err(|source| PensieveError::Io {
        path: path.clone(),
        source,
    })?;
    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|error| PensieveError::Codec {
            path,
            reason: error.to_string(),
        })
}
