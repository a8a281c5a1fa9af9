mod util;

use pensieve::{producer, Pensieve, PensieveError};
use serde::{Deserialize, Serialize};
use util::*;

#[test]
fn save_load_round_trips_topology_and_contents() -> Result<(), PensieveError> {
    let dir = tempfile::tempdir().unwrap();
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.store("b", producer!((a) => a + 2))?;
    pensieve.store("c", producer!((b) => b + 4))?;
    pensieve.store("d", producer!((c) => c + 8))?;
    assert_eq!(pensieve.recall("d")?, 15);

    pensieve.save(dir.path())?;
    let loaded = Pensieve::<i64>::load(dir.path())?;

    assert_eq!(
        loaded.keys().collect::<Vec<_>>(),
        pensieve.keys().collect::<Vec<_>>()
    );
    assert_eq!(loaded.precursor_keys("d")?, ["c"]);
    assert_eq!(loaded.successor_keys("a")?, ["b"]);
    assert_eq!(loaded.ancestors("d")?, ["c", "b", "a"]);

    // Contents were preserved, so reads work without any producers.
    assert!(!loaded.memory("d")?.is_stale());
    assert_eq!(loaded.recall("d")?, 15);
    Ok(())
}

#[test]
fn save_writes_the_documented_layout() -> Result<(), PensieveError> {
    let dir = tempfile::tempdir().unwrap();
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.save(dir.path())?;

    assert!(dir.path().join("parameters.pensieve").is_file());
    assert!(dir.path().join("memory_keys.pensieve").is_file());
    assert!(dir.path().join("a").join("parameters.pensieve").is_file());
    assert!(dir.path().join("a").join("function.pensieve").is_file());
    assert!(dir.path().join("a").join("content.pensieve").is_file());
    Ok(())
}

// After a load, producers are gone, but re-storing the same source text
// revalidates the cached content through its fingerprint without running.
#[test]
fn fingerprints_survive_save_and_load() -> Result<(), PensieveError> {
    let dir = tempfile::tempdir().unwrap();
    let mut pensieve = Pensieve::<i64>::new();
    let (producer, counter) = counted_value("41", 41);
    pensieve.store("x", producer)?;
    assert_eq!(count_of(&counter), 1);
    pensieve.save(dir.path())?;

    let mut loaded = Pensieve::<i64>::load(dir.path())?;
    let (again, again_counter) = counted_value("41", 41);
    loaded.store("x", again)?;

    assert_eq!(loaded.recall("x")?, 41);
    assert_eq!(count_of(&again_counter), 0);
    Ok(())
}

#[test]
fn stale_memories_load_without_content() -> Result<(), PensieveError> {
    let dir = tempfile::tempdir().unwrap();
    let mut pensieve = lazy_pensieve();
    pensieve.store("x", producer!(() => 41))?;
    pensieve.save(dir.path())?;

    let mut loaded = Pensieve::<i64>::load(dir.path())?;
    assert!(loaded.memory("x")?.is_stale());

    // Stale plus no producer: unreadable until re-stored.
    assert!(matches!(
        loaded.recall("x"),
        Err(PensieveError::MissingContent(key)) if key == "x"
    ));

    loaded.store("x", producer!(() => 41))?;
    assert_eq!(loaded.recall("x")?, 41);
    Ok(())
}

/// A content type whose serialization can be refused on purpose.
#[derive(Clone, Debug, PartialEq)]
enum Flaky {
    Good(i64),
    Refuses,
}

impl Serialize for Flaky {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Flaky::Good(value) => serializer.serialize_i64(*value),
            Flaky::Refuses => Err(serde::ser::Error::custom("refuses serialization")),
        }
    }
}

impl<'de> Deserialize<'de> for Flaky {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i64::deserialize(deserializer).map(Flaky::Good)
    }
}

// Unserializable content must not fail a save; the memory is saved stale
// and recomputes after a load.
#[test]
fn unserializable_content_saves_as_stale() -> Result<(), PensieveError> {
    let dir = tempfile::tempdir().unwrap();
    let mut pensieve = Pensieve::<Flaky>::new();
    pensieve.store("good", producer!(() => Flaky::Good(1)))?;
    pensieve.store("bad", producer!(() => Flaky::Refuses))?;
    assert!(!pensieve.memory("bad")?.is_stale());

    pensieve.save(dir.path())?;
    let loaded = Pensieve::<Flaky>::load(dir.path())?;

    assert!(!loaded.memory("good")?.is_stale());
    assert_eq!(loaded.recall("good")?, Flaky::Good(1));

    assert!(loaded.memory("bad")?.is_stale());
    assert!(matches!(
        loaded.recall("bad"),
        Err(PensieveError::MissingContent(_))
    ));
    Ok(())
}

// Self-describing contents cannot round-trip the primary codec; the save
// falls back to the self-describing one and still reproduces them.
#[test]
fn json_contents_round_trip_through_the_fallback_codec() -> Result<(), PensieveError> {
    let dir = tempfile::tempdir().unwrap();
    let mut pensieve = Pensieve::<serde_json::Value>::new();
    pensieve.store_content("config", serde_json::json!({ "answer": 41, "tags": ["x"] }))?;
    pensieve.save(dir.path())?;

    let loaded = Pensieve::<serde_json::Value>::load(dir.path())?;
    assert!(!loaded.memory("config")?.is_stale());
    assert_eq!(
        loaded.recall("config")?,
        serde_json::json!({ "answer": 41, "tags": ["x"] })
    );
    Ok(())
}

#[test]
fn backups_revalidate_across_pensieve_instances() -> Result<(), PensieveError> {
    let root = tempfile::tempdir().unwrap();

    let mut first: Pensieve<i64> = Pensieve::<i64>::builder().backup(root.path()).build();
    let (producer, counter) = counted_value("41", 41);
    first.store("x", producer)?;
    assert_eq!(count_of(&counter), 1);

    let backup_dir = root.path().join("memories").join("x");
    assert!(backup_dir.join("x_content.bin").is_file());
    assert!(backup_dir.join("x_hash.bin").is_file());

    // A brand new pensieve with the same backup root and the same source
    // restores from disk instead of running the producer.
    let mut second: Pensieve<i64> = Pensieve::<i64>::builder().backup(root.path()).build();
    let (again, again_counter) = counted_value("41", 41);
    second.store("x", again)?;
    assert_eq!(second.recall("x")?, 41);
    assert_eq!(count_of(&again_counter), 0);
    Ok(())
}

#[test]
fn backup_falls_back_to_the_secondary_codec() -> Result<(), PensieveError> {
    let root = tempfile::tempdir().unwrap();
    let mut pensieve: Pensieve<serde_json::Value> =
        Pensieve::<serde_json::Value>::builder().backup(root.path()).build();
    pensieve.store_content("config", serde_json::json!({ "answer": 41 }))?;

    let backup_dir = root.path().join("memories").join("config");
    assert!(backup_dir.join("config_content.json").is_file());
    assert!(!backup_dir.join("config_content.bin").exists());
    assert!(backup_dir.join("config_hash.bin").is_file());

    let mut fresh: Pensieve<serde_json::Value> =
        Pensieve::<serde_json::Value>::builder().backup(root.path()).build();
    fresh.store_content("config", serde_json::json!({ "answer": 41 }))?;
    assert_eq!(
        fresh.recall("config")?,
        serde_json::json!({ "answer": 41 })
    );
    Ok(())
}

#[test]
fn losing_the_backup_only_forces_recomputation() -> Result<(), PensieveError> {
    let root = tempfile::tempdir().unwrap();
    let mut first: Pensieve<i64> = Pensieve::<i64>::builder().backup(root.path()).build();
    let (producer, _) = counted_value("41", 41);
    first.store("x", producer)?;

    std::fs::remove_dir_all(root.path().join("memories")).unwrap();

    let mut second: Pensieve<i64> = Pensieve::<i64>::builder().backup(root.path()).build();
    let (again, again_counter) = counted_value("41", 41);
    second.store("x", again)?;
    assert_eq!(second.recall("x")?, 41);
    assert_eq!(count_of(&again_counter), 1);
    Ok(())
}
