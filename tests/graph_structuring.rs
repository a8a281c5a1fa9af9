mod util;

use pensieve::{producer, Pensieve, PensieveError, Producer, StoringError};
use util::*;

#[test]
fn chain_propagation() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.store("b", producer!((a) => a + 2))?;
    pensieve.store("c", producer!((b) => b + 4))?;
    pensieve.store("d", producer!((c) => c + 8))?;

    assert_eq!(pensieve.recall("d")?, 15);
    Ok(())
}

#[test]
fn gathered_inputs_by_view() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("root1", producer!(() => 5))?;
    pensieve.store("root2", producer!(() => 8))?;
    pensieve.store(
        "child",
        Producer::gathered(["root1", "root2"], "root1 + root2", |inputs| {
            Ok(inputs["root1"] + inputs["root2"])
        }),
    )?;

    assert_eq!(pensieve.recall("child")?, 13);
    Ok(())
}

#[test]
fn adjacency_stays_symmetric() -> Result<(), PensieveError> {
    let mut pensieve = lazy_pensieve();
    pensieve.store("r", producer!(() => 1))?;
    pensieve.store("a", producer!((r) => r + 1))?;
    pensieve.store("b", producer!((r) => r + 2))?;
    pensieve.store("j", producer!((a, b) => a + b))?;

    let keys: Vec<String> = pensieve.keys().map(str::to_owned).collect();
    for key in &keys {
        for precursor in pensieve.precursor_keys(key)? {
            assert!(pensieve.successor_keys(&precursor)?.contains(key));
        }
        for successor in pensieve.successor_keys(key)? {
            assert!(pensieve.precursor_keys(&successor)?.contains(key));
        }
    }
    Ok(())
}

#[test]
fn updating_parents_reroutes_edges() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("root1", producer!(() => 1))?;
    pensieve.store("root2", producer!(() => 3))?;
    pensieve.store("child", producer!((root1) => root1 + 5))?;
    assert_eq!(pensieve.recall("child")?, 6);

    pensieve.store("child", producer!((root2) => root2 + 5))?;
    assert_eq!(pensieve.recall("child")?, 8);

    assert!(pensieve.successor_keys("root1")?.is_empty());
    assert_eq!(pensieve.successor_keys("root2")?, ["child"]);
    assert_eq!(pensieve.precursor_keys("child")?, ["root2"]);
    Ok(())
}

#[test]
fn unknown_precursors_are_rejected_before_mutation() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("root", producer!(() => 1))?;

    let error = pensieve
        .store("child", producer!((root, other) => root + other))
        .unwrap_err();
    assert!(matches!(
        error,
        PensieveError::Storing(StoringError::UnknownPrecursor { .. })
    ));
    assert!(!pensieve.contains("child"));
    assert!(pensieve.successor_keys("root")?.is_empty());
    Ok(())
}

#[test]
fn illegal_keys_are_rejected() {
    let mut pensieve = Pensieve::<i64>::new();
    for bad in ["", "2fast", "_private", "with space", "store", "recall"] {
        let error = pensieve.store(bad, producer!(() => 1)).unwrap_err();
        assert!(
            matches!(
                error,
                PensieveError::Storing(StoringError::IllegalKey { .. })
            ),
            "expected {bad:?} to be illegal"
        );
    }
    assert!(pensieve.is_empty());
}

#[test]
fn cycles_are_rejected_and_state_is_unchanged() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.store("b", producer!((a) => a))?;

    let error = pensieve.store("a", producer!((b) => b)).unwrap_err();
    assert!(matches!(
        error,
        PensieveError::Storing(StoringError::Recursion { .. })
    ));

    assert_eq!(pensieve.recall("a")?, 1);
    assert!(pensieve.precursor_keys("a")?.is_empty());
    assert!(pensieve.successor_keys("b")?.is_empty());
    Ok(())
}

#[test]
fn self_reference_is_a_cycle() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("a", producer!(() => 1))?;

    let error = pensieve.store("a", producer!((a) => a)).unwrap_err();
    assert!(matches!(
        error,
        PensieveError::Storing(StoringError::Recursion { .. })
    ));
    Ok(())
}

#[test]
fn duplicate_precursors_are_deduplicated() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("root", producer!(() => 4))?;
    pensieve.store(
        "child",
        Producer::gathered(["root", "root"], "root * 2", |inputs| {
            Ok(inputs["root"] * 2)
        }),
    )?;

    assert_eq!(pensieve.precursor_keys("child")?, ["root"]);
    assert_eq!(pensieve.successor_keys("root")?, ["child"]);
    assert_eq!(pensieve.recall("child")?, 8);
    Ok(())
}

#[test]
fn storing_twice_is_idempotent() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.store("b", producer!((a) => a + 2))?;
    pensieve.store("b", producer!((a) => a + 2))?;

    assert_eq!(pensieve.successor_keys("a")?, ["b"]);
    assert_eq!(pensieve.precursor_keys("b")?, ["a"]);
    assert_eq!(pensieve.recall("b")?, 3);
    Ok(())
}

#[test]
fn erase_purges_adjacency_and_stales_descendants() -> Result<(), PensieveError> {
    let mut pensieve = Pensieve::<i64>::new();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.store("b", producer!((a) => a + 1))?;
    pensieve.store("c", producer!((b) => b + 1))?;
    assert_eq!(pensieve.recall("c")?, 3);

    pensieve.erase("b")?;

    assert!(!pensieve.contains("b"));
    assert!(pensieve.successor_keys("a")?.is_empty());
    assert!(pensieve.precursor_keys("c")?.is_empty());
    assert!(pensieve.memory("c")?.is_stale());

    // The orphaned unary producer no longer receives its input.
    assert!(matches!(
        pensieve.recall("c"),
        Err(PensieveError::Evaluation { .. })
    ));
    Ok(())
}

#[test]
fn relatives_are_deduplicated_in_first_seen_order() -> Result<(), PensieveError> {
    let mut pensieve = lazy_pensieve();
    pensieve.store("r", producer!(() => 1))?;
    pensieve.store("a", producer!((r) => r + 1))?;
    pensieve.store("b", producer!((r) => r + 2))?;
    pensieve.store("j", producer!((a, b) => a + b))?;

    assert_eq!(pensieve.ancestors("j")?, ["a", "r", "b"]);
    assert_eq!(pensieve.descendants("r")?, ["a", "j", "b"]);
    Ok(())
}

#[test]
fn merge_prefers_the_side_with_precursors() -> Result<(), PensieveError> {
    let mut left = Pensieve::<i64>::new();
    left.store("base", producer!(() => 1))?;
    left.store("derived", producer!((base) => base + 1))?;
    assert_eq!(left.recall("derived")?, 2);

    let mut right = Pensieve::<i64>::new();
    right.store("seed", producer!(() => 7))?;
    right.store("base", producer!((seed) => seed + 3))?;

    let merged = left.merge(right)?;
    assert_eq!(merged.precursor_keys("base")?, ["seed"]);
    assert!(merged.memory("derived")?.is_stale());
    assert_eq!(merged.recall("base")?, 10);
    assert_eq!(merged.recall("derived")?, 11);
    Ok(())
}

#[test]
fn merge_conflicts_when_both_sides_declare_precursors() -> Result<(), PensieveError> {
    let mut left = Pensieve::<i64>::new();
    left.store("seed", producer!(() => 1))?;
    left.store("base", producer!((seed) => seed + 1))?;

    let mut right = Pensieve::<i64>::new();
    right.store("other", producer!(() => 2))?;
    right.store("base", producer!((other) => other + 1))?;

    let error = left.merge(right).unwrap_err();
    assert!(matches!(error, PensieveError::MergeConflict(key) if key == "base"));
    Ok(())
}

#[test]
fn merge_rejects_cross_cycles() -> Result<(), PensieveError> {
    let mut left = Pensieve::<i64>::new();
    left.store("x", producer!(() => 1))?;
    left.store("y", producer!((x) => x + 1))?;

    let mut right = Pensieve::<i64>::new();
    right.store("y", producer!(() => 2))?;
    right.store("x", producer!((y) => y + 1))?;

    let error = left.merge(right).unwrap_err();
    assert!(matches!(
        error,
        PensieveError::Storing(StoringError::Recursion { .. })
    ));
    Ok(())
}

#[test]
fn display_lists_the_graph_topologically() -> Result<(), PensieveError> {
    let pensieve = Pensieve::<i64>::new();
    assert_eq!(pensieve.to_string(), "<empty graph>");

    let mut pensieve = lazy_pensieve();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.store("b", producer!((a) => a + 2))?;

    let listing = pensieve.to_string();
    assert!(listing.contains("-->"));
    assert!(listing.contains("(stale)"));
    let a_line = listing.lines().position(|l| l.ends_with("a (stale)"));
    let b_line = listing.lines().position(|l| l.contains("a --> b"));
    assert!(a_line.unwrap() < b_line.unwrap());
    Ok(())
}
