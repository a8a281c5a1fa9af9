mod util;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pensieve::{producer, Pensieve, PensieveError, Producer};
use util::*;

fn diamond(pensieve: &mut Pensieve<i64>) -> Result<(), PensieveError> {
    pensieve.store("r", producer!(() => 1))?;
    pensieve.store("a", producer!((r) => r + 1))?;
    pensieve.store("b", producer!((r) => r + 2))?;
    pensieve.store("j", producer!((a, b) => a + b))?;
    Ok(())
}

#[test]
fn rounds_respect_dependencies() -> Result<(), PensieveError> {
    let mut pensieve = lazy_pensieve();
    diamond(&mut pensieve)?;

    let schedule = pensieve.update_schedule(&["j"])?;
    assert_eq!(
        schedule,
        vec![
            vec!["r".to_owned()],
            vec!["a".to_owned(), "b".to_owned()],
            vec!["j".to_owned()],
        ]
    );

    // Flattened, the schedule visits every stale dependency exactly once.
    let mut flat: Vec<&String> = schedule.iter().flatten().collect();
    flat.sort();
    flat.dedup();
    assert_eq!(flat.len(), 4);
    Ok(())
}

#[test]
fn fresh_memories_are_not_scheduled() -> Result<(), PensieveError> {
    let mut pensieve = lazy_pensieve();
    diamond(&mut pensieve)?;
    assert_eq!(pensieve.recall("j")?, 5);

    assert!(pensieve.update_schedule(&["j"])?.is_empty());

    // Invalidating one branch schedules only that branch and the join.
    pensieve.store("a", producer!((r) => r + 10))?;
    let schedule = pensieve.update_schedule(&["j"])?;
    assert_eq!(
        schedule,
        vec![vec!["a".to_owned()], vec!["j".to_owned()]]
    );
    Ok(())
}

// With two workers, the siblings' evaluations overlap in wall-clock time
// and the join starts strictly after both have finished.
#[test]
fn siblings_run_concurrently_and_the_join_waits() -> Result<(), PensieveError> {
    let mut pensieve: Pensieve<i64> = Pensieve::<i64>::builder().num_threads(2).lazy(true).build();
    pensieve.store("r", producer!(() => 0))?;

    let spans: Arc<Mutex<Vec<(&'static str, Instant, Instant)>>> =
        Arc::new(Mutex::new(Vec::new()));
    for (name, addend) in [("a", 1_i64), ("b", 2)] {
        let spans = spans.clone();
        pensieve.store(
            name,
            Producer::unary("r", name, move |r| {
                let started = Instant::now();
                thread::sleep(Duration::from_millis(80));
                spans.lock().unwrap().push((name, started, Instant::now()));
                Ok(r + addend)
            }),
        )?;
    }

    let join_started: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    {
        let join_started = join_started.clone();
        pensieve.store(
            "j",
            Producer::gathered(["a", "b"], "a + b", move |inputs| {
                *join_started.lock().unwrap() = Some(Instant::now());
                Ok(inputs["a"] + inputs["b"])
            }),
        )?;
    }

    assert_eq!(pensieve.recall("j")?, 3);

    let spans = spans.lock().unwrap();
    assert_eq!(spans.len(), 2);
    let (_, a_start, a_end) = spans.iter().find(|s| s.0 == "a").copied().unwrap();
    let (_, b_start, b_end) = spans.iter().find(|s| s.0 == "b").copied().unwrap();
    assert!(a_start < b_end && b_start < a_end, "sibling evaluations did not overlap");

    let join_started = join_started.lock().unwrap().expect("join never ran");
    assert!(join_started >= a_end && join_started >= b_end);
    Ok(())
}

#[test]
fn failed_rounds_stop_later_rounds_but_finish_siblings() -> Result<(), PensieveError> {
    let mut pensieve: Pensieve<i64> = Pensieve::<i64>::builder().num_threads(2).lazy(true).build();
    pensieve.store(
        "boom",
        Producer::nullary("boom", || anyhow::bail!("exploded")),
    )?;
    let (ok, ok_counter) = counted_value("fine", 7);
    pensieve.store("ok", ok)?;

    let join_runs = Arc::new(AtomicU32::new(0));
    {
        let join_runs = join_runs.clone();
        pensieve.store(
            "j",
            Producer::gathered(["boom", "ok"], "boom + ok", move |inputs| {
                join_runs.fetch_add(1, Ordering::SeqCst);
                Ok(inputs["boom"] + inputs["ok"])
            }),
        )?;
    }

    let error = pensieve.evaluate(&["j"]).unwrap_err();
    assert!(matches!(error, PensieveError::Evaluation { key, .. } if key == "boom"));

    // The sibling in the failed round still completed; the join never ran.
    assert_eq!(count_of(&ok_counter), 1);
    assert!(!pensieve.memory("ok")?.is_stale());
    assert_eq!(join_runs.load(Ordering::SeqCst), 0);
    assert!(pensieve.memory("j")?.is_stale());
    assert!(pensieve.memory("boom")?.is_stale());
    Ok(())
}

#[test]
fn sequential_evaluate_freshens_everything() -> Result<(), PensieveError> {
    let mut pensieve = lazy_pensieve();
    diamond(&mut pensieve)?;

    pensieve.evaluate_all()?;
    for key in ["r", "a", "b", "j"] {
        assert!(!pensieve.memory(key)?.is_stale());
    }
    Ok(())
}

#[test]
fn auto_thread_count_is_accepted() -> Result<(), PensieveError> {
    let mut pensieve: Pensieve<i64> = Pensieve::<i64>::builder().num_threads(-1).lazy(true).build();
    assert!(pensieve.num_threads() >= 1);

    diamond(&mut pensieve)?;
    pensieve.evaluate(&["j"])?;
    assert_eq!(pensieve.recall("j")?, 5);
    Ok(())
}

#[test]
fn scheduling_ignores_targets_with_fresh_ancestors_only() -> Result<(), PensieveError> {
    let mut pensieve = lazy_pensieve();
    pensieve.store("a", producer!(() => 1))?;
    pensieve.store("b", producer!((a) => a + 2))?;
    pensieve.recall("a")?;

    // Only the stale target itself remains.
    let schedule = pensieve.update_schedule(&["b"])?;
    assert_eq!(schedule, vec![vec!["b".to_owned()]]);
    Ok(())
}
