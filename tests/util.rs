#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use pensieve::{Pensieve, Producer};

/// Counts how many times a producer body actually ran.
pub type EvalCounter = Arc<AtomicU32>;

pub fn count_of(counter: &EvalCounter) -> u32 {
    counter.load(Ordering::SeqCst)
}

/// A nullary producer returning `value`, counting invocations. The source
/// text is explicit so fingerprint behavior stays under the test's control.
pub fn counted_value(source: &str, value: i64) -> (Producer<i64>, EvalCounter) {
    let counter: EvalCounter = Arc::new(AtomicU32::new(0));
    let seen = counter.clone();
    let producer = Producer::nullary(source, move || {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    });
    (producer, counter)
}

/// A unary producer adding `addend` to its precursor, counting invocations.
pub fn counted_add(
    precursor: &str,
    source: &str,
    addend: i64,
) -> (Producer<i64>, EvalCounter) {
    let counter: EvalCounter = Arc::new(AtomicU32::new(0));
    let seen = counter.clone();
    let producer = Producer::unary(precursor, source, move |content| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(content + addend)
    });
    (producer, counter)
}

/// A nullary producer reading a shared cell at evaluation time, emulating
/// the late-bound captures of the scripting world.
pub fn cell_value(source: &str, cell: &Arc<AtomicI64>) -> Producer<i64> {
    let cell = cell.clone();
    Producer::nullary(source, move || Ok(cell.load(Ordering::SeqCst)))
}

pub fn lazy_pensieve() -> Pensieve<i64> {
    Pensieve::<i64>::builder().lazy(true).build()
}
