//! Reader scenarios, including the ten-deep nesting around the counter:
//! the extra handlers sit between the perform sites and the state
//! handler, so every operation search walks them.

use crate::common::*;
use multiprompt_effects::{Value, perform};

#[test]
fn reader_answers_ask() {
    let out = reader_handle(11, || {
        let a = int(perform(READER_ASK, Value::null()));
        let b = int(perform(READER_ASK, Value::null()));
        Value::from(a + b)
    });
    assert_eq!(int(out), 22);
}

#[test]
fn suspending_reader_agrees_with_the_tail_reader() {
    let body = || Value::from(int(perform(READER_ASK, Value::null())) * 3);
    assert_eq!(int(reader_handle(5, body)), 15);
    assert_eq!(int(sreader_handle(5, body)), 15);
}

#[test]
fn counter_under_ten_readers() {
    fn nest(depth: usize, n: i64) -> Value {
        if depth == 0 { state_handle(n, counter_body) } else { reader_handle(depth as i64, move || nest(depth - 1, n)) }
    }
    let n = if cfg!(debug_assertions) { 100_100 } else { 10_010_010 };
    assert_eq!(int(nest(10, n)), n);
}

#[test]
fn inner_reader_shadows_the_outer() {
    let out = reader_handle(1, || {
        reader_handle(2, || Value::from(int(perform(READER_ASK, Value::null()))))
    });
    assert_eq!(int(out), 2);
}
