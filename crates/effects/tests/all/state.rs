//! The counter scenario over every state flavor: a tail-resumptive
//! handler must sustain millions of operations in constant stack, and the
//! suspending flavors must agree on the result.

use crate::common::*;
use multiprompt_effects::Value;

// Large enough that per-operation stack growth would blow an 8 MiB stack
// thousands of times over; sized down without optimizations, as the run
// would otherwise dominate the suite.
fn counter_rounds() -> i64 {
    if cfg!(debug_assertions) { 100_100 } else { 10_010_010 }
}

#[test]
fn counter_tail_noop() {
    init_logging();
    let n = counter_rounds();
    let out = state_handle(n, counter_body);
    assert_eq!(int(out), n);
}

#[test]
fn counter_tail_under() {
    let n = counter_rounds();
    let out = ustate_handle(n, counter_body);
    assert_eq!(int(out), n);
}

#[test]
fn counter_scoped_once() {
    // Every operation takes the full suspend/resume path; keep the count
    // moderate.
    let n = 10_000;
    let out = ostate_handle(n, counter_body);
    assert_eq!(int(out), n);
}

#[test]
fn counter_multi_shot() {
    let n = 1_000;
    let out = gstate_handle(n, counter_body);
    assert_eq!(int(out), n);
}

#[test]
fn state_threads_through_set_and_get() {
    let out = state_handle(7, || {
        let a = int(perform_get());
        perform_set(a * 6);
        Value::from(int(perform_get()))
    });
    assert_eq!(int(out), 42);
}

fn perform_get() -> Value {
    multiprompt_effects::perform(STATE_GET, Value::null())
}

fn perform_set(v: i64) {
    multiprompt_effects::perform(STATE_SET, Value::from(v));
}
