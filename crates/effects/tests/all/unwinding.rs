//! Unwinding paths: panics crossing handlers after the extent's drops,
//! the never-resuming operation kind, releasing resumptions, and finally
//! blocks firing exactly once on every exit path.

use crate::common::*;
use multiprompt_effects::{
    Effect, HandlerDef, OpDef, OpKind, OpTag, Resume, Value, finally, handle, perform,
};
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};

thread_local! {
    // Per-thread so the tests can run concurrently.
    static RELEASES: Cell<usize> = const { Cell::new(0) };
}

fn releases() -> usize {
    RELEASES.get()
}

fn reset_releases() {
    RELEASES.set(0);
}

struct CountRelease;

impl Drop for CountRelease {
    fn drop(&mut self) {
        RELEASES.set(RELEASES.get() + 1);
    }
}

#[test]
fn panic_crosses_a_handler_after_the_extents_drops() {
    reset_releases();
    let err = catch_unwind(AssertUnwindSafe(|| {
        state_handle(0, || {
            let _guard = CountRelease;
            panic!("scenario panic");
        })
    }))
    .expect_err("the panic must reach us");
    assert_eq!(err.downcast_ref::<&str>().copied(), Some("scenario panic"));
    assert_eq!(releases(), 1);
}

// ---------------------------------------------------------------------
// An exception-shaped effect: `raise` never resumes. The suspended
// extent is unwound (drops run) before the operation function produces
// the handler's answer.
// ---------------------------------------------------------------------

const EXN: Effect = Effect::new("exn");
const EXN_RAISE: OpTag = OpTag::new(EXN, 0, "exn/raise");

fn exn_raise(r: Option<Resume>, _local: Value, arg: Value) -> Value {
    assert!(r.is_none());
    arg
}

static EXN_DEF: HandlerDef = HandlerDef {
    effect: EXN,
    result: None,
    ops: &[OpDef { kind: OpKind::Never, tag: EXN_RAISE, fun: exn_raise }],
};

#[test]
fn never_kind_unwinds_to_the_handler() {
    reset_releases();
    let out = handle(&EXN_DEF, Value::null(), || {
        let _guard = CountRelease;
        perform(EXN_RAISE, Value::from(40));
        unreachable!("raise resumed");
    });
    assert_eq!(int(out), 40);
    assert_eq!(releases(), 1);
}

// ---------------------------------------------------------------------
// Releasing a multi-shot resumption without ever resuming it unwinds
// the suspended extent exactly once; the operation's value still becomes
// the handler's answer.
// ---------------------------------------------------------------------

const MULTI: Effect = Effect::new("multi");
const MULTI_UNWIND: OpTag = OpTag::new(MULTI, 0, "multi/unwind");

fn multi_unwind_op(r: Option<Resume>, _local: Value, _arg: Value) -> Value {
    r.unwrap().release();
    Value::from(42)
}

static MULTI_DEF: HandlerDef = HandlerDef {
    effect: MULTI,
    result: None,
    ops: &[OpDef { kind: OpKind::Multi, tag: MULTI_UNWIND, fun: multi_unwind_op }],
};

#[test]
fn releasing_an_unused_resumption_unwinds_once() {
    reset_releases();
    let out = handle(&MULTI_DEF, Value::null(), || {
        let _guard = CountRelease;
        let a = int(perform(MULTI_UNWIND, Value::null()));
        // Unreached: the resumption is released, never resumed.
        Value::from(a + 1)
    });
    assert_eq!(int(out), 42);
    assert_eq!(releases(), 1);
}

// ---------------------------------------------------------------------
// finally: the release runs exactly once on every exit path.
// ---------------------------------------------------------------------

fn count_release(_local: Value) {
    RELEASES.set(RELEASES.get() + 1);
}

#[test]
fn finally_runs_on_normal_return() {
    reset_releases();
    let out = finally(Value::null(), count_release, || 5i64);
    assert_eq!(out, 5);
    assert_eq!(releases(), 1);
}

#[test]
fn finally_runs_on_panic() {
    reset_releases();
    let err = catch_unwind(AssertUnwindSafe(|| {
        finally(Value::null(), count_release, || -> i64 { panic!("inside finally") })
    }));
    assert!(err.is_err());
    assert_eq!(releases(), 1);
}

#[test]
fn finally_runs_when_a_suspension_is_never_resumed() {
    reset_releases();
    let out = handle(&MULTI_DEF, Value::null(), || {
        finally(Value::null(), count_release, || {
            perform(MULTI_UNWIND, Value::null());
            Value::null()
        })
    });
    assert_eq!(int(out), 42);
    assert_eq!(releases(), 1);
}

#[test]
fn finally_runs_after_a_resumed_yield() {
    reset_releases();
    let out = ostate_handle(3, || {
        finally(Value::null(), count_release, || {
            // Suspends and resumes through the scoped-once state ops.
            let n = int(perform(STATE_GET, Value::null()));
            perform(STATE_SET, Value::from(n + 1));
            Value::from(int(perform(STATE_GET, Value::null())))
        })
    });
    assert_eq!(int(out), 4);
    assert_eq!(releases(), 1);
}
