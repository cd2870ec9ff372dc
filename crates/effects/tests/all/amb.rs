//! Ambiguity: multi-shot resumption collecting every completion of the
//! body, and its interaction with state under both nesting orders. The
//! nesting decides whether the state is captured with each branch or
//! shared across branches, which changes how many completions there are.

use crate::common::*;
use multiprompt_effects::{Value, perform};

fn flip() -> bool {
    boolean(perform(AMB_FLIP, Value::null()))
}

fn get() -> i64 {
    int(perform(STATE_GET, Value::null()))
}

fn set(v: i64) {
    perform(STATE_SET, Value::from(v));
}

#[test]
fn xor_enumerates_all_four_branches() {
    let xs = amb_handle(|| {
        let x = flip();
        let y = flip();
        Value::from(x != y)
    });
    assert_eq!(xs, vec![false, true, true, false]);
}

fn flip_then_maybe_xor() -> Value {
    let p = flip();
    let i = get();
    set(i + 1);
    let b = if i > 0 && p { flip() != flip() } else { false };
    Value::from(b)
}

#[test]
fn amb_over_state_scopes_state_per_branch() {
    // The state prompt is inside the captured extent: every branch
    // replays from the state it saw at capture time, so the `i > 0` arm
    // is never reached.
    let xs = amb_handle(|| state_handle(0, flip_then_maybe_xor));
    assert_eq!(xs, vec![false, false]);
}

#[test]
fn state_over_amb_shares_state_across_branches() {
    // The state handler sits outside the ambiguity capture, so the second
    // branch observes the first branch's increment and fans out.
    let out = state_handle(0, || Value::new(amb_handle(flip_then_maybe_xor)));
    let xs = out.downcast::<Vec<bool>>().expect("a list of booleans");
    assert_eq!(xs, vec![false, false, true, true, false]);
}
