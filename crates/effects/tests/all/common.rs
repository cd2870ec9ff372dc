//! The standard handlers the scenarios are built from: reader, state in
//! four resumption flavors, ambiguity, and choice.

use multiprompt_effects::*;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn int(v: Value) -> i64 {
    v.as_int().expect("an int value")
}

pub fn boolean(v: Value) -> bool {
    v.as_bool().expect("a bool value")
}

// ---------------------------------------------------------------------
// Reader: a single tail-resumptive `ask`.
// ---------------------------------------------------------------------

pub const READER: Effect = Effect::new("reader");
pub const READER_ASK: OpTag = OpTag::new(READER, 0, "reader/ask");

fn reader_ask(r: Option<Resume>, local: Value, _arg: Value) -> Value {
    let n = int(local);
    r.unwrap().resume_tail(Value::from(n), Value::from(n))
}

static READER_DEF: HandlerDef = HandlerDef {
    effect: READER,
    result: None,
    ops: &[OpDef { kind: OpKind::TailNoop, tag: READER_ASK, fun: reader_ask }],
};

pub fn reader_handle(init: i64, body: impl FnOnce() -> Value + 'static) -> Value {
    handle(&READER_DEF, Value::from(init), body)
}

// A reader that takes the general suspending path for the same
// operation; observably identical, much more expensive.
static SREADER_DEF: HandlerDef = HandlerDef {
    effect: READER,
    result: None,
    ops: &[OpDef { kind: OpKind::ScopedOnce, tag: READER_ASK, fun: reader_ask }],
};

pub fn sreader_handle(init: i64, body: impl FnOnce() -> Value + 'static) -> Value {
    handle(&SREADER_DEF, Value::from(init), body)
}

// ---------------------------------------------------------------------
// State: get/set over an i64, in every resumption flavor. All four use
// the same operation functions; only the declared kind differs.
// ---------------------------------------------------------------------

pub const STATE: Effect = Effect::new("state");
pub const STATE_GET: OpTag = OpTag::new(STATE, 0, "state/get");
pub const STATE_SET: OpTag = OpTag::new(STATE, 1, "state/set");

fn state_get(r: Option<Resume>, local: Value, _arg: Value) -> Value {
    let n = int(local);
    r.unwrap().resume_tail(Value::from(n), Value::from(n))
}

fn state_set(r: Option<Resume>, _local: Value, arg: Value) -> Value {
    r.unwrap().resume_tail(arg, Value::null())
}

macro_rules! state_def {
    ($name:ident, $kind:expr) => {
        static $name: HandlerDef = HandlerDef {
            effect: STATE,
            result: None,
            ops: &[
                OpDef { kind: $kind, tag: STATE_GET, fun: state_get },
                OpDef { kind: $kind, tag: STATE_SET, fun: state_set },
            ],
        };
    };
}

state_def!(STATE_DEF, OpKind::TailNoop);
state_def!(USTATE_DEF, OpKind::Tail);
state_def!(OSTATE_DEF, OpKind::ScopedOnce);
state_def!(GSTATE_DEF, OpKind::Multi);

pub fn state_handle(init: i64, body: impl FnOnce() -> Value + 'static) -> Value {
    handle(&STATE_DEF, Value::from(init), body)
}

pub fn ustate_handle(init: i64, body: impl FnOnce() -> Value + 'static) -> Value {
    handle(&USTATE_DEF, Value::from(init), body)
}

pub fn ostate_handle(init: i64, body: impl FnOnce() -> Value + 'static) -> Value {
    handle(&OSTATE_DEF, Value::from(init), body)
}

pub fn gstate_handle(init: i64, body: impl FnOnce() -> Value + 'static) -> Value {
    handle(&GSTATE_DEF, Value::from(init), body)
}

/// Decrement from the initial state to zero, counting the steps.
pub fn counter_body() -> Value {
    let mut count = 0i64;
    loop {
        let n = int(perform(STATE_GET, Value::null()));
        if n == 0 {
            break;
        }
        perform(STATE_SET, Value::from(n - 1));
        count += 1;
    }
    Value::from(count)
}

// ---------------------------------------------------------------------
// Ambiguity: `flip` resumes with false and with true, and the handler
// collects every completion of the body.
// ---------------------------------------------------------------------

pub const AMB: Effect = Effect::new("amb");
pub const AMB_FLIP: OpTag = OpTag::new(AMB, 0, "amb/flip");

fn amb_result(_local: Value, v: Value) -> Value {
    Value::new(vec![boolean(v)])
}

fn amb_flip(r: Option<Resume>, _local: Value, _arg: Value) -> Value {
    let r = r.unwrap();
    let mut xs = r
        .dup()
        .resume(Value::null(), Value::from(false))
        .downcast::<Vec<bool>>()
        .expect("a list of booleans");
    let ys = r
        .resume(Value::null(), Value::from(true))
        .downcast::<Vec<bool>>()
        .expect("a list of booleans");
    xs.extend(ys);
    Value::new(xs)
}

static AMB_DEF: HandlerDef = HandlerDef {
    effect: AMB,
    result: Some(amb_result),
    ops: &[OpDef { kind: OpKind::Multi, tag: AMB_FLIP, fun: amb_flip }],
};

pub fn amb_handle(body: impl FnOnce() -> Value + 'static) -> Vec<bool> {
    handle(&AMB_DEF, Value::null(), body).downcast::<Vec<bool>>().expect("a list of booleans")
}

// ---------------------------------------------------------------------
// Choice: `choose(n)` explores every branch and sums the solution
// counts; `fail` abandons a branch abortively.
// ---------------------------------------------------------------------

pub const CHOICE: Effect = Effect::new("choice");
pub const CHOICE_CHOOSE: OpTag = OpTag::new(CHOICE, 0, "choice/choose");
pub const CHOICE_FAIL: OpTag = OpTag::new(CHOICE, 1, "choice/fail");

fn choice_result(_local: Value, _v: Value) -> Value {
    Value::from(1i64)
}

fn choice_choose(r: Option<Resume>, _local: Value, arg: Value) -> Value {
    let max = int(arg);
    let mut r = Some(r.unwrap());
    let mut total = 0i64;
    for k in 1..=max {
        let branch = if k < max { r.as_ref().unwrap().dup() } else { r.take().unwrap() };
        total += int(branch.resume(Value::null(), Value::from(k)));
    }
    Value::from(total)
}

fn choice_fail(_r: Option<Resume>, _local: Value, _arg: Value) -> Value {
    Value::from(0i64)
}

static CHOICE_DEF: HandlerDef = HandlerDef {
    effect: CHOICE,
    result: Some(choice_result),
    ops: &[
        OpDef { kind: OpKind::Multi, tag: CHOICE_CHOOSE, fun: choice_choose },
        OpDef { kind: OpKind::Abort, tag: CHOICE_FAIL, fun: choice_fail },
    ],
};

/// Run `body` under the choice handler and return the number of
/// completions.
pub fn choice_handle(body: impl FnOnce() -> Value + 'static) -> i64 {
    int(handle(&CHOICE_DEF, Value::null(), body))
}
