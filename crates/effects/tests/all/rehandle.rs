//! A resumption escaping its handler entirely and being resumed under a
//! different one: the suspended extent re-parents onto whatever context
//! resumes it, so the second `ask` sees the new reader.

use crate::common::*;
use multiprompt_effects::{Effect, HandlerDef, OpDef, OpKind, OpTag, Resume, Value, handle, perform};

const EXIT: Effect = Effect::new("exit");
const EXIT_CAPTURE: OpTag = OpTag::new(EXIT, 0, "exit/capture");

fn capture_op(r: Option<Resume>, _local: Value, _arg: Value) -> Value {
    // Hand the resumption itself out as the handler's value.
    Value::new(r.unwrap())
}

static EXIT_DEF: HandlerDef = HandlerDef {
    effect: EXIT,
    result: None,
    ops: &[OpDef { kind: OpKind::Once, tag: EXIT_CAPTURE, fun: capture_op }],
};

fn exit_handle(body: impl FnOnce() -> Value + 'static) -> Value {
    handle(&EXIT_DEF, Value::null(), body)
}

#[test]
fn resuming_under_a_fresh_reader_observes_it() {
    // Ask once under the first reader, capture, and escape.
    let captured = reader_handle(1, || {
        exit_handle(|| {
            let x = int(perform(READER_ASK, Value::null()));
            perform(EXIT_CAPTURE, Value::null());
            let y = int(perform(READER_ASK, Value::null()));
            Value::from(x + y)
        })
    });
    let resume = captured.downcast::<Resume>().expect("the captured resumption");

    // Resume under a second reader; the suspended body's second ask now
    // reaches it.
    let out = reader_handle(2, || resume.resume(Value::null(), Value::null()));
    assert_eq!(int(out), 3);
}
