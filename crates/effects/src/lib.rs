//! Effect handlers with typed operations, layered over `multiprompt`.
//!
//! A handler installs a prompt plus a frame on a per-thread shadow stack;
//! [`perform`] walks that stack (honoring [`mask`] and [`under`] frames)
//! to the nearest handler of the operation's effect and dispatches on the
//! operation's declared [`OpKind`] — in place for tail-resumptive
//! operations, via a captured resumption for the suspending kinds, or by
//! tearing the extent down for the abortive ones.
//!
//! Values crossing a handler boundary are dynamically typed
//! ([`Value`]); operation tables are plain `static` data:
//!
//! ```
//! use multiprompt_effects::*;
//!
//! const TICK: Effect = Effect::new("tick");
//! const TICK_NEXT: OpTag = OpTag::new(TICK, 0, "tick/next");
//!
//! static TICK_DEF: HandlerDef = HandlerDef {
//!     effect: TICK,
//!     result: None,
//!     ops: &[OpDef {
//!         kind: OpKind::TailNoop,
//!         tag: TICK_NEXT,
//!         fun: |r, local, _arg| {
//!             let n = local.as_int().unwrap();
//!             r.unwrap().resume_tail(Value::from(n + 1), Value::from(n))
//!         },
//!     }],
//! };
//!
//! let out = handle(&TICK_DEF, Value::from(0i64), || {
//!     let a = perform(TICK_NEXT, Value::null()).as_int().unwrap();
//!     let b = perform(TICK_NEXT, Value::null()).as_int().unwrap();
//!     Value::from(a + b)
//! });
//! assert_eq!(out.as_int(), Some(1));
//! ```

mod frame;
mod handler;

use std::any::Any;

pub use handler::{Resume, finally, handle, mask, perform, try_perform, under};
pub use multiprompt::{Config, init};

/// A dynamically typed value crossing a handler boundary, with an
/// explicit null (the result of unhandled operations and torn-down
/// extents).
///
/// Scalars are stored unboxed. That matters beyond the allocation: a
/// handler local held in a frame captured across a multi-shot yield is
/// replayed by a byte copy of the frame, which is only sound for plain
/// data. Keep locals (and anything else live in captured frames) scalar
/// when the capturing operation is [`OpKind::Multi`]; boxed values are
/// fine everywhere else.
pub struct Value(Inner);

enum Inner {
    Null,
    Int(i64),
    Bool(bool),
    Boxed(Box<dyn Any>),
}

impl Value {
    /// Box an arbitrary value.
    pub fn new<T: Any>(v: T) -> Value {
        Value(Inner::Boxed(Box::new(v)))
    }

    pub fn null() -> Value {
        Value(Inner::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.0, Inner::Null)
    }

    pub fn as_int(self) -> Option<i64> {
        match self.0 {
            Inner::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self.0 {
            Inner::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Take a boxed payload out as a `T`; `None` when null, scalar, or of
    /// another type.
    pub fn downcast<T: Any>(self) -> Option<T> {
        match self.0 {
            Inner::Boxed(b) => Some(*b.downcast::<T>().ok()?),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value(Inner::Int(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value(Inner::Bool(v))
    }
}

impl Default for Value {
    fn default() -> Value {
        Value::null()
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.0 {
            Inner::Null => f.write_str("Value(null)"),
            Inner::Int(v) => write!(f, "Value({v})"),
            Inner::Bool(v) => write!(f, "Value({v})"),
            Inner::Boxed(_) => f.write_str("Value(..)"),
        }
    }
}

/// An effect, identified by name. Distinct effects must use distinct
/// names; comparison is by value so the constant can be re-declared
/// across crates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Effect(&'static str);

impl Effect {
    pub const fn new(name: &'static str) -> Effect {
        Effect(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl PartialEq<&str> for Effect {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Identifies one operation of an effect: the effect plus the operation's
/// index in every handler table for that effect.
#[derive(Clone, Copy, Debug)]
pub struct OpTag {
    pub effect: Effect,
    pub index: usize,
    pub name: &'static str,
}

impl OpTag {
    pub const fn new(effect: Effect, index: usize, name: &'static str) -> OpTag {
        OpTag { effect, index, name }
    }
}

/// How an operation intends to use its resumption; dispatch picks the
/// cheapest mechanism that supports the declared kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpKind {
    /// Tail-resumes without performing operations itself; runs in place
    /// with no stack switch.
    TailNoop,
    /// Tail-resumes, but may perform operations; runs in place under an
    /// under frame so same-effect performs reach the next outer handler.
    Tail,
    /// Resumes at most once, within the operation function's own extent.
    ScopedOnce,
    /// Resumes at most once; the resumption may escape the operation
    /// function.
    Once,
    /// May resume any number of times.
    Multi,
    /// Never resumes; the suspended extent is unwound (drops run) before
    /// the operation function runs at the handler.
    Never,
    /// Never resumes; the suspended extent is discarded without running
    /// its drops.
    Abort,
}

/// An operation function: the resumption (`None` for [`OpKind::Never`]
/// and [`OpKind::Abort`]), the handler's current local, and the
/// operation argument.
pub type OpFn = fn(Option<Resume>, Value, Value) -> Value;

/// Transforms the handler local and the body's result into the handler's
/// result.
pub type ResultFn = fn(Value, Value) -> Value;

pub struct OpDef {
    pub kind: OpKind,
    pub tag: OpTag,
    pub fun: OpFn,
}

/// A handler definition: one entry per operation of the effect, in tag
/// index order.
pub struct HandlerDef {
    pub effect: Effect,
    pub result: Option<ResultFn>,
    pub ops: &'static [OpDef],
}
