//! `handle`/`perform` dispatch over the prompt primitive.
//!
//! A handler is a prompt plus a shadow-stack frame. Performing an
//! operation searches the shadow stack for the nearest matching handler
//! and then branches on the operation's declared kind: the tail kinds run
//! the operation in place on the current stack, the yielding kinds
//! suspend the extent between the perform site and the handler, and the
//! abortive kinds leave it for good — with or without running the drops
//! pending in it.
//!
//! Values and handler locals cross stack switches through small
//! environment records on the suspended or resuming frames; every field
//! is taken out exactly once on the far side, so captured frames hold no
//! live owned values while suspended (which is also what makes multi-shot
//! replay of the machinery itself sound).

use crate::frame::{Frame, FrameGuard, find, frame_top, set_frame_top};
use crate::{HandlerDef, OpDef, OpFn, OpKind, OpTag, Value};
use core::cell::Cell;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use multiprompt::{MultiResume, OnceResume, Prompt, Word, yield_multi, yield_to};
use std::panic::{self, AssertUnwindSafe};

/// Targeted unwind marker: tears the stack down to the handler frame at
/// `target`, where the pending operation runs after the handler's prompt
/// has been exited. Panic payloads must be `Send` but handler values are
/// not, so the operation and its argument travel in a thread-local slot
/// next to the in-flight panic.
struct EffectUnwind {
    target: usize,
}

struct PendingUnwind {
    fun: OpFn,
    arg: Value,
}

thread_local! {
    static PENDING_UNWIND: Cell<Option<PendingUnwind>> = const { Cell::new(None) };
}

fn unwind_to(target: *mut Frame, fun: OpFn, arg: Value) -> ! {
    let prev = PENDING_UNWIND.replace(Some(PendingUnwind { fun, arg }));
    debug_assert!(prev.is_none(), "an effect unwind is already in flight");
    panic::panic_any(EffectUnwind { target: target as usize })
}

/// The pseudo-operation used when a resumption is released: the handler
/// exits with the provided value.
fn release_op(_resume: Option<Resume>, _local: Value, arg: Value) -> Value {
    arg
}

fn value_into_word(v: Value) -> Word {
    Box::into_raw(Box::new(v)).cast()
}

unsafe fn word_into_value(w: Word) -> Value {
    if w.is_null() {
        // The null word is what a torn-down chain's landing produces.
        return Value::null();
    }
    *unsafe { Box::from_raw(w.cast::<Value>()) }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Style {
    ScopedOnce,
    Once,
    Multi,
}

/// Crosses a yield: read by the operation clause on the far side.
struct PerformEnv {
    style: Style,
    fun: OpFn,
    local: Option<Value>,
    arg: Option<Value>,
}

/// Crosses a resume: read by the woken yield site.
struct ResumeEnv {
    local: Option<Value>,
    result: Option<Value>,
    unwind: bool,
}

/// Crosses the abortive yield; all fields are taken before the captured
/// chain is discarded.
struct AbortEnv {
    fun: OpFn,
    local: Option<Value>,
    arg: Option<Value>,
}

/// A resumption handed to an operation function.
///
/// Dropping (or [`Resume::release`]-ing) a resumable handle without
/// resuming it unwinds the suspended extent so drops and `finally`
/// releases pending in it run exactly once.
pub struct Resume {
    kind: Option<ResumeKind>,
}

enum ResumeKind {
    /// Tail kinds: no suspension happened, the handle can only write the
    /// handler local back and return a value.
    InPlace(*const Cell<Value>),
    ScopedOnce(OnceResume),
    Once(OnceResume),
    Multi(MultiResume),
}

impl Resume {
    fn new(kind: ResumeKind) -> Resume {
        Resume { kind: Some(kind) }
    }

    fn take_kind(self) -> ResumeKind {
        let mut this = ManuallyDrop::new(self);
        this.kind.take().expect("resumption already consumed")
    }

    /// Duplicate a multi-shot resumption; every resume consumes one
    /// handle. Panics on any other kind.
    pub fn dup(&self) -> Resume {
        match &self.kind {
            Some(ResumeKind::Multi(m)) => Resume::new(ResumeKind::Multi(m.clone())),
            _ => panic!("only multi-shot resumptions can be duplicated"),
        }
    }

    /// Jump back to the perform site with `value`, first installing
    /// `local` as the handler's local. Returns the handled extent's next
    /// answer (its final result, or the next operation's result).
    pub fn resume(self, local: Value, value: Value) -> Value {
        match self.take_kind() {
            ResumeKind::InPlace(_) => {
                panic!("tail operations may only resume with Resume::resume_tail")
            }
            ResumeKind::ScopedOnce(r) | ResumeKind::Once(r) => {
                let mut renv = ResumeEnv { local: Some(local), result: Some(value), unwind: false };
                let w = unsafe { r.resume((&raw mut renv).cast()) };
                unsafe { word_into_value(w) }
            }
            ResumeKind::Multi(m) => {
                let mut renv = ResumeEnv { local: Some(local), result: Some(value), unwind: false };
                let w = unsafe { m.resume((&raw mut renv).cast()) };
                unsafe { word_into_value(w) }
            }
        }
    }

    /// Resume as the operation function's final action. For tail kinds
    /// this is a plain store-and-return; for the others the calling frame
    /// is abandoned, so nothing owned may be live across this call.
    pub fn resume_tail(self, local: Value, value: Value) -> Value {
        match self.take_kind() {
            ResumeKind::InPlace(slot) => {
                unsafe { (*slot).set(local) };
                value
            }
            ResumeKind::ScopedOnce(r) | ResumeKind::Once(r) => {
                let mut renv = ResumeEnv { local: Some(local), result: Some(value), unwind: false };
                unsafe { r.resume_tail((&raw mut renv).cast()) }
            }
            ResumeKind::Multi(m) => {
                let mut renv = ResumeEnv { local: Some(local), result: Some(value), unwind: false };
                let w = unsafe { m.resume_tail((&raw mut renv).cast()) };
                unsafe { word_into_value(w) }
            }
        }
    }

    /// Give the resumption up without resuming. Equivalent to dropping
    /// it: a suspended extent that would otherwise be lost is unwound.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Resume {
    fn drop(&mut self) {
        match self.kind.take() {
            None | Some(ResumeKind::InPlace(_)) => {}
            Some(ResumeKind::ScopedOnce(r)) | Some(ResumeKind::Once(r)) => release_unwind_once(r),
            Some(ResumeKind::Multi(m)) => {
                if m.should_unwind() {
                    release_unwind_multi(m);
                } else {
                    drop(m);
                }
            }
        }
    }
}

/// Resume with the unwind flag set: the woken yield site raises a
/// targeted unwind to its handler, drops run, and the handler exits with
/// the null value.
fn release_unwind_once(r: OnceResume) {
    let mut renv = ResumeEnv { local: None, result: None, unwind: true };
    let w = unsafe { r.resume((&raw mut renv).cast()) };
    drop(unsafe { word_into_value(w) });
}

fn release_unwind_multi(m: MultiResume) {
    let mut renv = ResumeEnv { local: None, result: None, unwind: true };
    let w = unsafe { m.resume((&raw mut renv).cast()) };
    drop(unsafe { word_into_value(w) });
}

/// One-shot yield clause: runs on the handler's parent stack with the
/// captured extent in hand.
unsafe fn once_clause(r: OnceResume, envw: Word) -> Word {
    let env = envw.cast::<PerformEnv>();
    unsafe {
        let style = (*env).style;
        let fun = (*env).fun;
        let local = (*env).local.take().unwrap_or_default();
        let arg = (*env).arg.take().unwrap_or_default();
        let kind = match style {
            Style::ScopedOnce => ResumeKind::ScopedOnce(r),
            _ => ResumeKind::Once(r),
        };
        value_into_word(fun(Some(Resume::new(kind)), local, arg))
    }
}

unsafe fn multi_clause(m: MultiResume, envw: Word) -> Word {
    let env = envw.cast::<PerformEnv>();
    unsafe {
        let fun = (*env).fun;
        let local = (*env).local.take().unwrap_or_default();
        let arg = (*env).arg.take().unwrap_or_default();
        value_into_word(fun(Some(Resume::new(ResumeKind::Multi(m))), local, arg))
    }
}

/// Suspend the extent between the perform site and the handler, and run
/// the operation function on the handler's parent stack.
unsafe fn perform_yield_to(style: Style, h: *mut Frame, fun: OpFn, arg: Value) -> Value {
    let hd = unsafe { (*h).handler_data() };

    // Unlink the frames of the extent being captured; they are relinked
    // (possibly under a different outer context) when we are resumed.
    let yield_top = frame_top();
    set_frame_top(unsafe { (*h).parent.get() });

    let mut env =
        PerformEnv { style, fun, local: Some(hd.local.take()), arg: Some(arg) };
    let envw: Word = (&raw mut env).cast();
    let w = unsafe {
        match style {
            Style::Multi => yield_multi(hd.prompt, multi_clause, envw),
            _ => yield_to(hd.prompt, once_clause, envw),
        }
    };

    // Resumed: reinstall the local and relink our frames on top of
    // whatever the resumer's context is now.
    let renv = w.cast::<ResumeEnv>();
    unsafe {
        hd.local.set((*renv).local.take().unwrap_or_default());
        (*h).parent.set(frame_top());
        set_frame_top(yield_top);
        if (*renv).unwind {
            let result = (*renv).result.take().unwrap_or_default();
            unwind_to(h, release_op, result);
        }
        (*renv).result.take().unwrap_or_default()
    }
}

/// The abortive exit: yield to the handler's prompt, discard the captured
/// extent without running its drops, and run `fun` at the handler's
/// site. Never returns to the (abandoned) caller.
unsafe fn perform_yield_to_abort(h: *mut Frame, fun: OpFn, arg: Value) -> ! {
    let hd = unsafe { (*h).handler_data() };
    // The abandoned frames are never relinked; leave the shadow stack at
    // the handler's parent, which is where control re-emerges.
    set_frame_top(unsafe { (*h).parent.get() });
    let mut env = AbortEnv { fun, local: Some(hd.local.take()), arg: Some(arg) };
    unsafe {
        yield_to(hd.prompt, abort_clause, (&raw mut env).cast());
    }
    unreachable!("aborted extent was resumed")
}

unsafe fn abort_clause(r: OnceResume, envw: Word) -> Word {
    let env = envw.cast::<AbortEnv>();
    unsafe {
        // Copy everything out: the environment lives on the stack we are
        // about to discard.
        let fun = (*env).fun;
        let local = (*env).local.take().unwrap_or_default();
        let arg = (*env).arg.take().unwrap_or_default();
        r.discard();
        value_into_word(fun(None, local, arg))
    }
}

/// Run an operation in place with a local-slot-only resumption; the tail
/// variant hides the handler itself behind an under frame first.
unsafe fn perform_in_place(h: *mut Frame, fun: OpFn, arg: Value) -> Value {
    let hd = unsafe { (*h).handler_data() };
    let local = hd.local.take();
    let resume = Resume::new(ResumeKind::InPlace(&hd.local));
    fun(Some(resume), local, arg)
}

pub(crate) unsafe fn perform_at(h: NonNull<Frame>, op: &OpDef, arg: Value) -> Value {
    let h = h.as_ptr();
    unsafe {
        match op.kind {
            OpKind::TailNoop => perform_in_place(h, op.fun, arg),
            OpKind::Tail => {
                // Re-entrant performs of the same effect from inside the
                // operation must find the next outer handler.
                let mut under = Frame::under((*h).handler_data().effect);
                let _g = FrameGuard::push(&raw mut under);
                perform_in_place(h, op.fun, arg)
            }
            OpKind::ScopedOnce => perform_yield_to(Style::ScopedOnce, h, op.fun, arg),
            OpKind::Once => perform_yield_to(Style::Once, h, op.fun, arg),
            OpKind::Multi => perform_yield_to(Style::Multi, h, op.fun, arg),
            OpKind::Never => unwind_to(h, op.fun, arg),
            OpKind::Abort => perform_yield_to_abort(h, op.fun, arg),
        }
    }
}

/// Perform `tag` with `arg`, dispatching to the nearest enclosing
/// handler. Returns `None` when no handler is installed.
pub fn try_perform(tag: OpTag, arg: Value) -> Option<Value> {
    let h = find(tag.effect)?;
    let hd = unsafe { h.as_ref() }.handler_data();
    let op = &hd.def.ops[tag.index];
    debug_assert_eq!(op.tag.effect, tag.effect);
    debug_assert_eq!(op.tag.index, tag.index);
    Some(unsafe { perform_at(h, op, arg) })
}

/// As [`try_perform`], but an unhandled operation is reported and yields
/// the null value.
pub fn perform(tag: OpTag, arg: Value) -> Value {
    match try_perform(tag, arg) {
        Some(v) => v,
        None => {
            log::warn!("unhandled operation: {}", tag.name);
            Value::null()
        }
    }
}

struct HandleEnv<F> {
    def: &'static HandlerDef,
    local: Option<Value>,
    body: Option<F>,
}

/// First function under a fresh handler prompt: push the frame, run the
/// body, pop, and optionally transform the result. Targeted unwinds
/// aimed at this handler are caught here and converted into the abortive
/// exit, after the extent's drops have already run.
unsafe fn handle_start<F: FnOnce() -> Value>(p: NonNull<Prompt>, argw: Word) -> Word {
    let env = argw.cast::<HandleEnv<F>>();
    let (def, local, body) = unsafe {
        ((*env).def, (*env).local.take().unwrap_or_default(), (*env).body.take().unwrap())
    };

    let mut frame = Frame::handler(def, local, p);
    let frame_ptr = &raw mut frame;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _g = unsafe { FrameGuard::push(frame_ptr) };
        body()
    }));
    match result {
        Ok(v) => {
            let v = match def.result {
                Some(f) => f(unsafe { (*frame_ptr).handler_data() }.local.take(), v),
                None => v,
            };
            value_into_word(v)
        }
        Err(payload) => match payload.downcast::<EffectUnwind>() {
            Ok(e) if e.target == frame_ptr as usize => {
                let pending =
                    PENDING_UNWIND.take().expect("targeted unwind without a pending operation");
                unsafe { perform_yield_to_abort(frame_ptr, pending.fun, pending.arg) }
            }
            Ok(e) => panic::resume_unwind(e),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Handle an effect: run `body` under a fresh prompt with `def`'s
/// operations installed and `local` as the handler-local state.
///
/// The body is `'static` because a resumption captured under this handler
/// can escape the call (an [`OpKind::Once`] handle stored away, say) and
/// keep the body's suspended frames alive after `handle` has returned.
pub fn handle<F>(def: &'static HandlerDef, local: Value, body: F) -> Value
where
    F: FnOnce() -> Value + 'static,
{
    let mut env = HandleEnv { def, local: Some(local), body: Some(body) };
    let w = unsafe { multiprompt::prompt(handle_start::<F>, (&raw mut env).cast()) };
    unsafe { word_into_value(w) }
}

/// Hide `from` enclosing handlers of `effect` from performs inside
/// `body`.
pub fn mask<T>(effect: crate::Effect, from: usize, body: impl FnOnce() -> T) -> T {
    let mut frame = Frame::mask(effect, from);
    let _g = unsafe { FrameGuard::push(&raw mut frame) };
    body()
}

/// Run `body` as if it were outside the innermost handler of `effect`:
/// performs inside it search from that handler's parent outwards.
pub fn under<T>(effect: crate::Effect, body: impl FnOnce() -> T) -> T {
    let mut frame = Frame::under(effect);
    let _g = unsafe { FrameGuard::push(&raw mut frame) };
    body()
}

struct FinallyGuard {
    local: Option<Value>,
    release: fn(Value),
}

impl Drop for FinallyGuard {
    fn drop(&mut self) {
        (self.release)(self.local.take().unwrap_or_default());
    }
}

/// Run `body` with a release action that is invoked exactly once on every
/// exit path: normal return, a yield that is never resumed (the unwind of
/// the dropped resumption runs it), or a panic. The abortive operation
/// kind skips it by design.
pub fn finally<T>(local: Value, release: fn(Value), body: impl FnOnce() -> T) -> T {
    let _g = FinallyGuard { local: Some(local), release };
    body()
}
