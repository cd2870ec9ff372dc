//! The prompt primitive: install a delimiter on its own growable stack,
//! yield out of it capturing the suspended extent, resume back in.
//!
//! A prompt is in one of two live states:
//!
//! * _active_: `top` is null; the prompt is part of the current thread's
//!   prompt chain and its stack is (transitively) executing.
//! * _suspended_: `top` points at the innermost prompt of its captured
//!   chain and `resume_point` is valid. The prompt and its children are
//!   not part of any thread's chain.
//!
//! Control transfers hinge on two kinds of landing, both stack-allocated
//! records whose first field is the register context:
//!
//! * a [`ReturnPoint`] on the parent's stack, written on every enter or
//!   resume; the child jumps here to return, to propagate a panic, or to
//!   deliver a yield.
//! * a [`ResumePoint`] on the prompt's own stack, written at a yield
//!   site; a resume jumps here with the resume argument.

use crate::resume::{MultiResume, OnceResume};
use core::cell::Cell;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use multiprompt_gstack::{Gstack, GstackError, Jmpbuf, ctx_restore, ctx_save};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// The word-sized currency of the primitive layer. Typed interpretations
/// live in higher layers.
pub type Word = *mut ();

/// Runs on the fresh stack of a new prompt.
pub type StartFn = unsafe fn(NonNull<Prompt>, Word) -> Word;

/// Runs on the parent's stack after a one-shot yield, owning the captured
/// resumption.
pub type YieldFn = unsafe fn(OnceResume, Word) -> Word;

/// Runs on the parent's stack after a multi-shot yield.
pub type MultiYieldFn = unsafe fn(MultiResume, Word) -> Word;

/// The panic payload used to tear down a captured chain that is dropped
/// without being resumed. It cascades through every prompt of the chain
/// (running drops on the way) and is swallowed at the landing of the
/// resume that requested the teardown.
pub struct ChainUnwind {
    pub(crate) target: usize,
}

/// A delimited region with its own stack. The record is embedded at the
/// base of that stack, so it costs no separate allocation and dies with
/// the stack.
pub struct Prompt {
    /// Previous prompt down the chain while active; null while suspended.
    parent: Cell<*mut Prompt>,
    /// Innermost prompt of the captured chain while suspended; null while
    /// active.
    top: Cell<*mut Prompt>,
    refcount: Cell<isize>,
    gstack: NonNull<Gstack>,
    /// Landing on the parent's stack; valid while the prompt is entered.
    return_point: Cell<*mut ReturnPoint>,
    /// Landing at the most recent yield site; valid while suspended.
    resume_point: Cell<*mut ResumePoint>,
}

#[repr(C)]
pub(crate) struct ReturnPoint {
    /// Must stay the first field: the context restore goes through a
    /// pointer to the whole record.
    jmp: Jmpbuf,
    pub(crate) kind: ReturnKind,
}

pub(crate) enum ReturnKind {
    /// Placeholder while the child runs; never observed at a landing.
    Entered,
    Return(Word),
    Panic(Box<dyn Any + Send>),
    YieldOnce { fun: YieldFn, arg: Word },
    YieldMulti { fun: MultiYieldFn, arg: Word },
}

#[repr(C)]
pub(crate) struct ResumePoint {
    /// Must stay the first field, as in [`ReturnPoint`].
    jmp: Jmpbuf,
    pub(crate) result: Word,
    pub(crate) unwind: bool,
}

impl ResumePoint {
    pub(crate) fn saved_sp(&self) -> *mut u8 {
        self.jmp.reg_sp
    }
}

impl ReturnPoint {
    pub(crate) fn saved_sp(&self) -> *mut u8 {
        self.jmp.reg_sp
    }
}

thread_local! {
    /// The prompt on whose stack this thread currently executes, or null
    /// on the system stack.
    static PROMPT_TOP: Cell<*mut Prompt> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) fn prompt_top() -> *mut Prompt {
    PROMPT_TOP.get()
}

/// Walk the active prompt chain: `None` starts at the innermost prompt.
pub fn prompt_parent(p: Option<NonNull<Prompt>>) -> Option<NonNull<Prompt>> {
    match p {
        None => NonNull::new(prompt_top()),
        Some(p) => NonNull::new(unsafe { p.as_ref() }.parent.get()),
    }
}

/// Debug-assert helper; the checks compile away in release builds.
fn is_ancestor(p: NonNull<Prompt>) -> bool {
    let mut q = None;
    loop {
        q = prompt_parent(q);
        match q {
            None => return false,
            Some(a) if a == p => return true,
            Some(_) => {}
        }
    }
}

impl Prompt {
    /// Allocate a fresh, not-yet-entered prompt. The record lives at the
    /// base of its own new stack.
    pub fn create() -> Result<NonNull<Prompt>, GstackError> {
        let mut g = Gstack::alloc()?;
        let p = unsafe { g.as_mut().reserve(size_of::<Prompt>()) }.cast::<Prompt>();
        unsafe {
            ptr::write(
                p,
                Prompt {
                    parent: Cell::new(ptr::null_mut()),
                    top: Cell::new(p),
                    refcount: Cell::new(1),
                    gstack: g,
                    return_point: Cell::new(ptr::null_mut()),
                    resume_point: Cell::new(ptr::null_mut()),
                },
            );
        }
        Ok(unsafe { NonNull::new_unchecked(p) })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.top.get().is_null()
    }

    pub(crate) fn refcount(p: NonNull<Prompt>) -> isize {
        unsafe { p.as_ref() }.refcount.get()
    }

    pub(crate) fn resume_point(p: NonNull<Prompt>) -> *mut ResumePoint {
        unsafe { p.as_ref() }.resume_point.get()
    }

    pub(crate) fn return_point(p: NonNull<Prompt>) -> *mut ReturnPoint {
        unsafe { p.as_ref() }.return_point.get()
    }

    pub(crate) fn parent_of(p: NonNull<Prompt>) -> *mut Prompt {
        unsafe { p.as_ref() }.parent.get()
    }

    pub(crate) fn top_of(p: NonNull<Prompt>) -> *mut Prompt {
        unsafe { p.as_ref() }.top.get()
    }

    pub(crate) fn gstack_of(p: NonNull<Prompt>) -> NonNull<Gstack> {
        unsafe { p.as_ref() }.gstack
    }

    pub(crate) fn dup(p: NonNull<Prompt>) -> NonNull<Prompt> {
        let rc = &unsafe { p.as_ref() }.refcount;
        rc.set(rc.get() + 1);
        p
    }

    /// Drop one reference; the last reference frees the prompt and every
    /// descendant of its captured chain.
    pub(crate) unsafe fn drop_ref(p: NonNull<Prompt>) {
        let rc = &unsafe { p.as_ref() }.refcount;
        let old = rc.get();
        rc.set(old - 1);
        if old <= 1 {
            unsafe { Prompt::free_chain(p) };
        }
    }

    unsafe fn free_chain(p: NonNull<Prompt>) {
        debug_assert!(!unsafe { p.as_ref() }.is_active());
        let mut q = unsafe { p.as_ref() }.top.get();
        while !q.is_null() {
            unsafe {
                let parent = (*q).parent.get();
                debug_assert!((*q).refcount.get() <= 1);
                Gstack::free((*q).gstack, false);
                if !parent.is_null() {
                    (*parent).refcount.set((*parent).refcount.get() - 1);
                }
                q = parent;
            }
        }
    }
}

/// Link a suspended prompt (and its captured chain) on top of the current
/// chain. With a null `ret` the prompt's previous return point is reused
/// (tail resume). Returns the resume point to jump to, or null on an
/// initial entry.
pub(crate) unsafe fn link(p: NonNull<Prompt>, ret: *mut ReturnPoint) -> *mut ResumePoint {
    let pr = unsafe { p.as_ref() };
    debug_assert!(!pr.is_active());
    pr.parent.set(prompt_top());
    PROMPT_TOP.set(pr.top.get());
    pr.top.set(ptr::null_mut());
    if !ret.is_null() {
        pr.return_point.set(ret);
    } else {
        debug_assert!(!pr.return_point.get().is_null());
    }
    debug_assert!(pr.is_active());
    pr.resume_point.get()
}

/// Unlink `p` from the current chain, suspending everything from the
/// current top down to and including `p`. Returns the landing to jump to
/// on the parent.
pub(crate) unsafe fn unlink(p: NonNull<Prompt>, res: *mut ResumePoint) -> *mut ReturnPoint {
    let pr = unsafe { p.as_ref() };
    debug_assert!(pr.is_active());
    debug_assert!(is_ancestor(p));
    pr.top.set(prompt_top());
    PROMPT_TOP.set(pr.parent.get());
    pr.parent.set(ptr::null_mut());
    pr.resume_point.set(res);
    // The return point is left as-is for reuse by tail resumes.
    pr.return_point.get()
}

struct EntryEnv {
    prompt: NonNull<Prompt>,
    start: StartFn,
    arg: Word,
}

/// First function on a fresh prompt stack. Catches panics so that drops on
/// this stack run before the parent observes the payload, then leaves the
/// stack through the parent's landing.
unsafe extern "C" fn prompt_entry(arg: *mut u8) -> ! {
    // The environment lives in the (suspended) parent frame; copy it out
    // before running arbitrary code.
    let env = unsafe { ptr::read(arg.cast::<EntryEnv>()) };
    let p = env.prompt;
    let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe { (env.start)(p, env.arg) }));
    unsafe {
        let ret = unlink(p, ptr::null_mut());
        match result {
            Ok(v) => ptr::write(&raw mut (*ret).kind, ReturnKind::Return(v)),
            Err(payload) => {
                log::trace!("propagating a panic across prompt {:p}", p.as_ptr());
                ptr::write(&raw mut (*ret).kind, ReturnKind::Panic(payload));
            }
        }
        ctx_restore(ret.cast())
    }
}

/// Run whatever the child delivered to our landing. Kept out of line and
/// below the context save so that its frame is rebuilt afresh on every
/// landing, including repeated landings through a reused (tail) return
/// point.
#[inline(never)]
unsafe fn exec_return(ret: *mut ReturnPoint, p: NonNull<Prompt>) -> Word {
    let kind = unsafe { core::mem::replace(&mut (*ret).kind, ReturnKind::Entered) };
    match kind {
        ReturnKind::Entered => unreachable!("landing reached without a delivery"),
        ReturnKind::Return(v) => {
            unsafe { Prompt::drop_ref(p) };
            v
        }
        ReturnKind::Panic(payload) => {
            unsafe { Prompt::drop_ref(p) };
            match payload.downcast_ref::<ChainUnwind>() {
                Some(cu) if cu.target == p.as_ptr() as usize => {
                    // The teardown this landing's resume requested has
                    // finished unwinding; it ends here.
                    ptr::null_mut()
                }
                _ => panic::resume_unwind(payload),
            }
        }
        ReturnKind::YieldOnce { fun, arg } => unsafe { fun(OnceResume::from_raw(p), arg) },
        ReturnKind::YieldMulti { fun, arg } => unsafe { fun(MultiResume::create(p), arg) },
    }
}

/// Enter or resume `p`: save a return landing on this stack, make the
/// prompt active, and transfer control. Returns when the child returns,
/// yields, or panics.
pub(crate) unsafe fn prompt_resume(p: NonNull<Prompt>, arg: Word, unwind: bool) -> Word {
    let mut ret = ReturnPoint { jmp: Jmpbuf::zeroed(), kind: ReturnKind::Entered };
    // The pointer is derived from the whole record: the suspended side
    // writes `kind` through it before jumping back.
    let ret_ptr = &raw mut ret;
    if unsafe { ctx_save(ret_ptr.cast()) } != 0 {
        debug_assert!(Prompt::parent_of(p).is_null());
        let res = unsafe { link(p, ret_ptr) };
        if !res.is_null() {
            // Jump to the suspended yield site.
            unsafe {
                (*res).result = arg;
                (*res).unwind = unwind;
                ctx_restore(res.cast())
            }
        }
        // Initial entry: `arg` is the entry environment. The landing
        // written by the stack switch replaces the context saved above,
        // in the same record.
        let g = Prompt::gstack_of(p).as_ptr();
        unsafe { (*g).enter(ret_ptr.cast(), prompt_entry, arg.cast()) };
    }
    // Reached on every landing: from the save above (yield or return of a
    // resumed prompt) or from the enter landing (initial entry).
    unsafe { exec_return(ret_ptr, p) }
}

/// Resume through an explicitly provided return landing; used by tail
/// resumes, which reuse the landing of the original enter so that a
/// tail-resume/yield cycle returns to the same stack watermark.
pub(crate) unsafe fn resume_tail_to(p: NonNull<Prompt>, arg: Word, ret: *mut ReturnPoint) -> ! {
    debug_assert!(Prompt::refcount(p) == 1);
    debug_assert!(!unsafe { p.as_ref() }.is_active());
    debug_assert!(!Prompt::resume_point(p).is_null());
    unsafe {
        let res = link(p, ret);
        (*res).result = arg;
        (*res).unwind = false;
        ctx_restore(res.cast())
    }
}

enum YieldKind {
    Once(YieldFn),
    Multi(MultiYieldFn),
}

unsafe fn yield_internal(p: NonNull<Prompt>, kind: YieldKind, arg: Word) -> Word {
    debug_assert!(unsafe { p.as_ref() }.is_active());
    debug_assert!(is_ancestor(p));
    let mut res = ResumePoint { jmp: Jmpbuf::zeroed(), result: ptr::null_mut(), unwind: false };
    let res_ptr = &raw mut res;
    if unsafe { ctx_save(res_ptr.cast()) } != 0 {
        unsafe {
            let ret = unlink(p, res_ptr);
            let kind = match kind {
                YieldKind::Once(fun) => ReturnKind::YieldOnce { fun, arg },
                YieldKind::Multi(fun) => ReturnKind::YieldMulti { fun, arg },
            };
            ptr::write(&raw mut (*ret).kind, kind);
            ctx_restore(ret.cast())
        }
    }
    // Resumed; the resuming side wrote our result (and possibly the
    // request to unwind this extent).
    debug_assert!(unsafe { p.as_ref() }.is_active());
    debug_assert!(is_ancestor(p));
    unsafe {
        if ptr::read(&raw const (*res_ptr).unwind) {
            panic::panic_any(ChainUnwind { target: p.as_ptr() as usize });
        }
        ptr::read(&raw const (*res_ptr).result)
    }
}

/// Yield to an ancestor prompt `p`, capturing everything between the
/// current point and `p` as a one-shot resumption, and run `fun` with it
/// on `p`'s parent stack.
///
/// # Safety
///
/// `p` must be an ancestor of the current execution point; `fun` receives
/// ownership of the captured chain.
pub unsafe fn yield_to(p: NonNull<Prompt>, fun: YieldFn, arg: Word) -> Word {
    unsafe { yield_internal(p, YieldKind::Once(fun), arg) }
}

/// As [`yield_to`], but the resumption may be resumed any number of times.
///
/// # Safety
///
/// As [`yield_to`]. Frames captured across a multi-shot yield are
/// replayed byte-for-byte on the second and later resumes; values owned
/// by those frames must be plain data.
pub unsafe fn yield_multi(p: NonNull<Prompt>, fun: MultiYieldFn, arg: Word) -> Word {
    unsafe { yield_internal(p, YieldKind::Multi(fun), arg) }
}

/// Enter a freshly created prompt with `start(p, arg)` on its own stack.
///
/// # Safety
///
/// `p` must be fresh: never entered, never resumed.
pub unsafe fn prompt_enter(p: NonNull<Prompt>, start: StartFn, arg: Word) -> Word {
    debug_assert!(!unsafe { p.as_ref() }.is_active());
    debug_assert!(Prompt::resume_point(p).is_null());
    let mut env = EntryEnv { prompt: p, start, arg };
    unsafe { prompt_resume(p, (&raw mut env).cast(), false) }
}

/// Install a fresh prompt and run `start` under it, returning its result.
/// Panics when no stack can be allocated; see [`try_prompt`].
///
/// # Safety
///
/// `start` must leave the prompt only through this crate's control
/// operations (return, yield, or panic).
pub unsafe fn prompt(start: StartFn, arg: Word) -> Word {
    unsafe { try_prompt(start, arg) }.expect("unable to allocate a stack for a prompt")
}

/// As [`prompt`], but surfaces stack allocation failure to the caller.
///
/// # Safety
///
/// As [`prompt`].
pub unsafe fn try_prompt(start: StartFn, arg: Word) -> Result<Word, GstackError> {
    let p = Prompt::create()?;
    Ok(unsafe { prompt_enter(p, start, arg) })
}
