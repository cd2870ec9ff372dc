//! First-class resumptions.
//!
//! A one-shot resumption is the suspended prompt record itself: capturing
//! and resuming allocate nothing. A multi-shot resumption is a small
//! refcounted heap record; the first resume consumes the captured chain
//! in place, and only when a second user appears are the captured stacks
//! snapshotted so the chain can be replayed.

use crate::prompt::{
    Prompt, ReturnPoint, Word, prompt_resume, resume_tail_to,
};
use core::cell::{Cell, RefCell};
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};
use multiprompt_gstack::GstackSnapshot;

/// A resumption that can be used at most once. Each of the consuming
/// operations takes `self`; merely dropping the handle tears the captured
/// chain down, running the drops (and any client-layer release hooks)
/// pending on it.
pub struct OnceResume {
    p: NonNull<Prompt>,
}

impl OnceResume {
    pub(crate) fn from_raw(p: NonNull<Prompt>) -> OnceResume {
        OnceResume { p }
    }

    fn take(self) -> NonNull<Prompt> {
        ManuallyDrop::new(self).p
    }

    /// Jump back to the yield site with `arg`.
    ///
    /// # Safety
    ///
    /// Must be called on the thread that captured the resumption.
    pub unsafe fn resume(self, arg: Word) -> Word {
        let p = self.take();
        debug_assert!(Prompt::refcount(p) == 1);
        debug_assert!(!Prompt::resume_point(p).is_null());
        unsafe { prompt_resume(p, arg, false) }
    }

    /// Resume as the final action of a yield function. Reuses the return
    /// landing of the original enter, so a loop of tail resumes and
    /// yields runs in constant stack. Never returns to the caller: the
    /// calling frame is abandoned, so it must hold nothing that needs
    /// dropping.
    ///
    /// # Safety
    ///
    /// As [`OnceResume::resume`]; additionally the caller must be in tail
    /// position of a yield function.
    pub unsafe fn resume_tail(self, arg: Word) -> ! {
        let p = self.take();
        let ret = Prompt::return_point(p);
        unsafe { resume_tail_to(p, arg, ret) }
    }

    /// Tear the captured chain down, running drops in the captured
    /// region, without delivering a value. Equivalent to dropping the
    /// handle, but explicit at call sites that care.
    pub fn unwind(self) {
        let p = self.take();
        unsafe { prompt_resume(p, ptr::null_mut(), true) };
    }

    /// Release the captured chain without resuming and without unwinding:
    /// the stacks go back to the allocator as raw memory and values owned
    /// by the abandoned frames are leaked, not dropped. This is the
    /// abort path for failures that must not run cleanup.
    pub fn discard(self) {
        let p = self.take();
        unsafe { Prompt::drop_ref(p) };
    }
}

impl Drop for OnceResume {
    fn drop(&mut self) {
        unsafe { prompt_resume(self.p, ptr::null_mut(), true) };
    }
}

struct PromptSave {
    prompt: NonNull<Prompt>,
    snapshot: GstackSnapshot,
}

struct MultiInner {
    refcount: Cell<isize>,
    resume_count: Cell<u64>,
    prompt: NonNull<Prompt>,
    saves: RefCell<Vec<PromptSave>>,
    /// The return landing of the original enter. Later resumes overwrite
    /// the landing stored in the prompt, so tail resumes keep their own.
    tail_return_point: Cell<*mut ReturnPoint>,
}

/// A refcounted resumption that may be resumed any number of times.
/// Cloning is how additional resumes are paid for: every resume consumes
/// one handle.
///
/// Replays restore captured stacks byte-for-byte; frames captured across
/// the yield must hold plain data only (anything owning heap memory would
/// be duplicated).
pub struct MultiResume {
    inner: NonNull<MultiInner>,
}

impl MultiResume {
    pub(crate) fn create(p: NonNull<Prompt>) -> MultiResume {
        let inner = Box::new(MultiInner {
            refcount: Cell::new(1),
            resume_count: Cell::new(0),
            prompt: p,
            saves: RefCell::new(Vec::new()),
            tail_return_point: Cell::new(Prompt::return_point(p)),
        });
        MultiResume { inner: unsafe { NonNull::new_unchecked(Box::into_raw(inner)) } }
    }

    fn inner(&self) -> &MultiInner {
        unsafe { self.inner.as_ref() }
    }

    /// How many times this resumption has been resumed so far.
    pub fn resume_count(&self) -> u64 {
        self.inner().resume_count.get()
    }

    /// True when this is the only reference and no resume has happened:
    /// the captured chain would be lost, so a client that maintains
    /// cleanup state should unwind instead of dropping.
    pub fn should_unwind(&self) -> bool {
        self.inner().refcount.get() == 1 && self.inner().resume_count.get() == 0
    }

    /// Make the prompt chain pristine for one more resume: restore the
    /// saved stacks if this is a replay, or snapshot them the moment a
    /// second user shows up. Consumes this handle.
    fn acquire_prompt(self) -> NonNull<Prompt> {
        let this = ManuallyDrop::new(self);
        let inner = unsafe { this.inner.as_ref() };
        let p = inner.prompt;
        {
            let mut saves = inner.saves.borrow_mut();
            if !saves.is_empty() {
                for save in saves.iter() {
                    unsafe { save.snapshot.restore() };
                }
            } else if inner.refcount.get() > 1 || Prompt::refcount(p) > 1 {
                *saves = unsafe { capture_chain(p) };
            }
        }
        Prompt::dup(p);
        unsafe { drop_inner(this.inner) };
        p
    }

    /// Jump back to the yield site with `arg`, consuming this handle;
    /// clone first to resume again later.
    ///
    /// # Safety
    ///
    /// Must be called on the thread that captured the resumption.
    pub unsafe fn resume(self, arg: Word) -> Word {
        let inner = self.inner();
        inner.resume_count.set(inner.resume_count.get() + 1);
        let p = self.acquire_prompt();
        unsafe { prompt_resume(p, arg, false) }
    }

    /// Resume in tail position, reusing the original return landing when
    /// it is still intact; falls back to a plain resume otherwise.
    ///
    /// # Safety
    ///
    /// As [`MultiResume::resume`], in tail position of a yield function.
    pub unsafe fn resume_tail(self, arg: Word) -> Word {
        let ret = self.inner().tail_return_point.replace(ptr::null_mut());
        if ret.is_null() {
            return unsafe { self.resume(arg) };
        }
        let inner = self.inner();
        inner.resume_count.set(inner.resume_count.get() + 1);
        let p = self.acquire_prompt();
        unsafe { resume_tail_to(p, arg, ret) }
    }
}

impl Clone for MultiResume {
    fn clone(&self) -> MultiResume {
        let rc = &self.inner().refcount;
        rc.set(rc.get() + 1);
        MultiResume { inner: self.inner }
    }
}

impl Drop for MultiResume {
    fn drop(&mut self) {
        if self.should_unwind() {
            // Sole owner of a never-resumed chain: tear it down so drops
            // in the captured region run. Keep the chain alive across the
            // record teardown; the unwind landing releases the last
            // reference.
            let p = Prompt::dup(unsafe { self.inner.as_ref() }.prompt);
            unsafe {
                drop_inner(self.inner);
                prompt_resume(p, ptr::null_mut(), true);
            }
        } else {
            unsafe { drop_inner(self.inner) };
        }
    }
}

/// Drop one reference to the record; the last reference frees the saved
/// snapshots and the prompt reference it holds.
unsafe fn drop_inner(inner: NonNull<MultiInner>) {
    let rc = &unsafe { inner.as_ref() }.refcount;
    let old = rc.get();
    rc.set(old - 1);
    if old <= 1 {
        let boxed = unsafe { Box::from_raw(inner.as_ptr()) };
        for save in boxed.saves.into_inner() {
            drop(save.snapshot);
            unsafe { Prompt::drop_ref(save.prompt) };
        }
        unsafe { Prompt::drop_ref(boxed.prompt) };
    }
}

/// Snapshot every stack of the captured chain rooted at `p`, from the
/// suspension point of each stack down to its base.
unsafe fn capture_chain(p: NonNull<Prompt>) -> Vec<PromptSave> {
    debug_assert!(!unsafe { p.as_ref() }.is_active());
    let mut saves = Vec::new();
    unsafe {
        let mut sp = (*Prompt::resume_point(p)).saved_sp();
        let mut q = NonNull::new(Prompt::top_of(p)).expect("suspended prompt without a chain");
        loop {
            // Take the extra reference before the snapshot so the image
            // holds the refcount a restore must reproduce.
            let prompt = Prompt::dup(q);
            let snapshot = (*Prompt::gstack_of(q).as_ptr()).save(sp);
            saves.push(PromptSave { prompt, snapshot });
            let parent = Prompt::parent_of(q);
            if parent.is_null() {
                break;
            }
            sp = (*Prompt::return_point(q)).saved_sp();
            q = NonNull::new_unchecked(parent);
        }
    }
    saves
}
