//! The per-thread shadow stack of handler frames.
//!
//! Frames are ordinary stack-allocated records linked through parent
//! pointers; a thread-local holds the innermost one. A scoped guard
//! pushes and pops in strict LIFO order, and because popping happens in
//! `Drop`, the stack stays consistent when a panic unwinds through a
//! frame's extent.

use crate::{Effect, HandlerDef, Value};
use core::cell::Cell;
use core::ptr::{self, NonNull};
use multiprompt::Prompt;

pub(crate) struct Frame {
    /// Next frame outwards; rewritten when a captured extent is relinked
    /// under a new context.
    pub(crate) parent: Cell<*mut Frame>,
    pub(crate) data: FrameData,
}

pub(crate) enum FrameData {
    Handler(HandlerData),
    /// Hide every frame up to and including the innermost handler of
    /// `skip_until` from operation search.
    Under { skip_until: Effect },
    /// Hide `from`-th and closer enclosing handlers of `effect`.
    Mask { effect: Effect, from: usize },
}

pub(crate) struct HandlerData {
    pub(crate) effect: Effect,
    pub(crate) def: &'static HandlerDef,
    pub(crate) prompt: NonNull<Prompt>,
    pub(crate) local: Cell<Value>,
}

impl Frame {
    pub(crate) fn handler(def: &'static HandlerDef, local: Value, prompt: NonNull<Prompt>) -> Frame {
        Frame {
            parent: Cell::new(ptr::null_mut()),
            data: FrameData::Handler(HandlerData {
                effect: def.effect,
                def,
                prompt,
                local: Cell::new(local),
            }),
        }
    }

    pub(crate) fn under(skip_until: Effect) -> Frame {
        Frame { parent: Cell::new(ptr::null_mut()), data: FrameData::Under { skip_until } }
    }

    pub(crate) fn mask(effect: Effect, from: usize) -> Frame {
        Frame { parent: Cell::new(ptr::null_mut()), data: FrameData::Mask { effect, from } }
    }

    pub(crate) fn handler_data(&self) -> &HandlerData {
        match &self.data {
            FrameData::Handler(h) => h,
            _ => unreachable!("frame is not a handler"),
        }
    }
}

thread_local! {
    static FRAME_TOP: Cell<*mut Frame> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) fn frame_top() -> *mut Frame {
    FRAME_TOP.get()
}

pub(crate) fn set_frame_top(f: *mut Frame) {
    FRAME_TOP.set(f);
}

/// Links a frame on push and unlinks it on drop, including drops driven
/// by unwinding.
pub(crate) struct FrameGuard {
    frame: *mut Frame,
}

impl FrameGuard {
    /// # Safety
    ///
    /// `frame` must outlive the guard and stay pinned at its address.
    pub(crate) unsafe fn push(frame: *mut Frame) -> FrameGuard {
        unsafe { (*frame).parent.set(FRAME_TOP.get()) };
        FRAME_TOP.set(frame);
        FrameGuard { frame }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        debug_assert_eq!(FRAME_TOP.get(), self.frame);
        FRAME_TOP.set(unsafe { (*self.frame).parent.get() });
    }
}

/// Masked, under-aware search for the innermost handler of `effect`.
pub(crate) fn find(effect: Effect) -> Option<NonNull<Frame>> {
    let mut f = frame_top();
    let mut mask_level = 0usize;
    unsafe {
        while !f.is_null() {
            match (*f).data {
                FrameData::Handler(ref h) if h.effect == effect => {
                    if mask_level == 0 {
                        return Some(NonNull::new_unchecked(f));
                    }
                    mask_level -= 1;
                }
                FrameData::Under { skip_until } => {
                    // Skip to the matching enclosing handler; the trailing
                    // step below skips that handler itself, which is the
                    // point of an under frame.
                    loop {
                        f = (*f).parent.get();
                        if f.is_null() {
                            return None;
                        }
                        if matches!((*f).data, FrameData::Handler(ref h) if h.effect == skip_until)
                        {
                            break;
                        }
                    }
                }
                FrameData::Mask { effect: masked, from } if masked == effect && from <= mask_level => {
                    mask_level += 1;
                }
                _ => {}
            }
            f = (*f).parent.get();
        }
    }
    None
}
