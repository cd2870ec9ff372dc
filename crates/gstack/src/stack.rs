//! Growable stacks.
//!
//! A gstack is a fixed-size virtual reservation whose physical pages are
//! committed on demand. The [`Gstack`] record itself lives at the base
//! (the highest usable address) of the stack it describes, so allocating a
//! stack performs no separate heap allocation; callers can carve
//! additional space out of the base with [`Gstack::reserve`] for records
//! that must share the stack's lifetime.

use crate::config::runtime;
use crate::ctx::{self, Jmpbuf, StackStartFn};
use crate::util::align_up;
use crate::{fault, gpool, sys};
use core::cell::RefCell;
use core::mem::size_of;
use core::ptr::{self, NonNull};

/// Written at a fixed distance below the base; still being intact when the
/// stack is freed means the committed window never grew past the initial
/// commit, so the decommit on reuse can be skipped. Fresh commits are
/// zero-filled on both supported paths, so a stale slot cannot spuriously
/// match.
const CANARY: u64 = 0x6d70_7374_6163_6b21;

#[derive(Debug, thiserror::Error)]
pub enum GstackError {
    /// The OS refused to reserve or had no memory for a stack.
    #[error("out of memory while allocating a stack")]
    OutOfMemory,
    /// The OS refused to commit the initial pages of a stack.
    #[error("unable to commit the initial stack pages")]
    CommitFailed,
}

/// A growable stack. The record lives inside the memory it describes, at
/// the base of the usable range; all access is through raw pointers
/// handed out by [`Gstack::alloc`].
#[repr(C)]
pub struct Gstack {
    /// Start of the reservation this stack came from. Equals `stack` for
    /// pooled stacks; `stack - gap` for private mmap stacks.
    full: *mut u8,
    full_size: usize,
    /// Lowest usable address.
    stack: *mut u8,
    stack_size: usize,
    initial_commit: usize,
    /// Bytes carved off the base for this record plus client records.
    initial_reserved: usize,
    from_pool: bool,
}

impl Gstack {
    /// One past the highest usable address; the stack grows down from
    /// here.
    pub fn base(&self) -> *mut u8 {
        unsafe { self.stack.add(self.stack_size) }
    }

    /// Whether `p` points into this stack's usable range.
    pub fn contains(&self, p: *mut u8) -> bool {
        let addr = p as usize;
        addr >= self.stack as usize && addr < self.base() as usize
    }

    fn canary_ptr(&self) -> *mut u64 {
        unsafe { self.base().sub(self.initial_commit).add(size_of::<u64>()).cast() }
    }

    fn set_canary(&self) {
        unsafe { ptr::write_volatile(self.canary_ptr(), CANARY) }
    }

    fn has_canary(&self) -> bool {
        unsafe { ptr::read_volatile(self.canary_ptr()) == CANARY }
    }

    /// Allocate a stack, from the per-thread cache when possible.
    pub fn alloc() -> Result<NonNull<Gstack>, GstackError> {
        let rt = runtime();
        fault::thread_init();

        let mut cached = None;
        let _ = TLS.try_with(|tls| {
            let mut tls = tls.borrow_mut();
            let tls = &mut *tls;
            if !std::thread::panicking() {
                for g in tls.delayed.drain(..) {
                    free_or_cache(&mut tls.cache, g);
                }
            }
            cached = tls.cache.pop();
        });
        if let Some(g) = cached {
            return Ok(g);
        }

        let (full, full_size, stack, stack_size, initial_commit, from_pool) = if rt.use_gpools {
            let (stk, stk_size) = gpool::alloc().ok_or(GstackError::OutOfMemory)?;
            let commit_start = unsafe { stk.add(stk_size - rt.initial_commit) };
            if !sys::commit(commit_start, rt.initial_commit) {
                gpool::free(stk);
                return Err(GstackError::CommitFailed);
            }
            (stk, rt.gstack_size, stk, stk_size, rt.initial_commit, true)
        } else {
            // The kernel overcommits: reserve with no-access gaps at both
            // ends and commit the whole usable range up front, paying for
            // pages only when they fault in.
            let full = sys::reserve(rt.gstack_size).ok_or(GstackError::OutOfMemory)?;
            let stack = unsafe { full.add(rt.gap_size) };
            let stack_size = rt.gstack_size - 2 * rt.gap_size;
            if !sys::commit(stack, stack_size) {
                sys::release(full, rt.gstack_size);
                return Err(GstackError::CommitFailed);
            }
            (full, rt.gstack_size, stack, stack_size, stack_size, false)
        };

        let base = unsafe { stack.add(stack_size) };
        #[cfg(debug_assertions)]
        unsafe {
            ptr::write_bytes(base.sub(rt.initial_commit), 0xfd, rt.initial_commit);
        }

        let g = unsafe { base.sub(initial_reserved_default()).cast::<Gstack>() };
        unsafe {
            ptr::write(
                g,
                Gstack {
                    full,
                    full_size,
                    stack,
                    stack_size,
                    initial_commit,
                    initial_reserved: initial_reserved_default(),
                    from_pool,
                },
            );
            (*g).set_canary();
        }
        Ok(unsafe { NonNull::new_unchecked(g) })
    }

    /// Carve `size` bytes out of the base of the stack, below any earlier
    /// reservations. The returned region lives exactly as long as the
    /// stack itself; it must fit well within the initial commit.
    pub unsafe fn reserve(&mut self, size: usize) -> *mut u8 {
        let size = align_up(size, 16);
        let p = unsafe { self.base().sub(self.initial_reserved + size) };
        self.initial_reserved += size;
        assert!(self.initial_reserved < self.initial_commit);
        p
    }

    /// Switch to this stack and call `start(arg)` on it. The caller's
    /// context is written to `landing`; `start` must leave the stack via a
    /// context restore, never by returning.
    pub unsafe fn enter(&mut self, landing: *mut Jmpbuf, start: StackStartFn, arg: *mut u8) -> usize {
        // A little headroom below the reserved records keeps the record
        // bytes out of the entry function's frame.
        let sp = unsafe { self.base().sub(self.initial_reserved + 16) };
        unsafe { ctx::ctx_enter(sp, landing, start, arg) }
    }

    /// Release a stack. With `delay`, or while a panic is unwinding, the
    /// stack is parked on the thread's delayed list and reclaimed at the
    /// next allocation; unwinding may still read records on the stack
    /// being torn down.
    pub unsafe fn free(g: NonNull<Gstack>, delay: bool) {
        let parked = TLS
            .try_with(|tls| {
                let mut tls = tls.borrow_mut();
                if delay || std::thread::panicking() {
                    tls.delayed.push(g);
                } else {
                    free_or_cache(&mut tls.cache, g);
                }
            })
            .is_ok();
        if !parked {
            os_free(g);
        }
    }

    /// Copy the live bytes between `sp` and the base (the record and any
    /// reserved client records included) into a heap snapshot.
    pub unsafe fn save(&self, sp: *mut u8) -> GstackSnapshot {
        debug_assert!(self.contains(sp));
        let len = self.base() as usize - sp as usize;
        let mut data = Vec::with_capacity(len);
        unsafe {
            ptr::copy_nonoverlapping(sp, data.as_mut_ptr(), len);
            data.set_len(len);
        }
        GstackSnapshot { at: sp, data: data.into_boxed_slice() }
    }
}

/// A saved stack image; restoring writes the bytes back to the addresses
/// they came from.
pub struct GstackSnapshot {
    at: *mut u8,
    data: Box<[u8]>,
}

impl GstackSnapshot {
    /// Write the snapshot back in place. The target stack must still be
    /// allocated and not currently executing.
    pub unsafe fn restore(&self) {
        unsafe { ptr::copy_nonoverlapping(self.data.as_ptr(), self.at, self.data.len()) }
    }
}

fn initial_reserved_default() -> usize {
    align_up(size_of::<Gstack>(), 16)
}

struct ThreadStacks {
    cache: Vec<NonNull<Gstack>>,
    delayed: Vec<NonNull<Gstack>>,
}

impl Drop for ThreadStacks {
    fn drop(&mut self) {
        for g in self.cache.drain(..).chain(self.delayed.drain(..)) {
            unsafe { os_free(g) };
        }
    }
}

thread_local! {
    static TLS: RefCell<ThreadStacks> = RefCell::new(ThreadStacks {
        cache: Vec::new(),
        delayed: Vec::new(),
    });
}

/// Park `g` in the cache, resetting its committed window if the canary
/// says it grew; fall back to the OS when the cache is full.
fn free_or_cache(cache: &mut Vec<NonNull<Gstack>>, g: NonNull<Gstack>) {
    let rt = runtime();
    if cache.len() < rt.cache_count {
        unsafe {
            let g = g.as_ptr();
            (*g).initial_reserved = initial_reserved_default();
            if (*g).has_canary() || reset_stack(g) {
                cache.push(NonNull::new_unchecked(g));
                return;
            }
        }
    }
    unsafe { os_free(g) };
}

/// Return the pages of a grown stack to the OS, keeping the reservation
/// and the initial-commit window (which holds the record and the canary).
unsafe fn reset_stack(g: *mut Gstack) -> bool {
    let rt = runtime();
    unsafe {
        let len = (*g).stack_size - (*g).initial_commit;
        if len > 0 && !sys::reset((*g).stack, len, rt.reset_decommits) {
            return false;
        }
        (*g).set_canary();
        true
    }
}

unsafe fn os_free(g: NonNull<Gstack>) {
    // Copy the record out first: for pooled stacks the reset below wipes
    // the memory the record lives in.
    let record = unsafe { ptr::read(g.as_ptr()) };
    if record.from_pool {
        sys::reset(record.stack, record.stack_size, runtime().reset_decommits);
        gpool::free(record.full);
    } else {
        sys::release(record.full, record.full_size);
    }
}

/// Drop every cached and delayed stack of the current thread back to the
/// OS.
pub fn clear_cache() {
    let _ = TLS.try_with(|tls| {
        let mut tls = tls.borrow_mut();
        let tls = &mut *tls;
        for g in tls.cache.drain(..).chain(tls.delayed.drain(..)) {
            unsafe { os_free(g) };
        }
    });
}
