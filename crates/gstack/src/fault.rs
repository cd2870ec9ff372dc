//! The process-wide page-fault handler and its per-thread signal stacks.
//!
//! In the gpool path, stack pages past the initial commit are PROT_NONE
//! until first touch; the SIGSEGV/SIGBUS handler commits them on demand
//! with quadratic growth, reports stack overflow when the gap (or the
//! final usable page) is hit, and forwards every unrelated fault to
//! whichever handler was installed before ours. Handling a fault caused by
//! an exhausted stack requires an alternate signal stack, registered once
//! per thread.

use crate::config::installed_runtime;
use crate::util::{align_down, fatal, raw_stderr};
use crate::{gpool, sys};
use core::cell::Cell;
use core::ffi::{c_int, c_void};
use core::mem::MaybeUninit;
use core::ptr;

const SIG_STACK_SIZE: usize = 32 * 1024;

struct PrevAction(core::cell::UnsafeCell<MaybeUninit<libc::sigaction>>);

// Written once during process init, read-only afterwards (including from
// signal context).
unsafe impl Sync for PrevAction {}

static PREV_SEGV: PrevAction = PrevAction(core::cell::UnsafeCell::new(MaybeUninit::zeroed()));
#[cfg(not(target_os = "linux"))]
static PREV_BUS: PrevAction = PrevAction(core::cell::UnsafeCell::new(MaybeUninit::zeroed()));

fn prev_for(signum: c_int) -> *mut libc::sigaction {
    #[cfg(not(target_os = "linux"))]
    if signum == libc::SIGBUS {
        return PREV_BUS.0.get().cast();
    }
    let _ = signum;
    PREV_SEGV.0.get().cast()
}

/// Grow the committed window of a faulting stack. `available` is the
/// number of usable bytes below the faulting page.
fn grow_stack(page: *mut u8, available: usize, stack_size: usize) {
    let rt = installed_runtime();
    let used = stack_size - available;
    let mut extra = 0usize;
    if rt.grow_fast && used > 0 {
        extra = 2 * used;
    }
    extra = extra.min(crate::config::MIB).min(available);
    extra = align_down(extra, rt.page_size);
    let start = page.wrapping_sub(extra);
    if !sys::commit(start, extra + rt.page_size) {
        fatal("unable to commit stack memory on demand");
    }
}

unsafe fn forward(signum: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    unsafe {
        let prev = &*prev_for(signum);
        if prev.sa_flags & libc::SA_SIGINFO != 0 {
            if prev.sa_sigaction != 0 {
                let f: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
                    core::mem::transmute(prev.sa_sigaction);
                f(signum, info, ctx);
            }
            return;
        }
        match prev.sa_sigaction {
            libc::SIG_IGN => {}
            libc::SIG_DFL => {
                // Reinstate the default disposition and return; the
                // faulting instruction re-executes and the process dies
                // with the expected signal.
                libc::sigaction(signum, prev, ptr::null_mut());
            }
            handler => {
                let f: extern "C" fn(c_int) = core::mem::transmute(handler);
                f(signum);
            }
        }
    }
}

extern "C" fn fault_handler(signum: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let addr = unsafe { (*info).si_addr() } as *mut u8;
    let page = align_down(addr as usize, installed_runtime().page_size) as *mut u8;
    match gpool::check_access(page) {
        gpool::Access::Stack { available, stack_size } => {
            grow_stack(page, available, stack_size);
        }
        gpool::Access::Meta => {
            // First touch of a fresh pool header tail (the demand-zeroed
            // free array).
            if !sys::commit(page, installed_runtime().page_size) {
                fatal("unable to commit gpool metadata");
            }
        }
        gpool::Access::Overflow => {
            raw_stderr(b"multiprompt: stack overflow\n");
            fatal("stack overflow in a growable stack");
        }
        gpool::Access::None => unsafe { forward(signum, info, ctx) },
    }
}

/// Install the fault handler (and remember the previous ones) plus the
/// process-exit teardown. Called exactly once, after the configuration has
/// been resolved.
pub(crate) fn process_init() {
    let rt = installed_runtime();
    if rt.use_gpools {
        unsafe {
            let mut act: libc::sigaction = core::mem::zeroed();
            act.sa_sigaction = fault_handler as usize;
            act.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut act.sa_mask);
            if libc::sigaction(libc::SIGSEGV, &act, prev_for(libc::SIGSEGV)) != 0 {
                fatal("unable to install the page fault handler");
            }
            #[cfg(not(target_os = "linux"))]
            if libc::sigaction(libc::SIGBUS, &act, prev_for(libc::SIGBUS)) != 0 {
                fatal("unable to install the page fault handler");
            }
        }
    }
    unsafe {
        let _ = libc::atexit(process_done);
    }
}

extern "C" fn process_done() {
    let rt = installed_runtime();
    if rt.use_gpools {
        unsafe {
            libc::sigaction(libc::SIGSEGV, prev_for(libc::SIGSEGV), ptr::null_mut());
            #[cfg(not(target_os = "linux"))]
            libc::sigaction(libc::SIGBUS, prev_for(libc::SIGBUS), ptr::null_mut());
        }
    }
    gpool::release_all();
}

/// An alternate signal stack, owned by its thread and deregistered on
/// thread exit.
struct SigStack {
    mem: *mut u8,
}

impl Drop for SigStack {
    fn drop(&mut self) {
        unsafe {
            let ss = libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: SIG_STACK_SIZE,
            };
            libc::sigaltstack(&ss, ptr::null_mut());
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.mem, SIG_STACK_SIZE)));
        }
    }
}

thread_local! {
    static SIG_STACK: Cell<Option<SigStack>> = const { Cell::new(None) };
}

/// Ensure this thread can run the fault handler while its stack pointer
/// sits in a no-access page. No-op when an alternate stack is already
/// registered (by us or by the embedder).
pub(crate) fn thread_init() {
    if !installed_runtime().use_gpools {
        return;
    }
    let _ = SIG_STACK.try_with(|slot| {
        let cur = slot.take();
        if cur.is_some() {
            slot.set(cur);
            return;
        }
        unsafe {
            let mut old: libc::stack_t = core::mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut old) == 0 && !old.ss_sp.is_null() {
                // The embedder already provides one.
                return;
            }
            let mem = Box::into_raw(vec![0u8; SIG_STACK_SIZE].into_boxed_slice()) as *mut u8;
            let ss = libc::stack_t {
                ss_sp: mem.cast(),
                ss_flags: 0,
                ss_size: SIG_STACK_SIZE,
            };
            if libc::sigaltstack(&ss, ptr::null_mut()) != 0 {
                log::error!("unable to register an alternate signal stack");
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(mem, SIG_STACK_SIZE)));
                return;
            }
            slot.set(Some(SigStack { mem }));
        }
    });
}
