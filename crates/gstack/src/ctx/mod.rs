//! A minimal register context: save, restore, and enter-on-a-fresh-stack.
//!
//! The C library `setjmp`/`longjmp` cannot be used for stack switching: most
//! implementations save and restore signal masks, or walk unwind tables on
//! the jump, and both behaviors are wrong once the stack pointer moves to a
//! different allocation. These routines save exactly the callee-saved
//! register state (plus SP, IP, and the floating point control words) and
//! nothing else.
//!
//! The contract is `setjmp`-shaped and therefore subtle:
//!
//! * [`ctx_save`] returns `1` when it stores the context and `0` every time
//!   a [`ctx_restore`] jumps back to it. Code between a save and a matching
//!   restore must communicate with the post-restore branch through memory
//!   reachable from the saved buffer, never through locals written after
//!   the save.
//! * [`ctx_restore`] never returns.
//! * [`ctx_enter`] writes a context equivalent to a [`ctx_save`] performed
//!   at its own call site into `landing`, switches SP to `base`, and calls
//!   `start(arg)`. `start` must never return normally; it leaves the stack
//!   by restoring some saved context. A restore of `landing` makes
//!   `ctx_enter` appear to return `0`.

use core::mem::offset_of;

cfg_if::cfg_if! {
    if #[cfg(all(unix, target_arch = "x86_64"))] {
        mod x86_64;
        pub use x86_64::{ctx_enter, ctx_restore, ctx_save};
    } else if #[cfg(all(unix, target_arch = "aarch64"))] {
        mod aarch64;
        pub use aarch64::{ctx_enter, ctx_restore, ctx_save};
    } else {
        compile_error!("multiprompt-gstack: unsupported platform, add ctx routines for this target");
    }
}

/// Entry function for [`ctx_enter`]; runs on the fresh stack and must leave
/// it with a [`ctx_restore`] rather than by returning.
pub type StackStartFn = unsafe extern "C" fn(arg: *mut u8) -> !;

/// A saved register context.
///
/// The layout is fixed per architecture and read by the assembly in this
/// module at hard-coded offsets; the `const` assertions below pin them.
/// `ip` and `sp` are first so that callers embedding a `Jmpbuf` as the
/// leading field of a larger record can inspect the saved stack pointer.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug)]
pub struct Jmpbuf {
    pub reg_ip: *mut u8,
    pub reg_sp: *mut u8,
    reg_rbx: u64,
    reg_rbp: u64,
    reg_r12: u64,
    reg_r13: u64,
    reg_r14: u64,
    reg_r15: u64,
    reg_mxcsr: u32,
    reg_fpcw: u16,
    _pad: u16,
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug)]
pub struct Jmpbuf {
    pub reg_ip: *mut u8,
    pub reg_sp: *mut u8,
    reg_x19: u64,
    reg_x20: u64,
    reg_x21: u64,
    reg_x22: u64,
    reg_x23: u64,
    reg_x24: u64,
    reg_x25: u64,
    reg_x26: u64,
    reg_x27: u64,
    reg_x28: u64,
    reg_fp: u64,
    reg_d8: u64,
    reg_d9: u64,
    reg_d10: u64,
    reg_d11: u64,
    reg_d12: u64,
    reg_d13: u64,
    reg_d14: u64,
    reg_d15: u64,
    reg_fpcr: u64,
    reg_fpsr: u64,
}

impl Jmpbuf {
    /// A zeroed context; only valid as a target for [`ctx_save`] or the
    /// `landing` of [`ctx_enter`].
    pub fn zeroed() -> Jmpbuf {
        // A context is plain-old-data on every supported target.
        unsafe { core::mem::zeroed() }
    }
}

#[cfg(target_arch = "x86_64")]
const _: () = {
    assert!(offset_of!(Jmpbuf, reg_ip) == 0);
    assert!(offset_of!(Jmpbuf, reg_sp) == 8);
    assert!(offset_of!(Jmpbuf, reg_rbx) == 16);
    assert!(offset_of!(Jmpbuf, reg_rbp) == 24);
    assert!(offset_of!(Jmpbuf, reg_r12) == 32);
    assert!(offset_of!(Jmpbuf, reg_r13) == 40);
    assert!(offset_of!(Jmpbuf, reg_r14) == 48);
    assert!(offset_of!(Jmpbuf, reg_r15) == 56);
    assert!(offset_of!(Jmpbuf, reg_mxcsr) == 64);
    assert!(offset_of!(Jmpbuf, reg_fpcw) == 68);
};

#[cfg(target_arch = "aarch64")]
const _: () = {
    assert!(offset_of!(Jmpbuf, reg_ip) == 0);
    assert!(offset_of!(Jmpbuf, reg_sp) == 8);
    assert!(offset_of!(Jmpbuf, reg_x19) == 16);
    assert!(offset_of!(Jmpbuf, reg_x28) == 88);
    assert!(offset_of!(Jmpbuf, reg_fp) == 96);
    assert!(offset_of!(Jmpbuf, reg_d8) == 104);
    assert!(offset_of!(Jmpbuf, reg_d15) == 160);
    assert!(offset_of!(Jmpbuf, reg_fpcr) == 168);
    assert!(offset_of!(Jmpbuf, reg_fpsr) == 176);
};
