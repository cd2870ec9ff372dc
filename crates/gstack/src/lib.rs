//! Growable stacks with on-demand commit.
//!
//! This crate provides the memory substrate for multi-prompt delimited
//! control: per-logical-stack virtual reservations whose physical pages
//! arrive on demand, a register-context switch primitive, save/restore of
//! live stack regions for multi-shot resumption, and the process-wide
//! page-fault handler that makes all of it work on systems without
//! reliable overcommit.
//!
//! Two commit strategies are supported and chosen at configuration time:
//!
//! * **Overcommit**: where the kernel hands out pages on first touch for
//!   `NORESERVE` mappings, each stack is a private reservation with guard
//!   gaps at both ends and the whole usable range committed up front.
//! * **Gpool**: otherwise stacks live inside very large pooled
//!   reservations and a SIGSEGV handler commits pages as the stack grows,
//!   doubling the committed window per fault (capped at 1 MiB).
//!
//! Configuration is process-wide; see [`Config`] and [`init`]. Everything
//! else is per thread: freed stacks are cached (up to
//! `stack_cache_count`) and frees during unwinding are delayed until the
//! next allocation.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod config;
        mod ctx;
        mod fault;
        mod gpool;
        mod stack;
        mod sys;
        mod util;

        pub use config::{Config, init};
        pub use ctx::{Jmpbuf, StackStartFn, ctx_enter, ctx_restore, ctx_save};
        pub use stack::{Gstack, GstackError, GstackSnapshot, clear_cache};
        pub use util::{FatalHandler, set_fatal_handler};
    } else {
        compile_error!("multiprompt-gstack currently supports unix targets only");
    }
}
