//! Multi-prompt delimited control with in-place growable stacks.
//!
//! A [`prompt`] installs a delimiter around a dynamic extent of
//! computation running on its own growable stack. Within that extent,
//! [`yield_to`] suspends everything between the current point and a named
//! ancestor prompt, packages it as a first-class [`OnceResume`], and runs
//! a function with it on the ancestor's parent stack; resuming jumps back
//! to the yield site. [`yield_multi`] produces a refcounted
//! [`MultiResume`] whose captured stacks are lazily snapshotted so it can
//! be resumed any number of times.
//!
//! The API at this layer is deliberately word-valued and `unsafe`: values
//! cross stack switches as `*mut ()` and closures do not exist, only
//! function pointers plus an environment word. Typed, safe surfaces are
//! built on top (see the `multiprompt-effects` crate).
//!
//! Panics propagate across prompts: a panic inside a prompt's extent
//! first unwinds the prompt's own stack (running drops there), then is
//! re-raised on the parent stack. Dropping a resumption without resuming
//! it unwinds the captured extent the same way.
//!
//! Prompts and resumptions are bound to the thread that created them;
//! every handle is `!Send`, which rules out cross-thread resumes
//! statically.

mod prompt;
mod resume;

pub use multiprompt_gstack::{
    Config, FatalHandler, GstackError, clear_cache, init, set_fatal_handler,
};
pub use prompt::{
    ChainUnwind, MultiYieldFn, Prompt, StartFn, Word, YieldFn, prompt, prompt_enter,
    prompt_parent, try_prompt, yield_multi, yield_to,
};
pub use resume::{MultiResume, OnceResume};
