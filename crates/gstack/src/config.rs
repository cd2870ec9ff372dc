//! Global configuration of the stack allocator.
//!
//! Configuration is process-wide and installed at most once: either
//! explicitly through [`init`] before any stack is allocated, or
//! implicitly with defaults on first use. Size fields left at zero take
//! their default value.

use crate::util::align_up;
use crate::{fault, sys};
use std::sync::{Once, OnceLock};

pub(crate) const KIB: usize = 1024;
pub(crate) const MIB: usize = 1024 * KIB;
pub(crate) const GIB: usize = 1024 * MIB;

/// Builder-style configuration for the allocator.
///
/// ```
/// let mut config = multiprompt_gstack::Config::new();
/// config.stack_max_size(2 * 1024 * 1024).stack_cache_count(8);
/// multiprompt_gstack::init(&config);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    gpool_enable: bool,
    gpool_max_size: usize,
    stack_max_size: usize,
    stack_exn_guaranteed: usize,
    stack_initial_commit: usize,
    stack_gap_size: usize,
    stack_cache_count: isize,
    stack_grow_fast: bool,
    stack_use_overcommit: bool,
    stack_reset_decommits: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl Config {
    pub fn new() -> Config {
        Config {
            gpool_enable: false,
            gpool_max_size: 0,
            stack_max_size: 0,
            stack_exn_guaranteed: 0,
            stack_initial_commit: 0,
            stack_gap_size: 0,
            stack_cache_count: 0,
            stack_grow_fast: true,
            stack_use_overcommit: false,
            stack_reset_decommits: false,
        }
    }

    /// Force the use of gpools even where the OS could commit on demand.
    pub fn gpool_enable(&mut self, enable: bool) -> &mut Self {
        self.gpool_enable = enable;
        self
    }

    /// Virtual reservation per gpool (default 256 GiB).
    pub fn gpool_max_size(&mut self, bytes: usize) -> &mut Self {
        self.gpool_max_size = bytes;
        self
    }

    /// Virtual reservation per gstack, including the guard gaps
    /// (default 8 MiB).
    pub fn stack_max_size(&mut self, bytes: usize) -> &mut Self {
        self.stack_max_size = bytes;
        self
    }

    /// Extra stack guaranteed to be committed while a host exception
    /// unwinds (default 32 KiB). Recorded for platforms whose unwinder may
    /// not re-enter the fault handler; the unix build has no such
    /// restriction and only records the value.
    pub fn stack_exn_guaranteed(&mut self, bytes: usize) -> &mut Self {
        self.stack_exn_guaranteed = bytes;
        self
    }

    /// Bytes committed eagerly at the base of a fresh stack (default one
    /// OS page).
    pub fn stack_initial_commit(&mut self, bytes: usize) -> &mut Self {
        self.stack_initial_commit = bytes;
        self
    }

    /// No-access gap bracketing each stack (default 64 KiB).
    pub fn stack_gap_size(&mut self, bytes: usize) -> &mut Self {
        self.stack_gap_size = bytes;
        self
    }

    /// Per-thread cache of freed stacks (default 4; negative disables the
    /// cache entirely).
    pub fn stack_cache_count(&mut self, count: isize) -> &mut Self {
        self.stack_cache_count = count;
        self
    }

    /// Grow the committed window quadratically on a fault rather than one
    /// page at a time (default true).
    pub fn stack_grow_fast(&mut self, enable: bool) -> &mut Self {
        self.stack_grow_fast = enable;
        self
    }

    /// Prefer the kernel's overcommit to gpools where it is reliable
    /// (default false).
    pub fn stack_use_overcommit(&mut self, enable: bool) -> &mut Self {
        self.stack_use_overcommit = enable;
        self
    }

    /// Fully decommit stack memory when a stack is reset instead of the
    /// cheaper `MADV_FREE`-style reset (default false).
    pub fn stack_reset_decommits(&mut self, enable: bool) -> &mut Self {
        self.stack_reset_decommits = enable;
        self
    }
}

/// Resolved, immutable settings shared by the whole process.
#[derive(Debug)]
pub(crate) struct Runtime {
    pub page_size: usize,
    /// Full reservation per gstack (gaps included), page aligned.
    pub gstack_size: usize,
    pub gap_size: usize,
    pub initial_commit: usize,
    #[allow(dead_code, reason = "recorded contract surface; used on platforms with exception-time commit")]
    pub exn_guaranteed: usize,
    /// Resolved cache capacity; zero disables caching.
    pub cache_count: usize,
    pub grow_fast: bool,
    pub reset_decommits: bool,
    pub gpool_size: usize,
    pub use_gpools: bool,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static PROCESS_INIT: Once = Once::new();

fn resolve(config: &Config) -> Runtime {
    let page_size = sys::page_size();
    let pick = |v: usize, default: usize| if v == 0 { default } else { v };

    let gstack_size = align_up(pick(config.stack_max_size, 8 * MIB), page_size);
    let mut gap_size = align_up(pick(config.stack_gap_size, 64 * KIB), page_size);
    if gap_size > gstack_size / 2 {
        gap_size = align_up(gstack_size / 2, page_size);
    }
    let mut initial_commit = align_up(pick(config.stack_initial_commit, page_size), page_size);
    if initial_commit > gstack_size {
        initial_commit = gstack_size;
    }

    // Gpools are the default; the kernel's overcommit is only trusted when
    // the user prefers it, the kernel actually provides it, and gpools are
    // not forced.
    let overcommit = config.stack_use_overcommit && !config.gpool_enable && sys::use_overcommit();

    Runtime {
        page_size,
        gstack_size,
        gap_size,
        initial_commit,
        exn_guaranteed: pick(config.stack_exn_guaranteed, 32 * KIB),
        cache_count: match config.stack_cache_count {
            n if n < 0 => 0,
            0 => 4,
            n => n as usize,
        },
        grow_fast: config.stack_grow_fast,
        reset_decommits: config.stack_reset_decommits,
        gpool_size: align_up(pick(config.gpool_max_size, 256 * GIB), page_size),
        use_gpools: !overcommit,
    }
}

/// Install the configuration for this process. Returns `true` when this
/// call performed the installation; later calls (and any configuration
/// already installed implicitly by an allocation) win and make this a
/// no-op returning `false`.
pub fn init(config: &Config) -> bool {
    let mut used = false;
    RUNTIME.get_or_init(|| {
        used = true;
        resolve(config)
    });
    PROCESS_INIT.call_once(fault::process_init);
    used
}

/// The resolved settings without lazy installation; for contexts (the
/// fault handler) that can only run once configuration exists anyway.
pub(crate) fn installed_runtime() -> &'static Runtime {
    RUNTIME.get().expect("stack allocator used before configuration")
}

/// The resolved settings, installing defaults on first use.
pub(crate) fn runtime() -> &'static Runtime {
    if let Some(rt) = RUNTIME.get() {
        PROCESS_INIT.call_once(fault::process_init);
        return rt;
    }
    init(&Config::default());
    RUNTIME.get().unwrap()
}
