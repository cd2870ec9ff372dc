//! Low-level OS memory primitives for stack reservations.
//!
//! Every gstack is a fixed-size virtual reservation; physical pages are
//! committed on demand, either by the kernel (overcommit path) or by the
//! page-fault handler in [`crate::fault`] (gpool path). Keeping the
//! reservation size constant is what makes the per-thread cache and the
//! gpool block arithmetic cheap.

use rustix::mm::{self, Advice, MapFlags, MprotectFlags, ProtFlags};

pub(crate) fn page_size() -> usize {
    rustix::param::page_size()
}

/// Reserve a range of virtual address space with no access and no commit
/// charge. Returns `None` when the OS refuses.
pub(crate) fn reserve(size: usize) -> Option<*mut u8> {
    let res = unsafe {
        mm::mmap_anonymous(
            core::ptr::null_mut(),
            size,
            ProtFlags::empty(),
            MapFlags::PRIVATE | MapFlags::NORESERVE,
        )
    };
    match res {
        Ok(p) => Some(p.cast()),
        Err(err) => {
            log::error!("failed to reserve {size} bytes of virtual memory: {err}");
            #[cfg(target_os = "linux")]
            if err == rustix::io::Errno::NOMEM {
                log::error!(
                    "this may be caused by a low memory-map limit; \
                     consider raising vm.max_map_count"
                );
            }
            None
        }
    }
}

/// Release a reservation made with [`reserve`].
pub(crate) fn release(p: *mut u8, size: usize) {
    if p.is_null() {
        return;
    }
    if let Err(err) = unsafe { mm::munmap(p.cast(), size) } {
        log::error!("failed to release memory at {p:p} of size {size}: {err}");
    }
}

/// Commit a page range (make it readable and writable).
pub(crate) fn commit(p: *mut u8, size: usize) -> bool {
    match unsafe { mm::mprotect(p.cast(), size, MprotectFlags::READ | MprotectFlags::WRITE) } {
        Ok(()) => true,
        Err(err) => {
            log::error!("failed to commit memory at {p:p} of size {size}: {err}");
            false
        }
    }
}

/// Return the physical pages of a range to the OS while keeping the
/// reservation. With `decommit` the pages also lose their access rights
/// (a fault is required to use them again); otherwise the cheaper
/// `MADV_FREE`-style reset is used and the pages stay mapped.
pub(crate) fn reset(p: *mut u8, size: usize, decommit: bool) -> bool {
    if decommit {
        // Replace the range with a fresh PROT_NONE mapping to drop the
        // commit charge entirely.
        let res = unsafe {
            mm::mmap_anonymous(
                p.cast(),
                size,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::NORESERVE | MapFlags::FIXED,
            )
        };
        return match res {
            Ok(_) => true,
            Err(err) => {
                log::error!("failed to decommit memory at {p:p} of size {size}: {err}");
                false
            }
        };
    }

    // Prefer the lazy MADV_FREE and fall back for older kernels.
    #[cfg(target_os = "linux")]
    let res = unsafe { mm::madvise(p.cast(), size, Advice::LinuxFree) }
        .or_else(|_| unsafe { mm::madvise(p.cast(), size, Advice::LinuxDontNeed) });
    #[cfg(not(target_os = "linux"))]
    let res = unsafe { mm::madvise(p.cast(), size, Advice::DontNeed) };
    match res {
        Ok(()) => true,
        Err(err) => {
            log::error!("failed to reset memory at {p:p} of size {size}: {err}");
            false
        }
    }
}

/// Whether the kernel hands out committed-on-fault pages for NORESERVE
/// mappings, making a user-level fault handler unnecessary for growth.
pub(crate) fn use_overcommit() -> bool {
    // 0: heuristic overcommit, 1: always, 2: never (NORESERVE is
    // ignored, so on-demand commit needs our own fault handler).
    #[cfg(target_os = "linux")]
    fn probe() -> bool {
        match std::fs::read("/proc/sys/vm/overcommit_memory") {
            Ok(buf) => matches!(buf.first(), Some(b'0') | Some(b'1')),
            Err(_) => false,
        }
    }
    #[cfg(not(target_os = "linux"))]
    fn probe() -> bool {
        false
    }
    probe()
}
