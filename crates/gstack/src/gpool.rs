//! Pooled stack reservations.
//!
//! Where the kernel's overcommit cannot be relied on (or gpools are forced
//! by configuration), stacks are carved out of very large reserved
//! regions. The page-fault handler can then decide with two comparisons
//! and a modulo whether a faulting address belongs to a live stack, and is
//! only ever allowed to commit pages inside a pool.
//!
//! A pool is laid out as equal blocks, each block one stack followed by a
//! no-access gap; the first block holds the pool header itself:
//!
//! ```text
//! | header ........ |gap| stack 1 ....... |gap| ... | stack N ....... |gap|
//! ```
//!
//! The header ends with a free stack of `i16` entries where the entry at
//! index `i` encodes the free block `i + free[i]`. Fresh pool pages are
//! demand-zeroed by the OS, so the untouched encoding marks every block
//! free without any initialization pass. Blocks are handed out top-down,
//! which keeps parent frames at higher addresses for debuggers that walk
//! the stack. Pools are linked in a process-wide list published with a CAS.

use crate::config::runtime;
use crate::sys;
use crate::util::align_up;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

// At most INT16_MAX blocks so the free encoding fits an i16.
const GPOOL_MAX_COUNT: usize = 32_000;

#[repr(C)]
pub(crate) struct Gpool {
    next: *mut Gpool,
    full_size: usize,
    /// `block_count * block_size`; the tail of the reservation past this
    /// point is never used.
    size: usize,
    block_count: usize,
    block_size: usize,
    gap_size: usize,
    lock: AtomicBool,
    // Guarded by `lock`.
    free_sp: usize,
    free: [i16; GPOOL_MAX_COUNT],
}

/// Head of the process-wide pool list.
static GPOOLS: AtomicPtr<Gpool> = AtomicPtr::new(ptr::null_mut());

/// Classification of an address for the page-fault handler.
pub(crate) enum Access {
    /// Not in any pool.
    None,
    /// In the usable range of a stack block; `available` is the distance
    /// to the bottom of the usable range.
    Stack { available: usize, stack_size: usize },
    /// In a pool header (demand-committed on first touch).
    Meta,
    /// In a gap, or at the very bottom of a stack's usable range.
    Overflow,
}

/// Classify `addr`. Async-signal-safe: walks the atomic pool list and does
/// arithmetic only.
pub(crate) fn check_access(addr: *mut u8) -> Access {
    let mut gp = GPOOLS.load(Ordering::Acquire);
    while !gp.is_null() {
        unsafe {
            let ofs = (addr as usize).wrapping_sub(gp as usize);
            if ofs < (*gp).size {
                if ofs <= size_of::<Gpool>() {
                    return Access::Meta;
                }
                let block_size = (*gp).block_size;
                let stack_size = block_size - (*gp).gap_size;
                let block_ofs = ofs % block_size;
                if block_ofs < stack_size {
                    // The stack grows down, so the offset into the block is
                    // exactly what is still available below the fault.
                    return if block_ofs == 0 {
                        Access::Overflow
                    } else {
                        Access::Stack { available: block_ofs, stack_size }
                    };
                }
                return Access::Overflow;
            }
            gp = (*gp).next;
        }
    }
    Access::None
}

unsafe fn lock(gp: *mut Gpool) {
    let lock = unsafe { &(*gp).lock };
    while lock.swap(true, Ordering::Acquire) {
        core::hint::spin_loop();
    }
}

unsafe fn unlock(gp: *mut Gpool) {
    unsafe { &(*gp).lock }.store(false, Ordering::Release);
}

fn alloc_from(gp: *mut Gpool) -> Option<(*mut u8, usize)> {
    unsafe {
        let block_count = (*gp).block_count;
        let free = (&raw mut (*gp).free).cast::<i16>();

        // Touch the free entries we are about to use so that their
        // demand-zero fault cannot happen while the lock is held.
        let sp_now = ptr::read_volatile(&raw const (*gp).free_sp);
        let touch = core::cmp::min(sp_now + 64, GPOOL_MAX_COUNT - 1);
        let _ = ptr::read_volatile(free.add(touch));

        let mut encoded = 0usize;
        lock(gp);
        let sp = (*gp).free_sp;
        if sp < block_count {
            (*gp).free_sp = sp + 1;
            encoded = (*free.add(sp) as isize + sp as isize) as usize;
        }
        unlock(gp);
        if encoded == 0 {
            return None;
        }

        // Hand blocks out from the top of the pool.
        let block_idx = block_count - encoded;
        debug_assert!(block_idx > 0 && block_idx < block_count);
        if block_idx == 0 || block_idx >= block_count {
            return None;
        }
        let stk = (gp as *mut u8).add(block_idx * (*gp).block_size);
        Some((stk, (*gp).block_size - (*gp).gap_size))
    }
}

fn alloc_existing() -> Option<(*mut u8, usize)> {
    let mut gp = GPOOLS.load(Ordering::Acquire);
    while !gp.is_null() {
        if let Some(found) = alloc_from(gp) {
            return Some(found);
        }
        gp = unsafe { (*gp).next };
    }
    None
}

fn create() -> bool {
    let rt = runtime();
    let pool_size = rt.gpool_size;
    let Some(p) = sys::reserve(pool_size) else {
        return false;
    };
    let header = align_up(size_of::<Gpool>(), rt.page_size);
    if !sys::commit(p, header) {
        sys::release(p, pool_size);
        return false;
    }

    let block_size = rt.gstack_size;
    let count = core::cmp::min(pool_size / block_size, GPOOL_MAX_COUNT);
    if count <= 1 {
        log::error!("gpool reservation of {pool_size} bytes holds no stacks");
        sys::release(p, pool_size);
        return false;
    }

    let gp = p.cast::<Gpool>();
    unsafe {
        // The freshly committed header pages are zero-filled; only the
        // nonzero fields need to be written, and the free array encodes
        // "all blocks free" as all-zeroes.
        ptr::write(&raw mut (*gp).full_size, pool_size);
        ptr::write(&raw mut (*gp).size, count * block_size);
        ptr::write(&raw mut (*gp).block_count, count);
        ptr::write(&raw mut (*gp).block_size, block_size);
        ptr::write(&raw mut (*gp).gap_size, rt.gap_size);
        // The first block belongs to the header.
        ptr::write(&raw mut (*gp).free_sp, 1);

        // Publish at the head of the pool list.
        let mut head = GPOOLS.load(Ordering::Relaxed);
        loop {
            ptr::write(&raw mut (*gp).next, head);
            match GPOOLS.compare_exchange_weak(head, gp, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
    }
    true
}

/// Allocate one stack block: `(lowest usable address, usable size)`. The
/// gap above the usable range stays no-access for the lifetime of the
/// pool.
pub(crate) fn alloc() -> Option<(*mut u8, usize)> {
    if let Some(found) = alloc_existing() {
        return Some(found);
    }
    if !create() {
        return None;
    }
    alloc_existing()
}

/// Return a stack block to its pool.
pub(crate) fn free(stk: *mut u8) {
    let mut gp = GPOOLS.load(Ordering::Acquire);
    while !gp.is_null() {
        unsafe {
            let ofs = (stk as usize).wrapping_sub(gp as usize);
            if ofs < (*gp).size {
                debug_assert_eq!(ofs % (*gp).block_size, 0);
                let block_idx = ofs / (*gp).block_size;
                if block_idx == 0 || block_idx >= (*gp).block_count {
                    return;
                }
                let encoded = (*gp).block_count - block_idx;
                lock(gp);
                (*gp).free_sp -= 1;
                let sp = (*gp).free_sp;
                let free = (&raw mut (*gp).free).cast::<i16>();
                *free.add(sp) = (encoded - sp) as i16;
                unlock(gp);
                return;
            }
            gp = (*gp).next;
        }
    }
    log::warn!("freed stack at {stk:p} belongs to no gpool");
}

/// Release every pool reservation; process-exit only.
pub(crate) fn release_all() {
    let mut gp = GPOOLS.swap(ptr::null_mut(), Ordering::AcqRel);
    while !gp.is_null() {
        unsafe {
            let next = (*gp).next;
            sys::release(gp.cast(), (*gp).full_size);
            gp = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The encoding invariant the allocator relies on: with a zeroed free
    // array, popping entry `sp` yields block `count - sp`, and pushing it
    // back stores a delta that reproduces the same block for any later
    // stack position.
    #[test]
    fn free_index_encoding_round_trips() {
        let count = 100usize;
        let mut free = [0i16; 128];
        let mut sp = 1usize;

        // Pop two blocks.
        let a = count - ((free[sp] as isize + sp as isize) as usize);
        sp += 1;
        let b = count - ((free[sp] as isize + sp as isize) as usize);
        sp += 1;
        assert_eq!(a, count - 1);
        assert_eq!(b, count - 2);

        // Push them back in reverse order.
        sp -= 1;
        free[sp] = ((count - b) - sp) as i16;
        sp -= 1;
        free[sp] = ((count - a) - sp) as i16;

        // Popping again yields the same blocks.
        let a2 = count - ((free[sp] as isize + sp as isize) as usize);
        sp += 1;
        let b2 = count - ((free[sp] as isize + sp as isize) as usize);
        assert_eq!(a2, a);
        assert_eq!(b2, b);
    }
}
