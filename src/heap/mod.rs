/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * Public allocation surface and the process-wide heaps.
 *
 * Lock rank (a holder of a lower rank may take any higher rank,
 * never the reverse):
 *   1. DR-areas lock (external, via hooks)
 *   2. global-allocation lock (recursive)
 *   3. per-VM-region lock
 *   4. unit-management lock (recursive, process-wide)
 *   5. per-special-heap lock
 *
 * The cyclic demand between heap growth and DR-area tracking is
 * resolved by a small state machine here at the entry points: an
 * inner path that would need the outer lock returns
 * RetryWithOuterLock instead of blocking, and the entry acquires the
 * outer lock and re-enters.  The sentinel never escapes this module.
 */

pub mod units;

use core::mem;
use crate::base::cell::GlobalCell;
use crate::config::{self, options, HeapOptions};
use crate::debug::*;
use crate::defines::*;
use crate::dprintf;
use crate::errors::{ErrNO, OomPhase};
use crate::hooks::{self, hooks, HeapHooks};
use crate::locking::RecursiveLock;
use crate::os;
use crate::types::{vaddr_t, which_vmm_t};
use crate::vmm;
use crate::{IS_ALIGNED, PAGE_ALIGN, RT_ASSERT};

use units::{common_heap_alloc, common_heap_free, commit_with_recovery,
            os_reserve_with_recovery, threadunits_exit, threadunits_init,
            ThreadUnits};

struct HeapMgt {
    initialized: bool,
    global_units: ThreadUnits,
    global_nonpersistent_units: ThreadUnits,
    global_reachable_units: ThreadUnits,
}

/* Rank 2.  Guards HEAPMGT and the three shared heaps. */
static GLOBAL_ALLOC_LOCK: RecursiveLock = RecursiveLock::new();

static HEAPMGT: GlobalCell<HeapMgt> = GlobalCell::new(HeapMgt {
    initialized: false,
    global_units: ThreadUnits::empty(),
    global_nonpersistent_units: ThreadUnits::empty(),
    global_reachable_units: ThreadUnits::empty(),
});

/*
 * The retry state machine.  |f| may fail with RetryWithOuterLock
 * exactly when the DR-areas lock is not yet held; every other failure
 * is terminal inside the inner layers, so nothing else can surface.
 */
fn with_retry<T>(mut f: impl FnMut() -> Result<T, ErrNO>) -> T {
    match f() {
        Ok(v) => v,
        Err(ErrNO::RetryWithOuterLock) => {
            hooks().dr_areas_lock();
            let r = f();
            hooks().dr_areas_unlock();
            match r {
                Ok(v) => v,
                Err(e) => panic!("allocation failed after retry: {:?}", e),
            }
        }
        Err(e) => panic!("allocation failed: {:?}", e),
    }
}

/* ---- init / exit ----------------------------------------------------- */

pub fn heap_init(opts: &HeapOptions, callbacks: Option<&'static dyn HeapHooks>)
    -> Result<(), ErrNO>
{
    /* Compile-time-ish layout sanity. */
    RT_ASSERT!(IS_ALIGNED!(HEADER_SIZE, HEAP_ALIGNMENT));
    let mut prev = 0;
    for &sz in BLOCK_SIZES.iter() {
        RT_ASSERT!(sz > prev && IS_ALIGNED!(sz, HEAP_ALIGNMENT));
        prev = sz;
    }
    RT_ASSERT!(BLOCK_SIZES[0] >= mem::size_of::<vaddr_t>());
    RT_ASSERT!(opts.heap_commit_increment.is_power_of_two());

    config::set_options(opts);
    if let Some(h) = callbacks {
        hooks::set_hooks(h);
    }
    crate::reachability::reachability_init(opts.heap_in_lower_4gb);

    if opts.vm_reserve {
        vmm::vmm_init()?;
    }

    /* Hold the outer lock across the whole sequence so no inner path
     * needs the retry sentinel during bootstrap. */
    hooks().dr_areas_lock();
    let result = GLOBAL_ALLOC_LOCK.with(|| unsafe {
        let mgt = HEAPMGT.get();
        RT_ASSERT!(!(*mgt).initialized);
        threadunits_init(&mut (*mgt).global_units,
                         options().initial_global_heap_unit_size,
                         VMM_HEAP, 0)?;
        threadunits_init(&mut (*mgt).global_nonpersistent_units,
                         options().initial_heap_nonpers_size,
                         VMM_HEAP, 0)?;
        threadunits_init(&mut (*mgt).global_reachable_units,
                         options().initial_heap_unit_size,
                         VMM_HEAP | VMM_REACHABLE, 0)?;
        (*mgt).initialized = true;
        Ok(())
    });
    hooks().dr_areas_unlock();
    dprintf!(INFO, "heap_init done\n");
    result
}

pub fn heap_exit() {
    hooks().dr_areas_lock();
    let result: Result<(), ErrNO> = GLOBAL_ALLOC_LOCK.with(|| unsafe {
        let mgt = HEAPMGT.get();
        if !(*mgt).initialized {
            return Ok(());
        }
        threadunits_exit(&mut (*mgt).global_reachable_units)?;
        threadunits_exit(&mut (*mgt).global_nonpersistent_units)?;
        threadunits_exit(&mut (*mgt).global_units)?;
        (*mgt).initialized = false;
        Ok(())
    });
    hooks().dr_areas_unlock();
    RT_ASSERT!(result.is_ok());
    units::heap_release_dead_units();
    vmm::vmm_exit();
    dprintf!(INFO, "heap_exit done\n");
}

/* ---- thread heaps ---------------------------------------------------- */

/* Carve the per-thread heap state out of the global heap and give it
 * its first unit.  The returned handle is owned by the calling
 * thread; only the teardown path may touch it from elsewhere, and
 * only with every other thread suspended. */
pub fn heap_thread_init() -> *mut ThreadUnits {
    let raw = global_heap_alloc(mem::size_of::<ThreadUnits>(), VMM_HEAP);
    let tu = raw as *mut ThreadUnits;
    unsafe {
        tu.write(ThreadUnits::empty());
        with_retry(|| {
            threadunits_init(&mut *tu, options().initial_heap_unit_size,
                             VMM_HEAP | VMM_PER_THREAD,
                             os::os_current_thread_id())
        });
    }
    tu
}

/// # Safety
/// |tu| must come from heap_thread_init and not be used afterward.
pub unsafe fn heap_thread_exit(tu: *mut ThreadUnits) {
    with_retry(|| threadunits_exit(&mut *tu));
    global_heap_free(tu as *mut u8, mem::size_of::<ThreadUnits>(), VMM_HEAP);
}

/// Allocate from a thread-private heap.  No lock is taken: the heap
/// is owned by the calling thread.
///
/// # Safety
/// |tu| must be the calling thread's live handle.
pub unsafe fn heap_alloc(tu: *mut ThreadUnits, size: usize,
                         which: which_vmm_t) -> *mut u8 {
    let _ = which;
    with_retry(|| common_heap_alloc(&mut *tu, size)) as *mut u8
}

/// # Safety
/// |tu| must be the calling thread's live handle; |size| must equal
/// the size passed to the matching alloc.
pub unsafe fn heap_free(tu: *mut ThreadUnits, p: *mut u8, size: usize,
                        which: which_vmm_t) {
    let _ = which;
    with_retry(|| common_heap_free(&mut *tu, p as vaddr_t, size));
}

/* ---- shared heaps ---------------------------------------------------- */

enum SharedHeap {
    Global,
    Nonpersistent,
    Reachable,
}

fn shared_units(mgt: *mut HeapMgt, kind: &SharedHeap) -> *mut ThreadUnits {
    unsafe {
        match kind {
            SharedHeap::Global => &mut (*mgt).global_units,
            SharedHeap::Nonpersistent => &mut (*mgt).global_nonpersistent_units,
            SharedHeap::Reachable => &mut (*mgt).global_reachable_units,
        }
    }
}

fn shared_heap_alloc(kind: SharedHeap, size: usize) -> *mut u8 {
    with_retry(|| {
        GLOBAL_ALLOC_LOCK.with(|| unsafe {
            let tu = shared_units(HEAPMGT.get(), &kind);
            RT_ASSERT!((*HEAPMGT.get()).initialized);
            common_heap_alloc(&mut *tu, size)
        })
    }) as *mut u8
}

fn shared_heap_free(kind: SharedHeap, p: *mut u8, size: usize) {
    with_retry(|| {
        GLOBAL_ALLOC_LOCK.with(|| unsafe {
            let tu = shared_units(HEAPMGT.get(), &kind);
            common_heap_free(&mut *tu, p as vaddr_t, size)
        })
    });
}

pub fn global_heap_alloc(size: usize, which: which_vmm_t) -> *mut u8 {
    let _ = which;
    shared_heap_alloc(SharedHeap::Global, size)
}

pub fn global_heap_free(p: *mut u8, size: usize, which: which_vmm_t) {
    let _ = which;
    shared_heap_free(SharedHeap::Global, p, size)
}

pub fn nonpersistent_heap_alloc(size: usize, which: which_vmm_t) -> *mut u8 {
    let _ = which;
    shared_heap_alloc(SharedHeap::Nonpersistent, size)
}

pub fn nonpersistent_heap_free(p: *mut u8, size: usize, which: which_vmm_t) {
    let _ = which;
    shared_heap_free(SharedHeap::Nonpersistent, p, size)
}

/* Placement-enforcing variant: everything it returns stays within
 * rel32 of the code region. */
pub fn heap_reachable_alloc(size: usize, which: which_vmm_t) -> *mut u8 {
    let _ = which;
    shared_heap_alloc(SharedHeap::Reachable, size)
}

pub fn heap_reachable_free(p: *mut u8, size: usize, which: which_vmm_t) {
    let _ = which;
    shared_heap_free(SharedHeap::Reachable, p, size)
}

pub fn global_heap_realloc(p: *mut u8, old_num: usize, new_num: usize,
                           elem_size: usize, which: which_vmm_t) -> *mut u8 {
    let fresh = global_heap_alloc(new_num * elem_size, which);
    if !p.is_null() {
        os::os_copy(fresh as vaddr_t, p as vaddr_t,
                    old_num.min(new_num) * elem_size);
        global_heap_free(p, old_num * elem_size, which);
    }
    fresh
}

/* ---- stand-alone mappings (code cache et al.) ------------------------ */

/*
 * Reserve |reserve_size| and commit the first |commit_size| with
 * |prot|.  Drawn from the matching VM region when possible, straight
 * from the OS once the region is exhausted.  For code categories the
 * returned address is the executable view.
 */
pub fn heap_mmap(reserve_size: usize, commit_size: usize, prot: u32,
                 which: which_vmm_t) -> *mut u8 {
    RT_ASSERT!(commit_size > 0 && commit_size <= reserve_size);
    let reserve_size = PAGE_ALIGN!(reserve_size);
    let commit_size = PAGE_ALIGN!(commit_size);
    let (p, vmm_managed) = match vmm::vmm_reserve(reserve_size, None, which) {
        Ok(p) => (p, true),
        Err(_) => {
            let p = match os_reserve_with_recovery(reserve_size, which) {
                Ok(p) => p,
                Err(_) => unreachable!(),
            };
            (p, false)
        }
    };
    match commit_with_recovery(p, commit_size, prot, which, vmm_managed,
                               OomPhase::Commit) {
        Ok(()) => {}
        Err(_) => unreachable!(),
    }
    hooks().add_dr_area(p, p + commit_size, prot, false);
    hooks().update_memory_areas(p, p + commit_size, prot, which);
    dprintf!(SPEW, "heap_mmap: [{:#x},{:#x}) committed {:#x} which=0x{:x}\n",
             p, p + reserve_size, commit_size, which);
    p as *mut u8
}

pub fn heap_munmap(p: *mut u8, size: usize, which: which_vmm_t) {
    let addr = p as vaddr_t;
    let size = PAGE_ALIGN!(size);
    hooks().remove_dr_area(addr, addr + size);
    if vmm::vmm_is_reserved_address(addr, size) {
        let _ = vmm::vmm_decommit(addr, size, which);
        vmm::vmm_free(addr, size, which);
    } else {
        let _ = os::os_release(addr, size);
    }
}

/* Grow the committed prefix of a heap_mmap mapping; |p| is the current
 * commitment end. */
pub fn heap_mmap_extend_commitment(p: *mut u8, size: usize, prot: u32,
                                   which: which_vmm_t) {
    let addr = p as vaddr_t;
    let size = PAGE_ALIGN!(size);
    let vmm_managed = vmm::vmm_is_reserved_address(addr, size);
    match commit_with_recovery(addr, size, prot, which, vmm_managed,
                               OomPhase::Extend) {
        Ok(()) => {}
        Err(_) => unreachable!(),
    }
    hooks().update_memory_areas(addr, addr + size, prot, which);
}

pub fn heap_mmap_retract_commitment(p: *mut u8, size: usize,
                                    which: which_vmm_t) {
    let addr = p as vaddr_t;
    let size = PAGE_ALIGN!(size);
    if vmm::vmm_is_reserved_address(addr, size) {
        let _ = vmm::vmm_decommit(addr, size, which);
    } else {
        let _ = os::os_decommit(addr, size);
    }
    hooks().update_memory_areas(addr, addr + size, MEMPROT_NONE, which);
}

/*
 * Reserve without committing, for a mapping the caller will populate
 * through other means.  Unreserving restores the region bitmap to its
 * prior state bit for bit.
 */
pub fn heap_reserve_for_external_mapping(preferred: *mut u8, size: usize,
                                         which: which_vmm_t) -> *mut u8 {
    let size = PAGE_ALIGN!(size);
    let preferred = if preferred.is_null() {
        None
    } else {
        Some(preferred as vaddr_t)
    };
    match vmm::vmm_reserve(size, preferred, which) {
        Ok(p) => p as *mut u8,
        Err(_) => {
            match os_reserve_with_recovery(size, which) {
                Ok(p) => p as *mut u8,
                Err(_) => unreachable!(),
            }
        }
    }
}

pub fn heap_unreserve_for_external_mapping(p: *mut u8, size: usize,
                                           which: which_vmm_t) {
    let addr = p as vaddr_t;
    let size = PAGE_ALIGN!(size);
    if vmm::vmm_is_reserved_address(addr, size) {
        vmm::vmm_free(addr, size, which);
    } else {
        let _ = os::os_release(addr, size);
    }
}

/* ---- stacks ---------------------------------------------------------- */

fn stack_guard_size() -> usize {
    if options().stack_guard_pages {
        PAGE_SIZE
    } else {
        0
    }
}

/*
 * Returns the top of the new stack.  A guard page sits below the
 * usable range when stack_guard_pages is on: reserved, never
 * committed, so any overflow faults.
 */
pub fn stack_alloc(size: usize, min_addr: Option<*mut u8>) -> *mut u8 {
    let size = PAGE_ALIGN!(size);
    let guard = stack_guard_size();
    let reserve_size = size + guard;
    let which = VMM_STACK | VMM_PER_THREAD;

    let mut base = match vmm::vmm_reserve(reserve_size, None, which) {
        Ok(p) => Some((p, true)),
        Err(_) => None,
    };
    if let Some(min) = min_addr {
        if let Some((p, _)) = base {
            if p < min as vaddr_t {
                vmm::vmm_free(p, reserve_size, which);
                base = None;
            }
        }
    }
    let (base, vmm_managed) = match base {
        Some(pair) => pair,
        None => {
            let hint = min_addr.map(|p| p as vaddr_t).unwrap_or(0);
            let p = match os::os_reserve(hint, reserve_size) {
                Ok(p) => {
                    if min_addr.map_or(true, |m| p >= m as vaddr_t) {
                        p
                    } else {
                        let _ = os::os_release(p, reserve_size);
                        match os_reserve_with_recovery(reserve_size, which) {
                            Ok(p) => p,
                            Err(_) => unreachable!(),
                        }
                    }
                }
                Err(_) => match os_reserve_with_recovery(reserve_size, which) {
                    Ok(p) => p,
                    Err(_) => unreachable!(),
                },
            };
            (p, false)
        }
    };

    match commit_with_recovery(base + guard, size,
                               MEMPROT_READ | MEMPROT_WRITE, which,
                               vmm_managed, OomPhase::Commit) {
        Ok(()) => {}
        Err(_) => unreachable!(),
    }
    hooks().add_dr_area(base + guard, base + guard + size,
                        MEMPROT_READ | MEMPROT_WRITE, false);
    (base + guard + size) as *mut u8
}

pub fn stack_free(top: *mut u8, size: usize) {
    let size = PAGE_ALIGN!(size);
    let guard = stack_guard_size();
    let base = top as vaddr_t - size - guard;
    let which = VMM_STACK | VMM_PER_THREAD;
    hooks().remove_dr_area(base + guard, top as vaddr_t);
    if vmm::vmm_is_reserved_address(base, size + guard) {
        let _ = vmm::vmm_decommit(base + guard, size, which);
        vmm::vmm_free(base, size + guard, which);
    } else {
        let _ = os::os_release(base, size + guard);
    }
}

/* ---- fork (W^X) ------------------------------------------------------ */

pub fn heap_prefork() -> Result<(), ErrNO> {
    vmm::vmm_prefork()
}

pub fn heap_postfork_parent() {
    vmm::vmm_postfork_parent();
}

pub fn heap_postfork_child() -> Result<(), ErrNO> {
    let r = vmm::vmm_postfork_child();
    /* The child's mappings were rebuilt; the runtime's view of them
     * is no longer trustworthy. */
    hooks().mark_dr_areas_stale();
    r
}

/* ---- introspection --------------------------------------------------- */

pub fn heap_dump_stats() {
    GLOBAL_ALLOC_LOCK.with(|| unsafe {
        let mgt = HEAPMGT.get();
        if !(*mgt).initialized {
            return;
        }
        dprintf!(ALWAYS, "global heap per-class stats:\n");
        for (k, s) in (*mgt).global_units.stats().iter().enumerate() {
            if s.max == 0 {
                continue;
            }
            if k == VARIABLE_CLASS {
                dprintf!(ALWAYS,
                         "  class  var: cur {} peak {} wasted {} peak-wasted {}\n",
                         s.cur, s.max, s.wasted, s.max_wasted);
            } else {
                dprintf!(ALWAYS,
                         "  class {:>4}: cur {} peak {} wasted {} peak-wasted {}\n",
                         BLOCK_SIZES[k], s.cur, s.max, s.wasted, s.max_wasted);
            }
        }
    });
    vmm::vmm_dump();
}

/* Debug sweep of the shared heaps' structural invariants. */
pub fn heap_consistency_check() {
    GLOBAL_ALLOC_LOCK.with(|| unsafe {
        let mgt = HEAPMGT.get();
        if !(*mgt).initialized {
            return;
        }
        units::heap_check(&(*mgt).global_units);
        units::heap_check(&(*mgt).global_nonpersistent_units);
        units::heap_check(&(*mgt).global_reachable_units);
    });
}
