/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * Special-purpose single-size heap: a simpler allocator for
 * homogeneous blocks, optionally lockless when the owner promises
 * single-threaded use.
 *
 * Two free structures: a singly-linked list of single blocks, and a
 * separate "cfree" list of contiguous runs (each node stores next and
 * a block count in its first two words).  Runs are never coalesced.
 *
 * For an executable special heap the canonical block address is the
 * executable view; all bookkeeping words are written through the
 * writable view, so the code works unchanged with W^X on or off.
 */

use core::mem;
use crate::config::options;
use crate::debug::*;
use crate::defines::*;
use crate::dprintf;
use crate::errors::OomPhase;
use crate::heap::units::{commit_with_recovery, os_reserve_with_recovery};
use crate::heap::{global_heap_alloc, global_heap_free, nonpersistent_heap_alloc,
                  nonpersistent_heap_free};
use crate::locking::RecursiveLock;
use crate::os;
use crate::types::{vaddr_t, which_vmm_t};
use crate::vmm;
use crate::{ALIGN, PAGE_ALIGN, ROUNDUP, RT_ASSERT, RT_DEBUG_ASSERT};

/* Caller-supplied table tracking each unit's extent for later point
 * lookup. */
pub trait IntervalTable: Sync {
    fn add_range(&self, start: vaddr_t, end: vaddr_t);
    fn remove_range(&self, start: vaddr_t, end: vaddr_t);
}

#[repr(C)]
struct SpecialUnit {
    next: *mut SpecialUnit, /* writable-view header of the next unit */

    /* All pc fields hold canonical (executable-view) addresses. */
    alloc_pc: vaddr_t, /* raw unit base */
    start_pc: vaddr_t, /* aligned first block */
    cur_pc: vaddr_t,
    end_pc: vaddr_t, /* commit boundary */
    reserved_end_pc: vaddr_t,

    alloc_base: vaddr_t, /* raw reservation, 0 for preallocated */
    alloc_size: usize,
    vmm_managed: bool,
    prealloc: bool,
}

pub fn get_special_heap_header_size() -> usize {
    ROUNDUP!(mem::size_of::<SpecialUnit>(), HEAP_ALIGNMENT)
}

pub struct SpecialUnits {
    block_size: usize,
    alignment: usize,
    use_lock: bool,
    lock: RecursiveLock,
    executable: bool,
    persistent: bool,
    which: which_vmm_t,

    top_unit: *mut SpecialUnit,
    cur_unit: *mut SpecialUnit,

    free_list: vaddr_t,  /* single blocks */
    cfree_list: vaddr_t, /* runs: word0 = next, word1 = count */

    table: Option<&'static dyn IntervalTable>,
}

fn sh_lock(sh: *mut SpecialUnits) {
    unsafe {
        if (*sh).use_lock {
            (*sh).lock.lock();
        }
    }
}

fn sh_unlock(sh: *mut SpecialUnits) {
    unsafe {
        if (*sh).use_lock {
            (*sh).lock.unlock();
        }
    }
}

/* Bookkeeping words are always written through the writable view. */
unsafe fn write_slot(p_exec: vaddr_t, offset: usize, v: vaddr_t) {
    let w = vmm::vmm_writable_addr(p_exec) + offset;
    (w as *mut vaddr_t).write(v);
}

unsafe fn read_slot(p_exec: vaddr_t, offset: usize) -> vaddr_t {
    let w = vmm::vmm_writable_addr(p_exec) + offset;
    (w as *const vaddr_t).read()
}

fn metadata_alloc(sh_persistent: bool, size: usize) -> *mut u8 {
    if sh_persistent {
        global_heap_alloc(size, VMM_SPECIAL_HEAP)
    } else {
        nonpersistent_heap_alloc(size, VMM_SPECIAL_HEAP)
    }
}

fn metadata_free(sh_persistent: bool, p: *mut u8, size: usize) {
    if sh_persistent {
        global_heap_free(p, size, VMM_SPECIAL_HEAP)
    } else {
        nonpersistent_heap_free(p, size, VMM_SPECIAL_HEAP)
    }
}

/*
 * Create a special heap.  |prealloc| hands the heap an existing
 * committed range to carve instead of reserving its own first unit;
 * its header then lives out of line in the normal heap.
 */
pub fn special_heap_init(block_size: usize, alignment: usize, use_lock: bool,
                         executable: bool, persistent: bool,
                         table: Option<&'static dyn IntervalTable>,
                         prealloc: Option<(vaddr_t, usize)>)
    -> *mut SpecialUnits
{
    RT_ASSERT!(block_size >= 2 * mem::size_of::<vaddr_t>());
    RT_ASSERT!(alignment == 0 || alignment.is_power_of_two());
    let sh = metadata_alloc(persistent, mem::size_of::<SpecialUnits>())
        as *mut SpecialUnits;
    unsafe {
        sh.write(SpecialUnits {
            block_size: ROUNDUP!(block_size, HEAP_ALIGNMENT),
            alignment: alignment.max(HEAP_ALIGNMENT),
            use_lock,
            lock: RecursiveLock::new(),
            executable,
            persistent,
            which: VMM_SPECIAL_HEAP |
                if executable { VMM_CACHE } else { 0 },
            top_unit: core::ptr::null_mut(),
            cur_unit: core::ptr::null_mut(),
            free_list: 0,
            cfree_list: 0,
            table,
        });
        match prealloc {
            Some((base, size)) => special_wrap_prealloc(sh, base, size),
            None => special_create_unit(sh, 1),
        }
    }
    sh
}

unsafe fn register_unit(sh: *mut SpecialUnits, u: *mut SpecialUnit) {
    (*u).next = (*sh).top_unit;
    (*sh).top_unit = u;
    (*sh).cur_unit = u;
    if let Some(table) = (*sh).table {
        table.add_range((*u).alloc_pc, (*u).reserved_end_pc);
    }
}

unsafe fn special_wrap_prealloc(sh: *mut SpecialUnits, base: vaddr_t,
                                size: usize) {
    let u = metadata_alloc((*sh).persistent, mem::size_of::<SpecialUnit>())
        as *mut SpecialUnit;
    u.write(SpecialUnit {
        next: core::ptr::null_mut(),
        alloc_pc: base,
        start_pc: ALIGN!(base, (*sh).alignment),
        cur_pc: ALIGN!(base, (*sh).alignment),
        end_pc: base + size,
        reserved_end_pc: base + size,
        alloc_base: 0,
        alloc_size: 0,
        vmm_managed: false,
        prealloc: true,
    });
    register_unit(sh, u);
}

/* Reserve and partially commit a unit able to hold |min_blocks|; the
 * inline header is written through the writable view. */
unsafe fn special_create_unit(sh: *mut SpecialUnits, min_blocks: usize) {
    let header = get_special_heap_header_size();
    let prev_size = if (*sh).cur_unit.is_null() {
        0
    } else {
        (*(*sh).cur_unit).reserved_end_pc - (*(*sh).cur_unit).alloc_pc
    };
    let need = header + (*sh).alignment + min_blocks * (*sh).block_size;
    let size = PAGE_ALIGN!((prev_size * 2)
        .max(need)
        .max(16 * (*sh).block_size + header)
        .min(options().max_heap_unit_size.max(need)));

    let (base, vmm_managed) = match vmm::vmm_reserve(size, None, (*sh).which) {
        Ok(p) => (p, true),
        Err(_) => {
            match os_reserve_with_recovery(size, (*sh).which) {
                Ok(p) => (p, false),
                Err(_) => unreachable!(),
            }
        }
    };
    let prot = if (*sh).executable {
        MEMPROT_READ | MEMPROT_WRITE | MEMPROT_EXEC
    } else {
        MEMPROT_READ | MEMPROT_WRITE
    };
    let increment = PAGE_ALIGN!(options().heap_commit_increment.max(PAGE_SIZE));
    let commit = PAGE_ALIGN!(header + (*sh).alignment).max(increment).min(size);
    match commit_with_recovery(base, commit, prot, (*sh).which, vmm_managed,
                               OomPhase::Commit) {
        Ok(()) => {}
        Err(_) => unreachable!(),
    }

    let u = vmm::vmm_writable_addr(base) as *mut SpecialUnit;
    u.write(SpecialUnit {
        next: core::ptr::null_mut(),
        alloc_pc: base,
        start_pc: ALIGN!(base + header, (*sh).alignment),
        cur_pc: ALIGN!(base + header, (*sh).alignment),
        end_pc: base + commit,
        reserved_end_pc: base + size,
        alloc_base: base,
        alloc_size: size,
        vmm_managed,
        prealloc: false,
    });
    register_unit(sh, u);
    dprintf!(SPEW, "special unit {:#x} size {:#x} block {:#x}\n",
             base, size, (*sh).block_size);
}

/* Bump |blocks| contiguous slots from the current unit, growing
 * commitment; 0 when the unit is out of reserved room. */
unsafe fn special_bump(sh: *mut SpecialUnits, blocks: usize) -> vaddr_t {
    let u = (*sh).cur_unit;
    let carve = blocks * (*sh).block_size;
    if (*u).cur_pc + carve > (*u).end_pc {
        let needed = (*u).cur_pc + carve;
        if needed > (*u).reserved_end_pc {
            return 0;
        }
        let increment = options().heap_commit_increment.max(PAGE_SIZE);
        let new_end = (ROUNDUP!(needed - (*u).alloc_pc, increment))
            .min((*u).reserved_end_pc - (*u).alloc_pc) + (*u).alloc_pc;
        let prot = if (*sh).executable {
            MEMPROT_READ | MEMPROT_WRITE | MEMPROT_EXEC
        } else {
            MEMPROT_READ | MEMPROT_WRITE
        };
        let grow = new_end - (*u).end_pc;
        let ok = if (*u).vmm_managed {
            vmm::vmm_commit((*u).end_pc, grow, prot, (*sh).which).is_ok()
        } else {
            os::os_commit((*u).end_pc, grow, prot).is_ok()
        };
        if !ok {
            return 0;
        }
        (*u).end_pc = new_end;
    }
    let p = (*u).cur_pc;
    (*u).cur_pc += carve;
    p
}

unsafe fn special_alloc_blocks(sh: *mut SpecialUnits, blocks: usize)
    -> vaddr_t
{
    let mut p = special_bump(sh, blocks);
    if p == 0 {
        special_create_unit(sh, blocks);
        p = special_bump(sh, blocks);
        RT_ASSERT!(p != 0);
    }
    p
}

pub fn special_heap_alloc(sh: *mut SpecialUnits) -> *mut u8 {
    sh_lock(sh);
    let p = unsafe {
        if (*sh).free_list != 0 {
            let p = (*sh).free_list;
            (*sh).free_list = read_slot(p, 0);
            p
        } else {
            special_alloc_blocks(sh, 1)
        }
    };
    sh_unlock(sh);
    p as *mut u8
}

/*
 * Allocate |n| contiguous blocks.  The cfree list is preferred: an
 * exact run is removed whole; an n+1 run gives up one block to the
 * single-free list; a longer run is trimmed from its tail.
 */
pub fn special_heap_calloc(sh: *mut SpecialUnits, n: usize) -> *mut u8 {
    RT_ASSERT!(n > 0);
    sh_lock(sh);
    let p = unsafe { special_calloc_locked(sh, n) };
    sh_unlock(sh);
    p as *mut u8
}

unsafe fn special_calloc_locked(sh: *mut SpecialUnits, n: usize) -> vaddr_t {
    let bsz = (*sh).block_size;
    let mut prev: vaddr_t = 0;
    let mut run = (*sh).cfree_list;
    while run != 0 {
        let count = read_slot(run, mem::size_of::<vaddr_t>());
        if count >= n {
            if count == n || count == n + 1 {
                /* Unlink the whole run. */
                let next = read_slot(run, 0);
                if prev == 0 {
                    (*sh).cfree_list = next;
                } else {
                    write_slot(prev, 0, next);
                }
                if count == n + 1 {
                    let spare = run + n * bsz;
                    write_slot(spare, 0, (*sh).free_list);
                    (*sh).free_list = spare;
                }
                return run;
            }
            /* Trim n blocks from the tail. */
            write_slot(run, mem::size_of::<vaddr_t>(), count - n);
            return run + (count - n) * bsz;
        }
        prev = run;
        run = read_slot(run, 0);
    }
    special_alloc_blocks(sh, n)
}

/* Whether calloc(n) would succeed without reserving a new unit. */
pub fn special_heap_can_calloc(sh: *mut SpecialUnits, n: usize) -> bool {
    sh_lock(sh);
    let ok = unsafe {
        let mut found = false;
        let mut run = (*sh).cfree_list;
        while run != 0 && !found {
            found = read_slot(run, mem::size_of::<vaddr_t>()) >= n;
            run = read_slot(run, 0);
        }
        if !found {
            let u = (*sh).cur_unit;
            found = (*u).cur_pc + n * (*sh).block_size <= (*u).reserved_end_pc;
        }
        found
    };
    sh_unlock(sh);
    ok
}

/* Accepts either W^X view. */
pub fn special_heap_free(sh: *mut SpecialUnits, p: *mut u8) {
    let p = vmm::vmm_executable_addr(p as vaddr_t);
    sh_lock(sh);
    unsafe {
        RT_DEBUG_ASSERT!(special_heap_owns(sh, p));
        write_slot(p, 0, (*sh).free_list);
        (*sh).free_list = p;
    }
    sh_unlock(sh);
}

/* Return a run of |n| blocks.  No coalescing is attempted. */
pub fn special_heap_cfree(sh: *mut SpecialUnits, p: *mut u8, n: usize) {
    RT_ASSERT!(n > 0);
    let p = vmm::vmm_executable_addr(p as vaddr_t);
    sh_lock(sh);
    unsafe {
        RT_DEBUG_ASSERT!(special_heap_owns(sh, p));
        write_slot(p, 0, (*sh).cfree_list);
        write_slot(p, mem::size_of::<vaddr_t>(), n);
        (*sh).cfree_list = p;
    }
    sh_unlock(sh);
}

unsafe fn special_heap_owns(sh: *mut SpecialUnits, p: vaddr_t) -> bool {
    let mut u = (*sh).top_unit;
    while !u.is_null() {
        if p >= (*u).start_pc && p < (*u).cur_pc {
            return true;
        }
        u = (*u).next;
    }
    false
}

/* Trim the current unit so bump allocation stops at |pc|; used when a
 * caller hands only part of a preallocated range to the heap. */
pub fn special_heap_set_unit_end(sh: *mut SpecialUnits, pc: vaddr_t) {
    sh_lock(sh);
    unsafe {
        let u = (*sh).cur_unit;
        RT_ASSERT!(pc >= (*u).cur_pc && pc <= (*u).reserved_end_pc);
        (*u).reserved_end_pc = pc;
        if (*u).end_pc > pc {
            (*u).end_pc = pc;
        }
    }
    sh_unlock(sh);
}

/*
 * Unit iteration.  The iterator holds the heap lock from start to
 * stop; freeing individual blocks inside the iteration is allowed
 * because the lock is recursive and the free path checks ownership.
 */
pub struct SpecialHeapIter {
    sh: *mut SpecialUnits,
    cur: *mut SpecialUnit,
}

pub fn special_heap_iterator_start(sh: *mut SpecialUnits) -> SpecialHeapIter {
    sh_lock(sh);
    SpecialHeapIter { sh, cur: unsafe { (*sh).top_unit } }
}

pub fn special_heap_iterator_hasnext(shi: &SpecialHeapIter) -> bool {
    !shi.cur.is_null()
}

/* Yields the unit's usable committed extent. */
pub fn special_heap_iterator_next(shi: &mut SpecialHeapIter)
    -> (vaddr_t, vaddr_t)
{
    RT_ASSERT!(!shi.cur.is_null());
    unsafe {
        let range = ((*shi.cur).start_pc, (*shi.cur).end_pc);
        shi.cur = (*shi.cur).next;
        range
    }
}

pub fn special_heap_iterator_stop(shi: SpecialHeapIter) {
    sh_unlock(shi.sh);
}

pub fn special_heap_exit(sh: *mut SpecialUnits) {
    unsafe {
        let persistent = (*sh).persistent;
        let mut u = (*sh).top_unit;
        while !u.is_null() {
            let next = (*u).next;
            if let Some(table) = (*sh).table {
                table.remove_range((*u).alloc_pc, (*u).reserved_end_pc);
            }
            if (*u).prealloc {
                metadata_free(persistent, u as *mut u8,
                              mem::size_of::<SpecialUnit>());
            } else if (*u).vmm_managed {
                let base = (*u).alloc_base;
                let size = (*u).alloc_size;
                let committed = (*u).end_pc - base;
                let which = (*sh).which;
                let _ = vmm::vmm_decommit(base, committed, which);
                vmm::vmm_free(base, size, which);
            } else {
                let _ = os::os_release((*u).alloc_base, (*u).alloc_size);
            }
            u = next;
        }
        metadata_free(persistent, sh as *mut u8,
                      mem::size_of::<SpecialUnits>());
    }
}
