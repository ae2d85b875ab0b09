/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * Heap units and the size-class allocator layered on them.
 *
 * A unit is a sub-region drawn from a VM region (or straight from the
 * OS once a region is exhausted): header at the start, then a bump
 * area whose committed end grows lazily toward the reserved end.
 * A ThreadUnits is one logical heap: a local chain of units plus
 * segregated free lists.
 *
 * Free-list next pointers are embedded in the payload and always
 * written raw, never through typed references.
 *
 * Lock discipline: the caller serializes each ThreadUnits (the global
 * allocation lock, or thread ownership); UNIT_LOCK below serializes
 * the process-wide unit chain and dead list and must be acquired with
 * the DR-areas lock already held, hence the RetryWithOuterLock
 * sentinel on every path that can create or retire a unit.
 */

use core::mem;
use crate::base::cell::GlobalCell;
use crate::config::options;
use crate::debug::*;
use crate::defines::*;
use crate::errors::{ErrNO, OomPhase};
use crate::hooks::hooks;
use crate::locking::RecursiveLock;
use crate::os;
use crate::reachability;
use crate::types::{vaddr_t, which_vmm_t};
use crate::vmm;
use crate::{dprintf, IS_ALIGNED, PAGE_ALIGN, ROUNDUP, RT_ASSERT,
            RT_DEBUG_ASSERT};

#[repr(C)]
pub struct HeapUnit {
    start_pc: vaddr_t,
    cur_pc: vaddr_t,
    end_pc: vaddr_t,          /* commit boundary */
    reserved_end_pc: vaddr_t,

    /* Raw reservation, including guard pages. */
    alloc_base: vaddr_t,
    alloc_size: usize,

    which: which_vmm_t,
    vmm_managed: bool,
    oversize: bool,

    next_local: *mut HeapUnit,
    next_global: *mut HeapUnit,
    prev_global: *mut HeapUnit,
}

pub const UNIT_HEADER_SIZE: usize =
    ROUNDUP!(mem::size_of::<HeapUnit>(), HEAP_ALIGNMENT);

/* Largest request served from a normal unit; anything bigger gets an
 * oversize unit of its own. */
pub fn maxroom() -> usize {
    options().max_heap_unit_size - UNIT_HEADER_SIZE
}

fn unit_addr(u: *const HeapUnit) -> vaddr_t {
    u as vaddr_t
}

unsafe fn unit_reserved_size(u: *const HeapUnit) -> usize {
    (*u).reserved_end_pc - unit_addr(u)
}

#[derive(Clone, Copy, Default)]
pub struct ClassStats {
    pub cur: u32,
    pub max: u32,
    pub wasted: u64,
    pub max_wasted: u64,
}

pub struct ThreadUnits {
    top_unit: *mut HeapUnit,
    cur_unit: *mut HeapUnit,
    free_list: [vaddr_t; BLOCK_TYPES],
    owner_thread: usize, /* 0 for the shared heaps */
    which: which_vmm_t,
    /* Protection toggle state for the external data-section
     * protection capability; this crate only records it. */
    writable: bool,
    /* Maintained in debug builds only. */
    stats: [ClassStats; BLOCK_TYPES],
}

unsafe impl Send for ThreadUnits {}

impl ThreadUnits {
    pub const fn empty() -> Self {
        Self {
            top_unit: core::ptr::null_mut(),
            cur_unit: core::ptr::null_mut(),
            free_list: [0; BLOCK_TYPES],
            owner_thread: 0,
            which: 0,
            writable: true,
            stats: [ClassStats { cur: 0, max: 0, wasted: 0, max_wasted: 0 };
                    BLOCK_TYPES],
        }
    }

    pub fn which(&self) -> which_vmm_t {
        self.which
    }

    pub fn owner(&self) -> usize {
        self.owner_thread
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn stats(&self) -> &[ClassStats; BLOCK_TYPES] {
        &self.stats
    }
}

/* ---- process-wide unit management ----------------------------------- */

struct UnitMgt {
    /* Retired units kept for reuse, singly linked through next_local,
     * sorted by reserved size ascending. */
    dead_list: *mut HeapUnit,
    num_dead: u32,

    /* All live units, doubly linked through next/prev_global. */
    live_list: *mut HeapUnit,

    num_thread_heaps: u32,

    /* Reservation accounting for vmm-managed units (live and dead). */
    vmm_units_reserved: usize,
}

pub(crate) static UNIT_LOCK: RecursiveLock = RecursiveLock::new();

static UNITS: GlobalCell<UnitMgt> = GlobalCell::new(UnitMgt {
    dead_list: core::ptr::null_mut(),
    num_dead: 0,
    live_list: core::ptr::null_mut(),
    num_thread_heaps: 0,
    vmm_units_reserved: 0,
});

/* Dead-list length cap, scaled with the number of live thread heaps. */
fn dead_list_cap(mgt: &UnitMgt) -> u32 {
    5 + mgt.num_thread_heaps
}

pub fn vmm_units_reserved_bytes() -> usize {
    UNIT_LOCK.with(|| unsafe { (*UNITS.get()).vmm_units_reserved })
}

fn use_guard_pages(which: which_vmm_t) -> bool {
    let opts = options();
    opts.guard_pages &&
        (which & VMM_PER_THREAD == 0 || opts.per_thread_guard_pages)
}

/*
 * Create (or resurrect) a unit with at least |size| bytes including
 * the unit header.  Requires the DR-areas lock: unit bookkeeping must
 * be visible to the runtime's area tracking, and the area lock ranks
 * above ours, so a caller that does not hold it gets the retry
 * sentinel instead of a deadlock.
 */
pub(crate) fn heap_create_unit(size: usize, which: which_vmm_t,
                               oversize: bool)
    -> Result<*mut HeapUnit, ErrNO>
{
    if !hooks().dr_areas_locked() {
        return Err(ErrNO::RetryWithOuterLock);
    }
    UNIT_LOCK.lock();
    let result = heap_create_unit_locked(size, which, oversize);
    UNIT_LOCK.unlock();
    result
}

fn heap_create_unit_locked(size: usize, which: which_vmm_t, oversize: bool)
    -> Result<*mut HeapUnit, ErrNO>
{
    let mgt = UNITS.get();
    unsafe {
        /* Smallest-first scan of the dead list. */
        let mut prev: *mut HeapUnit = core::ptr::null_mut();
        let mut dead = (*mgt).dead_list;
        while !dead.is_null() {
            if (*dead).which == which && unit_reserved_size(dead) >= size {
                if prev.is_null() {
                    (*mgt).dead_list = (*dead).next_local;
                } else {
                    (*prev).next_local = (*dead).next_local;
                }
                (*mgt).num_dead -= 1;
                (*dead).next_local = core::ptr::null_mut();
                (*dead).cur_pc = (*dead).start_pc;
                (*dead).oversize = oversize;
                link_live(mgt, dead);
                hooks().add_dr_area(unit_addr(dead), (*dead).end_pc,
                                    MEMPROT_READ | MEMPROT_WRITE, false);
                dprintf!(SPEW, "reusing dead unit {:#x} size {:#x}\n",
                         unit_addr(dead), unit_reserved_size(dead));
                return Ok(dead);
            }
            prev = dead;
            dead = (*dead).next_local;
        }
    }

    let guard = if use_guard_pages(which) { PAGE_SIZE } else { 0 };
    let reserve_size = PAGE_ALIGN!(size) + 2 * guard;

    let (base, vmm_managed) = match vmm::vmm_reserve(reserve_size, None, which) {
        Ok(p) => (p, true),
        Err(_) => {
            /* Region exhausted (or vm_reserve off): go straight to
             * the OS.  Such memory is not rel32-reachable. */
            (os_reserve_with_recovery(reserve_size, which)?, false)
        }
    };
    let ua = base + guard;
    /* Commit lazily: the first increment now, the rest as the bump
     * pointer approaches it. */
    let increment = ROUNDUP!(options().heap_commit_increment.max(PAGE_SIZE),
                             PAGE_SIZE);
    let commit_size = PAGE_ALIGN!(size).min(increment);
    commit_with_recovery(ua, commit_size, MEMPROT_READ | MEMPROT_WRITE,
                         which, vmm_managed, OomPhase::Commit)?;

    let u = ua as *mut HeapUnit;
    unsafe {
        (*u).start_pc = ua + UNIT_HEADER_SIZE;
        (*u).cur_pc = (*u).start_pc;
        (*u).end_pc = ua + commit_size;
        (*u).reserved_end_pc = base + reserve_size - guard;
        (*u).alloc_base = base;
        (*u).alloc_size = reserve_size;
        (*u).which = which;
        (*u).vmm_managed = vmm_managed;
        (*u).oversize = oversize;
        (*u).next_local = core::ptr::null_mut();
        (*u).next_global = core::ptr::null_mut();
        (*u).prev_global = core::ptr::null_mut();
        if cfg!(debug_assertions) {
            os::os_fill((*u).start_pc, HEAP_UNALLOCATED_BYTE,
                        (*u).end_pc - (*u).start_pc);
        }
        let mgt = UNITS.get();
        link_live(mgt, u);
        if vmm_managed {
            /* The region rounded our reservation to whole blocks. */
            let block = vmm::vmm_region_stats(which).3;
            (*mgt).vmm_units_reserved += ROUNDUP!(reserve_size, block);
        }
        hooks().add_dr_area(ua, (*u).end_pc, MEMPROT_READ | MEMPROT_WRITE,
                            false);
        dprintf!(SPEW,
                 "new unit {:#x}: reserved {:#x} committed {:#x} which=0x{:x}\n",
                 ua, reserve_size, commit_size, which);
    }
    Ok(u)
}

unsafe fn link_live(mgt: *mut UnitMgt, u: *mut HeapUnit) {
    (*u).prev_global = core::ptr::null_mut();
    (*u).next_global = (*mgt).live_list;
    if !(*mgt).live_list.is_null() {
        (*(*mgt).live_list).prev_global = u;
    }
    (*mgt).live_list = u;
}

unsafe fn unlink_live(mgt: *mut UnitMgt, u: *mut HeapUnit) {
    if !(*u).prev_global.is_null() {
        (*(*u).prev_global).next_global = (*u).next_global;
    } else {
        RT_DEBUG_ASSERT!((*mgt).live_list == u);
        (*mgt).live_list = (*u).next_global;
    }
    if !(*u).next_global.is_null() {
        (*(*u).next_global).prev_global = (*u).prev_global;
    }
    (*u).next_global = core::ptr::null_mut();
    (*u).prev_global = core::ptr::null_mut();
}

/* Retire a unit: onto the dead list if there is room, back to the
 * region / OS otherwise.  Same outer-lock discipline as creation. */
pub(crate) fn heap_free_unit(u: *mut HeapUnit) -> Result<(), ErrNO> {
    if !hooks().dr_areas_locked() {
        return Err(ErrNO::RetryWithOuterLock);
    }
    UNIT_LOCK.lock();
    unsafe {
        let mgt = UNITS.get();
        unlink_live(mgt, u);
        hooks().remove_dr_area(unit_addr(u), (*u).end_pc);

        if (*mgt).num_dead < dead_list_cap(&*mgt) {
            if cfg!(debug_assertions) {
                os::os_fill((*u).start_pc, HEAP_UNALLOCATED_BYTE,
                            (*u).end_pc - (*u).start_pc);
            }
            (*u).cur_pc = (*u).start_pc;
            insert_dead_sorted(mgt, u);
            dprintf!(SPEW, "unit {:#x} retired to dead list ({} dead)\n",
                     unit_addr(u), (*mgt).num_dead);
        } else {
            release_unit(mgt, u);
        }
    }
    UNIT_LOCK.unlock();
    Ok(())
}

unsafe fn insert_dead_sorted(mgt: *mut UnitMgt, u: *mut HeapUnit) {
    let size = unit_reserved_size(u);
    let mut prev: *mut HeapUnit = core::ptr::null_mut();
    let mut cur = (*mgt).dead_list;
    while !cur.is_null() && unit_reserved_size(cur) < size {
        prev = cur;
        cur = (*cur).next_local;
    }
    (*u).next_local = cur;
    if prev.is_null() {
        (*mgt).dead_list = u;
    } else {
        (*prev).next_local = u;
    }
    (*mgt).num_dead += 1;
}

unsafe fn release_unit(mgt: *mut UnitMgt, u: *mut HeapUnit) {
    let base = (*u).alloc_base;
    let size = (*u).alloc_size;
    let which = (*u).which;
    let committed_base = unit_addr(u);
    let committed = (*u).end_pc - committed_base;
    dprintf!(SPEW, "releasing unit {:#x} reserved {:#x}\n", committed_base,
             size);
    if (*u).vmm_managed {
        let block = vmm::vmm_region_stats(which).3;
        let _ = vmm::vmm_decommit(committed_base, committed, which);
        vmm::vmm_free(base, size, which);
        (*mgt).vmm_units_reserved -= ROUNDUP!(size, block);
    } else {
        let _ = os::os_release(base, size);
    }
}

/* Drain the dead list entirely (exit path and low-memory response). */
pub(crate) fn heap_release_dead_units() {
    UNIT_LOCK.lock();
    unsafe {
        let mgt = UNITS.get();
        let mut dead = (*mgt).dead_list;
        while !dead.is_null() {
            let next = (*dead).next_local;
            release_unit(mgt, dead);
            dead = next;
        }
        (*mgt).dead_list = core::ptr::null_mut();
        (*mgt).num_dead = 0;
    }
    UNIT_LOCK.unlock();
}

/* ---- size classes ---------------------------------------------------- */

fn size_to_class(aligned: usize) -> usize {
    for (k, &sz) in BLOCK_SIZES.iter().enumerate() {
        if aligned <= sz {
            return k;
        }
    }
    VARIABLE_CLASS
}

/* Bytes actually carved out of a unit for a request of |aligned|
 * payload bytes in class |class|. */
fn class_carve_size(class: usize, aligned: usize) -> usize {
    if class == VARIABLE_CLASS {
        aligned + HEADER_SIZE
    } else {
        BLOCK_SIZES[class]
    }
}

fn payload_size(class: usize, aligned: usize) -> usize {
    if class == VARIABLE_CLASS {
        aligned
    } else {
        BLOCK_SIZES[class]
    }
}

unsafe fn read_word(p: vaddr_t) -> vaddr_t {
    (p as *const vaddr_t).read()
}

unsafe fn write_word(p: vaddr_t, v: vaddr_t) {
    (p as *mut vaddr_t).write(v)
}

/* Stored payload size of a variable-class block. */
unsafe fn variable_size(p: vaddr_t) -> usize {
    read_word(p - HEADER_SIZE)
}

/* ---- per-heap operations --------------------------------------------- */

pub(crate) fn threadunits_init(tu: &mut ThreadUnits, initial_size: usize,
                               which: which_vmm_t, owner: usize)
    -> Result<(), ErrNO>
{
    RT_ASSERT!(tu.top_unit.is_null());
    let u = heap_create_unit(initial_size + UNIT_HEADER_SIZE, which, false)?;
    tu.top_unit = u;
    tu.cur_unit = u;
    tu.free_list = [0; BLOCK_TYPES];
    tu.which = which;
    tu.owner_thread = owner;
    tu.writable = true;
    if owner != 0 {
        UNIT_LOCK.with(|| unsafe { (*UNITS.get()).num_thread_heaps += 1 });
    }
    Ok(())
}

pub(crate) fn threadunits_exit(tu: &mut ThreadUnits) -> Result<(), ErrNO> {
    if !hooks().dr_areas_locked() {
        return Err(ErrNO::RetryWithOuterLock);
    }
    let mut u = tu.top_unit;
    while !u.is_null() {
        let next = unsafe { (*u).next_local };
        heap_free_unit(u)?;
        u = next;
    }
    if tu.owner_thread != 0 {
        UNIT_LOCK.with(|| unsafe { (*UNITS.get()).num_thread_heaps -= 1 });
    }
    *tu = ThreadUnits::empty();
    Ok(())
}

/*
 * The workhorse.  Returns the payload address; the only error that can
 * escape is the retry sentinel (genuine memory exhaustion terminates
 * via report_oom inside the commit/reserve helpers).
 */
pub(crate) fn common_heap_alloc(tu: &mut ThreadUnits, size: usize)
    -> Result<vaddr_t, ErrNO>
{
    RT_ASSERT!(size > 0 && size <= MAX_ALLOC_SIZE);
    let aligned = ROUNDUP!(size, HEAP_ALIGNMENT);
    let class = size_to_class(aligned);
    let carve = class_carve_size(class, aligned);

    if carve > maxroom() {
        return oversize_alloc(tu, size, aligned, carve);
    }

    /* Free-list hit? */
    if tu.free_list[class] != 0 {
        let p = if class == VARIABLE_CLASS {
            pop_variable_fit(tu, aligned)
        } else {
            let p = tu.free_list[class];
            tu.free_list[class] = unsafe { read_word(p) };
            p
        };
        if p != 0 {
            finish_alloc(tu, p, size, aligned, class);
            return Ok(p);
        }
    }

    /* Bump from the current unit, extending commitment as needed. */
    let cur = tu.cur_unit;
    let mut p = unsafe { unit_bump(cur, carve, tu.which) };
    if p == 0 {
        /* Tail room in an earlier unit?  Oversize units are atomic
         * and never rejoined. */
        let mut walk = tu.top_unit;
        while !walk.is_null() && p == 0 {
            unsafe {
                if walk != cur && !(*walk).oversize {
                    p = unit_bump(walk, carve, tu.which);
                }
                walk = (*walk).next_local;
            }
        }
    }
    if p == 0 {
        /* Grow: a fresh unit at twice the previous size, capped. */
        let prev_size = unsafe { unit_reserved_size(cur) };
        let new_size = (prev_size * 2)
            .max(carve + UNIT_HEADER_SIZE)
            .min(options().max_heap_unit_size);
        RT_DEBUG_ASSERT!(new_size >= carve + UNIT_HEADER_SIZE);
        let fresh = heap_create_unit(new_size, tu.which, false)?;
        unsafe {
            (*tu.cur_unit).next_local = fresh;
            tu.cur_unit = fresh;
            p = unit_bump(fresh, carve, tu.which);
        }
        RT_ASSERT!(p != 0);
    }

    let p = if class == VARIABLE_CLASS {
        unsafe {
            write_word(p, aligned);
        }
        p + HEADER_SIZE
    } else {
        p
    };
    finish_alloc(tu, p, size, aligned, class);
    Ok(p)
}

/* Bump-allocate |carve| bytes from |u|, growing commitment in
 * heap_commit_increment steps; 0 when the unit cannot hold it. */
unsafe fn unit_bump(u: *mut HeapUnit, carve: usize, which: which_vmm_t)
    -> vaddr_t
{
    if (*u).cur_pc + carve > (*u).end_pc {
        let needed = (*u).cur_pc + carve;
        if needed > (*u).reserved_end_pc {
            return 0;
        }
        let increment = options().heap_commit_increment.max(PAGE_SIZE);
        let new_end = ROUNDUP!(needed - unit_addr(u), increment)
            .min((*u).reserved_end_pc - unit_addr(u)) + unit_addr(u);
        let grow = new_end - (*u).end_pc;
        let committed = if (*u).vmm_managed {
            vmm::vmm_commit((*u).end_pc, grow,
                            MEMPROT_READ | MEMPROT_WRITE, which).is_ok()
        } else {
            os::os_commit((*u).end_pc, grow,
                          MEMPROT_READ | MEMPROT_WRITE).is_ok()
        };
        if !committed {
            return 0;
        }
        if cfg!(debug_assertions) {
            os::os_fill((*u).end_pc, HEAP_UNALLOCATED_BYTE, grow);
        }
        /* Commitment is monotone: end_pc never decreases. */
        (*u).end_pc = new_end;
        hooks().update_memory_areas(unit_addr(u), new_end,
                                    MEMPROT_READ | MEMPROT_WRITE, which);
    }
    let p = (*u).cur_pc;
    (*u).cur_pc += carve;
    p
}

/* First-fit walk of the variable-class free list. */
fn pop_variable_fit(tu: &mut ThreadUnits, aligned: usize) -> vaddr_t {
    unsafe {
        let mut prev: vaddr_t = 0;
        let mut p = tu.free_list[VARIABLE_CLASS];
        while p != 0 {
            if variable_size(p) >= aligned {
                let next = read_word(p);
                if prev == 0 {
                    tu.free_list[VARIABLE_CLASS] = next;
                } else {
                    write_word(prev, next);
                }
                return p;
            }
            prev = p;
            p = read_word(p);
        }
    }
    0
}

fn finish_alloc(tu: &mut ThreadUnits, p: vaddr_t, size: usize,
                aligned: usize, class: usize) {
    RT_DEBUG_ASSERT!(IS_ALIGNED!(p, HEAP_ALIGNMENT));
    let payload = if class == VARIABLE_CLASS {
        unsafe { variable_size(p) }
    } else {
        payload_size(class, aligned)
    };
    if cfg!(debug_assertions) {
        os::os_fill(p, HEAP_ALLOCATED_BYTE, size);
        os::os_fill(p + size, HEAP_PAD_BYTE, payload - size);
        let stats = &mut tu.stats[class];
        stats.cur += 1;
        stats.max = stats.max.max(stats.cur);
        stats.wasted += (payload - size) as u64;
        stats.max_wasted = stats.max_wasted.max(stats.wasted);
    }
}

fn oversize_alloc(tu: &mut ThreadUnits, size: usize, aligned: usize,
                  carve: usize) -> Result<vaddr_t, ErrNO> {
    RT_DEBUG_ASSERT!(carve == aligned + HEADER_SIZE);
    let u = heap_create_unit(carve + UNIT_HEADER_SIZE, tu.which, true)?;
    unsafe {
        /* Keep the chain order: the oversize unit goes in front of the
         * current unit so the bump walk keeps skipping it cheaply. */
        if tu.cur_unit == tu.top_unit {
            (*u).next_local = tu.top_unit;
            tu.top_unit = u;
        } else {
            let mut prev = tu.top_unit;
            while (*prev).next_local != tu.cur_unit {
                prev = (*prev).next_local;
            }
            (*u).next_local = tu.cur_unit;
            (*prev).next_local = u;
        }
        let p = unit_bump(u, carve, tu.which);
        RT_ASSERT!(p != 0);
        write_word(p, aligned);
        let p = p + HEADER_SIZE;
        finish_alloc(tu, p, size, aligned, VARIABLE_CLASS);
        dprintf!(SPEW, "oversize alloc {:#x} bytes in unit {:#x}\n",
                 aligned, unit_addr(u));
        Ok(p)
    }
}

pub(crate) fn common_heap_free(tu: &mut ThreadUnits, p: vaddr_t, size: usize)
    -> Result<(), ErrNO>
{
    RT_ASSERT!(p != 0 && size > 0 && size <= MAX_ALLOC_SIZE);
    let aligned = ROUNDUP!(size, HEAP_ALIGNMENT);
    let class = size_to_class(aligned);
    let carve = class_carve_size(class, aligned);

    if carve > maxroom() {
        /* Must be the sole content of an oversize unit.  Check the
         * sentinel condition before touching the chain so a retry
         * re-enters with clean state. */
        if !hooks().dr_areas_locked() {
            return Err(ErrNO::RetryWithOuterLock);
        }
        let u = (p - HEADER_SIZE - UNIT_HEADER_SIZE) as *mut HeapUnit;
        unsafe {
            RT_DEBUG_ASSERT!((*u).oversize && (*u).start_pc + HEADER_SIZE == p);
            RT_DEBUG_ASSERT!(unsafe_variable_size_matches(p, aligned));
            unlink_local(tu, u);
        }
        if cfg!(debug_assertions) {
            let stats = &mut tu.stats[VARIABLE_CLASS];
            RT_DEBUG_ASSERT!(stats.cur > 0);
            stats.cur -= 1;
            stats.wasted -= (aligned - size) as u64;
        }
        return heap_free_unit(u);
    }

    let payload = if class == VARIABLE_CLASS {
        unsafe { variable_size(p) }
    } else {
        payload_size(class, aligned)
    };
    if cfg!(debug_assertions) {
        os::os_fill(p, HEAP_UNALLOCATED_BYTE, payload);
        let stats = &mut tu.stats[class];
        RT_DEBUG_ASSERT!(stats.cur > 0);
        stats.cur -= 1;
        stats.wasted -= (payload - size.min(payload)) as u64;
    }
    unsafe {
        write_word(p, tu.free_list[class]);
    }
    tu.free_list[class] = p;
    Ok(())
}

unsafe fn unsafe_variable_size_matches(p: vaddr_t, aligned: usize) -> bool {
    variable_size(p) == aligned
}

unsafe fn unlink_local(tu: &mut ThreadUnits, u: *mut HeapUnit) {
    if tu.top_unit == u {
        tu.top_unit = (*u).next_local;
        if tu.cur_unit == u {
            tu.cur_unit = tu.top_unit;
        }
        return;
    }
    let mut prev = tu.top_unit;
    while (*prev).next_local != u {
        prev = (*prev).next_local;
        RT_ASSERT!(!prev.is_null());
    }
    (*prev).next_local = (*u).next_local;
    if tu.cur_unit == u {
        tu.cur_unit = prev;
    }
}

/* ---- debug integrity ------------------------------------------------- */

unsafe fn in_some_unit(tu: &ThreadUnits, p: vaddr_t) -> bool {
    let mut u = tu.top_unit;
    while !u.is_null() {
        if p >= (*u).start_pc && p < (*u).cur_pc {
            return true;
        }
        u = (*u).next_local;
    }
    false
}

/* Walks the unit chain and the free lists, asserting the structural
 * invariants.  Debug builds only; O(n^2) over the free lists. */
pub(crate) fn heap_check(tu: &ThreadUnits) {
    if !cfg!(debug_assertions) {
        return;
    }
    unsafe {
        let mut u = tu.top_unit;
        while !u.is_null() {
            RT_ASSERT!((*u).start_pc <= (*u).cur_pc);
            RT_ASSERT!((*u).cur_pc <= (*u).end_pc);
            RT_ASSERT!((*u).end_pc <= (*u).reserved_end_pc);
            u = (*u).next_local;
        }
        for class in 0..BLOCK_TYPES {
            let mut p = tu.free_list[class];
            while p != 0 {
                RT_ASSERT!(IS_ALIGNED!(p, HEAP_ALIGNMENT));
                RT_ASSERT!(in_some_unit(tu, p));
                /* No address may appear twice across all lists. */
                let mut dups = 0;
                for other in 0..BLOCK_TYPES {
                    let mut q = tu.free_list[other];
                    while q != 0 {
                        if q == p {
                            dups += 1;
                        }
                        q = read_word(q);
                    }
                }
                RT_ASSERT!(dups == 1);
                p = read_word(p);
            }
        }
    }
}

/* ---- recovery-wrapped OS calls --------------------------------------- */

/*
 * One recovery cycle on failure: let the code cache drop dead units,
 * optionally sleep out the configured window, then retry once.  A
 * second failure is terminal.
 *
 * For reachable categories the direct-OS path must still land inside
 * the allowed window; an unreachable grant is as fatal as no grant.
 */
pub(crate) fn os_reserve_with_recovery(size: usize, which: which_vmm_t)
    -> Result<vaddr_t, ErrNO>
{
    let reserve = |hint: vaddr_t| -> Result<vaddr_t, crate::types::os_err_t> {
        let p = os::os_reserve(hint, size)?;
        if which & (VMM_REACHABLE | VMM_CACHE) != 0 &&
           !(reachability::rel32_reachable_from_vmcode(p) &&
             reachability::rel32_reachable_from_vmcode(p + size - 1)) {
            let _ = os::os_release(p, size);
            return Err(libc::ENOMEM);
        }
        Ok(p)
    };
    let hint = if which & (VMM_REACHABLE | VMM_CACHE) != 0 {
        crate::ROUNDUP!(reachability::allowable_region().0, PAGE_SIZE)
    } else {
        0
    };
    match reserve(hint) {
        Ok(p) => Ok(p),
        Err(first) => {
            oom_recovery_cycle(first);
            match reserve(hint) {
                Ok(p) => Ok(p),
                Err(err) => {
                    hooks().report_oom(which, OomPhase::Reserve, err)
                }
            }
        }
    }
}

pub(crate) fn commit_with_recovery(p: vaddr_t, size: usize, prot: u32,
                                   which: which_vmm_t, vmm_managed: bool,
                                   phase: OomPhase) -> Result<(), ErrNO> {
    let commit = |p, size| {
        if vmm_managed {
            vmm::vmm_commit(p, size, prot, which)
        } else {
            os::os_commit(p, size, prot)
        }
    };
    match commit(p, size) {
        Ok(()) => Ok(()),
        Err(first) => {
            oom_recovery_cycle(first);
            match commit(p, size) {
                Ok(()) => Ok(()),
                Err(err) => hooks().report_oom(which, phase, err),
            }
        }
    }
}

fn oom_recovery_cycle(os_error: crate::types::os_err_t) {
    dprintf!(CRITICAL, "memory pressure (os error {}), running recovery\n",
             os_error);
    hooks().notify_low_memory();
    heap_release_dead_units();
    hooks().schedule_reset(crate::hooks::ResetScope::Basic);
    let timeout = options().oom_timeout_ms;
    if timeout > 0 {
        os::os_sleep_ms(timeout);
    }
}
