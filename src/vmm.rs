/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * Virtual memory manager: large contiguous reservations carved into
 * fixed-size blocks under a bitmap.  Two canonical regions exist for
 * the life of the process:
 *
 *   vmcode - reachable-range region, holds translated code and
 *            anything that must sit within rel32 of it;
 *   vmheap - anywhere region for plain runtime data.
 *
 * Under reachable_heap everything routes through vmcode.  Under W^X
 * vmcode is file-backed and shadowed by a writable second view
 * (dualmap.rs).
 */

use spin::Mutex;
use crate::base::bitmap::{bitmap_storage_size, BlockBitmap, BITMAP_NOT_FOUND};
use crate::config::{options, HeapOptions};
use crate::debug::*;
use crate::defines::*;
use crate::dualmap::{self, DualMap, ForkSnapshot, ProtRange, MAX_PROT_RANGES};
use crate::errors::{ErrNO, OomPhase};
use crate::hooks::hooks;
use crate::os;
use crate::reachability;
use crate::types::{vaddr_t, which_vmm_t};
use crate::{dprintf, IS_ALIGNED, PAGE_ALIGN, ROUNDDOWN, ROUNDUP, RT_ASSERT,
            RT_DEBUG_ASSERT};

pub struct VmRegion {
    name: &'static str,
    used: bool,

    /* Usable block-aligned range. */
    start: vaddr_t,
    end: vaddr_t,

    /* Raw OS range; may exceed [start,end) by alignment padding. */
    alloc_start: vaddr_t,
    alloc_size: usize,

    block_size: usize,
    num_blocks: u32,
    num_free_blocks: u32,
    blocks: BlockBitmap,

    is_code: bool,
    dual_map: Option<DualMap>,

    /* Committed sub-ranges (executable view), kept for fork
     * recreation of the dual map. */
    commit_ranges: [ProtRange; MAX_PROT_RANGES],
    num_commit_ranges: usize,
}

const EMPTY_RANGE: ProtRange = ProtRange { start: 0, end: 0, prot: 0 };

static VMCODE: Mutex<VmRegion> = Mutex::new(VmRegion::empty("vmcode", true));
static VMHEAP: Mutex<VmRegion> = Mutex::new(VmRegion::empty("vmheap", false));

impl VmRegion {
    pub const fn empty(name: &'static str, is_code: bool) -> Self {
        Self {
            name,
            used: false,
            start: 0,
            end: 0,
            alloc_start: 0,
            alloc_size: 0,
            block_size: 0,
            num_blocks: 0,
            num_free_blocks: 0,
            blocks: BlockBitmap::empty(),
            is_code,
            dual_map: None,
            commit_ranges: [EMPTY_RANGE; MAX_PROT_RANGES],
            num_commit_ranges: 0,
        }
    }

    pub fn init(&mut self, size_in: usize, opts: &HeapOptions)
        -> Result<(), ErrNO>
    {
        RT_ASSERT!(!self.used);
        let block_size = opts.vmm_block_size;
        RT_ASSERT!(block_size.is_power_of_two() &&
                   IS_ALIGNED!(block_size, PAGE_SIZE));

        let size = ROUNDUP!(size_in, block_size);
        /* The bitmap index is 32-bit; larger configurations are
         * rejected rather than half-supported. */
        if size / block_size > u32::MAX as usize {
            return Err(ErrNO::InvalidHeapArg);
        }

        let (start, size, alloc_start, alloc_size) =
            place_region(self.is_code, size, block_size, opts)?;
        self.start = start;
        self.end = start + size;
        self.alloc_start = alloc_start;
        self.alloc_size = alloc_size;
        self.block_size = block_size;
        self.num_blocks = ((self.end - self.start) / block_size) as u32;
        self.num_free_blocks = self.num_blocks;

        if self.is_code && opts.satisfy_w_xor_x {
            if cfg!(target_os = "linux") {
                let dm = DualMap::create(self.start, self.end - self.start)
                    .map_err(|e| {
                        let _ = os::os_release(self.alloc_start, self.alloc_size);
                        e
                    })?;
                self.dual_map = Some(dm);
            } else {
                /* No shared memory-file primitive: W^X is off, not
                 * emulated. */
                dprintf!(CRITICAL,
                         "satisfy_w_xor_x requested but unsupported here; \
                          running without it\n");
            }
        }

        /* The bitmap occupies the first blocks of the region itself
         * (its writable shadow under W^X) and is marked reserved so
         * user allocations never collide with it. */
        let bitmap_bytes = bitmap_storage_size(self.num_blocks);
        let commit_bytes = PAGE_ALIGN!(bitmap_bytes);
        self.commit_region_memory(self.start, commit_bytes,
                                  MEMPROT_READ | MEMPROT_WRITE)
            .map_err(|os_error| {
                self.teardown_mapping();
                ErrNO::OutOfCommitted { phase: OomPhase::Init, os_error }
            })?;
        self.blocks.storage_init(self.writable_addr(self.start),
                                 self.num_blocks);
        let bitmap_blocks =
            (ROUNDUP!(bitmap_bytes, self.block_size) / self.block_size) as u32;
        let idx = self.blocks.allocate_blocks(bitmap_blocks, Some(0));
        RT_ASSERT!(idx == 0);
        self.num_free_blocks -= bitmap_blocks;

        if self.is_code {
            reachability::set_vmcode_bounds(self.start, self.end);
            if let Err(e) = reachability::request_region_be_heap_reachable(
                self.start, self.end - self.start) {
                self.teardown_mapping();
                reachability::set_vmcode_bounds(0, 0);
                *self = VmRegion::empty(self.name, self.is_code);
                return Err(e);
            }
        }
        hooks().update_memory_areas(self.start, self.end, MEMPROT_NONE, 0);

        self.used = true;
        dprintf!(INFO,
                 "vmm {} reservation: [{:#x},{:#x}) blocks={} free={}\n",
                 self.name, self.start, self.end, self.num_blocks,
                 self.num_free_blocks);
        Ok(())
    }

    /* Destroy the region if fully idle.  A region with live blocks is
     * intentionally leaked: threads may still be executing on stacks
     * inside it. */
    pub fn exit(&mut self) {
        if !self.used {
            return;
        }
        let bitmap_bytes = bitmap_storage_size(self.num_blocks);
        let bitmap_blocks =
            (ROUNDUP!(bitmap_bytes, self.block_size) / self.block_size) as u32;
        if self.num_free_blocks + bitmap_blocks == self.num_blocks {
            dprintf!(INFO, "vmm {} exit: releasing [{:#x},{:#x})\n",
                     self.name, self.start, self.end);
            self.teardown_mapping();
        } else {
            dprintf!(CRITICAL,
                     "vmm {} exit: {} blocks still reserved, leaking region\n",
                     self.name,
                     self.num_blocks - bitmap_blocks - self.num_free_blocks);
        }
        *self = VmRegion::empty(self.name, self.is_code);
    }

    fn teardown_mapping(&mut self) {
        if let Some(dm) = self.dual_map.take() {
            dm.close();
        }
        let _ = os::os_release(self.alloc_start, self.alloc_size);
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn bounds(&self) -> (vaddr_t, vaddr_t) {
        (self.start, self.end)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> u32 {
        self.num_free_blocks
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn bitmap_blocks(&self) -> u32 {
        (ROUNDUP!(bitmap_storage_size(self.num_blocks), self.block_size)
            / self.block_size) as u32
    }

    fn addr_to_block(&self, p: vaddr_t) -> u32 {
        RT_DEBUG_ASSERT!(self.in_region(p));
        RT_DEBUG_ASSERT!(IS_ALIGNED!(p, self.block_size));
        ((p - self.start) / self.block_size) as u32
    }

    fn block_to_addr(&self, block: u32) -> vaddr_t {
        RT_DEBUG_ASSERT!(block < self.num_blocks);
        self.start + block as usize * self.block_size
    }

    pub fn in_region(&self, p: vaddr_t) -> bool {
        self.used && p >= self.start && p < self.end
    }

    /* Accept either view of a W^X region and return the executable
     * one, which is the canonical address for bitmap accounting. */
    pub fn normalize_addr(&self, p: vaddr_t) -> vaddr_t {
        match &self.dual_map {
            Some(dm) => dm.executable_addr(p),
            None => p,
        }
    }

    pub fn writable_addr(&self, p: vaddr_t) -> vaddr_t {
        match &self.dual_map {
            Some(dm) => dm.writable_addr(p),
            None => p,
        }
    }

    pub fn has_writable_shadow(&self) -> bool {
        self.dual_map.is_some()
    }

    /*
     * Sub-allocate |size_in| (rounded up to blocks).  The returned
     * address is the executable view for code categories; data under
     * W^X is translated to the writable view so callers above this
     * layer never see executable-only pointers for their data.
     */
    pub fn reserve_blocks(&mut self, size_in: usize,
                          preferred: Option<vaddr_t>, which: which_vmm_t)
        -> Result<vaddr_t, ErrNO>
    {
        if !self.used {
            return Err(ErrNO::OutOfVirtual {
                phase: OomPhase::Reserve, os_error: 0,
            });
        }
        let size = ROUNDUP!(size_in, self.block_size);
        let request = (size / self.block_size) as u32;
        let must_start = match preferred {
            Some(p) => {
                let p = self.normalize_addr(p);
                if !self.in_region(p) || !IS_ALIGNED!(p, self.block_size) {
                    return Err(ErrNO::OutOfVirtual {
                        phase: OomPhase::Reserve, os_error: 0,
                    });
                }
                Some(self.addr_to_block(p))
            }
            None => None,
        };

        let idx = self.blocks.allocate_blocks(request, must_start);
        if idx == BITMAP_NOT_FOUND {
            dprintf!(SPEW, "vmm {}: no fit for {} blocks (free={})\n",
                     self.name, request, self.num_free_blocks);
            return Err(ErrNO::OutOfVirtual {
                phase: OomPhase::Reserve, os_error: 0,
            });
        }
        self.num_free_blocks -= request;
        RT_DEBUG_ASSERT!(self.blocks.consistency_check(self.num_free_blocks));

        let p = self.block_to_addr(idx);
        dprintf!(SPEW, "vmm {}: reserve {} blocks at {:#x} which=0x{:x}\n",
                 self.name, request, p, which);
        if self.dual_map.is_some() && which & VMM_CACHE == 0 {
            return Ok(self.writable_addr(p));
        }
        Ok(p)
    }

    pub fn free_blocks(&mut self, p: vaddr_t, size_in: usize,
                       _which: which_vmm_t) {
        let p = self.normalize_addr(p);
        let size = ROUNDUP!(size_in, self.block_size);
        let count = (size / self.block_size) as u32;
        let idx = self.addr_to_block(p);
        self.blocks.free_blocks(idx, count);
        self.num_free_blocks += count;
        RT_DEBUG_ASSERT!(self.blocks.consistency_check(self.num_free_blocks));
    }

    pub fn is_reserved(&self, p: vaddr_t, size: usize) -> bool {
        let p = self.normalize_addr(p);
        if !self.in_region(p) {
            return false;
        }
        let count = (ROUNDUP!(size, self.block_size) / self.block_size) as u32;
        self.blocks.are_reserved_blocks(self.addr_to_block(p), count)
    }

    /*
     * Back [addr, addr+size) with the given protection.  Under W^X
     * the writable shadow of the bytes is committed as well and the
     * executable view never gains write.  The one-time +x cost was
     * already paid when the memory file was created.
     */
    pub fn commit(&mut self, addr: vaddr_t, size: usize, prot: u32,
                  _which: which_vmm_t) -> Result<(), crate::types::os_err_t> {
        let exec = self.normalize_addr(addr);
        RT_DEBUG_ASSERT!(self.in_region(exec));
        self.commit_region_memory(exec, size, prot)
    }

    fn commit_region_memory(&mut self, exec: vaddr_t, size: usize, prot: u32)
        -> Result<(), crate::types::os_err_t>
    {
        if self.dual_map.is_some() {
            self.dual_map.as_ref().unwrap().commit_shadow(exec, size)?;
            os::os_protect(exec, size, prot & !MEMPROT_WRITE)?;
            self.add_commit_range(exec, exec + size, prot);
            Ok(())
        } else {
            os::os_commit(exec, size, prot)
        }
    }

    pub fn decommit(&mut self, addr: vaddr_t, size: usize)
        -> Result<(), crate::types::os_err_t>
    {
        let exec = self.normalize_addr(addr);
        RT_DEBUG_ASSERT!(self.in_region(exec));
        if self.dual_map.is_some() {
            self.dual_map.as_ref().unwrap().decommit_shadow(exec, size)?;
            os::os_protect(exec, size, MEMPROT_NONE)?;
            self.remove_commit_range(exec, exec + size);
            Ok(())
        } else {
            os::os_decommit(exec, size)
        }
    }

    fn add_commit_range(&mut self, start: vaddr_t, end: vaddr_t, prot: u32) {
        /* Merge with an adjacent same-protection range if possible. */
        for r in self.commit_ranges[..self.num_commit_ranges].iter_mut() {
            if r.prot == prot && r.end == start {
                r.end = end;
                return;
            }
            if r.prot == prot && r.start == end {
                r.start = start;
                return;
            }
        }
        RT_ASSERT!(self.num_commit_ranges < MAX_PROT_RANGES);
        self.commit_ranges[self.num_commit_ranges] =
            ProtRange { start, end, prot };
        self.num_commit_ranges += 1;
    }

    fn remove_commit_range(&mut self, start: vaddr_t, end: vaddr_t) {
        let mut i = 0;
        while i < self.num_commit_ranges {
            let r = self.commit_ranges[i];
            if r.start == start && r.end == end {
                self.commit_ranges[i] =
                    self.commit_ranges[self.num_commit_ranges - 1];
                self.num_commit_ranges -= 1;
                return;
            }
            if r.start <= start && end <= r.end {
                /* Trim an interior hole: keep the left part, append
                 * the right part. */
                self.commit_ranges[i].end = start;
                if end < r.end {
                    self.add_commit_range(end, r.end, r.prot);
                }
                if self.commit_ranges[i].start == self.commit_ranges[i].end {
                    self.commit_ranges[i] =
                        self.commit_ranges[self.num_commit_ranges - 1];
                    self.num_commit_ranges -= 1;
                }
                return;
            }
            i += 1;
        }
    }

    pub fn commit_ranges(&self) -> &[ProtRange] {
        &self.commit_ranges[..self.num_commit_ranges]
    }

    pub fn dump_map(&self) {
        if !self.used {
            dprintf!(ALWAYS, "vmm {}: unused\n", self.name);
            return;
        }
        dprintf!(ALWAYS, "vmm {}: [{:#x},{:#x}) block={:#x} free {}/{}\n",
                 self.name, self.start, self.end, self.block_size,
                 self.num_free_blocks, self.num_blocks);
        let mut i = 0;
        while i < self.num_blocks {
            let free = self.blocks.are_free_blocks(i, 1);
            let mut j = i + 1;
            while j < self.num_blocks && self.blocks.are_free_blocks(j, 1) == free {
                j += 1;
            }
            dprintf!(ALWAYS, "  [{:#x},{:#x}) {}\n",
                     self.block_to_addr(i),
                     self.start + j as usize * self.block_size,
                     if free { "free" } else { "reserved" });
            i = j;
        }
    }
}

/*
 * Placement policy for a region reservation.  Preference order for the
 * code region: near our own image, then the configured base plus a
 * randomized block-aligned offset, then OS-chosen.  Each candidate is
 * screened against the reachability window, and the whole ladder is
 * retried at geometrically smaller sizes when vm_allow_smaller.
 */
fn place_region(is_code: bool, size_in: usize, block_size: usize,
                opts: &HeapOptions)
    -> Result<(vaddr_t, usize, vaddr_t, usize), ErrNO>
{
    let min_size = 4 * block_size;
    let mut size = size_in;
    loop {
        let err = match place_region_at_size(is_code, size, block_size, opts) {
            Ok((start, alloc_start, alloc_size)) => {
                if size < size_in {
                    dprintf!(INFO, "vmm: shrank reservation {:#x} -> {:#x}\n",
                             size_in, size);
                }
                return Ok((start, size, alloc_start, alloc_size));
            }
            Err(e) => e,
        };
        if !opts.vm_allow_smaller || size / 2 < min_size {
            return Err(ErrNO::OutOfVirtual {
                phase: OomPhase::Init, os_error: err,
            });
        }
        size = ROUNDUP!(size / 2, block_size);
    }
}

fn place_region_at_size(is_code: bool, size: usize, block_size: usize,
                        opts: &HeapOptions)
    -> Result<(vaddr_t, vaddr_t, usize), crate::types::os_err_t>
{
    let (allow_start, allow_end) = if is_code {
        reachability::allowable_region()
    } else {
        (0, vaddr_t::MAX)
    };
    let fits_window = |base: vaddr_t| -> bool {
        base >= allow_start && (base + size - 1) <= allow_end
    };

    let mut candidates = [0 as vaddr_t; 5];
    let mut num = 0;
    if is_code {
        if opts.vm_base != 0 {
            let offset_blocks = os::os_random_seed()
                % (opts.vm_max_offset / block_size + 1);
            candidates[num] = opts.vm_base + offset_blocks * block_size;
            num += 1;
        }
        if opts.vm_base_near_app {
            /* Our own image stands in for the application. */
            static APP_ANCHOR: u8 = 0;
            let near = ROUNDUP!(&APP_ANCHOR as *const u8 as usize, block_size);
            candidates[num] = near + 32 * MB;
            num += 1;
            candidates[num] = near + 512 * MB;
            num += 1;
        }
        if allow_end != vaddr_t::MAX {
            /* Constrained window: derive an in-window candidate. */
            candidates[num] =
                ROUNDDOWN!(allow_end.saturating_sub(size - 1), block_size);
            num += 1;
        }
    }

    let mut last_err: crate::types::os_err_t = libc::ENOMEM;
    for &base in &candidates[..num] {
        let base = ROUNDUP!(base, block_size);
        if base == 0 || !fits_window(base) {
            continue;
        }
        match os::os_reserve_at(base, size) {
            Ok(start) => return Ok((start, start, size)),
            Err(e) => last_err = e,
        }
    }

    if !is_code || opts.vm_allow_not_at_base || num == 0 {
        /* OS-chosen base; over-reserve to guarantee block alignment. */
        let alloc_size = size + block_size;
        let alloc_start = os::os_reserve(0, alloc_size)?;
        let start = ROUNDUP!(alloc_start, block_size);
        if is_code && !fits_window(start) {
            let _ = os::os_release(alloc_start, alloc_size);
            return Err(last_err);
        }
        return Ok((start, alloc_start, alloc_size));
    }
    Err(last_err)
}

/* ---- process-wide surface ------------------------------------------- */

fn region_for_which(which: which_vmm_t) -> &'static Mutex<VmRegion> {
    if options().reachable_heap || which & (VMM_REACHABLE | VMM_CACHE) != 0 {
        &VMCODE
    } else {
        &VMHEAP
    }
}

pub fn vmm_init() -> Result<(), ErrNO> {
    let opts = options();
    if !opts.vm_reserve {
        dprintf!(INFO, "vmm: vm_reserve off, all allocations direct from OS\n");
        return Ok(());
    }
    VMCODE.lock().init(opts.vm_size, &opts)?;
    if !opts.reachable_heap {
        if let Err(e) = VMHEAP.lock().init(opts.vmheap_size, &opts) {
            VMCODE.lock().exit();
            return Err(e);
        }
    }
    Ok(())
}

pub fn vmm_exit() {
    VMHEAP.lock().exit();
    VMCODE.lock().exit();
}

pub fn vmm_reserve(size: usize, preferred: Option<vaddr_t>,
                   which: which_vmm_t) -> Result<vaddr_t, ErrNO> {
    region_for_which(which).lock().reserve_blocks(size, preferred, which)
}

pub fn vmm_free(p: vaddr_t, size: usize, which: which_vmm_t) {
    region_for_which(which).lock().free_blocks(p, size, which)
}

pub fn vmm_commit(p: vaddr_t, size: usize, prot: u32, which: which_vmm_t)
    -> Result<(), crate::types::os_err_t>
{
    region_for_which(which).lock().commit(p, size, prot, which)
}

pub fn vmm_decommit(p: vaddr_t, size: usize, which: which_vmm_t)
    -> Result<(), crate::types::os_err_t>
{
    region_for_which(which).lock().decommit(p, size)
}

/* Whether [p, p+size) was parceled out of one of our regions. */
pub fn vmm_is_reserved_address(p: vaddr_t, size: usize) -> bool {
    VMCODE.lock().is_reserved(p, size) || VMHEAP.lock().is_reserved(p, size)
}

pub fn vmm_in_region(p: vaddr_t, which: which_vmm_t) -> bool {
    let region = region_for_which(which).lock();
    region.in_region(region.normalize_addr(p))
}

pub fn vmm_wx_enabled() -> bool {
    VMCODE.lock().has_writable_shadow()
}

/* Translate between the two W^X views.  Identity when W^X is off or
 * the address is outside the code region. */
pub fn vmm_writable_addr(p: vaddr_t) -> vaddr_t {
    VMCODE.lock().writable_addr(p)
}

pub fn vmm_executable_addr(p: vaddr_t) -> vaddr_t {
    VMCODE.lock().normalize_addr(p)
}

pub fn vmm_region_stats(which: which_vmm_t) -> (u32, u32, u32, usize) {
    let region = region_for_which(which).lock();
    (region.num_blocks(), region.num_free_blocks(), region.bitmap_blocks(),
     region.block_size())
}

pub fn vmm_dump() {
    VMCODE.lock().dump_map();
    VMHEAP.lock().dump_map();
}

/* ---- fork support (W^X only) ---------------------------------------- */

static FORK_SNAPSHOT: Mutex<Option<ForkSnapshot>> = Mutex::new(None);

pub fn vmm_prefork() -> Result<(), ErrNO> {
    let code = VMCODE.lock();
    if let Some(dm) = &code.dual_map {
        let snap = dualmap::prefork_snapshot(dm, code.commit_ranges())?;
        *FORK_SNAPSHOT.lock() = Some(snap);
    }
    Ok(())
}

pub fn vmm_postfork_parent() {
    if let Some(snap) = FORK_SNAPSHOT.lock().take() {
        dualmap::postfork_parent_release(&snap);
    }
}

pub fn vmm_postfork_child() -> Result<(), ErrNO> {
    let snap = FORK_SNAPSHOT.lock().take();
    if let Some(snap) = snap {
        let mut code = VMCODE.lock();
        if let Some(dm) = code.dual_map.as_mut() {
            dualmap::postfork_child_recreate(dm, &snap)?;
        }
    }
    Ok(())
}
