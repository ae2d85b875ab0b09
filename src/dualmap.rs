/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * W^X shadow of the code region: the same memory-file bytes mapped
 * twice, once executable and once writable, so code is patched through
 * the shadow without any page ever being writable and executable at
 * the same address.
 *
 * Valid only when satisfy_w_xor_x is on and the platform has an
 * anonymous memory-file primitive; otherwise W^X is declared off at
 * init rather than faked.
 */

use crate::debug::*;
use crate::defines::{MEMPROT_NONE, MEMPROT_READ, MEMPROT_WRITE};
use crate::dprintf;
use crate::errors::ErrNO;
use crate::os;
use crate::types::{file_t, vaddr_t};
use crate::RT_DEBUG_ASSERT;

pub struct DualMap {
    fd: file_t,
    exec_base: vaddr_t,
    size: usize,
    writable_base: vaddr_t,
}

impl DualMap {
    /*
     * Replace the anonymous reservation at [exec_base, exec_base+size)
     * with a file-backed mapping and add a second, writable view of
     * the same file elsewhere.  Both views start fully inaccessible;
     * commit opens them range by range.
     */
    pub fn create(exec_base: vaddr_t, size: usize) -> Result<DualMap, ErrNO> {
        let fd = os::os_create_memory_file(size).map_err(|e| {
            dprintf!(CRITICAL, "W^X memory file creation failed: {}\n", e);
            ErrNO::WxorXFailure
        })?;
        if let Err(e) = os::os_map_file(fd, 0, exec_base, size, MEMPROT_NONE, true) {
            dprintf!(CRITICAL, "W^X executable view mapping failed: {}\n", e);
            os::os_close(fd);
            return Err(ErrNO::WxorXFailure);
        }
        let writable_base = match os::os_map_file(fd, 0, 0, size, MEMPROT_NONE,
                                                  false) {
            Ok(base) => base,
            Err(e) => {
                dprintf!(CRITICAL, "W^X writable view mapping failed: {}\n", e);
                os::os_close(fd);
                return Err(ErrNO::WxorXFailure);
            }
        };
        dprintf!(INFO, "W^X dual map: exec [{:#x},{:#x}) writable {:#x}\n",
                 exec_base, exec_base + size, writable_base);
        Ok(DualMap { fd, exec_base, size, writable_base })
    }

    pub fn writable_base(&self) -> vaddr_t {
        self.writable_base
    }

    fn in_exec_view(&self, addr: vaddr_t) -> bool {
        addr >= self.exec_base && addr - self.exec_base < self.size
    }

    fn in_writable_view(&self, addr: vaddr_t) -> bool {
        addr >= self.writable_base && addr - self.writable_base < self.size
    }

    /* Identity outside the code region. */
    pub fn writable_addr(&self, exec_addr: vaddr_t) -> vaddr_t {
        if self.in_exec_view(exec_addr) {
            exec_addr - self.exec_base + self.writable_base
        } else {
            exec_addr
        }
    }

    pub fn executable_addr(&self, writable_addr: vaddr_t) -> vaddr_t {
        if self.in_writable_view(writable_addr) {
            writable_addr - self.writable_base + self.exec_base
        } else {
            writable_addr
        }
    }

    /* Open the shadow of [exec_addr, exec_addr+size) for writing. */
    pub fn commit_shadow(&self, exec_addr: vaddr_t, size: usize)
        -> Result<(), crate::types::os_err_t>
    {
        RT_DEBUG_ASSERT!(self.in_exec_view(exec_addr));
        os::os_protect(self.writable_addr(exec_addr), size,
                       MEMPROT_READ | MEMPROT_WRITE)
    }

    pub fn decommit_shadow(&self, exec_addr: vaddr_t, size: usize)
        -> Result<(), crate::types::os_err_t>
    {
        RT_DEBUG_ASSERT!(self.in_exec_view(exec_addr));
        os::os_protect(self.writable_addr(exec_addr), size, MEMPROT_NONE)
    }

    pub fn close(self) {
        let _ = os::os_unmap_file(self.writable_base, self.size);
        os::os_close(self.fd);
        /* The executable view is torn down with the region itself. */
    }
}

/* Fork support.  The parent snapshots the live mapping before the
 * fork; the child rebuilds an independent file from the snapshot so
 * it stops sharing pages with the parent. */

pub const MAX_PROT_RANGES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtRange {
    pub start: vaddr_t, /* executable-view address */
    pub end: vaddr_t,
    pub prot: u32,
}

pub struct ForkSnapshot {
    snap_base: vaddr_t,
    size: usize,
    num_ranges: usize,
    ranges: [ProtRange; MAX_PROT_RANGES],
}

const EMPTY_RANGE: ProtRange = ProtRange { start: 0, end: 0, prot: 0 };

/*
 * Parent, before fork: copy every committed sub-range into a fresh
 * anonymous reservation.  Must complete before any child work that
 * relies on it; no synchronization happens at the fork point itself.
 */
pub fn prefork_snapshot(dm: &DualMap, committed: &[ProtRange])
    -> Result<ForkSnapshot, ErrNO>
{
    RT_DEBUG_ASSERT!(committed.len() <= MAX_PROT_RANGES);
    let snap_base = os::os_reserve(0, dm.size).map_err(|_| ErrNO::WxorXFailure)?;
    let mut snap = ForkSnapshot {
        snap_base,
        size: dm.size,
        num_ranges: committed.len(),
        ranges: [EMPTY_RANGE; MAX_PROT_RANGES],
    };
    for (i, r) in committed.iter().enumerate() {
        snap.ranges[i] = *r;
        let offs = r.start - dm.exec_base;
        let len = r.end - r.start;
        if os::os_commit(snap_base + offs, len,
                         MEMPROT_READ | MEMPROT_WRITE).is_err() {
            let _ = os::os_release(snap_base, dm.size);
            return Err(ErrNO::WxorXFailure);
        }
        os::os_copy(snap_base + offs, dm.writable_addr(r.start), len);
    }
    Ok(snap)
}

/* Child, after fork: recreate both views at their original addresses
 * over a new memory file, then replay bytes and protections.  The
 * fixed mappings atomically replace the views inherited from the
 * parent, ending the page sharing. */
pub fn postfork_child_recreate(dm: &mut DualMap, snap: &ForkSnapshot)
    -> Result<(), ErrNO>
{
    let new_fd = os::os_create_memory_file(dm.size)
        .map_err(|_| ErrNO::WxorXFailure)?;
    if os::os_map_file(new_fd, 0, dm.exec_base, dm.size, MEMPROT_NONE,
                       true).is_err() ||
       os::os_map_file(new_fd, 0, dm.writable_base, dm.size, MEMPROT_NONE,
                       true).is_err() {
        os::os_close(new_fd);
        return Err(ErrNO::WxorXFailure);
    }
    os::os_close(dm.fd);
    dm.fd = new_fd;

    for r in &snap.ranges[..snap.num_ranges] {
        let offs = r.start - dm.exec_base;
        let len = r.end - r.start;
        dm.commit_shadow(r.start, len).map_err(|_| ErrNO::WxorXFailure)?;
        os::os_copy(dm.writable_addr(r.start), snap.snap_base + offs, len);
        os::os_protect(r.start, len, r.prot & !MEMPROT_WRITE)
            .map_err(|_| ErrNO::WxorXFailure)?;
    }
    release_snapshot(snap);
    Ok(())
}

/* Parent, after fork. */
pub fn postfork_parent_release(snap: &ForkSnapshot) {
    release_snapshot(snap);
}

fn release_snapshot(snap: &ForkSnapshot) {
    let _ = os::os_release(snap.snap_base, snap.size);
}
