/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * OS adapter: raw virtual memory straight from the kernel, bypassing
 * the host process allocator entirely.  All ranges are page-aligned
 * and carry explicit protection bits (defines::MEMPROT_*).
 *
 * Reserve/commit is expressed on POSIX as a PROT_NONE MAP_NORESERVE
 * mapping that is later mprotect'ed into accessibility.
 */

use core::ptr;
use libc::{c_void, off_t};
use crate::defines::{MEMPROT_EXEC, MEMPROT_READ, MEMPROT_WRITE, PAGE_SIZE};
use crate::types::{file_t, os_err_t, vaddr_t};
use crate::{IS_PAGE_ALIGNED, RT_DEBUG_ASSERT};

fn last_os_error() -> os_err_t {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

pub fn memprot_to_os(prot: u32) -> i32 {
    let mut os_prot = libc::PROT_NONE;
    if prot & MEMPROT_READ != 0 {
        os_prot |= libc::PROT_READ;
    }
    if prot & MEMPROT_WRITE != 0 {
        os_prot |= libc::PROT_WRITE;
    }
    if prot & MEMPROT_EXEC != 0 {
        os_prot |= libc::PROT_EXEC;
    }
    os_prot
}

/* Reserve without backing.  |preferred| is a hint; the kernel may pick
 * any address.  Returns the chosen base. */
pub fn os_reserve(preferred: vaddr_t, size: usize) -> Result<vaddr_t, os_err_t> {
    RT_DEBUG_ASSERT!(IS_PAGE_ALIGNED!(size));
    let p = unsafe {
        libc::mmap(preferred as *mut c_void, size, libc::PROT_NONE,
                   libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                   -1, 0)
    };
    if p == libc::MAP_FAILED {
        return Err(last_os_error());
    }
    Ok(p as vaddr_t)
}

/* Reserve exactly at |base|, failing rather than clobbering an
 * existing mapping. */
pub fn os_reserve_at(base: vaddr_t, size: usize) -> Result<vaddr_t, os_err_t> {
    RT_DEBUG_ASSERT!(base != 0 && IS_PAGE_ALIGNED!(base) && IS_PAGE_ALIGNED!(size));
    #[cfg(target_os = "linux")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE |
        libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let p = unsafe {
        libc::mmap(base as *mut c_void, size, libc::PROT_NONE, flags, -1, 0)
    };
    if p == libc::MAP_FAILED {
        return Err(last_os_error());
    }
    if p as vaddr_t != base {
        /* Kernel honored the hint only approximately. */
        unsafe { libc::munmap(p, size); }
        return Err(libc::EEXIST);
    }
    Ok(base)
}

/* Back the pages of an existing reservation. */
pub fn os_commit(addr: vaddr_t, size: usize, prot: u32) -> Result<(), os_err_t> {
    RT_DEBUG_ASSERT!(IS_PAGE_ALIGNED!(addr) && IS_PAGE_ALIGNED!(size));
    let res = unsafe {
        libc::mprotect(addr as *mut c_void, size, memprot_to_os(prot))
    };
    if res != 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/* Return the pages to the kernel but keep the range reserved. */
pub fn os_decommit(addr: vaddr_t, size: usize) -> Result<(), os_err_t> {
    RT_DEBUG_ASSERT!(IS_PAGE_ALIGNED!(addr) && IS_PAGE_ALIGNED!(size));
    unsafe {
        if libc::madvise(addr as *mut c_void, size, libc::MADV_DONTNEED) != 0 {
            return Err(last_os_error());
        }
        if libc::mprotect(addr as *mut c_void, size, libc::PROT_NONE) != 0 {
            return Err(last_os_error());
        }
    }
    Ok(())
}

pub fn os_release(addr: vaddr_t, size: usize) -> Result<(), os_err_t> {
    RT_DEBUG_ASSERT!(IS_PAGE_ALIGNED!(addr) && IS_PAGE_ALIGNED!(size));
    let res = unsafe { libc::munmap(addr as *mut c_void, size) };
    if res != 0 {
        return Err(last_os_error());
    }
    Ok(())
}

pub fn os_protect(addr: vaddr_t, size: usize, prot: u32) -> Result<(), os_err_t> {
    RT_DEBUG_ASSERT!(IS_PAGE_ALIGNED!(addr) && IS_PAGE_ALIGNED!(size));
    let res = unsafe {
        libc::mprotect(addr as *mut c_void, size, memprot_to_os(prot))
    };
    if res != 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/*
 * Anonymous memory file used as the backing store for the W^X dual
 * mapping.  Leaves no filesystem entry.  Only Linux has the primitive;
 * elsewhere the caller must declare W^X off.
 */
#[cfg(target_os = "linux")]
pub fn os_create_memory_file(size: usize) -> Result<file_t, os_err_t> {
    let name = b"rtheap-dual\0";
    let fd = unsafe {
        libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC)
    };
    if fd < 0 {
        return Err(last_os_error());
    }
    if unsafe { libc::ftruncate(fd, size as off_t) } != 0 {
        let err = last_os_error();
        unsafe { libc::close(fd); }
        return Err(err);
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
pub fn os_create_memory_file(_size: usize) -> Result<file_t, os_err_t> {
    Err(libc::ENOSYS)
}

/* Map |size| bytes of |fd| at offset |offs|.  When |fixed|, |addr| must
 * already be reserved by us and is replaced atomically. */
pub fn os_map_file(fd: file_t, offs: usize, addr: vaddr_t, size: usize,
                   prot: u32, fixed: bool) -> Result<vaddr_t, os_err_t> {
    RT_DEBUG_ASSERT!(IS_PAGE_ALIGNED!(size));
    let mut flags = libc::MAP_SHARED;
    if fixed {
        RT_DEBUG_ASSERT!(addr != 0 && IS_PAGE_ALIGNED!(addr));
        flags |= libc::MAP_FIXED;
    }
    let p = unsafe {
        libc::mmap(addr as *mut c_void, size, memprot_to_os(prot), flags,
                   fd, offs as off_t)
    };
    if p == libc::MAP_FAILED {
        return Err(last_os_error());
    }
    Ok(p as vaddr_t)
}

pub fn os_unmap_file(addr: vaddr_t, size: usize) -> Result<(), os_err_t> {
    os_release(addr, size)
}

pub fn os_close(fd: file_t) {
    unsafe { libc::close(fd); }
}

pub fn os_sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}

pub fn os_page_size() -> usize {
    PAGE_SIZE
}

/* Weak entropy is fine here: the offset only de-clusters placement
 * across processes, it is not a security boundary. */
pub fn os_random_seed() -> usize {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    let pid = unsafe { libc::getpid() } as usize;
    (ts.tv_nsec as usize).wrapping_mul(2862933555777941757)
        ^ pid.rotate_left(17)
        ^ &ts as *const _ as usize
}

pub fn os_current_thread_id() -> usize {
    unsafe { libc::pthread_self() as usize }
}

/* Fill a raw range; callers guarantee the range is committed writable. */
pub fn os_fill(addr: vaddr_t, value: u8, size: usize) {
    unsafe {
        ptr::write_bytes(addr as *mut u8, value, size);
    }
}

pub fn os_copy(dst: vaddr_t, src: vaddr_t, size: usize) {
    unsafe {
        ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
    }
}
