/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

#![cfg(target_os = "linux")]

use crate::config::HeapOptions;
use crate::defines::*;
use crate::tests::{serial, test_options};
use crate::types::vaddr_t;
use crate::{heap_exit, heap_init, heap_mmap, heap_munmap,
            vmm_executable_addr, vmm_writable_addr, vmm_wx_enabled};

fn wx_options() -> HeapOptions {
    HeapOptions {
        satisfy_w_xor_x: true,
        ..test_options()
    }
}

#[test]
fn dual_views_translate_and_share_bytes() {
    let _guard = serial();
    heap_init(&wx_options(), None).unwrap();
    assert!(vmm_wx_enabled());

    let x = heap_mmap(64 * KB, 64 * KB, MEMPROT_READ | MEMPROT_EXEC,
                      VMM_CACHE) as vaddr_t;
    let w = vmm_writable_addr(x);
    assert!(w != x);
    /* Translation is a bijection over the code region. */
    assert_eq!(vmm_executable_addr(w), x);
    assert_eq!(vmm_writable_addr(x + 100), w + 100);
    /* Addresses outside the region pass through unchanged. */
    let local = 0u8;
    let outside = &local as *const u8 as vaddr_t;
    assert_eq!(vmm_writable_addr(outside), outside);
    assert_eq!(vmm_executable_addr(outside), outside);

    /* Bytes written through the shadow appear at the executable
     * view. */
    unsafe {
        for i in 0..256usize {
            *((w + i) as *mut u8) = (i ^ 0x5a) as u8;
        }
        for i in 0..256usize {
            assert_eq!(*((x + i) as *const u8), (i ^ 0x5a) as u8);
        }
    }

    heap_munmap(x as *mut u8, 64 * KB, VMM_CACHE);
    heap_exit();
}

#[test]
#[cfg(target_arch = "x86_64")]
fn patched_code_executes() {
    let _guard = serial();
    heap_init(&wx_options(), None).unwrap();
    assert!(vmm_wx_enabled());

    let x = heap_mmap(64 * KB, 64 * KB, MEMPROT_READ | MEMPROT_EXEC,
                      VMM_CACHE) as vaddr_t;
    let w = vmm_writable_addr(x);

    /* mov eax, 42; ret */
    let stub: [u8; 6] = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
    unsafe {
        core::ptr::copy_nonoverlapping(stub.as_ptr(), w as *mut u8,
                                       stub.len());
        let f: extern "C" fn() -> i32 = core::mem::transmute(x);
        assert_eq!(f(), 42);

        /* Patch through the shadow: mov eax, 7; ret */
        *((w + 1) as *mut u8) = 0x07;
        assert_eq!(f(), 7);
    }

    heap_munmap(x as *mut u8, 64 * KB, VMM_CACHE);
    heap_exit();
}

#[test]
fn commit_decommit_commit_round_trip() {
    let _guard = serial();
    heap_init(&wx_options(), None).unwrap();

    let x = heap_mmap(128 * KB, 64 * KB, MEMPROT_READ | MEMPROT_EXEC,
                      VMM_CACHE) as vaddr_t;
    let w = vmm_writable_addr(x);
    unsafe {
        *(w as *mut u8) = 0xfe;
    }
    crate::heap_mmap_retract_commitment(x as *mut u8, 64 * KB, VMM_CACHE);
    crate::heap_mmap_extend_commitment(x as *mut u8, 64 * KB,
                                       MEMPROT_READ | MEMPROT_EXEC, VMM_CACHE);
    unsafe {
        /* Fresh commitment is accessible again at both views. */
        *(w as *mut u8) = 0x90;
        assert_eq!(*(x as *const u8), 0x90);
    }

    heap_munmap(x as *mut u8, 128 * KB, VMM_CACHE);
    heap_exit();
}
