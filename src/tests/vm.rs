/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use crate::config::HeapOptions;
use crate::defines::*;
use crate::errors::ErrNO;
use crate::os;
use crate::tests::{fill_in, check_on, serial, test_options};
use crate::types::vaddr_t;
use crate::vmm::{self, VmRegion};
use crate::{heap_exit, heap_init, heap_mmap, heap_mmap_extend_commitment,
            heap_mmap_retract_commitment, heap_munmap,
            heap_reserve_for_external_mapping, heap_unreserve_for_external_mapping,
            stack_alloc, stack_free};

fn region_options() -> HeapOptions {
    HeapOptions {
        vmm_block_size: 64 * KB,
        vm_base_near_app: false,
        ..Default::default()
    }
}

/* Exhaustion: a 256 KB region holds four blocks, one eaten by its own
 * bitmap; the fourth request must report no-fit, and direct OS reserve
 * still works. */
#[test]
fn region_exhaustion_falls_back_to_os() {
    let opts = region_options();
    let mut region = VmRegion::empty("test-exhaust", false);
    region.init(256 * KB, &opts).unwrap();
    assert_eq!(region.num_blocks(), 4);
    assert_eq!(region.bitmap_blocks(), 1);
    assert_eq!(region.num_free_blocks(), 3);

    let mut blocks = Vec::new();
    for _ in 0..3 {
        blocks.push(region.reserve_blocks(64 * KB, None, VMM_HEAP).unwrap());
    }
    match region.reserve_blocks(64 * KB, None, VMM_HEAP) {
        Err(ErrNO::OutOfVirtual { .. }) => {}
        other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
    }

    /* The allocator's fallback path: straight to the OS. */
    let direct = os::os_reserve(0, 64 * KB).unwrap();
    assert!(!region.is_reserved(direct, 64 * KB));
    os::os_release(direct, 64 * KB).unwrap();

    for p in blocks {
        region.free_blocks(p, 64 * KB, VMM_HEAP);
    }
    assert_eq!(region.num_free_blocks(), 3);
    region.exit();
}

#[test]
fn region_commit_and_use() {
    let opts = region_options();
    let mut region = VmRegion::empty("test-commit", false);
    region.init(MB, &opts).unwrap();

    let p = region.reserve_blocks(128 * KB, None, VMM_HEAP).unwrap();
    assert!(region.is_reserved(p, 128 * KB));
    region.commit(p, 8 * KB, MEMPROT_READ | MEMPROT_WRITE, VMM_HEAP).unwrap();
    fill_in(p as *mut u8, 8 * KB);
    check_on(p as *const u8, 8 * KB);
    region.decommit(p, 8 * KB).unwrap();
    region.free_blocks(p, 128 * KB, VMM_HEAP);
    region.exit();
}

/* Reserve-for-external-mapping round trip leaves the bitmap bit-equal
 * to its pre-state. */
#[test]
fn external_mapping_round_trip() {
    let opts = region_options();
    let mut region = VmRegion::empty("test-extern", false);
    region.init(MB, &opts).unwrap();
    let free_before = region.num_free_blocks();

    let p = region.reserve_blocks(192 * KB, None, VMM_STACK).unwrap();
    assert_eq!(region.num_free_blocks(), free_before - 3);
    region.free_blocks(p, 192 * KB, VMM_STACK);
    assert_eq!(region.num_free_blocks(), free_before);

    /* Same blocks again via an exact-placement request. */
    let q = region.reserve_blocks(192 * KB, Some(p), VMM_STACK).unwrap();
    assert_eq!(q, p);
    region.free_blocks(q, 192 * KB, VMM_STACK);
    assert_eq!(region.num_free_blocks(), free_before);
    region.exit();
}

#[test]
fn mmap_surface() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    let p = heap_mmap(256 * KB, 64 * KB, MEMPROT_READ | MEMPROT_WRITE,
                      VMM_CACHE);
    assert!(!p.is_null());
    assert!(vmm::vmm_is_reserved_address(p as vaddr_t, 256 * KB));
    fill_in(p, 64 * KB);
    check_on(p, 64 * KB);

    /* Extend, touch the new range, retract it again. */
    heap_mmap_extend_commitment(unsafe { p.add(64 * KB) }, 64 * KB,
                                MEMPROT_READ | MEMPROT_WRITE, VMM_CACHE);
    fill_in(unsafe { p.add(64 * KB) }, 64 * KB);
    heap_mmap_retract_commitment(unsafe { p.add(64 * KB) }, 64 * KB,
                                 VMM_CACHE);
    check_on(p, 64 * KB);

    heap_munmap(p, 256 * KB, VMM_CACHE);
    heap_exit();
}

#[test]
fn external_mapping_public_surface() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    let (_, free_before, _, _) = vmm::vmm_region_stats(VMM_STACK);
    let p = heap_reserve_for_external_mapping(core::ptr::null_mut(),
                                              128 * KB, VMM_STACK);
    assert!(!p.is_null());
    let (_, free_mid, _, _) = vmm::vmm_region_stats(VMM_STACK);
    assert_eq!(free_mid, free_before - 2);
    heap_unreserve_for_external_mapping(p, 128 * KB, VMM_STACK);
    let (_, free_after, _, _) = vmm::vmm_region_stats(VMM_STACK);
    assert_eq!(free_after, free_before);

    heap_exit();
}

#[test]
fn stack_alloc_returns_top() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    let top = stack_alloc(32 * KB, None);
    assert!(!top.is_null());
    assert!(top as vaddr_t % PAGE_SIZE == 0);
    /* The usable range sits below the returned top. */
    let base = unsafe { top.sub(32 * KB) };
    fill_in(base, 32 * KB);
    check_on(base, 32 * KB);
    stack_free(top, 32 * KB);

    heap_exit();
}
