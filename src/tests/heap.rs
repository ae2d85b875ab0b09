/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use crate::defines::*;
use crate::heap::units::{maxroom, vmm_units_reserved_bytes};
use crate::tests::{check_on, fill_in, serial, test_options};
use crate::types::vaddr_t;
use crate::{global_heap_alloc, global_heap_free, global_heap_realloc,
            heap_alloc, heap_consistency_check, heap_exit, heap_free,
            heap_init, heap_thread_exit, heap_thread_init,
            nonpersistent_heap_alloc, nonpersistent_heap_free, vmm, ROUNDUP};

fn used_heap_blocks() -> usize {
    let mut bytes = 0;
    for which in [VMM_HEAP, VMM_HEAP | VMM_REACHABLE] {
        let (total, free, bitmap, block) = vmm::vmm_region_stats(which);
        bytes += (total - free - bitmap) as usize * block;
    }
    bytes
}

#[test]
fn alloc_free_reuse() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    /* Freed space comes back for the next same-class request. */
    let a1 = global_heap_alloc(24, VMM_HEAP);
    let a2 = global_heap_alloc(24, VMM_HEAP);
    assert!(a1 as vaddr_t % HEAP_ALIGNMENT == 0);
    assert!(a2 as vaddr_t % HEAP_ALIGNMENT == 0);
    assert!(a1 != a2);
    fill_in(a1, 24);
    fill_in(a2, 24);
    global_heap_free(a1, 24, VMM_HEAP);
    let a3 = global_heap_alloc(24, VMM_HEAP);
    assert!(a3 as vaddr_t % HEAP_ALIGNMENT == 0);
    assert!(a3 == a1);
    assert!(a3 != a2);
    check_on(a2, 24);
    global_heap_free(a2, 24, VMM_HEAP);
    global_heap_free(a3, 24, VMM_HEAP);

    heap_consistency_check();
    heap_exit();
}

#[test]
fn size_class_boundaries() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    /* 500 rides the 512 class: freeing it satisfies a 512 request. */
    let p500 = global_heap_alloc(500, VMM_HEAP);
    fill_in(p500, 500);
    global_heap_free(p500, 500, VMM_HEAP);
    let p512 = global_heap_alloc(512, VMM_HEAP);
    assert!(p512 == p500);
    global_heap_free(p512, 512, VMM_HEAP);

    /* 513 goes variable: one word in front holds the rounded size. */
    let p513 = global_heap_alloc(513, VMM_HEAP);
    let stored = unsafe {
        *((p513 as vaddr_t - HEADER_SIZE) as *const usize)
    };
    assert_eq!(stored, ROUNDUP!(513, HEAP_ALIGNMENT));
    assert_eq!(stored, 520);
    fill_in(p513, 513);
    check_on(p513, 513);
    global_heap_free(p513, 513, VMM_HEAP);

    /* A 520 request fits the same freed block exactly. */
    let p520 = global_heap_alloc(520, VMM_HEAP);
    assert!(p520 == p513);
    global_heap_free(p520, 520, VMM_HEAP);

    heap_consistency_check();
    heap_exit();
}

#[test]
fn oversize_unit_and_dead_list() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    let sz = maxroom() + MB;
    let before = used_heap_blocks();

    let p = global_heap_alloc(sz, VMM_HEAP);
    fill_in(p, 4096);
    check_on(p, 4096);
    /* The request got its own reservation of at least its size. */
    let during = used_heap_blocks();
    assert!(during >= before + sz);

    /* Retiring the unit parks it on the dead list: the reservation
     * count must not move, and the next same-size request must be
     * satisfied without growing it either. */
    global_heap_free(p, sz, VMM_HEAP);
    assert_eq!(used_heap_blocks(), during);
    let p2 = global_heap_alloc(sz, VMM_HEAP);
    assert_eq!(used_heap_blocks(), during);
    global_heap_free(p2, sz, VMM_HEAP);

    heap_consistency_check();
    heap_exit();
}

#[test]
fn realloc_preserves_contents() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    let p = global_heap_alloc(16 * 8, VMM_HEAP);
    fill_in(p, 16 * 8);
    let q = global_heap_realloc(p, 16, 48, 8, VMM_HEAP);
    check_on(q, 16 * 8);
    let r = global_heap_realloc(q, 48, 4, 8, VMM_HEAP);
    check_on(r, 4 * 8);
    global_heap_free(r, 4 * 8, VMM_HEAP);

    heap_exit();
}

#[test]
fn nonpersistent_and_thread_heaps() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    let np = nonpersistent_heap_alloc(96, VMM_HEAP);
    fill_in(np, 96);

    let tu = heap_thread_init();
    unsafe {
        let mut ptrs = [core::ptr::null_mut(); 16];
        for (i, slot) in ptrs.iter_mut().enumerate() {
            *slot = heap_alloc(tu, 16 + i, VMM_HEAP);
            fill_in(*slot, 16 + i);
        }
        for (i, &p) in ptrs.iter().enumerate() {
            check_on(p, 16 + i);
            heap_free(tu, p, 16 + i, VMM_HEAP);
        }
        heap_thread_exit(tu);
    }

    check_on(np, 96);
    nonpersistent_heap_free(np, 96, VMM_HEAP);
    heap_exit();
}

/* Reservation conservation: every block the regions hand out is
 * accounted to some live or dead unit. */
#[test]
fn reservation_accounting() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    assert_eq!(used_heap_blocks(), vmm_units_reserved_bytes());

    let mut ptrs = Vec::new();
    for i in 0..512 {
        ptrs.push((global_heap_alloc(8 + (i % 600), VMM_HEAP), 8 + (i % 600)));
    }
    assert_eq!(used_heap_blocks(), vmm_units_reserved_bytes());
    for (p, sz) in ptrs {
        global_heap_free(p, sz, VMM_HEAP);
    }
    assert_eq!(used_heap_blocks(), vmm_units_reserved_bytes());

    heap_consistency_check();
    heap_exit();
    assert_eq!(vmm_units_reserved_bytes(), 0);
}

/* Growth path: force the global heap through several fresh units. */
#[test]
fn unit_growth_under_pressure() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    let mut ptrs = Vec::new();
    /* ~1.5 MB of live 512-class blocks, far beyond the initial unit. */
    for _ in 0..3000 {
        let p = global_heap_alloc(512, VMM_HEAP);
        fill_in(p, 512);
        ptrs.push(p);
    }
    for &p in &ptrs {
        check_on(p, 512);
    }
    for p in ptrs {
        global_heap_free(p, 512, VMM_HEAP);
    }

    heap_consistency_check();
    heap_exit();
}
