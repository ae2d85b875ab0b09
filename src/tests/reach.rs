/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use crate::defines::{MAX_REL32_OFFSET, MB};
use crate::errors::ErrNO;
use crate::reachability::{allowable_region, reachability_init,
                          rel32_reachable_from_vmcode,
                          request_region_be_heap_reachable};
use crate::tests::{serial, test_options};
use crate::types::vaddr_t;
use crate::{heap_exit, heap_init};

#[test]
fn allowed_window_derivation() {
    let _guard = serial();
    reachability_init(false);
    /* Nothing requested yet: everything is allowed. */
    assert_eq!(allowable_region(), (0, vaddr_t::MAX));
    assert!(rel32_reachable_from_vmcode(0));
    assert!(rel32_reachable_from_vmcode(vaddr_t::MAX));

    let base: vaddr_t = 0x7000_0000_0000;
    request_region_be_heap_reachable(base, MB).unwrap();
    let (lo, hi) = allowable_region();
    assert_eq!(lo, base + MB - 1 - MAX_REL32_OFFSET);
    assert_eq!(hi, base + MAX_REL32_OFFSET);
    assert!(rel32_reachable_from_vmcode(base));
    assert!(!rel32_reachable_from_vmcode(base + MAX_REL32_OFFSET + 1));
    assert!(!rel32_reachable_from_vmcode(lo - 1));
    reachability_init(false);
}

#[test]
fn window_narrows_monotonically() {
    let _guard = serial();
    reachability_init(false);
    let base: vaddr_t = 0x7000_0000_0000;
    request_region_be_heap_reachable(base, MB).unwrap();
    let first = allowable_region();
    /* A second region a gigabyte up narrows the window... */
    request_region_be_heap_reachable(base + 1024 * MB, MB).unwrap();
    let second = allowable_region();
    assert!(second.0 >= first.0);
    assert!(second.1 <= first.1);
    /* ...and a subset request changes nothing. */
    request_region_be_heap_reachable(base + 16 * MB, MB).unwrap();
    assert_eq!(allowable_region(), second);
    reachability_init(false);
}

#[test]
fn lower_4gb_clamp() {
    let _guard = serial();
    reachability_init(true);
    let (_, hi) = allowable_region();
    assert_eq!(hi, u32::MAX as vaddr_t);
    reachability_init(false);
}

#[test]
fn span_wider_than_rel32_is_rejected() {
    let _guard = serial();
    reachability_init(false);
    request_region_be_heap_reachable(0x1000_0000_0000, MB).unwrap();
    let r = request_region_be_heap_reachable(
        0x1000_0000_0000 + 4 * (MAX_REL32_OFFSET as usize), MB);
    assert_eq!(r, Err(ErrNO::ReachabilityUnsatisfiable));
    reachability_init(false);
}

/* The refuse-shrink scenario: a must-reach request far below the
 * placed code region cannot be reconciled and must fail loudly. */
#[test]
fn refuses_conflict_with_placed_vmcode() {
    let _guard = serial();
    let opts = test_options();
    heap_init(&opts, None).unwrap();

    let (code_start, _) = vmm_code_bounds();
    assert!(rel32_reachable_from_vmcode(code_start));
    let far_below = code_start - 5 * (MAX_REL32_OFFSET as usize);
    let r = request_region_be_heap_reachable(far_below, 4096);
    assert_eq!(r, Err(ErrNO::ReachabilityUnsatisfiable));
    /* The failed request must not have poisoned the window. */
    assert!(rel32_reachable_from_vmcode(code_start));

    heap_exit();
}

fn vmm_code_bounds() -> (vaddr_t, vaddr_t) {
    /* Probe via the reachable allocator: anything it returns sits in
     * the code region. */
    let p = crate::heap_reachable_alloc(64, crate::defines::VMM_HEAP);
    let base = p as vaddr_t;
    crate::heap_reachable_free(p, 64, crate::defines::VMM_HEAP);
    (base, base)
}
