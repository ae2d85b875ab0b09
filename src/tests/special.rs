/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use std::sync::Mutex;
use crate::tests::{check_on, fill_in, serial, test_options};
use crate::types::vaddr_t;
use crate::{heap_exit, heap_init, special_heap_alloc, special_heap_calloc,
            special_heap_can_calloc, special_heap_cfree, special_heap_exit,
            special_heap_free, special_heap_init,
            special_heap_iterator_hasnext, special_heap_iterator_next,
            special_heap_iterator_start, special_heap_iterator_stop,
            special_heap_set_unit_end, IntervalTable};

const BLOCK: usize = 64;

#[test]
fn single_blocks_recycle() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();
    let sh = special_heap_init(BLOCK, 0, true, false, true, None, None);

    let a = special_heap_alloc(sh);
    let b = special_heap_alloc(sh);
    assert!(a != b);
    fill_in(a, BLOCK);
    fill_in(b, BLOCK);
    special_heap_free(sh, a);
    /* LIFO reuse of the single-block free list. */
    let c = special_heap_alloc(sh);
    assert!(c == a);
    check_on(b, BLOCK);
    special_heap_free(sh, b);
    special_heap_free(sh, c);

    special_heap_exit(sh);
    heap_exit();
}

#[test]
fn calloc_prefers_cfree_runs() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();
    let sh = special_heap_init(BLOCK, 0, true, false, true, None, None);

    /* Park a run of 6 on the cfree list. */
    let run = special_heap_calloc(sh, 6);
    fill_in(run, 6 * BLOCK);
    special_heap_cfree(sh, run, 6);

    /* Exact match consumes the whole run. */
    assert!(special_heap_can_calloc(sh, 6));
    let exact = special_heap_calloc(sh, 6);
    assert!(exact == run);
    special_heap_cfree(sh, exact, 6);

    /* n+1: five blocks come back, the sixth lands on the free list. */
    let five = special_heap_calloc(sh, 5);
    assert!(five == run);
    let spare = special_heap_alloc(sh);
    assert_eq!(spare as vaddr_t, run as vaddr_t + 5 * BLOCK);
    special_heap_free(sh, spare);
    special_heap_cfree(sh, five, 5);

    /* Longer run: two blocks are trimmed from the tail. */
    let two = special_heap_calloc(sh, 2);
    assert_eq!(two as vaddr_t, run as vaddr_t + 3 * BLOCK);
    let three = special_heap_calloc(sh, 3);
    assert!(three == run);
    special_heap_cfree(sh, two, 2);
    special_heap_cfree(sh, three, 3);

    special_heap_exit(sh);
    heap_exit();
}

#[test]
fn iterator_visits_units() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();
    let sh = special_heap_init(BLOCK, 0, true, false, true, None, None);

    let p = special_heap_alloc(sh) as vaddr_t;
    let mut seen = false;
    let mut shi = special_heap_iterator_start(sh);
    while special_heap_iterator_hasnext(&shi) {
        let (start, end) = special_heap_iterator_next(&mut shi);
        assert!(start <= end);
        if p >= start && p < end {
            seen = true;
            /* Freeing mid-iteration is part of the contract. */
            special_heap_free(sh, p as *mut u8);
        }
    }
    special_heap_iterator_stop(shi);
    assert!(seen);

    special_heap_exit(sh);
    heap_exit();
}

#[test]
fn preallocated_range_and_unit_end() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();

    /* Hand the heap a word-aligned buffer standing in for a caller
     * mapping. */
    let mut backing = vec![0u64; 16 * BLOCK / 8];
    let base = backing.as_mut_ptr() as vaddr_t;
    let sh = special_heap_init(BLOCK, 0, false, false, true, None,
                               Some((base, 16 * BLOCK)));

    /* Carve only the front half. */
    special_heap_set_unit_end(sh, base + 8 * BLOCK);
    let mut got = 0;
    while special_heap_can_calloc(sh, 1) {
        let p = special_heap_alloc(sh) as vaddr_t;
        assert!(p >= base && p < base + 8 * BLOCK);
        got += 1;
    }
    assert_eq!(got, 8);

    special_heap_exit(sh);
    heap_exit();
}

struct RangeTable {
    ranges: Mutex<Vec<(vaddr_t, vaddr_t)>>,
}

impl IntervalTable for RangeTable {
    fn add_range(&self, start: vaddr_t, end: vaddr_t) {
        self.ranges.lock().unwrap().push((start, end));
    }

    fn remove_range(&self, start: vaddr_t, end: vaddr_t) {
        let mut ranges = self.ranges.lock().unwrap();
        let before = ranges.len();
        ranges.retain(|&r| r != (start, end));
        assert_eq!(ranges.len() + 1, before);
    }
}

static RANGE_TABLE: RangeTable = RangeTable {
    ranges: Mutex::new(Vec::new()),
};

fn registered_ranges() -> Vec<(vaddr_t, vaddr_t)> {
    RANGE_TABLE.ranges.lock().unwrap().clone()
}

/* Every unit's extent is handed to the caller's interval table on
 * creation and withdrawn when the heap goes away, so point lookup on
 * any live block address succeeds. */
#[test]
fn interval_table_tracks_units() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();
    RANGE_TABLE.ranges.lock().unwrap().clear();

    let sh = special_heap_init(BLOCK, 0, true, false, true,
                               Some(&RANGE_TABLE), None);
    /* The first unit registers at init. */
    assert_eq!(registered_ranges().len(), 1);
    let (lo, hi) = registered_ranges()[0];
    assert!(lo < hi);

    let p = special_heap_alloc(sh);
    fill_in(p, BLOCK);
    check_on(p, BLOCK);
    let lookup = |q: vaddr_t| registered_ranges().iter()
        .any(|&(s, e)| q >= s && q < e);
    assert!(lookup(p as vaddr_t));
    assert!(!lookup(hi));

    /* Exhaust the first unit so a second one registers too. */
    let mut spill = core::ptr::null_mut();
    while registered_ranges().len() < 2 {
        spill = special_heap_alloc(sh);
    }
    assert!(lookup(spill as vaddr_t));
    assert_eq!(registered_ranges().len(), 2);

    /* Teardown withdraws every registered unit. */
    special_heap_exit(sh);
    assert!(registered_ranges().is_empty());
    heap_exit();
}

#[test]
fn lockless_mode_single_thread() {
    let _guard = serial();
    heap_init(&test_options(), None).unwrap();
    let sh = special_heap_init(BLOCK, 128, false, false, false, None, None);

    let p = special_heap_alloc(sh);
    assert!(p as vaddr_t % 128 == 0);
    special_heap_free(sh, p);

    special_heap_exit(sh);
    heap_exit();
}
