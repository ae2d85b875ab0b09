/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use crate::base::bitmap::{bitmap_storage_size, BlockBitmap, BITMAP_NOT_FOUND};
use crate::types::vaddr_t;

fn make(num_blocks: u32) -> (BlockBitmap, Vec<usize>) {
    let words = bitmap_storage_size(num_blocks) / core::mem::size_of::<usize>();
    let mut storage = vec![0usize; words.max(1)];
    let mut bm = BlockBitmap::empty();
    bm.storage_init(storage.as_mut_ptr() as vaddr_t, num_blocks);
    (bm, storage)
}

#[test]
fn first_fit_from_zero() {
    let (mut bm, _storage) = make(64);
    assert_eq!(bm.allocate_blocks(4, None), 0);
    assert_eq!(bm.allocate_blocks(1, None), 4);
    assert_eq!(bm.allocate_blocks(8, None), 5);
    assert!(bm.are_reserved_blocks(0, 13));
    assert!(bm.are_free_blocks(13, 51));
    assert!(bm.consistency_check(51));
}

#[test]
fn exact_start_requests() {
    let (mut bm, _storage) = make(32);
    assert_eq!(bm.allocate_blocks(2, Some(10)), 10);
    /* Overlapping exact request must fail without side effects. */
    assert_eq!(bm.allocate_blocks(2, Some(11)), BITMAP_NOT_FOUND);
    assert_eq!(bm.allocate_blocks(2, Some(30)), 30);
    assert_eq!(bm.allocate_blocks(3, Some(30)), BITMAP_NOT_FOUND);
    assert!(bm.consistency_check(32 - 4));
}

#[test]
fn free_reopens_runs() {
    let (mut bm, _storage) = make(16);
    assert_eq!(bm.allocate_blocks(16, None), 0);
    assert_eq!(bm.allocate_blocks(1, None), BITMAP_NOT_FOUND);
    bm.free_blocks(4, 4);
    assert!(bm.consistency_check(4));
    /* First fit lands in the hole just vacated. */
    assert_eq!(bm.allocate_blocks(3, None), 4);
    assert_eq!(bm.allocate_blocks(2, None), BITMAP_NOT_FOUND);
    assert_eq!(bm.allocate_blocks(1, None), 7);
    assert!(bm.consistency_check(0));
}

#[test]
fn run_across_word_boundary() {
    let (mut bm, _storage) = make(200);
    assert_eq!(bm.allocate_blocks(60, None), 0);
    /* Spans the 64-bit word boundary. */
    assert_eq!(bm.allocate_blocks(10, None), 60);
    bm.free_blocks(0, 60);
    assert_eq!(bm.allocate_blocks(70, None), 70);
    assert!(bm.consistency_check(200 - 80));
}

#[test]
fn no_fit_when_fragmented() {
    let (mut bm, _storage) = make(12);
    assert_eq!(bm.allocate_blocks(12, None), 0);
    /* Free every other block: six single-block holes. */
    for i in [1u32, 3, 5, 7, 9, 11] {
        bm.free_blocks(i, 1);
    }
    assert_eq!(bm.allocate_blocks(2, None), BITMAP_NOT_FOUND);
    assert_eq!(bm.allocate_blocks(1, None), 1);
    assert!(bm.consistency_check(5));
}
