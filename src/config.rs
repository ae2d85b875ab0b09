/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use spin::RwLock;
use crate::defines::{KB, MB, PAGE_SIZE};
use crate::types::vaddr_t;

/*
 * Static options consumed once at heap_init().  The record is copied
 * into a process-wide slot; later mutation of the caller's copy has
 * no effect.
 */
#[derive(Debug, Clone, Copy)]
pub struct HeapOptions {
    /* If false, every allocation falls through to the OS directly
     * and no VM regions are reserved. */
    pub vm_reserve: bool,

    /* Size of the code region reservation. */
    pub vm_size: usize,

    /* Size of the data region reservation (ignored under reachable_heap). */
    pub vmheap_size: usize,

    /* Bitmap granularity; all reservations are rounded to this. */
    pub vmm_block_size: usize,

    /* Preferred code-region base (0 = let the OS choose) and the
     * randomization window applied on top of it. */
    pub vm_base: vaddr_t,
    pub vm_max_offset: usize,

    /* Prefer placement within 32-bit reach of our own image. */
    pub vm_base_near_app: bool,

    /* Accept an OS-chosen base if the preferred one fails. */
    pub vm_allow_not_at_base: bool,

    /* Accept a geometrically reduced size if the requested one fails. */
    pub vm_allow_smaller: bool,

    /* Restrict the code region to below 2^32. */
    pub heap_in_lower_4gb: bool,

    /* Route all heap through the code region (one region total). */
    pub reachable_heap: bool,

    /* Heap-unit sizing. */
    pub initial_heap_unit_size: usize,
    pub max_heap_unit_size: usize,
    pub initial_global_heap_unit_size: usize,
    pub initial_heap_nonpers_size: usize,

    /* Granularity of lazy commit inside a unit. */
    pub heap_commit_increment: usize,

    /* Inaccessible page on either side of units / stacks. */
    pub guard_pages: bool,
    pub per_thread_guard_pages: bool,
    pub stack_guard_pages: bool,

    /* Dual-map every code page so no address is ever writable and
     * executable at once. */
    pub satisfy_w_xor_x: bool,

    /* Retry window on commit failure, in milliseconds. */
    pub oom_timeout_ms: u64,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            vm_reserve: true,
            vm_size: 128 * MB,
            vmheap_size: 128 * MB,
            vmm_block_size: 64 * KB,
            vm_base: 0,
            vm_max_offset: 16 * MB,
            vm_base_near_app: true,
            vm_allow_not_at_base: true,
            vm_allow_smaller: true,
            heap_in_lower_4gb: false,
            reachable_heap: false,
            initial_heap_unit_size: 32 * KB,
            max_heap_unit_size: 256 * KB,
            initial_global_heap_unit_size: 64 * KB,
            initial_heap_nonpers_size: 32 * KB,
            heap_commit_increment: PAGE_SIZE,
            guard_pages: false,
            per_thread_guard_pages: false,
            stack_guard_pages: true,
            satisfy_w_xor_x: false,
            oom_timeout_ms: 0,
        }
    }
}

static OPTIONS: RwLock<Option<HeapOptions>> = RwLock::new(None);

pub(crate) fn set_options(opts: &HeapOptions) {
    *OPTIONS.write() = Some(*opts);
}

pub fn options() -> HeapOptions {
    OPTIONS.read().unwrap_or_default()
}
