/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * rtheap: reentrancy-safe virtual-memory and heap manager for an
 * in-process instrumentation runtime.  Runs beside the application's
 * own allocator (which may be mid-malloc when we are entered), so all
 * memory comes straight from the OS: large reservations carved into
 * blocks under a bitmap, size-segregated heap units on top, an
 * optional W^X dual mapping for code, and a reachability policy that
 * keeps the code region within rel32 of everything that must reach it.
 */

mod align;

pub mod base;
pub mod config;
pub mod debug;
pub mod defines;
pub mod dualmap;
pub mod errors;
pub mod heap;
pub mod hooks;
pub mod locking;
pub mod os;
pub mod reachability;
pub mod special;
pub mod types;
pub mod vmm;

#[cfg(test)]
mod tests;

pub use config::HeapOptions;
pub use errors::{ErrNO, OomPhase};
pub use hooks::{HeapHooks, ResetScope};

pub use heap::{
    global_heap_alloc, global_heap_free, global_heap_realloc, heap_alloc,
    heap_consistency_check, heap_dump_stats, heap_exit, heap_free, heap_init,
    heap_mmap, heap_mmap_extend_commitment, heap_mmap_retract_commitment,
    heap_munmap, heap_postfork_child, heap_postfork_parent, heap_prefork,
    heap_reachable_alloc, heap_reachable_free,
    heap_reserve_for_external_mapping, heap_thread_exit, heap_thread_init,
    heap_unreserve_for_external_mapping, nonpersistent_heap_alloc,
    nonpersistent_heap_free, stack_alloc, stack_free,
};
pub use reachability::{rel32_reachable_from_vmcode,
                       request_region_be_heap_reachable};
pub use special::{
    get_special_heap_header_size, special_heap_alloc, special_heap_calloc,
    special_heap_can_calloc, special_heap_cfree, special_heap_exit,
    special_heap_free, special_heap_init, special_heap_iterator_hasnext,
    special_heap_iterator_next, special_heap_iterator_start,
    special_heap_iterator_stop, special_heap_set_unit_end, IntervalTable,
    SpecialHeapIter, SpecialUnits,
};
pub use vmm::{vmm_executable_addr, vmm_writable_addr, vmm_wx_enabled};
