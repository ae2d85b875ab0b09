/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

#![allow(dead_code)]

use crate::types::which_vmm_t;

pub const BYTE_BITS: usize = 8;
pub const BYTES_PER_USIZE: usize = (usize::BITS / u8::BITS) as usize;

pub const PAGE_SHIFT    : usize = 12;
pub const PAGE_SIZE     : usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK     : usize = !(PAGE_SIZE - 1);

/* Const units */
pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

/* All heap payloads are aligned to this.  One machine word on 64-bit. */
pub const HEAP_ALIGNMENT: usize = 8;

/* Variable-size allocations carry one word in front of the payload
 * holding the payload size. */
pub const HEADER_SIZE: usize = BYTES_PER_USIZE;

/*
 * Fixed size classes.  Each class allocates exactly its size; requests
 * above the last fixed class go to the variable class, which prepends
 * HEADER_SIZE.  The sequence must stay monotonically increasing and
 * HEAP_ALIGNMENT-aligned.
 */
pub const BLOCK_SIZES: [usize; 8] = [8, 24, 40, 72, 96, 128, 256, 512];
pub const BLOCK_TYPES: usize = BLOCK_SIZES.len() + 1;
pub const VARIABLE_CLASS: usize = BLOCK_TYPES - 1;

/* Guard against integer overflow in size rounding. */
pub const MAX_ALLOC_SIZE: usize = usize::MAX / 4;

/* Debug poisoning.  Newly committed memory is UNALLOCATED; a live
 * payload is ALLOCATED; the round-up tail of a fixed class is PAD. */
pub const HEAP_UNALLOCATED_BYTE : u8 = 0xcd;
pub const HEAP_ALLOCATED_BYTE   : u8 = 0xab;
pub const HEAP_PAD_BYTE         : u8 = 0xbc;

/* Memory protection bits, kept OS-independent above the adapter. */
pub const MEMPROT_NONE  : u32 = 0;
pub const MEMPROT_READ  : u32 = 1 << 0;
pub const MEMPROT_WRITE : u32 = 1 << 1;
pub const MEMPROT_EXEC  : u32 = 1 << 2;

/*
 * Category flags for an allocation ("which"): orthogonal bits recording
 * reachability, sharing and the consuming subsystem.  The region router
 * and the statistics keyed off these.
 */
pub const VMM_HEAP          : which_vmm_t = 0x01;
pub const VMM_CACHE         : which_vmm_t = 0x02;
pub const VMM_STACK         : which_vmm_t = 0x04;
pub const VMM_SPECIAL_HEAP  : which_vmm_t = 0x08;
pub const VMM_REACHABLE     : which_vmm_t = 0x10;
pub const VMM_PER_THREAD    : which_vmm_t = 0x20;

/* Closed-interval endpoint arithmetic for 32-bit relative reach. */
pub const MAX_REL32_OFFSET: usize = (1 << 31) - 1;
