/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

mod bitmap;
mod heap;
mod reach;
mod special;
mod vm;
mod wx;

use std::sync::{Mutex, MutexGuard};
use crate::config::HeapOptions;
use crate::defines::{KB, MB};

/* The allocator is a process-wide singleton; tests that go through the
 * public surface serialize on this. */
static SERIAL: Mutex<()> = Mutex::new(());

pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn test_options() -> HeapOptions {
    HeapOptions {
        vm_size: 8 * MB,
        vmheap_size: 8 * MB,
        vmm_block_size: 64 * KB,
        vm_base: 0,
        vm_base_near_app: false,
        guard_pages: false,
        ..Default::default()
    }
}

const PADDING_SEED: usize = 0xCDEF_0123_4567_89AB;

pub(crate) fn fill_in(ptr: *mut u8, size: usize) {
    let padding = (PADDING_SEED ^ size) as u64;
    for i in 0..size {
        unsafe {
            *ptr.add(i) = (padding >> ((i % 8) * 8)) as u8;
        }
    }
}

pub(crate) fn check_on(ptr: *const u8, size: usize) {
    let padding = (PADDING_SEED ^ size) as u64;
    for i in 0..size {
        unsafe {
            assert!(*ptr.add(i) == (padding >> ((i % 8) * 8)) as u8);
        }
    }
}
