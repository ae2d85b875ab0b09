/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use crate::os::os_current_thread_id;
use crate::RT_ASSERT;

const UNOWNED: usize = 0;

/*
 * Recursive spin lock.  The allocator is entered by application threads
 * mid-allocation, so blocking primitives of the host runtime are off
 * limits; spinning with an owner check is the whole strategy.
 *
 * The data protected by one of these lives outside the lock (see
 * base::cell::GlobalCell); the lock only brackets access.
 */
pub struct RecursiveLock {
    owner: AtomicUsize,
    count: AtomicU32,
}

impl RecursiveLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            count: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        let me = os_current_thread_id();
        RT_ASSERT!(me != UNOWNED);
        if self.owner.load(Ordering::Relaxed) == me {
            /* Re-entrance: only the owner ever increments. */
            self.count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        loop {
            match self.owner.compare_exchange_weak(UNOWNED, me,
                                                   Ordering::Acquire,
                                                   Ordering::Relaxed) {
                Ok(_) => {
                    self.count.store(1, Ordering::Relaxed);
                    return;
                }
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    pub fn unlock(&self) {
        let me = os_current_thread_id();
        RT_ASSERT!(self.owner.load(Ordering::Relaxed) == me);
        let prev = self.count.fetch_sub(1, Ordering::Relaxed);
        RT_ASSERT!(prev >= 1);
        if prev == 1 {
            self.owner.store(UNOWNED, Ordering::Release);
        }
    }

    pub fn owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == os_current_thread_id()
    }

    /* Run |f| with the lock held. */
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}
