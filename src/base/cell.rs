/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::cell::UnsafeCell;

/*
 * Process-wide mutable slot whose consistency is guaranteed by an
 * external lock, not by the type system.  Callers must hold the lock
 * documented at each use site before dereferencing the raw pointer.
 */
pub struct GlobalCell<T> {
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for GlobalCell<T> {}

impl<T> GlobalCell<T> {
    pub const fn new(value: T) -> Self {
        Self { data: UnsafeCell::new(value) }
    }

    pub fn get(&self) -> *mut T {
        self.data.get()
    }
}
