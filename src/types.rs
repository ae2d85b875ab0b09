/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

#![allow(non_camel_case_types)]

pub type vaddr_t = usize;
pub type which_vmm_t = u32;
pub type os_err_t = i32;
pub type file_t = i32;
