/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use spin::RwLock;
use crate::debug::*;
use crate::dprintf;
use crate::errors::OomPhase;
use crate::types::{os_err_t, vaddr_t, which_vmm_t};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    Basic,
    All,
}

/*
 * Outward interface to the surrounding runtime.  Every callback has a
 * no-op default so a standalone embedder only overrides what it tracks.
 *
 * The DR-areas lock exposed here ranks above every lock owned by this
 * crate; see the rank order in heap/mod.rs.
 */
pub trait HeapHooks: Sync {
    /* Invoked before the single retry on reserve/commit failure,
     * giving the code cache a chance to drop dead units. */
    fn notify_low_memory(&self) {}

    fn dr_areas_locked(&self) -> bool {
        true
    }
    fn dr_areas_lock(&self) {}
    fn dr_areas_unlock(&self) {}

    fn add_dr_area(&self, _start: vaddr_t, _end: vaddr_t, _prot: u32, _image: bool) {}
    fn remove_dr_area(&self, _start: vaddr_t, _end: vaddr_t) {}
    fn mark_dr_areas_stale(&self) {}

    fn update_memory_areas(&self, _start: vaddr_t, _end: vaddr_t, _prot: u32,
                           _which: which_vmm_t) {}

    /* Terminal: called once per process with the failing phase and the
     * OS error; must not return. */
    fn report_oom(&self, which: which_vmm_t, phase: OomPhase, os_error: os_err_t) -> ! {
        dprintf!(CRITICAL,
                 "out of memory: which=0x{:x} phase={:?} os_error={}\n",
                 which, phase, os_error);
        std::process::abort();
    }

    fn schedule_reset(&self, _scope: ResetScope) {}
}

struct DefaultHooks;

impl HeapHooks for DefaultHooks {}

static DEFAULT_HOOKS: DefaultHooks = DefaultHooks;

static HOOKS: RwLock<&'static dyn HeapHooks> = RwLock::new(&DEFAULT_HOOKS);

pub(crate) fn set_hooks(hooks: &'static dyn HeapHooks) {
    *HOOKS.write() = hooks;
}

pub fn hooks() -> &'static dyn HeapHooks {
    *HOOKS.read()
}
