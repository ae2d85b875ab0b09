/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * Keeps every byte of the code region within a 32-bit relative
 * displacement of every declared must-reach region.
 *
 * Only the closed must-reach interval [must_start, must_end] is
 * stored; the allowed placement window is derived on demand:
 *
 *   allow_start = must_end - 2^31 + 1   (clamped at 0)
 *   allow_end   = must_start + 2^31 - 1 (clamped at the address max,
 *                                        and below 2^32 under
 *                                        heap_in_lower_4gb)
 *
 * The window narrows monotonically as requests arrive.
 */

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use crate::debug::*;
use crate::defines::MAX_REL32_OFFSET;
use crate::dprintf;
use crate::errors::ErrNO;
use crate::types::vaddr_t;

struct ReachState {
    /* Closed interval; empty when must_start > must_end. */
    must_start: vaddr_t,
    must_end: vaddr_t,

    /* Where vmcode actually landed; 0/0 until placed. */
    vmcode_start: vaddr_t,
    vmcode_end: vaddr_t,
}

static REACH: Mutex<ReachState> = Mutex::new(ReachState {
    must_start: vaddr_t::MAX,
    must_end: 0,
    vmcode_start: 0,
    vmcode_end: 0,
});

static LOWER_4GB: AtomicBool = AtomicBool::new(false);

pub(crate) fn reachability_init(lower_4gb: bool) {
    let mut state = REACH.lock();
    state.must_start = vaddr_t::MAX;
    state.must_end = 0;
    state.vmcode_start = 0;
    state.vmcode_end = 0;
    LOWER_4GB.store(lower_4gb, Ordering::Relaxed);
}

fn derive_allowed(must_start: vaddr_t, must_end: vaddr_t) -> (vaddr_t, vaddr_t) {
    let allow_start = if must_start > must_end {
        0
    } else if must_end > MAX_REL32_OFFSET {
        must_end - MAX_REL32_OFFSET
    } else {
        0
    };
    let mut allow_end = if must_start > must_end {
        vaddr_t::MAX
    } else {
        must_start.saturating_add(MAX_REL32_OFFSET)
    };
    if LOWER_4GB.load(Ordering::Relaxed) {
        allow_end = allow_end.min(u32::MAX as vaddr_t);
    }
    (allow_start, allow_end)
}

/* The window any new code-region byte must fall in, as a closed
 * interval. */
pub fn allowable_region() -> (vaddr_t, vaddr_t) {
    let state = REACH.lock();
    derive_allowed(state.must_start, state.must_end)
}

pub(crate) fn set_vmcode_bounds(start: vaddr_t, end: vaddr_t) {
    let mut state = REACH.lock();
    state.vmcode_start = start;
    state.vmcode_end = end;
}

/*
 * Record [start, start+size) as a region every code-region byte must
 * be able to target with a rel32.  Before vmcode is placed this only
 * biases placement; afterward it is a hard check against the existing
 * placement.
 */
pub fn request_region_be_heap_reachable(start: vaddr_t, size: usize)
    -> Result<(), ErrNO>
{
    let mut state = REACH.lock();
    let new_start = state.must_start.min(start);
    let new_end = state.must_end.max(start + size - 1);

    let (allow_start, allow_end) = derive_allowed(new_start, new_end);
    if allow_start > allow_end {
        /* The must-reach span itself exceeds rel32 range. */
        return Err(ErrNO::ReachabilityUnsatisfiable);
    }
    if state.vmcode_end != 0 &&
       (state.vmcode_start < allow_start || state.vmcode_end - 1 > allow_end) {
        dprintf!(CRITICAL,
                 "must-reach [{:#x},{:#x}) conflicts with vmcode [{:#x},{:#x})\n",
                 start, start + size, state.vmcode_start, state.vmcode_end);
        return Err(ErrNO::ReachabilityUnsatisfiable);
    }

    state.must_start = new_start;
    state.must_end = new_end;
    dprintf!(SPEW, "must-reach now [{:#x},{:#x}] allowed [{:#x},{:#x}]\n",
             new_start, new_end, allow_start, allow_end);
    Ok(())
}

/* True when |target| is within +/-2^31 of every point currently in
 * the must-reach range, by conservative endpoint arithmetic. */
pub fn rel32_reachable_from_vmcode(target: vaddr_t) -> bool {
    let state = REACH.lock();
    if state.must_start > state.must_end {
        return true;
    }
    let (allow_start, allow_end) = derive_allowed(state.must_start, state.must_end);
    target >= allow_start && target <= allow_end
}
