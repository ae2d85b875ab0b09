/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use crate::types::os_err_t;

/* Which step of memory acquisition failed.  Reported to the collaborator
 * on terminal out-of-memory conditions. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomPhase {
    Init,
    Reserve,
    Commit,
    Extend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrNO {
    /* No suitable virtual reservation could be found, neither in a
     * VM region nor directly from the OS. */
    OutOfVirtual { phase: OomPhase, os_error: os_err_t },

    /* The reservation exists but the OS refused to back it
     * (pagefile / RLIMIT / job limit). */
    OutOfCommitted { phase: OomPhase, os_error: os_err_t },

    /* Size outside safe bounds, or free of an unknown pointer.
     * A programming error, not a runtime condition. */
    InvalidHeapArg,

    /* Internal sentinel: the caller must acquire the outer DR-areas
     * lock and re-enter.  Never surfaces past the public entry points. */
    RetryWithOuterLock,

    /* A must-reach request cannot be reconciled with the current
     * vmcode placement.  Fatal at configuration time. */
    ReachabilityUnsatisfiable,

    /* W^X dual-map setup or fork recovery failed. */
    WxorXFailure,
}
