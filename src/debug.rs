/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::io::Write;
use spin::Mutex;

/* debug print levels */
pub const CRITICAL  : u32 = 0;
pub const ALWAYS    : u32 = 0;
pub const INFO      : u32 = 1;
pub const SPEW      : u32 = 2;

static DEBUG_PRINT_LEVEL: AtomicU32 = AtomicU32::new(CRITICAL);

/* The surrounding runtime owns the real log channel; we only forward
 * formatted lines to whatever sink it registered. */
type LogSink = fn(fmt::Arguments);

static LOG_SINK: Mutex<LogSink> = Mutex::new(stderr_sink);

fn stderr_sink(args: fmt::Arguments) {
    let _ = std::io::stderr().write_fmt(args);
}

pub fn set_log_level(level: u32) {
    DEBUG_PRINT_LEVEL.store(level, Ordering::Relaxed);
}

pub fn log_level() -> u32 {
    DEBUG_PRINT_LEVEL.load(Ordering::Relaxed)
}

pub fn set_log_sink(sink: fn(fmt::Arguments)) {
    *LOG_SINK.lock() = sink;
}

pub fn log_write(args: fmt::Arguments) {
    let sink = *LOG_SINK.lock();
    sink(args);
}

#[macro_export]
macro_rules! dprintf {
    ($level: expr, $($arg:tt)*) => (
        if $level <= $crate::debug::log_level() {
            $crate::debug::log_write(format_args!($($arg)*));
        }
    );
}

#[macro_export]
macro_rules! RT_ASSERT {
    ($expr: expr) => (assert!($expr));
}

#[macro_export]
macro_rules! RT_ASSERT_MSG {
    ($expr: expr, $($arg: tt)+) => (assert!($expr, $($arg)+));
}

#[macro_export]
macro_rules! RT_DEBUG_ASSERT {
    ($expr: expr) => (debug_assert!($expr));
}
