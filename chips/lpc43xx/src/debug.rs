// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Leveled diagnostics collaborator.
//!
//! Drivers in this crate report through the `log_*!` macros; where the text
//! ends up is the board's business. A board installs a writer (typically one
//! that feeds a UART) with [`set_debug_writer`]; until then every message is
//! discarded, so the core never depends on an output device.

use core::fmt::Arguments;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Message severity, most urgent first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_u8(raw: u8) -> LogLevel {
        match raw {
            0 => LogLevel::Error,
            1 => LogLevel::Warning,
            2 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// Sink for formatted diagnostics.
pub type DebugWriter = fn(LogLevel, Arguments);

static WRITER: AtomicUsize = AtomicUsize::new(0);
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Install the function that renders diagnostics.
pub fn set_debug_writer(writer: DebugWriter) {
    WRITER.store(writer as usize, Ordering::Relaxed);
}

/// Set the most verbose level that will be emitted.
pub fn set_log_level(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

/// The most verbose level currently emitted.
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(THRESHOLD.load(Ordering::Relaxed))
}

/// Emit one message; used by the macros below and by diagnostics that take a
/// caller-selected level (e.g. configuration dumps).
pub fn write(level: LogLevel, args: Arguments) {
    if level > log_level() {
        return;
    }
    let raw = WRITER.load(Ordering::Relaxed);
    if raw != 0 {
        let writer: DebugWriter = unsafe { core::mem::transmute(raw) };
        writer(level, args);
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::debug::write($crate::debug::LogLevel::Error, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::debug::write($crate::debug::LogLevel::Warning, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::debug::write($crate::debug::LogLevel::Info, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::debug::write($crate::debug::LogLevel::Debug, core::format_args!($($arg)*))
    };
}
