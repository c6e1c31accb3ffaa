// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Standard error type for driver operations in this crate.

/// Errors a driver call can return.
///
/// These are value-returned categories; no driver in this crate panics on a
/// path hardware can reach.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Unsupported mode, invalid bus width, malformed pin list, or another
    /// caller-description problem.
    InvalidArgument,
    /// The requested (SGPIO pin, chip pin) pair is not in the SCU mapping
    /// table.
    InvalidPinMapping,
    /// A required slice or pin is already assigned.
    Busy,
    /// The requested shift-count limit cannot be applied to the allocated
    /// slice chain.
    CannotMeetShiftLimit,
    /// The requested frequency cannot be derived from the available clock.
    TimingInfeasible,
    /// A PLL lock, oscillator settle, or frequency measurement did not
    /// complete in time.
    Timeout,
    /// The mode or feature is recognized but not implemented.
    Unsupported,
    /// A collaborator could not obtain the memory it needs.
    OutOfMemory,
    /// No such device or clock source.
    NoDevice,
}
