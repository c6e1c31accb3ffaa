// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Shared support for ARM Cortex-M4 MCUs.

#![no_std]

pub mod cells;
pub mod nvic;
pub mod scb;
pub mod static_ref;
pub mod support;

pub use cells::VolatileCell;
pub use static_ref::StaticRef;
