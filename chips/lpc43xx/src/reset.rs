// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Reset Generation Unit, watchdog, and the persistent reset-reason cell.
//!
//! One 32-bit word in a dedicated linker section survives soft resets. Every
//! valid reason value carries `0xAA55` in its upper half; when that signature
//! is missing after boot, RAM did not survive and the reset is reported as a
//! power cycle.

use core::cell::Cell;

use tock_registers::interfaces::Writeable;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use cortexm4::{StaticRef, VolatileCell};

register_structs! {
    pub RguRegisters {
        (0x000 => _reserved0),
        /// Reset control; writing a 1 pulses the matching reset line.
        (0x100 => ctrl: [WriteOnly<u32>; 2]),
        (0x108 => _reserved1),
        /// Reset status, two bits per line.
        (0x110 => status: [ReadWrite<u32>; 4]),
        (0x120 => _reserved2),
        /// Current reset state, one bit per line.
        (0x150 => active_status: [ReadOnly<u32>; 2]),
        (0x158 => @END),
    }
}

register_structs! {
    pub WwdtRegisters {
        /// Mode register; enable and reset-on-timeout control.
        (0x00 => mode: ReadWrite<u32>),
        /// Timeout constant.
        (0x04 => tc: ReadWrite<u32>),
        /// Feed sequence register; 0xAA then 0x55.
        (0x08 => feed: WriteOnly<u32>),
        /// Current timer value.
        (0x0c => tv: ReadOnly<u32>),
        (0x10 => _reserved0),
        /// Warning interrupt compare value.
        (0x14 => warnint: ReadWrite<u32>),
        /// Window compare value.
        (0x18 => window: ReadWrite<u32>),
        (0x1c => @END),
    }
}

pub const RGU_BASE: StaticRef<RguRegisters> =
    unsafe { StaticRef::new(0x4005_3000 as *const RguRegisters) };

pub const WWDT_BASE: StaticRef<WwdtRegisters> =
    unsafe { StaticRef::new(0x4008_0000 as *const WwdtRegisters) };

/// Peripheral reset lines, as bit numbers into the RGU control registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetLine {
    Core = 0,
    Periph = 1,
    Master = 2,
    Wwdt = 4,
    Creg = 5,
    Bus = 8,
    Scu = 9,
    M4 = 13,
    Ethernet = 22,
    Timer0 = 32,
    Timer1 = 33,
    Timer2 = 34,
    Timer3 = 35,
    Adc0 = 40,
    Adc1 = 41,
    Dac = 42,
    Uart0 = 44,
    Uart1 = 45,
    Uart2 = 46,
    Uart3 = 47,
    Sgpio = 57,
}

/// Reported cause of the last reset.
///
/// The values are the sentinels stored in the persistent cell; they are
/// deliberately unlikely patterns so uninitialized RAM does not masquerade
/// as a valid reason.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResetReason {
    Unknown = 0xAA55_FF00,
    SoftReset = 0xAA55_FF01,
    Fault = 0xAA55_FF02,
    PowerCycle = 0xAA55_FF03,
    WatchdogTimeout = 0xAA55_FF04,
    NewFirmware = 0xAA55_FF05,
    UseExternalClock = 0xAA55_CCDD,
}

/// Signature present in the upper half of every valid reason value.
pub const RESET_REASON_VALID_MASK: u32 = 0xAA55_0000;

struct PersistentCell(VolatileCell<u32>);

// Single foreground writer; the cell exists to survive resets, not to be
// shared between contexts.
unsafe impl Sync for PersistentCell {}

/// The one cell the startup code preserves across soft resets.
#[cfg_attr(
    all(target_arch = "arm", target_os = "none"),
    link_section = ".persistent"
)]
static RESET_REASON: PersistentCell = PersistentCell(VolatileCell::new(0));

fn decode_reason(raw: u32) -> ResetReason {
    match raw {
        0xAA55_FF01 => ResetReason::SoftReset,
        0xAA55_FF02 => ResetReason::Fault,
        0xAA55_FF03 => ResetReason::PowerCycle,
        0xAA55_FF04 => ResetReason::WatchdogTimeout,
        0xAA55_FF05 => ResetReason::NewFirmware,
        0xAA55_CCDD => ResetReason::UseExternalClock,
        _ => ResetReason::Unknown,
    }
}

pub struct ResetController {
    registers: StaticRef<RguRegisters>,
    last_reason: Cell<u32>,
}

impl ResetController {
    pub const fn new(registers: StaticRef<RguRegisters>) -> ResetController {
        ResetController {
            registers,
            last_reason: Cell::new(ResetReason::Unknown as u32),
        }
    }

    /// Capture the persisted reason and rearm the cell. Call once, early.
    pub fn initialize(&self) {
        let mut last = RESET_REASON.0.get();
        RESET_REASON.0.set(ResetReason::Unknown as u32);

        if last & RESET_REASON_VALID_MASK != RESET_REASON_VALID_MASK {
            // The signature did not survive: RAM was lost, so this boot came
            // from a power cycle (or a first boot, which looks the same).
            last = ResetReason::PowerCycle as u32;
        }
        self.last_reason.set(last);
    }

    /// Whether RAM appears to have survived since the previous firmware ran.
    pub fn persistent_memory_likely_intact(&self) -> bool {
        let current = RESET_REASON.0.get();
        let observed = if current == ResetReason::Unknown as u32 {
            self.last_reason.get()
        } else {
            current
        };
        observed & RESET_REASON_VALID_MASK == RESET_REASON_VALID_MASK
    }

    /// The cause of the last reset, if known.
    pub fn reset_reason(&self) -> ResetReason {
        if self.persistent_memory_likely_intact() {
            decode_reason(self.last_reason.get())
        } else {
            ResetReason::Unknown
        }
    }

    /// Human-readable reset cause for diagnostics.
    pub fn reset_reason_string(&self) -> &'static str {
        match self.reset_reason() {
            ResetReason::PowerCycle => "power cycle",
            ResetReason::SoftReset => "software reset",
            ResetReason::UseExternalClock => "reset to switch to external clock",
            ResetReason::Fault => "fault-induced reset",
            ResetReason::WatchdogTimeout => "watchdog timeout",
            ResetReason::NewFirmware => "firmware re-flash",
            ResetReason::Unknown => {
                if self.persistent_memory_likely_intact() {
                    "unknown (non-power-cycle) reset"
                } else {
                    "hard reset / power cycle"
                }
            }
        }
    }

    /// Pulse one peripheral's reset line.
    pub fn assert_reset(&self, line: ResetLine) {
        let bit = line as u32;
        self.registers.ctrl[(bit / 32) as usize].set(1 << (bit % 32));
    }

    /// Reset the entire system, recording `reason` for the next boot.
    pub fn system_reset(&self, reason: ResetReason, include_always_on_domain: bool) -> ! {
        RESET_REASON.0.set(reason as u32);

        if include_always_on_domain {
            self.assert_reset(ResetLine::Master);
        } else {
            self.assert_reset(ResetLine::Core);
        }

        loop {
            cortexm4::support::nop();
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn fake_controller() -> ResetController {
        let mem = std::vec![0u32; 0x158 / 4].into_boxed_slice();
        let registers =
            unsafe { StaticRef::new(std::boxed::Box::leak(mem).as_ptr() as *const RguRegisters) };
        ResetController::new(registers)
    }

    // One test body: the persistent cell is process-wide state, so the
    // scenarios run sequentially.
    #[test]
    fn reset_reason_protocol() {
        let controller = fake_controller();

        // Missing signature: RAM did not survive, so the boot reads as a
        // power cycle.
        RESET_REASON.0.set(0x0000_0000);
        controller.initialize();
        assert_eq!(controller.reset_reason(), ResetReason::PowerCycle);
        assert_eq!(controller.reset_reason_string(), "power cycle");

        // Valid signature: the recorded reason round-trips.
        RESET_REASON.0.set(ResetReason::WatchdogTimeout as u32);
        controller.initialize();
        assert!(controller.persistent_memory_likely_intact());
        assert_eq!(controller.reset_reason(), ResetReason::WatchdogTimeout);
        assert_eq!(controller.reset_reason_string(), "watchdog timeout");

        // A signature with the mask but an unrecognized low half is an
        // unknown-but-not-power-cycle reset.
        RESET_REASON.0.set(0xAA55_1234);
        controller.initialize();
        assert_eq!(controller.reset_reason(), ResetReason::Unknown);
        assert_eq!(
            controller.reset_reason_string(),
            "unknown (non-power-cycle) reset"
        );
    }
}
