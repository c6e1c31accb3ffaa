// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! System Control Unit: pin multiplexing and pad configuration.
//!
//! Every multiplexed pad has one special-function-select word; pads are
//! addressed as `P<group>_<pin>` with sixteen groups of up to thirty-two
//! pins, plus four dedicated CLKn pads.

use tock_registers::interfaces::Writeable;
use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::ReadWrite;

use cortexm4::StaticRef;

#[repr(C)]
struct PinGroup {
    pins: [ReadWrite<u32, PIN_CONFIG::Register>; 32],
}

register_structs! {
    pub ScuRegisters {
        /// Special function select registers, one group per port.
        (0x000 => group: [PinGroup; 16]),
        (0x800 => _reserved0),
        /// Special function select registers for the dedicated clock pads.
        (0xc00 => clk: [ReadWrite<u32, PIN_CONFIG::Register>; 4]),
        (0xc10 => @END),
    }
}

register_bitfields![u32,
    PIN_CONFIG [
        /// Multiplexed function for this pad.
        FUNCTION OFFSET(0) NUMBITS(3) [],
        /// Pull resistor selection; see [`PinResistors`] for the encoding.
        PULL OFFSET(3) NUMBITS(2) [],
        /// Drive the pad with fast slew; needed above roughly 30 MHz.
        FAST_SLEW OFFSET(5) NUMBITS(1) [],
        /// Connect the pad's input buffer; required to read the pin at all.
        INPUT_BUFFER OFFSET(6) NUMBITS(1) [],
        /// Bypass the 10 ns input glitch filter.
        DISABLE_GLITCH_FILTER OFFSET(7) NUMBITS(1) []
    ]
];

/// Internal resistor configuration for a pad.
///
/// The encoding is the hardware's: the two bits are "disable pull-up" and
/// "enable pull-down", which is why `PullUp` is zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PinResistors {
    PullUp = 0b00,
    Keeper = 0b01,
    None = 0b10,
    PullDown = 0b11,
}

pub const SCU_BASE: StaticRef<ScuRegisters> =
    unsafe { StaticRef::new(0x4008_6000 as *const ScuRegisters) };

pub struct Scu {
    registers: StaticRef<ScuRegisters>,
}

impl Scu {
    pub const fn new(registers: StaticRef<ScuRegisters>) -> Scu {
        Scu { registers }
    }

    fn pin(&self, group: u8, pin: u8) -> &ReadWrite<u32, PIN_CONFIG::Register> {
        &self.registers.group[group as usize].pins[pin as usize]
    }

    /// Configure a pad with full manual control of every field.
    pub fn configure_pin(
        &self,
        group: u8,
        pin: u8,
        function: u8,
        resistors: PinResistors,
        fast_slew: bool,
        input_buffer: bool,
        disable_glitch_filter: bool,
    ) {
        self.pin(group, pin).write(
            PIN_CONFIG::FUNCTION.val(function as u32)
                + PIN_CONFIG::PULL.val(resistors as u32)
                + PIN_CONFIG::FAST_SLEW.val(fast_slew as u32)
                + PIN_CONFIG::INPUT_BUFFER.val(input_buffer as u32)
                + PIN_CONFIG::DISABLE_GLITCH_FILTER.val(disable_glitch_filter as u32),
        );
    }

    /// Configure a pad with the options that suit a normal (< 30 MHz) GPIO.
    pub fn configure_pin_gpio(&self, group: u8, pin: u8, function: u8, resistors: PinResistors) {
        self.configure_pin(group, pin, function, resistors, false, true, false);
    }

    /// Configure a pad for fast (> 30 MHz) I/O: fast slew, input buffer on,
    /// glitch filter bypassed.
    pub fn configure_pin_fast_io(&self, group: u8, pin: u8, function: u8, resistors: PinResistors) {
        self.configure_pin(group, pin, function, resistors, true, true, true);
    }

    /// Configure a pad for a UART line.
    pub fn configure_pin_uart(&self, group: u8, pin: u8, function: u8) {
        self.configure_pin(group, pin, function, PinResistors::None, false, true, false);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use tock_registers::interfaces::Readable;

    fn fake_scu() -> Scu {
        let mem = std::vec![0u32; 0xc10 / 4].into_boxed_slice();
        let registers =
            unsafe { StaticRef::new(std::boxed::Box::leak(mem).as_ptr() as *const ScuRegisters) };
        Scu::new(registers)
    }

    #[test]
    fn fast_io_sets_slew_and_bypasses_filter() {
        let scu = fake_scu();
        scu.configure_pin_fast_io(1, 12, 6, PinResistors::None);

        let value = scu.pin(1, 12).get();
        assert_eq!(value & 0x7, 6); // function
        assert_eq!((value >> 3) & 0x3, 0b10); // no pull resistors
        assert_eq!((value >> 5) & 1, 1); // fast slew
        assert_eq!((value >> 6) & 1, 1); // input buffer
        assert_eq!((value >> 7) & 1, 1); // glitch filter bypassed
    }

    #[test]
    fn gpio_keeps_glitch_filter_and_normal_slew() {
        let scu = fake_scu();
        scu.configure_pin_gpio(2, 3, 0, PinResistors::PullUp);

        let value = scu.pin(2, 3).get();
        assert_eq!(value & 0x7, 0);
        assert_eq!((value >> 3) & 0x3, 0b00);
        assert_eq!((value >> 5) & 1, 0);
        assert_eq!((value >> 7) & 1, 0);
    }
}
