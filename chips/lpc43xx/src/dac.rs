// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! 10-bit digital-to-analog converter.

use tock_registers::interfaces::{Readable, ReadWriteable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::ReadWrite;

use cortexm4::StaticRef;

use crate::clocks::PeripheralClockInterface;

register_structs! {
    pub DacRegisters {
        /// Conversion register: the current output value.
        (0x00 => cr: ReadWrite<u32, CR::Register>),
        /// Control register: DMA and counter operation.
        (0x04 => ctrl: ReadWrite<u32, CTRL::Register>),
        /// Counter value for timed conversions.
        (0x08 => cntval: ReadWrite<u32>),
        (0x0c => @END),
    }
}

register_bitfields![u32,
    CR [
        /// Output value; the pin settles to VALUE/1024 x VREF.
        VALUE OFFSET(6) NUMBITS(10) [],
        /// Trade settling time for supply current.
        BIAS OFFSET(16) NUMBITS(1) []
    ],
    CTRL [
        INT_DMA_REQ OFFSET(0) NUMBITS(1) [],
        DBLBUF_ENA OFFSET(1) NUMBITS(1) [],
        CNT_ENA OFFSET(2) NUMBITS(1) [],
        DMA_ENA OFFSET(3) NUMBITS(1) []
    ]
];

pub const DAC_BASE: StaticRef<DacRegisters> =
    unsafe { StaticRef::new(0x400E_1000 as *const DacRegisters) };

pub struct Dac<'a> {
    registers: StaticRef<DacRegisters>,
    clock: &'a dyn PeripheralClockInterface,
}

impl<'a> Dac<'a> {
    pub const fn new(
        registers: StaticRef<DacRegisters>,
        clock: &'a dyn PeripheralClockInterface,
    ) -> Dac<'a> {
        Dac { registers, clock }
    }

    /// Clock the converter and park the output at mid-scale.
    pub fn initialize(&self) {
        self.clock.enable();
        self.registers.ctrl.set(0);
        self.registers.cr.write(CR::VALUE.val(512));
    }

    /// Set the raw 10-bit output value.
    pub fn set_value(&self, value: u16) {
        self.registers.cr.modify(CR::VALUE.val(value as u32 & 0x3FF));
    }

    /// The last value written.
    pub fn value(&self) -> u16 {
        self.registers.cr.read(CR::VALUE) as u16
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    struct NoClock;
    impl PeripheralClockInterface for NoClock {
        fn enable(&self) {}
        fn disable(&self) {}
        fn frequency(&self) -> u32 {
            0
        }
    }

    #[test]
    fn values_are_masked_to_ten_bits() {
        let mem = std::vec![0u32; 3].into_boxed_slice();
        let registers = unsafe {
            StaticRef::new(std::boxed::Box::leak(mem).as_ptr() as *const DacRegisters)
        };
        static CLOCK: NoClock = NoClock;
        let dac = Dac::new(registers, &CLOCK);

        dac.initialize();
        assert_eq!(dac.value(), 512);
        dac.set_value(0xFFFF);
        assert_eq!(dac.value(), 0x3FF);
    }
}
