// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! ARM System Control Block.
//!
//! <https://developer.arm.com/documentation/dui0553/latest/>

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::static_ref::StaticRef;

register_structs! {
    pub ScbRegisters {
        /// CPUID Base Register
        (0x00 => cpuid: ReadOnly<u32>),
        /// Interrupt Control and State Register
        (0x04 => icsr: ReadWrite<u32>),
        /// Vector Table Offset Register
        (0x08 => vtor: ReadWrite<u32>),
        /// Application Interrupt and Reset Control Register
        (0x0c => aircr: ReadWrite<u32, ApplicationInterruptAndReset::Register>),
        /// System Control Register
        (0x10 => scr: ReadWrite<u32>),
        /// Configuration and Control Register
        (0x14 => ccr: ReadWrite<u32>),
        /// System Handler Priority Registers
        (0x18 => shp: [ReadWrite<u32>; 3]),
        /// System Handler Control and State Register
        (0x24 => shcsr: ReadWrite<u32>),
        (0x28 => @END),
    }
}

register_bitfields![u32,
    ApplicationInterruptAndReset [
        /// Key field; reads as 0xFA05, must be written as 0x05FA.
        VECTKEY OFFSET(16) NUMBITS(16) [
            Key = 0x05FA
        ],
        /// Data endianness bit
        ENDIANNESS OFFSET(15) NUMBITS(1) [],
        /// Interrupt priority grouping field
        PRIGROUP OFFSET(8) NUMBITS(3) [],
        /// System reset request
        SYSRESETREQ OFFSET(2) NUMBITS(1) []
    ]
];

const SCB: StaticRef<ScbRegisters> =
    unsafe { StaticRef::new(0xE000_ED00 as *const ScbRegisters) };

/// Software reset using the ARM System Control Block.
pub unsafe fn reset() {
    let prigroup = SCB.aircr.read(ApplicationInterruptAndReset::PRIGROUP);
    SCB.aircr.write(
        ApplicationInterruptAndReset::VECTKEY::Key
            + ApplicationInterruptAndReset::PRIGROUP.val(prigroup)
            + ApplicationInterruptAndReset::SYSRESETREQ::SET,
    );
}

/// Point VTOR at a relocated vector table.
///
/// ## Safety
///
/// `base` must be the address of a fully populated, correctly aligned vector
/// table that outlives its installation.
pub unsafe fn set_vector_table_base(base: u32) {
    SCB.vtor.set(base);
}
