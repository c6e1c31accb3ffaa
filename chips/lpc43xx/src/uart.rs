// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! NS16550-style USART driver.
//!
//! Transmit is polled; receive is interrupt-driven into a caller-provided
//! ring buffer. The receive-data interrupt is enabled as the very last step
//! of initialization, after the ring buffer and FIFO state are in place, so
//! the service routine can never observe a half-initialized driver.

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use cortexm4::StaticRef;

use crate::clocks::PeripheralClockInterface;
use crate::ringbuffer::RingBuffer;
use crate::Error;

register_structs! {
    pub UsartRegisters {
        /// Receive buffer / transmit holding / divisor latch LSB, depending
        /// on access direction and the DLAB bit.
        (0x00 => rbr_thr_dll: ReadWrite<u32>),
        /// Interrupt enable / divisor latch MSB.
        (0x04 => ier_dlm: ReadWrite<u32, IER::Register>),
        /// Interrupt identification (read) / FIFO control (write).
        (0x08 => iir_fcr: ReadWrite<u32, FCR::Register>),
        /// Line control.
        (0x0c => lcr: ReadWrite<u32, LCR::Register>),
        /// Modem control (UART1 only).
        (0x10 => mcr: ReadWrite<u32>),
        /// Line status.
        (0x14 => lsr: ReadOnly<u32, LSR::Register>),
        /// Modem status (UART1 only).
        (0x18 => msr: ReadOnly<u32>),
        /// Scratch pad.
        (0x1c => scr: ReadWrite<u32>),
        /// Auto-baud control.
        (0x20 => acr: ReadWrite<u32>),
        (0x24 => _reserved0),
        /// Fractional divider.
        (0x28 => fdr: ReadWrite<u32, FDR::Register>),
        (0x2c => _reserved1),
        /// Transmit enable.
        (0x30 => ter: ReadWrite<u32>),
        (0x34 => @END),
    }
}

register_bitfields![u32,
    IER [
        /// Receive-data-available interrupt.
        RBR OFFSET(0) NUMBITS(1) [],
        /// Transmit-holding-register-empty interrupt.
        THRE OFFSET(1) NUMBITS(1) [],
        /// Receive line status interrupt.
        RX_LINE_STATUS OFFSET(2) NUMBITS(1) []
    ],
    FCR [
        FIFO_ENABLE OFFSET(0) NUMBITS(1) [],
        RX_FIFO_RESET OFFSET(1) NUMBITS(1) [],
        TX_FIFO_RESET OFFSET(2) NUMBITS(1) [],
        RX_TRIGGER_LEVEL OFFSET(6) NUMBITS(2) []
    ],
    LCR [
        WORD_LENGTH OFFSET(0) NUMBITS(2) [
            FiveBits = 0,
            SixBits = 1,
            SevenBits = 2,
            EightBits = 3
        ],
        TWO_STOP_BITS OFFSET(2) NUMBITS(1) [],
        PARITY_ENABLE OFFSET(3) NUMBITS(1) [],
        PARITY_SELECT OFFSET(4) NUMBITS(2) [],
        BREAK_CONTROL OFFSET(6) NUMBITS(1) [],
        /// Divisor latch access.
        DLAB OFFSET(7) NUMBITS(1) []
    ],
    LSR [
        /// Receive data ready.
        RDR OFFSET(0) NUMBITS(1) [],
        OVERRUN OFFSET(1) NUMBITS(1) [],
        PARITY_ERROR OFFSET(2) NUMBITS(1) [],
        FRAMING_ERROR OFFSET(3) NUMBITS(1) [],
        /// Transmit holding register empty.
        THRE OFFSET(5) NUMBITS(1) [],
        TRANSMITTER_EMPTY OFFSET(6) NUMBITS(1) []
    ],
    FDR [
        DIVADDVAL OFFSET(0) NUMBITS(4) [],
        MULVAL OFFSET(4) NUMBITS(4) []
    ]
];

pub const USART0_BASE: StaticRef<UsartRegisters> =
    unsafe { StaticRef::new(0x4008_1000 as *const UsartRegisters) };
pub const UART1_BASE: StaticRef<UsartRegisters> =
    unsafe { StaticRef::new(0x4008_2000 as *const UsartRegisters) };
pub const USART2_BASE: StaticRef<UsartRegisters> =
    unsafe { StaticRef::new(0x400C_1000 as *const UsartRegisters) };
pub const USART3_BASE: StaticRef<UsartRegisters> =
    unsafe { StaticRef::new(0x400C_2000 as *const UsartRegisters) };

/// A complete baud configuration: the 16-bit divisor latch plus the
/// fractional divider pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FractionalDivisor {
    pub divisor: u16,
    pub mul: u8,
    pub div_add: u8,
}

/// The baud a configuration actually produces from `pclk`.
pub fn achieved_baud(pclk: u32, config: FractionalDivisor) -> u32 {
    let divided = 16 * config.divisor as u64 * (config.mul as u64 + config.div_add as u64);
    (pclk as u64 * config.mul as u64 / divided) as u32
}

/// Brute-force the divisor-latch and fractional-divider combination closest
/// to `baud`.
///
/// The hardware constrains `1 <= mul <= 15`, `div_add < mul`, and requires
/// a divisor of at least 3 whenever the fractional divider is active
/// (`div_add != 0`); `div_add == 0` disables the fractional stage entirely.
pub fn compute_fractional_divisor(pclk: u32, baud: u32) -> Option<FractionalDivisor> {
    let mut best: Option<(u32, FractionalDivisor)> = None;

    for mul in 1..=15u32 {
        for div_add in 0..mul {
            // baud = pclk * mul / (16 * divisor * (mul + div_add))
            let denominator = 16 * baud as u64 * (mul + div_add) as u64;
            let ideal = pclk as u64 * mul as u64;

            for divisor in [
                (ideal / denominator) as u32,
                (ideal / denominator + 1) as u32,
            ] {
                if divisor == 0 || divisor > 0xFFFF {
                    continue;
                }
                if div_add != 0 && divisor < 3 {
                    continue;
                }

                let candidate = FractionalDivisor {
                    divisor: divisor as u16,
                    mul: mul as u8,
                    div_add: div_add as u8,
                };
                let error = achieved_baud(pclk, candidate).abs_diff(baud);
                match best {
                    Some((best_error, _)) if best_error <= error => {}
                    _ => best = Some((error, candidate)),
                }
            }
        }
    }

    best.map(|(_, config)| config)
}

pub struct Uart<'a> {
    registers: StaticRef<UsartRegisters>,
    clock: &'a dyn PeripheralClockInterface,
    rx_buffer: Cell<Option<RingBuffer<'a>>>,
}

impl<'a> Uart<'a> {
    pub const fn new(
        registers: StaticRef<UsartRegisters>,
        clock: &'a dyn PeripheralClockInterface,
    ) -> Uart<'a> {
        Uart {
            registers,
            clock,
            rx_buffer: Cell::new(None),
        }
    }

    /// Bring the UART up at `baud`, 8N1, receiving into `rx_storage`.
    pub fn initialize(&self, baud: u32, rx_storage: &'a mut [u8]) -> Result<(), Error> {
        if rx_storage.len() < 2 || !rx_storage.len().is_power_of_two() {
            return Err(Error::OutOfMemory);
        }

        self.clock.enable();

        let config = compute_fractional_divisor(self.clock.frequency(), baud)
            .ok_or(Error::TimingInfeasible)?;

        // Program the divisor latch behind DLAB, then lock it back out.
        self.registers
            .lcr
            .write(LCR::WORD_LENGTH::EightBits + LCR::DLAB::SET);
        self.registers.rbr_thr_dll.set(config.divisor as u32 & 0xFF);
        self.registers.ier_dlm.set((config.divisor as u32) >> 8);
        self.registers.fdr.write(
            FDR::MULVAL.val(config.mul as u32) + FDR::DIVADDVAL.val(config.div_add as u32),
        );
        self.registers.lcr.write(LCR::WORD_LENGTH::EightBits);

        self.registers.iir_fcr.write(
            FCR::FIFO_ENABLE::SET + FCR::RX_FIFO_RESET::SET + FCR::TX_FIFO_RESET::SET,
        );

        self.rx_buffer.set(Some(RingBuffer::new(rx_storage)));

        // Strictly last: only once the ring buffer exists may the receive
        // interrupt start delivering data.
        self.registers.ier_dlm.write(IER::RBR::SET);

        Ok(())
    }

    /// Blockingly transmit one byte.
    pub fn transmit_byte(&self, byte: u8) {
        while !self.registers.lsr.is_set(LSR::THRE) {}
        self.registers.rbr_thr_dll.set(byte as u32);
    }

    pub fn transmit(&self, data: &[u8]) {
        for &byte in data {
            self.transmit_byte(byte);
        }
    }

    /// The oldest received byte, if any.
    pub fn receive_byte(&self) -> Option<u8> {
        let mut buffer = self.rx_buffer.take()?;
        let byte = buffer.dequeue();
        self.rx_buffer.set(Some(buffer));
        byte
    }

    /// Bytes waiting in the receive ring.
    pub fn bytes_available(&self) -> usize {
        match self.rx_buffer.take() {
            Some(buffer) => {
                let available = buffer.available();
                self.rx_buffer.set(Some(buffer));
                available
            }
            None => 0,
        }
    }

    /// Service routine body: drain the receive FIFO into the ring buffer,
    /// overwriting the oldest data on overflow.
    pub fn handle_interrupt(&self) {
        if let Some(mut buffer) = self.rx_buffer.take() {
            while self.registers.lsr.is_set(LSR::RDR) {
                buffer.enqueue_overwrite(self.registers.rbr_thr_dll.get() as u8);
            }
            self.rx_buffer.set(Some(buffer));
        }
    }

    /// Stop the receive interrupt and release the clock.
    pub fn shutdown(&self) {
        self.registers.ier_dlm.modify(IER::RBR::CLEAR);
        self.clock.disable();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn standard_bauds_are_within_one_percent() {
        // Exhaustively sweep the usual rates against plausible peripheral
        // clocks; the fractional divider must land within 1%.
        for pclk in [12_000_000u32, 96_000_000, 102_000_000, 204_000_000] {
            for baud in [9_600u32, 19_200, 38_400, 57_600, 115_200, 230_400, 921_600] {
                let config = compute_fractional_divisor(pclk, baud).unwrap();
                let achieved = achieved_baud(pclk, config);
                let error = achieved.abs_diff(baud);
                assert!(
                    error * 100 <= baud,
                    "pclk {} baud {}: achieved {} (divisor {} mul {} div {})",
                    pclk,
                    baud,
                    achieved,
                    config.divisor,
                    config.mul,
                    config.div_add
                );
            }
        }
    }

    #[test]
    fn fractional_stage_constraints_hold_for_every_result() {
        for pclk in [12_000_000u32, 204_000_000] {
            for baud in (9_600..=921_600).step_by(4_800) {
                if let Some(config) = compute_fractional_divisor(pclk, baud) {
                    assert!(config.mul >= 1 && config.mul <= 15);
                    assert!(config.div_add < config.mul);
                    if config.div_add != 0 {
                        assert!(config.divisor >= 3);
                    }
                    assert!(config.divisor >= 1);
                }
            }
        }
    }

    #[test]
    fn exact_divisions_disable_the_fractional_stage() {
        // 12 MHz / (16 * 78) = 9615; the exact 115200 from 1.8432 MHz-style
        // clocks: 29491200 / (16 * 16) = 115200.
        let config = compute_fractional_divisor(29_491_200, 115_200).unwrap();
        assert_eq!(achieved_baud(29_491_200, config), 115_200);
        assert_eq!(config.div_add, 0);
    }
}
