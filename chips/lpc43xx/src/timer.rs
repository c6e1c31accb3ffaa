// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! General-purpose timers, and the microsecond platform timer.
//!
//! TIMER3 is claimed at clock bring-up as the platform timer: a free-running
//! microsecond counter behind [`PLATFORM_TIMER`] that the clock driver uses
//! for bounded busy-waits. The remaining timers are handed out through a
//! small reservation pool.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use cortexm4::{StaticRef, VolatileCell};

register_structs! {
    pub TimerRegisters {
        /// Interrupt register; write ones to clear match/capture flags.
        (0x00 => ir: ReadWrite<u32>),
        /// Timer control: counter enable and reset.
        (0x04 => tcr: ReadWrite<u32, CONTROL::Register>),
        /// Timer counter.
        (0x08 => tc: ReadWrite<u32>),
        /// Prescale register.
        (0x0c => pr: ReadWrite<u32>),
        /// Prescale counter.
        (0x10 => pc: ReadWrite<u32>),
        /// Match control: interrupt/reset/stop on match.
        (0x14 => mcr: ReadWrite<u32>),
        /// Match registers.
        (0x18 => mr: [ReadWrite<u32>; 4]),
        /// Capture control.
        (0x28 => ccr: ReadWrite<u32>),
        /// Capture registers.
        (0x2c => cr: [ReadOnly<u32>; 4]),
        /// External match register.
        (0x3c => emr: ReadWrite<u32>),
        (0x40 => _reserved0),
        /// Count control: timer vs. counter mode.
        (0x70 => ctcr: ReadWrite<u32>),
        (0x74 => @END),
    }
}

register_bitfields![u32,
    CONTROL [
        ENABLE OFFSET(0) NUMBITS(1) [],
        RESET OFFSET(1) NUMBITS(1) []
    ]
];

pub const TIMER0_BASE: StaticRef<TimerRegisters> =
    unsafe { StaticRef::new(0x4008_4000 as *const TimerRegisters) };
pub const TIMER1_BASE: StaticRef<TimerRegisters> =
    unsafe { StaticRef::new(0x4008_5000 as *const TimerRegisters) };
pub const TIMER2_BASE: StaticRef<TimerRegisters> =
    unsafe { StaticRef::new(0x400C_3000 as *const TimerRegisters) };
pub const TIMER3_BASE: StaticRef<TimerRegisters> =
    unsafe { StaticRef::new(0x400C_4000 as *const TimerRegisters) };

/// Tick rate of the platform timer.
pub const MICROSECONDS_PER_SECOND: u32 = 1_000_000;

// MCR bits for match register 0.
const MCR_MR0_INTERRUPT: u32 = 1 << 0;
const MCR_MR0_RESET: u32 = 1 << 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerIndex {
    Timer0 = 0,
    Timer1 = 1,
    Timer2 = 2,
    Timer3 = 3,
}

static TIMERS_IN_USE: [AtomicBool; 4] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

/// Reserve a timer nothing else is using.
pub fn reserve_free_timer() -> Option<TimerIndex> {
    const INDICES: [TimerIndex; 4] = [
        TimerIndex::Timer0,
        TimerIndex::Timer1,
        TimerIndex::Timer2,
        TimerIndex::Timer3,
    ];
    for index in INDICES {
        if TIMERS_IN_USE[index as usize]
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return Some(index);
        }
    }
    None
}

/// Return a timer reserved with [`reserve_free_timer`] to the pool.
pub fn release_timer(index: TimerIndex) {
    TIMERS_IN_USE[index as usize].store(false, Ordering::Relaxed);
}

/// One general-purpose timer peripheral.
pub struct Timer {
    registers: StaticRef<TimerRegisters>,
    tick_frequency: Cell<u32>,
    interval_callback: Cell<Option<fn()>>,
}

impl Timer {
    pub const fn new(registers: StaticRef<TimerRegisters>) -> Timer {
        Timer {
            registers,
            tick_frequency: Cell::new(0),
            interval_callback: Cell::new(None),
        }
    }

    /// Stop the timer and clear its counters. Does not configure or enable.
    pub fn initialize(&self) {
        self.registers.tcr.write(CONTROL::RESET::SET);
        self.registers.tcr.set(0);
        self.registers.pr.set(0);
        self.registers.mcr.set(0);
        self.registers.ir.set(!0);
    }

    /// Program the prescaler so the counter ticks at `tick_frequency`.
    pub fn set_tick_frequency(&self, input_frequency: u32, tick_frequency: u32) {
        let prescale = input_frequency / tick_frequency;
        self.registers.pr.set(prescale.saturating_sub(1));
        self.tick_frequency.set(tick_frequency);
    }

    pub fn enable(&self) {
        self.registers.tcr.write(CONTROL::ENABLE::SET);
    }

    pub fn disable(&self) {
        self.registers.tcr.set(0);
    }

    pub fn value(&self) -> u32 {
        self.registers.tc.get()
    }

    /// Call `callback` every time the counter passes `interval_ticks`.
    /// The caller routes this timer's interrupt to [`Timer::handle_interrupt`].
    pub fn call_periodically(&self, interval_ticks: u32, callback: fn()) {
        self.interval_callback.set(Some(callback));
        self.registers.mr[0].set(interval_ticks);
        self.registers.mcr.set(MCR_MR0_INTERRUPT | MCR_MR0_RESET);
    }

    /// Cancel all periodic callbacks on this timer.
    pub fn cancel_periodic_calls(&self) {
        self.registers.mcr.set(0);
        self.interval_callback.set(None);
    }

    /// Service routine body for this timer's interrupt.
    pub fn handle_interrupt(&self) {
        self.registers.ir.set(!0);
        if let Some(callback) = self.interval_callback.get() {
            callback();
        }
    }
}

/// The free-running microsecond timebase.
///
/// Brought up once during early clock initialization and never released;
/// counts microseconds from that point, wrapping roughly once per hour.
pub struct PlatformTimer {
    registers: StaticRef<TimerRegisters>,
    input_frequency: VolatileCell<u32>,
}

// Configured once from the foreground during early init; afterwards only
// read. The counter itself lives in hardware.
unsafe impl Sync for PlatformTimer {}

pub static PLATFORM_TIMER: PlatformTimer = PlatformTimer::new(TIMER3_BASE);

impl PlatformTimer {
    pub const fn new(registers: StaticRef<TimerRegisters>) -> PlatformTimer {
        PlatformTimer {
            registers,
            input_frequency: VolatileCell::new(0),
        }
    }

    /// Start counting microseconds, given the timer branch clock frequency.
    pub fn set_up(&self, input_frequency: u32) {
        TIMERS_IN_USE[TimerIndex::Timer3 as usize].store(true, Ordering::Relaxed);
        self.input_frequency.set(input_frequency);

        self.registers.tcr.write(CONTROL::RESET::SET);
        self.registers.tcr.set(0);
        self.registers
            .pr
            .set((input_frequency / MICROSECONDS_PER_SECOND).saturating_sub(1));
        self.registers.tcr.write(CONTROL::ENABLE::SET);
    }

    pub fn is_up(&self) -> bool {
        self.input_frequency.get() != 0
    }

    /// Microseconds since `set_up`.
    pub fn now(&self) -> u32 {
        self.registers.tc.get()
    }

    /// Microseconds elapsed since a reference `now()` value.
    pub fn elapsed_since(&self, base: u32) -> u32 {
        self.now().wrapping_sub(base)
    }

    /// Block for `duration` microseconds.
    pub fn delay_us(&self, duration: u32) {
        let base = self.now();
        while self.elapsed_since(base) < duration {}
    }

    /// Re-derive the prescaler after the timer branch clock changed.
    pub fn handle_clock_frequency_change(&self, new_input_frequency: u32) {
        if !self.is_up() {
            return;
        }
        self.input_frequency.set(new_input_frequency);
        self.registers
            .pr
            .set((new_input_frequency / MICROSECONDS_PER_SECOND).saturating_sub(1));
    }
}

/// Microsecond timebase as the clock driver consumes it.
pub trait Time {
    fn now(&self) -> u32;
    fn elapsed_since(&self, base: u32) -> u32;
    fn delay_us(&self, duration: u32);
}

impl Time for PlatformTimer {
    fn now(&self) -> u32 {
        PlatformTimer::now(self)
    }

    fn elapsed_since(&self, base: u32) -> u32 {
        PlatformTimer::elapsed_since(self, base)
    }

    fn delay_us(&self, duration: u32) {
        PlatformTimer::delay_us(self, duration)
    }
}

/// Observer the clock driver invokes when the timer branch clock changes.
pub fn platform_timer_frequency_observer(new_frequency: u32) {
    PLATFORM_TIMER.handle_clock_frequency_change(new_frequency);
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn fake_timer_registers() -> StaticRef<TimerRegisters> {
        let mem = std::vec![0u32; 0x74 / 4].into_boxed_slice();
        unsafe { StaticRef::new(std::boxed::Box::leak(mem).as_ptr() as *const TimerRegisters) }
    }

    #[test]
    fn platform_timer_prescales_to_microseconds() {
        let timer = PlatformTimer::new(fake_timer_registers());
        timer.set_up(204_000_000);
        assert_eq!(timer.registers.pr.get(), 203);
        assert!(timer.is_up());

        timer.handle_clock_frequency_change(12_000_000);
        assert_eq!(timer.registers.pr.get(), 11);
    }

    #[test]
    fn elapsed_since_handles_wraparound() {
        let timer = PlatformTimer::new(fake_timer_registers());
        timer.registers.tc.set(5);
        assert_eq!(timer.elapsed_since(u32::MAX - 4), 10);
    }

    #[test]
    fn periodic_callback_fires_from_interrupt() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn on_interval() {
            FIRED.fetch_add(1, Ordering::Relaxed);
        }

        let timer = Timer::new(fake_timer_registers());
        timer.initialize();
        timer.set_tick_frequency(12_000_000, 1_000_000);
        assert_eq!(timer.registers.pr.get(), 11);

        timer.call_periodically(1000, on_interval);
        assert_eq!(timer.registers.mr[0].get(), 1000);
        timer.handle_interrupt();
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        timer.cancel_periodic_calls();
        timer.handle_interrupt();
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
    }
}
