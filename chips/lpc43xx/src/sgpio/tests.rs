// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Planner tests against a fake register bank.

extern crate std;

use std::boxed::Box;
use std::vec;
use std::vec::Vec;

use super::*;
use crate::clocks::PeripheralClockInterface;
use crate::scu::{ScuRegisters, Scu};
use cortexm4::nvic::{Nvic, NvicRegisters, VectorTable};

struct FakeClock(u32);

impl PeripheralClockInterface for FakeClock {
    fn enable(&self) {}
    fn disable(&self) {}
    fn frequency(&self) -> u32 {
        self.0
    }
}

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

fn leaked_bytes(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

fn fake_sgpio(
    functions: &'static [Function<'static>],
    clock_hz: u32,
) -> &'static Sgpio<'static> {
    let registers = unsafe {
        StaticRef::new(
            Box::leak(vec![0u32; 0xf80 / 4].into_boxed_slice()).as_ptr() as *const SgpioRegisters
        )
    };
    let scu_registers = unsafe {
        StaticRef::new(
            Box::leak(vec![0u32; 0xc10 / 4].into_boxed_slice()).as_ptr() as *const ScuRegisters
        )
    };
    let nvic_registers = unsafe {
        StaticRef::new(
            Box::leak(vec![0u32; 0xe04 / 4].into_boxed_slice()).as_ptr() as *const NvicRegisters
        )
    };

    let scu = leak(Scu::new(scu_registers));
    let vectors = leak(VectorTable::new());
    let nvic = leak(Nvic::new(nvic_registers, vectors));
    let clock = leak(FakeClock(clock_hz));
    let shuttle = leak(isr::DataShuttleIsr::new());

    leak(Sgpio::new(registers, scu, clock, nvic, shuttle, functions))
}

const fn pin(sgpio_pin: u8, scu_group: u8, scu_pin: u8) -> PinConfiguration {
    PinConfiguration {
        sgpio_pin,
        scu_group,
        scu_pin,
        pull_resistors: PinResistors::None,
    }
}

// Routable pads for SGPIO0..7 and SGPIO8.
const PINS_0_TO_7: [PinConfiguration; 8] = [
    pin(0, 0, 0),
    pin(1, 0, 1),
    pin(2, 1, 15),
    pin(3, 1, 16),
    pin(4, 2, 0),
    pin(5, 2, 1),
    pin(6, 2, 2),
    pin(7, 2, 6),
];
const PIN8: PinConfiguration = pin(8, 1, 12);

#[test]
fn clock_generation_uses_the_clockgen_slice_and_no_isr() {
    let function = Function::new(
        Mode::ClockGeneration,
        leak([PIN8]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        10_000_000,
    );
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();

    let function = &sgpio.functions[0];
    // Pin 8 maps to slice A in the clock-generation table.
    assert_eq!(function.io_slice(), SLICE_A);
    assert_eq!(function.shift_clock_frequency(), 10_000_000);
    assert_eq!(
        sgpio.registers.cycles_per_shift_clock[SLICE_A as usize].get(),
        19
    );
    assert_eq!(sgpio.swap_irqs_required(), 0);

    // The output pin produces the slice clock and is driven.
    assert_eq!(
        sgpio.registers.output_configuration[8].read(OUTPUT_CONFIG::BUS_MODE),
        OUTPUT_MODE_CLOCK_OUT
    );
    assert_eq!(sgpio.registers.pin_direction.get() & (1 << 8), 1 << 8);

    sgpio.run();
    assert_eq!(
        sgpio.registers.shift_clock_enable.get(),
        1 << SLICE_A as u32
    );
    assert_eq!(sgpio.registers.exchange_clock_interrupt.enable.get(), 0);
    assert!(sgpio.running());

    sgpio.halt();
    assert_eq!(sgpio.registers.shift_clock_enable.get(), 0);
    assert!(!sgpio.running());
}

#[test]
fn serial_stream_in_grows_to_four_slices_and_installs_an_isr() {
    let function = Function::new(
        Mode::StreamIn,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    function.set_buffer(leaked_bytes(16));
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();

    let function = &sgpio.functions[0];
    assert_eq!(function.io_slice(), SLICE_A);
    // A 16-byte buffer fills four slices.
    assert_eq!(function.buffer_depth_order(), 2);
    assert_eq!(sgpio.swap_irqs_required(), 1 << SLICE_A);

    // The input boundary takes pin input; every chained slice concatenates
    // at order log2(4).
    assert_eq!(
        sgpio.registers.shift_configuration[SLICE_A as usize]
            .read(SHIFT_CONFIG::CONCAT_ENABLE),
        0
    );
    for slice in [SLICE_I, SLICE_E, SLICE_J] {
        assert_eq!(
            sgpio.registers.shift_configuration[slice as usize]
                .read(SHIFT_CONFIG::CONCAT_ENABLE),
            1
        );
        assert_eq!(
            sgpio.registers.shift_configuration[slice as usize]
                .read(SHIFT_CONFIG::CONCAT_ORDER),
            2
        );
    }

    // Every chained slice swaps after 128 one-bit shifts.
    for slice in [SLICE_A, SLICE_I, SLICE_E, SLICE_J] {
        assert_eq!(
            sgpio.registers.swap_control[slice as usize].read(SWAP_CONTROL::SHIFTS_PER_SWAP),
            127
        );
    }

    // The generated body drains the chain deepest-first into successive
    // buffer words.
    let body = &sgpio.shuttle.body_for_test();
    assert_eq!(body[0], isr::encode_ldr(0, 1, 4 * SLICE_J as u16));
    assert_eq!(body[1], isr::encode_str(0, 2, 0));
    assert_eq!(body[6], isr::encode_ldr(0, 1, 0));
    assert_eq!(body[7], isr::encode_str(0, 2, 12));

    // The SGPIO vector now points at the synthesized routine.
    assert_eq!(
        sgpio.interrupt_controller.handler(interrupts::SGPIO) as usize,
        sgpio.shuttle.handler() as usize
    );

    sgpio.run();
    assert_eq!(
        sgpio.registers.exchange_clock_interrupt.enable.get(),
        1 << SLICE_A as u32
    );
}

#[test]
fn fixed_pattern_fits_in_slice_buffers_without_an_isr() {
    let function = Function::new(
        Mode::FixedOut,
        leak(PINS_0_TO_7),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    let buffer = leaked_bytes(8);
    for (index, byte) in buffer.iter_mut().enumerate() {
        *byte = (index + 1) as u8;
    }
    function.set_buffer(buffer);
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();

    let function = &sgpio.functions[0];
    assert_eq!(function.io_slice(), SLICE_A);
    // Data plus shadow hold the whole 8-byte pattern in one slice.
    assert_eq!(function.buffer_depth_order(), 0);
    assert_eq!(sgpio.swap_irqs_required(), 0);

    for pin_config in &PINS_0_TO_7 {
        let config = &sgpio.registers.output_configuration[pin_config.sgpio_pin as usize];
        assert_eq!(config.read(OUTPUT_CONFIG::BUS_MODE), OUTPUT_MODE_8BIT_A);
        assert_eq!(
            config.read(OUTPUT_CONFIG::DIRECTION_SOURCE),
            DIRECTION_SOURCE_REGISTER
        );
    }
    assert_eq!(sgpio.registers.pin_direction.get() & 0xFF, 0xFF);

    sgpio.run();
    // Both buffer halves were preloaded: the pattern cycles on its own.
    assert_eq!(sgpio.registers.data[SLICE_A as usize].get(), 0x0403_0201);
    assert_eq!(sgpio.registers.data_shadow[SLICE_A as usize].get(), 0x0807_0605);
    assert_eq!(sgpio.registers.exchange_clock_interrupt.enable.get(), 0);
}

#[test]
fn three_bit_buses_promote_to_four_bits_with_write_back() {
    let function = Function::new(
        Mode::StreamOut,
        leak([PINS_0_TO_7[0], PINS_0_TO_7[1], PINS_0_TO_7[2]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    function.set_buffer(leaked_bytes(64));
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();

    let function = &sgpio.functions[0];
    assert_eq!(function.bus_width(), 4);
    assert_eq!(
        sgpio.registers.feature_control[function.io_slice() as usize]
            .read(FEATURE_CONTROL::PARALLEL_MODE),
        2 // four-bit
    );
}

#[test]
fn shift_limit_reprograms_the_whole_chain_and_skips_the_isr() {
    let function = Function::new(
        Mode::StreamIn,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    function.set_buffer(leaked_bytes(1024));
    function.set_shift_count_limit(100);
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();

    let function = &sgpio.functions[0];
    // A 1024-byte buffer saturates the chain-depth cap of eight slices.
    assert_eq!(function.buffer_depth_order(), 3);
    // The whole capture fits the chain, so no swap interrupt is needed.
    assert_eq!(sgpio.swap_irqs_required(), 0);

    let chain: Vec<u8> = (0..8)
        .map(|depth| slice_in_concatenation(SLICE_A, depth).unwrap())
        .collect();
    for &slice in &chain {
        let swap = &sgpio.registers.swap_control[slice as usize];
        assert_eq!(swap.read(SWAP_CONTROL::SHIFTS_PER_SWAP), 0);
        assert_eq!(swap.read(SWAP_CONTROL::SHIFTS_REMAINING), 99);
        assert_ne!(
            sgpio.registers.stop_on_next_buffer_swap.get() & (1 << slice),
            0
        );
    }

    sgpio.run();
    assert!(sgpio.running());

    // Let the limit expire: divisor counters drained on every chained slice,
    // with the capture waiting in the shadow registers.
    for &slice in &chain {
        sgpio.registers.cycle_count[slice as usize].set(0);
        sgpio.registers.data_shadow[slice as usize].set(0x5A5A_5A5A);
    }
    assert!(!sgpio.running());

    sgpio.halt();
    // 100 single-bit shifts produce 12 whole bytes of residue.
    assert_eq!(function.data_in_buffer(), 12);
    assert_eq!(function.position_in_buffer(), 12);
}

#[test]
fn conflicting_pin_claims_fail_with_busy() {
    let first = Function::new(
        Mode::StreamIn,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    first.set_buffer(leaked_bytes(16));
    let second = Function::new(
        Mode::StreamOut,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    second.set_buffer(leaked_bytes(16));

    let sgpio = fake_sgpio(leak([first, second]), 200_000_000);

    assert_eq!(sgpio.set_up_functions(), Err(Error::Busy));
    // The first function's claims stand; nothing is shifting or pending.
    assert_eq!(sgpio.pins_in_use() & 1, 1);
    assert_ne!(sgpio.slices_in_use() & (1 << SLICE_A), 0);
    assert_eq!(sgpio.registers.shift_clock_enable.get(), 0);
}

#[test]
fn unknown_pin_routings_fail_with_invalid_pin_mapping() {
    let function = Function::new(
        Mode::StreamIn,
        leak([pin(0, 5, 5)]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    function.set_buffer(leaked_bytes(16));
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    assert_eq!(sgpio.set_up_functions(), Err(Error::InvalidPinMapping));
}

#[test]
fn zero_frequency_requests_the_undivided_branch_clock() {
    let function = Function::new(
        Mode::StreamIn,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        0,
    );
    function.set_buffer(leaked_bytes(16));
    let sgpio = fake_sgpio(leak([function]), 204_000_000);

    sgpio.set_up_functions().unwrap();

    let function = &sgpio.functions[0];
    assert_eq!(function.shift_clock_frequency(), 204_000_000);
    assert_eq!(sgpio.registers.cycles_per_shift_clock[SLICE_A as usize].get(), 0);
}

#[test]
fn overclocked_requests_fail_with_timing_infeasible() {
    let function = Function::new(
        Mode::StreamIn,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        400_000_000,
    );
    function.set_buffer(leaked_bytes(16));
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    assert_eq!(sgpio.set_up_functions(), Err(Error::TimingInfeasible));
}

#[test]
fn reconfiguration_is_idempotent() {
    let function = Function::new(
        Mode::StreamIn,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    function.set_buffer(leaked_bytes(16));
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();
    let snapshot = |sgpio: &Sgpio| -> Vec<u32> {
        let mut image = Vec::new();
        for index in 0..NUM_SLICES as usize {
            image.push(sgpio.registers.shift_configuration[index].get());
            image.push(sgpio.registers.feature_control[index].get());
            image.push(sgpio.registers.swap_control[index].get());
            image.push(sgpio.registers.cycles_per_shift_clock[index].get());
        }
        image.push(sgpio.registers.pin_direction.get());
        image
    };

    let first_image = snapshot(sgpio);
    sgpio.set_up_functions().unwrap();
    assert_eq!(snapshot(sgpio), first_image);
    assert_eq!(sgpio.functions[0].buffer_depth_order(), 2);
}

#[test]
fn bidirectional_placement_reserves_a_direction_chain() {
    let function = Function::new(
        Mode::Bidirectional,
        leak([
            PINS_0_TO_7[0],
            PINS_0_TO_7[1],
            PINS_0_TO_7[2],
            PINS_0_TO_7[3],
        ]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    function.set_buffer(leaked_bytes(64));
    function.set_direction_buffer(leaked_bytes(64));
    // Another core will poll the exchange flags; never synthesize an ISR.
    function.set_overrides(OVERRIDE_NEVER_USE_ISR);
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();

    let function = &sgpio.functions[0];
    assert_eq!(function.io_slice(), SLICE_A);
    // Width-4 buses starting at pin 0 take their direction from slice H.
    assert_eq!(function.direction_slice(), SLICE_H);
    assert_eq!(
        sgpio.registers.feature_control[SLICE_H as usize]
            .read(FEATURE_CONTROL::PARALLEL_MODE),
        1 // two-bit: MSB steers every pin past the first
    );

    // The direction chain cannot extend past slice P, which caps the data
    // chain at four slices even though the buffer could feed eight.
    assert_eq!(function.buffer_depth_order(), 2);
    assert_eq!(function.direction_buffer_depth_order(), 1);
    for slice in [SLICE_A, SLICE_H, SLICE_P] {
        assert_ne!(sgpio.slices_in_use() & (1 << slice), 0);
    }

    // Direction pins hand control to the direction-mode source and start
    // tri-stated.
    for pin_config in &PINS_0_TO_7[0..4] {
        assert_eq!(
            sgpio.registers.output_configuration[pin_config.sgpio_pin as usize]
                .read(OUTPUT_CONFIG::DIRECTION_SOURCE),
            DIRECTION_MODE_4BIT
        );
    }
    assert_eq!(sgpio.registers.data[SLICE_H as usize].get(), 0);

    // No ISR was requested, so no swap interrupt is required.
    assert_eq!(sgpio.swap_irqs_required(), 0);
}

#[test]
fn shift_clock_output_claims_a_free_clockgen_slice() {
    let function = Function::new(
        Mode::StreamIn,
        leak([PINS_0_TO_7[0]]),
        ShiftClockSource::Local,
        ClockEdge::Rising,
        1_000_000,
    );
    function.set_buffer(leaked_bytes(16));
    // Mirror the shift clock on SGPIO9, whose clock-generation slice is M.
    function.set_shift_clock_output(leak(pin(9, 1, 13)));
    let sgpio = fake_sgpio(leak([function]), 200_000_000);

    sgpio.set_up_functions().unwrap();

    assert_ne!(sgpio.slices_in_use() & (1 << SLICE_M), 0);
    assert_eq!(
        sgpio.registers.cycles_per_shift_clock[SLICE_M as usize].get(),
        sgpio.registers.cycles_per_shift_clock[SLICE_A as usize].get()
    );
    assert_eq!(
        sgpio.registers.output_configuration[9].read(OUTPUT_CONFIG::BUS_MODE),
        OUTPUT_MODE_CLOCK_OUT
    );
    assert_ne!(sgpio.registers.pin_direction.get() & (1 << 9), 0);
}
