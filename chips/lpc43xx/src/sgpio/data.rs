// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Moving data between caller ring buffers and the slice registers at the
//! edges of a run: prepopulation before the shift clocks start, and
//! residual capture after they stop.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;

use cortexm4::StaticRef;

use super::{buffer_slice_index, slice_in_concatenation, Function, Mode, SgpioRegisters};
use super::SWAP_CONTROL;
use crate::log_warn;

/// Load initial data into the slice chains of every output-capable
/// function. Called with the shift clocks stopped, immediately before they
/// are enabled.
pub(crate) fn prepopulate(registers: StaticRef<SgpioRegisters>, functions: &[Function]) {
    for function in functions {
        if !function.enabled.get() || !function.mode.produces_output() {
            continue;
        }

        if function.mode == Mode::Bidirectional {
            prepopulate_direction_slices(registers, function, false);
            prepopulate_direction_slices(registers, function, true);
        }

        // Both halves of the double buffer get real data: the data register
        // shifts first, the shadow follows at the first swap.
        prepopulate_function_buffer(function, &registers.data);
        prepopulate_function_buffer(function, &registers.data_shadow);
    }
}

/// Fill one register half of a function's chain from its ring buffer,
/// deepest chain position first.
fn prepopulate_function_buffer(function: &Function, target_registers: &[ReadWrite<u32>; 16]) {
    let buffer_size_bytes = function.buffer_size_bytes();

    let mut current_word_index = function.chain_length() as u32;
    while current_word_index > 0 {
        current_word_index -= 1;

        // Wrapping here both honors a nonzero starting position and repeats
        // short buffers across longer chains.
        let position = function.position_in_buffer.get() % buffer_size_bytes;
        let word = unsafe {
            core::ptr::read_unaligned(function.buffer.get().add(position as usize) as *const u32)
        };

        if let Some(slice) = buffer_slice_index(function, current_word_index) {
            target_registers[slice as usize].set(word);
        }

        function
            .position_in_buffer
            .set(function.position_in_buffer.get() + 4);
    }
}

/// Fill a bidirectional function's direction chain from its direction ring
/// buffer.
///
/// The direction fabric shifts one bit per data shift on serial buses and
/// two on parallel ones, so the bytes each slice consumes per swap follow
/// from the chain's shifts-per-swap rather than from the slice width; a
/// partial-word tail is expanded into a full register.
fn prepopulate_direction_slices(
    registers: StaticRef<SgpioRegisters>,
    function: &Function,
    shadow: bool,
) {
    let buffer_size_bytes = 1u32 << function.direction_buffer_order.get();
    let direction_bits_per_swap =
        function.shifts_per_swap() * function.direction_shift_width() as u32;
    let mut remaining_bytes = direction_bits_per_swap.div_ceil(8);

    let chain_length = 1u8 << function.direction_buffer_depth_order.get();
    for depth in 0..chain_length {
        if remaining_bytes == 0 {
            break;
        }
        let slice = match slice_in_concatenation(function.direction_slice.get(), depth) {
            Some(slice) => slice,
            None => break,
        };

        let bytes_this_slice = remaining_bytes.min(4);
        let mut word = 0u32;
        for byte in 0..bytes_this_slice {
            let position =
                function.position_in_direction_buffer.get() % buffer_size_bytes;
            let value =
                unsafe { *function.direction_buffer.get().add(position as usize) };
            word |= (value as u32) << (8 * byte);
            function
                .position_in_direction_buffer
                .set(function.position_in_direction_buffer.get() + 1);
        }

        if shadow {
            registers.data_shadow[slice as usize].set(word);
        } else {
            registers.data[slice as usize].set(word);
        }
        remaining_bytes -= bytes_this_slice;
    }
}

/// Recover whatever capture data is still sitting in the slice chains after
/// the shift clocks stop.
pub(crate) fn capture_remaining(registers: StaticRef<SgpioRegisters>, functions: &[Function]) {
    for function in functions {
        if !function.enabled.get() || !function.mode.consumes_input() {
            continue;
        }
        if function.mode == Mode::Bidirectional {
            log_warn!("sgpio: residual capture for bidirectional functions is not supported");
            continue;
        }
        capture_remaining_for_function(registers, function);
    }
}

fn capture_remaining_for_function(registers: StaticRef<SgpioRegisters>, function: &Function) {
    let io_slice = function.io_slice.get() as usize;

    // A shift-limited chain parks with its swap counter zeroed and its
    // divisor counter drained, having swapped the capture into the shadow
    // registers as it stopped. Any other halt is a manual one: the partial
    // capture still sits in the live data registers, and recovering it is
    // deliberately not attempted.
    let limit_terminated = registers.swap_control[io_slice].read(SWAP_CONTROL::SHIFTS_PER_SWAP)
        == 0
        && registers.cycle_count[io_slice].get() == 0;
    if !limit_terminated {
        return;
    }

    let residual_bytes =
        function.shift_count_limit.get() * function.bus_width.get() as u32 / 8;
    let buffer_size_bytes = function.buffer_size_bytes();

    for byte_index in 0..residual_bytes {
        let word_in_chain = byte_index / 4;
        let slice = match buffer_slice_index(function, word_in_chain) {
            Some(slice) => slice,
            None => break,
        };

        let byte_in_slice = 3 - (byte_index % 4);
        let value = (registers.data_shadow[slice as usize].get() >> (8 * byte_in_slice)) as u8;

        let position = function.position_in_buffer.get() % buffer_size_bytes;
        unsafe {
            *function.buffer.get().add(position as usize) = value;
        }
        function
            .position_in_buffer
            .set(function.position_in_buffer.get() + 1);
        function.data_in_buffer.set(function.data_in_buffer.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::scu::PinResistors;
    use crate::sgpio::{
        ClockEdge, PinConfiguration, ShiftClockSource, SLICE_A, SLICE_I,
    };
    use tock_registers::interfaces::Writeable;

    const PIN0: PinConfiguration = PinConfiguration {
        sgpio_pin: 0,
        scu_group: 0,
        scu_pin: 0,
        pull_resistors: PinResistors::None,
    };

    fn fake_registers() -> StaticRef<SgpioRegisters> {
        let mem = std::vec![0u32; 0xf80 / 4].into_boxed_slice();
        unsafe { StaticRef::new(std::boxed::Box::leak(mem).as_ptr() as *const SgpioRegisters) }
    }

    fn leaked_function(mode: Mode, depth_order: u8, buffer: &'static mut [u8]) -> Function<'static> {
        let function = Function::new(
            mode,
            std::boxed::Box::leak(std::boxed::Box::new([PIN0])),
            ShiftClockSource::Local,
            ClockEdge::Rising,
            1_000_000,
        );
        function.set_buffer(buffer);
        function.io_slice.set(SLICE_A);
        function.buffer_depth_order.set(depth_order);
        function
    }

    #[test]
    fn prepopulate_fills_data_then_shadow() {
        let registers = fake_registers();
        let buffer = std::boxed::Box::leak(
            std::vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88].into_boxed_slice(),
        );
        let function = leaked_function(Mode::StreamOut, 1, buffer);
        let functions = [function];

        prepopulate(registers, &functions);

        // Chain A, I with the output rotation: chain word 1 -> slice A,
        // chain word 0 -> slice I. Data takes the first two buffer words,
        // shadow repeats the (wrapped) buffer for the next swap.
        assert_eq!(registers.data[SLICE_A as usize].get(), 0x44332211);
        assert_eq!(registers.data[SLICE_I as usize].get(), 0x88776655);
        assert_eq!(registers.data_shadow[SLICE_A as usize].get(), 0x44332211);
        assert_eq!(registers.data_shadow[SLICE_I as usize].get(), 0x88776655);
        assert_eq!(functions[0].position_in_buffer.get(), 16);
    }

    #[test]
    fn fixed_pattern_single_slice_splits_across_data_and_shadow() {
        let registers = fake_registers();
        let buffer = std::boxed::Box::leak(
            std::vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08].into_boxed_slice(),
        );
        let function = leaked_function(Mode::FixedOut, 0, buffer);
        let functions = [function];

        prepopulate(registers, &functions);

        // One slice: the data register holds the first word and the shadow
        // the second, so the whole 8-byte pattern cycles with no ISR.
        assert_eq!(registers.data[SLICE_A as usize].get(), 0x04030201);
        assert_eq!(registers.data_shadow[SLICE_A as usize].get(), 0x08070605);
    }

    #[test]
    fn capture_recovers_shift_limited_residue() {
        let registers = fake_registers();
        let buffer = std::boxed::Box::leak(std::vec![0u8; 1024].into_boxed_slice());
        let function = leaked_function(Mode::StreamIn, 3, buffer);
        function.set_shift_count_limit(100);
        let functions = [function];

        // Shift-limit termination: swap counter zeroed, divisor drained,
        // capture sitting in the shadow registers.
        registers.swap_control[SLICE_A as usize].write(SWAP_CONTROL::SHIFTS_PER_SWAP.val(0));
        registers.cycle_count[SLICE_A as usize].set(0);
        for depth in 0..8u32 {
            if let Some(slice) = slice_in_concatenation(SLICE_A, depth as u8) {
                registers.data_shadow[slice as usize].set(0xA0B0C0D0 + depth);
            }
        }

        capture_remaining(registers, &functions);

        // 100 one-bit shifts produce 12 whole bytes, big-endian within each
        // slice word.
        assert_eq!(functions[0].data_in_buffer.get(), 12);
        assert_eq!(functions[0].position_in_buffer.get(), 12);
        let expected_first_word = [0xA0, 0xB0, 0xC0, 0xD0];
        assert_eq!(&buffer_slicer(&functions[0])[0..4], &expected_first_word);
    }

    // Read back the first bytes of the function's buffer.
    fn buffer_slicer<'a, 'b>(function: &'a Function<'b>) -> &'b [u8] {
        unsafe { core::slice::from_raw_parts(function.buffer.get(), 16) }
    }

    #[test]
    fn manual_halt_leaves_the_buffer_untouched() {
        let registers = fake_registers();
        let buffer = std::boxed::Box::leak(std::vec![0u8; 64].into_boxed_slice());
        let function = leaked_function(Mode::StreamIn, 0, buffer);
        function.set_shift_count_limit(100);
        let functions = [function];

        // Swap counter still loaded: this was not a shift-limit stop.
        registers.swap_control[SLICE_A as usize]
            .write(SWAP_CONTROL::SHIFTS_PER_SWAP.val(31));
        registers.data_shadow[SLICE_A as usize].set(0xFFFF_FFFF);

        capture_remaining(registers, &functions);

        assert_eq!(functions[0].data_in_buffer.get(), 0);
        assert_eq!(functions[0].position_in_buffer.get(), 0);
    }
}
