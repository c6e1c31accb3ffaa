// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Serial GPIO: a software-configurable shift-register fabric.
//!
//! The peripheral is sixteen 32-bit double-buffered shift registers
//! ("slices", lettered A through P) behind sixteen external pins. Callers
//! describe the buses they want as an array of [`Function`]s; the planner in
//! [`Sgpio::set_up_functions`] allocates slices and pins to realize them:
//!
//! * each function gets the *I/O slice* its first pin is wired to, plus the
//!   clocking, qualifier, and parallel-mode configuration it asks for;
//! * remaining free slices are then folded into the functions' buffers by
//!   repeated doubling, concatenating slices into longer shift chains so the
//!   CPU is interrupted as rarely as possible;
//! * where a function still needs CPU help to stream, a service routine
//!   specialized to the final slice layout is synthesized at run time (see
//!   [`isr`]) and installed on the SGPIO interrupt.
//!
//! `run`/`halt` start and stop the shift clocks, with buffer prepopulation
//! and residual-data capture handled in [`data`].

pub mod data;
pub mod isr;

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use cortexm4::nvic::Nvic;
use cortexm4::{StaticRef, VolatileCell};

use crate::clocks::PeripheralClockInterface;
use crate::debug::LogLevel;
use crate::interrupts;
use crate::scu::{PinResistors, Scu};
use crate::Error;
use crate::{log_debug, log_error, log_warn};

pub const NUM_PINS: u8 = 16;
pub const NUM_SLICES: u8 = 16;
pub const BITS_PER_SLICE: u8 = 32;
pub const MAX_SLICE_CHAIN_DEPTH: u8 = 8;

// Slice letters as indices into the per-slice register arrays.
pub const SLICE_A: u8 = 0;
pub const SLICE_B: u8 = 1;
pub const SLICE_C: u8 = 2;
pub const SLICE_D: u8 = 3;
pub const SLICE_E: u8 = 4;
pub const SLICE_F: u8 = 5;
pub const SLICE_G: u8 = 6;
pub const SLICE_H: u8 = 7;
pub const SLICE_I: u8 = 8;
pub const SLICE_J: u8 = 9;
pub const SLICE_K: u8 = 10;
pub const SLICE_L: u8 = 11;
pub const SLICE_M: u8 = 12;
pub const SLICE_N: u8 = 13;
pub const SLICE_O: u8 = 14;
pub const SLICE_P: u8 = 15;

/// Display letter for a slice index.
pub fn slice_name(slice: u8) -> char {
    (b'A' + slice) as char
}

//
// Register façade
//

/// Control cluster for one of the SGPIO interrupt groups.
#[repr(C)]
pub struct InterruptRegisters {
    /// Disables the interrupt for the slices with set bits.
    clear_enable: WriteOnly<u32>,
    /// Enables the interrupt for the slices with set bits.
    set_enable: WriteOnly<u32>,
    /// Direct access to the per-slice enable mask.
    enable: ReadWrite<u32>,
    /// Per-slice interrupt status.
    status: ReadOnly<u32>,
    /// Acknowledges (clears) status bits.
    clear_status: WriteOnly<u32>,
    /// Marks status bits as pending.
    set_status: WriteOnly<u32>,
    _reserved: [u32; 2],
}

register_structs! {
    pub SgpioRegisters {
        /// Per-pin output multiplexing.
        (0x000 => output_configuration: [ReadWrite<u32, OUTPUT_CONFIG::Register>; 16]),
        /// Per-slice shift multiplexing: clocking, qualifiers, concatenation.
        (0x040 => shift_configuration: [ReadWrite<u32, SHIFT_CONFIG::Register>; 16]),
        /// Per-slice ancillary features: edges, parallel modes, matching.
        (0x080 => feature_control: [ReadWrite<u32, FEATURE_CONTROL::Register>; 16]),
        /// Active half of each slice's double buffer.
        (0x0c0 => data: [ReadWrite<u32>; 16]),
        /// Shadow half of each slice's double buffer.
        (0x100 => data_shadow: [ReadWrite<u32>; 16]),
        /// Shift-clock divisor reload value, per slice.
        (0x140 => cycles_per_shift_clock: [ReadWrite<u32>; 16]),
        /// Shift-clock divisor countdown, per slice.
        (0x180 => cycle_count: [ReadWrite<u32>; 16]),
        /// Shifts-per-swap control for each slice's double buffer.
        (0x1c0 => swap_control: [ReadWrite<u32, SWAP_CONTROL::Register>; 16]),
        /// Pattern-match references.
        (0x200 => pattern_match_a: ReadWrite<u32>),
        (0x204 => pattern_match_h: ReadWrite<u32>),
        (0x208 => pattern_match_i: ReadWrite<u32>),
        (0x20c => pattern_match_p: ReadWrite<u32>),
        /// Raw pin input state.
        (0x210 => pin_state: ReadOnly<u32>),
        /// Direct pin output values (GPIO mode).
        (0x214 => pin_out: ReadWrite<u32>),
        /// Direct pin directions (GPIO mode); 1 drives the pin.
        (0x218 => pin_direction: ReadWrite<u32>),
        /// Per-slice shift clock enable.
        (0x21c => shift_clock_enable: ReadWrite<u32>),
        /// Per-slice stop-at-next-buffer-swap control.
        (0x220 => stop_on_next_buffer_swap: ReadWrite<u32>),
        (0x224 => _reserved0),
        (0xf00 => shift_clock_interrupt: InterruptRegisters),
        (0xf20 => exchange_clock_interrupt: InterruptRegisters),
        (0xf40 => pattern_match_interrupt: InterruptRegisters),
        (0xf60 => input_bit_match_interrupt: InterruptRegisters),
        (0xf80 => @END),
    }
}

const _: () = assert!(core::mem::offset_of!(SgpioRegisters, shift_configuration) == 0x040);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, feature_control) == 0x080);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, data) == 0x0c0);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, data_shadow) == 0x100);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, cycles_per_shift_clock) == 0x140);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, cycle_count) == 0x180);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, swap_control) == 0x1c0);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, pattern_match_a) == 0x200);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, stop_on_next_buffer_swap) == 0x220);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, shift_clock_interrupt) == 0xf00);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, exchange_clock_interrupt) == 0xf20);
const _: () = assert!(core::mem::offset_of!(SgpioRegisters, input_bit_match_interrupt) == 0xf60);

register_bitfields![u32,
    OUTPUT_CONFIG [
        /// What drives the pin's output value.
        BUS_MODE OFFSET(0) NUMBITS(4) [],
        /// What drives the pin's direction.
        DIRECTION_SOURCE OFFSET(4) NUMBITS(3) []
    ],
    SHIFT_CONFIG [
        /// Shift clock comes from an external pin.
        EXTERNAL_CLOCK OFFSET(0) NUMBITS(1) [],
        /// Pin selection for an external shift clock.
        CLOCK_SOURCE_PIN OFFSET(1) NUMBITS(2) [],
        /// Slice selection for a slice-sourced shift clock.
        CLOCK_SOURCE_SLICE OFFSET(3) NUMBITS(2) [],
        /// When a shift-clock edge actually shifts data.
        QUALIFIER_MODE OFFSET(5) NUMBITS(2) [],
        QUALIFIER_PIN OFFSET(7) NUMBITS(2) [],
        QUALIFIER_SLICE OFFSET(9) NUMBITS(2) [],
        /// Accept input from the concatenation network rather than the pin.
        CONCAT_ENABLE OFFSET(11) NUMBITS(1) [],
        /// log2 of the concatenated chain length.
        CONCAT_ORDER OFFSET(12) NUMBITS(2) []
    ],
    FEATURE_CONTROL [
        /// Use this slice for pattern-match triggering instead of data.
        MATCH_TRIGGER OFFSET(0) NUMBITS(1) [],
        /// Shift on the falling edge instead of the rising edge.
        SHIFT_ON_FALLING_EDGE OFFSET(1) NUMBITS(1) [],
        /// Take the shift clock from outside the slice.
        NONLOCAL_CLOCK OFFSET(2) NUMBITS(1) [],
        /// Invert the locally generated clock before outputting it.
        INVERT_OUTPUT_CLOCK OFFSET(3) NUMBITS(1) [],
        MATCH_INTERRUPT_MODE OFFSET(4) NUMBITS(2) [],
        /// Bits captured or output per shift.
        PARALLEL_MODE OFFSET(6) NUMBITS(2) [
            Serial = 0,
            TwoBit = 1,
            FourBit = 2,
            EightBit = 3
        ],
        /// Shift when the qualifier is low instead of high.
        INVERT_QUALIFIER OFFSET(8) NUMBITS(1) []
    ],
    SWAP_CONTROL [
        /// Shifts remaining until the next data/shadow swap.
        SHIFTS_REMAINING OFFSET(0) NUMBITS(8) [],
        /// Total shifts between swaps.
        SHIFTS_PER_SWAP OFFSET(8) NUMBITS(8) []
    ]
];

pub const SGPIO_BASE: StaticRef<SgpioRegisters> =
    unsafe { StaticRef::new(0x4010_1000 as *const SgpioRegisters) };

// Output bus modes.
const OUTPUT_MODE_1BIT: u32 = 0x0;
const OUTPUT_MODE_2BIT_A: u32 = 0x1;
const OUTPUT_MODE_GPIO: u32 = 0x4;
const OUTPUT_MODE_4BIT_A: u32 = 0x5;
const OUTPUT_MODE_CLOCK_OUT: u32 = 0x8;
const OUTPUT_MODE_8BIT_A: u32 = 0x9;

// Pin direction sources.
const DIRECTION_SOURCE_REGISTER: u32 = 0x0;
const DIRECTION_MODE_1BIT: u32 = 0x4;
const DIRECTION_MODE_2BIT: u32 = 0x5;
const DIRECTION_MODE_4BIT: u32 = 0x6;
const DIRECTION_MODE_8BIT: u32 = 0x7;

//
// Function description
//

/// Overall behavior of one SGPIO function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Capture data rapidly over a set of pins. Uses 1 to 8 slices.
    StreamIn,
    /// Stream data out rapidly over a set of pins. Uses 1 to 8 slices.
    StreamOut,
    /// Stream a fixed pattern out. Small patterns can often be shifted
    /// entirely from the slice buffers, with no CPU intervention at all.
    FixedOut,
    /// Stream over pins that switch between input and output under the
    /// control of a direction buffer.
    Bidirectional,
    /// Generate a clock on a single pin. This is for synthesizing a new
    /// clock, not for outputting an existing function's shift clock.
    ClockGeneration,
}

impl Mode {
    fn consumes_input(self) -> bool {
        matches!(self, Mode::StreamIn | Mode::Bidirectional)
    }

    fn produces_output(self) -> bool {
        matches!(self, Mode::StreamOut | Mode::FixedOut | Mode::Bidirectional)
    }
}

/// Which edge of the shift clock captures data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockEdge {
    Rising = 0,
    Falling = 1,
}

/// Slices that can drive another slice's shift clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockSourceSlice {
    D = 0,
    H = 1,
    O = 2,
    P = 3,
}

/// Pins that can provide an external shift clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClockSourcePin {
    Sgpio8 = 0,
    Sgpio9 = 1,
    Sgpio10 = 2,
    Sgpio11 = 3,
}

/// Where a function's shift clock comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShiftClockSource {
    /// Generated by the slice's own counter.
    Local,
    /// Taken from another slice's clock.
    Slice(ClockSourceSlice),
    /// Taken from an SGPIO pin.
    Pin(ClockSourcePin),
}

/// Slice pairs usable as shift qualifiers. The first slice in each name is
/// preferred; the second is substituted when the first is the active slice.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QualifierSlice {
    AOrD = 0,
    HOrO = 1,
    IOrD = 2,
    POrO = 3,
}

/// Pins usable as shift qualifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QualifierPin {
    Sgpio8 = 0,
    Sgpio9 = 1,
    Sgpio10 = 2,
    Sgpio11 = 3,
}

/// Condition gating each shift-clock edge.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShiftQualifier {
    /// Shift on every shift-clock edge.
    Always,
    /// Never shift.
    Never,
    /// Shift while the selected slice outputs a logic one.
    Slice(QualifierSlice),
    /// Shift while the selected pin reads a logic one.
    Pin(QualifierPin),
}

impl ShiftQualifier {
    fn mode_value(self) -> u32 {
        match self {
            ShiftQualifier::Always => 0,
            ShiftQualifier::Never => 1,
            ShiftQualifier::Slice(_) => 2,
            ShiftQualifier::Pin(_) => 3,
        }
    }

    fn select_value(self) -> u32 {
        match self {
            ShiftQualifier::Slice(slice) => slice as u32,
            ShiftQualifier::Pin(pin) => pin as u32,
            _ => 0,
        }
    }
}

/// Prevent the planner from ever synthesizing an ISR for a function, even
/// when one would normally be required. Useful when another core polls the
/// exchange status itself.
pub const OVERRIDE_NEVER_USE_ISR: u32 = 1 << 0;

/// Routing for one SGPIO pin: which chip pad maps to it, and how the pad is
/// terminated.
#[derive(Copy, Clone, Debug)]
pub struct PinConfiguration {
    pub sgpio_pin: u8,
    pub scu_group: u8,
    pub scu_pin: u8,
    pub pull_resistors: PinResistors,
}

/// One logical bus to be realized on the SGPIO fabric.
///
/// Callers fill in the description, hand an array of these to
/// [`Sgpio::set_up_functions`], and read the `io_slice`, buffer-depth, and
/// achieved-frequency fields back afterwards.
pub struct Function<'a> {
    enabled: Cell<bool>,
    mode: Mode,

    /// The pins composing the bus: `bus_width` entries, contiguous and
    /// ascending, with the first pin number divisible by the bus width.
    pin_configurations: &'a [PinConfiguration],
    bus_width: Cell<u8>,

    shift_clock_source: ShiftClockSource,
    shift_clock_edge: ClockEdge,
    /// Routing for an externally provided shift clock.
    shift_clock_input: Cell<Option<&'a PinConfiguration>>,
    /// Requested frequency for a generated clock, in Hz; zero means as fast
    /// as possible. Written back with the frequency actually achieved.
    shift_clock_frequency: Cell<u32>,

    shift_clock_qualifier: Cell<ShiftQualifier>,
    shift_clock_qualifier_is_active_low: Cell<bool>,
    shift_clock_qualifier_input: Cell<Option<&'a PinConfiguration>>,

    /// Pin on which to output a locally generated shift clock.
    shift_clock_output: Cell<Option<&'a PinConfiguration>>,

    buffer: Cell<*mut u8>,
    buffer_order: Cell<u8>,
    direction_buffer: Cell<*mut u8>,
    direction_buffer_order: Cell<u8>,

    /// Position of the next transfer within the buffer, in bytes. Shared
    /// with the generated ISR.
    position_in_buffer: VolatileCell<u32>,
    position_in_direction_buffer: VolatileCell<u32>,

    /// Stop shifting after this many shift clocks; zero disables the limit.
    /// Must fit within one span of the allocated slice chain.
    shift_count_limit: Cell<u32>,

    /// Count of bytes the driver has placed into the buffer; consumers
    /// subtract as they drain it. Shared with the generated ISR.
    data_in_buffer: VolatileCell<u32>,

    overrides: Cell<u32>,

    // Written back by the planner.
    io_slice: Cell<u8>,
    buffer_depth_order: Cell<u8>,
    direction_slice: Cell<u8>,
    direction_buffer_depth_order: Cell<u8>,
}

impl<'a> Function<'a> {
    pub fn new(
        mode: Mode,
        pin_configurations: &'a [PinConfiguration],
        shift_clock_source: ShiftClockSource,
        shift_clock_edge: ClockEdge,
        shift_clock_frequency: u32,
    ) -> Function<'a> {
        Function {
            enabled: Cell::new(true),
            mode,
            pin_configurations,
            bus_width: Cell::new(pin_configurations.len() as u8),
            shift_clock_source,
            shift_clock_edge,
            shift_clock_input: Cell::new(None),
            shift_clock_frequency: Cell::new(shift_clock_frequency),
            shift_clock_qualifier: Cell::new(ShiftQualifier::Always),
            shift_clock_qualifier_is_active_low: Cell::new(false),
            shift_clock_qualifier_input: Cell::new(None),
            shift_clock_output: Cell::new(None),
            buffer: Cell::new(core::ptr::null_mut()),
            buffer_order: Cell::new(0),
            direction_buffer: Cell::new(core::ptr::null_mut()),
            direction_buffer_order: Cell::new(0),
            position_in_buffer: VolatileCell::new(0),
            position_in_direction_buffer: VolatileCell::new(0),
            shift_count_limit: Cell::new(0),
            data_in_buffer: VolatileCell::new(0),
            overrides: Cell::new(0),
            io_slice: Cell::new(0),
            buffer_depth_order: Cell::new(0),
            direction_slice: Cell::new(0),
            direction_buffer_depth_order: Cell::new(0),
        }
    }

    /// Attach the data buffer. The length must be a power of two; the
    /// generated ISR and the shuttle treat it as a ring.
    pub fn set_buffer(&self, buffer: &'a mut [u8]) {
        debug_assert!(buffer.len().is_power_of_two());
        self.buffer_order.set(buffer.len().trailing_zeros() as u8);
        self.buffer.set(buffer.as_mut_ptr());
    }

    /// Attach the direction buffer (bidirectional functions only).
    pub fn set_direction_buffer(&self, buffer: &'a mut [u8]) {
        debug_assert!(buffer.len().is_power_of_two());
        self.direction_buffer_order
            .set(buffer.len().trailing_zeros() as u8);
        self.direction_buffer.set(buffer.as_mut_ptr());
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn set_qualifier(&self, qualifier: ShiftQualifier, active_low: bool) {
        self.shift_clock_qualifier.set(qualifier);
        self.shift_clock_qualifier_is_active_low.set(active_low);
    }

    /// Routing for a pin-based qualifier.
    pub fn set_qualifier_input(&self, pin: &'a PinConfiguration) {
        self.shift_clock_qualifier_input.set(Some(pin));
    }

    /// Routing for a pin-based shift clock.
    pub fn set_shift_clock_input(&self, pin: &'a PinConfiguration) {
        self.shift_clock_input.set(Some(pin));
    }

    /// Output the generated shift clock on `pin`. Only meaningful when the
    /// shift clock source is local.
    pub fn set_shift_clock_output(&self, pin: &'a PinConfiguration) {
        self.shift_clock_output.set(Some(pin));
    }

    pub fn set_shift_count_limit(&self, limit: u32) {
        self.shift_count_limit.set(limit);
    }

    pub fn set_overrides(&self, overrides: u32) {
        self.overrides.set(overrides);
    }

    pub fn bus_width(&self) -> u8 {
        self.bus_width.get()
    }

    /// The slice serving as this function's I/O boundary; valid after
    /// set-up.
    pub fn io_slice(&self) -> u8 {
        self.io_slice.get()
    }

    /// The slice holding the active direction data; valid after set-up of a
    /// bidirectional function.
    pub fn direction_slice(&self) -> u8 {
        self.direction_slice.get()
    }

    /// log2 of the allocated chain depth, in slices.
    pub fn buffer_depth_order(&self) -> u8 {
        self.buffer_depth_order.get()
    }

    pub fn direction_buffer_depth_order(&self) -> u8 {
        self.direction_buffer_depth_order.get()
    }

    /// The shift clock frequency actually achieved, in Hz.
    pub fn shift_clock_frequency(&self) -> u32 {
        self.shift_clock_frequency.get()
    }

    pub fn position_in_buffer(&self) -> u32 {
        self.position_in_buffer.get()
    }

    /// Bytes available in the buffer; decremented by consumers via
    /// [`Function::acknowledge_data`].
    pub fn data_in_buffer(&self) -> u32 {
        self.data_in_buffer.get()
    }

    pub fn acknowledge_data(&self, count: u32) {
        self.data_in_buffer
            .set(self.data_in_buffer.get().saturating_sub(count));
    }

    fn buffer_size_bytes(&self) -> u32 {
        1 << self.buffer_order.get()
    }

    fn chain_length(&self) -> u8 {
        1 << self.buffer_depth_order.get()
    }

    /// Total shifts between data/shadow swaps for the current chain.
    fn shifts_per_swap(&self) -> u32 {
        (BITS_PER_SLICE as u32 * self.chain_length() as u32) / self.bus_width.get() as u32
    }

    /// Bits shifted through the direction fabric per data shift: one for
    /// serial buses, two for any parallel bus (the MSB selects the
    /// direction of every pin past the first).
    fn direction_shift_width(&self) -> u8 {
        if self.bus_width.get() == 1 {
            1
        } else {
            2
        }
    }
}

//
// Fixed allocation tables
//

/// SCU function-select for each supported (SGPIO pin, chip pad) routing.
struct ScuFunctionMapping {
    sgpio: u8,
    group: u8,
    pin: u8,
    function: u8,
}

const fn scu_mapping(sgpio: u8, group: u8, pin: u8, function: u8) -> ScuFunctionMapping {
    ScuFunctionMapping {
        sgpio,
        group,
        pin,
        function,
    }
}

/// Every way an SGPIO signal can reach a package pad, from the datasheet's
/// pin-description table.
const SCU_MAPPINGS: [ScuFunctionMapping; 43] = [
    scu_mapping(0, 0, 0, 3),
    scu_mapping(1, 0, 1, 3),
    scu_mapping(7, 1, 0, 6),
    scu_mapping(8, 1, 1, 3),
    scu_mapping(9, 1, 2, 3),
    scu_mapping(10, 1, 3, 2),
    scu_mapping(11, 1, 4, 2),
    scu_mapping(15, 1, 5, 6),
    scu_mapping(14, 1, 6, 6),
    scu_mapping(8, 1, 12, 6),
    scu_mapping(9, 1, 13, 6),
    scu_mapping(10, 1, 14, 6),
    scu_mapping(2, 1, 15, 2),
    scu_mapping(3, 1, 16, 2),
    scu_mapping(11, 1, 17, 6),
    scu_mapping(12, 1, 18, 6),
    scu_mapping(13, 1, 20, 6),
    scu_mapping(4, 2, 0, 1),
    scu_mapping(5, 2, 1, 0),
    scu_mapping(6, 2, 2, 0),
    scu_mapping(12, 2, 3, 0),
    scu_mapping(13, 2, 4, 0),
    scu_mapping(14, 2, 5, 0),
    scu_mapping(7, 2, 6, 0),
    scu_mapping(15, 2, 8, 0),
    scu_mapping(8, 4, 2, 7),
    scu_mapping(9, 4, 3, 7),
    scu_mapping(10, 4, 4, 7),
    scu_mapping(11, 4, 5, 7),
    scu_mapping(12, 4, 6, 7),
    scu_mapping(13, 4, 8, 7),
    scu_mapping(14, 4, 9, 7),
    scu_mapping(15, 4, 10, 7),
    scu_mapping(4, 6, 3, 2),
    scu_mapping(5, 6, 6, 2),
    scu_mapping(6, 6, 7, 2),
    scu_mapping(7, 6, 8, 2),
    scu_mapping(4, 7, 0, 7),
    scu_mapping(5, 7, 1, 7),
    scu_mapping(6, 7, 2, 7),
    scu_mapping(7, 7, 7, 7),
    scu_mapping(3, 9, 5, 6),
    scu_mapping(8, 9, 6, 6),
];

/// The slice wired to each pin for data I/O.
const IO_SLICE_FOR_PIN: [u8; 16] = [
    SLICE_A, SLICE_I, SLICE_E, SLICE_J, SLICE_C, SLICE_K, SLICE_F, SLICE_L, SLICE_B, SLICE_M,
    SLICE_G, SLICE_N, SLICE_D, SLICE_O, SLICE_H, SLICE_P,
];

/// The slice whose clock output reaches each pin in clock-generation mode.
const CLOCKGEN_SLICE_FOR_PIN: [u8; 16] = [
    SLICE_B, SLICE_D, SLICE_E, SLICE_H, SLICE_C, SLICE_F, SLICE_O, SLICE_P, SLICE_A, SLICE_M,
    SLICE_G, SLICE_N, SLICE_I, SLICE_J, SLICE_K, SLICE_L,
];

/// Direction slices for two-bit buses, indexed by pin pair: the mirror I/O
/// slice of each pair's base pin.
const DIRECTION_SLICE_FOR_PAIR: [u8; 8] = [
    SLICE_B, SLICE_G, SLICE_D, SLICE_H, SLICE_A, SLICE_E, SLICE_C, SLICE_F,
];

/// Direction slices for four- and eight-bit buses, indexed by pin group.
const DIRECTION_SLICE_FOR_GROUP: [u8; 4] = [SLICE_H, SLICE_O, SLICE_P, SLICE_N];

/// The I/O slice for a pin.
pub(crate) fn slice_for_io(pin: u8) -> Option<u8> {
    IO_SLICE_FOR_PIN.get(pin as usize).copied()
}

/// The pin a slice performs I/O through in serial mode.
pub(crate) fn io_pin_for_slice(slice: u8) -> Option<u8> {
    (0..NUM_PINS).find(|&pin| IO_SLICE_FOR_PIN[pin as usize] == slice)
}

fn slice_for_clockgen(pin: u8) -> Option<u8> {
    CLOCKGEN_SLICE_FOR_PIN.get(pin as usize).copied()
}

/// The slice at `depth` in the chain anchored at `io_slice`, stepping the
/// pin index; chains never wrap past the last pin.
pub(crate) fn slice_in_concatenation(io_slice: u8, depth: u8) -> Option<u8> {
    let pin = io_pin_for_slice(io_slice)?;
    slice_for_io(pin + depth)
}

fn direction_slice_for_function(function: &Function) -> Result<u8, Error> {
    let first_pin = function.pin_configurations[0].sgpio_pin;
    match function.bus_width.get() {
        // The mirror I/O slice: the slice belonging to the pin eight
        // positions away.
        1 => slice_for_io((first_pin + 8) % NUM_PINS).ok_or(Error::InvalidArgument),
        2 => DIRECTION_SLICE_FOR_PAIR
            .get((first_pin / 2) as usize)
            .copied()
            .ok_or(Error::InvalidArgument),
        4 | 8 => DIRECTION_SLICE_FOR_GROUP
            .get((first_pin / 4) as usize)
            .copied()
            .ok_or(Error::InvalidArgument),
        _ => Err(Error::InvalidArgument),
    }
}

/// The slice holding word `position` of a function's concatenated buffer.
///
/// Input chains map position directly onto chain depth. Output chains are
/// rotated by one slot: the I/O slice's data register is committed to the
/// pins first, so the word order through the chain leads by one.
pub(crate) fn buffer_slice_index(function: &Function, position: u32) -> Option<u8> {
    let chain_length = function.chain_length() as u32;
    let position_to_look_up = match function.mode {
        Mode::StreamOut | Mode::FixedOut => (position + 1) % chain_length,
        Mode::StreamIn | Mode::Bidirectional => position,
        Mode::ClockGeneration => return None,
    };
    slice_in_concatenation(function.io_slice.get(), position_to_look_up as u8)
}

//
// The driver
//

pub struct Sgpio<'a> {
    registers: StaticRef<SgpioRegisters>,
    scu: &'a Scu,
    clock: &'a dyn PeripheralClockInterface,
    interrupt_controller: &'a Nvic<'a>,
    shuttle: &'a isr::DataShuttleIsr,

    functions: &'a [Function<'a>],

    slices_in_use: Cell<u16>,
    pins_in_use: Cell<u16>,
    /// Slices whose data/shadow swap must raise the SGPIO interrupt.
    swap_irqs_required: Cell<u16>,
    running: Cell<bool>,
}

impl<'a> Sgpio<'a> {
    pub const fn new(
        registers: StaticRef<SgpioRegisters>,
        scu: &'a Scu,
        clock: &'a dyn PeripheralClockInterface,
        interrupt_controller: &'a Nvic<'a>,
        shuttle: &'a isr::DataShuttleIsr,
        functions: &'a [Function<'a>],
    ) -> Sgpio<'a> {
        Sgpio {
            registers,
            scu,
            clock,
            interrupt_controller,
            shuttle,
            functions,
            slices_in_use: Cell::new(0),
            pins_in_use: Cell::new(0),
            swap_irqs_required: Cell::new(0),
            running: Cell::new(false),
        }
    }

    pub fn registers(&self) -> StaticRef<SgpioRegisters> {
        self.registers
    }

    /// The mask of slices allocated by the last successful set-up.
    pub fn slices_in_use(&self) -> u16 {
        self.slices_in_use.get()
    }

    pub fn pins_in_use(&self) -> u16 {
        self.pins_in_use.get()
    }

    pub fn swap_irqs_required(&self) -> u16 {
        self.swap_irqs_required.get()
    }

    //
    // Pin routing
    //

    fn scu_function_for_pin_config(config: &PinConfiguration) -> Option<u8> {
        SCU_MAPPINGS
            .iter()
            .find(|mapping| {
                mapping.group == config.scu_group
                    && mapping.pin == config.scu_pin
                    && mapping.sgpio == config.sgpio_pin
            })
            .map(|mapping| mapping.function)
    }

    /// Route one pad to its SGPIO pin and claim the pin.
    fn set_up_pin(&self, config: &PinConfiguration) -> Result<(), Error> {
        let function = match Self::scu_function_for_pin_config(config) {
            Some(function) => function,
            None => {
                log_error!(
                    "error: sgpio: couldn't figure out how to map SGPIO{} to P{}_{}",
                    config.sgpio_pin,
                    config.scu_group,
                    config.scu_pin
                );
                return Err(Error::InvalidPinMapping);
            }
        };

        let pin_mask = 1u16 << config.sgpio_pin;
        if self.pins_in_use.get() & pin_mask != 0 {
            log_error!("error: sgpio: SGPIO{} is already assigned", config.sgpio_pin);
            return Err(Error::Busy);
        }

        self.scu.configure_pin_fast_io(
            config.scu_group,
            config.scu_pin,
            function,
            config.pull_resistors,
        );
        self.pins_in_use.set(self.pins_in_use.get() | pin_mask);
        Ok(())
    }

    //
    // Per-slice configuration
    //

    /// Program a slice's shift clocking from the function description.
    fn set_up_clocking(&self, function: &Function, slice: u8) -> Result<(), Error> {
        let index = slice as usize;

        let (external, nonlocal, select) = match function.shift_clock_source {
            ShiftClockSource::Local => (false, false, 0),
            ShiftClockSource::Slice(source) => (false, true, source as u32),
            ShiftClockSource::Pin(source) => (true, true, source as u32),
        };

        // The hardware only consults the selector matching the active mode;
        // setting both is harmless and simpler.
        self.registers.shift_configuration[index].modify(
            SHIFT_CONFIG::EXTERNAL_CLOCK.val(external as u32)
                + SHIFT_CONFIG::CLOCK_SOURCE_SLICE.val(select)
                + SHIFT_CONFIG::CLOCK_SOURCE_PIN.val(select),
        );
        self.registers.feature_control[index].modify(
            FEATURE_CONTROL::NONLOCAL_CLOCK.val(nonlocal as u32)
                + FEATURE_CONTROL::SHIFT_ON_FALLING_EDGE
                    .val(function.shift_clock_edge as u32),
        );

        if let ShiftClockSource::Pin(_) = function.shift_clock_source {
            if let Some(input) = function.shift_clock_input.get() {
                self.set_up_pin(input)?;
            }
        }

        if function.shift_clock_source == ShiftClockSource::Local {
            let branch_frequency = self.clock.frequency();
            let requested = function.shift_clock_frequency.get();

            if requested > branch_frequency {
                log_error!(
                    "error: sgpio slice {}: could not meet timing; cannot produce {} Hz from {} Hz",
                    slice_name(slice),
                    requested,
                    branch_frequency
                );
                return Err(Error::TimingInfeasible);
            }

            // Zero asks for the fastest clock we can make; otherwise round
            // to the nearest divisor the counter can express.
            let divider = if requested == 0 {
                1
            } else {
                (branch_frequency + requested / 2) / requested
            };

            self.registers.cycles_per_shift_clock[index].set(divider - 1);
            self.registers.cycle_count[index].set(divider - 1);

            // Report the rate actually achieved, which differs whenever the
            // branch clock is not evenly divisible.
            function
                .shift_clock_frequency
                .set(branch_frequency / divider);
        }

        Ok(())
    }

    /// Program a slice's shift qualifier from the function description.
    fn set_up_shift_condition(&self, function: &Function, slice: u8) -> Result<(), Error> {
        let index = slice as usize;
        let qualifier = function.shift_clock_qualifier.get();

        self.registers.shift_configuration[index].modify(
            SHIFT_CONFIG::QUALIFIER_MODE.val(qualifier.mode_value())
                + SHIFT_CONFIG::QUALIFIER_PIN.val(qualifier.select_value())
                + SHIFT_CONFIG::QUALIFIER_SLICE.val(qualifier.select_value()),
        );
        self.registers.feature_control[index].modify(
            FEATURE_CONTROL::INVERT_QUALIFIER
                .val(function.shift_clock_qualifier_is_active_low.get() as u32),
        );

        if let ShiftQualifier::Pin(_) = qualifier {
            if let Some(input) = function.shift_clock_qualifier_input.get() {
                self.set_up_pin(input)?;
            }
        }

        Ok(())
    }

    /// Program the data/shadow swap cadence for a slice in a chain of
    /// `total_concatenated_slices`.
    fn set_up_double_buffering(
        &self,
        slice: u8,
        total_concatenated_slices: u8,
        bus_width: u8,
    ) {
        let shifts_per_swap =
            (BITS_PER_SLICE as u32 * total_concatenated_slices as u32) / bus_width as u32;

        self.registers.swap_control[slice as usize].write(
            SWAP_CONTROL::SHIFTS_PER_SWAP.val(shifts_per_swap - 1)
                + SWAP_CONTROL::SHIFTS_REMAINING.val(shifts_per_swap - 1),
        );

        // Keep the slice shifting across swaps.
        let stop = self.registers.stop_on_next_buffer_swap.get();
        self.registers
            .stop_on_next_buffer_swap
            .set(stop & !(1 << slice));
    }

    /// Promote an unsupported bus width to the next parallel mode the
    /// hardware has, warning as we do.
    fn promoted_bus_width(&self, function: &Function) -> Result<u8, Error> {
        let width = function.bus_width.get();
        let promoted = match width {
            1 | 2 | 4 | 8 => width,
            3 => 4,
            5..=7 => 8,
            _ => {
                log_error!("sgpio: error: cannot create a {}-bit bus", width);
                return Err(Error::InvalidArgument);
            }
        };
        if promoted != width {
            log_warn!(
                "sgpio: warning: cannot create a {}-bit bus; creating a {}-bit bus instead",
                width,
                promoted
            );
            function.bus_width.set(promoted);
        }
        Ok(promoted)
    }

    /// Program the parallel mode and initial (single-slice) buffering for a
    /// function's I/O slice.
    fn set_up_bus_topology(&self, function: &Function, slice: u8) -> Result<(), Error> {
        let width = function.bus_width.get();
        let parallel_mode = match width {
            1 => FEATURE_CONTROL::PARALLEL_MODE::Serial,
            2 => FEATURE_CONTROL::PARALLEL_MODE::TwoBit,
            4 => FEATURE_CONTROL::PARALLEL_MODE::FourBit,
            8 => FEATURE_CONTROL::PARALLEL_MODE::EightBit,
            _ => return Err(Error::InvalidArgument),
        };
        self.registers.feature_control[slice as usize].modify(parallel_mode);

        // Draw input from the I/O pin and buffer with this slice alone until
        // the optimizer grows the chain.
        self.registers.shift_configuration[slice as usize]
            .modify(SHIFT_CONFIG::CONCAT_ENABLE::CLEAR);
        function.buffer_depth_order.set(0);

        self.set_up_double_buffering(function.io_slice.get(), 1, width);
        Ok(())
    }

    fn claim_slice(&self, slice: u8) -> Result<(), Error> {
        let mask = 1u16 << slice;
        if self.slices_in_use.get() & mask != 0 {
            log_error!("sgpio: error: slice {} is already in use", slice_name(slice));
            return Err(Error::Busy);
        }
        self.slices_in_use.set(self.slices_in_use.get() | mask);
        Ok(())
    }

    /// Initial minimal placement for one function; the optimizer grows
    /// buffers afterwards.
    fn set_up_function(&self, function: &Function<'a>) -> Result<(), Error> {
        if !function.enabled.get() {
            return Ok(());
        }

        let width = self.promoted_bus_width(function)?;
        self.validate_pin_layout(function, width)?;

        for pin in function.pin_configurations {
            self.set_up_pin(pin)?;
        }

        let first_pin = function.pin_configurations[0].sgpio_pin;
        let io_slice = match function.mode {
            Mode::StreamIn | Mode::StreamOut | Mode::FixedOut | Mode::Bidirectional => {
                slice_for_io(first_pin).ok_or(Error::InvalidArgument)?
            }
            Mode::ClockGeneration => {
                slice_for_clockgen(first_pin).ok_or(Error::InvalidArgument)?
            }
        };
        function.io_slice.set(io_slice);
        log_debug!("sgpio: function using IO slice {}", slice_name(io_slice));
        self.claim_slice(io_slice)?;

        self.set_up_clocking(function, io_slice)?;
        self.set_up_shift_condition(function, io_slice)?;
        self.set_up_bus_topology(function, io_slice)?;

        if function.mode == Mode::Bidirectional {
            self.set_up_direction_slice(function)?;
        }

        Ok(())
    }

    fn validate_pin_layout(&self, function: &Function, width: u8) -> Result<(), Error> {
        let pins = function.pin_configurations;
        if pins.is_empty() || pins.len() > 8 {
            return Err(Error::InvalidArgument);
        }

        let first = pins[0].sgpio_pin;
        if first >= NUM_PINS || first % width != 0 {
            return Err(Error::InvalidArgument);
        }
        for (offset, pin) in pins.iter().enumerate() {
            if pin.sgpio_pin != first + offset as u8 {
                return Err(Error::InvalidArgument);
            }
        }

        if function.mode != Mode::ClockGeneration && function.buffer.get().is_null() {
            return Err(Error::InvalidArgument);
        }
        if function.mode == Mode::Bidirectional && function.direction_buffer.get().is_null() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Allocate and program the direction slice for a bidirectional
    /// function.
    fn set_up_direction_slice(&self, function: &Function) -> Result<(), Error> {
        let direction_slice = direction_slice_for_function(function)?;
        self.claim_slice(direction_slice)?;
        function.direction_slice.set(direction_slice);
        function.direction_buffer_depth_order.set(0);

        // The direction fabric shifts alongside the data fabric: same clock
        // and qualifier, but its own parallel width (one direction bit for
        // serial buses, two for parallel ones).
        self.copy_slice_properties(direction_slice, function.io_slice.get());
        if function.bus_width.get() > 1 {
            self.registers.feature_control[direction_slice as usize]
                .modify(FEATURE_CONTROL::PARALLEL_MODE::TwoBit);
        } else {
            self.registers.feature_control[direction_slice as usize]
                .modify(FEATURE_CONTROL::PARALLEL_MODE::Serial);
        }
        self.registers.shift_configuration[direction_slice as usize]
            .modify(SHIFT_CONFIG::CONCAT_ENABLE::SET);

        let direction_shifts =
            BITS_PER_SLICE as u32 / function.direction_shift_width() as u32;
        self.registers.swap_control[direction_slice as usize].write(
            SWAP_CONTROL::SHIFTS_PER_SWAP.val(direction_shifts - 1)
                + SWAP_CONTROL::SHIFTS_REMAINING.val(direction_shifts - 1),
        );

        Ok(())
    }

    //
    // Buffer optimization
    //

    /// Whether the slices needed to extend a chain to `buffer_depth_slices`
    /// are all free.
    fn slices_for_buffer_free(
        &self,
        io_slice: u8,
        first_new_slice_depth: u8,
        buffer_depth_slices: u8,
    ) -> bool {
        for depth in first_new_slice_depth..buffer_depth_slices {
            let target_slice = match slice_in_concatenation(io_slice, depth) {
                Some(slice) => slice,
                // The chain has run off the end of the pin table; there is
                // no slice there to take.
                None => return false,
            };

            log_debug!(
                "sgpio: checking to see if slice {} is free",
                slice_name(target_slice)
            );
            if self.slices_in_use.get() & (1 << target_slice) != 0 {
                log_debug!(
                    "sgpio: not doubling; slice {} is in use",
                    slice_name(target_slice)
                );
                return false;
            }
        }
        true
    }

    /// Copy the shift/clock/swap configuration from one slice to another;
    /// used to make chained slices behave identically to their I/O slice.
    fn copy_slice_properties(&self, to_slice: u8, from_slice: u8) {
        let to = to_slice as usize;
        let from = from_slice as usize;

        self.registers.shift_configuration[to]
            .set(self.registers.shift_configuration[from].get());
        self.registers.feature_control[to].set(self.registers.feature_control[from].get());
        self.registers.cycles_per_shift_clock[to]
            .set(self.registers.cycles_per_shift_clock[from].get());
        self.registers.cycle_count[to].set(self.registers.cycle_count[from].get());
        self.registers.swap_control[to].set(self.registers.swap_control[from].get());
    }

    /// The deepest chain worth allocating for a function, bounded by its
    /// mode and by the user buffer it has to mirror.
    fn maximum_useful_buffer_depth(&self, function: &Function) -> u8 {
        match function.mode {
            // A clock generator only ever uses its one slice.
            Mode::ClockGeneration => 1,
            Mode::StreamIn | Mode::StreamOut | Mode::FixedOut => {
                self.limit_buffer_depth_to_user_buffer(function, MAX_SLICE_CHAIN_DEPTH)
            }
            // Bidirectional chains share the fabric with their direction
            // slices; chains anchored in the high half of the slice set can
            // only reach half depth before colliding with them.
            Mode::Bidirectional => {
                let maximum = if function.io_slice.get() < 8 {
                    MAX_SLICE_CHAIN_DEPTH
                } else {
                    MAX_SLICE_CHAIN_DEPTH / 2
                };
                self.limit_buffer_depth_to_user_buffer(function, maximum)
            }
        }
    }

    /// No point allocating more chain than the user buffer can keep fed.
    fn limit_buffer_depth_to_user_buffer(&self, function: &Function, maximum_depth: u8) -> u8 {
        let buffer_size_bytes = function.buffer_size_bytes();
        let mut buffer_size_slices = buffer_size_bytes / 4;

        if buffer_size_bytes < 4 {
            return 1;
        }

        // Fixed patterns live in both the data and shadow registers at once,
        // halving the chain needed to hold the whole buffer.
        if function.mode == Mode::FixedOut && buffer_size_slices > 1 {
            buffer_size_slices /= 2;
        }

        buffer_size_slices.min(maximum_depth as u32) as u8
    }

    /// Try to double one function's chain. Returns whether it grew.
    fn attempt_to_double_buffer_size(&self, function: &Function) -> bool {
        let concat_order = function.buffer_depth_order.get();
        let desired_order = concat_order + 1;
        let buffer_depth_slices = 1u8 << concat_order;
        let desired_depth = 1u8 << desired_order;

        log_debug!(
            "sgpio: attempting to double buffer from {} to {} slices",
            buffer_depth_slices,
            desired_depth
        );

        if desired_depth > self.maximum_useful_buffer_depth(function) {
            return false;
        }
        if !self.slices_for_buffer_free(
            function.io_slice.get(),
            buffer_depth_slices,
            desired_depth,
        ) {
            return false;
        }

        // A bidirectional chain must keep its direction fabric able to cover
        // every shift of the grown chain; if the direction chain cannot
        // grow to match, neither can we.
        if function.mode == Mode::Bidirectional
            && !self.grow_direction_chain_for_depth(function, desired_depth)
        {
            return false;
        }

        log_debug!("sgpio: doubling buffer");
        function.buffer_depth_order.set(desired_order);

        self.set_up_double_buffering(
            function.io_slice.get(),
            desired_depth,
            function.bus_width.get(),
        );

        for depth in 0..desired_depth {
            // Chains never run off the pin table here: slices_for_buffer_free
            // vetted every new slice above.
            let target_slice = match slice_in_concatenation(function.io_slice.get(), depth) {
                Some(slice) => slice,
                None => return false,
            };

            if target_slice != function.io_slice.get() {
                self.copy_slice_properties(target_slice, function.io_slice.get());
            }

            // The I/O slice accepts pin input only when this mode consumes
            // input; every other slice feeds from its concatenation
            // predecessor. For output modes this loops the chain onto
            // itself, which fixed-pattern output relies on.
            let accepts_concatenated_input = !function.mode.consumes_input()
                || target_slice != function.io_slice.get();
            self.registers.shift_configuration[target_slice as usize].modify(
                SHIFT_CONFIG::CONCAT_ENABLE.val(accepts_concatenated_input as u32)
                    + SHIFT_CONFIG::CONCAT_ORDER.val(desired_order as u32),
            );

            self.slices_in_use
                .set(self.slices_in_use.get() | (1 << target_slice));
        }

        true
    }

    /// Ensure the direction chain covers `data_depth` slices of data chain,
    /// growing it if it must and can.
    fn grow_direction_chain_for_depth(&self, function: &Function, data_depth: u8) -> bool {
        let data_shifts =
            (BITS_PER_SLICE as u32 * data_depth as u32) / function.bus_width.get() as u32;
        let direction_bits = data_shifts * function.direction_shift_width() as u32;
        let needed_slices = direction_bits.div_ceil(BITS_PER_SLICE as u32).max(1);

        let mut order = function.direction_buffer_depth_order.get();
        while (1u32 << order) < needed_slices {
            let current_depth = 1u8 << order;
            let desired_depth = current_depth * 2;

            if !self.slices_for_buffer_free(
                function.direction_slice.get(),
                current_depth,
                desired_depth,
            ) {
                return false;
            }

            for depth in current_depth..desired_depth {
                let target_slice =
                    match slice_in_concatenation(function.direction_slice.get(), depth) {
                        Some(slice) => slice,
                        None => return false,
                    };
                self.copy_slice_properties(target_slice, function.direction_slice.get());
                self.registers.shift_configuration[target_slice as usize].modify(
                    SHIFT_CONFIG::CONCAT_ENABLE::SET
                        + SHIFT_CONFIG::CONCAT_ORDER.val((order + 1) as u32),
                );
                self.slices_in_use
                    .set(self.slices_in_use.get() | (1 << target_slice));
            }

            order += 1;
            function.direction_buffer_depth_order.set(order);
        }

        // Re-derive the direction swap cadence for the final chain length.
        let direction_shifts = direction_bits.min(
            (BITS_PER_SLICE as u32) << function.direction_buffer_depth_order.get(),
        ) / function.direction_shift_width() as u32;
        self.registers.swap_control[function.direction_slice.get() as usize].write(
            SWAP_CONTROL::SHIFTS_PER_SWAP.val(direction_shifts - 1)
                + SWAP_CONTROL::SHIFTS_REMAINING.val(direction_shifts - 1),
        );

        true
    }

    /// One optimization round over every function. Returns true when no
    /// further growth is possible.
    fn attempt_buffer_optimization(&self) -> bool {
        let mut already_optimal = true;

        for function in self.functions {
            if !function.enabled.get() {
                continue;
            }
            let optimization_achieved = match function.mode {
                Mode::StreamIn | Mode::StreamOut | Mode::FixedOut | Mode::Bidirectional => {
                    self.attempt_to_double_buffer_size(function)
                }
                Mode::ClockGeneration => false,
            };
            if optimization_achieved {
                already_optimal = false;
            }
        }

        already_optimal
    }

    //
    // Output pin policy
    //

    fn output_mode_for_bus_width(&self, bus_width: u8) -> u32 {
        // Mode A for all pure outputs: mode C would keep the register
        // population order identical to input mode, but it avoids slices
        // D/H/O/P and so cannot reach full buffer depth on pins 8-15.
        match bus_width {
            1 => OUTPUT_MODE_1BIT,
            2 => OUTPUT_MODE_2BIT_A,
            3 | 4 => OUTPUT_MODE_4BIT_A,
            5..=8 => OUTPUT_MODE_8BIT_A,
            _ => {
                log_warn!("sgpio: invalid bus width detected");
                OUTPUT_MODE_GPIO
            }
        }
    }

    fn direction_mode_for_bus_width(&self, bus_width: u8) -> u32 {
        match bus_width {
            1 => DIRECTION_MODE_1BIT,
            2 => DIRECTION_MODE_2BIT,
            4 => DIRECTION_MODE_4BIT,
            _ => DIRECTION_MODE_8BIT,
        }
    }

    fn set_up_output_pins_for_function(&self, function: &Function) -> Result<(), Error> {
        for pin_config in function.pin_configurations {
            let pin = pin_config.sgpio_pin;
            let output_config = &self.registers.output_configuration[pin as usize];

            match function.mode {
                // Inputs are never driven: direction control comes from the
                // pin-direction register, which holds the pin as an input.
                Mode::StreamIn => {
                    output_config
                        .modify(OUTPUT_CONFIG::DIRECTION_SOURCE.val(DIRECTION_SOURCE_REGISTER));
                    let direction = self.registers.pin_direction.get();
                    self.registers.pin_direction.set(direction & !(1 << pin));
                }

                Mode::StreamOut | Mode::FixedOut => {
                    output_config.modify(
                        OUTPUT_CONFIG::BUS_MODE
                            .val(self.output_mode_for_bus_width(function.bus_width.get()))
                            + OUTPUT_CONFIG::DIRECTION_SOURCE.val(DIRECTION_SOURCE_REGISTER),
                    );
                    let direction = self.registers.pin_direction.get();
                    self.registers.pin_direction.set(direction | (1 << pin));
                }

                Mode::ClockGeneration => {
                    output_config.modify(
                        OUTPUT_CONFIG::BUS_MODE.val(OUTPUT_MODE_CLOCK_OUT)
                            + OUTPUT_CONFIG::DIRECTION_SOURCE.val(DIRECTION_SOURCE_REGISTER),
                    );
                    let direction = self.registers.pin_direction.get();
                    self.registers.pin_direction.set(direction | (1 << pin));
                }

                // Bidirectional pins hand direction control to the direction
                // slice; tri-state everything until it has real data.
                Mode::Bidirectional => {
                    output_config.modify(
                        OUTPUT_CONFIG::BUS_MODE
                            .val(self.output_mode_for_bus_width(function.bus_width.get()))
                            + OUTPUT_CONFIG::DIRECTION_SOURCE
                                .val(self.direction_mode_for_bus_width(function.bus_width.get())),
                    );
                    self.registers.data[function.direction_slice.get() as usize].set(0);
                }
            }
        }

        if function.shift_clock_output.get().is_some() {
            self.set_up_shift_clock_output(function)?;
        }

        Ok(())
    }

    /// Route a locally generated shift clock out on the function's
    /// requested clock-output pin.
    fn set_up_shift_clock_output(&self, function: &Function) -> Result<(), Error> {
        let pin_config = match function.shift_clock_output.get() {
            Some(config) => config,
            None => return Ok(()),
        };
        let io_slice = function.io_slice.get() as usize;

        let clockgen_slice =
            slice_for_clockgen(pin_config.sgpio_pin).ok_or(Error::InvalidArgument)?;
        let clockgen_index = clockgen_slice as usize;
        let clockgen_mask = 1u16 << clockgen_slice;

        if self.slices_in_use.get() & clockgen_mask != 0 {
            // The slice already generates a clock; it can be shared only if
            // it happens to tick at our rate.
            if self.registers.cycles_per_shift_clock[clockgen_index].get()
                != self.registers.cycles_per_shift_clock[io_slice].get()
            {
                log_error!(
                    "sgpio: error: cannot output shift clock on SGPIO{}; slice {} is busy",
                    pin_config.sgpio_pin,
                    slice_name(clockgen_slice)
                );
                return Err(Error::Busy);
            }
        } else {
            // Claim the free slice and make it tick like the I/O slice.
            self.registers.cycles_per_shift_clock[clockgen_index]
                .set(self.registers.cycles_per_shift_clock[io_slice].get());
            self.registers.cycle_count[clockgen_index]
                .set(self.registers.cycle_count[io_slice].get());
            self.registers.feature_control[clockgen_index]
                .modify(FEATURE_CONTROL::NONLOCAL_CLOCK::CLEAR);
            self.slices_in_use.set(self.slices_in_use.get() | clockgen_mask);
        }

        self.set_up_pin(pin_config)?;
        self.registers.output_configuration[pin_config.sgpio_pin as usize].modify(
            OUTPUT_CONFIG::BUS_MODE.val(OUTPUT_MODE_CLOCK_OUT)
                + OUTPUT_CONFIG::DIRECTION_SOURCE.val(DIRECTION_SOURCE_REGISTER),
        );
        let direction = self.registers.pin_direction.get();
        self.registers
            .pin_direction
            .set(direction | (1 << pin_config.sgpio_pin));

        Ok(())
    }

    //
    // Shift limits
    //

    /// Apply a function's shift-count limit to every slice in its chains.
    fn apply_shift_limit(&self, function: &Function) -> Result<(), Error> {
        let limit = function.shift_count_limit.get();
        if limit == 0 {
            return Ok(());
        }
        if limit > function.shifts_per_swap() {
            log_error!(
                "sgpio: error: shift limit {} exceeds the chain's {} shifts per swap",
                limit,
                function.shifts_per_swap()
            );
            return Err(Error::CannotMeetShiftLimit);
        }

        let mut limited_slices = 0u16;
        for depth in 0..function.chain_length() {
            if let Some(slice) = slice_in_concatenation(function.io_slice.get(), depth) {
                limited_slices |= 1 << slice;
            }
        }
        if function.mode == Mode::Bidirectional {
            for depth in 0..(1u8 << function.direction_buffer_depth_order.get()) {
                if let Some(slice) =
                    slice_in_concatenation(function.direction_slice.get(), depth)
                {
                    limited_slices |= 1 << slice;
                }
            }
        }

        for slice in 0..NUM_SLICES {
            if limited_slices & (1 << slice) == 0 {
                continue;
            }
            self.registers.swap_control[slice as usize].write(
                SWAP_CONTROL::SHIFTS_PER_SWAP.val(0)
                    + SWAP_CONTROL::SHIFTS_REMAINING.val(limit - 1),
            );
            let stop = self.registers.stop_on_next_buffer_swap.get();
            self.registers
                .stop_on_next_buffer_swap
                .set(stop | (1 << slice));
        }

        Ok(())
    }

    //
    // Public API
    //

    /// Configure the peripheral to run every enabled function.
    ///
    /// On success the slice and pin usage masks are final, each function's
    /// write-back fields are valid, and any required data-shuttle ISR is
    /// generated and installed. On failure the peripheral is left reset and
    /// idle: no pins driven, no interrupts pending.
    pub fn set_up_functions(&self) -> Result<(), Error> {
        // Stop and neutralize everything first so reconfiguration is
        // idempotent. The interrupt goes quiet before anything touches the
        // ISR template region.
        self.interrupt_controller.disable(interrupts::SGPIO);
        self.registers.shift_clock_enable.set(0);
        self.registers.stop_on_next_buffer_swap.set(0);
        self.registers.exchange_clock_interrupt.clear_enable.set(0xFFFF);
        self.registers.exchange_clock_interrupt.clear_status.set(0xFFFF);

        self.slices_in_use.set(0);
        self.pins_in_use.set(0);
        self.swap_irqs_required.set(0);

        // Park every pin as an undriven GPIO until a function claims it.
        log_debug!("sgpio: setting up {} functions", self.functions.len());
        for pin in 0..NUM_PINS {
            self.registers.output_configuration[pin as usize].write(
                OUTPUT_CONFIG::BUS_MODE.val(OUTPUT_MODE_GPIO)
                    + OUTPUT_CONFIG::DIRECTION_SOURCE.val(DIRECTION_SOURCE_REGISTER),
            );
        }
        self.registers.pin_direction.set(0);

        // Minimal placement for each function, then grow buffers until no
        // function can grow further.
        for (index, function) in self.functions.iter().enumerate() {
            log_debug!("sgpio: setting up function {}", index);
            self.set_up_function(function).inspect_err(|error| {
                log_error!(
                    "error: sgpio: could not apply function {} ({:?})",
                    index,
                    error
                );
                self.registers.shift_clock_enable.set(0);
            })?;
        }

        let mut optimization_passes = 0;
        while !self.attempt_buffer_optimization() {
            optimization_passes += 1;
        }
        log_debug!(
            "sgpio: optimization complete in {} passes",
            optimization_passes
        );

        for function in self.functions {
            if function.enabled.get() {
                self.set_up_output_pins_for_function(function)?;
                self.apply_shift_limit(function)?;
            }
        }

        // Synthesize and install the data-shuttle ISR, where one is needed.
        log_debug!("sgpio: generating our data-handling ISR");
        let mut swap_irqs = 0u16;
        let mut isr_installed = false;
        for function in self.functions {
            if !function.enabled.get() || !isr::isr_necessary_for_function(function) {
                continue;
            }
            if isr_installed {
                // One specialized routine per context; stitching several
                // functions into one ISR is not implemented.
                return Err(Error::Unsupported);
            }
            self.shuttle.generate_isr_for_function(function)?;
            self.interrupt_controller
                .set_handler(interrupts::SGPIO, self.shuttle.handler());
            swap_irqs |= 1 << function.io_slice.get();
            isr_installed = true;
        }
        self.swap_irqs_required.set(swap_irqs);

        Ok(())
    }

    /// Start every configured function shifting.
    pub fn run(&self) {
        // Keep the fabric stopped while buffers are prepopulated.
        self.registers.shift_clock_enable.set(0);

        data::prepopulate(self.registers, self.functions);

        self.registers
            .exchange_clock_interrupt
            .enable
            .set(self.swap_irqs_required.get() as u32);
        self.registers
            .exchange_clock_interrupt
            .clear_status
            .set(0xFFFF);

        if self.swap_irqs_required.get() != 0 {
            // A stale pending bit from a previous run would fire a spurious
            // shuttle the moment the interrupt is enabled.
            self.interrupt_controller.mark_serviced(interrupts::SGPIO);
            self.interrupt_controller.enable(interrupts::SGPIO);
        } else {
            self.interrupt_controller.disable(interrupts::SGPIO);
        }

        self.registers
            .shift_clock_enable
            .set(self.slices_in_use.get() as u32);
        self.running.set(true);
    }

    /// Stop shifting and recover any in-flight capture data.
    pub fn halt(&self) {
        self.registers.shift_clock_enable.set(0);

        self.registers.exchange_clock_interrupt.clear_enable.set(0xFFFF);
        self.registers
            .exchange_clock_interrupt
            .clear_status
            .set(0xFFFF);
        self.interrupt_controller.disable(interrupts::SGPIO);

        data::capture_remaining(self.registers, self.functions);

        self.running.set(false);
    }

    /// Whether any configured slice is still actively shifting.
    pub fn running(&self) -> bool {
        let enabled = self.registers.shift_clock_enable.get() as u16 & self.slices_in_use.get();
        let terminating = self.registers.stop_on_next_buffer_swap.get() as u16;

        for slice in 0..NUM_SLICES {
            let mask = 1 << slice;
            if enabled & mask == 0 {
                continue;
            }
            if terminating & mask == 0 {
                return true;
            }
            if self.registers.cycle_count[slice as usize].get() != 0 {
                return true;
            }
        }
        false
    }

    /// Run until every terminating function finishes, then halt. Only
    /// sensible when each running function has a fixed termination
    /// condition such as a shift-count limit.
    pub fn run_blocking(&self) {
        self.run();
        while self.running() {}
        self.halt();
    }

    /// Log the peripheral configuration for debugging.
    pub fn dump_configuration(&self, level: LogLevel, include_unused: bool) {
        crate::debug::write(
            level,
            format_args!(
                "sgpio: slices=0x{:04x} pins=0x{:04x} swap_irqs=0x{:04x} running={}",
                self.slices_in_use.get(),
                self.pins_in_use.get(),
                self.swap_irqs_required.get(),
                self.running.get()
            ),
        );

        for (index, function) in self.functions.iter().enumerate() {
            crate::debug::write(
                level,
                format_args!(
                    "sgpio: function {}: {:?} width={} io_slice={} depth_order={} freq={}",
                    index,
                    function.mode,
                    function.bus_width.get(),
                    slice_name(function.io_slice.get()),
                    function.buffer_depth_order.get(),
                    function.shift_clock_frequency.get()
                ),
            );
        }

        for slice in 0..NUM_SLICES {
            if !include_unused && self.slices_in_use.get() & (1 << slice) == 0 {
                continue;
            }
            let index = slice as usize;
            crate::debug::write(
                level,
                format_args!(
                    "sgpio: slice {}: shift_cfg=0x{:08x} features=0x{:08x} swap=0x{:08x} preset={} count={}",
                    slice_name(slice),
                    self.registers.shift_configuration[index].get(),
                    self.registers.feature_control[index].get(),
                    self.registers.swap_control[index].get(),
                    self.registers.cycles_per_shift_clock[index].get(),
                    self.registers.cycle_count[index].get()
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests;
