// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Run-time synthesis of the SGPIO data-shuttle service routine.
//!
//! The time between two data/shadow swaps bounds how long the driver has to
//! refill or drain a slice chain, so the service routine has to be as close
//! to minimal as the hardware allows. Instead of a general loop, a fixed
//! Thumb *template* is compiled into the image: a short prologue that
//! acknowledges the interrupt and computes the user-buffer pointer, a body
//! of [`BODY_SLOTS`] halfword instruction slots, an epilogue that advances
//! the ring position and fill count, and a small literal pool. For each
//! accepted configuration the generator overwrites the body with a
//! straight-line sequence of `ldr`/`str` pairs tailored to the exact slice
//! chain, then points the SGPIO vector at the template's entry.
//!
//! Instruction synthesis is pure arithmetic over opcodes and is fully unit
//! tested; nothing here requires hardware.

use cortexm4::nvic::InterruptHandler;
use cortexm4::VolatileCell;

use super::{buffer_slice_index, Function, Mode, OVERRIDE_NEVER_USE_ISR};
use crate::Error;
use crate::log_debug;

/// Number of 16-bit instruction slots the generator may fill.
pub const BODY_SLOTS: usize = 64;

const PROLOGUE_HALFWORDS: usize = 10;
const EPILOGUE_HALFWORDS: usize = 12;
const LITERAL_WORDS: usize = 3;

const BODY_START_BYTES: usize = PROLOGUE_HALFWORDS * 2;
const EPILOGUE_START_BYTES: usize = BODY_START_BYTES + BODY_SLOTS * 2;
const LITERAL_POOL_BYTES: usize = EPILOGUE_START_BYTES + EPILOGUE_HALFWORDS * 2;

// Registers the template dedicates; the body may only touch these.
const REG_SCRATCH: u16 = 0;
const REG_SHADOW_BASE: u16 = 1;
const REG_USER_BUFFER_POINTER: u16 = 2;

// Addresses baked into the literal pool: the shadow half of the slice
// buffers, and the exchange-interrupt acknowledge register.
const SHADOW_BASE_ADDRESS: u32 = 0x4010_1100;
const EXCHANGE_CLEAR_STATUS_ADDRESS: u32 = 0x4010_1F30;

// Emit NOPs over unused slots rather than branching past them; on this core
// the straight-line NOP run is the cheaper of the two.
const AVOID_BRANCHING: bool = true;

//
// Thumb-16 instruction encoders
//

/// `ldr`/`str` with a word-aligned immediate offset; `offset` is in bytes
/// and must encode into the 5-bit word field.
fn encode_ldr_or_str(rd: u16, rb: u16, offset: u16, is_load: bool) -> u16 {
    debug_assert!(offset % 4 == 0 && offset / 4 < 32);
    let opcode: u16 = 0b0110;
    (opcode << 12) | ((is_load as u16) << 11) | ((offset / 4) << 6) | (rb << 3) | rd
}

pub(crate) fn encode_ldr(rd: u16, rb: u16, offset: u16) -> u16 {
    encode_ldr_or_str(rd, rb, offset, true)
}

pub(crate) fn encode_str(rd: u16, rb: u16, offset: u16) -> u16 {
    encode_ldr_or_str(rd, rb, offset, false)
}

pub(crate) fn encode_nop() -> u16 {
    0xBF00
}

/// Unconditional branch with a halfword offset relative to the prefetched
/// PC (instruction address + 4).
pub(crate) fn encode_branch(halfword_offset: i32) -> u16 {
    let opcode: u16 = 0b11100;
    (opcode << 11) | ((halfword_offset as u16) & 0x7FF)
}

//
// Template and argument block
//

/// Arguments consumed by the template's prologue and epilogue.
///
/// The field order is what the template's load offsets assume; reordering
/// any of these means re-deriving the prologue and epilogue encodings.
#[repr(C)]
pub struct IsrArguments {
    /// Exchange-interrupt status bits to acknowledge on entry.
    interrupt_clear_mask: VolatileCell<u32>,
    /// Bytes moved per invocation: chain length times four.
    copy_size: VolatileCell<u32>,
    /// User ring buffer base.
    buffer: VolatileCell<u32>,
    /// Address of the function's position-in-buffer word.
    position_in_buffer_var: VolatileCell<u32>,
    /// Ring wrap mask: buffer size minus one.
    position_in_buffer_mask: VolatileCell<u32>,
    /// Address of the function's fill-count word.
    data_in_buffer_var: VolatileCell<u32>,
}

const _: () = assert!(core::mem::size_of::<IsrArguments>() == 24);

/// The patchable service-routine region.
///
/// Laid out exactly as executed: prologue, body slots, epilogue, literal
/// pool. The whole structure must stay word aligned so the literal loads in
/// the prologue resolve.
#[repr(C, align(4))]
pub struct IsrTemplate {
    prologue: [VolatileCell<u16>; PROLOGUE_HALFWORDS],
    body: [VolatileCell<u16>; BODY_SLOTS],
    epilogue: [VolatileCell<u16>; EPILOGUE_HALFWORDS],
    literals: [VolatileCell<u32>; LITERAL_WORDS],
}

const _: () =
    assert!(core::mem::size_of::<IsrTemplate>() == LITERAL_POOL_BYTES + LITERAL_WORDS * 4);

// The three pc-relative loads in the prologue sit at byte offsets 2, 6, and
// 10; with the pool at 172/176/180 each lands exactly 42 words past its
// aligned PC.
const PROLOGUE_CODE: [u16; PROLOGUE_HALFWORDS] = [
    0xB510, // push   {r4, lr}
    0x4B2A, // ldr    r3, [pc, #168]   ; &arguments
    0x681C, // ldr    r4, [r3, #0]     ; interrupt_clear_mask
    0x492A, // ldr    r1, [pc, #168]   ; exchange clear-status register
    0x600C, // str    r4, [r1, #0]     ; acknowledge the exchange interrupt
    0x492A, // ldr    r1, [pc, #168]   ; shadow register base
    0x689A, // ldr    r2, [r3, #8]     ; user buffer base
    0x68DC, // ldr    r4, [r3, #12]    ; &position_in_buffer
    0x6820, // ldr    r0, [r4, #0]     ; position_in_buffer
    0x1812, // adds   r2, r2, r0       ; r2 = buffer + position
];

const EPILOGUE_CODE: [u16; EPILOGUE_HALFWORDS] = [
    0x6820, // ldr    r0, [r4, #0]     ; position_in_buffer
    0x685A, // ldr    r2, [r3, #4]     ; copy_size
    0x1880, // adds   r0, r0, r2
    0x6919, // ldr    r1, [r3, #16]    ; position_in_buffer_mask
    0x4008, // ands   r0, r1           ; wrap within the ring
    0x6020, // str    r0, [r4, #0]
    0x6959, // ldr    r1, [r3, #20]    ; &data_in_buffer
    0x6808, // ldr    r0, [r1, #0]
    0x1880, // adds   r0, r0, r2       ; data_in_buffer += copy_size
    0x6008, // str    r0, [r1, #0]
    0xBD10, // pop    {r4, pc}
    0xBF00, // nop                     ; keep the literal pool word aligned
];

/// The singleton data-shuttle routine: one template region plus its
/// argument block.
///
/// Exactly one ISR-requiring function is supported per SGPIO context; a
/// second one is refused at set-up. Only the foreground planner writes this
/// region, and only while the SGPIO interrupt is disabled.
pub struct DataShuttleIsr {
    template: IsrTemplate,
    args: IsrArguments,
}

// Written from the foreground with the SGPIO interrupt disabled; read by
// the hardware as code thereafter.
unsafe impl Sync for DataShuttleIsr {}

#[cfg_attr(
    all(target_arch = "arm", target_os = "none"),
    link_section = ".data.sgpio_isr"
)]
pub static DATA_SHUTTLE_ISR: DataShuttleIsr = DataShuttleIsr::new();

impl DataShuttleIsr {
    pub const fn new() -> DataShuttleIsr {
        DataShuttleIsr {
            template: IsrTemplate {
                prologue: {
                    let mut cells = [const { VolatileCell::new(0u16) }; PROLOGUE_HALFWORDS];
                    let mut i = 0;
                    while i < PROLOGUE_HALFWORDS {
                        cells[i] = VolatileCell::new(PROLOGUE_CODE[i]);
                        i += 1;
                    }
                    cells
                },
                body: [const { VolatileCell::new(0xBF00u16) }; BODY_SLOTS],
                epilogue: {
                    let mut cells = [const { VolatileCell::new(0u16) }; EPILOGUE_HALFWORDS];
                    let mut i = 0;
                    while i < EPILOGUE_HALFWORDS {
                        cells[i] = VolatileCell::new(EPILOGUE_CODE[i]);
                        i += 1;
                    }
                    cells
                },
                literals: [
                    // Patched to &args at generation time; a Rust static's
                    // address is not available in const context.
                    VolatileCell::new(0),
                    VolatileCell::new(EXCHANGE_CLEAR_STATUS_ADDRESS),
                    VolatileCell::new(SHADOW_BASE_ADDRESS),
                ],
            },
            args: IsrArguments {
                interrupt_clear_mask: VolatileCell::new(0),
                copy_size: VolatileCell::new(0),
                buffer: VolatileCell::new(0),
                position_in_buffer_var: VolatileCell::new(0),
                position_in_buffer_mask: VolatileCell::new(0),
                data_in_buffer_var: VolatileCell::new(0),
            },
        }
    }

    /// Snapshot of the body slots, for tests that verify generated code.
    #[cfg(test)]
    pub(crate) fn body_for_test(&self) -> [u16; BODY_SLOTS] {
        let mut body = [0u16; BODY_SLOTS];
        for (slot, value) in body.iter_mut().enumerate() {
            *value = self.template.body[slot].get();
        }
        body
    }

    /// The routine's entry point, as installed into the vector table. Bit
    /// zero marks the target as Thumb code.
    pub fn handler(&self) -> InterruptHandler {
        let entry = &self.template as *const IsrTemplate as usize | 1;
        unsafe { core::mem::transmute(entry) }
    }

    /// Synthesize the body and argument block for one function.
    pub(crate) fn generate_isr_for_function(&self, function: &Function) -> Result<(), Error> {
        if !isr_necessary_for_function(function) {
            return Ok(());
        }

        // Only the I/O slice raises the exchange interrupt for its chain.
        self.args
            .interrupt_clear_mask
            .set(1 << function.io_slice.get());
        self.args.buffer.set(function.buffer.get() as u32);
        self.args
            .position_in_buffer_var
            .set(function.position_in_buffer.as_ptr() as u32);
        self.args
            .position_in_buffer_mask
            .set(function.buffer_size_bytes() - 1);
        self.args
            .data_in_buffer_var
            .set(function.data_in_buffer.as_ptr() as u32);
        self.args
            .copy_size
            .set(function.chain_length() as u32 * 4);

        // Patch the literal pool with the argument block's address.
        self.template.literals[0].set(&self.args as *const IsrArguments as u32);

        let used_slots = self.generate_copy_instructions(function)?;
        self.fill_unused_slots(used_slots, AVOID_BRANCHING);

        log_debug!("sgpio: ISR: generation complete");
        Ok(())
    }

    /// Emit one load/store pair per chained slice.
    fn generate_copy_instructions(&self, function: &Function) -> Result<usize, Error> {
        let mut instruction_offset = 0;
        let mut user_buffer_offset: u16 = 0;

        let mut slices_to_copy = function.chain_length() as u32;
        while slices_to_copy > 0 {
            slices_to_copy -= 1;

            let slice = buffer_slice_index(function, slices_to_copy).ok_or(Error::Unsupported)?;
            let slice_buffer_offset = slice as u16 * 4;

            match function.mode {
                Mode::StreamOut | Mode::FixedOut => {
                    log_debug!(
                        "sgpio: ISR: chain word {}: filling shadow offset {}",
                        slices_to_copy,
                        slice_buffer_offset
                    );
                    self.template.body[instruction_offset].set(encode_ldr(
                        REG_SCRATCH,
                        REG_USER_BUFFER_POINTER,
                        user_buffer_offset,
                    ));
                    self.template.body[instruction_offset + 1].set(encode_str(
                        REG_SCRATCH,
                        REG_SHADOW_BASE,
                        slice_buffer_offset,
                    ));
                }
                Mode::StreamIn => {
                    log_debug!(
                        "sgpio: ISR: chain word {}: draining shadow offset {}",
                        slices_to_copy,
                        slice_buffer_offset
                    );
                    self.template.body[instruction_offset].set(encode_ldr(
                        REG_SCRATCH,
                        REG_SHADOW_BASE,
                        slice_buffer_offset,
                    ));
                    self.template.body[instruction_offset + 1].set(encode_str(
                        REG_SCRATCH,
                        REG_USER_BUFFER_POINTER,
                        user_buffer_offset,
                    ));
                }
                Mode::Bidirectional | Mode::ClockGeneration => {
                    return Err(Error::Unsupported);
                }
            }

            instruction_offset += 2;
            user_buffer_offset += 4;
        }

        Ok(instruction_offset)
    }

    /// Tidy the slots the copy sequence did not use: NOP them out, or plant
    /// one branch to the epilogue. Both paths reach the epilogue with the
    /// same machine state.
    fn fill_unused_slots(&self, first_unused_slot: usize, nop_fill: bool) {
        if first_unused_slot >= BODY_SLOTS {
            return;
        }

        if nop_fill {
            for slot in first_unused_slot..BODY_SLOTS {
                self.template.body[slot].set(encode_nop());
            }
        } else {
            let instruction_address = BODY_START_BYTES + first_unused_slot * 2;
            let prefetched_pc = instruction_address + 4;
            let halfword_offset =
                (EPILOGUE_START_BYTES as i32 - prefetched_pc as i32) / 2;
            self.template.body[first_unused_slot].set(encode_branch(halfword_offset));
        }
    }
}

impl Default for DataShuttleIsr {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a function can run without CPU help between buffer swaps.
pub(crate) fn isr_necessary_for_function(function: &Function) -> bool {
    if function.overrides.get() & OVERRIDE_NEVER_USE_ISR != 0 {
        return false;
    }

    match function.mode {
        // Clock generation never moves data.
        Mode::ClockGeneration => false,

        // A fixed pattern avoids the ISR when the whole user buffer fits in
        // the data and shadow registers together: the chain then replays it
        // forever with no repopulation.
        Mode::FixedOut => {
            let slice_buffer_order_bytes = function.buffer_depth_order.get() + 2;
            let slice_buffer_order_with_exchange = slice_buffer_order_bytes + 1;
            function.buffer_order.get() > slice_buffer_order_with_exchange
        }

        // A capture that stops within one chain span never swaps; the
        // residue is collected at halt instead.
        Mode::StreamIn => {
            let limit = function.shift_count_limit.get();
            if limit != 0 {
                let limit_bytes = limit * function.bus_width.get() as u32 / 8;
                let chain_bytes = function.chain_length() as u32 * 4;
                limit_bytes > chain_bytes
            } else {
                true
            }
        }

        _ => true,
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::sgpio::{ClockEdge, PinConfiguration, ShiftClockSource, SLICE_A};
    use crate::scu::PinResistors;

    const PIN0: PinConfiguration = PinConfiguration {
        sgpio_pin: 0,
        scu_group: 0,
        scu_pin: 0,
        pull_resistors: PinResistors::None,
    };

    fn stream_in_function(depth_order: u8, buffer: &'static mut [u8]) -> Function<'static> {
        let function = Function::new(
            Mode::StreamIn,
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
    fn load_store_encodings_match_the_reference_forms() {
        // ldr r0, [r1, #36] / str r0, [r2, #0]
        assert_eq!(encode_ldr(0, 1, 36), 0x6A48);
        assert_eq!(encode_str(0, 2, 0), 0x6010);
        // Offsets encode in words.
        assert_eq!(encode_ldr(0, 1, 4) - encode_ldr(0, 1, 0), 1 << 6);
        assert_eq!(encode_nop(), 0xBF00);
    }

    #[test]
    fn branch_encoding_uses_prefetched_pc() {
        // Branching forward 4 halfwords: opcode 11100, offset field 4.
        assert_eq!(encode_branch(4), 0xE004);
        // Negative offsets wrap into the 11-bit field.
        assert_eq!(encode_branch(-2), 0xE7FE);
    }

    #[test]
    fn template_layout_keeps_the_pool_reachable_and_aligned() {
        assert_eq!(LITERAL_POOL_BYTES % 4, 0);
        // Each pc-relative load's literal must land exactly where the
        // prologue encodings say: 42 words past the load's aligned PC.
        for (instruction_byte, literal_index) in [(2usize, 0usize), (6, 1), (10, 2)] {
            let aligned_pc = (instruction_byte + 4) & !3;
            let literal_byte = LITERAL_POOL_BYTES + literal_index * 4;
            assert_eq!((literal_byte - aligned_pc) / 4, 42);
        }
    }

    #[test]
    fn stream_in_body_drains_the_chain_tail_first() {
        let buffer = std::boxed::Box::leak(std::vec![0u8; 16].into_boxed_slice());
        let function = stream_in_function(2, buffer);
        let shuttle = DataShuttleIsr::new();

        shuttle.generate_isr_for_function(&function).unwrap();

        // Chain A, I, E, J: the deepest slice holds the oldest word, so J's
        // shadow drains to user offset 0 and A's to offset 12.
        let expected = [
            encode_ldr(0, 1, 36), // shadow J
            encode_str(0, 2, 0),
            encode_ldr(0, 1, 16), // shadow E
            encode_str(0, 2, 4),
            encode_ldr(0, 1, 32), // shadow I
            encode_str(0, 2, 8),
            encode_ldr(0, 1, 0), // shadow A
            encode_str(0, 2, 12),
        ];
        for (slot, &want) in expected.iter().enumerate() {
            assert_eq!(shuttle.template.body[slot].get(), want, "slot {}", slot);
        }
        // The rest of the body is NOP fill.
        for slot in expected.len()..BODY_SLOTS {
            assert_eq!(shuttle.template.body[slot].get(), encode_nop());
        }

        // Argument block.
        assert_eq!(shuttle.args.interrupt_clear_mask.get(), 1 << SLICE_A);
        assert_eq!(shuttle.args.copy_size.get(), 16);
        assert_eq!(shuttle.args.position_in_buffer_mask.get(), 15);
        assert_eq!(
            shuttle.template.literals[0].get(),
            &shuttle.args as *const IsrArguments as u32
        );
    }

    #[test]
    fn stream_out_body_rotates_the_output_chain_by_one() {
        let buffer = std::boxed::Box::leak(std::vec![0u8; 8].into_boxed_slice());
        let function = Function::new(
            Mode::StreamOut,
            std::boxed::Box::leak(std::boxed::Box::new([PIN0])),
            ShiftClockSource::Local,
            ClockEdge::Rising,
            1_000_000,
        );
        function.set_buffer(buffer);
        function.io_slice.set(SLICE_A);
        function.buffer_depth_order.set(1);

        let shuttle = DataShuttleIsr::new();
        shuttle.generate_isr_for_function(&function).unwrap();

        // Chain A, I with the single-slot output rotation: chain word 1
        // lands in slice A (offset 0), chain word 0 in slice I (offset 32).
        let expected = [
            encode_ldr(0, 2, 0),
            encode_str(0, 1, 0), // slice A
            encode_ldr(0, 2, 4),
            encode_str(0, 1, 32), // slice I
        ];
        for (slot, &want) in expected.iter().enumerate() {
            assert_eq!(shuttle.template.body[slot].get(), want, "slot {}", slot);
        }
    }

    #[test]
    fn branch_fill_lands_on_the_epilogue() {
        let shuttle = DataShuttleIsr::new();
        shuttle.fill_unused_slots(8, false);

        let instruction_address = BODY_START_BYTES + 8 * 2;
        let expected_offset = (EPILOGUE_START_BYTES as i32 - (instruction_address as i32 + 4)) / 2;
        assert_eq!(
            shuttle.template.body[8].get(),
            encode_branch(expected_offset)
        );
    }

    #[test]
    fn no_isr_for_overridden_or_self_contained_functions() {
        // Override wins regardless of mode.
        let buffer = std::boxed::Box::leak(std::vec![0u8; 16].into_boxed_slice());
        let function = stream_in_function(2, buffer);
        function.set_overrides(OVERRIDE_NEVER_USE_ISR);
        assert!(!isr_necessary_for_function(&function));

        // A shift limit whose capture fits the chain needs no swap at all.
        let buffer = std::boxed::Box::leak(std::vec![0u8; 1024].into_boxed_slice());
        let function = stream_in_function(3, buffer);
        function.set_shift_count_limit(100);
        assert!(!isr_necessary_for_function(&function));

        // Without the limit the same chain streams forever and needs help.
        function.set_shift_count_limit(0);
        assert!(isr_necessary_for_function(&function));
    }
}
