// SPDX-License-Identifier: MIT

//! Relocation of a function's leading instructions.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction, InstructionBlock,
};

use crate::emit::{self, Arch};
use crate::error::InterceptionError;

/// The relocated instructions plus the jump back into the function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedPreamble {
    pub code: Vec<u8>,
    /// Bytes of the original function the relocated instructions replace.
    pub covered: usize,
}

/// Relocate the instructions at `address` that overlap its first `needed`
/// bytes, so that they run at `destination` and then continue at the first
/// byte that was not relocated.
///
/// `code` holds the function's bytes, enough to decode past `needed`.
pub fn relocate(
    arch: Arch,
    address: u64,
    code: &[u8],
    needed: usize,
    destination: u64,
    capacity: usize,
) -> Result<RelocatedPreamble, InterceptionError> {
    let mut decoder = Decoder::with_ip(arch.bitness(), code, address, DecoderOptions::NONE);
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut covered = 0usize;

    while covered < needed {
        if !decoder.can_decode() {
            return Err(InterceptionError::unsuccessful("ran out of code before the redirect fits"));
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(InterceptionError::Unsuccessful(format!(
                "cannot decode the instruction at {:#x}",
                instruction.ip()
            )));
        }
        covered += instruction.len();
        let ends_flow = matches!(
            instruction.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        );
        if ends_flow && covered < needed {
            return Err(InterceptionError::Unsuccessful(format!(
                "function ends at {:#x} before the redirect fits",
                instruction.ip()
            )));
        }
        instructions.push(instruction);
    }

    let end = address + covered as u64;
    for instruction in &instructions {
        let branches = instruction.is_jcc_short_or_near()
            || instruction.is_jmp_short_or_near()
            || instruction.is_call_near()
            || instruction.is_loop()
            || instruction.is_loopcc()
            || instruction.is_jcx_short();
        if !branches {
            continue;
        }
        let landing = instruction.near_branch_target();
        if landing > address && landing < end {
            return Err(InterceptionError::Unsuccessful(format!(
                "branch at {:#x} lands inside the overwritten bytes",
                instruction.ip()
            )));
        }
    }

    let block = InstructionBlock::new(&instructions, destination);
    let encoded = BlockEncoder::encode(arch.bitness(), block, BlockEncoderOptions::NONE)
        .map_err(|e| InterceptionError::Unsuccessful(format!("cannot relocate the preamble: {e}")))?;
    let mut relocated = encoded.code_buffer;
    let back_from = destination + relocated.len() as u64;
    relocated.extend(emit::jump(arch, back_from, end));

    if relocated.len() > capacity {
        return Err(InterceptionError::BufferTooSmall { needed: relocated.len(), available: capacity });
    }
    Ok(RelocatedPreamble { code: relocated, covered })
}
