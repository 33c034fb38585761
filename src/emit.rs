// SPDX-License-Identifier: MIT

//! Machine code emission.
//!
//! Every byte of code written into a target process comes from this module:
//! the internal thunk, jumps, the service patch and the smart call-site
//! stub.  The templates are fixed; only their operand slots vary.

use crate::error::InterceptionError;

/// Instruction set of the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X64,
}

impl Arch {
    pub fn bitness(self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X64 => 64,
        }
    }

    pub fn pointer_size(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X64 => 8,
        }
    }

    /// The architecture this crate was built for.
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") { Arch::X64 } else { Arch::X86 }
    }
}

pub const JMP_REL32: u8 = 0xE9;
pub const INT3: u8 = 0xCC;
pub const JMP_REL32_LEN: usize = 5;
/// `jmp qword ptr [rip]` followed by the absolute target.
pub const JMP_ABS64_LEN: usize = 14;

const X86_INTERNAL_THUNK_LEN: usize = 30;
const X64_INTERNAL_THUNK_LEN: usize = 22;
const X86_SMART_STUB_LEN: usize = 36;
const X64_SMART_STUB_LEN: usize = 49;

pub const X86_SERVICE_PATCH_LEN: usize = 12;
pub const X64_SERVICE_PATCH_NEAR_LEN: usize = 10;
pub const X64_SERVICE_PATCH_FAR_LEN: usize = 12;

pub fn internal_thunk_size(arch: Arch) -> usize {
    match arch {
        Arch::X86 => X86_INTERNAL_THUNK_LEN,
        Arch::X64 => X64_INTERNAL_THUNK_LEN,
    }
}

pub fn smart_stub_size(arch: Arch) -> usize {
    match arch {
        Arch::X86 => X86_SMART_STUB_LEN,
        Arch::X64 => X64_SMART_STUB_LEN,
    }
}

fn imm32(value: u64, what: &str) -> Result<[u8; 4], InterceptionError> {
    u32::try_from(value)
        .map(u32::to_le_bytes)
        .map_err(|_| InterceptionError::InvalidParameter(format!("{what} {value:#x} is not a 32-bit address")))
}

/// The displacement of a `rel32` branch ending at `next_ip` and landing on
/// `to`, if the target is reachable.
pub fn rel32(arch: Arch, next_ip: u64, to: u64) -> Option<i32> {
    match arch {
        // Addresses wrap around the 32-bit space.
        Arch::X86 => Some((to as u32).wrapping_sub(next_ip as u32) as i32),
        Arch::X64 => i32::try_from(to.wrapping_sub(next_ip) as i64).ok(),
    }
}

/// The internal thunk.
///
/// On x86 it turns the stack `[ret, args..]` into
/// `[ret, original, args..]` and continues at the interceptor, touching only
/// `esp` and `eip`.  On x64 it loads `original` into `r10` and jumps to the
/// interceptor through `rax`, leaving the argument registers and the stack
/// alone.
pub fn internal_thunk(arch: Arch, original: u64, interceptor: u64) -> Result<Vec<u8>, InterceptionError> {
    let mut code = Vec::with_capacity(internal_thunk_size(arch));
    match arch {
        Arch::X86 => {
            let original = imm32(original, "original function")?;
            let interceptor = imm32(interceptor, "interceptor")?;
            code.extend_from_slice(&[0x83, 0xEC, 0x08]); // sub esp, 8
            code.push(0x52); // push edx
            code.extend_from_slice(&[0x8B, 0x54, 0x24, 0x0C]); // mov edx, [esp+0Ch]
            code.extend_from_slice(&[0x89, 0x54, 0x24, 0x08]); // mov [esp+8], edx
            code.extend_from_slice(&[0xC7, 0x44, 0x24, 0x0C]); // mov dword [esp+0Ch], original
            code.extend_from_slice(&original);
            code.extend_from_slice(&[0xC7, 0x44, 0x24, 0x04]); // mov dword [esp+4], interceptor
            code.extend_from_slice(&interceptor);
            code.push(0x5A); // pop edx
            code.push(0xC3); // ret
        }
        Arch::X64 => {
            code.extend_from_slice(&[0x49, 0xBA]); // mov r10, original
            code.extend_from_slice(&original.to_le_bytes());
            code.extend_from_slice(&[0x48, 0xB8]); // mov rax, interceptor
            code.extend_from_slice(&interceptor.to_le_bytes());
            code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
        }
    }
    debug_assert_eq!(code.len(), internal_thunk_size(arch));
    Ok(code)
}

/// `jmp rel32` from `from` to `to`, if reachable.
pub fn jmp_rel32(arch: Arch, from: u64, to: u64) -> Option<Vec<u8>> {
    let rel = rel32(arch, from.wrapping_add(JMP_REL32_LEN as u64), to)?;
    let mut code = vec![JMP_REL32];
    code.extend_from_slice(&rel.to_le_bytes());
    Some(code)
}

/// The shortest unconditional jump from `from` to `to`.
pub fn jump(arch: Arch, from: u64, to: u64) -> Vec<u8> {
    if let Some(code) = jmp_rel32(arch, from, to) {
        return code;
    }
    let mut code = vec![0xFF, 0x25, 0, 0, 0, 0]; // jmp qword [rip]
    code.extend_from_slice(&to.to_le_bytes());
    code
}

/// Length of the jump `jump` would emit.
pub fn jump_len(arch: Arch, from: u64, to: u64) -> usize {
    if rel32(arch, from.wrapping_add(JMP_REL32_LEN as u64), to).is_some() { JMP_REL32_LEN } else { JMP_ABS64_LEN }
}

/// The prologue written over a system service stub, sending it to `thunk`.
///
/// The service identifier is kept in `eax` when known.  Returns `None` when
/// no form fits in `max_len` bytes.
pub fn service_patch(arch: Arch, service_id: Option<u32>, at: u64, thunk: u64, max_len: usize) -> Option<Vec<u8>> {
    match (arch, service_id) {
        (Arch::X86, Some(id)) if max_len >= X86_SERVICE_PATCH_LEN => {
            let thunk = u32::try_from(thunk).ok()?;
            let mut code = vec![0xB8]; // mov eax, id
            code.extend_from_slice(&id.to_le_bytes());
            code.push(0xBA); // mov edx, thunk
            code.extend_from_slice(&thunk.to_le_bytes());
            code.extend_from_slice(&[0xFF, 0xE2]); // jmp edx
            Some(code)
        }
        (Arch::X64, Some(id)) if max_len >= X64_SERVICE_PATCH_NEAR_LEN => {
            let near = rel32(arch, at + X64_SERVICE_PATCH_NEAR_LEN as u64, thunk);
            match near {
                Some(rel) => {
                    let mut code = vec![0xB8]; // mov eax, id
                    code.extend_from_slice(&id.to_le_bytes());
                    code.push(JMP_REL32);
                    code.extend_from_slice(&rel.to_le_bytes());
                    Some(code)
                }
                None => x64_far_service_patch(thunk, max_len),
            }
        }
        (Arch::X64, None) => x64_far_service_patch(thunk, max_len).or_else(|| rel32_fit(arch, at, thunk, max_len)),
        _ => rel32_fit(arch, at, thunk, max_len),
    }
}

fn x64_far_service_patch(thunk: u64, max_len: usize) -> Option<Vec<u8>> {
    if max_len < X64_SERVICE_PATCH_FAR_LEN {
        return None;
    }
    let mut code = vec![0x48, 0xB8]; // mov rax, thunk
    code.extend_from_slice(&thunk.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
    Some(code)
}

fn rel32_fit(arch: Arch, at: u64, to: u64, max_len: usize) -> Option<Vec<u8>> {
    if max_len < JMP_REL32_LEN {
        return None;
    }
    jmp_rel32(arch, at, to)
}

/// Move a `rel32` operand from code that lived at `from` to a copy at `to`.
///
/// `rel_offset` is the offset of the displacement inside `code` and
/// `next_ip_offset` the offset of the end of its instruction.
pub fn rebase_rel32(
    arch: Arch,
    code: &mut [u8],
    rel_offset: usize,
    next_ip_offset: usize,
    from: u64,
    to: u64,
) -> Option<()> {
    let bytes: [u8; 4] = code.get(rel_offset..rel_offset + 4)?.try_into().ok()?;
    let rel = i32::from_le_bytes(bytes);
    let destination = from
        .wrapping_add(next_ip_offset as u64)
        .wrapping_add(rel as i64 as u64);
    let destination = if arch == Arch::X86 { destination & 0xFFFF_FFFF } else { destination };
    let rebased = rel32(arch, to.wrapping_add(next_ip_offset as u64), destination)?;
    code[rel_offset..rel_offset + 4].copy_from_slice(&rebased.to_le_bytes());
    Some(())
}

/// The call-site check of the smart sidestep resolver.
///
/// Entered the way an interceptor is entered from the internal thunk.  If
/// the caller's return address lies in `[module_start, module_end)` the
/// original-function argument is dropped and the original runs with the
/// stack the caller built; otherwise control continues at `interceptor`
/// unchanged.
pub fn smart_stub(arch: Arch, module_start: u64, module_end: u64, interceptor: u64) -> Result<Vec<u8>, InterceptionError> {
    let mut code = Vec::with_capacity(smart_stub_size(arch));
    match arch {
        Arch::X86 => {
            let start = imm32(module_start, "module start")?;
            let end = imm32(module_end, "module end")?;
            let interceptor = imm32(interceptor, "interceptor")?;
            code.push(0x50); // push eax
            code.extend_from_slice(&[0x8B, 0x44, 0x24, 0x04]); // mov eax, [esp+4]
            code.push(0x3D); // cmp eax, start
            code.extend_from_slice(&start);
            code.extend_from_slice(&[0x72, 0x11]); // jb external
            code.push(0x3D); // cmp eax, end
            code.extend_from_slice(&end);
            code.extend_from_slice(&[0x73, 0x0A]); // jae external
            code.extend_from_slice(&[0x87, 0x44, 0x24, 0x08]); // xchg eax, [esp+8]
            code.extend_from_slice(&[0x89, 0x44, 0x24, 0x04]); // mov [esp+4], eax
            code.push(0x58); // pop eax
            code.push(0xC3); // ret
            // external:
            code.push(0x58); // pop eax
            code.push(0x68); // push interceptor
            code.extend_from_slice(&interceptor);
            code.push(0xC3); // ret
        }
        Arch::X64 => {
            code.extend_from_slice(&[0x48, 0x8B, 0x04, 0x24]); // mov rax, [rsp]
            code.extend_from_slice(&[0x49, 0xBB]); // mov r11, start
            code.extend_from_slice(&module_start.to_le_bytes());
            code.extend_from_slice(&[0x4C, 0x39, 0xD8]); // cmp rax, r11
            code.extend_from_slice(&[0x72, 0x12]); // jb external
            code.extend_from_slice(&[0x49, 0xBB]); // mov r11, end
            code.extend_from_slice(&module_end.to_le_bytes());
            code.extend_from_slice(&[0x4C, 0x39, 0xD8]); // cmp rax, r11
            code.extend_from_slice(&[0x73, 0x03]); // jae external
            code.extend_from_slice(&[0x41, 0xFF, 0xE2]); // jmp r10
            // external:
            code.extend_from_slice(&[0x48, 0xB8]); // mov rax, interceptor
            code.extend_from_slice(&interceptor.to_le_bytes());
            code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
        }
    }
    debug_assert_eq!(code.len(), smart_stub_size(arch));
    Ok(code)
}
