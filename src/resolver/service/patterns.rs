// SPDX-License-Identifier: MIT

//! Byte templates of system service stubs.
//!
//! Templates are written as hex bytes with `??` for wildcard slots (service
//! identifier, parameter byte count, stub pointers).  A stub matches only if
//! every fixed byte is equal.

use crate::emit::Arch;
use crate::image::ModuleImage;
use crate::process::ProcessMemory;

/// What a matched stub's `edx` operand must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerCheck {
    None,
    /// `mov edx, imm32; call [edx]`: the pointer stored at the immediate
    /// must point into the module.
    DerefInModule { imm_offset: usize },
    /// `mov edx, imm32; call edx`: the immediate must lie inside the module.
    ImmInModule { imm_offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// An unmodified stub.
    Service,
    /// A patch this crate writes.
    OwnPatch,
    /// A plain `jmp rel32` written over the entry by someone.
    EntryJump,
}

#[derive(Debug)]
pub struct StubPattern {
    pub name: &'static str,
    pub kind: PatternKind,
    template: &'static str,
    /// Offset of the 32-bit service identifier, when the shape carries one.
    pub id_offset: Option<usize>,
    /// `(displacement offset, end of instruction)` of a relative operand
    /// that must be re-based when the bytes move.
    pub rel32: Option<(usize, usize)>,
    pub check: PointerCheck,
}

impl StubPattern {
    fn slots(&self) -> impl Iterator<Item = Option<u8>> + '_ {
        self.template
            .split_ascii_whitespace()
            .map(|token| u8::from_str_radix(token, 16).ok())
    }

    pub fn len(&self) -> usize {
        self.slots().count()
    }

    /// True when `code` starts with this shape.
    pub fn matches(&self, code: &[u8]) -> bool {
        self.len() <= code.len() && self.slots().zip(code).all(|(slot, byte)| slot.is_none_or(|b| b == *byte))
    }

    pub fn service_id(&self, code: &[u8]) -> Option<u32> {
        read_u32(code, self.id_offset?)
    }
}

fn read_u32(code: &[u8], offset: usize) -> Option<u32> {
    code.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

pub static NATIVE32_CALL_PTR: StubPattern = StubPattern {
    name: "native32 call [edx]",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? BA ?? ?? ?? ?? FF 12 C2 ?? ??",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::DerefInModule { imm_offset: 6 },
};

pub static NATIVE32_CALL_PTR_NOARGS: StubPattern = StubPattern {
    name: "native32 call [edx], no arguments",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? BA ?? ?? ?? ?? FF 12 C3",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::DerefInModule { imm_offset: 6 },
};

pub static NATIVE32_CALL_REG: StubPattern = StubPattern {
    name: "native32 call edx",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? BA ?? ?? ?? ?? FF D2 C2 ?? ??",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::ImmInModule { imm_offset: 6 },
};

pub static NATIVE32_CALL_REG_NOARGS: StubPattern = StubPattern {
    name: "native32 call edx, no arguments",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? BA ?? ?? ?? ?? FF D2 C3",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::ImmInModule { imm_offset: 6 },
};

pub static WIN2K: StubPattern = StubPattern {
    name: "win2k int 2Eh",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? 8D 54 24 04 CD 2E C2 ?? ??",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::None,
};

pub static WIN2K_NOARGS: StubPattern = StubPattern {
    name: "win2k int 2Eh, no arguments",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? 8D 54 24 04 CD 2E C3",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::None,
};

pub static WOW64: StubPattern = StubPattern {
    name: "wow64 call fs:[0C0h]",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? 33 C9 8D 54 24 04 64 FF 15 C0 00 00 00 83 C4 04 C2 ?? ??",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::None,
};

pub static WOW64_WIN8: StubPattern = StubPattern {
    name: "wow64 call fs:[0C0h], short form",
    kind: PatternKind::Service,
    template: "B8 ?? ?? ?? ?? 64 FF 15 C0 00 00 00 C2 ?? ??",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::None,
};

pub static NATIVE64: StubPattern = StubPattern {
    name: "native64 syscall",
    kind: PatternKind::Service,
    template: "4C 8B D1 B8 ?? ?? ?? ?? 0F 05 C3",
    id_offset: Some(4),
    rel32: None,
    check: PointerCheck::None,
};

pub static NATIVE64_SHARED_USER_DATA: StubPattern = StubPattern {
    name: "native64 syscall with SharedUserData test",
    kind: PatternKind::Service,
    template: "4C 8B D1 B8 ?? ?? ?? ?? F6 04 25 08 03 FE 7F 01 75 03 0F 05 C3 CD 2E C3",
    id_offset: Some(4),
    rel32: None,
    check: PointerCheck::None,
};

pub static X86_OWN_PATCH: StubPattern = StubPattern {
    name: "x86 service patch",
    kind: PatternKind::OwnPatch,
    template: "B8 ?? ?? ?? ?? BA ?? ?? ?? ?? FF E2",
    id_offset: Some(1),
    rel32: None,
    check: PointerCheck::None,
};

pub static X64_OWN_PATCH_NEAR: StubPattern = StubPattern {
    name: "x64 service patch, near",
    kind: PatternKind::OwnPatch,
    template: "B8 ?? ?? ?? ?? E9 ?? ?? ?? ??",
    id_offset: Some(1),
    rel32: Some((6, 10)),
    check: PointerCheck::None,
};

pub static X64_OWN_PATCH_FAR: StubPattern = StubPattern {
    name: "x64 service patch, far",
    kind: PatternKind::OwnPatch,
    template: "48 B8 ?? ?? ?? ?? ?? ?? ?? ?? FF E0",
    id_offset: None,
    rel32: None,
    check: PointerCheck::None,
};

pub static ENTRY_JUMP: StubPattern = StubPattern {
    name: "jmp rel32",
    kind: PatternKind::EntryJump,
    template: "E9 ?? ?? ?? ??",
    id_offset: None,
    rel32: Some((1, 5)),
    check: PointerCheck::None,
};

static X86_REDIRECTS: [&StubPattern; 2] = [&X86_OWN_PATCH, &ENTRY_JUMP];
static X64_REDIRECTS: [&StubPattern; 3] = [&X64_OWN_PATCH_NEAR, &X64_OWN_PATCH_FAR, &ENTRY_JUMP];

/// Redirects `save_original_function` accepts in relaxed mode.
pub fn redirects(arch: Arch) -> &'static [&'static StubPattern] {
    match arch {
        Arch::X86 => &X86_REDIRECTS,
        Arch::X64 => &X64_REDIRECTS,
    }
}

/// Check the pointer constraint of a matched pattern against the live
/// process.  Read failures fail the check.
pub fn check_pointer(pattern: &StubPattern, code: &[u8], process: &dyn ProcessMemory, module: &ModuleImage) -> bool {
    match pattern.check {
        PointerCheck::None => true,
        PointerCheck::ImmInModule { imm_offset } => {
            read_u32(code, imm_offset).is_some_and(|imm| module.contains(imm as u64))
        }
        PointerCheck::DerefInModule { imm_offset } => read_u32(code, imm_offset)
            .and_then(|imm| process.read_u32(imm as u64).ok())
            .is_some_and(|pointer| module.contains(pointer as u64)),
    }
}
