// SPDX-License-Identifier: MIT

//! In-place patching of system service stubs.
//!
//! The variants differ only in the stub templates they recognize; the copy,
//! thunk and patch steps are shared.

pub mod patterns;

use tracing::{info, warn};

use crate::emit::{self, Arch, INT3};
use crate::error::InterceptionError;
use crate::image::ModuleImage;
use crate::process::write_protected;

use super::{ResolverThunk, SetupOutcome, SetupRequest};
use patterns::{PatternKind, StubPattern};

/// Bytes of storage reserved for the copy of the original stub.
pub const COPY_AREA_LEN: usize = 32;

/// OS and CPU combination whose stubs a resolver expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVariant {
    /// 32-bit Windows XP and later.
    Native32,
    /// Windows 2000, entering the kernel with `int 2Eh`.
    Win2k,
    /// 32-bit code on 64-bit Windows.
    Wow64,
    Native64,
}

static NATIVE32_TEMPLATES: [&StubPattern; 4] = [
    &patterns::NATIVE32_CALL_PTR,
    &patterns::NATIVE32_CALL_PTR_NOARGS,
    &patterns::NATIVE32_CALL_REG,
    &patterns::NATIVE32_CALL_REG_NOARGS,
];
static WIN2K_TEMPLATES: [&StubPattern; 2] = [&patterns::WIN2K, &patterns::WIN2K_NOARGS];
static WOW64_TEMPLATES: [&StubPattern; 3] =
    [&patterns::WOW64, &patterns::WOW64_WIN8, &patterns::NATIVE32_CALL_REG];
static NATIVE64_TEMPLATES: [&StubPattern; 2] = [&patterns::NATIVE64, &patterns::NATIVE64_SHARED_USER_DATA];

impl ServiceVariant {
    /// Pick the variant for a target process.
    pub fn select(os_major: u32, os_minor: u32, wow64: bool, arch: Arch) -> Self {
        match (arch, wow64, os_major, os_minor) {
            (Arch::X64, _, _, _) => ServiceVariant::Native64,
            (Arch::X86, true, _, _) => ServiceVariant::Wow64,
            (Arch::X86, false, 5, 0) => ServiceVariant::Win2k,
            (Arch::X86, false, _, _) => ServiceVariant::Native32,
        }
    }

    pub fn arch(self) -> Arch {
        match self {
            ServiceVariant::Native64 => Arch::X64,
            _ => Arch::X86,
        }
    }

    pub fn templates(self) -> &'static [&'static StubPattern] {
        match self {
            ServiceVariant::Native32 => &NATIVE32_TEMPLATES,
            ServiceVariant::Win2k => &WIN2K_TEMPLATES,
            ServiceVariant::Wow64 => &WOW64_TEMPLATES,
            ServiceVariant::Native64 => &NATIVE64_TEMPLATES,
        }
    }
}

/// A stub that matched one of the accepted shapes.
#[derive(Debug, Clone, Copy)]
pub struct RecognizedStub {
    pub pattern: &'static StubPattern,
    pub len: usize,
    pub service_id: Option<u32>,
}

/// Match `code` against the variant's templates, and in relaxed mode
/// against the redirects `save_original_function` understands.
pub fn recognize(
    resolver: &ResolverThunk<'_>,
    variant: ServiceVariant,
    module: &ModuleImage,
    code: &[u8],
) -> Option<RecognizedStub> {
    let found = |pattern: &'static StubPattern| RecognizedStub {
        pattern,
        len: pattern.len(),
        service_id: pattern.service_id(code),
    };
    let service = variant
        .templates()
        .iter()
        .copied()
        .find(|p| p.matches(code) && patterns::check_pointer(p, code, resolver.process(), module))
        .map(found);
    if service.is_some() || !resolver.config().relaxed {
        return service;
    }
    save_original_function(variant.arch(), code).map(found)
}

/// The redirect already present at the target, if it is one relaxed mode
/// can chain onto.
pub fn save_original_function(arch: Arch, code: &[u8]) -> Option<&'static StubPattern> {
    patterns::redirects(arch).iter().copied().find(|p| p.matches(code))
}

impl ResolverThunk<'_> {
    /// True when the resolved target looks like a system service stub this
    /// resolver can patch.
    pub fn is_function_a_service(&self, module: &ModuleImage) -> bool {
        let super::ResolverStrategy::Service(variant) = self.strategy() else {
            return false;
        };
        match self.leading_bytes() {
            Some(code) => recognize(self, variant, module, &code).is_some(),
            None => false,
        }
    }

    fn leading_bytes(&self) -> Option<Vec<u8>> {
        self.process().read_vec(self.target(), COPY_AREA_LEN).ok()
    }

    /// Write `[stub copy, int3 padding][internal thunk]` into the storage,
    /// then overwrite the stub with a jump to the internal thunk.  Nothing
    /// is written unless both pieces could be built.
    pub(crate) fn perform_patch(
        &self,
        stub: &RecognizedStub,
        code: &[u8],
        storage: u64,
    ) -> Result<usize, InterceptionError> {
        let arch = self.config().arch;
        let target = self.target();
        let mut thunk = code
            .get(..stub.len)
            .ok_or_else(|| InterceptionError::unsuccessful("stub is longer than the bytes read"))?
            .to_vec();
        if let Some((rel_offset, next_ip_offset)) = stub.pattern.rel32 {
            emit::rebase_rel32(arch, &mut thunk, rel_offset, next_ip_offset, target, storage)
                .ok_or_else(|| InterceptionError::unsuccessful("existing redirect is out of reach of the storage"))?;
        }
        thunk.resize(COPY_AREA_LEN, INT3);
        let internal_thunk = storage + COPY_AREA_LEN as u64;
        thunk.extend(emit::internal_thunk(arch, storage, self.interceptor())?);

        let patch = emit::service_patch(arch, stub.service_id, target, internal_thunk, stub.len)
            .ok_or_else(|| InterceptionError::unsuccessful("no redirect fits over the stub"))?;

        self.write_storage(storage, &thunk)?;
        write_protected(self.process(), target, &patch)?;
        Ok(thunk.len())
    }
}

pub(crate) fn setup(
    resolver: &mut ResolverThunk<'_>,
    variant: ServiceVariant,
    request: &SetupRequest<'_>,
) -> Result<SetupOutcome, InterceptionError> {
    let arch = resolver.config().arch;
    if variant.arch() != arch {
        return Err(InterceptionError::InvalidParameter(format!(
            "{variant:?} stubs are not {arch:?} code"
        )));
    }
    let validated = resolver.init(request)?;
    let target = resolver.target();
    let storage = validated.storage;

    let code = resolver
        .leading_bytes()
        .ok_or_else(|| InterceptionError::unsuccessful("cannot read the target"))?;
    let Some(stub) = recognize(resolver, variant, validated.target_module, &code) else {
        warn!(target_address = target, ?variant, "refusing to patch, not a service stub");
        return Err(InterceptionError::unsuccessful("target is not a recognized service stub"));
    };

    let storage_used = resolver.perform_patch(&stub, &code, storage)?;
    if stub.pattern.kind != PatternKind::Service {
        info!(target_address = target, redirect = stub.pattern.name, "chained onto an existing redirect");
    }
    info!(target_address = target, storage, pattern = stub.pattern.name, "patched service stub");
    Ok(SetupOutcome { storage_used })
}
