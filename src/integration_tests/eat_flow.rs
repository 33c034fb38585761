//! Export table redirection seen through a fresh export lookup.

use iced_x86::Register;

use super::cpu::{Cpu, Stop};
use super::pe::PeBuilder;
use super::{external_return, interceptor, second_return, Fixture};
use crate::emit::Arch;
use crate::image::ModuleImage;
use crate::resolver::{ResolverConfig, ResolverStrategy, ResolverThunk, SetupRequest};

#[test]
fn test_lookup_returns_thunk() {
    for arch in [Arch::X86, Arch::X64] {
        // NtClose returns 1 in eax.
        let builder = PeBuilder::new(arch)
            .function("NtOpenFile", &[0x31, 0xC0, 0xC3])
            .function("NtClose", &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        let f = Fixture::new(arch, builder);
        let target = f.address_of("NtClose");

        let mut resolver = ResolverThunk::new(&f.process, ResolverStrategy::Eat, ResolverConfig::new(arch));
        let request = SetupRequest::new(&f.module, "NtClose")
            .interceptor_entry_point(interceptor(arch))
            .storage(f.storage, 0x40);
        resolver.setup(&request).unwrap();

        // The function itself is untouched; only the lookup changed.
        let reloaded = ModuleImage::from_process(&f.process, f.module.base()).unwrap();
        assert_eq!(reloaded.proc_address("NtClose").unwrap(), f.storage);
        assert_eq!(reloaded.proc_address("NtOpenFile").unwrap(), f.address_of("NtOpenFile"));

        let mut cpu = Cpu::new(&f.process, arch);
        cpu.call(f.storage, external_return(arch), &[7]);
        assert_eq!(cpu.run(&[interceptor(arch)]), Stop::At(interceptor(arch)));
        let original = match arch {
            Arch::X86 => cpu.stack(1),
            Arch::X64 => cpu.reg(Register::R10),
        };
        assert_eq!(original, target);

        cpu.call(original, second_return(arch), &[7]);
        assert_eq!(cpu.run(&[second_return(arch)]), Stop::At(second_return(arch)));
        assert_eq!(cpu.reg(Register::EAX), 1);
    }
}

#[test]
fn test_forwarded_export_is_not_redirected() {
    let builder = PeBuilder::new(Arch::X86).forwarder("HeapAlloc", "NTDLL.RtlAllocateHeap");
    let f = Fixture::new(Arch::X86, builder);
    let mut resolver = ResolverThunk::new(&f.process, ResolverStrategy::Eat, ResolverConfig::new(Arch::X86));
    let request = SetupRequest::new(&f.module, "HeapAlloc")
        .interceptor_entry_point(interceptor(Arch::X86))
        .storage(f.storage, 0x40);
    assert!(resolver.setup(&request).is_err());
    assert!(f.process.journal().is_empty());
}
