//! Service stub patching, followed through with the interpreter.

use iced_x86::Register;

use super::cpu::{Cpu, Stop};
use super::pe::PeBuilder;
use super::{external_return, interceptor, second_return, Fixture, X64_BASE, X86_BASE};
use crate::emit::{self, Arch};
use crate::error::InterceptionError;
use crate::process::ProcessMemory;
use crate::resolver::{ResolverConfig, ResolverStrategy, ResolverThunk, ServiceVariant, SetupRequest};

const SERVICE_ID: u32 = 0x19;
const ARGUMENT: u64 = 0x1234;

/// `mov edx, esp; sysenter; ret`
const KI_FAST_SYSTEM_CALL: [u8; 5] = [0x8B, 0xD4, 0x0F, 0x34, 0xC3];
/// Where `KiFastSystemCall` lands: the first export of every x86 fixture.
const KI_FAST_SYSTEM_CALL_ADDRESS: u32 = X86_BASE as u32 + 0x1000;

fn with_id(template: &[u8], offset: usize) -> Vec<u8> {
    let mut stub = template.to_vec();
    stub[offset..offset + 4].copy_from_slice(&SERVICE_ID.to_le_bytes());
    stub
}

fn native32_call_ptr() -> Vec<u8> {
    with_id(&[0xB8, 0, 0, 0, 0, 0xBA, 0x00, 0x03, 0xFE, 0x7F, 0xFF, 0x12, 0xC2, 0x04, 0x00], 1)
}

fn native32_call_ptr_noargs() -> Vec<u8> {
    with_id(&[0xB8, 0, 0, 0, 0, 0xBA, 0x00, 0x03, 0xFE, 0x7F, 0xFF, 0x12, 0xC3], 1)
}

fn native32_call_reg() -> Vec<u8> {
    let mut stub = with_id(&[0xB8, 0, 0, 0, 0, 0xBA, 0, 0, 0, 0, 0xFF, 0xD2, 0xC2, 0x04, 0x00], 1);
    stub[6..10].copy_from_slice(&KI_FAST_SYSTEM_CALL_ADDRESS.to_le_bytes());
    stub
}

fn win2k() -> Vec<u8> {
    with_id(&[0xB8, 0, 0, 0, 0, 0x8D, 0x54, 0x24, 0x04, 0xCD, 0x2E, 0xC2, 0x04, 0x00], 1)
}

fn wow64() -> Vec<u8> {
    with_id(
        &[
            0xB8, 0, 0, 0, 0, 0x33, 0xC9, 0x8D, 0x54, 0x24, 0x04, 0x64, 0xFF, 0x15, 0xC0, 0x00, 0x00, 0x00, 0x83,
            0xC4, 0x04, 0xC2, 0x04, 0x00,
        ],
        1,
    )
}

fn wow64_win8() -> Vec<u8> {
    with_id(&[0xB8, 0, 0, 0, 0, 0x64, 0xFF, 0x15, 0xC0, 0x00, 0x00, 0x00, 0xC2, 0x04, 0x00], 1)
}

fn native64() -> Vec<u8> {
    with_id(&[0x4C, 0x8B, 0xD1, 0xB8, 0, 0, 0, 0, 0x0F, 0x05, 0xC3], 4)
}

fn native64_shared_user_data() -> Vec<u8> {
    with_id(
        &[
            0x4C, 0x8B, 0xD1, 0xB8, 0, 0, 0, 0, 0xF6, 0x04, 0x25, 0x08, 0x03, 0xFE, 0x7F, 0x01, 0x75, 0x03, 0x0F,
            0x05, 0xC3, 0xCD, 0x2E, 0xC3,
        ],
        4,
    )
}

fn fixture(arch: Arch, stub: &[u8]) -> Fixture {
    let builder = PeBuilder::new(arch)
        .function("KiFastSystemCall", &KI_FAST_SYSTEM_CALL)
        .function("NtTest", stub);
    Fixture::new(arch, builder).with_shared_user_data(KI_FAST_SYSTEM_CALL_ADDRESS)
}

fn resolver(f: &Fixture, variant: ServiceVariant, relaxed: bool) -> ResolverThunk<'_> {
    ResolverThunk::new(
        &f.process,
        ResolverStrategy::Service(variant),
        ResolverConfig::new(f.arch).relaxed(relaxed),
    )
}

fn request(f: &Fixture, interceptor_address: u64, storage: u64) -> SetupRequest<'_> {
    SetupRequest::new(&f.module, "NtTest")
        .interceptor_entry_point(interceptor_address)
        .storage(storage, 0x100)
}

/// Call the patched function and check the interceptor sees the copy of
/// the stub as the original; then call the copy and check it enters the
/// kernel with the right service id.
fn assert_round_trip(f: &Fixture) {
    let arch = f.arch;
    let mut cpu = Cpu::new(&f.process, arch);
    cpu.call(f.address_of("NtTest"), external_return(arch), &[ARGUMENT]);
    let entry_sp = cpu.sp();
    assert_eq!(cpu.run(&[interceptor(arch), external_return(arch)]), Stop::At(interceptor(arch)));
    match arch {
        Arch::X86 => {
            assert_eq!(cpu.sp(), entry_sp - 4);
            assert_eq!(cpu.stack(0), external_return(arch));
            assert_eq!(cpu.stack(1), f.storage);
            assert_eq!(cpu.stack(2), ARGUMENT);
        }
        Arch::X64 => {
            assert_eq!(cpu.sp(), entry_sp);
            assert_eq!(cpu.stack(0), external_return(arch));
            assert_eq!(cpu.reg(Register::R10), f.storage);
            assert_eq!(cpu.reg(Register::RCX), ARGUMENT);
        }
    }

    cpu.call(f.storage, second_return(arch), &[ARGUMENT]);
    match cpu.run(&[interceptor(arch), second_return(arch)]) {
        Stop::Syscall { eax, .. } => assert_eq!(eax, SERVICE_ID),
        other => panic!("original did not reach the kernel: {other:?}"),
    }
}

fn patch_and_run(arch: Arch, variant: ServiceVariant, stub: &[u8]) {
    let f = fixture(arch, stub);
    let mut r = resolver(&f, variant, false);
    let outcome = r.setup(&request(&f, interceptor(arch), f.storage)).unwrap();
    assert_eq!(outcome.storage_used, 32 + emit::internal_thunk_size(arch));
    assert_round_trip(&f);
}

#[test]
fn test_native32_stubs() {
    patch_and_run(Arch::X86, ServiceVariant::Native32, &native32_call_ptr());
    patch_and_run(Arch::X86, ServiceVariant::Native32, &native32_call_ptr_noargs());
    patch_and_run(Arch::X86, ServiceVariant::Native32, &native32_call_reg());
}

#[test]
fn test_win2k_stub() {
    patch_and_run(Arch::X86, ServiceVariant::Win2k, &win2k());
}

#[test]
fn test_wow64_stubs() {
    patch_and_run(Arch::X86, ServiceVariant::Wow64, &wow64());
    patch_and_run(Arch::X86, ServiceVariant::Wow64, &wow64_win8());
    patch_and_run(Arch::X86, ServiceVariant::Wow64, &native32_call_reg());
}

#[test]
fn test_native64_stubs() {
    patch_and_run(Arch::X64, ServiceVariant::Native64, &native64());
    patch_and_run(Arch::X64, ServiceVariant::Native64, &native64_shared_user_data());
}

#[test]
fn test_native64_far_storage() {
    let far = 0x7FFA_0000_0000;
    let builder = PeBuilder::new(Arch::X64).function("NtTest", &native64_shared_user_data());
    let f = Fixture::at(Arch::X64, builder, X64_BASE, far).with_shared_user_data(0);
    resolver(&f, ServiceVariant::Native64, false).setup(&request(&f, interceptor(Arch::X64), far)).unwrap();
    let patched = f.process.read_vec(f.address_of("NtTest"), 2).unwrap();
    assert_eq!(patched, vec![0x48, 0xB8]);
    assert_round_trip(&f);

    // The short stub has no room for an absolute jump.
    let builder = PeBuilder::new(Arch::X64).function("NtTest", &native64());
    let f = Fixture::at(Arch::X64, builder, X64_BASE, far);
    let result = resolver(&f, ServiceVariant::Native64, false).setup(&request(&f, interceptor(Arch::X64), far));
    assert!(matches!(result, Err(InterceptionError::Unsuccessful(_))));
    assert!(f.process.journal().is_empty());
}

#[test]
fn test_variant_must_match_architecture() {
    let f = fixture(Arch::X86, &native32_call_ptr());
    let result = resolver(&f, ServiceVariant::Native64, false).setup(&request(&f, interceptor(Arch::X86), f.storage));
    assert!(matches!(result, Err(InterceptionError::InvalidParameter(_))));
}

#[test]
fn test_unrecognized_stub_is_left_alone() {
    // A hot-patchable function prologue is not a service stub.
    let f = fixture(Arch::X86, &[0x8B, 0xFF, 0x55, 0x8B, 0xEC, 0x5D, 0xC3]);
    let result = resolver(&f, ServiceVariant::Native32, true).setup(&request(&f, interceptor(Arch::X86), f.storage));
    assert!(matches!(result, Err(InterceptionError::Unsuccessful(_))));
    assert!(f.process.journal().is_empty());
}

#[test]
fn test_small_storage_writes_nothing() {
    let f = fixture(Arch::X86, &native32_call_ptr());
    let request = request(&f, interceptor(Arch::X86), f.storage).storage(f.storage, 16);
    let result = resolver(&f, ServiceVariant::Native32, false).setup(&request);
    assert!(matches!(result, Err(InterceptionError::BufferTooSmall { needed: 62, available: 16 })));
    assert!(f.process.journal().is_empty());
}

#[test]
fn test_storage_written_before_target() {
    let f = fixture(Arch::X86, &native32_call_ptr());
    resolver(&f, ServiceVariant::Native32, false)
        .setup(&request(&f, interceptor(Arch::X86), f.storage))
        .unwrap();
    let journal = f.process.journal();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].address, f.storage);
    assert_eq!(journal[0].len, 62);
    assert_eq!(journal[1].address, f.address_of("NtTest"));
    assert_eq!(journal[1].len, emit::X86_SERVICE_PATCH_LEN);
}

#[test]
fn test_protection_failure_leaves_target_intact() {
    let stub = native32_call_ptr();
    let f = fixture(Arch::X86, &stub);
    let target = f.address_of("NtTest");
    f.process.lock_protection(target);
    let result = resolver(&f, ServiceVariant::Native32, false).setup(&request(&f, interceptor(Arch::X86), f.storage));
    assert!(matches!(result, Err(InterceptionError::Memory(_))));
    assert_eq!(f.process.read_vec(target, stub.len()).unwrap(), stub);
}

#[test]
fn test_relaxed_chains_onto_own_patch() {
    for (arch, variant, stub) in [
        (Arch::X86, ServiceVariant::Native32, native32_call_ptr()),
        (Arch::X64, ServiceVariant::Native64, native64()),
    ] {
        let f = fixture(arch, &stub);
        let second_storage = f.storage + 0x200;
        let first = interceptor(arch);
        let second = first + 0x1000;
        resolver(&f, variant, false).setup(&request(&f, first, f.storage)).unwrap();

        // Strict mode refuses a stub that is already patched.
        f.process.clear_journal();
        let strict = resolver(&f, variant, false).setup(&request(&f, second, second_storage));
        assert!(matches!(strict, Err(InterceptionError::Unsuccessful(_))));
        assert!(f.process.journal().is_empty());

        resolver(&f, variant, true).setup(&request(&f, second, second_storage)).unwrap();

        let mut cpu = Cpu::new(&f.process, arch);
        cpu.call(f.address_of("NtTest"), external_return(arch), &[ARGUMENT]);
        assert_eq!(cpu.run(&[first, second]), Stop::At(second));
        cpu.call(second_storage, second_return(arch), &[ARGUMENT]);
        assert_eq!(cpu.run(&[first, second]), Stop::At(first));
        let original = match arch {
            Arch::X86 => cpu.stack(1),
            Arch::X64 => cpu.reg(Register::R10),
        };
        assert_eq!(original, f.storage);
        cpu.call(f.storage, second_return(arch), &[ARGUMENT]);
        assert!(matches!(cpu.run(&[first, second]), Stop::Syscall { eax: SERVICE_ID, .. }));
    }
}

#[test]
fn test_relaxed_chains_onto_foreign_jump() {
    // NtTest starts with a jump to Detour, which returns 0x77.
    let detour = PeBuilder::function_rva(2);
    let nt_test = PeBuilder::function_rva(1);
    let rel = (detour as i32 - (nt_test as i32 + 5)).to_le_bytes();
    let jump = [0xE9, rel[0], rel[1], rel[2], rel[3]];
    let builder = PeBuilder::new(Arch::X86)
        .function("KiFastSystemCall", &KI_FAST_SYSTEM_CALL)
        .function("NtTest", &jump)
        .function("Detour", &[0xB8, 0x77, 0x00, 0x00, 0x00, 0xC3]);
    let f = Fixture::new(Arch::X86, builder);

    let strict = resolver(&f, ServiceVariant::Native32, false).setup(&request(&f, interceptor(Arch::X86), f.storage));
    assert!(matches!(strict, Err(InterceptionError::Unsuccessful(_))));

    resolver(&f, ServiceVariant::Native32, true)
        .setup(&request(&f, interceptor(Arch::X86), f.storage))
        .unwrap();
    let mut cpu = Cpu::new(&f.process, Arch::X86);
    cpu.call(f.address_of("NtTest"), external_return(Arch::X86), &[]);
    assert_eq!(cpu.run(&[interceptor(Arch::X86)]), Stop::At(interceptor(Arch::X86)));
    cpu.call(f.storage, second_return(Arch::X86), &[]);
    assert_eq!(cpu.run(&[second_return(Arch::X86)]), Stop::At(second_return(Arch::X86)));
    assert_eq!(cpu.reg(Register::EAX), 0x77);
}

#[test]
fn test_is_function_a_service() {
    let check = |f: &Fixture, variant: ServiceVariant| {
        let mut r = resolver(f, variant, false);
        r.init(&request(f, interceptor(f.arch), f.storage)).unwrap();
        r.is_function_a_service(&f.module)
    };

    let f = fixture(Arch::X86, &native32_call_ptr());
    assert!(check(&f, ServiceVariant::Native32));
    assert!(!check(&f, ServiceVariant::Win2k));

    // The system call pointer must lead back into the module.
    let builder = PeBuilder::new(Arch::X86)
        .function("KiFastSystemCall", &KI_FAST_SYSTEM_CALL)
        .function("NtTest", &native32_call_ptr());
    let f = Fixture::new(Arch::X86, builder).with_shared_user_data(0x0040_1000);
    assert!(!check(&f, ServiceVariant::Native32));

    // The register form must name code inside the module.
    let mut stub = native32_call_reg();
    stub[6..10].copy_from_slice(&0x0040_1000u32.to_le_bytes());
    assert!(!check(&fixture(Arch::X86, &stub), ServiceVariant::Native32));

    let mut stub = native32_call_ptr();
    stub[11] = 0x13;
    assert!(!check(&fixture(Arch::X86, &stub), ServiceVariant::Native32));

    assert!(check(&fixture(Arch::X64, &native64()), ServiceVariant::Native64));
    let mut stub = native64();
    stub[9] = 0x34;
    assert!(!check(&fixture(Arch::X64, &stub), ServiceVariant::Native64));

    // Only service resolvers recognize stubs.
    let f = fixture(Arch::X86, &native32_call_ptr());
    let mut r = ResolverThunk::new(&f.process, ResolverStrategy::Sidestep, ResolverConfig::new(Arch::X86));
    r.init(&request(&f, interceptor(Arch::X86), f.storage)).unwrap();
    assert!(!r.is_function_a_service(&f.module));
}
