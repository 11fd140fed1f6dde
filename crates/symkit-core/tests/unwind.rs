//! Tests for virtual unwinding with CFI and Windows x64 unwind codes

use symkit_core::types::x86_64;
use symkit_core::{
    virtual_unwind_frame, Arch, LoadOptions, MemoryImage, RegisterFile, SectionMap, SymError, SymbolSession,
    UnwindLimits, UnwindSource,
};

const RETURN_ADDRESS: u64 = 0x4010_2030;

/// `.debug_frame` for `[0x1000, 0x1040)`: CIE with CFA = rsp+8 and the
/// return address at cfa-8; FDE with `push rbp` at +0, after which
/// CFA = rsp+16 and rbp is saved at cfa-16.
fn push_rbp_frame() -> Vec<u8>
{
    let mut out = Vec::new();
    let mut cie = Vec::new();
    cie.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    // version 1, no augmentation, code align 1, data align -8, ra column 16
    cie.extend_from_slice(&[1, 0, 1, 0x78, 16]);
    // def_cfa rsp+8; offset r16 at cfa-8
    cie.extend_from_slice(&[0x0c, 7, 8, 0x90, 1]);
    out.extend_from_slice(&(cie.len() as u32).to_le_bytes());
    out.extend(cie);

    let mut fde = Vec::new();
    fde.extend_from_slice(&0u32.to_le_bytes());
    fde.extend_from_slice(&0x1000u64.to_le_bytes());
    fde.extend_from_slice(&0x40u64.to_le_bytes());
    // advance 1; def_cfa_offset 16; offset r6 at cfa-16
    fde.extend_from_slice(&[0x41, 0x0e, 16, 0x86, 2]);
    while fde.len() % 4 != 0 {
        fde.push(0);
    }
    out.extend_from_slice(&(fde.len() as u32).to_le_bytes());
    out.extend(fde);
    out
}

/// Stack after `push rbp`: saved rbp at `sp`, return address at `sp + 8`.
fn pushed_stack(sp: u64) -> MemoryImage
{
    let mut mem = MemoryImage::new();
    mem.map(sp, vec![0; 16]);
    mem.write_u64(sp, 0xfeed);
    mem.write_u64(sp + 8, RETURN_ADDRESS);
    mem
}

#[test]
fn test_cfi_unwind_past_push()
{
    let frame = push_rbp_frame();
    let sp = 0x7fff_0000u64;
    let mem = pushed_stack(sp);
    let mut regs = RegisterFile::new(Arch::X86_64)
        .with(x86_64::RIP, 0x1010)
        .with(x86_64::RSP, sp)
        .with(x86_64::RBP, 0x1);

    let unwound = virtual_unwind_frame(
        Arch::X86_64,
        UnwindSource::DebugFrame,
        &frame,
        0,
        &mut regs,
        &mem,
        &UnwindLimits::default(),
    )
    .unwrap();
    assert!(unwound);
    assert_eq!(regs.get(x86_64::RSP), Some(sp + 16));
    assert_eq!(regs.get(x86_64::RIP), Some(RETURN_ADDRESS));
    assert_eq!(regs.get(x86_64::RBP), Some(0xfeed));
}

#[test]
fn test_cfi_unwind_applies_load_bias()
{
    let frame = push_rbp_frame();
    let bias = 0x5555_0000_0000u64;
    let sp = 0x7fff_0000u64;
    let mem = pushed_stack(sp);
    let mut regs = RegisterFile::new(Arch::X86_64)
        .with(x86_64::RIP, bias + 0x1010)
        .with(x86_64::RSP, sp);

    let session = SymbolSession::init(bias).with_unwind_limits(UnwindLimits {
        remember_depth: 4,
        ..UnwindLimits::default()
    });
    assert_eq!(session.unwind_limits().remember_depth, 4);
    assert!(session
        .virtual_unwind_frame(UnwindSource::DebugFrame, &frame, bias, &mut regs, &mem)
        .unwrap());
    assert_eq!(regs.get(x86_64::RSP), Some(sp + 16));

    // Without the bias the pc is outside every FDE.
    let mut regs = RegisterFile::new(Arch::X86_64)
        .with(x86_64::RIP, bias + 0x1010)
        .with(x86_64::RSP, sp);
    let before = regs.clone();
    assert!(session
        .virtual_unwind_frame(UnwindSource::DebugFrame, &frame, 0, &mut regs, &mem)
        .is_err());
    assert_eq!(regs, before);
}

#[test]
fn test_session_unwinds_with_loaded_frame_section()
{
    let frame = push_rbp_frame();
    let bias = 0x5555_0000_0000u64;
    let sp = 0x7fff_0000u64;
    let mem = pushed_stack(sp);
    let map = SectionMap::new()
        .with_section(".debug_frame", 0, &frame)
        .with_arch(Arch::X86_64);

    let mut session = SymbolSession::init(bias);
    assert!(!session.has_call_frame_info());
    // No symbols, but the frame section is still picked up.
    assert_eq!(
        session.load_debug_info(&[&map], LoadOptions::default()),
        Err(SymError::NoDebugInfo)
    );
    assert!(session.has_call_frame_info());

    for pc in [0x1010, 0x1030] {
        let mut regs = RegisterFile::new(Arch::X86_64)
            .with(x86_64::RIP, bias + pc)
            .with(x86_64::RSP, sp);
        assert!(session.unwind_frame(&mut regs, &mem).unwrap());
        assert_eq!(regs.get(x86_64::RSP), Some(sp + 16));
        assert_eq!(regs.get(x86_64::RIP), Some(RETURN_ADDRESS));
    }

    let mut regs = RegisterFile::new(Arch::X86_64)
        .with(x86_64::RIP, bias + 0x2000)
        .with(x86_64::RSP, sp);
    assert!(session.unwind_frame(&mut regs, &mem).is_err());
    assert_eq!(regs.get(x86_64::RIP), Some(bias + 0x2000));

    let empty = SymbolSession::init(0);
    let mut regs = RegisterFile::new(Arch::X86_64).with(x86_64::RIP, 0x1010);
    assert_eq!(empty.unwind_frame(&mut regs, &mem), Err(SymError::NoDebugInfo));
}

#[test]
fn test_cfi_unwind_is_deterministic()
{
    let frame = push_rbp_frame();
    let sp = 0x7fff_0000u64;
    let mem = pushed_stack(sp);
    let snapshot = RegisterFile::new(Arch::X86_64)
        .with(x86_64::RIP, 0x1020)
        .with(x86_64::RSP, sp)
        .with(x86_64::RBX, 0x77);

    let run = || {
        let mut regs = snapshot.clone();
        virtual_unwind_frame(
            Arch::X86_64,
            UnwindSource::DebugFrame,
            &frame,
            0,
            &mut regs,
            &mem,
            &UnwindLimits::default(),
        )
        .unwrap();
        regs
    };
    let first = run();
    for _ in 0..8 {
        assert_eq!(run(), first);
    }
    assert_eq!(first.get(x86_64::RBX), Some(0x77));
}

const IMAGE: u64 = 0x1_4000_0000;

/// `.pdata` for one function at rva `[0x1000, 0x1100)` whose prologue is
/// `push rbx; sub rsp, 0x20`, with its `UNWIND_INFO` mapped at rva 0x3000.
fn nt_function() -> (Vec<u8>, MemoryImage)
{
    let pdata: Vec<u8> = [0x1000u32, 0x1100, 0x3000].iter().flat_map(|v| v.to_le_bytes()).collect();
    // version 1, prologue 5 bytes, 2 codes, no frame register
    let mut info = vec![0x01, 5, 2, 0];
    // @5 ALLOC_SMALL (0x20 = (3 + 1) * 8); @1 PUSH_NONVOL rbx
    info.extend_from_slice(&[5, 0x32, 1, 0x30]);
    let mut mem = MemoryImage::new();
    mem.map(IMAGE + 0x3000, info);
    (pdata, mem)
}

#[test]
fn test_nt_unwind_past_prologue()
{
    let (pdata, mut mem) = nt_function();
    let caller_sp = 0x00ff_8000u64;
    // return address, then saved rbx, then the 0x20-byte allocation
    let sp = caller_sp - 8 - 8 - 0x20;
    mem.map(sp, vec![0; 0x30]);
    mem.write_u64(caller_sp - 16, 0xb0b0);
    mem.write_u64(caller_sp - 8, IMAGE + 0x2468);

    let mut regs = RegisterFile::new(Arch::X86_64)
        .with(x86_64::RIP, IMAGE + 0x1050)
        .with(x86_64::RSP, sp)
        .with(x86_64::RBX, 0xdead);

    let unwound = virtual_unwind_frame(
        Arch::X86_64,
        UnwindSource::Pdata,
        &pdata,
        IMAGE,
        &mut regs,
        &mem,
        &UnwindLimits::default(),
    )
    .unwrap();
    assert!(unwound);
    assert_eq!(regs.get(x86_64::RSP), Some(caller_sp));
    assert_eq!(regs.get(x86_64::RBX), Some(0xb0b0));
    assert_eq!(regs.get(x86_64::RIP), Some(IMAGE + 0x2468));
}

#[test]
fn test_pdata_requires_x86_64()
{
    let (pdata, mem) = nt_function();
    let mut regs = RegisterFile::new(Arch::Arm64).with(symkit_core::types::arm64::PC, IMAGE + 0x1050);
    assert!(virtual_unwind_frame(
        Arch::Arm64,
        UnwindSource::Pdata,
        &pdata,
        IMAGE,
        &mut regs,
        &mem,
        &UnwindLimits::default(),
    )
    .is_err());
}
