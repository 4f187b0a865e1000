//! End-to-end tests: generate UML blocks and actually run them. These only
//! execute on an AArch64 host; generation-side coverage lives in generate.rs.
#![cfg(target_arch = "aarch64")]

use umljit_aa64::space::RamBus;
use umljit_aa64::state::MachineState;
use umljit_aa64::uml::*;
use umljit_aa64::{Backend, BackendConfig, HandleId};

fn backend() -> Backend {
    Backend::new(BackendConfig::default()).unwrap()
}

fn imm(value: u64) -> Parameter {
    Parameter::Immediate(value)
}

fn ireg(num: u8) -> Parameter {
    Parameter::IntReg(num)
}

fn freg(num: u8) -> Parameter {
    Parameter::FloatReg(num)
}

/// Wrap `body` in an entry handle, generate and run it.
fn run(be: &mut Backend, entry: HandleId, body: Vec<Inst>) -> u32 {
    let mut program = vec![Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry))];
    program.extend(body);
    be.generate(&program).unwrap();
    be.execute(entry)
}

fn run_simple(body: Vec<Inst>) -> u32 {
    let mut be = backend();
    let entry = be.create_handle("entry");
    run(&mut be, entry, body)
}

const ALL_INT_FLAGS: FlagSet = FlagSet::from_bits_truncate(
    FlagSet::C.bits() | FlagSet::V.bits() | FlagSet::Z.bits() | FlagSet::S.bits(),
);

#[test]
fn exit_returns_value() {
    let result = run_simple(vec![Inst::new(Opcode::Exit, 4).arg(imm(42))]);
    assert_eq!(result, 42);
}

#[test]
fn mov_wide_immediate_lands_in_memory() {
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0x1122_3344_5566_7788)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(result, 0);
    assert_eq!(*cell, 0x1122_3344_5566_7788);
}

#[test]
fn add_wraps_and_sets_carry() {
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    let result = run_simple(vec![
        Inst::new(Opcode::Add, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(ireg(0))
            .arg(imm(0xffff_ffff_ffff_fffe))
            .arg(imm(3)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(1))
            .arg(imm(ALL_INT_FLAGS.bits() as u64)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);

    // C set; V, Z, S clear
    assert_eq!(result, FlagSet::C.bits() as u32);
    assert_eq!(*cell, 1);
}

#[test]
fn sub_borrow_sets_carry_and_sign() {
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    let result = run_simple(vec![
        Inst::new(Opcode::Sub, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(ireg(0))
            .arg(imm(0))
            .arg(imm(1)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(1))
            .arg(imm(ALL_INT_FLAGS.bits() as u64)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);

    assert_eq!(result, (FlagSet::C | FlagSet::S).bits() as u32);
    assert_eq!(*cell, u64::MAX);
}

#[test]
fn addc_chains_a_128_bit_sum() {
    let mut lo = Box::new(0u64);
    let lop = Parameter::mem::<u64>(&mut *lo);
    let mut hi = Box::new(0u64);
    let hip = Parameter::mem::<u64>(&mut *hi);

    // 0x00000001_ffffffffffffffff + 0x00000002_0000000000000001
    let result = run_simple(vec![
        Inst::new(Opcode::Add, 8)
            .with_flags(FlagSet::C)
            .arg(ireg(0))
            .arg(imm(0xffff_ffff_ffff_ffff))
            .arg(imm(1)),
        Inst::new(Opcode::Addc, 8)
            .with_flags(FlagSet::C)
            .arg(ireg(1))
            .arg(imm(1))
            .arg(imm(2)),
        Inst::new(Opcode::Mov, 8).arg(lop).arg(ireg(0)),
        Inst::new(Opcode::Mov, 8).arg(hip).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(result, 0);
    assert_eq!(*lo, 0);
    assert_eq!(*hi, 4);
}

#[test]
fn subb_chains_a_128_bit_difference() {
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    // (0x0000000a_0000000000000000) - (0x00000003_0000000000000001)
    let result = run_simple(vec![
        Inst::new(Opcode::Sub, 8)
            .with_flags(FlagSet::C)
            .arg(ireg(0))
            .arg(imm(0))
            .arg(imm(1)),
        Inst::new(Opcode::Subb, 8)
            .with_flags(FlagSet::C)
            .arg(ireg(1))
            .arg(imm(0xa))
            .arg(imm(3)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);
    assert_eq!(*cell, u64::MAX);
    assert_eq!(result, 6);
}

#[test]
fn carry_cache_polarities_agree() {
    // canonical (after adds), logical (after cmp) and poisoned (after CARRY)
    // reads of the carry flag must all see the same value
    let result = run_simple(vec![
        Inst::new(Opcode::Add, 8)
            .with_flags(FlagSet::C)
            .arg(ireg(0))
            .arg(imm(2))
            .arg(imm(3)),
        Inst::new(Opcode::Set, 8).with_cond(Cond::C).arg(ireg(1)),
        Inst::new(Opcode::Cmp, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(imm(3))
            .arg(imm(5)),
        Inst::new(Opcode::Set, 8).with_cond(Cond::C).arg(ireg(2)),
        Inst::new(Opcode::Carry, 8)
            .with_flags(FlagSet::C)
            .arg(imm(1))
            .arg(imm(0)),
        Inst::new(Opcode::Set, 8).with_cond(Cond::C).arg(ireg(3)),
        // pack: i1 | i2 << 1 | i3 << 2
        Inst::new(Opcode::Shl, 8).arg(ireg(2)).arg(ireg(2)).arg(imm(1)),
        Inst::new(Opcode::Shl, 8).arg(ireg(3)).arg(ireg(3)).arg(imm(2)),
        Inst::new(Opcode::Or, 8).arg(ireg(1)).arg(ireg(1)).arg(ireg(2)),
        Inst::new(Opcode::Or, 8).arg(ireg(1)).arg(ireg(1)).arg(ireg(3)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);

    // add 2+3 leaves carry clear, 3-5 borrows, CARRY forces 1
    assert_eq!(result, 0b110);
}

#[test]
fn conditional_loop_sums() {
    let mut be = backend();
    let entry = be.create_handle("entry");
    let top = be.create_label();

    let result = run(
        &mut be,
        entry,
        vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0)),
            Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(100)),
            Inst::new(Opcode::Label, 4).arg(Parameter::Label(top)),
            Inst::new(Opcode::Add, 8).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            Inst::new(Opcode::Sub, 8)
                .with_flags(FlagSet::Z)
                .arg(ireg(1))
                .arg(ireg(1))
                .arg(imm(1)),
            Inst::new(Opcode::Jmp, 4).with_cond(Cond::Nz).arg(Parameter::Label(top)),
            Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        ],
    );
    assert_eq!(result, 5050);
}

#[test]
fn shift_carry_is_last_bit_out() {
    // left shift by one: carry = old bit 63
    let result = run_simple(vec![
        Inst::new(Opcode::Shl, 8)
            .with_flags(FlagSet::C | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(imm(0x8000_0000_0000_0001))
            .arg(imm(1)),
        Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(imm(FlagSet::C.bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);
    assert_eq!(result, 1);

    // right shift by one: carry = old bit 0
    let result = run_simple(vec![
        Inst::new(Opcode::Shr, 8)
            .with_flags(FlagSet::C | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(imm(0x8000_0000_0000_0001))
            .arg(imm(1)),
        Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(imm(FlagSet::C.bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);
    assert_eq!(result, 1);

    // count equal to the width masks to zero and clears carry
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);
    let result = run_simple(vec![
        Inst::new(Opcode::Shl, 8)
            .with_flags(FlagSet::C | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(imm(0x1234))
            .arg(imm(64)),
        Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(imm(FlagSet::C.bits() as u64)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);
    assert_eq!(result, 0);
    assert_eq!(*cell, 0x1234);
}

#[test]
fn shift_carry_with_register_count() {
    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(2)).arg(imm(1)),
        Inst::new(Opcode::Shl, 8)
            .with_flags(FlagSet::C | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(imm(0x8000_0000_0000_0000))
            .arg(ireg(2)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(1))
            .arg(imm((FlagSet::C | FlagSet::Z).bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);
    // carry out of the top bit and a zero result
    assert_eq!(result, (FlagSet::C | FlagSet::Z).bits() as u32);
}

#[test]
fn rol_and_ror_execute() {
    let result = run_simple(vec![
        Inst::new(Opcode::Rol, 8).arg(ireg(0)).arg(imm(0x8000_0000_0000_0001)).arg(imm(4)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 0x18);

    let result = run_simple(vec![
        Inst::new(Opcode::Ror, 8).arg(ireg(0)).arg(imm(0x18)).arg(imm(4)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 1); // low 32 bits of 0x8000000000000001
}

#[test]
fn rolc_rotates_through_carry() {
    // set carry, then rotate 0x8000...0000 left through it by one:
    // result = (value << 1) | carry, new carry = old bit 63
    let result = run_simple(vec![
        Inst::new(Opcode::Carry, 8)
            .with_flags(FlagSet::C)
            .arg(imm(1))
            .arg(imm(0)),
        Inst::new(Opcode::Rolc, 8)
            .with_flags(FlagSet::C | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(imm(0x8000_0000_0000_0002))
            .arg(imm(1)),
        Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(imm(FlagSet::C.bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 5);
}

#[test]
fn rolins_inserts_rotated_field() {
    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0x1234)),
        Inst::new(Opcode::Rolins, 8)
            .arg(ireg(0))
            .arg(imm(0xaa))
            .arg(imm(4))
            .arg(imm(0xff0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 0x1aa4);
}

#[test]
fn rolins_register_operands_match_immediate_form() {
    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0x1234)),
        Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(0xaa)),
        Inst::new(Opcode::Mov, 8).arg(ireg(2)).arg(imm(4)),
        Inst::new(Opcode::Mov, 8).arg(ireg(3)).arg(imm(0xff0)),
        Inst::new(Opcode::Rolins, 8)
            .arg(ireg(0))
            .arg(ireg(1))
            .arg(ireg(2))
            .arg(ireg(3)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 0x1aa4);
}

#[test]
fn roland_applies_rotate_then_mask() {
    // zero mask short-circuits to zero
    let result = run_simple(vec![
        Inst::new(Opcode::Roland, 8)
            .arg(ireg(0))
            .arg(imm(0xdead_beef))
            .arg(imm(13))
            .arg(imm(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 0);

    let result = run_simple(vec![
        Inst::new(Opcode::Roland, 8)
            .arg(ireg(0))
            .arg(imm(0x1234))
            .arg(imm(8))
            .arg(imm(0xff00)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 0x3400);

    // register operands take the generic path
    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(0x1234)),
        Inst::new(Opcode::Mov, 8).arg(ireg(2)).arg(imm(8)),
        Inst::new(Opcode::Mov, 8).arg(ireg(3)).arg(imm(0xff00)),
        Inst::new(Opcode::Roland, 8)
            .arg(ireg(0))
            .arg(ireg(1))
            .arg(ireg(2))
            .arg(ireg(3)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 0x3400);
}

#[test]
fn divide_by_zero_sets_overflow_only() {
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(111)),
        Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(222)),
        Inst::new(Opcode::Divu, 8)
            .with_flags(FlagSet::V | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(ireg(1))
            .arg(imm(5))
            .arg(imm(0)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(2))
            .arg(imm((FlagSet::V | FlagSet::Z | FlagSet::S).bits() as u64)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(2)),
    ]);

    assert_eq!(result, FlagSet::V.bits() as u32);
    // destinations untouched on the zero-divisor path
    assert_eq!(*cell, 111);
}

#[test]
fn division_computes_quotient_and_remainder() {
    let mut rem = Box::new(0u64);
    let remp = Parameter::mem::<u64>(&mut *rem);

    let result = run_simple(vec![
        Inst::new(Opcode::Divu, 8)
            .arg(ireg(0))
            .arg(ireg(1))
            .arg(imm(17))
            .arg(imm(5)),
        Inst::new(Opcode::Mov, 8).arg(remp).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 3);
    assert_eq!(*rem, 2);

    // signed: -17 / 5 truncates toward zero
    let mut quot = Box::new(0u64);
    let quotp = Parameter::mem::<u64>(&mut *quot);
    run_simple(vec![
        Inst::new(Opcode::Divs, 8)
            .arg(ireg(0))
            .arg(ireg(1))
            .arg(imm(-17i64 as u64))
            .arg(imm(5)),
        Inst::new(Opcode::Mov, 8).arg(quotp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(*quot as i64, -3);
}

#[test]
fn mulu_reports_wide_product_flags() {
    let mut lo = Box::new(0u64);
    let lop = Parameter::mem::<u64>(&mut *lo);
    let mut hi = Box::new(0u64);
    let hip = Parameter::mem::<u64>(&mut *hi);

    let result = run_simple(vec![
        Inst::new(Opcode::Mulu, 8)
            .with_flags(FlagSet::V | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(ireg(1))
            .arg(imm(0xffff_ffff_ffff_ffff))
            .arg(imm(2)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(2))
            .arg(imm((FlagSet::V | FlagSet::Z | FlagSet::S).bits() as u64)),
        Inst::new(Opcode::Mov, 8).arg(lop).arg(ireg(0)),
        Inst::new(Opcode::Mov, 8).arg(hip).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(ireg(2)),
    ]);

    assert_eq!(*lo, 0xffff_ffff_ffff_fffe);
    assert_eq!(*hi, 1);
    // the product overflows 64 bits, is nonzero and the high half is positive
    assert_eq!(result, FlagSet::V.bits() as u32);
}

#[test]
fn muls_of_negatives_fits_low_word() {
    let mut lo = Box::new(0u64);
    let lop = Parameter::mem::<u64>(&mut *lo);

    let result = run_simple(vec![
        Inst::new(Opcode::Muls, 8)
            .with_flags(FlagSet::V | FlagSet::Z | FlagSet::S)
            .arg(ireg(0))
            .arg(ireg(1))
            .arg(imm(-1i64 as u64))
            .arg(imm(-1i64 as u64)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(2))
            .arg(imm((FlagSet::V | FlagSet::Z | FlagSet::S).bits() as u64)),
        Inst::new(Opcode::Mov, 8).arg(lop).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(2)),
    ]);

    assert_eq!(*lo, 1);
    assert_eq!(result, 0);
}

#[test]
fn bit_counting_and_byte_swap() {
    let result = run_simple(vec![
        Inst::new(Opcode::Lzcnt, 8).arg(ireg(0)).arg(imm(1)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 63);

    let result = run_simple(vec![
        Inst::new(Opcode::Tzcnt, 8).arg(ireg(0)).arg(imm(0x8000_0000_0000_0000)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 63);

    // no set bit: count is the width and Z is raised
    let result = run_simple(vec![
        Inst::new(Opcode::Tzcnt, 8)
            .with_flags(FlagSet::Z)
            .arg(ireg(0))
            .arg(imm(0)),
        Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(imm(FlagSet::Z.bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);
    assert_eq!(result, FlagSet::Z.bits() as u32);

    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);
    run_simple(vec![
        Inst::new(Opcode::Bswap, 8).arg(ireg(0)).arg(imm(0x0102_0304_0506_0708)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(*cell, 0x0807_0605_0403_0201);
}

#[test]
fn sign_extension() {
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    run_simple(vec![
        Inst::new(Opcode::Sext, 8)
            .arg(ireg(0))
            .arg(imm(0x80))
            .arg(Parameter::Size(SIZE_BYTE)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(*cell, 0xffff_ffff_ffff_ff80);
}

#[test]
fn scratchpad_load_store() {
    let mut buffer = Box::new([0u64; 4]);
    let basep = Parameter::mem::<u64>(buffer.as_mut_ptr());
    let basep2 = basep.clone();
    let basep3 = basep.clone();
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0x8081_8283_8485_8687)),
        Inst::new(Opcode::Store, 8)
            .arg(basep)
            .arg(imm(0))
            .arg(ireg(0))
            .arg(Parameter::SizeScale { size: SIZE_QWORD, scale: 3 }),
        // halfword at byte offset 4 through a register index
        Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(2)),
        Inst::new(Opcode::Load, 4)
            .arg(ireg(2))
            .arg(basep2)
            .arg(ireg(1))
            .arg(Parameter::SizeScale { size: SIZE_WORD, scale: 1 }),
        // signed byte reload of the low byte
        Inst::new(Opcode::Loads, 8)
            .arg(ireg(3))
            .arg(basep3)
            .arg(imm(0))
            .arg(Parameter::SizeScale { size: SIZE_BYTE, scale: 0 }),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(3)),
        Inst::new(Opcode::Exit, 4).arg(ireg(2)),
    ]);

    assert_eq!(buffer[0], 0x8081_8283_8485_8687);
    assert_eq!(result, 0x8283);
    assert_eq!(*cell, 0xffff_ffff_ffff_ff87);
}

#[test]
fn bus_access_fast_narrow_and_masked() {
    let mut bus = RamBus::new(0x10000);
    let desc = bus.specific_descriptor(4, 8);

    let mut be = Backend::new(BackendConfig {
        spaces: vec![desc],
        ..BackendConfig::default()
    })
    .unwrap();
    let entry = be.create_handle("entry");

    let dword = Parameter::SizeSpace { size: SIZE_DWORD, space: 0 };
    let byte = Parameter::SizeSpace { size: SIZE_BYTE, space: 0 };

    let result = run(
        &mut be,
        entry,
        vec![
            // native-width fast path
            Inst::new(Opcode::Write, 4)
                .arg(imm(0x10))
                .arg(imm(0xdead_beef))
                .arg(dword.clone()),
            // narrow write into byte lane 2
            Inst::new(Opcode::Write, 4).arg(imm(0x12)).arg(imm(0xab)).arg(byte),
            // masked write touching byte lane 0 only
            Inst::new(Opcode::Writem, 4)
                .arg(imm(0x10))
                .arg(imm(0x9999_9911))
                .arg(imm(0x0000_00ff))
                .arg(dword.clone()),
            Inst::new(Opcode::Read, 4).arg(ireg(0)).arg(imm(0x10)).arg(dword),
            Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        ],
    );

    assert_eq!(result, 0xdeab_be11);
    assert_eq!(bus.read(0x10, 2), 0xdeab_be11);
}

#[test]
fn bus_float_read_write() {
    let mut bus = RamBus::new(0x1000);
    let desc = bus.descriptor();

    let mut be = Backend::new(BackendConfig {
        spaces: vec![desc],
        ..BackendConfig::default()
    })
    .unwrap();
    let entry = be.create_handle("entry");

    let value = 2.5f64;
    let mut cell = Box::new(value.to_bits());
    let cellp = Parameter::mem::<u64>(&mut *cell);

    let qword = Parameter::SizeSpace { size: SIZE_QWORD, space: 0 };
    run(
        &mut be,
        entry,
        vec![
            Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(cellp),
            Inst::new(Opcode::Fwrite, 8).arg(imm(0x40)).arg(freg(0)).arg(qword.clone()),
            Inst::new(Opcode::Fread, 8).arg(freg(1)).arg(imm(0x40)).arg(qword),
            Inst::new(Opcode::Icopyf, 8).arg(ireg(0)).arg(freg(1)),
            Inst::new(Opcode::Exit, 4).arg(imm(0)),
        ],
    );

    assert_eq!(bus.read(0x40, 3), value.to_bits());
}

#[test]
fn fcmp_of_nan_sets_unordered_less(){
    let mut nan = Box::new(f64::NAN.to_bits());
    let nanp = Parameter::mem::<u64>(&mut *nan);
    let mut one = Box::new(1.0f64.to_bits());
    let onep = Parameter::mem::<u64>(&mut *one);

    let result = run_simple(vec![
        Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(nanp),
        Inst::new(Opcode::Fmov, 8).arg(freg(1)).arg(onep),
        Inst::new(Opcode::Fcmp, 8)
            .with_flags(FlagSet::C | FlagSet::Z | FlagSet::U)
            .arg(freg(0))
            .arg(freg(1)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(0))
            .arg(imm((FlagSet::C | FlagSet::Z | FlagSet::U).bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);

    // unordered compares as "less": U = 1, C = 1, Z = 0
    assert_eq!(result, (FlagSet::U | FlagSet::C).bits() as u32);
}

#[test]
fn branch_on_unordered_taken_after_nan_compare() {
    let mut be = backend();
    let entry = be.create_handle("entry");
    let target = be.create_label();

    let mut nan = Box::new(f64::NAN.to_bits());
    let nanp = Parameter::mem::<u64>(&mut *nan);
    let mut one = Box::new(1.0f64.to_bits());
    let onep = Parameter::mem::<u64>(&mut *one);

    let result = run(
        &mut be,
        entry,
        vec![
            Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(nanp),
            Inst::new(Opcode::Fmov, 8).arg(freg(1)).arg(onep),
            Inst::new(Opcode::Fcmp, 8)
                .with_flags(FlagSet::C | FlagSet::Z | FlagSet::U)
                .arg(freg(0))
                .arg(freg(1)),
            Inst::new(Opcode::Jmp, 4).with_cond(Cond::U).arg(Parameter::Label(target)),
            Inst::new(Opcode::Exit, 4).arg(imm(0)),
            Inst::new(Opcode::Label, 4).arg(Parameter::Label(target)),
            Inst::new(Opcode::Exit, 4).arg(imm(1)),
        ],
    );
    assert_eq!(result, 1);

    // an ordered compare leaves U clear
    let mut be = backend();
    let entry = be.create_handle("entry");
    let mut two = Box::new(2.0f64.to_bits());
    let twop = Parameter::mem::<u64>(&mut *two);
    let mut one = Box::new(1.0f64.to_bits());
    let onep = Parameter::mem::<u64>(&mut *one);
    let result = run(
        &mut be,
        entry,
        vec![
            Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(twop),
            Inst::new(Opcode::Fmov, 8).arg(freg(1)).arg(onep),
            Inst::new(Opcode::Fcmp, 8)
                .with_flags(FlagSet::C | FlagSet::Z | FlagSet::U)
                .arg(freg(0))
                .arg(freg(1)),
            Inst::new(Opcode::Set, 8).with_cond(Cond::U).arg(ireg(0)),
            Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        ],
    );
    assert_eq!(result, 0);
}

#[test]
fn float_arithmetic_and_conversions() {
    let mut half = Box::new(0.5f64.to_bits());
    let halfp = Parameter::mem::<u64>(&mut *half);
    let mut three = Box::new(3.0f64.to_bits());
    let threep = Parameter::mem::<u64>(&mut *three);
    let mut out = Box::new(0u64);
    let outp = Parameter::mem::<u64>(&mut *out);

    run_simple(vec![
        Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(halfp),
        Inst::new(Opcode::Fmov, 8).arg(freg(1)).arg(threep),
        Inst::new(Opcode::Fadd, 8).arg(freg(2)).arg(freg(0)).arg(freg(1)),
        Inst::new(Opcode::Fmul, 8).arg(freg(2)).arg(freg(2)).arg(freg(1)),
        Inst::new(Opcode::Fsub, 8).arg(freg(2)).arg(freg(2)).arg(freg(0)),
        Inst::new(Opcode::Icopyf, 8).arg(ireg(0)).arg(freg(2)),
        Inst::new(Opcode::Mov, 8).arg(outp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    // (0.5 + 3.0) * 3.0 - 0.5 = 10.0
    assert_eq!(f64::from_bits(*out), 10.0);

    // integer conversions round-trip
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);
    run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(-5i64 as u64)),
        Inst::new(Opcode::Ffrint, 8)
            .arg(freg(0))
            .arg(ireg(0))
            .arg(Parameter::Size(SIZE_QWORD)),
        Inst::new(Opcode::Ftoint, 8)
            .arg(ireg(1))
            .arg(freg(0))
            .arg(Parameter::Size(SIZE_QWORD))
            .arg(Parameter::Rounding(Rounding::Trunc)),
        Inst::new(Opcode::Mov, 8).arg(cellp).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(*cell as i64, -5);
}

#[test]
fn ftoint_respects_rounding_mode() {
    let cases = [
        (Rounding::Round, 2u32),
        (Rounding::Ceil, 3),
        (Rounding::Floor, 2),
        (Rounding::Trunc, 2),
    ];
    for (mode, expected) in cases {
        let mut bits = Box::new(2.5f64.to_bits());
        let bitsp = Parameter::mem::<u64>(&mut *bits);
        let result = run_simple(vec![
            Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(bitsp),
            Inst::new(Opcode::Ftoint, 8)
                .arg(ireg(0))
                .arg(freg(0))
                .arg(Parameter::Size(SIZE_DWORD))
                .arg(Parameter::Rounding(mode)),
            Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        ]);
        assert_eq!(result, expected, "rounding {:?}", mode);
    }
}

#[test]
fn frnds_narrows_to_single_precision() {
    let value = 1.000000119f64; // not representable as f32
    let mut bits = Box::new(value.to_bits());
    let bitsp = Parameter::mem::<u64>(&mut *bits);
    let mut out = Box::new(0u64);
    let outp = Parameter::mem::<u64>(&mut *out);

    run_simple(vec![
        Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(bitsp),
        Inst::new(Opcode::Frnds, 8).arg(freg(1)).arg(freg(0)),
        Inst::new(Opcode::Icopyf, 8).arg(ireg(0)).arg(freg(1)),
        Inst::new(Opcode::Mov, 8).arg(outp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(f64::from_bits(*out), (value as f32) as f64);
}

#[test]
fn fcopyi_roundtrips_bit_patterns() {
    let mut out = Box::new(0u64);
    let outp = Parameter::mem::<u64>(&mut *out);

    run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0x7ff8_dead_beef_0001)),
        Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
        Inst::new(Opcode::Icopyf, 8).arg(ireg(1)).arg(freg(0)),
        Inst::new(Opcode::Mov, 8).arg(outp).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(*out, 0x7ff8_dead_beef_0001);
}

#[test]
fn callh_and_ret() {
    let mut be = backend();
    let sub = be.create_handle("sub");
    let entry = be.create_handle("entry");

    let program = vec![
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(sub)),
        Inst::new(Opcode::Mov, 8).arg(ireg(5)).arg(imm(99)),
        Inst::new(Opcode::Ret, 4),
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry)),
        Inst::new(Opcode::Mov, 8).arg(ireg(5)).arg(imm(0)),
        Inst::new(Opcode::Callh, 4).arg(Parameter::Handle(sub)),
        Inst::new(Opcode::Exit, 4).arg(ireg(5)),
    ];
    be.generate(&program).unwrap();
    assert_eq!(be.execute(entry), 99);
}

#[test]
fn conditional_callh_skipped() {
    let mut be = backend();
    let sub = be.create_handle("sub");
    let entry = be.create_handle("entry");

    let program = vec![
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(sub)),
        Inst::new(Opcode::Mov, 8).arg(ireg(5)).arg(imm(1)),
        Inst::new(Opcode::Ret, 4),
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry)),
        Inst::new(Opcode::Mov, 8).arg(ireg(5)).arg(imm(0)),
        // 1 != 2, so the Z-conditional call must not happen
        Inst::new(Opcode::Cmp, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(imm(1))
            .arg(imm(2)),
        Inst::new(Opcode::Callh, 4).with_cond(Cond::Z).arg(Parameter::Handle(sub)),
        Inst::new(Opcode::Exit, 4).arg(ireg(5)),
    ];
    be.generate(&program).unwrap();
    assert_eq!(be.execute(entry), 0);
}

#[test]
fn hashjmp_miss_raises_exception() {
    let mut be = backend();
    let exh = be.create_handle("exception");
    let entry = be.create_handle("entry");

    let program = vec![
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(exh)),
        Inst::new(Opcode::Getexp, 4).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry)),
        Inst::new(Opcode::Hashjmp, 4)
            .arg(imm(1))
            .arg(imm(0x1000))
            .arg(Parameter::Handle(exh)),
    ];
    be.generate(&program).unwrap();
    // nothing hashed at (1, 0x1000): control lands in the exception handle
    // with the target pc recorded
    assert_eq!(be.execute(entry), 0x1000);
}

#[test]
fn hashjmp_dispatches_to_hashed_code() {
    let mut be = backend();
    let exh = be.create_handle("exception");
    let entry = be.create_handle("entry");

    be.generate(&[
        Inst::new(Opcode::Hash, 4).arg(imm(1)).arg(imm(0x2000)),
        Inst::new(Opcode::Exit, 4).arg(imm(7)),
    ])
    .unwrap();

    let program = vec![
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(exh)),
        Inst::new(Opcode::Getexp, 4).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry)),
        // register arguments exercise the table-walk path
        Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(1)),
        Inst::new(Opcode::Mov, 8).arg(ireg(2)).arg(imm(0x2000)),
        Inst::new(Opcode::Hashjmp, 4)
            .arg(ireg(1))
            .arg(ireg(2))
            .arg(Parameter::Handle(exh)),
    ];
    be.generate(&program).unwrap();
    assert_eq!(be.execute(entry), 7);
}

#[test]
fn recover_reads_map_variable_at_call_site() {
    let mut be = backend();
    let exh = be.create_handle("exception");
    let entry = be.create_handle("entry");

    let program = vec![
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(exh)),
        Inst::new(Opcode::Recover, 4).arg(ireg(0)).arg(Parameter::MapVar(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry)),
        Inst::new(Opcode::Mapvar, 4).arg(Parameter::MapVar(0)).arg(imm(42)),
        // the miss path calls the exception handle from the frame anchor
        Inst::new(Opcode::Hashjmp, 4)
            .arg(imm(0))
            .arg(imm(0x3000))
            .arg(Parameter::Handle(exh)),
    ];
    be.generate(&program).unwrap();
    assert_eq!(be.execute(entry), 42);
}

unsafe extern "C" fn callc_write_cell(param: *mut std::ffi::c_void) {
    *(param as *mut u64) = 0x77;
}

#[test]
fn callc_preserves_emulated_flags() {
    let mut cell = Box::new(0u64);
    let cellp = Parameter::mem::<u64>(&mut *cell);

    let result = run_simple(vec![
        // set the carry bit, then leave for C code and come back
        Inst::new(Opcode::Add, 8)
            .with_flags(FlagSet::C)
            .arg(ireg(0))
            .arg(imm(u64::MAX))
            .arg(imm(2)),
        Inst::new(Opcode::Callc, 4)
            .arg(Parameter::CFunc(callc_write_cell))
            .arg(cellp),
        Inst::new(Opcode::Set, 8).with_cond(Cond::C).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);

    assert_eq!(*cell, 0x77);
    assert_eq!(result, 1);
}

#[test]
fn save_restore_roundtrip() {
    let mut first = Box::new(MachineState::new());
    let firstp = Parameter::mem::<MachineState>(&mut *first);
    let firstp2 = firstp.clone();
    let mut second = Box::new(MachineState::new());
    let secondp = Parameter::mem::<MachineState>(&mut *second);

    run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0x1111_2222_3333_4444)),
        Inst::new(Opcode::Mov, 8).arg(ireg(7)).arg(imm(0x5555)),
        Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
        Inst::new(Opcode::Setfmod, 4).arg(imm(2)),
        // leave some live flags behind
        Inst::new(Opcode::Add, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(ireg(1))
            .arg(imm(u64::MAX))
            .arg(imm(1)),
        Inst::new(Opcode::Save, 4).arg(firstp),
        Inst::new(Opcode::Restore, 4).arg(firstp2),
        Inst::new(Opcode::Save, 4).arg(secondp),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);

    assert_eq!(first.r[0], 0x1111_2222_3333_4444);
    assert_eq!(first.r[7], 0x5555);
    assert_eq!(first.f[0], 0x1111_2222_3333_4444);
    assert_eq!(first.fmod, 2);
    // u64::MAX + 1 wraps to zero: C and Z
    assert_eq!(first.flags, (FlagSet::C | FlagSet::Z).bits());
    assert_eq!(*first, *second);
}

#[test]
fn setflgs_getflgs_roundtrip() {
    for flags in [0u64, 0x01, 0x0f, 0x1f, 0x15] {
        let result = run_simple(vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(flags)),
            Inst::new(Opcode::Setflgs, 4).arg(ireg(0)),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(imm(0x1f)),
            Inst::new(Opcode::Exit, 4).arg(ireg(1)),
        ]);
        assert_eq!(result, flags as u32, "flags {:#x}", flags);
    }
}

#[test]
fn setfmod_getfmod() {
    let result = run_simple(vec![
        Inst::new(Opcode::Setfmod, 4).arg(imm(6)),
        Inst::new(Opcode::Getfmod, 4).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    // only the low two bits of the mode are kept
    assert_eq!(result, 2);
}

#[test]
fn conditional_mov_uses_select() {
    // canonical carry polarity drives csel
    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(5)),
        Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(9)),
        Inst::new(Opcode::Add, 8)
            .with_flags(FlagSet::C)
            .arg(ireg(2))
            .arg(imm(u64::MAX))
            .arg(imm(2)),
        Inst::new(Opcode::Mov, 8).with_cond(Cond::C).arg(ireg(0)).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 9);

    // logical polarity after a compare
    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(5)),
        Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(imm(9)),
        Inst::new(Opcode::Cmp, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(imm(7))
            .arg(imm(3)),
        Inst::new(Opcode::Mov, 8).with_cond(Cond::C).arg(ireg(0)).arg(ireg(1)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
    ]);
    assert_eq!(result, 5);
}

#[test]
fn fmov_conditional_select() {
    let mut five = Box::new(5.0f64.to_bits());
    let fivep = Parameter::mem::<u64>(&mut *five);
    let mut nine = Box::new(9.0f64.to_bits());
    let ninep = Parameter::mem::<u64>(&mut *nine);
    let mut out = Box::new(0u64);
    let outp = Parameter::mem::<u64>(&mut *out);

    run_simple(vec![
        Inst::new(Opcode::Fmov, 8).arg(freg(0)).arg(fivep),
        Inst::new(Opcode::Fmov, 8).arg(freg(1)).arg(ninep),
        Inst::new(Opcode::Cmp, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(imm(1))
            .arg(imm(2)),
        // signed less-than holds, so the move happens via fcsel
        Inst::new(Opcode::Fmov, 8).with_cond(Cond::L).arg(freg(0)).arg(freg(1)),
        Inst::new(Opcode::Icopyf, 8).arg(ireg(0)).arg(freg(0)),
        Inst::new(Opcode::Mov, 8).arg(outp).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ]);
    assert_eq!(f64::from_bits(*out), 9.0);
}

#[test]
fn exh_conditional_exception() {
    let mut be = backend();
    let exh = be.create_handle("exception");
    let entry = be.create_handle("entry");

    let program = vec![
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(exh)),
        Inst::new(Opcode::Getexp, 4).arg(ireg(0)),
        Inst::new(Opcode::Exit, 4).arg(ireg(0)),
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry)),
        Inst::new(Opcode::Cmp, 8)
            .with_flags(ALL_INT_FLAGS)
            .arg(imm(4))
            .arg(imm(4)),
        // not taken: values are equal
        Inst::new(Opcode::Exh, 4)
            .with_cond(Cond::Nz)
            .arg(Parameter::Handle(exh))
            .arg(imm(0xdead)),
        // taken
        Inst::new(Opcode::Exh, 4)
            .with_cond(Cond::Z)
            .arg(Parameter::Handle(exh))
            .arg(imm(0xbeef)),
        Inst::new(Opcode::Exit, 4).arg(imm(0)),
    ];
    be.generate(&program).unwrap();
    assert_eq!(be.execute(entry), 0xbeef);
}

#[test]
fn four_byte_operations_use_low_half() {
    let result = run_simple(vec![
        Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(imm(0xffff_ffff_0000_0001)),
        // a 4-byte add only sees the low word
        Inst::new(Opcode::Add, 4)
            .with_flags(ALL_INT_FLAGS)
            .arg(ireg(1))
            .arg(ireg(0))
            .arg(imm(1)),
        Inst::new(Opcode::Getflgs, 4).arg(ireg(2)).arg(imm(FlagSet::C.bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(1)),
    ]);
    assert_eq!(result, 2);

    // 4-byte wraparound raises carry
    let result = run_simple(vec![
        Inst::new(Opcode::Add, 4)
            .with_flags(ALL_INT_FLAGS)
            .arg(ireg(1))
            .arg(imm(0xffff_ffff))
            .arg(imm(1)),
        Inst::new(Opcode::Getflgs, 4)
            .arg(ireg(2))
            .arg(imm((FlagSet::C | FlagSet::Z).bits() as u64)),
        Inst::new(Opcode::Exit, 4).arg(ireg(2)),
    ]);
    assert_eq!(result, (FlagSet::C | FlagSet::Z).bits() as u32);
}
