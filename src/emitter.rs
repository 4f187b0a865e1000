//! AArch64 emission primitives.
//!
//! Register conventions for generated code:
//!
//! ```text
//! x0-x3    function parameters / return value
//! x9-x11   temporaries, stable across helper functions
//! x12-x13  scratch, clobbered by helper functions
//! x14      scratch for memory address calculation
//! x15      scratch reserved for opcode-level functions
//! x19-x26  UML integer registers I0-I7
//! x27      near cache base pointer
//! x28      software-emulated flags (bit 0 = C, bit 4 = U)
//! x29/x30  frame pointer / link register
//! d8-d15   UML float registers F0-F7
//! d16-d18  float temporaries
//! ```
//!
//! Everything here is size-parameterized over 4- and 8-byte operations; the
//! dynasm register families make the W/X split explicit per match arm. A few
//! instructions dynasm cannot express with absolute operands (adr/adrp to an
//! arbitrary address, b/bl to an absolute target, NZCV system register moves)
//! are pushed as raw words by the encoders at the bottom.

use dynasmrt::aarch64::Aarch64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler};

pub type Asm = VecAssembler<Aarch64Relocation>;

/// dynasm auto-detects the target architecture from the build host; pin it.
macro_rules! a64 {
    ($a:expr ; $($tt:tt)*) => {
        dynasm::dynasm!($a ; .arch aarch64 ; $($tt)*)
    };
}
pub(crate) use a64;

pub const REG_PARAM1: u32 = 0;
pub const REG_PARAM2: u32 = 1;
pub const REG_PARAM3: u32 = 2;
pub const REG_PARAM4: u32 = 3;

pub const TEMP_REG1: u32 = 9;
pub const TEMP_REG2: u32 = 10;
pub const TEMP_REG3: u32 = 11;

pub const SCRATCH_REG1: u32 = 12;
pub const SCRATCH_REG2: u32 = 13;
pub const MEM_SCRATCH_REG: u32 = 14;
pub const FUNC_SCRATCH_REG: u32 = 15;

pub const TEMPF_REG1: u32 = 16;
pub const TEMPF_REG2: u32 = 17;
pub const TEMPF_REG3: u32 = 18;

pub const BASE_REG: u32 = 27;
pub const FLAGS_REG: u32 = 28;
pub const FP: u32 = 29;
pub const LR: u32 = 30;
pub const ZR: u32 = 31;

/// Host registers backing the UML integer registers; 0 marks an unmapped
/// (cold) register that lives in the machine state instead.
pub const INT_REGISTER_MAP: [u32; 8] = [19, 20, 21, 22, 23, 24, 25, 26];

/// Host float registers backing the UML float registers.
pub const FLOAT_REGISTER_MAP: [u32; 8] = [8, 9, 10, 11, 12, 13, 14, 15];

pub const FLAG_BIT_C: u32 = 0;
pub const FLAG_BIT_V: u32 = 1;
pub const FLAG_BIT_Z: u32 = 2;
pub const FLAG_BIT_S: u32 = 3;
pub const FLAG_BIT_U: u32 = 4;

pub const fn make_bitmask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// ---------------------------------------------------------------------------
// immediate classification

/// Whether `val` encodes as an AArch64 logical (bitmask) immediate at the
/// given operation width.
pub fn is_valid_immediate_mask(val: u64, bytes: u32) -> bool {
    if bytes == 4 {
        val <= u32::MAX as u64
            && dynasmrt::aarch64::encode_logical_immediate_32bit(val as u32).is_some()
    } else {
        dynasmrt::aarch64::encode_logical_immediate_64bit(val).is_some()
    }
}

pub fn is_valid_immediate(val: u64, bits: u32) -> bool {
    debug_assert!(bits < 64);
    val < (1u64 << bits)
}

pub fn is_valid_immediate_signed(val: i64, bits: u32) -> bool {
    debug_assert!(bits >= 1 && bits < 64);
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    val >= min && val <= max
}

/// 12-bit unsigned immediate, optionally left-shifted by 12.
pub const fn is_valid_immediate_addsub(val: u64) -> bool {
    val & !0xfff == 0 || val & !(0xfff << 12) == 0
}

/// Whether `diff` fits a base-relative load/store of the given natural shift:
/// either a 9-bit signed unscaled offset or a 12-bit scaled unsigned offset.
pub fn is_valid_offset(diff: i64, max_shift: u32) -> bool {
    if is_valid_immediate_signed(diff, 9) {
        true
    } else {
        diff >= 0 && diff < (1 << (12 + max_shift)) && diff & make_bitmask(max_shift) as i64 == 0
    }
}

const LSL0_MASK: u64 = 0x0000_0000_0000_ffff;
const LSL16_MASK: u64 = 0x0000_0000_ffff_0000;
const LSL32_MASK: u64 = 0x0000_ffff_0000_0000;
const LSL48_MASK: u64 = 0xffff_0000_0000_0000;

/// True when `val` can be materialized with a single instruction (movz, movn,
/// a 32-bit movn, or orr with the zero register).
pub fn is_simple_mov_immediate(val: u64, bytes: u32) -> bool {
    let group_sized = |v: u64| {
        v & !LSL0_MASK == 0 || v & !LSL16_MASK == 0 || v & !LSL32_MASK == 0 || v & !LSL48_MASK == 0
    };
    if group_sized(val) || group_sized(!val) {
        true
    } else if val == val as u32 as u64
        && (val & LSL0_MASK == LSL0_MASK || val & LSL16_MASK == LSL16_MASK)
    {
        true
    } else {
        is_valid_immediate_mask(val, bytes)
    }
}

// ---------------------------------------------------------------------------
// conditions

/// Host condition codes after the canonical UML-to-NZCV mapping. The carry
/// conditions are expressed in the polarity a compare (SUBS) establishes;
/// users flip them when host C holds the UML carry directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostCond {
    Eq,
    Ne,
    Mi,
    Pl,
    Lo,
    Hs,
    Vs,
    Vc,
    Hi,
    Ls,
    Gt,
    Le,
    Lt,
    Ge,
}

impl HostCond {
    pub fn negate(self) -> HostCond {
        match self {
            HostCond::Eq => HostCond::Ne,
            HostCond::Ne => HostCond::Eq,
            HostCond::Mi => HostCond::Pl,
            HostCond::Pl => HostCond::Mi,
            HostCond::Lo => HostCond::Hs,
            HostCond::Hs => HostCond::Lo,
            HostCond::Vs => HostCond::Vc,
            HostCond::Vc => HostCond::Vs,
            HostCond::Hi => HostCond::Ls,
            HostCond::Ls => HostCond::Hi,
            HostCond::Gt => HostCond::Le,
            HostCond::Le => HostCond::Gt,
            HostCond::Lt => HostCond::Ge,
            HostCond::Ge => HostCond::Lt,
        }
    }
}

pub fn emit_b_cond(a: &mut Asm, cond: HostCond, label: DynamicLabel) {
    match cond {
        HostCond::Eq => a64!(a ; b.eq =>label),
        HostCond::Ne => a64!(a ; b.ne =>label),
        HostCond::Mi => a64!(a ; b.mi =>label),
        HostCond::Pl => a64!(a ; b.pl =>label),
        HostCond::Lo => a64!(a ; b.lo =>label),
        HostCond::Hs => a64!(a ; b.hs =>label),
        HostCond::Vs => a64!(a ; b.vs =>label),
        HostCond::Vc => a64!(a ; b.vc =>label),
        HostCond::Hi => a64!(a ; b.hi =>label),
        HostCond::Ls => a64!(a ; b.ls =>label),
        HostCond::Gt => a64!(a ; b.gt =>label),
        HostCond::Le => a64!(a ; b.le =>label),
        HostCond::Lt => a64!(a ; b.lt =>label),
        HostCond::Ge => a64!(a ; b.ge =>label),
    }
}

pub fn emit_cset(a: &mut Asm, size: u32, cond: HostCond, reg: u32) {
    if size == 4 {
        match cond {
            HostCond::Eq => a64!(a ; cset W(reg), eq),
            HostCond::Ne => a64!(a ; cset W(reg), ne),
            HostCond::Mi => a64!(a ; cset W(reg), mi),
            HostCond::Pl => a64!(a ; cset W(reg), pl),
            HostCond::Lo => a64!(a ; cset W(reg), lo),
            HostCond::Hs => a64!(a ; cset W(reg), hs),
            HostCond::Vs => a64!(a ; cset W(reg), vs),
            HostCond::Vc => a64!(a ; cset W(reg), vc),
            HostCond::Hi => a64!(a ; cset W(reg), hi),
            HostCond::Ls => a64!(a ; cset W(reg), ls),
            HostCond::Gt => a64!(a ; cset W(reg), gt),
            HostCond::Le => a64!(a ; cset W(reg), le),
            HostCond::Lt => a64!(a ; cset W(reg), lt),
            HostCond::Ge => a64!(a ; cset W(reg), ge),
        }
    } else {
        match cond {
            HostCond::Eq => a64!(a ; cset X(reg), eq),
            HostCond::Ne => a64!(a ; cset X(reg), ne),
            HostCond::Mi => a64!(a ; cset X(reg), mi),
            HostCond::Pl => a64!(a ; cset X(reg), pl),
            HostCond::Lo => a64!(a ; cset X(reg), lo),
            HostCond::Hs => a64!(a ; cset X(reg), hs),
            HostCond::Vs => a64!(a ; cset X(reg), vs),
            HostCond::Vc => a64!(a ; cset X(reg), vc),
            HostCond::Hi => a64!(a ; cset X(reg), hi),
            HostCond::Ls => a64!(a ; cset X(reg), ls),
            HostCond::Gt => a64!(a ; cset X(reg), gt),
            HostCond::Le => a64!(a ; cset X(reg), le),
            HostCond::Lt => a64!(a ; cset X(reg), lt),
            HostCond::Ge => a64!(a ; cset X(reg), ge),
        }
    }
}

/// `dst = cond ? src1 : src2`, 64-bit.
pub fn emit_csel(a: &mut Asm, cond: HostCond, dst: u32, src1: u32, src2: u32) {
    match cond {
        HostCond::Eq => a64!(a ; csel X(dst), X(src1), X(src2), eq),
        HostCond::Ne => a64!(a ; csel X(dst), X(src1), X(src2), ne),
        HostCond::Mi => a64!(a ; csel X(dst), X(src1), X(src2), mi),
        HostCond::Pl => a64!(a ; csel X(dst), X(src1), X(src2), pl),
        HostCond::Lo => a64!(a ; csel X(dst), X(src1), X(src2), lo),
        HostCond::Hs => a64!(a ; csel X(dst), X(src1), X(src2), hs),
        HostCond::Vs => a64!(a ; csel X(dst), X(src1), X(src2), vs),
        HostCond::Vc => a64!(a ; csel X(dst), X(src1), X(src2), vc),
        HostCond::Hi => a64!(a ; csel X(dst), X(src1), X(src2), hi),
        HostCond::Ls => a64!(a ; csel X(dst), X(src1), X(src2), ls),
        HostCond::Gt => a64!(a ; csel X(dst), X(src1), X(src2), gt),
        HostCond::Le => a64!(a ; csel X(dst), X(src1), X(src2), le),
        HostCond::Lt => a64!(a ; csel X(dst), X(src1), X(src2), lt),
        HostCond::Ge => a64!(a ; csel X(dst), X(src1), X(src2), ge),
    }
}

/// `dst = cond ? src1 : src2` on float registers.
pub fn emit_fcsel(a: &mut Asm, size: u32, cond: HostCond, dst: u32, src1: u32, src2: u32) {
    if size == 4 {
        match cond {
            HostCond::Eq => a64!(a ; fcsel S(dst), S(src1), S(src2), eq),
            HostCond::Ne => a64!(a ; fcsel S(dst), S(src1), S(src2), ne),
            HostCond::Mi => a64!(a ; fcsel S(dst), S(src1), S(src2), mi),
            HostCond::Pl => a64!(a ; fcsel S(dst), S(src1), S(src2), pl),
            HostCond::Lo => a64!(a ; fcsel S(dst), S(src1), S(src2), lo),
            HostCond::Hs => a64!(a ; fcsel S(dst), S(src1), S(src2), hs),
            HostCond::Vs => a64!(a ; fcsel S(dst), S(src1), S(src2), vs),
            HostCond::Vc => a64!(a ; fcsel S(dst), S(src1), S(src2), vc),
            HostCond::Hi => a64!(a ; fcsel S(dst), S(src1), S(src2), hi),
            HostCond::Ls => a64!(a ; fcsel S(dst), S(src1), S(src2), ls),
            HostCond::Gt => a64!(a ; fcsel S(dst), S(src1), S(src2), gt),
            HostCond::Le => a64!(a ; fcsel S(dst), S(src1), S(src2), le),
            HostCond::Lt => a64!(a ; fcsel S(dst), S(src1), S(src2), lt),
            HostCond::Ge => a64!(a ; fcsel S(dst), S(src1), S(src2), ge),
        }
    } else {
        match cond {
            HostCond::Eq => a64!(a ; fcsel D(dst), D(src1), D(src2), eq),
            HostCond::Ne => a64!(a ; fcsel D(dst), D(src1), D(src2), ne),
            HostCond::Mi => a64!(a ; fcsel D(dst), D(src1), D(src2), mi),
            HostCond::Pl => a64!(a ; fcsel D(dst), D(src1), D(src2), pl),
            HostCond::Lo => a64!(a ; fcsel D(dst), D(src1), D(src2), lo),
            HostCond::Hs => a64!(a ; fcsel D(dst), D(src1), D(src2), hs),
            HostCond::Vs => a64!(a ; fcsel D(dst), D(src1), D(src2), vs),
            HostCond::Vc => a64!(a ; fcsel D(dst), D(src1), D(src2), vc),
            HostCond::Hi => a64!(a ; fcsel D(dst), D(src1), D(src2), hi),
            HostCond::Ls => a64!(a ; fcsel D(dst), D(src1), D(src2), ls),
            HostCond::Gt => a64!(a ; fcsel D(dst), D(src1), D(src2), gt),
            HostCond::Le => a64!(a ; fcsel D(dst), D(src1), D(src2), le),
            HostCond::Lt => a64!(a ; fcsel D(dst), D(src1), D(src2), lt),
            HostCond::Ge => a64!(a ; fcsel D(dst), D(src1), D(src2), ge),
        }
    }
}

// ---------------------------------------------------------------------------
// sized ALU primitives

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adds,
    Adc,
    Adcs,
    Sub,
    Subs,
    Sbc,
    Sbcs,
    And,
    Ands,
    Orr,
    Eor,
    Bic,
}

pub fn emit_alu_rr(a: &mut Asm, size: u32, op: AluOp, d: u32, n: u32, m: u32) {
    if size == 4 {
        match op {
            AluOp::Add => a64!(a ; add W(d), W(n), W(m)),
            AluOp::Adds => a64!(a ; adds W(d), W(n), W(m)),
            AluOp::Adc => a64!(a ; adc W(d), W(n), W(m)),
            AluOp::Adcs => a64!(a ; adcs W(d), W(n), W(m)),
            AluOp::Sub => a64!(a ; sub W(d), W(n), W(m)),
            AluOp::Subs => a64!(a ; subs W(d), W(n), W(m)),
            AluOp::Sbc => a64!(a ; sbc W(d), W(n), W(m)),
            AluOp::Sbcs => a64!(a ; sbcs W(d), W(n), W(m)),
            AluOp::And => a64!(a ; and W(d), W(n), W(m)),
            AluOp::Ands => a64!(a ; ands W(d), W(n), W(m)),
            AluOp::Orr => a64!(a ; orr W(d), W(n), W(m)),
            AluOp::Eor => a64!(a ; eor W(d), W(n), W(m)),
            AluOp::Bic => a64!(a ; bic W(d), W(n), W(m)),
        }
    } else {
        match op {
            AluOp::Add => a64!(a ; add X(d), X(n), X(m)),
            AluOp::Adds => a64!(a ; adds X(d), X(n), X(m)),
            AluOp::Adc => a64!(a ; adc X(d), X(n), X(m)),
            AluOp::Adcs => a64!(a ; adcs X(d), X(n), X(m)),
            AluOp::Sub => a64!(a ; sub X(d), X(n), X(m)),
            AluOp::Subs => a64!(a ; subs X(d), X(n), X(m)),
            AluOp::Sbc => a64!(a ; sbc X(d), X(n), X(m)),
            AluOp::Sbcs => a64!(a ; sbcs X(d), X(n), X(m)),
            AluOp::And => a64!(a ; and X(d), X(n), X(m)),
            AluOp::Ands => a64!(a ; ands X(d), X(n), X(m)),
            AluOp::Orr => a64!(a ; orr X(d), X(n), X(m)),
            AluOp::Eor => a64!(a ; eor X(d), X(n), X(m)),
            AluOp::Bic => a64!(a ; bic X(d), X(n), X(m)),
        }
    }
}

/// add/adds/sub/subs with an immediate that satisfies
/// [`is_valid_immediate_addsub`]. The 12-bit-shifted form goes through a
/// scratch register with a shifted-register ALU op, so `scratch` must not
/// alias `n`.
pub fn emit_addsub_imm(a: &mut Asm, size: u32, op: AluOp, d: u32, n: u32, val: u64, scratch: u32) {
    debug_assert!(is_valid_immediate_addsub(val));
    debug_assert!(matches!(op, AluOp::Add | AluOp::Adds | AluOp::Sub | AluOp::Subs));
    if val & !0xfff == 0 {
        let imm = val as u32;
        if size == 4 {
            match op {
                AluOp::Add => a64!(a ; add W(d), W(n), imm),
                AluOp::Adds => a64!(a ; adds W(d), W(n), imm),
                AluOp::Sub => a64!(a ; sub W(d), W(n), imm),
                AluOp::Subs => a64!(a ; subs W(d), W(n), imm),
                _ => unreachable!(),
            }
        } else {
            match op {
                AluOp::Add => a64!(a ; add X(d), X(n), imm),
                AluOp::Adds => a64!(a ; adds X(d), X(n), imm),
                AluOp::Sub => a64!(a ; sub X(d), X(n), imm),
                AluOp::Subs => a64!(a ; subs X(d), X(n), imm),
                _ => unreachable!(),
            }
        }
    } else {
        debug_assert!(scratch != n);
        let imm = (val >> 12) as u32;
        a64!(a ; movz X(scratch), imm);
        if size == 4 {
            match op {
                AluOp::Add => a64!(a ; add W(d), W(n), W(scratch), LSL 12),
                AluOp::Adds => a64!(a ; adds W(d), W(n), W(scratch), LSL 12),
                AluOp::Sub => a64!(a ; sub W(d), W(n), W(scratch), LSL 12),
                AluOp::Subs => a64!(a ; subs W(d), W(n), W(scratch), LSL 12),
                _ => unreachable!(),
            }
        } else {
            match op {
                AluOp::Add => a64!(a ; add X(d), X(n), X(scratch), LSL 12),
                AluOp::Adds => a64!(a ; adds X(d), X(n), X(scratch), LSL 12),
                AluOp::Sub => a64!(a ; sub X(d), X(n), X(scratch), LSL 12),
                AluOp::Subs => a64!(a ; subs X(d), X(n), X(scratch), LSL 12),
                _ => unreachable!(),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Ands,
    Orr,
    Eor,
    Tst,
}

/// Logical operation with a bitmask immediate; the caller must have checked
/// [`is_valid_immediate_mask`] at the same width.
pub fn emit_logical_imm(a: &mut Asm, size: u32, op: LogicalOp, d: u32, n: u32, val: u64) {
    debug_assert!(is_valid_immediate_mask(val, size));
    if size == 4 {
        let val = val as u32;
        match op {
            LogicalOp::And => a64!(a ; and W(d), W(n), val),
            LogicalOp::Ands => a64!(a ; ands W(d), W(n), val),
            LogicalOp::Orr => a64!(a ; orr W(d), W(n), val),
            LogicalOp::Eor => a64!(a ; eor W(d), W(n), val),
            LogicalOp::Tst => a64!(a ; tst W(n), val),
        }
    } else {
        match op {
            LogicalOp::And => a64!(a ; and X(d), X(n), val),
            LogicalOp::Ands => a64!(a ; ands X(d), X(n), val),
            LogicalOp::Orr => a64!(a ; orr X(d), X(n), val),
            LogicalOp::Eor => a64!(a ; eor X(d), X(n), val),
            LogicalOp::Tst => a64!(a ; tst X(n), val),
        }
    }
}

pub fn emit_mov_rr(a: &mut Asm, size: u32, d: u32, s: u32) {
    if size == 4 {
        a64!(a ; mov W(d), W(s));
    } else {
        a64!(a ; mov X(d), X(s));
    }
}

pub fn emit_mvn_rr(a: &mut Asm, size: u32, d: u32, s: u32) {
    if size == 4 {
        a64!(a ; mvn W(d), W(s));
    } else {
        a64!(a ; mvn X(d), X(s));
    }
}

pub fn emit_tst_rr(a: &mut Asm, size: u32, n: u32, m: u32) {
    if size == 4 {
        a64!(a ; tst W(n), W(m));
    } else {
        a64!(a ; tst X(n), X(m));
    }
}

pub fn emit_cmp_rr(a: &mut Asm, size: u32, n: u32, m: u32) {
    if size == 4 {
        a64!(a ; cmp W(n), W(m));
    } else {
        a64!(a ; cmp X(n), X(m));
    }
}

/// cmp with an add/sub-style immediate; `scratch` must not alias `n`.
pub fn emit_cmp_imm(a: &mut Asm, size: u32, n: u32, val: u64, scratch: u32) {
    debug_assert!(is_valid_immediate_addsub(val));
    if val & !0xfff == 0 {
        let imm = val as u32;
        if size == 4 {
            a64!(a ; cmp W(n), imm);
        } else {
            a64!(a ; cmp X(n), imm);
        }
    } else {
        debug_assert!(scratch != n);
        let imm = (val >> 12) as u32;
        a64!(a ; movz X(scratch), imm);
        if size == 4 {
            a64!(a ; cmp W(n), W(scratch), LSL 12);
        } else {
            a64!(a ; cmp X(n), X(scratch), LSL 12);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

pub fn emit_shift_rr(a: &mut Asm, size: u32, kind: ShiftKind, d: u32, n: u32, m: u32) {
    if size == 4 {
        match kind {
            ShiftKind::Lsl => a64!(a ; lsl W(d), W(n), W(m)),
            ShiftKind::Lsr => a64!(a ; lsr W(d), W(n), W(m)),
            ShiftKind::Asr => a64!(a ; asr W(d), W(n), W(m)),
            ShiftKind::Ror => a64!(a ; ror W(d), W(n), W(m)),
        }
    } else {
        match kind {
            ShiftKind::Lsl => a64!(a ; lsl X(d), X(n), X(m)),
            ShiftKind::Lsr => a64!(a ; lsr X(d), X(n), X(m)),
            ShiftKind::Asr => a64!(a ; asr X(d), X(n), X(m)),
            ShiftKind::Ror => a64!(a ; ror X(d), X(n), X(m)),
        }
    }
}

pub fn emit_shift_imm(a: &mut Asm, size: u32, kind: ShiftKind, d: u32, n: u32, shift: u32) {
    debug_assert!(shift < size * 8);
    if size == 4 {
        match kind {
            ShiftKind::Lsl => a64!(a ; lsl W(d), W(n), shift),
            ShiftKind::Lsr => a64!(a ; lsr W(d), W(n), shift),
            ShiftKind::Asr => a64!(a ; asr W(d), W(n), shift),
            ShiftKind::Ror => a64!(a ; ror W(d), W(n), shift),
        }
    } else {
        match kind {
            ShiftKind::Lsl => a64!(a ; lsl X(d), X(n), shift),
            ShiftKind::Lsr => a64!(a ; lsr X(d), X(n), shift),
            ShiftKind::Asr => a64!(a ; asr X(d), X(n), shift),
            ShiftKind::Ror => a64!(a ; ror X(d), X(n), shift),
        }
    }
}

pub fn emit_lsl_imm(a: &mut Asm, size: u32, d: u32, n: u32, shift: u32) {
    emit_shift_imm(a, size, ShiftKind::Lsl, d, n, shift);
}

pub fn emit_lsr_imm(a: &mut Asm, size: u32, d: u32, n: u32, shift: u32) {
    emit_shift_imm(a, size, ShiftKind::Lsr, d, n, shift);
}

pub fn emit_ubfx(a: &mut Asm, size: u32, d: u32, n: u32, lsb: u32, width: u32) {
    if size == 4 {
        a64!(a ; ubfx W(d), W(n), lsb, width);
    } else {
        a64!(a ; ubfx X(d), X(n), lsb, width);
    }
}

pub fn emit_ubfiz(a: &mut Asm, size: u32, d: u32, n: u32, lsb: u32, width: u32) {
    if size == 4 {
        a64!(a ; ubfiz W(d), W(n), lsb, width);
    } else {
        a64!(a ; ubfiz X(d), X(n), lsb, width);
    }
}

pub fn emit_bfi(a: &mut Asm, size: u32, d: u32, n: u32, lsb: u32, width: u32) {
    if size == 4 {
        a64!(a ; bfi W(d), W(n), lsb, width);
    } else {
        a64!(a ; bfi X(d), X(n), lsb, width);
    }
}

pub fn emit_cbz(a: &mut Asm, size: u32, reg: u32, label: DynamicLabel) {
    if size == 4 {
        a64!(a ; cbz W(reg), =>label);
    } else {
        a64!(a ; cbz X(reg), =>label);
    }
}

pub fn emit_cbnz(a: &mut Asm, size: u32, reg: u32, label: DynamicLabel) {
    if size == 4 {
        a64!(a ; cbnz W(reg), =>label);
    } else {
        a64!(a ; cbnz X(reg), =>label);
    }
}

// ---------------------------------------------------------------------------
// multiplies, divides, extensions

pub fn emit_mul(a: &mut Asm, size: u32, d: u32, n: u32, m: u32) {
    if size == 4 {
        a64!(a ; mul W(d), W(n), W(m));
    } else {
        a64!(a ; mul X(d), X(n), X(m));
    }
}

pub fn emit_umulh(a: &mut Asm, d: u32, n: u32, m: u32) {
    a64!(a ; umulh X(d), X(n), X(m));
}

pub fn emit_smulh(a: &mut Asm, d: u32, n: u32, m: u32) {
    a64!(a ; smulh X(d), X(n), X(m));
}

/// 32x32 -> 64 unsigned multiply into an X register.
pub fn emit_umull(a: &mut Asm, d: u32, n: u32, m: u32) {
    a64!(a ; umull X(d), W(n), W(m));
}

pub fn emit_smull(a: &mut Asm, d: u32, n: u32, m: u32) {
    a64!(a ; smull X(d), W(n), W(m));
}

/// `d = acc - n * m`
pub fn emit_msub(a: &mut Asm, size: u32, d: u32, n: u32, m: u32, acc: u32) {
    if size == 4 {
        a64!(a ; msub W(d), W(n), W(m), W(acc));
    } else {
        a64!(a ; msub X(d), X(n), X(m), X(acc));
    }
}

pub fn emit_udiv(a: &mut Asm, size: u32, d: u32, n: u32, m: u32) {
    if size == 4 {
        a64!(a ; udiv W(d), W(n), W(m));
    } else {
        a64!(a ; udiv X(d), X(n), X(m));
    }
}

pub fn emit_sdiv(a: &mut Asm, size: u32, d: u32, n: u32, m: u32) {
    if size == 4 {
        a64!(a ; sdiv W(d), W(n), W(m));
    } else {
        a64!(a ; sdiv X(d), X(n), X(m));
    }
}

pub fn emit_clz(a: &mut Asm, size: u32, d: u32, n: u32) {
    if size == 4 {
        a64!(a ; clz W(d), W(n));
    } else {
        a64!(a ; clz X(d), X(n));
    }
}

pub fn emit_rbit(a: &mut Asm, size: u32, d: u32, n: u32) {
    if size == 4 {
        a64!(a ; rbit W(d), W(n));
    } else {
        a64!(a ; rbit X(d), X(n));
    }
}

pub fn emit_rev(a: &mut Asm, size: u32, d: u32, n: u32) {
    if size == 4 {
        a64!(a ; rev W(d), W(n));
    } else {
        a64!(a ; rev X(d), X(n));
    }
}

/// Sign-extend the low `8 << size_log` bits of `n` into the full X register.
pub fn emit_sext(a: &mut Asm, size_log: u8, d: u32, n: u32) {
    match size_log {
        0 => a64!(a ; sxtb X(d), W(n)),
        1 => a64!(a ; sxth X(d), W(n)),
        2 => a64!(a ; sxtw X(d), W(n)),
        _ => panic!("no extension for quadword"),
    }
}

// ---------------------------------------------------------------------------
// scalar floating point

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatBinOp {
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
}

pub fn emit_float_binop(a: &mut Asm, size: u32, op: FloatBinOp, d: u32, n: u32, m: u32) {
    if size == 4 {
        match op {
            FloatBinOp::Fadd => a64!(a ; fadd S(d), S(n), S(m)),
            FloatBinOp::Fsub => a64!(a ; fsub S(d), S(n), S(m)),
            FloatBinOp::Fmul => a64!(a ; fmul S(d), S(n), S(m)),
            FloatBinOp::Fdiv => a64!(a ; fdiv S(d), S(n), S(m)),
        }
    } else {
        match op {
            FloatBinOp::Fadd => a64!(a ; fadd D(d), D(n), D(m)),
            FloatBinOp::Fsub => a64!(a ; fsub D(d), D(n), D(m)),
            FloatBinOp::Fmul => a64!(a ; fmul D(d), D(n), D(m)),
            FloatBinOp::Fdiv => a64!(a ; fdiv D(d), D(n), D(m)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatUnOp {
    Fneg,
    Fabs,
    Fsqrt,
    Frecpe,
    Frsqrte,
}

pub fn emit_float_unop(a: &mut Asm, size: u32, op: FloatUnOp, d: u32, n: u32) {
    if size == 4 {
        match op {
            FloatUnOp::Fneg => a64!(a ; fneg S(d), S(n)),
            FloatUnOp::Fabs => a64!(a ; fabs S(d), S(n)),
            FloatUnOp::Fsqrt => a64!(a ; fsqrt S(d), S(n)),
            FloatUnOp::Frecpe => a64!(a ; frecpe S(d), S(n)),
            FloatUnOp::Frsqrte => a64!(a ; frsqrte S(d), S(n)),
        }
    } else {
        match op {
            FloatUnOp::Fneg => a64!(a ; fneg D(d), D(n)),
            FloatUnOp::Fabs => a64!(a ; fabs D(d), D(n)),
            FloatUnOp::Fsqrt => a64!(a ; fsqrt D(d), D(n)),
            FloatUnOp::Frecpe => a64!(a ; frecpe D(d), D(n)),
            FloatUnOp::Frsqrte => a64!(a ; frsqrte D(d), D(n)),
        }
    }
}

pub fn emit_fcmp(a: &mut Asm, size: u32, n: u32, m: u32) {
    if size == 4 {
        a64!(a ; fcmp S(n), S(m));
    } else {
        a64!(a ; fcmp D(n), D(m));
    }
}

pub fn emit_fmov_rr(a: &mut Asm, size: u32, d: u32, n: u32) {
    if size == 4 {
        a64!(a ; fmov S(d), S(n));
    } else {
        a64!(a ; fmov D(d), D(n));
    }
}

pub fn emit_fmov_from_gp(a: &mut Asm, size: u32, d: u32, n: u32) {
    if size == 4 {
        a64!(a ; fmov S(d), W(n));
    } else {
        a64!(a ; fmov D(d), X(n));
    }
}

pub fn emit_fmov_to_gp(a: &mut Asm, size: u32, d: u32, n: u32) {
    if size == 4 {
        a64!(a ; fmov W(d), S(n));
    } else {
        a64!(a ; fmov X(d), D(n));
    }
}

/// fcvt between single and double precision.
pub fn emit_fcvt(a: &mut Asm, dst_size: u32, src_size: u32, d: u32, n: u32) {
    match (dst_size, src_size) {
        (4, 8) => a64!(a ; fcvt S(d), D(n)),
        (8, 4) => a64!(a ; fcvt D(d), S(n)),
        _ => panic!("fcvt requires a precision change"),
    }
}

/// signed integer -> float
pub fn emit_scvtf(a: &mut Asm, float_size: u32, int_size: u32, d: u32, n: u32) {
    match (float_size, int_size) {
        (4, 4) => a64!(a ; scvtf S(d), W(n)),
        (4, 8) => a64!(a ; scvtf S(d), X(n)),
        (8, 4) => a64!(a ; scvtf D(d), W(n)),
        (8, 8) => a64!(a ; scvtf D(d), X(n)),
        _ => unreachable!(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FcvtRound {
    /// round to nearest (ties to even)
    Nearest,
    /// toward plus infinity
    Ceil,
    /// toward minus infinity
    Floor,
    /// toward zero
    Trunc,
}

/// float -> signed integer with explicit rounding.
pub fn emit_fcvt_to_int(
    a: &mut Asm,
    round: FcvtRound,
    int_size: u32,
    float_size: u32,
    d: u32,
    n: u32,
) {
    match (round, int_size, float_size) {
        (FcvtRound::Nearest, 4, 4) => a64!(a ; fcvtns W(d), S(n)),
        (FcvtRound::Nearest, 4, 8) => a64!(a ; fcvtns W(d), D(n)),
        (FcvtRound::Nearest, 8, 4) => a64!(a ; fcvtns X(d), S(n)),
        (FcvtRound::Nearest, 8, 8) => a64!(a ; fcvtns X(d), D(n)),
        (FcvtRound::Ceil, 4, 4) => a64!(a ; fcvtps W(d), S(n)),
        (FcvtRound::Ceil, 4, 8) => a64!(a ; fcvtps W(d), D(n)),
        (FcvtRound::Ceil, 8, 4) => a64!(a ; fcvtps X(d), S(n)),
        (FcvtRound::Ceil, 8, 8) => a64!(a ; fcvtps X(d), D(n)),
        (FcvtRound::Floor, 4, 4) => a64!(a ; fcvtms W(d), S(n)),
        (FcvtRound::Floor, 4, 8) => a64!(a ; fcvtms W(d), D(n)),
        (FcvtRound::Floor, 8, 4) => a64!(a ; fcvtms X(d), S(n)),
        (FcvtRound::Floor, 8, 8) => a64!(a ; fcvtms X(d), D(n)),
        (FcvtRound::Trunc, 4, 4) => a64!(a ; fcvtzs W(d), S(n)),
        (FcvtRound::Trunc, 4, 8) => a64!(a ; fcvtzs W(d), D(n)),
        (FcvtRound::Trunc, 8, 4) => a64!(a ; fcvtzs X(d), S(n)),
        (FcvtRound::Trunc, 8, 8) => a64!(a ; fcvtzs X(d), D(n)),
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------------
// immediate materialization (no PC knowledge; see Backend::get_imm_relative
// for the address-aware forms)

/// Load `val` into a register using mov forms only: a single movz/movn/orr
/// when possible, otherwise movz plus up to three movk.
pub fn emit_mov_imm(a: &mut Asm, size: u32, reg: u32, val: u64) {
    let val = if size == 4 { val as u32 as u64 } else { val };

    // single movz: one 16-bit group
    for group in 0..4u32 {
        let mask = 0xffffu64 << (16 * group);
        if val & !mask == 0 {
            let imm = (val >> (16 * group)) as u32;
            match (size == 4, group) {
                (true, 0) => a64!(a ; movz W(reg), imm),
                (true, 1) => a64!(a ; movz W(reg), imm, lsl 16),
                (false, 0) => a64!(a ; movz X(reg), imm),
                (false, 1) => a64!(a ; movz X(reg), imm, lsl 16),
                (false, 2) => a64!(a ; movz X(reg), imm, lsl 32),
                (false, 3) => a64!(a ; movz X(reg), imm, lsl 48),
                _ => unreachable!(),
            }
            return;
        }
    }

    // single movn: the complement fits one group
    let inv = if size == 4 { !val & 0xffff_ffff } else { !val };
    for group in 0..4u32 {
        let mask = 0xffffu64 << (16 * group);
        if inv & !mask == 0 {
            let imm = (inv >> (16 * group)) as u32;
            match (size == 4, group) {
                (true, 0) => a64!(a ; movn W(reg), imm),
                (true, 1) => a64!(a ; movn W(reg), imm, lsl 16),
                (false, 0) => a64!(a ; movn X(reg), imm),
                (false, 1) => a64!(a ; movn X(reg), imm, lsl 16),
                (false, 2) => a64!(a ; movn X(reg), imm, lsl 32),
                (false, 3) => a64!(a ; movn X(reg), imm, lsl 48),
                _ => unreachable!(),
            }
            return;
        }
    }

    // a 32-bit value with one group all-ones: movn to the W register
    // zero-extends into the X view
    if val == val as u32 as u64 {
        let inv32 = !(val as u32);
        if val & LSL16_MASK == LSL16_MASK {
            a64!(a ; movn W(reg), (inv32 & 0xffff));
            return;
        }
        if val & LSL0_MASK == LSL0_MASK {
            a64!(a ; movn W(reg), (inv32 >> 16), lsl 16);
            return;
        }
    }

    // bitmask immediates via orr with the zero register
    if size == 8 && is_valid_immediate_mask(val, 8) {
        a64!(a ; orr X(reg), xzr, val);
        return;
    }
    if is_valid_immediate_mask(val, 4) {
        a64!(a ; orr W(reg), wzr, (val as u32));
        return;
    }

    // general case: movz plus movk per nonzero group; at least two groups
    // are nonzero or one of the single-instruction forms would have matched
    let mut first = true;
    for group in 0..4u32 {
        let imm = ((val >> (16 * group)) & 0xffff) as u32;
        if imm == 0 {
            continue;
        }
        match (first, size == 4, group) {
            (true, true, 0) => a64!(a ; movz W(reg), imm),
            (true, true, 1) => a64!(a ; movz W(reg), imm, lsl 16),
            (true, false, 0) => a64!(a ; movz X(reg), imm),
            (true, false, 1) => a64!(a ; movz X(reg), imm, lsl 16),
            (true, false, 2) => a64!(a ; movz X(reg), imm, lsl 32),
            (true, false, 3) => a64!(a ; movz X(reg), imm, lsl 48),
            (false, true, 1) => a64!(a ; movk W(reg), imm, lsl 16),
            (false, false, 1) => a64!(a ; movk X(reg), imm, lsl 16),
            (false, false, 2) => a64!(a ; movk X(reg), imm, lsl 32),
            (false, false, 3) => a64!(a ; movk X(reg), imm, lsl 48),
            _ => unreachable!(),
        }
        first = false;
    }
}

// ---------------------------------------------------------------------------
// raw encodings for instructions dynasm cannot take absolute operands for

pub fn push_word(a: &mut Asm, word: u32) {
    a.extend(word.to_le_bytes());
}

/// `adr reg, pc+rel`; `rel` must fit 21 signed bits.
pub fn enc_adr(reg: u32, rel: i64) -> u32 {
    debug_assert!(is_valid_immediate_signed(rel, 21));
    let imm = rel as u32 & 0x1f_ffff;
    0x1000_0000 | ((imm & 3) << 29) | ((imm >> 2) << 5) | reg
}

/// `adrp reg, page(pc)+pagerel`; `pagerel` is in 4 KiB pages, 21 signed bits.
pub fn enc_adrp(reg: u32, pagerel: i64) -> u32 {
    debug_assert!(is_valid_immediate_signed(pagerel, 21));
    let imm = pagerel as u32 & 0x1f_ffff;
    0x9000_0000 | ((imm & 3) << 29) | ((imm >> 2) << 5) | reg
}

/// `b pc+rel`; `rel` must fit 28 signed bits and be word aligned.
pub fn enc_b(rel: i64) -> u32 {
    debug_assert!(rel & 3 == 0 && is_valid_immediate_signed(rel, 28));
    0x1400_0000 | ((rel >> 2) as u32 & 0x03ff_ffff)
}

/// `bl pc+rel`; same constraints as [`enc_b`].
pub fn enc_bl(rel: i64) -> u32 {
    debug_assert!(rel & 3 == 0 && is_valid_immediate_signed(rel, 28));
    0x9400_0000 | ((rel >> 2) as u32 & 0x03ff_ffff)
}

pub fn enc_mrs_nzcv(reg: u32) -> u32 {
    0xd53b_4200 | reg
}

pub fn enc_msr_nzcv(reg: u32) -> u32 {
    0xd51b_4200 | reg
}

/// `mov x29, sp` (add x29, sp, #0).
pub const MOV_FP_SP: u32 = 0x9100_03fd;

/// `mov sp, x29` (add sp, x29, #0).
pub const MOV_SP_FP: u32 = 0x9100_03bf;

pub fn emit_mrs_nzcv(a: &mut Asm, reg: u32) {
    push_word(a, enc_mrs_nzcv(reg));
}

pub fn emit_msr_nzcv(a: &mut Asm, reg: u32) {
    push_word(a, enc_msr_nzcv(reg));
}
