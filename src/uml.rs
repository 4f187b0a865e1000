//! The machine-independent intermediate language consumed by the back end.
//!
//! A front end builds [`Inst`] streams out of these types; the back end lowers
//! them to AArch64. Instructions carry a size (4 or 8 bytes), an optional
//! condition, a requested flag-update mask and up to four parameters.

use std::ffi::c_void;
use std::fmt;

use bitflags::bitflags;

use crate::handle::HandleId;

/// Log2 access sizes used by memory parameters.
pub const SIZE_BYTE: u8 = 0;
pub const SIZE_WORD: u8 = 1;
pub const SIZE_DWORD: u8 = 2;
pub const SIZE_QWORD: u8 = 3;

/// C callback invoked by `CALLC`. Receives the instruction's memory parameter.
pub type CFunc = unsafe extern "C" fn(*mut c_void);

bitflags! {
    /// Flag-update mask. Bit positions match the persisted flags byte.
    pub struct FlagSet: u8 {
        const C = 0x01;
        const V = 0x02;
        const Z = 0x04;
        const S = 0x08;
        const U = 0x10;
    }
}

/// Instruction condition codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Always,
    Z,
    Nz,
    S,
    Ns,
    C,
    Nc,
    V,
    Nv,
    U,
    Nu,
    A,
    Be,
    G,
    Le,
    L,
    Ge,
}

/// Rounding modes for `FTOINT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    Default,
    Trunc,
    Round,
    Ceil,
    Floor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[rustfmt::skip]
pub enum Opcode {
    // compile-time opcodes
    Handle, Hash, Label, Comment, Mapvar,
    // control flow
    Nop, Break, Debug, Exit, Hashjmp, Jmp, Exh, Callh, Ret, Callc, Recover,
    // internal registers
    Setfmod, Getfmod, Getexp, Getflgs, Setflgs, Save, Restore,
    // integer operations
    Load, Loads, Store, Read, Readm, Write, Writem,
    Carry, Set, Mov, Sext, Roland, Rolins,
    Add, Addc, Sub, Subb, Cmp,
    Mulu, Mululw, Muls, Mulslw, Divu, Divs,
    And, Test, Or, Xor, Lzcnt, Tzcnt, Bswap,
    Shl, Shr, Sar, Rol, Rolc, Ror, Rorc,
    // floating point
    Fload, Fstore, Fread, Fwrite, Fmov, Ftoint, Ffrint, Ffrflt, Frnds,
    Fadd, Fsub, Fcmp, Fmul, Fdiv, Fneg, Fabs, Fsqrt, Frecip, Frsqrt,
    Fcopyi, Icopyf,
}

pub const OPCODE_COUNT: usize = Opcode::Icopyf as usize + 1;

/// An instruction operand as produced by the front end.
///
/// `Immediate` values are sign-extended to 64 bits by the front end.
/// `Memory` is a raw pointer to a machine-word cell owned by the embedder.
#[derive(Clone, Debug, PartialEq)]
pub enum Parameter {
    Immediate(u64),
    IntReg(u8),
    FloatReg(u8),
    Memory(*mut u8),
    Handle(HandleId),
    Label(u32),
    CFunc(CFunc),
    MapVar(u32),
    Size(u8),
    SizeScale { size: u8, scale: u8 },
    SizeSpace { size: u8, space: u8 },
    Rounding(Rounding),
    Text(Box<str>),
}

impl Parameter {
    pub fn mem<T>(ptr: *mut T) -> Parameter {
        Parameter::Memory(ptr as *mut u8)
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Parameter::Immediate(_))
    }

    pub fn immediate(&self) -> u64 {
        match self {
            Parameter::Immediate(v) => *v,
            other => panic!("parameter {:?} is not an immediate", other),
        }
    }

    pub fn handle(&self) -> HandleId {
        match self {
            Parameter::Handle(h) => *h,
            other => panic!("parameter {:?} is not a code handle", other),
        }
    }

    pub fn label(&self) -> u32 {
        match self {
            Parameter::Label(l) => *l,
            other => panic!("parameter {:?} is not a code label", other),
        }
    }

    pub fn mapvar(&self) -> u32 {
        match self {
            Parameter::MapVar(m) => *m,
            other => panic!("parameter {:?} is not a map variable", other),
        }
    }
}

/// One UML instruction.
#[derive(Clone, Debug)]
pub struct Inst {
    pub opcode: Opcode,
    pub size: u32,
    pub cond: Cond,
    pub flags: FlagSet,
    pub params: Vec<Parameter>,
}

impl Inst {
    pub fn new(opcode: Opcode, size: u32) -> Inst {
        assert!(size == 4 || size == 8, "instruction size must be 4 or 8");
        Inst {
            opcode,
            size,
            cond: Cond::Always,
            flags: FlagSet::empty(),
            params: Vec::new(),
        }
    }

    pub fn with_cond(mut self, cond: Cond) -> Inst {
        self.cond = cond;
        self
    }

    pub fn with_flags(mut self, flags: FlagSet) -> Inst {
        self.flags = flags;
        self
    }

    pub fn arg(mut self, param: Parameter) -> Inst {
        assert!(self.params.len() < 4);
        self.params.push(param);
        self
    }

    pub fn param(&self, index: usize) -> &Parameter {
        &self.params[index]
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.opcode, self.size)?;
        if self.cond != Cond::Always {
            write!(f, " ({:?})", self.cond)?;
        }
        for (i, p) in self.params.iter().enumerate() {
            write!(f, "{}", if i == 0 { " " } else { ", " })?;
            match p {
                Parameter::Immediate(v) => write!(f, "${:x}", v)?,
                Parameter::IntReg(r) => write!(f, "i{}", r)?,
                Parameter::FloatReg(r) => write!(f, "f{}", r)?,
                Parameter::Memory(p) => write!(f, "[{:p}]", *p)?,
                Parameter::Handle(h) => write!(f, "h{}", h.index())?,
                Parameter::Label(l) => write!(f, "$L{:x}", l)?,
                Parameter::CFunc(_) => write!(f, "cfunc")?,
                Parameter::MapVar(m) => write!(f, "m{}", m)?,
                Parameter::Size(s) => write!(f, "size={}", 1 << s)?,
                Parameter::SizeScale { size, scale } => write!(f, "size={},scale={}", 1 << size, scale)?,
                Parameter::SizeSpace { size, space } => write!(f, "size={},space={}", 1 << size, space)?,
                Parameter::Rounding(r) => write!(f, "{:?}", r)?,
                Parameter::Text(t) => write!(f, "{:?}", t)?,
            }
        }
        if !self.flags.is_empty() {
            write!(f, " [flags={:02x}]", self.flags.bits())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_match_persisted_layout() {
        assert_eq!(FlagSet::C.bits(), 1 << 0);
        assert_eq!(FlagSet::V.bits(), 1 << 1);
        assert_eq!(FlagSet::Z.bits(), 1 << 2);
        assert_eq!(FlagSet::S.bits(), 1 << 3);
        assert_eq!(FlagSet::U.bits(), 1 << 4);
    }

    #[test]
    fn inst_builder() {
        let i = Inst::new(Opcode::Add, 8)
            .with_flags(FlagSet::C | FlagSet::Z)
            .arg(Parameter::IntReg(0))
            .arg(Parameter::Immediate(1))
            .arg(Parameter::Immediate(2));
        assert_eq!(i.params.len(), 3);
        assert_eq!(i.param(1).immediate(), 1);
        assert_eq!(i.cond, Cond::Always);
    }

    #[test]
    #[should_panic]
    fn bad_size_rejected() {
        let _ = Inst::new(Opcode::Add, 2);
    }
}
