//! The back-end object: owns the code cache, hash table, handles and machine
//! state, classifies UML parameters onto the host register allocation, and
//! provides the emission helpers shared by the opcode lowerers in `codegen`.

use std::collections::HashMap;
use std::ffi::c_void;

use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};

use crate::cache::CodeCache;
use crate::codegen;
use crate::emitter::*;
use crate::error::BackendError;
use crate::handle::{HandleId, Handles};
use crate::hash::{CodePtr, HashTable};
use crate::map::MapVariables;
use crate::space::{AccessSide, MemoryAccessors, SpaceDesc, SpecificAccess};
use crate::state::{MachineState, NearState};
use crate::uml::{Cond, Inst, Parameter};

/// Relationship between host NZCV.C and the UML carry flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CarryState {
    /// NZCV carries no information about UML C.
    Poison,
    /// Host C holds UML C directly (established by adds/adcs).
    Canonical,
    /// Host C holds inverted UML C (established by subs/cmp borrow).
    Logical,
}

// permitted parameter kinds
pub(crate) const PTYPE_I: u32 = 1 << 0;
pub(crate) const PTYPE_R: u32 = 1 << 1;
pub(crate) const PTYPE_F: u32 = 1 << 2;
pub(crate) const PTYPE_M: u32 = 1 << 3;
pub(crate) const PTYPE_MR: u32 = PTYPE_M | PTYPE_R;
pub(crate) const PTYPE_MRI: u32 = PTYPE_M | PTYPE_R | PTYPE_I;
pub(crate) const PTYPE_MF: u32 = PTYPE_M | PTYPE_F;

/// A UML parameter classified against the host register allocation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BeParam {
    Imm(u64),
    IntReg(u32),
    FloatReg(u32),
    Mem { ptr: *mut u8, cold: bool },
}

impl BeParam {
    pub fn is_immediate(&self) -> bool {
        matches!(self, BeParam::Imm(_))
    }

    pub fn is_immediate_value(&self, value: u64) -> bool {
        matches!(self, BeParam::Imm(v) if *v == value)
    }

    pub fn immediate(&self) -> u64 {
        match self {
            BeParam::Imm(v) => *v,
            _ => panic!("not an immediate"),
        }
    }

    pub fn is_int_reg(&self) -> bool {
        matches!(self, BeParam::IntReg(_))
    }

    pub fn is_float_reg(&self) -> bool {
        matches!(self, BeParam::FloatReg(_))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, BeParam::Mem { .. })
    }

    pub fn is_cold_register(&self) -> bool {
        matches!(self, BeParam::Mem { cold: true, .. })
    }

    pub fn memory(&self) -> *mut u8 {
        match self {
            BeParam::Mem { ptr, .. } => *ptr,
            _ => panic!("not a memory parameter"),
        }
    }

    /// The backing host register, or `default` for non-register parameters.
    pub fn select_ireg(&self, default: u32) -> u32 {
        match self {
            BeParam::IntReg(r) => *r,
            _ => default,
        }
    }

    pub fn select_freg(&self, default: u32) -> u32 {
        match self {
            BeParam::FloatReg(r) => *r,
            _ => default,
        }
    }
}

/// Debugger instruction hook consulted by the `DEBUG` opcode.
#[derive(Clone, Copy)]
pub struct DebugHook {
    /// Word holding the debugger state flags.
    pub flags: *const u32,
    /// Bit within the flags word that enables the per-instruction hook.
    pub bit: u32,
    pub obj: *mut c_void,
    pub func: unsafe extern "C" fn(*mut c_void, u32),
}

pub struct BackendConfig {
    pub cache_size: usize,
    pub modes: u32,
    pub addrbits: u32,
    pub ignorebits: u32,
    pub spaces: Vec<SpaceDesc>,
    pub debug_hook: Option<DebugHook>,
}

impl Default for BackendConfig {
    fn default() -> BackendConfig {
        BackendConfig {
            cache_size: 4 << 20,
            modes: 1,
            addrbits: 32,
            ignorebits: 0,
            spaces: Vec::new(),
            debug_hook: None,
        }
    }
}

/// Register-mapping capabilities reported to the front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendInfo {
    pub direct_iregs: u32,
    pub direct_fregs: u32,
}

pub(crate) type OpcodeFunc = fn(&mut Backend, &mut Asm, &Inst);

pub struct Backend {
    pub(crate) cache: CodeCache,
    pub(crate) hash: HashTable,
    pub(crate) map: Box<MapVariables>,
    pub(crate) handles: Handles,
    pub(crate) accessors: Vec<MemoryAccessors>,
    pub(crate) debug_hook: Option<DebugHook>,

    pub(crate) near: *mut NearState,
    pub(crate) baseptr: *mut u8,

    pub(crate) carry_state: CarryState,
    pub(crate) code_base: u64,
    pub(crate) block_labels: HashMap<u32, DynamicLabel>,
    next_label: u32,

    pub(crate) entry: CodePtr,
    pub(crate) exit: CodePtr,
    pub(crate) nocode: CodePtr,
    pub(crate) endofblock: CodePtr,

    opcode_table: [OpcodeFunc; crate::uml::OPCODE_COUNT],
}

unsafe extern "C" fn end_of_block_abort() {
    log::error!("fell off the end of a generated code block");
    std::process::abort();
}

impl Backend {
    pub fn new(config: BackendConfig) -> Result<Backend, BackendError> {
        let mut cache = CodeCache::new(config.cache_size)?;

        let near = cache.alloc_near(std::mem::size_of::<NearState>(), 16) as *mut NearState;
        unsafe {
            near.write(NearState::new());
        }

        let mut backend = Backend {
            cache,
            hash: HashTable::new(config.modes as usize, config.addrbits, config.ignorebits),
            map: Box::new(MapVariables::new()),
            handles: Handles::new(),
            accessors: config.spaces.into_iter().map(MemoryAccessors::new).collect(),
            debug_hook: config.debug_hook,
            near,
            baseptr: near as *mut u8,
            carry_state: CarryState::Poison,
            code_base: 0,
            block_labels: HashMap::new(),
            next_label: 0,
            entry: std::ptr::null(),
            exit: std::ptr::null(),
            nocode: std::ptr::null(),
            endofblock: std::ptr::null(),
            opcode_table: codegen::build_opcode_table(),
        };
        backend.reset();
        Ok(backend)
    }

    pub fn state(&self) -> &MachineState {
        unsafe { &(*self.near).state }
    }

    pub fn state_mut(&mut self) -> &mut MachineState {
        unsafe { &mut (*self.near).state }
    }

    pub(crate) fn exp_ptr(&self) -> *mut u8 {
        unsafe { &mut (*self.near).state.exp as *mut u32 as *mut u8 }
    }

    pub(crate) fn fmod_ptr(&self) -> *mut u8 {
        unsafe { &mut (*self.near).state.fmod as *mut u8 }
    }

    pub(crate) fn emulated_flags_ptr(&self) -> *mut u8 {
        unsafe { &mut (*self.near).emulated_flags as *mut u32 as *mut u8 }
    }

    pub fn create_handle(&mut self, name: &str) -> HandleId {
        self.handles.create(name)
    }

    pub fn handle_codeptr(&self, handle: HandleId) -> CodePtr {
        self.handles.codeptr(handle)
    }

    pub fn create_label(&mut self) -> u32 {
        self.next_label += 1;
        self.next_label - 1
    }

    pub fn hash_exists(&self, mode: u32, pc: u32) -> bool {
        self.hash.code_exists(mode, pc)
    }

    pub fn get_info(&self) -> BackendInfo {
        let direct_iregs = INT_REGISTER_MAP.iter().take_while(|&&r| r != 0).count() as u32;
        let direct_fregs = FLOAT_REGISTER_MAP.iter().take_while(|&&r| r != 0).count() as u32;
        BackendInfo {
            direct_iregs,
            direct_fregs,
        }
    }

    /// Flush all generated code and regenerate the runtime stubs. Handle
    /// bindings and hash table contents are discarded.
    pub fn reset(&mut self) {
        self.cache.flush();
        self.handles.unbind_all();
        self.map.clear();
        self.carry_state = CarryState::Poison;

        let dst = self.cache.top();
        self.code_base = dst as u64;
        let mut a = Asm::new(dst as usize);

        // entry: build the top-level frame, install the base pointer and the
        // emulated flags, then jump to the code pointer argument
        self.entry = dst;
        a64!(a ; stp x29, x30, [sp, -0xa0]!);
        push_word(&mut a, MOV_FP_SP);
        a64!(a
            ; stp x19, x20, [sp, 0x10]
            ; stp x21, x22, [sp, 0x20]
            ; stp x23, x24, [sp, 0x30]
            ; stp x25, x26, [sp, 0x40]
            ; stp x27, x28, [sp, 0x50]
            ; stp d8, d9, [sp, 0x60]
            ; stp d10, d11, [sp, 0x70]
            ; stp d12, d13, [sp, 0x80]
            ; stp d14, d15, [sp, 0x90]
        );
        self.get_imm_absolute(&mut a, BASE_REG, self.baseptr as u64);
        self.emit_ldr_mem(&mut a, 4, FLAGS_REG, self.emulated_flags_ptr());
        a64!(a ; br x0);

        // exit: unwind any nested subroutine frames via the frame pointer
        // anchor, restore non-volatiles and return the value in w0
        self.exit = unsafe { dst.add(a.offset().0) };
        push_word(&mut a, MOV_SP_FP);
        a64!(a
            ; ldp x19, x20, [sp, 0x10]
            ; ldp x21, x22, [sp, 0x20]
            ; ldp x23, x24, [sp, 0x30]
            ; ldp x25, x26, [sp, 0x40]
            ; ldp x27, x28, [sp, 0x50]
            ; ldp d8, d9, [sp, 0x60]
            ; ldp d10, d11, [sp, 0x70]
            ; ldp d12, d13, [sp, 0x80]
            ; ldp d14, d15, [sp, 0x90]
            ; ldp x29, x30, [sp], 0xa0
            ; ret
        );

        // no-code stub: the hash table default; bounces to the argument
        self.nocode = unsafe { dst.add(a.offset().0) };
        a64!(a ; br x0);

        // end-of-block stub: control must never fall off a block
        self.endofblock = unsafe { dst.add(a.offset().0) };
        self.call_arm_addr(&mut a, end_of_block_abort as usize as u64);

        let code = a.finalize().expect("stub assembly cannot fail");
        let top = self
            .cache
            .begin_codegen(code.len())
            .expect("code cache too small for runtime stubs");
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), top, code.len());
        }
        self.cache.end_codegen(code.len());

        self.hash.reset(self.nocode);
    }

    /// Run generated code starting at the bound entry handle; returns the
    /// value passed to `EXIT`. Only meaningful on an AArch64 host.
    pub fn execute(&mut self, entry: HandleId) -> u32 {
        self.cache.codegen_complete();
        let code = self.handles.codeptr(entry);
        assert!(!code.is_null(), "entry handle is not bound");
        let entry_fn: unsafe extern "C" fn(CodePtr) -> u32 =
            unsafe { std::mem::transmute(self.entry) };
        unsafe { entry_fn(code) }
    }

    /// Lower a block of UML instructions into the code cache.
    pub fn generate(&mut self, insts: &[Inst]) -> Result<(), BackendError> {
        self.carry_state = CarryState::Poison;
        self.block_labels.clear();

        // align the block start to a cache line
        let dst = self.cache.top_aligned(64);
        let align_pad = dst as usize - self.cache.top() as usize;
        self.code_base = dst as u64;
        let mut a = Asm::new(dst as usize);

        for inst in insts {
            log::trace!("{:012x}: {}", self.code_base + a.offset().0 as u64, inst);
            let func = self.opcode_table[inst.opcode as usize];
            func(self, &mut a, inst);
        }

        // trap control flow falling off the end of the block
        self.emit_b_abs(&mut a, self.endofblock as u64);

        let code = a
            .finalize()
            .map_err(|err| BackendError::Asm(format!("{:?}", err)))?;
        let total = align_pad + code.len();
        self.cache
            .begin_codegen(total)
            .ok_or(BackendError::CacheFull)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
        }
        self.cache.end_codegen(total);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // parameter classification

    pub(crate) fn be_param(&self, param: &Parameter, allowed: u32) -> BeParam {
        match param {
            Parameter::Immediate(value) => {
                assert!(allowed & PTYPE_I != 0);
                BeParam::Imm(*value)
            }
            Parameter::Memory(ptr) => {
                assert!(allowed & PTYPE_M != 0);
                BeParam::Mem {
                    ptr: *ptr,
                    cold: false,
                }
            }
            // a register that maps to a host register stays in it; otherwise
            // it routes to its cell in the machine state
            Parameter::IntReg(regnum) => {
                assert!(allowed & PTYPE_R != 0);
                assert!(allowed & PTYPE_M != 0);
                let regnum = *regnum as usize;
                let hostreg = INT_REGISTER_MAP[regnum];
                if hostreg != 0 {
                    BeParam::IntReg(hostreg)
                } else {
                    BeParam::Mem {
                        ptr: unsafe { &mut (*self.near).state.r[regnum] as *mut u64 as *mut u8 },
                        cold: true,
                    }
                }
            }
            Parameter::FloatReg(regnum) => {
                assert!(allowed & PTYPE_F != 0);
                assert!(allowed & PTYPE_M != 0);
                let regnum = *regnum as usize;
                let hostreg = FLOAT_REGISTER_MAP[regnum];
                if hostreg != 0 {
                    BeParam::FloatReg(hostreg)
                } else {
                    BeParam::Mem {
                        ptr: unsafe { &mut (*self.near).state.f[regnum] as *mut u64 as *mut u8 },
                        cold: true,
                    }
                }
            }
            other => panic!("unexpected parameter {:?}", other),
        }
    }

    // -----------------------------------------------------------------------
    // immediates

    /// Materialize `val` without assuming the base pointer is live yet.
    pub(crate) fn get_imm_absolute(&self, a: &mut Asm, reg: u32, val: u64) {
        if is_simple_mov_immediate(val, 8) {
            emit_mov_imm(a, 8, reg, val);
            return;
        }

        let codeoffs = self.code_base + a.offset().0 as u64;
        let reloffs = val as i64 - codeoffs as i64;
        if is_valid_immediate_signed(reloffs, 21) {
            push_word(a, enc_adr(reg, reloffs));
            return;
        }

        let pagebase = codeoffs & !0xfff;
        let pagerel = val as i64 - pagebase as i64;
        if is_valid_immediate_signed(pagerel, 21 + 12) {
            let pagedelta = ((val & !0xfff) as i64 - pagebase as i64) >> 12;
            push_word(a, enc_adrp(reg, pagedelta));
            let pageoffs = val & 0xfff;
            if pageoffs != 0 {
                emit_addsub_imm(a, 8, AluOp::Add, reg, reg, pageoffs, reg);
            }
            return;
        }

        emit_mov_imm(a, 8, reg, val);
    }

    /// Materialize `val`, additionally trying PC- and base-relative forms.
    pub(crate) fn get_imm_relative(&self, a: &mut Asm, size: u32, reg: u32, val: u64) {
        if size == 4 {
            emit_mov_imm(a, 4, reg, val);
            return;
        }

        if is_simple_mov_immediate(val, 8) {
            emit_mov_imm(a, 8, reg, val);
            return;
        }

        let codeoffs = self.code_base + a.offset().0 as u64;
        let reloffs = val as i64 - codeoffs as i64;
        if is_valid_immediate_signed(reloffs, 21) {
            push_word(a, enc_adr(reg, reloffs));
            return;
        }

        // values near the base pointer are reachable with one or two adds
        let diff = val as i64 - self.baseptr as i64;
        if diff > 0 && is_valid_immediate_addsub(diff as u64) {
            emit_addsub_imm(a, 8, AluOp::Add, reg, BASE_REG, diff as u64, reg);
            return;
        }
        if diff < 0 && is_valid_immediate_addsub(-diff as u64) {
            emit_addsub_imm(a, 8, AluOp::Sub, reg, BASE_REG, -diff as u64, reg);
            return;
        }

        let pagebase = codeoffs & !0xfff;
        let pagerel = val as i64 - pagebase as i64;
        if is_valid_immediate_signed(pagerel, 21 + 12) {
            let pagedelta = ((val & !0xfff) as i64 - pagebase as i64) >> 12;
            push_word(a, enc_adrp(reg, pagedelta));
            let pageoffs = val & 0xfff;
            if pageoffs != 0 {
                emit_addsub_imm(a, 8, AluOp::Add, reg, reg, pageoffs, reg);
            }
            return;
        }

        emit_mov_imm(a, 8, reg, val);
    }

    // -----------------------------------------------------------------------
    // loads and stores relative to the base pointer

    pub(crate) fn emit_base_mem(&self, a: &mut Asm, op: MemOp, reg: u32, ptr: *const u8) {
        let diff = ptr as i64 - self.baseptr as i64;
        let max_shift = op.max_shift();

        if is_valid_offset(diff, max_shift) {
            let scaled = diff >= 0
                && diff & make_bitmask(max_shift) as i64 == 0
                && diff < (1 << (12 + max_shift));
            if scaled {
                emit_mem_op(a, op, reg, Mem::Scaled(BASE_REG, diff as u32));
            } else {
                emit_mem_op(a, op, reg, Mem::Unscaled(BASE_REG, diff as i32));
            }
            return;
        }

        let codeoffs = self.code_base + a.offset().0 as u64;
        let reloffs = ptr as i64 - codeoffs as i64;
        if is_valid_immediate_signed(reloffs, 21) {
            push_word(a, enc_adr(MEM_SCRATCH_REG, reloffs));
            emit_mem_op(a, op, reg, Mem::Scaled(MEM_SCRATCH_REG, 0));
            return;
        }

        if diff > 0 && is_valid_immediate(diff as u64, 16) {
            emit_mov_imm(a, 8, MEM_SCRATCH_REG, diff as u64);
            emit_mem_op(a, op, reg, Mem::RegOff(BASE_REG, MEM_SCRATCH_REG));
            return;
        }

        if diff > 0 && is_valid_immediate_addsub(diff as u64) {
            emit_addsub_imm(a, 8, AluOp::Add, MEM_SCRATCH_REG, BASE_REG, diff as u64, MEM_SCRATCH_REG);
            emit_mem_op(a, op, reg, Mem::Scaled(MEM_SCRATCH_REG, 0));
            return;
        }
        if diff < 0 && is_valid_immediate_addsub(-diff as u64) {
            emit_addsub_imm(a, 8, AluOp::Sub, MEM_SCRATCH_REG, BASE_REG, -diff as u64, MEM_SCRATCH_REG);
            emit_mem_op(a, op, reg, Mem::Scaled(MEM_SCRATCH_REG, 0));
            return;
        }

        let pagebase = codeoffs & !0xfff;
        let pagerel = ptr as i64 - pagebase as i64;
        if is_valid_immediate_signed(pagerel, 21 + 12) {
            let pagedelta = ((ptr as u64 & !0xfff) as i64 - pagebase as i64) >> 12;
            push_word(a, enc_adrp(MEM_SCRATCH_REG, pagedelta));
            let pageoffs = ptr as u64 & 0xfff;
            if is_valid_offset(pageoffs as i64, max_shift) {
                emit_mem_op(a, op, reg, Mem::Scaled(MEM_SCRATCH_REG, pageoffs as u32));
            } else {
                emit_addsub_imm(a, 8, AluOp::Add, MEM_SCRATCH_REG, MEM_SCRATCH_REG, pageoffs, MEM_SCRATCH_REG);
                emit_mem_op(a, op, reg, Mem::Scaled(MEM_SCRATCH_REG, 0));
            }
            return;
        }

        if diff >= 0 {
            let shift = if diff & make_bitmask(max_shift) as i64 != 0 {
                0
            } else {
                max_shift
            };
            if is_valid_immediate((diff >> shift) as u64, 32) {
                emit_mov_imm(a, 8, MEM_SCRATCH_REG, (diff >> shift) as u64);
                if shift != 0 {
                    emit_mem_op(a, op, reg, Mem::RegShift(BASE_REG, MEM_SCRATCH_REG, shift));
                } else {
                    emit_mem_op(a, op, reg, Mem::RegOff(BASE_REG, MEM_SCRATCH_REG));
                }
                return;
            }
        }

        emit_mov_imm(a, 8, MEM_SCRATCH_REG, ptr as u64);
        emit_mem_op(a, op, reg, Mem::Scaled(MEM_SCRATCH_REG, 0));
    }

    pub(crate) fn emit_ldr_mem(&self, a: &mut Asm, size: u32, reg: u32, ptr: *const u8) {
        let op = if size == 4 { MemOp::LdrW } else { MemOp::LdrX };
        self.emit_base_mem(a, op, reg, ptr);
    }

    pub(crate) fn emit_ldrb_mem(&self, a: &mut Asm, reg: u32, ptr: *const u8) {
        self.emit_base_mem(a, MemOp::Ldrb, reg, ptr);
    }

    pub(crate) fn emit_ldrh_mem(&self, a: &mut Asm, reg: u32, ptr: *const u8) {
        self.emit_base_mem(a, MemOp::Ldrh, reg, ptr);
    }

    pub(crate) fn emit_ldrsb_mem(&self, a: &mut Asm, reg: u32, ptr: *const u8) {
        self.emit_base_mem(a, MemOp::Ldrsb, reg, ptr);
    }

    pub(crate) fn emit_ldrsh_mem(&self, a: &mut Asm, reg: u32, ptr: *const u8) {
        self.emit_base_mem(a, MemOp::Ldrsh, reg, ptr);
    }

    pub(crate) fn emit_ldrsw_mem(&self, a: &mut Asm, reg: u32, ptr: *const u8) {
        self.emit_base_mem(a, MemOp::Ldrsw, reg, ptr);
    }

    pub(crate) fn emit_str_mem(&self, a: &mut Asm, size: u32, reg: u32, ptr: *const u8) {
        let op = if size == 4 { MemOp::StrW } else { MemOp::StrX };
        self.emit_base_mem(a, op, reg, ptr);
    }

    pub(crate) fn emit_strb_mem(&self, a: &mut Asm, reg: u32, ptr: *const u8) {
        self.emit_base_mem(a, MemOp::Strb, reg, ptr);
    }

    pub(crate) fn emit_strh_mem(&self, a: &mut Asm, reg: u32, ptr: *const u8) {
        self.emit_base_mem(a, MemOp::Strh, reg, ptr);
    }

    pub(crate) fn emit_float_ldr_mem(&self, a: &mut Asm, size: u32, reg: u32, ptr: *const u8) {
        let op = if size == 4 { MemOp::LdrS } else { MemOp::LdrD };
        self.emit_base_mem(a, op, reg, ptr);
    }

    pub(crate) fn emit_float_str_mem(&self, a: &mut Asm, size: u32, reg: u32, ptr: *const u8) {
        let op = if size == 4 { MemOp::StrS } else { MemOp::StrD };
        self.emit_base_mem(a, op, reg, ptr);
    }

    // -----------------------------------------------------------------------
    // calls and absolute branches

    /// BL when the displacement fits, otherwise materialize and BLR.
    pub(crate) fn call_arm_addr(&self, a: &mut Asm, target: u64) {
        let codeoffs = self.code_base + a.offset().0 as u64;
        let rel = target as i64 - codeoffs as i64;
        if rel & 3 == 0 && is_valid_immediate_signed(rel, 28) {
            push_word(a, enc_bl(rel));
        } else {
            self.get_imm_relative(a, 8, SCRATCH_REG1, target);
            a64!(a ; blr X(SCRATCH_REG1));
        }
    }

    pub(crate) fn emit_b_abs(&self, a: &mut Asm, target: u64) {
        let codeoffs = self.code_base + a.offset().0 as u64;
        let rel = target as i64 - codeoffs as i64;
        if rel & 3 == 0 && is_valid_immediate_signed(rel, 28) {
            push_word(a, enc_b(rel));
        } else {
            self.get_imm_relative(a, 8, SCRATCH_REG1, target);
            a64!(a ; br X(SCRATCH_REG1));
        }
    }

    /// Call through a handle: direct when already bound, otherwise an
    /// indirect load of the handle's pointer slot.
    pub(crate) fn call_handle(&self, a: &mut Asm, handle: HandleId) {
        let target = self.handles.codeptr(handle);
        if !target.is_null() {
            self.call_arm_addr(a, target as u64);
        } else {
            self.emit_ldr_mem(a, 8, SCRATCH_REG1, self.handles.codeptr_addr(handle) as *const u8);
            a64!(a ; blr X(SCRATCH_REG1));
        }
    }

    // -----------------------------------------------------------------------
    // parameter moves

    pub(crate) fn mov_reg_param(&self, a: &mut Asm, size: u32, dst: u32, src: &BeParam) {
        match src {
            BeParam::Imm(value) => {
                let value = if size == 4 { *value as u32 as u64 } else { *value };
                self.get_imm_relative(a, size, dst, value);
            }
            BeParam::IntReg(reg) => {
                if *reg != dst {
                    emit_mov_rr(a, size, dst, *reg);
                }
            }
            BeParam::Mem { ptr, cold } => {
                // a 4-byte read of a cold register cell must take the high
                // half on big-endian hosts
                if cfg!(target_endian = "big") && size == 4 && *cold {
                    self.emit_ldr_mem(a, size, dst, unsafe { ptr.add(4) });
                } else {
                    self.emit_ldr_mem(a, size, dst, *ptr);
                }
            }
            BeParam::FloatReg(_) => panic!("float register in integer move"),
        }
    }

    pub(crate) fn mov_param_reg(&self, a: &mut Asm, size: u32, dst: &BeParam, src: u32) {
        match dst {
            BeParam::Mem { ptr, cold } => {
                // cold registers store the full cell to keep byte order sane
                if *cold {
                    self.emit_str_mem(a, 8, src, *ptr);
                } else {
                    self.emit_str_mem(a, size, src, *ptr);
                }
            }
            BeParam::IntReg(reg) => {
                if *reg != src {
                    emit_mov_rr(a, size, *reg, src);
                }
            }
            _ => panic!("bad destination parameter"),
        }
    }

    pub(crate) fn mov_param_imm(&self, a: &mut Asm, size: u32, dst: &BeParam, src: u64) {
        match dst {
            BeParam::Mem { ptr, cold } => {
                let movsize = if *cold { 8 } else { size };
                let value = if size == 4 { src as u32 as u64 } else { src };
                if value == 0 {
                    self.emit_str_mem(a, movsize, ZR, *ptr);
                } else {
                    self.get_imm_relative(a, movsize, SCRATCH_REG2, value);
                    self.emit_str_mem(a, movsize, SCRATCH_REG2, *ptr);
                }
            }
            BeParam::IntReg(reg) => {
                self.get_imm_relative(a, size, *reg, src);
            }
            _ => panic!("bad destination parameter"),
        }
    }

    /// General parameter-to-parameter move. A 4-byte move from a register or
    /// immediate source leaves the upper half of the destination cell alone;
    /// callers depend on the current behaviour.
    pub(crate) fn mov_param_param(&self, a: &mut Asm, size: u32, dst: &BeParam, src: &BeParam) {
        match src {
            BeParam::Mem { .. } => {
                if let BeParam::IntReg(reg) = dst {
                    self.mov_reg_param(a, size, *reg, src);
                } else {
                    self.mov_reg_param(a, size, SCRATCH_REG1, src);
                    self.mov_param_reg(a, size, dst, SCRATCH_REG1);
                }
            }
            BeParam::IntReg(reg) => self.mov_param_reg(a, size, dst, *reg),
            BeParam::Imm(value) => self.mov_param_imm(a, size, dst, *value),
            BeParam::FloatReg(_) => panic!("float register in integer move"),
        }
    }

    pub(crate) fn mov_mem_param(&self, a: &mut Asm, size: u32, dst: *mut u8, src: &BeParam) {
        match src {
            BeParam::Imm(0) => self.emit_str_mem(a, size, ZR, dst),
            BeParam::Imm(value) => {
                let value = if size == 4 { *value as u32 as u64 } else { *value };
                self.get_imm_relative(a, size, SCRATCH_REG2, value);
                self.emit_str_mem(a, size, SCRATCH_REG2, dst);
            }
            BeParam::Mem { ptr, cold } => {
                if cfg!(target_endian = "big") && size == 4 && *cold {
                    self.emit_ldr_mem(a, size, SCRATCH_REG2, unsafe { ptr.add(4) });
                } else {
                    self.emit_ldr_mem(a, size, SCRATCH_REG2, *ptr);
                }
                self.emit_str_mem(a, size, SCRATCH_REG2, dst);
            }
            BeParam::IntReg(reg) => self.emit_str_mem(a, size, *reg, dst),
            BeParam::FloatReg(_) => panic!("float register in integer move"),
        }
    }

    pub(crate) fn mov_float_reg_param(&self, a: &mut Asm, size: u32, dst: u32, src: &BeParam) {
        match src {
            BeParam::Mem { ptr, .. } => self.emit_float_ldr_mem(a, size, dst, *ptr),
            BeParam::FloatReg(reg) => {
                if *reg != dst {
                    if size == 4 {
                        a64!(a ; fmov S(dst), S(*reg));
                    } else {
                        a64!(a ; fmov D(dst), D(*reg));
                    }
                }
            }
            _ => panic!("bad float source parameter"),
        }
    }

    pub(crate) fn mov_float_param_reg(&self, a: &mut Asm, size: u32, dst: &BeParam, src: u32) {
        match dst {
            BeParam::Mem { ptr, .. } => self.emit_float_str_mem(a, size, src, *ptr),
            BeParam::FloatReg(reg) => {
                if *reg != src {
                    if size == 4 {
                        a64!(a ; fmov S(*reg), S(src));
                    } else {
                        a64!(a ; fmov D(*reg), D(src));
                    }
                }
            }
            _ => panic!("bad float destination parameter"),
        }
    }

    /// Move an integer register's bits into a float destination.
    pub(crate) fn mov_float_param_int_reg(&self, a: &mut Asm, size: u32, dst: &BeParam, src: u32) {
        match dst {
            BeParam::Mem { ptr, .. } => self.emit_str_mem(a, size, src, *ptr),
            BeParam::FloatReg(reg) => {
                if size == 4 {
                    a64!(a ; fmov S(*reg), W(src));
                } else {
                    a64!(a ; fmov D(*reg), X(src));
                }
            }
            _ => panic!("bad float destination parameter"),
        }
    }

    pub(crate) fn mov_float_param_param(&self, a: &mut Asm, size: u32, dst: &BeParam, src: &BeParam) {
        match dst {
            BeParam::FloatReg(reg) => self.mov_float_reg_param(a, size, *reg, src),
            BeParam::Mem { ptr: dstptr, .. } => match src {
                BeParam::FloatReg(reg) => self.mov_float_param_reg(a, size, dst, *reg),
                BeParam::Mem { ptr, .. } => {
                    self.emit_ldr_mem(a, size, SCRATCH_REG2, *ptr);
                    self.emit_str_mem(a, size, SCRATCH_REG2, *dstptr);
                }
                _ => panic!("bad float source parameter"),
            },
            _ => panic!("bad float destination parameter"),
        }
    }

    // -----------------------------------------------------------------------
    // flag machine

    pub(crate) fn store_carry_reg(&self, a: &mut Asm, reg: u32) {
        emit_bfi(a, 8, FLAGS_REG, reg, FLAG_BIT_C, 1);
    }

    pub(crate) fn store_carry(&mut self, a: &mut Asm, inverted: bool) {
        self.carry_state = if inverted {
            CarryState::Logical
        } else {
            CarryState::Canonical
        };
        emit_cset(a, 8, if inverted { HostCond::Lo } else { HostCond::Hs }, SCRATCH_REG1);
        self.store_carry_reg(a, SCRATCH_REG1);
    }

    pub(crate) fn get_carry(&self, a: &mut Asm, reg: u32, inverted: bool) {
        emit_logical_imm(a, 8, LogicalOp::And, reg, FLAGS_REG, 1);
        if inverted {
            emit_logical_imm(a, 8, LogicalOp::Eor, reg, reg, 1);
        }
    }

    /// Bring host NZCV.C in sync with the stored UML carry at the requested
    /// polarity. A no-op when the carry cache already matches.
    pub(crate) fn load_carry(&mut self, a: &mut Asm, inverted: bool) {
        let desired = if inverted {
            CarryState::Logical
        } else {
            CarryState::Canonical
        };
        if desired != self.carry_state {
            self.carry_state = desired;
            emit_mrs_nzcv(a, SCRATCH_REG1);
            emit_bfi(a, 8, SCRATCH_REG1, FLAGS_REG, 29, 1);
            if inverted {
                emit_logical_imm(a, 8, LogicalOp::Eor, SCRATCH_REG1, SCRATCH_REG1, 1 << 29);
            }
            emit_msr_nzcv(a, SCRATCH_REG1);
        }
    }

    /// Rebuild native NZCV from the packed flags byte in the flags register,
    /// leaving only C and U behind in the byte.
    pub(crate) fn set_flags(&mut self, a: &mut Asm) {
        self.carry_state = CarryState::Poison;

        emit_mrs_nzcv(a, TEMP_REG1);

        emit_logical_imm(a, 8, LogicalOp::And, TEMP_REG2, FLAGS_REG, 0b1100);
        emit_ubfx(a, 8, TEMP_REG3, FLAGS_REG, FLAG_BIT_V, 1);
        emit_alu_rr(a, 8, AluOp::Orr, TEMP_REG2, TEMP_REG2, TEMP_REG3);
        emit_bfi(a, 8, TEMP_REG1, TEMP_REG2, 28, 4);

        emit_msr_nzcv(a, TEMP_REG1);

        emit_mov_imm(a, 8, TEMP_REG2, 0b10001);
        emit_alu_rr(a, 8, AluOp::And, FLAGS_REG, FLAGS_REG, TEMP_REG2);
    }

    /// After an fcmp: both-are-numbers is PL && NE && HS && VS inverted, so
    /// the conjunction of those four conditions is the unordered flag.
    pub(crate) fn store_unordered(&self, a: &mut Asm) {
        emit_cset(a, 8, HostCond::Pl, SCRATCH_REG1);
        emit_cset(a, 8, HostCond::Ne, SCRATCH_REG2);
        emit_alu_rr(a, 8, AluOp::And, SCRATCH_REG1, SCRATCH_REG1, SCRATCH_REG2);
        emit_cset(a, 8, HostCond::Hs, SCRATCH_REG2);
        emit_alu_rr(a, 8, AluOp::And, SCRATCH_REG1, SCRATCH_REG1, SCRATCH_REG2);
        emit_cset(a, 8, HostCond::Vs, SCRATCH_REG2);
        emit_alu_rr(a, 8, AluOp::And, SCRATCH_REG1, SCRATCH_REG1, SCRATCH_REG2);
        emit_bfi(a, 8, FLAGS_REG, SCRATCH_REG1, FLAG_BIT_U, 1);
    }

    pub(crate) fn get_unordered(&self, a: &mut Asm, reg: u32) {
        emit_ubfx(a, 8, reg, FLAGS_REG, FLAG_BIT_U, 1);
    }

    // -----------------------------------------------------------------------
    // shift carry recovery

    pub(crate) fn calculate_carry_shift_left(
        &mut self,
        a: &mut Asm,
        size: u32,
        reg: u32,
        shift: u32,
        max_bits: u32,
    ) {
        self.carry_state = CarryState::Poison;

        let calc = a.new_dynamic_label();
        let end = a.new_dynamic_label();

        emit_cbnz(a, size, shift, calc);
        self.store_carry_reg(a, ZR);
        a64!(a ; b =>end);

        // carry = (value >> (max_bits + 1 - shift)) & 1
        a64!(a ; =>calc);
        emit_mov_imm(a, size, SCRATCH_REG1, (max_bits + 1) as u64);
        emit_alu_rr(a, size, AluOp::Sub, SCRATCH_REG1, SCRATCH_REG1, shift);
        emit_shift_rr(a, size, ShiftKind::Lsr, SCRATCH_REG1, reg, SCRATCH_REG1);
        self.store_carry_reg(a, SCRATCH_REG1);

        a64!(a ; =>end);
    }

    pub(crate) fn calculate_carry_shift_left_imm(
        &mut self,
        a: &mut Asm,
        size: u32,
        reg: u32,
        shift: u32,
        max_bits: u32,
    ) {
        self.carry_state = CarryState::Poison;

        if shift == 0 {
            self.store_carry_reg(a, ZR);
            return;
        }

        emit_lsr_imm(a, size, SCRATCH_REG1, reg, max_bits + 1 - shift);
        self.store_carry_reg(a, SCRATCH_REG1);
    }

    pub(crate) fn calculate_carry_shift_right(&mut self, a: &mut Asm, size: u32, reg: u32, shift: u32) {
        self.carry_state = CarryState::Poison;

        let calc = a.new_dynamic_label();
        let end = a.new_dynamic_label();

        emit_cbnz(a, size, shift, calc);
        self.store_carry_reg(a, ZR);
        a64!(a ; b =>end);

        // carry = (value >> (shift - 1)) & 1
        a64!(a ; =>calc);
        emit_addsub_imm(a, size, AluOp::Sub, SCRATCH_REG1, shift, 1, SCRATCH_REG1);
        emit_shift_rr(a, size, ShiftKind::Lsr, SCRATCH_REG1, reg, SCRATCH_REG1);
        self.store_carry_reg(a, SCRATCH_REG1);

        a64!(a ; =>end);
    }

    pub(crate) fn calculate_carry_shift_right_imm(&mut self, a: &mut Asm, size: u32, reg: u32, shift: u32) {
        self.carry_state = CarryState::Poison;

        if shift == 0 {
            self.store_carry_reg(a, ZR);
            return;
        }

        emit_lsr_imm(a, size, SCRATCH_REG1, reg, shift - 1);
        self.store_carry_reg(a, SCRATCH_REG1);
    }

    // -----------------------------------------------------------------------
    // conditions

    pub(crate) fn host_cond(cond: Cond) -> HostCond {
        match cond {
            Cond::Z => HostCond::Eq,
            Cond::Nz => HostCond::Ne,
            Cond::S => HostCond::Mi,
            Cond::Ns => HostCond::Pl,
            // carry conditions in compare (borrow) polarity
            Cond::C => HostCond::Lo,
            Cond::Nc => HostCond::Hs,
            Cond::V => HostCond::Vs,
            Cond::Nv => HostCond::Vc,
            Cond::A => HostCond::Hi,
            Cond::Be => HostCond::Ls,
            Cond::G => HostCond::Gt,
            Cond::Le => HostCond::Le,
            Cond::L => HostCond::Lt,
            Cond::Ge => HostCond::Ge,
            Cond::Always | Cond::U | Cond::Nu => panic!("condition {:?} has no NZCV mapping", cond),
        }
    }

    /// Emit the inverse test of `cond` branching over the conditional body.
    /// Returns the label to bind after the body, or `None` for ALWAYS.
    pub(crate) fn emit_skip(&mut self, a: &mut Asm, cond: Cond) -> Option<DynamicLabel> {
        if cond == Cond::Always {
            return None;
        }

        let skip = a.new_dynamic_label();
        match cond {
            Cond::U => a64!(a ; tbz X(FLAGS_REG), FLAG_BIT_U, =>skip),
            Cond::Nu => a64!(a ; tbnz X(FLAGS_REG), FLAG_BIT_U, =>skip),
            Cond::C | Cond::Nc => match self.carry_state {
                CarryState::Canonical => emit_b_cond(a, Self::host_cond(cond), skip),
                CarryState::Logical => emit_b_cond(a, Self::host_cond(cond).negate(), skip),
                CarryState::Poison => {
                    if cond == Cond::C {
                        a64!(a ; tbz X(FLAGS_REG), FLAG_BIT_C, =>skip);
                    } else {
                        a64!(a ; tbnz X(FLAGS_REG), FLAG_BIT_C, =>skip);
                    }
                }
            },
            Cond::A | Cond::Be => {
                self.load_carry(a, true);
                emit_b_cond(a, Self::host_cond(cond).negate(), skip);
            }
            _ => emit_b_cond(a, Self::host_cond(cond).negate(), skip),
        }
        Some(skip)
    }

    // -----------------------------------------------------------------------
    // memory accessor bridge

    /// Set up a specific fast-path dispatch: masked address in w1, adjusted
    /// dispatch entry pointer in x0. Clobbers x6-x8.
    pub(crate) fn emit_memaccess_setup(
        &self,
        a: &mut Asm,
        addrp: &BeParam,
        acc: &MemoryAccessors,
        spec: &SpecificAccess,
        side: &AccessSide,
    ) {
        let addrreg = if acc.no_mask || acc.mask_simple { REG_PARAM2 } else { 6 };
        self.mov_reg_param(a, 4, addrreg, addrp);
        self.get_imm_relative(a, 8, 8, side.dispatch as u64);

        // when the high bits escape the global mask, extract them early
        if acc.high_bits != 0 && !acc.mask_high_bits {
            emit_ubfx(a, 4, 7, addrreg, spec.low_bits as u32, acc.high_bits as u32);
        }

        if acc.mask_simple {
            emit_logical_imm(a, 4, LogicalOp::And, REG_PARAM2, addrreg, acc.address_mask as u64);
        } else if !acc.no_mask {
            emit_mov_imm(a, 4, REG_PARAM2, acc.address_mask as u64);
        }

        if acc.high_bits == 0 {
            a64!(a ; ldr X(REG_PARAM1), [X(8)]);
        } else if !acc.mask_high_bits {
            a64!(a ; ldr X(REG_PARAM1), [X(8), X(7), LSL 3]);
        }

        if !acc.no_mask && !acc.mask_simple {
            emit_alu_rr(a, 4, AluOp::And, REG_PARAM2, REG_PARAM2, addrreg);
        }

        if acc.mask_high_bits {
            emit_lsr_imm(a, 4, 7, REG_PARAM2, spec.low_bits as u32);
            a64!(a ; ldr X(REG_PARAM1), [X(8), X(7), LSL 3]);
        }

        if side.displacement != 0 {
            emit_addsub_imm(a, 8, AluOp::Add, REG_PARAM1, REG_PARAM1, side.displacement as u64, 8);
        }
    }

    /// Writes narrower than the bus width shift data and byte mask into the
    /// correct lane of the native word before dispatching. Expects data in
    /// x2 and the narrow mask in x3.
    pub(crate) fn emit_narrow_memwrite(
        &self,
        a: &mut Asm,
        addrp: &BeParam,
        size_log: u8,
        acc: &MemoryAccessors,
    ) {
        let spec = acc.specific.as_ref().expect("narrow write needs a fast path");
        let addrreg = if acc.no_mask || acc.mask_simple { REG_PARAM2 } else { 5 };
        self.mov_reg_param(a, 4, addrreg, addrp);
        self.get_imm_relative(a, 8, 8, spec.write.dispatch as u64);

        // lane shift in bits: ((addr << -shift) or (addr >> shift)) masked to
        // the sub-word byte offset
        let shift = acc.addr_shift as i32 - 3;
        let shiftmask = ((spec.native_bytes as u32) - (1u32 << size_log)) << 3;
        if acc.endianness == crate::space::Endianness::Big {
            let shifted = if shift == 0 {
                addrreg
            } else {
                if shift < 0 {
                    emit_lsl_imm(a, 4, 6, addrreg, (-shift) as u32);
                } else {
                    emit_lsr_imm(a, 4, 6, addrreg, shift as u32);
                }
                6
            };
            emit_mov_imm(a, 4, 7, shiftmask as u64);
            emit_alu_rr(a, 4, AluOp::Bic, 7, 7, shifted);
        } else if shift == 0 {
            emit_logical_imm(a, 4, LogicalOp::And, 7, addrreg, shiftmask as u64);
        } else {
            if shift < 0 {
                emit_lsl_imm(a, 4, 7, addrreg, (-shift) as u32);
            } else {
                emit_lsr_imm(a, 4, 7, addrreg, shift as u32);
            }
            emit_logical_imm(a, 4, LogicalOp::And, 7, 7, shiftmask as u64);
        }

        if acc.high_bits != 0 && !acc.mask_high_bits {
            emit_ubfx(a, 4, 6, addrreg, spec.low_bits as u32, acc.high_bits as u32);
        }

        if acc.mask_simple {
            emit_logical_imm(a, 4, LogicalOp::And, REG_PARAM2, addrreg, acc.address_mask as u64);
        } else if !acc.no_mask {
            emit_mov_imm(a, 4, REG_PARAM2, acc.address_mask as u64);
        }

        if acc.high_bits == 0 {
            a64!(a ; ldr X(REG_PARAM1), [X(8)]);
        } else if !acc.mask_high_bits {
            a64!(a ; ldr X(REG_PARAM1), [X(8), X(6), LSL 3]);
        }

        if !acc.no_mask && !acc.mask_simple {
            emit_alu_rr(a, 4, AluOp::And, REG_PARAM2, REG_PARAM2, addrreg);
        }

        if acc.mask_high_bits {
            emit_lsr_imm(a, 4, 6, REG_PARAM2, spec.low_bits as u32);
            a64!(a ; ldr X(REG_PARAM1), [X(8), X(6), LSL 3]);
        }

        if spec.write.displacement != 0 {
            emit_addsub_imm(a, 8, AluOp::Add, REG_PARAM1, REG_PARAM1, spec.write.displacement as u64, 8);
        }

        // align data and mask with the addressed lane
        a64!(a
            ; lsl X(REG_PARAM3), X(REG_PARAM3), X(7)
            ; lsl X(REG_PARAM4), X(REG_PARAM4), X(7)
        );

        self.call_arm_addr(a, spec.write.function as u64);
    }
}

// ---------------------------------------------------------------------------
// sized memory operation dispatch

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemOp {
    LdrX,
    LdrW,
    Ldrb,
    Ldrh,
    Ldrsb,
    Ldrsh,
    Ldrsw,
    StrX,
    StrW,
    Strb,
    Strh,
    LdrD,
    LdrS,
    StrD,
    StrS,
}

impl MemOp {
    pub fn max_shift(self) -> u32 {
        match self {
            MemOp::Ldrb | MemOp::Ldrsb | MemOp::Strb => 0,
            MemOp::Ldrh | MemOp::Ldrsh | MemOp::Strh => 1,
            MemOp::LdrW | MemOp::Ldrsw | MemOp::StrW | MemOp::LdrS | MemOp::StrS => 2,
            MemOp::LdrX | MemOp::StrX | MemOp::LdrD | MemOp::StrD => 3,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Mem {
    /// Unsigned offset scaled by the access size.
    Scaled(u32, u32),
    /// 9-bit signed unscaled offset.
    Unscaled(u32, i32),
    /// Register offset.
    RegOff(u32, u32),
    /// Register offset shifted left by the access size.
    RegShift(u32, u32, u32),
}

pub(crate) fn emit_mem_op(a: &mut Asm, op: MemOp, reg: u32, mem: Mem) {
    match mem {
        Mem::Scaled(base, off) => match op {
            MemOp::LdrX => a64!(a ; ldr X(reg), [X(base), off]),
            MemOp::LdrW => a64!(a ; ldr W(reg), [X(base), off]),
            MemOp::Ldrb => a64!(a ; ldrb W(reg), [X(base), off]),
            MemOp::Ldrh => a64!(a ; ldrh W(reg), [X(base), off]),
            MemOp::Ldrsb => a64!(a ; ldrsb X(reg), [X(base), off]),
            MemOp::Ldrsh => a64!(a ; ldrsh X(reg), [X(base), off]),
            MemOp::Ldrsw => a64!(a ; ldrsw X(reg), [X(base), off]),
            MemOp::StrX => a64!(a ; str X(reg), [X(base), off]),
            MemOp::StrW => a64!(a ; str W(reg), [X(base), off]),
            MemOp::Strb => a64!(a ; strb W(reg), [X(base), off]),
            MemOp::Strh => a64!(a ; strh W(reg), [X(base), off]),
            MemOp::LdrD => a64!(a ; ldr D(reg), [X(base), off]),
            MemOp::LdrS => a64!(a ; ldr S(reg), [X(base), off]),
            MemOp::StrD => a64!(a ; str D(reg), [X(base), off]),
            MemOp::StrS => a64!(a ; str S(reg), [X(base), off]),
        },
        Mem::Unscaled(base, off) => match op {
            MemOp::LdrX => a64!(a ; ldur X(reg), [X(base), off]),
            MemOp::LdrW => a64!(a ; ldur W(reg), [X(base), off]),
            MemOp::Ldrb => a64!(a ; ldurb W(reg), [X(base), off]),
            MemOp::Ldrh => a64!(a ; ldurh W(reg), [X(base), off]),
            MemOp::Ldrsb => a64!(a ; ldursb X(reg), [X(base), off]),
            MemOp::Ldrsh => a64!(a ; ldursh X(reg), [X(base), off]),
            MemOp::Ldrsw => a64!(a ; ldursw X(reg), [X(base), off]),
            MemOp::StrX => a64!(a ; stur X(reg), [X(base), off]),
            MemOp::StrW => a64!(a ; stur W(reg), [X(base), off]),
            MemOp::Strb => a64!(a ; sturb W(reg), [X(base), off]),
            MemOp::Strh => a64!(a ; sturh W(reg), [X(base), off]),
            MemOp::LdrD => a64!(a ; ldur D(reg), [X(base), off]),
            MemOp::LdrS => a64!(a ; ldur S(reg), [X(base), off]),
            MemOp::StrD => a64!(a ; stur D(reg), [X(base), off]),
            MemOp::StrS => a64!(a ; stur S(reg), [X(base), off]),
        },
        Mem::RegOff(base, idx) => match op {
            MemOp::LdrX => a64!(a ; ldr X(reg), [X(base), X(idx)]),
            MemOp::LdrW => a64!(a ; ldr W(reg), [X(base), X(idx)]),
            MemOp::Ldrb => a64!(a ; ldrb W(reg), [X(base), X(idx)]),
            MemOp::Ldrh => a64!(a ; ldrh W(reg), [X(base), X(idx)]),
            MemOp::Ldrsb => a64!(a ; ldrsb X(reg), [X(base), X(idx)]),
            MemOp::Ldrsh => a64!(a ; ldrsh X(reg), [X(base), X(idx)]),
            MemOp::Ldrsw => a64!(a ; ldrsw X(reg), [X(base), X(idx)]),
            MemOp::StrX => a64!(a ; str X(reg), [X(base), X(idx)]),
            MemOp::StrW => a64!(a ; str W(reg), [X(base), X(idx)]),
            MemOp::Strb => a64!(a ; strb W(reg), [X(base), X(idx)]),
            MemOp::Strh => a64!(a ; strh W(reg), [X(base), X(idx)]),
            MemOp::LdrD => a64!(a ; ldr D(reg), [X(base), X(idx)]),
            MemOp::LdrS => a64!(a ; ldr S(reg), [X(base), X(idx)]),
            MemOp::StrD => a64!(a ; str D(reg), [X(base), X(idx)]),
            MemOp::StrS => a64!(a ; str S(reg), [X(base), X(idx)]),
        },
        Mem::RegShift(base, idx, shift) => match op {
            MemOp::LdrX => a64!(a ; ldr X(reg), [X(base), X(idx), LSL shift]),
            MemOp::LdrW => a64!(a ; ldr W(reg), [X(base), X(idx), LSL shift]),
            MemOp::Ldrb => a64!(a ; ldrb W(reg), [X(base), X(idx), LSL shift]),
            MemOp::Ldrh => a64!(a ; ldrh W(reg), [X(base), X(idx), LSL shift]),
            MemOp::Ldrsb => a64!(a ; ldrsb X(reg), [X(base), X(idx), LSL shift]),
            MemOp::Ldrsh => a64!(a ; ldrsh X(reg), [X(base), X(idx), LSL shift]),
            MemOp::Ldrsw => a64!(a ; ldrsw X(reg), [X(base), X(idx), LSL shift]),
            MemOp::StrX => a64!(a ; str X(reg), [X(base), X(idx), LSL shift]),
            MemOp::StrW => a64!(a ; str W(reg), [X(base), X(idx), LSL shift]),
            MemOp::Strb => a64!(a ; strb W(reg), [X(base), X(idx), LSL shift]),
            MemOp::Strh => a64!(a ; strh W(reg), [X(base), X(idx), LSL shift]),
            MemOp::LdrD => a64!(a ; ldr D(reg), [X(base), X(idx), LSL shift]),
            MemOp::LdrS => a64!(a ; ldr S(reg), [X(base), X(idx), LSL shift]),
            MemOp::StrD => a64!(a ; str D(reg), [X(base), X(idx), LSL shift]),
            MemOp::StrS => a64!(a ; str S(reg), [X(base), X(idx), LSL shift]),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend() -> Backend {
        Backend::new(BackendConfig {
            cache_size: 1 << 20,
            modes: 2,
            addrbits: 32,
            ignorebits: 0,
            spaces: Vec::new(),
            debug_hook: None,
        })
        .unwrap()
    }

    #[test]
    fn reset_generates_stubs() {
        let be = test_backend();
        assert!(!be.entry.is_null());
        assert!(!be.exit.is_null());
        assert!(!be.nocode.is_null());
        assert!(!be.endofblock.is_null());
        assert!(be.exit > be.entry);
    }

    #[test]
    fn int_register_classification() {
        let be = test_backend();
        let p = be.be_param(&Parameter::IntReg(0), PTYPE_MRI);
        assert_eq!(p, BeParam::IntReg(19));
        let p = be.be_param(&Parameter::IntReg(7), PTYPE_MRI);
        assert_eq!(p, BeParam::IntReg(26));
    }

    #[test]
    fn float_register_classification() {
        let be = test_backend();
        let p = be.be_param(&Parameter::FloatReg(3), PTYPE_MF);
        assert_eq!(p, BeParam::FloatReg(11));
    }

    #[test]
    fn memory_classification() {
        let be = test_backend();
        let mut cell = 0u64;
        let p = be.be_param(&Parameter::mem(&mut cell), PTYPE_MRI);
        assert!(p.is_memory());
        assert!(!p.is_cold_register());
    }

    #[test]
    fn info_reports_full_register_files() {
        let be = test_backend();
        let info = be.get_info();
        assert_eq!(info.direct_iregs, 8);
        assert_eq!(info.direct_fregs, 8);
    }

    #[test]
    #[should_panic]
    fn disallowed_parameter_kind_panics() {
        let be = test_backend();
        let _ = be.be_param(&Parameter::Immediate(1), PTYPE_MR);
    }
}
