//! Opcode lowerers: one function per UML opcode, dispatched through a table
//! built from `OPCODE_TABLE_SOURCE`.

use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi};

use crate::backend::{
    emit_mem_op, Backend, CarryState, Mem, MemOp, OpcodeFunc, PTYPE_M, PTYPE_MF, PTYPE_MR,
    PTYPE_MRI,
};
use crate::emitter::*;
use crate::hash::CodePtr;
use crate::uml::{Cond, FlagSet, Inst, Opcode, Parameter, Rounding, OPCODE_COUNT};

const OPCODE_TABLE_SOURCE: &[(Opcode, OpcodeFunc)] = &[
    // compile-time opcodes
    (Opcode::Handle, op_handle),
    (Opcode::Hash, op_hash),
    (Opcode::Label, op_label),
    (Opcode::Comment, op_comment),
    (Opcode::Mapvar, op_mapvar),
    // control flow
    (Opcode::Nop, op_nop),
    (Opcode::Break, op_break),
    (Opcode::Debug, op_debug),
    (Opcode::Exit, op_exit),
    (Opcode::Hashjmp, op_hashjmp),
    (Opcode::Jmp, op_jmp),
    (Opcode::Exh, op_exh),
    (Opcode::Callh, op_callh),
    (Opcode::Ret, op_ret),
    (Opcode::Callc, op_callc),
    (Opcode::Recover, op_recover),
    // internal registers
    (Opcode::Setfmod, op_setfmod),
    (Opcode::Getfmod, op_getfmod),
    (Opcode::Getexp, op_getexp),
    (Opcode::Getflgs, op_getflgs),
    (Opcode::Setflgs, op_setflgs),
    (Opcode::Save, op_save),
    (Opcode::Restore, op_restore),
    // integer operations
    (Opcode::Load, op_load),
    (Opcode::Loads, op_loads),
    (Opcode::Store, op_store),
    (Opcode::Read, op_read),
    (Opcode::Readm, op_readm),
    (Opcode::Write, op_write),
    (Opcode::Writem, op_writem),
    (Opcode::Carry, op_carry),
    (Opcode::Set, op_set),
    (Opcode::Mov, op_mov),
    (Opcode::Sext, op_sext),
    (Opcode::Roland, op_roland),
    (Opcode::Rolins, op_rolins),
    (Opcode::Add, op_add),
    (Opcode::Addc, op_addc),
    (Opcode::Sub, op_sub),
    (Opcode::Subb, op_subb),
    (Opcode::Cmp, op_cmp),
    (Opcode::Mulu, op_mulu),
    (Opcode::Mululw, op_mululw),
    (Opcode::Muls, op_muls),
    (Opcode::Mulslw, op_mulslw),
    (Opcode::Divu, op_divu),
    (Opcode::Divs, op_divs),
    (Opcode::And, op_and),
    (Opcode::Test, op_test),
    (Opcode::Or, op_or),
    (Opcode::Xor, op_xor),
    (Opcode::Lzcnt, op_lzcnt),
    (Opcode::Tzcnt, op_tzcnt),
    (Opcode::Bswap, op_bswap),
    (Opcode::Shl, op_shl),
    (Opcode::Shr, op_shr),
    (Opcode::Sar, op_sar),
    (Opcode::Rol, op_rol),
    (Opcode::Rolc, op_rolc),
    (Opcode::Ror, op_ror),
    (Opcode::Rorc, op_rorc),
    // floating point
    (Opcode::Fload, op_fload),
    (Opcode::Fstore, op_fstore),
    (Opcode::Fread, op_fread),
    (Opcode::Fwrite, op_fwrite),
    (Opcode::Fmov, op_fmov),
    (Opcode::Ftoint, op_ftoint),
    (Opcode::Ffrint, op_ffrint),
    (Opcode::Ffrflt, op_ffrflt),
    (Opcode::Frnds, op_frnds),
    (Opcode::Fadd, op_fadd),
    (Opcode::Fsub, op_fsub),
    (Opcode::Fcmp, op_fcmp),
    (Opcode::Fmul, op_fmul),
    (Opcode::Fdiv, op_fdiv),
    (Opcode::Fneg, op_fneg),
    (Opcode::Fabs, op_fabs),
    (Opcode::Fsqrt, op_fsqrt),
    (Opcode::Frecip, op_frecip),
    (Opcode::Frsqrt, op_frsqrt),
    (Opcode::Fcopyi, op_fcopyi),
    (Opcode::Icopyf, op_icopyf),
];

pub(crate) fn build_opcode_table() -> [OpcodeFunc; OPCODE_COUNT] {
    let mut table: [OpcodeFunc; OPCODE_COUNT] = [op_invalid; OPCODE_COUNT];
    for &(opcode, func) in OPCODE_TABLE_SOURCE {
        table[opcode as usize] = func;
    }
    table
}

fn op_invalid(_be: &mut Backend, _a: &mut Asm, inst: &Inst) {
    panic!("unhandled opcode {:?}", inst.opcode);
}

// ---------------------------------------------------------------------------
// shared bits

fn assert_no_condition(inst: &Inst) {
    assert_eq!(inst.cond, Cond::Always);
}

fn assert_no_flags(inst: &Inst) {
    assert!(inst.flags.is_empty());
}

fn assert_flags(inst: &Inst, valid: FlagSet) {
    assert!(valid.contains(inst.flags));
}

fn bind_skip(a: &mut Asm, skip: Option<DynamicLabel>) {
    if let Some(label) = skip {
        a64!(a ; =>label);
    }
}

fn block_label(be: &mut Backend, a: &mut Asm, id: u32) -> DynamicLabel {
    if let Some(label) = be.block_labels.get(&id) {
        *label
    } else {
        let label = a.new_dynamic_label();
        be.block_labels.insert(id, label);
        label
    }
}

fn size_scale(param: &Parameter) -> (u8, u8) {
    match param {
        Parameter::SizeScale { size, scale } => (*size, *scale),
        other => panic!("parameter {:?} is not a size/scale", other),
    }
}

fn size_space(param: &Parameter) -> (u8, u8) {
    match param {
        Parameter::SizeSpace { size, space } => (*size, *space),
        other => panic!("parameter {:?} is not a size/space", other),
    }
}

fn size_only(param: &Parameter) -> u8 {
    match param {
        Parameter::Size(size) => *size,
        other => panic!("parameter {:?} is not a size", other),
    }
}

fn rotl_sized(value: u64, count: u64, size: u32) -> u64 {
    if size == 4 {
        (value as u32).rotate_left(count as u32 & 31) as u64
    } else {
        value.rotate_left(count as u32 & 63)
    }
}

fn rotr_sized(value: u64, count: u64, size: u32) -> u64 {
    if size == 4 {
        (value as u32).rotate_right(count as u32 & 31) as u64
    } else {
        value.rotate_right(count as u32 & 63)
    }
}

// ---------------------------------------------------------------------------
// compile-time opcodes

fn op_handle(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_no_condition(inst);
    assert_no_flags(inst);
    assert_eq!(inst.params.len(), 1);

    be.carry_state = CarryState::Poison;

    let handle = inst.param(0).handle();

    // sequential flow jumps over the stack adjust; direct handle calls land
    // on it
    let skip = a.new_dynamic_label();
    a64!(a ; b =>skip);

    let addr = be.code_base + a.offset().0 as u64;
    be.handles.set_codeptr(handle, addr as CodePtr);

    // minimal non-leaf frame; the frame pointer itself is never updated, so
    // the FP chain shows one frame for any generated call depth
    a64!(a ; stp x29, x30, [sp, -16]!);
    a64!(a ; =>skip);
}

fn op_hash(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_no_condition(inst);
    assert_no_flags(inst);
    assert_eq!(inst.params.len(), 2);

    be.carry_state = CarryState::Poison;

    let mode = inst.param(0).immediate() as u32;
    let pc = inst.param(1).immediate() as u32;
    let addr = (be.code_base + a.offset().0 as u64) as CodePtr;
    be.hash.set_codeptr(mode, pc, addr);
}

fn op_label(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_no_condition(inst);
    assert_no_flags(inst);
    assert_eq!(inst.params.len(), 1);

    be.carry_state = CarryState::Poison;

    let label = block_label(be, a, inst.param(0).label());
    a64!(a ; =>label);
}

fn op_comment(_be: &mut Backend, _a: &mut Asm, inst: &Inst) {
    assert_no_condition(inst);
    assert_no_flags(inst);
    if let Parameter::Text(text) = inst.param(0) {
        log::trace!("comment: {}", text);
    }
}

fn op_mapvar(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_no_condition(inst);
    assert_no_flags(inst);

    let mapvar = inst.param(0).mapvar();
    let value = inst.param(1).immediate();
    be.map.set_value(be.code_base + a.offset().0 as u64, mapvar, value);
}

// ---------------------------------------------------------------------------
// control flow

fn op_nop(_be: &mut Backend, _a: &mut Asm, _inst: &Inst) {}

fn op_break(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;
    a64!(a ; brk 0);
}

fn op_debug(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    if let Some(hook) = be.debug_hook {
        be.carry_state = CarryState::Poison;

        let pcp = be.be_param(inst.param(0), PTYPE_MRI);

        let skip = a.new_dynamic_label();
        be.emit_ldr_mem(a, 4, TEMP_REG1, hook.flags as *const u8);
        let bit = hook.bit;
        a64!(a ; tbz X(TEMP_REG1), bit, =>skip);

        be.get_imm_relative(a, 8, REG_PARAM1, hook.obj as u64);
        be.mov_reg_param(a, 4, REG_PARAM2, &pcp);
        be.call_arm_addr(a, hook.func as usize as u64);

        a64!(a ; =>skip);
    }
}

fn op_exit(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_flags(inst);

    let retp = be.be_param(inst.param(0), PTYPE_MRI);

    let skip = be.emit_skip(a, inst.cond);
    be.mov_reg_param(a, 4, REG_PARAM1, &retp);
    be.emit_b_abs(a, be.exit as u64);
    bind_skip(a, skip);
}

fn op_hashjmp(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let modep = be.be_param(inst.param(0), PTYPE_MRI);
    let pcp = be.be_param(inst.param(1), PTYPE_MRI);
    let exh = inst.param(2).handle();

    // drop any nested subroutine frames back to the anchor
    push_word(a, MOV_SP_FP);

    let l1shift = be.hash.l1shift();
    let l2shift = be.hash.l2shift();
    let l1bits = be.hash.l1bits();
    let l2bits = be.hash.l2bits();
    let l1mask = be.hash.l1mask();
    let l2mask = be.hash.l2mask();

    if modep.is_immediate() && pcp.is_immediate() {
        let slot = be
            .hash
            .slot_addr(modep.immediate() as u32, pcp.immediate() as u32);
        be.emit_ldr_mem(a, 8, TEMP_REG1, slot as *const u8);
    } else if modep.is_immediate() {
        let l1 = be.hash.l1_addr(modep.immediate() as u32) as u64;

        be.mov_reg_param(a, 4, TEMP_REG2, &pcp);
        be.get_imm_relative(a, 8, TEMP_REG1, l1);

        emit_ubfx(a, 8, TEMP_REG3, TEMP_REG2, l1shift, l1bits);
        a64!(a ; ldr X(TEMP_REG3), [X(TEMP_REG1), X(TEMP_REG3), LSL 3]);

        emit_ubfx(a, 8, TEMP_REG2, TEMP_REG2, l2shift, l2bits);
        a64!(a ; ldr X(TEMP_REG1), [X(TEMP_REG3), X(TEMP_REG2), LSL 3]);
    } else {
        be.get_imm_relative(a, 8, TEMP_REG2, be.hash.base_ptr() as u64);

        let mode = modep.select_ireg(TEMP_REG1);
        be.mov_reg_param(a, 4, mode, &modep);
        a64!(a ; ldr X(TEMP_REG1), [X(TEMP_REG2), X(mode), LSL 3]);

        if pcp.is_immediate() {
            let pc = pcp.immediate() as u32;
            let l1val = (((pc >> l1shift) & l1mask) * 8) as u64;
            let l2val = (((pc >> l2shift) & l2mask) * 8) as u64;

            if is_valid_immediate(l1val, 15) {
                a64!(a ; ldr X(TEMP_REG1), [X(TEMP_REG1), (l1val as u32)]);
            } else {
                emit_mov_imm(a, 8, SCRATCH_REG1, l1val >> 3);
                a64!(a ; ldr X(TEMP_REG1), [X(TEMP_REG1), X(SCRATCH_REG1), LSL 3]);
            }

            if is_valid_immediate(l2val, 15) {
                a64!(a ; ldr X(TEMP_REG1), [X(TEMP_REG1), (l2val as u32)]);
            } else {
                emit_mov_imm(a, 8, SCRATCH_REG1, l2val >> 3);
                a64!(a ; ldr X(TEMP_REG1), [X(TEMP_REG1), X(SCRATCH_REG1), LSL 3]);
            }
        } else {
            let pc = pcp.select_ireg(TEMP_REG2);
            be.mov_reg_param(a, 4, pc, &pcp);

            emit_ubfx(a, 8, TEMP_REG3, pc, l1shift, l1bits);
            a64!(a ; ldr X(TEMP_REG3), [X(TEMP_REG1), X(TEMP_REG3), LSL 3]);

            emit_ubfx(a, 8, TEMP_REG2, pc, l2shift, l2bits);
            a64!(a ; ldr X(TEMP_REG1), [X(TEMP_REG3), X(TEMP_REG2), LSL 3]);
        }
    }

    // an empty slot holds the no-code stub, which bounces to its argument;
    // point that argument at the exception path just past the br
    push_word(a, enc_adr(REG_PARAM1, 8));
    a64!(a ; br X(TEMP_REG1));

    be.mov_mem_param(a, 4, be.exp_ptr(), &pcp);
    be.call_handle(a, exh);

    be.carry_state = CarryState::Poison;
}

fn op_jmp(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_flags(inst);

    let target = block_label(be, a, inst.param(0).label());

    if inst.cond == Cond::Always {
        a64!(a ; b =>target);
        return;
    }

    match inst.cond {
        Cond::U | Cond::Nu => {
            be.get_unordered(a, SCRATCH_REG1);
            if inst.cond == Cond::U {
                emit_cbnz(a, 8, SCRATCH_REG1, target);
            } else {
                emit_cbz(a, 8, SCRATCH_REG1, target);
            }
        }
        Cond::C | Cond::Nc => match be.carry_state {
            CarryState::Canonical => {
                emit_b_cond(a, Backend::host_cond(inst.cond).negate(), target)
            }
            CarryState::Logical => emit_b_cond(a, Backend::host_cond(inst.cond), target),
            CarryState::Poison => {
                be.get_carry(a, SCRATCH_REG1, false);
                if inst.cond == Cond::C {
                    emit_cbnz(a, 8, SCRATCH_REG1, target);
                } else {
                    emit_cbz(a, 8, SCRATCH_REG1, target);
                }
            }
        },
        Cond::A | Cond::Be => {
            be.load_carry(a, true);
            emit_b_cond(a, Backend::host_cond(inst.cond), target);
        }
        _ => emit_b_cond(a, Backend::host_cond(inst.cond), target),
    }
}

fn op_exh(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_no_flags(inst);

    let handle = inst.param(0).handle();
    let excp = be.be_param(inst.param(1), PTYPE_MRI);

    let skip = be.emit_skip(a, inst.cond);

    be.mov_mem_param(a, 4, be.exp_ptr(), &excp);
    be.call_handle(a, handle);

    bind_skip(a, skip);
    be.carry_state = CarryState::Poison;
}

fn op_callh(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_flags(inst);

    let handle = inst.param(0).handle();

    let skip = be.emit_skip(a, inst.cond);
    be.call_handle(a, handle);
    bind_skip(a, skip);

    be.carry_state = CarryState::Poison;
}

fn op_ret(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_flags(inst);
    assert!(inst.params.is_empty());

    let skip = be.emit_skip(a, inst.cond);
    a64!(a
        ; ldp x29, x30, [sp], 16
        ; ret
    );
    bind_skip(a, skip);
}

fn op_callc(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_flags(inst);

    let func = match inst.param(0) {
        Parameter::CFunc(func) => *func,
        other => panic!("parameter {:?} is not a C function", other),
    };
    let paramp = be.be_param(inst.param(1), PTYPE_M);

    let skip = be.emit_skip(a, inst.cond);

    // the flags register does not survive foreign code; spill and reload
    be.emit_str_mem(a, 4, FLAGS_REG, be.emulated_flags_ptr());

    be.get_imm_relative(a, 8, REG_PARAM1, paramp.memory() as u64);
    be.get_imm_relative(a, 8, TEMP_REG1, func as usize as u64);
    a64!(a ; blr X(TEMP_REG1));

    be.emit_ldr_mem(a, 4, FLAGS_REG, be.emulated_flags_ptr());

    bind_skip(a, skip);
    be.carry_state = CarryState::Poison;
}

fn op_recover(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let mapvar = inst.param(1).mapvar();

    // saved LR of the most recent generated subroutine call sits just below
    // the frame anchor; back up one instruction to the call site
    a64!(a ; ldur X(REG_PARAM2), [x29, -8]);
    be.get_imm_relative(a, 8, REG_PARAM1, &*be.map as *const crate::map::MapVariables as u64);
    emit_mov_imm(a, 8, REG_PARAM3, mapvar as u64);
    emit_addsub_imm(a, 8, AluOp::Sub, REG_PARAM2, REG_PARAM2, 4, SCRATCH_REG1);

    be.call_arm_addr(a, crate::map::map_get_value as usize as u64);

    be.mov_param_reg(a, inst.size, &dstp, REG_PARAM1);
}

// ---------------------------------------------------------------------------
// internal register operations

fn op_setfmod(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let srcp = be.be_param(inst.param(0), PTYPE_MRI);

    if srcp.is_immediate() {
        emit_mov_imm(a, inst.size, FUNC_SCRATCH_REG, srcp.immediate() & 3);
    } else {
        let src = srcp.select_ireg(FUNC_SCRATCH_REG);
        be.mov_reg_param(a, inst.size, src, &srcp);
        emit_logical_imm(a, inst.size, LogicalOp::And, FUNC_SCRATCH_REG, src, 3);
    }

    be.emit_strb_mem(a, FUNC_SCRATCH_REG, be.fmod_ptr());
}

fn op_getfmod(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let dst = dstp.select_ireg(TEMP_REG1);

    be.emit_ldrb_mem(a, dst, be.fmod_ptr());
    be.mov_param_reg(a, inst.size, &dstp, dst);
}

fn op_getexp(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let dst = dstp.select_ireg(TEMP_REG1);

    be.emit_ldr_mem(a, 4, dst, be.exp_ptr());
    be.mov_param_reg(a, inst.size, &dstp, dst);
}

fn op_getflgs(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let mask = FlagSet::from_bits_truncate(inst.param(1).immediate() as u8);

    let dst = dstp.select_ireg(TEMP_REG1);
    let mut first = true;

    if mask.contains(FlagSet::C) {
        emit_logical_imm(a, 8, LogicalOp::And, dst, FLAGS_REG, FlagSet::C.bits() as u64);
        first = false;
    }

    if mask.contains(FlagSet::V) {
        if first {
            emit_cset(a, 8, HostCond::Vs, dst);
            emit_lsl_imm(a, 8, dst, dst, FLAG_BIT_V);
            first = false;
        } else {
            emit_cset(a, 8, HostCond::Vs, SCRATCH_REG1);
            a64!(a ; orr X(dst), X(dst), X(SCRATCH_REG1), LSL 1);
        }
    }

    if mask.contains(FlagSet::Z) {
        if first {
            emit_cset(a, 8, HostCond::Eq, dst);
            emit_lsl_imm(a, 8, dst, dst, FLAG_BIT_Z);
            first = false;
        } else {
            emit_cset(a, 8, HostCond::Eq, SCRATCH_REG1);
            a64!(a ; orr X(dst), X(dst), X(SCRATCH_REG1), LSL 2);
        }
    }

    if mask.contains(FlagSet::S) {
        if first {
            emit_cset(a, 8, HostCond::Mi, dst);
            emit_lsl_imm(a, 8, dst, dst, FLAG_BIT_S);
            first = false;
        } else {
            emit_cset(a, 8, HostCond::Mi, SCRATCH_REG1);
            a64!(a ; orr X(dst), X(dst), X(SCRATCH_REG1), LSL 3);
        }
    }

    if mask.contains(FlagSet::U) {
        if first {
            emit_logical_imm(a, 8, LogicalOp::And, dst, FLAGS_REG, FlagSet::U.bits() as u64);
            first = false;
        } else {
            emit_logical_imm(a, 8, LogicalOp::And, SCRATCH_REG1, FLAGS_REG, FlagSet::U.bits() as u64);
            emit_alu_rr(a, 8, AluOp::Orr, dst, dst, SCRATCH_REG1);
        }
    }

    if first {
        emit_mov_rr(a, 8, dst, ZR);
    }

    be.mov_param_reg(a, inst.size, &dstp, dst);
}

fn op_setflgs(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);

    let flagsp = be.be_param(inst.param(0), PTYPE_MRI);

    be.mov_reg_param(a, inst.size, FLAGS_REG, &flagsp);
    be.set_flags(a);
}

fn op_save(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);
    assert_no_flags(inst);

    use crate::state::MachineState;

    let dstp = be.be_param(inst.param(0), PTYPE_M);

    let membase = SCRATCH_REG1;
    be.get_imm_relative(a, 8, membase, dstp.memory() as u64);

    // pack native NZCV plus the carry/unordered bits into the flags byte
    emit_mrs_nzcv(a, TEMP_REG1);
    emit_lsr_imm(a, 8, TEMP_REG1, TEMP_REG1, 28);

    emit_logical_imm(a, 8, LogicalOp::And, TEMP_REG2, TEMP_REG1, 0b1100); // zero + sign
    emit_alu_rr(a, 8, AluOp::Orr, TEMP_REG2, TEMP_REG2, FLAGS_REG); // carry + unordered
    emit_bfi(a, 8, TEMP_REG2, TEMP_REG1, FLAG_BIT_V, 1); // overflow

    let flags_off = MachineState::offset_flags() as u32;
    a64!(a ; strb W(TEMP_REG2), [X(membase), flags_off]);

    be.emit_ldrb_mem(a, TEMP_REG1, be.fmod_ptr());
    let fmod_off = MachineState::offset_fmod() as u32;
    a64!(a ; strb W(TEMP_REG1), [X(membase), fmod_off]);

    be.emit_ldr_mem(a, 4, TEMP_REG1, be.exp_ptr());
    let exp_off = MachineState::offset_exp() as u32;
    a64!(a ; str W(TEMP_REG1), [X(membase), exp_off]);

    for regnum in 0..8usize {
        let off = MachineState::offset_r(regnum) as u32;
        if INT_REGISTER_MAP[regnum] != 0 {
            a64!(a ; str X(INT_REGISTER_MAP[regnum]), [X(membase), off]);
        } else {
            let cell = unsafe { &mut (*be.near).state.r[regnum] as *mut u64 as *mut u8 };
            be.emit_ldr_mem(a, 8, TEMP_REG1, cell);
            a64!(a ; str X(TEMP_REG1), [X(membase), off]);
        }
    }

    for regnum in 0..8usize {
        let off = MachineState::offset_f(regnum) as u32;
        if FLOAT_REGISTER_MAP[regnum] != 0 {
            a64!(a ; str D(FLOAT_REGISTER_MAP[regnum]), [X(membase), off]);
        } else {
            let cell = unsafe { &mut (*be.near).state.f[regnum] as *mut u64 as *mut u8 };
            be.emit_ldr_mem(a, 8, TEMP_REG1, cell);
            a64!(a ; str X(TEMP_REG1), [X(membase), off]);
        }
    }
}

fn op_restore(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 4);
    assert_no_condition(inst);

    use crate::state::MachineState;

    let srcp = be.be_param(inst.param(0), PTYPE_M);

    let membase = SCRATCH_REG1;
    be.get_imm_relative(a, 8, membase, srcp.memory() as u64);

    for regnum in 0..8usize {
        let off = MachineState::offset_r(regnum) as u32;
        if INT_REGISTER_MAP[regnum] != 0 {
            a64!(a ; ldr X(INT_REGISTER_MAP[regnum]), [X(membase), off]);
        } else {
            let cell = unsafe { &mut (*be.near).state.r[regnum] as *mut u64 as *mut u8 };
            a64!(a ; ldr X(TEMP_REG1), [X(membase), off]);
            be.emit_str_mem(a, 8, TEMP_REG1, cell);
        }
    }

    for regnum in 0..8usize {
        let off = MachineState::offset_f(regnum) as u32;
        if FLOAT_REGISTER_MAP[regnum] != 0 {
            a64!(a ; ldr D(FLOAT_REGISTER_MAP[regnum]), [X(membase), off]);
        } else {
            let cell = unsafe { &mut (*be.near).state.f[regnum] as *mut u64 as *mut u8 };
            a64!(a ; ldr X(TEMP_REG1), [X(membase), off]);
            be.emit_str_mem(a, 8, TEMP_REG1, cell);
        }
    }

    let fmod_off = MachineState::offset_fmod() as u32;
    a64!(a ; ldrb W(TEMP_REG1), [X(membase), fmod_off]);
    be.emit_strb_mem(a, TEMP_REG1, be.fmod_ptr());

    let exp_off = MachineState::offset_exp() as u32;
    a64!(a ; ldr W(TEMP_REG1), [X(membase), exp_off]);
    be.emit_str_mem(a, 4, TEMP_REG1, be.exp_ptr());

    let flags_off = MachineState::offset_flags() as u32;
    a64!(a ; ldrb W(FLAGS_REG), [X(membase), flags_off]);
    be.set_flags(a);
}

// ---------------------------------------------------------------------------
// memory

fn op_load(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let basep = be.be_param(inst.param(1), PTYPE_M);
    let indp = be.be_param(inst.param(2), PTYPE_MRI);
    let (size_log, scale) = size_scale(inst.param(3));

    let basereg = TEMP_REG1;
    let dstreg = dstp.select_ireg(TEMP_REG2);

    let offset = if indp.is_immediate() {
        (indp.immediate() as i64) << scale
    } else {
        0
    };
    if indp.is_immediate() && offset >= 0 && is_valid_immediate(offset as u64, 15) {
        let ptr = unsafe { basep.memory().offset(offset as isize) };
        match size_log {
            0 => be.emit_ldrb_mem(a, dstreg, ptr),
            1 => be.emit_ldrh_mem(a, dstreg, ptr),
            2 => be.emit_ldr_mem(a, 4, dstreg, ptr),
            _ => be.emit_ldr_mem(a, 8, dstreg, ptr),
        }
    } else {
        be.get_imm_relative(a, 8, basereg, basep.memory() as u64);

        let offsreg = indp.select_ireg(TEMP_REG3);
        be.mov_reg_param(a, 4, offsreg, &indp);

        // the scale has to match the access size to fold into the load
        let mem = if u32::from(scale) == u32::from(size_log) {
            Mem::RegShift(basereg, offsreg, scale as u32)
        } else if scale != 0 {
            let shift = scale as u32;
            a64!(a ; add X(basereg), X(basereg), X(offsreg), LSL shift);
            Mem::Scaled(basereg, 0)
        } else {
            Mem::RegOff(basereg, offsreg)
        };

        match size_log {
            0 => emit_mem_op(a, MemOp::Ldrb, dstreg, mem),
            1 => emit_mem_op(a, MemOp::Ldrh, dstreg, mem),
            2 => emit_mem_op(a, MemOp::LdrW, dstreg, mem),
            _ => emit_mem_op(a, MemOp::LdrX, dstreg, mem),
        }
    }

    be.mov_param_reg(a, inst.size, &dstp, dstreg);
}

fn op_loads(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let basep = be.be_param(inst.param(1), PTYPE_M);
    let indp = be.be_param(inst.param(2), PTYPE_MRI);
    let (size_log, scale) = size_scale(inst.param(3));

    let basereg = TEMP_REG1;
    let dstreg = dstp.select_ireg(TEMP_REG2);

    let offset = if indp.is_immediate() {
        (indp.immediate() as i64) << scale
    } else {
        0
    };
    if indp.is_immediate() && offset >= 0 && is_valid_immediate(offset as u64, 15) {
        let ptr = unsafe { basep.memory().offset(offset as isize) };
        match size_log {
            0 => be.emit_ldrsb_mem(a, dstreg, ptr),
            1 => be.emit_ldrsh_mem(a, dstreg, ptr),
            2 => be.emit_ldrsw_mem(a, dstreg, ptr),
            _ => be.emit_ldr_mem(a, 8, dstreg, ptr),
        }
    } else {
        be.get_imm_relative(a, 8, basereg, basep.memory() as u64);

        let offsreg = indp.select_ireg(TEMP_REG3);
        be.mov_reg_param(a, 4, offsreg, &indp);

        let mem = if u32::from(scale) == u32::from(size_log) {
            Mem::RegShift(basereg, offsreg, scale as u32)
        } else if scale != 0 {
            let shift = scale as u32;
            a64!(a ; add X(basereg), X(basereg), X(offsreg), LSL shift);
            Mem::Scaled(basereg, 0)
        } else {
            Mem::RegOff(basereg, offsreg)
        };

        match size_log {
            0 => emit_mem_op(a, MemOp::Ldrsb, dstreg, mem),
            1 => emit_mem_op(a, MemOp::Ldrsh, dstreg, mem),
            2 if inst.size == 8 => emit_mem_op(a, MemOp::Ldrsw, dstreg, mem),
            2 => emit_mem_op(a, MemOp::LdrW, dstreg, mem),
            _ => emit_mem_op(a, MemOp::LdrX, dstreg, mem),
        }
    }

    be.mov_param_reg(a, inst.size, &dstp, dstreg);
}

fn op_store(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let basep = be.be_param(inst.param(0), PTYPE_M);
    let indp = be.be_param(inst.param(1), PTYPE_MRI);
    let srcp = be.be_param(inst.param(2), PTYPE_MRI);
    let (size_log, scale) = size_scale(inst.param(3));

    let basereg = TEMP_REG1;

    let offset = if indp.is_immediate() {
        (indp.immediate() as i64) << scale
    } else {
        0
    };
    if indp.is_immediate() && offset >= 0 && is_valid_immediate(offset as u64, 15) {
        let srcreg = srcp.select_ireg(TEMP_REG2);
        be.mov_reg_param(a, inst.size, srcreg, &srcp);

        let ptr = unsafe { basep.memory().offset(offset as isize) };
        match size_log {
            0 => be.emit_strb_mem(a, srcreg, ptr),
            1 => be.emit_strh_mem(a, srcreg, ptr),
            2 => be.emit_str_mem(a, 4, srcreg, ptr),
            _ => be.emit_str_mem(a, 8, srcreg, ptr),
        }
    } else {
        be.get_imm_relative(a, 8, basereg, basep.memory() as u64);

        let srcreg = srcp.select_ireg(TEMP_REG2);
        let offsreg = indp.select_ireg(TEMP_REG3);

        be.mov_reg_param(a, inst.size, srcreg, &srcp);
        be.mov_reg_param(a, 4, offsreg, &indp);

        let mem = if u32::from(scale) == u32::from(size_log) {
            Mem::RegShift(basereg, offsreg, scale as u32)
        } else if scale != 0 {
            let shift = scale as u32;
            a64!(a ; add X(basereg), X(basereg), X(offsreg), LSL shift);
            Mem::Scaled(basereg, 0)
        } else {
            Mem::RegOff(basereg, offsreg)
        };

        match size_log {
            0 => emit_mem_op(a, MemOp::Strb, srcreg, mem),
            1 => emit_mem_op(a, MemOp::Strh, srcreg, mem),
            2 => emit_mem_op(a, MemOp::StrW, srcreg, mem),
            _ => emit_mem_op(a, MemOp::StrX, srcreg, mem),
        }
    }
}

fn op_read(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let addrp = be.be_param(inst.param(1), PTYPE_MRI);
    let (size_log, space) = size_space(inst.param(2));

    let acc = &be.accessors[space as usize];
    let fast = acc
        .specific
        .filter(|s| s.read.is_present() && (1u32 << size_log) == u32::from(s.native_bytes));

    if let Some(spec) = fast {
        be.emit_memaccess_setup(a, &addrp, acc, &spec, &spec.read);
        emit_mov_imm(a, 8, REG_PARAM3, make_bitmask(u32::from(spec.native_bytes) * 8));
        be.call_arm_addr(a, spec.read.function as u64);
    } else {
        let resolved = acc.resolved.read[size_log as usize];
        be.mov_reg_param(a, 4, REG_PARAM2, &addrp);
        be.get_imm_relative(a, 8, REG_PARAM1, resolved.obj as u64);
        be.call_arm_addr(a, resolved.func as usize as u64);
    }

    be.mov_param_reg(a, inst.size, &dstp, REG_PARAM1);
}

fn op_readm(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let addrp = be.be_param(inst.param(1), PTYPE_MRI);
    let maskp = be.be_param(inst.param(2), PTYPE_MRI);
    let (size_log, space) = size_space(inst.param(3));

    let acc = &be.accessors[space as usize];
    let fast = acc
        .specific
        .filter(|s| s.read.is_present() && (1u32 << size_log) == u32::from(s.native_bytes));

    if let Some(spec) = fast {
        be.emit_memaccess_setup(a, &addrp, acc, &spec, &spec.read);
        be.mov_reg_param(a, inst.size, REG_PARAM3, &maskp);
        be.call_arm_addr(a, spec.read.function as u64);
    } else {
        let resolved = acc.resolved.read_masked[size_log as usize];
        be.mov_reg_param(a, 4, REG_PARAM2, &addrp);
        be.mov_reg_param(a, inst.size, REG_PARAM3, &maskp);
        be.get_imm_relative(a, 8, REG_PARAM1, resolved.obj as u64);
        be.call_arm_addr(a, resolved.func as usize as u64);
    }

    be.mov_param_reg(a, inst.size, &dstp, REG_PARAM1);
}

fn op_write(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;

    let addrp = be.be_param(inst.param(0), PTYPE_MRI);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);
    let (size_log, space) = size_space(inst.param(2));

    let acc = &be.accessors[space as usize];
    let have_specific = acc.specific.map_or(false, |s| s.write.is_present());
    let native_bytes = acc.specific.map_or(0, |s| u32::from(s.native_bytes));

    if have_specific && (1u32 << size_log) == native_bytes {
        let spec = acc.specific.unwrap();
        be.emit_memaccess_setup(a, &addrp, acc, &spec, &spec.write);
        be.mov_reg_param(a, inst.size, REG_PARAM3, &srcp);
        emit_mov_imm(a, 8, REG_PARAM4, make_bitmask(native_bytes * 8));
        be.call_arm_addr(a, spec.write.function as u64);
    } else if have_specific && (1u32 << size_log) < native_bytes {
        be.mov_reg_param(a, inst.size, REG_PARAM3, &srcp);
        emit_mov_imm(a, 8, REG_PARAM4, make_bitmask(8u32 << size_log));
        be.emit_narrow_memwrite(a, &addrp, size_log, acc);
    } else {
        let resolved = acc.resolved.write[size_log as usize];
        be.mov_reg_param(a, 4, REG_PARAM2, &addrp);
        be.mov_reg_param(a, inst.size, REG_PARAM3, &srcp);
        be.get_imm_relative(a, 8, REG_PARAM1, resolved.obj as u64);
        be.call_arm_addr(a, resolved.func as usize as u64);
    }
}

fn op_writem(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;

    let addrp = be.be_param(inst.param(0), PTYPE_MRI);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);
    let maskp = be.be_param(inst.param(2), PTYPE_MRI);
    let (size_log, space) = size_space(inst.param(3));

    let acc = &be.accessors[space as usize];
    let have_specific = acc.specific.map_or(false, |s| s.write.is_present());
    let native_bytes = acc.specific.map_or(0, |s| u32::from(s.native_bytes));

    if have_specific && (1u32 << size_log) == native_bytes {
        let spec = acc.specific.unwrap();
        be.emit_memaccess_setup(a, &addrp, acc, &spec, &spec.write);
        be.mov_reg_param(a, inst.size, REG_PARAM3, &srcp);
        be.mov_reg_param(a, inst.size, REG_PARAM4, &maskp);
        be.call_arm_addr(a, spec.write.function as u64);
    } else if have_specific && (1u32 << size_log) < native_bytes {
        be.mov_reg_param(a, inst.size, REG_PARAM3, &srcp);
        be.mov_reg_param(a, inst.size, REG_PARAM4, &maskp);
        be.emit_narrow_memwrite(a, &addrp, size_log, acc);
    } else {
        let resolved = acc.resolved.write_masked[size_log as usize];
        be.mov_reg_param(a, 4, REG_PARAM2, &addrp);
        be.mov_reg_param(a, inst.size, REG_PARAM3, &srcp);
        be.mov_reg_param(a, inst.size, REG_PARAM4, &maskp);
        be.get_imm_relative(a, 8, REG_PARAM1, resolved.obj as u64);
        be.call_arm_addr(a, resolved.func as usize as u64);
    }
}

// ---------------------------------------------------------------------------
// moves, conditions, bit fields

fn op_carry(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C);

    be.carry_state = CarryState::Poison;

    let srcp = be.be_param(inst.param(0), PTYPE_MRI);
    let bitp = be.be_param(inst.param(1), PTYPE_MRI);
    let bits = u64::from(inst.size) * 8;

    let src = srcp.select_ireg(TEMP_REG1);

    if srcp.is_immediate() && bitp.is_immediate() {
        let bit = (srcp.immediate() >> (bitp.immediate() % bits)) & 1;
        emit_mov_imm(a, inst.size, FUNC_SCRATCH_REG, bit);
        be.store_carry_reg(a, FUNC_SCRATCH_REG);
    } else if bitp.is_immediate() {
        let shift = (bitp.immediate() % bits) as u32;

        be.mov_reg_param(a, inst.size, src, &srcp);

        if shift != 0 {
            emit_lsr_imm(a, inst.size, FUNC_SCRATCH_REG, src, shift);
            be.store_carry_reg(a, FUNC_SCRATCH_REG);
        } else {
            be.store_carry_reg(a, src);
        }
    } else {
        let shift = bitp.select_ireg(TEMP_REG2);

        be.mov_reg_param(a, inst.size, src, &srcp);
        be.mov_reg_param(a, inst.size, shift, &bitp);

        emit_logical_imm(a, inst.size, LogicalOp::And, FUNC_SCRATCH_REG, shift, bits - 1);
        emit_shift_rr(a, inst.size, ShiftKind::Lsr, FUNC_SCRATCH_REG, src, FUNC_SCRATCH_REG);
        be.store_carry_reg(a, FUNC_SCRATCH_REG);
    }
}

fn op_set(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);

    if inst.cond == Cond::Always {
        be.mov_param_imm(a, inst.size, &dstp, 1);
        return;
    }

    let dst = dstp.select_ireg(TEMP_REG1);

    match inst.cond {
        Cond::U | Cond::Nu => {
            be.get_unordered(a, dst);
            if inst.cond == Cond::Nu {
                emit_logical_imm(a, 8, LogicalOp::Eor, dst, dst, 1);
            }
        }
        Cond::C | Cond::Nc => match be.carry_state {
            CarryState::Canonical => emit_cset(a, 8, Backend::host_cond(inst.cond).negate(), dst),
            CarryState::Logical => emit_cset(a, 8, Backend::host_cond(inst.cond), dst),
            CarryState::Poison => be.get_carry(a, dst, inst.cond == Cond::Nc),
        },
        Cond::A | Cond::Be => {
            be.load_carry(a, true);
            emit_cset(a, 8, Backend::host_cond(inst.cond), dst);
        }
        _ => emit_cset(a, 8, Backend::host_cond(inst.cond), dst),
    }

    be.mov_param_reg(a, inst.size, &dstp, dst);
}

fn op_mov(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);

    // a conditional select avoids a branch when both sides live in host
    // registers and the condition maps onto NZCV with known carry polarity
    let mut usesel = dstp.is_int_reg() && srcp.is_int_reg() && inst.size == 8;
    match inst.cond {
        Cond::Always | Cond::U | Cond::Nu => usesel = false,
        Cond::C | Cond::Nc => {
            if be.carry_state == CarryState::Poison {
                usesel = false;
            }
        }
        _ => {}
    }

    if usesel {
        let dst = dstp.select_ireg(TEMP_REG1);
        let src = srcp.select_ireg(TEMP_REG2);

        match inst.cond {
            Cond::C | Cond::Nc => {
                if be.carry_state == CarryState::Canonical {
                    emit_csel(a, Backend::host_cond(inst.cond).negate(), dst, src, dst);
                } else {
                    emit_csel(a, Backend::host_cond(inst.cond), dst, src, dst);
                }
            }
            Cond::A | Cond::Be => {
                be.load_carry(a, true);
                emit_csel(a, Backend::host_cond(inst.cond), dst, src, dst);
            }
            _ => emit_csel(a, Backend::host_cond(inst.cond), dst, src, dst),
        }
    } else {
        let skip = be.emit_skip(a, inst.cond);
        be.mov_param_param(a, inst.size, &dstp, &srcp);
        bind_skip(a, skip);
    }
}

fn op_sext(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::S | FlagSet::Z);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);
    let size_log = size_only(inst.param(2));

    let dstreg = dstp.select_ireg(TEMP_REG2);

    if (1u32 << size_log) >= inst.size {
        if inst.flags.is_empty() {
            be.mov_param_param(a, inst.size, &dstp, &srcp);
        } else {
            be.mov_reg_param(a, inst.size, dstreg, &srcp);
            be.mov_param_reg(a, inst.size, &dstp, dstreg);
        }
    } else {
        if srcp.is_memory() {
            match size_log {
                0 => be.emit_ldrsb_mem(a, dstreg, srcp.memory()),
                1 => be.emit_ldrsh_mem(a, dstreg, srcp.memory()),
                2 => be.emit_ldrsw_mem(a, dstreg, srcp.memory()),
                _ => be.emit_ldr_mem(a, 8, dstreg, srcp.memory()),
            }
        } else {
            let tempreg = srcp.select_ireg(dstreg);
            be.mov_reg_param(a, inst.size, tempreg, &srcp);
            emit_sext(a, size_log, dstreg, tempreg);
        }

        be.mov_param_reg(a, inst.size, &dstp, dstreg);
    }

    if !inst.flags.is_empty() {
        emit_tst_rr(a, inst.size, dstreg, dstreg);
        be.carry_state = CarryState::Poison;
    }
}

fn op_roland(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::S | FlagSet::Z);

    let size = inst.size;
    let instbits = u64::from(size) * 8;
    let flags = !inst.flags.is_empty();

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);
    let shiftp = be.be_param(inst.param(2), PTYPE_MRI);
    let maskp = be.be_param(inst.param(3), PTYPE_MRI);

    let output = dstp.select_ireg(TEMP_REG1);

    if maskp.is_immediate_value(0) {
        // a zero mask always produces zero
        be.mov_param_reg(a, size, &dstp, ZR);
        if flags {
            emit_tst_rr(a, size, ZR, ZR);
            be.carry_state = CarryState::Poison;
        }
        return;
    }

    let mut optimized = false;
    if srcp.is_immediate() && shiftp.is_immediate() && maskp.is_immediate() {
        // constant fold
        let result = rotl_sized(srcp.immediate(), shiftp.immediate(), size) & maskp.immediate();
        be.get_imm_relative(a, size, output, if size == 4 { result as u32 as u64 } else { result });
        optimized = true;
    } else if maskp.is_immediate()
        && shiftp.is_immediate()
        && !maskp.is_immediate_value(make_bitmask(instbits as u32))
    {
        let mask = maskp.immediate();
        let pop = mask.count_ones();
        let lz = mask.leading_zeros() & (instbits as u32 - 1);
        let invlamask = !(mask << lz) & make_bitmask(instbits as u32);
        let is_right_aligned = mask & (mask.wrapping_add(1)) == 0;
        let is_contiguous = invlamask & (invlamask.wrapping_add(1)) == 0;
        let s = (shiftp.immediate() & (instbits - 1)) as u32;

        if is_right_aligned || is_contiguous {
            be.mov_reg_param(a, size, output, &srcp);
            optimized = true;
        }

        if is_right_aligned {
            // mask extracts a right-aligned field after the rotate
            let s2 = (instbits as u32 - s) & (instbits as u32 - 1);
            if s >= pop {
                emit_ubfx(a, size, output, output, s2, pop);
            } else {
                if s2 > 0 {
                    emit_shift_imm(a, size, ShiftKind::Ror, output, output, s2);
                }
                emit_logical_imm(a, size, LogicalOp::And, output, output, make_bitmask(pop));
            }
        } else if is_contiguous {
            // mask extracts a contiguous field; position it with ubfiz
            let rot = (s + pop + lz).wrapping_neg() & (instbits as u32 - 1);
            if rot > 0 {
                emit_shift_imm(a, size, ShiftKind::Ror, output, output, rot);
            }
            emit_ubfiz(a, size, output, output, instbits as u32 - pop - lz, pop);
        }
    }

    if !optimized {
        be.mov_reg_param(a, size, output, &srcp);

        if shiftp.is_immediate() {
            let s = (shiftp.immediate() as i64).wrapping_neg() as u64 & (instbits - 1);
            if s != 0 {
                emit_shift_imm(a, size, ShiftKind::Ror, output, output, s as u32);
            }
        } else {
            let shift = shiftp.select_ireg(TEMP_REG2);
            be.mov_reg_param(a, size, shift, &shiftp);

            emit_logical_imm(a, size, LogicalOp::And, FUNC_SCRATCH_REG, shift, instbits - 1);
            emit_mov_imm(a, size, SCRATCH_REG2, instbits);
            emit_alu_rr(a, size, AluOp::Sub, FUNC_SCRATCH_REG, SCRATCH_REG2, FUNC_SCRATCH_REG);
            emit_shift_rr(a, size, ShiftKind::Ror, output, output, FUNC_SCRATCH_REG);
        }

        let maskop = if flags { LogicalOp::Ands } else { LogicalOp::And };
        if maskp.is_immediate() && is_valid_immediate_mask(maskp.immediate(), size) {
            emit_logical_imm(a, size, maskop, output, output, maskp.immediate());
        } else if !maskp.is_immediate() || maskp.immediate() != make_bitmask(instbits as u32) {
            let mask = maskp.select_ireg(TEMP_REG2);
            be.mov_reg_param(a, size, mask, &maskp);
            emit_alu_rr(a, size, if flags { AluOp::Ands } else { AluOp::And }, output, output, mask);
        } else {
            // all-ones mask leaves the rotate result; flags need an explicit test
            optimized = true;
        }
    }

    be.mov_param_reg(a, size, &dstp, output);

    if flags {
        if optimized {
            emit_tst_rr(a, size, output, output);
        }
        be.carry_state = CarryState::Poison;
    }
}

fn op_rolins(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::S | FlagSet::Z);

    let size = inst.size;
    let instbits = u64::from(size) * 8;
    let flags = !inst.flags.is_empty();

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);
    let shiftp = be.be_param(inst.param(2), PTYPE_MRI);
    let maskp = be.be_param(inst.param(3), PTYPE_MRI);

    if maskp.is_immediate_value(0) {
        // nothing is inserted; only the flag update can be observed
        if flags {
            let dst = dstp.select_ireg(TEMP_REG2);
            be.mov_reg_param(a, size, dst, &dstp);
            emit_tst_rr(a, size, dst, dst);
            be.carry_state = CarryState::Poison;
        }
        return;
    }

    let mut can_use_dst_reg = dstp.is_int_reg();
    if can_use_dst_reg && srcp.is_int_reg() {
        can_use_dst_reg = srcp != dstp;
    }
    if can_use_dst_reg && maskp.is_int_reg() {
        can_use_dst_reg = maskp != dstp;
    }
    if can_use_dst_reg && shiftp.is_int_reg() {
        can_use_dst_reg = shiftp != dstp;
    }

    let mut optimized = false;
    let mut dst = dstp.select_ireg(TEMP_REG2);

    if srcp.is_immediate()
        && shiftp.is_immediate()
        && maskp.is_immediate_value(make_bitmask(instbits as u32))
    {
        // the rotate overwrites the whole destination; constant fold it
        let result = rotl_sized(srcp.immediate(), shiftp.immediate(), size);
        be.get_imm_relative(a, size, dst, result);
        optimized = true;
    } else if shiftp.is_immediate() && maskp.is_immediate_value(make_bitmask(instbits as u32)) {
        be.mov_reg_param(a, size, dst, &srcp);
        let shift = (shiftp.immediate() as i64).wrapping_neg() as u64 & (instbits - 1);
        if shift != 0 {
            emit_shift_imm(a, size, ShiftKind::Ror, dst, dst, shift as u32);
        }
        optimized = true;
    } else if maskp.is_immediate() && shiftp.is_immediate() {
        let mask = maskp.immediate();
        let pop = mask.count_ones();
        let lz = mask.leading_zeros() & (instbits as u32 - 1);
        let invlamask = !(mask << lz) & make_bitmask(instbits as u32);
        let is_right_aligned = mask & (mask.wrapping_add(1)) == 0;
        let is_contiguous = invlamask & (invlamask.wrapping_add(1)) == 0;
        let s = (shiftp.immediate() & (instbits - 1)) as u32;

        if is_right_aligned || is_contiguous {
            dst = if can_use_dst_reg {
                dstp.select_ireg(SCRATCH_REG1)
            } else {
                SCRATCH_REG1
            };
            be.mov_reg_param(a, size, dst, &dstp);

            let (rot, lsb) = if is_right_aligned {
                ((instbits as u32 - s) & (instbits as u32 - 1), 0)
            } else {
                (
                    (s + pop + lz).wrapping_neg() & (instbits as u32 - 1),
                    instbits as u32 - pop - lz,
                )
            };

            let src = SCRATCH_REG2;
            if srcp.is_immediate() && rot > 0 {
                // fold the rotate into the constant
                let result = rotr_sized(srcp.immediate(), u64::from(rot), size);
                be.get_imm_relative(a, size, src, result);
            } else {
                be.mov_reg_param(a, size, src, &srcp);
                if rot > 0 {
                    emit_shift_imm(a, size, ShiftKind::Ror, src, src, rot);
                }
            }

            emit_bfi(a, size, dst, src, lsb, pop);
            optimized = true;
        } else if srcp.is_immediate() {
            dst = dstp.select_ireg(TEMP_REG2);
            be.mov_reg_param(a, size, dst, &dstp);

            // clear the mask bits, then OR in the folded rotate
            let notmask = !mask & make_bitmask(instbits as u32);
            if is_valid_immediate_mask(notmask, size) {
                emit_logical_imm(a, size, LogicalOp::And, dst, dst, notmask);
            } else {
                be.get_imm_relative(a, size, SCRATCH_REG1, notmask);
                emit_alu_rr(a, size, AluOp::And, dst, dst, SCRATCH_REG1);
            }

            let result = rotl_sized(srcp.immediate(), u64::from(s), size) & mask;
            if result != 0 {
                if is_valid_immediate_mask(result, size) {
                    emit_logical_imm(a, size, LogicalOp::Orr, dst, dst, result);
                } else {
                    be.get_imm_relative(a, size, SCRATCH_REG1, result);
                    emit_alu_rr(a, size, AluOp::Orr, dst, dst, SCRATCH_REG1);
                }
            }
            optimized = true;
        }
    }

    if !optimized {
        dst = if can_use_dst_reg {
            dstp.select_ireg(TEMP_REG2)
        } else {
            TEMP_REG2
        };
        be.mov_reg_param(a, size, dst, &dstp);

        let src = srcp.select_ireg(TEMP_REG1);
        be.mov_reg_param(a, size, src, &srcp);

        if shiftp.is_immediate() {
            let shift = (shiftp.immediate() as i64).wrapping_neg() as u64 & (instbits - 1);
            if shift != 0 {
                emit_shift_imm(a, size, ShiftKind::Ror, SCRATCH_REG1, src, shift as u32);
            } else {
                emit_mov_rr(a, size, SCRATCH_REG1, src);
            }
        } else {
            let shift = shiftp.select_ireg(SCRATCH_REG2);
            be.mov_reg_param(a, size, shift, &shiftp);

            emit_mov_imm(a, size, SCRATCH_REG1, instbits);
            emit_logical_imm(a, size, LogicalOp::And, FUNC_SCRATCH_REG, shift, instbits - 1);
            emit_alu_rr(a, size, AluOp::Sub, FUNC_SCRATCH_REG, SCRATCH_REG1, FUNC_SCRATCH_REG);
            emit_shift_rr(a, size, ShiftKind::Ror, SCRATCH_REG1, src, FUNC_SCRATCH_REG);
        }

        let mask = maskp.select_ireg(SCRATCH_REG2);
        be.mov_reg_param(a, size, mask, &maskp);

        emit_alu_rr(a, size, AluOp::Bic, dst, dst, mask);
        emit_alu_rr(a, size, AluOp::And, SCRATCH_REG1, SCRATCH_REG1, mask);
        emit_alu_rr(a, size, AluOp::Orr, dst, dst, SCRATCH_REG1);
    }

    be.mov_param_reg(a, size, &dstp, dst);

    if flags {
        emit_tst_rr(a, size, dst, dst);
        be.carry_state = CarryState::Poison;
    }
}

// ---------------------------------------------------------------------------
// arithmetic

fn add_common(be: &mut Backend, a: &mut Asm, inst: &Inst, carry_in: bool) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::V | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let flags = !inst.flags.is_empty();
    let op = match (carry_in, flags) {
        (true, true) => AluOp::Adcs,
        (true, false) => AluOp::Adc,
        (false, true) => AluOp::Adds,
        (false, false) => AluOp::Add,
    };

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let src2p = be.be_param(inst.param(2), PTYPE_MRI);

    let output = dstp.select_ireg(TEMP_REG3);

    if carry_in {
        be.load_carry(a, false);
    }

    if src1p.is_immediate_value(0) {
        if src2p.is_immediate_value(0) {
            if carry_in {
                emit_alu_rr(a, size, op, output, ZR, ZR);
                be.mov_param_reg(a, size, &dstp, output);
            } else {
                be.mov_param_reg(a, size, &dstp, ZR);
                emit_alu_rr(a, size, op, ZR, ZR, ZR);
            }
        } else if !carry_in && src2p.is_immediate() && is_valid_immediate_addsub(src2p.immediate()) {
            let imm_op = if flags { AluOp::Adds } else { AluOp::Add };
            emit_mov_rr(a, size, output, ZR);
            emit_addsub_imm(a, size, imm_op, output, output, src2p.immediate(), SCRATCH_REG2);
            be.mov_param_reg(a, size, &dstp, output);
        } else if !carry_in && src2p.is_immediate() && is_valid_immediate(src2p.immediate(), 24) {
            let imm_op = if flags { AluOp::Adds } else { AluOp::Add };
            emit_mov_imm(a, size, output, src2p.immediate() & 0xfff);
            emit_addsub_imm(a, size, imm_op, output, output, src2p.immediate() & (0xfff << 12), SCRATCH_REG2);
            be.mov_param_reg(a, size, &dstp, output);
        } else {
            let src = src2p.select_ireg(output);
            be.mov_reg_param(a, size, src, &src2p);
            emit_alu_rr(a, size, op, output, src, ZR);
            be.mov_param_reg(a, size, &dstp, output);
        }
    } else if src2p.is_immediate_value(0) {
        if !carry_in && src1p.is_immediate() && is_valid_immediate_addsub(src1p.immediate()) {
            let imm_op = if flags { AluOp::Adds } else { AluOp::Add };
            emit_mov_rr(a, size, output, ZR);
            emit_addsub_imm(a, size, imm_op, output, output, src1p.immediate(), SCRATCH_REG2);
            be.mov_param_reg(a, size, &dstp, output);
        } else if !carry_in && src1p.is_immediate() && is_valid_immediate(src1p.immediate(), 24) {
            let imm_op = if flags { AluOp::Adds } else { AluOp::Add };
            emit_mov_imm(a, size, output, src1p.immediate() & 0xfff);
            emit_addsub_imm(a, size, imm_op, output, output, src1p.immediate() & (0xfff << 12), SCRATCH_REG2);
            be.mov_param_reg(a, size, &dstp, output);
        } else {
            let src = src1p.select_ireg(output);
            be.mov_reg_param(a, size, src, &src1p);
            emit_alu_rr(a, size, op, output, src, ZR);
            be.mov_param_reg(a, size, &dstp, output);
        }
    } else if !carry_in && src1p.is_immediate() && is_valid_immediate_addsub(src1p.immediate()) {
        let imm_op = if flags { AluOp::Adds } else { AluOp::Add };
        let src = src2p.select_ireg(output);
        be.mov_reg_param(a, size, src, &src2p);
        emit_addsub_imm(a, size, imm_op, output, src, src1p.immediate(), SCRATCH_REG2);
        be.mov_param_reg(a, size, &dstp, output);
    } else if !carry_in && src2p.is_immediate() && is_valid_immediate_addsub(src2p.immediate()) {
        let imm_op = if flags { AluOp::Adds } else { AluOp::Add };
        let src = src1p.select_ireg(output);
        be.mov_reg_param(a, size, src, &src1p);
        emit_addsub_imm(a, size, imm_op, output, src, src2p.immediate(), SCRATCH_REG2);
        be.mov_param_reg(a, size, &dstp, output);
    } else if !carry_in && !flags && src1p.is_immediate() && is_valid_immediate(src1p.immediate(), 24) {
        let src = src2p.select_ireg(output);
        be.mov_reg_param(a, size, src, &src2p);
        emit_addsub_imm(a, size, AluOp::Add, output, src, src1p.immediate() & 0xfff, SCRATCH_REG2);
        emit_addsub_imm(a, size, AluOp::Add, output, output, src1p.immediate() & (0xfff << 12), SCRATCH_REG2);
        be.mov_param_reg(a, size, &dstp, output);
    } else if !carry_in && !flags && src2p.is_immediate() && is_valid_immediate(src2p.immediate(), 24) {
        let src = src1p.select_ireg(output);
        be.mov_reg_param(a, size, src, &src1p);
        emit_addsub_imm(a, size, AluOp::Add, output, src, src2p.immediate() & 0xfff, SCRATCH_REG2);
        emit_addsub_imm(a, size, AluOp::Add, output, output, src2p.immediate() & (0xfff << 12), SCRATCH_REG2);
        be.mov_param_reg(a, size, &dstp, output);
    } else {
        let src1 = src1p.select_ireg(TEMP_REG1);
        let src2 = src2p.select_ireg(TEMP_REG2);

        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);
        emit_alu_rr(a, size, op, output, src1, src2);
        be.mov_param_reg(a, size, &dstp, output);
    }

    if flags {
        be.store_carry(a, false);
    }
}

fn op_add(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    add_common(be, a, inst, false);
}

fn op_addc(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    add_common(be, a, inst, true);
}

fn sub_common(be: &mut Backend, a: &mut Asm, inst: &Inst, carry_in: bool) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::V | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let flags = !inst.flags.is_empty();
    let op = match (carry_in, flags) {
        (true, true) => AluOp::Sbcs,
        (true, false) => AluOp::Sbc,
        (false, true) => AluOp::Subs,
        (false, false) => AluOp::Sub,
    };

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let src2p = be.be_param(inst.param(2), PTYPE_MRI);

    if carry_in {
        be.load_carry(a, true);
    }

    let output = dstp.select_ireg(TEMP_REG3);

    if src2p.is_immediate_value(0) {
        if src1p.is_immediate_value(0) {
            if carry_in {
                emit_alu_rr(a, size, op, output, ZR, ZR);
                be.mov_param_reg(a, size, &dstp, output);
            } else {
                be.mov_param_reg(a, size, &dstp, ZR);
                emit_alu_rr(a, size, op, ZR, ZR, ZR);
            }
        } else {
            let src = src1p.select_ireg(output);
            be.mov_reg_param(a, size, src, &src1p);
            if carry_in {
                emit_alu_rr(a, size, op, output, src, ZR);
                be.mov_param_reg(a, size, &dstp, output);
            } else {
                be.mov_param_reg(a, size, &dstp, src);
                emit_alu_rr(a, size, op, ZR, src, ZR);
            }
        }
    } else if !carry_in && src2p.is_immediate() && is_valid_immediate_addsub(src2p.immediate()) {
        let imm_op = if flags { AluOp::Subs } else { AluOp::Sub };
        let src = src1p.select_ireg(output);
        be.mov_reg_param(a, size, src, &src1p);
        emit_addsub_imm(a, size, imm_op, output, src, src2p.immediate(), SCRATCH_REG2);
        be.mov_param_reg(a, size, &dstp, output);
    } else if !carry_in
        && (!flags || src1p.is_immediate_value(0))
        && src2p.is_immediate()
        && is_valid_immediate(src2p.immediate(), 24)
    {
        let imm_op = if flags { AluOp::Subs } else { AluOp::Sub };
        let src = src1p.select_ireg(output);
        be.mov_reg_param(a, size, src, &src1p);
        emit_addsub_imm(a, size, AluOp::Sub, output, src, src2p.immediate() & 0xfff, SCRATCH_REG2);
        emit_addsub_imm(a, size, imm_op, output, output, src2p.immediate() & (0xfff << 12), SCRATCH_REG2);
        be.mov_param_reg(a, size, &dstp, output);
    } else {
        let src1 = src1p.select_ireg(TEMP_REG1);
        let src2 = src2p.select_ireg(TEMP_REG2);

        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);
        emit_alu_rr(a, size, op, output, src1, src2);
        be.mov_param_reg(a, size, &dstp, output);
    }

    if flags {
        be.store_carry(a, true);
    }
}

fn op_sub(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    sub_common(be, a, inst, false);
}

fn op_subb(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    sub_common(be, a, inst, true);
}

fn op_cmp(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::V | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let src1p = be.be_param(inst.param(0), PTYPE_MRI);
    let src2p = be.be_param(inst.param(1), PTYPE_MRI);

    let src1 = src1p.select_ireg(TEMP_REG1);
    be.mov_reg_param(a, size, src1, &src1p);

    if src2p.is_immediate() && is_valid_immediate_addsub(src2p.immediate()) {
        if src2p.is_immediate_value(0) {
            emit_cmp_rr(a, size, src1, ZR);
        } else {
            emit_cmp_imm(a, size, src1, src2p.immediate(), SCRATCH_REG2);
        }
    } else {
        let src2 = src2p.select_ireg(TEMP_REG2);
        be.mov_reg_param(a, size, src2, &src2p);
        emit_cmp_rr(a, size, src1, src2);
    }

    be.store_carry(a, true);
}

fn mul_flags_wide(be: &mut Backend, a: &mut Asm, inst: &Inst, lo: u32, hi: u32, signed: bool) {
    // Z = (lo == 0 && hi == 0), V = high half not the sign extension of the
    // low half, S = top bit of the high half
    emit_mrs_nzcv(a, SCRATCH_REG1);

    emit_tst_rr(a, 8, lo, lo);
    emit_cset(a, 8, HostCond::Eq, TEMP_REG1);
    emit_tst_rr(a, 8, hi, hi);
    emit_cset(a, 8, HostCond::Eq, SCRATCH_REG2);
    emit_alu_rr(a, 8, AluOp::And, TEMP_REG1, TEMP_REG1, SCRATCH_REG2);
    emit_bfi(a, 8, SCRATCH_REG1, TEMP_REG1, 30, 1); // zero flag

    if signed {
        if inst.size == 4 {
            emit_sext(a, 2, TEMP_REG1, lo);
            emit_cmp_rr(a, 8, TEMP_REG1, lo);
        } else {
            emit_shift_imm(a, 8, ShiftKind::Asr, TEMP_REG1, lo, 63);
            emit_cmp_rr(a, 8, TEMP_REG1, hi);
        }
        emit_cset(a, 8, HostCond::Ne, TEMP_REG1);
    } else {
        emit_tst_rr(a, 8, hi, hi);
        emit_cset(a, 8, HostCond::Ne, TEMP_REG1);
    }
    emit_bfi(a, 8, SCRATCH_REG1, TEMP_REG1, 28, 1); // overflow flag

    emit_lsr_imm(a, 8, TEMP_REG1, hi, inst.size * 8 - 1);
    emit_bfi(a, 8, SCRATCH_REG1, TEMP_REG1, 31, 1); // sign flag

    emit_msr_nzcv(a, SCRATCH_REG1);

    be.carry_state = CarryState::Poison;
}

fn mul_common(be: &mut Backend, a: &mut Asm, inst: &Inst, signed: bool) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::V | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let edstp = be.be_param(inst.param(1), PTYPE_MR);
    let src1p = be.be_param(inst.param(2), PTYPE_MRI);
    let src2p = be.be_param(inst.param(3), PTYPE_MRI);
    let compute_hi = dstp != edstp;

    let src1 = src1p.select_ireg(TEMP_REG1);
    let src2 = src2p.select_ireg(TEMP_REG2);
    let lo = TEMP_REG3;
    let hi = TEMP_REG2;

    if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
        emit_mov_rr(a, 8, lo, ZR);
        emit_mov_rr(a, 8, hi, ZR);
    } else {
        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);

        if size == 8 {
            emit_mul(a, 8, lo, src1, src2);
            if signed {
                emit_smulh(a, hi, src1, src2);
            } else {
                emit_umulh(a, hi, src1, src2);
            }
        } else {
            if signed {
                emit_smull(a, lo, src1, src2);
            } else {
                emit_umull(a, lo, src1, src2);
            }
            emit_lsr_imm(a, 8, hi, lo, 32);
        }
    }

    be.mov_param_reg(a, size, &dstp, lo);
    if compute_hi {
        be.mov_param_reg(a, size, &edstp, hi);
    }

    if !inst.flags.is_empty() {
        mul_flags_wide(be, a, inst, lo, hi, signed);
    }
}

fn op_mulu(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    mul_common(be, a, inst, false);
}

fn op_muls(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    mul_common(be, a, inst, true);
}

fn mul_lw_common(be: &mut Backend, a: &mut Asm, inst: &Inst, signed: bool) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::V | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let flags = !inst.flags.is_empty();
    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let src2p = be.be_param(inst.param(2), PTYPE_MRI);

    let src1 = src1p.select_ireg(TEMP_REG1);
    let src2 = src2p.select_ireg(TEMP_REG2);
    let lo = TEMP_REG3;
    let hi = TEMP_REG2;

    if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
        emit_mov_rr(a, 8, lo, ZR);
        if flags && (size == 8 || !signed) {
            emit_mov_rr(a, 8, hi, ZR);
        }
    } else {
        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);

        if size == 8 {
            emit_mul(a, 8, lo, src1, src2);
            if flags {
                if signed {
                    emit_smulh(a, hi, src1, src2);
                } else {
                    emit_umulh(a, hi, src1, src2);
                }
            }
        } else {
            if signed {
                emit_smull(a, lo, src1, src2);
            } else {
                emit_umull(a, lo, src1, src2);
            }
            if flags && !signed {
                emit_lsr_imm(a, 8, hi, lo, 32);
            }
        }
    }

    be.mov_param_reg(a, size, &dstp, lo);

    if flags {
        emit_mrs_nzcv(a, SCRATCH_REG1);

        emit_tst_rr(a, size, lo, lo);
        emit_cset(a, 8, HostCond::Eq, TEMP_REG1);
        emit_bfi(a, 8, SCRATCH_REG1, TEMP_REG1, 30, 1); // zero flag

        if signed {
            // overflow when the product does not fit the low word
            if size == 4 {
                emit_sext(a, 2, TEMP_REG1, lo);
                emit_cmp_rr(a, 8, TEMP_REG1, lo);
            } else {
                emit_shift_imm(a, 8, ShiftKind::Asr, TEMP_REG1, lo, 63);
                emit_cmp_rr(a, 8, TEMP_REG1, hi);
            }
            emit_cset(a, 8, HostCond::Ne, TEMP_REG1);
        } else {
            emit_cmp_imm(a, 8, hi, 0, SCRATCH_REG2);
            emit_cset(a, 8, HostCond::Ne, TEMP_REG1);
        }
        emit_bfi(a, 8, SCRATCH_REG1, TEMP_REG1, 28, 1); // overflow flag

        emit_lsr_imm(a, 8, TEMP_REG1, lo, size * 8 - 1);
        emit_bfi(a, 8, SCRATCH_REG1, TEMP_REG1, 31, 1); // sign flag

        emit_msr_nzcv(a, SCRATCH_REG1);

        be.carry_state = CarryState::Poison;
    }
}

fn op_mululw(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    mul_lw_common(be, a, inst, false);
}

fn op_mulslw(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    mul_lw_common(be, a, inst, true);
}

fn div_common(be: &mut Backend, a: &mut Asm, inst: &Inst, signed: bool) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::V | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let edstp = be.be_param(inst.param(1), PTYPE_MR);
    let src1p = be.be_param(inst.param(2), PTYPE_MRI);
    let src2p = be.be_param(inst.param(3), PTYPE_MRI);
    let compute_rem = dstp != edstp;

    if !src2p.is_immediate_value(0) {
        let skip_zero = a.new_dynamic_label();
        let skip = a.new_dynamic_label();

        be.mov_reg_param(a, size, TEMP_REG2, &src2p);
        emit_cbz(a, size, TEMP_REG2, skip_zero);

        be.mov_reg_param(a, size, TEMP_REG1, &src1p);

        if signed {
            emit_sdiv(a, size, TEMP_REG3, TEMP_REG1, TEMP_REG2);
        } else {
            emit_udiv(a, size, TEMP_REG3, TEMP_REG1, TEMP_REG2);
        }

        be.mov_param_reg(a, size, &dstp, TEMP_REG3);

        if compute_rem {
            emit_msub(a, size, TEMP_REG2, TEMP_REG3, TEMP_REG2, TEMP_REG1);
            be.mov_param_reg(a, size, &edstp, TEMP_REG2);
        }

        if !inst.flags.is_empty() {
            emit_tst_rr(a, size, TEMP_REG3, TEMP_REG3);
        }

        a64!(a ; b =>skip);

        // divide by zero only raises the overflow flag
        a64!(a ; =>skip_zero);
        emit_mov_imm(a, 8, SCRATCH_REG1, 1 << 28);
        emit_msr_nzcv(a, SCRATCH_REG1);

        a64!(a ; =>skip);
    } else {
        emit_mov_imm(a, 8, SCRATCH_REG1, 1 << 28);
        emit_msr_nzcv(a, SCRATCH_REG1);
    }

    be.carry_state = CarryState::Poison;
}

fn op_divu(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    div_common(be, a, inst, false);
}

fn op_divs(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    div_common(be, a, inst, true);
}

// ---------------------------------------------------------------------------
// bitwise

fn op_and(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let flags = !inst.flags.is_empty();
    let bits = u64::from(size) * 8;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let mut src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let mut src2p = be.be_param(inst.param(2), PTYPE_MRI);

    // keep dst == src2 forms optimal and immediates on the right
    if src1p.is_immediate() || (dstp.is_int_reg() && dstp == src2p) {
        std::mem::swap(&mut src1p, &mut src2p);
    }

    let dst = dstp.select_ireg(TEMP_REG3);
    let src1 = src1p.select_ireg(dst);

    if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
        if flags {
            // the immediate is irrelevant, the result is zero either way
            emit_logical_imm(a, size, LogicalOp::Ands, dst, ZR, 1);
        } else {
            emit_mov_rr(a, size, dst, ZR);
        }
    } else if src1p.is_immediate() && src2p.is_immediate() {
        be.get_imm_relative(a, size, dst, src1p.immediate() & src2p.immediate());
        if flags {
            emit_tst_rr(a, size, dst, dst);
        }
    } else if src2p.is_immediate() && is_valid_immediate_mask(src2p.immediate(), size) {
        be.mov_reg_param(a, size, src1, &src1p);
        emit_logical_imm(
            a,
            size,
            if flags { LogicalOp::Ands } else { LogicalOp::And },
            dst,
            src1,
            src2p.immediate(),
        );
    } else if size == 8
        && src2p.is_immediate()
        && is_valid_immediate_mask(src2p.immediate(), 4)
        && (!flags || src2p.immediate() >> 31 & 1 == 0)
    {
        // a 32-bit mask zero-extends through the W form
        be.mov_reg_param(a, size, src1, &src1p);
        emit_logical_imm(
            a,
            4,
            if flags { LogicalOp::Ands } else { LogicalOp::And },
            dst,
            src1,
            src2p.immediate(),
        );
    } else if src2p.is_immediate_value(make_bitmask(bits as u32)) || src1p == src2p {
        if dstp == src1p && !flags {
            if size == 8 || (dstp.is_memory() && !dstp.is_cold_register()) {
                return;
            }
        }

        be.mov_reg_param(a, size, src1, &src1p);

        if dst != src1 || (size == 4 && dstp == src1p && dstp.is_int_reg()) {
            emit_alu_rr(a, size, if flags { AluOp::Ands } else { AluOp::And }, dst, src1, src1);
        } else if flags {
            emit_tst_rr(a, size, dst, dst);
        }
    } else {
        let src2 = src2p.select_ireg(TEMP_REG1);
        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);

        emit_alu_rr(a, size, if flags { AluOp::Ands } else { AluOp::And }, dst, src1, src2);
    }

    be.mov_param_reg(a, size, &dstp, dst);

    if flags {
        be.carry_state = CarryState::Poison;
    }
}

fn op_test(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let bits = u64::from(size) * 8;

    let src1p = be.be_param(inst.param(0), PTYPE_MRI);
    let src2p = be.be_param(inst.param(1), PTYPE_MRI);

    let src1 = src1p.select_ireg(TEMP_REG1);
    let src2 = src2p.select_ireg(TEMP_REG2);

    if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
        emit_tst_rr(a, size, ZR, ZR);
    } else if src2p.is_immediate_value(make_bitmask(bits as u32)) {
        be.mov_reg_param(a, size, src1, &src1p);
        emit_tst_rr(a, size, src1, src1);
    } else if src1p.is_immediate_value(make_bitmask(bits as u32)) {
        be.mov_reg_param(a, size, src2, &src2p);
        emit_tst_rr(a, size, src2, src2);
    } else if src2p.is_immediate() && is_valid_immediate_mask(src2p.immediate(), size) {
        be.mov_reg_param(a, size, src1, &src1p);
        emit_logical_imm(a, size, LogicalOp::Tst, ZR, src1, src2p.immediate());
    } else if src1p.is_immediate() && is_valid_immediate_mask(src1p.immediate(), size) {
        be.mov_reg_param(a, size, src2, &src2p);
        emit_logical_imm(a, size, LogicalOp::Tst, ZR, src2, src1p.immediate());
    } else {
        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);
        emit_tst_rr(a, size, src1, src2);
    }

    be.carry_state = CarryState::Poison;
}

fn op_or(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let flags = !inst.flags.is_empty();
    let bits = u64::from(size) * 8;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let mut src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let mut src2p = be.be_param(inst.param(2), PTYPE_MRI);

    if src1p.is_immediate() || (dstp.is_int_reg() && dstp == src2p) {
        std::mem::swap(&mut src1p, &mut src2p);
    }

    let dst = dstp.select_ireg(TEMP_REG3);
    let src1 = src1p.select_ireg(dst);

    if src1p.is_immediate() && src2p.is_immediate() {
        be.get_imm_relative(a, size, dst, src1p.immediate() | src2p.immediate());
    } else if src2p.is_immediate_value(make_bitmask(bits as u32)) {
        emit_mov_imm(a, size, dst, src2p.immediate());
    } else if src2p.is_immediate_value(0) || src1p == src2p {
        if dstp == src1p && !flags {
            if size == 8 || (dstp.is_memory() && !dstp.is_cold_register()) {
                return;
            }
        }

        be.mov_reg_param(a, size, src1, &src1p);

        if dst != src1 || (size == 4 && dstp == src1p && dstp.is_int_reg()) {
            emit_mov_rr(a, size, dst, src1);
        }
    } else if src2p.is_immediate() && is_valid_immediate_mask(src2p.immediate(), size) {
        be.mov_reg_param(a, size, src1, &src1p);
        emit_logical_imm(a, size, LogicalOp::Orr, dst, src1, src2p.immediate());
    } else {
        let src2 = src2p.select_ireg(TEMP_REG1);
        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);

        emit_alu_rr(a, size, AluOp::Orr, dst, src1, src2);
    }

    be.mov_param_reg(a, size, &dstp, dst);

    if flags {
        emit_tst_rr(a, size, dst, dst);
        be.carry_state = CarryState::Poison;
    }
}

fn op_xor(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let flags = !inst.flags.is_empty();
    let bits = u64::from(size) * 8;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let mut src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let mut src2p = be.be_param(inst.param(2), PTYPE_MRI);

    if src1p.is_immediate() || (dstp.is_int_reg() && dstp == src2p) {
        std::mem::swap(&mut src1p, &mut src2p);
    }

    let dst = dstp.select_ireg(TEMP_REG3);
    let src1 = src1p.select_ireg(dst);

    if src1p.is_immediate() && src2p.is_immediate() {
        be.get_imm_relative(a, size, dst, src1p.immediate() ^ src2p.immediate());
    } else if src2p.is_immediate_value(0) {
        if dstp == src1p && !flags {
            if size == 8 || (dstp.is_memory() && !dstp.is_cold_register()) {
                return;
            }
        }

        be.mov_reg_param(a, size, src1, &src1p);

        if dst != src1 || (size == 4 && dstp == src1p && dstp.is_int_reg()) {
            emit_mov_rr(a, size, dst, src1);
        }
    } else if src2p.is_immediate_value(make_bitmask(bits as u32)) {
        be.mov_reg_param(a, size, src1, &src1p);
        emit_mvn_rr(a, size, dst, src1);
    } else if src2p.is_immediate() && is_valid_immediate_mask(src2p.immediate(), size) {
        be.mov_reg_param(a, size, src1, &src1p);
        emit_logical_imm(a, size, LogicalOp::Eor, dst, src1, src2p.immediate());
    } else if src1p == src2p {
        emit_mov_rr(a, size, dst, ZR);
    } else {
        let src2 = src2p.select_ireg(TEMP_REG1);
        be.mov_reg_param(a, size, src1, &src1p);
        be.mov_reg_param(a, size, src2, &src2p);

        emit_alu_rr(a, size, AluOp::Eor, dst, src1, src2);
    }

    be.mov_param_reg(a, size, &dstp, dst);

    if flags {
        emit_tst_rr(a, size, dst, dst);
        be.carry_state = CarryState::Poison;
    }
}

fn op_lzcnt(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);
    let dstp = be.be_param(inst.param(0), PTYPE_MR);

    let src = srcp.select_ireg(TEMP_REG1);
    let dst = dstp.select_ireg(TEMP_REG2);

    be.mov_reg_param(a, size, src, &srcp);

    emit_clz(a, size, dst, src);

    be.mov_param_reg(a, size, &dstp, dst);

    if !inst.flags.is_empty() {
        emit_tst_rr(a, size, dst, dst);
        be.carry_state = CarryState::Poison;
    }
}

fn op_tzcnt(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);

    let src = srcp.select_ireg(TEMP_REG1);
    let dst = dstp.select_ireg(TEMP_REG2);

    be.mov_reg_param(a, size, src, &srcp);

    // count tail bits from the head after a bit reverse
    emit_rbit(a, size, dst, src);
    emit_clz(a, size, dst, dst);

    be.mov_param_reg(a, size, &dstp, dst);

    if !inst.flags.is_empty() {
        // Z means no set bit was found: the count equals the bit width
        emit_logical_imm(a, size, LogicalOp::Eor, TEMP_REG3, dst, u64::from(size) * 8);
        emit_tst_rr(a, size, TEMP_REG3, TEMP_REG3);
        be.carry_state = CarryState::Poison;
    }
}

fn op_bswap(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);

    let src = srcp.select_ireg(TEMP_REG1);
    let dst = dstp.select_ireg(TEMP_REG1);

    be.mov_reg_param(a, size, src, &srcp);

    emit_rev(a, size, dst, src);

    be.mov_param_reg(a, size, &dstp, dst);

    if !inst.flags.is_empty() {
        emit_tst_rr(a, size, dst, dst);
        be.carry_state = CarryState::Poison;
    }
}

// ---------------------------------------------------------------------------
// shifts and rotates

fn shift_common(be: &mut Backend, a: &mut Asm, inst: &Inst, kind: ShiftKind) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let bits = u64::from(size) * 8;
    let max_bits = size * 8 - 1;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let src2p = be.be_param(inst.param(2), PTYPE_MRI);

    // write straight to the destination register when it does not alias an
    // input still needed for the carry calculation
    let mut can_use_dst_reg = dstp.is_int_reg();
    if can_use_dst_reg && src1p.is_int_reg() {
        can_use_dst_reg = src1p != dstp;
    }
    if can_use_dst_reg && src2p.is_int_reg() {
        can_use_dst_reg = src2p != dstp;
    }

    let src = src1p.select_ireg(TEMP_REG1);
    let shift = src2p.select_ireg(TEMP_REG2);
    let dst = if can_use_dst_reg {
        dstp.select_ireg(TEMP_REG3)
    } else {
        TEMP_REG3
    };

    be.mov_reg_param(a, size, src, &src1p);

    if src2p.is_immediate() {
        let count = (src2p.immediate() % bits) as u32;

        emit_shift_imm(a, size, kind, dst, src, count);

        if kind == ShiftKind::Lsl {
            be.calculate_carry_shift_left_imm(a, size, src, count, max_bits);
        } else {
            be.calculate_carry_shift_right_imm(a, size, src, count);
        }
    } else {
        be.mov_reg_param(a, size, shift, &src2p);

        emit_logical_imm(a, size, LogicalOp::And, FUNC_SCRATCH_REG, shift, bits - 1);

        emit_shift_rr(a, size, kind, dst, src, FUNC_SCRATCH_REG);

        if kind == ShiftKind::Lsl {
            be.calculate_carry_shift_left(a, size, src, FUNC_SCRATCH_REG, max_bits);
        } else {
            be.calculate_carry_shift_right(a, size, src, FUNC_SCRATCH_REG);
        }
    }

    if !inst.flags.is_empty() {
        emit_tst_rr(a, size, dst, dst);
        be.carry_state = CarryState::Poison;
    }

    // store after the carry calculation so the inputs stay intact
    be.mov_param_reg(a, size, &dstp, dst);
}

fn op_shl(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    shift_common(be, a, inst, ShiftKind::Lsl);
}

fn op_shr(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    shift_common(be, a, inst, ShiftKind::Lsr);
}

fn op_sar(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    shift_common(be, a, inst, ShiftKind::Asr);
}

fn op_ror(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    shift_common(be, a, inst, ShiftKind::Ror);
}

fn op_rol(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let bits = u64::from(size) * 8;
    let max_bits = size * 8 - 1;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let src2p = be.be_param(inst.param(2), PTYPE_MRI);

    let mut can_use_dst_reg = dstp.is_int_reg();
    if can_use_dst_reg && src1p.is_int_reg() {
        can_use_dst_reg = src1p != dstp;
    }
    if can_use_dst_reg && src2p.is_int_reg() {
        can_use_dst_reg = src2p != dstp;
    }

    let param = src1p.select_ireg(TEMP_REG1);
    let shift = src2p.select_ireg(TEMP_REG2);
    let output = if can_use_dst_reg {
        dstp.select_ireg(TEMP_REG3)
    } else {
        TEMP_REG3
    };

    be.mov_reg_param(a, size, param, &src1p);

    if src2p.is_immediate() {
        // a rotate left is a rotate right by the complement
        let s = (src2p.immediate() % bits) as u32;
        let s2 = ((bits as u32 - s) % bits as u32) as u32;

        if s2 == 0 {
            if output != param {
                emit_mov_rr(a, size, output, param);
            }
        } else {
            emit_shift_imm(a, size, ShiftKind::Ror, output, param, s2);
        }

        be.calculate_carry_shift_left_imm(a, size, param, s, max_bits);
    } else {
        be.mov_reg_param(a, size, shift, &src2p);

        emit_mov_imm(a, size, SCRATCH_REG1, bits);
        emit_logical_imm(a, size, LogicalOp::And, FUNC_SCRATCH_REG, shift, bits - 1);
        emit_alu_rr(a, size, AluOp::Sub, SCRATCH_REG1, SCRATCH_REG1, FUNC_SCRATCH_REG);
        emit_shift_rr(a, size, ShiftKind::Ror, output, param, SCRATCH_REG1);

        be.calculate_carry_shift_left(a, size, param, FUNC_SCRATCH_REG, max_bits);
    }

    if !inst.flags.is_empty() {
        emit_tst_rr(a, size, output, output);
        be.carry_state = CarryState::Poison;
    }

    be.mov_param_reg(a, size, &dstp, output);
}

fn op_rolc(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let bits = u64::from(size) * 8;
    let max_bits = size * 8 - 1;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let src2p = be.be_param(inst.param(2), PTYPE_MRI);

    let mut can_use_dst_reg = dstp.is_int_reg();
    if can_use_dst_reg && src1p.is_int_reg() {
        can_use_dst_reg = src1p != dstp;
    }
    if can_use_dst_reg && src2p.is_int_reg() {
        can_use_dst_reg = src2p != dstp;
    }

    let param1 = src1p.select_ireg(TEMP_REG3);
    let output = if can_use_dst_reg {
        dstp.select_ireg(TEMP_REG1)
    } else {
        TEMP_REG1
    };
    let carry = SCRATCH_REG2;

    be.mov_reg_param(a, size, param1, &src1p);

    // result = (value << count) | (carry << (count - 1)) | (value >> (bits + 1 - count))

    if src2p.is_immediate() {
        let shift = (src2p.immediate() % bits) as u32;

        if shift != 0 {
            emit_ubfx(a, size, carry, param1, bits as u32 - shift, 1);
            if shift > 1 {
                emit_ubfx(a, size, output, param1, bits as u32 - shift + 1, shift - 1);
            }
            emit_bfi(a, 8, output, FLAGS_REG, shift - 1, 1);
            emit_bfi(a, size, output, param1, shift, bits as u32 - shift);
            emit_bfi(a, 8, FLAGS_REG, carry, 0, 1);
        } else {
            emit_mov_rr(a, size, output, param1);
        }

        be.calculate_carry_shift_left_imm(a, size, param1, shift, max_bits);
    } else {
        let shift = src2p.select_ireg(TEMP_REG2);

        be.mov_reg_param(a, size, shift, &src2p);

        emit_logical_imm(a, size, LogicalOp::And, FUNC_SCRATCH_REG, shift, bits - 1);

        emit_shift_rr(a, size, ShiftKind::Lsl, output, param1, FUNC_SCRATCH_REG);

        let skip = a.new_dynamic_label();
        let skip_zero = a.new_dynamic_label();
        emit_cbz(a, size, FUNC_SCRATCH_REG, skip_zero);

        be.get_carry(a, carry, false);

        emit_addsub_imm(a, size, AluOp::Sub, SCRATCH_REG1, FUNC_SCRATCH_REG, 1, SCRATCH_REG1);
        emit_cbz(a, size, SCRATCH_REG1, skip);

        // fold in the carry and the bits rotated around the top
        emit_shift_rr(a, size, ShiftKind::Lsl, carry, carry, SCRATCH_REG1);

        emit_mov_imm(a, size, SCRATCH_REG1, u64::from(max_bits) + 2);
        emit_alu_rr(a, size, AluOp::Sub, SCRATCH_REG1, SCRATCH_REG1, FUNC_SCRATCH_REG);
        emit_shift_rr(a, size, ShiftKind::Lsr, SCRATCH_REG1, param1, SCRATCH_REG1);
        emit_alu_rr(a, size, AluOp::Orr, output, output, SCRATCH_REG1);

        a64!(a ; =>skip);

        emit_alu_rr(a, size, AluOp::Orr, output, output, carry);

        a64!(a ; =>skip_zero);

        be.calculate_carry_shift_left(a, size, param1, FUNC_SCRATCH_REG, max_bits);
    }

    if !inst.flags.is_empty() {
        emit_tst_rr(a, size, output, output);
    }

    be.mov_param_reg(a, size, &dstp, output);

    be.carry_state = CarryState::Poison;
}

fn op_rorc(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::Z | FlagSet::S);

    let size = inst.size;
    let bits = u64::from(size) * 8;
    let max_bits = size * 8 - 1;

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let src1p = be.be_param(inst.param(1), PTYPE_MRI);
    let src2p = be.be_param(inst.param(2), PTYPE_MRI);

    let mut can_use_dst_reg = dstp.is_int_reg();
    if can_use_dst_reg && src1p.is_int_reg() {
        can_use_dst_reg = src1p != dstp;
    }
    if can_use_dst_reg && src2p.is_int_reg() {
        can_use_dst_reg = src2p != dstp;
    }

    let param1 = src1p.select_ireg(TEMP_REG3);
    let output = if can_use_dst_reg {
        dstp.select_ireg(TEMP_REG1)
    } else {
        TEMP_REG1
    };
    let carry = SCRATCH_REG2;

    be.mov_reg_param(a, size, param1, &src1p);

    // result = (value >> count) | (carry << (bits - count)) | (value << (bits + 1 - count))

    if src2p.is_immediate() {
        let shift = (src2p.immediate() % bits) as u32;

        if shift != 0 {
            emit_ubfx(a, size, carry, param1, shift - 1, 1);
            emit_ubfx(a, size, output, param1, shift, bits as u32 - shift);
            emit_bfi(a, 8, output, FLAGS_REG, bits as u32 - shift, 1);
            if shift > 1 {
                emit_bfi(a, size, output, param1, bits as u32 - shift + 1, shift - 1);
            }
            emit_bfi(a, 8, FLAGS_REG, carry, 0, 1);
        } else {
            emit_mov_rr(a, size, output, param1);
        }

        be.calculate_carry_shift_right_imm(a, size, param1, shift);
    } else {
        let shift = src2p.select_ireg(TEMP_REG2);

        be.mov_reg_param(a, size, shift, &src2p);

        emit_logical_imm(a, size, LogicalOp::And, FUNC_SCRATCH_REG, shift, bits - 1);

        emit_shift_rr(a, size, ShiftKind::Lsr, output, param1, FUNC_SCRATCH_REG);

        let skip = a.new_dynamic_label();
        let skip_zero = a.new_dynamic_label();
        emit_cbz(a, size, FUNC_SCRATCH_REG, skip_zero);

        be.get_carry(a, carry, false);
        emit_shift_imm(a, size, ShiftKind::Lsl, carry, carry, max_bits);

        emit_addsub_imm(a, size, AluOp::Sub, SCRATCH_REG1, FUNC_SCRATCH_REG, 1, SCRATCH_REG1);
        emit_cbz(a, size, SCRATCH_REG1, skip);

        emit_shift_rr(a, size, ShiftKind::Lsr, carry, carry, SCRATCH_REG1);

        emit_mov_imm(a, size, SCRATCH_REG1, u64::from(max_bits) + 2);
        emit_alu_rr(a, size, AluOp::Sub, SCRATCH_REG1, SCRATCH_REG1, FUNC_SCRATCH_REG);
        emit_shift_rr(a, size, ShiftKind::Lsl, SCRATCH_REG1, param1, SCRATCH_REG1);
        emit_alu_rr(a, size, AluOp::Orr, output, output, SCRATCH_REG1);

        a64!(a ; =>skip);

        emit_alu_rr(a, size, AluOp::Orr, output, output, carry);

        a64!(a ; =>skip_zero);

        be.calculate_carry_shift_right(a, size, param1, FUNC_SCRATCH_REG);
    }

    if !inst.flags.is_empty() {
        emit_tst_rr(a, size, output, output);
    }

    be.mov_param_reg(a, size, &dstp, output);

    be.carry_state = CarryState::Poison;
}

// ---------------------------------------------------------------------------
// floating point

fn op_fload(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let basep = be.be_param(inst.param(1), PTYPE_M);
    let indp = be.be_param(inst.param(2), PTYPE_MRI);

    let dstreg = dstp.select_freg(TEMPF_REG1);
    let basereg = TEMP_REG1;
    let op = if inst.size == 4 { MemOp::LdrS } else { MemOp::LdrD };

    be.get_imm_relative(a, 8, basereg, basep.memory() as u64);

    if indp.is_immediate() {
        let off = (indp.immediate() as u32).wrapping_mul(inst.size);
        emit_mem_op(a, op, dstreg, Mem::Scaled(basereg, off));
    } else {
        let indreg = indp.select_ireg(TEMP_REG3);
        be.mov_reg_param(a, 4, indreg, &indp);
        let shift = if inst.size == 4 { 2 } else { 3 };
        emit_mem_op(a, op, dstreg, Mem::RegShift(basereg, indreg, shift));
    }

    be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
}

fn op_fstore(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let basep = be.be_param(inst.param(0), PTYPE_M);
    let indp = be.be_param(inst.param(1), PTYPE_MRI);
    let srcp = be.be_param(inst.param(2), PTYPE_MF);

    let srcreg = srcp.select_freg(TEMPF_REG1);
    let basereg = TEMP_REG1;
    let op = if inst.size == 4 { MemOp::StrS } else { MemOp::StrD };

    be.get_imm_relative(a, 8, basereg, basep.memory() as u64);
    be.mov_float_reg_param(a, inst.size, srcreg, &srcp);

    if indp.is_immediate() {
        let off = (indp.immediate() as u32).wrapping_mul(inst.size);
        emit_mem_op(a, op, srcreg, Mem::Scaled(basereg, off));
    } else {
        let indreg = indp.select_ireg(TEMP_REG3);
        be.mov_reg_param(a, 4, indreg, &indp);
        let shift = if inst.size == 4 { 2 } else { 3 };
        emit_mem_op(a, op, srcreg, Mem::RegShift(basereg, indreg, shift));
    }
}

fn op_fread(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let addrp = be.be_param(inst.param(1), PTYPE_MRI);
    let (size_log, space) = size_space(inst.param(2));
    assert_eq!(1u32 << size_log, inst.size);

    let acc = &be.accessors[space as usize];
    let resolved = acc.resolved.read[size_log as usize];

    be.mov_reg_param(a, 4, REG_PARAM2, &addrp);
    be.get_imm_relative(a, 8, REG_PARAM1, resolved.obj as u64);
    be.call_arm_addr(a, resolved.func as usize as u64);

    be.mov_float_param_int_reg(a, inst.size, &dstp, REG_PARAM1);
}

fn op_fwrite(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    be.carry_state = CarryState::Poison;

    let addrp = be.be_param(inst.param(0), PTYPE_MRI);
    let srcp = be.be_param(inst.param(1), PTYPE_MF);
    let (size_log, space) = size_space(inst.param(2));
    assert_eq!(1u32 << size_log, inst.size);

    let acc = &be.accessors[space as usize];
    let resolved = acc.resolved.write[size_log as usize];

    be.mov_reg_param(a, 4, REG_PARAM2, &addrp);
    be.mov_float_reg_param(a, inst.size, TEMPF_REG1, &srcp);
    emit_fmov_to_gp(a, inst.size, REG_PARAM3, TEMPF_REG1);

    be.get_imm_relative(a, 8, REG_PARAM1, resolved.obj as u64);
    be.call_arm_addr(a, resolved.func as usize as u64);
}

fn op_fmov(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let srcp = be.be_param(inst.param(1), PTYPE_MF);

    // conditional select when both operands live in float registers
    let mut usesel = dstp.is_float_reg() && srcp.is_float_reg();
    match inst.cond {
        Cond::Always | Cond::U | Cond::Nu => usesel = false,
        Cond::C | Cond::Nc => {
            if be.carry_state == CarryState::Poison {
                usesel = false;
            }
        }
        _ => {}
    }

    if usesel {
        let dstreg = dstp.select_freg(TEMPF_REG1);
        let srcreg = srcp.select_freg(TEMPF_REG2);

        be.mov_float_reg_param(a, inst.size, dstreg, &dstp);
        be.mov_float_reg_param(a, inst.size, srcreg, &srcp);

        match inst.cond {
            Cond::C | Cond::Nc => {
                if be.carry_state == CarryState::Canonical {
                    emit_fcsel(a, inst.size, Backend::host_cond(inst.cond).negate(), dstreg, srcreg, dstreg);
                } else {
                    emit_fcsel(a, inst.size, Backend::host_cond(inst.cond), dstreg, srcreg, dstreg);
                }
            }
            Cond::A | Cond::Be => {
                be.load_carry(a, true);
                emit_fcsel(a, inst.size, Backend::host_cond(inst.cond), dstreg, srcreg, dstreg);
            }
            _ => emit_fcsel(a, inst.size, Backend::host_cond(inst.cond), dstreg, srcreg, dstreg),
        }

        be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
    } else {
        let skip = be.emit_skip(a, inst.cond);
        be.mov_float_param_param(a, inst.size, &dstp, &srcp);
        bind_skip(a, skip);
    }
}

fn op_ftoint(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MF);
    let size_log = size_only(inst.param(2));
    let round = match inst.param(3) {
        Parameter::Rounding(round) => *round,
        other => panic!("parameter {:?} is not a rounding mode", other),
    };

    let int_size = 1u32 << size_log;
    let dstreg = dstp.select_ireg(TEMP_REG1);
    let srcreg = srcp.select_freg(TEMPF_REG1);

    if !srcp.is_float_reg() {
        be.mov_float_reg_param(a, inst.size, srcreg, &srcp);
    }

    let mode = match round {
        Rounding::Round => FcvtRound::Nearest,
        Rounding::Ceil => FcvtRound::Ceil,
        Rounding::Floor => FcvtRound::Floor,
        Rounding::Trunc | Rounding::Default => FcvtRound::Trunc,
    };
    emit_fcvt_to_int(a, mode, int_size, inst.size, dstreg, srcreg);

    be.mov_param_reg(a, int_size, &dstp, dstreg);
}

fn op_ffrint(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let srcp = be.be_param(inst.param(1), PTYPE_MRI);
    let size_log = size_only(inst.param(2));

    let int_size = 1u32 << size_log;
    let dstreg = dstp.select_freg(TEMPF_REG1);
    let srcreg = srcp.select_ireg(TEMP_REG1);

    if !srcp.is_int_reg() {
        be.mov_reg_param(a, int_size, srcreg, &srcp);
    }

    emit_scvtf(a, inst.size, int_size, dstreg, srcreg);

    if !dstp.is_float_reg() {
        be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
    }
}

fn op_ffrflt(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let srcp = be.be_param(inst.param(1), PTYPE_MF);
    let size_log = size_only(inst.param(2));

    let src_size = 1u32 << size_log;
    let dstreg = dstp.select_freg(TEMPF_REG1);
    let srcreg = srcp.select_freg(TEMPF_REG2);

    if !srcp.is_float_reg() {
        be.mov_float_reg_param(a, src_size, srcreg, &srcp);
    }

    emit_fcvt(a, inst.size, src_size, dstreg, srcreg);

    if !dstp.is_float_reg() {
        be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
    }
}

fn op_frnds(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert_eq!(inst.size, 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let srcp = be.be_param(inst.param(1), PTYPE_MF);

    let dstreg = dstp.select_freg(TEMPF_REG2);
    let srcreg = srcp.select_freg(TEMPF_REG1);

    if !srcp.is_float_reg() {
        be.mov_float_reg_param(a, inst.size, srcreg, &srcp);
    }

    // round-trip through single precision
    emit_fcvt(a, 4, 8, dstreg, srcreg);
    emit_fcvt(a, 8, 4, dstreg, dstreg);

    if !dstp.is_float_reg() {
        be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
    }
}

fn op_fcmp(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_flags(inst, FlagSet::C | FlagSet::Z | FlagSet::U);

    let src1p = be.be_param(inst.param(0), PTYPE_MF);
    let src2p = be.be_param(inst.param(1), PTYPE_MF);

    let srcreg1 = src1p.select_freg(TEMPF_REG1);
    let srcreg2 = src2p.select_freg(TEMPF_REG2);

    if !src1p.is_float_reg() {
        be.mov_float_reg_param(a, inst.size, srcreg1, &src1p);
    }
    if !src2p.is_float_reg() {
        be.mov_float_reg_param(a, inst.size, srcreg2, &src2p);
    }

    emit_fcmp(a, inst.size, srcreg1, srcreg2);

    // carry means "less", and an unordered compare counts as less; LT covers
    // both. NZCV.C then matches neither carry polarity, so the cache goes
    // cold rather than logical.
    emit_cset(a, 8, HostCond::Lt, SCRATCH_REG1);
    be.store_carry_reg(a, SCRATCH_REG1);
    be.carry_state = CarryState::Poison;

    be.store_unordered(a);
}

fn float_alu_common(be: &mut Backend, a: &mut Asm, inst: &Inst, op: FloatBinOp) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let src1p = be.be_param(inst.param(1), PTYPE_MF);
    let src2p = be.be_param(inst.param(2), PTYPE_MF);

    let dstreg = dstp.select_freg(TEMPF_REG3);
    let srcreg1 = src1p.select_freg(TEMPF_REG1);
    let srcreg2 = src2p.select_freg(TEMPF_REG2);

    if !src1p.is_float_reg() {
        be.mov_float_reg_param(a, inst.size, srcreg1, &src1p);
    }
    if !src2p.is_float_reg() {
        be.mov_float_reg_param(a, inst.size, srcreg2, &src2p);
    }

    emit_float_binop(a, inst.size, op, dstreg, srcreg1, srcreg2);

    if !dstp.is_float_reg() {
        be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
    }
}

fn op_fadd(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu_common(be, a, inst, FloatBinOp::Fadd);
}

fn op_fsub(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu_common(be, a, inst, FloatBinOp::Fsub);
}

fn op_fmul(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu_common(be, a, inst, FloatBinOp::Fmul);
}

fn op_fdiv(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu_common(be, a, inst, FloatBinOp::Fdiv);
}

fn float_alu2_common(be: &mut Backend, a: &mut Asm, inst: &Inst, op: FloatUnOp) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let srcp = be.be_param(inst.param(1), PTYPE_MF);

    let dstreg = dstp.select_freg(TEMPF_REG2);
    let srcreg = srcp.select_freg(TEMPF_REG1);

    if !srcp.is_float_reg() {
        be.mov_float_reg_param(a, inst.size, srcreg, &srcp);
    }

    emit_float_unop(a, inst.size, op, dstreg, srcreg);

    if !dstp.is_float_reg() {
        be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
    }
}

fn op_fneg(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu2_common(be, a, inst, FloatUnOp::Fneg);
}

fn op_fabs(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu2_common(be, a, inst, FloatUnOp::Fabs);
}

fn op_fsqrt(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu2_common(be, a, inst, FloatUnOp::Fsqrt);
}

fn op_frecip(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu2_common(be, a, inst, FloatUnOp::Frecpe);
}

fn op_frsqrt(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    float_alu2_common(be, a, inst, FloatUnOp::Frsqrte);
}

fn op_fcopyi(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MF);
    let srcp = be.be_param(inst.param(1), PTYPE_MR);

    let dstreg = dstp.select_freg(TEMPF_REG1);
    let srcreg = srcp.select_ireg(TEMP_REG1);

    be.mov_reg_param(a, inst.size, srcreg, &srcp);
    emit_fmov_from_gp(a, inst.size, dstreg, srcreg);
    be.mov_float_param_reg(a, inst.size, &dstp, dstreg);
}

fn op_icopyf(be: &mut Backend, a: &mut Asm, inst: &Inst) {
    assert!(inst.size == 4 || inst.size == 8);
    assert_no_condition(inst);
    assert_no_flags(inst);

    let dstp = be.be_param(inst.param(0), PTYPE_MR);
    let srcp = be.be_param(inst.param(1), PTYPE_MF);

    let dstreg = dstp.select_ireg(TEMP_REG1);
    let srcreg = srcp.select_freg(TEMPF_REG1);

    be.mov_float_reg_param(a, inst.size, srcreg, &srcp);
    emit_fmov_to_gp(a, inst.size, dstreg, srcreg);
    be.mov_param_reg(a, inst.size, &dstp, dstreg);
}
