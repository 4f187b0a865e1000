//! Generates and runs a small UML program: sums the first hundred integers
//! with a counted loop, then exits with the total.

use umljit_aa64::uml::{Cond, FlagSet, Inst, Opcode, Parameter};
use umljit_aa64::{Backend, BackendConfig};

fn main() {
    env_logger::init();

    if !cfg!(target_arch = "aarch64") {
        eprintln!("generated code needs an AArch64 host; nothing to run here");
        return;
    }

    let mut be = Backend::new(BackendConfig::default()).expect("backend");
    let entry = be.create_handle("entry");
    let loop_top = be.create_label();

    let program = vec![
        Inst::new(Opcode::Handle, 4).arg(Parameter::Handle(entry)),
        // i0 = accumulator, i1 = counter
        Inst::new(Opcode::Mov, 8)
            .arg(Parameter::IntReg(0))
            .arg(Parameter::Immediate(0)),
        Inst::new(Opcode::Mov, 8)
            .arg(Parameter::IntReg(1))
            .arg(Parameter::Immediate(100)),
        Inst::new(Opcode::Label, 4).arg(Parameter::Label(loop_top)),
        Inst::new(Opcode::Add, 8)
            .arg(Parameter::IntReg(0))
            .arg(Parameter::IntReg(0))
            .arg(Parameter::IntReg(1)),
        Inst::new(Opcode::Sub, 8)
            .with_flags(FlagSet::Z)
            .arg(Parameter::IntReg(1))
            .arg(Parameter::IntReg(1))
            .arg(Parameter::Immediate(1)),
        Inst::new(Opcode::Jmp, 4)
            .with_cond(Cond::Nz)
            .arg(Parameter::Label(loop_top)),
        Inst::new(Opcode::Exit, 4).arg(Parameter::IntReg(0)),
    ];

    be.generate(&program).expect("generate");
    let result = be.execute(entry);
    println!("sum(1..=100) = {}", result);
    assert_eq!(result, 5050);
}
