//! Shared helpers for unit tests: a small test machine and a
//! representative rule table.

use crate::ir::Op;
use crate::rules::{RuleTable, RuleTableBuilder};
use crate::{IdealKind, Machine, ParmLoc, PReg, RegMask, SavePolicy, Signature};

/// Twelve registers: r0-r6 integer/pointer (r0 = return value, r1-r3
/// argument registers, r4-r6 callee-saved), r7 frame pointer, r8-r11
/// float (r8 = return value, r9-r10 arguments).
pub struct TestMachine;

pub const NUM_REGS: usize = 12;

impl Machine for TestMachine {
    fn num_regs(&self) -> usize {
        NUM_REGS
    }

    fn save_policy(&self, reg: PReg) -> SavePolicy {
        match reg.index() {
            0..=3 => SavePolicy::SaveOnCall,
            4..=6 => SavePolicy::SaveOnEntry,
            7 => SavePolicy::AlwaysSave,
            _ => SavePolicy::SaveOnCall,
        }
    }

    fn save_type(&self, reg: PReg) -> IdealKind {
        if reg.index() >= 8 {
            IdealKind::D
        } else {
            IdealKind::I
        }
    }

    fn frame_pointer(&self) -> PReg {
        PReg::new(7)
    }

    fn return_addr_mask(&self) -> RegMask {
        RegMask::single(self.stack2reg(0))
    }

    fn return_value(&self, k: IdealKind) -> PReg {
        match k {
            IdealKind::F | IdealKind::D => PReg::new(8),
            _ => PReg::new(0),
        }
    }

    fn calling_convention(&self, sig: &Signature, out: &mut Vec<ParmLoc>) {
        let mut next_int = 1;
        let mut next_float = 9;
        let mut next_stack = 0;
        for &arg in &sig.args {
            let loc = match arg {
                IdealKind::F | IdealKind::D => {
                    if next_float <= 10 {
                        let r = ParmLoc::Reg(PReg::new(next_float));
                        next_float += 1;
                        r
                    } else {
                        let s = ParmLoc::Stack(next_stack);
                        next_stack += 1;
                        s
                    }
                }
                IdealKind::None => ParmLoc::None,
                _ => {
                    if next_int <= 3 {
                        let r = ParmLoc::Reg(PReg::new(next_int));
                        next_int += 1;
                        r
                    } else {
                        let s = ParmLoc::Stack(next_stack);
                        next_stack += 1;
                        s
                    }
                }
            };
            out.push(loc);
        }
    }

    fn reg_class_mask(&self, k: IdealKind) -> RegMask {
        let mut m = RegMask::EMPTY;
        match k {
            IdealKind::F | IdealKind::D => {
                for i in 8..12 {
                    m.insert(PReg::new(i));
                }
            }
            IdealKind::Flags | IdealKind::None => {}
            _ => {
                for i in 0..7 {
                    m.insert(PReg::new(i));
                }
            }
        }
        m
    }
}

/// Operand and rule ids for the test table.
pub struct TestRules {
    pub table: RuleTable,
    pub univ: u32,
    pub ireg: u32,
    pub lreg: u32,
    pub preg: u32,
    pub rflags: u32,
    pub imm_i: u32,
    pub imm_p0: u32,
    pub cmp_op: u32,
    pub ind_off: u32,
    pub mem_c: u32,
    pub add_rr: u32,
    pub add_ri: u32,
    pub sub_rr: u32,
    pub load_con_i: u32,
    pub load_i: u32,
    pub store_i: u32,
    pub load_p: u32,
    pub lea_p: u32,
    pub cmp_i: u32,
    pub cmp_p0: u32,
    pub jmp_con: u32,
    pub ret: u32,
    pub rethrow: u32,
    pub halt: u32,
    pub call_static: u32,
    pub safepoint: u32,
    pub lvb: u32,
}

pub fn test_rules() -> TestRules {
    let mut b = RuleTableBuilder::new();

    // Operands.
    let univ = b.operand("universe", IdealKind::None);
    let ireg = b.operand("iRegI", IdealKind::I);
    let lreg = b.operand("iRegL", IdealKind::L);
    let preg = b.operand("iRegP", IdealKind::P);
    let rflags = b.operand("rFlags", IdealKind::Flags);
    let imm_i = b.immediate("immI");
    let imm_p0 = b.immediate("immP0");
    let cmp_op = b.immediate("cmpOp");
    let ind_off = b.operand("indOffset", IdealKind::None);

    // Classes.
    let mem_c = b.class("memory", IdealKind::None);
    b.member(mem_c, preg);
    b.member(mem_c, ind_off);

    // Leaf productions.
    b.leaf(Op::ConI, imm_i, 0);
    b.leaf(Op::ConP, imm_p0, 0);
    b.leaf(Op::Bool, cmp_op, 0);
    // Register-indirect-plus-offset addressing folds an AddP for free.
    b.interior(Op::AddP, ind_off, preg, imm_i, 0);

    // Instructions.
    let add_rr = b.inst("addI_rReg", Op::AddI, ireg, Some(ireg), Some(ireg), 1);
    let add_ri = b.inst("addI_rReg_imm", Op::AddI, ireg, Some(ireg), Some(imm_i), 1);
    let sub_rr = b.inst("subI_rReg", Op::SubI, ireg, Some(ireg), Some(ireg), 1);
    let load_con_i = b.chain("loadConI", imm_i, ireg, 2);
    let load_i = b.inst("loadI", Op::LoadI, ireg, Some(mem_c), None, 4);
    let store_i = b.inst("storeI", Op::StoreI, univ, Some(mem_c), Some(ireg), 4);
    let load_p = b.inst("loadP", Op::LoadP, preg, Some(mem_c), None, 4);
    let lea_p = b.inst("leaP", Op::AddP, preg, Some(preg), Some(imm_i), 1);
    let cmp_i = b.inst("compI_rReg", Op::CmpI, rflags, Some(ireg), Some(ireg), 1);
    let cmp_p0 = b.inst("testP_reg", Op::CmpP, rflags, Some(preg), Some(imm_p0), 1);
    let jmp_con = b.inst("jmpCon", Op::If, univ, Some(cmp_op), Some(rflags), 1);
    let ret = b.inst("ret", Op::Return, univ, None, None, 1);
    let rethrow = b.inst("rethrowException", Op::Rethrow, univ, None, None, 1);
    let halt = b.inst("halt", Op::Halt, univ, None, None, 1);
    let call_static = b.inst("callStatic", Op::CallStatic, univ, None, None, 10);
    let safepoint = b.inst("safePoint", Op::SafePoint, univ, None, None, 5);
    let lvb = b.inst("lvbP", Op::LoadP, preg, Some(preg), None, 6);
    b.set_barrier(lvb);

    b.set_latency(load_i, 3);
    b.set_latency(load_p, 3);
    b.set_must_clone(Op::CmpI);
    b.set_must_clone(Op::CmpP);
    b.set_must_clone(Op::CmpL);

    b.set_ideal_class(IdealKind::I, ireg);
    b.set_ideal_class(IdealKind::L, lreg);
    b.set_ideal_class(IdealKind::P, preg);
    b.set_ideal_class(IdealKind::Flags, rflags);

    TestRules {
        table: b.build(),
        univ,
        ireg,
        lreg,
        preg,
        rflags,
        imm_i,
        imm_p0,
        cmp_op,
        ind_off,
        mem_c,
        add_rr,
        add_ri,
        sub_rr,
        load_con_i,
        load_i,
        store_i,
        load_p,
        lea_p,
        cmp_i,
        cmp_p0,
        jmp_con,
        ret,
        rethrow,
        halt,
        call_static,
        safepoint,
        lvb,
    }
}
