use crate::ir::{tf, BoolTest, ConValue, IrGraph, Op};
use crate::mach::{ExitKind, MachKind, MachRef};
use crate::matcher::select;
use crate::testutil::{test_rules, TestMachine};
use crate::{
    IdealKind, Machine, NodeId, Options, ParmLoc, PReg, RegMask, SelectError, Signature,
};

fn sig(args: &[IdealKind], ret: Option<IdealKind>) -> Signature {
    Signature {
        args: args.to_vec(),
        ret,
    }
}

/// Start projections for control, memory, and each argument.
fn entry(g: &mut IrGraph) -> (NodeId, NodeId, Vec<NodeId>) {
    let start = g.start;
    let ctrl = g.add_proj(start, tf::CONTROL as u32, IdealKind::None);
    let mem = g.add_proj(start, tf::MEMORY as u32, IdealKind::None);
    let args = g.sig.args.clone();
    let parms = args
        .iter()
        .enumerate()
        .map(|(i, &k)| g.add_proj(start, (tf::PARMS + i) as u32, k))
        .collect();
    (ctrl, mem, parms)
}

fn add_return(g: &mut IrGraph, ctrl: NodeId, mem: NodeId, val: NodeId) -> NodeId {
    let inv = NodeId::invalid();
    let ret = g.add(Op::Return, IdealKind::None, &[ctrl, inv, mem, inv, inv, val]);
    let root = g.root;
    g.add_input(root, ret);
    ret
}

/// Machine instructions that came from covered trees (not projections or
/// carried-over structural nodes).
fn count_real_insts(sel: &crate::Selection) -> usize {
    sel.graph
        .iter_ids()
        .filter(|&m| {
            !matches!(
                sel.graph.inst(m).kind,
                MachKind::Proj { .. } | MachKind::Ideal(_) | MachKind::Pinch
            )
        })
        .count()
}

#[test]
fn test_add_tree_covering() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I, IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let add = g.add(Op::AddI, IdealKind::I, &[inv, parms[0], parms[1]]);
    add_return(&mut g, ctrl, mem, add);

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    let madd = sel.node_map[add.index()].as_mach().unwrap();
    assert_eq!(sel.graph.inst(madd).rule, tr.add_rr);
    let mp0 = sel.node_map[parms[0].index()].as_mach().unwrap();
    let mp1 = sel.node_map[parms[1].index()].as_mach().unwrap();
    assert_eq!(sel.graph.input(madd, 1), MachRef::Mach(mp0));
    assert_eq!(sel.graph.input(madd, 2), MachRef::Mach(mp1));

    // The first argument's projection carries its convention register.
    match sel.graph.inst(mp0).kind {
        MachKind::Proj { mask, .. } => assert!(mask.member(PReg::new(1))),
        _ => panic!("parm did not become a projection"),
    }

    // Coverage totality: two covered roots, two instructions.
    assert_eq!(count_real_insts(&sel), 2);
}

#[test]
fn test_immediate_folds_into_operand() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let c = g.add_con(Op::ConI, IdealKind::I, ConValue::I(7));
    let add = g.add(Op::AddI, IdealKind::I, &[inv, parms[0], c]);
    add_return(&mut g, ctrl, mem, add);

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    let madd = sel.node_map[add.index()].as_mach().unwrap();
    let inst = sel.graph.inst(madd);
    assert_eq!(inst.rule, tr.add_ri);
    assert_eq!(inst.opnds.len(), 3);
    assert_eq!(inst.opnds[2].oper, tr.imm_i);
    assert_eq!(inst.opnds[2].con, Some(ConValue::I(7)));
    // The constant itself was never materialized.
    assert!(sel.node_map[c.index()].as_mach().is_none());
    assert_eq!(inst.inputs.len(), 2);
}

#[test]
fn test_shared_node_becomes_tree_boundary() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I, IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let x = g.add(Op::AddI, IdealKind::I, &[inv, parms[0], parms[1]]);
    let y = g.add(Op::AddI, IdealKind::I, &[inv, x, x]);
    add_return(&mut g, ctrl, mem, y);

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    // x has two uses: it roots its own tree and arrives in a register.
    let mx = sel.node_map[x.index()].as_mach().unwrap();
    let my = sel.node_map[y.index()].as_mach().unwrap();
    assert_eq!(sel.graph.input(my, 1), MachRef::Mach(mx));
    assert_eq!(sel.graph.input(my, 2), MachRef::Mach(mx));
    assert_eq!(count_real_insts(&sel), 3);
}

#[test]
fn test_constant_sharing_idempotent() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    // Two distinct nodes with the same value, both forced to materialize
    // (the left operand of an add must be a register).
    let c1 = g.add_con(Op::ConI, IdealKind::I, ConValue::I(7));
    let c2 = g.add_con(Op::ConI, IdealKind::I, ConValue::I(7));
    let a1 = g.add(Op::AddI, IdealKind::I, &[inv, c1, parms[0]]);
    let a2 = g.add(Op::AddI, IdealKind::I, &[inv, c2, a1]);
    add_return(&mut g, ctrl, mem, a2);

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    let ma1 = sel.node_map[a1.index()].as_mach().unwrap();
    let ma2 = sel.node_map[a2.index()].as_mach().unwrap();
    let con1 = sel.graph.input(ma1, 1);
    let con2 = sel.graph.input(ma2, 1);
    // Identical value, identical rule: the same machine node handle.
    assert_eq!(con1, con2);
    let mcon = con1.as_mach().unwrap();
    assert!(sel.graph.inst(mcon).is_con());
    // The shared constant is pinned to the graph root for scheduling.
    assert_eq!(sel.graph.input(mcon, 0), MachRef::Mach(sel.root));
    let cons = sel
        .graph
        .iter_ids()
        .filter(|&m| sel.graph.inst(m).is_con())
        .count();
    assert_eq!(cons, 1);
}

#[test]
fn test_store_keeps_memory_edge() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::P], None));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let p = parms[0];
    // c = load(mem, p); d = add(c, 1); store(mem, p, d)
    let c = g.add(Op::LoadI, IdealKind::I, &[inv, mem, p]);
    let one = g.add_con(Op::ConI, IdealKind::I, ConValue::I(1));
    let d = g.add(Op::AddI, IdealKind::I, &[inv, c, one]);
    let st = g.add(Op::StoreI, IdealKind::None, &[inv, mem, p, d]);
    add_return(&mut g, ctrl, st, NodeId::invalid());

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    let mmem = sel.node_map[mem.index()].as_mach().unwrap();
    let mst = sel.node_map[st.index()].as_mach().unwrap();
    assert_eq!(sel.graph.inst(mst).rule, tr.store_i);
    // Round trip: the store's memory input is the reduced form of the
    // original memory edge.
    assert_eq!(sel.graph.input(mst, 1), MachRef::Mach(mmem));

    // The load stayed inside the store's tree region as its own
    // instruction, reading the same memory state.
    let mload = sel
        .graph
        .iter_ids()
        .find(|&m| sel.graph.inst(m).rule == tr.load_i)
        .expect("load instruction");
    assert_eq!(sel.graph.input(mload, 1), MachRef::Mach(mmem));
}

#[test]
fn test_addressing_folds_into_memory_operand() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::P], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let off = g.add_con(Op::ConI, IdealKind::I, ConValue::I(16));
    let addr = g.add(Op::AddP, IdealKind::P, &[inv, parms[0], parms[0], off]);
    let c = g.add(Op::LoadI, IdealKind::I, &[inv, mem, addr]);
    add_return(&mut g, ctrl, mem, c);

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    let mload = sel.node_map[c.index()].as_mach().unwrap();
    let inst = sel.graph.inst(mload);
    assert_eq!(inst.rule, tr.load_i);
    // The AddP was swallowed by the addressing operand: offset embedded,
    // base register harvested as a leaf.
    assert_eq!(inst.opnds[1].oper, tr.ind_off);
    assert_eq!(inst.opnds[1].con, Some(ConValue::I(16)));
    assert!(sel.node_map[addr.index()].as_mach().is_none());
}

struct SplitConvMachine;

impl Machine for SplitConvMachine {
    fn num_regs(&self) -> usize {
        crate::testutil::NUM_REGS
    }
    fn save_policy(&self, reg: PReg) -> crate::SavePolicy {
        TestMachine.save_policy(reg)
    }
    fn save_type(&self, reg: PReg) -> IdealKind {
        TestMachine.save_type(reg)
    }
    fn frame_pointer(&self) -> PReg {
        TestMachine.frame_pointer()
    }
    fn return_addr_mask(&self) -> RegMask {
        TestMachine.return_addr_mask()
    }
    fn return_value(&self, k: IdealKind) -> PReg {
        TestMachine.return_value(k)
    }
    /// Arguments 1 and 3 in registers, argument 2 on the stack.
    fn calling_convention(&self, sig: &Signature, out: &mut Vec<ParmLoc>) {
        for (i, _) in sig.args.iter().enumerate() {
            out.push(match i {
                0 => ParmLoc::Reg(PReg::new(1)),
                1 => ParmLoc::Stack(0),
                _ => ParmLoc::Reg(PReg::new(2)),
            });
        }
    }
    fn reg_class_mask(&self, k: IdealKind) -> RegMask {
        TestMachine.reg_class_mask(k)
    }
}

#[test]
fn test_call_binding_masks_and_watermark() {
    let tr = test_rules();
    let machine = SplitConvMachine;
    let mut g = IrGraph::new(sig(&[], Some(IdealKind::I)));
    let (ctrl, mem, _) = entry(&mut g);
    let inv = NodeId::invalid();

    let a0 = g.add_con(Op::ConI, IdealKind::I, ConValue::I(1));
    let a1 = g.add_con(Op::ConI, IdealKind::I, ConValue::I(2));
    let a2 = g.add_con(Op::ConI, IdealKind::I, ConValue::I(3));
    let call = g.add(
        Op::CallStatic,
        IdealKind::None,
        &[ctrl, inv, mem, inv, inv, a0, a1, a2],
    );
    g.node_mut(call).call = Some(Box::new(crate::ir::CallData {
        sig: sig(
            &[IdealKind::I, IdealKind::I, IdealKind::I],
            Some(IdealKind::I),
        ),
        entry: 0x1000,
        kind: crate::ir::CallKind::Static {
            name: "callee".to_string(),
        },
        debug: Some(crate::ir::DebugInfo {
            bci: 7,
            live: vec![a0],
        }),
    }));
    let cproj = g.add_proj(call, tf::CONTROL as u32, IdealKind::None);
    let rproj = g.add_proj(call, tf::PARMS as u32, IdealKind::I);
    let mproj = g.add_proj(call, tf::MEMORY as u32, IdealKind::None);
    add_return(&mut g, cproj, mproj, rproj);

    let sel = select(&mut g, &machine, &tr.table, &Options::default()).unwrap();

    let mcall = sel.node_map[call.index()].as_mach().unwrap();
    let data = sel.graph.inst(mcall).safepoint().unwrap();
    let stack0 = machine.stack0();

    // Two singleton register masks and one stack-slot mask.
    assert_eq!(data.in_rms[tf::PARMS], RegMask::single(PReg::new(1)));
    assert_eq!(data.in_rms[tf::PARMS + 1], RegMask::single(stack0));
    assert_eq!(data.in_rms[tf::PARMS + 2], RegMask::single(PReg::new(2)));
    let target = data.call.as_ref().unwrap();
    assert_eq!(target.argsize, 1);

    // Safepoint metadata rides along unchanged.
    let debug = data.debug.as_ref().unwrap();
    assert_eq!(debug.bci, 7);
    assert_eq!(debug.live, vec![a0]);

    // Watermark: at least one slot beyond argument 2's offset.
    assert!(sel.out_arg_limit >= stack0.index() as u32 + 1);

    // The argument-area kill and the caller-save clobber fat projections.
    let fats: Vec<_> = sel
        .graph
        .projs_of(mcall)
        .iter()
        .copied()
        .filter(|&p| sel.graph.inst(p).is_fat_proj())
        .collect();
    assert_eq!(fats.len(), 2);
    let masks: Vec<RegMask> = fats
        .iter()
        .map(|&p| match sel.graph.inst(p).kind {
            MachKind::Proj { mask, .. } => mask,
            _ => unreachable!(),
        })
        .collect();
    let area = masks.iter().find(|m| m.member(stack0)).unwrap();
    let clobber = masks.iter().find(|m| !m.member(stack0)).unwrap();
    assert!(area.member(stack0));
    // Caller-saved registers are killed, minus the return value and the
    // frame pointer; callee-saved registers are not.
    assert!(clobber.member(PReg::new(1)));
    assert!(clobber.member(PReg::new(3)));
    assert!(!clobber.member(PReg::new(0)));
    assert!(!clobber.member(PReg::new(4)));
    assert!(!clobber.member(machine.frame_pointer()));
}

#[test]
fn test_save_on_entry_epilogue() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let ret = add_return(&mut g, ctrl, mem, parms[0]);
    let halt = g.add(Op::Halt, IdealKind::None, &[ctrl, inv, mem, inv, inv]);
    let root = g.root;
    g.add_input(root, halt);

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    // r4, r5, r6 save-on-entry plus r7 always-save.
    let soe = 4;
    assert_eq!(
        sel.exit_rms[ExitKind::Return as usize].len(),
        tf::PARMS + 1 + soe
    );
    assert_eq!(sel.exit_rms[ExitKind::Halt as usize].len(), tf::PARMS + soe);
    assert_eq!(
        sel.exit_rms[ExitKind::Return as usize][tf::PARMS],
        RegMask::single(PReg::new(0))
    );
    // Returns want the register itself; halts only need a debuggable
    // location, so any spillable slot of the class will do.
    assert_eq!(
        sel.exit_rms[ExitKind::Return as usize][tf::PARMS + 1],
        RegMask::single(PReg::new(4))
    );
    let halt_rm = &sel.exit_rms[ExitKind::Halt as usize][tf::PARMS];
    assert!(halt_rm.member(PReg::new(4)));
    assert!(halt_rm.is_all_stack());

    // Every exit uses every save-on-entry projection.
    let mret = sel.node_map[ret.index()].as_mach().unwrap();
    let mhalt = sel.node_map[halt.index()].as_mach().unwrap();
    assert_eq!(sel.graph.inst(mret).inputs.len(), 6 + soe);
    assert_eq!(sel.graph.inst(mhalt).inputs.len(), 5 + soe);
}

#[test]
fn test_missing_table_entry_fails_hard() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I, IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let x = g.add(Op::XorI, IdealKind::I, &[inv, parms[0], parms[1]]);
    add_return(&mut g, ctrl, mem, x);

    let err = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap_err();
    assert_eq!(err, SelectError::NoTableEntry(x));
    assert!(!err.retryable());
}

#[test]
fn test_label_depth_bailout() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let mut v = parms[0];
    for _ in 0..40 {
        v = g.add(Op::AddI, IdealKind::I, &[inv, parms[0], v]);
    }
    add_return(&mut g, ctrl, mem, v);

    let mut opts = Options::default();
    opts.max_label_depth = 10;
    let err = select(&mut g, &TestMachine, &tr.table, &opts).unwrap_err();
    assert_eq!(err, SelectError::LabelDepthExceeded);
}

#[test]
fn test_null_check_candidates_collected() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::P], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let p = parms[0];
    let null = g.add_con(Op::ConP, IdealKind::P, ConValue::P(0));
    let cmp = g.add(Op::CmpP, IdealKind::Flags, &[inv, p, null]);
    let bol = g.add_bool(cmp, BoolTest::Ne);
    let iff = g.add(Op::If, IdealKind::None, &[ctrl, bol]);
    let tproj = g.add(Op::IfTrue, IdealKind::None, &[iff]);
    let fproj = g.add(Op::IfFalse, IdealKind::None, &[iff]);
    let load = g.add(Op::LoadI, IdealKind::I, &[tproj, mem, p]);
    add_return(&mut g, tproj, mem, load);
    let halt = g.add(Op::Halt, IdealKind::None, &[fproj, inv, mem, inv, inv]);
    let root = g.root;
    g.add_input(root, halt);

    let sel = select(&mut g, &TestMachine, &tr.table, &Options::default()).unwrap();

    assert_eq!(sel.null_checks.len(), 1);
    let pair = sel.null_checks[0];
    assert_eq!(
        MachRef::Mach(pair.proj),
        sel.node_map[tproj.index()]
    );
    assert_eq!(MachRef::Mach(pair.val), sel.node_map[p.index()]);

    // The branch covered its comparison: condition embedded, flags input
    // attached as a nested instruction.
    let miff = sel.node_map[iff.index()].as_mach().unwrap();
    let inst = sel.graph.inst(miff);
    assert_eq!(inst.rule, tr.jmp_con);
    assert_eq!(inst.opnds[1].con, Some(ConValue::I(BoolTest::Ne as i32)));
    let mcmp = sel.graph.input(miff, 1).as_mach().unwrap();
    assert_eq!(sel.graph.inst(mcmp).rule, tr.cmp_p0);
}

fn expand_to_copy(
    g: &mut crate::MachGraph,
    id: crate::MachId,
    projs: &mut Vec<crate::MachId>,
) -> crate::MachId {
    use smallvec::SmallVec;
    let src = g.inst(id).clone();
    let ex = g.add(crate::MachInst {
        kind: MachKind::Inst,
        rule: src.rule,
        ideal_op: src.ideal_op,
        ideal: src.ideal,
        opnds: src.opnds.clone(),
        inputs: src.inputs.clone(),
        prec: SmallVec::new(),
        flags: 0,
    });
    let p = g.add_proj(ex, 9999, true, RegMask::single(PReg::new(5)));
    projs.push(p);
    ex
}

#[test]
fn test_expansion_supersedes_instruction() {
    use crate::rules::RuleTableBuilder;
    let mut b = RuleTableBuilder::new();
    let univ = b.operand("universe", IdealKind::None);
    let ireg = b.operand("iRegI", IdealKind::I);
    let add_rr = b.inst("addI_pseudo", Op::AddI, ireg, Some(ireg), Some(ireg), 1);
    let _ret = b.inst("ret", Op::Return, univ, None, None, 1);
    b.set_expand(add_rr, expand_to_copy);
    b.set_ideal_class(IdealKind::I, ireg);
    let table = b.build();

    let mut g = IrGraph::new(sig(&[IdealKind::I, IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let add = g.add(Op::AddI, IdealKind::I, &[inv, parms[0], parms[1]]);
    add_return(&mut g, ctrl, mem, add);

    let sel = select(&mut g, &TestMachine, &table, &Options::default()).unwrap();

    // The matched node maps to the replacement; the superseded original is
    // fully disconnected, and the expansion's mask-bearing projection
    // landed on the shared list.
    let mex = sel.node_map[add.index()].as_mach().unwrap();
    assert_eq!(sel.graph.inst(mex).ideal, IdealKind::I);
    let dead = sel
        .graph
        .iter_ids()
        .find(|&m| {
            m != mex
                && matches!(sel.graph.inst(m).kind, MachKind::Inst)
                && sel.graph.inst(m).ideal_op == Op::AddI
        })
        .expect("superseded instruction still present");
    assert!(sel.graph.inst(dead).inputs.is_empty());
    assert_eq!(sel.proj_list.len(), 1);
    let p = sel.proj_list[0];
    assert!(sel.graph.inst(p).is_fat_proj());
    assert_eq!(sel.graph.input(p, 0), MachRef::Mach(mex));
}

#[test]
fn test_run_leaves_input_graph_untouched() {
    let tr = test_rules();
    let mut g = IrGraph::new(sig(&[IdealKind::I, IdealKind::I], Some(IdealKind::I)));
    let (ctrl, mem, parms) = entry(&mut g);
    let inv = NodeId::invalid();
    let add = g.add(Op::AddI, IdealKind::I, &[inv, parms[0], parms[1]]);
    add_return(&mut g, ctrl, mem, add);

    let nodes_before = g.num_nodes();
    let sel = crate::run(&g, &TestMachine, &tr.table, &Options::default()).unwrap();
    // Each attempt works on a private copy of the graph.
    assert_eq!(g.num_nodes(), nodes_before);
    assert!(sel.node_map[add.index()].as_mach().is_some());
}
