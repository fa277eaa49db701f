//! Instruction selection: labeling, reduction, call binding, epilogue.
//!
//! The driver converts the ideal graph into machine instructions in three
//! steps. `find_shared` walks from the root marking nodes that are shared
//! (multiple uses), don't-care (structural, never matched), or glued to a
//! consumer (flag producers, address subexpressions). `xform` then walks
//! again, matching each tree root through `match_tree` (or `match_sfpt`
//! for calls/safepoints) and rewriting edges to point into the machine
//! graph. Finally the save-on-entry epilogue is threaded through all
//! exits.

use crate::ir::{addp, mem, tf, ConValue, IrGraph, Op};
use crate::mach::{MachGraph, MachInst, MachKind, MachRef};
use crate::rules::RuleTable;
use crate::{
    FxHashMap, IdealKind, Machine, MachId, NodeId, Options, ParmLoc, PReg, RegMask, SelectError,
};
use smallvec::SmallVec;

mod callsite;
mod epilogue;
mod label;
mod reduce;
#[cfg(test)]
mod tests;

pub use epilogue::{mask_tables, MaskTables};
use label::State;

/// An implicit-null-check candidate: the not-null control projection and
/// the machine node of the tested value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NullCheckPair {
    pub proj: MachId,
    pub val: MachId,
}

/// Everything selection produces for the downstream allocator, scheduler
/// and emitter.
#[derive(Debug)]
pub struct Selection {
    pub graph: MachGraph,
    pub root: MachId,
    pub top: MachId,
    /// IR node to machine tree-root map.
    pub node_map: Vec<MachRef>,
    /// Mask-bearing projections created during matching and expansion.
    pub proj_list: Vec<MachId>,
    /// Implicit-null-check candidates for the scheduler/emitter.
    pub null_checks: Vec<NullCheckPair>,
    /// Shared input-mask array per exit kind.
    pub exit_rms: [Vec<RegMask>; 3],
    /// Frame watermarks, in unified register numbering.
    pub in_arg_limit: u32,
    pub out_arg_limit: u32,
    pub first_stack_mask: RegMask,
    pub spill_mask: [RegMask; IdealKind::COUNT],
    pub debug_mask: [RegMask; IdealKind::COUNT],
}

pub(crate) struct Matcher<'a, M: Machine> {
    pub(crate) ir: &'a mut IrGraph,
    pub(crate) machine: &'a M,
    pub(crate) rules: &'a RuleTable,
    pub(crate) opts: &'a Options,

    // Shared-node analysis.
    visited: Vec<bool>,
    pub(crate) shared: Vec<bool>,
    dontcare: Vec<bool>,
    address_visited: Vec<bool>,

    // State arena; truncated at every match_tree return.
    pub(crate) states: Vec<State>,
    pub(crate) label_depth: u32,

    // Old-space to new-space map, and visit marks on the machine graph.
    pub(crate) node_map: Vec<MachRef>,
    mach_visited: Vec<bool>,
    pub(crate) shared_constants: Vec<Option<(u32, MachId)>>,
    pub(crate) shared_con_values: FxHashMap<(ConValue, u32), MachId>,

    pub(crate) graph: MachGraph,
    pub(crate) proj_list: Vec<MachId>,
    null_check_tests: Vec<(MachId, NodeId)>,
    null_check_validated: Vec<NullCheckPair>,

    // Frame layout.
    pub(crate) parm_regs: Vec<Option<PReg>>,
    pub(crate) calling_convention_mask: Vec<RegMask>,
    pub(crate) return_value_mask: RegMask,
    pub(crate) return_addr_mask: RegMask,
    pub(crate) c_frame_ptr_mask: RegMask,
    pub(crate) old_sp: PReg,
    pub(crate) new_sp: PReg,
    pub(crate) in_arg_limit: PReg,
    pub(crate) out_arg_limit: PReg,
    pub(crate) first_stack_mask: RegMask,
    pub(crate) spill_mask: [RegMask; IdealKind::COUNT],
    pub(crate) debug_mask: [RegMask; IdealKind::COUNT],
    pub(crate) exit_rms: [Vec<RegMask>; 3],
}

/// Run instruction selection over the ideal graph. The graph is consumed:
/// matching restructures ternary operators and branch shapes in place.
pub fn select<M: Machine>(
    ir: &mut IrGraph,
    machine: &M,
    rules: &RuleTable,
    opts: &Options,
) -> Result<Selection, SelectError> {
    let n = ir.num_nodes();
    let mut m = Matcher {
        ir,
        machine,
        rules,
        opts,
        visited: vec![false; n],
        shared: vec![false; n],
        dontcare: vec![false; n],
        address_visited: vec![false; n],
        states: vec![],
        label_depth: 0,
        node_map: vec![MachRef::None; n],
        mach_visited: vec![],
        shared_constants: vec![None; n],
        shared_con_values: FxHashMap::default(),
        graph: MachGraph::new(),
        proj_list: vec![],
        null_check_tests: vec![],
        null_check_validated: vec![],
        parm_regs: vec![],
        calling_convention_mask: vec![],
        return_value_mask: RegMask::EMPTY,
        return_addr_mask: RegMask::EMPTY,
        c_frame_ptr_mask: RegMask::EMPTY,
        old_sp: PReg::invalid(),
        new_sp: PReg::invalid(),
        in_arg_limit: PReg::invalid(),
        out_arg_limit: PReg::invalid(),
        first_stack_mask: RegMask::EMPTY,
        spill_mask: [RegMask::EMPTY; IdealKind::COUNT],
        debug_mask: [RegMask::EMPTY; IdealKind::COUNT],
        exit_rms: [vec![], vec![], vec![]],
    };
    m.do_match()
}

#[derive(Clone, Copy)]
enum NState {
    PreVisit,
    Visit,
    AltPostVisit,
    PostVisit,
}

impl<'a, M: Machine> Matcher<'a, M> {
    fn do_match(mut self) -> Result<Selection, SelectError> {
        mask_tables(self.machine);
        self.frame_layout()?;

        // Collect roots of matcher trees. Every node not flagged shared
        // can be a valid interior of some tree.
        let root = self.ir.root;
        let top = self.ir.top;
        self.find_shared(root);
        self.find_shared(top);

        let grown = self.ir.num_nodes();
        self.grow_node_arrays(grown);

        let xtop = self.xform(top)?;
        let xroot = self.xform(root)?;
        self.fixup_constant_controls(xroot);

        self.validate_null_checks();
        self.fixup_save_on_entry(xroot)?;

        if trace_enabled!() {
            trace!(
                "selection produced {} machine nodes for {} ideal nodes",
                self.graph.len(),
                self.ir.num_nodes()
            );
        }

        self.graph.rebuild_projs();

        let null_checks = core::mem::take(&mut self.null_check_validated);
        Ok(Selection {
            graph: self.graph,
            root: xroot,
            top: xtop,
            node_map: self.node_map,
            proj_list: self.proj_list,
            null_checks,
            exit_rms: self.exit_rms,
            in_arg_limit: self.in_arg_limit.index() as u32,
            out_arg_limit: self.out_arg_limit.index() as u32,
            first_stack_mask: self.first_stack_mask,
            spill_mask: self.spill_mask,
            debug_mask: self.debug_mask,
        })
    }

    fn grow_node_arrays(&mut self, n: usize) {
        self.visited.resize(n, false);
        self.shared.resize(n, false);
        self.dontcare.resize(n, false);
        self.address_visited.resize(n, false);
        self.node_map.resize(n, MachRef::None);
        self.shared_constants.resize(n, None);
    }

    // ----------------------------------------------------------------
    // Frame layout

    fn frame_layout(&mut self) -> Result<(), SelectError> {
        self.return_addr_mask = self.machine.return_addr_mask();
        self.c_frame_ptr_mask = RegMask::single(self.machine.frame_pointer());
        if let Some(k) = self.ir.sig.ret {
            self.return_value_mask = RegMask::single(self.machine.return_value(k));
        }

        // The old incoming stack pointer, past the preserve area.
        self.old_sp = self.machine.stack2reg(self.machine.in_preserve_slots());
        self.in_arg_limit = self
            .old_sp
            .add(self.machine.out_preserve_slots() as usize);

        let mut locs = vec![];
        self.machine.calling_convention(&self.ir.sig, &mut locs);
        debug_assert_eq!(locs.len(), self.ir.sig.args.len());

        self.parm_regs = vec![None; locs.len()];
        self.calling_convention_mask = vec![RegMask::EMPTY; locs.len()];
        for (i, loc) in locs.iter().enumerate() {
            let reg = match *loc {
                ParmLoc::None => continue,
                ParmLoc::Reg(r) => r,
                ParmLoc::Stack(slot) => {
                    // Stack args come as slot counts; bias into the
                    // allocator's numbering past the preserve areas.
                    let warped = self
                        .old_sp
                        .add(slot as usize)
                        .add(self.machine.out_preserve_slots() as usize);
                    if warped.index() >= self.in_arg_limit.index() {
                        self.in_arg_limit = warped.add(1);
                    }
                    if !RegMask::can_represent(warped) {
                        return Err(SelectError::IncomingCallingSequence);
                    }
                    warped
                }
            };
            self.calling_convention_mask[i].insert(reg);
            self.parm_regs[i] = Some(reg);
        }

        self.new_sp = self.in_arg_limit;
        self.out_arg_limit = self
            .new_sp
            .add(self.machine.out_preserve_slots() as usize);
        if !RegMask::can_represent(PReg::new(self.out_arg_limit.index().saturating_sub(1))) {
            return Err(SelectError::OutgoingCallingSequence);
        }
        Ok(())
    }

    // ----------------------------------------------------------------
    // Shared-node analysis

    fn find_shared(&mut self, root: NodeId) {
        let mut mstack: Vec<(NodeId, NState)> = vec![(root, NState::Visit)];
        loop {
            let (n, state) = match mstack.last() {
                Some(&(n, st)) => (n, st),
                None => break,
            };
            match state {
                NState::PreVisit => {
                    if self.address_visited[n.index()] {
                        // Consumed by an address expression and now seen
                        // again: shared after all.
                        self.visited[n.index()] = true;
                    }
                    if self.visited[n.index()] {
                        self.shared[n.index()] = true;
                        mstack.pop();
                        continue;
                    }
                    mstack.last_mut().unwrap().1 = NState::Visit;
                }
                NState::Visit => {
                    mstack.last_mut().unwrap().1 = NState::PostVisit;
                    self.visited[n.index()] = true;
                    let op = self.ir.op(n);
                    let mut mem_op = false;
                    match op {
                        // Handled specially during matching.
                        Op::Phi | Op::Parm | Op::Proj => {
                            self.shared[n.index()] = true;
                            self.dontcare[n.index()] = true;
                        }
                        Op::If => {
                            // Rewrite (If (Bool (Cmp a b))) so the Bool
                            // and Cmp sit side by side: the matcher can
                            // only reach constants at tree leaves, and the
                            // Bool's condition acts as one.
                            mstack.last_mut().unwrap().1 = NState::AltPostVisit;
                            let bol = self.ir.input(n, 1);
                            let ctrl = self.ir.input(n, 0);
                            mstack.push((bol, NState::Visit));
                            if ctrl.is_valid() {
                                mstack.push((ctrl, NState::PreVisit));
                            }
                            continue;
                        }
                        Op::IfTrue
                        | Op::IfFalse
                        | Op::JumpProj
                        | Op::MergeMem
                        | Op::Goto
                        | Op::Region
                        | Op::Root
                        | Op::Start
                        | Op::Top => {
                            self.dontcare[n.index()] = true;
                        }
                        Op::Jump => {
                            // Multiway dispatch: the switch value stands
                            // alone.
                            let val = self.ir.input(n, 1);
                            let ctrl = self.ir.input(n, 0);
                            mstack.push((val, NState::Visit));
                            if ctrl.is_valid() {
                                mstack.push((ctrl, NState::PreVisit));
                            }
                            continue;
                        }
                        Op::Binary => {
                            debug_assert!(false, "Binary introduced post-visit only");
                        }
                        op if op.is_store() || op == Op::SafePoint => {
                            mem_op = true;
                        }
                        op if op.is_load() => {
                            mem_op = true;
                            // Must root its own tree if loads may not be
                            // speculatively absorbed.
                            if !self.opts.subsume_loads {
                                self.shared[n.index()] = true;
                            }
                        }
                        op if op.is_con() || op.is_call() || op.is_exit() => {}
                        _ => {
                            if !self.ir.node(n).ideal.is_reg()
                                && !matches!(op, Op::Bool | Op::CMoveI)
                            {
                                self.dontcare[n.index()] = true;
                            }
                        }
                    }

                    for i in (0..self.ir.req(n)).rev() {
                        let m = self.ir.input(n, i);
                        if m.is_invalid() {
                            continue;
                        }
                        let mop = self.ir.op(m);

                        // Producers of flags must be cloned beside every
                        // consumer or the allocator would have to move
                        // flags between register files.
                        if self.rules.must_clone(mop) {
                            mstack.push((m, NState::Visit));
                            continue;
                        }

                        // Addressing expressions fold into most memory
                        // instructions for free; keep them out of the
                        // shared marking unless some other use surfaces.
                        if mem_op
                            && i == mem::ADDRESS
                            && mop == Op::AddP
                            && !self.visited[m.index()]
                        {
                            let off = self.ir.input(m, addp::OFFSET);
                            if off.is_valid() && self.ir.op(off).is_con() {
                                self.address_visited[m.index()] = true;
                                mstack.push((self.ir.input(m, addp::BASE), NState::PreVisit));
                                mstack.push((self.ir.input(m, addp::ADDRESS), NState::PreVisit));
                                mstack.push((off, NState::Visit));
                                continue;
                            }
                        }

                        mstack.push((m, NState::PreVisit));
                    }
                }
                NState::AltPostVisit => {
                    mstack.pop();
                    // The Bool may be shared, so the Cmp cannot be moved
                    // out of it; both the Bool and the If end up pointing
                    // at the Cmp, and Bool never matches that edge.
                    let cmp = self.ir.input(self.ir.input(n, 1), 1);
                    self.ir.add_input(n, cmp);
                }
                NState::PostVisit => {
                    mstack.pop();
                    if self.ir.op(n) == Op::CMoveI {
                        // Restructure the ternary into nested binary glue
                        // for matching.
                        let bol = self.ir.input(n, 1);
                        let cmp = self.ir.input(bol, 1);
                        let pair1 =
                            self.ir
                                .add(Op::Binary, IdealKind::None, &[NodeId::invalid(), bol, cmp]);
                        self.ir.set_input(n, 1, pair1);
                        let a = self.ir.input(n, 2);
                        let b = self.ir.input(n, 3);
                        let pair2 =
                            self.ir
                                .add(Op::Binary, IdealKind::None, &[NodeId::invalid(), a, b]);
                        self.ir.set_input(n, 2, pair2);
                        self.ir.del_input(n, 3);
                        self.grow_node_arrays(self.ir.num_nodes());
                    }
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // Driver walk

    fn mach_visited_set(&mut self, m: MachId) -> bool {
        if self.mach_visited.len() <= m.index() {
            self.mach_visited.resize(m.index() + 1, false);
        }
        let old = self.mach_visited[m.index()];
        self.mach_visited[m.index()] = true;
        old
    }

    /// Match trees from the ideal graph into machine space, rewriting
    /// child edges as their trees are matched. Explicit work stack: ideal
    /// graphs can be arbitrarily deep.
    fn xform(&mut self, root: NodeId) -> Result<MachId, SelectError> {
        enum XState {
            Visit,
            Post,
        }
        struct Frame {
            n: MachRef,
            state: XState,
            parent: MachId,
            pidx: i32,
        }

        let mut result = MachId::invalid();
        let mut stack = vec![Frame {
            n: MachRef::Ir(root),
            state: XState::Visit,
            parent: MachId::invalid(),
            pidx: 0,
        }];

        while let Some(top) = stack.last_mut() {
            match top.state {
                XState::Visit => {
                    top.state = XState::Post;
                    let oldn_opt = match top.n {
                        MachRef::Ir(o) => Some(o),
                        _ => None,
                    };
                    let m = match top.n {
                        MachRef::Ir(oldn) => {
                            let m = match self.node_map[oldn.index()] {
                                MachRef::Mach(m) => m,
                                _ => {
                                    let m = if !self.dontcare[oldn.index()] {
                                        if self.ir.op(oldn).is_safepoint() {
                                            self.match_sfpt(oldn)?
                                        } else {
                                            self.match_tree(oldn)?
                                        }
                                    } else {
                                        self.clone_dontcare(oldn)
                                    };
                                    self.node_map[oldn.index()] = MachRef::Mach(m);
                                    m
                                }
                            };
                            let top = stack.last_mut().unwrap();
                            top.n = MachRef::Mach(m);
                            m
                        }
                        MachRef::Mach(m) => m,
                        MachRef::None => unreachable!(),
                    };

                    if self.mach_visited_set(m) {
                        continue;
                    }

                    // Carry the ideal node's precedence edges over.
                    if let Some(oldn) = oldn_opt {
                        let precs: SmallVec<[NodeId; 2]> =
                            self.ir.node(oldn).prec.clone();
                        for p in precs {
                            self.graph.inst_mut(m).prec.push(MachRef::Ir(p));
                        }
                    }

                    // Precedence edges go on the stack first: match them
                    // last. Children already in machine space (nested
                    // reductions) are walked too, so their own leaf edges
                    // get rewritten.
                    let precs = self.graph.inst(m).prec.clone();
                    for (j, r) in precs.iter().enumerate() {
                        if !r.is_none() {
                            stack.push(Frame {
                                n: *r,
                                state: XState::Visit,
                                parent: m,
                                pidx: -2 - j as i32,
                            });
                        }
                    }
                    let inputs = self.graph.inst(m).inputs.clone();
                    for (i, r) in inputs.iter().enumerate().rev() {
                        if !r.is_none() {
                            stack.push(Frame {
                                n: *r,
                                state: XState::Visit,
                                parent: m,
                                pidx: i as i32,
                            });
                        }
                    }
                }
                XState::Post => {
                    let m = top.n.as_mach().unwrap();
                    let parent = top.parent;
                    let pidx = top.pidx;
                    stack.pop();
                    if parent.is_valid() {
                        if pidx >= 0 {
                            self.graph.set_input(parent, pidx as usize, MachRef::Mach(m));
                        } else {
                            let slot = (-2 - pidx) as usize;
                            self.graph.inst_mut(parent).prec[slot] = MachRef::Mach(m);
                        }
                    } else {
                        result = m;
                    }
                }
            }
        }
        debug_assert!(result.is_valid());
        Ok(result)
    }

    /// Match one tree: label from the root, pick the cheapest instruction
    /// rule, reduce, and re-attach the edges the matcher ignored.
    pub(crate) fn match_tree(&mut self, n: NodeId) -> Result<MachId, SelectError> {
        let op = self.ir.op(n);
        debug_assert!(op != Op::Phi, "cannot match");
        debug_assert!(op != Op::Region && op != Op::Start, "cannot match");

        self.states.clear();
        self.label_depth = 0;

        // A store root pins every contained load to its own memory state.
        let pinned_mem = if op.is_store() {
            Some(self.ir.input(n, mem::MEMORY))
        } else {
            None
        };

        let sid = self.new_state(n);
        self.label_root(n, sid, self.ir.control(n), pinned_mem)?;

        // The minimum-cost match for the whole tree is found at the root
        // State, over entries whose recorded rule is an instruction.
        let s = self.state(sid);
        let mut best_rule = None;
        let mut best_cost = u32::MAX;
        for i in 0..self.rules.num_operands() {
            if s.valid(i) && s.cost(i) < best_cost && self.rules.is_instruction(s.rule_at(i)) {
                best_cost = s.cost(i);
                best_rule = Some(s.rule_at(i));
            }
        }
        let rule = match best_rule {
            Some(r) => r,
            None => {
                trace!("no instruction rule covers node {}", n.raw_u32());
                return Err(SelectError::NoMatchingRule(n));
            }
        };

        let mut mem_state = pinned_mem;
        let m = self.reduce_inst(sid, rule, &mut mem_state)?;

        // Re-attach matcher-ignored edges at their original positions.
        let cnt = self.ir.req(n);
        let mut start = 1;
        if mem_state.is_some() {
            start = mem::MEMORY + 1;
        }
        if op == Op::AddP {
            debug_assert!(mem_state.is_none());
            start = addp::BASE + 1;
        }
        for i in start..cnt {
            if !op.match_edge(i) {
                let input = self.ir.input(n, i);
                let r = if input.is_valid() {
                    MachRef::Ir(input)
                } else {
                    MachRef::None
                };
                if i < self.graph.inst(m).inputs.len() {
                    self.graph.insert_input(m, i, r);
                } else {
                    self.graph.add_input(m, r);
                }
            }
        }

        Ok(m)
    }

    // ----------------------------------------------------------------
    // Structural nodes

    /// Clone a node the matcher does not care about into machine space.
    fn clone_dontcare(&mut self, n: NodeId) -> MachId {
        let op = self.ir.op(n);
        match op {
            Op::Proj => self.match_proj(n),
            Op::IfTrue | Op::IfFalse | Op::JumpProj => {
                let producer = self.ir.control(n);
                let index = match op {
                    Op::IfTrue => 0,
                    Op::IfFalse => 1,
                    _ => self.ir.node(n).aux,
                };
                let mut inputs: SmallVec<[MachRef; 4]> = SmallVec::new();
                inputs.push(MachRef::Ir(producer));
                let m = self.graph.add(MachInst {
                    kind: MachKind::Proj {
                        index,
                        fat: false,
                        mask: RegMask::EMPTY,
                    },
                    rule: 0,
                    ideal_op: op,
                    ideal: IdealKind::None,
                    opnds: SmallVec::new(),
                    inputs,
                    prec: SmallVec::new(),
                    flags: 0,
                });
                if op != Op::JumpProj {
                    self.collect_null_checks(m, n);
                }
                m
            }
            _ => {
                let node = self.ir.node(n);
                let inputs = node
                    .inputs
                    .iter()
                    .map(|&i| {
                        if i.is_valid() {
                            MachRef::Ir(i)
                        } else {
                            MachRef::None
                        }
                    })
                    .collect();
                self.graph.add(MachInst {
                    kind: MachKind::Ideal(op),
                    rule: 0,
                    ideal_op: op,
                    ideal: node.ideal,
                    opnds: SmallVec::new(),
                    inputs,
                    prec: SmallVec::new(),
                    flags: node.flags,
                })
            }
        }
    }

    /// Convert a value projection into its machine form, giving it the
    /// register mask its producer's convention dictates.
    fn match_proj(&mut self, n: NodeId) -> MachId {
        let producer_ir = self.ir.control(n);
        let index = self.ir.node(n).aux;
        let pop = self.ir.op(producer_ir);

        let mut mask = RegMask::EMPTY;
        let mut ideal = self.ir.node(n).ideal;
        if index >= tf::PARMS as u32 {
            let argi = (index - tf::PARMS as u32) as usize;
            if pop == Op::Start {
                if argi < self.calling_convention_mask.len() {
                    mask = self.calling_convention_mask[argi];
                    ideal = self.ir.sig.args[argi];
                }
            } else if pop.is_call() {
                if let Some(call) = self.ir.node(producer_ir).call.as_ref() {
                    if let Some(k) = call.sig.ret {
                        mask = RegMask::single(self.machine.return_value(k));
                        ideal = k;
                    }
                }
            }
        }

        let mut inputs: SmallVec<[MachRef; 4]> = SmallVec::new();
        inputs.push(MachRef::Ir(producer_ir));
        self.graph.add(MachInst {
            kind: MachKind::Proj {
                index,
                fat: false,
                mask,
            },
            rule: 0,
            ideal_op: Op::Proj,
            ideal,
            opnds: SmallVec::new(),
            inputs,
            prec: SmallVec::new(),
            flags: 0,
        })
    }

    // ----------------------------------------------------------------
    // Implicit null-check candidates

    /// Record a null-check candidate while cloning the not-null control
    /// projection: (IfTrue (If (Bool ne (CmpP ptr NULL)))) or the eq/
    /// IfFalse mirror.
    fn collect_null_checks(&mut self, proj: MachId, old_proj: NodeId) {
        use crate::ir::BoolTest;
        let iff = self.ir.control(old_proj);
        if iff.is_invalid() || self.ir.op(iff) != Op::If {
            return;
        }
        // During matching Ifs have Bool and Cmp side by side.
        let bol = self.ir.input(iff, 1);
        let cmp = self.ir.input(iff, 2);
        if bol.is_invalid() || cmp.is_invalid() || self.ir.op(cmp) != Op::CmpP {
            return;
        }
        let rhs = self.ir.input(cmp, 2);
        if rhs.is_invalid() || self.ir.node(rhs).con != Some(ConValue::P(0)) {
            return;
        }
        let test = self.ir.bool_test(bol);
        let is_true_proj = self.ir.op(old_proj) == Op::IfTrue;
        let want = if is_true_proj {
            BoolTest::Ne
        } else {
            BoolTest::Eq
        };
        if test == want {
            self.null_check_tests
                .push((proj, self.ir.input(cmp, 1)));
        }
    }

    /// Keep only candidates whose tested value became a match-tree root;
    /// a value buried inside some tree cannot carry an implicit check.
    fn validate_null_checks(&mut self) {
        let mut validated = vec![];
        for &(proj, val) in &self.null_check_tests {
            if let MachRef::Mach(mval) = self.node_map[val.index()] {
                validated.push(NullCheckPair { proj, val: mval });
            }
        }
        self.null_check_validated = validated;
    }

    /// Shared constants were matched before the machine root existed;
    /// point their control at it now.
    fn fixup_constant_controls(&mut self, xroot: MachId) {
        for entry in self.shared_constants.iter().flatten() {
            let (_, m) = *entry;
            match self.graph.input(m, 0) {
                MachRef::Ir(n) if n == self.ir.root => {
                    self.graph.set_input(m, 0, MachRef::Mach(xroot));
                }
                _ => {}
            }
        }
    }
}
