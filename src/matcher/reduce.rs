//! Reduction of labeled State trees into machine instructions.
//!
//! The root of a match tree is always an instruction. After building it we
//! recurse over the State tree: an operand child is emitted into the
//! operand array and its leaves harvested as data inputs; an internal
//! operand (the interior of a complex addressing form) is walked through
//! without emitting anything; an instruction child is reduced recursively
//! and attached as a data input behind a result-catching operand. Chain
//! rules forward into their one child without an independent instruction
//! for the root.

use crate::ir::{addp, mem, Op};
use crate::mach::{ExitKind, MachInst, MachKind, MachOper, MachRef, SafepointData};
use crate::matcher::Matcher;
use crate::{Machine, MachId, NodeId, SelectError, StateId};
use smallvec::{smallvec, SmallVec};

impl<'a, M: Machine> Matcher<'a, M> {
    /// Reduce a State tree with the given instruction rule into a machine
    /// instruction. `mem_in_out` threads the single memory edge the tree
    /// is allowed to consume.
    pub(crate) fn reduce_inst(
        &mut self,
        sid: StateId,
        rule: u32,
        mem_in_out: &mut Option<NodeId>,
    ) -> Result<MachId, SelectError> {
        debug_assert!(self.rules.is_instruction(rule), "called with operand rule");

        let leaf = self.state(sid).leaf;
        if let Some(shared) = self.find_shared_constant(leaf, rule) {
            return Ok(shared);
        }

        let leaf_op = self.ir.op(leaf);
        let mut inst = MachInst {
            kind: Self::classify(leaf_op),
            rule,
            ideal_op: leaf_op,
            ideal: self.ir.node(leaf).ideal,
            opnds: smallvec![MachOper::new(self.rules.reduce_op(rule))],
            inputs: SmallVec::new(),
            prec: SmallVec::new(),
            flags: self.ir.node(leaf).flags,
        };

        if !self.rules.is_chain_rule(rule) {
            // Instruction: adopt the leaf's control, then fill operands
            // from the tree interior.
            inst.inputs.push(Self::ir_ref(self.ir.control(leaf)));
            self.reduce_inst_interior(sid, rule, mem_in_out, &mut inst, 1)?;
        } else {
            // Chain rules are data-dependent on their inputs only.
            inst.inputs.push(MachRef::None);
            self.reduce_inst_chain_rule(sid, rule, mem_in_out, &mut inst)?;
        }

        // If a memory edge was consumed anywhere in the tree, it becomes
        // the instruction's explicit memory input.
        if let Some(m) = *mem_in_out {
            Self::insert_input_at(&mut inst, mem::MEMORY, Self::ir_ref(m));
        }

        // Address-rooted trees keep their base pointer visible for
        // derived-pointer bookkeeping.
        if leaf_op == Op::AddP {
            Self::insert_input_at(
                &mut inst,
                addp::BASE,
                Self::ir_ref(self.ir.input(leaf, addp::BASE)),
            );
        }

        let id = self.graph.add(inst);

        // One-to-many expansion for instructions with no direct hardware
        // equivalent. The replacement must keep the original's ideal
        // register kind; the superseded instruction is fully disconnected.
        let mut result = id;
        if let Some(expand) = self.rules.expansion(rule) {
            let ex = expand(&mut self.graph, id, &mut self.proj_list);
            if ex != id {
                debug_assert_eq!(
                    self.graph.inst(ex).ideal,
                    self.graph.inst(id).ideal,
                    "expansion must preserve ideal register kind"
                );
                if self.graph.inst(ex).is_con() {
                    let root = self.ir.root;
                    self.graph.set_input(ex, 0, MachRef::Ir(root));
                }
                self.graph.inst_mut(id).inputs.clear();
                result = ex;
            }
        }

        if leaf_op.is_con() {
            self.shared_constants[leaf.index()] = Some((rule, result));
            if let Some(con) = self.ir.node(leaf).con {
                self.shared_con_values.insert((con, rule), result);
            }
        }

        Ok(result)
    }

    fn classify(op: Op) -> MachKind {
        if op.is_con() {
            MachKind::Con
        } else if op.is_safepoint() {
            MachKind::Safepoint(Box::new(SafepointData {
                in_rms: vec![],
                debug: None,
                call: None,
            }))
        } else if op == Op::If {
            MachKind::If
        } else if let Some(kind) = ExitKind::from_op(op) {
            MachKind::Exit(kind)
        } else {
            MachKind::Inst
        }
    }

    #[inline(always)]
    fn ir_ref(n: NodeId) -> MachRef {
        if n.is_valid() {
            MachRef::Ir(n)
        } else {
            MachRef::None
        }
    }

    fn insert_input_at(inst: &mut MachInst, i: usize, val: MachRef) {
        while inst.inputs.len() < i {
            inst.inputs.push(MachRef::None);
        }
        if inst.inputs.len() == i {
            inst.inputs.push(val);
        } else {
            inst.inputs.insert(i, val);
        }
    }

    /// Constants reduced by the same rule share one machine node; the
    /// register allocator is free to split the live range later. Sharing
    /// is keyed both by the original node's identity and by (value, rule),
    /// so equal constants the front end did not value-number still
    /// deduplicate. The shared node's control is (re)attached to the graph
    /// root so it can be scheduled anywhere.
    fn find_shared_constant(&mut self, leaf: NodeId, rule: u32) -> Option<MachId> {
        let node = self.ir.node(leaf);
        if !node.op.is_con() {
            return None;
        }
        let last = match self.shared_constants[leaf.index()] {
            Some((last_rule, last)) if last_rule == rule => last,
            _ => {
                let con = node.con?;
                *self.shared_con_values.get(&(con, rule))?
            }
        };
        let root = self.ir.root;
        match self.graph.input(last, 0) {
            MachRef::None | MachRef::Ir(_) => {
                self.graph.set_input(last, 0, MachRef::Ir(root));
            }
            MachRef::Mach(_) => return None,
        }
        Some(last)
    }

    fn entry_rule(&self, sid: StateId, op: u32) -> Result<u32, SelectError> {
        let s = self.state(sid);
        if !s.valid(op) {
            // Labeled fine but no rule reaches this operand here; a soft
            // failure worth one conservative retry.
            return Err(SelectError::NoMatchingRule(s.leaf));
        }
        Ok(s.rule_at(op))
    }

    /// First constant embedded in the operand's covered subtree; a Bool
    /// leaf embeds its condition.
    fn subtree_con(&self, sid: StateId) -> Option<crate::ir::ConValue> {
        let s = self.state(sid);
        let leaf = self.ir.node(s.leaf);
        if leaf.op == Op::Bool {
            return Some(crate::ir::ConValue::I(leaf.aux as i32));
        }
        if let Some(c) = leaf.con {
            return Some(c);
        }
        for k in s.kids {
            if k.is_valid() {
                if let Some(c) = self.subtree_con(k) {
                    return Some(c);
                }
            }
        }
        None
    }

    fn make_oper(&self, sid: StateId, oper: u32) -> MachOper {
        MachOper::with_con(oper, self.subtree_con(sid))
    }

    /// Walk the interior of an instruction's State tree, emitting operands
    /// and harvesting data inputs in operand order.
    fn reduce_inst_interior(
        &mut self,
        sid: StateId,
        rule: u32,
        mem_in_out: &mut Option<NodeId>,
        inst: &mut MachInst,
        mut num_opnds: usize,
    ) -> Result<usize, SelectError> {
        let leaf = self.state(sid).leaf;
        if self.ir.op(leaf).is_load() {
            let leaf_mem = self.ir.input(leaf, mem::MEMORY);
            debug_assert!(
                mem_in_out.is_none() || *mem_in_out == Some(leaf_mem),
                "multiple memories being matched at once?"
            );
            *mem_in_out = Some(leaf_mem);
        }
        if self.ir.control(leaf).is_valid() && self.ir.req(leaf) > 1 && inst.input(0).is_none() {
            inst.inputs[0] = MachRef::Ir(self.ir.control(leaf));
        }

        for i in 0..2 {
            let kid = self.state(sid).kids[i];
            if kid.is_invalid() {
                break;
            }
            let op = if i == 0 {
                self.rules.left_op(rule)
            } else {
                self.rules.right_op(rule)
            };
            // What the child's reduction will hand me: chase operand
            // classes to the member operand actually matched.
            let opnd_class_instance = self.entry_rule(kid, op)?;
            let catch_op = if self.rules.is_class(op) {
                opnd_class_instance
            } else {
                op
            };
            let newrule = self.entry_rule(kid, catch_op)?;

            if self.rules.is_operand_or_class(newrule) {
                // Operand: emit it, then harvest its leaves.
                let oper = self.make_oper(kid, opnd_class_instance);
                inst.opnds.push(oper);
                num_opnds += 1;
                self.reduce_oper(kid, newrule, mem_in_out, inst)?;
            } else if self.rules.is_operand(newrule) {
                // Interior of a complex operand; nothing to emit.
                num_opnds = self.reduce_inst_interior(kid, newrule, mem_in_out, inst, num_opnds)?;
            } else {
                // Child is a new instruction: emit an operand to catch its
                // result, reduce it with a fresh memory context, attach as
                // a data input.
                inst.opnds
                    .push(MachOper::new(self.rules.reduce_op_any(catch_op)));
                num_opnds += 1;
                let mut kid_mem = None;
                let child = self.reduce_inst(kid, newrule, &mut kid_mem)?;
                inst.inputs.push(MachRef::Mach(child));
            }
            debug_assert!(num_opnds == inst.opnds.len());
        }
        Ok(num_opnds)
    }

    /// Walk a (possibly complex) operand, adding leaf data inputs to the
    /// instruction. Swallowed leaves (embedded immediates) contribute no
    /// input edge.
    fn reduce_oper(
        &mut self,
        sid: StateId,
        rule: u32,
        mem_in_out: &mut Option<NodeId>,
        inst: &mut MachInst,
    ) -> Result<(), SelectError> {
        debug_assert!(self.rules.is_operand(rule), "called with non-operand rule");
        let leaf = self.state(sid).leaf;
        let kid0 = self.state(sid).kids[0];
        debug_assert!(
            kid0.is_invalid() || self.ir.control(leaf).is_invalid(),
            "internal operands have no control"
        );

        if kid0.is_invalid() && !self.rules.swallowed(rule) {
            inst.inputs.push(MachRef::Ir(leaf));
            return Ok(());
        }

        if self.ir.op(leaf).is_load() {
            debug_assert!(
                mem_in_out.is_none(),
                "multiple memories being matched at once?"
            );
            *mem_in_out = Some(self.ir.input(leaf, mem::MEMORY));
        }
        if self.ir.control(leaf).is_valid() && self.ir.req(leaf) > 1 {
            if inst.input(0).is_none() {
                inst.inputs[0] = MachRef::Ir(self.ir.control(leaf));
            } else {
                debug_assert_eq!(
                    inst.inputs[0],
                    MachRef::Ir(self.ir.control(leaf)),
                    "same instruction, differing controls?"
                );
            }
        }

        let mut kid = kid0;
        let mut i = 0;
        while kid.is_valid() && i < 2 {
            let op = if i == 0 {
                self.rules.left_op(rule)
            } else {
                self.rules.right_op(rule)
            };
            let newrule = self.entry_rule(kid, op)?;
            if self.rules.is_operand(newrule) {
                self.reduce_oper(kid, newrule, mem_in_out, inst)?;
            } else {
                let mut kid_mem = None;
                let child = self.reduce_inst(kid, newrule, &mut kid_mem)?;
                inst.inputs.push(MachRef::Mach(child));
            }
            kid = self.state(sid).kids[1];
            i += 1;
        }
        Ok(())
    }

    /// A chain rule forwards straight into the child reduction; the single
    /// catch-all operand records what it receives.
    fn reduce_inst_chain_rule(
        &mut self,
        sid: StateId,
        rule: u32,
        mem_in_out: &mut Option<NodeId>,
        inst: &mut MachInst,
    ) -> Result<(), SelectError> {
        let op = self.rules.left_op(rule);
        let opnd_class_instance = self.entry_rule(sid, op)?;
        let catch_op = if self.rules.is_class(op) {
            opnd_class_instance
        } else {
            op
        };
        let newrule = self.entry_rule(sid, catch_op)?;

        if self.rules.is_operand_or_class(newrule) {
            // Chain from operand or operand class, possibly the output of
            // a shared node.
            let oper = self.make_oper(sid, opnd_class_instance);
            inst.opnds.push(oper);
            self.reduce_oper(sid, newrule, mem_in_out, inst)
        } else {
            // Chain from the result of an instruction.
            debug_assert!(
                self.rules.is_instruction(newrule),
                "do not chain from internal operand"
            );
            inst.opnds
                .push(MachOper::new(self.rules.reduce_op_any(catch_op)));
            let mut kid_mem = None;
            let child = self.reduce_inst(sid, newrule, &mut kid_mem)?;
            inst.inputs.push(MachRef::Mach(child));
            Ok(())
        }
    }
}
