//! Implicit null checks.
//!
//! An explicit null test followed by a memory op through the tested
//! pointer can drop the test: the memory op faults on null and the fault
//! handler raises the exception. The memory op is hoisted to the end of
//! the test block and a null-check node replaces the branch; its faulting
//! input performs the test.
//!
//! Hoisting is limited by dominance. Conceptually the hoisted load only
//! defines its value on the not-null arm; hoisting above the
//! post-dominating merge of both arms could leave a use without a def on
//! one path, so merges stop the search. Stores hoist at most one block
//! and never past a load on the same memory state.

use crate::mach::{MachInst, MachKind, MachRef};
use crate::sched::Scheduling;
use crate::{BlockId, Machine, MachId};
use smallvec::SmallVec;

impl<'a, M: Machine> Scheduling<'a, M> {
    fn dominates_block(&self, inb: BlockId, from: BlockId) -> bool {
        let mut bb = from;
        while bb != inb
            && bb.is_valid()
            && self.cfg.block(bb).dom_depth > self.cfg.block(inb).dom_depth
        {
            bb = self.cfg.block(bb).idom;
        }
        bb == inb
    }

    pub(crate) fn implicit_null_check(&mut self, proj: MachId, val: MachId) {
        let iff = match self.graph.input(proj, 0).as_mach() {
            Some(x) => x,
            None => return,
        };
        if !matches!(self.graph.inst(iff).kind, MachKind::If) {
            return;
        }
        let b = self.cfg.block_of(iff);
        if b.is_invalid() {
            return;
        }
        let nodes = self.cfg.block(b).insts.clone();
        let tidx = self.end_idx(&nodes);
        if nodes[tidx] != iff {
            return;
        }

        // Search the users of the tested value for a load or store whose
        // base is the value; there may be several.
        let mut best = MachId::invalid();
        let mut bidx = 0u32;
        let candidates: SmallVec<[MachId; 8]> =
            self.outs[val.index()].iter().copied().collect();
        for mach in candidates {
            let inst = self.graph.inst(mach);
            let iop = inst.ideal_op;
            let was_store = iop.is_store();
            if !iop.is_load() && !was_store {
                continue;
            }
            if matches!(inst.kind, MachKind::Ideal(_) | MachKind::NullCheck { .. }) {
                continue;
            }
            // Stores have their address in slot 2 (memory in slot 1); if
            // the tested value sits elsewhere we are storing it, which
            // does not check it.
            if was_store && self.graph.input(mach, 2) != MachRef::Mach(val) {
                continue;
            }

            // The null check must dominate the memory op's block, and the
            // hoist must not cross a merge. Stores hoist one block only.
            let mb = self.cfg.block_of(mach);
            if mb.is_invalid() {
                continue;
            }
            let mut last_left = mb;
            let mut cb = self.cfg.block(mb).idom;
            if !was_store {
                while cb.is_valid()
                    && self.cfg.block(cb).dom_depth > self.cfg.block(b).dom_depth
                {
                    last_left = cb;
                    cb = self.cfg.block(cb).idom;
                }
            }
            if cb != b {
                continue;
            }
            if self.cfg.block(last_left).preds.len() > 1 {
                continue;
            }

            // Every input of the memory op must dominate the null check.
            let mut vidx = 0u32;
            let mut inputs_ok = true;
            for j in (1..self.graph.inst(mach).inputs.len()).rev() {
                if let MachRef::Mach(x) = self.graph.input(mach, j) {
                    if x == val {
                        vidx = j as u32;
                    }
                    let inb = self.cfg.block_of(x);
                    if inb.is_valid() && !self.dominates_block(inb, b) {
                        inputs_ok = false;
                        break;
                    }
                }
            }
            if !inputs_ok {
                continue;
            }

            // Hoisting a store past an anti-dependent load would reorder
            // memory; give up if any sits in between.
            if was_store {
                let smem = self.graph.input(mach, 1);
                let mut bb = mb;
                let mut blocked = false;
                while bb != b {
                    for &x in &self.cfg.block(bb).insts {
                        let xi = self.graph.inst(x);
                        if xi.ideal_op.is_load() && self.graph.input(x, 1) == smem {
                            blocked = true;
                            break;
                        }
                    }
                    if blocked || self.cfg.block(bb).preds.len() != 1 {
                        blocked = true;
                        break;
                    }
                    bb = self.cfg.block(bb).preds[0];
                }
                if blocked {
                    continue;
                }
            }

            // Not already carrying some other null check.
            let mb_nodes = &self.cfg.block(mb).insts;
            if let Some(&e) = mb_nodes.last() {
                if matches!(self.graph.inst(e).kind, MachKind::NullCheck { .. })
                    && self.graph.input(e, 1) == MachRef::Mach(mach)
                {
                    continue;
                }
            }

            // Pick the candidate highest in the dominator tree; it is
            // closest to the null check.
            if best.is_invalid()
                || self.cfg.block(self.cfg.block_of(mach)).dom_depth
                    < self.cfg.block(self.cfg.block_of(best)).dom_depth
            {
                best = mach;
                bidx = vidx;
            }
        }
        if best.is_invalid() {
            return;
        }
        trace!("implicit null check: node {} covers test {}", best.raw_u32(), iff.raw_u32());

        // Hoist the memory op up to the end of the test block.
        let old_block = self.cfg.block_of(best);
        self.cfg.remove_inst(old_block, best);
        let tpos = self.cfg.find_inst(b, iff).unwrap();
        self.cfg.block_mut(b).insts.insert(tpos, best);
        self.cfg.set_block_of(best, b);

        // The memory op is now control-dependent on the test block.
        let ifctrl = self.graph.input(iff, 0);
        self.graph.set_input(best, 0, ifctrl);

        // Flag-killing projections ride along.
        let projs: SmallVec<[MachId; 2]> = self.graph.projs_of(best).iter().copied().collect();
        for p in projs {
            let pb = self.cfg.block_of(p);
            if pb.is_valid() && pb != b {
                self.cfg.remove_inst(pb, p);
                let pos = self.cfg.find_inst(b, best).unwrap() + 1;
                self.cfg.block_mut(b).insts.insert(pos, p);
                self.cfg.set_block_of(p, b);
            }
        }

        // Null checks always branch-if-eq. Replacing an ne test flips the
        // sense; swap the projections to keep the branch targets.
        let not_null_is_true_proj =
            matches!(self.graph.inst(proj).kind, MachKind::Proj { index: 0, .. });
        if not_null_is_true_proj {
            let insts = &self.cfg.block(b).insts;
            let mut pos: SmallVec<[usize; 2]> = SmallVec::new();
            for (i, &x) in insts.iter().enumerate() {
                if self.graph.inst(x).is_proj()
                    && self.graph.input(x, 0) == MachRef::Mach(iff)
                {
                    pos.push(i);
                }
            }
            if pos.len() == 2 {
                self.cfg.block_mut(b).insts.swap(pos[0], pos[1]);
            }
        }

        // Replace the explicit test with the null-checking memory op.
        let mut inputs: SmallVec<[MachRef; 4]> = SmallVec::new();
        inputs.push(ifctrl);
        inputs.push(MachRef::Mach(best));
        let nc = self.graph.add(MachInst {
            kind: MachKind::NullCheck { vidx: bidx },
            rule: 0,
            ideal_op: crate::ir::Op::If,
            ideal: crate::IdealKind::None,
            opnds: SmallVec::new(),
            inputs,
            prec: SmallVec::new(),
            flags: 0,
        });
        self.grow_node(nc);
        let tpos = self.cfg.find_inst(b, iff).unwrap();
        self.cfg.block_mut(b).insts[tpos] = nc;
        self.cfg.set_block_of(nc, b);

        // Redirect users of the old test, then cut it loose.
        let users: SmallVec<[MachId; 4]> = self.outs[iff.index()].iter().copied().collect();
        for u in users {
            let inst = self.graph.inst_mut(u);
            for r in inst.inputs.iter_mut().chain(inst.prec.iter_mut()) {
                if *r == MachRef::Mach(iff) {
                    *r = MachRef::Mach(nc);
                }
            }
        }
        self.graph.inst_mut(iff).inputs.clear();
        self.graph.rebuild_projs();
    }
}
