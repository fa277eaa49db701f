//! Register anti-dependences.
//!
//! A valid schedule, for each physical register independently, is a cycle
//! of: a def, some uses, some kills (defs with no uses), then the next
//! def. Uses may float relative to each other, as may kills; no use may
//! slide past a kill or def of the same register. Rather than an edge per
//! (use, kill) pair, a pinch point node serializes the sets once more than
//! one is involved, keeping the edge count linear.
//!
//! One bottom-up pass per block: each instruction's defs/kills are
//! processed first, then its uses. The per-register `reg_node` entry holds
//! either the most recent literal def/kill or a pinch node; entries left
//! over from other blocks are recognized by their recorded block and
//! treated as absent. Pinch nodes that a fat projection created but
//! nothing consumed are reclaimed into a free list at block end.

use crate::ir::Op;
use crate::mach::{MachInst, MachKind, MachRef};
use crate::sched::Scheduling;
use crate::{BlockId, Machine, MachId, PReg, SelectError};
use smallvec::SmallVec;

impl<'a, M: Machine> Scheduling<'a, M> {
    /// Add a precedence edge `from` after `to`, skipping duplicates and
    /// self-edges. Edges never land on projections; they move to the
    /// producing instruction.
    fn add_prec_edge_from_to(&mut self, from: MachId, to: MachId) {
        let from = if self.graph.inst(from).is_proj() {
            self.graph
                .input(from, 0)
                .as_mach()
                .expect("projection has a producer")
        } else {
            from
        };
        if from != to && !self.graph.has_edge(from, to) {
            self.graph.add_prec(from, to);
            self.add_out(to, from);
        }
    }

    fn new_pinch(&mut self) -> Result<MachId, SelectError> {
        if let Some(p) = self.pinch_free_list.pop() {
            return Ok(p);
        }
        if self.pinch_count >= self.opts.pinch_limit {
            // Degrade gracefully: too many def-use pinch points.
            return Err(SelectError::TooManyPinchPoints);
        }
        self.pinch_count += 1;
        let mut inputs: SmallVec<[MachRef; 4]> = SmallVec::new();
        inputs.push(MachRef::None);
        let p = self.graph.add(MachInst {
            kind: MachKind::Pinch,
            rule: 0,
            ideal_op: Op::Top,
            ideal: crate::IdealKind::None,
            opnds: SmallVec::new(),
            inputs,
            prec: SmallVec::new(),
            flags: 0,
        });
        self.grow_node(p);
        Ok(p)
    }

    /// Replace a literal def/kill entry by a real pinch node. The prior
    /// node is ordered after the pinch; if it was a true def it also
    /// becomes the pinch's later-def marker, so output dependences can be
    /// drawn to kills discovered further up the block.
    fn promote_to_pinch(&mut self, b: BlockId, idx: usize) -> Result<MachId, SelectError> {
        let later = self.reg_node[idx];
        let pinch = self.new_pinch()?;
        self.reg_node[idx] = pinch;
        self.reg_node_block[idx] = b;
        self.add_prec_edge_from_to(later, pinch);
        let prior_is_kill =
            self.outs[later.index()].is_empty() || self.graph.inst(later).is_fat_proj();
        self.graph.set_input(
            pinch,
            0,
            if prior_is_kill {
                MachRef::None
            } else {
                MachRef::Mach(later)
            },
        );
        Ok(pinch)
    }

    /// Record a def or kill of `def_reg` by `def`. A second kill since the
    /// last read materializes a pinch point.
    fn anti_do_def(
        &mut self,
        b: BlockId,
        def: MachId,
        def_reg: PReg,
        is_def: bool,
    ) -> Result<(), SelectError> {
        if !def_reg.is_valid() || def_reg.index() >= self.reg_node.len() {
            // Stores and control flow define no register.
            return Ok(());
        }
        let idx = def_reg.index();
        let pinch = self.reg_node[idx];
        if pinch.is_invalid() || self.reg_node_block[idx] != b || is_def {
            // No pinch point yet, or a true def: it becomes the
            // optimistic pinch point.
            self.reg_node[idx] = def;
            self.reg_node_block[idx] = b;
            return Ok(());
        }

        let kill = def;

        // After some number of kills there may be a later def.
        let mut later_def = MachId::invalid();
        let mut pinch = pinch;
        if !self.graph.inst(pinch).is_pinch() {
            pinch = self.promote_to_pinch(b, idx)?;
        }
        if let MachRef::Mach(ld) = self.graph.input(pinch, 0) {
            later_def = ld;
        }

        // Output dependence from the later def to this kill.
        if later_def.is_valid() {
            self.add_prec_edge_from_to(later_def, kill);
        }

        // If the kill also uses the register, it is forced to be the
        // pinch point itself.
        if self.graph.inst(pinch).is_pinch() {
            let uses_node = if self.graph.inst(kill).is_proj() {
                self.graph.input(kill, 0).as_mach().unwrap()
            } else {
                kill
            };
            let mut is_use_kill = false;
            for i in 1..self.graph.inst(uses_node).inputs.len() {
                if let MachRef::Mach(x) = self.graph.input(uses_node, i) {
                    if self.regs.get(x) == def_reg {
                        is_use_kill = true;
                        break;
                    }
                }
            }
            if is_use_kill {
                self.graph.set_input(pinch, 0, MachRef::None);
                self.replace_pinch_by(pinch, kill);
                self.reg_node[idx] = kill;
                self.reg_node_block[idx] = b;
                return Ok(());
            }
        }

        self.add_prec_edge_from_to(kill, pinch);
        Ok(())
    }

    /// Move a pinch node's anti-dependence edges onto the node replacing
    /// it.
    fn replace_pinch_by(&mut self, pinch: MachId, kill: MachId) {
        let users = std::mem::take(&mut self.outs[pinch.index()]);
        for &u in &users {
            let prec = &mut self.graph.inst_mut(u).prec;
            for r in prec.iter_mut() {
                if *r == MachRef::Mach(pinch) {
                    *r = MachRef::Mach(kill);
                }
            }
            self.outs[kill.index()].push(u);
        }
    }

    /// Record a use of `use_reg` by `user`: order it before the next
    /// def/kill of the register. Uses always route through a pinch node,
    /// never directly to the def; a register's unrelated uses and defs
    /// stay unserialized.
    fn anti_do_use(
        &mut self,
        b: BlockId,
        user: MachId,
        use_reg: PReg,
    ) -> Result<(), SelectError> {
        if !use_reg.is_valid() || use_reg.index() >= self.reg_node.len() {
            return Ok(());
        }
        let idx = use_reg.index();
        let mut pinch = self.reg_node[idx];
        if pinch.is_invalid() || self.reg_node_block[idx] != b {
            // No later def/kill in this block.
            return Ok(());
        }
        if self.cfg.block_of(user) != b {
            return Ok(());
        }
        if !self.graph.inst(pinch).is_pinch() {
            pinch = self.promote_to_pinch(b, idx)?;
        }
        if self.cfg.block_of(pinch) != b {
            // First consumer: place the pinch in the block just after the
            // last use. The later-def marker stays; dependency counting
            // ignores a pinch's ordinary inputs.
            let pos = self
                .cfg
                .find_inst(b, user)
                .map(|p| p + 1)
                .unwrap_or_else(|| self.cfg.block(b).insts.len());
            self.cfg.block_mut(b).insts.insert(pos, pinch);
            self.cfg.set_block_of(pinch, b);
        }
        self.add_prec_edge_from_to(pinch, user);
        Ok(())
    }

    /// Insert anti-dependences between reads and following writes of
    /// allocated registers, walking the block bottom-up.
    pub(crate) fn compute_register_antidependencies(
        &mut self,
        b: BlockId,
    ) -> Result<(), SelectError> {
        let nodes = self.cfg.block(b).insts.clone();
        let mut fat_proj_seen = false;

        for &n in nodes.iter().rev() {
            let inst = self.graph.inst(n);
            if matches!(inst.kind, MachKind::Ideal(_)) {
                continue;
            }
            // A def has uses prior to any precedence edges we add; a kill
            // does not.
            let is_def = !self.outs[n.index()].is_empty();

            if inst.is_fat_proj() {
                // A fat projection kills a slew of registers at once.
                fat_proj_seen = true;
                let mask = match &self.graph.inst(n).kind {
                    MachKind::Proj { mask, .. } => *mask,
                    _ => unreachable!(),
                };
                for kill in mask.iter() {
                    self.anti_do_def(b, n, kill, is_def)?;
                }
            } else {
                self.anti_do_def(b, n, self.regs.get(n), is_def)?;
            }

            // Each register this instruction reads must not see a later
            // def/kill scheduled before the read completes.
            for i in 0..self.graph.inst(n).inputs.len() {
                if let MachRef::Mach(def) = self.graph.input(n, i) {
                    debug_assert!(!self.graph.inst(def).is_fat_proj());
                    self.anti_do_use(b, n, self.regs.get(def))?;
                }
            }
        }

        if fat_proj_seen {
            // Most pinch nodes a call's kill set creates are never wired
            // in; recycle them for later blocks.
            self.garbage_collect_pinch_nodes(b);
        }
        Ok(())
    }

    fn garbage_collect_pinch_nodes(&mut self, b: BlockId) {
        for k in 0..self.reg_node.len() {
            let pinch = self.reg_node[k];
            if pinch.is_valid()
                && self.reg_node_block[k] == b
                && self.graph.inst(pinch).is_pinch()
                && self.cfg.block_of(pinch) != b
            {
                self.cleanup_pinch(pinch);
                self.pinch_free_list.push(pinch);
                self.reg_node[k] = MachId::invalid();
                self.reg_node_block[k] = BlockId::invalid();
            }
        }
    }

    /// Strip a reclaimed pinch node back to its empty shape for reuse.
    fn cleanup_pinch(&mut self, pinch: MachId) {
        let users = std::mem::take(&mut self.outs[pinch.index()]);
        for &u in &users {
            let prec = &mut self.graph.inst_mut(u).prec;
            prec.retain(|r| *r != MachRef::Mach(pinch));
        }
        let inst = self.graph.inst_mut(pinch);
        inst.prec.clear();
        inst.inputs.clear();
        inst.inputs.push(MachRef::None);
    }
}
