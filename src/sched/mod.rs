//! Block-local instruction scheduling.
//!
//! Runs once per basic block after the external register allocator has
//! assigned physical registers. Per block: insert register
//! anti-dependences (pinch points), compute latencies to the block end,
//! count block-local dependency edges, then pull from a ready worklist
//! under the selection heuristics until every schedulable instruction is
//! placed. The block head (phis, parameters) and the trailer (terminal
//! branch/exit and its projections) are pinned.
//!
//! Calls schedule their projections with them, in one step: a call's
//! results appear in fixed registers the instant it returns, so nothing
//! may come between the call and its projections.

use crate::ir::Op;
use crate::mach::{MachCfg, MachGraph, MachKind, MachRef, RegAssign};
use crate::matcher::Selection;
use crate::regmask::RM_CAPACITY;
use crate::rules::RuleTable;
use crate::{BlockId, Machine, MachId, Options, SelectError};
use smallvec::SmallVec;

mod antidep;
mod nullcheck;
mod select;

pub(crate) struct Scheduling<'a, M: Machine> {
    pub(crate) graph: &'a mut MachGraph,
    pub(crate) cfg: &'a mut MachCfg,
    pub(crate) regs: &'a RegAssign,
    pub(crate) machine: &'a M,
    pub(crate) rules: &'a RuleTable,
    pub(crate) opts: &'a Options,

    /// Data+precedence users per machine node.
    pub(crate) outs: Vec<SmallVec<[MachId; 4]>>,
    /// Latency to the end of the enclosing block.
    pub(crate) latency: Vec<u32>,
    /// Remaining block-local dependency edges per node; ready at zero.
    pub(crate) ready_cnt: Vec<i32>,
    /// Nodes needed to set up the next call in the block.
    pub(crate) next_call: Vec<bool>,

    // Anti-dependence state: per physical register, the current pinch
    // point and the block it was recorded in.
    pub(crate) reg_node: Vec<MachId>,
    pub(crate) reg_node_block: Vec<BlockId>,
    pub(crate) pinch_free_list: Vec<MachId>,
    pub(crate) pinch_count: u32,
}

/// Order every block's instructions. `sel` carries the machine graph and
/// the implicit-null-check candidates from selection; `regs` is the
/// external allocator's register assignment.
pub fn schedule<M: Machine>(
    sel: &mut Selection,
    cfg: &mut MachCfg,
    regs: &RegAssign,
    machine: &M,
    rules: &RuleTable,
    opts: &Options,
) -> Result<(), SelectError> {
    let null_checks = sel.null_checks.clone();
    let mut s = Scheduling {
        graph: &mut sel.graph,
        cfg,
        regs,
        machine,
        rules,
        opts,
        outs: vec![],
        latency: vec![],
        ready_cnt: vec![],
        next_call: vec![],
        reg_node: vec![MachId::invalid(); RM_CAPACITY],
        reg_node_block: vec![BlockId::invalid(); RM_CAPACITY],
        pinch_free_list: vec![],
        pinch_count: 0,
    };

    if opts.implicit_null_checks {
        s.build_outs();
        for pair in &null_checks {
            s.implicit_null_check(pair.proj, pair.val);
        }
    }

    s.build_outs();
    s.do_scheduling()
}

impl<'a, M: Machine> Scheduling<'a, M> {
    pub(crate) fn build_outs(&mut self) {
        let n = self.graph.len();
        self.outs = vec![SmallVec::new(); n];
        for id in self.graph.iter_ids() {
            let inst = self.graph.inst(id);
            for r in inst.inputs.iter().chain(inst.prec.iter()) {
                if let MachRef::Mach(d) = *r {
                    self.outs[d.index()].push(id);
                }
            }
        }
        self.latency = vec![0; n];
        self.ready_cnt = vec![0; n];
        self.next_call = vec![false; n];
    }

    pub(crate) fn grow_node(&mut self, m: MachId) {
        let n = m.index() + 1;
        if self.outs.len() < n {
            self.outs.resize(n, SmallVec::new());
            self.latency.resize(n, 0);
            self.ready_cnt.resize(n, 0);
            self.next_call.resize(n, false);
        }
    }

    /// Record `user` as consuming `def`, mirroring a just-added precedence
    /// edge.
    pub(crate) fn add_out(&mut self, def: MachId, user: MachId) {
        self.grow_node(def);
        self.grow_node(user);
        self.outs[def.index()].push(user);
    }

    fn do_scheduling(&mut self) -> Result<(), SelectError> {
        for i in (0..self.cfg.blocks.len()).rev() {
            let b = BlockId::new(i);
            if self.cfg.block(b).insts.len() <= 1 {
                continue;
            }
            self.compute_register_antidependencies(b)?;
            self.schedule_block(b)?;
        }
        Ok(())
    }

    /// Index of the block terminal: the last instruction that is not a
    /// trailing projection.
    fn end_idx(&self, nodes: &[MachId]) -> usize {
        let mut e = nodes.len() - 1;
        while e > 0 && self.graph.inst(nodes[e]).is_proj() {
            e -= 1;
        }
        e
    }

    fn is_prescheduled(&self, m: MachId) -> bool {
        match &self.graph.inst(m).kind {
            MachKind::Ideal(op) => matches!(
                op,
                Op::Phi | Op::Parm | Op::Region | Op::Top | Op::Start | Op::Root
            ),
            MachKind::Proj { .. } => {
                // Head projections (incoming parameters) never enter the
                // counting; call projections are handled with their call.
                match self.graph.inst(m).input(0) {
                    MachRef::Mach(p) => !self.graph.inst(p).is_call(),
                    _ => true,
                }
            }
            MachKind::Con => false,
            _ => false,
        }
    }

    /// Latency from each instruction to the end of its block: longest
    /// accumulated producer-to-consumer latency over block-local users.
    fn compute_local_latencies(&mut self, b: BlockId, nodes: &[MachId]) {
        for &n in nodes.iter().rev() {
            let inst = self.graph.inst(n);
            let base = if inst.is_proj() || inst.is_pinch() {
                0
            } else {
                self.rules.latency(inst.rule)
            };
            let mut use_max = 0;
            for &m in &self.outs[n.index()] {
                if self.cfg.block_of(m) == b {
                    use_max = use_max.max(self.latency[m.index()]);
                }
            }
            self.latency[n.index()] = base + use_max;
        }
        if trace_enabled!() {
            for &n in nodes {
                trace!("# latency {:4}: node {}", self.latency[n.index()], n.raw_u32());
            }
        }
    }

    /// One block: seed ready counts, pull from the worklist, verify the
    /// schedule covers exactly the schedulable range, write back.
    fn schedule_block(&mut self, b: BlockId) -> Result<(), SelectError> {
        let mut nodes = self.cfg.block(b).insts.clone();
        let node_cnt = self.end_idx(&nodes);

        self.compute_local_latencies(b, &nodes);

        // Move phis and parameter projections up to the block start; count
        // block-local dependency edges for everything else.
        let mut phi_cnt = 0;
        for i in 0..node_cnt {
            let n = nodes[i];
            if self.is_prescheduled(n) {
                nodes[i] = nodes[phi_cnt];
                nodes[phi_cnt] = n;
                phi_cnt += 1;
            } else {
                let inst = self.graph.inst(n);
                let mut local = 0;
                // A pinch node's ordinary input is only the later-def
                // marker, not a dependency.
                let req = if inst.is_pinch() { &[][..] } else { &inst.inputs[..] };
                for r in req.iter().chain(inst.prec.iter()) {
                    if let MachRef::Mach(m) = *r {
                        if self.cfg.block_of(m) == b
                            && !matches!(self.graph.inst(m).kind, MachKind::Ideal(Op::Top))
                        {
                            local += 1;
                        }
                    }
                }
                self.ready_cnt[n.index()] = local;
            }
        }
        // Trailing guys get a zapped count: decrementing them below zero
        // keeps them off the worklist for good.
        for &n in &nodes[node_cnt..] {
            self.ready_cnt[n.index()] = 0;
        }

        // The prescheduled head does not hold back internal nodes.
        for i in 0..phi_cnt {
            let n = nodes[i];
            for j in 0..self.outs[n.index()].len() {
                let m = self.outs[n.index()][j];
                if self.cfg.block_of(m) == b {
                    self.ready_cnt[m.index()] -= 1;
                }
            }
        }

        // Seed the worklist. Induction-variable increments go last so
        // other uses of the phi schedule first; select() breaks ties by
        // worklist order.
        let mut worklist: Vec<MachId> = vec![];
        let mut delay: Vec<MachId> = vec![];
        for &n in &nodes[phi_cnt..node_cnt] {
            if self.ready_cnt[n.index()] == 0 {
                if self.is_iterative(n) {
                    delay.push(n);
                } else {
                    worklist.push(n);
                }
            }
        }
        while let Some(d) = delay.pop() {
            worklist.push(d);
        }

        // Warm up the next-call bits.
        self.needed_for_next_call(b, nodes[0]);

        let terminal = nodes[node_cnt];
        let mut new_order: Vec<MachId> = nodes[..phi_cnt].to_vec();
        while !worklist.is_empty() {
            let n = self.select(b, &mut worklist, terminal, &new_order);
            trace!("# select node {}", n.raw_u32());
            new_order.push(n);
            if self.graph.inst(n).is_call() {
                self.sched_call(b, &mut worklist, &mut new_order, n);
            } else {
                self.decrement_use_counts(b, &mut worklist, n);
            }
        }

        if new_order.len() != node_cnt {
            // Did not schedule all: either a prior bug, or speculative
            // load absorption built an unschedulable shape. Retry the
            // method conservatively, else give up on it.
            trace!(
                "scheduled {} of {} in block {}",
                new_order.len(),
                node_cnt,
                b.raw_u32()
            );
            return Err(SelectError::ScheduleMismatch {
                block: b,
                retryable: self.opts.subsume_loads,
            });
        }

        new_order.extend_from_slice(&nodes[node_cnt..]);
        self.cfg.block_mut(b).insts = new_order;
        Ok(())
    }

    fn is_iterative(&self, n: MachId) -> bool {
        self.graph.inst(n).flags & crate::ir::flags::ITERATIVE != 0
    }

    /// Upon selecting a call, schedule all of its projections with it
    /// before any other ready node.
    fn sched_call(
        &mut self,
        b: BlockId,
        worklist: &mut Vec<MachId>,
        new_order: &mut Vec<MachId>,
        mcall: MachId,
    ) {
        let mut projs: SmallVec<[MachId; 4]> = self
            .graph
            .projs_of(mcall)
            .iter()
            .copied()
            .filter(|&p| self.cfg.block_of(p) == b)
            .collect();
        projs.sort_by_key(|&p| match self.graph.inst(p).kind {
            MachKind::Proj { index, .. } => index,
            _ => u32::MAX,
        });

        for &proj in &projs {
            self.ready_cnt[proj.index()] -= 1;
            debug_assert!(self.ready_cnt[proj.index()] <= 0);
            new_order.push(proj);
            // The control projection starts the countdown to the next
            // call.
            if self.graph.inst(proj).ideal == crate::IdealKind::None
                && !self.graph.inst(proj).is_fat_proj()
            {
                self.needed_for_next_call(b, proj);
            }
            for j in 0..self.outs[proj.index()].len() {
                let m = self.outs[proj.index()][j];
                if self.cfg.block_of(m) != b || self.graph.inst(m).is_phi() {
                    continue;
                }
                self.ready_cnt[m.index()] -= 1;
                if self.ready_cnt[m.index()] == 0 {
                    worklist.push(m);
                }
            }
        }

        // Anything hanging off the call through a precedence edge is
        // released by the call itself, not a projection.
        for j in 0..self.outs[mcall.index()].len() {
            let m = self.outs[mcall.index()][j];
            if self.cfg.block_of(m) != b
                || self.graph.inst(m).is_phi()
                || self.graph.inst(m).is_proj()
            {
                continue;
            }
            self.ready_cnt[m.index()] -= 1;
            if self.ready_cnt[m.index()] == 0 {
                worklist.push(m);
            }
        }
    }

    /// Walk all users of a newly scheduled node; anything whose last
    /// block-local dependency this was becomes available.
    fn decrement_use_counts(&mut self, b: BlockId, worklist: &mut Vec<MachId>, n: MachId) {
        for j in 0..self.outs[n.index()].len() {
            let m = self.outs[n.index()][j];
            if self.cfg.block_of(m) != b || self.graph.inst(m).is_phi() {
                continue;
            }
            self.ready_cnt[m.index()] -= 1;
            if self.ready_cnt[m.index()] == 0 {
                worklist.push(m);
            }
        }
    }

    /// Bias scheduling so nodes feeding the next call get priority; this
    /// keeps unrelated values from being carried live across the call.
    fn needed_for_next_call(&mut self, b: BlockId, this_call: MachId) {
        let mut call = MachId::invalid();
        for &m in &self.outs[this_call.index()] {
            if self.cfg.block_of(m) == b && m != this_call && self.graph.inst(m).is_call() {
                call = m;
                break;
            }
        }
        if call.is_invalid() {
            return;
        }
        self.set_next_call(b, call);
    }

    fn set_next_call(&mut self, b: BlockId, n: MachId) {
        let mut stack = vec![n];
        while let Some(x) = stack.pop() {
            if self.next_call[x.index()] {
                continue;
            }
            self.next_call[x.index()] = true;
            let inst = self.graph.inst(x);
            for r in inst.inputs.iter().chain(inst.prec.iter()) {
                if let MachRef::Mach(m) = *r {
                    if self.cfg.block_of(m) == b {
                        stack.push(m);
                    }
                }
            }
        }
    }
}
