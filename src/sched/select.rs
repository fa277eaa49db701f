//! Worklist selection.
//!
//! Projections take top priority for correctness: if one is ready, it is
//! next. Flag producers consumed by the block's branch are held back so
//! they land adjacent to it; consumers of flags go as early as possible.
//! Of the remaining candidates, choose the greatest latency to the end of
//! the block, then the smallest stall (how much of the producer latency
//! is still uncovered), then worklist order.

use crate::ir::Op;
use crate::mach::{MachKind, MachRef};
use crate::sched::Scheduling;
use crate::{BlockId, IdealKind, Machine, MachId};

fn take(worklist: &mut Vec<MachId>, i: usize) -> MachId {
    let n = worklist[i];
    let last = worklist.pop().unwrap();
    if i < worklist.len() {
        worklist[i] = last;
    }
    n
}

impl<'a, M: Machine> Scheduling<'a, M> {
    pub(crate) fn select(
        &mut self,
        b: BlockId,
        worklist: &mut Vec<MachId>,
        terminal: MachId,
        new_order: &[MachId],
    ) -> MachId {
        // If only a single entry on the list, use it.
        if worklist.len() == 1 {
            return take(worklist, 0);
        }

        // The memory op of an implicit null check stays glued to the end
        // of the block.
        let nc_input = match self.graph.inst(terminal).kind {
            MachKind::NullCheck { .. } => self.graph.input(terminal, 1).as_mach(),
            _ => None,
        };

        let mut choice = 0u32; // bigger is most important
        let mut latency = 0u32; // bigger is scheduled first
        let mut score = 0i64; // bigger is better
        let mut idx = 0usize;
        let mut saw_barrier = false;

        for i in 0..worklist.len() {
            // Worklist order breaks remaining ties; see the caller for how
            // induction-variable increments are pushed last.
            let n = worklist[i];
            let inst = self.graph.inst(n);

            if inst.is_proj()
                || inst.is_con()
                || inst.is_pinch()
                || matches!(inst.kind, MachKind::Ideal(Op::Top))
            {
                // Projections always win; so does a constant.
                return take(worklist, i);
            }

            if nc_input == Some(n) {
                continue;
            }

            let mut n_choice = 2;

            // A flag producer consumed by a branch must come last, right
            // next to it.
            if self.rules.must_clone(inst.ideal_op) {
                let mut found_branch = false;
                for &user in &self.outs[n.index()] {
                    if self.cfg.block_of(user) != b {
                        continue;
                    }
                    let ui = self.graph.inst(user);
                    if matches!(ui.kind, MachKind::If | MachKind::NullCheck { .. }) {
                        found_branch = true;
                        break;
                    }
                    // More than this instruction pending for the flag
                    // consumer to be ready; prefer other opportunities.
                    if self.ready_cnt[user.index()] > 1 && ui.ideal == IdealKind::Flags {
                        n_choice = 1;
                    }
                }
                if found_branch {
                    continue;
                }
            }

            // A consumer of freshly set flags goes first.
            for r in &self.graph.inst(n).inputs {
                if let MachRef::Mach(x) = *r {
                    if self.rules.must_clone(self.graph.inst(x).ideal_op) {
                        n_choice = 3;
                        break;
                    }
                }
            }

            // A ready barrier always beats a ready safepoint; the
            // relation is not transitive, so it cannot fold into the
            // plain choice score.
            if self.rules.is_barrier(self.graph.inst(n).rule) {
                saw_barrier = true;
                if self.graph.inst(worklist[idx]).is_safepoint() {
                    n_choice = choice + 1;
                }
            }
            if saw_barrier && self.graph.inst(n).is_safepoint() {
                continue;
            }

            // Latency from here to the end of the block; a longer path is
            // more urgent.
            let n_latency = self.latency[n.index()];

            // Avoid scheduling uses right after their defs until the
            // def/use latency is covered by other work.
            let sched_slot = new_order.len() as i64;
            let mut local_stall = 0i64;
            for r in &self.graph.inst(n).inputs {
                if let MachRef::Mach(x) = *r {
                    if self.cfg.block_of(x) != b {
                        continue;
                    }
                    if let Some(x_slot) = new_order.iter().position(|&y| y == x) {
                        let mut def_lat = self.latency[x.index()] as i64;
                        def_lat -= sched_slot - x_slot as i64;
                        let stall_for_x = def_lat - n_latency as i64;
                        if stall_for_x > local_stall {
                            local_stall = stall_for_x;
                        }
                    }
                }
            }
            let n_score = -local_stall;

            let cur = worklist[idx];
            let better = choice < n_choice
                || (choice == n_choice
                    && (latency < n_latency
                        || (latency == n_latency
                            && (score < n_score
                                || (score == n_score
                                    && !self.next_call[cur.index()]
                                    && self.next_call[n.index()])))));
            if better {
                choice = n_choice;
                latency = n_latency;
                score = n_score;
                idx = i;
            }
        }

        take(worklist, idx)
    }
}
