//! Bottom-up labeling of match trees.
//!
//! `label_root` walks one tree of the IR DAG, allocating a `State` per
//! covered node and filling its cost table from the rule table's decision
//! entries. It also decides tree boundaries, the children that must be
//! matched as separate trees and arrive in registers: shared nodes, loads
//! with divergent memory, and children whose control cannot be proven to
//! post-dominate within a bounded scan.

use crate::ir::{mem, Op};
use crate::matcher::Matcher;
use crate::rules::NO_OPER;
use crate::{IdealKind, Machine, NodeId, SelectError, StateId};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub cost: u32,
    pub rule: u32,
}

pub const INVALID_ENTRY: Entry = Entry {
    cost: u32::MAX,
    rule: NO_OPER,
};

/// Per-node labeling state: the covered leaf, up to two child states
/// (ternary operators were decomposed into binary glue beforehand), and
/// the minimum-cost rule per operand id. States live in an arena that is
/// truncated when `match_tree` returns.
pub struct State {
    pub leaf: NodeId,
    pub kids: [StateId; 2],
    pub table: Box<[Entry]>,
}

impl State {
    pub fn new(leaf: NodeId, num_opers: u32) -> Self {
        State {
            leaf,
            kids: [StateId::invalid(), StateId::invalid()],
            table: vec![INVALID_ENTRY; num_opers as usize].into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn valid(&self, id: u32) -> bool {
        id != NO_OPER && self.table[id as usize].cost != u32::MAX
    }

    #[inline(always)]
    pub fn cost(&self, id: u32) -> u32 {
        self.table[id as usize].cost
    }

    #[inline(always)]
    pub fn rule_at(&self, id: u32) -> u32 {
        self.table[id as usize].rule
    }

    #[inline(always)]
    fn set(&mut self, id: u32, cost: u32, rule: u32) -> bool {
        if id != NO_OPER && cost < self.table[id as usize].cost {
            self.table[id as usize] = Entry { cost, rule };
            true
        } else {
            false
        }
    }
}

impl<'a, M: Machine> Matcher<'a, M> {
    pub(crate) fn new_state(&mut self, leaf: NodeId) -> StateId {
        let id = StateId::new(self.states.len());
        self.states.push(State::new(leaf, self.rules.num_opers()));
        id
    }

    pub(crate) fn state(&self, id: StateId) -> &State {
        &self.states[id.index()]
    }

    /// Label the tree rooted at `n` into `sid`. `control` is the control
    /// adopted for the whole tree so far; the adopted control (possibly
    /// picked up from a child) is returned. `pinned_mem` is the memory
    /// state the tree's root store pins all contained loads to, if any.
    pub(crate) fn label_root(
        &mut self,
        n: NodeId,
        sid: StateId,
        mut control: NodeId,
        pinned_mem: Option<NodeId>,
    ) -> Result<NodeId, SelectError> {
        self.label_depth += 1;
        if self.label_depth > self.opts.max_label_depth {
            return Err(SelectError::LabelDepthExceeded);
        }

        let op = self.ir.op(n);
        let cnt = self.ir.req(n);

        // A child's memory state can only be subsumed if it is not
        // modified along the path to another input; two loads with
        // divergent memory under one root cannot be covered together.
        let mut input_mem = None;
        let mut input_mem_conflict = false;
        for i in 1..cnt {
            if !op.match_edge(i) {
                continue;
            }
            let m = self.ir.input(n, i);
            if m.is_valid() && self.ir.op(m).is_load() {
                let mmem = self.ir.input(m, mem::MEMORY);
                match input_mem {
                    None => input_mem = Some(mmem),
                    Some(prev) if prev != mmem => input_mem_conflict = true,
                    _ => {}
                }
            }
        }

        let mut care = 0;
        for i in 1..cnt {
            if !op.match_edge(i) {
                continue;
            }
            let m = self.ir.input(n, i);
            debug_assert!(m.is_valid(), "expect non-null children");
            let kid = self.new_state(m);
            debug_assert!(care < 2, "binary only");
            self.states[sid.index()].kids[care] = kid;
            care += 1;

            let mop = self.ir.op(m);
            let cut = self.match_into_reg(n, m, control)
                || (pinned_mem.is_some()
                    && mop.is_load()
                    && Some(self.ir.input(m, mem::MEMORY)) != pinned_mem)
                || input_mem_conflict;
            if cut {
                // This value arrives in a register; it cannot be subsumed
                // into the current instruction.
                self.dfa_leaf(kid, self.ir.node(m).ideal);
            } else {
                if control.is_invalid() && self.ir.control(m).is_valid() && self.ir.req(m) > 1 {
                    control = self.ir.control(m);
                }
                control = self.label_root(m, kid, control, pinned_mem)?;
            }
        }

        self.dfa(sid, op)?;
        self.label_depth -= 1;
        Ok(control)
    }

    /// Should child `m` of `n` be cut out of the current tree and matched
    /// into a register of its own?
    fn match_into_reg(&self, _n: NodeId, m: NodeId, control: NodeId) -> bool {
        let mop = self.ir.op(m);
        if mop.is_con() {
            // Never force constants into registers here; identical
            // constants are deduplicated during reduction instead.
            return false;
        }

        // Different controls stop recursion, unless the tree's control
        // post-dominates the child's within a bounded scan. This lets a
        // load float a little above its null check without crossing a
        // merge point.
        let mctrl = self.ir.control(m);
        if control.is_valid() && mctrl.is_valid() && control != mctrl {
            let mut x = control;
            let max_scan = self.opts.dominance_scan_depth;
            let mut j = 0;
            while j < max_scan {
                if self.ir.op(x) == Op::Region {
                    // Bail out at merge points.
                    return true;
                }
                x = self.ir.control(x);
                if x == mctrl {
                    break;
                }
                if x.is_invalid() {
                    return true;
                }
                j += 1;
            }
            if j == max_scan {
                // No post-domination before scan end; break the tree up.
                return true;
            }
        }

        self.shared[m.index()]
    }

    /// Apply the decision table for `op` over the already-labeled child
    /// states, then close over chain rules.
    fn dfa(&mut self, sid: StateId, op: Op) -> Result<(), SelectError> {
        let [k0, k1] = self.states[sid.index()].kids;
        let mut updates: SmallVec<[(u32, u32, u32); 8]> = SmallVec::new();
        for p in self.rules.productions(op) {
            let lcost = match (p.left != NO_OPER, k0.is_valid()) {
                (false, false) => 0,
                (true, true) => {
                    let t = self.state(k0);
                    if !t.valid(p.left) {
                        continue;
                    }
                    t.cost(p.left)
                }
                _ => continue,
            };
            let rcost = match (p.right != NO_OPER, k1.is_valid()) {
                (false, false) => 0,
                (true, true) => {
                    let t = self.state(k1);
                    if !t.valid(p.right) {
                        continue;
                    }
                    t.cost(p.right)
                }
                _ => continue,
            };
            updates.push((p.result, p.cost + lcost + rcost, p.rule));
        }

        let rules = self.rules;
        let s = &mut self.states[sid.index()];
        for (result, cost, rule) in updates {
            s.set(result, cost, rule);
        }
        Self::chain_close(rules, s);

        // A node the table has no entry for is a table bug; the whole
        // compilation must abort code generation for this method.
        if s.table.iter().all(|e| e.cost == u32::MAX) {
            trace!("no table entry for {:?} node {}", op, s.leaf.raw_u32());
            return Err(SelectError::NoTableEntry(s.leaf));
        }
        Ok(())
    }

    /// Label a tree boundary: the child arrives in a register of its ideal
    /// class.
    pub(crate) fn dfa_leaf(&mut self, sid: StateId, kind: IdealKind) {
        let class = self.rules.ideal_class(kind);
        let rules = self.rules;
        let s = &mut self.states[sid.index()];
        s.set(class, 0, class);
        Self::chain_close(rules, s);
    }

    fn chain_close(rules: &crate::rules::RuleTable, s: &mut State) {
        loop {
            let mut changed = false;
            for ch in rules.chains() {
                if s.valid(ch.from) {
                    let cost = s.cost(ch.from).saturating_add(ch.cost);
                    changed |= s.set(ch.to, cost, ch.rule);
                }
            }
            if !changed {
                break;
            }
        }
    }
}
