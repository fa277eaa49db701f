//! The reduction-rule table.
//!
//! Instruction selection is driven by a generated decision table: given a
//! node's opcode and the operand ids already proven for its children, the
//! table lists the reductions that apply and their costs. This crate
//! treats the table as data supplied by a machine-description generator;
//! the `RuleTableBuilder` below is the programmatic way to construct one.
//!
//! All operand-like ids live in a single space:
//!
//! - `[0, first_class)`      simple operands (registers, immediates),
//! - `[first_class, num_operands)` operand classes,
//! - `[num_operands, num_opers)`   internal operands of complex
//!   addressing forms,
//! - `[num_opers, num_rules)`      instruction rules.
//!
//! State cost tables are indexed by the first three ranges; instruction
//! rules appear only as the recorded rule achieving an entry. Chain rules
//! are instructions that convert one operand class to another at some cost
//! without changing the value.

use crate::ir::Op;
use crate::mach::MachGraph;
use crate::{FxHashMap, FxHashSet, IdealKind, MachId};
use smallvec::SmallVec;

pub const NO_OPER: u32 = u32::MAX;

/// One entry of the decision table: reducing a node with this opcode
/// (whose children satisfy `left`/`right`) makes `result` valid, recording
/// `rule` at cost `cost` plus the children's costs.
#[derive(Clone, Copy, Debug)]
pub struct Production {
    pub result: u32,
    pub rule: u32,
    pub cost: u32,
    pub left: u32,
    pub right: u32,
}

/// An operand-class conversion applied during table closure. For plain
/// class membership `rule == from` (the member operand id is recorded);
/// for chain-rule instructions `rule` is the instruction id.
#[derive(Clone, Copy, Debug)]
pub struct Chain {
    pub from: u32,
    pub to: u32,
    pub rule: u32,
    pub cost: u32,
}

pub type ExpandFn = fn(&mut MachGraph, MachId, &mut Vec<MachId>) -> MachId;

#[derive(Clone)]
struct OperInfo {
    name: String,
    ideal: IdealKind,
    left: u32,
    right: u32,
    swallowed: bool,
}

#[derive(Clone)]
struct InstInfo {
    name: String,
    result: u32,
    left: u32,
    right: u32,
    chain: bool,
    latency: u32,
    barrier: bool,
    expand: Option<ExpandFn>,
}

pub struct RuleTable {
    opers: Vec<OperInfo>,
    insts: Vec<InstInfo>,
    first_class: u32,
    num_operands: u32,
    num_opers: u32,
    productions: FxHashMap<Op, SmallVec<[Production; 4]>>,
    chains: Vec<Chain>,
    ideal_class: [u32; IdealKind::COUNT],
    must_clone: FxHashSet<Op>,
}

impl RuleTable {
    #[inline(always)]
    pub fn num_opers(&self) -> u32 {
        self.num_opers
    }

    #[inline(always)]
    pub fn num_operands(&self) -> u32 {
        self.num_operands
    }

    #[inline(always)]
    pub fn is_operand(&self, id: u32) -> bool {
        id < self.num_opers
    }

    /// Operand or operand class (not internal, not instruction).
    #[inline(always)]
    pub fn is_operand_or_class(&self, id: u32) -> bool {
        id < self.num_operands
    }

    #[inline(always)]
    pub fn is_class(&self, id: u32) -> bool {
        id >= self.first_class && id < self.num_operands
    }

    #[inline(always)]
    pub fn is_instruction(&self, id: u32) -> bool {
        id != NO_OPER && id >= self.num_opers
    }

    pub fn is_chain_rule(&self, id: u32) -> bool {
        self.is_instruction(id) && self.insts[(id - self.num_opers) as usize].chain
    }

    /// Result operand id generated for an instruction rule's value.
    pub fn reduce_op(&self, rule: u32) -> u32 {
        debug_assert!(self.is_instruction(rule));
        self.insts[(rule - self.num_opers) as usize].result
    }

    /// Like `reduce_op`, but operand ids reduce to themselves.
    pub fn reduce_op_any(&self, id: u32) -> u32 {
        if self.is_instruction(id) {
            self.reduce_op(id)
        } else {
            id
        }
    }

    pub fn left_op(&self, id: u32) -> u32 {
        if self.is_instruction(id) {
            self.insts[(id - self.num_opers) as usize].left
        } else {
            self.opers[id as usize].left
        }
    }

    pub fn right_op(&self, id: u32) -> u32 {
        if self.is_instruction(id) {
            self.insts[(id - self.num_opers) as usize].right
        } else {
            self.opers[id as usize].right
        }
    }

    pub fn swallowed(&self, oper: u32) -> bool {
        self.opers[oper as usize].swallowed
    }

    pub fn oper_ideal(&self, oper: u32) -> IdealKind {
        self.opers[oper as usize].ideal
    }

    pub fn latency(&self, rule: u32) -> u32 {
        if self.is_instruction(rule) {
            self.insts[(rule - self.num_opers) as usize].latency
        } else {
            1
        }
    }

    /// Load-value-barrier-class rule: once ready it must outrank any ready
    /// safepoint during scheduling.
    pub fn is_barrier(&self, rule: u32) -> bool {
        self.is_instruction(rule) && self.insts[(rule - self.num_opers) as usize].barrier
    }

    pub fn expansion(&self, rule: u32) -> Option<ExpandFn> {
        if self.is_instruction(rule) {
            self.insts[(rule - self.num_opers) as usize].expand
        } else {
            None
        }
    }

    /// Flag producers that must stay glued to their consuming branch.
    pub fn must_clone(&self, op: Op) -> bool {
        self.must_clone.contains(&op)
    }

    pub fn productions(&self, op: Op) -> &[Production] {
        self.productions.get(&op).map(|v| &v[..]).unwrap_or(&[])
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    /// Operand class a boundary child of this ideal kind reduces to.
    pub fn ideal_class(&self, k: IdealKind) -> u32 {
        self.ideal_class[k as usize]
    }

    pub fn name(&self, id: u32) -> &str {
        if self.is_instruction(id) {
            &self.insts[(id - self.num_opers) as usize].name
        } else {
            &self.opers[id as usize].name
        }
    }
}

pub struct RuleTableBuilder {
    opers: Vec<OperInfo>,
    insts: Vec<InstInfo>,
    first_class: Option<u32>,
    num_operands: Option<u32>,
    productions: FxHashMap<Op, SmallVec<[Production; 4]>>,
    chains: Vec<Chain>,
    ideal_class: [u32; IdealKind::COUNT],
    must_clone: FxHashSet<Op>,
}

impl RuleTableBuilder {
    pub fn new() -> Self {
        RuleTableBuilder {
            opers: vec![],
            insts: vec![],
            first_class: None,
            num_operands: None,
            productions: FxHashMap::default(),
            chains: vec![],
            ideal_class: [NO_OPER; IdealKind::COUNT],
            must_clone: FxHashSet::default(),
        }
    }

    fn push_oper(&mut self, name: &str, ideal: IdealKind, swallowed: bool) -> u32 {
        let id = self.opers.len() as u32;
        self.opers.push(OperInfo {
            name: name.to_string(),
            ideal,
            left: NO_OPER,
            right: NO_OPER,
            swallowed,
        });
        id
    }

    /// A simple register operand. Must precede all classes.
    pub fn operand(&mut self, name: &str, ideal: IdealKind) -> u32 {
        assert!(self.first_class.is_none(), "operands precede classes");
        assert!(self.insts.is_empty(), "operands precede rules");
        self.push_oper(name, ideal, false)
    }

    /// An immediate operand; its constant is embedded in the operand
    /// rather than becoming a leaf input edge.
    pub fn immediate(&mut self, name: &str) -> u32 {
        assert!(self.first_class.is_none(), "operands precede classes");
        assert!(self.insts.is_empty(), "operands precede rules");
        self.push_oper(name, IdealKind::None, true)
    }

    /// An operand class; members are added with `member`.
    pub fn class(&mut self, name: &str, ideal: IdealKind) -> u32 {
        assert!(self.num_operands.is_none(), "classes precede internals");
        assert!(self.insts.is_empty(), "classes precede rules");
        if self.first_class.is_none() {
            self.first_class = Some(self.opers.len() as u32);
        }
        self.push_oper(name, ideal, false)
    }

    pub fn member(&mut self, class: u32, member: u32) {
        self.chains.push(Chain {
            from: member,
            to: class,
            rule: member,
            cost: 0,
        });
    }

    /// An internal operand: the interior of a complex addressing form.
    pub fn internal(&mut self, name: &str, left: u32, right: u32) -> u32 {
        assert!(self.insts.is_empty(), "internal operands precede rules");
        if self.first_class.is_none() {
            self.first_class = Some(self.opers.len() as u32);
        }
        if self.num_operands.is_none() {
            self.num_operands = Some(self.opers.len() as u32);
        }
        let id = self.push_oper(name, IdealKind::None, false);
        self.opers[id as usize].left = left;
        self.opers[id as usize].right = right;
        id
    }

    fn close_opers(&mut self) {
        if self.first_class.is_none() {
            self.first_class = Some(self.opers.len() as u32);
        }
        if self.num_operands.is_none() {
            self.num_operands = Some(self.opers.len() as u32);
        }
    }

    /// An instruction rule together with its production. `result` is the
    /// operand id for the value it defines; `left`/`right` are the operand
    /// ids expected of the covered children, if any.
    pub fn inst(
        &mut self,
        name: &str,
        op: Op,
        result: u32,
        left: Option<u32>,
        right: Option<u32>,
        cost: u32,
    ) -> u32 {
        self.close_opers();
        let id = self.opers.len() as u32 + self.insts.len() as u32;
        self.insts.push(InstInfo {
            name: name.to_string(),
            result,
            left: left.unwrap_or(NO_OPER),
            right: right.unwrap_or(NO_OPER),
            chain: false,
            latency: 1,
            barrier: false,
            expand: None,
        });
        self.productions.entry(op).or_default().push(Production {
            result,
            rule: id,
            cost,
            left: left.unwrap_or(NO_OPER),
            right: right.unwrap_or(NO_OPER),
        });
        id
    }

    /// A chain rule: converts operand `from` to operand `to` at `cost`
    /// with no independent covered node.
    pub fn chain(&mut self, name: &str, from: u32, to: u32, cost: u32) -> u32 {
        self.close_opers();
        let id = self.opers.len() as u32 + self.insts.len() as u32;
        self.insts.push(InstInfo {
            name: name.to_string(),
            result: to,
            left: from,
            right: NO_OPER,
            chain: true,
            latency: 1,
            barrier: false,
            expand: None,
        });
        self.chains.push(Chain {
            from,
            to,
            rule: id,
            cost,
        });
        id
    }

    /// A leaf production: this opcode directly matches as operand `oper`.
    pub fn leaf(&mut self, op: Op, oper: u32, cost: u32) {
        self.productions.entry(op).or_default().push(Production {
            result: oper,
            rule: oper,
            cost,
            left: NO_OPER,
            right: NO_OPER,
        });
    }

    /// A production for an operand with interior structure (a complex
    /// addressing form); also records the operand's expected children for
    /// reduction.
    pub fn interior(&mut self, op: Op, oper: u32, left: u32, right: u32, cost: u32) {
        self.opers[oper as usize].left = left;
        self.opers[oper as usize].right = right;
        self.productions.entry(op).or_default().push(Production {
            result: oper,
            rule: oper,
            cost,
            left,
            right,
        });
    }

    pub fn set_ideal_class(&mut self, k: IdealKind, class: u32) {
        self.ideal_class[k as usize] = class;
    }

    pub fn set_must_clone(&mut self, op: Op) {
        self.must_clone.insert(op);
    }

    pub fn set_latency(&mut self, rule: u32, latency: u32) {
        let base = self.opers.len() as u32;
        self.insts[(rule - base) as usize].latency = latency;
    }

    pub fn set_barrier(&mut self, rule: u32) {
        let base = self.opers.len() as u32;
        self.insts[(rule - base) as usize].barrier = true;
    }

    pub fn set_expand(&mut self, rule: u32, f: ExpandFn) {
        let base = self.opers.len() as u32;
        self.insts[(rule - base) as usize].expand = Some(f);
    }

    pub fn build(mut self) -> RuleTable {
        self.close_opers();
        let num_opers = self.opers.len() as u32;
        RuleTable {
            opers: self.opers,
            insts: self.insts,
            first_class: self.first_class.unwrap(),
            num_operands: self.num_operands.unwrap(),
            num_opers,
            productions: self.productions,
            chains: self.chains,
            ideal_class: self.ideal_class,
            must_clone: self.must_clone,
        }
    }
}

impl Default for RuleTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}
