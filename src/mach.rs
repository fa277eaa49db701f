//! The machine-instruction graph produced by reduction.
//!
//! Machine instructions are the closed set of shapes the rest of the
//! backend must distinguish; machine-specific variation lives in the rule
//! id and the operand array, not in the node shape. Operand 0 always
//! represents the instruction's own result. Inputs mirror the IR
//! convention: slot 0 is the required control input and, for memory
//! operations, slot 1 is the explicit memory input.
//!
//! During the driver walk, inputs may still point at unreduced IR nodes
//! (`MachRef::Ir`); by the time selection returns every reachable input is
//! a `MachRef::Mach`.

use crate::ir::{CallKind, ConValue, DebugInfo, Op};
use crate::{BlockId, FxHashMap, IdealKind, MachId, NodeId, RegMask, Signature};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachRef {
    None,
    Ir(NodeId),
    Mach(MachId),
}

impl MachRef {
    #[inline(always)]
    pub fn as_mach(self) -> Option<MachId> {
        match self {
            MachRef::Mach(m) => Some(m),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_none(self) -> bool {
        self == MachRef::None
    }
}

/// One machine operand. `oper` names the operand rule from the table;
/// immediates carry their embedded constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachOper {
    pub oper: u32,
    pub con: Option<ConValue>,
}

impl MachOper {
    pub fn new(oper: u32) -> Self {
        MachOper { oper, con: None }
    }

    pub fn with_con(oper: u32, con: Option<ConValue>) -> Self {
        MachOper { oper, con }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ExitKind {
    Return = 0,
    Rethrow = 1,
    Halt = 2,
}

impl ExitKind {
    pub fn from_op(op: Op) -> Option<ExitKind> {
        match op {
            Op::Return => Some(ExitKind::Return),
            Op::Rethrow => Some(ExitKind::Rethrow),
            Op::Halt => Some(ExitKind::Halt),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallTarget {
    pub sig: Signature,
    pub entry: u64,
    pub kind: CallKind,
    /// Outgoing stack slots consumed by this site's arguments.
    pub argsize: u32,
}

/// Safepoint payload shared by calls and non-call safepoints. `in_rms` is
/// this site's private input-mask array; it is immutable once binding
/// completes.
#[derive(Clone, Debug)]
pub struct SafepointData {
    pub in_rms: Vec<RegMask>,
    pub debug: Option<DebugInfo>,
    pub call: Option<CallTarget>,
}

#[derive(Clone, Debug)]
pub enum MachKind {
    /// Ordinary covered instruction.
    Inst,
    /// Constant materialization; eligible for sharing.
    Con,
    /// Projection of a multi-value producer. Fat projections stand for a
    /// register kill set rather than a value.
    Proj {
        index: u32,
        fat: bool,
        mask: RegMask,
    },
    /// Call or non-call safepoint.
    Safepoint(Box<SafepointData>),
    /// Conditional branch.
    If,
    /// Implicit null check: input 1 is the faulting memory op, `vidx` the
    /// index of the checked value within it.
    NullCheck { vidx: u32 },
    /// Function exit; the input-mask array is shared per exit kind.
    Exit(ExitKind),
    /// Register-to-register move inserted by the allocator.
    SpillCopy,
    /// Anti-dependence serialization point. Input 0 optionally holds the
    /// later def; precedence edges carry everything else.
    Pinch,
    /// Unmatched structural node carried through (phi, region, ...).
    Ideal(Op),
}

#[derive(Clone, Debug)]
pub struct MachInst {
    pub kind: MachKind,
    pub rule: u32,
    /// The ideal opcode this instruction covers; drives scheduling
    /// heuristics (memory-op checks, flag producers).
    pub ideal_op: Op,
    pub ideal: IdealKind,
    pub opnds: SmallVec<[MachOper; 4]>,
    pub inputs: SmallVec<[MachRef; 4]>,
    pub prec: SmallVec<[MachRef; 2]>,
    /// Heuristic flags carried over from the covered ideal root.
    pub flags: u8,
}

impl MachInst {
    pub fn is_proj(&self) -> bool {
        matches!(self.kind, MachKind::Proj { .. })
    }

    pub fn is_fat_proj(&self) -> bool {
        matches!(self.kind, MachKind::Proj { fat: true, .. })
    }

    pub fn is_pinch(&self) -> bool {
        matches!(self.kind, MachKind::Pinch)
    }

    pub fn is_con(&self) -> bool {
        matches!(self.kind, MachKind::Con)
    }

    pub fn is_safepoint(&self) -> bool {
        matches!(self.kind, MachKind::Safepoint(_))
    }

    pub fn is_call(&self) -> bool {
        match &self.kind {
            MachKind::Safepoint(data) => data.call.is_some(),
            _ => false,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, MachKind::Exit(_))
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, MachKind::Ideal(Op::Phi) | MachKind::Ideal(Op::Parm))
    }

    pub fn safepoint(&self) -> Option<&SafepointData> {
        match &self.kind {
            MachKind::Safepoint(data) => Some(data),
            _ => None,
        }
    }

    pub fn safepoint_mut(&mut self) -> Option<&mut SafepointData> {
        match &mut self.kind {
            MachKind::Safepoint(data) => Some(data),
            _ => None,
        }
    }

    pub fn input(&self, i: usize) -> MachRef {
        self.inputs.get(i).copied().unwrap_or(MachRef::None)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MachGraph {
    insts: Vec<MachInst>,
    /// Producer-to-projections index; kept explicit so the graph itself
    /// stays acyclic to walk.
    projs: FxHashMap<MachId, SmallVec<[MachId; 2]>>,
}

impl MachGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, inst: MachInst) -> MachId {
        let id = MachId::new(self.insts.len());
        self.insts.push(inst);
        id
    }

    /// Add a projection and register it with its producer (input 0).
    pub fn add_proj(&mut self, of: MachId, index: u32, fat: bool, mask: RegMask) -> MachId {
        let mut inputs = SmallVec::new();
        inputs.push(MachRef::Mach(of));
        let id = self.add(MachInst {
            kind: MachKind::Proj { index, fat, mask },
            rule: 0,
            ideal_op: Op::Proj,
            ideal: IdealKind::None,
            opnds: SmallVec::new(),
            inputs,
            prec: SmallVec::new(),
            flags: 0,
        });
        self.projs.entry(of).or_default().push(id);
        id
    }

    #[inline(always)]
    pub fn inst(&self, id: MachId) -> &MachInst {
        &self.insts[id.index()]
    }

    #[inline(always)]
    pub fn inst_mut(&mut self, id: MachId) -> &mut MachInst {
        &mut self.insts[id.index()]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn input(&self, id: MachId, i: usize) -> MachRef {
        self.insts[id.index()].input(i)
    }

    pub fn set_input(&mut self, id: MachId, i: usize, val: MachRef) {
        let inputs = &mut self.insts[id.index()].inputs;
        while inputs.len() <= i {
            inputs.push(MachRef::None);
        }
        inputs[i] = val;
    }

    pub fn add_input(&mut self, id: MachId, val: MachRef) {
        self.insts[id.index()].inputs.push(val);
    }

    pub fn insert_input(&mut self, id: MachId, i: usize, val: MachRef) {
        let inputs = &mut self.insts[id.index()].inputs;
        while inputs.len() < i {
            inputs.push(MachRef::None);
        }
        inputs.insert(i, val);
    }

    pub fn add_prec(&mut self, id: MachId, val: MachId) {
        self.insts[id.index()].prec.push(MachRef::Mach(val));
    }

    pub fn projs_of(&self, id: MachId) -> &[MachId] {
        self.projs.get(&id).map(|v| &v[..]).unwrap_or(&[])
    }

    /// Rebuild the producer-to-projection index by scanning the graph;
    /// needed once all projection inputs have been resolved to machine
    /// ids.
    pub fn rebuild_projs(&mut self) {
        self.projs.clear();
        for i in 0..self.insts.len() {
            let id = MachId::new(i);
            if self.insts[i].is_proj() {
                if let MachRef::Mach(of) = self.insts[i].input(0) {
                    self.projs.entry(of).or_default().push(id);
                }
            }
        }
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = MachId> {
        (0..self.insts.len()).map(MachId::new)
    }

    /// Does `from` already order itself against `to` through a required or
    /// precedence edge?
    pub fn has_edge(&self, from: MachId, to: MachId) -> bool {
        let inst = &self.insts[from.index()];
        inst.inputs
            .iter()
            .chain(inst.prec.iter())
            .any(|&r| r == MachRef::Mach(to))
    }
}

/// A basic block of machine instructions. The head (entry/phis) and the
/// trailer (branch and its projections) are fixed; scheduling reorders
/// only the middle.
#[derive(Clone, Debug)]
pub struct Block {
    pub insts: Vec<MachId>,
    pub preds: SmallVec<[BlockId; 2]>,
    pub succs: SmallVec<[BlockId; 2]>,
    pub idom: BlockId,
    pub dom_depth: u32,
}

impl Block {
    pub fn new() -> Self {
        Block {
            insts: vec![],
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            idom: BlockId::invalid(),
            dom_depth: 0,
        }
    }

    pub fn end(&self) -> MachId {
        *self.insts.last().unwrap()
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MachCfg {
    pub blocks: Vec<Block>,
    block_of: Vec<BlockId>,
}

impl MachCfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, block: Block) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        for &m in &block.insts {
            self.set_block_of(m, id);
        }
        self.blocks.push(block);
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn block_of(&self, m: MachId) -> BlockId {
        self.block_of
            .get(m.index())
            .copied()
            .unwrap_or_else(BlockId::invalid)
    }

    pub fn set_block_of(&mut self, m: MachId, b: BlockId) {
        if self.block_of.len() <= m.index() {
            self.block_of.resize(m.index() + 1, BlockId::invalid());
        }
        self.block_of[m.index()] = b;
    }

    pub fn find_inst(&self, b: BlockId, m: MachId) -> Option<usize> {
        self.blocks[b.index()].insts.iter().position(|&x| x == m)
    }

    pub fn remove_inst(&mut self, b: BlockId, m: MachId) {
        let insts = &mut self.blocks[b.index()].insts;
        if let Some(pos) = insts.iter().position(|&x| x == m) {
            insts.remove(pos);
        }
    }
}

/// The external register allocator's assignment, viewed by the scheduler.
#[derive(Clone, Debug, Default)]
pub struct RegAssign {
    regs: Vec<crate::PReg>,
}

impl RegAssign {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, m: MachId, reg: crate::PReg) {
        if self.regs.len() <= m.index() {
            self.regs.resize(m.index() + 1, crate::PReg::invalid());
        }
        self.regs[m.index()] = reg;
    }

    pub fn get(&self, m: MachId) -> crate::PReg {
        self.regs
            .get(m.index())
            .copied()
            .unwrap_or_else(crate::PReg::invalid)
    }
}
