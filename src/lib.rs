/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Tree-covering instruction selection and block-local scheduling for a
//! JIT compiler backend. The input is a target-independent IR graph plus a
//! machine description (a decision table of reduction rules and a calling
//! convention); the output is a machine-instruction graph with register
//! masks. After an external register allocator has run, a second entry
//! point produces a legal per-block instruction order with register
//! anti-dependences enforced.

#![allow(dead_code)]

// Detailed logging; compiles to nothing unless the `trace-log` feature is
// enabled.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

#[macro_use]
mod index;
pub use index::{BlockId, MachId, NodeId, StateId};

pub(crate) type FxHashMap<K, V> =
    hashbrown::HashMap<K, V, core::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
pub(crate) type FxHashSet<T> =
    hashbrown::HashSet<T, core::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

pub mod ir;
pub mod mach;
pub mod matcher;
pub mod regmask;
pub mod rules;
pub mod sched;

pub use mach::{Block, MachCfg, MachGraph, MachInst, MachKind, MachOper, MachRef, RegAssign};
pub use matcher::Selection;
pub use regmask::{RegMask, RM_CAPACITY};
pub use rules::{RuleTable, RuleTableBuilder};
pub use sched::schedule;

/// Machine value classes ("ideal registers"). Every matchable node and
/// every register operand has one; it selects the canonical register and
/// spill masks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum IdealKind {
    /// Not a machine value (control, memory, i/o).
    None = 0,
    I = 1,
    L = 2,
    F = 3,
    D = 4,
    P = 5,
    /// Condition codes; never spilled.
    Flags = 6,
}

impl IdealKind {
    pub const COUNT: usize = 7;

    pub fn is_reg(self) -> bool {
        !matches!(self, IdealKind::None)
    }
}

/// A physical register in the unified numbering: indices below the
/// machine's register count are hardware registers, everything above is a
/// stack slot. Stack slots behave like a very large register set: uniquely
/// named, never aliased.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct PReg(u32);

impl PReg {
    #[inline(always)]
    pub fn new(index: usize) -> Self {
        PReg(index as u32)
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        debug_assert!(self.is_valid());
        self.0 as usize
    }

    #[inline(always)]
    pub fn invalid() -> Self {
        PReg(u32::MAX)
    }

    #[inline(always)]
    pub fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    #[inline(always)]
    pub fn is_invalid(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline(always)]
    pub fn add(self, offset: usize) -> Self {
        debug_assert!(self.is_valid());
        PReg(self.0 + offset as u32)
    }
}

impl core::fmt::Debug for PReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if self.is_valid() {
            write!(f, "p{}", self.0)
        } else {
            write!(f, "p<bad>")
        }
    }
}

impl core::fmt::Display for PReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Save policy of a physical register, from the target description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SavePolicy {
    /// Caller's problem; freely clobbered.
    NoSave,
    /// Save-on-call: clobbered by calls.
    SaveOnCall,
    /// Save-on-entry: callee-saved, preserved to every exit.
    SaveOnEntry,
    /// Always saved (save-on-entry and excluded from debug info).
    AlwaysSave,
}

impl SavePolicy {
    pub fn is_save_on_entry(self) -> bool {
        matches!(self, SavePolicy::SaveOnEntry | SavePolicy::AlwaysSave)
    }

    pub fn is_save_on_call(self) -> bool {
        matches!(self, SavePolicy::SaveOnCall | SavePolicy::AlwaysSave)
    }
}

/// Where the calling convention places one argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParmLoc {
    /// Unplaced (e.g. the second half of a two-slot value).
    None,
    Reg(PReg),
    /// Slot count relative to the outgoing argument area.
    Stack(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Signature {
    pub args: Vec<IdealKind>,
    pub ret: Option<IdealKind>,
}

/// The target machine description, as far as this core needs it. The rule
/// table carries the instruction set; this trait carries register counts,
/// save policies and the calling convention.
pub trait Machine {
    /// Number of hardware registers; unified indices at or above this are
    /// stack slots.
    fn num_regs(&self) -> usize;

    fn save_policy(&self, reg: PReg) -> SavePolicy;

    /// Ideal class used to save/restore this register.
    fn save_type(&self, reg: PReg) -> IdealKind;

    fn frame_pointer(&self) -> PReg;

    fn return_addr_mask(&self) -> RegMask;

    /// Return-value register for the given class.
    fn return_value(&self, k: IdealKind) -> PReg;

    /// Map a signature to per-argument locations. Stack locations are
    /// relative to the argument area; the matcher warps them into unified
    /// register numbers.
    fn calling_convention(&self, sig: &Signature, out: &mut Vec<ParmLoc>);

    /// Stack slots preserved below incoming arguments.
    fn in_preserve_slots(&self) -> u32 {
        0
    }

    /// Stack slots preserved below outgoing arguments.
    fn out_preserve_slots(&self) -> u32 {
        0
    }

    /// Canonical register mask for a value class.
    fn reg_class_mask(&self, k: IdealKind) -> RegMask;

    #[inline(always)]
    fn stack0(&self) -> PReg {
        PReg::new(self.num_regs())
    }

    #[inline(always)]
    fn is_stack(&self, r: PReg) -> bool {
        r.is_valid() && r.index() >= self.num_regs()
    }

    #[inline(always)]
    fn stack2reg(&self, slot: u32) -> PReg {
        PReg::new(self.num_regs() + slot as usize)
    }

    #[inline(always)]
    fn reg2stack(&self, r: PReg) -> u32 {
        debug_assert!(self.is_stack(r));
        (r.index() - self.num_regs()) as u32
    }
}

/// Options for selection and scheduling.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Allow loads to be absorbed into larger match trees. On a retryable
    /// failure, `run` retries once with this disabled.
    pub subsume_loads: bool,

    /// Convert explicit null tests into faulting memory ops where legal.
    pub implicit_null_checks: bool,

    /// Bounded scan depth when deciding whether a child's control
    /// post-dominates the tree's control. Tuning parameter, not semantics.
    pub dominance_scan_depth: u32,

    /// Maximum match-tree labeling depth before bailing out.
    pub max_label_depth: u32,

    /// Upper bound on live pinch nodes per compilation.
    pub pinch_limit: u32,

    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            subsume_loads: true,
            implicit_null_checks: true,
            dominance_scan_depth: 6,
            max_label_depth: 1000,
            pinch_limit: 20000,
            verbose_log: false,
        }
    }
}

/// An error that stops selection or scheduling for the current method.
/// `retryable()` distinguishes failures worth one more attempt under a
/// more conservative configuration from hard ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectError {
    /// No reduction rule covers the given node shape; worth one retry
    /// under conservative matching.
    NoMatchingRule(NodeId),
    /// The decision table has no entry at all for a node; a machine
    /// description error, not worth retrying.
    NoTableEntry(NodeId),
    /// Match-tree labeling exceeded the depth bound.
    LabelDepthExceeded,
    /// The incoming argument layout cannot be represented in a register
    /// mask.
    IncomingCallingSequence,
    /// An outgoing call's argument area cannot be represented in a
    /// register mask.
    OutgoingCallingSequence,
    /// A block's schedule did not cover every instruction exactly once.
    ScheduleMismatch { block: BlockId, retryable: bool },
    /// Anti-dependence analysis exceeded the pinch-node budget.
    TooManyPinchPoints,
}

impl SelectError {
    pub fn retryable(&self) -> bool {
        match self {
            SelectError::NoMatchingRule(_) => true,
            SelectError::ScheduleMismatch { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl core::fmt::Display for SelectError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            SelectError::NoMatchingRule(n) => {
                write!(f, "no matching rule for node {}", n.raw_u32())
            }
            SelectError::NoTableEntry(n) => {
                write!(f, "no decision-table entry for node {}", n.raw_u32())
            }
            SelectError::LabelDepthExceeded => write!(f, "match tree too deep"),
            SelectError::IncomingCallingSequence => {
                write!(f, "unsupported incoming calling sequence")
            }
            SelectError::OutgoingCallingSequence => {
                write!(f, "unsupported outgoing calling sequence")
            }
            SelectError::ScheduleMismatch { block, .. } => {
                write!(f, "scheduling mismatch in block {}", block.raw_u32())
            }
            SelectError::TooManyPinchPoints => write!(f, "too many def-use pinch points"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SelectError {}

/// Run instruction selection, retrying once without speculative load
/// absorption if the first attempt fails in a retryable way. Scheduling is
/// a separate entry (`sched::schedule`) because register allocation runs
/// in between.
///
/// Matching consumes its graph (branch and ternary shapes are
/// restructured in place), so each attempt works on a private copy; the
/// caller's graph is left untouched.
pub fn run<M: Machine>(
    ir: &ir::IrGraph,
    machine: &M,
    rules: &RuleTable,
    opts: &Options,
) -> Result<Selection, SelectError> {
    let mut attempt = ir.clone();
    match matcher::select(&mut attempt, machine, rules, opts) {
        Err(e) if e.retryable() && opts.subsume_loads => {
            log::debug!(
                "selection failed retryably ({}); retrying without subsumed loads",
                e
            );
            let mut retry = *opts;
            retry.subsume_loads = false;
            let mut attempt = ir.clone();
            matcher::select(&mut attempt, machine, rules, &retry)
        }
        r => r,
    }
}

#[cfg(test)]
pub(crate) mod testutil;
