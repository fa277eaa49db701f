//! Frame masks and save-on-entry epilogue threading.
//!
//! Two layers of mask state: the process-wide canonical tables (per-class
//! register masks, per-register singletons, the all-stack mask), computed
//! once behind a write-once guard and immutable afterwards; and the
//! per-compilation frame masks (first stack mask, spill and debug masks),
//! which depend on this method's argument areas.
//!
//! Save-on-entry registers are modeled for the allocator as extra incoming
//! arguments: a projection off Start per register, used by every exit.
//! Exits of one kind have structurally identical epilogues, so each exit
//! kind shares a single input-mask array.

use crate::ir::tf;
use crate::mach::{ExitKind, MachKind, MachRef};
use crate::matcher::Matcher;
use crate::regmask::RM_CAPACITY;
use crate::{IdealKind, Machine, MachId, PReg, RegMask, SelectError};
use std::sync::OnceLock;

/// Canonical masks derived from the machine description alone. Computed by
/// the first compiling thread; every later reader sees the completed
/// tables.
pub struct MaskTables {
    pub ideal2mask: [RegMask; IdealKind::COUNT],
    pub mreg2mask: Vec<RegMask>,
    pub stack_only: RegMask,
}

static MASK_TABLES: OnceLock<MaskTables> = OnceLock::new();

pub fn mask_tables<M: Machine>(machine: &M) -> &'static MaskTables {
    MASK_TABLES.get_or_init(|| {
        let mut ideal2mask = [RegMask::EMPTY; IdealKind::COUNT];
        for k in [
            IdealKind::I,
            IdealKind::L,
            IdealKind::F,
            IdealKind::D,
            IdealKind::P,
            IdealKind::Flags,
        ] {
            ideal2mask[k as usize] = machine.reg_class_mask(k);
        }
        let mreg2mask = (0..machine.num_regs())
            .map(|i| RegMask::single(PReg::new(i)))
            .collect();
        let mut stack_only = RegMask::EMPTY;
        let mut r = machine.stack0();
        while r.index() < RM_CAPACITY {
            stack_only.insert(r);
            r = r.add(1);
        }
        stack_only.set_all_stack();
        MaskTables {
            ideal2mask,
            mreg2mask,
            stack_only,
        }
    })
}

const SPILLABLE: [IdealKind; 5] = [
    IdealKind::I,
    IdealKind::L,
    IdealKind::F,
    IdealKind::D,
    IdealKind::P,
];

impl<'a, M: Machine> Matcher<'a, M> {
    /// Create the initial stack mask used by values spilling to the
    /// stack, and from it the per-class spill and debug masks. Outgoing
    /// argument areas are excluded so debug info can never land where a
    /// callee will write.
    pub(crate) fn init_first_stack_mask(&mut self) -> Result<(), SelectError> {
        let tables = mask_tables(self.machine);

        let mut first_stack = RegMask::EMPTY;

        // The incoming argument area belongs to this frame.
        if self.machine.out_preserve_slots() > 0 {
            let mut r = self
                .old_sp
                .add(self.machine.out_preserve_slots() as usize);
            while r.index() < self.in_arg_limit.index() {
                first_stack.insert(r);
                r = r.add(1);
            }
        } else {
            // Incoming holes are the caller's property; only actual stack
            // args are allocatable.
            for &loc in &self.parm_regs {
                if let Some(r) = loc {
                    if self.machine.is_stack(r) {
                        first_stack.insert(r);
                    }
                }
            }
        }

        if !RegMask::can_represent(PReg::new(self.out_arg_limit.index().saturating_sub(1))) {
            return Err(SelectError::OutgoingCallingSequence);
        }

        // Everything past the frame's own area, plus the unbounded tail.
        let mut r = self.new_sp;
        while r.index() < RM_CAPACITY {
            first_stack.insert(r);
            r = r.add(1);
        }
        first_stack.set_all_stack();
        self.first_stack_mask = first_stack;

        // Spill masks: the class registers plus the first stack mask.
        for k in SPILLABLE {
            let mut m = tables.ideal2mask[k as usize];
            m.or(&first_stack);
            self.spill_mask[k as usize] = m;
        }

        // Debug masks: spill slots plus callee-save registers only.
        // Caller-save registers are trashable by patching stubs.
        for k in SPILLABLE {
            self.debug_mask[k as usize] = self.spill_mask[k as usize];
        }
        for i in 0..self.machine.num_regs() {
            let r = PReg::new(i);
            if self.machine.save_policy(r).is_save_on_call() {
                for k in SPILLABLE {
                    self.debug_mask[k as usize].remove(r);
                }
            }
        }

        Ok(())
    }

    fn init_input_masks(&self, size: usize) -> Vec<RegMask> {
        let mut rms = vec![RegMask::EMPTY; size];
        rms[tf::RET_ADDR] = self.return_addr_mask;
        rms[tf::FRAME_PTR] = self.c_frame_ptr_mask;
        rms
    }

    /// Thread every save-on-entry register through all exit paths: a
    /// projection off Start defines it, every exit uses it, and each exit
    /// kind's shared mask array grows one slot.
    pub(crate) fn fixup_save_on_entry(&mut self, root: MachId) -> Result<(), SelectError> {
        self.init_first_stack_mask()?;
        let tables = mask_tables(self.machine);

        let soe_cnt = (0..self.machine.num_regs())
            .filter(|&i| self.machine.save_policy(PReg::new(i)).is_save_on_entry())
            .count();

        // Returns carry 0 or 1 returned values depending on signature.
        let ret_edge_cnt = tf::PARMS + if self.ir.sig.ret.is_some() { 1 } else { 0 };
        let mut ret_rms = self.init_input_masks(ret_edge_cnt + soe_cnt);
        if ret_edge_cnt > tf::PARMS {
            ret_rms[tf::PARMS] = self.return_value_mask;
        }
        let reth_edge_cnt = tf::PARMS;
        let mut reth_rms = self.init_input_masks(reth_edge_cnt + soe_cnt);
        let halt_edge_cnt = tf::PARMS;
        let mut halt_rms = self.init_input_masks(halt_edge_cnt + soe_cnt);

        let start = match self.node_map[self.ir.start.index()] {
            MachRef::Mach(s) => s,
            _ => {
                let s = self.clone_dontcare(self.ir.start);
                self.node_map[self.ir.start.index()] = MachRef::Mach(s);
                s
            }
        };

        // Exits hanging off the root, by kind.
        let mut exits = vec![];
        for i in 0..self.graph.inst(root).inputs.len() {
            if let MachRef::Mach(e) = self.graph.input(root, i) {
                if let MachKind::Exit(kind) = self.graph.inst(e).kind {
                    exits.push((e, kind));
                }
            }
        }

        // Next unused projection index off Start.
        let mut proj_cnt = (tf::PARMS + self.ir.sig.args.len()) as u32;

        let mut ret_cnt = ret_edge_cnt;
        let mut reth_cnt = reth_edge_cnt;
        let mut halt_cnt = halt_edge_cnt;
        for i in 0..self.machine.num_regs() {
            let reg = PReg::new(i);
            if !self.machine.save_policy(reg).is_save_on_entry() {
                continue;
            }
            let save_type = self.machine.save_type(reg);
            ret_rms[ret_cnt] = tables.mreg2mask[i];
            reth_rms[reth_cnt] = tables.mreg2mask[i];
            // Halts need the value only as debug info; any spillable
            // location of the class will do.
            halt_rms[halt_cnt] = self.spill_mask[save_type as usize];
            ret_cnt += 1;
            reth_cnt += 1;
            halt_cnt += 1;

            // If this register happens to carry the incoming receiver, the
            // existing argument projection already defines it.
            let mut mproj = MachId::invalid();
            if !self.ir.sig.args.is_empty()
                && self.calling_convention_mask[0].member(reg)
                && self.ir.sig.args[0] == IdealKind::P
            {
                for &p in self.graph.projs_of(start) {
                    if let MachKind::Proj { index, .. } = self.graph.inst(p).kind {
                        if index == tf::PARMS as u32 {
                            mproj = p;
                            break;
                        }
                    }
                }
            }
            if mproj.is_invalid() {
                mproj = self
                    .graph
                    .add_proj(start, proj_cnt, false, tables.mreg2mask[i]);
                proj_cnt += 1;
                self.graph.inst_mut(mproj).ideal = save_type;
            }

            for &(e, _) in &exits {
                self.graph.add_input(e, MachRef::Mach(mproj));
            }
        }

        self.exit_rms[ExitKind::Return as usize] = ret_rms;
        self.exit_rms[ExitKind::Rethrow as usize] = reth_rms;
        self.exit_rms[ExitKind::Halt as usize] = halt_rms;
        Ok(())
    }
}
