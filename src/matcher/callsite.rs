//! Binding of call sites and safepoints.
//!
//! Calls are the one shape the tree matcher cannot cover: they match
//! alone, with no children, and their arguments remain independent trees.
//! Binding copies the call metadata onto the machine call, computes each
//! argument's calling-convention location (warping stack-relative slot
//! numbers into allocator-relative ones), builds the site's private
//! input-mask array, and hangs the two kill fat-projections off the call:
//! one for the outgoing argument area, one for every caller-saved register
//! the call does not itself define.

use crate::ir::tf;
use crate::mach::CallTarget;
use crate::matcher::Matcher;
use crate::{Machine, MachId, NodeId, ParmLoc, PReg, RegMask, SelectError};

impl<'a, M: Machine> Matcher<'a, M> {
    /// Convert an outgoing argument's stack-relative slot number into an
    /// allocator-relative register number, maintaining the per-site and
    /// per-method outgoing-area watermarks.
    fn warp_outgoing_stk_arg(
        &mut self,
        slot: u32,
        begin_out_arg_area: PReg,
        out_arg_limit_per_call: &mut PReg,
    ) -> Result<PReg, SelectError> {
        let warped = begin_out_arg_area.add(slot as usize);
        if warped.index() >= out_arg_limit_per_call.index() {
            *out_arg_limit_per_call = warped.add(1);
        }
        if !RegMask::can_represent(warped) {
            return Err(SelectError::OutgoingCallingSequence);
        }
        Ok(warped)
    }

    /// Match a call or non-call safepoint. The node itself reduces as an
    /// opaque unit; everything else is binding.
    pub(crate) fn match_sfpt(&mut self, n: NodeId) -> Result<MachId, SelectError> {
        let is_call = self.ir.op(n).is_call();

        // Match just the call, nothing else.
        let m = self.match_tree(n)?;

        let call_data = self.ir.node(n).call.clone();
        let (cnt, target) = if is_call {
            let data = call_data
                .as_ref()
                .expect("call node carries call data");
            (
                tf::PARMS + data.sig.args.len(),
                Some(CallTarget {
                    sig: data.sig.clone(),
                    entry: data.entry,
                    kind: data.kind.clone(),
                    argsize: 0,
                }),
            )
        } else {
            (tf::PARMS, None)
        };

        // The site's private register-mask array, immutable once built.
        let mut in_rms = vec![RegMask::EMPTY; cnt];
        in_rms[tf::RET_ADDR] = self.return_addr_mask;
        in_rms[tf::FRAME_PTR] = self.c_frame_ptr_mask;

        // First place an outgoing argument can possibly go.
        let begin_out_arg_area = self
            .new_sp
            .add(self.machine.out_preserve_slots() as usize);
        let mut out_arg_limit_per_call = begin_out_arg_area;

        let mut target = target;
        if let Some(tgt) = target.as_mut() {
            let mut parm_locs = vec![];
            self.machine.calling_convention(&tgt.sig, &mut parm_locs);
            debug_assert_eq!(parm_locs.len(), tgt.sig.args.len());

            for (i, loc) in parm_locs.iter().enumerate() {
                let rm = &mut in_rms[tf::PARMS + i];
                match *loc {
                    ParmLoc::None => continue,
                    ParmLoc::Reg(r) => rm.insert(r),
                    ParmLoc::Stack(slot) => {
                        let warped = self.warp_outgoing_stk_arg(
                            slot,
                            begin_out_arg_area,
                            &mut out_arg_limit_per_call,
                        )?;
                        rm.insert(warped);
                    }
                }
            }
            // Stack needed to pop this site's arguments.
            tgt.argsize =
                (out_arg_limit_per_call.index() - begin_out_arg_area.index()) as u32;
        }

        // Track the max stack slot killed by any call; those slots are
        // excluded from debug info when the first stack mask is built.
        if out_arg_limit_per_call.index() > self.out_arg_limit.index() {
            self.out_arg_limit = out_arg_limit_per_call;
        }

        if is_call {
            if !RegMask::can_represent(PReg::new(out_arg_limit_per_call.index() - 1)) {
                return Err(SelectError::OutgoingCallingSequence);
            }

            // Kill the outgoing argument area with a fat projection, so
            // no live value is ever allocated where a callee will write.
            let mut area_kill = RegMask::EMPTY;
            let mut r = begin_out_arg_area;
            while r.index() < out_arg_limit_per_call.index() {
                area_kill.insert(r);
                r = r.add(1);
            }

            // Kill every save-on-call register the call does not itself
            // define; anti-dependence analysis reads this as an implicit
            // write of all of them.
            let mut defined = RegMask::single(self.machine.frame_pointer());
            let ret = target.as_ref().and_then(|t| t.sig.ret);
            if let Some(k) = ret {
                defined.insert(self.machine.return_value(k));
            }
            let mut clobber = RegMask::EMPTY;
            for i in 0..self.machine.num_regs() {
                let r = PReg::new(i);
                if self.machine.save_policy(r).is_save_on_call() && !defined.member(r) {
                    clobber.insert(r);
                }
            }

            let proj_base = cnt as u32 + 10000;
            let area_proj = self.graph.add_proj(m, proj_base, true, area_kill);
            let clobber_proj = self.graph.add_proj(m, proj_base + 1, true, clobber);
            self.proj_list.push(area_proj);
            self.proj_list.push(clobber_proj);
        }

        // Transfer the safepoint information onto the machine node.
        let data = self
            .graph
            .inst_mut(m)
            .safepoint_mut()
            .expect("safepoint reduction produced a safepoint shape");
        data.in_rms = in_rms;
        data.call = target;
        data.debug = call_data.and_then(|c| c.debug);

        Ok(m)
    }
}
