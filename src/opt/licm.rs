//! Loop-invariant code motion
//!
//! Every loop header gets a preheader collecting its loop-exterior edges
//! (header phis are split accordingly). Hoisting is deliberately narrow: the
//! candidates are invariant computations on the straight-line path that the
//! header's in-loop branch always executes, and of those only invariant
//! calls together with their invariant operand closure move, since a pure
//! call is the one computation worth paying a preheader slot for
//! unconditionally.

use std::collections::{HashMap, HashSet};

use super::{simplify_phis, FunctionPass};
use crate::analysis::{FuncAttr, LoopInfo, UseDefChain};
use crate::ir::{FunctionModule, Inst, InstId, InstKind};

/// Loop-invariant code motion pass
pub struct LoopInvariantCodeMotion<'a> {
    attr: &'a FuncAttr,
    pre_headers: HashMap<usize, usize>,
    hoisted: usize,
}

impl<'a> LoopInvariantCodeMotion<'a> {
    /// Create the pass with module-level function attributes
    pub fn new(attr: &'a FuncAttr) -> Self {
        Self {
            attr,
            pre_headers: HashMap::new(),
            hoisted: 0,
        }
    }
}

impl FunctionPass for LoopInvariantCodeMotion<'_> {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        let loops = LoopInfo::build(func);
        self.insert_pre_headers(func, &loops);

        // preheader insertion reshaped the CFG
        let loops = LoopInfo::build_with_invariants(func, self.attr);
        for header in loops.post_order() {
            if header == func.entry_label() {
                continue;
            }
            self.process_loop(func, &loops, header);
        }
        self.hoisted != 0
    }
}

impl LoopInvariantCodeMotion<'_> {
    fn insert_pre_headers(&mut self, func: &mut FunctionModule, loops: &LoopInfo) {
        let preds = func.predecessors();
        let headers: Vec<usize> = loops
            .loops()
            .iter()
            .filter(|(_, nodes)| nodes.len() > 1)
            .map(|(&h, _)| h)
            .collect();

        for header in headers {
            if header == func.entry_label() {
                continue;
            }
            let loop_nodes = &loops.loops()[&header];
            let outer_preds: HashSet<usize> = preds[&header]
                .iter()
                .copied()
                .filter(|p| !loop_nodes.contains(p))
                .collect();
            assert!(!outer_preds.is_empty(), "loop header with no entry edge");

            // a unique jump-only exterior predecessor already is a preheader
            if outer_preds.len() == 1 {
                let p = *outer_preds.iter().next().unwrap();
                if func.block(p).successors().len() == 1 {
                    self.pre_headers.insert(header, p);
                    continue;
                }
            }

            let pre_header = func.push_block();
            self.pre_headers.insert(header, pre_header);

            for &pred in &outer_preds {
                func.block_mut(pred)
                    .terminator_mut()
                    .replace_target(header, pre_header);
            }

            // split header phis: loop-exterior options migrate to a fresh phi
            // in the preheader
            let header_pos = func.position(header).unwrap();
            let mut preheader_phis: Vec<Inst> = Vec::new();
            for inst in func.blocks[header_pos].insts.iter_mut() {
                if !inst.is_phi() {
                    if inst.is_deleted() {
                        continue;
                    }
                    break;
                }
                let InstKind::Phi { dest, options } = &inst.kind else {
                    unreachable!()
                };
                let (moved, kept): (Vec<_>, Vec<_>) = options
                    .iter()
                    .cloned()
                    .partition(|(_, label)| outer_preds.contains(label));
                if moved.is_empty() {
                    continue;
                }
                let moved_dest = func.temps.fresh_hinted("ph");
                let mut kept = kept;
                kept.push((moved_dest.clone(), pre_header));
                *inst = Inst::new(InstKind::Phi {
                    dest: dest.clone(),
                    options: kept,
                });
                preheader_phis.push(Inst::new(InstKind::Phi {
                    dest: moved_dest,
                    options: moved,
                }));
            }

            let pre_bb = func.block_mut(pre_header);
            pre_bb.insts = preheader_phis;
            pre_bb.push(InstKind::Jump { target: header });

            let header_pos = func.position(header).unwrap();
            simplify_phis(&mut func.blocks[header_pos]);
            let pre_pos = func.position(pre_header).unwrap();
            simplify_phis(&mut func.blocks[pre_pos]);
        }
        func.remove_deleted();
    }

    fn process_loop(&mut self, func: &mut FunctionModule, loops: &LoopInfo, header: usize) {
        let loop_nodes = &loops.loops()[&header];
        if loop_nodes.len() == 1 {
            return;
        }
        let Some(&pre_header) = self.pre_headers.get(&header) else {
            return;
        };

        let use_def = UseDefChain::build(func);
        let invariant = self.find_invariant_computation(func, loops, header, &use_def);
        if invariant.is_empty() {
            return;
        }
        self.hoist(func, &invariant, pre_header);
    }

    // Invariant instructions on the must-pass path from the header's in-loop
    // branch target, narrowed to calls and their operand closure. The result
    // preserves path order so hoisted definitions precede their uses.
    fn find_invariant_computation(
        &self,
        func: &FunctionModule,
        loops: &LoopInfo,
        header: usize,
        use_def: &UseDefChain,
    ) -> Vec<InstId> {
        let loop_nodes = &loops.loops()[&header];
        let invariant_vars = loops.invariant_vars(header);

        let InstKind::Branch {
            then_label,
            else_label,
            ..
        } = func.block(header).terminator().kind
        else {
            return Vec::new();
        };
        let (mut inside, mut outside) = (then_label, else_label);
        if loop_nodes.contains(&outside) {
            std::mem::swap(&mut inside, &mut outside);
        }
        if loop_nodes.contains(&outside) {
            // both branch targets stay in the loop; no obvious exit structure
            return Vec::new();
        }

        // straight-line blocks the loop body always executes
        let mut must_pass = Vec::new();
        let mut cur = inside;
        loop {
            must_pass.push(cur);
            let succs = func.block(cur).successors();
            if succs.len() != 1 || must_pass.contains(&succs[0]) {
                break;
            }
            cur = succs[0];
        }

        let mut candidates: Vec<InstId> = Vec::new();
        let mut call_worklist: Vec<Inst> = Vec::new();
        for &node in &must_pass {
            for inst in &func.block(node).insts {
                let Some(dest) = inst.dest_name() else { continue };
                if !invariant_vars.contains(dest) {
                    continue;
                }
                candidates.push(inst.id());
                if matches!(inst.kind, InstKind::Call { .. }) {
                    call_worklist.push(inst.clone());
                }
            }
        }

        // closure of the calls over their operand definitions
        let mut related: HashSet<InstId> = HashSet::new();
        while let Some(inst) = call_worklist.pop() {
            if !related.insert(inst.id()) {
                continue;
            }
            for operand in inst.operands() {
                if let Some(name) = operand.as_local() {
                    if let Some(def) = use_def.def(name) {
                        if !related.contains(&def.inst.id()) {
                            call_worklist.push(def.inst.clone());
                        }
                    }
                }
            }
        }

        candidates.retain(|id| related.contains(id));
        candidates
    }

    // invariant ids arrive in path order, so emitting them in sequence keeps
    // definitions ahead of uses
    fn hoist(&mut self, func: &mut FunctionModule, invariant: &[InstId], pre_header: usize) {
        let wanted: HashSet<InstId> = invariant.iter().copied().collect();
        let mut moved: HashMap<InstId, Inst> = HashMap::new();
        for bb in &mut func.blocks {
            if bb.label == pre_header {
                continue;
            }
            for inst in bb.insts.iter_mut() {
                if wanted.contains(&inst.id()) {
                    moved.insert(inst.id(), inst.clone());
                    *inst = Inst::new(InstKind::Deleted);
                }
            }
        }
        self.hoisted += moved.len();
        let pre_pos = func.position(pre_header).unwrap();
        for id in invariant {
            let Some(inst) = moved.remove(id) else { continue };
            let at = func.blocks[pre_pos].insts.len() - 1;
            func.blocks[pre_pos].insts.insert(at, inst);
        }
        func.remove_deleted();
    }
}
