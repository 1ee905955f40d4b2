//! Dead-code elimination (post-SSA)
//!
//! Mark-and-sweep: side-effecting instructions (stores, calls, terminators)
//! are useful; usefulness propagates backward through operands; everything
//! unmarked is swept.

use std::collections::{HashMap, HashSet, VecDeque};

use super::FunctionPass;
use crate::ir::{FunctionModule, InstId, InstKind, PHI_NAN};

/// Dead-code elimination pass
#[derive(Default)]
pub struct DeadCodeElimination {
    /// register name -> (defining instruction id, its operand register names)
    defs: HashMap<String, (InstId, Vec<String>)>,
    useful: HashSet<InstId>,
    eliminated: usize,
}

impl FunctionPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        self.build_defs(func);
        self.mark(func);
        self.sweep(func);
        self.eliminated != 0
    }
}

impl DeadCodeElimination {
    fn build_defs(&mut self, func: &FunctionModule) {
        for bb in &func.blocks {
            for inst in &bb.insts {
                if let Some(dest) = inst.dest_name() {
                    let operands = inst
                        .operands()
                        .iter()
                        .filter_map(|op| op.as_local().map(str::to_string))
                        .collect();
                    self.defs.insert(dest.to_string(), (inst.id(), operands));
                }
            }
        }
    }

    fn mark(&mut self, func: &FunctionModule) {
        let mut worklist: VecDeque<String> = VecDeque::new();

        let seed = |inst: &crate::ir::Inst| {
            inst.is_terminator()
                || matches!(
                    inst.kind,
                    InstKind::Store { .. } | InstKind::Call { .. } | InstKind::StrCpy { .. }
                )
        };

        for bb in &func.blocks {
            for inst in &bb.insts {
                if seed(inst) {
                    self.useful.insert(inst.id());
                    for op in inst.operands() {
                        if let Some(name) = op.as_local() {
                            worklist.push_back(name.to_string());
                        }
                    }
                }
            }
        }

        while let Some(name) = worklist.pop_front() {
            if name == PHI_NAN || func.is_parameter(&name) {
                continue;
            }
            let (id, operands) = self.defs[&name].clone();
            if !self.useful.insert(id) {
                continue;
            }
            worklist.extend(operands);
        }
    }

    fn sweep(&mut self, func: &mut FunctionModule) {
        for bb in &mut func.blocks {
            let before = bb.insts.len();
            let useful = &self.useful;
            bb.insts.retain(|inst| {
                useful.contains(&inst.id())
                    || matches!(inst.kind, InstKind::Comment(_) | InstKind::AttachedComment(_))
            });
            self.eliminated += before - bb.insts.len();
        }
    }
}
