//! Copy propagation
//!
//! Dominator-tree pre-order walk recording, for every `assign`, what its
//! destination really is (a literal, a global, or the oldest equivalent
//! local); operand references are then rewritten through the map.

use std::collections::HashMap;

use super::FunctionPass;
use crate::ir::{Addr, FunctionModule, InstKind};
use crate::analysis::DominatorTree;

/// Copy propagation pass
#[derive(Default)]
pub struct CopyPropagation {
    value: HashMap<String, Addr>,
    rewritten: usize,
}

impl FunctionPass for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy-prop"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        let dom = DominatorTree::build(func);
        self.build_value(func, &dom, func.entry_label());
        self.rewrite(func);
        self.rewritten != 0
    }
}

impl CopyPropagation {
    fn build_value(&mut self, func: &FunctionModule, dom: &DominatorTree, label: usize) {
        for inst in &func.block(label).insts {
            let InstKind::Assign { dest, src } = &inst.kind else {
                continue;
            };
            let Some(dest) = dest.as_local() else { continue };
            let resolved = match src {
                Addr::Imm(_) | Addr::Global(_) => src.clone(),
                Addr::Local(name) => self
                    .value
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| src.clone()),
                Addr::Label(_) => unreachable!("assign from a label"),
            };
            self.value.insert(dest.to_string(), resolved);
        }

        for child in dom.children(label) {
            self.build_value(func, dom, child);
        }
    }

    fn rewrite(&mut self, func: &mut FunctionModule) {
        for bb in &mut func.blocks {
            for inst in bb.insts.iter_mut() {
                for operand in inst.operands_mut() {
                    let Some(name) = operand.as_local() else { continue };
                    if let Some(value) = self.value.get(name) {
                        if value != operand {
                            *operand = value.clone();
                            self.rewritten += 1;
                        }
                    }
                }
            }
        }
    }
}
