//! CFG simplification
//!
//! Three cooperating rewrites, run in sequence: branches on literal
//! conditions fold into jumps (with phi fixups in the abandoned successor),
//! blocks unreachable from the entry are removed (again fixing phis), and a
//! block with a single predecessor merges into it when that predecessor has
//! a single successor.

use std::collections::HashSet;

use super::{delete_phi_option, replace_phi_label, FunctionPass};
use crate::ir::{Addr, FunctionModule, Inst, InstKind};

/// CFG simplification pass
#[derive(Default)]
pub struct SimplifyCfg {
    modified: bool,
}

impl FunctionPass for SimplifyCfg {
    fn name(&self) -> &'static str {
        "simplify-cfg"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        self.rewrite_branches(func);
        self.remove_unreachable(func);
        self.merge_blocks(func);
        func.remove_deleted();
        self.modified
    }
}

impl SimplifyCfg {
    // br 1 <a> <b>  ->  jump <a>, dropping this block from <b>'s phis
    fn rewrite_branches(&mut self, func: &mut FunctionModule) {
        for pos in 0..func.blocks.len() {
            let label = func.blocks[pos].label;
            let Some(last) = func.blocks[pos].insts.last() else { continue };
            let InstKind::Branch {
                cond: Addr::Imm(c),
                then_label,
                else_label,
            } = last.kind
            else {
                continue;
            };
            let (taken, abandoned) = if c != 0 {
                (then_label, else_label)
            } else {
                (else_label, then_label)
            };
            *func.blocks[pos].insts.last_mut().unwrap() =
                Inst::new(InstKind::Jump { target: taken });
            self.modified = true;
            if abandoned != taken {
                drop_phi_options_for_pred(func, abandoned, label);
            }
        }
    }

    fn remove_unreachable(&mut self, func: &mut FunctionModule) {
        let mut reachable = HashSet::new();
        let mut stack = vec![func.entry_label()];
        while let Some(cur) = stack.pop() {
            if !reachable.insert(cur) {
                continue;
            }
            stack.extend(func.block(cur).successors());
        }

        let doomed: Vec<usize> = func
            .blocks
            .iter()
            .filter(|bb| !reachable.contains(&bb.label))
            .map(|bb| bb.label)
            .collect();
        for &label in &doomed {
            for succ in func.block(label).successors() {
                if reachable.contains(&succ) {
                    drop_phi_options_for_pred(func, succ, label);
                }
            }
        }
        if !doomed.is_empty() {
            func.blocks.retain(|bb| reachable.contains(&bb.label));
            self.modified = true;
        }
    }

    // merge <b> into its unique predecessor <p> when p's only successor is b
    fn merge_blocks(&mut self, func: &mut FunctionModule) {
        loop {
            let preds = func.predecessors();
            let candidate = func.blocks.iter().find_map(|bb| {
                let ps = preds.get(&bb.label)?;
                if ps.len() != 1 || bb.label == func.entry_label() {
                    return None;
                }
                let p = ps[0];
                (func.block(p).successors().len() == 1 && p != bb.label).then_some((p, bb.label))
            });
            let Some((pred, label)) = candidate else { break };

            // single-predecessor phis degenerate into assignments first
            let pos = func.position(label).unwrap();
            let _ = super::simplify_phis(&mut func.blocks[pos]);

            // successors' phis now flow from the predecessor
            for succ in func.block(label).successors() {
                let succ_pos = func.position(succ).unwrap();
                for inst in func.blocks[succ_pos].insts.iter_mut() {
                    if !inst.is_phi() {
                        if inst.is_deleted() {
                            continue;
                        }
                        break;
                    }
                    replace_phi_label(inst, label, pred);
                }
            }

            let mut moved = std::mem::take(&mut func.block_mut(label).insts);
            let pred_bb = func.block_mut(pred);
            pred_bb.insts.pop();
            pred_bb.insts.append(&mut moved);
            func.blocks.retain(|bb| bb.label != label);
            self.modified = true;
        }
    }
}

fn drop_phi_options_for_pred(func: &mut FunctionModule, block: usize, pred: usize) {
    let Some(pos) = func.position(block) else { return };
    for inst in func.blocks[pos].insts.iter_mut() {
        if !inst.is_phi() {
            if inst.is_deleted() {
                continue;
            }
            break;
        }
        delete_phi_option(inst, pred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verify_func;

    #[test]
    fn test_fold_literal_branch_and_drop_unreachable() {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        let t = func.push_block();
        let e = func.push_block();
        func.block_mut(entry).push(InstKind::Branch {
            cond: Addr::Imm(1),
            then_label: t,
            else_label: e,
        });
        func.block_mut(t).push(InstKind::Ret { value: Some(Addr::Imm(1)) });
        func.block_mut(e).push(InstKind::Ret { value: Some(Addr::Imm(0)) });

        assert!(SimplifyCfg::default().run(&mut func));
        verify_func(&func);
        assert_eq!(func.blocks.len(), 2);
        assert!(func.position(e).is_none());
    }

    #[test]
    fn test_merge_straight_line_chain() {
        let mut func = FunctionModule::new("f", vec![]);
        let b0 = func.push_block();
        let b1 = func.push_block();
        let b2 = func.push_block();
        func.block_mut(b0).push(InstKind::Jump { target: b1 });
        func.block_mut(b1).push(InstKind::Assign {
            dest: Addr::local("a"),
            src: Addr::Imm(1),
        });
        func.block_mut(b1).push(InstKind::Jump { target: b2 });
        func.block_mut(b2).push(InstKind::Ret {
            value: Some(Addr::local("a")),
        });

        assert!(SimplifyCfg::default().run(&mut func));
        verify_func(&func);
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.blocks[0].label, b0);
        assert!(matches!(
            func.blocks[0].insts.last().unwrap().kind,
            InstKind::Ret { .. }
        ));
    }

    #[test]
    fn test_branch_fold_fixes_phi() {
        // entry branches on 0 to <t>/<e>; both jump to <j> with a phi
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        let t = func.push_block();
        let e = func.push_block();
        let j = func.push_block();
        func.block_mut(entry).push(InstKind::Branch {
            cond: Addr::Imm(0),
            then_label: t,
            else_label: e,
        });
        func.block_mut(t).push(InstKind::Jump { target: j });
        func.block_mut(e).push(InstKind::Jump { target: j });
        func.block_mut(j).push(InstKind::Phi {
            dest: Addr::local("p"),
            options: vec![(Addr::Imm(1), t), (Addr::Imm(2), e)],
        });
        func.block_mut(j).push(InstKind::Ret {
            value: Some(Addr::local("p")),
        });

        assert!(SimplifyCfg::default().run(&mut func));
        verify_func(&func);
        // only the else path survives; the phi collapsed to an assignment
        // and the chain merged into a single block returning 2
        let all: Vec<&InstKind> = func
            .blocks
            .iter()
            .flat_map(|bb| bb.insts.iter().map(|i| &i.kind))
            .collect();
        assert!(all
            .iter()
            .any(|k| matches!(k, InstKind::Assign { src: Addr::Imm(2), .. })));
        assert!(!all.iter().any(|k| matches!(k, InstKind::Phi { .. })));
    }
}
