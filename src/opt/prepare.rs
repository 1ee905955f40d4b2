//! Codegen preparation: block scheduling
//!
//! Reorders a function's blocks so that a loop header's in-loop branch
//! target follows it directly and branches whose then-side returns place the
//! other side next, letting instruction selection fall through instead of
//! jumping. Blocks unreachable from the entry are dropped along the way.

use std::collections::HashSet;

use crate::analysis::LoopInfo;
use crate::ir::{BasicBlock, FunctionModule, InstKind};

/// Reorder `func`'s blocks into a fallthrough-friendly schedule.
pub fn prepare_for_codegen(func: &mut FunctionModule) {
    let loops = LoopInfo::build(func);

    let mut pre_order = Vec::new();
    let mut seen = HashSet::new();
    dfs(func, func.entry_label(), &mut seen, &mut pre_order);

    let mut order: Vec<usize> = Vec::new();
    let mut visited: HashSet<usize> = HashSet::new();
    for n in pre_order {
        if visited.contains(&n) && order.last() != Some(&n) {
            continue;
        }
        if visited.insert(n) {
            order.push(n);
        }

        let InstKind::Branch {
            then_label,
            else_label,
            ..
        } = func.block(n).terminator().kind
        else {
            continue;
        };

        if loops.is_loop_header(n) {
            if visited.insert(then_label) {
                order.push(then_label);
            }
            continue;
        }

        let then_returns = matches!(
            func.block(then_label).terminator().kind,
            InstKind::Ret { .. }
        );
        if then_returns && !visited.contains(&else_label) {
            visited.insert(else_label);
            order.push(else_label);
        } else if visited.insert(then_label) {
            order.push(then_label);
        }
    }

    let mut scheduled: Vec<BasicBlock> = Vec::with_capacity(order.len());
    for label in order {
        let pos = func.position(label).expect("scheduled label exists");
        scheduled.push(func.blocks.remove(pos));
    }
    func.blocks = scheduled;
}

fn dfs(func: &FunctionModule, cur: usize, seen: &mut HashSet<usize>, out: &mut Vec<usize>) {
    if !seen.insert(cur) {
        return;
    }
    out.push(cur);
    for succ in func.block(cur).successors() {
        dfs(func, succ, seen, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Addr, InstKind};

    #[test]
    fn test_loop_body_follows_header() {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        let header = func.push_block();
        let exit = func.push_block(); // deliberately between header and body
        let body = func.push_block();

        func.block_mut(entry).push(InstKind::Jump { target: header });
        func.block_mut(header).push(InstKind::Branch {
            cond: Addr::local("c"),
            then_label: body,
            else_label: exit,
        });
        func.block_mut(body).push(InstKind::Jump { target: header });
        func.block_mut(exit).push(InstKind::Ret { value: None });

        prepare_for_codegen(&mut func);
        let labels: Vec<usize> = func.blocks.iter().map(|bb| bb.label).collect();
        let header_at = labels.iter().position(|&l| l == header).unwrap();
        assert_eq!(labels[header_at + 1], body);
    }

    #[test]
    fn test_unreachable_blocks_dropped() {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        let orphan = func.push_block();
        func.block_mut(entry).push(InstKind::Ret { value: None });
        func.block_mut(orphan).push(InstKind::Ret { value: None });

        prepare_for_codegen(&mut func);
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.blocks[0].label, entry);
    }
}
