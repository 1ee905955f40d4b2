//! Dominator tree and dominance frontiers

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::FunctionModule;

/// Dominance information for one function
///
/// Block `a` dominates `b` iff every entry-to-`b` path passes through `a`.
/// Only blocks reachable from the entry participate; queries about anything
/// else report no dominance at all. Built once per pass invocation; not
/// incrementally updated.
#[derive(Debug, Default)]
pub struct DominatorTree {
    reachable: BTreeSet<usize>,
    /// node -> set of nodes it dominates
    dominating: BTreeMap<usize, BTreeSet<usize>>,
    /// node -> its dominators
    dominators: BTreeMap<usize, BTreeSet<usize>>,
    /// node -> immediate dominator (absent for the entry)
    idom: BTreeMap<usize, usize>,
    /// node -> dominator-tree children
    children: BTreeMap<usize, BTreeSet<usize>>,
    /// node -> dominance frontier
    frontier: BTreeMap<usize, Vec<usize>>,
}

impl DominatorTree {
    /// Compute full dominance information for `func`
    pub fn build(func: &FunctionModule) -> Self {
        let mut tree = Self::default();
        let mut stack = vec![func.entry_label()];
        while let Some(cur) = stack.pop() {
            if !tree.reachable.insert(cur) {
                continue;
            }
            stack.extend(func.block(cur).successors());
        }
        for &label in &tree.reachable.clone() {
            tree.dominating.insert(label, BTreeSet::new());
            tree.dominators.insert(label, BTreeSet::new());
            tree.children.insert(label, BTreeSet::new());
            tree.frontier.insert(label, Vec::new());
        }
        tree.build_dominating(func);
        tree.build_dominators();
        tree.build_idom(func);
        tree.build_children(func);
        tree.build_frontier(func);
        tree
    }

    /// Whether `u` dominates `v`
    pub fn dominates(&self, u: usize, v: usize) -> bool {
        self.dominating.get(&u).is_some_and(|s| s.contains(&v))
    }

    /// Whether `u` strictly dominates `v`
    pub fn strictly_dominates(&self, u: usize, v: usize) -> bool {
        u != v && self.dominates(u, v)
    }

    /// Immediate dominator of `n`; `None` for the entry block
    pub fn idom(&self, n: usize) -> Option<usize> {
        self.idom.get(&n).copied()
    }

    /// Dominator-tree children of `n`
    pub fn children(&self, n: usize) -> impl Iterator<Item = usize> + '_ {
        self.children.get(&n).into_iter().flatten().copied()
    }

    /// Dominance frontier of `n`
    pub fn frontier(&self, n: usize) -> &[usize] {
        self.frontier.get(&n).map(Vec::as_slice).unwrap_or(&[])
    }

    // The nodes dominated by [node] are exactly the ones that are not
    // reachable from the entry once [node] is removed from the CFG.
    fn build_dominating(&mut self, func: &FunctionModule) {
        for &node in &self.reachable.clone() {
            let mut avoidable = BTreeSet::new();
            let mut stack = vec![func.entry_label()];
            while let Some(cur) = stack.pop() {
                if cur == node || avoidable.contains(&cur) {
                    continue;
                }
                avoidable.insert(cur);
                stack.extend(func.block(cur).successors());
            }
            let dominated = self.dominating.get_mut(&node).unwrap();
            for &other in &self.reachable {
                if !avoidable.contains(&other) {
                    dominated.insert(other);
                }
            }
        }
    }

    fn build_dominators(&mut self) {
        let pairs: Vec<(usize, usize)> = self
            .dominating
            .iter()
            .flat_map(|(&u, set)| set.iter().map(move |&v| (u, v)))
            .collect();
        for (u, v) in pairs {
            self.dominators.get_mut(&v).unwrap().insert(u);
        }
    }

    // The immediate dominator of n is the unique strict dominator of n that
    // strictly dominates no other strict dominator of n.
    //
    // For a faster algorithm, see [Lengauer, Tarjan, 1979].
    fn build_idom(&mut self, func: &FunctionModule) {
        let entry = func.entry_label();
        for &node in &self.reachable.clone() {
            if node == entry {
                continue;
            }
            let doms = &self.dominators[&node];
            let idom = doms.iter().copied().find(|&cand| {
                cand != node
                    && doms
                        .iter()
                        .all(|&other| other == node || !self.strictly_dominates(cand, other))
            });
            let idom =
                idom.unwrap_or_else(|| panic!("block <{}> has no immediate dominator", node));
            self.idom.insert(node, idom);
        }
    }

    fn build_children(&mut self, func: &FunctionModule) {
        let entry = func.entry_label();
        for &node in &self.reachable.clone() {
            if node == entry {
                continue;
            }
            if let Some(&parent) = self.idom.get(&node) {
                self.children.get_mut(&parent).unwrap().insert(node);
            }
        }
    }

    // Edge-walking method: for each CFG edge a -> b, walk x = a upward
    // through immediate dominators until x strictly dominates b, adding b to
    // DF(x) at each step.
    fn build_frontier(&mut self, func: &FunctionModule) {
        for bb in &func.blocks {
            let a = bb.label;
            if !self.reachable.contains(&a) {
                continue;
            }
            for b in bb.successors() {
                let mut x = a;
                while !self.strictly_dominates(x, b) {
                    let df = self.frontier.get_mut(&x).unwrap();
                    if !df.contains(&b) {
                        df.push(b);
                    }
                    match self.idom.get(&x) {
                        Some(&up) => x = up,
                        None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Addr, InstKind};

    // Diamond: 0 -> {1, 2} -> 3
    fn diamond() -> FunctionModule {
        let mut func = FunctionModule::new("f", vec![]);
        let b0 = func.push_block();
        let b1 = func.push_block();
        let b2 = func.push_block();
        let b3 = func.push_block();
        func.block_mut(b0).push(InstKind::Branch {
            cond: Addr::local("c"),
            then_label: b1,
            else_label: b2,
        });
        func.block_mut(b1).push(InstKind::Jump { target: b3 });
        func.block_mut(b2).push(InstKind::Jump { target: b3 });
        func.block_mut(b3).push(InstKind::Ret { value: None });
        func
    }

    #[test]
    fn test_diamond_dominators() {
        let func = diamond();
        let tree = DominatorTree::build(&func);
        assert!(tree.dominates(0, 3));
        assert!(!tree.dominates(1, 3));
        assert!(!tree.dominates(2, 3));
        assert_eq!(tree.idom(3), Some(0));
        assert_eq!(tree.idom(1), Some(0));
        assert_eq!(tree.idom(0), None);
    }

    #[test]
    fn test_diamond_frontier() {
        let func = diamond();
        let tree = DominatorTree::build(&func);
        assert_eq!(tree.frontier(1), &[3]);
        assert_eq!(tree.frontier(2), &[3]);
        assert!(tree.frontier(0).is_empty());
    }

    #[test]
    fn test_loop_back_edge_frontier() {
        // 0 -> 1; 1 -> {1, 2}: the header 1 is in its own frontier
        let mut func = FunctionModule::new("f", vec![]);
        let b0 = func.push_block();
        let b1 = func.push_block();
        let b2 = func.push_block();
        func.block_mut(b0).push(InstKind::Jump { target: b1 });
        func.block_mut(b1).push(InstKind::Branch {
            cond: Addr::local("c"),
            then_label: b1,
            else_label: b2,
        });
        func.block_mut(b2).push(InstKind::Ret { value: None });

        let tree = DominatorTree::build(&func);
        assert!(tree.frontier(1).contains(&1));
    }
}
