//! Natural loops, the loop tree and loop-invariant variables
//!
//! Back edges are found through the dominator tree (`a -> b` with `b`
//! dominating `a`); the natural loop of a back edge is everything that can
//! reach `a` backward without passing `b`, filtered to header-dominated
//! nodes. Loops sharing a header are merged; the loop tree is built by
//! repeatedly stripping innermost loops (Ch. 18 of the tiger book).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::dominance::DominatorTree;
use super::func_attr::FuncAttr;
use crate::ir::{FunctionModule, InstKind};

/// Loop structure of one function
///
/// The entry label carries a pseudo-loop containing every block, which makes
/// it the root of the loop tree.
#[derive(Debug, Default)]
pub struct LoopInfo {
    /// header -> union of its natural loops; a singleton set means the label
    /// is not a loop header
    loops: BTreeMap<usize, BTreeSet<usize>>,
    /// loop tree, each loop represented by its header
    tree: BTreeMap<usize, BTreeSet<usize>>,
    root: usize,
    depth: HashMap<usize, usize>,
    /// header -> loop-invariant register names
    invariant: HashMap<usize, HashSet<String>>,
}

impl LoopInfo {
    /// Detect loops in `func`
    pub fn build(func: &FunctionModule) -> Self {
        let mut info = Self::default();
        info.root = func.entry_label();

        let dom = DominatorTree::build(func);
        for bb in &func.blocks {
            info.loops.insert(bb.label, BTreeSet::from([bb.label]));
        }
        // pseudo-loop at the entry containing every block
        for bb in &func.blocks {
            info.loops.get_mut(&info.root).unwrap().insert(bb.label);
        }

        let preds = func.predecessors();
        for bb in &func.blocks {
            let from = bb.label;
            for to in bb.successors() {
                if dom.dominates(to, from) {
                    let natural = natural_loop(&preds, &dom, from, to);
                    info.loops.get_mut(&to).unwrap().extend(natural);
                }
            }
        }

        info.tree = build_loop_tree(&info.loops);
        info.build_depth();
        info
    }

    /// Detect loops and compute loop-invariant variables
    pub fn build_with_invariants(func: &FunctionModule, attr: &FuncAttr) -> Self {
        let mut info = Self::build(func);
        info.build_invariants(func, attr);
        info
    }

    /// Loop node sets, keyed by header
    pub fn loops(&self) -> &BTreeMap<usize, BTreeSet<usize>> {
        &self.loops
    }

    /// Whether `n` heads a loop
    pub fn is_loop_header(&self, n: usize) -> bool {
        self.loops.get(&n).is_some_and(|s| s.len() != 1)
    }

    /// Maximum loop depth of a block
    pub fn depth(&self, n: usize) -> usize {
        self.depth.get(&n).copied().unwrap_or(0)
    }

    /// Loop-invariant register names of the loop headed by `n`
    pub fn invariant_vars(&self, n: usize) -> &HashSet<String> {
        static EMPTY: std::sync::OnceLock<HashSet<String>> = std::sync::OnceLock::new();
        self.invariant
            .get(&n)
            .unwrap_or_else(|| EMPTY.get_or_init(HashSet::new))
    }

    /// Loop headers, innermost first
    pub fn post_order(&self) -> Vec<usize> {
        let mut res = Vec::new();
        let mut visited = HashSet::new();
        self.post_order_impl(self.root, &mut visited, &mut res);
        res
    }

    fn post_order_impl(&self, cur: usize, visited: &mut HashSet<usize>, out: &mut Vec<usize>) {
        if !visited.insert(cur) {
            return;
        }
        if let Some(children) = self.tree.get(&cur) {
            for &child in children {
                self.post_order_impl(child, visited, out);
            }
        }
        out.push(cur);
    }

    fn build_depth(&mut self) {
        fn dfs(info: &LoopInfo, cur: usize, cur_depth: usize, depth: &mut HashMap<usize, usize>) {
            for &node in &info.loops[&cur] {
                let d = depth.entry(node).or_insert(0);
                *d = (*d).max(cur_depth);
            }
            if let Some(children) = info.tree.get(&cur) {
                for &child in children {
                    dfs(info, child, cur_depth + 1, depth);
                }
            }
        }
        let mut depth = HashMap::new();
        dfs(self, self.root, 0, &mut depth);
        self.depth = depth;
    }

    // A value is loop-invariant iff its defining instruction is pure and all
    // its operands are literals, defined outside the loop, or themselves
    // invariant. Iterated to a fixed point per loop.
    fn build_invariants(&mut self, func: &FunctionModule, attr: &FuncAttr) {
        for (&header, nodes) in &self.loops {
            if nodes.len() == 1 && header != self.root {
                continue;
            }
            // register name -> defining kind, for defs inside this loop
            let mut inside_defs: HashMap<&str, &InstKind> = HashMap::new();
            for bb in &func.blocks {
                if !nodes.contains(&bb.label) {
                    continue;
                }
                for inst in &bb.insts {
                    if let Some(name) = inst.dest_name() {
                        inside_defs.insert(name, &inst.kind);
                    }
                }
            }

            let is_pure_kind = |kind: &InstKind| match kind {
                InstKind::Assign { .. }
                | InstKind::Unary { .. }
                | InstKind::Binary { .. }
                | InstKind::Relation { .. } => true,
                InstKind::Call { func: callee, .. } => attr.is_pure(callee),
                _ => false,
            };

            let mut invariant: HashSet<String> = HashSet::new();
            loop {
                let mut changed = false;
                for bb in &func.blocks {
                    if !nodes.contains(&bb.label) {
                        continue;
                    }
                    for inst in &bb.insts {
                        let Some(name) = inst.dest_name() else { continue };
                        if invariant.contains(name) || !is_pure_kind(&inst.kind) {
                            continue;
                        }
                        let all_invariant = inst.operands().iter().all(|op| match op {
                            crate::ir::Addr::Imm(_) | crate::ir::Addr::Global(_) => true,
                            crate::ir::Addr::Local(n) => {
                                !inside_defs.contains_key(n.as_str()) || invariant.contains(n)
                            }
                            crate::ir::Addr::Label(_) => true,
                        });
                        if all_invariant {
                            invariant.insert(name.to_string());
                            changed = true;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }
            self.invariant.insert(header, invariant);
        }
    }
}

// NaturalLoop(h, n) = {x | h dominates x and a path x -> n avoids h}: walk
// the CFG backward from n without passing h, then keep the h-dominated part.
fn natural_loop(
    preds: &BTreeMap<usize, Vec<usize>>,
    dom: &DominatorTree,
    n: usize,
    h: usize,
) -> BTreeSet<usize> {
    let mut visited = BTreeSet::new();
    let mut stack = vec![n];
    while let Some(cur) = stack.pop() {
        if cur == h || visited.contains(&cur) {
            continue;
        }
        visited.insert(cur);
        if let Some(ps) = preds.get(&cur) {
            stack.extend(ps.iter().copied());
        }
    }
    visited.into_iter().filter(|&x| dom.dominates(h, x)).collect()
}

// Each loop hangs off its nearest strictly-enclosing loop, i.e. the smallest
// other loop whose node set contains its header. The entry pseudo-loop
// contains every block and therefore roots the tree.
fn build_loop_tree(
    loops: &BTreeMap<usize, BTreeSet<usize>>,
) -> BTreeMap<usize, BTreeSet<usize>> {
    let mut res: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for &h in loops.keys() {
        res.insert(h, BTreeSet::new());
    }

    for (&h, nodes) in loops {
        if nodes.len() == 1 {
            continue;
        }
        let parent = loops
            .iter()
            .filter(|&(&p, p_nodes)| p != h && p_nodes.len() > 1 && p_nodes.contains(&h))
            .min_by_key(|(_, p_nodes)| p_nodes.len())
            .map(|(&p, _)| p);
        if let Some(p) = parent {
            res.get_mut(&p).unwrap().insert(h);
        }
    }

    res
}
