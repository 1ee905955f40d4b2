//! Reassociation of add/sub/neg forests
//!
//! Per block: connected `add`/`sub`/`neg`/`assign` trees rooted at values
//! that escape the block (or have several uses) are flattened into signed
//! operand lists, matching positive/negative operands and literals cancel,
//! operands are ranked by subtree size, and large trees are rebuilt in
//! balanced form. Small trees are left alone.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use super::FunctionPass;
use crate::analysis::{DefUseChain, UseDefChain};
use crate::ir::{Addr, BinaryOp, FunctionModule, Inst, InstKind, UnaryOp, PHI_NAN};

const REBUILD_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Add,
    Sub,
    Neg,
    Assign,
    Leaf,
    Literal,
    Root,
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    value: Addr,
    children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RankedNode {
    rank: usize,
    positive: bool,
    value: Addr,
}

impl Ord for RankedNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.rank, self.positive, crate::ir::fmt_addr(&self.value)).cmp(&(
            other.rank,
            other.positive,
            crate::ir::fmt_addr(&other.value),
        ))
    }
}

impl PartialOrd for RankedNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Reassociation pass
#[derive(Default)]
pub struct Reassociation {
    modified: bool,
}

impl FunctionPass for Reassociation {
    fn name(&self) -> &'static str {
        "reassociation"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        let labels: Vec<usize> = func.blocks.iter().map(|bb| bb.label).collect();
        for label in labels {
            self.run_on_block(func, label);
        }
        func.remove_deleted();
        self.modified
    }
}

struct BlockCtx {
    label: usize,
    roots: BTreeSet<String>,
    use_def: UseDefChain,
}

impl Reassociation {
    fn run_on_block(&mut self, func: &mut FunctionModule, label: usize) {
        let ctx = BlockCtx {
            label,
            roots: find_roots(func, label),
            use_def: UseDefChain::build(func),
        };

        // flatten and cancel each root's tree
        let mut flattened: BTreeMap<String, Vec<(bool, Addr)>> = BTreeMap::new();
        for root in &ctx.roots {
            let tree = build_tree(func, &ctx, &Addr::local(root.clone()), true);
            let mut nodes = Vec::new();
            flatten(&tree, true, &mut nodes);
            if nodes.len() < REBUILD_THRESHOLD {
                continue;
            }
            flattened.insert(root.clone(), cancel(nodes));
        }
        if flattened.is_empty() {
            return;
        }

        // rank: literals are free, leaves cost one, nested roots carry their
        // own rank
        let mut root_rank: HashMap<String, usize> = HashMap::new();
        let names: Vec<String> = flattened.keys().cloned().collect();
        for root in &names {
            rank_root(root, &flattened, &mut root_rank);
        }

        for root in names {
            let operands = &flattened[&root];
            let mut heap: BinaryHeap<Reverse<RankedNode>> = BinaryHeap::new();
            for (positive, value) in operands {
                let ranked = match value {
                    Addr::Imm(v) => RankedNode {
                        rank: 0,
                        positive: true,
                        value: Addr::Imm(if *positive { *v } else { v.wrapping_neg() }),
                    },
                    _ => {
                        let rank = value
                            .as_local()
                            .and_then(|n| root_rank.get(n).copied())
                            .unwrap_or(1);
                        RankedNode {
                            rank,
                            positive: *positive,
                            value: value.clone(),
                        }
                    }
                };
                heap.push(Reverse(ranked));
            }
            self.rebuild(func, label, &root, heap);
        }
    }

    // replace the root's defining instruction by a balanced computation,
    // combining the cheapest operands first
    fn rebuild(
        &mut self,
        func: &mut FunctionModule,
        label: usize,
        root: &str,
        mut heap: BinaryHeap<Reverse<RankedNode>>,
    ) {
        let pos = func.position(label).unwrap();
        let root_idx = func.blocks[pos]
            .insts
            .iter()
            .position(|inst| inst.dest_name() == Some(root))
            .expect("root definition must be in this block");
        let root_dest = Addr::local(root);

        let mut emitted: Vec<Inst> = Vec::new();

        if heap.len() == 1 {
            let Reverse(only) = heap.pop().unwrap();
            let kind = if only.positive {
                InstKind::Assign {
                    dest: root_dest,
                    src: only.value,
                }
            } else {
                InstKind::Unary {
                    dest: root_dest,
                    op: UnaryOp::Neg,
                    operand: only.value,
                }
            };
            emitted.push(Inst::new(kind));
        } else {
            while heap.len() >= 2 {
                let Reverse(mut lhs) = heap.pop().unwrap();
                let Reverse(mut rhs) = heap.pop().unwrap();
                if !lhs.positive {
                    std::mem::swap(&mut lhs, &mut rhs);
                }
                let mut lhs_value = lhs.value.clone();
                if !lhs.positive {
                    // both operands negative: negate the left one explicitly
                    let tmp = func.temps.fresh();
                    emitted.push(Inst::new(InstKind::Unary {
                        dest: tmp.clone(),
                        op: UnaryOp::Neg,
                        operand: lhs.value.clone(),
                    }));
                    lhs_value = tmp;
                }
                let dest = if heap.is_empty() {
                    root_dest.clone()
                } else {
                    func.temps.fresh()
                };
                emitted.push(Inst::new(InstKind::Binary {
                    dest: dest.clone(),
                    op: if rhs.positive {
                        BinaryOp::Add
                    } else {
                        BinaryOp::Sub
                    },
                    lhs: lhs_value,
                    rhs: rhs.value.clone(),
                }));
                if !heap.is_empty() {
                    heap.push(Reverse(RankedNode {
                        rank: lhs.rank + rhs.rank,
                        positive: true,
                        value: dest,
                    }));
                }
            }
        }

        let bb = &mut func.blocks[pos];
        bb.insts[root_idx] = Inst::new(InstKind::Deleted);
        let tail = bb.insts.split_off(root_idx);
        bb.insts.extend(emitted);
        bb.insts.extend(tail);
        self.modified = true;
    }
}

// Roots are add/sub/neg/assign results consumed more than once, outside this
// block, or by an instruction that anchors a value (ret, store, call, load).
fn find_roots(func: &FunctionModule, label: usize) -> BTreeSet<String> {
    let def_use = DefUseChain::build(func);
    let mut roots = BTreeSet::new();
    for inst in &func.block(label).insts {
        let Some(dest) = inst.dest_name() else { continue };
        if !is_tree_op(&inst.kind) {
            continue;
        }
        let uses = def_use.uses(dest);
        if uses.is_empty() {
            continue;
        }
        if uses.len() > 1 || uses[0].bb != label {
            roots.insert(dest.to_string());
            continue;
        }
        if matches!(
            uses[0].inst.kind,
            InstKind::Ret { .. }
                | InstKind::Store { .. }
                | InstKind::Call { .. }
                | InstKind::Load { .. }
        ) {
            roots.insert(dest.to_string());
        }
    }
    roots
}

fn is_tree_op(kind: &InstKind) -> bool {
    match kind {
        InstKind::Binary { op, .. } => matches!(op, BinaryOp::Add | BinaryOp::Sub),
        InstKind::Unary { op, .. } => *op == UnaryOp::Neg,
        InstKind::Assign { .. } => true,
        _ => false,
    }
}

fn build_tree(func: &FunctionModule, ctx: &BlockCtx, addr: &Addr, first: bool) -> Node {
    match addr {
        Addr::Imm(_) => {
            return Node {
                kind: NodeKind::Literal,
                value: addr.clone(),
                children: vec![],
            }
        }
        Addr::Global(_) => {
            return Node {
                kind: NodeKind::Leaf,
                value: addr.clone(),
                children: vec![],
            }
        }
        _ => {}
    }

    let name = addr.as_local().expect("tree operand must be a register");
    let leaf = || Node {
        kind: NodeKind::Leaf,
        value: addr.clone(),
        children: vec![],
    };

    if func.is_parameter(name) || name == PHI_NAN {
        return leaf();
    }
    if !first && ctx.roots.contains(name) {
        return Node {
            kind: NodeKind::Root,
            value: addr.clone(),
            children: vec![],
        };
    }
    let Some(def) = ctx.use_def.def(name) else {
        return leaf();
    };
    if def.bb != ctx.label {
        return leaf();
    }

    match &def.inst.kind {
        InstKind::Binary { op, lhs, rhs, .. } if matches!(op, BinaryOp::Add | BinaryOp::Sub) => {
            Node {
                kind: if *op == BinaryOp::Add {
                    NodeKind::Add
                } else {
                    NodeKind::Sub
                },
                value: addr.clone(),
                children: vec![
                    build_tree(func, ctx, lhs, false),
                    build_tree(func, ctx, rhs, false),
                ],
            }
        }
        InstKind::Unary {
            op: UnaryOp::Neg,
            operand,
            ..
        } => Node {
            kind: NodeKind::Neg,
            value: addr.clone(),
            children: vec![build_tree(func, ctx, operand, false)],
        },
        InstKind::Assign { src, .. } => Node {
            kind: NodeKind::Assign,
            value: addr.clone(),
            children: vec![build_tree(func, ctx, src, false)],
        },
        _ => leaf(),
    }
}

fn flatten(node: &Node, positive: bool, out: &mut Vec<(bool, Addr)>) {
    match node.kind {
        NodeKind::Add => {
            flatten(&node.children[0], positive, out);
            flatten(&node.children[1], positive, out);
        }
        NodeKind::Sub => {
            flatten(&node.children[0], positive, out);
            flatten(&node.children[1], !positive, out);
        }
        NodeKind::Neg => flatten(&node.children[0], !positive, out),
        NodeKind::Assign => flatten(&node.children[0], positive, out),
        NodeKind::Leaf | NodeKind::Literal | NodeKind::Root => {
            out.push((positive, node.value.clone()));
        }
    }
}

// fold all literals into one and cancel +x/-x pairs
fn cancel(nodes: Vec<(bool, Addr)>) -> Vec<(bool, Addr)> {
    let mut literal: i64 = 0;
    let mut positive: Vec<Addr> = Vec::new();
    let mut negative: Vec<Addr> = Vec::new();

    for (pos, addr) in nodes {
        if let Addr::Imm(v) = addr {
            literal = if pos {
                literal.wrapping_add(v)
            } else {
                literal.wrapping_sub(v)
            };
            continue;
        }
        if pos {
            positive.push(addr);
        } else {
            negative.push(addr);
        }
    }

    let mut res: Vec<(bool, Addr)> = Vec::new();
    for p in positive {
        if let Some(i) = negative.iter().position(|n| *n == p) {
            negative.remove(i);
            continue;
        }
        res.push((true, p));
    }
    for n in negative {
        res.push((false, n));
    }
    res.push((true, Addr::Imm(literal)));
    res
}

fn rank_root(
    root: &str,
    flattened: &BTreeMap<String, Vec<(bool, Addr)>>,
    root_rank: &mut HashMap<String, usize>,
) -> usize {
    if let Some(&r) = root_rank.get(root) {
        return r;
    }
    // break self-reference cycles defensively
    root_rank.insert(root.to_string(), 1);
    let mut rank = 0;
    if let Some(nodes) = flattened.get(root) {
        for (_, addr) in nodes {
            match addr {
                Addr::Imm(_) => {}
                Addr::Local(name) if flattened.contains_key(name) => {
                    rank += rank_root(name, flattened, root_rank);
                }
                _ => rank += 1,
            }
        }
    }
    root_rank.insert(root.to_string(), rank.max(1));
    rank.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_literals_and_pairs() {
        let nodes = vec![
            (true, Addr::local("a")),
            (false, Addr::local("a")),
            (true, Addr::local("b")),
            (true, Addr::Imm(5)),
            (false, Addr::Imm(2)),
        ];
        let res = cancel(nodes);
        assert_eq!(res, vec![(true, Addr::local("b")), (true, Addr::Imm(3))]);
    }

    #[test]
    fn test_long_chain_rebuilt_with_cancellation() {
        // r = a + b + c + d + e - a - b - c - d + 1 + 2, used by ret:
        // flattens to e + 3
        let mut func = FunctionModule::new(
            "f",
            vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
        );
        let entry = func.push_block();
        let names = ["0", "1", "2", "3", "4"];
        let bb = func.block_mut(entry);
        let mut prev = Addr::local(names[0]);
        let mut tmp_idx = 0;
        let mut push_bin = |bb: &mut crate::ir::BasicBlock, op, lhs: Addr, rhs: Addr| {
            let dest = Addr::local(format!("t{}", tmp_idx));
            tmp_idx += 1;
            bb.push(InstKind::Binary {
                dest: dest.clone(),
                op,
                lhs,
                rhs,
            });
            dest
        };
        for name in &names[1..] {
            prev = push_bin(bb, BinaryOp::Add, prev, Addr::local(*name));
        }
        for name in &names[..4] {
            prev = push_bin(bb, BinaryOp::Sub, prev, Addr::local(*name));
        }
        prev = push_bin(bb, BinaryOp::Add, prev, Addr::Imm(1));
        prev = push_bin(bb, BinaryOp::Add, prev, Addr::Imm(2));
        bb.push(InstKind::Ret { value: Some(prev.clone()) });

        assert!(Reassociation::default().run(&mut func));
        // the final definition of the returned value is e + 3
        let root = prev.as_local().unwrap();
        let def = func
            .block(entry)
            .insts
            .iter()
            .find(|i| i.dest_name() == Some(root))
            .unwrap();
        match &def.kind {
            InstKind::Binary { op, lhs, rhs, .. } => {
                assert_eq!(*op, BinaryOp::Add);
                assert_eq!(lhs, &Addr::Imm(3));
                assert_eq!(rhs, &Addr::local("4"));
            }
            other => panic!("expected rebuilt add, got {:?}", other),
        }
    }

    #[test]
    fn test_small_trees_left_alone() {
        let mut func = FunctionModule::new("f", vec!["x".into(), "y".into()]);
        let entry = func.push_block();
        let bb = func.block_mut(entry);
        bb.push(InstKind::Binary {
            dest: Addr::local("t"),
            op: BinaryOp::Add,
            lhs: Addr::local("0"),
            rhs: Addr::local("1"),
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("t")),
        });
        assert!(!Reassociation::default().run(&mut func));
    }
}
