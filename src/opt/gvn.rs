//! Hash-based global value numbering
//!
//! Dominator-tree-scoped value numbering after Briggs, Cooper and Simpson
//! (1997). Each instruction's right-hand side is reduced to a canonical key:
//! connected add/sub/neg expressions become signed term multisets with
//! literal folding and cancellation, commutative operands are ordered by
//! their value-number key, and relations are canonicalized (`>`/`>=` swap
//! into `<`/`<=`). A key seen on a dominating path makes the instruction
//! redundant; its destination is value-numbered to the earlier result.
//! Meaningless phis and phis duplicating an earlier phi of the same block
//! are eliminated as well.

use std::collections::HashMap;

use super::FunctionPass;
use crate::analysis::DominatorTree;
use crate::ir::{
    fmt_addr, Addr, BinaryOp, FunctionModule, Inst, InstKind, RelOp, UnaryOp,
};

/// Signed-term normal form of an add/sub/neg expression
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Terms {
    lit: i64,
    pos: Vec<String>,
    neg: Vec<String>,
}

impl Terms {
    fn from_lit(v: i64) -> Self {
        Terms {
            lit: v,
            ..Default::default()
        }
    }

    fn atom(key: String) -> Self {
        Terms {
            lit: 0,
            pos: vec![key],
            neg: Vec::new(),
        }
    }

    fn negated(mut self) -> Self {
        self.lit = self.lit.wrapping_neg();
        std::mem::swap(&mut self.pos, &mut self.neg);
        self
    }

    fn combine(&mut self, other: &Terms, positive: bool) {
        if positive {
            self.lit = self.lit.wrapping_add(other.lit);
            self.pos.extend(other.pos.iter().cloned());
            self.neg.extend(other.neg.iter().cloned());
        } else {
            self.lit = self.lit.wrapping_sub(other.lit);
            self.pos.extend(other.neg.iter().cloned());
            self.neg.extend(other.pos.iter().cloned());
        }
        self.cancel();
    }

    // matching positive/negative atoms cancel out
    fn cancel(&mut self) {
        self.pos.sort_unstable();
        self.neg.sort_unstable();
        let mut kept_pos = Vec::new();
        for p in self.pos.drain(..) {
            if let Some(i) = self.neg.iter().position(|n| *n == p) {
                self.neg.remove(i);
            } else {
                kept_pos.push(p);
            }
        }
        self.pos = kept_pos;
    }

    fn as_literal(&self) -> Option<i64> {
        (self.pos.is_empty() && self.neg.is_empty()).then_some(self.lit)
    }

    fn key(&self) -> String {
        let mut s = String::new();
        for p in &self.pos {
            s.push('+');
            s.push_str(p);
        }
        for n in &self.neg {
            s.push('-');
            s.push_str(n);
        }
        if self.lit != 0 || s.is_empty() {
            s.push('#');
            s.push_str(&self.lit.to_string());
        }
        s
    }
}

type ValueTable = HashMap<String, Addr>;
type ExprMap = HashMap<String, Addr>;
type History = HashMap<String, Terms>;

/// Global value numbering pass
#[derive(Default)]
pub struct GlobalValueNumbering {
    cnt: usize,
}

impl FunctionPass for GlobalValueNumbering {
    fn name(&self) -> &'static str {
        "gvn"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        let dom = DominatorTree::build(func);
        let entry = func.entry_label();
        self.number_block(
            func,
            &dom,
            entry,
            ValueTable::new(),
            History::new(),
            ExprMap::new(),
        );
        func.remove_deleted();
        self.cnt != 0
    }
}

fn vn_get(vt: &mut ValueTable, addr: &Addr) -> Addr {
    match addr {
        Addr::Imm(_) | Addr::Label(_) => addr.clone(),
        Addr::Local(name) | Addr::Global(name) => vt
            .entry(name.clone())
            .or_insert_with(|| addr.clone())
            .clone(),
    }
}

fn vn_set(vt: &mut ValueTable, dest: &Addr, value: Addr) {
    vt.insert(dest.reg_name().unwrap().to_string(), value);
}

// the Terms form of an operand: literals fold, registers resolve through
// the history of their value number
fn terms_of(vt: &mut ValueTable, history: &History, addr: &Addr) -> Terms {
    let vn = vn_get(vt, addr);
    match &vn {
        Addr::Imm(v) => Terms::from_lit(*v),
        Addr::Local(name) | Addr::Global(name) => history
            .get(name)
            .cloned()
            .unwrap_or_else(|| Terms::atom(fmt_addr(&vn))),
        Addr::Label(_) => unreachable!("label used as value"),
    }
}

fn atom_key(vt: &mut ValueTable, history: &History, addr: &Addr) -> String {
    terms_of(vt, history, addr).key()
}

fn rel_name(op: RelOp) -> &'static str {
    match op {
        RelOp::Eq => "==",
        RelOp::Ne => "!=",
        RelOp::Lt => "<",
        RelOp::Gt => ">",
        RelOp::Le => "<=",
        RelOp::Ge => ">=",
    }
}

fn bin_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::BitOr => "|",
        BinaryOp::BitAnd => "&",
        BinaryOp::Xor => "^",
        BinaryOp::Shl => "<<",
        BinaryOp::Shr => ">>",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Add | BinaryOp::Sub => unreachable!("add/sub use the terms form"),
    }
}

// canonical key of an instruction's right-hand side
fn hash_inst(vt: &mut ValueTable, history: &mut History, inst: &Inst) -> String {
    let dest_name = inst.dest_name().unwrap().to_string();
    match &inst.kind {
        InstKind::Assign { src, .. } => {
            let entry = terms_of(vt, history, src);
            let key = entry.key();
            history.insert(dest_name, entry);
            key
        }
        InstKind::Unary { op, operand, .. } => match op {
            UnaryOp::Neg => {
                let entry = terms_of(vt, history, operand).negated();
                let key = entry.key();
                history.insert(dest_name, entry);
                key
            }
            UnaryOp::BitNot => {
                if let Some(v) = terms_of(vt, history, operand).as_literal() {
                    let entry = Terms::from_lit(!v);
                    let key = entry.key();
                    history.insert(dest_name, entry);
                    return key;
                }
                let key = format!("~{}", atom_key(vt, history, operand));
                history.insert(dest_name.clone(), Terms::atom(fmt_addr(&Addr::Local(dest_name))));
                key
            }
        },
        InstKind::Binary { op, lhs, rhs, .. } => match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let mut entry = terms_of(vt, history, lhs);
                let rhs_terms = terms_of(vt, history, rhs);
                entry.combine(&rhs_terms, *op == BinaryOp::Add);
                let key = entry.key();
                history.insert(dest_name, entry);
                key
            }
            _ => {
                let mut lhs_key = atom_key(vt, history, lhs);
                let mut rhs_key = atom_key(vt, history, rhs);
                let lhs_lit = terms_of(vt, history, lhs).as_literal();
                let rhs_lit = terms_of(vt, history, rhs).as_literal();
                if matches!(op, BinaryOp::Mul | BinaryOp::BitAnd)
                    && (lhs_lit == Some(0) || rhs_lit == Some(0))
                {
                    let entry = Terms::from_lit(0);
                    let key = entry.key();
                    history.insert(dest_name, entry);
                    return key;
                }
                if op.is_commutative() && lhs_key > rhs_key {
                    std::mem::swap(&mut lhs_key, &mut rhs_key);
                }
                history.insert(dest_name.clone(), Terms::atom(fmt_addr(&Addr::Local(dest_name))));
                format!("{}{}{}", lhs_key, bin_name(*op), rhs_key)
            }
        },
        InstKind::Relation { op, lhs, rhs, .. } => {
            let mut op = *op;
            let mut lhs_key = atom_key(vt, history, lhs);
            let mut rhs_key = atom_key(vt, history, rhs);
            if lhs_key == rhs_key {
                let folded = matches!(op, RelOp::Eq | RelOp::Le | RelOp::Ge) as i64;
                let entry = Terms::from_lit(folded);
                let key = entry.key();
                history.insert(dest_name, entry);
                return key;
            }
            if matches!(op, RelOp::Eq | RelOp::Ne) && lhs_key > rhs_key {
                std::mem::swap(&mut lhs_key, &mut rhs_key);
            }
            if op == RelOp::Ge {
                std::mem::swap(&mut lhs_key, &mut rhs_key);
                op = RelOp::Le;
            } else if op == RelOp::Gt {
                std::mem::swap(&mut lhs_key, &mut rhs_key);
                op = RelOp::Lt;
            }
            history.insert(dest_name.clone(), Terms::atom(fmt_addr(&Addr::Local(dest_name))));
            format!("{}{}{}", lhs_key, rel_name(op), rhs_key)
        }
        other => unreachable!("hash_inst on {:?}", other),
    }
}

fn same_addr(a: &Addr, b: &Addr) -> bool {
    a == b
}

fn sorted_options(options: &[(Addr, usize)]) -> Vec<(Addr, usize)> {
    let mut res = options.to_vec();
    res.sort_by_key(|(_, label)| *label);
    res
}

impl GlobalValueNumbering {
    #[allow(clippy::too_many_arguments)]
    fn number_block(
        &mut self,
        func: &mut FunctionModule,
        dom: &DominatorTree,
        label: usize,
        mut vt: ValueTable,
        mut history: History,
        mut exprs: ExprMap,
    ) {
        let pos = func.position(label).unwrap();

        // phi prefix
        let phi_end = func.blocks[pos].phi_count();
        for idx in 0..phi_end {
            let inst = &func.blocks[pos].insts[idx];
            if inst.is_deleted() {
                continue;
            }
            let InstKind::Phi { dest, options } = &inst.kind else {
                unreachable!()
            };
            let dest = dest.clone();

            // meaningless phi: all options agree
            let first = options.first().map(|(v, _)| v.clone());
            if let Some(first) = first {
                if options.iter().all(|(v, _)| same_addr(v, &first)) {
                    vn_set(&mut vt, &dest, first);
                    func.blocks[pos].insts[idx] = Inst::new(InstKind::Deleted);
                    self.cnt += 1;
                    continue;
                }
            }

            // redundant phi: an earlier phi of this block has the same options
            let my_options = sorted_options(options);
            let earlier = func.blocks[pos].insts[..idx]
                .iter()
                .filter(|other| other.is_phi())
                .find_map(|other| {
                    let InstKind::Phi {
                        dest: other_dest,
                        options: other_options,
                    } = &other.kind
                    else {
                        return None;
                    };
                    let other_sorted = sorted_options(other_options);
                    (other_sorted.len() == my_options.len()
                        && other_sorted
                            .iter()
                            .zip(&my_options)
                            .all(|((a, _), (b, _))| same_addr(a, b)))
                    .then(|| other_dest.clone())
                });
            if let Some(earlier_dest) = earlier {
                vn_set(&mut vt, &dest, earlier_dest);
                func.blocks[pos].insts[idx] = Inst::new(InstKind::Deleted);
                self.cnt += 1;
                continue;
            }

            vn_set(&mut vt, &dest, dest.clone());
        }

        // straight-line value numbering over the rest of the block
        for idx in phi_end..func.blocks[pos].insts.len() {
            let inst = &mut func.blocks[pos].insts[idx];
            if inst.is_deleted() {
                continue;
            }
            for operand in inst.operands_mut() {
                *operand = vn_get(&mut vt, operand);
            }

            let Some(dest) = inst.dest().cloned() else { continue };
            match &inst.kind {
                InstKind::Load { .. }
                | InstKind::Alloca { .. }
                | InstKind::Malloc { .. }
                | InstKind::SAlloc { .. }
                | InstKind::Call { .. } => {
                    vn_set(&mut vt, &dest, dest.clone());
                    continue;
                }
                _ => {}
            }

            let inst_snapshot = inst.clone();
            let key = hash_inst(&mut vt, &mut history, &inst_snapshot);
            if let Some(rep) = exprs.get(&key) {
                vn_set(&mut vt, &dest, rep.clone());
                func.blocks[pos].insts[idx] = Inst::new(InstKind::Deleted);
                self.cnt += 1;
                continue;
            }
            vn_set(&mut vt, &dest, dest.clone());
            exprs.insert(key, dest);
        }

        // push value numbers into the phi options of the successors
        for succ in func.block(label).successors() {
            let succ_pos = func.position(succ).unwrap();
            for inst in func.blocks[succ_pos].insts.iter_mut() {
                if !inst.is_phi() {
                    if inst.is_deleted() {
                        continue;
                    }
                    break;
                }
                if let InstKind::Phi { options, .. } = &mut inst.kind {
                    for (value, pred) in options.iter_mut() {
                        if *pred == label {
                            *value = vn_get(&mut vt, value);
                        }
                    }
                }
            }
        }

        for child in dom.children(label).collect::<Vec<_>>() {
            self.number_block(func, dom, child, vt.clone(), history.clone(), exprs.clone());
        }
    }
}
