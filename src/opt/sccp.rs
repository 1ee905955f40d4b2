//! Sparse conditional constant propagation (on SSA)
//!
//! Three-level lattice Top / Const(k) / Bottom with a worklist over SSA uses.
//! `0 * x` and `0 & x` collapse to zero even when `x` is unknown; division by
//! zero falls to Bottom rather than folding. Compile-time arithmetic mirrors
//! runtime 64-bit signed two's complement.

use std::collections::{HashMap, VecDeque};

use super::FunctionPass;
use crate::ir::{
    eval_binary, eval_relation, eval_unary, Addr, BinaryOp, FunctionModule, Inst, InstKind,
    PHI_NAN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
    Top,
    Const(i64),
    Bottom,
}

/// Sparse conditional constant propagation pass
#[derive(Default)]
pub struct Sccp {
    /// register name -> its defining instruction kind
    inst_define: HashMap<String, InstKind>,
    /// register name -> destinations of the instructions using it
    users: HashMap<String, Vec<String>>,
    values: HashMap<String, Value>,
    modifications: usize,
}

impl FunctionPass for Sccp {
    fn name(&self) -> &'static str {
        "sccp"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        self.build_defs_and_users(func);
        self.initialize_and_propagate();
        self.rewrite(func);
        func.remove_deleted();
        self.modifications != 0
    }
}

impl Sccp {
    fn build_defs_and_users(&mut self, func: &FunctionModule) {
        for bb in &func.blocks {
            for inst in &bb.insts {
                let Some(dest) = inst.dest_name() else { continue };
                self.inst_define.insert(dest.to_string(), inst.kind.clone());
                for operand in inst.operands() {
                    if let Some(name) = operand.as_local() {
                        self.users
                            .entry(name.to_string())
                            .or_default()
                            .push(dest.to_string());
                    }
                }
            }
        }
    }

    fn initialize_and_propagate(&mut self) {
        let names: Vec<String> = self.inst_define.keys().cloned().collect();
        // optimistic start: every defined name is Top until evaluated, so
        // evaluation order cannot pin a not-yet-seen operand to Bottom
        for name in &names {
            self.values.insert(name.clone(), Value::Top);
        }
        let mut worklist = VecDeque::new();
        for name in names {
            let val = self.compute_value(&name);
            self.values.insert(name.clone(), val);
            if val != Value::Top {
                worklist.push_back(name);
            }
        }
        self.propagate_from(worklist);
    }

    fn propagate_from(&mut self, mut worklist: VecDeque<String>) {
        while let Some(name) = worklist.pop_front() {
            for user in self.users.get(&name).cloned().unwrap_or_default() {
                if self.values.get(&user) == Some(&Value::Bottom) {
                    continue;
                }
                let new_val = self.compute_value(&user);
                let old_val = self.values[&user];
                if old_val != new_val {
                    self.values.insert(user.clone(), new_val);
                    worklist.push_back(user);
                }
            }
        }
    }

    fn rewrite(&mut self, func: &mut FunctionModule) {
        for bb in &mut func.blocks {
            for inst in bb.insts.iter_mut() {
                if let Some(dest) = inst.dest_name() {
                    if let Some(Value::Const(_)) = self.values.get(dest) {
                        // every use is rewritten to the literal, so the
                        // definition itself dies
                        self.modifications += 1;
                        *inst = Inst::new(InstKind::Deleted);
                        continue;
                    }
                }
                for operand in inst.operands_mut() {
                    let Some(name) = operand.as_local() else { continue };
                    if let Some(Value::Const(k)) = self.values.get(name) {
                        *operand = Addr::Imm(*k);
                        self.modifications += 1;
                    }
                }
            }
        }
    }

    fn value_of(&mut self, addr: &Addr) -> Value {
        match addr {
            Addr::Imm(v) => Value::Const(*v),
            Addr::Global(_) => Value::Bottom,
            Addr::Local(name) => match self.values.get(name) {
                Some(v) => *v,
                // parameters and other unknown names are runtime inputs
                None => Value::Bottom,
            },
            Addr::Label(_) => Value::Bottom,
        }
    }

    fn compute_value(&mut self, dest: &str) -> Value {
        let kind = self.inst_define[dest].clone();
        match kind {
            InstKind::Assign { src, .. } => self.value_of(&src),
            InstKind::Unary { op, operand, .. } => match self.value_of(&operand) {
                Value::Const(v) => Value::Const(eval_unary(op, v)),
                other => other,
            },
            InstKind::Binary { op, lhs, rhs, .. } => {
                let lhs_v = self.value_of(&lhs);
                let rhs_v = self.value_of(&rhs);
                // zero annihilates even an unknown operand
                if matches!(op, BinaryOp::Mul | BinaryOp::BitAnd)
                    && (lhs_v == Value::Const(0) || rhs_v == Value::Const(0))
                {
                    return Value::Const(0);
                }
                if lhs_v == Value::Bottom || rhs_v == Value::Bottom {
                    return Value::Bottom;
                }
                if let (Value::Const(a), Value::Const(b)) = (lhs_v, rhs_v) {
                    return match eval_binary(op, a, b) {
                        Some(v) => Value::Const(v),
                        None => Value::Bottom,
                    };
                }
                Value::Top
            }
            InstKind::Relation { op, lhs, rhs, .. } => {
                let lhs_v = self.value_of(&lhs);
                let rhs_v = self.value_of(&rhs);
                if lhs_v == Value::Bottom || rhs_v == Value::Bottom {
                    return Value::Bottom;
                }
                if let (Value::Const(a), Value::Const(b)) = (lhs_v, rhs_v) {
                    return Value::Const(eval_relation(op, a, b));
                }
                Value::Top
            }
            InstKind::Phi { options, .. } => {
                let mut last: Option<i64> = None;
                for (value, _) in &options {
                    if value.as_local() == Some(PHI_NAN) {
                        continue;
                    }
                    match self.value_of(value) {
                        Value::Bottom => return Value::Bottom,
                        Value::Top => return Value::Top,
                        Value::Const(v) => match last {
                            None => last = Some(v),
                            Some(prev) if prev != v => return Value::Bottom,
                            Some(_) => {}
                        },
                    }
                }
                match last {
                    Some(v) => Value::Const(v),
                    None => Value::Bottom,
                }
            }
            // memory and call results are runtime values
            InstKind::Load { .. }
            | InstKind::Alloca { .. }
            | InstKind::Malloc { .. }
            | InstKind::SAlloc { .. }
            | InstKind::Call { .. } => Value::Bottom,
            other => unreachable!("instruction without a value: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RelOp;

    fn run_sccp(func: &mut FunctionModule) -> bool {
        Sccp::default().run(func)
    }

    #[test]
    fn test_folds_constant_expression() {
        // return 1 + 2 * 3
        let mut func = FunctionModule::new("main", vec![]);
        let entry = func.push_block();
        let bb = func.block_mut(entry);
        bb.push(InstKind::Binary {
            dest: Addr::local("a"),
            op: BinaryOp::Mul,
            lhs: Addr::Imm(2),
            rhs: Addr::Imm(3),
        });
        bb.push(InstKind::Binary {
            dest: Addr::local("b"),
            op: BinaryOp::Add,
            lhs: Addr::Imm(1),
            rhs: Addr::local("a"),
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("b")),
        });

        assert!(run_sccp(&mut func));
        let bb = func.block(entry);
        assert_eq!(bb.insts.len(), 1);
        assert_eq!(
            bb.insts[0].kind,
            InstKind::Ret {
                value: Some(Addr::Imm(7))
            }
        );
    }

    #[test]
    fn test_zero_annihilates_unknown() {
        let mut func = FunctionModule::new("f", vec!["x".into()]);
        let entry = func.push_block();
        let bb = func.block_mut(entry);
        bb.push(InstKind::Binary {
            dest: Addr::local("a"),
            op: BinaryOp::Mul,
            lhs: Addr::Imm(0),
            rhs: Addr::local("0"),
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("a")),
        });
        assert!(run_sccp(&mut func));
        assert_eq!(
            func.block(entry).insts[0].kind,
            InstKind::Ret {
                value: Some(Addr::Imm(0))
            }
        );
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        let bb = func.block_mut(entry);
        bb.push(InstKind::Binary {
            dest: Addr::local("a"),
            op: BinaryOp::Div,
            lhs: Addr::Imm(1),
            rhs: Addr::Imm(0),
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("a")),
        });
        run_sccp(&mut func);
        // the division survives; only a fatal runtime can decide its fate
        assert!(matches!(
            func.block(entry).insts[0].kind,
            InstKind::Binary { .. }
        ));
    }

    #[test]
    fn test_branch_condition_becomes_literal() {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        let t = func.push_block();
        let e = func.push_block();
        let bb = func.block_mut(entry);
        bb.push(InstKind::Relation {
            dest: Addr::local("c"),
            op: RelOp::Lt,
            lhs: Addr::Imm(1),
            rhs: Addr::Imm(2),
        });
        bb.push(InstKind::Branch {
            cond: Addr::local("c"),
            then_label: t,
            else_label: e,
        });
        func.block_mut(t).push(InstKind::Ret { value: Some(Addr::Imm(1)) });
        func.block_mut(e).push(InstKind::Ret { value: Some(Addr::Imm(0)) });

        assert!(run_sccp(&mut func));
        assert!(matches!(
            func.block(entry).insts[0].kind,
            InstKind::Branch { cond: Addr::Imm(1), .. }
        ));
    }

    #[test]
    fn test_idempotent() {
        let mut func = FunctionModule::new("main", vec![]);
        let entry = func.push_block();
        let bb = func.block_mut(entry);
        bb.push(InstKind::Binary {
            dest: Addr::local("a"),
            op: BinaryOp::Add,
            lhs: Addr::Imm(3),
            rhs: Addr::Imm(4),
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("a")),
        });
        assert!(run_sccp(&mut func));
        assert!(!run_sccp(&mut func), "second run must not modify");
    }
}
