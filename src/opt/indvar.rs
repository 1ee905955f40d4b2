//! Induction-variable simplification
//!
//! Detects header phis of the shape `x = phi(init, x + step)` with a
//! loop-invariant step. Two induction variables sharing the same initial
//! value and step are duplicates; the later one is replaced by an
//! assignment to the earlier.

use std::collections::HashMap;

use super::FunctionPass;
use crate::analysis::{FuncAttr, LoopInfo, UseDefChain};
use crate::ir::{Addr, BinaryOp, FunctionModule, Inst, InstKind};

#[derive(Debug, Clone, PartialEq, Eq)]
struct IVar {
    initial: Addr,
    step: Addr,
}

/// Induction-variable simplification pass
pub struct InductionVariable<'a> {
    attr: &'a FuncAttr,
    replaced: usize,
}

impl<'a> InductionVariable<'a> {
    /// Create the pass with module-level function attributes
    pub fn new(attr: &'a FuncAttr) -> Self {
        Self { attr, replaced: 0 }
    }
}

impl FunctionPass for InductionVariable<'_> {
    fn name(&self) -> &'static str {
        "indvar"
    }

    fn run(&mut self, func: &mut FunctionModule) -> bool {
        let loops = LoopInfo::build_with_invariants(func, self.attr);
        let use_def = UseDefChain::build(func);
        for header in loops.post_order() {
            if header == func.entry_label() {
                continue;
            }
            self.process_loop(func, &loops, &use_def, header);
        }
        self.replaced != 0
    }
}

impl InductionVariable<'_> {
    fn process_loop(
        &mut self,
        func: &mut FunctionModule,
        loops: &LoopInfo,
        use_def: &UseDefChain,
        header: usize,
    ) {
        let candidates = find_candidate_phis(func, loops, use_def, header);
        if candidates.len() < 2 {
            return;
        }

        // reuse the earliest equivalent induction variable
        let mut replacement: HashMap<String, String> = HashMap::new();
        for (idx, (name, ivar)) in candidates.iter().enumerate() {
            if let Some((earlier, _)) = candidates[..idx].iter().find(|(_, other)| other == ivar) {
                replacement.insert(name.clone(), earlier.clone());
            }
        }
        if replacement.is_empty() {
            return;
        }

        let pos = func.position(header).unwrap();
        let phi_end = func.blocks[pos].phi_count();
        let mut assigns: Vec<Inst> = Vec::new();
        for inst in func.blocks[pos].insts[..phi_end].iter_mut() {
            let Some(dest) = inst.dest_name() else { continue };
            if let Some(earlier) = replacement.get(dest) {
                assigns.push(Inst::new(InstKind::Assign {
                    dest: Addr::local(dest),
                    src: Addr::local(earlier.clone()),
                }));
                *inst = Inst::new(InstKind::Deleted);
                self.replaced += 1;
            }
        }
        // the assignments go right after the remaining phi prefix
        let tail = func.blocks[pos].insts.split_off(phi_end);
        func.blocks[pos].insts.extend(assigns);
        func.blocks[pos].insts.extend(tail);
        func.remove_deleted();
    }
}

// phis `x = phi (init, outside), (v, inside)` where v is x + step and step
// is a literal or loop-invariant
fn find_candidate_phis(
    func: &FunctionModule,
    loops: &LoopInfo,
    use_def: &UseDefChain,
    header: usize,
) -> Vec<(String, IVar)> {
    let loop_nodes = &loops.loops()[&header];
    let invariant = loops.invariant_vars(header);
    let mut res = Vec::new();

    for inst in func.block(header).phis() {
        let InstKind::Phi { dest, options } = &inst.kind else {
            continue;
        };
        if options.len() != 2 {
            continue;
        }
        let (mut init, mut out_label) = (options[0].0.clone(), options[0].1);
        let (mut loop_val, mut in_label) = (options[1].0.clone(), options[1].1);
        if loop_nodes.contains(&out_label) {
            std::mem::swap(&mut init, &mut loop_val);
            std::mem::swap(&mut out_label, &mut in_label);
        }
        if loop_nodes.contains(&out_label) || !loop_nodes.contains(&in_label) {
            continue;
        }

        let Some(loop_name) = loop_val.as_local() else { continue };
        let Some(def) = use_def.def(loop_name) else { continue };
        if !loop_nodes.contains(&def.bb) {
            continue;
        }
        let InstKind::Binary {
            op: BinaryOp::Add,
            lhs,
            rhs,
            ..
        } = &def.inst.kind
        else {
            continue;
        };

        let is_invariant_step = |addr: &Addr| match addr {
            Addr::Imm(_) => true,
            Addr::Local(name) => invariant.contains(name),
            _ => false,
        };
        let (mut var, mut step) = (lhs.clone(), rhs.clone());
        if !is_invariant_step(&step) {
            std::mem::swap(&mut var, &mut step);
        }
        if !is_invariant_step(&step) {
            continue;
        }
        if &var != dest {
            continue;
        }

        res.push((
            dest.as_local().unwrap().to_string(),
            IVar {
                initial: init,
                step,
            },
        ));
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{verify_func, Module, RelOp};

    // two identical induction variables i and j in one loop
    fn twin_iv_func() -> FunctionModule {
        let mut func = FunctionModule::new("f", vec!["n".into()]);
        let entry = func.push_block();
        let header = func.push_block();
        let body = func.push_block();
        let exit = func.push_block();

        func.block_mut(entry).push(InstKind::Jump { target: header });

        let bb = func.block_mut(header);
        bb.push(InstKind::Phi {
            dest: Addr::local("i"),
            options: vec![(Addr::Imm(0), entry), (Addr::local("i2"), body)],
        });
        bb.push(InstKind::Phi {
            dest: Addr::local("j"),
            options: vec![(Addr::Imm(0), entry), (Addr::local("j2"), body)],
        });
        bb.push(InstKind::Relation {
            dest: Addr::local("c"),
            op: RelOp::Lt,
            lhs: Addr::local("i"),
            rhs: Addr::local("0"),
        });
        bb.push(InstKind::Branch {
            cond: Addr::local("c"),
            then_label: body,
            else_label: exit,
        });

        let bb = func.block_mut(body);
        bb.push(InstKind::Binary {
            dest: Addr::local("i2"),
            op: BinaryOp::Add,
            lhs: Addr::local("i"),
            rhs: Addr::Imm(1),
        });
        bb.push(InstKind::Binary {
            dest: Addr::local("j2"),
            op: BinaryOp::Add,
            lhs: Addr::local("j"),
            rhs: Addr::Imm(1),
        });
        bb.push(InstKind::Jump { target: header });

        func.block_mut(exit).push(InstKind::Ret {
            value: Some(Addr::local("j")),
        });
        func
    }

    #[test]
    fn test_duplicate_iv_collapsed() {
        let mut func = twin_iv_func();
        let module = Module::default();
        let attr = FuncAttr::build(&module);
        let mut pass = InductionVariable::new(&attr);
        assert!(pass.run(&mut func));
        verify_func(&func);

        let header = func.block(1);
        let phi_count = header.insts.iter().filter(|i| i.is_phi()).count();
        assert_eq!(phi_count, 1);
        assert!(header.insts.iter().any(|i| matches!(
            &i.kind,
            InstKind::Assign { dest, src }
                if dest == &Addr::local("j") && src == &Addr::local("i")
        )));
    }

    #[test]
    fn test_different_step_not_collapsed() {
        let mut func = twin_iv_func();
        // change j's step to 2
        let body_pos = func.position(2).unwrap();
        if let InstKind::Binary { rhs, .. } = &mut func.blocks[body_pos].insts[1].kind {
            *rhs = Addr::Imm(2);
        }
        let module = Module::default();
        let attr = FuncAttr::build(&module);
        let mut pass = InductionVariable::new(&attr);
        assert!(!pass.run(&mut func));
    }
}
