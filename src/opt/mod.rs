//! # Optimization passes
//!
//! Pass infrastructure plus the scalar optimizations of the middle-end.
//! Every pass implements [`FunctionPass`] or [`ModulePass`] and reports
//! whether it modified anything; the pipeline iterates the pass set to a
//! fixed point bounded by `max_pass_iterations`.
//!
//! Pipeline shape:
//!
//! 1. global-constant inlining and promotion of globals (module passes, once)
//! 2. SSA construction per function
//! 3. fixed point over {SCCP, GVN, CFG simplification, DCE, copy
//!    propagation, reassociation, LICM, induction variables, inlining};
//!    inlining reintroduces allocas, so SSA construction reruns each round
//! 4. SSA destruction (critical-edge splitting + sequentialized parallel
//!    copies), then codegen preparation (block reordering)
//!
//! A pass must leave the IR well-formed on return: every block terminated,
//! phi operand sets matching predecessor sets, no tombstones remaining.

mod copy_prop;
mod dce;
mod globals;
mod gvn;
mod indvar;
mod inline;
mod licm;
mod prepare;
mod reassoc;
mod sccp;
mod simplify_cfg;
mod ssa;

pub use copy_prop::CopyPropagation;
pub use dce::DeadCodeElimination;
pub use globals::{GlobalConstInline, PromoteGlobals};
pub use gvn::GlobalValueNumbering;
pub use indvar::InductionVariable;
pub use inline::FunctionInline;
pub use licm::LoopInvariantCodeMotion;
pub use prepare::prepare_for_codegen;
pub use reassoc::Reassociation;
pub use sccp::Sccp;
pub use simplify_cfg::SimplifyCfg;
pub use ssa::{construct_ssa, destruct_ssa};

use tracing::debug;

use crate::analysis::FuncAttr;
use crate::ir::{verify_func, Addr, BasicBlock, Inst, InstKind, Module};
use crate::CompileOptions;

/// A pass over a single function
pub trait FunctionPass {
    /// Pass name, for logs
    fn name(&self) -> &'static str;
    /// Run the pass; return whether anything was modified
    fn run(&mut self, func: &mut crate::ir::FunctionModule) -> bool;
}

/// A pass over the whole module
pub trait ModulePass {
    /// Pass name, for logs
    fn name(&self) -> &'static str;
    /// Run the pass; return whether anything was modified
    fn run(&mut self, module: &mut Module) -> bool;
}

/// Remove one predecessor's option from a phi; a single remaining option
/// degenerates into an assignment.
pub(crate) fn delete_phi_option(inst: &mut Inst, pred: usize) {
    let InstKind::Phi { dest, options } = &inst.kind else {
        panic!("delete_phi_option on a non-phi");
    };
    let remaining: Vec<(Addr, usize)> = options
        .iter()
        .filter(|(_, label)| *label != pred)
        .cloned()
        .collect();
    let kind = if remaining.len() == 1 {
        InstKind::Assign {
            dest: dest.clone(),
            src: remaining.into_iter().next().unwrap().0,
        }
    } else {
        InstKind::Phi {
            dest: dest.clone(),
            options: remaining,
        }
    };
    *inst = Inst::new(kind);
}

/// Relabel one predecessor in a phi's option list
pub(crate) fn replace_phi_label(inst: &mut Inst, old: usize, new: usize) {
    if let InstKind::Phi { options, .. } = &mut inst.kind {
        for (_, label) in options.iter_mut() {
            if *label == old {
                *label = new;
            }
        }
    }
}

/// Replace phis whose options all carry the same value (or a single option)
/// by plain assignments. The assignments land after the phi prefix so the
/// prefix invariant survives when only some phis degenerate.
pub(crate) fn simplify_phis(bb: &mut BasicBlock) -> bool {
    let phi_end = bb.phi_count();
    let mut assigns: Vec<Inst> = Vec::new();
    for inst in bb.insts[..phi_end].iter_mut() {
        let InstKind::Phi { dest, options } = &inst.kind else {
            continue;
        };
        if options.is_empty() {
            continue;
        }
        let first = &options[0].0;
        if options.len() == 1 || options.iter().all(|(v, _)| v == first) {
            assigns.push(Inst::new(InstKind::Assign {
                dest: dest.clone(),
                src: first.clone(),
            }));
            *inst = Inst::new(InstKind::Deleted);
        }
    }
    if assigns.is_empty() {
        return false;
    }
    let tail = bb.insts.split_off(phi_end);
    bb.insts.extend(assigns);
    bb.insts.extend(tail);
    true
}

/// Run the full middle-end pipeline over `module`.
///
/// At `opt_level` 0 only SSA destruction runs, which lowers the phis the IR
/// builder emits for short-circuit operators.
pub fn optimize(module: &mut Module, opts: &CompileOptions) {
    if opts.opt_level >= 1 {
        run_optimizations(module, opts);
    }
    for func in module.funcs.values_mut() {
        if !func.is_external {
            destruct_ssa(func);
            verify_func(func);
        }
    }
}

fn run_optimizations(module: &mut Module, opts: &CompileOptions) {
    if opts.opt_level >= 2 {
        run_module_pass(&mut GlobalConstInline::default(), module);
        run_module_pass(&mut PromoteGlobals::default(), module);
    }

    for func in module.funcs.values_mut() {
        if !func.is_external {
            construct_ssa(func);
            verify_func(func);
        }
    }

    for round in 0..opts.max_pass_iterations {
        let mut changed = false;

        let attr = FuncAttr::build(module);
        for func in module.funcs.values_mut() {
            if func.is_external {
                continue;
            }
            changed |= run_func_pass(&mut Sccp::default(), func);
            if opts.opt_level >= 2 {
                changed |= run_func_pass(&mut GlobalValueNumbering::default(), func);
            }
            changed |= run_func_pass(&mut SimplifyCfg::default(), func);
            changed |= run_func_pass(&mut DeadCodeElimination::default(), func);
            changed |= run_func_pass(&mut CopyPropagation::default(), func);
            if opts.opt_level >= 2 {
                changed |= run_func_pass(&mut Reassociation::default(), func);
                changed |= run_func_pass(&mut LoopInvariantCodeMotion::new(&attr), func);
                changed |= run_func_pass(&mut InductionVariable::new(&attr), func);
            }
            verify_func(func);
        }

        if opts.opt_level >= 2 {
            changed |= run_module_pass(&mut FunctionInline::default(), module);
            // inlining relocates callee allocas into callers; promote them
            for func in module.funcs.values_mut() {
                if !func.is_external {
                    construct_ssa(func);
                    verify_func(func);
                }
            }
        }

        debug!(round, changed, "optimization round finished");
        if !changed {
            break;
        }
    }

    // a pass-limit exit right after inlining may leave fresh allocas behind
    for func in module.funcs.values_mut() {
        if !func.is_external {
            construct_ssa(func);
            verify_func(func);
        }
    }
}

fn run_func_pass<P: FunctionPass>(pass: &mut P, func: &mut crate::ir::FunctionModule) -> bool {
    let modified = pass.run(func);
    if modified {
        debug!(pass = pass.name(), func = %func.identifier, "modified");
    }
    modified
}

fn run_module_pass<P: ModulePass>(pass: &mut P, module: &mut Module) -> bool {
    let modified = pass.run(module);
    if modified {
        debug!(pass = pass.name(), "modified");
    }
    modified
}
