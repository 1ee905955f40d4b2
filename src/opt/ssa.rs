//! SSA construction and destruction
//!
//! Construction promotes memory references to register references: entry
//! allocas whose address never escapes become SSA values, with phi functions
//! inserted at iterated dominance frontiers and a dominator-tree DFS renaming
//! every load and store. Destruction splits critical edges, lowers phis to
//! per-predecessor parallel copies and sequentializes each copy set.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::analysis::DominatorTree;
use crate::ir::{Addr, FunctionModule, Inst, InstId, InstKind, PHI_NAN};

/// Promote entry-block allocas to SSA values. Returns whether anything was
/// promoted; running it on a function without promotable allocas is a no-op.
pub fn construct_ssa(func: &mut FunctionModule) -> bool {
    let vars = promotable_vars(func);
    if vars.is_empty() {
        return false;
    }

    let dom = DominatorTree::build(func);
    let mut state = Renamer {
        dom,
        var_defined: HashMap::new(),
        bb_defined: HashMap::new(),
        reaching_def: HashMap::new(),
    };

    for var in &vars {
        let defs = collect_and_replace_defs(func, var, &mut state);
        insert_phi_functions(func, var, defs, &mut state);
    }

    for var in &vars {
        state.reaching_def.insert(var.clone(), PHI_NAN.to_string());
    }
    state
        .bb_defined
        .insert(PHI_NAN.to_string(), func.entry_label());

    let entry = func.entry_label();
    state.rename(func, &vars, entry);

    // the promoted slots are gone; drop their allocas
    for bb in &mut func.blocks {
        for inst in bb.insts.iter_mut() {
            if let InstKind::Alloca { dest, .. } = &inst.kind {
                if dest.as_local().is_some_and(|n| vars.contains(n)) {
                    *inst = Inst::new(InstKind::Deleted);
                }
            }
        }
    }
    func.remove_deleted();
    true
}

// Source variables are the destinations of entry-block allocas. A slot whose
// address is used anywhere but as a plain load/store address cannot be
// promoted.
fn promotable_vars(func: &FunctionModule) -> BTreeSet<String> {
    let mut vars: BTreeSet<String> = BTreeSet::new();
    if let Some(entry) = func.blocks.first() {
        for inst in &entry.insts {
            if let InstKind::Alloca { dest, .. } = &inst.kind {
                if let Some(name) = dest.as_local() {
                    vars.insert(name.to_string());
                }
            }
        }
    }

    for bb in &func.blocks {
        for inst in &bb.insts {
            match &inst.kind {
                InstKind::Alloca { .. } | InstKind::Load { .. } => {}
                InstKind::Store { value, .. } => {
                    if let Some(name) = value.as_local() {
                        vars.remove(name);
                    }
                }
                _ => {
                    for op in inst.operands() {
                        if let Some(name) = op.as_local() {
                            vars.remove(name);
                        }
                    }
                }
            }
        }
    }
    vars
}

struct Renamer {
    dom: DominatorTree,
    /// id of a defining instruction (converted store or inserted phi) -> the
    /// source variable it defines
    var_defined: HashMap<InstId, String>,
    /// SSA name -> label of the block defining it
    bb_defined: HashMap<String, usize>,
    /// source variable (and SSA name) -> most recent reaching definition
    reaching_def: HashMap<String, String>,
}

impl Renamer {
    // Walk the reaching-def chain upward until its definition block dominates
    // `label`.
    fn update_reaching_def(&mut self, var: &str, label: usize) {
        let Some(mut r) = self.reaching_def.get(var).cloned() else {
            return;
        };
        while !self.dom.dominates(self.bb_defined[&r], label) {
            r = self.reaching_def[&r].clone();
        }
        self.reaching_def.insert(var.to_string(), r);
    }

    fn rename(&mut self, func: &mut FunctionModule, vars: &BTreeSet<String>, label: usize) {
        let pos = func.position(label).unwrap();

        // phis first, then loads and converted stores
        for idx in 0..func.blocks[pos].insts.len() {
            let inst = &func.blocks[pos].insts[idx];
            let id = inst.id();

            if inst.is_phi() {
                if let Some(var) = self.var_defined.get(&id).cloned() {
                    self.update_reaching_def(&var, label);
                    let new_name = inst.dest_name().unwrap().to_string();
                    let prev = self.reaching_def[&var].clone();
                    self.reaching_def.insert(new_name.clone(), prev);
                    self.reaching_def.insert(var, new_name);
                }
                continue;
            }

            match &inst.kind {
                InstKind::Load { dest, addr } => {
                    let Some(var) = addr.as_local().map(str::to_string) else {
                        continue;
                    };
                    if !vars.contains(&var) {
                        continue;
                    }
                    let dest = dest.clone();
                    self.update_reaching_def(&var, label);
                    let src = Addr::local(self.reaching_def[&var].clone());
                    func.blocks[pos].insts[idx] = Inst::new(InstKind::Assign { dest, src });
                }
                InstKind::Assign { dest, .. } => {
                    let Some(var) = self.var_defined.get(&id).cloned() else {
                        continue;
                    };
                    let new_name = dest.as_local().unwrap().to_string();
                    self.update_reaching_def(&var, label);
                    let prev = self.reaching_def[&var].clone();
                    self.reaching_def.insert(new_name.clone(), prev);
                    self.reaching_def.insert(var, new_name);
                }
                _ => {}
            }
        }

        // push the current reaching defs along each outgoing edge
        for succ in func.block(label).successors() {
            let succ_pos = func.position(succ).unwrap();
            for inst in func.blocks[succ_pos].insts.iter_mut() {
                if !inst.is_phi() {
                    if inst.is_deleted() {
                        continue;
                    }
                    break;
                }
                let Some(var) = self.var_defined.get(&inst.id()).cloned() else {
                    continue;
                };
                self.update_reaching_def(&var, label);
                if let InstKind::Phi { options, .. } = &mut inst.kind {
                    options.push((Addr::local(self.reaching_def[&var].clone()), label));
                }
            }
        }

        for child in self.dom.children(label).collect::<Vec<_>>() {
            self.rename(func, vars, child);
        }
    }
}

// Turn every store to `var` into an assignment to a fresh SSA name and
// report the defining blocks.
fn collect_and_replace_defs(
    func: &mut FunctionModule,
    var: &str,
    state: &mut Renamer,
) -> Vec<usize> {
    let mut def_blocks = Vec::new();
    for pos in 0..func.blocks.len() {
        for idx in 0..func.blocks[pos].insts.len() {
            let InstKind::Store { addr, value } = &func.blocks[pos].insts[idx].kind else {
                continue;
            };
            if addr.as_local() != Some(var) {
                continue;
            }
            let value = value.clone();
            let label = func.blocks[pos].label;
            let dest = func.temps.fresh_hinted(var);
            let assign = Inst::new(InstKind::Assign {
                dest: dest.clone(),
                src: value,
            });
            state.var_defined.insert(assign.id(), var.to_string());
            state
                .bb_defined
                .insert(dest.as_local().unwrap().to_string(), label);
            func.blocks[pos].insts[idx] = assign;
            def_blocks.push(label);
        }
    }
    def_blocks
}

// Classical iterated dominance-frontier phi insertion.
fn insert_phi_functions(
    func: &mut FunctionModule,
    var: &str,
    def_blocks: Vec<usize>,
    state: &mut Renamer,
) {
    let original_defs: HashSet<usize> = def_blocks.iter().copied().collect();
    let mut added: HashSet<usize> = HashSet::new();
    let mut remaining: VecDeque<usize> = def_blocks.into();

    while let Some(def_block) = remaining.pop_front() {
        for &frontier in state.dom.frontier(def_block) {
            if added.contains(&frontier) {
                continue;
            }
            let dest = func.temps.fresh_hinted(var);
            let phi = Inst::new(InstKind::Phi {
                dest: dest.clone(),
                options: Vec::new(),
            });
            state.var_defined.insert(phi.id(), var.to_string());
            state
                .bb_defined
                .insert(dest.as_local().unwrap().to_string(), frontier);
            let pos = func.position(frontier).unwrap();
            func.blocks[pos].insts.insert(0, phi);

            added.insert(frontier);
            if !original_defs.contains(&frontier) {
                remaining.push_back(frontier);
            }
        }
    }
}

/// Lower out of SSA form: split critical edges, then replace phis by
/// sequentialized parallel copies at the end of each predecessor.
pub fn destruct_ssa(func: &mut FunctionModule) {
    split_critical_edges(func);

    // gather the parallel copy set of each predecessor
    let mut parallel: HashMap<usize, Vec<(Addr, Addr)>> = HashMap::new();
    for pos in 0..func.blocks.len() {
        for inst in func.blocks[pos].insts.iter_mut() {
            if !inst.is_phi() {
                if inst.is_deleted() {
                    continue;
                }
                break;
            }
            if let InstKind::Phi { dest, options } = &inst.kind {
                for (value, pred) in options {
                    if value.as_local() == Some(PHI_NAN) {
                        continue;
                    }
                    parallel
                        .entry(*pred)
                        .or_default()
                        .push((dest.clone(), value.clone()));
                }
            }
            *inst = Inst::new(InstKind::Deleted);
        }
    }

    let mut preds: Vec<usize> = parallel.keys().copied().collect();
    preds.sort_unstable();
    for pred in preds {
        let copies = sequentialize(parallel.remove(&pred).unwrap(), func);
        let bb = func.block_mut(pred);
        for (dest, src) in copies {
            bb.push_before_terminator(InstKind::Assign { dest, src });
        }
    }

    func.remove_deleted();
}

// An edge from a multi-successor block to a multi-predecessor block gets an
// empty block inserted on it, giving the copies a place of their own.
fn split_critical_edges(func: &mut FunctionModule) {
    let preds = func.predecessors();
    let mut critical: Vec<(usize, usize)> = Vec::new();
    for bb in &func.blocks {
        let succs = bb.successors();
        if succs.len() < 2 {
            continue;
        }
        let mut seen = HashSet::new();
        for succ in succs {
            if seen.insert(succ) && preds[&succ].len() > 1 {
                critical.push((bb.label, succ));
            }
        }
    }

    for (a, b) in critical {
        let c = func.push_block();
        func.block_mut(c).push(InstKind::Jump { target: b });
        func.block_mut(a).terminator_mut().replace_target(b, c);
        for inst in func.block_mut(b).insts.iter_mut() {
            if !inst.is_phi() {
                if inst.is_deleted() {
                    continue;
                }
                break;
            }
            super::replace_phi_label(inst, a, c);
        }
    }
}

// Order a parallel copy set so that no source is clobbered before it is
// read; a cycle is broken by saving one destination into a temporary.
fn sequentialize(copies: Vec<(Addr, Addr)>, func: &mut FunctionModule) -> Vec<(Addr, Addr)> {
    let mut pending: Vec<(Addr, Addr)> = copies.into_iter().filter(|(d, s)| d != s).collect();
    let mut out = Vec::new();

    while !pending.is_empty() {
        let free = pending
            .iter()
            .position(|(d, _)| !pending.iter().any(|(_, s)| s == d));
        match free {
            Some(i) => {
                let copy = pending.remove(i);
                out.push(copy);
            }
            None => {
                // every destination is still needed as a source: a cycle
                let (d, _) = pending[0].clone();
                let tmp = func.temps.fresh_hinted("swap");
                out.push((tmp.clone(), d.clone()));
                for (_, s) in pending.iter_mut() {
                    if *s == d {
                        *s = tmp.clone();
                    }
                }
            }
        }
    }
    out
}
