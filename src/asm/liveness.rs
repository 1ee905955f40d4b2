//! Liveness over the assembly lines of one function
//!
//! Blocks are maximal runs of lines delimited by labels and by control
//! transfers. `LiveOut(b) = U_{s in succ(b)} (UEVar(s) u (LiveOut(s) \
//! VarKill(s)))`, iterated to a fixed point.

use std::collections::{HashMap, HashSet};

use super::{defined_regs, used_regs, AsmInst, Line, Reg};

/// Control-flow graph over a function's line range
#[derive(Debug, Default)]
pub struct LineCfg {
    /// Half-open line ranges, one per block, in layout order
    pub blocks: Vec<(usize, usize)>,
    /// Successor block indexes
    pub succs: Vec<Vec<usize>>,
}

/// Partition `lines` into blocks and connect them
pub fn build_line_cfg(lines: &[Line]) -> LineCfg {
    let mut starts: Vec<usize> = vec![];
    let mut label_block: HashMap<&str, usize> = HashMap::new();

    let mut at_boundary = true;
    for (idx, line) in lines.iter().enumerate() {
        if line.label.is_some() || at_boundary {
            if starts.last() != Some(&idx) {
                starts.push(idx);
            }
            at_boundary = false;
        }
        if matches!(
            line.inst,
            Some(AsmInst::Jmp(_)) | Some(AsmInst::CJump { .. }) | Some(AsmInst::Ret)
        ) {
            at_boundary = true;
        }
    }

    let mut blocks = Vec::new();
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(lines.len());
        blocks.push((start, end));
    }
    for (bi, &(start, end)) in blocks.iter().enumerate() {
        for line in &lines[start..end] {
            if let Some(label) = &line.label {
                label_block.insert(label.as_str(), bi);
            }
        }
    }

    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
    for (bi, &(start, end)) in blocks.iter().enumerate() {
        let last_inst = lines[start..end].iter().rev().find_map(|l| l.inst.as_ref());
        match last_inst {
            Some(AsmInst::Jmp(target)) => {
                if let Some(&t) = label_block.get(target.as_str()) {
                    succs[bi].push(t);
                }
            }
            Some(AsmInst::Ret) => {}
            Some(AsmInst::CJump { target, .. }) => {
                if let Some(&t) = label_block.get(target.as_str()) {
                    succs[bi].push(t);
                }
                if bi + 1 < blocks.len() {
                    succs[bi].push(bi + 1);
                }
            }
            _ => {
                if bi + 1 < blocks.len() {
                    succs[bi].push(bi + 1);
                }
            }
        }
    }

    LineCfg { blocks, succs }
}

/// Per-block LiveOut sets for a function's lines
pub fn build_live_out(lines: &[Line], cfg: &LineCfg) -> Vec<HashSet<Reg>> {
    let n = cfg.blocks.len();
    let mut ue_var: Vec<HashSet<Reg>> = vec![HashSet::new(); n];
    let mut var_kill: Vec<HashSet<Reg>> = vec![HashSet::new(); n];

    for (bi, &(start, end)) in cfg.blocks.iter().enumerate() {
        for line in &lines[start..end] {
            let Some(inst) = &line.inst else { continue };
            for reg in used_regs(inst) {
                if !var_kill[bi].contains(&reg) {
                    ue_var[bi].insert(reg);
                }
            }
            for reg in defined_regs(inst) {
                var_kill[bi].insert(reg);
            }
        }
    }

    let mut live_out: Vec<HashSet<Reg>> = vec![HashSet::new(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..n).rev() {
            let mut new_set: HashSet<Reg> = HashSet::new();
            for &s in &cfg.succs[bi] {
                new_set.extend(ue_var[s].iter().cloned());
                for reg in &live_out[s] {
                    if !var_kill[s].contains(reg) {
                        new_set.insert(reg.clone());
                    }
                }
            }
            if new_set.len() != live_out[bi].len() || !new_set.is_subset(&live_out[bi]) {
                live_out[bi] = new_set;
                changed = true;
            }
        }
    }
    live_out
}
