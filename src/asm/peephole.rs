//! Final peephole pass over the text section
//!
//! `add x, 1` / `sub x, 1` become `inc x` / `dec x`, and a `mov` into a
//! register makes any immediately preceding writes to that register dead, so
//! they are dropped (within the same block, walking backward until an
//! instruction that is not a plain register write).

use super::{AsmInst, AsmModule, BinOp, Line, Operand, Reg, UnOp};

/// Run both peephole rewrites on the module's text section.
pub fn run_peephole(module: &mut AsmModule) {
    use_inc_dec(&mut module.text.lines);
    remove_overwritten_values(&mut module.text.lines);
}

fn use_inc_dec(lines: &mut [Line]) {
    for line in lines.iter_mut() {
        let Some(AsmInst::Binary {
            op,
            dst: Operand::Reg(reg),
            src: Operand::Imm(1),
        }) = &line.inst
        else {
            continue;
        };
        let un_op = match op {
            BinOp::Add => UnOp::Inc,
            BinOp::Sub => UnOp::Dec,
            _ => continue,
        };
        line.inst = Some(AsmInst::Unary {
            op: un_op,
            reg: reg.clone(),
        });
    }
}

// the register an instruction plainly overwrites, when removing it would be
// observable through nothing else
fn plain_write_target(inst: &AsmInst) -> Option<&Reg> {
    match inst {
        AsmInst::Mov {
            dst: Operand::Reg(d),
            ..
        } => Some(d),
        AsmInst::Unary { reg, .. } => Some(reg),
        AsmInst::Binary {
            dst: Operand::Reg(d),
            ..
        } => Some(d),
        _ => None,
    }
}

fn remove_overwritten_values(lines: &mut Vec<Line>) {
    let mut dead: Vec<usize> = Vec::new();
    for idx in 0..lines.len() {
        let Some(AsmInst::Mov {
            dst: Operand::Reg(dest),
            ..
        }) = &lines[idx].inst
        else {
            continue;
        };
        let inst = lines[idx].inst.as_ref().unwrap();
        if super::used_regs(inst).contains(dest) {
            continue;
        }
        let dest = dest.clone();

        // walk backward over earlier writes to the same register
        for back in (0..idx).rev() {
            if lines[back].label.is_some() {
                break;
            }
            let Some(prev) = &lines[back].inst else { break };
            match plain_write_target(prev) {
                Some(target) if *target == dest => dead.push(back),
                _ => break,
            }
        }
    }
    dead.sort_unstable();
    dead.dedup();
    for idx in dead.into_iter().rev() {
        lines.remove(idx);
    }
}
