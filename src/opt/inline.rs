//! Function inlining
//!
//! Every callsite whose callee has a body is expanded: the callee's blocks
//! are cloned with alpha-renamed locals and remapped labels, parameter
//! registers (`"0"`, `"1"`, ...) are substituted by the actual arguments,
//! returns are routed through an 8-byte return slot to a continuation block,
//! and cloned allocas move to the caller's entry. Callee bodies are taken
//! from a snapshot of the module as it stood when the pass started, which is
//! what keeps recursive expansion to one layer per pass run.

use std::collections::{BTreeMap, HashMap};

use super::ModulePass;
use crate::ir::{Addr, FunctionModule, Inst, InstKind, Module, PHI_NAN};

/// Function inlining pass
#[derive(Default)]
pub struct FunctionInline {
    inlined: usize,
}

impl ModulePass for FunctionInline {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        let snapshot = module.funcs.clone();
        for func in module.funcs.values_mut() {
            if func.is_external {
                continue;
            }
            self.inline_all_calls(func, &snapshot);
        }
        self.inlined != 0
    }
}

impl FunctionInline {
    fn inline_all_calls(
        &mut self,
        caller: &mut FunctionModule,
        snapshot: &BTreeMap<String, FunctionModule>,
    ) {
        let mut pos = 0;
        while pos < caller.blocks.len() {
            let call_site = caller.blocks[pos].insts.iter().position(|inst| {
                matches!(&inst.kind, InstKind::Call { func, .. }
                    if snapshot.get(func).is_some_and(|f| !f.is_external))
            });
            let Some(idx) = call_site else {
                pos += 1;
                continue;
            };
            let label = caller.blocks[pos].label;
            let cont = self.inline_call(caller, label, idx, snapshot);
            pos = caller.position(cont).unwrap();
        }
    }

    // Returns the label of the continuation block.
    fn inline_call(
        &mut self,
        caller: &mut FunctionModule,
        label: usize,
        call_idx: usize,
        snapshot: &BTreeMap<String, FunctionModule>,
    ) -> usize {
        let pos = caller.position(label).unwrap();
        let call = caller.blocks[pos].insts[call_idx].clone();
        let InstKind::Call { dest, func, args } = call.kind else {
            unreachable!("inline_call on a non-call");
        };
        let callee = &snapshot[&func];
        self.inlined += 1;

        // the tail of the callsite block moves to a continuation block; the
        // split must happen before anything shifts the entry block's indexes
        let cont = caller.insert_block_after(label);
        let pos = caller.position(label).unwrap();
        let mut tail: Vec<Inst> = caller.blocks[pos].insts.split_off(call_idx);
        tail.remove(0);

        // a stack slot carries the return value across the seam
        let ret_slot = dest.as_ref().map(|_| {
            let slot = caller.temps.fresh_hinted("retval");
            let entry = caller.entry_label();
            caller.block_mut(entry).push_front(InstKind::Alloca {
                dest: slot.clone(),
                size: 8,
            });
            slot
        });
        if let (Some(d), Some(slot)) = (&dest, &ret_slot) {
            tail.insert(
                0,
                Inst::new(InstKind::Load {
                    dest: d.clone(),
                    addr: slot.clone(),
                }),
            );
        }
        let cont_pos = caller.position(cont).unwrap();
        caller.blocks[cont_pos].insts = tail;

        // successors' phis now see the continuation block as predecessor
        for succ in caller.block(cont).successors() {
            let succ_pos = caller.position(succ).unwrap();
            for inst in caller.blocks[succ_pos].insts.iter_mut() {
                if !inst.is_phi() {
                    if inst.is_deleted() {
                        continue;
                    }
                    break;
                }
                super::replace_phi_label(inst, label, cont);
            }
        }

        // clone the callee's blocks between callsite and continuation
        let mut label_map: HashMap<usize, usize> = HashMap::new();
        let mut cloned_labels: Vec<usize> = Vec::new();
        let mut after = label;
        for callee_bb in &callee.blocks {
            let new_label = caller.insert_block_after(after);
            label_map.insert(callee_bb.label, new_label);
            let new_pos = caller.position(new_label).unwrap();
            caller.blocks[new_pos].insts = callee_bb.insts.clone();
            cloned_labels.push(new_label);
            after = new_label;
        }

        caller.block_mut(label).push(InstKind::Jump {
            target: label_map[&callee.entry_label()],
        });

        // alpha-rename the cloned locals
        let mut rename: HashMap<String, String> = HashMap::new();
        for &l in &cloned_labels {
            let bb_pos = caller.position(l).unwrap();
            for inst in &caller.blocks[bb_pos].insts {
                if let Some(d) = inst.dest_name() {
                    if !rename.contains_key(d) {
                        let fresh = caller.temps.fresh_hinted(d);
                        rename.insert(d.to_string(), fresh.as_local().unwrap().to_string());
                    }
                }
            }
        }

        let map_operand = |rename: &HashMap<String, String>, operand: &mut Addr| {
            let Some(name) = operand.as_local().map(str::to_string) else {
                return;
            };
            if name == PHI_NAN {
                return;
            }
            if callee.is_parameter(&name) {
                let n: usize = name.parse().unwrap();
                *operand = args[n].clone();
                return;
            }
            *operand = Addr::local(rename[&name].clone());
        };

        let mut entry_allocas: Vec<Inst> = Vec::new();
        for &l in &cloned_labels {
            let bb_pos = caller.position(l).unwrap();
            for inst in caller.blocks[bb_pos].insts.iter_mut() {
                if let Some(d) = inst.dest_name() {
                    let new_name = rename[d].clone();
                    inst.set_dest(Addr::local(new_name));
                }
                for operand in inst.operands_mut() {
                    map_operand(&rename, operand);
                }
                match &mut inst.kind {
                    InstKind::Jump { target } => *target = label_map[target],
                    InstKind::Branch {
                        then_label,
                        else_label,
                        ..
                    } => {
                        *then_label = label_map[then_label];
                        *else_label = label_map[else_label];
                    }
                    InstKind::Phi { options, .. } => {
                        for (_, pred) in options.iter_mut() {
                            *pred = label_map[pred];
                        }
                    }
                    _ => {}
                }
                if matches!(inst.kind, InstKind::Alloca { .. }) {
                    entry_allocas.push(inst.clone());
                    *inst = Inst::new(InstKind::Deleted);
                }
            }
        }
        let entry = caller.entry_label();
        for alloca in entry_allocas {
            caller.block_mut(entry).insts.insert(0, alloca);
        }

        // returns become stores into the slot plus jumps to the continuation
        for &l in &cloned_labels {
            let bb_pos = caller.position(l).unwrap();
            let Some(last) = caller.blocks[bb_pos].insts.last() else {
                continue;
            };
            let InstKind::Ret { value } = &last.kind else {
                continue;
            };
            let value = value.clone();
            caller.blocks[bb_pos].insts.pop();
            if let Some(slot) = &ret_slot {
                caller.blocks[bb_pos].insts.push(Inst::new(InstKind::Store {
                    addr: slot.clone(),
                    value: value.unwrap_or(Addr::Imm(0)),
                }));
            }
            caller.blocks[bb_pos]
                .insts
                .push(Inst::new(InstKind::Jump { target: cont }));
        }

        caller.remove_deleted();
        cont
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{verify_func, BinaryOp};

    fn square_callee() -> FunctionModule {
        let mut callee = FunctionModule::new("square", vec!["x".into()]);
        let entry = callee.push_block();
        let bb = callee.block_mut(entry);
        bb.push(InstKind::Binary {
            dest: Addr::local("r"),
            op: BinaryOp::Mul,
            lhs: Addr::local("0"),
            rhs: Addr::local("0"),
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("r")),
        });
        callee
    }

    #[test]
    fn test_inline_straight_line_callee() {
        let mut module = Module::default();
        module.overwrite_func(square_callee());

        let mut caller = FunctionModule::new("main", vec![]);
        let entry = caller.push_block();
        let bb = caller.block_mut(entry);
        bb.push(InstKind::Call {
            dest: Some(Addr::local("v")),
            func: "square".to_string(),
            args: vec![Addr::Imm(3)],
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("v")),
        });
        module.overwrite_func(caller);

        assert!(FunctionInline::default().run(&mut module));
        let main = &module.funcs["main"];
        verify_func(main);
        // no call remains in main
        for bb in &main.blocks {
            for inst in &bb.insts {
                assert!(!matches!(inst.kind, InstKind::Call { .. }));
            }
        }
        // the argument was substituted into the multiply
        let has_mul_by_3 = main.blocks.iter().flat_map(|bb| &bb.insts).any(|i| {
            matches!(&i.kind, InstKind::Binary { op: BinaryOp::Mul, lhs, rhs, .. }
                if lhs == &Addr::Imm(3) && rhs == &Addr::Imm(3))
        });
        assert!(has_mul_by_3);
    }

    #[test]
    fn test_recursion_expands_one_layer_per_run() {
        let mut module = Module::default();
        let mut fact = FunctionModule::new("fact", vec!["n".into()]);
        let entry = fact.push_block();
        let bb = fact.block_mut(entry);
        bb.push(InstKind::Call {
            dest: Some(Addr::local("r")),
            func: "fact".to_string(),
            args: vec![Addr::local("0")],
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("r")),
        });
        module.overwrite_func(fact);

        assert!(FunctionInline::default().run(&mut module));
        let fact = &module.funcs["fact"];
        verify_func(fact);
        let calls = fact
            .blocks
            .iter()
            .flat_map(|bb| &bb.insts)
            .filter(|i| matches!(i.kind, InstKind::Call { .. }))
            .count();
        assert_eq!(calls, 1, "exactly one recursive call layer expanded");
    }

    #[test]
    fn test_external_callee_untouched() {
        let mut module = Module::default();
        module.overwrite_func(FunctionModule::external("getInt", vec![]));
        let mut caller = FunctionModule::new("main", vec![]);
        let entry = caller.push_block();
        caller.block_mut(entry).push(InstKind::Call {
            dest: Some(Addr::local("v")),
            func: "getInt".to_string(),
            args: vec![],
        });
        caller.block_mut(entry).push(InstKind::Ret {
            value: Some(Addr::local("v")),
        });
        module.overwrite_func(caller);

        assert!(!FunctionInline::default().run(&mut module));
    }
}
