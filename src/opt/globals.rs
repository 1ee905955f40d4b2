//! Global-variable optimizations
//!
//! [`GlobalConstInline`] finds globals that are stored exactly one literal
//! value module-wide and never leak their address; their loads become the
//! literal and the stores disappear. [`PromoteGlobals`] gives each function
//! a local stack shadow per global it touches, so SSA construction can turn
//! global traffic into register traffic; calls and returns are bracketed by
//! reload/spill pairs limited to the globals the callee may actually see or
//! modify.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::ModulePass;
use crate::analysis::FuncAttr;
use crate::ir::{Addr, FunctionModule, Inst, InstKind, Module};

/// Inlining of globals holding a single literal value
#[derive(Default)]
pub struct GlobalConstInline {
    defined: HashSet<String>,
    constant: BTreeMap<String, i64>,
    poisoned: HashSet<String>,
    modified: bool,
}

impl ModulePass for GlobalConstInline {
    fn name(&self) -> &'static str {
        "global-const-inline"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        for func in module.funcs.values() {
            self.check_func(func);
        }
        for name in &self.poisoned {
            self.constant.remove(name);
        }
        if self.constant.is_empty() {
            return false;
        }
        for func in module.funcs.values_mut() {
            self.rewrite(func);
        }
        for func in module.funcs.values_mut() {
            func.remove_deleted();
        }
        self.modified
    }
}

impl GlobalConstInline {
    fn check_func(&mut self, func: &FunctionModule) {
        for bb in &func.blocks {
            for inst in &bb.insts {
                // a global escaping as a plain operand may be written through
                // an alias; only direct load/store addresses are transparent
                match &inst.kind {
                    InstKind::Load { .. } => continue,
                    InstKind::Store { addr, value } => {
                        if let Some(g) = value.as_global() {
                            self.poisoned.insert(g.to_string());
                        }
                        let Some(global) = addr.as_global() else { continue };
                        let first_time = self.defined.insert(global.to_string());
                        if !first_time && !self.constant.contains_key(global) {
                            continue;
                        }
                        let Addr::Imm(v) = value else {
                            self.constant.remove(global);
                            self.poisoned.insert(global.to_string());
                            continue;
                        };
                        if !first_time && self.constant.get(global) != Some(v) {
                            self.constant.remove(global);
                            continue;
                        }
                        self.constant.insert(global.to_string(), *v);
                    }
                    _ => {
                        for op in inst.operands() {
                            if let Some(g) = op.as_global() {
                                self.poisoned.insert(g.to_string());
                            }
                        }
                    }
                }
            }
        }
    }

    fn rewrite(&mut self, func: &mut FunctionModule) {
        for bb in &mut func.blocks {
            for inst in bb.insts.iter_mut() {
                match &inst.kind {
                    InstKind::Store { addr, .. } => {
                        let Some(global) = addr.as_global() else { continue };
                        if self.constant.contains_key(global) {
                            *inst = Inst::new(InstKind::Deleted);
                        }
                    }
                    InstKind::Load { dest, addr } => {
                        let Some(global) = addr.as_global() else { continue };
                        if let Some(&v) = self.constant.get(global) {
                            *inst = Inst::new(InstKind::Assign {
                                dest: dest.clone(),
                                src: Addr::Imm(v),
                            });
                            self.modified = true;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Promotion of globals into per-function stack shadows
#[derive(Default)]
pub struct PromoteGlobals {
    modified: bool,
}

impl ModulePass for PromoteGlobals {
    fn name(&self) -> &'static str {
        "promote-globals"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        let attr = FuncAttr::build(module);
        let names: Vec<String> = module
            .funcs
            .iter()
            .filter(|(_, f)| !f.is_external)
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            let func = module.funcs.get_mut(&name).unwrap();
            self.promote(func, &attr);
        }
        self.modified
    }
}

impl PromoteGlobals {
    fn promote(&mut self, func: &mut FunctionModule, attr: &FuncAttr) {
        let involved: Vec<String> = attr
            .involved(&func.identifier)
            .into_iter()
            .filter(|g| g != "@null")
            .collect();
        if involved.is_empty() {
            return;
        }
        let uses = attr.uses(&func.identifier).clone();
        let defs = attr.defs(&func.identifier).clone();

        let mut alias: HashMap<String, Addr> = HashMap::new();
        for global in &involved {
            alias.insert(global.clone(), func.temps.fresh_hinted(&format!("alias{}", global)));
        }

        // loads and stores now go through the shadow slot
        for bb in &mut func.blocks {
            for inst in bb.insts.iter_mut() {
                match &inst.kind {
                    InstKind::Store { addr, value } => {
                        if let Some(g) = addr.as_global() {
                            if let Some(slot) = alias.get(g) {
                                *inst = Inst::new(InstKind::Store {
                                    addr: slot.clone(),
                                    value: value.clone(),
                                });
                            }
                        }
                    }
                    InstKind::Load { dest, addr } => {
                        if let Some(g) = addr.as_global() {
                            if let Some(slot) = alias.get(g) {
                                *inst = Inst::new(InstKind::Load {
                                    dest: dest.clone(),
                                    addr: slot.clone(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        // entry: allocate each shadow and fill it from the global
        let entry = func.entry_label();
        let mut prologue: Vec<Inst> = Vec::new();
        for global in &involved {
            let slot = alias[global].clone();
            let tmp = func.temps.fresh();
            prologue.push(Inst::new(InstKind::Alloca {
                dest: slot.clone(),
                size: 8,
            }));
            prologue.push(Inst::new(InstKind::Load {
                dest: tmp.clone(),
                addr: Addr::global(global.clone()),
            }));
            prologue.push(Inst::new(InstKind::Store {
                addr: slot,
                value: tmp,
            }));
        }
        let entry_pos = func.position(entry).unwrap();
        prologue.extend(std::mem::take(&mut func.blocks[entry_pos].insts));
        func.blocks[entry_pos].insts = prologue;

        // spill around calls and returns, limited to what the callee or the
        // caller can observe
        for pos in 0..func.blocks.len() {
            let mut idx = 0;
            while idx < func.blocks[pos].insts.len() {
                let kind = func.blocks[pos].insts[idx].kind.clone();
                match kind {
                    InstKind::Ret { .. } => {
                        let mut insertion = Vec::new();
                        for global in defs.iter().filter(|g| *g != "@null") {
                            insertion.extend(self.store_back(func, &alias, global));
                        }
                        let n = insertion.len();
                        for (k, inst) in insertion.into_iter().enumerate() {
                            func.blocks[pos].insts.insert(idx + k, inst);
                        }
                        idx += n + 1;
                    }
                    InstKind::Call { func: callee, .. } => {
                        let mut before = Vec::new();
                        for global in defs
                            .intersection(attr.uses(&callee))
                            .filter(|g| *g != "@null")
                        {
                            before.extend(self.store_back(func, &alias, global));
                        }
                        let mut after = Vec::new();
                        for global in uses
                            .intersection(attr.defs(&callee))
                            .filter(|g| *g != "@null")
                        {
                            after.extend(self.reload(func, &alias, global));
                        }
                        let nb = before.len();
                        let na = after.len();
                        for (k, inst) in before.into_iter().enumerate() {
                            func.blocks[pos].insts.insert(idx + k, inst);
                        }
                        for (k, inst) in after.into_iter().enumerate() {
                            func.blocks[pos].insts.insert(idx + nb + 1 + k, inst);
                        }
                        idx += nb + na + 1;
                    }
                    _ => idx += 1,
                }
            }
        }

        self.modified = true;
    }

    // shadow -> global
    fn store_back(
        &self,
        func: &mut FunctionModule,
        alias: &HashMap<String, Addr>,
        global: &str,
    ) -> Vec<Inst> {
        let tmp = func.temps.fresh();
        vec![
            Inst::new(InstKind::Load {
                dest: tmp.clone(),
                addr: alias[global].clone(),
            }),
            Inst::new(InstKind::Store {
                addr: Addr::global(global),
                value: tmp,
            }),
        ]
    }

    // global -> shadow
    fn reload(
        &self,
        func: &mut FunctionModule,
        alias: &HashMap<String, Addr>,
        global: &str,
    ) -> Vec<Inst> {
        let tmp = func.temps.fresh();
        vec![
            Inst::new(InstKind::Load {
                dest: tmp.clone(),
                addr: Addr::global(global),
            }),
            Inst::new(InstKind::Store {
                addr: alias[global].clone(),
                value: tmp,
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_store_module() -> Module {
        let mut module = Module::default();
        let mut init = FunctionModule::new("_init_global_vars_", vec![]);
        let entry = init.push_block();
        init.block_mut(entry).push(InstKind::Store {
            addr: Addr::global("@k"),
            value: Addr::Imm(7),
        });
        init.block_mut(entry).push(InstKind::Ret { value: None });
        module.overwrite_func(init);

        let mut main = FunctionModule::new("main", vec![]);
        let entry = main.push_block();
        main.block_mut(entry).push(InstKind::Load {
            dest: Addr::local("v"),
            addr: Addr::global("@k"),
        });
        main.block_mut(entry).push(InstKind::Ret {
            value: Some(Addr::local("v")),
        });
        module.overwrite_func(main);
        module
    }

    #[test]
    fn test_single_literal_global_inlined() {
        let mut module = single_store_module();
        assert!(GlobalConstInline::default().run(&mut module));
        let main = &module.funcs["main"];
        assert!(matches!(
            main.blocks[0].insts[0].kind,
            InstKind::Assign { src: Addr::Imm(7), .. }
        ));
        // the store is gone from the initializer
        let init = &module.funcs["_init_global_vars_"];
        assert!(!init.blocks[0]
            .insts
            .iter()
            .any(|i| matches!(i.kind, InstKind::Store { .. })));
    }

    #[test]
    fn test_two_different_stores_not_inlined() {
        let mut module = single_store_module();
        {
            let init = module.funcs.get_mut("_init_global_vars_").unwrap();
            let pos = init.position(0).unwrap();
            init.blocks[pos].insts.insert(
                1,
                Inst::new(InstKind::Store {
                    addr: Addr::global("@k"),
                    value: Addr::Imm(9),
                }),
            );
        }
        assert!(!GlobalConstInline::default().run(&mut module));
    }

    #[test]
    fn test_promotion_brackets_calls() {
        let mut module = Module::default();

        // touch() writes @g
        let mut touch = FunctionModule::new("touch", vec![]);
        let entry = touch.push_block();
        touch.block_mut(entry).push(InstKind::Store {
            addr: Addr::global("@g"),
            value: Addr::Imm(1),
        });
        touch.block_mut(entry).push(InstKind::Ret { value: None });
        module.overwrite_func(touch);

        // main reads @g, calls touch, reads again
        let mut main = FunctionModule::new("main", vec![]);
        let entry = main.push_block();
        let bb = main.block_mut(entry);
        bb.push(InstKind::Load {
            dest: Addr::local("a"),
            addr: Addr::global("@g"),
        });
        bb.push(InstKind::Call {
            dest: None,
            func: "touch".to_string(),
            args: vec![],
        });
        bb.push(InstKind::Load {
            dest: Addr::local("b"),
            addr: Addr::global("@g"),
        });
        bb.push(InstKind::Ret {
            value: Some(Addr::local("b")),
        });
        module.overwrite_func(main);

        assert!(PromoteGlobals::default().run(&mut module));
        let main = &module.funcs["main"];
        crate::ir::verify_func(main);

        // the load after the call is preceded by a reload from @g
        let insts = &main.blocks[0].insts;
        let call_at = insts
            .iter()
            .position(|i| matches!(i.kind, InstKind::Call { .. }))
            .unwrap();
        let reload_after = insts[call_at + 1..].iter().any(|i| {
            matches!(&i.kind, InstKind::Load { addr, .. } if addr.as_global() == Some("@g"))
        });
        assert!(reload_after);
    }
}
