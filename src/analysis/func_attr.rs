//! Call-graph-derived function attributes
//!
//! For every function: the set of global variables it may read and the set it
//! may write, transitively closed over its callees, and whether it is pure.
//! A function is pure when it loads and stores only through its own
//! entry-block stack slots and calls nothing but pure functions (or itself).

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::ir::{FunctionModule, InstKind, Module};

/// Function attributes over a module
#[derive(Debug, Default)]
pub struct FuncAttr {
    global_uses: HashMap<String, BTreeSet<String>>,
    global_defs: HashMap<String, BTreeSet<String>>,
    pure_funcs: HashSet<String>,
}

impl FuncAttr {
    /// Compute attributes for every function in `module`
    pub fn build(module: &Module) -> Self {
        let mut attr = Self::default();
        attr.build_global_var_info(module);
        attr.build_purity(module);
        attr
    }

    /// Globals the function may read (transitively)
    pub fn uses(&self, func: &str) -> &BTreeSet<String> {
        &self.global_uses[func]
    }

    /// Globals the function may write (transitively)
    pub fn defs(&self, func: &str) -> &BTreeSet<String> {
        &self.global_defs[func]
    }

    /// Globals the function may read or write
    pub fn involved(&self, func: &str) -> BTreeSet<String> {
        let mut res = self.global_uses[func].clone();
        res.extend(self.global_defs[func].iter().cloned());
        res
    }

    /// Whether the function is pure
    pub fn is_pure(&self, func: &str) -> bool {
        self.pure_funcs.contains(func)
    }

    fn build_global_var_info(&mut self, module: &Module) {
        // reverse call graph: callee -> callers
        let mut callers: HashMap<String, Vec<String>> = HashMap::new();
        for name in module.funcs.keys() {
            callers.insert(name.clone(), Vec::new());
        }
        for (name, func) in &module.funcs {
            for bb in &func.blocks {
                for inst in &bb.insts {
                    if let InstKind::Call { func: callee, .. } = &inst.kind {
                        callers.entry(callee.clone()).or_default().push(name.clone());
                    }
                }
            }
        }

        // direct accesses
        for (name, func) in &module.funcs {
            let uses = self.global_uses.entry(name.clone()).or_default();
            let defs = self.global_defs.entry(name.clone()).or_default();
            for bb in &func.blocks {
                for inst in &bb.insts {
                    match &inst.kind {
                        InstKind::Store { addr, .. } => {
                            if let Some(g) = addr.as_global() {
                                defs.insert(g.to_string());
                            }
                        }
                        InstKind::Load { addr, .. } => {
                            if let Some(g) = addr.as_global() {
                                uses.insert(g.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        // close over the reverse call graph
        let mut worklist: Vec<String> = module.funcs.keys().cloned().collect();
        while let Some(callee) = worklist.pop() {
            let callee_uses = self.global_uses[&callee].clone();
            let callee_defs = self.global_defs[&callee].clone();
            for caller in callers.get(&callee).cloned().unwrap_or_default() {
                let uses = self.global_uses.get_mut(&caller).unwrap();
                let before = uses.len();
                uses.extend(callee_uses.iter().cloned());
                let mut grown = uses.len() != before;

                let defs = self.global_defs.get_mut(&caller).unwrap();
                let before = defs.len();
                defs.extend(callee_defs.iter().cloned());
                grown |= defs.len() != before;

                if grown {
                    worklist.push(caller);
                }
            }
        }
    }

    fn build_purity(&mut self, module: &Module) {
        loop {
            let before = self.pure_funcs.len();
            for (name, func) in &module.funcs {
                if func.is_external {
                    continue;
                }
                if self.is_pure_func(func) {
                    self.pure_funcs.insert(name.clone());
                }
            }
            if self.pure_funcs.len() == before {
                break;
            }
        }
    }

    fn is_pure_func(&self, func: &FunctionModule) -> bool {
        let mut stack_vars: HashSet<&str> = HashSet::new();
        if let Some(entry) = func.blocks.first() {
            for inst in &entry.insts {
                if let InstKind::Alloca { dest, .. } = &inst.kind {
                    if let Some(name) = dest.as_local() {
                        stack_vars.insert(name);
                    }
                }
            }
        }

        for bb in &func.blocks {
            for inst in &bb.insts {
                match &inst.kind {
                    InstKind::Store { addr, .. } | InstKind::Load { addr, .. } => {
                        let is_own_slot = addr
                            .as_local()
                            .is_some_and(|name| stack_vars.contains(name));
                        if !is_own_slot {
                            return false;
                        }
                    }
                    InstKind::Call { func: callee, .. } => {
                        if callee != &func.identifier && !self.pure_funcs.contains(callee) {
                            return false;
                        }
                    }
                    InstKind::Malloc { .. } | InstKind::SAlloc { .. } | InstKind::StrCpy { .. } => {
                        return false;
                    }
                    _ => {}
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Addr, FunctionModule, InstKind, Module};

    fn module_with_global_access() -> Module {
        let mut module = Module::default();

        // leaf writes @g
        let mut leaf = FunctionModule::new("leaf", vec![]);
        let entry = leaf.push_block();
        leaf.block_mut(entry).push(InstKind::Store {
            addr: Addr::global("@g"),
            value: Addr::Imm(1),
        });
        leaf.block_mut(entry).push(InstKind::Ret { value: None });
        module.overwrite_func(leaf);

        // caller only calls leaf
        let mut caller = FunctionModule::new("caller", vec![]);
        let entry = caller.push_block();
        caller.block_mut(entry).push(InstKind::Call {
            dest: None,
            func: "leaf".to_string(),
            args: vec![],
        });
        caller.block_mut(entry).push(InstKind::Ret { value: None });
        module.overwrite_func(caller);

        // pure arithmetic
        let mut pure = FunctionModule::new("pure", vec!["x".into()]);
        let entry = pure.push_block();
        pure.block_mut(entry).push(InstKind::Ret {
            value: Some(Addr::local("0")),
        });
        module.overwrite_func(pure);

        module
    }

    #[test]
    fn test_transitive_global_defs() {
        let module = module_with_global_access();
        let attr = FuncAttr::build(&module);
        assert!(attr.defs("leaf").contains("@g"));
        assert!(attr.defs("caller").contains("@g"));
        assert!(attr.uses("caller").is_empty());
    }

    #[test]
    fn test_purity() {
        let module = module_with_global_access();
        let attr = FuncAttr::build(&module);
        assert!(attr.is_pure("pure"));
        assert!(!attr.is_pure("leaf"));
        assert!(!attr.is_pure("caller"));
    }
}
