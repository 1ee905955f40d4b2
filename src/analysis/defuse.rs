//! Def-use and use-def chains
//!
//! Both chains are built in a single forward scan over the function and are
//! indexed by local-register name. The stored instructions are clones; their
//! [`crate::ir::InstId`] identities are preserved by cloning, so they remain
//! usable as keys into other analysis maps.

use std::collections::HashMap;

use crate::ir::{FunctionModule, Inst};

/// One use site of a register
#[derive(Debug, Clone)]
pub struct Use {
    /// Label of the block containing the use
    pub bb: usize,
    /// The using instruction
    pub inst: Inst,
}

/// Map from each defined register to all of its uses
#[derive(Debug, Default)]
pub struct DefUseChain {
    chain: HashMap<String, Vec<Use>>,
}

impl DefUseChain {
    /// Build the chain for `func`
    pub fn build(func: &FunctionModule) -> Self {
        let mut chain: HashMap<String, Vec<Use>> = HashMap::new();
        for bb in &func.blocks {
            for inst in &bb.insts {
                if let Some(name) = inst.dest_name() {
                    chain.entry(name.to_string()).or_default();
                }
            }
        }
        for bb in &func.blocks {
            for inst in &bb.insts {
                for operand in inst.operands() {
                    if let Some(name) = operand.as_local() {
                        chain.entry(name.to_string()).or_default().push(Use {
                            bb: bb.label,
                            inst: inst.clone(),
                        });
                    }
                }
            }
        }
        Self { chain }
    }

    /// Uses of the register `name`
    pub fn uses(&self, name: &str) -> &[Use] {
        self.chain.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The defining site of a register
#[derive(Debug, Clone)]
pub struct Def {
    /// Label of the block containing the definition
    pub bb: usize,
    /// The defining instruction
    pub inst: Inst,
}

/// Map from each register to its unique defining instruction (SSA form)
#[derive(Debug, Default)]
pub struct UseDefChain {
    chain: HashMap<String, Def>,
}

impl UseDefChain {
    /// Build the chain for `func`
    pub fn build(func: &FunctionModule) -> Self {
        let mut chain = HashMap::new();
        for bb in &func.blocks {
            for inst in &bb.insts {
                if let Some(name) = inst.dest_name() {
                    chain.insert(
                        name.to_string(),
                        Def {
                            bb: bb.label,
                            inst: inst.clone(),
                        },
                    );
                }
            }
        }
        Self { chain }
    }

    /// The definition of the register `name`, if one exists (parameters and
    /// `.phi_nan` have none)
    pub fn def(&self, name: &str) -> Option<&Def> {
        self.chain.get(name)
    }
}
