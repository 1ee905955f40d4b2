//! IR module, function and basic-block definitions

use std::collections::{BTreeMap, HashSet};

use super::inst::{Addr, Inst, InstKind};

/// Basic block: a numeric label plus an ordered instruction list
///
/// Once a block is completed its last instruction is a terminator. Phi
/// instructions, if present, form a prefix before any non-phi instruction.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Label, unique within the owning function
    pub label: usize,
    /// Instructions in execution order
    pub insts: Vec<Inst>,
}

impl BasicBlock {
    /// Create an empty block with the given label
    pub fn new(label: usize) -> Self {
        Self {
            label,
            insts: Vec::new(),
        }
    }

    /// Append an instruction at the end
    pub fn push(&mut self, kind: InstKind) {
        self.insts.push(Inst::new(kind));
    }

    /// Insert an instruction in front of the block
    pub fn push_front(&mut self, kind: InstKind) {
        self.insts.insert(0, Inst::new(kind));
    }

    /// Insert an instruction right before the terminator
    pub fn push_before_terminator(&mut self, kind: InstKind) {
        debug_assert!(self.is_completed());
        let at = self.insts.len() - 1;
        self.insts.insert(at, Inst::new(kind));
    }

    /// Whether the block ends in a terminator
    pub fn is_completed(&self) -> bool {
        self.insts.last().is_some_and(Inst::is_terminator)
    }

    /// The terminator instruction
    ///
    /// Panics if the block is not completed; an incomplete block escaping a
    /// pass is a compiler bug.
    pub fn terminator(&self) -> &Inst {
        let last = self.insts.last().expect("empty basic block");
        assert!(last.is_terminator(), "block <{}> not terminated", self.label);
        last
    }

    /// Mutable access to the terminator instruction
    pub fn terminator_mut(&mut self) -> &mut Inst {
        let label = self.label;
        let last = self.insts.last_mut().expect("empty basic block");
        assert!(last.is_terminator(), "block <{}> not terminated", label);
        last
    }

    /// Successor labels, derived from the terminator
    pub fn successors(&self) -> Vec<usize> {
        self.terminator().successors()
    }

    /// Number of leading phi instructions (tombstones in the prefix count)
    pub fn phi_count(&self) -> usize {
        self.insts
            .iter()
            .take_while(|i| i.is_phi() || i.is_deleted())
            .count()
    }

    /// The leading phi instructions
    pub fn phis(&self) -> impl Iterator<Item = &Inst> {
        self.insts
            .iter()
            .take_while(|i| i.is_phi() || i.is_deleted())
            .filter(|i| i.is_phi())
    }
}

/// Fresh-name allocator for a function's local registers
///
/// Mutated only through the owning function's API; there is no global
/// counter.
#[derive(Debug, Clone, Default)]
pub struct TempAllocator {
    next: usize,
}

impl TempAllocator {
    /// Allocate a fresh local register
    pub fn fresh(&mut self) -> Addr {
        let n = self.next;
        self.next += 1;
        Addr::Local(format!(".t{}", n))
    }

    /// Allocate a fresh local register carrying a naming hint
    pub fn fresh_hinted(&mut self, hint: &str) -> Addr {
        let n = self.next;
        self.next += 1;
        Addr::Local(format!(".{}_{}", hint.trim_start_matches(['.', '@']), n))
    }
}

/// A function: identifier, formal parameters, ordered basic blocks
///
/// Parameters are exposed to the body as local registers named `"0"`,
/// `"1"`, ... The first block is the entry; it has no implicit predecessors.
#[derive(Debug, Clone)]
pub struct FunctionModule {
    /// Function identifier (synthetic names contain `#`)
    pub identifier: String,
    /// Formal parameter names, in declaration order
    pub args: Vec<String>,
    /// Basic blocks; the first one is the entry
    pub blocks: Vec<BasicBlock>,
    /// External runtime functions have no body
    pub is_external: bool,
    /// Fresh-register allocator
    pub temps: TempAllocator,
    next_label: usize,
}

impl FunctionModule {
    /// Create an empty function
    pub fn new(identifier: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            identifier: identifier.into(),
            args,
            blocks: Vec::new(),
            is_external: false,
            temps: TempAllocator::default(),
            next_label: 0,
        }
    }

    /// Create an external (runtime) function with no body
    pub fn external(identifier: impl Into<String>, args: Vec<String>) -> Self {
        let mut f = Self::new(identifier, args);
        f.is_external = true;
        f
    }

    /// Append a fresh empty block, returning its label
    pub fn push_block(&mut self) -> usize {
        let label = self.next_label;
        self.next_label += 1;
        self.blocks.push(BasicBlock::new(label));
        label
    }

    /// Insert a fresh empty block right after `after`, returning its label
    pub fn insert_block_after(&mut self, after: usize) -> usize {
        let pos = self
            .position(after)
            .expect("insert_block_after: unknown label");
        let label = self.next_label;
        self.next_label += 1;
        self.blocks.insert(pos + 1, BasicBlock::new(label));
        label
    }

    /// Label of the entry block
    pub fn entry_label(&self) -> usize {
        self.blocks.first().expect("function has no blocks").label
    }

    /// Position of a label in the block list
    pub fn position(&self, label: usize) -> Option<usize> {
        self.blocks.iter().position(|bb| bb.label == label)
    }

    /// Borrow a block by label
    pub fn block(&self, label: usize) -> &BasicBlock {
        self.blocks
            .iter()
            .find(|bb| bb.label == label)
            .unwrap_or_else(|| panic!("no block <{}> in {}", label, self.identifier))
    }

    /// Mutably borrow a block by label
    pub fn block_mut(&mut self, label: usize) -> &mut BasicBlock {
        let ident = self.identifier.clone();
        self.blocks
            .iter_mut()
            .find(|bb| bb.label == label)
            .unwrap_or_else(|| panic!("no block <{}> in {}", label, ident))
    }

    /// Map from each block label to the labels of its predecessors
    pub fn predecessors(&self) -> BTreeMap<usize, Vec<usize>> {
        let mut preds: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for bb in &self.blocks {
            preds.entry(bb.label).or_default();
            for succ in bb.successors() {
                preds.entry(succ).or_default().push(bb.label);
            }
        }
        preds
    }

    /// Whether `name` denotes one of the formal parameters (`"0"`, `"1"`, ...)
    pub fn is_parameter(&self, name: &str) -> bool {
        match name.parse::<usize>() {
            Ok(n) => n < self.args.len(),
            Err(_) => false,
        }
    }

    /// Compact all `Deleted` tombstones out of every block
    pub fn remove_deleted(&mut self) {
        for bb in &mut self.blocks {
            bb.insts.retain(|inst| !inst.is_deleted());
        }
    }

    /// Drop blocks unreachable from the entry, trimming phi options that
    /// referenced them. The IR builder uses this to dispose of the dangling
    /// blocks opened after `return`, `break` and `continue`.
    pub fn prune_unreachable(&mut self) {
        let mut reachable = HashSet::new();
        let mut stack = vec![self.entry_label()];
        while let Some(cur) = stack.pop() {
            if !reachable.insert(cur) {
                continue;
            }
            stack.extend(self.block(cur).successors());
        }
        if reachable.len() == self.blocks.len() {
            return;
        }
        self.blocks.retain(|bb| reachable.contains(&bb.label));
        for bb in &mut self.blocks {
            for inst in bb.insts.iter_mut() {
                if !inst.is_phi() {
                    if inst.is_deleted() {
                        continue;
                    }
                    break;
                }
                if let InstKind::Phi { options, .. } = &mut inst.kind {
                    options.retain(|(_, label)| reachable.contains(label));
                }
            }
        }
    }
}

/// Global variable: `@`-prefixed identifier, size in bytes, optional data
#[derive(Debug, Clone)]
pub struct GlobalVar {
    /// Identifier, beginning with `@`
    pub ident: String,
    /// Size in bytes
    pub size: usize,
    /// Initial bytes; `None` reserves zeroed storage
    pub data: Option<Vec<u8>>,
}

impl GlobalVar {
    /// A zero-initialized 8-byte cell
    pub fn cell(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            size: 8,
            data: None,
        }
    }

    /// A data-carrying global
    pub fn with_data(ident: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            ident: ident.into(),
            size: data.len(),
            data: Some(data),
        }
    }
}

/// A whole program: functions plus global variables
///
/// There is at most one `main`. Every call target resolves either to a module
/// function or to a named external runtime symbol.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Functions, keyed by identifier (ordered for deterministic output)
    pub funcs: BTreeMap<String, FunctionModule>,
    /// Global variables in declaration order
    pub globals: Vec<GlobalVar>,
}

impl Module {
    /// Add a function, returning a mutable borrow of the stored copy
    pub fn add_func(&mut self, func: FunctionModule) -> &mut FunctionModule {
        let name = func.identifier.clone();
        self.funcs.entry(name).or_insert(func)
    }

    /// Insert or replace a function
    pub fn overwrite_func(&mut self, func: FunctionModule) {
        self.funcs.insert(func.identifier.clone(), func);
    }

    /// Add a global variable
    pub fn add_global(&mut self, var: GlobalVar) {
        self.globals.push(var);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_completion() {
        let mut bb = BasicBlock::new(0);
        assert!(!bb.is_completed());
        bb.push(InstKind::Ret { value: None });
        assert!(bb.is_completed());
        assert!(bb.successors().is_empty());
    }

    #[test]
    fn test_predecessors() {
        let mut func = FunctionModule::new("f", vec![]);
        let entry = func.push_block();
        let then_bb = func.push_block();
        let else_bb = func.push_block();
        func.block_mut(entry).push(InstKind::Branch {
            cond: Addr::Imm(1),
            then_label: then_bb,
            else_label: else_bb,
        });
        func.block_mut(then_bb).push(InstKind::Jump { target: else_bb });
        func.block_mut(else_bb).push(InstKind::Ret { value: None });

        let preds = func.predecessors();
        assert_eq!(preds[&else_bb], vec![entry, then_bb]);
        assert_eq!(preds[&entry], Vec::<usize>::new());
    }

    #[test]
    fn test_parameter_names() {
        let func = FunctionModule::new("f", vec!["a".into(), "b".into()]);
        assert!(func.is_parameter("0"));
        assert!(func.is_parameter("1"));
        assert!(!func.is_parameter("2"));
        assert!(!func.is_parameter(".t0"));
    }
}
