//! # Function and module analyses
//!
//! Read-only analyses consumed by the optimization passes:
//!
//! - [`DominatorTree`] - dominators, immediate dominators, tree children and
//!   dominance frontiers of a function's CFG
//! - [`DefUseChain`] / [`UseDefChain`] - register def-use indexes, built in
//!   one forward scan
//! - [`LoopInfo`] - natural loops, the loop tree, loop depths and
//!   loop-invariant variable sets
//! - [`FuncAttr`] - call graph derived attributes: transitive global-variable
//!   read/write sets and purity
//!
//! Analyses hold data keyed by block labels, register names and instruction
//! ids, so they stay valid while a pass inspects the function and are simply
//! rebuilt after it mutates it.

mod defuse;
mod dominance;
mod func_attr;
mod loops;

pub use defuse::{Def, DefUseChain, Use, UseDefChain};
pub use dominance::DominatorTree;
pub use func_attr::FuncAttr;
pub use loops::LoopInfo;
