//! # Typed linear intermediate representation
//!
//! The middle-end operates on a typed, 64-bit-only linear IR. A module is a
//! set of functions plus global variables; a function is an ordered list of
//! basic blocks; a block is an ordered list of instructions whose last
//! instruction, once the block is completed, is a terminator.
//!
//! ## Module structure
//!
//! ```text
//! ir/
//! ├── mod.rs      # module definition and re-exports
//! ├── inst.rs     # Addr, operators, InstKind, Inst (stable identity)
//! ├── module.rs   # BasicBlock, FunctionModule, GlobalVar, Module
//! ├── printer.rs  # line-oriented textual format
//! └── verify.rs   # well-formedness assertions (compiler-bug detection)
//! ```
//!
//! ## Key types
//!
//! - [`Addr`] - operand universe: literal, local register, global register,
//!   block label
//! - [`Inst`] - an instruction kind paired with a stable [`InstId`], usable
//!   as a key in analysis maps independently of value equality
//! - [`FunctionModule`] - ordered blocks; parameters are exposed as local
//!   registers named `"0"`, `"1"`, ...
//! - [`Module`] - function map plus global variables
//!
//! The IR exists in two forms. The builder produces memory form, where every
//! source variable lives in an entry-block `Alloca` and is accessed through
//! `Load`/`Store`. SSA construction rewrites it into SSA form, in which every
//! local register has exactly one definition and phi instructions appear as a
//! prefix of their block.

mod inst;
mod module;
mod printer;
mod verify;

pub use inst::{Addr, BinaryOp, Inst, InstId, InstKind, RelOp, UnaryOp};
pub(crate) use inst::{eval_binary, eval_relation, eval_unary};
pub use module::{BasicBlock, FunctionModule, GlobalVar, Module, TempAllocator};
pub use printer::{fmt_addr, fmt_inst, print_func, print_module};
pub use verify::{verify_func, verify_module, verify_ssa};

/// Sentinel register name standing in for "undefined on this path" in phi
/// operands produced by SSA construction.
pub const PHI_NAN: &str = ".phi_nan";
