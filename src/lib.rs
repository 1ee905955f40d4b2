//! # mxc - an optimizing Mx* compiler
//!
//! Lowers a Java-like source language (classes, arrays, strings, `int`/
//! `bool`, functions, control flow) to x86-64 assembly. The front end is an
//! external collaborator: it hands this crate a resolved, type-annotated AST
//! (see [`ast`]), and everything from IR construction to register allocation
//! happens here.
//!
//! ## Architecture
//!
//! ```text
//! AST -> IR (memory form) -> IR (SSA) -> optimized IR (SSA)
//!     -> IR (SSA destructed) -> x86-64 IR (virtual registers)
//!     -> x86-64 IR (physical registers) -> NASM text
//! ```
//!
//! The middle end runs a fixed-point pipeline of classical scalar
//! optimizations (SCCP, GVN, CFG simplification, DCE, copy propagation,
//! reassociation, LICM, induction-variable simplification, inlining) over a
//! typed linear SSA IR. The back end selects NASM-shaped instructions with
//! unlimited virtual registers and colors them by iterated register
//! coalescing.
//!
//! ## Usage
//!
//! ```ignore
//! use mxc::{Compiler, CompileOptions};
//!
//! let program = mxc::ast::Program::from_json(&ast_json)?;
//! let output = Compiler::new(CompileOptions::default()).compile_ast(&program)?;
//! std::fs::write("out.s", output.text)?;
//! ```
//!
//! The compiler is single-threaded and pass-sequential; every pass takes the
//! module by mutable reference, rewrites it in place and leaves it
//! well-formed.

pub mod analysis;
pub mod asm;
pub mod ast;
mod error;
pub mod ir;
pub mod irgen;
pub mod opt;

pub use error::{Error, Result};

use tracing::debug;

/// What the compiler should print
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Emit {
    /// The IR after the middle end
    Ir,
    /// NASM-syntax assembly
    #[default]
    Asm,
}

/// Compilation options
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Optimization level: 0 = none, 1 = scalar passes, 2 = loop passes and
    /// inlining as well
    pub opt_level: u8,
    /// Output kind
    pub emit: Emit,
    /// Bound on fixed-point rounds of the pass pipeline
    pub max_pass_iterations: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 2,
            emit: Emit::Asm,
            max_pass_iterations: 8,
        }
    }
}

/// Compilation result
#[derive(Debug)]
pub struct CompileOutput {
    /// The requested textual output (IR or assembly)
    pub text: String,
    /// Number of IR instructions after the middle end
    pub ir_instruction_count: usize,
    /// Number of assembly lines emitted (zero when emitting IR)
    pub asm_line_count: usize,
}

/// The compiler driver
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Create a compiler with the given options
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Compile an annotated program to the requested output
    pub fn compile_ast(&self, program: &ast::Program) -> Result<CompileOutput> {
        // Phase 1: lower to memory-form IR
        let mut module = irgen::IrBuilder::new().build(program)?;
        ir::verify_module(&module);

        // Phase 2: middle end (SSA, scalar optimizations, SSA destruction)
        opt::optimize(&mut module, &self.options);
        ir::verify_module(&module);

        let ir_instruction_count = module
            .funcs
            .values()
            .flat_map(|f| f.blocks.iter())
            .map(|bb| bb.insts.len())
            .sum();
        debug!(ir_instruction_count, "middle end finished");

        if self.options.emit == Emit::Ir {
            return Ok(CompileOutput {
                text: ir::print_module(&module),
                ir_instruction_count,
                asm_line_count: 0,
            });
        }

        // Phase 3: back end
        for func in module.funcs.values_mut() {
            if !func.is_external {
                opt::prepare_for_codegen(func);
            }
        }
        let mut asm = asm::select_module(&module);
        asm::allocate_registers(&mut asm);
        asm::run_peephole(&mut asm);

        let asm_line_count = asm.text.lines.len();
        debug!(asm_line_count, "back end finished");

        Ok(CompileOutput {
            text: asm.to_string(),
            ir_instruction_count,
            asm_line_count,
        })
    }
}
