//! Command-line driver
//!
//! Reads an annotated-AST JSON file produced by the front end, compiles it,
//! and writes the result to the given output path or standard output.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use mxc::{ast::Program, CompileOptions, Compiler, Emit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmitArg {
    /// Dump the IR after the middle end
    Ir,
    /// Emit NASM-syntax assembly
    Asm,
}

#[derive(Parser)]
#[command(name = "mxc", about = "Optimizing Mx* compiler", version)]
struct Cli {
    /// Annotated-AST input file (JSON)
    input: PathBuf,

    /// Output file; standard output when omitted
    output: Option<PathBuf>,

    /// Output kind
    #[arg(long, value_enum, default_value_t = EmitArg::Asm)]
    emit: EmitArg,

    /// Optimization level (0-2)
    #[arg(short = 'O', default_value_t = 2)]
    opt_level: u8,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let source = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("reading {}", cli.input.display()))?;
    let program = Program::from_json(&source).context("decoding annotated AST")?;

    let options = CompileOptions {
        opt_level: cli.opt_level,
        emit: match cli.emit {
            EmitArg::Ir => Emit::Ir,
            EmitArg::Asm => Emit::Asm,
        },
        ..CompileOptions::default()
    };
    let output = Compiler::new(options)
        .compile_ast(&program)
        .context("compilation failed")?;

    match &cli.output {
        Some(path) => std::fs::write(path, output.text)
            .with_context(|| format!("writing {}", path.display()))?,
        None => print!("{}", output.text),
    }
    Ok(())
}
