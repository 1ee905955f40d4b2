//! # x86-64 assembly IR and back-end
//!
//! A NASM-shaped assembly representation plus the passes that produce and
//! refine it:
//!
//! ```text
//! asm/
//! ├── mod.rs       # registers, operands, instructions, sections, printer
//! ├── isel.rs      # instruction selection: IR -> assembly with vregs
//! ├── liveness.rs  # per-block LiveOut over the line-level CFG
//! ├── regalloc.rs  # iterated register coalescing
//! └── peephole.rs  # inc/dec rewriting, dead-mov elimination
//! ```
//!
//! Instructions use unlimited virtual registers (names starting with `v`)
//! until allocation assigns physical ones. A [`Section`] is an ordered list
//! of labeled lines; an [`AsmModule`] holds the directives plus the `.data`,
//! `.bss` and `.text` sections and prints as NASM source.

mod isel;
mod liveness;
mod peephole;
mod regalloc;

pub use isel::select_module;
pub use liveness::{build_line_cfg, build_live_out, LineCfg};
pub use peephole::run_peephole;
pub use regalloc::allocate_registers;

use std::collections::HashMap;
use std::fmt;

/// Physical general-purpose registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum PhysReg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl PhysReg {
    /// NASM name of the 64-bit register
    pub fn name(self) -> &'static str {
        match self {
            PhysReg::Rax => "rax",
            PhysReg::Rcx => "rcx",
            PhysReg::Rdx => "rdx",
            PhysReg::Rbx => "rbx",
            PhysReg::Rsp => "rsp",
            PhysReg::Rbp => "rbp",
            PhysReg::Rsi => "rsi",
            PhysReg::Rdi => "rdi",
            PhysReg::R8 => "r8",
            PhysReg::R9 => "r9",
            PhysReg::R10 => "r10",
            PhysReg::R11 => "r11",
            PhysReg::R12 => "r12",
            PhysReg::R13 => "r13",
            PhysReg::R14 => "r14",
            PhysReg::R15 => "r15",
        }
    }
}

/// The six System V argument registers, in order
pub const PARAM_REGS: [PhysReg; 6] = [
    PhysReg::Rdi,
    PhysReg::Rsi,
    PhysReg::Rdx,
    PhysReg::Rcx,
    PhysReg::R8,
    PhysReg::R9,
];

/// Callee-saved registers (rbp included; rsp is the stack pointer)
pub const CALLEE_SAVE: [PhysReg; 6] = [
    PhysReg::Rbp,
    PhysReg::Rbx,
    PhysReg::R12,
    PhysReg::R13,
    PhysReg::R14,
    PhysReg::R15,
];

/// Registers a call may clobber (caller-saved, including the return register)
pub const CALLER_SAVE: [PhysReg; 9] = [
    PhysReg::Rax,
    PhysReg::Rcx,
    PhysReg::Rdx,
    PhysReg::Rsi,
    PhysReg::Rdi,
    PhysReg::R8,
    PhysReg::R9,
    PhysReg::R10,
    PhysReg::R11,
];

/// A register operand: physical or virtual
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    /// Machine register
    Phys(PhysReg),
    /// Virtual register; names start with `v`
    Virt(String),
}

impl Reg {
    /// Shorthand for a virtual register
    pub fn virt(name: impl Into<String>) -> Self {
        Reg::Virt(name.into())
    }

    /// Whether this is a virtual register
    pub fn is_virtual(&self) -> bool {
        matches!(self, Reg::Virt(_))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Phys(p) => f.write_str(p.name()),
            Reg::Virt(name) => f.write_str(name),
        }
    }
}

/// `[base + index*scale + disp]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemAddr {
    /// Base register
    pub base: Option<Reg>,
    /// Index register and its scale (1, 2, 4 or 8)
    pub index: Option<(Reg, u8)>,
    /// Displacement
    pub disp: i64,
}

impl MemAddr {
    /// `[base]`
    pub fn base(base: Reg) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp: 0,
        }
    }

    /// `[base + disp]`
    pub fn base_disp(base: Reg, disp: i64) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp,
        }
    }
}

impl fmt::Display for MemAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut wrote = false;
        if let Some(base) = &self.base {
            write!(f, "{}", base)?;
            wrote = true;
        }
        if let Some((index, scale)) = &self.index {
            if wrote {
                f.write_str("+")?;
            }
            write!(f, "{}*{}", index, scale)?;
            wrote = true;
        }
        if self.disp != 0 || !wrote {
            if self.disp >= 0 && wrote {
                f.write_str("+")?;
            }
            write!(f, "{}", self.disp)?;
        }
        f.write_str("]")
    }
}

/// Assembly operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Numeric constant
    Imm(i64),
    /// Register
    Reg(Reg),
    /// Memory reference
    Mem(MemAddr),
    /// Bare label (jump targets)
    Label(String),
    /// `[label]`: memory at a label
    LabelAddr(String),
}

impl Operand {
    /// The register, if this operand is one
    pub fn as_reg(&self) -> Option<&Reg> {
        match self {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// Whether this operand dereferences memory
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_) | Operand::LabelAddr(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(v) => write!(f, "{}", v),
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Mem(m) => write!(f, "{}", m),
            Operand::Label(l) => f.write_str(l),
            Operand::LabelAddr(l) => write!(f, "[{}]", l),
        }
    }
}

/// Condition codes for `set` and conditional jumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Cc {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Z,
    Nz,
}

impl Cc {
    /// The opposite condition
    pub fn negated(self) -> Cc {
        match self {
            Cc::Eq => Cc::Ne,
            Cc::Ne => Cc::Eq,
            Cc::Lt => Cc::Ge,
            Cc::Le => Cc::Gt,
            Cc::Gt => Cc::Le,
            Cc::Ge => Cc::Lt,
            Cc::Z => Cc::Nz,
            Cc::Nz => Cc::Z,
        }
    }

    fn jcc(self) -> &'static str {
        match self {
            Cc::Eq => "je",
            Cc::Ne => "jne",
            Cc::Lt => "jl",
            Cc::Le => "jle",
            Cc::Gt => "jg",
            Cc::Ge => "jge",
            Cc::Z => "jz",
            Cc::Nz => "jnz",
        }
    }

    fn setcc(self) -> &'static str {
        match self {
            Cc::Eq => "sete",
            Cc::Ne => "setne",
            Cc::Lt => "setl",
            Cc::Le => "setle",
            Cc::Gt => "setg",
            Cc::Ge => "setge",
            Cc::Z => "setz",
            Cc::Nz => "setnz",
        }
    }
}

/// Two-operand ALU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinOp {
    Or,
    And,
    Xor,
    Add,
    Sub,
    Mul,
    Sal,
    Sar,
}

impl BinOp {
    fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Or => "or",
            BinOp::And => "and",
            BinOp::Xor => "xor",
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "imul",
            BinOp::Sal => "sal",
            BinOp::Sar => "sar",
        }
    }
}

/// Single-operand ALU operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum UnOp {
    Neg,
    Not,
    Inc,
    Dec,
}

impl UnOp {
    fn mnemonic(self) -> &'static str {
        match self {
            UnOp::Neg => "neg",
            UnOp::Not => "not",
            UnOp::Inc => "inc",
            UnOp::Dec => "dec",
        }
    }
}

/// Assembly instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmInst {
    /// `mov dst, src`
    Mov {
        /// Destination (register or memory)
        dst: Operand,
        /// Source
        src: Operand,
    },
    /// `lea dst, addr`
    Lea {
        /// Destination register
        dst: Reg,
        /// Effective address
        addr: Operand,
    },
    /// `op dst, src`
    Binary {
        /// Operation
        op: BinOp,
        /// Destination (also left operand)
        dst: Operand,
        /// Right operand
        src: Operand,
    },
    /// `op reg`
    Unary {
        /// Operation
        op: UnOp,
        /// Operand register
        reg: Reg,
    },
    /// `push reg`
    Push(Reg),
    /// `pop reg`
    Pop(Reg),
    /// `leave`
    Leave,
    /// `ret`
    Ret,
    /// `call symbol`
    Call(String),
    /// `jmp label`
    Jmp(String),
    /// `jcc label`
    CJump {
        /// Condition
        cc: Cc,
        /// Target label
        target: String,
    },
    /// `cmp lhs, rhs`
    Cmp {
        /// Left operand
        lhs: Operand,
        /// Right operand
        rhs: Operand,
    },
    /// `setcc` on the low byte of `reg`
    Set {
        /// Condition
        cc: Cc,
        /// Destination register (rax in practice)
        reg: Reg,
    },
    /// `idiv reg` (rdx:rax / reg)
    IDiv(Reg),
    /// `cqo`
    Cqo,
    /// `db` with raw bytes (data sections)
    Db(Vec<u8>),
    /// `resb n` (bss)
    Resb(usize),
}

/// One line of a section: an optional label and an optional instruction
#[derive(Debug, Clone, Default)]
pub struct Line {
    /// Label defined on this line
    pub label: Option<String>,
    /// Instruction on this line
    pub inst: Option<AsmInst>,
}

impl Line {
    /// A label-only line
    pub fn label(label: impl Into<String>) -> Self {
        Line {
            label: Some(label.into()),
            inst: None,
        }
    }

    /// An instruction-only line
    pub fn inst(inst: AsmInst) -> Self {
        Line {
            label: None,
            inst: Some(inst),
        }
    }
}

/// An ordered list of labeled lines
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name (`.data`, `.bss`, `.text`)
    pub name: String,
    /// Lines in order
    pub lines: Vec<Line>,
}

impl Section {
    /// Create an empty section
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lines: Vec::new(),
        }
    }

    /// Append a label-only line
    pub fn add_label(&mut self, label: impl Into<String>) {
        self.lines.push(Line::label(label));
    }

    /// Append an instruction
    pub fn add(&mut self, inst: AsmInst) {
        self.lines.push(Line::inst(inst));
    }
}

/// Module directives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `default rel`
    DefaultRel,
    /// `global symbol`
    Global(String),
    /// `extern symbol`
    Extern(String),
}

/// A complete assembly module
#[derive(Debug, Clone)]
pub struct AsmModule {
    /// Directives, printed first
    pub directives: Vec<Directive>,
    /// `.data` section
    pub data: Section,
    /// `.bss` section
    pub bss: Section,
    /// `.text` section
    pub text: Section,
}

impl Default for AsmModule {
    fn default() -> Self {
        Self {
            directives: Vec::new(),
            data: Section::new(".data"),
            bss: Section::new(".bss"),
            text: Section::new(".text"),
        }
    }
}

// ---------------------------------------------------------------------------
// register bookkeeping used by liveness and allocation
// ---------------------------------------------------------------------------

fn mem_regs(mem: &MemAddr, out: &mut Vec<Reg>) {
    if let Some(base) = &mem.base {
        out.push(base.clone());
    }
    if let Some((index, _)) = &mem.index {
        out.push(index.clone());
    }
}

fn operand_regs(op: &Operand, out: &mut Vec<Reg>) {
    match op {
        Operand::Reg(r) => out.push(r.clone()),
        Operand::Mem(m) => mem_regs(m, out),
        _ => {}
    }
}

/// Registers read by an instruction
pub fn used_regs(inst: &AsmInst) -> Vec<Reg> {
    let mut out = Vec::new();
    match inst {
        AsmInst::Mov { dst, src } => {
            operand_regs(src, &mut out);
            // storing through memory reads the address registers
            if let Operand::Mem(m) = dst {
                mem_regs(m, &mut out);
            }
        }
        AsmInst::Lea { addr, .. } => operand_regs(addr, &mut out),
        AsmInst::Binary { dst, src, .. } => {
            operand_regs(dst, &mut out);
            operand_regs(src, &mut out);
        }
        AsmInst::Unary { reg, .. } => out.push(reg.clone()),
        AsmInst::Push(reg) => out.push(reg.clone()),
        AsmInst::Cmp { lhs, rhs } => {
            operand_regs(lhs, &mut out);
            operand_regs(rhs, &mut out);
        }
        AsmInst::Set { reg, .. } => out.push(reg.clone()),
        AsmInst::IDiv(reg) => {
            out.push(reg.clone());
            out.push(Reg::Phys(PhysReg::Rax));
            out.push(Reg::Phys(PhysReg::Rdx));
        }
        AsmInst::Cqo => out.push(Reg::Phys(PhysReg::Rax)),
        AsmInst::Call(_) => {
            for p in PARAM_REGS {
                out.push(Reg::Phys(p));
            }
        }
        AsmInst::Ret => {
            out.push(Reg::Phys(PhysReg::Rax));
            for p in CALLEE_SAVE {
                out.push(Reg::Phys(p));
            }
        }
        _ => {}
    }
    out
}

/// Registers written by an instruction
pub fn defined_regs(inst: &AsmInst) -> Vec<Reg> {
    let mut out = Vec::new();
    match inst {
        AsmInst::Mov { dst, .. } | AsmInst::Binary { dst, .. } => {
            if let Operand::Reg(r) = dst {
                out.push(r.clone());
            }
        }
        AsmInst::Lea { dst, .. } => out.push(dst.clone()),
        AsmInst::Unary { reg, .. } => out.push(reg.clone()),
        AsmInst::Pop(reg) => out.push(reg.clone()),
        AsmInst::Set { reg, .. } => out.push(reg.clone()),
        AsmInst::IDiv(_) => {
            out.push(Reg::Phys(PhysReg::Rax));
            out.push(Reg::Phys(PhysReg::Rdx));
        }
        AsmInst::Cqo => out.push(Reg::Phys(PhysReg::Rdx)),
        AsmInst::Call(_) => {
            for p in CALLER_SAVE {
                out.push(Reg::Phys(p));
            }
        }
        _ => {}
    }
    out
}

/// All registers an instruction mentions
pub fn involved_regs(inst: &AsmInst) -> Vec<Reg> {
    let mut out = used_regs(inst);
    out.extend(defined_regs(inst));
    out
}

fn replace_in_mem(mem: &mut MemAddr, map: &HashMap<Reg, Reg>) {
    if let Some(base) = &mut mem.base {
        if let Some(new) = map.get(base) {
            *base = new.clone();
        }
    }
    if let Some((index, _)) = &mut mem.index {
        if let Some(new) = map.get(index) {
            *index = new.clone();
        }
    }
}

fn replace_in_operand(op: &mut Operand, map: &HashMap<Reg, Reg>) {
    match op {
        Operand::Reg(r) => {
            if let Some(new) = map.get(r) {
                *r = new.clone();
            }
        }
        Operand::Mem(m) => replace_in_mem(m, map),
        _ => {}
    }
}

/// Substitute registers throughout an instruction
pub fn replace_regs(inst: &mut AsmInst, map: &HashMap<Reg, Reg>) {
    let fix_reg = |r: &mut Reg| {
        if let Some(new) = map.get(r) {
            *r = new.clone();
        }
    };
    match inst {
        AsmInst::Mov { dst, src } => {
            replace_in_operand(dst, map);
            replace_in_operand(src, map);
        }
        AsmInst::Lea { dst, addr } => {
            fix_reg(dst);
            replace_in_operand(addr, map);
        }
        AsmInst::Binary { dst, src, .. } => {
            replace_in_operand(dst, map);
            replace_in_operand(src, map);
        }
        AsmInst::Unary { reg, .. }
        | AsmInst::Push(reg)
        | AsmInst::Pop(reg)
        | AsmInst::Set { reg, .. }
        | AsmInst::IDiv(reg) => fix_reg(reg),
        AsmInst::Cmp { lhs, rhs } => {
            replace_in_operand(lhs, map);
            replace_in_operand(rhs, map);
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// printing
// ---------------------------------------------------------------------------

fn fmt_inst(inst: &AsmInst) -> String {
    match inst {
        AsmInst::Mov { dst, src } => {
            if dst.is_mem() {
                format!("mov qword {}, {}", dst, src)
            } else {
                format!("mov {}, {}", dst, src)
            }
        }
        AsmInst::Lea { dst, addr } => format!("lea {}, {}", dst, addr),
        AsmInst::Binary { op, dst, src } => {
            if matches!(op, BinOp::Sal | BinOp::Sar) {
                if let Operand::Reg(r) = src {
                    assert_eq!(*r, Reg::Phys(PhysReg::Rcx), "variable shifts go through cl");
                    return format!("{} {}, cl", op.mnemonic(), dst);
                }
            }
            format!("{} {}, {}", op.mnemonic(), dst, src)
        }
        AsmInst::Unary { op, reg } => format!("{} {}", op.mnemonic(), reg),
        AsmInst::Push(reg) => format!("push {}", reg),
        AsmInst::Pop(reg) => format!("pop {}", reg),
        AsmInst::Leave => "leave".to_string(),
        AsmInst::Ret => "ret".to_string(),
        AsmInst::Call(symbol) => format!("call {}", symbol),
        AsmInst::Jmp(label) => format!("jmp {}", label),
        AsmInst::CJump { cc, target } => format!("{} {}", cc.jcc(), target),
        AsmInst::Cmp { lhs, rhs } => format!("cmp {}, {}", lhs, rhs),
        AsmInst::Set { cc, reg } => {
            assert_eq!(*reg, Reg::Phys(PhysReg::Rax), "setcc writes al");
            format!("{} al", cc.setcc())
        }
        AsmInst::IDiv(reg) => format!("idiv {}", reg),
        AsmInst::Cqo => "cqo".to_string(),
        AsmInst::Db(bytes) => {
            let mut s = String::from("db ");
            for (i, b) in bytes.iter().enumerate() {
                if i != 0 {
                    s.push_str(", ");
                }
                s.push_str(&b.to_string());
            }
            s
        }
        AsmInst::Resb(n) => format!("resb {}", n),
    }
}

const INDENT: usize = 8;

fn fmt_line(line: &Line) -> String {
    let inst_str = line.inst.as_ref().map(fmt_inst).unwrap_or_default();
    match &line.label {
        None => format!("{}{}", " ".repeat(INDENT), inst_str),
        Some(label) if label.len() <= INDENT - 2 => {
            let mut prefix = format!("{}: ", label);
            while prefix.len() < INDENT {
                prefix.push(' ');
            }
            format!("{}{}", prefix, inst_str)
        }
        Some(label) if !inst_str.is_empty() => {
            format!("{}:\n{}{}", label, " ".repeat(INDENT), inst_str)
        }
        Some(label) => format!("{}:", label),
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SECTION {}", self.name)?;
        for line in &self.lines {
            if line.label.is_none() && line.inst.is_none() {
                continue;
            }
            writeln!(f, "{}", fmt_line(line))?;
        }
        Ok(())
    }
}

impl fmt::Display for AsmModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for directive in &self.directives {
            match directive {
                Directive::DefaultRel => writeln!(f, "default rel")?,
                Directive::Global(s) => writeln!(f, "global {}", s)?,
                Directive::Extern(s) => writeln!(f, "extern {}", s)?,
            }
        }
        writeln!(f)?;
        for section in [&self.data, &self.bss, &self.text] {
            write!(f, "{}", section)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
