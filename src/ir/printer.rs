//! Line-oriented textual IR format
//!
//! `;` starts a comment. A global variable prints as `@name = { ... }` with
//! its initialization instructions inside the braces; a function prints as
//! `define name ( arg0 arg1 ... ) { <0>: ... }`. External functions end with
//! `external`.

use std::fmt::Write;

use super::inst::{Addr, BinaryOp, Inst, InstKind, RelOp, UnaryOp};
use super::module::{FunctionModule, GlobalVar, Module};

/// Format an address: `123`, `%name`, `@name` or `<N>`
pub fn fmt_addr(addr: &Addr) -> String {
    match addr {
        Addr::Imm(v) => v.to_string(),
        Addr::Local(name) => format!("%{}", name),
        Addr::Global(name) => name.clone(),
        Addr::Label(id) => format!("<{}>", id),
    }
}

fn binary_op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::BitOr => "bitor",
        BinaryOp::BitAnd => "bitand",
        BinaryOp::Xor => "xor",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Mod => "mod",
    }
}

fn rel_op_name(op: RelOp) -> &'static str {
    match op {
        RelOp::Eq => "eq",
        RelOp::Ne => "ne",
        RelOp::Lt => "lt",
        RelOp::Gt => "gt",
        RelOp::Le => "le",
        RelOp::Ge => "ge",
    }
}

fn escape_bytes(data: &[u8]) -> String {
    let mut out = String::new();
    for &b in data {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            _ => out.push(b as char),
        }
    }
    out
}

/// Format a single instruction (without indentation)
pub fn fmt_inst(inst: &Inst) -> String {
    match &inst.kind {
        InstKind::Deleted => String::new(),
        InstKind::Assign { dest, src } => {
            format!("{} = assign {}", fmt_addr(dest), fmt_addr(src))
        }
        InstKind::Unary { dest, op, operand } => format!(
            "{} = {} {}",
            fmt_addr(dest),
            match op {
                UnaryOp::Neg => "neg",
                UnaryOp::BitNot => "bitnot",
            },
            fmt_addr(operand)
        ),
        InstKind::Binary { dest, op, lhs, rhs } => format!(
            "{} = {} {} {}",
            fmt_addr(dest),
            binary_op_name(*op),
            fmt_addr(lhs),
            fmt_addr(rhs)
        ),
        InstKind::Relation { dest, op, lhs, rhs } => format!(
            "{} = {} {} {}",
            fmt_addr(dest),
            rel_op_name(*op),
            fmt_addr(lhs),
            fmt_addr(rhs)
        ),
        InstKind::Alloca { dest, size } => {
            format!("{} = alloca {}", fmt_addr(dest), size)
        }
        InstKind::Malloc { dest, size } => {
            format!("{} = malloc {}", fmt_addr(dest), fmt_addr(size))
        }
        InstKind::SAlloc { dest, size } => {
            format!("{} = salloc {}", fmt_addr(dest), size)
        }
        InstKind::Load { dest, addr } => {
            format!("{} = load {}", fmt_addr(dest), fmt_addr(addr))
        }
        InstKind::Store { addr, value } => {
            format!("store {} {}", fmt_addr(addr), fmt_addr(value))
        }
        InstKind::StrCpy { dest, data } => {
            format!("strcpy {} \"{}\"", fmt_addr(dest), escape_bytes(data))
        }
        InstKind::Jump { target } => format!("jump <{}>", target),
        InstKind::Branch {
            cond,
            then_label,
            else_label,
        } => format!("br {} <{}> <{}>", fmt_addr(cond), then_label, else_label),
        InstKind::Ret { value } => match value {
            Some(v) => format!("ret {}", fmt_addr(v)),
            None => "ret void".to_string(),
        },
        InstKind::Call { dest, func, args } => {
            let mut res = String::new();
            if let Some(d) = dest {
                res = format!("{} = ", fmt_addr(d));
            }
            let _ = write!(res, "call {}", func);
            for arg in args {
                let _ = write!(res, " {}", fmt_addr(arg));
            }
            res
        }
        InstKind::Phi { dest, options } => {
            let mut res = format!("{} = phi ", fmt_addr(dest));
            for (val, label) in options {
                let _ = write!(res, "[ {} <{}> ] ", fmt_addr(val), label);
            }
            res
        }
        InstKind::Comment(text) | InstKind::AttachedComment(text) => format!("; {}", text),
    }
}

fn fmt_global(var: &GlobalVar) -> String {
    let mut res = format!("{} = {{\n", var.ident);
    if let Some(data) = &var.data {
        let _ = writeln!(res, "  strcpy {} \"{}\"", var.ident, escape_bytes(data));
    }
    res.push_str("}\n");
    res
}

/// Print one function in the textual format
pub fn print_func(func: &FunctionModule, out: &mut String) {
    let _ = write!(out, "define {} (", func.identifier);
    for arg in &func.args {
        let _ = write!(out, " {}", arg);
    }
    out.push_str(" )");
    if func.is_external {
        out.push_str(" external\n");
        return;
    }
    out.push_str(" {\n");
    let mut attached = String::new();
    for bb in &func.blocks {
        let _ = writeln!(out, "<{}>:", bb.label);
        for inst in &bb.insts {
            if let InstKind::AttachedComment(text) = &inst.kind {
                attached = text.clone();
                continue;
            }
            if inst.is_deleted() {
                continue;
            }
            let mut line = fmt_inst(inst);
            if !attached.is_empty() {
                let _ = write!(line, "  ; {}", attached);
                attached.clear();
            }
            if line.starts_with(';') {
                let _ = writeln!(out, "{}", line);
            } else {
                let _ = writeln!(out, "  {}", line);
            }
        }
    }
    out.push_str("}\n");
}

/// Print a whole module, externals included
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    for var in &module.globals {
        out.push_str(&fmt_global(var));
        out.push('\n');
    }
    for func in module.funcs.values() {
        print_func(func, &mut out);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_addr_forms() {
        assert_eq!(fmt_addr(&Addr::Imm(-3)), "-3");
        assert_eq!(fmt_addr(&Addr::local("x")), "%x");
        assert_eq!(fmt_addr(&Addr::global("@g")), "@g");
        assert_eq!(fmt_addr(&Addr::Label(4)), "<4>");
    }

    #[test]
    fn test_fmt_ret_and_call() {
        let ret = Inst::new(InstKind::Ret { value: None });
        assert_eq!(fmt_inst(&ret), "ret void");

        let call = Inst::new(InstKind::Call {
            dest: Some(Addr::local("r")),
            func: "getInt".to_string(),
            args: vec![],
        });
        assert_eq!(fmt_inst(&call), "%r = call getInt");
    }

    #[test]
    fn test_fmt_phi() {
        let phi = Inst::new(InstKind::Phi {
            dest: Addr::local("p"),
            options: vec![(Addr::Imm(0), 1), (Addr::local("v"), 2)],
        });
        assert_eq!(fmt_inst(&phi), "%p = phi [ 0 <1> ] [ %v <2> ] ");
    }
}
