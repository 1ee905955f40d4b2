//! Middle-end scenarios: AST in, optimized IR out.

use mxc::ast::{BinaryOp, Expr, ExprKind, FuncDecl, Program, Stmt, Type};
use mxc::{CompileOptions, Compiler, Emit};

fn int(kind: ExprKind) -> Expr {
    Expr { ty: Type::Int, kind }
}

fn lit(v: i64) -> Expr {
    int(ExprKind::IntLit(v))
}

fn ident(name: &str) -> Expr {
    int(ExprKind::Ident(name.to_string()))
}

fn bin(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    int(ExprKind::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn bool_bin(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr {
        ty: Type::Bool,
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

fn call(func: &str, ty: Type, args: Vec<Expr>) -> Expr {
    Expr {
        ty,
        kind: ExprKind::Call {
            func: func.to_string(),
            receiver: None,
            args,
        },
    }
}

fn func(name: &str, params: Vec<(String, Type)>, ret: Type, body: Vec<Stmt>) -> FuncDecl {
    FuncDecl {
        name: name.to_string(),
        params,
        ret,
        body,
        receiver: None,
    }
}

fn program(funcs: Vec<FuncDecl>) -> Program {
    Program {
        classes: vec![],
        globals: vec![],
        funcs,
    }
}

fn compile_ir(program: &Program) -> String {
    let options = CompileOptions {
        emit: Emit::Ir,
        ..CompileOptions::default()
    };
    Compiler::new(options)
        .compile_ast(program)
        .expect("compilation succeeds")
        .text
}

fn main_body(ir: &str) -> &str {
    let start = ir.find("define main").expect("main is defined");
    let end = ir[start..].find("\n}").map(|e| start + e).unwrap_or(ir.len());
    &ir[start..end]
}

#[test]
fn constant_expression_folds_to_single_ret() {
    // int main() { return 1 + 2 * 3; }
    let prog = program(vec![func(
        "main",
        vec![],
        Type::Int,
        vec![Stmt::Return(Some(bin(
            BinaryOp::Add,
            lit(1),
            bin(BinaryOp::Mul, lit(2), lit(3)),
        )))],
    )]);
    let ir = compile_ir(&prog);
    let body = main_body(&ir);
    assert!(body.contains("ret 7"), "main should fold to ret 7:\n{}", body);
    assert!(
        !body.contains(" = mul") && !body.contains(" = add"),
        "no arithmetic should survive:\n{}",
        body
    );
}

#[test]
fn copy_chain_collapses_to_single_value() {
    // int a = getInt(); int b = a; int c = b; println(toString(c));
    let decl = |name: &str, init: Expr| Stmt::VarDecl {
        name: name.to_string(),
        ty: Type::Int,
        init: Some(init),
    };
    let prog = program(vec![func(
        "main",
        vec![],
        Type::Int,
        vec![
            decl("a", call("getInt", Type::Int, vec![])),
            decl("b", ident("a")),
            decl("c", ident("b")),
            Stmt::Expr(call(
                "println",
                Type::Void,
                vec![call("toString", Type::Str, vec![ident("c")])],
            )),
            Stmt::Return(Some(lit(0))),
        ],
    )]);
    let ir = compile_ir(&prog);
    let body = main_body(&ir);
    // the copy chain disappears entirely: no assigns remain between the
    // getInt result and the toString argument
    assert!(
        !body.contains("= assign"),
        "copies should be propagated away:\n{}",
        body
    );
}

#[test]
fn counting_loop_keeps_its_phi_web() {
    // int s = 0; for (int i = 0; i < 10; ++i) s = s + i; return s;
    let prog = program(vec![func(
        "main",
        vec![],
        Type::Int,
        vec![
            Stmt::VarDecl {
                name: "s".to_string(),
                ty: Type::Int,
                init: Some(lit(0)),
            },
            Stmt::For {
                init: Some(Box::new(Stmt::VarDecl {
                    name: "i".to_string(),
                    ty: Type::Int,
                    init: Some(lit(0)),
                })),
                cond: Some(bool_bin(BinaryOp::Lt, ident("i"), lit(10))),
                update: Some(bin(BinaryOp::Assign, ident("i"), bin(BinaryOp::Add, ident("i"), lit(1)))),
                body: Box::new(Stmt::Expr(bin(
                    BinaryOp::Assign,
                    ident("s"),
                    bin(BinaryOp::Add, ident("s"), ident("i")),
                ))),
            },
            Stmt::Return(Some(ident("s"))),
        ],
    )]);
    let ir = compile_ir(&prog);
    let body = main_body(&ir);
    // the loop itself survives: a backward branch and the comparison remain
    assert!(body.contains("lt"), "loop comparison survives:\n{}", body);
    // variables were promoted: no loads or stores of stack slots remain
    assert!(
        !body.contains("= load %") && !body.contains("store %"),
        "locals should be in registers:\n{}",
        body
    );
}

#[test]
fn straight_line_callee_disappears_into_caller() {
    // int twice(int x) { return x + x; } int main() { return twice(21); }
    let prog = program(vec![
        func(
            "twice",
            vec![("x".to_string(), Type::Int)],
            Type::Int,
            vec![Stmt::Return(Some(bin(BinaryOp::Add, ident("x"), ident("x"))))],
        ),
        func(
            "main",
            vec![],
            Type::Int,
            vec![Stmt::Return(Some(call("twice", Type::Int, vec![lit(21)])))],
        ),
    ]);
    let ir = compile_ir(&prog);
    let body = main_body(&ir);
    assert!(
        !body.contains("call twice"),
        "the call should be inlined:\n{}",
        body
    );
    // and then fold: 21 + 21
    assert!(body.contains("ret 42"), "inlined body folds:\n{}", body);
}

#[test]
fn recursive_factorial_keeps_recursion_bounded() {
    // int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); }
    let fact_body = vec![
        Stmt::If {
            cond: bool_bin(BinaryOp::Le, ident("n"), lit(1)),
            then_stmt: Box::new(Stmt::Return(Some(lit(1)))),
            else_stmt: None,
        },
        Stmt::Return(Some(bin(
            BinaryOp::Mul,
            ident("n"),
            call("fact", Type::Int, vec![bin(BinaryOp::Sub, ident("n"), lit(1))]),
        ))),
    ];
    let prog = program(vec![
        func("fact", vec![("n".to_string(), Type::Int)], Type::Int, fact_body),
        func(
            "main",
            vec![],
            Type::Int,
            vec![Stmt::Return(Some(call("fact", Type::Int, vec![lit(10)])))],
        ),
    ]);
    let ir = compile_ir(&prog);
    // recursion cannot be fully inlined; the definition must survive with
    // its recursive call intact
    assert!(ir.contains("define fact"));
    assert!(ir.contains("call fact"));
}

#[test]
fn emitted_ir_round_trips_through_the_printer_grammar() {
    let prog = program(vec![func(
        "main",
        vec![],
        Type::Int,
        vec![
            Stmt::VarDecl {
                name: "a".to_string(),
                ty: Type::Int,
                init: Some(call("getInt", Type::Int, vec![])),
            },
            Stmt::Return(Some(bin(BinaryOp::Add, ident("a"), lit(1)))),
        ],
    )]);
    let ir = compile_ir(&prog);

    // line-oriented grammar: every non-comment body line is an instruction
    // with a known mnemonic, labels look like <N>:
    let known = [
        "assign", "neg", "bitnot", "alloca", "malloc", "salloc", "store", "load", "br", "jump",
        "ret", "call", "phi", "bitor", "bitand", "xor", "shl", "shr", "add", "sub", "mul", "div",
        "mod", "ne", "eq", "lt", "le", "gt", "ge", "strcpy",
    ];
    for line in ir.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with(';')
            || line.starts_with("define")
            || line.starts_with('}')
            || line.starts_with('{')
            || line.starts_with('@')
            || line.ends_with(":")
        {
            continue;
        }
        let has_known = known.iter().any(|m| {
            line.starts_with(m)
                || line.contains(&format!("= {} ", m))
                || line.contains(&format!("= {}", m))
        });
        assert!(has_known, "unknown instruction line: {}", line);
    }
}

#[test]
fn optimization_is_idempotent_at_fixed_point() {
    // compiling twice produces identical IR text
    let prog = program(vec![func(
        "main",
        vec![],
        Type::Int,
        vec![
            Stmt::VarDecl {
                name: "a".to_string(),
                ty: Type::Int,
                init: Some(call("getInt", Type::Int, vec![])),
            },
            Stmt::Return(Some(bin(
                BinaryOp::Add,
                bin(BinaryOp::Mul, ident("a"), lit(2)),
                lit(5),
            ))),
        ],
    )]);
    let first = compile_ir(&prog);
    let second = compile_ir(&prog);
    assert_eq!(first, second);
}
