//! Property tests: constant folding against a reference evaluator, and
//! register allocation over generated programs.

use proptest::prelude::*;

use mxc::asm::{self, AsmInst, AsmModule, BinOp, Operand, PhysReg, Reg, Section};
use mxc::ast::{BinaryOp, Expr, ExprKind, FuncDecl, Program, Stmt, Type};
use mxc::{CompileOptions, Compiler, Emit};

// ---------------------------------------------------------------------------
// constant expression trees fold to what a reference evaluator computes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ConstExpr {
    Lit(i64),
    Neg(Box<ConstExpr>),
    Bin(BinaryOp, Box<ConstExpr>, Box<ConstExpr>),
}

fn const_expr_strategy() -> impl Strategy<Value = ConstExpr> {
    let leaf = (-1000i64..1000).prop_map(ConstExpr::Lit);
    leaf.prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            inner.clone().prop_map(|e| ConstExpr::Neg(Box::new(e))),
            (
                prop_oneof![
                    Just(BinaryOp::Add),
                    Just(BinaryOp::Sub),
                    Just(BinaryOp::Mul),
                    Just(BinaryOp::BitAnd),
                    Just(BinaryOp::BitOr),
                    Just(BinaryOp::Xor),
                ],
                inner.clone(),
                inner
            )
                .prop_map(|(op, a, b)| ConstExpr::Bin(op, Box::new(a), Box::new(b))),
        ]
    })
}

fn reference_eval(e: &ConstExpr) -> i64 {
    match e {
        ConstExpr::Lit(v) => *v,
        ConstExpr::Neg(inner) => reference_eval(inner).wrapping_neg(),
        ConstExpr::Bin(op, a, b) => {
            let (a, b) = (reference_eval(a), reference_eval(b));
            match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::BitAnd => a & b,
                BinaryOp::BitOr => a | b,
                BinaryOp::Xor => a ^ b,
                _ => unreachable!(),
            }
        }
    }
}

fn to_ast(e: &ConstExpr) -> Expr {
    let kind = match e {
        ConstExpr::Lit(v) => ExprKind::IntLit(*v),
        ConstExpr::Neg(inner) => ExprKind::Unary {
            op: mxc::ast::UnaryOp::Neg,
            operand: Box::new(to_ast(inner)),
        },
        ConstExpr::Bin(op, a, b) => ExprKind::Binary {
            op: *op,
            lhs: Box::new(to_ast(a)),
            rhs: Box::new(to_ast(b)),
        },
    };
    Expr {
        ty: Type::Int,
        kind,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sccp_folds_like_the_reference(expr in const_expr_strategy()) {
        let expected = reference_eval(&expr);
        let program = Program {
            classes: vec![],
            globals: vec![],
            funcs: vec![FuncDecl {
                name: "main".to_string(),
                params: vec![],
                ret: Type::Int,
                body: vec![Stmt::Return(Some(to_ast(&expr)))],
                receiver: None,
            }],
        };
        let options = CompileOptions { emit: Emit::Ir, ..CompileOptions::default() };
        let ir = Compiler::new(options).compile_ast(&program).unwrap().text;

        let main_start = ir.find("define main").unwrap();
        let folded = ir[main_start..]
            .lines()
            .any(|line| line.trim() == format!("ret {}", expected));
        prop_assert!(
            folded,
            "expected ret {} in:\n{}",
            expected,
            &ir[main_start..]
        );
    }
}

// ---------------------------------------------------------------------------
// register allocation over generated straight-line programs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum GenInst {
    Def(u8, i64),
    Add(u8, u8),
    Mov(u8, u8),
}

fn gen_program_strategy() -> impl Strategy<Value = Vec<GenInst>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..24, -100i64..100).prop_map(|(r, v)| GenInst::Def(r, v)),
            (0u8..24, 0u8..24).prop_map(|(a, b)| GenInst::Add(a, b)),
            (0u8..24, 0u8..24).prop_map(|(a, b)| GenInst::Mov(a, b)),
        ],
        1..80,
    )
}

fn vreg(n: u8) -> Reg {
    Reg::virt(format!("v{}_p", n))
}

fn build_asm(insts: &[GenInst]) -> AsmModule {
    let mut text = Section::new(".text");
    text.add_label("f");
    // define everything up front so every use has a dominating def
    for r in 0..24u8 {
        text.add(AsmInst::Mov {
            dst: Operand::Reg(vreg(r)),
            src: Operand::Imm(0),
        });
    }
    for inst in insts {
        match inst {
            GenInst::Def(r, v) => text.add(AsmInst::Mov {
                dst: Operand::Reg(vreg(*r)),
                src: Operand::Imm(*v),
            }),
            GenInst::Add(a, b) => text.add(AsmInst::Binary {
                op: BinOp::Add,
                dst: Operand::Reg(vreg(*a)),
                src: Operand::Reg(vreg(*b)),
            }),
            GenInst::Mov(a, b) => text.add(AsmInst::Mov {
                dst: Operand::Reg(vreg(*a)),
                src: Operand::Reg(vreg(*b)),
            }),
        }
    }
    // keep a handful of values live to the end
    for r in 0..8u8 {
        text.add(AsmInst::Binary {
            op: BinOp::Add,
            dst: Operand::Reg(Reg::Phys(PhysReg::Rax)),
            src: Operand::Reg(vreg(r)),
        });
    }
    text.add(AsmInst::Ret);

    let mut module = AsmModule::default();
    module.text = text;
    module
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn allocation_leaves_no_virtual_registers(insts in gen_program_strategy()) {
        let mut module = build_asm(&insts);
        asm::allocate_registers(&mut module);
        for line in &module.text.lines {
            if let Some(inst) = &line.inst {
                for reg in asm::involved_regs(inst) {
                    prop_assert!(!reg.is_virtual(), "virtual {} survived", reg);
                }
            }
        }
    }

    #[test]
    fn allocation_is_deterministic(insts in gen_program_strategy()) {
        let mut a = build_asm(&insts);
        let mut b = build_asm(&insts);
        asm::allocate_registers(&mut a);
        asm::allocate_registers(&mut b);
        prop_assert_eq!(a.to_string(), b.to_string());
    }
}
