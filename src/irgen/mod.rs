//! # IR generation
//!
//! Lowers the annotated AST to memory-form IR. Every source variable becomes
//! an entry-block `alloca` accessed through loads and stores; SSA
//! construction later promotes them. The builder also owns the class layout
//! table, string-literal interning, and the registry of runtime builtins.
//!
//! Lowering policy highlights:
//!
//! - class instances are `malloc`ed and handed to the class constructor
//!   (`#C#_ctor_`, synthesized to zero the fields when the class declares
//!   none); member access is pointer arithmetic over 8-byte slots in
//!   declaration order
//! - an array value points 8 bytes into a 16-byte header `{length, data}`,
//!   so `a.size()` is `load (a - 8)` and element `i` lives at
//!   `load(a) + i*8`; `new T[n][m]` allocates the header plus the slot
//!   array, then fills inner dimensions with a generated loop
//! - a string value points at its bytes with the length at offset -8;
//!   string operators dispatch to the `#string#...` runtime
//! - `&&`/`||` build a diamond CFG with a trailing phi fed by the
//!   short-circuit literal and the right-hand value
//! - string literals intern to a pair of globals (content plus pointer
//!   cell), initialized inside the synthetic `_init_global_vars_` that
//!   `main` calls after its entry allocas
//! - `null` lowers to the integer literal zero

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::ast::{self, Expr, ExprKind, Program, Stmt, Type};
use crate::ir::{Addr, BinaryOp, FunctionModule, GlobalVar, Inst, InstKind, Module, RelOp, UnaryOp};
use crate::{Error, Result};

const INIT_GLOBALS: &str = "_init_global_vars_";

lazy_static! {
    /// Runtime symbols the builder may reference: name and parameter names.
    static ref RUNTIME_BUILTINS: Vec<(&'static str, Vec<&'static str>)> = vec![
        // extern C
        ("memcpy", vec!["dest", "src", "count"]),
        ("atol", vec!["str"]),
        ("__alloc", vec!["size"]),
        // io
        ("print", vec!["str"]),
        ("println", vec!["str"]),
        ("getString", vec![]),
        ("getInt", vec![]),
        ("toString", vec!["i"]),
        // string
        ("#string#_ctor_", vec!["this"]),
        ("#string#substring", vec!["this", "left", "right"]),
        ("#string#parseInt", vec!["this"]),
        ("#string#ord", vec!["this", "pos"]),
        ("#string#add", vec!["lhs", "rhs"]),
        ("#string#equal", vec!["lhs", "rhs"]),
        ("#string#inequal", vec!["lhs", "rhs"]),
        ("#string#less", vec!["lhs", "rhs"]),
        ("#string#less_equal", vec!["lhs", "rhs"]),
        // array
        ("#_array_#_ctor_", vec!["this", "arraySize", "elementSize"]),
    ];
}

#[derive(Debug, Clone, Default)]
struct ClassLayout {
    size: usize,
    offsets: HashMap<String, usize>,
}

/// Per-function lowering state
struct FuncCtx {
    func: FunctionModule,
    cur: usize,
    vars: HashMap<String, Addr>,
    loop_continue: Vec<usize>,
    loop_break: Vec<usize>,
}

impl FuncCtx {
    fn new(func: FunctionModule) -> Self {
        let mut ctx = Self {
            func,
            cur: 0,
            vars: HashMap::new(),
            loop_continue: Vec::new(),
            loop_break: Vec::new(),
        };
        ctx.cur = ctx.func.push_block();
        ctx
    }

    fn emit(&mut self, kind: InstKind) {
        self.func.block_mut(self.cur).push(kind);
    }

    fn fresh(&mut self) -> Addr {
        self.func.temps.fresh()
    }

    fn fresh_hinted(&mut self, hint: &str) -> Addr {
        self.func.temps.fresh_hinted(hint)
    }

    fn new_block(&mut self) -> usize {
        self.func.push_block()
    }

    fn switch_to(&mut self, label: usize) {
        self.cur = label;
    }

    fn is_completed(&self) -> bool {
        self.func.block(self.cur).is_completed()
    }

    // entry-block allocas make a variable promotable later
    fn alloc_var(&mut self, name: &str) -> Addr {
        let slot = self.fresh_hinted(name);
        let entry = self.func.entry_label();
        self.func.block_mut(entry).push_front(InstKind::Alloca {
            dest: slot.clone(),
            size: 8,
        });
        self.vars.insert(name.to_string(), slot.clone());
        slot
    }
}

/// AST-to-IR lowering
pub struct IrBuilder {
    module: Module,
    layouts: HashMap<String, ClassLayout>,
    global_types: HashMap<String, Type>,
    declared_funcs: std::collections::HashSet<String>,
    str_lits: HashMap<String, String>,
    str_lit_cnt: usize,
    str_init: Vec<InstKind>,
}

impl IrBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            module: Module::default(),
            layouts: HashMap::new(),
            global_types: HashMap::new(),
            declared_funcs: std::collections::HashSet::new(),
            str_lits: HashMap::new(),
            str_lit_cnt: 0,
            str_init: Vec::new(),
        }
    }

    /// Lower a whole program
    pub fn build(mut self, program: &Program) -> Result<Module> {
        self.declare_builtins();
        self.compute_layouts(program);
        for class in &program.classes {
            self.ensure_constructor(class)?;
        }
        self.define_intrinsic_bodies();

        // every callable name is known before any body is lowered, so call
        // resolution does not depend on declaration order
        self.declared_funcs
            .extend(self.module.funcs.keys().cloned());
        for class in &program.classes {
            for method in &class.methods {
                self.declared_funcs
                    .insert(self.mangled_name(method, Some(&class.name)));
            }
        }
        for decl in &program.funcs {
            self.declared_funcs.insert(decl.name.clone());
        }

        for decl in &program.globals {
            self.global_types.insert(decl.name.clone(), decl.ty.clone());
            self.module
                .add_global(GlobalVar::cell(format!("@{}", decl.name)));
        }

        // global initializers run in the synthetic init function
        let mut init_ctx = FuncCtx::new(FunctionModule::new(INIT_GLOBALS, vec![]));
        for decl in &program.globals {
            if let Some(init) = &decl.init {
                let value = self.build_expr(&mut init_ctx, init)?;
                init_ctx.emit(InstKind::Store {
                    addr: Addr::global(format!("@{}", decl.name)),
                    value,
                });
            }
        }

        for class in &program.classes {
            for method in &class.methods {
                let func = self.build_function(method, Some(&class.name))?;
                self.module.overwrite_func(func);
            }
        }
        for decl in &program.funcs {
            let func = self.build_function(decl, None)?;
            self.module.overwrite_func(func);
        }

        self.finish_init_function(init_ctx);
        self.insert_init_call_into_main()?;
        Ok(self.module)
    }

    fn declare_builtins(&mut self) {
        for (name, params) in RUNTIME_BUILTINS.iter() {
            let args = params.iter().map(|p| p.to_string()).collect();
            self.module
                .overwrite_func(FunctionModule::external(*name, args));
        }
    }

    // `size()` and `length()` have IR bodies (load of the length slot) so
    // the inliner can dissolve them
    fn define_intrinsic_bodies(&mut self) {
        for name in ["#_array_#size", "#string#length"] {
            let mut func = FunctionModule::new(name, vec!["ptr".to_string()]);
            let entry = func.push_block();
            let len_ptr = func.temps.fresh();
            let result = func.temps.fresh();
            let bb = func.block_mut(entry);
            bb.push(InstKind::Binary {
                dest: len_ptr.clone(),
                op: BinaryOp::Sub,
                lhs: Addr::local("0"),
                rhs: Addr::Imm(8),
            });
            bb.push(InstKind::Load {
                dest: result.clone(),
                addr: len_ptr,
            });
            bb.push(InstKind::Ret {
                value: Some(result),
            });
            self.module.overwrite_func(func);
        }
    }

    fn compute_layouts(&mut self, program: &Program) {
        for class in &program.classes {
            let mut layout = ClassLayout::default();
            for (i, (field, _)) in class.fields.iter().enumerate() {
                layout.offsets.insert(field.clone(), i * 8);
            }
            layout.size = (class.fields.len() * 8).max(8);
            self.layouts.insert(class.name.clone(), layout);
        }
    }

    // classes without an explicit constructor get one that zeroes the fields
    fn ensure_constructor(&mut self, class: &ast::ClassDecl) -> Result<()> {
        let ctor_name = format!("#{}#_ctor_", class.name);
        let has_ctor = class
            .methods
            .iter()
            .any(|m| self.mangled_name(m, Some(&class.name)) == ctor_name);
        if has_ctor {
            return Ok(());
        }

        let mut func = FunctionModule::new(ctor_name, vec!["this".to_string()]);
        let entry = func.push_block();
        let offsets: Vec<usize> = (0..class.fields.len()).map(|i| i * 8).collect();
        for offset in offsets {
            let ptr = func.temps.fresh_hinted("ptr");
            let bb = func.block_mut(entry);
            bb.push(InstKind::Binary {
                dest: ptr.clone(),
                op: BinaryOp::Add,
                lhs: Addr::local("0"),
                rhs: Addr::Imm(offset as i64),
            });
            bb.push(InstKind::Store {
                addr: ptr,
                value: Addr::Imm(0),
            });
        }
        func.block_mut(entry).push(InstKind::Ret { value: None });
        self.module.overwrite_func(func);
        Ok(())
    }

    fn mangled_name(&self, decl: &ast::FuncDecl, receiver: Option<&str>) -> String {
        match receiver {
            Some(class) if !decl.name.starts_with('#') => {
                format!("#{}#{}", class, decl.name)
            }
            _ => decl.name.clone(),
        }
    }

    fn build_function(
        &mut self,
        decl: &ast::FuncDecl,
        receiver: Option<&str>,
    ) -> Result<FunctionModule> {
        let name = self.mangled_name(decl, receiver);
        let mut args: Vec<String> = Vec::new();
        if receiver.is_some() {
            args.push("this".to_string());
        }
        args.extend(decl.params.iter().map(|(n, _)| n.clone()));

        let mut ctx = FuncCtx::new(FunctionModule::new(name, args.clone()));

        // parameters live in stack slots like any other variable
        for (i, arg) in args.iter().enumerate() {
            let slot = ctx.alloc_var(arg);
            ctx.emit(InstKind::Store {
                addr: slot,
                value: Addr::local(i.to_string()),
            });
        }

        for stmt in &decl.body {
            self.build_stmt(&mut ctx, stmt)?;
        }

        if !ctx.is_completed() {
            let value = match decl.ret {
                Type::Void => None,
                _ => Some(Addr::Imm(0)),
            };
            ctx.emit(InstKind::Ret { value });
        }
        // blocks opened after a return or break may still dangle
        for bb in &mut ctx.func.blocks {
            if !bb.is_completed() {
                bb.push(InstKind::Ret {
                    value: match decl.ret {
                        Type::Void => None,
                        _ => Some(Addr::Imm(0)),
                    },
                });
            }
        }
        ctx.func.prune_unreachable();
        Ok(ctx.func)
    }

    fn finish_init_function(&mut self, mut ctx: FuncCtx) {
        if !ctx.is_completed() {
            ctx.emit(InstKind::Ret { value: None });
        }
        for bb in &mut ctx.func.blocks {
            if !bb.is_completed() {
                bb.push(InstKind::Ret { value: None });
            }
        }
        ctx.func.prune_unreachable();
        // string-literal cells fill in before anything else runs
        let entry = ctx.func.entry_label();
        for kind in self.str_init.drain(..).rev() {
            ctx.func.block_mut(entry).push_front(kind);
        }
        self.module.overwrite_func(ctx.func);
    }

    fn insert_init_call_into_main(&mut self) -> Result<()> {
        let main = self
            .module
            .funcs
            .get_mut("main")
            .ok_or_else(|| Error::semantic("program has no main function"))?;
        let entry = main.entry_label();
        let bb = main.block_mut(entry);
        let at = bb
            .insts
            .iter()
            .position(|inst| !matches!(inst.kind, InstKind::Alloca { .. }))
            .unwrap_or(bb.insts.len());
        bb.insts.insert(
            at,
            Inst::new(InstKind::Call {
                dest: None,
                func: INIT_GLOBALS.to_string(),
                args: vec![],
            }),
        );
        Ok(())
    }

    // ----- statements ------------------------------------------------------

    fn build_stmt(&mut self, ctx: &mut FuncCtx, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::VarDecl { name, init, .. } => {
                let slot = ctx.alloc_var(name);
                let value = match init {
                    Some(expr) => self.build_expr(ctx, expr)?,
                    None => Addr::Imm(0),
                };
                ctx.emit(InstKind::Store { addr: slot, value });
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.build_expr(ctx, expr)?;
                Ok(())
            }
            Stmt::If {
                cond,
                then_stmt,
                else_stmt,
            } => self.build_if(ctx, cond, then_stmt, else_stmt.as_deref()),
            Stmt::While { cond, body } => self.build_loop(ctx, Some(cond), None, body),
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                if let Some(init) = init {
                    self.build_stmt(ctx, init)?;
                }
                self.build_loop(ctx, cond.as_ref(), update.as_ref(), body)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => Some(self.build_expr(ctx, expr)?),
                    None => None,
                };
                ctx.emit(InstKind::Ret { value });
                let dangling = ctx.new_block();
                ctx.switch_to(dangling);
                Ok(())
            }
            Stmt::Break => {
                let target = *ctx
                    .loop_break
                    .last()
                    .ok_or_else(|| Error::semantic("break outside a loop"))?;
                ctx.emit(InstKind::Jump { target });
                let dangling = ctx.new_block();
                ctx.switch_to(dangling);
                Ok(())
            }
            Stmt::Continue => {
                let target = *ctx
                    .loop_continue
                    .last()
                    .ok_or_else(|| Error::semantic("continue outside a loop"))?;
                ctx.emit(InstKind::Jump { target });
                let dangling = ctx.new_block();
                ctx.switch_to(dangling);
                Ok(())
            }
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    self.build_stmt(ctx, stmt)?;
                }
                Ok(())
            }
            Stmt::Empty => Ok(()),
        }
    }

    fn build_if(
        &mut self,
        ctx: &mut FuncCtx,
        cond: &Expr,
        then_stmt: &Stmt,
        else_stmt: Option<&Stmt>,
    ) -> Result<()> {
        let cond_val = self.build_expr(ctx, cond)?;
        let then_label = ctx.new_block();
        let else_label = else_stmt.map(|_| ctx.new_block());
        let join = ctx.new_block();

        ctx.emit(InstKind::Branch {
            cond: cond_val,
            then_label,
            else_label: else_label.unwrap_or(join),
        });

        ctx.switch_to(then_label);
        self.build_stmt(ctx, then_stmt)?;
        if !ctx.is_completed() {
            ctx.emit(InstKind::Jump { target: join });
        }

        if let (Some(else_label), Some(else_stmt)) = (else_label, else_stmt) {
            ctx.switch_to(else_label);
            self.build_stmt(ctx, else_stmt)?;
            if !ctx.is_completed() {
                ctx.emit(InstKind::Jump { target: join });
            }
        }

        ctx.switch_to(join);
        Ok(())
    }

    fn build_loop(
        &mut self,
        ctx: &mut FuncCtx,
        cond: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
    ) -> Result<()> {
        let cond_label = ctx.new_block();
        let body_label = ctx.new_block();
        let update_label = ctx.new_block();
        let succ_label = ctx.new_block();

        ctx.emit(InstKind::Jump { target: cond_label });

        ctx.switch_to(cond_label);
        match cond {
            Some(cond) => {
                let cond_val = self.build_expr(ctx, cond)?;
                ctx.emit(InstKind::Branch {
                    cond: cond_val,
                    then_label: body_label,
                    else_label: succ_label,
                });
            }
            None => ctx.emit(InstKind::Jump { target: body_label }),
        }

        ctx.loop_continue.push(update_label);
        ctx.loop_break.push(succ_label);
        ctx.switch_to(body_label);
        self.build_stmt(ctx, body)?;
        if !ctx.is_completed() {
            ctx.emit(InstKind::Jump {
                target: update_label,
            });
        }
        ctx.loop_continue.pop();
        ctx.loop_break.pop();

        ctx.switch_to(update_label);
        if let Some(update) = update {
            self.build_expr(ctx, update)?;
        }
        ctx.emit(InstKind::Jump { target: cond_label });

        ctx.switch_to(succ_label);
        Ok(())
    }

    // ----- expressions -----------------------------------------------------

    fn build_expr(&mut self, ctx: &mut FuncCtx, expr: &Expr) -> Result<Addr> {
        match &expr.kind {
            ExprKind::IntLit(v) => Ok(Addr::Imm(*v)),
            ExprKind::BoolLit(b) => Ok(Addr::Imm(*b as i64)),
            ExprKind::NullLit => Ok(Addr::Imm(0)),
            ExprKind::StrLit(text) => {
                let cell = self.intern_string(text);
                let value = ctx.fresh_hinted("str");
                ctx.emit(InstKind::Load {
                    dest: value.clone(),
                    addr: Addr::global(cell),
                });
                Ok(value)
            }
            ExprKind::Ident(_) | ExprKind::This | ExprKind::Index { .. } | ExprKind::Member { .. } => {
                let addr = self.build_lvalue(ctx, expr)?;
                let value = ctx.fresh();
                ctx.emit(InstKind::Load {
                    dest: value.clone(),
                    addr,
                });
                Ok(value)
            }
            ExprKind::Unary { op, operand } => self.build_unary(ctx, *op, operand),
            ExprKind::Binary { op, lhs, rhs } => self.build_binary(ctx, *op, lhs, rhs),
            ExprKind::Call {
                func,
                receiver,
                args,
            } => self.build_call(ctx, &expr.ty, func, receiver.as_deref(), args),
            ExprKind::New { ty, dims } => self.build_new(ctx, ty, dims),
        }
    }

    fn build_unary(&mut self, ctx: &mut FuncCtx, op: ast::UnaryOp, operand: &Expr) -> Result<Addr> {
        match op {
            ast::UnaryOp::Neg | ast::UnaryOp::BitNot => {
                let value = self.build_expr(ctx, operand)?;
                let dest = ctx.fresh();
                ctx.emit(InstKind::Unary {
                    dest: dest.clone(),
                    op: if op == ast::UnaryOp::Neg {
                        UnaryOp::Neg
                    } else {
                        UnaryOp::BitNot
                    },
                    operand: value,
                });
                Ok(dest)
            }
            ast::UnaryOp::LogicalNot => {
                let value = self.build_expr(ctx, operand)?;
                let dest = ctx.fresh();
                ctx.emit(InstKind::Binary {
                    dest: dest.clone(),
                    op: BinaryOp::Xor,
                    lhs: value,
                    rhs: Addr::Imm(1),
                });
                Ok(dest)
            }
            ast::UnaryOp::Inc { prefix } | ast::UnaryOp::Dec { prefix } => {
                let is_inc = matches!(op, ast::UnaryOp::Inc { .. });
                let addr = self.build_lvalue(ctx, operand)?;
                let old = ctx.fresh();
                ctx.emit(InstKind::Load {
                    dest: old.clone(),
                    addr: addr.clone(),
                });
                let new = ctx.fresh();
                ctx.emit(InstKind::Binary {
                    dest: new.clone(),
                    op: if is_inc { BinaryOp::Add } else { BinaryOp::Sub },
                    lhs: old.clone(),
                    rhs: Addr::Imm(1),
                });
                ctx.emit(InstKind::Store {
                    addr,
                    value: new.clone(),
                });
                Ok(if prefix { new } else { old })
            }
        }
    }

    fn build_binary(
        &mut self,
        ctx: &mut FuncCtx,
        op: ast::BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Addr> {
        use ast::BinaryOp as B;

        if op == B::Assign {
            let value = self.build_expr(ctx, rhs)?;
            let addr = self.build_lvalue(ctx, lhs)?;
            ctx.emit(InstKind::Store {
                addr,
                value: value.clone(),
            });
            return Ok(value);
        }

        if matches!(op, B::LogicalAnd | B::LogicalOr) {
            return self.build_short_circuit(ctx, op, lhs, rhs);
        }

        let operands_are_str = lhs.ty == Type::Str && rhs.ty == Type::Str;
        if operands_are_str {
            return self.build_string_op(ctx, op, lhs, rhs);
        }

        if let Some(rel) = rel_op(op) {
            let lhs_val = self.build_expr(ctx, lhs)?;
            let rhs_val = self.build_expr(ctx, rhs)?;
            let dest = ctx.fresh_hinted("cmp");
            ctx.emit(InstKind::Relation {
                dest: dest.clone(),
                op: rel,
                lhs: lhs_val,
                rhs: rhs_val,
            });
            return Ok(dest);
        }

        let bin = match op {
            B::Add => BinaryOp::Add,
            B::Sub => BinaryOp::Sub,
            B::Mul => BinaryOp::Mul,
            B::Div => BinaryOp::Div,
            B::Mod => BinaryOp::Mod,
            B::BitOr => BinaryOp::BitOr,
            B::BitAnd => BinaryOp::BitAnd,
            B::Xor => BinaryOp::Xor,
            B::Shl => BinaryOp::Shl,
            B::Shr => BinaryOp::Shr,
            _ => unreachable!("handled above"),
        };
        let lhs_val = self.build_expr(ctx, lhs)?;
        let rhs_val = self.build_expr(ctx, rhs)?;
        let dest = ctx.fresh();
        ctx.emit(InstKind::Binary {
            dest: dest.clone(),
            op: bin,
            lhs: lhs_val,
            rhs: rhs_val,
        });
        Ok(dest)
    }

    fn build_short_circuit(
        &mut self,
        ctx: &mut FuncCtx,
        op: ast::BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Addr> {
        let is_or = op == ast::BinaryOp::LogicalOr;
        let rhs_label = ctx.new_block();
        let join = ctx.new_block();

        let lhs_val = self.build_expr(ctx, lhs)?;
        // lowering lhs may itself have moved to a new block
        let origin_end = ctx.cur;
        if is_or {
            ctx.emit(InstKind::Branch {
                cond: lhs_val,
                then_label: join,
                else_label: rhs_label,
            });
        } else {
            ctx.emit(InstKind::Branch {
                cond: lhs_val,
                then_label: rhs_label,
                else_label: join,
            });
        }

        ctx.switch_to(rhs_label);
        let rhs_val = self.build_expr(ctx, rhs)?;
        let rhs_end = ctx.cur;
        ctx.emit(InstKind::Jump { target: join });

        ctx.switch_to(join);
        let dest = ctx.fresh_hinted("sc");
        ctx.emit(InstKind::Phi {
            dest: dest.clone(),
            options: vec![
                (Addr::Imm(is_or as i64), origin_end),
                (rhs_val, rhs_end),
            ],
        });
        Ok(dest)
    }

    fn build_string_op(
        &mut self,
        ctx: &mut FuncCtx,
        op: ast::BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Addr> {
        use ast::BinaryOp as B;
        let lhs_val = self.build_expr(ctx, lhs)?;
        let rhs_val = self.build_expr(ctx, rhs)?;
        let (callee, swapped) = match op {
            B::Add => ("#string#add", false),
            B::Eq => ("#string#equal", false),
            B::Ne => ("#string#inequal", false),
            B::Lt => ("#string#less", false),
            B::Le => ("#string#less_equal", false),
            B::Gt => ("#string#less", true),
            B::Ge => ("#string#less_equal", true),
            _ => return Err(Error::semantic("invalid operator on strings")),
        };
        let args = if swapped {
            vec![rhs_val, lhs_val]
        } else {
            vec![lhs_val, rhs_val]
        };
        let dest = ctx.fresh_hinted("strv");
        ctx.emit(InstKind::Call {
            dest: Some(dest.clone()),
            func: callee.to_string(),
            args,
        });
        Ok(dest)
    }

    fn build_call(
        &mut self,
        ctx: &mut FuncCtx,
        result_ty: &Type,
        func: &str,
        receiver: Option<&Expr>,
        args: &[Expr],
    ) -> Result<Addr> {
        let mut arg_vals = Vec::new();
        let callee = match receiver {
            None => func.to_string(),
            Some(obj) => {
                let obj_val = self.build_expr(ctx, obj)?;
                arg_vals.push(obj_val);
                match &obj.ty {
                    Type::Array(_) => {
                        if func != "size" {
                            return Err(Error::semantic(format!(
                                "unknown array method {}",
                                func
                            )));
                        }
                        "#_array_#size".to_string()
                    }
                    Type::Str => match func {
                        "length" | "substring" | "parseInt" | "ord" => {
                            format!("#string#{}", func)
                        }
                        _ => {
                            return Err(Error::semantic(format!(
                                "unknown string method {}",
                                func
                            )))
                        }
                    },
                    Type::Class(class) if !func.starts_with('#') => {
                        format!("#{}#{}", class, func)
                    }
                    Type::Class(_) => func.to_string(),
                    other => {
                        return Err(Error::semantic(format!(
                            "method call on non-object type {:?}",
                            other
                        )))
                    }
                }
            }
        };

        for arg in args {
            arg_vals.push(self.build_expr(ctx, arg)?);
        }

        if !self.declared_funcs.contains(&callee) {
            return Err(Error::UnresolvedCall { name: callee });
        }

        let dest = match result_ty {
            Type::Void => None,
            _ => Some(ctx.fresh_hinted("ret")),
        };
        ctx.emit(InstKind::Call {
            dest: dest.clone(),
            func: callee,
            args: arg_vals,
        });
        Ok(dest.unwrap_or(Addr::Imm(0)))
    }

    fn build_new(&mut self, ctx: &mut FuncCtx, ty: &Type, dims: &[Expr]) -> Result<Addr> {
        match ty {
            Type::Array(_) => self.build_new_array(ctx, ty, dims),
            Type::Class(class) => {
                let size = self
                    .layouts
                    .get(class)
                    .ok_or_else(|| Error::semantic(format!("unknown class {}", class)))?
                    .size;
                let ptr = ctx.fresh_hinted("p");
                ctx.emit(InstKind::Malloc {
                    dest: ptr.clone(),
                    size: Addr::Imm(size as i64),
                });
                ctx.emit(InstKind::Call {
                    dest: None,
                    func: format!("#{}#_ctor_", class),
                    args: vec![ptr.clone()],
                });
                Ok(ptr)
            }
            Type::Str => {
                let ptr = ctx.fresh_hinted("p");
                ctx.emit(InstKind::Malloc {
                    dest: ptr.clone(),
                    size: Addr::Imm(16),
                });
                ctx.emit(InstKind::Call {
                    dest: None,
                    func: "#string#_ctor_".to_string(),
                    args: vec![ptr.clone()],
                });
                Ok(ptr)
            }
            other => Err(Error::semantic(format!("cannot new {:?}", other))),
        }
    }

    // the array value points at the data slot of a 16-byte {length, data}
    // header, keeping the length at value - 8
    fn build_new_array(&mut self, ctx: &mut FuncCtx, ty: &Type, dims: &[Expr]) -> Result<Addr> {
        let Type::Array(elem_ty) = ty else {
            return Err(Error::semantic("new[] on a non-array type"));
        };
        let Some(outer) = dims.first() else {
            return Err(Error::semantic("new[] without a dimension"));
        };

        let len = self.build_expr(ctx, outer)?;
        let header = ctx.fresh_hinted("hdr");
        ctx.emit(InstKind::Malloc {
            dest: header.clone(),
            size: Addr::Imm(16),
        });
        ctx.emit(InstKind::Store {
            addr: header.clone(),
            value: len.clone(),
        });

        let bytes = ctx.fresh();
        ctx.emit(InstKind::Binary {
            dest: bytes.clone(),
            op: BinaryOp::Mul,
            lhs: len.clone(),
            rhs: Addr::Imm(8),
        });
        let data = ctx.fresh_hinted("data");
        ctx.emit(InstKind::Malloc {
            dest: data.clone(),
            size: bytes.clone(),
        });
        let value = ctx.fresh_hinted("arr");
        ctx.emit(InstKind::Binary {
            dest: value.clone(),
            op: BinaryOp::Add,
            lhs: header,
            rhs: Addr::Imm(8),
        });
        ctx.emit(InstKind::Store {
            addr: value.clone(),
            value: data.clone(),
        });

        // inner dimensions fill in with a generated loop
        if dims.len() > 1 {
            let end = ctx.fresh();
            ctx.emit(InstKind::Binary {
                dest: end.clone(),
                op: BinaryOp::Add,
                lhs: data.clone(),
                rhs: bytes,
            });
            let cursor_name = match ctx.fresh_hinted("newcur") {
                Addr::Local(name) => name,
                _ => unreachable!(),
            };
            let cursor = ctx.alloc_var(&cursor_name);
            ctx.emit(InstKind::Store {
                addr: cursor.clone(),
                value: data,
            });

            let cond_label = ctx.new_block();
            let body_label = ctx.new_block();
            let succ_label = ctx.new_block();
            ctx.emit(InstKind::Jump { target: cond_label });

            ctx.switch_to(cond_label);
            let cur = ctx.fresh();
            ctx.emit(InstKind::Load {
                dest: cur.clone(),
                addr: cursor.clone(),
            });
            let more = ctx.fresh();
            ctx.emit(InstKind::Relation {
                dest: more.clone(),
                op: RelOp::Lt,
                lhs: cur.clone(),
                rhs: end,
            });
            ctx.emit(InstKind::Branch {
                cond: more,
                then_label: body_label,
                else_label: succ_label,
            });

            ctx.switch_to(body_label);
            let inner = self.build_new_array(ctx, elem_ty, &dims[1..])?;
            let slot = ctx.fresh();
            ctx.emit(InstKind::Load {
                dest: slot.clone(),
                addr: cursor.clone(),
            });
            ctx.emit(InstKind::Store {
                addr: slot.clone(),
                value: inner,
            });
            let next = ctx.fresh();
            ctx.emit(InstKind::Binary {
                dest: next.clone(),
                op: BinaryOp::Add,
                lhs: slot,
                rhs: Addr::Imm(8),
            });
            ctx.emit(InstKind::Store {
                addr: cursor,
                value: next,
            });
            ctx.emit(InstKind::Jump { target: cond_label });

            ctx.switch_to(succ_label);
        }

        Ok(value)
    }

    // address of an lvalue; loading it yields the expression's value
    fn build_lvalue(&mut self, ctx: &mut FuncCtx, expr: &Expr) -> Result<Addr> {
        match &expr.kind {
            ExprKind::Ident(name) => {
                if let Some(slot) = ctx.vars.get(name) {
                    return Ok(slot.clone());
                }
                if self.global_types.contains_key(name) {
                    return Ok(Addr::global(format!("@{}", name)));
                }
                Err(Error::semantic(format!("unresolved identifier {}", name)))
            }
            ExprKind::This => ctx
                .vars
                .get("this")
                .cloned()
                .ok_or_else(|| Error::semantic("this outside a method")),
            ExprKind::Index { array, index } => {
                let arr = self.build_expr(ctx, array)?;
                let idx = self.build_expr(ctx, index)?;
                let data = ctx.fresh_hinted("data");
                ctx.emit(InstKind::Load {
                    dest: data.clone(),
                    addr: arr,
                });
                let scaled = ctx.fresh();
                ctx.emit(InstKind::Binary {
                    dest: scaled.clone(),
                    op: BinaryOp::Mul,
                    lhs: idx,
                    rhs: Addr::Imm(8),
                });
                let elem = ctx.fresh_hinted("ptr");
                ctx.emit(InstKind::Binary {
                    dest: elem.clone(),
                    op: BinaryOp::Add,
                    lhs: data,
                    rhs: scaled,
                });
                Ok(elem)
            }
            ExprKind::Member { object, field } => {
                let Type::Class(class) = &object.ty else {
                    return Err(Error::semantic("member access on a non-class value"));
                };
                let base = self.build_expr(ctx, object)?;
                let offset = *self
                    .layouts
                    .get(class)
                    .and_then(|l| l.offsets.get(field))
                    .ok_or_else(|| {
                        Error::semantic(format!("unknown field {}::{}", class, field))
                    })?;
                let ptr = ctx.fresh_hinted("ptr");
                ctx.emit(InstKind::AttachedComment(format!(
                    "element ptr: {}::{}",
                    class, field
                )));
                ctx.emit(InstKind::Binary {
                    dest: ptr.clone(),
                    op: BinaryOp::Add,
                    lhs: base,
                    rhs: Addr::Imm(offset as i64),
                });
                Ok(ptr)
            }
            _ => Err(Error::semantic("expression is not an lvalue")),
        }
    }

    // a literal interns to a content global {length, bytes} plus a pointer
    // cell filled in by _init_global_vars_
    fn intern_string(&mut self, text: &str) -> String {
        if let Some(cell) = self.str_lits.get(text) {
            return cell.clone();
        }
        let cell = format!("@_strlit_{}", self.str_lit_cnt);
        let content = format!("{}c", cell);
        self.str_lit_cnt += 1;

        let mut data = (text.len() as i64).to_le_bytes().to_vec();
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        self.module.add_global(GlobalVar::cell(cell.clone()));
        self.module.add_global(GlobalVar::with_data(content.clone(), data));

        let tmp = Addr::local(format!(".strinit{}", self.str_lit_cnt));
        self.str_init.push(InstKind::Binary {
            dest: tmp.clone(),
            op: BinaryOp::Add,
            lhs: Addr::global(content),
            rhs: Addr::Imm(8),
        });
        self.str_init.push(InstKind::Store {
            addr: Addr::global(cell.clone()),
            value: tmp,
        });

        self.str_lits.insert(text.to_string(), cell.clone());
        cell
    }
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn rel_op(op: ast::BinaryOp) -> Option<RelOp> {
    use ast::BinaryOp as B;
    Some(match op {
        B::Eq => RelOp::Eq,
        B::Ne => RelOp::Ne,
        B::Lt => RelOp::Lt,
        B::Gt => RelOp::Gt,
        B::Le => RelOp::Le,
        B::Ge => RelOp::Ge,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FuncDecl, GlobalDecl};
    use crate::ir::verify_module;

    fn int_expr(kind: ExprKind) -> Expr {
        Expr {
            ty: Type::Int,
            kind,
        }
    }

    fn main_with(body: Vec<Stmt>) -> Program {
        Program {
            classes: vec![],
            globals: vec![],
            funcs: vec![FuncDecl {
                name: "main".to_string(),
                params: vec![],
                ret: Type::Int,
                body,
                receiver: None,
            }],
        }
    }

    #[test]
    fn test_simple_return_builds() {
        let program = main_with(vec![Stmt::Return(Some(int_expr(ExprKind::Binary {
            op: ast::BinaryOp::Add,
            lhs: Box::new(int_expr(ExprKind::IntLit(1))),
            rhs: Box::new(int_expr(ExprKind::Binary {
                op: ast::BinaryOp::Mul,
                lhs: Box::new(int_expr(ExprKind::IntLit(2))),
                rhs: Box::new(int_expr(ExprKind::IntLit(3))),
            })),
        })))]);
        let module = IrBuilder::new().build(&program).unwrap();
        verify_module(&module);
        let main = &module.funcs["main"];
        // init call inserted into main's entry
        assert!(main.blocks[0]
            .insts
            .iter()
            .any(|i| matches!(&i.kind, InstKind::Call { func, .. } if func == INIT_GLOBALS)));
    }

    #[test]
    fn test_variables_become_entry_allocas() {
        let program = main_with(vec![
            Stmt::VarDecl {
                name: "a".to_string(),
                ty: Type::Int,
                init: Some(int_expr(ExprKind::IntLit(5))),
            },
            Stmt::Return(Some(int_expr(ExprKind::Ident("a".to_string())))),
        ]);
        let module = IrBuilder::new().build(&program).unwrap();
        verify_module(&module);
        let main = &module.funcs["main"];
        let entry = &main.blocks[0];
        assert!(matches!(entry.insts[0].kind, InstKind::Alloca { .. }));
        // the use loads through the slot
        assert!(entry
            .insts
            .iter()
            .any(|i| matches!(i.kind, InstKind::Load { .. })));
    }

    #[test]
    fn test_short_circuit_builds_phi_diamond() {
        let bool_lit = |b| Expr {
            ty: Type::Bool,
            kind: ExprKind::BoolLit(b),
        };
        let program = main_with(vec![
            Stmt::VarDecl {
                name: "c".to_string(),
                ty: Type::Bool,
                init: Some(Expr {
                    ty: Type::Bool,
                    kind: ExprKind::Binary {
                        op: ast::BinaryOp::LogicalAnd,
                        lhs: Box::new(bool_lit(true)),
                        rhs: Box::new(bool_lit(false)),
                    },
                }),
            },
            Stmt::Return(Some(int_expr(ExprKind::IntLit(0)))),
        ]);
        let module = IrBuilder::new().build(&program).unwrap();
        verify_module(&module);
        let main = &module.funcs["main"];
        let phis: Vec<&Inst> = main
            .blocks
            .iter()
            .flat_map(|bb| bb.insts.iter())
            .filter(|i| i.is_phi())
            .collect();
        assert_eq!(phis.len(), 1);
        if let InstKind::Phi { options, .. } = &phis[0].kind {
            // the && short-circuit literal is false
            assert!(options.iter().any(|(v, _)| *v == Addr::Imm(0)));
        }
    }

    #[test]
    fn test_string_literal_interned_once() {
        let str_lit = || Expr {
            ty: Type::Str,
            kind: ExprKind::StrLit("hi".to_string()),
        };
        let print = |e: Expr| {
            Stmt::Expr(Expr {
                ty: Type::Void,
                kind: ExprKind::Call {
                    func: "println".to_string(),
                    receiver: None,
                    args: vec![e],
                },
            })
        };
        let program = main_with(vec![
            print(str_lit()),
            print(str_lit()),
            Stmt::Return(Some(int_expr(ExprKind::IntLit(0)))),
        ]);
        let module = IrBuilder::new().build(&program).unwrap();
        verify_module(&module);
        // one cell global + one content global
        let strlit_globals = module
            .globals
            .iter()
            .filter(|g| g.ident.starts_with("@_strlit_"))
            .count();
        assert_eq!(strlit_globals, 2);
        // content carries the 8-byte length prefix
        let content = module
            .globals
            .iter()
            .find(|g| g.ident.ends_with('c'))
            .unwrap();
        let data = content.data.as_ref().unwrap();
        assert_eq!(&data[..8], &2i64.to_le_bytes());
        assert_eq!(&data[8..10], b"hi");
    }

    #[test]
    fn test_member_store_via_offset() {
        // class P { int x; int y; }  method bump: this.y = this.y + 1
        let this_expr = Expr {
            ty: Type::Class("P".to_string()),
            kind: ExprKind::This,
        };
        let member_y = || Expr {
            ty: Type::Int,
            kind: ExprKind::Member {
                object: Box::new(this_expr.clone()),
                field: "y".to_string(),
            },
        };
        let program = Program {
            classes: vec![ast::ClassDecl {
                name: "P".to_string(),
                fields: vec![
                    ("x".to_string(), Type::Int),
                    ("y".to_string(), Type::Int),
                ],
                methods: vec![FuncDecl {
                    name: "bump".to_string(),
                    params: vec![],
                    ret: Type::Void,
                    body: vec![Stmt::Expr(int_expr(ExprKind::Binary {
                        op: ast::BinaryOp::Assign,
                        lhs: Box::new(member_y()),
                        rhs: Box::new(int_expr(ExprKind::Binary {
                            op: ast::BinaryOp::Add,
                            lhs: Box::new(member_y()),
                            rhs: Box::new(int_expr(ExprKind::IntLit(1))),
                        })),
                    }))],
                    receiver: Some("P".to_string()),
                }],
            }],
            globals: vec![],
            funcs: vec![FuncDecl {
                name: "main".to_string(),
                params: vec![],
                ret: Type::Int,
                body: vec![Stmt::Return(Some(int_expr(ExprKind::IntLit(0))))],
                receiver: None,
            }],
        };
        let module = IrBuilder::new().build(&program).unwrap();
        verify_module(&module);
        let bump = &module.funcs["#P#bump"];
        // field y sits at offset 8
        let adds_offset_8 = bump.blocks.iter().flat_map(|bb| &bb.insts).any(|i| {
            matches!(&i.kind, InstKind::Binary { op: BinaryOp::Add, rhs: Addr::Imm(8), .. })
        });
        assert!(adds_offset_8);
        // a synthesized constructor zeroes both fields
        let ctor = &module.funcs["#P#_ctor_"];
        let stores = ctor
            .blocks
            .iter()
            .flat_map(|bb| &bb.insts)
            .filter(|i| matches!(i.kind, InstKind::Store { .. }))
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn test_nested_new_array_generates_loop() {
        // new int[3][4]
        let program = main_with(vec![
            Stmt::VarDecl {
                name: "a".to_string(),
                ty: Type::Array(Box::new(Type::Array(Box::new(Type::Int)))),
                init: Some(Expr {
                    ty: Type::Array(Box::new(Type::Array(Box::new(Type::Int)))),
                    kind: ExprKind::New {
                        ty: Type::Array(Box::new(Type::Array(Box::new(Type::Int)))),
                        dims: vec![int_expr(ExprKind::IntLit(3)), int_expr(ExprKind::IntLit(4))],
                    },
                }),
            },
            Stmt::Return(Some(int_expr(ExprKind::IntLit(0)))),
        ]);
        let module = IrBuilder::new().build(&program).unwrap();
        verify_module(&module);
        let main = &module.funcs["main"];
        // four mallocs: outer header + outer data + inner header + inner data
        let mallocs = main
            .blocks
            .iter()
            .flat_map(|bb| &bb.insts)
            .filter(|i| matches!(i.kind, InstKind::Malloc { .. }))
            .count();
        assert_eq!(mallocs, 4);
        // and a loop: some block branches back
        assert!(main.blocks.len() > 3);
    }

    #[test]
    fn test_global_initializer_in_init_function() {
        let program = Program {
            classes: vec![],
            globals: vec![GlobalDecl {
                name: "g".to_string(),
                ty: Type::Int,
                init: Some(int_expr(ExprKind::IntLit(11))),
            }],
            funcs: vec![FuncDecl {
                name: "main".to_string(),
                params: vec![],
                ret: Type::Int,
                body: vec![Stmt::Return(Some(int_expr(ExprKind::Ident(
                    "g".to_string(),
                ))))],
                receiver: None,
            }],
        };
        let module = IrBuilder::new().build(&program).unwrap();
        verify_module(&module);
        let init = &module.funcs[INIT_GLOBALS];
        assert!(init.blocks.iter().flat_map(|bb| &bb.insts).any(|i| {
            matches!(&i.kind, InstKind::Store { addr, value: Addr::Imm(11) }
                if addr.as_global() == Some("@g"))
        }));
    }
}
