//! Instruction selection: IR to x86-64 assembly with virtual registers
//!
//! Every IR local maps to a fresh virtual register. Physical registers are
//! named only where the ISA or the ABI insists: division runs through
//! rax/rdx, variable shifts through cl, call arguments through the System V
//! registers, returns through rax. Callee-saved registers are parked in
//! virtual registers at entry and restored before `ret`, which lets the
//! allocator keep them wherever is cheapest. A relation feeding an adjacent
//! branch as its only consumer fuses into `cmp` + `jcc`.

use std::collections::HashMap;

use crate::analysis::DefUseChain;
use crate::ir::{
    Addr, BinaryOp, FunctionModule, Inst, InstKind, Module, RelOp, UnaryOp, PHI_NAN,
};

use super::{
    AsmInst, AsmModule, BinOp, Cc, Directive, MemAddr, Operand, PhysReg, Reg, Section, UnOp,
    CALLEE_SAVE, PARAM_REGS,
};

/// `#` cannot appear in assembly symbols; synthetic names flatten it
pub fn rename_symbol(ident: &str) -> String {
    ident.replace('#', "__")
}

fn global_label(ident: &str) -> String {
    format!("L{}", ident)
}

fn block_label(label: usize) -> String {
    format!(".L{}", label)
}

/// Lower a whole IR module to assembly
pub fn select_module(module: &Module) -> AsmModule {
    let mut asm = AsmModule::default();
    asm.directives.push(Directive::DefaultRel);
    asm.directives.push(Directive::Global("main".to_string()));
    for (name, func) in &module.funcs {
        if func.is_external {
            asm.directives.push(Directive::Extern(rename_symbol(name)));
        }
    }

    for var in &module.globals {
        match &var.data {
            Some(data) => {
                asm.data.add_label(global_label(&var.ident));
                asm.data.add(AsmInst::Db(data.clone()));
            }
            None => {
                asm.bss.add_label(global_label(&var.ident));
                asm.bss.add(AsmInst::Resb(var.size));
            }
        }
    }

    for func in module.funcs.values() {
        if !func.is_external {
            let mut ctx = FuncContext::new(func);
            ctx.select_function(func, &mut asm.text);
        }
    }
    asm
}

struct FuncContext {
    vreg_cnt: usize,
    regs: HashMap<String, Reg>,
    globals: HashMap<String, Reg>,
    preg_backup: HashMap<PhysReg, Reg>,
    alloca_slots: HashMap<String, i64>,
    frame_size: i64,
    def_use: DefUseChain,
}

impl FuncContext {
    fn new(func: &FunctionModule) -> Self {
        Self {
            vreg_cnt: 0,
            regs: HashMap::new(),
            globals: HashMap::new(),
            preg_backup: HashMap::new(),
            alloca_slots: HashMap::new(),
            frame_size: 0,
            def_use: DefUseChain::build(func),
        }
    }

    fn fresh(&mut self, hint: &str) -> Reg {
        let n = self.vreg_cnt;
        self.vreg_cnt += 1;
        Reg::virt(format!("v{}_{}", hint, n))
    }

    fn reg_for(&mut self, name: &str) -> Reg {
        if let Some(reg) = self.regs.get(name) {
            return reg.clone();
        }
        let reg = self.fresh(&name.replace(['.', '#', '@'], "_"));
        self.regs.insert(name.to_string(), reg.clone());
        reg
    }

    fn addr_of(&mut self, addr: &Addr) -> Operand {
        match addr {
            Addr::Imm(v) => Operand::Imm(*v),
            Addr::Local(name) if name == PHI_NAN => Operand::Imm(0),
            Addr::Local(name) => Operand::Reg(self.reg_for(name)),
            Addr::Global(name) => Operand::Reg(
                self.globals
                    .get(name)
                    .cloned()
                    .expect("global address materialized at entry"),
            ),
            Addr::Label(_) => unreachable!("label as a value operand"),
        }
    }

    fn select_function(&mut self, func: &FunctionModule, text: &mut Section) {
        text.add_label(rename_symbol(&func.identifier));
        text.add(AsmInst::Push(Reg::Phys(PhysReg::Rbp)));
        text.add(AsmInst::Mov {
            dst: Operand::Reg(Reg::Phys(PhysReg::Rbp)),
            src: Operand::Reg(Reg::Phys(PhysReg::Rsp)),
        });

        // stack slots for the allocas that survived the middle end
        for bb in &func.blocks {
            for inst in &bb.insts {
                if let InstKind::Alloca { dest, size } = &inst.kind {
                    let size = (*size as i64 + 7) & !7;
                    self.frame_size += size;
                    self.alloca_slots
                        .insert(dest.as_local().unwrap().to_string(), self.frame_size);
                }
            }
        }
        if self.frame_size > 0 {
            let aligned = (self.frame_size + 15) & !15;
            text.add(AsmInst::Binary {
                op: BinOp::Sub,
                dst: Operand::Reg(Reg::Phys(PhysReg::Rsp)),
                src: Operand::Imm(aligned),
            });
        }

        // park callee-saved registers in virtual registers
        for preg in CALLEE_SAVE {
            if preg == PhysReg::Rbp {
                self.preg_backup.insert(preg, Reg::Phys(preg));
                continue;
            }
            let bak = self.fresh(preg.name());
            text.add(AsmInst::Mov {
                dst: Operand::Reg(bak.clone()),
                src: Operand::Reg(Reg::Phys(preg)),
            });
            self.preg_backup.insert(preg, bak);
        }

        // parameters: registers first, the rest above the saved frame
        for i in 0..func.args.len() {
            let dest = self.reg_for(&i.to_string());
            if i < 6 {
                text.add(AsmInst::Mov {
                    dst: Operand::Reg(dest),
                    src: Operand::Reg(Reg::Phys(PARAM_REGS[i])),
                });
            } else {
                text.add(AsmInst::Mov {
                    dst: Operand::Reg(dest),
                    src: Operand::Mem(MemAddr::base_disp(
                        Reg::Phys(PhysReg::Rbp),
                        (i as i64 - 4) * 8,
                    )),
                });
            }
        }

        // globals used as values are materialized once per function; plain
        // load/store addresses go through [Lname] instead
        for bb in &func.blocks {
            for inst in &bb.insts {
                let value_operands: Vec<&Addr> = match &inst.kind {
                    InstKind::Load { .. } => Vec::new(),
                    InstKind::Store { value, .. } => vec![value],
                    _ => inst.operands(),
                };
                for operand in value_operands {
                    let Some(g) = operand.as_global() else { continue };
                    if !self.globals.contains_key(g) {
                        let reg = self.fresh("gaddr");
                        text.add(AsmInst::Lea {
                            dst: reg.clone(),
                            addr: Operand::LabelAddr(global_label(g)),
                        });
                        self.globals.insert(g.to_string(), reg);
                    }
                }
            }
        }

        for (pos, bb) in func.blocks.iter().enumerate() {
            let next_label = func.blocks.get(pos + 1).map(|b| b.label);
            text.add_label(block_label(bb.label));
            let mut idx = 0;
            while idx < bb.insts.len() {
                let fused = self.select_inst(text, &bb.insts, idx, next_label);
                idx += if fused { 2 } else { 1 };
            }
        }
    }

    // Returns true when the instruction consumed its successor as well
    // (relation + branch fusion).
    fn select_inst(
        &mut self,
        text: &mut Section,
        insts: &[Inst],
        idx: usize,
        next_block: Option<usize>,
    ) -> bool {
        let inst = &insts[idx];
        match &inst.kind {
            InstKind::Comment(_) | InstKind::AttachedComment(_) | InstKind::Deleted => false,
            InstKind::Phi { .. } => unreachable!("phi reached instruction selection"),
            InstKind::StrCpy { .. } => {
                unreachable!("strcpy only appears in global initializers")
            }

            InstKind::Assign { dest, src } => {
                let dst = self.addr_of(dest);
                let src = self.addr_of(src);
                text.add(AsmInst::Mov { dst, src });
                false
            }

            InstKind::Alloca { dest, .. } => {
                let slot = self.alloca_slots[dest.as_local().unwrap()];
                let dst = self.reg_for(dest.as_local().unwrap());
                text.add(AsmInst::Lea {
                    dst,
                    addr: Operand::Mem(MemAddr::base_disp(Reg::Phys(PhysReg::Rbp), -slot)),
                });
                false
            }
            InstKind::SAlloc { dest, .. } => {
                unreachable!("salloc {:?} reached selection; statics live in .bss", dest)
            }

            InstKind::Load { dest, addr } => {
                let dst = self.addr_of(dest);
                let src = match addr {
                    Addr::Global(g) => Operand::LabelAddr(global_label(g)),
                    _ => {
                        let base = self
                            .addr_of(addr)
                            .as_reg()
                            .cloned()
                            .expect("load address is a register");
                        Operand::Mem(MemAddr::base(base))
                    }
                };
                text.add(AsmInst::Mov { dst, src });
                false
            }
            InstKind::Store { addr, value } => {
                let src = self.addr_of(value);
                let dst = match addr {
                    Addr::Global(g) => Operand::LabelAddr(global_label(g)),
                    _ => {
                        let base = self
                            .addr_of(addr)
                            .as_reg()
                            .cloned()
                            .expect("store address is a register");
                        Operand::Mem(MemAddr::base(base))
                    }
                };
                text.add(AsmInst::Mov { dst, src });
                false
            }

            InstKind::Unary { dest, op, operand } => {
                let dst = self
                    .addr_of(dest)
                    .as_reg()
                    .cloned()
                    .expect("unary destination is a register");
                let src = self.addr_of(operand);
                text.add(AsmInst::Mov {
                    dst: Operand::Reg(dst.clone()),
                    src,
                });
                text.add(AsmInst::Unary {
                    op: match op {
                        UnaryOp::Neg => UnOp::Neg,
                        UnaryOp::BitNot => UnOp::Not,
                    },
                    reg: dst,
                });
                false
            }

            InstKind::Binary { dest, op, lhs, rhs } => {
                self.select_binary(text, dest, *op, lhs, rhs);
                false
            }

            InstKind::Relation { dest, op, lhs, rhs } => {
                self.select_relation(text, insts, idx, dest, *op, lhs, rhs, next_block)
            }

            InstKind::Jump { target } => {
                if next_block != Some(*target) {
                    text.add(AsmInst::Jmp(block_label(*target)));
                }
                false
            }

            InstKind::Branch {
                cond,
                then_label,
                else_label,
            } => {
                let scratch = self.fresh("cond");
                let cond = self.addr_of(cond);
                text.add(AsmInst::Mov {
                    dst: Operand::Reg(scratch.clone()),
                    src: cond,
                });
                text.add(AsmInst::Cmp {
                    lhs: Operand::Reg(scratch),
                    rhs: Operand::Imm(0),
                });
                if next_block == Some(*then_label) {
                    text.add(AsmInst::CJump {
                        cc: Cc::Z,
                        target: block_label(*else_label),
                    });
                } else if next_block == Some(*else_label) {
                    text.add(AsmInst::CJump {
                        cc: Cc::Nz,
                        target: block_label(*then_label),
                    });
                } else {
                    text.add(AsmInst::CJump {
                        cc: Cc::Z,
                        target: block_label(*else_label),
                    });
                    text.add(AsmInst::Jmp(block_label(*then_label)));
                }
                false
            }

            InstKind::Ret { value } => {
                if let Some(value) = value {
                    let src = self.addr_of(value);
                    text.add(AsmInst::Mov {
                        dst: Operand::Reg(Reg::Phys(PhysReg::Rax)),
                        src,
                    });
                }
                for preg in CALLEE_SAVE {
                    let bak = self.preg_backup[&preg].clone();
                    if bak == Reg::Phys(preg) {
                        continue;
                    }
                    text.add(AsmInst::Mov {
                        dst: Operand::Reg(Reg::Phys(preg)),
                        src: Operand::Reg(bak),
                    });
                }
                text.add(AsmInst::Leave);
                text.add(AsmInst::Ret);
                false
            }

            InstKind::Call { dest, func, args } => {
                self.select_call(text, dest.as_ref(), func, args);
                false
            }
            InstKind::Malloc { dest, size } => {
                self.select_call(
                    text,
                    Some(dest),
                    "__alloc",
                    std::slice::from_ref(size),
                );
                false
            }
        }
    }

    fn select_binary(
        &mut self,
        text: &mut Section,
        dest: &Addr,
        op: BinaryOp,
        lhs: &Addr,
        rhs: &Addr,
    ) {
        if matches!(op, BinaryOp::Div | BinaryOp::Mod) {
            // rax/rdx are conscripted; keep their previous values in vregs
            let rax_copy = self.fresh("raxc");
            let rdx_copy = self.fresh("rdxc");
            text.add(AsmInst::Mov {
                dst: Operand::Reg(rdx_copy.clone()),
                src: Operand::Reg(Reg::Phys(PhysReg::Rdx)),
            });
            text.add(AsmInst::Mov {
                dst: Operand::Reg(rax_copy.clone()),
                src: Operand::Reg(Reg::Phys(PhysReg::Rax)),
            });

            let lhs = self.addr_of(lhs);
            text.add(AsmInst::Mov {
                dst: Operand::Reg(Reg::Phys(PhysReg::Rax)),
                src: lhs,
            });
            text.add(AsmInst::Cqo);

            let divisor = self.fresh("div");
            let rhs = self.addr_of(rhs);
            text.add(AsmInst::Mov {
                dst: Operand::Reg(divisor.clone()),
                src: rhs,
            });
            text.add(AsmInst::IDiv(divisor));

            let dst = self.addr_of(dest);
            let result = if op == BinaryOp::Mod {
                PhysReg::Rdx
            } else {
                PhysReg::Rax
            };
            text.add(AsmInst::Mov {
                dst,
                src: Operand::Reg(Reg::Phys(result)),
            });
            text.add(AsmInst::Mov {
                dst: Operand::Reg(Reg::Phys(PhysReg::Rdx)),
                src: Operand::Reg(rdx_copy),
            });
            text.add(AsmInst::Mov {
                dst: Operand::Reg(Reg::Phys(PhysReg::Rax)),
                src: Operand::Reg(rax_copy),
            });
            return;
        }

        if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
            let dst = self.addr_of(dest);
            let lhs = self.addr_of(lhs);
            text.add(AsmInst::Mov {
                dst: dst.clone(),
                src: lhs,
            });
            let shift_op = if op == BinaryOp::Shl {
                BinOp::Sal
            } else {
                BinOp::Sar
            };
            let rhs = self.addr_of(rhs);
            if matches!(rhs, Operand::Imm(_)) {
                text.add(AsmInst::Binary {
                    op: shift_op,
                    dst,
                    src: rhs,
                });
                return;
            }
            // variable shift counts go through cl
            let rcx_copy = self.fresh("rcxc");
            text.add(AsmInst::Mov {
                dst: Operand::Reg(rcx_copy.clone()),
                src: Operand::Reg(Reg::Phys(PhysReg::Rcx)),
            });
            text.add(AsmInst::Mov {
                dst: Operand::Reg(Reg::Phys(PhysReg::Rcx)),
                src: rhs,
            });
            text.add(AsmInst::Binary {
                op: shift_op,
                dst,
                src: Operand::Reg(Reg::Phys(PhysReg::Rcx)),
            });
            text.add(AsmInst::Mov {
                dst: Operand::Reg(Reg::Phys(PhysReg::Rcx)),
                src: Operand::Reg(rcx_copy),
            });
            return;
        }

        let bin_op = match op {
            BinaryOp::Add => BinOp::Add,
            BinaryOp::Sub => BinOp::Sub,
            BinaryOp::Mul => BinOp::Mul,
            BinaryOp::BitAnd => BinOp::And,
            BinaryOp::BitOr => BinOp::Or,
            BinaryOp::Xor => BinOp::Xor,
            _ => unreachable!(),
        };
        let dst = self.addr_of(dest);
        let lhs = self.addr_of(lhs);
        text.add(AsmInst::Mov {
            dst: dst.clone(),
            src: lhs,
        });
        let rhs = self.addr_of(rhs);
        text.add(AsmInst::Binary {
            op: bin_op,
            dst,
            src: rhs,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn select_relation(
        &mut self,
        text: &mut Section,
        insts: &[Inst],
        idx: usize,
        dest: &Addr,
        op: RelOp,
        lhs: &Addr,
        rhs: &Addr,
        next_block: Option<usize>,
    ) -> bool {
        // fuse with a directly following branch when the relation's result
        // has no other consumer and one branch side falls through
        let fused_branch = insts.get(idx + 1).and_then(|next| {
            let InstKind::Branch {
                cond,
                then_label,
                else_label,
            } = &next.kind
            else {
                return None;
            };
            if cond != dest {
                return None;
            }
            let next_block = next_block?;
            if next_block != *then_label && next_block != *else_label {
                return None;
            }
            let dest_name = dest.as_local()?;
            if self.def_use.uses(dest_name).len() > 1 {
                return None;
            }
            Some((*then_label, *else_label))
        });

        let lhs_op = self.addr_of(lhs);
        let lhs_reg = match lhs_op {
            Operand::Reg(r) => r,
            other => {
                let scratch = self.fresh("cmpl");
                text.add(AsmInst::Mov {
                    dst: Operand::Reg(scratch.clone()),
                    src: other,
                });
                scratch
            }
        };
        let rhs_op = self.addr_of(rhs);
        text.add(AsmInst::Cmp {
            lhs: Operand::Reg(lhs_reg),
            rhs: rhs_op,
        });

        let cc = match op {
            RelOp::Eq => Cc::Eq,
            RelOp::Ne => Cc::Ne,
            RelOp::Lt => Cc::Lt,
            RelOp::Le => Cc::Le,
            RelOp::Gt => Cc::Gt,
            RelOp::Ge => Cc::Ge,
        };

        if let Some((then_label, else_label)) = fused_branch {
            if next_block == Some(then_label) {
                text.add(AsmInst::CJump {
                    cc: cc.negated(),
                    target: block_label(else_label),
                });
            } else {
                text.add(AsmInst::CJump {
                    cc,
                    target: block_label(then_label),
                });
            }
            return true;
        }

        let dst = self
            .addr_of(dest)
            .as_reg()
            .cloned()
            .expect("relation destination is a register");
        text.add(AsmInst::Mov {
            dst: Operand::Reg(Reg::Phys(PhysReg::Rax)),
            src: Operand::Imm(0),
        });
        text.add(AsmInst::Set {
            cc,
            reg: Reg::Phys(PhysReg::Rax),
        });
        text.add(AsmInst::Mov {
            dst: Operand::Reg(dst),
            src: Operand::Reg(Reg::Phys(PhysReg::Rax)),
        });
        false
    }

    fn select_call(
        &mut self,
        text: &mut Section,
        dest: Option<&Addr>,
        callee: &str,
        args: &[Addr],
    ) {
        let stack_args = args.len().saturating_sub(6);
        let rsp_copy = self.fresh("rspc");
        if stack_args > 0 {
            text.add(AsmInst::Mov {
                dst: Operand::Reg(rsp_copy.clone()),
                src: Operand::Reg(Reg::Phys(PhysReg::Rsp)),
            });
        }

        for (i, arg) in args.iter().take(6).enumerate() {
            let src = self.addr_of(arg);
            text.add(AsmInst::Mov {
                dst: Operand::Reg(Reg::Phys(PARAM_REGS[i])),
                src,
            });
        }
        // an odd number of pushed arguments would leave rsp misaligned at
        // the call; a single pad slot keeps the 16-byte ABI alignment
        if stack_args % 2 != 0 {
            text.add(AsmInst::Push(Reg::Phys(PhysReg::Rax)));
        }
        for arg in args.iter().skip(6).rev() {
            let tmp = self.fresh("stkarg");
            let src = self.addr_of(arg);
            text.add(AsmInst::Mov {
                dst: Operand::Reg(tmp.clone()),
                src,
            });
            text.add(AsmInst::Push(tmp));
        }

        text.add(AsmInst::Call(rename_symbol(callee)));

        if let Some(dest) = dest {
            let dst = self.addr_of(dest);
            text.add(AsmInst::Mov {
                dst,
                src: Operand::Reg(Reg::Phys(PhysReg::Rax)),
            });
        }
        if stack_args > 0 {
            text.add(AsmInst::Mov {
                dst: Operand::Reg(Reg::Phys(PhysReg::Rsp)),
                src: Operand::Reg(rsp_copy),
            });
        }
    }
}
