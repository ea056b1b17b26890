//! Target instruction model and LIR→target emission: mnemonic mapping,
//! prologue/epilogue, jump resolution, and text formatting (§4.7).

use std::fmt::Write as _;

use crate::block::{BlockId, Cfg};
use crate::lir::{CallKind, LirInst, LirProgram};
use crate::opcode::{ArithOp, CmpOp};
use crate::regalloc::AllocationResult;
use crate::register::PReg;

/// One emitted target instruction: an address, a mnemonic, up to three
/// physical-register/immediate operands, and a trailing comment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetInstruction {
    pub pc: u32,
    pub mnemonic: &'static str,
    pub operands: Vec<Operand>,
    pub comment: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(PReg),
    Imm(i32),
    /// A branch/call immediate awaiting patching in the jump-resolution pass.
    Unresolved,
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg(p) => write!(f, "{p}"),
            Operand::Imm(n) => write!(f, "{n}"),
            Operand::Unresolved => write!(f, "?"),
        }
    }
}

fn arith_mnemonic(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "add",
        ArithOp::Sub => "sub",
        ArithOp::Mul => "mul",
        ArithOp::Div => "div",
        ArithOp::Rem => "rem",
    }
}

fn branch_mnemonic(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "jeqn",
        CmpOp::Ne => "jnen",
        CmpOp::Lt => "jltn",
        CmpOp::Le => "jlen",
        CmpOp::Gt => "jgtn",
        CmpOp::Ge => "jgen",
    }
}

struct Emitter<'a> {
    cfg: &'a Cfg,
    lir: &'a LirProgram,
    alloc: &'a AllocationResult,
    out: Vec<PendingInstruction>,
}

/// A target instruction before pcs are assigned: operands that reference a
/// block id await resolution against the final layout.
enum PendingInstruction {
    Plain { mnemonic: &'static str, operands: Vec<Operand>, comment: String },
    BranchToBlock { mnemonic: &'static str, operands: Vec<Operand>, target: BlockId, comment: String },
    /// A `Return`: jumps to the epilogue rather than falling through to
    /// whatever block happens to follow it in layout order.
    BranchToEpilogue { comment: String },
    CallTo { name: crate::common::Id, operands: Vec<Operand>, comment: String },
}

impl<'a> Emitter<'a> {
    fn p(&self, reg: crate::register::RegId) -> PReg {
        self.alloc.physical_of(reg)
    }

    fn emit_prologue(&mut self, used_callee_saved: &[PReg], spill_bytes: i32) {
        self.out.push(PendingInstruction::Plain {
            mnemonic: "pushr",
            operands: vec![Operand::Reg(PReg::RETURN_ADDRESS), Operand::Reg(PReg::STACK_POINTER)],
            comment: "save return address".into(),
        });
        self.out.push(PendingInstruction::Plain {
            mnemonic: "pushr",
            operands: vec![Operand::Reg(PReg::FRAME_POINTER), Operand::Reg(PReg::STACK_POINTER)],
            comment: "save caller's frame pointer".into(),
        });
        self.out.push(PendingInstruction::Plain {
            mnemonic: "copy",
            operands: vec![Operand::Reg(PReg::FRAME_POINTER), Operand::Reg(PReg::STACK_POINTER)],
            comment: "establish frame pointer".into(),
        });
        if spill_bytes > 0 {
            self.out.push(PendingInstruction::Plain {
                mnemonic: "addn",
                operands: vec![Operand::Reg(PReg::STACK_POINTER), Operand::Imm(-spill_bytes)],
                comment: format!("reserve {spill_bytes} bytes of spill space"),
            });
        }
        for &r in used_callee_saved {
            self.out.push(PendingInstruction::Plain {
                mnemonic: "pushr",
                operands: vec![Operand::Reg(r), Operand::Reg(PReg::STACK_POINTER)],
                comment: format!("save callee-saved {r}"),
            });
        }
    }

    fn emit_epilogue(&mut self, used_callee_saved: &[PReg], spill_bytes: i32) {
        for &r in used_callee_saved.iter().rev() {
            self.out.push(PendingInstruction::Plain {
                mnemonic: "popr",
                operands: vec![Operand::Reg(r), Operand::Reg(PReg::STACK_POINTER)],
                comment: format!("restore callee-saved {r}"),
            });
        }
        if spill_bytes > 0 {
            self.out.push(PendingInstruction::Plain {
                mnemonic: "addn",
                operands: vec![Operand::Reg(PReg::STACK_POINTER), Operand::Imm(spill_bytes)],
                comment: format!("release {spill_bytes} bytes of spill space"),
            });
        }
        self.out.push(PendingInstruction::Plain {
            mnemonic: "popr",
            operands: vec![Operand::Reg(PReg::FRAME_POINTER), Operand::Reg(PReg::STACK_POINTER)],
            comment: "restore caller's frame pointer".into(),
        });
        self.out.push(PendingInstruction::Plain {
            mnemonic: "popr",
            operands: vec![Operand::Reg(PReg::RETURN_ADDRESS), Operand::Reg(PReg::STACK_POINTER)],
            comment: "restore return address".into(),
        });
        self.out.push(PendingInstruction::Plain {
            mnemonic: "jumpr",
            operands: vec![Operand::Reg(PReg::RETURN_ADDRESS)],
            comment: "return".into(),
        });
    }

    fn emit_block(&mut self, block_id: BlockId) {
        for value in self.lir.block(block_id) {
            match &value.inst {
                LirInst::LoadParam { .. } => unreachable!("lowered away into Copy/Inc/Load"),
                LirInst::IntConst { dst, value: n } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "setn",
                    operands: vec![Operand::Reg(self.p(*dst)), Operand::Imm(*n)],
                    comment: format!("{} = {n}", self.p(*dst)),
                }),
                LirInst::Arithmetic { op, dst, a, b } => self.out.push(PendingInstruction::Plain {
                    mnemonic: arith_mnemonic(*op),
                    operands: vec![Operand::Reg(self.p(*dst)), Operand::Reg(self.p(*a)), Operand::Reg(self.p(*b))],
                    comment: String::new(),
                }),
                LirInst::Copy { dst, src } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "copy",
                    operands: vec![Operand::Reg(self.p(*dst)), Operand::Reg(self.p(*src))],
                    comment: String::new(),
                }),
                LirInst::Load { dst, base, offset } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "loadn",
                    operands: vec![Operand::Reg(self.p(*dst)), Operand::Reg(self.p(*base)), Operand::Imm(*offset)],
                    comment: String::new(),
                }),
                LirInst::Store { src, base, offset } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "storen",
                    operands: vec![Operand::Reg(self.p(*src)), Operand::Reg(self.p(*base)), Operand::Imm(*offset)],
                    comment: String::new(),
                }),
                LirInst::Push { src, sp } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "pushr",
                    operands: vec![Operand::Reg(self.p(*src)), Operand::Reg(self.p(*sp))],
                    comment: String::new(),
                }),
                LirInst::Pop { dst, sp } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "popr",
                    operands: vec![Operand::Reg(self.p(*dst)), Operand::Reg(self.p(*sp))],
                    comment: String::new(),
                }),
                LirInst::Inc { reg, by } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "addn",
                    operands: vec![Operand::Reg(self.p(*reg)), Operand::Imm(*by)],
                    comment: String::new(),
                }),
                LirInst::Jump { target } => self.out.push(PendingInstruction::BranchToBlock {
                    mnemonic: "jumpr",
                    operands: vec![Operand::Unresolved],
                    target: *target,
                    comment: String::new(),
                }),
                LirInst::CondJump { op, a, b, on_true, .. } => {
                    self.out.push(PendingInstruction::BranchToBlock {
                        mnemonic: branch_mnemonic(*op),
                        operands: vec![Operand::Reg(self.p(*a)), Operand::Reg(self.p(*b)), Operand::Unresolved],
                        target: *on_true,
                        comment: String::new(),
                    })
                }
                LirInst::Call { kind: CallKind::Ordinary, name, args, .. } => {
                    let mut operands: Vec<Operand> =
                        args.iter().map(|a| Operand::Reg(self.p(*a))).collect();
                    operands.push(Operand::Unresolved);
                    self.out.push(PendingInstruction::CallTo {
                        name: *name,
                        operands,
                        comment: format!("call {name}"),
                    });
                }
                LirInst::Return { .. } => {
                    self.out.push(PendingInstruction::BranchToEpilogue { comment: "return".into() })
                }
                LirInst::Read { dst } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "readn",
                    operands: vec![Operand::Reg(self.p(*dst))],
                    comment: String::new(),
                }),
                LirInst::Write { src } => self.out.push(PendingInstruction::Plain {
                    mnemonic: "writen",
                    operands: vec![Operand::Reg(self.p(*src))],
                    comment: String::new(),
                }),
            }
        }
    }
}

/// One method's fully resolved target code.
#[derive(Clone, Debug, Default)]
pub struct MethodAssembly {
    pub name: String,
    pub descriptor: String,
    pub instructions: Vec<TargetInstruction>,
}

fn used_callee_saved(alloc: &AllocationResult) -> Vec<PReg> {
    let mut used: Vec<PReg> = alloc
        .locations
        .values()
        .filter_map(|a| match a {
            crate::register::Allocation::Register(p) => Some(*p),
            _ => None,
        })
        .collect();
    used.sort();
    used.dedup();
    used
}

/// Emit one method's target instructions with resolved jump targets.
pub fn emit(cfg: &Cfg, lir: &LirProgram, alloc: &AllocationResult, start_pc: u32) -> (MethodAssembly, u32) {
    let mut emitter = Emitter { cfg, lir, alloc, out: Vec::new() };
    let callee_saved = used_callee_saved(alloc);

    emitter.emit_prologue(&callee_saved, alloc.spill_bytes);
    let body_start = emitter.out.len();

    let mut block_start_index = std::collections::HashMap::new();
    for block_id in lir.blocks_in_order() {
        block_start_index.insert(block_id, emitter.out.len());
        emitter.emit_block(block_id);
    }

    let epilogue_index = emitter.out.len();
    emitter.emit_epilogue(&callee_saved, alloc.spill_bytes);

    let mut pc = start_pc;
    let mut pcs = Vec::with_capacity(emitter.out.len());
    for _ in &emitter.out {
        pcs.push(pc);
        pc += 1;
    }

    let block_pc: std::collections::HashMap<BlockId, u32> = block_start_index
        .into_iter()
        .map(|(b, idx)| (b, pcs[idx]))
        .collect();
    let epilogue_pc = pcs[epilogue_index];

    let mut instructions = Vec::with_capacity(emitter.out.len());
    for (pending, pc) in emitter.out.into_iter().zip(pcs.into_iter()) {
        let instr = match pending {
            PendingInstruction::Plain { mnemonic, operands, comment } => {
                TargetInstruction { pc, mnemonic, operands, comment }
            }
            PendingInstruction::BranchToBlock { mnemonic, mut operands, target, comment } => {
                let resolved = block_pc[&target] as i32;
                if let Some(last) = operands.last_mut() {
                    *last = Operand::Imm(resolved);
                }
                TargetInstruction { pc, mnemonic, operands, comment }
            }
            PendingInstruction::BranchToEpilogue { comment } => TargetInstruction {
                pc,
                mnemonic: "jumpr",
                operands: vec![Operand::Imm(epilogue_pc as i32)],
                comment,
            },
            PendingInstruction::CallTo { name, mut operands, comment } => {
                // resolved in a second pass once every method's start_pc is known
                let _ = name;
                if let Some(last) = operands.last_mut() {
                    *last = Operand::Imm(-1);
                }
                TargetInstruction { pc, mnemonic: "calln", operands, comment }
            }
        };
        instructions.push(instr);
    }

    let _ = body_start;
    let asm = MethodAssembly {
        name: cfg.method.to_string(),
        descriptor: cfg.descriptor.to_string(),
        instructions,
    };
    (asm, pc)
}

/// Patch call-instruction immediates against the method entry-pc map built
/// once every method has been laid out.
pub fn resolve_calls(methods: &mut [MethodAssembly], entry_pc: &std::collections::HashMap<String, u32>) {
    for method in methods.iter_mut() {
        for instr in method.instructions.iter_mut() {
            if instr.mnemonic != "calln" {
                continue;
            }
            if let Some(target_name) = instr.comment.strip_prefix("call ") {
                if let Some(&pc) = entry_pc.get(target_name) {
                    if let Some(last) = instr.operands.last_mut() {
                        *last = Operand::Imm(pc as i32);
                    }
                }
            }
        }
    }
}

/// Render a class file's full assembly as plain text, one instruction per
/// line with pc, mnemonic, operands, and a trailing comment.
pub fn render(methods: &[MethodAssembly]) -> String {
    let mut out = String::new();
    for asm in methods {
        let _ = writeln!(out, "# {} {}", asm.name, asm.descriptor);
        for instr in &asm.instructions {
            let operands = instr
                .operands
                .iter()
                .map(|o| o.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(out, "{:>5}: {:<8}{:<16} # {}", instr.pc, instr.mnemonic, operands, instr.comment);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ConstantPool, Descriptor, MethodDef};
    use crate::common::Id;
    use crate::hir;
    use crate::lir;
    use crate::liveness;
    use crate::regalloc;
    use crate::tuple::decode;

    fn id(s: &str) -> Id {
        internment::Intern::new(s.to_string())
    }

    #[test]
    fn spilling_method_reserves_and_releases_frame_space_and_never_emits_r0_for_a_spilled_value() {
        let entries: Vec<crate::classfile::ConstEntry> =
            (0..30).map(crate::classfile::ConstEntry::Integer).collect();
        let mut code = Vec::new();
        for i in 0..30u8 {
            code.push(0x02);
            code.push(i);
        }
        for _ in 0..29 {
            code.push(0x05);
        }
        code.push(0x1a);

        let m = MethodDef {
            name: id("spill"),
            descriptor: Descriptor::parse("()I").unwrap(),
            code,
            max_locals: 0,
            constants: ConstantPool::new(entries),
        };
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = hir::build(&cfg, &m).unwrap();
        let mut lir_program = lir::lower(&cfg, &hir);
        let liveness = liveness::analyze(&cfg, &lir_program);
        let alloc = regalloc::allocate_graph(&liveness).unwrap();
        assert!(alloc.spill_bytes > 0, "this method must force spills to be a useful test");
        regalloc::insert_spill_code(&cfg, &mut lir_program, &alloc);

        let (asm, _) = emit(&cfg, &lir_program, &alloc, 0);

        let reserve = asm
            .instructions
            .iter()
            .find(|i| i.mnemonic == "addn" && i.operands[1] == Operand::Imm(-alloc.spill_bytes))
            .expect("prologue must reserve spill_bytes of stack space");
        let release = asm
            .instructions
            .iter()
            .find(|i| i.mnemonic == "addn" && i.operands[1] == Operand::Imm(alloc.spill_bytes))
            .expect("epilogue must release the same amount of stack space");
        assert!(reserve.pc < release.pc);

        for instr in &asm.instructions {
            for operand in &instr.operands {
                assert_ne!(*operand, Operand::Reg(PReg::R0), "a spilled value must never resolve to the zero register");
            }
        }
    }

    /// `int f(int x){ if (x==0) return 0; return 1; }`: the first `return`
    /// is not the method's last instruction, so it must branch to the
    /// epilogue rather than falling through into the second `return`'s code.
    #[test]
    fn a_non_terminal_return_branches_to_the_epilogue_instead_of_falling_through() {
        let m = MethodDef {
            name: id("f"),
            descriptor: Descriptor::parse("(I)I").unwrap(),
            code: vec![
                0x03, 0x00, // pc0 iload 0
                0x16, 0x00, 0x05, // pc2 ifz eq -> pc7
                0x01, // pc5 iconst_1
                0x1a, // pc6 ireturn        (x != 0: returns 1, not the method's last instruction)
                0x00, // pc7 iconst_0
                0x1a, // pc8 ireturn        (x == 0: returns 0)
            ],
            max_locals: 1,
            constants: ConstantPool::default(),
        };
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = hir::build(&cfg, &m).unwrap();
        let lir_program = lir::lower(&cfg, &hir);
        let liveness = liveness::analyze(&cfg, &lir_program);
        let alloc = regalloc::allocate_graph(&liveness).unwrap();
        let (asm, _) = emit(&cfg, &lir_program, &alloc, 0);

        let epilogue_pc = asm
            .instructions
            .iter()
            .rev()
            .find(|i| i.mnemonic == "jumpr" && matches!(i.operands.as_slice(), [Operand::Reg(_)]))
            .map(|i| i.pc)
            .expect("epilogue must end in a register-operand jumpr RA");

        let returns: Vec<&TargetInstruction> = asm
            .instructions
            .iter()
            .filter(|i| i.mnemonic == "jumpr" && i.comment == "return" && matches!(i.operands.as_slice(), [Operand::Imm(_)]))
            .collect();
        assert!(!returns.is_empty(), "every Return must lower to a jumpr");
        for r in &returns {
            assert_eq!(r.operands, vec![Operand::Imm(epilogue_pc as i32)]);
            assert!(r.pc < epilogue_pc, "a return branch must precede the epilogue it targets");
        }
    }

    #[test]
    fn emission_is_deterministic_across_independent_runs() {
        let m = MethodDef {
            name: id("f"),
            descriptor: Descriptor::parse("(I)I").unwrap(),
            code: vec![
                0x03, 0x00, // iload 0
                0x16, 0x00, 0x09, // ifz eq -> pc11
                0x01, // iconst_1
                0x04, 0x00, // istore 0
                0x18, 0x00, 0x06, // goto -> pc14
                0x00, // iconst_0
                0x04, 0x00, // istore 0
                0x03, 0x00, // iload 0
                0x1a, // ireturn
            ],
            max_locals: 1,
            constants: ConstantPool::default(),
        };

        let run = || {
            let tuples = decode(m.name, &m.code, &m.constants).unwrap();
            let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
            let hir = hir::build(&cfg, &m).unwrap();
            let lir_program = lir::lower(&cfg, &hir);
            let liveness = liveness::analyze(&cfg, &lir_program);
            let alloc = regalloc::allocate_graph(&liveness).unwrap();
            emit(&cfg, &lir_program, &alloc, 0).0.instructions
        };

        let first = run();
        let second = run();
        pretty_assertions::assert_eq!(first, second);
    }

    #[test]
    fn prologue_and_epilogue_bracket_the_body() {
        let m = MethodDef {
            name: id("f"),
            descriptor: Descriptor::parse("()I").unwrap(),
            code: vec![0x00, 0x1a],
            max_locals: 0,
            constants: ConstantPool::default(),
        };
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = hir::build(&cfg, &m).unwrap();
        let lir_program = lir::lower(&cfg, &hir);
        let liveness = liveness::analyze(&cfg, &lir_program);
        let alloc = regalloc::allocate_graph(&liveness).unwrap();
        let (asm, _) = emit(&cfg, &lir_program, &alloc, 0);

        assert_eq!(asm.instructions.first().unwrap().mnemonic, "pushr");
        assert_eq!(asm.instructions.last().unwrap().mnemonic, "jumpr");
    }
}
