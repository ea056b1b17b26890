//! Low-level IR naming only registers and explicit loads/stores, and the
//! HIR→LIR lowering that produces it (§4.4).

use std::collections::HashMap;

use derive_more::Display;

use crate::block::{BlockId, Cfg};
use crate::classfile::ValueType;
use crate::common::Id;
use crate::hir::{HirId, HirInst, HirProgram};
use crate::opcode::{ArithOp, CmpOp};
use crate::register::{PReg, RegId};

/// The gap left between consecutive LIR ids after renumbering, reused as the
/// distance threshold for interval-merging in [`crate::liveness`] so the two
/// stay in sync if either changes.
pub const RENUMBER_GAP: u32 = 5;

/// An index into a [`LirProgram`]'s instruction arena. Not dense: gaps of
/// `RENUMBER_GAP` are left between consecutive ids for later spill inserts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("l{_0}")]
pub struct LirId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Ordinary,
}

#[derive(Clone, Debug)]
pub enum LirInst {
    LoadParam { dst: RegId, index: u16 },
    IntConst { dst: RegId, value: i32 },
    Arithmetic { op: ArithOp, dst: RegId, a: RegId, b: RegId },
    Copy { dst: RegId, src: RegId },
    Load { dst: RegId, base: RegId, offset: i32 },
    Store { src: RegId, base: RegId, offset: i32 },
    Push { src: RegId, sp: RegId },
    Pop { dst: RegId, sp: RegId },
    Inc { reg: RegId, by: i32 },
    Jump { target: BlockId },
    CondJump { op: CmpOp, a: RegId, b: RegId, on_true: BlockId, on_false: BlockId },
    Call { kind: CallKind, name: Id, args: Vec<RegId>, ret: ValueType },
    Return { value: Option<RegId> },
    Read { dst: RegId },
    Write { src: RegId },
}

impl LirInst {
    pub fn reads(&self) -> Vec<RegId> {
        match self {
            LirInst::LoadParam { .. } | LirInst::IntConst { .. } | LirInst::Jump { .. } => vec![],
            LirInst::Arithmetic { a, b, .. } => vec![*a, *b],
            LirInst::Copy { src, .. } => vec![*src],
            LirInst::Load { base, .. } => vec![*base],
            LirInst::Store { src, base, .. } => vec![*src, *base],
            LirInst::Push { src, sp, .. } => vec![*src, *sp],
            LirInst::Pop { sp, .. } => vec![*sp],
            LirInst::Inc { reg, .. } => vec![*reg],
            LirInst::CondJump { a, b, .. } => vec![*a, *b],
            LirInst::Call { args, .. } => args.clone(),
            LirInst::Return { value } => value.into_iter().copied().collect(),
            LirInst::Read { .. } => vec![],
            LirInst::Write { src } => vec![*src],
        }
    }

    pub fn write(&self) -> Option<RegId> {
        match self {
            LirInst::LoadParam { dst, .. }
            | LirInst::IntConst { dst, .. }
            | LirInst::Arithmetic { dst, .. }
            | LirInst::Copy { dst, .. }
            | LirInst::Load { dst, .. }
            | LirInst::Read { dst } => Some(*dst),
            LirInst::Pop { dst, .. } => Some(*dst),
            LirInst::Inc { reg, .. } => Some(*reg),
            LirInst::Store { .. }
            | LirInst::Push { .. }
            | LirInst::Jump { .. }
            | LirInst::CondJump { .. }
            | LirInst::Return { .. }
            | LirInst::Write { .. } => None,
            // the call result, if any, is materialized by a following Copy from RV
            LirInst::Call { .. } => None,
        }
    }

    /// Rebuild this instruction with every register occurrence passed through
    /// `f`. Used by spill-code insertion to redirect a spilled virtual
    /// register onto a scratch physical one for a single instruction.
    pub fn map_regs(&self, f: impl Fn(RegId) -> RegId) -> LirInst {
        match self {
            LirInst::LoadParam { dst, index } => LirInst::LoadParam { dst: f(*dst), index: *index },
            LirInst::IntConst { dst, value } => LirInst::IntConst { dst: f(*dst), value: *value },
            LirInst::Arithmetic { op, dst, a, b } => {
                LirInst::Arithmetic { op: *op, dst: f(*dst), a: f(*a), b: f(*b) }
            }
            LirInst::Copy { dst, src } => LirInst::Copy { dst: f(*dst), src: f(*src) },
            LirInst::Load { dst, base, offset } => LirInst::Load { dst: f(*dst), base: f(*base), offset: *offset },
            LirInst::Store { src, base, offset } => {
                LirInst::Store { src: f(*src), base: f(*base), offset: *offset }
            }
            LirInst::Push { src, sp } => LirInst::Push { src: f(*src), sp: f(*sp) },
            LirInst::Pop { dst, sp } => LirInst::Pop { dst: f(*dst), sp: f(*sp) },
            LirInst::Inc { reg, by } => LirInst::Inc { reg: f(*reg), by: *by },
            LirInst::Jump { target } => LirInst::Jump { target: *target },
            LirInst::CondJump { op, a, b, on_true, on_false } => {
                LirInst::CondJump { op: *op, a: f(*a), b: f(*b), on_true: *on_true, on_false: *on_false }
            }
            LirInst::Call { kind, name, args, ret } => {
                LirInst::Call { kind: *kind, name: *name, args: args.iter().map(|a| f(*a)).collect(), ret: *ret }
            }
            LirInst::Return { value } => LirInst::Return { value: value.as_ref().map(|r| f(*r)) },
            LirInst::Read { dst } => LirInst::Read { dst: f(*dst) },
            LirInst::Write { src } => LirInst::Write { src: f(*src) },
        }
    }
}

/// One placed LIR instruction.
#[derive(Clone, Debug)]
pub struct LirValue {
    pub id: LirId,
    pub block: BlockId,
    pub inst: LirInst,
}

/// The lowered LIR for one method: per-block ordered instruction lists plus
/// the register arena they reference.
#[derive(Clone, Debug, Default)]
pub struct LirProgram {
    pub block_lir: Vec<(BlockId, Vec<LirValue>)>,
    pub registers: Vec<RegId>,
    next_vreg: u32,
}

impl LirProgram {
    pub fn new_vreg(&mut self) -> RegId {
        let id = RegId(PReg::ALL.len() as u32 + self.next_vreg);
        self.next_vreg += 1;
        self.registers.push(id);
        id
    }

    pub fn block(&self, id: BlockId) -> &Vec<LirValue> {
        &self.block_lir.iter().find(|(b, _)| *b == id).expect("block id must exist").1
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Vec<LirValue> {
        &mut self.block_lir.iter_mut().find(|(b, _)| *b == id).expect("block id must exist").1
    }

    pub fn iter(&self) -> impl Iterator<Item = &LirValue> {
        self.block_lir.iter().flat_map(|(_, insts)| insts.iter())
    }

    pub fn blocks_in_order(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_lir.iter().map(|(b, _)| *b)
    }
}

struct Lowerer<'a> {
    cfg: &'a Cfg,
    hir: &'a HirProgram,
    program: LirProgram,
    cache: HashMap<HirId, RegId>,
    current_block: BlockId,
}

impl<'a> Lowerer<'a> {
    fn emit(&mut self, inst: LirInst) {
        let id = LirId(0); // placeholder, assigned during renumbering
        let block = self.current_block;
        self.program
            .block_lir
            .iter_mut()
            .find(|(b, _)| *b == block)
            .expect("current block registered")
            .1
            .push(LirValue { id, block, inst });
    }

    fn lower(&mut self, hir_id: HirId) -> RegId {
        let hir_id = self.hir.resolve(hir_id);
        if let Some(&reg) = self.cache.get(&hir_id) {
            return reg;
        }
        let value = self.hir.get(hir_id);
        let block = value.block;

        let dst = match &value.inst {
            HirInst::IntConst(n) => {
                let dst = self.program.new_vreg();
                self.current_block = block;
                self.emit(LirInst::IntConst { dst, value: *n });
                dst
            }
            HirInst::Arithmetic { op, lhs, rhs } => {
                let a = self.lower(*lhs);
                let b = self.lower(*rhs);
                let dst = self.program.new_vreg();
                self.current_block = block;
                self.emit(LirInst::Arithmetic { op: *op, dst, a, b });
                dst
            }
            HirInst::LoadParam(index) => {
                let index = *index;
                self.current_block = block;
                let fp_copy = self.program.new_vreg();
                self.emit(LirInst::Copy { dst: fp_copy, src: PReg::FRAME_POINTER.id() });
                self.emit(LirInst::Inc { reg: fp_copy, by: -((index as i32) + 3) });
                let dst = self.program.new_vreg();
                self.emit(LirInst::Load { dst, base: fp_copy, offset: 0 });
                dst
            }
            HirInst::Call { name, args, ret, is_io } => {
                if *is_io && name.to_string() == "read" {
                    self.current_block = block;
                    let dst = self.program.new_vreg();
                    self.emit(LirInst::Read { dst });
                    dst
                } else if *is_io && name.to_string() == "write" {
                    let arg = self.lower(args[0]);
                    self.current_block = block;
                    self.emit(LirInst::Write { src: arg });
                    arg
                } else {
                    let arg_regs: Vec<RegId> = args.iter().map(|a| self.lower(*a)).collect();
                    self.current_block = block;
                    for &arg in arg_regs.iter().rev() {
                        self.emit(LirInst::Push { src: arg, sp: PReg::STACK_POINTER.id() });
                    }
                    self.emit(LirInst::Call {
                        kind: CallKind::Ordinary,
                        name: *name,
                        args: arg_regs.clone(),
                        ret: *ret,
                    });
                    self.emit(LirInst::Inc {
                        reg: PReg::STACK_POINTER.id(),
                        by: -(arg_regs.len() as i32),
                    });
                    if *ret != ValueType::Void {
                        let dst = self.program.new_vreg();
                        self.emit(LirInst::Copy { dst, src: PReg::RETURN_VALUE.id() });
                        dst
                    } else {
                        PReg::RETURN_VALUE.id()
                    }
                }
            }
            HirInst::Phi { .. } => {
                // Allocate the φ's destination register without appending any
                // instruction; resolution inserts the copies in predecessors.
                self.program.new_vreg()
            }
            HirInst::Jump { .. } | HirInst::CondJump { .. } | HirInst::Return(_) => {
                unreachable!("terminators are lowered directly, not via `lower`")
            }
        };

        self.cache.insert(hir_id, dst);
        dst
    }

    fn lower_terminator(&mut self, block: BlockId, hir_id: HirId) {
        self.current_block = block;
        let inst = self.hir.get(self.hir.resolve(hir_id)).inst.clone();
        match inst {
            HirInst::Jump { target } => self.emit(LirInst::Jump { target }),
            HirInst::CondJump { op, lhs, rhs, on_true, on_false } => {
                let a = self.lower(lhs);
                let b = self.lower(rhs);
                self.current_block = block;
                self.emit(LirInst::CondJump { op, a, b, on_true, on_false });
            }
            HirInst::Return(None) => self.emit(LirInst::Return { value: None }),
            HirInst::Return(Some(v)) => {
                let src = self.lower(v);
                self.current_block = block;
                self.emit(LirInst::Copy { dst: PReg::RETURN_VALUE.id(), src });
                self.emit(LirInst::Return { value: Some(PReg::RETURN_VALUE.id()) });
            }
            _ => unreachable!("not a terminator"),
        }
    }
}

/// Lower a method's HIR into LIR: memoized per-HIR-id expansion, φ
/// resolution via predecessor copies, then dense renumbering with gaps of
/// [`RENUMBER_GAP`].
pub fn lower(cfg: &Cfg, hir: &HirProgram) -> LirProgram {
    let mut lowerer = Lowerer {
        cfg,
        hir,
        program: LirProgram::default(),
        cache: HashMap::new(),
        current_block: cfg.entry(),
    };

    for block in &cfg.blocks {
        lowerer.program.block_lir.push((block.id, Vec::new()));
    }

    // Map every φ's HIR id to its allocated destination register before
    // lowering anything else, so predecessor-side resolution can reference it.
    let mut phi_dst: HashMap<HirId, RegId> = HashMap::new();
    for block in &cfg.blocks {
        for &hid in hir.block_hir.get(&block.id).unwrap_or(&Vec::new()) {
            if matches!(hir.get(hid).inst, HirInst::Phi { .. }) {
                let dst = lowerer.lower(hid);
                phi_dst.insert(hid, dst);
            }
        }
    }

    for block in &cfg.blocks {
        let ids: Vec<HirId> = hir.block_hir.get(&block.id).cloned().unwrap_or_default();
        for hid in ids {
            let value = hir.get(hid);
            match &value.inst {
                HirInst::Jump { .. } | HirInst::CondJump { .. } | HirInst::Return(_) => {
                    lowerer.lower_terminator(block.id, hid);
                }
                HirInst::Phi { .. } => {}
                _ => {
                    lowerer.lower(hid);
                }
            }
        }
    }

    resolve_phis(cfg, hir, &phi_dst, &mut lowerer);

    let mut program = lowerer.program;
    renumber(&mut program);
    program
}

fn resolve_phis(
    cfg: &Cfg,
    hir: &HirProgram,
    phi_dst: &HashMap<HirId, RegId>,
    lowerer: &mut Lowerer,
) {
    for block in &cfg.blocks {
        for &phi_id in hir.block_hir.get(&block.id).unwrap_or(&Vec::new()) {
            let args = match &hir.get(phi_id).inst {
                HirInst::Phi { args, .. } => args.clone(),
                _ => continue,
            };
            let dst = phi_dst[&phi_id];
            for (pred, arg) in block.preds.iter().zip(args.iter()) {
                let src = lowerer.lower(*arg);
                insert_copy_before_terminator(lowerer.program.block_mut(*pred), dst, src);
            }
        }
    }
}

fn insert_copy_before_terminator(insts: &mut Vec<LirValue>, dst: RegId, src: RegId) {
    let copy = LirInst::Copy { dst, src };
    let block = insts.first().map(|v| v.block).unwrap_or(BlockId(0));
    let insert_at = insts.iter().rposition(|v| is_terminator(&v.inst)).unwrap_or(insts.len());
    insts.insert(insert_at, LirValue { id: LirId(0), block, inst: copy });
}

fn is_terminator(inst: &LirInst) -> bool {
    matches!(inst, LirInst::Jump { .. } | LirInst::CondJump { .. } | LirInst::Return { .. })
}

/// Assign dense ids `0, RENUMBER_GAP, 2*RENUMBER_GAP, …` across all blocks in
/// block order, leaving room for later spill inserts.
pub fn renumber(program: &mut LirProgram) {
    let mut next = 0u32;
    for (_, insts) in program.block_lir.iter_mut() {
        for value in insts.iter_mut() {
            value.id = LirId(next);
            next += RENUMBER_GAP;
        }
    }
}
