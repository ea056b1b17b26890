//! High-level IR in SSA form, built by symbolic execution of the operand
//! stack over a CFG's tuple stream (§4.3).

use std::collections::{HashMap, VecDeque};

use derive_more::Display;

use crate::block::{BlockId, Cfg};
use crate::classfile::{MethodDef, ValueType};
use crate::error::CompileError;
use crate::opcode::{ArithOp, CmpOp, Opcode};
use crate::tuple::Operand;

/// An index into a [`HirProgram`]'s instruction arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("h{_0}")]
pub struct HirId(pub u32);

/// A type tag carried by every HIR value: integer/boolean, void, or none
/// (control-flow instructions that produce no value).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Void,
    None,
}

impl From<ValueType> for TypeTag {
    fn from(v: ValueType) -> Self {
        match v {
            ValueType::Int => TypeTag::Int,
            ValueType::Void => TypeTag::Void,
        }
    }
}

#[derive(Clone, Debug)]
pub enum HirInst {
    LoadParam(u16),
    IntConst(i32),
    Arithmetic { op: ArithOp, lhs: HirId, rhs: HirId },
    Jump { target: BlockId },
    CondJump { op: CmpOp, lhs: HirId, rhs: HirId, on_true: BlockId, on_false: BlockId },
    Call { name: crate::common::Id, args: Vec<HirId>, ret: ValueType, is_io: bool },
    Return(Option<HirId>),
    Phi { local: u16, args: Vec<HirId> },
}

/// One HIR value: its instruction, enclosing block, and type tag.
#[derive(Clone, Debug)]
pub struct HirValue {
    pub id: HirId,
    pub block: BlockId,
    pub inst: HirInst,
    pub ty: TypeTag,
}

/// The SSA-form HIR for one method: a flat arena plus the ordered HIR ids
/// belonging to each block.
#[derive(Clone, Debug, Default)]
pub struct HirProgram {
    values: Vec<HirValue>,
    pub block_hir: HashMap<BlockId, Vec<HirId>>,
    /// Redundant φ's removed by cleanup, mapped to the representative id
    /// every other HIR value should treat their id as meaning.
    aliases: HashMap<HirId, HirId>,
}

impl HirProgram {
    pub fn get(&self, id: HirId) -> &HirValue {
        &self.values[id.0 as usize]
    }

    /// Follow φ-cleanup aliases to the id every later lowering pass should
    /// actually use in place of `id`.
    pub fn resolve(&self, id: HirId) -> HirId {
        let mut current = id;
        while let Some(&next) = self.aliases.get(&current) {
            current = next;
        }
        current
    }

    pub fn iter(&self) -> impl Iterator<Item = &HirValue> {
        self.values.iter()
    }

    fn push(&mut self, block: BlockId, inst: HirInst, ty: TypeTag) -> HirId {
        let id = HirId(self.values.len() as u32);
        self.values.push(HirValue { id, block, inst, ty });
        self.block_hir.entry(block).or_default().push(id);
        id
    }
}

/// Per-block symbolic state during the BFS walk: the current HIR id bound to
/// each declared local slot.
#[derive(Clone)]
struct Locals(Vec<Option<HirId>>);

pub fn build(cfg: &Cfg, method: &MethodDef) -> Result<HirProgram, CompileError> {
    let mut program = HirProgram::default();
    let entry = cfg.entry();

    let mut entry_locals = Locals(vec![None; method.max_locals as usize]);
    for i in 0..method.descriptor.arg_count() {
        let id = program.push(entry, HirInst::LoadParam(i as u16), TypeTag::Int);
        entry_locals.0[i] = Some(id);
    }

    let mut block_locals: HashMap<BlockId, Locals> = HashMap::new();
    block_locals.insert(entry, entry_locals);

    let mut queue = VecDeque::new();
    queue.push_back(entry);
    let mut visited = vec![false; cfg.blocks.len()];
    visited[entry.0 as usize] = true;

    while let Some(block_id) = queue.pop_front() {
        if block_id != entry {
            let block = cfg.block(block_id);
            let locals = if block.preds.len() == 1 {
                block_locals[&block.preds[0]].clone()
            } else {
                let mut fresh = Locals(vec![None; method.max_locals as usize]);
                for i in 0..method.max_locals as usize {
                    let phi = program.push(
                        block_id,
                        HirInst::Phi { local: i as u16, args: vec![] },
                        TypeTag::Int,
                    );
                    fresh.0[i] = Some(phi);
                }
                fresh
            };
            block_locals.insert(block_id, locals);
        }

        interpret_block(cfg, block_id, &mut program, &mut block_locals, method)?;

        for succ in cfg.block(block_id).succs.clone() {
            if !visited[succ.0 as usize] {
                visited[succ.0 as usize] = true;
                queue.push_back(succ);
            }
        }
    }

    resolve_phi_arguments(cfg, &mut program, &block_locals);
    cleanup_phis(cfg, &mut program);

    Ok(program)
}

fn interpret_block(
    cfg: &Cfg,
    block_id: BlockId,
    program: &mut HirProgram,
    block_locals: &mut HashMap<BlockId, Locals>,
    method: &MethodDef,
) -> Result<(), CompileError> {
    let mut locals = block_locals[&block_id].clone();
    let mut stack: Vec<HirId> = Vec::new();
    let tuples = cfg.block(block_id).tuples.clone();

    for tuple in &tuples {
        match tuple.opcode {
            Opcode::IConst0 => stack.push(program.push(block_id, HirInst::IntConst(0), TypeTag::Int)),
            Opcode::IConst1 => stack.push(program.push(block_id, HirInst::IntConst(1), TypeTag::Int)),
            Opcode::Ldc => {
                let n = match tuple.operand {
                    Operand::IntLiteral(n) => n,
                    _ => unreachable!("Ldc always carries IntLiteral"),
                };
                stack.push(program.push(block_id, HirInst::IntConst(n), TypeTag::Int));
            }
            Opcode::ILoad => {
                let index = match tuple.operand {
                    Operand::Local(i) => i as usize,
                    _ => unreachable!("ILoad always carries Local"),
                };
                let value = locals.0[index].ok_or_else(|| CompileError::MalformedBytecode {
                    method: method.name,
                    pc: tuple.pc,
                    detail: format!("load of uninitialized local {index}"),
                })?;
                stack.push(value);
            }
            Opcode::IStore => {
                let index = match tuple.operand {
                    Operand::Local(i) => i as usize,
                    _ => unreachable!("IStore always carries Local"),
                };
                let value = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                locals.0[index] = Some(value);
            }
            Opcode::Dup => {
                let top = *stack.last().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                stack.push(top);
            }
            Opcode::Pop => {
                stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
            }
            Opcode::INeg => {
                let operand = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                let minus_one = program.push(block_id, HirInst::IntConst(-1), TypeTag::Int);
                let id = program.push(
                    block_id,
                    HirInst::Arithmetic { op: ArithOp::Mul, lhs: minus_one, rhs: operand },
                    TypeTag::Int,
                );
                stack.push(id);
            }
            Opcode::IArith(op) => {
                let rhs = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                let lhs = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                let id = program.push(block_id, HirInst::Arithmetic { op, lhs, rhs }, TypeTag::Int);
                stack.push(id);
            }
            Opcode::Goto => {
                let target_pc = tuple.branch_target().expect("Goto always carries a branch target");
                let target = cfg
                    .block_of_pc(target_pc)
                    .ok_or(CompileError::UnreachableTarget { method: method.name, target: target_pc })?;
                program.push(block_id, HirInst::Jump { target }, TypeTag::None);
            }
            Opcode::IfZ(cmp) => {
                let target_pc = tuple.branch_target().expect("IfZ always carries a branch target");
                let on_true = cfg
                    .block_of_pc(target_pc)
                    .ok_or(CompileError::UnreachableTarget { method: method.name, target: target_pc })?;
                let on_false = cfg
                    .block_of_pc(tuple.next_pc())
                    .ok_or(CompileError::UnreachableTarget { method: method.name, target: tuple.next_pc() })?;
                let operand = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                let zero = program.push(block_id, HirInst::IntConst(0), TypeTag::Int);
                program.push(
                    block_id,
                    HirInst::CondJump { op: cmp, lhs: operand, rhs: zero, on_true, on_false },
                    TypeTag::None,
                );
            }
            Opcode::IfICmp(cmp) => {
                let target_pc = tuple.branch_target().expect("IfICmp always carries a branch target");
                let on_true = cfg
                    .block_of_pc(target_pc)
                    .ok_or(CompileError::UnreachableTarget { method: method.name, target: target_pc })?;
                let on_false = cfg
                    .block_of_pc(tuple.next_pc())
                    .ok_or(CompileError::UnreachableTarget { method: method.name, target: tuple.next_pc() })?;
                let rhs = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                let lhs = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                program.push(
                    block_id,
                    HirInst::CondJump { op: cmp, lhs, rhs, on_true, on_false },
                    TypeTag::None,
                );
            }
            Opcode::InvokeStatic => {
                let (name, descriptor) = match &tuple.operand {
                    Operand::StaticCall { name, descriptor } => (*name, descriptor.clone()),
                    _ => unreachable!("InvokeStatic always carries StaticCall"),
                };
                let mut args = Vec::with_capacity(descriptor.arg_count());
                for _ in 0..descriptor.arg_count() {
                    args.push(stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?);
                }
                args.reverse();
                let is_io = MethodDef::is_io(&name.to_string(), &descriptor);
                let ret = descriptor.ret;
                let ty = TypeTag::from(ret);
                let id = program.push(block_id, HirInst::Call { name, args, ret, is_io }, ty);
                if ret != ValueType::Void {
                    stack.push(id);
                }
            }
            Opcode::Return => {
                program.push(block_id, HirInst::Return(None), TypeTag::None);
            }
            Opcode::IReturn => {
                let value = stack.pop().ok_or_else(|| stack_underflow(method.name, tuple.pc))?;
                program.push(block_id, HirInst::Return(Some(value)), TypeTag::None);
            }
        }
    }

    block_locals.insert(block_id, locals);
    Ok(())
}

fn stack_underflow(method: crate::common::Id, pc: u32) -> CompileError {
    CompileError::MalformedBytecode { method, pc, detail: "operand stack underflow".into() }
}

/// Fill in each φ's argument list from its predecessors' final `locals`
/// binding for that local index, in predecessor declaration order. A
/// predecessor that never defines the local (max_locals padding, a local
/// assigned in only one arm, an empty branch) simply contributes no
/// argument rather than forcing one — one φ exists per local at every join
/// regardless of whether every path actually defines it.
fn resolve_phi_arguments(cfg: &Cfg, program: &mut HirProgram, block_locals: &HashMap<BlockId, Locals>) {
    for block in &cfg.blocks {
        if block.preds.len() < 2 {
            continue;
        }
        let ids = program.block_hir.get(&block.id).cloned().unwrap_or_default();
        for id in ids {
            let local = match program.get(id).inst {
                HirInst::Phi { local, .. } => local,
                _ => continue,
            };
            let args: Vec<HirId> =
                block.preds.iter().filter_map(|p| block_locals[p].0[local as usize]).collect();
            if let HirInst::Phi { args: slot, .. } = &mut program.values[id.0 as usize].inst {
                *slot = args;
            }
        }
    }
}

/// Remove redundant φ's: loop-head self-cycles, and unanimous-argument φis
/// outside loop heads. Each removed φ's id is rewritten in `values` to alias
/// its representative argument's value, so later lookups follow through.
fn cleanup_phis(cfg: &Cfg, program: &mut HirProgram) {
    for block in &cfg.blocks {
        let ids = program.block_hir.get(&block.id).cloned().unwrap_or_default();
        let mut removed = Vec::new();
        for id in ids {
            let (args, is_phi) = match &program.get(id).inst {
                HirInst::Phi { args, .. } => (args.clone(), true),
                _ => (vec![], false),
            };
            if !is_phi {
                continue;
            }

            let redundant = if block.is_loop_head {
                args.len() >= 2 && args[1] == id
            } else {
                !args.is_empty() && args.iter().all(|a| *a == args[0])
            };

            if redundant {
                let representative = program.resolve(args[0]);
                program.aliases.insert(id, representative);
                removed.push(id);
            }
        }
        if let Some(ids) = program.block_hir.get_mut(&block.id) {
            ids.retain(|i| !removed.contains(i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ConstantPool, Descriptor};
    use crate::common::Id;
    use crate::tuple::decode;

    fn id(s: &str) -> Id {
        internment::Intern::new(s.to_string())
    }

    fn method(name: &str, code: Vec<u8>, max_locals: u16, descriptor: &str) -> MethodDef {
        MethodDef {
            name: id(name),
            descriptor: Descriptor::parse(descriptor).unwrap(),
            code,
            max_locals,
            constants: ConstantPool::default(),
        }
    }

    #[test]
    fn straight_line_produces_no_phis() {
        let m = method("f", vec![0x00, 0x1a], 0, "()I");
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = build(&cfg, &m).unwrap();
        assert!(hir.iter().all(|v| !matches!(v.inst, HirInst::Phi { .. })));
    }

    #[test]
    fn load_param_emitted_for_each_argument() {
        let m = method("f", vec![0x03, 0x00, 0x1a], 1, "(I)I");
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = build(&cfg, &m).unwrap();
        let params: Vec<_> = hir.iter().filter(|v| matches!(v.inst, HirInst::LoadParam(_))).collect();
        assert_eq!(params.len(), 1);
    }

    /// `int fact(int n){ int r=1; int i=2; while(i<=n){ r=r*i; i=i+1; } return r; }`
    /// locals: 0=n (param), 1=r, 2=i.
    fn factorial_loop_method() -> MethodDef {
        let code = vec![
            0x01, // pc0  iconst_1            r=1
            0x04, 0x01, // pc1  istore 1
            0x02, 0x00, // pc3  ldc 0 (=2)
            0x04, 0x02, // pc5  istore 2       i=2
            0x03, 0x02, // pc7  iload 2        loop head
            0x03, 0x00, // pc9  iload 0
            0x14, 0x00, 0x13, // pc11 if_icmp gt -> pc30 (exit)
            0x03, 0x01, // pc14 iload 1
            0x03, 0x02, // pc16 iload 2
            0x07, // pc18 imul
            0x04, 0x01, // pc19 istore 1       r = r*i
            0x03, 0x02, // pc21 iload 2
            0x01, // pc23 iconst_1
            0x05, // pc24 iadd
            0x04, 0x02, // pc25 istore 2       i = i+1
            0x18, 0xff, 0xec, // pc27 goto pc7  (disp -20)
            0x03, 0x01, // pc30 iload 1        exit: push r
            0x1a, // pc32 ireturn
        ];
        MethodDef {
            name: internment::Intern::new("fact".to_string()),
            descriptor: Descriptor::parse("(I)I").unwrap(),
            code,
            max_locals: 3,
            constants: ConstantPool::new(vec![crate::classfile::ConstEntry::Integer(2)]),
        }
    }

    #[test]
    fn loop_head_keeps_phis_for_modified_locals_and_drops_the_unmodified_one() {
        let m = factorial_loop_method();
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = build(&cfg, &m).unwrap();

        let head = cfg.blocks.iter().find(|b| b.is_loop_head).expect("a loop head block");
        let remaining_phi_locals: Vec<u16> = hir
            .block_hir
            .get(&head.id)
            .into_iter()
            .flatten()
            .filter_map(|id| match &hir.get(*id).inst {
                HirInst::Phi { local, .. } => Some(*local),
                _ => None,
            })
            .collect();

        // r (local 1) and i (local 2) are reassigned in the loop body, so
        // their phis survive cleanup; n (local 0) is never stored to, so its
        // phi is a self-cycle through the back edge and is removed.
        assert!(remaining_phi_locals.contains(&1));
        assert!(remaining_phi_locals.contains(&2));
        assert!(!remaining_phi_locals.contains(&0));
    }

    /// `int f(int x){ if (x == 0) { x = 1; } else { x = 0; } return x; }`
    /// with `max_locals = 2`: local 1 is javac-style padding, never stored to
    /// on either arm, so the merge block's phi for it must get zero
    /// arguments instead of panicking on a missing predecessor binding.
    #[test]
    fn undefined_local_in_every_predecessor_gets_an_empty_phi_instead_of_panicking() {
        let code = vec![
            0x03, 0x00, // pc0  iload 0
            0x16, 0x00, 0x09, // pc2  ifz eq -> pc11
            0x01, // pc5  iconst_1
            0x04, 0x00, // pc6  istore 0
            0x18, 0x00, 0x06, // pc8  goto -> pc14
            0x00, // pc11 iconst_0
            0x04, 0x00, // pc12 istore 0
            0x03, 0x00, // pc14 iload 0
            0x1a, // pc16 ireturn
        ];
        let m = method("f", code, 2, "(I)I");
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = build(&cfg, &m).unwrap();

        let has_empty_phi_for_local_one =
            hir.iter().any(|v| matches!(&v.inst, HirInst::Phi { local, args } if *local == 1 && args.is_empty()));
        assert!(has_empty_phi_for_local_one);
    }
}
