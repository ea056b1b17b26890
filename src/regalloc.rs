//! Register allocation: interference-graph coloring with spilling (§4.6),
//! plus a naive every-value-on-the-stack fallback strategy.

use std::collections::{HashMap, HashSet};

use crate::block::Cfg;
use crate::error::CompileError;
use crate::lir::{renumber, LirInst, LirProgram, LirValue};
use crate::liveness::LivenessInfo;
use crate::register::{Allocation, PReg, RegId};

/// Which allocator produced a method's register assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Naive,
    Graph,
}

/// The end result of allocation: where every virtual register lives, how
/// many spill slots were used, and whether R12 was claimed as a frame
/// pointer (and so dropped from the allocatable set).
#[derive(Clone, Debug, Default)]
pub struct AllocationResult {
    pub locations: HashMap<RegId, Allocation>,
    pub spill_bytes: i32,
    pub uses_frame_pointer: bool,
}

impl AllocationResult {
    pub fn physical_of(&self, reg: RegId) -> PReg {
        if let Some(p) = PReg::from_id(reg) {
            return p;
        }
        match self.locations.get(&reg) {
            Some(Allocation::Register(p)) => *p,
            Some(Allocation::Spill { .. }) => PReg::R0,
            None => PReg::R0,
        }
    }
}

struct Graph {
    nodes: Vec<RegId>,
    degree: HashMap<RegId, usize>,
    neighbors: HashMap<RegId, HashSet<RegId>>,
}

fn build_interference_graph(liveness: &LivenessInfo) -> Graph {
    let nodes: Vec<RegId> = liveness.intervals.keys().filter(|r| r.is_virtual()).copied().collect();
    let mut neighbors: HashMap<RegId, HashSet<RegId>> = nodes.iter().map(|n| (*n, HashSet::new())).collect();

    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            let (a, b) = (nodes[i], nodes[j]);
            if liveness.intervals[&a].intersects(&liveness.intervals[&b]) {
                neighbors.get_mut(&a).unwrap().insert(b);
                neighbors.get_mut(&b).unwrap().insert(a);
            }
        }
    }

    let degree = neighbors.iter().map(|(n, adj)| (*n, adj.len())).collect();
    Graph { nodes, degree, neighbors }
}

fn spill_weight(reg: RegId, liveness: &LivenessInfo) -> usize {
    liveness.intervals.get(&reg).map(|iv| iv.uses.len()).unwrap_or(0)
}

/// Classic Chaitin-Briggs simplify/spill/select, with the simplify worklist
/// restored (a node whose cached degree drops below K moves back onto it
/// instead of only ever being picked as a spill candidate).
fn color(graph: &Graph, liveness: &LivenessInfo, k: usize) -> (Vec<RegId>, HashSet<RegId>) {
    let mut degree = graph.degree.clone();
    let mut remaining: HashSet<RegId> = graph.nodes.iter().copied().collect();
    let mut simplify_worklist: Vec<RegId> =
        graph.nodes.iter().copied().filter(|n| degree[n] < k).collect();
    let mut stack = Vec::new();
    let mut spilled = HashSet::new();

    while !remaining.is_empty() {
        if let Some(pos) = simplify_worklist.iter().position(|n| remaining.contains(n)) {
            let node = simplify_worklist.remove(pos);
            if !remaining.remove(&node) {
                continue;
            }
            stack.push(node);
            for &neighbor in &graph.neighbors[&node] {
                if remaining.contains(&neighbor) {
                    let d = degree.get_mut(&neighbor).unwrap();
                    *d = d.saturating_sub(1);
                    if *d < k && !simplify_worklist.contains(&neighbor) {
                        simplify_worklist.push(neighbor);
                    }
                }
            }
            continue;
        }

        // No simplifiable node remains: pick a spill candidate by highest
        // degree, breaking ties toward the fewest use positions.
        let candidate = remaining
            .iter()
            .copied()
            .max_by(|a, b| {
                degree[a]
                    .cmp(&degree[b])
                    .then_with(|| spill_weight(*b, liveness).cmp(&spill_weight(*a, liveness)))
            })
            .expect("remaining is non-empty");

        remaining.remove(&candidate);
        spilled.insert(candidate);
        stack.push(candidate);
        for &neighbor in &graph.neighbors[&candidate] {
            if remaining.contains(&neighbor) {
                let d = degree.get_mut(&neighbor).unwrap();
                *d = d.saturating_sub(1);
                if *d < k && !simplify_worklist.contains(&neighbor) {
                    simplify_worklist.push(neighbor);
                }
            }
        }
    }

    (stack, spilled)
}

/// Run the graph-coloring allocator over a method's liveness information.
pub fn allocate_graph(liveness: &LivenessInfo) -> Result<AllocationResult, CompileError> {
    let graph = build_interference_graph(liveness);
    if graph.nodes.is_empty() {
        return Ok(AllocationResult::default());
    }

    let uses_frame_pointer = true; // a method with any virtual registers always builds a frame
    let allocatable = PReg::allocatable(uses_frame_pointer);
    let k = allocatable.len();

    let (stack, pre_spilled) = color(&graph, liveness, k);

    let mut locations: HashMap<RegId, Allocation> = HashMap::new();
    // Spill slots sit below the frame pointer, at negative offsets, the same
    // direction the stack grows in once the prologue reserves `spill_bytes`
    // of space for them (see `target::emit_prologue`).
    let mut next_offset = 0i32;

    for &node in stack.iter().rev() {
        let forbidden: HashSet<PReg> = graph.neighbors[&node]
            .iter()
            .filter(|n| liveness.intervals[n].intersects(&liveness.intervals[&node]))
            .filter_map(|n| locations.get(n))
            .filter_map(|a| match a {
                Allocation::Register(p) => Some(*p),
                Allocation::Spill { .. } => None,
            })
            .collect();

        // `pre_spilled` only means "picked as a spill candidate while degree
        // was too high to simplify" — a color may still be free once its
        // neighbors are actually placed, so every node gets one real attempt
        // at coloring before falling back to a spill slot.
        match allocatable.iter().find(|p| !forbidden.contains(p)) {
            Some(&p) => {
                locations.insert(node, Allocation::Register(p));
            }
            None => {
                next_offset -= 4;
                locations.insert(node, Allocation::Spill { offset: next_offset });
            }
        }
    }

    let _ = pre_spilled;
    Ok(AllocationResult { locations, spill_bytes: -next_offset, uses_frame_pointer })
}

/// Assign every virtual register its own stack slot, with no interference
/// graph at all — the fallback strategy for degenerate or huge methods.
pub fn allocate_naive(liveness: &LivenessInfo) -> AllocationResult {
    let mut locations = HashMap::new();
    let mut offset = 0i32;
    let mut virtuals: Vec<RegId> = liveness.intervals.keys().filter(|r| r.is_virtual()).copied().collect();
    virtuals.sort();
    for reg in virtuals {
        offset -= 4;
        locations.insert(reg, Allocation::Spill { offset });
    }
    AllocationResult { locations, spill_bytes: -offset, uses_frame_pointer: true }
}

pub fn allocate(strategy: Strategy, liveness: &LivenessInfo) -> Result<AllocationResult, CompileError> {
    match strategy {
        Strategy::Naive => Ok(allocate_naive(liveness)),
        Strategy::Graph => allocate_graph(liveness),
    }
}

/// Scratch registers spill code redirects a spilled virtual register onto,
/// reserved out of the allocatable set for exactly this purpose (see
/// `PReg::ALLOCATABLE_WITH_FRAME`). Up to two are needed at once because no
/// LIR instruction reads more than two registers.
const SPILL_VALUE_SCRATCH: [PReg; 2] = [PReg::R10, PReg::R11];

/// Insert a reload before every spilled read and a store after every spilled
/// write, rewriting the instruction itself to reference a scratch physical
/// register instead of the spilled virtual one — `AllocationResult::physical_of`
/// has nothing sensible to return for a `Spill` allocation, so by the time an
/// instruction reaches `target::emit` none of its operands may still name a
/// spilled register.
///
/// Snapshots each block's current instruction vector and rebuilds it in one
/// pass rather than inserting in place, avoiding the identity-indexing-while-
/// mutating hazard spill-insertion is prone to.
pub fn insert_spill_code(cfg: &Cfg, program: &mut LirProgram, allocation: &AllocationResult) {
    for block in &cfg.blocks {
        let original = program.block(block.id).clone();
        let mut rebuilt: Vec<LirValue> = Vec::with_capacity(original.len());

        for value in original {
            let mut subst: HashMap<RegId, RegId> = HashMap::new();
            let mut scratch = SPILL_VALUE_SCRATCH.iter();

            for reg in value.inst.reads() {
                if subst.contains_key(&reg) {
                    continue;
                }
                if let Some(Allocation::Spill { offset }) = allocation.locations.get(&reg) {
                    let s = *scratch.next().expect("no LIR instruction reads more than two registers");
                    push_reload(&mut rebuilt, value.block, s.id(), *offset);
                    subst.insert(reg, s.id());
                }
            }

            let write_spill = value.inst.write().and_then(|w| match allocation.locations.get(&w) {
                Some(Allocation::Spill { offset }) => Some((w, *offset)),
                _ => None,
            });
            if let Some((w, _)) = write_spill {
                subst.entry(w).or_insert(SPILL_VALUE_SCRATCH[0].id());
            }

            let inst = if subst.is_empty() { value.inst } else { value.inst.map_regs(|r| *subst.get(&r).unwrap_or(&r)) };
            rebuilt.push(LirValue { id: value.id, block: value.block, inst });

            if let Some((w, offset)) = write_spill {
                push_spill_store(&mut rebuilt, value.block, subst[&w], offset);
            }
        }

        *program.block_mut(block.id) = rebuilt;
    }

    renumber(program);
}

fn push_reload(insts: &mut Vec<LirValue>, block: crate::block::BlockId, dst: RegId, offset: i32) {
    let id = crate::lir::LirId(0);
    insts.push(LirValue { id, block, inst: LirInst::Load { dst, base: PReg::FRAME_POINTER.id(), offset } });
}

fn push_spill_store(insts: &mut Vec<LirValue>, block: crate::block::BlockId, src: RegId, offset: i32) {
    let id = crate::lir::LirId(0);
    insts.push(LirValue { id, block, inst: LirInst::Store { src, base: PReg::FRAME_POINTER.id(), offset } });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ConstantPool, Descriptor, MethodDef};
    use crate::common::Id;
    use crate::hir;
    use crate::lir;
    use crate::liveness;
    use crate::tuple::decode;

    fn id(s: &str) -> Id {
        internment::Intern::new(s.to_string())
    }

    fn pipeline_up_to_liveness(code: Vec<u8>, max_locals: u16, descriptor: &str) -> LivenessInfo {
        let m = MethodDef {
            name: id("f"),
            descriptor: Descriptor::parse(descriptor).unwrap(),
            code,
            max_locals,
            constants: ConstantPool::default(),
        };
        let tuples = decode(m.name, &m.code, &m.constants).unwrap();
        let cfg = Cfg::build(m.name, m.descriptor.clone(), tuples).unwrap();
        let hir = hir::build(&cfg, &m).unwrap();
        let lir = lir::lower(&cfg, &hir);
        liveness::analyze(&cfg, &lir)
    }

    #[test]
    fn no_virtual_registers_allocates_trivially() {
        let liveness = pipeline_up_to_liveness(vec![0x00, 0x1a], 0, "()I");
        let result = allocate_graph(&liveness).unwrap();
        assert!(result.locations.values().all(|a| matches!(a, Allocation::Register(_))));
    }

    #[test]
    fn naive_gives_every_virtual_register_a_distinct_slot() {
        let liveness = pipeline_up_to_liveness(vec![0x03, 0x00, 0x0a, 0x1a], 1, "(I)I");
        let result = allocate_naive(&liveness);
        let mut offsets: Vec<i32> = result
            .locations
            .values()
            .map(|a| match a {
                Allocation::Spill { offset } => *offset,
                _ => unreachable!(),
            })
            .collect();
        offsets.sort();
        offsets.dedup();
        assert_eq!(offsets.len(), result.locations.len());
    }

    fn liveness_with_virtuals(count: u32) -> LivenessInfo {
        let mut intervals = HashMap::new();
        for i in 0..count {
            let reg = RegId(PReg::ALL.len() as u32 + i);
            intervals.insert(reg, liveness::Interval::default());
        }
        LivenessInfo { per_block: HashMap::new(), intervals }
    }

    proptest::proptest! {
        #[test]
        fn naive_always_gives_distinct_offsets_for_any_number_of_virtuals(count in 0u32..64) {
            let liveness = liveness_with_virtuals(count);
            let result = allocate_naive(&liveness);
            let mut offsets: Vec<i32> = result
                .locations
                .values()
                .map(|a| match a {
                    Allocation::Spill { offset } => *offset,
                    _ => unreachable!(),
                })
                .collect();
            offsets.sort();
            offsets.dedup();
            proptest::prop_assert_eq!(offsets.len(), result.locations.len());
            proptest::prop_assert_eq!(result.spill_bytes, 4 * count as i32);
        }
    }

    /// Pushes 30 independent constants onto the stack before folding them
    /// together, so all 30 are simultaneously live right after the last push
    /// — with only 11 allocatable registers once a frame pointer is in play,
    /// most of them must spill.
    fn thirty_independent_values() -> (crate::block::Cfg, crate::hir::HirProgram, LirProgram) {
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
        let lir = lir::lower(&cfg, &hir);
        (cfg, hir, lir)
    }

    #[test]
    fn thirty_live_values_spill_with_distinct_offsets() {
        let (cfg, _, lir) = thirty_independent_values();
        let liveness = liveness::analyze(&cfg, &lir);
        let alloc = allocate_graph(&liveness).unwrap();

        let mut offsets: Vec<i32> = alloc
            .locations
            .values()
            .filter_map(|a| match a {
                Allocation::Spill { offset } => Some(*offset),
                _ => None,
            })
            .collect();
        assert!(offsets.len() >= 17, "expected at least 17 spills, got {}", offsets.len());
        let spilled_count = offsets.len();
        offsets.sort();
        offsets.dedup();
        assert_eq!(offsets.len(), spilled_count, "spill offsets must be distinct");
    }

    #[test]
    fn spill_code_inserts_reload_before_use_and_store_after_def() {
        let (cfg, _, mut lir) = thirty_independent_values();
        let liveness = liveness::analyze(&cfg, &lir);
        let alloc = allocate_graph(&liveness).unwrap();
        insert_spill_code(&cfg, &mut lir, &alloc);

        // This method has no parameters, so every Load/Store based off the
        // frame pointer in the final LIR must be spill code: a reload is
        // always immediately consumed by the instruction after it, and a
        // spill store's value is always defined by the instruction before it.
        let mut reload_count = 0;
        let mut store_count = 0;

        for block_id in lir.blocks_in_order() {
            let insts = lir.block(block_id);
            for (idx, value) in insts.iter().enumerate() {
                if let LirInst::Load { dst, base, .. } = &value.inst {
                    if *base == PReg::FRAME_POINTER.id() {
                        reload_count += 1;
                        let next = insts.get(idx + 1).expect("a reload must be followed by its use");
                        assert!(
                            next.inst.reads().contains(dst),
                            "reloaded value must be read by the next instruction"
                        );
                    }
                }
                if let LirInst::Store { src, base, .. } = &value.inst {
                    if *base == PReg::FRAME_POINTER.id() {
                        store_count += 1;
                        assert!(idx > 0, "a spill store must follow the instruction defining its value");
                        assert_eq!(
                            insts[idx - 1].inst.write(),
                            Some(*src),
                            "spill store's value must come from the previous instruction"
                        );
                    }
                }
            }
        }

        assert!(reload_count > 0, "expected at least one reload in a method forcing spills");
        assert!(store_count > 0, "expected at least one spill store in a method forcing spills");
    }
}
