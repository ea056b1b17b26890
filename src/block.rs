//! Basic-block discovery and CFG construction with loop detection (§4.2).

use std::collections::HashMap;

use derive_more::Display;

use crate::classfile::Descriptor;
use crate::common::Id;
use crate::error::CompileError;
use crate::tuple::Tuple;

/// An index into a [`Cfg`]'s block list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("B{_0}")]
pub struct BlockId(pub u32);

/// One basic block: an ordered run of tuples sharing one entry and one exit.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub tuples: Vec<Tuple>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub is_loop_head: bool,
    pub is_loop_tail: bool,
}

impl BasicBlock {
    fn empty(id: BlockId) -> Self {
        BasicBlock {
            id,
            tuples: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            is_loop_head: false,
            is_loop_tail: false,
        }
    }
}

/// A method's control-flow graph: a synthetic empty entry `B0` followed by
/// the real blocks split out of the tuple stream.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub method: Id,
    pub descriptor: Descriptor,
    pub blocks: Vec<BasicBlock>,
    pc_to_block: HashMap<u32, BlockId>,
}

impl Cfg {
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// The real entry block, `B1`, reached unconditionally from `B0`.
    pub fn real_entry(&self) -> BlockId {
        BlockId(1)
    }

    pub fn block_of_pc(&self, pc: u32) -> Option<BlockId> {
        self.pc_to_block.get(&pc).copied()
    }

    /// Build the CFG for one method: mark leaders, split into blocks, link
    /// edges, detect loops, and drop unreachable blocks.
    pub fn build(method: Id, descriptor: Descriptor, tuples: Vec<Tuple>) -> Result<Cfg, CompileError> {
        let leaders = mark_leaders(&tuples);
        let real_blocks = split_into_blocks(&tuples, &leaders);

        let mut blocks = Vec::with_capacity(real_blocks.len() + 1);
        blocks.push(BasicBlock::empty(BlockId(0)));
        for (i, block_tuples) in real_blocks.into_iter().enumerate() {
            let mut block = BasicBlock::empty(BlockId((i + 1) as u32));
            block.tuples = block_tuples;
            blocks.push(block);
        }

        let mut pc_to_block = HashMap::new();
        for block in &blocks[1..] {
            if let Some(first) = block.tuples.first() {
                pc_to_block.insert(first.pc, block.id);
            }
        }

        let mut cfg = Cfg { method, descriptor, blocks, pc_to_block };
        cfg.link_edges(method)?;
        cfg.detect_loops();
        cfg.drop_unreachable();
        Ok(cfg)
    }

    fn link_edges(&mut self, method: Id) -> Result<(), CompileError> {
        if self.blocks.len() > 1 {
            self.blocks[0].succs.push(BlockId(1));
        }

        let len = self.blocks.len();
        for i in 1..len {
            let last = match self.blocks[i].tuples.last() {
                Some(t) => t.clone(),
                None => continue,
            };

            let mut succs = Vec::new();
            if let Some(target_pc) = last.branch_target() {
                let target = self
                    .pc_to_block
                    .get(&target_pc)
                    .copied()
                    .ok_or(CompileError::UnreachableTarget { method, target: target_pc })?;
                succs.push(target);
                if last.is_conditional_branch() {
                    if let Some(fall) = self.pc_to_block.get(&last.next_pc()) {
                        succs.push(*fall);
                    }
                }
            } else if !last.is_return() {
                if let Some(fall) = self.pc_to_block.get(&last.next_pc()) {
                    succs.push(*fall);
                }
            }

            self.blocks[i].succs = succs;
        }

        let edges: Vec<(BlockId, BlockId)> = self
            .blocks
            .iter()
            .flat_map(|b| b.succs.iter().map(move |s| (b.id, *s)))
            .collect();
        for (from, to) in edges {
            self.block_mut(to).preds.push(from);
        }

        Ok(())
    }

    fn detect_loops(&mut self) {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        let mut mark = vec![Mark::Unvisited; self.blocks.len()];
        let mut stack = vec![(self.entry(), 0usize)];
        mark[self.entry().0 as usize] = Mark::Active;

        let mut loop_heads = Vec::new();
        let mut loop_tails = Vec::new();

        while let Some((node, next_succ)) = stack.pop() {
            let succs = self.block(node).succs.clone();
            if next_succ < succs.len() {
                stack.push((node, next_succ + 1));
                let succ = succs[next_succ];
                match mark[succ.0 as usize] {
                    Mark::Unvisited => {
                        mark[succ.0 as usize] = Mark::Active;
                        stack.push((succ, 0));
                    }
                    Mark::Active => {
                        loop_heads.push(succ);
                        loop_tails.push(node);
                    }
                    Mark::Done => {}
                }
            } else {
                mark[node.0 as usize] = Mark::Done;
            }
        }

        for head in loop_heads {
            self.block_mut(head).is_loop_head = true;
        }
        for tail in loop_tails {
            self.block_mut(tail).is_loop_tail = true;
        }
    }

    fn drop_unreachable(&mut self) {
        let mut reachable = vec![false; self.blocks.len()];
        let mut stack = vec![self.entry()];
        reachable[self.entry().0 as usize] = true;
        while let Some(node) = stack.pop() {
            for succ in self.block(node).succs.clone() {
                if !reachable[succ.0 as usize] {
                    reachable[succ.0 as usize] = true;
                    stack.push(succ);
                }
            }
        }

        if reachable.iter().all(|r| *r) {
            return;
        }

        for block in &mut self.blocks {
            block.preds.retain(|p| reachable[p.0 as usize]);
            block.succs.retain(|s| reachable[s.0 as usize]);
        }

        let kept: Vec<BasicBlock> = self
            .blocks
            .drain(..)
            .enumerate()
            .filter(|(i, _)| reachable[*i])
            .map(|(_, b)| b)
            .collect();

        let mut renumber = HashMap::new();
        for (new_idx, block) in kept.iter().enumerate() {
            renumber.insert(block.id, BlockId(new_idx as u32));
        }

        self.blocks = kept
            .into_iter()
            .map(|mut b| {
                b.id = renumber[&b.id];
                b.preds = b.preds.iter().map(|p| renumber[p]).collect();
                b.succs = b.succs.iter().map(|s| renumber[s]).collect();
                b
            })
            .collect();

        self.pc_to_block.clear();
        for block in &self.blocks {
            if let Some(first) = block.tuples.first() {
                self.pc_to_block.insert(first.pc, block.id);
            }
        }
    }
}

fn mark_leaders(tuples: &[Tuple]) -> Vec<bool> {
    let mut leaders = vec![false; tuples.len()];
    if tuples.is_empty() {
        return leaders;
    }
    leaders[0] = true;

    let pc_index: HashMap<u32, usize> =
        tuples.iter().enumerate().map(|(i, t)| (t.pc, i)).collect();

    for (i, tuple) in tuples.iter().enumerate() {
        if let Some(target_pc) = tuple.branch_target() {
            if let Some(&idx) = pc_index.get(&target_pc) {
                leaders[idx] = true;
            }
        }
        if tuple.is_terminator() {
            if let Some(&idx) = pc_index.get(&tuple.next_pc()) {
                leaders[idx] = true;
            }
        }
        let _ = i;
    }

    leaders
}

fn split_into_blocks(tuples: &[Tuple], leaders: &[bool]) -> Vec<Vec<Tuple>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();

    for (i, tuple) in tuples.iter().enumerate() {
        if leaders[i] && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push(tuple.clone());
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ConstantPool, Descriptor};
    use crate::tuple::decode;

    fn id(s: &str) -> Id {
        internment::Intern::new(s.to_string())
    }

    fn desc() -> Descriptor {
        Descriptor::parse("()I").unwrap()
    }

    #[test]
    fn straight_line_code_makes_one_real_block() {
        let code = vec![0x00, 0x1a]; // iconst_0, ireturn
        let tuples = decode(id("m"), &code, &ConstantPool::default()).unwrap();
        let cfg = Cfg::build(id("m"), desc(), tuples).unwrap();
        assert_eq!(cfg.blocks.len(), 2); // B0 synthetic + B1 real
        assert_eq!(cfg.blocks[0].succs, vec![BlockId(1)]);
        assert!(cfg.blocks[1].succs.is_empty());
    }

    #[test]
    fn branch_target_becomes_a_leader() {
        // iconst_0(pc0); goto +5(pc1..3); iconst_1(pc4); ireturn(pc5)
        let code = vec![0x00, 0x18, 0x00, 0x04, 0x01, 0x1a];
        let tuples = decode(id("m"), &code, &ConstantPool::default()).unwrap();
        let cfg = Cfg::build(id("m"), desc(), tuples).unwrap();
        // B1: iconst_0+goto ; B2: ireturn at pc5 (target of goto)
        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(cfg.blocks[1].succs, vec![BlockId(2)]);
    }

    #[test]
    fn unreachable_block_is_removed() {
        // ireturn(pc0); dead: iconst_0(pc1); ireturn(pc2) -- unreachable after return
        let code = vec![0x00, 0x1a, 0x01, 0x1a];
        let tuples = decode(id("m"), &code, &ConstantPool::default()).unwrap();
        let cfg = Cfg::build(id("m"), desc(), tuples).unwrap();
        // B0 -> B1 (iconst_0, ireturn); the trailing iconst_1/ireturn pair is
        // only reachable by falling through a return, so it is unreachable.
        assert_eq!(cfg.blocks.len(), 2);
    }

    #[test]
    fn acyclic_code_has_no_loop_flags() {
        let tuples = decode(id("m"), &[0x00, 0x1a], &ConstantPool::default()).unwrap();
        let cfg = Cfg::build(id("m"), desc(), tuples).unwrap();
        assert!(!cfg.blocks[1].is_loop_head);
        assert!(!cfg.blocks[1].is_loop_tail);
    }

    #[test]
    fn goto_back_to_an_earlier_leader_marks_head_and_tail() {
        // pc0: iconst_0 ; pc1: iconst_1 (loop head) ; pc2: goto disp=-1 -> target pc1
        let code = vec![0x00, 0x01, 0x18, 0xff, 0xff];
        let tuples = decode(id("m"), &code, &ConstantPool::default()).unwrap();
        let cfg = Cfg::build(id("m"), desc(), tuples).unwrap();
        // B1 = {iconst_0}; B2 (loop head) = {iconst_1, goto}
        assert!(cfg.blocks[2].is_loop_head);
        assert!(cfg.blocks[2].is_loop_tail);
    }
}
