//! Local use/def sets, global in/out fixpoint, and per-register liveness
//! intervals with use positions (§4.5).

use std::collections::{HashMap, HashSet};

use crate::block::{BlockId, Cfg};
use crate::lir::{LirProgram, RENUMBER_GAP};
use crate::register::RegId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseKind {
    Read,
    Write,
}

/// A half-open range `[start, stop]` over LIR ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: u32,
    pub stop: u32,
}

/// One register's liveness: a sorted list of disjoint (but possibly
/// gap-merged) ranges, plus a use-kind per LIR id it is touched at.
#[derive(Clone, Debug, Default)]
pub struct Interval {
    pub ranges: Vec<Range>,
    pub uses: HashMap<u32, UseKind>,
}

impl Interval {
    /// Join-with-merge: if the new range sits within `RENUMBER_GAP` of the
    /// first range (or overlaps it), extend that range's start instead of
    /// prepending a disjoint one. `RENUMBER_GAP` is reused here (rather than
    /// a separate literal) so interval merging and LIR renumbering never
    /// drift out of sync.
    pub fn add_range(&mut self, start: u32, stop: u32) {
        if let Some(first) = self.ranges.first_mut() {
            if stop + RENUMBER_GAP >= first.start && start <= first.stop {
                first.start = first.start.min(start);
                first.stop = first.stop.max(stop);
                return;
            }
        }
        self.ranges.insert(0, Range { start, stop });
    }

    pub fn mark_use(&mut self, pos: u32, kind: UseKind) {
        self.uses.insert(pos, kind);
    }

    pub fn truncate_start(&mut self, pos: u32) {
        if let Some(first) = self.ranges.first_mut() {
            first.start = pos;
        }
    }

    pub fn intersects(&self, other: &Interval) -> bool {
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.start <= b.stop && b.start <= a.stop))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlockLiveness {
    pub live_use: HashSet<RegId>,
    pub live_def: HashSet<RegId>,
    pub live_in: HashSet<RegId>,
    pub live_out: HashSet<RegId>,
}

#[derive(Clone, Debug, Default)]
pub struct LivenessInfo {
    pub per_block: HashMap<BlockId, BlockLiveness>,
    pub intervals: HashMap<RegId, Interval>,
}

impl LivenessInfo {
    pub fn interval(&self, reg: RegId) -> Option<&Interval> {
        self.intervals.get(&reg)
    }
}

pub fn analyze(cfg: &Cfg, lir: &LirProgram) -> LivenessInfo {
    let mut per_block: HashMap<BlockId, BlockLiveness> = HashMap::new();

    for block in &cfg.blocks {
        let mut bl = BlockLiveness::default();
        for value in lir.block(block.id) {
            for r in value.inst.reads() {
                if !bl.live_def.contains(&r) {
                    bl.live_use.insert(r);
                }
            }
            if let Some(w) = value.inst.write() {
                bl.live_def.insert(w);
            }
        }
        per_block.insert(block.id, bl);
    }

    let order: Vec<BlockId> = cfg.blocks.iter().map(|b| b.id).collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &id in order.iter().rev() {
            let succs = cfg.block(id).succs.clone();
            let mut live_out = HashSet::new();
            for s in &succs {
                live_out.extend(per_block[s].live_in.iter().copied());
            }
            let bl = per_block.get_mut(&id).unwrap();
            if bl.live_out != live_out {
                bl.live_out = live_out;
                changed = true;
            }
            let live_in: HashSet<RegId> = bl
                .live_use
                .iter()
                .copied()
                .chain(bl.live_out.iter().copied().filter(|r| !bl.live_def.contains(r)))
                .collect();
            if bl.live_in != live_in {
                bl.live_in = live_in;
                changed = true;
            }
        }
    }

    let mut intervals: HashMap<RegId, Interval> = HashMap::new();
    for id in order.iter().rev() {
        let insts = lir.block(*id);
        let (start, stop) = match (insts.first(), insts.last()) {
            (Some(f), Some(l)) => (f.id.0, l.id.0),
            _ => continue,
        };
        let bl = &per_block[id];
        for r in &bl.live_out {
            intervals.entry(*r).or_default().add_range(start, stop);
        }
        for value in insts.iter().rev() {
            let pos = value.id.0;
            if let Some(w) = value.inst.write() {
                let interval = intervals.entry(w).or_default();
                if interval.is_empty() {
                    interval.add_range(pos, pos);
                }
                interval.truncate_start(pos);
                interval.mark_use(pos, UseKind::Write);
            }
            for r in value.inst.reads() {
                intervals.entry(r).or_default().add_range(start, pos);
                intervals.entry(r).or_default().mark_use(pos, UseKind::Read);
            }
        }
    }

    LivenessInfo { per_block, intervals }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_range_merges_adjacent_ranges_within_gap() {
        let mut interval = Interval::default();
        interval.add_range(10, 15);
        interval.add_range(0, 9);
        assert_eq!(interval.ranges.len(), 1);
        assert_eq!(interval.ranges[0], Range { start: 0, stop: 15 });
    }

    #[test]
    fn add_range_keeps_far_apart_ranges_disjoint() {
        let mut interval = Interval::default();
        interval.add_range(100, 110);
        interval.add_range(0, 5);
        assert_eq!(interval.ranges.len(), 2);
    }

    #[test]
    fn intersecting_intervals_are_detected() {
        let mut a = Interval::default();
        a.add_range(0, 10);
        let mut b = Interval::default();
        b.add_range(5, 15);
        assert!(a.intersects(&b));

        let mut c = Interval::default();
        c.add_range(200, 210);
        assert!(!a.intersects(&c));
    }
}
