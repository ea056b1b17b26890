//! The register model: a single, unified identifier space covering both the
//! 16 physical registers of the target machine and every virtual register
//! produced by lowering (§3).
//!
//! Ids `0..16` name physical registers; ids `16..` name virtual registers.
//! A `Cfg` (see [`crate::block`]) stores one `Register` per id in a flat
//! `registers` vector, so `RegId` doubles as the index into that vector —
//! the same arena-of-small-integers approach this repository uses for
//! blocks, HIR, and LIR values instead of the reference implementation's
//! cyclic object graph.

use derive_more::Display;

/// An index into a `Cfg`'s register arena. Values below 16 are physical.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("%{_0}")]
pub struct RegId(pub u32);

impl RegId {
    pub const PHYSICAL_COUNT: u32 = 16;

    pub fn is_physical(self) -> bool {
        self.0 < Self::PHYSICAL_COUNT
    }

    pub fn is_virtual(self) -> bool {
        !self.is_physical()
    }
}

/// The fixed physical register file of the target machine, one variant per
/// `RegId` in `0..16`.
///
/// `R0` is hardwired to zero and never allocated. `R1..R12` are
/// general-purpose temporaries; `R12` doubles as the frame pointer whenever a
/// method spills, which the allocator accounts for by excluding it from the
/// allocatable set in that case. `R10` and `R11` are further reserved as
/// spill-code scratch registers once a frame is in play (see
/// `regalloc::insert_spill_code`), so only `R1..R9` are actually handed out
/// by the allocator for a spilling method. `R13` carries return values, `R14`
/// the return address, `R15` the stack pointer — none of the three is ever
/// handed out by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum PReg {
    #[display("r0")]
    R0,
    #[display("r1")]
    R1,
    #[display("r2")]
    R2,
    #[display("r3")]
    R3,
    #[display("r4")]
    R4,
    #[display("r5")]
    R5,
    #[display("r6")]
    R6,
    #[display("r7")]
    R7,
    #[display("r8")]
    R8,
    #[display("r9")]
    R9,
    #[display("r10")]
    R10,
    #[display("r11")]
    R11,
    #[display("r12")]
    R12,
    #[display("r13")]
    R13,
    #[display("r14")]
    R14,
    #[display("r15")]
    R15,
}

impl PReg {
    pub const ZERO: PReg = PReg::R0;
    pub const FRAME_POINTER: PReg = PReg::R12;
    pub const RETURN_VALUE: PReg = PReg::R13;
    pub const RETURN_ADDRESS: PReg = PReg::R14;
    pub const STACK_POINTER: PReg = PReg::R15;

    pub const ALL: [PReg; 16] = [
        PReg::R0,
        PReg::R1,
        PReg::R2,
        PReg::R3,
        PReg::R4,
        PReg::R5,
        PReg::R6,
        PReg::R7,
        PReg::R8,
        PReg::R9,
        PReg::R10,
        PReg::R11,
        PReg::R12,
        PReg::R13,
        PReg::R14,
        PReg::R15,
    ];

    /// Temporaries available to the allocator when the method has no spills,
    /// i.e. `R1..=R12` in allocation order.
    pub const ALLOCATABLE: [PReg; 12] = [
        PReg::R1,
        PReg::R2,
        PReg::R3,
        PReg::R4,
        PReg::R5,
        PReg::R6,
        PReg::R7,
        PReg::R8,
        PReg::R9,
        PReg::R10,
        PReg::R11,
        PReg::R12,
    ];

    /// Temporaries available once `R12` has been claimed as the frame
    /// pointer and `R10`/`R11` reserved as spill-code scratch, i.e.
    /// `R1..=R9`.
    pub const ALLOCATABLE_WITH_FRAME: [PReg; 9] = [
        PReg::R1,
        PReg::R2,
        PReg::R3,
        PReg::R4,
        PReg::R5,
        PReg::R6,
        PReg::R7,
        PReg::R8,
        PReg::R9,
    ];

    pub fn allocatable(uses_frame_pointer: bool) -> &'static [PReg] {
        if uses_frame_pointer {
            &Self::ALLOCATABLE_WITH_FRAME
        } else {
            &Self::ALLOCATABLE
        }
    }

    pub fn id(self) -> RegId {
        RegId(self as u32)
    }

    pub fn from_id(id: RegId) -> Option<PReg> {
        Self::ALL.get(id.0 as usize).copied()
    }
}

/// A register as the rest of the pipeline sees it: either one of the 16
/// fixed physical registers, or a virtual register awaiting allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Physical(PReg),
    Virtual(RegId),
}

impl Register {
    pub fn id(self) -> RegId {
        match self {
            Register::Physical(p) => p.id(),
            Register::Virtual(id) => id,
        }
    }
}

/// Where a virtual register ended up after allocation: a physical register,
/// or a spill slot at a byte offset from the frame pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allocation {
    Register(PReg),
    Spill { offset: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_ids_are_below_sixteen() {
        for p in PReg::ALL {
            assert!(p.id().is_physical());
        }
        assert!(RegId(16).is_virtual());
        assert!(RegId(100).is_virtual());
    }

    #[test]
    fn allocatable_excludes_reserved_registers() {
        assert!(!PReg::ALLOCATABLE.contains(&PReg::R0));
        assert!(!PReg::ALLOCATABLE.contains(&PReg::R13));
        assert!(!PReg::ALLOCATABLE.contains(&PReg::R14));
        assert!(!PReg::ALLOCATABLE.contains(&PReg::R15));
    }

    #[test]
    fn frame_pointer_variant_reserves_scratch_and_frame_pointer() {
        assert!(!PReg::ALLOCATABLE_WITH_FRAME.contains(&PReg::R10));
        assert!(!PReg::ALLOCATABLE_WITH_FRAME.contains(&PReg::R11));
        assert!(!PReg::ALLOCATABLE_WITH_FRAME.contains(&PReg::R12));
        assert_eq!(PReg::ALLOCATABLE_WITH_FRAME.len(), 9);
    }

    #[test]
    fn from_id_round_trips() {
        assert_eq!(PReg::from_id(RegId(13)), Some(PReg::R13));
        assert_eq!(PReg::from_id(RegId(16)), None);
    }

    #[test]
    fn reg_id_display_is_stable() {
        assert_eq!(RegId(20).to_string(), "%20");
    }
}
