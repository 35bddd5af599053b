//! Tagged entry representation for the memory-address mapper and the
//! per-level address arithmetic the tree walk uses. A fixed sum type
//! matched directly at each step rather than a kind vtable.

use alloc::boxed::Box;
use bitflags::bitflags;
use hv_hal::memory::PAGE_SIZE;

/// Reserved reason codes. All other 31-bit values are caller-defined.
pub const REASON_SUCCESS: u32 = 0x0;
pub const REASON_UNKNOWN: u32 = 0x7fff_ffff;

pub const LEVELS: usize = 4;
pub const ENTRIES_PER_TABLE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Internal,
    Pt,
    Ept,
    Iommu,
}

bitflags! {
    /// Paging-kind attribute bits within the 32-bit attribute bag. PAT index
    /// occupies bits [6:4].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagingAttrs: u32 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
        const EXEC = 1 << 2;
        const GLOBAL = 1 << 3;
    }
}

bitflags! {
    /// EPT-kind attribute bits. Memory type occupies bits [5:3].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptAttrs: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const IGNORE_PAT = 1 << 6;
        const SUPPRESS_VE = 1 << 7;
    }
}

bitflags! {
    /// IOMMU-kind attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IommuAttrs: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SNOOP = 1 << 2;
        const TRANSIENT = 1 << 3;
    }
}

/// Bits [5:3] of an `EptAttrs` bag: the EPT memory-type field.
#[inline]
pub const fn ept_memtype(attrs: u32) -> u8 {
    ((attrs >> 3) & 0b111) as u8
}

#[inline]
pub const fn with_ept_memtype(attrs: u32, memtype: u8) -> u32 {
    (attrs & !(0b111 << 3)) | (((memtype & 0b111) as u32) << 3)
}

/// Bits [6:4] of a `PagingAttrs` bag: the PAT index.
#[inline]
pub const fn pat_index(attrs: u32) -> u8 {
    ((attrs >> 4) & 0b111) as u8
}

#[inline]
pub const fn shift_for_level(level: usize) -> u32 {
    12 + 9 * (LEVELS - 1 - level) as u32
}

#[inline]
pub const fn size_covered(level: usize) -> u64 {
    1u64 << shift_for_level(level)
}

#[inline]
pub fn index_for_level(addr: u64, level: usize) -> usize {
    ((addr >> shift_for_level(level)) & 0x1ff) as usize
}

#[inline]
pub const fn aligned_to(addr: u64, size: u64) -> bool {
    addr & (size - 1) == 0
}

pub type Table = [Entry; ENTRIES_PER_TABLE];

/// One radix-tree entry: absent with a reason, a leaf mapping, or an inner
/// node pointing at a subtable. `kind` is carried on both leaves and inner
/// nodes so a partially-converted tree can still be walked consistently.
pub enum Entry {
    Absent { reason: u32 },
    Leaf { kind: EntryKind, target: u64, attrs: u32 },
    Inner { kind: EntryKind, table: Box<Table> },
}

impl Entry {
    pub const fn absent_unknown() -> Self {
        Entry::Absent { reason: REASON_UNKNOWN }
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, Entry::Absent { .. })
    }
}

pub fn new_table() -> Box<Table> {
    Box::new(core::array::from_fn(|_| Entry::absent_unknown()))
}

static_assertions::const_assert_eq!(PAGE_SIZE, 0x1000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memtype_round_trips_through_the_attrs_bag() {
        let attrs = EptAttrs::READ.bits();
        let tagged = with_ept_memtype(attrs, 6);
        assert_eq!(ept_memtype(tagged), 6);
        assert_eq!(EptAttrs::from_bits_truncate(tagged), EptAttrs::READ);
    }

    #[test]
    fn memtype_field_does_not_leak_into_neighboring_bits() {
        let tagged = with_ept_memtype(EptAttrs::all().bits(), 0b111);
        assert_eq!(EptAttrs::from_bits_truncate(tagged), EptAttrs::all());
    }

    #[test]
    fn size_covered_shrinks_by_512_per_level() {
        assert_eq!(size_covered(LEVELS - 1), PAGE_SIZE);
        for level in 0..LEVELS - 1 {
            assert_eq!(size_covered(level), size_covered(level + 1) * 512);
        }
    }

    #[test]
    fn index_for_level_walks_512_entries_per_table() {
        let stride = size_covered(LEVELS - 1);
        for i in 0..512u64 {
            assert_eq!(index_for_level(i * stride, LEVELS - 1), i as usize);
        }
    }

    #[test]
    fn aligned_to_rejects_misaligned_addresses() {
        assert!(aligned_to(0x1000, PAGE_SIZE));
        assert!(!aligned_to(0x1001, PAGE_SIZE));
    }
}
