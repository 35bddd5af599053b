//! Memory-address mapper: a 4-level sparse radix tree translating a source
//! address space to a tagged target plus attributes, convertible into
//! hardware page tables, EPT, or IOMMU page tables.

mod convert;
mod entry;
mod tree;

pub use entry::{
    aligned_to, ept_memtype, pat_index, size_covered, with_ept_memtype, EntryKind, EptAttrs, IommuAttrs, PagingAttrs, LEVELS,
    REASON_SUCCESS, REASON_UNKNOWN,
};
pub use tree::Mam;
