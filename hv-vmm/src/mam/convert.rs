//! Irreversible rendering of the sparse tree into hardware-format page
//! tables / EPT / IOMMU page tables. Every conversion walks the tree once,
//! allocating one physical page per table level via the host's
//! [`MemoryProvider`] and writing real PTE/EPTE bit patterns through its
//! [`HostMemoryManager`] mapping.

use hv_hal::memory::{HostMemoryManager, Hpa, MemoryProvider};

use super::entry::*;
use super::tree::Mam;
use crate::error::{VmmError, VmmResult};

type LeafEncoder<'a> = dyn Fn(u64, u32, usize) -> u64 + 'a;
type InnerEncoder<'a> = dyn Fn(Hpa) -> u64 + 'a;

impl Mam {
    /// `level` is the tree level `table` itself lives at (0 = 512 GiB-per-entry
    /// root), threaded down so `leaf_encoder` can tell a bottom-level 4 KiB
    /// leaf from a collapsed super-page leaf and set the hardware page-size
    /// bit accordingly — without it a super-page leaf written at a non-bottom
    /// level would be indistinguishable from a pointer to a subtable.
    fn render(
        &self,
        table: &Table,
        level: usize,
        provider: &dyn MemoryProvider,
        hmm: &dyn HostMemoryManager,
        leaf_encoder: &LeafEncoder,
        inner_encoder: &InnerEncoder,
    ) -> VmmResult<Hpa> {
        let page_hva = provider.alloc_page(1).ok_or(VmmError::OutOfMemory)?;
        let page_hpa = hmm.hva_to_hpa(page_hva).ok_or(VmmError::OutOfMemory)?;
        let slots = page_hva as *mut u64;
        for (i, entry) in table.iter().enumerate() {
            let raw = match entry {
                Entry::Absent { .. } => 0u64,
                Entry::Leaf { target, attrs, .. } => leaf_encoder(*target, *attrs, level),
                Entry::Inner { table: sub, .. } => {
                    let sub_hpa = self.render(sub, level + 1, provider, hmm, leaf_encoder, inner_encoder)?;
                    inner_encoder(sub_hpa)
                }
            };
            unsafe { core::ptr::write_volatile(slots.add(i), raw) };
        }
        Ok(page_hpa)
    }

    fn with_root<R>(&self, f: impl FnOnce(&Table) -> R) -> R {
        let _guard = self.lock_for_render();
        let root = unsafe { &*self.root_ptr() };
        f(root)
    }

    /// Translate every entry into a 4-level long-mode page table and return
    /// the PML4's HPA for loading into `CR3`.
    pub fn convert_to_pt64(&self, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> VmmResult<Hpa> {
        self.with_root(|root| self.render(root, 0, provider, hmm, &pt64_leaf, &pt64_inner))
    }

    /// Translate every entry into an EPT and return the root table's HPA
    /// for encoding into the EPTP. `hw_ve` selects whether the EPT
    /// suppress-#VE bit is meaningful on this CPU.
    pub fn convert_to_ept(&self, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager, hw_ve: bool) -> VmmResult<Hpa> {
        let leaf = move |target: u64, attrs: u32, level: usize| ept_leaf(target, attrs, level, hw_ve);
        self.with_root(|root| self.render(root, 0, provider, hmm, &leaf, &ept_inner))
    }

    /// Translate every entry into an IOMMU page table (same 4-level,
    /// 512-entry-per-table shape as long mode) and return its root HPA.
    pub fn convert_to_iommupt(&self, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> VmmResult<Hpa> {
        self.with_root(|root| self.render(root, 0, provider, hmm, &iommu_leaf, &iommu_inner))
    }

    /// Translate the sub-4-GiB portion of the tree into a 3-level PAE page
    /// table (PDPT\[4\]/PD\[512\]/PT\[512\]) and return the PDPT's HPA.
    /// PAE addresses only 4 GiB of guest space, which lands entirely inside
    /// the first entry of the tree's top (512 GiB-per-entry) level; mappings
    /// above 4 GiB are not represented. A tree whose top entry is itself a
    /// single 512 GiB leaf (rather than descending through a subtable) is
    /// rejected — that shape only arises from an identity map spanning the
    /// entire source space, which a 32-bit guest's GPM never needs.
    pub fn convert_to_pt32pae(&self, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> VmmResult<Hpa> {
        self.with_root(|root| {
            let Entry::Inner { table: level1, .. } = &root[0] else {
                return Err(VmmError::InvalidConfiguration);
            };
            let pdpt_hva = provider.alloc_page(1).ok_or(VmmError::OutOfMemory)?;
            let pdpt_hpa = hmm.hva_to_hpa(pdpt_hva).ok_or(VmmError::OutOfMemory)?;
            let slots = pdpt_hva as *mut u64;
            for i in 0..4usize {
                let raw = match &level1[i] {
                    Entry::Absent { .. } => 0u64,
                    Entry::Leaf { target, .. } => {
                        // A 1 GiB leaf at this level has no PAE PDPTE analogue
                        // (PAE defines no 1 GiB page size); reject rather than
                        // silently losing the attribute/size information.
                        let _ = target;
                        return Err(VmmError::InvalidConfiguration);
                    }
                    Entry::Inner { table: pd, .. } => {
                        let pd_hpa = self.render(pd, 2, provider, hmm, &pt64_leaf, &pt64_inner)?;
                        pdpte_encode(pd_hpa)
                    }
                };
                unsafe { core::ptr::write_volatile(slots.add(i), raw) };
            }
            Ok(pdpt_hpa)
        })
    }
}

/// `level` is the tree level this leaf was collapsed at (`LEVELS - 1` = a
/// genuine 4 KiB PTE; anything shallower is a collapsed super-page and must
/// carry the PS bit or hardware will chase bits [51:12] as a subtable HPA.
fn pt64_leaf(target: u64, attrs: u32, level: usize) -> u64 {
    let a = PagingAttrs::from_bits_truncate(attrs);
    let mut e = target & !0xfff;
    e |= 1; // present
    if a.contains(PagingAttrs::WRITABLE) {
        e |= 1 << 1;
    }
    if a.contains(PagingAttrs::USER) {
        e |= 1 << 2;
    }
    if a.contains(PagingAttrs::GLOBAL) {
        e |= 1 << 8;
    }
    if !a.contains(PagingAttrs::EXEC) {
        e |= 1u64 << 63; // NX
    }
    let pat = pat_index(attrs);
    e |= ((pat as u64) & 0b11) << 3; // PWT/PCD from the low two PAT-index bits
    if level < LEVELS - 1 {
        e |= 1 << 7; // PS: this entry maps a super page directly
    }
    e
}

fn pt64_inner(hpa: Hpa) -> u64 {
    (hpa & !0xfff) | 1 | (1 << 1) | (1 << 2) // present, writable, user — enforcement lives at the leaf
}

fn pdpte_encode(pd_hpa: Hpa) -> u64 {
    (pd_hpa & !0xfff) | 1
}

fn ept_leaf(target: u64, attrs: u32, level: usize, hw_ve: bool) -> u64 {
    let a = EptAttrs::from_bits_truncate(attrs);
    let mut e = target & !0xfff;
    if a.contains(EptAttrs::READ) {
        e |= 1 << 0;
    }
    if a.contains(EptAttrs::WRITE) {
        e |= 1 << 1;
    }
    if a.contains(EptAttrs::EXEC) {
        e |= 1 << 2;
    }
    e |= (ept_memtype(attrs) as u64) << 3;
    if a.contains(EptAttrs::IGNORE_PAT) {
        e |= 1 << 6;
    }
    if level < LEVELS - 1 {
        e |= 1 << 7; // PS: this EPTE maps a 2 MiB/1 GiB super page directly
    }
    if hw_ve && a.contains(EptAttrs::SUPPRESS_VE) {
        e |= 1u64 << 63;
    }
    e
}

fn ept_inner(hpa: Hpa) -> u64 {
    (hpa & !0xfff) | 0b111 // R/W/X at the directory level; leaves enforce the real policy
}

fn iommu_leaf(target: u64, attrs: u32, level: usize) -> u64 {
    let a = IommuAttrs::from_bits_truncate(attrs);
    let mut e = target & !0xfff;
    if a.contains(IommuAttrs::READ) {
        e |= 1 << 0;
    }
    if a.contains(IommuAttrs::WRITE) {
        e |= 1 << 1;
    }
    if a.contains(IommuAttrs::SNOOP) {
        e |= 1 << 11;
    }
    if level < LEVELS - 1 {
        e |= 1 << 7; // PS: second-level super page
    }
    e
}

fn iommu_inner(hpa: Hpa) -> u64 {
    (hpa & !0xfff) | 0b11
}
