//! The mapper tree itself: insertion, lookup, permission updates, and
//! retraction/expansion, guarded by a single writer spinlock with
//! lock-free seqlock reads.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use hv_hal::memory::PAGE_SIZE;
use spin::Mutex;

use super::entry::*;
use crate::error::{VmmError, VmmResult};

const NO_CPU: u32 = u32::MAX;

/// A 4-level sparse radix tree mapping a 48-bit source address space to a
/// tagged target (host-physical for PT/EPT/IOMMU kinds) plus attributes, or
/// to a 31-bit "why this range is absent" reason.
///
/// Mutation is serialized by `writer_lock`. Readers never take it; they
/// instead use the `update_counter`/`update_on_cpu` seqlock pair to detect
/// and retry past a concurrent writer on another host CPU. A writer
/// observing its own in-progress update (same CPU) does not retry, since
/// from its own perspective the update is logically atomic.
pub struct Mam {
    root: UnsafeCell<alloc::boxed::Box<Table>>,
    writer_lock: Mutex<()>,
    update_counter: AtomicU32,
    update_on_cpu: AtomicU32,
    /// Bit `i` set means entries at tree level `i` (0 = top, covering 512
    /// GiB) may be stored as leaves rather than always descending to 4 KiB.
    /// The bottom level is always leaf-capable regardless of this mask.
    superpage_mask: u8,
}

unsafe impl Sync for Mam {}
unsafe impl Send for Mam {}

impl Mam {
    pub fn new() -> Self {
        Self {
            root: UnsafeCell::new(new_table()),
            writer_lock: Mutex::new(()),
            update_counter: AtomicU32::new(0),
            update_on_cpu: AtomicU32::new(NO_CPU),
            superpage_mask: 0b0111,
        }
    }

    pub fn with_superpage_mask(mask: u8) -> Self {
        let mut m = Self::new();
        m.superpage_mask = mask;
        m
    }

    fn can_be_leaf(&self, level: usize, size: u64, tgt: u64) -> bool {
        if level == LEVELS - 1 {
            return size == size_covered(level);
        }
        size == size_covered(level)
            && aligned_to(tgt, size_covered(level))
            && (self.superpage_mask & (1 << level)) != 0
    }

    fn begin_write(&self, cpu: u32) {
        self.update_on_cpu.store(cpu, Ordering::Relaxed);
        self.update_counter.fetch_add(1, Ordering::Release);
    }

    fn end_write(&self) {
        self.update_counter.fetch_add(1, Ordering::Release);
        self.update_on_cpu.store(NO_CPU, Ordering::Relaxed);
    }

    fn check_range(src: u64, size: u64) -> VmmResult<()> {
        if !aligned_to(src, PAGE_SIZE) || !aligned_to(size, PAGE_SIZE) || size == 0 {
            return Err(VmmError::InvalidConfiguration);
        }
        match src.checked_add(size) {
            Some(end) if end <= 1u64 << 48 => Ok(()),
            _ => Err(VmmError::InvalidConfiguration),
        }
    }

    /// Map `[src, src+size)` to `[tgt, tgt+size)` with `attrs`, overwriting
    /// any prior mapping. On `OutOfMemory` (unreachable in this in-memory
    /// tree, since subtables come from the global allocator rather than a
    /// bounded page pool, but preserved for interface fidelity) the tree may
    /// be left partially mutated; the caller is expected to destroy and
    /// retry at a higher level.
    pub fn insert_range(&self, cpu: u32, kind: EntryKind, src: u64, tgt: u64, size: u64, attrs: u32) -> VmmResult<()> {
        Self::check_range(src, size)?;
        if !aligned_to(tgt, PAGE_SIZE) {
            return Err(VmmError::InvalidConfiguration);
        }
        let _guard = self.writer_lock.lock();
        self.begin_write(cpu);
        let root = unsafe { &mut *self.root.get() };
        let result = self.insert_rec(root, 0, 0, kind, src, tgt, src + size, attrs);
        if result.is_ok() {
            Self::try_collapse(0, root);
        }
        self.end_write();
        result
    }

    fn insert_rec(
        &self,
        table: &mut Table,
        level: usize,
        table_base: u64,
        kind: EntryKind,
        start: u64,
        tgt_start: u64,
        end: u64,
        attrs: u32,
    ) -> VmmResult<()> {
        let mut idx = index_for_level(start, level);
        let mut cur = start;
        while cur < end {
            let entry_base = table_base + (idx as u64) * size_covered(level);
            let entry_end = entry_base + size_covered(level);
            let seg_start = cur.max(entry_base);
            let seg_end = end.min(entry_end);
            let seg_tgt = tgt_start + (seg_start - start);

            if seg_start == entry_base && seg_end == entry_end && self.can_be_leaf(level, seg_end - seg_start, seg_tgt) {
                table[idx] = Entry::Leaf { kind, target: seg_tgt, attrs };
            } else {
                let subtable = Self::descend(&mut table[idx], kind, level)?;
                self.insert_rec(subtable, level + 1, entry_base, kind, seg_start, seg_tgt, seg_end, attrs)?;
            }
            idx += 1;
            cur = entry_end;
        }
        Ok(())
    }

    /// Ensure `entry` is an `Inner` node of the given `kind`, expanding a
    /// leaf or absent marker into a freshly pushed-down subtable first.
    fn descend<'t>(entry: &'t mut Entry, kind: EntryKind, level: usize) -> VmmResult<&'t mut Table> {
        match entry {
            Entry::Inner { kind: k, .. } if *k != kind => return Err(VmmError::InvalidConfiguration),
            Entry::Inner { table, .. } => return Ok(table),
            _ => {}
        }
        let mut fresh = new_table();
        let stride = size_covered(level + 1);
        match entry {
            Entry::Leaf { kind: k, target, attrs } => {
                for (i, child) in fresh.iter_mut().enumerate() {
                    *child = Entry::Leaf { kind: *k, target: target + (i as u64) * stride, attrs: *attrs };
                }
            }
            Entry::Absent { reason } => {
                for child in fresh.iter_mut() {
                    *child = Entry::Absent { reason: *reason };
                }
            }
            Entry::Inner { .. } => unreachable!("handled above"),
        }
        *entry = Entry::Inner { kind, table: fresh };
        match entry {
            Entry::Inner { table, .. } => Ok(table),
            _ => unreachable!(),
        }
    }

    /// Record `reason` (neither `SUCCESS` nor `UNKNOWN`) across `[src, src+size)`.
    pub fn insert_unmapped_range(&self, cpu: u32, src: u64, size: u64, reason: u32) -> VmmResult<()> {
        if reason == REASON_SUCCESS || reason == REASON_UNKNOWN {
            return Err(VmmError::InvalidConfiguration);
        }
        Self::check_range(src, size)?;
        let _guard = self.writer_lock.lock();
        self.begin_write(cpu);
        let root = unsafe { &mut *self.root.get() };
        let result = self.mark_absent_rec(root, 0, 0, src, src + size, reason);
        if result.is_ok() {
            Self::try_collapse(0, root);
        }
        self.end_write();
        result
    }

    fn mark_absent_rec(&self, table: &mut Table, level: usize, table_base: u64, start: u64, end: u64, reason: u32) -> VmmResult<()> {
        let mut idx = index_for_level(start, level);
        let mut cur = start;
        while cur < end {
            let entry_base = table_base + (idx as u64) * size_covered(level);
            let entry_end = entry_base + size_covered(level);
            let seg_start = cur.max(entry_base);
            let seg_end = end.min(entry_end);
            if seg_start == entry_base && seg_end == entry_end {
                table[idx] = Entry::Absent { reason };
            } else {
                let kind = match &table[idx] {
                    Entry::Inner { kind, .. } => *kind,
                    Entry::Leaf { kind, .. } => *kind,
                    Entry::Absent { .. } => EntryKind::Internal,
                };
                let subtable = Self::descend(&mut table[idx], kind, level)?;
                self.mark_absent_rec(subtable, level + 1, entry_base, seg_start, seg_end, reason)?;
            }
            idx += 1;
            cur = entry_end;
        }
        Ok(())
    }

    /// Single-address lookup, tolerant of a concurrent writer on another
    /// host CPU via the seqlock discipline described on [`Mam`].
    pub fn get_mapping(&self, reader_cpu: u32, addr: u64) -> Result<(u64, u32), u32> {
        loop {
            let before = self.update_counter.load(Ordering::Acquire);
            let writer_cpu = self.update_on_cpu.load(Ordering::Relaxed);
            let self_observed = before & 1 != 0 && writer_cpu == reader_cpu;
            if before & 1 != 0 && !self_observed {
                core::hint::spin_loop();
                continue;
            }
            let root = unsafe { &*self.root.get() };
            let result = Self::lookup(root, 0, 0, addr);
            let after = self.update_counter.load(Ordering::Acquire);
            if self_observed || after == before {
                return result;
            }
        }
    }

    fn lookup(table: &Table, level: usize, table_base: u64, addr: u64) -> Result<(u64, u32), u32> {
        let idx = index_for_level(addr, level);
        let entry_base = table_base + (idx as u64) * size_covered(level);
        match &table[idx] {
            Entry::Absent { reason } => Err(*reason),
            Entry::Leaf { target, attrs, .. } => Ok((*target + (addr - entry_base), *attrs)),
            Entry::Inner { table: sub, .. } => Self::lookup(sub, level + 1, entry_base, addr),
        }
    }

    /// Shared body of `add_permissions`/`remove_permissions`/`overwrite_permissions`:
    /// walks `[src, src+size)`, expanding leaves as necessary to land exactly
    /// on the requested range, applying `op` to each leaf's attribute bag.
    fn update_permissions(&self, cpu: u32, src: u64, size: u64, op: &dyn Fn(u32) -> u32) -> VmmResult<()> {
        Self::check_range(src, size)?;
        let _guard = self.writer_lock.lock();
        self.begin_write(cpu);
        let root = unsafe { &mut *self.root.get() };
        let result = self.update_attrs_rec(root, 0, 0, src, src + size, op);
        if result.is_ok() {
            Self::try_collapse(0, root);
        }
        self.end_write();
        result
    }

    fn update_attrs_rec(&self, table: &mut Table, level: usize, table_base: u64, start: u64, end: u64, op: &dyn Fn(u32) -> u32) -> VmmResult<()> {
        let mut idx = index_for_level(start, level);
        let mut cur = start;
        while cur < end {
            let entry_base = table_base + (idx as u64) * size_covered(level);
            let entry_end = entry_base + size_covered(level);
            let seg_start = cur.max(entry_base);
            let seg_end = end.min(entry_end);
            match &mut table[idx] {
                Entry::Absent { .. } => return Err(VmmError::UnmappedRange),
                Entry::Leaf { attrs, .. } if seg_start == entry_base && seg_end == entry_end => {
                    *attrs = op(*attrs);
                }
                Entry::Leaf { kind, .. } => {
                    let kind = *kind;
                    let subtable = Self::descend(&mut table[idx], kind, level)?;
                    self.update_attrs_rec(subtable, level + 1, entry_base, seg_start, seg_end, op)?;
                }
                Entry::Inner { table: sub, .. } => {
                    self.update_attrs_rec(sub, level + 1, entry_base, seg_start, seg_end, op)?;
                }
            }
            idx += 1;
            cur = entry_end;
        }
        Ok(())
    }

    pub fn add_permissions(&self, cpu: u32, src: u64, size: u64, bits: u32) -> VmmResult<()> {
        self.update_permissions(cpu, src, size, &move |a| a | bits)
    }

    pub fn remove_permissions(&self, cpu: u32, src: u64, size: u64, bits: u32) -> VmmResult<()> {
        self.update_permissions(cpu, src, size, &move |a| a & !bits)
    }

    pub fn overwrite_permissions(&self, cpu: u32, src: u64, size: u64, bits: u32) -> VmmResult<()> {
        self.update_permissions(cpu, src, size, &move |_| bits)
    }

    /// Attempts to collapse every subtree of `table` bottom-up: an inner
    /// entry whose 512 children are all present leaves with identical kind
    /// and attributes and sequentially increasing targets (stride = child
    /// coverage), or all absent with the same reason, becomes a leaf itself
    /// and its child table is dropped.
    fn try_collapse(level: usize, table: &mut Table) {
        for entry in table.iter_mut() {
            if let Entry::Inner { kind, table: sub } = entry {
                let kind = *kind;
                if let Some(collapsed) = Self::collapse_one(level + 1, sub, kind) {
                    *entry = collapsed;
                }
            }
        }
    }

    fn collapse_one(level: usize, table: &mut Table, kind: EntryKind) -> Option<Entry> {
        Self::try_collapse(level, table);

        if let Entry::Absent { reason: r0 } = &table[0] {
            let r0 = *r0;
            if table.iter().all(|e| matches!(e, Entry::Absent { reason } if *reason == r0)) {
                return Some(Entry::Absent { reason: r0 });
            }
            return None;
        }

        if let Entry::Leaf { kind: k0, target: t0, attrs: a0 } = &table[0] {
            let (k0, t0, a0) = (*k0, *t0, *a0);
            let stride = size_covered(level);
            let sequential = table.iter().enumerate().all(|(i, e)| {
                matches!(e, Entry::Leaf { kind, target, attrs }
                    if *kind == k0 && *attrs == a0 && *target == t0 + (i as u64) * stride)
            });
            if sequential {
                return Some(Entry::Leaf { kind, target: t0, attrs: a0 });
            }
        }
        None
    }

    /// Visit maximal runs of identical mapping, used by the EPT renderer
    /// and diagnostics. `visitor` receives `(src, size, target, attrs)` for
    /// present ranges only; absent ranges are skipped.
    pub fn iterate_ranges(&self, mut visitor: impl FnMut(u64, u64, u64, u32)) {
        let root = unsafe { &*self.root.get() };
        Self::walk_ranges(root, 0, 0, &mut visitor);
    }

    fn walk_ranges(table: &Table, level: usize, table_base: u64, visitor: &mut impl FnMut(u64, u64, u64, u32)) {
        for (idx, entry) in table.iter().enumerate() {
            let entry_base = table_base + (idx as u64) * size_covered(level);
            match entry {
                Entry::Absent { .. } => {}
                Entry::Leaf { target, attrs, .. } => visitor(entry_base, size_covered(level), *target, *attrs),
                Entry::Inner { table: sub, .. } => Self::walk_ranges(sub, level + 1, entry_base, visitor),
            }
        }
    }
}

impl Default for Mam {
    fn default() -> Self {
        Self::new()
    }
}

impl Mam {
    /// Take the writer lock for the duration of a conversion. Conversions
    /// only read the tree, but must exclude concurrent mutation — unlike
    /// `get_mapping`, they are not on any hot path, so there is no reason to
    /// pay for seqlock-retry complexity here.
    pub(super) fn lock_for_render(&self) -> spin::MutexGuard<'_, ()> {
        self.writer_lock.lock()
    }

    pub(super) fn root_ptr(&self) -> *mut Table {
        self.root.get()
    }
}
