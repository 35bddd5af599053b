//! Property- and unit-level coverage of the memory-address mapper: range
//! insertion round-trips through `get_mapping`, unmapped ranges report their
//! reason instead of a mapping, permission edits compose, and a writer on
//! one host CPU never blocks a concurrent reader on another into observing
//! a torn entry.

extern crate std;

mod common;

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use hv_vmm::mam::{EntryKind, EptAttrs, Mam};

#[test]
fn round_trip_single_page() {
    let mam = Mam::new();
    mam.insert_range(0, EntryKind::Ept, 0x1000, 0x7000, 0x1000, EptAttrs::READ.bits()).unwrap();
    let (target, attrs) = mam.get_mapping(0, 0x1000).unwrap();
    assert_eq!(target, 0x7000);
    assert_eq!(EptAttrs::from_bits_truncate(attrs), EptAttrs::READ);
}

#[test]
fn unmapped_range_reports_reason() {
    let mam = Mam::new();
    const MMIO_REASON: u32 = 0x42;
    mam.insert_unmapped_range(0, 0x2000, 0x1000, MMIO_REASON).unwrap();
    assert_eq!(mam.get_mapping(0, 0x2000), Err(MMIO_REASON));
}

#[test]
fn lookup_outside_any_insert_is_unknown() {
    let mam = Mam::new();
    mam.insert_range(0, EntryKind::Ept, 0, 0x1000, 0x1000, EptAttrs::READ.bits()).unwrap();
    assert!(mam.get_mapping(0, 0x5000_0000).is_err());
}

#[test]
fn permissions_compose() {
    let mam = Mam::new();
    let attrs = (EptAttrs::READ | EptAttrs::WRITE).bits();
    mam.insert_range(0, EntryKind::Ept, 0, 0x1000, 0x1000, attrs).unwrap();
    mam.remove_permissions(0, 0, 0x1000, EptAttrs::WRITE.bits()).unwrap();
    let (_, attrs) = mam.get_mapping(0, 0).unwrap();
    assert_eq!(EptAttrs::from_bits_truncate(attrs), EptAttrs::READ);

    mam.add_permissions(0, 0, 0x1000, EptAttrs::EXEC.bits()).unwrap();
    let (_, attrs) = mam.get_mapping(0, 0).unwrap();
    assert_eq!(EptAttrs::from_bits_truncate(attrs), EptAttrs::READ | EptAttrs::EXEC);
}

#[test]
fn update_on_unmapped_range_fails() {
    let mam = Mam::new();
    mam.insert_unmapped_range(0, 0, 0x1000, 0x5).unwrap();
    assert!(mam.add_permissions(0, 0, 0x1000, EptAttrs::READ.bits()).is_err());
}

/// A reader spinning on an address under concurrent modification by a
/// different host CPU must always observe either the old or the new mapping,
/// never a half-written target/attrs pair.
#[test]
fn seqlock_reader_never_observes_a_torn_entry() {
    let mam = Arc::new(Mam::new());
    mam.insert_range(0, EntryKind::Ept, 0, 0x1000, 0x1000, EptAttrs::READ.bits()).unwrap();

    let writer_mam = mam.clone();
    let writer = thread::spawn(move || {
        for i in 0..2000u64 {
            let target = 0x1000 + (i % 2) * 0x1000;
            writer_mam.overwrite_permissions(1, 0, 0x1000, EptAttrs::READ.bits()).unwrap();
            writer_mam.insert_range(1, EntryKind::Ept, 0, target, 0x1000, EptAttrs::READ.bits()).unwrap();
        }
    });

    let reader_mam = mam.clone();
    let reader = thread::spawn(move || {
        for _ in 0..2000u64 {
            let (target, attrs) = reader_mam.get_mapping(0, 0).unwrap();
            assert!(target == 0x1000 || target == 0x2000, "torn target: {:#x}", target);
            assert_eq!(EptAttrs::from_bits_truncate(attrs), EptAttrs::READ);
        }
    });

    writer.join().unwrap();
    reader.join().unwrap();
}

proptest! {
    #[test]
    fn round_trip_holds_for_arbitrary_page_aligned_ranges(
        page in 0u64..256,
        npages in 1u64..16,
        target_page in 0u64..256,
    ) {
        let mam = Mam::new();
        let gpa = page * 0x1000;
        let size = npages * 0x1000;
        let target = target_page * 0x1000;
        mam.insert_range(0, EntryKind::Ept, gpa, target, size, EptAttrs::READ.bits()).unwrap();
        for i in 0..npages {
            let (got, attrs) = mam.get_mapping(0, gpa + i * 0x1000).unwrap();
            prop_assert_eq!(got, target + i * 0x1000);
            prop_assert_eq!(EptAttrs::from_bits_truncate(attrs), EptAttrs::READ);
        }
    }
}

#[test]
fn convert_to_ept_renders_present_leaf() {
    let provider = common::DummyProvider::new();
    let hmm = common::DummyHmm;
    let mam = Mam::new();
    mam.insert_range(0, EntryKind::Ept, 0, 0x3000, 0x1000, (EptAttrs::READ | EptAttrs::WRITE | EptAttrs::EXEC).bits()).unwrap();

    let pml4_hpa = mam.convert_to_ept(&provider, &hmm, false).unwrap();
    // DummyHmm's hpa_to_hva/hva_to_hpa are identity, so pml4_hpa is readable directly.
    let pml4 = pml4_hpa as *const u64;
    let pml4e = unsafe { core::ptr::read_volatile(pml4) };
    assert_ne!(pml4e, 0, "top-level entry for a populated 4K range must not be empty");
}

/// A 2 MiB-aligned, 2 MiB-sized range collapses to a single level-2 leaf;
/// the rendered EPTE for that leaf must carry the PS bit or hardware will
/// chase its physical-base bits as a subtable pointer instead of treating
/// it as a directly-mapped super page.
#[test]
fn convert_to_ept_sets_page_size_bit_for_a_collapsed_2mb_leaf() {
    const TWO_MIB: u64 = 0x20_0000;
    let provider = common::DummyProvider::new();
    let hmm = common::DummyHmm;
    let mam = Mam::new();
    let attrs = (EptAttrs::READ | EptAttrs::WRITE | EptAttrs::EXEC).bits();
    mam.insert_range(0, EntryKind::Ept, TWO_MIB, 0x1_000_000, TWO_MIB, attrs).unwrap();

    let pml4_hpa = mam.convert_to_ept(&provider, &hmm, false).unwrap();
    let read_entry = |table_hpa: u64, idx: usize| unsafe { core::ptr::read_volatile((table_hpa as *const u64).add(idx)) };

    // GPA 0x200000: level0 idx 0, level1 idx 0, level2 idx 1.
    let pdpt_hpa = read_entry(pml4_hpa, 0) & !0xfff;
    let pd_hpa = read_entry(pdpt_hpa, 0) & !0xfff;
    let epte = read_entry(pd_hpa, 1);

    assert_ne!(epte & 0x7, 0, "leaf must be present (R/W/X)");
    assert_ne!(epte & (1 << 7), 0, "collapsed super-page leaf must set the PS bit");
    assert_eq!(epte & !0xfff, 0x1_000_000, "physical base must survive encoding");
}
