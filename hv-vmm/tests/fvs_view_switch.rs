//! Fast View Switch entry-list management: `add_entry` is the only way to
//! populate a previously-empty slot, `update_entry` never creates one, and
//! `delete_entry` clears back to empty. Exercised through `FvsDescriptor`
//! rather than `EptpList` directly since the descriptor is what the rest of
//! the engine actually holds per guest.

extern crate std;

mod common;

use hv_vmm::fvs::FvsDescriptor;

#[test]
fn add_then_lookup_round_trips() {
    let provider = common::DummyProvider::new();
    let hmm = common::DummyHmm;
    let descriptor = FvsDescriptor::new();
    descriptor.ensure_list(0, &provider, &hmm).unwrap();

    descriptor.add_entry_to_eptp_list(0, 3, 0x1234_5000).unwrap();
    assert_eq!(descriptor.lookup(0, 3), Some(0x1234_5000));
}

#[test]
fn update_requires_an_existing_entry() {
    let provider = common::DummyProvider::new();
    let hmm = common::DummyHmm;
    let descriptor = FvsDescriptor::new();
    descriptor.ensure_list(0, &provider, &hmm).unwrap();

    assert!(descriptor.update_entry_in_list(0, 5, 0xface_0000).is_err());

    descriptor.add_entry_to_eptp_list(0, 5, 0x1000).unwrap();
    descriptor.update_entry_in_list(0, 5, 0x2000).unwrap();
    assert_eq!(descriptor.lookup(0, 5), Some(0x2000));
}

#[test]
fn delete_clears_the_slot() {
    let provider = common::DummyProvider::new();
    let hmm = common::DummyHmm;
    let descriptor = FvsDescriptor::new();
    descriptor.ensure_list(0, &provider, &hmm).unwrap();

    descriptor.add_entry_to_eptp_list(0, 7, 0x9000).unwrap();
    descriptor.delete_entry(0, 7).unwrap();
    assert_eq!(descriptor.lookup(0, 7), None);
    // A deleted slot is empty again, so update must reject it too.
    assert!(descriptor.update_entry_in_list(0, 7, 0xa000).is_err());
}

#[test]
fn operations_on_an_unknown_host_cpu_fail() {
    let descriptor = FvsDescriptor::new();
    assert!(descriptor.add_entry_to_eptp_list(9, 0, 0x1000).is_err());
    assert_eq!(descriptor.list_hpa(9), None);
    assert!(!descriptor.is_enabled());
}

#[test]
fn lists_are_independent_per_host_cpu() {
    let provider = common::DummyProvider::new();
    let hmm = common::DummyHmm;
    let descriptor = FvsDescriptor::new();
    descriptor.ensure_list(0, &provider, &hmm).unwrap();
    descriptor.ensure_list(1, &provider, &hmm).unwrap();

    descriptor.add_entry_to_eptp_list(0, 0, 0x1000).unwrap();
    assert_eq!(descriptor.lookup(1, 0), None);
    assert_ne!(descriptor.list_hpa(0), descriptor.list_hpa(1));
}
