//! INT 15h `AX=0xE820` handshake tests: the trapped `vmcall` must be
//! recognized only at the exact `CS:IP` the installed stub computes,
//! service successive calls in order with the right continuation value,
//! and signal failure (carry set, no other state touched) once a stale or
//! out-of-range `EBX` is presented.

extern crate std;

mod common;

use common::FlatGuestMemory;

use hv_vmm::e820::{E820Entry, E820Map, RangeType};
use hv_vmm::int15::{self, E820Emulation, GuestCallState, VmcallOutcome, SMAP_SIGNATURE};

fn sample_map() -> E820Map {
    E820Map::from_entries(std::vec![
        E820Entry { base: 0, length: 0x9_fc00, range_type: RangeType::Memory, ext_attributes: 1 },
        E820Entry { base: 0x10_0000, length: 0x0f00_0000, range_type: RangeType::Memory, ext_attributes: 1 },
        E820Entry { base: 0xfff0_0000, length: 0x10_0000, range_type: RangeType::Reserved, ext_attributes: 1 },
    ])
    .unwrap()
}

fn call_state(rbx: u64) -> GuestCallState {
    GuestCallState { rax: 0xE820, rbx, rcx: 20, rdx: SMAP_SIGNATURE as u64, rdi: 0x100, rflags: 0, es_selector: 0, ss_selector: 0, rsp: 0x1000 }
}

#[test]
fn wrong_cs_ip_is_not_ours() {
    let trap = int15::install(0x0000_1000, 0x0000_2000);
    let mem = FlatGuestMemory::new(0x10000);
    let map = sample_map();
    let mut emu = E820Emulation::default();

    let outcome = int15::handle_vmcall(&trap, 0xBEEF, 0, call_state(0), &mut emu, &map, &mem).unwrap();
    assert_eq!(outcome, VmcallOutcome::NotOurs);
}

#[test]
fn enumeration_advances_and_wraps_to_zero() {
    let trap = int15::install(0x0000_1000, 0x0000_2000);
    let mem = FlatGuestMemory::new(0x10000);
    let map = sample_map();
    let mut emu = E820Emulation::default();

    let cs = trap.trapped_segment() as u16;
    let rip = (trap.trapped_offset() + int15::VMCALL_OFFSET as u32) as u64;

    let mut ebx = 0u64;
    for expected_index in 0..map.len() as u64 {
        let outcome = int15::handle_vmcall(&trap, cs, rip, call_state(ebx), &mut emu, &map, &mem).unwrap();
        let VmcallOutcome::Handled(result) = outcome else { panic!("expected Handled") };
        assert_eq!(result.rax, SMAP_SIGNATURE as u64);
        assert_eq!(result.rflags & 1, 0, "carry must be clear on success");
        assert_eq!(result.rcx, 20);

        let expected_next = if expected_index + 1 >= map.len() as u64 { 0 } else { expected_index + 1 };
        assert_eq!(result.rbx, expected_next);
        ebx = result.rbx;
    }
    assert_eq!(ebx, 0, "enumeration must wrap back to zero after the last entry");
}

#[test]
fn stale_continuation_value_fails_with_carry() {
    let trap = int15::install(0x0000_1000, 0x0000_2000);
    let mem = FlatGuestMemory::new(0x10000);
    let map = sample_map();
    let mut emu = E820Emulation::default();

    let cs = trap.trapped_segment() as u16;
    let rip = (trap.trapped_offset() + int15::VMCALL_OFFSET as u32) as u64;

    // First call establishes a continuation of 1.
    int15::handle_vmcall(&trap, cs, rip, call_state(0), &mut emu, &map, &mem).unwrap();

    // A second call presenting EBX=2 instead of the expected 1 must fail.
    let outcome = int15::handle_vmcall(&trap, cs, rip, call_state(2), &mut emu, &map, &mem).unwrap();
    let VmcallOutcome::Handled(result) = outcome else { panic!("expected Handled") };
    assert_ne!(result.rflags & 1, 0, "carry must be set on a stale continuation value");
}

#[test]
fn out_of_range_index_fails_with_carry() {
    let trap = int15::install(0x0000_1000, 0x0000_2000);
    let mem = FlatGuestMemory::new(0x10000);
    let map = sample_map();
    let mut emu = E820Emulation::default();

    let cs = trap.trapped_segment() as u16;
    let rip = (trap.trapped_offset() + int15::VMCALL_OFFSET as u32) as u64;

    let outcome = int15::handle_vmcall(&trap, cs, rip, call_state(map.len() as u64), &mut emu, &map, &mem).unwrap();
    let VmcallOutcome::Handled(result) = outcome else { panic!("expected Handled") };
    assert_ne!(result.rflags & 1, 0);
}

#[test]
fn mismatched_signature_is_fatal() {
    let trap = int15::install(0x0000_1000, 0x0000_2000);
    let mem = FlatGuestMemory::new(0x10000);
    let map = sample_map();
    let mut emu = E820Emulation::default();

    let cs = trap.trapped_segment() as u16;
    let rip = (trap.trapped_offset() + int15::VMCALL_OFFSET as u32) as u64;
    let mut state = call_state(0);
    state.rdx = 0xdead_beef;

    assert!(int15::handle_vmcall(&trap, cs, rip, state, &mut emu, &map, &mem).is_err());
}

#[test]
fn first_entry_bytes_are_written_to_guest_buffer() {
    let trap = int15::install(0x0000_1000, 0x0000_2000);
    let mem = FlatGuestMemory::new(0x10000);
    let map = sample_map();
    let mut emu = E820Emulation::default();

    let cs = trap.trapped_segment() as u16;
    let rip = (trap.trapped_offset() + int15::VMCALL_OFFSET as u32) as u64;

    int15::handle_vmcall(&trap, cs, rip, call_state(0), &mut emu, &map, &mem).unwrap();

    let dest_hva = mem.linear_to_hva(0x100).unwrap();
    let base = unsafe { core::ptr::read_volatile(dest_hva as *const u64) };
    let length = unsafe { core::ptr::read_volatile((dest_hva + 8) as *const u64) };
    assert_eq!(base, 0);
    assert_eq!(length, 0x9_fc00);
}
