#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware abstraction layer for the VT-x guest execution engine: raw
//! control-register/MSR access, VMCS field encodings and instruction
//! wrappers, and the address-type/collaborator-trait vocabulary the engine
//! is written against.

pub mod cpu;
pub mod cycles;
pub mod memory;
pub mod msr;
pub mod vmcs;

pub use memory::{Gpa, Gva, Hpa, Hva, HmmFlags, HostMemoryManager, MemoryProvider};
pub use vmcs::{ActiveVmcs, EptpFlags, Vmcs, VmcsError, VmcsField};

/// Errors raised bringing up VMX on the current core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    VmxNotSupported,
    VmxDisabledByFirmware,
    EptNotSupported,
    UnrestrictedGuestNotSupported,
    VmxonFailed,
}

/// Check the feature-control MSR and CPUID for VMX availability, matching
/// the order the SDM's enabling procedure specifies: CPUID first, then
/// `IA32_FEATURE_CONTROL` lock/enable bits.
pub fn check_vmx_available() -> Result<(), HalError> {
    if !cpu::has_vmx() {
        return Err(HalError::VmxNotSupported);
    }
    let feature_control = cpu::rdmsr(msr::IA32_FEATURE_CONTROL);
    const LOCKED: u64 = 1 << 0;
    const VMX_OUTSIDE_SMX: u64 = 1 << 2;
    if feature_control & LOCKED != 0 && feature_control & VMX_OUTSIDE_SMX == 0 {
        return Err(HalError::VmxDisabledByFirmware);
    }
    Ok(())
}
