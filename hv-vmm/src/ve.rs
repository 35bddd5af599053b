//! Software #VE emulation: when hardware lacks virtualization-exception
//! support but a guest expects vector 20 on suppressible EPT violations, the
//! core populates the guest's #VE information page itself and injects the
//! vector directly, gated by every precondition #4.4 lists.

use hv_hal::memory::{Gpa, Hva};
use hv_hal::vmcs::{ActiveVmcs, VmcsField};

use crate::mam::EptAttrs;

pub const VE_VECTOR: u32 = 20;
const ACK_FLAG: u32 = 0xFFFF_FFFF;

/// Per-gcpu #VE descriptor: whether #VE is enabled for this gcpu and the
/// host-mapped address of its 32-byte information page.
#[derive(Debug, Clone, Copy)]
pub struct VeDescriptor {
    enabled: bool,
    info_page_hva: Option<Hva>,
}

impl VeDescriptor {
    pub const fn disabled() -> Self {
        Self { enabled: false, info_page_hva: None }
    }

    pub fn enable(&mut self, info_page_hva: Hva) {
        self.enabled = true;
        self.info_page_hva = Some(info_page_hva);
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.info_page_hva = None;
    }
}

impl Default for VeDescriptor {
    fn default() -> Self {
        Self::disabled()
    }
}

/// The guest-visible #VE information page layout: the SDM-defined fields
/// through `eptp_index`, plus the software-defined `flag` word the ISR
/// zeroes to accept the next #VE.
#[repr(C)]
#[derive(Clone, Copy)]
struct InfoPage {
    exit_reason: u32,
    _reserved: u32,
    exit_qualification: u64,
    gla: u64,
    gpa: u64,
    eptp_index: u16,
    _pad: [u8; 6],
    flag: u32,
}

const EPT_VIOLATION_EXIT_REASON: u32 = 48;

/// Whether an EPT-violation-triggered soft #VE may be injected: every
/// field below must hold before injection is permitted.
pub struct GateInputs {
    pub hardware_ve_supported: bool,
    pub guest_cr0_pe: bool,
    pub idt_vectoring_valid: bool,
    pub exception_bitmap_intercepts_ve: bool,
    pub ept_leaf_suppress_ve: bool,
}

pub fn should_inject(descriptor: &VeDescriptor, inputs: &GateInputs) -> bool {
    !inputs.hardware_ve_supported
        && descriptor.enabled
        && descriptor.info_page_hva.is_some()
        && !ack_flag_set(descriptor)
        && inputs.guest_cr0_pe
        && !inputs.idt_vectoring_valid
        && !inputs.exception_bitmap_intercepts_ve
        && !inputs.ept_leaf_suppress_ve
}

fn ack_flag_set(descriptor: &VeDescriptor) -> bool {
    match descriptor.info_page_hva {
        Some(hva) => unsafe { core::ptr::read_volatile(hva as *const InfoPage).flag != 0 },
        None => false,
    }
}

/// Populate the info page and inject vector 20 with no error code. The
/// guest's ISR is responsible for zeroing `flag` before returning.
pub fn inject(active: &mut ActiveVmcs, descriptor: &VeDescriptor, gla: Gpa, gpa: Gpa, exit_qualification: u64, eptp_index: u16) {
    let Some(hva) = descriptor.info_page_hva else { return };
    let page = InfoPage { exit_reason: EPT_VIOLATION_EXIT_REASON, _reserved: 0, exit_qualification, gla, gpa, eptp_index, _pad: [0; 6], flag: ACK_FLAG };
    unsafe { core::ptr::write_volatile(hva as *mut InfoPage, page) };

    const VALID_BIT: u32 = 1 << 31;
    const TYPE_HARDWARE_EXCEPTION: u32 = 3 << 8;
    let intr_info = VE_VECTOR | TYPE_HARDWARE_EXCEPTION | VALID_BIT;
    active.write(VmcsField::VM_ENTRY_INTR_INFO_FIELD, intr_info as u64);
    active.write(VmcsField::VM_ENTRY_EXCEPTION_ERROR_CODE, 0);
}

/// Whether the EPT leaf covering `attrs` suppresses #VE, consulted by the
/// caller when building [`GateInputs`].
pub fn leaf_suppresses_ve(attrs: EptAttrs) -> bool {
    attrs.contains(EptAttrs::SUPPRESS_VE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_gates_open() -> GateInputs {
        GateInputs {
            hardware_ve_supported: false,
            guest_cr0_pe: true,
            idt_vectoring_valid: false,
            exception_bitmap_intercepts_ve: false,
            ept_leaf_suppress_ve: false,
        }
    }

    #[test]
    fn disabled_descriptor_never_injects() {
        assert!(!should_inject(&VeDescriptor::disabled(), &all_gates_open()));
    }

    #[test]
    fn hardware_ve_support_disables_software_injection() {
        // hardware_ve_supported short-circuits before the ack-flag read, so
        // an unbacked hva is safe here.
        let mut descriptor = VeDescriptor::disabled();
        descriptor.enable(0x1000);
        let mut gates = all_gates_open();
        gates.hardware_ve_supported = true;
        assert!(!should_inject(&descriptor, &gates));
    }

    #[test]
    fn every_remaining_gate_individually_blocks_injection() {
        // These gates are checked after the ack-flag read, so the info page
        // must be real, zeroed memory.
        let mut info_page_buf = [0u8; 64];
        let mut descriptor = VeDescriptor::disabled();
        descriptor.enable(info_page_buf.as_mut_ptr() as u64);

        let mut gates = all_gates_open();
        gates.guest_cr0_pe = false;
        assert!(!should_inject(&descriptor, &gates));

        let mut gates = all_gates_open();
        gates.idt_vectoring_valid = true;
        assert!(!should_inject(&descriptor, &gates));

        let mut gates = all_gates_open();
        gates.exception_bitmap_intercepts_ve = true;
        assert!(!should_inject(&descriptor, &gates));

        let mut gates = all_gates_open();
        gates.ept_leaf_suppress_ve = true;
        assert!(!should_inject(&descriptor, &gates));
    }

    #[test]
    fn leaf_suppresses_ve_reads_the_attribute_bit() {
        assert!(leaf_suppresses_ve(EptAttrs::SUPPRESS_VE));
        assert!(!leaf_suppresses_ve(EptAttrs::READ));
    }
}
