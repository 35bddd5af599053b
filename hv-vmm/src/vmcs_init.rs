//! VMCS capability discovery: read the IA32 VMX MSRs once per boot CPU and
//! derive the fixed-0/fixed-1 masks every control write is clamped through.

use hv_hal::msr::{self, AllowedBits, VmxBasic};

/// Preference order the EPT engine walks when selecting a memory type.
pub const EPT_MEMTYPE_PREFERENCE: [u8; 5] = [6, 7, 4, 1, 0]; // WB, WP, WT, WC, UC

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptVpidCap: u64 {
        const EXEC_ONLY = 1 << 0;
        const GAW_21 = 1 << 6;
        const GAW_30 = 1 << 7;
        const GAW_39 = 1 << 8;
        const GAW_48 = 1 << 9;
        const WB_MEMTYPE = 1 << 14;
        const SP_2M = 1 << 16;
        const SP_1G = 1 << 17;
        const INVEPT = 1 << 20;
        const AD_BITS = 1 << 21;
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        const INVEPT_ALL_CONTEXTS = 1 << 26;
        const INVVPID = 1 << 32;
        const INVVPID_INDIVIDUAL_ADDRESS = 1 << 40;
        const INVVPID_SINGLE_CONTEXT = 1 << 41;
        const INVVPID_ALL_CONTEXTS = 1 << 42;
        const INVVPID_SINGLE_CONTEXT_RETAIN_GLOBALS = 1 << 43;
    }
}

/// Per-host-CPU capability snapshot, read once at bring-up and shared
/// read-only thereafter (the underlying hardware does not change).
#[derive(Debug, Clone, Copy)]
pub struct VmxCapabilities {
    pub basic: VmxBasic,
    pub pinbased: AllowedBits,
    pub procbased: AllowedBits,
    pub procbased2: AllowedBits,
    pub exit_ctls: AllowedBits,
    pub entry_ctls: AllowedBits,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub ept_vpid_cap: EptVpidCap,
    pub vmfunc: u64,
    pub unrestricted_guest: bool,
}

impl VmxCapabilities {
    pub fn discover() -> Self {
        let basic = VmxBasic::read();
        let pin_msr = if basic.true_controls_supported { msr::IA32_VMX_TRUE_PINBASED_CTLS } else { msr::IA32_VMX_PINBASED_CTLS };
        let proc_msr = if basic.true_controls_supported { msr::IA32_VMX_TRUE_PROCBASED_CTLS } else { msr::IA32_VMX_PROCBASED_CTLS };
        let exit_msr = if basic.true_controls_supported { msr::IA32_VMX_TRUE_EXIT_CTLS } else { msr::IA32_VMX_EXIT_CTLS };
        let entry_msr = if basic.true_controls_supported { msr::IA32_VMX_TRUE_ENTRY_CTLS } else { msr::IA32_VMX_ENTRY_CTLS };

        let procbased = msr::read_allowed_bits(proc_msr);
        const ACTIVATE_SECONDARY_CONTROLS: u32 = 1 << 31;
        let procbased2 = if procbased.allowed1 & ACTIVATE_SECONDARY_CONTROLS != 0 {
            msr::read_allowed_bits(msr::IA32_VMX_PROCBASED_CTLS2)
        } else {
            AllowedBits { allowed0: 0, allowed1: 0 }
        };
        const UNRESTRICTED_GUEST: u32 = 1 << 7;
        let unrestricted_guest = procbased2.allowed1 & UNRESTRICTED_GUEST != 0;

        let mut cr0_fixed0 = hv_hal::cpu::rdmsr(msr::IA32_VMX_CR0_FIXED0);
        let cr0_fixed1 = hv_hal::cpu::rdmsr(msr::IA32_VMX_CR0_FIXED1);
        let cr4_fixed0 = hv_hal::cpu::rdmsr(msr::IA32_VMX_CR4_FIXED0);
        let cr4_fixed1 = hv_hal::cpu::rdmsr(msr::IA32_VMX_CR4_FIXED1);

        const CR0_PE: u64 = 1 << 0;
        const CR0_PG: u64 = 1 << 31;
        if unrestricted_guest {
            // PE and PG may legitimately be 0 in an unrestricted guest; stop
            // forcing them into the fixed-1 set so the guest may run with
            // either off.
            cr0_fixed0 &= !(CR0_PE | CR0_PG);
        }

        Self {
            basic,
            pinbased: msr::read_allowed_bits(pin_msr),
            procbased,
            procbased2,
            exit_ctls: msr::read_allowed_bits(exit_msr),
            entry_ctls: msr::read_allowed_bits(entry_msr),
            cr0_fixed0,
            cr0_fixed1,
            cr4_fixed0,
            cr4_fixed1,
            ept_vpid_cap: EptVpidCap::from_bits_truncate(hv_hal::cpu::rdmsr(msr::IA32_VMX_EPT_VPID_CAP)),
            vmfunc: hv_hal::cpu::rdmsr(msr::IA32_VMX_VMFUNC),
            unrestricted_guest,
        }
    }

    /// `(value & fixed1) | fixed0`, applied before any CR0 write to the VMCS.
    pub fn make_compliant_cr0(&self, value: u64) -> u64 {
        (value & self.cr0_fixed1) | self.cr0_fixed0
    }

    pub fn make_compliant_cr4(&self, value: u64) -> u64 {
        (value & self.cr4_fixed1) | self.cr4_fixed0
    }

    pub fn max_gaw_level(&self) -> u8 {
        if self.ept_vpid_cap.contains(EptVpidCap::GAW_48) {
            4
        } else if self.ept_vpid_cap.contains(EptVpidCap::GAW_39) {
            3
        } else if self.ept_vpid_cap.contains(EptVpidCap::GAW_30) {
            2
        } else {
            1
        }
    }

    pub fn preferred_ept_memtype(&self) -> u8 {
        if self.ept_vpid_cap.contains(EptVpidCap::WB_MEMTYPE) {
            6
        } else {
            0
        }
    }

    /// Superpage support bitmap, bit `i` set meaning a `2^(12+9*i)` byte page
    /// is representable as an EPT leaf (bit 0 — 4 KiB — is always set).
    pub fn ept_superpage_bitmap(&self) -> u8 {
        let mut bitmap = 0b0001;
        if self.ept_vpid_cap.contains(EptVpidCap::SP_2M) {
            bitmap |= 0b0010;
        }
        if self.ept_vpid_cap.contains(EptVpidCap::SP_1G) {
            bitmap |= 0b0100;
        }
        bitmap
    }

    /// INVEPT preference order: individual-address is not a real INVEPT
    /// mode (the instruction only supports single-context/all-contexts), so
    /// this returns the widest-to-narrowest of the two real modes,
    /// preferring single-context.
    pub fn invept_mode(&self) -> Option<u64> {
        if self.ept_vpid_cap.contains(EptVpidCap::INVEPT_SINGLE_CONTEXT) {
            Some(1)
        } else if self.ept_vpid_cap.contains(EptVpidCap::INVEPT_ALL_CONTEXTS) {
            Some(2)
        } else {
            None
        }
    }

    pub fn invvpid_mode(&self) -> Option<u64> {
        if self.ept_vpid_cap.contains(EptVpidCap::INVVPID_INDIVIDUAL_ADDRESS) {
            Some(1)
        } else if self.ept_vpid_cap.contains(EptVpidCap::INVVPID_SINGLE_CONTEXT) {
            Some(2)
        } else if self.ept_vpid_cap.contains(EptVpidCap::INVVPID_ALL_CONTEXTS) {
            Some(3)
        } else {
            None
        }
    }
}
