//! VMCS field encodings and the thin safe wrapper around `VMCLEAR`,
//! `VMPTRLD`, `VMREAD`, `VMWRITE`, `VMLAUNCH`/`VMRESUME`, and `INVEPT`/
//! `INVVPID`. The engine never issues these instructions directly — it goes
//! through `Vmcs`/`ActiveVmcs`.

use core::arch::asm;
use core::marker::PhantomData;

use crate::memory::Hpa;

/// Intel-defined VMCS field encodings.
#[repr(u32)]
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsField {
    VIRTUAL_PROCESSOR_ID = 0x0000,
    POSTED_INTR_NOTIFICATION = 0x0002,
    EPTP_INDEX = 0x0004,

    GUEST_ES_SELECTOR = 0x0800,
    GUEST_CS_SELECTOR = 0x0802,
    GUEST_SS_SELECTOR = 0x0804,
    GUEST_DS_SELECTOR = 0x0806,
    GUEST_FS_SELECTOR = 0x0808,
    GUEST_GS_SELECTOR = 0x080A,
    GUEST_LDTR_SELECTOR = 0x080C,
    GUEST_TR_SELECTOR = 0x080E,
    GUEST_INTR_STATUS = 0x0810,

    HOST_ES_SELECTOR = 0x0C00,
    HOST_CS_SELECTOR = 0x0C02,
    HOST_SS_SELECTOR = 0x0C04,
    HOST_DS_SELECTOR = 0x0C06,
    HOST_FS_SELECTOR = 0x0C08,
    HOST_GS_SELECTOR = 0x0C0A,
    HOST_TR_SELECTOR = 0x0C0C,

    IO_BITMAP_A = 0x2000,
    IO_BITMAP_B = 0x2002,
    MSR_BITMAP = 0x2004,
    VM_EXIT_MSR_STORE_ADDR = 0x2006,
    VM_EXIT_MSR_LOAD_ADDR = 0x2008,
    VM_ENTRY_MSR_LOAD_ADDR = 0x200A,
    TSC_OFFSET = 0x2010,
    VIRTUAL_APIC_PAGE_ADDR = 0x2012,
    APIC_ACCESS_ADDR = 0x2014,
    VM_FUNCTION_CONTROL = 0x2018,
    EPT_POINTER = 0x201A,
    EOI_EXIT_BITMAP0 = 0x201C,
    EPTP_LIST_ADDRESS = 0x2024,
    VE_INFO_ADDRESS = 0x202A,
    XSS_EXIT_BITMAP = 0x202C,

    GUEST_PHYS_ADDR = 0x2400,

    VMCS_LINK_POINTER = 0x2800,
    GUEST_IA32_DEBUGCTL = 0x2802,
    GUEST_IA32_PAT = 0x2804,
    GUEST_IA32_EFER = 0x2806,
    GUEST_PDPTR0 = 0x280A,
    GUEST_PDPTR1 = 0x280C,
    GUEST_PDPTR2 = 0x280E,
    GUEST_PDPTR3 = 0x2810,

    HOST_IA32_PAT = 0x2C00,
    HOST_IA32_EFER = 0x2C02,

    PIN_BASED_VM_EXEC_CONTROL = 0x4000,
    CPU_BASED_VM_EXEC_CONTROL = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERROR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERROR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400A,
    VM_EXIT_CONTROLS = 0x400C,
    VM_EXIT_MSR_STORE_COUNT = 0x400E,
    VM_EXIT_MSR_LOAD_COUNT = 0x4010,
    VM_ENTRY_CONTROLS = 0x4012,
    VM_ENTRY_MSR_LOAD_COUNT = 0x4014,
    VM_ENTRY_INTR_INFO_FIELD = 0x4016,
    VM_ENTRY_EXCEPTION_ERROR_CODE = 0x4018,
    VM_ENTRY_INSTRUCTION_LEN = 0x401A,
    SECONDARY_VM_EXEC_CONTROL = 0x401E,

    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VM_EXIT_INTR_INFO = 0x4404,
    VM_EXIT_INTR_ERROR_CODE = 0x4406,
    IDT_VECTORING_INFO_FIELD = 0x4408,
    IDT_VECTORING_ERROR_CODE = 0x440A,
    VM_EXIT_INSTRUCTION_LEN = 0x440C,
    VMX_INSTRUCTION_INFO = 0x440E,

    GUEST_ES_LIMIT = 0x4800,
    GUEST_CS_LIMIT = 0x4802,
    GUEST_SS_LIMIT = 0x4804,
    GUEST_DS_LIMIT = 0x4806,
    GUEST_FS_LIMIT = 0x4808,
    GUEST_GS_LIMIT = 0x480A,
    GUEST_LDTR_LIMIT = 0x480C,
    GUEST_TR_LIMIT = 0x480E,
    GUEST_GDTR_LIMIT = 0x4810,
    GUEST_IDTR_LIMIT = 0x4812,
    GUEST_ES_AR_BYTES = 0x4814,
    GUEST_CS_AR_BYTES = 0x4816,
    GUEST_SS_AR_BYTES = 0x4818,
    GUEST_DS_AR_BYTES = 0x481A,
    GUEST_FS_AR_BYTES = 0x481C,
    GUEST_GS_AR_BYTES = 0x481E,
    GUEST_LDTR_AR_BYTES = 0x4820,
    GUEST_TR_AR_BYTES = 0x4822,
    GUEST_INTERRUPTIBILITY_INFO = 0x4824,
    GUEST_ACTIVITY_STATE = 0x4826,
    GUEST_IA32_SYSENTER_CS = 0x482A,
    VMX_PREEMPTION_TIMER_VALUE = 0x482E,

    HOST_IA32_SYSENTER_CS = 0x4C00,

    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,
    CR3_TARGET_VALUE0 = 0x6008,

    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDR = 0x640A,

    GUEST_CR0 = 0x6800,
    GUEST_CR3 = 0x6802,
    GUEST_CR4 = 0x6804,
    GUEST_ES_BASE = 0x6806,
    GUEST_CS_BASE = 0x6808,
    GUEST_SS_BASE = 0x680A,
    GUEST_DS_BASE = 0x680C,
    GUEST_FS_BASE = 0x680E,
    GUEST_GS_BASE = 0x6810,
    GUEST_LDTR_BASE = 0x6812,
    GUEST_TR_BASE = 0x6814,
    GUEST_GDTR_BASE = 0x6816,
    GUEST_IDTR_BASE = 0x6818,
    GUEST_DR7 = 0x681A,
    GUEST_RSP = 0x681C,
    GUEST_RIP = 0x681E,
    GUEST_RFLAGS = 0x6820,
    GUEST_PENDING_DBG_EXCEPTIONS = 0x6822,
    GUEST_IA32_SYSENTER_ESP = 0x6824,
    GUEST_IA32_SYSENTER_EIP = 0x6826,

    HOST_CR0 = 0x6C00,
    HOST_CR3 = 0x6C02,
    HOST_CR4 = 0x6C04,
    HOST_FS_BASE = 0x6C06,
    HOST_GS_BASE = 0x6C08,
    HOST_TR_BASE = 0x6C0A,
    HOST_GDTR_BASE = 0x6C0C,
    HOST_IDTR_BASE = 0x6C0E,
    HOST_IA32_SYSENTER_ESP = 0x6C10,
    HOST_IA32_SYSENTER_EIP = 0x6C12,
    HOST_RSP = 0x6C14,
    HOST_RIP = 0x6C16,
}

/// VMCS-related errors, distinguished by which VMX instruction's flags
/// (CF/ZF) reported the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsError {
    VmclearFailed,
    VmptrldFailed,
    VmlaunchFailed,
    VmresumeFailed,
    VmxonFailed,
    VmxoffFailed,
    InveptFailed,
    InvvpidFailed,
}

#[inline]
unsafe fn vmx_check(carry_or_zero_set: bool) -> Result<(), ()> {
    if carry_or_zero_set { Err(()) } else { Ok(()) }
}

#[inline]
unsafe fn vmclear_raw(phys: Hpa) -> Result<(), ()> {
    let cf_or_zf: u8;
    unsafe {
        asm!(
            "vmclear [{phys}]",
            "setna {r}",
            phys = in(reg) &phys,
            r = lateout(reg_byte) cf_or_zf,
            options(nostack),
        );
    }
    unsafe { vmx_check(cf_or_zf != 0) }
}

#[inline]
unsafe fn vmptrld_raw(phys: Hpa) -> Result<(), ()> {
    let cf_or_zf: u8;
    unsafe {
        asm!(
            "vmptrld [{phys}]",
            "setna {r}",
            phys = in(reg) &phys,
            r = lateout(reg_byte) cf_or_zf,
            options(nostack),
        );
    }
    unsafe { vmx_check(cf_or_zf != 0) }
}

/// Token proving a VMCS is the currently loaded one, handed out by
/// [`Vmcs::load`]. VMREAD/VMWRITE are only exposed through it.
pub struct ActiveVmcs<'a> {
    _phantom: PhantomData<&'a mut ()>,
}

impl<'a> ActiveVmcs<'a> {
    #[inline]
    pub fn read(&self, field: VmcsField) -> u64 {
        let value: u64;
        unsafe {
            asm!(
                "vmread {value}, {field:r}",
                field = in(reg) field as u64,
                value = lateout(reg) value,
                options(nostack, preserves_flags),
            );
        }
        value
    }

    #[inline]
    pub fn write(&mut self, field: VmcsField, value: u64) {
        unsafe {
            asm!(
                "vmwrite {value}, {field:r}",
                field = in(reg) field as u64,
                value = in(reg) value,
                options(nostack, preserves_flags),
            );
        }
    }

    /// `VMLAUNCH`. Only returns on failure (success transfers control to the
    /// guest and comes back out through the exit handler, not this call).
    pub unsafe fn launch(&mut self) -> VmcsError {
        let cf_or_zf: u8;
        unsafe {
            asm!("vmlaunch", "setna {r}", r = lateout(reg_byte) cf_or_zf, options(nostack));
        }
        debug_assert_ne!(cf_or_zf, 0);
        VmcsError::VmlaunchFailed
    }

    /// `VMRESUME`. Only returns on failure, same contract as [`launch`].
    pub unsafe fn resume(&mut self) -> VmcsError {
        let cf_or_zf: u8;
        unsafe {
            asm!("vmresume", "setna {r}", r = lateout(reg_byte) cf_or_zf, options(nostack));
        }
        debug_assert_ne!(cf_or_zf, 0);
        VmcsError::VmresumeFailed
    }
}

/// `VMXON`: enters VMX root operation on the calling core using the
/// already-formatted region at `phys` (revision id written into its first
/// four bytes by the caller).
#[inline]
pub unsafe fn vmxon(phys: Hpa) -> Result<(), VmcsError> {
    let cf_or_zf: u8;
    unsafe {
        asm!(
            "vmxon [{phys}]",
            "setna {r}",
            phys = in(reg) &phys,
            r = lateout(reg_byte) cf_or_zf,
            options(nostack),
        );
    }
    if cf_or_zf != 0 { Err(VmcsError::VmxonFailed) } else { Ok(()) }
}

/// `VMXOFF`: leaves VMX root operation on the calling core.
#[inline]
pub unsafe fn vmxoff() -> Result<(), VmcsError> {
    let cf_or_zf: u8;
    unsafe {
        asm!("vmxoff", "setna {r}", r = lateout(reg_byte) cf_or_zf, options(nostack));
    }
    if cf_or_zf != 0 { Err(VmcsError::VmxoffFailed) } else { Ok(()) }
}

/// Owner of a 4-KiB-aligned VMCS region in physical memory.
pub struct Vmcs {
    phys_addr: Hpa,
}

impl Vmcs {
    pub const fn new(phys: Hpa) -> Self {
        Self { phys_addr: phys }
    }

    pub fn clear(&self) -> Result<(), VmcsError> {
        unsafe { vmclear_raw(self.phys_addr) }.map_err(|_| VmcsError::VmclearFailed)
    }

    pub fn load(&self) -> Result<ActiveVmcs, VmcsError> {
        unsafe { vmptrld_raw(self.phys_addr) }.map_err(|_| VmcsError::VmptrldFailed)?;
        Ok(ActiveVmcs { _phantom: PhantomData })
    }

    pub fn phys_addr(&self) -> Hpa {
        self.phys_addr
    }
}

bitflags::bitflags! {
    /// EPTP bit 6: the only EPTP flag not derived from a capability value,
    /// since it is a plain on/off switch rather than an encoded field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptpFlags: u64 {
        const ENABLE_ACCESSED_DIRTY = 1 << 6;
    }
}

/// Build an EPTP value whose low 3 bits carry `memtype` (the capability
/// engine's preferred EPT memory type), bits [5:3] carry the page-walk
/// length minus one derived from `gaw_level` (1 = 21-bit GAW through 4 =
/// 48-bit GAW, per `(width - 21) / 9` — every real CPU only ever advertises
/// `gaw_level == 4`, but the field is still capability-derived rather than
/// hardwired), and whose top 40 bits are `pml4_hpa >> 12`.
pub fn encode_eptp(pml4_hpa: Hpa, gaw_level: u8, memtype: u8, enable_ad: bool) -> u64 {
    let walk_length_minus_one = (gaw_level.clamp(1, 4) - 1) as u64;
    let mut eptp = (pml4_hpa & !0xfff) | (memtype as u64 & 0b111) | (walk_length_minus_one << 3);
    if enable_ad {
        eptp |= EptpFlags::ENABLE_ACCESSED_DIRTY.bits();
    }
    eptp
}

/// `INVEPT` descriptor and wrapper. `type_` 1 = single-context, 2 = global.
pub unsafe fn invept(type_: u64, eptp: u64) -> Result<(), VmcsError> {
    #[repr(C, align(16))]
    struct Descriptor {
        eptp: u64,
        reserved: u64,
    }
    let desc = Descriptor { eptp, reserved: 0 };
    let cf_or_zf: u8;
    unsafe {
        asm!(
            "invept {ty}, [{desc}]",
            "setna {r}",
            ty = in(reg) type_,
            desc = in(reg) &desc,
            r = lateout(reg_byte) cf_or_zf,
            options(nostack),
        );
    }
    if cf_or_zf != 0 { Err(VmcsError::InveptFailed) } else { Ok(()) }
}

/// `INVVPID` descriptor and wrapper. `type_` 1 = individual-address,
/// 2 = single-context, 3 = all-contexts, 4 = single-context-retain-globals.
pub unsafe fn invvpid(type_: u64, vpid: u16, linear_addr: u64) -> Result<(), VmcsError> {
    #[repr(C, align(16))]
    struct Descriptor {
        vpid: u64,
        linear_addr: u64,
    }
    let desc = Descriptor { vpid: vpid as u64, linear_addr };
    let cf_or_zf: u8;
    unsafe {
        asm!(
            "invvpid {ty}, [{desc}]",
            "setna {r}",
            ty = in(reg) type_,
            desc = in(reg) &desc,
            r = lateout(reg_byte) cf_or_zf,
            options(nostack),
        );
    }
    if cf_or_zf != 0 { Err(VmcsError::InvvpidFailed) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_eptp_sets_memtype_and_four_level_walk() {
        let eptp = encode_eptp(0x1234_5000, 4, 6, false);
        assert_eq!(eptp & !0xfff, 0x1234_5000);
        assert_eq!(eptp & 0b111, 6);
        assert_eq!((eptp >> 3) & 0b111, 3);
        assert_eq!(eptp & EptpFlags::ENABLE_ACCESSED_DIRTY.bits(), 0);
    }

    #[test]
    fn encode_eptp_sets_accessed_dirty_only_when_requested() {
        let eptp = encode_eptp(0x1234_5000, 4, 6, true);
        assert_ne!(eptp & EptpFlags::ENABLE_ACCESSED_DIRTY.bits(), 0);
    }

    /// `(width - 21) / 9` for gaw_level 1..4 (widths 21, 30, 39, 48) yields
    /// 0..3, matching bits [5:3] — the spec's literal EPTP-format property.
    #[test]
    fn encode_eptp_walk_length_matches_the_gaw_width_formula() {
        for (gaw_level, width) in [(1u8, 21u32), (2, 30), (3, 39), (4, 48)] {
            let eptp = encode_eptp(0, gaw_level, 0, false);
            assert_eq!((eptp >> 3) & 0b111, ((width - 21) / 9) as u64);
        }
    }
}
