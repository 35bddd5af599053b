//! Raw control-register, MSR, and identification primitives.
//!
//! Everything here is a thin, `unsafe`-contained wrapper around a single
//! instruction. The engine built on top never emits inline `asm!` directly —
//! it only calls through this module.

use core::arch::asm;
use raw_cpuid::CpuId;
use x86_64::registers::control::{Cr4, Cr4Flags};

#[inline]
pub fn read_cr0() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr0", out(reg) v, options(nomem, nostack, preserves_flags)) };
    v
}

#[inline]
pub unsafe fn write_cr0(v: u64) {
    unsafe { asm!("mov cr0, {}", in(reg) v, options(nostack, preserves_flags)) };
}

#[inline]
pub fn read_cr3() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr3", out(reg) v, options(nomem, nostack, preserves_flags)) };
    v
}

#[inline]
pub unsafe fn write_cr3(v: u64) {
    unsafe { asm!("mov cr3, {}", in(reg) v, options(nostack, preserves_flags)) };
}

#[inline]
pub fn read_cr4() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr4", out(reg) v, options(nomem, nostack, preserves_flags)) };
    v
}

#[inline]
pub unsafe fn write_cr4(v: u64) {
    unsafe { asm!("mov cr4, {}", in(reg) v, options(nostack, preserves_flags)) };
}

#[inline]
pub fn read_cr8() -> u64 {
    let v: u64;
    unsafe { asm!("mov {}, cr8", out(reg) v, options(nomem, nostack, preserves_flags)) };
    v
}

#[inline]
pub unsafe fn write_cr8(v: u64) {
    unsafe { asm!("mov cr8, {}", in(reg) v, options(nostack, preserves_flags)) };
}

#[inline]
pub fn rdmsr(msr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    unsafe { asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nomem, nostack, preserves_flags)) };
    ((hi as u64) << 32) | lo as u64
}

#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    let lo = value as u32;
    let hi = (value >> 32) as u32;
    unsafe { asm!("wrmsr", in("ecx") msr, in("eax") lo, in("edx") hi, options(nostack, preserves_flags)) };
}

/// Local APIC id of the calling CPU, used as a stable host-CPU index.
#[inline]
pub fn apic_id() -> u32 {
    CpuId::new()
        .get_feature_info()
        .map(|f| f.initial_local_apic_id() as u32)
        .unwrap_or(0)
}

/// Whether the CPU advertises VMX support (`CPUID.1:ECX.VMX[bit 5]`).
#[inline]
pub fn has_vmx() -> bool {
    CpuId::new()
        .get_feature_info()
        .map(|f| f.has_vmx())
        .unwrap_or(false)
}

/// Set `CR4.VMXE`, the precondition `VMXON` checks before doing anything
/// else. Done through the typed `x86_64` crate rather than raw `asm!`,
/// matching how the wider codebase's x86_64 arch layer touches this same
/// bit.
#[inline]
pub unsafe fn enable_vmxe() {
    unsafe { Cr4::update(|flags| *flags |= Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) };
}

/// Clear `CR4.VMXE` after `VMXOFF`.
#[inline]
pub unsafe fn disable_vmxe() {
    unsafe { Cr4::update(|flags| *flags &= !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) };
}

/// Halt forever with interrupts disabled. The only terminal action the
/// engine ever takes on a fatal condition — preserved so a debugger attached
/// to the stalled core can still inspect state.
pub fn deadloop() -> ! {
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

macro_rules! dr_accessor {
    ($read:ident, $write:ident, $reg:literal) => {
        #[inline]
        pub fn $read() -> u64 {
            let v: u64;
            unsafe { asm!(concat!("mov {}, ", $reg), out(reg) v, options(nomem, nostack, preserves_flags)) };
            v
        }

        #[inline]
        pub unsafe fn $write(v: u64) {
            unsafe { asm!(concat!("mov ", $reg, ", {}"), in(reg) v, options(nostack, preserves_flags)) };
        }
    };
}

dr_accessor!(read_dr0, write_dr0, "dr0");
dr_accessor!(read_dr1, write_dr1, "dr1");
dr_accessor!(read_dr2, write_dr2, "dr2");
dr_accessor!(read_dr3, write_dr3, "dr3");
dr_accessor!(read_dr6, write_dr6, "dr6");

/// Save the legacy/SSE FP state of the current CPU into a 512-byte,
/// 16-byte-aligned buffer.
#[inline]
pub unsafe fn fxsave(area: &mut [u8; 512]) {
    unsafe { asm!("fxsave64 [{}]", in(reg) area.as_mut_ptr(), options(nostack)) };
}

/// Restore FP state previously captured by [`fxsave`].
#[inline]
pub unsafe fn fxrstor(area: &[u8; 512]) {
    unsafe { asm!("fxrstor64 [{}]", in(reg) area.as_ptr(), options(nostack)) };
}

#[inline]
pub unsafe fn invlpg(linear_addr: u64) {
    unsafe { asm!("invlpg [{}]", in(reg) linear_addr, options(nostack)) };
}

/// Flush and invalidate every cache line on the calling CPU. Used when
/// enforcing a guest's `CR0.CD = 1` request that the core declines to honor
/// in hardware.
#[inline]
pub unsafe fn wbinvd() {
    unsafe { asm!("wbinvd", options(nomem, nostack)) };
}
