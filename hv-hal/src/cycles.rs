//! TSC access, used by the log ring buffer to timestamp entries.

use core::arch::asm;

#[inline]
pub fn rdtsc() -> u64 {
    let (lo, hi): (u32, u32);
    unsafe { asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack)) };
    ((hi as u64) << 32) | lo as u64
}

/// `RDTSCP`: like `rdtsc` but serializing with respect to prior instructions
/// and also returns `IA32_TSC_AUX` (typically the host-CPU index).
#[inline]
pub fn rdtscp() -> (u64, u32) {
    let (lo, hi, aux): (u32, u32, u32);
    unsafe { asm!("rdtscp", out("eax") lo, out("edx") hi, out("ecx") aux, options(nomem, nostack)) };
    (((hi as u64) << 32) | lo as u64, aux)
}
