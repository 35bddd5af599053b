//! Per-guest policy: an immutable, value-copied snapshot of the fields the
//! startup struct hands down that the rest of the engine consults on every
//! hot path (CR0 write handling, EPT enable, debug-port routing). Computed
//! once from [`crate::startup`] and never mutated afterward — a guest whose
//! policy needs to change is torn down and re-created, not patched in place.

use bitflags::bitflags;

bitflags! {
    /// Per-guest flags copied out of `mon_guest_startup_t::flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuestFlags: u32 {
        const REAL_BIOS_ACCESS = 1 << 0;
        const LAUNCH_IMMEDIATELY = 1 << 1;
        const IMAGE_COMPRESSED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPort {
    None,
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugVirtMode {
    None,
    Hide,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugIdent {
    Default,
    Io { base: u16 },
    PciIndex(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugParams {
    pub port: DebugPort,
    pub virt_mode: DebugVirtMode,
    pub ident: DebugIdent,
    pub verbosity: u8,
    pub bitmask: u32,
}

impl Default for DebugParams {
    fn default() -> Self {
        Self { port: DebugPort::None, virt_mode: DebugVirtMode::None, ident: DebugIdent::Default, verbosity: 0, bitmask: 0 }
    }
}

/// Cpu-affinity mask: `None` means "all CPUs", matching the startup struct's
/// `-1` sentinel; `Some(bitmap)` pins the guest's gcpus to the named host
/// CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAffinity {
    All,
    Mask(u64),
}

impl CpuAffinity {
    pub fn includes(&self, host_cpu: u32) -> bool {
        match self {
            CpuAffinity::All => true,
            CpuAffinity::Mask(bits) if host_cpu < 64 => bits & (1 << host_cpu) != 0,
            CpuAffinity::Mask(_) => false,
        }
    }
}

/// Immutable per-guest policy snapshot, held by [`crate::guest::Guest`] and
/// consulted by the EPT engine, the gcpu resume algorithm, and INT15h.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub flags: GuestFlags,
    pub affinity: CpuAffinity,
    pub post_os_launch: bool,
    /// Whether a guest setting `CR0.CD = 1` should be honored in hardware or
    /// forced back to 0 with the cache-disable intent virtualized instead.
    /// Most guests never set it; when one does without this flag, the
    /// request silently has no effect on the real cache state.
    pub virtualize_cache_disable: bool,
}

impl Policy {
    pub const fn new(flags: GuestFlags, affinity: CpuAffinity, post_os_launch: bool, virtualize_cache_disable: bool) -> Self {
        Self { flags, affinity, post_os_launch, virtualize_cache_disable }
    }
}
