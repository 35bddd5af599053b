//! Deep-copy parsing of the loader-provided startup structure
//! (`mon_startup_struct` in the original design) into heap-backed `Vec`/
//! `Box` values, so the loader's original pages can be reclaimed once
//! bring-up finishes. Every struct here is a value type; nothing borrows
//! from the loader's memory past [`StartupStruct::from_loader`].

use alloc::vec::Vec;

use hv_hal::memory::{Gpa, Hva};

use crate::e820::E820Entry;
use crate::error::{VmmError, VmmResult};
use crate::policy::{CpuAffinity, DebugIdent, DebugParams, DebugPort, DebugVirtMode, GuestFlags};

/// The only startup-struct version this build understands. Anything else
/// is fatal per spec: an unknown layout cannot be safely deep-copied.
pub const SUPPORTED_VERSION: u16 = 1;

/// The `{size, version}` prefix every versioned loader structure starts
/// with, read before anything else is trusted.
#[derive(Debug, Clone, Copy)]
pub struct VersionHeader {
    pub size: u32,
    pub version: u16,
}

impl VersionHeader {
    pub fn validate(self) -> VmmResult<()> {
        if self.version != SUPPORTED_VERSION {
            return Err(VmmError::InvalidConfiguration);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GpRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attributes: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Segments {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: Segment,
    pub idtr: Segment,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSpecificRegisters {
    pub debugctl: u64,
    pub efer: u64,
    pub pat: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub perf_global_ctrl: u64,
    pub smbase: u32,
    pub pending_exceptions: u32,
    pub interruptibility: u32,
    pub activity_state: u32,
}

/// Per-vCPU initial architectural state, deep-copied out of
/// `mon_guest_cpu_startup_state_t`. A guest CPU with no entry in the
/// array is left in Wait-for-SIPI.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestCpuStartupState {
    pub gp: GpRegisters,
    pub xmm: [u128; 16],
    pub seg: Segments,
    pub control: ControlRegisters,
    pub msr: ModelSpecificRegisters,
}

#[derive(Debug, Clone, Copy)]
pub struct GuestDevice {
    pub kind: u32,
    pub config: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    pub total_size: u32,
    pub image_size: u32,
    pub base_address: Hva,
    pub entry_point: Hva,
}

/// Deep-copied per-guest startup description. Owns everything the loader
/// originally provided by pointer.
#[derive(Debug, Clone)]
pub struct GuestStartup {
    pub flags: GuestFlags,
    pub magic: u32,
    pub affinity: CpuAffinity,
    pub cpu_states: Vec<Option<GuestCpuStartupState>>,
    pub devices: Vec<GuestDevice>,
    pub image: MemoryLayout,
    pub physical_memory_size: u64,
    pub load_gpa_offset: Gpa,
}

/// Deep-copied top-level startup struct. Constructed once from the
/// loader-handed pointer, after which none of the loader's pages are
/// referenced again.
#[derive(Debug, Clone)]
pub struct StartupStruct {
    pub number_of_host_cpus: u32,
    pub post_os_launch: bool,
    pub acpi_discovery_capable: bool,
    pub debug_params: DebugParams,
    pub mon_image: MemoryLayout,
    pub thunk_image: MemoryLayout,
    pub e820: Vec<E820Entry>,
    pub primary_guest: GuestStartup,
    pub secondary_guests: Vec<GuestStartup>,
    pub local_apic_ids: Vec<u32>,
    pub int15_handler_slot: Option<Hva>,
}

impl StartupStruct {
    /// Deep-copy every field reachable from `header`/`raw`, validating the
    /// version first. `raw` abstracts over the loader-provided pointer
    /// layout; production bring-up code supplies a reader backed by the
    /// actual loader memory, tests supply an in-memory fixture — both
    /// implement [`RawStartupReader`].
    pub fn from_loader(reader: &dyn RawStartupReader) -> VmmResult<Self> {
        reader.header().validate()?;
        reader.read()
    }
}

/// Everything [`StartupStruct::from_loader`] needs from the loader-owned
/// memory, factored out so bring-up code and tests can both drive the same
/// deep-copy logic without sharing a concrete pointer layout.
pub trait RawStartupReader {
    fn header(&self) -> VersionHeader;
    fn read(&self) -> VmmResult<StartupStruct>;
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self { total_size: 0, image_size: 0, base_address: 0, entry_point: 0 }
    }
}
