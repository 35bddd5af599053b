//! The guest entity: id, magic, cpu-affinity, policy snapshot, startup GPM,
//! event/MSR filter list, and the vCPUs it owns. Guests live in a flat,
//! arena-style registry addressed by a stable small integer id rather than
//! by pointer, avoiding a cyclic guest<->gcpu<->scheduler object graph.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use hv_hal::memory::{Gpa, Hpa};

use crate::e820::E820Map;
use crate::ept::EptGuestState;
use crate::error::{VmmError, VmmResult};
use crate::fvs::FvsDescriptor;
use crate::gcpu::GcpuId;
use crate::int15::{E820Emulation, Int15Trap};
use crate::mam::{EntryKind, EptAttrs, Mam};
use crate::policy::Policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestId(pub u16);

/// A guest's physical map: a [`Mam`] specialized to the `Ept` entry kind,
/// since every GPM this engine builds is eventually rendered with
/// `convert_to_ept`. MMIO ranges are recorded as unmapped ranges tagged
/// with a caller-defined reason rather than a mapping.
pub struct Gpm {
    mam: Mam,
}

/// Reason code recorded for GPA ranges that are intentionally unbacked by
/// host memory — routed to an emulated device rather than EPT.
pub const REASON_MMIO: u32 = 0x1;

impl Gpm {
    pub fn new() -> Self {
        Self { mam: Mam::new() }
    }

    /// As [`Gpm::new`], but restricts which levels may collapse into a
    /// superpage EPT leaf to `mask` (see [`Mam::with_superpage_mask`]) —
    /// the bootstrap path derives this from the running CPU's actual EPT
    /// superpage support rather than assuming 2 MiB/1 GiB are both available.
    pub fn with_superpage_mask(mask: u8) -> Self {
        Self { mam: Mam::with_superpage_mask(mask) }
    }

    pub fn mam(&self) -> &Mam {
        &self.mam
    }

    pub fn insert_range(&self, cpu: u32, gpa: Gpa, hpa: Hpa, size: u64, attrs: EptAttrs) -> VmmResult<()> {
        self.mam.insert_range(cpu, EntryKind::Ept, gpa, hpa, size, attrs.bits())
    }

    pub fn insert_mmio(&self, cpu: u32, gpa: Gpa, size: u64) -> VmmResult<()> {
        self.mam.insert_unmapped_range(cpu, gpa, size, REASON_MMIO)
    }

    pub fn remove_range(&self, cpu: u32, gpa: Gpa, size: u64, reason: u32) -> VmmResult<()> {
        self.mam.insert_unmapped_range(cpu, gpa, size, reason)
    }

    /// GPA -> (HPA, attrs); `Err(reason)` distinguishes unmapped from MMIO
    /// from any other caller-assigned reason code.
    pub fn gpa_to_hpa(&self, cpu: u32, gpa: Gpa) -> Result<(Hpa, EptAttrs), u32> {
        self.mam.get_mapping(cpu, gpa).map(|(hpa, attrs)| (hpa, EptAttrs::from_bits_truncate(attrs)))
    }
}

impl Default for Gpm {
    fn default() -> Self {
        Self::new()
    }
}

/// An MSR or event filter entry: a guest may intercept a given MSR's
/// read/write independent of the global MSR-handling table in
/// [`crate::gcpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrFilter {
    pub msr: u32,
    pub intercept_read: bool,
    pub intercept_write: bool,
}

/// INT15h E820 trap state, installed once at bring-up if the loader patched
/// a real-mode vector for this guest. Absent for a guest that never
/// requested the trap.
struct Int15State {
    trap: Int15Trap,
    map: E820Map,
    emu: E820Emulation,
}

pub struct Guest {
    id: GuestId,
    magic: u32,
    policy: Policy,
    /// Shared so a gcpu's `active_gpm` can hold its own reference without
    /// the guest outliving it or a copy being made.
    startup_gpm: Arc<Gpm>,
    msr_filters: RwLock<Vec<MsrFilter>>,
    gcpus: RwLock<Vec<GcpuId>>,
    /// This guest's default EPT root and VPID tag, looked up by the VM-exit
    /// dispatcher on every CR-access/EPT exit.
    ept: Arc<EptGuestState>,
    fvs: Arc<FvsDescriptor>,
    int15: Mutex<Option<Int15State>>,
}

impl Guest {
    pub fn id(&self) -> GuestId {
        self.id
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn startup_gpm(&self) -> &Arc<Gpm> {
        &self.startup_gpm
    }

    pub fn ept(&self) -> Arc<EptGuestState> {
        self.ept.clone()
    }

    pub fn fvs(&self) -> Arc<FvsDescriptor> {
        self.fvs.clone()
    }

    /// Record the INT15h trap this guest's loader installed, along with the
    /// E820 map it serves. Replaces any previously installed trap.
    pub fn install_int15(&self, trap: Int15Trap, map: E820Map) {
        *self.int15.lock() = Some(Int15State { trap, map, emu: E820Emulation::default() });
    }

    /// Run `f` against this guest's installed INT15h state, or with `None`
    /// when no trap was installed.
    pub fn with_int15<R>(&self, f: impl FnOnce(Option<(&Int15Trap, &E820Map, &mut E820Emulation)>) -> R) -> R {
        let mut guard = self.int15.lock();
        match guard.as_mut() {
            Some(state) => f(Some((&state.trap, &state.map, &mut state.emu))),
            None => f(None),
        }
    }

    pub fn add_gcpu(&self, id: GcpuId) {
        self.gcpus.write().push(id);
    }

    pub fn gcpus(&self) -> Vec<GcpuId> {
        self.gcpus.read().clone()
    }

    pub fn add_msr_filter(&self, filter: MsrFilter) {
        self.msr_filters.write().push(filter);
    }

    pub fn msr_filter(&self, msr: u32) -> Option<MsrFilter> {
        self.msr_filters.read().iter().copied().find(|f| f.msr == msr)
    }
}

struct Registry {
    guests: Vec<Guest>,
    next_id: u16,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry { guests: Vec::new(), next_id: 0 });

/// Allocate the next monotonically-increasing guest id without registering
/// a guest yet. Split out from [`guest_register`] so a caller that needs the
/// id to construct per-guest state first (e.g. `EptGuestState`'s VPID tag)
/// can do so before the guest exists in the registry.
pub fn reserve_guest_id() -> GuestId {
    let mut registry = REGISTRY.lock();
    let id = GuestId(registry.next_id);
    registry.next_id += 1;
    id
}

/// Register a guest under an id previously obtained from
/// [`reserve_guest_id`]. The id space is never reused: guests are created at
/// boot and live until shutdown — there is no guest-delete path.
pub fn guest_register(id: GuestId, magic: u32, policy: Policy, startup_gpm: Arc<Gpm>, ept: Arc<EptGuestState>) -> GuestId {
    let mut registry = REGISTRY.lock();
    registry.guests.push(Guest {
        id,
        magic,
        policy,
        startup_gpm,
        msr_filters: RwLock::new(Vec::new()),
        gcpus: RwLock::new(Vec::new()),
        ept,
        fvs: Arc::new(FvsDescriptor::new()),
        int15: Mutex::new(None),
    });
    id
}

/// Run `f` with the guest named by `id`, or `Err(InvalidId)` if it has
/// never been registered. Guests are never removed from the registry, so a
/// valid id remains valid for the lifetime of the process.
pub fn with_guest<R>(id: GuestId, f: impl FnOnce(&Guest) -> R) -> VmmResult<R> {
    let registry = REGISTRY.lock();
    registry.guests.iter().find(|g| g.id == id).map(f).ok_or(VmmError::InvalidId)
}

pub fn count() -> usize {
    REGISTRY.lock().guests.len()
}
