//! EPT engine: the per-guest default EPT, each gcpu's active EPT root, the
//! tracked CR0/CR3/CR4/emulator/violation/misconfiguration events, and the
//! three-phase GPM-modification protocol that keeps every host CPU's INVEPT
//! state coherent across a structural GPM change.

use spin::Mutex;

use hv_hal::memory::{HostMemoryManager, Hpa, MemoryProvider};
use hv_hal::vmcs::ActiveVmcs;
use hv_hal::vmcs::{encode_eptp, invept, invvpid, VmcsField};

use crate::error::VmmResult;
use crate::event::GcpuEvent;
use crate::gcpu::GcpuId;
use crate::guest::Gpm;
use crate::ipc::{self, IpiTransport};
use crate::vmcs_init::VmxCapabilities;

const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;

/// How [`end_gpm_modification`] should reconcile hardware with the change
/// that happened while CPUs were stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpmChangeKind {
    /// Attribute/mapping change within the existing EPT root: every CPU's
    /// cached translations for this context are stale and must be flushed,
    /// but the root itself did not move.
    Update,
    /// The default EPT was rebuilt from scratch: every CPU must be handed
    /// the new EPTP before resuming.
    Recreate,
}

/// One guest's EPT state: the default root built from its GPM, and which
/// VPID tag INVVPID should target when flushing.
pub struct EptGuestState {
    default_eptp: Mutex<u64>,
    vpid: u16,
    lock_count: Mutex<(u32, u32)>, // (count, owner host cpu), NO_CPU sentinel = u32::MAX
}

const NO_CPU: u32 = u32::MAX;

impl EptGuestState {
    pub fn new(vpid: u16) -> Self {
        Self { default_eptp: Mutex::new(0), vpid, lock_count: Mutex::new((0, NO_CPU)) }
    }

    pub fn default_eptp(&self) -> u64 {
        *self.default_eptp.lock()
    }

    /// Render `gpm`'s GPA→HPA mapping into the default EPT.
    pub fn build_default_ept(&self, gpm: &Gpm, caps: &VmxCapabilities, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> VmmResult<()> {
        let root_hpa = gpm.mam().convert_to_ept(provider, hmm, false)?;
        let ad_bits = caps.ept_vpid_cap.bits() & (1 << 21) != 0;
        *self.default_eptp.lock() = encode_eptp(root_hpa, caps.max_gaw_level(), caps.preferred_ept_memtype(), ad_bits);
        Ok(())
    }

    /// Reentrant acquire: the same host CPU may re-enter without blocking.
    pub fn lock(&self, host_cpu: u32) {
        loop {
            let mut guard = self.lock_count.lock();
            if guard.1 == NO_CPU || guard.1 == host_cpu {
                guard.1 = host_cpu;
                guard.0 += 1;
                return;
            }
            drop(guard);
            core::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        let mut guard = self.lock_count.lock();
        guard.0 -= 1;
        if guard.0 == 0 {
            guard.1 = NO_CPU;
        }
    }
}

/// Per-gcpu active view: the EPT root a given gcpu is actually running
/// under, which may diverge from the guest's default root while FVS has
/// switched it to an alternate view, or while the emulator has EPT disabled
/// entirely.
pub struct EptActiveView {
    eptp: Mutex<Option<u64>>,
}

impl EptActiveView {
    pub fn new() -> Self {
        Self { eptp: Mutex::new(None) }
    }

    pub fn set(&self, eptp: Option<u64>) {
        *self.eptp.lock() = eptp;
    }

    pub fn get(&self) -> Option<u64> {
        *self.eptp.lock()
    }

    pub fn apply(&self, active: &mut ActiveVmcs) {
        if let Some(eptp) = self.get() {
            active.write(VmcsField::EPT_POINTER, eptp);
        }
    }
}

impl Default for EptActiveView {
    fn default() -> Self {
        Self::new()
    }
}

/// The `AFTER_GUEST_CR0_WRITE` handler: enables EPT (by restoring the
/// active view from `None`) the first time PG transitions 0→1 on a CPU
/// lacking Unrestricted Guest, and reinstates PDPTEs under PAE.
pub fn on_guest_cr0_write(
    active: &mut ActiveVmcs,
    active_view: &EptActiveView,
    guest: &EptGuestState,
    old_cr0: u64,
    new_cr0: u64,
    gpm: &Gpm,
    hmm: &dyn HostMemoryManager,
    host_cpu: u32,
) {
    if old_cr0 & CR0_PG == 0 && new_cr0 & CR0_PG != 0 {
        active_view.set(Some(guest.default_eptp()));
        active_view.apply(active);
        if active.read(VmcsField::GUEST_CR4) & CR4_PAE != 0 {
            reload_pdptrs(active, gpm, hmm, host_cpu);
        }
        propagate_lme_to_lma(active);
    }
}

/// `AFTER_GUEST_CR3_WRITE`: flush this guest's VPID tag and, under PAE with
/// paging enabled, reload PDPTEs from the new CR3.
pub fn on_guest_cr3_write(active: &mut ActiveVmcs, guest: &EptGuestState, gpm: &Gpm, hmm: &dyn HostMemoryManager, host_cpu: u32) {
    unsafe { let _ = invvpid(2, guest.vpid, 0); }
    if active.read(VmcsField::GUEST_CR0) & CR0_PG != 0 && active.read(VmcsField::GUEST_CR4) & CR4_PAE != 0 {
        reload_pdptrs(active, gpm, hmm, host_cpu);
    }
}

/// `AFTER_GUEST_CR4_WRITE`: PAE toggled while EPT is active requires a PDPTE
/// reload.
pub fn on_guest_cr4_write(active: &mut ActiveVmcs, active_view: &EptActiveView, old_cr4: u64, new_cr4: u64, gpm: &Gpm, hmm: &dyn HostMemoryManager, host_cpu: u32) {
    if active_view.get().is_some() && (old_cr4 ^ new_cr4) & CR4_PAE != 0 {
        reload_pdptrs(active, gpm, hmm, host_cpu);
    }
}

/// Read the four 8-byte PDPTEs out of the PAE PDPT `GUEST_CR3` (masked to
/// its 32-byte alignment) points at, and load them into the VMCS guest
/// PDPTR fields hardware consults directly under PAE paging. A translation
/// miss leaves the existing VMCS PDPTR values in place rather than faulting
/// here — the guest will fault on its own once it actually walks the
/// (now-stale) tables.
fn reload_pdptrs(active: &mut ActiveVmcs, gpm: &Gpm, hmm: &dyn HostMemoryManager, host_cpu: u32) {
    let cr3 = active.read(VmcsField::GUEST_CR3);
    let pdpt_gpa = cr3 & !0x1f;
    let Ok((pdpt_hpa, _)) = gpm.gpa_to_hpa(host_cpu, pdpt_gpa) else { return };
    let Some(pdpt_hva) = hmm.hpa_to_hva(pdpt_hpa) else { return };

    const PDPTR_FIELDS: [VmcsField; 4] = [VmcsField::GUEST_PDPTR0, VmcsField::GUEST_PDPTR1, VmcsField::GUEST_PDPTR2, VmcsField::GUEST_PDPTR3];
    for (i, field) in PDPTR_FIELDS.into_iter().enumerate() {
        let entry = unsafe { core::ptr::read_volatile((pdpt_hva as *const u64).wrapping_add(i)) };
        active.write(field, entry);
    }
}

fn propagate_lme_to_lma(active: &mut ActiveVmcs) {
    const EFER_LME: u64 = 1 << 8;
    const EFER_LMA: u64 = 1 << 10;
    let efer = active.read(VmcsField::GUEST_IA32_EFER);
    if efer & EFER_LME != 0 {
        active.write(VmcsField::GUEST_IA32_EFER, efer | EFER_LMA);
    }
}

/// `EMULATOR_AS_GUEST_ENTER`/`LEAVE`: EPT is disabled while the software
/// emulator is driving the guest and restored to the guest's default view on
/// leave. Returns the view that was active, for `on_emulator_leave` to
/// restore.
pub fn on_emulator_enter(active_view: &EptActiveView) -> Option<u64> {
    let saved = active_view.get();
    active_view.set(None);
    saved
}

pub fn on_emulator_leave(active_view: &EptActiveView, saved: Option<u64>) {
    active_view.set(saved);
}

/// `EPT_VIOLATION`: apply the NMI-unblocking heuristic before re-entry and
/// hand the qualification off to the typed event bus for further handlers
/// (e.g. #VE injection).
pub fn on_ept_violation(gcpu: GcpuId, active: &mut ActiveVmcs, gpa: u64, qualification: u64, idt_vectoring_valid: bool, nmi_unblocking: bool) {
    if !idt_vectoring_valid && nmi_unblocking {
        const BLOCKING_BY_NMI: u64 = 1 << 3;
        let interruptibility = active.read(VmcsField::GUEST_INTERRUPTIBILITY_INFO);
        active.write(VmcsField::GUEST_INTERRUPTIBILITY_INFO, interruptibility | BLOCKING_BY_NMI);
    }
    crate::event::dispatch(gcpu, &GcpuEvent::EptViolation { gpa, qualification, idt_vectoring_valid, nmi_unblocking });
}

/// `EPT_MISCONFIGURATION`: fatal.
pub fn on_ept_misconfiguration(gcpu: GcpuId, gpa: u64, eptp: u64) -> ! {
    crate::fatal!("ept misconfiguration gcpu={:?} gpa={:#x} eptp={:#x}", gcpu, gpa, eptp)
}

/// Phase 1 of the GPM-modification protocol: called on the local CPU before
/// any remote CPU is stopped.
pub fn begin_gpm_modification(guest: &EptGuestState, host_cpu: u32) {
    guest.lock(host_cpu);
}

/// Phase 3: `kind` selects whether to invalidate the existing context (the
/// root did not move) or to broadcast a freshly rendered root to every CPU
/// bound to this guest.
pub fn end_gpm_modification_before_resume(
    guest: &EptGuestState,
    kind: GpmChangeKind,
    new_root_hpa: Option<Hpa>,
    caps: &VmxCapabilities,
    bound_cpus: &[u32],
) {
    match kind {
        GpmChangeKind::Update => {
            if let Some(mode) = caps.invept_mode() {
                unsafe { let _ = invept(mode, guest.default_eptp()); }
            }
        }
        GpmChangeKind::Recreate => {
            if let Some(root) = new_root_hpa {
                let ad_bits = caps.ept_vpid_cap.bits() & (1 << 21) != 0;
                *guest.default_eptp.lock() = encode_eptp(root, caps.max_gaw_level(), caps.preferred_ept_memtype(), ad_bits);
            }
            if let Some(mode) = caps.invept_mode() {
                unsafe { let _ = invept(mode, guest.default_eptp()); }
            }
            let _ = bound_cpus;
        }
    }
}

/// Phase 4: releases the engine lock taken in [`begin_gpm_modification`].
pub fn end_gpm_modification_after_resume(guest: &EptGuestState) {
    guest.unlock();
}

/// Drive the full three-phase protocol end to end: stop every other CPU
/// bound to `guest_id`, reconcile hardware state, then release them. `f`
/// performs the actual structural mutation (e.g. rebuilding the GPM) while
/// CPUs are stopped and returns the new root HPA when `kind` is `Recreate`.
pub fn modify_gpm(
    guest: &EptGuestState,
    kind_and_mutate: impl FnOnce() -> (GpmChangeKind, Option<Hpa>),
    caps: &VmxCapabilities,
    transport: &dyn IpiTransport,
    caller_cpu: u32,
    bound_cpus: &[u32],
) {
    begin_gpm_modification(guest, caller_cpu);
    ipc::stop_all_cpus(transport, caller_cpu);
    let (kind, new_root) = kind_and_mutate();
    end_gpm_modification_before_resume(guest, kind, new_root, caps, bound_cpus);
    ipc::start_all_cpus();
    end_gpm_modification_after_resume(guest);
}

/// Registered once at boot against [`crate::event`]; fans fatal
/// `EPT_MISCONFIGURATION` reports out through [`on_ept_misconfiguration`].
pub fn register_handlers() {
    crate::event::register(crate::event::EventKind::EptMisconfiguration, |gcpu, event| {
        if let GcpuEvent::EptMisconfiguration { gpa, eptp } = event {
            on_ept_misconfiguration(gcpu, *gpa, *eptp);
        }
    });
}

