//! Guest CPU engine: per-vCPU state not held in the VMCS, the layered
//! register accessors, the static MSR-routing table, the activity-state
//! machine, and the resume algorithm that reconciles all of it before every
//! `vmlaunch`/`vmresume`.

use bitflags::bitflags;
use spin::Mutex;

use hv_hal::cpu;
use hv_hal::memory::{HostMemoryManager, Hpa, MemoryProvider};
use hv_hal::msr;
use hv_hal::vmcs::{ActiveVmcs, VmcsError, VmcsField, Vmcs};

use crate::ept::EptActiveView;
use crate::error::{VmmError, VmmResult};
use crate::event::{self, ActivityState, GcpuEvent};
use crate::guest::{self, Gpm, GuestId};
use crate::ipc::{self, Destination, IpiTransport};
use crate::startup::GuestCpuStartupState;
use crate::ve::VeDescriptor;
use crate::vmcs_init::VmxCapabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcpuId {
    pub guest: GuestId,
    pub index: u16,
}

/// NATIVE runs guest code directly under hardware VT-x; EMULATOR is entered
/// when the guest is in real/unpaged mode and the host CPU lacks
/// Unrestricted Guest, so real-mode semantics must be software-emulated
/// instead of executed natively under VMX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcpuMode {
    Native,
    Emulator,
}

bitflags! {
    /// Mutually exclusive bits (`EMULATOR`/`FLAT_PT_32`/`FLAT_PT_64`) are
    /// enforced at resume, not by the type: the resume algorithm is the
    /// single place allowed to flip between them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const EMULATOR = 1 << 0;
        const FLAT_PT_32 = 1 << 1;
        const FLAT_PT_64 = 1 << 2;
        const ACTIVITY_STATE_CHANGED = 1 << 3;
        const IMPORTANT_EVENT_OCCURRED = 1 << 4;
        const EXCEPTION_RESOLUTION_REQUIRED = 1 << 5;
        const UNRESTRICTED_GUEST = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CachingFlags: u32 {
        const DEBUG_REGS_CACHED = 1 << 0;
        const DEBUG_REGS_MODIFIED = 1 << 1;
        const FX_STATE_CACHED = 1 << 2;
        const FX_STATE_MODIFIED = 1 << 3;
        /// Guest asked for `CR0.CD = 1` under a policy that virtualizes
        /// cache-disable rather than honoring it; cleared back out by
        /// [`Gcpu::reconcile_native_mode_policy`] once the guest clears CD.
        const CACHE_DISABLE_ENFORCED = 1 << 4;
    }
}

/// Everything a gcpu holds outside the VMCS: RSP/RIP/RFLAGS, segments,
/// GDTR/IDTR, DR7, activity state, interruptibility and pending-DBE all stay
/// in VMCS fields and are not duplicated here.
#[derive(Debug, Clone, Copy)]
pub struct SaveArea {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub xmm: [u128; 16],
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub fx: [u8; 512],
    pub cr2: u64,
    pub cr3_cache: u64,
    pub cr8: u64,
}

impl Default for SaveArea {
    fn default() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            xmm: [0; 16],
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            fx: [0; 512],
            cr2: 0,
            cr3_cache: 0,
            cr8: 0,
        }
    }
}

/// Identity-mapped page tables substituting for guest paging while in
/// `EMULATOR` mode or while running unpaged without Unrestricted Guest. Built
/// by rendering a throwaway identity-mapped [`crate::mam::Mam`] through the
/// same hardware-format converters the GPM uses for EPT.
struct FlatPageTables {
    root_hpa: Hpa,
    wide: bool,
}

impl FlatPageTables {
    fn build(phys_mem_size: u64, wide: bool, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> VmmResult<Self> {
        use crate::mam::{EntryKind, Mam, PagingAttrs};
        let identity = Mam::new();
        let attrs = (PagingAttrs::WRITABLE | PagingAttrs::EXEC).bits();
        identity.insert_range(0, EntryKind::Pt, 0, 0, phys_mem_size, attrs)?;
        let root_hpa = if wide { identity.convert_to_pt64(provider, hmm)? } else { identity.convert_to_pt32pae(provider, hmm)? };
        Ok(Self { root_hpa, wide })
    }
}

/// Static MSR-routing table entry: either the MSR has a direct VMCS guest
/// field, or it must go through the VM-entry MSR-load / VM-exit MSR-store
/// swap lists (not modeled further here; those lists are a loader/bring-up
/// concern, this table only records which MSRs require them).
#[derive(Debug, Clone, Copy)]
enum MsrRouting {
    DirectField(VmcsField),
    SwapList,
}

const MSR_TABLE: &[(u32, MsrRouting)] = &[
    (msr::IA32_EFER, MsrRouting::DirectField(VmcsField::GUEST_IA32_EFER)),
    (msr::IA32_PAT, MsrRouting::DirectField(VmcsField::GUEST_IA32_PAT)),
    (msr::IA32_SYSENTER_CS, MsrRouting::DirectField(VmcsField::GUEST_IA32_SYSENTER_CS)),
    (msr::IA32_SYSENTER_ESP, MsrRouting::DirectField(VmcsField::GUEST_IA32_SYSENTER_ESP)),
    (msr::IA32_SYSENTER_EIP, MsrRouting::DirectField(VmcsField::GUEST_IA32_SYSENTER_EIP)),
    (msr::IA32_FS_BASE, MsrRouting::DirectField(VmcsField::GUEST_FS_BASE)),
    (msr::IA32_GS_BASE, MsrRouting::DirectField(VmcsField::GUEST_GS_BASE)),
    (DEBUGCTL_MSR, MsrRouting::DirectField(VmcsField::GUEST_IA32_DEBUGCTL)),
    (PERF_GLOBAL_CTRL_MSR, MsrRouting::SwapList),
];

const DEBUGCTL_MSR: u32 = 0x1D9;
const PERF_GLOBAL_CTRL_MSR: u32 = 0x38F;

fn msr_routing(msr_num: u32) -> Option<MsrRouting> {
    MSR_TABLE.iter().find(|(m, _)| *m == msr_num).map(|(_, r)| *r)
}

/// Per-vCPU state: owned by exactly one guest, bound to at most one host CPU
/// at a time via [`crate::scheduler`].
pub struct Gcpu {
    id: GcpuId,
    vmcs: Vmcs,
    launched: Mutex<bool>,
    mode: Mutex<GcpuMode>,
    save: Mutex<SaveArea>,
    state_flags: Mutex<StateFlags>,
    caching_flags: Mutex<CachingFlags>,
    activity_state: Mutex<ActivityState>,
    cr3_virtualized: bool,
    flat_pt: Mutex<Option<FlatPageTables>>,
    physical_memory_size: u64,
    /// The GPM this gcpu currently runs under. Identical to the owning
    /// guest's startup GPM until a dynamic re-assignment replaces it.
    active_gpm: Mutex<alloc::sync::Arc<Gpm>>,
    /// The EPT root this gcpu is actually running under, which may diverge
    /// from the guest's default root while FVS or the emulator has it set
    /// aside. Owned per-gcpu since two gcpus of the same guest may run
    /// different views simultaneously.
    active_view: EptActiveView,
    ve: Mutex<VeDescriptor>,
}

impl Gcpu {
    pub fn new(id: GcpuId, vmcs_region: Hpa, unrestricted_guest: bool, physical_memory_size: u64, startup_gpm: alloc::sync::Arc<Gpm>) -> Self {
        let mut state_flags = StateFlags::empty();
        if unrestricted_guest {
            state_flags |= StateFlags::UNRESTRICTED_GUEST;
        }
        Self {
            id,
            vmcs: Vmcs::new(vmcs_region),
            launched: Mutex::new(false),
            mode: Mutex::new(GcpuMode::Native),
            save: Mutex::new(SaveArea::default()),
            state_flags: Mutex::new(state_flags),
            caching_flags: Mutex::new(CachingFlags::empty()),
            activity_state: Mutex::new(ActivityState::Active),
            cr3_virtualized: true,
            flat_pt: Mutex::new(None),
            physical_memory_size,
            active_gpm: Mutex::new(startup_gpm),
            active_view: EptActiveView::new(),
            ve: Mutex::new(VeDescriptor::disabled()),
        }
    }

    pub fn active_view(&self) -> &EptActiveView {
        &self.active_view
    }

    pub fn ve_descriptor(&self) -> &Mutex<VeDescriptor> {
        &self.ve
    }

    pub fn active_gpm(&self) -> alloc::sync::Arc<Gpm> {
        self.active_gpm.lock().clone()
    }

    pub fn set_active_gpm(&self, gpm: alloc::sync::Arc<Gpm>) {
        *self.active_gpm.lock() = gpm;
    }

    pub fn id(&self) -> GcpuId {
        self.id
    }

    pub fn mode(&self) -> GcpuMode {
        *self.mode.lock()
    }

    pub fn activity_state(&self) -> ActivityState {
        *self.activity_state.lock()
    }

    /// Clear then load this gcpu's VMCS, for the one-time control/guest-state
    /// initialization bootstrap performs before the first [`Gcpu::resume`].
    pub fn prepare_for_init(&self) -> Result<ActiveVmcs, VmcsError> {
        self.vmcs.clear()?;
        self.vmcs.load()
    }

    /// Deep-copy a loader-provided initial state into the save area and the
    /// VMCS guest fields it maps to. Called once at bootstrap, before the
    /// first resume.
    pub fn load_startup_state(&self, active: &mut ActiveVmcs, state: &GuestCpuStartupState) {
        {
            let mut save = self.save.lock();
            save.rax = state.gp.rax;
            save.rbx = state.gp.rbx;
            save.rcx = state.gp.rcx;
            save.rdx = state.gp.rdx;
            save.rsi = state.gp.rsi;
            save.rdi = state.gp.rdi;
            save.rbp = state.gp.rbp;
            save.r8 = state.gp.r8;
            save.r9 = state.gp.r9;
            save.r10 = state.gp.r10;
            save.r11 = state.gp.r11;
            save.r12 = state.gp.r12;
            save.r13 = state.gp.r13;
            save.r14 = state.gp.r14;
            save.r15 = state.gp.r15;
            save.xmm = state.xmm;
            save.cr2 = state.control.cr2;
            save.cr3_cache = state.control.cr3;
            save.cr8 = state.control.cr8;
        }

        active.write(VmcsField::GUEST_RSP, state.gp.rsp);
        active.write(VmcsField::GUEST_RIP, state.gp.rip);
        active.write(VmcsField::GUEST_RFLAGS, state.gp.rflags);
        active.write(VmcsField::GUEST_CR0, state.control.cr0);
        active.write(VmcsField::GUEST_CR3, state.control.cr3);
        active.write(VmcsField::GUEST_CR4, state.control.cr4);
        active.write(VmcsField::GUEST_DR7, 0x400);
        active.write(VmcsField::GUEST_IA32_EFER, state.msr.efer);
        active.write(VmcsField::GUEST_IA32_PAT, state.msr.pat);
        active.write(VmcsField::GUEST_IA32_SYSENTER_CS, state.msr.sysenter_cs);
        active.write(VmcsField::GUEST_IA32_SYSENTER_ESP, state.msr.sysenter_esp);
        active.write(VmcsField::GUEST_IA32_SYSENTER_EIP, state.msr.sysenter_eip);
        active.write(VmcsField::GUEST_ACTIVITY_STATE, 0);
        active.write(VmcsField::GUEST_INTERRUPTIBILITY_INFO, 0);
        active.write(VmcsField::GUEST_PENDING_DBG_EXCEPTIONS, 0);

        write_segment(active, &state.seg.cs, VmcsField::GUEST_CS_SELECTOR, VmcsField::GUEST_CS_BASE, VmcsField::GUEST_CS_LIMIT, VmcsField::GUEST_CS_AR_BYTES);
        write_segment(active, &state.seg.ds, VmcsField::GUEST_DS_SELECTOR, VmcsField::GUEST_DS_BASE, VmcsField::GUEST_DS_LIMIT, VmcsField::GUEST_DS_AR_BYTES);
        write_segment(active, &state.seg.es, VmcsField::GUEST_ES_SELECTOR, VmcsField::GUEST_ES_BASE, VmcsField::GUEST_ES_LIMIT, VmcsField::GUEST_ES_AR_BYTES);
        write_segment(active, &state.seg.fs, VmcsField::GUEST_FS_SELECTOR, VmcsField::GUEST_FS_BASE, VmcsField::GUEST_FS_LIMIT, VmcsField::GUEST_FS_AR_BYTES);
        write_segment(active, &state.seg.gs, VmcsField::GUEST_GS_SELECTOR, VmcsField::GUEST_GS_BASE, VmcsField::GUEST_GS_LIMIT, VmcsField::GUEST_GS_AR_BYTES);
        write_segment(active, &state.seg.ss, VmcsField::GUEST_SS_SELECTOR, VmcsField::GUEST_SS_BASE, VmcsField::GUEST_SS_LIMIT, VmcsField::GUEST_SS_AR_BYTES);
        write_segment(active, &state.seg.tr, VmcsField::GUEST_TR_SELECTOR, VmcsField::GUEST_TR_BASE, VmcsField::GUEST_TR_LIMIT, VmcsField::GUEST_TR_AR_BYTES);
        write_segment(active, &state.seg.ldtr, VmcsField::GUEST_LDTR_SELECTOR, VmcsField::GUEST_LDTR_BASE, VmcsField::GUEST_LDTR_LIMIT, VmcsField::GUEST_LDTR_AR_BYTES);
        active.write(VmcsField::GUEST_GDTR_BASE, state.seg.gdtr.base);
        active.write(VmcsField::GUEST_GDTR_LIMIT, state.seg.gdtr.limit as u64);
        active.write(VmcsField::GUEST_IDTR_BASE, state.seg.idtr.base);
        active.write(VmcsField::GUEST_IDTR_LIMIT, state.seg.idtr.limit as u64);
    }

    /// Load this gcpu's VMCS as the active one on the calling CPU, without
    /// clearing it first. Used by the VM-exit dispatcher to read the fields
    /// hardware just populated; [`Gcpu::prepare_for_init`] is the
    /// clear-then-load variant used only before the first resume.
    pub fn load(&self) -> Result<ActiveVmcs, VmcsError> {
        self.vmcs.load()
    }

    /// Called from the VM-exit assembly trampoline right after it has saved
    /// GPRs/XMM into the save area: snapshots CR2/CR8, which hardware does
    /// not preserve across a VM exit the way it does CR0/CR3/CR4 (those stay
    /// readable straight out of the VMCS).
    pub fn vmexit_start(&self) {
        let mut save = self.save.lock();
        save.cr2 = unsafe { read_cr2_via_fault_address() };
        save.cr8 = cpu::read_cr8();
    }

    pub fn with_save<R>(&self, f: impl FnOnce(&mut SaveArea) -> R) -> R {
        f(&mut self.save.lock())
    }

    pub fn raise_important_event(&self) {
        *self.state_flags.lock() |= StateFlags::IMPORTANT_EVENT_OCCURRED;
    }

    pub fn request_exception_resolution(&self) {
        *self.state_flags.lock() |= StateFlags::EXCEPTION_RESOLUTION_REQUIRED;
    }

    pub fn resolve_exception(&self) {
        self.state_flags.lock().remove(StateFlags::EXCEPTION_RESOLUTION_REQUIRED);
    }

    /// Transition to `new` activity state, raising the associated event and
    /// notifying the IPC layer. `transport` is only used
    /// (and only needs to be valid) when the transition touches Wait-for-SIPI.
    pub fn set_activity_state(&self, new: ActivityState, transport: &dyn IpiTransport, caller_cpu: u32) {
        let old = {
            let mut state = self.activity_state.lock();
            if *state == new {
                return;
            }
            let old = *state;
            *state = new;
            old
        };
        *self.state_flags.lock() |= StateFlags::ACTIVITY_STATE_CHANGED | StateFlags::IMPORTANT_EVENT_OCCURRED;
        event::dispatch(self.id, &GcpuEvent::ActivityStateChanged { old, new });
        if new == ActivityState::WaitForSipi {
            ipc::execute_handler_sync(transport, caller_cpu, Destination::SelfCpu, notify_wait_for_sipi, 0);
        }
    }

    /// The resume algorithm: reconciles deferred state, then
    /// issues `vmlaunch`/`vmresume`. Returns only on failure — success never
    /// returns, the hardware transfers control to the guest.
    pub fn resume(&self, caps: &VmxCapabilities, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager, transport: &dyn IpiTransport, caller_cpu: u32) -> VmcsError {
        debug_assert!(!self.state_flags.lock().contains(StateFlags::EXCEPTION_RESOLUTION_REQUIRED), "exception resolution pending at resume");

        let mut active = match self.vmcs.load() {
            Ok(a) => a,
            Err(e) => return e,
        };

        if *self.mode.lock() == GcpuMode::Native {
            // identity resume hook: no nested layer in this build.
        }

        let important = self.state_flags.lock().contains(StateFlags::IMPORTANT_EVENT_OCCURRED);
        if important {
            if self.state_flags.lock().contains(StateFlags::ACTIVITY_STATE_CHANGED) {
                self.state_flags.lock().remove(StateFlags::ACTIVITY_STATE_CHANGED);
            }

            if *self.mode.lock() == GcpuMode::Native {
                self.reconcile_native_mode_policy(&mut active, caps, provider, hmm, transport, caller_cpu);
            }

            self.state_flags.lock().remove(StateFlags::IMPORTANT_EVENT_OCCURRED);
        }

        self.restore_cr2_cr8_cr3(&mut active);
        self.apply_debug_registers(&mut active);
        self.apply_hardware_enforcements(&mut active);
        self.reinject_pending_event(&mut active);

        let mut launched = self.launched.lock();
        if *launched {
            unsafe { active.resume() }
        } else {
            *launched = true;
            unsafe { active.launch() }
        }
    }

    fn reconcile_native_mode_policy(&self, active: &mut ActiveVmcs, caps: &VmxCapabilities, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager, transport: &dyn IpiTransport, caller_cpu: u32) {
        let cr0 = active.read(VmcsField::GUEST_CR0);
        let efer = active.read(VmcsField::GUEST_IA32_EFER);
        const CR0_CD: u64 = 1 << 30;
        const CR0_PG: u64 = 1 << 31;
        const EFER_LME: u64 = 1 << 8;

        let virtualize_cache_disable = guest::with_guest(self.id.guest, |g| g.policy().virtualize_cache_disable).unwrap_or(false);
        if virtualize_cache_disable {
            if cr0 & CR0_CD != 0 {
                active.write(VmcsField::GUEST_CR0, caps.make_compliant_cr0(cr0 & !CR0_CD));
                self.caching_flags.lock().insert(CachingFlags::CACHE_DISABLE_ENFORCED);
            } else {
                self.caching_flags.lock().remove(CachingFlags::CACHE_DISABLE_ENFORCED);
            }
        }

        let explicit_emulator = self.state_flags.lock().contains(StateFlags::EMULATOR);
        let ug_supported = self.state_flags.lock().contains(StateFlags::UNRESTRICTED_GUEST);
        let paging_enabled = cr0 & CR0_PG != 0;

        if explicit_emulator {
            *self.mode.lock() = GcpuMode::Emulator;
            self.set_activity_state(ActivityState::Active, transport, caller_cpu);
        } else if ug_supported {
            // EPT supplies the identity view UG needs regardless of PG; flat
            // page tables (if any were installed before UG became available)
            // are no longer needed.
            self.teardown_flat_pt();
        } else if !ug_supported && !paging_enabled {
            let wide = efer & EFER_LME != 0;
            let mut flat = self.flat_pt.lock();
            if flat.is_none() {
                if let Ok(table) = FlatPageTables::build(self.physical_memory_size, wide, provider, hmm) {
                    *self.state_flags.lock() |= if wide { StateFlags::FLAT_PT_64 } else { StateFlags::FLAT_PT_32 };
                    *flat = Some(table);
                }
            }
            if let Some(table) = flat.as_ref() {
                active.write(VmcsField::GUEST_CR3, table.root_hpa);
                let cr4 = active.read(VmcsField::GUEST_CR4);
                const CR4_PAE: u64 = 1 << 5;
                const CR4_PSE: u64 = 1 << 4;
                let forced = if table.wide { cr4 | CR4_PAE } else { cr4 | CR4_PSE };
                active.write(VmcsField::GUEST_CR4, caps.make_compliant_cr4(forced));
                active.write(VmcsField::GUEST_CR0, caps.make_compliant_cr0(cr0 | CR0_PG));
            }
        } else if !ug_supported && paging_enabled {
            self.teardown_flat_pt();
        }
    }

    fn teardown_flat_pt(&self) {
        self.flat_pt.lock().take();
        self.state_flags.lock().remove(StateFlags::FLAT_PT_32 | StateFlags::FLAT_PT_64);
    }

    fn restore_cr2_cr8_cr3(&self, active: &mut ActiveVmcs) {
        let save = self.save.lock();
        unsafe { cpu::write_cr8(save.cr8) };
        if !self.cr3_virtualized {
            active.write(VmcsField::GUEST_CR3, save.cr3_cache);
        }
    }

    fn apply_debug_registers(&self, _active: &mut ActiveVmcs) {
        let mut caching = self.caching_flags.lock();
        if !caching.contains(CachingFlags::DEBUG_REGS_CACHED) {
            return;
        }
        if caching.contains(CachingFlags::DEBUG_REGS_MODIFIED) {
            let save = self.save.lock();
            unsafe {
                cpu::write_dr0(save.dr0);
                cpu::write_dr1(save.dr1);
                cpu::write_dr2(save.dr2);
                cpu::write_dr3(save.dr3);
                cpu::write_dr6(save.dr6);
            }
            caching.remove(CachingFlags::DEBUG_REGS_MODIFIED);
        }
    }

    fn apply_hardware_enforcements(&self, active: &mut ActiveVmcs) {
        let caching = self.caching_flags.lock();
        if caching.contains(CachingFlags::FX_STATE_MODIFIED) {
            let save = self.save.lock();
            unsafe { cpu::fxrstor(&save.fx) };
        }
        if caching.contains(CachingFlags::CACHE_DISABLE_ENFORCED) {
            const CR0_CD: u64 = 1 << 30;
            let cr0 = active.read(VmcsField::GUEST_CR0);
            active.write(VmcsField::GUEST_CR0, cr0 & !CR0_CD);
            // The guest still believes caching is disabled; make that true
            // for data already resident in the caches.
            unsafe { cpu::wbinvd() };
        }
    }

    /// Re-inject a still-pending event named by `IDT_VECTORING_INFO_FIELD`
    /// from the exit just handled, when the handler chain did not already
    /// queue a fresh entry-interrupt.
    fn reinject_pending_event(&self, active: &mut ActiveVmcs) {
        const VALID_BIT: u64 = 1 << 31;
        const TYPE_MASK: u64 = 0x700;
        const NMI_TYPE: u64 = 2 << 8;

        let vectoring = active.read(VmcsField::IDT_VECTORING_INFO_FIELD);
        if vectoring & VALID_BIT == 0 {
            return;
        }
        let entry_already_queued = active.read(VmcsField::VM_ENTRY_INTR_INFO_FIELD) & VALID_BIT != 0;
        if entry_already_queued {
            return;
        }

        active.write(VmcsField::VM_ENTRY_INTR_INFO_FIELD, vectoring & !VALID_BIT | VALID_BIT);
        let err = active.read(VmcsField::IDT_VECTORING_ERROR_CODE);
        active.write(VmcsField::VM_ENTRY_EXCEPTION_ERROR_CODE, err);
        active.write(VmcsField::VM_ENTRY_INSTRUCTION_LEN, active.read(VmcsField::VM_EXIT_INSTRUCTION_LEN));

        if vectoring & TYPE_MASK == NMI_TYPE {
            const BLOCKING_BY_NMI: u64 = 1 << 3;
            let interruptibility = active.read(VmcsField::GUEST_INTERRUPTIBILITY_INFO);
            active.write(VmcsField::GUEST_INTERRUPTIBILITY_INFO, interruptibility & !BLOCKING_BY_NMI);
        } else {
            const BLOCKING_BY_STI: u64 = 1 << 0;
            const BLOCKING_BY_MOV_SS: u64 = 1 << 1;
            let interruptibility = active.read(VmcsField::GUEST_INTERRUPTIBILITY_INFO);
            active.write(VmcsField::GUEST_INTERRUPTIBILITY_INFO, interruptibility & !(BLOCKING_BY_STI | BLOCKING_BY_MOV_SS));
        }
    }

    /// Read an MSR through the layered accessor: routed MSRs go to their
    /// VMCS guest field or are flagged as swap-list-only; everything else
    /// reads straight off hardware (valid only while this gcpu's VMCS is the
    /// one currently loaded).
    pub fn read_msr(&self, active: &ActiveVmcs, msr_num: u32) -> u64 {
        match msr_routing(msr_num) {
            Some(MsrRouting::DirectField(field)) => active.read(field),
            Some(MsrRouting::SwapList) => 0,
            None => cpu::rdmsr(msr_num),
        }
    }

    /// Write an MSR through the layered accessor. An `EFER` write outside a
    /// nested ("layer 1") context recomputes the VM-entry IA-32e-mode
    /// control bit, and — when LME is being set without Unrestricted Guest —
    /// also sets LMA, since hardware will not do so itself until paging is
    /// re-enabled.
    pub fn write_msr(&self, active: &mut ActiveVmcs, msr_num: u32, value: u64) -> VmmResult<()> {
        match msr_routing(msr_num) {
            Some(MsrRouting::DirectField(field)) => {
                active.write(field, value);
                if msr_num == msr::IA32_EFER {
                    self.recompute_ia32e_entry_control(active, value);
                }
                Ok(())
            }
            Some(MsrRouting::SwapList) => Err(VmmError::UnsupportedControl),
            None => {
                unsafe { cpu::wrmsr(msr_num, value) };
                Ok(())
            }
        }
    }

    fn recompute_ia32e_entry_control(&self, active: &mut ActiveVmcs, efer: u64) {
        const EFER_LME: u64 = 1 << 8;
        const EFER_LMA: u64 = 1 << 10;
        const ENTRY_IA32E_MODE: u64 = 1 << 9;

        let mut entry_ctls = active.read(VmcsField::VM_ENTRY_CONTROLS);
        let lme = efer & EFER_LME != 0;
        if lme {
            entry_ctls |= ENTRY_IA32E_MODE;
        } else {
            entry_ctls &= !ENTRY_IA32E_MODE;
        }
        active.write(VmcsField::VM_ENTRY_CONTROLS, entry_ctls);

        if lme && !self.state_flags.lock().contains(StateFlags::UNRESTRICTED_GUEST) {
            active.write(VmcsField::GUEST_IA32_EFER, efer | EFER_LMA);
        }
    }
}

fn write_segment(active: &mut ActiveVmcs, seg: &crate::startup::Segment, sel: VmcsField, base: VmcsField, limit: VmcsField, ar: VmcsField) {
    active.write(sel, seg.selector as u64);
    active.write(base, seg.base);
    active.write(limit, seg.limit as u64);
    active.write(ar, seg.attributes as u64);
}

fn notify_wait_for_sipi(_arg: usize) {}

/// `CR2` is not readable through a general-purpose instruction outside a
/// page fault context; hardware leaves it unmodified across most VM exits
/// except page faults, where it holds the faulting address. Isolated into
/// its own narrowly-scoped unsafe fn so [`Gcpu::vmexit_start`] reads clearly.
#[inline]
unsafe fn read_cr2_via_fault_address() -> u64 {
    let v: u64;
    unsafe { core::arch::asm!("mov {}, cr2", out(reg) v, options(nomem, nostack, preserves_flags)) };
    v
}
