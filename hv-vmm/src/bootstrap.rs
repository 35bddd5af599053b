//! Bootstrap: the BSP discovers VMX capabilities, enters VMX root operation,
//! constructs every guest from the deep-copied startup struct, and drives
//! the first VM entry on each gcpu. AP main mirrors the capability
//! discovery and VMXON steps locally, then busy-waits on the two allowed
//! non-IPC suspension points before doing the same.
//!
//! ACPI parsing, PCI enumeration, and the AP wakeup trampoline itself stay
//! external collaborators — this module only exposes the entry points
//! such a trampoline jumps to, and consumes the capability snapshot and
//! startup struct the loader hands it.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use hv_hal::cpu;
use hv_hal::memory::{HostMemoryManager, Hpa, MemoryProvider};
use hv_hal::vmcs::{self, VmcsError, VmcsField};
use hv_hal::HalError;

use crate::ept::{self, EptGuestState};
use crate::error::VmmResult;
use crate::gcpu::{Gcpu, GcpuId};
use crate::guest::{self, Gpm, GuestId};
use crate::int15::GuestMemoryAccess;
use crate::ipc::IpiTransport;
use crate::mam::EptAttrs;
use crate::policy::{CpuAffinity, Policy};
use crate::scheduler;
use crate::startup::{GuestStartup, StartupStruct};
use crate::vmcs_init::VmxCapabilities;
use crate::vmexit;

/// Released once the BSP has finished constructing every guest and is ready
/// for APs to bring themselves into VMX operation. The first of the two
/// allowed non-IPC busy-waits inside VMM code.
static AP_LAUNCH_FLAG: AtomicBool = AtomicBool::new(false);

/// Incremented by every host CPU — BSP included — immediately before its
/// first `vmlaunch`. The BSP's final bring-up step busy-waits on this
/// reaching the configured host CPU count: the second of the two non-IPC
/// suspension points.
static HOST_CPUS_LAUNCHED: AtomicU32 = AtomicU32::new(0);

pub fn release_aps() {
    AP_LAUNCH_FLAG.store(true, Ordering::Release);
}

/// Busy-wait for [`release_aps`]. Called once by AP main before it does
/// anything else.
pub fn wait_for_ap_launch() {
    while !AP_LAUNCH_FLAG.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
}

fn mark_host_cpu_launched() {
    HOST_CPUS_LAUNCHED.fetch_add(1, Ordering::AcqRel);
}

/// Busy-wait until `expected` host CPUs have each reported their first
/// `vmlaunch`. Called once by the BSP after releasing the APs.
pub fn wait_for_all_launched(expected: u32) {
    while HOST_CPUS_LAUNCHED.load(Ordering::Acquire) < expected {
        core::hint::spin_loop();
    }
}

/// One host CPU's VMXON region: a single page formatted with the VMCS
/// revision id `IA32_VMX_BASIC` reports, entered via `VMXON` on the calling
/// core. Dropping it leaves VMX root operation — a host CPU that never
/// drops its region stays in root operation for the rest of boot, which is
/// the intended lifetime here.
pub struct VmxRootOperation {
    region_hpa: Hpa,
}

impl VmxRootOperation {
    /// Check capability preconditions, allocate and format a VMXON region,
    /// set `CR4.VMXE`, and execute `VMXON` on the calling core.
    pub fn enter(caps: &VmxCapabilities, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> Result<Self, HalError> {
        hv_hal::check_vmx_available()?;
        let region_hva = provider.alloc_page(1).ok_or(HalError::VmxonFailed)?;
        let region_hpa = hmm.hva_to_hpa(region_hva).ok_or(HalError::VmxonFailed)?;
        unsafe { core::ptr::write_volatile(region_hva as *mut u32, caps.basic.revision_id) };
        unsafe {
            cpu::enable_vmxe();
            vmcs::vmxon(region_hpa).map_err(|_| HalError::VmxonFailed)?;
        }
        Ok(Self { region_hpa })
    }

    pub fn region_hpa(&self) -> Hpa {
        self.region_hpa
    }
}

impl Drop for VmxRootOperation {
    fn drop(&mut self) {
        unsafe {
            let _ = vmcs::vmxoff();
            cpu::disable_vmxe();
        }
    }
}

const ACTIVATE_SECONDARY_CONTROLS: u32 = 1 << 31;
const SECONDARY_ENABLE_EPT: u32 = 1 << 1;
const SECONDARY_ENABLE_VPID: u32 = 1 << 5;
const SECONDARY_UNRESTRICTED_GUEST: u32 = 1 << 7;
const EXIT_CTL_HOST_ADDR_SPACE_SIZE: u32 = 1 << 9;

/// Populate the subset of control-field VMCS state the capability snapshot
/// determines: pin/processor-based controls adjusted to the allowed bits,
/// EPT/VPID/Unrestricted-Guest secondary controls when supported, and the
/// CR0/CR4 guest/host masks so a guest attempt to clear a bit this build
/// forces to 1 (or set one forced to 0) traps rather than silently lying to
/// the guest about its own control-register state.
fn init_vmcs_controls(active: &mut vmcs::ActiveVmcs, caps: &VmxCapabilities, vpid: u16) {
    active.write(VmcsField::PIN_BASED_VM_EXEC_CONTROL, caps.pinbased.adjust(0) as u64);

    let wants_secondary = caps.procbased2.allowed1 != 0;
    let proc_desired = if wants_secondary { ACTIVATE_SECONDARY_CONTROLS } else { 0 };
    active.write(VmcsField::CPU_BASED_VM_EXEC_CONTROL, caps.procbased.adjust(proc_desired) as u64);

    if wants_secondary {
        let mut secondary = SECONDARY_ENABLE_EPT | SECONDARY_ENABLE_VPID;
        if caps.unrestricted_guest {
            secondary |= SECONDARY_UNRESTRICTED_GUEST;
        }
        active.write(VmcsField::SECONDARY_VM_EXEC_CONTROL, caps.procbased2.adjust(secondary) as u64);
    }

    active.write(VmcsField::VM_EXIT_CONTROLS, caps.exit_ctls.adjust(EXIT_CTL_HOST_ADDR_SPACE_SIZE) as u64);
    active.write(VmcsField::VM_ENTRY_CONTROLS, caps.entry_ctls.adjust(0) as u64);

    active.write(VmcsField::EXCEPTION_BITMAP, 0);
    active.write(VmcsField::VIRTUAL_PROCESSOR_ID, vpid as u64);

    active.write(VmcsField::CR0_GUEST_HOST_MASK, caps.cr0_fixed0 | !caps.cr0_fixed1);
    active.write(VmcsField::CR0_READ_SHADOW, caps.make_compliant_cr0(0));
    active.write(VmcsField::CR4_GUEST_HOST_MASK, caps.cr4_fixed0 | !caps.cr4_fixed1);
    active.write(VmcsField::CR4_READ_SHADOW, caps.make_compliant_cr4(0));
}

/// Snapshot the calling (host) CPU's current CR0/CR3/CR4 into the VMCS host
/// fields. Host RSP/RIP, segment selectors, and GDTR/IDTR are populated by
/// the entry/exit assembly trampoline's own control-flow handling — out of
/// scope here, same as the trampoline itself.
fn init_vmcs_host_state(active: &mut vmcs::ActiveVmcs) {
    active.write(VmcsField::HOST_CR0, cpu::read_cr0());
    active.write(VmcsField::HOST_CR3, cpu::read_cr3());
    active.write(VmcsField::HOST_CR4, cpu::read_cr4());
}

/// Everything the BSP needs from the outside world to bring every guest up:
/// the allocator, the HMM, and the cross-CPU transport. All three are
/// external collaborators supplied by the loader.
pub struct BringUpEnv<'a> {
    pub provider: &'a dyn MemoryProvider,
    pub hmm: &'a dyn HostMemoryManager,
    pub transport: &'a dyn IpiTransport,
    /// The loader's linear/physical-to-HVA translator, consulted by the
    /// INT15h E820 handler when servicing a trapped real-mode `vmcall`.
    pub mem: &'a dyn GuestMemoryAccess,
}

/// Registry of constructed gcpus, addressed by [`GcpuId`], so the resume
/// loop can look one up without threading `Gcpu` values through every call
/// site. A gcpu is never removed once created — there is no teardown path.
static GCPUS: spin::Mutex<Vec<Arc<Gcpu>>> = spin::Mutex::new(Vec::new());

fn register_gcpu(gcpu: Gcpu) -> Arc<Gcpu> {
    let gcpu = Arc::new(gcpu);
    GCPUS.lock().push(gcpu.clone());
    gcpu
}

pub fn find_gcpu(id: GcpuId) -> Option<Arc<Gcpu>> {
    GCPUS.lock().iter().find(|g| g.id() == id).cloned()
}

/// [`VmxCapabilities::ept_superpage_bitmap`] indexes by page size (bit 0 =
/// 4 KiB, bit 1 = 2 MiB, bit 2 = 1 GiB); [`Mam::with_superpage_mask`][mam]
/// indexes by tree level (bit 0 = top/512 GiB level, growing toward the leaf
/// level). Level 2 covers 2 MiB and level 1 covers 1 GiB, so the two bitmaps
/// are reverse-ordered relative to each other and must not be passed through
/// directly.
///
/// [mam]: crate::mam::Mam::with_superpage_mask
fn ept_bitmap_to_mam_mask(ept_bitmap: u8) -> u8 {
    let mut mask = 0u8;
    if ept_bitmap & 0b010 != 0 {
        mask |= 1 << 2;
    }
    if ept_bitmap & 0b100 != 0 {
        mask |= 1 << 1;
    }
    mask
}

/// Spread a guest's gcpus across its affinity mask round-robin.
fn pick_host_cpu(affinity: CpuAffinity, gcpu_index: usize, num_host_cpus: u32) -> u32 {
    match affinity {
        CpuAffinity::All => gcpu_index as u32 % num_host_cpus.max(1),
        CpuAffinity::Mask(bits) => {
            let eligible: Vec<u32> = (0..64u32).filter(|b| bits & (1 << b) != 0).collect();
            if eligible.is_empty() {
                0
            } else {
                eligible[gcpu_index % eligible.len()]
            }
        }
    }
}

/// Build one guest (primary or secondary) from its deep-copied startup
/// description: register it, render its default EPT from an identity GPM
/// covering its configured physical memory, create one gcpu per configured
/// CPU state, bind each to a host CPU chosen from its affinity mask, and
/// load its initial architectural state.
fn build_guest(
    startup: &GuestStartup,
    caps: &VmxCapabilities,
    env: &BringUpEnv,
    num_host_cpus: u32,
    vmcs_region_for: impl Fn(usize) -> Hpa,
) -> VmmResult<GuestId> {
    let gpm = Arc::new(Gpm::with_superpage_mask(ept_bitmap_to_mam_mask(caps.ept_superpage_bitmap())));
    let attrs = EptAttrs::READ | EptAttrs::WRITE | EptAttrs::EXEC;
    if startup.physical_memory_size > 0 {
        gpm.insert_range(0, startup.load_gpa_offset, startup.image.base_address, startup.physical_memory_size, attrs)?;
    }

    // No loader input currently carries this bit; cache-disable stays
    // hardware-honored until a startup field feeds it.
    let policy = Policy::new(startup.flags, startup.affinity, false, false);

    let guest_id = guest::reserve_guest_id();
    let ept_guest = Arc::new(EptGuestState::new(guest_id.0));
    ept_guest.build_default_ept(&gpm, caps, env.provider, env.hmm)?;
    guest::guest_register(guest_id, startup.magic, policy, gpm.clone(), ept_guest.clone());

    for (index, state) in startup.cpu_states.iter().enumerate() {
        let gcpu_id = GcpuId { guest: guest_id, index: index as u16 };
        let host_cpu = pick_host_cpu(startup.affinity, index, num_host_cpus);
        let vmcs_region = vmcs_region_for(index);

        let gcpu = Gcpu::new(gcpu_id, vmcs_region, caps.unrestricted_guest, startup.physical_memory_size, gpm.clone());
        let mut active = gcpu.prepare_for_init()?;
        init_vmcs_host_state(&mut active);
        init_vmcs_controls(&mut active, caps, guest_id.0);
        active.write(VmcsField::EPT_POINTER, ept_guest.default_eptp());
        if let Some(state) = state {
            gcpu.load_startup_state(&mut active, state);
        }
        drop(active);

        guest::with_guest(guest_id, |g| g.add_gcpu(gcpu_id))?;
        scheduler::bind(host_cpu, guest_id, gcpu_id)?;
        register_gcpu(gcpu);
    }

    Ok(guest_id)
}

/// Construct every guest named by `startup` and register the engine's own
/// fatal-path event handlers. Host-CPU binding for each guest's gcpus uses
/// that guest's own affinity mask, round-robin within it.
pub fn bsp_bring_up(startup: &StartupStruct, caps: &VmxCapabilities, env: &BringUpEnv, vmcs_region_for: impl Fn(GuestId, usize) -> Hpa) -> VmmResult<GuestId> {
    ept::register_handlers();

    let primary_id_slot = GuestId(0);
    let primary_id = build_guest(&startup.primary_guest, caps, env, startup.number_of_host_cpus, |i| vmcs_region_for(primary_id_slot, i))?;

    for secondary in &startup.secondary_guests {
        build_guest(secondary, caps, env, startup.number_of_host_cpus, |i| vmcs_region_for(primary_id, i))?;
    }

    Ok(primary_id)
}

/// Drive a host CPU's first VM entry for the gcpu it is bound to. Never
/// returns on success — hardware transfers control to the guest, and the
/// next time this core runs VMM code is through [`handle_vm_exit_and_resume`],
/// called by the VM-exit assembly trampoline rather than from here. On
/// failure, the condition is unrecoverable and fatal.
pub fn enter_guest_and_run(host_cpu: u32, caps: &VmxCapabilities, env: &BringUpEnv) -> ! {
    let Some(binding) = scheduler::current_binding(host_cpu) else {
        crate::fatal!("host cpu {} has no gcpu binding at first entry", host_cpu);
    };
    let Some(gcpu) = find_gcpu(binding.gcpu) else {
        crate::fatal!("host cpu {} bound to unregistered gcpu {:?}", host_cpu, binding.gcpu);
    };
    mark_host_cpu_launched();
    let err = gcpu.resume(caps, env.provider, env.hmm, env.transport, host_cpu);
    crate::fatal!("first vm entry failed on host cpu {}: {:?}", host_cpu, err)
}

/// AP main: wait for the BSP's release signal, enter VMX root operation
/// locally, then enter whichever gcpu the BSP bound to this core.
pub fn ap_main(host_cpu: u32, caps: &VmxCapabilities, env: &BringUpEnv) -> ! {
    wait_for_ap_launch();
    match VmxRootOperation::enter(caps, env.provider, env.hmm) {
        Ok(root) => core::mem::forget(root),
        Err(e) => crate::fatal!("AP {} failed to enter VMX root operation: {:?}", host_cpu, e),
    }
    enter_guest_and_run(host_cpu, caps, env)
}

/// The steady-state re-entry point: the VM-exit assembly trampoline calls
/// this, on the host CPU the exit landed on, once it has saved GPRs/XMM into
/// the gcpu's save area. Decodes and dispatches the reason for the exit that
/// just happened via [`vmexit::handle_vm_exit`], then issues the next
/// `vmlaunch`/`vmresume`. Like [`enter_guest_and_run`], returns only on
/// failure — the trampoline itself is the loop, calling back in here after
/// every subsequent exit.
pub fn handle_vm_exit_and_resume(host_cpu: u32, caps: &VmxCapabilities, env: &BringUpEnv) -> VmcsError {
    let Some(binding) = scheduler::current_binding(host_cpu) else {
        crate::fatal!("host cpu {} has no gcpu binding at vm exit", host_cpu);
    };
    let Some(gcpu) = find_gcpu(binding.gcpu) else {
        crate::fatal!("host cpu {} bound to unregistered gcpu {:?}", host_cpu, binding.gcpu);
    };

    gcpu.vmexit_start();

    let guest_id = gcpu.id().guest;
    let Ok((ept_guest, fvs_descriptor)) = guest::with_guest(guest_id, |g| (g.ept(), g.fvs())) else {
        crate::fatal!("vm exit on unregistered guest {:?}", guest_id);
    };
    let gpm = gcpu.active_gpm();

    let mut active = match gcpu.load() {
        Ok(a) => a,
        Err(e) => return e,
    };

    let _ = guest::with_guest(guest_id, |g| {
        g.with_int15(|int15| {
            vmexit::handle_vm_exit(&gcpu, &mut active, &gpm, env.hmm, &ept_guest, &fvs_descriptor, int15, env.mem, host_cpu);
        })
    });
    drop(active);

    gcpu.resume(caps, env.provider, env.hmm, env.transport, host_cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_affinity_round_robins_across_host_cpus() {
        for i in 0..8usize {
            assert_eq!(pick_host_cpu(CpuAffinity::All, i, 4), (i % 4) as u32);
        }
    }

    #[test]
    fn all_affinity_with_a_single_host_cpu_never_divides_by_zero() {
        assert_eq!(pick_host_cpu(CpuAffinity::All, 0, 0), 0);
        assert_eq!(pick_host_cpu(CpuAffinity::All, 5, 0), 0);
    }

    #[test]
    fn mask_affinity_round_robins_across_the_eligible_set_only() {
        let mask = CpuAffinity::Mask((1 << 1) | (1 << 3) | (1 << 5));
        assert_eq!(pick_host_cpu(mask, 0, 8), 1);
        assert_eq!(pick_host_cpu(mask, 1, 8), 3);
        assert_eq!(pick_host_cpu(mask, 2, 8), 5);
        assert_eq!(pick_host_cpu(mask, 3, 8), 1);
    }

    #[test]
    fn empty_mask_falls_back_to_host_cpu_zero() {
        assert_eq!(pick_host_cpu(CpuAffinity::Mask(0), 3, 8), 0);
    }

    #[test]
    fn ept_bitmap_to_mam_mask_reorders_2m_and_1g_bits() {
        assert_eq!(ept_bitmap_to_mam_mask(0b001), 0b000);
        assert_eq!(ept_bitmap_to_mam_mask(0b011), 0b100);
        assert_eq!(ept_bitmap_to_mam_mask(0b101), 0b010);
        assert_eq!(ept_bitmap_to_mam_mask(0b111), 0b110);
    }
}
