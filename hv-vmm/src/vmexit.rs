//! VM-exit reason dispatch: the steady-state control flow that runs between
//! two `vmlaunch`/`vmresume` calls. Decodes `EXIT_REASON` off the VMCS
//! hardware just populated and routes to the handler that reason names;
//! [`crate::bootstrap::handle_vm_exit_and_resume`] is the only caller, and
//! the one the VM-exit assembly trampoline re-enters on every exit after the
//! first.

use hv_hal::memory::{HostMemoryManager, MemoryProvider};
use hv_hal::vmcs::{ActiveVmcs, VmcsField};

use crate::e820::E820Map;
use crate::ept::{self, EptGuestState};
use crate::event::{self, GcpuEvent};
use crate::fvs::{self, FvsDescriptor};
use crate::gcpu::Gcpu;
use crate::guest::Gpm;
use crate::int15::{self, E820Emulation, GuestCallState, GuestMemoryAccess, Int15Trap, VmcallOutcome};
use crate::ve;

const EXIT_REASON_MOV_CR: u32 = 28;
const EXIT_REASON_VMCALL: u32 = 18;
const EXIT_REASON_VMFUNC: u32 = 59;
const EXIT_REASON_EPT_VIOLATION: u32 = 48;
const EXIT_REASON_EPT_MISCONFIGURATION: u32 = 49;

const CR0_PE: u64 = 1 << 0;
const IDT_VECTORING_VALID: u64 = 1 << 31;
const EPT_QUAL_NMI_UNBLOCKING: u64 = 1 << 12;

/// Route the exit that just landed on `active` to its handler. Every branch
/// that retires the trapping instruction in place (rather than faulting the
/// guest or halting the host) advances `GUEST_RIP` itself before returning.
#[allow(clippy::too_many_arguments)]
pub fn handle_vm_exit(
    gcpu: &Gcpu,
    active: &mut ActiveVmcs,
    gpm: &Gpm,
    hmm: &dyn HostMemoryManager,
    ept_guest: &EptGuestState,
    fvs_descriptor: &FvsDescriptor,
    int15: Option<(&Int15Trap, &E820Map, &mut E820Emulation)>,
    mem: &dyn GuestMemoryAccess,
    host_cpu: u32,
) {
    let exit_reason = active.read(VmcsField::EXIT_REASON) as u32;
    match exit_reason {
        EXIT_REASON_MOV_CR => handle_cr_access(gcpu, active, ept_guest, gpm, hmm, host_cpu),
        EXIT_REASON_VMCALL => {
            if let Some((trap, map, emu)) = int15 {
                handle_vmcall(gcpu, active, trap, map, emu, mem);
            }
        }
        EXIT_REASON_VMFUNC => handle_vmfunc(gcpu, active, fvs_descriptor, host_cpu, exit_reason),
        EXIT_REASON_EPT_VIOLATION => handle_ept_violation(gcpu, active, gpm, host_cpu),
        EXIT_REASON_EPT_MISCONFIGURATION => handle_ept_misconfiguration(gcpu, active, ept_guest),
        _ => {}
    }
}

fn advance_rip(active: &mut ActiveVmcs) {
    let len = active.read(VmcsField::VM_EXIT_INSTRUCTION_LEN);
    let rip = active.read(VmcsField::GUEST_RIP);
    active.write(VmcsField::GUEST_RIP, rip + len);
}

/// General-register value named by a `MOV-to/from-CR` exit qualification's
/// GPR-index field. `RSP` lives in the VMCS, not the save area, since it is
/// never cached outside it in this design.
fn gpr_value(gcpu: &Gcpu, active: &ActiveVmcs, index: u64) -> u64 {
    if index == 4 {
        return active.read(VmcsField::GUEST_RSP);
    }
    gcpu.with_save(|save| match index {
        0 => save.rax,
        1 => save.rcx,
        2 => save.rdx,
        3 => save.rbx,
        5 => save.rbp,
        6 => save.rsi,
        7 => save.rdi,
        8 => save.r8,
        9 => save.r9,
        10 => save.r10,
        11 => save.r11,
        12 => save.r12,
        13 => save.r13,
        14 => save.r14,
        15 => save.r15,
        _ => 0,
    })
}

/// `MOV-to-CR`: `EXIT_QUALIFICATION` bits 0-3 name the control register,
/// bits 4-5 the access type (0 = MOV to CR, which is the only type this
/// engine tracks as a reconciled event), bits 8-11 the source GPR.
fn handle_cr_access(gcpu: &Gcpu, active: &mut ActiveVmcs, ept_guest: &EptGuestState, gpm: &Gpm, hmm: &dyn HostMemoryManager, host_cpu: u32) {
    let qualification = active.read(VmcsField::EXIT_QUALIFICATION);
    let cr_number = qualification & 0xf;
    let access_type = (qualification >> 4) & 0x3;

    if access_type != 0 {
        advance_rip(active);
        return;
    }

    let gpr_index = (qualification >> 8) & 0xf;
    let new_value = gpr_value(gcpu, active, gpr_index);

    match cr_number {
        0 => {
            let old = active.read(VmcsField::GUEST_CR0);
            active.write(VmcsField::GUEST_CR0, new_value);
            ept::on_guest_cr0_write(active, gcpu.active_view(), ept_guest, old, new_value, gpm, hmm, host_cpu);
            event::dispatch(gcpu.id(), &GcpuEvent::AfterGuestCr0Write { old, new: new_value });
        }
        3 => {
            active.write(VmcsField::GUEST_CR3, new_value);
            ept::on_guest_cr3_write(active, ept_guest, gpm, hmm, host_cpu);
            event::dispatch(gcpu.id(), &GcpuEvent::AfterGuestCr3Write { new: new_value });
        }
        4 => {
            let old = active.read(VmcsField::GUEST_CR4);
            active.write(VmcsField::GUEST_CR4, new_value);
            ept::on_guest_cr4_write(active, gcpu.active_view(), old, new_value, gpm, hmm, host_cpu);
            event::dispatch(gcpu.id(), &GcpuEvent::AfterGuestCr4Write { old, new: new_value });
        }
        _ => {}
    }

    advance_rip(active);
}

/// Real-mode `VMCALL`, the only kind this build ever sees trap (protected
/// mode is never expected to execute one): forwarded to the INT15h E820
/// handler when this guest installed a trap. A `vmcall` this isn't the
/// INT15h stub's, or one that lands with no trap installed at all, is left
/// for the guest to resolve — `GUEST_RIP` is not advanced.
fn handle_vmcall(gcpu: &Gcpu, active: &mut ActiveVmcs, trap: &Int15Trap, map: &E820Map, emu: &mut E820Emulation, mem: &dyn GuestMemoryAccess) {
    if active.read(VmcsField::GUEST_CR0) & CR0_PE != 0 {
        return;
    }

    let cs_selector = active.read(VmcsField::GUEST_CS_SELECTOR) as u16;
    let rip = active.read(VmcsField::GUEST_RIP);
    let rflags = active.read(VmcsField::GUEST_RFLAGS);
    let ss_selector = active.read(VmcsField::GUEST_SS_SELECTOR) as u16;
    let es_selector = active.read(VmcsField::GUEST_ES_SELECTOR) as u16;
    let rsp = active.read(VmcsField::GUEST_RSP);

    let state = gcpu.with_save(|save| GuestCallState {
        rax: save.rax,
        rbx: save.rbx,
        rcx: save.rcx,
        rdx: save.rdx,
        rdi: save.rdi,
        rflags,
        es_selector,
        ss_selector,
        rsp,
    });

    let Ok(VmcallOutcome::Handled(result)) = int15::handle_vmcall(trap, cs_selector, rip, state, emu, map, mem) else {
        return;
    };

    gcpu.with_save(|save| {
        save.rax = result.rax;
        save.rbx = result.rbx;
        save.rcx = result.rcx;
        save.rdx = result.rdx;
        save.rdi = result.rdi;
    });
    active.write(VmcsField::GUEST_RFLAGS, result.rflags);
    advance_rip(active);
}

fn handle_vmfunc(gcpu: &Gcpu, active: &mut ActiveVmcs, fvs_descriptor: &FvsDescriptor, host_cpu: u32, exit_reason: u32) {
    let (rax, rcx) = gcpu.with_save(|save| (save.rax, save.rcx));
    if let Ok(true) = fvs::handle_vmfunc_exit(gcpu.id(), active, fvs_descriptor, host_cpu, exit_reason, rax, rcx) {
        advance_rip(active);
    }
}

fn handle_ept_violation(gcpu: &Gcpu, active: &mut ActiveVmcs, gpm: &Gpm, host_cpu: u32) {
    let qualification = active.read(VmcsField::EXIT_QUALIFICATION);
    let gpa = active.read(VmcsField::GUEST_PHYS_ADDR);
    let idt_vectoring_valid = active.read(VmcsField::IDT_VECTORING_INFO_FIELD) & IDT_VECTORING_VALID != 0;
    let nmi_unblocking = qualification & EPT_QUAL_NMI_UNBLOCKING != 0;

    ept::on_ept_violation(gcpu.id(), active, gpa, qualification, idt_vectoring_valid, nmi_unblocking);

    let ve_descriptor = gcpu.ve_descriptor().lock();
    let leaf_suppress_ve = gpm.gpa_to_hpa(host_cpu, gpa).map(|(_, attrs)| ve::leaf_suppresses_ve(attrs)).unwrap_or(false);
    let gate = ve::GateInputs {
        hardware_ve_supported: false,
        guest_cr0_pe: active.read(VmcsField::GUEST_CR0) & CR0_PE != 0,
        idt_vectoring_valid,
        exception_bitmap_intercepts_ve: false,
        ept_leaf_suppress_ve: leaf_suppress_ve,
    };
    if ve::should_inject(&ve_descriptor, &gate) {
        let gla = active.read(VmcsField::GUEST_LINEAR_ADDR);
        let eptp_index = active.read(VmcsField::EPTP_INDEX) as u16;
        ve::inject(active, &ve_descriptor, gla, gpa, qualification, eptp_index);
    }
}

fn handle_ept_misconfiguration(gcpu: &Gcpu, active: &ActiveVmcs, ept_guest: &EptGuestState) -> ! {
    let gpa = active.read(VmcsField::GUEST_PHYS_ADDR);
    ept::on_ept_misconfiguration(gcpu.id(), gpa, ept_guest.default_eptp())
}
