//! Cross-host-CPU synchronous calls and the stop/start-all-CPUs barrier the
//! EPT engine's GPM-modification protocol and dynamic guest creation use.
//!
//! Actually delivering an inter-processor interrupt is a hardware/APIC
//! concern outside this crate (alongside ACPI parsing and AP wakeup
//! trampolines) — callers provide an [`IpiTransport`]; this module owns
//! only the handshake: who is waited on, and when the barrier releases.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

/// Sends the IPC/stop vector to a given host CPU and reports how many host
/// CPUs exist. Implemented outside this crate.
pub trait IpiTransport: Sync {
    fn send_ipc_ipi(&self, target_host_cpu: u32);
    fn send_stop_ipi(&self, target_host_cpu: u32);
    fn num_host_cpus(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    SelfCpu,
    AllExcludingSelf,
    Specific(u32),
}

type HandlerFn = fn(usize);

static BROADCAST_LOCK: Mutex<()> = Mutex::new(());
static CURRENT_HANDLER: AtomicUsize = AtomicUsize::new(0);
static CURRENT_ARG: AtomicUsize = AtomicUsize::new(0);
static PENDING_ACKS: AtomicU32 = AtomicU32::new(0);

/// Run `handler(arg)` on the CPUs named by `destination` and block until
/// every one of them has acknowledged completion. Recipients run it as an
/// IPI handler via [`handle_ipc_ipi`]; the caller runs it locally too when
/// it is itself a target.
pub fn execute_handler_sync(transport: &dyn IpiTransport, caller_cpu: u32, destination: Destination, handler: HandlerFn, arg: usize) {
    let _guard = BROADCAST_LOCK.lock();

    let run_locally = matches!(destination, Destination::SelfCpu) || matches!(destination, Destination::Specific(c) if c == caller_cpu);

    let remote_targets: u32 = match destination {
        Destination::SelfCpu => 0,
        Destination::Specific(c) if c == caller_cpu => 0,
        Destination::Specific(_) => 1,
        Destination::AllExcludingSelf => transport.num_host_cpus().saturating_sub(1),
    };

    CURRENT_HANDLER.store(handler as usize, Ordering::Release);
    CURRENT_ARG.store(arg, Ordering::Release);
    PENDING_ACKS.store(0, Ordering::Release);

    match destination {
        Destination::SelfCpu => {}
        Destination::Specific(c) if c == caller_cpu => {}
        Destination::Specific(c) => transport.send_ipc_ipi(c),
        Destination::AllExcludingSelf => {
            for cpu in 0..transport.num_host_cpus() {
                if cpu != caller_cpu {
                    transport.send_ipc_ipi(cpu);
                }
            }
        }
    }

    if run_locally {
        handler(arg);
    }

    while PENDING_ACKS.load(Ordering::Acquire) < remote_targets {
        core::hint::spin_loop();
    }
}

/// Called from the IPC-vector interrupt handler on a recipient CPU.
pub fn handle_ipc_ipi() {
    let raw = CURRENT_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        return;
    }
    let handler: HandlerFn = unsafe { core::mem::transmute::<usize, HandlerFn>(raw) };
    let arg = CURRENT_ARG.load(Ordering::Acquire);
    handler(arg);
    PENDING_ACKS.fetch_add(1, Ordering::AcqRel);
}

static STOPPED_COUNT: AtomicU32 = AtomicU32::new(0);
static RESUME_FLAG: AtomicBool = AtomicBool::new(true);

/// Stop every host CPU but the caller and block until they have all
/// checked in via [`stop_and_wait`]. Used by the EPT engine's
/// `BEGIN_GPM_MODIFICATION_BEFORE_CPUS_STOPPED` step and by dynamic guest
/// creation.
pub fn stop_all_cpus(transport: &dyn IpiTransport, caller_cpu: u32) {
    RESUME_FLAG.store(false, Ordering::Release);
    STOPPED_COUNT.store(0, Ordering::Release);
    let targets = transport.num_host_cpus().saturating_sub(1);
    for cpu in 0..transport.num_host_cpus() {
        if cpu != caller_cpu {
            transport.send_stop_ipi(cpu);
        }
    }
    while STOPPED_COUNT.load(Ordering::Acquire) < targets {
        core::hint::spin_loop();
    }
}

/// Called from the stop-vector interrupt handler on a remote CPU: checks in
/// and busy-waits until [`start_all_cpus`] releases it.
pub fn stop_and_wait() {
    STOPPED_COUNT.fetch_add(1, Ordering::AcqRel);
    while !RESUME_FLAG.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
}

/// Release CPUs parked in [`stop_and_wait`].
pub fn start_all_cpus() {
    RESUME_FLAG.store(true, Ordering::Release);
}
