//! Maps each guest CPU to the one host CPU that runs it. There is no
//! preemptive multiplexing here — VMM work runs to completion between VM
//! exit and the next `vmresume`; "scheduling" is the static (or
//! boot-time-assigned) binding used to route IPC and to find which gcpu a
//! host CPU should enter next.

use spin::Mutex;

use crate::error::{VmmError, VmmResult};
use crate::gcpu::GcpuId;
use crate::guest::GuestId;

pub const MAX_HOST_CPUS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub guest: GuestId,
    pub gcpu: GcpuId,
}

struct Bindings {
    by_host_cpu: [Option<Binding>; MAX_HOST_CPUS],
}

static BINDINGS: Mutex<Bindings> = Mutex::new(Bindings { by_host_cpu: [None; MAX_HOST_CPUS] });

/// Bind `gcpu` (owned by `guest`) to run exclusively on `host_cpu`. Called
/// during bootstrap, or for a dynamically created guest under the
/// stop-all-CPUs barrier described in [`crate::ipc`].
pub fn bind(host_cpu: u32, guest: GuestId, gcpu: GcpuId) -> VmmResult<()> {
    if host_cpu as usize >= MAX_HOST_CPUS {
        return Err(VmmError::InvalidId);
    }
    BINDINGS.lock().by_host_cpu[host_cpu as usize] = Some(Binding { guest, gcpu });
    Ok(())
}

pub fn unbind(host_cpu: u32) {
    if let Some(slot) = BINDINGS.lock().by_host_cpu.get_mut(host_cpu as usize) {
        *slot = None;
    }
}

/// The gcpu the calling host CPU is bound to, if any.
pub fn current_binding(host_cpu: u32) -> Option<Binding> {
    BINDINGS.lock().by_host_cpu.get(host_cpu as usize).copied().flatten()
}

/// All host CPUs presently bound to a gcpu owned by `guest`, used by
/// teardown and by `stop_all_cpus` to know which cores to address.
pub fn host_cpus_for_guest(guest: GuestId) -> impl Iterator<Item = u32> {
    let bindings = BINDINGS.lock();
    (0..MAX_HOST_CPUS as u32)
        .filter(move |&cpu| bindings.by_host_cpu[cpu as usize].map(|b| b.guest) == Some(guest))
        .collect::<alloc::vec::Vec<_>>()
        .into_iter()
}
