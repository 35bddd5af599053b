//! Fast View Switch: virtualizes the `vmfunc` EPTP-switching leaf (function
//! 0) so a guest can select among precomputed EPT views with no VM exit on
//! the fast path, and services the one VM exit that remains — an invalid
//! index — by report rather than by injecting a fault.

use spin::Mutex;

use hv_hal::memory::{HostMemoryManager, Hpa, Hva, MemoryProvider};
use hv_hal::vmcs::{ActiveVmcs, VmcsField};

use crate::error::{VmmError, VmmResult};
use crate::event::GcpuEvent;
use crate::gcpu::GcpuId;
use crate::ipc::{self, Destination, IpiTransport};

/// `RAX` value a guest loads before `VMFUNC` to select the EPTP-switching
/// leaf (function 0 is the only function this hardware feature defines).
pub const FAST_VIEW_SWITCH_LEAF: u64 = 0;

const ENTRIES_PER_LIST: usize = 512;
const VMFUNC_EXIT_REASON: u32 = 59;

/// One host CPU's 4 KiB EPTP list: 512 nonzero-or-empty EPTP slots, indexed
/// by the view index a guest's `VMFUNC` call names in `RCX`. Backed by a
/// page from the host's [`MemoryProvider`] rather than the Rust global
/// allocator — accessed through raw volatile reads/writes, the same
/// discipline [`crate::mam::convert`] uses for rendered page tables.
pub struct EptpList {
    page_hva: Hva,
    page_hpa: Hpa,
}

impl EptpList {
    pub fn allocate(provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> VmmResult<Self> {
        let page_hva = provider.alloc_page(1).ok_or(VmmError::OutOfMemory)?;
        let page_hpa = hmm.hva_to_hpa(page_hva).ok_or(VmmError::OutOfMemory)?;
        Ok(Self { page_hva, page_hpa })
    }

    pub fn page_hpa(&self) -> Hpa {
        self.page_hpa
    }

    fn slot_ptr(&self, index: usize) -> Option<*mut u64> {
        if index >= ENTRIES_PER_LIST {
            return None;
        }
        Some((self.page_hva as *mut u64).wrapping_add(index))
    }

    fn read_slot(&self, index: usize) -> Option<u64> {
        let ptr = self.slot_ptr(index)?;
        Some(unsafe { core::ptr::read_volatile(ptr) })
    }

    fn write_slot(&self, index: usize, value: u64) {
        if let Some(ptr) = self.slot_ptr(index) {
            unsafe { core::ptr::write_volatile(ptr, value) };
        }
    }

    /// Add or overwrite the entry at `index`. Per spec this is the only
    /// operation allowed to populate a previously-empty slot.
    pub fn add_entry(&mut self, index: usize, eptp: u64) -> VmmResult<()> {
        if index >= ENTRIES_PER_LIST {
            return Err(VmmError::InvalidId);
        }
        self.write_slot(index, eptp);
        Ok(())
    }

    /// Update an already-populated entry; never creates one.
    pub fn update_entry(&mut self, index: usize, eptp: u64) -> VmmResult<()> {
        match self.read_slot(index) {
            Some(0) => Err(VmmError::InvalidConfiguration),
            Some(_) => {
                self.write_slot(index, eptp);
                Ok(())
            }
            None => Err(VmmError::InvalidId),
        }
    }

    pub fn delete_entry(&mut self, index: usize) -> VmmResult<()> {
        if index >= ENTRIES_PER_LIST {
            return Err(VmmError::InvalidId);
        }
        self.write_slot(index, 0);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        self.read_slot(index).filter(|&v| v != 0)
    }
}

/// Per-guest FVS descriptor: one list per host CPU bound to this guest,
/// indexed by host CPU id, plus whether FVS is currently enabled.
pub struct FvsDescriptor {
    lists: Mutex<alloc::collections::BTreeMap<u32, EptpList>>,
    enabled: Mutex<bool>,
}

impl FvsDescriptor {
    pub fn new() -> Self {
        Self { lists: Mutex::new(alloc::collections::BTreeMap::new()), enabled: Mutex::new(false) }
    }

    pub fn ensure_list(&self, host_cpu: u32, provider: &dyn MemoryProvider, hmm: &dyn HostMemoryManager) -> VmmResult<()> {
        let mut lists = self.lists.lock();
        if !lists.contains_key(&host_cpu) {
            lists.insert(host_cpu, EptpList::allocate(provider, hmm)?);
        }
        Ok(())
    }

    pub fn add_entry_to_eptp_list(&self, host_cpu: u32, index: usize, eptp: u64) -> VmmResult<()> {
        let mut lists = self.lists.lock();
        lists.get_mut(&host_cpu).ok_or(VmmError::InvalidId)?.add_entry(index, eptp)
    }

    pub fn update_entry_in_list(&self, host_cpu: u32, index: usize, eptp: u64) -> VmmResult<()> {
        let mut lists = self.lists.lock();
        lists.get_mut(&host_cpu).ok_or(VmmError::InvalidId)?.update_entry(index, eptp)
    }

    pub fn delete_entry(&self, host_cpu: u32, index: usize) -> VmmResult<()> {
        let mut lists = self.lists.lock();
        lists.get_mut(&host_cpu).ok_or(VmmError::InvalidId)?.delete_entry(index)
    }

    pub fn list_hpa(&self, host_cpu: u32) -> Option<Hpa> {
        self.lists.lock().get(&host_cpu).map(|l| l.page_hpa())
    }

    pub fn lookup(&self, host_cpu: u32, index: usize) -> Option<u64> {
        self.lists.lock().get(&host_cpu).and_then(|l| l.get(index))
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }
}

impl Default for FvsDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

const VMFUNC_LEAF0: u64 = 1 << 0;

/// Enable FVS on the calling CPU: point `VMFUNC_EPTP_LIST_ADDRESS` at this
/// CPU's list and set the function-0 bit in `VM_FUNCTION_CONTROL`.
pub fn enable_local(active: &mut ActiveVmcs, descriptor: &FvsDescriptor, host_cpu: u32) -> VmmResult<()> {
    let list_hpa = descriptor.list_hpa(host_cpu).ok_or(VmmError::InvalidId)?;
    active.write(VmcsField::EPTP_LIST_ADDRESS, list_hpa);
    let ctl = active.read(VmcsField::VM_FUNCTION_CONTROL);
    active.write(VmcsField::VM_FUNCTION_CONTROL, ctl | VMFUNC_LEAF0);
    *descriptor.enabled.lock() = true;
    Ok(())
}

pub fn disable_local(active: &mut ActiveVmcs, descriptor: &FvsDescriptor) {
    let ctl = active.read(VmcsField::VM_FUNCTION_CONTROL);
    active.write(VmcsField::VM_FUNCTION_CONTROL, ctl & !VMFUNC_LEAF0);
    *descriptor.enabled.lock() = false;
}

fn enable_handler(arg: usize) {
    let _ = arg;
}

/// Enable FVS globally: every host CPU bound to the guest runs
/// [`enable_local`] synchronously via the IPC barrier. `local` performs the
/// caller's own enable (the IPC layer only re-dispatches the handler on
/// remote CPUs).
pub fn enable_global(transport: &dyn IpiTransport, caller_cpu: u32, local: impl FnOnce()) {
    local();
    ipc::execute_handler_sync(transport, caller_cpu, Destination::AllExcludingSelf, enable_handler, 0);
}

/// VM-exit handler for `VMCALL`/`VMFUNC` with `rax = FAST_VIEW_SWITCH_LEAF`.
/// `rcx` names the target view index. Returns `Ok(true)` when handled (RIP
/// must be advanced by the caller), `Ok(false)` when this exit was not an
/// FVS call at all.
pub fn handle_vmfunc_exit(gcpu: GcpuId, active: &mut ActiveVmcs, descriptor: &FvsDescriptor, host_cpu: u32, exit_reason: u32, rax: u64, rcx: u64) -> VmmResult<bool> {
    if exit_reason != VMFUNC_EXIT_REASON || rax != FAST_VIEW_SWITCH_LEAF {
        return Ok(false);
    }

    match descriptor.lookup(host_cpu, rcx as usize) {
        Some(eptp) => {
            active.write(VmcsField::EPT_POINTER, eptp);
            Ok(true)
        }
        None => {
            crate::event::dispatch(gcpu, &GcpuEvent::InvalidFastViewSwitch { index: rcx });
            Ok(true)
        }
    }
}
