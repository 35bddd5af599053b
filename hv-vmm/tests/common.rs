//! Shared test doubles: a host heap-backed `MemoryProvider`/`HostMemoryManager`
//! pair standing in for the loader allocator and HMM, used by every
//! integration test file that needs to render a tree or allocate a page.

extern crate std;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::Mutex;
use std::vec::Vec;

use hv_hal::memory::{Gpa, HmmFlags, HostMemoryManager, Hpa, Hva, MemoryProvider};
use hv_vmm::int15::GuestMemoryAccess;

/// Backs every allocation with a real heap page so raw volatile reads/writes
/// into the rendered tree see real memory. Host physical addresses are
/// simply the host virtual address the allocator handed back: nothing in
/// these tests cares about an actual identity-mapped/host-mapped distinction.
pub struct DummyProvider {
    live: Mutex<HashMap<Hva, Layout>>,
}

impl DummyProvider {
    pub fn new() -> Self {
        Self { live: Mutex::new(HashMap::new()) }
    }
}

impl MemoryProvider for DummyProvider {
    fn alloc(&self, size: usize) -> Option<Hva> {
        let layout = Layout::from_size_align(size.max(1), 8).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let hva = ptr as Hva;
        self.live.lock().unwrap().insert(hva, layout);
        Some(hva)
    }

    fn alloc_page(&self, n: usize) -> Option<Hva> {
        let layout = Layout::from_size_align(n * 0x1000, 0x1000).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let hva = ptr as Hva;
        self.live.lock().unwrap().insert(hva, layout);
        Some(hva)
    }

    fn free(&self, p: Hva) {
        if let Some(layout) = self.live.lock().unwrap().remove(&p) {
            unsafe { dealloc(p as *mut u8, layout) };
        }
    }
}

impl Default for DummyProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity HVA<->HPA translation; `map`/`unmap` are no-ops returning the
/// same identity since no test exercises the host's own page tables.
pub struct DummyHmm;

impl HostMemoryManager for DummyHmm {
    fn hva_to_hpa(&self, hva: Hva) -> Option<Hpa> {
        Some(hva)
    }

    fn hpa_to_hva(&self, hpa: Hpa) -> Option<Hva> {
        Some(hpa)
    }

    fn map(&self, hpa: Hpa, _flags: HmmFlags) -> Option<Hva> {
        Some(hpa)
    }

    fn unmap(&self, _hva: Hva) {}
}

/// A flat guest-memory backing buffer for INT15h handshake tests:
/// `linear_to_hva` resolves any in-bounds linear address to a pointer into
/// the buffer, matching a loader's real-mode low-memory identity mapping.
pub struct FlatGuestMemory {
    pub buf: Mutex<Vec<u8>>,
}

impl FlatGuestMemory {
    pub fn new(size: usize) -> Self {
        Self { buf: Mutex::new(std::vec![0u8; size]) }
    }

    pub fn base(&self) -> u64 {
        self.buf.lock().unwrap().as_ptr() as u64
    }
}

impl GuestMemoryAccess for FlatGuestMemory {
    fn linear_to_hva(&self, linear: Gpa) -> Option<Hva> {
        let buf = self.buf.lock().unwrap();
        if (linear as usize) < buf.len() {
            Some(buf.as_ptr() as u64 + linear)
        } else {
            None
        }
    }
}
