//! Typed event dispatch: a fixed-size dispatch table per event kind in
//! place of a function-pointer virtual table of observers. Handlers are
//! registered once at boot, run in registration order, and run to
//! completion before the next handler starts — there is no runtime
//! registration/deregistration and therefore no need for a lock broader
//! than the one around the table itself.
//!
//! Handlers receive the event's `GcpuId` so a handler registered globally
//! can still scope itself to a particular guest or gcpu by inspecting it;
//! this collapses global/per-guest/per-gcpu scoping onto one table per
//! kind rather than three physical tables, since nothing here needs
//! runtime (de)registration to tell them apart.

use heapless::Vec as HVec;
use spin::Mutex;

use crate::gcpu::GcpuId;

const MAX_HANDLERS: usize = 8;

/// Payload carried by each tracked event.
#[derive(Debug, Clone, Copy)]
pub enum GcpuEvent {
    AfterGuestCr0Write { old: u64, new: u64 },
    AfterGuestCr3Write { new: u64 },
    AfterGuestCr4Write { old: u64, new: u64 },
    EmulatorAsGuestEnter,
    EmulatorAsGuestLeave,
    EptViolation { gpa: u64, qualification: u64, idt_vectoring_valid: bool, nmi_unblocking: bool },
    EptMisconfiguration { gpa: u64, eptp: u64 },
    ActivityStateChanged { old: ActivityState, new: ActivityState },
    InvalidFastViewSwitch { index: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Active,
    Halt,
    WaitForSipi,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum EventKind {
    AfterGuestCr0Write,
    AfterGuestCr3Write,
    AfterGuestCr4Write,
    EmulatorAsGuestEnter,
    EmulatorAsGuestLeave,
    EptViolation,
    EptMisconfiguration,
    ActivityStateChanged,
    InvalidFastViewSwitch,
}

const KIND_COUNT: usize = 9;

impl GcpuEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GcpuEvent::AfterGuestCr0Write { .. } => EventKind::AfterGuestCr0Write,
            GcpuEvent::AfterGuestCr3Write { .. } => EventKind::AfterGuestCr3Write,
            GcpuEvent::AfterGuestCr4Write { .. } => EventKind::AfterGuestCr4Write,
            GcpuEvent::EmulatorAsGuestEnter => EventKind::EmulatorAsGuestEnter,
            GcpuEvent::EmulatorAsGuestLeave => EventKind::EmulatorAsGuestLeave,
            GcpuEvent::EptViolation { .. } => EventKind::EptViolation,
            GcpuEvent::EptMisconfiguration { .. } => EventKind::EptMisconfiguration,
            GcpuEvent::ActivityStateChanged { .. } => EventKind::ActivityStateChanged,
            GcpuEvent::InvalidFastViewSwitch { .. } => EventKind::InvalidFastViewSwitch,
        }
    }
}

pub type Handler = fn(GcpuId, &GcpuEvent);

struct Tables {
    by_kind: [HVec<Handler, MAX_HANDLERS>; KIND_COUNT],
}

static TABLES: Mutex<Tables> = Mutex::new(Tables {
    by_kind: [
        HVec::new(),
        HVec::new(),
        HVec::new(),
        HVec::new(),
        HVec::new(),
        HVec::new(),
        HVec::new(),
        HVec::new(),
        HVec::new(),
    ],
});

/// Register `handler` to run for every event of `kind`. Called only during
/// boot, before any gcpu is resumed for the first time — no synchronization
/// is needed beyond the table's own lock, since registration never races
/// with dispatch in practice.
pub fn register(kind: EventKind, handler: Handler) {
    let mut tables = TABLES.lock();
    let _ = tables.by_kind[kind as usize].push(handler);
}

/// Run every handler registered for `event.kind()`, in registration order,
/// to completion, on the calling host CPU. The table is snapshotted and the
/// lock released before any handler runs, since handlers may themselves
/// raise further events (e.g. an EPT-violation handler that ends up
/// touching CR0) and the table lock is not reentrant.
pub fn dispatch(gcpu: GcpuId, event: &GcpuEvent) {
    let snapshot: HVec<Handler, MAX_HANDLERS> = TABLES.lock().by_kind[event.kind() as usize].clone();
    for handler in snapshot.iter() {
        handler(gcpu, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    static FIRST_ORDER: AtomicU32 = AtomicU32::new(0);
    static SECOND_ORDER: AtomicU32 = AtomicU32::new(0);
    static SEQ: AtomicU32 = AtomicU32::new(0);
    static LAST_GPA: AtomicU64 = AtomicU64::new(0);

    fn first_handler(_gcpu: GcpuId, event: &GcpuEvent) {
        FIRST_ORDER.store(SEQ.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        if let GcpuEvent::EptMisconfiguration { gpa, .. } = event {
            LAST_GPA.store(*gpa, Ordering::SeqCst);
        }
    }

    fn second_handler(_gcpu: GcpuId, _event: &GcpuEvent) {
        SECOND_ORDER.store(SEQ.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
    }

    /// This event kind is not used by any other test in this module, so
    /// the shared global table for it stays exclusively owned here.
    #[test]
    fn handlers_run_in_registration_order_with_the_dispatched_event() {
        register(EventKind::EptMisconfiguration, first_handler);
        register(EventKind::EptMisconfiguration, second_handler);

        let gcpu = GcpuId { guest: crate::guest::GuestId(0), index: 0 };
        dispatch(gcpu, &GcpuEvent::EptMisconfiguration { gpa: 0xdead_b000, eptp: 0 });

        assert!(FIRST_ORDER.load(Ordering::SeqCst) < SECOND_ORDER.load(Ordering::SeqCst));
        assert_eq!(LAST_GPA.load(Ordering::SeqCst), 0xdead_b000);
    }

    #[test]
    fn event_kind_matches_its_variant() {
        assert_eq!(GcpuEvent::EmulatorAsGuestEnter.kind(), EventKind::EmulatorAsGuestEnter);
        assert_eq!(GcpuEvent::InvalidFastViewSwitch { index: 3 }.kind(), EventKind::InvalidFastViewSwitch);
    }
}
