//! Lock-free ring-buffer logging, mirroring the UART-optional approach used
//! at the lower layer: no external `log` crate, just a fixed buffer and a
//! handful of macros. Readable by a debugger attached to a stalled core
//! without any cooperation from the engine.

#![allow(dead_code)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

const LOG_BUF_SIZE: usize = 64 * 1024;
static mut LOG_BUFFER: [u8; LOG_BUF_SIZE] = [0; LOG_BUF_SIZE];
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

const UART_BASE: u16 = 0x3F8;

#[inline(always)]
fn uart_write_byte(byte: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") UART_BASE, in("al") byte, options(nomem, nostack, preserves_flags));
    }
}

pub struct RingBufferWriter;

impl Write for RingBufferWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    unsafe {
        LOG_BUFFER[pos] = b;
    }
    uart_write_byte(b);
}

/// Write a `[<tsc>] ` timestamp prefix ahead of a log line.
#[doc(hidden)]
pub fn write_timestamp(w: &mut RingBufferWriter) {
    let _ = write!(w, "[{}] ", hv_hal::cycles::rdtsc());
}

/// Informational logging.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        $crate::log::write_timestamp(&mut $crate::log::RingBufferWriter);
        let _ = core::fmt::write(&mut $crate::log::RingBufferWriter, format_args!($($arg)*));
        let _ = $crate::log::RingBufferWriter.write_str("\r\n");
    }};
}

/// Logging for recoverable anomalies: masked capability mismatches, guest
/// faults injected rather than propagated, and similar non-fatal paths.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        $crate::log::write_timestamp(&mut $crate::log::RingBufferWriter);
        let _ = $crate::log::RingBufferWriter.write_str("WARN: ");
        let _ = core::fmt::write(&mut $crate::log::RingBufferWriter, format_args!($($arg)*));
        let _ = $crate::log::RingBufferWriter.write_str("\r\n");
    }};
}

/// Log the message, then halt the core forever. The only response the
/// engine has to a condition it cannot safely continue past — invariant
/// violations, VMX instruction failures with no recovery path, allocator
/// exhaustion during a structure the guest already depends on.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        $crate::log::write_timestamp(&mut $crate::log::RingBufferWriter);
        let _ = $crate::log::RingBufferWriter.write_str("FATAL: ");
        let _ = core::fmt::write(&mut $crate::log::RingBufferWriter, format_args!($($arg)*));
        let _ = $crate::log::RingBufferWriter.write_str("\r\n");
        hv_hal::cpu::deadloop()
    }};
}

/// Expose the log buffer for external tools (read-only).
pub fn get_buffer() -> &'static [u8; LOG_BUF_SIZE] {
    unsafe { &LOG_BUFFER }
}
