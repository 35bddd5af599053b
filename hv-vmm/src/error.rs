//! Errors the guest execution engine can report to its caller. Anything not
//! representable as a `Result` — a violated internal invariant, an
//! unrecoverable VMX instruction failure — goes through `fatal!` instead and
//! never reaches this type.

use hv_hal::VmcsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// A guest or host CPU id past the configured entity table bound.
    InvalidId,
    /// The memory-address mapper has no mapping for the requested range.
    UnmappedRange,
    /// A mapper insert could not complete because the page allocator is out
    /// of tables; it may have partially succeeded (see `mam` module docs).
    OutOfMemory,
    /// A requested VMCS control bit is not supported by this CPU's
    /// capability MSRs and cannot be silently adjusted away.
    UnsupportedControl,
    /// A startup-structure or policy field failed validation.
    InvalidConfiguration,
    Vmcs(VmcsError),
}

impl From<VmcsError> for VmmError {
    fn from(e: VmcsError) -> Self {
        VmmError::Vmcs(e)
    }
}

pub type VmmResult<T> = Result<T, VmmError>;
