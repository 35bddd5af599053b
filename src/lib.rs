#![no_std]

//! Facade crate re-exporting the two-member workspace: [`hv_hal`] (hardware
//! abstraction) and [`hv_vmm`] (the guest execution engine built on it).
//! Nothing else lives here — a loader/integrator depends on `hypercore` and
//! reaches everything through these two re-exports.

pub use hv_hal;
pub use hv_vmm;
