//! `StartupStruct::from_loader` must reject any version other than the one
//! this build understands before trusting a single other field, since an
//! unrecognized layout cannot be safely deep-copied.

extern crate std;

use hv_vmm::error::VmmError;
use hv_vmm::policy::{CpuAffinity, DebugParams, GuestFlags};
use hv_vmm::startup::{GuestStartup, MemoryLayout, RawStartupReader, StartupStruct, VersionHeader, SUPPORTED_VERSION};

struct Fixture {
    version: u16,
}

fn empty_guest() -> GuestStartup {
    GuestStartup {
        flags: GuestFlags::empty(),
        magic: 0x1bad_b002,
        affinity: CpuAffinity::All,
        cpu_states: std::vec::Vec::new(),
        devices: std::vec::Vec::new(),
        image: MemoryLayout::default(),
        physical_memory_size: 0,
        load_gpa_offset: 0,
    }
}

impl RawStartupReader for Fixture {
    fn header(&self) -> VersionHeader {
        VersionHeader { size: 0, version: self.version }
    }

    fn read(&self) -> hv_vmm::error::VmmResult<StartupStruct> {
        Ok(StartupStruct {
            number_of_host_cpus: 1,
            post_os_launch: false,
            acpi_discovery_capable: false,
            debug_params: DebugParams::default(),
            mon_image: MemoryLayout::default(),
            thunk_image: MemoryLayout::default(),
            e820: std::vec::Vec::new(),
            primary_guest: empty_guest(),
            secondary_guests: std::vec::Vec::new(),
            local_apic_ids: std::vec![0],
            int15_handler_slot: None,
        })
    }
}

#[test]
fn supported_version_is_accepted() {
    let fixture = Fixture { version: SUPPORTED_VERSION };
    let startup = StartupStruct::from_loader(&fixture).unwrap();
    assert_eq!(startup.number_of_host_cpus, 1);
    assert_eq!(startup.primary_guest.magic, 0x1bad_b002);
}

#[test]
fn unsupported_version_is_rejected_before_read() {
    let fixture = Fixture { version: SUPPORTED_VERSION + 1 };
    let err = StartupStruct::from_loader(&fixture).unwrap_err();
    assert_eq!(err, VmmError::InvalidConfiguration);
}
