//! Property coverage of `VmxCapabilities::make_compliant_cr0/cr4`: whatever
//! value a caller proposes, the clamped result must respect every bit the
//! fixed-0/fixed-1 MSR pair pins, regardless of what was asked for.

extern crate std;

use proptest::prelude::*;

use hv_hal::msr::{AllowedBits, VmxBasic};
use hv_vmm::vmcs_init::{EptVpidCap, VmxCapabilities};

fn caps_with_fixed_masks(cr0_fixed0: u64, cr0_fixed1: u64, cr4_fixed0: u64, cr4_fixed1: u64) -> VmxCapabilities {
    VmxCapabilities {
        basic: VmxBasic { revision_id: 0, vmcs_region_size: 0, true_controls_supported: false, memory_type: 6, ins_outs_reporting: false },
        pinbased: AllowedBits { allowed0: 0, allowed1: 0 },
        procbased: AllowedBits { allowed0: 0, allowed1: 0 },
        procbased2: AllowedBits { allowed0: 0, allowed1: 0 },
        exit_ctls: AllowedBits { allowed0: 0, allowed1: 0 },
        entry_ctls: AllowedBits { allowed0: 0, allowed1: 0 },
        cr0_fixed0,
        cr0_fixed1,
        cr4_fixed0,
        cr4_fixed1,
        ept_vpid_cap: EptVpidCap::empty(),
        vmfunc: 0,
        unrestricted_guest: false,
    }
}

proptest! {
    #[test]
    fn make_compliant_cr0_respects_fixed_masks(
        raw_fixed1 in any::<u64>(),
        raw_fixed0 in any::<u64>(),
        value in any::<u64>(),
    ) {
        // A real IA32_VMX_CR0_FIXED0/1 pair always satisfies fixed0 & !fixed1 == 0
        // (every forced-1 bit is also allowed-1); model that invariant here.
        let fixed1 = raw_fixed1;
        let fixed0 = raw_fixed0 & fixed1;
        let caps = caps_with_fixed_masks(fixed0, fixed1, 0, 0);

        let result = caps.make_compliant_cr0(value);
        prop_assert_eq!(result & !fixed1, 0, "result set a bit fixed1 forces to 0");
        prop_assert_eq!(result & fixed0, fixed0, "result cleared a bit fixed0 forces to 1");
    }

    #[test]
    fn make_compliant_cr4_respects_fixed_masks(
        raw_fixed1 in any::<u64>(),
        raw_fixed0 in any::<u64>(),
        value in any::<u64>(),
    ) {
        let fixed1 = raw_fixed1;
        let fixed0 = raw_fixed0 & fixed1;
        let caps = caps_with_fixed_masks(0, 0, fixed0, fixed1);

        let result = caps.make_compliant_cr4(value);
        prop_assert_eq!(result & !fixed1, 0);
        prop_assert_eq!(result & fixed0, fixed0);
    }
}

#[test]
fn max_gaw_level_prefers_widest_supported() {
    let mut caps = caps_with_fixed_masks(0, 0, 0, 0);
    caps.ept_vpid_cap = EptVpidCap::GAW_21;
    assert_eq!(caps.max_gaw_level(), 1);
    caps.ept_vpid_cap = EptVpidCap::GAW_21 | EptVpidCap::GAW_48;
    assert_eq!(caps.max_gaw_level(), 4);
}

#[test]
fn invept_mode_prefers_single_context() {
    let mut caps = caps_with_fixed_masks(0, 0, 0, 0);
    caps.ept_vpid_cap = EptVpidCap::INVEPT_SINGLE_CONTEXT | EptVpidCap::INVEPT_ALL_CONTEXTS;
    assert_eq!(caps.invept_mode(), Some(1));
    caps.ept_vpid_cap = EptVpidCap::INVEPT_ALL_CONTEXTS;
    assert_eq!(caps.invept_mode(), Some(2));
    caps.ept_vpid_cap = EptVpidCap::empty();
    assert_eq!(caps.invept_mode(), None);
}
