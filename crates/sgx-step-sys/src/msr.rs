// SPDX-License-Identifier: Apache-2.0

//! Model specific registers and local APIC register offsets.

pub const IA32_APIC_BASE: u32 = 0x0000_001B;
pub const IA32_TSC_DEADLINE: u32 = 0x0000_06E0;

/// Bits of `IA32_APIC_BASE` holding the physical MMIO page.
pub const APIC_BASE_MASK: u64 = 0x000f_ffff_ffff_f000;
pub const APIC_BASE_ENABLE: u64 = 1 << 11;
pub const APIC_BASE_X2APIC: u64 = 1 << 10;

/// Local APIC MMIO register offsets.
pub mod apic {
    pub const ID: u32 = 0x020;
    pub const EOI: u32 = 0x0B0;
    pub const LVTT: u32 = 0x320;
    pub const TMICT: u32 = 0x380;
    pub const TMCCT: u32 = 0x390;
    pub const TDCR: u32 = 0x3E0;

    pub const LVT_MASKED: u32 = 1 << 16;
    pub const LVTT_ONESHOT: u32 = 0b00 << 17;
    pub const LVTT_PERIODIC: u32 = 0b01 << 17;
    pub const LVTT_TSC_DEADLINE: u32 = 0b10 << 17;
    pub const LVTT_MODE_MASK: u32 = 0b11 << 17;
}
