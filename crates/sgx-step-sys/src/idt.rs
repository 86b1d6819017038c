// SPDX-License-Identifier: Apache-2.0

//! Interrupt descriptor table layout.

/// Number of vectors in a 64-bit IDT.
pub const VECTORS: usize = 256;

/// Vectors below this are reserved for CPU exceptions.
pub const FIRST_EXTERNAL: u8 = 32;

/// Gate type field values for 64-bit descriptors.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GateType {
    Interrupt = 0xE,
    Trap = 0xF,
}

/// A 16-byte 64-bit mode gate descriptor.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

const _: () = assert!(core::mem::size_of::<IdtEntry>() == 16);

impl IdtEntry {
    const PRESENT: u8 = 1 << 7;

    /// Creates a present gate pointing at `handler`.
    pub const fn new(handler: u64, selector: u16, kind: GateType, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: 0,
            attr: Self::PRESENT | (dpl & 3) << 5 | kind as u8,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn handler(&self) -> u64 {
        let low = self.offset_low as u64;
        let mid = self.offset_mid as u64;
        let high = self.offset_high as u64;
        high << 32 | mid << 16 | low
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn present(&self) -> bool {
        self.attr & Self::PRESENT != 0
    }

    /// Descriptor privilege level: the lowest privilege allowed to raise
    /// this vector with a software interrupt.
    pub fn dpl(&self) -> u8 {
        (self.attr >> 5) & 3
    }

    pub fn gate_type(&self) -> Option<GateType> {
        match self.attr & 0xF {
            0xE => Some(GateType::Interrupt),
            0xF => Some(GateType::Trap),
            _ => None,
        }
    }
}

impl core::fmt::Debug for IdtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdtEntry")
            .field("handler", &format_args!("{:#x}", self.handler()))
            .field("selector", &format_args!("{:#x}", self.selector()))
            .field("present", &self.present())
            .field("dpl", &self.dpl())
            .field("type", &self.gate_type())
            .finish()
    }
}

/// Addresses of the privileged entry points a gate set points at.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Handlers {
    pub timer: u64,
    pub call: u64,
    pub rdmsr: u64,
    pub wrmsr: u64,
}

/// The operand of `sidt`.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u64,
}

impl DescriptorTablePointer {
    /// Number of descriptors covered by the limit.
    pub fn entries(&self) -> usize {
        (self.limit as usize + 1) / core::mem::size_of::<IdtEntry>()
    }
}

/// Reads the IDT register of the current core.
///
/// `sidt` is available to user space unless UMIP is enabled, in which case
/// the kernel emulates it with a dummy base.
#[cfg(target_arch = "x86_64")]
pub fn sidt() -> DescriptorTablePointer {
    let mut dtp = DescriptorTablePointer::default();
    unsafe {
        core::arch::asm!(
            "sidt [{}]",
            in(reg) &mut dtp,
            options(nostack, preserves_flags)
        );
    }
    dtp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode() {
        let entry = IdtEntry::new(0xffff_8000_dead_beef, 0x10, GateType::Interrupt, 3);
        assert_eq!(entry.handler(), 0xffff_8000_dead_beef);
        assert_eq!(entry.selector(), 0x10);
        assert!(entry.present());
        assert_eq!(entry.dpl(), 3);
        assert_eq!(entry.gate_type(), Some(GateType::Interrupt));
    }

    #[test]
    fn empty() {
        let entry = IdtEntry::default();
        assert!(!entry.present());
        assert_eq!(entry.dpl(), 0);
        assert_eq!(entry.gate_type(), None);
    }

    #[test]
    fn limit() {
        let dtp = DescriptorTablePointer {
            limit: 4095,
            base: 0,
        };
        assert_eq!(dtp.entries(), VECTORS);
    }
}
