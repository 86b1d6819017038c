// SPDX-License-Identifier: Apache-2.0

//! Memory shared between the privileged handlers and the host thread.
//!
//! The handlers run with interrupts disabled and cannot take locks, so the
//! data they touch is plain `#[repr(C)]` memory accessed with volatile
//! loads and stores. All of it lives in the `sgx_step_isr` section, which
//! the driver maps into every address space of the pinned core.

use core::cell::UnsafeCell;
use core::ptr::{read_volatile, write_volatile};

/// A cell that both Rust code and hand-written assembly may touch.
#[repr(transparent)]
pub struct Shared<T: Copy>(UnsafeCell<T>);

// SAFETY: every access is a single volatile load or store of a `Copy` value,
// and the only concurrent writer is the interrupt handler on the same core.
unsafe impl<T: Copy> Sync for Shared<T> {}

impl<T: Copy> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    #[inline]
    pub fn get(&self) -> T {
        unsafe { read_volatile(self.0.get()) }
    }

    #[inline]
    pub fn set(&self, value: T) {
        unsafe { write_volatile(self.0.get(), value) }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.0.get()
    }
}

/// What the timer handler saw the last time it fired.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IrqRecord {
    /// Number of times the timer handler has run.
    pub fired: u64,
    /// Serialized time stamp counter at handler entry.
    pub tsc: u64,
    /// Interrupted instruction pointer from the interrupt frame.
    pub rip: u64,
    /// Privilege level of the interrupted code segment.
    pub cpl: u64,
}

impl IrqRecord {
    pub const FIRED: usize = 0;
    pub const TSC: usize = 8;
    pub const RIP: usize = 16;
    pub const CPL: usize = 24;
}

const _: () = assert!(core::mem::size_of::<IrqRecord>() == 32);

/// Function-pointer slots consulted by the AEP trampoline.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AepSlots {
    /// `extern "C" fn()` invoked before every resume, or zero.
    pub dispatch: usize,
    /// Number of resumes issued by the trampoline.
    pub resumes: u64,
}

impl AepSlots {
    pub const DISPATCH: usize = 0;
    pub const RESUMES: usize = 8;
}

/// Written by the timer handler.
#[link_section = "sgx_step_isr"]
pub static IRQ: Shared<IrqRecord> = Shared::new(IrqRecord {
    fired: 0,
    tsc: 0,
    rip: 0,
    cpl: 0,
});

/// Virtual address of the memory-mapped local APIC, used for EOI.
#[link_section = "sgx_step_isr"]
pub static APIC: Shared<u64> = Shared::new(0);

/// Read by the AEP trampoline.
#[link_section = "sgx_step_isr"]
pub static AEP: Shared<AepSlots> = Shared::new(AepSlots {
    dispatch: 0,
    resumes: 0,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets() {
        let rec = IrqRecord::default();
        let base = &rec as *const _ as usize;
        assert_eq!(&rec.fired as *const _ as usize - base, IrqRecord::FIRED);
        assert_eq!(&rec.tsc as *const _ as usize - base, IrqRecord::TSC);
        assert_eq!(&rec.rip as *const _ as usize - base, IrqRecord::RIP);
        assert_eq!(&rec.cpl as *const _ as usize - base, IrqRecord::CPL);

        let slots = AepSlots::default();
        let base = &slots as *const _ as usize;
        assert_eq!(
            &slots.resumes as *const _ as usize - base,
            AepSlots::RESUMES
        );
    }

    #[test]
    fn shared_cell() {
        let cell = Shared::new(7u64);
        assert_eq!(cell.get(), 7);
        cell.set(9);
        assert_eq!(cell.get(), 9);
        assert_eq!(unsafe { *cell.as_ptr() }, 9);
    }
}
