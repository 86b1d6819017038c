// SPDX-License-Identifier: Apache-2.0

//! Interface of the `/dev/sgx-step` helper driver.

use iocuddle::{Group, Ioctl, WriteRead};

/// Device node created by the helper driver.
pub const DEVICE: &str = "/dev/sgx-step";

const SGX_STEP: Group = Group::new(b'L');

/// Returns the enclave the driver is tracking.
pub const VICTIM_INFO: Ioctl<WriteRead, &VictimInfo> = unsafe { SGX_STEP.write_read(0) };

/// Walks the page tables for a virtual address.
pub const GET_PT_MAPPING: Ioctl<WriteRead, &AddressMapping> = unsafe { SGX_STEP.write_read(1) };

/// Reads enclave memory with `EDBGRD` (debug enclaves only).
pub const EDBGRD: Ioctl<WriteRead, &Edbgrd> = unsafe { SGX_STEP.write_read(2) };

/// Flushes the TLB entry of one page with `invlpg`.
pub const INVPG: Ioctl<WriteRead, &Invpg> = unsafe { SGX_STEP.write_read(3) };

/// Maps the handler section into every address space of the core.
pub const SETUP_ISR_MAP: Ioctl<WriteRead, &IsrMap> = unsafe { SGX_STEP.write_read(4) };

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VictimInfo {
    pub base: u64,
    pub size: u64,
    pub limit: u64,
    pub tcs: u64,
    pub aep: u64,
    pub erip: u64,
}

/// Physical address and page table entries for one virtual address.
///
/// Entries at levels that are not present are left zero.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressMapping {
    pub virt: u64,
    pub phys: u64,
    pub pgd: u64,
    pub p4d: u64,
    pub pud: u64,
    pub pmd: u64,
    pub pte: u64,
}

impl AddressMapping {
    pub fn new(virt: u64) -> Self {
        Self {
            virt,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Edbgrd {
    pub adrs: u64,
    pub val: u64,
    pub len: i64,
    pub write: i64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Invpg {
    pub adrs: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct IsrMap {
    pub isr_start: u64,
    pub isr_stop: u64,
}
