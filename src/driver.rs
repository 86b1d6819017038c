// SPDX-License-Identifier: Apache-2.0

//! Handle to the `/dev/sgx-step` helper driver.

use crate::error::Result;

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};

use sgx_step_sys::ioctl::{
    AddressMapping, Edbgrd, Invpg, IsrMap, VictimInfo, DEVICE, EDBGRD, GET_PT_MAPPING, INVPG,
    SETUP_ISR_MAP, VICTIM_INFO,
};

pub struct Driver(File);

impl Driver {
    pub fn open() -> Result<Self> {
        Ok(Self(
            OpenOptions::new().read(true).write(true).open(DEVICE)?,
        ))
    }

    /// The enclave registered with the driver.
    pub fn victim(&mut self) -> Result<VictimInfo> {
        let mut info = VictimInfo::default();
        VICTIM_INFO.ioctl(&mut self.0, &mut info)?;
        Ok(info)
    }

    /// Walks the page tables of the calling process for `virt`.
    pub fn mapping(&mut self, virt: u64) -> Result<AddressMapping> {
        let mut mapping = AddressMapping::new(virt);
        GET_PT_MAPPING.ioctl(&mut self.0, &mut mapping)?;
        Ok(mapping)
    }

    /// Reads eight bytes of debug enclave memory.
    pub fn edbgrd(&mut self, adrs: u64) -> Result<u64> {
        let mut req = Edbgrd {
            adrs,
            len: 8,
            ..Default::default()
        };
        EDBGRD.ioctl(&mut self.0, &mut req)?;
        Ok(req.val)
    }

    pub fn invlpg(&mut self, adrs: u64) -> Result<()> {
        INVPG.ioctl(&mut self.0, &mut Invpg { adrs })?;
        Ok(())
    }

    /// Maps `start..stop` into every address space of the current core.
    pub fn map_isr(&mut self, start: u64, stop: u64) -> Result<()> {
        let mut map = IsrMap {
            isr_start: start,
            isr_stop: stop,
        };
        SETUP_ISR_MAP.ioctl(&mut self.0, &mut map)?;
        Ok(())
    }
}

impl AsRawFd for Driver {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
