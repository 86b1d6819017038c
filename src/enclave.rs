// SPDX-License-Identifier: Apache-2.0

//! The enclave under attack.
//!
//! Enclaves are created by the (patched) SGX untrusted runtime. Everything
//! else needed about them is discovered from `/proc/self/maps`, and debug
//! enclaves can be read through `/proc/self/mem`, which the SGX driver
//! services with `EDBGRD`/`EDBGWR`.

use crate::error::{Error, Result};

use std::fs::{self, File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;

use log::{debug, info, warn};
use primordial::Page;
use sgx_step_sys::ssa::{self, gpr};

/// SGX drivers whose mappings back enclave memory.
pub const DRIVERS: [&str; 2] = ["/dev/sgx_enclave", "/dev/isgx"];

/// An enclave's contiguous mapping in this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub driver: &'static str,
    pub base: u64,
    pub limit: u64,
    /// The executable part of the mapping.
    pub exec: Option<Range<u64>>,
}

/// Finds the first enclave in the text of a `/proc/<pid>/maps` file.
///
/// Only a single, contiguously mapped enclave is supported; mappings of a
/// second enclave are ignored.
pub fn scan_maps(maps: &str) -> Result<Region> {
    let mut region: Option<Region> = None;

    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (range, perms) = match (fields.next(), fields.next()) {
            (Some(range), Some(perms)) => (range, perms),
            _ => continue,
        };

        let path = fields.nth(3).unwrap_or("");
        let driver = DRIVERS.iter().copied().find(|d| path.starts_with(d));

        let (start, end) = match range
            .split_once('-')
            .map(|(s, e)| (u64::from_str_radix(s, 16), u64::from_str_radix(e, 16)))
        {
            Some((Ok(start), Ok(end))) => (start, end),
            _ => continue,
        };

        if let Some(r) = region.as_mut() {
            if driver.is_none() || r.limit != start {
                break;
            }
            r.limit = end;
        } else if let Some(driver) = driver {
            debug!("found {} enclave at {:#x}", driver, start);
            region = Some(Region {
                driver,
                base: start,
                limit: end,
                exec: None,
            });
        } else {
            continue;
        }

        if let Some(r) = region.as_mut() {
            if perms.as_bytes().get(2) == Some(&b'x') {
                if r.exec.is_some() {
                    warn!("enclave contains more than one executable range");
                }
                r.exec = Some(start..end);
            }
        }
    }

    region.ok_or(Error::NoEnclave)
}

/// Scans the maps of the current process.
pub fn scan() -> Result<Region> {
    scan_maps(&fs::read_to_string("/proc/self/maps")?)
}

/// What the attack needs to know about a live enclave.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Info {
    pub id: u64,
    pub region: Region,
    pub tcs: u64,
    pub aep: u64,
}

impl Info {
    pub fn new(id: u64, region: Region, tcs: u64, aep: u64) -> Result<Self> {
        if !(region.base..region.limit).contains(&tcs) {
            return Err(Error::NoEnclave);
        }

        Ok(Self {
            id,
            region,
            tcs,
            aep,
        })
    }

    pub fn base(&self) -> u64 {
        self.region.base
    }

    pub fn limit(&self) -> u64 {
        self.region.limit
    }

    pub fn size(&self) -> u64 {
        self.region.limit - self.region.base
    }

    pub fn pages(&self) -> usize {
        self.size() as usize / Page::SIZE
    }

    /// Executable pages, relative to the base.
    pub fn exec_pages(&self) -> Range<usize> {
        match &self.region.exec {
            Some(exec) => {
                let page = |addr: u64| (addr - self.region.base) as usize / Page::SIZE;
                page(exec.start)..page(exec.end)
            }
            None => 0..0,
        }
    }

    pub fn log(&self) {
        info!("enclave {:#x} ({})", self.id, self.region.driver);
        info!("  base:  {:#x}", self.base());
        info!("  limit: {:#x} ({} pages)", self.limit(), self.pages());
        info!("  exec:  {} pages", self.exec_pages().len());
        info!("  tcs:   {:#x}", self.tcs);
        info!("  aep:   {:#x}", self.aep);
    }
}

/// An enclave whose asynchronous exits can be redirected.
pub trait Enclave {
    fn info(&self) -> &Info;

    /// Points future asynchronous exits at `aep`.
    fn set_aep(&mut self, aep: u64);
}

/// Debug access to enclave memory.
pub struct DebugMem(File);

impl DebugMem {
    pub fn open() -> Result<Self> {
        Ok(Self(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open("/proc/self/mem")?,
        ))
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        Ok(self.0.read_exact_at(buf, addr)?)
    }

    pub fn write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        Ok(self.0.write_all_at(buf, addr)?)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Production enclaves refuse debug reads.
    pub fn is_debug(&self, info: &Info) -> bool {
        self.read_u64(info.tcs).is_ok()
    }

    /// The GPRSGX area holding the state of the last asynchronous exit.
    pub fn gprsgx(&self, info: &Info) -> Result<u64> {
        let ossa = self.read_u64(info.tcs + ssa::TCS_OSSA)?;

        let mut cssa = [0; 4];
        self.read(info.tcs + ssa::TCS_CSSA, &mut cssa)?;
        let cssa = u32::from_le_bytes(cssa) as u64;

        ssa::gprsgx(info.base(), ossa, cssa).ok_or(Error::State("enclave has not exited"))
    }

    /// The interrupted instruction pointer inside the enclave.
    pub fn erip(&self, info: &Info) -> Result<u64> {
        self.read_u64(self.gprsgx(info)? + gpr::RIP)
    }

    /// Allows trap-flag single-stepping of the enclave's thread.
    pub fn set_debug_optin(&self, info: &Info) -> Result<()> {
        let addr = info.tcs + ssa::TCS_FLAGS;
        let flags = self.read_u64(addr)?;
        self.write_u64(addr, flags | ssa::TCS_DBGOPTIN)
    }
}

#[cfg(feature = "sgx")]
pub use self::sgx::SgxEnclave;

#[cfg(feature = "sgx")]
mod sgx {
    use super::*;

    use std::ffi::CString;
    use std::os::raw::{c_char, c_int, c_void};
    use std::path::Path;
    use std::ptr::null_mut;

    extern "C" {
        fn sgx_create_enclave(
            file: *const c_char,
            debug: c_int,
            token: *mut [u8; 1024],
            updated: *mut c_int,
            eid: *mut u64,
            misc: *mut c_void,
        ) -> u32;
        fn sgx_destroy_enclave(eid: u64) -> u32;

        // Exported by the patched untrusted runtime.
        fn sgx_set_aep(aep: *mut c_void);
        fn sgx_get_aep() -> *mut c_void;
        fn sgx_get_tcs() -> *mut c_void;
    }

    /// A debug enclave created through the untrusted runtime.
    pub struct SgxEnclave {
        info: Info,
    }

    impl SgxEnclave {
        pub fn create(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            let file = CString::new(path.as_os_str().to_string_lossy().as_bytes())
                .map_err(|_| Error::Config(format!("bad enclave path {}", path.display())))?;

            let mut token = [0u8; 1024];
            let mut updated = 0;
            let mut eid = 0;

            let status = unsafe {
                sgx_create_enclave(
                    file.as_ptr(),
                    1,
                    &mut token,
                    &mut updated,
                    &mut eid,
                    null_mut(),
                )
            };
            if status != 0 {
                return Err(Error::Sgx(status));
            }

            let (tcs, aep) = unsafe { (sgx_get_tcs() as u64, sgx_get_aep() as u64) };
            let info = match scan().and_then(|region| Info::new(eid, region, tcs, aep)) {
                Ok(info) => info,
                Err(e) => {
                    unsafe { sgx_destroy_enclave(eid) };
                    return Err(e);
                }
            };

            info.log();
            Ok(Self { info })
        }
    }

    impl Enclave for SgxEnclave {
        fn info(&self) -> &Info {
            &self.info
        }

        fn set_aep(&mut self, aep: u64) {
            unsafe { sgx_set_aep(aep as *mut c_void) };
            self.info.aep = aep;
        }
    }

    impl Drop for SgxEnclave {
        fn drop(&mut self) {
            let status = unsafe { sgx_destroy_enclave(self.info.id) };
            if status != 0 {
                warn!("failed to destroy enclave: {:#x}", status);
            }
        }
    }
}
