// SPDX-License-Identifier: Apache-2.0

//! Platform support checks shown by `sgx-step info`.

use std::arch::x86_64::{CpuidResult, __cpuid_count};
use std::ffi::CStr;
use std::fs::OpenOptions;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::c_char;
use std::path::Path;

use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Datum {
    /// The name of this datum.
    pub name: String,

    /// Whether the datum indicates support for the platform or not.
    pub pass: bool,

    /// Short additional information to display to the user.
    pub info: Option<String>,

    /// Longer explanatory message on how to resolve problems.
    pub mesg: Option<String>,
}

pub struct CpuId {
    pub name: &'static str,
    pub leaf: u32,
    pub subl: u32,
    pub func: fn(CpuidResult) -> (bool, Option<String>),
}

impl CpuId {
    fn bit(reg: u32, bit: u32) -> (bool, Option<String>) {
        (reg & (1 << bit) != 0, None)
    }

    fn vendor(res: CpuidResult) -> (bool, Option<String>) {
        let bytes: Vec<u8> = [res.ebx, res.edx, res.ecx]
            .iter()
            .flat_map(|r| r.to_le_bytes())
            .collect();
        let name = String::from_utf8_lossy(&bytes).into_owned();
        (name == "GenuineIntel", Some(name))
    }
}

impl From<&CpuId> for Datum {
    fn from(cpuid: &CpuId) -> Datum {
        let max = unsafe { __cpuid_count(0x00000000, 0x00000000) }.eax;

        let (pass, info) = if cpuid.leaf <= max {
            (cpuid.func)(unsafe { __cpuid_count(cpuid.leaf, cpuid.subl) })
        } else {
            (false, None)
        };

        Datum {
            name: cpuid.name.into(),
            mesg: None,
            pass,
            info,
        }
    }
}

pub const CPUIDS: &[CpuId] = &[
    CpuId {
        name: "CPU",
        leaf: 0x00000000,
        subl: 0x00000000,
        func: CpuId::vendor,
    },
    CpuId {
        name: " SGX Support",
        leaf: 0x00000007,
        subl: 0x00000000,
        func: |res| CpuId::bit(res.ebx, 2),
    },
    CpuId {
        name: "  Version 1",
        leaf: 0x00000012,
        subl: 0x00000000,
        func: |res| CpuId::bit(res.eax, 0),
    },
    CpuId {
        name: "  Version 2",
        leaf: 0x00000012,
        subl: 0x00000000,
        func: |res| CpuId::bit(res.eax, 1),
    },
    CpuId {
        name: "  EDECCSSA",
        leaf: 0x00000012,
        subl: 0x00000000,
        func: |res| CpuId::bit(res.eax, 11),
    },
    CpuId {
        name: "  AEX-Notify",
        leaf: 0x00000012,
        subl: 0x00000001,
        func: |res| CpuId::bit(res.eax, 10),
    },
    CpuId {
        name: " TSC-Deadline Timer",
        leaf: 0x00000001,
        subl: 0x00000000,
        func: |res| CpuId::bit(res.ecx, 24),
    },
    CpuId {
        name: " x2APIC",
        leaf: 0x00000001,
        subl: 0x00000000,
        func: |res| {
            let x2apic = res.ecx & (1 << 21) != 0;
            (true, Some(if x2apic { "available" } else { "absent" }.into()))
        },
    },
];

fn humanize(mut size: f64) -> (f64, &'static str) {
    let mut iter = 0;

    while size > 512.0 && iter < 4 {
        size /= 1024.0;
        iter += 1;
    }

    let suffix = match iter {
        0 => "",
        1 => "KiB",
        2 => "MiB",
        3 => "GiB",
        _ => "TiB",
    };

    (size, suffix)
}

pub fn epc_size() -> Datum {
    let max = unsafe { __cpuid_count(0x00000000, 0x00000000) }.eax;
    let mut pass = false;
    let mut info = None;

    if max >= 0x00000012 {
        let mut size = 0;

        for i in 2.. {
            let result = unsafe { __cpuid_count(0x00000012, i) };
            if result.eax & 0xf != 1 {
                break;
            }

            let low = result.ecx as u64 & 0xfffff000;
            let high = result.edx as u64 & 0x000fffff;
            size += high << 12 | low;
        }

        let (n, s) = humanize(size as f64);
        info = Some(format!("{:.0} {}", n, s));
        pass = size > 0;
    }

    Datum {
        name: "  EPC Size".into(),
        mesg: None,
        pass,
        info,
    }
}

/// Whether `path` can be opened for reading and writing.
pub fn device(name: &str, path: impl AsRef<Path>, mesg: &str) -> Datum {
    let path = path.as_ref();
    let result = OpenOptions::new().read(true).write(true).open(path);

    Datum {
        name: name.into(),
        pass: result.is_ok(),
        info: Some(path.display().to_string()),
        mesg: result.err().map(|e| format!("{mesg} ({e})")),
    }
}

/// The SGX driver: the in-tree node, or the out-of-tree one older SDKs use.
pub fn sgx_driver() -> Datum {
    let intree = device("SGX Driver", "/dev/sgx_enclave", "");
    if intree.pass {
        return Datum { mesg: None, ..intree };
    }

    let legacy = device("SGX Driver", "/dev/isgx", "");
    Datum {
        mesg: (!legacy.pass).then(|| "Load the in-kernel or out-of-tree SGX driver.".into()),
        ..legacy
    }
}

pub fn system_info() -> Datum {
    fn array_to_str(array: &[c_char]) -> String {
        unsafe { CStr::from_ptr(array.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    let mut utsname = MaybeUninit::<libc::utsname>::uninit();

    let info = if unsafe { libc::uname(utsname.as_mut_ptr()) } != 0 {
        format!("[{}]", io::Error::last_os_error())
    } else {
        let utsname = unsafe { utsname.assume_init() };
        format!(
            "{} {} {}",
            array_to_str(&utsname.sysname),
            array_to_str(&utsname.release),
            array_to_str(&utsname.machine),
        )
    };

    Datum {
        name: "System Info".into(),
        pass: true,
        info: Some(info),
        mesg: None,
    }
}

/// Everything a stepping run needs, in display order.
pub fn data() -> Vec<Datum> {
    let mut data = vec![system_info()];
    data.extend(CPUIDS.iter().map(Datum::from));
    data.push(epc_size());
    data.push(sgx_driver());
    data.push(device(
        "Step Driver",
        sgx_step_sys::ioctl::DEVICE,
        "Load the sgx-step kernel module.",
    ));
    data.push(device(
        "Physical Memory",
        "/dev/mem",
        "Run as root on a kernel without STRICT_DEVMEM.",
    ));
    data
}
