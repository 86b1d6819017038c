// SPDX-License-Identifier: Apache-2.0

//! Bring-up of the stepping platform on the victim core.
//!
//! ```text
//! pin core -> map handlers -> map IDT -> install gates -> map APIC
//!     -> program timer -> self test -> install AEP trampoline
//! ```
//!
//! Everything here needs root, the `sgx-step` kernel module and a kernel
//! that lets `/dev/mem` reach page tables and the local APIC.

use crate::aep;
use crate::apic::{self, DeadlineTimer, Mmio, Timer, TimerControl};
use crate::config::{Config, TimerConfig, TimerMode};
use crate::driver::Driver;
use crate::enclave::Info;
use crate::error::{Error, Result};
use crate::gate::{self, GateDescriptor, Gates, Idt};
use crate::pte::{PageTables, Ptes, ADDR_MASK};

use std::fs::OpenOptions;
use std::hint::spin_loop;
use std::io;
use std::mem::size_of;
use std::time::{Duration, Instant};

use log::{debug, info};
use mmarinus::{perms, Map, Shared};
use once_cell::sync::OnceCell;
use primordial::Page;
use sgx_step_sys::idt::{sidt, IdtEntry, VECTORS};
use sgx_step_sys::isr;
use x86_64::structures::paging::PageTableFlags;

/// How long the first timer interrupt may take to show up.
const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(1);

static GATES: OnceCell<Gates> = OnceCell::new();

/// Pins the calling thread to `cpu`.
pub fn pin(cpu: usize) -> Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(Error::Config(format!("no such cpu {cpu}")));
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);

        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }

    debug!("pinned to cpu {}", cpu);
    Ok(())
}

/// The IDT of the current core, mapped through `/dev/mem`.
pub struct MappedIdt {
    map: Map<perms::ReadWrite, Shared>,
    offset: usize,
}

impl MappedIdt {
    pub fn map(driver: &mut Driver) -> Result<Self> {
        let dtr = sidt();
        let base = dtr.base;
        if dtr.entries() < VECTORS {
            return Err(Error::State("IDT does not cover every vector"));
        }

        let mapping = driver.mapping(base)?;
        if !PageTableFlags::from_bits_truncate(mapping.pte).contains(PageTableFlags::PRESENT) {
            return Err(Error::Unmapped(base));
        }

        let phys = mapping.pte & ADDR_MASK;
        let offset = base as usize % Page::SIZE;
        let size = (offset + VECTORS * size_of::<IdtEntry>() + Page::SIZE - 1) / Page::SIZE;

        let mut mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")?;

        // SAFETY: the IDT is never moved or freed by the kernel.
        let map = unsafe {
            Map::bytes(size * Page::SIZE)
                .anywhere()
                .from(&mut mem, phys as i64)
                .with_kind(Shared)
                .with(perms::ReadWrite)
                .map_err(|e| e.err)?
        };

        debug!("IDT {:#x} (phys {:#x}) mapped at {:#x}", base, phys, map.addr());
        Ok(Self { map, offset })
    }

    fn entry(&self, vector: u8) -> *mut IdtEntry {
        (self.map.addr() + self.offset + vector as usize * size_of::<IdtEntry>()) as *mut IdtEntry
    }
}

impl Idt for MappedIdt {
    fn read(&self, vector: u8) -> IdtEntry {
        unsafe { self.entry(vector).read_volatile() }
    }

    fn write(&mut self, vector: u8, entry: IdtEntry) {
        unsafe { self.entry(vector).write_volatile(entry) }
    }
}

/// Arms `timer` once and waits for the handler to record the interrupt.
pub fn self_test(timer: &mut impl TimerControl, ticks: u32, timeout: Duration) -> Result<()> {
    let before = apic::snapshot().fired;
    timer.arm(ticks)?;

    let start = Instant::now();
    while apic::snapshot().fired == before {
        if start.elapsed() > timeout {
            timer.disarm()?;
            return Err(Error::Apic("timer interrupt never arrived"));
        }
        spin_loop();
    }

    debug!("timer interrupt arrived after {:?}", start.elapsed());
    Ok(())
}

/// A timer interrupt source ready to single-step.
pub struct Platform {
    pub timer: Box<dyn TimerControl + Send>,
    pub gates: &'static Gates,
    pub aep: u64,
    pub ticks: u32,
}

impl Platform {
    pub fn setup(config: &Config) -> Result<Self> {
        pin(config.timer.cpu)?;

        let mut driver = Driver::open()?;
        for (start, stop) in isr::ranges() {
            driver.map_isr(start, stop)?;
        }

        let mut idt = MappedIdt::map(&mut driver)?;
        let set = GateDescriptor::set(config.timer.vector, &config.gates);
        let gates = GATES.get_or_try_init(|| gate::install(&mut idt, &set, &isr::handlers()))?;

        let mmio = Mmio::map(apic::base(gates)?)?;
        let mut timer = timer(mmio, gates, &config.timer)?;
        self_test(&mut timer, config.timer.step_ticks, SELF_TEST_TIMEOUT)?;
        info!("APIC timer interrupt handler works");

        let aep = aep::install(config.timer.vector)?;

        Ok(Self {
            timer,
            gates,
            aep,
            ticks: config.timer.step_ticks,
        })
    }
}

fn timer(
    mmio: Mmio,
    gates: &'static Gates,
    config: &TimerConfig,
) -> Result<Box<dyn TimerControl + Send>> {
    if config.mode == TimerMode::TscDeadline {
        return Ok(Box::new(DeadlineTimer::new(mmio, gates, config.vector)?));
    }

    let mut timer = Timer::new(mmio, config)?;
    if config.calibration_us > 0 {
        apic::calibrate(&mut timer, Duration::from_micros(config.calibration_us))?;
    }
    Ok(Box::new(timer))
}

/// Page table entries of `start..end`, looked up through a fresh driver
/// handle.
fn ptes(start: u64, end: u64) -> Result<Ptes<PageTables>> {
    Ptes::map(PageTables::open(Driver::open()?)?, start, end)
}

/// Entries of the whole enclave.
pub fn enclave_ptes(info: &Info) -> Result<Ptes<PageTables>> {
    ptes(info.base(), info.limit())
}

/// Entries of the enclave's code; their accessed bits tell zero-steps
/// apart from real ones.
pub fn code_ptes(info: &Info) -> Result<Ptes<PageTables>> {
    match &info.region.exec {
        Some(exec) => ptes(exec.start, exec.end),
        None => Err(Error::State("enclave has no executable range")),
    }
}
