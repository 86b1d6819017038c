// SPDX-License-Identifier: Apache-2.0

//! Local APIC timer.
//!
//! The timer is programmed from ring 3 through a `/dev/mem` mapping of the
//! APIC MMIO page; TSC-deadline mode goes through the MSR gates instead.

use crate::config::{TimerConfig, TimerMode};
use crate::error::{Error, Result};
use crate::gate::Msr;

use std::fs::{File, OpenOptions};
use std::hint::spin_loop;
use std::time::{Duration, Instant};

use log::{debug, info};
use mmarinus::{perms, Map, Shared};
use primordial::Page;
use sgx_step_sys::msr::{self, apic as reg};
use sgx_step_sys::record::{IrqRecord, APIC, IRQ};

/// 32-bit register access to a local APIC.
pub trait ApicRegs {
    fn read(&self, offset: u32) -> u32;
    fn write(&mut self, offset: u32, value: u32);
}

/// Something that can deliver one timer interrupt after a delay.
pub trait TimerControl {
    fn arm(&mut self, ticks: u32) -> Result<()>;
    fn disarm(&mut self) -> Result<()>;
}

impl<T: TimerControl + ?Sized> TimerControl for Box<T> {
    fn arm(&mut self, ticks: u32) -> Result<()> {
        (**self).arm(ticks)
    }

    fn disarm(&mut self) -> Result<()> {
        (**self).disarm()
    }
}

/// Physical address of the APIC MMIO page, read from `IA32_APIC_BASE`.
pub fn base(msr: &impl Msr) -> Result<u64> {
    let value = msr.read_msr(msr::IA32_APIC_BASE)?;

    if value & msr::APIC_BASE_ENABLE == 0 {
        return Err(Error::Apic("disabled"));
    }

    if value & msr::APIC_BASE_X2APIC != 0 {
        return Err(Error::Apic("x2APIC mode has no MMIO interface"));
    }

    Ok(value & msr::APIC_BASE_MASK)
}

/// The APIC MMIO page mapped through `/dev/mem`.
///
/// While the mapping lives, the timer handler uses it to signal EOI.
pub struct Mmio {
    map: Map<perms::ReadWrite, Shared>,
}

impl Mmio {
    pub fn map(phys: u64) -> Result<Self> {
        let mut file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")?;

        // SAFETY: the page is device memory; nothing else in this process
        // aliases it.
        let map = unsafe {
            Map::bytes(Page::SIZE)
                .anywhere()
                .from(&mut file, phys as i64)
                .with_kind(Shared)
                .with(perms::ReadWrite)
                .map_err(|e| e.err)?
        };

        debug!("local APIC {:#x} mapped at {:#x}", phys, map.addr());
        APIC.set(map.addr() as u64);
        Ok(Self { map })
    }
}

impl Drop for Mmio {
    fn drop(&mut self) {
        APIC.set(0);
    }
}

impl ApicRegs for Mmio {
    fn read(&self, offset: u32) -> u32 {
        let ptr = (self.map.addr() + offset as usize) as *const u32;
        unsafe { ptr.read_volatile() }
    }

    fn write(&mut self, offset: u32, value: u32) {
        let ptr = (self.map.addr() + offset as usize) as *mut u32;
        unsafe { ptr.write_volatile(value) }
    }
}

/// Divide configuration register encoding.
fn tdcr(divide: u32) -> Result<u32> {
    Ok(match divide {
        1 => 0b1011,
        2 => 0b0000,
        4 => 0b0001,
        8 => 0b0010,
        16 => 0b0011,
        32 => 0b1000,
        64 => 0b1001,
        128 => 0b1010,
        _ => return Err(Error::Config(format!("invalid timer divide {divide}"))),
    })
}

/// One-shot or periodic timer driven by the initial count register.
///
/// The previous LVT and divide settings are restored on drop.
pub struct Timer<R: ApicRegs> {
    regs: R,
    lvtt: u32,
    saved: (u32, u32),
}

impl<R: ApicRegs> Timer<R> {
    pub fn new(mut regs: R, config: &TimerConfig) -> Result<Self> {
        let mode = match config.mode {
            TimerMode::OneShot => reg::LVTT_ONESHOT,
            TimerMode::Periodic => reg::LVTT_PERIODIC,
            TimerMode::TscDeadline => {
                return Err(Error::Config(
                    "TSC-deadline mode is armed through DeadlineTimer".into(),
                ))
            }
        };

        let saved = (regs.read(reg::LVTT), regs.read(reg::TDCR));
        let lvtt = config.vector as u32 | mode;

        regs.write(reg::TMICT, 0);
        regs.write(reg::TDCR, tdcr(config.divide)?);
        regs.write(reg::LVTT, lvtt);

        debug!(
            "APIC timer: vector {} {:?} divide {}",
            config.vector, config.mode, config.divide
        );

        Ok(Self { regs, lvtt, saved })
    }

    /// Ticks left before the timer fires.
    pub fn current(&self) -> u32 {
        self.regs.read(reg::TMCCT)
    }

    fn mask(&mut self, masked: bool) {
        let lvtt = if masked {
            self.lvtt | reg::LVT_MASKED
        } else {
            self.lvtt
        };
        self.regs.write(reg::LVTT, lvtt);
    }
}

impl<R: ApicRegs> TimerControl for Timer<R> {
    fn arm(&mut self, ticks: u32) -> Result<()> {
        self.regs.write(reg::TMICT, ticks);
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.regs.write(reg::TMICT, 0);
        Ok(())
    }
}

impl<R: ApicRegs> Drop for Timer<R> {
    fn drop(&mut self) {
        let (lvtt, tdcr) = self.saved;
        self.regs.write(reg::TMICT, 0);
        self.regs.write(reg::TDCR, tdcr);
        self.regs.write(reg::LVTT, lvtt);
    }
}

/// TSC-deadline timer armed through `IA32_TSC_DEADLINE`.
pub struct DeadlineTimer<'a, R: ApicRegs, M: Msr> {
    regs: R,
    msr: &'a M,
    clock: fn() -> u64,
    saved: u32,
}

impl<'a, R: ApicRegs, M: Msr> DeadlineTimer<'a, R, M> {
    pub fn new(mut regs: R, msr: &'a M, vector: u8) -> Result<Self> {
        let saved = regs.read(reg::LVTT);
        regs.write(reg::LVTT, vector as u32 | reg::LVTT_TSC_DEADLINE);
        msr.write_msr(msr::IA32_TSC_DEADLINE, 0)?;
        debug!("APIC timer: vector {} TSC-deadline", vector);

        Ok(Self {
            regs,
            msr,
            clock: tsc,
            saved,
        })
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }
}

impl<R: ApicRegs, M: Msr> TimerControl for DeadlineTimer<'_, R, M> {
    fn arm(&mut self, ticks: u32) -> Result<()> {
        let deadline = (self.clock)() + ticks as u64;
        self.msr.write_msr(msr::IA32_TSC_DEADLINE, deadline)
    }

    fn disarm(&mut self) -> Result<()> {
        self.msr.write_msr(msr::IA32_TSC_DEADLINE, 0)
    }
}

impl<R: ApicRegs, M: Msr> Drop for DeadlineTimer<'_, R, M> {
    fn drop(&mut self) {
        let _ = self.msr.write_msr(msr::IA32_TSC_DEADLINE, 0);
        self.regs.write(reg::LVTT, self.saved);
    }
}

fn tsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Timer rate measured against the monotonic clock.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub ticks_per_us: f64,
}

impl Calibration {
    pub fn ticks(&self, duration: Duration) -> u32 {
        let ticks = self.ticks_per_us * duration.as_secs_f64() * 1e6;
        ticks.round().clamp(1.0, u32::MAX as f64) as u32
    }
}

/// Counts down from the maximum initial count over `window` with the timer
/// masked, and derives the tick rate.
pub fn calibrate<R: ApicRegs>(timer: &mut Timer<R>, window: Duration) -> Result<Calibration> {
    timer.mask(true);
    timer.arm(u32::MAX)?;

    let start = Instant::now();
    while start.elapsed() < window {
        spin_loop();
    }
    let left = timer.current();
    let elapsed = start.elapsed();

    timer.disarm()?;
    timer.mask(false);

    let ticks = u32::MAX - left;
    if ticks == 0 {
        return Err(Error::Calibration("timer did not count down".into()));
    }

    let micros = elapsed.as_secs_f64() * 1e6;
    let calibration = Calibration {
        ticks_per_us: ticks as f64 / micros,
    };

    info!(
        "APIC timer: {:.2} ticks/us ({} ticks in {:?})",
        calibration.ticks_per_us, ticks, elapsed
    );
    Ok(calibration)
}

/// The record the timer handler last wrote.
///
/// Only meaningful on the host thread while the handler cannot run, i.e.
/// inside the AEP callback or between stop and the next start.
pub fn snapshot() -> IrqRecord {
    IRQ.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    /// Register file that counts TMCCT down by a fixed amount per read.
    #[derive(Default)]
    struct Regs {
        values: BTreeMap<u32, u32>,
        writes: Vec<(u32, u32)>,
        drain: u32,
    }

    impl ApicRegs for &mut Regs {
        fn read(&self, offset: u32) -> u32 {
            let value = self.values.get(&offset).copied().unwrap_or(0);
            if offset == reg::TMCCT {
                let initial = self.values.get(&reg::TMICT).copied().unwrap_or(0);
                return initial.saturating_sub(self.drain);
            }
            value
        }

        fn write(&mut self, offset: u32, value: u32) {
            self.values.insert(offset, value);
            self.writes.push((offset, value));
        }
    }

    #[derive(Default)]
    struct Msrs(RefCell<BTreeMap<u32, u64>>, Cell<usize>);

    impl Msr for Msrs {
        fn read_msr(&self, msr: u32) -> Result<u64> {
            Ok(self.0.borrow().get(&msr).copied().unwrap_or(0))
        }

        fn write_msr(&self, msr: u32, value: u64) -> Result<()> {
            self.1.set(self.1.get() + 1);
            self.0.borrow_mut().insert(msr, value);
            Ok(())
        }
    }

    #[test]
    fn oneshot() {
        let mut regs = Regs::default();
        regs.values.insert(reg::LVTT, 0x10000 | 0xEC);
        regs.values.insert(reg::TDCR, 0b0011);

        {
            let mut timer = Timer::new(&mut regs, &TimerConfig::default()).unwrap();
            timer.arm(11).unwrap();
            timer.disarm().unwrap();
        }

        assert_eq!(
            regs.writes,
            vec![
                (reg::TMICT, 0),
                (reg::TDCR, 0b1011),
                (reg::LVTT, 45),
                (reg::TMICT, 11),
                (reg::TMICT, 0),
                // drop restores the previous state
                (reg::TMICT, 0),
                (reg::TDCR, 0b0011),
                (reg::LVTT, 0x10000 | 0xEC),
            ]
        );
    }

    #[test]
    fn periodic() {
        let mut regs = Regs::default();
        let config = TimerConfig {
            mode: TimerMode::Periodic,
            divide: 16,
            ..Default::default()
        };

        let timer = Timer::new(&mut regs, &config).unwrap();
        drop(timer);
        assert!(regs.writes.contains(&(reg::LVTT, 45 | reg::LVTT_PERIODIC)));
        assert!(regs.writes.contains(&(reg::TDCR, 0b0011)));
    }

    #[test]
    fn deadline_mode_rejected() {
        let mut regs = Regs::default();
        let config = TimerConfig {
            mode: TimerMode::TscDeadline,
            ..Default::default()
        };
        assert!(Timer::new(&mut regs, &config).is_err());
    }

    #[test]
    fn deadline() {
        let mut regs = Regs::default();
        let msrs = Msrs::default();

        {
            let mut timer = DeadlineTimer::new(&mut regs, &msrs, 45)
                .unwrap()
                .with_clock(|| 1000);
            timer.arm(11).unwrap();
            assert_eq!(msrs.read_msr(msr::IA32_TSC_DEADLINE).unwrap(), 1011);
            timer.disarm().unwrap();
            assert_eq!(msrs.read_msr(msr::IA32_TSC_DEADLINE).unwrap(), 0);
        }

        assert!(regs
            .writes
            .contains(&(reg::LVTT, 45 | reg::LVTT_TSC_DEADLINE)));
        assert_eq!(regs.writes.last(), Some(&(reg::LVTT, 0)));
    }

    #[test]
    fn calibration() {
        let mut regs = Regs {
            drain: 5000,
            ..Default::default()
        };

        let mut timer = Timer::new(&mut regs, &TimerConfig::default()).unwrap();
        let calibration = calibrate(&mut timer, Duration::from_millis(1)).unwrap();

        // 5000 ticks over at least one millisecond.
        assert!(calibration.ticks_per_us > 0.0);
        assert!(calibration.ticks_per_us <= 5.0);
        drop(timer);

        assert!(regs.writes.contains(&(reg::LVTT, 45 | reg::LVT_MASKED)));
    }

    #[test]
    fn calibration_stuck() {
        let mut regs = Regs::default();
        let mut timer = Timer::new(&mut regs, &TimerConfig::default()).unwrap();
        assert!(matches!(
            calibrate(&mut timer, Duration::from_micros(10)),
            Err(Error::Calibration(..))
        ));
    }

    #[test]
    fn apic_base() {
        let msrs = Msrs::default();
        msrs.write_msr(msr::IA32_APIC_BASE, 0xfee0_0900).unwrap();
        assert_eq!(base(&msrs).unwrap(), 0xfee0_0000);

        msrs.write_msr(msr::IA32_APIC_BASE, 0xfee0_0d00).unwrap();
        assert!(matches!(base(&msrs), Err(Error::Apic(..))));

        msrs.write_msr(msr::IA32_APIC_BASE, 0xfee0_0000).unwrap();
        assert!(matches!(base(&msrs), Err(Error::Apic(..))));
    }

    #[test]
    fn ticks() {
        let calibration = Calibration { ticks_per_us: 2.5 };
        assert_eq!(calibration.ticks(Duration::from_micros(4)), 10);
        assert_eq!(calibration.ticks(Duration::ZERO), 1);
    }
}
