// SPDX-License-Identifier: Apache-2.0

//! Attack configuration.
//!
//! Every field has a default so an empty (or absent) file yields a working
//! setup for the bundled libjpeg enclave. A file only needs the fields it
//! overrides:
//!
//! ```toml
//! [timer]
//! vector = 46
//! step_ticks = 13
//!
//! [phases]
//! data = [150, 4000]
//! ```

use crate::error::{Error, Result};

use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub timer: TimerConfig,
    pub gates: GateConfig,
    pub tracer: TracerConfig,
    pub phases: PhaseConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            e => e,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.timer.step_ticks == 0 {
            return Err(Error::Config("timer.step_ticks must be non-zero".into()));
        }

        if !matches!(self.timer.divide, 1 | 2 | 4 | 8 | 16 | 32 | 64 | 128) {
            return Err(Error::Config(format!(
                "timer.divide {} is not a power of two up to 128",
                self.timer.divide
            )));
        }

        if self.tracer.cadence == 0 {
            return Err(Error::Config("tracer.cadence must be non-zero".into()));
        }

        for (name, range) in self.phases.named() {
            if range.start > range.end {
                return Err(Error::Config(format!("phases.{name} is reversed")));
            }
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerMode {
    OneShot,
    Periodic,
    TscDeadline,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    /// Interrupt vector the APIC timer delivers to.
    pub vector: u8,
    pub mode: TimerMode,
    /// Divide configuration (1, 2, 4, ..., 128).
    pub divide: u32,
    /// Delay between ERESUME and the timer firing.
    pub step_ticks: u32,
    /// Length of the calibration window in microseconds; zero skips it.
    pub calibration_us: u64,
    /// Core the attack and the enclave are pinned to.
    pub cpu: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            vector: 45,
            mode: TimerMode::OneShot,
            divide: 1,
            step_ticks: 11,
            calibration_us: 10_000,
            cpu: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Software interrupt calling a privileged helper.
    pub call: u8,
    pub rdmsr: u8,
    pub wrmsr: u8,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            call: 49,
            rdmsr: 50,
            wrmsr: 51,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    /// Re-arm the page tracer every this many steps.
    pub cadence: u32,
    /// Keep a two-page working set (needed under AEX-Notify).
    pub aexnotify: bool,
    /// Clear accessed bits of executable pages to detect zero-steps.
    pub zero_step_filter: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            cadence: 1,
            aexnotify: false,
            zero_step_filter: true,
        }
    }
}

impl TracerConfig {
    pub fn working_set(&self) -> usize {
        if self.aexnotify {
            2
        } else {
            1
        }
    }
}

/// Enclave page ranges (page numbers relative to the enclave base) that
/// drive the libjpeg phase machine. Each range is `[start, end)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhaseConfig {
    pub start: [usize; 2],
    pub next_row: [usize; 2],
    pub start_row: [usize; 2],
    pub pre_idct: [usize; 2],
    pub idct: [usize; 2],
    pub data: [usize; 2],
    /// Data range used when AEX-Notify is enabled.
    pub data_aexnotify: [usize; 2],
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            start: [54, 55],
            next_row: [44, 46],
            start_row: [58, 59],
            pre_idct: [59, 60],
            idct: [63, 65],
            data: [150, 4340],
            data_aexnotify: [150, 4335],
        }
    }
}

impl PhaseConfig {
    fn named(&self) -> [(&'static str, Range<usize>); 7] {
        [
            ("start", range(self.start)),
            ("next_row", range(self.next_row)),
            ("start_row", range(self.start_row)),
            ("pre_idct", range(self.pre_idct)),
            ("idct", range(self.idct)),
            ("data", range(self.data)),
            ("data_aexnotify", range(self.data_aexnotify)),
        ]
    }
}

pub(crate) fn range([start, end]: [usize; 2]) -> Range<usize> {
    start..end
}
