// SPDX-License-Identifier: Apache-2.0

//! Errors raised by the stepping framework.

use std::fmt::{self, Display, Formatter};
use std::io;

/// How an error affects the surrounding attack run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Class {
    /// Platform or gate setup failed; nothing can run.
    Setup,
    /// The trace lost synchronisation; the affected block stays zero.
    Sync,
    /// The enclave could not be resumed.
    Resume,
    /// The payload reported a failure status.
    Payload,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The vector already holds a gate we must not overwrite.
    VectorOccupied(u8),
    /// The same vector appears twice in one descriptor set.
    DuplicateVector(u8),
    /// Gates have already been installed in this process.
    AlreadyInstalled,
    /// A gate of this kind was not part of the installed set.
    GateMissing(&'static str),
    /// No enclave mapping could be found.
    NoEnclave,
    /// The address has no 4 KiB page table entry.
    Unmapped(u64),
    /// The helper driver or a device node failed.
    Driver(io::Error),
    /// The SGX runtime returned a failure status.
    Sgx(u32),
    /// A profiler shared object could not be loaded.
    Library(libloading::Error),
    /// The local APIC cannot be driven through MMIO.
    Apic(&'static str),
    /// Timer calibration produced no usable rate.
    Calibration(String),
    /// Configuration could not be loaded.
    Config(String),
    /// An operation was attempted in the wrong stepping state.
    State(&'static str),
    /// Stepping finished without a single counted step.
    NoProgress,
    /// A plane received more blocks than it holds.
    Overflow { plane: usize, block: usize },
    /// A block arrived out of sequence.
    OutOfOrder {
        plane: usize,
        expected: usize,
        got: usize,
    },
    /// A row of blocks ended before it was complete.
    ShortRow {
        plane: usize,
        row: usize,
        missing: usize,
    },
    /// A recorded trace could not be parsed.
    Trace(String),
    /// ERESUME failed.
    Resume,
    /// Status returned by the payload.
    Payload(i64),
}

impl Error {
    pub fn class(&self) -> Class {
        match self {
            Self::NoProgress | Self::Overflow { .. } | Self::OutOfOrder { .. } => Class::Sync,
            Self::ShortRow { .. } => Class::Sync,
            Self::Trace(..) => Class::Sync,
            Self::Resume => Class::Resume,
            Self::Payload(..) => Class::Payload,
            _ => Class::Setup,
        }
    }

    /// Whether the run can continue after logging this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.class(), Class::Sync)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::VectorOccupied(v) => write!(f, "interrupt vector {v} is occupied"),
            Self::DuplicateVector(v) => write!(f, "interrupt vector {v} requested twice"),
            Self::AlreadyInstalled => write!(f, "gates are already installed"),
            Self::GateMissing(kind) => write!(f, "no {kind} gate installed"),
            Self::NoEnclave => write!(f, "no enclave mapping found"),
            Self::Unmapped(addr) => write!(f, "{addr:#x} is not mapped by a 4 KiB page"),
            Self::Driver(e) => write!(f, "driver: {e}"),
            Self::Sgx(status) => write!(f, "SGX runtime failed with status {status:#x}"),
            Self::Library(e) => write!(f, "profiler library: {e}"),
            Self::Apic(s) => write!(f, "local APIC: {s}"),
            Self::Calibration(s) => write!(f, "timer calibration failed: {s}"),
            Self::Config(s) => write!(f, "invalid configuration: {s}"),
            Self::State(s) => write!(f, "invalid stepping state: {s}"),
            Self::NoProgress => write!(f, "no single-step progress"),
            Self::Overflow { plane, block } => {
                write!(f, "block {block} overflows plane {plane}")
            }
            Self::OutOfOrder {
                plane,
                expected,
                got,
            } => write!(
                f,
                "plane {plane}: expected block {expected}, got block {got}"
            ),
            Self::ShortRow {
                plane,
                row,
                missing,
            } => write!(f, "plane {plane}: row {row} is missing {missing} block(s)"),
            Self::Trace(s) => write!(f, "invalid trace: {s}"),
            Self::Resume => write!(f, "failed to resume enclave"),
            Self::Payload(status) => write!(f, "payload failed with status {status:#x}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Driver(e) => Some(e),
            Self::Library(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Driver(e)
    }
}

impl From<libloading::Error> for Error {
    fn from(e: libloading::Error) -> Self {
        Error::Library(e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
