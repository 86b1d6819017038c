// SPDX-License-Identifier: Apache-2.0

//! Interrupt-driven single-stepping of SGX enclaves, and the page-fault and
//! page-access side channels built on top of it.
//!
//! The lowest layer ([`gate`], [`apic`], [`aep`]) gives an unprivileged
//! process a timer interrupt it controls and a hook on every asynchronous
//! exit. [`step`] turns that into a single-stepping state machine, [`pf`]
//! and [`pte`] trace the pages the enclave touches, and [`trace`] and
//! [`reconstruct`] turn such traces back into the image a libjpeg enclave
//! decoded.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod aep;
pub mod apic;
pub mod attack;
pub mod config;
pub mod driver;
pub mod enclave;
pub mod error;
pub mod gate;
pub mod payload;
pub mod pf;
pub mod platform;
pub mod probe;
pub mod profiler;
pub mod pte;
pub mod reconstruct;
pub mod sim;
pub mod step;
pub mod trace;

pub use error::{Error, Result};
