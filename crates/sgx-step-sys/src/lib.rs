// SPDX-License-Identifier: Apache-2.0

//! Low-level pieces of the single-stepping framework that have to be laid
//! out exactly as the hardware or the `sgx-step` kernel driver expects them.
//!
//! Everything in this crate is either a `#[repr(C)]` structure, a constant
//! or a symbol exported from the privileged handler section. Higher level
//! policy lives in the `sgx-step` crate.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod idt;
pub mod ioctl;
pub mod msr;
pub mod record;
pub mod ssa;

#[cfg(target_arch = "x86_64")]
pub mod isr;

pub use record::{AepSlots, IrqRecord, Shared};
