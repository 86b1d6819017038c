// SPDX-License-Identifier: Apache-2.0

//! Offsets into the thread control structure and the state save area.
//!
//! These are only reachable from outside the enclave through the debug
//! interface, so the host reads them field by field instead of mapping
//! whole structures.

/// Offset of `OSSA` (state save area offset from the enclave base) in the TCS.
pub const TCS_OSSA: u64 = 16;

/// Offset of `CSSA` (current SSA frame index) in the TCS.
pub const TCS_CSSA: u64 = 24;

/// Offset of the `FLAGS` field in the TCS.
pub const TCS_FLAGS: u64 = 8;

/// `TCS.FLAGS.DBGOPTIN`: allow single-stepping with the trap flag.
pub const TCS_DBGOPTIN: u64 = 1;

/// Size of one SSA frame as configured by the SDK.
pub const SSA_FRAME_SIZE: u64 = 4096;

/// Size of the general purpose register area at the end of each frame.
pub const GPRSGX_SIZE: u64 = 184;

/// Register offsets inside the GPRSGX area.
pub mod gpr {
    pub const RAX: u64 = 0;
    pub const RSP: u64 = 32;
    pub const RBP: u64 = 40;
    pub const RFLAGS: u64 = 128;
    pub const RIP: u64 = 136;
    pub const EXITINFO: u64 = 160;
}

/// Enclave address of the GPRSGX area of frame `cssa - 1`.
///
/// After an asynchronous exit, `cssa` has already been incremented past the
/// frame holding the interrupted state.
pub fn gprsgx(base: u64, ossa: u64, cssa: u64) -> Option<u64> {
    let frame = cssa.checked_sub(1)?;
    Some(base + ossa + (frame + 1) * SSA_FRAME_SIZE - GPRSGX_SIZE)
}
