// SPDX-License-Identifier: Apache-2.0

//! The image-decoding payload running inside the enclave.
//!
//! The payload itself is opaque: it is driven through [`Payload`] and,
//! when built with explicit leakage, reports its progress through the
//! `ocall_*` entry points below. Those forward into whatever
//! [`Instrumentation`] is attached for the duration of a run.

use crate::error::{Error, Result};
use crate::trace::Collector;

use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use spin::Mutex;

/// Decoder capabilities exposed by the enclave.
pub trait Payload {
    /// Copies a compressed image into the enclave.
    fn load_image(&mut self, image: &[u8], max_size: usize) -> Result<()>;

    /// Decodes the loaded image, returning the decoded size.
    fn decompress_loaded(&mut self) -> Result<usize>;

    fn free_image(&mut self) -> Result<()>;
}

/// Decoder progress reported by the payload.
pub trait Instrumentation {
    /// An IDCT finished one 8x8 block.
    fn on_block_processed(&mut self);

    /// A coefficient column took the all-zero shortcut.
    fn on_zero_coefficient(&mut self);

    /// The decoder moved on to the next row of blocks.
    fn on_row_advance(&mut self);
}

impl Instrumentation for Collector {
    fn on_block_processed(&mut self) {
        Collector::on_block_processed(self)
    }

    fn on_zero_coefficient(&mut self) {
        Collector::on_zero_coefficient(self)
    }

    fn on_row_advance(&mut self) {
        Collector::on_row_advance(self)
    }
}

static SINK: Mutex<Option<Collector>> = Mutex::new(None);

/// The decoder announces the first row too; only later ones advance.
static FIRST_ROW: AtomicBool = AtomicBool::new(true);

/// Routes payload instrumentation into `collector` until [`detach`].
pub fn attach(collector: Collector) {
    FIRST_ROW.store(true, Ordering::Relaxed);
    *SINK.lock() = Some(collector);
}

pub fn detach() -> Option<Collector> {
    SINK.lock().take()
}

fn with_sink(f: impl FnOnce(&mut dyn Instrumentation)) {
    if let Some(collector) = SINK.lock().as_mut() {
        f(collector);
    }
}

pub fn idct_islow() {
    with_sink(|c| c.on_block_processed());
}

pub fn all_zero() {
    with_sink(|c| c.on_zero_coefficient());
}

pub fn next_row() {
    if FIRST_ROW.swap(false, Ordering::Relaxed) {
        return;
    }
    with_sink(|c| c.on_row_advance());
}

#[cfg(feature = "sgx")]
pub use self::ocalls::Jpeg;

#[cfg(feature = "sgx")]
mod ocalls {
    use super::*;
    use crate::enclave::Enclave;

    use std::ffi::CStr;
    use std::os::raw::{c_char, c_int};

    #[no_mangle]
    pub extern "C" fn ocall_idct_islow() {
        idct_islow();
    }

    #[no_mangle]
    pub extern "C" fn ocall_all_zero() {
        all_zero();
    }

    #[no_mangle]
    pub extern "C" fn ocall_next_row() {
        next_row();
    }

    #[no_mangle]
    pub extern "C" fn ocall_print_string(s: *const c_char) {
        if !s.is_null() {
            let s = unsafe { CStr::from_ptr(s) };
            info!("enclave says: {}", s.to_string_lossy());
        }
    }

    #[no_mangle]
    pub extern "C" fn ocall_print_int(s: *const c_char, i: c_int) {
        if !s.is_null() {
            let s = unsafe { CStr::from_ptr(s) };
            info!("enclave says: {}: {}", s.to_string_lossy(), i);
        }
    }

    // Generated by the edger8r from the payload's EDL.
    extern "C" {
        fn enclave_jpeg_load_image(
            eid: u64,
            retval: *mut c_int,
            input: *const u8,
            input_size: usize,
            output_size: usize,
        ) -> u32;
        fn enclave_jpeg_decompress_loaded(eid: u64, out_size: *mut usize) -> u32;
        fn enclave_jpeg_free_image(eid: u64) -> u32;
    }

    fn check(status: u32) -> Result<()> {
        match status {
            0 => Ok(()),
            status => Err(Error::Sgx(status)),
        }
    }

    /// The libjpeg decoder enclave.
    pub struct Jpeg<'a, E: Enclave> {
        enclave: &'a E,
    }

    impl<'a, E: Enclave> Jpeg<'a, E> {
        pub fn new(enclave: &'a E) -> Self {
            Self { enclave }
        }

        fn eid(&self) -> u64 {
            self.enclave.info().id
        }
    }

    impl<E: Enclave> Payload for Jpeg<'_, E> {
        fn load_image(&mut self, image: &[u8], max_size: usize) -> Result<()> {
            let mut ret = 0;
            check(unsafe {
                enclave_jpeg_load_image(self.eid(), &mut ret, image.as_ptr(), image.len(), max_size)
            })?;

            match ret {
                0 => Ok(()),
                ret => Err(Error::Payload(ret as i64)),
            }
        }

        fn decompress_loaded(&mut self) -> Result<usize> {
            let mut size = 0;
            check(unsafe { enclave_jpeg_decompress_loaded(self.eid(), &mut size) })?;

            match size {
                usize::MAX => Err(Error::Payload(-1)),
                size => Ok(size),
            }
        }

        fn free_image(&mut self) -> Result<()> {
            check(unsafe { enclave_jpeg_free_image(self.eid()) })
        }
    }
}

/// Loads, decodes and frees `image` while `collector` receives the
/// payload's instrumentation.
pub fn decode_instrumented(
    payload: &mut impl Payload,
    image: &[u8],
    max_size: usize,
    collector: Collector,
) -> Result<Collector> {
    payload.load_image(image, max_size)?;

    attach(collector);
    let decoded = payload.decompress_loaded();
    let collector = detach();

    let freed = payload.free_image();
    let size = decoded?;
    freed?;

    info!("decoded {} bytes", size);
    collector.ok_or(Error::State("instrumentation detached"))
}
