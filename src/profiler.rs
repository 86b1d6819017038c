// SPDX-License-Identifier: Apache-2.0

//! Page-access profiling of an enclave under single-stepping.
//!
//! A profiler is a shared object exporting `profiler_setup`, `profiler_run`
//! and `profiler_destroy`. It drives the enclave itself and brackets the
//! code of interest with calls to `start_single_stepping` and
//! `stop_single_stepping`, which this crate exports when built with the
//! `sgx` feature. Every counted step then dumps the pages the MMU marked
//! accessed into a VCD trace.

use crate::aep::{Dispatcher, InterruptEvent};
use crate::apic::TimerControl;
use crate::enclave::Info;
use crate::error::{Error, Result};
use crate::pte::{Ptes, Tlb};
use crate::step::{Hook, Session, StepReport, Stepper};
use crate::trace::vcd::Dumper;

use std::ffi::CString;
use std::io::Write;
use std::os::raw::c_char;

use libloading::{Library, Symbol};
use log::{debug, info};
use spin::Mutex;

/// Extra wires past the last enclave page.
pub const SPARE_WIRES: usize = 100;

/// Reads the interrupted instruction pointer, if it can be read.
pub type EripFn = Box<dyn FnMut() -> Option<u64> + Send>;

/// Dumps the accessed pages of every step into a VCD trace.
pub struct Recorder<W: Write, T: Tlb> {
    ptes: Ptes<T>,
    dumper: Dumper<W>,
    erip: Option<EripFn>,
    failure: Option<Error>,
}

impl<W: Write, T: Tlb> Recorder<W, T> {
    /// Clears all accessed and dirty bits and writes the trace header.
    pub fn new(mut ptes: Ptes<T>, output: W, erip: Option<EripFn>) -> Result<Self> {
        let dumper = Dumper::new(output, ptes.len() + SPARE_WIRES, erip.is_some())?;
        ptes.clear_accessed();

        Ok(Self {
            ptes,
            dumper,
            erip,
            failure: None,
        })
    }

    /// Writes the pages accessed since the last call as one step.
    pub fn record(&mut self) -> Result<()> {
        let accesses = self.ptes.accesses();
        let erip = self.erip.as_mut().and_then(|erip| erip());

        self.dumper.step(&accesses, erip)?;
        self.ptes.clear_accessed();
        Ok(())
    }

    pub fn steps(&self) -> u64 {
        self.dumper.steps()
    }

    /// The number of recorded steps, or the first error hit while stepping.
    pub fn finish(&mut self) -> Result<u64> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(self.steps()),
        }
    }
}

/// Recording stops at the first failed write.
impl<W: Write + Send, T: Tlb + Send> Hook for Recorder<W, T> {
    fn on_step(&mut self, _step: u64, _event: &InterruptEvent) {
        if self.failure.is_none() {
            if let Err(e) = self.record() {
                self.failure = Some(e);
            }
        }
    }
}

type SetupFn = extern "C" fn(u64, u64, u64, u64, *const *const c_char);
type RunFn = extern "C" fn(u64);

/// The entry points of a loaded profiler.
pub struct ProfilerLibrary<'l> {
    setup: Symbol<'l, SetupFn>,
    run: Symbol<'l, RunFn>,
    destroy: Symbol<'l, RunFn>,
}

impl<'l> ProfilerLibrary<'l> {
    pub fn new(lib: &'l Library) -> Result<Self> {
        // SAFETY: the signatures are the profiler ABI.
        unsafe {
            Ok(Self {
                setup: lib.get(b"profiler_setup")?,
                run: lib.get(b"profiler_run")?,
                destroy: lib.get(b"profiler_destroy")?,
            })
        }
    }
}

/// Runs a profiler against `info`'s enclave, passing it `args`.
pub fn run_profiler(
    lib: &ProfilerLibrary<'_>,
    info: &Info,
    args: &[impl AsRef<str>],
) -> Result<()> {
    let args = args
        .iter()
        .map(|arg| {
            CString::new(arg.as_ref())
                .map_err(|_| Error::Config(format!("profiler argument {:?}", arg.as_ref())))
        })
        .collect::<Result<Vec<_>>>()?;
    let argv: Vec<*const c_char> = args.iter().map(|arg| arg.as_ptr()).collect();

    debug!("profiler_setup({:#x}, {} args)", info.id, argv.len());
    (lib.setup)(
        info.id,
        info.size(),
        info.base(),
        argv.len() as u64,
        argv.as_ptr(),
    );

    info!("running profiler on enclave {:#x}", info.id);
    (lib.run)(info.id);
    (lib.destroy)(info.id);
    Ok(())
}

/// Starts and stops one prepared stepper on request.
trait Toggle: Send {
    fn start(&mut self, dispatcher: &mut Dispatcher) -> Result<()>;
    fn stop(&mut self, dispatcher: &mut Dispatcher) -> Result<StepReport>;
}

struct Controller<T: TimerControl> {
    ready: Option<Stepper<T>>,
    running: Option<Session<T>>,
}

impl<T: TimerControl + Send + 'static> Toggle for Controller<T> {
    fn start(&mut self, dispatcher: &mut Dispatcher) -> Result<()> {
        let stepper = self
            .ready
            .take()
            .ok_or(Error::State("stepping was already started"))?;

        self.running = Some(Session::start(dispatcher, stepper)?);
        Ok(())
    }

    fn stop(&mut self, dispatcher: &mut Dispatcher) -> Result<StepReport> {
        self.running
            .take()
            .ok_or(Error::State("stepping is not running"))?
            .stop(dispatcher)
    }
}

static CONTROLLER: Mutex<Option<Box<dyn Toggle>>> = Mutex::new(None);

/// Hands `stepper` to the next [`start_stepping`] call.
pub fn prepare<T: TimerControl + Send + 'static>(stepper: Stepper<T>) -> Result<()> {
    let mut controller = CONTROLLER.lock();
    if controller.is_some() {
        return Err(Error::State("a profiler run is already prepared"));
    }

    *controller = Some(Box::new(Controller {
        ready: Some(stepper),
        running: None,
    }));
    Ok(())
}

pub fn start_stepping(dispatcher: &mut Dispatcher) -> Result<()> {
    match CONTROLLER.lock().as_mut() {
        Some(controller) => controller.start(dispatcher),
        None => Err(Error::State("no profiler run prepared")),
    }
}

pub fn stop_stepping(dispatcher: &mut Dispatcher) -> Result<StepReport> {
    match CONTROLLER.lock().as_mut() {
        Some(controller) => controller.stop(dispatcher),
        None => Err(Error::State("no profiler run prepared")),
    }
}

/// Drops the prepared run. Returns whether there was one.
pub fn finish() -> bool {
    CONTROLLER.lock().take().is_some()
}

#[cfg(feature = "sgx")]
mod exports {
    use super::*;
    use crate::aep::DISPATCHER;

    use log::error;

    #[no_mangle]
    pub extern "C" fn start_single_stepping() {
        if let Err(e) = start_stepping(&mut DISPATCHER.lock()) {
            error!("failed to start single-stepping: {}", e);
        }
    }

    #[no_mangle]
    pub extern "C" fn stop_single_stepping() {
        match stop_stepping(&mut DISPATCHER.lock()) {
            Ok(report) => info!("profiled {} steps", report.steps),
            Err(e) => error!("failed to stop single-stepping: {}", e),
        }
    }
}
