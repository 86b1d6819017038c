// SPDX-License-Identifier: Apache-2.0

use super::ConfigOptions;

use std::path::PathBuf;

use clap::Args;

/// Single-step an enclave under a profiler and dump its page accesses
///
/// The profiler library drives the enclave and calls
/// `start_single_stepping` and `stop_single_stepping` around the code of
/// interest.
#[derive(Args, Debug)]
#[cfg_attr(not(feature = "sgx"), allow(dead_code))]
pub struct Options {
    /// Profiler shared object
    #[clap(long)]
    so: PathBuf,

    /// Signed enclave handed to the profiler
    #[clap(short, long)]
    enclave: PathBuf,

    /// VCD file receiving one timestamp per step
    #[clap(short, long, default_value = "trace.vcd")]
    output: PathBuf,

    /// Also dump the interrupted instruction pointer (debug enclaves only)
    #[clap(long)]
    erip: bool,

    #[clap(flatten)]
    config: ConfigOptions,

    /// Arguments passed on to the profiler
    #[clap(long, multiple_values = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Options {
    #[cfg(not(feature = "sgx"))]
    pub fn execute(self) -> anyhow::Result<()> {
        Err(super::without_sgx())
    }

    #[cfg(feature = "sgx")]
    pub fn execute(self) -> anyhow::Result<()> {
        use std::fs::File;
        use std::io::BufWriter;
        use std::sync::Arc;

        use anyhow::Context;
        use libloading::Library;
        use log::info;
        use sgx_step::enclave::{DebugMem, Enclave, SgxEnclave};
        use sgx_step::platform::{self, Platform};
        use sgx_step::profiler::{self, EripFn, ProfilerLibrary, Recorder};
        use sgx_step::step::{Cadence, Stepper};
        use spin::Mutex;

        let config = self.config.load()?;
        let platform = Platform::setup(&config).context("failed to set up single-stepping")?;

        let mut enclave = SgxEnclave::create(&self.enclave)
            .with_context(|| format!("failed to create enclave {}", self.enclave.display()))?;
        enclave.set_aep(platform.aep);
        let info = enclave.info().clone();

        let erip: Option<EripFn> = match self.erip {
            true => {
                let mem = DebugMem::open()?;
                let info = info.clone();
                Some(Box::new(move || mem.erip(&info).ok()))
            }
            false => None,
        };

        let output = File::create(&self.output)
            .with_context(|| format!("failed to create {}", self.output.display()))?;
        let ptes = platform::enclave_ptes(&info)?;
        let recorder = Arc::new(Mutex::new(Recorder::new(
            ptes,
            BufWriter::new(output),
            erip,
        )?));

        let cadence = Cadence::new(config.tracer.cadence).unwrap_or_default();
        let mut stepper = Stepper::new(platform.timer, platform.ticks, platform.aep)
            .cadence(cadence)
            .hook(recorder.clone());
        if config.tracer.zero_step_filter {
            stepper = stepper.progress(platform::code_ptes(&info)?);
        }

        // SAFETY: the profiler is trusted to follow the profiler ABI.
        let lib = unsafe { Library::new(&self.so) }
            .with_context(|| format!("failed to load {}", self.so.display()))?;
        let entry = ProfilerLibrary::new(&lib)?;

        profiler::prepare(stepper)?;
        let result = profiler::run_profiler(&entry, &info, &self.args);

        profiler::finish();
        result?;

        let steps = recorder.lock().finish()?;
        info!("wrote {} steps to {}", steps, self.output.display());
        Ok(())
    }
}
