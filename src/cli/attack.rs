// SPDX-License-Identifier: Apache-2.0

use super::{ConfigOptions, OutputOptions};

use std::path::PathBuf;

use clap::{Args, Subcommand};
use sgx_step::attack::Mode;

/// Recover an image decoded by the libjpeg enclave
#[derive(Subcommand, Debug)]
pub enum Subcommands {
    /// Trace the decoder through page faults
    Enclave(Options),
    /// Take counts from the enclave's instrumentation ocalls (for debugging)
    Ocalls(Options),
}

impl Subcommands {
    pub fn dispatch(self) -> anyhow::Result<()> {
        match self {
            Self::Enclave(cmd) => cmd.execute(Mode::Faults),
            Self::Ocalls(cmd) => cmd.execute(Mode::Ocalls),
        }
    }
}

#[derive(Args, Debug)]
#[cfg_attr(not(feature = "sgx"), allow(dead_code))]
pub struct Options {
    /// Signed decoder enclave
    #[clap(short, long)]
    enclave: PathBuf,

    /// JPEG image handed to the enclave
    #[clap(short, long)]
    image: PathBuf,

    /// The image has three colour planes
    #[clap(short, long)]
    color: bool,

    /// Planes are interleaved block by block instead of row by row
    #[clap(long)]
    one_pass: bool,

    /// Keep a two-page working set for AEX-Notify enclaves
    #[clap(short, long)]
    aexnotify: bool,

    /// Single-step the decoder and re-revoke its pages at the tracer cadence
    #[clap(long)]
    step: bool,

    #[clap(flatten)]
    config: ConfigOptions,

    #[clap(flatten)]
    output: OutputOptions,
}

impl Options {
    #[cfg(not(feature = "sgx"))]
    fn execute(self, _mode: Mode) -> anyhow::Result<()> {
        Err(super::without_sgx())
    }

    #[cfg(feature = "sgx")]
    fn execute(self, mode: Mode) -> anyhow::Result<()> {
        use anyhow::Context;
        use log::info;
        use sgx_step::attack::{self, Stepping};
        use sgx_step::enclave::{Enclave, SgxEnclave};
        use sgx_step::payload::Jpeg;
        use sgx_step::platform::Platform;

        let mut config = self.config.load()?;
        config.tracer.aexnotify |= self.aexnotify;

        let (width, height) = image::image_dimensions(&self.image)
            .with_context(|| format!("failed to read {}", self.image.display()))?;
        let jpeg = std::fs::read(&self.image)?;
        info!("{}x{} image, {} bytes", width, height, jpeg.len());

        let (width, height) = (width as usize, height as usize);
        // Bounds the enclave's output buffer; the attack never reads it.
        let max_size = width * height * 3 + 100;
        let collector = super::collector(width, height, self.color, self.one_pass);
        let (collector, bar) = super::with_progress(collector)?;

        let platform = match self.step {
            true => Some(Platform::setup(&config).context("failed to set up single-stepping")?),
            false => None,
        };

        let mut enclave = SgxEnclave::create(&self.enclave)
            .with_context(|| format!("failed to create enclave {}", self.enclave.display()))?;
        let stepping = platform.map(|platform| {
            enclave.set_aep(platform.aep);
            Stepping {
                timer: platform.timer,
                ticks: platform.ticks,
                aep: platform.aep,
            }
        });
        let mut payload = Jpeg::new(&enclave);

        let collector = attack::run(
            &mut payload,
            enclave.info(),
            mode,
            &config,
            &jpeg,
            max_size,
            collector,
            stepping,
        )?;
        bar.finish();

        self.output.write(&collector)?;
        Ok(())
    }
}
