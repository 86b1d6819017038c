// SPDX-License-Identifier: Apache-2.0

use super::{ConfigOptions, ImageOptions, OutputOptions};

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use log::info;
use sgx_step::trace::phase::PhaseMachine;
use sgx_step::trace::vcd;

/// Reconstruct an image from a recorded page access trace
#[derive(Args, Debug)]
pub struct Options {
    /// VCD trace with one wire per enclave page
    #[clap(long)]
    vcd: PathBuf,

    /// Replay the trace with the AEX-Notify page layout
    #[clap(short, long)]
    aexnotify: bool,

    #[clap(flatten)]
    config: ConfigOptions,

    #[clap(flatten)]
    image: ImageOptions,

    #[clap(flatten)]
    output: OutputOptions,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = self.config.load()?;
        let aexnotify = self.aexnotify || config.tracer.aexnotify;

        let file = File::open(&self.vcd)
            .with_context(|| format!("failed to open {}", self.vcd.display()))?;

        let mut machine = PhaseMachine::new(&config.phases, aexnotify);
        let (mut collector, bar) = super::with_progress(self.image.collector())?;
        let accesses = vcd::replay(BufReader::new(file), &mut machine, &mut collector)?;
        bar.finish();

        info!(
            "{} page accesses, {} phase transitions, final phase {:?}",
            accesses,
            machine.transitions(),
            machine.phase()
        );

        self.output.write(&collector)?;
        Ok(())
    }
}
