// SPDX-License-Identifier: Apache-2.0

use super::{ImageOptions, OutputOptions};

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use log::{debug, info};
use sgx_step::trace::TraceEvent;

/// Reconstruct an image from a JSON list of trace events
///
/// Events are pushed in file order; out-of-order and out-of-range events
/// are reported and dropped.
#[derive(Args, Debug)]
pub struct Options {
    /// JSON array of `{"block", "plane", "observation"}` events
    #[clap(long)]
    events: PathBuf,

    #[clap(flatten)]
    image: ImageOptions,

    #[clap(flatten)]
    output: OutputOptions,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let file = File::open(&self.events)
            .with_context(|| format!("failed to open {}", self.events.display()))?;
        let events: Vec<TraceEvent> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", self.events.display()))?;

        let mut collector = self.image.collector();
        let mut accepted = 0;
        for event in events {
            match collector.push(event) {
                Ok(()) => accepted += 1,
                Err(flag) => debug!("dropped {:?}: {:?}", event, flag),
            }
        }

        info!("accepted {} events", accepted);
        self.output.write(&collector)?;
        Ok(())
    }
}
