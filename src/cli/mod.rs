// SPDX-License-Identifier: Apache-2.0

mod attack;
mod info;
mod inject;
mod profile;
mod replay;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use sgx_step::config::Config;
use sgx_step::reconstruct::{self, pnm, Counts, Scale};
use sgx_step::trace::{Collector, Geometry, Traversal};
use sgx_step::Error;

/// Single-step SGX enclaves and reconstruct what they decode
///
/// sgx-step drives an enclave one instruction at a time with the local
/// APIC timer and traces the pages it touches. The traces recover the
/// images a libjpeg enclave decodes.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Options {
    /// Logging options
    #[clap(flatten)]
    logger: LogOptions,

    /// Subcommands (with their own options)
    #[clap(subcommand)]
    cmd: Subcommands,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        self.logger.init();

        info!("logging initialized!");
        info!("CLI opts: {:?}", self);

        self.cmd.dispatch()
    }
}

/// `sgx-step` subcommands and their options/arguments.
#[derive(Subcommand, Debug)]
enum Subcommands {
    Info(info::Options),
    Replay(replay::Options),
    Inject(inject::Options),
    #[clap(subcommand)]
    Attack(attack::Subcommands),
    Profile(profile::Options),
}

impl Subcommands {
    fn dispatch(self) -> anyhow::Result<()> {
        match self {
            Self::Info(cmd) => cmd.execute(),
            Self::Replay(cmd) => cmd.execute(),
            Self::Inject(cmd) => cmd.execute(),
            Self::Attack(subcmd) => subcmd.dispatch(),
            Self::Profile(cmd) => cmd.execute(),
        }
    }
}

/// Tunables file shared by every command
#[derive(Args, Debug)]
pub struct ConfigOptions {
    /// TOML file overriding the built-in timer, gate and page layout
    #[clap(long, env = "SGX_STEP_CONFIG")]
    config: Option<PathBuf>,
}

impl ConfigOptions {
    pub fn load(&self) -> anyhow::Result<Config> {
        match self.config {
            Some(ref path) => Config::load(path).context("failed to load configuration"),
            None => Ok(Config::default()),
        }
    }
}

/// Layout of the image the victim decodes
#[derive(Args, Debug)]
pub struct ImageOptions {
    /// Image width in pixels
    #[clap(long)]
    width: usize,

    /// Image height in pixels
    #[clap(long)]
    height: usize,

    /// The image has three colour planes
    #[clap(short, long)]
    color: bool,

    /// Planes are interleaved block by block instead of row by row
    #[clap(long)]
    one_pass: bool,
}

/// Builds an empty collector for an image of `width` by `height` pixels.
pub fn collector(width: usize, height: usize, color: bool, one_pass: bool) -> Collector {
    let planes = if color { 3 } else { 1 };
    let geometry = Geometry::from_pixels(width, height, planes);
    let traversal = if one_pass {
        Traversal::Interleaved
    } else {
        Traversal::RowMajor {
            blocks_per_row: geometry.width_blocks,
        }
    };

    info!(
        "{}x{} blocks, {} plane(s), {:?}",
        geometry.width_blocks, geometry.height_blocks, planes, traversal
    );
    Collector::new(geometry, traversal)
}

/// Shows block-level progress of `collector` on a bar.
pub fn with_progress(collector: Collector) -> anyhow::Result<(Collector, ProgressBar)> {
    let bar = ProgressBar::new(collector.total_blocks() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {wide_bar} {pos:>7}/{len:7} ETA: [{eta_precise}] ",
        )?
        .progress_chars("##-"),
    );

    let shown = bar.clone();
    let collector = collector.on_block(move |_| shown.inc(1));
    Ok((collector, bar))
}

/// Error for commands that need a live enclave.
#[cfg(not(feature = "sgx"))]
fn without_sgx() -> anyhow::Error {
    anyhow!("sgx-step was built without the `sgx` feature")
}

impl ImageOptions {
    pub fn collector(&self) -> Collector {
        collector(self.width, self.height, self.color, self.one_pass)
    }
}

/// Where and how reconstructions are written
#[derive(Args, Debug)]
pub struct OutputOptions {
    /// Directory receiving the reconstructed images
    #[clap(short, long, default_value = ".")]
    output: PathBuf,

    /// Prefix of the reconstructed image files
    #[clap(long, default_value = "trace")]
    name: String,

    /// Also write the raw per-block counts as JSON
    #[clap(short, long)]
    raw_output: Option<PathBuf>,

    /// Intensity scale ("max", "min-max", "inverted")
    #[clap(long, default_value = "max")]
    scale: ScaleArg,
}

impl OutputOptions {
    /// Reports unattributed events, then writes the counts and images.
    pub fn write(&self, collector: &Collector) -> anyhow::Result<Vec<PathBuf>> {
        for flag in collector.flags() {
            warn!("{}", Error::from(*flag));
        }

        let counts = Counts::from_collector(collector);
        if let Some(ref path) = self.raw_output {
            write_counts(path, &counts)?;
        }

        let image = reconstruct::reconstruct(&counts, self.scale.into());
        pnm::save(&self.output, &self.name, &image)
            .with_context(|| format!("failed to write images to {}", self.output.display()))
    }
}

fn write_counts(path: &Path, counts: &Counts) -> anyhow::Result<()> {
    let json = counts.to_json()?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    info!("wrote {}", path.display());
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct ScaleArg(Scale);

impl FromStr for ScaleArg {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(Self(Scale::Max)),
            "min-max" => Ok(Self(Scale::MinMax)),
            "inverted" => Ok(Self(Scale::InvertedMinMax)),
            _ => Err(anyhow!("unknown scale {:?}", s)),
        }
    }
}

impl From<ScaleArg> for Scale {
    fn from(arg: ScaleArg) -> Self {
        arg.0
    }
}

/// Common logging / output options
#[derive(Args, Debug)]
pub struct LogOptions {
    /// Increase log verbosity. Pass multiple times for more log output.
    ///
    /// By default we only show error messages. Passing `-v` will show warnings,
    /// `-vv` adds info, `-vvv` for debug, and `-vvvv` for trace.
    #[clap(long = "verbose", short = 'v', parse(from_occurrences))]
    verbosity: u8,

    /// Set fancier logging filters.
    ///
    /// This is equivalent to the `RUST_LOG` environment variable.
    /// For more info, see the `env_logger` crate documentation.
    #[clap(long = "log-filter", env = "SGX_STEP_LOG")]
    log_filter: Option<String>,

    /// Set log output target ("stderr", "stdout")
    #[clap(long, default_value = "stderr")]
    log_target: LogTarget,
}

impl LogOptions {
    /// Build & initialize a global logger using env_logger::Builder.
    /// As with Builder::init(), this will panic if called more than once,
    /// or if another library has already initialized a global logger.
    pub fn init(&self) {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(self.verbosity_level())
            .parse_filters(self.log_filter.as_deref().unwrap_or(""))
            .target(self.log_target.into())
            .init();
    }

    /// Convert the -vvv.. count into a log level.
    fn verbosity_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
enum LogTarget {
    Stdout,
    Stderr,
}

/// Convert a str to a LogTarget. This is how Clap parses CLI args.
impl FromStr for LogTarget {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(anyhow!("unknown log target {:?}", s)),
        }
    }
}

impl From<LogTarget> for env_logger::Target {
    fn from(t: LogTarget) -> Self {
        match t {
            LogTarget::Stdout => Self::Stdout,
            LogTarget::Stderr => Self::Stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Options::command().debug_assert();
    }

    #[test]
    fn parses_scales() {
        assert_eq!(Scale::from("max".parse::<ScaleArg>().unwrap()), Scale::Max);
        assert_eq!(
            Scale::from("Min-Max".parse::<ScaleArg>().unwrap()),
            Scale::MinMax
        );
        assert!("log".parse::<ScaleArg>().is_err());
    }

    #[test]
    fn geometry_from_options() {
        let collector = collector(17, 8, true, false);
        let geometry = collector.geometry();
        assert_eq!(geometry.planes, 3);
        assert_eq!(geometry.width_blocks, 3);
        assert_eq!(geometry.height_blocks, 1);
    }

    #[test]
    fn progress_follows_blocks() {
        let (mut collector, bar) = with_progress(collector(16, 16, true, false)).unwrap();
        assert_eq!(bar.length(), Some(12));

        for count in 0..5 {
            collector.record(count);
        }
        assert_eq!(bar.position(), 5);
    }

    #[test]
    fn attack_command_line() {
        let options = Options::try_parse_from([
            "sgx-step",
            "attack",
            "enclave",
            "--enclave",
            "encl.signed.so",
            "--image",
            "secret.jpg",
            "--step",
        ])
        .unwrap();
        assert!(matches!(options.cmd, Subcommands::Attack(..)));
    }

    #[test]
    fn replay_command_line() {
        let options = Options::try_parse_from([
            "sgx-step",
            "-vv",
            "replay",
            "--vcd",
            "trace.vcd",
            "--width",
            "64",
            "--height",
            "32",
            "--scale",
            "inverted",
        ])
        .unwrap();
        assert_eq!(options.logger.verbosity, 2);
        assert!(matches!(options.cmd, Subcommands::Replay(..)));
    }
}
