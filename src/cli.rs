use std::num::NonZeroU32;
use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[clap(about, version)]
pub enum Cli {
    Run(RunCmd),
    Info(InfoCmd),
}

#[derive(Debug, clap::Args)]
pub struct DeviceArgs {
    /// Name of the bdev to use.
    #[clap(long, short)]
    pub bdev: Option<String>,
    /// The configuration file defining bdevs and run defaults. If unset,
    /// `$XDG_CONFIG_HOME/iocmd/config.toml` is used when it exists, otherwise a built-in zoned
    /// `Malloc0` device.
    #[clap(long, short)]
    pub config_file: Option<PathBuf>,
}

/// Run the I/O command pipeline against a bdev.
///
/// A zoned bdev goes through zone info discovery, reset of zone #0 ~ #14, append to and read
/// back of zone #0 ~ #4, open of zone #5 ~ #14 and close of zone #10 ~ #14. A conventional bdev
/// gets one block written and read back. Each stage starts only after every command of the
/// previous one completed. The first failure aborts the run with a non-zero exit code.
#[derive(Debug, clap::Args)]
pub struct RunCmd {
    #[clap(flatten)]
    pub device: DeviceArgs,
    /// Fail if a stage makes no progress for this long, eg. "30s".
    #[clap(long)]
    pub stage_timeout: Option<humantime::Duration>,
    /// Repeat the pipeline this many times. The reported zone geometry must not change.
    #[clap(long)]
    pub runs: Option<NonZeroU32>,
}

/// Print properties of a bdev without submitting any command.
#[derive(Debug, clap::Args)]
pub struct InfoCmd {
    #[clap(flatten)]
    pub device: DeviceArgs,
    /// Print as JSON.
    #[clap(long)]
    pub json: bool,
}
