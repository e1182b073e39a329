//! CLI argument definitions

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::dump::DumpFormat;
use crate::recorder::RecordConfig;
use crate::systrace::ftrace::TraceClock;
use crate::systrace::Backend;

#[derive(Parser)]
#[command(
    name = "tracepipe",
    version,
    about = "Record thread scheduling events into a trace stream",
    after_help = "\
EXAMPLES:
    sudo tracepipe record --duration 10           Record for 10 seconds
    sudo tracepipe record --output run.tpip       Record until Ctrl+C
    tracepipe dump run.tpip --json                Print records as JSON lines"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Capture scheduling events into a stream file
    Record(RecordArgs),
    /// Print the records of a stream file
    Dump(DumpArgs),
}

#[derive(Args)]
pub struct RecordArgs {
    /// Kernel telemetry source (defaults to the platform's own)
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Stream file to write
    #[arg(short, long, value_name = "FILE", default_value = "trace.tpip")]
    pub output: PathBuf,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// tracefs mount point (probed when omitted)
    #[arg(long, value_name = "DIR")]
    pub tracefs: Option<PathBuf>,

    /// Timestamp source for ftrace (defaults to the one matching this build)
    #[arg(long, value_enum)]
    pub clock: Option<ClockArg>,

    /// Do not resolve thread and process names
    #[arg(long)]
    pub no_names: bool,

    /// Start paused; SIGUSR1 toggles system event capture
    #[arg(long)]
    pub on_demand: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct DumpArgs {
    /// Stream file written by `tracepipe record`
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// One JSON object per line instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Ftrace,
    Etw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockArg {
    Default,
    Tsc,
    MonoRaw,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Ftrace => Backend::Ftrace,
            BackendArg::Etw => Backend::Etw,
        }
    }
}

impl From<ClockArg> for TraceClock {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Default => TraceClock::Default,
            ClockArg::Tsc => TraceClock::Tsc,
            ClockArg::MonoRaw => TraceClock::MonoRaw,
        }
    }
}

impl RecordArgs {
    #[must_use]
    pub fn to_config(&self) -> RecordConfig {
        let defaults = RecordConfig::default();
        RecordConfig {
            backend: self.backend.map_or(defaults.backend, Backend::from),
            output: self.output.clone(),
            duration: (self.duration > 0).then(|| Duration::from_secs(self.duration)),
            tracefs: self.tracefs.clone(),
            clock: self.clock.map_or(defaults.clock, TraceClock::from),
            resolve_names: !self.no_names,
            on_demand: self.on_demand,
            idle_sleep: defaults.idle_sleep,
        }
    }
}

impl DumpArgs {
    #[must_use]
    pub fn format(&self) -> DumpFormat {
        if self.json {
            DumpFormat::JsonLines
        } else {
            DumpFormat::Text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults() {
        let cli = Cli::try_parse_from(["tracepipe", "record"]).unwrap();
        let Command::Record(args) = cli.command else { panic!("expected record") };
        let config = args.to_config();
        assert_eq!(config.backend, Backend::platform_default());
        assert_eq!(config.output, PathBuf::from("trace.tpip"));
        assert_eq!(config.duration, None);
        assert!(config.resolve_names);
        assert!(!config.on_demand);
    }

    #[test]
    fn test_record_flags() {
        let cli = Cli::try_parse_from([
            "tracepipe", "record", "--backend", "ftrace", "--duration", "5", "--clock", "mono-raw",
            "--tracefs", "/tmp/tracing", "--no-names", "--on-demand",
        ])
        .unwrap();
        let Command::Record(args) = cli.command else { panic!("expected record") };
        let config = args.to_config();
        assert_eq!(config.backend, Backend::Ftrace);
        assert_eq!(config.duration, Some(Duration::from_secs(5)));
        assert_eq!(config.clock, TraceClock::MonoRaw);
        assert_eq!(config.tracefs, Some(PathBuf::from("/tmp/tracing")));
        assert!(!config.resolve_names);
        assert!(config.on_demand);
    }

    #[test]
    fn test_dump_requires_file() {
        assert!(Cli::try_parse_from(["tracepipe", "dump"]).is_err());
        let cli = Cli::try_parse_from(["tracepipe", "dump", "run.tpip", "--json"]).unwrap();
        let Command::Dump(args) = cli.command else { panic!("expected dump") };
        assert_eq!(args.format(), DumpFormat::JsonLines);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["tracepipe", "record", "--backend", "dtrace"]).is_err());
    }
}
