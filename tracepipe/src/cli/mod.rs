//! Command-line interface

mod args;

pub use args::{BackendArg, Cli, ClockArg, Command, DumpArgs, RecordArgs};
