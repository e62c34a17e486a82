//! depsnoop: trace the file-system activity of a command tree.
//!
//! The binary loads the kernel-side tracing program, runs the given
//! command under it and streams every observed file-system access of
//! the command and its descendants as JSON lines. The stream is meant
//! to feed build-correctness audits: undeclared inputs show up as
//! `input` events, undeclared outputs as `output` events.

mod btf;
mod commands;
mod events;
mod flags;
mod tracee;
mod tracer;
mod wait_status;

use crate::commands::depsnoop_options::{DepsnoopOptions, DepsnoopSubCommand};
use crate::commands::trace_command::TraceCommand;
use crate::commands::DepsnoopCommand;
use structopt::StructOpt;

fn main() {
    env_logger::init();
    let options = DepsnoopOptions::from_args();
    let mut command: Box<dyn DepsnoopCommand> = match options.cmd {
        DepsnoopSubCommand::Trace { .. } => Box::new(TraceCommand::new(&options)),
    };
    match command.run() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            log::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
