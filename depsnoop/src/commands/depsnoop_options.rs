use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "depsnoop", about = "Trace the file-system activity of a command tree")]
pub struct DepsnoopOptions {
    #[structopt(subcommand)]
    pub cmd: DepsnoopSubCommand,
}

#[derive(Clone, Debug, StructOpt)]
pub enum DepsnoopSubCommand {
    /// Run a command under tracing and stream its file-system events
    /// as JSON lines, e.g. `depsnoop trace -- make -j8`.
    #[structopt(name = "trace")]
    Trace {
        /// Write events to this file instead of stdout.
        #[structopt(short = "o", long = "output", parse(from_os_str))]
        output: Option<PathBuf>,

        /// The command to trace and its arguments.
        #[structopt(required = true, last = true)]
        command: Vec<String>,
    },
}
