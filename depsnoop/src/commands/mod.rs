use anyhow::Result;

pub mod depsnoop_options;
pub mod trace_command;

pub trait DepsnoopCommand {
    /// Run the subcommand; the returned value becomes the process
    /// exit code.
    fn run(&mut self) -> Result<i32>;
}
