use crate::commands::depsnoop_options::{DepsnoopOptions, DepsnoopSubCommand};
use crate::commands::DepsnoopCommand;
use crate::tracer::EbpfTracer;
use anyhow::Result;
use std::path::PathBuf;

pub struct TraceCommand {
    output: Option<PathBuf>,
    command: Vec<String>,
}

impl TraceCommand {
    pub fn new(options: &DepsnoopOptions) -> TraceCommand {
        match options.cmd.clone() {
            DepsnoopSubCommand::Trace { output, command } => TraceCommand { output, command },
        }
    }
}

impl DepsnoopCommand for TraceCommand {
    fn run(&mut self) -> Result<i32> {
        EbpfTracer::new(self.output.take()).run(&self.command)
    }
}
