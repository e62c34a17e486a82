//! Load the kernel program, attach its tracepoints and pump the event
//! stream while the traced command runs.

use crate::btf::resolve_kernel_offsets;
use crate::events::parse_event;
use crate::flags::Flags;
use crate::tracee::spawn_parked;
use anyhow::{anyhow, bail, Context, Result};
use aya::maps::{HashMap, MapData, RingBuf};
use aya::programs::TracePoint;
use aya::{Ebpf, EbpfLoader};
use depsnoop_common::event::{FatalError, FatalErrorKind};
use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;

/// Syscalls observed with an enter/exit program pair. `clone3` is not
/// here: it only has an exit-side program.
const TRACED_SYSCALLS: &[&str] = &[
    "execve",
    "execveat",
    "chdir",
    "fchdir",
    "read",
    "readv",
    "pread64",
    "preadv",
    "write",
    "writev",
    "pwrite64",
    "pwritev",
    "newstat",
    "statx",
    "newfstat",
    "newfstatat",
    "unlink",
    "unlinkat",
    "rename",
    "renameat",
    "mmap",
    "access",
    "faccessat",
    "faccessat2",
    "ftruncate",
    "fallocate",
    "getdents",
    "getdents64",
    "mkdir",
    "mkdirat",
    "rmdir",
    "link",
    "linkat",
    "symlink",
    "symlinkat",
    "readlink",
    "readlinkat",
    "utime",
    "utimensat",
    "fsetxattr",
    "getxattr",
    "lgetxattr",
    "llistxattr",
];

pub struct EbpfTracer {
    output: Option<PathBuf>,
}

impl EbpfTracer {
    pub fn new(output: Option<PathBuf>) -> EbpfTracer {
        EbpfTracer { output }
    }

    /// Run `command` under tracing. Returns the command's exit code
    /// once it has exited and the event stream has drained.
    pub fn run(&mut self, command: &[String]) -> Result<i32> {
        let offsets = resolve_kernel_offsets()?;

        // The child is forked first and parked so the kernel side can
        // be configured with its pid before its first exec runs.
        let tracee = spawn_parked(command)?;
        let root_pid: i32 = tracee.pid.as_raw();

        let mut ebpf = EbpfLoader::new()
            .set_global("ROOT_PPID", &root_pid, true)
            .set_global("KERNEL_OFFSETS", &offsets, true)
            .load(aya::include_bytes_aligned!(concat!(
                env!("OUT_DIR"),
                "/depsnoop"
            )))
            .context("load BPF object")?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            debug!("kernel-side logger unavailable: {e}");
        }

        attach_all(&mut ebpf)?;

        let mut ring = RingBuf::try_from(
            ebpf.take_map("EVENTS")
                .ok_or_else(|| anyhow!("EVENTS map missing"))?,
        )?;
        let errors: HashMap<_, u32, FatalError> = HashMap::try_from(
            ebpf.map("FATAL_ERRORS")
                .ok_or_else(|| anyhow!("FATAL_ERRORS map missing"))?,
        )?;

        let mut sink: Box<dyn Write> = match &self.output {
            Some(path) => Box::new(BufWriter::new(
                File::create(path).with_context(|| format!("create {}", path.display()))?,
            )),
            None => Box::new(std::io::stdout().lock()),
        };

        tracee.release()?;

        let mut last_error: Option<FatalError> = None;
        let mut exit_code = 0;
        let mut root_exited = false;
        loop {
            let drained = drain(&mut ring, sink.as_mut())?;
            report_fatal_errors(&errors, &mut last_error)?;

            if root_exited {
                // Keep draining until the stream goes quiet; events
                // from late descendants may still be in flight.
                if drained == 0 {
                    break;
                }
                continue;
            }
            if let Some(status) = tracee.try_wait() {
                root_exited = true;
                exit_code = status.shell_exit_code();
                continue;
            }

            let ring_fd = unsafe { BorrowedFd::borrow_raw(ring.as_raw_fd()) };
            let mut poll_fds = [PollFd::new(ring_fd, PollFlags::POLLIN)];
            let _ = poll(
                &mut poll_fds,
                PollTimeout::from(Flags::get().poll_timeout_ms),
            );
        }
        sink.flush()?;
        Ok(exit_code)
    }
}

fn drain(ring: &mut RingBuf<MapData>, sink: &mut dyn Write) -> Result<usize> {
    let mut count = 0;
    while let Some(frame) = ring.next() {
        match parse_event(&frame) {
            Ok(event) => {
                serde_json::to_writer(&mut *sink, &event)?;
                sink.write_all(b"\n")?;
            }
            Err(e) => warn!("dropped undecodable frame: {e}"),
        }
        count += 1;
    }
    Ok(count)
}

fn report_fatal_errors(
    errors: &HashMap<&MapData, u32, FatalError>,
    last: &mut Option<FatalError>,
) -> Result<()> {
    let current = match errors.get(&0, 0) {
        Ok(error) => error,
        // An empty slot means nothing has gone wrong yet.
        Err(_) => return Ok(()),
    };
    if last.as_ref() == Some(&current) {
        return Ok(());
    }
    *last = Some(current);

    let kind = FatalErrorKind::from_raw(current.kind);
    if Flags::get().fatal_errors_and_warnings {
        bail!(
            "kernel program reported {:?} at line {}",
            kind,
            current.line
        );
    }
    warn!(
        "kernel program reported {:?} at line {}",
        kind, current.line
    );
    Ok(())
}

fn attach_all(ebpf: &mut Ebpf) -> Result<()> {
    for syscall in TRACED_SYSCALLS {
        for prefix in ["sys_enter_", "sys_exit_"] {
            let name = format!("{prefix}{syscall}");
            attach_tracepoint(ebpf, "syscalls", &name, &name)?;
        }
    }
    attach_tracepoint(ebpf, "syscalls", "sys_exit_clone3", "sys_exit_clone3")?;
    attach_tracepoint(ebpf, "sched", "sched_process_exit", "sched_process_exit")?;
    Ok(())
}

fn attach_tracepoint(ebpf: &mut Ebpf, category: &str, name: &str, program: &str) -> Result<()> {
    let prog: &mut TracePoint = ebpf
        .program_mut(program)
        .ok_or_else(|| anyhow!("program {program} not found in object"))?
        .try_into()?;
    prog.load().with_context(|| format!("load {program}"))?;
    prog.attach(category, name)
        .with_context(|| format!("attach {category}/{name}"))?;
    Ok(())
}
