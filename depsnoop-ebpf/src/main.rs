//! The in-kernel tracing engine.
//!
//! Tracepoint programs attached to ~40 file-system syscalls follow a
//! command tree starting at a configured root process and emit one
//! event per distinct file-system access over a ring buffer. Each
//! observed syscall has an enter program that samples arguments while
//! they are still live (user pointers, FD tables, dentry chains) and
//! stages a partially built event keyed by `pid_tgid`, and an exit
//! program that commits or discards the staged event depending on the
//! syscall's return value. Process lineage (`execve`, `execveat`,
//! `clone3`) maintains the registry of traced tasks; the scheduler's
//! exit tracepoint retires them.
//!
//! Everything here runs under the BPF verifier: loops are statically
//! bounded, there is no allocation beyond map inserts and ring-buffer
//! reservations, and no handler ever blocks or returns an error to
//! the kernel.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_current_task, bpf_probe_read_kernel,
        bpf_probe_read_kernel_str_bytes, bpf_probe_read_user, bpf_probe_read_user_str_bytes,
    },
    macros::{map, tracepoint},
    maps::{HashMap, RingBuf},
    programs::TracePointContext,
};
use aya_log_ebpf::debug;
use depsnoop_common::{
    Event, EventHeader, EventKind, Fat2Event, FatEvent, FatalError, FatalErrorKind, KernelOffsets,
    PathTuple, ProcessInfo, AT_FDCWD, MAP_SHARED, PATH_COMPONENT_LEN, PATH_DEPTH, PROT_WRITE,
    S_IFIFO,
};

// From <linux/magic.h> and <linux/major.h>.
const PROC_SUPER_MAGIC: u64 = 0x9fa0;
const UNIX98_PTY_SLAVE_MAJOR: u32 = 136;
// From <linux/kdev_t.h>: a dev_t is MAJOR << 20 | MINOR.
const MINOR_BITS: u32 = 20;

/// Tasks the registry can hold at once.
const PROCESS_CAPACITY: u32 = 8192;

/// Staging capacity matches the registry so an allocation failure
/// means a real enter/exit mismatch, not map exhaustion.
const STAGING_CAPACITY: u32 = 8192;

/// Thread-group id of the process whose first exec starts the trace.
/// Written by the loader before attachment.
#[no_mangle]
static ROOT_PPID: i32 = 0;

/// Kernel structure offsets, resolved from BTF by the loader.
#[no_mangle]
static KERNEL_OFFSETS: KernelOffsets = KernelOffsets::zeroed();

fn root_ppid() -> i32 {
    unsafe { core::ptr::read_volatile(&ROOT_PPID) }
}

fn offsets() -> KernelOffsets {
    unsafe { core::ptr::read_volatile(&KERNEL_OFFSETS) }
}

/// Seed for unique process ids, shared across all CPUs.
static NEXT_UID: AtomicU64 = AtomicU64::new(0);

fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Committed events, kernel to userspace.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(16 * 1024 * 1024, 0);

/// One-slot channel holding the most recent internal error.
#[map]
static FATAL_ERRORS: HashMap<u32, FatalError> = HashMap::with_max_entries(1, 0);

/// The process registry: thread-group id of every traced task.
#[map]
static PROCESSES: HashMap<i32, ProcessInfo> = HashMap::with_max_entries(PROCESS_CAPACITY, 0);

/// Per-task scratch slot carrying an event from syscall entry to exit.
#[map]
static STAGING: HashMap<u64, StagedEvent> = HashMap::with_max_entries(STAGING_CAPACITY, 0);

#[inline(never)]
fn report_fatal_error(kind: FatalErrorKind, line: i32) {
    let error = FatalError {
        kind: kind as i32,
        line,
    };
    let _ = FATAL_ERRORS.insert(&0, &error, 0);
}

const STAGED_SMALL: u8 = 0;
const STAGED_FAT: u8 = 1;
const STAGED_FAT2: u8 = 2;

/// A staged event of any size class, tagged with the class so the
/// exit-side committer knows how much to reserve.
#[repr(C)]
struct StagedEvent {
    class: u8,
    body: StagedBody,
}

#[repr(C)]
union StagedBody {
    event: Event,
    fat: FatEvent,
    fat2: Fat2Event,
}

/// Zero template inserted on allocation. Lives in a static because
/// the largest class is far beyond the BPF stack limit.
static EMPTY_STAGED: StagedEvent = StagedEvent {
    class: STAGED_SMALL,
    body: StagedBody {
        fat2: Fat2Event {
            header: EventHeader {
                kind: 0,
                pid: 0,
                uid: 0,
                source_line: 0,
            },
            paths: [[[0; PATH_COMPONENT_LEN]; PATH_DEPTH]; 4],
        },
    },
};

/// Allocate the staging slot for `pid_tgid` with create-only
/// semantics. At most one slot per task may exist; a second enter
/// before the paired exit reports a conflict and allocates nothing.
fn staging_allocate(pid_tgid: u64, class: u8, line: i32) -> Option<*mut StagedEvent> {
    if STAGING
        .insert(&pid_tgid, &EMPTY_STAGED, BPF_NOEXIST as u64)
        .is_err()
    {
        let kind = if STAGING.get_ptr(&pid_tgid).is_some() {
            FatalErrorKind::StagingConflict
        } else {
            FatalErrorKind::StagingEventFull
        };
        report_fatal_error(kind, line);
        return None;
    }
    match STAGING.get_ptr_mut(&pid_tgid) {
        Some(staged) => {
            unsafe { (*staged).class = class };
            Some(staged)
        }
        None => {
            report_fatal_error(FatalErrorKind::StagingEventNotAllocated, line);
            None
        }
    }
}

fn staging_discard(pid_tgid: u64) {
    let _ = STAGING.remove(&pid_tgid);
}

fn stage_event(pid_tgid: u64, line: i32) -> Option<*mut Event> {
    staging_allocate(pid_tgid, STAGED_SMALL, line)
        .map(|staged| unsafe { &raw mut (*staged).body.event })
}

fn stage_fat_event(pid_tgid: u64, line: i32) -> Option<*mut FatEvent> {
    staging_allocate(pid_tgid, STAGED_FAT, line).map(|staged| unsafe { &raw mut (*staged).body.fat })
}

fn stage_fat2_event(pid_tgid: u64, line: i32) -> Option<*mut Fat2Event> {
    staging_allocate(pid_tgid, STAGED_FAT2, line)
        .map(|staged| unsafe { &raw mut (*staged).body.fat2 })
}

// Tracepoint data layout is fixed for the syscalls category: 8 bytes
// of common fields, the syscall number, then six 8-byte arguments on
// enter or the return value on exit.
const SYSCALL_ARG0_OFFSET: usize = 16;
const SYSCALL_RET_OFFSET: usize = 16;

fn syscall_arg(ctx: &TracePointContext, n: usize) -> u64 {
    unsafe { ctx.read_at::<u64>(SYSCALL_ARG0_OFFSET + 8 * n) }.unwrap_or(0)
}

fn syscall_ret(ctx: &TracePointContext) -> i64 {
    unsafe { ctx.read_at::<i64>(SYSCALL_RET_OFFSET) }.unwrap_or(-1)
}

/// Copy one committed event into the ring buffer. Returns false when
/// the buffer has no room, in which case the event is lost.
unsafe fn submit<T: 'static>(event: *const T) -> bool {
    match EVENTS.reserve::<T>(0) {
        Some(mut slot) => {
            core::ptr::copy_nonoverlapping(event, slot.as_mut_ptr(), 1);
            slot.submit(0);
            true
        }
        None => false,
    }
}

/// The shared exit-side half of every traced syscall: look up the
/// staged event, discard it if the syscall failed, commit it to the
/// ring buffer otherwise. Kind-agnostic; all syscall-specific logic
/// happened at entry.
fn commit_staged(ctx: &TracePointContext) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let staged = match STAGING.get_ptr(&pid_tgid) {
        Some(staged) => staged,
        None => return,
    };

    if syscall_ret(ctx) < 0 {
        staging_discard(pid_tgid);
        return;
    }

    let committed = unsafe {
        match (*staged).class {
            STAGED_FAT => submit(&raw const (*staged).body.fat),
            STAGED_FAT2 => submit(&raw const (*staged).body.fat2),
            _ => submit(&raw const (*staged).body.event),
        }
    };
    if !committed {
        report_fatal_error(FatalErrorKind::RingBufferFull, line!() as i32);
    }
    staging_discard(pid_tgid);
}

/// Probe-read one field of a kernel structure at `base + offset`.
unsafe fn read_field<T>(base: *const u8, offset: usize) -> Result<T, i64> {
    bpf_probe_read_kernel(base.add(offset) as *const T)
}

fn current_parent_tgid() -> i32 {
    let off = offsets();
    let task = bpf_get_current_task() as *const u8;
    unsafe {
        match read_field::<*const u8>(task, off.task_real_parent as usize) {
            Ok(parent) => read_field::<i32>(parent, off.task_tgid as usize).unwrap_or(0),
            Err(_) => 0,
        }
    }
}

/// A file object reachable from the current task, reduced to the two
/// pointers the handlers need.
#[derive(Clone, Copy)]
struct TracedFile {
    dentry: *const u8,
    inode: *const u8,
}

/// Resolve an FD (or the AT_FDCWD sentinel, via `task->fs->pwd`) to
/// its directory entry. Returns None for objects that never belong in
/// a build trace: anything mounted on procfs and UNIX98 pty slaves.
fn traced_dentry(fd: i32) -> Option<TracedFile> {
    let off = offsets();
    let task = bpf_get_current_task() as *const u8;
    unsafe {
        let (mnt, dentry): (*const u8, *const u8) = if fd == AT_FDCWD {
            let fs: *const u8 = read_field(task, off.task_fs as usize).ok()?;
            let mnt = read_field(fs, (off.fs_pwd + off.path_mnt) as usize).ok()?;
            let dentry = read_field(fs, (off.fs_pwd + off.path_dentry) as usize).ok()?;
            (mnt, dentry)
        } else {
            if fd < 0 {
                return None;
            }
            let files: *const u8 = read_field(task, off.task_files as usize).ok()?;
            let fdt: *const u8 = read_field(files, off.files_fdt as usize).ok()?;
            let fd_array: *const u8 = read_field(fdt, off.fdt_fd as usize).ok()?;
            let file: *const u8 = read_field(fd_array, fd as usize * 8).ok()?;
            if file.is_null() {
                return None;
            }
            let mnt = read_field(file, (off.file_f_path + off.path_mnt) as usize).ok()?;
            let dentry = read_field(file, (off.file_f_path + off.path_dentry) as usize).ok()?;
            (mnt, dentry)
        };

        let sb: *const u8 = read_field(mnt, off.vfsmount_mnt_sb as usize).ok()?;
        let magic: u64 = read_field(sb, off.sb_s_magic as usize).ok()?;
        if magic == PROC_SUPER_MAGIC {
            return None;
        }

        let inode: *const u8 = read_field(dentry, off.dentry_d_inode as usize).ok()?;
        let rdev: u32 = read_field(inode, off.inode_i_rdev as usize).ok()?;
        if rdev >> MINOR_BITS == UNIX98_PTY_SLAVE_MAJOR {
            return None;
        }
        Some(TracedFile { dentry, inode })
    }
}

/// Walk a directory-entry chain into a path tuple, leaf first.
///
/// The kernel's root entry is its own parent; pointer equality against
/// the previous entry detects it (names are not reliable for this).
/// Any probe failure aborts the whole encode.
unsafe fn read_dentry_chain(dentry: *const u8, path: &mut PathTuple) -> Result<(), i64> {
    let off = offsets();
    let mut cur = dentry;
    let name: *const u8 = read_field(cur, off.dentry_d_name_name as usize)?;
    bpf_probe_read_kernel_str_bytes(name, &mut path[0])?;
    for row in 1..PATH_DEPTH {
        let parent: *const u8 = read_field(cur, off.dentry_d_parent as usize)?;
        if parent == cur {
            break;
        }
        cur = parent;
        let name: *const u8 = read_field(cur, off.dentry_d_name_name as usize)?;
        bpf_probe_read_kernel_str_bytes(name, &mut path[row])?;
    }
    Ok(())
}

/// Copy a NUL-terminated userspace string into row 0 of a tuple,
/// truncating at the component cap.
unsafe fn read_user_path(src: *const u8, path: &mut PathTuple) -> Result<(), i64> {
    bpf_probe_read_user_str_bytes(src, &mut path[0])?;
    Ok(())
}

fn is_empty_user_string(path: *const u8) -> bool {
    match unsafe { bpf_probe_read_user(path) } {
        Ok(first) => first == 0u8,
        Err(_) => true,
    }
}

/// Tooling inspects itself through this link; those probes are noise.
fn is_self_probe(path: *const u8) -> bool {
    const SELF_EXE: &[u8] = b"/proc/self/exe";
    let mut buf = [0u8; 15];
    match unsafe { bpf_probe_read_user_str_bytes(path, &mut buf) } {
        Ok(read) => read == SELF_EXE,
        Err(_) => false,
    }
}

fn init_header(header: *mut EventHeader, pid: i32, uid: u64, kind: EventKind, line: i32) {
    unsafe {
        (*header).kind = kind as i32;
        (*header).pid = pid;
        (*header).uid = uid;
        (*header).source_line = line;
    }
}

fn tracked_uid(pid: i32) -> Option<u64> {
    unsafe { PROCESSES.get(&pid) }.map(|pinfo| pinfo.uid)
}

/// Stage a deduplicated access event for an already-resolved file.
///
/// The fingerprint window suppresses bursts of the same (inode, kind)
/// pair. FIFOs have no useful path; they carry the inode number in
/// the payload and leave the tuple empty.
fn submit_fd_event_with_dentry(
    pinfo: *mut ProcessInfo,
    pid_tgid: u64,
    file: TracedFile,
    kind: EventKind,
    line: i32,
) {
    let off = offsets();
    let ino = unsafe { read_field::<u64>(file.inode, off.inode_i_ino as usize) }.unwrap_or(0) as u32;
    if !unsafe { (*pinfo).insert_fingerprint(ino, kind as i32) } {
        return;
    }

    let pid = (pid_tgid >> 32) as i32;
    let event = match stage_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        init_header(&raw mut (*event).header, pid, (*pinfo).uid, kind, line);

        let mode: u16 = read_field(file.inode, off.inode_i_mode as usize).unwrap_or(0);
        if mode & S_IFIFO != 0 {
            (*event).payload = ino as i32;
            return;
        }

        if read_dentry_chain(file.dentry, &mut (*event).path).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadDentryStr, line);
        }
    }
}

fn submit_fd_event(fd: i32, kind: EventKind, line: i32) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let pinfo = match PROCESSES.get_ptr_mut(&pid) {
        Some(pinfo) => pinfo,
        None => return,
    };
    let file = match traced_dentry(fd) {
        Some(file) => file,
        None => return,
    };
    submit_fd_event_with_dentry(pinfo, pid_tgid, file, kind, line);
}

fn submit_path_event_unchecked(pid_tgid: u64, uid: u64, path: *const u8, kind: EventKind, line: i32) {
    let pid = (pid_tgid >> 32) as i32;
    let event = match stage_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        if read_user_path(path, &mut (*event).path).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadUserStr, line);
            return;
        }
        init_header(&raw mut (*event).header, pid, uid, kind, line);
    }
}

fn submit_path_event(path: *const u8, kind: EventKind, line: i32) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let uid = match tracked_uid(pid) {
        Some(uid) => uid,
        None => return,
    };
    submit_path_event_unchecked(pid_tgid, uid, path, kind, line);
}

fn submit_fat_path_event(path1: *const u8, path2: *const u8, kind: EventKind, line: i32) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let uid = match tracked_uid(pid) {
        Some(uid) => uid,
        None => return,
    };
    let event = match stage_fat_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        if read_user_path(path1, &mut (*event).paths[0]).is_err()
            || read_user_path(path2, &mut (*event).paths[1]).is_err()
        {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadUserStr, line);
            return;
        }
        init_header(&raw mut (*event).header, pid, uid, kind, line);
    }
}

/// Single-path at-form submission. The caller picks the at-form kind;
/// the fast paths collapse it together with the event class.
fn submit_path_at_event(dfd: i32, path: *const u8, kind: EventKind, line: i32) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let pinfo = match PROCESSES.get_ptr_mut(&pid) {
        Some(pinfo) => pinfo,
        None => return,
    };

    if dfd == AT_FDCWD {
        // No base tuple needed, the path stands on its own.
        let uid = unsafe { (*pinfo).uid };
        submit_path_event_unchecked(pid_tgid, uid, path, kind.collapsed(), line);
        return;
    }

    let file = match traced_dentry(dfd) {
        Some(file) => file,
        None => return,
    };

    if is_empty_user_string(path) {
        // Empty relative path addresses the base object itself.
        submit_fd_event_with_dentry(pinfo, pid_tgid, file, kind.collapsed(), line);
        return;
    }

    let event = match stage_fat_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        if read_dentry_chain(file.dentry, &mut (*event).paths[0]).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadDentryStr, line);
            return;
        }
        if read_user_path(path, &mut (*event).paths[1]).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadUserStr, line);
            return;
        }
        init_header(&raw mut (*event).header, pid, (*pinfo).uid, kind, line);
    }
}

/// Two-FD, two-path at-form submission (`linkat`, `renameat`): both
/// base directories are encoded in full, then both relative paths.
fn submit_fd2_path2_at_event(
    dfd1: i32,
    dfd2: i32,
    path1: *const u8,
    path2: *const u8,
    kind: EventKind,
    line: i32,
) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let uid = match tracked_uid(pid) {
        Some(uid) => uid,
        None => return,
    };

    let event = match stage_fat2_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        for (slot, dfd) in [(0usize, dfd1), (1usize, dfd2)] {
            let file = match traced_dentry(dfd) {
                Some(file) => file,
                None => {
                    staging_discard(pid_tgid);
                    report_fatal_error(FatalErrorKind::ReadDentryStr, line);
                    return;
                }
            };
            if read_dentry_chain(file.dentry, &mut (*event).paths[slot]).is_err() {
                staging_discard(pid_tgid);
                report_fatal_error(FatalErrorKind::ReadDentryStr, line);
                return;
            }
        }
        if read_user_path(path1, &mut (*event).paths[2]).is_err()
            || read_user_path(path2, &mut (*event).paths[3]).is_err()
        {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadUserStr, line);
            return;
        }
        init_header(&raw mut (*event).header, pid, uid, kind, line);
    }
}

/// One-FD, two-path at-form submission (`symlinkat` with a real base
/// FD): the base tuple, then the link target and the link path.
fn submit_fd1_path2_at_event(
    dfd: i32,
    path1: *const u8,
    path2: *const u8,
    kind: EventKind,
    line: i32,
) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let uid = match tracked_uid(pid) {
        Some(uid) => uid,
        None => return,
    };

    let event = match stage_fat2_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        let file = match traced_dentry(dfd) {
            Some(file) => file,
            None => {
                staging_discard(pid_tgid);
                report_fatal_error(FatalErrorKind::ReadDentryStr, line);
                return;
            }
        };
        if read_dentry_chain(file.dentry, &mut (*event).paths[0]).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadDentryStr, line);
            return;
        }
        if read_user_path(path1, &mut (*event).paths[1]).is_err()
            || read_user_path(path2, &mut (*event).paths[2]).is_err()
        {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadUserStr, line);
            return;
        }
        init_header(&raw mut (*event).header, pid, uid, kind, line);
    }
}

/// Admit the current task to the registry if its parent is traced (or
/// it is the configured root), assigning a fresh uid. Returns None
/// when the task is outside the traced tree.
fn admit_current(pid: i32, ppid: i32) -> Option<ProcessInfo> {
    if unsafe { PROCESSES.get(&ppid) }.is_none() && pid != root_ppid() {
        return None;
    }
    let pinfo = ProcessInfo::new(ppid, next_uid());
    // Task-id reuse after an uncollected exit counts as a new process.
    let _ = PROCESSES.insert(&pid, &pinfo, 0);
    Some(pinfo)
}

fn handle_execve(ctx: &TracePointContext) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let ppid = current_parent_tgid();
    let pinfo = match admit_current(pid, ppid) {
        Some(pinfo) => pinfo,
        None => return,
    };
    debug!(ctx, "execve pid={} ppid={}", pid, ppid);

    let line = line!() as i32;
    let event = match stage_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        if read_user_path(syscall_arg(ctx, 0) as *const u8, &mut (*event).path).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadUserStr, line);
            return;
        }
        init_header(&raw mut (*event).header, pid, pinfo.uid, EventKind::Exec, line);
        (*event).payload = ppid;
    }
}

fn handle_execveat(ctx: &TracePointContext) {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let ppid = current_parent_tgid();
    let pinfo = match admit_current(pid, ppid) {
        Some(pinfo) => pinfo,
        None => return,
    };

    let dfd = syscall_arg(ctx, 0) as i32;
    let path = syscall_arg(ctx, 1) as *const u8;
    let line = line!() as i32;

    if dfd == AT_FDCWD {
        // No base tuple needed: a plain exec of a path.
        let event = match stage_event(pid_tgid, line) {
            Some(event) => event,
            None => return,
        };
        unsafe {
            if read_user_path(path, &mut (*event).path).is_err() {
                staging_discard(pid_tgid);
                report_fatal_error(FatalErrorKind::ReadUserStr, line);
                return;
            }
            init_header(&raw mut (*event).header, pid, pinfo.uid, EventKind::Exec, line);
            (*event).payload = ppid;
        }
        return;
    }

    let file = match traced_dentry(dfd) {
        Some(file) => file,
        None => return,
    };
    let event = match stage_fat_event(pid_tgid, line) {
        Some(event) => event,
        None => return,
    };
    unsafe {
        if read_dentry_chain(file.dentry, &mut (*event).paths[0]).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadDentryStr, line);
            return;
        }
        if read_user_path(path, &mut (*event).paths[1]).is_err() {
            staging_discard(pid_tgid);
            report_fatal_error(FatalErrorKind::ReadUserStr, line);
            return;
        }
        init_header(&raw mut (*event).header, pid, pinfo.uid, EventKind::ExecAt, line);
        (*event).payload = ppid;
    }
}

/// `clone3` is observed only on the child branch of its exit: the
/// child's own follow-up syscalls (its execve in particular) can be
/// handled before the parent's exit tracepoint fires, so admission
/// must not depend on the parent side.
fn handle_clone3(ctx: &TracePointContext) {
    if syscall_ret(ctx) != 0 {
        return;
    }

    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let tid = pid_tgid as i32;
    if pid != tid {
        // CLONE_THREAD: threads are folded into their process and
        // never admitted on their own.
        return;
    }

    let ppid = current_parent_tgid();
    if unsafe { PROCESSES.get(&ppid) }.is_none() && ppid != root_ppid() {
        return;
    }
    debug!(ctx, "clone3 pid={} ppid={}", pid, ppid);

    let pinfo = ProcessInfo::new(ppid, next_uid());
    let _ = PROCESSES.insert(&pid, &pinfo, 0);

    // Success is already known here, so the event skips staging and
    // goes straight to the ring buffer.
    let line = line!() as i32;
    match EVENTS.reserve::<Event>(0) {
        Some(mut slot) => unsafe {
            let event = slot.as_mut_ptr();
            init_header(&raw mut (*event).header, pid, pinfo.uid, EventKind::Clone, line);
            (*event).payload = ppid;
            (*event).path[0][0] = 0;
            slot.submit(0);
        },
        None => report_fatal_error(FatalErrorKind::RingBufferFull, line),
    }
}

fn handle_mmap(ctx: &TracePointContext) {
    let prot = syscall_arg(ctx, 2);
    let flags = syscall_arg(ctx, 3);
    let fd = syscall_arg(ctx, 4) as i32;
    if fd == -1 {
        // Anonymous mapping, no file behind it.
        return;
    }
    let kind = if flags & MAP_SHARED != 0 && prot & PROT_WRITE != 0 {
        EventKind::Output
    } else {
        EventKind::Input
    };
    submit_fd_event(fd, kind, line!() as i32);
}

fn handle_symlinkat(ctx: &TracePointContext) {
    let target = syscall_arg(ctx, 0) as *const u8;
    let dfd = syscall_arg(ctx, 1) as i32;
    let linkpath = syscall_arg(ctx, 2) as *const u8;
    if dfd == AT_FDCWD {
        submit_fat_path_event(target, linkpath, EventKind::Symlink, line!() as i32);
        return;
    }
    submit_fd1_path2_at_event(dfd, target, linkpath, EventKind::SymlinkAt, line!() as i32);
}

/// Emit the task's Exit event and retire it from the registry. Fires
/// for every dying task; only the thread-group leader retires the
/// process record.
#[tracepoint]
pub fn sched_process_exit(_ctx: TracePointContext) -> u32 {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as i32;
    let tid = pid_tgid as i32;
    if pid != tid {
        return 0;
    }
    let uid = match tracked_uid(pid) {
        Some(uid) => uid,
        None => return 0,
    };

    let off = offsets();
    let task = bpf_get_current_task() as *const u8;
    let exit_code = unsafe { read_field::<i32>(task, off.task_exit_code as usize) }.unwrap_or(0);

    let line = line!() as i32;
    match EVENTS.reserve::<Event>(0) {
        Some(mut slot) => unsafe {
            let event = slot.as_mut_ptr();
            init_header(&raw mut (*event).header, pid, uid, EventKind::Exit, line);
            (*event).payload = exit_code >> 8;
            (*event).path[0][0] = 0;
            slot.submit(0);
        },
        None => report_fatal_error(FatalErrorKind::RingBufferFull, line),
    }

    let _ = PROCESSES.remove(&pid);
    0
}

/// `clone3` has no enter-side program; only the child branch of the
/// exit matters.
#[tracepoint]
pub fn sys_exit_clone3(ctx: TracePointContext) -> u32 {
    handle_clone3(&ctx);
    0
}

/// One enter/exit program pair per observed syscall. The exit side is
/// always the shared committer.
macro_rules! trace_syscall {
    ($enter:ident, $exit:ident, |$ctx:ident| $body:expr) => {
        #[tracepoint]
        pub fn $enter($ctx: TracePointContext) -> u32 {
            $body;
            0
        }

        #[tracepoint]
        pub fn $exit(ctx: TracePointContext) -> u32 {
            commit_staged(&ctx);
            0
        }
    };
}

trace_syscall!(sys_enter_execve, sys_exit_execve, |ctx| handle_execve(&ctx));
trace_syscall!(sys_enter_execveat, sys_exit_execveat, |ctx| handle_execveat(&ctx));

trace_syscall!(sys_enter_chdir, sys_exit_chdir, |ctx| submit_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    EventKind::Chdir,
    line!() as i32
));
trace_syscall!(sys_enter_fchdir, sys_exit_fchdir, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Chdir,
    line!() as i32
));

trace_syscall!(sys_enter_read, sys_exit_read, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(sys_enter_readv, sys_exit_readv, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(sys_enter_pread64, sys_exit_pread64, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(sys_enter_preadv, sys_exit_preadv, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));

trace_syscall!(sys_enter_write, sys_exit_write, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Output,
    line!() as i32
));
trace_syscall!(sys_enter_writev, sys_exit_writev, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Output,
    line!() as i32
));
trace_syscall!(sys_enter_pwrite64, sys_exit_pwrite64, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Output,
    line!() as i32
));
trace_syscall!(sys_enter_pwritev, sys_exit_pwritev, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Output,
    line!() as i32
));

trace_syscall!(sys_enter_newstat, sys_exit_newstat, |ctx| submit_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(sys_enter_statx, sys_exit_statx, |ctx| submit_path_at_event(
    syscall_arg(&ctx, 0) as i32,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::InputAt,
    line!() as i32
));
trace_syscall!(sys_enter_newfstat, sys_exit_newfstat, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(
    sys_enter_newfstatat,
    sys_exit_newfstatat,
    |ctx| submit_path_at_event(
        syscall_arg(&ctx, 0) as i32,
        syscall_arg(&ctx, 1) as *const u8,
        EventKind::InputAt,
        line!() as i32
    )
);

trace_syscall!(sys_enter_access, sys_exit_access, |ctx| {
    let path = syscall_arg(&ctx, 0) as *const u8;
    if !is_self_probe(path) {
        submit_path_event(path, EventKind::Input, line!() as i32);
    }
});
trace_syscall!(sys_enter_readlink, sys_exit_readlink, |ctx| {
    let path = syscall_arg(&ctx, 0) as *const u8;
    if !is_self_probe(path) {
        submit_path_event(path, EventKind::Input, line!() as i32);
    }
});
trace_syscall!(
    sys_enter_readlinkat,
    sys_exit_readlinkat,
    |ctx| submit_path_at_event(
        syscall_arg(&ctx, 0) as i32,
        syscall_arg(&ctx, 1) as *const u8,
        EventKind::InputAt,
        line!() as i32
    )
);

trace_syscall!(sys_enter_mmap, sys_exit_mmap, |ctx| handle_mmap(&ctx));

trace_syscall!(sys_enter_ftruncate, sys_exit_ftruncate, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Output,
    line!() as i32
));
trace_syscall!(sys_enter_fallocate, sys_exit_fallocate, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Output,
    line!() as i32
));

trace_syscall!(sys_enter_getdents, sys_exit_getdents, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(sys_enter_getdents64, sys_exit_getdents64, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));

trace_syscall!(sys_enter_mkdir, sys_exit_mkdir, |ctx| submit_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    EventKind::Output,
    line!() as i32
));
trace_syscall!(sys_enter_mkdirat, sys_exit_mkdirat, |ctx| submit_path_at_event(
    syscall_arg(&ctx, 0) as i32,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::OutputAt,
    line!() as i32
));
trace_syscall!(sys_enter_rmdir, sys_exit_rmdir, |ctx| submit_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    EventKind::Remove,
    line!() as i32
));
trace_syscall!(sys_enter_unlink, sys_exit_unlink, |ctx| submit_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    EventKind::Remove,
    line!() as i32
));
trace_syscall!(sys_enter_unlinkat, sys_exit_unlinkat, |ctx| submit_path_at_event(
    syscall_arg(&ctx, 0) as i32,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::RemoveAt,
    line!() as i32
));

trace_syscall!(sys_enter_rename, sys_exit_rename, |ctx| submit_fat_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::Rename,
    line!() as i32
));
trace_syscall!(sys_enter_renameat, sys_exit_renameat, |ctx| {
    submit_fd2_path2_at_event(
        syscall_arg(&ctx, 0) as i32,
        syscall_arg(&ctx, 2) as i32,
        syscall_arg(&ctx, 1) as *const u8,
        syscall_arg(&ctx, 3) as *const u8,
        EventKind::RenameAt,
        line!() as i32,
    )
});

trace_syscall!(sys_enter_link, sys_exit_link, |ctx| submit_fat_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::Link,
    line!() as i32
));
trace_syscall!(sys_enter_linkat, sys_exit_linkat, |ctx| {
    submit_fd2_path2_at_event(
        syscall_arg(&ctx, 0) as i32,
        syscall_arg(&ctx, 2) as i32,
        syscall_arg(&ctx, 1) as *const u8,
        syscall_arg(&ctx, 3) as *const u8,
        EventKind::LinkAt,
        line!() as i32,
    )
});
trace_syscall!(sys_enter_symlink, sys_exit_symlink, |ctx| submit_fat_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::Link,
    line!() as i32
));
trace_syscall!(sys_enter_symlinkat, sys_exit_symlinkat, |ctx| handle_symlinkat(&ctx));

trace_syscall!(sys_enter_utime, sys_exit_utime, |ctx| submit_path_event(
    syscall_arg(&ctx, 0) as *const u8,
    EventKind::Output,
    line!() as i32
));
trace_syscall!(sys_enter_utimensat, sys_exit_utimensat, |ctx| submit_path_at_event(
    syscall_arg(&ctx, 0) as i32,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::OutputAt,
    line!() as i32
));

trace_syscall!(sys_enter_faccessat, sys_exit_faccessat, |ctx| submit_path_at_event(
    syscall_arg(&ctx, 0) as i32,
    syscall_arg(&ctx, 1) as *const u8,
    EventKind::InputAt,
    line!() as i32
));
trace_syscall!(
    sys_enter_faccessat2,
    sys_exit_faccessat2,
    |ctx| submit_path_at_event(
        syscall_arg(&ctx, 0) as i32,
        syscall_arg(&ctx, 1) as *const u8,
        EventKind::InputAt,
        line!() as i32
    )
);

// The xattr reads take their first argument as an FD here even though
// the plain (non-f) forms pass a path in the kernel ABI; a non-FD
// argument simply fails the file-table walk and traces nothing.
trace_syscall!(sys_enter_fsetxattr, sys_exit_fsetxattr, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Output,
    line!() as i32
));
trace_syscall!(sys_enter_getxattr, sys_exit_getxattr, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(sys_enter_lgetxattr, sys_exit_lgetxattr, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));
trace_syscall!(sys_enter_llistxattr, sys_exit_llistxattr, |ctx| submit_fd_event(
    syscall_arg(&ctx, 0) as i32,
    EventKind::Input,
    line!() as i32
));

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual BSD/GPL\0";
