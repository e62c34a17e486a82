//! Types shared between the depsnoop userspace loader and the kernel
//! program.
//!
//! Everything here crosses the kernel/userspace boundary verbatim, so
//! all records are `#[repr(C)]`, fixed-size and `Copy`, and the crate
//! is `no_std` unless the `user` feature is enabled.

#![cfg_attr(not(feature = "user"), no_std)]

pub mod event;
pub mod offsets;
pub mod process;

pub use event::{
    Event, EventClass, EventHeader, EventKind, Fat2Event, FatEvent, FatalError, FatalErrorKind,
    PathTuple, PATH_COMPONENT_LEN, PATH_DEPTH,
};
pub use offsets::KernelOffsets;
pub use process::{Fingerprint, ProcessInfo, FINGERPRINT_WINDOW};

/// Sentinel directory FD meaning "relative to the current working
/// directory" in the *at syscall family.
pub const AT_FDCWD: i32 = -100;

/// FIFO bit of `inode.i_mode`.
pub const S_IFIFO: u16 = 0o010000;

/// `mmap` flag: updates to the mapping are carried through to the file.
pub const MAP_SHARED: u64 = 0x01;

/// `mmap` protection bit: pages may be written.
pub const PROT_WRITE: u64 = 0x02;

#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for FatalError {}
    unsafe impl aya::Pod for KernelOffsets {}
    unsafe impl aya::Pod for ProcessInfo {}
}
