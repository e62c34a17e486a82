//! The event wire format.
//!
//! Every committed event starts with a fixed 24-byte [`EventHeader`]
//! and continues with one of three size classes:
//!
//! - [`Event`]: header + payload + one path tuple
//! - [`FatEvent`]: header + payload + two path tuples
//! - [`Fat2Event`]: header + four path tuples, no payload
//!
//! The class is not tagged on the wire; consumers derive it from the
//! header's event kind via [`EventKind::class`].

use static_assertions::const_assert_eq;

/// Maximum number of path components one tuple can hold. A deeper
/// directory chain keeps the deepest components and drops the rest.
pub const PATH_DEPTH: usize = 16;

/// Capacity of one path component, including the terminating NUL.
/// Matches the kernel's per-filename limit.
pub const PATH_COMPONENT_LEN: usize = 256;

/// One encoded path: `PATH_DEPTH` rows of NUL-terminated bytes.
///
/// Row 0 holds the leaf; row i+1 holds the parent of row i, up to the
/// filesystem root or the row cap. Unused rows are all-NUL. When a
/// path was captured from a userspace string rather than a directory
/// entry chain, the whole string lives in row 0.
pub type PathTuple = [[u8; PATH_COMPONENT_LEN]; PATH_DEPTH];

/// What a traced task did to a file-system object.
///
/// The numbering is part of the wire format and closed; 3 is unused.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Exec = 1,
    Exit = 2,
    Input = 4,
    Output = 5,
    Remove = 6,
    Rename = 7,
    Chdir = 8,
    Clone = 9,
    InputAt = 10,
    OutputAt = 11,
    Link = 12,
    Symlink = 13,
    RemoveAt = 14,
    LinkAt = 15,
    RenameAt = 16,
    SymlinkAt = 17,
    ExecAt = 18,
}

impl EventKind {
    pub fn from_raw(raw: i32) -> Option<EventKind> {
        use EventKind::*;
        Some(match raw {
            1 => Exec,
            2 => Exit,
            4 => Input,
            5 => Output,
            6 => Remove,
            7 => Rename,
            8 => Chdir,
            9 => Clone,
            10 => InputAt,
            11 => OutputAt,
            12 => Link,
            13 => Symlink,
            14 => RemoveAt,
            15 => LinkAt,
            16 => RenameAt,
            17 => SymlinkAt,
            18 => ExecAt,
            _ => return None,
        })
    }

    /// The size class this kind is transported in.
    pub fn class(self) -> EventClass {
        use EventKind::*;
        match self {
            Exec | Exit | Input | Output | Remove | Chdir | Clone => EventClass::Small,
            Rename | InputAt | OutputAt | Link | Symlink | RemoveAt | ExecAt => EventClass::Fat,
            LinkAt | RenameAt | SymlinkAt => EventClass::Fat2,
        }
    }

    /// The plain form of an at-form kind.
    ///
    /// When an at-form syscall takes a fast path (base directory is
    /// the CWD, or the relative path is empty) the event shrinks by
    /// one size class and its kind collapses with it. Non-at kinds
    /// collapse to themselves.
    pub fn collapsed(self) -> EventKind {
        use EventKind::*;
        match self {
            InputAt => Input,
            OutputAt => Output,
            RemoveAt => Remove,
            LinkAt => Link,
            RenameAt => Rename,
            SymlinkAt => Symlink,
            ExecAt => Exec,
            other => other,
        }
    }
}

/// Transport size class of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventClass {
    Small,
    Fat,
    Fat2,
}

impl EventClass {
    /// Exact byte length of a committed frame of this class.
    pub const fn frame_len(self) -> usize {
        match self {
            EventClass::Small => core::mem::size_of::<Event>(),
            EventClass::Fat => core::mem::size_of::<FatEvent>(),
            EventClass::Fat2 => core::mem::size_of::<Fat2Event>(),
        }
    }
}

/// Fixed prefix of every committed event.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EventHeader {
    /// Raw [`EventKind`] value.
    pub kind: i32,
    /// Thread-group id of the task that caused the event.
    pub pid: i32,
    /// Unique id of this process incarnation; survives pid reuse.
    pub uid: u64,
    /// Line in the kernel program that emitted the event.
    pub source_line: i32,
}

/// Small event: every single-path operation, plus `Exec`, `Clone` and
/// `Exit`.
///
/// The payload is kind-dependent: the parent pid for `Exec`/`Clone`,
/// the exit status for `Exit`, the inode number for accesses to
/// FIFOs (whose path tuple stays empty), zero otherwise.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Event {
    pub header: EventHeader,
    pub payload: i32,
    pub path: PathTuple,
}

/// Two-path event: rename/link pairs and at-form operations carrying
/// a base directory tuple plus a relative path.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FatEvent {
    pub header: EventHeader,
    pub payload: i32,
    pub paths: [PathTuple; 2],
}

/// Four-path event: the two-FD at-forms (`linkat`, `renameat`,
/// `symlinkat` with a real base FD). Two base tuples followed by two
/// userspace strings; no payload.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Fat2Event {
    pub header: EventHeader,
    pub paths: [PathTuple; 4],
}

// The header is padded to 24 bytes by the u64 uid; the tuples are
// plain byte arrays, so the three classes have fixed, known sizes.
const_assert_eq!(core::mem::size_of::<EventHeader>(), 24);
const_assert_eq!(core::mem::size_of::<Event>(), 4128);
const_assert_eq!(core::mem::size_of::<FatEvent>(), 8224);
const_assert_eq!(core::mem::size_of::<Fat2Event>(), 16408);

/// First fatal error observed by the kernel program, if any.
///
/// A one-slot map holds the latest of these; the tracing programs
/// never fail a syscall over an internal error, they record it here
/// and keep going. Userspace polls the slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FatalError {
    /// Raw [`FatalErrorKind`] value.
    pub kind: i32,
    /// Line in the kernel program that reported the error.
    pub line: i32,
}

/// Internal failure classes of the kernel program.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalErrorKind {
    /// Ring buffer reservation failed; the event was dropped.
    RingBufferFull = 1,
    /// The staging map is at capacity.
    StagingEventFull = 2,
    /// A staging slot vanished right after insertion.
    StagingEventNotAllocated = 3,
    /// A userspace string could not be read.
    ReadUserStr = 4,
    /// A directory-entry chain could not be read.
    ReadDentryStr = 5,
    /// A staging slot for this task already existed at syscall entry.
    StagingConflict = 6,
}

impl FatalErrorKind {
    pub fn from_raw(raw: i32) -> Option<FatalErrorKind> {
        use FatalErrorKind::*;
        Some(match raw {
            1 => RingBufferFull,
            2 => StagingEventFull,
            3 => StagingEventNotAllocated,
            4 => ReadUserStr,
            5 => ReadDentryStr,
            6 => StagingConflict,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn header_layout_is_stable() {
        assert_eq!(offset_of!(EventHeader, kind), 0);
        assert_eq!(offset_of!(EventHeader, pid), 4);
        assert_eq!(offset_of!(EventHeader, uid), 8);
        assert_eq!(offset_of!(EventHeader, source_line), 16);
    }

    #[test]
    fn payload_and_paths_follow_the_header() {
        assert_eq!(offset_of!(Event, payload), 24);
        assert_eq!(offset_of!(Event, path), 28);
        assert_eq!(offset_of!(FatEvent, payload), 24);
        assert_eq!(offset_of!(FatEvent, paths), 28);
        assert_eq!(offset_of!(Fat2Event, paths), 24);
    }

    #[test]
    fn kind_numbering_round_trips() {
        for raw in -2..32 {
            match EventKind::from_raw(raw) {
                Some(kind) => assert_eq!(kind as i32, raw),
                None => assert!(raw <= 0 || raw == 3 || raw > 18),
            }
        }
    }

    #[test]
    fn kind_three_is_reserved() {
        assert_eq!(EventKind::from_raw(3), None);
    }

    #[test]
    fn class_sizes_match_struct_sizes() {
        assert_eq!(EventClass::Small.frame_len(), 4128);
        assert_eq!(EventClass::Fat.frame_len(), 8224);
        assert_eq!(EventClass::Fat2.frame_len(), 16408);
    }

    #[test]
    fn at_kinds_collapse_to_their_plain_forms() {
        use EventKind::*;
        assert_eq!(InputAt.collapsed(), Input);
        assert_eq!(OutputAt.collapsed(), Output);
        assert_eq!(RemoveAt.collapsed(), Remove);
        assert_eq!(LinkAt.collapsed(), Link);
        assert_eq!(RenameAt.collapsed(), Rename);
        assert_eq!(SymlinkAt.collapsed(), Symlink);
        assert_eq!(ExecAt.collapsed(), Exec);
        // Plain kinds are already collapsed.
        assert_eq!(Input.collapsed(), Input);
        assert_eq!(Exit.collapsed(), Exit);
    }

    #[test]
    fn collapsing_drops_exactly_one_size_class() {
        use EventKind::*;
        for kind in [InputAt, OutputAt, RemoveAt, ExecAt] {
            assert_eq!(kind.class(), EventClass::Fat);
            assert_eq!(kind.collapsed().class(), EventClass::Small);
        }
        for kind in [LinkAt, RenameAt, SymlinkAt] {
            assert_eq!(kind.class(), EventClass::Fat2);
            assert_eq!(kind.collapsed().class(), EventClass::Fat);
        }
    }

    #[test]
    fn error_numbering_round_trips() {
        for raw in 1..=6 {
            assert_eq!(FatalErrorKind::from_raw(raw).unwrap() as i32, raw);
        }
        assert_eq!(FatalErrorKind::from_raw(0), None);
        assert_eq!(FatalErrorKind::from_raw(7), None);
    }
}
