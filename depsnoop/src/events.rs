//! Decoding of committed event frames.
//!
//! Frames arrive from the ring buffer as raw bytes in one of the
//! three wire classes; the class is derived from the header's kind.
//! Decoded events are serialized as JSON lines for downstream build
//! audits.

use depsnoop_common::{
    Event, EventClass, EventHeader, EventKind, Fat2Event, FatEvent, PathTuple, PATH_COMPONENT_LEN,
};
use memchr::memchr;
use serde::Serialize;
use std::mem;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("frame of {0} bytes is too short for an event header")]
    Truncated(usize),
    #[error("frame is not 8-byte aligned")]
    Misaligned,
    #[error("unknown event kind {0}")]
    UnknownKind(i32),
    #[error("{kind:?} frame is {len} bytes, expected {expected}")]
    WrongLength {
        kind: EventKind,
        len: usize,
        expected: usize,
    },
}

/// One decoded event.
///
/// `paths` is positional per the event class: one entry for small
/// events, `[first, second]` for fat events, `[base1, base2, rel1,
/// rel2]` for fat2 events. Entries whose tuple was empty on the wire
/// (FIFO accesses, `Exit`, `Clone`) decode to the empty string.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    #[serde(serialize_with = "serialize_kind")]
    pub kind: EventKind,
    pub pid: i32,
    pub uid: u64,
    pub source_line: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<i32>,
    pub paths: Vec<String>,
}

pub fn kind_name(kind: EventKind) -> &'static str {
    use EventKind::*;
    match kind {
        Exec => "exec",
        Exit => "exit",
        Input => "input",
        Output => "output",
        Remove => "remove",
        Rename => "rename",
        Chdir => "chdir",
        Clone => "clone",
        InputAt => "inputAt",
        OutputAt => "outputAt",
        Link => "link",
        Symlink => "symlink",
        RemoveAt => "removeAt",
        LinkAt => "linkAt",
        RenameAt => "renameAt",
        SymlinkAt => "symlinkAt",
        ExecAt => "execAt",
    }
}

fn serialize_kind<S: serde::Serializer>(kind: &EventKind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind_name(*kind))
}

/// Decode one ring-buffer frame.
pub fn parse_event(frame: &[u8]) -> Result<TraceEvent, DecodeError> {
    if frame.len() < mem::size_of::<EventHeader>() {
        return Err(DecodeError::Truncated(frame.len()));
    }
    if frame.as_ptr() as usize % mem::align_of::<EventHeader>() != 0 {
        return Err(DecodeError::Misaligned);
    }

    let header = unsafe { &*(frame.as_ptr() as *const EventHeader) };
    let kind = EventKind::from_raw(header.kind).ok_or(DecodeError::UnknownKind(header.kind))?;
    let class = kind.class();
    if frame.len() != class.frame_len() {
        return Err(DecodeError::WrongLength {
            kind,
            len: frame.len(),
            expected: class.frame_len(),
        });
    }

    let (payload, paths) = match class {
        EventClass::Small => {
            let event = unsafe { &*(frame.as_ptr() as *const Event) };
            (Some(event.payload), vec![decode_path_tuple(&event.path)])
        }
        EventClass::Fat => {
            let event = unsafe { &*(frame.as_ptr() as *const FatEvent) };
            (
                Some(event.payload),
                event.paths.iter().map(decode_path_tuple).collect(),
            )
        }
        EventClass::Fat2 => {
            let event = unsafe { &*(frame.as_ptr() as *const Fat2Event) };
            (None, event.paths.iter().map(decode_path_tuple).collect())
        }
    };

    Ok(TraceEvent {
        kind,
        pid: header.pid,
        uid: header.uid,
        source_line: header.source_line,
        payload,
        paths,
    })
}

/// Rebuild a path string from one tuple.
///
/// A single occupied row is a verbatim userspace string. Multiple
/// rows are a directory-entry chain, leaf first; reversing the rows
/// and joining with `/` yields the path. The kernel names the
/// filesystem root `/`, which folds into the leading separator; a
/// chain that overflowed the row cap never reached the root and reads
/// back as the relative tail of the deepest components.
pub fn decode_path_tuple(path: &PathTuple) -> String {
    let mut components: Vec<String> = Vec::new();
    for row in path.iter() {
        let len = memchr(0, row).unwrap_or(PATH_COMPONENT_LEN);
        if len == 0 {
            break;
        }
        components.push(String::from_utf8_lossy(&row[..len]).into_owned());
    }

    match components.len() {
        0 => String::new(),
        1 => components.pop().unwrap_or_default(),
        _ => {
            components.reverse();
            if components[0] == "/" {
                format!("/{}", components[1..].join("/"))
            } else {
                components.join("/")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depsnoop_common::PATH_DEPTH;

    fn empty_tuple() -> PathTuple {
        [[0u8; PATH_COMPONENT_LEN]; PATH_DEPTH]
    }

    /// Tuple holding one userspace string in row 0, as the kernel's
    /// string encoder leaves it.
    fn tuple_from_str(path: &str) -> PathTuple {
        let mut tuple = empty_tuple();
        let bytes = path.as_bytes();
        let len = bytes.len().min(PATH_COMPONENT_LEN - 1);
        tuple[0][..len].copy_from_slice(&bytes[..len]);
        tuple
    }

    /// Tuple holding a dentry chain, leaf first.
    fn tuple_from_chain(components: &[&str]) -> PathTuple {
        let mut tuple = empty_tuple();
        for (row, component) in components.iter().enumerate() {
            let bytes = component.as_bytes();
            let len = bytes.len().min(PATH_COMPONENT_LEN - 1);
            tuple[row][..len].copy_from_slice(&bytes[..len]);
        }
        tuple
    }

    fn as_bytes<T>(event: &T) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(event as *const T as *const u8, mem::size_of::<T>())
        }
    }

    fn header(kind: EventKind, pid: i32, uid: u64) -> EventHeader {
        EventHeader {
            kind: kind as i32,
            pid,
            uid,
            source_line: 42,
        }
    }

    #[test]
    fn exec_event_round_trips() {
        let event = Event {
            header: header(EventKind::Exec, 1000, 0),
            payload: 999,
            path: tuple_from_str("/bin/ls"),
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        assert_eq!(decoded.kind, EventKind::Exec);
        assert_eq!(decoded.pid, 1000);
        assert_eq!(decoded.uid, 0);
        assert_eq!(decoded.payload, Some(999));
        assert_eq!(decoded.paths, vec!["/bin/ls".to_string()]);
    }

    #[test]
    fn dentry_chain_reads_back_root_down() {
        let event = Event {
            header: header(EventKind::Input, 1000, 3),
            payload: 0,
            path: tuple_from_chain(&["passwd", "etc", "/"]),
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        assert_eq!(decoded.paths, vec!["/etc/passwd".to_string()]);
    }

    #[test]
    fn chain_without_root_is_a_relative_tail() {
        // A directory deeper than the row cap keeps only the deepest
        // components and never reaches the root entry.
        let components: Vec<String> = (0..PATH_DEPTH).map(|i| format!("d{i}")).collect();
        let refs: Vec<&str> = components.iter().map(String::as_str).collect();
        let event = Event {
            header: header(EventKind::Input, 1, 0),
            payload: 0,
            path: tuple_from_chain(&refs),
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        let expected: Vec<String> = components.iter().rev().cloned().collect();
        assert_eq!(decoded.paths, vec![expected.join("/")]);
    }

    #[test]
    fn overlong_component_is_truncated_with_terminator() {
        let long = "a".repeat(PATH_COMPONENT_LEN + 50);
        let event = Event {
            header: header(EventKind::Input, 1, 0),
            payload: 0,
            path: tuple_from_str(&long),
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        assert_eq!(decoded.paths[0].len(), PATH_COMPONENT_LEN - 1);
    }

    #[test]
    fn rename_carries_both_paths() {
        let event = FatEvent {
            header: header(EventKind::Rename, 1000, 1),
            payload: 0,
            paths: [tuple_from_str("a"), tuple_from_str("b")],
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        assert_eq!(decoded.kind, EventKind::Rename);
        assert_eq!(decoded.paths, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn linkat_carries_two_bases_and_two_paths() {
        let event = Fat2Event {
            header: header(EventKind::LinkAt, 1000, 1),
            paths: [
                tuple_from_chain(&["work", "home", "/"]),
                tuple_from_chain(&["tmp", "/"]),
                tuple_from_str("src"),
                tuple_from_str("dst"),
            ],
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        assert_eq!(decoded.payload, None);
        assert_eq!(
            decoded.paths,
            vec![
                "/home/work".to_string(),
                "/tmp".to_string(),
                "src".to_string(),
                "dst".to_string()
            ]
        );
    }

    #[test]
    fn exit_event_has_status_and_no_path() {
        let event = Event {
            header: header(EventKind::Exit, 1000, 0),
            payload: 2,
            path: empty_tuple(),
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        assert_eq!(decoded.kind, EventKind::Exit);
        assert_eq!(decoded.payload, Some(2));
        assert_eq!(decoded.paths, vec![String::new()]);
    }

    #[test]
    fn fifo_access_keeps_inode_payload() {
        let event = Event {
            header: header(EventKind::Input, 1000, 0),
            payload: 4242,
            path: empty_tuple(),
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        assert_eq!(decoded.payload, Some(4242));
        assert_eq!(decoded.paths, vec![String::new()]);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut event = Event {
            header: header(EventKind::Input, 1, 0),
            payload: 0,
            path: empty_tuple(),
        };
        event.header.kind = 3; // reserved kind value
        assert_eq!(
            parse_event(as_bytes(&event)),
            Err(DecodeError::UnknownKind(3))
        );
    }

    #[test]
    fn class_length_mismatch_is_rejected() {
        let event = Event {
            header: header(EventKind::Rename, 1, 0), // fat kind in a small frame
            payload: 0,
            path: empty_tuple(),
        };
        let got = parse_event(as_bytes(&event));
        assert!(matches!(got, Err(DecodeError::WrongLength { .. })));
    }

    #[test]
    fn short_frame_is_rejected() {
        assert_eq!(parse_event(&[0u8; 8]), Err(DecodeError::Truncated(8)));
    }

    #[test]
    fn events_serialize_as_json_lines() {
        let event = Event {
            header: header(EventKind::Exec, 1000, 0),
            payload: 999,
            path: tuple_from_str("/bin/ls"),
        };
        let decoded = parse_event(as_bytes(&event)).unwrap();
        let json = serde_json::to_string(&decoded).unwrap();
        assert!(json.contains("\"kind\":\"exec\""));
        assert!(json.contains("\"pid\":1000"));
        assert!(json.contains("\"payload\":999"));
        assert!(json.contains("/bin/ls"));
    }
}
