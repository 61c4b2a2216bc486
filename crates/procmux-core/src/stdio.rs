//! Stdio negotiation: polymorphic caller input resolved once into a closed
//! descriptor vector that downstream code matches exhaustively.

use crate::error::{ProcmuxError, Result};

/// Resolved intent for one of the child's standard I/O slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioDescriptor {
    Ignore,
    Pipe,
    Inherit,
    Fd(i32),
    Ipc,
}

/// A foreign stream-like object offered for a stdio slot. The negotiator can
/// only use it when it exposes an OS file descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignStream {
    pub fd: Option<i32>,
    pub description: String,
}

impl ForeignStream {
    pub fn with_fd(fd: i32, description: impl Into<String>) -> Self {
        Self {
            fd: Some(fd),
            description: description.into(),
        }
    }

    pub fn detached(description: impl Into<String>) -> Self {
        Self {
            fd: None,
            description: description.into(),
        }
    }
}

/// One entry of an explicit stdio vector, before negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Default, derive_more::From)]
pub enum StdioEntry {
    /// Sparse slot left unspecified by the caller.
    #[default]
    Unset,
    Named(String),
    #[from]
    Fd(i32),
    #[from]
    Stream(ForeignStream),
}

impl From<&str> for StdioEntry {
    fn from(name: &str) -> Self {
        StdioEntry::Named(name.to_string())
    }
}

/// Flexible stdio specification accepted from callers: a shorthand applied to
/// all three standard slots, or an explicit (possibly sparse) entry vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioSpec {
    Shorthand(String),
    Entries(Vec<StdioEntry>),
}

impl Default for StdioSpec {
    fn default() -> Self {
        StdioSpec::Shorthand("pipe".to_string())
    }
}

impl StdioSpec {
    pub fn ignore() -> Self {
        StdioSpec::Shorthand("ignore".to_string())
    }

    pub fn pipe() -> Self {
        StdioSpec::Shorthand("pipe".to_string())
    }

    pub fn inherit() -> Self {
        StdioSpec::Shorthand("inherit".to_string())
    }

    pub fn entries<E: Into<StdioEntry>, I: IntoIterator<Item = E>>(iter: I) -> Self {
        StdioSpec::Entries(iter.into_iter().map(Into::into).collect())
    }
}

/// Expand a stdio specification into a descriptor vector of length >= 3.
///
/// Shorthand expands to three identical descriptors. For explicit vectors,
/// slots the caller left unset default to `Pipe` within the first three
/// positions and `Ignore` beyond them, and the vector is padded to length 3
/// with `Pipe`. At most one slot may resolve to `Ipc`.
pub fn negotiate(spec: &StdioSpec) -> Result<Vec<StdioDescriptor>> {
    let resolved = match spec {
        StdioSpec::Shorthand(name) => {
            let descriptor = match name.as_str() {
                "ignore" => StdioDescriptor::Ignore,
                "pipe" => StdioDescriptor::Pipe,
                "inherit" => StdioDescriptor::Inherit,
                other => {
                    return Err(ProcmuxError::validation(format!(
                        "unknown stdio shorthand: {other:?}"
                    )));
                }
            };
            vec![descriptor; 3]
        }
        StdioSpec::Entries(entries) => {
            let mut resolved = Vec::with_capacity(entries.len().max(3));
            for (index, entry) in entries.iter().enumerate() {
                resolved.push(resolve_entry(entry, index)?);
            }
            while resolved.len() < 3 {
                resolved.push(StdioDescriptor::Pipe);
            }
            resolved
        }
    };

    let ipc_slots = resolved
        .iter()
        .filter(|d| matches!(d, StdioDescriptor::Ipc))
        .count();
    if ipc_slots > 1 {
        return Err(ProcmuxError::DuplicateIpc);
    }

    Ok(resolved)
}

/// Index of the slot carrying the IPC channel, if any.
pub fn ipc_slot(descriptors: &[StdioDescriptor]) -> Option<usize> {
    descriptors
        .iter()
        .position(|d| matches!(d, StdioDescriptor::Ipc))
}

fn resolve_entry(entry: &StdioEntry, index: usize) -> Result<StdioDescriptor> {
    match entry {
        StdioEntry::Unset => Ok(if index < 3 {
            StdioDescriptor::Pipe
        } else {
            StdioDescriptor::Ignore
        }),
        StdioEntry::Named(name) => match name.as_str() {
            "ignore" => Ok(StdioDescriptor::Ignore),
            "pipe" => Ok(StdioDescriptor::Pipe),
            // Overlapped I/O is a Windows pipe flavor; everywhere else it is
            // an ordinary pipe.
            "overlapped" => Ok(StdioDescriptor::Pipe),
            "inherit" => Ok(StdioDescriptor::Inherit),
            "ipc" => Ok(StdioDescriptor::Ipc),
            other => Err(ProcmuxError::validation(format!(
                "unknown stdio entry: {other:?}"
            ))),
        },
        StdioEntry::Fd(fd) => {
            if *fd < 0 {
                Err(ProcmuxError::validation(format!(
                    "stdio file descriptor must be non-negative, got {fd}"
                )))
            } else {
                Ok(StdioDescriptor::Fd(*fd))
            }
        }
        StdioEntry::Stream(stream) => stream
            .fd
            .map(StdioDescriptor::Fd)
            .ok_or_else(|| ProcmuxError::UnsupportedStdio(stream.description.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_expands_to_three_slots() {
        assert_eq!(
            negotiate(&StdioSpec::pipe()).unwrap(),
            vec![StdioDescriptor::Pipe; 3]
        );
        assert_eq!(
            negotiate(&StdioSpec::ignore()).unwrap(),
            vec![StdioDescriptor::Ignore; 3]
        );
        assert_eq!(
            negotiate(&StdioSpec::inherit()).unwrap(),
            vec![StdioDescriptor::Inherit; 3]
        );
    }

    #[test]
    fn short_vectors_pad_with_pipe() {
        let spec = StdioSpec::entries(["ignore"]);
        assert_eq!(
            negotiate(&spec).unwrap(),
            vec![
                StdioDescriptor::Ignore,
                StdioDescriptor::Pipe,
                StdioDescriptor::Pipe
            ]
        );

        let spec = StdioSpec::Entries(vec![]);
        assert_eq!(negotiate(&spec).unwrap(), vec![StdioDescriptor::Pipe; 3]);
    }

    #[test]
    fn long_vectors_are_used_verbatim() {
        let spec = StdioSpec::entries(["inherit", "inherit", "inherit", "ignore"]);
        assert_eq!(
            negotiate(&spec).unwrap(),
            vec![
                StdioDescriptor::Inherit,
                StdioDescriptor::Inherit,
                StdioDescriptor::Inherit,
                StdioDescriptor::Ignore
            ]
        );
    }

    #[test]
    fn sparse_slots_default_by_position() {
        let spec = StdioSpec::Entries(vec![
            StdioEntry::Unset,
            StdioEntry::from("inherit"),
            StdioEntry::Unset,
            StdioEntry::Unset,
        ]);
        assert_eq!(
            negotiate(&spec).unwrap(),
            vec![
                StdioDescriptor::Pipe,
                StdioDescriptor::Inherit,
                StdioDescriptor::Pipe,
                StdioDescriptor::Ignore
            ]
        );
    }

    #[test]
    fn duplicate_ipc_is_rejected() {
        let spec = StdioSpec::entries(["ipc", "pipe", "ipc"]);
        assert!(matches!(
            negotiate(&spec),
            Err(ProcmuxError::DuplicateIpc)
        ));
    }

    #[test]
    fn fd_passthrough_and_overlapped() {
        let spec = StdioSpec::Entries(vec![
            StdioEntry::from(4),
            StdioEntry::from("overlapped"),
            StdioEntry::from("pipe"),
        ]);
        assert_eq!(
            negotiate(&spec).unwrap(),
            vec![
                StdioDescriptor::Fd(4),
                StdioDescriptor::Pipe,
                StdioDescriptor::Pipe
            ]
        );

        let spec = StdioSpec::Entries(vec![StdioEntry::from(-1)]);
        assert!(matches!(negotiate(&spec), Err(ProcmuxError::Validation(_))));
    }

    #[test]
    fn foreign_stream_requires_fd() {
        let spec = StdioSpec::Entries(vec![StdioEntry::from(ForeignStream::with_fd(5, "socket"))]);
        assert_eq!(negotiate(&spec).unwrap()[0], StdioDescriptor::Fd(5));

        let spec =
            StdioSpec::Entries(vec![StdioEntry::from(ForeignStream::detached("transform"))]);
        assert!(matches!(
            negotiate(&spec),
            Err(ProcmuxError::UnsupportedStdio(desc)) if desc == "transform"
        ));
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            negotiate(&StdioSpec::Shorthand("tty".into())),
            Err(ProcmuxError::Validation(_))
        ));
        assert!(matches!(
            negotiate(&StdioSpec::entries(["blorp"])),
            Err(ProcmuxError::Validation(_))
        ));
    }

    #[test]
    fn ipc_slot_lookup() {
        let spec = StdioSpec::entries(["pipe", "pipe", "pipe", "ipc"]);
        let resolved = negotiate(&spec).unwrap();
        assert_eq!(ipc_slot(&resolved), Some(3));
        assert_eq!(ipc_slot(&negotiate(&StdioSpec::pipe()).unwrap()), None);
    }
}
