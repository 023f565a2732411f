//! Error taxonomy surfaced to 9P clients.
//!
//! Every handler failure becomes an `Rerror` whose `ename` is the `Display`
//! text of one of these variants, so the wording here is part of the wire
//! contract.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum VufsError {
    /// The type byte named no T-message this server dispatches.
    BadFcallType,
    /// Negotiated msize below the protocol minimum.
    MsizeOutOfRange,
    /// A T-message arrived before a successful Tversion.
    VersionNotNegotiated,
    /// The request was queued when a new Tversion reset the session.
    SessionReset,
    /// The server is shutting down.
    Stopped,
    /// Attach or walk tried to bind a fid that already exists.
    FidInUse,
    /// No such fid on this connection.
    FidNotFound,
    /// The operation needs a directory and the fid isn't one.
    NotADirectory(String),
    /// The operation is illegal on a directory.
    IsADirectory(String),
    /// A sibling with that name already exists.
    AlreadyExists,
    /// `.`, `..`, or an empty create/rename name.
    InvalidName(String),
    /// Walk or open on a fid that is already open.
    AlreadyOpen,
    /// More than MAXWELEM names in one walk.
    TooManyNames,
    /// A walked name does not exist.
    NotFound(String),
    /// Attach with an aname other than "/".
    AttachNotRoot,
    /// Tauth, or Tattach with a real afid.
    AuthNotSupported,
    /// The acting uid lacks the needed mode bits.
    PermissionDenied,
    /// Reading a fid that was not opened for reading.
    NotOpenForRead,
    /// Writing a fid that was not opened for writing.
    NotOpenForWrite,
    /// Directory read at an offset that is not an entry boundary.
    BadDirOffset,
    /// Directory create with an open mode other than OREAD.
    DirCreateMode,
    /// Wstat tried to change the file owner.
    OwnerChange,
    /// Wstat tried to change the last-modifier.
    MuidChange,
    /// Wstat tried to flip the directory bit.
    DirBitChange,
    /// Wstat tried to set the length of a directory.
    DirLength,
    /// A backing-store operation failed; the path is the 9P-visible one.
    Backing {
        path: String,
        err: io::Error,
        /// Cleanup after a failed create also failed.
        left_on_disk: bool,
    },
}

impl fmt::Display for VufsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VufsError::BadFcallType => write!(f, "bad fcall type"),
            VufsError::MsizeOutOfRange => write!(f, "msize out of range"),
            VufsError::VersionNotNegotiated => write!(f, "version not negotiated"),
            VufsError::SessionReset => {
                write!(f, "new session started, dropping this request")
            }
            VufsError::Stopped => write!(f, "file system stopped"),
            VufsError::FidInUse => write!(f, "fid already in use on this connection"),
            VufsError::FidNotFound => write!(f, "fid not found"),
            VufsError::NotADirectory(name) => write!(f, "{} is not a directory", name),
            VufsError::IsADirectory(name) => write!(f, "{} is a directory", name),
            VufsError::AlreadyExists => write!(f, "already exists"),
            VufsError::InvalidName(name) => write!(f, "{} invalid name", name),
            VufsError::AlreadyOpen => write!(f, "already open"),
            VufsError::TooManyNames => write!(f, "too many elements in walk"),
            VufsError::NotFound(name) => write!(f, "'{}' not found", name),
            VufsError::AttachNotRoot => write!(f, "can only attach to root directory"),
            VufsError::AuthNotSupported => write!(f, "authentication not supported"),
            VufsError::PermissionDenied => write!(f, "permission denied"),
            VufsError::NotOpenForRead => write!(f, "file not open for reading"),
            VufsError::NotOpenForWrite => write!(f, "file not open for writing"),
            VufsError::BadDirOffset => write!(f, "bad offset in directory read"),
            VufsError::DirCreateMode => {
                write!(f, "can only create a directory in read mode")
            }
            VufsError::OwnerChange => write!(f, "cannot change owner"),
            VufsError::MuidChange => write!(f, "cannot change muid"),
            VufsError::DirBitChange => write!(f, "cannot change directory bit"),
            VufsError::DirLength => write!(f, "cannot change length of directory"),
            VufsError::Backing { path, err, left_on_disk } => {
                write!(f, "{}: {}", path, err)?;
                if *left_on_disk {
                    write!(f, " (and file was left on disk)")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for VufsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VufsError::Backing { err, .. } => Some(err),
            _ => None,
        }
    }
}

impl VufsError {
    /// Wrap a host I/O failure with the 9P-visible path it happened on.
    pub fn backing(path: impl Into<String>, err: io::Error) -> VufsError {
        VufsError::Backing { path: path.into(), err, left_on_disk: false }
    }
}

pub type Result<T> = std::result::Result<T, VufsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enames_match_wire_contract() {
        assert_eq!(VufsError::FidInUse.to_string(), "fid already in use on this connection");
        assert_eq!(VufsError::AttachNotRoot.to_string(), "can only attach to root directory");
        assert_eq!(
            VufsError::SessionReset.to_string(),
            "new session started, dropping this request"
        );
        assert_eq!(VufsError::Stopped.to_string(), "file system stopped");
        assert_eq!(VufsError::InvalidName("..".into()).to_string(), ".. invalid name");
        assert_eq!(VufsError::NotADirectory("f".into()).to_string(), "f is not a directory");
    }

    #[test]
    fn backing_error_reports_cleanup_failure() {
        let err = VufsError::Backing {
            path: "/tmp/x".into(),
            err: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
            left_on_disk: true,
        };
        let text = err.to_string();
        assert!(text.starts_with("/tmp/x: "));
        assert!(text.ends_with(" (and file was left on disk)"));
    }
}
