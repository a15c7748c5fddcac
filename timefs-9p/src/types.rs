// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define 9P2000 wire types and constants shared by the server and client.
// Author: Lukas Bower

//! 9P2000 data model definitions.

use std::fmt;

/// Largest message size the server will negotiate.
pub const MAX_MSIZE: u32 = 8192;

/// Protocol version string; the Unix extensions are not spoken.
pub const VERSION: &str = "9P2000";

/// Tag used by `Tversion`, which precedes tag allocation.
pub const NOTAG: u16 = u16::MAX;

/// Fid value meaning "no fid" (the `afid` of an unauthenticated attach).
pub const NOFID: u32 = u32::MAX;

/// Maximum number of path elements in a single `Twalk`.
pub const MAX_WELEM: usize = 16;

/// Header bytes preceding `Rread`/`Twrite` payloads.
pub const IOHDRSZ: u32 = 24;

/// Directory bit in a file mode.
pub const DMDIR: u32 = 0x8000_0000;
/// Append-only bit in a file mode.
pub const DMAPPEND: u32 = 0x4000_0000;
/// Exclusive-use bit in a file mode.
pub const DMEXCL: u32 = 0x2000_0000;

/// Possible errors produced while encoding or decoding 9P messages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input buffer was shorter than the declared frame length.
    #[error("truncated frame")]
    Truncated,
    /// Encountered an unknown message type.
    #[error("unsupported message type {0}")]
    Unsupported(u8),
    /// Encountered malformed UTF-8 data.
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
    /// Declared message size does not match the actual payload length.
    #[error("length mismatch: declared {declared} actual {actual}")]
    LengthMismatch {
        /// Message length declared in the frame header.
        declared: u32,
        /// Actual byte length observed in the payload.
        actual: usize,
    },
    /// A walk carried more than [`MAX_WELEM`] names or an invalid name.
    #[error("invalid path component")]
    InvalidPath,
    /// A string field exceeded the 16-bit length prefix.
    #[error("string field too long ({0} bytes)")]
    StringTooLong(usize),
    /// Frame exceeded the negotiated message size.
    #[error("frame of {size} bytes exceeds msize {msize}")]
    TooBig {
        /// Declared frame size.
        size: u32,
        /// Negotiated limit.
        msize: u32,
    },
}

/// Qid type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QidType(u8);

impl QidType {
    /// Directory bit.
    pub const DIRECTORY: Self = Self(0x80);
    /// Append-only bit.
    pub const APPEND_ONLY: Self = Self(0x40);
    /// Regular file.
    pub const FILE: Self = Self(0x00);

    /// Derive the qid type from a file mode.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        Self(((mode >> 24) & 0xff) as u8)
    }

    pub(crate) fn from_raw(value: u8) -> Self {
        Self(value)
    }

    /// Check whether the Qid represents a directory.
    #[must_use]
    pub fn is_directory(self) -> bool {
        self.0 & Self::DIRECTORY.0 != 0
    }
}

impl From<QidType> for u8 {
    fn from(value: QidType) -> Self {
        value.0
    }
}

/// 9P Qid: the server's unique identity for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qid {
    ty: QidType,
    version: u32,
    path: u64,
}

impl Qid {
    /// Construct a new Qid.
    #[must_use]
    pub fn new(ty: QidType, version: u32, path: u64) -> Self {
        Self { ty, version, path }
    }

    /// Return the Qid type flags.
    #[must_use]
    pub fn ty(&self) -> QidType {
        self.ty
    }

    /// Return the Qid version field.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Return the Qid path field.
    #[must_use]
    pub fn path(&self) -> u64 {
        self.path
    }
}

/// Open mode as carried by `Topen` and `Tcreate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(u8);

impl OpenMode {
    /// Open for reading.
    pub const READ: Self = Self(0);
    /// Open for writing.
    pub const WRITE: Self = Self(1);
    /// Open for reading and writing.
    pub const RDWR: Self = Self(2);
    /// Open for execution.
    pub const EXEC: Self = Self(3);
    const TRUNC: u8 = 0x10;
    const RCLOSE: u8 = 0x40;

    /// Wrap raw mode bits.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw mode bits as sent on the wire.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Determine if the mode permits reading.
    #[must_use]
    pub fn allows_read(self) -> bool {
        matches!(self.0 & 0x03, 0 | 2)
    }

    /// Determine if the mode permits writing (truncation implies writing).
    #[must_use]
    pub fn allows_write(self) -> bool {
        matches!(self.0 & 0x03, 1 | 2) || self.0 & Self::TRUNC != 0
    }

    /// Determine if the mode requests execute access.
    #[must_use]
    pub fn allows_exec(self) -> bool {
        self.0 & 0x03 == 3
    }

    /// Check whether remove-on-close was requested.
    #[must_use]
    pub fn remove_on_close(self) -> bool {
        self.0 & Self::RCLOSE != 0
    }
}

/// Directory entry as exchanged by `Rstat`, `Twstat` and directory reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Server type (kernel use).
    pub ty: u16,
    /// Server subtype (kernel use).
    pub dev: u32,
    /// Unique identity of the file.
    pub qid: Qid,
    /// Permission bits plus `DM*` flags.
    pub mode: u32,
    /// Last access time, seconds since the epoch.
    pub atime: u32,
    /// Last modification time, seconds since the epoch.
    pub mtime: u32,
    /// Length in bytes; zero for synthetic files.
    pub length: u64,
    /// Final path element.
    pub name: String,
    /// Owner name.
    pub uid: String,
    /// Group name.
    pub gid: String,
    /// Name of the last user to modify the file.
    pub muid: String,
}

/// Request envelope containing a tag and message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request identifier, echoed back by responses.
    pub tag: u16,
    /// The concrete request payload.
    pub body: RequestBody,
}

/// Response envelope containing a tag and message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response identifier (mirrors the request tag).
    pub tag: u16,
    /// The concrete response payload.
    pub body: ResponseBody,
}

/// 9P2000 T-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// `Tversion` negotiates the message size and version string.
    Version {
        /// Requested maximum message size.
        msize: u32,
        /// Protocol version string supplied by the client.
        version: String,
    },
    /// `Tauth` requests an authentication fid.
    Auth {
        /// Proposed authentication fid.
        afid: u32,
        /// User name.
        uname: String,
        /// Tree name.
        aname: String,
    },
    /// `Tflush` aborts an outstanding request.
    Flush {
        /// Tag of the request being flushed.
        oldtag: u16,
    },
    /// `Tattach` binds a fid to the root of a tree.
    Attach {
        /// Fid identifier associated with the root.
        fid: u32,
        /// Authentication fid, [`NOFID`] when unauthenticated.
        afid: u32,
        /// User name string provided by the client.
        uname: String,
        /// Tree selector supplied by the client.
        aname: String,
    },
    /// `Twalk` traverses the tree to produce a new fid.
    Walk {
        /// Source fid for the walk operation.
        fid: u32,
        /// Destination fid receiving the walk result.
        newfid: u32,
        /// Path components supplied by the client.
        wnames: Vec<String>,
    },
    /// `Topen` prepares a fid for I/O.
    Open {
        /// Fid to open.
        fid: u32,
        /// Requested open mode.
        mode: OpenMode,
    },
    /// `Tcreate` creates a file in the directory bound to `fid`.
    Create {
        /// Directory fid.
        fid: u32,
        /// Name of the new file.
        name: String,
        /// Permission bits of the new file.
        perm: u32,
        /// Mode to open the new file with.
        mode: OpenMode,
    },
    /// `Tread` reads a range of bytes from a fid.
    Read {
        /// Fid to read from.
        fid: u32,
        /// Offset into the file.
        offset: u64,
        /// Number of bytes requested.
        count: u32,
    },
    /// `Twrite` writes bytes to a fid.
    Write {
        /// Fid to write to.
        fid: u32,
        /// Offset within the file.
        offset: u64,
        /// Payload bytes supplied by the client.
        data: Vec<u8>,
    },
    /// `Tclunk` releases a fid.
    Clunk {
        /// Fid identifier to close.
        fid: u32,
    },
    /// `Tremove` removes the file and releases the fid.
    Remove {
        /// Fid of the file to remove.
        fid: u32,
    },
    /// `Tstat` inquires about a file.
    Stat {
        /// Fid to describe.
        fid: u32,
    },
    /// `Twstat` changes file attributes.
    Wstat {
        /// Fid to modify.
        fid: u32,
        /// Requested attributes.
        stat: Stat,
    },
}

/// 9P2000 R-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Response to `Tversion` carrying the negotiated size and version.
    Version {
        /// Negotiated maximum message size.
        msize: u32,
        /// Protocol version string.
        version: String,
    },
    /// Response to `Tauth`.
    Auth {
        /// Qid of the authentication file.
        aqid: Qid,
    },
    /// Error response carrying a human readable message.
    Error {
        /// Error string propagated to the client.
        ename: String,
    },
    /// Response to `Tflush`.
    Flush,
    /// Response to `Tattach` containing the root Qid.
    Attach {
        /// Qid associated with the tree root.
        qid: Qid,
    },
    /// Response to `Twalk` containing the traversed Qids.
    Walk {
        /// Qids encountered during the walk.
        qids: Vec<Qid>,
    },
    /// Response to `Topen` containing the opened Qid and I/O unit size.
    Open {
        /// Qid associated with the opened fid.
        qid: Qid,
        /// Maximum I/O payload size, zero for "msize minus header".
        iounit: u32,
    },
    /// Response to `Tcreate`.
    Create {
        /// Qid of the new file.
        qid: Qid,
        /// Maximum I/O payload size.
        iounit: u32,
    },
    /// Response to `Tread` containing the payload bytes.
    Read {
        /// Data payload read from the fid.
        data: Vec<u8>,
    },
    /// Response to `Twrite` containing the write count.
    Write {
        /// Number of bytes written.
        count: u32,
    },
    /// Response to `Tclunk`.
    Clunk,
    /// Response to `Tremove`.
    Remove,
    /// Response to `Tstat`.
    Stat {
        /// Description of the file.
        stat: Stat,
    },
    /// Response to `Twstat`.
    Wstat,
}

impl fmt::Display for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version { msize, version } => {
                write!(f, "Tversion msize {msize} version {version}")
            }
            Self::Auth { afid, uname, aname } => {
                write!(f, "Tauth afid {afid} uname {uname} aname {aname}")
            }
            Self::Flush { oldtag } => write!(f, "Tflush oldtag {oldtag}"),
            Self::Attach {
                fid, uname, aname, ..
            } => write!(f, "Tattach fid {fid} uname {uname} aname {aname}"),
            Self::Walk {
                fid,
                newfid,
                wnames,
            } => write!(f, "Twalk fid {fid} newfid {newfid} {}", wnames.join("/")),
            Self::Open { fid, mode } => write!(f, "Topen fid {fid} mode {}", mode.bits()),
            Self::Create {
                fid, name, perm, ..
            } => write!(f, "Tcreate fid {fid} name {name} perm {perm:o}"),
            Self::Read { fid, offset, count } => {
                write!(f, "Tread fid {fid} offset {offset} count {count}")
            }
            Self::Write { fid, offset, data } => {
                write!(f, "Twrite fid {fid} offset {offset} count {}", data.len())
            }
            Self::Clunk { fid } => write!(f, "Tclunk fid {fid}"),
            Self::Remove { fid } => write!(f, "Tremove fid {fid}"),
            Self::Stat { fid } => write!(f, "Tstat fid {fid}"),
            Self::Wstat { fid, .. } => write!(f, "Twstat fid {fid}"),
        }
    }
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version { msize, version } => {
                write!(f, "Rversion msize {msize} version {version}")
            }
            Self::Auth { aqid } => write!(f, "Rauth aqid {:#x}", aqid.path()),
            Self::Error { ename } => write!(f, "Rerror {ename}"),
            Self::Flush => f.write_str("Rflush"),
            Self::Attach { qid } => write!(f, "Rattach qid {:#x}", qid.path()),
            Self::Walk { qids } => write!(f, "Rwalk nwqid {}", qids.len()),
            Self::Open { qid, iounit } => write!(f, "Ropen qid {:#x} iounit {iounit}", qid.path()),
            Self::Create { qid, iounit } => {
                write!(f, "Rcreate qid {:#x} iounit {iounit}", qid.path())
            }
            Self::Read { data } => write!(f, "Rread count {}", data.len()),
            Self::Write { count } => write!(f, "Rwrite count {count}"),
            Self::Clunk => f.write_str("Rclunk"),
            Self::Remove => f.write_str("Rremove"),
            Self::Stat { stat } => write!(f, "Rstat {}", stat.name),
            Self::Wstat => f.write_str("Rwstat"),
        }
    }
}
