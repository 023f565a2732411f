//! 9P2000 message types and wire codec.
//!
//! A message is framed as `size[4] type[1] tag[2] body`, where `size` counts
//! itself. Every numeric field is little-endian; strings carry a 2-byte
//! length prefix. The codec is synchronous and operates on complete frames;
//! framing against the stream lives in the connection reader.

use std::fmt;

use bitflags::bitflags;

/// The only protocol version this server speaks.
pub const VERSION9P: &str = "9P2000";

/// Tag that `Tversion`/`Rversion` conventionally carry.
pub const NOTAG: u16 = !0;

/// Afid value meaning "no authentication fid".
pub const NOFID: u32 = !0;

/// Room for a Twrite/Rread header: size[4] type[1] tag[2] fid[4] offset[8] count[4].
pub const IOHDRSZ: u32 = 24;

/// Maximum walk elements in a single Twalk.
pub const MAXWELEM: usize = 16;

/// Smallest msize a client may negotiate.
pub const MIN_MSIZE: u32 = 4096;

/// Largest msize this server will grant.
pub const MAX_MSIZE: u32 = 8192 + IOHDRSZ;

bitflags! {
    /// Bits in `Qid.typ`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QidType: u8 {
        /// Type bit for directories.
        const DIR    = 0x80;
        /// Type bit for append-only files.
        const APPEND = 0x40;
        /// Type bit for exclusive-use files.
        const EXCL   = 0x20;
        /// Type bit for authentication files.
        const AUTH   = 0x08;
        /// Type bit for not-backed-up files.
        const TMP    = 0x04;
        /// Plain file.
        const FILE   = 0x00;
    }
}

/// Bits in `Stat.mode` and `Tcreate.perm`.
pub mod dm {
    /// Mode bit for directories.
    pub const DIR: u32 = 0x8000_0000;
    /// Mode bit for append-only files.
    pub const APPEND: u32 = 0x4000_0000;
    /// Mode bit for exclusive-use files.
    pub const EXCL: u32 = 0x2000_0000;
    /// Mode bit for authentication files.
    pub const AUTH: u32 = 0x0800_0000;
    /// Mode bit for non-backed-up files.
    pub const TMP: u32 = 0x0400_0000;
    /// Mode bit for read permission.
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission.
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission.
    pub const EXEC: u32 = 0x1;
}

/// The I/O type in `Topen.mode` / `Tcreate.mode`.
pub mod om {
    /// Open for read.
    pub const READ: u8 = 0;
    /// Open for write.
    pub const WRITE: u8 = 1;
    /// Open for read and write.
    pub const RDWR: u8 = 2;
    /// Execute; read but check execute permission.
    pub const EXEC: u8 = 3;
    /// Or'ed in: truncate the file first.
    pub const TRUNC: u8 = 16;
    /// Or'ed in: remove on clunk.
    pub const RCLOSE: u8 = 64;
}

/// Server-unique identity of a file for its entire existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

/// Wire size of an encoded qid.
pub const QIDSZ: usize = 13;

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#x} {} {:#04x})", self.path, self.version, self.typ.bits())
    }
}

/// A directory entry as carried by Rstat and Twstat.
///
/// In a Twstat, a maxed-out numeric field or an empty string means "don't
/// touch"; [`Stat::unset`] builds such a record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stat {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// A stat record with every field set to "don't touch".
    pub fn unset() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: Qid { typ: QidType::from_bits_retain(!0), version: !0, path: !0 },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Encoded size of this record, excluding the leading size[2] field.
    pub fn wire_size(&self) -> u16 {
        (2 + 4
            + QIDSZ
            + 4
            + 4
            + 4
            + 8
            + 2
            + self.name.len()
            + 2
            + self.uid.len()
            + 2
            + self.gid.len()
            + 2
            + self.muid.len()) as u16
    }

    /// Serialize as a stat blob: size[2] followed by the record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size() as usize + 2);
        let mut enc = Encoder::new(&mut buf);
        enc.stat(self);
        buf
    }
}

/// A decoded 9P message body. T-variants are requests, R-variants replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fcall {
    Tversion { msize: u32, version: String },
    Rversion { msize: u32, version: String },
    Tauth { afid: u32, uname: String, aname: String },
    Rauth { aqid: Qid },
    Rerror { ename: String },
    Tflush { oldtag: u16 },
    Rflush,
    Tattach { fid: u32, afid: u32, uname: String, aname: String },
    Rattach { qid: Qid },
    Twalk { fid: u32, newfid: u32, wnames: Vec<String> },
    Rwalk { wqids: Vec<Qid> },
    Topen { fid: u32, mode: u8 },
    Ropen { qid: Qid, iounit: u32 },
    Tcreate { fid: u32, name: String, perm: u32, mode: u8 },
    Rcreate { qid: Qid, iounit: u32 },
    Tread { fid: u32, offset: u64, count: u32 },
    Rread { data: Vec<u8> },
    Twrite { fid: u32, offset: u64, data: Vec<u8> },
    Rwrite { count: u32 },
    Tclunk { fid: u32 },
    Rclunk,
    Tremove { fid: u32 },
    Rremove,
    Tstat { fid: u32 },
    Rstat { stat: Stat },
    Twstat { fid: u32, stat: Stat },
    Rwstat,
}

impl Fcall {
    /// Wire discriminant of this message.
    pub fn type_byte(&self) -> u8 {
        match self {
            Fcall::Tversion { .. } => 100,
            Fcall::Rversion { .. } => 101,
            Fcall::Tauth { .. } => 102,
            Fcall::Rauth { .. } => 103,
            Fcall::Rerror { .. } => 107,
            Fcall::Tflush { .. } => 108,
            Fcall::Rflush => 109,
            Fcall::Tattach { .. } => 104,
            Fcall::Rattach { .. } => 105,
            Fcall::Twalk { .. } => 110,
            Fcall::Rwalk { .. } => 111,
            Fcall::Topen { .. } => 112,
            Fcall::Ropen { .. } => 113,
            Fcall::Tcreate { .. } => 114,
            Fcall::Rcreate { .. } => 115,
            Fcall::Tread { .. } => 116,
            Fcall::Rread { .. } => 117,
            Fcall::Twrite { .. } => 118,
            Fcall::Rwrite { .. } => 119,
            Fcall::Tclunk { .. } => 120,
            Fcall::Rclunk => 121,
            Fcall::Tremove { .. } => 122,
            Fcall::Rremove => 123,
            Fcall::Tstat { .. } => 124,
            Fcall::Rstat { .. } => 125,
            Fcall::Twstat { .. } => 126,
            Fcall::Rwstat => 127,
        }
    }
}

impl fmt::Display for Fcall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fcall::Tversion { msize, version } => {
                write!(f, "Tversion msize={} version={:?}", msize, version)
            }
            Fcall::Rversion { msize, version } => {
                write!(f, "Rversion msize={} version={:?}", msize, version)
            }
            Fcall::Tauth { afid, uname, aname } => {
                write!(f, "Tauth afid={} uname={:?} aname={:?}", afid, uname, aname)
            }
            Fcall::Rauth { aqid } => write!(f, "Rauth aqid={}", aqid),
            Fcall::Rerror { ename } => write!(f, "Rerror ename={:?}", ename),
            Fcall::Tflush { oldtag } => write!(f, "Tflush oldtag={}", oldtag),
            Fcall::Rflush => write!(f, "Rflush"),
            Fcall::Tattach { fid, afid, uname, aname } => write!(
                f,
                "Tattach fid={} afid={} uname={:?} aname={:?}",
                fid, afid, uname, aname
            ),
            Fcall::Rattach { qid } => write!(f, "Rattach qid={}", qid),
            Fcall::Twalk { fid, newfid, wnames } => {
                write!(f, "Twalk fid={} newfid={} wnames={:?}", fid, newfid, wnames)
            }
            Fcall::Rwalk { wqids } => {
                write!(f, "Rwalk nwqid={}", wqids.len())?;
                for q in wqids {
                    write!(f, " {}", q)?;
                }
                Ok(())
            }
            Fcall::Topen { fid, mode } => write!(f, "Topen fid={} mode={:#o}", fid, mode),
            Fcall::Ropen { qid, iounit } => write!(f, "Ropen qid={} iounit={}", qid, iounit),
            Fcall::Tcreate { fid, name, perm, mode } => write!(
                f,
                "Tcreate fid={} name={:?} perm={:#o} mode={:#o}",
                fid, name, perm, mode
            ),
            Fcall::Rcreate { qid, iounit } => write!(f, "Rcreate qid={} iounit={}", qid, iounit),
            Fcall::Tread { fid, offset, count } => {
                write!(f, "Tread fid={} offset={} count={}", fid, offset, count)
            }
            Fcall::Rread { data } => write!(f, "Rread count={}", data.len()),
            Fcall::Twrite { fid, offset, data } => {
                write!(f, "Twrite fid={} offset={} count={}", fid, offset, data.len())
            }
            Fcall::Rwrite { count } => write!(f, "Rwrite count={}", count),
            Fcall::Tclunk { fid } => write!(f, "Tclunk fid={}", fid),
            Fcall::Rclunk => write!(f, "Rclunk"),
            Fcall::Tremove { fid } => write!(f, "Tremove fid={}", fid),
            Fcall::Rremove => write!(f, "Rremove"),
            Fcall::Tstat { fid } => write!(f, "Tstat fid={}", fid),
            Fcall::Rstat { stat } => write!(f, "Rstat name={:?} qid={}", stat.name, stat.qid),
            Fcall::Twstat { fid, stat } => {
                write!(f, "Twstat fid={} name={:?} mode={:#o}", fid, stat.name, stat.mode)
            }
            Fcall::Rwstat => write!(f, "Rwstat"),
        }
    }
}

/// Why a frame failed to decode. Any of these is fatal to the connection.
#[derive(Debug)]
pub enum CodecError {
    /// The frame ended before the message did.
    Truncated,
    /// The size field disagrees with the frame, or exceeds the negotiated max.
    BadSize { size: u32 },
    /// The type byte names no known 9P2000 message.
    UnknownType(u8),
    /// A string field held invalid UTF-8.
    BadString,
    /// Bytes left over after the message was fully parsed.
    TrailingBytes,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "malformed message: truncated"),
            CodecError::BadSize { size } => write!(f, "malformed message: bad size {}", size),
            CodecError::UnknownType(t) => write!(f, "malformed message: unknown type {}", t),
            CodecError::BadString => write!(f, "malformed message: invalid string"),
            CodecError::TrailingBytes => write!(f, "malformed message: trailing bytes"),
        }
    }
}

impl std::error::Error for CodecError {}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let n = self.u16()? as usize;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::BadString)
    }

    fn qid(&mut self) -> Result<Qid, CodecError> {
        Ok(Qid {
            typ: QidType::from_bits_retain(self.u8()?),
            version: self.u32()?,
            path: self.u64()?,
        })
    }

    fn stat(&mut self) -> Result<Stat, CodecError> {
        // size[2] of the record proper; re-checked against what we consume.
        let size = self.u16()? as usize;
        let start = self.pos;
        let st = Stat {
            typ: self.u16()?,
            dev: self.u32()?,
            qid: self.qid()?,
            mode: self.u32()?,
            atime: self.u32()?,
            mtime: self.u32()?,
            length: self.u64()?,
            name: self.string()?,
            uid: self.string()?,
            gid: self.string()?,
            muid: self.string()?,
        };
        if self.pos - start != size {
            return Err(CodecError::BadSize { size: size as u32 });
        }
        Ok(st)
    }
}

/// Little-endian message writer over a borrowed buffer.
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Encoder<'a> {
        Encoder { buf }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn qid(&mut self, q: &Qid) {
        self.u8(q.typ.bits());
        self.u32(q.version);
        self.u64(q.path);
    }

    fn stat(&mut self, st: &Stat) {
        self.u16(st.wire_size());
        self.u16(st.typ);
        self.u32(st.dev);
        self.qid(&st.qid);
        self.u32(st.mode);
        self.u32(st.atime);
        self.u32(st.mtime);
        self.u64(st.length);
        self.string(&st.name);
        self.string(&st.uid);
        self.string(&st.gid);
        self.string(&st.muid);
    }
}

/// Encode a tagged message into `buf`, replacing its contents. The buffer is
/// reused across responses by the dispatcher.
pub fn encode(tag: u16, fc: &Fcall, buf: &mut Vec<u8>) {
    buf.clear();
    buf.extend_from_slice(&[0; 4]);
    let mut enc = Encoder::new(buf);
    enc.u8(fc.type_byte());
    enc.u16(tag);
    match fc {
        Fcall::Tversion { msize, version } | Fcall::Rversion { msize, version } => {
            enc.u32(*msize);
            enc.string(version);
        }
        Fcall::Tauth { afid, uname, aname } => {
            enc.u32(*afid);
            enc.string(uname);
            enc.string(aname);
        }
        Fcall::Rauth { aqid } => enc.qid(aqid),
        Fcall::Rerror { ename } => enc.string(ename),
        Fcall::Tflush { oldtag } => enc.u16(*oldtag),
        Fcall::Rflush => {}
        Fcall::Tattach { fid, afid, uname, aname } => {
            enc.u32(*fid);
            enc.u32(*afid);
            enc.string(uname);
            enc.string(aname);
        }
        Fcall::Rattach { qid } => enc.qid(qid),
        Fcall::Twalk { fid, newfid, wnames } => {
            enc.u32(*fid);
            enc.u32(*newfid);
            enc.u16(wnames.len() as u16);
            for name in wnames {
                enc.string(name);
            }
        }
        Fcall::Rwalk { wqids } => {
            enc.u16(wqids.len() as u16);
            for q in wqids {
                enc.qid(q);
            }
        }
        Fcall::Topen { fid, mode } => {
            enc.u32(*fid);
            enc.u8(*mode);
        }
        Fcall::Ropen { qid, iounit } | Fcall::Rcreate { qid, iounit } => {
            enc.qid(qid);
            enc.u32(*iounit);
        }
        Fcall::Tcreate { fid, name, perm, mode } => {
            enc.u32(*fid);
            enc.string(name);
            enc.u32(*perm);
            enc.u8(*mode);
        }
        Fcall::Tread { fid, offset, count } => {
            enc.u32(*fid);
            enc.u64(*offset);
            enc.u32(*count);
        }
        Fcall::Rread { data } => {
            enc.u32(data.len() as u32);
            enc.buf.extend_from_slice(data);
        }
        Fcall::Twrite { fid, offset, data } => {
            enc.u32(*fid);
            enc.u64(*offset);
            enc.u32(data.len() as u32);
            enc.buf.extend_from_slice(data);
        }
        Fcall::Rwrite { count } => enc.u32(*count),
        Fcall::Tclunk { fid } | Fcall::Tremove { fid } | Fcall::Tstat { fid } => enc.u32(*fid),
        Fcall::Rclunk | Fcall::Rremove | Fcall::Rwstat => {}
        Fcall::Rstat { stat } => {
            enc.u16(stat.wire_size() + 2);
            enc.stat(stat);
        }
        Fcall::Twstat { fid, stat } => {
            enc.u32(*fid);
            enc.u16(stat.wire_size() + 2);
            enc.stat(stat);
        }
    }
    let size = buf.len() as u32;
    buf[0..4].copy_from_slice(&size.to_le_bytes());
}

/// Decode a complete frame (including its size field) into a tag and message.
pub fn decode(frame: &[u8]) -> Result<(u16, Fcall), CodecError> {
    let mut dec = Decoder::new(frame);
    let size = dec.u32()?;
    if size as usize != frame.len() {
        return Err(CodecError::BadSize { size });
    }
    let typ = dec.u8()?;
    let tag = dec.u16()?;
    let fc = match typ {
        100 => Fcall::Tversion { msize: dec.u32()?, version: dec.string()? },
        101 => Fcall::Rversion { msize: dec.u32()?, version: dec.string()? },
        102 => Fcall::Tauth { afid: dec.u32()?, uname: dec.string()?, aname: dec.string()? },
        103 => Fcall::Rauth { aqid: dec.qid()? },
        107 => Fcall::Rerror { ename: dec.string()? },
        108 => Fcall::Tflush { oldtag: dec.u16()? },
        109 => Fcall::Rflush,
        104 => Fcall::Tattach {
            fid: dec.u32()?,
            afid: dec.u32()?,
            uname: dec.string()?,
            aname: dec.string()?,
        },
        105 => Fcall::Rattach { qid: dec.qid()? },
        110 => {
            let fid = dec.u32()?;
            let newfid = dec.u32()?;
            let n = dec.u16()? as usize;
            let mut wnames = Vec::with_capacity(n.min(MAXWELEM + 1));
            for _ in 0..n {
                wnames.push(dec.string()?);
            }
            Fcall::Twalk { fid, newfid, wnames }
        }
        111 => {
            let n = dec.u16()? as usize;
            let mut wqids = Vec::with_capacity(n.min(MAXWELEM + 1));
            for _ in 0..n {
                wqids.push(dec.qid()?);
            }
            Fcall::Rwalk { wqids }
        }
        112 => Fcall::Topen { fid: dec.u32()?, mode: dec.u8()? },
        113 => Fcall::Ropen { qid: dec.qid()?, iounit: dec.u32()? },
        114 => Fcall::Tcreate {
            fid: dec.u32()?,
            name: dec.string()?,
            perm: dec.u32()?,
            mode: dec.u8()?,
        },
        115 => Fcall::Rcreate { qid: dec.qid()?, iounit: dec.u32()? },
        116 => Fcall::Tread { fid: dec.u32()?, offset: dec.u64()?, count: dec.u32()? },
        117 => {
            let count = dec.u32()? as usize;
            Fcall::Rread { data: dec.take(count)?.to_vec() }
        }
        118 => {
            let fid = dec.u32()?;
            let offset = dec.u64()?;
            let count = dec.u32()? as usize;
            Fcall::Twrite { fid, offset, data: dec.take(count)?.to_vec() }
        }
        119 => Fcall::Rwrite { count: dec.u32()? },
        120 => Fcall::Tclunk { fid: dec.u32()? },
        121 => Fcall::Rclunk,
        122 => Fcall::Tremove { fid: dec.u32()? },
        123 => Fcall::Rremove,
        124 => Fcall::Tstat { fid: dec.u32()? },
        125 => {
            let nstat = dec.u16()?;
            let start = dec.pos;
            let stat = dec.stat()?;
            if dec.pos - start != nstat as usize {
                return Err(CodecError::BadSize { size: nstat as u32 });
            }
            Fcall::Rstat { stat }
        }
        126 => {
            let fid = dec.u32()?;
            let nstat = dec.u16()?;
            let start = dec.pos;
            let stat = dec.stat()?;
            if dec.pos - start != nstat as usize {
                return Err(CodecError::BadSize { size: nstat as u32 });
            }
            Fcall::Twstat { fid, stat }
        }
        127 => Fcall::Rwstat,
        other => return Err(CodecError::UnknownType(other)),
    };
    if dec.remaining() != 0 {
        return Err(CodecError::TrailingBytes);
    }
    Ok((tag, fc))
}
