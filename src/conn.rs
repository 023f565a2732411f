//! Connection plumbing and per-connection session state.
//!
//! A [`Conn`] is the shared half of a connection: the write side of the
//! stream plus identity for logging. The protocol-visible state of the
//! session (negotiation progress, msize, the fid table) lives in a
//! [`Session`], which is owned exclusively by the dispatcher and needs no
//! locking.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::fcall::MAX_MSIZE;
use crate::fid::FidTable;

/// Smallest legal frame: size[4] type[1] tag[2].
const MIN_FRAME: u32 = 7;

/// Where a connection stands in the protocol handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing negotiated; only Tversion is acceptable.
    Fresh,
    /// Version agreed; waiting for the first attach.
    Versioned,
    /// At least one fid is rooted in the tree.
    Attached,
}

/// Dispatcher-owned state of one connection.
#[derive(Debug)]
pub struct Session {
    pub state: SessionState,
    pub msize: u32,
    pub fids: FidTable,
}

impl Session {
    pub fn new() -> Session {
        Session { state: SessionState::Fresh, msize: MAX_MSIZE, fids: FidTable::new() }
    }

    /// Tversion resets everything protocol-visible.
    pub fn reset(&mut self, msize: u32) {
        self.state = SessionState::Versioned;
        self.msize = msize;
        self.fids = FidTable::new();
    }
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

/// The stream-writing half of a connection, shared between the reader task
/// (which only holds it for identity) and the dispatcher (the only writer).
pub struct Conn {
    pub id: u64,
    /// Peer description for log lines.
    pub peer: String,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl Conn {
    pub fn new(id: u64, peer: String, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Conn {
        Conn { id, peer, writer: Mutex::new(writer) }
    }

    /// Write one encoded R-message. Only the dispatcher calls this, so each
    /// message goes out whole.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(frame).await?;
        w.flush().await
    }
}

/// Read one framed message off the stream: the 4-byte size, then the rest.
/// Returns `None` on clean end-of-stream. A size outside `[7, max_size]` is
/// an error and kills the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_size: u32,
) -> io::Result<Option<Vec<u8>>> {
    let mut size_buf = [0u8; 4];
    match r.read_exact(&mut size_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let size = u32::from_le_bytes(size_buf);
    if !(MIN_FRAME..=max_size).contains(&size) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {} out of range", size),
        ));
    }
    let mut frame = vec![0u8; size as usize];
    frame[0..4].copy_from_slice(&size_buf);
    r.read_exact(&mut frame[4..]).await?;
    Ok(Some(frame))
}
