//! The server: acceptor, connection readers, and the single dispatcher.
//!
//! Every decoded T-message from every connection funnels into one FIFO
//! channel. One dispatcher task drains it, runs the handler, and writes the
//! R-message back on the originating connection. The tree, the fid tables,
//! and the user store are touched only by that task, so none of them carry
//! locks. Readers do nothing but decode and forward.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, Network};
use crate::conn::{read_frame, Conn, Session, SessionState};
use crate::error::VufsError;
use crate::fcall::{self, om, Fcall, MAX_MSIZE, VERSION9P};
use crate::tree::Tree;
use crate::users::UserDb;

/// The file system state the handlers operate on. Owned by the dispatcher;
/// nothing else ever sees it.
pub struct VuFs {
    pub config: Config,
    pub users: UserDb,
    pub tree: Tree,
}

impl VuFs {
    /// Load the users table and mirror the backing root. The users file is
    /// loaded first so a freshly seeded `adm/users` shows up in the tree.
    pub fn new(config: Config) -> Result<VuFs> {
        info!("creating filesystem rooted at {}", config.root.display());
        let users = UserDb::load(&config.root)?;
        let tree = Tree::build(&config.root, &config.default_user)?;
        Ok(VuFs { config, users, tree })
    }
}

/// What reader tasks feed the dispatcher.
enum Request {
    Fcall { conn: Arc<Conn>, tag: u16, fc: Fcall },
    Hangup { conn_id: u64 },
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

impl Listener {
    async fn bind(network: Network, addr: &str) -> Result<Listener> {
        match network {
            Network::Tcp => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            Network::Unix => Ok(Listener::Unix(UnixListener::bind(addr)?)),
        }
    }

    async fn accept(&self) -> io::Result<(ReadHalf, WriteHalf, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), peer.to_string()))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), "unix".to_string()))
            }
        }
    }

    fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            Listener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_default(),
        }
    }
}

/// A running server. Dropping it without calling [`Server::stop`] aborts
/// nothing; stop performs the orderly drain the protocol promises.
pub struct Server {
    local_addr: String,
    socket_path: Option<PathBuf>,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Server {
    /// Build the file system and start the acceptor and dispatcher tasks.
    pub async fn start(config: Config) -> Result<Server> {
        let socket_path = match config.network {
            Network::Unix => Some(PathBuf::from(&config.listen)),
            Network::Tcp => None,
        };
        let listener = Listener::bind(config.network, &config.listen).await?;
        let local_addr = listener.local_addr();
        let vufs = VuFs::new(config)?;
        info!("listening on {}", local_addr);

        let (req_tx, req_rx) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher {
            vufs,
            sessions: HashMap::new(),
            backlog: VecDeque::new(),
            rbuf: Vec::new(),
            shutdown: shutdown_rx.clone(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(req_rx));
        let acceptor = tokio::spawn(accept_loop(listener, req_tx, shutdown_rx));

        Ok(Server { local_addr, socket_path, shutdown, acceptor, dispatcher })
    }

    /// Address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Stop accepting, close the readers, and let the dispatcher answer
    /// everything still queued with "file system stopped" before exiting.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.acceptor.await;
        let _ = self.dispatcher.await;
        if let Some(path) = self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept_loop(
    listener: Listener,
    req_tx: mpsc::Sender<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((read, write, peer)) => {
                    next_id += 1;
                    let conn = Arc::new(Conn::new(next_id, peer, write));
                    info!("[{}] new connection", conn.peer);
                    tokio::spawn(read_loop(read, conn, req_tx.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!("accept error: {}", e);
                    break;
                }
            },
        }
    }
    debug!("acceptor done");
}

/// Per-connection reader: decode T-messages and forward them. A decode
/// error is fatal to this connection only.
async fn read_loop(
    mut read: ReadHalf,
    conn: Arc<Conn>,
    req_tx: mpsc::Sender<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut read, MAX_MSIZE) => match frame {
                Ok(Some(frame)) => match fcall::decode(&frame) {
                    Ok((tag, fc)) => {
                        let req = Request::Fcall { conn: conn.clone(), tag, fc };
                        if req_tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[{}] {}", conn.peer, e);
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    if !*shutdown.borrow() {
                        warn!("[{}] read error: {}", conn.peer, e);
                    }
                    break;
                }
            },
        }
    }
    let _ = req_tx.send(Request::Hangup { conn_id: conn.id }).await;
    debug!("[{}] connection closed", conn.peer);
}

struct Dispatcher {
    vufs: VuFs,
    sessions: HashMap<u64, Session>,
    /// Requests pulled off the channel during version-reset or flush
    /// surgery; always served before the channel to keep FIFO order.
    backlog: VecDeque<Request>,
    /// The one response buffer. Valid because at most one response is being
    /// built at any time.
    rbuf: Vec<u8>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        loop {
            let req = match self.backlog.pop_front() {
                Some(req) => req,
                None => match rx.recv().await {
                    Some(req) => req,
                    None => break,
                },
            };
            self.step(req, &mut rx).await;
        }
        // The channel is closed; whatever the surgery queue still holds
        // gets the shutdown answer.
        while let Some(req) = self.backlog.pop_front() {
            if let Request::Fcall { conn, tag, .. } = req {
                self.reply(&conn, tag, &rerror(VufsError::Stopped)).await;
            }
        }
        debug!("dispatcher done");
    }

    async fn step(&mut self, req: Request, rx: &mut mpsc::Receiver<Request>) {
        let (conn, tag, fc) = match req {
            Request::Hangup { conn_id } => {
                // Teardown clunks every fid, which fires remove-on-close.
                if let Some(mut sess) = self.sessions.remove(&conn_id) {
                    for f in sess.fids.drain() {
                        if f.open && f.open_mode & om::RCLOSE != 0 {
                            if let Err(e) = self.vufs.remove_backing(f.node).await {
                                warn!("remove-on-close failed: {}", e);
                            }
                        }
                    }
                }
                return;
            }
            Request::Fcall { conn, tag, fc } => (conn, tag, fc),
        };
        debug!("[{}] <- tag={} {}", conn.peer, tag, fc);

        if *self.shutdown.borrow() {
            self.reply(&conn, tag, &rerror(VufsError::Stopped)).await;
            return;
        }

        let fresh = self
            .sessions
            .get(&conn.id)
            .map_or(true, |s| s.state == SessionState::Fresh);

        match fc {
            Fcall::Tversion { msize, version } => {
                self.version(conn, tag, msize, &version, rx).await;
            }
            _ if fresh => {
                self.reply(&conn, tag, &rerror(VufsError::VersionNotNegotiated)).await;
            }
            Fcall::Tflush { oldtag } => {
                self.flush(conn, tag, oldtag, rx).await;
            }
            fc => {
                let sess = self.sessions.entry(conn.id).or_default();
                let resp = match fc {
                    Fcall::Tauth { .. } => self.vufs.rauth(),
                    Fcall::Tattach { fid, afid, uname, aname } => {
                        self.vufs.rattach(sess, fid, afid, &uname, &aname)
                    }
                    Fcall::Twalk { fid, newfid, wnames } => {
                        self.vufs.rwalk(sess, fid, newfid, &wnames)
                    }
                    Fcall::Topen { fid, mode } => self.vufs.ropen(sess, fid, mode).await,
                    Fcall::Tcreate { fid, name, perm, mode } => {
                        self.vufs.rcreate(sess, fid, &name, perm, mode).await
                    }
                    Fcall::Tread { fid, offset, count } => {
                        self.vufs.rread(sess, fid, offset, count).await
                    }
                    Fcall::Twrite { fid, offset, data } => {
                        self.vufs.rwrite(sess, fid, offset, &data).await
                    }
                    Fcall::Tclunk { fid } => self.vufs.rclunk(sess, fid).await,
                    Fcall::Tremove { fid } => self.vufs.rremove(sess, fid).await,
                    Fcall::Tstat { fid } => self.vufs.rstat(sess, fid),
                    Fcall::Twstat { fid, stat } => self.vufs.rwstat(sess, fid, &stat).await,
                    // R-messages are never legal from a client.
                    _ => Err(VufsError::BadFcallType),
                };
                let r = resp.unwrap_or_else(rerror);
                self.reply(&conn, tag, &r).await;
            }
        }
    }

    /// Tversion. A successful negotiation resets the session, which drops
    /// this connection's queued requests so fid state is unambiguous.
    async fn version(
        &mut self,
        conn: Arc<Conn>,
        tag: u16,
        msize: u32,
        version: &str,
        rx: &mut mpsc::Receiver<Request>,
    ) {
        let sess = self.sessions.entry(conn.id).or_default();
        let resp = self.vufs.rversion(sess, msize, version);
        let negotiated =
            matches!(&resp, Ok(Fcall::Rversion { version, .. }) if version == VERSION9P);

        let mut dropped = Vec::new();
        if negotiated {
            while let Ok(req) = rx.try_recv() {
                match req {
                    Request::Fcall { conn: c, tag: t, .. } if c.id == conn.id => {
                        dropped.push((c, t));
                    }
                    other => self.backlog.push_back(other),
                }
            }
        }
        for (c, t) in dropped {
            self.reply(&c, t, &rerror(VufsError::SessionReset)).await;
        }
        let r = resp.unwrap_or_else(rerror);
        self.reply(&conn, tag, &r).await;
    }

    /// Tflush. The dispatcher is single-threaded, so `oldtag` has either
    /// finished already or is still in the queue; in the latter case it is
    /// removed without a reply of its own.
    async fn flush(
        &mut self,
        conn: Arc<Conn>,
        tag: u16,
        oldtag: u16,
        rx: &mut mpsc::Receiver<Request>,
    ) {
        while let Ok(req) = rx.try_recv() {
            self.backlog.push_back(req);
        }
        self.backlog.retain(|req| {
            !matches!(req,
                Request::Fcall { conn: c, tag: t, .. } if c.id == conn.id && *t == oldtag)
        });
        self.reply(&conn, tag, &Fcall::Rflush).await;
    }

    async fn reply(&mut self, conn: &Conn, tag: u16, fc: &Fcall) {
        fcall::encode(tag, fc, &mut self.rbuf);
        debug!("[{}] -> tag={} {}", conn.peer, tag, fc);
        if let Err(e) = conn.send(&self.rbuf).await {
            warn!("[{}] write error: {}", conn.peer, e);
        }
    }
}

fn rerror(err: VufsError) -> Fcall {
    Fcall::Rerror { ename: err.to_string() }
}
