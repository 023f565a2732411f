//! End-to-end protocol scenarios against a live server.
//!
//! Each test boots a server on an ephemeral port over a throwaway backing
//! directory and drives it with a bare 9P client built on the crate's own
//! codec.

use std::path::Path;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use vufs::conn::read_frame;
use vufs::fcall::{self, dm, om, Fcall, QidType, Stat, MAX_MSIZE, NOFID, VERSION9P};
use vufs::{Config, Network, Server};

/// A server over a fresh backing directory, plus the users it was seeded
/// with.
struct TestServer {
    _dir: TempDir,
    server: Option<Server>,
    addr: String,
}

impl TestServer {
    /// Boot with the given `adm/users` contents (the default seed when
    /// `None`).
    async fn start(users: Option<&str>) -> TestServer {
        let dir = TempDir::new().unwrap();
        if let Some(users) = users {
            std::fs::create_dir_all(dir.path().join("adm")).unwrap();
            std::fs::write(dir.path().join("adm/users"), users).unwrap();
        }
        let config =
            Config::new(dir.path().to_path_buf(), Network::Tcp, "127.0.0.1:0", "adm").unwrap();
        let server = Server::start(config).await.unwrap();
        let addr = server.local_addr().to_string();
        TestServer { _dir: dir, server: Some(server), addr }
    }

    fn root(&self) -> &Path {
        self._dir.path()
    }

    async fn connect(&self) -> Client {
        Client::connect(&self.addr).await
    }

    async fn stop(mut self) {
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
    }
}

/// Minimal 9P client: one request in flight at a time unless a test
/// pipelines by hand.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    async fn connect(addr: &str) -> Client {
        Client { stream: TcpStream::connect(addr).await.unwrap(), buf: Vec::new() }
    }

    async fn send(&mut self, tag: u16, fc: &Fcall) {
        fcall::encode(tag, fc, &mut self.buf);
        self.stream.write_all(&self.buf).await.unwrap();
    }

    async fn recv(&mut self) -> (u16, Fcall) {
        let frame = read_frame(&mut self.stream, MAX_MSIZE).await.unwrap().expect("server closed");
        fcall::decode(&frame).unwrap()
    }

    async fn rpc(&mut self, tag: u16, fc: &Fcall) -> Fcall {
        self.send(tag, fc).await;
        let (rtag, reply) = self.recv().await;
        assert_eq!(rtag, tag, "reply tag mismatch for {}", fc);
        reply
    }

    /// Negotiate and attach in one go; most tests start here.
    async fn handshake(&mut self, uname: &str, fid: u32) -> Fcall {
        let r = self
            .rpc(
                u16::MAX,
                &Fcall::Tversion { msize: 8192, version: VERSION9P.to_string() },
            )
            .await;
        assert!(matches!(r, Fcall::Rversion { .. }));
        self.rpc(
            0,
            &Fcall::Tattach {
                fid,
                afid: NOFID,
                uname: uname.to_string(),
                aname: "/".to_string(),
            },
        )
        .await
    }
}

fn ename(reply: Fcall) -> String {
    match reply {
        Fcall::Rerror { ename } => ename,
        other => panic!("expected Rerror, got {}", other),
    }
}

#[tokio::test]
async fn version_truncates_dotted_suffix_and_clamps_msize() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;

    let r = c
        .rpc(0, &Fcall::Tversion { msize: 8192, version: "9P2000.L".to_string() })
        .await;
    assert_eq!(r, Fcall::Rversion { msize: 8192, version: "9P2000".to_string() });

    let r = c
        .rpc(0, &Fcall::Tversion { msize: 1 << 20, version: "9P2000".to_string() })
        .await;
    assert_eq!(r, Fcall::Rversion { msize: MAX_MSIZE, version: "9P2000".to_string() });

    let r = c
        .rpc(0, &Fcall::Tversion { msize: 1024, version: "9P2000".to_string() })
        .await;
    assert_eq!(ename(r), "msize out of range");

    ts.stop().await;
}

#[tokio::test]
async fn unknown_version_does_not_establish_a_session() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;

    let r = c
        .rpc(0, &Fcall::Tversion { msize: 8192, version: "9P1999".to_string() })
        .await;
    assert_eq!(r, Fcall::Rversion { msize: 8192, version: "unknown".to_string() });

    let r = c
        .rpc(
            1,
            &Fcall::Tattach {
                fid: 0,
                afid: NOFID,
                uname: "mark".to_string(),
                aname: "/".to_string(),
            },
        )
        .await;
    assert_eq!(ename(r), "version not negotiated");

    ts.stop().await;
}

#[tokio::test]
async fn first_message_must_be_version() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    let r = c.rpc(3, &Fcall::Tstat { fid: 0 }).await;
    assert_eq!(ename(r), "version not negotiated");
    ts.stop().await;
}

#[tokio::test]
async fn attach_only_to_root() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    let r = c.handshake("mark", 0).await;
    match r {
        Fcall::Rattach { qid } => assert!(qid.typ.contains(QidType::DIR)),
        other => panic!("expected Rattach, got {}", other),
    }

    let r = c
        .rpc(
            1,
            &Fcall::Tattach {
                fid: 1,
                afid: NOFID,
                uname: "mark".to_string(),
                aname: "/home".to_string(),
            },
        )
        .await;
    assert_eq!(ename(r), "can only attach to root directory");

    let r = c
        .rpc(
            2,
            &Fcall::Tattach {
                fid: 1,
                afid: 42,
                uname: "mark".to_string(),
                aname: "/".to_string(),
            },
        )
        .await;
    assert_eq!(ename(r), "authentication not supported");

    ts.stop().await;
}

#[tokio::test]
async fn auth_always_fails() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;
    let r = c
        .rpc(
            1,
            &Fcall::Tauth { afid: 1, uname: "mark".to_string(), aname: "/".to_string() },
        )
        .await;
    assert_eq!(ename(r), "authentication not supported");
    ts.stop().await;
}

#[tokio::test]
async fn double_attach_of_same_fid_fails() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;
    let r = c
        .rpc(
            1,
            &Fcall::Tattach {
                fid: 0,
                afid: NOFID,
                uname: "mark".to_string(),
                aname: "/".to_string(),
            },
        )
        .await;
    assert_eq!(ename(r), "fid already in use on this connection");
    ts.stop().await;
}

#[tokio::test]
async fn create_then_walk_back_from_fresh_attach() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;

    let r = c
        .rpc(
            1,
            &Fcall::Tcreate {
                fid: 0,
                name: "hello".to_string(),
                perm: 0o644,
                mode: om::WRITE,
            },
        )
        .await;
    let created = match r {
        Fcall::Rcreate { qid, .. } => qid,
        other => panic!("expected Rcreate, got {}", other),
    };

    let r = c
        .rpc(
            2,
            &Fcall::Tattach {
                fid: 1,
                afid: NOFID,
                uname: "mark".to_string(),
                aname: "/".to_string(),
            },
        )
        .await;
    assert!(matches!(r, Fcall::Rattach { .. }));

    let r = c
        .rpc(
            3,
            &Fcall::Twalk { fid: 1, newfid: 2, wnames: vec!["hello".to_string()] },
        )
        .await;
    assert_eq!(r, Fcall::Rwalk { wqids: vec![created] });

    // The sidecar records the attach uid and the parent's group.
    let sidecar = std::fs::read_to_string(ts.root().join("hello.vufs")).unwrap();
    assert_eq!(sidecar, "mark:adm\n");

    ts.stop().await;
}

#[tokio::test]
async fn walk_into_forbidden_directory_is_denied() {
    let ts = TestServer::start(Some("1:adm:\n2:alice:\n3:bob:\n")).await;

    let mut alice = ts.connect().await;
    alice.handshake("alice", 0).await;
    let r = alice
        .rpc(
            1,
            &Fcall::Tcreate {
                fid: 0,
                name: "private".to_string(),
                perm: dm::DIR | 0o700,
                mode: om::READ,
            },
        )
        .await;
    assert!(matches!(r, Fcall::Rcreate { .. }));

    let mut bob = ts.connect().await;
    bob.handshake("bob", 0).await;
    let r = bob
        .rpc(
            2,
            &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec!["private".to_string()] },
        )
        .await;
    assert_eq!(ename(r), "permission denied");

    ts.stop().await;
}

#[tokio::test]
async fn create_rejects_dot_and_dotdot() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;
    let r = c
        .rpc(
            1,
            &Fcall::Tcreate {
                fid: 0,
                name: "..".to_string(),
                perm: 0o644,
                mode: om::WRITE,
            },
        )
        .await;
    assert_eq!(ename(r), ".. invalid name");
    ts.stop().await;
}

#[tokio::test]
async fn write_clunk_walk_open_read_roundtrip() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;

    c.rpc(
        1,
        &Fcall::Tcreate {
            fid: 0,
            name: "notes".to_string(),
            perm: 0o644,
            mode: om::WRITE,
        },
    )
    .await;
    let r = c
        .rpc(2, &Fcall::Twrite { fid: 0, offset: 0, data: b"hello via 9p".to_vec() })
        .await;
    assert_eq!(r, Fcall::Rwrite { count: 12 });
    assert_eq!(c.rpc(3, &Fcall::Tclunk { fid: 0 }).await, Fcall::Rclunk);

    c.rpc(
        4,
        &Fcall::Tattach {
            fid: 0,
            afid: NOFID,
            uname: "mark".to_string(),
            aname: "/".to_string(),
        },
    )
    .await;
    c.rpc(5, &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec!["notes".to_string()] })
        .await;
    let r = c.rpc(6, &Fcall::Topen { fid: 1, mode: om::READ }).await;
    assert!(matches!(r, Fcall::Ropen { .. }));
    let r = c.rpc(7, &Fcall::Tread { fid: 1, offset: 0, count: 4096 }).await;
    assert_eq!(r, Fcall::Rread { data: b"hello via 9p".to_vec() });

    // A stat through the same fid sees the new length and modifier.
    let r = c.rpc(8, &Fcall::Tstat { fid: 1 }).await;
    match r {
        Fcall::Rstat { stat } => {
            assert_eq!(stat.name, "notes");
            assert_eq!(stat.length, 12);
            assert_eq!(stat.uid, "mark");
            assert_eq!(stat.muid, "mark");
        }
        other => panic!("expected Rstat, got {}", other),
    }

    ts.stop().await;
}

#[tokio::test]
async fn remove_deletes_backing_file_and_sidecar() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;

    c.rpc(
        1,
        &Fcall::Tcreate {
            fid: 0,
            name: "doomed".to_string(),
            perm: 0o644,
            mode: om::WRITE,
        },
    )
    .await;
    assert!(ts.root().join("doomed").exists());
    assert_eq!(c.rpc(2, &Fcall::Tremove { fid: 0 }).await, Fcall::Rremove);
    assert!(!ts.root().join("doomed").exists());
    assert!(!ts.root().join("doomed.vufs").exists());

    // The fid was consumed by the remove.
    let r = c.rpc(3, &Fcall::Tclunk { fid: 0 }).await;
    assert_eq!(ename(r), "fid not found");

    ts.stop().await;
}

#[tokio::test]
async fn wstat_renames_over_the_wire() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;
    c.rpc(
        1,
        &Fcall::Tcreate {
            fid: 0,
            name: "before".to_string(),
            perm: 0o644,
            mode: om::WRITE,
        },
    )
    .await;

    let mut w = Stat::unset();
    w.name = "after".to_string();
    assert_eq!(c.rpc(2, &Fcall::Twstat { fid: 0, stat: w }).await, Fcall::Rwstat);
    assert!(ts.root().join("after").exists());
    assert!(!ts.root().join("before").exists());

    ts.stop().await;
}

#[tokio::test]
async fn second_version_invalidates_existing_fids() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;
    let r = c.rpc(1, &Fcall::Tstat { fid: 0 }).await;
    assert!(matches!(r, Fcall::Rstat { .. }));

    let r = c
        .rpc(2, &Fcall::Tversion { msize: 8192, version: "9P2000".to_string() })
        .await;
    assert!(matches!(r, Fcall::Rversion { .. }));

    let r = c.rpc(3, &Fcall::Tstat { fid: 0 }).await;
    assert_eq!(ename(r), "fid not found");

    ts.stop().await;
}

#[tokio::test]
async fn pipelined_requests_each_get_exactly_one_reply() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;

    // Fire a burst without reading: stats, a version reset, and a stat that
    // lands in the new session. Every tag must come back exactly once, as
    // either its normal reply or the session-reset error.
    let burst: Vec<(u16, Fcall)> = vec![
        (10, Fcall::Tstat { fid: 0 }),
        (11, Fcall::Tstat { fid: 0 }),
        (12, Fcall::Tversion { msize: 8192, version: "9P2000".to_string() }),
        (13, Fcall::Tstat { fid: 0 }),
    ];
    let mut wire = Vec::new();
    let mut one = Vec::new();
    for (tag, fc) in &burst {
        fcall::encode(*tag, fc, &mut one);
        wire.extend_from_slice(&one);
    }
    c.stream.write_all(&wire).await.unwrap();

    let mut seen = std::collections::HashMap::new();
    for _ in 0..burst.len() {
        let (tag, reply) = c.recv().await;
        assert!(seen.insert(tag, reply).is_none(), "duplicate reply for tag {}", tag);
    }
    assert_eq!(seen.len(), burst.len());
    assert!(matches!(seen[&12], Fcall::Rversion { .. }));
    // Tag 13 ran after the reset one way or the other: dropped with the
    // reset error, or handled in the new session where fid 0 is gone.
    match &seen[&13] {
        Fcall::Rerror { ename } => assert!(
            ename == "new session started, dropping this request" || ename == "fid not found",
            "unexpected ename {:?}",
            ename
        ),
        other => panic!("expected Rerror for tag 13, got {}", other),
    }

    ts.stop().await;
}

#[tokio::test]
async fn flush_of_a_finished_request_is_acknowledged() {
    let ts = TestServer::start(None).await;
    let mut c = ts.connect().await;
    c.handshake("mark", 0).await;
    let r = c.rpc(7, &Fcall::Tstat { fid: 0 }).await;
    assert!(matches!(r, Fcall::Rstat { .. }));
    // Tag 7 already completed, so the flush simply acknowledges.
    assert_eq!(c.rpc(8, &Fcall::Tflush { oldtag: 7 }).await, Fcall::Rflush);
    ts.stop().await;
}

#[tokio::test]
async fn tree_is_shared_across_connections() {
    let ts = TestServer::start(None).await;

    let mut a = ts.connect().await;
    a.handshake("mark", 0).await;
    a.rpc(
        1,
        &Fcall::Tcreate {
            fid: 0,
            name: "shared".to_string(),
            perm: 0o644,
            mode: om::WRITE,
        },
    )
    .await;

    let mut b = ts.connect().await;
    b.handshake("mark", 0).await;
    let r = b
        .rpc(2, &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec!["shared".to_string()] })
        .await;
    match r {
        Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
        other => panic!("expected Rwalk, got {}", other),
    }

    ts.stop().await;
}

#[tokio::test]
async fn serves_over_unix_sockets_too() {
    use tokio::net::UnixStream;

    let dir = TempDir::new().unwrap();
    let sock = dir.path().join("vufs.sock");
    let root = dir.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let config =
        Config::new(root, Network::Unix, sock.to_string_lossy(), "adm").unwrap();
    let server = Server::start(config).await.unwrap();

    let mut stream = UnixStream::connect(&sock).await.unwrap();
    let mut buf = Vec::new();
    fcall::encode(
        u16::MAX,
        &Fcall::Tversion { msize: 8192, version: "9P2000".to_string() },
        &mut buf,
    );
    stream.write_all(&buf).await.unwrap();
    let frame = read_frame(&mut stream, MAX_MSIZE).await.unwrap().unwrap();
    let (_, reply) = fcall::decode(&frame).unwrap();
    assert_eq!(reply, Fcall::Rversion { msize: 8192, version: "9P2000".to_string() });

    server.stop().await;
    assert!(!sock.exists());
}

#[tokio::test]
async fn existing_files_and_sidecars_are_served() {
    let ts = {
        // Pre-populate the backing store before the server walks it.
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("preexisting"), "host data").unwrap();
        std::fs::write(dir.path().join("preexisting.vufs"), "alice:adm\n").unwrap();
        std::fs::create_dir_all(dir.path().join("adm")).unwrap();
        std::fs::write(dir.path().join("adm/users"), "1:adm:\n2:alice:\n").unwrap();
        let config =
            Config::new(dir.path().to_path_buf(), Network::Tcp, "127.0.0.1:0", "adm").unwrap();
        let server = Server::start(config).await.unwrap();
        let addr = server.local_addr().to_string();
        TestServer { _dir: dir, server: Some(server), addr }
    };

    let mut c = ts.connect().await;
    c.handshake("alice", 0).await;
    c.rpc(
        1,
        &Fcall::Twalk { fid: 0, newfid: 1, wnames: vec!["preexisting".to_string()] },
    )
    .await;
    let r = c.rpc(2, &Fcall::Tstat { fid: 1 }).await;
    match r {
        Fcall::Rstat { stat } => {
            assert_eq!(stat.uid, "alice");
            assert_eq!(stat.gid, "adm");
            assert_eq!(stat.length, 9);
        }
        other => panic!("expected Rstat, got {}", other),
    }

    // The sidecar itself is invisible to clients.
    let r = c
        .rpc(
            3,
            &Fcall::Twalk {
                fid: 0,
                newfid: 2,
                wnames: vec!["preexisting.vufs".to_string()],
            },
        )
        .await;
    assert_eq!(ename(r), "'preexisting.vufs' not found");

    ts.stop().await;
}
