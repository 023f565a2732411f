//! The T-message handlers.
//!
//! Each handler validates against the session and tree, touches the backing
//! store where needed, and returns the R-message or a [`VufsError`] that the
//! dispatcher turns into an `Rerror`. All handlers run on the single
//! dispatcher task, so they may freely mutate the tree and fid tables.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::{Result, VufsError};
use crate::fcall::{dm, om, Fcall, Qid, QidType, Stat, IOHDRSZ, MAXWELEM, MAX_MSIZE, MIN_MSIZE, NOFID, VERSION9P};
use crate::fid::Fid;
use crate::server::VuFs;
use crate::conn::{Session, SessionState};
use crate::tree::{sidecar_path, NodeId, SIDECAR_SUFFIX};

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// The permission bits an open mode asks for.
fn open_perm(mode: u8) -> u32 {
    match mode & 3 {
        om::READ => dm::READ,
        om::WRITE => dm::WRITE,
        om::RDWR => dm::READ | dm::WRITE,
        _ => dm::EXEC, // om::EXEC
    }
}

fn readable(mode: u8) -> bool {
    matches!(mode & 3, om::READ | om::RDWR | om::EXEC)
}

fn writable(mode: u8) -> bool {
    matches!(mode & 3, om::WRITE | om::RDWR)
}

/// Names a client may not create or rename to. Sidecar names are reserved so
/// ownership records can't be spoofed through the protocol.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0')
        && !name.ends_with(SIDECAR_SUFFIX)
}

/// Write (or rewrite) the ownership sidecar for a backing file.
async fn write_ownership(path: &Path, uid: &str, gid: &str) -> io::Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut fp = opts.open(sidecar_path(path)).await?;
    fp.write_all(format!("{}:{}\n", uid, gid).as_bytes()).await?;
    fp.flush().await?;
    Ok(())
}

impl VuFs {
    fn node_qid(&self, id: NodeId) -> Qid {
        self.tree.node(id).stat.qid
    }

    fn check(&self, id: NodeId, uid: &str, want: u32) -> Result<()> {
        if self.users.check_perm(&self.tree.node(id).stat, uid, want) {
            Ok(())
        } else {
            Err(VufsError::PermissionDenied)
        }
    }

    /// Version negotiation. Queue surgery for the reset happens in the
    /// dispatcher; this handler only settles msize and the protocol string.
    pub fn rversion(&mut self, sess: &mut Session, msize: u32, version: &str) -> Result<Fcall> {
        // "9P2000.L" negotiates down to "9P2000"; anything else is unknown.
        let base = version.split('.').next().unwrap_or_default();
        let msize = msize.min(MAX_MSIZE);
        if base != VERSION9P {
            return Ok(Fcall::Rversion { msize, version: "unknown".to_string() });
        }
        if msize < MIN_MSIZE {
            return Err(VufsError::MsizeOutOfRange);
        }
        sess.reset(msize);
        Ok(Fcall::Rversion { msize, version: VERSION9P.to_string() })
    }

    pub fn rauth(&mut self) -> Result<Fcall> {
        Err(VufsError::AuthNotSupported)
    }

    pub fn rattach(
        &mut self,
        sess: &mut Session,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
    ) -> Result<Fcall> {
        if aname != "/" {
            return Err(VufsError::AttachNotRoot);
        }
        if afid != NOFID {
            return Err(VufsError::AuthNotSupported);
        }
        let root = self.tree.root();
        sess.fids.insert(fid, Fid::new(root, uname))?;
        sess.state = SessionState::Attached;
        Ok(Fcall::Rattach { qid: self.node_qid(root) })
    }

    pub fn rwalk(
        &mut self,
        sess: &mut Session,
        fid: u32,
        newfid: u32,
        wnames: &[String],
    ) -> Result<Fcall> {
        let f = sess.fids.lookup(fid)?;
        if f.open {
            return Err(VufsError::AlreadyOpen);
        }
        if wnames.len() > MAXWELEM {
            return Err(VufsError::TooManyNames);
        }
        let (start, uid) = (f.node, f.uid.clone());
        if !wnames.is_empty() && !self.tree.node(start).is_dir() {
            return Err(VufsError::NotADirectory(self.tree.node(start).stat.name.clone()));
        }
        if newfid != fid && sess.fids.contains(newfid) {
            return Err(VufsError::FidInUse);
        }

        let mut cur = start;
        let mut wqids = Vec::with_capacity(wnames.len());
        for (i, name) in wnames.iter().enumerate() {
            if name == ".." {
                // The root is its own parent, so ".." there is a self-step.
                cur = self.tree.node(cur).parent;
            } else {
                let next = match self.tree.child(cur, name) {
                    Some(n) => n,
                    None if i == 0 => return Err(VufsError::NotFound(name.clone())),
                    // Partial walk: report how far we got, leave newfid unbound.
                    None => return Ok(Fcall::Rwalk { wqids }),
                };
                if self.tree.node(next).is_dir() {
                    if let Err(e) = self.check(next, &uid, dm::EXEC) {
                        if i == 0 {
                            return Err(e);
                        }
                        return Ok(Fcall::Rwalk { wqids });
                    }
                }
                cur = next;
            }
            wqids.push(self.node_qid(cur));
        }

        if newfid == fid {
            let f = sess.fids.lookup_mut(fid)?;
            f.node = cur;
        } else {
            sess.fids.insert(newfid, Fid::new(cur, uid))?;
        }
        Ok(Fcall::Rwalk { wqids })
    }

    pub async fn ropen(&mut self, sess: &mut Session, fid: u32, mode: u8) -> Result<Fcall> {
        let f = sess.fids.lookup(fid)?;
        if f.open {
            return Err(VufsError::AlreadyOpen);
        }
        let (node, uid) = (f.node, f.uid.clone());
        if self.tree.node(node).dead {
            return Err(VufsError::NotFound(self.tree.node(node).stat.name.clone()));
        }

        let is_dir = self.tree.node(node).is_dir();
        if is_dir && (mode & 3 != om::READ || mode & (om::TRUNC | om::RCLOSE) != 0) {
            return Err(VufsError::IsADirectory(self.tree.node(node).stat.name.clone()));
        }
        self.check(node, &uid, open_perm(mode))?;
        if mode & om::TRUNC != 0 {
            self.check(node, &uid, dm::WRITE)?;
        }
        if mode & om::RCLOSE != 0 {
            let parent = self.tree.node(node).parent;
            self.check(parent, &uid, dm::WRITE)?;
        }

        // Truncation is ignored for append-only files.
        if mode & om::TRUNC != 0 && self.tree.node(node).stat.mode & dm::APPEND == 0 {
            let path = self.tree.host_path(&self.config.root, node);
            fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&path)
                .await
                .map_err(|e| VufsError::backing(self.tree.fs_path(node), e))?;
            let n = self.tree.node_mut(node);
            n.stat.length = 0;
            n.stat.mtime = now_secs();
            n.stat.muid = uid.clone();
            n.touch();
        }

        let iounit = sess.msize - IOHDRSZ;
        let f = sess.fids.lookup_mut(fid)?;
        f.open = true;
        f.open_mode = mode;
        f.dir_offset = 0;
        f.dir_index = 0;
        Ok(Fcall::Ropen { qid: self.node_qid(node), iounit })
    }

    pub async fn rcreate(
        &mut self,
        sess: &mut Session,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<Fcall> {
        let f = sess.fids.lookup(fid)?;
        if f.open {
            return Err(VufsError::AlreadyOpen);
        }
        let (parent, uid) = (f.node, f.uid.clone());
        if !self.tree.node(parent).is_dir() {
            return Err(VufsError::NotADirectory(self.tree.node(parent).stat.name.clone()));
        }
        if self.tree.node(parent).dead {
            return Err(VufsError::NotFound(self.tree.node(parent).stat.name.clone()));
        }
        if !valid_name(name) {
            return Err(VufsError::InvalidName(name.to_string()));
        }
        self.check(parent, &uid, dm::WRITE)?;
        if self.tree.child(parent, name).is_some() {
            return Err(VufsError::AlreadyExists);
        }
        let is_dir = perm & dm::DIR != 0;
        if is_dir && mode & 3 != om::READ {
            return Err(VufsError::DirCreateMode);
        }

        let gid = self.tree.node(parent).stat.gid.clone();
        let host_path = self.tree.host_path(&self.config.root, parent).join(name);
        let fs_path = format!("{}/{}", self.tree.fs_path(parent).trim_end_matches('/'), name);

        if is_dir {
            fs::create_dir(&host_path)
                .await
                .map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&host_path, std::fs::Permissions::from_mode(perm & 0o777))
                    .await
                    .map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
            }
        } else {
            // The handle is dropped right away; reads and writes reopen the
            // backing file per request. Write access is needed for CREATE.
            let mut opts = fs::OpenOptions::new();
            if perm & dm::APPEND != 0 {
                opts.append(true);
            } else {
                opts.write(true);
                opts.truncate(mode & om::TRUNC != 0);
            }
            if perm & dm::EXCL != 0 {
                opts.create_new(true);
            } else {
                opts.create(true);
            }
            #[cfg(unix)]
            opts.mode(perm & 0o777);
            opts.open(&host_path).await.map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        }

        // The new file is owned by the attaching user; the group follows the
        // parent directory.
        if let Err(e) = write_ownership(&host_path, &uid, &gid).await {
            return Err(self.unwind_create(&host_path, is_dir, &fs_path, e).await);
        }
        let meta = match fs::metadata(&host_path).await {
            Ok(m) => m,
            Err(e) => return Err(self.unwind_create(&host_path, is_dir, &fs_path, e).await),
        };

        use std::os::unix::fs::MetadataExt;
        let now = now_secs();
        let stat = Stat {
            qid: Qid {
                typ: QidType::from_bits_retain((perm >> 24) as u8),
                version: 0,
                path: meta.ino(),
            },
            mode: perm,
            atime: now,
            mtime: now,
            length: 0,
            name: name.to_string(),
            uid: uid.clone(),
            gid,
            muid: uid.clone(),
            ..Stat::default()
        };
        let qid = stat.qid;
        let node = self.tree.attach(parent, stat);

        // The fid turns into an open handle on the created file.
        sess.fids.remove(fid);
        let mut newf = Fid::new(node, uid);
        newf.open = true;
        newf.open_mode = mode;
        sess.fids.insert(fid, newf)?;
        Ok(Fcall::Rcreate { qid, iounit: sess.msize - IOHDRSZ })
    }

    /// Roll a half-made create back off the disk. If even the unlink fails
    /// the client is told the file stayed behind.
    async fn unwind_create(
        &self,
        host_path: &Path,
        is_dir: bool,
        fs_path: &str,
        err: io::Error,
    ) -> VufsError {
        let _ = fs::remove_file(sidecar_path(host_path)).await;
        let removed = if is_dir {
            fs::remove_dir(host_path).await
        } else {
            fs::remove_file(host_path).await
        };
        VufsError::Backing { path: fs_path.to_string(), err, left_on_disk: removed.is_err() }
    }

    pub async fn rread(
        &mut self,
        sess: &mut Session,
        fid: u32,
        offset: u64,
        count: u32,
    ) -> Result<Fcall> {
        let f = sess.fids.lookup(fid)?;
        if !f.open || !readable(f.open_mode) {
            return Err(VufsError::NotOpenForRead);
        }
        let (node, dir_offset, dir_index) = (f.node, f.dir_offset, f.dir_index);
        if self.tree.node(node).dead {
            return Err(VufsError::NotFound(self.tree.node(node).stat.name.clone()));
        }
        let count = count.min(sess.msize - IOHDRSZ) as usize;

        if self.tree.node(node).is_dir() {
            // Directory reads return whole stat records and must start at
            // zero or continue where the last read stopped.
            let start = if offset == 0 {
                0
            } else if offset == dir_offset {
                dir_index
            } else {
                return Err(VufsError::BadDirOffset);
            };
            let mut data = Vec::new();
            let mut taken = 0;
            for child in self.tree.children_sorted(node).into_iter().skip(start) {
                let blob = self.tree.node(child).stat.to_bytes();
                if data.len() + blob.len() > count {
                    break;
                }
                data.extend_from_slice(&blob);
                taken += 1;
            }
            let f = sess.fids.lookup_mut(fid)?;
            f.dir_offset = offset + data.len() as u64;
            f.dir_index = start + taken;
            return Ok(Fcall::Rread { data });
        }

        let path = self.tree.host_path(&self.config.root, node);
        let fs_path = self.tree.fs_path(node);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        let mut data = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            let n = file
                .read(&mut data[filled..])
                .await
                .map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
            if n == 0 {
                break; // reads past end-of-file return zero bytes
            }
            filled += n;
        }
        data.truncate(filled);
        Ok(Fcall::Rread { data })
    }

    pub async fn rwrite(
        &mut self,
        sess: &mut Session,
        fid: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<Fcall> {
        let f = sess.fids.lookup(fid)?;
        if !f.open || !writable(f.open_mode) {
            return Err(VufsError::NotOpenForWrite);
        }
        let node = f.node;
        let uid = f.uid.clone();
        if self.tree.node(node).is_dir() {
            return Err(VufsError::IsADirectory(self.tree.node(node).stat.name.clone()));
        }
        if self.tree.node(node).dead {
            return Err(VufsError::NotFound(self.tree.node(node).stat.name.clone()));
        }

        let path = self.tree.host_path(&self.config.root, node);
        let fs_path = self.tree.fs_path(node);
        let append_only = self.tree.node(node).stat.mode & dm::APPEND != 0;

        let mut opts = fs::OpenOptions::new();
        opts.write(true);
        if append_only {
            // Append-only files ignore the requested offset.
            opts.append(true);
        }
        let mut file = opts.open(&path).await.map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        if !append_only {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        }
        file.write_all(data).await.map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        file.flush().await.map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| VufsError::backing(fs_path.as_str(), e))?
            .len();

        let n = self.tree.node_mut(node);
        n.stat.length = len;
        n.stat.mtime = now_secs();
        n.stat.muid = uid;
        n.touch();
        Ok(Fcall::Rwrite { count: data.len() as u32 })
    }

    pub async fn rclunk(&mut self, sess: &mut Session, fid: u32) -> Result<Fcall> {
        let f = sess.fids.remove(fid).ok_or(VufsError::FidNotFound)?;
        if f.open && f.open_mode & om::RCLOSE != 0 {
            // Write permission on the parent was checked at open time.
            if let Err(e) = self.remove_backing(f.node).await {
                warn!("remove-on-close of {} failed: {}", self.tree.fs_path(f.node), e);
            }
        }
        Ok(Fcall::Rclunk)
    }

    pub async fn rremove(&mut self, sess: &mut Session, fid: u32) -> Result<Fcall> {
        // 9P consumes the fid whether or not the remove goes through.
        let f = sess.fids.remove(fid).ok_or(VufsError::FidNotFound)?;
        let node = f.node;
        if node == self.tree.root() {
            return Err(VufsError::PermissionDenied);
        }
        let parent = self.tree.node(node).parent;
        self.check(parent, &f.uid, dm::WRITE)?;
        self.remove_backing(node).await?;
        Ok(Fcall::Rremove)
    }

    /// Remove a node's backing file and sidecar, then detach it. Also used
    /// by connection teardown for fids opened remove-on-close.
    pub(crate) async fn remove_backing(&mut self, node: NodeId) -> Result<()> {
        let path = self.tree.host_path(&self.config.root, node);
        let fs_path = self.tree.fs_path(node);
        let res = if self.tree.node(node).is_dir() {
            fs::remove_dir(&path).await
        } else {
            fs::remove_file(&path).await
        };
        res.map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
        let _ = fs::remove_file(sidecar_path(&path)).await;
        self.tree.detach(node);
        Ok(())
    }

    /// Stat is universally readable; no permission check.
    pub fn rstat(&mut self, sess: &mut Session, fid: u32) -> Result<Fcall> {
        let f = sess.fids.lookup(fid)?;
        Ok(Fcall::Rstat { stat: self.tree.node(f.node).stat.clone() })
    }

    pub async fn rwstat(&mut self, sess: &mut Session, fid: u32, w: &Stat) -> Result<Fcall> {
        let f = sess.fids.lookup(fid)?;
        let (node, uid) = (f.node, f.uid.clone());
        let st = &self.tree.node(node).stat;
        let parent = self.tree.node(node).parent;

        let set_name = !w.name.is_empty() && w.name != st.name;
        let set_mode = w.mode != !0;
        let set_mtime = w.mtime != !0;
        let set_length = w.length != !0;
        let set_gid = !w.gid.is_empty() && w.gid != st.gid;
        let set_uid = !w.uid.is_empty() && w.uid != st.uid;
        let set_muid = !w.muid.is_empty() && w.muid != st.muid;
        let is_dir = st.qid.typ.contains(QidType::DIR);
        let owner = st.uid == uid;
        let leader = self.users.is_leader(&uid, &st.gid);
        let old_gid = st.gid.clone();

        // Validate everything before touching anything; the operation is
        // all-or-nothing.
        if set_uid {
            return Err(VufsError::OwnerChange);
        }
        if set_muid {
            return Err(VufsError::MuidChange);
        }
        if set_name {
            if node == self.tree.root() {
                return Err(VufsError::PermissionDenied);
            }
            if !valid_name(&w.name) {
                return Err(VufsError::InvalidName(w.name.clone()));
            }
            self.check(parent, &uid, dm::WRITE)?;
            if self.tree.child(parent, &w.name).is_some() {
                return Err(VufsError::AlreadyExists);
            }
        }
        if set_mode {
            if !owner && !leader {
                return Err(VufsError::PermissionDenied);
            }
            if (w.mode ^ self.tree.node(node).stat.mode) & dm::DIR != 0 {
                return Err(VufsError::DirBitChange);
            }
        }
        if set_mtime && !owner && !leader {
            return Err(VufsError::PermissionDenied);
        }
        if set_length {
            if is_dir {
                return Err(VufsError::DirLength);
            }
            self.check(node, &uid, dm::WRITE)?;
        }
        if set_gid {
            let allowed = (owner && self.users.is_member(&uid, &w.gid))
                || (self.users.is_leader(&uid, &old_gid) && self.users.is_leader(&uid, &w.gid));
            if !allowed {
                return Err(VufsError::PermissionDenied);
            }
        }

        // Apply, backing store first. The rename is undone if a later host
        // operation fails, so a failed wstat leaves the old state behind.
        let old_path = self.tree.host_path(&self.config.root, node);
        let fs_path = self.tree.fs_path(node);
        let mut cur_path = old_path.clone();

        if set_name {
            let new_path = old_path.with_file_name(&w.name);
            fs::rename(&old_path, &new_path)
                .await
                .map_err(|e| VufsError::backing(fs_path.as_str(), e))?;
            let old_sidecar = sidecar_path(&old_path);
            if fs::metadata(&old_sidecar).await.is_ok() {
                if let Err(e) = fs::rename(&old_sidecar, sidecar_path(&new_path)).await {
                    let _ = fs::rename(&new_path, &old_path).await;
                    return Err(VufsError::backing(fs_path.as_str(), e));
                }
            }
            cur_path = new_path;
        }
        if set_length {
            let res = async {
                let file = fs::OpenOptions::new().write(true).open(&cur_path).await?;
                file.set_len(w.length).await
            }
            .await;
            if let Err(e) = res {
                self.undo_rename(set_name, &cur_path, &old_path).await;
                return Err(VufsError::backing(fs_path.as_str(), e));
            }
        }
        if set_mode {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(w.mode & 0o777);
                if let Err(e) = fs::set_permissions(&cur_path, perms).await {
                    self.undo_rename(set_name, &cur_path, &old_path).await;
                    return Err(VufsError::backing(fs_path.as_str(), e));
                }
            }
        }
        if set_gid {
            let file_uid = self.tree.node(node).stat.uid.clone();
            if let Err(e) = write_ownership(&cur_path, &file_uid, &w.gid).await {
                self.undo_rename(set_name, &cur_path, &old_path).await;
                return Err(VufsError::backing(fs_path.as_str(), e));
            }
        }

        if set_name {
            self.tree.rename(node, &w.name);
        }
        let n = self.tree.node_mut(node);
        if set_mode {
            n.stat.mode = w.mode;
        }
        if set_mtime {
            n.stat.mtime = w.mtime;
        }
        if set_length {
            n.stat.length = w.length;
        }
        if set_gid {
            n.stat.gid = w.gid.clone();
        }
        if set_name || set_mode || set_mtime || set_length || set_gid {
            n.touch();
        }
        Ok(Fcall::Rwstat)
    }

    async fn undo_rename(&self, renamed: bool, new_path: &Path, old_path: &Path) {
        if renamed {
            let _ = fs::rename(new_path, old_path).await;
            let new_sidecar = sidecar_path(new_path);
            if fs::metadata(&new_sidecar).await.is_ok() {
                let _ = fs::rename(&new_sidecar, sidecar_path(old_path)).await;
            }
        }
    }
}
