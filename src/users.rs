//! Virtual user/group store and the permission check built on it.
//!
//! Identities live in `adm/users` under the served root, one record per
//! line: `id:name:group1,group2,...`. A group is just a user that appears in
//! somebody's group list; membership is kept in both directions. The store
//! is loaded once at startup and never reloaded.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use anyhow::{anyhow, Result};

use crate::fcall::Stat;

/// Users table location, relative to the served root.
pub const USERS_FILE: &str = "adm/users";

/// Seed written when no users table exists yet.
const INITIAL_USERS: &str = "1:adm:\n2:mark:\n";

/// Characters that may not appear in a user name.
const BAD_NAME_CHARS: [char; 6] = ['?', '=', '+', '–', '/', ':'];

/// One virtual identity. A user with members is a group.
#[derive(Debug)]
pub struct VirtUser {
    /// Immutable integer id, the on-disk representation of this user.
    pub id: u32,
    /// Protocol-visible name; file ownership is stored by name.
    pub name: String,
    /// Indices of the groups this user belongs to.
    groups: Vec<usize>,
    /// Indices of the users in this group.
    members: Vec<usize>,
}

/// The interned user table. Queries only; mutation ends at load time.
#[derive(Debug)]
pub struct UserDb {
    users: Vec<VirtUser>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
}

/// Read the users table, seeding a fresh one if it does not exist.
fn read_or_seed(userfile: &Path) -> Result<String> {
    if let Some(dir) = userfile.parent() {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(userfile)
    {
        Ok(mut fp) => {
            fp.write_all(INITIAL_USERS.as_bytes())?;
            Ok(INITIAL_USERS.to_string())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok(fs::read_to_string(userfile)?)
        }
        Err(err) => Err(err.into()),
    }
}

impl UserDb {
    /// Load the table from `<root>/adm/users`.
    pub fn load(root: &Path) -> Result<UserDb> {
        let userfile = root.join(USERS_FILE);
        let data = read_or_seed(&userfile)?;
        UserDb::parse(&data).map_err(|e| anyhow!("{}: {}", userfile.display(), e))
    }

    /// Parse the table text. Two passes: intern every user, then resolve
    /// group lists against the interned set.
    pub fn parse(data: &str) -> Result<UserDb> {
        let mut users = Vec::new();
        let mut by_name = HashMap::new();

        for (lineno, line) in data.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.split(':').collect();
            if columns.len() != 3 {
                return Err(anyhow!(
                    "got {} columns (expected 3) on line {}",
                    columns.len(),
                    lineno + 1
                ));
            }
            let id: u32 = columns[0]
                .parse()
                .map_err(|_| anyhow!("can't parse id on line {}", lineno + 1))?;
            let name = columns[1];
            if name.is_empty() {
                return Err(anyhow!("empty user name on line {}", lineno + 1));
            }
            if name.contains(&BAD_NAME_CHARS[..]) {
                return Err(anyhow!("bad character in user name '{}' on line {}", name, lineno + 1));
            }
            let idx = users.len();
            users.push(VirtUser { id, name: name.to_string(), groups: Vec::new(), members: Vec::new() });
            by_name.insert(name.to_string(), idx);
        }

        for line in data.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.split(':').collect();
            let uidx = by_name[columns[1]];
            for gname in columns[2].split(',') {
                if gname.is_empty() {
                    continue;
                }
                let gidx = *by_name
                    .get(gname)
                    .ok_or_else(|| anyhow!("group '{}' is not a user", gname))?;
                users[uidx].groups.push(gidx);
                users[gidx].members.push(uidx);
            }
        }

        let by_id = users.iter().enumerate().map(|(i, u)| (u.id, i)).collect();
        Ok(UserDb { users, by_name, by_id })
    }

    pub fn by_name(&self, name: &str) -> Option<&VirtUser> {
        self.by_name.get(name).map(|&i| &self.users[i])
    }

    pub fn by_id(&self, id: u32) -> Option<&VirtUser> {
        self.by_id.get(&id).map(|&i| &self.users[i])
    }

    /// Is `uname` a member of the group `gname`?
    pub fn is_member(&self, uname: &str, gname: &str) -> bool {
        let (Some(&uidx), Some(&gidx)) = (self.by_name.get(uname), self.by_name.get(gname))
        else {
            return false;
        };
        self.users[uidx].groups.contains(&gidx)
    }

    /// Is `uname` a leader of the group `gname`?
    ///
    /// The table has no leader column, so every member leads (Plan 9's rule
    /// for leaderless groups).
    pub fn is_leader(&self, uname: &str, gname: &str) -> bool {
        self.is_member(uname, gname)
    }

    /// The 9P permission gate. `want` is a combination of the low three
    /// mode bits (r=4 w=2 x=1).
    ///
    /// The effective mask starts from the node's other-bits, adds the
    /// owner-bits when `uid` owns the node, and the group-bits when `uid`
    /// is in the node's group. Anonymous (empty) uids are always denied.
    pub fn check_perm(&self, st: &Stat, uid: &str, want: u32) -> bool {
        if uid.is_empty() {
            return false;
        }
        let want = want & 7;

        let mut mask = st.mode & 7;
        if st.uid == uid {
            mask |= (st.mode >> 6) & 7;
        }
        if self.is_member(uid, &st.gid) {
            mask |= (st.mode >> 3) & 7;
        }
        mask & want == want
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::dm;
    use tempfile::tempdir;

    fn db() -> UserDb {
        UserDb::parse("1:adm:\n2:mark:staff\n3:staff:\n4:nobody:\n").unwrap()
    }

    fn stat(uid: &str, gid: &str, mode: u32) -> Stat {
        Stat { uid: uid.into(), gid: gid.into(), mode, ..Stat::default() }
    }

    #[test]
    fn load_seeds_missing_users_file() {
        let dir = tempdir().unwrap();
        let users = UserDb::load(dir.path()).unwrap();
        assert_eq!(users.by_name("adm").unwrap().id, 1);
        assert_eq!(users.by_name("mark").unwrap().id, 2);
        // The seed landed on disk and a second load reads it back.
        let on_disk = std::fs::read_to_string(dir.path().join(USERS_FILE)).unwrap();
        assert_eq!(on_disk, "1:adm:\n2:mark:\n");
        assert!(UserDb::load(dir.path()).is_ok());
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let users = UserDb::parse("# staff\n\n1:adm:\n\n2:mark:\n").unwrap();
        assert!(users.by_name("adm").is_some());
        assert!(users.by_name("mark").is_some());
        assert!(users.by_name("# staff").is_none());
    }

    #[test]
    fn parse_resolves_membership_both_ways() {
        let users = db();
        assert!(users.is_member("mark", "staff"));
        assert!(!users.is_member("adm", "staff"));
        assert!(!users.is_member("staff", "mark"));
        assert_eq!(users.by_id(3).unwrap().name, "staff");
    }

    #[test]
    fn parse_rejects_unknown_group() {
        let err = UserDb::parse("1:mark:wheel\n").unwrap_err();
        assert!(err.to_string().contains("'wheel' is not a user"));
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(UserDb::parse("1:adm\n").is_err());
        assert!(UserDb::parse("x:adm:\n").is_err());
        assert!(UserDb::parse("1:bad/name:\n").is_err());
    }

    #[test]
    fn owner_bits_apply_to_owner_only() {
        let users = db();
        let st = stat("mark", "adm", 0o700);
        assert!(users.check_perm(&st, "mark", dm::READ | dm::WRITE | dm::EXEC));
        assert!(!users.check_perm(&st, "nobody", dm::READ));
    }

    #[test]
    fn group_bits_apply_to_members() {
        let users = db();
        let st = stat("adm", "staff", 0o750);
        assert!(users.check_perm(&st, "mark", dm::READ | dm::EXEC));
        assert!(!users.check_perm(&st, "mark", dm::WRITE));
        assert!(!users.check_perm(&st, "nobody", dm::READ));
    }

    #[test]
    fn other_bits_apply_to_everyone() {
        let users = db();
        let st = stat("adm", "adm", 0o704);
        assert!(users.check_perm(&st, "nobody", dm::READ));
        assert!(!users.check_perm(&st, "nobody", dm::WRITE));
    }

    #[test]
    fn anonymous_uid_always_denied() {
        let users = db();
        let st = stat("adm", "adm", 0o777);
        assert!(!users.check_perm(&st, "", dm::READ));
    }

    #[test]
    fn grant_is_monotone_in_want() {
        // Granting rw implies granting each of r and w alone.
        let users = db();
        let st = stat("mark", "staff", 0o600);
        assert!(users.check_perm(&st, "mark", dm::READ | dm::WRITE));
        assert!(users.check_perm(&st, "mark", dm::READ));
        assert!(users.check_perm(&st, "mark", dm::WRITE));
    }
}
