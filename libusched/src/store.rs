// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The administrative configuration store.
//!
//! Every property is a file under `<base>/<category>/<property>`.
//! Each property has two files: the committed value and a dot
//! prefixed staged twin. Admin operations only ever touch staged
//! values; `commit` makes the committed set identical to the staged
//! set for a whole category, and `rollback` resets the staged set to
//! the committed one. Services read committed values only.
//!
//! Users are a category of their own: one file per user holding
//! `uid:gid:base64(salt)$base64(hash)` with a PBKDF2-SHA512 password
//! verifier.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{info, instrument, warn};

use crate::sec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Auth,
    Core,
    Exec,
    Ipc,
    Network,
    Stat,
    Users,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Auth,
        Category::Core,
        Category::Exec,
        Category::Ipc,
        Category::Network,
        Category::Stat,
        Category::Users,
    ];

    pub fn parse(tok: &str) -> Option<Category> {
        match tok.to_ascii_lowercase().as_str() {
            "auth" => Some(Category::Auth),
            "core" => Some(Category::Core),
            "exec" => Some(Category::Exec),
            "ipc" => Some(Category::Ipc),
            "network" => Some(Category::Network),
            "stat" => Some(Category::Stat),
            "users" => Some(Category::Users),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Auth => "auth",
            Category::Core => "core",
            Category::Exec => "exec",
            Category::Ipc => "ipc",
            Category::Network => "network",
            Category::Stat => "stat",
            Category::Users => "users",
        }
    }

    /// Categories that refuse to commit while a service is running.
    fn commit_guarded(&self) -> bool {
        matches!(self, Category::Core | Category::Exec | Category::Ipc | Category::Stat)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The committed and staged values of one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyView {
    pub committed: Option<String>,
    pub staged: Option<String>,
}

impl PropertyView {
    /// Render for display: the staged value, with a trailing `*`
    /// when it differs from the committed one.
    pub fn render(&self) -> String {
        let staged = self.staged.as_deref().unwrap_or("");
        if self.staged == self.committed {
            String::from(staged)
        } else {
            format!("{staged}*")
        }
    }
}

/// PID files whose presence blocks commits on guarded categories.
const SERVICE_PID_FILES: [&str; 4] =
    ["usched-daemon.pid", "usched-exec.pid", "usched-stat.pid", "usched-ipc.pid"];

pub struct Store {
    base: PathBuf,
    pid_dir: PathBuf,
}

impl Store {
    pub fn open<P: AsRef<Path>>(base: P, pid_dir: P) -> anyhow::Result<Store> {
        let base = base.as_ref().to_path_buf();
        for category in Category::ALL {
            fs::create_dir_all(base.join(category.as_str()))
                .with_context(|| format!("creating {category} dir"))?;
        }
        Ok(Store { base, pid_dir: pid_dir.as_ref().to_path_buf() })
    }

    fn committed_path(&self, category: Category, prop: &str) -> PathBuf {
        self.base.join(category.as_str()).join(prop)
    }

    fn staged_path(&self, category: Category, prop: &str) -> PathBuf {
        self.base.join(category.as_str()).join(format!(".{prop}"))
    }

    fn check_name(prop: &str) -> anyhow::Result<()> {
        if prop.is_empty()
            || prop.starts_with('.')
            || prop.contains('/')
            || prop.contains(char::is_whitespace)
        {
            return Err(anyhow!("invalid property name: '{prop}'"));
        }
        Ok(())
    }

    fn read_opt(path: &Path) -> anyhow::Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(v) => Ok(Some(String::from(v.trim_end_matches('\n')))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {path:?}")),
        }
    }

    fn write_atomic(path: &Path, value: &str) -> anyhow::Result<()> {
        let dir = path.parent().ok_or_else(|| anyhow!("property path {path:?} has no parent"))?;
        let tmp = tempfile::NamedTempFile::new_in(dir).context("creating property tmp file")?;
        fs::write(tmp.path(), value).context("writing property tmp file")?;
        tmp.persist(path).with_context(|| format!("renaming into {path:?}"))?;
        Ok(())
    }

    pub fn get(&self, category: Category, prop: &str) -> anyhow::Result<PropertyView> {
        Store::check_name(prop)?;
        Ok(PropertyView {
            committed: Store::read_opt(&self.committed_path(category, prop))?,
            staged: Store::read_opt(&self.staged_path(category, prop))?,
        })
    }

    /// Read the committed value only; this is what services use.
    pub fn committed(&self, category: Category, prop: &str) -> anyhow::Result<Option<String>> {
        Store::check_name(prop)?;
        Store::read_opt(&self.committed_path(category, prop))
    }

    /// Stage a new value for a property.
    pub fn set(&self, category: Category, prop: &str, value: &str) -> anyhow::Result<()> {
        Store::check_name(prop)?;
        Store::write_atomic(&self.staged_path(category, prop), value)
    }

    /// Stage the removal of a property.
    pub fn delete(&self, category: Category, prop: &str) -> anyhow::Result<()> {
        Store::check_name(prop)?;
        match fs::remove_file(self.staged_path(category, prop)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(anyhow!("no staged value for {category}.{prop}"))
            }
            Err(e) => Err(e).context("removing staged property"),
        }
    }

    /// Every property in a category, committed or staged, sorted.
    pub fn show(&self, category: Category) -> anyhow::Result<Vec<(String, PropertyView)>> {
        let dir = self.base.join(category.as_str());
        let mut names = Vec::new();
        for dirent in fs::read_dir(&dir).with_context(|| format!("listing {dir:?}"))? {
            let name = dirent?.file_name();
            let name = name.to_string_lossy();
            let name = name.strip_prefix('.').unwrap_or(&name);
            if !names.iter().any(|n| n == name) {
                names.push(String::from(name));
            }
        }
        names.sort();

        let mut props = Vec::with_capacity(names.len());
        for name in names {
            let view = self.get(category, &name)?;
            props.push((name, view));
        }
        Ok(props)
    }

    fn commit_blocked(&self) -> Option<PathBuf> {
        SERVICE_PID_FILES
            .iter()
            .map(|f| self.pid_dir.join(f))
            .find(|p| p.exists())
    }

    /// Promote the staged set to the committed set for a whole
    /// category.
    #[instrument(skip(self))]
    pub fn commit(&self, category: Category) -> anyhow::Result<()> {
        if category.commit_guarded() {
            if let Some(pid_file) = self.commit_blocked() {
                return Err(anyhow!(
                    "refusing to commit {category} while {pid_file:?} exists; stop the service first"
                ));
            }
        }

        for (prop, view) in self.show(category)? {
            match view.staged {
                Some(value) => {
                    Store::write_atomic(&self.committed_path(category, &prop), &value)?
                }
                None => {
                    // deleted while staged; the committed copy goes too
                    if let Err(e) = fs::remove_file(self.committed_path(category, &prop)) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(e).context("removing committed property");
                        }
                    }
                    info!("commit removed {category}.{prop}");
                }
            }
        }
        Ok(())
    }

    /// Throw away staged changes for a whole category.
    #[instrument(skip(self))]
    pub fn rollback(&self, category: Category) -> anyhow::Result<()> {
        for (prop, view) in self.show(category)? {
            match view.committed {
                Some(value) => Store::write_atomic(&self.staged_path(category, &prop), &value)?,
                None => {
                    if let Err(e) = fs::remove_file(self.staged_path(category, &prop)) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(e).context("removing staged property");
                        }
                    }
                    info!("rollback dropped staged {category}.{prop}");
                }
            }
        }
        Ok(())
    }

    /// Stage a user record, deriving the password verifier.
    pub fn user_add(
        &self,
        username: &str,
        uid: u32,
        gid: u32,
        password: &str,
    ) -> anyhow::Result<()> {
        check_username(username)?;
        let salt = sec::username_salt(username)?;
        let verifier = sec::derive_verifier(username, password)?;
        let record =
            format!("{uid}:{gid}:{}${}", BASE64.encode(salt), BASE64.encode(verifier));
        self.set(Category::Users, username, &record)
    }

    pub fn user_delete(&self, username: &str) -> anyhow::Result<()> {
        check_username(username)?;
        self.delete(Category::Users, username)
    }

    /// Look up a committed user record; this is the daemon's view.
    pub fn user_lookup(&self, username: &str) -> anyhow::Result<Option<UserRecord>> {
        check_username(username)?;
        match self.committed(Category::Users, username)? {
            Some(raw) => {
                let record = UserRecord::parse(username, &raw)
                    .with_context(|| format!("user record for '{username}' is corrupt"))?;
                Ok(Some(record))
            }
            None => {
                warn!("no such user: {}", username);
                Ok(None)
            }
        }
    }
}

fn check_username(username: &str) -> anyhow::Result<()> {
    if username.is_empty() || username.len() >= usched_protocol::USERNAME_SIZE {
        return Err(anyhow!("invalid username: '{username}'"));
    }
    // a dot prefix would address a staged file; treat it as a probe
    if username.starts_with('.') || username.contains('/') {
        return Err(anyhow!("invalid username: '{username}' (possible probe)"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub verifier: [u8; sec::VERIFIER_SIZE],
}

impl UserRecord {
    fn parse(username: &str, raw: &str) -> anyhow::Result<UserRecord> {
        let mut fields = raw.splitn(3, ':');
        let uid = fields
            .next()
            .ok_or_else(|| anyhow!("missing uid"))?
            .parse()
            .context("parsing uid")?;
        let gid = fields
            .next()
            .ok_or_else(|| anyhow!("missing gid"))?
            .parse()
            .context("parsing gid")?;
        let secret = fields.next().ok_or_else(|| anyhow!("missing password hash"))?;

        let (salt_b64, hash_b64) =
            secret.split_once('$').ok_or_else(|| anyhow!("missing salt separator"))?;
        let salt = BASE64.decode(salt_b64).context("decoding salt")?;
        let expected_salt = sec::username_salt(username)?;
        if salt != expected_salt {
            return Err(anyhow!("record salt does not match the username derivation"));
        }

        let hash = BASE64.decode(hash_b64).context("decoding hash")?;
        let verifier: [u8; sec::VERIFIER_SIZE] =
            hash.try_into().map_err(|_| anyhow!("hash has the wrong size"))?;

        Ok(UserRecord { username: String::from(username), uid, gid, verifier })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store =
            Store::open(dir.path().join("etc"), dir.path().join("run")).expect("store to open");
        fs::create_dir_all(dir.path().join("run")).expect("run dir");
        (dir, store)
    }

    #[test]
    fn staged_values_show_a_star_until_committed() {
        let (_dir, store) = test_store();

        store.set(Category::Network, "port", "7600").expect("set");
        let view = store.get(Category::Network, "port").expect("get");
        assert_eq!(view.render(), "7600*");
        assert_eq!(store.committed(Category::Network, "port").expect("committed"), None);

        store.commit(Category::Network).expect("commit");
        let view = store.get(Category::Network, "port").expect("get");
        assert_eq!(view.render(), "7600");
        assert_eq!(
            store.committed(Category::Network, "port").expect("committed"),
            Some(String::from("7600"))
        );
    }

    #[test]
    fn rollback_restores_the_committed_value() {
        let (_dir, store) = test_store();

        store.set(Category::Auth, "use_local", "yes").expect("set");
        store.commit(Category::Auth).expect("commit");
        store.set(Category::Auth, "use_local", "no").expect("set");
        assert_eq!(store.get(Category::Auth, "use_local").expect("get").render(), "no*");

        store.rollback(Category::Auth).expect("rollback");
        assert_eq!(store.get(Category::Auth, "use_local").expect("get").render(), "yes");
    }

    #[test]
    fn delete_propagates_on_commit() {
        let (_dir, store) = test_store();

        store.set(Category::Network, "addr", "0.0.0.0").expect("set");
        store.commit(Category::Network).expect("commit");
        store.delete(Category::Network, "addr").expect("delete");
        store.commit(Category::Network).expect("commit");
        assert_eq!(store.committed(Category::Network, "addr").expect("committed"), None);
    }

    #[test]
    fn guarded_categories_refuse_commit_with_live_pid_file() {
        let (dir, store) = test_store();

        store.set(Category::Core, "workers", "8").expect("set");
        fs::write(dir.path().join("run").join("usched-daemon.pid"), "1234").expect("pid file");
        let err = store.commit(Category::Core).expect_err("commit should be blocked");
        assert!(format!("{err}").contains("refusing to commit"));

        // network is not guarded
        store.set(Category::Network, "port", "7601").expect("set");
        store.commit(Category::Network).expect("commit");
    }

    #[test]
    fn user_records_round_trip() {
        let (_dir, store) = test_store();

        store.user_add("alice", 1001, 1001, "hunter2").expect("add");
        // not visible to the daemon until committed
        assert_eq!(store.user_lookup("alice").expect("lookup"), None);
        store.commit(Category::Users).expect("commit");

        let record = store.user_lookup("alice").expect("lookup").expect("present");
        assert_eq!((record.uid, record.gid), (1001, 1001));
        assert_eq!(
            record.verifier,
            sec::derive_verifier("alice", "hunter2").expect("verifier")
        );
    }

    #[test]
    fn dotted_usernames_are_probes() {
        let (_dir, store) = test_store();
        assert!(store.user_lookup(".alice").is_err());
        assert!(store.user_add("../etc/passwd", 0, 0, "x").is_err());
    }
}
