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

//! Identity of the invoking user, from the passwd database.

use anyhow::{anyhow, Context};
use nix::unistd::{self, Uid};

#[derive(Debug)]
pub struct Info {
    pub uid: u32,
    pub gid: u32,
    pub home_dir: String,
    pub user: String,
}

pub fn info() -> anyhow::Result<Info> {
    let uid = Uid::current();
    let entry = unistd::User::from_uid(uid)
        .context("reading the passwd database")?
        .ok_or_else(|| anyhow!("no passwd entry for uid {uid}"))?;

    Ok(Info {
        uid: entry.uid.as_raw(),
        gid: entry.gid.as_raw(),
        home_dir: entry.dir.to_string_lossy().into_owned(),
        user: entry.name,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn the_current_user_resolves() {
        let me = info().expect("the invoking user always has a passwd entry");
        assert_eq!(me.uid, Uid::current().as_raw());
        assert!(!me.user.is_empty());
    }
}
