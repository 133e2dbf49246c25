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

//! The admin front end over the configuration store.
//!
//! Operations: add, delete, change, show, commit, rollback over the
//! store categories. Properties render as
//! `category.property = value` with a trailing `*` while the staged
//! value differs from the committed one.

use std::path::PathBuf;

use anyhow::{anyhow, Context};

use crate::store::{Category, Store};

pub fn run(config_base: PathBuf, pid_dir: PathBuf, args: Vec<String>) -> anyhow::Result<()> {
    let store = Store::open(config_base, pid_dir).context("opening config store")?;

    let mut args = args.into_iter();
    let op = args.next().ok_or_else(|| {
        anyhow!("usage: admin <add|delete|change|show|commit|rollback> <category> ...")
    })?;
    let category_tok =
        args.next().ok_or_else(|| anyhow!("the {op} operation needs a category"))?;
    let category = Category::parse(&category_tok)
        .ok_or_else(|| anyhow!("unknown category '{category_tok}'"))?;
    let rest: Vec<String> = args.collect();

    match (op.as_str(), category) {
        ("show", _) => show(&store, category, &rest),
        ("commit", _) => {
            store.commit(category)?;
            println!("{category} committed");
            Ok(())
        }
        ("rollback", _) => {
            store.rollback(category)?;
            println!("{category} rolled back");
            Ok(())
        }
        ("add", Category::Users) | ("change", Category::Users) => user_add(&store, &rest),
        ("delete", Category::Users) => {
            let username =
                rest.first().ok_or_else(|| anyhow!("delete users needs a username"))?;
            store.user_delete(username)?;
            println!("users.{username} deleted (staged)");
            Ok(())
        }
        ("add", _) | ("change", _) => {
            let [prop, value] = rest.as_slice() else {
                return Err(anyhow!("{op} needs a property and a value"));
            };
            store.set(category, prop, value)?;
            println!("{category}.{prop} = {}", store.get(category, prop)?.render());
            Ok(())
        }
        ("delete", _) => {
            let prop = rest.first().ok_or_else(|| anyhow!("delete needs a property"))?;
            store.delete(category, prop)?;
            println!("{category}.{prop} deleted (staged)");
            Ok(())
        }
        _ => Err(anyhow!("unknown admin operation '{op}'")),
    }
}

fn show(store: &Store, category: Category, rest: &[String]) -> anyhow::Result<()> {
    match rest.first() {
        Some(prop) => {
            println!("{category}.{prop} = {}", store.get(category, prop)?.render());
        }
        None => {
            for (prop, view) in store.show(category)? {
                println!("{category}.{prop} = {}", view.render());
            }
        }
    }
    Ok(())
}

fn user_add(store: &Store, rest: &[String]) -> anyhow::Result<()> {
    let [username, uid, gid, password] = rest else {
        return Err(anyhow!("add users needs: <username> <uid> <gid> <password>"));
    };
    let uid: u32 = uid.parse().context("parsing uid")?;
    let gid: u32 = gid.parse().context("parsing gid")?;
    store.user_add(username, uid, gid, password)?;
    println!("users.{username} staged; commit the users category to activate");
    Ok(())
}
