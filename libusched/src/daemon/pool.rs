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

//! The two entry pools.
//!
//! The receiving pool stages entries that are still being assembled
//! from a connection, keyed by connection id. The active pool holds
//! admitted, armed entries keyed by their assigned id. An entry lives
//! in exactly one pool at a time and moves between them by value.
//!
//! Each pool locks internally. Where both pools are needed the
//! receiving pool lock is taken (and released) first; nothing ever
//! holds both at once.

use std::{collections::HashMap, sync::Mutex};

use tracing::warn;

use super::entry::Entry;

pub struct EntryPool {
    name: &'static str,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl EntryPool {
    pub fn new(name: &'static str) -> EntryPool {
        EntryPool { name, entries: Mutex::new(HashMap::new()) }
    }

    /// Insert an entry under its id. Fails (returning the entry) if
    /// the id is already present; ids must stay unique.
    pub fn insert(&self, entry: Entry) -> Result<(), Entry> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&entry.id) {
            warn!("{}: rejecting duplicate id {:#018x}", self.name, entry.id);
            return Err(entry);
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    /// Remove and discard an entry.
    pub fn remove(&self, id: u64) -> bool {
        self.entries.lock().unwrap().remove(&id).is_some()
    }

    /// Remove an entry without destroying it.
    pub fn pop(&self, id: u64) -> Option<Entry> {
        self.entries.lock().unwrap().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    /// Run a closure against one entry under the pool lock.
    pub fn with_entry<R>(&self, id: u64, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&id).map(f)
    }

    /// Run a closure against the whole table under the pool lock.
    /// This is the marshal's serialization hook; everything else
    /// should prefer the narrower accessors.
    pub fn with_all<R>(&self, f: impl FnOnce(&mut HashMap<u64, Entry>) -> R) -> R {
        let mut entries = self.entries.lock().unwrap();
        f(&mut entries)
    }

    /// Clone out a snapshot of one entry.
    pub fn get_copy(&self, id: u64) -> Option<Entry> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    /// The ids of every entry owned by a uid.
    pub fn ids_owned_by(&self, uid: u32) -> Vec<u64> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.uid == uid)
            .map(|e| e.id)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use usched_protocol::EntryFlags;

    fn entry(id: u64, uid: u32) -> Entry {
        Entry { id, uid, gid: uid, flags: EntryFlags::NEW, ..Entry::default() }
    }

    #[test]
    fn ids_stay_unique() {
        let pool = EntryPool::new("apool");
        pool.insert(entry(1, 100)).expect("first insert");
        let rejected = pool.insert(entry(1, 200)).expect_err("duplicate id");
        assert_eq!(rejected.uid, 200);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn pop_moves_ownership_out() {
        let pool = EntryPool::new("rpool");
        pool.insert(entry(7, 100)).expect("insert");
        let moved = pool.pop(7).expect("entry present");
        assert_eq!(moved.id, 7);
        assert!(!pool.contains(7));
        assert!(pool.pop(7).is_none());
    }

    #[test]
    fn ownership_scans() {
        let pool = EntryPool::new("apool");
        pool.insert(entry(1, 100)).expect("insert");
        pool.insert(entry(2, 200)).expect("insert");
        pool.insert(entry(3, 100)).expect("insert");

        let mut mine = pool.ids_owned_by(100);
        mine.sort();
        assert_eq!(mine, vec![1, 3]);
        assert_eq!(pool.ids_owned_by(300), Vec::<u64>::new());
    }

    #[test]
    fn with_entry_mutates_in_place() {
        let pool = EntryPool::new("apool");
        pool.insert(entry(1, 100)).expect("insert");
        pool.with_entry(1, |e| e.flags.set(EntryFlags::FINISH)).expect("entry present");
        assert!(pool.get_copy(1).expect("copy").flags.contains(EntryFlags::FINISH));
    }
}
