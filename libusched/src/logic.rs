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

//! Compiles a parsed request into the entry records that actually go
//! on the wire.
//!
//! The parser checks that a sentence is shaped like a request; this
//! layer checks that the clause chain composes into something
//! schedulable. `then` must introduce an `every` step, `until` an
//! absolute expiry, `while` a relative one, and `and` starts a fresh
//! entry inheriting the subject.

use std::fmt;

use usched_protocol::{EntryFlags, ALL_ENTRIES};

use crate::parse::{Adverb, Conj, Op, Prep, Request, TimeSpec};

/// One entry as compiled on the client side, ready to be shipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySpec {
    pub flags: EntryFlags,
    pub trigger: u32,
    pub step: u32,
    pub expire: u32,
    pub subj: String,
}

/// What a request asks the daemon to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compiled {
    /// Admit these new entries, in order.
    Run(Vec<EntrySpec>),
    /// Remove the listed entries (or all of ours).
    Stop(Vec<u64>),
    /// Report the listed entries (or all of ours).
    Show(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicError {
    /// The first clause of an entry cannot be `every`.
    LeadingEvery,
    /// `then` was not followed by an `every` clause.
    ThenWithoutEvery,
    /// A conjunction chain that does not compose (e.g. two `then`s
    /// on one entry).
    UnexpectedConj(Conj),
    /// A stop/show subject that is not `all` or a comma separated
    /// list of hex ids.
    InvalidId(String),
    /// A trailing conjunction with nothing after it. The parser does
    /// not produce this; it guards direct construction.
    DanglingConj(Conj),
}

impl fmt::Display for LogicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicError::LeadingEvery => {
                write!(f, "an entry cannot start with 'every'; lead with 'in', 'on' or 'now'")
            }
            LogicError::ThenWithoutEvery => write!(f, "'then' must be followed by 'every'"),
            LogicError::UnexpectedConj(conj) => {
                write!(f, "conjunction '{}' does not compose here", conj.as_str())
            }
            LogicError::InvalidId(tok) => write!(f, "invalid entry id: '{tok}'"),
            LogicError::DanglingConj(conj) => {
                write!(f, "conjunction '{}' with nothing after it", conj.as_str())
            }
        }
    }
}

impl std::error::Error for LogicError {}

/// Compile a parsed request.
pub fn compile(req: &Request) -> Result<Compiled, LogicError> {
    match req.op {
        Op::Run => compile_run(req).map(Compiled::Run),
        Op::Stop => compile_id_list(&req.subj).map(Compiled::Stop),
        Op::Show => compile_id_list(&req.subj).map(Compiled::Show),
    }
}

fn trigger_of(value: TimeSpec, reference: i64) -> u32 {
    match value {
        TimeSpec::Now => reference as u32,
        TimeSpec::Relative(off) => (reference as u32).saturating_add(off),
        TimeSpec::Absolute(ts) => ts,
    }
}

fn compile_run(req: &Request) -> Result<Vec<EntrySpec>, LogicError> {
    let clauses = &req.clauses;
    let mut entries = Vec::new();
    let mut i = 0;

    while i < clauses.len() {
        let head = &clauses[i];
        if head.prep == Prep::Every {
            return Err(LogicError::LeadingEvery);
        }

        let mut flags = EntryFlags::NEW;
        if head.prep == Prep::In {
            flags.set(EntryFlags::RELATIVE_TRIGGER);
        }
        let mut spec = EntrySpec {
            flags,
            trigger: trigger_of(head.value, req.reference),
            step: 0,
            expire: 0,
            subj: req.subj.clone(),
        };

        let mut conj = head.conj;
        i += 1;

        if conj == Some(Conj::Then) {
            let step = clauses.get(i).ok_or(LogicError::DanglingConj(Conj::Then))?;
            if step.prep != Prep::Every {
                return Err(LogicError::ThenWithoutEvery);
            }
            match step.value {
                TimeSpec::Relative(off) => spec.step = off,
                // `every` always resolves relative
                _ => return Err(LogicError::ThenWithoutEvery),
            }
            match step.adverb {
                Some(Adverb::Months) => spec.flags.set(EntryFlags::MONTHDAY_ALIGN),
                Some(Adverb::Years) => spec.flags.set(EntryFlags::YEARDAY_ALIGN),
                _ => {}
            }
            conj = step.conj;
            i += 1;
        }

        match conj {
            Some(Conj::Until) => {
                let until = clauses.get(i).ok_or(LogicError::DanglingConj(Conj::Until))?;
                // the parser only lets a `to` clause follow `until`
                spec.expire = trigger_of(until.value, req.reference);
                conj = until.conj;
                i += 1;
            }
            Some(Conj::While) => {
                let during = clauses.get(i).ok_or(LogicError::DanglingConj(Conj::While))?;
                spec.flags.set(EntryFlags::RELATIVE_EXPIRE);
                spec.expire = trigger_of(during.value, req.reference);
                conj = during.conj;
                i += 1;
            }
            _ => {}
        }

        entries.push(spec);

        match conj {
            None => break,
            Some(Conj::And) => continue,
            Some(other) => return Err(LogicError::UnexpectedConj(other)),
        }
    }

    Ok(entries)
}

/// Stop/show subjects are either `all` or a comma separated list of
/// hex entry ids.
fn compile_id_list(subj: &str) -> Result<Vec<u64>, LogicError> {
    if subj.eq_ignore_ascii_case("all") {
        return Ok(vec![ALL_ENTRIES]);
    }

    let mut ids = Vec::new();
    for tok in subj.split(',') {
        let tok = tok.trim();
        let id = u64::from_str_radix(tok.trim_start_matches("0x"), 16)
            .map_err(|_| LogicError::InvalidId(String::from(tok)))?;
        if id == ALL_ENTRIES {
            return Err(LogicError::InvalidId(String::from(tok)));
        }
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse;

    fn run(sentence: &str, reference: i64) -> Vec<EntrySpec> {
        let req = parse::parse(sentence, reference).expect("parse to succeed");
        match compile(&req).expect("compile to succeed") {
            Compiled::Run(entries) => entries,
            other => panic!("expected a run compilation, got {other:?}"),
        }
    }

    #[test]
    fn one_shot_relative() {
        // S1 shape: a single relative trigger
        let entries = run("run 'echo hi' in 10 seconds", 1000);
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!((e.trigger, e.step, e.expire), (1010, 0, 0));
        assert_eq!(e.subj, "echo hi");
        assert!(e.flags.contains(EntryFlags::NEW));
        assert!(e.flags.contains(EntryFlags::RELATIVE_TRIGGER));
    }

    #[test]
    fn step_and_absolute_expiry() {
        // trigger=5 step=5 expire=25 against t=0
        let entries = run("run 'x' in 5 seconds then every 5 seconds until to timestamp 25", 0);
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!((e.trigger, e.step, e.expire), (5, 5, 25));
        assert!(!e.flags.contains(EntryFlags::RELATIVE_EXPIRE));
    }

    #[test]
    fn relative_expiry_sets_the_flag() {
        let entries = run("run 'x' in 5 seconds then every 5 seconds while in 1 hours", 100);
        let e = &entries[0];
        assert_eq!((e.trigger, e.step, e.expire), (105, 5, 3700));
        assert!(e.flags.contains(EntryFlags::RELATIVE_EXPIRE));
    }

    #[test]
    fn month_steps_request_alignment() {
        let entries = run("run 'x' in 1 seconds then every 2 months", 0);
        let e = &entries[0];
        assert_eq!(e.step, 2 * 30 * 86400);
        assert!(e.flags.contains(EntryFlags::MONTHDAY_ALIGN));
        assert!(!e.flags.contains(EntryFlags::YEARDAY_ALIGN));

        let entries = run("run 'x' in 1 seconds then every 1 years", 0);
        assert!(entries[0].flags.contains(EntryFlags::YEARDAY_ALIGN));
    }

    #[test]
    fn and_opens_a_new_entry_with_the_same_subject() {
        let entries = run("run 'x' in 5 seconds and in 10 seconds then every 1 minutes", 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].subj, "x");
        assert_eq!(entries[1].subj, "x");
        assert_eq!((entries[0].trigger, entries[0].step), (5, 0));
        assert_eq!((entries[1].trigger, entries[1].step), (10, 60));
    }

    #[test]
    fn composition_errors() {
        let req = parse::parse("run 'x' every 5 seconds", 0).expect("parse to succeed");
        assert_eq!(compile(&req), Err(LogicError::LeadingEvery));

        let req = parse::parse("run 'x' in 5 seconds then in 5 seconds", 0).expect("parse");
        assert_eq!(compile(&req), Err(LogicError::ThenWithoutEvery));

        let req =
            parse::parse("run 'x' in 5 seconds then every 5 seconds then every 6 seconds", 0)
                .expect("parse");
        assert_eq!(compile(&req), Err(LogicError::UnexpectedConj(Conj::Then)));
    }

    #[test]
    fn id_lists() {
        assert_eq!(compile_id_list("all"), Ok(vec![ALL_ENTRIES]));
        assert_eq!(compile_id_list("1a2b"), Ok(vec![0x1a2b]));
        assert_eq!(compile_id_list("0xff,10"), Ok(vec![0xff, 0x10]));
        assert_eq!(compile_id_list("0"), Err(LogicError::InvalidId(String::from("0"))));
        assert_eq!(compile_id_list("nope"), Err(LogicError::InvalidId(String::from("nope"))));
    }
}
