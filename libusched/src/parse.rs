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

//! The request sentence parser.
//!
//! A request is a little English-ish sentence like
//!
//! ```text
//! run 'echo hi' in 10 seconds then every 5 seconds until to time 17:00:00
//! ```
//!
//! made of an operation, a subject, and a chain of prepositional
//! clauses glued together with conjunctions:
//!
//! ```text
//! request   := op subj [ clause ( conj clause )* ]
//! op        := run | stop | show
//! clause    := prep ( adverb arg | arg adverb )
//! prep      := in | on | every | now | to
//! adverb    := seconds|minutes|hours|days|weeks|months|years
//!            | weekdays | time | date | datetime | timestamp
//! conj      := and | then | until | while
//! ```
//!
//! For `on` and `to` the adverb comes before the argument, for `in`
//! and `every` the argument comes first. Parsing never panics; every
//! rejection produces a [`UsageError`] naming the offending token.

use std::fmt;

use chrono::{
    Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Run,
    Stop,
    Show,
}

impl Op {
    fn parse(tok: &str) -> Option<Op> {
        match tok.to_ascii_lowercase().as_str() {
            "run" => Some(Op::Run),
            "stop" => Some(Op::Stop),
            "show" => Some(Op::Show),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Run => "run",
            Op::Stop => "stop",
            Op::Show => "show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prep {
    In,
    On,
    Every,
    Now,
    To,
}

impl Prep {
    fn parse(tok: &str) -> Option<Prep> {
        match tok.to_ascii_lowercase().as_str() {
            "in" => Some(Prep::In),
            "on" => Some(Prep::On),
            "every" => Some(Prep::Every),
            "now" => Some(Prep::Now),
            "to" => Some(Prep::To),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Prep::In => "in",
            Prep::On => "on",
            Prep::Every => "every",
            Prep::Now => "now",
            Prep::To => "to",
        }
    }

    /// The customary order: `on`/`to` lead with the adverb, `in` and
    /// `every` with the argument. Either order parses; this only
    /// picks which token to blame when neither is an adverb.
    fn adverb_first(&self) -> bool {
        matches!(self, Prep::On | Prep::To)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adverb {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
    Weekdays,
    Time,
    Date,
    Datetime,
    Timestamp,
}

impl Adverb {
    fn parse(tok: &str) -> Option<Adverb> {
        match tok.to_ascii_lowercase().as_str() {
            "second" | "seconds" => Some(Adverb::Seconds),
            "minute" | "minutes" => Some(Adverb::Minutes),
            "hour" | "hours" => Some(Adverb::Hours),
            "day" | "days" => Some(Adverb::Days),
            "week" | "weeks" => Some(Adverb::Weeks),
            "month" | "months" => Some(Adverb::Months),
            "year" | "years" => Some(Adverb::Years),
            "weekday" | "weekdays" => Some(Adverb::Weekdays),
            "time" => Some(Adverb::Time),
            "date" => Some(Adverb::Date),
            "datetime" => Some(Adverb::Datetime),
            "timestamp" => Some(Adverb::Timestamp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Adverb::Seconds => "seconds",
            Adverb::Minutes => "minutes",
            Adverb::Hours => "hours",
            Adverb::Days => "days",
            Adverb::Weeks => "weeks",
            Adverb::Months => "months",
            Adverb::Years => "years",
            Adverb::Weekdays => "weekdays",
            Adverb::Time => "time",
            Adverb::Date => "date",
            Adverb::Datetime => "datetime",
            Adverb::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conj {
    And,
    Then,
    Until,
    While,
}

impl Conj {
    fn parse(tok: &str) -> Option<Conj> {
        match tok.to_ascii_lowercase().as_str() {
            "and" => Some(Conj::And),
            "then" => Some(Conj::Then),
            "until" => Some(Conj::Until),
            "while" => Some(Conj::While),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Conj::And => "and",
            Conj::Then => "then",
            Conj::Until => "until",
            Conj::While => "while",
        }
    }
}

/// A resolved clause argument: either an offset from the reference
/// time or an absolute unix timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Now,
    Relative(u32),
    Absolute(u32),
}

/// One prepositional clause plus the conjunction that follows it
/// (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub prep: Prep,
    pub adverb: Option<Adverb>,
    /// The raw argument token, kept so requests can be rendered back.
    pub arg: Option<String>,
    /// Whether the adverb came before the argument, so rendering
    /// reproduces the sentence as written.
    pub adverb_led: bool,
    pub value: TimeSpec,
    pub conj: Option<Conj>,
}

/// A fully parsed request sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub subj: String,
    pub clauses: Vec<Clause>,
    /// The reference time the clause values were resolved against.
    pub reference: i64,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.op.as_str(), self.subj)?;
        for clause in &self.clauses {
            write!(f, " {}", clause.prep.as_str())?;
            match (clause.adverb, &clause.arg) {
                (Some(adverb), Some(arg)) => {
                    let quote = arg.contains(' ');
                    let (l, r) = if quote { ("'", "'") } else { ("", "") };
                    if clause.adverb_led {
                        write!(f, " {} {l}{arg}{r}", adverb.as_str())?;
                    } else {
                        write!(f, " {l}{arg}{r} {}", adverb.as_str())?;
                    }
                }
                _ => {}
            }
            if let Some(conj) = clause.conj {
                write!(f, " {}", conj.as_str())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    InvalidOp,
    InvalidPrep,
    InvalidAdverb,
    InvalidConj,
    InvalidArg,
    UnexpectedPrep,
    UnexpectedConj,
    InsufficientArgs,
    TooManyArgs,
}

/// A parse rejection: what went wrong and which token tripped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub token: Option<String>,
}

impl UsageError {
    fn new(kind: UsageErrorKind, token: &str) -> UsageError {
        UsageError { kind, token: Some(String::from(token)) }
    }

    fn bare(kind: UsageErrorKind) -> UsageError {
        UsageError { kind, token: None }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            UsageErrorKind::InvalidOp => "invalid operation",
            UsageErrorKind::InvalidPrep => "invalid preposition",
            UsageErrorKind::InvalidAdverb => "invalid adverbial of time",
            UsageErrorKind::InvalidConj => "invalid conjunction",
            UsageErrorKind::InvalidArg => "invalid argument",
            UsageErrorKind::UnexpectedPrep => "unexpected preposition",
            UsageErrorKind::UnexpectedConj => "unexpected conjunction",
            UsageErrorKind::InsufficientArgs => "insufficient arguments",
            UsageErrorKind::TooManyArgs => "too many arguments",
        };
        match &self.token {
            Some(token) => write!(f, "{what}: '{token}'"),
            None => write!(f, "{what}"),
        }
    }
}

impl std::error::Error for UsageError {}

/// Parse a request sentence against the given reference time.
pub fn parse(sentence: &str, reference: i64) -> Result<Request, UsageError> {
    let tokens = shell_words::split(sentence)
        .map_err(|_| UsageError::new(UsageErrorKind::InvalidArg, sentence))?;
    parse_tokens(&tokens, reference)
}

/// Parse an already tokenized request.
pub fn parse_tokens(tokens: &[String], reference: i64) -> Result<Request, UsageError> {
    let mut toks = tokens.iter().map(String::as_str);

    let op_tok = toks.next().ok_or(UsageError::bare(UsageErrorKind::InsufficientArgs))?;
    let op = Op::parse(op_tok).ok_or_else(|| UsageError::new(UsageErrorKind::InvalidOp, op_tok))?;

    match op {
        Op::Run => {
            if tokens.len() < 3 {
                return Err(UsageError::bare(UsageErrorKind::InsufficientArgs));
            }
        }
        Op::Stop | Op::Show => {
            if tokens.len() < 2 {
                return Err(UsageError::bare(UsageErrorKind::InsufficientArgs));
            }
            if tokens.len() > 2 {
                return Err(UsageError::bare(UsageErrorKind::TooManyArgs));
            }
        }
    }

    let subj = String::from(toks.next().ok_or(UsageError::bare(UsageErrorKind::InsufficientArgs))?);

    let mut req = Request { op, subj, clauses: Vec::new(), reference };
    let rest: Vec<&str> = toks.collect();
    if !rest.is_empty() {
        parse_clauses(&mut req, &rest)?;
    }

    Ok(req)
}

fn parse_clauses(req: &mut Request, mut toks: &[&str]) -> Result<(), UsageError> {
    // The conjunction that introduced the clause currently being
    // parsed. None for the first clause.
    let mut prev_conj: Option<Conj> = None;

    loop {
        let prep_tok = toks[0];
        let prep = Prep::parse(prep_tok)
            .ok_or_else(|| UsageError::new(UsageErrorKind::InvalidPrep, prep_tok))?;

        // `to` is only meaningful right after `until`, and `until`
        // accepts nothing but `to`. `while` accepts nothing but `in`.
        match prev_conj {
            Some(Conj::Until) if prep != Prep::To => {
                return Err(UsageError::new(UsageErrorKind::UnexpectedPrep, prep_tok));
            }
            Some(Conj::While) if prep != Prep::In => {
                return Err(UsageError::new(UsageErrorKind::UnexpectedPrep, prep_tok));
            }
            _ => {}
        }
        if prep == Prep::To && prev_conj != Some(Conj::Until) {
            return Err(UsageError::new(UsageErrorKind::UnexpectedPrep, prep_tok));
        }

        let mut clause = if prep == Prep::Now {
            if prev_conj.is_some() {
                return Err(UsageError::new(UsageErrorKind::UnexpectedPrep, prep_tok));
            }
            toks = &toks[1..];
            Clause {
                prep,
                adverb: None,
                arg: None,
                adverb_led: false,
                value: TimeSpec::Now,
                conj: None,
            }
        } else {
            if toks.len() < 3 {
                return Err(UsageError::bare(UsageErrorKind::InsufficientArgs));
            }
            // either token may be the adverb; whichever parses wins
            let (adverb, adverb_led) = match (Adverb::parse(toks[1]), Adverb::parse(toks[2])) {
                (Some(adverb), _) => (adverb, true),
                (None, Some(adverb)) => (adverb, false),
                (None, None) => {
                    let blame = if prep.adverb_first() { toks[1] } else { toks[2] };
                    return Err(UsageError::new(UsageErrorKind::InvalidAdverb, blame));
                }
            };
            let arg_tok = if adverb_led { toks[2] } else { toks[1] };
            let value = resolve_arg(prep, adverb, arg_tok, req.reference)
                .ok_or_else(|| UsageError::new(UsageErrorKind::InvalidArg, arg_tok))?;
            toks = &toks[3..];
            Clause {
                prep,
                adverb: Some(adverb),
                arg: Some(String::from(arg_tok)),
                adverb_led,
                value,
                conj: None,
            }
        };

        if toks.is_empty() {
            req.clauses.push(clause);
            return Ok(());
        }

        let conj_tok = toks[0];
        let conj = Conj::parse(conj_tok)
            .ok_or_else(|| UsageError::new(UsageErrorKind::InvalidConj, conj_tok))?;

        // After an until or while clause only `and` may follow.
        if matches!(prev_conj, Some(Conj::Until) | Some(Conj::While)) && conj != Conj::And {
            return Err(UsageError::new(UsageErrorKind::UnexpectedConj, conj_tok));
        }

        // A conjunction must introduce a full clause.
        if toks.len() < 3 {
            return Err(UsageError::bare(UsageErrorKind::InsufficientArgs));
        }

        clause.conj = Some(conj);
        req.clauses.push(clause);
        toks = &toks[1..];
        prev_conj = Some(conj);
    }
}

/// Resolve one clause argument. `in`/`every` arguments are offsets
/// scaled by the unit; `on`/`to` arguments are placed on the calendar
/// relative to the reference time. Returns None for anything that
/// does not fit the unit.
fn resolve_arg(prep: Prep, adverb: Adverb, arg: &str, reference: i64) -> Option<TimeSpec> {
    if matches!(prep, Prep::In | Prep::Every) {
        let n: u32 = arg.parse().ok()?;
        let unit: u32 = match adverb {
            Adverb::Seconds => 1,
            Adverb::Minutes => 60,
            Adverb::Hours => 3600,
            Adverb::Days => 86400,
            Adverb::Weeks => 86400 * 7,
            Adverb::Months => 86400 * 30,
            Adverb::Years => 86400 * 365,
            // calendar placements make no sense as offsets
            _ => return None,
        };
        return n.checked_mul(unit).map(TimeSpec::Relative);
    }

    // Calendar placement. Work in naive local time the way the
    // grammar reads ("on hour 17" is 17:00 on the wall clock), then
    // pin the result back to an epoch second.
    let now = Local.timestamp_opt(reference, 0).single()?.naive_local();

    if adverb == Adverb::Timestamp {
        let ts: u32 = arg.parse().ok()?;
        return Some(TimeSpec::Absolute(ts));
    }

    let placed = match adverb {
        Adverb::Seconds => next_second(now, arg.parse().ok()?),
        Adverb::Minutes => next_minute(now, arg.parse().ok()?),
        Adverb::Hours => next_hour(now, arg.parse().ok()?),
        Adverb::Days => next_monthday(now, arg.parse().ok()?),
        Adverb::Weeks => next_week(now, arg.parse().ok()?),
        Adverb::Months => next_month(now, arg.parse().ok()?),
        Adverb::Years => next_year(now, arg.parse().ok()?),
        Adverb::Weekdays => next_weekday(now, parse_weekday(arg)?),
        Adverb::Time => next_time(now, NaiveTime::parse_from_str(arg, "%H:%M:%S").ok()?),
        Adverb::Date => NaiveDate::parse_from_str(arg, "%Y-%m-%d")
            .ok()
            .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is always a valid time")),
        Adverb::Datetime => NaiveDateTime::parse_from_str(arg, "%Y-%m-%d %H:%M:%S").ok(),
        Adverb::Timestamp => unreachable!("handled above"),
    }?;

    let ts = Local.from_local_datetime(&placed).earliest()?.timestamp();
    u32::try_from(ts).ok().map(TimeSpec::Absolute)
}

/// Weekday names or numbers, Sunday=1 .. Saturday=7.
fn parse_weekday(arg: &str) -> Option<u32> {
    match arg.to_ascii_lowercase().as_str() {
        "sunday" => Some(1),
        "monday" => Some(2),
        "tuesday" => Some(3),
        "wednesday" => Some(4),
        "thursday" => Some(5),
        "friday" => Some(6),
        "saturday" => Some(7),
        n => match n.parse() {
            Ok(v @ 1..=7) => Some(v),
            _ => None,
        },
    }
}

fn next_second(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    if n > 59 {
        return None;
    }
    let t = if now.second() >= n { now + Duration::minutes(1) } else { now };
    t.with_second(n)
}

fn next_minute(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    if n > 59 {
        return None;
    }
    let t = if now.minute() >= n { now + Duration::hours(1) } else { now };
    t.with_second(0)?.with_minute(n)
}

fn next_hour(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    if n > 23 {
        return None;
    }
    let t = if now.hour() >= n { now + Duration::days(1) } else { now };
    t.with_second(0)?.with_minute(0)?.with_hour(n)
}

fn next_monthday(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    if !(1..=31).contains(&n) {
        return None;
    }
    let (mut year, mut month) = (now.year(), now.month());
    if now.day() >= n {
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    NaiveDate::from_ymd_opt(year, month, n)?.and_hms_opt(0, 0, 0)
}

fn next_week(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    if n > 52 {
        return None;
    }
    let year = if now.ordinal0() / 7 >= n { now.year() + 1 } else { now.year() };
    NaiveDate::from_yo_opt(year, n * 7 + 1)?.and_hms_opt(0, 0, 0)
}

fn next_month(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    if !(1..=12).contains(&n) {
        return None;
    }
    let year = if now.month() >= n { now.year() + 1 } else { now.year() };
    NaiveDate::from_ymd_opt(year, n, 1)?.and_hms_opt(0, 0, 0)
}

fn next_year(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    let n = i32::try_from(n).ok()?;
    if n <= now.year() {
        return None;
    }
    NaiveDate::from_ymd_opt(n, 1, 1)?.and_hms_opt(0, 0, 0)
}

fn next_weekday(now: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
    let target = n - 1; // 0 = Sunday
    let current = now.weekday().num_days_from_sunday();
    let ahead = if current < target { target - current } else { 7 - current + target };
    (now.date() + Duration::days(i64::from(ahead))).and_hms_opt(0, 0, 0)
}

fn next_time(now: NaiveDateTime, t: NaiveTime) -> Option<NaiveDateTime> {
    let candidate = now.date().and_time(t);
    Some(if candidate < now { candidate + Duration::days(1) } else { candidate })
}
