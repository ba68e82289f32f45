//! Session state and the pure transitions over it.
//!
//! Everything in this module is synchronous and storage-agnostic. A
//! [`Session`] is a plain value; every transition takes `&mut self` plus an
//! explicit `now` where time matters, and either mutates or returns a
//! [`Rejection`] leaving the value untouched. The engine runs transitions
//! inside the store's atomic `update`, which is what makes their multi-field
//! resets indivisible.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Rejection;

/// Default bound on the retained question log.
pub const DEFAULT_QUESTION_CAPACITY: usize = 200;

/// A student's three-way confusion check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotConfused,
    Soso,
    Confused,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConfused => "not_confused",
            Self::Soso => "soso",
            Self::Confused => "confused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized confusion status {0:?}")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    /// Accepts the wire spellings case-insensitively, treating hyphens as
    /// underscores (`"Not-Confused"` parses).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "not_confused" => Ok(Self::NotConfused),
            "soso" => Ok(Self::Soso),
            "confused" => Ok(Self::Confused),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// A yes/no poll answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    Yes,
    No,
}

impl Choice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized poll choice {0:?}")]
pub struct ParseChoiceError(String);

impl FromStr for Choice {
    type Err = ParseChoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            _ => Err(ParseChoiceError(s.to_string())),
        }
    }
}

/// Tally for one vote window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    pub not_confused: u32,
    pub soso: u32,
    pub confused: u32,
}

impl VoteCounts {
    fn bump(&mut self, status: Status) {
        match status {
            Status::NotConfused => self.not_confused += 1,
            Status::Soso => self.soso += 1,
            Status::Confused => self.confused += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.not_confused + self.soso + self.confused
    }
}

/// The repeating timed round of confusion voting.
///
/// `window_id` increments on every open; the counts and the voted set belong
/// to the current id only. Expiry is lazy: nothing closes a window until a
/// read or a vote notices the deadline has passed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoteWindow {
    active: bool,
    expires_at: Option<DateTime<Utc>>,
    window_id: u64,
    counts: VoteCounts,
    voted: HashSet<String>,
}

impl VoteWindow {
    /// Start a new round: one indivisible reset of id, counts, voted set,
    /// activation flag, and deadline.
    fn open(&mut self, duration: Duration, now: DateTime<Utc>) -> u64 {
        self.window_id += 1;
        self.counts = VoteCounts::default();
        self.voted.clear();
        self.active = true;
        self.expires_at = Some(deadline(now, duration));
        self.window_id
    }

    /// Lazy expiry: flip `active` off once the deadline has passed. Returns
    /// whether this call performed the flip. Idempotent.
    fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.expiry_due(now) {
            self.active = false;
            true
        } else {
            false
        }
    }

    /// Whether the deadline has passed but the flip has not been applied yet.
    fn expiry_due(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_open(now)
    }

    fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_some_and(|deadline| now < deadline)
    }

    fn seconds_remaining(&self, now: DateTime<Utc>) -> u64 {
        match self.expires_at {
            Some(deadline) if self.is_open(now) => (deadline - now).num_seconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Record one vote. Check-then-act: on any rejection, no tally or
    /// eligibility state has changed (the lazy expiry flip may still apply).
    fn record(
        &mut self,
        status: Status,
        voter_id: &str,
        window_id: u64,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if voter_id.trim().is_empty() {
            return Err(Rejection::MissingVoter);
        }
        self.expire_if_due(now);
        if !self.active {
            return Err(Rejection::WindowClosed);
        }
        if window_id != self.window_id {
            // A late vote from an earlier round. Never credit it to this one.
            return Err(Rejection::WindowClosed);
        }
        if !self.voted.insert(voter_id.to_string()) {
            return Err(Rejection::AlreadyVoted);
        }
        self.counts.bump(status);
        Ok(())
    }
}

fn deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A yes/no poll. No deadline: it stays open until explicitly stopped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Poll {
    active: bool,
    question: String,
    yes: u32,
    no: u32,
    poll_id: u64,
    voted: HashSet<String>,
}

impl Poll {
    fn open(&mut self, question: String) -> u64 {
        self.poll_id += 1;
        self.question = question;
        self.yes = 0;
        self.no = 0;
        self.voted.clear();
        self.active = true;
        self.poll_id
    }

    fn vote(&mut self, choice: Choice, voter_id: &str, poll_id: u64) -> Result<(), Rejection> {
        if voter_id.trim().is_empty() {
            return Err(Rejection::MissingVoter);
        }
        if !self.active || poll_id != self.poll_id {
            return Err(Rejection::NotActive);
        }
        if !self.voted.insert(voter_id.to_string()) {
            return Err(Rejection::AlreadyVoted);
        }
        match choice {
            Choice::Yes => self.yes += 1,
            Choice::No => self.no += 1,
        }
        Ok(())
    }

    /// Stop taking votes. The tally stays readable until the next open.
    fn stop(&mut self) {
        self.active = false;
    }

    fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            active: self.active,
            question: self.question.clone(),
            yes: self.yes,
            no: self.no,
            poll_id: self.poll_id,
        }
    }
}

/// A stored student question. The submitting voter token is bookkeeping and
/// never leaves the engine through the read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Question {
    id: u64,
    text: String,
    submitted_at: DateTime<Utc>,
    voter_id: String,
}

impl Question {
    fn view(&self) -> QuestionView {
        QuestionView {
            id: self.id,
            text: self.text.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

/// The audience-facing projection of a stored question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionView {
    pub id: u64,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

/// The single highlighted item: free text, optionally linked to a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub text: String,
    pub question_id: Option<u64>,
}

/// Point-in-time view served to polling clients: the tally plus session and
/// window status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub counts: VoteCounts,
    pub participants: u32,
    pub locked: bool,
    pub window_active: bool,
    pub seconds_remaining: u64,
    pub window_id: u64,
}

/// Current poll tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSnapshot {
    pub active: bool,
    pub question: String,
    pub yes: u32,
    pub no: u32,
    pub poll_id: u64,
}

/// All state for one classroom session.
///
/// A `Session` is both the unit of storage and the unit of atomicity: stores
/// persist it as one value and apply transitions to it as one transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    locked: bool,
    participants: u32,
    window: VoteWindow,
    poll: Poll,
    question_permission: bool,
    broadcast: Option<Broadcast>,
    questions: VecDeque<Question>,
    question_seq: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked
    }

    /// Unconditional participant increment; returns the new count.
    pub(crate) fn add_participant(&mut self) -> u32 {
        self.participants += 1;
        self.participants
    }

    /// Locked-gated join. Run inside a store update, the check and the
    /// increment are one unit.
    pub(crate) fn join(&mut self) -> Result<u32, Rejection> {
        if self.locked {
            return Err(Rejection::SessionLocked);
        }
        Ok(self.add_participant())
    }

    pub(crate) fn start_window(&mut self, duration: Duration, now: DateTime<Utc>) -> u64 {
        self.window.open(duration, now)
    }

    pub(crate) fn record_vote(
        &mut self,
        status: Status,
        voter_id: &str,
        window_id: u64,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        self.window.record(status, voter_id, window_id, now)
    }

    pub(crate) fn expiry_due(&self, now: DateTime<Utc>) -> bool {
        self.window.expiry_due(now)
    }

    pub(crate) fn expire_window_if_due(&mut self, now: DateTime<Utc>) -> bool {
        self.window.expire_if_due(now)
    }

    pub(crate) fn status(&self, now: DateTime<Utc>) -> StatusSnapshot {
        StatusSnapshot {
            counts: self.window.counts,
            participants: self.participants,
            locked: self.locked,
            window_active: self.window.is_open(now),
            seconds_remaining: self.window.seconds_remaining(now),
            window_id: self.window.window_id,
        }
    }

    pub(crate) fn poll_start(&mut self, question: &str) -> Result<u64, Rejection> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Rejection::EmptyText);
        }
        Ok(self.poll.open(question.to_string()))
    }

    pub(crate) fn poll_vote(
        &mut self,
        choice: Choice,
        voter_id: &str,
        poll_id: u64,
    ) -> Result<(), Rejection> {
        self.poll.vote(choice, voter_id, poll_id)
    }

    pub(crate) fn poll_stop(&mut self) {
        self.poll.stop();
    }

    pub(crate) fn poll_snapshot(&self) -> PollSnapshot {
        self.poll.snapshot()
    }

    pub(crate) fn set_question_permission(&mut self, allow: bool) {
        self.question_permission = allow;
    }

    pub(crate) fn question_permission(&self) -> bool {
        self.question_permission
    }

    /// Append a question, trimming the log to `capacity` newest entries.
    /// Evicted questions release the broadcast slot if they held it.
    pub(crate) fn submit_question(
        &mut self,
        text: &str,
        voter_id: &str,
        now: DateTime<Utc>,
        capacity: usize,
    ) -> Result<QuestionView, Rejection> {
        if !self.question_permission {
            return Err(Rejection::PermissionDenied);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(Rejection::EmptyText);
        }
        self.question_seq += 1;
        let question = Question {
            id: self.question_seq,
            text: text.to_string(),
            submitted_at: now,
            voter_id: voter_id.to_string(),
        };
        let view = question.view();
        self.questions.push_back(question);
        while self.questions.len() > capacity {
            if let Some(evicted) = self.questions.pop_front() {
                self.drop_broadcast_link(evicted.id);
            }
        }
        Ok(view)
    }

    /// Questions in arrival order, without voter tokens.
    pub(crate) fn list_questions(&self) -> Vec<QuestionView> {
        self.questions.iter().map(Question::view).collect()
    }

    /// Remove a question by id. Returns whether anything was removed; a
    /// removed question releases the broadcast slot if it held it.
    pub(crate) fn delete_question(&mut self, id: u64) -> bool {
        let before = self.questions.len();
        self.questions.retain(|q| q.id != id);
        let removed = self.questions.len() != before;
        if removed {
            self.drop_broadcast_link(id);
        }
        removed
    }

    /// Set or clear the broadcast slot. A `question_id` that matches nothing
    /// in the log is dropped and the text still broadcasts as free text;
    /// empty text with no surviving link clears the slot.
    pub(crate) fn set_broadcast(&mut self, text: &str, question_id: Option<u64>) {
        let question_id = question_id.filter(|id| self.questions.iter().any(|q| q.id == *id));
        if text.trim().is_empty() && question_id.is_none() {
            self.broadcast = None;
            return;
        }
        self.broadcast = Some(Broadcast {
            text: text.to_string(),
            question_id,
        });
    }

    pub(crate) fn broadcast(&self) -> Option<Broadcast> {
        self.broadcast.clone()
    }

    fn drop_broadcast_link(&mut self, question_id: u64) {
        if self
            .broadcast
            .as_ref()
            .is_some_and(|b| b.question_id == Some(question_id))
        {
            self.broadcast = None;
        }
    }
}
