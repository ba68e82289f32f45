//! The session engine: transport-agnostic lifecycle and interaction service.
//!
//! [`SessionEngine`] owns code allocation (draw, claim, redraw on
//! collision), every vote-window, poll, and question-board operation, and
//! the lazy-expiry flip on the read path. Each operation is keyed by
//! session code, completes in one atomic store update, and fails with a
//! typed [`EngineError`]. Transports hold the engine behind an `Arc` and
//! map errors onto their own status semantics; nothing here knows about
//! requests or responses.

use std::time::Duration;

use chrono::Utc;

use crate::code::SessionCode;
use crate::error::EngineError;
use crate::session::{
    Broadcast, Choice, DEFAULT_QUESTION_CAPACITY, PollSnapshot, QuestionView, Session, Status,
    StatusSnapshot,
};
use crate::store::SessionStore;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Newest questions retained per session.
    pub question_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            question_capacity: DEFAULT_QUESTION_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn with_question_capacity(mut self, capacity: usize) -> Self {
        self.question_capacity = capacity;
        self
    }
}

/// The session state engine over a [`SessionStore`] backend.
pub struct SessionEngine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: SessionStore> SessionEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a session under a freshly drawn unique code.
    ///
    /// The zeroed session is built before the claim, so a winning claim
    /// publishes fully-initialized state and a losing claim publishes
    /// nothing.
    pub async fn create_session(&self) -> Result<SessionCode, EngineError> {
        loop {
            let code = SessionCode::generate(&mut rand::thread_rng());
            if self.store.insert_if_absent(&code, Session::new()).await? {
                tracing::info!(%code, "session created");
                return Ok(code);
            }
            tracing::debug!(%code, "session code collision, redrawing");
        }
    }

    pub async fn session_exists(&self, code: &SessionCode) -> Result<bool, EngineError> {
        Ok(self.store.contains(code).await?)
    }

    /// Idempotently bar further joins.
    pub async fn lock_session(&self, code: &SessionCode) -> Result<(), EngineError> {
        self.update(code, |s| s.lock()).await?;
        tracing::info!(%code, "session locked");
        Ok(())
    }

    pub async fn is_locked(&self, code: &SessionCode) -> Result<bool, EngineError> {
        Ok(self.load(code).await?.is_locked())
    }

    /// Unconditional participant count bump; returns the new count.
    pub async fn increment_participants(&self, code: &SessionCode) -> Result<u32, EngineError> {
        self.update(code, |s| s.add_participant()).await
    }

    /// Locked-gated join: the check and the increment are one atomic unit.
    pub async fn join_session(&self, code: &SessionCode) -> Result<u32, EngineError> {
        let joined = self.update(code, |s| s.join()).await??;
        tracing::debug!(%code, participants = joined, "participant joined");
        Ok(joined)
    }

    /// Start a fresh vote round. Counts and eligibility reset as one unit;
    /// returns the new window id, which votes must carry.
    pub async fn start_window(
        &self,
        code: &SessionCode,
        duration: Duration,
    ) -> Result<u64, EngineError> {
        let now = Utc::now();
        let window_id = self
            .update(code, move |s| s.start_window(duration, now))
            .await?;
        tracing::info!(%code, window_id, seconds = duration.as_secs(), "vote window opened");
        Ok(window_id)
    }

    /// Record one confusion vote for the round tagged `window_id`.
    pub async fn record_vote(
        &self,
        code: &SessionCode,
        status: Status,
        voter_id: &str,
        window_id: u64,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let voter = voter_id.to_string();
        let outcome = self
            .update(code, move |s| s.record_vote(status, &voter, window_id, now))
            .await?;
        match outcome {
            Ok(()) => {
                tracing::debug!(%code, window_id, status = status.as_str(), "vote recorded");
            }
            Err(rejection) => {
                tracing::debug!(%code, window_id, %rejection, "vote rejected");
            }
        }
        Ok(outcome?)
    }

    /// Counts plus session and window status. Performs the lazy-expiry
    /// flip when a deadline has passed unnoticed; otherwise a pure read.
    pub async fn read_state(&self, code: &SessionCode) -> Result<StatusSnapshot, EngineError> {
        let now = Utc::now();
        let session = self.load(code).await?;
        if session.expiry_due(now) {
            // Persist the flip, then snapshot the flipped state. Racing
            // readers may all come through here; the flip is idempotent.
            return self
                .update(code, move |s| {
                    s.expire_window_if_due(now);
                    s.status(now)
                })
                .await;
        }
        Ok(session.status(now))
    }

    /// Open a fresh yes/no poll; returns the new poll id, which votes must
    /// carry.
    pub async fn poll_start(&self, code: &SessionCode, question: &str) -> Result<u64, EngineError> {
        let question = question.to_string();
        let poll_id = self.update(code, move |s| s.poll_start(&question)).await??;
        tracing::info!(%code, poll_id, "poll opened");
        Ok(poll_id)
    }

    /// Record one yes/no vote for the poll round tagged `poll_id`.
    pub async fn poll_vote(
        &self,
        code: &SessionCode,
        choice: Choice,
        voter_id: &str,
        poll_id: u64,
    ) -> Result<(), EngineError> {
        let voter = voter_id.to_string();
        let outcome = self
            .update(code, move |s| s.poll_vote(choice, &voter, poll_id))
            .await?;
        match outcome {
            Ok(()) => {
                tracing::debug!(%code, poll_id, choice = choice.as_str(), "poll vote recorded");
            }
            Err(rejection) => {
                tracing::debug!(%code, poll_id, %rejection, "poll vote rejected");
            }
        }
        Ok(outcome?)
    }

    /// Stop taking poll votes; the tally stays readable until the next
    /// start.
    pub async fn poll_stop(&self, code: &SessionCode) -> Result<(), EngineError> {
        self.update(code, |s| s.poll_stop()).await?;
        tracing::info!(%code, "poll stopped");
        Ok(())
    }

    pub async fn poll_read(&self, code: &SessionCode) -> Result<PollSnapshot, EngineError> {
        Ok(self.load(code).await?.poll_snapshot())
    }

    pub async fn set_question_permission(
        &self,
        code: &SessionCode,
        allow: bool,
    ) -> Result<(), EngineError> {
        self.update(code, move |s| s.set_question_permission(allow))
            .await?;
        tracing::info!(%code, allow, "question permission set");
        Ok(())
    }

    pub async fn get_question_permission(&self, code: &SessionCode) -> Result<bool, EngineError> {
        Ok(self.load(code).await?.question_permission())
    }

    /// Append a student question, trimming the log to the configured bound.
    pub async fn submit_question(
        &self,
        code: &SessionCode,
        text: &str,
        voter_id: &str,
    ) -> Result<QuestionView, EngineError> {
        let now = Utc::now();
        let capacity = self.config.question_capacity;
        let text = text.to_string();
        let voter = voter_id.to_string();
        let view = self
            .update(code, move |s| s.submit_question(&text, &voter, now, capacity))
            .await??;
        tracing::debug!(%code, question_id = view.id, "question submitted");
        Ok(view)
    }

    /// Questions in arrival order. Voter tokens never appear here.
    pub async fn list_questions(
        &self,
        code: &SessionCode,
    ) -> Result<Vec<QuestionView>, EngineError> {
        Ok(self.load(code).await?.list_questions())
    }

    /// Remove a question, releasing the broadcast slot if it held it.
    /// Returns whether anything was removed.
    pub async fn delete_question(&self, code: &SessionCode, id: u64) -> Result<bool, EngineError> {
        let removed = self.update(code, move |s| s.delete_question(id)).await?;
        if removed {
            tracing::debug!(%code, question_id = id, "question deleted");
        }
        Ok(removed)
    }

    /// Set or clear the broadcast slot.
    pub async fn set_broadcast(
        &self,
        code: &SessionCode,
        text: &str,
        question_id: Option<u64>,
    ) -> Result<(), EngineError> {
        let text = text.to_string();
        self.update(code, move |s| s.set_broadcast(&text, question_id))
            .await
    }

    pub async fn get_broadcast(
        &self,
        code: &SessionCode,
    ) -> Result<Option<Broadcast>, EngineError> {
        Ok(self.load(code).await?.broadcast())
    }

    /// Run `apply` atomically against the session, mapping an unknown code
    /// to `NotFound`.
    async fn update<R>(
        &self,
        code: &SessionCode,
        apply: impl FnMut(&mut Session) -> R + Send + 'static,
    ) -> Result<R, EngineError>
    where
        R: Send + 'static,
    {
        self.store
            .update(code, apply)
            .await?
            .ok_or(EngineError::NotFound)
    }

    async fn load(&self, code: &SessionCode) -> Result<Session, EngineError> {
        self.store.load(code).await?.ok_or(EngineError::NotFound)
    }
}
