//! classpulse: the session state engine behind live classroom check-ins.
//!
//! A teacher opens a session that students join by short code; the engine
//! then runs repeated time-bounded confusion votes, side yes/no polls, and
//! a student question board with a broadcast slot, all under per-session
//! atomic updates so many polling clients can read and mutate concurrently.
//!
//! The crate is transport-agnostic: it exposes [`SessionEngine`] over a
//! pluggable [`SessionStore`] (in-process [`MemoryStore`] or shared
//! [`RedisStore`]) and leaves HTTP and rendering to its callers.

mod code;
mod error;
mod session;

pub mod engine;
pub mod store;

pub use code::{CODE_LEN, ParseCodeError, SessionCode};
pub use engine::{EngineConfig, SessionEngine};
pub use error::{EngineError, Rejection};
pub use session::{
    Broadcast, Choice, DEFAULT_QUESTION_CAPACITY, ParseChoiceError, ParseStatusError,
    PollSnapshot, QuestionView, Session, Status, StatusSnapshot, VoteCounts,
};
pub use store::{MemoryStore, RedisStore, SessionStore, StoreError};
