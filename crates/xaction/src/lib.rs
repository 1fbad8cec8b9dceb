//! Extended actions ("xactions"): long-running background activities
//! with a lifecycle, stats, and a process-wide registry enforcing
//! at-most-one running instance per (kind, bucket).

mod base;
pub mod demand;
pub mod registry;
pub mod rename;

pub use base::{Kind, Snapshot, State, Xact, XactBase, XactStats};
pub use demand::XactDemand;
pub use registry::{Filter, Registry, RenewDecision, RenewResult, XactProvider};
pub use rename::{MoveBckArgs, MoveBckProvider, MoveBckXact, Phase};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("xaction {kind} is already running on bucket {bck}")]
    AlreadyRunning { kind: Kind, bck: String },
    #[error("cannot commit rename {got_from} => {got_to}: expected {want_from} => {want_to}")]
    RenameMismatch {
        got_from: String,
        got_to: String,
        want_from: String,
        want_to: String,
    },
    #[error("xaction {0} was aborted")]
    Aborted(String),
    #[error("{0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
