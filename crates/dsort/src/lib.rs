//! Distributed-sort core: the records graph, tar-family shard readers
//! and writers, and the memory watcher that spills in-memory record
//! payloads to disk (or back to the source archive) when the job
//! approaches its memory budget.

pub mod records;
pub mod shard;
pub mod tar;
pub mod watcher;

pub use records::{Record, RecordObj, Records, StoreKind};
pub use shard::{plan_shards, rw_for, ExtractCx, Shard, ShardRW, TarLz4Rw, TarRw, TgzRw};
pub use tar::{padded_size, TarHeader, BLOCK};
pub use watcher::{unreserve_channel, Contents, Watcher, UNRESERVE_BUF};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported shard format: {0}")]
    UnknownFormat(String),
    #[error("malformed tar archive: {0}")]
    Tar(&'static str),
    #[error("record {0} has no loadable content")]
    NoContent(String),
    #[error("job aborted")]
    Aborted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
