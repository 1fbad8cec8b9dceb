pub mod bucket;
pub mod cksum;
pub mod hrw;
pub mod smap;

pub use bucket::{AccessAttrs, Bck, BckAccess, BckProps, EcConf, MirrorConf, Ns, Provider};
pub use cksum::{Cksum, CksumType};
pub use smap::{Bmd, NodeKind, Smap, Snode};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid provider: '{0}'")]
    InvalidProvider(String),
    #[error("cluster map has no registered targets")]
    NoTargets,
    #[error("bucket '{0}' does not exist")]
    BckNotFound(String),
    #[error("BAD DATA CHECKSUM: {ty}({given} != {computed})")]
    BadCksum {
        ty: CksumType,
        given: String,
        computed: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
