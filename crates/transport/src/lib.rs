//! Target-to-target transport: framed messages over per-node streams,
//! grouped into bundles that track cluster membership.
//!
//! Wire format of one frame:
//! `{u32 header-length, header bytes, u32 payload-length, payload bytes}`.
//! A payload length of `u32::MAX` means "no payload". The top bit of
//! the header length flags an LZ4-frame-compressed payload.

mod bundle;
mod frame;
mod stream;

pub use bundle::{Bundle, Dialer};
pub use frame::{FrameCodec, Header, IntraReq, Msg, ObjAttrs, NO_PAYLOAD};
pub use stream::{serve, RecvHandler, SendArg, SendCallback, Stream};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream to {0} is closed")]
    StreamClosed(String),
    #[error("no stream to node {0}")]
    NoStream(String),
    #[error("malformed frame: {0}")]
    Frame(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
