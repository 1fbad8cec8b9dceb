//! Erasure-coding engine. Per EC-enabled bucket, three cooperating
//! xactions multiplex work across per-mountpath joggers and two
//! transport bundles:
//!
//! - [`XactPut`] encodes and cleans up (initiator side);
//! - [`XactGet`] restores objects from remote slices (initiator side);
//! - [`XactRespond`] serves slice requests arriving from peers.

pub mod encode;
pub mod jogger;
pub mod manager;
pub mod respond;
pub mod restore;
pub mod slice;
mod store;

pub use encode::XactPut;
pub use jogger::Joggers;
pub use manager::{EngineCx, Manager};
pub use respond::XactRespond;
pub use restore::XactGet;

use cluster::Cksum;
use serde::{Deserialize, Serialize};

/// Capacity of each per-mountpath work channel.
pub const REQUEST_BUF_FS: usize = 25;

/// Demand xactions stop after this long without requests.
pub const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(4 * 60);

/// How long a restore waits for enough slices before failing.
pub const RESTORE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Intra-cluster request actions carried in the frame opaque.
pub mod action {
    pub const PUT: u8 = 0;
    pub const GET: u8 = 1;
    pub const DELETE: u8 = 2;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("erasure coding is disabled for bucket {0}")]
    Disabled(String),
    #[error("not enough targets: have {have}, need {need}")]
    InsufficientTargets { have: usize, need: usize },
    #[error("cannot restore {uname}: {have} of {need} slices received")]
    NotEnoughSlices {
        uname: String,
        have: usize,
        need: usize,
    },
    #[error("restore of {0} timed out")]
    RestoreTimeout(String),
    #[error("erasure codec failed: {0}")]
    Codec(String),
    #[error("mountpath jogger for {0} is gone")]
    JoggerGone(std::path::PathBuf),
    #[error("xaction aborted")]
    Aborted,
    #[error(transparent)]
    Cluster(#[from] cluster::Error),
    #[error(transparent)]
    Volume(#[from] volume::Error),
    #[error(transparent)]
    Lom(#[from] lom::Error),
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Slice metadata, stored next to every slice and replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Md {
    pub obj_size: i64,
    pub data_slices: usize,
    pub parity_slices: usize,
    /// 1-based slice index; 0 denotes a full replica.
    pub slice_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_cksum: Option<Cksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_version: Option<String>,
}

impl Md {
    pub fn is_replica(&self) -> bool {
        self.slice_id == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ec metadata serializes")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Md> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Pack the intra-cluster request plus optional slice metadata into
/// the frame's opaque bytes.
pub(crate) fn pack_opaque(req: &transport::IntraReq, md: Option<&Md>) -> bytes::Bytes {
    use bytes::BufMut;
    let intra = req.pack();
    let md_bytes = md.map(|m| m.to_bytes()).unwrap_or_default();
    let mut buf = bytes::BytesMut::with_capacity(8 + intra.len() + md_bytes.len());
    buf.put_u32(intra.len() as u32);
    buf.put_slice(&intra);
    buf.put_u32(md_bytes.len() as u32);
    buf.put_slice(&md_bytes);
    buf.freeze()
}

pub(crate) fn unpack_opaque(raw: &[u8]) -> Result<(transport::IntraReq, Option<Md>)> {
    use bytes::Buf;
    let mut raw = raw;
    if raw.len() < 4 {
        return Err(Error::Codec("short opaque".to_string()));
    }
    let ilen = raw.get_u32() as usize;
    if raw.len() < ilen {
        return Err(Error::Codec("short intra-request".to_string()));
    }
    let req = transport::IntraReq::unpack(&raw[..ilen])?;
    raw.advance(ilen);
    if raw.len() < 4 {
        return Err(Error::Codec("short metadata length".to_string()));
    }
    let mlen = raw.get_u32() as usize;
    let md = if mlen == 0 {
        None
    } else {
        if raw.len() < mlen {
            return Err(Error::Codec("short metadata".to_string()));
        }
        Some(Md::from_bytes(&raw[..mlen])?)
    };
    Ok((req, md))
}

/// Name of the slice file of `obj_name`; slice 0 is the replica.
pub fn slice_name(obj_name: &str, slice_id: usize) -> String {
    format!("{obj_name}.s{slice_id}")
}

/// Inverse of [`slice_name`].
pub fn parse_slice_name(name: &str) -> Option<(&str, usize)> {
    let (base, suffix) = name.rsplit_once(".s")?;
    let id = suffix.parse().ok()?;
    Some((base, id))
}
