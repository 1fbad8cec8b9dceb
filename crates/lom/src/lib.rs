//! Local object metadata (LOM): the target-side representation of one
//! object, its persistence to extended attributes, a sharded in-memory
//! cache, and the housekeeper that shrinks the cache under memory
//! pressure.

pub mod cache;
pub mod housekeep;
mod meta;

pub use cache::{fingerprint, CachedLom, LomCache, LomCaches, CACHE_SHARDS};
pub use housekeep::{Housekeeper, RunStats};
pub use meta::{MemStore, MetaStore, XattrStore, LOM_XATTR};

use cluster::{Bck, Cksum, CksumType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use volume::{content, Mountpath, Vol, CT_OBJ};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object {0} does not exist")]
    NotFound(String),
    #[error(transparent)]
    Cluster(#[from] cluster::Error),
    #[error(transparent)]
    Volume(#[from] volume::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt object metadata for {uname}: {source}")]
    CorruptMeta {
        uname: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Object attributes as cached in memory and persisted to xattrs.
///
/// `atime` is the in-memory access time; `atimefs` mirrors what was
/// last persisted. The two may diverge: an entry is dirty iff
/// `atime > 0 && atime != atimefs`. A negative `atime` marks an object
/// that was prefetched but never accessed; its absolute value is the
/// prefetch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lmeta {
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cksum: Option<Cksum>,
    pub atime: i64,
    #[serde(skip)]
    pub atimefs: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl Lmeta {
    pub fn is_dirty(&self) -> bool {
        self.atime > 0 && self.atime != self.atimefs
    }

    /// Access time normalized for comparisons: prefetched-never-accessed
    /// entries carry a negative atime.
    pub fn atime_normalized(&self) -> i64 {
        self.atime.abs()
    }
}

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// A fully resolved object handle: identity, on-disk location, and
/// cached metadata.
#[derive(Debug, Clone)]
pub struct Lom {
    pub bck: Bck,
    pub obj_name: String,
    pub uname: String,
    pub fqn: PathBuf,
    pub mpath: Arc<Mountpath>,
    pub md: Lmeta,
}

impl Lom {
    /// Resolve the object's mountpath by HRW and derive its FQN.
    pub fn init(bck: Bck, obj_name: impl Into<String>, vol: &Vol) -> Result<Lom> {
        let obj_name = obj_name.into();
        let uname = bck.make_uname(&obj_name);
        let mpath = vol.hrw_mountpath(&uname)?;
        let fqn = content::fqn(&mpath.path, CT_OBJ, &bck, &obj_name);
        Ok(Lom {
            bck,
            obj_name,
            uname,
            fqn,
            mpath,
            md: Lmeta::default(),
        })
    }

    pub fn fingerprint(&self) -> u64 {
        cache::fingerprint(&self.uname)
    }

    /// Load metadata: cache first, then the persistent store.
    pub fn load(&mut self, caches: &LomCaches, store: &dyn MetaStore) -> Result<()> {
        let cache = caches.cache(&self.mpath.path);
        if let Some(cached) = cache.and_then(|c| c.get(self.fingerprint())) {
            self.md = cached.md.lock().unwrap().clone();
            return Ok(());
        }

        let raw = store
            .read(&self.fqn)?
            .ok_or_else(|| Error::NotFound(self.uname.clone()))?;
        let mut md: Lmeta = serde_json::from_slice(&raw).map_err(|source| Error::CorruptMeta {
            uname: self.uname.clone(),
            source,
        })?;
        md.atimefs = md.atime;
        self.md = md;

        if let Some(cache) = caches.cache(&self.mpath.path) {
            cache.insert(
                self.fingerprint(),
                Arc::new(CachedLom::new(self.fqn.clone(), self.md.clone())),
            );
        }
        Ok(())
    }

    /// Persist metadata to the store and refresh the cache entry.
    pub fn persist(&mut self, caches: &LomCaches, store: &dyn MetaStore) -> Result<()> {
        store.write(&self.fqn, &serde_json::to_vec(&self.md).expect("lmeta serializes"))?;
        self.md.atimefs = self.md.atime;
        if let Some(cache) = caches.cache(&self.mpath.path) {
            cache.insert(
                self.fingerprint(),
                Arc::new(CachedLom::new(self.fqn.clone(), self.md.clone())),
            );
        }
        Ok(())
    }

    /// Verify the given content against bucket checksum policy, filling
    /// `md.cksum` on first sight.
    pub fn verify_or_set_cksum(&mut self, data: &[u8], ty: CksumType) -> Result<()> {
        match &self.md.cksum {
            Some(have) => have.verify(data).map_err(Error::Cluster),
            None => {
                self.md.cksum = Cksum::compute(ty, data);
                Ok(())
            }
        }
    }

    pub fn touch(&mut self) {
        self.md.atime = now_ns();
    }
}
