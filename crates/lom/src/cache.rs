use crate::Lmeta;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use volume::Mountpath;
use xxhash_rust::xxh3::xxh3_64;

/// Shards per mountpath cache. Shard selection uses the fingerprint's
/// low bits, so the count must stay a power of two.
pub const CACHE_SHARDS: usize = 16;

/// 64-bit fingerprint of an object uname.
#[inline]
pub fn fingerprint(uname: &str) -> u64 {
    xxh3_64(uname.as_bytes())
}

/// A cached metadata entry. The FQN rides along so the housekeeper can
/// flush dirty entries without re-resolving the object.
#[derive(Debug)]
pub struct CachedLom {
    pub fqn: PathBuf,
    pub md: Mutex<Lmeta>,
}

impl CachedLom {
    pub fn new(fqn: PathBuf, md: Lmeta) -> CachedLom {
        CachedLom {
            fqn,
            md: Mutex::new(md),
        }
    }
}

/// Shard-striped metadata cache of one mountpath. Hits clone an Arc
/// under a short-lived shard lock; misses go to the metadata store.
pub struct LomCache {
    shards: Vec<Mutex<HashMap<u64, Arc<CachedLom>>>>,
}

impl LomCache {
    pub fn new() -> LomCache {
        LomCache {
            shards: (0..CACHE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, fp: u64) -> &Mutex<HashMap<u64, Arc<CachedLom>>> {
        &self.shards[(fp as usize) & (CACHE_SHARDS - 1)]
    }

    pub fn get(&self, fp: u64) -> Option<Arc<CachedLom>> {
        self.shard(fp).lock().unwrap().get(&fp).cloned()
    }

    pub fn insert(&self, fp: u64, entry: Arc<CachedLom>) {
        self.shard(fp).lock().unwrap().insert(fp, entry);
    }

    pub fn remove(&self, fp: u64) -> Option<Arc<CachedLom>> {
        self.shard(fp).lock().unwrap().remove(&fp)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry, retaining those for which `keep` returns true.
    /// One shard is locked at a time.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(u64, &Arc<CachedLom>) -> bool,
    {
        for shard in &self.shards {
            shard.lock().unwrap().retain(|fp, entry| keep(*fp, entry));
        }
    }
}

impl Default for LomCache {
    fn default() -> Self {
        LomCache::new()
    }
}

/// The per-mountpath cache set. Mountpath add/remove keeps this map in
/// sync through the volume listener.
pub struct LomCaches {
    caches: RwLock<HashMap<PathBuf, Arc<LomCache>>>,
}

impl LomCaches {
    pub fn new(mpaths: &[Arc<Mountpath>]) -> Arc<LomCaches> {
        let caches = mpaths
            .iter()
            .map(|mp| (mp.path.clone(), Arc::new(LomCache::new())))
            .collect();
        Arc::new(LomCaches {
            caches: RwLock::new(caches),
        })
    }

    pub fn cache(&self, mpath: &Path) -> Option<Arc<LomCache>> {
        self.caches.read().unwrap().get(mpath).cloned()
    }

    pub fn all(&self) -> Vec<(PathBuf, Arc<LomCache>)> {
        self.caches
            .read()
            .unwrap()
            .iter()
            .map(|(p, c)| (p.clone(), c.clone()))
            .collect()
    }

    pub fn add_mountpath(&self, mpath: &Path) {
        self.caches
            .write()
            .unwrap()
            .entry(mpath.to_path_buf())
            .or_insert_with(|| Arc::new(LomCache::new()));
    }

    pub fn drop_mountpath(&self, mpath: &Path) {
        self.caches.write().unwrap().remove(mpath);
    }
}

impl volume::MountpathListener for LomCaches {
    fn mountpath_added(&self, mp: &Arc<Mountpath>) {
        self.add_mountpath(&mp.path);
    }

    fn mountpath_removed(&self, mp: &Arc<Mountpath>) {
        self.drop_mountpath(&mp.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let cache = LomCache::new();
        let fp = fingerprint("ais/b/o1");
        assert!(cache.get(fp).is_none());

        cache.insert(
            fp,
            Arc::new(CachedLom::new(PathBuf::from("/mp/ob/ais/b/o1"), Lmeta::default())),
        );
        assert_eq!(cache.len(), 1);
        assert!(cache.get(fp).is_some());

        cache.remove(fp);
        assert!(cache.is_empty());
    }

    #[test]
    fn retain_filters_across_shards() {
        let cache = LomCache::new();
        for i in 0..100 {
            let md = Lmeta {
                atime: i,
                ..Default::default()
            };
            cache.insert(
                fingerprint(&format!("ais/b/o{i}")),
                Arc::new(CachedLom::new(PathBuf::from(format!("/mp/o{i}")), md)),
            );
        }
        cache.retain(|_, e| e.md.lock().unwrap().atime >= 50);
        assert_eq!(cache.len(), 50);
    }
}
