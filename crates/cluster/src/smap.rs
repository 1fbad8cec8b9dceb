use crate::bucket::{Bck, BckProps};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Proxy,
    Target,
}

/// A cluster member. The `digest` is derived from the node ID once at
/// construction and is therefore stable across processes and restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snode {
    pub id: String,
    pub kind: NodeKind,
    pub public_url: String,
    pub intra_control_url: String,
    pub intra_data_url: String,
    #[serde(skip)]
    digest: u64,
}

impl Snode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Snode {
        let id = id.into();
        let digest = xxh3_64(id.as_bytes());
        Snode {
            id,
            kind,
            public_url: String::new(),
            intra_control_url: String::new(),
            intra_data_url: String::new(),
            digest,
        }
    }

    pub fn digest(&self) -> u64 {
        // Deserialized nodes skip the digest field; recompute lazily.
        if self.digest != 0 {
            self.digest
        } else {
            xxh3_64(self.id.as_bytes())
        }
    }

    pub fn is_target(&self) -> bool {
        self.kind == NodeKind::Target
    }
}

/// Versioned cluster membership map. Distributed by the control
/// plane; never serialized by the target core itself.
#[derive(Debug, Clone, Default)]
pub struct Smap {
    pub version: i64,
    pub primary_id: String,
    pub proxies: BTreeMap<String, Arc<Snode>>,
    pub targets: BTreeMap<String, Arc<Snode>>,
}

impl Smap {
    pub fn new(version: i64) -> Smap {
        Smap {
            version,
            ..Default::default()
        }
    }

    pub fn add_target(&mut self, node: Snode) {
        debug_assert!(node.is_target());
        self.targets.insert(node.id.clone(), Arc::new(node));
    }

    pub fn add_proxy(&mut self, node: Snode) {
        self.proxies.insert(node.id.clone(), Arc::new(node));
    }

    pub fn count_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn count_proxies(&self) -> usize {
        self.proxies.len()
    }

    pub fn get_target(&self, id: &str) -> Option<&Arc<Snode>> {
        self.targets.get(id)
    }

    pub fn get_node(&self, id: &str) -> Option<&Arc<Snode>> {
        self.targets.get(id).or_else(|| self.proxies.get(id))
    }
}

/// Versioned bucket metadata: per-bucket properties keyed by uname.
#[derive(Debug, Clone, Default)]
pub struct Bmd {
    pub version: i64,
    buckets: HashMap<String, Arc<BckProps>>,
}

impl Bmd {
    pub fn new(version: i64) -> Bmd {
        Bmd {
            version,
            buckets: HashMap::new(),
        }
    }

    pub fn set(&mut self, bck: &Bck, props: BckProps) {
        self.buckets.insert(bck.uname(), Arc::new(props));
    }

    pub fn remove(&mut self, bck: &Bck) {
        self.buckets.remove(&bck.uname());
    }

    pub fn get(&self, bck: &Bck) -> Option<Arc<BckProps>> {
        self.buckets.get(&bck.uname()).cloned()
    }

    pub fn exists(&self, bck: &Bck) -> bool {
        self.buckets.contains_key(&bck.uname())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<BckProps>)> {
        self.buckets.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bucket::EcConf;

    #[test]
    fn snode_digest_stable() {
        let a = Snode::new("t[abcd1234]", NodeKind::Target);
        let b = Snode::new("t[abcd1234]", NodeKind::Target);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(
            a.digest(),
            Snode::new("t[abcd1235]", NodeKind::Target).digest()
        );

        // A deserialized node (digest skipped) recomputes the same value.
        let json = serde_json::to_string(&a).unwrap();
        let c: Snode = serde_json::from_str(&json).unwrap();
        assert_eq!(c.digest(), a.digest());
    }

    #[test]
    fn bmd_versioned_lookup() {
        let mut bmd = Bmd::new(1);
        let bck = Bck::ais("imgs");
        assert!(!bmd.exists(&bck));

        bmd.set(
            &bck,
            BckProps {
                ec: EcConf {
                    enabled: true,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        assert!(bmd.exists(&bck));
        assert!(bmd.get(&bck).unwrap().ec.enabled);

        bmd.remove(&bck);
        assert!(bmd.get(&bck).is_none());
    }
}
