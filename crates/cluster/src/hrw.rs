//! Highest-random-weight (rendezvous) placement.
//!
//! For a fixed Smap version the mapping from object uname to the ordered
//! target list is deterministic and position-stable: removing one target
//! only displaces the keys that hashed to it.

use crate::smap::{Smap, Snode};
use crate::{Error, Result};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Combined weight of a (key, node) pair. The node digest seeds the key
/// hash so that per-node weights are independent.
#[inline]
pub fn weight(uname: &str, node_digest: u64) -> u64 {
    xxh3_64_with_seed(uname.as_bytes(), node_digest)
}

/// The primary owner of `uname`: the target with the highest weight.
pub fn hrw_target<'a>(uname: &str, smap: &'a Smap) -> Result<&'a Arc<Snode>> {
    smap.targets
        .values()
        .max_by(|a, b| {
            weight(uname, a.digest())
                .cmp(&weight(uname, b.digest()))
                // Ties break toward the lexicographically smaller id.
                .then_with(|| b.id.cmp(&a.id))
        })
        .ok_or(Error::NoTargets)
}

/// The first `count` targets by descending weight. The first element is
/// the primary owner; the rest are EC/replica peers. Asking for more
/// targets than exist returns all of them.
pub fn hrw_targets<'a>(uname: &str, smap: &'a Smap, count: usize) -> Result<Vec<&'a Arc<Snode>>> {
    if smap.targets.is_empty() {
        return Err(Error::NoTargets);
    }
    let mut nodes: Vec<&Arc<Snode>> = smap.targets.values().collect();
    nodes.sort_by(|a, b| {
        weight(uname, b.digest())
            .cmp(&weight(uname, a.digest()))
            .then_with(|| a.id.cmp(&b.id))
    });
    nodes.truncate(count);
    Ok(nodes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::smap::NodeKind;

    fn make_smap(n: usize) -> Smap {
        let mut smap = Smap::new(1);
        for i in 0..n {
            smap.add_target(Snode::new(format!("t{:02}", i), NodeKind::Target));
        }
        smap
    }

    #[test]
    fn deterministic_and_position_stable() {
        let smap = make_smap(8);
        for key in ["ais/b/obj1", "ais/b/obj2", "aws/b2/deep/path/x.tar"] {
            let first = hrw_targets(key, &smap, 4).unwrap();
            for _ in 0..10 {
                let again = hrw_targets(key, &smap, 4).unwrap();
                let ids: Vec<_> = again.iter().map(|n| &n.id).collect();
                let want: Vec<_> = first.iter().map(|n| &n.id).collect();
                assert_eq!(ids, want);
            }
            assert_eq!(
                hrw_target(key, &smap).unwrap().id,
                first[0].id,
                "primary must be the head of the ordered list"
            );
        }
    }

    #[test]
    fn removal_displaces_only_owned_keys() {
        let smap = make_smap(8);
        let mut smaller = smap.clone();
        smaller.targets.remove("t03");
        smaller.version += 1;

        let mut moved = 0usize;
        let total = 1000usize;
        for i in 0..total {
            let key = format!("ais/bench/obj-{:04}", i);
            let before = hrw_target(&key, &smap).unwrap();
            let after = hrw_target(&key, &smaller).unwrap();
            if before.id == "t03" {
                moved += 1; // owner is gone; key must move
                assert_ne!(after.id, "t03");
            } else {
                // Keys not owned by the removed target keep their primary.
                assert_eq!(before.id, after.id);
            }
        }
        // Roughly 1/8 of the keys lived on t03.
        assert!(moved > total / 16 && moved < total / 4, "moved={moved}");
    }

    #[test]
    fn k_larger_than_target_count() {
        let smap = make_smap(3);
        let nodes = hrw_targets("ais/b/o", &smap, 10).unwrap();
        assert_eq!(nodes.len(), 3);

        let empty = Smap::new(1);
        assert!(hrw_target("ais/b/o", &empty).is_err());
    }
}
