//! Volume metadata: a versioned, checksummed record of every mountpath
//! this daemon owns, replicated to up to [`VMD_COPIES`] mountpaths.
//!
//! On-disk layout: an 8-byte little-endian xxh3-64 of the JSON payload,
//! followed by the payload itself. Files are immutable once written;
//! updates go to a temp file which is fsynced and renamed into place.

use crate::mpath::Mountpath;
use crate::{Error, Result, SIE_DAEMON_ID, SIE_VMD_MISMATCH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

pub const VMD_FNAME: &str = ".shoal.vmd";
pub const VMD_COPIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmdMountpath {
    pub enabled: bool,
    pub fs: String,
    pub fs_type: String,
    pub fs_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vmd {
    pub version: u64,
    pub daemon_id: String,
    pub mountpaths: BTreeMap<PathBuf, VmdMountpath>,
}

impl Vmd {
    pub fn new(version: u64, daemon_id: &str) -> Vmd {
        Vmd {
            version,
            daemon_id: daemon_id.to_string(),
            mountpaths: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, mp: &Mountpath, enabled: bool) {
        self.mountpaths.insert(
            mp.path.clone(),
            VmdMountpath {
                enabled,
                fs: mp.fs.clone(),
                fs_type: mp.fs_type.clone(),
                fs_id: mp.fs_id,
            },
        );
    }

    pub fn enabled(&self, path: &Path) -> Option<bool> {
        self.mountpaths.get(path).map(|m| m.enabled)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&xxh3_64(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn decode(raw: &[u8]) -> Result<(Vmd, u64)> {
        if raw.len() < 8 {
            return Err(Error::StorageIntegrity {
                code: SIE_VMD_MISMATCH,
                detail: "vmd file truncated".to_string(),
            });
        }
        let (sum_bytes, payload) = raw.split_at(8);
        let want = u64::from_le_bytes(sum_bytes.try_into().unwrap());
        let got = xxh3_64(payload);
        if got != want {
            return Err(Error::StorageIntegrity {
                code: SIE_VMD_MISMATCH,
                detail: format!("vmd checksum mismatch: {got:x} != {want:x}"),
            });
        }
        Ok((serde_json::from_slice(payload)?, want))
    }
}

/// Read one VMD replica. `Ok(None)` when the file does not exist.
pub fn load(mpath: &Path) -> Result<Option<(Vmd, u64)>> {
    let file = mpath.join(VMD_FNAME);
    let raw = match std::fs::read(&file) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Vmd::decode(&raw).map(Some)
}

/// Load and reconcile VMD replicas from all `mpaths`:
/// the newest version wins; replicas sharing the newest version must be
/// byte-identical; every replica must agree on the daemon ID.
/// `Ok(None)` when no mountpath holds a VMD (first start).
pub fn load_all(mpaths: &[PathBuf], daemon_id: &str) -> Result<Option<Vmd>> {
    let mut newest: Option<(Vmd, u64)> = None;

    for mpath in mpaths {
        let Some((vmd, cksum)) = load(mpath)? else {
            continue;
        };
        if vmd.daemon_id != daemon_id {
            return Err(Error::StorageIntegrity {
                code: SIE_DAEMON_ID,
                detail: format!(
                    "vmd on {} belongs to daemon {}, expected {}",
                    mpath.display(),
                    vmd.daemon_id,
                    daemon_id
                ),
            });
        }
        match &newest {
            None => newest = Some((vmd, cksum)),
            Some((best, best_cksum)) => {
                if vmd.version > best.version {
                    newest = Some((vmd, cksum));
                } else if vmd.version == best.version && cksum != *best_cksum {
                    return Err(Error::StorageIntegrity {
                        code: SIE_VMD_MISMATCH,
                        detail: format!(
                            "vmd replicas disagree at version {}: {} vs {:x}",
                            best.version,
                            mpath.display(),
                            best_cksum,
                        ),
                    });
                }
            }
        }
    }
    Ok(newest.map(|(v, _)| v))
}

/// Persist `vmd` to up to [`VMD_COPIES`] of the given mountpaths.
/// Partial failure is tolerated while at least one copy lands; each
/// failed copy is logged with its mountpath.
pub fn persist(vmd: &Vmd, mpaths: &[PathBuf]) -> Result<()> {
    if mpaths.is_empty() {
        return Err(Error::NoMountpaths);
    }
    let encoded = vmd.encode()?;

    let mut persisted = 0;
    for mpath in mpaths.iter().take(VMD_COPIES) {
        match write_one(mpath, &encoded) {
            Ok(()) => persisted += 1,
            Err(err) => {
                tracing::warn!(mpath = %mpath.display(), %err, "failed to persist vmd copy");
            }
        }
    }
    if persisted == 0 {
        return Err(Error::NoMountpaths);
    }
    tracing::debug!(version = vmd.version, copies = persisted, "persisted vmd");
    Ok(())
}

fn write_one(mpath: &Path, encoded: &[u8]) -> Result<()> {
    let tmp = mpath.join(format!("{VMD_FNAME}.tmp.{:x}", std::process::id()));
    let dst = mpath.join(VMD_FNAME);
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(encoded)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, &dst)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn mpaths(dir: &tempfile::TempDir, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let p = dir.path().join(format!("mp{i}"));
                std::fs::create_dir_all(&p).unwrap();
                p
            })
            .collect()
    }

    fn vmd_with(version: u64, daemon_id: &str, paths: &[PathBuf]) -> Vmd {
        let mut v = Vmd::new(version, daemon_id);
        for p in paths {
            v.add(
                &Mountpath::new(p.clone(), "dev".into(), "ext4".into(), 1),
                true,
            );
        }
        v
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = mpaths(&dir, 2);
        let v = vmd_with(3, "t1", &paths);

        persist(&v, &paths).unwrap();
        let loaded = load_all(&paths, "t1").unwrap().unwrap();
        assert_eq!(loaded, v);
    }

    #[test]
    fn newest_version_wins() {
        let dir = tempfile::tempdir().unwrap();
        let paths = mpaths(&dir, 3);

        persist(&vmd_with(4, "t1", &paths), &paths).unwrap();
        // One mountpath falls behind with an older version.
        let old = vmd_with(3, "t1", &paths);
        write_one(&paths[2], &old.encode().unwrap()).unwrap();

        let loaded = load_all(&paths, "t1").unwrap().unwrap();
        assert_eq!(loaded.version, 4);
    }

    #[test]
    fn same_version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = mpaths(&dir, 2);

        let mut a = vmd_with(5, "t1", &paths[..1]);
        persist(&a, &paths[..1]).unwrap();
        // Same version, different contents, on the second mountpath.
        a.mountpaths
            .get_mut(&paths[0])
            .map(|m| m.enabled = false)
            .unwrap();
        write_one(&paths[1], &a.encode().unwrap()).unwrap();

        let err = load_all(&paths, "t1").unwrap_err();
        match err {
            Error::StorageIntegrity { code, .. } => assert_eq!(code, SIE_VMD_MISMATCH),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn daemon_id_disagreement_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = mpaths(&dir, 1);
        persist(&vmd_with(1, "other-daemon", &paths), &paths).unwrap();

        let err = load_all(&paths, "t1").unwrap_err();
        match err {
            Error::StorageIntegrity { code, .. } => assert_eq!(code, SIE_DAEMON_ID),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn corrupt_checksum_detected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = mpaths(&dir, 1);
        persist(&vmd_with(1, "t1", &paths), &paths).unwrap();

        // Flip one payload byte in place.
        let file = paths[0].join(VMD_FNAME);
        let mut raw = std::fs::read(&file).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&file, raw).unwrap();

        assert!(matches!(
            load_all(&paths, "t1"),
            Err(Error::StorageIntegrity { .. })
        ));
    }

    #[test]
    fn persist_needs_at_least_one_copy() {
        let v = vmd_with(1, "t1", &[]);
        assert!(matches!(persist(&v, &[]), Err(Error::NoMountpaths)));
    }
}
