use crate::vmd::{self, Vmd};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use xxhash_rust::xxh3::xxh3_64;

/// A local filesystem root managed by this target, together with the
/// identity of its backing filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountpath {
    pub path: PathBuf,
    /// Device the mountpath resides on, e.g. "/dev/nvme0n1".
    pub fs: String,
    pub fs_type: String,
    pub fs_id: u64,
    digest: u64,
}

impl Mountpath {
    pub fn resolve(path: impl Into<PathBuf>) -> Result<Mountpath> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("mountpath {} is not a directory", path.display()),
            )));
        }
        let (fs, fs_type) = fs_info(&path);
        let fs_id = statvfs_fsid(&path)?;
        Ok(Mountpath::new(path, fs, fs_type, fs_id))
    }

    pub fn new(path: PathBuf, fs: String, fs_type: String, fs_id: u64) -> Mountpath {
        let digest = xxh3_64(path.as_os_str().as_encoded_bytes());
        Mountpath {
            path,
            fs,
            fs_type,
            fs_id,
            digest,
        }
    }

    /// HRW digest of this mountpath, stable across restarts.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    #[doc(hidden)]
    pub fn for_tests(path: &str) -> Mountpath {
        Mountpath::new(PathBuf::from(path), "testdev".into(), "tmpfs".into(), 1)
    }
}

/// Longest-prefix match of `path` against `/proc/mounts`.
fn fs_info(path: &Path) -> (String, String) {
    let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
    let mut best: Option<(&str, &str, usize)> = None;
    for line in mounts.lines() {
        let mut it = line.split_whitespace();
        let (Some(dev), Some(mnt), Some(ty)) = (it.next(), it.next(), it.next()) else {
            continue;
        };
        if path.starts_with(mnt) {
            let len = mnt.len();
            if best.map_or(true, |(_, _, l)| len > l) {
                best = Some((dev, ty, len));
            }
        }
    }
    match best {
        Some((dev, ty, _)) => (dev.to_string(), ty.to_string()),
        None => ("unknown".to_string(), "unknown".to_string()),
    }
}

fn statvfs_fsid(path: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidFqn(path.to_path_buf()))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(st.f_fsid as u64)
}

/// Observer of mountpath membership changes. EC and rebalance register
/// listeners so they can add or drop per-mountpath joggers.
pub trait MountpathListener: Send + Sync {
    fn mountpath_added(&self, mp: &Arc<Mountpath>);
    fn mountpath_removed(&self, mp: &Arc<Mountpath>);
}

#[derive(Default)]
struct VolState {
    available: BTreeMap<PathBuf, Arc<Mountpath>>,
    disabled: BTreeMap<PathBuf, Arc<Mountpath>>,
    version: u64,
}

impl VolState {
    fn to_vmd(&self, daemon_id: &str) -> Vmd {
        let mut v = Vmd::new(self.version, daemon_id);
        for mp in self.available.values() {
            v.add(mp, true);
        }
        for mp in self.disabled.values() {
            v.add(mp, false);
        }
        v
    }

    fn all_paths(&self) -> Vec<PathBuf> {
        self.available
            .keys()
            .chain(self.disabled.keys())
            .cloned()
            .collect()
    }
}

/// Vol owns the mountpath index (MPI) of a target process. Ownership
/// is exclusive per process, recorded durably in the VMD.
pub struct Vol {
    daemon_id: String,
    state: RwLock<VolState>,
    listeners: Mutex<Vec<Arc<dyn MountpathListener>>>,
}

impl Vol {
    /// Bring up the volume from `paths`. An existing VMD is loaded and
    /// reconciled; integrity errors are fatal by design (the caller is
    /// expected to refuse to run).
    pub fn init(daemon_id: impl Into<String>, mpaths: Vec<Mountpath>) -> Result<Arc<Vol>> {
        let daemon_id = daemon_id.into();
        if mpaths.is_empty() {
            return Err(Error::NoMountpaths);
        }
        for (i, a) in mpaths.iter().enumerate() {
            for b in &mpaths[i + 1..] {
                if a.path == b.path {
                    return Err(Error::MpathExists(a.path.clone()));
                }
                check_nesting(&a.path, &b.path)?;
            }
        }

        let paths: Vec<PathBuf> = mpaths.iter().map(|m| m.path.clone()).collect();
        let loaded = vmd::load_all(&paths, &daemon_id)?;

        let mut state = VolState::default();
        match loaded {
            Some(v) => {
                state.version = v.version;
                for mp in mpaths {
                    let enabled = v.enabled(&mp.path).unwrap_or(true);
                    let mp = Arc::new(mp);
                    if enabled {
                        state.available.insert(mp.path.clone(), mp);
                    } else {
                        state.disabled.insert(mp.path.clone(), mp);
                    }
                }
            }
            None => {
                state.version = 1;
                for mp in mpaths {
                    let mp = Arc::new(mp);
                    state.available.insert(mp.path.clone(), mp);
                }
            }
        }

        let vol = Arc::new(Vol {
            daemon_id,
            state: RwLock::new(state),
            listeners: Mutex::new(Vec::new()),
        });
        vol.persist_locked(&vol.state.read().unwrap())?;
        Ok(vol)
    }

    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    pub fn subscribe(&self, l: Arc<dyn MountpathListener>) {
        self.listeners.lock().unwrap().push(l);
    }

    /// Snapshot of the available mountpaths.
    pub fn mpi(&self) -> Vec<Arc<Mountpath>> {
        self.state
            .read()
            .unwrap()
            .available
            .values()
            .cloned()
            .collect()
    }

    pub fn num_available(&self) -> usize {
        self.state.read().unwrap().available.len()
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Mountpath>> {
        self.state.read().unwrap().available.get(path).cloned()
    }

    /// Register a new mountpath: validate, persist a bumped VMD, then
    /// notify listeners so they spawn joggers for it.
    pub fn add(&self, mp: Mountpath) -> Result<Arc<Mountpath>> {
        let mp = Arc::new(mp);
        {
            let mut state = self.state.write().unwrap();
            if state.available.contains_key(&mp.path) || state.disabled.contains_key(&mp.path) {
                return Err(Error::MpathExists(mp.path.clone()));
            }
            for existing in state.available.keys().chain(state.disabled.keys()) {
                check_nesting(existing, &mp.path)?;
            }
            state.available.insert(mp.path.clone(), mp.clone());
            state.version += 1;
            self.persist_locked(&state)?;
        }
        tracing::info!(mpath = %mp.path.display(), "mountpath added");
        for l in self.listeners.lock().unwrap().iter() {
            l.mountpath_added(&mp);
        }
        Ok(mp)
    }

    /// Drop a mountpath. Listeners stop and remove its joggers.
    pub fn remove(&self, path: &Path) -> Result<Arc<Mountpath>> {
        let mp = {
            let mut state = self.state.write().unwrap();
            let mp = state
                .available
                .remove(path)
                .or_else(|| state.disabled.remove(path))
                .ok_or_else(|| Error::MpathMissing(path.to_path_buf()))?;
            state.version += 1;
            self.persist_locked(&state)?;
            mp
        };
        tracing::info!(mpath = %path.display(), "mountpath removed");
        for l in self.listeners.lock().unwrap().iter() {
            l.mountpath_removed(&mp);
        }
        Ok(mp)
    }

    /// Disable keeps the mountpath in the VMD but takes it out of
    /// placement; listeners treat it like a removal.
    pub fn disable(&self, path: &Path) -> Result<Arc<Mountpath>> {
        let mp = {
            let mut state = self.state.write().unwrap();
            let mp = state
                .available
                .remove(path)
                .ok_or_else(|| Error::MpathMissing(path.to_path_buf()))?;
            state.disabled.insert(mp.path.clone(), mp.clone());
            state.version += 1;
            self.persist_locked(&state)?;
            mp
        };
        tracing::info!(mpath = %path.display(), "mountpath disabled");
        for l in self.listeners.lock().unwrap().iter() {
            l.mountpath_removed(&mp);
        }
        Ok(mp)
    }

    pub fn enable(&self, path: &Path) -> Result<Arc<Mountpath>> {
        let mp = {
            let mut state = self.state.write().unwrap();
            let mp = state
                .disabled
                .remove(path)
                .ok_or_else(|| Error::MpathMissing(path.to_path_buf()))?;
            state.available.insert(mp.path.clone(), mp.clone());
            state.version += 1;
            self.persist_locked(&state)?;
            mp
        };
        tracing::info!(mpath = %path.display(), "mountpath enabled");
        for l in self.listeners.lock().unwrap().iter() {
            l.mountpath_added(&mp);
        }
        Ok(mp)
    }

    /// Select the mountpath owning `uname` by HRW over path digests.
    pub fn hrw_mountpath(&self, uname: &str) -> Result<Arc<Mountpath>> {
        let state = self.state.read().unwrap();
        state
            .available
            .values()
            .max_by(|a, b| {
                cluster::hrw::weight(uname, a.digest())
                    .cmp(&cluster::hrw::weight(uname, b.digest()))
                    .then_with(|| b.path.cmp(&a.path))
            })
            .cloned()
            .ok_or(Error::NoMountpaths)
    }

    fn persist_locked(&self, state: &VolState) -> Result<()> {
        let v = state.to_vmd(&self.daemon_id);
        vmd::persist(&v, &state.all_paths())
    }
}

fn check_nesting(a: &Path, b: &Path) -> Result<()> {
    if b.starts_with(a) {
        return Err(Error::MpathNested {
            parent: a.to_path_buf(),
            child: b.to_path_buf(),
        });
    }
    if a.starts_with(b) {
        return Err(Error::MpathNested {
            parent: b.to_path_buf(),
            child: a.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mk(dir: &tempfile::TempDir, name: &str) -> Mountpath {
        let p = dir.path().join(name);
        std::fs::create_dir_all(&p).unwrap();
        Mountpath::new(p, "dev".into(), "ext4".into(), 7)
    }

    struct CountingListener {
        added: AtomicUsize,
        removed: AtomicUsize,
    }
    impl MountpathListener for CountingListener {
        fn mountpath_added(&self, _: &Arc<Mountpath>) {
            self.added.fetch_add(1, Ordering::Relaxed);
        }
        fn mountpath_removed(&self, _: &Arc<Mountpath>) {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn add_remove_notify() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Vol::init("t1", vec![mk(&dir, "mp1"), mk(&dir, "mp2")]).unwrap();

        let listener = Arc::new(CountingListener {
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        });
        vol.subscribe(listener.clone());

        let mp3 = vol.add(mk(&dir, "mp3")).unwrap();
        assert_eq!(vol.num_available(), 3);
        assert_eq!(listener.added.load(Ordering::Relaxed), 1);

        vol.remove(&mp3.path).unwrap();
        assert_eq!(vol.num_available(), 2);
        assert_eq!(listener.removed.load(Ordering::Relaxed), 1);

        // Duplicate registration is rejected.
        assert!(matches!(
            vol.add(mk(&dir, "mp1")),
            Err(Error::MpathExists(_))
        ));
    }

    #[test]
    fn nested_mountpaths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let parent = mk(&dir, "mp1");
        let child_path = dir.path().join("mp1/nested");
        std::fs::create_dir_all(&child_path).unwrap();
        let child = Mountpath::new(child_path, "dev".into(), "ext4".into(), 7);

        assert!(matches!(
            Vol::init("t1", vec![parent, child]),
            Err(Error::MpathNested { .. })
        ));
    }

    #[test]
    fn disable_enable_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mp1 = mk(&dir, "mp1");
        let p1 = mp1.path.clone();
        let vol = Vol::init("t1", vec![mp1, mk(&dir, "mp2")]).unwrap();

        vol.disable(&p1).unwrap();
        assert_eq!(vol.num_available(), 1);
        assert!(vol.get(&p1).is_none());

        vol.enable(&p1).unwrap();
        assert_eq!(vol.num_available(), 2);
        assert!(vol.get(&p1).is_some());
    }

    #[test]
    fn hrw_mountpath_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Vol::init("t1", vec![mk(&dir, "mp1"), mk(&dir, "mp2"), mk(&dir, "mp3")]).unwrap();

        let first = vol.hrw_mountpath("ais/b/o1").unwrap();
        for _ in 0..5 {
            assert_eq!(vol.hrw_mountpath("ais/b/o1").unwrap().path, first.path);
        }
    }
}
