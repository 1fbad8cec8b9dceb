use crate::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Extended attribute holding the serialized [`crate::Lmeta`] record.
pub const LOM_XATTR: &str = "user.shoal.lom";

/// Persistence backend for object metadata. Production uses xattrs;
/// tests substitute an in-memory store.
pub trait MetaStore: Send + Sync {
    /// `Ok(None)` when the object has no metadata (or no file).
    fn read(&self, fqn: &Path) -> Result<Option<Vec<u8>>>;
    fn write(&self, fqn: &Path, raw: &[u8]) -> Result<()>;
    fn remove(&self, fqn: &Path) -> Result<()>;
}

/// Metadata in the `user.` xattr namespace of the object file itself.
#[derive(Debug, Default)]
pub struct XattrStore;

impl MetaStore for XattrStore {
    fn read(&self, fqn: &Path) -> Result<Option<Vec<u8>>> {
        match xattr::get(fqn, LOM_XATTR) {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, fqn: &Path, raw: &[u8]) -> Result<()> {
        xattr::set(fqn, LOM_XATTR, raw)?;
        Ok(())
    }

    fn remove(&self, fqn: &Path) -> Result<()> {
        match xattr::remove(fqn, LOM_XATTR) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and for filesystems without xattr support.
#[derive(Debug, Default)]
pub struct MemStore {
    entries: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemStore {
    pub fn writes(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn get(&self, fqn: &Path) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(fqn).cloned()
    }
}

impl MetaStore for MemStore {
    fn read(&self, fqn: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(fqn).cloned())
    }

    fn write(&self, fqn: &Path, raw: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(fqn.to_path_buf(), raw.to_vec());
        Ok(())
    }

    fn remove(&self, fqn: &Path) -> Result<()> {
        self.entries.lock().unwrap().remove(fqn);
        Ok(())
    }
}
