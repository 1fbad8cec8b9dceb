//! Local volume management: mountpaths owned by this target, the
//! replicated volume metadata (VMD) that records their identity and
//! enabled state, and the content-type registry that classifies every
//! on-disk path.

pub mod content;
pub mod mpath;
pub mod vmd;

pub use content::{ContentInfo, ContentSpecs, Perms, CT_DSORT, CT_EC, CT_OBJ, CT_WORK};
pub use mpath::{Mountpath, MountpathListener, Vol};
pub use vmd::{Vmd, VMD_COPIES, VMD_FNAME};

use std::path::PathBuf;

// Stable operator-facing codes for storage-integrity failures.
pub const SIE_VMD_MISMATCH: u32 = 10;
pub const SIE_DAEMON_ID: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mountpath {0} is already registered")]
    MpathExists(PathBuf),
    #[error("mountpath {0} is not registered")]
    MpathMissing(PathBuf),
    #[error("mountpath {child} is nested within mountpath {parent}")]
    MpathNested { parent: PathBuf, child: PathBuf },
    #[error("no mountpaths available")]
    NoMountpaths,
    #[error("storage integrity error sie#{code}: {detail} (see docs/troubleshooting)")]
    StorageIntegrity { code: u32, detail: String },
    #[error("invalid fqn {0}")]
    InvalidFqn(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
