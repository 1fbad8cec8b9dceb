//! Slice persistence. Slices and their metadata land through the
//! workfile convention: write to a `wk` path, fsync, rename into the
//! final `ec` path, so a crash never leaves a partial slice visible.

use crate::{slice_name, Md, Result};
use cluster::Bck;
use std::path::{Path, PathBuf};
use volume::{content, ContentSpecs, Vol, CT_EC, CT_WORK};

const MD_SUFFIX: &str = ".md";

pub(crate) fn slice_fqn(vol: &Vol, bck: &Bck, obj_name: &str, slice_id: usize) -> Result<PathBuf> {
    let sname = slice_name(obj_name, slice_id);
    let mpath = vol.hrw_mountpath(&bck.make_uname(&sname))?;
    Ok(content::fqn(&mpath.path, CT_EC, bck, &sname))
}

/// Durably store one slice (or replica) plus its metadata sidecar.
pub(crate) fn write_slice(
    vol: &Vol,
    specs: &ContentSpecs,
    bck: &Bck,
    obj_name: &str,
    slice_id: usize,
    data: &[u8],
    md: &Md,
) -> Result<PathBuf> {
    let sname = slice_name(obj_name, slice_id);
    let mpath = vol.hrw_mountpath(&bck.make_uname(&sname))?;
    let dst = content::fqn(&mpath.path, CT_EC, bck, &sname);

    write_via_workfile(specs, &mpath.path, bck, &sname, data, &dst)?;
    let md_dst = sidecar(&dst);
    write_via_workfile(specs, &mpath.path, bck, &format!("{sname}{MD_SUFFIX}"), &md.to_bytes(), &md_dst)?;
    Ok(dst)
}

/// Write `data` to a final destination through a unique workfile.
pub(crate) fn write_via_workfile(
    specs: &ContentSpecs,
    mpath: &Path,
    bck: &Bck,
    name: &str,
    data: &[u8],
    dst: &Path,
) -> Result<()> {
    let (dir, base) = match name.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, name),
    };
    let unique = specs.gen_unique_fqn(CT_WORK, base, "ec");
    let wname = match dir {
        Some(dir) => format!("{dir}/{unique}"),
        None => unique,
    };
    let wfqn = content::fqn(mpath, CT_WORK, bck, &wname);

    if let Some(parent) = wfqn.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&wfqn)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&wfqn, dst)?;
    Ok(())
}

/// Read a locally stored slice and its metadata; `Ok(None)` when this
/// node does not hold it.
pub(crate) fn read_slice(
    vol: &Vol,
    bck: &Bck,
    obj_name: &str,
    slice_id: usize,
) -> Result<Option<(Vec<u8>, Md)>> {
    let fqn = slice_fqn(vol, bck, obj_name, slice_id)?;
    let data = match std::fs::read(&fqn) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let md = Md::from_bytes(&std::fs::read(sidecar(&fqn))?)?;
    Ok(Some((data, md)))
}

/// Remove every local slice of an object, 1..=num_slices plus the
/// replica slot 0. Missing files are not an error.
pub(crate) fn delete_slices(vol: &Vol, bck: &Bck, obj_name: &str, num_slices: usize) -> Result<usize> {
    let mut removed = 0;
    for slice_id in 0..=num_slices {
        let fqn = slice_fqn(vol, bck, obj_name, slice_id)?;
        match std::fs::remove_file(&fqn) {
            Ok(()) => {
                removed += 1;
                let _ = std::fs::remove_file(sidecar(&fqn));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

fn sidecar(fqn: &Path) -> PathBuf {
    let mut s = fqn.as_os_str().to_os_string();
    s.push(MD_SUFFIX);
    PathBuf::from(s)
}
