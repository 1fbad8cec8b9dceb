use crate::mpath::Mountpath;
use crate::{Error, Result};
use cluster::{Bck, Ns, Provider};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// 2-character content-type prefixes. Every on-disk path is rooted at
/// `<mpath>/<content-type>/...`.
pub const CT_OBJ: &str = "ob";
pub const CT_WORK: &str = "wk";
pub const CT_EC: &str = "ec";
pub const CT_DSORT: &str = "ds";

/// What background services may do with files of a given content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perms {
    /// Rebalance/resilver may relocate the file.
    pub to_move: bool,
    /// LRU and space cleanup may delete the file.
    pub to_evict: bool,
    /// EC and similar services may read and transform the file.
    pub to_process: bool,
}

impl Perms {
    pub const NONE: Perms = Perms {
        to_move: false,
        to_evict: false,
        to_process: false,
    };
}

/// Outcome of parsing a unique (workfile-style) file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub base: String,
    /// True when the file was produced by an earlier process generation
    /// and is safe to garbage-collect.
    pub old: bool,
}

trait ContentResolver: Send + Sync {
    fn perms(&self) -> Perms;
    fn gen_unique(&self, base: &str, prefix: &str) -> String;
    fn parse_unique(&self, name: &str, pid: u32) -> Option<ContentInfo>;
}

struct ObjectResolver;

impl ContentResolver for ObjectResolver {
    fn perms(&self) -> Perms {
        Perms {
            to_move: true,
            to_evict: true,
            to_process: true,
        }
    }

    fn gen_unique(&self, base: &str, _prefix: &str) -> String {
        base.to_string()
    }

    fn parse_unique(&self, name: &str, _pid: u32) -> Option<ContentInfo> {
        Some(ContentInfo {
            base: name.to_string(),
            old: false,
        })
    }
}

/// Workfiles are named `<prefix>.<base>.<tie-breaker>.<pid-hex>`: the
/// pid suffix lets a restarted process recognize stale generations.
struct WorkfileResolver;

impl ContentResolver for WorkfileResolver {
    fn perms(&self) -> Perms {
        Perms {
            to_move: false,
            to_evict: true,
            to_process: false,
        }
    }

    fn gen_unique(&self, base: &str, prefix: &str) -> String {
        let tie = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        format!("{prefix}.{base}.{tie:x}.{:x}", std::process::id())
    }

    fn parse_unique(&self, name: &str, pid: u32) -> Option<ContentInfo> {
        // Split off `<tie>.<pid>` from the right; `base` may contain dots.
        let (rest, pid_hex) = name.rsplit_once('.')?;
        let (rest, tie_hex) = rest.rsplit_once('.')?;
        let (_prefix, base) = rest.split_once('.')?;

        u64::from_str_radix(tie_hex, 16).ok()?;
        let file_pid = u32::from_str_radix(pid_hex, 16).ok()?;

        Some(ContentInfo {
            base: base.to_string(),
            old: file_pid != pid,
        })
    }
}

struct EcResolver;

impl ContentResolver for EcResolver {
    fn perms(&self) -> Perms {
        Perms {
            to_move: false,
            to_evict: true,
            to_process: true,
        }
    }

    fn gen_unique(&self, base: &str, _prefix: &str) -> String {
        base.to_string()
    }

    fn parse_unique(&self, name: &str, _pid: u32) -> Option<ContentInfo> {
        Some(ContentInfo {
            base: name.to_string(),
            old: false,
        })
    }
}

struct DsortResolver;

impl ContentResolver for DsortResolver {
    fn perms(&self) -> Perms {
        Perms {
            to_move: false,
            to_evict: true,
            to_process: false,
        }
    }

    fn gen_unique(&self, base: &str, _prefix: &str) -> String {
        base.to_string()
    }

    fn parse_unique(&self, name: &str, _pid: u32) -> Option<ContentInfo> {
        Some(ContentInfo {
            base: name.to_string(),
            old: false,
        })
    }
}

/// Registry of content types and their resolvers.
pub struct ContentSpecs {
    m: HashMap<&'static str, Box<dyn ContentResolver>>,
}

impl ContentSpecs {
    pub fn new() -> ContentSpecs {
        let mut m: HashMap<&'static str, Box<dyn ContentResolver>> = HashMap::new();
        m.insert(CT_OBJ, Box::new(ObjectResolver));
        m.insert(CT_WORK, Box::new(WorkfileResolver));
        m.insert(CT_EC, Box::new(EcResolver));
        m.insert(CT_DSORT, Box::new(DsortResolver));
        ContentSpecs { m }
    }

    /// Permissions of a content type. Unknown types are conservatively
    /// denied everything.
    pub fn perms(&self, content_type: &str) -> Perms {
        match self.m.get(content_type) {
            Some(r) => r.perms(),
            None => {
                tracing::warn!(content_type, "unknown content type");
                Perms::NONE
            }
        }
    }

    pub fn gen_unique_fqn(&self, content_type: &str, base: &str, prefix: &str) -> String {
        match self.m.get(content_type) {
            Some(r) => r.gen_unique(base, prefix),
            None => base.to_string(),
        }
    }

    pub fn parse_unique_fqn(&self, content_type: &str, name: &str) -> Option<ContentInfo> {
        self.parse_unique_fqn_pid(content_type, name, std::process::id())
    }

    // pid is a parameter so that a restart can be simulated.
    pub(crate) fn parse_unique_fqn_pid(
        &self,
        content_type: &str,
        name: &str,
        pid: u32,
    ) -> Option<ContentInfo> {
        self.m.get(content_type)?.parse_unique(name, pid)
    }
}

impl Default for ContentSpecs {
    fn default() -> Self {
        ContentSpecs::new()
    }
}

/// Build the fully-qualified on-disk name of an object:
/// `<mpath>/<content-type>/<provider>[/<ns>]/<bucket>/<obj-name>`.
pub fn fqn(mpath: &Path, content_type: &str, bck: &Bck, obj_name: &str) -> PathBuf {
    let mut p = mpath.join(content_type).join(bck.provider.as_str());
    if !bck.ns.is_global() {
        p.push(bck.ns.to_string());
    }
    p.push(&bck.name);
    p.push(obj_name);
    p
}

/// An FQN decomposed back into its parts.
#[derive(Debug, Clone)]
pub struct ParsedFqn {
    pub mpath: Arc<Mountpath>,
    pub content_type: String,
    pub bck: Bck,
    pub obj_name: String,
}

/// Parse an FQN against the given set of mountpaths.
pub fn parse_fqn(path: &Path, mpaths: &[Arc<Mountpath>]) -> Result<ParsedFqn> {
    let mpath = mpaths
        .iter()
        .find(|mp| path.starts_with(&mp.path))
        .ok_or_else(|| Error::InvalidFqn(path.to_path_buf()))?;

    let rel = path
        .strip_prefix(&mpath.path)
        .map_err(|_| Error::InvalidFqn(path.to_path_buf()))?;
    let mut comps = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .into_iter();

    let bad = || Error::InvalidFqn(path.to_path_buf());

    let content_type = comps.next().ok_or_else(bad)?.to_string();
    if content_type.len() != 2 {
        return Err(bad());
    }
    let provider = Provider::parse(comps.next().ok_or_else(bad)?).map_err(|_| bad())?;

    let mut next = comps.next().ok_or_else(bad)?;
    let ns = if let Some(enc) = next.strip_prefix('@') {
        let (uuid, name) = enc.split_once('#').ok_or_else(bad)?;
        let ns = Ns {
            uuid: uuid.to_string(),
            name: name.to_string(),
        };
        next = comps.next().ok_or_else(bad)?;
        ns
    } else {
        Ns::global()
    };

    let mut bck = Bck::new(next, provider);
    bck.ns = ns;

    let obj_name = comps.collect::<Vec<_>>().join("/");
    if obj_name.is_empty() {
        return Err(bad());
    }

    Ok(ParsedFqn {
        mpath: mpath.clone(),
        content_type,
        bck,
        obj_name,
    })
}
