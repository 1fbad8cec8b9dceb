use crate::cksum::CksumType;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Provider of a bucket's backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    #[default]
    Ais,
    Aws,
    Gcp,
    Azure,
    RemoteAis,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ais => "ais",
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
            Provider::RemoteAis => "remote-ais",
        }
    }

    pub fn parse(s: &str) -> Result<Provider, Error> {
        match s {
            "ais" => Ok(Provider::Ais),
            "aws" | "s3" => Ok(Provider::Aws),
            "gcp" | "gs" => Ok(Provider::Gcp),
            "azure" | "az" => Ok(Provider::Azure),
            "remote-ais" => Ok(Provider::RemoteAis),
            other => Err(Error::InvalidProvider(other.to_string())),
        }
    }

    /// Remote providers require a backend client; `ais` buckets are cluster-native.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Provider::Ais)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket namespace. `uuid` names a remote cluster and is empty for
/// the local one; `name` sub-divides a provider's buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ns {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Ns {
    pub fn global() -> Ns {
        Ns::default()
    }

    pub fn is_global(&self) -> bool {
        self.uuid.is_empty() && self.name.is_empty()
    }

    /// Remote namespaces carry the UUID of another cluster.
    pub fn is_remote(&self) -> bool {
        !self.uuid.is_empty()
    }
}

impl fmt::Display for Ns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            return Ok(());
        }
        write!(f, "@{}#{}", self.uuid, self.name)
    }
}

/// Bck identifies a bucket: `(name, provider, namespace)`.
/// Properties ride along but never participate in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bck {
    pub name: String,
    pub provider: Provider,
    #[serde(default)]
    pub ns: Ns,
    #[serde(skip)]
    pub props: Option<Arc<BckProps>>,
}

impl Bck {
    pub fn new(name: impl Into<String>, provider: Provider) -> Bck {
        Bck {
            name: name.into(),
            provider,
            ns: Ns::global(),
            props: None,
        }
    }

    pub fn ais(name: impl Into<String>) -> Bck {
        Bck::new(name, Provider::Ais)
    }

    pub fn with_props(mut self, props: Arc<BckProps>) -> Bck {
        self.props = Some(props);
        self
    }

    /// Canonical unique name of this bucket, used as a map key and as
    /// the prefix of object unames.
    pub fn uname(&self) -> String {
        if self.ns.is_global() {
            format!("{}/{}", self.provider, self.name)
        } else {
            format!("{}/{}/{}", self.provider, self.ns, self.name)
        }
    }

    /// Canonical unique name of an object within this bucket.
    pub fn make_uname(&self, obj_name: &str) -> String {
        format!("{}/{}", self.uname(), obj_name)
    }

    /// Equality that treats "the same logical bucket" on another cluster
    /// as equal, by ignoring the namespace cluster UUID.
    pub fn equal_ignoring_cluster(&self, other: &Bck) -> bool {
        self.name == other.name
            && self.provider == other.provider
            && self.ns.name == other.ns.name
    }

    pub fn props(&self) -> Arc<BckProps> {
        match &self.props {
            Some(p) => p.clone(),
            None => Arc::new(BckProps::default()),
        }
    }
}

impl PartialEq for Bck {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.provider == other.provider && self.ns == other.ns
    }
}
impl Eq for Bck {}

impl std::hash::Hash for Bck {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.provider.hash(state);
        self.ns.hash(state);
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ns.is_global() {
            write!(f, "{}://{}", self.provider, self.name)
        } else {
            write!(f, "{}://{}/{}", self.provider, self.ns, self.name)
        }
    }
}

/// Access permission bitmask of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessAttrs(pub u64);

impl AccessAttrs {
    pub const GET: AccessAttrs = AccessAttrs(1 << 0);
    pub const HEAD: AccessAttrs = AccessAttrs(1 << 1);
    pub const PUT: AccessAttrs = AccessAttrs(1 << 2);
    pub const APPEND: AccessAttrs = AccessAttrs(1 << 3);
    pub const DELETE: AccessAttrs = AccessAttrs(1 << 4);
    pub const COLD_GET: AccessAttrs = AccessAttrs(1 << 5);
    pub const EC: AccessAttrs = AccessAttrs(1 << 6);
    pub const SYNC: AccessAttrs = AccessAttrs(1 << 7);

    pub fn all() -> AccessAttrs {
        AccessAttrs(u64::MAX)
    }

    pub fn none() -> AccessAttrs {
        AccessAttrs(0)
    }

    pub fn has(&self, which: AccessAttrs) -> bool {
        self.0 & which.0 == which.0
    }

    pub fn grant(&mut self, which: AccessAttrs) {
        self.0 |= which.0;
    }

    pub fn deny(&mut self, which: AccessAttrs) {
        self.0 &= !which.0;
    }
}

impl Default for AccessAttrs {
    fn default() -> Self {
        AccessAttrs::all()
    }
}

/// A per-bucket access grant, as carried by tokens and user records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BckAccess {
    pub bck: Bck,
    pub access: AccessAttrs,
}

/// Merge `updates` into `acls`: an update for a bucket already present
/// overwrites its access mask; otherwise the update is appended after
/// the scan over the existing entries completes.
pub fn merge_bck_access(acls: &mut Vec<BckAccess>, updates: &[BckAccess]) {
    for upd in updates {
        let mut found = false;
        for acl in acls.iter_mut() {
            if acl.bck == upd.bck {
                acl.access = upd.access;
                found = true;
                break;
            }
        }
        if !found {
            acls.push(upd.clone());
        }
    }
}

/// Erasure-coding configuration of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    /// Objects at or below this size are replicated rather than sliced.
    pub obj_size_limit: i64,
    pub data_slices: usize,
    pub parity_slices: usize,
}

impl EcConf {
    /// Minimum number of targets needed to encode: one per slice,
    /// plus the target holding the full object.
    pub fn required_encode_targets(&self) -> usize {
        self.data_slices + self.parity_slices + 1
    }

    /// Minimum number of targets needed to restore the object.
    pub fn required_restore_targets(&self) -> usize {
        self.data_slices
    }

    /// Total number of slices kept for one object.
    pub fn num_slices(&self) -> usize {
        self.data_slices + self.parity_slices
    }
}

impl Default for EcConf {
    fn default() -> Self {
        EcConf {
            enabled: false,
            obj_size_limit: 256 * 1024,
            data_slices: 1,
            parity_slices: 1,
        }
    }
}

/// N-way mirroring configuration of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConf {
    pub enabled: bool,
    pub copies: usize,
}

impl Default for MirrorConf {
    fn default() -> Self {
        MirrorConf {
            enabled: false,
            copies: 2,
        }
    }
}

/// Bucket properties as recorded in the BMD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BckProps {
    #[serde(default)]
    pub cksum: CksumType,
    #[serde(default)]
    pub versioning: bool,
    #[serde(default)]
    pub access: AccessAttrs,
    #[serde(default)]
    pub mirror: MirrorConf,
    #[serde(default)]
    pub ec: EcConf,
}
