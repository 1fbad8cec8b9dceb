use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// Checksum algorithm of a bucket. `Xxhash` is the cluster default;
/// `Md5` interoperates with S3-style ETags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CksumType {
    None,
    #[default]
    Xxhash,
    Md5,
}

impl CksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CksumType::None => "none",
            CksumType::Xxhash => "xxhash",
            CksumType::Md5 => "md5",
        }
    }
}

impl fmt::Display for CksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed checksum: algorithm plus hex value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cksum {
    pub ty: CksumType,
    pub value: String,
}

impl Cksum {
    pub fn compute(ty: CksumType, data: &[u8]) -> Option<Cksum> {
        let value = match ty {
            CksumType::None => return None,
            CksumType::Xxhash => {
                let mut h = Xxh3::new();
                h.update(data);
                format!("{:016x}", h.digest())
            }
            CksumType::Md5 => format!("{:x}", md5::compute(data)),
        };
        Some(Cksum { ty, value })
    }

    /// Verify `data` against this checksum. The error message surfaces
    /// verbatim to API callers.
    pub fn verify(&self, data: &[u8]) -> Result<(), Error> {
        let Some(got) = Cksum::compute(self.ty, data) else {
            return Ok(());
        };
        if got.value != self.value {
            return Err(Error::BadCksum {
                ty: self.ty,
                given: self.value.clone(),
                computed: got.value,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Cksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.ty, self.value)
    }
}
