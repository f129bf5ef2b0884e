//! Database addresses.
//!
//! An address is the immutable identity of a database:
//! `/orbitdb/<root>/<path>`, where `root` is the CID of the database's
//! manifest in the object store and `path` is the human name given at
//! creation time. Two addresses are equal iff their string forms are equal.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cid::Cid;

use crate::error::{Error, Result};

/// Prefix tag of every database address.
pub const ADDRESS_PREFIX: &str = "orbitdb";

/// Immutable triple identifying a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    root: Cid,
    path: String,
}

impl Address {
    /// Build an address from its parts.
    pub fn new(root: Cid, path: impl Into<String>) -> Self {
        Self {
            root,
            path: path.into(),
        }
    }

    /// Parse a string of the form `/orbitdb/<root>/<path>`.
    ///
    /// Rejects inputs whose first segment is not `orbitdb`, whose segment
    /// count is not three, or whose root is not a content hash.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        let &[prefix, root, path] = parts.as_slice() else {
            return Err(Error::MalformedAddress(s.to_string()));
        };
        if prefix != ADDRESS_PREFIX || root.is_empty() || path.is_empty() {
            return Err(Error::MalformedAddress(s.to_string()));
        }
        let root = Cid::try_from(root).map_err(|_| Error::MalformedAddress(s.to_string()))?;
        Ok(Self {
            root,
            path: path.to_string(),
        })
    }

    /// Whether `s` parses as a database address.
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    /// Content hash of the manifest this address refers to.
    pub fn root(&self) -> &Cid {
        &self.root
    }

    /// Human name given at creation time.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Filesystem location of per-database data below `base`.
    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        base.join(self.root.to_string()).join(&self.path)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", ADDRESS_PREFIX, self.root, self.path)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
