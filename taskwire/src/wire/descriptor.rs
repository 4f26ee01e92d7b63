//! Socket addresses that survive a server restart.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const UNIX_PREFIX: &str = "unix:";

/// A descriptor string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid descriptor '{0}'")]
pub struct DescriptorError(String);

/// Where a wire server listens.
///
/// A client can always reconnect to the same descriptor, whichever server
/// process currently owns it. Written as `unix:/path/to.sock`; a bare path is
/// accepted when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    path: PathBuf,
}

impl Descriptor {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{UNIX_PREFIX}{}", self.path.display())
    }
}

impl FromStr for Descriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = s.strip_prefix(UNIX_PREFIX).unwrap_or(s).trim();
        if path.is_empty() || (path.contains(':') && !s.starts_with(UNIX_PREFIX)) {
            return Err(DescriptorError(s.to_string()));
        }
        Ok(Self::unix(path))
    }
}
