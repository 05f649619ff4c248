//! Cluster protocol versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version of the cluster the client is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    /// First version that pushes sequence-aware invalidation events.
    pub const SEQUENCED_INVALIDATION: ServerVersion = ServerVersion::new(3, 8, 0);

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether the cluster tags invalidations with generation and sequence.
    pub fn supports_sequenced_invalidation(&self) -> bool {
        *self >= Self::SEQUENCED_INVALIDATION
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error when parsing an invalid version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError(pub String);

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid server version: {}", self.0)
    }
}

impl std::error::Error for VersionParseError {}

impl FromStr for ServerVersion {
    type Err = VersionParseError;

    /// Accepts `major.minor` or `major.minor.patch`, ignoring a `-SNAPSHOT`
    /// style suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s.split('-').next().unwrap_or_default();
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(VersionParseError(s.to_string()));
        }
        let parse = |p: &str| p.parse::<u16>().map_err(|_| VersionParseError(s.to_string()));
        let major = parse(parts[0])?;
        let minor = parse(parts[1])?;
        let patch = match parts.get(2) {
            Some(p) => parse(p)?,
            None => 0,
        };
        Ok(Self::new(major, minor, patch))
    }
}
