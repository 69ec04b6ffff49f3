//! Loading topology descriptors from JSON.
//!
//! ```json
//! {
//!   "nodes": [
//!     { "name": "r", "role": "router", "interfaces": ["r-eth0", "r-eth1"] },
//!     { "name": "s", "role": "host", "interfaces": ["s-eth0"], "scheme": { "prefix": 10 } },
//!     { "name": "c", "role": "host", "interfaces": ["c-eth0"], "scheme": { "prefix": 11, "width": 24 } }
//!   ],
//!   "links": [
//!     { "a": { "node": "r", "interface": "r-eth0" }, "b": { "node": "s", "interface": "s-eth0" } },
//!     { "a": { "node": "r", "interface": "r-eth1" }, "b": { "node": "c", "interface": "c-eth0" },
//!       "bandwidth_kbit": 750, "latency_ms": 10 }
//!   ]
//! }
//! ```
//!
//! Descriptors are validated on load.

use std::{fs, io, path::Path};

use crate::topology::{Topology, TopologyError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid descriptor: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl Topology {
    /// Parses and validates a JSON descriptor.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let topology: Self = serde_json::from_str(json)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Reads, parses and validates a JSON descriptor file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading topology");
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
