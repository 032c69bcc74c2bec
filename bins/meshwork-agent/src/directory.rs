//! Device directory boundary
//!
//! The directory is an external collaborator: it knows every device in the
//! workgroup, their published overlay keys and their exposed services. The
//! agent only ever reads snapshots — registration and key publication happen
//! elsewhere. Snapshot order matters: a device's index drives its overlay
//! addressing, and deleted devices keep their slot.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Operational status of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Fully registered, takes part in the mesh.
    Registered,
    /// Known but not yet active.
    Pending,
    /// Removed; the slot stays to keep addressing stable.
    Deleted,
}

/// One service a device publishes to the workgroup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub port: u16,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// One directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Public identity key of the device.
    pub authority: String,
    /// Human name.
    pub hostname: String,
    pub status: DeviceStatus,
    /// Published overlay public key (hex), if any yet.
    #[serde(default)]
    pub overlay_key: Option<String>,
    /// Services this device exposes.
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// Read-only view of the device directory.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Fetch the current snapshot. Order is addressing-significant.
    async fn snapshot(&self) -> Result<Vec<PeerRecord>>;
}

/// Directory backed by a JSON file, refreshed by whatever syncs the ledger.
pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeviceDirectory for FileDirectory {
    async fn snapshot(&self) -> Result<Vec<PeerRecord>> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading directory {}", self.path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing directory {}", self.path.display()))
    }
}
