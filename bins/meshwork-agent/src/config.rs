//! Agent configuration

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// This device's public identity in the directory.
    pub authority: String,
    /// Signaling relay base URL.
    pub signal_url: String,
    /// Path to the directory snapshot file.
    pub directory_path: PathBuf,
    /// Path to the 32-byte key seed (base64) from key custody.
    pub key_file: PathBuf,
    /// Topology refresh interval in seconds.
    pub poll_interval_secs: u64,
    /// Signaling freshness window in seconds.
    pub freshness_secs: u64,
    /// STUN servers for candidate gathering.
    pub stun_servers: Vec<String>,
    /// Overlay interface settings.
    pub overlay: OverlaySection,
}

/// Overlay interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlaySection {
    /// UDP listen port of the overlay device.
    pub listen_port: u16,
    /// TUN interface name.
    pub tun_name: String,
    /// Interface MTU.
    pub mtu: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            authority: String::new(),
            signal_url: "http://signal.meshwork.dev:8080".to_string(),
            directory_path: PathBuf::from("devices.json"),
            key_file: PathBuf::from("device.key"),
            poll_interval_secs: 30,
            freshness_secs: 30,
            stun_servers: meshwork_ice::DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            overlay: OverlaySection {
                listen_port: meshwork_overlay::OVERLAY_LISTEN_PORT,
                tun_name: "mesh0".to_string(),
                mtu: meshwork_overlay::OVERLAY_MTU,
            },
        }
    }
}

impl AgentConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Save as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let data = toml::to_string_pretty(self).context("encoding config")?;
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Load the key seed: 32 bytes, base64-encoded.
pub fn load_seed(path: &Path) -> Result<[u8; 32]> {
    use base64::Engine;

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .with_context(|| format!("decoding key file {}", path.display()))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file {} is not 32 bytes", path.display()))
}

/// Write a freshly generated seed.
pub fn write_seed(path: &Path, seed: &[u8; 32]) -> Result<()> {
    use base64::Engine;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = base64::engine::general_purpose::STANDARD.encode(seed);
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let mut config = AgentConfig::default();
        config.authority = "dev-a".to_string();
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.authority, "dev-a");
        assert_eq!(loaded.overlay.listen_port, 12912);
        assert_eq!(loaded.freshness_secs, 30);
    }

    #[test]
    fn test_seed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");

        let seed = [42u8; 32];
        write_seed(&path, &seed).unwrap();
        assert_eq!(load_seed(&path).unwrap(), seed);
    }

    #[test]
    fn test_bad_seed_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");
        std::fs::write(&path, "bm90IGEga2V5").unwrap(); // "not a key"
        assert!(load_seed(&path).is_err());
    }
}
