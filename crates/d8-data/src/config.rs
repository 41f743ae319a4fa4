use crate::TransferError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TTL: &str = "2m";
pub const DEFAULT_CHUNKS: usize = 10;

/// User defaults for `d8 data`, stored at `~/.config/d8/data.json`.
///
/// Every field is optional on disk; command-line flags override whatever is
/// loaded here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub namespace: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub ttl: Option<String>,
    pub chunks: Option<usize>,
    pub insecure_skip_tls_verify: bool,
}

impl DataConfig {
    /// Load from the default location. A missing file yields the defaults.
    pub fn load_default() -> Result<Self, TransferError> {
        let path = default_config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            TransferError::Config(format!("invalid config {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TransferError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn ttl_or_default(&self) -> &str {
        self.ttl.as_deref().unwrap_or(DEFAULT_TTL)
    }

    pub fn chunks_or_default(&self) -> usize {
        self.chunks.unwrap_or(DEFAULT_CHUNKS)
    }
}

fn default_config_path() -> Result<PathBuf, TransferError> {
    let home =
        std::env::var("HOME").map_err(|_| TransferError::Config("HOME not set".to_owned()))?;
    Ok(PathBuf::from(home).join(".config/d8/data.json"))
}

/// TLS and timeout settings for one data-plane HTTP client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// PEM bundle used as the only trust root; `None` keeps the platform roots.
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    #[must_use]
    pub fn with_ca(mut self, pem: Vec<u8>) -> Self {
        self.ca_pem = Some(pem);
        self
    }

    #[must_use]
    pub fn insecure(mut self, skip: bool) -> Self {
        self.insecure_skip_tls_verify = skip;
        self
    }
}
