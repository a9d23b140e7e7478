use std::path::PathBuf;

use thiserror::Error;

mod authority;
mod client;

pub use authority::{CaMetricsSnapshot, CertificateAuthority, IssuedLeaf, LEAF_CACHE_CAPACITY};
pub use client::{mirrored_client_config, upstream_client_config, ClientHelloSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    /// Directory holding the persisted root certificate and key. `None`
    /// keeps the root in memory only.
    pub root_path: Option<PathBuf>,
    pub common_name: String,
    pub organization: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            root_path: None,
            common_name: "lucent Root CA".to_string(),
            organization: "lucent".to_string(),
        }
    }
}

impl CaConfig {
    pub(crate) fn validate(&self) -> Result<(), CaError> {
        if self.common_name.trim().is_empty() {
            return Err(CaError::InvalidMaterial(
                "common_name must not be empty".to_string(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(CaError::InvalidMaterial(
                "organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
