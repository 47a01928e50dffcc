use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::capabilities::{ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS};
use crate::error::CatalogError;
use crate::DEFAULT_USER_ID;

pub const DEFAULT_API_BASE_URL: &str = "https://api.example.com";
pub const DEFAULT_IMAGE_CACHE_CAPACITY: usize = 128;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 4096;
pub const DEFAULT_MAX_CONCURRENT_IMAGE_FETCHES: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub api_base_url: String,
    pub user_id: String,
    pub request_timeout_ms: u64,
    /// Lets loopback and LAN hosts through URL validation. Local development only.
    pub allow_private_hosts: bool,
    pub image_cache_capacity: usize,
    pub max_image_bytes: usize,
    pub max_image_dimension: u32,
    pub max_concurrent_image_fetches: usize,
    /// SQLite file for likes. `None` keeps them in memory.
    pub favorites_db_path: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            user_id: DEFAULT_USER_ID.to_string(),
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            allow_private_hosts: false,
            image_cache_capacity: DEFAULT_IMAGE_CACHE_CAPACITY,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
            max_concurrent_image_fetches: DEFAULT_MAX_CONCURRENT_IMAGE_FETCHES,
            favorites_db_path: None,
        }
    }
}

impl CatalogConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CatalogError::Config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), base = %config.api_base_url, "catalog config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        ValidatedUrl::with_policy(self.api_base_url.as_str(), self.allow_private_hosts)
            .map_err(|e| CatalogError::Config(format!("api_base_url: {e}")))?;
        if self.user_id.trim().is_empty() {
            return Err(CatalogError::Config("user_id must not be empty".into()));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(CatalogError::Config(format!(
                "request_timeout_ms must be within 1..={MAX_TIMEOUT_MS}"
            )));
        }
        if self.image_cache_capacity == 0 {
            return Err(CatalogError::Config("image_cache_capacity must be > 0".into()));
        }
        if self.max_image_bytes == 0 {
            return Err(CatalogError::Config("max_image_bytes must be > 0".into()));
        }
        if self.max_image_dimension == 0 {
            return Err(CatalogError::Config("max_image_dimension must be > 0".into()));
        }
        if self.max_concurrent_image_fetches == 0 {
            return Err(CatalogError::Config(
                "max_concurrent_image_fetches must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
