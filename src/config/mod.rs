use garde::Validate;
use serde::Deserialize;

use crate::services::preprocess::{
    ImagePreprocessor, DEFAULT_JPEG_QUALITY, DEFAULT_MAX_BYTES, DEFAULT_MAX_DIMENSION_PX,
};

/// Which record store implementation backs the coordinator.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Record store backend ("redis" or "memory")
    #[serde(default = "default_store_backend")]
    #[garde(skip)]
    pub store_backend: StoreBackend,

    /// Redis connection string for the shared record store
    #[serde(default = "default_redis_url")]
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Images above this size are downscaled before upload
    #[serde(default = "default_max_image_bytes")]
    #[garde(range(min = 1))]
    pub max_image_bytes: usize,

    /// Downscale bound for the longest side, in pixels
    #[serde(default = "default_max_dimension_px")]
    #[garde(range(min = 1))]
    pub max_dimension_px: u32,

    /// JPEG quality used when re-encoding downscaled images
    #[serde(default = "default_jpeg_quality")]
    #[garde(range(min = 1, max = 100))]
    pub jpeg_quality: u8,

    /// Request body limit for uploads
    #[serde(default = "default_max_upload_bytes")]
    #[garde(range(min = 1))]
    pub max_upload_bytes: usize,

    /// Lifecycle events buffered per slow subscriber
    #[serde(default = "default_event_capacity")]
    #[garde(range(min = 1))]
    pub event_capacity: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_image_bytes() -> usize {
    DEFAULT_MAX_BYTES
}

fn default_max_dimension_px() -> u32 {
    DEFAULT_MAX_DIMENSION_PX
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_event_capacity() -> usize {
    64
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value pairs (upper-case names, as in the environment).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: AppConfig = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn preprocessor(&self) -> ImagePreprocessor {
        ImagePreprocessor::new(self.max_image_bytes, self.max_dimension_px, self.jpeg_quality)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
