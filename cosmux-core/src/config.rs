//! Client and transfer configuration
//!
//! Configuration is captured when a [`crate::Client`] is built and never
//! changes afterwards; two clients may use different part sizes side by side.

use std::time::Duration;

use crate::error::{Result, TransferError};

/// Smallest part size the service accepts (1 MiB)
pub const MIN_PART_SIZE: u64 = 1024 * 1024;

/// Largest part size, and the largest single-request payload (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Hard ceiling above which single-shot transfer is never used (5 GiB)
pub const SINGLE_SHOT_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// Default part size (10 MiB)
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Default multipart threshold, in parts
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 10;

/// Default number of concurrent part transfers
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Tuning for the multipart transfer engine
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Part size in bytes; clamped to [`MIN_PART_SIZE`, `MAX_PART_SIZE`]
    pub part_size: u64,
    /// Objects larger than `multipart_threshold * part_size` use multipart
    pub multipart_threshold: u64,
    /// Maximum number of part transfers in flight
    pub concurrency: usize,
    /// Validity window of each request signature
    pub auth_expiration: Duration,
    /// Keep out-of-order download parts in memory instead of a spill file
    pub buffer_in_memory: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            concurrency: DEFAULT_CONCURRENCY,
            auth_expiration: Duration::from_secs(10 * 60),
            buffer_in_memory: false,
        }
    }
}

impl TransferConfig {
    /// Part size actually used for transfers
    pub fn effective_part_size(&self) -> u64 {
        self.part_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE)
    }

    /// Whether an object of `size` bytes is transferred in parts
    pub fn use_multipart(&self, size: u64) -> bool {
        let threshold = self
            .multipart_threshold
            .saturating_mul(self.effective_part_size());
        size > threshold || size > SINGLE_SHOT_LIMIT
    }

    /// Concurrency with a floor of one worker
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Connection settings for a COS endpoint
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bucket host, e.g. `examplebucket-1250000000.cos.ap-beijing.myqcloud.com`
    pub host: String,
    /// Secret id placed in `q-ak`
    pub secret_id: String,
    /// Secret key used for HMAC signing
    pub secret_key: String,
    /// Use https instead of http
    pub use_https: bool,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-request timeout in seconds; 0 disables it
    pub request_timeout_secs: u64,
    /// Transfer engine tuning
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost:9000".into(),
            secret_id: String::new(),
            secret_key: String::new(),
            use_https: false,
            connect_timeout_secs: 10,
            request_timeout_secs: 0,
            transfer: TransferConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from `COS_*` environment variables
    ///
    /// `COS_HOST`, `COS_SECRET_ID` and `COS_SECRET_KEY` are required; the rest
    /// fall back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let transfer_defaults = TransferConfig::default();

        let transfer = TransferConfig {
            part_size: env_parse("COS_PART_SIZE")?.unwrap_or(transfer_defaults.part_size),
            multipart_threshold: env_parse("COS_MULTIPART_THRESHOLD")?
                .unwrap_or(transfer_defaults.multipart_threshold),
            concurrency: env_parse("COS_CONCURRENCY")?.unwrap_or(transfer_defaults.concurrency),
            auth_expiration: env_parse("COS_AUTH_EXPIRATION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(transfer_defaults.auth_expiration),
            buffer_in_memory: env_parse("COS_BUFFER_IN_MEMORY")?
                .unwrap_or(transfer_defaults.buffer_in_memory),
        };

        Ok(Self {
            host: env_required("COS_HOST")?,
            secret_id: env_required("COS_SECRET_ID")?,
            secret_key: env_required("COS_SECRET_KEY")?,
            use_https: env_parse("COS_USE_HTTPS")?.unwrap_or(defaults.use_https),
            connect_timeout_secs: env_parse("COS_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.connect_timeout_secs),
            request_timeout_secs: env_parse("COS_REQUEST_TIMEOUT_SECS")?
                .unwrap_or(defaults.request_timeout_secs),
            transfer,
        })
    }

    /// URL scheme for this endpoint
    pub fn scheme(&self) -> &'static str {
        if self.use_https {
            "https"
        } else {
            "http"
        }
    }
}

fn env_required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| TransferError::InvalidArgument {
        reason: format!("environment variable {} is not set", name),
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TransferError::InvalidArgument {
                reason: format!("environment variable {} has invalid value {:?}", name, raw),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(part_size: u64, threshold: u64) -> TransferConfig {
        TransferConfig {
            part_size,
            multipart_threshold: threshold,
            ..Default::default()
        }
    }

    #[test]
    fn test_part_size_clamp() {
        assert_eq!(config(10, 2).effective_part_size(), MIN_PART_SIZE);
        assert_eq!(config(u64::MAX, 2).effective_part_size(), MAX_PART_SIZE);
        assert_eq!(config(8 * MIN_PART_SIZE, 2).effective_part_size(), 8 * MIN_PART_SIZE);
    }

    #[test]
    fn test_mode_boundary() {
        let cfg = config(MIN_PART_SIZE, 2);
        assert!(!cfg.use_multipart(2 * MIN_PART_SIZE));
        assert!(cfg.use_multipart(2 * MIN_PART_SIZE + 1));
        assert!(!cfg.use_multipart(0));
    }

    #[test]
    fn test_single_shot_ceiling() {
        // Threshold misconfigured far above the 5 GiB limit
        let cfg = config(MAX_PART_SIZE, 1000);
        assert!(!cfg.use_multipart(SINGLE_SHOT_LIMIT));
        assert!(cfg.use_multipart(SINGLE_SHOT_LIMIT + 1));
    }

    #[test]
    fn test_threshold_overflow_saturates() {
        let cfg = config(MAX_PART_SIZE, u64::MAX);
        assert!(cfg.use_multipart(SINGLE_SHOT_LIMIT + 1));
        assert!(!cfg.use_multipart(1024));
    }
}
