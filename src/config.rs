//! Config module for weightvault
//!
//! Every setting can come from a flag or a `WV_*` environment variable
//! (a `.env` file is loaded first by the binary).

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::download::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES, DownloaderConfig, RetryPolicy,
};

#[derive(Parser, Debug, Clone)]
pub struct StorageConfig {
    /// Root of the canonical storage tree
    #[clap(long, env = "WV_STORAGE_ROOT", default_value_t = get_default_storage_root())]
    pub storage_root: String,
}

/// Safely determine the default storage root
fn get_default_storage_root() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("weightvault"))
        .and_then(|path| path.to_str().map(String::from))
        .unwrap_or_else(|| "./weightvault".to_string())
}

impl StorageConfig {
    pub fn root(&self) -> PathBuf {
        self.storage_root.clone().into()
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum number of transfers running at once
    #[clap(long, env = "WV_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent: usize,

    /// Bytes per streamed chunk
    #[clap(long, env = "WV_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Whole-transfer timeout in seconds
    #[clap(long, env = "WV_TIMEOUT_SECS", default_value = "3600")]
    pub timeout_secs: u64,

    #[clap(long, env = "WV_CONNECT_TIMEOUT_SECS", default_value = "30")]
    pub connect_timeout_secs: u64,

    /// Attempts per task before it is marked failed
    #[clap(long, env = "WV_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Delay before the first retry; doubles each retry. 0 retries immediately
    #[clap(long, env = "WV_RETRY_BASE_MS", default_value = "0")]
    pub retry_base_ms: u64,

    /// Cap for the retry delay, 0 for no cap
    #[clap(long, env = "WV_RETRY_MAX_MS", default_value = "30000")]
    pub retry_max_ms: u64,

    #[clap(long, env = "WV_RETRY_JITTER", default_value = "false")]
    pub retry_jitter: bool,
}

impl DownloadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
        .with_jitter(self.retry_jitter)
    }

    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig {
            chunk_size: self.chunk_size.max(1),
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            retry: self.retry_policy(),
            ..DownloaderConfig::default()
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Config {
    #[clap(flatten)]
    pub storage: StorageConfig,

    #[clap(flatten)]
    pub download: DownloadConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["weightvault"]).unwrap();
        assert_eq!(config.download.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(config.download.chunk_size, 8192);
        assert_eq!(config.download.max_retries, 3);

        let downloader = config.download.downloader_config();
        assert_eq!(downloader.timeout, Duration::from_secs(3600));
        assert_eq!(downloader.connect_timeout, Duration::from_secs(30));
        assert_eq!(downloader.retry.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_flags_override() {
        let config = Config::try_parse_from([
            "weightvault",
            "--storage-root",
            "/srv/weights",
            "--max-concurrent",
            "5",
            "--retry-base-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(config.storage.root(), PathBuf::from("/srv/weights"));
        assert_eq!(config.download.max_concurrent, 5);
        assert_eq!(
            config.download.retry_policy().backoff(2),
            Duration::from_millis(500)
        );
    }
}
