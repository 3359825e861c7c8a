use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct GraniteConfig {
    /// Directory that holds shared memory region files.
    #[serde(default = "defaults::shm_dir")]
    pub shm_dir: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub columnar: ColumnarConfig,
    #[serde(default)]
    pub fundamentals: FundamentalsConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// A quote older than this is reported as `stale`.
    #[serde(default = "defaults::freshness_window_ms")]
    pub freshness_window_ms: u64,
    #[serde(default = "defaults::max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Replies queued per connection before the server stops reading it.
    #[serde(default = "defaults::outbox_depth")]
    pub outbox_depth: usize,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotConfig {
    #[serde(default = "defaults::snapshot_region")]
    pub region_name: String,
    #[serde(default = "defaults::initial_size_bytes")]
    pub initial_size_bytes: usize,
    #[serde(default = "defaults::snapshot_retries")]
    pub max_retries: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ColumnarConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "defaults::columnar_region")]
    pub region_name: String,
    #[serde(default = "defaults::columnar_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub tickers: Vec<TickerCapacity>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TickerCapacity {
    pub ticker: String,
    pub capacity: usize,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FundamentalsConfig {
    #[serde(default = "defaults::ttl_secs")]
    pub ttl_secs: u64,
    /// Minimum age before a `fresh` request triggers another fetch.
    #[serde(default = "defaults::fresh_ttl_secs")]
    pub fresh_ttl_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn shm_dir() -> String {
        "/dev/shm".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn host() -> String {
        "127.0.0.1".into()
    }

    pub fn port() -> u16 {
        12345
    }

    pub fn freshness_window_ms() -> u64 {
        90_000
    }

    pub fn max_line_bytes() -> usize {
        64 * 1024
    }

    pub fn idle_timeout_secs() -> u64 {
        60
    }

    pub fn outbox_depth() -> usize {
        256
    }

    pub fn snapshot_region() -> String {
        "granite_snapshot".into()
    }

    pub fn initial_size_bytes() -> usize {
        1 << 20
    }

    pub fn snapshot_retries() -> u32 {
        6
    }

    pub fn columnar_region() -> String {
        "granite_bars".into()
    }

    pub fn columnar_retries() -> u32 {
        8
    }

    pub fn ttl_secs() -> u64 {
        24 * 60 * 60
    }

    pub fn fresh_ttl_secs() -> u64 {
        60 * 60
    }
}

impl Default for GraniteConfig {
    fn default() -> Self {
        Self {
            shm_dir: defaults::shm_dir(),
            log_level: defaults::log_level(),
            server: ServerConfig::default(),
            snapshot: SnapshotConfig::default(),
            columnar: ColumnarConfig::default(),
            fundamentals: FundamentalsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            freshness_window_ms: defaults::freshness_window_ms(),
            max_line_bytes: defaults::max_line_bytes(),
            idle_timeout_secs: defaults::idle_timeout_secs(),
            outbox_depth: defaults::outbox_depth(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            region_name: defaults::snapshot_region(),
            initial_size_bytes: defaults::initial_size_bytes(),
            max_retries: defaults::snapshot_retries(),
        }
    }
}

impl Default for ColumnarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region_name: defaults::columnar_region(),
            max_retries: defaults::columnar_retries(),
            tickers: Vec::new(),
        }
    }
}

impl Default for FundamentalsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::ttl_secs(),
            fresh_ttl_secs: defaults::fresh_ttl_secs(),
        }
    }
}

impl GraniteConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let granite_config: GraniteConfig = toml::from_str(s)?;
        Ok(granite_config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = GraniteConfig::parse("").unwrap();
        assert_eq!(cfg, GraniteConfig::default());
        assert_eq!(cfg.server.port, 12345);
        assert_eq!(cfg.server.freshness_window_ms, 90_000);
        assert_eq!(cfg.server.max_line_bytes, 65_536);
        assert_eq!(cfg.snapshot.max_retries, 6);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:12345");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = GraniteConfig::parse(
            r#"
            log_level = "debug"

            [server]
            port = 4000

            [columnar]
            enabled = true
            tickers = [
                { ticker = "AAPL", capacity = 390 },
                { ticker = "MSFT", capacity = 78 },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.server.port, 4000);
        assert_eq!(cfg.server.idle_timeout_secs, 60);
        assert_eq!(cfg.server.outbox_depth, 256);
        assert!(cfg.columnar.enabled);
        assert_eq!(cfg.columnar.tickers.len(), 2);
        assert_eq!(cfg.columnar.tickers[1].capacity, 78);
        assert_eq!(cfg.fundamentals, FundamentalsConfig::default());
    }

    #[test]
    fn load_reports_missing_file_and_bad_toml() {
        let err = GraniteConfig::load("/nonexistent/granite.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[server]\nport = \"not a number\"").unwrap();
        let path = f.path().to_str().unwrap().to_string();
        assert!(matches!(
            GraniteConfig::load(path),
            Err(ConfigError::Parse(_))
        ));
    }
}
