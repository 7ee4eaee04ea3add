use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "shuge", about = "A novel-reading server")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub upload: UploadConfig,
    pub parser: ParserConfig,
    pub cache: CacheConfig,
    pub review: ReviewConfig,
    pub clicks: ClickConfig,
    pub recommend: RecommendConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

/// Root of the blob area; files land in `<path>/uploads/`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC key for bearer tokens. A random key is generated at startup when unset.
    pub token_secret: Option<String>,
    pub token_hours: i64,
    pub bcrypt_cost: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UploadConfig {
    pub max_bytes: u64,
    pub rate_limit_count: u32,
    pub rate_limit_window_hours: i64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ParserConfig {
    pub heading_patterns: Vec<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub info_ttl_secs: u64,
    pub list_ttl_secs: u64,
    pub chapters_ttl_secs: u64,
    pub chapter_ttl_secs: u64,
    pub content_ttl_secs: u64,
    pub content_max_bytes: u64,
    pub recommend_ttl_secs: u64,
    pub purge_interval_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReviewConfig {
    pub expire_days: i64,
    pub sweep_interval_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClickConfig {
    pub flush_interval_ms: u64,
    pub channel_capacity: usize,
    /// Offset of the clock that defines day/week/month buckets.
    pub utc_offset_hours: i32,
    pub rollover_check_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RecommendConfig {
    pub candidate_limit: u32,
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_hours: 72,
            bcrypt_cost: 10,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            rate_limit_count: 10,
            rate_limit_window_hours: 24,
        }
    }
}

pub fn default_heading_patterns() -> Vec<String> {
    vec![
        r"^第[0-9０-９零〇一二两三四五六七八九十百千万]+[章节回卷部篇集](\s.*|[:：、.].*)?$".to_string(),
        r"^第[0-9０-９零〇一二两三四五六七八九十百千万]+[章节回卷部篇集]\S{0,30}$".to_string(),
        r"(?i)^chapter\s*[0-9]+\b.*$".to_string(),
        r"^(序章|序言|楔子|引子|尾声|后记|番外)(\s.*|[:：、].*)?$".to_string(),
        r"^[0-9]{1,4}[.、]\s*\S.*$".to_string(),
    ]
}

impl Default for ParserConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            heading_patterns: default_heading_patterns(),
            workers: cpus.min(4),
            queue_capacity: 128,
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            info_ttl_secs: 600,
            list_ttl_secs: 60,
            chapters_ttl_secs: 3600,
            chapter_ttl_secs: 3600,
            content_ttl_secs: 3600,
            content_max_bytes: 1024 * 1024,
            recommend_ttl_secs: 300,
            purge_interval_secs: 60,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            expire_days: 7,
            sweep_interval_secs: 3600,
        }
    }
}

impl Default for ClickConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 2000,
            channel_capacity: 65_536,
            utc_offset_hours: 8,
            rollover_check_secs: 30,
        }
    }
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 500,
            default_limit: 10,
            max_limit: 50,
        }
    }
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let data_dir = Self::data_dir(cli);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Some(ref host) = cli.host {
            config.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.server.port = port;
        }

        config.resolve_paths(&data_dir);
        config.validate()?;

        Ok(config)
    }

    /// Fill unset paths relative to the data dir.
    pub fn resolve_paths(&mut self, data_dir: &std::path::Path) {
        if self.database.path.is_none() {
            self.database.path = Some(data_dir.join("shuge.db"));
        }
        if self.storage.path.is_none() {
            self.storage.path = Some(data_dir.to_path_buf());
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for pattern in &self.parser.heading_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid heading pattern {:?}: {}", pattern, e))?;
        }
        if self.parser.workers == 0 {
            anyhow::bail!("parser.workers must be at least 1");
        }
        if !(-12..=14).contains(&self.clicks.utc_offset_hours) {
            anyhow::bail!("clicks.utc_offset_hours must be within -12..=14");
        }
        Ok(())
    }

    pub fn data_dir(cli: &Cli) -> PathBuf {
        cli.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".shuge")
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("shuge.db"))
    }

    pub fn blob_root(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.blob_root().join("uploads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_for(dir: &std::path::Path) -> Cli {
        Cli {
            config: None,
            host: None,
            port: None,
            data_dir: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.auth.token_hours, 72);
        assert_eq!(config.upload.max_bytes, 20 * 1024 * 1024);
        assert_eq!(config.upload.rate_limit_count, 10);
        assert_eq!(config.review.expire_days, 7);
        assert!(config.parser.workers >= 1 && config.parser.workers <= 4);
        assert!(config.clicks.flush_interval_ms <= 5000);
        assert!(config.database.path.is_none());
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn default_heading_patterns_compile() {
        for pattern in default_heading_patterns() {
            regex::Regex::new(&pattern).unwrap();
        }
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli = cli_for(std::path::Path::new("/tmp/test-shuge"));
        assert_eq!(Config::data_dir(&cli), PathBuf::from("/tmp/test-shuge"));
    }

    #[test]
    fn data_dir_defaults_to_home_dot_shuge() {
        let cli = Cli {
            config: None,
            host: None,
            port: None,
            data_dir: None,
        };
        let dir = Config::data_dir(&cli);
        assert!(dir.ends_with(".shuge"));
    }

    #[test]
    fn load_with_no_config_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&cli_for(tmp.path())).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.db_path(), tmp.path().join("shuge.db"));
        assert_eq!(config.uploads_path(), tmp.path().join("uploads"));
    }

    #[test]
    fn load_applies_cli_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = Cli {
            host: Some("127.0.0.1".to_string()),
            port: Some(9090),
            ..cli_for(tmp.path())
        };
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn load_reads_toml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        std::fs::write(
            &config_path,
            r#"
[server]
port = 9000

[upload]
max_bytes = 1024
rate_limit_count = 2

[review]
expire_days = 30

[clicks]
utc_offset_hours = 0
"#,
        )
        .unwrap();

        let cli = Cli {
            config: Some(config_path),
            ..cli_for(tmp.path())
        };
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.upload.max_bytes, 1024);
        assert_eq!(config.upload.rate_limit_count, 2);
        assert_eq!(config.upload.rate_limit_window_hours, 24);
        assert_eq!(config.review.expire_days, 30);
        assert_eq!(config.clicks.utc_offset_hours, 0);
    }

    #[test]
    fn cli_overrides_beat_toml_values() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        std::fs::write(&config_path, "[server]\nhost = \"192.168.1.1\"\nport = 9000\n").unwrap();

        let cli = Cli {
            config: Some(config_path),
            host: Some("10.0.0.1".to_string()),
            port: Some(4000),
            data_dir: Some(tmp.path().to_path_buf()),
        };
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.server.host, "10.0.0.1");
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn invalid_heading_pattern_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.toml");
        std::fs::write(&config_path, "[parser]\nheading_patterns = [\"(unclosed\"]\n").unwrap();

        let cli = Cli {
            config: Some(config_path),
            ..cli_for(tmp.path())
        };
        assert!(Config::load(&cli).is_err());
    }
}
