use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chats_export::orchestrator::DEFAULT_LOCK_TIMEOUT;
use chats_fetch::FetcherSettings;
use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/chats-archive/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Archive directory; `--archive-dir` wins over this.
    pub archive_dir: Option<PathBuf>,
    /// Fallback key file used when the OS credential store is unavailable.
    pub key_file: Option<PathBuf>,
    /// Seconds to wait for the archive lock before reporting a running export.
    pub lock_timeout_secs: Option<u64>,
    pub api: Option<ApiConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub page_size: Option<usize>,
    pub request_delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
}

impl Config {
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT)
    }

    /// Fetcher tunables with config overrides applied on top of the defaults.
    pub fn fetcher_settings(&self) -> FetcherSettings {
        let mut settings = FetcherSettings::default();
        let Some(api) = &self.api else {
            return settings;
        };
        if let Some(base_url) = &api.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(page_size) = api.page_size.filter(|n| *n > 0) {
            settings.page_size = page_size;
        }
        if let Some(ms) = api.request_delay_ms {
            settings.request_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = api.max_retries {
            settings.max_retries = retries;
        }
        if let Some(secs) = api.initial_backoff_secs {
            settings.initial_backoff = Duration::from_secs(secs);
        }
        settings
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("chats-archive").join("config.toml"))
}

/// Write `config` to `path` unless a file is already there.
pub fn write_default_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(cfg.fetcher_settings(), FetcherSettings::default());
    }

    #[test]
    fn empty_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write");
        assert_eq!(load_from_path(&path).expect("load"), Config::default());
    }

    #[test]
    fn parses_custom_config() {
        let contents = r#"
            archive_dir = "/srv/chats"
            key_file = "/secure/chats.key"
            lock_timeout_secs = 30
            [api]
            base_url = "http://127.0.0.1:9000/api"
            page_size = 25
            request_delay_ms = 0
            max_retries = 5
            initial_backoff_secs = 1
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(
            cfg,
            Config {
                archive_dir: Some(PathBuf::from("/srv/chats")),
                key_file: Some(PathBuf::from("/secure/chats.key")),
                lock_timeout_secs: Some(30),
                api: Some(ApiConfig {
                    base_url: Some("http://127.0.0.1:9000/api".into()),
                    page_size: Some(25),
                    request_delay_ms: Some(0),
                    max_retries: Some(5),
                    initial_backoff_secs: Some(1),
                }),
            }
        );

        assert_eq!(cfg.lock_timeout(), Duration::from_secs(30));
        let settings = cfg.fetcher_settings();
        assert_eq!(settings.base_url, "http://127.0.0.1:9000/api");
        assert_eq!(settings.page_size, 25);
        assert_eq!(settings.request_delay, Duration::ZERO);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.initial_backoff, Duration::from_secs(1));
        assert_eq!(
            settings.request_timeout,
            FetcherSettings::default().request_timeout
        );
    }

    #[test]
    fn zero_page_size_keeps_default() {
        let cfg = Config {
            api: Some(ApiConfig {
                page_size: Some(0),
                ..ApiConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(cfg.fetcher_settings().page_size, 100);
    }

    #[test]
    fn write_default_creates_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            archive_dir: Some(PathBuf::from("/srv/chats")),
            ..Config::default()
        };

        write_default_if_missing(&cfg, &path).expect("write should succeed");
        let other = Config::default();
        let second = write_default_if_missing(&other, &path).expect("second write ok");
        assert_eq!(second, path);
        let loaded = load_from_path(&path).expect("load");
        assert_eq!(loaded, cfg);
    }
}
