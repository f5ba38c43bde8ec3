use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_STATE_FILE: &str = "data/seen_posts.json";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: &'static str },

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Immutable configuration snapshot.
///
/// A new snapshot is built on every reload; holders swap the whole value.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Watched accounts, without `@`, in first-seen order and without duplicates
    pub accounts: Vec<String>,
    pub poll_interval: Duration,
    pub min_user_interval: Duration,
    pub global_min_request_interval: Duration,
    pub rate_limit_backoff_max: Duration,
    pub fallback_enabled: bool,
    pub fallback_base_url: String,
    pub fallback_timeout: Duration,
    pub suppress_existing_on_start: bool,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub telegram_api_base: String,
    pub state_file: PathBuf,
    /// Offset used to display post timestamps
    pub display_utc_offset_hours: i32,
}

impl Config {
    /// Build a snapshot from a key lookup (file values, then environment).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let accounts = parse_accounts(&get("ACCOUNTS").unwrap_or_default());
        if accounts.is_empty() {
            return Err(ConfigError::Missing { key: "ACCOUNTS" });
        }

        Ok(Self {
            accounts,
            poll_interval: parse_seconds("POLL_INTERVAL_SECONDS", get("POLL_INTERVAL_SECONDS"), 30.0)?,
            min_user_interval: parse_seconds(
                "MIN_USER_INTERVAL_SECONDS",
                get("MIN_USER_INTERVAL_SECONDS"),
                60.0,
            )?,
            global_min_request_interval: parse_seconds(
                "GLOBAL_MIN_REQUEST_INTERVAL_SECONDS",
                get("GLOBAL_MIN_REQUEST_INTERVAL_SECONDS"),
                2.0,
            )?,
            rate_limit_backoff_max: parse_seconds(
                "RATE_LIMIT_BACKOFF_MAX_SECONDS",
                get("RATE_LIMIT_BACKOFF_MAX_SECONDS"),
                300.0,
            )?,
            fallback_enabled: parse_bool("FALLBACK_ENABLED", get("FALLBACK_ENABLED"), false)?,
            fallback_base_url: match get("FALLBACK_BASE_URL") {
                None => String::new(),
                Some(raw) => parse_base_url("FALLBACK_BASE_URL", raw)?,
            },
            fallback_timeout: parse_seconds(
                "FALLBACK_TIMEOUT_SECONDS",
                get("FALLBACK_TIMEOUT_SECONDS"),
                15.0,
            )?,
            suppress_existing_on_start: parse_bool(
                "SUPPRESS_EXISTING_ON_START",
                get("SUPPRESS_EXISTING_ON_START"),
                true,
            )?,
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            telegram_chat_id: get("TELEGRAM_CHAT_ID").unwrap_or_default(),
            telegram_api_base: parse_base_url(
                "TELEGRAM_API_BASE",
                get("TELEGRAM_API_BASE").unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            )?,
            state_file: PathBuf::from(
                get("STATE_FILE").unwrap_or_else(|| DEFAULT_STATE_FILE.to_string()),
            ),
            display_utc_offset_hours: match get("DISPLAY_UTC_OFFSET_HOURS") {
                None => 8,
                Some(raw) => raw
                    .parse::<i32>()
                    .ok()
                    .filter(|h| (-23..=23).contains(h))
                    .ok_or_else(|| ConfigError::Invalid {
                        key: "DISPLAY_UTC_OFFSET_HOURS",
                        value: raw.clone(),
                        reason: "expected whole hours between -23 and 23".to_string(),
                    })?,
            },
        })
    }

    /// Load from an optional `.env` file layered over the process environment.
    ///
    /// Values in the file win so that edits to it take effect on reload.
    pub fn load(env_file: &Path) -> Result<Self> {
        let file_values = read_env_file(env_file)?;
        let config = Self::from_lookup(|key| {
            file_values
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        })?;
        Ok(config)
    }

    /// Check the settings needed to deliver notifications
    pub fn validate_for_delivery(&self) -> Result<(), ConfigError> {
        if self.telegram_bot_token.is_empty() || self.telegram_bot_token == "your_bot_token_here" {
            return Err(ConfigError::Missing {
                key: "TELEGRAM_BOT_TOKEN",
            });
        }
        if self.telegram_chat_id.is_empty() || self.telegram_chat_id == "your_chat_id_here" {
            return Err(ConfigError::Missing {
                key: "TELEGRAM_CHAT_ID",
            });
        }
        if self.fallback_enabled && self.fallback_base_url.is_empty() {
            warn!("FALLBACK_ENABLED is set but FALLBACK_BASE_URL is empty; fallback will be skipped");
        }
        Ok(())
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        debug!("No env file at {path}", path = path.display());
        return Ok(HashMap::new());
    }

    let mut values = HashMap::new();
    let iter = dotenv::from_path_iter(path)
        .with_context(|| format!("Failed to open env file {path}", path = path.display()))?;
    for item in iter {
        let (key, value) = item
            .with_context(|| format!("Failed to parse env file {path}", path = path.display()))?;
        values.insert(key, value);
    }
    Ok(values)
}

fn parse_accounts(raw: &str) -> Vec<String> {
    let mut accounts: Vec<String> = Vec::new();
    for name in raw.split(',') {
        let name = name.trim().trim_start_matches('@');
        if name.is_empty() || accounts.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            continue;
        }
        accounts.push(name.to_string());
    }
    accounts
}

/// Require an absolute http(s) URL; the trailing slash is dropped
fn parse_base_url(key: &'static str, raw: String) -> Result<String, ConfigError> {
    match Url::parse(&raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {
            Ok(raw.trim_end_matches('/').to_string())
        }
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected an http(s) URL".to_string(),
        }),
    }
}

fn parse_seconds(
    key: &'static str,
    raw: Option<String>,
    default: f64,
) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Duration::from_secs_f64(default));
    };
    raw.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: "expected a non-negative number of seconds".to_string(),
        })
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected true or false".to_string(),
        }),
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Watch `env_file` for changes and publish fresh snapshots.
///
/// The file's modification time is polled every `poll_every`. Snapshots
/// that fail to load or validate are logged and not published.
pub fn spawn_reload_watcher(
    env_file: PathBuf,
    initial: Arc<Config>,
    poll_every: Duration,
    shutdown: CancellationToken,
) -> (watch::Receiver<Arc<Config>>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(initial);

    let handle = tokio::spawn(async move {
        let mut last_modified = modified_at(&env_file);
        let mut ticker = tokio::time::interval(poll_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = modified_at(&env_file);
            if current == last_modified {
                continue;
            }
            last_modified = current;

            info!("Detected change in {path}, reloading configuration", path = env_file.display());
            let snapshot = Config::load(&env_file).and_then(|config| {
                config.validate_for_delivery()?;
                Ok(config)
            });
            match snapshot {
                Ok(config) => {
                    if tx.send(Arc::new(config)).is_err() {
                        debug!("No configuration subscribers left");
                        break;
                    }
                }
                Err(e) => warn!("Ignoring invalid configuration: {e:#}"),
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("ACCOUNTS", "alice")])).unwrap();

        assert_eq!(config.accounts, vec!["alice".to_string()]);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.min_user_interval, Duration::from_secs(60));
        assert_eq!(config.global_min_request_interval, Duration::from_secs(2));
        assert_eq!(config.rate_limit_backoff_max, Duration::from_secs(300));
        assert!(!config.fallback_enabled);
        assert_eq!(config.fallback_timeout, Duration::from_secs(15));
        assert!(config.suppress_existing_on_start);
        assert_eq!(config.telegram_api_base, DEFAULT_TELEGRAM_API_BASE);
        assert_eq!(config.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert_eq!(config.display_utc_offset_hours, 8);
    }

    #[test]
    fn test_accounts_are_normalized() {
        let config =
            Config::from_lookup(lookup(&[("ACCOUNTS", " @alice, bob ,,Alice,@carol ")])).unwrap();
        assert_eq!(config.accounts, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_missing_accounts_is_an_error() {
        assert_eq!(
            Config::from_lookup(lookup(&[("ACCOUNTS", " , ")])),
            Err(ConfigError::Missing { key: "ACCOUNTS" })
        );
    }

    #[test]
    fn test_explicit_values() {
        let config = Config::from_lookup(lookup(&[
            ("ACCOUNTS", "alice"),
            ("POLL_INTERVAL_SECONDS", "45"),
            ("GLOBAL_MIN_REQUEST_INTERVAL_SECONDS", "1.5"),
            ("FALLBACK_ENABLED", "Yes"),
            ("FALLBACK_BASE_URL", "https://rsshub.example/"),
            ("SUPPRESS_EXISTING_ON_START", "off"),
            ("DISPLAY_UTC_OFFSET_HOURS", "-5"),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(45));
        assert_eq!(config.global_min_request_interval, Duration::from_millis(1500));
        assert!(config.fallback_enabled);
        assert_eq!(config.fallback_base_url, "https://rsshub.example");
        assert!(!config.suppress_existing_on_start);
        assert_eq!(config.display_utc_offset_hours, -5);
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = Config::from_lookup(lookup(&[
            ("ACCOUNTS", "alice"),
            ("MIN_USER_INTERVAL_SECONDS", "-3"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "MIN_USER_INTERVAL_SECONDS",
                ..
            }
        ));

        let err = Config::from_lookup(lookup(&[("ACCOUNTS", "alice"), ("FALLBACK_ENABLED", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("FALLBACK_ENABLED"));

        let err = Config::from_lookup(lookup(&[("ACCOUNTS", "alice"), ("FALLBACK_BASE_URL", "rsshub")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "FALLBACK_BASE_URL",
                ..
            }
        ));
    }

    #[test]
    fn test_delivery_validation() {
        let mut config = Config::from_lookup(lookup(&[("ACCOUNTS", "alice")])).unwrap();
        assert_eq!(
            config.validate_for_delivery(),
            Err(ConfigError::Missing {
                key: "TELEGRAM_BOT_TOKEN"
            })
        );

        config.telegram_bot_token = "123:abc".to_string();
        config.telegram_chat_id = "your_chat_id_here".to_string();
        assert!(config.validate_for_delivery().is_err());

        config.telegram_chat_id = "-100200".to_string();
        assert!(config.validate_for_delivery().is_ok());
    }

    #[test]
    fn test_load_reads_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "ACCOUNTS=dave,erin").unwrap();
        writeln!(file, "POLL_INTERVAL_SECONDS=90").unwrap();
        drop(file);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.accounts, vec!["dave", "erin"]);
        assert_eq!(config.poll_interval, Duration::from_secs(90));
    }
}
