use crate::cache::{CacheConfig, PollReset};
use crate::lock::LockConfig;
use crate::producer::ProduceOptions;
use std::env;
use std::time::Duration;

/// Log store backend selection
#[derive(Clone, Debug, PartialEq)]
pub enum LogStoreType {
    Memory,
    Valkey,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Source audio URL: a template containing `{id}`, or a base URL the id is appended to
    pub source_url: String,
    /// Log store and lock backend
    pub log_store: LogStoreType,
    /// Valkey/Redis URL (used when log_store = Valkey)
    pub valkey_url: Option<String>,
    /// Namespace for cache and lock keys
    pub key_prefix: String,
    /// How long a completed stream stays cached (default: 4 hours)
    pub cache_expiry_secs: u64,
    /// Blocking wait per tail poll (default: 100 ms)
    pub poll_timeout_ms: u64,
    /// Consecutive empty polls before a tail is abandoned (default: 10)
    pub max_empty_polls: u32,
    /// Whether only data entries reset the empty-poll counter
    pub poll_reset: PollReset,
    /// Lock lease in milliseconds (default: 30 s)
    pub lock_lease_ms: u64,
    /// Upper bound on waiting for a lock (default: 60 s)
    pub lock_acquire_timeout_ms: u64,
    /// Pause between lock attempts (default: 50 ms)
    pub lock_retry_ms: u64,
    /// Run the source through ffmpeg (default: true)
    pub transcode: bool,
    pub ffmpeg_path: String,
    /// Target format passed to ffmpeg's `-f` (default: mp3)
    pub audio_format: String,
    /// Target bitrate (default: 192k)
    pub audio_bitrate: String,
    /// Install the Prometheus recorder and serve /metrics (default: true)
    pub metrics_enabled: bool,
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like [`parse_or`], but zero is a configuration error.
fn positive_or<T>(name: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let value = parse_or(name, default);
    if value == T::default() {
        return Err(format!("{name} must be greater than zero"));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and SOURCE_URL are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        // Source URL: required in prod, defaults to a local file server in dev
        let source_url = if is_dev {
            env::var("SOURCE_URL").unwrap_or_else(|_| "http://localhost:8080/{id}".to_string())
        } else {
            env::var("SOURCE_URL").map_err(|_| "SOURCE_URL is required in production")?
        };
        // Reject templates that cannot become a URL before the first request does.
        url::Url::parse(&source_url.replace("{id}", "probe"))
            .map_err(|e| format!("SOURCE_URL is not a valid URL: {e}"))?;

        let log_store = match env::var("LOG_STORE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "valkey" | "redis" => LogStoreType::Valkey,
            _ => LogStoreType::Memory,
        };
        let valkey_url = env::var("VALKEY_URL").ok();

        let poll_reset = match env::var("POLL_RESET")
            .unwrap_or_else(|_| "any".to_string())
            .to_lowercase()
            .as_str()
        {
            "data" => PollReset::DataEntry,
            _ => PollReset::AnyEntry,
        };

        Ok(Config {
            port,
            is_dev,
            source_url,
            log_store,
            valkey_url,
            key_prefix: env::var("KEY_PREFIX").unwrap_or_else(|_| "tailcast".to_string()),
            cache_expiry_secs: parse_or("CACHE_EXPIRY_SECS", 4 * 3600),
            // A zero poll timeout would block Valkey reads forever.
            poll_timeout_ms: positive_or("POLL_TIMEOUT_MS", 100)?,
            max_empty_polls: positive_or("MAX_EMPTY_POLLS", 10)?,
            poll_reset,
            lock_lease_ms: parse_or("LOCK_LEASE_MS", 30_000),
            lock_acquire_timeout_ms: parse_or("LOCK_ACQUIRE_TIMEOUT_MS", 60_000),
            lock_retry_ms: parse_or("LOCK_RETRY_MS", 50),
            transcode: parse_or("TRANSCODE", true),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            audio_format: env::var("AUDIO_FORMAT").unwrap_or_else(|_| "mp3".to_string()),
            audio_bitrate: env::var("AUDIO_BITRATE").unwrap_or_else(|_| "192k".to_string()),
            metrics_enabled: parse_or("METRICS_ENABLED", true),
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            retention: Duration::from_secs(self.cache_expiry_secs),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            max_empty_polls: self.max_empty_polls,
            poll_reset: self.poll_reset,
            key_prefix: self.key_prefix.clone(),
        }
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            lease: Duration::from_millis(self.lock_lease_ms),
            acquire_timeout: Duration::from_millis(self.lock_acquire_timeout_ms),
            retry_interval: Duration::from_millis(self.lock_retry_ms),
        }
    }

    pub fn produce_options(&self) -> ProduceOptions {
        ProduceOptions {
            format: self.audio_format.clone(),
            bitrate: self.audio_bitrate.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Set env vars, run `f`, then restore the previous values.
    ///
    /// `set` are applied and `unset` removed before running `f`.
    fn with_env(set: &[(&str, &str)], unset: &[&str], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let saved: Vec<(&str, Option<String>)> = set
            .iter()
            .map(|(k, _)| *k)
            .chain(unset.iter().copied())
            .map(|k| (k, env::var(k).ok()))
            .collect();

        for (k, v) in set {
            // SAFETY: ENV_LOCK serializes every env mutation in this module.
            unsafe { env::set_var(k, v) };
        }
        for k in unset {
            unsafe { env::remove_var(k) };
        }

        f();

        for (k, old) in saved {
            match old {
                Some(v) => unsafe { env::set_var(k, v) },
                None => unsafe { env::remove_var(k) },
            }
        }
    }

    const TUNING_VARS: &[&str] = &[
        "PORT",
        "SOURCE_URL",
        "LOG_STORE",
        "KEY_PREFIX",
        "CACHE_EXPIRY_SECS",
        "POLL_TIMEOUT_MS",
        "MAX_EMPTY_POLLS",
        "POLL_RESET",
        "LOCK_LEASE_MS",
        "TRANSCODE",
        "AUDIO_FORMAT",
        "AUDIO_BITRATE",
    ];

    #[test]
    fn dev_mode_uses_defaults() {
        with_env(&[("DEV_MODE", "true")], TUNING_VARS, || {
            let config = Config::from_env().expect("should succeed in dev mode");
            assert!(config.is_dev);
            assert_eq!(config.port, 3000);
            assert_eq!(config.source_url, "http://localhost:8080/{id}");
            assert_eq!(config.log_store, LogStoreType::Memory);
            assert_eq!(config.key_prefix, "tailcast");
            assert_eq!(config.cache_expiry_secs, 14_400);
            assert_eq!(config.poll_timeout_ms, 100);
            assert_eq!(config.max_empty_polls, 10);
            assert_eq!(config.poll_reset, PollReset::AnyEntry);
            assert!(config.transcode);
            assert_eq!(config.audio_format, "mp3");
            assert_eq!(config.audio_bitrate, "192k");
        });
    }

    #[test]
    fn prod_mode_requires_port() {
        with_env(&[], &["DEV_MODE", "PORT", "SOURCE_URL"], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without PORT in prod mode");
        });
    }

    #[test]
    fn prod_mode_requires_source_url() {
        with_env(&[("PORT", "8080")], &["DEV_MODE", "SOURCE_URL"], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without SOURCE_URL in prod mode");
        });
    }

    #[test]
    fn invalid_source_url_is_rejected() {
        with_env(
            &[("DEV_MODE", "true"), ("SOURCE_URL", "not a url/{id}")],
            &[],
            || {
                assert!(Config::from_env().is_err());
            },
        );
    }

    #[test]
    fn log_store_valkey_and_redis_alias() {
        for value in ["valkey", "redis", "VALKEY"] {
            with_env(&[("DEV_MODE", "true"), ("LOG_STORE", value)], &[], || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.log_store, LogStoreType::Valkey);
            });
        }
    }

    #[test]
    fn tuning_values_parsed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("CACHE_EXPIRY_SECS", "60"),
                ("POLL_TIMEOUT_MS", "250"),
                ("MAX_EMPTY_POLLS", "40"),
                ("POLL_RESET", "data"),
                ("LOCK_LEASE_MS", "5000"),
            ],
            &[],
            || {
                let config = Config::from_env().unwrap();
                let cache = config.cache_config();
                assert_eq!(cache.retention, Duration::from_secs(60));
                assert_eq!(cache.poll_timeout, Duration::from_millis(250));
                assert_eq!(cache.max_empty_polls, 40);
                assert_eq!(cache.poll_reset, PollReset::DataEntry);
                assert_eq!(config.lock_config().lease, Duration::from_millis(5000));
            },
        );
    }

    #[test]
    fn unparsable_tuning_falls_back_to_default() {
        with_env(
            &[("DEV_MODE", "true"), ("MAX_EMPTY_POLLS", "lots")],
            &[],
            || {
                assert_eq!(Config::from_env().unwrap().max_empty_polls, 10);
            },
        );
    }

    #[test]
    fn zero_poll_settings_are_rejected() {
        for var in ["POLL_TIMEOUT_MS", "MAX_EMPTY_POLLS"] {
            with_env(&[("DEV_MODE", "true"), (var, "0")], &[], || {
                let err = Config::from_env().unwrap_err();
                assert!(err.to_string().contains(var), "{err}");
            });
        }
    }

    #[test]
    fn produce_options_follow_audio_settings() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("AUDIO_FORMAT", "ogg"),
                ("AUDIO_BITRATE", "96k"),
                ("TRANSCODE", "false"),
            ],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert!(!config.transcode);
                let opts = config.produce_options();
                assert_eq!(opts.format, "ogg");
                assert_eq!(opts.bitrate, "96k");
            },
        );
    }
}
