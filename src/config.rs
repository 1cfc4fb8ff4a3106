use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub port: u16,
    pub broadcast_capacity: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub stream_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".chatting").join("chatting.db"),
            port: 3000,
            broadcast_capacity: crate::bus::DEFAULT_CAPACITY,
            default_page_size: 3,
            max_page_size: 100,
            stream_poll_interval: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Read settings from the process environment. Call after `dotenvy::dotenv()`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        // We use ~/.chatting/chatting.db unless told otherwise
        let database_path = match get("CHAT_DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = get("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(defaults.database_path)
            }
        };

        let config = Self {
            database_path,
            port: parse(&get, "CHAT_PORT", defaults.port)?,
            broadcast_capacity: parse(&get, "CHAT_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            default_page_size: parse(&get, "CHAT_DEFAULT_PAGE_SIZE", defaults.default_page_size)?,
            max_page_size: parse(&get, "CHAT_MAX_PAGE_SIZE", defaults.max_page_size)?,
            stream_poll_interval: Duration::from_millis(parse(
                &get,
                "CHAT_STREAM_POLL_MS",
                defaults.stream_poll_interval.as_millis() as u64,
            )?),
        };

        if config.default_page_size == 0 || config.default_page_size > config.max_page_size {
            anyhow::bail!(
                "CHAT_DEFAULT_PAGE_SIZE must be between 1 and CHAT_MAX_PAGE_SIZE ({})",
                config.max_page_size
            );
        }

        Ok(config)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
