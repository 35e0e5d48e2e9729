use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "qwen2.5:3b";
const DEFAULT_CHAT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_WARMUP_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Base URL of the inference server, without trailing slash.
    pub ollama_host: String,
    pub model: String,
    pub chat_timeout: Duration,
    pub warmup_timeout: Duration,
    pub warmup: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            model: DEFAULT_MODEL.to_string(),
            chat_timeout: Duration::from_secs(DEFAULT_CHAT_TIMEOUT_SECS),
            warmup_timeout: Duration::from_secs(DEFAULT_WARMUP_TIMEOUT_SECS),
            warmup: true,
        }
    }
}

impl RelayConfig {
    /// Reads the process environment. Call `dotenv::dotenv()` first so a
    /// local `.env` file is honoured.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host: IpAddr = match lookup("HOST") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("HOST is not an IP address: {raw}"))?,
            None => defaults.bind_addr.ip(),
        };
        let port = parse_or("PORT", &lookup, DEFAULT_PORT)?;

        let ollama_host = lookup("OLLAMA_HOST")
            .map(|h| h.trim().trim_end_matches('/').to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or(defaults.ollama_host);
        let model = lookup("OLLAMA_MODEL")
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or(defaults.model);

        let chat_timeout = Duration::from_secs(parse_or(
            "CHAT_TIMEOUT_SECS",
            &lookup,
            DEFAULT_CHAT_TIMEOUT_SECS,
        )?);
        let warmup_timeout = Duration::from_secs(parse_or(
            "WARMUP_TIMEOUT_SECS",
            &lookup,
            DEFAULT_WARMUP_TIMEOUT_SECS,
        )?);
        let warmup = match lookup("WARMUP") {
            Some(raw) => !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            ),
            None => true,
        };

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            ollama_host,
            model,
            chat_timeout,
            warmup_timeout,
            warmup,
        })
    }

    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.ollama_host)
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8000)));
        assert_eq!(config.ollama_host, "http://127.0.0.1:11434");
        assert_eq!(config.model, "qwen2.5:3b");
        assert_eq!(config.chat_timeout, Duration::from_secs(120));
        assert_eq!(config.warmup_timeout, Duration::from_secs(20));
        assert!(config.warmup);
    }

    #[test]
    fn overrides_and_trailing_slash() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("PORT", "9100"),
            ("OLLAMA_HOST", "http://gpu-box:11434/"),
            ("OLLAMA_MODEL", "llama3.1"),
            ("CHAT_TIMEOUT_SECS", "5"),
            ("WARMUP", "off"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.chat_url(), "http://gpu-box:11434/api/chat");
        assert_eq!(config.model, "llama3.1");
        assert_eq!(config.chat_timeout, Duration::from_secs(5));
        assert!(!config.warmup);
    }

    #[test]
    fn bad_number_is_an_error() {
        let err = RelayConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
