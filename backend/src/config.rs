use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_YT_DLP_PATH: &str = "yt-dlp";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub yt_dlp_path: String,
    pub resolve_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let resolve_timeout_secs = read_u64(&lookup, "YT_DLP_TIMEOUT_SECONDS")
            .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS);
        let connect_timeout_secs = read_u64(&lookup, "UPSTREAM_CONNECT_TIMEOUT_SECONDS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS);

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            yt_dlp_path: lookup("YT_DLP_PATH")
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| DEFAULT_YT_DLP_PATH.to_string()),
            resolve_timeout: (resolve_timeout_secs > 0)
                .then(|| Duration::from_secs(resolve_timeout_secs)),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        }
    }
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) =
        lookup("APP_ADDR").and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
