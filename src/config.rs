use std::{path::PathBuf, time::Duration};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_COOKIE_FILE: &str = "cookies.txt";
pub const DEFAULT_DELETE_DELAY_SECONDS: u64 = 10;
pub const DEFAULT_YT_DLP_COMMAND: &str = "yt-dlp";

/// Process-wide settings, resolved once at startup and handed to the
/// handlers through the router state.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Working directory that receives `<id>.<ext>` files.
    pub download_dir: PathBuf,
    /// Browser-exported cookie jar, only read when a request sets `use_cookies`.
    pub cookie_file: PathBuf,
    pub delete_delay: Duration,
    /// yt-dlp program followed by any leading arguments, e.g. `python3 -m yt_dlp`.
    pub yt_dlp_command: Vec<String>,
    pub yt_dlp_timeout: Option<Duration>,
    /// Empty means any origin is allowed.
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            cookie_file: PathBuf::from(DEFAULT_COOKIE_FILE),
            delete_delay: Duration::from_secs(DEFAULT_DELETE_DELAY_SECONDS),
            yt_dlp_command: vec![DEFAULT_YT_DLP_COMMAND.to_string()],
            yt_dlp_timeout: None,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let download_dir = read_string(&lookup, "DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.download_dir);
        let cookie_file = read_string(&lookup, "COOKIE_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.cookie_file);
        let delete_delay = read_u64(&lookup, "FILE_DELETE_DELAY_SECONDS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.delete_delay);
        let yt_dlp_command = read_string(&lookup, "YT_DLP_COMMAND")
            .map(|value| value.split_whitespace().map(ToString::to_string).collect())
            .unwrap_or(defaults.yt_dlp_command);
        let yt_dlp_timeout = read_u64(&lookup, "YT_DLP_TIMEOUT_SECONDS")
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs);
        let allowed_origins = read_string(&lookup, "ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            download_dir,
            cookie_file,
            delete_delay,
            yt_dlp_command,
            yt_dlp_timeout,
            allowed_origins,
        }
    }
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = read_string(lookup, "APP_ADDR") {
        return configured;
    }

    if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
