// src/config/mod.rs
//! Startup configuration. Everything is read once at process start; a missing
//! required value is fatal before any browser or network work begins.

pub mod tuning;

pub use tuning::{load_tuning_default, load_tuning_from, SummaryFallback, Tuning};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::cursor::DEFAULT_CURSOR_PATH;
use crate::post::Credentials;

pub const ENV_PROFILE_URL: &str = "TARGET_PROFILE_URL";
pub const ENV_LOGIN_URL: &str = "TARGET_LOGIN_URL";
pub const ENV_LOGIN_EMAIL: &str = "TARGET_LOGIN_EMAIL";
pub const ENV_LOGIN_PASSWORD: &str = "TARGET_LOGIN_PASSWORD";
pub const ENV_BACKEND_BASE_URL: &str = "BACKEND_BASE_URL";
pub const ENV_BACKEND_RESOURCE: &str = "BACKEND_RESOURCE";
pub const ENV_BACKEND_API_TOKEN: &str = "BACKEND_API_TOKEN";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_MODEL: &str = "OPENAI_MODEL_NAME";
pub const ENV_OPENAI_API_BASE: &str = "OPENAI_API_BASE";
pub const ENV_SUMMARIZER_MODE: &str = "SUMMARIZER_MODE";
pub const ENV_WEBDRIVER_URL: &str = "WEBDRIVER_URL";
pub const ENV_MANUAL_MODE: &str = "MANUAL_MODE";
pub const ENV_PROXY: &str = "PROXY";
pub const ENV_BROWSER_PROFILE_DIR: &str = "BROWSER_PROFILE_DIR";
pub const ENV_SCREENSHOT_DIR: &str = "SCREENSHOT_DIR";
pub const ENV_CURSOR_PATH: &str = "CURSOR_PATH";
pub const ENV_LOCK_PATH: &str = "LOCK_PATH";
pub const ENV_RUN_INTERVAL_SECS: &str = "RUN_INTERVAL_SECS";
pub const ENV_METRICS_ADDR: &str = "METRICS_ADDR";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

pub const DEFAULT_LOGIN_URL: &str = "https://www.linkedin.com/login";
pub const DEFAULT_BACKEND_RESOURCE: &str = "posts";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration incomplete: {}", .0.join("; "))]
    Incomplete(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizerMode {
    OpenAi,
    Mock,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub profile_url: Url,
    pub login_url: Url,
    pub credentials: Credentials,
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    /// Headed browser; a login challenge is left to the operator.
    pub manual_mode: bool,
    pub proxy: Option<String>,
    pub profile_dir: Option<PathBuf>,
    pub screenshot_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct BackendConfig {
    pub base_url: Url,
    pub resource: String,
    pub api_token: Option<String>,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url.as_str())
            .field("resource", &self.resource)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Clone)]
pub struct LlmConfig {
    pub mode: SummarizerMode,
    pub api_key: String,
    pub model: String,
    pub api_base: String,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("mode", &self.mode)
            .field("key_len", &self.api_key.len())
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub target: TargetConfig,
    pub browser: BrowserConfig,
    pub backend: BackendConfig,
    pub llm: LlmConfig,
    pub cursor_path: PathBuf,
    pub lock_path: PathBuf,
    pub run_interval: Option<Duration>,
    pub metrics_addr: Option<SocketAddr>,
    pub log: LogConfig,
    pub tuning: Tuning,
}

impl AppConfig {
    /// Read from the process environment (call `dotenvy::dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup. Collects every problem before failing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| clean_env_value(&v)).filter(|v| !v.is_empty());
        // secrets may legitimately contain '#' or quotes: trim only
        let secret = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut problems: Vec<String> = Vec::new();

        let mut required = |k: &'static str, v: Option<String>| -> String {
            v.unwrap_or_else(|| {
                problems.push(format!("{k} is required"));
                String::new()
            })
        };
        let profile_raw = required(ENV_PROFILE_URL, get(ENV_PROFILE_URL));
        let email = required(ENV_LOGIN_EMAIL, get(ENV_LOGIN_EMAIL));
        let password = required(ENV_LOGIN_PASSWORD, secret(ENV_LOGIN_PASSWORD));
        let backend_raw = required(ENV_BACKEND_BASE_URL, get(ENV_BACKEND_BASE_URL));

        let mode = match get(ENV_SUMMARIZER_MODE).as_deref().map(str::to_ascii_lowercase) {
            None => SummarizerMode::OpenAi,
            Some(m) if m == "openai" => SummarizerMode::OpenAi,
            Some(m) if m == "mock" => SummarizerMode::Mock,
            Some(other) => {
                problems.push(format!("{ENV_SUMMARIZER_MODE}: unknown mode {other:?}"));
                SummarizerMode::OpenAi
            }
        };
        let api_key = match (mode, secret(ENV_OPENAI_API_KEY)) {
            (_, Some(k)) => k,
            (SummarizerMode::Mock, None) => String::new(),
            (SummarizerMode::OpenAi, None) => {
                problems.push(format!("{ENV_OPENAI_API_KEY} is required"));
                String::new()
            }
        };

        let mut parse_url = |key: &str, raw: &str| -> Option<Url> {
            if raw.is_empty() {
                return None;
            }
            match Url::parse(raw) {
                Ok(u) if matches!(u.scheme(), "http" | "https") => Some(u),
                Ok(u) => {
                    problems.push(format!("{key}: unsupported scheme {}", u.scheme()));
                    None
                }
                Err(e) => {
                    problems.push(format!("{key}: {e}"));
                    None
                }
            }
        };
        let profile_url = parse_url(ENV_PROFILE_URL, &profile_raw);
        let login_url = parse_url(
            ENV_LOGIN_URL,
            &get(ENV_LOGIN_URL).unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
        );
        let base_url = parse_url(ENV_BACKEND_BASE_URL, &backend_raw);

        let run_interval = match get(ENV_RUN_INTERVAL_SECS) {
            None => None,
            Some(v) => match v.parse::<u64>() {
                Ok(0) => {
                    problems.push(format!("{ENV_RUN_INTERVAL_SECS}: must be positive"));
                    None
                }
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    problems.push(format!("{ENV_RUN_INTERVAL_SECS}: not a number: {v:?}"));
                    None
                }
            },
        };
        let metrics_addr = match get(ENV_METRICS_ADDR) {
            None => None,
            Some(v) => match v.parse::<SocketAddr>() {
                Ok(a) => Some(a),
                Err(_) => {
                    problems.push(format!("{ENV_METRICS_ADDR}: not a socket address: {v:?}"));
                    None
                }
            },
        };

        let tuning = match load_tuning_default(get(tuning::ENV_TUNING_PATH).as_deref()) {
            Ok(t) => t,
            Err(e) => {
                problems.push(format!("tuning: {e:#}"));
                Tuning::default()
            }
        };

        let (Some(profile_url), Some(login_url), Some(base_url)) = (profile_url, login_url, base_url)
        else {
            return Err(ConfigError::Incomplete(problems));
        };
        if !problems.is_empty() {
            return Err(ConfigError::Incomplete(problems));
        }

        let cursor_path = get(ENV_CURSOR_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CURSOR_PATH));
        let lock_path = get(ENV_LOCK_PATH).map(PathBuf::from).unwrap_or_else(|| {
            let mut p = cursor_path.clone().into_os_string();
            p.push(".lock");
            PathBuf::from(p)
        });

        Ok(Self {
            target: TargetConfig {
                profile_url,
                login_url,
                credentials: Credentials { email, password },
            },
            browser: BrowserConfig {
                webdriver_url: get(ENV_WEBDRIVER_URL)
                    .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string()),
                manual_mode: get(ENV_MANUAL_MODE).is_some_and(|v| is_truthy(&v)),
                proxy: get(ENV_PROXY),
                profile_dir: get(ENV_BROWSER_PROFILE_DIR).map(PathBuf::from),
                screenshot_dir: get(ENV_SCREENSHOT_DIR).map(PathBuf::from),
            },
            backend: BackendConfig {
                base_url,
                resource: get(ENV_BACKEND_RESOURCE)
                    .map(|r| r.trim_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_BACKEND_RESOURCE.to_string()),
                api_token: secret(ENV_BACKEND_API_TOKEN),
            },
            llm: LlmConfig {
                mode,
                api_key,
                model: get(ENV_OPENAI_MODEL).unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                api_base: get(ENV_OPENAI_API_BASE)
                    .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string()),
            },
            cursor_path,
            lock_path,
            run_interval,
            metrics_addr,
            log: LogConfig {
                level: get(ENV_LOG_LEVEL)
                    .map(|l| l.to_ascii_lowercase())
                    .unwrap_or_else(|| "info".to_string()),
                json: get(ENV_LOG_FORMAT).is_some_and(|f| f.eq_ignore_ascii_case("json")),
            },
            tuning,
        })
    }
}

/// Strip a trailing ` # comment` and one pair of surrounding quotes, as people
/// tend to write them in `.env` files. Not applied to passwords, keys or tokens.
pub fn clean_env_value(raw: &str) -> String {
    let mut v = raw.trim();
    if v.starts_with('#') {
        return String::new();
    }
    if let Some(idx) = v.find(" #").or_else(|| v.find("\t#")) {
        v = v[..idx].trim_end();
    }
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            v = &v[1..v.len() - 1];
            break;
        }
    }
    v.trim().to_string()
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
