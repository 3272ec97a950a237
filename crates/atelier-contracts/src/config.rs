use std::collections::BTreeSet;
use std::env;

/// Retry behavior for one logical outbound call. `max_attempts` counts total
/// attempts, not retries after the first.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_seconds: f64,
    pub retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: 2.0,
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEndpoint {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageEndpoint {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub size: String,
}

/// Immutable process-wide configuration, read from the environment once at
/// startup and passed by reference into the engine. No component looks up
/// environment variables after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub chat: ChatEndpoint,
    pub image: ImageEndpoint,
    pub retry: RetryPolicy,
    pub chat_timeout_seconds: f64,
    pub image_timeout_seconds: f64,
    /// When false, upstream certificates are not verified
    /// (`TLS_VERIFY=false`). This is an explicit, opt-in trust reduction for
    /// environments where the image service presents a broken certificate
    /// chain. It is never the silent default, and disabling it is recorded
    /// in the event log at engine construction.
    pub verify_tls: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` but with an injectable variable source, so tests
    /// never mutate process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let chat = ChatEndpoint {
            api_url: endpoint_url(
                lookup("CHAT_API_URL"),
                "https://api.deepseek.com/chat/completions",
            ),
            api_key: non_empty(lookup("CHAT_API_KEY")),
            model: non_empty(lookup("CHAT_MODEL")).unwrap_or_else(|| "deepseek-chat".to_string()),
            temperature: clamped_f64(lookup("CHAT_TEMPERATURE"), 0.7, 0.0, 2.0),
        };
        let image = ImageEndpoint {
            api_url: endpoint_url(
                lookup("IMAGE_API_URL"),
                "https://api.acedata.cloud/flux/images",
            ),
            api_key: non_empty(lookup("IMAGE_API_KEY")),
            model: non_empty(lookup("IMAGE_MODEL")).unwrap_or_else(|| "flux".to_string()),
            size: non_empty(lookup("IMAGE_SIZE")).unwrap_or_else(|| "1024x1024".to_string()),
        };
        let retry = RetryPolicy {
            max_attempts: clamped_f64(lookup("RETRY_MAX_ATTEMPTS"), 3.0, 1.0, 10.0).round() as u32,
            backoff_seconds: clamped_f64(lookup("RETRY_BACKOFF_SECONDS"), 2.0, 0.0, 30.0),
            retryable_statuses: parse_status_set(lookup("RETRYABLE_STATUS_CODES")),
        };

        Self {
            chat,
            image,
            retry,
            chat_timeout_seconds: clamped_f64(lookup("CHAT_TIMEOUT_SECONDS"), 30.0, 1.0, 120.0),
            image_timeout_seconds: clamped_f64(lookup("IMAGE_TIMEOUT_SECONDS"), 180.0, 5.0, 600.0),
            verify_tls: bool_flag(lookup("TLS_VERIFY"), true),
        }
    }
}

pub fn default_retryable_statuses() -> BTreeSet<u16> {
    [429, 500, 502, 503, 504].into_iter().collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn endpoint_url(value: Option<String>, default: &str) -> String {
    non_empty(value)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn clamped_f64(value: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    non_empty(value)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

fn bool_flag(value: Option<String>, default: bool) -> bool {
    match non_empty(value) {
        Some(value) => !matches!(
            value.to_ascii_lowercase().as_str(),
            "false" | "0" | "no" | "off"
        ),
        None => default,
    }
}

fn parse_status_set(value: Option<String>) -> BTreeSet<u16> {
    let Some(raw) = non_empty(value) else {
        return default_retryable_statuses();
    };
    let parsed: BTreeSet<u16> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse::<u16>().ok())
        .filter(|code| (100..=599).contains(code))
        .collect();
    if parsed.is_empty() {
        default_retryable_statuses()
    } else {
        parsed
    }
}
