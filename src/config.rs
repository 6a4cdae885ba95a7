use tracing::warn;
use url::Url;

use crate::{bilibili::DEFAULT_API_BASE, error::ApiError, non_empty};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEV_ORIGINS: [&str; 2] = ["http://127.0.0.1:5173", "http://localhost:5173"];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub api_base: String,
    /// Normalised `scheme://host[:port]` entries.
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ApiError> {
        let bind_addr = resolve_bind_addr(read_env("APP_ADDR"), read_env("PORT"));

        let api_base = read_env("BILIBILI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Url::parse(&api_base).map_err(|error| {
            ApiError::internal(format!("Invalid BILIBILI_API_BASE {api_base:?}: {error}"))
        })?;

        let configured = read_env("ALLOWED_ORIGINS")
            .map(|value| parse_origin_list(&value))
            .unwrap_or_default();
        let origins = if configured.is_empty() {
            warn!("ALLOWED_ORIGINS is not set. Falling back to the local dev origins.");
            DEV_ORIGINS.iter().map(ToString::to_string).collect()
        } else {
            configured
        };

        Ok(Self {
            bind_addr,
            api_base,
            allowed_origins: normalize_origins(&origins)?,
        })
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_origin_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn normalize_origins(origins: &[String]) -> Result<Vec<String>, ApiError> {
    let mut normalized = Vec::with_capacity(origins.len());
    for origin in origins {
        let value = normalize_origin(origin).ok_or_else(|| {
            ApiError::internal(format!(
                "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected something like https://example.com"
            ))
        })?;
        if !normalized.contains(&value) {
            normalized.push(value);
        }
    }
    Ok(normalized)
}

pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
