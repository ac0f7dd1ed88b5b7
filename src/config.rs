use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SITE_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_CONTEXT_LIMIT: usize = 5;
pub const DEFAULT_CONTEXT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_FRAME_BUFFER: usize = 16;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub site_addr: SocketAddr,
    pub supabase: Option<SupabaseConfig>,
    pub jwt_secret: String,
    pub context_limit: usize,
    pub context_timeout: Duration,
    pub frame_buffer: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let site_addr = parse_or(&lookup, "SITE_ADDR", DEFAULT_SITE_ADDR.parse().ok())?;
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|secret| !secret.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        Ok(AppConfig {
            site_addr,
            supabase: supabase_from(&lookup),
            jwt_secret,
            context_limit: parse_or(&lookup, "COPILOT_CONTEXT_LIMIT", Some(DEFAULT_CONTEXT_LIMIT))?,
            context_timeout: Duration::from_millis(parse_or(
                &lookup,
                "COPILOT_CONTEXT_TIMEOUT_MS",
                Some(DEFAULT_CONTEXT_TIMEOUT_MS),
            )?),
            frame_buffer: parse_or(&lookup, "COPILOT_FRAME_BUFFER", Some(DEFAULT_FRAME_BUFFER))?
                .max(1),
        })
    }

    /// Configuration with in-memory backends, used by tests and local runs.
    pub fn local(jwt_secret: impl Into<String>) -> Self {
        AppConfig {
            site_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            supabase: None,
            jwt_secret: jwt_secret.into(),
            context_limit: DEFAULT_CONTEXT_LIMIT,
            context_timeout: Duration::from_millis(DEFAULT_CONTEXT_TIMEOUT_MS),
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

/// Settings for the terminal client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub owner: Option<String>,
    pub supabase: Option<SupabaseConfig>,
    pub idle_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("COPILOT_URL").unwrap_or_else(|| format!("http://{DEFAULT_SITE_ADDR}"));

        Ok(ClientConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: lookup("COPILOT_TOKEN").filter(|token| !token.is_empty()),
            owner: lookup("COPILOT_OWNER").filter(|owner| !owner.is_empty()),
            supabase: supabase_from(&lookup),
            idle_timeout: Duration::from_millis(parse_or(
                &lookup,
                "COPILOT_IDLE_TIMEOUT_MS",
                Some(DEFAULT_IDLE_TIMEOUT_MS),
            )?),
        })
    }
}

fn supabase_from<F>(lookup: &F) -> Option<SupabaseConfig>
where
    F: Fn(&str) -> Option<String>,
{
    match (lookup("SUPABASE_URL"), lookup("SUPABASE_KEY")) {
        (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => Some(SupabaseConfig {
            url: url.trim_end_matches('/').to_string(),
            key,
        }),
        _ => None,
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => default.ok_or(ConfigError::Missing(key)),
    }
}
