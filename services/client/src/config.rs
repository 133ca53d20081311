use crate::media::CaptureConstraints;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub token_url: String,
    pub default_agent_id: Option<String>,
    pub log_level: Level,
    pub capture: CaptureConstraints,
}

fn flag(name: &str, default: bool) -> Result<bool, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not a boolean", raw),
        )),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let token_url = std::env::var("VOICE_TOKEN_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("VOICE_TOKEN_URL".to_string()))?;
        if !token_url.starts_with("http://") && !token_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "VOICE_TOKEN_URL".to_string(),
                format!("'{}' is not an http(s) URL", token_url),
            ));
        }

        let default_agent_id = std::env::var("VOICE_AGENT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let capture = CaptureConstraints {
            echo_cancellation: flag("VOICE_ECHO_CANCELLATION", true)?,
            noise_suppression: flag("VOICE_NOISE_SUPPRESSION", true)?,
            auto_gain_control: flag("VOICE_AUTO_GAIN", true)?,
        };

        Ok(Self {
            token_url,
            default_agent_id,
            log_level,
            capture,
        })
    }
}
