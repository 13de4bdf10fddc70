use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::agent::DEFAULT_MODEL;

/// How the gateway runs the agent for a TEXT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Acknowledge immediately; the agent runs on a spawned task.
    #[default]
    Background,
    /// Run the agent and store its outcome before acknowledging.
    Inline,
}

impl FromStr for DispatchMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "background" => Ok(DispatchMode::Background),
            "inline" => Ok(DispatchMode::Inline),
            other => bail!("unknown dispatch mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentBackend {
    #[default]
    Ollama,
    Echo,
}

impl FromStr for AgentBackend {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(AgentBackend::Ollama),
            "echo" => Ok(AgentBackend::Echo),
            other => bail!("unknown agent backend: {other}"),
        }
    }
}

/// Gateway behaviour, shared by the binary and tests.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub dispatch: DispatchMode,
    pub agent_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::Background,
            agent_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When unset the backend keeps responses in memory.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub agent: AgentBackend,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("PORT", 5051)?,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
            agent: parse_var("AGENT_BACKEND", AgentBackend::Ollama)?,
            ollama_base_url: env::var("OLLAMA_API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            ollama_model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            gateway: GatewayConfig {
                dispatch: parse_var("DISPATCH_MODE", DispatchMode::Background)?,
                agent_timeout: Duration::from_secs(parse_var("AGENT_TIMEOUT_SECS", 120)?),
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Polling client behaviour.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    /// How long a message may stay unanswered before it is failed locally.
    pub message_ttl: Duration,
    /// Consecutive poll failures tolerated before the user is told.
    pub max_transport_failures: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5051".to_string(),
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            message_ttl: Duration::from_secs(120),
            max_transport_failures: 5,
        }
    }
}

/// Shortest tick the polling loops will run at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let poll_interval_ms: u64 =
            parse_var("POLL_INTERVAL_MS", defaults.poll_interval.as_millis() as u64)?;
        if poll_interval_ms == 0 {
            bail!("invalid value for POLL_INTERVAL_MS: must be greater than zero");
        }
        Ok(Self {
            base_url: env::var("CHAT_SERVER_URL").unwrap_or(defaults.base_url),
            request_timeout: Duration::from_secs(parse_var(
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            poll_interval: Duration::from_millis(poll_interval_ms),
            message_ttl: Duration::from_secs(parse_var(
                "MESSAGE_TTL_SECS",
                defaults.message_ttl.as_secs(),
            )?),
            max_transport_failures: parse_var(
                "MAX_TRANSPORT_FAILURES",
                defaults.max_transport_failures,
            )?,
        })
    }
}

impl ClientConfig {
    /// `poll_interval`, never below [`MIN_POLL_INTERVAL`].
    pub fn poll_period(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {name}: {raw}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!("Inline".parse::<DispatchMode>().unwrap(), DispatchMode::Inline);
        assert_eq!("ECHO".parse::<AgentBackend>().unwrap(), AgentBackend::Echo);
        assert!("sometimes".parse::<DispatchMode>().is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected_or_clamped() {
        env::set_var("POLL_INTERVAL_MS", "0");
        let err = ClientConfig::from_env().unwrap_err();
        env::remove_var("POLL_INTERVAL_MS");
        assert!(err.to_string().contains("POLL_INTERVAL_MS"), "{err}");

        let config = ClientConfig { poll_interval: Duration::ZERO, ..ClientConfig::default() };
        assert_eq!(config.poll_period(), MIN_POLL_INTERVAL);
        assert_eq!(ClientConfig::default().poll_period(), Duration::from_secs(2));
    }

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        let port: u16 = parse_var("CHAT_RELAY_TEST_UNSET_PORT", 5051).unwrap();
        assert_eq!(port, 5051);
    }
}
