use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_AGENT_COMMAND: &str = "sandbox-agent --output-format stream-json";
const DEFAULT_SHELL_COMMAND: &str = "/bin/bash -l";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub start_timeout: Duration,
    pub ssh_public_key: Option<String>,
    pub agent_command: String,
    pub shell_command: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let idle_minutes: u64 = parse_or("IDLE_TIMEOUT_MINUTES", 10)?;
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            listen_addr: parse_or("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            control_plane_api_key: required("CONTROL_PLANE_API_KEY")?,
            idle_timeout: Duration::from_secs(idle_minutes * 60),
            sweep_interval: Duration::from_secs(parse_or("IDLE_SWEEP_INTERVAL_SECS", 60)?),
            start_timeout: Duration::from_secs(parse_or("START_TIMEOUT_SECS", 120)?),
            ssh_public_key: optional("SSH_PUBLIC_KEY"),
            agent_command: optional("AGENT_COMMAND").unwrap_or_else(|| DEFAULT_AGENT_COMMAND.into()),
            shell_command: optional("SHELL_COMMAND").unwrap_or_else(|| DEFAULT_SHELL_COMMAND.into()),
        })
    }

    /// Name agent events are attributed to: the agent program's file name.
    pub fn agent_name(&self) -> &str {
        let program = self.agent_command.split_whitespace().next().unwrap_or("agent");
        program.rsplit('/').next().unwrap_or(program)
    }
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://localhost/sandbox".into(),
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        control_plane_api_key: "test-key".into(),
        idle_timeout: Duration::from_secs(600),
        sweep_interval: Duration::from_secs(60),
        start_timeout: Duration::from_secs(5),
        ssh_public_key: Some("ssh-ed25519 AAAA test".into()),
        agent_command: DEFAULT_AGENT_COMMAND.into(),
        shell_command: DEFAULT_SHELL_COMMAND.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_name_is_program_basename() {
        let mut config = test_config();
        assert_eq!(config.agent_name(), "sandbox-agent");

        config.agent_command = "/usr/local/bin/claude -p".into();
        assert_eq!(config.agent_name(), "claude");
    }
}
