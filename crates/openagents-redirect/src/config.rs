use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::broadcast::{FileStore, KeyValueStore, MemoryStore};
use crate::launcher::CommandLauncher;
use crate::loopback::{DEFAULT_BIND_HOST, DEFAULT_CALLBACK_PATH, LoopbackOptions, PortPolicy};

const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const STATE_FILE_NAME: &str = "redirect-state.json";

#[derive(Clone, Debug)]
pub struct RedirectConfig {
    pub bind_host: IpAddr,
    pub callback_path: String,
    pub port: PortPolicy,
    /// `None` disables the operation deadline.
    pub timeout: Option<Duration>,
    pub browser_command: Option<String>,
    pub state_dir: Option<PathBuf>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            port: PortPolicy::Ephemeral,
            timeout: Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            browser_command: None,
            state_dir: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid OPENAGENTS_REDIRECT_BIND_HOST: {0}")]
    InvalidBindHost(String),
    #[error("invalid OPENAGENTS_REDIRECT_CALLBACK_PATH: {0}")]
    InvalidCallbackPath(String),
    #[error("invalid OPENAGENTS_REDIRECT_PORT: {0}")]
    InvalidPort(String),
    #[error("invalid OPENAGENTS_REDIRECT_TIMEOUT_MS: {0}")]
    InvalidTimeout(String),
    #[error("invalid OPENAGENTS_REDIRECT_BROWSER_COMMAND: {0}")]
    InvalidBrowserCommand(String),
}

impl RedirectConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads every setting through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let bind_host = match read("OPENAGENTS_REDIRECT_BIND_HOST") {
            None => defaults.bind_host,
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|error| ConfigError::InvalidBindHost(format!("{raw}: {error}")))?,
        };
        let callback_path = match read("OPENAGENTS_REDIRECT_CALLBACK_PATH") {
            None => defaults.callback_path,
            Some(raw) if raw.starts_with('/') && !raw.contains(['?', '#']) => raw,
            Some(raw) => return Err(ConfigError::InvalidCallbackPath(raw)),
        };
        let port = match read("OPENAGENTS_REDIRECT_PORT") {
            None => defaults.port,
            Some(raw) => PortPolicy::parse(&raw).map_err(ConfigError::InvalidPort)?,
        };
        let timeout = match read("OPENAGENTS_REDIRECT_TIMEOUT_MS") {
            None => defaults.timeout,
            Some(raw) => match raw
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidTimeout(format!("{raw}: {error}")))?
            {
                0 => None,
                millis => Some(Duration::from_millis(millis)),
            },
        };
        let browser_command = read("OPENAGENTS_REDIRECT_BROWSER_COMMAND");
        if let Some(command) = browser_command.as_deref()
            && CommandLauncher::from_command_line(command).is_none()
        {
            return Err(ConfigError::InvalidBrowserCommand(command.to_string()));
        }
        let state_dir = read("OPENAGENTS_REDIRECT_STATE_DIR").map(PathBuf::from);

        Ok(Self {
            bind_host,
            callback_path,
            port,
            timeout,
            browser_command,
            state_dir,
        })
    }

    #[must_use]
    pub fn loopback_options(&self) -> LoopbackOptions {
        LoopbackOptions::default()
            .with_bind_host(self.bind_host)
            .with_port(self.port)
            .with_callback_path(self.callback_path.clone())
    }

    /// Browser launcher from `OPENAGENTS_REDIRECT_BROWSER_COMMAND`, falling back
    /// to the platform opener.
    #[must_use]
    pub fn launcher(&self) -> CommandLauncher {
        self.browser_command
            .as_deref()
            .and_then(CommandLauncher::from_command_line)
            .unwrap_or_else(CommandLauncher::platform_default)
    }

    /// Durable store under the state directory, or an in-memory one when no
    /// directory is configured.
    #[must_use]
    pub fn state_store(&self) -> Arc<dyn KeyValueStore> {
        match &self.state_dir {
            Some(dir) => Arc::new(FileStore::new(dir.join(STATE_FILE_NAME))),
            None => MemoryStore::shared(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use super::*;

    fn config_from(values: &[(&str, &str)]) -> Result<RedirectConfig, ConfigError> {
        let values: HashMap<&str, &str> = values.iter().copied().collect();
        RedirectConfig::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).expect("defaults");
        assert_eq!(config.bind_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.callback_path, "/callback");
        assert_eq!(config.port, PortPolicy::Ephemeral);
        assert_eq!(config.timeout, Some(Duration::from_secs(300)));
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("OPENAGENTS_REDIRECT_BIND_HOST", "::1"),
            ("OPENAGENTS_REDIRECT_CALLBACK_PATH", "/oauth/done"),
            ("OPENAGENTS_REDIRECT_PORT", "8400-8410"),
            ("OPENAGENTS_REDIRECT_TIMEOUT_MS", "0"),
            ("OPENAGENTS_REDIRECT_BROWSER_COMMAND", "firefox --new-window"),
            ("OPENAGENTS_REDIRECT_STATE_DIR", "/tmp/redirect"),
        ])
        .expect("overrides");
        assert!(config.bind_host.is_ipv6());
        assert_eq!(
            config.port,
            PortPolicy::Range {
                start: 8400,
                end: 8410
            }
        );
        assert_eq!(config.timeout, None);
        assert_eq!(config.launcher().program(), "firefox");
        assert_eq!(config.loopback_options().callback_path, "/oauth/done");
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/redirect")));
    }

    #[test]
    fn invalid_values_name_their_variable() {
        let error = config_from(&[("OPENAGENTS_REDIRECT_PORT", "99999")]).expect_err("port");
        assert!(matches!(error, ConfigError::InvalidPort(_)));
        assert!(error.to_string().contains("OPENAGENTS_REDIRECT_PORT"));

        let error =
            config_from(&[("OPENAGENTS_REDIRECT_TIMEOUT_MS", "soon")]).expect_err("timeout");
        assert!(matches!(error, ConfigError::InvalidTimeout(_)));

        let error = config_from(&[("OPENAGENTS_REDIRECT_CALLBACK_PATH", "callback?x=1")])
            .expect_err("path");
        assert!(matches!(error, ConfigError::InvalidCallbackPath(_)));

        let error =
            config_from(&[("OPENAGENTS_REDIRECT_BIND_HOST", "localhost")]).expect_err("host");
        assert!(matches!(error, ConfigError::InvalidBindHost(_)));
    }

    #[test]
    fn state_store_uses_state_dir_when_present() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = RedirectConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..RedirectConfig::default()
        };
        config.state_store().set("key", "value")?;
        assert!(dir.path().join(STATE_FILE_NAME).exists());
        Ok(())
    }
}
