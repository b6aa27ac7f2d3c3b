//! Container configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! context_path = "/shop"
//! session_timeout_secs = 1800
//! sweep_interval_ms = 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Settings for one [`Context`](crate::Context).
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Mount path stripped from every request path before routing.
    pub context_path: String,
    /// Default max-inactive interval for new sessions. `<= 0` never expires.
    pub session_timeout_secs: i64,
    /// Period of the background session sweep.
    pub sweep_interval_ms: u64,
    /// How long shutdown waits for the sweep task before aborting it.
    pub shutdown_grace_ms: u64,
    /// Response buffer capacity in bytes.
    pub buffer_size: usize,
    pub request_encoding: String,
    pub response_encoding: String,
    pub display_name: Option<String>,
    /// Name of the cookie carrying the session id.
    pub session_cookie_name: String,
    /// Value of the `Server` header injected at commit.
    pub server_info: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            context_path: "/".to_owned(),
            session_timeout_secs: 24 * 3600,
            sweep_interval_ms: 2000,
            shutdown_grace_ms: 2000,
            buffer_size: 4096,
            request_encoding: "UTF-8".to_owned(),
            response_encoding: "UTF-8".to_owned(),
            display_name: None,
            session_cookie_name: "jsessionid".to_owned(),
            server_info: concat!("hearth/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl ContainerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.context_path.starts_with('/') {
            return Err(Error::Config(format!(
                "context_path must start with `/`, got `{}`",
                self.context_path
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be positive".to_owned()));
        }
        if self.session_cookie_name.is_empty() {
            return Err(Error::Config("session_cookie_name cannot be empty".to_owned()));
        }
        if self.request_encoding.trim().is_empty() || self.response_encoding.trim().is_empty() {
            return Err(Error::Config("encodings cannot be blank".to_owned()));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The mount path without a trailing slash; `/` becomes the empty string.
    pub(crate) fn mount_prefix(&self) -> &str {
        self.context_path.trim_end_matches('/')
    }
}
