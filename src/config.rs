//! Runner configuration module
//!
//! Parses and manages the `hasp_emu_server` binary's configuration from a
//! YAML file. Uses serde_yaml for parsing — just define the struct and serde
//! handles all the parsing, validation, and type conversion!

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Maximum number of tokens a single runner will load.
pub const TOKEN_MAX: usize = 64;

/// One emulated token: which key file to load and which TCP port to serve
/// it on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBinding {
    /// Path to a JSON token-definition file (see `loader` module).
    pub key_file: String,

    /// TCP port this token is served on.
    pub port: u16,
}

/// Top-level configuration for the `hasp_emu_server` binary.
///
/// Parsed from YAML by serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Address the server binds each token's listener to, e.g. `"127.0.0.1"`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Tracing filter passed to `tracing_subscriber::EnvFilter`, e.g.
    /// `"info"` or `"hasp_emu=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tokens to load and serve.
    pub tokens: Vec<TokenBinding>,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RunnerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use hasp_emu::config::RunnerConfig;
    ///
    /// let config = RunnerConfig::from_file("conf/runner.yaml")
    ///     .expect("Failed to load config");
    /// println!("tokens: {}", config.tokens.len());
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RunnerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    ///
    /// Useful for testing
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: RunnerConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.tokens.is_empty(), "at least one token must be configured");
        anyhow::ensure!(
            self.tokens.len() <= TOKEN_MAX,
            "too many tokens: {} (max {})",
            self.tokens.len(),
            TOKEN_MAX
        );

        for binding in &self.tokens {
            anyhow::ensure!(!binding.key_file.is_empty(), "key_file cannot be empty");
        }

        let mut ports: Vec<u16> = self.tokens.iter().map(|b| b.port).collect();
        ports.sort_unstable();
        for pair in ports.windows(2) {
            anyhow::ensure!(pair[0] != pair[1], "duplicate port {} in tokens list", pair[0]);
        }

        Ok(())
    }

    /// Save configuration to a YAML file
    ///
    /// Useful for generating config templates or saving modified configs
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self).context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}
