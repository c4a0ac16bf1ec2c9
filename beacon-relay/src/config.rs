//! Configuration system for the Beacon signaling relay.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/beacon-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    admission: AdmissionFileConfig,
    reaper: ReaperFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    cors_origins: Option<Vec<String>>,
}

/// `[admission]` section: per-source-address rate gate.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AdmissionFileConfig {
    burst: Option<u32>,
    window_secs: Option<u64>,
}

/// `[reaper]` section: idle-session eviction.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReaperFileConfig {
    sweep_interval_secs: Option<u64>,
    session_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the signaling relay.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Beacon signaling relay")]
pub struct RelayCliArgs {
    /// Address to bind the relay to.
    #[arg(short, long, env = "BEACON_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/beacon-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Allowed cross-origin origins; `*` allows any.
    #[arg(long = "cors-origin", env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origin: Vec<String>,

    /// Seconds between liveness reaper sweeps.
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Seconds of silence after which a session is evicted.
    #[arg(long)]
    pub session_timeout_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BEACON_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:3001`).
    pub bind_addr: String,
    /// Origin allow-list for the HTTP surface; `*` allows any origin.
    pub cors_origins: Vec<String>,
    /// Admission filter: tokens granted per source address per window.
    pub admit_burst: u32,
    /// Admission filter: refill window in seconds.
    pub admit_window_secs: u64,
    /// Seconds between liveness reaper sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds of silence after which a session is evicted.
    pub session_timeout_secs: u64,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3001".to_string(),
            cors_origins: vec!["*".to_string()],
            admit_burst: 100,
            admit_window_secs: 60,
            sweep_interval_secs: 300,
            session_timeout_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            cors_origins: if cli.cors_origin.is_empty() {
                file.server
                    .cors_origins
                    .clone()
                    .unwrap_or(defaults.cors_origins)
            } else {
                cli.cors_origin.clone()
            },
            admit_burst: file.admission.burst.unwrap_or(defaults.admit_burst),
            admit_window_secs: file
                .admission
                .window_secs
                .unwrap_or(defaults.admit_window_secs),
            sweep_interval_secs: cli
                .sweep_interval_secs
                .or(file.reaper.sweep_interval_secs)
                .unwrap_or(defaults.sweep_interval_secs),
            session_timeout_secs: cli
                .session_timeout_secs
                .or(file.reaper.session_timeout_secs)
                .unwrap_or(defaults.session_timeout_secs),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("beacon-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
