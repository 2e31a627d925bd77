//! Configuration file loading for Tether.
//!
//! The file lives at `~/.tether/config.toml`. Every section is optional; a
//! missing file is not an error.

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::Deserialize;
use tether_lsp::LspConfig;

#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    /// Language server client configuration.
    pub lsp: Option<LspConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace `${VAR}` with the variable's value (empty if unset). An unclosed
/// `${` is kept as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + end_rel];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + end_rel + 1..];
    }

    out.push_str(rest);
    out
}

impl TetherConfig {
    /// Load from the default location. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let mut config: Self = toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        config.expand_server_env();
        tracing::debug!("Loaded config from {}", path.display());
        Ok(Some(config))
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// The LSP section, or the disabled default.
    #[must_use]
    pub fn lsp_or_default(&self) -> LspConfig {
        self.lsp.clone().unwrap_or_default()
    }

    fn expand_server_env(&mut self) {
        let Some(lsp) = self.lsp.as_mut() else {
            return;
        };
        for server in lsp.servers.values_mut() {
            for arg in &mut server.args {
                *arg = expand_env_vars(arg);
            }
            for value in server.env.values_mut() {
                *value = expand_env_vars(value);
            }
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}
