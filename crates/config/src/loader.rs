use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::BrainProxyConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "brainproxy.toml",
    "brainproxy.yaml",
    "brainproxy.yml",
    "brainproxy.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<BrainProxyConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load an explicitly requested file, or fall back to discovery.
///
/// An explicit path that fails to load is an error; a discovered one only
/// logs a warning and yields defaults.
pub fn load_or_discover(path: Option<&Path>) -> Result<BrainProxyConfig> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(path)
        },
        None => Ok(discover_and_load()),
    }
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./brainproxy.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/brainproxy/brainproxy.{toml,yaml,yml,json}` (user-global)
///
/// Returns `BrainProxyConfig::default()` if no config file is found.
pub fn discover_and_load() -> BrainProxyConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    BrainProxyConfig::default()
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/brainproxy/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "brainproxy").map(|d| d.config_dir().to_path_buf())
}

/// Serialize `config` as pretty TOML.
pub fn to_toml(config: &BrainProxyConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

pub(crate) fn parse_config(raw: &str, path: &Path) -> Result<BrainProxyConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => Err(Error::UnsupportedFormat(ext.to_string())),
    }
}
