//! Configuration loading: JSON file first, command-line overrides on top.

use std::path::Path;

use anyhow::{Context, Result};
use tabmesh_core::NodeConfig;

/// Values from the command line that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub resource: Option<String>,
    pub ttl: Option<u32>,
    pub election_timeout_ms: Option<u64>,
}

/// Read a `NodeConfig` from a JSON file. Missing fields take their defaults.
pub fn load_file(path: &Path) -> Result<NodeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Build the effective configuration.
pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> Result<NodeConfig> {
    let mut config = match path {
        Some(path) => load_file(path)?,
        None => NodeConfig::default(),
    };

    if let Some(resource) = &overrides.resource {
        config.resource = resource.clone();
    }
    if let Some(ttl) = overrides.ttl {
        config.default_ttl = ttl;
    }
    if let Some(ms) = overrides.election_timeout_ms {
        config.election_timeout_ms = ms;
    }

    anyhow::ensure!(!config.resource.is_empty(), "resource must not be empty");
    anyhow::ensure!(config.election_timeout_ms > 0, "election timeout must be positive");
    Ok(config)
}
