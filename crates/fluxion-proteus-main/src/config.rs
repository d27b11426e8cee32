// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Configuration loading for the Proteus bridge binary

use anyhow::{Context, Result};
use fluxion_proteus::ProteusConfig;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Environment variable naming the TOML config file
pub const CONFIG_PATH_ENV: &str = "PROTEUS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "proteus.toml";

/// Environment variables that override keys of the config file
const ENV_OVERRIDES: [(&str, &str); 3] = [
    ("PROTEUS_INVERTER_ID", "inverter_id"),
    ("PROTEUS_EMAIL", "email"),
    ("PROTEUS_PASSWORD", "password"),
];

/// Load from `$PROTEUS_CONFIG` (or `proteus.toml`), then apply env overrides
pub fn load_config() -> Result<ProteusConfig> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
    load_config_from(Path::new(&path), |key| std::env::var(key).ok())
}

/// Read the TOML file if it exists, overlay the values returned by `env`, validate.
///
/// A missing file is not an error as long as the environment supplies the credentials.
pub fn load_config_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ProteusConfig> {
    let mut table = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let table: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config TOML: {}", path.display()))?;
        info!("📄 Loaded configuration from {}", path.display());
        table
    } else {
        warn!(
            "Config file {} not found, using environment variables only",
            path.display()
        );
        toml::Table::new()
    };

    for (var, key) in ENV_OVERRIDES {
        if let Some(value) = env(var).filter(|value| !value.is_empty()) {
            info!("Using {} from environment", key);
            table.insert(key.to_owned(), toml::Value::String(value));
        }
    }

    let config: ProteusConfig = toml::Value::Table(table)
        .try_into()
        .context("Incomplete Proteus configuration (inverter_id, email and password are required)")?;
    config.validate().context("Invalid Proteus configuration")?;
    Ok(config)
}
