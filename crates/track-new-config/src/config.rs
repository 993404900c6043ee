// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static CONFIG: OnceCell<RwLock<Arc<Config>>> = OnceCell::new();

/// Prefix shared by every environment variable that overrides a config value.
pub const ENV_PREFIX: &str = "TRACK_NEW_";

/// The variable used to hand an active registry location down to
/// spawned executables.
///
/// This is also the environment override for [`Registry::root`], so a
/// tracker-aware descendant that loads its config joins the session
/// of whichever ancestor exported it.
pub const REGISTRY_ROOT_VAR: &str = "TRACK_NEW_REGISTRY_ROOT";

#[derive(Clone, Default, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Registry {
    /// Use this directory as the registry instead of creating a new one
    ///
    /// An explicit root is joined as-is and never cleared on install,
    /// since it may belong to a session started by an ancestor.
    pub root: Option<PathBuf>,

    /// The directory that new session registries are created under
    ///
    /// Defaults to the system temporary directory.
    pub parent_dir: Option<PathBuf>,
}

impl Registry {
    /// The directory that a new session registry should be created in.
    pub fn session_parent_dir(&self) -> PathBuf {
        self.parent_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Tracker {
    /// Also register forked children from the parent's side of the fork
    ///
    /// The child always registers itself. Registering from the parent
    /// as well means that a child which exits before its own write
    /// completes is still recorded.
    pub register_from_parent: bool,

    /// Export the registry location to spawned commands
    pub propagate_env: bool,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            register_from_parent: true,
            propagate_env: true,
        }
    }
}

/// Configuration values for process tracking.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // These sub-types should aim to only have one level of
    // values within them, otherwise they become impossible to address
    // with environment variables.
    pub registry: Registry,
    pub tracker: Tracker,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        // Note we don't know if we won the race to set the value here,
        // so we still need to try to update it.
        let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
            Ok(RwLock::new(Arc::new(self.clone())))
        })?;

        let mut lock = config
            .write()
            .map_err(|err| crate::Error::LockPoisonedWrite(err.to_string()))?;
        *Arc::make_mut(&mut lock) = self;
        Ok(Arc::clone(&lock))
    }
}

/// Get the current config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
        Ok(RwLock::new(Arc::new(load_config()?)))
    })?;
    let lock = config
        .read()
        .map_err(|err| crate::Error::LockPoisonedRead(err.to_string()))?;
    Ok(Arc::clone(&*lock))
}

/// Load the configuration from disk, even if it has already been loaded.
///
/// This includes the default, user, and system configurations (if they exist)
/// as well as any `TRACK_NEW_<SECTION>_<NAME>` environment variables.
pub fn load_config() -> Result<Config> {
    load_config_from_env(std::env::vars())
}

/// Load the configuration, taking overrides from the given variables
/// instead of the process environment.
pub fn load_config_from_env<I>(vars: I) -> Result<Config>
where
    I: IntoIterator<Item = (String, String)>,
{
    use config::{Config as RawConfig, File};

    let mut config_builder = RawConfig::builder()
        // the system config can be in any supported format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/track-new").required(false));
    if let Some(dir) = dirs::config_dir() {
        let user_config = dir.join("track-new").join("track-new");
        config_builder = config_builder
            .add_source(File::with_name(&format!("{}", user_config.display())).required(false));
    }

    for (var, value) in vars {
        let Some(tail) = var.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // a value with no section is not a configuration
            // value, and can be skipped (eg: TRACK_NEW_LOG)
            continue;
        };
        if value.is_empty() {
            continue;
        }

        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        config_builder = config_builder.set_override(key, value)?;
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}
