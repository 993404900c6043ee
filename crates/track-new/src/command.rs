// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Spawning tracked executables.
//!
//! A spawned program runs its own code, so it cannot be relied upon
//! to register itself. Instead the parent records the child as soon
//! as its pid is known, and hands the registry location down so that
//! executables which also use this crate can join the same session
//! with [`crate::install_inherited`].

use track_new_config::REGISTRY_ROOT_VAR;

use crate::registry::Mechanism;
use crate::tracker::Tracker;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./command_test.rs"]
mod command_test;

/// Extends process builders with tracked spawning.
pub trait CommandExt {
    /// The handle returned by a successful spawn
    type Child;

    /// Export the active registry to the command's environment.
    ///
    /// Does nothing when tracking is not enabled.
    fn track(&mut self) -> &mut Self;

    /// Spawn the command and record the new process.
    ///
    /// When tracking is not enabled, this is a plain spawn.
    fn spawn_tracked(&mut self) -> Result<Self::Child>;
}

impl CommandExt for std::process::Command {
    type Child = std::process::Child;

    fn track(&mut self) -> &mut Self {
        if let Some(session) = Tracker::global().active_session() {
            if session.propagate_env {
                self.env(REGISTRY_ROOT_VAR, session.registry.root());
            }
        }
        self
    }

    fn spawn_tracked(&mut self) -> Result<Self::Child> {
        self.track();
        let child = self
            .spawn()
            .map_err(|err| Error::spawn_error(self.get_program().to_string_lossy(), err))?;
        Tracker::global().record_child(child.id(), Mechanism::Spawn);
        Ok(child)
    }
}

impl CommandExt for tokio::process::Command {
    type Child = tokio::process::Child;

    fn track(&mut self) -> &mut Self {
        if let Some(session) = Tracker::global().active_session() {
            if session.propagate_env {
                self.env(REGISTRY_ROOT_VAR, session.registry.root());
            }
        }
        self
    }

    fn spawn_tracked(&mut self) -> Result<Self::Child> {
        self.track();
        let child = self.spawn().map_err(|err| {
            Error::spawn_error(self.as_std().get_program().to_string_lossy(), err)
        })?;
        match child.id() {
            Some(pid) => Tracker::global().record_child(pid, Mechanism::Spawn),
            None => tracing::warn!("spawned child exited before it could be registered"),
        }
        Ok(child)
    }
}
