// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Diagnostic, Debug, Error)]
#[diagnostic(
    url(
        "https://docs.rs/track-new#{}",
        self.code().unwrap_or_else(|| Box::new("track_new::generic"))
    )
)]
pub enum Error {
    #[error("Failed to install the process creation hook: {0}")]
    #[diagnostic(
        code("track_new::hook_install_failure"),
        help("Tracking is not active, descendants of this process will not be recorded")
    )]
    HookInstallFailure(#[source] nix::errno::Errno),
    #[error("Process creation hooks are not supported on this platform")]
    #[diagnostic(code("track_new::hook_install_failure"))]
    HookUnsupported,
    #[error("Process tracking has not been installed in this process")]
    NotInstalled,

    #[error("Failed to create registry directory {0}")]
    RegistryCreateError(PathBuf, #[source] io::Error),
    #[error("Registry does not exist: {0}")]
    RegistryNotFound(PathBuf),
    #[error("Failed to read registry {0}")]
    RegistryReadError(PathBuf, #[source] io::Error),
    #[error("Failed to write registry entry {0}")]
    RegistryWriteError(PathBuf, #[source] io::Error),
    #[error("Failed to encode registry entry {0}")]
    RegistryEncodeError(PathBuf, #[source] serde_json::Error),
    #[error("Failed to clear registry entry {0}")]
    RegistryClearError(PathBuf, #[source] io::Error),

    #[error("Failed to spawn {command}")]
    SpawnError {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to fork the current process")]
    ForkError(#[source] nix::errno::Errno),

    #[error(transparent)]
    #[diagnostic(forward(0))]
    Config(#[from] track_new_config::Error),
}

impl Error {
    pub fn spawn_error(command: impl Into<String>, source: io::Error) -> Self {
        Self::SpawnError {
            command: command.into(),
            source,
        }
    }
}
