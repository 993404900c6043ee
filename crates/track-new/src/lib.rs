// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Record every descendant process created after tracking is enabled.
//!
//! Call [`install`] once, create processes through [`fork`] or
//! [`CommandExt::spawn_tracked`], and list them later with [`children`].
//! Tracking is inherited: forked children record their own children
//! through the same hook, and spawned executables that call
//! [`install_inherited`] join the same registry.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod fixtures;

mod command;
mod error;
#[cfg(unix)]
mod fork;
pub mod registry;
mod tracker;

pub use command::CommandExt;
pub use error::{Error, Result};
#[cfg(unix)]
pub use fork::{ForkResult, fork};
pub use registry::{Mechanism, Registry, TrackedProcess};
pub use track_new_config as config;
pub use tracker::{
    Tracker,
    TrackingGuard,
    child_pids,
    children,
    install,
    install_in,
    install_inherited,
    is_installed,
    registry,
    reset,
    scoped,
    scoped_in,
    uninstall,
};
