// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Process-wide tracking state and the fork hook.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use once_cell::sync::{Lazy, OnceCell};
use track_new_config::{Config, REGISTRY_ROOT_VAR};

use crate::registry::{Mechanism, Registry, TrackedProcess};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./tracker_test.rs"]
mod tracker_test;

static TRACKER: Lazy<Tracker> = Lazy::new(Tracker::new);

/// Set once the fork hook has been registered with libc.
static FORK_HOOK: OnceCell<()> = OnceCell::new();

/// One tracking session, shared with every process forked while it is active.
#[derive(Debug)]
pub(crate) struct Session {
    pub registry: Registry,
    pub register_from_parent: bool,
    pub propagate_env: bool,
    armed: AtomicBool,
}

impl Session {
    fn new(registry: Registry, config: &track_new_config::Tracker) -> Self {
        Self {
            registry,
            register_from_parent: config.register_from_parent,
            propagate_env: config.propagate_env,
            armed: AtomicBool::new(true),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// The process-wide tracking capability.
///
/// There is exactly one of these per process, see [`Tracker::global`].
/// The session is held in an [`ArcSwapOption`] so that the child side
/// of a fork can read it without taking any lock that another thread
/// may have been holding when the fork happened.
pub struct Tracker {
    session: ArcSwapOption<Session>,
}

impl Tracker {
    fn new() -> Self {
        Self {
            session: ArcSwapOption::empty(),
        }
    }

    /// The tracker for this process.
    pub fn global() -> &'static Tracker {
        &TRACKER
    }

    pub(crate) fn active_session(&self) -> Option<Arc<Session>> {
        self.session.load_full().filter(|s| s.is_armed())
    }

    /// Enable tracking using the current configuration.
    ///
    /// If the config names a registry root it is joined as-is, otherwise
    /// a new empty registry is created for this session. Does nothing if
    /// tracking is already enabled.
    pub fn install(&self) -> Result<()> {
        self.install_from_config().map(|_| ())
    }

    /// Returns true if a new registry directory was created for the session.
    fn install_from_config(&self) -> Result<bool> {
        if self.is_installed() {
            tracing::debug!("process tracking already installed");
            return Ok(false);
        }
        let config = Config::current()?;
        let (registry, created) = match &config.registry.root {
            Some(root) => (Registry::create(root)?, false),
            None => (
                Registry::create_session_in(config.registry.session_parent_dir())?,
                true,
            ),
        };
        self.arm(registry, &config.tracker)?;
        Ok(created)
    }

    /// Enable tracking, recording into the given registry.
    ///
    /// Does nothing if tracking is already enabled.
    pub fn install_in(&self, registry: Registry) -> Result<()> {
        if self.is_installed() {
            tracing::debug!("process tracking already installed");
            return Ok(());
        }
        let config = Config::current()?;
        self.arm(registry, &config.tracker)
    }

    /// Enable tracking only if an ancestor process exported a registry.
    ///
    /// Returns true if tracking is enabled once this returns.
    pub fn install_inherited(&self) -> Result<bool> {
        if self.is_installed() {
            return Ok(true);
        }
        let Some(root) = std::env::var_os(REGISTRY_ROOT_VAR).filter(|r| !r.is_empty()) else {
            return Ok(false);
        };
        let registry = Registry::open(root)?;
        self.install_in(registry)?;
        Ok(true)
    }

    fn arm(&self, registry: Registry, config: &track_new_config::Tracker) -> Result<()> {
        // the hook must be in place before anything can observe the
        // session, otherwise a fork could slip through unrecorded
        FORK_HOOK.get_or_try_init(install_fork_hook)?;
        tracing::debug!(root = ?registry.root(), "installed process tracking");
        let session = Arc::new(Session::new(registry, config));
        self.session.store(Some(session));
        Ok(())
    }

    /// Disable tracking in this process.
    ///
    /// The registry of the last session stays readable until
    /// tracking is installed again.
    pub fn uninstall(&self) {
        if let Some(session) = self.session.load_full() {
            if session.armed.swap(false, Ordering::AcqRel) {
                tracing::debug!(root = ?session.registry.root(), "uninstalled process tracking");
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        self.active_session().is_some()
    }

    /// The registry of the current or most recent session.
    pub fn registry(&self) -> Option<Registry> {
        self.session.load_full().map(|s| s.registry.clone())
    }

    fn require_registry(&self) -> Result<Registry> {
        self.registry().ok_or(Error::NotInstalled)
    }

    /// Every process recorded in this session so far.
    pub fn children(&self) -> Result<Vec<TrackedProcess>> {
        self.require_registry()?.list()
    }

    pub fn child_pids(&self) -> Result<Vec<u32>> {
        Ok(self.children()?.into_iter().map(|p| p.pid).collect())
    }

    /// Forget every process recorded in this session so far.
    pub fn reset(&self) -> Result<()> {
        self.require_registry()?.clear()
    }

    /// Record a newly created child from the parent's side.
    ///
    /// Failures are logged rather than returned, a process has been
    /// created either way and the caller still needs to own it.
    pub(crate) fn record_child(&self, pid: u32, mechanism: Mechanism) {
        let Some(session) = self.active_session() else {
            return;
        };
        if mechanism == Mechanism::Fork && !session.register_from_parent {
            return;
        }
        let entry = TrackedProcess::new(pid)
            .with_parent(std::process::id())
            .with_mechanism(mechanism);
        if let Err(err) = session.registry.record_entry(entry) {
            tracing::warn!(%pid, "failed to register child process: {err}");
        }
    }
}

/// Enable tracking using the current configuration.
pub fn install() -> Result<()> {
    Tracker::global().install()
}

/// Enable tracking, recording into the given registry.
pub fn install_in(registry: Registry) -> Result<()> {
    Tracker::global().install_in(registry)
}

/// Enable tracking only if an ancestor process exported a registry.
pub fn install_inherited() -> Result<bool> {
    Tracker::global().install_inherited()
}

/// Disable tracking in this process.
pub fn uninstall() {
    Tracker::global().uninstall()
}

pub fn is_installed() -> bool {
    Tracker::global().is_installed()
}

/// The registry of the current or most recent session.
pub fn registry() -> Option<Registry> {
    Tracker::global().registry()
}

/// Every process recorded since tracking was installed.
pub fn children() -> Result<Vec<TrackedProcess>> {
    Tracker::global().children()
}

/// The pids of every process recorded since tracking was installed.
pub fn child_pids() -> Result<Vec<u32>> {
    Tracker::global().child_pids()
}

/// Clear the registry of the current session.
pub fn reset() -> Result<()> {
    Tracker::global().reset()
}

/// What a [`TrackingGuard`] undoes when dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Teardown {
    /// Tracking was already on, leave it to whoever installed it.
    Nothing,
    /// Disable tracking and empty the registry.
    Clear,
    /// Disable tracking and remove the registry directory it created.
    Destroy,
}

/// Installs tracking and tears it down again when dropped.
///
/// A guard only tears down tracking that it installed itself. Scopes
/// opened while tracking is already enabled leave the outer session
/// untouched.
#[must_use = "tracking is torn down as soon as the guard is dropped"]
pub struct TrackingGuard {
    registry: Registry,
    teardown: Teardown,
}

impl TrackingGuard {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn children(&self) -> Result<Vec<TrackedProcess>> {
        self.registry.list()
    }

    /// True if this guard installed the tracking it holds.
    pub fn owns_session(&self) -> bool {
        self.teardown != Teardown::Nothing
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        let result = match self.teardown {
            Teardown::Nothing => return,
            Teardown::Clear => {
                uninstall();
                self.registry.clear()
            }
            Teardown::Destroy => {
                uninstall();
                self.registry.clone().destroy()
            }
        };
        if let Err(err) = result {
            tracing::warn!("failed to clean up process registry: {err}");
        }
    }
}

/// Install tracking for the lifetime of the returned guard.
///
/// A registry created for this scope is removed when the guard drops.
pub fn scoped() -> Result<TrackingGuard> {
    let tracker = Tracker::global();
    let teardown = if tracker.is_installed() {
        Teardown::Nothing
    } else if tracker.install_from_config()? {
        Teardown::Destroy
    } else {
        Teardown::Clear
    };
    let registry = tracker.require_registry()?;
    Ok(TrackingGuard { registry, teardown })
}

/// Install tracking into the given registry for the lifetime of the returned guard.
///
/// The registry itself is left in place, emptied, when the guard drops.
pub fn scoped_in(registry: Registry) -> Result<TrackingGuard> {
    let tracker = Tracker::global();
    let teardown = if tracker.is_installed() {
        Teardown::Nothing
    } else {
        tracker.install_in(registry)?;
        Teardown::Clear
    };
    let registry = tracker.require_registry()?;
    Ok(TrackingGuard { registry, teardown })
}

#[cfg(unix)]
fn install_fork_hook() -> Result<()> {
    // SAFETY: the handler only touches state that is safe
    // to read in the child of a multi-threaded process
    let res = unsafe { libc::pthread_atfork(None, None, Some(record_forked_child)) };
    if res != 0 {
        return Err(Error::HookInstallFailure(nix::errno::Errno::from_raw(res)));
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_fork_hook() -> Result<()> {
    Err(Error::HookUnsupported)
}

/// Runs in the child immediately after every fork of this process.
#[cfg(unix)]
unsafe extern "C" fn record_forked_child() {
    let Some(session) = TRACKER.active_session() else {
        return;
    };
    // there is nobody to report a failure to from here, a
    // missing entry is the only symptom
    let _ = session
        .registry
        .write_entry(TrackedProcess::current(Mechanism::Fork));
}
