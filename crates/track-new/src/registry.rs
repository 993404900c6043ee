// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Filesystem storage of tracked processes.
//!
//! A registry is a directory holding one file per tracked process, named
//! by its pid. Each writer only ever touches its own file, so any number
//! of unrelated processes can record themselves at the same time without
//! any locking between them.

use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./registry_test.rs"]
mod registry_test;

/// Entries are written under this prefix and renamed into place.
const PENDING_PREFIX: &str = ".pending-";
const SESSION_PREFIX: &str = "track-new-";

/// How a tracked process was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    /// Duplicated from its parent, continuing from the same point.
    Fork,
    /// Started as a new program image.
    Spawn,
}

/// One registered descendant process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedProcess {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub mechanism: Option<Mechanism>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl TrackedProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            parent_pid: None,
            mechanism: None,
            recorded_at: None,
        }
    }

    pub fn with_parent(mut self, parent_pid: u32) -> Self {
        self.parent_pid = Some(parent_pid);
        self
    }

    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }

    /// The entry for the calling process, as seen from inside it.
    pub fn current(mechanism: Mechanism) -> Self {
        Self::new(nix::unistd::getpid().as_raw() as u32)
            .with_parent(nix::unistd::getppid().as_raw() as u32)
            .with_mechanism(mechanism)
    }
}

/// The on-disk content of an entry, the pid lives in the file name.
#[derive(Default, Serialize, Deserialize)]
struct EntryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mechanism: Option<Mechanism>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recorded_at: Option<DateTime<Utc>>,
}

/// A shared, append-only set of tracked processes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    /// Create a registry at the given path, or join the one that is already there.
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        makedirs_with_perms(root, 0o777)?;
        Self::open(root)
    }

    /// Join an existing registry.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::RegistryNotFound(root.to_owned()));
        }
        // descendants may run from any working directory
        let root = dunce::canonicalize(root)
            .map_err(|err| Error::RegistryReadError(root.to_owned(), err))?;
        Ok(Self { root })
    }

    /// Create a new, empty registry with a unique name under `parent`.
    pub fn create_session_in<P: AsRef<Path>>(parent: P) -> Result<Self> {
        let parent = parent.as_ref();
        makedirs_with_perms(parent, 0o777)?;
        let root = parent.join(format!("{SESSION_PREFIX}{}", ulid::Ulid::new()));
        std::fs::create_dir(&root).map_err(|err| Error::RegistryCreateError(root.clone(), err))?;
        set_perms(&root, 0o777)?;
        tracing::debug!(root = ?root, "created session registry");
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Record the given pid.
    ///
    /// Returns false if the pid was already recorded.
    pub fn record(&self, pid: u32) -> Result<bool> {
        self.record_entry(TrackedProcess::new(pid))
    }

    /// Record a process along with its metadata.
    ///
    /// The first completed write for a pid wins, later ones are
    /// dropped and return false. The entry only becomes visible
    /// once fully written.
    pub fn record_entry(&self, entry: TrackedProcess) -> Result<bool> {
        let (pid, parent) = (entry.pid, entry.parent_pid);
        let recorded = self.write_entry(entry)?;
        if recorded {
            tracing::trace!(%pid, ?parent, "recorded process");
        }
        Ok(recorded)
    }

    /// Same as [`Self::record_entry`] but never logs, for use in
    /// the child immediately after a fork.
    pub(crate) fn write_entry(&self, entry: TrackedProcess) -> Result<bool> {
        let target = self.entry_path(entry.pid);
        if target.symlink_metadata().is_ok() {
            return Ok(false);
        }

        let data = EntryData {
            parent_pid: entry.parent_pid,
            mechanism: entry.mechanism,
            recorded_at: Some(entry.recorded_at.unwrap_or_else(Utc::now)),
        };
        let mut pending = tempfile::Builder::new()
            .prefix(PENDING_PREFIX)
            .tempfile_in(&self.root)
            .map_err(|err| Error::RegistryWriteError(target.clone(), err))?;
        serde_json::to_writer(&mut pending, &data)
            .map_err(|err| Error::RegistryEncodeError(target.clone(), err))?;
        pending
            .flush()
            .map_err(|err| Error::RegistryWriteError(target.clone(), err))?;
        #[cfg(unix)]
        pending
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(|err| Error::RegistryWriteError(target.clone(), err))?;
        // another writer may have finished since the check above
        match pending.persist_noclobber(&target) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(Error::RegistryWriteError(target, err.error)),
        }
    }

    /// Return true if the given pid has been recorded.
    pub fn contains(&self, pid: u32) -> bool {
        self.entry_path(pid).symlink_metadata().is_ok()
    }

    /// List every entry currently in the registry.
    ///
    /// Entries are ordered by when they were recorded, then by pid.
    /// Entries whose content cannot be read are still listed by pid.
    pub fn list(&self) -> Result<Vec<TrackedProcess>> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|err| Error::RegistryReadError(self.root.clone(), err))?;
        let mut processes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::RegistryReadError(self.root.clone(), err))?;
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let data = match std::fs::read(entry.path()) {
                Ok(bytes) => serde_json::from_slice::<EntryData>(&bytes).unwrap_or_else(|err| {
                    tracing::debug!(%pid, ?err, "unreadable registry entry");
                    EntryData::default()
                }),
                // cleared out from under us
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::debug!(%pid, ?err, "failed to read registry entry");
                    EntryData::default()
                }
            };
            processes.push(TrackedProcess {
                pid,
                parent_pid: data.parent_pid,
                mechanism: data.mechanism,
                recorded_at: data.recorded_at,
            });
        }
        processes.sort_by(|a, b| (a.recorded_at, a.pid).cmp(&(b.recorded_at, b.pid)));
        Ok(processes)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove all entries, leaving an empty registry.
    pub fn clear(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|err| Error::RegistryReadError(self.root.clone(), err))?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::RegistryReadError(self.root.clone(), err))?;
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::RegistryClearError(path, err)),
            }
        }
        tracing::debug!(root = ?self.root, "cleared registry");
        Ok(())
    }

    /// Remove the registry and everything in it.
    pub fn destroy(self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::RegistryClearError(self.root, err)),
        }
    }
}

/// Create a directory and all missing parents, giving
/// each created directory the given permissions.
fn makedirs_with_perms(dirname: &Path, perms: u32) -> Result<()> {
    if dirname.is_dir() {
        return Ok(());
    }
    if let Some(parent) = dirname.parent() {
        if !parent.as_os_str().is_empty() {
            makedirs_with_perms(parent, perms)?;
        }
    }
    match std::fs::create_dir(dirname) {
        Ok(()) => set_perms(dirname, perms),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(Error::RegistryCreateError(dirname.to_owned(), err)),
    }
}

#[cfg(unix)]
fn set_perms(dirname: &Path, perms: u32) -> Result<()> {
    // not fatal, the umask may already allow what we need
    if let Err(err) = std::fs::set_permissions(dirname, std::fs::Permissions::from_mode(perms)) {
        tracing::debug!(?err, path = ?dirname, "failed to set registry permissions");
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_perms(_dirname: &Path, _perms: u32) -> Result<()> {
    Ok(())
}
