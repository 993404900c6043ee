// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

pub use nix::unistd::ForkResult;

use crate::registry::Mechanism;
use crate::tracker::Tracker;
use crate::{Error, Result};

/// Fork the current process, registering the child from both sides.
///
/// The child registers itself through the fork hook before this
/// returns in the child. When tracking is enabled the parent also
/// registers the child as soon as its pid is known, so a child that
/// exits immediately is still recorded.
///
/// # Safety
/// This has the same requirements as [`nix::unistd::fork`]: in a
/// multi-threaded program the child may only perform async-signal-safe
/// operations until it calls `exec` or exits.
pub unsafe fn fork() -> Result<ForkResult> {
    // SAFETY: forwarded to the caller, see above
    let result = unsafe { nix::unistd::fork() }.map_err(Error::ForkError)?;
    if let ForkResult::Parent { child } = result {
        Tracker::global().record_child(child.as_raw() as u32, Mechanism::Fork);
    }
    Ok(result)
}
