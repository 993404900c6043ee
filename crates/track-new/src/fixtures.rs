// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use rstest::fixture;
use tempfile::TempDir;

use crate::{Registry, TrackingGuard};

pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

#[fixture]
pub fn tmpdir() -> TempDir {
    tempfile::Builder::new()
        .prefix("track-new-test-")
        .tempdir()
        .expect("create a temp directory for test files")
}

#[fixture]
pub fn registry(tmpdir: TempDir) -> (TempDir, Registry) {
    let registry = Registry::create(tmpdir.path().join("registry"))
        .expect("failed to create registry in temp dir");
    (tmpdir, registry)
}

/// Tracking installed into a temporary registry.
///
/// Tests using this must be `#[serial_test::serial(tracker)]`
/// since the tracker is process-wide.
pub struct Tracked {
    pub guard: TrackingGuard,
    _tmpdir: TempDir,
}

impl Tracked {
    pub fn registry(&self) -> &Registry {
        self.guard.registry()
    }
}

#[fixture]
pub fn tracked(tmpdir: TempDir) -> Tracked {
    init_logging();
    let registry = Registry::create_session_in(tmpdir.path())
        .expect("failed to create session registry in temp dir");
    // some tests install tracking without a guard
    crate::uninstall();
    let guard = crate::scoped_in(registry).expect("failed to install tracking");
    Tracked {
        guard,
        _tmpdir: tmpdir,
    }
}
