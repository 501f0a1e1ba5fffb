// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

/// A file path seen from both sides of a container boundary.
///
/// Staged files live at one location on the host and at another location
/// once the container has pivoted into its root. Code that prepares staging
/// trees threads both views around as a single value so the two can never
/// drift apart.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DualPath {
    outside: PathBuf,
    inside: PathBuf,
}

impl DualPath {
    pub fn new(outside: impl Into<PathBuf>, inside: impl Into<PathBuf>) -> Self {
        Self {
            outside: outside.into(),
            inside: inside.into(),
        }
    }

    /// The path as the host sees it.
    pub fn outside(&self) -> &Path {
        &self.outside
    }

    /// The path as processes inside the container see it.
    pub fn inside(&self) -> &Path {
        &self.inside
    }

    /// Joins `path` onto both views, returning a new value.
    pub fn join(&self, path: impl AsRef<Path>) -> DualPath {
        Self {
            outside: self.outside.join(&path),
            inside: self.inside.join(&path),
        }
    }
}
