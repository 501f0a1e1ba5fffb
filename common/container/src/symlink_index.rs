// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Symlink-index sidecars.
//!
//! Some storage systems carrying layer artifacts between build actions do
//! not preserve symlinks. A symlink index is a plain tar holding only the
//! symlinks of a layer directory; shipping the pair (directory, index) and
//! stacking the restored index directly above the directory reproduces the
//! original tree in the overlay.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::instrument;
use walkdir::WalkDir;

/// Moves every symlink under `layer_dir` into a sidecar tar at
/// `index_path`, with paths relative to the layer root. Returns the number
/// of symlinks indexed.
#[instrument]
pub fn create(layer_dir: &Path, index_path: &Path) -> Result<usize> {
    let file = File::create(index_path)
        .with_context(|| format!("Failed to create {}", index_path.display()))?;
    let mut builder = tar::Builder::new(file);

    let mut count = 0;
    for entry in WalkDir::new(layer_dir) {
        let entry = entry?;
        if !entry.path_is_symlink() {
            continue;
        }
        let relative = entry.path().strip_prefix(layer_dir)?;
        let target = std::fs::read_link(entry.path())?;

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, relative, &target)
            .with_context(|| format!("Failed to index symlink {relative:?}"))?;

        fileutil::remove_file_with_chmod(entry.path())?;
        count += 1;
    }

    builder.finish()?;
    Ok(count)
}

/// Restores the symlinks recorded in `index_path` under `dir`.
///
/// The index must contain nothing but symlinks; anything else means the
/// sidecar was not produced by [`create`] and is rejected.
#[instrument]
pub fn restore(index_path: &Path, dir: &Path) -> Result<()> {
    let file = File::open(index_path)
        .with_context(|| format!("Failed to open {}", index_path.display()))?;
    let mut archive = tar::Archive::new(file);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Symlink {
            bail!(
                "symlink index {} contains a non-symlink entry: {:?}",
                index_path.display(),
                entry.path()?
            );
        }
        entry.unpack_in(dir)?;
    }
    Ok(())
}
