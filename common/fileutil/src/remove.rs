// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use std::fs::{metadata, remove_dir_all, remove_file, set_permissions, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use walkdir::WalkDir;

const S_IRWXU: u32 = 0o700;

/// Runs `action` after adding `permissions` to `path`, then restores the
/// original permissions.
pub fn with_permissions<T>(
    path: &Path,
    permissions: u32,
    action: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let mode = metadata(path)?.mode();
    let new_mode = mode | permissions;

    if mode != new_mode {
        set_permissions(path, Permissions::from_mode(new_mode))
            .with_context(|| format!("Failed to set permissions of {path:?} to {new_mode:o}"))?;
    }

    let result = action();

    if mode != new_mode {
        set_permissions(path, Permissions::from_mode(mode))
            .with_context(|| format!("Failed to restore permissions of {path:?} to {mode:o}"))?;
    }

    result
}

/// Calls `remove_file` after ensuring `u+rwx` on the parent directory.
pub fn remove_file_with_chmod(path: &Path) -> Result<()> {
    let parent = path.parent().context("Path must have a parent")?;
    with_permissions(parent, S_IRWXU, || {
        remove_file(path).with_context(|| format!("Failed to delete {path:?}"))
    })
}

/// Calls `remove_dir_all` after ensuring `u+rwx` on every directory below
/// `path` so that entries created with restrictive modes (fakeroot installs
/// like doing that) do not make the tree undeletable.
pub fn remove_dir_all_with_chmod(path: &Path) -> Result<()> {
    if let Err(e) = metadata(path) {
        if e.kind() == std::io::ErrorKind::NotFound {
            return Ok(());
        }
        return Err(anyhow::Error::new(e));
    }

    for entry in WalkDir::new(path)
        .into_iter()
        // The walk lists a directory before we get a chance to chmod it, so
        // listing can fail on 0o000 directories. Skip those errors here;
        // remove_dir_all reports anything that actually matters.
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let mode = entry.metadata()?.mode();
        if mode & S_IRWXU != S_IRWXU {
            let new_mode = mode | S_IRWXU;
            set_permissions(entry.path(), Permissions::from_mode(new_mode)).with_context(|| {
                format!("Failed to set permissions of {:?} to {new_mode:o}", entry.path())
            })?;
        }
    }

    let parent = path.parent().context("Path must have a parent")?;
    with_permissions(parent, S_IRWXU, || {
        remove_dir_all(path).with_context(|| format!("Failed to delete {path:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir, File};

    #[test]
    fn removes_inaccessible_tree() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path().join("root");
        create_dir(&root)?;
        let bad_dir = root.join("bad");
        create_dir(&bad_dir)?;
        File::create(bad_dir.join("file"))?;
        set_permissions(&bad_dir, Permissions::from_mode(0o0))?;

        remove_dir_all_with_chmod(&root)?;
        assert!(!root.try_exists()?);
        Ok(())
    }

    #[test]
    fn removes_file_in_readonly_dir() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let dir = temp_dir.path().join("dir");
        create_dir(&dir)?;
        let file = dir.join("file");
        File::create(&file)?;
        set_permissions(&dir, Permissions::from_mode(0o500))?;

        remove_file_with_chmod(&file)?;
        assert!(!file.try_exists()?);
        Ok(())
    }

    #[test]
    fn with_permissions_restores_mode() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let dir = temp_dir.path().join("dir");
        create_dir(&dir)?;
        set_permissions(&dir, Permissions::from_mode(0o500))?;

        with_permissions(&dir, S_IRWXU, || Ok(()))?;
        assert_eq!(metadata(&dir)?.mode() & 0o777, 0o500);
        Ok(())
    }
}
