// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use libc::S_IWUSR;
use std::fs::Permissions;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Moves the entries of `from` into `to`, temporarily granting `u+w` on
/// directories so that rename works, and restoring the original modes.
pub fn move_dir_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from).with_context(|| format!("Failed to read dir {from:?}"))? {
        let entry = entry?;
        let src = from.join(entry.file_name());
        let dest = to.join(entry.file_name());

        let metadata = entry.metadata()?;
        let new_mode = metadata.mode() | S_IWUSR;

        if metadata.is_dir() && metadata.mode() != new_mode {
            std::fs::set_permissions(&src, Permissions::from_mode(new_mode))
                .with_context(|| format!("Failed to set permissions of {src:?} to {new_mode:o}"))?;
        }

        std::fs::rename(&src, &dest)
            .with_context(|| format!("Failed to rename {src:?} to {dest:?}"))?;

        if metadata.is_dir() && metadata.mode() != new_mode {
            std::fs::set_permissions(&dest, Permissions::from_mode(metadata.mode()))
                .with_context(|| {
                    format!(
                        "Failed to restore permissions of {dest:?} to {:o}",
                        metadata.mode()
                    )
                })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir, metadata, set_permissions, File};

    #[test]
    fn moves_entries_and_keeps_modes() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let from = temp_dir.path().join("from");
        let to = temp_dir.path().join("to");
        create_dir(&from)?;
        create_dir(&to)?;

        File::create(from.join("file"))?;
        let locked = from.join("locked");
        create_dir(&locked)?;
        File::create(locked.join("inner"))?;
        set_permissions(&locked, Permissions::from_mode(0o555))?;

        move_dir_contents(&from, &to)?;

        assert!(to.join("file").try_exists()?);
        assert!(to.join("locked/inner").try_exists()?);
        assert_eq!(metadata(to.join("locked"))?.mode() & 0o777, 0o555);
        assert_eq!(std::fs::read_dir(&from)?.count(), 0);

        // Restore write permission so the temp dir can be dropped.
        set_permissions(to.join("locked"), Permissions::from_mode(0o755))?;
        Ok(())
    }
}
