// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use fileutil::with_permissions;
use itertools::Itertools;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::instrument;
use walkdir::WalkDir;

fn find_files(root: &Path, predicate: fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    // A missing root simply has nothing to clean.
    if let Err(e) = std::fs::metadata(root) {
        if e.kind() == ErrorKind::NotFound {
            return Ok(vec![]);
        }
        return Err(e.into());
    }

    let mut result = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        let file_name = entry.path().file_name().unwrap().to_string_lossy();
        if predicate(&file_name) {
            result.push(entry.path().to_path_buf());
        }
    }
    Ok(result)
}

#[instrument]
fn sort_contents(pkg_dir: &Path) -> Result<()> {
    for path in find_files(pkg_dir, |file_name| file_name == "CONTENTS")? {
        let contents = std::fs::read_to_string(&path)?
            .split('\n')
            .filter(|line| !line.is_empty())
            .sorted()
            .interleave_shortest(std::iter::repeat("\n"))
            .join("");
        with_permissions(&path, 0o744, || {
            std::fs::write(&path, contents).with_context(|| format!("Sorting CONTENTS: {path:?}"))
        })?;
    }
    Ok(())
}

#[instrument]
fn zero_counter(pkg_dir: &Path) -> Result<()> {
    for path in find_files(pkg_dir, |file_name| file_name == "COUNTER")? {
        with_permissions(&path, 0o744, || {
            std::fs::write(&path, "0").with_context(|| format!("Clearing COUNTER: {path:?}"))
        })?;
    }
    Ok(())
}

#[instrument]
fn truncate_environment(pkg_dir: &Path) -> Result<()> {
    for path in find_files(pkg_dir, |file_name| file_name == "environment.bz2")? {
        with_permissions(&path, 0o744, || {
            std::fs::write(&path, "")
                .with_context(|| format!("Zeroing environment.bz2: {path:?}"))
        })?;
    }
    Ok(())
}

#[instrument]
fn clean_package_database(root: &Path) -> Result<()> {
    // The package database records some install artifacts that vary run to
    // run even for identical inputs:
    // COUNTER: serial numbers depend on the install interleaving.
    // environment.bz2: captures EPOCHTIME/SRANDOM of the install moment.
    // CONTENTS: sorted in the binary package, but rewritten unsorted on
    //           install, so we re-sort it.
    // Deleting the files instead would leave overlayfs whiteout markers in
    // the layer, so they are truncated/rewritten in place.
    let pkg_dir = root.join("var/db/pkg");
    truncate_environment(&pkg_dir)?;
    zero_counter(&pkg_dir)?;
    sort_contents(&pkg_dir)?;
    Ok(())
}

fn clean_root(root_dir: &Path) -> Result<()> {
    for subdir in [
        "mnt/host",
        "packages",
        "run",
        "stage",
        "tmp",
        "var/cache",
        "var/lib/portage/pkgs",
        "var/log",
        "var/tmp",
    ] {
        let target_dir = root_dir.join(subdir);
        fileutil::remove_dir_all_with_chmod(&target_dir)?;

        // Remove ancestors that became empty.
        for dir in target_dir
            .ancestors()
            .skip(1)
            .take_while(|dir| *dir != root_dir)
        {
            match std::fs::remove_dir(dir) {
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => break,
                other => other.with_context(|| format!("Failed to delete {}", dir.display()))?,
            }
        }
    }

    clean_package_database(root_dir)?;

    Ok(())
}

/// Normalizes an install output layer for deterministic reuse: strips
/// scratch trees and canonicalizes the package database, both at the layer
/// root and inside each `build/<board>` sysroot.
#[instrument]
pub fn clean_layer(output_dir: &Path) -> Result<()> {
    clean_root(output_dir)?;
    let build_dir = output_dir.join("build");
    if build_dir.try_exists()? {
        for entry in std::fs::read_dir(build_dir)? {
            let entry = entry?;
            if entry.metadata()?.is_dir() {
                clean_root(&entry.path())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_scratch_dirs() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let output_dir = temp_dir.path();

        for subdir in [
            // These are deleted.
            "build/foo/mnt/host",
            "build/foo/run",
            "build/foo/stage",
            "build/foo/tmp",
            "build/foo/var/cache",
            "build/foo/var/lib/portage/pkgs",
            "build/foo/var/log",
            "build/foo/var/tmp",
            "mnt/host",
            "run",
            "stage",
            "tmp",
            "var/cache",
            "var/lib/portage/pkgs",
            "var/log",
            "var/tmp",
            // These are kept.
            "build/foo/opt",
            "build/foo/sbin",
            "build/foo/usr/bin",
            "build/foo/var/mail",
            "opt",
            "sbin",
            "usr/bin",
            "var/lib/keep",
            "var/mail",
        ] {
            std::fs::create_dir_all(output_dir.join(subdir))?;
        }

        clean_layer(output_dir)?;

        let paths: Vec<PathBuf> = WalkDir::new(output_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| Ok(entry?.path().strip_prefix(output_dir)?.to_path_buf()))
            .collect::<Result<_>>()?;

        assert_eq!(
            paths,
            vec![
                PathBuf::from("build"),
                PathBuf::from("build/foo"),
                PathBuf::from("build/foo/opt"),
                PathBuf::from("build/foo/sbin"),
                PathBuf::from("build/foo/usr"),
                PathBuf::from("build/foo/usr/bin"),
                PathBuf::from("build/foo/var"),
                PathBuf::from("build/foo/var/mail"),
                PathBuf::from("opt"),
                PathBuf::from("sbin"),
                PathBuf::from("usr"),
                PathBuf::from("usr/bin"),
                PathBuf::from("var"),
                PathBuf::from("var/lib"),
                PathBuf::from("var/lib/keep"),
                PathBuf::from("var/mail"),
            ]
        );

        Ok(())
    }

    #[test]
    fn canonicalizes_package_database() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let output_dir = temp_dir.path();

        let vdb_dir = output_dir.join("build/foo/var/db/pkg/sys-apps/bar-1.0");

        std::fs::create_dir_all(&vdb_dir)?;
        std::fs::write(
            vdb_dir.join("CONTENTS"),
            r#"dir usr
dir usr/bin
obj usr/bin/world d41d8cd98f00b204e9800998ecf8427e 1111
obj usr/bin/hello d41d8cd98f00b204e9800998ecf8427e 2222
dir bin
sym bin/world -> ../usr/bin/world 3333
sym bin/hello -> /usr/bin/hello 4444
"#,
        )?;
        std::fs::write(vdb_dir.join("COUNTER"), "12345")?;
        std::fs::write(vdb_dir.join("environment.bz2"), "fake environment")?;

        clean_layer(output_dir)?;

        let contents = std::fs::read_to_string(vdb_dir.join("CONTENTS"))?;
        assert_eq!(
            contents,
            r#"dir bin
dir usr
dir usr/bin
obj usr/bin/hello d41d8cd98f00b204e9800998ecf8427e 2222
obj usr/bin/world d41d8cd98f00b204e9800998ecf8427e 1111
sym bin/hello -> /usr/bin/hello 4444
sym bin/world -> ../usr/bin/world 3333
"#
        );
        assert_eq!(std::fs::read_to_string(vdb_dir.join("COUNTER"))?, "0");
        assert_eq!(
            std::fs::read_to_string(vdb_dir.join("environment.bz2"))?,
            ""
        );

        Ok(())
    }
}
