// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use binarypackage::BinaryPackage;

/// Copies binary packages into a staged package directory, named
/// `<CATEGORY>/<PF>.tbz2` as the recipe manager expects, and returns their
/// exact-version atoms in input order.
pub fn copy_binary_packages(packages_dir: &Path, package_paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut atoms = Vec::new();

    for package_path in package_paths {
        let package = BinaryPackage::open(package_path)?;

        let category_dir = packages_dir.join(package.category());
        std::fs::create_dir_all(&category_dir)?;

        let copy_path = category_dir.join(format!("{}.tbz2", package.pf()));
        std::fs::copy(package_path, &copy_path)
            .with_context(|| format!("Failed staging {} to {:?}", package_path.display(), copy_path))?;

        atoms.push(package.atom());
    }
    Ok(atoms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_packages_by_category_and_pf() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let src = temp_dir.path().join("src");
        let pkgdir = temp_dir.path().join("pkgs");
        std::fs::create_dir_all(&src)?;

        let a = src.join("attr-2.5.1.tbz2");
        let b = src.join("ncurses-6.3_p20220423-r1.tbz2");
        testutil::write_fake_package(&a, "sys-apps", "attr-2.5.1", &[])?;
        testutil::write_fake_package(&b, "sys-libs", "ncurses-6.3_p20220423-r1", &[])?;

        let atoms = copy_binary_packages(&pkgdir, &[a, b])?;

        assert_eq!(
            atoms,
            vec![
                "=sys-apps/attr-2.5.1".to_owned(),
                "=sys-libs/ncurses-6.3_p20220423-r1".to_owned(),
            ]
        );
        assert!(pkgdir.join("sys-apps/attr-2.5.1.tbz2").try_exists()?);
        assert!(pkgdir
            .join("sys-libs/ncurses-6.3_p20220423-r1.tbz2")
            .try_exists()?);
        Ok(())
    }
}
