// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Partitions a runtime-closed set of binary packages into an ordered list
//! of waves, where every package's direct runtime dependencies land in an
//! earlier wave. Waves translate 1:1 into the numbered INSTALL_ATOMS
//! environment variables consumed by the in-container setup script, and let
//! an outer scheduler parallelize installation where it is safe.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, ensure, Result};
use binarypackage::BinaryPackage;
use itertools::Itertools;

/// One package of an [`InstallSet`]: its exact-version atom and the atoms of
/// its direct runtime dependencies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageNode {
    pub atom: String,
    pub direct_runtime_deps: Vec<String>,
}

/// One wave of an install plan. Members may be installed concurrently; their
/// relative order carries no meaning.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallGroup {
    pub atoms: Vec<String>,
}

impl InstallGroup {
    /// The space-joined atom list, the format of INSTALL_ATOMS_TARGET_<i>.
    pub fn env_value(&self) -> String {
        self.atoms.join(" ")
    }
}

/// A set of packages closed under the direct-runtime-dependency relation.
///
/// Iteration order is insertion order, which makes planning deterministic
/// for identical inputs.
#[derive(Clone, Debug)]
pub struct InstallSet {
    packages: Vec<PackageNode>,
}

impl InstallSet {
    pub fn new(packages: Vec<PackageNode>) -> Result<Self> {
        let mut seen: HashSet<&str> = HashSet::new();
        for package in &packages {
            ensure!(
                seen.insert(&package.atom),
                "duplicate package in install set: {}",
                package.atom
            );
        }
        Ok(Self { packages })
    }

    /// Builds an install set from binary package files, deriving each
    /// package's atom and dependency fingerprint from its XPAK metadata.
    pub fn from_binary_packages<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let packages = paths
            .iter()
            .map(|path| {
                let bp = BinaryPackage::open(path.as_ref())?;
                Ok(PackageNode {
                    atom: bp.atom(),
                    direct_runtime_deps: bp.exact_runtime_atoms(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(packages)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn atoms(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(|p| p.atom.as_str())
    }

    /// Computes the install plan.
    ///
    /// Wave *i* contains every not-yet-planned package whose direct runtime
    /// deps are all in waves 0..*i*. The flattened plan is a topological
    /// order of the dependency DAG; a cycle, or a dependency naming a
    /// package outside the set, fails the whole plan.
    pub fn plan(&self) -> Result<Vec<InstallGroup>> {
        let known: HashSet<&str> = self.packages.iter().map(|p| p.atom.as_str()).collect();
        for package in &self.packages {
            for dep in &package.direct_runtime_deps {
                ensure!(
                    known.contains(dep.as_str()),
                    "unsatisfiable dependencies: {} requires {} which is not in the install set",
                    package.atom,
                    dep
                );
            }
        }

        let mut groups: Vec<InstallGroup> = Vec::new();
        let mut satisfied: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&PackageNode> = self.packages.iter().collect();

        // Every round satisfies at least one package, so |set| rounds always
        // suffice.
        for _ in 0..self.packages.len() {
            if remaining.is_empty() {
                break;
            }

            let (wave, rest): (Vec<&PackageNode>, Vec<&PackageNode>) =
                remaining.into_iter().partition(|p| {
                    p.direct_runtime_deps
                        .iter()
                        .all(|d| satisfied.contains(d.as_str()))
                });

            if wave.is_empty() {
                bail!(
                    "unsatisfiable dependencies: dependency cycle among {}",
                    rest.iter().map(|p| &p.atom).join(", ")
                );
            }

            for package in &wave {
                satisfied.insert(package.atom.as_str());
            }
            groups.push(InstallGroup {
                atoms: wave.into_iter().map(|p| p.atom.clone()).collect(),
            });
            remaining = rest;
        }

        Ok(groups)
    }

    /// Like [`InstallSet::plan`], but flattens the waves into one
    /// topologically ordered atom list.
    pub fn plan_flattened(&self) -> Result<Vec<String>> {
        Ok(self
            .plan()?
            .into_iter()
            .flat_map(|group| group.atoms)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(atom: &str, deps: &[&str]) -> PackageNode {
        PackageNode {
            atom: atom.to_owned(),
            direct_runtime_deps: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn diamond() -> Vec<PackageNode> {
        vec![
            node("=app/a-1.0", &[]),
            node("=app/b-1.0", &["=app/a-1.0"]),
            node("=app/c-1.0", &["=app/a-1.0"]),
            node("=app/d-1.0", &["=app/b-1.0", "=app/c-1.0"]),
        ]
    }

    #[test]
    fn plans_diamond_in_three_waves() -> Result<()> {
        let groups = InstallSet::new(diamond())?.plan()?;
        assert_eq!(
            groups,
            vec![
                InstallGroup {
                    atoms: vec!["=app/a-1.0".to_owned()]
                },
                InstallGroup {
                    atoms: vec!["=app/b-1.0".to_owned(), "=app/c-1.0".to_owned()]
                },
                InstallGroup {
                    atoms: vec!["=app/d-1.0".to_owned()]
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn rejects_cycle() -> Result<()> {
        let mut packages = diamond();
        // Close the diamond into a cycle: a now depends on d.
        packages[0].direct_runtime_deps = vec!["=app/d-1.0".to_owned()];

        let err = InstallSet::new(packages)?.plan().unwrap_err();
        assert!(
            err.to_string().contains("unsatisfiable dependencies"),
            "{err}"
        );
        Ok(())
    }

    #[test]
    fn rejects_dep_outside_set() -> Result<()> {
        let packages = vec![node("=app/a-1.0", &["=app/missing-1.0"])];
        let err = InstallSet::new(packages)?.plan().unwrap_err();
        assert!(err.to_string().contains("not in the install set"), "{err}");
        Ok(())
    }

    #[test]
    fn rejects_duplicate_atoms() {
        let packages = vec![node("=app/a-1.0", &[]), node("=app/a-1.0", &[])];
        assert!(InstallSet::new(packages).is_err());
    }

    #[test]
    fn plan_is_a_partition_in_topological_order() -> Result<()> {
        let packages = diamond();
        let set = InstallSet::new(packages.clone())?;
        let groups = set.plan()?;

        // Partition: every package appears exactly once.
        let mut flattened: Vec<&str> = groups
            .iter()
            .flat_map(|g| g.atoms.iter().map(String::as_str))
            .collect();
        let mut expected: Vec<&str> = set.atoms().collect();
        flattened.sort_unstable();
        expected.sort_unstable();
        assert_eq!(flattened, expected);

        // Topological: every dep lands in a strictly earlier wave.
        for (i, group) in groups.iter().enumerate() {
            let earlier: HashSet<&str> = groups[..i]
                .iter()
                .flat_map(|g| g.atoms.iter().map(String::as_str))
                .collect();
            for atom in &group.atoms {
                let package = packages.iter().find(|p| &p.atom == atom).unwrap();
                for dep in &package.direct_runtime_deps {
                    assert!(earlier.contains(dep.as_str()), "{atom} before {dep}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn plan_is_deterministic() -> Result<()> {
        let set = InstallSet::new(diamond())?;
        assert_eq!(set.plan()?, set.plan()?);
        Ok(())
    }

    #[test]
    fn empty_set_plans_to_no_waves() -> Result<()> {
        let set = InstallSet::new(Vec::new())?;
        assert!(set.plan()?.is_empty());
        Ok(())
    }

    #[test]
    fn builds_from_binary_packages() -> Result<()> {
        let temp_dir = fileutil::SafeTempDir::new()?;
        let dir = temp_dir.path();

        let a = dir.join("libfoo-1.0.tbz2");
        let b = dir.join("bar-2.1-r3.tbz2");
        testutil::write_fake_package(&a, "dev-libs", "libfoo-1.0", &[])?;
        testutil::write_fake_package(
            &b,
            "app-misc",
            "bar-2.1-r3",
            // The range dep points outside the modeled set and forms no edge.
            &["=dev-libs/libfoo-1.0", ">=sys-libs/zlib-1.2"],
        )?;

        let set = InstallSet::from_binary_packages(&[&a, &b])?;
        let groups = set.plan()?;
        assert_eq!(
            groups,
            vec![
                InstallGroup {
                    atoms: vec!["=dev-libs/libfoo-1.0".to_owned()]
                },
                InstallGroup {
                    atoms: vec!["=app-misc/bar-2.1-r3".to_owned()]
                },
            ]
        );
        Ok(())
    }
}
