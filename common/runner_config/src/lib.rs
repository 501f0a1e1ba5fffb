// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The serialized contract between container launchers and the
//! container_runner binary. The runner re-executes itself across namespace
//! boundaries, so everything it needs must round-trip through this config.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Whose package directory a package tarball layer materializes into.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageScope {
    /// `/var/lib/portage/pkgs` in the container.
    Host,
    /// `/build/<board>/packages` in the container.
    Board(String),
}

impl PackageScope {
    /// The in-container package directory for this scope.
    pub fn packages_dir(&self) -> PathBuf {
        match self {
            PackageScope::Host => PathBuf::from("var/lib/portage/pkgs"),
            PackageScope::Board(board) => Path::new("build").join(board).join("packages"),
        }
    }
}

/// One file system layer of the container root.
///
/// This is the single place that knows how layer kinds are told apart; every
/// consumer matches this enum exhaustively instead of sniffing file names.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LayerSpec {
    /// A directory used as an overlay lower as-is.
    Directory { path: PathBuf },
    /// A tar archive (`.tar`, `.tar.zst`, `.tar.gz`), extracted before use.
    Tarball { path: PathBuf },
    /// A sidecar tar holding only symlinks, restored above its paired
    /// directory layer.
    SymlinkIndex { path: PathBuf },
    /// A `.tbz2` binary package materialized into a package directory so the
    /// in-container recipe manager can install it.
    PackageTarball { path: PathBuf, scope: PackageScope },
}

impl LayerSpec {
    /// Rewrites the layer path to an absolute one, resolved against the
    /// current working directory.
    pub fn absolutize(self) -> Result<Self> {
        use path_absolutize::Absolutize;
        let absolutize = |path: PathBuf| -> Result<PathBuf> {
            Ok(path.absolutize()?.into_owned())
        };
        Ok(match self {
            LayerSpec::Directory { path } => LayerSpec::Directory {
                path: absolutize(path)?,
            },
            LayerSpec::Tarball { path } => LayerSpec::Tarball {
                path: absolutize(path)?,
            },
            LayerSpec::SymlinkIndex { path } => LayerSpec::SymlinkIndex {
                path: absolutize(path)?,
            },
            LayerSpec::PackageTarball { path, scope } => LayerSpec::PackageTarball {
                path: absolutize(path)?,
                scope,
            },
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            LayerSpec::Directory { path } => path,
            LayerSpec::Tarball { path } => path,
            LayerSpec::SymlinkIndex { path } => path,
            LayerSpec::PackageTarball { path, .. } => path,
        }
    }

    /// Classifies an on-disk layer input. Package tarballs default to host
    /// scope; use [`LayerSpec::parse`] to choose a board scope explicitly.
    pub fn detect(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|x| x.to_str())
            .unwrap_or_default();
        let path = path.to_path_buf();
        if file_name.ends_with(".symlinks.tar") {
            Ok(LayerSpec::SymlinkIndex { path })
        } else if std::fs::metadata(&path)?.is_dir() {
            Ok(LayerSpec::Directory { path })
        } else if file_name.ends_with(".tar.zst")
            || file_name.ends_with(".tar.gz")
            || file_name.ends_with(".tar")
        {
            Ok(LayerSpec::Tarball { path })
        } else if file_name.ends_with(".tbz2") {
            Ok(LayerSpec::PackageTarball {
                path,
                scope: PackageScope::Host,
            })
        } else {
            bail!("unsupported layer type: {}", path.display());
        }
    }

    /// Parses a command-line layer spec: either a bare path (classified by
    /// [`LayerSpec::detect`]) or `<kind>=<path>` with kind one of `dir`,
    /// `tar`, `symlink-index`, `pkg`, `pkg:<board>`.
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some((kind, path)) = spec.split_once('=') {
            let path = PathBuf::from(path);
            match kind {
                "dir" => return Ok(LayerSpec::Directory { path }),
                "tar" => return Ok(LayerSpec::Tarball { path }),
                "symlink-index" => return Ok(LayerSpec::SymlinkIndex { path }),
                "pkg" => {
                    return Ok(LayerSpec::PackageTarball {
                        path,
                        scope: PackageScope::Host,
                    })
                }
                _ => {
                    if let Some(board) = kind.strip_prefix("pkg:") {
                        return Ok(LayerSpec::PackageTarball {
                            path,
                            scope: PackageScope::Board(board.to_owned()),
                        });
                    }
                    // Fall through: not a kind prefix, maybe a path with '='.
                }
            }
        }
        Self::detect(Path::new(spec))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindMountConfig {
    pub mount_path: PathBuf,
    pub source: PathBuf,
    pub rw: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// The command to run in the container.
    pub args: Vec<OsString>,

    /// Environment variables for the process in the container. The rest of
    /// the environment is cleared.
    #[serde(with = "serde_os_string_map")]
    pub envs: BTreeMap<OsString, OsString>,

    /// Working directory inside the container.
    pub chdir: PathBuf,

    /// Layers composing the root, ordered lowest first.
    pub layers: Vec<LayerSpec>,

    /// Additional bind mounts applied over the composed root.
    pub bind_mounts: Vec<BindMountConfig>,

    /// Allows network access. Reduces hermeticity; use only when the recipe
    /// genuinely needs it.
    pub allow_network_access: bool,

    /// If true, the host file system stays visible at /host.
    pub keep_host_mount: bool,

    /// Directory in which the runner keeps the overlay `upper` and `work`
    /// directories. When set, the upper directory survives the container for
    /// the launcher to harvest; when unset, it lives on the stage tmpfs and
    /// vanishes with the session.
    pub store_dir: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn deserialize_from(path: &Path) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    pub fn serialize_to(&self, path: &Path) -> Result<()> {
        serde_json::to_writer(File::create(path)?, self)?;
        Ok(())
    }
}

/// Implements serialization/deserialization of `BTreeMap<OsString, T>`.
///
/// Serde does not support maps with non-String keys out of the box; this
/// module converts [`OsString`] keys through [`String`].
mod serde_os_string_map {
    use std::{collections::BTreeMap, ffi::OsString};

    use serde::{ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(map: &BTreeMap<OsString, T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        let mut serializer_map = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map.iter() {
            let key_str = key.to_string_lossy();
            serializer_map.serialize_entry(&key_str, value)?;
        }
        serializer_map.end()
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<BTreeMap<OsString, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let map = BTreeMap::<String, T>::deserialize(deserializer)?;
        let map = map
            .into_iter()
            .map(|(key, value)| (OsString::from(key), value))
            .collect();
        Ok(map)
    }
}
