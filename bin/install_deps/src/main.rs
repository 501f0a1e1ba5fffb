// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Error, Result};
use clap::Parser;
use cliutil::{cli_main, expanded_args_os, EXIT_CODE_INVALID_INPUT};
use container::{CommonArgs, ContainerSettings};
use fileutil::{DualPath, SafeTempDir, SafeTempDirBuilder};
use processes::status_to_exit_code;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::ExitCode,
    str::FromStr,
};

const HOST_PKGDIR: &str = "var/lib/portage/pkgs";

#[derive(Parser, Debug)]
#[clap(about = "Installs binary packages into an SDK layer, wave by wave.")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Name of the target board; empty installs into the host root.
    #[arg(long, default_value = "")]
    board: String,

    /// One wave of target-scope packages, as colon-joined .tbz2 paths.
    /// Repeatable; wave i installs only after waves 0..i completed.
    #[arg(long)]
    install_target: Vec<InstallWave>,

    /// Host-scope packages, same format. All host packages install in one
    /// pass before the target waves.
    #[arg(long)]
    install_host: Vec<InstallWave>,

    /// Directory receiving the resulting layer.
    #[arg(long, required = true)]
    output: PathBuf,

    /// Also extracts the layer's symlinks into this sidecar index, for
    /// storage that does not preserve symlinks.
    #[arg(long)]
    symlink_index: Option<PathBuf>,
}

/// A colon-joined list of binary package paths forming one install wave.
#[derive(Clone, Debug)]
struct InstallWave {
    packages: Vec<PathBuf>,
}

impl FromStr for InstallWave {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self {
            packages: s.split(':').map(PathBuf::from).collect(),
        })
    }
}

fn target_pkgdir(board: &str) -> PathBuf {
    if board.is_empty() {
        Path::new("/").join(HOST_PKGDIR)
    } else {
        Path::new("/build").join(board).join("packages")
    }
}

/// Copies each wave's packages into the staged package directory and
/// returns one space-joined atom list per wave.
fn stage_waves(
    staging: &DualPath,
    pkgdir_inside: &Path,
    waves: &[InstallWave],
) -> Result<Vec<String>> {
    let staged = staging.join(pkgdir_inside.strip_prefix("/")?);
    waves
        .iter()
        .map(|wave| {
            let atoms = container::copy_binary_packages(staged.outside(), &wave.packages)?;
            Ok(atoms.join(" "))
        })
        .collect()
}

fn install_envs(
    board: &str,
    target_waves: &[String],
    host_atoms: &str,
) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();

    let root = if board.is_empty() {
        "/".to_owned()
    } else {
        format!("/build/{board}/")
    };
    envs.insert("ROOT".to_owned(), root.clone());
    envs.insert("SYSROOT".to_owned(), root.clone());
    envs.insert("PORTAGE_CONFIGROOT".to_owned(), root);
    if !board.is_empty() {
        envs.insert("BOARD".to_owned(), board.to_owned());
    }
    envs.insert("PORTAGE_USERNAME".to_owned(), "root".to_owned());
    envs.insert("PORTAGE_GRPNAME".to_owned(), "root".to_owned());
    envs.insert(
        "FEATURES".to_owned(),
        "-sandbox -usersandbox fakeroot".to_owned(),
    );
    envs.insert(
        "PKGDIR".to_owned(),
        target_pkgdir(board).to_string_lossy().into_owned(),
    );
    envs.insert("PKGDIR_HOST".to_owned(), format!("/{HOST_PKGDIR}"));

    for (i, wave) in target_waves.iter().enumerate() {
        envs.insert(format!("INSTALL_ATOMS_TARGET_{i}"), wave.clone());
    }
    if !host_atoms.is_empty() {
        envs.insert("INSTALL_ATOMS_HOST".to_owned(), host_atoms.to_owned());
    }

    envs
}

fn do_main() -> Result<ExitCode> {
    let args = match Cli::try_parse_from(expanded_args_os()?) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return Ok(ExitCode::from(EXIT_CODE_INVALID_INPUT));
        }
    };

    std::fs::create_dir_all(&args.output)?;

    // Keep the store next to the output so harvesting is a rename.
    let mutable_base_dir = SafeTempDirBuilder::new().base_dir(&args.output).build()?;

    let staging_dir = SafeTempDir::new()?;
    let staging = DualPath::new(staging_dir.path(), "/");

    let target_waves = stage_waves(&staging, &target_pkgdir(&args.board), &args.install_target)?;
    let host_waves = stage_waves(&staging, &Path::new("/").join(HOST_PKGDIR), &args.install_host)?;
    let host_atoms = host_waves.join(" ");

    let mut settings = ContainerSettings::new();
    settings.set_mutable_base_dir(mutable_base_dir.path());
    settings.apply_common_args(&args.common)?;
    settings.push_layer_path(staging_dir.path())?;

    let mut container = settings.prepare()?;

    let mut command = container.command("true");
    command.envs(install_envs(&args.board, &target_waves, &host_atoms));

    let status = command.status()?;
    if !status.success() {
        tracing::error!("Installer failed: {:?}", status);
        return Ok(status_to_exit_code(&status));
    }

    // The upper layer is the result. Normalize it, then hand it over.
    fileutil::move_dir_contents(&container.upper_dir(), &args.output)?;
    drop(container);
    drop(mutable_base_dir);

    container::clean_layer(&args.output)?;

    if let Some(index_path) = &args.symlink_index {
        let count = container::symlink_index::create(&args.output, index_path)?;
        tracing::info!("Indexed {count} symlinks into {}", index_path.display());
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    cli_main(do_main, Default::default())
}
