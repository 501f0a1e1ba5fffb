// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use cliutil::{cli_main, expanded_args_os, split_key_value, EXIT_CODE_INVALID_INPUT};
use container::{BindMount, CommonArgs, ContainerSettings};
use fileutil::{DualPath, SafeTempDir, SafeTempDirBuilder};
use install_plan::InstallSet;
use processes::status_to_exit_code;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::ExitCode,
};
use version::Version;

const EBUILD_EXT: &str = ".ebuild";
const SOURCE_DIR: &str = "mnt/host/source";
const DISTDIR: &str = "var/cache/distfiles";
const HOST_PKGDIR: &str = "var/lib/portage/pkgs";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Builds a binary package from a recipe \
    inside a hermetic container.", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Recipe file path of the form
    /// [<overlay>/]<category>/<package>/<name>-<version>.ebuild.
    #[arg(long, required = true)]
    ebuild: PathBuf,

    /// Overrides the category derived from the recipe path.
    #[arg(long)]
    category: Option<String>,

    /// Name of the target board; empty for a host build.
    #[arg(long, default_value = "")]
    board: String,

    /// Where to copy the produced binary package.
    #[arg(long, required = true)]
    output: PathBuf,

    /// Auxiliary file staged next to the recipe: <relative-path>=<host-path>.
    #[arg(long)]
    file: Vec<String>,

    /// Upstream archive staged into the distfile directory:
    /// <name>=<host-path>.
    #[arg(long)]
    distfile: Vec<String>,

    /// Host-scope binary package to stage and install before the build.
    #[arg(long)]
    host_install: Vec<PathBuf>,

    /// Target-scope binary package to stage and install before the build.
    #[arg(long)]
    target_install: Vec<PathBuf>,

    /// Allows network access during the build. Reduces hermeticity.
    #[arg(long)]
    allow_network_access: bool,

    /// Also runs the recipe's test phase.
    #[arg(long)]
    test: bool,
}

/// The parsed identity of a recipe file.
#[derive(Clone, Debug, Eq, PartialEq)]
struct RecipeSpec {
    source: PathBuf,
    /// Overlay prefix of the recipe path; empty when the path carries none.
    overlay: String,
    category: String,
    package_name: String,
    file_name: String,
    version: Version,
}

impl RecipeSpec {
    /// Parses `[<overlay>/]<category>/<package>/<name>-<version>.ebuild`.
    fn parse(path: &Path, category_override: Option<&str>) -> Result<Self> {
        let text = path.to_str().context("Recipe path must be UTF-8")?;
        let stripped = text
            .strip_suffix(EBUILD_EXT)
            .with_context(|| format!("Recipe must have the {EBUILD_EXT} suffix: {text:?}"))?;
        let (rest, version) = Version::from_str_suffix(stripped)
            .with_context(|| format!("Recipe name carries no parsable version: {text:?}"))?;

        let parts: Vec<&str> = rest.split('/').collect();
        ensure!(
            parts.len() >= 3,
            "Unable to parse recipe path: {:?} (want [<overlay>/]<category>/<package>/<name>-<version>{})",
            text,
            EBUILD_EXT,
        );

        let file_name = Path::new(text)
            .file_name()
            .context("Recipe must have a file name")?
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            source: path.to_owned(),
            overlay: parts[..parts.len() - 3].join("/"),
            category: category_override
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| parts[parts.len() - 3].to_owned()),
            package_name: parts[parts.len() - 2].to_owned(),
            file_name,
            version,
        })
    }

    /// The PF of the package this recipe produces, i.e. the recipe file name
    /// stem.
    fn pf(&self) -> &str {
        self.file_name
            .strip_suffix(EBUILD_EXT)
            .expect("file_name validated at parse time")
    }
}

/// The in-container package directory for the build's scope.
fn target_pkgdir(board: &str) -> PathBuf {
    if board.is_empty() {
        Path::new("/").join(HOST_PKGDIR)
    } else {
        Path::new("/build").join(board).join("packages")
    }
}

/// The in-container root of the recipe's overlay.
fn overlay_dir(overlay: &str) -> PathBuf {
    let source_root = Path::new("/").join(SOURCE_DIR);
    if overlay.is_empty() {
        source_root
    } else {
        source_root.join(overlay)
    }
}

/// Assembles the recipe-manager environment of the build.
fn build_envs(
    board: &str,
    overlay: &str,
    target_waves: &[install_plan::InstallGroup],
    host_atoms: &[String],
    allow_network_access: bool,
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
    // Sandboxes need privileges the container does not have; ownership is
    // recorded through fakeroot instead.
    envs.insert(
        "FEATURES".to_owned(),
        "-sandbox -usersandbox fakeroot".to_owned(),
    );
    if !allow_network_access {
        envs.insert("RESTRICT".to_owned(), "fetch".to_owned());
    }

    for (i, wave) in target_waves.iter().enumerate() {
        envs.insert(format!("INSTALL_ATOMS_TARGET_{i}"), wave.env_value());
    }
    if !host_atoms.is_empty() {
        envs.insert("INSTALL_ATOMS_HOST".to_owned(), host_atoms.join(" "));
    }

    envs.insert(
        "PKGDIR".to_owned(),
        target_pkgdir(board).to_string_lossy().into_owned(),
    );
    envs.insert("PKGDIR_HOST".to_owned(), format!("/{HOST_PKGDIR}"));
    envs.insert("DISTDIR".to_owned(), format!("/{DISTDIR}"));

    let overlay_dir = overlay_dir(overlay).to_string_lossy().into_owned();
    envs.insert("PORTDIR".to_owned(), overlay_dir.clone());
    envs.insert("PORTDIR_OVERLAY".to_owned(), overlay_dir);

    envs
}

/// Builds the staging tree: the highest overlay layer carrying the recipe,
/// its auxiliary files, distfiles, and the binary packages to install.
/// Returns the staged recipe's in-container path.
fn populate_staging(
    staging: &DualPath,
    spec: &RecipeSpec,
    files: &[(String, PathBuf)],
    distfiles: &[(String, PathBuf)],
) -> Result<DualPath> {
    let recipe_dir = staging
        .join(SOURCE_DIR)
        .join(&spec.overlay)
        .join(&spec.category)
        .join(&spec.package_name);
    std::fs::create_dir_all(recipe_dir.outside())?;

    let recipe = recipe_dir.join(&spec.file_name);
    std::fs::copy(&spec.source, recipe.outside())
        .with_context(|| format!("Failed to stage recipe {}", spec.source.display()))?;

    for (relative, source) in files {
        let dest = recipe_dir.join(relative);
        std::fs::create_dir_all(dest.outside().parent().context("File spec has no parent")?)?;
        std::fs::copy(source, dest.outside())
            .with_context(|| format!("Failed to stage file {}", source.display()))?;
    }

    let distdir = staging.join(DISTDIR);
    std::fs::create_dir_all(distdir.outside())?;
    for (name, source) in distfiles {
        std::fs::copy(source, distdir.join(name).outside())
            .with_context(|| format!("Failed to stage distfile {}", source.display()))?;
    }

    Ok(recipe)
}

fn parse_key_value_flags(specs: &[String]) -> Result<Vec<(String, PathBuf)>> {
    specs
        .iter()
        .map(|spec| {
            let (key, value) = split_key_value(spec)?;
            Ok((key.to_owned(), PathBuf::from(value)))
        })
        .collect()
}

fn do_main() -> Result<ExitCode> {
    let args = match Cli::try_parse_from(expanded_args_os()?) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return Ok(ExitCode::from(EXIT_CODE_INVALID_INPUT));
        }
    };

    let spec = match RecipeSpec::parse(&args.ebuild, args.category.as_deref()) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!("Invalid recipe name: {:?}", e);
            return Ok(ExitCode::from(EXIT_CODE_INVALID_INPUT));
        }
    };

    tracing::info!(
        "Building {}/{}-{} (board: {:?})",
        spec.category,
        spec.package_name,
        spec.version,
        args.board
    );

    let files = parse_key_value_flags(&args.file)?;
    let distfiles = parse_key_value_flags(&args.distfile)?;

    // Plan target installs into waves; host installs flatten into one
    // topologically ordered pass.
    let target_waves = InstallSet::from_binary_packages(&args.target_install)?.plan()?;
    let host_atoms = InstallSet::from_binary_packages(&args.host_install)?.plan_flattened()?;

    // Stage everything the container must see at its well-known paths.
    let staging_dir = SafeTempDir::new()?;
    let staging = DualPath::new(staging_dir.path(), "/");
    let recipe = populate_staging(&staging, &spec, &files, &distfiles)?;

    let target_pkgdir = target_pkgdir(&args.board);
    let staged_target_pkgdir = staging.join(target_pkgdir.strip_prefix("/")?);
    container::copy_binary_packages(staged_target_pkgdir.outside(), &args.target_install)?;
    let staged_host_pkgdir = staging.join(HOST_PKGDIR);
    container::copy_binary_packages(staged_host_pkgdir.outside(), &args.host_install)?;

    // The produced package lands in the overlay store; keep it on the same
    // file system as the output so the final copy stays cheap.
    let output_parent = args.output.parent().context("--output has no parent")?;
    std::fs::create_dir_all(output_parent)?;
    let mutable_base_dir = SafeTempDirBuilder::new().base_dir(output_parent).build()?;

    let mut settings = ContainerSettings::new();
    settings.set_mutable_base_dir(mutable_base_dir.path());
    settings.apply_common_args(&args.common)?;
    settings.set_allow_network_access(args.allow_network_access);

    if args.allow_network_access {
        for path in [Path::new("/etc/resolv.conf"), Path::new("/etc/hosts")] {
            if path.try_exists()? {
                settings.push_bind_mount(BindMount {
                    source: path.to_owned(),
                    mount_path: path.to_owned(),
                    rw: false,
                });
            }
        }
    }

    // The staging tree goes on top of the SDK, overlay, and source layers.
    settings.push_layer_path(staging_dir.path())?;

    let mut container = settings.prepare()?;

    let mut command = container.command("ebuild");
    command
        .arg("--skip-manifest")
        .arg(recipe.inside())
        .arg("clean")
        .arg("package")
        .envs(build_envs(
            &args.board,
            &spec.overlay,
            &target_waves,
            &host_atoms,
            args.allow_network_access,
        ));
    if args.test {
        command.arg("test");
    }

    let status = command.status()?;
    if !status.success() {
        tracing::error!("Recipe failed: {:?}", status);
        return Ok(status_to_exit_code(&status));
    }

    // Harvest the produced package from the overlay upper layer.
    let produced = container
        .upper_dir()
        .join(target_pkgdir.strip_prefix("/")?)
        .join(&spec.category)
        .join(format!("{}.tbz2", spec.pf()));
    std::fs::copy(&produced, &args.output).with_context(|| {
        format!(
            "{} wasn't produced by the recipe",
            produced.display()
        )
    })?;

    // The output must parse back to the identity we built.
    let package = binarypackage::BinaryPackage::open(&args.output)?;
    ensure!(
        package.category() == spec.category && package.pf() == spec.pf(),
        "Produced package identifies as {} but the recipe is {}/{}",
        package.category_pf(),
        spec.category,
        spec.pf(),
    );

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    cli_main(do_main, Default::default())
}
