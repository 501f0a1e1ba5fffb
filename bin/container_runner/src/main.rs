// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use cliutil::{cli_main, handle_top_level_result, log_current_command_line, LoggingConfig};
use container::BindMount;
use fileutil::{SafeTempDir, SafeTempDirBuilder};
use itertools::Itertools;
use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{unshare, CloneFlags},
    unistd::{getgid, getuid, pivot_root},
};
use processes::status_to_exit_code;
use runner_config::{LayerSpec, RunnerConfig};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::File,
    io::Read,
    os::unix::{fs::DirBuilderExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, ExitCode, Stdio},
};
use tracing::info_span;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

mod loopback;

const BIND_REC: MsFlags = MsFlags::MS_BIND.union(MsFlags::MS_REC);
const NONE_STR: Option<&str> = None::<&str>;

fn absolutize(path: &Path) -> Result<PathBuf> {
    use path_absolutize::Absolutize;
    Ok(path.absolutize()?.into_owned())
}

/// Overlayfs refuses to mount with 500 or more lower directories.
const MAX_LOWER_DIRS: usize = 500;

#[derive(Parser, Debug)]
#[clap(about = "Runs a command in an ephemeral rootless container \
    assembled from file system layers.")]
struct Cli {
    /// A path to a serialized runner config. When set, the layer and mount
    /// flags below are ignored. This is how launcher libraries invoke the
    /// runner.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Whether we are already inside the namespaces. Never set this; it is
    /// an internal flag for the re-executed inner phase.
    #[arg(long, hide = true)]
    already_in_namespace: bool,

    /// Adds a file system layer; repeatable, the first layer is the
    /// highest. Accepts a bare path or `<kind>=<path>`.
    #[arg(long)]
    layer: Vec<String>,

    /// Bind-mounts a host path into the container: <host-path>=<interior-path>.
    #[arg(long)]
    bind_mount: Vec<BindMount>,

    /// Working directory for the command.
    #[arg(long, default_value = "/")]
    chdir: PathBuf,

    /// Keeps the host file system visible at /host.
    #[arg(long)]
    keep_host_mount: bool,

    /// Allows network access. Reduces hermeticity.
    #[arg(long)]
    allow_network_access: bool,

    /// Command line to run in the container.
    #[arg(trailing_var_arg = true)]
    command_line: Vec<OsString>,
}

pub fn main() -> ExitCode {
    let args = Cli::parse();

    if args.already_in_namespace {
        return cli_main(
            || {
                let config_path = args
                    .config
                    .context("--already-in-namespace requires --config")?;
                continue_namespace(RunnerConfig::deserialize_from(&config_path)?)
            },
            Default::default(),
        );
    }

    let _guard = LoggingConfig {
        log_file: None,
        console_logger: Some(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        ),
    }
    .setup()
    .unwrap();
    log_current_command_line();

    let result = || -> Result<ExitCode> {
        // Hold the temporary config directory for the lifetime of the run.
        let _config_holder;
        let config_path = match args.config {
            Some(path) => path,
            None => {
                let config = config_from_cli(&args)?;
                let holder = SafeTempDir::new()?;
                let path = holder.path().join("runner_config.json");
                config.serialize_to(&path)?;
                _config_holder = holder;
                path
            }
        };
        enter_namespace(&config_path)
    }();
    handle_top_level_result(result)
}

/// Translates direct CLI flags into a runner config. Layers arrive
/// highest-first on the command line and are stored lowest-first.
fn config_from_cli(args: &Cli) -> Result<RunnerConfig> {
    ensure!(
        !args.command_line.is_empty(),
        "Specify a command to run in the container"
    );

    // Paths must survive the working-directory changes of the inner phase.
    let mut layers = args
        .layer
        .iter()
        .map(|spec| LayerSpec::parse(spec)?.absolutize())
        .collect::<Result<Vec<_>>>()?;
    layers.reverse();

    // A standalone run inherits the caller's environment; launcher
    // libraries construct a curated environment instead.
    let envs: BTreeMap<OsString, OsString> = std::env::vars_os().collect();

    Ok(RunnerConfig {
        args: args.command_line.clone(),
        envs,
        chdir: args.chdir.clone(),
        layers,
        bind_mounts: args
            .bind_mount
            .iter()
            .cloned()
            .map(|mut mount| {
                mount.source = absolutize(&mount.source)?;
                Ok(mount.into_config())
            })
            .collect::<Result<Vec<_>>>()?,
        allow_network_access: args.allow_network_access,
        keep_host_mount: args.keep_host_mount,
        store_dir: None,
    })
}

/// The outer phase: enters the user, IPC, network, and PID namespaces, then
/// re-executes itself to finish mount setup inside, and propagates the
/// child's exit status.
fn enter_namespace(config_path: &Path) -> Result<ExitCode> {
    let config = RunnerConfig::deserialize_from(config_path)?;

    // Enter an unprivileged user namespace mapping us to root inside.
    if !nix::unistd::geteuid().is_root() {
        let uid = getuid();
        let gid = getgid();
        unshare(CloneFlags::CLONE_NEWUSER)
            .context("Failed to create an unprivileged user namespace")?;
        std::fs::write("/proc/self/setgroups", "deny")
            .context("Writing /proc/self/setgroups")?;
        std::fs::write("/proc/self/uid_map", format!("0 {uid} 1\n"))
            .context("Writing /proc/self/uid_map")?;
        std::fs::write("/proc/self/gid_map", format!("0 {gid} 1\n"))
            .context("Writing /proc/self/gid_map")?;
    }

    let mut unshare_flags = CloneFlags::CLONE_NEWIPC;
    if !config.allow_network_access {
        unshare_flags |= CloneFlags::CLONE_NEWNET;
    }
    unshare(unshare_flags)
        .with_context(|| format!("Failed to enter namespaces (flags={:?})", unshare_flags))?;

    // Start a "sentinel" subprocess that belongs to the new namespaces
    // (except the PID namespace) and exits *after* the current process.
    //
    // Some namespaces (e.g. network) are expensive to destroy. If the
    // current process were the last one in them, our parent would have to
    // wait for the kernel to tear the namespaces down. The sentinel is a cat
    // process with a piped stdin that we leak: when this process exits, the
    // kernel closes the pipe's write end and the cat exits, off the critical
    // path.
    //
    // The sentinel cannot live in the PID namespace: a process that called
    // unshare(CLONE_NEWPID) may fork only once. Destroying a PID namespace
    // is cheap, so that is fine.
    let sentinel = Command::new("/bin/cat")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    std::mem::forget(sentinel);

    unshare(CloneFlags::CLONE_NEWPID).context("Failed to enter PID namespace")?;

    // The inner phase pivots its root away, so it can never delete the
    // temporary directories it creates. Point its TMPDIR at a directory this
    // process owns and removes after the wait.
    let temp_dir = SafeTempDir::new()?;

    let status = processes::run(
        Command::new(std::env::current_exe()?)
            .arg("--config")
            .arg(config_path)
            .arg("--already-in-namespace")
            .env("TMPDIR", temp_dir.path()),
    )?;

    Ok(status_to_exit_code(&status))
}

/// Realizes one layer input into a directory to bind-mount under `lowers`.
///
/// Tarballs and other extracted layers land in temporary directories under
/// the outer phase's TMPDIR rather than on the stage tmpfs, both to spare
/// RAM and because only the outer phase can clean them up.
fn realize_layers(
    config: &RunnerConfig,
    lowers_dir: &Path,
    base_dir: PathBuf,
    dir_builder: &std::fs::DirBuilder,
) -> Result<Vec<PathBuf>> {
    let mut lower_dirs: Vec<PathBuf> = vec![base_dir];
    let mut last_tar_content_dir: Option<PathBuf> = None;

    for (layer_index, layer) in config.layers.iter().enumerate() {
        let _span = info_span!("realize_layer", ?layer).entered();

        let bind_lower = |content_dir: &Path, lower_dirs: &mut Vec<PathBuf>| -> Result<()> {
            let lower_dir = lowers_dir.join(layer_index.to_string());
            dir_builder.create(&lower_dir)?;
            mount(Some(content_dir), &lower_dir, NONE_STR, BIND_REC, NONE_STR)
                .with_context(|| format!("Failed bind-mounting {content_dir:?}"))?;
            lower_dirs.push(lower_dir);
            Ok(())
        };

        match layer {
            LayerSpec::Directory { path } => {
                bind_lower(path, &mut lower_dirs)?;
                last_tar_content_dir = None;
            }
            LayerSpec::Tarball { path } => {
                // Consecutive tarballs extract into the same content
                // directory: later entries overwrite earlier ones, which
                // matches overlay semantics and keeps the lower count low.
                if let Some(content_dir) = &last_tar_content_dir {
                    extract_tarball(path, content_dir)?;
                    continue;
                }
                let content_dir = SafeTempDir::new()?.into_path();
                extract_tarball(path, &content_dir)?;
                bind_lower(&content_dir, &mut lower_dirs)?;
                last_tar_content_dir = Some(content_dir);
            }
            LayerSpec::SymlinkIndex { path } => {
                let content_dir = SafeTempDir::new()?.into_path();
                container::symlink_index::restore(path, &content_dir)?;
                bind_lower(&content_dir, &mut lower_dirs)?;
                last_tar_content_dir = None;
            }
            LayerSpec::PackageTarball { path, scope } => {
                let package = binarypackage::BinaryPackage::open(path)?;
                let content_dir = SafeTempDir::new()?.into_path();
                let package_dir = content_dir
                    .join(scope.packages_dir())
                    .join(package.category());
                dir_builder.create(&package_dir)?;
                let file_name = format!("{}.tbz2", package.pf());
                std::fs::copy(path, package_dir.join(&file_name))
                    .with_context(|| format!("Failed staging package {file_name}"))?;
                bind_lower(&content_dir, &mut lower_dirs)?;
                last_tar_content_dir = None;
            }
        }
    }

    Ok(lower_dirs)
}

/// Extracts a tar archive, decompressing by extension (.tar, .tar.zst,
/// .tar.gz).
fn extract_tarball(archive_path: &Path, extract_dir: &Path) -> Result<()> {
    let file_name = archive_path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or_default();
    let f = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let decompressed: Box<dyn Read> = if file_name.ends_with(".zst") {
        Box::new(zstd::stream::read::Decoder::new(f)?)
    } else if file_name.ends_with(".gz") {
        Box::new(flate2::read::GzDecoder::new(f))
    } else {
        Box::new(f)
    };
    tar::Archive::new(decompressed)
        .unpack(extract_dir)
        .with_context(|| format!("Failed to extract {}", archive_path.display()))?;
    Ok(())
}

/// The inner phase: composes the layered root, pivots into it, and finally
/// execs the requested command as PID 1 of the container.
fn continue_namespace(config: RunnerConfig) -> Result<ExitCode> {
    ensure!(!config.args.is_empty(), "Runner config carries no command");

    unshare(CloneFlags::CLONE_NEWNS).context("Failed to enter mount namespace")?;

    // Remount everything private so nothing we do leaks back into the
    // original namespace, even when running privileged.
    mount(
        Some(""),
        "/",
        Some(""),
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        Some(""),
    )
    .context("Failed to remount file systems as private")?;

    if !config.allow_network_access {
        loopback::enable_loopback_networking()?;
    }

    // The stage holds every mount point of the session. It lives on a tmpfs
    // so the kernel reclaims it when the mount namespace dies; the backing
    // directory itself is under the outer phase's TMPDIR.
    let stage = SafeTempDirBuilder::new().prefix("stage.").build()?.into_path();
    mount(Some("tmpfs"), &stage, Some("tmpfs"), MsFlags::empty(), NONE_STR)
        .context("Failed to mount stage tmpfs")?;

    let root_dir = stage.join("root"); // overlay mount point
    let base_dir = stage.join("base"); // lowest layer: skeleton directories
    let lowers_dir = stage.join("lowers");

    // The store backs the overlay's writable branch. An external store
    // outlives the session so the launcher can harvest the upper directory;
    // the default store sits on the stage tmpfs and evaporates with it.
    let (upper_dir, work_dir) = match &config.store_dir {
        Some(dir) => (dir.join("upper"), dir.join("work")),
        None => {
            let store = stage.join("store");
            (store.join("upper"), store.join("work"))
        }
    };

    let mut binding = std::fs::DirBuilder::new();
    let dir_builder = binding.recursive(true).mode(0o755);
    for dir in [&root_dir, &base_dir, &lowers_dir, &upper_dir, &work_dir] {
        dir_builder.create(dir)?;
    }

    // Skeleton mount points, plus the landing paths of every bind mount so
    // that mounting over the composed root never has to write through the
    // overlay into the upper directory.
    for d in ["dev", "proc", "sys", "tmp", "host"] {
        dir_builder.create(base_dir.join(d))?;
    }
    for spec in &config.bind_mounts {
        let target = base_dir.join(spec.mount_path.strip_prefix("/").with_context(|| {
            format!("Bind mount path must be absolute: {:?}", spec.mount_path)
        })?);
        let metadata = std::fs::metadata(&spec.source).with_context(|| {
            format!("Failed to stat bind-mount source {:?}", spec.source)
        })?;
        if metadata.is_dir() {
            dir_builder.create(&target)?;
        } else {
            dir_builder.create(target.parent().context("Cannot bind-mount the root")?)?;
            if !target.try_exists()? {
                File::create(&target)?;
            }
        }
    }

    let lower_dirs = realize_layers(&config, &lowers_dir, base_dir, dir_builder)?;

    ensure!(
        lower_dirs.len() <= MAX_LOWER_DIRS,
        "Too many overlayfs layers ({} > {MAX_LOWER_DIRS})",
        lower_dirs.len()
    );

    // mount(2) bounds the length of its option string, so refer to
    // directories relative to the lowers directory where that is shorter.
    std::env::set_current_dir(&lowers_dir)?;
    let shorten = |p: &Path| -> Result<String> {
        let relative = pathdiff::diff_paths(p, &lowers_dir)
            .with_context(|| format!("Unable to make {p:?} relative to {lowers_dir:?}"))?;
        let relative = relative.to_string_lossy().into_owned();
        let absolute = p.to_string_lossy().into_owned();
        Ok(if relative.len() < absolute.len() {
            relative
        } else {
            absolute
        })
    };

    let overlay_options = format!(
        "upperdir={},workdir={},lowerdir={}",
        shorten(&upper_dir)?,
        shorten(&work_dir)?,
        // Overlayfs lists the least lower directory last, the reverse of
        // our lowest-first layer order.
        lower_dirs
            .iter()
            .rev()
            .map(|dir| shorten(dir))
            .collect::<Result<Vec<_>>>()?
            .join(":")
    );
    mount(
        Some("none"),
        &root_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some::<&str>(&overlay_options),
    )
    .context("Failed mounting overlayfs")?;

    // Special file systems. /proc needs the new PID namespace, which is why
    // it is mounted here and not borrowed from the host.
    mount(Some("/dev"), &root_dir.join("dev"), NONE_STR, BIND_REC, NONE_STR)
        .context("Bind-mounting /dev")?;
    mount(
        Some("/proc"),
        &root_dir.join("proc"),
        Some("proc"),
        MsFlags::empty(),
        NONE_STR,
    )
    .context("Mounting /proc")?;
    mount(Some("/sys"), &root_dir.join("sys"), NONE_STR, BIND_REC, NONE_STR)
        .context("Bind-mounting /sys")?;

    for spec in &config.bind_mounts {
        let target = root_dir.join(spec.mount_path.strip_prefix("/")?);

        mount(
            Some(&spec.source),
            &target,
            NONE_STR,
            MsFlags::MS_BIND,
            NONE_STR,
        )
        .with_context(|| format!("Failed bind-mounting {:?} to {:?}", spec.source, target))?;
        if !spec.rw {
            // MS_RDONLY is ignored on the initial bind, so remount.
            mount(
                NONE_STR,
                &target,
                NONE_STR,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                NONE_STR,
            )
            .with_context(|| format!("Failed remounting {target:?} read-only"))?;
        }
    }

    pivot_root(&root_dir, &root_dir.join("host")).context("Failed to pivot root")?;

    // The stage is now only reachable through /host. Detach it, and unless
    // asked to keep it, the whole host tree. Lazy unmounts: this binary is
    // dynamically linked and still holds file descriptors into /host.
    let stage_in_host = Path::new("/host").join(stage.strip_prefix("/")?);
    umount2(&stage_in_host, MntFlags::MNT_DETACH)
        .with_context(|| format!("Failed to detach {}", stage_in_host.display()))?;
    if !config.keep_host_mount {
        umount2("/host", MntFlags::MNT_DETACH).context("Failed to detach /host")?;
    }

    let escaped_command = config
        .args
        .iter()
        .map(|s| shell_escape::escape(s.to_string_lossy()))
        .join(" ");
    eprintln!("COMMAND(container): {}", &escaped_command);

    let error = Command::new(&config.args[0])
        .args(&config.args[1..])
        .env_clear()
        .envs(&config.envs)
        .current_dir(&config.chdir)
        .exec();
    Err(anyhow::Error::new(error).context(format!("Failed to exec {:?}", config.args[0])))
}
