// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    os::unix::prelude::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    str::FromStr,
};

use anyhow::{ensure, Context, Result};
use fileutil::{SafeTempDir, SafeTempDirBuilder};
use runner_config::{BindMountConfig, LayerSpec, RunnerConfig};
use strum_macros::EnumString;
use tracing::info_span;

const DEFAULT_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/opt/bin";

/// The in-container path of the setup script every command runs through.
const SETUP_SCRIPT_PATH: &str = "/.setup.sh";

const SETUP_SCRIPT: &str = include_str!("setup.sh");

/// Environment variable overriding where to find the container_runner
/// binary. By default it is expected next to the current executable.
const RUNNER_ENV: &str = "ALLOY_CONTAINER_RUNNER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LoginMode {
    Never,
    Before,
    After,
    AfterFail,
}

#[derive(Clone, Debug)]
pub struct BindMount {
    pub mount_path: PathBuf,
    pub source: PathBuf,
    pub rw: bool,
}

impl FromStr for BindMount {
    type Err = anyhow::Error;

    /// Parses a `<host-path>=<interior-path>` bind-mount spec.
    fn from_str(spec: &str) -> Result<Self> {
        let (source, mount_path) = cliutil::split_key_value(spec)?;
        ensure!(
            Path::new(mount_path).is_absolute(),
            "Invalid bind-mount spec {:?}: interior path must be absolute",
            spec
        );
        Ok(Self {
            source: source.into(),
            mount_path: mount_path.into(),
            rw: false,
        })
    }
}

impl BindMount {
    pub fn into_config(self) -> BindMountConfig {
        BindMountConfig {
            mount_path: self.mount_path,
            source: self.source,
            rw: self.rw,
        }
    }
}

/// Command line options shared by the CLIs that launch containers.
///
/// Include this struct in a struct deriving [`clap::Parser`] and annotate
/// the field with `#[command(flatten)]`.
#[derive(Clone, Debug, clap::Args)]
pub struct CommonArgs {
    /// Adds a file system layer to the container, ordered lowest first.
    /// Accepts a bare path or an explicit `<kind>=<path>` spec.
    #[arg(long)]
    pub layer: Vec<String>,

    /// Opens an interactive shell in the container before running the
    /// command, after it, or only after it failed. For debugging only.
    #[arg(long, default_value_t = LoginMode::Never)]
    pub login: LoginMode,

    /// Keeps the host file system visible at /host. For debugging only;
    /// this defeats the hermeticity of the container.
    #[arg(long)]
    pub keep_host_mount: bool,
}

/// Holds settings to construct containers: file system layers, bind mounts,
/// and hermeticity knobs.
///
/// This is a builder-like object. Mutate it as needed, then call
/// [`ContainerSettings::prepare`] to obtain a [`PreparedContainer`]. The
/// same settings value can prepare any number of containers.
pub struct ContainerSettings {
    mutable_base_dir: PathBuf,
    allow_network_access: bool,
    login_mode: LoginMode,
    keep_host_mount: bool,
    layers: Vec<LayerSpec>,
    bind_mounts: Vec<BindMount>,
}

impl ContainerSettings {
    pub fn new() -> Self {
        Self {
            mutable_base_dir: std::env::temp_dir(),
            allow_network_access: false,
            login_mode: LoginMode::Never,
            keep_host_mount: false,
            layers: Vec::new(),
            bind_mounts: Vec::new(),
        }
    }

    /// Specifies the *mutable base directory* where the overlay store (upper
    /// and work directories) is allocated.
    ///
    /// Defaults to `$TMPDIR`. Point it at a directory on the same file
    /// system as your output if you want to move the upper directory out
    /// without copying across file system boundaries.
    pub fn set_mutable_base_dir(&mut self, mutable_base_dir: &Path) {
        self.mutable_base_dir = mutable_base_dir.to_owned();
    }

    /// Sets whether processes in the container may access the network.
    /// Enable only when absolutely needed; it reduces hermeticity.
    pub fn set_allow_network_access(&mut self, allow_network_access: bool) {
        self.allow_network_access = allow_network_access;
    }

    pub fn set_login_mode(&mut self, login_mode: LoginMode) {
        self.login_mode = login_mode;
    }

    pub fn set_keep_host_mount(&mut self, keep_host_mount: bool) {
        self.keep_host_mount = keep_host_mount;
    }

    /// Pushes a layer onto the stack. Layers are ordered lowest first; the
    /// layer pushed last wins on conflicting paths.
    pub fn push_layer(&mut self, layer: LayerSpec) {
        self.layers.push(layer);
    }

    /// Classifies `path` and pushes it as a layer.
    pub fn push_layer_path(&mut self, path: &Path) -> Result<()> {
        self.layers.push(LayerSpec::detect(path)?);
        Ok(())
    }

    pub fn push_bind_mount(&mut self, bind_mount: BindMount) {
        self.bind_mounts.push(bind_mount);
    }

    /// Applies the settings represented in [`CommonArgs`].
    pub fn apply_common_args(&mut self, args: &CommonArgs) -> Result<()> {
        self.set_login_mode(args.login);
        self.set_keep_host_mount(args.keep_host_mount);
        for spec in &args.layer {
            self.push_layer(LayerSpec::parse(spec)?);
        }
        Ok(())
    }

    /// Allocates the session-scoped state (overlay store, staged setup
    /// script) needed to run commands in a container.
    pub fn prepare(&self) -> Result<PreparedContainer> {
        PreparedContainer::new(self)
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// A container prepared for execution.
///
/// Obtain commands with [`PreparedContainer::command`]; each command runs in
/// a fresh ephemeral namespace over the same overlay store, so changes made
/// by one command are visible to the next. The writable upper directory is
/// available at [`PreparedContainer::upper_dir`] for harvesting outputs;
/// everything is deleted when this value drops.
pub struct PreparedContainer<'settings> {
    settings: &'settings ContainerSettings,

    store_dir: SafeTempDir,
    session_dir: SafeTempDir,

    base_envs: BTreeMap<OsString, OsString>,
}

impl<'settings> PreparedContainer<'settings> {
    fn new(settings: &'settings ContainerSettings) -> Result<Self> {
        let store_dir = SafeTempDirBuilder::new()
            .base_dir(&settings.mutable_base_dir)
            .prefix("store.")
            .build()?;
        std::fs::create_dir(store_dir.path().join("upper"))?;
        std::fs::create_dir(store_dir.path().join("work"))?;

        let session_dir = SafeTempDirBuilder::new()
            .base_dir(&settings.mutable_base_dir)
            .prefix("session.")
            .build()?;

        let setup_script = session_dir.path().join("setup.sh");
        std::fs::write(&setup_script, SETUP_SCRIPT)?;
        std::fs::set_permissions(&setup_script, PermissionsExt::from_mode(0o755))?;

        let mut base_envs: BTreeMap<OsString, OsString> = BTreeMap::from_iter([
            ("PATH".into(), DEFAULT_PATH.into()),
            // Always enable Rust backtraces.
            ("RUST_BACKTRACE".into(), "1".into()),
        ]);
        if settings.login_mode != LoginMode::Never {
            base_envs.insert("_LOGIN_MODE".into(), settings.login_mode.to_string().into());

            // Forward TERM so interactive shells behave correctly.
            if let Some(term) = std::env::var_os("TERM") {
                base_envs.insert("_TERM".into(), term);
            }
        }

        Ok(Self {
            settings,
            store_dir,
            session_dir,
            base_envs,
        })
    }

    /// The overlay upper directory: the only writable surface of the
    /// container, and where its file system changes accumulate.
    pub fn upper_dir(&self) -> PathBuf {
        self.store_dir.path().join("upper")
    }

    /// Creates a [`ContainerCommand`] running `name` in the container.
    ///
    /// Takes `&mut self` so commands cannot run concurrently: the overlay
    /// upper directory must not be shared by two live overlay mounts.
    pub fn command(&mut self, name: impl AsRef<OsStr>) -> ContainerCommand {
        ContainerCommand::new(self, name.as_ref())
    }
}

/// Runs a command in a prepared container.
///
/// The interface follows [`std::process::Command`].
pub struct ContainerCommand<'container> {
    container: &'container PreparedContainer<'container>,
    args: Vec<OsString>,
    envs: BTreeMap<OsString, OsString>,
    current_dir: PathBuf,
}

impl<'container> ContainerCommand<'container> {
    fn new(container: &'container PreparedContainer<'container>, name: &OsStr) -> Self {
        Self {
            args: vec![name.to_owned()],
            envs: container.base_envs.clone(),
            current_dir: PathBuf::from("/"),
            container,
        }
    }

    pub fn current_dir<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.current_dir = path.as_ref().to_owned();
        self
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn env<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs
            .insert(key.as_ref().to_owned(), value.as_ref().to_owned());
        self
    }

    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self.env(key, value);
        }
        self
    }

    /// Runs the command in the container and returns its exit status.
    pub fn status(&mut self) -> Result<ExitStatus> {
        let _span = info_span!("ContainerCommand::status").entered();

        let container = self.container;

        // Every command enters the container through the setup script, which
        // installs staged packages and handles interactive logins.
        let mut real_args: Vec<OsString> = vec![SETUP_SCRIPT_PATH.into()];
        real_args.extend(self.args.clone());

        let mut bind_mounts: Vec<BindMountConfig> = vec![BindMountConfig {
            mount_path: PathBuf::from(SETUP_SCRIPT_PATH),
            source: container.session_dir.path().join("setup.sh"),
            rw: false,
        }];
        bind_mounts.extend(
            container
                .settings
                .bind_mounts
                .iter()
                .cloned()
                .map(BindMount::into_config),
        );

        let config = RunnerConfig {
            args: real_args,
            envs: self.envs.clone(),
            chdir: self.current_dir.clone(),
            layers: container.settings.layers.clone(),
            bind_mounts,
            allow_network_access: container.settings.allow_network_access,
            keep_host_mount: container.settings.keep_host_mount,
            store_dir: Some(container.store_dir.path().to_path_buf()),
        };

        let config_path = container.session_dir.path().join("runner_config.json");
        config.serialize_to(&config_path)?;

        let status = processes::run(
            Command::new(locate_runner()?)
                .arg("--config")
                .arg(&config_path),
        )?;

        Ok(status)
    }
}

/// Finds the container_runner binary: either the ALLOY_CONTAINER_RUNNER
/// override or a sibling of the current executable.
fn locate_runner() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(RUNNER_ENV) {
        return Ok(PathBuf::from(path));
    }
    let current_exe = std::env::current_exe()?;
    let path = current_exe
        .parent()
        .context("Current executable has no parent directory")?
        .join("container_runner");
    ensure!(
        path.try_exists()?,
        "container_runner not found at {} (set {} to override)",
        path.display(),
        RUNNER_ENV
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_config::PackageScope;

    #[test]
    fn bind_mount_parses_host_then_interior() -> Result<()> {
        let mount = BindMount::from_str("/host/dir=/src")?;
        assert_eq!(mount.source, PathBuf::from("/host/dir"));
        assert_eq!(mount.mount_path, PathBuf::from("/src"));
        assert!(!mount.rw);

        assert!(BindMount::from_str("/host/dir").is_err());
        assert!(BindMount::from_str("/host/dir=relative").is_err());
        Ok(())
    }

    #[test]
    fn common_args_feed_settings() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let sdk_dir = temp_dir.path().join("sdk");
        std::fs::create_dir(&sdk_dir)?;

        let mut settings = ContainerSettings::new();
        settings.apply_common_args(&CommonArgs {
            layer: vec![
                sdk_dir.to_str().unwrap().to_owned(),
                format!("pkg:arm64-generic={}", "/pkgs/attr-2.5.1.tbz2"),
            ],
            login: LoginMode::After,
            keep_host_mount: true,
        })?;

        assert_eq!(settings.layers.len(), 2);
        assert!(matches!(settings.layers[0], LayerSpec::Directory { .. }));
        assert_eq!(
            settings.layers[1],
            LayerSpec::PackageTarball {
                path: PathBuf::from("/pkgs/attr-2.5.1.tbz2"),
                scope: PackageScope::Board("arm64-generic".to_owned()),
            }
        );
        assert_eq!(settings.login_mode, LoginMode::After);
        assert!(settings.keep_host_mount);
        Ok(())
    }

    #[test]
    fn prepare_stages_store_and_script() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mut settings = ContainerSettings::new();
        settings.set_mutable_base_dir(temp_dir.path());

        let container = settings.prepare()?;
        assert!(container.upper_dir().is_dir());

        let script = container.session_dir.path().join("setup.sh");
        let metadata = std::fs::metadata(&script)?;
        assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
        assert!(std::fs::read_to_string(&script)?.contains("INSTALL_ATOMS_TARGET"));
        Ok(())
    }

    #[test]
    fn login_mode_round_trips_through_strings() {
        for (mode, s) in [
            (LoginMode::Never, "never"),
            (LoginMode::Before, "before"),
            (LoginMode::After, "after"),
            (LoginMode::AfterFail, "after-fail"),
        ] {
            assert_eq!(mode.to_string(), s);
            assert_eq!(s.parse::<LoginMode>().unwrap(), mode);
        }
    }
}
