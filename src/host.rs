//! Host collaborators
//!
//! The library never shells out directly. Everything that touches the
//! service manager, the package manager or the `a2*` helpers goes through
//! [`ServiceControl`] and [`ModuleControl`]. [`SystemHost`] runs the real
//! commands; [`RecordingHost`] keeps an in-memory model of the host and logs
//! what would have run.

use crate::distro::{DistroFamily, DistroProfile};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

/// Service manager and package manager operations
pub trait ServiceControl {
    fn install(&self, package: &str) -> Result<()>;
    fn is_installed(&self, package: &str) -> Result<bool>;
    fn start(&self, service: &str) -> Result<()>;
    fn stop(&self, service: &str) -> Result<()>;
    fn restart(&self, service: &str) -> Result<()>;
    /// Create the paths declared in a tmpfiles.d snippet
    fn apply_tmpfiles(&self, conf: &Path) -> Result<()>;
}

/// Front-end module and site helpers (`a2enmod` and friends)
pub trait ModuleControl {
    /// Whether the host has a module-enable command at all
    fn module_mechanism_available(&self) -> bool;
    fn is_module_loaded(&self, name: &str) -> Result<bool>;
    fn enable_module(&self, name: &str) -> Result<()>;
    fn enable_site(&self, site: &str) -> Result<()>;
    fn disable_site(&self, site: &str) -> Result<()>;
}

/// Everything the provisioning components need from the host
pub trait Host: ServiceControl + ModuleControl {}

impl<T: ServiceControl + ModuleControl> Host for T {}

/// Runs the distro tools on the local machine
pub struct SystemHost {
    family: DistroFamily,
    /// Prepended to every command, e.g. `["sudo", "-n"]`
    prefix: Vec<String>,
}

impl SystemHost {
    pub fn new(profile: &DistroProfile, prefix: Vec<String>) -> Self {
        Self {
            family: profile.family,
            prefix,
        }
    }

    fn command(&self, program: &str, args: &[&str]) -> (Command, String) {
        let mut argv: Vec<&str> = self.prefix.iter().map(String::as_str).collect();
        argv.push(program);
        argv.extend_from_slice(args);

        let shown = shell_words::join(&argv);
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());
        (cmd, shown)
    }

    fn output(&self, program: &str, args: &[&str]) -> Result<(Output, String)> {
        let (mut cmd, shown) = self.command(program, args);
        debug!(command = %shown, "Running host command");
        let output = cmd.output().map_err(|e| Error::Command {
            command: shown.clone(),
            status: "spawn failed".to_string(),
            stderr: e.to_string(),
        })?;
        Ok((output, shown))
    }

    /// Run a command and fail on a non-zero exit
    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let (output, shown) = self.output(program, args)?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::Command {
            command: shown,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command whose exit status is the answer
    fn probe(&self, program: &str, args: &[&str]) -> Result<bool> {
        let (output, _) = self.output(program, args)?;
        Ok(output.status.success())
    }
}

impl ServiceControl for SystemHost {
    fn install(&self, package: &str) -> Result<()> {
        match self.family {
            DistroFamily::Debian => self.run("apt-get", &["install", "-y", package]),
            DistroFamily::RedHat => self.run("dnf", &["install", "-y", package]),
        }
    }

    fn is_installed(&self, package: &str) -> Result<bool> {
        match self.family {
            DistroFamily::Debian => self.probe("dpkg", &["-s", package]),
            DistroFamily::RedHat => self.probe("rpm", &["-q", package]),
        }
    }

    fn start(&self, service: &str) -> Result<()> {
        self.run("systemctl", &["start", service])
    }

    fn stop(&self, service: &str) -> Result<()> {
        self.run("systemctl", &["stop", service])
    }

    fn restart(&self, service: &str) -> Result<()> {
        self.run("systemctl", &["restart", service])
    }

    fn apply_tmpfiles(&self, conf: &Path) -> Result<()> {
        let conf = conf.to_string_lossy();
        self.run("systemd-tmpfiles", &["--create", conf.as_ref()])
    }
}

impl ModuleControl for SystemHost {
    fn module_mechanism_available(&self) -> bool {
        if self.family != DistroFamily::Debian {
            return false;
        }
        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| dir.join("a2enmod").is_file())
    }

    fn is_module_loaded(&self, name: &str) -> Result<bool> {
        // a2query exits non-zero for both "disabled" and "unknown"
        self.probe("a2query", &["-q", "-m", name])
    }

    fn enable_module(&self, name: &str) -> Result<()> {
        self.run("a2enmod", &["-q", name])
    }

    fn enable_site(&self, site: &str) -> Result<()> {
        self.run("a2ensite", &["-q", site])
    }

    fn disable_site(&self, site: &str) -> Result<()> {
        self.run("a2dissite", &["-q", site])
    }
}

/// In-memory host that records every command instead of running it.
///
/// Modules and packages are tracked as sets. When site directories are
/// configured, `enable_site`/`disable_site` mirror `a2ensite`/`a2dissite`
/// by managing the symlink in the enabled directory.
#[derive(Default)]
pub struct RecordingHost {
    commands: RefCell<Vec<String>>,
    modules: RefCell<BTreeSet<String>>,
    packages: RefCell<BTreeSet<String>>,
    site_dirs: Option<(PathBuf, PathBuf)>,
    mechanism: bool,
    failing_module: Option<String>,
}

impl RecordingHost {
    /// A host without a module-enable command (Red Hat style)
    pub fn new() -> Self {
        Self::default()
    }

    /// A host with the `a2*` helpers, managing symlinks from `available`
    /// into `enabled`
    pub fn with_site_dirs(available: impl Into<PathBuf>, enabled: impl Into<PathBuf>) -> Self {
        Self {
            site_dirs: Some((available.into(), enabled.into())),
            mechanism: true,
            ..Default::default()
        }
    }

    /// Mirror the conventions of a resolved profile
    pub fn for_profile(profile: &DistroProfile) -> Self {
        match profile.family {
            DistroFamily::Debian => Self::with_site_dirs(
                profile.config_root_dir.clone(),
                profile.enabled_config_dir.clone(),
            ),
            DistroFamily::RedHat => Self::new(),
        }
    }

    /// Mark modules as already loaded
    pub fn with_loaded_modules<I, S>(self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules
            .borrow_mut()
            .extend(modules.into_iter().map(Into::into));
        self
    }

    /// Make `enable_module` fail for one module
    pub fn with_failing_module(mut self, name: &str) -> Self {
        self.failing_module = Some(name.to_string());
        self
    }

    /// Commands issued so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    /// Number of recorded commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Forget the command log, keeping modelled state
    pub fn clear(&self) {
        self.commands.borrow_mut().clear();
    }

    fn record(&self, command: String) {
        debug!(command = %command, "Recorded host command");
        self.commands.borrow_mut().push(command);
    }

    fn site_link(&self, site: &str) -> Option<(PathBuf, PathBuf)> {
        self.site_dirs.as_ref().map(|(available, enabled)| {
            let file = format!("{}.conf", site);
            (available.join(&file), enabled.join(&file))
        })
    }
}

impl ServiceControl for RecordingHost {
    fn install(&self, package: &str) -> Result<()> {
        self.record(format!("install {}", package));
        self.packages.borrow_mut().insert(package.to_string());
        Ok(())
    }

    fn is_installed(&self, package: &str) -> Result<bool> {
        Ok(self.packages.borrow().contains(package))
    }

    fn start(&self, service: &str) -> Result<()> {
        self.record(format!("start {}", service));
        Ok(())
    }

    fn stop(&self, service: &str) -> Result<()> {
        self.record(format!("stop {}", service));
        Ok(())
    }

    fn restart(&self, service: &str) -> Result<()> {
        self.record(format!("restart {}", service));
        Ok(())
    }

    fn apply_tmpfiles(&self, conf: &Path) -> Result<()> {
        self.record(format!("tmpfiles {}", conf.display()));
        Ok(())
    }
}

impl ModuleControl for RecordingHost {
    fn module_mechanism_available(&self) -> bool {
        self.mechanism
    }

    fn is_module_loaded(&self, name: &str) -> Result<bool> {
        Ok(self.modules.borrow().contains(name))
    }

    fn enable_module(&self, name: &str) -> Result<()> {
        self.record(format!("enable-mod {}", name));
        if self.failing_module.as_deref() == Some(name) {
            return Err(Error::Command {
                command: format!("a2enmod -q {}", name),
                status: "exit status: 1".to_string(),
                stderr: format!("ERROR: Module {} does not exist!", name),
            });
        }
        self.modules.borrow_mut().insert(name.to_string());
        Ok(())
    }

    fn enable_site(&self, site: &str) -> Result<()> {
        self.record(format!("enable-site {}", site));
        let Some((source, link)) = self.site_link(site) else {
            return Ok(());
        };
        if !source.exists() {
            return Err(Error::Command {
                command: format!("a2ensite -q {}", site),
                status: "exit status: 1".to_string(),
                stderr: format!("ERROR: Site {} does not exist!", site),
            });
        }
        if link.symlink_metadata().is_ok() {
            return Ok(());
        }
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        symlink(&source, &link)
    }

    fn disable_site(&self, site: &str) -> Result<()> {
        self.record(format!("disable-site {}", site));
        let Some((_, link)) = self.site_link(site) else {
            return Ok(());
        };
        if link.symlink_metadata().is_err() {
            warn!(site, "Site already disabled");
            return Ok(());
        }
        std::fs::remove_file(&link).map_err(|e| Error::io(&link, e))
    }
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, link).map_err(|e| Error::io(link, e))
}

#[cfg(not(unix))]
fn symlink(source: &Path, link: &Path) -> Result<()> {
    std::fs::copy(source, link)
        .map(|_| ())
        .map_err(|e| Error::io(link, e))
}
