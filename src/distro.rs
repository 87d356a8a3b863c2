//! Distro profile resolution
//!
//! Debian-family hosts ship `apache2` with `sites-available`/`sites-enabled`
//! and the `a2*` helper commands. Red Hat-family hosts ship `httpd`, which
//! includes everything in `conf.d` and has its proxy modules always loaded.
//! The profile is resolved once and passed by reference everywhere else.

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Default location of the os-release file
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Identity of the host, as read from os-release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFacts {
    /// `ID` (e.g. "ubuntu", "fedora")
    pub id: String,
    /// `ID_LIKE`, space separated
    pub id_like: String,
}

impl HostFacts {
    /// Facts for a host known only by its distro id
    pub fn from_id(id: &str) -> Self {
        Self {
            id: id.to_lowercase(),
            ..Default::default()
        }
    }

    /// Parse the contents of an os-release file
    pub fn parse_os_release(content: &str) -> Self {
        let mut facts = HostFacts::default();
        for line in content.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key {
                "ID" => facts.id = value.to_lowercase(),
                "ID_LIKE" => facts.id_like = value.to_lowercase(),
                _ => {}
            }
        }
        facts
    }

    /// Read facts from an os-release file
    pub fn read_os_release<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::parse_os_release(&content))
    }

    fn ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.id_like.split_whitespace())
    }
}

/// The two supported server product families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistroFamily {
    /// Debian, Ubuntu and derivatives (`apache2`)
    Debian,
    /// Fedora, RHEL, CentOS and derivatives (`httpd`)
    RedHat,
}

/// How front-end modules and sites are switched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleMechanism {
    /// `a2enmod`/`a2query` for modules, `a2ensite`/`a2dissite` for sites
    Command,
    /// Modules are always loaded; sites are toggled by renaming
    AlwaysLoaded,
}

/// Layout and command conventions of the host's front-end server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistroProfile {
    pub family: DistroFamily,
    /// Service name of the front-end process
    pub process_name: String,
    /// Directory holding site configuration files
    pub config_root_dir: PathBuf,
    /// Directory the server actually includes
    pub enabled_config_dir: PathBuf,
    /// Appended to the site name to form its file name
    pub site_suffix: String,
    pub module_mechanism: ModuleMechanism,
    /// Packages providing the server and its uwsgi proxy module
    pub packages: Vec<String>,
}

impl DistroProfile {
    /// Profile for the Debian family
    pub fn debian() -> Self {
        Self {
            family: DistroFamily::Debian,
            process_name: "apache2".to_string(),
            config_root_dir: PathBuf::from("/etc/apache2/sites-available"),
            enabled_config_dir: PathBuf::from("/etc/apache2/sites-enabled"),
            site_suffix: ".conf".to_string(),
            module_mechanism: ModuleMechanism::Command,
            packages: vec![
                "apache2".to_string(),
                "libapache2-mod-proxy-uwsgi".to_string(),
            ],
        }
    }

    /// Profile for the Red Hat family
    pub fn redhat() -> Self {
        Self {
            family: DistroFamily::RedHat,
            process_name: "httpd".to_string(),
            config_root_dir: PathBuf::from("/etc/httpd/conf.d"),
            enabled_config_dir: PathBuf::from("/etc/httpd/conf.d"),
            site_suffix: String::new(),
            module_mechanism: ModuleMechanism::AlwaysLoaded,
            packages: vec!["httpd".to_string(), "mod_proxy_uwsgi".to_string()],
        }
    }

    /// Relocate the site directories (staging trees, tests).
    ///
    /// On the Red Hat family the enabled directory is the config root, so
    /// moving one moves the other.
    pub fn with_config_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if self.family == DistroFamily::RedHat {
            self.enabled_config_dir = root.clone();
        }
        self.config_root_dir = root;
        self
    }

    /// Relocate the enabled-sites directory
    pub fn with_enabled_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.enabled_config_dir = dir.into();
        self
    }

    /// Name site files `{site}{suffix}`. Stock httpd only includes
    /// `conf.d/*.conf`, so Red Hat hosts without an extra include need ".conf".
    pub fn with_site_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.site_suffix = suffix.into();
        self
    }
}

/// Resolve the profile for a host.
///
/// Pure; anything that is not clearly one of the two families is rejected
/// rather than guessed.
pub fn resolve(facts: &HostFacts) -> Result<DistroProfile> {
    for id in facts.ids() {
        match id {
            "debian" | "ubuntu" => return Ok(DistroProfile::debian()),
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => {
                return Ok(DistroProfile::redhat())
            }
            _ => {}
        }
    }
    Err(Error::UnsupportedDistro {
        id: facts.id.clone(),
        id_like: facts.id_like.clone(),
    })
}
