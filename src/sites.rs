//! Site registry
//!
//! A site is one proxy configuration file under the profile's config root.
//! Whether it is enabled is never stored anywhere: it is read back from the
//! filesystem on every call.
//!
//! | family  | file                     | enabled when                         |
//! |---------|--------------------------|--------------------------------------|
//! | Debian  | `{root}/{site}.conf`     | `{enabled_dir}/{site}.conf` exists   |
//! | Red Hat | `{root}/{site}`          | file exists without `.disabled`      |
//!
//! The file suffix comes from the profile. Stock httpd only loads
//! `conf.d/*.conf`, so a Red Hat site with the default empty suffix is only
//! served when the server config includes it explicitly. Set
//! `frontend.site_suffix = ".conf"` to have `conf.d` pick sites up as is.

use crate::distro::{DistroFamily, DistroProfile};
use crate::error::{Error, Result};
use crate::gateway::BackendRef;
use crate::host::Host;
use crate::modules::{ModuleActivator, RestartPolicy};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix marking an inactive site on the rename-convention family
pub const DISABLED_SUFFIX: &str = ".disabled";

/// Module every site may rely on (`<IfVersion>` blocks)
pub const REQUIRED_MODULE: &str = "version";

/// A named proxy configuration unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Site {
    pub name: String,
    pub config_file_path: PathBuf,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendRef>,
}

/// Maps site names to files and toggles them
pub struct SiteRegistry<'a> {
    profile: &'a DistroProfile,
    host: &'a dyn Host,
    modules: &'a ModuleActivator<'a>,
}

impl<'a> SiteRegistry<'a> {
    pub fn new(
        profile: &'a DistroProfile,
        host: &'a dyn Host,
        modules: &'a ModuleActivator<'a>,
    ) -> Self {
        Self {
            profile,
            host,
            modules,
        }
    }

    fn file_name(&self, site: &str) -> String {
        format!("{}{}", site, self.profile.site_suffix)
    }

    fn active_path(&self, site: &str) -> PathBuf {
        self.profile.config_root_dir.join(self.file_name(site))
    }

    fn disabled_path(&self, site: &str) -> PathBuf {
        self.profile
            .config_root_dir
            .join(format!("{}{}", self.file_name(site), DISABLED_SUFFIX))
    }

    fn missing(&self, site: &str) -> Error {
        Error::SiteConfigMissing {
            site: site.to_string(),
            dir: self.profile.config_root_dir.clone(),
        }
    }

    /// Where the configuration of `site` lives right now.
    ///
    /// On the rename-convention family an existing `.disabled` file is
    /// returned when there is no active one, so writers keep appending to the
    /// file that will be enabled later.
    pub fn config_path_for(&self, site: &str) -> PathBuf {
        let active = self.active_path(site);
        if self.profile.family == DistroFamily::RedHat && !active.exists() {
            let disabled = self.disabled_path(site);
            if disabled.exists() {
                return disabled;
            }
        }
        active
    }

    pub fn is_enabled(&self, site: &str) -> bool {
        match self.profile.family {
            DistroFamily::Debian => self
                .profile
                .enabled_config_dir
                .join(self.file_name(site))
                .exists(),
            DistroFamily::RedHat => self.active_path(site).is_file(),
        }
    }

    /// Current view of a site, read from disk
    pub fn site(&self, site: &str) -> Site {
        Site {
            name: site.to_string(),
            config_file_path: self.config_path_for(site),
            enabled: self.is_enabled(site),
            backend: None,
        }
    }

    /// Enable a site. A no-op when it already is.
    pub fn enable(&self, site: &str) -> Result<()> {
        self.modules
            .activate(REQUIRED_MODULE, RestartPolicy::Deferred)?;

        if self.is_enabled(site) {
            debug!(site, "Site already enabled");
            return Ok(());
        }

        match self.profile.family {
            DistroFamily::RedHat => {
                let disabled = self.disabled_path(site);
                if !disabled.exists() {
                    return Err(self.missing(site));
                }
                let active = self.active_path(site);
                std::fs::rename(&disabled, &active).map_err(|e| Error::io(&disabled, e))?;
            }
            DistroFamily::Debian => {
                if !self.active_path(site).exists() {
                    return Err(self.missing(site));
                }
                self.host.enable_site(site)?;
            }
        }

        info!(site, "Site enabled");
        Ok(())
    }

    /// Disable a site. Succeeds for sites that are already disabled or that
    /// never existed.
    pub fn disable(&self, site: &str) -> Result<()> {
        if !self.is_enabled(site) {
            if !self.config_path_for(site).exists() {
                let err = self.missing(site);
                warn!(site, error = %err, "Nothing to disable");
            } else {
                debug!(site, "Site already disabled");
            }
            return Ok(());
        }

        match self.profile.family {
            DistroFamily::RedHat => {
                let active = self.active_path(site);
                let disabled = self.disabled_path(site);
                std::fs::rename(&active, &disabled).map_err(|e| Error::io(&active, e))?;
            }
            DistroFamily::Debian => self.host.disable_site(site)?,
        }

        info!(site, "Site disabled");
        Ok(())
    }

    /// Disable a site and delete its configuration
    pub fn remove(&self, site: &str) -> Result<()> {
        self.disable(site)?;
        for path in [self.active_path(site), self.disabled_path(site)] {
            remove_if_exists(&path)?;
        }
        info!(site, "Site removed");
        Ok(())
    }

    /// All sites under the config root, by name
    pub fn list(&self) -> Result<Vec<Site>> {
        let root = &self.profile.config_root_dir;
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(root, e)),
        };

        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(root, e))?;
            if !entry.path().is_file() {
                continue;
            }
            let file = entry.file_name().to_string_lossy().into_owned();
            let file = file.strip_suffix(DISABLED_SUFFIX).unwrap_or(&file);
            if let Some(name) = file.strip_suffix(self.profile.site_suffix.as_str()) {
                if !name.is_empty() {
                    names.insert(name.to_string());
                }
            }
        }

        Ok(names.iter().map(|name| self.site(name)).collect())
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;
    use crate::lifecycle::LifecycleController;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Every file under `dir` with its contents; symlinks as `-> target`
    fn snapshot(dir: &Path) -> BTreeMap<PathBuf, String> {
        let mut out = BTreeMap::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in std::fs::read_dir(&d).unwrap() {
                let path = entry.unwrap().path();
                let meta = path.symlink_metadata().unwrap();
                if meta.file_type().is_symlink() {
                    let target = std::fs::read_link(&path).unwrap();
                    out.insert(path, format!("-> {}", target.display()));
                } else if meta.is_dir() {
                    stack.push(path);
                } else {
                    out.insert(path.clone(), std::fs::read_to_string(&path).unwrap());
                }
            }
        }
        out
    }

    #[test]
    fn test_redhat_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path());
        let host = RecordingHost::new();
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);

        assert_eq!(registry.config_path_for("glance-api"), tmp.path().join("glance-api"));

        std::fs::write(tmp.path().join("glance-api.disabled"), "x\n").unwrap();
        assert_eq!(
            registry.config_path_for("glance-api"),
            tmp.path().join("glance-api.disabled")
        );
        assert!(!registry.is_enabled("glance-api"));
    }

    #[test]
    fn test_redhat_enable_disable_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path());
        let host = RecordingHost::new();
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);

        std::fs::write(tmp.path().join("nova-api.disabled"), "ProxyPass \"/compute\"\n").unwrap();
        let before = snapshot(tmp.path());

        registry.enable("nova-api").unwrap();
        assert!(registry.is_enabled("nova-api"));
        let once = snapshot(tmp.path());

        registry.enable("nova-api").unwrap();
        assert_eq!(snapshot(tmp.path()), once);

        registry.disable("nova-api").unwrap();
        assert!(!registry.is_enabled("nova-api"));
        assert_eq!(snapshot(tmp.path()), before);

        registry.disable("nova-api").unwrap();
        registry.enable("nova-api").unwrap();
        assert_eq!(snapshot(tmp.path()), once);
    }

    #[test]
    fn test_debian_enable_disable_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let available = tmp.path().join("sites-available");
        let enabled = tmp.path().join("sites-enabled");
        std::fs::create_dir_all(&available).unwrap();
        std::fs::create_dir_all(&enabled).unwrap();
        let profile = DistroProfile::debian()
            .with_config_root(&available)
            .with_enabled_dir(&enabled);
        let host = RecordingHost::for_profile(&profile);
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);

        std::fs::write(available.join("keystone.conf"), "ProxyPass \"/identity\"\n").unwrap();
        assert_eq!(registry.config_path_for("keystone"), available.join("keystone.conf"));
        let before = snapshot(tmp.path());

        registry.enable("keystone").unwrap();
        registry.enable("keystone").unwrap();
        assert!(registry.is_enabled("keystone"));
        assert_eq!(host.count("enable-site"), 1);
        let once = snapshot(tmp.path());

        registry.disable("keystone").unwrap();
        assert_eq!(snapshot(tmp.path()), before);

        registry.enable("keystone").unwrap();
        assert_eq!(snapshot(tmp.path()), once);
    }

    #[test]
    fn test_disable_unknown_site_is_success() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path());
        let host = RecordingHost::new();
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);

        registry.disable("never-existed").unwrap();
        assert!(snapshot(tmp.path()).is_empty());
    }

    #[test]
    fn test_enable_unknown_site_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path());
        let host = RecordingHost::new();
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);

        let err = registry.enable("ghost").unwrap_err();
        assert!(matches!(err, Error::SiteConfigMissing { ref site, .. } if site == "ghost"));
    }

    #[test]
    fn test_remove_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path());
        let host = RecordingHost::new();
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);

        std::fs::write(tmp.path().join("cinder-api"), "a\n").unwrap();
        std::fs::write(tmp.path().join("placement-api.disabled"), "b\n").unwrap();

        let sites = registry.list().unwrap();
        let summary: Vec<(&str, bool)> =
            sites.iter().map(|s| (s.name.as_str(), s.enabled)).collect();
        assert_eq!(summary, vec![("cinder-api", true), ("placement-api", false)]);

        registry.remove("cinder-api").unwrap();
        registry.remove("placement-api").unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_redhat_conf_suffix_matches_httpd_include() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat()
            .with_config_root(tmp.path())
            .with_site_suffix(".conf");
        let host = RecordingHost::new();
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);

        assert_eq!(registry.config_path_for("heat-api"), tmp.path().join("heat-api.conf"));

        std::fs::write(tmp.path().join("heat-api.conf"), "a\n").unwrap();
        std::fs::write(tmp.path().join("README"), "not a site\n").unwrap();
        registry.disable("heat-api").unwrap();
        assert!(tmp.path().join("heat-api.conf.disabled").exists());

        let sites = registry.list().unwrap();
        let summary: Vec<(&str, bool)> =
            sites.iter().map(|s| (s.name.as_str(), s.enabled)).collect();
        assert_eq!(summary, vec![("heat-api", false)]);

        registry.enable("heat-api").unwrap();
        assert!(registry.is_enabled("heat-api"));
    }

    #[test]
    fn test_list_missing_root_is_empty() {
        let profile = DistroProfile::debian().with_config_root("/nonexistent/sitegate/avail");
        let host = RecordingHost::new();
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);
        assert!(registry.list().unwrap().is_empty());
    }
}
