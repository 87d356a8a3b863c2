//! Publishing services behind the front-end server
//!
//! "Publish service S at URL U backed by worker W" runs the whole chain in
//! one lifecycle batch: modules, gateway config, proxy rule, site enable,
//! then a single restart. Modules come first so a host that cannot load them
//! is left without a half-written gateway config.

use crate::config::BackendMode;
use crate::distro::DistroProfile;
use crate::error::{Error, Result};
use crate::gateway::BackendConfigWriter;
use crate::host::Host;
use crate::lifecycle::LifecycleController;
use crate::modules::ModuleActivator;
use crate::proxy::ProxyRuleWriter;
use crate::sites::{Site, SiteRegistry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// One publish request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    /// Site name, also used for the socket file and the uwsgi route label
    pub name: String,
    /// URL prefix on the front-end (`/image`)
    pub url: String,
    /// Module path (`glance.wsgi.api:application`) or legacy WSGI file
    pub worker: String,
    pub processes: u32,
    pub mode: BackendMode,
    /// Where the gateway config is written
    pub conf: PathBuf,
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(invalid("name", format!("invalid site name '{}'", self.name)));
        }
        if !self.url.starts_with('/') {
            return Err(invalid("url", format!("'{}' must start with '/'", self.url)));
        }
        if self.worker.trim().is_empty() {
            return Err(invalid("worker", "must not be empty".to_string()));
        }
        if self.processes == 0 {
            return Err(invalid("processes", "must be greater than 0".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: String) -> Error {
    Error::Config {
        field: field.to_string(),
        message,
    }
}

/// Runs publish requests against already constructed components
pub struct Publisher<'a> {
    lifecycle: &'a LifecycleController<'a>,
    registry: &'a SiteRegistry<'a>,
    backends: &'a BackendConfigWriter<'a>,
    proxies: ProxyRuleWriter<'a>,
    local_host: String,
}

impl<'a> Publisher<'a> {
    pub fn new(
        lifecycle: &'a LifecycleController<'a>,
        modules: &'a ModuleActivator<'a>,
        registry: &'a SiteRegistry<'a>,
        backends: &'a BackendConfigWriter<'a>,
        local_host: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            backends,
            proxies: ProxyRuleWriter::new(registry, modules, lifecycle),
            local_host: local_host.into(),
        }
    }

    /// Publish one service. The front-end is restarted once, and only if
    /// every step succeeded.
    pub fn publish(&self, spec: &ServiceSpec) -> Result<Site> {
        spec.validate()?;
        self.lifecycle.batch(|| self.publish_unbatched(spec))
    }

    /// Publish several services with a single restart at the end
    pub fn publish_all(&self, specs: &[ServiceSpec]) -> Result<Vec<Site>> {
        for spec in specs {
            spec.validate()?;
        }
        self.lifecycle.batch(|| {
            specs
                .iter()
                .map(|spec| self.publish_unbatched(spec))
                .collect()
        })
    }

    fn publish_unbatched(&self, spec: &ServiceSpec) -> Result<Site> {
        let written = match spec.mode {
            BackendMode::Socket => {
                self.proxies.activate_socket_modules()?;
                let socket = self.backends.socket_path_for(&spec.name);
                let written = self.backends.write_socket_backend(
                    &spec.conf,
                    &spec.worker,
                    spec.processes,
                    &socket,
                )?;
                self.proxies
                    .write_socket_proxy(&spec.url, &socket, &spec.name)?;
                written
            }
            BackendMode::Http => {
                self.proxies.activate_http_modules()?;
                let written = self.backends.write_http_backend(
                    &spec.conf,
                    &spec.worker,
                    spec.processes,
                    &self.local_host,
                )?;
                let port = written.backend.port().ok_or_else(|| Error::PortAllocation {
                    host: self.local_host.clone(),
                    reason: "HTTP backend written without a port".to_string(),
                })?;
                self.proxies
                    .write_http_proxy(&spec.url, &self.local_host, port, &spec.name)?;
                written
            }
        };

        let mut site = self.registry.site(&spec.name);
        site.backend = Some(written.backend);
        info!(
            site = %site.name,
            url = %spec.url,
            backend = %site.backend.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Service published"
        );
        Ok(site)
    }

    /// Take a service off the front-end: gateway config removed, site
    /// disabled and deleted, one restart.
    pub fn unpublish(&self, name: &str, conf: &Path) -> Result<()> {
        self.lifecycle.batch(|| {
            self.backends.remove_backend(conf)?;
            self.registry.remove(name)?;
            self.lifecycle.restart()
        })?;
        info!(site = name, "Service unpublished");
        Ok(())
    }
}

/// Install the profile's packages that are not installed yet.
///
/// Returns the packages that were installed.
pub fn install_packages(profile: &DistroProfile, host: &dyn Host) -> Result<Vec<String>> {
    let mut installed = Vec::new();
    for package in &profile.packages {
        if host.is_installed(package)? {
            info!(package = %package, "Package already installed");
            continue;
        }
        host.install(package)?;
        installed.push(package.clone());
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UwsgiSettings;
    use crate::gateway::{BackendRef, GatewayConfig};
    use crate::host::{RecordingHost, ServiceControl};
    use std::time::Duration;

    fn settings(root: &Path) -> UwsgiSettings {
        UwsgiSettings {
            socket_dir: root.join("run/uwsgi").display().to_string(),
            tmpfiles_dir: root.join("tmpfiles.d").display().to_string(),
            conf_dir: root.join("uwsgi").display().to_string(),
            ..Default::default()
        }
    }

    fn spec(root: &Path, name: &str, url: &str, mode: BackendMode) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            url: url.to_string(),
            worker: format!("{}.wsgi:application", name.replace('-', "_")),
            processes: 2,
            mode,
            conf: root.join("uwsgi").join(format!("{}-uwsgi.ini", name)),
        }
    }

    #[test]
    fn test_spec_validation() {
        let root = Path::new("/tmp");
        let mut s = spec(root, "cinder-api", "/volume", BackendMode::Socket);
        assert!(s.validate().is_ok());

        s.url = "volume".to_string();
        assert!(matches!(s.validate(), Err(Error::Config { ref field, .. }) if field == "url"));

        s.url = "/volume".to_string();
        s.processes = 0;
        assert!(matches!(s.validate(), Err(Error::Config { ref field, .. }) if field == "processes"));
    }

    #[test]
    fn test_publish_socket_restarts_once() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path().join("conf.d"));
        let gateway = settings(tmp.path());
        let host = RecordingHost::for_profile(&profile);
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);
        let backends = BackendConfigWriter::new(&host, &gateway);
        let publisher = Publisher::new(&lifecycle, &modules, &registry, &backends, "127.0.0.1");

        let s = spec(tmp.path(), "placement-api", "/placement", BackendMode::Socket);
        let site = publisher.publish(&s).unwrap();

        assert!(site.enabled);
        assert_eq!(site.config_file_path, tmp.path().join("conf.d/placement-api"));
        assert!(matches!(site.backend, Some(BackendRef::Socket { .. })));
        assert_eq!(lifecycle.restart_count(), 1);
        assert_eq!(host.count("stop httpd"), 1);

        let config = GatewayConfig::load(&s.conf).unwrap();
        assert_eq!(config.backend(), site.backend);
    }

    #[test]
    fn test_publish_all_single_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path().join("conf.d"));
        let gateway = settings(tmp.path());
        let host = RecordingHost::for_profile(&profile);
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);
        let backends = BackendConfigWriter::new(&host, &gateway);
        let publisher = Publisher::new(&lifecycle, &modules, &registry, &backends, "127.0.0.1");

        let specs = vec![
            spec(tmp.path(), "keystone", "/identity", BackendMode::Socket),
            spec(tmp.path(), "swift-proxy", "/object-store", BackendMode::Http),
        ];
        let sites = publisher.publish_all(&specs).unwrap();

        assert_eq!(sites.len(), 2);
        assert_eq!(lifecycle.restart_count(), 1);
    }

    #[test]
    fn test_failed_publish_does_not_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::debian()
            .with_config_root(tmp.path().join("sites-available"))
            .with_enabled_dir(tmp.path().join("sites-enabled"));
        let gateway = settings(tmp.path());
        let host = RecordingHost::for_profile(&profile).with_failing_module("proxy_http");
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);
        let backends = BackendConfigWriter::new(&host, &gateway);
        let publisher = Publisher::new(&lifecycle, &modules, &registry, &backends, "127.0.0.1");

        let s = spec(tmp.path(), "swift-proxy", "/object-store", BackendMode::Http);
        let err = publisher.publish(&s).unwrap_err();

        assert!(matches!(err, Error::ModuleActivation { .. }));
        assert_eq!(lifecycle.restart_count(), 0);
        assert!(!registry.config_path_for("swift-proxy").exists());
        assert!(!s.conf.exists());
        assert_eq!(host.count("tmpfiles"), 0);
    }

    #[test]
    fn test_socket_module_failure_leaves_no_gateway_config() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::debian()
            .with_config_root(tmp.path().join("sites-available"))
            .with_enabled_dir(tmp.path().join("sites-enabled"));
        let gateway = settings(tmp.path());
        let host = RecordingHost::for_profile(&profile).with_failing_module("proxy_uwsgi");
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);
        let backends = BackendConfigWriter::new(&host, &gateway);
        let publisher = Publisher::new(&lifecycle, &modules, &registry, &backends, "127.0.0.1");

        let s = spec(tmp.path(), "glance-api", "/image", BackendMode::Socket);
        let err = publisher.publish(&s).unwrap_err();

        assert!(matches!(err, Error::ModuleActivation { .. }));
        assert!(!s.conf.exists());
        assert!(!tmp.path().join("tmpfiles.d/uwsgi.conf").exists());
        assert_eq!(host.count("tmpfiles"), 0);
        assert_eq!(lifecycle.restart_count(), 0);
    }

    #[test]
    fn test_http_republish_points_at_current_port() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::redhat().with_config_root(tmp.path().join("conf.d"));
        let gateway = settings(tmp.path());
        let host = RecordingHost::for_profile(&profile);
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);
        let backends = BackendConfigWriter::new(&host, &gateway);
        let publisher = Publisher::new(&lifecycle, &modules, &registry, &backends, "127.0.0.1");

        let s = spec(tmp.path(), "glance-api", "/image", BackendMode::Http);
        let first = publisher.publish(&s).unwrap();
        let second = publisher.publish(&s).unwrap();
        assert_ne!(first.backend, second.backend);

        let port = second.backend.as_ref().and_then(BackendRef::port).unwrap();
        let content = std::fs::read_to_string(&second.config_file_path).unwrap();
        let rules: Vec<&str> = content
            .lines()
            .filter(|l| l.starts_with("ProxyPass "))
            .collect();
        assert_eq!(
            rules,
            vec![format!(
                "ProxyPass \"/image\" \"http://127.0.0.1:{}\" retry=0 acquire=1",
                port
            )]
        );
    }

    #[test]
    fn test_unpublish_removes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = DistroProfile::debian()
            .with_config_root(tmp.path().join("sites-available"))
            .with_enabled_dir(tmp.path().join("sites-enabled"));
        let gateway = settings(tmp.path());
        let host = RecordingHost::for_profile(&profile);
        let lifecycle = LifecycleController::with_settle_delay(&profile, &host, Duration::ZERO);
        let modules = ModuleActivator::new(&profile, &host, &lifecycle);
        let registry = SiteRegistry::new(&profile, &host, &modules);
        let backends = BackendConfigWriter::new(&host, &gateway);
        let publisher = Publisher::new(&lifecycle, &modules, &registry, &backends, "127.0.0.1");

        let s = spec(tmp.path(), "nova-api", "/compute", BackendMode::Socket);
        publisher.publish(&s).unwrap();
        assert!(registry.is_enabled("nova-api"));

        publisher.unpublish("nova-api", &s.conf).unwrap();

        assert!(!registry.is_enabled("nova-api"));
        assert!(!registry.config_path_for("nova-api").exists());
        assert!(!s.conf.exists());
        assert_eq!(lifecycle.restart_count(), 2);
    }

    #[test]
    fn test_install_packages_skips_installed() {
        let profile = DistroProfile::debian();
        let host = RecordingHost::new();
        host.install("apache2").unwrap();
        host.clear();

        let installed = install_packages(&profile, &host).unwrap();
        assert_eq!(installed, vec!["libapache2-mod-proxy-uwsgi"]);
        assert_eq!(host.commands(), vec!["install libapache2-mod-proxy-uwsgi"]);
    }
}
