use crate::distro::{self, DistroProfile, HostFacts};
use crate::error::Result;
use crate::publish::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Host identity and command execution
    #[serde(default)]
    pub host: HostSettings,

    /// Front-end server settings
    #[serde(default)]
    pub frontend: FrontendSettings,

    /// uwsgi gateway settings shared by all services
    #[serde(default)]
    pub gateway: UwsgiSettings,

    /// Readiness polling bounds
    #[serde(default)]
    pub readiness: ReadinessSettings,

    /// Services to publish, keyed by site name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostSettings {
    /// Distro id to use instead of reading os-release (e.g. "ubuntu")
    pub distro: Option<String>,

    /// os-release file to read the distro from
    #[serde(default = "default_os_release")]
    pub os_release: String,

    /// Prefix for every host command, e.g. "sudo -n"
    pub command_prefix: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            distro: None,
            os_release: default_os_release(),
            command_prefix: None,
        }
    }
}

impl HostSettings {
    /// The command prefix split into words
    pub fn command_prefix(&self) -> anyhow::Result<Vec<String>> {
        match self.command_prefix.as_deref() {
            Some(prefix) => shell_words::split(prefix)
                .map_err(|e| anyhow::anyhow!("invalid command_prefix '{}': {}", prefix, e)),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontendSettings {
    /// Override for the site configuration directory
    pub config_root_dir: Option<String>,

    /// Override for the enabled-sites directory (Debian family)
    pub enabled_config_dir: Option<String>,

    /// Override for the site file suffix (".conf" for stock httpd includes)
    pub site_suffix: Option<String>,

    /// Pause between stop and start on restart, in milliseconds
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,

    /// Address uwsgi HTTP backends bind to and apache proxies to
    #[serde(default = "default_local_host")]
    pub local_host: String,
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            config_root_dir: None,
            enabled_config_dir: None,
            site_suffix: None,
            restart_settle_ms: default_restart_settle_ms(),
            local_host: default_local_host(),
        }
    }
}

impl FrontendSettings {
    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UwsgiSettings {
    /// Default worker process count (API_WORKERS)
    #[serde(default = "default_api_workers")]
    pub api_workers: u32,

    /// Seconds a worker gets to finish after a graceful shutdown (WORKER_TIMEOUT)
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: u64,

    /// Directory for unix sockets. Not under /tmp: apache may have a private
    /// view of it.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,

    /// Where the socket directory is declared for systemd-tmpfiles
    #[serde(default = "default_tmpfiles_dir")]
    pub tmpfiles_dir: String,

    /// Default directory for generated uwsgi ini files
    #[serde(default = "default_conf_dir")]
    pub conf_dir: String,

    /// Account owning the socket directory (STACK_USER)
    #[serde(default = "default_service_user")]
    pub service_user: String,
}

impl Default for UwsgiSettings {
    fn default() -> Self {
        Self {
            api_workers: default_api_workers(),
            worker_timeout: default_worker_timeout(),
            socket_dir: default_socket_dir(),
            tmpfiles_dir: default_tmpfiles_dir(),
            conf_dir: default_conf_dir(),
            service_user: default_service_user(),
        }
    }
}

impl UwsgiSettings {
    /// Conventional gateway config path for a service
    pub fn conf_path_for(&self, name: &str) -> PathBuf {
        Path::new(&self.conf_dir).join(format!("{}-uwsgi.ini", name))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessSettings {
    /// Probes before giving up
    #[serde(default = "default_readiness_attempts")]
    pub attempts: u32,

    /// Pause between probes in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub interval_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempts: default_readiness_attempts(),
            interval_ms: default_readiness_interval(),
        }
    }
}

impl ReadinessSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// How apache reaches a service's gateway
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// unix socket through mod_proxy_uwsgi (default)
    #[default]
    Socket,
    /// local TCP port through mod_proxy_http; keeps chunked request bodies
    Http,
}

/// A service to publish
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Public URL prefix (e.g. "/image")
    pub url: String,

    /// `package.module:callable`, or a WSGI file path (deprecated)
    pub worker: String,

    /// Worker process count (overrides gateway.api_workers)
    pub processes: Option<u32>,

    /// Backend wiring: "socket" (default) or "http"
    #[serde(default)]
    pub mode: BackendMode,

    /// Path of the uwsgi ini file (default: {conf_dir}/{name}-uwsgi.ini)
    pub conf: Option<String>,
}

impl ServiceConfig {
    /// Validate the service entry
    pub fn validate(&self, name: &str) -> std::result::Result<(), String> {
        if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(format!("Service '{}': invalid site name", name));
        }
        if !self.url.starts_with('/') {
            return Err(format!(
                "Service '{}': 'url' must start with '/' (got '{}')",
                name, self.url
            ));
        }
        if self.worker.trim().is_empty() {
            return Err(format!("Service '{}': 'worker' must not be empty", name));
        }
        if self.processes == Some(0) {
            return Err(format!(
                "Service '{}': 'processes' must be greater than 0",
                name
            ));
        }
        Ok(())
    }

    /// Build a publish request, filling in defaults from the gateway settings
    pub fn to_spec(&self, name: &str, gateway: &UwsgiSettings) -> ServiceSpec {
        let conf = self
            .conf
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| gateway.conf_path_for(name));
        ServiceSpec {
            name: name.to_string(),
            url: self.url.clone(),
            worker: self.worker.clone(),
            processes: self.processes.unwrap_or(gateway.api_workers),
            mode: self.mode,
            conf,
        }
    }
}

// Default value functions
fn default_os_release() -> String {
    distro::OS_RELEASE_PATH.to_string()
}

fn default_restart_settle_ms() -> u64 {
    3000
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_workers() -> u32 {
    2
}

fn default_worker_timeout() -> u64 {
    90
}

fn default_socket_dir() -> String {
    "/var/run/uwsgi".to_string()
}

fn default_tmpfiles_dir() -> String {
    "/etc/tmpfiles.d".to_string()
}

fn default_conf_dir() -> String {
    "/etc/sitegate/uwsgi".to_string()
}

fn default_service_user() -> String {
    "stack".to_string()
}

fn default_readiness_attempts() -> u32 {
    60
}

fn default_readiness_interval() -> u64 {
    2000 // 60 x 2s
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with the environment overrides applied, for runs
    /// without a configuration file
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the environment-style overrides set by the surrounding
    /// deployment scripts.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup("API_WORKERS") {
            self.gateway.api_workers = workers
                .parse()
                .map_err(|e| anyhow::anyhow!("API_WORKERS='{}': {}", workers, e))?;
        }
        if let Some(timeout) = lookup("WORKER_TIMEOUT") {
            self.gateway.worker_timeout = timeout
                .parse()
                .map_err(|e| anyhow::anyhow!("WORKER_TIMEOUT='{}': {}", timeout, e))?;
        }
        if let Some(host) = lookup("SERVICE_LOCAL_HOST") {
            self.frontend.local_host = host;
        }
        if let Some(user) = lookup("STACK_USER") {
            self.gateway.service_user = user;
        }
        if let Some(distro) = lookup("SITEGATE_DISTRO") {
            self.host.distro = Some(distro);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.gateway.api_workers == 0 {
            errors.push("gateway.api_workers must be greater than 0".to_string());
        }
        if self.readiness.attempts == 0 {
            errors.push("readiness.attempts must be greater than 0".to_string());
        }
        if let Err(e) = self.host.command_prefix() {
            errors.push(e.to_string());
        }
        for (name, service) in &self.services {
            if let Err(e) = service.validate(name) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Host facts from the configured distro or the os-release file
    pub fn host_facts(&self) -> Result<HostFacts> {
        match self.host.distro.as_deref() {
            Some(id) => Ok(HostFacts::from_id(id)),
            None => HostFacts::read_os_release(&self.host.os_release),
        }
    }

    /// Resolve the distro profile once, with path overrides applied
    pub fn resolve_profile(&self) -> Result<DistroProfile> {
        let mut profile = distro::resolve(&self.host_facts()?)?;
        if let Some(root) = &self.frontend.config_root_dir {
            profile = profile.with_config_root(root);
        }
        if let Some(enabled) = &self.frontend.enabled_config_dir {
            profile = profile.with_enabled_dir(enabled);
        }
        if let Some(suffix) = &self.frontend.site_suffix {
            profile = profile.with_site_suffix(suffix.as_str());
        }
        Ok(profile)
    }

    /// Publish requests for every configured service, in name order
    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        self.services
            .iter()
            .map(|(name, service)| service.to_spec(name, &self.gateway))
            .collect()
    }
}
