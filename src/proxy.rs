//! apache proxy rules
//!
//! Rules are appended to the site's configuration file. A rule already
//! present in the file is not appended a second time, and a `ProxyPass` for
//! the same URL prefix pointing elsewhere is replaced where it stands, so
//! republishing a service leaves one rule with the current target. Other
//! content is never touched.
//!
//! Every write ends with the site enabled and a restart requested: apache has
//! no hot reload for new proxy rules here.

use crate::error::{Error, Result};
use crate::gateway::host_port;
use crate::lifecycle::LifecycleController;
use crate::modules::{ModuleActivator, RestartPolicy};
use crate::sites::SiteRegistry;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fail immediately when the backend is down instead of retrying silently
const RETRY: &str = "retry=0";
/// Wait at most 1s for a pooled connection
const ACQUIRE: &str = "acquire=1";

const SOCKET_MODULES: &[&str] = &["proxy", "proxy_uwsgi"];
const HTTP_MODULES: &[&str] = &["proxy", "proxy_http"];

/// Directives for forwarding chunked request bodies unmodified
const CHUNKED_PASSTHROUGH: &[&str] = &["KeepAlive Off", "SetEnv proxy-sendchunked 1"];

/// `ProxyPass` line for a uwsgi unix socket
pub fn socket_proxy_pass(url: &str, socket: &Path, site: &str) -> String {
    format!(
        "ProxyPass \"{}\" \"unix:{}|uwsgi://uwsgi-uds-{}\" {} {}",
        url,
        socket.display(),
        site,
        RETRY,
        ACQUIRE
    )
}

/// `ProxyPass` line for a local HTTP backend
pub fn http_proxy_pass(url: &str, host: &str, port: u16) -> String {
    format!(
        "ProxyPass \"{}\" \"http://{}\" {} {}",
        url,
        host_port(host, port),
        RETRY,
        ACQUIRE
    )
}

/// Start of every `ProxyPass` line this writer emits for `url`
fn proxy_pass_prefix(url: &str) -> String {
    format!("ProxyPass \"{}\" ", url)
}

/// Writes proxy rules into site files
pub struct ProxyRuleWriter<'a> {
    registry: &'a SiteRegistry<'a>,
    modules: &'a ModuleActivator<'a>,
    lifecycle: &'a LifecycleController<'a>,
}

impl<'a> ProxyRuleWriter<'a> {
    pub fn new(
        registry: &'a SiteRegistry<'a>,
        modules: &'a ModuleActivator<'a>,
        lifecycle: &'a LifecycleController<'a>,
    ) -> Self {
        Self {
            registry,
            modules,
            lifecycle,
        }
    }

    /// Load the modules socket-mode rules need, without restarting
    pub fn activate_socket_modules(&self) -> Result<()> {
        self.modules
            .activate_all(SOCKET_MODULES, RestartPolicy::Deferred)
            .map(|_| ())
    }

    /// Load the modules HTTP-mode rules need, without restarting
    pub fn activate_http_modules(&self) -> Result<()> {
        self.modules
            .activate_all(HTTP_MODULES, RestartPolicy::Deferred)
            .map(|_| ())
    }

    /// Route `url` to a uwsgi unix socket through `mod_proxy_uwsgi`
    pub fn write_socket_proxy(&self, url: &str, socket: &Path, site: &str) -> Result<PathBuf> {
        self.activate_socket_modules()?;
        let path = self.append(
            site,
            &[socket_proxy_pass(url, socket, site)],
            Some(&proxy_pass_prefix(url)),
        )?;
        self.finish(site)?;
        Ok(path)
    }

    /// Route `url` to a local HTTP backend, passing chunked bodies through
    pub fn write_http_proxy(&self, url: &str, host: &str, port: u16, site: &str) -> Result<PathBuf> {
        self.activate_http_modules()?;
        let mut units: Vec<String> = CHUNKED_PASSTHROUGH.iter().map(|d| d.to_string()).collect();
        units.push(http_proxy_pass(url, host, port));
        let path = self.append(site, &units, Some(&proxy_pass_prefix(url)))?;
        self.finish(site)?;
        Ok(path)
    }

    /// Proxy a `<Location>` to an arbitrary upstream URL
    pub fn write_location_proxy(&self, site: &str, target_url: &str, location: &str) -> Result<PathBuf> {
        self.activate_http_modules()?;
        let mut units: Vec<String> = CHUNKED_PASSTHROUGH.iter().map(|d| d.to_string()).collect();
        units.push(format!(
            "<Location {}>\n    ProxyPass {}\n</Location>",
            location, target_url
        ));
        let path = self.append(site, &units, None)?;
        self.finish(site)?;
        Ok(path)
    }

    fn finish(&self, site: &str) -> Result<()> {
        self.registry.enable(site)?;
        self.lifecycle.restart()
    }

    /// Append each unit (a line or a block of lines) unless the file already
    /// holds it line-for-line.
    ///
    /// With `replace`, an existing line starting with that prefix is taken
    /// over by the unit sharing the prefix; further such lines are dropped.
    fn append(&self, site: &str, units: &[String], replace: Option<&str>) -> Result<PathBuf> {
        let path = self.registry.config_path_for(site);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let mut existing = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::io(&path, e)),
        };

        if let Some(prefix) = replace {
            if let Some(rule) = units.iter().find(|u| u.starts_with(prefix)) {
                if let Some(rewritten) = replace_rule(&existing, prefix, rule) {
                    std::fs::write(&path, &rewritten).map_err(|e| Error::io(&path, e))?;
                    info!(site, directive = %rule, "Replaced stale proxy rule");
                    existing = rewritten;
                }
            }
        }

        let mut content = format!("\n{}", existing);
        if !content.ends_with('\n') {
            content.push('\n');
        }
        let mut addition = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            addition.push('\n');
        }
        for unit in units {
            let needle = format!("\n{}\n", unit);
            if content.contains(&needle) {
                debug!(site, directive = %unit, "Directive already present");
                continue;
            }
            content.push_str(unit);
            content.push('\n');
            addition.push_str(unit);
            addition.push('\n');
        }

        if addition.trim().is_empty() {
            return Ok(path);
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        file.write_all(addition.as_bytes())
            .map_err(|e| Error::io(&path, e))?;

        info!(site, path = %path.display(), "Appended proxy rules");
        Ok(path)
    }
}

/// Swap lines starting with `prefix` for `rule`, keeping only the first.
/// `None` when the content already matches.
fn replace_rule(content: &str, prefix: &str, rule: &str) -> Option<String> {
    let mut out = String::with_capacity(content.len());
    let mut seen = false;
    for line in content.lines() {
        if line.starts_with(prefix) {
            if !seen {
                out.push_str(rule);
                out.push('\n');
                seen = true;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    let normalized: String = content.lines().map(|l| format!("{}\n", l)).collect();
    (seen && out != normalized).then_some(out)
}
