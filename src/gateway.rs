//! uwsgi gateway configuration
//!
//! Each published service gets a uwsgi ini file with a single `[uwsgi]`
//! section. The file is always rewritten from scratch. Two wiring modes
//! exist:
//!
//! - **socket**: uwsgi listens on a unix socket and apache reaches it through
//!   `mod_proxy_uwsgi`.
//! - **http**: uwsgi serves HTTP itself on a local port and apache uses plain
//!   `mod_proxy_http`. `mod_proxy_uwsgi` drops chunked request bodies, so
//!   services receiving chunked uploads must use this mode.

use crate::config::UwsgiSettings;
use crate::error::{Error, Result};
use crate::host::Host;
use regex::Regex;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Section name of the generated ini file
pub const SECTION: &str = "uwsgi";

/// Permission bits uwsgi applies to its unix socket
pub const SOCKET_MODE: u32 = 0o666;

/// Permission bits of the socket directory
pub const SOCKET_DIR_MODE: u32 = 0o755;

/// Idle timeout for HTTP-mode sockets, long enough for slow chunked uploads
pub const HTTP_SOCKET_TIMEOUT_SECS: u32 = 30;

const HEADER_BUFFER_SIZE: u32 = 65535;
const PORT_ATTEMPTS: usize = 16;

/// tmpfiles.d snippet declaring the socket directories
const TMPFILES_NAME: &str = "uwsgi.conf";

fn module_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.]+:[A-Za-z0-9_]+$").expect("valid worker pattern")
    })
}

/// What uwsgi should load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WorkerRef {
    /// `package.module:callable`
    Module(String),
    /// Path to a WSGI script.
    ///
    /// Deprecated; kept until every service ships a module path.
    File(PathBuf),
}

impl WorkerRef {
    /// Classify a worker reference. Anything that is not `module:callable`
    /// is taken as a file path.
    pub fn parse(reference: &str) -> Self {
        if module_pattern().is_match(reference) {
            WorkerRef::Module(reference.to_string())
        } else {
            WorkerRef::File(PathBuf::from(reference))
        }
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, WorkerRef::File(_))
    }

    fn ini_entry(&self) -> (&'static str, String) {
        match self {
            WorkerRef::Module(module) => ("module", module.clone()),
            WorkerRef::File(path) => ("wsgi-file", path.display().to_string()),
        }
    }
}

/// Where apache finds a gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendRef {
    Socket { path: PathBuf, permission_mode: u32 },
    HttpPort { host: String, port: u16 },
}

impl BackendRef {
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            BackendRef::Socket { path, .. } => Some(path),
            BackendRef::HttpPort { .. } => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            BackendRef::HttpPort { port, .. } => Some(*port),
            BackendRef::Socket { .. } => None,
        }
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendRef::Socket { path, .. } => write!(f, "unix:{}", path.display()),
            BackendRef::HttpPort { host, port } => f.write_str(&host_port(host, *port)),
        }
    }
}

/// `host:port`, with IPv6 literals in brackets (`[::1]:8080`)
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Ordered key/value content of one ini section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    section: String,
    entries: Vec<(String, String)>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            section: SECTION.to_string(),
            entries: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Set a key, replacing an earlier value in place
    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = format!("[{}]\n", self.section);
        for (key, value) in &self.entries {
            out.push_str(&format!("{} = {}\n", key, value));
        }
        out
    }

    /// Parse the section this crate writes; other sections are ignored
    pub fn parse(content: &str) -> Self {
        let mut config = GatewayConfig::default();
        let mut in_section = false;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = name.trim() == SECTION;
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                config.set(key.trim(), value.trim());
            }
        }
        config
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::parse(&content))
    }

    /// The backend address this configuration listens on
    pub fn backend(&self) -> Option<BackendRef> {
        if let Some(socket) = self.get("socket") {
            let permission_mode = self
                .get("chmod-socket")
                .and_then(|m| u32::from_str_radix(m, 8).ok())
                .unwrap_or(SOCKET_MODE);
            return Some(BackendRef::Socket {
                path: PathBuf::from(socket),
                permission_mode,
            });
        }
        let (host, port) = self.get("http-socket")?.rsplit_once(':')?;
        Some(BackendRef::HttpPort {
            host: unbracket(host).to_string(),
            port: port.parse().ok()?,
        })
    }
}

/// Result of writing a gateway configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendWrite {
    pub backend: BackendRef,
    pub worker: WorkerRef,
    /// Set when the worker was given as a file path
    pub deprecation: Option<String>,
}

/// Hands out local ports that are free now and never handed out before by
/// this allocator.
#[derive(Default)]
pub struct PortAllocator {
    issued: RefCell<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the kernel for an ephemeral port on `host`
    pub fn allocate(&self, host: &str) -> Result<u16> {
        for _ in 0..PORT_ATTEMPTS {
            let listener = TcpListener::bind((unbracket(host), 0)).map_err(|e| Error::PortAllocation {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
            let port = listener
                .local_addr()
                .map_err(|e| Error::PortAllocation {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?
                .port();
            if self.issued.borrow_mut().insert(port) {
                debug!(host, port, "Allocated local port");
                return Ok(port);
            }
        }
        Err(Error::PortAllocation {
            host: host.to_string(),
            reason: format!("no unused port after {} attempts", PORT_ATTEMPTS),
        })
    }
}

/// Writes uwsgi configuration files
pub struct BackendConfigWriter<'a> {
    host: &'a dyn Host,
    settings: &'a UwsgiSettings,
    ports: PortAllocator,
}

impl<'a> BackendConfigWriter<'a> {
    pub fn new(host: &'a dyn Host, settings: &'a UwsgiSettings) -> Self {
        Self {
            host,
            settings,
            ports: PortAllocator::new(),
        }
    }

    /// Conventional socket location for a service
    pub fn socket_path_for(&self, name: &str) -> PathBuf {
        Path::new(&self.settings.socket_dir).join(format!("{}.socket", name))
    }

    fn base_config(&self, worker: &WorkerRef, processes: u32) -> GatewayConfig {
        let (worker_key, worker_value) = worker.ini_entry();
        let mut config = GatewayConfig::default();
        config
            .set(worker_key, worker_value)
            .set("processes", processes)
            .set("master", true)
            .set("die-on-term", true)
            .set("exit-on-reload", false)
            .set("worker-reload-mercy", self.settings.worker_timeout)
            .set("enable-threads", true)
            .set("plugins", "http,python3")
            .set("thunder-lock", true)
            .set("hook-master-start", "unix_signal:15 gracefully_kill_them_all")
            .set("buffer-size", HEADER_BUFFER_SIZE)
            .set("add-header", "Connection: close")
            .set("lazy-apps", true)
            .set("start-time", "%t");
        config
    }

    /// Gateway listening on a unix socket, fronted by `mod_proxy_uwsgi`
    pub fn write_socket_backend(
        &self,
        conf: &Path,
        worker: &str,
        processes: u32,
        socket: &Path,
    ) -> Result<BackendWrite> {
        let (worker, deprecation) = resolve_worker(worker);
        if let Some(dir) = socket.parent() {
            self.provision_socket_dir(dir)?;
        }

        let mut config = self.base_config(&worker, processes);
        config
            .set("socket", socket.display())
            .set("chmod-socket", format!("{:o}", SOCKET_MODE));
        write_config(conf, &config)?;

        let backend = BackendRef::Socket {
            path: socket.to_path_buf(),
            permission_mode: SOCKET_MODE,
        };
        info!(conf = %conf.display(), %backend, processes, "Wrote socket gateway config");
        Ok(BackendWrite {
            backend,
            worker,
            deprecation,
        })
    }

    /// Gateway serving HTTP on a freshly allocated local port
    pub fn write_http_backend(
        &self,
        conf: &Path,
        worker: &str,
        processes: u32,
        bind_host: &str,
    ) -> Result<BackendWrite> {
        let (worker, deprecation) = resolve_worker(worker);
        let bind_host = unbracket(bind_host);
        let port = self.ports.allocate(bind_host)?;

        let mut config = self.base_config(&worker, processes);
        config
            .set("http-socket", host_port(bind_host, port))
            .set("chmod-socket", format!("{:o}", SOCKET_MODE))
            .set("http-raw-body", true)
            .set("http-chunked-input", true)
            .set("http-auto-chunked", true)
            .set("http-keepalive", false)
            .set("socket-timeout", HTTP_SOCKET_TIMEOUT_SECS);
        write_config(conf, &config)?;

        let backend = BackendRef::HttpPort {
            host: bind_host.to_string(),
            port,
        };
        info!(conf = %conf.display(), %backend, processes, "Wrote HTTP gateway config");
        Ok(BackendWrite {
            backend,
            worker,
            deprecation,
        })
    }

    /// Delete a gateway configuration
    pub fn remove_backend(&self, conf: &Path) -> Result<()> {
        crate::sites::remove_if_exists(conf)
    }

    /// Declare the socket directory in tmpfiles.d so it is recreated on
    /// boot before uwsgi starts, then create it now.
    ///
    /// One snippet holds every socket directory; the entry for `dir` is
    /// replaced and entries for other directories are kept.
    fn provision_socket_dir(&self, dir: &Path) -> Result<()> {
        let tmpfiles_dir = Path::new(&self.settings.tmpfiles_dir);
        std::fs::create_dir_all(tmpfiles_dir).map_err(|e| Error::io(tmpfiles_dir, e))?;
        let tmpfiles = tmpfiles_dir.join(TMPFILES_NAME);

        let existing = match std::fs::read_to_string(&tmpfiles) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::io(&tmpfiles, e)),
        };

        // Format: "d <path> <mode> <user> <group>"
        let prefix = format!("d {} ", dir.display());
        let mut content: String = existing
            .lines()
            .filter(|line| !line.starts_with(&prefix))
            .map(|line| format!("{}\n", line))
            .collect();
        content.push_str(&format!(
            "{}{:04o} {} root\n",
            prefix, SOCKET_DIR_MODE, self.settings.service_user
        ));

        std::fs::write(&tmpfiles, content).map_err(|e| Error::io(&tmpfiles, e))?;
        self.host.apply_tmpfiles(&tmpfiles)
    }
}

fn resolve_worker(reference: &str) -> (WorkerRef, Option<String>) {
    let worker = WorkerRef::parse(reference);
    let deprecation = worker.is_deprecated().then(|| {
        let message = format!(
            "configuring uwsgi with a WSGI file ({}) is deprecated, use a module path",
            reference
        );
        warn!(worker = reference, "{}", message);
        message
    });
    (worker, deprecation)
}

fn write_config(conf: &Path, config: &GatewayConfig) -> Result<()> {
    if let Some(parent) = conf.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::write(conf, config.render()).map_err(|e| Error::io(conf, e))
}
