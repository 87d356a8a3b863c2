//! Bounded readiness polling
//!
//! A fixed number of probes at a fixed interval, no backoff. A backend that
//! is slow to start and one that will never start look the same from here:
//! both end in [`Error::ReadinessTimeout`] once the bound is reached.

use crate::config::ReadinessSettings;
use crate::error::{Error, Result};
use crate::gateway::{host_port, BackendRef};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub const DEFAULT_ATTEMPTS: u32 = 60;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Per-probe connect and read timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that can be asked "are you up yet?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// TCP connect succeeds
    Tcp(String),
    /// unix socket connect succeeds
    Unix(PathBuf),
    /// HTTP GET answers with a status below 500
    Http { addr: String, path: String },
}

impl Probe {
    /// Probe matching how apache reaches the backend
    pub fn for_backend(backend: &BackendRef) -> Self {
        match backend {
            BackendRef::Socket { path, .. } => Probe::Unix(path.clone()),
            BackendRef::HttpPort { host, port } => Probe::Http {
                addr: host_port(host, *port),
                path: "/".to_string(),
            },
        }
    }

    pub fn target(&self) -> String {
        match self {
            Probe::Tcp(addr) => addr.clone(),
            Probe::Unix(path) => format!("unix:{}", path.display()),
            Probe::Http { addr, path } => format!("http://{}{}", addr, path),
        }
    }

    pub fn check(&self) -> bool {
        match self {
            Probe::Tcp(addr) => connect(addr).is_some(),
            Probe::Unix(path) => connect_unix(path),
            Probe::Http { addr, path } => check_http(addr, path),
        }
    }
}

fn connect(addr: &str) -> Option<TcpStream> {
    let addr = addr.to_socket_addrs().ok()?.next()?;
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).ok()
}

#[cfg(unix)]
fn connect_unix(path: &std::path::Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(not(unix))]
fn connect_unix(_path: &std::path::Path) -> bool {
    false
}

fn check_http(addr: &str, path: &str) -> bool {
    let Some(mut stream) = connect(addr) else {
        return false;
    };
    if stream.set_read_timeout(Some(PROBE_TIMEOUT)).is_err() {
        return false;
    }

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    if stream.write_all(request.as_bytes()).is_err() {
        return false;
    }

    // Format: "HTTP/1.1 200 OK\r\n"
    let mut status_line = String::new();
    if BufReader::new(stream).read_line(&mut status_line).is_err() {
        return false;
    }
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| code < 500)
        .unwrap_or(false)
}

/// Fixed-count, fixed-interval poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoller {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl From<&ReadinessSettings> for ReadinessPoller {
    fn from(settings: &ReadinessSettings) -> Self {
        Self {
            attempts: settings.attempts,
            interval: settings.interval(),
        }
    }
}

impl ReadinessPoller {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Call `check` until it returns true or the attempts run out.
    ///
    /// Returns the number of attempts it took.
    pub fn wait<F>(&self, target: &str, mut check: F) -> Result<u32>
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        for attempt in 1..=self.attempts {
            if check() {
                info!(endpoint = target, attempt, "Service is ready");
                return Ok(attempt);
            }
            debug!(endpoint = target, attempt, max = self.attempts, "Service not ready yet");
            if attempt < self.attempts && !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
        }

        let waited = start.elapsed();
        error!(
            endpoint = target,
            attempts = self.attempts,
            waited_ms = waited.as_millis() as u64,
            "Service did not become ready; it may still be starting or may have failed"
        );
        Err(Error::ReadinessTimeout {
            target: target.to_string(),
            attempts: self.attempts,
            waited,
        })
    }

    /// Poll a [`Probe`]
    pub fn wait_for(&self, probe: &Probe) -> Result<u32> {
        self.wait(&probe.target(), || probe.check())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_defaults_are_sixty_times_two_seconds() {
        let poller = ReadinessPoller::default();
        assert_eq!(poller.attempts, 60);
        assert_eq!(poller.interval, Duration::from_secs(2));

        let from_settings = ReadinessPoller::from(&ReadinessSettings::default());
        assert_eq!(from_settings, poller);
    }

    #[test]
    fn test_never_ready_makes_exactly_sixty_attempts() {
        let poller = ReadinessPoller::new(DEFAULT_ATTEMPTS, Duration::ZERO);
        let mut calls = 0;

        let err = poller
            .wait("dead-backend", || {
                calls += 1;
                false
            })
            .unwrap_err();

        assert_eq!(calls, 60);
        assert!(matches!(err, Error::ReadinessTimeout { attempts: 60, .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_ready_on_third_attempt() {
        let poller = ReadinessPoller::new(5, Duration::ZERO);
        let mut calls = 0;
        let attempts = poller
            .wait("slow-backend", || {
                calls += 1;
                calls == 3
            })
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_interval_is_applied_between_attempts() {
        let poller = ReadinessPoller::new(3, Duration::from_millis(20));
        let start = Instant::now();
        let _ = poller.wait("x", || false);
        // two pauses between three attempts
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(Probe::Tcp(addr.clone()).check());

        drop(listener);
        let poller = ReadinessPoller::new(2, Duration::ZERO);
        assert!(poller.wait_for(&Probe::Tcp(addr)).is_err());
    }

    #[test]
    fn test_http_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf);
            stream
                .write_all(b"HTTP/1.1 300 Multiple Choices\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });

        let probe = Probe::Http {
            addr,
            path: "/".to_string(),
        };
        assert!(probe.check());
        server.join().unwrap();
    }

    #[test]
    fn test_probe_for_backend() {
        let probe = Probe::for_backend(&BackendRef::HttpPort {
            host: "127.0.0.1".to_string(),
            port: 60001,
        });
        assert_eq!(probe.target(), "http://127.0.0.1:60001/");

        let probe = Probe::for_backend(&BackendRef::HttpPort {
            host: "::1".to_string(),
            port: 60001,
        });
        assert_eq!(probe.target(), "http://[::1]:60001/");

        let probe = Probe::for_backend(&BackendRef::Socket {
            path: PathBuf::from("/var/run/uwsgi/nova.socket"),
            permission_mode: 0o666,
        });
        assert_eq!(probe.target(), "unix:/var/run/uwsgi/nova.socket");
        assert!(!probe.check());
    }
}
