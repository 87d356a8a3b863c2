//! Error types for site provisioning
//!
//! Every fallible operation in the library returns [`Result`]. Errors from the
//! host collaborators are never retried here; the only retry loop lives in
//! [`crate::readiness`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring the front-end server
#[derive(Debug, Error)]
pub enum Error {
    /// Host is neither Debian- nor Red Hat-family. Fatal: there is no
    /// fallback layout.
    #[error("unsupported distro '{id}' (ID_LIKE: '{id_like}')")]
    UnsupportedDistro { id: String, id_like: String },

    /// The site has no configuration file on disk
    #[error("no configuration found for site '{site}' under {}", .dir.display())]
    SiteConfigMissing { site: String, dir: PathBuf },

    /// A front-end module could not be enabled
    #[error("failed to enable front-end module '{module}': {reason}")]
    ModuleActivation { module: String, reason: String },

    /// The backend did not become ready within the polling bound
    #[error("'{target}' not ready after {attempts} attempts ({} total)", humanize(.waited))]
    ReadinessTimeout {
        target: String,
        attempts: u32,
        waited: Duration,
    },

    /// A host command exited unsuccessfully
    #[error("command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// A filesystem operation failed
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No ephemeral port could be reserved
    #[error("failed to allocate a local port on {host}: {reason}")]
    PortAllocation { host: String, reason: String },

    /// Invalid configuration value
    #[error("invalid configuration for '{field}': {message}")]
    Config { field: String, message: String },
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the caller may carry on after this error.
    ///
    /// A missing site on disable and an unconfirmed readiness are reported
    /// but do not abort a configuration pass.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SiteConfigMissing { .. } | Error::ReadinessTimeout { .. }
        )
    }
}

fn humanize(d: &Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_distro_message() {
        let err = Error::UnsupportedDistro {
            id: "arch".to_string(),
            id_like: String::new(),
        };
        assert_eq!(err.to_string(), "unsupported distro 'arch' (ID_LIKE: '')");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_readiness_timeout_message() {
        let err = Error::ReadinessTimeout {
            target: "127.0.0.1:8080".to_string(),
            attempts: 60,
            waited: Duration::from_secs(120),
        };
        assert_eq!(
            err.to_string(),
            "'127.0.0.1:8080' not ready after 60 attempts (120s total)"
        );
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_site_missing_is_recoverable() {
        let err = Error::SiteConfigMissing {
            site: "glance-api".to_string(),
            dir: PathBuf::from("/etc/httpd/conf.d"),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("/etc/httpd/conf.d"));
    }

    #[test]
    fn test_io_error_carries_path() {
        let err = Error::io(
            "/etc/apache2/sites-available/x.conf",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/etc/apache2/sites-available/x.conf"));
        assert!(msg.contains("denied"));
    }
}
