//! Sitegate - publishes uwsgi-hosted services behind apache
//!
//! This library configures a host's apache front-end so that local services
//! become reachable under a URL prefix:
//! - Resolves the distro conventions once (Debian or Red Hat family)
//! - Writes uwsgi gateway configs for unix-socket or local-HTTP backends
//! - Appends `mod_proxy` rules and enables the site
//! - Activates the apache modules the rules depend on
//! - Coalesces restarts so a publish costs one stop/start of the server
//! - Waits, within a fixed bound, for a backend to become reachable

pub mod config;
pub mod distro;
pub mod error;
pub mod gateway;
pub mod host;
pub mod lifecycle;
pub mod modules;
pub mod proxy;
pub mod publish;
pub mod readiness;
pub mod sites;
