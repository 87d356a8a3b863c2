//! Front-end process lifecycle
//!
//! [`LifecycleController`] is the only component that starts, stops or
//! restarts the front-end server. The other components ask it for a restart
//! instead of talking to the service manager themselves.

use crate::distro::DistroProfile;
use crate::error::Result;
use crate::host::Host;
use std::cell::Cell;
use std::time::Duration;
use tracing::{debug, info};

/// Pause between stop and start when restarting.
///
/// apache can report its listening port as still bound right after a
/// reload-style restart, which makes the following start fail.
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Starts, stops and restarts the front-end server
pub struct LifecycleController<'a> {
    host: &'a dyn Host,
    process_name: String,
    settle: Duration,
    /// Open [`batch`](Self::batch) scopes
    depth: Cell<u32>,
    /// A restart was requested inside a batch
    pending: Cell<bool>,
    restarting: Cell<bool>,
    restarts: Cell<u32>,
}

impl<'a> LifecycleController<'a> {
    pub fn new(profile: &DistroProfile, host: &'a dyn Host) -> Self {
        Self::with_settle_delay(profile, host, RESTART_SETTLE_DELAY)
    }

    /// Controller with a custom stop/start pause (staging hosts, tests)
    pub fn with_settle_delay(
        profile: &DistroProfile,
        host: &'a dyn Host,
        settle: Duration,
    ) -> Self {
        Self {
            host,
            process_name: profile.process_name.clone(),
            settle,
            depth: Cell::new(0),
            pending: Cell::new(false),
            restarting: Cell::new(false),
            restarts: Cell::new(0),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn start(&self) -> Result<()> {
        info!(service = %self.process_name, "Starting front-end server");
        self.host.start(&self.process_name)
    }

    pub fn stop(&self) -> Result<()> {
        info!(service = %self.process_name, "Stopping front-end server");
        self.host.stop(&self.process_name)
    }

    /// Stop, pause, start.
    ///
    /// Inside a [`batch`](Self::batch) the restart is deferred to the end of
    /// the outermost batch. A request arriving while a restart is running is
    /// dropped.
    pub fn restart(&self) -> Result<()> {
        if self.depth.get() > 0 {
            debug!(service = %self.process_name, "Restart deferred to end of batch");
            self.pending.set(true);
            return Ok(());
        }
        if self.restarting.replace(true) {
            debug!(service = %self.process_name, "Restart already in progress");
            return Ok(());
        }
        let result = self.restart_now();
        self.restarting.set(false);
        result
    }

    fn restart_now(&self) -> Result<()> {
        info!(
            service = %self.process_name,
            settle_ms = self.settle.as_millis() as u64,
            "Restarting front-end server"
        );
        self.host.stop(&self.process_name)?;
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        self.host.start(&self.process_name)?;
        self.restarts.set(self.restarts.get() + 1);
        Ok(())
    }

    /// Run `f` with restarts coalesced.
    ///
    /// Any number of restart requests made inside `f` (including nested
    /// batches) result in a single restart once `f` succeeds. If `f` fails no
    /// restart happens, so a half-written configuration is never loaded.
    pub fn batch<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.depth.set(self.depth.get() + 1);
        let result = f();
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth > 0 {
            return result;
        }

        let pending = self.pending.replace(false);
        let value = result?;
        if pending {
            self.restart()?;
        }
        Ok(value)
    }

    /// Restarts actually performed by this controller
    pub fn restart_count(&self) -> u32 {
        self.restarts.get()
    }
}
