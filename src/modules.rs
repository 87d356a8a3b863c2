//! Front-end module activation

use crate::distro::{DistroFamily, DistroProfile, ModuleMechanism};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::lifecycle::LifecycleController;
use serde::Serialize;
use tracing::{debug, info};

/// Modules compiled into apache2 on the Debian family; `a2enmod` rejects them
const BUILTIN_MODULES: &[&str] = &["version"];

/// When to restart after a module was enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart right away through the lifecycle controller
    Immediate,
    /// Leave the restart to the caller, so several activations share one
    Deferred,
}

/// Outcome of an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivationResult {
    /// A module went from not loaded to loaded
    pub changed: bool,
}

/// Load state of a module as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleState {
    pub name: String,
    pub loaded: bool,
}

/// Makes sure front-end modules are loaded
pub struct ModuleActivator<'a> {
    profile: &'a DistroProfile,
    host: &'a dyn Host,
    lifecycle: &'a LifecycleController<'a>,
}

impl<'a> ModuleActivator<'a> {
    pub fn new(
        profile: &'a DistroProfile,
        host: &'a dyn Host,
        lifecycle: &'a LifecycleController<'a>,
    ) -> Self {
        Self {
            profile,
            host,
            lifecycle,
        }
    }

    fn always_loaded(&self, name: &str) -> bool {
        self.profile.module_mechanism == ModuleMechanism::AlwaysLoaded
            || (self.profile.family == DistroFamily::Debian && BUILTIN_MODULES.contains(&name))
    }

    /// Query the current load state
    pub fn state(&self, name: &str) -> Result<ModuleState> {
        let loaded = self.always_loaded(name)
            || self
                .host
                .is_module_loaded(name)
                .map_err(|e| activation_error(name, e))?;
        Ok(ModuleState {
            name: name.to_string(),
            loaded,
        })
    }

    /// Ensure `name` is loaded, restarting according to `policy` only when
    /// something changed.
    pub fn activate(&self, name: &str, policy: RestartPolicy) -> Result<ActivationResult> {
        if self.always_loaded(name) {
            debug!(module = name, "Module always loaded, nothing to enable");
            return Ok(ActivationResult::default());
        }
        if !self.host.module_mechanism_available() {
            return Err(Error::ModuleActivation {
                module: name.to_string(),
                reason: "no module-enable command on this host".to_string(),
            });
        }

        if self.state(name)?.loaded {
            debug!(module = name, "Module already loaded");
            return Ok(ActivationResult::default());
        }

        self.host
            .enable_module(name)
            .map_err(|e| activation_error(name, e))?;
        info!(module = name, ?policy, "Enabled front-end module");

        if policy == RestartPolicy::Immediate {
            self.lifecycle.restart()?;
        }
        Ok(ActivationResult { changed: true })
    }

    /// Activate several modules with at most one restart
    pub fn activate_all(&self, names: &[&str], policy: RestartPolicy) -> Result<ActivationResult> {
        let mut changed = false;
        for name in names {
            changed |= self.activate(name, RestartPolicy::Deferred)?.changed;
        }
        if changed && policy == RestartPolicy::Immediate {
            self.lifecycle.restart()?;
        }
        Ok(ActivationResult { changed })
    }
}

fn activation_error(module: &str, source: Error) -> Error {
    match source {
        Error::ModuleActivation { .. } => source,
        other => Error::ModuleActivation {
            module: module.to_string(),
            reason: other.to_string(),
        },
    }
}
