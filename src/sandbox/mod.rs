//! Sandbox launching: compilation, supervision and the running handle.
//!
//! [`Launcher`] ties the pipeline together for one instance:
//!
//! 1. open the instance and take its advisory launch lock,
//! 2. resolve profile + overrides into a [`ResolvedConfig`],
//! 3. compile the mount fragment and synthesize the seccomp program,
//! 4. assemble the launch plan and spawn the containment primitive,
//! 5. wait for the helper handshake.
//!
//! Every validation and compilation step happens before any process is
//! spawned; a failure in 1–4 leaves nothing behind. Once a process
//! exists, every exit path — including handshake failure and handle drop
//! — reaps it.

mod mounts;
mod plan;
mod seccomp;
mod supervisor;

pub use mounts::{compile_mounts, CompileContext, LaunchFragment, MountEntry, SANDBOX_HOME};
pub use plan::{
    default_helper_path, AuxFd, FdRole, LaunchPlan, HELPER_CHANNEL_FD, SECCOMP_TARGET_FD,
};
pub use seccomp::{synthesize, SeccompProgram, SyscallRule};
pub use supervisor::{
    find_primitive, SandboxChild, SandboxExit, Supervisor, SupervisorConfig,
};

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::{Error, ResolveError};
use crate::helper::{Channel, HelperSession, SessionState};
use crate::instance::{InstanceStore, LaunchLock};
use crate::service::{resolve, ProfileRegistry, ResolvedConfig};

/// Launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub supervisor: SupervisorConfig,
    /// Path of the in-sandbox helper binary.
    pub helper_path: PathBuf,
    /// How long to wait for the helper's startup handshake.
    pub handshake_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            helper_path: default_helper_path(),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Launches sandboxed applications from instances.
#[derive(Debug)]
pub struct Launcher {
    registry: ProfileRegistry,
    store: InstanceStore,
    config: LauncherConfig,
}

impl Launcher {
    #[must_use]
    pub fn new(registry: ProfileRegistry, store: InstanceStore, config: LauncherConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Resolves an instance's configuration without launching.
    ///
    /// Shared by launch and by front ends that want to audit the
    /// effective configuration.
    pub fn resolve_instance(&self, name: &str) -> Result<ResolvedConfig, Error> {
        let instance = self.store.open(name)?;
        let profile = match instance.config.profile.as_deref() {
            Some(profile_name) => Some(self.registry.get(profile_name).ok_or(
                ResolveError::UnknownProfile {
                    name: profile_name.to_string(),
                },
            )?),
            None => None,
        };
        Ok(resolve(profile, &instance.config.overrides)?)
    }

    /// Launches an instance, returning the running sandbox handle.
    ///
    /// `command` is the application argv; when empty the instance runs
    /// only the helper (useful for probing a configuration).
    #[instrument(skip(self, command), fields(instance = name))]
    pub fn launch(&self, name: &str, command: &[String]) -> Result<SandboxHandle, Error> {
        let instance = self.store.open(name)?;
        let lock = LaunchLock::acquire(&instance)?;

        let profile = match instance.config.profile.as_deref() {
            Some(profile_name) => Some(self.registry.get(profile_name).ok_or(
                ResolveError::UnknownProfile {
                    name: profile_name.to_string(),
                },
            )?),
            None => None,
        };
        let cfg = resolve(profile, &instance.config.overrides)?;

        let ctx = CompileContext::from_env(&instance.paths.home)?;
        let fragment = compile_mounts(&cfg, &ctx)?;
        let program = synthesize(&cfg)?;
        let seccomp_fd = program.into_memfd()?;

        let (host_chan, helper_chan) = Channel::pair()?;
        let plan = LaunchPlan::assemble(
            fragment,
            seccomp_fd,
            helper_chan.into_fd(),
            &self.config.helper_path,
            command,
        );

        let supervisor = Supervisor::new(self.config.supervisor.clone());
        let mut child = supervisor.launch(plan)?;
        let mut session = HelperSession::new(host_chan);

        if let Err(e) = session.handshake(self.config.handshake_timeout) {
            // The sandbox exists but its control channel never came up;
            // reap it rather than leave an unsupervisable process.
            warn!(error = %e, "Helper handshake failed, reaping sandbox");
            let _ = child.kill_and_reap();
            return Err(e.into());
        }

        debug!(pid = child.pid(), "Sandbox launched");
        Ok(SandboxHandle {
            name: name.to_string(),
            child,
            session,
            _lock: lock,
        })
    }
}

/// A running sandbox: child process, helper session and launch lock.
///
/// The lock is held for the handle's lifetime; dropping the handle reaps
/// the child and releases the lock.
#[derive(Debug)]
pub struct SandboxHandle {
    name: String,
    child: SandboxChild,
    session: HelperSession,
    _lock: LaunchLock,
}

impl SandboxHandle {
    /// Instance name this sandbox was launched from.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the containment primitive.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    /// The helper session, for dynamic grants and status queries.
    pub fn session(&mut self) -> &mut HelperSession {
        &mut self.session
    }

    /// Blocks until the sandboxed process exits.
    pub fn wait(&mut self) -> Result<SandboxExit, Error> {
        let exit = self.child.wait()?;
        self.session.confirm_exited();
        Ok(exit)
    }

    /// Waits with a deadline; `Ok(None)` means still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<SandboxExit>, Error> {
        let exit = self.child.wait_timeout(timeout)?;
        if exit.is_some() {
            self.session.confirm_exited();
        }
        Ok(exit)
    }

    /// Terminates the sandbox and always reaps it.
    ///
    /// Escalation: helper shutdown request, then SIGTERM, then SIGKILL.
    /// Each step proceeds even if the previous one failed — resource
    /// safety takes precedence over error propagation — so no process
    /// table entry or descriptor outlives this call.
    #[instrument(skip(self), fields(instance = %self.name, pid = self.child.pid()))]
    pub fn shutdown(&mut self, grace: Duration) -> Result<SandboxExit, Error> {
        if self.session.state() == SessionState::Ready {
            if let Err(e) = self.session.request_shutdown(grace) {
                debug!(error = %e, "Helper shutdown request failed, falling back to signals");
            }
        }
        self.session.close();

        if let Ok(Some(exit)) = self.child.wait_timeout(grace) {
            return Ok(exit);
        }

        if let Err(e) = self.child.terminate() {
            debug!(error = %e, "SIGTERM failed");
        }
        if let Ok(Some(exit)) = self.child.wait_timeout(grace) {
            return Ok(exit);
        }

        warn!("Escalating to SIGKILL");
        Ok(self.child.kill_and_reap()?)
    }
}
