//! Compiled launch plans.
//!
//! A [`LaunchPlan`] is the complete, ordered input for one invocation of
//! the containment primitive: the argument vector, the auxiliary file
//! descriptors referenced by it, and the environment assignments already
//! rendered into the arguments.
//!
//! A plan is owned by exactly one launch attempt and consumed by it.
//! Plans are never reused: instance overrides may change between
//! launches, so every launch compiles a fresh plan.

use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use crate::sandbox::mounts::{LaunchFragment, MountEntry};

/// In-sandbox descriptor number the seccomp program is inherited on.
///
/// Part of the invocation contract with the primitive (`--seccomp N`);
/// stable for the lifetime of a plan.
pub const SECCOMP_TARGET_FD: RawFd = 9;

/// In-sandbox descriptor number of the helper channel.
///
/// The helper cannot discover the channel by name (the sandbox has no
/// view of host-side naming), so the number is passed on its command
/// line (`--channel-fd N`).
pub const HELPER_CHANNEL_FD: RawFd = 10;

/// What an inherited descriptor is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdRole {
    SeccompFilter,
    HelperChannel,
}

/// One descriptor to install at a fixed number before exec.
#[derive(Debug)]
pub struct AuxFd {
    pub role: FdRole,
    /// Descriptor number the primitive expects.
    pub target: RawFd,
    /// Host-side descriptor backing it.
    pub source: OwnedFd,
}

/// The fully assembled input for one primitive invocation.
#[derive(Debug)]
pub struct LaunchPlan {
    args: Vec<String>,
    aux_fds: Vec<AuxFd>,
}

impl LaunchPlan {
    /// Assembles a plan from its compiled pieces.
    ///
    /// Argument layout: the mount/namespace fragment (fixed order), the
    /// seccomp descriptor reference, then `-- <helper> --channel-fd N --
    /// <command...>`. The helper binary is bind-mounted read-only when it
    /// lives outside the baseline `/usr` view.
    #[must_use]
    pub fn assemble(
        mut fragment: LaunchFragment,
        seccomp_fd: OwnedFd,
        helper_fd: OwnedFd,
        helper_exe: &Path,
        command: &[String],
    ) -> Self {
        if !helper_exe.starts_with("/usr") {
            fragment.mounts.push(MountEntry::BindRo {
                source: helper_exe.to_path_buf(),
                target: helper_exe.to_path_buf(),
            });
        }

        let mut args = fragment.to_args();
        args.push("--seccomp".into());
        args.push(SECCOMP_TARGET_FD.to_string());
        args.push("--".into());
        args.push(helper_exe.to_string_lossy().into_owned());
        args.push("--channel-fd".into());
        args.push(HELPER_CHANNEL_FD.to_string());
        args.push("--".into());
        args.extend(command.iter().cloned());

        Self {
            args,
            aux_fds: vec![
                AuxFd {
                    role: FdRole::SeccompFilter,
                    target: SECCOMP_TARGET_FD,
                    source: seccomp_fd,
                },
                AuxFd {
                    role: FdRole::HelperChannel,
                    target: HELPER_CHANNEL_FD,
                    source: helper_fd,
                },
            ],
        }
    }

    /// The primitive's argument vector.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The auxiliary descriptor table.
    #[must_use]
    pub fn aux_fds(&self) -> &[AuxFd] {
        &self.aux_fds
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Vec<AuxFd>) {
        (self.args, self.aux_fds)
    }
}

/// Default location of the in-sandbox helper binary.
#[must_use]
pub fn default_helper_path() -> PathBuf {
    PathBuf::from("/usr/lib/nestbox/nestbox-helper")
}
