//! Namespace and mount compilation.
//!
//! Turns a [`ResolvedConfig`] into the ordered launch fragment the
//! containment primitive consumes: namespace unshare flags, bind/ro-bind/
//! tmpfs/dev mount directives and environment assignments.
//!
//! # Ordering is a correctness invariant
//!
//! The fragment is emitted in a fixed order:
//!
//! 1. namespace unshare flags,
//! 2. the instance home bind mount (the sandbox's new home root),
//! 3. unconditional read-only system binds (minimal `/usr`, `/etc`
//!    subset, fresh proc/dev/tmp),
//! 4. per-service mount entries in service-declaration order,
//! 5. environment variable assignments.
//!
//! Bind mounts must land after the unshare that creates the mount
//! namespace and before the primitive drops privileges; the primitive
//! guarantees that as long as the argument order holds. Service entries
//! are never reordered relative to each other because later entries are
//! allowed to shadow (mount over) earlier ones — that is the mechanism a
//! narrow grant uses to override a broader one.
//!
//! # Path safety
//!
//! Every grant path is normalized (`.`/`..` components, symlink
//! resolution over the existing prefix) and must fall under the instance
//! home, the caller's real home, or the system whitelist; anything else
//! is a PathEscape and treated as a security violation. Credential
//! locations are refused even inside allowed roots.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, error, instrument, trace};

use crate::error::CompileError;
use crate::service::{AccessMode, MountKind, ResolvedConfig, Service, ServiceKind};

/// Home directory path inside every sandbox.
pub const SANDBOX_HOME: &str = "/home/user";

/// System roots a grant may live under in addition to the home dirs.
const SYSTEM_WHITELIST: &[&str] = &["/usr", "/etc", "/opt", "/tmp", "/dev", "/run", "/sys"];

/// Credential locations under the caller's home that are never granted.
const FORBIDDEN_HOME_SUBPATHS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".kube",
    ".netrc",
    ".git-credentials",
    ".config/gh",
    ".config/gcloud",
    ".docker/config.json",
    ".cargo/credentials",
    ".cargo/credentials.toml",
    ".npmrc",
    ".pypirc",
];

/// Absolute credential locations that are never granted.
const FORBIDDEN_ABSOLUTE: &[&str] = &[
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/ssh",
    "/run/secrets",
];

/// `/etc` entries every sandbox receives read-only (when present).
const SAFE_ETC_FILES: &[&str] = &[
    "passwd",
    "group",
    "hosts",
    "resolv.conf",
    "nsswitch.conf",
    "localtime",
    "ssl/certs",
    "ld.so.cache",
    "ld.so.conf",
    "ld.so.conf.d",
    "fonts",
];

/// Host-side inputs the compiler needs besides the resolved config.
///
/// All environment-derived values are injected explicitly so compilation
/// stays a pure function of its arguments.
#[derive(Debug, Clone)]
pub struct CompileContext {
    /// Host path of the instance's persistent home directory.
    pub instance_home: PathBuf,
    /// The caller's real home directory (`~` expansion, whitelist root).
    pub host_home: PathBuf,
    /// The caller's runtime directory (`/run/user/<uid>`).
    pub runtime_dir: PathBuf,
}

impl CompileContext {
    #[must_use]
    pub fn new(
        instance_home: impl Into<PathBuf>,
        host_home: impl Into<PathBuf>,
        runtime_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instance_home: instance_home.into(),
            host_home: host_home.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Builds a context from the host environment.
    pub fn from_env(instance_home: impl Into<PathBuf>) -> Result<Self, CompileError> {
        let host_home = std::env::var("HOME").map_err(|_| CompileError::Environment {
            reason: "HOME is not set".to_string(),
        })?;
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .unwrap_or_else(|_| format!("/run/user/{}", nix::unistd::Uid::effective().as_raw()));
        Ok(Self::new(instance_home, host_home, runtime_dir))
    }
}

/// One mount directive, in the containment primitive's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEntry {
    /// `--bind SOURCE TARGET`
    BindRw { source: PathBuf, target: PathBuf },
    /// `--ro-bind SOURCE TARGET`
    BindRo { source: PathBuf, target: PathBuf },
    /// `--ro-bind-try SOURCE TARGET` (skipped if SOURCE is absent)
    BindRoTry { source: PathBuf, target: PathBuf },
    /// `--dev-bind SOURCE TARGET` (device nodes stay usable)
    BindDev { source: PathBuf, target: PathBuf },
    /// `--tmpfs TARGET`
    Tmpfs { target: PathBuf },
    /// `--symlink LINK_TARGET TARGET`
    Symlink { link_target: PathBuf, target: PathBuf },
    /// `--proc TARGET`
    Proc { target: PathBuf },
    /// `--dev TARGET`
    Dev { target: PathBuf },
}

impl MountEntry {
    /// Renders this entry as primitive arguments.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        fn path(p: &Path) -> String {
            p.to_string_lossy().into_owned()
        }
        match self {
            MountEntry::BindRw { source, target } => {
                vec!["--bind".into(), path(source), path(target)]
            }
            MountEntry::BindRo { source, target } => {
                vec!["--ro-bind".into(), path(source), path(target)]
            }
            MountEntry::BindRoTry { source, target } => {
                vec!["--ro-bind-try".into(), path(source), path(target)]
            }
            MountEntry::BindDev { source, target } => {
                vec!["--dev-bind".into(), path(source), path(target)]
            }
            MountEntry::Tmpfs { target } => vec!["--tmpfs".into(), path(target)],
            MountEntry::Symlink { link_target, target } => {
                vec!["--symlink".into(), path(link_target), path(target)]
            }
            MountEntry::Proc { target } => vec!["--proc".into(), path(target)],
            MountEntry::Dev { target } => vec!["--dev".into(), path(target)],
        }
    }
}

/// The compiled namespace/mount/environment portion of a launch plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchFragment {
    /// Namespace unshare flags, fixed order.
    pub unshare: Vec<String>,
    /// Mount directives, order is load-bearing.
    pub mounts: Vec<MountEntry>,
    /// Environment assignments, applied after a full clear.
    pub env: Vec<(String, String)>,
}

impl LaunchFragment {
    /// Renders the fragment into the primitive's argument order.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = self.unshare.clone();
        args.push("--die-with-parent".into());
        for mount in &self.mounts {
            args.extend(mount.args());
        }
        args.push("--clearenv".into());
        for (key, value) in &self.env {
            args.push("--setenv".into());
            args.push(key.clone());
            args.push(value.clone());
        }
        args
    }
}

/// Compiles a resolved configuration into its launch fragment.
///
/// # Errors
///
/// Returns `CompileError::PathEscape` / `ForbiddenPath` for unsafe grant
/// paths. Compilation touches no process state; a failed compile leaves
/// nothing to clean up.
#[instrument(skip_all, fields(instance_home = %ctx.instance_home.display()))]
pub fn compile_mounts(
    cfg: &ResolvedConfig,
    ctx: &CompileContext,
) -> Result<LaunchFragment, CompileError> {
    let mut unshare: Vec<String> = vec![
        "--unshare-user".into(),
        "--unshare-pid".into(),
        "--unshare-ipc".into(),
        "--unshare-uts".into(),
        "--unshare-cgroup".into(),
    ];
    if !cfg.network_shared() {
        unshare.push("--unshare-net".into());
    }

    let mut mounts = Vec::new();
    let mut env: Vec<(String, String)> = Vec::new();

    // New home root first: later, narrower grants may mount over it.
    mounts.push(MountEntry::BindRw {
        source: ctx.instance_home.clone(),
        target: PathBuf::from(SANDBOX_HOME),
    });

    baseline_mounts(ctx, &mut mounts);

    env.push(("HOME".into(), SANDBOX_HOME.into()));
    env.push((
        "XDG_RUNTIME_DIR".into(),
        ctx.runtime_dir.to_string_lossy().into_owned(),
    ));
    env.push(("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into()));

    for service in cfg.services() {
        compile_service(service, ctx, &mut mounts, &mut env)?;
    }

    debug!(
        mounts = mounts.len(),
        env = env.len(),
        network_shared = cfg.network_shared(),
        "Mount fragment compiled"
    );
    Ok(LaunchFragment {
        unshare,
        mounts,
        env,
    })
}

/// Read-only system view every sandbox gets, independent of services.
fn baseline_mounts(ctx: &CompileContext, mounts: &mut Vec<MountEntry>) {
    mounts.push(MountEntry::BindRo {
        source: "/usr".into(),
        target: "/usr".into(),
    });
    for (link_target, target) in [
        ("usr/bin", "/bin"),
        ("usr/sbin", "/sbin"),
        ("usr/lib", "/lib"),
        ("usr/lib64", "/lib64"),
    ] {
        mounts.push(MountEntry::Symlink {
            link_target: link_target.into(),
            target: target.into(),
        });
    }
    for name in SAFE_ETC_FILES {
        let path = Path::new("/etc").join(name);
        mounts.push(MountEntry::BindRoTry {
            source: path.clone(),
            target: path,
        });
    }
    mounts.push(MountEntry::Proc {
        target: "/proc".into(),
    });
    mounts.push(MountEntry::Dev {
        target: "/dev".into(),
    });
    mounts.push(MountEntry::Tmpfs {
        target: "/tmp".into(),
    });
    mounts.push(MountEntry::Tmpfs {
        target: ctx.runtime_dir.clone(),
    });
}

/// Per-service compilation. Exhaustive over the variant set: a new kind
/// does not compile until its mount/environment contribution is decided.
fn compile_service(
    service: &Service,
    ctx: &CompileContext,
    mounts: &mut Vec<MountEntry>,
    env: &mut Vec<(String, String)>,
) -> Result<(), CompileError> {
    match service {
        Service::Filesystem(opts) => {
            for grant in &opts.grants {
                let source = validate_grant_source(ServiceKind::Filesystem, &grant.path, ctx)?;
                let target = sandbox_target(&source, ctx);
                let entry = match (grant.mount, grant.mode) {
                    (MountKind::Tmpfs, _) => MountEntry::Tmpfs { target },
                    (MountKind::Dev, _) => MountEntry::BindDev { source, target },
                    (MountKind::Bind, AccessMode::ReadWrite) => {
                        MountEntry::BindRw { source, target }
                    }
                    (MountKind::Bind, AccessMode::ReadOnly) => {
                        MountEntry::BindRo { source, target }
                    }
                };
                mounts.push(entry);
            }
        }
        // The namespace flag is derived from the resolved demand set;
        // name resolution files are part of the baseline /etc subset.
        Service::Network(_) => {}
        Service::PulseAudio(opts) => {
            let socket = opts
                .socket
                .clone()
                .unwrap_or_else(|| ctx.runtime_dir.join("pulse/native"));
            let socket = validate_grant_source(ServiceKind::PulseAudio, &socket, ctx)?;
            mounts.push(MountEntry::BindRo {
                source: socket.clone(),
                target: socket.clone(),
            });
            env.push((
                "PULSE_SERVER".into(),
                format!("unix:{}", socket.to_string_lossy()),
            ));
        }
        Service::X11(opts) => {
            mounts.push(MountEntry::BindRoTry {
                source: "/tmp/.X11-unix".into(),
                target: "/tmp/.X11-unix".into(),
            });
            mounts.push(MountEntry::BindRoTry {
                source: ctx.host_home.join(".Xauthority"),
                target: Path::new(SANDBOX_HOME).join(".Xauthority"),
            });
            env.push((
                "DISPLAY".into(),
                opts.display.clone().unwrap_or_else(|| ":0".into()),
            ));
            env.push(("XAUTHORITY".into(), format!("{SANDBOX_HOME}/.Xauthority")));
        }
        Service::Wayland(opts) => {
            let display = opts.display.clone().unwrap_or_else(|| "wayland-0".into());
            let socket = ctx.runtime_dir.join(&display);
            mounts.push(MountEntry::BindRo {
                source: socket.clone(),
                target: socket,
            });
            env.push(("WAYLAND_DISPLAY".into(), display));
        }
        // The talk/own name lists are enforced by the bus proxy the front
        // end manages; here they only justify the socket grants.
        Service::DBus(opts) => {
            if opts.session {
                let socket = ctx.runtime_dir.join("bus");
                mounts.push(MountEntry::BindRw {
                    source: socket.clone(),
                    target: socket.clone(),
                });
                env.push((
                    "DBUS_SESSION_BUS_ADDRESS".into(),
                    format!("unix:path={}", socket.to_string_lossy()),
                ));
            }
            if opts.system {
                let socket = PathBuf::from("/run/dbus/system_bus_socket");
                mounts.push(MountEntry::BindRo {
                    source: socket.clone(),
                    target: socket,
                });
            }
        }
        Service::Gpu(opts) => {
            let devices = if opts.devices.is_empty() {
                vec![PathBuf::from("/dev/dri")]
            } else {
                opts.devices.clone()
            };
            for device in devices {
                let device = validate_grant_source(ServiceKind::Gpu, &device, ctx)?;
                mounts.push(MountEntry::BindDev {
                    source: device.clone(),
                    target: device,
                });
            }
        }
        // Pure D-Bus name grants; no mounts of their own.
        Service::Notification | Service::Systray => {}
    }
    Ok(())
}

/// Validates and normalizes one grant source path.
///
/// This is the primary defense against configuration-driven sandbox
/// escape: the path is tilde-expanded, lexically normalized, resolved
/// through symlinks over its existing prefix, and then required to sit
/// under an allowed root and outside every credential location.
pub fn validate_grant_source(
    kind: ServiceKind,
    declared: &Path,
    ctx: &CompileContext,
) -> Result<PathBuf, CompileError> {
    let expanded = expand_tilde(declared, &ctx.host_home);
    let normalized = resolve_existing_prefix(&lexical_normalize(&expanded));

    let allowed = normalized.starts_with(&ctx.instance_home)
        || normalized.starts_with(&ctx.host_home)
        || normalized.starts_with(&ctx.runtime_dir)
        || SYSTEM_WHITELIST
            .iter()
            .any(|root| normalized.starts_with(root));
    if !allowed {
        // Security violation, not an ordinary misconfiguration: keep it
        // apart from normal error logging.
        error!(
            violation = "path-escape",
            service = %kind,
            declared = %declared.display(),
            resolved = %normalized.display(),
            "Grant path escapes every allowed root"
        );
        return Err(CompileError::PathEscape {
            service: kind,
            path: declared.to_path_buf(),
        });
    }

    for sub in FORBIDDEN_HOME_SUBPATHS {
        if normalized.starts_with(ctx.host_home.join(sub)) {
            return Err(CompileError::ForbiddenPath {
                service: kind,
                path: normalized,
            });
        }
    }
    for root in FORBIDDEN_ABSOLUTE {
        if normalized.starts_with(root) {
            return Err(CompileError::ForbiddenPath {
                service: kind,
                path: normalized,
            });
        }
    }

    trace!(declared = %declared.display(), resolved = %normalized.display(), "Grant path accepted");
    Ok(normalized)
}

/// Maps a validated host path to its in-sandbox location.
///
/// Paths under either home directory land under the sandbox home; system
/// paths keep their location.
fn sandbox_target(source: &Path, ctx: &CompileContext) -> PathBuf {
    if let Ok(rel) = source.strip_prefix(&ctx.instance_home) {
        return Path::new(SANDBOX_HOME).join(rel);
    }
    if let Ok(rel) = source.strip_prefix(&ctx.host_home) {
        return Path::new(SANDBOX_HOME).join(rel);
    }
    source.to_path_buf()
}

fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    if path == Path::new("~") {
        return home.to_path_buf();
    }
    match path.strip_prefix("~") {
        Ok(rel) => home.join(rel),
        Err(_) => path.to_path_buf(),
    }
}

/// Removes `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
            Component::Prefix(_) => {}
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push("/");
    }
    normalized
}

/// Resolves symlinks over the longest existing prefix of `path`.
///
/// The grant target itself may not exist yet (e.g. a directory the
/// application will create), but an existing ancestor must not smuggle
/// the path outside the allowed roots via a symlink.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder = Vec::new();

    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }

    let Ok(mut resolved) = std::fs::canonicalize(&existing) else {
        return path.to_path_buf();
    };
    for part in remainder.into_iter().rev() {
        resolved.push(part);
    }
    resolved
}
