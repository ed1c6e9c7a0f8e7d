//! Declarative sandbox capability units.
//!
//! A [`Service`] is one unit of sandbox capability: filesystem access,
//! network, audio, display server, and so on. Profiles and instance
//! configurations are ordered lists of services; everything downstream
//! (mount compilation, seccomp synthesis) is derived from them.
//!
//! The variant set is closed on purpose: adding a service kind forces an
//! exhaustive match in every place that matters (merge policy, mount
//! compilation, syscall contribution), so a new kind cannot silently fall
//! through any of the pipelines.
//!
//! # Document format
//!
//! Services are declared as TOML tables under `[service.<kind>]`:
//!
//! ```toml
//! [service.network]
//! mode = "shared"
//!
//! [service.filesystem]
//! grants = [
//!     { path = "~/Downloads", mode = "read-write" },
//!     { path = "~/Pictures", mode = "read-only" },
//! ]
//! ```
//!
//! Unknown service names and unknown options are hard parse failures. A
//! misspelled service must never result in a sandbox quietly missing
//! intended access or quietly granting unintended access.

mod profile;
mod resolve;

pub use profile::{Profile, ProfileRegistry};
pub use resolve::{resolve, InstanceOverrides, ResolvedConfig};

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Identifies a service kind independent of its options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Filesystem,
    Network,
    PulseAudio,
    X11,
    Wayland,
    DBus,
    Gpu,
    Notification,
    Systray,
}

impl ServiceKind {
    /// All kinds, in canonical declaration order.
    pub const ALL: [ServiceKind; 9] = [
        ServiceKind::Filesystem,
        ServiceKind::Network,
        ServiceKind::PulseAudio,
        ServiceKind::X11,
        ServiceKind::Wayland,
        ServiceKind::DBus,
        ServiceKind::Gpu,
        ServiceKind::Notification,
        ServiceKind::Systray,
    ];

    /// The name used in configuration documents.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Filesystem => "filesystem",
            ServiceKind::Network => "network",
            ServiceKind::PulseAudio => "pulse-audio",
            ServiceKind::X11 => "x11",
            ServiceKind::Wayland => "wayland",
            ServiceKind::DBus => "d-bus",
            ServiceKind::Gpu => "gpu",
            ServiceKind::Notification => "notification",
            ServiceKind::Systray => "systray",
        }
    }

    /// Looks a kind up by its document name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Access mode of a filesystem grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "read-only",
            AccessMode::ReadWrite => "read-write",
        }
    }
}

/// How a filesystem grant is materialized inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountKind {
    /// Bind-mount the host path.
    Bind,
    /// Fresh tmpfs at the target (no host backing).
    Tmpfs,
    /// Device bind mount (keeps device nodes usable).
    Dev,
}

impl MountKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MountKind::Bind => "bind",
            MountKind::Tmpfs => "tmpfs",
            MountKind::Dev => "dev",
        }
    }
}

/// One filesystem grant: a path, how it may be accessed, and how it is
/// mounted. Grants are ordered; later grants may shadow earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilesystemGrant {
    /// Host path. Either absolute or `~/`-relative (expanded at compile
    /// time against the caller's real home directory).
    pub path: PathBuf,
    pub mode: AccessMode,
    pub mount: MountKind,
}

impl FilesystemGrant {
    /// A plain read-write bind grant.
    #[must_use]
    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: AccessMode::ReadWrite,
            mount: MountKind::Bind,
        }
    }

    /// A read-only bind grant.
    #[must_use]
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: AccessMode::ReadOnly,
            mount: MountKind::Bind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemOptions {
    pub grants: Vec<FilesystemGrant>,
}

/// Network access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Share the host network namespace.
    Shared,
    /// Explicitly demand an isolated network namespace.
    ///
    /// Absence of a network service isolates the network anyway; stating
    /// the demand makes a contradictory grant elsewhere (e.g. X11 over
    /// TCP) a resolution error instead of a silent winner.
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    pub mode: NetworkMode,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Shared,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PulseAudioOptions {
    /// Host path of the native socket. Defaults to
    /// `$XDG_RUNTIME_DIR/pulse/native` at compile time.
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X11Options {
    /// DISPLAY value, e.g. `:0`. Defaults to `:0` at compile time.
    pub display: Option<String>,
    /// X over TCP. Requires sharing the host network namespace.
    pub tcp: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaylandOptions {
    /// WAYLAND_DISPLAY value, e.g. `wayland-0`.
    pub display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbusOptions {
    /// Grant the session bus socket.
    pub session: bool,
    /// Grant the system bus socket (read-only).
    pub system: bool,
    /// Well-known names the application may talk to.
    pub talk: Vec<String>,
    /// Well-known names the application may own.
    pub own: Vec<String>,
}

impl Default for DbusOptions {
    fn default() -> Self {
        Self {
            session: true,
            system: false,
            talk: Vec::new(),
            own: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuOptions {
    /// Device paths to expose. Defaults to `/dev/dri` at compile time.
    pub devices: Vec<PathBuf>,
}

/// One declarative unit of sandbox capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Service {
    Filesystem(FilesystemOptions),
    Network(NetworkOptions),
    PulseAudio(PulseAudioOptions),
    X11(X11Options),
    Wayland(WaylandOptions),
    DBus(DbusOptions),
    Gpu(GpuOptions),
    Notification,
    Systray,
}

/// Namespaces a service can place demands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    User,
    Pid,
    Net,
    Ipc,
    Uts,
    Cgroup,
}

impl Namespace {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Namespace::User => "user",
            Namespace::Pid => "pid",
            Namespace::Net => "network",
            Namespace::Ipc => "ipc",
            Namespace::Uts => "uts",
            Namespace::Cgroup => "cgroup",
        }
    }
}

/// Whether a service needs a namespace shared with the host or isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsAccess {
    Share,
    Isolate,
}

/// A namespace requirement asserted by one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceDemand {
    pub namespace: Namespace,
    pub access: NsAccess,
}

impl Service {
    /// The kind tag of this service.
    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        match self {
            Service::Filesystem(_) => ServiceKind::Filesystem,
            Service::Network(_) => ServiceKind::Network,
            Service::PulseAudio(_) => ServiceKind::PulseAudio,
            Service::X11(_) => ServiceKind::X11,
            Service::Wayland(_) => ServiceKind::Wayland,
            Service::DBus(_) => ServiceKind::DBus,
            Service::Gpu(_) => ServiceKind::Gpu,
            Service::Notification => ServiceKind::Notification,
            Service::Systray => ServiceKind::Systray,
        }
    }

    /// Namespace requirements this service asserts.
    ///
    /// The resolver cross-checks demands from all services; a namespace
    /// with both a Share and an Isolate demand is a configuration
    /// conflict, never a silently picked winner.
    #[must_use]
    pub fn namespace_demands(&self) -> Vec<NamespaceDemand> {
        match self {
            Service::Network(opts) => {
                let access = match opts.mode {
                    NetworkMode::Shared => NsAccess::Share,
                    NetworkMode::Isolated => NsAccess::Isolate,
                };
                vec![NamespaceDemand {
                    namespace: Namespace::Net,
                    access,
                }]
            }
            // X over TCP talks to the display server through the host
            // network; the abstract-socket transport does not.
            Service::X11(opts) if opts.tcp => vec![NamespaceDemand {
                namespace: Namespace::Net,
                access: NsAccess::Share,
            }],
            Service::Filesystem(_)
            | Service::PulseAudio(_)
            | Service::X11(_)
            | Service::Wayland(_)
            | Service::DBus(_)
            | Service::Gpu(_)
            | Service::Notification
            | Service::Systray => Vec::new(),
        }
    }

    /// Parses one `[service.<kind>]` table.
    pub fn from_table(
        doc_path: &Path,
        name: &str,
        table: &toml::Table,
    ) -> Result<Self, ConfigError> {
        let Some(kind) = ServiceKind::from_name(name) else {
            return Err(ConfigError::UnknownService {
                path: doc_path.to_path_buf(),
                name: name.to_string(),
            });
        };

        match kind {
            ServiceKind::Filesystem => {
                check_keys(kind, table, &["grants"])?;
                let grants = parse_grants(kind, table)?;
                Ok(Service::Filesystem(FilesystemOptions { grants }))
            }
            ServiceKind::Network => {
                check_keys(kind, table, &["mode"])?;
                let mode = match opt_str(kind, table, "mode")?.as_deref() {
                    None | Some("shared") => NetworkMode::Shared,
                    Some("isolated") => NetworkMode::Isolated,
                    Some(other) => {
                        return Err(invalid_value(
                            kind,
                            "mode",
                            format!("expected 'shared' or 'isolated', got '{other}'"),
                        ));
                    }
                };
                Ok(Service::Network(NetworkOptions { mode }))
            }
            ServiceKind::PulseAudio => {
                check_keys(kind, table, &["socket"])?;
                let socket = opt_str(kind, table, "socket")?
                    .map(|raw| validate_path(kind, "socket", &raw))
                    .transpose()?;
                Ok(Service::PulseAudio(PulseAudioOptions { socket }))
            }
            ServiceKind::X11 => {
                check_keys(kind, table, &["display", "tcp"])?;
                Ok(Service::X11(X11Options {
                    display: opt_str(kind, table, "display")?,
                    tcp: opt_bool(kind, table, "tcp")?.unwrap_or(false),
                }))
            }
            ServiceKind::Wayland => {
                check_keys(kind, table, &["display"])?;
                Ok(Service::Wayland(WaylandOptions {
                    display: opt_str(kind, table, "display")?,
                }))
            }
            ServiceKind::DBus => {
                check_keys(kind, table, &["session", "system", "talk", "own"])?;
                Ok(Service::DBus(DbusOptions {
                    session: opt_bool(kind, table, "session")?.unwrap_or(true),
                    system: opt_bool(kind, table, "system")?.unwrap_or(false),
                    talk: str_list(kind, table, "talk")?,
                    own: str_list(kind, table, "own")?,
                }))
            }
            ServiceKind::Gpu => {
                check_keys(kind, table, &["devices"])?;
                let devices = str_list(kind, table, "devices")?
                    .into_iter()
                    .map(|raw| validate_path(kind, "devices", &raw))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Service::Gpu(GpuOptions { devices }))
            }
            ServiceKind::Notification => {
                check_keys(kind, table, &[])?;
                Ok(Service::Notification)
            }
            ServiceKind::Systray => {
                check_keys(kind, table, &[])?;
                Ok(Service::Systray)
            }
        }
    }

    /// Serializes this service back into its document table.
    ///
    /// Round-trip guarantee: re-parsing the produced table yields a
    /// resolver-equivalent service.
    #[must_use]
    pub fn to_table(&self) -> toml::Table {
        let mut table = toml::Table::new();
        match self {
            Service::Filesystem(opts) => {
                let grants = opts
                    .grants
                    .iter()
                    .map(|grant| {
                        let mut entry = toml::Table::new();
                        entry.insert(
                            "path".into(),
                            toml::Value::String(grant.path.to_string_lossy().into_owned()),
                        );
                        entry.insert("mode".into(), toml::Value::String(grant.mode.as_str().into()));
                        entry.insert(
                            "mount".into(),
                            toml::Value::String(grant.mount.as_str().into()),
                        );
                        toml::Value::Table(entry)
                    })
                    .collect();
                table.insert("grants".into(), toml::Value::Array(grants));
            }
            Service::Network(opts) => {
                let mode = match opts.mode {
                    NetworkMode::Shared => "shared",
                    NetworkMode::Isolated => "isolated",
                };
                table.insert("mode".into(), toml::Value::String(mode.into()));
            }
            Service::PulseAudio(opts) => {
                if let Some(socket) = &opts.socket {
                    table.insert(
                        "socket".into(),
                        toml::Value::String(socket.to_string_lossy().into_owned()),
                    );
                }
            }
            Service::X11(opts) => {
                if let Some(display) = &opts.display {
                    table.insert("display".into(), toml::Value::String(display.clone()));
                }
                if opts.tcp {
                    table.insert("tcp".into(), toml::Value::Boolean(true));
                }
            }
            Service::Wayland(opts) => {
                if let Some(display) = &opts.display {
                    table.insert("display".into(), toml::Value::String(display.clone()));
                }
            }
            Service::DBus(opts) => {
                table.insert("session".into(), toml::Value::Boolean(opts.session));
                table.insert("system".into(), toml::Value::Boolean(opts.system));
                if !opts.talk.is_empty() {
                    table.insert("talk".into(), string_array(&opts.talk));
                }
                if !opts.own.is_empty() {
                    table.insert("own".into(), string_array(&opts.own));
                }
            }
            Service::Gpu(opts) => {
                if !opts.devices.is_empty() {
                    let devices = opts
                        .devices
                        .iter()
                        .map(|path| toml::Value::String(path.to_string_lossy().into_owned()))
                        .collect();
                    table.insert("devices".into(), toml::Value::Array(devices));
                }
            }
            Service::Notification | Service::Systray => {}
        }
        table
    }
}

/// Parses the `[service]` table of a document into an ordered service list.
///
/// Declaration order is preserved; it is load-bearing both for mount
/// ordering and for resolver determinism.
pub fn parse_services(doc_path: &Path, table: &toml::Table) -> Result<Vec<Service>, ConfigError> {
    let mut services = Vec::with_capacity(table.len());
    for (name, value) in table {
        let toml::Value::Table(service_table) = value else {
            return Err(ConfigError::MalformedDocument {
                path: doc_path.to_path_buf(),
                reason: format!("'service.{name}' must be a table"),
            });
        };
        services.push(Service::from_table(doc_path, name, service_table)?);
    }
    Ok(services)
}

fn string_array(items: &[String]) -> toml::Value {
    toml::Value::Array(
        items
            .iter()
            .map(|item| toml::Value::String(item.clone()))
            .collect(),
    )
}

fn invalid_value(kind: ServiceKind, option: &str, reason: String) -> ConfigError {
    ConfigError::InvalidOptionValue {
        service: kind.name().to_string(),
        option: option.to_string(),
        reason,
    }
}

fn check_keys(kind: ServiceKind, table: &toml::Table, allowed: &[&str]) -> Result<(), ConfigError> {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(ConfigError::UnknownOption {
                service: kind.name().to_string(),
                option: key.clone(),
            });
        }
    }
    Ok(())
}

fn opt_str(kind: ServiceKind, table: &toml::Table, key: &str) -> Result<Option<String>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(invalid_value(
            kind,
            key,
            format!("expected a string, got {}", other.type_str()),
        )),
    }
}

fn opt_bool(kind: ServiceKind, table: &toml::Table, key: &str) -> Result<Option<bool>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::Boolean(value)) => Ok(Some(*value)),
        Some(other) => Err(invalid_value(
            kind,
            key,
            format!("expected a boolean, got {}", other.type_str()),
        )),
    }
}

fn str_list(kind: ServiceKind, table: &toml::Table, key: &str) -> Result<Vec<String>, ConfigError> {
    match table.get(key) {
        None => Ok(Vec::new()),
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                toml::Value::String(value) => Ok(value.clone()),
                other => Err(invalid_value(
                    kind,
                    key,
                    format!("expected an array of strings, got {}", other.type_str()),
                )),
            })
            .collect(),
        Some(other) => Err(invalid_value(
            kind,
            key,
            format!("expected an array, got {}", other.type_str()),
        )),
    }
}

/// Validates a declared path: absolute or `~/`-relative, nothing else.
///
/// `~` is kept unexpanded here; expansion happens at compile time against
/// an explicit context so loading stays a pure function of the document.
fn validate_path(kind: ServiceKind, option: &str, raw: &str) -> Result<PathBuf, ConfigError> {
    if raw.is_empty() {
        return Err(invalid_value(kind, option, "path is empty".to_string()));
    }
    if raw.starts_with('/') || raw == "~" || raw.starts_with("~/") {
        Ok(PathBuf::from(raw))
    } else {
        Err(invalid_value(
            kind,
            option,
            format!("'{raw}' is not absolute (expected '/...' or '~/...')"),
        ))
    }
}

fn parse_grants(kind: ServiceKind, table: &toml::Table) -> Result<Vec<FilesystemGrant>, ConfigError> {
    let entries = match table.get("grants") {
        None => return Ok(Vec::new()),
        Some(toml::Value::Array(entries)) => entries,
        Some(other) => {
            return Err(invalid_value(
                kind,
                "grants",
                format!("expected an array of tables, got {}", other.type_str()),
            ));
        }
    };

    let mut grants = Vec::with_capacity(entries.len());
    for entry in entries {
        let toml::Value::Table(grant) = entry else {
            return Err(invalid_value(
                kind,
                "grants",
                format!("expected a table, got {}", entry.type_str()),
            ));
        };
        check_keys_named(kind, "grants", grant, &["path", "mode", "mount"])?;

        let Some(raw_path) = opt_str(kind, grant, "path")? else {
            return Err(invalid_value(kind, "grants", "grant is missing 'path'".into()));
        };
        let path = validate_path(kind, "grants", &raw_path)?;

        let mode = match opt_str(kind, grant, "mode")?.as_deref() {
            None | Some("read-write") => AccessMode::ReadWrite,
            Some("read-only") => AccessMode::ReadOnly,
            Some(other) => {
                return Err(invalid_value(
                    kind,
                    "grants",
                    format!("expected mode 'read-only' or 'read-write', got '{other}'"),
                ));
            }
        };

        let mount = match opt_str(kind, grant, "mount")?.as_deref() {
            None | Some("bind") => MountKind::Bind,
            Some("tmpfs") => MountKind::Tmpfs,
            Some("dev") => MountKind::Dev,
            Some(other) => {
                return Err(invalid_value(
                    kind,
                    "grants",
                    format!("expected mount 'bind', 'tmpfs' or 'dev', got '{other}'"),
                ));
            }
        };

        grants.push(FilesystemGrant { path, mode, mount });
    }
    Ok(grants)
}

fn check_keys_named(
    kind: ServiceKind,
    option: &str,
    table: &toml::Table,
    allowed: &[&str],
) -> Result<(), ConfigError> {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(invalid_value(
                kind,
                option,
                format!("unknown grant field '{key}'"),
            ));
        }
    }
    Ok(())
}
