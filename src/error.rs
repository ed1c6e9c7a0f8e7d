//! Error types for nestbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich
//! diagnostics. Every fatal error names the offending service, option or
//! path so a misconfiguration is diagnosable without reading source.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::service::ServiceKind;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Profile or instance document failed to parse
    #[error("configuration error")]
    #[diagnostic(code(nestbox::config))]
    Config(#[from] ConfigError),

    /// Profile and overrides could not be merged
    #[error("configuration could not be resolved")]
    #[diagnostic(code(nestbox::resolve))]
    Resolve(#[from] ResolveError),

    /// Resolved configuration could not be compiled into a launch plan
    #[error("launch plan compilation failed")]
    #[diagnostic(code(nestbox::compile))]
    Compile(#[from] CompileError),

    /// Seccomp program synthesis failed
    #[error("seccomp filter synthesis failed")]
    #[diagnostic(code(nestbox::seccomp))]
    Seccomp(#[from] SeccompError),

    /// Containment primitive could not be spawned or supervised
    #[error("sandbox launch failed")]
    #[diagnostic(code(nestbox::launch))]
    Launch(#[from] LaunchError),

    /// Helper channel fault
    #[error("helper protocol error")]
    #[diagnostic(code(nestbox::helper))]
    Protocol(#[from] ProtocolError),

    /// Instance store fault
    #[error("instance error")]
    #[diagnostic(code(nestbox::instance))]
    Instance(#[from] InstanceError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(nestbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors produced while loading profile or instance documents.
///
/// These are always fatal to the load in question and never partially
/// applied: a misspelled service must not leave a sandbox quietly missing
/// intended access or quietly granting unintended access.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// The document is not valid TOML or has the wrong top-level shape.
    #[error("malformed document {}: {reason}", path.display())]
    #[diagnostic(code(nestbox::config::malformed))]
    MalformedDocument { path: PathBuf, reason: String },

    /// A service table names a service kind that does not exist.
    #[error("unknown service '{name}' in {}", path.display())]
    #[diagnostic(
        code(nestbox::config::unknown_service),
        help("known services: filesystem, network, pulse-audio, x11, wayland, d-bus, gpu, notification, systray")
    )]
    UnknownService { path: PathBuf, name: String },

    /// A service table carries an option its kind does not define.
    #[error("service '{service}' has no option '{option}'")]
    #[diagnostic(code(nestbox::config::unknown_option))]
    UnknownOption { service: String, option: String },

    /// An option value failed validation.
    #[error("invalid value for '{service}.{option}': {reason}")]
    #[diagnostic(code(nestbox::config::invalid_value))]
    InvalidOptionValue {
        service: String,
        option: String,
        reason: String,
    },

    /// The document could not be read at all.
    #[error("failed to read {}", path.display())]
    #[diagnostic(code(nestbox::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while merging a profile with instance overrides.
#[derive(Error, Debug, Diagnostic)]
pub enum ResolveError {
    /// Two services assert mutually exclusive namespace requirements.
    #[error(
        "conflicting namespace requirements: service '{share_service}' shares the \
         {namespace} namespace while service '{isolate_service}' isolates it"
    )]
    #[diagnostic(
        code(nestbox::resolve::conflict),
        help("remove one of the two services or align their namespace options")
    )]
    Conflict {
        namespace: &'static str,
        share_service: ServiceKind,
        isolate_service: ServiceKind,
    },

    /// The instance references a profile the registry does not know.
    #[error("profile '{name}' not found on the search path")]
    #[diagnostic(code(nestbox::resolve::unknown_profile))]
    UnknownProfile { name: String },
}

/// Errors produced by the namespace/mount compiler.
#[derive(Error, Debug, Diagnostic)]
pub enum CompileError {
    /// A grant path escapes every allowed root after normalization.
    ///
    /// This is treated as a security violation, not an ordinary
    /// misconfiguration, and is logged distinctly by the compiler.
    #[error("path '{}' of service '{service}' escapes the instance home and the system whitelist", path.display())]
    #[diagnostic(
        code(nestbox::compile::path_escape),
        help("grants must stay under the instance home, your home directory, or a whitelisted system root")
    )]
    PathEscape { service: ServiceKind, path: PathBuf },

    /// A grant path resolves into a credential location.
    #[error("path '{}' of service '{service}' is under a forbidden credential path", path.display())]
    #[diagnostic(code(nestbox::compile::forbidden_path))]
    ForbiddenPath { service: ServiceKind, path: PathBuf },

    /// Environment required for compilation is missing on the host.
    #[error("host environment is incomplete: {reason}")]
    #[diagnostic(code(nestbox::compile::environment))]
    Environment { reason: String },
}

/// Errors produced by the seccomp filter synthesizer.
#[derive(Error, Debug, Diagnostic)]
pub enum SeccompError {
    /// The filter backend rejected the rule set.
    #[error("seccomp filter construction failed: {reason}")]
    #[diagnostic(code(nestbox::seccomp::backend))]
    Backend { reason: String },

    /// Running on an architecture the synthesizer has no table for.
    #[error("unsupported architecture for seccomp synthesis")]
    #[diagnostic(code(nestbox::seccomp::arch))]
    UnsupportedArchitecture,

    /// The compiled program could not be exported into a descriptor.
    #[error("failed to export seccomp program: {context}")]
    #[diagnostic(code(nestbox::seccomp::export))]
    Export {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while spawning or supervising the containment primitive.
///
/// Launch failures are reported to the caller and never retried
/// automatically: partial namespace setup can leave inconsistent kernel
/// state, so a blind retry is not safe.
#[derive(Error, Debug, Diagnostic)]
pub enum LaunchError {
    /// The primitive executable is missing or not runnable.
    #[error("containment primitive '{}' could not be spawned", path.display())]
    #[diagnostic(
        code(nestbox::launch::spawn),
        help("is bubblewrap installed and on the expected path?")
    )]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the sandboxed process failed.
    #[error("failed to wait for sandboxed process: {context}")]
    #[diagnostic(code(nestbox::launch::wait))]
    Wait {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Signal delivery to the sandboxed process failed.
    #[error("failed to signal sandboxed process: {context}")]
    #[diagnostic(code(nestbox::launch::signal))]
    Signal { context: String },
}

/// Helper channel faults.
///
/// These degrade the dynamic-grant feature or close the session; they do
/// not retroactively kill an already-running sandboxed application.
#[derive(Error, Debug, Diagnostic)]
pub enum ProtocolError {
    /// The helper did not answer within the caller's deadline.
    #[error("helper did not respond within {waited_ms}ms")]
    #[diagnostic(code(nestbox::helper::timeout))]
    HelperTimeout { waited_ms: u64 },

    /// A response arrived tagged with an identifier we never sent.
    #[error("helper response id {got} does not match outstanding request id {expected}")]
    #[diagnostic(code(nestbox::helper::desync))]
    ProtocolDesync { expected: u64, got: u64 },

    /// A request was issued while another is still awaiting its response.
    #[error("a request is already awaiting acknowledgment")]
    #[diagnostic(
        code(nestbox::helper::pending),
        help("the helper channel is non-pipelined; wait for the outstanding response first")
    )]
    RequestAlreadyPending,

    /// The session is not in a state that accepts requests.
    #[error("helper session is {state} and cannot accept requests")]
    #[diagnostic(code(nestbox::helper::state))]
    NotReady { state: &'static str },

    /// The channel reached end-of-stream or was closed.
    #[error("helper channel is closed")]
    #[diagnostic(code(nestbox::helper::closed))]
    ChannelClosed,

    /// A frame violated the wire format.
    #[error("malformed helper message: {reason}")]
    #[diagnostic(code(nestbox::helper::malformed))]
    Malformed { reason: String },

    /// The helper rejected a request.
    #[error("helper rejected request: {message}")]
    #[diagnostic(code(nestbox::helper::rejected))]
    Rejected { message: String },

    /// Transport-level I/O failure.
    #[error("helper channel I/O failed: {context}")]
    #[diagnostic(code(nestbox::helper::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Instance store faults.
#[derive(Error, Debug, Diagnostic)]
pub enum InstanceError {
    /// No instance directory with this name.
    #[error("instance '{name}' does not exist")]
    #[diagnostic(code(nestbox::instance::not_found))]
    NotFound { name: String },

    /// The instance directory exists but is unusable.
    #[error("instance '{name}' is corrupt: {reason}")]
    #[diagnostic(
        code(nestbox::instance::corrupt),
        help("the instance may have been partially removed; recreate it or delete the directory")
    )]
    Corrupt { name: String, reason: String },

    /// Another launch holds the instance's advisory lock.
    #[error("instance '{name}' is already running")]
    #[diagnostic(code(nestbox::instance::already_running))]
    AlreadyRunning { name: String },

    /// The name would not map to a safe directory component.
    #[error("'{name}' is not a valid instance name")]
    #[diagnostic(
        code(nestbox::instance::invalid_name),
        help("names must be non-empty and free of path separators")
    )]
    InvalidName { name: String },

    /// An instance with this name already exists.
    #[error("instance '{name}' already exists")]
    #[diagnostic(code(nestbox::instance::exists))]
    AlreadyExists { name: String },

    /// The instance config document failed to parse.
    #[error("instance config error")]
    #[diagnostic(code(nestbox::instance::config))]
    Config(#[from] ConfigError),

    /// Filesystem-level failure in the store.
    #[error("instance I/O failed: {context}")]
    #[diagnostic(code(nestbox::instance::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
