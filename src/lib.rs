//! nestbox — launch desktop applications inside isolated Linux namespaces.
//!
//! Each sandboxed application runs under a named *instance* with its own
//! persistent home directory and a declarative TOML configuration of
//! *services* (filesystem grants, network, audio, display server, ...).
//! The configuration is resolved against an optional *profile*, compiled
//! into the exact argument vector and inherited descriptors a
//! bubblewrap-compatible containment primitive needs, and the resulting
//! process is supervised over a small bidirectional protocol with a
//! helper running inside the sandbox.
//!
//! # Pipeline
//!
//! ```text
//! Profile + instance overrides
//!         │ service::resolve
//!         ▼
//! ResolvedConfig ─┬─ sandbox::compile_mounts ─► LaunchFragment ─┐
//!                 └─ sandbox::synthesize ─────► SeccompProgram ─┤
//!                                                               ▼
//!                                                          LaunchPlan
//!                                                               │
//!                                           sandbox::Supervisor ▼
//!                                     containment primitive + helper
//!                                                               │
//!                                           helper::HelperSession
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nestbox::instance::InstanceStore;
//! use nestbox::sandbox::{Launcher, LauncherConfig};
//! use nestbox::service::ProfileRegistry;
//!
//! fn main() -> miette::Result<()> {
//!     let registry = ProfileRegistry::load(&ProfileRegistry::default_search_path())
//!         .map_err(nestbox::Error::from)?;
//!     let store = InstanceStore::new(InstanceStore::default_base_dir());
//!     let launcher = Launcher::new(registry, store, LauncherConfig::default());
//!
//!     let mut sandbox = launcher.launch("browser", &["firefox".to_string()])?;
//!     let exit = sandbox.wait()?;
//!     println!("sandbox finished with {exit}");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod helper;
pub mod instance;
pub mod sandbox;
pub mod service;

// Re-export commonly used types
pub use error::{Error, Result};
pub use sandbox::{Launcher, LauncherConfig, SandboxExit, SandboxHandle};
pub use service::{Profile, ProfileRegistry, ResolvedConfig, Service, ServiceKind};
