//! Instance management: named, persistent sandboxes.
//!
//! Each instance owns a directory under the store's base directory:
//!
//! ```text
//! {base_dir}/{name}/
//! ├── home/          # the sandbox's persistent home directory
//! ├── config.toml    # optional profile reference + service overrides
//! └── lock           # advisory launch lock (see `lock`)
//! ```
//!
//! The store validates the layout on every open so a removed or
//! half-deleted instance is refused instead of silently launched with
//! missing state. The config file is read by the resolver and written
//! only by explicit create/edit operations, never rewritten during a
//! launch.

mod lock;

pub use lock::{LaunchLock, LockMetadata};

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use crate::error::{ConfigError, InstanceError};
use crate::service::{parse_services, InstanceOverrides, ServiceKind};

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Filesystem layout of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    /// Instance root (`{base_dir}/{name}/`).
    pub root: PathBuf,
    /// Persistent home directory mounted into the sandbox.
    pub home: PathBuf,
    /// Instance configuration document.
    pub config_file: PathBuf,
    /// Advisory launch lock file.
    pub lock_file: PathBuf,
}

impl InstancePaths {
    /// Computes the paths; does not touch the filesystem.
    #[must_use]
    pub fn new(base_dir: &Path, name: &str) -> Self {
        let root = base_dir.join(name);
        Self {
            home: root.join("home"),
            config_file: root.join("config.toml"),
            lock_file: root.join("lock"),
            root,
        }
    }

    /// True if the instance root exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Creates the directory structure with restrictive permissions.
    pub fn create_directories(&self) -> Result<(), InstanceError> {
        for dir in [&self.root, &self.home] {
            fs::create_dir_all(dir).map_err(|e| InstanceError::Io {
                context: format!("failed to create directory: {}", dir.display()),
                source: e,
            })?;
            let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
            fs::set_permissions(dir, permissions).map_err(|e| InstanceError::Io {
                context: format!("failed to set permissions on: {}", dir.display()),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Checks that everything a launch needs is present.
    pub fn validate(&self) -> Result<(), String> {
        if !self.root.is_dir() {
            return Err(format!("missing instance directory: {}", self.root.display()));
        }
        if !self.home.is_dir() {
            return Err(format!("missing home directory: {}", self.home.display()));
        }
        if !self.config_file.is_file() {
            return Err(format!("missing config file: {}", self.config_file.display()));
        }
        Ok(())
    }
}

/// The instance configuration document.
///
/// This is the only piece of on-disk state the core's write paths touch,
/// and only through explicit create/save operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceConfig {
    /// Base profile to layer the overrides on, if any.
    pub profile: Option<String>,
    /// Instance-local service overrides and removals.
    pub overrides: InstanceOverrides,
}

impl InstanceConfig {
    /// Loads and validates a config document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &content)
    }

    /// Parses a config document from its text.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let doc: toml::Table = content.parse().map_err(|e: toml::de::Error| {
            ConfigError::MalformedDocument {
                path: path.to_path_buf(),
                reason: e.message().to_string(),
            }
        })?;

        for key in doc.keys() {
            if !["profile", "removed", "service"].contains(&key.as_str()) {
                return Err(ConfigError::MalformedDocument {
                    path: path.to_path_buf(),
                    reason: format!("unknown top-level key '{key}'"),
                });
            }
        }

        let profile = match doc.get("profile") {
            None => None,
            Some(toml::Value::String(name)) => Some(name.clone()),
            Some(other) => {
                return Err(ConfigError::MalformedDocument {
                    path: path.to_path_buf(),
                    reason: format!("'profile' must be a string, got {}", other.type_str()),
                });
            }
        };

        let removed = match doc.get("removed") {
            None => Vec::new(),
            Some(toml::Value::Array(items)) => {
                let mut kinds = Vec::with_capacity(items.len());
                for item in items {
                    let toml::Value::String(name) = item else {
                        return Err(ConfigError::MalformedDocument {
                            path: path.to_path_buf(),
                            reason: format!(
                                "'removed' must be an array of service names, got {}",
                                item.type_str()
                            ),
                        });
                    };
                    let Some(kind) = ServiceKind::from_name(name) else {
                        return Err(ConfigError::UnknownService {
                            path: path.to_path_buf(),
                            name: name.clone(),
                        });
                    };
                    kinds.push(kind);
                }
                kinds
            }
            Some(other) => {
                return Err(ConfigError::MalformedDocument {
                    path: path.to_path_buf(),
                    reason: format!("'removed' must be an array, got {}", other.type_str()),
                });
            }
        };

        let services = match doc.get("service") {
            None => Vec::new(),
            Some(toml::Value::Table(table)) => parse_services(path, table)?,
            Some(other) => {
                return Err(ConfigError::MalformedDocument {
                    path: path.to_path_buf(),
                    reason: format!("'service' must be a table, got {}", other.type_str()),
                });
            }
        };

        Ok(Self {
            profile,
            overrides: InstanceOverrides { services, removed },
        })
    }

    /// Serializes the config to its document form.
    #[must_use]
    pub fn to_document(&self) -> String {
        let mut doc = toml::Table::new();
        if let Some(profile) = &self.profile {
            doc.insert("profile".into(), toml::Value::String(profile.clone()));
        }
        if !self.overrides.removed.is_empty() {
            let removed = self
                .overrides
                .removed
                .iter()
                .map(|kind| toml::Value::String(kind.name().to_string()))
                .collect();
            doc.insert("removed".into(), toml::Value::Array(removed));
        }
        if !self.overrides.services.is_empty() {
            let mut service_table = toml::Table::new();
            for service in &self.overrides.services {
                service_table.insert(
                    service.kind().name().to_string(),
                    toml::Value::Table(service.to_table()),
                );
            }
            doc.insert("service".into(), toml::Value::Table(service_table));
        }
        toml::to_string_pretty(&doc).unwrap_or_default()
    }

    /// Saves the config atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), InstanceError> {
        let temp_path = path.with_extension("toml.tmp");

        let mut file = fs::File::create(&temp_path).map_err(|e| InstanceError::Io {
            context: format!("failed to create temp config: {}", temp_path.display()),
            source: e,
        })?;
        file.write_all(self.to_document().as_bytes())
            .map_err(|e| InstanceError::Io {
                context: format!("failed to write config: {}", temp_path.display()),
                source: e,
            })?;
        file.sync_all().map_err(|e| InstanceError::Io {
            context: "failed to sync config file".to_string(),
            source: e,
        })?;

        fs::rename(&temp_path, path).map_err(|e| InstanceError::Io {
            context: format!(
                "failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            source: e,
        })?;
        Ok(())
    }
}

/// A named, persistent sandbox.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub paths: InstancePaths,
    pub config: InstanceConfig,
}

/// Manages the on-disk collection of instances.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    base_dir: PathBuf,
}

impl InstanceStore {
    /// Creates a store rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The default store location.
    ///
    /// Uses `XDG_DATA_HOME` if set, otherwise `~/.local/share/nestbox`,
    /// with `/tmp` as a last resort.
    #[must_use]
    pub fn default_base_dir() -> PathBuf {
        if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg_data).join("nestbox/instances");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share/nestbox/instances");
        }
        PathBuf::from("/tmp/nestbox-instances")
    }

    /// Creates a new instance with the given config.
    #[instrument(skip(self, config))]
    pub fn create(&self, name: &str, config: &InstanceConfig) -> Result<Instance, InstanceError> {
        validate_name(name)?;

        let paths = InstancePaths::new(&self.base_dir, name);
        if paths.exists() {
            return Err(InstanceError::AlreadyExists {
                name: name.to_string(),
            });
        }

        paths.create_directories()?;
        config.save(&paths.config_file)?;

        debug!(name, root = %paths.root.display(), "Instance created");
        Ok(Instance {
            name: name.to_string(),
            paths,
            config: config.clone(),
        })
    }

    /// Opens an existing instance, refusing removed or corrupt ones.
    #[instrument(skip(self))]
    pub fn open(&self, name: &str) -> Result<Instance, InstanceError> {
        validate_name(name)?;

        let paths = InstancePaths::new(&self.base_dir, name);
        if !paths.exists() {
            return Err(InstanceError::NotFound {
                name: name.to_string(),
            });
        }

        if let Err(reason) = paths.validate() {
            return Err(InstanceError::Corrupt {
                name: name.to_string(),
                reason,
            });
        }

        let config = InstanceConfig::load(&paths.config_file)?;

        trace!(name, "Instance opened");
        Ok(Instance {
            name: name.to_string(),
            paths,
            config,
        })
    }

    /// Lists instance names, sorted.
    pub fn list(&self) -> Result<Vec<String>, InstanceError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(&self.base_dir)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path == self.base_dir || !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Returns the store's base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Instance names become directory components; keep them boring.
fn validate_name(name: &str) -> Result<(), InstanceError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(InstanceError::InvalidName {
            name: name.to_string(),
        })
    }
}
