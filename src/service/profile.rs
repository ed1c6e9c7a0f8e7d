//! Profiles: reusable, read-only service templates.
//!
//! A profile is a named ordered set of services plus desktop metadata for
//! a class of application (`web-browser`, `chat-client`, ...). Profiles
//! are TOML documents discovered on a search path; a user-level profile
//! shadows a system profile of the same name.
//!
//! The registry is loaded once per process and shared read-only across
//! concurrent instance launches, so no locking is needed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::error::ConfigError;
use crate::service::{parse_services, Service};

/// A reusable, read-only named template of services.
///
/// Immutable once loaded; instances layer their overrides on top of it
/// but never mutate it.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Profile name (the document's file stem).
    pub name: String,
    /// Services in declaration order.
    pub services: Vec<Service>,
    /// Desktop entry this profile is associated with, if any.
    pub desktop_entry: Option<String>,
    /// MIME types the application class handles. Carried as metadata for
    /// the front ends; the core does not consume it.
    pub mime_types: Vec<String>,
}

impl Profile {
    /// Loads a profile document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the offending service/option on any
    /// schema violation. Parsing is all-or-nothing.
    pub fn load(path: &Path, name: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let doc: toml::Table = content.parse().map_err(|e: toml::de::Error| {
            ConfigError::MalformedDocument {
                path: path.to_path_buf(),
                reason: e.message().to_string(),
            }
        })?;

        for key in doc.keys() {
            if !["desktop-entry", "mime-types", "service"].contains(&key.as_str()) {
                return Err(ConfigError::MalformedDocument {
                    path: path.to_path_buf(),
                    reason: format!("unknown top-level key '{key}'"),
                });
            }
        }

        let desktop_entry = match doc.get("desktop-entry") {
            None => None,
            Some(toml::Value::String(value)) => Some(value.clone()),
            Some(other) => {
                return Err(ConfigError::MalformedDocument {
                    path: path.to_path_buf(),
                    reason: format!("'desktop-entry' must be a string, got {}", other.type_str()),
                });
            }
        };

        let mime_types = match doc.get("mime-types") {
            None => Vec::new(),
            Some(toml::Value::Array(items)) => {
                let mut types = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        toml::Value::String(value) => types.push(value.clone()),
                        other => {
                            return Err(ConfigError::MalformedDocument {
                                path: path.to_path_buf(),
                                reason: format!(
                                    "'mime-types' must be an array of strings, got {}",
                                    other.type_str()
                                ),
                            });
                        }
                    }
                }
                types
            }
            Some(other) => {
                return Err(ConfigError::MalformedDocument {
                    path: path.to_path_buf(),
                    reason: format!("'mime-types' must be an array, got {}", other.type_str()),
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
            name: name.to_string(),
            services,
            desktop_entry,
            mime_types,
        })
    }
}

/// Read-only registry of profiles resolved from a search path.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    /// The default search path: user profiles first, then system ones.
    #[must_use]
    pub fn default_search_path() -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            dirs.push(PathBuf::from(xdg_data).join("nestbox/profiles"));
        } else if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join(".local/share/nestbox/profiles"));
        }

        dirs.push(PathBuf::from("/usr/share/nestbox/profiles"));
        dirs
    }

    /// Loads every `*.toml` document found on the search path.
    ///
    /// Earlier directories take priority: on a name collision the profile
    /// from the earlier (user) directory wins and the later one is
    /// ignored. A document that fails to parse fails the whole load; a
    /// half-usable registry would make launches depend on which profile
    /// happened to be requested.
    pub fn load(search_path: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut profiles = BTreeMap::new();

        for dir in search_path {
            if !dir.is_dir() {
                trace!(dir = %dir.display(), "Profile directory absent, skipping");
                continue;
            }

            for entry in WalkDir::new(dir)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };

                if profiles.contains_key(name) {
                    warn!(
                        name,
                        path = %path.display(),
                        "Profile shadowed by an earlier search-path entry"
                    );
                    continue;
                }

                let profile = Profile::load(path, name)?;
                trace!(name, services = profile.services.len(), "Loaded profile");
                profiles.insert(name.to_string(), profile);
            }
        }

        debug!(count = profiles.len(), "Profile registry loaded");
        Ok(Self { profiles })
    }

    /// Looks a profile up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// All known profile names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Number of loaded profiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Returns true if no profiles were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_profile(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(format!("{name}.toml")), content).expect("failed to write profile");
    }

    #[test]
    fn test_load_profile_document() {
        let dir = TempDir::new().expect("failed to create temp dir");
        write_profile(
            dir.path(),
            "web-browser",
            r#"
            desktop-entry = "firefox.desktop"
            mime-types = ["text/html", "x-scheme-handler/https"]

            [service.network]
            mode = "shared"

            [service.filesystem]
            grants = [{ path = "~/Downloads", mode = "read-write" }]
            "#,
        );

        let profile = Profile::load(&dir.path().join("web-browser.toml"), "web-browser")
            .expect("profile must load");

        assert_eq!(profile.name, "web-browser");
        assert_eq!(profile.desktop_entry.as_deref(), Some("firefox.desktop"));
        assert_eq!(profile.mime_types.len(), 2);
        assert_eq!(profile.services.len(), 2);
    }

    #[test]
    fn test_malformed_profile_rejected() {
        let dir = TempDir::new().expect("failed to create temp dir");
        write_profile(dir.path(), "broken", "not valid toml [[[");

        let result = Profile::load(&dir.path().join("broken.toml"), "broken");
        assert!(matches!(result, Err(ConfigError::MalformedDocument { .. })));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let dir = TempDir::new().expect("failed to create temp dir");
        write_profile(dir.path(), "odd", "launch-speed = \"fast\"\n");

        let result = Profile::load(&dir.path().join("odd.toml"), "odd");
        assert!(matches!(result, Err(ConfigError::MalformedDocument { .. })));
    }

    #[test]
    fn test_registry_user_overrides_system() {
        let user_dir = TempDir::new().expect("failed to create temp dir");
        let system_dir = TempDir::new().expect("failed to create temp dir");

        write_profile(user_dir.path(), "editor", "[service.wayland]\n");
        write_profile(system_dir.path(), "editor", "[service.x11]\n");
        write_profile(system_dir.path(), "player", "[service.pulse-audio]\n");

        let registry = ProfileRegistry::load(&[
            user_dir.path().to_path_buf(),
            system_dir.path().to_path_buf(),
        ])
        .expect("registry must load");

        assert_eq!(registry.len(), 2);
        let editor = registry.get("editor").expect("editor profile");
        assert_eq!(
            editor.services[0].kind(),
            crate::service::ServiceKind::Wayland,
            "user profile must shadow the system one"
        );
        assert!(registry.get("player").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_registry_missing_directories_are_fine() {
        let registry = ProfileRegistry::load(&[PathBuf::from("/nonexistent/nestbox-profiles")])
            .expect("absent directories are not an error");
        assert!(registry.is_empty());
    }
}
