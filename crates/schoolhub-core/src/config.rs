//! Configuration management for SchoolHub.
//!
//! Loads configuration from ${SCHOOLHUB_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use schoolhub_types::Profile;
use serde::{Deserialize, Serialize};

use crate::session::SessionOptions;

/// Returns the default config template with comments.
///
/// Embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Merges user config values into the default template.
///
/// New comments/sections from the template stay present while the user's
/// values are preserved.
fn merge_with_template(user_config: &str) -> Result<String> {
    use toml_edit::DocumentMut;

    let mut doc: DocumentMut = default_config_template()
        .parse()
        .context("Failed to parse default config template")?;

    let user_doc: DocumentMut = user_config.parse().context("Failed to parse user config")?;

    merge_items(doc.as_table_mut(), user_doc.as_table());

    Ok(doc.to_string())
}

/// Recursively merges items from source table into target table.
fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

pub mod paths {
    //! Path resolution for SchoolHub configuration and data directories.
    //!
    //! SCHOOLHUB_HOME resolution order:
    //! 1. SCHOOLHUB_HOME environment variable (if set)
    //! 2. ~/.config/schoolhub (default)
    //! 3. ./.schoolhub when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the SchoolHub home directory.
    pub fn schoolhub_home() -> PathBuf {
        if let Ok(home) = std::env::var("SCHOOLHUB_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".schoolhub"),
            |h| h.join(".config").join("schoolhub"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        schoolhub_home().join("config.toml")
    }

    /// Returns the path of the persisted sign-in session.
    pub fn session_path() -> PathBuf {
        schoolhub_home().join("session.json")
    }

    /// Returns the directory for log files.
    pub fn logs_dir() -> PathBuf {
        schoolhub_home().join("logs")
    }
}

/// Firebase project settings. Unset values fall back to env vars or defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirebaseConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub auth_base_url: Option<String>,
    pub token_base_url: Option<String>,
    pub firestore_base_url: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Collection holding profile documents
    pub profiles_collection: String,

    /// Backend project settings
    pub firebase: FirebaseConfig,
}

impl Config {
    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Session manager options derived from this config.
    pub fn session_options(&self) -> SessionOptions {
        let collection = self.profiles_collection.trim();
        if collection.is_empty() {
            SessionOptions::default()
        } else {
            SessionOptions::new(collection)
        }
    }

    /// Writes the default config template to `path`.
    ///
    /// # Errors
    /// Fails if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Saves the Firebase project id and API key to a specific config file path.
    ///
    /// Creates the file with default template if it doesn't exist.
    /// If file exists, merges user values into the latest template.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or written.
    pub fn save_project_to(path: &Path, project_id: &str, api_key: Option<&str>) -> Result<()> {
        use toml_edit::{DocumentMut, value};

        let contents = if path.exists() {
            let user_config = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            merge_with_template(&user_config)?
        } else {
            default_config_template().to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        doc["firebase"]["project_id"] = value(project_id);
        if let Some(key) = api_key {
            doc["firebase"]["api_key"] = value(key);
        }

        Self::write_config(path, &doc.to_string())
    }

    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profiles_collection: Profile::DEFAULT_COLLECTION.to_string(),
            firebase: FirebaseConfig::default(),
        }
    }
}
