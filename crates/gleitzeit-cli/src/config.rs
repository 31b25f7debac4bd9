//! Configuration file management for gleitzeit.
//!
//! Provides a TOML-based config file at `~/.config/gleitzeit/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gleitzeit_core::registry::ProtocolSpec;
use gleitzeit_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub engine: EngineSection,
    /// Protocol catalogues registered when `serve` starts.
    #[serde(default)]
    pub protocols: Vec<ProtocolEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// `postgres`, `file`, or `memory`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Root directory for the `file` backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

fn default_backend() -> String {
    "postgres".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            default_timeout_secs: default_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_max_concurrent() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEntry {
    /// `name/version`, e.g. `llm/v1`.
    pub id: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub open_world: bool,
}

impl ProtocolEntry {
    pub fn to_spec(&self) -> ProtocolSpec {
        let mut spec = ProtocolSpec::with_methods(
            &self.id,
            &self.methods.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        spec.open_world = self.open_world;
        spec
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the gleitzeit config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/gleitzeit` or
/// `~/.config/gleitzeit`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gleitzeit");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("gleitzeit")
}

/// Return the path to the gleitzeit config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct GleitzeitConfig {
    pub db_config: DbConfig,
    pub store: StoreSection,
    pub engine: EngineSection,
    pub protocols: Vec<ProtocolEntry>,
}

impl GleitzeitConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > env var > config file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let database_url = cli_db_url
            .map(str::to_owned)
            .or_else(|| std::env::var("GLEITZEIT_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

        Ok(Self {
            db_config: DbConfig::new(database_url),
            store: file
                .as_ref()
                .map(|f| f.store.clone())
                .unwrap_or_default(),
            engine: file
                .as_ref()
                .map(|f| f.engine.clone())
                .unwrap_or_default(),
            protocols: file.map(|f| f.protocols).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_roundtrip() {
        let cfg = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://localhost:5432/gleitzeit".to_owned(),
            },
            store: StoreSection {
                backend: "file".to_owned(),
                path: Some("/var/lib/gleitzeit".to_owned()),
            },
            engine: EngineSection::default(),
            protocols: vec![ProtocolEntry {
                id: "llm/v1".to_owned(),
                methods: vec!["chat".to_owned()],
                open_world: false,
            }],
        };
        let serialized = toml::to_string_pretty(&cfg).expect("should serialize");
        let parsed: ConfigFile = toml::from_str(&serialized).expect("should parse");
        assert_eq!(parsed.store.backend, "file");
        assert_eq!(parsed.protocols.len(), 1);
        assert_eq!(parsed.engine.max_concurrent_tasks, 8);
    }

    #[test]
    fn minimal_config_defaults() {
        let parsed: ConfigFile = toml::from_str(
            r#"
[database]
url = "postgresql://localhost:5432/gleitzeit"
"#,
        )
        .expect("should parse");
        assert_eq!(parsed.store.backend, "postgres");
        assert!(parsed.protocols.is_empty());
        assert_eq!(parsed.engine.default_timeout_secs, 300);
    }

    #[test]
    fn protocol_entry_to_spec() {
        let entry = ProtocolEntry {
            id: "tools/v1".to_owned(),
            methods: vec!["run".to_owned()],
            open_world: true,
        };
        let spec = entry.to_spec();
        assert_eq!(spec.id, "tools/v1");
        assert!(spec.open_world);
        assert!(spec.methods.contains_key("run"));
    }
}
