//! Persisted run configuration: API key, sheet location, and the site table

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = ".pagespeed_analyzer_config.json";
const DEFAULT_WORKSHEET: &str = "Sheet1";

/// One row of the site table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    pub name: String,
    pub url: String,
    /// Column letters receiving the mobile score
    #[serde(rename = "spColumn")]
    pub mobile_column: String,
    /// Column letters receiving the desktop score
    #[serde(rename = "pcColumn")]
    pub desktop_column: String,
}

/// Everything a run needs, passed by value into the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    pub api_key: String,
    /// Path to the service account JSON key file
    pub credentials_path: String,
    pub spreadsheet_url: String,
    pub worksheet_name: String,
    #[serde(rename = "urls")]
    pub sites: Vec<SiteEntry>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            credentials_path: String::new(),
            spreadsheet_url: String::new(),
            worksheet_name: DEFAULT_WORKSHEET.to_string(),
            sites: vec![],
        }
    }
}

impl RunConfiguration {
    /// Append a site to the end of the table
    pub fn add_site(&mut self, site: SiteEntry) {
        self.sites.push(site);
    }

    /// Remove the site at `index` (0-based)
    pub fn remove_site(&mut self, index: usize) -> Result<SiteEntry> {
        if index >= self.sites.len() {
            anyhow::bail!(
                "No site at index {} ({} configured)",
                index,
                self.sites.len()
            );
        }
        Ok(self.sites.remove(index))
    }
}

/// Result of loading the configuration file.
///
/// A `warning` is set when the file existed but could not be used; `config`
/// then holds the defaults so the caller can carry on.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RunConfiguration,
    pub warning: Option<String>,
}

/// Reads and writes the configuration file
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store, defaulting to the per-user file in the home directory
    pub fn new(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(CONFIG_FILE_NAME)
        });
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> LoadedConfig {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no config file, using defaults");
            return LoadedConfig {
                config: RunConfiguration::default(),
                warning: None,
            };
        }

        match self.read() {
            Ok(config) => LoadedConfig {
                config,
                warning: None,
            },
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "falling back to default config");
                LoadedConfig {
                    config: RunConfiguration::default(),
                    warning: Some(format!("Failed to load configuration: {:#}", e)),
                }
            }
        }
    }

    fn read(&self) -> Result<RunConfiguration> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", self.path.display()))?;
        Ok(config)
    }

    pub fn save(&self, config: &RunConfiguration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        let json = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), sites = config.sites.len(), "saved config");
        Ok(())
    }
}
