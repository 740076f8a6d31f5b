//! Batch configuration module.
//!
//! Handles loading, validating, and merging `batcher.toml`. Configuration is
//! layered: stock defaults, then the user file, then command-line overrides.
//! Each layer is a sparse TOML table merged onto the one below it.
//!
//! ## Config File Location
//!
//! `batcher.toml` is looked up in the source directory. An explicit file can
//! be given with `--config`, in which case it must exist.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! output_dir = "output"        # Where exported files go
//! # pipeline = "pipeline.json" # Saved pipeline, replaces the sections below
//!
//! [export]
//! file_extension = "png"
//! overwrite = "rename_new"     # skip | replace | rename_new
//!
//! [rename]
//! pattern = "[image name]"
//! rename_files = true
//! rename_folders = false
//!
//! [conditions]
//! matching_file_extension = false
//!
//! # [conditions.name_filter]
//! # text = "draft"
//! # match_mode = "does_not_contain"
//! # ignore_case = true
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::builtins::{
    self, MatchMode, OverwriteMode, export_dict, matching_file_extension_dict, matching_text_dict, rename_dict,
};
use crate::commands::{CommandDict, CommandGroup, RegistryError, load_pipeline};
use crate::pattern::PatternError;
use crate::renamer::ItemRenamer;

pub const CONFIG_FILE_NAME: &str = "batcher.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Invalid rename pattern: {0}")]
    Pattern(#[from] PatternError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] RegistryError),
}

/// Batch configuration loaded from `batcher.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Directory exported files are written to, relative to the working
    /// directory.
    pub output_dir: String,
    /// Saved pipeline JSON. Relative paths resolve against the source
    /// directory. When set, `[rename]` and `[conditions]` are not used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    pub export: ExportConfig,
    pub rename: RenameConfig,
    pub conditions: ConditionsConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            output_dir: "output".to_string(),
            pipeline: None,
            export: ExportConfig::default(),
            rename: RenameConfig::default(),
            conditions: ConditionsConfig::default(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::Validation("output_dir must not be empty".into()));
        }
        if self.export.extension().is_empty() {
            return Err(ConfigError::Validation("export.file_extension must not be empty".into()));
        }
        if let Some(filter) = &self.conditions.name_filter {
            if filter.match_mode == MatchMode::Regex && regex::Regex::new(&filter.text).is_err() {
                return Err(ConfigError::Validation(format!(
                    "conditions.name_filter.text is not a valid regex: {}",
                    filter.text
                )));
            }
        }
        ItemRenamer::new(&self.rename.pattern, self.rename.rename_files, self.rename.rename_folders)?;
        Ok(())
    }

    pub fn pipeline_path(&self, source: &Path) -> Option<PathBuf> {
        self.pipeline.as_ref().map(|p| source.join(p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    /// Extension of exported files, with or without the leading dot.
    pub file_extension: String,
    pub overwrite: OverwriteMode,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            file_extension: builtins::DEFAULT_FILE_EXTENSION.to_string(),
            overwrite: OverwriteMode::default(),
        }
    }
}

impl ExportConfig {
    /// The file extension without the leading dot.
    pub fn extension(&self) -> &str {
        self.file_extension.trim().trim_start_matches('.')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenameConfig {
    pub pattern: String,
    pub rename_files: bool,
    pub rename_folders: bool,
}

impl Default for RenameConfig {
    fn default() -> Self {
        Self {
            pattern: builtins::DEFAULT_PATTERN.to_string(),
            rename_files: true,
            rename_folders: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConditionsConfig {
    /// Only process files whose extension matches `export.file_extension`.
    pub matching_file_extension: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_filter: Option<NameFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameFilter {
    pub text: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub ignore_case: bool,
}

/// Values given on the command line. They override the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub output_dir: Option<String>,
    pub pattern: Option<String>,
    pub file_extension: Option<String>,
}

impl ConfigOverrides {
    /// The overrides as a sparse TOML table.
    pub fn to_toml(&self) -> toml::Value {
        let mut root = toml::Table::new();
        if let Some(dir) = &self.output_dir {
            root.insert("output_dir".into(), dir.clone().into());
        }
        if let Some(pattern) = &self.pattern {
            let mut rename = toml::Table::new();
            rename.insert("pattern".into(), pattern.clone().into());
            root.insert("rename".into(), rename.into());
        }
        if let Some(ext) = &self.file_extension {
            let mut export = toml::Table::new();
            export.insert("file_extension".into(), ext.clone().into());
            root.insert("export".into(), export.into());
        }
        toml::Value::Table(root)
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(BatchConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge the overlays onto `base` in order, then deserialize and validate.
pub fn resolve_config<I>(base: toml::Value, overlays: I) -> Result<BatchConfig, ConfigError>
where
    I: IntoIterator<Item = toml::Value>,
{
    let merged = overlays.into_iter().fold(base, merge_toml);
    let config: BatchConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the config for a source directory.
///
/// Uses `explicit` if given (which must exist), otherwise `batcher.toml` in
/// `source` if present. Command-line overrides are applied last.
pub fn load_config(
    source: &Path,
    explicit: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<BatchConfig, ConfigError> {
    let user = match explicit {
        Some(path) => Some(toml::from_str(&fs::read_to_string(path)?)?),
        None => load_raw_config(&source.join(CONFIG_FILE_NAME))?,
    };
    resolve_config(stock_defaults_value(), user.into_iter().chain([overrides.to_toml()]))
}

// =============================================================================
// Pipeline
// =============================================================================

/// The built-in actions the config describes: rename, then export.
pub fn default_actions(config: &BatchConfig) -> Vec<CommandDict> {
    vec![
        rename_dict(&config.rename.pattern, config.rename.rename_files, config.rename.rename_folders),
        export_dict(config.export.extension(), config.export.overwrite),
    ]
}

pub fn default_conditions(config: &BatchConfig) -> Vec<CommandDict> {
    let mut conditions = Vec::new();
    if config.conditions.matching_file_extension {
        conditions.push(matching_file_extension_dict());
    }
    if let Some(filter) = &config.conditions.name_filter {
        conditions.push(matching_text_dict(filter.match_mode, &filter.text, filter.ignore_case));
    }
    conditions
}

/// Build the action and condition registries for a run.
///
/// Both registries are created with the configured commands as their
/// initial commands. A configured pipeline file replaces their contents.
pub fn build_pipeline(config: &BatchConfig, source: &Path) -> Result<(CommandGroup, CommandGroup), ConfigError> {
    let mut actions = CommandGroup::create("actions", default_actions(config))?;
    let mut conditions = CommandGroup::create("conditions", default_conditions(config))?;
    if let Some(path) = config.pipeline_path(source) {
        load_pipeline(&path, &mut actions, &mut conditions)?;
    }
    Ok((actions, conditions))
}

/// Returns a fully-commented stock `batcher.toml` with all keys and
/// explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Batcher Configuration
# =====================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# This file is read from the source directory as batcher.toml, or from the
# path given with --config. Command-line flags override it.
# Unknown keys will cause an error.

# Directory exported files are written to.
output_dir = "output"

# Saved pipeline (JSON written by gen-pipeline). When set, it replaces the
# [rename] and [conditions] sections. Relative to the source directory.
# pipeline = "pipeline.json"

# ---------------------------------------------------------------------------
# Export
# ---------------------------------------------------------------------------
[export]
# Extension of exported files.
file_extension = "png"

# What to do when the output file already exists:
#   skip       - keep the existing file
#   replace    - overwrite it
#   rename_new - export as "name (1).png"
overwrite = "rename_new"

# ---------------------------------------------------------------------------
# Rename
# ---------------------------------------------------------------------------
[rename]
# Name pattern. Run `batcher fields` for the available fields, e.g.
#   "image[001]"             -> image001, image002, ...
#   "[image path, _]"        -> Body_Hands_Left
#   "[current date] [image name]"
pattern = "[image name]"

rename_files = true
rename_folders = false

# ---------------------------------------------------------------------------
# Conditions
# ---------------------------------------------------------------------------
[conditions]
# Only process files with the export file extension.
matching_file_extension = false

# Only process items whose name matches a text.
# match_mode: starts_with | does_not_start_with | contains | does_not_contain
#             | ends_with | does_not_end_with | regex
# [conditions.name_filter]
# text = "draft"
# match_mode = "does_not_contain"
# ignore_case = true
"##
}
