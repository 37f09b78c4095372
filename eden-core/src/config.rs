//! Host configuration: `Eden.toml` plus an optional platform overlay
//! merged in with JSON Merge Patch (RFC 7396), the way the teacher
//! merges its own platform-specific config files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tiling::{TilingConfig, TilingMode};

const BASE_FILE_NAME: &str = "Eden.toml";

fn platform_file_name() -> &'static str {
	if cfg!(target_os = "macos") {
		"Eden.macos.toml"
	} else if cfg!(windows) {
		"Eden.windows.toml"
	} else {
		"Eden.linux.toml"
	}
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
	#[error("unable to read host config file at {path}: {error}")]
	Io { path: PathBuf, error: std::io::Error },
	#[error("unable to parse host config file at {path}: {error}")]
	Format { path: PathBuf, error: toml::de::Error },
	#[error("failed to merge platform overlay for host config: {0}")]
	Merge(serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowDefaults {
	#[serde(default)]
	pub width: Option<f64>,
	#[serde(default)]
	pub height: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TilingSettings {
	#[serde(default)]
	pub mode: Option<TilingMode>,
	#[serde(default)]
	pub gap: Option<f64>,
	#[serde(default)]
	pub padding: Option<f64>,
	#[serde(default)]
	pub columns: Option<u32>,
	#[serde(default)]
	pub rows: Option<u32>,
}

impl TilingSettings {
	pub fn to_tiling_config(&self) -> TilingConfig {
		let defaults = TilingConfig::default();
		TilingConfig {
			mode: self.mode.unwrap_or(defaults.mode),
			gap: self.gap.unwrap_or(defaults.gap),
			padding: self.padding.unwrap_or(defaults.padding),
			columns: self.columns,
			rows: self.rows,
		}
	}
}

/// The host config record (SPEC_FULL §6): `{apps_directory?,
/// user_directory?, window?, tiling?, development, autostart?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
	#[serde(default)]
	pub apps_directory: Option<PathBuf>,
	#[serde(default)]
	pub user_directory: Option<PathBuf>,
	#[serde(default)]
	pub window: Option<WindowDefaults>,
	#[serde(default)]
	pub tiling: Option<TilingSettings>,
	#[serde(default)]
	pub development: bool,
	#[serde(default)]
	pub autostart: Option<Vec<String>>,
}

impl Default for HostConfig {
	fn default() -> Self {
		HostConfig { apps_directory: None, user_directory: None, window: None, tiling: None, development: false, autostart: None }
	}
}

/// Reads `Eden.toml` from `root_dir`, then merges a platform-specific
/// overlay file if present, using RFC 7396 merge patch semantics so the
/// overlay only needs to carry the keys it's actually changing.
pub fn read_from(root_dir: &Path) -> Result<HostConfig, ConfigError> {
	let mut value = parse_toml_as_json(&root_dir.join(BASE_FILE_NAME))?;

	let platform_path = root_dir.join(platform_file_name());
	if platform_path.exists() {
		let overlay = parse_toml_as_json(&platform_path)?;
		json_patch::merge(&mut value, &overlay);
	}

	serde_json::from_value(value).map_err(ConfigError::Merge)
}

fn parse_toml_as_json(path: &Path) -> Result<serde_json::Value, ConfigError> {
	if !path.exists() {
		return Ok(serde_json::to_value(HostConfig::default()).expect("HostConfig always serializes"));
	}
	let raw = std::fs::read_to_string(path).map_err(|error| ConfigError::Io { path: path.to_path_buf(), error })?;
	let parsed: toml::Value = toml::from_str(&raw).map_err(|error| ConfigError::Format { path: path.to_path_buf(), error })?;
	Ok(serde_json::to_value(parsed).expect("toml::Value always converts to serde_json::Value"))
}
