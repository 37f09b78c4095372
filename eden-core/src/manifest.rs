//! The app manifest: the one piece of data every other subsystem keys off.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9.-]+$").expect("static regex"));

/// Where a window's frontend entry point lives: a path inside the archive,
/// or a remote URL. Distinguished at validation time, not by tagging in
/// the manifest JSON — authors just write a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendEntry {
	Path(String),
	Url(url::Url),
}

impl FrontendEntry {
	pub fn parse(raw: &str) -> Self {
		match url::Url::parse(raw) {
			Ok(url) if url.scheme() == "http" || url.scheme() == "https" => FrontendEntry::Url(url),
			_ => FrontendEntry::Path(raw.to_string()),
		}
	}

	pub fn is_url_like(raw: &str) -> bool {
		raw.starts_with("http://") || raw.starts_with("https://")
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
	pub entry: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
	#[serde(default)]
	pub max_memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
	pub entry: String,
	#[serde(default)]
	pub limits: Option<ResourceLimits>,
	/// If the backend fails its ready handshake, an optional backend leaves
	/// the instance (and its view) up in `Error` state; a required one
	/// aborts the launch entirely (spec §4.10).
	#[serde(default)]
	pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
	Floating,
	Tiled,
	Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
	pub width: f64,
	pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
	pub x: f64,
	pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CssInjection {
	Full,
	Tokens,
	None,
}

impl Default for CssInjection {
	fn default() -> Self {
		CssInjection::Full
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionsConfig {
	#[serde(default)]
	pub css: CssInjection,
	#[serde(default = "default_true")]
	pub app_frame: bool,
}

fn default_true() -> bool {
	true
}

impl Default for InjectionsConfig {
	fn default() -> Self {
		InjectionsConfig { css: CssInjection::Full, app_frame: true }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
	#[serde(default)]
	pub mode: Option<WindowMode>,
	#[serde(default)]
	pub default_size: Option<Size>,
	#[serde(default)]
	pub default_position: Option<Position>,
	#[serde(default)]
	pub min_size: Option<Size>,
	#[serde(default)]
	pub max_size: Option<Size>,
	#[serde(default)]
	pub injections: Option<InjectionsConfig>,
}

/// Manifest — uniquely identifies an app. See spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
	pub id: String,
	pub name: String,
	pub version: String,

	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub author: Option<String>,
	#[serde(default)]
	pub icon: Option<String>,

	pub frontend: FrontendConfig,
	#[serde(default)]
	pub backend: Option<BackendConfig>,
	#[serde(default)]
	pub window: Option<WindowConfig>,
	#[serde(default)]
	pub permissions: Vec<String>,
	#[serde(default)]
	pub autostart: bool,
	#[serde(default)]
	pub overlay: bool,

	/// Set by the package store's loader when scanning the prebuilt root.
	/// Never trusted from an installed archive's own manifest.json.
	#[serde(default, skip_serializing)]
	pub is_prebuilt: bool,
}

impl Manifest {
	/// Deterministic validation rules from spec §4.1: required fields,
	/// `id` shape, and the frontend/backend entry-point coherence checks.
	pub fn validate(&self) -> Result<(), Error> {
		if self.id.is_empty() {
			return Err(Error::bad_format("manifest.id is required"));
		}
		if !ID_PATTERN.is_match(&self.id) {
			return Err(Error::bad_format(format!("manifest.id `{}` must match ^[a-z0-9.-]+$", self.id)));
		}
		if self.name.is_empty() {
			return Err(Error::bad_format("manifest.name is required"));
		}
		if self.version.is_empty() {
			return Err(Error::bad_format("manifest.version is required"));
		}
		if semver::Version::parse(&self.version).is_err() {
			return Err(Error::bad_format(format!("manifest.version `{}` is not a valid semver", self.version)));
		}
		if self.frontend.entry.is_empty() {
			return Err(Error::bad_format("manifest.frontend.entry is required"));
		}
		// A frontend entry that looks like a URL must actually parse as one.
		if FrontendEntry::is_url_like(&self.frontend.entry) && url::Url::parse(&self.frontend.entry).is_err() {
			return Err(Error::bad_format(format!("manifest.frontend.entry `{}` is not a valid URL", self.frontend.entry)));
		}
		Ok(())
	}

	pub fn frontend_entry(&self) -> FrontendEntry {
		FrontendEntry::parse(&self.frontend.entry)
	}

	pub fn has_backend(&self) -> bool {
		self.backend.is_some()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_manifest() -> Manifest {
		Manifest {
			id: "eden.notes".into(),
			name: "Notes".into(),
			version: "1.0.0".into(),
			description: None,
			author: None,
			icon: None,
			frontend: FrontendConfig { entry: "index.html".into() },
			backend: None,
			window: None,
			permissions: vec![],
			autostart: false,
			overlay: false,
			is_prebuilt: false,
		}
	}

	#[test]
	fn accepts_a_well_formed_manifest() {
		assert!(base_manifest().validate().is_ok());
	}

	#[test]
	fn rejects_bad_id_characters() {
		let mut m = base_manifest();
		m.id = "Eden.Notes".into();
		assert!(matches!(m.validate(), Err(Error::BadFormat(_))));
	}

	#[test]
	fn rejects_non_semver_version() {
		let mut m = base_manifest();
		m.version = "v1".into();
		assert!(m.validate().is_err());
	}

	#[test]
	fn rejects_malformed_url_frontend_entry() {
		let mut m = base_manifest();
		m.frontend.entry = "http://".into();
		assert!(m.validate().is_err());
	}

	#[test]
	fn accepts_remote_frontend_entry() {
		let mut m = base_manifest();
		m.frontend.entry = "https://example.com/app".into();
		assert!(m.validate().is_ok());
		assert!(matches!(m.frontend_entry(), FrontendEntry::Url(_)));
	}
}
