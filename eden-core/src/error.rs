use std::path::PathBuf;

/// Errors that can happen while the host manages apps.
///
/// Variant names follow the taxonomy in the kernel design: they describe
/// the *kind* of failure, not which subsystem raised it, so callers at the
/// command bus edge can map them to a stable `{kind, message}` payload
/// without matching on subsystem-specific types.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// No app, instance, view, service or connection matches the given key.
	#[error("not found: {0}")]
	NotFound(String),
	/// An app with this id is already installed, or a service is already
	/// registered under this name.
	#[error("already exists: {0}")]
	AlreadyExists(String),
	/// The archive or manifest is structurally invalid.
	#[error("bad format: {0}")]
	BadFormat(String),
	/// The archive's checksum did not match its declared metadata.
	#[error("corrupt archive: {0}")]
	Corrupt(String),
	/// The caller's granted capabilities do not cover the required one.
	#[error("permission denied: {0}")]
	PermissionDenied(String),
	/// A deadline elapsed before the operation completed.
	#[error("timed out: {0}")]
	Timeout(String),
	/// A backend failed its ready handshake or crashed during startup.
	#[error("startup failed: {0}")]
	StartupFailure(String),
	/// A broker peer disconnected or never existed.
	#[error("peer gone: {0}")]
	ProviderGone(String),
	/// A broker connect's requester disconnected or never existed.
	#[error("requester gone: {0}")]
	RequesterGone(String),
	/// Attempted to uninstall a prebuilt app.
	#[error("{0} is a system app and cannot be uninstalled")]
	SystemApp(String),
	/// The requested mode/operation conflicts with a manifest restriction.
	#[error("conflict: {0}")]
	Conflict(String),
	/// A command handler panicked instead of returning a `Result`. Caught at
	/// the Command Bus boundary so one bad handler can't take the host down
	/// (spec §4.10).
	#[error("command handler panicked: {0}")]
	Internal(String),
	/// Filesystem or other I/O failure.
	#[error("{0}")]
	Io(#[from] std::io::Error),
	/// JSON (de)serialization failure.
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
	/// TOML deserialization failure reading host configuration.
	#[error("toml error: {0}")]
	Toml(#[from] toml::de::Error),
}

impl Error {
	/// Stable machine-readable kind string, mirrored to web views as the
	/// `kind` field of the typed error object described in spec §7.
	pub fn kind(&self) -> &'static str {
		match self {
			Error::NotFound(_) => "NotFound",
			Error::AlreadyExists(_) => "AlreadyExists",
			Error::BadFormat(_) => "BadFormat",
			Error::Corrupt(_) => "Corrupt",
			Error::PermissionDenied(_) => "PermissionDenied",
			Error::Timeout(_) => "Timeout",
			Error::StartupFailure(_) => "StartupFailure",
			Error::ProviderGone(_) => "ProviderGone",
			Error::RequesterGone(_) => "RequesterGone",
			Error::SystemApp(_) => "SystemApp",
			Error::Conflict(_) => "Conflict",
			Error::Internal(_) => "Internal",
			Error::Io(_) => "Io",
			Error::Json(_) => "Io",
			Error::Toml(_) => "Io",
		}
	}

	pub fn not_found(what: impl Into<String>) -> Self {
		Error::NotFound(what.into())
	}

	pub fn bad_format(what: impl Into<String>) -> Self {
		Error::BadFormat(what.into())
	}
}

/// A typed error object, the shape handed back to a web view or backend
/// on a failed command (spec §7: "the originating web view receives a
/// typed error object `{kind, message}`").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
	pub kind: &'static str,
	pub message: String,
}

impl From<&Error> for ErrorPayload {
	fn from(err: &Error) -> Self {
		ErrorPayload { kind: err.kind(), message: err.to_string() }
	}
}

/// Context a structured log line is keyed by: `app_id` and the command or
/// event name involved (spec §7: "the host records a structured log line
/// keyed by `app_id` and command name").
pub fn log_failure(app_id: &str, action: &str, err: &Error) {
	tracing::warn!(app_id, action, kind = err.kind(), error = %err, "command failed");
}

/// Errors specific to archive reading/writing, kept distinct from the
/// kernel's [`Error`] because most variants name a filesystem path.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ArchiveError {
	#[error("unsupported archive extension on {0}")]
	WrongExtension(PathBuf),
	#[error("archive metadata is malformed: {0}")]
	BadMetadata(String),
	#[error("checksum mismatch: expected {expected}, computed {computed}")]
	ChecksumMismatch { expected: String, computed: String },
	#[error("manifest is invalid: {0}")]
	InvalidManifest(String),
	#[error("{0}")]
	Io(#[from] std::io::Error),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

impl From<ArchiveError> for Error {
	fn from(err: ArchiveError) -> Self {
		match err {
			ArchiveError::WrongExtension(p) => Error::BadFormat(format!("unsupported archive extension on {}", p.display())),
			ArchiveError::BadMetadata(m) => Error::BadFormat(m),
			ArchiveError::ChecksumMismatch { expected, computed } => Error::Corrupt(format!("expected {expected}, computed {computed}")),
			ArchiveError::InvalidManifest(m) => Error::BadFormat(m),
			ArchiveError::Io(e) => Error::Io(e),
			ArchiveError::Json(e) => Error::Json(e),
		}
	}
}
