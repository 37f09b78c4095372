//! Thin seams for the collaborators the command bus still needs to route
//! to even though they stay external per spec.md's Non-goals list:
//! filesystem sandbox, notifications, settings persistence (§4.12). Each
//! trait ships an in-memory default sufficient for tests and for an
//! embedder that hasn't wired up the real thing yet.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value as JsonValue;

use crate::error::Error;

/// Scopes filesystem access to an app's own sandboxed root. The real
/// implementation enforces OS-level path containment; this seam is what
/// the `fs/*` command namespace is routed through.
pub trait FsSandbox: Send + Sync {
	fn read(&self, app_id: &str, relative_path: &str) -> Result<Vec<u8>, Error>;
	fn write(&self, app_id: &str, relative_path: &str, bytes: &[u8]) -> Result<(), Error>;
}

/// Desktop notification surface, routed through the `notify/*` namespace.
pub trait NotificationSink: Send + Sync {
	fn notify(&self, app_id: &str, title: &str, body: &str);
}

/// Per-app key/value settings persistence, routed through `settings/*`.
pub trait SettingsStore: Send + Sync {
	fn get(&self, app_id: &str, key: &str) -> Option<JsonValue>;
	fn set(&self, app_id: &str, key: &str, value: JsonValue);
}

/// An in-memory `FsSandbox` rooted at one directory per app, used by
/// tests and by embedders before a real sandbox is wired in.
pub struct InMemoryFsSandbox {
	files: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl Default for InMemoryFsSandbox {
	fn default() -> Self {
		InMemoryFsSandbox { files: Mutex::new(HashMap::new()) }
	}
}

impl FsSandbox for InMemoryFsSandbox {
	fn read(&self, app_id: &str, relative_path: &str) -> Result<Vec<u8>, Error> {
		self.files
			.lock()
			.expect("fs sandbox poisoned")
			.get(&(app_id.to_string(), relative_path.to_string()))
			.cloned()
			.ok_or_else(|| Error::not_found(format!("{app_id}:{relative_path}")))
	}

	fn write(&self, app_id: &str, relative_path: &str, bytes: &[u8]) -> Result<(), Error> {
		self.files.lock().expect("fs sandbox poisoned").insert((app_id.to_string(), relative_path.to_string()), bytes.to_vec());
		Ok(())
	}
}

/// Records notifications instead of surfacing them, used by tests.
#[derive(Default)]
pub struct RecordingNotificationSink {
	pub sent: Mutex<Vec<(String, String, String)>>,
}

impl NotificationSink for RecordingNotificationSink {
	fn notify(&self, app_id: &str, title: &str, body: &str) {
		self.sent.lock().expect("notifications poisoned").push((app_id.to_string(), title.to_string(), body.to_string()));
	}
}

/// An in-memory `SettingsStore`; the default for embedders and the only
/// implementation tests need.
#[derive(Default)]
pub struct InMemorySettingsStore {
	values: Mutex<HashMap<(String, String), JsonValue>>,
}

impl SettingsStore for InMemorySettingsStore {
	fn get(&self, app_id: &str, key: &str) -> Option<JsonValue> {
		self.values.lock().expect("settings poisoned").get(&(app_id.to_string(), key.to_string())).cloned()
	}

	fn set(&self, app_id: &str, key: &str, value: JsonValue) {
		self.values.lock().expect("settings poisoned").insert((app_id.to_string(), key.to_string()), value);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fs_sandbox_round_trips_per_app() {
		let sandbox = InMemoryFsSandbox::default();
		sandbox.write("a.b", "notes.txt", b"hello").unwrap();
		assert_eq!(sandbox.read("a.b", "notes.txt").unwrap(), b"hello");
		assert!(sandbox.read("other.app", "notes.txt").is_err());
	}

	#[test]
	fn settings_store_round_trips_per_app() {
		let store = InMemorySettingsStore::default();
		store.set("a.b", "theme", serde_json::json!("dark"));
		assert_eq!(store.get("a.b", "theme"), Some(serde_json::json!("dark")));
		assert_eq!(store.get("other.app", "theme"), None);
	}

	#[test]
	fn notification_sink_records_sent_notifications() {
		let sink = RecordingNotificationSink::default();
		sink.notify("a.b", "Title", "Body");
		let sent = sink.sent.lock().unwrap();
		assert_eq!(sent.as_slice(), [("a.b".to_string(), "Title".to_string(), "Body".to_string())]);
	}
}
