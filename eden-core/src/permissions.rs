//! Permission Registry — `app_id -> granted capability globs`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Holds each app's granted capability globs and answers `has(app, perm)`.
///
/// Match algorithm (spec §4.2): exact match; else `"*"` matches anything;
/// else `"ns/*"` matches any `perm` that starts with `"ns/"`. No other
/// wildcard forms are supported — a pattern like `"ns/a*"` is just a
/// literal string that will never match anything but itself.
pub struct PermissionRegistry {
	grants: Mutex<HashMap<String, HashSet<String>>>,
	/// `event_name -> required_perm`, consulted by the Event Bus on subscribe.
	event_requirements: Mutex<HashMap<String, String>>,
}

impl Default for PermissionRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl PermissionRegistry {
	pub fn new() -> Self {
		PermissionRegistry { grants: Mutex::new(HashMap::new()), event_requirements: Mutex::new(HashMap::new()) }
	}

	pub fn register(&self, app_id: &str, perms: &[String]) {
		let mut grants = self.grants.lock().expect("permission grants poisoned");
		grants.entry(app_id.to_string()).or_default().extend(perms.iter().cloned());
	}

	pub fn unregister(&self, app_id: &str) {
		self.grants.lock().expect("permission grants poisoned").remove(app_id);
	}

	pub fn has(&self, app_id: &str, required: &str) -> bool {
		let grants = self.grants.lock().expect("permission grants poisoned");
		let Some(patterns) = grants.get(app_id) else { return false };
		patterns.iter().any(|pattern| matches(pattern, required))
	}

	pub fn granted(&self, app_id: &str) -> Vec<String> {
		self.grants.lock().expect("permission grants poisoned").get(app_id).map(|set| {
			let mut v: Vec<String> = set.iter().cloned().collect();
			v.sort();
			v
		}).unwrap_or_default()
	}

	pub fn register_event_requirement(&self, event_name: &str, required_perm: &str) {
		self.event_requirements
			.lock()
			.expect("event requirements poisoned")
			.insert(event_name.to_string(), required_perm.to_string());
	}

	pub fn event_requirement(&self, event_name: &str) -> Option<String> {
		self.event_requirements.lock().expect("event requirements poisoned").get(event_name).cloned()
	}
}

fn matches(pattern: &str, required: &str) -> bool {
	if pattern == "*" {
		return true;
	}
	if pattern == required {
		return true;
	}
	if let Some(ns) = pattern.strip_suffix("/*") {
		return required.starts_with(ns) && required.as_bytes().get(ns.len()) == Some(&b'/');
	}
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_match() {
		let reg = PermissionRegistry::new();
		reg.register("a", &["fs/read".to_string()]);
		assert!(reg.has("a", "fs/read"));
		assert!(!reg.has("a", "fs/write"));
	}

	#[test]
	fn star_matches_everything() {
		let reg = PermissionRegistry::new();
		reg.register("a", &["*".to_string()]);
		assert!(reg.has("a", "fs/write"));
		assert!(reg.has("a", "db/query"));
	}

	#[test]
	fn namespace_wildcard() {
		let reg = PermissionRegistry::new();
		reg.register("a", &["fs/*".to_string()]);
		assert!(reg.has("a", "fs/read"));
		assert!(reg.has("a", "fs/write"));
		assert!(!reg.has("a", "db/query"));
		// Not a namespace prefix of another name sharing the text.
		assert!(!reg.has("a", "fsx/read"));
	}

	#[test]
	fn unregistered_app_has_nothing() {
		let reg = PermissionRegistry::new();
		assert!(!reg.has("ghost", "fs/read"));
	}

	#[test]
	fn unregister_clears_grants() {
		let reg = PermissionRegistry::new();
		reg.register("a", &["fs/read".to_string()]);
		reg.unregister("a");
		assert!(!reg.has("a", "fs/read"));
	}
}
