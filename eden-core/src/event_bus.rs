//! Event Bus — subscription table `event_name -> set<view>`, plus
//! in-process listeners for internal consumers (other managers).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use crate::permissions::PermissionRegistry;

/// A frame pushed to a subscribed view's message channel: `{type, payload}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventFrame {
	#[serde(rename = "type")]
	pub event: String,
	pub payload: JsonValue,
}

/// Sends frames to one view. The real implementation posts through the
/// embedded web surface's message channel (an external collaborator);
/// this trait is the seam.
pub trait ViewSink: Send + Sync {
	fn send(&self, frame: EventFrame);
}

pub type InternalListener = Arc<dyn Fn(&str, &JsonValue) + Send + Sync>;

struct Subscription {
	view_id: u32,
	app_id: String,
	sink: Arc<dyn ViewSink>,
}

pub struct EventBus {
	permissions: Arc<PermissionRegistry>,
	/// event_name -> ordered subscriptions (registration order is stable
	/// within a single `notify` call, per spec §4.4).
	subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
	listeners: Mutex<Vec<InternalListener>>,
}

impl EventBus {
	pub fn new(permissions: Arc<PermissionRegistry>) -> Self {
		EventBus { permissions, subscriptions: Mutex::new(HashMap::new()), listeners: Mutex::new(Vec::new()) }
	}

	/// Registers an in-process listener invoked before any remote view on
	/// every `notify` call. Errors inside listeners are the caller's
	/// responsibility to catch; [`EventBus::notify`] itself swallows
	/// panics via [`std::panic::catch_unwind`] so one bad listener can't
	/// starve the others.
	pub fn add_internal_listener(&self, listener: InternalListener) {
		self.listeners.lock().expect("listeners poisoned").push(listener);
	}

	/// Rejects if `event` requires a permission `view`'s app lacks.
	pub fn subscribe(&self, view_id: u32, app_id: &str, event: &str, sink: Arc<dyn ViewSink>) -> Result<(), crate::error::Error> {
		if let Some(required) = self.permissions.event_requirement(event) {
			if !self.permissions.has(app_id, &required) {
				return Err(crate::error::Error::PermissionDenied(format!("{app_id} lacks `{required}` required to subscribe to `{event}`")));
			}
		}
		let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
		subs.entry(event.to_string()).or_default().push(Subscription { view_id, app_id: app_id.to_string(), sink });
		Ok(())
	}

	pub fn unsubscribe(&self, view_id: u32, event: &str) {
		let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
		if let Some(list) = subs.get_mut(event) {
			list.retain(|s| s.view_id != view_id);
		}
	}

	/// Called on view destruction: purges every subscription for that view
	/// across all events.
	pub fn remove_all_for_view(&self, view_id: u32) {
		let mut subs = self.subscriptions.lock().expect("subscriptions poisoned");
		for list in subs.values_mut() {
			list.retain(|s| s.view_id != view_id);
		}
	}

	/// Invokes every internal listener (errors swallowed and logged), then
	/// pushes to every subscribed view. Internal listeners run before
	/// remote listeners (spec §4.4).
	pub fn notify(&self, event: &str, payload: JsonValue) {
		let listeners = self.listeners.lock().expect("listeners poisoned").clone();
		for listener in &listeners {
			let listener = listener.clone();
			let event_owned = event.to_string();
			let payload_clone = payload.clone();
			let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event_owned, &payload_clone)));
			if let Err(_panic) = outcome {
				tracing::error!(event, "internal event listener panicked; continuing");
			}
		}

		let subs = self.subscriptions.lock().expect("subscriptions poisoned");
		if let Some(list) = subs.get(event) {
			for sub in list {
				sub.sink.send(EventFrame { event: event.to_string(), payload: payload.clone() });
			}
		}
	}

	/// Targeted delivery to one view; a no-op if that view isn't
	/// subscribed to `event`.
	pub fn notify_view(&self, view_id: u32, event: &str, payload: JsonValue) {
		let subs = self.subscriptions.lock().expect("subscriptions poisoned");
		if let Some(list) = subs.get(event) {
			if let Some(sub) = list.iter().find(|s| s.view_id == view_id) {
				sub.sink.send(EventFrame { event: event.to_string(), payload });
			}
		}
	}

	pub fn subscriber_app_ids(&self, event: &str) -> HashSet<String> {
		let subs = self.subscriptions.lock().expect("subscriptions poisoned");
		subs.get(event).map(|list| list.iter().map(|s| s.app_id.clone()).collect()).unwrap_or_default()
	}
}
