//! Channel Broker — registers named services an app exposes and pairs
//! them with connecting apps through a `MessagePort`-style abstraction
//! (spec §4.9, §8 properties 6 and 7, scenario S7).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value as JsonValue;

use crate::backend::BackendSupervisor;
use crate::error::Error;
use crate::event_bus::EventBus;
use crate::view::ViewManager;

/// Which side of a service's provider is live, and therefore how the
/// broker checks it hasn't gone away before handing out a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
	Frontend,
	Backend,
}

/// One end of a paired channel. Delivery is the embedder's concern
/// (postMessage into a web view, a pipe to a backend); the broker only
/// tracks who is connected to whom and checks liveness/permissions
/// before handing out a pair.
pub trait PortSink: Send + Sync {
	fn send(&self, payload: JsonValue);
	fn close(&self);
}

struct RegisteredService {
	provider_app_id: String,
	provider_kind: ProviderKind,
	/// Empty means unrestricted (spec §4.9 step 2: the check only applies
	/// "if `allowed_clients` is non-empty").
	allowed_clients: HashSet<String>,
	sink: Arc<dyn PortSink>,
}

struct Connection {
	connection_id: String,
	requester_app: String,
	target_app: String,
	service_name: String,
}

/// Key a service is registered under: `(provider_app_id, service_name)`
/// (spec §3), not `service_name` alone — two different apps may each
/// expose a service of the same name.
type ServiceKey = (String, String);

pub struct ChannelBroker {
	permissions: Arc<crate::permissions::PermissionRegistry>,
	events: Arc<EventBus>,
	views: Arc<ViewManager>,
	backends: Arc<BackendSupervisor>,
	services: Mutex<HashMap<ServiceKey, RegisteredService>>,
	connections: Mutex<Vec<Connection>>,
}

impl ChannelBroker {
	pub fn new(permissions: Arc<crate::permissions::PermissionRegistry>, events: Arc<EventBus>, views: Arc<ViewManager>, backends: Arc<BackendSupervisor>) -> Self {
		ChannelBroker { permissions, events, views, backends, services: Mutex::new(HashMap::new()), connections: Mutex::new(Vec::new()) }
	}

	/// Registers `service_name` as owned by `provider_app_id`. Re-registering
	/// the same `(provider_app_id, service_name)` key (e.g. after reload) is
	/// allowed; a different app claiming a name another app already owns is
	/// not — but since the key includes the provider, two different apps
	/// can register the same `service_name` without conflict.
	pub fn register_service(&self, provider_app_id: &str, service_name: &str, provider_kind: ProviderKind, allowed_clients: HashSet<String>, sink: Arc<dyn PortSink>) -> Result<(), Error> {
		let key = (provider_app_id.to_string(), service_name.to_string());
		let mut services = self.services.lock().expect("services poisoned");
		services.insert(key, RegisteredService { provider_app_id: provider_app_id.to_string(), provider_kind, allowed_clients, sink });
		Ok(())
	}

	pub fn unregister_service(&self, provider_app_id: &str, service_name: &str) {
		self.services.lock().expect("services poisoned").remove(&(provider_app_id.to_string(), service_name.to_string()));
		self.close_connections_for_service(provider_app_id, service_name);
	}

	/// Called when an app's process stops: drops every service it owns and
	/// every connection it holds as either endpoint, closing both sides.
	pub fn unregister_all_for_app(&self, app_id: &str) {
		let owned: Vec<ServiceKey> = {
			let services = self.services.lock().expect("services poisoned");
			services.keys().filter(|(provider, _)| provider == app_id).cloned().collect()
		};
		for (provider, name) in owned {
			self.unregister_service(&provider, &name);
		}
		self.close_connections_for_app(app_id);
	}

	/// Pairs `requester_app` with `target_app`'s registered service. Checks,
	/// in order: the service exists, the client is allowed, both ends are
	/// still alive (spec §4.9).
	pub async fn connect(&self, requester_app: &str, target_app: &str, service_name: &str) -> Result<String, Error> {
		let (provider_kind, allowed_clients) = {
			let key = (target_app.to_string(), service_name.to_string());
			let services = self.services.lock().expect("services poisoned");
			let service = services.get(&key).ok_or_else(|| Error::not_found(format!("service `{service_name}` on {target_app}")))?;
			(service.provider_kind, service.allowed_clients.clone())
		};

		if !allowed_clients.is_empty() && !allowed_clients.contains(requester_app) {
			return Err(Error::PermissionDenied(format!("{requester_app} is not in `{service_name}`'s allowed_clients")));
		}

		if !self.is_alive(target_app, provider_kind).await {
			return Err(Error::ProviderGone(target_app.to_string()));
		}
		if !self.is_alive(requester_app, ProviderKind::Frontend).await && !self.is_alive(requester_app, ProviderKind::Backend).await {
			return Err(Error::RequesterGone(requester_app.to_string()));
		}

		let connection_id = format!("{requester_app}->{target_app}:{service_name}:{}", now_unix_millis());

		self.connections.lock().expect("connections poisoned").push(Connection {
			connection_id: connection_id.clone(),
			requester_app: requester_app.to_string(),
			target_app: target_app.to_string(),
			service_name: service_name.to_string(),
		});

		Ok(connection_id)
	}

	async fn is_alive(&self, app_id: &str, kind: ProviderKind) -> bool {
		match kind {
			ProviderKind::Frontend => !self.views.views_for_app(app_id).is_empty(),
			ProviderKind::Backend => self.backends.is_running(app_id).await,
		}
	}

	pub fn send_to_service(&self, provider_app_id: &str, service_name: &str, payload: JsonValue) -> Result<(), Error> {
		let services = self.services.lock().expect("services poisoned");
		let service = services.get(&(provider_app_id.to_string(), service_name.to_string())).ok_or_else(|| Error::not_found(format!("service `{service_name}` on {provider_app_id}")))?;
		service.sink.send(payload);
		Ok(())
	}

	/// Drops every connection to `(provider_app_id, service_name)` and
	/// notifies the requester on the other end of each one with
	/// `port-closed` (spec §4.9).
	fn close_connections_for_service(&self, provider_app_id: &str, service_name: &str) {
		let closed: Vec<String> = {
			let mut connections = self.connections.lock().expect("connections poisoned");
			let (closing, remaining): (Vec<_>, Vec<_>) = connections.drain(..).partition(|c| c.target_app == provider_app_id && c.service_name == service_name);
			*connections = remaining;
			closing.into_iter().map(|c| c.connection_id).collect()
		};
		for connection_id in closed {
			self.events.notify("port-closed", serde_json::json!({"connection_id": connection_id}));
		}
	}

	/// Closes every connection where `app_id` appears as either endpoint,
	/// notifying the *other* endpoint with `port-closed` for each one
	/// (spec §4.9).
	pub fn close_connections_for_app(&self, app_id: &str) {
		let closed: Vec<String> = {
			let mut connections = self.connections.lock().expect("connections poisoned");
			let (closing, remaining): (Vec<_>, Vec<_>) = connections.drain(..).partition(|c| c.requester_app == app_id || c.target_app == app_id);
			*connections = remaining;
			closing.into_iter().map(|c| c.connection_id).collect()
		};
		for connection_id in closed {
			self.events.notify("port-closed", serde_json::json!({"connection_id": connection_id}));
		}
	}

	pub fn is_registered(&self, provider_app_id: &str, service_name: &str) -> bool {
		self.services.lock().expect("services poisoned").contains_key(&(provider_app_id.to_string(), service_name.to_string()))
	}

	pub fn connection_count_for_service(&self, provider_app_id: &str, service_name: &str) -> usize {
		self.connections.lock().expect("connections poisoned").iter().filter(|c| c.target_app == provider_app_id && c.service_name == service_name).count()
	}
}

fn now_unix_millis() -> u128 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_bus::EventFrame;
	use crate::permissions::PermissionRegistry;
	use crate::tiling::{Rect, TilingConfig};
	use crate::view::{SurfaceFactory, View, ViewType, WebSurface};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex as StdMutex;

	struct CountingSink(Arc<AtomicUsize>);
	impl PortSink for CountingSink {
		fn send(&self, _payload: JsonValue) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
		fn close(&self) {}
	}

	struct NullSurface;
	impl WebSurface for NullSurface {
		fn apply_bounds(&self, _bounds: Rect) {}
		fn apply_visible(&self, _visible: bool) {}
		fn close_devtools(&self) {}
		fn toggle_devtools(&self) {}
		fn destroy(&self) {}
		fn post_message(&self, _message: JsonValue) {}
	}
	struct NullFactory;
	impl SurfaceFactory for NullFactory {
		fn create(&self, _app_id: &str, _manifest: &crate::manifest::Manifest, _install_path: &str, _view_type: ViewType) -> Arc<dyn WebSurface> {
			Arc::new(NullSurface)
		}
	}

	struct SleepLauncher;
	impl crate::backend::BackendLauncher for SleepLauncher {
		fn spawn(&self, _app_id: &str, _backend_entry_path: &str, _install_path: &str, _manifest: &crate::manifest::Manifest) -> std::io::Result<tokio::process::Child> {
			tokio::process::Command::new("sleep").arg("5").kill_on_drop(true).spawn()
		}
	}

	fn broker_with(permissions: Arc<PermissionRegistry>) -> (ChannelBroker, Arc<EventBus>, Arc<ViewManager>, Arc<BackendSupervisor>) {
		let events = Arc::new(EventBus::new(permissions.clone()));
		let views = Arc::new(ViewManager::new(Rect { x: 0.0, y: 0.0, w: 1000.0, h: 600.0 }, TilingConfig::default(), Arc::new(NullFactory)));
		let backends = Arc::new(BackendSupervisor::new(Arc::new(SleepLauncher), events.clone()));
		(ChannelBroker::new(permissions, events.clone(), views.clone(), backends.clone()), events, views, backends)
	}

	fn manifest(id: &str) -> crate::manifest::Manifest {
		crate::manifest::Manifest {
			id: id.into(),
			name: id.into(),
			version: "1.0.0".into(),
			description: None,
			author: None,
			icon: None,
			frontend: crate::manifest::FrontendConfig { entry: "index.html".into() },
			backend: None,
			window: None,
			permissions: vec![],
			autostart: false,
			overlay: false,
			is_prebuilt: false,
		}
	}

	/// Gives an app a live frontend by creating a view for it, satisfying
	/// the broker's frontend-liveness check without spinning up a real
	/// surface.
	fn give_frontend(views: &ViewManager, app_id: &str) -> View {
		let m = manifest(app_id);
		let view_id = views.create_app_view(app_id, &m, "/apps/x", None);
		views.view(view_id).unwrap()
	}

	struct RecordingViewSink(Arc<StdMutex<Vec<EventFrame>>>);
	impl crate::event_bus::ViewSink for RecordingViewSink {
		fn send(&self, frame: EventFrame) {
			self.0.lock().unwrap().push(frame);
		}
	}

	#[tokio::test]
	async fn s7_register_connect_send_round_trip() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "owner.app");
		give_frontend(&views, "client.app");
		let received = Arc::new(AtomicUsize::new(0));
		broker.register_service("owner.app", "sync", ProviderKind::Frontend, HashSet::new(), Arc::new(CountingSink(received.clone()))).unwrap();

		let connection_id = broker.connect("client.app", "owner.app", "sync").await.unwrap();
		assert!(connection_id.starts_with("client.app->owner.app:sync:"));
		assert_eq!(broker.connection_count_for_service("owner.app", "sync"), 1);

		broker.send_to_service("owner.app", "sync", serde_json::json!({"ping": true})).unwrap();
		assert_eq!(received.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn connect_rejects_missing_service() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "client.app");
		let err = broker.connect("client.app", "owner.app", "ghost").await.unwrap_err();
		assert_eq!(err.kind(), "NotFound");
	}

	#[tokio::test]
	async fn connect_rejects_client_outside_allowed_clients() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "owner.app");
		give_frontend(&views, "client.app");
		let received = Arc::new(AtomicUsize::new(0));
		let mut allowed = HashSet::new();
		allowed.insert("trusted.app".to_string());
		broker.register_service("owner.app", "sync", ProviderKind::Frontend, allowed, Arc::new(CountingSink(received))).unwrap();

		let err = broker.connect("client.app", "owner.app", "sync").await.unwrap_err();
		assert_eq!(err.kind(), "PermissionDenied");
	}

	#[tokio::test]
	async fn connect_succeeds_when_client_is_in_allowed_clients() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "owner.app");
		give_frontend(&views, "client.app");
		let received = Arc::new(AtomicUsize::new(0));
		let mut allowed = HashSet::new();
		allowed.insert("client.app".to_string());
		broker.register_service("owner.app", "sync", ProviderKind::Frontend, allowed, Arc::new(CountingSink(received))).unwrap();

		assert!(broker.connect("client.app", "owner.app", "sync").await.is_ok());
	}

	#[tokio::test]
	async fn connect_rejects_when_provider_has_no_live_frontend() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "client.app");
		let received = Arc::new(AtomicUsize::new(0));
		broker.register_service("owner.app", "sync", ProviderKind::Frontend, HashSet::new(), Arc::new(CountingSink(received))).unwrap();

		let err = broker.connect("client.app", "owner.app", "sync").await.unwrap_err();
		assert_eq!(err.kind(), "ProviderGone");
	}

	#[test]
	fn two_apps_may_register_the_same_service_name() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "owner.a");
		give_frontend(&views, "owner.b");
		let received = Arc::new(AtomicUsize::new(0));
		broker.register_service("owner.a", "sync", ProviderKind::Frontend, HashSet::new(), Arc::new(CountingSink(received.clone()))).unwrap();
		assert!(broker.register_service("owner.b", "sync", ProviderKind::Frontend, HashSet::new(), Arc::new(CountingSink(received))).is_ok());
		assert!(broker.is_registered("owner.a", "sync"));
		assert!(broker.is_registered("owner.b", "sync"));
	}

	#[tokio::test]
	async fn unregister_all_for_app_drops_owned_services_and_client_connections() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "owner.app");
		give_frontend(&views, "client.app");
		let received = Arc::new(AtomicUsize::new(0));
		broker.register_service("owner.app", "sync", ProviderKind::Frontend, HashSet::new(), Arc::new(CountingSink(received.clone()))).unwrap();
		broker.connect("client.app", "owner.app", "sync").await.unwrap();

		broker.unregister_all_for_app("owner.app");
		assert!(!broker.is_registered("owner.app", "sync"));
		assert_eq!(broker.connection_count_for_service("owner.app", "sync"), 0);
	}

	#[tokio::test]
	async fn stopping_a_client_closes_only_its_own_connections() {
		let (broker, _events, views, _backends) = broker_with(Arc::new(PermissionRegistry::new()));
		give_frontend(&views, "owner.app");
		give_frontend(&views, "client.a");
		give_frontend(&views, "client.b");
		let received = Arc::new(AtomicUsize::new(0));
		broker.register_service("owner.app", "sync", ProviderKind::Frontend, HashSet::new(), Arc::new(CountingSink(received))).unwrap();
		broker.connect("client.a", "owner.app", "sync").await.unwrap();
		broker.connect("client.b", "owner.app", "sync").await.unwrap();

		broker.close_connections_for_app("client.a");
		assert_eq!(broker.connection_count_for_service("owner.app", "sync"), 1);
	}

	#[tokio::test]
	async fn s7_peer_termination_notifies_the_surviving_endpoint() {
		let permissions = Arc::new(PermissionRegistry::new());
		let (broker, events, views, _backends) = broker_with(permissions);
		give_frontend(&views, "owner.app");
		give_frontend(&views, "client.app");
		let received = Arc::new(AtomicUsize::new(0));
		broker.register_service("owner.app", "sync", ProviderKind::Frontend, HashSet::new(), Arc::new(CountingSink(received))).unwrap();
		let connection_id = broker.connect("client.app", "owner.app", "sync").await.unwrap();

		let frames = Arc::new(StdMutex::new(Vec::new()));
		events.subscribe(1, "client.app", "port-closed", Arc::new(RecordingViewSink(frames.clone()))).unwrap();

		broker.unregister_all_for_app("owner.app");

		let frames = frames.lock().unwrap();
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].payload, serde_json::json!({"connection_id": connection_id}));
		assert_eq!(broker.connection_count_for_service("owner.app", "sync"), 0);
	}
}
