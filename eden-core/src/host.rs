//! Host — two-phase wiring of every subsystem into one running kernel
//! (spec §9: build the Command Bus first, then construct each manager
//! with a shared reference to it, then have each manager's command
//! surface registered once every manager exists).

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::ambient::{FsSandbox, InMemoryFsSandbox, InMemorySettingsStore, NotificationSink, RecordingNotificationSink, SettingsStore};
use crate::backend::{BackendLauncher, BackendSupervisor};
use crate::broker::ChannelBroker;
use crate::command_bus::{caller_app_id, CommandBus, HandlerSpec};
use crate::config::HostConfig;
use crate::error::Error;
use crate::event_bus::EventBus;
use crate::permissions::PermissionRegistry;
use crate::process::ProcessManager;
use crate::store::PackageStore;
use crate::tiling::Rect;
use crate::view::{SurfaceFactory, ViewManager};

pub struct Host {
	pub permissions: Arc<PermissionRegistry>,
	pub commands: Arc<CommandBus>,
	pub events: Arc<EventBus>,
	pub store: Arc<PackageStore>,
	pub views: Arc<ViewManager>,
	pub backends: Arc<BackendSupervisor>,
	pub processes: Arc<ProcessManager>,
	pub broker: Arc<ChannelBroker>,
	pub fs_sandbox: Arc<dyn FsSandbox>,
	pub notifications: Arc<dyn NotificationSink>,
	pub settings: Arc<dyn SettingsStore>,
}

impl Host {
	/// Phase 1 builds the Command Bus and Permission Registry (nothing
	/// else depends on them circularly). Phase 2 constructs every manager
	/// holding a reference to phase 1's objects. Phase 3 registers each
	/// manager's command surface now that every manager exists.
	pub fn new(config: &HostConfig, workspace: Rect, surface_factory: Arc<dyn SurfaceFactory>, backend_launcher: Arc<dyn BackendLauncher>) -> Self {
		let permissions = Arc::new(PermissionRegistry::new());
		let commands = Arc::new(CommandBus::new(permissions.clone()));
		let events = Arc::new(EventBus::new(permissions.clone()));

		let apps_directory = config.apps_directory.clone().unwrap_or_else(|| PathBuf::from("/usr/share/eden/apps"));
		let user_directory = config.user_directory.clone().unwrap_or_else(|| PathBuf::from("~/.local/share/eden/apps"));
		let store = Arc::new(PackageStore::new(apps_directory, user_directory));

		let tiling = config.tiling.as_ref().map(|t| t.to_tiling_config()).unwrap_or_default();
		let views = Arc::new(ViewManager::new(workspace, tiling, surface_factory));
		let backends = Arc::new(BackendSupervisor::new(backend_launcher, events.clone()));
		let processes = Arc::new(ProcessManager::new(store.clone(), backends.clone(), views.clone(), events.clone()));
		let broker = Arc::new(ChannelBroker::new(permissions.clone(), events.clone(), views.clone(), backends.clone()));

		// A crashed backend is reported by the supervisor as an event rather
		// than a direct call, so ProcessManager and BackendSupervisor don't
		// need a circular Arc to each other (same pattern as the broker's
		// port-closed notification below).
		{
			let processes = processes.clone();
			let broker = broker.clone();
			events.add_internal_listener(Arc::new(move |event, payload| {
				if event != "backend/unsolicited-exit" {
					return;
				}
				let Some(app_id) = payload.get("app_id").and_then(|v| v.as_str()).map(String::from) else { return };
				let processes = processes.clone();
				let broker = broker.clone();
				tokio::spawn(async move {
					processes.handle_unsolicited_exit(&app_id).await;
					broker.unregister_all_for_app(&app_id);
				});
			}));
		}

		let host = Host {
			permissions,
			commands,
			events,
			store,
			views,
			backends,
			processes,
			broker,
			fs_sandbox: Arc::new(InMemoryFsSandbox::default()),
			notifications: Arc::new(RecordingNotificationSink::default()),
			settings: Arc::new(InMemorySettingsStore::default()),
		};
		host.register_commands();
		host
	}

	/// Loads the catalog and grants every known app's declared permissions.
	/// Call once after construction and before accepting commands.
	pub fn initialize(&self) -> Result<(), Error> {
		self.store.initialize()?;
		for entry in self.store.list() {
			self.permissions.register(&entry.manifest.id, &entry.manifest.permissions);
			if entry.manifest.autostart {
				self.events.notify("host/autostart-requested", json!({"app_id": entry.manifest.id}));
			}
		}
		Ok(())
	}

	fn register_commands(&self) {
		let processes = self.processes.clone();
		let launch = HandlerSpec {
			namespace: "process",
			action: "launch",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let processes = processes.clone();
				Box::pin(async move {
					let app_id = args.get("app_id").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("process/launch requires `app_id`"))?;
					let instance = processes.launch(app_id, None).await?;
					serde_json::to_value(instance).map_err(Error::from)
				})
			}),
		};

		let processes = self.processes.clone();
		let stop = HandlerSpec {
			namespace: "process",
			action: "stop",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let processes = processes.clone();
				Box::pin(async move {
					let app_id = args.get("app_id").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("process/stop requires `app_id`"))?;
					processes.stop(app_id).await?;
					Ok(json!(null))
				})
			}),
		};

		let processes = self.processes.clone();
		let reload = HandlerSpec {
			namespace: "process",
			action: "reload",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let processes = processes.clone();
				Box::pin(async move {
					let app_id = args.get("app_id").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("process/reload requires `app_id`"))?;
					let instance = processes.reload(app_id).await?;
					serde_json::to_value(instance).map_err(Error::from)
				})
			}),
		};

		self.commands.register_manager(vec![launch, stop, reload]);

		let store = self.store.clone();
		let list = HandlerSpec {
			namespace: "package",
			action: "list",
			required_perm: None,
			invoke: Arc::new(move |_args| {
				let store = store.clone();
				Box::pin(async move {
					let entries: Vec<_> = store.list().into_iter().map(|e| e.manifest).collect();
					serde_json::to_value(entries).map_err(Error::from)
				})
			}),
		};

		let store = self.store.clone();
		let uninstall = HandlerSpec {
			namespace: "package",
			action: "uninstall",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let store = store.clone();
				Box::pin(async move {
					let app_id = args.get("app_id").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("package/uninstall requires `app_id`"))?;
					store.uninstall(app_id).await?;
					Ok(json!(null))
				})
			}),
		};

		self.commands.register_manager(vec![list, uninstall]);

		let permissions = self.permissions.clone();
		let granted = HandlerSpec {
			namespace: "permissions",
			action: "granted",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let permissions = permissions.clone();
				Box::pin(async move {
					let app_id = args.get("app_id").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("permissions/granted requires `app_id`"))?;
					Ok(json!(permissions.granted(app_id)))
				})
			}),
		};

		self.commands.register_manager(vec![granted]);

		let broker = self.broker.clone();
		let connect = HandlerSpec {
			namespace: "broker",
			action: "connect",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let broker = broker.clone();
				Box::pin(async move {
					let caller = caller_app_id(&args).ok_or_else(|| Error::bad_format("broker/connect requires a caller context"))?.to_string();
					let target_app = args.get("target_app").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("broker/connect requires `target_app`"))?;
					let service_name = args.get("service").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("broker/connect requires `service`"))?;
					let connection_id = broker.connect(&caller, target_app, service_name).await?;
					Ok(json!({"connection_id": connection_id}))
				})
			}),
		};

		self.commands.register_manager(vec![connect]);

		let events = self.events.clone();
		let view_load_failed = HandlerSpec {
			namespace: "view",
			action: "report-load-failed",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let events = events.clone();
				Box::pin(async move {
					let view_id = args.get("view_id").and_then(|v| v.as_u64()).ok_or_else(|| Error::bad_format("view/report-load-failed requires `view_id`"))?;
					// The view is retained for inspection, not destroyed
					// (spec §4.10) — this only broadcasts the failure.
					events.notify("view-load-failed", json!({"view_id": view_id}));
					Ok(json!(null))
				})
			}),
		};

		self.commands.register_manager(vec![view_load_failed]);

		let fs_sandbox = self.fs_sandbox.clone();
		let fs_read = HandlerSpec {
			namespace: "fs",
			action: "read",
			required_perm: Some("fs/read"),
			invoke: Arc::new(move |args| {
				let fs_sandbox = fs_sandbox.clone();
				Box::pin(async move {
					let caller = caller_app_id(&args).ok_or_else(|| Error::bad_format("fs/read requires a caller context"))?.to_string();
					let path = args.get("path").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("fs/read requires `path`"))?;
					let bytes = fs_sandbox.read(&caller, path)?;
					Ok(json!({"bytes": bytes}))
				})
			}),
		};

		let fs_sandbox = self.fs_sandbox.clone();
		let fs_write = HandlerSpec {
			namespace: "fs",
			action: "write",
			required_perm: Some("fs/write"),
			invoke: Arc::new(move |args| {
				let fs_sandbox = fs_sandbox.clone();
				Box::pin(async move {
					let caller = caller_app_id(&args).ok_or_else(|| Error::bad_format("fs/write requires a caller context"))?.to_string();
					let path = args.get("path").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("fs/write requires `path`"))?;
					let bytes: Vec<u8> = serde_json::from_value(args.get("bytes").cloned().unwrap_or(json!([]))).map_err(Error::from)?;
					fs_sandbox.write(&caller, path, &bytes)?;
					Ok(json!(null))
				})
			}),
		};

		self.commands.register_manager(vec![fs_read, fs_write]);

		let notifications = self.notifications.clone();
		let notify_send = HandlerSpec {
			namespace: "notify",
			action: "send",
			required_perm: Some("notify/send"),
			invoke: Arc::new(move |args| {
				let notifications = notifications.clone();
				Box::pin(async move {
					let caller = caller_app_id(&args).ok_or_else(|| Error::bad_format("notify/send requires a caller context"))?.to_string();
					let title = args.get("title").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("notify/send requires `title`"))?;
					let body = args.get("body").and_then(|v| v.as_str()).unwrap_or("");
					notifications.notify(&caller, title, body);
					Ok(json!(null))
				})
			}),
		};

		self.commands.register_manager(vec![notify_send]);

		let settings = self.settings.clone();
		let settings_get = HandlerSpec {
			namespace: "settings",
			action: "get",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let settings = settings.clone();
				Box::pin(async move {
					let caller = caller_app_id(&args).ok_or_else(|| Error::bad_format("settings/get requires a caller context"))?.to_string();
					let key = args.get("key").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("settings/get requires `key`"))?;
					Ok(settings.get(&caller, key).unwrap_or(json!(null)))
				})
			}),
		};

		let settings = self.settings.clone();
		let settings_set = HandlerSpec {
			namespace: "settings",
			action: "set",
			required_perm: None,
			invoke: Arc::new(move |args| {
				let settings = settings.clone();
				Box::pin(async move {
					let caller = caller_app_id(&args).ok_or_else(|| Error::bad_format("settings/set requires a caller context"))?.to_string();
					let key = args.get("key").and_then(|v| v.as_str()).ok_or_else(|| Error::bad_format("settings/set requires `key`"))?;
					let value = args.get("value").cloned().unwrap_or(json!(null));
					settings.set(&caller, key, value);
					Ok(json!(null))
				})
			}),
		};

		self.commands.register_manager(vec![settings_get, settings_set]);
	}

	/// Stops every running app and clears command/event/broker state. The
	/// reverse order of construction: processes first (they hold backends
	/// and views), then the rest are just dropped with the `Host`.
	pub async fn shutdown(&self) {
		self.processes.shutdown().await;
	}
}
