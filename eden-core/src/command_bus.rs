//! Command Bus — namespaced `"ns/action" -> handler` registry with a
//! per-handler permission check and a 10 s dispatch deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::permissions::PermissionRegistry;

const COMMAND_DEADLINE: Duration = Duration::from_secs(10);

/// Reserved keys `execute` injects into every call's `args` object: who's
/// asking, and what surface they're asking from. Handlers read these the
/// same way they read any other argument — there is no separate context
/// parameter (spec §4.3: "args always carry injected context keys").
pub const CALLER_APP_ID_KEY: &str = "_caller_app_id";
pub const CALLER_SURFACE_ID_KEY: &str = "_caller_surface_id";

pub type HandlerFn = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<JsonValue, Error>> + Send + Sync>;

/// One entry in a manager's `handlers()` list — the explicit, reflection-free
/// replacement for the source's decorator-based registration (spec §9).
#[derive(Clone)]
pub struct HandlerSpec {
	pub namespace: &'static str,
	pub action: &'static str,
	pub required_perm: Option<&'static str>,
	pub invoke: HandlerFn,
}

impl HandlerSpec {
	pub fn command_name(&self) -> String {
		format!("{}/{}", self.namespace, self.action)
	}
}

/// Reads the caller's app id back out of a handler's `args`, the
/// counterpart to the key `execute` injects. Absent when the command
/// was dispatched with no caller (e.g. a host-internal call).
pub fn caller_app_id(args: &JsonValue) -> Option<&str> {
	args.get(CALLER_APP_ID_KEY).and_then(|v| v.as_str())
}

pub fn caller_surface_id(args: &JsonValue) -> Option<u32> {
	args.get(CALLER_SURFACE_ID_KEY).and_then(|v| v.as_u64()).map(|v| v as u32)
}

struct RegisteredHandler {
	required_perm: Option<&'static str>,
	invoke: HandlerFn,
}

pub struct CommandBus {
	handlers: std::sync::Mutex<HashMap<String, RegisteredHandler>>,
	permissions: Arc<PermissionRegistry>,
}

impl CommandBus {
	pub fn new(permissions: Arc<PermissionRegistry>) -> Self {
		CommandBus { handlers: std::sync::Mutex::new(HashMap::new()), permissions }
	}

	/// Enumerates a manager's `HandlerSpec`s and registers each one.
	/// Duplicate registration overwrites the previous handler with a
	/// warning, matching spec §4.3.
	pub fn register_manager(&self, specs: Vec<HandlerSpec>) {
		let mut handlers = self.handlers.lock().expect("command handlers poisoned");
		for spec in specs {
			let name = spec.command_name();
			if handlers.contains_key(&name) {
				tracing::warn!(command = %name, "overwriting existing command handler");
			}
			handlers.insert(name, RegisteredHandler { required_perm: spec.required_perm, invoke: spec.invoke });
		}
	}

	/// Executes a command under a 10 s deadline (spec §4.3, §5). Timing
	/// out surfaces [`Error::Timeout`]; the handler itself is not
	/// cancelled, but its eventual result is discarded. A handler that
	/// panics surfaces as [`Error::Internal`] rather than unwinding into
	/// the caller — handler exceptions never take down the host (§4.10).
	pub async fn execute(&self, command: &str, args: JsonValue, caller_app_id: Option<&str>) -> Result<JsonValue, Error> {
		self.execute_from_surface(command, args, caller_app_id, None).await
	}

	/// Same as [`CommandBus::execute`] but also injects the calling
	/// surface's id, for handlers that need to scope a reply to the view
	/// that asked (spec §4.3).
	pub async fn execute_from_surface(&self, command: &str, mut args: JsonValue, caller_app_id: Option<&str>, caller_surface_id: Option<u32>) -> Result<JsonValue, Error> {
		let (required_perm, invoke) = {
			let handlers = self.handlers.lock().expect("command handlers poisoned");
			let handler = handlers.get(command).ok_or_else(|| Error::not_found(format!("command `{command}`")))?;
			(handler.required_perm, handler.invoke.clone())
		};

		if let (Some(perm), Some(caller)) = (required_perm, caller_app_id) {
			if !self.permissions.has(caller, perm) {
				return Err(Error::PermissionDenied(format!("{caller} lacks `{perm}` required by `{command}`")));
			}
		}

		if let Some(object) = args.as_object_mut() {
			object.insert(CALLER_APP_ID_KEY.to_string(), caller_app_id.map(JsonValue::from).unwrap_or(JsonValue::Null));
			object.insert(CALLER_SURFACE_ID_KEY.to_string(), caller_surface_id.map(JsonValue::from).unwrap_or(JsonValue::Null));
		}

		let command_owned = command.to_string();
		let guarded = std::panic::AssertUnwindSafe(invoke(args)).catch_unwind();
		let result = tokio::time::timeout(COMMAND_DEADLINE, guarded).await;

		match result {
			Ok(Ok(inner)) => inner,
			Ok(Err(_panic)) => {
				tracing::error!(command = %command_owned, "command handler panicked");
				Err(Error::Internal(command_owned))
			}
			Err(_) => Err(Error::Timeout(command_owned)),
		}
	}
}
