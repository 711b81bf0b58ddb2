//! Container reconciler (spec §4.D): keeps the `containers` table's
//! rows owned by this machine in step with the local container runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bollard::container::ListContainersOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uncloud_store::StoreClient;
use uncloud_util::backoff::Backoff;
use uncloud_util::debounce::{debouncer, DebounceSignal};
use uncloud_util::{Error, ErrorKind};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
const FALLBACK_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Docker event actions that warrant a resync (spec §4.D).
const RELEVANT_ACTIONS: &[&str] = &[
	"create",
	"start",
	"stop",
	"pause",
	"unpause",
	"kill",
	"die",
	"oom",
	"destroy",
	"health_status: healthy",
	"health_status: unhealthy",
];

/// Handle producers can use to request an out-of-band sync (spec §4.D
/// "on demand via a one-shot sync now channel").
#[derive(Clone)]
pub struct SyncNowHandle(mpsc::Sender<()>);

impl SyncNowHandle {
	pub fn request(&self) {
		let _ = self.0.try_send(());
	}
}

pub struct ContainerReconciler {
	docker: Docker,
	store: Arc<StoreClient>,
	machine_id: String,
	sync_now_rx: mpsc::Receiver<()>,
}

impl ContainerReconciler {
	pub fn new(docker: Docker, store: Arc<StoreClient>, machine_id: String) -> (Self, SyncNowHandle) {
		let (tx, rx) = mpsc::channel(1);
		(
			ContainerReconciler {
				docker,
				store,
				machine_id,
				sync_now_rx: rx,
			},
			SyncNowHandle(tx),
		)
	}

	/// One immediate sync on startup, then watch forever (spec §4.D).
	/// Transient store errors are retried with unbounded exponential
	/// backoff around the whole watch loop.
	pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), Error> {
		let mut backoff = Backoff::container_watch();
		loop {
			match self.watch(&cancel).await {
				Ok(()) => return Ok(()), // only returns Ok on clean cancellation
				Err(e) if e.is_canceled() => return Err(e),
				Err(e) => {
					warn!(error = %e, "container reconciler watch loop failed, retrying");
					backoff.wait().await;
				}
			}
		}
	}

	async fn watch(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
		self.sync_once().await?;

		let (sig, mut debouncer) = debouncer(DEBOUNCE_WINDOW);
		let mut events = self.event_stream();
		let mut fallback = tokio::time::interval(FALLBACK_SYNC_INTERVAL);
		fallback.tick().await; // consume the immediate first tick

		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => {
					return Err(Error::msg(ErrorKind::Canceled, "container reconciler canceled"));
				}
				event = events.next() => {
					match event {
						Some(Ok(action)) if is_relevant(&action) => sig.signal(),
						Some(Ok(_)) => {}
						Some(Err(e)) => return Err(e),
						None => return Err(Error::msg(ErrorKind::RuntimeUnavailable, "container event stream closed")),
					}
				}
				Some(()) = debouncer.recv() => {
					self.sync_once().await?;
				}
				_ = fallback.tick() => {
					debug!("fallback container sync");
					self.sync_once().await?;
				}
				Some(()) = self.sync_now_rx.recv() => {
					self.sync_once().await?;
				}
			}
		}
	}

	fn event_stream(&self) -> impl futures_util::Stream<Item = Result<String, Error>> + '_ {
		let options = EventsOptions::<String> {
			filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
			..Default::default()
		};
		self.docker.events(Some(options)).map(|item| {
			item.map(|e| e.action.unwrap_or_default())
				.map_err(|e| Error::new(ErrorKind::RuntimeUnavailable, e))
		})
	}

	/// One sync round (spec §4.D "One sync"): diff store rows against the
	/// runtime's local containers by id, delete vanished ones, then
	/// conditionally upsert the rest.
	async fn sync_once(&self) -> Result<(), Error> {
		let local = self.list_local_containers().await?;
		let local_ids: HashSet<&str> = local.keys().map(String::as_str).collect();

		let stored_ids = self.list_store_row_ids().await?;
		let vanished: Vec<&str> = stored_ids
			.iter()
			.map(String::as_str)
			.filter(|id| !local_ids.contains(id))
			.collect();

		if !vanished.is_empty() {
			self.delete_rows(&vanished).await?;
		}

		for (id, inspect) in &local {
			self.upsert_row(id, inspect).await?;
		}

		Ok(())
	}

	async fn list_local_containers(&self) -> Result<HashMap<String, Value>, Error> {
		let options = ListContainersOptions::<String> {
			all: true,
			..Default::default()
		};
		let containers = self
			.docker
			.list_containers(Some(options))
			.await
			.map_err(|e| Error::new(ErrorKind::RuntimeUnavailable, e))?;

		let mut out = HashMap::with_capacity(containers.len());
		for summary in containers {
			let Some(id) = summary.id.clone() else { continue };
			let inspect = self
				.docker
				.inspect_container(&id, None)
				.await
				.map_err(|e| Error::new(ErrorKind::RuntimeUnavailable, e))?;
			let mut value = serde_json::to_value(inspect).map_err(Error::from)?;
			strip_env(&mut value);
			out.insert(id, value);
		}
		Ok(out)
	}

	async fn list_store_row_ids(&self) -> Result<Vec<String>, Error> {
		let mut rows = self
			.store
			.query(
				"SELECT id FROM containers WHERE machine_id = ?",
				&[json!(self.machine_id)],
			)
			.await?;
		let mut ids = Vec::new();
		while rows.next().await? {
			let id: String = rows.scan::<String>(&[0])?.remove(0);
			ids.push(id);
		}
		Ok(ids)
	}

	async fn delete_rows(&self, ids: &[&str]) -> Result<(), Error> {
		let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
		let stmt = format!("DELETE FROM containers WHERE id IN ({placeholders})");
		let args: Vec<Value> = ids.iter().map(|id| json!(id)).collect();
		let result = self.store.exec(&stmt, &args).await?;
		if let Some(e) = result.first_error() {
			return Err(e);
		}
		info!(count = ids.len(), "deleted vanished container rows");
		Ok(())
	}

	/// Conditional UPSERT: only overwrite when `container` or
	/// `machine_id` changed (spec §4.D).
	async fn upsert_row(&self, id: &str, inspect: &Value) -> Result<(), Error> {
		let now = now_millis();
		let result = self
			.store
			.exec(
				"INSERT INTO containers (id, container, machine_id, sync_status, updated_at) \
				 VALUES (?, ?, ?, 'synced', ?) \
				 ON CONFLICT(id) DO UPDATE SET \
				   container = excluded.container, machine_id = excluded.machine_id, \
				   sync_status = 'synced', updated_at = excluded.updated_at \
				 WHERE containers.container IS DISTINCT FROM excluded.container \
				    OR containers.machine_id IS DISTINCT FROM excluded.machine_id",
				&[json!(id), inspect.clone(), json!(self.machine_id), json!(now)],
			)
			.await?;
		if let Some(e) = result.first_error() {
			return Err(e);
		}
		Ok(())
	}
}

fn is_relevant(action: &str) -> bool {
	RELEVANT_ACTIONS.iter().any(|a| action.starts_with(a))
}

/// Strip `Env` from both the top-level runtime inspect payload and any
/// embedded service spec under `Config.Labels` (spec §4.D: "Env
/// stripped from both the runtime inspect payload and any embedded
/// service spec").
fn strip_env(value: &mut Value) {
	if let Some(config) = value.get_mut("Config").and_then(|c| c.as_object_mut()) {
		config.remove("Env");
		if let Some(labels) = config.get_mut("Labels").and_then(|l| l.as_object_mut()) {
			if let Some(spec_raw) = labels.get("uncloud.service.spec").and_then(|s| s.as_str()) {
				if let Ok(mut spec) = serde_json::from_str::<Value>(spec_raw) {
					if let Some(obj) = spec.as_object_mut() {
						obj.remove("Env");
					}
					labels.insert(
						"uncloud.service.spec".to_string(),
						json!(spec.to_string()),
					);
				}
			}
		}
	}
}

fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before 1970")
		.as_millis() as u64
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn relevant_actions_match_prefixes() {
		assert!(is_relevant("die"));
		assert!(is_relevant("health_status: healthy"));
		assert!(!is_relevant("exec_create"));
	}

	#[test]
	fn strip_env_removes_top_level_and_embedded_spec() {
		let mut value = json!({
			"Config": {
				"Env": ["A=1"],
				"Labels": {
					"uncloud.service.spec": "{\"Env\":[\"B=2\"],\"Image\":\"nginx\"}"
				}
			}
		});
		strip_env(&mut value);
		assert!(value["Config"].get("Env").is_none());
		let spec_raw = value["Config"]["Labels"]["uncloud.service.spec"].as_str().unwrap();
		let spec: Value = serde_json::from_str(spec_raw).unwrap();
		assert!(spec.get("Env").is_none());
		assert_eq!(spec["Image"], "nginx");
	}
}
