//! Cluster controller (spec §4.I): sequences startup and shutdown of
//! every other component, the way the teacher's `System` owns the
//! fate-shared ping/discovery/status-exchange loops under one `run`.
//! Unlike that single `join!`, components here can fail independently
//! after startup, so they run in a cancellation-linked [`JoinSet`]
//! instead: one failure cancels the rest.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use uncloud_dns::{serve as dns_serve, DnsServerConfig, ResolverTable};
use uncloud_overlay::{Overlay, TunnelDriver};
use uncloud_store::StoreClient;
use uncloud_util::{Error, ErrorKind};

use crate::api::ApiServer;
use crate::gossip::GossipEngine;
use crate::reconciler::{ContainerReconciler, EndpointWatcher, PeerReconciler, SyncNowHandle};
use crate::state::State;

const DB_VERSION_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SIDE_SERVICE_STOP_DEADLINE: Duration = Duration::from_secs(30);

/// Hook for additional long-running services the controller supervises
/// alongside the built-in reconcilers. No concrete implementations are
/// registered; this exists so the startup/shutdown sequencing has a
/// seam to extend through rather than hardcoding a fixed component
/// list.
#[async_trait]
pub trait SideService: Send + Sync {
	fn name(&self) -> &str;
	async fn run(&self, cancel: CancellationToken) -> Result<(), Error>;
}

pub struct ControllerConfig {
	pub api_socket_path: PathBuf,
	pub api_tcp_addr: SocketAddr,
	pub dns: DnsServerConfig,
	pub gossip_binary: PathBuf,
	pub gossip_args: Vec<String>,
	pub bridge_name: String,
}

/// Signals exposed to whatever launched the controller (spec §4.I steps
/// 9 and shutdown step 5): closed once the cluster is ready to serve,
/// and once shutdown has fully unwound.
pub struct ControllerHandles {
	pub ready: watch::Receiver<bool>,
	pub stopped: watch::Receiver<bool>,
}

pub struct Controller<D: TunnelDriver> {
	config: ControllerConfig,
	state: Arc<State>,
	store: Arc<StoreClient>,
	overlay: Arc<Overlay<D>>,
	resolver: ResolverTable,
	side_services: Vec<Arc<dyn SideService>>,
	ready_tx: watch::Sender<bool>,
	stopped_tx: watch::Sender<bool>,
}

impl<D: TunnelDriver + 'static> Controller<D> {
	pub fn new(
		config: ControllerConfig,
		state: Arc<State>,
		store: Arc<StoreClient>,
		overlay: Arc<Overlay<D>>,
		resolver: ResolverTable,
		side_services: Vec<Arc<dyn SideService>>,
	) -> (Self, ControllerHandles) {
		let (ready_tx, ready) = watch::channel(false);
		let (stopped_tx, stopped) = watch::channel(false);
		(
			Controller {
				config,
				state,
				store,
				overlay,
				resolver,
				side_services,
				ready_tx,
				stopped_tx,
			},
			ControllerHandles { ready, stopped },
		)
	}

	/// Runs the full startup sequence, then blocks until `cancel` fires,
	/// then runs the shutdown sequence (spec §4.I).
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
		// Step 1: program the firewall allow rule, confirm the local
		// container runtime is reachable, and ensure the local bridge
		// network exists, before anything depending on containers or
		// inbound tunnel traffic starts.
		let docker = self.ensure_container_runtime_ready().await?;

		// Step 2: push this machine's current peer set into the tunnel
		// before anything else comes up, so the overlay is already
		// routable once other components start depending on it.
		let desired = self
			.state
			.read()
			.await
			.network
			.peers
			.iter()
			.map(|p| uncloud_overlay::overlay::DesiredPeerState {
				public_key: p.public_key,
				subnet: p.subnet,
				management_addr: p.management_ip,
				candidates: p.all_endpoints.clone(),
				preferred_endpoint: p.endpoint,
			})
			.collect::<Vec<_>>();
		self.overlay.configure(&desired).await?;

		// Step 3: start the gossip engine.
		let mut gossip = GossipEngine::new(self.config.gossip_binary.clone(), self.config.gossip_args.clone());
		gossip.start().await?;

		// Step 4: launch the overlay's own tick loop (F's source of
		// endpoint events) and the endpoint watcher (F) as a fate-shared
		// error-group: either failing cancels the other.
		let error_group_cancel = cancel.child_token();
		let mut error_group: JoinSet<Result<(), Error>> = JoinSet::new();

		let overlay_run = self.overlay.clone();
		let overlay_cancel = error_group_cancel.clone();
		error_group.spawn(async move { overlay_run.run(overlay_cancel).await });

		let endpoint_rx = self.overlay.watch_endpoints();
		let mut endpoint_watcher = EndpointWatcher::new(self.state.clone(), endpoint_rx);
		let endpoint_cancel = error_group_cancel.clone();
		error_group.spawn(async move { endpoint_watcher.run(endpoint_cancel).await });

		// Step 5: bind and start the control API (G).
		let machine_id = self.state.read().await.id.clone();
		let api = ApiServer::new(self.config.api_socket_path.clone(), self.config.api_tcp_addr, machine_id);
		let api_cancel = cancel.child_token();
		let mut api_task = tokio::spawn({
			let api_cancel = api_cancel.clone();
			async move { api.serve(api_cancel).await }
		});

		// Step 6: wait for the store schema this machine depends on,
		// then clear the requirement once satisfied.
		self.wait_for_store_version(&cancel).await?;

		// Step 7: launch the container reconciler (D), the peer
		// reconciler (E), and any registered side services.
		let mut work: JoinSet<(String, Result<(), Error>)> = JoinSet::new();

		let (mut container_reconciler, sync_now) = ContainerReconciler::new(docker, self.store.clone(), self.state.read().await.id.clone());
		let _sync_now: SyncNowHandle = sync_now;
		let container_cancel = error_group_cancel.clone();
		work.spawn(async move { ("container_reconciler".to_string(), container_reconciler.run(container_cancel).await) });

		let peer_reconciler = PeerReconciler::new(
			self.store.clone(),
			self.state.clone(),
			self.overlay.clone(),
			self.state.read().await.id.clone(),
		);
		let peer_cancel = error_group_cancel.clone();
		work.spawn(async move { ("peer_reconciler".to_string(), peer_reconciler.run(peer_cancel).await) });

		let resolver = self.resolver.clone();
		let dns_config = self.config.dns.clone();
		let dns_cancel = error_group_cancel.clone();
		work.spawn(async move { ("dns_server".to_string(), dns_serve(dns_config, resolver, dns_cancel).await) });

		for service in &self.side_services {
			let service = service.clone();
			let name = service.name().to_string();
			let service_cancel = error_group_cancel.clone();
			work.spawn(async move { (name, service.run(service_cancel).await) });
		}

		// Step 9: signal readiness.
		let _ = self.ready_tx.send(true);
		info!("cluster controller ready");

		// Wait for cancellation, or for any fate-shared task to exit
		// (which, for this fleet, always means failure while un-canceled).
		tokio::select! {
			_ = cancel.cancelled() => {}
			result = Self::drain_until_failure(&mut error_group) => {
				if let Err(e) = result {
					error!(error = %e, "controller error-group member failed, shutting down");
				}
				error_group_cancel.cancel();
			}
			result = Self::drain_until_failure(&mut work) => {
				if let Err(e) = result {
					error!(error = %e, "controller side task failed, shutting down");
				}
				error_group_cancel.cancel();
			}
		}

		self.shutdown(cancel, error_group_cancel, api_cancel, &mut api_task, error_group, work, gossip).await
	}

	/// Spec §4.I startup step 1: allow the overlay's UDP port through the
	/// host firewall, confirm the container runtime answers, and ensure
	/// the bridge network containers attach to exists. Returns the
	/// connected Docker client for reuse by the container reconciler (D),
	/// whose spawn this step gates.
	async fn ensure_container_runtime_ready(&self) -> Result<bollard::Docker, Error> {
		uncloud_overlay::firewall::ensure_allow_rule(self.overlay.listen_port()).await?;

		let docker = bollard::Docker::connect_with_local_defaults()
			.map_err(|e| Error::new(ErrorKind::RuntimeUnavailable, e))?;
		docker
			.version()
			.await
			.map_err(|e| Error::new(ErrorKind::RuntimeUnavailable, anyhow::anyhow!(e)))?;

		use bollard::network::CreateNetworkOptions;
		let exists = docker
			.inspect_network::<String>(&self.config.bridge_name, None)
			.await
			.is_ok();
		if !exists {
			docker
				.create_network(CreateNetworkOptions {
					name: self.config.bridge_name.clone(),
					driver: "bridge".to_string(),
					..Default::default()
				})
				.await
				.map_err(|e| Error::new(ErrorKind::RuntimeUnavailable, anyhow::anyhow!(e)))?;
			info!(bridge = %self.config.bridge_name, "created container bridge network");
		}

		Ok(docker)
	}

	async fn wait_for_store_version(&self, cancel: &CancellationToken) -> Result<(), Error> {
		let Some(min_version) = self.state.read().await.network.min_store_db_version else {
			return Ok(());
		};

		let mut last_log = std::time::Instant::now() - Duration::from_secs(10);
		let mut last_error_log = std::time::Instant::now() - Duration::from_secs(10);
		loop {
			if cancel.is_cancelled() {
				return Err(Error::msg(ErrorKind::Canceled, "controller canceled while waiting for store"));
			}
			match self.store.db_version().await {
				Ok(v) if v >= min_version => {
					self.state.clear_min_store_version().await?;
					return Ok(());
				}
				Ok(v) => {
					if last_log.elapsed() >= Duration::from_secs(1) {
						info!(current = v, required = min_version, "waiting for store to catch up");
						last_log = std::time::Instant::now();
					}
				}
				Err(e) => {
					if last_error_log.elapsed() >= Duration::from_secs(5) {
						warn!(error = %e, "store version check failed, retrying");
						last_error_log = std::time::Instant::now();
					}
				}
			}
			tokio::time::sleep(DB_VERSION_POLL_INTERVAL).await;
		}
	}

	async fn drain_until_failure<T>(set: &mut JoinSet<T>) -> Result<(), Error>
	where
		T: IntoFallible,
	{
		while let Some(joined) = set.join_next().await {
			match joined {
				Ok(value) => {
					if let Err(e) = value.into_fallible() {
						return Err(e);
					}
				}
				Err(e) => return Err(Error::new(ErrorKind::Other, e)),
			}
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	async fn shutdown(
		&self,
		cancel: CancellationToken,
		error_group_cancel: CancellationToken,
		api_cancel: CancellationToken,
		api_task: &mut tokio::task::JoinHandle<Result<(), Error>>,
		error_group: JoinSet<Result<(), Error>>,
		work: JoinSet<(String, Result<(), Error>)>,
		mut gossip: GossipEngine,
	) -> Result<(), Error> {
		// Step 1: stop the API gracefully, hard-stop past its deadline.
		api_cancel.cancel();
		if tokio::time::timeout(crate::api::GRACEFUL_STOP_DEADLINE, &mut *api_task).await.is_err() {
			warn!("control api did not stop gracefully in time, aborting");
			api_task.abort();
		}

		// Step 2: stop side services and reconcilers (30s deadline each).
		error_group_cancel.cancel();
		Self::drain_with_deadline(work, SIDE_SERVICE_STOP_DEADLINE).await;

		// Step 3: wait for the overlay/endpoint-watcher error-group.
		Self::drain_with_deadline(error_group, SIDE_SERVICE_STOP_DEADLINE).await;

		// Step 4: stop gossip.
		gossip.stop().await?;

		// Step 5: signal fully stopped, then release tunnel/firewall
		// resources.
		let _ = self.stopped_tx.send(true);
		self.overlay.cleanup().await?;

		let _ = cancel; // retained for symmetry with the startup signature
		info!("cluster controller stopped");
		Ok(())
	}

	async fn drain_with_deadline<T: Send + 'static>(mut set: JoinSet<T>, deadline: Duration) {
		let _ = tokio::time::timeout(deadline, async {
			while set.join_next().await.is_some() {}
		})
		.await;
		set.abort_all();
	}
}

/// Lets [`Controller::drain_until_failure`] work over both a bare
/// `Result<(), Error>` error-group and a `(name, Result<(), Error>)`
/// labeled work set.
trait IntoFallible {
	fn into_fallible(self) -> Result<(), Error>;
}

impl IntoFallible for Result<(), Error> {
	fn into_fallible(self) -> Result<(), Error> {
		self
	}
}

impl IntoFallible for (String, Result<(), Error>) {
	fn into_fallible(self) -> Result<(), Error> {
		self.1.map_err(|e| Error::new(e.kind(), anyhow::anyhow!("{}: {}", self.0, e)))
	}
}
