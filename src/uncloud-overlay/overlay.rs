//! The overlay tunnel manager itself (spec §4.A): owns the peer set,
//! runs the once-per-second liveness/rotation tick, and fans endpoint
//! change events out to [`crate::overlay::Overlay::watch_endpoints`]
//! subscribers (consumed by the network endpoint watcher, component F).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{DesiredConfig, DesiredPeer, PeerEndpointUpdate, TunnelDriver};
use crate::peer::{should_change_endpoint, Peer, PublicKey};
use crate::route::route_cover;
use uncloud_util::{Error, ErrorKind};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const WATCH_CHANNEL_CAPACITY: usize = 256;
const OVERLAY_UDP_PORT: u16 = 51820;
const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// This machine's side of the overlay: its own key material and address.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
	pub private_key: [u8; 32],
	pub listen_port: u16,
	pub address: Ipv4Addr,
	pub address_prefix_len: u8,
}

impl OverlayConfig {
	pub fn default_port(private_key: [u8; 32], address: Ipv4Addr, address_prefix_len: u8) -> Self {
		OverlayConfig {
			private_key,
			listen_port: OVERLAY_UDP_PORT,
			address,
			address_prefix_len,
		}
	}
}

/// Desired state of one remote peer, as computed by the peer reconciler
/// (component E) from the cluster's machine roster.
#[derive(Debug, Clone)]
pub struct DesiredPeerState {
	pub public_key: PublicKey,
	pub subnet: Option<Ipv4Net>,
	pub management_addr: Ipv4Addr,
	pub candidates: Vec<SocketAddr>,
	/// Endpoint to prefer selecting initially, e.g. because it was live
	/// in the previously persisted state (spec §4.E "preserve live
	/// endpoints").
	pub preferred_endpoint: Option<SocketAddr>,
}

/// An endpoint rotation or auto-learned endpoint change, consumed by the
/// network endpoint watcher (component F) to persist back into state.
#[derive(Debug, Clone, Copy)]
pub struct EndpointEvent {
	pub public_key: PublicKey,
	pub endpoint: SocketAddr,
}

struct Inner {
	config: OverlayConfig,
	peers: HashMap<PublicKey, Peer>,
}

pub struct Overlay<D: TunnelDriver> {
	driver: Arc<D>,
	listen_port: u16,
	inner: Mutex<Inner>,
	watch_tx: broadcast::Sender<EndpointEvent>,
}

impl<D: TunnelDriver> Overlay<D> {
	pub fn new(driver: Arc<D>, config: OverlayConfig) -> Self {
		let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
		let listen_port = config.listen_port;
		Overlay {
			driver,
			listen_port,
			inner: Mutex::new(Inner {
				config,
				peers: HashMap::new(),
			}),
			watch_tx,
		}
	}

	/// The UDP port this machine's WireGuard interface listens on, fixed
	/// at construction (spec §4.A's config is never rekeyed to a new
	/// port). Used by startup to program the firewall allow rule before
	/// the interface itself comes up.
	pub fn listen_port(&self) -> u16 {
		self.listen_port
	}

	/// `Configure(state)` (spec §4.A): idempotent full replace of the
	/// peer set. Serialized against the periodic tick by `inner`'s lock.
	pub async fn configure(&self, desired_peers: &[DesiredPeerState]) -> Result<(), Error> {
		let mut inner = self.inner.lock().await;

		let mut next_peers = HashMap::with_capacity(desired_peers.len());
		for d in desired_peers {
			let mut peer = inner
				.peers
				.remove(&d.public_key)
				.unwrap_or_else(|| Peer::new(d.public_key, d.management_addr));
			peer.subnet = d.subnet;
			peer.management_addr = d.management_addr;
			peer.candidates = d.candidates.clone();

			// Keep a live selected endpoint; else prefer what the
			// reconciler suggested; else fall back to the first candidate.
			peer.endpoint = match peer.endpoint {
				Some(e) if peer.candidates.contains(&e) => Some(e),
				_ => d
					.preferred_endpoint
					.filter(|e| peer.candidates.contains(e))
					.or_else(|| peer.candidates.first().copied()),
			};
			next_peers.insert(d.public_key, peer);
		}
		inner.peers = next_peers;

		let mut routes: Vec<Ipv4Net> = inner
			.peers
			.values()
			.flat_map(|p| p.allowed_ranges())
			.filter_map(|n| match n {
				ipnet::IpNet::V4(v4) => Some(v4),
				_ => None,
			})
			.collect();
		routes.sort_by_key(|n| (u32::from(n.network()), n.prefix_len()));
		let routes = route_cover(&routes);

		let desired = DesiredConfig {
			private_key: inner.config.private_key,
			listen_port: inner.config.listen_port,
			address: inner.config.address,
			address_prefix_len: inner.config.address_prefix_len,
			routes,
			peers: inner
				.peers
				.values()
				.map(|p| DesiredPeer {
					public_key: p.public_key,
					allowed_ips: p.allowed_ranges(),
					endpoint: p.endpoint,
					persistent_keepalive: Some(PERSISTENT_KEEPALIVE_SECS),
				})
				.collect(),
		};

		self.driver.configure(&desired).await
	}

	/// Subscribe to endpoint-change events (spec §4.A `WatchEndpoints`).
	/// Back-pressure is not applied to the producer: a slow subscriber
	/// silently misses old events (`broadcast`'s lagged-receiver
	/// semantics), per spec's explicit "drop oldest on overflow"
	/// allowance.
	pub fn watch_endpoints(&self) -> broadcast::Receiver<EndpointEvent> {
		self.watch_tx.subscribe()
	}

	/// `Run(ctx)` (spec §4.A): once per second, rotate dead endpoints,
	/// refresh liveness from interface stats, and surface any endpoint
	/// the interface itself learned.
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
		let mut ticker = tokio::time::interval(TICK_INTERVAL);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					return Err(Error::msg(ErrorKind::Canceled, "overlay run canceled"));
				}
				_ = ticker.tick() => {
					self.tick().await?;
				}
			}
		}
	}

	async fn tick(&self) -> Result<(), Error> {
		let now = Instant::now();
		let mut inner = self.inner.lock().await;

		let mut rotations = Vec::new();
		for peer in inner.peers.values_mut() {
			peer.recompute_liveness(now);
			if let Some(new_endpoint) = should_change_endpoint(peer) {
				if Some(new_endpoint) != peer.endpoint {
					peer.endpoint = Some(new_endpoint);
					peer.last_endpoint_change = Some(now);
					rotations.push(PeerEndpointUpdate {
						public_key: peer.public_key,
						endpoint: new_endpoint,
					});
				}
			}
		}
		drop(inner);

		for update in &rotations {
			self.driver.update_peer_endpoint(update).await?;
			debug!(peer = %update.public_key, endpoint = %update.endpoint, "rotated peer endpoint");
			let _ = self.watch_tx.send(EndpointEvent {
				public_key: update.public_key,
				endpoint: update.endpoint,
			});
		}

		// Statistics refresh failures are logged and the tick continues
		// (spec §4.A "Failures").
		match self.driver.peer_stats().await {
			Ok(stats) => self.apply_stats(now, stats).await,
			Err(e) => warn!(error = %e, "failed to refresh peer statistics"),
		}

		Ok(())
	}

	async fn apply_stats(
		&self,
		now: Instant,
		stats: Vec<(PublicKey, crate::driver::PeerStats)>,
	) {
		let mut inner = self.inner.lock().await;
		let mut learned = Vec::new();

		for (key, s) in stats {
			if let Some(peer) = inner.peers.get_mut(&key) {
				peer.rx_bytes = s.rx_bytes;
				peer.tx_bytes = s.tx_bytes;
				if let Some(ago_ms) = s.last_handshake_ago_ms {
					peer.last_handshake = Some(now - Duration::from_millis(ago_ms));
				}
				if let Some(observed) = s.observed_endpoint {
					if peer.endpoint != Some(observed) {
						peer.endpoint = Some(observed);
						peer.last_endpoint_change = Some(now);
						learned.push(EndpointEvent {
							public_key: key,
							endpoint: observed,
						});
					}
				}
				peer.recompute_liveness(now);
			}
		}
		drop(inner);

		for event in learned {
			info!(peer = %event.public_key, endpoint = %event.endpoint, "interface learned new peer endpoint");
			let _ = self.watch_tx.send(event);
		}
	}

	/// `Cleanup()` (spec §4.A): removes the interface and its firewall
	/// rules.
	pub async fn cleanup(&self) -> Result<(), Error> {
		self.driver.cleanup().await?;
		crate::firewall::remove_allow_rule().await;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::driver::MockDriver;

	fn overlay() -> Overlay<MockDriver> {
		let config = OverlayConfig::default_port([7u8; 32], Ipv4Addr::new(10, 210, 0, 1), 16);
		Overlay::new(Arc::new(MockDriver::default()), config)
	}

	#[tokio::test]
	async fn configure_is_idempotent_on_driver_calls() {
		let overlay = overlay();
		let desired = vec![DesiredPeerState {
			public_key: PublicKey([1u8; 32]),
			subnet: Some("10.210.1.0/24".parse().unwrap()),
			management_addr: Ipv4Addr::new(10, 210, 1, 1),
			candidates: vec!["1.2.3.4:51820".parse().unwrap()],
			preferred_endpoint: None,
		}];

		overlay.configure(&desired).await.unwrap();
		overlay.configure(&desired).await.unwrap();

		let calls = overlay.driver.configured.lock().await;
		assert_eq!(calls.len(), 2);
		assert_eq!(calls[0].peers.len(), calls[1].peers.len());
		assert_eq!(
			calls[0].peers[0].endpoint,
			calls[1].peers[0].endpoint
		);
	}

	#[tokio::test]
	async fn configure_preserves_live_endpoint_across_reconfigure() {
		let overlay = overlay();
		let candidates = vec![
			"1.2.3.4:51820".parse().unwrap(),
			"5.6.7.8:51820".parse().unwrap(),
		];
		let desired = vec![DesiredPeerState {
			public_key: PublicKey([2u8; 32]),
			subnet: None,
			management_addr: Ipv4Addr::new(10, 210, 2, 1),
			candidates: candidates.clone(),
			preferred_endpoint: Some(candidates[1]),
		}];
		overlay.configure(&desired).await.unwrap();

		// Second call without a preferred endpoint should still keep the
		// already-selected one, since it's a member of the candidate list.
		let desired2 = vec![DesiredPeerState {
			preferred_endpoint: None,
			..desired[0].clone()
		}];
		overlay.configure(&desired2).await.unwrap();

		let calls = overlay.driver.configured.lock().await;
		assert_eq!(calls[1].peers[0].endpoint, Some(candidates[1]));
	}

	impl Clone for DesiredPeerState {
		fn clone(&self) -> Self {
			DesiredPeerState {
				public_key: self.public_key,
				subnet: self.subnet,
				management_addr: self.management_addr,
				candidates: self.candidates.clone(),
				preferred_endpoint: self.preferred_endpoint,
			}
		}
	}

	#[tokio::test]
	async fn tick_rotates_dead_peer_and_emits_event() {
		let overlay = overlay();
		let candidates = vec![
			"1.2.3.4:51820".parse().unwrap(),
			"5.6.7.8:51820".parse().unwrap(),
		];
		let desired = vec![DesiredPeerState {
			public_key: PublicKey([3u8; 32]),
			subnet: None,
			management_addr: Ipv4Addr::new(10, 210, 3, 1),
			candidates: candidates.clone(),
			preferred_endpoint: Some(candidates[0]),
		}];
		overlay.configure(&desired).await.unwrap();

		// Force the peer to look long-dead.
		{
			let mut inner = overlay.inner.lock().await;
			let peer = inner.peers.get_mut(&PublicKey([3u8; 32])).unwrap();
			peer.last_endpoint_change = Some(Instant::now() - Duration::from_secs(1000));
			peer.last_handshake = Some(Instant::now() - Duration::from_secs(1000));
		}

		let mut rx = overlay.watch_endpoints();
		overlay.tick().await.unwrap();

		let event = rx.try_recv().expect("expected a rotation event");
		assert_eq!(event.endpoint, candidates[1]);
	}
}
