//! [`TunnelDriver`] abstracts the concrete tunnel interface (WireGuard on
//! Linux, a mock for tests) away from the peer/liveness/rotation logic
//! in [`crate::overlay::Overlay`], the same separation the teacher draws
//! between `garage_table::replication::TableReplication` (the policy) and
//! the concrete `garage_db` backend (the mechanism).

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::peer::PublicKey;
use uncloud_util::Error;

/// Desired full-replace configuration pushed by `Configure` (spec §4.A).
#[derive(Debug, Clone)]
pub struct DesiredConfig {
	pub private_key: [u8; 32],
	pub listen_port: u16,
	pub address: Ipv4Addr,
	pub address_prefix_len: u8,
	pub routes: Vec<Ipv4Net>,
	pub peers: Vec<DesiredPeer>,
}

#[derive(Debug, Clone)]
pub struct DesiredPeer {
	pub public_key: PublicKey,
	pub allowed_ips: Vec<ipnet::IpNet>,
	pub endpoint: Option<SocketAddr>,
	pub persistent_keepalive: Option<u16>,
}

/// A single peer endpoint update, pushed without touching the rest of
/// the peer set (spec §4.A `Run`: "update-only, do not replace peers").
#[derive(Debug, Clone)]
pub struct PeerEndpointUpdate {
	pub public_key: PublicKey,
	pub endpoint: SocketAddr,
}

/// Per-peer statistics read back from the interface on each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	/// Milliseconds since the last observed handshake, if any.
	pub last_handshake_ago_ms: Option<u64>,
	/// Endpoint the interface itself learned for this peer (e.g. a
	/// reverse connection), if different from what we last pushed.
	pub observed_endpoint: Option<SocketAddr>,
}

/// Programs a tunnel interface. Implementations must make `configure`
/// idempotent: calling it twice with equal input must not produce any
/// observable mutation on the second call (spec §8 round-trip law).
#[async_trait]
pub trait TunnelDriver: Send + Sync {
	/// Bring the interface into alignment with `desired`: replace peers
	/// (by public key), program allowed ranges, assign address, install
	/// routes, bring up if down, and remove anything not in the desired
	/// set.
	async fn configure(&self, desired: &DesiredConfig) -> Result<(), Error>;

	/// Push a single peer's endpoint without touching the rest of the
	/// peer set.
	async fn update_peer_endpoint(&self, update: &PeerEndpointUpdate) -> Result<(), Error>;

	/// Read current per-peer statistics from the interface.
	async fn peer_stats(&self) -> Result<Vec<(PublicKey, PeerStats)>, Error>;

	/// Remove the interface and any programmed firewall rules.
	async fn cleanup(&self) -> Result<(), Error>;
}

/// Test/dev backend that records calls instead of touching the network.
#[derive(Default)]
pub struct MockDriver {
	pub configured: tokio::sync::Mutex<Vec<DesiredConfig>>,
	pub endpoint_updates: tokio::sync::Mutex<Vec<PeerEndpointUpdate>>,
	pub stats: tokio::sync::Mutex<Vec<(PublicKey, PeerStats)>>,
}

#[async_trait]
impl TunnelDriver for MockDriver {
	async fn configure(&self, desired: &DesiredConfig) -> Result<(), Error> {
		self.configured.lock().await.push(desired.clone());
		Ok(())
	}

	async fn update_peer_endpoint(&self, update: &PeerEndpointUpdate) -> Result<(), Error> {
		self.endpoint_updates.lock().await.push(update.clone());
		Ok(())
	}

	async fn peer_stats(&self) -> Result<Vec<(PublicKey, PeerStats)>, Error> {
		Ok(self.stats.lock().await.clone())
	}

	async fn cleanup(&self) -> Result<(), Error> {
		Ok(())
	}
}

#[cfg(target_os = "linux")]
pub mod wireguard;
