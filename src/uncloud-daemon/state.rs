//! On-disk machine state (spec §3 "Machine state", §6 "On-disk state
//! file", §9 "state is the single source of truth"). One writer lock
//! covers every in-place mutation and the file flush, so readers never
//! observe a half-written state (spec §5).

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use ipnet::Ipv4Net;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use uncloud_overlay::PublicKey;
use uncloud_util::persister::Persister;
use uncloud_util::{Error, ErrorKind};

const TOKEN_PREFIX: &str = "mtkn:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
	pub public_key: PublicKey,
	pub subnet: Option<Ipv4Net>,
	pub management_ip: Ipv4Addr,
	pub endpoint: Option<SocketAddr>,
	pub all_endpoints: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkState {
	pub subnet: Ipv4Net,
	pub management_ip: Ipv4Addr,
	pub private_key: [u8; 32],
	pub public_key: PublicKey,
	pub peers: Vec<PeerRecord>,
	pub min_store_db_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
	pub id: String,
	pub name: String,
	pub network: NetworkState,
}

impl MachineState {
	/// First-boot initialization (spec §3 "created once ... never rotated
	/// in-place"): generates identity keys, assigns `subnet` within
	/// `cluster_prefix`, and derives the management address from the
	/// public key.
	pub fn new_identity(name: &str, cluster_prefix: Ipv4Net, subnet_len: u8) -> Self {
		let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
		let public = X25519Public::from(&secret);
		let public_key = PublicKey(*public.as_bytes());

		let mut id_bytes = [0u8; 16];
		rand::rngs::OsRng.fill_bytes(&mut id_bytes);
		let id = hex::encode(id_bytes);

		let subnet = first_subnet(cluster_prefix, subnet_len);
		let management_ip = management_address(&public_key, cluster_prefix);

		MachineState {
			id,
			name: name.to_string(),
			network: NetworkState {
				subnet,
				management_ip,
				private_key: secret.to_bytes(),
				public_key,
				peers: Vec::new(),
				min_store_db_version: None,
			},
		}
	}
}

/// First usable `/subnet_len` block within `prefix` (spec §3 default
/// `/24` within a cluster-wide `/16`). A real allocator would coordinate
/// this via the store to avoid collisions across machines; assigning
/// the first block here is a placeholder for bootstrap, matching this
/// component's "created once on first boot" non-goal scope.
fn first_subnet(prefix: Ipv4Net, subnet_len: u8) -> Ipv4Net {
	Ipv4Net::new(prefix.network(), subnet_len).expect("subnet_len must fit within the prefix")
}

/// Deterministic management address derived from a peer's public key
/// (spec §3, GLOSSARY "Management address"): low 16 bits of a hash of
/// the key select the host part of `prefix`.
pub fn management_address(public_key: &PublicKey, prefix: Ipv4Net) -> Ipv4Addr {
	let digest: u32 = public_key
		.0
		.chunks_exact(4)
		.map(|c| u32::from_be_bytes(c.try_into().unwrap()))
		.fold(0u32, |acc, x| acc ^ x);

	let host_bits = 32 - prefix.prefix_len();
	let mask = if host_bits >= 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
	// Never land on network or broadcast address.
	let host = (digest & mask).max(1).min(mask.saturating_sub(1).max(1));
	let base = u32::from(prefix.network());
	Ipv4Addr::from(base | host)
}

/// `mtkn:` join token (spec §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
	#[serde(rename = "PublicKey")]
	pub public_key: PublicKey,
	#[serde(rename = "Endpoints")]
	pub endpoints: Vec<SocketAddr>,
}

impl Token {
	pub fn format(&self) -> Result<String, Error> {
		let json = serde_json::to_vec(self)?;
		let b64 = base64::engine::general_purpose::STANDARD.encode(json);
		Ok(format!("{TOKEN_PREFIX}{b64}"))
	}

	pub fn parse(s: &str) -> Result<Self, Error> {
		let rest = s
			.strip_prefix(TOKEN_PREFIX)
			.ok_or_else(|| Error::msg(ErrorKind::ConfigInvalid, "token missing mtkn: prefix"))?;
		let json = base64::engine::general_purpose::STANDARD
			.decode(rest)
			.map_err(|e| Error::new(ErrorKind::ConfigInvalid, e))?;
		serde_json::from_slice(&json).map_err(Error::from)
	}
}

/// Single-writer-lock wrapper around [`MachineState`] (spec §5, §9):
/// every mutation happens under the write guard and is flushed to disk
/// before the guard is released.
pub struct State {
	inner: RwLock<MachineState>,
	persister: Persister<MachineState>,
}

impl State {
	pub fn new(dir: PathBuf, state: MachineState) -> Arc<Self> {
		Arc::new(State {
			inner: RwLock::new(state),
			persister: Persister::new(&dir, "state"),
		})
	}

	/// Load existing state from `dir/state.json`, if present.
	pub async fn load(dir: PathBuf) -> Result<Arc<Self>, Error> {
		let persister: Persister<MachineState> = Persister::new(&dir, "state");
		let state = persister.load_async().await?;
		Ok(Arc::new(State { inner: RwLock::new(state), persister }))
	}

	pub async fn read(&self) -> RwLockReadGuard<'_, MachineState> {
		self.inner.read().await
	}

	/// Mutate under the write lock and persist before releasing it, so
	/// readers never observe a half-written state (spec §5).
	pub async fn mutate<F, T>(&self, f: F) -> Result<T, Error>
	where
		F: FnOnce(&mut MachineState) -> T,
	{
		let mut guard: RwLockWriteGuard<'_, MachineState> = self.inner.write().await;
		let result = f(&mut guard);
		self.persister.save_async(&guard).await?;
		Ok(result)
	}

	/// Replace `state.peers` wholesale (spec §4.E) and persist.
	pub async fn replace_peers(&self, peers: Vec<PeerRecord>) -> Result<(), Error> {
		self.mutate(|s| s.network.peers = peers).await
	}

	/// Record an endpoint rotation for one peer by public key (spec
	/// §4.F) and persist.
	pub async fn set_peer_endpoint(&self, public_key: PublicKey, endpoint: SocketAddr) -> Result<bool, Error> {
		self.mutate(|s| {
			if let Some(peer) = s.network.peers.iter_mut().find(|p| p.public_key == public_key) {
				peer.endpoint = Some(endpoint);
				true
			} else {
				false
			}
		})
		.await
	}

	/// Clear `min_store_db_version` once the store has caught up (spec
	/// §4.I step 6) and persist.
	pub async fn clear_min_store_version(&self) -> Result<(), Error> {
		self.mutate(|s| {
			s.network.min_store_db_version = None;
			info!(machine_id = %s.id, "store caught up, cleared min_store_db_version");
		})
		.await
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn cluster_prefix() -> Ipv4Net {
		"10.210.0.0/16".parse().unwrap()
	}

	#[test]
	fn token_round_trips() {
		let token = Token {
			public_key: PublicKey([0u8; 32]),
			endpoints: vec!["1.2.3.4:51820".parse().unwrap()],
		};
		let formatted = token.format().unwrap();
		assert!(formatted.starts_with("mtkn:"));
		let parsed = Token::parse(&formatted).unwrap();
		assert_eq!(parsed, token);
	}

	#[test]
	fn token_rejects_missing_prefix() {
		assert!(Token::parse("not-a-token").is_err());
	}

	#[test]
	fn management_address_is_within_prefix_and_deterministic() {
		let key = PublicKey([7u8; 32]);
		let a = management_address(&key, cluster_prefix());
		let b = management_address(&key, cluster_prefix());
		assert_eq!(a, b);
		assert!(cluster_prefix().contains(&a));
	}

	#[tokio::test]
	async fn state_load_save_roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		let identity = MachineState::new_identity("m1", cluster_prefix(), 24);
		let state = State::new(dir.path().to_path_buf(), identity.clone());
		state.mutate(|_| {}).await.unwrap();

		let loaded = State::load(dir.path().to_path_buf()).await.unwrap();
		let guard = loaded.read().await;
		assert_eq!(guard.id, identity.id);
		assert_eq!(guard.network.public_key, identity.network.public_key);
	}

	#[tokio::test]
	async fn replace_peers_then_set_endpoint() {
		let dir = tempfile::tempdir().unwrap();
		let identity = MachineState::new_identity("m1", cluster_prefix(), 24);
		let state = State::new(dir.path().to_path_buf(), identity);

		let peer_key = PublicKey([9u8; 32]);
		state
			.replace_peers(vec![PeerRecord {
				public_key: peer_key,
				subnet: None,
				management_ip: Ipv4Addr::new(10, 210, 1, 1),
				endpoint: None,
				all_endpoints: vec!["5.6.7.8:51820".parse().unwrap()],
			}])
			.await
			.unwrap();

		let changed = state
			.set_peer_endpoint(peer_key, "5.6.7.8:51820".parse().unwrap())
			.await
			.unwrap();
		assert!(changed);

		let guard = state.read().await;
		assert_eq!(guard.network.peers[0].endpoint, Some("5.6.7.8:51820".parse().unwrap()));
	}
}
