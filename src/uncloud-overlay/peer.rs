//! Peer representation and the liveness/rotation state machine (spec
//! §4.A, §3 peer invariants, §8 scenario 1).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A peer's long-term overlay public key. Uniquely identifies a peer
/// within a cluster (spec §3 invariant).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
	pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
		let mut buf = [0u8; 32];
		hex::decode_to_slice(s, &mut buf)?;
		Ok(PublicKey(buf))
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}
}

impl fmt::Debug for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "PublicKey({}…)", &self.to_hex()[..8])
	}
}

impl fmt::Display for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl Serialize for PublicKey {
	fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for PublicKey {
	fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

/// Liveness classification for a peer, recomputed on every overlay tick
/// (spec §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
	Unknown,
	Up,
	Down,
}

/// Threshold past which an endpoint that hasn't changed is considered
/// "settled" for the purposes of the liveness decision (spec §4.A: 275s).
pub const LIVENESS_SETTLE: Duration = Duration::from_secs(275);
/// Grace period right after an endpoint change during which we require a
/// fresh handshake to call the peer Up (spec §4.A: 15s).
pub const LIVENESS_GRACE: Duration = Duration::from_secs(15);

/// The overlay's live view of one peer: the configuration pushed to the
/// tunnel interface, plus runtime statistics refreshed from it.
#[derive(Debug, Clone)]
pub struct Peer {
	pub public_key: PublicKey,
	pub subnet: Option<Ipv4Net>,
	pub management_addr: Ipv4Addr,
	/// Ordered list of candidate endpoints (spec §3/§4.A).
	pub candidates: Vec<SocketAddr>,
	/// Currently selected endpoint; always a member of `candidates` when set
	/// (spec §3 invariant).
	pub endpoint: Option<SocketAddr>,
	pub last_endpoint_change: Option<Instant>,
	pub last_handshake: Option<Instant>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub liveness: Liveness,
}

impl Peer {
	pub fn new(public_key: PublicKey, management_addr: Ipv4Addr) -> Self {
		Peer {
			public_key,
			subnet: None,
			management_addr,
			candidates: Vec::new(),
			endpoint: None,
			last_endpoint_change: None,
			last_handshake: None,
			rx_bytes: 0,
			tx_bytes: 0,
			liveness: Liveness::Unknown,
		}
	}

	/// Allowed ranges programmed for this peer on the tunnel interface:
	/// its subnet plus its single management address (spec §4.A, §6).
	pub fn allowed_ranges(&self) -> Vec<ipnet::IpNet> {
		let mut ranges = Vec::with_capacity(2);
		if let Some(subnet) = self.subnet {
			ranges.push(ipnet::IpNet::V4(subnet));
		}
		ranges.push(ipnet::IpNet::V4(
			Ipv4Net::new(self.management_addr, 32).expect("/32 is always valid"),
		));
		ranges
	}

	/// Recompute `self.liveness` from current stats, per spec §4.A.
	pub fn recompute_liveness(&mut self, now: Instant) {
		self.liveness = compute_liveness(
			now,
			self.last_endpoint_change,
			self.last_handshake,
			self.endpoint.is_some(),
		);
	}
}

/// Liveness state machine (spec §4.A), pure function for testability.
///
/// `T0 = last_endpoint_change`, `h = now - last_handshake`,
/// `e = now - T0`. A peer that has never changed endpoints is treated as
/// `T0 = now` minus a very long duration so that `e > 275s` holds
/// immediately, matching "no recent change" behavior.
pub fn compute_liveness(
	now: Instant,
	last_endpoint_change: Option<Instant>,
	last_handshake: Option<Instant>,
	has_endpoint: bool,
) -> Liveness {
	let t0 = last_endpoint_change;
	// No recorded rotation is treated as "very stale": route into the
	// `e > LIVENESS_SETTLE` branch below rather than the middle band, so a
	// peer that's never been rotated still goes `Down` once its handshake
	// goes stale instead of reporting `Up` forever.
	let e = t0.map(|t0| now.saturating_duration_since(t0)).unwrap_or(Duration::MAX);

	let handshake_after_t0 = matches!((last_handshake, t0), (Some(h), Some(t0)) if h > t0);

	let status = if e > LIVENESS_SETTLE {
		let h = last_handshake.map(|h| now.saturating_duration_since(h));
		match h {
			Some(h) if h < LIVENESS_SETTLE => Liveness::Up,
			_ => Liveness::Down,
		}
	} else if e < LIVENESS_GRACE {
		if handshake_after_t0 {
			Liveness::Up
		} else {
			Liveness::Unknown
		}
	} else {
		// e in [GRACE, SETTLE].
		if handshake_after_t0 {
			Liveness::Up
		} else {
			Liveness::Down
		}
	};

	if status == Liveness::Down && !has_endpoint {
		Liveness::Unknown
	} else {
		status
	}
}

/// `shouldChangeEndpoint` (spec §4.A): decide whether/what to rotate to
/// on this tick. Returns `None` when no change should be made.
pub fn should_change_endpoint(peer: &Peer) -> Option<SocketAddr> {
	if peer.endpoint.is_some() && matches!(peer.liveness, Liveness::Up | Liveness::Unknown) {
		return None;
	}
	if peer.candidates.is_empty() {
		return None;
	}
	let current = match peer.endpoint {
		None => return Some(peer.candidates[0]),
		Some(c) => c,
	};
	if peer.candidates.len() == 1 && peer.candidates[0] == current {
		return None;
	}
	let idx = peer
		.candidates
		.iter()
		.position(|c| *c == current)
		.unwrap_or(0);
	let next = (idx + 1) % peer.candidates.len();
	Some(peer.candidates[next])
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::{IpAddr, Ipv4Addr as V4};

	fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
		SocketAddr::new(IpAddr::V4(V4::new(a, b, c, d)), port)
	}

	fn pk(byte: u8) -> PublicKey {
		PublicKey([byte; 32])
	}

	#[test]
	fn public_key_hex_roundtrip() {
		let k = pk(0xAB);
		let hex = k.to_hex();
		assert_eq!(PublicKey::from_hex(&hex).unwrap(), k);
	}

	#[test]
	fn scenario_single_peer_rotation() {
		// spec §8 scenario 1: candidates [1.2.3.4, 5.6.7.8], current =
		// 1.2.3.4, last handshake 400s ago, T0 400s ago => Down, rotates.
		let now = Instant::now();
		let t0 = now - Duration::from_secs(400);
		let handshake = now - Duration::from_secs(400);

		let mut peer = Peer::new(pk(1), V4::new(10, 0, 0, 1));
		peer.candidates = vec![addr(1, 2, 3, 4, 51820), addr(5, 6, 7, 8, 51820)];
		peer.endpoint = Some(addr(1, 2, 3, 4, 51820));
		peer.last_endpoint_change = Some(t0);
		peer.last_handshake = Some(handshake);
		peer.recompute_liveness(now);

		assert_eq!(peer.liveness, Liveness::Down);
		assert_eq!(should_change_endpoint(&peer), Some(addr(5, 6, 7, 8, 51820)));

		// Next tick with a fresh handshake after the rotation: Up.
		let now2 = now + Duration::from_secs(1);
		peer.endpoint = Some(addr(5, 6, 7, 8, 51820));
		peer.last_endpoint_change = Some(now);
		peer.last_handshake = Some(now2);
		peer.recompute_liveness(now2);
		assert_eq!(peer.liveness, Liveness::Up);
	}

	#[test]
	fn no_endpoints_known_is_unknown_and_never_rotated() {
		let now = Instant::now();
		let mut peer = Peer::new(pk(2), V4::new(10, 0, 0, 2));
		peer.recompute_liveness(now);
		assert_eq!(peer.liveness, Liveness::Unknown);
		assert_eq!(should_change_endpoint(&peer), None);
	}

	#[test]
	fn single_candidate_equal_to_current_cannot_rotate() {
		let now = Instant::now();
		let mut peer = Peer::new(pk(3), V4::new(10, 0, 0, 3));
		peer.candidates = vec![addr(9, 9, 9, 9, 51820)];
		peer.endpoint = Some(addr(9, 9, 9, 9, 51820));
		peer.last_endpoint_change = Some(now - Duration::from_secs(1000));
		peer.last_handshake = Some(now - Duration::from_secs(1000));
		peer.recompute_liveness(now);
		assert_eq!(peer.liveness, Liveness::Down);
		assert_eq!(should_change_endpoint(&peer), None);
	}

	#[test]
	fn no_endpoint_set_selects_first_candidate() {
		let peer_candidates = vec![addr(1, 1, 1, 1, 1), addr(2, 2, 2, 2, 2)];
		let mut peer = Peer::new(pk(4), V4::new(10, 0, 0, 4));
		peer.candidates = peer_candidates.clone();
		assert_eq!(should_change_endpoint(&peer), Some(peer_candidates[0]));
	}

	#[test]
	fn liveness_within_grace_window_requires_fresh_handshake() {
		let now = Instant::now();
		let t0 = now - Duration::from_secs(5);

		let mut peer = Peer::new(pk(5), V4::new(10, 0, 0, 5));
		peer.endpoint = Some(addr(1, 1, 1, 1, 1));
		peer.last_endpoint_change = Some(t0);
		peer.last_handshake = Some(t0 - Duration::from_secs(1));
		peer.recompute_liveness(now);
		assert_eq!(peer.liveness, Liveness::Unknown);

		peer.last_handshake = Some(t0 + Duration::from_millis(100));
		peer.recompute_liveness(now);
		assert_eq!(peer.liveness, Liveness::Up);
	}

	#[test]
	fn never_rotated_peer_with_stale_handshake_goes_down() {
		// A peer whose endpoint was set once at `configure()` time and
		// never rotated has `last_endpoint_change = None`. A stale
		// handshake must still report Down, not Up forever.
		let now = Instant::now();
		let status = compute_liveness(now, None, Some(now - Duration::from_secs(400)), true);
		assert_eq!(status, Liveness::Down);
	}

	#[test]
	fn never_rotated_peer_with_fresh_handshake_is_up() {
		let now = Instant::now();
		let status = compute_liveness(now, None, Some(now - Duration::from_secs(10)), true);
		assert_eq!(status, Liveness::Up);
	}

	#[test]
	fn allowed_ranges_include_subnet_and_management_address() {
		let mut peer = Peer::new(pk(6), V4::new(10, 210, 5, 1));
		peer.subnet = Some(Ipv4Net::new(V4::new(10, 210, 5, 0), 24).unwrap());
		let ranges = peer.allowed_ranges();
		assert_eq!(ranges.len(), 2);
	}
}
