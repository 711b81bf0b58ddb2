//! Peer reconciler (spec §4.E): translates the cluster's machine roster
//! into the tunnel's peer list, preserving live endpoints. Intentionally
//! thin, per spec.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use ipnet::Ipv4Net;
use serde::Deserialize;
use tracing::{info, warn};

use uncloud_overlay::overlay::DesiredPeerState;
use uncloud_overlay::{Overlay, PublicKey};
use uncloud_store::StoreClient;
use uncloud_util::backoff::Backoff;
use uncloud_util::{Error, ErrorKind};

use crate::state::State;

/// A remote machine's public network config, as serialized into the
/// `machines.info` JSON column (spec §3).
#[derive(Debug, Deserialize)]
struct MachineInfo {
	public_key: PublicKey,
	subnet: Option<Ipv4Net>,
	management_ip: Ipv4Addr,
	endpoints: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct MachineRow {
	id: String,
	info: MachineInfo,
}

pub struct PeerReconciler<D: uncloud_overlay::TunnelDriver> {
	store: Arc<StoreClient>,
	state: Arc<State>,
	overlay: Arc<Overlay<D>>,
	local_machine_id: String,
}

impl<D: uncloud_overlay::TunnelDriver> PeerReconciler<D> {
	pub fn new(
		store: Arc<StoreClient>,
		state: Arc<State>,
		overlay: Arc<Overlay<D>>,
		local_machine_id: String,
	) -> Self {
		PeerReconciler { store, state, overlay, local_machine_id }
	}

	/// Subscribe to `machines` with infinite retry backoff (spec §4.E:
	/// 1s / 60s).
	pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) -> Result<(), Error> {
		let mut backoff = Backoff::peer_subscribe();
		loop {
			match self.watch(&cancel).await {
				Err(e) if e.is_canceled() => return Err(e),
				Err(e) => {
					warn!(error = %e, "peer reconciler subscribe loop failed, retrying");
					backoff.wait().await;
				}
				Ok(()) => return Ok(()),
			}
		}
	}

	async fn watch(&self, cancel: &tokio_util::sync::CancellationToken) -> Result<(), Error> {
		let mut subscription = self.store.subscribe("SELECT id, info FROM machines", &[], false).await?;
		let (_columns, rows) = subscription.read_initial_rows().await?;
		self.reconcile_from_rows(rows).await?;

		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					return Err(Error::msg(ErrorKind::Canceled, "peer reconciler canceled"));
				}
				event = subscription.next() => {
					match event? {
						None => return Ok(()),
						Some(_change) => {
							let mut rows = self.store.query("SELECT id, info FROM machines", &[]).await?;
							let mut collected = Vec::new();
							while rows.next().await? {
								collected.push(rows.scan_row::<Vec<serde_json::Value>>()?);
							}
							self.reconcile_from_rows(collected).await?;
						}
					}
				}
			}
		}
	}

	async fn reconcile_from_rows(&self, rows: Vec<Vec<serde_json::Value>>) -> Result<(), Error> {
		// Empty machine list from a partial-replication quirk right after
		// join: do NOT replace peers (spec §4.E, §8 boundary behavior).
		if rows.is_empty() {
			return Ok(());
		}

		let mut machines = Vec::with_capacity(rows.len());
		for row in rows {
			let id: String = serde_json::from_value(row[0].clone())?;
			if id == self.local_machine_id {
				continue;
			}
			match serde_json::from_value::<MachineInfo>(row[1].clone()) {
				Ok(info) => machines.push(MachineRow { id, info }),
				Err(e) => {
					warn!(machine_id = %id, error = %e, "peer config invalid, skipping");
				}
			}
		}

		let existing = self.state.read().await.network.peers.clone();
		let desired: Vec<DesiredPeerState> = machines
			.iter()
			.map(|m| {
				let preferred = existing
					.iter()
					.find(|p| p.public_key == m.info.public_key)
					.and_then(|p| p.endpoint)
					.filter(|e| m.info.endpoints.contains(e));
				DesiredPeerState {
					public_key: m.info.public_key,
					subnet: m.info.subnet,
					management_addr: m.info.management_ip,
					candidates: m.info.endpoints.clone(),
					preferred_endpoint: preferred,
				}
			})
			.collect();

		let peer_records: Vec<crate::state::PeerRecord> = machines
			.iter()
			.zip(desired.iter())
			.map(|(m, d)| crate::state::PeerRecord {
				public_key: m.info.public_key,
				subnet: m.info.subnet,
				management_ip: m.info.management_ip,
				endpoint: d.preferred_endpoint.or_else(|| m.info.endpoints.first().copied()),
				all_endpoints: m.info.endpoints.clone(),
			})
			.collect();

		self.state.replace_peers(peer_records).await?;
		self.overlay.configure(&desired).await?;
		info!(count = desired.len(), "reconciled overlay peers from machine roster");
		Ok(())
	}
}
