//! Network endpoint watcher (spec §4.F): persists endpoint rotations and
//! auto-learned endpoint changes from the overlay tick (component A)
//! back into state, so a restart resumes from the last-known-live
//! endpoint rather than the first candidate.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use uncloud_overlay::overlay::EndpointEvent;
use uncloud_util::{Error, ErrorKind};

use crate::state::State;

pub struct EndpointWatcher {
	state: Arc<State>,
	events: broadcast::Receiver<EndpointEvent>,
}

impl EndpointWatcher {
	pub fn new(state: Arc<State>, events: broadcast::Receiver<EndpointEvent>) -> Self {
		EndpointWatcher { state, events }
	}

	/// Runs until the overlay's broadcast channel closes or `cancel`
	/// fires. A lagged receiver (events dropped under backpressure) just
	/// resumes from the next event; state is eventually consistent with
	/// the overlay's live view either way.
	pub async fn run(&mut self, cancel: tokio_util::sync::CancellationToken) -> Result<(), Error> {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					return Err(Error::msg(ErrorKind::Canceled, "endpoint watcher canceled"));
				}
				event = self.events.recv() => {
					match event {
						Ok(event) => self.handle(event).await?,
						Err(broadcast::error::RecvError::Lagged(skipped)) => {
							warn!(skipped, "endpoint watcher lagged, dropped events");
						}
						Err(broadcast::error::RecvError::Closed) => return Ok(()),
					}
				}
			}
		}
	}

	async fn handle(&self, event: EndpointEvent) -> Result<(), Error> {
		let updated = self.state.set_peer_endpoint(event.public_key, event.endpoint).await?;
		if updated {
			info!(peer = %event.public_key, endpoint = %event.endpoint, "persisted peer endpoint change");
		} else {
			warn!(peer = %event.public_key, "endpoint event for unknown peer, ignoring");
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::Ipv4Addr;
	use uncloud_overlay::PublicKey;

	#[tokio::test]
	async fn persists_endpoint_for_known_peer() {
		let dir = tempfile::tempdir().unwrap();
		let identity = crate::state::MachineState::new_identity("m1", "10.210.0.0/16".parse().unwrap(), 24);
		let state = State::new(dir.path().to_path_buf(), identity);

		let peer_key = PublicKey([3u8; 32]);
		state
			.replace_peers(vec![crate::state::PeerRecord {
				public_key: peer_key,
				subnet: None,
				management_ip: Ipv4Addr::new(10, 210, 1, 1),
				endpoint: None,
				all_endpoints: vec!["9.9.9.9:51820".parse().unwrap()],
			}])
			.await
			.unwrap();

		let (tx, rx) = broadcast::channel(4);
		let mut watcher = EndpointWatcher::new(state.clone(), rx);
		tx.send(EndpointEvent { public_key: peer_key, endpoint: "9.9.9.9:51820".parse().unwrap() }).unwrap();
		drop(tx);

		let cancel = tokio_util::sync::CancellationToken::new();
		let _ = watcher.run(cancel).await;

		let guard = state.read().await;
		assert_eq!(guard.network.peers[0].endpoint, Some("9.9.9.9:51820".parse().unwrap()));
	}
}
