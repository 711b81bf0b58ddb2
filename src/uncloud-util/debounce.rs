//! One-shot debounce timer: the first `signal()` within a quiet window
//! starts a timer; further signals before it fires are absorbed; when it
//! fires, exactly one permit is handed to the consumer. Preserves the
//! "at-most-one pending sync" invariant called out in spec §9, used by
//! the container reconciler's 100ms event coalescing (§4.D).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

/// Handle used by producers to request a debounced fire.
#[derive(Clone)]
pub struct DebounceSignal {
	tx: mpsc::Sender<()>,
}

impl DebounceSignal {
	/// Request a fire. Non-blocking: if a timer is already pending, this
	/// is a no-op (bounded channel of capacity 1, drop-if-full).
	pub fn signal(&self) {
		let _ = self.tx.try_send(());
	}
}

/// Receiver side: `recv()` resolves once per debounce window after at
/// least one `signal()` call landed in it.
pub struct Debouncer {
	rx: mpsc::Receiver<()>,
	window: Duration,
}

pub fn debouncer(window: Duration) -> (DebounceSignal, Debouncer) {
	let (tx, rx) = mpsc::channel(1);
	(DebounceSignal { tx }, Debouncer { rx, window })
}

impl Debouncer {
	/// Waits for the next signal, then sleeps out the debounce window
	/// while draining (and discarding) any further signals that arrive
	/// during it, before returning. Returns `None` if all senders were
	/// dropped.
	pub async fn recv(&mut self) -> Option<()> {
		self.rx.recv().await?;

		let deadline = sleep(self.window);
		tokio::pin!(deadline);
		loop {
			tokio::select! {
				_ = &mut deadline => break,
				more = self.rx.recv() => {
					if more.is_none() {
						break;
					}
					// Absorbed; window does not reset (first-event-starts-timer
					// semantics per spec §9, not ticker-reset semantics).
				}
			}
		}
		Some(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[tokio::test]
	async fn coalesces_bursts_into_one_fire() {
		let (sig, mut deb) = debouncer(Duration::from_millis(30));
		let fires = Arc::new(AtomicUsize::new(0));

		let fires2 = fires.clone();
		let task = tokio::spawn(async move {
			while deb.recv().await.is_some() {
				fires2.fetch_add(1, Ordering::SeqCst);
			}
		});

		for _ in 0..5 {
			sig.signal();
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
		tokio::time::sleep(Duration::from_millis(60)).await;
		drop(sig);
		task.await.unwrap();

		assert_eq!(fires.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn separate_windows_fire_separately() {
		let (sig, mut deb) = debouncer(Duration::from_millis(10));
		sig.signal();
		deb.recv().await.unwrap();

		tokio::time::sleep(Duration::from_millis(20)).await;
		sig.signal();
		deb.recv().await.unwrap();
	}
}
