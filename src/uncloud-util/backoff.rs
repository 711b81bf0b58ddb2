//! A single exponential-backoff primitive shared by every retry loop in
//! the daemon (store transport, subscription resubscribe, container
//! reconciler, peer reconciler) — spec §4.B/§4.D/§4.E/§9 each specify
//! their own `(initial, max, max_elapsed)` triple over the same shape of
//! loop, so one implementation is parameterized rather than rewritten
//! per call site.

use std::time::{Duration, Instant};

use rand::Rng;

/// Doubling backoff with a cap on the per-attempt delay and an optional
/// cap on total elapsed time across all attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	/// `None` means retry forever (container/peer reconciler loops).
	max_elapsed: Option<Duration>,
	current: Duration,
	started_at: Option<Instant>,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration, max_elapsed: Option<Duration>) -> Self {
		Backoff {
			initial,
			max,
			max_elapsed,
			current: initial,
			started_at: None,
		}
	}

	/// §4.B transport retry: 100ms / 1s / 10s.
	pub fn transport() -> Self {
		Self::new(
			Duration::from_millis(100),
			Duration::from_secs(1),
			Some(Duration::from_secs(10)),
		)
	}

	/// §4.B/§9 resubscribe loop: 100ms / ~2s / ~30s.
	pub fn resubscribe() -> Self {
		Self::new(
			Duration::from_millis(100),
			Duration::from_secs(2),
			Some(Duration::from_secs(30)),
		)
	}

	/// §4.D container reconciler watch loop: 100ms / 5s / unbounded.
	pub fn container_watch() -> Self {
		Self::new(Duration::from_millis(100), Duration::from_secs(5), None)
	}

	/// §4.E peer reconciler subscribe loop: 1s / 60s / unbounded.
	pub fn peer_subscribe() -> Self {
		Self::new(Duration::from_secs(1), Duration::from_secs(60), None)
	}

	pub fn reset(&mut self) {
		self.current = self.initial;
		self.started_at = None;
	}

	/// Returns the next delay to sleep for, or `None` if `max_elapsed`
	/// has been exceeded (permanent failure).
	pub fn next_delay(&mut self) -> Option<Duration> {
		let started_at = *self.started_at.get_or_insert_with(Instant::now);
		if let Some(max_elapsed) = self.max_elapsed {
			if started_at.elapsed() >= max_elapsed {
				return None;
			}
		}

		// Full jitter: uniform in [0, current].
		let jittered = {
			let mut rng = rand::thread_rng();
			let millis = self.current.as_millis().max(1) as u64;
			Duration::from_millis(rng.gen_range(0..=millis))
		};

		self.current = std::cmp::min(self.current * 2, self.max);
		Some(jittered)
	}

	/// Sleep for the next delay; returns `false` once `max_elapsed` has
	/// been exceeded and the caller should give up.
	pub async fn wait(&mut self) -> bool {
		match self.next_delay() {
			Some(d) => {
				tokio::time::sleep(d).await;
				true
			}
			None => false,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn doubles_up_to_max() {
		let mut b = Backoff::new(
			Duration::from_millis(100),
			Duration::from_millis(500),
			None,
		);
		// current starts at 100ms and doubles after every next_delay() call,
		// capped at 500ms; jitter means the returned delay is <= current.
		for _ in 0..10 {
			let d = b.next_delay().unwrap();
			assert!(d <= Duration::from_millis(500));
		}
		assert_eq!(b.current, Duration::from_millis(500));
	}

	#[tokio::test]
	async fn max_elapsed_eventually_gives_up() {
		let mut b = Backoff::new(
			Duration::from_millis(1),
			Duration::from_millis(2),
			Some(Duration::from_millis(20)),
		);
		let mut attempts = 0;
		while b.wait().await {
			attempts += 1;
			if attempts > 100_000 {
				panic!("backoff never gave up");
			}
		}
		assert!(attempts > 0);
	}

	#[test]
	fn reset_restarts_clock_and_delay() {
		let mut b = Backoff::new(
			Duration::from_millis(10),
			Duration::from_millis(100),
			Some(Duration::from_millis(5)),
		);
		std::thread::sleep(Duration::from_millis(10));
		assert!(b.next_delay().is_none());
		b.reset();
		assert!(b.next_delay().is_some());
	}
}
