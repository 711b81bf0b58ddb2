//! Gossip engine lifecycle (spec §4 Non-goals: the anti-entropy/CRDT
//! protocol itself is an external service owned elsewhere; this is only
//! the process-supervision boundary the controller holds onto).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use uncloud_util::{Error, ErrorKind};

/// Deadline before a stop request escalates to SIGKILL (spec §4.I
/// shutdown step 4: gossip gets 10s to exit before the controller moves
/// on).
pub const STOP_DEADLINE: Duration = Duration::from_secs(10);

pub struct GossipEngine {
	binary: PathBuf,
	args: Vec<String>,
	child: Option<Child>,
}

impl GossipEngine {
	pub fn new(binary: PathBuf, args: Vec<String>) -> Self {
		GossipEngine { binary, args, child: None }
	}

	/// Starts the engine if not already running. A second call while
	/// already running is a restart, per spec §4.I step 3 ("start or
	/// restart the gossip engine").
	pub async fn start(&mut self) -> Result<(), Error> {
		if self.child.is_some() {
			self.stop().await?;
		}
		let child = Command::new(&self.binary)
			.args(&self.args)
			.stdin(Stdio::null())
			.stdout(Stdio::inherit())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| Error::new(ErrorKind::RuntimeUnavailable, e))?;
		info!(binary = %self.binary.display(), pid = ?child.id(), "gossip engine started");
		self.child = Some(child);
		Ok(())
	}

	pub fn is_running(&mut self) -> bool {
		match &mut self.child {
			None => false,
			Some(child) => matches!(child.try_wait(), Ok(None)),
		}
	}

	/// Sends a graceful stop signal and waits up to [`STOP_DEADLINE`];
	/// past that, the child is killed outright.
	pub async fn stop(&mut self) -> Result<(), Error> {
		let Some(mut child) = self.child.take() else { return Ok(()) };

		if let Some(pid) = child.id() {
			unsafe {
				libc::kill(pid as i32, libc::SIGTERM);
			}
		}

		match tokio::time::timeout(STOP_DEADLINE, child.wait()).await {
			Ok(Ok(status)) => {
				info!(?status, "gossip engine stopped");
			}
			Ok(Err(e)) => return Err(Error::new(ErrorKind::RuntimeUnavailable, e)),
			Err(_) => {
				warn!("gossip engine did not stop in time, killing");
				let _ = child.kill().await;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn start_stop_true_binary() {
		let mut engine = GossipEngine::new(PathBuf::from("/bin/sleep"), vec!["5".to_string()]);
		engine.start().await.unwrap();
		assert!(engine.is_running());
		engine.stop().await.unwrap();
		assert!(!engine.is_running());
	}
}
