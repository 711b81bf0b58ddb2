//! The one firewall rule the overlay owns: let inbound UDP reach the
//! tunnel's listen port (spec §4.I step 1, §1 non-goals — "the host
//! firewall beyond programming one allow-through rule"). Implemented by
//! shelling out to `nft`, matching how narrowly-scoped, single-purpose
//! firewall programming is usually done from a Rust daemon rather than
//! linking a netfilter binding for one rule.

use tokio::process::Command;
use tracing::{info, warn};

use uncloud_util::{Error, ErrorKind};

const TABLE: &str = "uncloud";
const CHAIN: &str = "input";

/// Ensure the overlay's UDP port is allowed through the host firewall.
/// Idempotent: re-running replaces the table contents rather than
/// appending duplicate rules.
pub async fn ensure_allow_rule(udp_port: u16) -> Result<(), Error> {
	let script = format!(
		"table inet {table} {{ chain {chain} {{ type filter hook input priority 0; policy accept; udp dport {port} accept }} }}",
		table = TABLE,
		chain = CHAIN,
		port = udp_port,
	);

	use tokio::io::AsyncWriteExt;

	let mut child = Command::new("nft")
		.arg("-f")
		.arg("-")
		.kill_on_drop(true)
		.stdin(std::process::Stdio::piped())
		.spawn()
		.map_err(|e| Error::new(ErrorKind::ConfigInvalid, anyhow::anyhow!("spawning nft: {}", e)))?;

	if let Some(stdin) = child.stdin.as_mut() {
		stdin.write_all(script.as_bytes()).await.ok();
	}

	let output = child
		.wait_with_output()
		.await
		.map_err(|e| Error::new(ErrorKind::ConfigInvalid, anyhow::anyhow!("running nft: {}", e)))?;

	if !output.status.success() {
		return Err(Error::msg(
			ErrorKind::ConfigInvalid,
			format!(
				"nft exited with {}: {}",
				output.status,
				String::from_utf8_lossy(&output.stderr)
			),
		));
	}

	info!(port = udp_port, "programmed overlay firewall allow rule");
	Ok(())
}

/// Remove the table created by [`ensure_allow_rule`]. Best-effort during
/// cleanup, per spec §4.I shutdown step 5.
pub async fn remove_allow_rule() {
	let result = Command::new("nft")
		.args(["delete", "table", "inet", TABLE])
		.kill_on_drop(true)
		.status()
		.await;
	if let Err(e) = result {
		warn!(error = %e, "failed to remove overlay firewall table (best-effort)");
	}
}
