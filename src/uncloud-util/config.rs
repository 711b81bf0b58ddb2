//! On-disk daemon configuration, read once at startup. Mirrors the shape
//! of `garage_util::config::{Config, read_config}`: a plain TOML file,
//! deserialized with `serde`, with a handful of fields overridable from
//! environment variables / CLI flags after the fact (`Secrets`-style
//! override, see `uncloudd::fill_secrets`).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, ErrorKind};

fn default_state_dir() -> PathBuf {
	PathBuf::from("/var/lib/uncloud")
}

fn default_local_socket() -> PathBuf {
	PathBuf::from("/run/uncloud/uncloud.sock")
}

fn default_management_port() -> u16 {
	51000
}

fn default_dns_suffix() -> String {
	"internal.".to_string()
}

fn default_max_forward_concurrency() -> usize {
	1024
}

/// Top-level daemon configuration, as read from `/etc/uncloud/daemon.toml`
/// (or the path given on the command line).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Overrides the machine name baked into local state on first boot.
	#[serde(default)]
	pub machine_name: Option<String>,

	/// Directory holding `machine.json` (state, §6) and key material.
	#[serde(default = "default_state_dir")]
	pub state_dir: PathBuf,

	/// Unix socket path for the local, privileged API listener (§4.G).
	#[serde(default = "default_local_socket")]
	pub local_socket: PathBuf,

	/// TCP port for the management API on the overlay address (§4.G).
	#[serde(default = "default_management_port")]
	pub management_port: u16,

	/// Base URL of the replicated store's HTTP/2 endpoint.
	pub store_url: String,

	/// Path to the store's length-delimited JSON admin socket (§6).
	pub store_admin_socket: PathBuf,

	/// DNS resolver/server configuration.
	#[serde(default)]
	pub dns: DnsConfig,

	/// Tokens (`mtkn:...`, §6) of machines to contact on first boot.
	#[serde(default)]
	pub bootstrap_peers: Vec<String>,

	/// Name of the local bridge network the controller ensures exists
	/// (§4.I step 1). Out of scope to create container-runtime-side, but
	/// the name is threaded through so the controller can reference it.
	#[serde(default = "default_bridge_name")]
	pub bridge_name: String,
}

fn default_bridge_name() -> String {
	"uncloud".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
	/// Reserved suffix for internal names (§4.C, §6). Configurable.
	#[serde(default = "default_dns_suffix")]
	pub suffix: String,

	/// Explicit upstream resolvers; empty means parse `/etc/resolv.conf`,
	/// falling back to two well-known public resolvers.
	#[serde(default)]
	pub upstreams: Vec<String>,

	/// Bound on in-flight forwarded queries (§4.C).
	#[serde(default = "default_max_forward_concurrency")]
	pub max_forward_concurrency: usize,
}

impl Default for DnsConfig {
	fn default() -> Self {
		DnsConfig {
			suffix: default_dns_suffix(),
			upstreams: Vec::new(),
			max_forward_concurrency: default_max_forward_concurrency(),
		}
	}
}

/// Read and parse the daemon's TOML configuration file.
pub fn read_config(path: impl AsRef<Path>) -> Result<Config, Error> {
	let path = path.as_ref();
	let data = std::fs::read_to_string(path).map_err(|e| {
		Error::new(
			ErrorKind::ConfigInvalid,
			anyhow::anyhow!("unable to read config file {}: {}", path.display(), e),
		)
	})?;
	let config: Config = toml::from_str(&data).map_err(|e| {
		Error::new(
			ErrorKind::ConfigInvalid,
			anyhow::anyhow!("invalid config file {}: {}", path.display(), e),
		)
	})?;
	Ok(config)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn minimal_config_parses() {
		let toml = r#"
			store_url = "http://127.0.0.1:4001"
			store_admin_socket = "/var/lib/uncloud/store-admin.sock"
		"#;
		let config: Config = toml::from_str(toml).unwrap();
		assert_eq!(config.management_port, 51000);
		assert_eq!(config.dns.suffix, "internal.");
		assert_eq!(config.dns.max_forward_concurrency, 1024);
		assert!(config.bootstrap_peers.is_empty());
	}

	#[test]
	fn missing_required_field_fails() {
		let toml = r#"store_url = "http://127.0.0.1:4001""#;
		assert!(toml::from_str::<Config>(toml).is_err());
	}
}
