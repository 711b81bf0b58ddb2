//! `uncloudd`: the per-machine cluster controller binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use uncloud_daemon::controller::{Controller, ControllerConfig};
use uncloud_daemon::state::{MachineState, State};
use uncloud_dns::{DnsServerConfig, ResolverTable};
#[cfg(target_os = "linux")]
use uncloud_overlay::driver::wireguard::WireguardDriver;
#[cfg(not(target_os = "linux"))]
use uncloud_overlay::driver::MockDriver;
use uncloud_overlay::{Overlay, OverlayConfig};
use uncloud_store::StoreClient;
use uncloud_util::{Error, ErrorKind};

const DEFAULT_BRIDGE_NAME: &str = "uncloud";
const OVERLAY_INTERFACE_NAME: &str = "uncloud0";

#[derive(Parser, Debug)]
#[command(name = "uncloudd", about = "Per-machine cluster controller")]
struct Opt {
	/// Directory holding this machine's persisted state.
	#[arg(long, env = "UNCLOUD_STATE_DIR", default_value = "/var/lib/uncloud")]
	state_dir: PathBuf,

	/// Base URL of the local store's HTTP/2 endpoint.
	#[arg(long, env = "UNCLOUD_STORE_URL", default_value = "http://127.0.0.1:52000")]
	store_url: String,

	/// Path of the local control API's Unix socket.
	#[arg(long, env = "UNCLOUD_API_SOCKET", default_value = "/run/uncloud/uncloudd.sock")]
	api_socket: PathBuf,

	/// Path to the gossip engine binary this controller supervises.
	#[arg(long, env = "UNCLOUD_GOSSIP_BINARY", default_value = "/usr/libexec/uncloud-gossip")]
	gossip_binary: PathBuf,

	/// Optional TOML config file; fields not covered by the flags above
	/// (currently just the bridge network name) are read from here.
	#[arg(long, env = "UNCLOUD_CONFIG")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Bridge stdin/stdout to the local control API socket, for use as
	/// an SSH `ProxyCommand`-style transport (spec §6).
	DialStdio {
		#[arg(long)]
		socket: Option<PathBuf>,
	},
}

#[tokio::main]
async fn main() {
	let opt = Opt::parse();

	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "uncloud_daemon=info,uncloud_overlay=info,uncloud_store=info,uncloud_dns=info");
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	std::panic::set_hook(Box::new(|panic_info| {
		eprintln!("======== PANIC (internal uncloudd error) ========");
		eprintln!("{}", panic_info);
		std::process::abort();
	}));

	let result = match &opt.cmd {
		Some(Command::DialStdio { socket }) => dial_stdio(socket.clone().unwrap_or_else(|| opt.api_socket.clone())).await,
		None => run_server(opt).await,
	};

	if let Err(e) = result {
		error!(error = %e, "uncloudd exited with error");
		std::process::exit(1);
	}
}

async fn run_server(opt: Opt) -> Result<(), Error> {
	std::fs::create_dir_all(&opt.state_dir).map_err(|e| Error::new(ErrorKind::ConfigInvalid, e))?;

	let cluster_prefix = "10.210.0.0/16".parse().expect("valid cidr literal");
	let state = match State::load(opt.state_dir.clone()).await {
		Ok(state) => state,
		Err(_) => {
			let hostname = std::fs::read_to_string("/etc/hostname").unwrap_or_else(|_| "uncloud-machine".to_string());
			let identity = MachineState::new_identity(hostname.trim(), cluster_prefix, 24);
			State::new(opt.state_dir.clone(), identity)
		}
	};

	let machine = state.read().await;
	let overlay_config = OverlayConfig::default_port(machine.network.private_key, machine.network.management_ip, machine.network.subnet.prefix_len());
	let local_subnet: ipnet::IpNet = machine.network.subnet.into();
	let management_addr: SocketAddr = SocketAddr::new(machine.network.management_ip.into(), 51000);
	drop(machine);

	let bridge_name = match &opt.config {
		Some(path) => uncloud_util::config::read_config(path)?.bridge_name,
		None => DEFAULT_BRIDGE_NAME.to_string(),
	};

	let overlay = build_overlay(overlay_config)?;

	let store = StoreClient::new(opt.store_url.clone())?;
	let resolver = ResolverTable::new();

	let controller_config = ControllerConfig {
		api_socket_path: opt.api_socket.clone(),
		api_tcp_addr: management_addr,
		dns: DnsServerConfig {
			bind_addr: management_addr.ip(),
			local_subnet: Some(local_subnet),
			..Default::default()
		},
		gossip_binary: opt.gossip_binary.clone(),
		gossip_args: Vec::new(),
		bridge_name,
	};

	let (controller, _handles) = Controller::new(controller_config, state, store, overlay, resolver, Vec::new());

	let cancel = CancellationToken::new();
	let shutdown_cancel = cancel.clone();
	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		info!("received shutdown signal");
		shutdown_cancel.cancel();
	});

	controller.run(cancel).await
}

/// Builds the real WireGuard-backed overlay. `uncloudd` programs kernel
/// interfaces and netfilter directly, so it only runs on Linux; the
/// `MockDriver` stays a test-only fixture (`uncloud_overlay`'s own unit
/// tests), never something the shipped binary can fall back to.
#[cfg(target_os = "linux")]
fn build_overlay(overlay_config: OverlayConfig) -> Result<Arc<Overlay<WireguardDriver>>, Error> {
	let driver = Arc::new(WireguardDriver::new(OVERLAY_INTERFACE_NAME)?);
	Ok(Arc::new(Overlay::new(driver, overlay_config)))
}

#[cfg(not(target_os = "linux"))]
fn build_overlay(_overlay_config: OverlayConfig) -> Result<Arc<Overlay<MockDriver>>, Error> {
	Err(Error::msg(
		ErrorKind::ConfigInvalid,
		"uncloudd requires Linux (WireGuard interface and netlink programming)",
	))
}

/// Bridges stdin/stdout to the local API socket, splicing both
/// directions and honoring half-close in either direction (spec §6).
async fn dial_stdio(socket_path: PathBuf) -> Result<(), Error> {
	let stream = UnixStream::connect(&socket_path).await.map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))?;
	let (mut sock_read, mut sock_write) = stream.into_split();
	let mut stdin = tokio::io::stdin();
	let mut stdout = tokio::io::stdout();

	let to_socket = async {
		let mut buf = [0u8; 8192];
		loop {
			let n = stdin.read(&mut buf).await?;
			if n == 0 {
				sock_write.shutdown().await?;
				break;
			}
			sock_write.write_all(&buf[..n]).await?;
		}
		Ok::<(), std::io::Error>(())
	};

	let from_socket = async {
		let mut buf = [0u8; 8192];
		loop {
			let n = sock_read.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			stdout.write_all(&buf[..n]).await?;
			stdout.flush().await?;
		}
		Ok::<(), std::io::Error>(())
	};

	tokio::try_join!(to_socket, from_socket).map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))?;
	Ok(())
}

