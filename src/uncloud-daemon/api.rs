//! Local control API (spec §4.G): a minimal gRPC surface reachable both
//! over a Unix socket for same-host clients and over the management
//! address for remote cluster tooling. Only `Ping` is implemented; the
//! rest of the control surface is out of scope.

use std::ffi::CString;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

use uncloud_util::{Error, ErrorKind};

use crate::control_proto::control_plane_server::{ControlPlane, ControlPlaneServer};
use crate::control_proto::{PingRequest, PingResponse};

/// Graceful-stop deadline before the API server is hard-stopped (spec
/// §4.I shutdown step 1).
pub const GRACEFUL_STOP_DEADLINE: Duration = Duration::from_secs(10);

struct Service {
	machine_id: String,
}

#[tonic::async_trait]
impl ControlPlane for Service {
	async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
		Ok(Response::new(PingResponse { machine_id: self.machine_id.clone() }))
	}
}

pub struct ApiServer {
	socket_path: PathBuf,
	tcp_addr: SocketAddr,
	machine_id: String,
}

impl ApiServer {
	pub fn new(socket_path: PathBuf, tcp_addr: SocketAddr, machine_id: String) -> Self {
		ApiServer { socket_path, tcp_addr, machine_id }
	}

	/// Binds both listeners, then serves until `cancel` fires. On
	/// cancellation, `tonic` is given [`GRACEFUL_STOP_DEADLINE`] to drain
	/// in-flight requests before the future simply returns, which drops
	/// the listeners and hard-stops anything still in flight.
	pub async fn serve(&self, cancel: CancellationToken) -> Result<(), Error> {
		let _ = std::fs::remove_file(&self.socket_path);
		let unix_listener = UnixListener::bind(&self.socket_path)
			.map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))?;
		set_socket_permissions(&self.socket_path)?;

		let tcp_listener = TcpListener::bind(self.tcp_addr)
			.await
			.map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))?;

		info!(socket = %self.socket_path.display(), tcp = %self.tcp_addr, "control api listening");

		let unix_service = ControlPlaneServer::new(Service { machine_id: self.machine_id.clone() });

		let graceful = cancel.clone();
		let unix_server = tonic::transport::Server::builder()
			.add_service(unix_service)
			.serve_with_incoming_shutdown(UnixListenerStream::new(unix_listener), async move {
				graceful.cancelled().await;
			});

		let graceful = cancel.clone();
		let tcp_service = ControlPlaneServer::new(Service { machine_id: self.machine_id.clone() });
		let tcp_server = tonic::transport::Server::builder()
			.add_service(tcp_service)
			.serve_with_incoming_shutdown(TcpListenerStream::new(tcp_listener), async move {
				graceful.cancelled().await;
			});

		let result = tokio::select! {
			r = unix_server => r,
			r = tcp_server => r,
		};

		let _ = std::fs::remove_file(&self.socket_path);
		result.map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))
	}
}

/// Well-known group the control socket is owned by when it exists on the
/// host (spec §4.G: "owned by a well-known group if it exists else
/// root").
const SOCKET_GROUP: &str = "uncloud";

/// Mode 0660, owned by [`SOCKET_GROUP`] so its members can reach the
/// socket without root; falls back to leaving ownership unchanged
/// (root, since the daemon itself runs as root) when the group doesn't
/// resolve on this host.
fn set_socket_permissions(path: &Path) -> Result<(), Error> {
	let mut perms = std::fs::metadata(path)
		.map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))?
		.permissions();
	perms.set_mode(0o660);
	std::fs::set_permissions(path, perms).map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))?;

	match lookup_group_gid(SOCKET_GROUP) {
		Some(gid) => chown_group(path, gid)?,
		None => info!(group = SOCKET_GROUP, "socket group not found, leaving ownership unchanged"),
	}
	Ok(())
}

fn lookup_group_gid(name: &str) -> Option<libc::gid_t> {
	let cname = CString::new(name).ok()?;
	// SAFETY: cname is a valid NUL-terminated string; getgrnam returns a
	// pointer into reused static storage that's only read here, before
	// any other libc call.
	let entry = unsafe { libc::getgrnam(cname.as_ptr()) };
	if entry.is_null() {
		None
	} else {
		Some(unsafe { (*entry).gr_gid })
	}
}

fn chown_group(path: &Path, gid: libc::gid_t) -> Result<(), Error> {
	let cpath = CString::new(path.as_os_str().as_bytes())
		.map_err(|e| Error::new(ErrorKind::ApiBindFailed, e))?;
	// SAFETY: cpath is a valid NUL-terminated path; uid -1 leaves the
	// owning user unchanged.
	let rc = unsafe { libc::chown(cpath.as_ptr(), u32::MAX, gid) };
	if rc != 0 {
		return Err(Error::new(ErrorKind::ApiBindFailed, std::io::Error::last_os_error()));
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn ping_returns_machine_id() {
		let service = Service { machine_id: "m1".to_string() };
		let response = service.ping(Request::new(PingRequest {})).await.unwrap();
		assert_eq!(response.into_inner().machine_id, "m1");
	}

	#[test]
	fn unknown_group_resolves_to_none() {
		assert!(lookup_group_gid("no-such-uncloud-test-group").is_none());
	}
}
