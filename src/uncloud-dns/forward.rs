//! Forwarding of non-internal queries to upstream resolvers (spec
//! §4.C): configured upstreams, or `/etc/resolv.conf`, or two
//! well-known public resolvers as a last resort. Bounded by a
//! semaphore of in-flight forwards; over-limit requests get `SERVFAIL`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_client::proto::rr::{DNSClass, Name, RecordType};
use hickory_client::proto::udp::UdpClientStream;
use hickory_client::tcp::TcpClientStream;
use hickory_proto::iocompat::AsyncIoTokioAsStd;
use hickory_proto::xfer::DnsResponse;
use hickory_resolver::config::ResolverConfig;
use tokio::sync::Semaphore;
use tracing::warn;

use uncloud_util::{Error, ErrorKind};

pub const MAX_IN_FLIGHT_FORWARDS: usize = 1024;
const FORWARD_TIMEOUT: Duration = Duration::from_secs(3);

/// Which transport the original client query arrived on; forwards go out
/// the same way (spec §4.C "forward over the same transport as the
/// client used").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
	Udp,
	Tcp,
}

const WELL_KNOWN_FALLBACK: [IpAddr; 2] = [
	IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
	IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
];

/// Resolves the set of upstream resolvers to forward to, in priority
/// order: explicitly configured, then the system's `/etc/resolv.conf`,
/// then the well-known public fallback.
pub fn resolve_upstreams(configured: &[SocketAddr]) -> Vec<SocketAddr> {
	if !configured.is_empty() {
		return configured.to_vec();
	}
	if let Ok((config, _opts)) = hickory_resolver::system_conf::read_system_conf() {
		let from_system: Vec<SocketAddr> = config
			.name_servers()
			.iter()
			.map(|ns| ns.socket_addr)
			.collect();
		if !from_system.is_empty() {
			return from_system;
		}
	}
	let _ = ResolverConfig::default();
	WELL_KNOWN_FALLBACK.iter().map(|ip| SocketAddr::new(*ip, 53)).collect()
}

/// Bounded-concurrency forward gate (spec §4.C: 1024 in-flight).
pub struct Forwarder {
	upstreams: Vec<SocketAddr>,
	gate: Arc<Semaphore>,
}

impl Forwarder {
	pub fn new(upstreams: Vec<SocketAddr>) -> Self {
		Forwarder {
			upstreams,
			gate: Arc::new(Semaphore::new(MAX_IN_FLIGHT_FORWARDS)),
		}
	}

	/// Forward one query to the first reachable upstream, over the same
	/// transport the client used, rejecting with a permanent error if the
	/// in-flight cap is reached.
	pub async fn forward(&self, name: &Name, rtype: RecordType, transport: Transport) -> Result<DnsResponse, Error> {
		let _permit = self.gate.try_acquire().map_err(|_| {
			Error::msg(ErrorKind::Other, "forward concurrency limit reached")
		})?;

		let mut last_err = None;
		for upstream in &self.upstreams {
			match tokio::time::timeout(FORWARD_TIMEOUT, self.query_one(*upstream, name, rtype, transport)).await {
				Ok(Ok(response)) => return Ok(response),
				Ok(Err(e)) => {
					warn!(upstream = %upstream, error = %e, "upstream forward failed");
					last_err = Some(e);
				}
				Err(_) => {
					warn!(upstream = %upstream, "upstream forward timed out");
					last_err = Some(Error::msg(ErrorKind::Other, "forward timed out"));
				}
			}
		}
		Err(last_err.unwrap_or_else(|| Error::msg(ErrorKind::Other, "no upstreams configured")))
	}

	async fn query_one(
		&self,
		upstream: SocketAddr,
		name: &Name,
		rtype: RecordType,
		transport: Transport,
	) -> Result<DnsResponse, Error> {
		let mut client = match transport {
			Transport::Udp => {
				let stream = UdpClientStream::<tokio::net::UdpSocket>::new(upstream);
				let (client, bg) = AsyncClient::connect(stream)
					.await
					.map_err(|e| Error::new(ErrorKind::Other, e))?;
				tokio::spawn(bg);
				client
			}
			Transport::Tcp => {
				let (stream, sender) = TcpClientStream::<AsyncIoTokioAsStd<tokio::net::TcpStream>>::new(upstream);
				let (client, bg) = AsyncClient::new(stream, sender, None)
					.await
					.map_err(|e| Error::new(ErrorKind::Other, e))?;
				tokio::spawn(bg);
				client
			}
		};
		client
			.query(name.clone(), DNSClass::IN, rtype)
			.await
			.map_err(|e| Error::new(ErrorKind::Other, e))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn configured_upstreams_take_priority() {
		let configured = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53)];
		assert_eq!(resolve_upstreams(&configured), configured);
	}
}
