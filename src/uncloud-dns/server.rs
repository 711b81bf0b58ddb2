//! DNS server (spec §4.C "Server contract"): one process listening on
//! UDP and TCP at the machine's overlay address, port 53. Internal
//! names under the reserved suffix are answered from the live resolver
//! snapshot; everything else is forwarded upstream.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{rdata::A, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use hickory_server::ServerFuture;
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use uncloud_util::{Error, ErrorKind};

use crate::forward::{Forwarder, Transport};
use crate::resolver::ResolverTable;

const DEFAULT_INTERNAL_SUFFIX: &str = "internal.";
const NEAREST_LABEL: &str = "nearest";
const DNS_PORT: u16 = 53;
/// EDNS0 is not negotiated beyond the minimum message size, per spec
/// §4.C response-size-cap contract ("min message size or EDNS0
/// advertised UDP size if larger").
const MIN_UDP_MESSAGE_SIZE: u16 = 512;
const MAX_TCP_MESSAGE_SIZE: u16 = u16::MAX;
const TCP_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DnsServerConfig {
	pub bind_addr: IpAddr,
	pub internal_suffix: String,
	pub local_subnet: Option<ipnet::IpNet>,
	pub upstreams: Vec<SocketAddr>,
}

impl Default for DnsServerConfig {
	fn default() -> Self {
		DnsServerConfig {
			bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			internal_suffix: DEFAULT_INTERNAL_SUFFIX.to_string(),
			local_subnet: None,
			upstreams: Vec::new(),
		}
	}
}

struct Handler {
	resolver: ResolverTable,
	forwarder: Forwarder,
	internal_suffix: Name,
	local_subnet: Option<ipnet::IpNet>,
}

impl Handler {
	fn is_internal(&self, name: &Name) -> bool {
		name.zone_of(&self.internal_suffix)
	}

	/// Strip the `nearest.` label if present, returning whether it was
	/// requested along with the remaining name.
	fn strip_nearest(name: &Name) -> (bool, Name) {
		if name.num_labels() > 0 {
			let first = name.iter().next().map(|l| l.to_ascii_lowercase());
			if first.as_deref() == Some(NEAREST_LABEL.as_bytes()) {
				return (true, name.trim_to(name.num_labels() as usize - 1));
			}
		}
		(false, name.clone())
	}

	fn order_answers(&self, nearest: bool, mut ips: Vec<IpAddr>) -> Vec<IpAddr> {
		if nearest {
			if let Some(subnet) = self.local_subnet {
				ips.sort_by_key(|ip| !subnet.contains(ip));
			}
		} else {
			ips.shuffle(&mut rand::thread_rng());
		}
		ips
	}
}

#[async_trait]
impl RequestHandler for Handler {
	async fn handle_request<R: ResponseHandler>(
		&self,
		request: &Request,
		mut response_handle: R,
	) -> ResponseInfo {
		let mut header = Header::response_from_request(request.header());
		header.set_message_type(MessageType::Response);

		if request.header().op_code() != OpCode::Query {
			return Self::send_error(request, &mut response_handle, header, ResponseCode::FormErr).await;
		}

		// Accept one question, per spec §4.C.
		let query = request.query();
		let name = Name::from(query.name().clone());

		if self.is_internal(&name) {
			self.handle_internal(request, &mut response_handle, header, &name, query.query_type())
				.await
		} else {
			let transport = match request.protocol() {
				hickory_server::server::Protocol::Tcp => Transport::Tcp,
				_ => Transport::Udp,
			};
			self.handle_forward(request, &mut response_handle, header, &name, query.query_type(), transport)
				.await
		}
	}
}

impl Handler {
	async fn send_error<R: ResponseHandler>(
		request: &Request,
		response_handle: &mut R,
		mut header: Header,
		code: ResponseCode,
	) -> ResponseInfo {
		header.set_response_code(code);
		let response = MessageResponseBuilder::from_message_request(request).build_no_records(header);
		response_handle
			.send_response(response)
			.await
			.unwrap_or_else(|_| ResponseInfo::from(header))
	}

	async fn handle_internal<R: ResponseHandler>(
		&self,
		request: &Request,
		response_handle: &mut R,
		mut header: Header,
		name: &Name,
		rtype: RecordType,
	) -> ResponseInfo {
		if rtype != RecordType::A {
			header.set_response_code(ResponseCode::NoError);
			let builder = MessageResponseBuilder::from_message_request(request);
			let response = builder.build_no_records(header);
			return response_handle
				.send_response(response)
				.await
				.unwrap_or_else(|_| ResponseInfo::from(header));
		}

		let (nearest, stripped) = Self::strip_nearest(name);
		let (service, namespace) = Self::split_service_namespace(&stripped, &self.internal_suffix);
		let ips = self.resolver.resolve(&service, namespace.as_deref());

		if ips.is_empty() {
			return Self::send_error(request, response_handle, header, ResponseCode::NXDomain).await;
		}

		let ips = self.order_answers(nearest, ips);
		let records: Vec<Record> = ips
			.into_iter()
			.filter_map(|ip| match ip {
				IpAddr::V4(v4) => Some(Record::from_rdata(name.clone(), 0, RData::A(A(v4)))),
				IpAddr::V6(_) => None,
			})
			.collect();

		header.set_response_code(ResponseCode::NoError);
		let builder = MessageResponseBuilder::from_message_request(request);
		let response = builder.build(header, records.iter(), [], [], []);
		response_handle
			.send_response(response)
			.await
			.unwrap_or_else(|_| ResponseInfo::from(header))
	}

	/// Splits a query name (with the internal suffix already stripped)
	/// into the `(service, namespace)` pair the resolver table is keyed
	/// by. A machine-qualified query (`resolver.rs`'s `"<machine_id>.m.
	/// <service_name>"` key) has a literal `m` delimiter label and must
	/// be reassembled into that same dotted string rather than truncated
	/// at the delimiter.
	fn split_service_namespace(name: &Name, suffix: &Name) -> (String, Option<String>) {
		const MACHINE_DELIMITER: &str = "m";

		let relative = name.trim_to(name.num_labels().saturating_sub(suffix.num_labels()) as usize);
		let labels: Vec<String> = relative
			.iter()
			.map(|l| String::from_utf8_lossy(l).to_string())
			.collect();
		match labels.len() {
			0 => (String::new(), None),
			1 => (labels[0].clone(), None),
			3 if labels[1] == MACHINE_DELIMITER => {
				(format!("{}.{}.{}", labels[0], MACHINE_DELIMITER, labels[2]), None)
			}
			4 if labels[1] == MACHINE_DELIMITER => (
				format!("{}.{}.{}", labels[0], MACHINE_DELIMITER, labels[2]),
				Some(labels[3].clone()),
			),
			_ => (labels[0].clone(), Some(labels[1].clone())),
		}
	}

	async fn handle_forward<R: ResponseHandler>(
		&self,
		request: &Request,
		response_handle: &mut R,
		mut header: Header,
		name: &Name,
		rtype: RecordType,
		transport: Transport,
	) -> ResponseInfo {
		match self.forwarder.forward(name, rtype, transport).await {
			Ok(upstream_response) => {
				header.set_response_code(upstream_response.response_code());
				let builder = MessageResponseBuilder::from_message_request(request);
				let response = builder.build(
					header,
					upstream_response.answers().iter(),
					upstream_response.name_servers().iter(),
					[],
					upstream_response.additionals().iter(),
				);
				response_handle
					.send_response(response)
					.await
					.unwrap_or_else(|_| ResponseInfo::from(header))
			}
			Err(e) => {
				warn!(error = %e, name = %name, "forward failed, returning SERVFAIL");
				Self::send_error(request, response_handle, header, ResponseCode::ServFail).await
			}
		}
	}
}

/// Run the UDP and TCP DNS servers until `cancel` fires. UDP bind
/// failure is fatal; TCP bind failure degrades gracefully (spec §4.C).
pub async fn serve(
	config: DnsServerConfig,
	resolver: ResolverTable,
	cancel: CancellationToken,
) -> Result<(), Error> {
	let internal_suffix = Name::from_ascii(&config.internal_suffix)
		.map_err(|e| Error::new(ErrorKind::ConfigInvalid, anyhow::anyhow!("{}", e)))?;
	let forwarder = Forwarder::new(crate::forward::resolve_upstreams(&config.upstreams));

	let handler = Arc::new(Handler {
		resolver,
		forwarder,
		internal_suffix,
		local_subnet: config.local_subnet,
	});

	let mut server = ServerFuture::new(ArcHandler(handler));

	let udp_addr = SocketAddr::new(config.bind_addr, DNS_PORT);
	let udp_socket = UdpSocket::bind(udp_addr)
		.await
		.map_err(|e| Error::new(ErrorKind::DnsBindFatal, e))?;
	server.register_socket(udp_socket);
	info!(addr = %udp_addr, "dns udp listener bound");

	let tcp_addr = SocketAddr::new(config.bind_addr, DNS_PORT);
	match TcpListener::bind(tcp_addr).await {
		Ok(listener) => {
			server.register_listener(listener, TCP_HANDLER_TIMEOUT);
			info!(addr = %tcp_addr, "dns tcp listener bound");
		}
		Err(e) => {
			warn!(error = %e, addr = %tcp_addr, "dns tcp bind failed, continuing udp-only");
		}
	}

	tokio::select! {
		result = server.block_until_done() => {
			result.map_err(|e| Error::new(ErrorKind::DnsBindFatal, e))
		}
		_ = cancel.cancelled() => {
			Err(Error::msg(ErrorKind::Canceled, "dns server canceled"))
		}
	}
}

/// `ServerFuture` requires `RequestHandler` by value; this thin wrapper
/// lets the handler live behind a shared `Arc` without duplicating its
/// state per clone.
#[derive(Clone)]
struct ArcHandler(Arc<Handler>);

#[async_trait]
impl RequestHandler for ArcHandler {
	async fn handle_request<R: ResponseHandler>(
		&self,
		request: &Request,
		response_handle: R,
	) -> ResponseInfo {
		self.0.handle_request(request, response_handle).await
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use hickory_proto::rr::Name;

	#[test]
	fn strip_nearest_label_detected() {
		let name = Name::from_ascii("nearest.web.default.internal.").unwrap();
		let (nearest, stripped) = Handler::strip_nearest(&name);
		assert!(nearest);
		assert_eq!(stripped.to_ascii(), "web.default.internal.");
	}

	#[test]
	fn no_nearest_label_unchanged() {
		let name = Name::from_ascii("web.default.internal.").unwrap();
		let (nearest, stripped) = Handler::strip_nearest(&name);
		assert!(!nearest);
		assert_eq!(stripped, name);
	}

	#[test]
	fn split_service_and_namespace() {
		let suffix = Name::from_ascii("internal.").unwrap();
		let name = Name::from_ascii("web.prod.internal.").unwrap();
		let (service, namespace) = Handler::split_service_namespace(&name, &suffix);
		assert_eq!(service, "web");
		assert_eq!(namespace.as_deref(), Some("prod"));
	}

	#[test]
	fn service_only_has_no_namespace() {
		let suffix = Name::from_ascii("internal.").unwrap();
		let name = Name::from_ascii("web.internal.").unwrap();
		let (service, namespace) = Handler::split_service_namespace(&name, &suffix);
		assert_eq!(service, "web");
		assert!(namespace.is_none());
	}

	#[test]
	fn machine_qualified_query_reconstructs_resolver_key() {
		let suffix = Name::from_ascii("internal.").unwrap();
		let name = Name::from_ascii("m1.m.web.internal.").unwrap();
		let (service, namespace) = Handler::split_service_namespace(&name, &suffix);
		assert_eq!(service, "m1.m.web");
		assert!(namespace.is_none());
	}

	#[test]
	fn machine_qualified_query_with_namespace_reconstructs_resolver_key() {
		let suffix = Name::from_ascii("internal.").unwrap();
		let name = Name::from_ascii("m1.m.web.prod.internal.").unwrap();
		let (service, namespace) = Handler::split_service_namespace(&name, &suffix);
		assert_eq!(service, "m1.m.web");
		assert_eq!(namespace.as_deref(), Some("prod"));
	}
}
