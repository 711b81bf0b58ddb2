//! Linux `TunnelDriver` backed by a real WireGuard interface: the
//! WireGuard-specific UAPI is programmed through `wireguard-control`
//! (the crate behind the `innernet` WireGuard mesh tool, the closest
//! real-world analogue to this component); link/address/route state is
//! programmed through `rtnetlink`, the standard way Rust programs talk
//! to the kernel's netlink interface for anything WireGuard itself
//! doesn't own.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::{IpNet, Ipv4Net};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use wireguard_control::{
	Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder, PeerInfo,
};

use crate::driver::{DesiredConfig, PeerEndpointUpdate, PeerStats, TunnelDriver};
use crate::peer::PublicKey;
use uncloud_util::{Error, ErrorKind};

const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

pub struct WireguardDriver {
	iface: InterfaceName,
}

impl WireguardDriver {
	pub fn new(iface_name: &str) -> Result<Self, Error> {
		let iface = InterfaceName::from_str(iface_name).map_err(|e| {
			Error::new(
				ErrorKind::ConfigInvalid,
				anyhow::anyhow!("invalid interface name {}: {}", iface_name, e),
			)
		})?;
		Ok(WireguardDriver { iface })
	}

	fn to_wg_key(bytes: &[u8; 32]) -> Key {
		Key::from_raw(*bytes)
	}

	fn from_wg_key(key: &Key) -> PublicKey {
		PublicKey(*key.as_bytes())
	}

	async fn ensure_link_up(&self, address: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
		let (connection, handle, _) = rtnetlink::new_connection().map_err(|e| {
			Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e))
		})?;
		tokio::spawn(connection);

		let mut links = handle.link().get().match_name(self.iface.to_string()).execute();
		let link = links
			.try_next()
			.await
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?
			.ok_or_else(|| {
				Error::msg(
					ErrorKind::TunnelProgramFailed,
					format!("interface {} does not exist", self.iface),
				)
			})?;
		let index = link.header.index;

		let desired = IpAddr::V4(address);
		let mut existing = handle.address().get().set_link_index_filter(index).execute();
		while let Some(msg) = existing
			.try_next()
			.await
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?
		{
			let current = msg.attributes.iter().find_map(|a| match a {
				AddressAttribute::Address(ip) => Some(*ip),
				_ => None,
			});
			if current != Some(desired) || msg.header.prefix_len != prefix_len {
				handle
					.address()
					.del(msg)
					.execute()
					.await
					.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?;
			}
		}

		handle
			.address()
			.add(index, desired, prefix_len)
			.execute()
			.await
			.or_else(|e| {
				// Idempotent: "file exists" means the address is already
				// programmed, which is the desired outcome.
				if format!("{}", e).contains("EEXIST") {
					Ok(())
				} else {
					Err(e)
				}
			})
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?;

		handle
			.link()
			.set(index)
			.up()
			.execute()
			.await
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?;

		Ok(())
	}

	async fn sync_routes(&self, routes: &[ipnet::Ipv4Net]) -> Result<(), Error> {
		let (connection, handle, _) = rtnetlink::new_connection().map_err(|e| {
			Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e))
		})?;
		tokio::spawn(connection);

		let mut links = handle.link().get().match_name(self.iface.to_string()).execute();
		let link = links
			.try_next()
			.await
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?
			.ok_or_else(|| {
				Error::msg(
					ErrorKind::TunnelProgramFailed,
					format!("interface {} does not exist", self.iface),
				)
			})?;
		let index = link.header.index;

		let mut existing = handle.route().get(rtnetlink::IpVersion::V4).execute();
		let mut stale = Vec::new();
		while let Some(msg) = existing
			.try_next()
			.await
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?
		{
			let oif = msg.attributes.iter().find_map(|a| match a {
				RouteAttribute::Oif(idx) => Some(*idx),
				_ => None,
			});
			if oif != Some(index) {
				continue;
			}
			let dest = msg.attributes.iter().find_map(|a| match a {
				RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
					Ipv4Net::new(*addr, msg.header.destination_prefix_length).ok()
				}
				_ => None,
			});
			match dest {
				Some(net) if routes.contains(&net) => {}
				_ => stale.push(msg),
			}
		}
		for msg in stale {
			handle
				.route()
				.del(msg)
				.execute()
				.await
				.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?;
		}

		for route in routes {
			handle
				.route()
				.add()
				.v4()
				.destination_prefix(route.network(), route.prefix_len())
				.output_interface(index)
				.execute()
				.await
				.or_else(|e| {
					if format!("{}", e).contains("EEXIST") {
						Ok(())
					} else {
						Err(e)
					}
				})
				.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?;
		}
		Ok(())
	}
}

#[async_trait]
impl TunnelDriver for WireguardDriver {
	async fn configure(&self, desired: &DesiredConfig) -> Result<(), Error> {
		let peer_configs: Vec<PeerConfigBuilder> = desired
			.peers
			.iter()
			.map(|p| {
				let mut builder = PeerConfigBuilder::new(&Self::to_wg_key(&p.public_key.0));
				for allowed in &p.allowed_ips {
					if let IpNet::V4(v4) = allowed {
						builder = builder.add_allowed_ip(IpAddr::V4(v4.network()), v4.prefix_len());
					}
				}
				if let Some(endpoint) = p.endpoint {
					builder = builder.set_endpoint(endpoint);
				}
				builder = builder.set_persistent_keepalive_interval(
					p.persistent_keepalive.unwrap_or(PERSISTENT_KEEPALIVE_SECS),
				);
				builder
			})
			.collect();

		let update = DeviceUpdate::new()
			.set_private_key(Self::to_wg_key(&desired.private_key))
			.set_listen_port(desired.listen_port)
			.replace_peers()
			.add_peers(&peer_configs);

		update
			.apply(&self.iface, Backend::Kernel)
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?;

		self.ensure_link_up(desired.address, desired.address_prefix_len)
			.await?;
		self.sync_routes(&desired.routes).await?;

		Ok(())
	}

	async fn update_peer_endpoint(&self, update: &PeerEndpointUpdate) -> Result<(), Error> {
		let builder = PeerConfigBuilder::new(&Self::to_wg_key(&update.public_key.0))
			.set_endpoint(update.endpoint);
		DeviceUpdate::new()
			.add_peer(builder)
			.apply(&self.iface, Backend::Kernel)
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))
	}

	async fn peer_stats(&self) -> Result<Vec<(PublicKey, PeerStats)>, Error> {
		let device = Device::get(&self.iface, Backend::Kernel)
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))?;

		Ok(device
			.peers
			.iter()
			.map(|PeerInfo { config, stats, .. }| {
				let endpoint = config.endpoint.map(SocketAddr::from);
				(
					Self::from_wg_key(&config.public_key),
					PeerStats {
						rx_bytes: stats.rx_bytes,
						tx_bytes: stats.tx_bytes,
						last_handshake_ago_ms: stats.last_handshake_time.and_then(|t| {
							t.elapsed().ok().map(|d| d.as_millis() as u64)
						}),
						observed_endpoint: endpoint,
					},
				)
			})
			.collect())
	}

	async fn cleanup(&self) -> Result<(), Error> {
		Device::get(&self.iface, Backend::Kernel)
			.and_then(|d| d.delete())
			.or_else(|e| {
				// Already gone: idempotent.
				if format!("{}", e).contains("No such device") {
					Ok(())
				} else {
					Err(e)
				}
			})
			.map_err(|e| Error::new(ErrorKind::TunnelProgramFailed, anyhow::anyhow!(e)))
	}
}
