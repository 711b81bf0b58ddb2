//! In-memory resolver tables (spec §3 "In-memory resolver tables", §4.C
//! resolver contract). A snapshot is rebuilt wholesale on every input
//! change and swapped in atomically; readers never block writers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

const DEFAULT_NAMESPACE: &str = "default";

/// One row of the store's `containers` table, as seen by the resolver.
/// Only the fields needed to build resolver tables.
#[derive(Debug, Clone)]
pub struct ContainerRow {
	pub healthy: bool,
	pub overlay_ip: Option<IpAddr>,
	pub service_id: Option<String>,
	pub service_name: Option<String>,
	pub namespace: Option<String>,
	pub machine_id: String,
}

#[derive(Debug, Default)]
struct Snapshot {
	by_key: HashMap<(String, String), Vec<IpAddr>>,
	namespace_by_ip: HashMap<IpAddr, String>,
}

/// Process-wide resolver table (spec §4.C). Cheap to clone (an `Arc`
/// around a lock-free swappable pointer); intended to be held as a
/// single shared instance.
#[derive(Clone, Default)]
pub struct ResolverTable {
	snapshot: Arc<ArcSwap<Snapshot>>,
}

impl ResolverTable {
	pub fn new() -> Self {
		ResolverTable {
			snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::default())),
		}
	}

	/// Rebuild the entire table from a fresh snapshot of `containers` rows
	/// and atomically replace the live view (spec §4.C "Build"/"Replace").
	pub fn rebuild(&self, rows: &[ContainerRow]) {
		let mut by_key: HashMap<(String, String), Vec<IpAddr>> = HashMap::new();
		let mut namespace_by_ip = HashMap::new();

		for row in rows {
			let (Some(ip), Some(service_id), Some(service_name)) =
				(row.overlay_ip, row.service_id.as_ref(), row.service_name.as_ref())
			else {
				continue;
			};
			if !row.healthy {
				continue;
			}
			let namespace = row
				.namespace
				.clone()
				.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

			by_key
				.entry((namespace.clone(), service_name.clone()))
				.or_default()
				.push(ip);
			by_key
				.entry((namespace.clone(), service_id.clone()))
				.or_default()
				.push(ip);
			by_key
				.entry((namespace.clone(), format!("{}.m.{}", row.machine_id, service_name)))
				.or_default()
				.push(ip);
			namespace_by_ip.insert(ip, namespace);
		}

		self.snapshot.store(Arc::new(Snapshot { by_key, namespace_by_ip }));
	}

	/// `Resolve(service, namespace)`: defensive copy of the IP list,
	/// defaulting namespace to `default`.
	pub fn resolve(&self, service: &str, namespace: Option<&str>) -> Vec<IpAddr> {
		let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE);
		let snapshot = self.snapshot.load();
		snapshot
			.by_key
			.get(&(namespace.to_string(), service.to_string()))
			.cloned()
			.unwrap_or_default()
	}

	/// `GetNamespaceByIP(ip)`: the namespace owning an IP, or none.
	pub fn get_namespace_by_ip(&self, ip: IpAddr) -> Option<String> {
		self.snapshot.load().namespace_by_ip.get(&ip).cloned()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::Ipv4Addr;

	fn row(service: &str, id: &str, ns: Option<&str>, ip: [u8; 4], healthy: bool) -> ContainerRow {
		ContainerRow {
			healthy,
			overlay_ip: Some(IpAddr::V4(Ipv4Addr::from(ip))),
			service_id: Some(id.to_string()),
			service_name: Some(service.to_string()),
			namespace: ns.map(str::to_string),
			machine_id: "m1".to_string(),
		}
	}

	#[test]
	fn resolves_by_service_name_and_id_and_machine_qualified_name() {
		let table = ResolverTable::new();
		table.rebuild(&[row("web", "svc-1", None, [10, 0, 0, 5], true)]);

		assert_eq!(table.resolve("web", None), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]);
		assert_eq!(table.resolve("svc-1", None), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]);
		assert_eq!(
			table.resolve("m1.m.web", None),
			vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]
		);
	}

	#[test]
	fn unhealthy_or_incomplete_rows_are_skipped() {
		let table = ResolverTable::new();
		let mut incomplete = row("web", "svc-1", None, [10, 0, 0, 5], true);
		incomplete.service_name = None;
		table.rebuild(&[
			row("web", "svc-2", None, [10, 0, 0, 6], false),
			incomplete,
		]);
		assert!(table.resolve("web", None).is_empty());
	}

	#[test]
	fn namespace_defaults_and_reverse_lookup() {
		let table = ResolverTable::new();
		table.rebuild(&[row("api", "svc-3", Some("prod"), [10, 0, 1, 9], true)]);

		assert!(table.resolve("api", None).is_empty());
		assert_eq!(
			table.resolve("api", Some("prod")),
			vec![IpAddr::V4(Ipv4Addr::new(10, 0, 1, 9))]
		);
		assert_eq!(
			table.get_namespace_by_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 9))),
			Some("prod".to_string())
		);
	}

	#[test]
	fn rebuild_fully_replaces_prior_snapshot() {
		let table = ResolverTable::new();
		table.rebuild(&[row("web", "svc-1", None, [10, 0, 0, 5], true)]);
		table.rebuild(&[row("web", "svc-1", None, [10, 0, 0, 9], true)]);
		assert_eq!(table.resolve("web", None), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))]);
	}
}
