//! Minimal prefix cover of the union of peer allowed ranges (spec §4.A
//! `Configure`, §8 testable property: "the set of routes on the
//! interface equals the minimal prefix cover of ⋃ peers.allowed_ranges").

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Compute the minimal set of IPv4 CIDR blocks that exactly covers the
/// union of `nets`, with no two blocks overlapping or touching in a way
/// that could be merged further.
pub fn route_cover(nets: &[Ipv4Net]) -> Vec<Ipv4Net> {
	if nets.is_empty() {
		return Vec::new();
	}

	let mut ranges: Vec<(u64, u64)> = nets
		.iter()
		.map(|n| {
			let start = u32::from(n.network()) as u64;
			let end = u32::from(n.broadcast()) as u64;
			(start, end)
		})
		.collect();
	ranges.sort_unstable();

	let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
	for (start, end) in ranges.drain(..) {
		if let Some(last) = merged.last_mut() {
			if start <= last.1 + 1 {
				last.1 = last.1.max(end);
				continue;
			}
		}
		merged.push((start, end));
	}

	let mut out = Vec::new();
	for (start, end) in merged {
		out.extend(range_to_cidrs(start, end));
	}
	out
}

fn range_to_cidrs(mut start: u64, end: u64) -> Vec<Ipv4Net> {
	let mut out = Vec::new();
	while start <= end {
		let max_size_from_alignment = if start == 0 {
			32
		} else {
			start.trailing_zeros().min(32)
		};
		let count = end - start + 1;
		let max_size_from_count = 63 - count.leading_zeros(); // floor(log2(count))
		let size_bits = max_size_from_alignment.min(max_size_from_count);
		let prefix_len = 32 - size_bits;
		let block_len = 1u64 << size_bits;

		let addr = Ipv4Addr::from(start as u32);
		out.push(Ipv4Net::new(addr, prefix_len as u8).expect("valid prefix length"));

		start += block_len;
		if start == 0 {
			break; // wrapped past 255.255.255.255
		}
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;

	fn net(s: &str) -> Ipv4Net {
		s.parse().unwrap()
	}

	#[test]
	fn single_net_is_itself() {
		let cover = route_cover(&[net("10.210.5.0/24")]);
		assert_eq!(cover, vec![net("10.210.5.0/24")]);
	}

	#[test]
	fn adjacent_equal_subnets_merge_to_parent() {
		let cover = route_cover(&[net("10.0.0.0/25"), net("10.0.0.128/25")]);
		assert_eq!(cover, vec![net("10.0.0.0/24")]);
	}

	#[test]
	fn disjoint_subnets_stay_separate() {
		let mut cover = route_cover(&[net("10.0.0.0/24"), net("10.0.2.0/24")]);
		cover.sort_by_key(|n| u32::from(n.network()));
		assert_eq!(cover, vec![net("10.0.0.0/24"), net("10.0.2.0/24")]);
	}

	#[test]
	fn single_host_management_addresses_stay_as_32() {
		let cover = route_cover(&[net("10.210.1.1/32"), net("10.210.1.5/32")]);
		assert_eq!(cover.len(), 2);
		assert!(cover.iter().all(|n| n.prefix_len() == 32));
	}

	#[test]
	fn duplicate_nets_dedup() {
		let cover = route_cover(&[net("10.0.0.0/24"), net("10.0.0.0/24")]);
		assert_eq!(cover, vec![net("10.0.0.0/24")]);
	}

	#[test]
	fn mixed_subnet_and_management_ip_outside_it() {
		let mut cover = route_cover(&[net("10.210.5.0/24"), net("10.99.0.7/32")]);
		cover.sort_by_key(|n| u32::from(n.network()));
		assert_eq!(cover, vec![net("10.99.0.7/32"), net("10.210.5.0/24")]);
	}

	#[test]
	fn empty_input_yields_empty_cover() {
		assert!(route_cover(&[]).is_empty());
	}
}
