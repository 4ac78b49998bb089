// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use ipnet::Ipv4Net;

use crate::networks::Network;

/// Interface naming scheme recognized by the assigner.
const IFACE_PREFIX: &str = "wg";

/// Picks a fresh interface identity and listen port for a new network.
///
/// The identity is one past the highest `wgN` among existing networks, so
/// identities grow monotonically and an identity below the current maximum
/// is never handed out again. The port is the lowest unused port at or
/// above `base_port`.
pub fn assign(existing: &[Network], base_port: u16) -> (String, u16) {
	let mut max_idx: i64 = -1;
	let mut used_ports: HashSet<u16> = HashSet::new();

	for network in existing {
		if let Some(rest) = network.iface.strip_prefix(IFACE_PREFIX) {
			if let Ok(idx) = rest.parse::<i64>() {
				max_idx = max_idx.max(idx);
			}
		}
		if network.listen_port > 0 {
			used_ports.insert(network.listen_port);
		}
	}

	let iface = format!("{IFACE_PREFIX}{}", max_idx + 1);

	let mut port = base_port;
	while used_ports.contains(&port) {
		port += 1;
	}

	(iface, port)
}

/// Two blocks overlap iff either contains the other's network address.
pub fn cidrs_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
	a.contains(&b.network()) || b.contains(&a.network())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::networks::Network;
	use chrono::Utc;
	use proptest::prelude::*;
	use uuid::Uuid;

	fn network(iface: &str, port: u16) -> Network {
		Network {
			id: Uuid::new_v4(),
			name: iface.to_string(),
			cidr: "10.10.0.0/24".parse().unwrap(),
			iface: iface.to_string(),
			listen_port: port,
			private_key: String::new(),
			public_key: String::new(),
			endpoint: String::new(),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	#[test]
	fn test_assign_first_network() {
		let (iface, port) = assign(&[], 51820);
		assert_eq!(iface, "wg0");
		assert_eq!(port, 51820);
	}

	#[test]
	fn test_assign_next_after_highest() {
		let existing = vec![network("wg0", 51820), network("wg3", 51822)];
		let (iface, port) = assign(&existing, 51820);
		assert_eq!(iface, "wg4");
		assert_eq!(port, 51821);
	}

	#[test]
	fn test_assign_never_reuses_identity_below_max() {
		// wg1 was deleted; the max survivor is wg2, so the next identity is
		// wg3, not wg1.
		let existing = vec![network("wg0", 51820), network("wg2", 51821)];
		let (iface, _) = assign(&existing, 51820);
		assert_eq!(iface, "wg3");
	}

	#[test]
	fn test_assign_ignores_foreign_interface_names() {
		let existing = vec![network("eth0", 51820), network("wg1", 51821)];
		let (iface, port) = assign(&existing, 51820);
		assert_eq!(iface, "wg2");
		assert_eq!(port, 51822);
	}

	#[test]
	fn test_assign_port_skips_used_run() {
		let existing = vec![
			network("wg0", 51820),
			network("wg1", 51821),
			network("wg2", 51822),
		];
		let (_, port) = assign(&existing, 51820);
		assert_eq!(port, 51823);
	}

	#[test]
	fn test_overlap_nested_blocks() {
		let a: Ipv4Net = "10.0.0.0/16".parse().unwrap();
		let b: Ipv4Net = "10.0.4.0/24".parse().unwrap();
		assert!(cidrs_overlap(&a, &b));
		assert!(cidrs_overlap(&b, &a));
	}

	#[test]
	fn test_overlap_disjoint_blocks() {
		let a: Ipv4Net = "10.1.0.0/24".parse().unwrap();
		let b: Ipv4Net = "10.2.0.0/24".parse().unwrap();
		assert!(!cidrs_overlap(&a, &b));
		assert!(!cidrs_overlap(&b, &a));
	}

	proptest! {
		// Property: overlap is symmetric, and true iff one block's network
		// address lies inside the other.
		#[test]
		fn prop_overlap_symmetric(
			a_octet in 0u8..=255,
			a_prefix in 8u8..=30,
			b_octet in 0u8..=255,
			b_prefix in 8u8..=30,
		) {
			let a: Ipv4Net = format!("10.{a_octet}.0.0/{a_prefix}")
				.parse::<Ipv4Net>()
				.unwrap()
				.trunc();
			let b: Ipv4Net = format!("10.{b_octet}.0.0/{b_prefix}")
				.parse::<Ipv4Net>()
				.unwrap()
				.trunc();

			prop_assert_eq!(cidrs_overlap(&a, &b), cidrs_overlap(&b, &a));
			let expected = a.contains(&b.network()) || b.contains(&a.network());
			prop_assert_eq!(cidrs_overlap(&a, &b), expected);
		}

		// Property: a freshly assigned identity/port never collides with an
		// existing network.
		#[test]
		fn prop_assign_never_collides(count in 0usize..12) {
			let existing: Vec<Network> = (0..count)
				.map(|i| network(&format!("wg{i}"), 51820 + i as u16))
				.collect();

			let (iface, port) = assign(&existing, 51820);
			prop_assert!(existing.iter().all(|n| n.iface != iface));
			prop_assert!(existing.iter().all(|n| n.listen_port != port));
		}
	}
}
