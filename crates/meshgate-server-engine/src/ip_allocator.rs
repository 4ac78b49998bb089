// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::EngineError;

/// Number of leading addresses reserved in every block: the network
/// address, the hub/gateway address, and one spare.
const RESERVED_LEADING: u32 = 3;

/// Returns the lowest-ordered free virtual IP inside `cidr`.
///
/// The first three addresses of the block and the broadcast address are
/// never handed out. Deterministic: the same allocated set always yields
/// the same candidate.
pub fn allocate(cidr: Ipv4Net, allocated: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, EngineError> {
	let start = u32::from(cidr.network()).saturating_add(RESERVED_LEADING);
	let end = u32::from(cidr.broadcast());

	for raw in start..end {
		let candidate = Ipv4Addr::from(raw);
		if !allocated.contains(&candidate) {
			return Ok(candidate);
		}
	}

	Err(EngineError::AddressSpaceExhausted(cidr.to_string()))
}
