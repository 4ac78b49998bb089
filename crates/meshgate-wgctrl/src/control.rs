// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::WgError;

/// Point-in-time state of one live peer, as reported by `wg show <iface> dump`.
///
/// Regenerated on every query; never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
	pub public_key: String,
	/// Current remote endpoint (`host:port`, or `(none)` when unknown).
	pub endpoint: String,
	/// Comma-separated allowed-IP list as dumped.
	pub allowed_ips: String,
	/// Unix seconds of the latest handshake; 0 means never.
	pub latest_handshake: i64,
	pub transfer_rx: i64,
	pub transfer_tx: i64,
}

/// Control surface for one tunnel interface.
///
/// One instance is bound to exactly one interface identity. Every operation
/// may block on an external process invocation, so callers must not hold a
/// registry-wide or activity-map lock across an await on any of them.
#[async_trait]
pub trait TunnelControl: Send + Sync {
	/// The interface identity this handle is bound to.
	fn iface(&self) -> &str;

	/// Bring the interface up. Tolerates an interface that is already up.
	async fn up(&self) -> Result<(), WgError>;

	/// Bring the interface down. Never fails the caller, even if already down.
	async fn down(&self) -> Result<(), WgError>;

	/// Accept traffic from `public_key` restricted to the given address list.
	async fn add_peer(&self, public_key: &str, allowed_ips: &[String]) -> Result<(), WgError>;

	/// Remove a peer. Absence of the peer is not an error.
	async fn remove_peer(&self, public_key: &str) -> Result<(), WgError>;

	/// Query the current peer table.
	async fn list_peers(&self) -> Result<HashMap<String, PeerSnapshot>, WgError>;

	/// Derive the interface's own public key from its private key material,
	/// generating and persisting key material first if none exists yet.
	/// Safe to call repeatedly.
	async fn public_key(&self) -> Result<String, WgError>;
}

/// Parses `wg show <iface> dump` output into a peer table.
///
/// Peer lines carry whitespace-separated fields `[publicKey, presharedKey,
/// endpoint, allowedIPs, latestHandshake, rxBytes, txBytes, keepalive]`.
/// Lines with fewer than 8 fields are the interface header and skipped.
pub fn parse_peer_dump(output: &str) -> HashMap<String, PeerSnapshot> {
	let mut peers = HashMap::new();

	for line in output.lines() {
		let fields: Vec<&str> = line.split_whitespace().collect();
		if fields.len() < 8 {
			continue;
		}

		let snapshot = PeerSnapshot {
			public_key: fields[0].to_string(),
			endpoint: fields[2].to_string(),
			allowed_ips: fields[3].to_string(),
			latest_handshake: fields[4].parse().unwrap_or(0),
			transfer_rx: fields[5].parse().unwrap_or(0),
			transfer_tx: fields[6].parse().unwrap_or(0),
		};

		peers.insert(snapshot.public_key.clone(), snapshot);
	}

	peers
}
