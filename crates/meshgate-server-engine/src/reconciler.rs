// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bidirectional sync between the desired-state store and the live peer
//! table.
//!
//! Import direction: live peers unknown to the store become stored records.
//! Push direction: stored, non-expired peers missing from the live table
//! are added to it. Expirations are enforced on the way through. A pass
//! never deletes a stored record, and one bad entry never fails the pass.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use meshgate_server_db::Repository;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::networks::Network;
use crate::peers::{Peer, PeerStatus};
use crate::registry::TunnelRegistry;

/// Outcome counters for one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
	/// Live peers imported into the store.
	pub imported: usize,
	/// Stored peers pushed to the live table.
	pub pushed: usize,
	/// Entries already in agreement or not actionable.
	pub skipped: usize,
	/// Soft failures; a later pass retries them.
	pub failed: usize,
}

impl SyncReport {
	fn absorb(&mut self, other: SyncReport) {
		self.imported += other.imported;
		self.pushed += other.pushed;
		self.skipped += other.skipped;
		self.failed += other.failed;
	}
}

#[derive(Clone)]
pub struct Reconciler {
	repo: Repository,
	registry: Arc<TunnelRegistry>,
	config: Arc<EngineConfig>,
}

impl Reconciler {
	pub fn new(repo: Repository, registry: Arc<TunnelRegistry>, config: Arc<EngineConfig>) -> Self {
		Self {
			repo,
			registry,
			config,
		}
	}

	/// Fire-and-forget startup pass, after a settling delay for the storage
	/// layer.
	pub fn spawn_startup(&self) -> tokio::task::JoinHandle<()> {
		let reconciler = self.clone();
		tokio::spawn(async move {
			tokio::time::sleep(reconciler.config.startup_settle).await;
			match reconciler.run_all().await {
				Ok(report) => info!(?report, "startup reconciliation finished"),
				Err(e) => warn!(error = %e, "startup reconciliation failed"),
			}
		})
	}

	/// Reconciles every network. Each per-network pass is independent; a
	/// failing network is logged and the rest proceed.
	#[instrument(skip(self))]
	pub async fn run_all(&self) -> Result<SyncReport> {
		let rows = self.repo.list_networks().await?;

		let mut total = SyncReport::default();
		for row in rows {
			let network = match Network::try_from(row) {
				Ok(network) => network,
				Err(e) => {
					warn!(error = %e, "skipping undecodable network record");
					continue;
				}
			};

			match self.sync_network(&network).await {
				Ok(report) => {
					debug!(network = %network.name, ?report, "network reconciled");
					total.absorb(report);
				}
				Err(e) => {
					warn!(error = %e, network = %network.name, "network sync failed");
				}
			}
		}

		Ok(total)
	}

	/// One full import/push/expiration pass for a single network.
	#[instrument(skip(self, network), fields(network = %network.name, iface = %network.iface))]
	pub async fn sync_network(&self, network: &Network) -> Result<SyncReport> {
		let manager = self
			.registry
			.get(network)
			.await
			.ok_or_else(|| EngineError::ManagerUnavailable(network.iface.clone()))?;

		if let Err(e) = manager.up().await {
			warn!(error = %e, "interface not up, continuing with peer sync");
		}

		let live = manager.list_peers().await?;

		let rows = self.repo.list_peers(&network.id.to_string()).await?;
		let stored: Vec<Peer> = rows
			.into_iter()
			.filter_map(|row| match Peer::try_from(row) {
				Ok(peer) => Some(peer),
				Err(e) => {
					warn!(error = %e, "skipping undecodable peer record");
					None
				}
			})
			.collect();
		let known_keys: HashSet<&str> = stored.iter().map(|p| p.public_key.as_str()).collect();

		let mut report = SyncReport::default();
		let now = Utc::now();

		// Import direction: live peers the store has never heard of.
		for (public_key, snapshot) in &live {
			if known_keys.contains(public_key.as_str()) {
				continue;
			}

			let Some(virtual_ip) = first_allowed_ip(&snapshot.allowed_ips) else {
				warn!(
					%public_key,
					allowed_ips = %snapshot.allowed_ips,
					"no parsable allowed address, skipping import"
				);
				report.skipped += 1;
				continue;
			};

			let name = format!("imported-{virtual_ip}");
			let result = self
				.repo
				.insert_peer(
					&Uuid::new_v4().to_string(),
					&network.id.to_string(),
					&name,
					&virtual_ip.to_string(),
					public_key,
					"{}",
					PeerStatus::Online.as_str(),
					None,
					None,
				)
				.await;

			match result {
				Ok(()) => {
					info!(%public_key, %virtual_ip, "imported live peer");
					report.imported += 1;
				}
				Err(e) => {
					warn!(error = %e, %public_key, "failed to import live peer");
					report.failed += 1;
				}
			}
		}

		// Push direction plus expiration enforcement over stored peers.
		for peer in &stored {
			if peer.is_expired(now) {
				if peer.status != PeerStatus::Expired {
					let last_seen = peer.last_seen.map(|t| t.to_rfc3339());
					if let Err(e) = self
						.repo
						.update_peer_runtime(
							&peer.id.to_string(),
							PeerStatus::Expired.as_str(),
							last_seen.as_deref(),
							peer.transfer_rx,
							peer.transfer_tx,
						)
						.await
					{
						warn!(error = %e, peer = %peer.name, "failed to mark peer expired");
						report.failed += 1;
					}
				}

				if live.contains_key(&peer.public_key) {
					debug!(peer = %peer.name, "enforcing expiration, removing live peer");
					if let Err(e) = manager.remove_peer(&peer.public_key).await {
						warn!(error = %e, peer = %peer.name, "failed to remove expired peer");
						report.failed += 1;
					}
				}
				continue;
			}

			if peer.public_key.is_empty() || live.contains_key(&peer.public_key) {
				report.skipped += 1;
				continue;
			}

			let allowed = format!("{}/32", peer.virtual_ip);
			match manager.add_peer(&peer.public_key, &[allowed]).await {
				Ok(()) => {
					debug!(peer = %peer.name, "pushed peer to live table");
					report.pushed += 1;
				}
				Err(e) => {
					warn!(error = %e, peer = %peer.name, "failed to push peer, will retry on next sync");
					report.failed += 1;
				}
			}
		}

		Ok(report)
	}
}

/// First address of a comma-separated allowed-IP list, prefix stripped.
fn first_allowed_ip(allowed_ips: &str) -> Option<Ipv4Addr> {
	let first = allowed_ips.split(',').next()?.trim();
	if first.is_empty() {
		return None;
	}
	let ip = first.split('/').next().unwrap_or(first);
	ip.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peers::PeerStatus;
	use meshgate_server_db::testing::create_control_plane_test_pool;
	use meshgate_wgctrl::testing::{FakeCall, FakeTunnel};
	use meshgate_wgctrl::{PeerSnapshot, TunnelControl};

	async fn setup() -> (Reconciler, Repository, Arc<FakeTunnel>, Network) {
		let pool = create_control_plane_test_pool().await;
		let repo = Repository::new(pool);

		repo.insert_network(
			&Uuid::new_v4().to_string(),
			"ops",
			"10.10.0.0/24",
			"wg0",
			51820,
			"priv",
			"pub",
			"vpn.example.com:51820",
		)
		.await
		.unwrap();
		let network = Network::try_from(repo.list_networks().await.unwrap().remove(0)).unwrap();

		let tunnel = Arc::new(FakeTunnel::new("wg0"));
		let factory_tunnel = tunnel.clone();
		let registry = Arc::new(TunnelRegistry::with_factory(Box::new(move |_| {
			factory_tunnel.clone() as Arc<dyn TunnelControl>
		})));
		let config = Arc::new(EngineConfig::default());

		let reconciler = Reconciler::new(repo.clone(), registry, config);
		(reconciler, repo, tunnel, network)
	}

	fn snapshot(public_key: &str, allowed_ips: &str) -> PeerSnapshot {
		PeerSnapshot {
			public_key: public_key.to_string(),
			endpoint: "(none)".to_string(),
			allowed_ips: allowed_ips.to_string(),
			..PeerSnapshot::default()
		}
	}

	async fn insert_stored_peer(repo: &Repository, network: &Network, key: &str, ip: &str) -> Uuid {
		let id = Uuid::new_v4();
		repo.insert_peer(
			&id.to_string(),
			&network.id.to_string(),
			"client",
			ip,
			key,
			"{}",
			PeerStatus::Pending.as_str(),
			None,
			None,
		)
		.await
		.unwrap();
		id
	}

	#[tokio::test]
	async fn test_import_unknown_live_peer() {
		let (reconciler, repo, tunnel, network) = setup().await;
		tunnel.insert_snapshot(snapshot("stray-key=", "10.10.0.7/32"));

		let report = reconciler.sync_network(&network).await.unwrap();
		assert_eq!(report.imported, 1);

		let peers = repo.list_peers(&network.id.to_string()).await.unwrap();
		assert_eq!(peers.len(), 1);
		let peer = Peer::try_from(peers.into_iter().next().unwrap()).unwrap();
		assert_eq!(peer.virtual_ip, Ipv4Addr::new(10, 10, 0, 7));
		assert_eq!(peer.status, PeerStatus::Online);
		assert_eq!(peer.public_key, "stray-key=");
		assert_eq!(peer.name, "imported-10.10.0.7");
	}

	#[tokio::test]
	async fn test_import_skips_unparsable_allowed_list() {
		let (reconciler, repo, tunnel, network) = setup().await;
		tunnel.insert_snapshot(snapshot("bad-key=", ""));
		tunnel.insert_snapshot(snapshot("good-key=", "10.10.0.8/32"));

		let report = reconciler.sync_network(&network).await.unwrap();
		assert_eq!(report.imported, 1);
		assert_eq!(report.skipped, 1);

		let peers = repo.list_peers(&network.id.to_string()).await.unwrap();
		assert_eq!(peers.len(), 1);
	}

	#[tokio::test]
	async fn test_push_is_idempotent() {
		let (reconciler, repo, tunnel, network) = setup().await;
		insert_stored_peer(&repo, &network, "peer-key=", "10.10.0.9").await;

		let report = reconciler.sync_network(&network).await.unwrap();
		assert_eq!(report.pushed, 1);
		assert_eq!(
			tunnel.add_peer_calls(),
			vec![FakeCall::AddPeer {
				public_key: "peer-key=".to_string(),
				allowed_ips: vec!["10.10.0.9/32".to_string()],
			}]
		);

		// Second pass with no state change: zero further invocations.
		let report = reconciler.sync_network(&network).await.unwrap();
		assert_eq!(report.pushed, 0);
		assert_eq!(report.skipped, 1);
		assert_eq!(tunnel.add_peer_calls().len(), 1);
	}

	#[tokio::test]
	async fn test_expired_peer_removed_from_live_table() {
		let (reconciler, repo, tunnel, network) = setup().await;
		let id = Uuid::new_v4();
		let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
		repo.insert_peer(
			&id.to_string(),
			&network.id.to_string(),
			"stale",
			"10.10.0.5",
			"stale-key=",
			"{}",
			PeerStatus::Online.as_str(),
			Some(&past),
			None,
		)
		.await
		.unwrap();
		tunnel.insert_snapshot(snapshot("stale-key=", "10.10.0.5/32"));

		reconciler.sync_network(&network).await.unwrap();

		assert!(!tunnel.contains_peer("stale-key="));
		let row = repo.get_peer(&id.to_string()).await.unwrap().unwrap();
		assert_eq!(row.6, "expired");
		// Never re-pushed on a later pass.
		let report = reconciler.sync_network(&network).await.unwrap();
		assert_eq!(report.pushed, 0);
	}

	#[tokio::test]
	async fn test_push_failure_is_soft() {
		let (reconciler, repo, tunnel, network) = setup().await;
		insert_stored_peer(&repo, &network, "key-a=", "10.10.0.4").await;
		insert_stored_peer(&repo, &network, "key-b=", "10.10.0.5").await;
		tunnel.set_fail_add_peer(true);

		let report = reconciler.sync_network(&network).await.unwrap();
		assert_eq!(report.failed, 2);
		assert_eq!(report.pushed, 0);
		// Both peers were attempted; the first failure did not abort.
		assert_eq!(tunnel.add_peer_calls().len(), 2);

		// The stored records remain for the next pass.
		tunnel.set_fail_add_peer(false);
		let report = reconciler.sync_network(&network).await.unwrap();
		assert_eq!(report.pushed, 2);
	}

	#[tokio::test]
	async fn test_list_failure_propagates() {
		let (reconciler, _repo, tunnel, network) = setup().await;
		tunnel.set_fail_list_peers(true);

		let err = reconciler.sync_network(&network).await.unwrap_err();
		assert!(matches!(err, EngineError::Control(_)));
	}

	#[tokio::test]
	async fn test_run_all_continues_past_failing_network() {
		let pool = create_control_plane_test_pool().await;
		let repo = Repository::new(pool);

		for (name, cidr, iface, port) in [
			("ops", "10.10.0.0/24", "wg0", 51820u16),
			("edge", "10.20.0.0/24", "wg1", 51821),
		] {
			repo.insert_network(
				&Uuid::new_v4().to_string(),
				name,
				cidr,
				iface,
				port,
				"priv",
				"pub",
				"vpn.example.com:51820",
			)
			.await
			.unwrap();
		}

		let broken = Arc::new(FakeTunnel::new("wg0"));
		broken.set_fail_list_peers(true);
		let healthy = Arc::new(FakeTunnel::new("wg1"));
		healthy.insert_snapshot(snapshot("edge-key=", "10.20.0.7/32"));

		let (broken_f, healthy_f) = (broken.clone(), healthy.clone());
		let registry = Arc::new(TunnelRegistry::with_factory(Box::new(move |iface| {
			if iface == "wg0" {
				broken_f.clone() as Arc<dyn TunnelControl>
			} else {
				healthy_f.clone() as Arc<dyn TunnelControl>
			}
		})));
		let reconciler = Reconciler::new(repo, registry, Arc::new(EngineConfig::default()));

		// The broken network is logged and skipped; the healthy one still
		// imports its stray peer.
		let report = reconciler.run_all().await.unwrap();
		assert_eq!(report.imported, 1);
	}

	#[test]
	fn test_first_allowed_ip() {
		assert_eq!(
			first_allowed_ip("10.10.0.7/32"),
			Some(Ipv4Addr::new(10, 10, 0, 7))
		);
		assert_eq!(
			first_allowed_ip("10.10.0.7/32, 192.168.0.0/24"),
			Some(Ipv4Addr::new(10, 10, 0, 7))
		);
		assert_eq!(
			first_allowed_ip("10.10.0.7"),
			Some(Ipv4Addr::new(10, 10, 0, 7))
		);
		assert_eq!(first_allowed_ip(""), None);
		assert_eq!(first_allowed_ip("garbage"), None);
	}
}
