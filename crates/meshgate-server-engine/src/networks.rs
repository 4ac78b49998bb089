// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use meshgate_server_db::{NetworkRowTuple, Repository};
use meshgate_wgctrl::{keys, KeyProvider, PeerSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::assigner::{assign, cidrs_overlap};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::registry::TunnelRegistry;

/// A VPN network: one hub interface and its declared address block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
	pub id: Uuid,
	pub name: String,
	pub cidr: Ipv4Net,
	pub iface: String,
	pub listen_port: u16,
	/// Hub private key. Never serialized outward.
	#[serde(skip_serializing, default)]
	pub private_key: String,
	pub public_key: String,
	/// Hub endpoint advertised to peers (`host:port`).
	pub endpoint: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<NetworkRowTuple> for Network {
	type Error = EngineError;

	fn try_from(row: NetworkRowTuple) -> Result<Self> {
		let (id, name, cidr, iface, listen_port, private_key, public_key, endpoint, created, updated) =
			row;

		Ok(Network {
			id: id
				.parse()
				.map_err(|_| EngineError::Internal("invalid network id".to_string()))?,
			name,
			cidr: cidr
				.parse()
				.map_err(|_| EngineError::InvalidCidr(cidr.clone()))?,
			iface,
			listen_port: listen_port as u16,
			private_key,
			public_key,
			endpoint,
			created_at: parse_datetime(&created)?,
			updated_at: parse_datetime(&updated)?,
		})
	}
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(s)
		.map(|dt| dt.with_timezone(&Utc))
		.or_else(|_| {
			chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
				.map(|ndt| ndt.and_utc())
				.map_err(|_| EngineError::Internal(format!("invalid datetime: {s}")))
		})
}

/// Live-vs-stored comparison snapshot for one network.
#[derive(Debug, Serialize)]
pub struct NetworkDiagnostics {
	pub network_id: Uuid,
	pub name: String,
	pub iface: String,
	pub public_key: String,
	pub endpoint: String,
	pub manager_registered: bool,
	pub live_peers: Vec<PeerSnapshot>,
	pub live_error: Option<String>,
	pub stored_peer_count: usize,
}

#[derive(Clone)]
pub struct NetworkService {
	repo: Repository,
	registry: Arc<TunnelRegistry>,
	keys: Arc<dyn KeyProvider>,
	config: Arc<EngineConfig>,
}

impl NetworkService {
	pub fn new(
		repo: Repository,
		registry: Arc<TunnelRegistry>,
		keys: Arc<dyn KeyProvider>,
		config: Arc<EngineConfig>,
	) -> Self {
		Self {
			repo,
			registry,
			keys,
			config,
		}
	}

	/// Creates a network: validates the block against every existing one,
	/// assigns a fresh interface identity and listen port, generates the hub
	/// key pair, and persists the record before touching the live subsystem.
	#[instrument(skip(self), fields(%name, %cidr))]
	pub async fn create(&self, name: &str, cidr: &str) -> Result<Network> {
		let cidr: Ipv4Net = cidr
			.parse()
			.map_err(|e| EngineError::InvalidCidr(format!("{cidr}: {e}")))?;

		let existing = self.list().await?;
		for network in &existing {
			if cidrs_overlap(&cidr, &network.cidr) {
				return Err(EngineError::OverlapConflict {
					candidate: cidr.to_string(),
					name: network.name.clone(),
					cidr: network.cidr.to_string(),
				});
			}
		}

		let (iface, listen_port) = assign(&existing, self.config.base_port);
		let (private_key, public_key) = self.keys.generate_keypair().await?;
		let endpoint = format!("{}:{}", self.config.endpoint_host, listen_port);

		let id = Uuid::new_v4();
		self.repo
			.insert_network(
				&id.to_string(),
				name,
				&cidr.to_string(),
				&iface,
				listen_port,
				&private_key,
				&public_key,
				&endpoint,
			)
			.await?;

		let now = Utc::now();
		let network = Network {
			id,
			name: name.to_string(),
			cidr,
			iface,
			listen_port,
			private_key,
			public_key,
			endpoint,
			created_at: now,
			updated_at: now,
		};

		// Interface provisioning is host-side; a failure here is not fatal
		// to the stored record.
		if let Some(manager) = self.registry.get(&network).await {
			if let Err(e) = manager.up().await {
				warn!(error = %e, iface = %network.iface, "failed to bring interface up");
			}
		}

		Ok(network)
	}

	#[instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: Uuid) -> Result<Option<Network>> {
		let row = self.repo.get_network(&id.to_string()).await?;
		row.map(Network::try_from).transpose()
	}

	#[instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<Network>> {
		let rows = self.repo.list_networks().await?;
		rows.into_iter().map(Network::try_from).collect()
	}

	/// Tears the interface down, unregisters the manager handle, removes the
	/// interface config file (best effort) and deletes the record.
	#[instrument(skip(self), fields(%id))]
	pub async fn delete(&self, id: Uuid) -> Result<()> {
		let network = self.get(id).await?.ok_or(EngineError::NetworkNotFound)?;

		if let Some(manager) = self.registry.get(&network).await {
			if let Err(e) = manager.down().await {
				warn!(error = %e, iface = %network.iface, "interface teardown reported error");
			}
		}

		let path = keys::config_path(&self.config.wg_config_dir, &network.iface);
		if let Err(e) = tokio::fs::remove_file(&path).await {
			debug!(error = %e, path = %path.display(), "interface config not removed");
		}

		self.registry.remove(id).await;

		let affected = self.repo.delete_network(&id.to_string()).await?;
		if affected == 0 {
			return Err(EngineError::NetworkNotFound);
		}

		debug!(name = %network.name, iface = %network.iface, "network deleted");
		Ok(())
	}

	/// Detects drift between the stored hub key pair and the key actually
	/// configured on the interface, repairing the stored record from the
	/// interface config file when they disagree.
	///
	/// The config file is the recovery source of truth; a missing file
	/// leaves the record untouched.
	#[instrument(skip(self), fields(%id))]
	pub async fn resync_keys(&self, id: Uuid) -> Result<Network> {
		let network = self.get(id).await?.ok_or(EngineError::NetworkNotFound)?;

		let path = keys::config_path(&self.config.wg_config_dir, &network.iface);
		let Some(private_key) = keys::load_private_key(&path).await? else {
			warn!(iface = %network.iface, "no interface config found, stored keys left as-is");
			return Ok(network);
		};

		let actual_public = self.keys.derive_public_key(&private_key).await?;
		if actual_public == network.public_key {
			debug!(iface = %network.iface, "hub keys in sync");
			return Ok(network);
		}

		warn!(
			iface = %network.iface,
			stored = %network.public_key,
			actual = %actual_public,
			"hub key drift detected, repairing stored record"
		);
		self.repo
			.update_network_keys(&id.to_string(), &private_key, &actual_public)
			.await?;

		Ok(Network {
			private_key,
			public_key: actual_public,
			updated_at: Utc::now(),
			..network
		})
	}

	/// Compares the stored view of a network against the live peer table.
	#[instrument(skip(self), fields(%id))]
	pub async fn diagnostics(&self, id: Uuid) -> Result<NetworkDiagnostics> {
		let network = self.get(id).await?.ok_or(EngineError::NetworkNotFound)?;

		let manager = self.registry.peek(network.id).await;
		let manager_registered = manager.is_some();

		let (live_peers, live_error) = match manager {
			Some(manager) => match manager.list_peers().await {
				Ok(peers) => (peers.into_values().collect(), None),
				Err(e) => (Vec::new(), Some(e.to_string())),
			},
			None => (Vec::new(), None),
		};

		let stored_peer_count = self.repo.list_peers(&id.to_string()).await?.len();

		Ok(NetworkDiagnostics {
			network_id: network.id,
			name: network.name,
			iface: network.iface,
			public_key: network.public_key,
			endpoint: network.endpoint,
			manager_registered,
			live_peers,
			live_error,
			stored_peer_count,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_network_row_conversion() {
		let row: NetworkRowTuple = (
			"3e0b54a6-76a1-4a52-b167-3b3a524e4e97".to_string(),
			"ops".to_string(),
			"10.10.0.0/24".to_string(),
			"wg0".to_string(),
			51820,
			"priv".to_string(),
			"pub".to_string(),
			"vpn.example.com:51820".to_string(),
			"2025-06-01 12:00:00".to_string(),
			"2025-06-01T12:30:00Z".to_string(),
		);

		let network = Network::try_from(row).unwrap();
		assert_eq!(network.iface, "wg0");
		assert_eq!(network.listen_port, 51820);
		assert_eq!(network.cidr.to_string(), "10.10.0.0/24");
		assert!(network.created_at < network.updated_at);
	}

	#[test]
	fn test_network_row_rejects_bad_cidr() {
		let row: NetworkRowTuple = (
			"3e0b54a6-76a1-4a52-b167-3b3a524e4e97".to_string(),
			"ops".to_string(),
			"not-a-cidr".to_string(),
			"wg0".to_string(),
			51820,
			String::new(),
			String::new(),
			String::new(),
			"2025-06-01 12:00:00".to_string(),
			"2025-06-01 12:00:00".to_string(),
		);

		assert!(matches!(
			Network::try_from(row),
			Err(EngineError::InvalidCidr(_))
		));
	}

	#[test]
	fn test_private_key_never_serialized() {
		let network = Network {
			id: Uuid::new_v4(),
			name: "ops".to_string(),
			cidr: "10.10.0.0/24".parse().unwrap(),
			iface: "wg0".to_string(),
			listen_port: 51820,
			private_key: "top-secret=".to_string(),
			public_key: "pub=".to_string(),
			endpoint: "vpn.example.com:51820".to_string(),
			created_at: Utc::now(),
			updated_at: Utc::now(),
		};

		let json = serde_json::to_string(&network).unwrap();
		assert!(!json.contains("top-secret"));
		assert!(json.contains("pub="));
	}
}
