// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Startup-time bootstrap of a management network bound to a
//! pre-provisioned interface.
//!
//! The interface config file is the recovery source of truth for key
//! material: an installer may have provisioned the interface before this
//! process ever ran, and adopting its keys keeps already-connected peers
//! working. Generation is the last resort and is always logged.

use chrono::Utc;
use ipnet::Ipv4Net;
use meshgate_server_db::Repository;
use meshgate_wgctrl::{keys, KeyProvider};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::networks::Network;
use crate::registry::TunnelRegistry;

/// Desired shape of the bootstrap network.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
	pub name: String,
	pub cidr: String,
	pub iface: String,
	pub listen_port: u16,
}

/// Ensures the bootstrap network exists and agrees with the interface's
/// actual key material. Idempotent: safe to run on every startup.
#[instrument(skip_all, fields(iface = %spec.iface))]
pub async fn bootstrap_network(
	repo: &Repository,
	registry: &TunnelRegistry,
	key_provider: &dyn KeyProvider,
	config: &EngineConfig,
	spec: &BootstrapSpec,
) -> Result<Network> {
	let cidr: Ipv4Net = spec
		.cidr
		.parse()
		.map_err(|e| EngineError::InvalidCidr(format!("{}: {e}", spec.cidr)))?;

	let config_file = keys::config_path(&config.wg_config_dir, &spec.iface);

	if let Some(row) = repo.get_network_by_iface(&spec.iface).await? {
		let mut network = Network::try_from(row)?;

		// Detect drift between the stored keys and the interface's real
		// configured key; the stored record is repaired, never the file.
		match keys::load_private_key(&config_file).await {
			Ok(Some(private_key)) => {
				let actual_public = key_provider.derive_public_key(&private_key).await?;
				if actual_public != network.public_key {
					warn!(
						stored = %network.public_key,
						actual = %actual_public,
						"stored hub key does not match interface config, repairing record"
					);
					repo.update_network_keys(
						&network.id.to_string(),
						&private_key,
						&actual_public,
					)
					.await?;
					network.private_key = private_key;
					network.public_key = actual_public;
					network.updated_at = Utc::now();
				} else {
					debug!("hub keys in sync");
				}
			}
			Ok(None) => {
				debug!("no interface config present, stored keys left as-is");
			}
			Err(e) => {
				warn!(error = %e, "could not read interface config, stored keys left as-is");
			}
		}

		if network.cidr != cidr {
			warn!(
				stored = %network.cidr,
				configured = %cidr,
				"correcting stored address block from configuration"
			);
			repo.update_network_cidr(&network.id.to_string(), &cidr.to_string())
				.await?;
			network.cidr = cidr;
		}

		return Ok(network);
	}

	// First run: recover key material from the interface config if the
	// installer already provisioned it, otherwise generate.
	let (private_key, public_key) = match keys::load_private_key(&config_file).await {
		Ok(Some(private_key)) => {
			let public_key = key_provider.derive_public_key(&private_key).await?;
			info!("recovered hub keys from existing interface config");
			(private_key, public_key)
		}
		Ok(None) => {
			warn!("no existing key material found, generating fresh hub keys");
			key_provider.generate_keypair().await?
		}
		Err(e) => {
			warn!(error = %e, "could not read interface config, generating fresh hub keys");
			key_provider.generate_keypair().await?
		}
	};

	let id = Uuid::new_v4();
	let endpoint = format!("{}:{}", config.endpoint_host, spec.listen_port);
	repo.insert_network(
		&id.to_string(),
		&spec.name,
		&cidr.to_string(),
		&spec.iface,
		spec.listen_port,
		&private_key,
		&public_key,
		&endpoint,
	)
	.await?;

	let now = Utc::now();
	let network = Network {
		id,
		name: spec.name.clone(),
		cidr,
		iface: spec.iface.clone(),
		listen_port: spec.listen_port,
		private_key,
		public_key,
		endpoint,
		created_at: now,
		updated_at: now,
	};
	info!(name = %network.name, "bootstrap network created");

	if let Some(manager) = registry.get(&network).await {
		if let Err(e) = manager.up().await {
			warn!(error = %e, "failed to bring bootstrap interface up");
		}
	}

	Ok(network)
}

#[cfg(test)]
mod tests {
	use super::*;
	use meshgate_server_db::testing::create_control_plane_test_pool;
	use meshgate_wgctrl::testing::{FakeKeyProvider, FakeTunnel};
	use meshgate_wgctrl::TunnelControl;
	use std::sync::Arc;
	use tempfile::TempDir;

	struct Fixture {
		repo: Repository,
		registry: TunnelRegistry,
		keys: FakeKeyProvider,
		config: EngineConfig,
		_dir: TempDir,
	}

	async fn fixture() -> Fixture {
		let pool = create_control_plane_test_pool().await;
		let dir = TempDir::new().unwrap();
		let config = EngineConfig {
			wg_config_dir: dir.path().to_path_buf(),
			..EngineConfig::default()
		};
		let registry = TunnelRegistry::with_factory(Box::new(|iface| {
			Arc::new(FakeTunnel::new(iface)) as Arc<dyn TunnelControl>
		}));

		Fixture {
			repo: Repository::new(pool),
			registry,
			keys: FakeKeyProvider::new(),
			config,
			_dir: dir,
		}
	}

	fn spec() -> BootstrapSpec {
		BootstrapSpec {
			name: "Management".to_string(),
			cidr: "10.0.0.0/24".to_string(),
			iface: "wg0".to_string(),
			listen_port: 51820,
		}
	}

	#[tokio::test]
	async fn test_bootstrap_recovers_keys_from_config_file() {
		let f = fixture().await;
		let path = keys::config_path(&f.config.wg_config_dir, "wg0");
		keys::write_minimal_config(&path, "installer-key=")
			.await
			.unwrap();

		let network = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &spec())
			.await
			.unwrap();

		assert_eq!(network.private_key, "installer-key=");
		assert_eq!(network.public_key, "pub-of-installer-key=");
	}

	#[tokio::test]
	async fn test_bootstrap_generates_when_no_config() {
		let f = fixture().await;

		let network = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &spec())
			.await
			.unwrap();

		assert!(!network.private_key.is_empty());
		assert_eq!(
			network.public_key,
			format!("pub-of-{}", network.private_key)
		);
	}

	#[tokio::test]
	async fn test_bootstrap_is_idempotent() {
		let f = fixture().await;

		let first = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &spec())
			.await
			.unwrap();
		let second = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &spec())
			.await
			.unwrap();

		assert_eq!(first.id, second.id);
		assert_eq!(f.repo.list_networks().await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_bootstrap_repairs_key_drift() {
		let f = fixture().await;

		let original = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &spec())
			.await
			.unwrap();

		// An operator re-keys the interface out-of-band.
		let path = keys::config_path(&f.config.wg_config_dir, "wg0");
		keys::write_minimal_config(&path, "rotated-key=")
			.await
			.unwrap();

		let repaired = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &spec())
			.await
			.unwrap();

		assert_eq!(repaired.id, original.id);
		assert_eq!(repaired.private_key, "rotated-key=");
		assert_eq!(repaired.public_key, "pub-of-rotated-key=");

		let row = f
			.repo
			.get_network(&original.id.to_string())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(row.5, "rotated-key=");
		assert_eq!(row.6, "pub-of-rotated-key=");
	}

	#[tokio::test]
	async fn test_bootstrap_corrects_cidr_mismatch() {
		let f = fixture().await;

		let original = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &spec())
			.await
			.unwrap();

		let mut changed = spec();
		changed.cidr = "10.99.0.0/24".to_string();
		let corrected = bootstrap_network(&f.repo, &f.registry, &f.keys, &f.config, &changed)
			.await
			.unwrap();

		assert_eq!(corrected.id, original.id);
		assert_eq!(corrected.cidr.to_string(), "10.99.0.0/24");

		let row = f
			.repo
			.get_network(&original.id.to_string())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(row.2, "10.99.0.0/24");
	}
}
