// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use meshgate_wgctrl::{CommandTunnel, TunnelControl};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::networks::Network;

/// Builds a tunnel control handle for an interface identity.
pub type TunnelFactory = Box<dyn Fn(&str) -> Arc<dyn TunnelControl> + Send + Sync>;

/// Thread-safe, lazily-populated map from network identity to its tunnel
/// control handle. Single entry point used by all higher layers.
///
/// At most one handle exists per network identity at any time: first-time
/// creation re-checks under the write lock before installing. The factory
/// only constructs the handle (no external process runs), so holding the
/// write lock across construction is safe.
pub struct TunnelRegistry {
	factory: TunnelFactory,
	managers: RwLock<HashMap<Uuid, Arc<dyn TunnelControl>>>,
}

impl TunnelRegistry {
	pub fn new(config: &EngineConfig) -> Self {
		let config_dir = config.wg_config_dir.clone();
		Self::with_factory(Box::new(move |iface| {
			Arc::new(CommandTunnel::with_config_dir(iface, config_dir.clone()))
		}))
	}

	pub fn with_factory(factory: TunnelFactory) -> Self {
		Self {
			factory,
			managers: RwLock::new(HashMap::new()),
		}
	}

	/// Resolves the handle for a network, creating it on first access.
	///
	/// Returns `None` for networks without an interface identity.
	#[instrument(skip_all, fields(network_id = %network.id, iface = %network.iface))]
	pub async fn get(&self, network: &Network) -> Option<Arc<dyn TunnelControl>> {
		{
			let managers = self.managers.read().await;
			if let Some(manager) = managers.get(&network.id) {
				return Some(manager.clone());
			}
		}

		if network.iface.is_empty() {
			return None;
		}

		let mut managers = self.managers.write().await;
		// Another caller may have won the race between the read and write
		// lock acquisitions.
		if let Some(existing) = managers.get(&network.id) {
			return Some(existing.clone());
		}

		let manager = (self.factory)(&network.iface);
		managers.insert(network.id, manager.clone());
		debug!("tunnel manager registered");
		Some(manager)
	}

	/// Returns the handle for a network only if one is already registered.
	pub async fn peek(&self, network_id: Uuid) -> Option<Arc<dyn TunnelControl>> {
		self.managers.read().await.get(&network_id).cloned()
	}

	/// Removes the handle for a deleted network. Interface teardown is the
	/// caller's job before this.
	#[instrument(skip(self), fields(%network_id))]
	pub async fn remove(&self, network_id: Uuid) {
		self.managers.write().await.remove(&network_id);
	}
}
