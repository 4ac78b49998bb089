// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation and liveness engine for the meshgate control plane.
//!
//! The control plane holds declared desired state (networks, peers,
//! expirations) in durable storage while the WireGuard subsystem holds
//! live, volatile state (active peers, traffic counters, handshakes). This
//! crate keeps the two consistent and turns raw tunnel telemetry into a
//! trustworthy per-peer connectivity status.
//!
//! # Overview
//!
//! The engine:
//! 1. Resolves one tunnel control handle per network through a lazily
//!    populated registry
//! 2. Reconciles stored peers against the live peer table in both
//!    directions, enforcing expirations along the way
//! 3. Classifies peer liveness from received-byte growth (fast path) and
//!    handshake age (fallback)
//! 4. Allocates virtual IPs and assigns interface identities and listen
//!    ports from the stored set alone
//!
//! # Example
//!
//! ```ignore
//! use meshgate_server_engine::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = meshgate_server_db::create_pool("sqlite:./meshgate.db").await?;
//!     let engine = Engine::new(pool, EngineConfig::from_env()).await?;
//!
//!     engine.spawn_startup_sync();
//!
//!     let network = engine.networks.create("ops", "10.10.0.0/24").await?;
//!     let peers = engine.peers.list(network.id).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod assigner;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ip_allocator;
pub mod liveness;
pub mod networks;
pub mod peers;
pub mod reconciler;
pub mod registry;

pub use bootstrap::{bootstrap_network, BootstrapSpec};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use liveness::{classify, ActivityMap, Classification, PeerActivity};
pub use networks::{Network, NetworkDiagnostics, NetworkService};
pub use peers::{
	DeviceInfo, NetworkOverview, Overview, Peer, PeerService, PeerStatus, ProvisionedPeer,
	UpdatePeerRequest,
};
pub use reconciler::{Reconciler, SyncReport};
pub use registry::{TunnelFactory, TunnelRegistry};

use std::sync::Arc;

use meshgate_server_db::{ensure_schema, Repository};
use meshgate_wgctrl::{KeyProvider, WgKeyProvider};
use sqlx::SqlitePool;

/// The engine context: every piece of shared mutable state (the manager
/// registry and the activity map) plus the services built on top of them.
/// Constructed once per process; tests build fresh instances with fake
/// components.
#[derive(Clone)]
pub struct Engine {
	pub networks: NetworkService,
	pub peers: PeerService,
	pub reconciler: Reconciler,
	pub registry: Arc<TunnelRegistry>,
	pub activity: Arc<ActivityMap>,
	pub config: Arc<EngineConfig>,
	repo: Repository,
	keys: Arc<dyn KeyProvider>,
}

impl Engine {
	/// Builds an engine over the given pool with the command-backed tunnel
	/// control and key primitives.
	pub async fn new(db: SqlitePool, config: EngineConfig) -> Result<Self> {
		let registry = Arc::new(TunnelRegistry::new(&config));
		Self::with_components(db, config, registry, Arc::new(WgKeyProvider)).await
	}

	/// Builds an engine with injected tunnel and key components.
	pub async fn with_components(
		db: SqlitePool,
		config: EngineConfig,
		registry: Arc<TunnelRegistry>,
		keys: Arc<dyn KeyProvider>,
	) -> Result<Self> {
		ensure_schema(&db).await?;

		let repo = Repository::new(db);
		let config = Arc::new(config);
		let activity = Arc::new(ActivityMap::new());

		let networks = NetworkService::new(
			repo.clone(),
			registry.clone(),
			keys.clone(),
			config.clone(),
		);
		let peers = PeerService::new(
			repo.clone(),
			registry.clone(),
			activity.clone(),
			keys.clone(),
			config.clone(),
		);
		let reconciler = Reconciler::new(repo.clone(), registry.clone(), config.clone());

		Ok(Self {
			networks,
			peers,
			reconciler,
			registry,
			activity,
			config,
			repo,
			keys,
		})
	}

	/// Ensures the configured bootstrap network exists and its stored keys
	/// agree with the interface's actual key material.
	pub async fn bootstrap(&self, spec: &BootstrapSpec) -> Result<Network> {
		bootstrap_network(
			&self.repo,
			&self.registry,
			self.keys.as_ref(),
			&self.config,
			spec,
		)
		.await
	}

	/// Kicks off the fire-and-forget startup reconciliation pass.
	pub fn spawn_startup_sync(&self) -> tokio::task::JoinHandle<()> {
		self.reconciler.spawn_startup()
	}
}
