// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use meshgate_server_db::{PeerRowTuple, Repository};
use meshgate_wgctrl::{KeyProvider, PeerSnapshot, TunnelControl};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ip_allocator::allocate;
use crate::liveness::{classify, ActivityMap};
use crate::networks::Network;
use crate::registry::TunnelRegistry;

/// Declared connectivity status of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
	Pending,
	Online,
	Offline,
	Expired,
}

impl PeerStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			PeerStatus::Pending => "pending",
			PeerStatus::Online => "online",
			PeerStatus::Offline => "offline",
			PeerStatus::Expired => "expired",
		}
	}
}

impl std::str::FromStr for PeerStatus {
	type Err = EngineError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"pending" => Ok(PeerStatus::Pending),
			"online" => Ok(PeerStatus::Online),
			"offline" => Ok(PeerStatus::Offline),
			"expired" => Ok(PeerStatus::Expired),
			other => Err(EngineError::Internal(format!(
				"unknown peer status: {other}"
			))),
		}
	}
}

impl std::fmt::Display for PeerStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Metadata about the peer's device, reported at check-in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
	#[serde(default)]
	pub os: String,
	#[serde(default)]
	pub arch: String,
	#[serde(default)]
	pub hostname: String,
}

/// A spoke in a VPN network, as declared in the desired-state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
	pub id: Uuid,
	pub network_id: Uuid,
	pub name: String,
	pub virtual_ip: Ipv4Addr,
	pub public_key: String,
	#[serde(default)]
	pub labels: HashMap<String, String>,
	pub status: PeerStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_seen: Option<DateTime<Utc>>,
	pub transfer_rx: i64,
	pub transfer_tx: i64,
	/// Remote endpoint host, observed live; never persisted.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub public_ip: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub device: Option<DeviceInfo>,
	pub created_at: DateTime<Utc>,
}

impl Peer {
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.is_some_and(|t| t <= now)
	}
}

impl TryFrom<PeerRowTuple> for Peer {
	type Error = EngineError;

	fn try_from(row: PeerRowTuple) -> Result<Self> {
		let (
			id,
			network_id,
			name,
			virtual_ip,
			public_key,
			labels,
			status,
			expires_at,
			last_seen,
			transfer_rx,
			transfer_tx,
			device,
			created_at,
		) = row;

		Ok(Peer {
			id: id
				.parse()
				.map_err(|_| EngineError::Internal("invalid peer id".to_string()))?,
			network_id: network_id
				.parse()
				.map_err(|_| EngineError::Internal("invalid network id".to_string()))?,
			name,
			virtual_ip: virtual_ip
				.parse()
				.map_err(|_| EngineError::Internal(format!("invalid virtual IP: {virtual_ip}")))?,
			public_key,
			labels: serde_json::from_str(&labels)
				.map_err(|e| EngineError::Internal(format!("invalid labels: {e}")))?,
			status: status.parse()?,
			expires_at: expires_at.as_deref().map(parse_datetime).transpose()?,
			last_seen: last_seen.as_deref().map(parse_datetime).transpose()?,
			transfer_rx,
			transfer_tx,
			public_ip: None,
			device: device
				.as_deref()
				.map(serde_json::from_str)
				.transpose()
				.map_err(|e| EngineError::Internal(format!("invalid device metadata: {e}")))?,
			created_at: parse_datetime(&created_at)?,
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

/// Extracts the host part of a live endpoint, dropping the port.
/// `(none)` and empty endpoints yield `None`.
fn remote_host(endpoint: &str) -> Option<String> {
	if endpoint.is_empty() || endpoint == "(none)" {
		return None;
	}
	match endpoint.rsplit_once(':') {
		Some((host, _)) => Some(host.to_string()),
		None => Some(endpoint.to_string()),
	}
}

/// Copies device metadata out of well-known labels when the peer has not
/// reported any itself.
fn fill_device_from_labels(peer: &mut Peer) {
	let needs_fill = peer.device.as_ref().map_or(true, |d| d.os.is_empty());
	if !needs_fill {
		return;
	}

	let device = peer.device.get_or_insert_with(DeviceInfo::default);
	if let Some(os) = peer.labels.get("os") {
		device.os = os.clone();
	}
	if let Some(arch) = peer.labels.get("arch") {
		device.arch = arch.clone();
	}
	if let Some(hostname) = peer.labels.get("hostname") {
		device.hostname = hostname.clone();
	}
}

/// A freshly provisioned peer together with its private key.
///
/// The private key is handed out exactly once and never stored.
#[derive(Debug, Serialize)]
pub struct ProvisionedPeer {
	pub peer: Peer,
	pub private_key: String,
}

/// Owner edits to a peer. `expires_at` is tri-state: absent leaves the
/// expiration untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct UpdatePeerRequest {
	pub name: Option<String>,
	pub expires_at: Option<Option<DateTime<Utc>>>,
	pub status: Option<PeerStatus>,
	pub device: Option<DeviceInfo>,
}

/// Per-network aggregate for the overview surface.
#[derive(Debug, Serialize)]
pub struct NetworkOverview {
	pub network_id: Uuid,
	pub name: String,
	pub cidr: String,
	pub iface: String,
	pub total_peers: usize,
	pub online: usize,
	pub offline: usize,
	pub pending: usize,
	pub expired: usize,
	pub transfer_rx: i64,
	pub transfer_tx: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct Overview {
	pub total_networks: usize,
	pub total_peers: usize,
	pub online: usize,
	pub offline: usize,
	pub pending: usize,
	pub expired: usize,
	pub transfer_rx: i64,
	pub transfer_tx: i64,
	pub networks: Vec<NetworkOverview>,
}

#[derive(Clone)]
pub struct PeerService {
	repo: Repository,
	registry: Arc<TunnelRegistry>,
	activity: Arc<ActivityMap>,
	keys: Arc<dyn KeyProvider>,
	config: Arc<EngineConfig>,
}

impl PeerService {
	pub fn new(
		repo: Repository,
		registry: Arc<TunnelRegistry>,
		activity: Arc<ActivityMap>,
		keys: Arc<dyn KeyProvider>,
		config: Arc<EngineConfig>,
	) -> Self {
		Self {
			repo,
			registry,
			activity,
			keys,
			config,
		}
	}

	/// Provisions a new peer: generates its key pair, allocates the next
	/// free virtual IP, persists the record and pushes it to the live
	/// interface. A push failure is surfaced; the stored record remains the
	/// source of truth and a later sync retries.
	#[instrument(skip(self, labels), fields(%network_id, %name))]
	pub async fn provision(
		&self,
		network_id: Uuid,
		name: &str,
		labels: HashMap<String, String>,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<ProvisionedPeer> {
		let network = self
			.network(network_id)
			.await?
			.ok_or(EngineError::NetworkNotFound)?;

		let (private_key, public_key) = self.keys.generate_keypair().await?;

		let allocated: HashSet<Ipv4Addr> = self
			.repo
			.list_peer_ips(&network_id.to_string())
			.await?
			.iter()
			.filter_map(|s| s.parse().ok())
			.collect();
		let virtual_ip = allocate(network.cidr, &allocated)?;

		let id = Uuid::new_v4();
		let labels_json = serde_json::to_string(&labels)
			.map_err(|e| EngineError::Internal(format!("labels encoding: {e}")))?;
		let expires = expires_at.map(|t| t.to_rfc3339());

		self.repo
			.insert_peer(
				&id.to_string(),
				&network_id.to_string(),
				name,
				&virtual_ip.to_string(),
				&public_key,
				&labels_json,
				PeerStatus::Pending.as_str(),
				expires.as_deref(),
				None,
			)
			.await?;

		match self.registry.get(&network).await {
			Some(manager) => {
				manager
					.add_peer(&public_key, &[format!("{virtual_ip}/32")])
					.await?;
			}
			None => {
				warn!(iface = %network.iface, "no tunnel manager available, peer not pushed live");
			}
		}

		let peer = Peer {
			id,
			network_id,
			name: name.to_string(),
			virtual_ip,
			public_key,
			labels,
			status: PeerStatus::Pending,
			expires_at,
			last_seen: None,
			transfer_rx: 0,
			transfer_tx: 0,
			public_ip: None,
			device: None,
			created_at: Utc::now(),
		};

		Ok(ProvisionedPeer { peer, private_key })
	}

	/// Fetches a peer with live enrichment. Unavailable live data degrades
	/// to the stored status instead of failing the read.
	#[instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: Uuid) -> Result<Option<Peer>> {
		let Some(row) = self.repo.get_peer(&id.to_string()).await? else {
			return Ok(None);
		};
		let mut peer = Peer::try_from(row)?;

		let (manager, live) = self.live_view(peer.network_id).await?;
		self.enrich(&mut peer, live.as_ref(), manager.as_deref(), Utc::now())
			.await;

		Ok(Some(peer))
	}

	/// Lists a network's peers with live enrichment.
	#[instrument(skip(self), fields(%network_id))]
	pub async fn list(&self, network_id: Uuid) -> Result<Vec<Peer>> {
		let rows = self.repo.list_peers(&network_id.to_string()).await?;
		let mut peers = rows
			.into_iter()
			.map(Peer::try_from)
			.collect::<Result<Vec<_>>>()?;

		let (manager, live) = self.live_view(network_id).await?;
		let now = Utc::now();
		for peer in &mut peers {
			self.enrich(peer, live.as_ref(), manager.as_deref(), now)
				.await;
		}

		Ok(peers)
	}

	/// Applies owner edits. Reactivating an expired peer re-adds it to the
	/// tunnel; expiring an active one removes it. Tunnel failures on these
	/// interactive transitions are surfaced to the caller.
	#[instrument(skip(self, request), fields(%id))]
	pub async fn update(&self, id: Uuid, request: UpdatePeerRequest) -> Result<Peer> {
		let row = self
			.repo
			.get_peer(&id.to_string())
			.await?
			.ok_or(EngineError::PeerNotFound)?;
		let mut peer = Peer::try_from(row)?;
		let previous = peer.status;
		let now = Utc::now();

		if let Some(name) = request.name {
			if !name.is_empty() {
				peer.name = name;
			}
		}

		if let Some(expires) = request.expires_at {
			peer.expires_at = expires;
		}

		let mut readd_live = false;
		let mut remove_live = false;
		match request.status {
			Some(new_status) => {
				if previous == PeerStatus::Expired && new_status != PeerStatus::Expired {
					readd_live = true;
				}
				if previous != PeerStatus::Expired && new_status == PeerStatus::Expired {
					remove_live = true;
				}
				peer.status = new_status;
			}
			None => {
				// Extending an expired peer's expiration reactivates it.
				let extended = matches!(request.expires_at, Some(Some(t)) if t > now);
				if previous == PeerStatus::Expired && extended {
					peer.status = PeerStatus::Pending;
					readd_live = true;
				}
			}
		}

		if let Some(device) = request.device {
			let current = peer.device.get_or_insert_with(DeviceInfo::default);
			if !device.os.is_empty() {
				current.os = device.os;
			}
			if !device.arch.is_empty() {
				current.arch = device.arch;
			}
			if !device.hostname.is_empty() {
				current.hostname = device.hostname;
			}
		}

		self.persist_peer(&peer).await?;

		if readd_live || remove_live {
			if let Some(network) = self.network(peer.network_id).await? {
				if let Some(manager) = self.registry.get(&network).await {
					if readd_live {
						debug!(peer = %peer.name, "reactivating peer on tunnel");
						manager
							.add_peer(&peer.public_key, &[format!("{}/32", peer.virtual_ip)])
							.await?;
					}
					if remove_live {
						debug!(peer = %peer.name, "expiring peer, removing from tunnel");
						manager.remove_peer(&peer.public_key).await?;
					}
				}
			}
		}

		let (manager, live) = self.live_view(peer.network_id).await?;
		self.enrich(&mut peer, live.as_ref(), manager.as_deref(), now)
			.await;

		Ok(peer)
	}

	/// Records a device check-in: merges reported metadata and labels.
	#[instrument(skip(self, device, labels), fields(%id))]
	pub async fn check_in(
		&self,
		id: Uuid,
		device: Option<DeviceInfo>,
		labels: HashMap<String, String>,
	) -> Result<Peer> {
		let row = self
			.repo
			.get_peer(&id.to_string())
			.await?
			.ok_or(EngineError::PeerNotFound)?;
		let mut peer = Peer::try_from(row)?;

		if let Some(device) = device {
			let current = peer.device.get_or_insert_with(DeviceInfo::default);
			if !device.os.is_empty() {
				current.os = device.os;
			}
			if !device.arch.is_empty() {
				current.arch = device.arch;
			}
			if !device.hostname.is_empty() {
				current.hostname = device.hostname;
			}
		}

		for (key, value) in labels {
			peer.labels.insert(key, value);
		}

		self.persist_peer(&peer).await?;

		Ok(peer)
	}

	/// Deletes a peer record, removing it from the live tunnel best-effort
	/// first.
	#[instrument(skip(self), fields(%id))]
	pub async fn delete(&self, id: Uuid) -> Result<()> {
		let row = self
			.repo
			.get_peer(&id.to_string())
			.await?
			.ok_or(EngineError::PeerNotFound)?;
		let peer = Peer::try_from(row)?;

		if let Some(network) = self.network(peer.network_id).await? {
			if let Some(manager) = self.registry.get(&network).await {
				if let Err(e) = manager.remove_peer(&peer.public_key).await {
					warn!(error = %e, peer = %peer.name, "live peer removal failed, deleting record anyway");
				}
			}
		}

		self.activity.forget(&peer.public_key).await;

		let affected = self.repo.delete_peer(&id.to_string()).await?;
		if affected == 0 {
			return Err(EngineError::PeerNotFound);
		}

		Ok(())
	}

	/// Status and transfer aggregates across all networks.
	#[instrument(skip(self))]
	pub async fn overview(&self) -> Result<Overview> {
		let networks = self.repo.list_networks().await?;
		let mut overview = Overview {
			total_networks: networks.len(),
			..Overview::default()
		};

		for row in networks {
			let network = Network::try_from(row)?;
			let peers = self.list(network.id).await?;

			let mut net_overview = NetworkOverview {
				network_id: network.id,
				name: network.name,
				cidr: network.cidr.to_string(),
				iface: network.iface,
				total_peers: peers.len(),
				online: 0,
				offline: 0,
				pending: 0,
				expired: 0,
				transfer_rx: 0,
				transfer_tx: 0,
			};

			for peer in &peers {
				match peer.status {
					PeerStatus::Online => net_overview.online += 1,
					PeerStatus::Offline => net_overview.offline += 1,
					PeerStatus::Pending => net_overview.pending += 1,
					PeerStatus::Expired => net_overview.expired += 1,
				}
				net_overview.transfer_rx += peer.transfer_rx;
				net_overview.transfer_tx += peer.transfer_tx;
			}

			overview.total_peers += net_overview.total_peers;
			overview.online += net_overview.online;
			overview.offline += net_overview.offline;
			overview.pending += net_overview.pending;
			overview.expired += net_overview.expired;
			overview.transfer_rx += net_overview.transfer_rx;
			overview.transfer_tx += net_overview.transfer_tx;
			overview.networks.push(net_overview);
		}

		Ok(overview)
	}

	/// Annotates a peer with its live status.
	///
	/// Expiration wins over any live signal and triggers removal from the
	/// tunnel. Otherwise the activity map and the snapshot's handshake
	/// decide, and whatever changed is written back as a single atomic
	/// store update; a write failure degrades to the in-memory view.
	pub(crate) async fn enrich(
		&self,
		peer: &mut Peer,
		live: Option<&HashMap<String, PeerSnapshot>>,
		manager: Option<&dyn TunnelControl>,
		now: DateTime<Utc>,
	) {
		let stored_status = peer.status;
		let stored_last_seen = peer.last_seen;
		let stored_rx = peer.transfer_rx;
		let stored_tx = peer.transfer_tx;

		if peer.is_expired(now) {
			peer.status = PeerStatus::Expired;

			let live_entry = live.is_some_and(|l| l.contains_key(&peer.public_key));
			if live_entry {
				if let Some(manager) = manager {
					debug!(peer = %peer.name, "enforcing expiration, removing live peer");
					if let Err(e) = manager.remove_peer(&peer.public_key).await {
						warn!(error = %e, peer = %peer.name, "failed to remove expired peer");
					}
				}
			}
		} else if let Some(live) = live {
			if let Some(snapshot) = live.get(&peer.public_key) {
				let activity_seen = self
					.activity
					.observe(&peer.public_key, snapshot.transfer_rx, now)
					.await;
				let verdict = classify(activity_seen, snapshot.latest_handshake, now, &self.config);

				peer.status = verdict.status;
				if verdict.last_seen.is_some() {
					peer.last_seen = verdict.last_seen;
				}
				peer.transfer_rx = snapshot.transfer_rx;
				peer.transfer_tx = snapshot.transfer_tx;
				peer.public_ip = remote_host(&snapshot.endpoint);
			}
			// Absent from the live table: no live data means no change.
		}

		fill_device_from_labels(peer);

		let changed = peer.status != stored_status
			|| peer.last_seen != stored_last_seen
			|| peer.transfer_rx != stored_rx
			|| peer.transfer_tx != stored_tx;
		if changed {
			let last_seen = peer.last_seen.map(|t| t.to_rfc3339());
			if let Err(e) = self
				.repo
				.update_peer_runtime(
					&peer.id.to_string(),
					peer.status.as_str(),
					last_seen.as_deref(),
					peer.transfer_rx,
					peer.transfer_tx,
				)
				.await
			{
				warn!(error = %e, peer = %peer.name, "failed to persist peer runtime state");
			}
		}
	}

	async fn network(&self, network_id: Uuid) -> Result<Option<Network>> {
		let row = self.repo.get_network(&network_id.to_string()).await?;
		row.map(Network::try_from).transpose()
	}

	/// Resolves the manager and a live snapshot for a network, degrading to
	/// `None` when either is unavailable.
	async fn live_view(
		&self,
		network_id: Uuid,
	) -> Result<(
		Option<Arc<dyn TunnelControl>>,
		Option<HashMap<String, PeerSnapshot>>,
	)> {
		let Some(network) = self.network(network_id).await? else {
			warn!(%network_id, "owning network missing, returning stored peer state");
			return Ok((None, None));
		};

		let Some(manager) = self.registry.get(&network).await else {
			return Ok((None, None));
		};

		let live = match manager.list_peers().await {
			Ok(live) => Some(live),
			Err(e) => {
				warn!(error = %e, iface = %network.iface, "live peer data unavailable, returning stored status");
				None
			}
		};

		Ok((Some(manager), live))
	}

	async fn persist_peer(&self, peer: &Peer) -> Result<()> {
		let labels_json = serde_json::to_string(&peer.labels)
			.map_err(|e| EngineError::Internal(format!("labels encoding: {e}")))?;
		let device_json = peer
			.device
			.as_ref()
			.map(serde_json::to_string)
			.transpose()
			.map_err(|e| EngineError::Internal(format!("device encoding: {e}")))?;
		let expires = peer.expires_at.map(|t| t.to_rfc3339());

		let affected = self
			.repo
			.update_peer(
				&peer.id.to_string(),
				&peer.name,
				&labels_json,
				peer.status.as_str(),
				expires.as_deref(),
				device_json.as_deref(),
			)
			.await?;
		if affected == 0 {
			return Err(EngineError::PeerNotFound);
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn peer_row(status: &str) -> PeerRowTuple {
		(
			"0c7eb9bb-0f22-44bb-9c1a-6a78a8ecdb1e".to_string(),
			"3e0b54a6-76a1-4a52-b167-3b3a524e4e97".to_string(),
			"laptop".to_string(),
			"10.10.0.4".to_string(),
			"pubkey=".to_string(),
			r#"{"os":"linux"}"#.to_string(),
			status.to_string(),
			None,
			Some("2025-06-01T12:00:00Z".to_string()),
			4096,
			1024,
			Some(r#"{"os":"linux","arch":"x86_64","hostname":"box"}"#.to_string()),
			"2025-06-01 11:00:00".to_string(),
		)
	}

	#[test]
	fn test_peer_row_conversion() {
		let peer = Peer::try_from(peer_row("online")).unwrap();
		assert_eq!(peer.status, PeerStatus::Online);
		assert_eq!(peer.virtual_ip, Ipv4Addr::new(10, 10, 0, 4));
		assert_eq!(peer.labels["os"], "linux");
		assert_eq!(peer.device.as_ref().unwrap().hostname, "box");
		assert_eq!(peer.transfer_rx, 4096);
	}

	#[test]
	fn test_peer_row_rejects_unknown_status() {
		assert!(Peer::try_from(peer_row("bogus")).is_err());
	}

	#[test]
	fn test_status_string_roundtrip() {
		for status in [
			PeerStatus::Pending,
			PeerStatus::Online,
			PeerStatus::Offline,
			PeerStatus::Expired,
		] {
			assert_eq!(status.as_str().parse::<PeerStatus>().unwrap(), status);
		}
	}

	#[test]
	fn test_remote_host_strips_port() {
		assert_eq!(
			remote_host("203.0.113.9:51821").as_deref(),
			Some("203.0.113.9")
		);
		assert_eq!(remote_host("(none)"), None);
		assert_eq!(remote_host(""), None);
	}

	#[test]
	fn test_fill_device_from_labels() {
		let mut peer = Peer::try_from(peer_row("offline")).unwrap();
		peer.device = None;
		peer.labels.insert("arch".to_string(), "arm64".to_string());
		peer.labels
			.insert("hostname".to_string(), "edge-1".to_string());

		fill_device_from_labels(&mut peer);

		let device = peer.device.unwrap();
		assert_eq!(device.os, "linux");
		assert_eq!(device.arch, "arm64");
		assert_eq!(device.hostname, "edge-1");
	}

	#[test]
	fn test_is_expired() {
		let mut peer = Peer::try_from(peer_row("online")).unwrap();
		let now = Utc::now();

		assert!(!peer.is_expired(now));
		peer.expires_at = Some(now - chrono::Duration::seconds(1));
		assert!(peer.is_expired(now));
		peer.expires_at = Some(now + chrono::Duration::hours(1));
		assert!(!peer.is_expired(now));
	}
}
