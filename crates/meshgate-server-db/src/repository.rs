// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Repository for control-plane database operations.
//!
//! Rows are returned as plain tuples; conversion into domain models happens
//! at the engine boundary. Every multi-field peer mutation is issued as a
//! single UPDATE so concurrent readers never observe partially-applied
//! runtime state.

use sqlx::sqlite::SqlitePool;

use crate::error::DbError;

pub type NetworkRowTuple = (
	String,
	String,
	String,
	String,
	i64,
	String,
	String,
	String,
	String,
	String,
);

pub type PeerRowTuple = (
	String,
	String,
	String,
	String,
	String,
	String,
	String,
	Option<String>,
	Option<String>,
	i64,
	i64,
	Option<String>,
	String,
);

/// Repository for network and peer records.
#[derive(Clone)]
pub struct Repository {
	pool: SqlitePool,
}

impl Repository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	// =========================================================================
	// Network Operations
	// =========================================================================

	#[tracing::instrument(skip(self, private_key, public_key), fields(%id, %iface))]
	pub async fn insert_network(
		&self,
		id: &str,
		name: &str,
		cidr: &str,
		iface: &str,
		listen_port: u16,
		private_key: &str,
		public_key: &str,
		endpoint: &str,
	) -> Result<(), DbError> {
		sqlx::query(
			"INSERT INTO networks (id, name, cidr, iface, listen_port, private_key, public_key, endpoint, created_at, updated_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'), datetime('now'))",
		)
		.bind(id)
		.bind(name)
		.bind(cidr)
		.bind(iface)
		.bind(listen_port as i64)
		.bind(private_key)
		.bind(public_key)
		.bind(endpoint)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_network(&self, id: &str) -> Result<Option<NetworkRowTuple>, DbError> {
		let row: Option<NetworkRowTuple> = sqlx::query_as(
			"SELECT id, name, cidr, iface, listen_port, private_key, public_key, endpoint, created_at, updated_at
			 FROM networks WHERE id = ?",
		)
		.bind(id)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}

	#[tracing::instrument(skip(self), fields(%iface))]
	pub async fn get_network_by_iface(
		&self,
		iface: &str,
	) -> Result<Option<NetworkRowTuple>, DbError> {
		let row: Option<NetworkRowTuple> = sqlx::query_as(
			"SELECT id, name, cidr, iface, listen_port, private_key, public_key, endpoint, created_at, updated_at
			 FROM networks WHERE iface = ?",
		)
		.bind(iface)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_networks(&self) -> Result<Vec<NetworkRowTuple>, DbError> {
		let rows: Vec<NetworkRowTuple> = sqlx::query_as(
			"SELECT id, name, cidr, iface, listen_port, private_key, public_key, endpoint, created_at, updated_at
			 FROM networks ORDER BY created_at",
		)
		.fetch_all(&self.pool)
		.await?;

		Ok(rows)
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn delete_network(&self, id: &str) -> Result<u64, DbError> {
		let result = sqlx::query("DELETE FROM networks WHERE id = ?")
			.bind(id)
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self), fields(%id, %cidr))]
	pub async fn update_network_cidr(&self, id: &str, cidr: &str) -> Result<u64, DbError> {
		let result =
			sqlx::query("UPDATE networks SET cidr = ?, updated_at = datetime('now') WHERE id = ?")
				.bind(cidr)
				.bind(id)
				.execute(&self.pool)
				.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self, private_key, public_key), fields(%id))]
	pub async fn update_network_keys(
		&self,
		id: &str,
		private_key: &str,
		public_key: &str,
	) -> Result<u64, DbError> {
		let result = sqlx::query(
			"UPDATE networks SET private_key = ?, public_key = ?, updated_at = datetime('now')
			 WHERE id = ?",
		)
		.bind(private_key)
		.bind(public_key)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	// =========================================================================
	// Peer Operations
	// =========================================================================

	#[tracing::instrument(skip(self, labels, device), fields(%id, %network_id, %virtual_ip))]
	#[allow(clippy::too_many_arguments)]
	pub async fn insert_peer(
		&self,
		id: &str,
		network_id: &str,
		name: &str,
		virtual_ip: &str,
		public_key: &str,
		labels: &str,
		status: &str,
		expires_at: Option<&str>,
		device: Option<&str>,
	) -> Result<(), DbError> {
		sqlx::query(
			"INSERT INTO peers (id, network_id, name, virtual_ip, public_key, labels, status, expires_at, device, created_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
		)
		.bind(id)
		.bind(network_id)
		.bind(name)
		.bind(virtual_ip)
		.bind(public_key)
		.bind(labels)
		.bind(status)
		.bind(expires_at)
		.bind(device)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_peer(&self, id: &str) -> Result<Option<PeerRowTuple>, DbError> {
		let row: Option<PeerRowTuple> = sqlx::query_as(
			"SELECT id, network_id, name, virtual_ip, public_key, labels, status, expires_at, last_seen, transfer_rx, transfer_tx, device, created_at
			 FROM peers WHERE id = ?",
		)
		.bind(id)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row)
	}

	#[tracing::instrument(skip(self), fields(%network_id))]
	pub async fn list_peers(&self, network_id: &str) -> Result<Vec<PeerRowTuple>, DbError> {
		let rows: Vec<PeerRowTuple> = sqlx::query_as(
			"SELECT id, network_id, name, virtual_ip, public_key, labels, status, expires_at, last_seen, transfer_rx, transfer_tx, device, created_at
			 FROM peers WHERE network_id = ? ORDER BY created_at",
		)
		.bind(network_id)
		.fetch_all(&self.pool)
		.await?;

		Ok(rows)
	}

	/// Virtual IPs currently assigned within a network, for the allocator.
	#[tracing::instrument(skip(self), fields(%network_id))]
	pub async fn list_peer_ips(&self, network_id: &str) -> Result<Vec<String>, DbError> {
		let rows: Vec<(String,)> =
			sqlx::query_as("SELECT virtual_ip FROM peers WHERE network_id = ?")
				.bind(network_id)
				.fetch_all(&self.pool)
				.await?;

		Ok(rows.into_iter().map(|(ip,)| ip).collect())
	}

	/// Owner-editable fields. Runtime fields go through `update_peer_runtime`.
	#[tracing::instrument(skip(self, labels, device), fields(%id))]
	pub async fn update_peer(
		&self,
		id: &str,
		name: &str,
		labels: &str,
		status: &str,
		expires_at: Option<&str>,
		device: Option<&str>,
	) -> Result<u64, DbError> {
		let result = sqlx::query(
			"UPDATE peers SET name = ?, labels = ?, status = ?, expires_at = ?, device = ?
			 WHERE id = ?",
		)
		.bind(name)
		.bind(labels)
		.bind(status)
		.bind(expires_at)
		.bind(device)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	/// Status, counters and last-seen in one statement.
	#[tracing::instrument(skip(self), fields(%id, %status))]
	pub async fn update_peer_runtime(
		&self,
		id: &str,
		status: &str,
		last_seen: Option<&str>,
		transfer_rx: i64,
		transfer_tx: i64,
	) -> Result<u64, DbError> {
		let result = sqlx::query(
			"UPDATE peers SET status = ?, last_seen = ?, transfer_rx = ?, transfer_tx = ?
			 WHERE id = ?",
		)
		.bind(status)
		.bind(last_seen)
		.bind(transfer_rx)
		.bind(transfer_tx)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn delete_peer(&self, id: &str) -> Result<u64, DbError> {
		let result = sqlx::query("DELETE FROM peers WHERE id = ?")
			.bind(id)
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::create_control_plane_test_pool;

	async fn seed_network(repo: &Repository, id: &str, iface: &str, port: u16) {
		repo.insert_network(
			id,
			"test net",
			"10.10.0.0/24",
			iface,
			port,
			"priv",
			"pub",
			"vpn.example.com:51820",
		)
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn test_network_roundtrip() {
		let pool = create_control_plane_test_pool().await;
		let repo = Repository::new(pool);

		seed_network(&repo, "net-1", "wg0", 51820).await;

		let row = repo.get_network("net-1").await.unwrap().unwrap();
		assert_eq!(row.0, "net-1");
		assert_eq!(row.3, "wg0");
		assert_eq!(row.4, 51820);

		let by_iface = repo.get_network_by_iface("wg0").await.unwrap().unwrap();
		assert_eq!(by_iface.0, "net-1");

		assert_eq!(repo.list_networks().await.unwrap().len(), 1);
		assert_eq!(repo.delete_network("net-1").await.unwrap(), 1);
		assert!(repo.get_network("net-1").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_update_network_keys() {
		let pool = create_control_plane_test_pool().await;
		let repo = Repository::new(pool);

		seed_network(&repo, "net-1", "wg0", 51820).await;

		let affected = repo
			.update_network_keys("net-1", "new-priv", "new-pub")
			.await
			.unwrap();
		assert_eq!(affected, 1);

		let row = repo.get_network("net-1").await.unwrap().unwrap();
		assert_eq!(row.5, "new-priv");
		assert_eq!(row.6, "new-pub");
	}

	#[tokio::test]
	async fn test_peer_runtime_update_is_single_statement() {
		let pool = create_control_plane_test_pool().await;
		let repo = Repository::new(pool);

		seed_network(&repo, "net-1", "wg0", 51820).await;
		repo.insert_peer(
			"peer-1",
			"net-1",
			"laptop",
			"10.10.0.4",
			"pubkey-1",
			"{}",
			"pending",
			None,
			None,
		)
		.await
		.unwrap();

		let affected = repo
			.update_peer_runtime("peer-1", "online", Some("2025-06-01T12:00:00Z"), 4096, 1024)
			.await
			.unwrap();
		assert_eq!(affected, 1);

		let row = repo.get_peer("peer-1").await.unwrap().unwrap();
		assert_eq!(row.6, "online");
		assert_eq!(row.8.as_deref(), Some("2025-06-01T12:00:00Z"));
		assert_eq!(row.9, 4096);
		assert_eq!(row.10, 1024);
	}

	#[tokio::test]
	async fn test_list_peer_ips() {
		let pool = create_control_plane_test_pool().await;
		let repo = Repository::new(pool);

		seed_network(&repo, "net-1", "wg0", 51820).await;
		for (i, ip) in ["10.10.0.4", "10.10.0.5"].iter().enumerate() {
			repo.insert_peer(
				&format!("peer-{i}"),
				"net-1",
				"client",
				ip,
				&format!("key-{i}"),
				"{}",
				"pending",
				None,
				None,
			)
			.await
			.unwrap();
		}

		let mut ips = repo.list_peer_ips("net-1").await.unwrap();
		ips.sort();
		assert_eq!(ips, vec!["10.10.0.4", "10.10.0.5"]);
	}

	#[tokio::test]
	async fn test_duplicate_virtual_ip_rejected() {
		let pool = create_control_plane_test_pool().await;
		let repo = Repository::new(pool);

		seed_network(&repo, "net-1", "wg0", 51820).await;
		repo.insert_peer(
			"peer-1",
			"net-1",
			"a",
			"10.10.0.4",
			"key-a",
			"{}",
			"pending",
			None,
			None,
		)
		.await
		.unwrap();

		let dup = repo
			.insert_peer(
				"peer-2",
				"net-1",
				"b",
				"10.10.0.4",
				"key-b",
				"{}",
				"pending",
				None,
				None,
			)
			.await;
		assert!(dup.is_err());
	}
}
