// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use sqlx::sqlite::SqlitePool;

use crate::error::DbError;

/// Create the networks and peers tables if they do not exist yet.
///
/// Called once at startup before any repository operation.
#[tracing::instrument(skip(pool))]
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), DbError> {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS networks (
			id TEXT PRIMARY KEY,
			name TEXT NOT NULL,
			cidr TEXT NOT NULL,
			iface TEXT NOT NULL UNIQUE,
			listen_port INTEGER NOT NULL,
			private_key TEXT NOT NULL,
			public_key TEXT NOT NULL,
			endpoint TEXT NOT NULL,
			created_at TEXT NOT NULL,
			updated_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await?;

	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS peers (
			id TEXT PRIMARY KEY,
			network_id TEXT NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
			name TEXT NOT NULL,
			virtual_ip TEXT NOT NULL,
			public_key TEXT NOT NULL,
			labels TEXT NOT NULL DEFAULT '{}',
			status TEXT NOT NULL DEFAULT 'pending',
			expires_at TEXT,
			last_seen TEXT,
			transfer_rx INTEGER NOT NULL DEFAULT 0,
			transfer_tx INTEGER NOT NULL DEFAULT 0,
			device TEXT,
			created_at TEXT NOT NULL,
			UNIQUE (network_id, virtual_ip),
			UNIQUE (network_id, public_key)
		)
		"#,
	)
	.execute(pool)
	.await?;

	sqlx::query("CREATE INDEX IF NOT EXISTS idx_peers_network ON peers(network_id)")
		.execute(pool)
		.await?;

	tracing::debug!("database schema ensured");
	Ok(())
}
