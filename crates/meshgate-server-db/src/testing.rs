// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use sqlx::sqlite::SqlitePool;

use crate::schema::ensure_schema;

pub async fn create_test_pool() -> SqlitePool {
	SqlitePool::connect(":memory:").await.unwrap()
}

pub async fn create_control_plane_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	ensure_schema(&pool).await.unwrap();
	pool
}
