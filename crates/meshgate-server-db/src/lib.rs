// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Desired-state store for the meshgate control plane.
//!
//! Wraps a SQLite pool behind a cloneable [`Repository`]. The engine treats
//! this crate as an external transactional collaborator: rows cross the
//! boundary as tuples and become domain models on the other side.

pub mod error;
pub mod pool;
pub mod repository;
pub mod schema;
pub mod testing;

pub use error::{DbError, Result};
pub use pool::create_pool;
pub use repository::{NetworkRowTuple, PeerRowTuple, Repository};
pub use schema::ensure_schema;
