// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Peer liveness classification from noisy, sparse tunnel telemetry.
//!
//! Two signals feed the classifier: received-byte growth (fast path, peers
//! with keepalives produce traffic continuously) and the latest handshake
//! timestamp (slow path). Byte growth is tracked in a process-local
//! activity map that is lost on restart, after which detection degrades to
//! handshake-only until traffic is observed again.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::RwLock;

use crate::config::EngineConfig;
use crate::peers::PeerStatus;

/// Last observed receive progress for one public key.
#[derive(Debug, Clone)]
pub struct PeerActivity {
	pub last_rx_bytes: i64,
	pub last_seen: Option<DateTime<Utc>>,
}

/// Process-local activity cache, keyed by tunnel public key.
///
/// Guarded by its own lock, independent of the manager registry, so
/// unrelated networks' liveness updates never serialize behind registry
/// contention.
#[derive(Default)]
pub struct ActivityMap {
	inner: RwLock<HashMap<String, PeerActivity>>,
}

impl ActivityMap {
	pub fn new() -> Self {
		Self::default()
	}

	/// Feeds one receive-counter observation and returns the current
	/// activity timestamp for the key.
	///
	/// The counter is monotonic: growth advances the activity timestamp to
	/// `now`; a counter below the cached value is an interface reset and
	/// becomes a fresh baseline without claiming activity. The first
	/// sighting of a key also only baselines it, so a restarted process
	/// falls back to handshake-only detection.
	pub async fn observe(
		&self,
		public_key: &str,
		rx_bytes: i64,
		now: DateTime<Utc>,
	) -> Option<DateTime<Utc>> {
		let mut inner = self.inner.write().await;

		match inner.get_mut(public_key) {
			Some(activity) => {
				if rx_bytes > activity.last_rx_bytes {
					activity.last_rx_bytes = rx_bytes;
					activity.last_seen = Some(now);
				} else if rx_bytes < activity.last_rx_bytes {
					activity.last_rx_bytes = rx_bytes;
				}
				activity.last_seen
			}
			None => {
				inner.insert(
					public_key.to_string(),
					PeerActivity {
						last_rx_bytes: rx_bytes,
						last_seen: None,
					},
				);
				None
			}
		}
	}

	/// Drops the record for a key (peer deleted).
	pub async fn forget(&self, public_key: &str) {
		self.inner.write().await.remove(public_key);
	}
}

/// Outcome of a liveness evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
	pub status: PeerStatus,
	pub last_seen: Option<DateTime<Utc>>,
}

/// Classifies a peer from its activity timestamp and latest handshake.
///
/// Fast path: activity within `activity_window` of `now`. Fallback:
/// handshake within `handshake_window`. The best available timestamp is
/// always reported, even when the verdict is offline, so staleness stays
/// inspectable; when both signals qualify the more recent one wins.
pub fn classify(
	activity_seen: Option<DateTime<Utc>>,
	latest_handshake: i64,
	now: DateTime<Utc>,
	config: &EngineConfig,
) -> Classification {
	let handshake_time = (latest_handshake > 0)
		.then(|| Utc.timestamp_opt(latest_handshake, 0).single())
		.flatten();

	let online_by_activity =
		activity_seen.is_some_and(|seen| now.signed_duration_since(seen) < config.activity_window);
	let online_by_handshake = handshake_time
		.is_some_and(|hs| now.signed_duration_since(hs) < config.handshake_window);

	let status = if online_by_activity || online_by_handshake {
		PeerStatus::Online
	} else {
		PeerStatus::Offline
	};

	let last_seen = match (activity_seen, handshake_time) {
		(Some(a), Some(h)) => Some(a.max(h)),
		(Some(a), None) => Some(a),
		(None, Some(h)) => Some(h),
		(None, None) => None,
	};

	Classification { status, last_seen }
}
