// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;

/// Engine tuning knobs.
///
/// The two liveness windows encode an assumption about the tunnel's
/// keepalive interval (clients sending keepalives roughly every 25s), so
/// they are configurable per deployment rather than baked in.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Fast-path window: a peer whose received-byte counter advanced within
	/// this window is online.
	pub activity_window: Duration,
	/// Fallback window: a peer whose latest handshake is within this window
	/// is online even without observed byte growth.
	pub handshake_window: Duration,
	/// Lowest listen port handed out by the address-space assigner.
	pub base_port: u16,
	/// Host part of the hub endpoint advertised to peers.
	pub endpoint_host: String,
	/// Directory holding interface config files.
	pub wg_config_dir: PathBuf,
	/// Delay before the startup reconciliation pass, giving the storage
	/// layer time to come up.
	pub startup_settle: StdDuration,
}

pub const DEFAULT_ACTIVITY_WINDOW_SECS: i64 = 45;
pub const DEFAULT_HANDSHAKE_WINDOW_SECS: i64 = 150;
pub const DEFAULT_BASE_PORT: u16 = 51820;
pub const DEFAULT_STARTUP_SETTLE_SECS: u64 = 2;

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			activity_window: Duration::seconds(DEFAULT_ACTIVITY_WINDOW_SECS),
			handshake_window: Duration::seconds(DEFAULT_HANDSHAKE_WINDOW_SECS),
			base_port: DEFAULT_BASE_PORT,
			endpoint_host: "127.0.0.1".to_string(),
			wg_config_dir: PathBuf::from(meshgate_wgctrl::DEFAULT_CONFIG_DIR),
			startup_settle: StdDuration::from_secs(DEFAULT_STARTUP_SETTLE_SECS),
		}
	}
}

impl EngineConfig {
	pub fn from_env() -> Self {
		let activity_window = env_i64(
			"MESHGATE_ACTIVITY_WINDOW_SECS",
			DEFAULT_ACTIVITY_WINDOW_SECS,
		);
		let handshake_window = env_i64(
			"MESHGATE_HANDSHAKE_WINDOW_SECS",
			DEFAULT_HANDSHAKE_WINDOW_SECS,
		);

		let base_port = std::env::var("MESHGATE_BASE_PORT")
			.ok()
			.and_then(|v| v.parse().ok())
			.unwrap_or(DEFAULT_BASE_PORT);

		let endpoint_host =
			std::env::var("MESHGATE_ENDPOINT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

		let wg_config_dir = std::env::var("MESHGATE_WG_CONFIG_DIR")
			.map(PathBuf::from)
			.unwrap_or_else(|_| PathBuf::from(meshgate_wgctrl::DEFAULT_CONFIG_DIR));

		let startup_settle = StdDuration::from_secs(
			std::env::var("MESHGATE_STARTUP_SETTLE_SECS")
				.ok()
				.and_then(|v| v.parse().ok())
				.unwrap_or(DEFAULT_STARTUP_SETTLE_SECS),
		);

		Self {
			activity_window: Duration::seconds(activity_window),
			handshake_window: Duration::seconds(handshake_window),
			base_port,
			endpoint_host,
			wg_config_dir,
			startup_settle,
		}
	}
}

fn env_i64(key: &str, default: i64) -> i64 {
	std::env::var(key)
		.ok()
		.and_then(|v| v.parse().ok())
		.unwrap_or(default)
}
