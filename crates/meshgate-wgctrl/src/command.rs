// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::control::{parse_peer_dump, PeerSnapshot, TunnelControl};
use crate::error::WgError;
use crate::keys;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/wireguard";

/// Tunnel control implementation using the `wg` / `wg-quick` CLI tools.
pub struct CommandTunnel {
	iface: String,
	config_dir: PathBuf,
}

impl CommandTunnel {
	pub fn new(iface: impl Into<String>) -> Self {
		Self {
			iface: iface.into(),
			config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
		}
	}

	/// Overrides the interface config directory. Tests point this at a
	/// temporary directory so nothing touches the real system.
	pub fn with_config_dir(iface: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
		Self {
			iface: iface.into(),
			config_dir: config_dir.into(),
		}
	}

	pub fn config_path(&self) -> PathBuf {
		keys::config_path(&self.config_dir, &self.iface)
	}
}

#[async_trait]
impl TunnelControl for CommandTunnel {
	fn iface(&self) -> &str {
		&self.iface
	}

	async fn up(&self) -> Result<(), WgError> {
		match run_tool("wg-quick", &["up", &self.iface]).await {
			Ok(_) => {
				debug!(iface = %self.iface, "interface up");
				Ok(())
			}
			Err(WgError::CommandFailed { stderr, .. }) if stderr.contains("already exists") => {
				trace!(iface = %self.iface, "interface already up");
				Ok(())
			}
			Err(e) => Err(e),
		}
	}

	async fn down(&self) -> Result<(), WgError> {
		// An interface that is already down is success for the caller.
		if let Err(e) = run_tool("wg-quick", &["down", &self.iface]).await {
			trace!(iface = %self.iface, error = %e, "wg-quick down ignored");
		}
		Ok(())
	}

	async fn add_peer(&self, public_key: &str, allowed_ips: &[String]) -> Result<(), WgError> {
		let allowed = allowed_ips.join(",");
		run_tool(
			"wg",
			&["set", &self.iface, "peer", public_key, "allowed-ips", &allowed],
		)
		.await?;

		debug!(iface = %self.iface, %allowed, "peer added");
		Ok(())
	}

	async fn remove_peer(&self, public_key: &str) -> Result<(), WgError> {
		match run_tool("wg", &["set", &self.iface, "peer", public_key, "remove"]).await {
			Ok(_) => {
				debug!(iface = %self.iface, "peer removed");
				Ok(())
			}
			Err(WgError::CommandFailed { stderr, .. }) if stderr.contains("No such peer") => {
				trace!(iface = %self.iface, "peer already absent");
				Ok(())
			}
			Err(e) => Err(e),
		}
	}

	async fn list_peers(&self) -> Result<HashMap<String, PeerSnapshot>, WgError> {
		match run_tool("wg", &["show", &self.iface, "dump"]).await {
			Ok(output) => Ok(parse_peer_dump(&output)),
			Err(WgError::CommandFailed { stderr, .. })
				if stderr.contains("No such device") || stderr.contains("Unable to access") =>
			{
				Err(WgError::InterfaceMissing(self.iface.clone()))
			}
			Err(e) => Err(e),
		}
	}

	async fn public_key(&self) -> Result<String, WgError> {
		let path = self.config_path();

		if let Some(private_key) = keys::load_private_key(&path).await? {
			return keys::derive_public_key(&private_key).await;
		}

		// No config yet: generate key material and persist it before deriving,
		// so repeated calls observe the same identity.
		warn!(iface = %self.iface, "no interface config found, generating keys");
		let (private_key, public_key) = keys::generate_keypair().await?;
		keys::write_minimal_config(&path, &private_key).await?;

		Ok(public_key)
	}
}

/// Runs an external tool and returns trimmed stdout on success.
async fn run_tool(tool: &'static str, args: &[&str]) -> Result<String, WgError> {
	trace!(cmd = %format!("{tool} {}", args.join(" ")), "running tunnel command");

	let output = Command::new(tool).args(args).output().await.map_err(|e| {
		if e.kind() == std::io::ErrorKind::NotFound {
			warn!("{tool} not found in PATH");
			WgError::ToolMissing
		} else {
			WgError::Io(e)
		}
	})?;

	if output.status.success() {
		Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
	} else {
		Err(WgError::CommandFailed {
			cmd: tool,
			args: args.iter().map(|s| s.to_string()).collect(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_config_path_uses_iface_name() {
		let tunnel = CommandTunnel::with_config_dir("wg7", "/tmp/wgtest");
		assert_eq!(tunnel.config_path(), PathBuf::from("/tmp/wgtest/wg7.conf"));
	}

	#[test]
	fn test_iface_accessor() {
		let tunnel = CommandTunnel::new("wg0");
		assert_eq!(tunnel.iface(), "wg0");
	}
}
