// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key material helpers built on the `wg` key primitives.
//!
//! The interface config file (`<dir>/<iface>.conf`) is the durable home of
//! the hub's private key; these helpers read and write it without owning
//! the rest of the file format.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{instrument, warn};

use crate::error::WgError;

/// Key generation primitive, abstracted for testability.
#[async_trait]
pub trait KeyProvider: Send + Sync {
	/// Produces a fresh private/public key pair.
	async fn generate_keypair(&self) -> Result<(String, String), WgError>;

	/// Derives the public key for an existing private key.
	async fn derive_public_key(&self, private_key: &str) -> Result<String, WgError>;
}

/// [`KeyProvider`] backed by the `wg` key primitives.
#[derive(Debug, Default, Clone, Copy)]
pub struct WgKeyProvider;

#[async_trait]
impl KeyProvider for WgKeyProvider {
	async fn generate_keypair(&self) -> Result<(String, String), WgError> {
		generate_keypair().await
	}

	async fn derive_public_key(&self, private_key: &str) -> Result<String, WgError> {
		derive_public_key(private_key).await
	}
}

/// Generates a fresh private/public key pair via `wg genkey` + `wg pubkey`.
#[instrument]
pub async fn generate_keypair() -> Result<(String, String), WgError> {
	let private = run_wg(&["genkey"], None).await?;
	let public = run_wg(&["pubkey"], Some(&private)).await?;
	Ok((private, public))
}

/// Derives the public key for an existing private key via `wg pubkey`.
#[instrument(skip(private_key))]
pub async fn derive_public_key(private_key: &str) -> Result<String, WgError> {
	run_wg(&["pubkey"], Some(private_key)).await
}

/// Path of the interface config file under `config_dir`.
pub fn config_path(config_dir: &Path, iface: &str) -> PathBuf {
	config_dir.join(format!("{iface}.conf"))
}

/// Extracts the `PrivateKey` value from interface config text.
pub fn parse_private_key(config: &str) -> Option<String> {
	for line in config.lines() {
		let trimmed = line.trim();
		if trimmed.starts_with("PrivateKey") {
			if let Some((_, value)) = trimmed.split_once('=') {
				let key = value.trim();
				if !key.is_empty() {
					return Some(key.to_string());
				}
			}
		}
	}
	None
}

/// Reads the private key from an interface config file.
///
/// Returns `Ok(None)` when the file does not exist; key-less config text is
/// a `KeyMaterial` error.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_private_key(path: impl AsRef<Path>) -> Result<Option<String>, WgError> {
	let content = match tokio::fs::read_to_string(path.as_ref()).await {
		Ok(content) => content,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(WgError::Io(e)),
	};

	match parse_private_key(&content) {
		Some(key) => Ok(Some(key)),
		None => Err(WgError::KeyMaterial(format!(
			"private key not found in {}",
			path.as_ref().display()
		))),
	}
}

/// Minimal interface config carrying only the private key.
pub fn minimal_config(private_key: &str) -> String {
	format!("[Interface]\nPrivateKey = {private_key}\n")
}

/// Writes a minimal interface config, creating `config_dir` if needed.
/// The file is restricted to the owner on unix.
#[instrument(skip(private_key), fields(path = %path.display()))]
pub async fn write_minimal_config(path: &Path, private_key: &str) -> Result<(), WgError> {
	if let Some(dir) = path.parent() {
		tokio::fs::create_dir_all(dir).await?;
	}

	tokio::fs::write(path, minimal_config(private_key)).await?;

	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		let perms = std::fs::Permissions::from_mode(0o600);
		tokio::fs::set_permissions(path, perms).await?;
	}

	Ok(())
}

/// Runs `wg` with the given args, optionally feeding `stdin_data` to stdin,
/// and returns the trimmed stdout on success.
pub(crate) async fn run_wg(args: &[&str], stdin_data: Option<&str>) -> Result<String, WgError> {
	let mut cmd = Command::new("wg");
	cmd.args(args)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped());

	let mut child = cmd.spawn().map_err(|e| {
		if e.kind() == std::io::ErrorKind::NotFound {
			warn!("wg not found in PATH");
			WgError::ToolMissing
		} else {
			WgError::Io(e)
		}
	})?;

	if let Some(data) = stdin_data {
		let mut stdin = child
			.stdin
			.take()
			.ok_or_else(|| WgError::KeyMaterial("failed to open wg stdin".to_string()))?;
		stdin.write_all(data.as_bytes()).await?;
		drop(stdin);
	}

	let output = child.wait_with_output().await?;

	if output.status.success() {
		Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
	} else {
		Err(WgError::CommandFailed {
			cmd: "wg",
			args: args.iter().map(|s| s.to_string()).collect(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_parse_private_key() {
		let config = "[Interface]\nPrivateKey = aBcD1234+/xyz=\nAddress = 10.10.0.1/24\n";
		assert_eq!(
			parse_private_key(config).as_deref(),
			Some("aBcD1234+/xyz=")
		);
	}

	#[test]
	fn test_parse_private_key_keeps_base64_padding() {
		// Key values end in '=' padding; only the first '=' separates.
		let config = "PrivateKey = QUJDREVGR0g=\n";
		assert_eq!(parse_private_key(config).as_deref(), Some("QUJDREVGR0g="));
	}

	#[test]
	fn test_parse_private_key_absent() {
		assert!(parse_private_key("[Interface]\nAddress = 10.0.0.1/24\n").is_none());
		assert!(parse_private_key("").is_none());
	}

	#[test]
	fn test_minimal_config_roundtrip() {
		let config = minimal_config("secret-key=");
		assert_eq!(parse_private_key(&config).as_deref(), Some("secret-key="));
	}

	#[tokio::test]
	async fn test_load_private_key_missing_file() {
		let dir = TempDir::new().unwrap();
		let key = load_private_key(config_path(dir.path(), "wg0")).await.unwrap();
		assert!(key.is_none());
	}

	#[tokio::test]
	async fn test_write_then_load_private_key() {
		let dir = TempDir::new().unwrap();
		let path = config_path(dir.path(), "wg3");

		write_minimal_config(&path, "persisted-key=").await.unwrap();

		let key = load_private_key(&path).await.unwrap();
		assert_eq!(key.as_deref(), Some("persisted-key="));
	}

	#[tokio::test]
	async fn test_load_private_key_keyless_config() {
		let dir = TempDir::new().unwrap();
		let path = config_path(dir.path(), "wg0");
		tokio::fs::write(&path, "[Interface]\nListenPort = 51820\n")
			.await
			.unwrap();

		let err = load_private_key(&path).await.unwrap_err();
		assert!(matches!(err, WgError::KeyMaterial(_)));
	}
}
