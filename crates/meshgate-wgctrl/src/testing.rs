// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`TunnelControl`] implementation for tests.
//!
//! Keeps a fake peer table and a call log so reconciliation and liveness
//! logic can be exercised without a real tunnel subsystem present.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::control::{PeerSnapshot, TunnelControl};
use crate::error::WgError;
use crate::keys::KeyProvider;

/// Deterministic [`KeyProvider`] for tests; no external tools involved.
#[derive(Debug, Default)]
pub struct FakeKeyProvider {
	counter: AtomicU64,
}

impl FakeKeyProvider {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl KeyProvider for FakeKeyProvider {
	async fn generate_keypair(&self) -> Result<(String, String), WgError> {
		let n = self.counter.fetch_add(1, Ordering::SeqCst);
		let private = format!("fake-private-{n}=");
		let public = self.derive_public_key(&private).await?;
		Ok((private, public))
	}

	async fn derive_public_key(&self, private_key: &str) -> Result<String, WgError> {
		Ok(format!("pub-of-{private_key}"))
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeCall {
	Up,
	Down,
	AddPeer {
		public_key: String,
		allowed_ips: Vec<String>,
	},
	RemovePeer {
		public_key: String,
	},
	ListPeers,
	PublicKey,
}

pub struct FakeTunnel {
	iface: String,
	public_key: String,
	peers: Mutex<HashMap<String, PeerSnapshot>>,
	calls: Mutex<Vec<FakeCall>>,
	fail_add_peer: AtomicBool,
	fail_list_peers: AtomicBool,
}

impl FakeTunnel {
	pub fn new(iface: impl Into<String>) -> Self {
		Self {
			iface: iface.into(),
			public_key: "fake-hub-public-key=".to_string(),
			peers: Mutex::new(HashMap::new()),
			calls: Mutex::new(Vec::new()),
			fail_add_peer: AtomicBool::new(false),
			fail_list_peers: AtomicBool::new(false),
		}
	}

	pub fn with_public_key(iface: impl Into<String>, public_key: impl Into<String>) -> Self {
		let mut tunnel = Self::new(iface);
		tunnel.public_key = public_key.into();
		tunnel
	}

	/// Seeds the live peer table directly, bypassing the call log.
	pub fn insert_snapshot(&self, snapshot: PeerSnapshot) {
		self.peers
			.lock()
			.unwrap()
			.insert(snapshot.public_key.clone(), snapshot);
	}

	pub fn set_fail_add_peer(&self, fail: bool) {
		self.fail_add_peer.store(fail, Ordering::SeqCst);
	}

	pub fn set_fail_list_peers(&self, fail: bool) {
		self.fail_list_peers.store(fail, Ordering::SeqCst);
	}

	pub fn calls(&self) -> Vec<FakeCall> {
		self.calls.lock().unwrap().clone()
	}

	pub fn add_peer_calls(&self) -> Vec<FakeCall> {
		self.calls()
			.into_iter()
			.filter(|c| matches!(c, FakeCall::AddPeer { .. }))
			.collect()
	}

	pub fn contains_peer(&self, public_key: &str) -> bool {
		self.peers.lock().unwrap().contains_key(public_key)
	}

	fn record(&self, call: FakeCall) {
		self.calls.lock().unwrap().push(call);
	}
}

#[async_trait]
impl TunnelControl for FakeTunnel {
	fn iface(&self) -> &str {
		&self.iface
	}

	async fn up(&self) -> Result<(), WgError> {
		self.record(FakeCall::Up);
		Ok(())
	}

	async fn down(&self) -> Result<(), WgError> {
		self.record(FakeCall::Down);
		Ok(())
	}

	async fn add_peer(&self, public_key: &str, allowed_ips: &[String]) -> Result<(), WgError> {
		self.record(FakeCall::AddPeer {
			public_key: public_key.to_string(),
			allowed_ips: allowed_ips.to_vec(),
		});

		if self.fail_add_peer.load(Ordering::SeqCst) {
			return Err(WgError::CommandFailed {
				cmd: "wg",
				args: vec!["set".to_string()],
				stderr: "injected failure".to_string(),
			});
		}

		self.peers.lock().unwrap().insert(
			public_key.to_string(),
			PeerSnapshot {
				public_key: public_key.to_string(),
				endpoint: "(none)".to_string(),
				allowed_ips: allowed_ips.join(","),
				..PeerSnapshot::default()
			},
		);
		Ok(())
	}

	async fn remove_peer(&self, public_key: &str) -> Result<(), WgError> {
		self.record(FakeCall::RemovePeer {
			public_key: public_key.to_string(),
		});
		self.peers.lock().unwrap().remove(public_key);
		Ok(())
	}

	async fn list_peers(&self) -> Result<HashMap<String, PeerSnapshot>, WgError> {
		self.record(FakeCall::ListPeers);

		if self.fail_list_peers.load(Ordering::SeqCst) {
			return Err(WgError::InterfaceMissing(self.iface.clone()));
		}

		Ok(self.peers.lock().unwrap().clone())
	}

	async fn public_key(&self) -> Result<String, WgError> {
		self.record(FakeCall::PublicKey);
		Ok(self.public_key.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_fake_tunnel_peer_table() {
		let tunnel = FakeTunnel::new("wg0");

		tunnel
			.add_peer("key-a", &["10.0.0.2/32".to_string()])
			.await
			.unwrap();
		assert!(tunnel.contains_peer("key-a"));

		let peers = tunnel.list_peers().await.unwrap();
		assert_eq!(peers["key-a"].allowed_ips, "10.0.0.2/32");

		tunnel.remove_peer("key-a").await.unwrap();
		assert!(!tunnel.contains_peer("key-a"));
	}

	#[tokio::test]
	async fn test_fake_tunnel_injected_add_failure() {
		let tunnel = FakeTunnel::new("wg0");
		tunnel.set_fail_add_peer(true);

		let err = tunnel
			.add_peer("key-a", &["10.0.0.2/32".to_string()])
			.await
			.unwrap_err();
		assert!(matches!(err, WgError::CommandFailed { .. }));
		assert!(!tunnel.contains_peer("key-a"));
		assert_eq!(tunnel.add_peer_calls().len(), 1);
	}
}
