// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! WireGuard control surface for the meshgate control plane.
//!
//! This crate abstracts the external CLI-driven tunnel mechanism behind the
//! [`TunnelControl`] trait: a command-backed implementation drives
//! `wg`/`wg-quick` for one interface, and an in-memory fake (under
//! [`testing`]) lets the reconciliation and liveness engine be tested
//! without a tunnel subsystem present.

pub mod command;
pub mod control;
pub mod error;
pub mod keys;
pub mod testing;

pub use command::{CommandTunnel, DEFAULT_CONFIG_DIR};
pub use control::{parse_peer_dump, PeerSnapshot, TunnelControl};
pub use error::{Result, WgError};
pub use keys::{derive_public_key, generate_keypair, KeyProvider, WgKeyProvider};
