// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("tunnel control error: {0}")]
	Control(#[from] meshgate_wgctrl::WgError),

	#[error("store error: {0}")]
	Store(#[from] meshgate_server_db::DbError),

	#[error("network not found")]
	NetworkNotFound,

	#[error("peer not found")]
	PeerNotFound,

	#[error("no free addresses in {0}")]
	AddressSpaceExhausted(String),

	#[error("CIDR {candidate} overlaps with existing network '{name}' ({cidr})")]
	OverlapConflict {
		candidate: String,
		name: String,
		cidr: String,
	},

	#[error("invalid CIDR: {0}")]
	InvalidCidr(String),

	#[error("no tunnel manager available for interface {0}")]
	ManagerUnavailable(String),

	#[error("internal error: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
