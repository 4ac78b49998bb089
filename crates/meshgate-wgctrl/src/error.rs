// Copyright (c) 2025 Meshgate Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WgError {
	#[error("wireguard tools not found in PATH")]
	ToolMissing,

	#[error("{cmd} {} failed: {stderr}", args.join(" "))]
	CommandFailed {
		cmd: &'static str,
		args: Vec<String>,
		stderr: String,
	},

	#[error("interface {0} does not exist")]
	InterfaceMissing(String),

	#[error("key material error: {0}")]
	KeyMaterial(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WgError>;
