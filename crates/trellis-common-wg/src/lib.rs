// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard-facing types shared by the control plane and the node agent:
//! X25519 key material, the compiled per-node plan model, plan hashing,
//! and tunnel profile rendering.

pub mod keys;
pub mod keys_file;
pub mod plan;
pub mod profile;

pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use plan::{
	Directive, FirewallAction, FirewallRuleSpec, InterfaceSpec, NodePlan, PeerSpec, PlanHash,
	PortRange, Protocol,
};
pub use profile::render_profile;
