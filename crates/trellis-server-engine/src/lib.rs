// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The decision core of the control plane: pure functions over projected
//! state.
//!
//! Nothing in this crate performs I/O. The server loads a snapshot of the
//! projection, hands it to the compiler/synthesizer/trust engine, and
//! turns the results into events and responses. That keeps every decision
//! deterministic and testable: the same snapshot always produces the same
//! plan bytes and the same hash.

pub mod compiler;
pub mod error;
pub mod ipam;
pub mod snapshot;
pub mod synthesizer;
pub mod trust;

pub use compiler::{evaluate_access, match_resource, AccessDecision};
pub use error::EngineError;
pub use ipam::{IpamService, IpamStats};
pub use snapshot::CompileSnapshot;
pub use synthesizer::{synthesize_client_profile, synthesize_node_plan};
pub use trust::{HeartbeatMetrics, TrustAssessment, TrustEngine};
