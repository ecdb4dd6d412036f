// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Access-plane policy subjects and resources as tagged variants.
//!
//! Cross-aggregate references are by id only; resolution (does this user
//! belong to that group?) happens in the projection at read time.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::net::{PortRange, Protocol};
use crate::types::{GroupId, NodeRole, UserId};

/// Who a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Subject {
	User { id: UserId },
	Group { id: GroupId },
}

impl fmt::Display for Subject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Subject::User { id } => write!(f, "user/{id}"),
			Subject::Group { id } => write!(f, "group/{id}"),
		}
	}
}

/// What a policy grants or denies access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
	/// Hostname pattern. `*.X` matches one extra label under `X`; `**.X`
	/// matches any depth; anything else matches exactly.
	Domain { pattern: String },
	OverlayIp { cidr: Ipv4Net },
	Port { proto: Protocol, range: PortRange },
	Role { name: NodeRole },
}

impl fmt::Display for Resource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Resource::Domain { pattern } => write!(f, "domain/{pattern}"),
			Resource::OverlayIp { cidr } => write!(f, "overlay_ip/{cidr}"),
			Resource::Port { proto, range } => write!(f, "port/{proto}:{range}"),
			Resource::Role { name } => write!(f, "role/{name}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_subject_wire_format() {
		let id = UserId::new();
		let json = serde_json::to_string(&Subject::User { id }).unwrap();
		assert_eq!(json, format!(r#"{{"type":"user","id":"{}"}}"#, id));
		let back: Subject = serde_json::from_str(&json).unwrap();
		assert_eq!(back, Subject::User { id });
	}

	#[test]
	fn test_resource_wire_format() {
		let resource = Resource::Domain {
			pattern: "*.internal.example.com".to_string(),
		};
		let json = serde_json::to_string(&resource).unwrap();
		assert_eq!(
			json,
			r#"{"type":"domain","pattern":"*.internal.example.com"}"#
		);

		let port = Resource::Port {
			proto: Protocol::Tcp,
			range: PortRange::single(5432),
		};
		let json = serde_json::to_string(&port).unwrap();
		let back: Resource = serde_json::from_str(&json).unwrap();
		assert_eq!(back, port);
	}
}
