// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Protocol and port vocabulary shared by network policies and compiled
//! firewall rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
	Tcp,
	Udp,
	Icmp,
	Any,
}

impl Protocol {
	pub fn as_str(&self) -> &'static str {
		match self {
			Protocol::Tcp => "tcp",
			Protocol::Udp => "udp",
			Protocol::Icmp => "icmp",
			Protocol::Any => "any",
		}
	}

	/// Whether traffic of protocol `other` is covered by this selector.
	pub fn covers(&self, other: Protocol) -> bool {
		*self == Protocol::Any || *self == other
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Protocol {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"tcp" => Ok(Protocol::Tcp),
			"udp" => Ok(Protocol::Udp),
			"icmp" => Ok(Protocol::Icmp),
			"any" | "all" => Ok(Protocol::Any),
			other => Err(format!("unknown protocol: {other}")),
		}
	}
}

/// An inclusive port range. A single port is a range of length one;
/// rendered `5432` or `1000-2000` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
	pub start: u16,
	pub end: u16,
}

impl PortRange {
	pub fn single(port: u16) -> Self {
		Self {
			start: port,
			end: port,
		}
	}

	pub fn is_single(&self) -> bool {
		self.start == self.end
	}

	pub fn contains(&self, port: u16) -> bool {
		port >= self.start && port <= self.end
	}

	pub fn parse(s: &str) -> Result<Self, String> {
		let range = match s.split_once('-') {
			Some((lo, hi)) => {
				let start: u16 = lo
					.trim()
					.parse()
					.map_err(|_| format!("invalid port: {lo}"))?;
				let end: u16 = hi
					.trim()
					.parse()
					.map_err(|_| format!("invalid port: {hi}"))?;
				Self { start, end }
			}
			None => Self::single(s.trim().parse().map_err(|_| format!("invalid port: {s}"))?),
		};
		if range.start == 0 || range.start > range.end {
			return Err(format!("invalid port range: {s}"));
		}
		Ok(range)
	}
}

impl fmt::Display for PortRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_single() {
			write!(f, "{}", self.start)
		} else {
			write!(f, "{}-{}", self.start, self.end)
		}
	}
}

impl Serialize for PortRange {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for PortRange {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::parse(&s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_port_range_parse() {
		assert_eq!(PortRange::parse("5432").unwrap(), PortRange::single(5432));
		assert_eq!(
			PortRange::parse("1000-2000").unwrap(),
			PortRange {
				start: 1000,
				end: 2000
			}
		);
		assert!(PortRange::parse("0").is_err());
		assert!(PortRange::parse("2000-1000").is_err());
		assert!(PortRange::parse("http").is_err());
	}

	#[test]
	fn test_port_range_wire_format() {
		let single = serde_json::to_string(&PortRange::single(22)).unwrap();
		assert_eq!(single, "\"22\"");
		let range = serde_json::to_string(&PortRange {
			start: 1000,
			end: 2000,
		})
		.unwrap();
		assert_eq!(range, "\"1000-2000\"");
	}

	#[test]
	fn test_protocol_covers() {
		assert!(Protocol::Any.covers(Protocol::Tcp));
		assert!(Protocol::Tcp.covers(Protocol::Tcp));
		assert!(!Protocol::Tcp.covers(Protocol::Udp));
		assert!(!Protocol::Icmp.covers(Protocol::Any));
	}
}
