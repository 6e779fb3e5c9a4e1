//! Canonical cluster endpoint addresses.
//!
//! Every node in a Caravel cluster is identified by a path-style endpoint
//! descriptor such as `/ip4/127.0.0.1/tcp/9000`. Addresses arrive in several
//! convenient shapes (a raw string, an id-carrying object, an endpoint
//! object, a host/port pair, or an already-normalized [`Address`]); all of
//! them reduce to one canonical string, and equality is defined on that
//! string alone.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::AddressError;

/// Protocol segments this cluster speaks.
const PROTOCOLS: [&str; 4] = ["ip4", "ip6", "dns4", "dns6"];

/// Canonical identity of a cluster endpoint.
///
/// Immutable once constructed. Two addresses are equal iff their canonical
/// ids are equal, regardless of the shape they were built from.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// The canonical endpoint string, `/<proto>/<host>/tcp/<port>`.
    id: String,
}

/// The accepted input shapes for an address.
///
/// Normalization is a tagged-variant dispatch over this enum: each shape is
/// reduced to the canonical path form or rejected with [`AddressError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressInput {
    /// A raw endpoint string, e.g. `"/ip4/127.0.0.1/tcp/9000"`.
    Raw(String),
    /// An object carrying the canonical id directly.
    Id {
        /// The endpoint string.
        id: String,
    },
    /// An object carrying the endpoint string under an `address` key.
    Endpoint {
        /// The endpoint string.
        address: String,
    },
    /// A host and port pair, e.g. `("127.0.0.1", 9000)`.
    HostPort {
        /// Host name or IP literal.
        address: String,
        /// TCP port.
        port: u16,
    },
    /// An already-normalized address.
    Parsed(Address),
}

impl From<&str> for AddressInput {
    fn from(value: &str) -> Self {
        Self::Raw(value.to_string())
    }
}

impl From<String> for AddressInput {
    fn from(value: String) -> Self {
        Self::Raw(value)
    }
}

impl From<Address> for AddressInput {
    fn from(value: Address) -> Self {
        Self::Parsed(value)
    }
}

impl From<&Address> for AddressInput {
    fn from(value: &Address) -> Self {
        Self::Parsed(value.clone())
    }
}

impl From<(&str, u16)> for AddressInput {
    fn from((address, port): (&str, u16)) -> Self {
        Self::HostPort {
            address: address.to_string(),
            port,
        }
    }
}

impl From<(String, u16)> for AddressInput {
    fn from((address, port): (String, u16)) -> Self {
        Self::HostPort { address, port }
    }
}

impl Address {
    /// Normalizes any accepted input shape into a canonical address.
    ///
    /// # Errors
    /// Returns [`AddressError`] when the input cannot be reduced to
    /// host+port form.
    pub fn normalize(input: impl Into<AddressInput>) -> Result<Self, AddressError> {
        match input.into() {
            AddressInput::Parsed(address) => Ok(address),
            AddressInput::Raw(s) | AddressInput::Id { id: s } | AddressInput::Endpoint { address: s } => {
                Self::parse(&s)
            }
            AddressInput::HostPort { address, port } => Ok(Self::from_host_port(&address, port)),
        }
    }

    /// Parses a path-style endpoint string.
    ///
    /// Trailing path segments after the port are tolerated (listener
    /// addresses may carry them) but dropped from the canonical id.
    ///
    /// # Errors
    /// Returns [`AddressError`] when the string is not of the form
    /// `/<proto>/<host>/tcp/<port>`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let rest = trimmed.strip_prefix('/').ok_or(AddressError::Malformed {
            input: s.to_string(),
            reason: "must start with '/'",
        })?;

        let mut segments = rest.split('/');

        let proto = segments.next().unwrap_or("");
        if proto.is_empty() {
            return Err(AddressError::Malformed {
                input: s.to_string(),
                reason: "missing protocol segment",
            });
        }
        if !PROTOCOLS.contains(&proto) {
            return Err(AddressError::UnsupportedProtocol {
                protocol: proto.to_string(),
            });
        }

        let host = segments.next().unwrap_or("");
        if host.is_empty() {
            return Err(AddressError::Malformed {
                input: s.to_string(),
                reason: "missing host segment",
            });
        }

        match segments.next() {
            Some("tcp") => {}
            Some(other) => {
                return Err(AddressError::UnsupportedProtocol {
                    protocol: other.to_string(),
                })
            }
            None => {
                return Err(AddressError::Malformed {
                    input: s.to_string(),
                    reason: "missing transport segment",
                })
            }
        }

        let port_segment = segments.next().unwrap_or("");
        let port: u16 = port_segment.parse().map_err(|_| AddressError::Malformed {
            input: s.to_string(),
            reason: "missing or invalid port",
        })?;

        Ok(Self {
            id: format!("/{proto}/{host}/tcp/{port}"),
        })
    }

    /// Builds a canonical address from a host and port.
    ///
    /// IP literals keep their family; anything else is treated as a
    /// resolvable name.
    #[must_use]
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let proto = if host.parse::<Ipv4Addr>().is_ok() {
            "ip4"
        } else if host.parse::<Ipv6Addr>().is_ok() {
            "ip6"
        } else {
            "dns4"
        };
        Self {
            id: format!("/{proto}/{host}/tcp/{port}"),
        }
    }

    /// Returns the canonical endpoint string.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the host segment of the canonical id.
    #[must_use]
    pub fn host(&self) -> &str {
        // Canonical form is always /<proto>/<host>/tcp/<port>.
        self.id.split('/').nth(2).unwrap_or("")
    }

    /// Returns the TCP port of the canonical id.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.id
            .split('/')
            .nth(4)
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    /// Returns true iff `other` normalizes to the same canonical id.
    ///
    /// Never fails: unparsable input compares false.
    #[must_use]
    pub fn matches(&self, other: impl Into<AddressInput>) -> bool {
        Self::normalize(other).is_ok_and(|normalized| normalized.id == self.id)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let address = Address::parse("/ip4/127.0.0.1/tcp/9000").unwrap();
        assert_eq!(address.id(), "/ip4/127.0.0.1/tcp/9000");
        assert_eq!(address.host(), "127.0.0.1");
        assert_eq!(address.port(), 9000);
    }

    #[test]
    fn test_parse_drops_trailing_segments() {
        let address = Address::parse("/ip4/127.0.0.1/tcp/8080/what/ever").unwrap();
        assert_eq!(address.id(), "/ip4/127.0.0.1/tcp/8080");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("   ").is_err());
        assert!(Address::parse("127.0.0.1:9000").is_err());
        assert!(Address::parse("/ip4/127.0.0.1").is_err());
        assert!(Address::parse("/ip4/127.0.0.1/tcp").is_err());
        assert!(Address::parse("/ip4/127.0.0.1/tcp/notaport").is_err());
        assert!(Address::parse("/ip4//tcp/9000").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_protocols() {
        assert_eq!(
            Address::parse("/udp/127.0.0.1/tcp/1"),
            Err(AddressError::UnsupportedProtocol {
                protocol: "udp".to_string()
            })
        );
        assert_eq!(
            Address::parse("/ip4/127.0.0.1/udp/1"),
            Err(AddressError::UnsupportedProtocol {
                protocol: "udp".to_string()
            })
        );
    }

    #[test]
    fn test_normalize_accepts_all_shapes() {
        let expected = Address::parse("/ip4/127.0.0.1/tcp/4").unwrap();

        let from_raw = Address::normalize("/ip4/127.0.0.1/tcp/4").unwrap();
        let from_id = Address::normalize(AddressInput::Id {
            id: "/ip4/127.0.0.1/tcp/4".to_string(),
        })
        .unwrap();
        let from_endpoint = Address::normalize(AddressInput::Endpoint {
            address: "/ip4/127.0.0.1/tcp/4".to_string(),
        })
        .unwrap();
        let from_pair = Address::normalize(("127.0.0.1", 4)).unwrap();
        let from_parsed = Address::normalize(expected.clone()).unwrap();

        assert_eq!(from_raw, expected);
        assert_eq!(from_id, expected);
        assert_eq!(from_endpoint, expected);
        assert_eq!(from_pair, expected);
        assert_eq!(from_parsed, expected);
    }

    #[test]
    fn test_host_port_detects_family() {
        assert_eq!(
            Address::from_host_port("10.0.0.1", 9).id(),
            "/ip4/10.0.0.1/tcp/9"
        );
        assert_eq!(Address::from_host_port("::1", 9).id(), "/ip6/::1/tcp/9");
        assert_eq!(
            Address::from_host_port("node-a.cluster", 9).id(),
            "/dns4/node-a.cluster/tcp/9"
        );
    }

    #[test]
    fn test_matches() {
        let address = Address::parse("/ip4/127.0.0.1/tcp/2").unwrap();

        assert!(address.matches("/ip4/127.0.0.1/tcp/2"));
        assert!(address.matches(("127.0.0.1", 2)));
        assert!(address.matches(&address.clone()));
        assert!(address.matches("/ip4/127.0.0.1/tcp/2/extra"));

        assert!(!address.matches("/ip4/127.0.0.1/tcp/3"));
        assert!(!address.matches(""));
        assert!(!address.matches("garbage"));
    }

    #[test]
    fn test_equality_is_by_canonical_id() {
        let a = Address::parse("/ip4/127.0.0.1/tcp/5").unwrap();
        let b = Address::normalize(("127.0.0.1", 5)).unwrap();
        assert_eq!(a, b);

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
