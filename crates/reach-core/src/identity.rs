//! Node identity
//!
//! Every node carries an 8-character uppercase alphanumeric identifier,
//! generated at first run and persisted across restarts, plus a
//! human-readable display name. The identifier is opaque; equality is
//! exact byte match.

use std::fmt::Display;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Alphabet for generated node ids
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a generated node id
pub const NODE_ID_LEN: usize = 8;

/// The wildcard target that addresses every node
pub const WILDCARD: &str = "*";

/// An opaque node identifier
///
/// Generated ids are 8 uppercase alphanumeric characters. The special
/// value `*` addresses every node and is only valid as a packet target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing identifier without validation
    ///
    /// Remote ids are opaque; we never reject them on shape.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh 8-character identifier
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id: String = (0..NODE_ID_LEN)
            .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// The wildcard target id
    pub fn wildcard() -> Self {
        Self(WILDCARD.to_string())
    }

    /// Whether this id is the wildcard target
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    /// Validate a locally generated id (8 uppercase alphanumerics)
    pub fn parse_local(id: &str) -> Result<Self, IdentityError> {
        let valid = id.len() == NODE_ID_LEN
            && id.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(IdentityError::InvalidFormat(id.to_string()))
        }
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logging
    pub fn short_id(&self) -> &str {
        &self.0[..self.0.len().min(NODE_ID_LEN)]
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A node's persistent identity: id plus display name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// The stable node identifier
    pub id: NodeId,
    /// Human-readable display name
    pub name: String,
}

impl NodeIdentity {
    /// Generate a fresh identity with a default display name
    pub fn generate() -> Self {
        let id = NodeId::generate();
        let name = format!("MeshUser-{}", &id.as_str()[..4]);
        Self { id, name }
    }

    /// Build an identity from persisted parts
    pub fn from_parts(id: NodeId, name: String) -> Self {
        Self { id, name }
    }
}

/// Whether a display name is a generated placeholder
///
/// Generic names never override a concrete name during registry merges.
pub fn is_generic_name(name: &str) -> bool {
    name.starts_with("MeshUser-") || name.starts_with("Device-")
}
