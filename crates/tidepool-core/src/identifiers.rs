//! Connection identity and access class.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque unique identifier assigned to every pooled connection at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// `conn-` followed by the full id; the alternate form (`{:#}`) keeps only
/// the first eight hex digits.
impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        if f.alternate() {
            write!(f, "conn-{}", &simple[..8])
        } else {
            write!(f, "conn-{simple}")
        }
    }
}

/// Read/write class of a connection, fixed when the connection is opened.
///
/// A [`AccessMode::ReadWrite`] connection may serve read requests as a
/// fallback; the reverse never happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }

    pub fn is_write(self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }

    /// Whether a connection of class `self` can serve a request for `requested`.
    pub fn satisfies(self, requested: AccessMode) -> bool {
        match requested {
            AccessMode::ReadOnly => true,
            AccessMode::ReadWrite => self.is_write(),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::ReadWrite => write!(f, "write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_id_display_carries_full_id() {
        let id = ConnectionId::generate();
        let shown = id.to_string();
        assert_eq!(shown, format!("conn-{}", id.as_uuid().simple()));
    }

    #[test]
    fn connection_id_alternate_display_is_short() {
        let id = ConnectionId::generate();
        let short = format!("{id:#}");
        assert_eq!(short.len(), "conn-".len() + 8);
        assert!(id.to_string().starts_with(&short));
    }

    #[test]
    fn write_connections_satisfy_reads() {
        assert!(AccessMode::ReadWrite.satisfies(AccessMode::ReadOnly));
        assert!(AccessMode::ReadWrite.satisfies(AccessMode::ReadWrite));
        assert!(AccessMode::ReadOnly.satisfies(AccessMode::ReadOnly));
        assert!(!AccessMode::ReadOnly.satisfies(AccessMode::ReadWrite));
    }

    #[test]
    fn access_mode_serializes_snake_case() {
        let json = serde_json::to_string(&AccessMode::ReadOnly).unwrap();
        assert_eq!(json, "\"read_only\"");
    }
}
