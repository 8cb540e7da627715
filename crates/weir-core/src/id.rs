//! Strongly-typed identifiers for Weir entities.
//!
//! Topology names ([`BoundaryId`], [`ArcId`]) are restricted to a storage-safe
//! alphabet so they can be embedded verbatim in object keys. [`LotKey`] and
//! [`EventId`] come from user data and are percent-encoded before they touch a
//! key (see [`crate::storage_keys`]).
//!
//! # Example
//!
//! ```rust
//! use weir_core::id::{BoundaryId, LotKey};
//!
//! let boundary = BoundaryId::new("raw").unwrap();
//! let lot = LotKey::new("2024-01-01").unwrap();
//! assert_eq!(format!("{boundary}/{lot}"), "raw/2024-01-01");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum length of a topology name.
pub const MAX_NAME_LEN: usize = 128;

/// Maximum length of a lot key.
pub const MAX_LOT_KEY_LEN: usize = 1024;

/// Maximum length of an event id.
pub const MAX_EVENT_ID_LEN: usize = 512;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $validate:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a validated ", $kind, ".")]
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidId`] if the value is empty, too long, or
            /// contains characters that are not allowed.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                $validate(&value).map_err(|reason| Error::InvalidId {
                    message: format!("{} {value:?}: {reason}", $kind),
                })?;
                Ok(Self(value))
            }

            #[doc = concat!("Returns the ", $kind, " as a string slice.")]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Name of a boundary: a storage location pattern acting as a dataflow checkpoint.
    BoundaryId,
    "boundary id",
    validate_name
);

string_id!(
    /// Name of an arc: a processing step consuming from boundaries.
    ArcId,
    "arc id",
    validate_name
);

string_id!(
    /// Identity of a lot within a boundary, derived from object paths.
    ///
    /// Lot keys may contain `/` (multi-placeholder patterns join their values
    /// with it) but never empty segments.
    LotKey,
    "lot key",
    validate_lot_key
);

string_id!(
    /// Unique id of a raw storage notification, used for raw-event dedup.
    EventId,
    "event id",
    validate_event_id
);

fn validate_name(value: &str) -> std::result::Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.len() > MAX_NAME_LEN {
        return Err("too long");
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err("only ASCII letters, digits, '-', '_' and '.' are allowed");
    }
    if value == "." || value == ".." {
        return Err("reserved name");
    }
    Ok(())
}

fn validate_lot_key(value: &str) -> std::result::Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.len() > MAX_LOT_KEY_LEN {
        return Err("too long");
    }
    if value.chars().any(char::is_control) {
        return Err("control characters are not allowed");
    }
    if value.split('/').any(str::is_empty) {
        return Err("empty path segment");
    }
    Ok(())
}

fn validate_event_id(value: &str) -> std::result::Result<(), &'static str> {
    if value.trim().is_empty() {
        return Err("must not be blank");
    }
    if value.len() > MAX_EVENT_ID_LEN {
        return Err("too long");
    }
    if value.chars().any(char::is_control) {
        return Err("control characters are not allowed");
    }
    Ok(())
}

/// Opaque token proving ownership of an (arc, lot) lease.
///
/// Tokens are ULIDs, so they are unique without coordination and sort by
/// issue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Ulid);

impl LeaseToken {
    /// Generates a fresh lease token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LeaseToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid lease token '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_names_accept_storage_safe_alphabet() {
        assert!(BoundaryId::new("raw.events_v2-eu").is_ok());
        assert!(BoundaryId::new("").is_err());
        assert!(BoundaryId::new("raw/events").is_err());
        assert!(BoundaryId::new("..").is_err());
        assert!(ArcId::new("a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn lot_keys_reject_empty_segments() {
        assert!(LotKey::new("2024/01/01").is_ok());
        assert!(LotKey::new("2024//01").is_err());
        assert!(LotKey::new("/2024").is_err());
        assert!(LotKey::new("2024/").is_err());
        assert!(LotKey::new("a\nb").is_err());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let lot = LotKey::new("2024-01-01").unwrap();
        let json = serde_json::to_string(&lot).unwrap();
        assert_eq!(json, "\"2024-01-01\"");
        let parsed: LotKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, lot);
        assert!(serde_json::from_str::<BoundaryId>("\"bad id\"").is_err());
    }

    #[test]
    fn lease_token_roundtrip() {
        let token = LeaseToken::generate();
        let parsed: LeaseToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
        assert!("not-a-ulid".parse::<LeaseToken>().is_err());
    }
}
