//! Identifier types.
//!
//! - `EnclaveId`, `ServiceId`, `ExtensionId`: user-chosen, validated
//!   against [`validate_identifier`]
//! - `PartitionId`: user-chosen; the empty string names the default partition
//! - `ServiceGuid`: system-generated and immutable for a service's lifetime

use crate::constants::validate_identifier;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Defines a validated string newtype with serde, `Display`, and `FromStr`.
macro_rules! validated_id {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates the identifier, validating its format.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidInput`] if the identifier is malformed.
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                validate_identifier(&id)
                    .map_err(|e| Error::InvalidInput(format!("{}: {e}", $what)))?;
                Ok(Self(id))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
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

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

validated_id!(
    /// Identifier of an enclave, unique per host.
    EnclaveId,
    "enclave ID"
);

validated_id!(
    /// User-chosen service identifier, unique within an enclave.
    ServiceId,
    "service ID"
);

validated_id!(
    /// Identifier of a loaded extension, unique within an enclave.
    ExtensionId,
    "extension ID"
);

// =============================================================================
// Service GUID
// =============================================================================

/// System-generated service identifier.
///
/// Formed as `{service-id}-{uuid-v7}` so that container names stay readable
/// while remaining unique across re-additions of the same service ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceGuid(String);

impl ServiceGuid {
    /// Generates a fresh GUID for a service.
    #[must_use]
    pub fn generate(id: &ServiceId) -> Self {
        Self(format!("{id}-{}", uuid::Uuid::now_v7().simple()))
    }

    /// Parses a GUID read back from runtime labels or persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the GUID contains characters that
    /// cannot appear in an object name.
    pub fn parse(guid: impl Into<String>) -> Result<Self> {
        let guid = guid.into();
        if guid.is_empty()
            || guid.len() > 128
            || !guid
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidInput(format!("malformed service GUID '{guid}'")));
        }
        Ok(Self(guid))
    }

    /// Returns the GUID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceGuid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<ServiceGuid> for String {
    fn from(guid: ServiceGuid) -> Self {
        guid.0
    }
}

impl fmt::Display for ServiceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Partition ID
// =============================================================================

/// Name of a partition. The empty string is the default partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionId(String);

impl PartitionId {
    /// Creates a partition ID. The empty string is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a non-empty malformed name.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if !id.is_empty() {
            validate_identifier(&id)
                .map_err(|e| Error::InvalidInput(format!("partition ID: {e}")))?;
        }
        Ok(Self(id))
    }

    /// The default partition, holding every service not explicitly assigned.
    #[must_use]
    pub fn default_partition() -> Self {
        Self(String::new())
    }

    /// Whether this is the default partition.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the partition ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PartitionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PartitionId> for String {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<default>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_guid_embeds_id_and_is_unique() {
        let id = ServiceId::new("web").unwrap();
        let a = ServiceGuid::generate(&id);
        let b = ServiceGuid::generate(&id);
        assert!(a.as_str().starts_with("web-"));
        assert_ne!(a, b);
        assert_eq!(ServiceGuid::parse(a.to_string()).unwrap(), a);
    }

    #[test]
    fn test_partition_id_allows_default() {
        let p = PartitionId::new("").unwrap();
        assert!(p.is_default());
        assert_eq!(p, PartitionId::default_partition());
        assert!(PartitionId::new("Bad Name").is_err());
    }

    #[test]
    fn test_ids_validate_on_deserialize() {
        let ok: ServiceId = serde_json::from_str("\"db\"").unwrap();
        assert_eq!(ok.as_str(), "db");
        assert!(serde_json::from_str::<ServiceId>("\"no spaces\"").is_err());
    }
}
