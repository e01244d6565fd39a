//! Object naming and labeling.
//!
//! Every network, container, and volume the engine creates gets a
//! deterministic name built from the enclave ID, the object kind, and a
//! GUID, joined with [`NAME_SEPARATOR`]:
//!
//! ```text
//! enclavenet--e1                                 network
//! enclavenet--e1--service--web-0190f5...         user service container
//! enclavenet--e1--sidecar--web-0190f5...         networking sidecar
//! enclavenet--e1--expander--web-0190f5...--0191  expander container
//! enclavenet--e1--artifact-volume--web-0190...   expansion volume
//! ```
//!
//! Identifiers are validated to exclude the separator, so a name always
//! splits back into the same components. Labels carry the same components
//! for reconciliation.

use crate::constants::{
    APP_ID, LABEL_APP_ID, LABEL_ENCLAVE_ID, LABEL_GUID, LABEL_ID, LABEL_OBJECT_KIND,
    LABEL_OWNER_GUID, LABEL_PRIVATE_IP, NAME_PREFIX, NAME_SEPARATOR,
};
use crate::ids::EnclaveId;
use crate::runtime::Labels;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Kind of an engine-owned runtime object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// The enclave network.
    Network,
    /// The optional control-plane container.
    Control,
    /// A user service container.
    Service,
    /// An extension (module) container.
    Extension,
    /// A networking sidecar.
    Sidecar,
    /// A throwaway files-artifact expander.
    Expander,
    /// A volume holding an expanded files artifact.
    ArtifactVolume,
}

impl ObjectKind {
    /// Label and name form of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Control => "control",
            Self::Service => "service",
            Self::Extension => "extension",
            Self::Sidecar => "sidecar",
            Self::Expander => "expander",
            Self::ArtifactVolume => "artifact-volume",
        }
    }

    /// Parses the label form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "network" => Some(Self::Network),
            "control" => Some(Self::Control),
            "service" => Some(Self::Service),
            "extension" => Some(Self::Extension),
            "sidecar" => Some(Self::Sidecar),
            "expander" => Some(Self::Expander),
            "artifact-volume" => Some(Self::ArtifactVolume),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds names and labels for one enclave's objects.
#[derive(Debug, Clone)]
pub struct ObjectNamer {
    enclave: EnclaveId,
}

impl ObjectNamer {
    /// Creates a namer scoped to `enclave`.
    #[must_use]
    pub fn new(enclave: EnclaveId) -> Self {
        Self { enclave }
    }

    /// The enclave this namer is scoped to.
    #[must_use]
    pub fn enclave(&self) -> &EnclaveId {
        &self.enclave
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut name = format!("{NAME_PREFIX}{NAME_SEPARATOR}{}", self.enclave);
        for part in parts {
            name.push_str(NAME_SEPARATOR);
            name.push_str(part);
        }
        name
    }

    /// Name of the enclave network.
    #[must_use]
    pub fn network_name(&self) -> String {
        self.join(&[])
    }

    /// Name of a container or volume of `kind` identified by `guid`.
    #[must_use]
    pub fn object_name(&self, kind: ObjectKind, guid: &str) -> String {
        self.join(&[kind.as_str(), guid])
    }

    /// Name of a helper object owned by `owner`, made unique by a fresh
    /// UUID so repeated helpers never collide.
    #[must_use]
    pub fn helper_name(&self, kind: ObjectKind, owner: &str) -> String {
        let suffix = uuid::Uuid::now_v7().simple().to_string();
        self.join(&[kind.as_str(), owner, &suffix])
    }

    /// Labels selecting every object of this enclave.
    #[must_use]
    pub fn enclave_labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert(LABEL_APP_ID.to_string(), APP_ID.to_string());
        labels.insert(LABEL_ENCLAVE_ID.to_string(), self.enclave.to_string());
        labels
    }

    /// Labels selecting every object of `kind` in this enclave.
    #[must_use]
    pub fn kind_labels(&self, kind: ObjectKind) -> Labels {
        let mut labels = self.enclave_labels();
        labels.insert(LABEL_OBJECT_KIND.to_string(), kind.as_str().to_string());
        labels
    }

    /// Full label set for one object.
    #[must_use]
    pub fn object_labels(&self, kind: ObjectKind, attrs: &ObjectAttributes) -> Labels {
        let mut labels = self.kind_labels(kind);
        if let Some(guid) = &attrs.guid {
            labels.insert(LABEL_GUID.to_string(), guid.clone());
        }
        if let Some(id) = &attrs.id {
            labels.insert(LABEL_ID.to_string(), id.clone());
        }
        if let Some(ip) = attrs.private_ip {
            labels.insert(LABEL_PRIVATE_IP.to_string(), ip.to_string());
        }
        if let Some(owner) = &attrs.owner_guid {
            labels.insert(LABEL_OWNER_GUID.to_string(), owner.clone());
        }
        labels
    }
}

/// Optional per-object label values.
#[derive(Debug, Clone, Default)]
pub struct ObjectAttributes {
    /// System GUID.
    pub guid: Option<String>,
    /// User-facing ID.
    pub id: Option<String>,
    /// Private IP on the enclave network.
    pub private_ip: Option<Ipv4Addr>,
    /// GUID of the service owning a helper object.
    pub owner_guid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namer() -> ObjectNamer {
        ObjectNamer::new(EnclaveId::new("e1").unwrap())
    }

    #[test]
    fn test_names_are_deterministic() {
        let n = namer();
        assert_eq!(n.network_name(), "enclavenet--e1");
        assert_eq!(
            n.object_name(ObjectKind::Service, "web-1"),
            "enclavenet--e1--service--web-1"
        );
        assert_eq!(
            n.object_name(ObjectKind::Service, "web-1"),
            n.object_name(ObjectKind::Service, "web-1")
        );
    }

    #[test]
    fn test_helper_names_are_unique() {
        let n = namer();
        let a = n.helper_name(ObjectKind::Expander, "web-1");
        let b = n.helper_name(ObjectKind::Expander, "web-1");
        assert_ne!(a, b);
        assert!(a.starts_with("enclavenet--e1--expander--web-1--"));
    }

    #[test]
    fn test_object_labels() {
        let n = namer();
        let labels = n.object_labels(
            ObjectKind::Sidecar,
            &ObjectAttributes {
                guid: Some("g".to_string()),
                owner_guid: Some("o".to_string()),
                ..ObjectAttributes::default()
            },
        );
        assert_eq!(labels[LABEL_APP_ID], APP_ID);
        assert_eq!(labels[LABEL_ENCLAVE_ID], "e1");
        assert_eq!(labels[LABEL_OBJECT_KIND], "sidecar");
        assert_eq!(labels[LABEL_OWNER_GUID], "o");
        assert!(!labels.contains_key(LABEL_PRIVATE_IP));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [ObjectKind::Service, ObjectKind::ArtifactVolume, ObjectKind::Control] {
            assert_eq!(ObjectKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ObjectKind::parse("bogus"), None);
    }
}
