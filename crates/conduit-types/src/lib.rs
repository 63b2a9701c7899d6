//! `conduit-types` – shared vocabulary of the Conduit session manager.
//!
//! Every other crate in the workspace speaks in these types: the
//! [`PropertyBag`] carried by remote objects, the [`ObjectKind`] /
//! [`Category`] tags used for routing, the [`Features`] readiness bitset,
//! the inbound [`TransportEvent`] stream and the error enums.

mod error;
mod event;
mod features;
mod properties;

pub use error::{ActivationError, ConduitError};
pub use event::{ParamBlob, ProxyEvent, ProxyHandle, TransportEvent};
pub use features::{Features, ParamKind, Permissions};
pub use properties::PropertyBag;

use serde::{Deserialize, Serialize};

/// Kind of remote object exposed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    Client,
    Device,
    Node,
    Port,
    Link,
    Session,
    Endpoint,
    EndpointLink,
    Metadata,
}

impl ObjectKind {
    /// Stable lower-case name, used in logs and the attribute bag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Client => "client",
            ObjectKind::Device => "device",
            ObjectKind::Node => "node",
            ObjectKind::Port => "port",
            ObjectKind::Link => "link",
            ObjectKind::Session => "session",
            ObjectKind::Endpoint => "endpoint",
            ObjectKind::EndpointLink => "endpoint-link",
            ObjectKind::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category an interest selects on.
///
/// [`Category::Any`] is compatible with every object; [`Category::Properties`]
/// is used when an interest is evaluated against a bare property bag (policy
/// rules) rather than a registry object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Any,
    Properties,
    Object(ObjectKind),
}

impl Category {
    /// `true` when an interest declaring `self` may match an object tagged
    /// `other`.
    pub fn is_compatible(&self, other: Category) -> bool {
        matches!(self, Category::Any) || *self == other
    }
}

impl From<ObjectKind> for Category {
    fn from(kind: ObjectKind) -> Self {
        Category::Object(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_category_is_compatible_with_everything() {
        assert!(Category::Any.is_compatible(ObjectKind::Node.into()));
        assert!(Category::Any.is_compatible(Category::Properties));
    }

    #[test]
    fn object_category_requires_exact_kind() {
        let node: Category = ObjectKind::Node.into();
        assert!(node.is_compatible(ObjectKind::Node.into()));
        assert!(!node.is_compatible(ObjectKind::Device.into()));
        assert!(!node.is_compatible(Category::Properties));
    }

    #[test]
    fn object_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ObjectKind::EndpointLink).unwrap();
        assert_eq!(json, "\"endpoint-link\"");
        let back: ObjectKind = serde_json::from_str("\"metadata\"").unwrap();
        assert_eq!(back, ObjectKind::Metadata);
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(ObjectKind::Device.to_string(), "device");
    }
}
