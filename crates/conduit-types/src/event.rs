use serde::{Deserialize, Serialize};

use crate::{ObjectKind, ParamKind, Permissions, PropertyBag};

/// Transport-assigned identifier of a local proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyHandle(pub u32);

impl std::fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proxy#{}", self.0)
    }
}

/// Encoded parameter value. The core never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamBlob(pub Vec<u8>);

/// Events the server sends about an already bound proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProxyEvent {
    /// A locally exported object was registered under `global_id`.
    Bound { global_id: u32 },
    /// Native info (properties) of the object changed.
    Info { properties: PropertyBag },
    /// Result of a parameter enumeration.
    Params {
        param: ParamKind,
        #[serde(default)]
        values: Vec<ParamBlob>,
    },
    /// One metadata entry was set (`value: None` deletes it).
    MetadataEntry {
        subject: u32,
        key: String,
        #[serde(default, rename = "value-type")]
        value_type: Option<String>,
        value: Option<String>,
    },
    /// Round-trip marker answering a `Sync` request.
    Done,
    /// The server reported an error on this proxy.
    Error { message: String },
    /// The server destroyed the proxy.
    Removed,
}

/// Inbound event delivered by the transport, one at a time, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportEvent {
    GlobalAppeared {
        id: u32,
        kind: ObjectKind,
        #[serde(default = "default_permissions")]
        permissions: Permissions,
        #[serde(default)]
        properties: PropertyBag,
    },
    GlobalUpdated {
        id: u32,
        #[serde(default)]
        permissions: Option<Permissions>,
        properties: PropertyBag,
    },
    GlobalRemoved {
        id: u32,
    },
    Proxy {
        handle: ProxyHandle,
        event: ProxyEvent,
    },
}

fn default_permissions() -> Permissions {
    Permissions::all()
}
