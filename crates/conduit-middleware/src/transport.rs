//! The outbound half of the server connection.
//!
//! Conduit never speaks a wire protocol itself. The registry issues calls
//! through a [`Transport`] and learns about their effects later, as
//! [`TransportEvent`]s arriving on the [`EventQueue`][crate::bus::EventQueue].
//!
//! # Overview
//!
//! - [`Transport`] – the trait every connection backend implements.
//! - [`LoopbackTransport`][crate::loopback::LoopbackTransport] – in-memory
//!   backend that records calls and can answer them itself.

use conduit_types::{ConduitError, ObjectKind, ParamKind, PropertyBag, ProxyHandle, TransportEvent};

/// Method call on a bound proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Ask the server to send every value of a parameter family.
    EnumParams(ParamKind),
    /// Round trip: the server answers with [`ProxyEvent::Done`][conduit_types::ProxyEvent::Done]
    /// once everything queued before it was delivered.
    Sync,
    /// Release the server-side proxy.
    Destroy,
}

/// Outbound calls the core makes on the server connection.
///
/// # Contract
///
/// * Calls never block; results arrive as events.
/// * `bind` and `export` return the handle all later events for that proxy
///   will carry.
/// * Errors are reported synchronously only when the call could not be sent
///   at all.
pub trait Transport {
    /// Create a proxy for an existing global.
    fn bind(&mut self, global_id: u32, kind: ObjectKind) -> Result<ProxyHandle, ConduitError>;

    /// Publish a locally implemented object. The server later reports its
    /// global id with a `Bound` event.
    fn export(&mut self, kind: ObjectKind, properties: &PropertyBag) -> Result<ProxyHandle, ConduitError>;

    fn call_method(&mut self, handle: ProxyHandle, request: Request) -> Result<(), ConduitError>;

    /// Next event produced synchronously in answer to a call, if any.
    ///
    /// Real connections deliver replies through the event queue and keep the
    /// default.
    fn poll_reply(&mut self) -> Option<TransportEvent> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn bind(&mut self, global_id: u32, kind: ObjectKind) -> Result<ProxyHandle, ConduitError> {
        (**self).bind(global_id, kind)
    }

    fn export(&mut self, kind: ObjectKind, properties: &PropertyBag) -> Result<ProxyHandle, ConduitError> {
        (**self).export(kind, properties)
    }

    fn call_method(&mut self, handle: ProxyHandle, request: Request) -> Result<(), ConduitError> {
        (**self).call_method(handle, request)
    }

    fn poll_reply(&mut self) -> Option<TransportEvent> {
        (**self).poll_reply()
    }
}
